//! Planner types: tiers, roles, host classification, URL normalization.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Source-host ranking. Lower rank drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Tier 1: the brand's own site
    Manufacturer,
    /// Tier 2: lab reviews
    LabReview,
    /// Tier 3: spec databases and retail
    Database,
    /// Tier 4: candidate/unclassified hosts discovered at runtime
    Candidate,
}

impl Tier {
    /// Numeric rank, 1-based.
    pub fn rank(self) -> u8 {
        match self {
            Self::Manufacturer => 1,
            Self::LabReview => 2,
            Self::Database => 3,
            Self::Candidate => 4,
        }
    }
}

/// Why a URL entered the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRole {
    /// Provided with the job
    Seed,
    /// Produced by a retrieval query
    Retrieval,
    /// Discovered from a sitemap or robots.txt
    Sitemap,
    /// Discovered from page content at runtime
    Discovered,
}

/// One queued source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedSource {
    /// Normalized URL
    pub url: String,
    /// Lowercased host, `www.` stripped
    pub host: String,
    /// Registrable root domain (last two labels)
    pub root_domain: String,
    pub tier: Tier,
    pub role: SourceRole,
    /// Source-intel score; higher drains earlier within a tier
    pub planner_score: f64,
    /// Field-reward memory score; tie-break after `planner_score`
    pub field_reward: f64,
    /// Stable insertion order, final tie-break
    pub insertion_index: u64,
    /// Runtime-discovered arbitrary host; always sorts last within its tier
    pub candidate_source: bool,
}

/// A URL reduced to its comparable form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedUrl {
    /// Canonical URL: lowercased host, no `www.`, no fragment, no trailing `/`
    pub url: String,
    pub host: String,
    pub root_domain: String,
    /// Path component including leading `/`
    pub path: String,
}

/// Normalize a URL for dedup and host classification. Returns `None` for
/// unparseable input.
pub fn normalize_url(raw: &str) -> Option<NormalizedUrl> {
    let trimmed = raw.trim();
    let (scheme, rest) = trimmed.split_once("://")?;
    let scheme = scheme.to_ascii_lowercase();
    if scheme != "http" && scheme != "https" && scheme != "helper_files" {
        return None;
    }

    let rest = rest.split('#').next().unwrap_or(rest);
    let (host_port, path_query) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    let host = host_port
        .split('@')
        .last()
        .unwrap_or(host_port)
        .split(':')
        .next()
        .unwrap_or(host_port)
        .to_ascii_lowercase();
    if host.is_empty() {
        return None;
    }
    let host = host.strip_prefix("www.").map(str::to_string).unwrap_or(host);

    let mut path_query = path_query.to_string();
    // Collapse a trailing slash, but keep the root path.
    if path_query.ends_with('/') && path_query.len() > 1 && !path_query.contains('?') {
        path_query.pop();
    }

    let path = path_query
        .split('?')
        .next()
        .unwrap_or(&path_query)
        .to_string();

    Some(NormalizedUrl {
        url: format!("{scheme}://{host}{path_query}"),
        root_domain: root_domain_of(&host),
        host,
        path,
    })
}

/// Registrable root domain, approximated as the last two labels.
pub fn root_domain_of(host: &str) -> String {
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        host.to_string()
    } else {
        labels[labels.len() - 2..].join(".")
    }
}

/// Parent path of a URL path: everything up to the final segment.
pub fn parent_path(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Category table classifying hosts into tiers, with blocked hosts and
/// per-brand manufacturer domains.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceHostTable {
    /// host -> tier
    #[serde(default)]
    pub tiers: HashMap<String, Tier>,
    /// Hosts never fetched
    #[serde(default)]
    pub blocked: HashSet<String>,
    /// brand (lowercased) -> root domains owned by the brand
    #[serde(default)]
    pub manufacturer_domains: HashMap<String, HashSet<String>>,
}

impl SourceHostTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host under a tier.
    pub fn with_host(mut self, host: &str, tier: Tier) -> Self {
        self.tiers.insert(host.to_ascii_lowercase(), tier);
        self
    }

    /// Block a host.
    pub fn with_blocked(mut self, host: &str) -> Self {
        self.blocked.insert(host.to_ascii_lowercase());
        self
    }

    /// Register a manufacturer root domain for a brand.
    pub fn with_manufacturer(mut self, brand: &str, root_domain: &str) -> Self {
        self.manufacturer_domains
            .entry(brand.to_ascii_lowercase())
            .or_default()
            .insert(root_domain.to_ascii_lowercase());
        self
    }

    /// Tier for a host; unregistered hosts are candidates.
    pub fn classify(&self, host: &str) -> Tier {
        self.tiers.get(host).copied().unwrap_or(Tier::Candidate)
    }

    /// Whether a host is blocked by the category table.
    pub fn is_blocked(&self, host: &str) -> bool {
        self.blocked.contains(host)
    }

    /// Whether a root domain belongs to the brand.
    pub fn is_brand_manufacturer(&self, brand: &str, root_domain: &str) -> bool {
        self.manufacturer_domains
            .get(&brand.to_ascii_lowercase())
            .map_or(false, |set| set.contains(root_domain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_url_basics() {
        let n = normalize_url("HTTPS://WWW.Razer.com/gaming-mice/Viper/#specs").unwrap();
        assert_eq!(n.url, "https://razer.com/gaming-mice/Viper");
        assert_eq!(n.host, "razer.com");
        assert_eq!(n.root_domain, "razer.com");
        assert_eq!(n.path, "/gaming-mice/Viper");
    }

    #[test]
    fn test_normalize_url_dedup_equivalence() {
        let a = normalize_url("https://www.a.com/p/").unwrap();
        let b = normalize_url("https://a.com/p#frag").unwrap();
        assert_eq!(a.url, b.url);
    }

    #[test]
    fn test_normalize_url_bare_host() {
        let n = normalize_url("https://a.com").unwrap();
        assert_eq!(n.url, "https://a.com/");
        assert_eq!(n.path, "/");
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(normalize_url("not a url").is_none());
        assert!(normalize_url("ftp://a.com/x").is_none());
    }

    #[test]
    fn test_root_domain() {
        assert_eq!(root_domain_of("shop.eu.logitech.com"), "logitech.com");
        assert_eq!(root_domain_of("a.com"), "a.com");
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("/mice/viper-v3"), "/mice");
        assert_eq!(parent_path("/viper"), "/");
        assert_eq!(parent_path("/"), "/");
    }

    #[test]
    fn test_host_table_classification() {
        let table = SourceHostTable::new()
            .with_host("razer.com", Tier::Manufacturer)
            .with_host("rtings.com", Tier::LabReview)
            .with_blocked("spam.example");
        assert_eq!(table.classify("razer.com"), Tier::Manufacturer);
        assert_eq!(table.classify("rtings.com"), Tier::LabReview);
        assert_eq!(table.classify("random.example"), Tier::Candidate);
        assert!(table.is_blocked("spam.example"));
    }
}
