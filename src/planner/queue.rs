//! The per-product source queue.

use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::config::PlannerConfig;

use super::types::{normalize_url, PlannedSource, SourceHostTable, SourceRole, Tier};

/// Options for one enqueue call.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Explicit tier; `None` classifies by host
    pub tier: Option<Tier>,
    /// Why the URL is being queued
    pub role: Option<SourceRole>,
    /// Runtime-discovered arbitrary host
    pub candidate_source: bool,
    /// Source-intel score
    pub planner_score: f64,
}

/// Outcome of one enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Added,
    Duplicate,
    Unparseable,
    BlockedHost,
    /// Manufacturer-tier URL whose root domain is not in the brand's set
    ManufacturerMismatch,
    /// Candidate sources are disabled by configuration
    CandidateSourcesDisabled,
}

/// Tier-ordered URL queue with dedup, per-host caps, and manufacturer
/// reservation. Owned by exactly one product run.
pub struct SourcePlanner {
    config: PlannerConfig,
    hosts: SourceHostTable,
    brand: String,
    model_tokens: Vec<String>,
    queues: [Vec<PlannedSource>; 4],
    seen: HashSet<String>,
    blocked: HashSet<String>,
    emitted_total: usize,
    manufacturer_emitted: usize,
    emitted_per_host: HashMap<String, usize>,
    host_rewards: HashMap<String, f64>,
    path_rewards: HashMap<String, f64>,
    host_penalties: HashMap<String, f64>,
    insertion_counter: u64,
}

impl SourcePlanner {
    /// Build a planner for one product.
    pub fn new(
        config: PlannerConfig,
        hosts: SourceHostTable,
        brand: &str,
        model_tokens: Vec<String>,
    ) -> Self {
        Self {
            config,
            hosts,
            brand: brand.to_ascii_lowercase(),
            model_tokens,
            queues: [Vec::new(), Vec::new(), Vec::new(), Vec::new()],
            seen: HashSet::new(),
            blocked: HashSet::new(),
            emitted_total: 0,
            manufacturer_emitted: 0,
            emitted_per_host: HashMap::new(),
            host_rewards: HashMap::new(),
            path_rewards: HashMap::new(),
            host_penalties: HashMap::new(),
            insertion_counter: 0,
        }
    }

    /// URLs emitted so far.
    pub fn emitted(&self) -> usize {
        self.emitted_total
    }

    /// Tier classification for a host, per the category table.
    pub fn classify_host(&self, host: &str) -> Tier {
        self.hosts.classify(host)
    }

    /// Credit a host from field-reward memory.
    pub fn add_host_reward(&mut self, host: &str, reward: f64) {
        *self.host_rewards.entry(host.to_ascii_lowercase()).or_default() += reward;
    }

    /// Credit a path prefix from field-reward memory.
    pub fn add_path_reward(&mut self, path_prefix: &str, reward: f64) {
        *self.path_rewards.entry(path_prefix.to_string()).or_default() += reward;
    }

    /// Deprioritize a low-yield domain.
    pub fn penalize_host(&mut self, host: &str, penalty: f64) {
        *self
            .host_penalties
            .entry(host.to_ascii_lowercase())
            .or_default() += penalty;
    }

    /// Classify and insert a URL. Duplicates are silently ignored.
    pub fn enqueue(&mut self, raw_url: &str, options: EnqueueOptions) -> EnqueueOutcome {
        let Some(normalized) = normalize_url(raw_url) else {
            return EnqueueOutcome::Unparseable;
        };
        if !self.seen.insert(normalized.url.clone()) {
            return EnqueueOutcome::Duplicate;
        }
        if self.hosts.is_blocked(&normalized.host) || self.blocked.contains(&normalized.host) {
            return EnqueueOutcome::BlockedHost;
        }

        let tier = options
            .tier
            .unwrap_or_else(|| self.hosts.classify(&normalized.host));

        if tier == Tier::Manufacturer
            && !self
                .hosts
                .is_brand_manufacturer(&self.brand, &normalized.root_domain)
        {
            let model_signal = self.config.broad_discovery && self.path_has_model_signal(&normalized.path);
            if !model_signal {
                debug!(url = %normalized.url, "rejected off-brand manufacturer URL");
                return EnqueueOutcome::ManufacturerMismatch;
            }
        }

        if options.candidate_source && !self.config.fetch_candidate_sources {
            return EnqueueOutcome::CandidateSourcesDisabled;
        }

        let source = PlannedSource {
            url: normalized.url,
            host: normalized.host,
            root_domain: normalized.root_domain,
            tier,
            role: options.role.unwrap_or(SourceRole::Discovered),
            planner_score: options.planner_score,
            field_reward: 0.0,
            insertion_index: self.insertion_counter,
            candidate_source: options.candidate_source,
        };
        self.insertion_counter += 1;
        self.queues[(tier.rank() - 1) as usize].push(source);
        EnqueueOutcome::Added
    }

    fn path_has_model_signal(&self, path: &str) -> bool {
        let folded = path.to_ascii_lowercase();
        let hits = self
            .model_tokens
            .iter()
            .filter(|t| t.len() > 1 && folded.contains(t.as_str()))
            .count();
        hits >= 2 || (self.model_tokens.len() == 1 && hits == 1)
    }

    fn host_cap(&self, tier: Tier) -> usize {
        if tier == Tier::Manufacturer {
            self.config
                .manufacturer_pages_per_domain
                .unwrap_or(self.config.max_pages_per_domain)
        } else {
            self.config.max_pages_per_domain
        }
    }

    fn effective_reward(&self, source: &PlannedSource) -> f64 {
        let host = self.host_rewards.get(&source.host).copied().unwrap_or(0.0);
        let path = normalize_url(&source.url)
            .map(|n| {
                self.path_rewards
                    .iter()
                    .filter(|(prefix, _)| n.path.starts_with(prefix.as_str()))
                    .map(|(_, r)| *r)
                    .sum::<f64>()
            })
            .unwrap_or(0.0);
        source.field_reward + host + path
    }

    fn effective_score(&self, source: &PlannedSource) -> f64 {
        source.planner_score - self.host_penalties.get(&source.host).copied().unwrap_or(0.0)
    }

    /// Remove entries that can no longer be emitted (blocked hosts, host cap
    /// reached) from one tier queue.
    fn prune_tier(&mut self, tier_idx: usize) {
        let blocked = &self.blocked;
        let hosts = &self.hosts;
        let per_host = &self.emitted_per_host;
        let cap = self.host_cap(match tier_idx {
            0 => Tier::Manufacturer,
            1 => Tier::LabReview,
            2 => Tier::Database,
            _ => Tier::Candidate,
        });
        self.queues[tier_idx].retain(|s| {
            !blocked.contains(&s.host)
                && !hosts.is_blocked(&s.host)
                && per_host.get(&s.host).copied().unwrap_or(0) < cap
        });
    }

    /// Slots still held back for manufacturer URLs.
    fn reserved_remaining(&self) -> usize {
        if self.queues[0].is_empty() {
            return 0;
        }
        self.config
            .manufacturer_reserve_urls
            .saturating_sub(self.manufacturer_emitted)
    }

    fn best_index(&self, tier_idx: usize) -> Option<usize> {
        let queue = &self.queues[tier_idx];
        if queue.is_empty() {
            return None;
        }
        let mut best: Option<(usize, (u8, f64, f64, u64))> = None;
        for (idx, source) in queue.iter().enumerate() {
            let key = (
                source.candidate_source as u8,
                -self.effective_score(source),
                -self.effective_reward(source),
                source.insertion_index,
            );
            let better = match &best {
                None => true,
                Some((_, best_key)) => {
                    (key.0, key.1, key.2, key.3)
                        < (best_key.0, best_key.1, best_key.2, best_key.3)
                }
            };
            if better {
                best = Some((idx, key));
            }
        }
        best.map(|(idx, _)| idx)
    }

    /// Highest-priority URL, or `None` when the queue or the budget is
    /// exhausted.
    pub fn next(&mut self) -> Option<PlannedSource> {
        if self.emitted_total >= self.config.max_urls_per_product {
            return None;
        }
        for tier_idx in 0..4 {
            self.prune_tier(tier_idx);
            if tier_idx > 0 {
                let budget_left = self
                    .config
                    .max_urls_per_product
                    .saturating_sub(self.emitted_total);
                if budget_left <= self.reserved_remaining() {
                    // Remaining slots are reserved for the manufacturer queue.
                    return None;
                }
            }
            if let Some(idx) = self.best_index(tier_idx) {
                let source = self.queues[tier_idx].remove(idx);
                self.emitted_total += 1;
                if source.tier == Tier::Manufacturer {
                    self.manufacturer_emitted += 1;
                }
                *self.emitted_per_host.entry(source.host.clone()).or_default() += 1;
                return Some(source);
            }
        }
        None
    }

    /// Whether `next()` could still emit a URL.
    pub fn has_next(&mut self) -> bool {
        if self.emitted_total >= self.config.max_urls_per_product {
            return false;
        }
        for tier_idx in 0..4 {
            self.prune_tier(tier_idx);
        }
        if !self.queues[0].is_empty() {
            return true;
        }
        let budget_left = self
            .config
            .max_urls_per_product
            .saturating_sub(self.emitted_total);
        budget_left > self.reserved_remaining()
            && self.queues[1..].iter().any(|q| !q.is_empty())
    }

    /// Block a host and drop its queued URLs. Returns how many were removed.
    pub fn block_host(&mut self, host: &str, reason: &str) -> usize {
        let host = host.to_ascii_lowercase();
        let host = host.strip_prefix("www.").map(str::to_string).unwrap_or(host);
        let before: usize = self.queues.iter().map(Vec::len).sum();
        self.blocked.insert(host.clone());
        for queue in &mut self.queues {
            queue.retain(|s| s.host != host);
        }
        let removed = before - self.queues.iter().map(Vec::len).sum::<usize>();
        debug!(%host, reason, removed, "blocked host");
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner(config: PlannerConfig) -> SourcePlanner {
        let hosts = SourceHostTable::new()
            .with_host("razer.com", Tier::Manufacturer)
            .with_host("logitech.com", Tier::Manufacturer)
            .with_host("rtings.com", Tier::LabReview)
            .with_host("retail.example", Tier::Database)
            .with_blocked("spam.example")
            .with_manufacturer("razer", "razer.com");
        SourcePlanner::new(
            config,
            hosts,
            "Razer",
            vec!["viper".into(), "v3".into(), "pro".into()],
        )
    }

    fn opts() -> EnqueueOptions {
        EnqueueOptions::default()
    }

    #[test]
    fn test_empty_planner() {
        let mut p = planner(PlannerConfig::default());
        assert!(!p.has_next());
        assert!(p.next().is_none());
    }

    #[test]
    fn test_duplicate_urls_ignored() {
        let mut p = planner(PlannerConfig::default());
        assert_eq!(p.enqueue("https://rtings.com/a", opts()), EnqueueOutcome::Added);
        assert_eq!(
            p.enqueue("https://www.rtings.com/a/", opts()),
            EnqueueOutcome::Duplicate
        );
        assert_eq!(
            p.enqueue("https://rtings.com/a#specs", opts()),
            EnqueueOutcome::Duplicate
        );
    }

    #[test]
    fn test_blocked_host_rejected() {
        let mut p = planner(PlannerConfig::default());
        assert_eq!(
            p.enqueue("https://spam.example/a", opts()),
            EnqueueOutcome::BlockedHost
        );
    }

    #[test]
    fn test_off_brand_manufacturer_rejected() {
        let mut p = planner(PlannerConfig::default());
        assert_eq!(
            p.enqueue("https://logitech.com/mice/viper", opts()),
            EnqueueOutcome::ManufacturerMismatch
        );
    }

    #[test]
    fn test_broad_discovery_model_signal_escape() {
        let config = PlannerConfig {
            broad_discovery: true,
            ..PlannerConfig::default()
        };
        let mut p = planner(config);
        assert_eq!(
            p.enqueue("https://logitech.com/mice/viper-v3-pro", opts()),
            EnqueueOutcome::Added
        );
        assert_eq!(
            p.enqueue("https://logitech.com/mice/other-mouse", opts()),
            EnqueueOutcome::ManufacturerMismatch
        );
    }

    #[test]
    fn test_tier_ordering_and_scores() {
        let mut p = planner(PlannerConfig::default());
        p.enqueue("https://retail.example/viper", opts());
        p.enqueue(
            "https://rtings.com/low",
            EnqueueOptions {
                planner_score: 1.0,
                ..opts()
            },
        );
        p.enqueue(
            "https://rtings.com/high",
            EnqueueOptions {
                planner_score: 5.0,
                ..opts()
            },
        );
        p.enqueue("https://razer.com/viper-v3-pro", opts());

        assert_eq!(p.next().unwrap().url, "https://razer.com/viper-v3-pro");
        assert_eq!(p.next().unwrap().url, "https://rtings.com/high");
        assert_eq!(p.next().unwrap().url, "https://rtings.com/low");
        assert_eq!(p.next().unwrap().url, "https://retail.example/viper");
        assert!(p.next().is_none());
    }

    #[test]
    fn test_insertion_order_breaks_ties() {
        let mut p = planner(PlannerConfig::default());
        p.enqueue("https://rtings.com/first", opts());
        p.enqueue("https://rtings.com/second", opts());
        assert_eq!(p.next().unwrap().url, "https://rtings.com/first");
        assert_eq!(p.next().unwrap().url, "https://rtings.com/second");
    }

    #[test]
    fn test_field_reward_breaks_score_ties() {
        let mut p = planner(PlannerConfig::default());
        p.enqueue("https://rtings.com/plain", opts());
        p.enqueue("https://rtings.com/rewarded", opts());
        p.add_path_reward("/rewarded", 2.0);
        assert_eq!(p.next().unwrap().url, "https://rtings.com/rewarded");

        let mut p = planner(PlannerConfig::default());
        p.enqueue("https://rtings.com/plain", opts());
        p.enqueue("https://rtings.com/hosted", opts());
        p.add_host_reward("rtings.com", 1.0);
        // Host reward applies to both; insertion order decides.
        assert_eq!(p.next().unwrap().url, "https://rtings.com/plain");
    }

    #[test]
    fn test_per_host_cap() {
        let config = PlannerConfig {
            max_pages_per_domain: 2,
            ..PlannerConfig::default()
        };
        let mut p = planner(config);
        for i in 0..4 {
            p.enqueue(&format!("https://rtings.com/p{i}"), opts());
        }
        assert!(p.next().is_some());
        assert!(p.next().is_some());
        assert!(p.next().is_none());
    }

    #[test]
    fn test_total_budget_cap() {
        let config = PlannerConfig {
            max_urls_per_product: 2,
            ..PlannerConfig::default()
        };
        let mut p = planner(config);
        for i in 0..4 {
            p.enqueue(&format!("https://rtings.com/p{i}"), opts());
        }
        assert!(p.next().is_some());
        assert!(p.next().is_some());
        assert!(p.next().is_none());
        assert!(!p.has_next());
    }

    #[test]
    fn test_manufacturer_reservation_holds_slots() {
        let config = PlannerConfig {
            max_urls_per_product: 3,
            manufacturer_reserve_urls: 2,
            ..PlannerConfig::default()
        };
        let mut p = planner(config);
        p.enqueue("https://rtings.com/a", opts());
        p.enqueue("https://rtings.com/b", opts());
        p.enqueue("https://razer.com/viper-1", opts());
        p.enqueue("https://razer.com/viper-2", opts());

        // Manufacturer first regardless.
        assert_eq!(p.next().unwrap().tier, Tier::Manufacturer);
        assert_eq!(p.next().unwrap().tier, Tier::Manufacturer);
        // Reserve satisfied; review URL may now drain.
        assert_eq!(p.next().unwrap().host, "rtings.com");
        assert!(p.next().is_none());
    }

    #[test]
    fn test_reservation_blocks_non_manufacturer_when_budget_tight() {
        let config = PlannerConfig {
            max_urls_per_product: 2,
            manufacturer_reserve_urls: 2,
            ..PlannerConfig::default()
        };
        let mut p = planner(config);
        p.enqueue("https://rtings.com/a", opts());
        p.enqueue("https://razer.com/viper-1", opts());
        p.enqueue("https://razer.com/viper-2", opts());

        assert_eq!(p.next().unwrap().tier, Tier::Manufacturer);
        assert_eq!(p.next().unwrap().tier, Tier::Manufacturer);
        assert!(p.next().is_none());
    }

    #[test]
    fn test_block_host_removes_queued() {
        let mut p = planner(PlannerConfig::default());
        p.enqueue("https://rtings.com/a", opts());
        p.enqueue("https://rtings.com/b", opts());
        p.enqueue("https://retail.example/c", opts());
        assert_eq!(p.block_host("rtings.com", "403 wall"), 2);
        assert_eq!(p.next().unwrap().host, "retail.example");
        assert!(p.next().is_none());
    }

    #[test]
    fn test_candidate_sources_gating() {
        let mut p = planner(PlannerConfig::default());
        assert_eq!(
            p.enqueue(
                "https://random.example/spec",
                EnqueueOptions {
                    candidate_source: true,
                    ..opts()
                }
            ),
            EnqueueOutcome::CandidateSourcesDisabled
        );

        let config = PlannerConfig {
            fetch_candidate_sources: true,
            ..PlannerConfig::default()
        };
        let mut p = planner(config);
        p.enqueue(
            "https://random.example/spec",
            EnqueueOptions {
                candidate_source: true,
                planner_score: 100.0,
                ..opts()
            },
        );
        p.enqueue("https://other.example/spec", opts());
        // Candidate-source URLs sort last within the tier even with a higher
        // score.
        assert_eq!(p.next().unwrap().url, "https://other.example/spec");
        assert_eq!(p.next().unwrap().url, "https://random.example/spec");
    }

    #[test]
    fn test_low_yield_penalty_reorders() {
        let mut p = planner(PlannerConfig::default());
        p.enqueue("https://rtings.com/a", opts());
        p.enqueue(
            "https://rtings.com/b",
            EnqueueOptions {
                planner_score: 0.5,
                ..opts()
            },
        );
        p.penalize_host("rtings.com", 0.0); // no-op penalty keeps order
        assert_eq!(p.next().unwrap().url, "https://rtings.com/b");
    }
}
