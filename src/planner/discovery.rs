//! Sitemap and robots.txt discovery.

use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::debug;

use super::queue::{EnqueueOptions, EnqueueOutcome, SourcePlanner};
use super::types::normalize_url;
use super::types::SourceRole;

/// Extract every `<loc>` value from a `<urlset>` or `<sitemapindex>`
/// document. Malformed XML yields whatever was parsed up to the error.
pub fn extract_sitemap_locs(body: &str) -> Vec<String> {
    let mut reader = Reader::from_str(body);
    let mut locs = Vec::new();
    let mut in_loc = false;
    let mut current = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"loc" => {
                in_loc = true;
                current.clear();
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"loc" => {
                in_loc = false;
                let trimmed = current.trim();
                if !trimmed.is_empty() {
                    locs.push(trimmed.to_string());
                }
            }
            Ok(Event::Text(t)) if in_loc => {
                if let Ok(text) = t.unescape() {
                    current.push_str(&text);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                debug!(error = %e, "sitemap parse stopped early");
                break;
            }
            _ => {}
        }
    }
    locs
}

/// Extract `Sitemap:` directives from a robots.txt body. Nothing else is
/// honored here; crawl-delay and allow/deny stay with the fetcher.
pub fn extract_robots_sitemaps(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| {
            let line = line.trim();
            let (key, value) = line.split_once(':')?;
            if key.trim().eq_ignore_ascii_case("sitemap") {
                let url = value.trim();
                (!url.is_empty()).then(|| url.to_string())
            } else {
                None
            }
        })
        .collect()
}

impl SourcePlanner {
    /// Enqueue every `<loc>` of a sitemap under the originating host's tier.
    /// Returns how many URLs were actually added.
    pub fn discover_from_sitemap(&mut self, origin_url: &str, body: &str) -> usize {
        let origin_tier = normalize_url(origin_url).map(|n| self.classify_host(&n.host));
        extract_sitemap_locs(body)
            .iter()
            .filter(|loc| {
                self.enqueue(
                    loc,
                    EnqueueOptions {
                        tier: origin_tier,
                        role: Some(SourceRole::Sitemap),
                        ..EnqueueOptions::default()
                    },
                ) == EnqueueOutcome::Added
            })
            .count()
    }

    /// Enqueue the sitemaps referenced by a robots.txt. Returns how many
    /// `Sitemap:` directives were found.
    pub fn discover_from_robots(&mut self, origin_url: &str, body: &str) -> usize {
        let origin_tier = normalize_url(origin_url).map(|n| self.classify_host(&n.host));
        let sitemaps = extract_robots_sitemaps(body);
        for sitemap_url in &sitemaps {
            self.enqueue(
                sitemap_url,
                EnqueueOptions {
                    tier: origin_tier,
                    role: Some(SourceRole::Sitemap),
                    ..EnqueueOptions::default()
                },
            );
        }
        sitemaps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlannerConfig;
    use crate::planner::types::{SourceHostTable, Tier};

    fn planner() -> SourcePlanner {
        let hosts = SourceHostTable::new()
            .with_host("razer.com", Tier::Manufacturer)
            .with_manufacturer("razer", "razer.com");
        SourcePlanner::new(
            PlannerConfig::default(),
            hosts,
            "Razer",
            vec!["viper".into()],
        )
    }

    const URLSET: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://razer.com/mice/viper-v3-pro</loc></url>
  <url><loc>https://razer.com/mice/basilisk</loc></url>
</urlset>"#;

    const SITEMAPINDEX: &str = r#"<sitemapindex>
  <sitemap><loc>https://razer.com/sitemap-products.xml</loc></sitemap>
</sitemapindex>"#;

    #[test]
    fn test_extract_urlset_locs() {
        let locs = extract_sitemap_locs(URLSET);
        assert_eq!(locs.len(), 2);
        assert_eq!(locs[0], "https://razer.com/mice/viper-v3-pro");
    }

    #[test]
    fn test_extract_sitemapindex_locs() {
        let locs = extract_sitemap_locs(SITEMAPINDEX);
        assert_eq!(locs, vec!["https://razer.com/sitemap-products.xml"]);
    }

    #[test]
    fn test_discover_from_sitemap_enqueues_under_origin_tier() {
        let mut p = planner();
        let added = p.discover_from_sitemap("https://razer.com/sitemap.xml", URLSET);
        assert_eq!(added, 2);
        assert_eq!(p.next().unwrap().tier, Tier::Manufacturer);
    }

    #[test]
    fn test_discover_from_sitemap_dedupes() {
        let mut p = planner();
        p.discover_from_sitemap("https://razer.com/sitemap.xml", URLSET);
        let added_again = p.discover_from_sitemap("https://razer.com/sitemap.xml", URLSET);
        assert_eq!(added_again, 0);
    }

    #[test]
    fn test_robots_extracts_only_sitemap_directives() {
        let robots = "User-agent: *\nDisallow: /private\nSitemap: https://razer.com/sitemap.xml\nsitemap: https://razer.com/sitemap2.xml\n";
        let found = extract_robots_sitemaps(robots);
        assert_eq!(found.len(), 2);

        let mut p = planner();
        assert_eq!(p.discover_from_robots("https://razer.com/robots.txt", robots), 2);
        assert!(p.has_next());
    }

    #[test]
    fn test_malformed_sitemap_is_not_fatal() {
        let locs = extract_sitemap_locs("<urlset><url><loc>https://a.com/x</loc></url><url><loc>");
        assert_eq!(locs, vec!["https://a.com/x"]);
    }
}
