//! Source planner: the tier-ordered URL queue for one product.
//!
//! The planner owns dedup, per-host caps, manufacturer safety, and budget
//! reservation; the fetch scheduler drains it. Sitemap and robots discovery
//! feed back into it mid-round.

mod discovery;
mod queue;
mod types;

pub use discovery::{extract_robots_sitemaps, extract_sitemap_locs};
pub use queue::{EnqueueOptions, EnqueueOutcome, SourcePlanner};
pub use types::{
    normalize_url, parent_path, root_domain_of, NormalizedUrl, PlannedSource, SourceHostTable,
    SourceRole, Tier,
};
