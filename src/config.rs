//! Configuration for harvest runs.
//!
//! All knobs are explicit struct fields with defaults; there are no free-form
//! option bags. Per-host overrides go through [`HostPolicyTable`], keyed by
//! lowercased host tokens with any `www.` prefix stripped.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Run mode controlling per-round effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Default effort level
    Balanced,
    /// More queries and URLs per round
    Aggressive,
    /// Alias tier above aggressive; budgets fall back to aggressive unless
    /// explicitly overridden
    UberAggressive,
}

impl RunMode {
    /// Parse a mode string, honoring the historical aliases. Unknown input
    /// falls back to `Balanced`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "aggressive" => Self::Aggressive,
            "uber" | "ultra" | "uber_aggressive" => Self::UberAggressive,
            _ => Self::Balanced,
        }
    }

    /// The mode whose budget table applies. `UberAggressive` has no budget
    /// table of its own and borrows the aggressive one.
    pub fn budget_mode(self) -> Self {
        match self {
            Self::UberAggressive => Self::Aggressive,
            other => other,
        }
    }
}

impl Default for RunMode {
    fn default() -> Self {
        Self::Balanced
    }
}

/// Per-round effort budget, resolved from the run mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoundBudget {
    /// Maximum URLs fetched in one round
    pub max_urls: usize,
    /// Maximum retrieval queries issued in one round
    pub max_queries: usize,
    /// How many NeedSet rows become the round focus
    pub focus_top_n: usize,
}

impl RoundBudget {
    /// Budget table per mode.
    pub fn for_mode(mode: RunMode) -> Self {
        match mode.budget_mode() {
            RunMode::Balanced => Self {
                max_urls: 12,
                max_queries: 4,
                focus_top_n: 6,
            },
            RunMode::Aggressive | RunMode::UberAggressive => Self {
                max_urls: 24,
                max_queries: 8,
                focus_top_n: 10,
            },
        }
    }
}

/// Source planner limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Total URLs emitted per product across all rounds
    pub max_urls_per_product: usize,
    /// URLs emitted per host
    pub max_pages_per_domain: usize,
    /// Override for manufacturer hosts; `None` uses `max_pages_per_domain`
    pub manufacturer_pages_per_domain: Option<usize>,
    /// Budget slots reserved for manufacturer URLs
    pub manufacturer_reserve_urls: usize,
    /// Whether runtime-discovered candidate sources may be fetched at all
    pub fetch_candidate_sources: bool,
    /// Allow manufacturer URLs outside the brand's manufacturer set when the
    /// path carries a strong model signal
    pub broad_discovery: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_urls_per_product: 60,
            max_pages_per_domain: 6,
            manufacturer_pages_per_domain: Some(12),
            manufacturer_reserve_urls: 4,
            fetch_candidate_sources: false,
            broad_discovery: false,
        }
    }
}

/// Fetch scheduler knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker count for the drain pool
    pub concurrency: usize,
    /// Minimum spacing between fetches to the same host, in milliseconds
    pub per_host_delay_ms: u64,
    /// Retries per fetch mode before escalating
    pub max_retries: u32,
    /// Base backoff applied between retries, doubled each attempt
    pub retry_backoff_ms: u64,
    /// Per-fetch deadline enforced by the fetcher
    pub page_goto_timeout_ms: u64,
    /// Mode the fallback ladder starts in
    pub initial_mode: crate::fetch::FetchMode,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            per_host_delay_ms: 1_500,
            max_retries: 2,
            retry_backoff_ms: 500,
            page_goto_timeout_ms: 30_000,
            initial_mode: crate::fetch::FetchMode::Crawlee,
        }
    }
}

/// Frontier store cooldown policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontierConfig {
    /// Window during which an identical normalized query is skipped
    pub query_cooldown_seconds: i64,
    /// Base for the 403 exponential backoff
    pub cooldown_403_base_seconds: i64,
    /// Consecutive 404s at a parent path before the path is marked dead
    pub path_penalty_notfound_threshold: u32,
}

impl Default for FrontierConfig {
    fn default() -> Self {
        Self {
            query_cooldown_seconds: 6 * 3600,
            cooldown_403_base_seconds: 600,
            path_penalty_notfound_threshold: 3,
        }
    }
}

/// NeedSet and convergence knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeedSetConfig {
    /// Evidence half-life in days
    pub decay_days: f64,
    /// Lower clamp for the decay factor
    pub decay_floor: f64,
    /// Rounds limit for the orchestration loop
    pub rounds_limit: u32,
    /// Consecutive no-progress rounds before stopping
    pub no_progress_limit: u32,
    /// Low-quality rounds before stopping
    pub max_low_quality_rounds: u32,
}

impl Default for NeedSetConfig {
    fn default() -> Self {
        Self {
            decay_days: 45.0,
            decay_floor: 0.2,
            rounds_limit: 6,
            no_progress_limit: 3,
            max_low_quality_rounds: 3,
        }
    }
}

/// Learning store thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    /// Minimum observations before a domain can be judged low-yield
    pub min_seen: u64,
    /// Yield ratio at or below which a domain is surfaced as low-yield
    pub max_yield: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            min_seen: 8,
            max_yield: 0.05,
        }
    }
}

/// Per-host fetch policy override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostPolicy {
    /// Navigation deadline override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_goto_timeout_ms: Option<u64>,
    /// Network-idle settle deadline override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_network_idle_timeout_ms: Option<u64>,
    /// Per-host minimum inter-fetch delay override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_host_min_delay_ms: Option<u64>,
    /// Whether GraphQL replay capture is enabled for the host
    #[serde(default)]
    pub graphql_replay_enabled: bool,
    /// Retry budget override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_budget: Option<u32>,
    /// Retry backoff override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_backoff_ms: Option<u64>,
}

/// Canonical table of per-host policies.
///
/// Host tokens are lowercased and any `www.` prefix is stripped before lookup,
/// so `www.Razer.com` and `razer.com` resolve to the same policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostPolicyTable {
    policies: HashMap<String, HostPolicy>,
}

impl HostPolicyTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize a host into its lookup token.
    pub fn host_token(host: &str) -> String {
        let token = host.trim().to_ascii_lowercase();
        token
            .strip_prefix("www.")
            .map(str::to_string)
            .unwrap_or(token)
    }

    /// Insert a policy for a host.
    pub fn insert(&mut self, host: &str, policy: HostPolicy) {
        self.policies.insert(Self::host_token(host), policy);
    }

    /// Look up the policy for a host, if any.
    pub fn get(&self, host: &str) -> Option<&HostPolicy> {
        self.policies.get(&Self::host_token(host))
    }

    /// Effective per-host delay for a host.
    pub fn per_host_delay_ms(&self, host: &str, default_ms: u64) -> u64 {
        self.get(host)
            .and_then(|p| p.per_host_min_delay_ms)
            .unwrap_or(default_ms)
    }

    /// Effective retry budget for a host.
    pub fn retry_budget(&self, host: &str, default_retries: u32) -> u32 {
        self.get(host)
            .and_then(|p| p.retry_budget)
            .unwrap_or(default_retries)
    }
}

/// Top-level configuration for a harvest run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarvestConfig {
    /// Requested run mode
    pub mode: RunMode,
    /// Planner limits
    pub planner: PlannerConfig,
    /// Scheduler knobs
    pub scheduler: SchedulerConfig,
    /// Frontier cooldown policy
    pub frontier: FrontierConfig,
    /// Convergence knobs
    pub needset: NeedSetConfig,
    /// Learning store thresholds
    pub learning: LearningConfig,
    /// Per-host overrides
    pub host_policies: HostPolicyTable,
    /// Explicit round budget; `None` resolves from the mode table
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round_budget: Option<RoundBudget>,
}

impl HarvestConfig {
    /// Configuration with defaults for the given mode.
    pub fn for_mode(mode: RunMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Override the round budget explicitly.
    pub fn with_round_budget(mut self, budget: RoundBudget) -> Self {
        self.round_budget = Some(budget);
        self
    }

    /// Resolve the effective round budget.
    pub fn round_budget(&self) -> RoundBudget {
        self.round_budget
            .unwrap_or_else(|| RoundBudget::for_mode(self.mode))
    }
}
