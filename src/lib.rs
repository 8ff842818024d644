//! # harvest-core
//!
//! A batch convergence engine that harvests structured product
//! specifications from heterogeneous web sources and converges on a single
//! validated, evidence-backed record per product.
//!
//! ## Core Components
//!
//! - **Rules**: compiled per-category field contracts and the runtime gate
//! - **Planner**: tier-ordered URL queue with dedup, caps, and manufacturer
//!   reservation
//! - **Scheduler**: bounded fetch workers with per-host pacing and mode
//!   fallback
//! - **Pipeline**: surface extraction, identity gating, scoring, provenance
//! - **NeedSet**: evidence decay, round progress, stop conditions
//! - **Frontier / Learning / Review**: durable memory across runs
//! - **Orchestrator**: the per-product round loop
//!
//! ## Example
//!
//! ```rust,ignore
//! use harvest_core::{HarvestJob, IdentityLock, Orchestrator};
//!
//! let report = orchestrator
//!     .run_product(HarvestJob {
//!         category: "gaming-mice".into(),
//!         identity: IdentityLock::new("Razer", "Viper V3 Pro", ""),
//!         seed_urls: vec!["https://razer.com/viper-v3-pro".into()],
//!         mode: None,
//!     })
//!     .await?;
//! println!("validated: {}", report.summary.validated);
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod fetch;
pub mod frontier;
pub mod identity;
pub mod learning;
pub mod llm;
pub mod needset;
pub mod orchestrator;
pub mod pipeline;
pub mod planner;
pub mod review;
pub mod rules;
pub mod scheduler;
pub mod storage;

// Re-exports for convenience
pub use config::{
    FrontierConfig, HarvestConfig, HostPolicy, HostPolicyTable, LearningConfig, NeedSetConfig,
    PlannerConfig, RoundBudget, RunMode, SchedulerConfig,
};
pub use error::{Error, Result};
pub use events::{EventSink, HarvestEvent, HarvestEventType};
pub use fetch::{FetchMode, FetchRequest, Fetcher, HttpFetcher, PageData};
pub use frontier::{FrontierRow, FrontierStore, SkipCheck};
pub use identity::{
    product_id, score_identity, IdentityDecision, IdentityLock, IdentityMatch, LockStatus,
    SourceIdentity,
};
pub use learning::{LearningHints, LearningStore};
pub use llm::{DisabledLlm, LlmClient, LlmRequest};
pub use needset::{
    compute_need_set, decide_stop, evaluate_round_progress, NeedSetRow, Progress, ProgressReason,
    RoundContext, StopReason,
};
pub use orchestrator::{should_promote, HarvestJob, Orchestrator, RunReport, RunSummary};
pub use pipeline::{
    build_source_candidates, merge_into_provenance, Candidate, ExtractionMethod,
    ProductProvenance, ProvenanceEntry, SourceCandidates,
};
pub use planner::{SourceHostTable, SourcePlanner, Tier};
pub use review::{LaneAction, ReviewKey, ReviewRow, ReviewStore};
pub use rules::{
    EnumPolicy, FieldRule, FieldRulesEngine, GateInput, GateOutput, RuleBundle, UNK,
};
pub use scheduler::{drain_queue, DrainOptions, DrainStats, FetchResult, FetchYield};
pub use storage::{resolve_output_key, FsStorage, Storage};
