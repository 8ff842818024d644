//! The orchestration loop: one product through rounds to convergence.
//!
//! Each round: seed the planner, drain it, pipeline the pages into
//! candidates, merge provenance, gate, recompute the NeedSet, evaluate
//! progress, and stop when a stop condition fires. Artifacts persist at the
//! end of the run; the published spec only moves behind the promotion gate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::HarvestConfig;
use crate::error::{Error, Result};
use crate::events::{EventSink, HarvestEvent, HarvestEventType};
use crate::fetch::Fetcher;
use crate::frontier::{FrontierStore, RecordFetch};
use crate::identity::{product_id, IdentityLock};
use crate::learning::{LearningHints, LearningStore};
use crate::needset::{
    build_snapshot, compute_need_set, decide_stop, evaluate_round_progress, NeedSetRow,
    RoundContext, RoundSnapshot, StopInputs, StopReason,
};
use crate::pipeline::{
    build_source_candidates, merge_into_provenance, value_hash, ProductProvenance,
    SourceCandidates,
};
use crate::planner::{EnqueueOptions, SourceHostTable, SourcePlanner, SourceRole};
use crate::rules::{FieldRulesEngine, GateInput, GateOutput, RequiredLevel, UNK};
use crate::scheduler::{drain_queue, DrainOptions, FetchYield, SkipFn};
use crate::storage::{keys, Storage};

/// One product job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestJob {
    pub category: String,
    pub identity: IdentityLock,
    #[serde(default)]
    pub seed_urls: Vec<String>,
    /// Raw mode string; aliases resolve per [`crate::config::RunMode::parse`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// The durable per-run summary consumers inspect instead of exit codes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub product_id: String,
    pub category: String,
    pub validated: bool,
    pub confidence: f64,
    pub publishable: bool,
    pub publish_blockers: Vec<String>,
    pub field_reasoning: BTreeMap<String, String>,
    /// Fraction of critical+required fields with accepted values
    pub completeness_required: f64,
    /// Fraction of all schema fields with accepted values
    pub coverage_overall: f64,
    pub constraint_contradiction_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    pub rounds: u32,
    pub finished_at: DateTime<Utc>,
}

/// Everything a run returns to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub summary: RunSummary,
    /// Gated field map, `unk` sentinels included
    pub fields: Map<String, Value>,
    pub provenance: ProductProvenance,
    pub needset: Vec<NeedSetRow>,
    pub promoted: bool,
    /// Per-round failure notes
    pub failures: Vec<String>,
}

/// A run's spec is promoted iff it is publishable and strictly improves on
/// the published summary on any tracked axis.
pub fn should_promote(current: Option<&RunSummary>, candidate: &RunSummary) -> bool {
    if !candidate.publishable {
        return false;
    }
    let Some(current) = current else {
        return true;
    };
    (candidate.validated && !current.validated)
        || candidate.confidence > current.confidence
        || candidate.completeness_required > current.completeness_required
        || candidate.coverage_overall > current.coverage_overall
        || candidate.constraint_contradiction_count < current.constraint_contradiction_count
}

/// Ties the components together per product across rounds.
pub struct Orchestrator {
    config: HarvestConfig,
    host_table: SourceHostTable,
    storage: Arc<dyn Storage>,
    fetcher: Arc<dyn Fetcher>,
    frontier: Arc<FrontierStore>,
    learning: Arc<LearningStore>,
    events: EventSink,
}

impl Orchestrator {
    pub fn new(
        config: HarvestConfig,
        host_table: SourceHostTable,
        storage: Arc<dyn Storage>,
        fetcher: Arc<dyn Fetcher>,
        frontier: Arc<FrontierStore>,
        learning: Arc<LearningStore>,
    ) -> Self {
        Self {
            config,
            host_table,
            storage,
            fetcher,
            frontier,
            learning,
            events: EventSink::disabled(),
        }
    }

    /// Attach an event sink.
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Run one product to convergence.
    pub async fn run_product(&self, job: HarvestJob) -> Result<RunReport> {
        if job.category.trim().is_empty() {
            return Err(Error::CategoryRequired);
        }
        if !job.identity.is_plannable() {
            return Err(Error::IdentityInsufficient(format!(
                "lock status {:?} is below locked_brand_model",
                job.identity.status()
            )));
        }

        let engine = FieldRulesEngine::load(&job.category, self.storage.as_ref())?;
        let mode = job
            .mode
            .as_deref()
            .map(crate::config::RunMode::parse)
            .unwrap_or(self.config.mode);
        let budget = self
            .config
            .round_budget
            .unwrap_or_else(|| crate::config::RoundBudget::for_mode(mode));

        let product_id = product_id(&job.category, &job.identity);
        let run_id = Uuid::new_v4().to_string();
        info!(%product_id, %run_id, ?mode, "starting harvest run");

        let mut planner = SourcePlanner::new(
            self.config.planner.clone(),
            self.host_table.clone(),
            &job.identity.brand,
            job.identity.model_tokens(),
        );
        for url in &job.seed_urls {
            planner.enqueue(
                url,
                EnqueueOptions {
                    role: Some(SourceRole::Seed),
                    ..EnqueueOptions::default()
                },
            );
        }

        let focus_fields: Vec<String> = engine
            .bundle()
            .field_rules
            .keys()
            .cloned()
            .collect();
        let hints = self
            .learning
            .read_hints(&job.category, &focus_fields)
            .unwrap_or_else(|e| {
                warn!(error = %e, "learning hints unavailable; proceeding cold");
                LearningHints::default()
            });
        self.apply_hints_to_planner(&mut planner, &hints);

        let mut provenance = ProductProvenance::new();
        let mut all_sources: Vec<SourceCandidates> = Vec::new();
        let mut failures: Vec<String> = Vec::new();
        let mut previous_snapshot: Option<RoundSnapshot> = None;
        let mut no_progress_streak = 0u32;
        let mut low_quality_rounds = 0u32;
        let mut stop_reason: Option<StopReason> = None;
        let mut round_index = 0u32;
        let mut gate_output: GateOutput;
        let mut needset: Vec<NeedSetRow>;

        loop {
            let context = RoundContext {
                round_index,
                mode,
                missing_required: previous_snapshot
                    .as_ref()
                    .map(|s| s.missing_required.clone())
                    .unwrap_or_default(),
                ..RoundContext::default()
            };
            self.events.emit(
                HarvestEvent::new(HarvestEventType::RoundStarted, round_index, "round started")
                    .with_metadata("product_id", product_id.clone())
                    .with_metadata("mode", format!("{:?}", context.mode)),
            );

            // Drain up to the round budget.
            let mut sources = Vec::new();
            while sources.len() < budget.max_urls {
                match planner.next() {
                    Some(source) => sources.push(source),
                    None => break,
                }
            }

            let round_yields = if sources.is_empty() {
                Vec::new()
            } else {
                let frontier = Arc::clone(&self.frontier);
                let skip: SkipFn = Arc::new(move |source| {
                    frontier
                        .should_skip_url(&source.url)
                        .ok()
                        .and_then(|check| check.reason)
                });
                let (_, yields) = drain_queue(
                    sources,
                    DrainOptions::from_config(
                        &self.config.scheduler,
                        self.config.host_policies.clone(),
                    ),
                    Arc::clone(&self.fetcher),
                    skip,
                    self.events.clone(),
                )
                .await;
                yields
            };

            let mut round_sources = Vec::new();
            for fetch_yield in &round_yields {
                self.record_fetch(&product_id, fetch_yield, &mut failures);
                if let Some(error) = &fetch_yield.result.error {
                    failures.push(format!("{}: {}", fetch_yield.result.url, error));
                }
                if let Some(source_candidates) =
                    build_source_candidates(&engine, &job.identity, fetch_yield)
                {
                    round_sources.push(source_candidates);
                }
            }
            let round_quality = round_sources.iter().any(|s| !s.candidates.is_empty());

            let now = Utc::now();
            merge_into_provenance(&mut provenance, &engine, &round_sources, now);
            all_sources.extend(round_sources);

            gate_output = engine.apply_runtime_gate(GateInput {
                fields: provenance.field_values(),
                field_order: engine.bundle().field_order(),
            });
            for failure in &gate_output.failures {
                failures.push(format!(
                    "{}: {:?} at {:?}",
                    failure.field, failure.reason_code, failure.stage
                ));
            }

            self.record_yields(&provenance, &mut failures);

            needset = compute_need_set(
                &engine,
                &job.identity,
                &provenance,
                &hints.known_urls,
                &self.config.needset,
                now,
            );
            self.events.emit(
                HarvestEvent::new(HarvestEventType::NeedsetComputed, round_index, "needset")
                    .with_metadata("rows", needset.len() as u64),
            );

            let snapshot = build_snapshot(
                &engine,
                &provenance,
                &needset,
                gate_output.contradictions,
                round_index,
                &self.config.needset,
                now,
            );
            let progress = evaluate_round_progress(previous_snapshot.as_ref(), &snapshot);
            if progress.improved {
                no_progress_streak = 0;
            } else {
                no_progress_streak += 1;
            }
            if !round_quality {
                low_quality_rounds += 1;
            }
            self.events.emit(
                HarvestEvent::new(HarvestEventType::RoundCompleted, round_index, "round completed")
                    .with_metadata("improved", progress.improved)
                    .with_metadata("needset", snapshot.needset_size as u64),
            );
            previous_snapshot = Some(snapshot);

            let stop = decide_stop(
                &StopInputs {
                    round_index,
                    needset_empty: needset.is_empty(),
                    contradiction_count: gate_output.contradictions,
                    budget_exhausted: !planner.has_next(),
                    no_progress_streak,
                    low_quality_rounds,
                },
                &self.config.needset,
            );
            if let Some(reason) = stop {
                self.events.emit(
                    HarvestEvent::new(
                        HarvestEventType::StopConditionFired,
                        round_index,
                        "stopping",
                    )
                    .with_metadata("reason", serde_json::to_value(reason)?),
                );
                stop_reason = Some(reason);
                break;
            }

            // Seed the next round: record the focus queries and requeue URLs
            // that yielded these fields before.
            for row in needset.iter().take(budget.focus_top_n) {
                let skip = self
                    .frontier
                    .should_skip_query(&product_id, &row.retrieval_query, "search", false)
                    .unwrap_or(false);
                if skip {
                    continue;
                }
                if let Err(e) =
                    self.frontier
                        .record_query(&product_id, &row.retrieval_query, "search")
                {
                    failures.push(format!("record_query: {e}"));
                }
                for url in &row.hits {
                    planner.enqueue(
                        url,
                        EnqueueOptions {
                            role: Some(SourceRole::Retrieval),
                            ..EnqueueOptions::default()
                        },
                    );
                }
            }

            round_index += 1;
        }

        // Learning stores only learn from accepted values with evidence.
        if let Err(e) = self
            .learning
            .populate_from_product(&job.category, &provenance, &all_sources)
        {
            failures.push(format!("populate_learning_stores: {e}"));
        }

        let snapshot = previous_snapshot.unwrap_or_default();
        let summary = self.build_summary(
            &engine,
            &job,
            &product_id,
            &run_id,
            &provenance,
            &gate_output,
            &snapshot,
            stop_reason,
            round_index + 1,
        );

        let promoted = self.persist_run(
            &job.category,
            &product_id,
            &summary,
            &gate_output,
            &provenance,
            &all_sources,
        )?;

        Ok(RunReport {
            summary,
            fields: gate_output.fields,
            provenance,
            needset,
            promoted,
            failures,
        })
    }

    fn apply_hints_to_planner(&self, planner: &mut SourcePlanner, hints: &LearningHints) {
        for domain in &hints.high_yield_domains {
            planner.add_host_reward(domain, 1.0);
        }
        for domain_yield in &hints.domain_yields {
            if domain_yield.seen_count >= self.config.learning.min_seen
                && domain_yield.ratio() <= self.config.learning.max_yield
            {
                planner.penalize_host(&domain_yield.domain, 1.0);
            }
        }
        for urls in hints.known_urls.values() {
            for url in urls {
                planner.enqueue(
                    url,
                    EnqueueOptions {
                        role: Some(SourceRole::Retrieval),
                        ..EnqueueOptions::default()
                    },
                );
            }
        }
    }

    fn record_fetch(&self, product_id: &str, fetch_yield: &FetchYield, failures: &mut Vec<String>) {
        let result = &fetch_yield.result;
        let record = RecordFetch {
            product_id: product_id.to_string(),
            url: result.url.clone(),
            status: result.status,
            content_type: result.content_type.clone(),
            bytes: result.bytes,
            elapsed_ms: result.elapsed_ms,
            fields_found: Vec::new(),
        };
        if let Err(e) = self.frontier.record_fetch(record) {
            failures.push(format!("record_fetch {}: {e}", result.url));
        }
    }

    fn record_yields(&self, provenance: &ProductProvenance, failures: &mut Vec<String>) {
        for (field, entry) in &provenance.fields {
            for evidence in &entry.evidence {
                if let Err(e) = self.frontier.record_yield(
                    &evidence.url,
                    field,
                    &value_hash(&entry.value),
                    entry.confidence,
                ) {
                    failures.push(format!("record_yield {field}: {e}"));
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_summary(
        &self,
        engine: &FieldRulesEngine,
        job: &HarvestJob,
        product_id: &str,
        run_id: &str,
        provenance: &ProductProvenance,
        gate_output: &GateOutput,
        snapshot: &RoundSnapshot,
        stop_reason: Option<StopReason>,
        rounds: u32,
    ) -> RunSummary {
        let rules = &engine.bundle().field_rules;
        let known = |field: &str| {
            gate_output
                .fields
                .get(field)
                .map_or(false, |v| crate::rules::is_known_value(v) && *v != json!(UNK))
        };

        let required_fields: Vec<&String> = rules
            .iter()
            .filter(|(_, r)| {
                matches!(
                    r.required_level,
                    RequiredLevel::Critical | RequiredLevel::Required
                )
            })
            .map(|(k, _)| k)
            .collect();
        let completeness_required = if required_fields.is_empty() {
            1.0
        } else {
            required_fields.iter().filter(|f| known(f)).count() as f64
                / required_fields.len() as f64
        };
        let coverage_overall = if rules.is_empty() {
            1.0
        } else {
            rules.keys().filter(|f| known(f)).count() as f64 / rules.len() as f64
        };

        let mut publish_blockers = Vec::new();
        if !snapshot.missing_critical.is_empty() {
            publish_blockers.push(format!(
                "critical fields unresolved: {}",
                snapshot.missing_critical.join(", ")
            ));
        }
        if gate_output.contradictions > 0 {
            publish_blockers.push(format!(
                "{} constraint contradiction(s)",
                gate_output.contradictions
            ));
        }
        if provenance.fields.is_empty() {
            publish_blockers.push("no accepted fields".to_string());
        }

        let mut field_reasoning = BTreeMap::new();
        for (field, entry) in &provenance.fields {
            field_reasoning.insert(
                field.clone(),
                format!(
                    "{} confirmation(s), {} approved, best {:?} at {:.2}",
                    entry.confirmations,
                    entry.approved_confirmations,
                    entry
                        .evidence
                        .first()
                        .map(|e| e.method)
                        .unwrap_or(crate::pipeline::ExtractionMethod::Dom),
                    entry.confidence
                ),
            );
        }

        RunSummary {
            run_id: run_id.to_string(),
            product_id: product_id.to_string(),
            category: job.category.clone(),
            validated: snapshot.validated,
            confidence: snapshot.mean_confidence,
            publishable: publish_blockers.is_empty(),
            publish_blockers,
            field_reasoning,
            completeness_required,
            coverage_overall,
            constraint_contradiction_count: gate_output.contradictions,
            stop_reason,
            rounds,
            finished_at: Utc::now(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn persist_run(
        &self,
        category: &str,
        product_id: &str,
        summary: &RunSummary,
        gate_output: &GateOutput,
        provenance: &ProductProvenance,
        sources: &[SourceCandidates],
    ) -> Result<bool> {
        let write_json = |key: String, value: &Value| -> Result<()> {
            self.storage.write_object(&key, &serde_json::to_vec_pretty(value)?)
        };

        write_json(
            keys::latest_artifact(category, product_id, "normalized"),
            &Value::Object(gate_output.fields.clone()),
        )?;
        write_json(
            keys::latest_artifact(category, product_id, "provenance"),
            &serde_json::to_value(provenance)?,
        )?;
        write_json(
            keys::latest_artifact(category, product_id, "summary"),
            &serde_json::to_value(summary)?,
        )?;
        write_json(
            keys::latest_artifact(category, product_id, "candidates"),
            &serde_json::to_value(sources)?,
        )?;

        // History is always appended, promoted or not.
        let mut history_line = serde_json::to_string(summary)?;
        history_line.push('\n');
        self.storage
            .append_text(&keys::run_history(category, product_id), &history_line)?;

        let spec_key = keys::published_spec(category, product_id);
        let current_summary: Option<RunSummary> = self
            .storage
            .read_json_or_null(&spec_key)?
            .and_then(|spec| spec.get("summary").cloned())
            .and_then(|s| serde_json::from_value(s).ok());

        let promote = should_promote(current_summary.as_ref(), summary);
        if promote {
            let spec = json!({
                "product_id": product_id,
                "category": category,
                "fields": Value::Object(gate_output.fields.clone()),
                "summary": serde_json::to_value(summary)?,
            });
            write_json(spec_key, &spec)?;
            self.events.emit(HarvestEvent::new(
                HarvestEventType::SpecPromoted,
                summary.rounds,
                "spec promoted",
            ));
        } else {
            self.events.emit(HarvestEvent::new(
                HarvestEventType::SpecNotPromoted,
                summary.rounds,
                "spec not promoted",
            ));
        }

        let metrics_line = format!(
            "{}\n",
            json!({
                "run_id": summary.run_id,
                "product_id": product_id,
                "rounds": summary.rounds,
                "confidence": summary.confidence,
                "validated": summary.validated,
                "promoted": promote,
                "finished_at": summary.finished_at.to_rfc3339(),
            })
        );
        self.storage
            .append_text(&keys::runtime_metrics(), &metrics_line)?;

        Ok(promote)
    }
}
