//! The bounded drain: workers pull sources FIFO, pace per host, and walk the
//! fetcher-mode fallback ladder on failure.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::HostPolicyTable;
use crate::error::Error;
use crate::events::{EventSink, HarvestEvent, HarvestEventType};
use crate::fetch::{FetchMode, FetchRequest, Fetcher};
use crate::planner::PlannedSource;

use super::pacer::HostPacer;
use super::types::{
    classify_error, classify_status, DrainStats, FetchOutcome, FetchResult, FetchYield,
};

/// Knobs for one drain.
#[derive(Debug, Clone)]
pub struct DrainOptions {
    /// Mode the ladder starts in
    pub initial_mode: FetchMode,
    pub concurrency: usize,
    pub per_host_delay_ms: u64,
    /// Retries per mode before escalating
    pub max_retries: u32,
    /// Base backoff between retries, doubled each attempt
    pub retry_backoff_ms: u64,
    /// Per-fetch deadline handed to the fetcher
    pub page_goto_timeout_ms: u64,
    pub host_policies: HostPolicyTable,
}

impl DrainOptions {
    /// Build drain options from the scheduler config and host policies.
    pub fn from_config(
        scheduler: &crate::config::SchedulerConfig,
        host_policies: HostPolicyTable,
    ) -> Self {
        Self {
            initial_mode: scheduler.initial_mode,
            concurrency: scheduler.concurrency,
            per_host_delay_ms: scheduler.per_host_delay_ms,
            max_retries: scheduler.max_retries,
            retry_backoff_ms: scheduler.retry_backoff_ms,
            page_goto_timeout_ms: scheduler.page_goto_timeout_ms,
            host_policies,
        }
    }
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self::from_config(
            &crate::config::SchedulerConfig::default(),
            HostPolicyTable::new(),
        )
    }
}

/// Pre-fetch skip hook; returns a reason to skip a source, or `None`.
pub type SkipFn = Arc<dyn Fn(&PlannedSource) -> Option<String> + Send + Sync>;

/// Never skip.
pub fn skip_none() -> SkipFn {
    Arc::new(|_| None)
}

/// Drain a source queue into fetch results.
///
/// Workers pull FIFO; a worker holds one source until it reaches a terminal
/// result (success, dead, or ladder exhausted). Cancellation is by queue
/// exhaustion only.
pub async fn drain_queue(
    sources: Vec<PlannedSource>,
    options: DrainOptions,
    fetcher: Arc<dyn Fetcher>,
    should_skip: SkipFn,
    events: EventSink,
) -> (DrainStats, Vec<FetchYield>) {
    let queue = Arc::new(Mutex::new(VecDeque::from(sources)));
    let yields: Arc<Mutex<Vec<FetchYield>>> = Arc::new(Mutex::new(Vec::new()));
    let stats = Arc::new(Mutex::new(DrainStats::default()));
    let pacer = Arc::new(HostPacer::new());
    let options = Arc::new(options);

    let worker_count = options.concurrency.max(1);
    let workers = (0..worker_count).map(|_| {
        let queue = Arc::clone(&queue);
        let yields = Arc::clone(&yields);
        let stats = Arc::clone(&stats);
        let pacer = Arc::clone(&pacer);
        let options = Arc::clone(&options);
        let fetcher = Arc::clone(&fetcher);
        let should_skip = Arc::clone(&should_skip);
        let events = events.clone();

        async move {
            loop {
                let source = {
                    let mut q = queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    q.pop_front()
                };
                let Some(source) = source else { break };

                if let Some(reason) = should_skip(&source) {
                    debug!(url = %source.url, %reason, "skipping source");
                    stats
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .skipped += 1;
                    continue;
                }

                events.emit(
                    HarvestEvent::new(HarvestEventType::SchedulerTick, 0, "fetching")
                        .with_metadata("url", source.url.clone()),
                );

                let yielded =
                    fetch_with_ladder(&source, &options, &pacer, fetcher.as_ref(), &events).await;

                {
                    let mut s = stats
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    if yielded.result.error.is_none() {
                        s.processed += 1;
                    } else {
                        s.failed += 1;
                    }
                }
                yields
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push(yielded);
            }
        }
    });

    futures::future::join_all(workers).await;

    let stats = *stats
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let yields = std::mem::take(
        &mut *yields
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner),
    );

    events.emit(
        HarvestEvent::new(HarvestEventType::SchedulerDrainCompleted, 0, "drain completed")
            .with_metadata("processed", stats.processed as u64)
            .with_metadata("failed", stats.failed as u64)
            .with_metadata("skipped", stats.skipped as u64),
    );
    (stats, yields)
}

/// Walk one source through retries and the mode ladder to a terminal result.
async fn fetch_with_ladder(
    source: &PlannedSource,
    options: &DrainOptions,
    pacer: &HostPacer,
    fetcher: &dyn Fetcher,
    events: &EventSink,
) -> FetchYield {
    let delay = Duration::from_millis(
        options
            .host_policies
            .per_host_delay_ms(&source.host, options.per_host_delay_ms),
    );
    let retry_budget = options
        .host_policies
        .retry_budget(&source.host, options.max_retries);
    let backoff_ms = options
        .host_policies
        .get(&source.host)
        .and_then(|p| p.retry_backoff_ms)
        .unwrap_or(options.retry_backoff_ms);
    let timeout_ms = options
        .host_policies
        .get(&source.host)
        .and_then(|p| p.page_goto_timeout_ms)
        .unwrap_or(options.page_goto_timeout_ms);

    let mut mode = options.initial_mode;
    let mut degraded_from: Option<FetchMode> = None;
    let mut last_error: Option<Error> = None;

    'ladder: loop {
        let mut attempt: u32 = 0;
        let outcome = 'first: {
            let waited = pacer.acquire(&source.host, delay).await;
            if waited > Duration::ZERO {
                events.emit(
                    HarvestEvent::new(HarvestEventType::SchedulerHostWait, 0, "host pacer wait")
                        .with_metadata("host", source.host.clone())
                        .with_metadata("waited_ms", waited.as_millis() as u64),
                );
            }

            let request = FetchRequest {
                url: source.url.clone(),
                host: source.host.clone(),
                mode,
                timeout_ms,
            };
            match fetcher.fetch(request).await {
                Ok(page) => {
                    let result = FetchResult::from_page(&page, mode, degraded_from);
                    if result.ok || result.dead {
                        if degraded_from.is_some() {
                            events.emit(
                                HarvestEvent::new(
                                    HarvestEventType::SchedulerFallbackSucceeded,
                                    0,
                                    "fallback mode succeeded",
                                )
                                .with_metadata("url", source.url.clone())
                                .with_metadata("mode", mode.to_string()),
                            );
                        }
                        return FetchYield {
                            source: source.clone(),
                            result,
                            page: Some(page),
                        };
                    }
                    match classify_status(page.status) {
                        // Dead statuses were handled above; NotFound here is
                        // unreachable but aborts all the same.
                        Some(FetchOutcome::NotFound) | None => {
                            return FetchYield {
                                source: source.clone(),
                                result,
                                page: Some(page),
                            };
                        }
                        Some(outcome) => {
                            last_error = Some(Error::fetch(
                                &source.url,
                                format!("status {}", page.status),
                            ));
                            break 'first outcome;
                        }
                    }
                }
                Err(error) => {
                    let outcome = classify_error(&error);
                    if outcome == FetchOutcome::NotFound {
                        let result = FetchResult::from_error(&source.url, &error, mode, degraded_from);
                        return FetchYield {
                            source: source.clone(),
                            result,
                            page: None,
                        };
                    }
                    last_error = Some(error);
                    break 'first outcome;
                }
            }
        };

        // Retry in the same mode for transient outcomes.
        if matches!(
            outcome,
            FetchOutcome::RateLimited | FetchOutcome::FetchError | FetchOutcome::ParseError
        ) {
            while attempt < retry_budget {
                attempt += 1;
                let backoff =
                    Duration::from_millis(backoff_ms.saturating_mul(1u64 << (attempt - 1).min(16)));
                debug!(url = %source.url, ?mode, attempt, ?backoff, "retrying after backoff");
                tokio::time::sleep(backoff).await;

                pacer.acquire(&source.host, delay).await;
                let request = FetchRequest {
                    url: source.url.clone(),
                    host: source.host.clone(),
                    mode,
                    timeout_ms,
                };
                match fetcher.fetch(request).await {
                    Ok(page) => {
                        let result = FetchResult::from_page(&page, mode, degraded_from);
                        if result.ok || result.dead {
                            return FetchYield {
                                source: source.clone(),
                                result,
                                page: Some(page),
                            };
                        }
                        if classify_status(page.status).is_none() {
                            return FetchYield {
                                source: source.clone(),
                                result,
                                page: Some(page),
                            };
                        }
                        last_error =
                            Some(Error::fetch(&source.url, format!("status {}", page.status)));
                    }
                    Err(error) => {
                        if classify_error(&error) == FetchOutcome::NotFound {
                            let result =
                                FetchResult::from_error(&source.url, &error, mode, degraded_from);
                            return FetchYield {
                                source: source.clone(),
                                result,
                                page: None,
                            };
                        }
                        last_error = Some(error);
                    }
                }
            }
        }

        // Escalate to the next mode.
        match mode.next_fallback() {
            Some(next) => {
                events.emit(
                    HarvestEvent::new(
                        HarvestEventType::SchedulerFallbackStarted,
                        0,
                        "escalating fetch mode",
                    )
                    .with_metadata("url", source.url.clone())
                    .with_metadata("from", mode.to_string())
                    .with_metadata("to", next.to_string()),
                );
                degraded_from.get_or_insert(options.initial_mode);
                mode = next;
                continue 'ladder;
            }
            None => {
                warn!(url = %source.url, "fallback ladder exhausted");
                events.emit(
                    HarvestEvent::new(
                        HarvestEventType::SchedulerFallbackExhausted,
                        0,
                        "all fetch modes failed",
                    )
                    .with_metadata("url", source.url.clone()),
                );
                let error = last_error
                    .unwrap_or_else(|| Error::fetch(&source.url, "fallback exhausted"));
                let result = FetchResult::from_error(&source.url, &error, mode, degraded_from);
                return FetchYield {
                    source: source.clone(),
                    result,
                    page: None,
                };
            }
        }
    }
}
