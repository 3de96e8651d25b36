//! Desired-state reconciliation engine
//!
//! Maintains convergence between an external desired state and the handlers'
//! local state. See SPEC_FULL.md §4.1.

use crate::error::{AggregateError, Result};
use crate::state::{diff, DriftReport, StateDiff, StateResponse};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Provides current desired state and accepts drift reports. External
/// collaborator — the control-plane client — specified only at this seam
/// (SPEC_FULL.md §6.1).
#[async_trait]
pub trait StateFetcher: Send + Sync {
    /// Fetch the current desired state for `node_id`.
    async fn fetch_state(&self, node_id: &str) -> Result<StateResponse>;
    /// Report drift corrections applied during a cycle. Best-effort.
    async fn report_drift(&self, node_id: &str, report: DriftReport) -> Result<()>;
}

/// A subsystem's bridge between the reconciler and its own driver.
///
/// Implementations must be safe to call with an empty diff, must not retain
/// references to `desired` past the call, and are never invoked concurrently
/// with themselves by the same reconciler instance.
#[async_trait]
pub trait ReconcileHandler: Send + Sync {
    /// Human-readable name, used in logs.
    fn name(&self) -> &str;

    /// Reconcile this subsystem against `desired`/`diff`. Return `Some(summary)`
    /// if a correction was applied (surfaced in the cycle's drift report).
    async fn reconcile(&self, desired: &StateResponse, diff: &StateDiff) -> Result<Option<String>>;
}

/// The reason the reconciler loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The cancellation token was triggered.
    Cancelled,
}

/// Periodic + trigger-driven reconciliation loop.
pub struct Reconciler {
    fetcher: Arc<dyn StateFetcher>,
    handlers: Mutex<Vec<Arc<dyn ReconcileHandler>>>,
    previous: Mutex<StateResponse>,
    interval: Duration,
    trigger: Arc<Notify>,
}

impl Reconciler {
    /// Create a new reconciler that reconciles on `interval` at minimum.
    pub fn new(fetcher: Arc<dyn StateFetcher>, interval: Duration) -> Self {
        Self {
            fetcher,
            handlers: Mutex::new(Vec::new()),
            previous: Mutex::new(StateResponse::default()),
            interval,
            trigger: Arc::new(Notify::new()),
        }
    }

    /// Append a handler to the ordered handler list. Must be called before `run`.
    pub async fn register_handler(&self, handler: Arc<dyn ReconcileHandler>) {
        self.handlers.lock().await.push(handler);
    }

    /// Non-blocking; signals the loop to run a cycle promptly. Multiple
    /// triggers between cycles coalesce into one (`Notify::notify_one`'s
    /// single-permit semantics).
    pub fn trigger_reconcile(&self) {
        self.trigger.notify_one();
    }

    /// Enter the loop; returns only when `token` is cancelled.
    pub async fn run(&self, token: CancellationToken, node_id: &str) -> StopReason {
        let mut first_cycle = true;

        loop {
            self.run_cycle(node_id, first_cycle).await;
            first_cycle = false;

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.trigger.notified() => {}
                _ = token.cancelled() => {
                    info!("reconciler: cancellation received, exiting loop");
                    return StopReason::Cancelled;
                }
            }
        }
    }

    async fn run_cycle(&self, node_id: &str, first_cycle: bool) {
        let current = match self.fetcher.fetch_state(node_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!("reconciler: fetch_state failed: {}", e);
                return;
            }
        };

        let mut previous = self.previous.lock().await;
        let cycle_diff = diff(&previous, &current);

        if !cycle_diff.is_empty() || first_cycle {
            let handlers = self.handlers.lock().await;
            let mut aggregate = AggregateError::new();
            let mut corrections = std::collections::HashMap::new();

            for handler in handlers.iter() {
                match handler.reconcile(&current, &cycle_diff).await {
                    Ok(Some(summary)) => {
                        corrections.insert(handler.name().to_string(), summary);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!("reconciler: handler '{}' failed: {}", handler.name(), e);
                        aggregate.push(e);
                    }
                }
            }
            drop(handlers);

            if let Err(e) = aggregate.into_result() {
                debug!("reconciler: cycle had handler errors: {}", e);
            }

            if !cycle_diff.is_empty() && !corrections.is_empty() {
                let report = DriftReport { corrections };
                if let Err(e) = self.fetcher.report_drift(node_id, report).await {
                    debug!("reconciler: report_drift failed (best-effort): {}", e);
                }
            }
        }

        *previous = current;
    }
}

/// `ReportMetrics`/`ReportLogs`/`ReportAudit` — the Reporter family consumed
/// by the buffered batch reporter (SPEC_FULL.md §6.1, §4.9).
#[async_trait]
pub trait Reporter<T>: Send + Sync {
    /// Ship a batch of records. Errors cause the batch to be re-queued.
    async fn report(&self, node_id: &str, batch: &[T]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Peer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        calls: AtomicUsize,
        state: StateResponse,
    }

    #[async_trait]
    impl StateFetcher for CountingFetcher {
        async fn fetch_state(&self, _node_id: &str) -> Result<StateResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.state.clone())
        }
        async fn report_drift(&self, _node_id: &str, _report: DriftReport) -> Result<()> {
            Ok(())
        }
    }

    struct RecordingHandler {
        seen_diffs: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl ReconcileHandler for RecordingHandler {
        fn name(&self) -> &str {
            "recording"
        }
        async fn reconcile(
            &self,
            _desired: &StateResponse,
            diff: &StateDiff,
        ) -> Result<Option<String>> {
            self.seen_diffs.lock().await.push(diff.is_empty());
            Ok(None)
        }
    }

    #[tokio::test]
    async fn s6_coalesces_triggers_within_one_cycle() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            state: StateResponse::default(),
        });
        let reconciler = Arc::new(Reconciler::new(fetcher.clone(), Duration::from_secs(3600)));

        let token = CancellationToken::new();
        let run_token = token.clone();
        let r = reconciler.clone();
        let handle = tokio::spawn(async move {
            r.run(run_token, "node-a").await;
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        for _ in 0..20 {
            reconciler.trigger_reconcile();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        let _ = handle.await;

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn initial_cycle_runs_handlers_even_with_empty_diff() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            state: StateResponse::default(),
        });
        let reconciler = Reconciler::new(fetcher, Duration::from_secs(3600));
        let handler = Arc::new(RecordingHandler {
            seen_diffs: Mutex::new(Vec::new()),
        });
        reconciler.register_handler(handler.clone()).await;

        let token = CancellationToken::new();
        let run_token = token.clone();
        let handle = tokio::spawn(async move {
            reconciler.run(run_token, "node-a").await;
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        token.cancel();
        let _ = handle.await;

        assert_eq!(handler.seen_diffs.lock().await.len(), 1);
    }

    #[test]
    fn peer_ids_distinguish_by_string() {
        let p = Peer {
            id: "peer-a".to_string(),
            public_key: "x".to_string(),
            mesh_ip: "10.0.0.1".to_string(),
            endpoint: String::new(),
            allowed_ips: vec![],
            preshared_key: None,
        };
        assert_eq!(p.id, "peer-a");
    }
}
