//! Buffered batch reporter
//!
//! Shared pattern behind metrics, logs, and audit telemetry: collectors are
//! polled on an interval, results buffer in memory, and a separate interval
//! drains the buffer in chunks to a `Reporter` (SPEC_FULL.md §4.9). This
//! generalizes the teacher's single-subsystem `monitoring::metrics::
//! MetricsCollector` into a reusable generic over any record type.

use crate::error::Result;
use crate::reconcile::Reporter;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for one `BufferedBatchReporter` instance.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// How often collectors are polled.
    pub collect_interval: Duration,
    /// How often the buffer is drained and shipped.
    pub report_interval: Duration,
    /// Records per chunk shipped to the reporter.
    pub batch_size: usize,
    /// Buffer capacity cap, expressed as a multiple of `batch_size`
    /// (resolved Open Question 3 — see DESIGN.md). Default `2`.
    pub reporter_capacity_multiplier: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            collect_interval: Duration::from_secs(30),
            report_interval: Duration::from_secs(60),
            batch_size: 100,
            reporter_capacity_multiplier: 2,
        }
    }
}

impl TelemetryConfig {
    /// Effective buffer capacity: `batch_size * reporter_capacity_multiplier`.
    pub fn capacity(&self) -> usize {
        self.batch_size * self.reporter_capacity_multiplier
    }
}

/// A synchronous poll of one telemetry source. Panics inside `collect` are
/// caught; that cycle's output for this collector is dropped and logged.
pub trait Collector<T>: Send + Sync {
    /// Human-readable name, used in logs.
    fn name(&self) -> &str;
    /// Produce zero or more records for this cycle.
    fn collect(&self) -> Vec<T>;
}

/// Generic buffered batch reporter used identically for metrics, logs, and
/// audit records.
pub struct BufferedBatchReporter<T> {
    config: TelemetryConfig,
    collectors: Mutex<Vec<Arc<dyn Collector<T>>>>,
    buffer: Mutex<VecDeque<T>>,
    reporter: Arc<dyn Reporter<T>>,
    node_id: String,
}

impl<T: Send + 'static> BufferedBatchReporter<T> {
    /// Construct a reporter shipping to `reporter` under `node_id`.
    pub fn new(config: TelemetryConfig, reporter: Arc<dyn Reporter<T>>, node_id: impl Into<String>) -> Self {
        Self {
            config,
            collectors: Mutex::new(Vec::new()),
            buffer: Mutex::new(VecDeque::new()),
            reporter,
            node_id: node_id.into(),
        }
    }

    /// Register a collector. Must be called before `run`.
    pub async fn register_collector(&self, collector: Arc<dyn Collector<T>>) {
        self.collectors.lock().await.push(collector);
    }

    /// Current buffered record count.
    pub async fn buffered_len(&self) -> usize {
        self.buffer.lock().await.len()
    }

    async fn collect_cycle(&self)
    where
        T: std::panic::UnwindSafe,
    {
        let collectors = self.collectors.lock().await;
        let mut produced: Vec<T> = Vec::new();

        for collector in collectors.iter() {
            let name = collector.name().to_string();
            let collector = collector.clone();
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| collector.collect())) {
                Ok(records) => produced.extend(records),
                Err(_) => {
                    warn!("telemetry: collector '{}' panicked; dropping this cycle's output", name);
                }
            }
        }
        drop(collectors);

        if produced.is_empty() {
            return;
        }

        let mut buffer = self.buffer.lock().await;
        let capacity = self.config.capacity();
        for record in produced {
            if buffer.len() >= capacity {
                buffer.pop_front();
                warn!("telemetry: buffer at capacity ({}), dropping oldest record", capacity);
            }
            buffer.push_back(record);
        }
    }

    async fn flush_cycle(&self) {
        loop {
            let chunk: Vec<T> = {
                let mut buffer = self.buffer.lock().await;
                if buffer.is_empty() {
                    return;
                }
                let take = self.config.batch_size.min(buffer.len());
                buffer.drain(..take).collect()
            };

            match self.reporter.report(&self.node_id, &chunk).await {
                Ok(()) => {
                    debug!("telemetry: shipped {} record(s)", chunk.len());
                }
                Err(e) => {
                    warn!("telemetry: report failed, re-queuing {} record(s): {}", chunk.len(), e);
                    let mut buffer = self.buffer.lock().await;
                    for record in chunk.into_iter().rev() {
                        buffer.push_front(record);
                    }
                    return;
                }
            }
        }
    }

    /// Run both the collect and report loops until `token` cancels. On
    /// cancellation, performs one best-effort final flush before returning.
    pub async fn run(&self, token: CancellationToken)
    where
        T: std::panic::UnwindSafe,
    {
        let mut collect_tick = tokio::time::interval(self.config.collect_interval);
        let mut report_tick = tokio::time::interval(self.config.report_interval);

        loop {
            tokio::select! {
                _ = collect_tick.tick() => self.collect_cycle().await,
                _ = report_tick.tick() => self.flush_cycle().await,
                _ = token.cancelled() => {
                    info!("telemetry: cancellation received, performing final flush");
                    self.flush_cycle().await;
                    return;
                }
            }
        }
    }
}

/// Ambient health classification, generalized from the teacher's per-network
/// `monitoring::health` module to apply to any subsystem with a
/// connectivity/error-rate signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Fully operational.
    Healthy,
    /// Operational with elevated error rate or latency.
    Degraded,
    /// Not operational.
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        write!(f, "{}", s)
    }
}

/// Classify a subsystem's health from an error rate in `[0.0, 1.0]`.
pub fn classify_health(error_rate: f64) -> HealthStatus {
    if error_rate >= 0.5 {
        HealthStatus::Unhealthy
    } else if error_rate >= 0.1 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[derive(Debug, Clone, PartialEq)]
    struct Record(u32);

    struct FixedCollector {
        values: Vec<u32>,
    }

    impl Collector<Record> for FixedCollector {
        fn name(&self) -> &str {
            "fixed"
        }
        fn collect(&self) -> Vec<Record> {
            self.values.iter().map(|v| Record(*v)).collect()
        }
    }

    struct PanicCollector;
    impl Collector<Record> for PanicCollector {
        fn name(&self) -> &str {
            "panicking"
        }
        fn collect(&self) -> Vec<Record> {
            panic!("collector exploded");
        }
    }

    struct RecordingReporter {
        shipped: Mutex<Vec<Record>>,
        fail_once: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Reporter<Record> for RecordingReporter {
        async fn report(&self, _node_id: &str, batch: &[Record]) -> Result<()> {
            if self.fail_once.swap(false, Ordering::SeqCst) {
                return Err(crate::error::WgAgentError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "simulated failure",
                )));
            }
            self.shipped.lock().await.extend_from_slice(batch);
            Ok(())
        }
    }

    fn config() -> TelemetryConfig {
        TelemetryConfig {
            collect_interval: Duration::from_millis(5),
            report_interval: Duration::from_millis(5),
            batch_size: 2,
            reporter_capacity_multiplier: 2,
        }
    }

    #[tokio::test]
    async fn collect_cycle_buffers_records_and_survives_panicking_collector() {
        let reporter = Arc::new(RecordingReporter {
            shipped: Mutex::new(Vec::new()),
            fail_once: std::sync::atomic::AtomicBool::new(false),
        });
        let batch = BufferedBatchReporter::new(config(), reporter, "node-a");
        batch
            .register_collector(Arc::new(FixedCollector { values: vec![1, 2, 3] }))
            .await;
        batch.register_collector(Arc::new(PanicCollector)).await;

        batch.collect_cycle().await;
        assert_eq!(batch.buffered_len().await, 3);
    }

    #[tokio::test]
    async fn flush_cycle_ships_in_batch_size_chunks() {
        let reporter = Arc::new(RecordingReporter {
            shipped: Mutex::new(Vec::new()),
            fail_once: std::sync::atomic::AtomicBool::new(false),
        });
        let batch = BufferedBatchReporter::new(config(), reporter.clone(), "node-a");
        batch
            .register_collector(Arc::new(FixedCollector {
                values: vec![1, 2, 3, 4, 5],
            }))
            .await;

        batch.collect_cycle().await;
        batch.flush_cycle().await;

        assert_eq!(reporter.shipped.lock().await.len(), 5);
        assert_eq!(batch.buffered_len().await, 0);
    }

    #[tokio::test]
    async fn flush_failure_requeues_chunk() {
        let reporter = Arc::new(RecordingReporter {
            shipped: Mutex::new(Vec::new()),
            fail_once: std::sync::atomic::AtomicBool::new(true),
        });
        let batch = BufferedBatchReporter::new(config(), reporter.clone(), "node-a");
        batch
            .register_collector(Arc::new(FixedCollector { values: vec![1, 2] }))
            .await;

        batch.collect_cycle().await;
        batch.flush_cycle().await;

        assert_eq!(batch.buffered_len().await, 2);
        assert!(reporter.shipped.lock().await.is_empty());
    }

    #[tokio::test]
    async fn capacity_cap_drops_oldest() {
        let reporter = Arc::new(RecordingReporter {
            shipped: Mutex::new(Vec::new()),
            fail_once: std::sync::atomic::AtomicBool::new(false),
        });
        let mut cfg = config();
        cfg.batch_size = 2;
        cfg.reporter_capacity_multiplier = 1;
        let batch = BufferedBatchReporter::new(cfg, reporter, "node-a");
        batch
            .register_collector(Arc::new(FixedCollector {
                values: vec![1, 2, 3, 4],
            }))
            .await;

        batch.collect_cycle().await;
        assert_eq!(batch.buffered_len().await, 2);
        let buffered = batch.buffer.lock().await;
        assert_eq!(buffered.front(), Some(&Record(3)));
    }

    #[test]
    fn classify_health_thresholds() {
        assert_eq!(classify_health(0.0), HealthStatus::Healthy);
        assert_eq!(classify_health(0.2), HealthStatus::Degraded);
        assert_eq!(classify_health(0.9), HealthStatus::Unhealthy);
    }
}
