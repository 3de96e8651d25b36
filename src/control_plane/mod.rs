//! Reference control-plane HTTP client
//!
//! The control-plane client is named as an external collaborator in
//! SPEC_FULL.md §1/§6.1 — its interfaces (`StateFetcher`, the `Reporter`
//! family) are the hard core; a concrete implementation against them is
//! explicitly *not* part of the core. This module is the reference HTTP
//! mapping §6.1 describes "useful as an anchor for conformance tests": a
//! thin `reqwest`-backed `StateFetcher`/`Reporter`/SSE event source so
//! `main` has something concrete to run against. None of the reconciler,
//! dispatcher, or subsystem managers depend on this module.
//!
//! Endpoints, verbatim from §6.1: `GET /v1/nodes/{id}/state`,
//! `POST /v1/nodes/{id}/drift`, `POST /v1/nodes/{id}/metrics|logs|audit`,
//! `GET /v1/nodes/{id}/events` (SSE).

use crate::error::{Result, WgAgentError};
use crate::events::{EventDispatcher, SignedEnvelope};
use crate::reconcile::{Reporter, StateFetcher};
use crate::state::{DriftReport, StateResponse};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Percent-encode a path segment (node IDs are operator-controlled but the
/// wire contract still calls for escaping, per §6.1).
fn escape_path_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// HTTP-backed `StateFetcher`/drift reporter against the reference mapping.
pub struct HttpStateFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStateFetcher {
    /// Construct a fetcher against `base_url` (e.g. `https://mesh.example.com`).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl StateFetcher for HttpStateFetcher {
    async fn fetch_state(&self, node_id: &str) -> Result<StateResponse> {
        let url = format!(
            "{}/v1/nodes/{}/state",
            self.base_url,
            escape_path_segment(node_id)
        );
        let response = self.client.get(&url).send().await?;
        let response = response
            .error_for_status()
            .map_err(|e| WgAgentError::ControlApi(format!("fetch_state: {}", e)))?;
        response
            .json::<StateResponse>()
            .await
            .map_err(|e| WgAgentError::ControlApi(format!("fetch_state: invalid response body: {}", e)))
    }

    async fn report_drift(&self, node_id: &str, report: DriftReport) -> Result<()> {
        let url = format!(
            "{}/v1/nodes/{}/drift",
            self.base_url,
            escape_path_segment(node_id)
        );
        self.client
            .post(&url)
            .json(&report)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| WgAgentError::ControlApi(format!("report_drift: {}", e)))?;
        Ok(())
    }
}

/// One of the three telemetry sinks the reference mapping exposes.
#[derive(Debug, Clone, Copy)]
pub enum TelemetryKind {
    /// `POST /v1/nodes/{id}/metrics`
    Metrics,
    /// `POST /v1/nodes/{id}/logs`
    Logs,
    /// `POST /v1/nodes/{id}/audit`
    Audit,
}

impl TelemetryKind {
    fn path_segment(self) -> &'static str {
        match self {
            TelemetryKind::Metrics => "metrics",
            TelemetryKind::Logs => "logs",
            TelemetryKind::Audit => "audit",
        }
    }
}

/// HTTP-backed `Reporter<T>`, shared by the metrics/logs/audit buffered
/// batch reporters (`telemetry::BufferedBatchReporter`).
pub struct HttpReporter {
    client: reqwest::Client,
    base_url: String,
    kind: TelemetryKind,
}

impl HttpReporter {
    /// Construct a reporter shipping `kind` batches to `base_url`.
    pub fn new(base_url: impl Into<String>, kind: TelemetryKind) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            kind,
        }
    }
}

#[async_trait]
impl<T: Serialize + Send + Sync> Reporter<T> for HttpReporter {
    async fn report(&self, node_id: &str, batch: &[T]) -> Result<()> {
        let url = format!(
            "{}/v1/nodes/{}/{}",
            self.base_url,
            escape_path_segment(node_id),
            self.kind.path_segment()
        );
        self.client
            .post(&url)
            .json(batch)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| WgAgentError::ControlApi(format!("report ({}): {}", self.kind.path_segment(), e)))?;
        Ok(())
    }
}

/// Run the SSE event source until `token` is cancelled, reconnecting with a
/// fixed backoff on stream errors (the reconciler layer does its own
/// retry/backoff for `FetchState`; this loop mirrors that policy for the
/// push-event side rather than invent a second one).
pub async fn run_event_stream(
    base_url: &str,
    node_id: &str,
    dispatcher: Arc<EventDispatcher>,
    token: CancellationToken,
) {
    let client = reqwest::Client::new();
    let url = format!(
        "{}/v1/nodes/{}/events",
        base_url,
        escape_path_segment(node_id)
    );

    loop {
        if token.is_cancelled() {
            return;
        }

        let response = tokio::select! {
            _ = token.cancelled() => return,
            r = client.get(&url).send() => r,
        };

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                warn!("control plane: event stream connect failed: {}", e);
                sleep_or_cancel(Duration::from_secs(5), &token).await;
                continue;
            }
        };

        let mut stream = response.bytes_stream();
        let mut buffer = Vec::new();

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                chunk = stream.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            buffer.extend_from_slice(&bytes);
                            consume_sse_frames(&mut buffer, &dispatcher).await;
                        }
                        Some(Err(e)) => {
                            warn!("control plane: event stream read error: {}", e);
                            break;
                        }
                        None => {
                            debug!("control plane: event stream closed by server");
                            break;
                        }
                    }
                }
            }
        }

        sleep_or_cancel(Duration::from_secs(5), &token).await;
    }
}

async fn sleep_or_cancel(duration: Duration, token: &CancellationToken) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

/// Split buffered bytes into `\n\n`-terminated SSE frames, dispatching each
/// `data: ...` line as one `SignedEnvelope`. Partial trailing data is left
/// in `buffer` for the next chunk.
async fn consume_sse_frames(buffer: &mut Vec<u8>, dispatcher: &Arc<EventDispatcher>) {
    loop {
        let Some(pos) = find_double_newline(buffer) else {
            return;
        };
        let frame: Vec<u8> = buffer.drain(..pos + 2).collect();
        let text = String::from_utf8_lossy(&frame);

        for line in text.lines() {
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            match serde_json::from_str::<SignedEnvelope>(data) {
                Ok(envelope) => {
                    if let Err(e) = dispatcher.dispatch(&envelope).await {
                        warn!("control plane: event dispatch failed: {}", e);
                    }
                }
                Err(e) => {
                    error!("control plane: malformed SSE envelope dropped: {}", e);
                }
            }
        }
    }
}

fn find_double_newline(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_path_segment_percent_encodes_reserved_bytes() {
        assert_eq!(escape_path_segment("node-a"), "node-a");
        assert_eq!(escape_path_segment("node a/b"), "node%20a%2Fb");
    }

    #[tokio::test]
    async fn consume_sse_frames_dispatches_complete_frames_only() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let mut buffer = b"data: {\"event_type\":\"policy_updated\",\"event_id\":\"e1\",\"payload\":null}\n\n".to_vec();
        consume_sse_frames(&mut buffer, &dispatcher).await;
        assert!(buffer.is_empty());

        let mut partial = b"data: {\"event_type\":".to_vec();
        consume_sse_frames(&mut partial, &dispatcher).await;
        assert!(!partial.is_empty());
    }
}
