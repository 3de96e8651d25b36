//! TCP ingress manager
//!
//! Per-rule listeners proxying into a target, with optional TLS termination
//! (SPEC_FULL.md §4.7).

use crate::error::{AggregateError, Result, WgAgentError};
use crate::reconcile::ReconcileHandler;
use crate::state::{IngressConfig, IngressRule, StateDiff, StateResponse};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A configured ingress rule as the manager understands it.
#[derive(Debug, Clone)]
pub struct IngressRuleSpec {
    /// Rule identifier.
    pub id: String,
    /// Listen port, 0 = OS-assigned.
    pub listen_port: u16,
    /// Target "host:port" to proxy into.
    pub target: String,
    /// Whether to terminate TLS at this listener.
    pub terminate_tls: bool,
    /// PEM-encoded certificate chain, required when `terminate_tls`.
    pub tls_cert_pem: Option<String>,
    /// PEM-encoded private key, required when `terminate_tls`.
    pub tls_key_pem: Option<String>,
    /// Dial timeout for the target connection.
    pub dial_timeout: Duration,
}

struct ActiveRule {
    listen_addr: std::net::SocketAddr,
    cancel: CancellationToken,
    done: oneshot::Receiver<()>,
    live_connections: Arc<AtomicUsize>,
}

/// Owns every active ingress listener.
pub struct IngressManager {
    max_rules: usize,
    dial_timeout: Duration,
    active: Mutex<HashMap<String, ActiveRule>>,
    tracked: Mutex<HashMap<String, IngressRule>>,
}

impl IngressManager {
    /// Construct a manager allowing at most `max_rules` concurrent rules,
    /// applying `dial_timeout` to rules installed via `reconcile_config`.
    pub fn new(max_rules: usize, dial_timeout: Duration) -> Self {
        Self {
            max_rules,
            dial_timeout,
            active: Mutex::new(HashMap::new()),
            tracked: Mutex::new(HashMap::new()),
        }
    }

    /// Number of active rules.
    pub async fn rule_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Add a rule: validate TLS material (if terminating), bind the
    /// listener, and start its accept loop. Fails without creating a
    /// listener if certs are invalid, the rule ID is a duplicate, or
    /// capacity is reached.
    pub async fn add_rule(&self, spec: IngressRuleSpec) -> Result<std::net::SocketAddr> {
        let mut active = self.active.lock().await;
        if active.contains_key(&spec.id) {
            return Err(WgAgentError::Validation(format!(
                "ingress: duplicate rule id '{}'",
                spec.id
            )));
        }
        if active.len() >= self.max_rules {
            return Err(WgAgentError::Capacity(format!(
                "ingress: at capacity ({} rules)",
                self.max_rules
            )));
        }

        let acceptor = if spec.terminate_tls {
            Some(build_tls_acceptor(&spec)?)
        } else {
            None
        };

        let listener = TcpListener::bind(("0.0.0.0", spec.listen_port))
            .await
            .map_err(|e| WgAgentError::Driver(format!("ingress: failed to bind listener: {}", e)))?;
        let listen_addr = listener
            .local_addr()
            .map_err(|e| WgAgentError::Driver(format!("ingress: failed to read local addr: {}", e)))?;

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();
        let live_connections = Arc::new(AtomicUsize::new(0));

        let task_cancel = cancel.clone();
        let task_target = spec.target.clone();
        let task_dial_timeout = spec.dial_timeout;
        let task_counter = live_connections.clone();
        let rule_id = spec.id.clone();

        tokio::spawn(async move {
            accept_loop(listener, acceptor, task_target, task_dial_timeout, task_cancel, task_counter).await;
            debug!("ingress: accept loop for rule '{}' exited", rule_id);
            let _ = done_tx.send(());
        });

        active.insert(
            spec.id.clone(),
            ActiveRule {
                listen_addr,
                cancel,
                done: done_rx,
                live_connections,
            },
        );

        info!("ingress: rule '{}' listening on {}", spec.id, listen_addr);
        Ok(listen_addr)
    }

    /// Remove a rule by ID: cancel its accept loop, wait for it to exit.
    /// Idempotent if unknown.
    pub async fn remove_rule(&self, id: &str) -> Result<()> {
        let rule = self.active.lock().await.remove(id);
        let Some(rule) = rule else {
            return Ok(());
        };
        rule.cancel.cancel();
        let _ = rule.done.await;
        Ok(())
    }

    /// Remove every rule, waiting for all accept loops to exit. Aggregates
    /// errors. Idempotent.
    pub async fn teardown(&self) -> Result<()> {
        let ids: Vec<String> = self.active.lock().await.keys().cloned().collect();
        let mut aggregate = AggregateError::new();
        for id in ids {
            if let Err(e) = self.remove_rule(&id).await {
                aggregate.push(e);
            }
        }
        aggregate.into_result()
    }

    /// Listen address of an active rule, if present.
    pub async fn listen_addr(&self, id: &str) -> Option<std::net::SocketAddr> {
        self.active.lock().await.get(id).map(|r| r.listen_addr)
    }

    /// Live connection count for an active rule, if present.
    pub async fn live_connections(&self, id: &str) -> Option<usize> {
        self.active
            .lock()
            .await
            .get(id)
            .map(|r| r.live_connections.load(Ordering::SeqCst))
    }

    /// Snapshot of active rule IDs, for read-only introspection.
    pub async fn rule_ids(&self) -> Vec<String> {
        self.active.lock().await.keys().cloned().collect()
    }

    fn to_spec(&self, rule: &IngressRule) -> IngressRuleSpec {
        IngressRuleSpec {
            id: rule.id.clone(),
            listen_port: rule.listen_port,
            target: rule.target.clone(),
            terminate_tls: rule.mode == "terminate",
            tls_cert_pem: rule.tls_cert_pem.clone(),
            tls_key_pem: rule.tls_key_pem.clone(),
            dial_timeout: self.dial_timeout,
        }
    }

    /// Diff desired rules against the tracked set: remove stale, update
    /// changed (remove-then-add, since a listener's bind/TLS install is a
    /// one-shot sequence), add new (SPEC_FULL.md §4.1.1 — the reconciler
    /// doesn't diff ingress config structurally, so the manager diffs its
    /// own state against `IngressConfig` on every invocation). Aggregates
    /// errors.
    pub async fn reconcile_config(&self, config: &IngressConfig) -> Result<usize> {
        if !config.enabled {
            return Ok(0);
        }

        let desired: HashMap<String, IngressRule> =
            config.rules.iter().map(|r| (r.id.clone(), r.clone())).collect();
        let tracked_ids: Vec<String> = self.tracked.lock().await.keys().cloned().collect();

        let mut aggregate = AggregateError::new();
        let mut changed = 0usize;

        for id in &tracked_ids {
            if !desired.contains_key(id) {
                if let Err(e) = self.remove_rule(id).await {
                    aggregate.push(e);
                    continue;
                }
                self.tracked.lock().await.remove(id);
                changed += 1;
            }
        }

        for rule in &config.rules {
            let needs_update = {
                let tracked = self.tracked.lock().await;
                match tracked.get(&rule.id) {
                    None => true,
                    Some(existing) => existing != rule,
                }
            };
            if !needs_update {
                continue;
            }
            if self.tracked.lock().await.contains_key(&rule.id) {
                if let Err(e) = self.remove_rule(&rule.id).await {
                    aggregate.push(e);
                    continue;
                }
                self.tracked.lock().await.remove(&rule.id);
            }
            match self.add_rule(self.to_spec(rule)).await {
                Ok(_) => {
                    self.tracked.lock().await.insert(rule.id.clone(), rule.clone());
                    changed += 1;
                }
                Err(e) => aggregate.push(e),
            }
        }

        aggregate.into_result()?;
        Ok(changed)
    }
}

#[async_trait]
impl ReconcileHandler for IngressManager {
    fn name(&self) -> &str {
        "ingress"
    }

    async fn reconcile(&self, desired: &StateResponse, diff: &StateDiff) -> Result<Option<String>> {
        let drift_signal = !diff.peers_to_add.is_empty()
            || !diff.peers_to_update.is_empty()
            || !diff.peers_to_remove.is_empty()
            || diff.metadata_changed;
        if !drift_signal {
            return Ok(None);
        }

        let changed = self.reconcile_config(&desired.ingress).await?;
        if changed == 0 {
            Ok(None)
        } else {
            Ok(Some(format!("{} ingress rule(s) reconciled", changed)))
        }
    }
}

fn build_tls_acceptor(spec: &IngressRuleSpec) -> Result<tokio_rustls::TlsAcceptor> {
    let cert_pem = spec
        .tls_cert_pem
        .as_ref()
        .ok_or_else(|| WgAgentError::Config("ingress: terminate mode requires tls_cert_pem".to_string()))?;
    let key_pem = spec
        .tls_key_pem
        .as_ref()
        .ok_or_else(|| WgAgentError::Config("ingress: terminate mode requires tls_key_pem".to_string()))?;

    let mut cert_reader = std::io::BufReader::new(cert_pem.as_bytes());
    let certs: Vec<rustls_pemfile::pki_types::CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| WgAgentError::Config(format!("ingress: invalid certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(WgAgentError::Config("ingress: no certificates found in tls_cert_pem".to_string()));
    }

    let mut key_reader = std::io::BufReader::new(key_pem.as_bytes());
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| WgAgentError::Config(format!("ingress: invalid private key PEM: {}", e)))?
        .ok_or_else(|| WgAgentError::Config("ingress: no private key found in tls_key_pem".to_string()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| WgAgentError::Config(format!("ingress: invalid TLS certificate/key pair: {}", e)))?;

    Ok(tokio_rustls::TlsAcceptor::from(Arc::new(config)))
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<tokio_rustls::TlsAcceptor>,
    target: String,
    dial_timeout: Duration,
    cancel: CancellationToken,
    live_connections: Arc<AtomicUsize>,
) {
    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = cancel.cancelled() => {
                debug!("ingress: accept loop cancelled");
                return;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => v,
            Err(e) => {
                debug!("ingress: accept loop exiting on accept error: {}", e);
                return;
            }
        };

        live_connections.fetch_add(1, Ordering::SeqCst);
        let target = target.clone();
        let acceptor = acceptor.clone();
        let counter = live_connections.clone();
        let proxy_cancel = cancel.clone();

        tokio::spawn(async move {
            if let Some(acceptor) = acceptor {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        proxy(tls_stream, &target, dial_timeout, proxy_cancel).await;
                    }
                    Err(e) => warn!("ingress: TLS handshake with {} failed: {}", peer_addr, e),
                }
            } else {
                proxy(stream, &target, dial_timeout, proxy_cancel).await;
            }
            counter.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

async fn proxy<S>(mut client: S, target: &str, dial_timeout: Duration, cancel: CancellationToken)
where
    S: io::AsyncRead + io::AsyncWrite + Unpin,
{
    let dial = tokio::time::timeout(dial_timeout, TcpStream::connect(target)).await;
    let mut upstream = match dial {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("ingress: failed to dial target {}: {}", target, e);
            let _ = client.shutdown().await;
            return;
        }
        Err(_) => {
            warn!("ingress: dial to {} timed out", target);
            let _ = client.shutdown().await;
            return;
        }
    };

    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut upstream_r, mut upstream_w) = upstream.split();

    let client_to_upstream = async {
        let _ = tokio::io::copy(&mut client_r, &mut upstream_w).await;
        let _ = upstream_w.shutdown().await;
    };
    let upstream_to_client = async {
        let _ = tokio::io::copy(&mut upstream_r, &mut client_w).await;
        let _ = client_w.shutdown().await;
    };

    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
        _ = cancel.cancelled() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt as _;
    use tokio::net::TcpListener as TestListener;

    async fn spawn_echo_server() -> std::net::SocketAddr {
        let listener = TestListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(v) => v,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        let n = match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        if socket.write_all(&buf[..n]).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn s5_proxies_plain_tcp_echo_and_closes_after_remove() {
        let echo_addr = spawn_echo_server().await;
        let manager = IngressManager::new(8, Duration::from_secs(5));

        let listen_addr = manager
            .add_rule(IngressRuleSpec {
                id: "r1".to_string(),
                listen_port: 0,
                target: echo_addr.to_string(),
                terminate_tls: false,
                tls_cert_pem: None,
                tls_key_pem: None,
                dial_timeout: Duration::from_secs(5),
            })
            .await
            .unwrap();

        let mut client = TcpStream::connect(listen_addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        drop(client);

        manager.remove_rule("r1").await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), TcpStream::connect(listen_addr)).await;
        match result {
            Ok(Ok(_)) => panic!("expected connection to fail after remove_rule"),
            _ => {}
        }
    }

    #[tokio::test]
    async fn add_rule_rejects_duplicate_id() {
        let echo_addr = spawn_echo_server().await;
        let manager = IngressManager::new(8, Duration::from_secs(5));

        let spec = IngressRuleSpec {
            id: "dup".to_string(),
            listen_port: 0,
            target: echo_addr.to_string(),
            terminate_tls: false,
            tls_cert_pem: None,
            tls_key_pem: None,
            dial_timeout: Duration::from_secs(5),
        };
        manager.add_rule(spec.clone()).await.unwrap();
        assert!(manager.add_rule(spec).await.is_err());
        manager.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn add_rule_rejects_terminate_mode_without_cert() {
        let manager = IngressManager::new(8, Duration::from_secs(5));
        let result = manager
            .add_rule(IngressRuleSpec {
                id: "r1".to_string(),
                listen_port: 0,
                target: "127.0.0.1:1".to_string(),
                terminate_tls: true,
                tls_cert_pem: None,
                tls_key_pem: None,
                dial_timeout: Duration::from_secs(5),
            })
            .await;
        assert!(result.is_err());
        assert_eq!(manager.rule_count().await, 0);
    }

    #[tokio::test]
    async fn add_rule_enforces_capacity() {
        let echo_addr = spawn_echo_server().await;
        let manager = IngressManager::new(1, Duration::from_secs(5));

        manager
            .add_rule(IngressRuleSpec {
                id: "r1".to_string(),
                listen_port: 0,
                target: echo_addr.to_string(),
                terminate_tls: false,
                tls_cert_pem: None,
                tls_key_pem: None,
                dial_timeout: Duration::from_secs(5),
            })
            .await
            .unwrap();

        let result = manager
            .add_rule(IngressRuleSpec {
                id: "r2".to_string(),
                listen_port: 0,
                target: echo_addr.to_string(),
                terminate_tls: false,
                tls_cert_pem: None,
                tls_key_pem: None,
                dial_timeout: Duration::from_secs(5),
            })
            .await;
        assert!(matches!(result, Err(WgAgentError::Capacity(_))));
        manager.teardown().await.unwrap();
    }
}
