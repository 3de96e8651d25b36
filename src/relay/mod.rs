//! UDP relay
//!
//! Forwards UDP datagrams between peers that can't reach each other
//! directly, identified by their source endpoints (SPEC_FULL.md §4.6).

use crate::error::{AggregateError, Result, WgAgentError};
use crate::reconcile::ReconcileHandler;
use crate::state::{RelayConfig, RelaySession, StateDiff, StateResponse};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A live relay session between two endpoints.
#[derive(Debug, Clone)]
struct Session {
    id: String,
    peer_a: SocketAddr,
    peer_b: SocketAddr,
    closed: Arc<AtomicBool>,
}

/// A newly-assigned relay session, as delivered by the control plane (§3
/// `RelaySessionAssignment`).
#[derive(Debug, Clone)]
pub struct RelaySessionAssignment {
    /// Session identifier, unique within this relay.
    pub id: String,
    /// Peer A's UDP endpoint.
    pub peer_a: SocketAddr,
    /// Peer B's UDP endpoint.
    pub peer_b: SocketAddr,
    /// Absolute expiry.
    pub expiry: std::time::SystemTime,
}

struct Sessions {
    by_id: HashMap<String, Session>,
    by_addr: HashMap<SocketAddr, Session>,
    timers: HashMap<String, JoinHandle<()>>,
}

impl Default for Sessions {
    fn default() -> Self {
        Self {
            by_id: HashMap::new(),
            by_addr: HashMap::new(),
            timers: HashMap::new(),
        }
    }
}

/// UDP relay. `max_sessions` bounds concurrent sessions; `default_ttl`
/// bounds how long a session lives absent an earlier control-plane expiry.
pub struct Relay {
    sessions: Arc<RwLock<Sessions>>,
    max_sessions: usize,
    default_ttl: Duration,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    dispatch_task: RwLock<Option<JoinHandle<()>>>,
}

impl Relay {
    /// Construct a relay with the given capacity and default session TTL.
    pub fn new(max_sessions: usize, default_ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(Sessions::default())),
            max_sessions,
            default_ttl,
            socket: RwLock::new(None),
            dispatch_task: RwLock::new(None),
        }
    }

    /// Bind a UDP socket on `listen_port` (0 = OS-assigned) and spawn the
    /// dispatch loop. Returns the bound local address.
    pub async fn start(&self, listen_port: u16) -> Result<SocketAddr> {
        let socket = UdpSocket::bind(("0.0.0.0", listen_port))
            .await
            .map_err(|e| WgAgentError::Driver(format!("relay: failed to bind UDP socket: {}", e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| WgAgentError::Driver(format!("relay: failed to read local addr: {}", e)))?;
        let socket = Arc::new(socket);

        *self.socket.write().await = Some(socket.clone());

        let sessions = self.sessions.clone();
        let handle = tokio::spawn(async move {
            Self::dispatch_loop(socket, sessions).await;
        });
        *self.dispatch_task.write().await = Some(handle);

        info!("relay: listening on {}", local_addr);
        Ok(local_addr)
    }

    async fn dispatch_loop(socket: Arc<UdpSocket>, sessions: Arc<RwLock<Sessions>>) {
        let mut buf = [0u8; 65535];
        loop {
            let (len, src) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    debug!("relay: dispatch loop exiting: {}", e);
                    return;
                }
            };

            let session = {
                let guard = sessions.read().await;
                guard.by_addr.get(&src).cloned()
            };

            let Some(session) = session else {
                debug!("relay: dropping datagram from unknown source {}", src);
                continue;
            };

            if session.closed.load(Ordering::SeqCst) {
                continue;
            }

            let dest = if src == session.peer_a {
                session.peer_b
            } else {
                session.peer_a
            };

            let payload = buf[..len].to_vec();
            if let Err(e) = socket.send_to(&payload, dest).await {
                warn!("relay: send_to({}) failed: {}", dest, e);
            }
        }
    }

    /// Validate and register a new session. Fails if the session ID is
    /// already present, peer endpoints are equal, or capacity is reached.
    /// Starts a TTL timer equal to `min(default_ttl, expiry - now)`.
    pub async fn add_session(&self, assignment: RelaySessionAssignment) -> Result<()> {
        if assignment.id.is_empty() {
            return Err(WgAgentError::Validation("relay: session id must not be empty".to_string()));
        }
        if assignment.peer_a == assignment.peer_b {
            return Err(WgAgentError::Validation(
                "relay: peer_a and peer_b must resolve to different endpoints".to_string(),
            ));
        }

        let mut guard = self.sessions.write().await;
        if guard.by_id.contains_key(&assignment.id) {
            return Err(WgAgentError::Validation(format!(
                "relay: session '{}' already exists",
                assignment.id
            )));
        }
        if guard.by_id.len() >= self.max_sessions {
            return Err(WgAgentError::Capacity(format!(
                "relay: at capacity ({} sessions)",
                self.max_sessions
            )));
        }

        let session = Session {
            id: assignment.id.clone(),
            peer_a: assignment.peer_a,
            peer_b: assignment.peer_b,
            closed: Arc::new(AtomicBool::new(false)),
        };

        guard.by_id.insert(session.id.clone(), session.clone());
        guard.by_addr.insert(session.peer_a, session.clone());
        guard.by_addr.insert(session.peer_b, session.clone());

        let ttl = assignment
            .expiry
            .duration_since(std::time::SystemTime::now())
            .unwrap_or(Duration::ZERO)
            .min(self.default_ttl);

        let sessions = self.sessions.clone();
        let id = assignment.id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            Self::expire_session(sessions, &id).await;
        });
        guard.timers.insert(assignment.id, timer);

        Ok(())
    }

    async fn expire_session(sessions: Arc<RwLock<Sessions>>, id: &str) {
        let mut guard = sessions.write().await;
        if let Some(session) = guard.by_id.remove(id) {
            session.closed.store(true, Ordering::SeqCst);
            guard.by_addr.remove(&session.peer_a);
            guard.by_addr.remove(&session.peer_b);
        }
        guard.timers.remove(id);
        debug!("relay: session '{}' expired", id);
    }

    /// Remove a session by ID: stop its timer, remove from all maps, mark
    /// closed. Idempotent; safe to call concurrently with dispatch.
    pub async fn remove_session(&self, id: &str) {
        let mut guard = self.sessions.write().await;
        if let Some(session) = guard.by_id.remove(id) {
            session.closed.store(true, Ordering::SeqCst);
            guard.by_addr.remove(&session.peer_a);
            guard.by_addr.remove(&session.peer_b);
        }
        if let Some(timer) = guard.timers.remove(id) {
            timer.abort();
        }
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.by_id.len()
    }

    /// Snapshot of live session IDs, for read-only introspection.
    pub async fn session_ids(&self) -> Vec<String> {
        self.sessions.read().await.by_id.keys().cloned().collect()
    }

    async fn session_endpoints(&self, id: &str) -> Option<(SocketAddr, SocketAddr)> {
        self.sessions
            .read()
            .await
            .by_id
            .get(id)
            .map(|s| (s.peer_a, s.peer_b))
    }

    /// Diff desired sessions against the live session table: remove stale,
    /// update changed (remove-then-add, since endpoints are fixed at
    /// assignment time), add new (SPEC_FULL.md §4.1.1 — the reconciler
    /// doesn't diff relay config structurally, so the relay diffs its own
    /// state against `RelayConfig` on every invocation). Aggregates errors.
    pub async fn reconcile_config(&self, config: &RelayConfig) -> Result<usize> {
        if !config.enabled {
            return Ok(0);
        }

        let desired_ids: HashSet<&str> = config.sessions.iter().map(|s| s.id.as_str()).collect();
        let tracked_ids = self.session_ids().await;

        let mut aggregate = AggregateError::new();
        let mut changed = 0usize;

        for id in &tracked_ids {
            if !desired_ids.contains(id.as_str()) {
                self.remove_session(id).await;
                changed += 1;
            }
        }

        for session in &config.sessions {
            let assignment = match to_assignment(session) {
                Ok(a) => a,
                Err(e) => {
                    aggregate.push(e);
                    continue;
                }
            };

            let needs_update = match self.session_endpoints(&session.id).await {
                None => true,
                Some((a, b)) => a != assignment.peer_a || b != assignment.peer_b,
            };
            if !needs_update {
                continue;
            }
            if self.session_endpoints(&session.id).await.is_some() {
                self.remove_session(&session.id).await;
            }
            match self.add_session(assignment).await {
                Ok(()) => changed += 1,
                Err(e) => aggregate.push(e),
            }
        }

        aggregate.into_result()?;
        Ok(changed)
    }

    /// Stop all timers, drop all sessions, close the socket. Idempotent.
    pub async fn stop(&self) {
        let mut guard = self.sessions.write().await;
        for (_, session) in guard.by_id.drain() {
            session.closed.store(true, Ordering::SeqCst);
        }
        guard.by_addr.clear();
        for (_, timer) in guard.timers.drain() {
            timer.abort();
        }
        drop(guard);

        *self.socket.write().await = None;
        if let Some(task) = self.dispatch_task.write().await.take() {
            task.abort();
        }
    }
}

/// Parse a desired-state `RelaySession` into a dispatch-ready
/// `RelaySessionAssignment`, mirroring the wire-payload parsing in
/// `events::handlers::RelaySessionAssignedHandler`.
fn to_assignment(session: &RelaySession) -> Result<RelaySessionAssignment> {
    let peer_a = session
        .peer_a
        .parse()
        .map_err(|e| WgAgentError::Validation(format!("relay: invalid peer_a endpoint '{}': {}", session.peer_a, e)))?;
    let peer_b = session
        .peer_b
        .parse()
        .map_err(|e| WgAgentError::Validation(format!("relay: invalid peer_b endpoint '{}': {}", session.peer_b, e)))?;
    let expiry = std::time::UNIX_EPOCH + Duration::from_secs(session.expiry_unix.max(0) as u64);
    Ok(RelaySessionAssignment {
        id: session.id.clone(),
        peer_a,
        peer_b,
        expiry,
    })
}

#[async_trait]
impl ReconcileHandler for Relay {
    fn name(&self) -> &str {
        "relay"
    }

    async fn reconcile(&self, desired: &StateResponse, diff: &StateDiff) -> Result<Option<String>> {
        let drift_signal = !diff.peers_to_add.is_empty()
            || !diff.peers_to_update.is_empty()
            || !diff.peers_to_remove.is_empty()
            || diff.metadata_changed;
        if !drift_signal {
            return Ok(None);
        }

        let changed = self.reconcile_config(&desired.relay).await?;
        if changed == 0 {
            Ok(None)
        } else {
            Ok(Some(format!("{} relay session(s) reconciled", changed)))
        }
    }
}
