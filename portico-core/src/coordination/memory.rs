//! In-process coordination ensemble
//!
//! Several client handles share one ensemble, each with its own session, so
//! leader election and session expiry can be exercised inside one process.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use super::client::{child_name, ConnectionState, CoordinationClient, SessionId};
use crate::error::{PorticoError, Result};

struct Node {
    data: Vec<u8>,
    owner: Option<SessionId>,
}

struct EnsembleState {
    nodes: BTreeMap<String, Node>,
    live_sessions: HashSet<SessionId>,
    next_session: u64,
    available: bool,
}

/// Shared node tree standing in for a coordination cluster
pub struct MemoryEnsemble {
    state: Mutex<EnsembleState>,
}

impl MemoryEnsemble {
    /// Create an empty ensemble
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EnsembleState {
                nodes: BTreeMap::new(),
                live_sessions: HashSet::new(),
                next_session: 1,
                available: true,
            }),
        })
    }

    /// Open a client with a fresh session
    pub fn connect(self: &Arc<Self>) -> MemoryCoordination {
        let session = self.open_session();
        let (events, _) = watch::channel(ConnectionState::Connected(session));
        MemoryCoordination {
            ensemble: self.clone(),
            session: Mutex::new(Some(session)),
            events,
        }
    }

    /// Make every call fail (or succeed again) without touching sessions
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Owner session of an ephemeral node
    pub fn node_owner(&self, path: &str) -> Option<SessionId> {
        self.state.lock().nodes.get(path).and_then(|n| n.owner)
    }

    /// Number of stored nodes
    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    fn open_session(&self) -> SessionId {
        let mut state = self.state.lock();
        let session = SessionId(state.next_session);
        state.next_session += 1;
        state.live_sessions.insert(session);
        session
    }

    fn close_session(&self, session: SessionId) {
        let mut state = self.state.lock();
        state.live_sessions.remove(&session);
        state.nodes.retain(|_, node| node.owner != Some(session));
        debug!("Closed session {} and dropped its ephemeral nodes", session);
    }
}

/// Client handle onto a [`MemoryEnsemble`]
pub struct MemoryCoordination {
    ensemble: Arc<MemoryEnsemble>,
    session: Mutex<Option<SessionId>>,
    events: watch::Sender<ConnectionState>,
}

impl MemoryCoordination {
    /// Expire the session: ephemeral nodes vanish and `Lost` is signalled
    pub fn expire_session(&self) {
        if let Some(session) = self.session.lock().take() {
            self.ensemble.close_session(session);
        }
        self.events.send_replace(ConnectionState::Lost);
    }

    /// Interrupt the connection while keeping the session alive
    pub fn suspend(&self) {
        self.events.send_replace(ConnectionState::Suspended);
    }

    /// Restore the connection; opens a new session if the old one expired
    pub fn reconnect(&self) -> SessionId {
        let mut guard = self.session.lock();
        let session = match *guard {
            Some(session) => session,
            None => {
                let session = self.ensemble.open_session();
                *guard = Some(session);
                session
            }
        };
        self.events.send_replace(ConnectionState::Connected(session));
        session
    }

    fn live_session(&self) -> Result<SessionId> {
        match *self.events.borrow() {
            ConnectionState::Connected(session) => Ok(session),
            ConnectionState::Suspended => Err(PorticoError::unavailable("connection suspended")),
            ConnectionState::Lost => Err(PorticoError::unavailable("session lost")),
        }
    }

    fn check_available(&self) -> Result<SessionId> {
        let session = self.live_session()?;
        if !self.ensemble.state.lock().available {
            return Err(PorticoError::unavailable("ensemble unavailable"));
        }
        Ok(session)
    }
}

#[async_trait]
impl CoordinationClient for MemoryCoordination {
    fn session_id(&self) -> Option<SessionId> {
        *self.session.lock()
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        Ok(self.ensemble.state.lock().nodes.get(path).map(|n| n.data.clone()))
    }

    async fn put(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.check_available()?;
        let mut state = self.ensemble.state.lock();
        let owner = state.nodes.get(path).and_then(|n| n.owner);
        state.nodes.insert(path.to_string(), Node { data, owner });
        Ok(())
    }

    async fn create_ephemeral(&self, path: &str, data: Vec<u8>) -> Result<bool> {
        let session = self.check_available()?;
        let mut state = self.ensemble.state.lock();
        if !state.live_sessions.contains(&session) {
            return Err(PorticoError::SessionExpired { session: session.0 });
        }
        if state.nodes.contains_key(path) {
            return Ok(false);
        }
        state.nodes.insert(
            path.to_string(),
            Node {
                data,
                owner: Some(session),
            },
        );
        Ok(true)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check_available()?;
        self.ensemble.state.lock().nodes.remove(path);
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.check_available()?;
        let state = self.ensemble.state.lock();
        let names: BTreeSet<String> = state
            .nodes
            .keys()
            .filter_map(|key| child_name(path, key))
            .map(str::to_string)
            .collect();
        Ok(names.into_iter().collect())
    }

    fn connection_events(&self) -> watch::Receiver<ConnectionState> {
        self.events.subscribe()
    }
}
