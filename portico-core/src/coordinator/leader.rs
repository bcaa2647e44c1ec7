//! Leader election
//!
//! Holds a session-bound ephemeral node at `/leader`. Exactly one process can
//! own it; when its session expires the coordination service removes the node
//! and another process may take over.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::coordination::{ConnectionState, CoordinationClient, SessionId};
use crate::error::{PorticoError, Result};
use crate::metrics::standard;
use crate::runtime::ShutdownSignal;

/// Path of the leader lock node
pub const LEADER_PATH: &str = "/leader";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Contents of the leader lock node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderInfo {
    pub hostname: String,
    pub session: SessionId,
    pub acquired_at: DateTime<Utc>,
}

/// ACTIVE/STANDBY together with the session backing it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeadershipState {
    pub active: bool,
    pub session: Option<SessionId>,
}

/// Callback for leadership transitions.
///
/// Each listener has its own delivery task, so a slow listener only delays
/// itself. Transitions reach every listener in the order they happened.
pub trait LeadershipListener: Send + Sync {
    fn on_change(&self, state: LeadershipState);
}

impl<F> LeadershipListener for F
where
    F: Fn(LeadershipState) + Send + Sync,
{
    fn on_change(&self, state: LeadershipState) {
        (self)(state)
    }
}

/// Cluster-wide leader lock
pub struct LeaderElector {
    client: Arc<dyn CoordinationClient>,
    hostname: String,
    active: AtomicBool,
    state: Mutex<LeadershipState>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<LeadershipState>>>,
    poll_interval: Duration,
}

impl LeaderElector {
    pub fn new(client: Arc<dyn CoordinationClient>, hostname: impl Into<String>) -> Arc<Self> {
        Self::with_poll_interval(client, hostname, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(
        client: Arc<dyn CoordinationClient>,
        hostname: impl Into<String>,
        poll_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            hostname: hostname.into(),
            active: AtomicBool::new(false),
            state: Mutex::new(LeadershipState::default()),
            listeners: Mutex::new(Vec::new()),
            poll_interval,
        })
    }

    /// Register a listener and start its delivery task.
    ///
    /// Must be called from within a Tokio runtime. The listener only sees
    /// transitions that happen after registration.
    pub fn on_leadership_change(&self, listener: Arc<dyn LeadershipListener>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<LeadershipState>();
        tokio::spawn(async move {
            while let Some(state) = receiver.recv().await {
                listener.on_change(state);
            }
        });
        self.listeners.lock().push(sender);
    }

    /// Last known leadership, without blocking.
    ///
    /// Also false once the client's session differs from the one the lock was
    /// taken with, or the client reports no live session (an expired lease),
    /// even before the STANDBY transition has been processed.
    pub fn is_leader(&self) -> bool {
        if !self.active.load(Ordering::SeqCst) {
            return false;
        }
        let held = self.state.lock().session;
        held.is_some() && held == self.client.session_id()
    }

    /// Fail with `LeadershipLost` unless this process currently leads
    pub fn ensure_leader(&self, operation: &str) -> Result<()> {
        if self.is_leader() {
            Ok(())
        } else {
            Err(PorticoError::LeadershipLost {
                operation: operation.into(),
            })
        }
    }

    pub fn state(&self) -> LeadershipState {
        *self.state.lock()
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Current lock holder as recorded in the lock node
    pub async fn leader_info(&self) -> Result<Option<LeaderInfo>> {
        match self.client.get(LEADER_PATH).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| PorticoError::corrupt(LEADER_PATH, e)),
            None => Ok(None),
        }
    }

    /// Try to take (or confirm) the lock. Safe to call repeatedly.
    pub async fn try_acquire(&self) -> Result<bool> {
        let session = match self.client.session_id() {
            Some(session) => session,
            None => {
                self.set_state(false, None);
                return Ok(false);
            }
        };

        let info = LeaderInfo {
            hostname: self.hostname.clone(),
            session,
            acquired_at: Utc::now(),
        };
        let data = serde_json::to_vec(&info).map_err(|e| PorticoError::Internal {
            message: format!("Failed to encode leader info: {}", e),
        })?;

        let result = match self.client.create_ephemeral(LEADER_PATH, data).await {
            Ok(true) => Ok(true),
            Ok(false) => self
                .leader_info()
                .await
                .map(|holder| holder.map(|h| h.session) == Some(session)),
            Err(e) => Err(e),
        };

        match result {
            Ok(leading) => {
                self.set_state(leading, Some(session));
                Ok(leading)
            }
            Err(e) => {
                self.set_state(false, Some(session));
                Err(e)
            }
        }
    }

    /// Give up the lock if held and move to STANDBY
    pub async fn release(&self) -> Result<()> {
        let session = self.state().session;
        let result = match (self.active.load(Ordering::SeqCst), session) {
            (true, Some(session)) => match self.leader_info().await {
                Ok(Some(holder)) if holder.session == session => {
                    self.client.delete(LEADER_PATH).await
                }
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            },
            _ => Ok(()),
        };
        self.set_state(false, session);
        if result.is_ok() {
            info!("Released leadership");
        }
        result
    }

    /// Follow connection events and poll the lock until shutdown
    pub async fn run(self: Arc<Self>, shutdown: ShutdownSignal) {
        let mut events = self.client.connection_events();
        let mut shutdown_rx = shutdown.subscribe();
        let mut poll = interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Leader election started for {}", self.hostname);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    if let Err(e) = self.release().await {
                        warn!("Failed to release leadership on shutdown: {}", e);
                    }
                    break;
                }
                changed = events.changed() => {
                    if changed.is_err() {
                        warn!("Coordination client closed its event channel");
                        self.set_state(false, None);
                        break;
                    }
                    let connection = *events.borrow_and_update();
                    match connection {
                        ConnectionState::Connected(session) => {
                            debug!("Coordination connected with session {}", session);
                            self.acquire_logged().await;
                        }
                        ConnectionState::Suspended => {
                            warn!("Coordination connection suspended, standing by");
                            self.set_state(false, self.state().session);
                        }
                        ConnectionState::Lost => {
                            warn!("Coordination session lost, standing by");
                            self.set_state(false, None);
                        }
                    }
                }
                _ = poll.tick() => {
                    let connected = matches!(*events.borrow(), ConnectionState::Connected(_));
                    if connected {
                        self.acquire_logged().await;
                    }
                }
            }
        }
    }

    async fn acquire_logged(&self) {
        if let Err(e) = self.try_acquire().await {
            warn!("Leader lock attempt failed: {}", e);
        }
    }

    /// Record the new state; fires listeners only when ACTIVE/STANDBY flips.
    ///
    /// Listeners are queued while the state lock is held so two racing
    /// transitions are delivered in the order they were recorded.
    fn set_state(&self, active: bool, session: Option<SessionId>) {
        let next = LeadershipState { active, session };
        let mut state = self.state.lock();
        let changed = state.active != active;
        *state = next;
        self.active.store(active, Ordering::SeqCst);
        if !changed {
            return;
        }

        standard::IS_LEADER.set(active as i64);
        if active {
            info!("{} is now the leader (session {:?})", self.hostname, session);
        } else {
            info!("{} is now standing by", self.hostname);
        }
        // lock order: state, then listeners
        self.listeners
            .lock()
            .retain(|listener| listener.send(next).is_ok());
        drop(state);
    }
}
