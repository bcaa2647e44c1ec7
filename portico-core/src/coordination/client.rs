//! Coordination client contract

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

use crate::error::Result;

/// Identifier of a coordination session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Connection state as reported by the coordination client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Session is live
    Connected(SessionId),
    /// Connection interrupted; the session may still come back
    Suspended,
    /// Session is gone together with its ephemeral nodes
    Lost,
}

impl ConnectionState {
    pub fn session(&self) -> Option<SessionId> {
        match self {
            ConnectionState::Connected(session) => Some(*session),
            _ => None,
        }
    }
}

/// Hierarchical key store with ephemeral nodes.
///
/// Paths are absolute and `/`-separated (`/requests/abc`). Values are opaque bytes.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Current session, if connected
    fn session_id(&self) -> Option<SessionId>;

    /// Read a node
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Create or overwrite a persistent node
    async fn put(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// Create a node bound to the current session if it does not exist yet.
    ///
    /// Returns `false` when the node already exists, whoever owns it.
    async fn create_ephemeral(&self, path: &str, data: Vec<u8>) -> Result<bool>;

    /// Delete a node; deleting an absent node is not an error
    async fn delete(&self, path: &str) -> Result<()>;

    /// Names of the immediate children of `path`
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Connection state notifications
    fn connection_events(&self) -> watch::Receiver<ConnectionState>;
}

/// Join a parent path and a child name
pub fn join(parent: &str, child: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), child)
}

/// Immediate child name of `key` below `parent`, if `key` is a descendant
pub(crate) fn child_name<'a>(parent: &str, key: &'a str) -> Option<&'a str> {
    let prefix = format!("{}/", parent.trim_end_matches('/'));
    let rest = key.strip_prefix(prefix.as_str())?;
    rest.split('/').next().filter(|name| !name.is_empty())
}
