//! Process runtime helpers
//!
//! Shutdown signalling shared by the elector, the scheduler and the HTTP server.

pub mod shutdown;

pub use shutdown::{ShutdownListener, ShutdownSignal};
