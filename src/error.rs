//! Fatal error types.
//!
//! Startup and runtime failures are kept apart so the process can report
//! which phase brought it down.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Failures while bringing the relay up.
#[derive(Debug, Error)]
pub enum StartupError {
    /// Invalid listen address.
    #[error("invalid listen address '{0}'")]
    Address(String),

    /// Socket creation, bind or listen failed.
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The readiness poller could not be created or the listener registered.
    #[error("failed to set up poller: {0}")]
    Poll(#[source] io::Error),
}

/// Failures that stop a running relay.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Accepting a connection failed.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// A new connection could not be registered with the poller.
    #[error("failed to register connection: {0}")]
    Register(#[source] io::Error),

    /// Waiting for readiness kept failing.
    #[error("poll failed {failures} times in a row: {source}")]
    Poll {
        failures: u32,
        #[source]
        source: io::Error,
    },
}
