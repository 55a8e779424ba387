//! Line relay engine.
//!
//! Single-threaded and readiness-driven:
//! - `ConnectionRegistry`: active connections and their identifiers
//! - `LineFramer`: newline framing with a bounded buffer
//! - `broadcast`: fan-out to every connection except the origin
//! - `Server`: the mio event loop tying them together

mod broadcast;
mod event_loop;
mod framer;
mod message;
mod registry;

pub use event_loop::Server;

pub(crate) use broadcast::{broadcast, Failure};
pub(crate) use framer::Frame;
pub(crate) use message::OutgoingMessage;
pub(crate) use registry::{ConnectionRegistry, Handle, Limits};
