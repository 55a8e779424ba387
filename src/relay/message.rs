//! Messages the relay sends to clients.
//!
//! Wire format (newline-delimited):
//!
//! ```text
//! server: client <id> just arrived\n
//! server: client <id> just left\n
//! client <id>: <line bytes, trailing newline included>
//! ```

use crate::relay::registry::ClientId;
use bytes::{BufMut, Bytes, BytesMut};

/// A message staged for broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingMessage {
    /// A client was accepted.
    Arrived(ClientId),
    /// A client disconnected or was dropped.
    Left(ClientId),
    /// A complete line from a client.
    Relay {
        /// Originating client.
        from: ClientId,
        /// Line bytes including the trailing newline.
        line: Bytes,
    },
}

impl OutgoingMessage {
    /// Encode the message into its wire representation.
    pub fn encode(&self) -> Bytes {
        match self {
            OutgoingMessage::Arrived(id) => {
                Bytes::from(format!("server: client {id} just arrived\n"))
            }
            OutgoingMessage::Left(id) => Bytes::from(format!("server: client {id} just left\n")),
            OutgoingMessage::Relay { from, line } => {
                let prefix = format!("client {from}: ");
                let mut buf = BytesMut::with_capacity(prefix.len() + line.len());
                buf.put_slice(prefix.as_bytes());
                buf.put_slice(line);
                buf.freeze()
            }
        }
    }
}
