//! Registry of active client connections.
//!
//! Connections live in a slab, so handles are stable slot indices with O(1)
//! insert, lookup, and remove. Slots are reused once freed, but client
//! identifiers come from a separate counter and are never reused.

use crate::relay::broadcast::Outbox;
use crate::relay::framer::LineFramer;
use mio::Token;
use slab::Slab;
use std::fmt;
use thiserror::Error;

/// Opaque reference to one open connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(pub usize);

impl From<Handle> for Token {
    fn from(handle: Handle) -> Self {
        Token(handle.0)
    }
}

impl From<Token> for Handle {
    fn from(token: Token) -> Self {
        Handle(token.0)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sequential identifier announced to other clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registry lookup and admission errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The handle is not an active connection.
    #[error("connection {0} not found")]
    NotFound(Handle),
    /// The registry is at its connection limit.
    #[error("connection limit of {0} reached")]
    Full(usize),
}

/// A single client connection and its per-connection state.
#[derive(Debug)]
pub struct Client<S> {
    /// Underlying stream.
    pub stream: S,
    /// Identifier assigned at acceptance.
    pub id: ClientId,
    /// Partial-line state for inbound bytes.
    pub framer: LineFramer,
    /// Bytes queued for this client but not yet written.
    pub outbox: Outbox,
}

/// Limits applied to every registered connection.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Maximum simultaneously active connections.
    pub max_connections: usize,
    /// Maximum inbound line length, newline included.
    pub max_line_length: usize,
    /// Maximum bytes queued for one client.
    pub max_pending_output: usize,
}

/// Active connections keyed by handle.
pub struct ConnectionRegistry<S> {
    clients: Slab<Client<S>>,
    next_id: u64,
    limits: Limits,
}

impl<S> ConnectionRegistry<S> {
    /// Create an empty registry.
    pub fn new(limits: Limits) -> Self {
        Self {
            clients: Slab::with_capacity(limits.max_connections.min(1024)),
            next_id: 0,
            limits,
        }
    }

    /// Register a newly accepted stream and assign it the next identifier.
    ///
    /// Returns [`RegistryError::Full`] without consuming an identifier if the
    /// registry is at capacity.
    pub fn register(&mut self, stream: S) -> Result<(Handle, ClientId), RegistryError> {
        if self.clients.len() >= self.limits.max_connections {
            return Err(RegistryError::Full(self.limits.max_connections));
        }

        let id = ClientId(self.next_id);
        self.next_id += 1;

        let key = self.clients.insert(Client {
            stream,
            id,
            framer: LineFramer::new(self.limits.max_line_length),
            outbox: Outbox::new(self.limits.max_pending_output),
        });
        Ok((Handle(key), id))
    }

    /// Remove a connection. Its identifier is retired, not recycled.
    pub fn unregister(&mut self, handle: Handle) -> Option<Client<S>> {
        self.clients.try_remove(handle.0)
    }

    /// Identifier assigned to an active connection.
    pub fn identifier_of(&self, handle: Handle) -> Result<ClientId, RegistryError> {
        self.clients
            .get(handle.0)
            .map(|client| client.id)
            .ok_or(RegistryError::NotFound(handle))
    }

    /// Snapshot of active handles in ascending order.
    pub fn active_handles(&self) -> Vec<Handle> {
        self.clients.iter().map(|(key, _)| Handle(key)).collect()
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut Client<S>> {
        self.clients.get_mut(handle.0)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Remove every connection, yielding them for teardown.
    pub fn drain(&mut self) -> impl Iterator<Item = Client<S>> + '_ {
        self.clients.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_connections: usize) -> Limits {
        Limits {
            max_connections,
            max_line_length: 64,
            max_pending_output: 1024,
        }
    }

    #[test]
    fn test_sequential_identifiers() {
        let mut registry = ConnectionRegistry::new(limits(16));

        let ids: Vec<ClientId> = (0..5).map(|n| registry.register(n).unwrap().1).collect();
        assert_eq!(ids, (0..5).map(ClientId).collect::<Vec<_>>());
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn test_identifiers_not_reused() {
        let mut registry = ConnectionRegistry::new(limits(16));

        let (h0, id0) = registry.register("a").unwrap();
        let (_, id1) = registry.register("b").unwrap();
        let removed = registry.unregister(h0).unwrap();
        assert_eq!(removed.id, id0);

        // Slab reuses the slot, but the identifier moves on
        let (h2, id2) = registry.register("c").unwrap();
        assert_eq!(h2, h0);
        assert_eq!(id2, ClientId(2));
        assert_ne!(id2, id1);
        assert_eq!(registry.identifier_of(h2), Ok(ClientId(2)));
    }

    #[test]
    fn test_not_found() {
        let mut registry = ConnectionRegistry::new(limits(4));
        let (h, _) = registry.register(()).unwrap();
        registry.unregister(h);

        assert_eq!(registry.identifier_of(h), Err(RegistryError::NotFound(h)));
        assert!(registry.unregister(h).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_full_does_not_consume_identifier() {
        let mut registry = ConnectionRegistry::new(limits(1));

        let (h, _) = registry.register(1).unwrap();
        assert_eq!(registry.register(2).unwrap_err(), RegistryError::Full(1));

        registry.unregister(h);
        let (_, id) = registry.register(3).unwrap();
        assert_eq!(id, ClientId(1));
    }

    #[test]
    fn test_active_handles_ascending() {
        let mut registry = ConnectionRegistry::new(limits(8));
        let handles: Vec<Handle> = (0..4).map(|n| registry.register(n).unwrap().0).collect();
        registry.unregister(handles[1]);

        assert_eq!(
            registry.active_handles(),
            vec![handles[0], handles[2], handles[3]]
        );
    }

    #[test]
    fn test_drain() {
        let mut registry = ConnectionRegistry::new(limits(8));
        registry.register('x').unwrap();
        registry.register('y').unwrap();

        let ids: Vec<ClientId> = registry.drain().map(|c| c.id).collect();
        assert_eq!(ids, vec![ClientId(0), ClientId(1)]);
        assert_eq!(registry.len(), 0);
    }
}
