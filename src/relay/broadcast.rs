//! Fan-out of one message to every connection except its origin.
//!
//! Sockets are non-blocking, so each client owns an [`Outbox`]: a broadcast
//! appends the encoded message and flushes what the socket accepts right away.
//! Whatever is left is written on the next writable event. A recipient whose
//! write fails, or whose backlog exceeds its bound, is reported back to the
//! caller so that only that connection is dropped.

use crate::relay::message::OutgoingMessage;
use crate::relay::registry::{ConnectionRegistry, Handle};
use bytes::{Buf, BytesMut};
use std::io::{self, Write};
use thiserror::Error;
use tracing::trace;

/// Why a message could not be delivered to one recipient.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Writing to the socket failed.
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
    /// The recipient is not draining its socket.
    #[error("outbound backlog of {pending} bytes exceeds limit of {limit}")]
    Backlogged {
        /// Bytes that would be queued.
        pending: usize,
        /// Configured limit.
        limit: usize,
    },
}

/// A recipient that could not be served and must be disconnected.
#[derive(Debug)]
pub struct Failure {
    pub handle: Handle,
    pub error: DeliveryError,
}

/// Bounded queue of bytes waiting to be written to one client.
#[derive(Debug)]
pub struct Outbox {
    buf: BytesMut,
    limit: usize,
}

impl Outbox {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
        }
    }

    /// Queue `data`, refusing it if the backlog would exceed the limit.
    pub fn push(&mut self, data: &[u8]) -> Result<(), DeliveryError> {
        let pending = self.buf.len() + data.len();
        if pending > self.limit {
            return Err(DeliveryError::Backlogged {
                pending,
                limit: self.limit,
            });
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Write queued bytes until the queue is empty or the writer would block.
    ///
    /// Returns `true` once everything has been written.
    pub fn flush<W: Write>(&mut self, dst: &mut W) -> io::Result<bool> {
        while !self.buf.is_empty() {
            match dst.write(&self.buf) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
                Ok(n) => self.buf.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Deliver `message` to every active connection except `exclude`.
///
/// Recipients are visited in ascending handle order. Connections that fail
/// are left registered; the caller decides how to retire them.
pub fn broadcast<S: Write>(
    registry: &mut ConnectionRegistry<S>,
    message: &OutgoingMessage,
    exclude: Handle,
) -> Vec<Failure> {
    let encoded = message.encode();
    let mut failures = Vec::new();

    for handle in registry.active_handles() {
        if handle == exclude {
            continue;
        }
        let Some(client) = registry.get_mut(handle) else {
            continue;
        };

        let result = client
            .outbox
            .push(&encoded)
            .and_then(|()| client.outbox.flush(&mut client.stream).map_err(DeliveryError::from));

        match result {
            Ok(true) => {}
            Ok(false) => trace!(%handle, queued = client.outbox.len(), "Recipient would block"),
            Err(error) => failures.push(Failure { handle, error }),
        }
    }

    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::registry::{ClientId, Limits};
    use bytes::Bytes;

    /// Writer that accepts up to `capacity` bytes, then blocks or fails.
    #[derive(Debug, Default)]
    struct MockSink {
        written: Vec<u8>,
        capacity: Option<usize>,
        broken: bool,
    }

    impl Write for MockSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.broken {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            let room = match self.capacity {
                Some(cap) => cap.saturating_sub(self.written.len()),
                None => buf.len(),
            };
            if room == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = room.min(buf.len());
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn registry(max_pending_output: usize) -> ConnectionRegistry<MockSink> {
        ConnectionRegistry::new(Limits {
            max_connections: 16,
            max_line_length: 64,
            max_pending_output,
        })
    }

    fn written(registry: &mut ConnectionRegistry<MockSink>, handle: Handle) -> Vec<u8> {
        registry.get_mut(handle).unwrap().stream.written.clone()
    }

    #[test]
    fn test_excludes_origin() {
        let mut registry = registry(1024);
        let (a, id_a) = registry.register(MockSink::default()).unwrap();
        let (b, _) = registry.register(MockSink::default()).unwrap();
        let (c, _) = registry.register(MockSink::default()).unwrap();

        let msg = OutgoingMessage::Relay {
            from: id_a,
            line: Bytes::from_static(b"hi\n"),
        };
        let failures = broadcast(&mut registry, &msg, a);

        assert!(failures.is_empty());
        assert!(written(&mut registry, a).is_empty());
        assert_eq!(written(&mut registry, b), b"client 0: hi\n");
        assert_eq!(written(&mut registry, c), b"client 0: hi\n");
    }

    #[test]
    fn test_blocked_recipient_keeps_backlog() {
        let mut registry = registry(1024);
        let (a, _) = registry.register(MockSink::default()).unwrap();
        let (b, _) = registry
            .register(MockSink {
                capacity: Some(10),
                ..Default::default()
            })
            .unwrap();

        let failures = broadcast(&mut registry, &OutgoingMessage::Left(ClientId(7)), a);
        assert!(failures.is_empty());

        let client = registry.get_mut(b).unwrap();
        assert_eq!(client.stream.written, b"server: cl");
        assert_eq!(client.outbox.len(), "server: client 7 just left\n".len() - 10);

        // Socket drains; next flush completes the message
        client.stream.capacity = None;
        assert!(client.outbox.flush(&mut client.stream).unwrap());
        assert_eq!(client.stream.written, b"server: client 7 just left\n");
        assert!(client.outbox.is_empty());
    }

    #[test]
    fn test_failure_is_isolated() {
        let mut registry = registry(1024);
        let (origin, _) = registry.register(MockSink::default()).unwrap();
        let (broken, _) = registry
            .register(MockSink {
                broken: true,
                ..Default::default()
            })
            .unwrap();
        let (healthy, _) = registry.register(MockSink::default()).unwrap();

        let failures = broadcast(&mut registry, &OutgoingMessage::Arrived(ClientId(0)), origin);

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].handle, broken);
        assert!(matches!(failures[0].error, DeliveryError::Io(_)));
        assert_eq!(written(&mut registry, healthy), b"server: client 0 just arrived\n");
        assert!(registry.identifier_of(broken).is_ok());
    }

    #[test]
    fn test_backlog_limit() {
        let mut registry = registry(40);
        let (origin, _) = registry.register(MockSink::default()).unwrap();
        let (stuck, _) = registry
            .register(MockSink {
                capacity: Some(0),
                ..Default::default()
            })
            .unwrap();

        // 30 bytes fit in the backlog, 60 do not
        let msg = OutgoingMessage::Arrived(ClientId(0));
        assert!(broadcast(&mut registry, &msg, origin).is_empty());

        let failures = broadcast(&mut registry, &msg, origin);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].handle, stuck);
        assert!(matches!(
            failures[0].error,
            DeliveryError::Backlogged { pending: 60, limit: 40 }
        ));
    }

    #[test]
    fn test_write_zero_is_error() {
        struct ZeroWriter;
        impl Write for ZeroWriter {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut outbox = Outbox::new(64);
        outbox.push(b"x\n").unwrap();
        let err = outbox.flush(&mut ZeroWriter).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }
}
