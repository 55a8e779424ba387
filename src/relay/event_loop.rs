//! mio event loop for the relay.
//!
//! Readiness-based model: poll tells us when the listener or a client is
//! ready, then we perform non-blocking accept/read/write syscalls. Uses epoll
//! on Linux, kqueue on macOS. Everything runs on one thread; each readiness
//! event is framed and broadcast before the next one is looked at.
//!
//! A client gets at most `LINES_PER_WAKEUP` lines relayed per turn. Readiness
//! is edge-triggered, so a client cut off by that budget is queued and served
//! again on the next turn without waiting for a new event.

use crate::config::Config;
use crate::error::{RuntimeError, StartupError};
use crate::relay::{
    broadcast, ConnectionRegistry, Failure, Frame, Handle, Limits, OutgoingMessage,
};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::{mem, thread};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

const LISTEN_BACKLOG: i32 = 4096;

/// Pause between retries after a failed poll.
const POLL_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Consecutive poll failures tolerated before giving up.
const MAX_POLL_FAILURES: u32 = 32;

/// Lines relayed from one client before others get a turn.
const LINES_PER_WAKEUP: usize = 64;

/// The relay: listener, poller and every connected client.
pub struct Server {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    registry: ConnectionRegistry<TcpStream>,
    /// Clients with input left over after their budget ran out.
    pending_readable: VecDeque<Handle>,
    poll_failures: u32,
}

impl Server {
    /// Bind the listener and set up the poller.
    pub fn bind(config: &Config) -> Result<Self, StartupError> {
        let addr = config
            .listen_addr()
            .map_err(|_| StartupError::Address(config.host.clone()))?;

        let listener =
            create_listener(addr).map_err(|source| StartupError::Listen { addr, source })?;
        let mut listener = TcpListener::from_std(listener);

        let poll = Poll::new().map_err(StartupError::Poll)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(StartupError::Poll)?;

        let limits = Limits {
            max_connections: config.max_connections,
            max_line_length: config.max_line_length,
            max_pending_output: config.max_pending_output,
        };

        info!(addr = %addr, "Relay listening");

        Ok(Self {
            poll,
            events: Events::with_capacity(config.event_capacity.max(1)),
            listener,
            registry: ConnectionRegistry::new(limits),
            pending_readable: VecDeque::new(),
            poll_failures: 0,
        })
    }

    /// Address the listener is bound to.
    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run until a fatal error.
    pub fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            self.turn(None)?;
        }
    }

    /// Wait for one batch of readiness events and handle it, then give
    /// clients left over from the previous turn another budget.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<(), RuntimeError> {
        let timeout = if self.pending_readable.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };

        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            return self.poll_failed(e);
        }
        self.poll_failures = 0;

        let carried = mem::take(&mut self.pending_readable);

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| {
                let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                (event.token(), readable, event.is_writable())
            })
            .collect();

        for (token, readable, writable) in ready {
            match token {
                LISTENER_TOKEN => self.accept_connections()?,
                token => {
                    let handle = Handle::from(token);
                    if readable {
                        self.handle_readable(handle);
                    }
                    if writable {
                        self.handle_writable(handle);
                    }
                }
            }
        }

        for handle in carried {
            // Already served (and possibly requeued) by an event this turn
            if !self.pending_readable.contains(&handle) {
                self.handle_readable(handle);
            }
        }

        Ok(())
    }

    /// Close every connection and the listener.
    pub fn shutdown(mut self) {
        let _ = self.poll.registry().deregister(&mut self.listener);

        let mut closed = 0;
        for mut client in self.registry.drain() {
            let _ = self.poll.registry().deregister(&mut client.stream);
            closed += 1;
        }

        info!(closed, "Relay shut down");
    }

    fn poll_failed(&mut self, e: io::Error) -> Result<(), RuntimeError> {
        if e.kind() == io::ErrorKind::Interrupted {
            return Ok(());
        }

        self.poll_failures += 1;
        if self.poll_failures >= MAX_POLL_FAILURES {
            return Err(RuntimeError::Poll {
                failures: self.poll_failures,
                source: e,
            });
        }

        warn!(failures = self.poll_failures, error = %e, "Poll failed, retrying");
        thread::sleep(POLL_RETRY_DELAY);
        Ok(())
    }

    fn accept_connections(&mut self) -> Result<(), RuntimeError> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer)?,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    debug!(error = %e, "Transient accept error");
                }
                Err(e) => return Err(RuntimeError::Accept(e)),
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) -> Result<(), RuntimeError> {
        let (handle, id) = match self.registry.register(stream) {
            Ok(registered) => registered,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Rejecting connection");
                return Ok(());
            }
        };

        if let Some(client) = self.registry.get_mut(handle) {
            self.poll
                .registry()
                .register(
                    &mut client.stream,
                    handle.into(),
                    Interest::READABLE | Interest::WRITABLE,
                )
                .map_err(RuntimeError::Register)?;
        }

        info!(
            client = %id,
            handle = %handle,
            peer = %peer,
            active = self.registry.len(),
            "Client arrived"
        );

        let failures = broadcast(&mut self.registry, &OutgoingMessage::Arrived(id), handle);
        self.retire(failures);
        Ok(())
    }

    /// Frame and relay what the client has sent until its socket would block,
    /// it goes away, or it uses up its budget for this turn.
    fn handle_readable(&mut self, handle: Handle) {
        for _ in 0..LINES_PER_WAKEUP {
            let Some(client) = self.registry.get_mut(handle) else {
                return;
            };

            match client.framer.feed(&mut client.stream) {
                Frame::Line(line) => {
                    let Ok(from) = self.registry.identifier_of(handle) else {
                        return;
                    };
                    trace!(client = %from, len = line.len(), "Relaying line");

                    let message = OutgoingMessage::Relay { from, line };
                    let failures = broadcast(&mut self.registry, &message, handle);
                    self.retire(failures);
                }
                Frame::NeedMore => return,
                Frame::PeerClosed => {
                    self.disconnect(handle);
                    return;
                }
                Frame::ReadError(e) => {
                    debug!(handle = %handle, error = %e, "Read failed");
                    self.disconnect(handle);
                    return;
                }
                Frame::LineTooLong => {
                    warn!(handle = %handle, "Line too long, closing connection");
                    self.disconnect(handle);
                    return;
                }
            }
        }

        if !self.pending_readable.contains(&handle) {
            trace!(handle = %handle, "Read budget used up, deferring");
            self.pending_readable.push_back(handle);
        }
    }

    fn handle_writable(&mut self, handle: Handle) {
        let Some(client) = self.registry.get_mut(handle) else {
            return;
        };
        if client.outbox.is_empty() {
            return;
        }

        if let Err(e) = client.outbox.flush(&mut client.stream) {
            debug!(client = %client.id, error = %e, "Write failed");
            self.disconnect(handle);
        }
    }

    /// Disconnect recipients a broadcast could not reach.
    fn retire(&mut self, failures: Vec<Failure>) {
        if failures.is_empty() {
            return;
        }

        let departing = failures
            .into_iter()
            .map(|Failure { handle, error }| {
                debug!(handle = %handle, error = %error, "Delivery failed");
                handle
            })
            .collect();
        self.depart(departing);
    }

    fn disconnect(&mut self, handle: Handle) {
        self.depart(VecDeque::from([handle]));
    }

    /// Close each queued connection and announce its departure. Recipients
    /// that fail while hearing about a departure join the queue.
    fn depart(&mut self, mut departing: VecDeque<Handle>) {
        while let Some(handle) = departing.pop_front() {
            let Some(mut client) = self.registry.unregister(handle) else {
                continue;
            };
            self.pending_readable.retain(|&pending| pending != handle);
            if let Err(e) = self.poll.registry().deregister(&mut client.stream) {
                debug!(handle = %handle, error = %e, "Deregister failed");
            }
            let id = client.id;
            let discarded = client.framer.pending();
            drop(client);

            info!(
                client = %id,
                handle = %handle,
                discarded,
                active = self.registry.len(),
                "Client left"
            );

            for Failure { handle, error } in
                broadcast(&mut self.registry, &OutgoingMessage::Left(id), handle)
            {
                debug!(handle = %handle, error = %error, "Delivery failed");
                departing.push_back(handle);
            }
        }
    }
}

/// Create a non-blocking TCP listener with address reuse.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
