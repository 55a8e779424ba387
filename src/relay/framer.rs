//! Newline framing for one connection.
//!
//! Bytes are accumulated per connection until a `\n` is seen. The buffer never
//! grows past `max_line_length`: reads are sized to the remaining room, and a
//! full buffer without a delimiter is reported as [`Frame::LineTooLong`].

use bytes::{Bytes, BytesMut};
use std::io::{self, Read};

/// Upper bound for a single read syscall.
const READ_CHUNK: usize = 16 * 1024;

/// Outcome of feeding a connection's readable bytes through the framer.
#[derive(Debug)]
pub enum Frame {
    /// A complete line, trailing newline included.
    Line(Bytes),
    /// No complete line yet and the socket has no more data for now.
    NeedMore,
    /// The peer closed the stream. Any partial line is discarded.
    PeerClosed,
    /// The read failed. Any partial line is discarded.
    ReadError(io::Error),
    /// The peer sent more than `max_line_length` bytes without a newline.
    LineTooLong,
}

/// Incremental line assembler.
#[derive(Debug)]
pub struct LineFramer {
    buf: BytesMut,
    max_line_length: usize,
}

impl LineFramer {
    /// Create a framer accepting lines up to `max_line_length` bytes,
    /// newline included.
    pub fn new(max_line_length: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_line_length: max_line_length.max(1),
        }
    }

    /// Number of bytes buffered but not yet framed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Produce the next frame, reading from `src` only when no complete line
    /// is already buffered.
    ///
    /// Call repeatedly until it returns something other than [`Frame::Line`];
    /// lines are returned in the order they were received.
    pub fn feed<R: Read>(&mut self, src: &mut R) -> Frame {
        loop {
            if let Some(frame) = self.take_line() {
                return frame;
            }

            let start = self.buf.len();
            let room = (self.max_line_length - start).min(READ_CHUNK);
            self.buf.resize(start + room, 0);

            match src.read(&mut self.buf[start..]) {
                Ok(0) => {
                    self.buf.clear();
                    return Frame::PeerClosed;
                }
                Ok(n) => self.buf.truncate(start + n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.buf.truncate(start);
                    return Frame::NeedMore;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.buf.truncate(start);
                }
                Err(e) => {
                    self.buf.clear();
                    return Frame::ReadError(e);
                }
            }
        }
    }

    /// Split off the first buffered line, if any.
    fn take_line(&mut self) -> Option<Frame> {
        let window = self.buf.len().min(self.max_line_length);
        match self.buf[..window].iter().position(|&b| b == b'\n') {
            Some(pos) => Some(Frame::Line(self.buf.split_to(pos + 1).freeze())),
            None if self.buf.len() >= self.max_line_length => {
                self.buf.clear();
                Some(Frame::LineTooLong)
            }
            None => None,
        }
    }
}
