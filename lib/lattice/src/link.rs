//! One TCP stream plus its two FIFO buffers. `Link` is the dumb transport
//! layer shared by client and node connections: it pumps bytes and frames
//! and tracks traffic timestamps, while the owning connection runs the
//! handshake and request state machines on top.

use crate::buffer::Buffer;
use crate::frame;
use crate::parse::MessageBuilder;
use crate::shared::{NetResult, RequestId};
use mio::net::TcpStream;
use std::net::Shutdown;
use std::time::{Duration, Instant};

pub const READ_BUF_SIZE: usize = 2 * 65536;
pub const WRITE_BUF_SIZE: usize = 8 * 65536;

pub struct Link {
    stream: TcpStream,
    read_buffer: Buffer,
    write_buffer: Buffer,
    last_ingress: Instant,
    last_egress: Instant,
}

impl Link {
    pub fn new(stream: TcpStream, now: Instant) -> Link {
        Link {
            stream,
            read_buffer: Buffer::new(READ_BUF_SIZE),
            write_buffer: Buffer::new(WRITE_BUF_SIZE),
            last_ingress: now,
            last_egress: now,
        }
    }

    #[inline]
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Reads all available data off the socket. Updates the ingress stamp
    /// when bytes arrived.
    pub fn receive(&mut self, now: Instant) -> NetResult<usize> {
        let received = self.read_buffer.fill_from(&mut self.stream)?;

        if received > 0 {
            self.last_ingress = now;
        }

        Ok(received)
    }

    /// Writes buffered data to the socket. Updates the egress stamp when
    /// bytes left.
    pub fn flush(&mut self, now: Instant) -> NetResult<usize> {
        if self.write_buffer.is_empty() {
            return Ok(0);
        }

        let sent = self.write_buffer.drain_to(&mut self.stream)?;

        if sent > 0 {
            self.last_egress = now;
        }

        Ok(sent)
    }

    /// Extracts the next complete inbound frame, `Wait` when none has fully
    /// arrived yet.
    #[inline]
    pub fn next_frame(&mut self, max_payload: usize) -> NetResult<(RequestId, Vec<u8>)> {
        frame::extract(&mut self.read_buffer, max_payload)
    }

    #[inline]
    pub fn enqueue_frame(&mut self, request_id: RequestId, payload: &[u8]) -> NetResult<()> {
        frame::enqueue(&mut self.write_buffer, request_id, payload)
    }

    #[inline]
    pub fn enqueue_frame_with<F: FnOnce(&mut MessageBuilder)>(
        &mut self,
        request_id: RequestId,
        max_payload: usize,
        build: F,
    ) -> NetResult<()> {
        frame::enqueue_with(&mut self.write_buffer, request_id, max_payload, build)
    }

    #[inline]
    pub fn write_buffer(&mut self) -> &mut Buffer {
        &mut self.write_buffer
    }

    #[inline]
    pub fn has_egress(&self) -> bool {
        !self.write_buffer.is_empty()
    }

    #[inline]
    pub fn last_ingress_elapsed(&self, now: Instant) -> Duration {
        now.duration_since(self.last_ingress)
    }

    #[inline]
    pub fn last_egress_elapsed(&self, now: Instant) -> Duration {
        now.duration_since(self.last_egress)
    }

    /// Tears the socket down. Errors are ignored; the peer may already be
    /// gone.
    pub fn close(&self) {
        drop(self.stream.shutdown(Shutdown::Both));
    }
}
