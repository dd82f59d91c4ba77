//! Client side connection to one node: TCP dial, authentication handshake,
//! frame demultiplexing toward RoC mailboxes, and backoff reconnection. The
//! connection itself is a passive state machine; the client's sync loop
//! feeds it readiness and routes what falls out.

use crate::auth::{ClientHandshake, ClientStep};
use crate::buffer::Buffer;
use crate::fiber::RocId;
use crate::link::Link;
use crate::shared::{NetError, NetResult, RequestId, Violation, CONTROL_ID};
use hashbrown::HashMap;
use ion::credentials::Key;
use ion::logging;
use mio::net::TcpStream;
use rand::Rng;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const BACKOFF_BASE_MS: u64 = 100;
const BACKOFF_CAP_MS: u64 = 10_000;

/// Connectivity outcome surfaced to the connection notifier and the error
/// tracker.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ConnStatus {
    Established,
    AuthenticationFailed,
    SocketError,
    ConnectionTimedOut,
    ProtocolError(String),
}

#[derive(Debug)]
pub enum ConnState {
    /// Disconnected; the next dial happens at `retry_at`.
    Idle { retry_at: Instant },
    Connecting { since: Instant },
    Handshake { since: Instant },
    Connected,
    /// Credentials were rejected. No redial until they are replaced.
    AuthFailed,
}

pub struct Connection {
    addr: SocketAddr,
    principal: String,
    key: Key,
    state: ConnState,
    link: Option<Link>,
    handshake: Option<ClientHandshake>,
    /// Outbound payload limit advertised by the node.
    peer_max_payload: usize,
    minor_version: u16,
    /// Inbound payload limit we enforce.
    inbound_max_payload: usize,
    attempt: u32,
    established_pending: bool,
    rocs: HashMap<RequestId, RocId>,
    flush_waiters: Vec<RocId>,
    reconnect_waiters: Vec<RocId>,
    shutdown: Option<String>,
    log: logging::Logger,
}

impl Connection {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        addr: SocketAddr,
        principal: &str,
        key: &Key,
        inbound_max_payload: usize,
        now: Instant,
        log: L,
    ) -> Connection {
        Connection {
            addr,
            principal: principal.to_string(),
            key: *key,
            state: ConnState::Idle { retry_at: now },
            link: None,
            handshake: None,
            peer_max_payload: 0,
            minor_version: 0,
            inbound_max_payload,
            attempt: 0,
            established_pending: false,
            rocs: HashMap::new(),
            flush_waiters: Vec::new(),
            reconnect_waiters: Vec::new(),
            shutdown: None,
            log: logging::child(log),
        }
    }

    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[inline]
    pub fn state(&self) -> &ConnState {
        &self.state
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnState::Connected)
    }

    #[inline]
    pub fn minor_version(&self) -> u16 {
        self.minor_version
    }

    /// Replaces the credentials and lifts an authentication-failure latch.
    pub fn set_credentials(&mut self, principal: &str, key: &Key, now: Instant) {
        self.principal = principal.to_string();
        self.key = *key;

        if let ConnState::AuthFailed = self.state {
            self.state = ConnState::Idle { retry_at: now };
            self.attempt = 0;
        }
    }

    // ------------------------------------------------------------------
    // RoC registration
    // ------------------------------------------------------------------

    pub fn register_roc(&mut self, request_id: RequestId, roc: RocId) {
        let previous = self.rocs.insert(request_id, roc);
        debug_assert!(previous.is_none(), "Request id registered twice on one connection");
    }

    pub fn unregister_roc(&mut self, request_id: RequestId) -> Option<RocId> {
        let roc = self.rocs.remove(&request_id);

        if let Some(roc) = roc {
            self.flush_waiters.retain(|&waiter| waiter != roc);
            self.reconnect_waiters.retain(|&waiter| waiter != roc);
        }

        roc
    }

    #[inline]
    pub fn roc_for(&self, request_id: RequestId) -> Option<RocId> {
        self.rocs.get(&request_id).copied()
    }

    pub fn roc_ids(&self) -> impl Iterator<Item = RocId> + '_ {
        self.rocs.values().copied()
    }

    #[inline]
    pub fn roc_count(&self) -> usize {
        self.rocs.len()
    }

    /// Drains every registered RoC, e.g. for a protocol-error teardown.
    pub fn take_rocs(&mut self) -> Vec<(RequestId, RocId)> {
        self.flush_waiters.clear();
        self.reconnect_waiters.clear();
        self.rocs.drain().collect()
    }

    /// Fibers currently parked until reconnection.
    #[inline]
    pub fn parked_reconnect_waiters(&self) -> &[RocId] {
        &self.reconnect_waiters
    }

    // ------------------------------------------------------------------
    // Dialing and readiness
    // ------------------------------------------------------------------

    /// True when the connection is idle and its backoff delay has lapsed.
    pub fn needs_dial(&self, now: Instant) -> bool {
        match self.state {
            ConnState::Idle { retry_at } => now >= retry_at,
            _ => false,
        }
    }

    /// Starts a non-blocking connect. The caller registers the returned
    /// stream with its poll; writable readiness completes the dial.
    pub fn dial(&mut self, now: Instant) -> io::Result<&TcpStream> {
        logging::debug!(self.log, "dialing node"; "addr" => %self.addr, "attempt" => self.attempt);

        let stream = TcpStream::connect(&self.addr)?;
        self.link = Some(Link::new(stream, now));
        self.state = ConnState::Connecting { since: now };

        Ok(self.link.as_ref().map(Link::stream).expect("Link was just created"))
    }

    /// Drives the transport for one readiness event: completes an in-flight
    /// dial, reads inbound bytes, flushes outbound bytes.
    pub fn advance(&mut self, now: Instant, readable: bool, writable: bool) -> NetResult<()> {
        if writable {
            if let ConnState::Connecting { .. } = self.state {
                self.complete_dial(now)?;
            }
        }

        if readable {
            if let Some(link) = self.link.as_mut() {
                link.receive(now)?;
            }
        }

        self.flush(now)?;
        Ok(())
    }

    fn complete_dial(&mut self, now: Instant) -> NetResult<()> {
        let link = self.link.as_mut().expect("Connecting state requires a link");

        if let Some(err) = link.stream().take_error()? {
            return Err(err.into());
        }

        let handshake = ClientHandshake::new(&self.principal, &self.key);
        let hello = handshake.hello();

        link.enqueue_frame(CONTROL_ID, &hello)?;
        self.handshake = Some(handshake);
        self.state = ConnState::Handshake { since: now };

        logging::debug!(self.log, "socket up, handshake started"; "addr" => %self.addr);
        Ok(())
    }

    pub fn flush(&mut self, now: Instant) -> NetResult<()> {
        if let Some(link) = self.link.as_mut() {
            link.flush(now)?;
        }
        Ok(())
    }

    #[inline]
    pub fn has_egress(&self) -> bool {
        self.link.as_ref().map_or(false, Link::has_egress)
    }

    /// Extracts request frames, running handshake frames through the
    /// authenticator in place. Returns the inbound `(request id, payload)`
    /// pairs for the demultiplexer.
    pub fn drain_frames(&mut self, _now: Instant) -> NetResult<Vec<(RequestId, Vec<u8>)>> {
        let mut inbound = Vec::new();

        loop {
            let link = match self.link.as_mut() {
                Some(link) => link,
                None => break,
            };

            let (request_id, payload) = match link.next_frame(self.inbound_max_payload) {
                Ok(frame) => frame,
                Err(NetError::Wait) => break,
                Err(err) => return Err(err),
            };

            if request_id == CONTROL_ID {
                self.on_control_frame(&payload)?;
            } else if self.is_connected() {
                inbound.push((request_id, payload));
            } else {
                return Err(NetError::Fatal(Violation::UnauthenticatedFrame));
            }
        }

        Ok(inbound)
    }

    fn on_control_frame(&mut self, payload: &[u8]) -> NetResult<()> {
        let handshake = match self.handshake.as_mut() {
            Some(handshake) => handshake,
            None => return Err(NetError::Fatal(Violation::UnexpectedControlFrame)),
        };

        match handshake.on_frame(payload)? {
            ClientStep::SendProof(proof) => {
                self.link
                    .as_mut()
                    .expect("Handshake requires a link")
                    .enqueue_frame(CONTROL_ID, &proof)?;
            }
            ClientStep::Established {
                max_payload,
                minor_version,
            } => {
                self.handshake = None;
                self.peer_max_payload = max_payload as usize;
                self.minor_version = minor_version;
                self.state = ConnState::Connected;
                self.attempt = 0;
                self.established_pending = true;

                logging::info!(self.log, "connection established";
                               "addr" => %self.addr,
                               "max_payload" => max_payload,
                               "minor_version" => minor_version);
            }
        }

        Ok(())
    }

    /// True exactly once per successful handshake.
    pub fn take_established(&mut self) -> bool {
        mem::replace(&mut self.established_pending, false)
    }

    /// Fibers parked on a full write buffer, once it has drained.
    pub fn take_flush_waiters(&mut self) -> Vec<RocId> {
        match self.link.as_ref() {
            Some(link) if !link.has_egress() && !self.flush_waiters.is_empty() => {
                mem::replace(&mut self.flush_waiters, Vec::new())
            }
            _ => Vec::new(),
        }
    }

    /// Fibers parked until the connection is up again.
    pub fn take_reconnect_waiters(&mut self) -> Vec<RocId> {
        mem::replace(&mut self.reconnect_waiters, Vec::new())
    }

    /// Protocol-error teardown requested by a fiber mid-resume.
    pub fn take_shutdown(&mut self) -> Option<String> {
        self.shutdown.take()
    }

    // ------------------------------------------------------------------
    // Failure handling
    // ------------------------------------------------------------------

    /// Classifies a transport failure, tears the socket down and schedules
    /// the redial. An EOF during the handshake means the node silently
    /// dropped us: authentication failure, which latches until credentials
    /// are replaced.
    pub fn on_error(&mut self, err: &NetError, now: Instant) -> ConnStatus {
        let auth_failure = matches!(
            (&self.state, err),
            (
                ConnState::Handshake { .. },
                NetError::Fatal(Violation::Io(io::ErrorKind::UnexpectedEof))
            )
        );

        let status = if auth_failure {
            ConnStatus::AuthenticationFailed
        } else {
            match err {
                NetError::Fatal(Violation::Io(_)) => ConnStatus::SocketError,
                NetError::Fatal(violation) => ConnStatus::ProtocolError(violation.to_string()),
                NetError::Wait => ConnStatus::SocketError,
            }
        };

        logging::warn!(self.log, "connection failed";
                       "addr" => %self.addr,
                       "status" => ?status,
                       "attempt" => self.attempt);

        self.teardown();

        if auth_failure {
            self.state = ConnState::AuthFailed;
        } else {
            self.schedule_retry(now);
        }

        status
    }

    /// Enforces the connect and handshake budgets.
    pub fn check_deadlines(&mut self, now: Instant) -> Option<ConnStatus> {
        let lapsed = match self.state {
            ConnState::Connecting { since } => now.duration_since(since) >= CONNECT_TIMEOUT,
            ConnState::Handshake { since } => now.duration_since(since) >= HANDSHAKE_TIMEOUT,
            _ => false,
        };

        if !lapsed {
            return None;
        }

        logging::warn!(self.log, "connection attempt timed out"; "addr" => %self.addr);

        self.teardown();
        self.schedule_retry(now);
        Some(ConnStatus::ConnectionTimedOut)
    }

    /// Administrative close on node removal or client shutdown.
    pub fn close(&mut self, now: Instant) {
        self.teardown();
        self.state = ConnState::Idle { retry_at: now };
    }

    fn teardown(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }

        self.handshake = None;
        self.flush_waiters.clear();
        self.established_pending = false;
        self.shutdown = None;
    }

    fn schedule_retry(&mut self, now: Instant) {
        let shift = self.attempt.min(7);
        let base = (BACKOFF_BASE_MS << shift).min(BACKOFF_CAP_MS);
        let jitter = rand::thread_rng().gen_range(0.75f64, 1.25f64);
        let delay = Duration::from_millis((base as f64 * jitter) as u64);

        self.attempt += 1;
        self.state = ConnState::Idle {
            retry_at: now + delay,
        };

        logging::debug!(self.log, "redial scheduled";
                        "addr" => %self.addr,
                        "attempt" => self.attempt,
                        "delay_ms" => delay.as_millis() as u64);
    }

    // ------------------------------------------------------------------
    // Dispatcher access
    // ------------------------------------------------------------------

    /// Splits out the pieces an `EventDispatcher` borrows for one fiber
    /// resume.
    #[allow(clippy::type_complexity)]
    pub(crate) fn dispatcher_parts(
        &mut self,
    ) -> (
        bool,
        usize,
        Option<&mut Buffer>,
        &mut Vec<RocId>,
        &mut Vec<RocId>,
        &mut Option<String>,
    ) {
        let connected = matches!(self.state, ConnState::Connected);

        (
            connected,
            self.peer_max_payload,
            self.link.as_mut().map(Link::write_buffer),
            &mut self.flush_waiters,
            &mut self.reconnect_waiters,
            &mut self.shutdown,
        )
    }

    #[cfg(test)]
    pub(crate) fn force_state(&mut self, state: ConnState) {
        self.state = state;
    }

    #[cfg(test)]
    pub(crate) fn park_reconnect_waiter(&mut self, roc: RocId) {
        self.reconnect_waiters.push(roc);
    }
}
