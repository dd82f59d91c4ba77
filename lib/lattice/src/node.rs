//! Node side endpoint: accepts connections, runs the authenticating half of
//! the handshake, answers every new request with a status frame, and drives
//! the request fibers registered for each (code, version) pair.

use crate::auth::{NodeHandshake, NodeStep};
use crate::fiber::{resume, EventDispatcher, FiberOutcome, RequestOnConn, RocFiber, RocId, RocPool, WakeQueue};
use crate::link::Link;
use crate::parse::MessageParser;
use crate::request::{RequestCode, RequestVersion};
use crate::shared::{
    GlobalStatus, NetError, NetResult, Notification, RequestId, Violation, CONTROL_ID,
};
use hashbrown::HashMap;
use ion::credentials::Credentials;
use ion::logging;
use mio::net::TcpListener;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const INGRESS_TIMEOUT: Duration = Duration::from_secs(30);
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(3);
const ZERO_TIME: Duration = Duration::from_secs(0);
const LISTENER_TOKEN: mio::Token = mio::Token(0);

/// Builds the fiber answering one accepted request. `body` holds the opening
/// payload after the code and version fields; argument validation happens
/// inside the fiber, which can answer with request-defined error messages.
pub trait RequestFactory {
    fn spawn(&self, body: &[u8]) -> Box<dyn RocFiber>;
}

impl<F> RequestFactory for F
where
    F: Fn(&[u8]) -> Box<dyn RocFiber>,
{
    fn spawn(&self, body: &[u8]) -> Box<dyn RocFiber> {
        self(body)
    }
}

enum ConnPhase {
    Handshake { hs: NodeHandshake, since: Instant },
    Connected { principal: String },
}

struct NodeConn {
    peer: SocketAddr,
    link: Link,
    phase: ConnPhase,
    rocs: HashMap<RequestId, RocId>,
    flush_waiters: Vec<RocId>,
    reconnect_waiters: Vec<RocId>,
    shutdown: Option<String>,
}

impl NodeConn {
    fn is_connected(&self) -> bool {
        matches!(self.phase, ConnPhase::Connected { .. })
    }
}

pub struct NodeEndpoint {
    listener: TcpListener,
    poll: mio::Poll,
    events: mio::Events,
    credentials: Credentials,
    handlers: HashMap<(RequestCode, RequestVersion), Box<dyn RequestFactory>>,
    conns: Vec<Option<NodeConn>>,
    free: Vec<usize>,
    pool: RocPool,
    roc_conns: HashMap<RocId, usize>,
    wakes: WakeQueue,
    max_payload: usize,
    minor_version: u16,
    connection_limit: Option<usize>,
    housekeeping_time: Instant,
    log: logging::Logger,
}

impl NodeEndpoint {
    pub fn bind<'a, L: Into<Option<&'a logging::Logger>>>(
        addr: SocketAddr,
        credentials: Credentials,
        max_payload: usize,
        minor_version: u16,
        now: Instant,
        log: L,
    ) -> io::Result<NodeEndpoint> {
        let listener = TcpListener::bind(&addr)?;
        let poll = mio::Poll::new()?;

        poll.register(&listener, LISTENER_TOKEN, mio::Ready::readable(), mio::PollOpt::edge())?;

        Ok(NodeEndpoint {
            listener,
            poll,
            events: mio::Events::with_capacity(1024),
            credentials,
            handlers: HashMap::new(),
            conns: Vec::new(),
            free: Vec::new(),
            pool: RocPool::new(),
            roc_conns: HashMap::new(),
            wakes: WakeQueue::new(),
            max_payload,
            minor_version,
            connection_limit: None,
            housekeeping_time: now,
            log: logging::child(log),
        })
    }

    /// Caps the number of concurrently accepted connections. Connections
    /// above the cap are closed right after `accept`.
    pub fn set_connection_limit(&mut self, limit: Option<usize>) {
        self.connection_limit = limit;
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn register_handler<F: RequestFactory + 'static>(
        &mut self,
        code: RequestCode,
        version: RequestVersion,
        factory: F,
    ) {
        self.handlers.insert((code, version), Box::new(factory));
    }

    /// Connections with a completed handshake.
    pub fn connected_count(&self) -> usize {
        self.conns
            .iter()
            .flatten()
            .filter(|conn| conn.is_connected())
            .count()
    }

    pub fn live_roc_count(&self) -> usize {
        self.pool.live_count()
    }

    /// Wakes the fibers of one request, e.g. with `DATA_READY` when a
    /// waiting stream's source fills up.
    pub fn wake_request(&mut self, request_id: RequestId, code: i32) {
        for conn in self.conns.iter() {
            let conn = match conn {
                Some(conn) => conn,
                None => continue,
            };

            if let Some(&roc) = conn.rocs.get(&request_id) {
                self.wakes.push(roc, code);
            }
        }
    }

    /// One pass of the drive loop: accept, pump sockets, run woken fibers,
    /// flush, housekeep.
    pub fn sync(&mut self, now: Instant) {
        self.poll
            .poll(&mut self.events, Some(ZERO_TIME))
            .expect("Node poll failed");

        let mut ready: Vec<(usize, bool, bool)> = Vec::new();
        let mut accept = false;

        for event in &self.events {
            if event.token() == LISTENER_TOKEN {
                accept = true;
            } else {
                let index = event.token().0 - 1;
                let readiness = event.readiness();
                ready.push((index, readiness.is_readable(), readiness.is_writable()));
            }
        }

        if accept {
            self.accept_connections(now);
        }

        for (index, readable, writable) in ready {
            self.pump_conn(index, readable, writable, now);
        }

        self.run_wakes(now);
        self.flush_all(now);

        if now.duration_since(self.housekeeping_time) >= HOUSEKEEPING_INTERVAL {
            self.housekeeping(now);
            self.housekeeping_time = now;
        }
    }

    fn accept_connections(&mut self, now: Instant) {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::warn!(self.log, "accept failed"; "error" => %err);
                    break;
                }
            };

            if let Some(limit) = self.connection_limit {
                let live = self.conns.iter().flatten().count();
                if live >= limit {
                    logging::warn!(self.log, "connection limit reached, peer refused";
                                   "peer" => %peer,
                                   "limit" => limit);
                    drop(stream);
                    continue;
                }
            }

            let index = match self.free.pop() {
                Some(index) => index,
                None => {
                    self.conns.push(None);
                    self.conns.len() - 1
                }
            };

            let register = self.poll.register(
                &stream,
                mio::Token(index + 1),
                mio::Ready::readable() | mio::Ready::writable(),
                mio::PollOpt::edge(),
            );

            if let Err(err) = register {
                logging::warn!(self.log, "stream registration failed"; "error" => %err);
                self.free.push(index);
                continue;
            }

            logging::debug!(self.log, "connection accepted"; "peer" => %peer, "slot" => index);

            self.conns[index] = Some(NodeConn {
                peer,
                link: Link::new(stream, now),
                phase: ConnPhase::Handshake {
                    hs: NodeHandshake::new(self.max_payload as u32, self.minor_version),
                    since: now,
                },
                rocs: HashMap::new(),
                flush_waiters: Vec::new(),
                reconnect_waiters: Vec::new(),
                shutdown: None,
            });
        }
    }

    fn pump_conn(&mut self, index: usize, readable: bool, _writable: bool, now: Instant) {
        let result = self.pump_conn_inner(index, readable, now);

        if let Err(err) = result {
            if err != NetError::Wait {
                self.drop_conn(index, &format!("{:?}", err), now);
            }
        }
    }

    fn pump_conn_inner(&mut self, index: usize, readable: bool, now: Instant) -> NetResult<()> {
        {
            let conn = match self.conns.get_mut(index).and_then(Option::as_mut) {
                Some(conn) => conn,
                None => return Ok(()),
            };

            if readable {
                conn.link.receive(now)?;
            }
        }

        loop {
            let frame = {
                let conn = self.conns[index].as_mut().expect("Connection vanished mid-pump");
                match conn.link.next_frame(self.max_payload) {
                    Ok(frame) => frame,
                    Err(NetError::Wait) => break,
                    Err(err) => return Err(err),
                }
            };

            self.route_frame(index, frame.0, frame.1, now)?;
        }

        let conn = self.conns[index].as_mut().expect("Connection vanished mid-pump");
        conn.link.flush(now)?;

        if !conn.link.has_egress() && !conn.flush_waiters.is_empty() {
            let waiters = std::mem::replace(&mut conn.flush_waiters, Vec::new());
            for roc in waiters {
                self.wakes.push(roc, resume::FLUSHED);
            }
        }

        Ok(())
    }

    fn route_frame(
        &mut self,
        index: usize,
        request_id: RequestId,
        payload: Vec<u8>,
        now: Instant,
    ) -> NetResult<()> {
        let conn = self.conns[index].as_mut().expect("Routing frame on a dead slot");

        if request_id == CONTROL_ID {
            return Self::handshake_step(conn, &payload, &self.credentials, &self.log, now);
        }

        if !conn.is_connected() {
            return Err(NetError::Fatal(Violation::UnauthenticatedFrame));
        }

        if let Some(&roc) = conn.rocs.get(&request_id) {
            if self.pool.push_message(roc, payload) {
                self.wakes.push(roc, resume::RECEIVED);
            }
            return Ok(());
        }

        self.open_request(index, request_id, &payload)
    }

    fn handshake_step(
        conn: &mut NodeConn,
        payload: &[u8],
        credentials: &Credentials,
        log: &logging::Logger,
        _now: Instant,
    ) -> NetResult<()> {
        let hs = match &mut conn.phase {
            ConnPhase::Handshake { hs, .. } => hs,
            ConnPhase::Connected { .. } => {
                return Err(NetError::Fatal(Violation::UnexpectedControlFrame));
            }
        };

        match hs.on_frame(payload, credentials)? {
            NodeStep::SendNonce(nonce) => {
                must_enqueue(conn.link.enqueue_frame(CONTROL_ID, &nonce))?;
            }
            NodeStep::Established { principal, welcome } => {
                must_enqueue(conn.link.enqueue_frame(CONTROL_ID, &welcome))?;

                logging::info!(log, "peer authenticated";
                               "peer" => %conn.peer,
                               "principal" => &principal);

                conn.phase = ConnPhase::Connected { principal };
            }
        }

        Ok(())
    }

    /// Answers the opening frame of a new request with a status frame and,
    /// when the (code, version) pair is known, spawns its fiber.
    fn open_request(&mut self, index: usize, request_id: RequestId, payload: &[u8]) -> NetResult<()> {
        let mut parser = MessageParser::new(payload);
        let code: RequestCode = parser.get_value()?;
        let version: RequestVersion = parser.get_value()?;

        let status = if self.handlers.contains_key(&(code, version)) {
            GlobalStatus::None
        } else if self.handlers.keys().any(|&(known, _)| known == code) {
            GlobalStatus::RequestVersionNotSupported
        } else {
            GlobalStatus::RequestNotSupported
        };

        logging::debug!(self.log, "request opened";
                        "request_id" => request_id,
                        "code" => code,
                        "version" => version,
                        "status" => ?status);

        let conn = self.conns[index].as_mut().expect("Opening request on a dead slot");
        must_enqueue(conn.link.enqueue_frame(request_id, &[status as u8]))?;

        if status != GlobalStatus::None {
            return Ok(());
        }

        let body = &payload[parser_offset(payload, parser)..];
        let fiber = self.handlers[&(code, version)].spawn(body);

        let roc = self
            .pool
            .insert(RequestOnConn::new(request_id, conn.peer, fiber));
        conn.rocs.insert(request_id, roc);
        self.roc_conns.insert(roc, index);
        self.wakes.push(roc, resume::STARTED);

        Ok(())
    }

    fn run_wakes(&mut self, now: Instant) {
        while let Some((roc, code)) = self.wakes.pop() {
            self.run_fiber(roc, code, now);
        }
    }

    fn run_fiber(&mut self, roc_id: RocId, code: i32, now: Instant) {
        let index = match self.roc_conns.get(&roc_id) {
            Some(&index) => index,
            None => return,
        };

        let conn = match self.conns.get_mut(index).and_then(Option::as_mut) {
            Some(conn) => conn,
            None => return,
        };

        let roc = match self.pool.get_mut(roc_id) {
            Some(roc) => roc,
            None => return,
        };

        let mut fiber = match roc.fiber.take() {
            Some(fiber) => fiber,
            None => return,
        };

        let request_id = roc.request_id;
        let peer = roc.node;
        let connected = conn.is_connected();

        let mut wakes: Vec<(RocId, i32)> = Vec::new();
        // Node side fibers have no client notifier; the sink is discarded.
        let mut notifications: Vec<(RequestId, Notification)> = Vec::new();

        let outcome = {
            let mut io = EventDispatcher::new(
                roc_id,
                request_id,
                peer,
                connected,
                self.max_payload,
                Some(conn.link.write_buffer()),
                &mut roc.mailbox,
                &mut conn.flush_waiters,
                &mut conn.reconnect_waiters,
                &mut wakes,
                &mut notifications,
                &mut conn.shutdown,
            );

            fiber.resume(&mut io, code)
        };

        self.wakes.extend(wakes);

        match outcome {
            FiberOutcome::Pending => {
                roc.fiber = Some(fiber);
            }
            FiberOutcome::Complete { .. } | FiberOutcome::Failed(_) => {
                conn.rocs.remove(&request_id);
                self.pool.remove(roc_id);
                self.roc_conns.remove(&roc_id);
            }
        }

        if let Some(reason) = self.conns[index].as_mut().and_then(|conn| conn.shutdown.take()) {
            self.drop_conn(index, &reason, now);
        }
    }

    fn flush_all(&mut self, now: Instant) {
        let mut failed: Vec<usize> = Vec::new();

        for (index, conn) in self.conns.iter_mut().enumerate() {
            let conn = match conn {
                Some(conn) => conn,
                None => continue,
            };

            if conn.link.has_egress() && conn.link.flush(now).is_err() {
                failed.push(index);
                continue;
            }

            if !conn.link.has_egress() && !conn.flush_waiters.is_empty() {
                let waiters = std::mem::replace(&mut conn.flush_waiters, Vec::new());
                for roc in waiters {
                    self.wakes.push(roc, resume::FLUSHED);
                }
            }
        }

        for index in failed {
            self.drop_conn(index, "flush failed", now);
        }

        if !self.wakes.is_empty() {
            self.run_wakes(now);
        }
    }

    fn housekeeping(&mut self, now: Instant) {
        let mut lapsed: Vec<(usize, &'static str)> = Vec::new();

        for (index, conn) in self.conns.iter().enumerate() {
            let conn = match conn {
                Some(conn) => conn,
                None => continue,
            };

            match &conn.phase {
                ConnPhase::Handshake { since, .. } => {
                    if now.duration_since(*since) >= HANDSHAKE_TIMEOUT {
                        lapsed.push((index, "handshake timed out"));
                    }
                }
                ConnPhase::Connected { .. } => {
                    if conn.link.last_ingress_elapsed(now) >= INGRESS_TIMEOUT {
                        lapsed.push((index, "peer idle"));
                    }
                }
            }
        }

        for (index, reason) in lapsed {
            self.drop_conn(index, reason, now);
        }
    }

    fn drop_conn(&mut self, index: usize, reason: &str, _now: Instant) {
        let conn = match self.conns.get_mut(index).and_then(Option::take) {
            Some(conn) => conn,
            None => return,
        };

        let principal = match &conn.phase {
            ConnPhase::Connected { principal } => principal.as_str(),
            ConnPhase::Handshake { .. } => "<unauthenticated>",
        };

        logging::debug!(self.log, "dropping connection";
                        "peer" => %conn.peer,
                        "principal" => principal,
                        "reason" => reason,
                        "rocs" => conn.rocs.len());

        for (_, roc) in conn.rocs {
            self.pool.remove(roc);
            self.roc_conns.remove(&roc);
        }

        drop(self.poll.deregister(conn.link.stream()));
        conn.link.close();
        self.free.push(index);
    }
}

/// Offset of the unparsed remainder within the original payload.
fn parser_offset(payload: &[u8], parser: MessageParser<'_>) -> usize {
    payload.len() - parser.remaining()
}

/// Control and status frames must never be dropped for lack of buffer
/// space; a peer that keeps the writer that far behind is torn down.
fn must_enqueue(result: NetResult<()>) -> NetResult<()> {
    match result {
        Err(NetError::Wait) => Err(NetError::Fatal(Violation::Shutdown(
            "write buffer full during control exchange".to_string(),
        ))),
        other => other,
    }
}
