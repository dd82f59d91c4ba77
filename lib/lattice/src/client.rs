//! The client facade: one object composing the connection set, the request
//! set, the RoC pool, the wake queue and the error tracker, driven by a
//! single-threaded `sync` loop over a mio poll. Blocking helpers suspend the
//! caller on connection-set predicates by chaining a transient notifier and
//! spinning the loop.

use crate::config::{Config, ConfigError};
use crate::connection::{ConnStatus, Connection};
use crate::fiber::{resume, EventDispatcher, FiberOutcome, RequestOnConn, RocId, RocPool, WakeQueue};
use crate::registry::{ConnEvent, ConnectionNotifier, ConnectionSet, RegistryError};
use crate::request::controller::ControlAction;
use crate::request::set::{Fan, RequestSet, RequestSpec, RocVerdict};
use crate::shared::{
    NetError, Notification, RequestError, RequestId, Violation, DEFAULT_MAX_PAYLOAD,
};
use crate::stats::RequestStats;
use crate::tracker::{ErrorCounter, NodeErrorTracker};
use hashbrown::HashMap;
use ion::credentials::{Credentials, CredentialsError, Key};
use ion::logging;
use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

const ZERO_TIME: Duration = Duration::from_secs(0);
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Failures while building a client from a configuration file.
#[derive(Debug)]
pub enum SetupError {
    Config(ConfigError),
    Credentials(CredentialsError),
    Io(io::Error),
    /// A client configuration must name a credentials file.
    MissingCredentials,
    Registry(RegistryError),
}

pub struct Client {
    principal: String,
    key: Key,
    conns: ConnectionSet,
    requests: RequestSet,
    pool: RocPool,
    wakes: WakeQueue,
    tracker: NodeErrorTracker,
    poll: mio::Poll,
    events: mio::Events,
    tokens: HashMap<usize, SocketAddr>,
    token_of: HashMap<SocketAddr, usize>,
    next_token: usize,
    /// Deadline applied to requests that do not carry their own.
    default_timeout_micros: u64,
    epoch: Instant,
    log: logging::Logger,
}

impl Client {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        principal: &str,
        key: &Key,
        max_requests: usize,
        error_window_secs: u64,
        log: L,
    ) -> io::Result<Client> {
        Ok(Client {
            principal: principal.to_string(),
            key: *key,
            conns: ConnectionSet::new(),
            requests: RequestSet::new(max_requests),
            pool: RocPool::new(),
            wakes: WakeQueue::new(),
            tracker: NodeErrorTracker::new(error_window_secs),
            poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(1024),
            tokens: HashMap::new(),
            token_of: HashMap::new(),
            next_token: 0,
            default_timeout_micros: 0,
            epoch: Instant::now(),
            log: logging::child(log),
        })
    }

    /// Builds a client from a configuration file: credentials, node list,
    /// request limits and the default request deadline.
    pub fn from_config<'a, L: Into<Option<&'a logging::Logger>>>(
        config: &Config,
        now: Instant,
        log: L,
    ) -> Result<Client, SetupError> {
        let creds_path = config
            .credentials_file
            .as_ref()
            .ok_or(SetupError::MissingCredentials)?;

        let (principal, key) =
            Credentials::single_from_file(creds_path).map_err(SetupError::Credentials)?;

        let mut client = Client::new(
            &principal,
            &key,
            config.max_requests as usize,
            u64::from(config.error_window_s),
            log,
        )
        .map_err(SetupError::Io)?;

        client.default_timeout_micros = u64::from(config.request_timeout_ms) * 1000;

        for addr in config.load_nodes().map_err(SetupError::Config)? {
            client.add_node(addr, now).map_err(SetupError::Registry)?;
        }

        Ok(client)
    }

    /// Registers a callback on the node error tracker, fired when a node's
    /// error rate changes across a second boundary.
    pub fn set_error_tracker_callback<F: FnMut(SocketAddr) + 'static>(&mut self, callback: F) {
        self.tracker.set_updated_callback(callback);
    }

    /// Zeroes the per-request-type timing histograms, keeping their keys.
    pub fn clear_request_stats(&mut self) {
        self.requests.clear_stats();
    }

    fn micros(&self, now: Instant) -> u64 {
        now.checked_duration_since(self.epoch)
            .map_or(0, |elapsed| elapsed.as_micros() as u64)
    }

    fn secs(&self, now: Instant) -> u64 {
        now.checked_duration_since(self.epoch)
            .map_or(0, |elapsed| elapsed.as_secs())
    }

    // ------------------------------------------------------------------
    // Node registry surface
    // ------------------------------------------------------------------

    pub fn add_node(&mut self, addr: SocketAddr, now: Instant) -> Result<(), RegistryError> {
        let conn = Connection::new(
            addr,
            &self.principal,
            &self.key,
            DEFAULT_MAX_PAYLOAD as usize,
            now,
            &self.log,
        );

        self.conns.add(conn)?;

        let token = self.next_token;
        self.next_token += 1;
        self.tokens.insert(token, addr);
        self.token_of.insert(addr, token);

        Ok(())
    }

    /// Removes a node, failing its in-flight RoCs with `NodeDisconnected`.
    pub fn remove_node(&mut self, addr: SocketAddr, now: Instant) -> Result<(), RegistryError> {
        let mut conn = self.conns.remove(addr).ok_or(RegistryError::UnknownAddress)?;

        let rocs = conn.take_rocs();
        conn.close(now);

        for (request_id, roc) in rocs {
            self.pool.remove(roc);
            let verdict = self.requests.on_roc_done(
                request_id,
                addr,
                roc,
                &FiberOutcome::Failed(RequestError::NodeDisconnected),
                self.micros(now),
            );
            self.handle_verdict(request_id, verdict, now);
        }

        if let Some(token) = self.token_of.remove(&addr) {
            self.tokens.remove(&token);
        }
        self.tracker.forget(addr);
        self.conns.notify(&ConnEvent::Shutdown { addr });

        Ok(())
    }

    pub fn disable_node(&mut self, addr: SocketAddr) -> Result<(), RegistryError> {
        self.conns.disable(addr)
    }

    pub fn enable_node(&mut self, addr: SocketAddr) -> Result<(), RegistryError> {
        self.conns.enable(addr)
    }

    pub fn set_connection_notifier<F: FnMut(&ConnEvent) + 'static>(&mut self, notifier: F) {
        self.conns.set_connection_notifier(notifier);
    }

    pub fn registered_count(&self) -> usize {
        self.conns.registered_count()
    }

    pub fn connected_count(&self) -> usize {
        self.conns.connected_count()
    }

    pub fn stats(&self) -> &RequestStats {
        self.requests.stats()
    }

    pub fn error_rate(&self, addr: SocketAddr, now: Instant) -> f64 {
        self.tracker.error_rate(addr, self.secs(now))
    }

    // ------------------------------------------------------------------
    // Request assignment
    // ------------------------------------------------------------------

    /// Fans the request out to every selectable node.
    pub fn assign_all_nodes(
        &mut self,
        mut spec: RequestSpec,
        now: Instant,
    ) -> Result<RequestId, RequestError> {
        if spec.timeout_micros == 0 {
            spec.timeout_micros = self.default_timeout_micros;
        }

        let targets: Vec<SocketAddr> = self.conns.selectable().collect();
        let id = self.requests.assign(spec, Fan::AllNodes, self.micros(now))?;

        if targets.is_empty() {
            self.requests.abort(id, RequestError::NoResponsibleNode, self.micros(now));
            return Ok(id);
        }

        for addr in targets {
            self.spawn_roc(id, addr);
        }

        Ok(id)
    }

    /// Runs the request on the node selected by the key, failing over to
    /// the next candidate on error.
    pub fn assign_single_node(
        &mut self,
        mut spec: RequestSpec,
        key: &[u8],
        now: Instant,
    ) -> Result<RequestId, RequestError> {
        if spec.timeout_micros == 0 {
            spec.timeout_micros = self.default_timeout_micros;
        }

        let key_hash = hash_key(key);
        let fan = Fan::SingleNode { key_hash, attempt: 0 };
        let id = self.requests.assign(spec, fan, self.micros(now))?;

        match self.conns.select(key_hash, 0) {
            Some(addr) => {
                self.spawn_roc(id, addr);
            }
            None => {
                self.requests.abort(id, RequestError::NoResponsibleNode, self.micros(now));
            }
        }

        Ok(id)
    }

    /// Dispatches a controller action for an in-flight request. False when
    /// the request is unknown or already finished.
    pub fn control(&mut self, id: RequestId, action: ControlAction) -> bool {
        match self.requests.control(id, action) {
            Some(wakes) => {
                self.wakes.extend(wakes);
                true
            }
            None => false,
        }
    }

    fn spawn_roc(&mut self, id: RequestId, addr: SocketAddr) -> bool {
        let fiber = match self.requests.make_fiber(id) {
            Some(fiber) => fiber,
            None => return false,
        };

        let roc = self.pool.insert(RequestOnConn::new(id, addr, fiber));

        match self.conns.get_mut(addr) {
            Some(conn) => conn.register_roc(id, roc),
            None => {
                self.pool.remove(roc);
                return false;
            }
        }

        self.requests.add_roc(id, addr, roc);
        self.wakes.push(roc, resume::STARTED);
        true
    }

    // ------------------------------------------------------------------
    // Drive loop
    // ------------------------------------------------------------------

    /// One pass of the drive loop with a non-blocking poll.
    pub fn sync(&mut self, now: Instant) {
        self.sync_with_timeout(now, Some(ZERO_TIME));
    }

    fn sync_with_timeout(&mut self, now: Instant, timeout: Option<Duration>) {
        self.dial_due(now);

        self.poll.poll(&mut self.events, timeout).expect("Client poll failed");

        let mut ready: HashMap<SocketAddr, (bool, bool)> = HashMap::new();
        for event in &self.events {
            if let Some(&addr) = self.tokens.get(&event.token().0) {
                let entry = ready.entry(addr).or_insert((false, false));
                entry.0 |= event.readiness().is_readable();
                entry.1 |= event.readiness().is_writable();
            }
        }

        for (addr, (readable, writable)) in ready {
            self.pump_conn(addr, readable, writable, now);
        }

        self.check_conn_deadlines(now);
        self.run_wakes(now);
        self.flush_all(now);
        self.expire_requests(now);
    }

    fn dial_due(&mut self, now: Instant) {
        let due: Vec<SocketAddr> = self
            .conns
            .iter_mut()
            .filter(|conn| conn.needs_dial(now))
            .map(|conn| conn.addr())
            .collect();

        for addr in due {
            let token = match self.token_of.get(&addr) {
                Some(&token) => token,
                None => continue,
            };

            let result = {
                let poll = &self.poll;
                let conn = match self.conns.get_mut(addr) {
                    Some(conn) => conn,
                    None => continue,
                };

                conn.dial(now).and_then(|stream| {
                    poll.register(
                        stream,
                        mio::Token(token),
                        mio::Ready::readable() | mio::Ready::writable(),
                        mio::PollOpt::edge(),
                    )
                })
            };

            if let Err(err) = result {
                let status = {
                    let conn = self.conns.get_mut(addr).expect("Connection vanished mid-dial");
                    conn.on_error(&err.into(), now)
                };
                self.handle_conn_failure(addr, status, now);
            }
        }
    }

    fn pump_conn(&mut self, addr: SocketAddr, readable: bool, writable: bool, now: Instant) {
        let outcome = {
            let conn = match self.conns.get_mut(addr) {
                Some(conn) => conn,
                None => return,
            };

            conn.advance(now, readable, writable)
                .and_then(|()| conn.drain_frames(now))
        };

        match outcome {
            Ok(inbound) => {
                for (request_id, payload) in inbound {
                    self.route_inbound(addr, request_id, payload);
                }

                self.after_progress(addr);
            }
            Err(NetError::Wait) => (),
            Err(err) => {
                let status = {
                    let conn = self.conns.get_mut(addr).expect("Connection vanished mid-pump");
                    conn.on_error(&err, now)
                };
                self.handle_conn_failure(addr, status, now);
            }
        }
    }

    fn route_inbound(&mut self, addr: SocketAddr, request_id: RequestId, payload: Vec<u8>) {
        let roc = self.conns.get(addr).and_then(|conn| conn.roc_for(request_id));

        match roc {
            Some(roc) => {
                if self.pool.push_message(roc, payload) {
                    self.wakes.push(roc, resume::RECEIVED);
                }
            }
            None => {
                logging::trace!(self.log, "message for unknown request dropped";
                                "addr" => %addr,
                                "request_id" => request_id);
            }
        }
    }

    /// Post-pump bookkeeping: handshake completion and drained writers.
    fn after_progress(&mut self, addr: SocketAddr) {
        let (established, flush_wakes, reconnect_wakes) = {
            let conn = match self.conns.get_mut(addr) {
                Some(conn) => conn,
                None => return,
            };

            let established = conn.take_established();
            let reconnect = if established {
                conn.take_reconnect_waiters()
            } else {
                Vec::new()
            };

            (established, conn.take_flush_waiters(), reconnect)
        };

        if established {
            self.conns.notify(&ConnEvent::Established { addr });
        }

        for roc in flush_wakes {
            self.wakes.push(roc, resume::FLUSHED);
        }

        for roc in reconnect_wakes {
            self.wakes.push(roc, resume::RECONNECTED);
        }
    }

    fn check_conn_deadlines(&mut self, now: Instant) {
        let lapsed: Vec<(SocketAddr, ConnStatus)> = self
            .conns
            .iter_mut()
            .filter_map(|conn| {
                let addr = conn.addr();
                conn.check_deadlines(now).map(|status| (addr, status))
            })
            .collect();

        for (addr, status) in lapsed {
            self.handle_conn_failure(addr, status, now);
        }
    }

    fn run_wakes(&mut self, now: Instant) {
        while let Some((roc, code)) = self.wakes.pop() {
            self.run_fiber(roc, code, now);
        }
    }

    fn run_fiber(&mut self, roc_id: RocId, code: i32, now: Instant) {
        let (request_id, addr) = match self.pool.get(roc_id) {
            Some(roc) => (roc.request_id, roc.node),
            None => return,
        };

        let conn = match self.conns.get_mut(addr) {
            Some(conn) => conn,
            None => return,
        };

        let roc = self.pool.get_mut(roc_id).expect("RoC vanished mid-resume");

        let mut fiber = match roc.fiber.take() {
            Some(fiber) => fiber,
            None => return,
        };

        let mut wakes: Vec<(RocId, i32)> = Vec::new();
        let mut notifications: Vec<(RequestId, Notification)> = Vec::new();

        let outcome = {
            let (connected, max_payload, write, flush_waiters, reconnect_waiters, shutdown) =
                conn.dispatcher_parts();

            let mut io = EventDispatcher::new(
                roc_id,
                request_id,
                addr,
                connected,
                max_payload,
                write,
                &mut roc.mailbox,
                flush_waiters,
                reconnect_waiters,
                &mut wakes,
                &mut notifications,
                shutdown,
            );

            fiber.resume(&mut io, code)
        };

        let shutdown_reason = conn.take_shutdown();

        let finished = match outcome {
            FiberOutcome::Pending => {
                roc.fiber = Some(fiber);
                false
            }
            FiberOutcome::Complete { .. } | FiberOutcome::Failed(_) => {
                conn.unregister_roc(request_id);
                true
            }
        };

        self.wakes.extend(wakes);

        for (id, notification) in notifications {
            self.requests.notify(id, &notification);
        }

        if finished {
            self.pool.remove(roc_id);
            let verdict = self
                .requests
                .on_roc_done(request_id, addr, roc_id, &outcome, self.micros(now));
            self.handle_verdict(request_id, verdict, now);
        }

        if let Some(reason) = shutdown_reason {
            self.conn_protocol_failure(addr, reason, now);
        }
    }

    fn handle_verdict(&mut self, id: RequestId, verdict: RocVerdict, now: Instant) {
        match verdict {
            RocVerdict::None => (),
            RocVerdict::Failover { key_hash, attempt } => match self.conns.select(key_hash, attempt) {
                Some(next) => {
                    logging::debug!(self.log, "failing request over";
                                    "request_id" => id,
                                    "next" => %next,
                                    "attempt" => attempt as u64);
                    self.spawn_roc(id, next);
                }
                None => {
                    let rocs = self
                        .requests
                        .abort(id, RequestError::NoResponsibleNode, self.micros(now));
                    self.teardown_rocs(rocs);
                }
            },
        }
    }

    fn teardown_rocs(&mut self, rocs: Vec<(SocketAddr, RocId)>) {
        for (addr, roc) in rocs {
            if let Some(removed) = self.pool.remove(roc) {
                if let Some(conn) = self.conns.get_mut(addr) {
                    conn.unregister_roc(removed.request_id);
                }
            }
        }
    }

    /// A fiber called `shutdown_with_protocol_error`: tear the connection
    /// down and fail every RoC still on it.
    fn conn_protocol_failure(&mut self, addr: SocketAddr, reason: String, now: Instant) {
        let (status, rocs) = {
            let conn = match self.conns.get_mut(addr) {
                Some(conn) => conn,
                None => return,
            };

            let rocs = conn.take_rocs();
            let status = conn.on_error(&NetError::Fatal(Violation::Shutdown(reason)), now);
            (status, rocs)
        };

        self.fail_rocs(addr, rocs, RequestError::ProtocolError, now);
        self.report_conn_failure(addr, &status, now);
    }

    fn fail_rocs(
        &mut self,
        addr: SocketAddr,
        rocs: Vec<(RequestId, RocId)>,
        kind: RequestError,
        now: Instant,
    ) {
        for (request_id, roc) in rocs {
            self.pool.remove(roc);
            let verdict = self.requests.on_roc_done(
                request_id,
                addr,
                roc,
                &FiberOutcome::Failed(kind),
                self.micros(now),
            );
            self.handle_verdict(request_id, verdict, now);
        }
    }

    /// Applies a classified connection failure: notifier, error tracker,
    /// and RoC wakeups. Protocol errors fail the RoCs outright; transport
    /// drops wake them with `DISCONNECTED` so the request policies decide.
    fn handle_conn_failure(&mut self, addr: SocketAddr, status: ConnStatus, now: Instant) {
        if let ConnStatus::ProtocolError(_) = status {
            let rocs = match self.conns.get_mut(addr) {
                Some(conn) => conn.take_rocs(),
                None => Vec::new(),
            };
            self.fail_rocs(addr, rocs, RequestError::ProtocolError, now);
            self.report_conn_failure(addr, &status, now);
            return;
        }

        let (wake, parked): (Vec<RocId>, Vec<RocId>) = match self.conns.get_mut(addr) {
            Some(conn) => {
                let parked = conn.parked_reconnect_waiters().to_vec();
                (conn.roc_ids().collect(), parked)
            }
            None => (Vec::new(), Vec::new()),
        };

        for roc in wake {
            if let Some(slot) = self.pool.get_mut(roc) {
                // Mailboxes do not survive a disconnect.
                slot.mailbox.clear();
            }

            if !parked.contains(&roc) {
                self.wakes.push(roc, resume::DISCONNECTED);
            }
        }

        self.report_conn_failure(addr, &status, now);
    }

    fn report_conn_failure(&mut self, addr: SocketAddr, status: &ConnStatus, now: Instant) {
        let now_secs = self.secs(now);

        let event = match status {
            ConnStatus::Established => return,
            ConnStatus::AuthenticationFailed => {
                self.tracker.record(addr, ErrorCounter::Errors, now_secs);
                ConnEvent::AuthenticationFailed { addr }
            }
            ConnStatus::SocketError => {
                self.tracker.record(addr, ErrorCounter::Errors, now_secs);
                ConnEvent::SocketError { addr }
            }
            ConnStatus::ConnectionTimedOut => {
                self.tracker.record(addr, ErrorCounter::ConnTimeouts, now_secs);
                ConnEvent::ConnectionTimedOut { addr }
            }
            ConnStatus::ProtocolError(reason) => {
                self.tracker.record(addr, ErrorCounter::Errors, now_secs);
                ConnEvent::ProtocolError {
                    addr,
                    reason: reason.clone(),
                }
            }
        };

        self.conns.notify(&event);
    }

    fn flush_all(&mut self, now: Instant) {
        let addrs: Vec<SocketAddr> = self.conns.addrs().collect();

        for addr in addrs {
            let result = {
                let conn = match self.conns.get_mut(addr) {
                    Some(conn) => conn,
                    None => continue,
                };

                conn.flush(now)
            };

            match result {
                Ok(()) => self.after_progress(addr),
                Err(err) => {
                    let status = {
                        let conn = self.conns.get_mut(addr).expect("Connection vanished mid-flush");
                        conn.on_error(&err, now)
                    };
                    self.handle_conn_failure(addr, status, now);
                }
            }
        }

        if !self.wakes.is_empty() {
            self.run_wakes(now);
        }
    }

    fn expire_requests(&mut self, now: Instant) {
        let lapsed = self.requests.expire(self.micros(now));

        for id in lapsed {
            logging::debug!(self.log, "request deadline lapsed"; "request_id" => id);

            let rocs = self.requests.abort(id, RequestError::IoTimedOut, self.micros(now));
            let now_secs = self.secs(now);

            for &(addr, _) in &rocs {
                self.tracker.record(addr, ErrorCounter::IoTimeouts, now_secs);
            }

            self.teardown_rocs(rocs);
        }
    }

    // ------------------------------------------------------------------
    // Task blocking
    // ------------------------------------------------------------------

    /// Blocks the caller until every registered node is connected. With no
    /// nodes registered the condition holds trivially and the call returns
    /// at once.
    pub fn wait_all_nodes_connected(&mut self) {
        self.wait_for(|conns| conns.connected_count() == conns.registered_count());
    }

    /// Blocks the caller until at least one node is connected.
    pub fn wait_min_one_node_connected(&mut self) {
        self.wait_for(|conns| conns.connected_count() >= 1);
    }

    /// Spins the drive loop until the predicate holds, with a transient
    /// connection notifier chained in front of any pre-existing one.
    fn wait_for<P: Fn(&ConnectionSet) -> bool>(&mut self, predicate: P) {
        let previous: Rc<RefCell<Option<ConnectionNotifier>>> =
            Rc::new(RefCell::new(self.conns.replace_notifier(None)));

        let delegate = Rc::clone(&previous);
        self.conns.set_connection_notifier(move |event| {
            if let Some(notifier) = delegate.borrow_mut().as_mut() {
                notifier(event);
            }
        });

        while !predicate(&self.conns) {
            let now = Instant::now();
            self.sync_with_timeout(now, Some(WAIT_POLL_INTERVAL));
        }

        let restored = previous.borrow_mut().take();
        self.conns.replace_notifier(restored);
    }
}

fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(key);
    hasher.finish()
}
