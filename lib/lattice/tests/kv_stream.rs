//! Loopback exercise of the full stack: authentication, single-node and
//! all-nodes requests, suspendable streaming with control acks, reconnect
//! behavior and protocol-error isolation. The key/value protocol below
//! exists only for these tests.

use ion::credentials::Credentials;
use lattice::client::Client;
use lattice::fiber::{EventDispatcher, FiberOutcome, RocFiber, Step};
use lattice::node::NodeEndpoint;
use lattice::parse::{MessageBuilder, MessageParser};
use lattice::registry::ConnEvent;
use lattice::request::controller::ControlAction;
use lattice::request::set::RequestSpec;
use lattice::request::skeleton::SkeletonRoc;
use lattice::request::suspendable::{
    ReceivedMessageAction, RecordSource, SourceStep, StreamProtocol, SuspendableStream,
};
use lattice::request::{
    AbortOnDisconnect, Handler, HandlerStep, Initializer, RequestCode, WaitConnector,
};
use lattice::request::context::RequestContext;
use lattice::shared::{
    Notification, RequestError, DEFAULT_MAX_PAYLOAD, PROTOCOL_MINOR_VERSION,
};
use lattice::stats::RequestType;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const PUT: RequestCode = 0x01;
const GET: RequestCode = 0x02;
const GET_ALL: RequestCode = 0x03;
const VERSION: u8 = 1;

const MSG_OK: u8 = 1;
const MSG_VALUE: u8 = 2;
const MSG_EMPTY: u8 = 3;
const MSG_RECORD: u8 = 4;
const MSG_ACK: u8 = 5;
const MSG_END: u8 = 6;
const CTL_SUSPEND: u8 = 20;
const CTL_RESUME: u8 = 21;
const CTL_STOP: u8 = 22;

const CHANNEL: &str = "kv";

type Table = Rc<RefCell<HashMap<u64, Vec<u8>>>>;
type Notes = Rc<RefCell<Vec<Notification>>>;

// ----------------------------------------------------------------------
// Node side fibers
// ----------------------------------------------------------------------

struct PutFiber {
    key: u64,
    value: Vec<u8>,
    table: Table,
    applied: bool,
}

impl RocFiber for PutFiber {
    fn resume(&mut self, io: &mut EventDispatcher<'_>, _code: i32) -> FiberOutcome {
        if !self.applied {
            self.table.borrow_mut().insert(self.key, self.value.clone());
            self.applied = true;
        }

        match io.send(|builder| {
            builder.add_value(MSG_OK);
        }) {
            Ok(Step::Done) => FiberOutcome::Complete { participated: true },
            Ok(Step::Pending) => FiberOutcome::Pending,
            Err(err) => FiberOutcome::Failed(err),
        }
    }
}

struct GetFiber {
    key: u64,
    table: Table,
}

impl RocFiber for GetFiber {
    fn resume(&mut self, io: &mut EventDispatcher<'_>, _code: i32) -> FiberOutcome {
        let value = self.table.borrow().get(&self.key).cloned();

        let step = io.send(|builder| match &value {
            Some(value) => {
                builder.add_value(MSG_VALUE).add_array(value);
            }
            None => {
                builder.add_value(MSG_EMPTY);
            }
        });

        match step {
            Ok(Step::Done) => FiberOutcome::Complete { participated: true },
            Ok(Step::Pending) => FiberOutcome::Pending,
            Err(err) => FiberOutcome::Failed(err),
        }
    }
}

struct TableSource {
    records: Vec<(u64, Vec<u8>)>,
    index: usize,
    pending_after: Option<usize>,
}

impl RecordSource for TableSource {
    fn next(&mut self) -> SourceStep {
        if let Some(limit) = self.pending_after {
            if self.index >= limit {
                return SourceStep::Pending;
            }
        }

        if self.index >= self.records.len() {
            return SourceStep::End;
        }

        let (key, value) = &self.records[self.index];
        self.index += 1;

        let mut builder = MessageBuilder::new();
        builder.add_value(*key).add_array(value);
        SourceStep::Record(builder.into_payload())
    }
}

struct KvStreamProtocol;

impl StreamProtocol for KvStreamProtocol {
    fn classify(&self, payload: &[u8]) -> ReceivedMessageAction {
        match payload.first() {
            Some(&CTL_SUSPEND) => ReceivedMessageAction::Suspend,
            Some(&CTL_RESUME) => ReceivedMessageAction::Resume,
            Some(&CTL_STOP) => ReceivedMessageAction::Exit,
            _ => ReceivedMessageAction::Undefined,
        }
    }

    fn record(&self, builder: &mut MessageBuilder, data: &[u8]) {
        builder.add_value(MSG_RECORD);
        builder.add_tail(data);
    }

    fn ack(&self, builder: &mut MessageBuilder) {
        builder.add_value(MSG_ACK);
    }

    fn end(&self, builder: &mut MessageBuilder) {
        builder.add_value(MSG_END);
    }

    fn channel_removed(&self, builder: &mut MessageBuilder) {
        builder.add_value(MSG_END);
    }
}

// ----------------------------------------------------------------------
// Node harness
// ----------------------------------------------------------------------

struct NodeHarness {
    addr: SocketAddr,
    stop: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl NodeHarness {
    fn stop(&mut self) {
        drop(self.stop.send(()));
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
    }
}

impl Drop for NodeHarness {
    fn drop(&mut self) {
        self.stop();
    }
}

fn start_node(
    bind: SocketAddr,
    creds_text: String,
    seed: Vec<(u64, Vec<u8>)>,
    stream_pending_after: Option<usize>,
) -> NodeHarness {
    let (addr_tx, addr_rx) = mpsc::channel();
    let (stop_tx, stop_rx) = mpsc::channel();

    let handle = thread::spawn(move || {
        let credentials = Credentials::parse(&creds_text).unwrap();
        let mut node = NodeEndpoint::bind(
            bind,
            credentials,
            DEFAULT_MAX_PAYLOAD as usize,
            PROTOCOL_MINOR_VERSION,
            Instant::now(),
            None,
        )
        .unwrap();

        let table: Table = Rc::new(RefCell::new(seed.into_iter().collect()));

        let put_table = Rc::clone(&table);
        node.register_handler(PUT, VERSION, move |body: &[u8]| -> Box<dyn RocFiber> {
            let mut parser = MessageParser::new(body);
            let _channel = parser.get_string().unwrap();
            let key: u64 = parser.get_value().unwrap();
            let value = parser.get_array::<u8>().unwrap();

            Box::new(PutFiber {
                key,
                value,
                table: Rc::clone(&put_table),
                applied: false,
            })
        });

        let get_table = Rc::clone(&table);
        node.register_handler(GET, VERSION, move |body: &[u8]| -> Box<dyn RocFiber> {
            let mut parser = MessageParser::new(body);
            let _channel = parser.get_string().unwrap();
            let key: u64 = parser.get_value().unwrap();

            Box::new(GetFiber {
                key,
                table: Rc::clone(&get_table),
            })
        });

        let stream_table = Rc::clone(&table);
        node.register_handler(GET_ALL, VERSION, move |_body: &[u8]| -> Box<dyn RocFiber> {
            let mut records: Vec<(u64, Vec<u8>)> = stream_table
                .borrow()
                .iter()
                .map(|(key, value)| (*key, value.clone()))
                .collect();
            records.sort();

            Box::new(SuspendableStream::new(
                Box::new(TableSource {
                    records,
                    index: 0,
                    pending_after: stream_pending_after,
                }),
                Box::new(KvStreamProtocol),
            ))
        });

        addr_tx.send(node.local_addr().unwrap()).unwrap();

        loop {
            node.sync(Instant::now());

            if stop_rx.try_recv().is_ok() {
                break;
            }

            thread::sleep(Duration::from_millis(1));
        }
    });

    NodeHarness {
        addr: addr_rx.recv().unwrap(),
        stop: stop_tx,
        handle: Some(handle),
    }
}

// ----------------------------------------------------------------------
// Client side request specs
// ----------------------------------------------------------------------

struct OpeningBody {
    build: Box<dyn FnMut(&mut MessageBuilder)>,
}

impl Initializer for OpeningBody {
    fn build(&mut self, builder: &mut MessageBuilder) {
        (self.build)(builder)
    }
}

struct PutHandler;

impl Handler for PutHandler {
    fn message(
        &mut self,
        payload: &[u8],
        io: &mut EventDispatcher<'_>,
    ) -> Result<HandlerStep, RequestError> {
        match payload.first() {
            Some(&MSG_OK) => {
                io.notify(Notification::Succeeded { node: io.node() });
                Ok(HandlerStep::Finished)
            }
            _ => Err(RequestError::NodeError),
        }
    }
}

struct GetHandler;

impl Handler for GetHandler {
    fn message(
        &mut self,
        payload: &[u8],
        io: &mut EventDispatcher<'_>,
    ) -> Result<HandlerStep, RequestError> {
        io.notify(Notification::Record {
            node: io.node(),
            payload: payload.to_vec(),
        });
        Ok(HandlerStep::Finished)
    }
}

struct GetAllHandler {
    shared: lattice::request::controller::Shared,
    outstanding: bool,
    wire_suspended: bool,
    stop_sent: bool,
}

impl GetAllHandler {
    fn sync_control(&mut self, io: &mut EventDispatcher<'_>) -> Result<(), RequestError> {
        if self.outstanding {
            return Ok(());
        }

        let (suspended, stopped) = {
            let shared = self.shared.borrow();
            (shared.suspended, shared.stopped)
        };

        if stopped && !self.stop_sent {
            io.send(|builder| {
                builder.add_value(CTL_STOP);
            })?;
            self.stop_sent = true;
            self.outstanding = true;
        } else if suspended != self.wire_suspended {
            let tag = if suspended { CTL_SUSPEND } else { CTL_RESUME };
            io.send(move |builder| {
                builder.add_value(tag);
            })?;
            self.wire_suspended = suspended;
            self.outstanding = true;
        }

        Ok(())
    }
}

impl Handler for GetAllHandler {
    fn message(
        &mut self,
        payload: &[u8],
        io: &mut EventDispatcher<'_>,
    ) -> Result<HandlerStep, RequestError> {
        match payload.first() {
            Some(&MSG_RECORD) | Some(&MSG_ACK) => {
                if payload[0] == MSG_ACK {
                    self.outstanding = false;
                }

                io.notify(Notification::Record {
                    node: io.node(),
                    payload: payload.to_vec(),
                });

                self.sync_control(io)?;
                Ok(HandlerStep::Continue)
            }
            Some(&MSG_END) => Ok(HandlerStep::Finished),
            _ => Err(RequestError::NodeError),
        }
    }

    fn signal(&mut self, _code: i32, io: &mut EventDispatcher<'_>) -> Result<HandlerStep, RequestError> {
        self.sync_control(io)?;
        Ok(HandlerStep::Continue)
    }
}

fn recording_notifier(notes: Notes) -> Box<dyn FnMut(&RequestContext, &Notification)> {
    Box::new(move |_context, notification| notes.borrow_mut().push(notification.clone()))
}

fn put_spec(key: u64, value: &[u8], notes: Notes) -> RequestSpec {
    let value = value.to_vec();

    RequestSpec {
        request_type: RequestType(PUT),
        context: RequestContext::None,
        notifier: recording_notifier(notes),
        factory: Box::new(move |shared| {
            let value = value.clone();
            Box::new(SkeletonRoc::new(
                PUT,
                VERSION,
                Box::new(OpeningBody {
                    build: Box::new(move |builder| {
                        builder.add_string(CHANNEL).add_value(key).add_array(&value);
                    }),
                }),
                Box::new(PutHandler),
                Box::new(WaitConnector),
                Box::new(AbortOnDisconnect),
                shared,
            ))
        }),
        timeout_micros: 0,
    }
}

fn get_spec(key: u64, notes: Notes) -> RequestSpec {
    RequestSpec {
        request_type: RequestType(GET),
        context: RequestContext::None,
        notifier: recording_notifier(notes),
        factory: Box::new(move |shared| {
            Box::new(SkeletonRoc::new(
                GET,
                VERSION,
                Box::new(OpeningBody {
                    build: Box::new(move |builder| {
                        builder.add_string(CHANNEL).add_value(key);
                    }),
                }),
                Box::new(GetHandler),
                Box::new(WaitConnector),
                Box::new(AbortOnDisconnect),
                shared,
            ))
        }),
        timeout_micros: 0,
    }
}

fn get_all_spec(notes: Notes) -> RequestSpec {
    RequestSpec {
        request_type: RequestType(GET_ALL),
        context: RequestContext::None,
        notifier: recording_notifier(notes),
        factory: Box::new(move |shared| {
            Box::new(SkeletonRoc::new(
                GET_ALL,
                VERSION,
                Box::new(OpeningBody {
                    build: Box::new(|builder| {
                        builder.add_string(CHANNEL);
                    }),
                }),
                Box::new(GetAllHandler {
                    shared: lattice::request::controller::Shared::clone(&shared),
                    outstanding: false,
                    wire_suspended: false,
                    stop_sent: false,
                }),
                Box::new(WaitConnector),
                Box::new(AbortOnDisconnect),
                shared,
            ))
        }),
        timeout_micros: 0,
    }
}

// ----------------------------------------------------------------------
// Driving helpers
// ----------------------------------------------------------------------

fn creds_text() -> String {
    format!("test:{}\n", "0".repeat(64))
}

fn client() -> Client {
    Client::new("test", &[0u8; 32], 64, 60, None).unwrap()
}

fn drive_until<F: FnMut() -> bool>(client: &mut Client, what: &str, mut done: F) {
    let deadline = Instant::now() + Duration::from_secs(10);

    while !done() {
        assert!(Instant::now() < deadline, "Timed out waiting for {}", what);
        client.sync(Instant::now());
        thread::sleep(Duration::from_millis(1));
    }
}

fn finished(notes: &Notes) -> bool {
    notes
        .borrow()
        .iter()
        .any(|note| matches!(note, Notification::Finished { .. }))
}

fn record_payloads(notes: &Notes, tag: u8) -> Vec<Vec<u8>> {
    notes
        .borrow()
        .iter()
        .filter_map(|note| match note {
            Notification::Record { payload, .. } if payload.first() == Some(&tag) => {
                Some(payload.clone())
            }
            _ => None,
        })
        .collect()
}

// ----------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------

#[test]
fn test_put_then_get_roundtrip() {
    let node = start_node("127.0.0.1:0".parse().unwrap(), creds_text(), Vec::new(), None);

    let mut client = client();
    client.add_node(node.addr, Instant::now()).unwrap();
    client.wait_all_nodes_connected();

    // Put key 23 -> "hello".
    let put_notes: Notes = Rc::new(RefCell::new(Vec::new()));
    client
        .assign_single_node(put_spec(23, b"hello", Rc::clone(&put_notes)), b"23", Instant::now())
        .unwrap();
    drive_until(&mut client, "put to finish", || finished(&put_notes));

    assert_eq!(
        &*put_notes.borrow(),
        &[
            Notification::Succeeded { node: node.addr },
            Notification::Finished { complete: true },
        ]
    );

    // Get it back.
    let get_notes: Notes = Rc::new(RefCell::new(Vec::new()));
    client
        .assign_single_node(get_spec(23, Rc::clone(&get_notes)), b"23", Instant::now())
        .unwrap();
    drive_until(&mut client, "get to finish", || finished(&get_notes));

    let values = record_payloads(&get_notes, MSG_VALUE);
    assert_eq!(values.len(), 1);
    let mut parser = MessageParser::new(&values[0][1..]);
    assert_eq!(parser.get_array::<u8>().unwrap(), b"hello".to_vec());

    // A missing key comes back empty.
    let miss_notes: Notes = Rc::new(RefCell::new(Vec::new()));
    client
        .assign_single_node(get_spec(99, Rc::clone(&miss_notes)), b"99", Instant::now())
        .unwrap();
    drive_until(&mut client, "missing get to finish", || finished(&miss_notes));

    assert_eq!(record_payloads(&miss_notes, MSG_EMPTY).len(), 1);
    assert!(record_payloads(&miss_notes, MSG_VALUE).is_empty());

    // Request timing was sampled per type.
    assert_eq!(client.stats().count(RequestType(PUT)), 1);
    assert_eq!(client.stats().count(RequestType(GET)), 2);
}

#[test]
fn test_get_all_streams_every_record() {
    let seed = vec![
        (0x1u64, b"you".to_vec()),
        (0x2u64, b"say".to_vec()),
        (0x17u64, b"hello".to_vec()),
    ];
    let node = start_node("127.0.0.1:0".parse().unwrap(), creds_text(), seed, None);

    let mut client = client();
    client.add_node(node.addr, Instant::now()).unwrap();
    client.wait_all_nodes_connected();

    let notes: Notes = Rc::new(RefCell::new(Vec::new()));
    client
        .assign_all_nodes(get_all_spec(Rc::clone(&notes)), Instant::now())
        .unwrap();
    drive_until(&mut client, "stream to finish", || finished(&notes));

    let mut keys: Vec<u64> = record_payloads(&notes, MSG_RECORD)
        .iter()
        .map(|payload| {
            let mut parser = MessageParser::new(&payload[1..]);
            let key: u64 = parser.get_value().unwrap();
            parser.get_array::<u8>().unwrap();
            key
        })
        .collect();
    keys.sort();

    assert_eq!(keys, vec![0x1, 0x2, 0x17]);
    assert_eq!(
        notes.borrow().last(),
        Some(&Notification::Finished { complete: true })
    );
}

#[test]
fn test_suspend_resume_stop_are_acknowledged() {
    // A stream far larger than every buffer between the peers, so the
    // controls always land mid-flight.
    let seed: Vec<(u64, Vec<u8>)> = (0..20_000u64).map(|key| (key, vec![key as u8; 1024])).collect();
    let node = start_node("127.0.0.1:0".parse().unwrap(), creds_text(), seed, None);

    let mut client = client();
    client.add_node(node.addr, Instant::now()).unwrap();
    client.wait_all_nodes_connected();

    let notes: Notes = Rc::new(RefCell::new(Vec::new()));
    let id = client
        .assign_all_nodes(get_all_spec(Rc::clone(&notes)), Instant::now())
        .unwrap();

    drive_until(&mut client, "first record", || {
        !record_payloads(&notes, MSG_RECORD).is_empty()
    });

    // Suspend; the node acks and goes quiet.
    assert!(client.control(id, ControlAction::Suspend));
    drive_until(&mut client, "suspend ack", || {
        record_payloads(&notes, MSG_ACK).len() == 1
    });

    let at_suspend = record_payloads(&notes, MSG_RECORD).len();
    for _ in 0..50 {
        client.sync(Instant::now());
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(record_payloads(&notes, MSG_RECORD).len(), at_suspend);
    assert!(!finished(&notes));

    // Resume; records flow again.
    assert!(client.control(id, ControlAction::Resume));
    drive_until(&mut client, "resume ack", || {
        record_payloads(&notes, MSG_ACK).len() == 2
    });
    drive_until(&mut client, "records after resume", || {
        record_payloads(&notes, MSG_RECORD).len() > at_suspend
    });

    // Stop; the node acks, sends End, and the request finishes.
    assert!(client.control(id, ControlAction::Stop));
    drive_until(&mut client, "stop to finish", || finished(&notes));

    assert_eq!(record_payloads(&notes, MSG_ACK).len(), 3);
    assert!(record_payloads(&notes, MSG_RECORD).len() < 20_000);
    assert_eq!(
        notes.borrow().last(),
        Some(&Notification::Finished { complete: true })
    );
}

#[test]
fn test_node_restart_recovers() {
    let mut node = start_node(
        "127.0.0.1:0".parse().unwrap(),
        creds_text(),
        vec![(1u64, b"seed".to_vec())],
        // The stream stalls after one record, pinning a request in flight.
        Some(1),
    );
    let addr = node.addr;

    let mut client = client();
    let events: Rc<RefCell<Vec<ConnEvent>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    client.set_connection_notifier(move |event| sink.borrow_mut().push(event.clone()));

    client.add_node(addr, Instant::now()).unwrap();
    client.wait_all_nodes_connected();

    let stream_notes: Notes = Rc::new(RefCell::new(Vec::new()));
    client
        .assign_all_nodes(get_all_spec(Rc::clone(&stream_notes)), Instant::now())
        .unwrap();
    drive_until(&mut client, "stream to stall mid-flight", || {
        record_payloads(&stream_notes, MSG_RECORD).len() == 1
    });

    // Kill the node under the in-flight request.
    node.stop();
    drive_until(&mut client, "disconnect to surface", || finished(&stream_notes));

    assert!(stream_notes.borrow().iter().any(|note| matches!(
        note,
        Notification::Error {
            kind: RequestError::NodeDisconnected,
            ..
        }
    )));
    assert!(events
        .borrow()
        .iter()
        .any(|event| matches!(event, ConnEvent::SocketError { .. })));

    // Bring a node back on the same address and let the client find it.
    let _restarted = start_node(addr, creds_text(), Vec::new(), None);
    client.wait_all_nodes_connected();

    let put_notes: Notes = Rc::new(RefCell::new(Vec::new()));
    client
        .assign_single_node(put_spec(5, b"back", Rc::clone(&put_notes)), b"5", Instant::now())
        .unwrap();
    drive_until(&mut client, "put after restart", || finished(&put_notes));

    assert_eq!(
        put_notes.borrow().last(),
        Some(&Notification::Finished { complete: true })
    );
}

#[test]
fn test_oversized_frame_closes_only_offender() {
    let node = start_node("127.0.0.1:0".parse().unwrap(), creds_text(), Vec::new(), None);

    let mut client = client();
    client.add_node(node.addr, Instant::now()).unwrap();
    client.wait_all_nodes_connected();

    // A rogue peer declares a payload far above the advertised maximum.
    let mut rogue = std::net::TcpStream::connect(node.addr).unwrap();
    let mut header = [0u8; 12];
    header[..4].copy_from_slice(&(DEFAULT_MAX_PAYLOAD * 2).to_le_bytes());
    rogue.write_all(&header).unwrap();

    // The node hangs up on the rogue connection.
    rogue
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut sink = [0u8; 16];
    assert_eq!(rogue.read(&mut sink).unwrap(), 0);

    // The authenticated connection is unaffected.
    let put_notes: Notes = Rc::new(RefCell::new(Vec::new()));
    client
        .assign_single_node(put_spec(7, b"fine", Rc::clone(&put_notes)), b"7", Instant::now())
        .unwrap();
    drive_until(&mut client, "put after rogue frame", || finished(&put_notes));

    assert_eq!(client.connected_count(), 1);
    assert_eq!(
        put_notes.borrow().last(),
        Some(&Notification::Finished { complete: true })
    );
}

#[test]
fn test_bad_credentials_surface_auth_failure() {
    let node = start_node("127.0.0.1:0".parse().unwrap(), creds_text(), Vec::new(), None);

    let mut client = Client::new("test", &[7u8; 32], 8, 60, None).unwrap();
    let events: Rc<RefCell<Vec<ConnEvent>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    client.set_connection_notifier(move |event| sink.borrow_mut().push(event.clone()));

    client.add_node(node.addr, Instant::now()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while !events
        .borrow()
        .iter()
        .any(|event| matches!(event, ConnEvent::AuthenticationFailed { .. }))
    {
        assert!(Instant::now() < deadline, "Timed out waiting for auth failure");
        client.sync(Instant::now());
        thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(client.connected_count(), 0);
}
