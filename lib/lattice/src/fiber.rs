//! The cooperative fabric underneath requests. Every (request, connection)
//! pair runs one fiber: a resumable state machine woken with integer resume
//! codes. Negative codes are protocol events owned by this crate, zero means
//! "connection already up" on the reconnect-wait path, and positive codes
//! are user signals.

use crate::buffer::Buffer;
use crate::frame;
use crate::parse::MessageBuilder;
use crate::shared::{NetError, Notification, RequestError, RequestId};
use std::collections::VecDeque;
use std::net::SocketAddr;

/// Resume codes delivered to `RocFiber::resume`.
pub mod resume {
    /// An inbound message is waiting in the mailbox.
    pub const RECEIVED: i32 = -1;
    /// The connection reauthenticated after a drop.
    pub const RECONNECTED: i32 = -2;
    /// The write buffer drained; a previously rejected send will now fit.
    pub const FLUSHED: i32 = -3;
    /// The fiber yielded and is being handed the CPU back.
    pub const YIELDED: i32 = -4;
    /// First resume after the fiber was spawned.
    pub const STARTED: i32 = -5;
    /// The connection dropped while the fiber was running.
    pub const DISCONNECTED: i32 = -6;
    /// Reconnect-wait result when the connection was already up.
    pub const CONNECTION_UP: i32 = 0;
    pub const SIGNAL_RESUME: i32 = 1;
    pub const SIGNAL_STOP: i32 = 2;
    /// First request-specific code; `DATA_READY` by convention.
    pub const DATA_READY: i32 = 3;
}

#[derive(Debug, Eq, PartialEq)]
pub enum FiberOutcome {
    /// Suspended, waiting for another resume.
    Pending,
    /// Finished. `participated` is false when the fiber backed out before
    /// doing any work (e.g. gave up during the connect phase), in which case
    /// the fan-out counts one fewer participant.
    Complete { participated: bool },
    Failed(RequestError),
}

/// A request handler state machine bound to one connection.
pub trait RocFiber {
    fn resume(&mut self, io: &mut EventDispatcher<'_>, code: i32) -> FiberOutcome;
}

/// Index of a RequestOnConn in its pool. Connections refer to RoCs by id,
/// never by pointer.
pub type RocId = u32;

/// Per-(request, connection) state: the fiber, its inbound mailbox, and the
/// identity it serves.
pub struct RequestOnConn {
    pub request_id: RequestId,
    pub node: SocketAddr,
    pub mailbox: VecDeque<Vec<u8>>,
    pub fiber: Option<Box<dyn RocFiber>>,
}

impl RequestOnConn {
    pub fn new(request_id: RequestId, node: SocketAddr, fiber: Box<dyn RocFiber>) -> RequestOnConn {
        RequestOnConn {
            request_id,
            node,
            mailbox: VecDeque::new(),
            fiber: Some(fiber),
        }
    }
}

/// Arena of RoCs with slot recycling.
pub struct RocPool {
    slots: Vec<Option<RequestOnConn>>,
    free: Vec<RocId>,
}

impl RocPool {
    pub fn new() -> RocPool {
        RocPool {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, roc: RequestOnConn) -> RocId {
        match self.free.pop() {
            Some(id) => {
                self.slots[id as usize] = Some(roc);
                id
            }
            None => {
                let id = self.slots.len() as RocId;
                self.slots.push(Some(roc));
                id
            }
        }
    }

    pub fn remove(&mut self, id: RocId) -> Option<RequestOnConn> {
        let slot = self.slots.get_mut(id as usize)?;
        let roc = slot.take();

        if roc.is_some() {
            self.free.push(id);
        }

        roc
    }

    #[inline]
    pub fn get(&self, id: RocId) -> Option<&RequestOnConn> {
        self.slots.get(id as usize).and_then(Option::as_ref)
    }

    #[inline]
    pub fn get_mut(&mut self, id: RocId) -> Option<&mut RequestOnConn> {
        self.slots.get_mut(id as usize).and_then(Option::as_mut)
    }

    /// Queues an inbound payload for the RoC. False when the slot is gone,
    /// in which case the message is dropped by the caller.
    pub fn push_message(&mut self, id: RocId, payload: Vec<u8>) -> bool {
        match self.get_mut(id) {
            Some(roc) => {
                roc.mailbox.push_back(payload);
                true
            }
            None => false,
        }
    }

    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

/// FIFO of pending fiber wakeups. This is the scheduler surface the core
/// drives: readiness events and signals append, the owner's sync loop
/// drains.
pub struct WakeQueue {
    queue: VecDeque<(RocId, i32)>,
}

impl WakeQueue {
    pub fn new() -> WakeQueue {
        WakeQueue { queue: VecDeque::new() }
    }

    #[inline]
    pub fn push(&mut self, roc: RocId, code: i32) {
        self.queue.push_back((roc, code));
    }

    #[inline]
    pub fn extend<I: IntoIterator<Item = (RocId, i32)>>(&mut self, wakes: I) {
        self.queue.extend(wakes);
    }

    #[inline]
    pub fn pop(&mut self) -> Option<(RocId, i32)> {
        self.queue.pop_front()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Step {
    /// The operation completed synchronously.
    Done,
    /// The operation is parked; the fiber will be resumed with the
    /// corresponding code.
    Pending,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SendReceiveStep {
    Sent,
    /// An inbound message preempted the send; nothing was queued.
    Interrupted(Vec<u8>),
    Pending,
}

/// The window through which a fiber touches its connection: sends, mailbox,
/// reconnect waits, yields, notifications. Constructed fresh for every
/// resume by the owning sync loop.
pub struct EventDispatcher<'a> {
    roc: RocId,
    request_id: RequestId,
    node: SocketAddr,
    connected: bool,
    max_payload: usize,
    write: Option<&'a mut Buffer>,
    mailbox: &'a mut VecDeque<Vec<u8>>,
    flush_waiters: &'a mut Vec<RocId>,
    reconnect_waiters: &'a mut Vec<RocId>,
    wakes: &'a mut Vec<(RocId, i32)>,
    notifications: &'a mut Vec<(RequestId, Notification)>,
    shutdown: &'a mut Option<String>,
}

impl<'a> EventDispatcher<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        roc: RocId,
        request_id: RequestId,
        node: SocketAddr,
        connected: bool,
        max_payload: usize,
        write: Option<&'a mut Buffer>,
        mailbox: &'a mut VecDeque<Vec<u8>>,
        flush_waiters: &'a mut Vec<RocId>,
        reconnect_waiters: &'a mut Vec<RocId>,
        wakes: &'a mut Vec<(RocId, i32)>,
        notifications: &'a mut Vec<(RequestId, Notification)>,
        shutdown: &'a mut Option<String>,
    ) -> EventDispatcher<'a> {
        EventDispatcher {
            roc,
            request_id,
            node,
            connected,
            max_payload,
            write,
            mailbox,
            flush_waiters,
            reconnect_waiters,
            wakes,
            notifications,
            shutdown,
        }
    }

    #[inline]
    pub fn node(&self) -> SocketAddr {
        self.node
    }

    #[inline]
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    #[inline]
    pub fn connected(&self) -> bool {
        self.connected
    }

    /// Queues one frame built by `build`. `Pending` when the write buffer is
    /// full; the fiber is resumed with `FLUSHED` once it drains and must
    /// retry the send. Fails with `NodeDisconnected` when the socket is
    /// down.
    pub fn send<F: FnOnce(&mut MessageBuilder)>(&mut self, build: F) -> Result<Step, RequestError> {
        if !self.connected {
            return Err(RequestError::NodeDisconnected);
        }

        let write = match self.write.as_mut() {
            Some(write) => write,
            None => return Err(RequestError::NodeDisconnected),
        };

        match frame::enqueue_with(write, self.request_id, self.max_payload, build) {
            Ok(()) => Ok(Step::Done),
            Err(NetError::Wait) => {
                self.flush_waiters.push(self.roc);
                Ok(Step::Pending)
            }
            Err(NetError::Fatal(violation)) => {
                *self.shutdown = Some(violation.to_string());
                Err(RequestError::ProtocolError)
            }
        }
    }

    /// Pops the next inbound message for this RoC, if any.
    #[inline]
    pub fn receive(&mut self) -> Option<Vec<u8>> {
        self.mailbox.pop_front()
    }

    /// Like `send`, but an inbound message that arrived first interrupts
    /// the exchange: the message is handed back unsent and the caller
    /// decides whether to re-send.
    pub fn send_receive<F: FnOnce(&mut MessageBuilder)>(
        &mut self,
        build: F,
    ) -> Result<SendReceiveStep, RequestError> {
        if let Some(payload) = self.mailbox.pop_front() {
            return Ok(SendReceiveStep::Interrupted(payload));
        }

        match self.send(build)? {
            Step::Done => Ok(SendReceiveStep::Sent),
            Step::Pending => Ok(SendReceiveStep::Pending),
        }
    }

    #[inline]
    pub fn pending_messages(&self) -> usize {
        self.mailbox.len()
    }

    /// Parks the fiber until the connection is up. Resumed with
    /// `CONNECTION_UP` immediately when it already is, `RECONNECTED` when it
    /// comes back, or any positive user signal.
    pub fn wait_for_reconnect(&mut self) {
        if self.connected {
            self.wakes.push((self.roc, resume::CONNECTION_UP));
        } else {
            self.reconnect_waiters.push(self.roc);
        }
    }

    /// Hands the CPU back to the scheduler; the fiber is resumed with
    /// `YIELDED` on the next drain.
    #[inline]
    pub fn yield_now(&mut self) {
        self.wakes.push((self.roc, resume::YIELDED));
    }

    /// Emits a notification toward the request's notifier.
    #[inline]
    pub fn notify(&mut self, notification: Notification) {
        self.notifications.push((self.request_id, notification));
    }

    /// Requests a connection teardown with `ProtocolError` for all RoCs on
    /// it. Takes effect when the current resume returns.
    pub fn shutdown_with_protocol_error(&mut self, reason: &str) {
        if self.shutdown.is_none() {
            *self.shutdown = Some(reason.to_string());
        }
    }

    #[inline]
    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shutdown.is_some()
    }
}
