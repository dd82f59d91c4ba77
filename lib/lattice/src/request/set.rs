//! Client side registry of in-flight requests: id allocation, per-request
//! context and notifier, fan-out accounting with exactly-one-finished
//! semantics, controller dispatch, timeouts and timing stats.

use super::context::RequestContext;
use super::controller::{self, ControlAction, Shared};
use crate::fiber::{FiberOutcome, RocFiber, RocId};
use crate::shared::{Notification, RequestError, RequestId};
use crate::stats::{RequestStats, RequestType};
use crate::timeouts::Timeouts;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;

pub type Notifier = Box<dyn FnMut(&RequestContext, &Notification)>;
/// Produces one fresh fiber per target connection, all sharing the
/// request's working flags.
pub type FiberFactory = Box<dyn FnMut(Shared) -> Box<dyn RocFiber>>;

/// Fan-out shape of a request.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Fan {
    /// One RoC per selectable node; finished when the last one exits.
    AllNodes,
    /// One RoC on the node picked by the key hash; fails over to the next
    /// candidate on error.
    SingleNode { key_hash: u64, attempt: usize },
}

/// What the owner must do after a RoC completed.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RocVerdict {
    None,
    /// Spawn a replacement RoC on the next candidate node.
    Failover { key_hash: u64, attempt: usize },
}

pub struct RequestSpec {
    pub request_type: RequestType,
    pub context: RequestContext,
    pub notifier: Notifier,
    pub factory: FiberFactory,
    /// Zero disables the deadline.
    pub timeout_micros: u64,
}

struct ActiveRequest {
    request_type: RequestType,
    context: RequestContext,
    notifier: Notifier,
    factory: FiberFactory,
    shared: Shared,
    fan: Fan,
    rocs: Vec<(SocketAddr, RocId)>,
    outstanding: usize,
    participants: usize,
    failures: usize,
    start_micros: u64,
}

pub struct RequestSet {
    next_id: RequestId,
    max_requests: usize,
    active: HashMap<RequestId, ActiveRequest>,
    stats: RequestStats,
    timeouts: Timeouts,
    expired: Rc<RefCell<VecDeque<RequestId>>>,
}

impl RequestSet {
    pub fn new(max_requests: usize) -> RequestSet {
        let expired = Rc::new(RefCell::new(VecDeque::new()));
        let sink = Rc::clone(&expired);

        RequestSet {
            next_id: 1,
            max_requests,
            active: HashMap::new(),
            stats: RequestStats::new(),
            timeouts: Timeouts::new(max_requests, move |id| sink.borrow_mut().push_back(id)),
            expired,
        }
    }

    /// Registers a request and allocates its id. The RoCs are attached
    /// afterwards with `add_roc`.
    pub fn assign(&mut self, spec: RequestSpec, fan: Fan, now_micros: u64) -> Result<RequestId, RequestError> {
        if self.active.len() >= self.max_requests {
            return Err(RequestError::RequestQueueFull);
        }

        let id = self.next_id;
        self.next_id += 1;

        if spec.timeout_micros > 0 {
            self.timeouts.set_request_timeout(id, now_micros + spec.timeout_micros);
        }

        self.active.insert(
            id,
            ActiveRequest {
                request_type: spec.request_type,
                context: spec.context,
                notifier: spec.notifier,
                factory: spec.factory,
                shared: controller::new_shared(),
                fan,
                rocs: Vec::new(),
                outstanding: 0,
                participants: 0,
                failures: 0,
                start_micros: now_micros,
            },
        );

        Ok(id)
    }

    #[inline]
    pub fn is_active(&self, id: RequestId) -> bool {
        self.active.contains_key(&id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    #[inline]
    pub fn stats(&self) -> &RequestStats {
        &self.stats
    }

    pub fn clear_stats(&mut self) {
        self.stats.clear();
    }

    /// Builds one fiber for the request via its factory.
    pub fn make_fiber(&mut self, id: RequestId) -> Option<Box<dyn RocFiber>> {
        let entry = self.active.get_mut(&id)?;
        Some((entry.factory)(Shared::clone(&entry.shared)))
    }

    pub fn add_roc(&mut self, id: RequestId, addr: SocketAddr, roc: RocId) {
        let entry = self.active.get_mut(&id).expect("RoC attached to unknown request");

        entry.rocs.push((addr, roc));
        entry.outstanding += 1;
        entry.participants += 1;
    }

    /// Forwards a fiber-emitted notification to the request's notifier.
    /// Notifications for finished requests are dropped.
    pub fn notify(&mut self, id: RequestId, notification: &Notification) {
        if let Some(entry) = self.active.get_mut(&id) {
            (entry.notifier)(&entry.context, notification);
        }
    }

    /// Bookkeeping for one completed RoC. Emits the terminal `Finished`
    /// notification when the last RoC exits, or asks the owner to fail a
    /// single-node request over.
    pub fn on_roc_done(
        &mut self,
        id: RequestId,
        addr: SocketAddr,
        roc: RocId,
        outcome: &FiberOutcome,
        now_micros: u64,
    ) -> RocVerdict {
        let entry = match self.active.get_mut(&id) {
            Some(entry) => entry,
            None => return RocVerdict::None,
        };

        entry.rocs.retain(|&(_, other)| other != roc);
        entry.outstanding -= 1;

        match outcome {
            FiberOutcome::Complete { participated: true } => (),
            FiberOutcome::Complete { participated: false } => entry.participants -= 1,
            FiberOutcome::Failed(kind) => {
                entry.failures += 1;
                (entry.notifier)(
                    &entry.context,
                    &Notification::Error {
                        node: Some(addr),
                        kind: *kind,
                    },
                );

                if let Fan::SingleNode { key_hash, attempt } = &mut entry.fan {
                    *attempt += 1;
                    return RocVerdict::Failover {
                        key_hash: *key_hash,
                        attempt: *attempt,
                    };
                }
            }
            FiberOutcome::Pending => panic!("Pending fiber reported as done"),
        }

        if entry.outstanding == 0 {
            self.finalize(id, now_micros);
        }

        RocVerdict::None
    }

    /// Ends a request that cannot proceed (no responsible node, failover
    /// exhausted, deadline lapsed). Returns the RoCs to tear down.
    pub fn abort(
        &mut self,
        id: RequestId,
        kind: RequestError,
        now_micros: u64,
    ) -> Vec<(SocketAddr, RocId)> {
        let mut entry = match self.active.remove(&id) {
            Some(entry) => entry,
            None => return Vec::new(),
        };

        (entry.notifier)(&entry.context, &Notification::Error { node: None, kind });
        (entry.notifier)(&entry.context, &Notification::Finished { complete: false });

        self.stats
            .request_finished(entry.request_type, entry.start_micros, now_micros);
        self.timeouts.clear_request_timeout(id);

        std::mem::replace(&mut entry.rocs, Vec::new())
    }

    fn finalize(&mut self, id: RequestId, now_micros: u64) {
        let mut entry = self.active.remove(&id).expect("Finalizing unknown request");

        let complete = entry.failures == 0;
        (entry.notifier)(&entry.context, &Notification::Finished { complete });

        self.stats
            .request_finished(entry.request_type, entry.start_micros, now_micros);
        self.timeouts.clear_request_timeout(id);
    }

    /// Dispatches a controller action. `None` when the request is gone.
    pub fn control(&mut self, id: RequestId, action: ControlAction) -> Option<Vec<(RocId, i32)>> {
        let entry = self.active.get(&id)?;
        Some(controller::apply(action, &entry.shared, &entry.rocs))
    }

    /// Lapsed request ids as of `now`. The owner aborts each with
    /// `IoTimedOut`.
    pub fn expire(&mut self, now_micros: u64) -> Vec<RequestId> {
        self.timeouts.expire(now_micros);
        self.expired.borrow_mut().drain(..).collect()
    }

    /// All RoCs of a request, for administrative teardown.
    pub fn rocs(&self, id: RequestId) -> Vec<(SocketAddr, RocId)> {
        self.active.get(&id).map_or_else(Vec::new, |entry| entry.rocs.clone())
    }
}
