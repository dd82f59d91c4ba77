//! One-shot request deadlines. Deadlines are absolute microsecond
//! timestamps; the owning drive loop calls `expire` with its clock and the
//! abort callback supplied at construction fires for every lapsed request.

use crate::shared::RequestId;
use hashbrown::HashMap;

pub struct Timeouts {
    deadlines: HashMap<RequestId, u64>,
    capacity: usize,
    on_expire: Box<dyn FnMut(RequestId)>,
}

impl Timeouts {
    pub fn new<F: FnMut(RequestId) + 'static>(capacity: usize, on_expire: F) -> Timeouts {
        Timeouts {
            deadlines: HashMap::with_capacity(capacity),
            capacity,
            on_expire: Box::new(on_expire),
        }
    }

    /// Arms the timer for a request. A second call for the same id
    /// overwrites the first.
    pub fn set_request_timeout(&mut self, id: RequestId, expires_at_micros: u64) {
        if !self.deadlines.contains_key(&id) && self.deadlines.len() >= self.capacity {
            panic!("Timer capacity {} exceeded", self.capacity);
        }

        self.deadlines.insert(id, expires_at_micros);
    }

    /// Disarms the timer for a request. Idempotent.
    pub fn clear_request_timeout(&mut self, id: RequestId) {
        self.deadlines.remove(&id);
    }

    #[inline]
    pub fn pending(&self) -> usize {
        self.deadlines.len()
    }

    /// Fires the abort callback for every deadline at or before `now`,
    /// earliest first.
    pub fn expire(&mut self, now_micros: u64) {
        if self.deadlines.is_empty() {
            return;
        }

        let mut lapsed: Vec<(u64, RequestId)> = self
            .deadlines
            .iter()
            .filter(|&(_, &deadline)| deadline <= now_micros)
            .map(|(&id, &deadline)| (deadline, id))
            .collect();

        lapsed.sort_unstable();

        for (_, id) in lapsed {
            self.deadlines.remove(&id);
            (self.on_expire)(id);
        }
    }
}
