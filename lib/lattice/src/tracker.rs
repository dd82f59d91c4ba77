//! Per-node error accounting. Each node carries three exponentially weighted
//! moving averages (errors, I/O timeouts, connection timeouts) over a
//! configurable window. All entry points take an explicit `now` in seconds so
//! tests can drive a synthetic clock.

use hashbrown::HashMap;
use std::net::SocketAddr;

pub const DEFAULT_WINDOW_SECS: u64 = 60;

/// One exponentially weighted moving average of events per second.
///
/// Increments within one second accumulate in `count`; crossing a second
/// boundary folds the accumulated count into the average and decays it once
/// per skipped second (closed form). A full window of silence resets the
/// average to zero.
#[derive(Debug, Default, Copy, Clone)]
struct Ewma {
    avg: f64,
    count: u32,
    last_time: u64,
}

impl Ewma {
    /// Records one event at `now`. Returns true when a second boundary
    /// changed the average.
    fn increment(&mut self, now: u64, window: u64) -> bool {
        let mut changed = false;

        if self.last_time > 0 && now > self.last_time {
            let new_w = 2.0 / (window as f64 + 1.0);
            let old_w = 1.0 - new_w;

            self.avg = f64::from(self.count) * new_w + self.avg * old_w;
            self.count = 0;

            let elapsed = now - self.last_time;

            if elapsed > window {
                self.avg = 0.0;
            } else if elapsed > 1 {
                self.avg *= old_w.powi((elapsed - 1) as i32);
            }

            changed = true;
        }

        self.count += 1;
        self.last_time = now;
        changed
    }

    /// Current events-per-second estimate as of `now`, without mutating.
    fn per_sec(&self, now: u64, window: u64) -> f64 {
        if self.last_time == 0 {
            return 0.0;
        }

        if now <= self.last_time {
            return self.avg;
        }

        let elapsed = now - self.last_time;

        if elapsed > window {
            return 0.0;
        }

        let new_w = 2.0 / (window as f64 + 1.0);
        let old_w = 1.0 - new_w;

        let mut avg = f64::from(self.count) * new_w + self.avg * old_w;

        if elapsed > 1 {
            avg *= old_w.powi((elapsed - 1) as i32);
        }

        avg
    }
}

#[derive(Debug, Default, Copy, Clone)]
struct NodeErrors {
    errors: Ewma,
    io_timeouts: Ewma,
    conn_timeouts: Ewma,
}

/// Which counter an event lands in.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorCounter {
    Errors,
    IoTimeouts,
    ConnTimeouts,
}

pub struct NodeErrorTracker {
    window: u64,
    nodes: HashMap<SocketAddr, NodeErrors>,
    updated: Option<Box<dyn FnMut(SocketAddr)>>,
}

impl NodeErrorTracker {
    pub fn new(window_secs: u64) -> NodeErrorTracker {
        NodeErrorTracker {
            window: window_secs,
            nodes: HashMap::new(),
            updated: None,
        }
    }

    /// Registers a callback fired whenever a second boundary changed one of
    /// a node's averages.
    pub fn set_updated_callback<F: FnMut(SocketAddr) + 'static>(&mut self, callback: F) {
        self.updated = Some(Box::new(callback));
    }

    pub fn record(&mut self, node: SocketAddr, counter: ErrorCounter, now_secs: u64) {
        let window = self.window;
        let entry = self.nodes.entry(node).or_insert_with(NodeErrors::default);

        let changed = match counter {
            ErrorCounter::Errors => entry.errors.increment(now_secs, window),
            ErrorCounter::IoTimeouts => entry.io_timeouts.increment(now_secs, window),
            ErrorCounter::ConnTimeouts => entry.conn_timeouts.increment(now_secs, window),
        };

        if changed {
            if let Some(callback) = self.updated.as_mut() {
                callback(node);
            }
        }
    }

    pub fn per_sec(&self, node: SocketAddr, counter: ErrorCounter, now_secs: u64) -> f64 {
        match self.nodes.get(&node) {
            Some(entry) => match counter {
                ErrorCounter::Errors => entry.errors.per_sec(now_secs, self.window),
                ErrorCounter::IoTimeouts => entry.io_timeouts.per_sec(now_secs, self.window),
                ErrorCounter::ConnTimeouts => entry.conn_timeouts.per_sec(now_secs, self.window),
            },
            None => 0.0,
        }
    }

    /// Aggregate error rate: the sum over the three counters.
    pub fn error_rate(&self, node: SocketAddr, now_secs: u64) -> f64 {
        self.per_sec(node, ErrorCounter::Errors, now_secs)
            + self.per_sec(node, ErrorCounter::IoTimeouts, now_secs)
            + self.per_sec(node, ErrorCounter::ConnTimeouts, now_secs)
    }

    /// Drops the state for a removed node.
    pub fn forget(&mut self, node: SocketAddr) {
        self.nodes.remove(&node);
    }
}
