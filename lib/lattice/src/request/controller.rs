//! Client side request controller. A request that supports control carries
//! one `SharedWorking` per request; the controller flips its flags and wakes
//! the request's RoC fibers, which act on the flags and run the wire
//! Suspend/Resume/Stop exchanges with the node.

use crate::fiber::{resume, RocId};
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

#[derive(Debug, Default)]
pub struct SharedWorking {
    pub suspended: bool,
    pub stopped: bool,
}

pub type Shared = Rc<RefCell<SharedWorking>>;

pub fn new_shared() -> Shared {
    Rc::new(RefCell::new(SharedWorking::default()))
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ControlAction {
    Suspend,
    Resume,
    Stop,
}

/// Applies a controller action. Returns the fiber wakeups to schedule.
pub fn apply(action: ControlAction, shared: &Shared, rocs: &[(SocketAddr, RocId)]) -> Vec<(RocId, i32)> {
    let mut working = shared.borrow_mut();

    match action {
        ControlAction::Suspend => {
            working.suspended = true;
            Vec::new()
        }
        ControlAction::Resume => {
            working.suspended = false;
            rocs.iter().map(|&(_, roc)| (roc, resume::SIGNAL_RESUME)).collect()
        }
        ControlAction::Stop => {
            if working.stopped {
                return Vec::new();
            }

            working.stopped = true;
            rocs.iter().map(|&(_, roc)| (roc, resume::SIGNAL_STOP)).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn test_suspend_sets_flag_without_wakes() {
        let shared = new_shared();
        let rocs = [(addr(), 1), (addr(), 2)];

        let wakes = apply(ControlAction::Suspend, &shared, &rocs);

        assert!(wakes.is_empty());
        assert!(shared.borrow().suspended);
    }

    #[test]
    fn test_resume_clears_flag_and_wakes_all() {
        let shared = new_shared();
        shared.borrow_mut().suspended = true;
        let rocs = [(addr(), 1), (addr(), 2)];

        let wakes = apply(ControlAction::Resume, &shared, &rocs);

        assert!(!shared.borrow().suspended);
        assert_eq!(wakes, vec![(1, resume::SIGNAL_RESUME), (2, resume::SIGNAL_RESUME)]);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let shared = new_shared();
        let rocs = [(addr(), 1)];

        let first = apply(ControlAction::Stop, &shared, &rocs);
        let second = apply(ControlAction::Stop, &shared, &rocs);

        assert_eq!(first, vec![(1, resume::SIGNAL_STOP)]);
        assert!(second.is_empty());
        assert!(shared.borrow().stopped);
    }
}
