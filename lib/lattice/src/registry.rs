//! Registry of node connections: the live set, the disabled set, the
//! connection notifier, and the selection policy for single-node requests.

use crate::connection::Connection;
use indexmap::{IndexMap, IndexSet};
use std::net::SocketAddr;

/// Connect-attempt outcomes delivered to the connection notifier.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ConnEvent {
    Established { addr: SocketAddr },
    AuthenticationFailed { addr: SocketAddr },
    SocketError { addr: SocketAddr },
    ConnectionTimedOut { addr: SocketAddr },
    ProtocolError { addr: SocketAddr, reason: String },
    Shutdown { addr: SocketAddr },
}

impl ConnEvent {
    pub fn addr(&self) -> SocketAddr {
        match self {
            ConnEvent::Established { addr }
            | ConnEvent::AuthenticationFailed { addr }
            | ConnEvent::SocketError { addr }
            | ConnEvent::ConnectionTimedOut { addr }
            | ConnEvent::ProtocolError { addr, .. }
            | ConnEvent::Shutdown { addr } => *addr,
        }
    }
}

pub type ConnectionNotifier = Box<dyn FnMut(&ConnEvent)>;

#[derive(Debug, Eq, PartialEq)]
pub enum RegistryError {
    DuplicateAddress,
    UnknownAddress,
}

/// Every registered address is either selectable or disabled, never both.
/// Disabling keeps the socket (and any draining requests) alive but removes
/// the node from new-request selection.
pub struct ConnectionSet {
    conns: IndexMap<SocketAddr, Connection>,
    disabled: IndexSet<SocketAddr>,
    notifier: Option<ConnectionNotifier>,
}

impl ConnectionSet {
    pub fn new() -> ConnectionSet {
        ConnectionSet {
            conns: IndexMap::new(),
            disabled: IndexSet::new(),
            notifier: None,
        }
    }

    pub fn add(&mut self, conn: Connection) -> Result<(), RegistryError> {
        let addr = conn.addr();

        if self.conns.contains_key(&addr) {
            return Err(RegistryError::DuplicateAddress);
        }

        self.conns.insert(addr, conn);
        Ok(())
    }

    pub fn remove(&mut self, addr: SocketAddr) -> Option<Connection> {
        self.disabled.swap_remove(&addr);
        self.conns.swap_remove(&addr)
    }

    pub fn disable(&mut self, addr: SocketAddr) -> Result<(), RegistryError> {
        if !self.conns.contains_key(&addr) {
            return Err(RegistryError::UnknownAddress);
        }

        self.disabled.insert(addr);
        Ok(())
    }

    pub fn enable(&mut self, addr: SocketAddr) -> Result<(), RegistryError> {
        if !self.conns.contains_key(&addr) {
            return Err(RegistryError::UnknownAddress);
        }

        self.disabled.swap_remove(&addr);
        Ok(())
    }

    #[inline]
    pub fn is_disabled(&self, addr: SocketAddr) -> bool {
        self.disabled.contains(&addr)
    }

    #[inline]
    pub fn get(&self, addr: SocketAddr) -> Option<&Connection> {
        self.conns.get(&addr)
    }

    #[inline]
    pub fn get_mut(&mut self, addr: SocketAddr) -> Option<&mut Connection> {
        self.conns.get_mut(&addr)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.conns.values_mut()
    }

    pub fn addrs(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.conns.keys().copied()
    }

    /// Number of registered nodes.
    #[inline]
    pub fn registered_count(&self) -> usize {
        self.conns.len()
    }

    /// Number of nodes with a completed handshake.
    pub fn connected_count(&self) -> usize {
        self.conns.values().filter(|conn| conn.is_connected()).count()
    }

    /// Addresses eligible for new request assignments.
    pub fn selectable(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.conns
            .keys()
            .copied()
            .filter(move |addr| !self.disabled.contains(addr))
    }

    /// Selection policy for single-node requests: the request key hash picks
    /// a selectable node; `offset` walks to the next candidates for
    /// failover.
    pub fn select(&self, key_hash: u64, offset: usize) -> Option<SocketAddr> {
        let candidates: Vec<SocketAddr> = self.selectable().collect();

        if candidates.is_empty() || offset >= candidates.len() {
            return None;
        }

        let index = (key_hash as usize).wrapping_add(offset) % candidates.len();
        Some(candidates[index])
    }

    /// Installs a connection notifier, returning the previous one so
    /// transient notifiers can chain and restore it.
    pub fn replace_notifier(&mut self, notifier: Option<ConnectionNotifier>) -> Option<ConnectionNotifier> {
        std::mem::replace(&mut self.notifier, notifier)
    }

    pub fn set_connection_notifier<F: FnMut(&ConnEvent) + 'static>(&mut self, notifier: F) {
        self.notifier = Some(Box::new(notifier));
    }

    /// Fires the notifier for one connect-attempt outcome.
    pub fn notify(&mut self, event: &ConnEvent) {
        if let Some(notifier) = self.notifier.as_mut() {
            notifier(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Instant;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn connection(port: u16) -> Connection {
        Connection::new(addr(port), "test", &[0u8; 32], 65536, Instant::now(), None)
    }

    fn populated() -> ConnectionSet {
        let mut set = ConnectionSet::new();
        for port in [4000u16, 4001, 4002].iter() {
            set.add(connection(*port)).unwrap();
        }
        set
    }

    #[test]
    fn test_add_rejects_duplicates() {
        let mut set = populated();

        assert_eq!(set.add(connection(4000)).unwrap_err(), RegistryError::DuplicateAddress);
        assert_eq!(set.registered_count(), 3);
    }

    #[test]
    fn test_disable_enable() {
        let mut set = populated();

        set.disable(addr(4001)).unwrap();
        assert!(set.is_disabled(addr(4001)));
        assert_eq!(set.selectable().count(), 2);
        // The disabled node stays registered.
        assert_eq!(set.registered_count(), 3);

        set.enable(addr(4001)).unwrap();
        assert_eq!(set.selectable().count(), 3);

        assert_eq!(set.disable(addr(9999)).unwrap_err(), RegistryError::UnknownAddress);
    }

    #[test]
    fn test_remove_clears_disabled_entry() {
        let mut set = populated();

        set.disable(addr(4000)).unwrap();
        assert!(set.remove(addr(4000)).is_some());
        assert!(!set.is_disabled(addr(4000)));
        assert!(set.remove(addr(4000)).is_none());
    }

    #[test]
    fn test_selection_skips_disabled_and_fails_over() {
        let mut set = populated();
        set.disable(addr(4001)).unwrap();

        let primary = set.select(0, 0).unwrap();
        let failover = set.select(0, 1).unwrap();

        assert_ne!(primary, failover);
        assert_ne!(primary, addr(4001));
        assert_ne!(failover, addr(4001));

        // Offsets beyond the candidate count are exhausted.
        assert_eq!(set.select(0, 2), None);
    }

    #[test]
    fn test_selection_empty_registry() {
        let set = ConnectionSet::new();
        assert_eq!(set.select(7, 0), None);
    }

    #[test]
    fn test_notifier_chain() {
        let mut set = populated();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let outer = Rc::clone(&seen);
        set.set_connection_notifier(move |event| outer.borrow_mut().push(("outer", event.addr())));

        // A transient notifier observes first, then delegates.
        let previous = set.replace_notifier(None);
        let inner = Rc::clone(&seen);
        let mut delegate = previous;
        set.set_connection_notifier(move |event| {
            inner.borrow_mut().push(("transient", event.addr()));
            if let Some(notifier) = delegate.as_mut() {
                notifier(event);
            }
        });

        set.notify(&ConnEvent::Established { addr: addr(4000) });

        assert_eq!(
            &*seen.borrow(),
            &[("transient", addr(4000)), ("outer", addr(4000))]
        );
    }

    #[test]
    fn test_counts() {
        let set = populated();
        assert_eq!(set.registered_count(), 3);
        assert_eq!(set.connected_count(), 0);
    }
}
