//! Cluster metadata: hosts, their states, and the token ring.
//!
//! `Metadata` keeps exactly one `Host` per socket address, so identity
//! comparison (`Arc::ptr_eq`) is a valid equality for hosts obtained from it.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::task::JoinHandle;

/// Declared state of a node, as seen by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HostState {
    /// Known from the catalog or an event, but not yet confirmed up.
    Added = 0,
    Up = 1,
    Down = 2,
}

impl HostState {
    fn from_u8(raw: u8) -> HostState {
        match raw {
            1 => HostState::Up,
            2 => HostState::Down,
            _ => HostState::Added,
        }
    }
}

/// Handle to a scheduled reconnection task; at most one exists per host.
pub(crate) struct ReconnectionHandle {
    pub(crate) cancelled: Arc<AtomicBool>,
    pub(crate) task: JoinHandle<()>,
}

/// A node of the cluster.
///
/// Identity is the socket address. Obtain instances through
/// [`Metadata::get_host`] so that identity comparison remains valid.
pub struct Host {
    address: SocketAddr,
    state: AtomicU8,
    datacenter: RwLock<Option<String>>,
    rack: RwLock<Option<String>>,
    server_version: RwLock<Option<String>>,
    // The broadcast address under which the node appears in its peers' catalog
    // rows. Kept internal: the local-node catalog row does not always carry it.
    pub(crate) listen_address: RwLock<Option<IpAddr>>,
    tokens: RwLock<Vec<i64>>,
    // Single-slot pending reconnection. The slot is set atomically under the
    // mutex; a populated slot means an attempt is scheduled or running.
    reconnection: Mutex<Option<ReconnectionHandle>>,
    // Set when a user cancels the reconnection future; automatic rescheduling
    // stays off until an external UP event arrives.
    reconnection_suspended: AtomicBool,
    // Serializes state-change notifications for this host. tokio's Mutex is
    // FIFO-fair, which gives per-host total order.
    notifications: tokio::sync::Mutex<()>,
}

impl Host {
    fn new(address: SocketAddr) -> Host {
        Host {
            address,
            state: AtomicU8::new(HostState::Added as u8),
            datacenter: RwLock::new(None),
            rack: RwLock::new(None),
            server_version: RwLock::new(None),
            listen_address: RwLock::new(None),
            tokens: RwLock::new(Vec::new()),
            reconnection: Mutex::new(None),
            reconnection_suspended: AtomicBool::new(false),
            notifications: tokio::sync::Mutex::new(()),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn state(&self) -> HostState {
        HostState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_up(&self) -> bool {
        self.state() == HostState::Up
    }

    /// Move to the given state, returning false when it was already current
    /// (idempotent notifications are suppressed on this).
    pub(crate) fn transition(&self, state: HostState) -> bool {
        self.state.swap(state as u8, Ordering::AcqRel) != state as u8
    }

    pub fn datacenter(&self) -> Option<String> {
        self.datacenter.read().expect("host lock").clone()
    }

    pub fn rack(&self) -> Option<String> {
        self.rack.read().expect("host lock").clone()
    }

    pub fn server_version(&self) -> Option<String> {
        self.server_version.read().expect("host lock").clone()
    }

    pub fn tokens(&self) -> Vec<i64> {
        self.tokens.read().expect("host lock").clone()
    }

    pub(crate) fn set_location(&self, datacenter: Option<String>, rack: Option<String>) {
        *self.datacenter.write().expect("host lock") = datacenter;
        *self.rack.write().expect("host lock") = rack;
    }

    pub(crate) fn set_version_and_listen_address(
        &self,
        version: Option<String>,
        listen_address: Option<IpAddr>,
    ) {
        if let Some(version) = version {
            *self.server_version.write().expect("host lock") = Some(version);
        }
        if listen_address.is_some() {
            *self.listen_address.write().expect("host lock") = listen_address;
        }
    }

    pub(crate) fn set_tokens(&self, tokens: Vec<i64>) {
        *self.tokens.write().expect("host lock") = tokens;
    }

    /// Whether a reconnection attempt is currently scheduled or running.
    pub fn reconnection_pending(&self) -> bool {
        self.reconnection
            .lock()
            .expect("reconnection slot lock")
            .is_some()
    }

    /// Install a reconnection handle if the slot is free. Returns false (and
    /// leaves the task to be aborted by the caller) when an attempt is
    /// already pending.
    pub(crate) fn try_set_reconnection(&self, handle: ReconnectionHandle) -> bool {
        let mut slot = self.reconnection.lock().expect("reconnection slot lock");
        if slot.is_some() {
            handle.task.abort();
            return false;
        }
        *slot = Some(handle);
        true
    }

    /// Clear the slot; called by the reconnection task itself on completion.
    pub(crate) fn clear_reconnection(&self) {
        *self.reconnection.lock().expect("reconnection slot lock") = None;
    }

    /// Abort and clear the pending reconnection attempt, if any, without
    /// suspending future automatic attempts. Used when the host comes back up.
    pub(crate) fn abort_reconnection(&self) {
        let handle = self
            .reconnection
            .lock()
            .expect("reconnection slot lock")
            .take();
        if let Some(handle) = handle {
            handle.cancelled.store(true, Ordering::Release);
            handle.task.abort();
        }
    }

    /// Cancel the pending reconnection attempt, if any. No further automatic
    /// attempts are made for this host until an UP event arrives or
    /// reconnection is explicitly requested.
    pub fn cancel_reconnection(&self) {
        let handle = self
            .reconnection
            .lock()
            .expect("reconnection slot lock")
            .take();
        if let Some(handle) = handle {
            handle.cancelled.store(true, Ordering::Release);
            handle.task.abort();
            self.reconnection_suspended.store(true, Ordering::Release);
        }
    }

    pub(crate) fn reconnection_suspended(&self) -> bool {
        self.reconnection_suspended.load(Ordering::Acquire)
    }

    pub(crate) fn resume_reconnection(&self) {
        self.reconnection_suspended.store(false, Ordering::Release);
    }

    /// Serialize a state-change notification for this host. Notifications
    /// for different hosts proceed independently.
    pub(crate) async fn notification_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.notifications.lock().await
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("address", &self.address)
            .field("state", &self.state())
            .field("datacenter", &self.datacenter())
            .finish()
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Host {}

impl std::hash::Hash for Host {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

/// Listener for host lifecycle events.
///
/// The same event may be observed more than once on the wire; the tracker
/// suppresses notifications that do not change the host's state, so listener
/// callbacks fire only on actual transitions.
pub trait HostStateListener: Send + Sync {
    fn on_add(&self, host: &Arc<Host>) {
        let _ = host;
    }
    fn on_up(&self, host: &Arc<Host>) {
        let _ = host;
    }
    fn on_down(&self, host: &Arc<Host>) {
        let _ = host;
    }
    fn on_remove(&self, host: &Arc<Host>) {
        let _ = host;
    }
}

/// The driver's view of the cluster: one identity-stable `Host` per address,
/// plus a token-to-host ring for routing.
#[derive(Default)]
pub struct Metadata {
    hosts: RwLock<HashMap<SocketAddr, Arc<Host>>>,
    ring: RwLock<BTreeMap<i64, SocketAddr>>,
}

impl Metadata {
    pub fn new() -> Metadata {
        Metadata::default()
    }

    /// The host registered under this address, if any. Repeated calls return
    /// the same instance.
    pub fn get_host(&self, address: SocketAddr) -> Option<Arc<Host>> {
        self.hosts.read().expect("metadata lock").get(&address).cloned()
    }

    /// Register an address, returning the (possibly pre-existing) host and
    /// whether it was newly added.
    pub(crate) fn add_host(&self, address: SocketAddr) -> (Arc<Host>, bool) {
        let mut hosts = self.hosts.write().expect("metadata lock");
        match hosts.get(&address) {
            Some(host) => (host.clone(), false),
            None => {
                let host = Arc::new(Host::new(address));
                hosts.insert(address, host.clone());
                (host, true)
            }
        }
    }

    pub(crate) fn remove_host(&self, address: SocketAddr) -> Option<Arc<Host>> {
        let removed = self.hosts.write().expect("metadata lock").remove(&address);
        if removed.is_some() {
            self.rebuild_ring();
        }
        removed
    }

    pub fn all_hosts(&self) -> Vec<Arc<Host>> {
        self.hosts
            .read()
            .expect("metadata lock")
            .values()
            .cloned()
            .collect()
    }

    pub fn up_hosts(&self) -> Vec<Arc<Host>> {
        self.hosts
            .read()
            .expect("metadata lock")
            .values()
            .filter(|host| host.is_up())
            .cloned()
            .collect()
    }

    /// Find the host whose listen (broadcast) address matches; used to
    /// correlate peer catalog rows with event addresses.
    pub(crate) fn host_by_listen_address(&self, address: IpAddr) -> Option<Arc<Host>> {
        self.hosts
            .read()
            .expect("metadata lock")
            .values()
            .find(|host| {
                host.listen_address
                    .read()
                    .expect("host lock")
                    .map_or(false, |listen| listen == address)
            })
            .cloned()
    }

    /// Rebuild the token ring from the current hosts' token sets.
    pub(crate) fn rebuild_ring(&self) {
        let hosts = self.hosts.read().expect("metadata lock");
        let mut ring = BTreeMap::new();
        for (address, host) in hosts.iter() {
            for token in host.tokens() {
                ring.insert(token, *address);
            }
        }
        *self.ring.write().expect("metadata lock") = ring;
    }

    /// The host owning the token range that contains `token`: the first host
    /// at or after it on the ring, wrapping around.
    pub fn replica_for_token(&self, token: i64) -> Option<Arc<Host>> {
        let ring = self.ring.read().expect("metadata lock");
        let address = ring
            .range(token..)
            .next()
            .or_else(|| ring.iter().next())
            .map(|(_, address)| *address)?;
        drop(ring);
        self.get_host(address)
    }

    pub fn token_count(&self) -> usize {
        self.ring.read().expect("metadata lock").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> SocketAddr {
        format!("10.0.0.{last}:9042").parse().unwrap()
    }

    #[test]
    fn hosts_are_identity_stable() {
        let metadata = Metadata::new();
        let (first, created) = metadata.add_host(addr(1));
        assert!(created);
        let (second, created) = metadata.add_host(addr(1));
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(
            &first,
            &metadata.get_host(addr(1)).expect("registered")
        ));
    }

    #[test]
    fn state_transitions_report_change() {
        let metadata = Metadata::new();
        let (host, _) = metadata.add_host(addr(1));
        assert_eq!(host.state(), HostState::Added);
        assert!(host.transition(HostState::Up));
        // Idempotent: same state again reports no change.
        assert!(!host.transition(HostState::Up));
        assert!(host.transition(HostState::Down));
        assert_eq!(host.state(), HostState::Down);
    }

    #[test]
    fn token_ring_wraps_around() {
        let metadata = Metadata::new();
        let (a, _) = metadata.add_host(addr(1));
        let (b, _) = metadata.add_host(addr(2));
        a.set_tokens(vec![-100, 50]);
        b.set_tokens(vec![0, 900]);
        metadata.rebuild_ring();

        let owner = metadata.replica_for_token(-50).expect("replica");
        assert_eq!(owner.address(), addr(2)); // token 0
        let owner = metadata.replica_for_token(60).expect("replica");
        assert_eq!(owner.address(), addr(2)); // token 900
        // Past the highest token, wrap to the lowest.
        let owner = metadata.replica_for_token(1000).expect("replica");
        assert_eq!(owner.address(), addr(1)); // token -100
    }

    #[tokio::test]
    async fn reconnection_slot_is_single_occupancy() {
        let metadata = Metadata::new();
        let (host, _) = metadata.add_host(addr(1));
        assert!(!host.reconnection_pending());

        let first = ReconnectionHandle {
            cancelled: Arc::new(AtomicBool::new(false)),
            task: tokio::spawn(async { tokio::time::sleep(std::time::Duration::from_secs(60)).await }),
        };
        assert!(host.try_set_reconnection(first));
        assert!(host.reconnection_pending());

        let second = ReconnectionHandle {
            cancelled: Arc::new(AtomicBool::new(false)),
            task: tokio::spawn(async {}),
        };
        assert!(!host.try_set_reconnection(second));

        host.cancel_reconnection();
        assert!(!host.reconnection_pending());
        assert!(host.reconnection_suspended());
        host.resume_reconnection();
        assert!(!host.reconnection_suspended());
    }
}
