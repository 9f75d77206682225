//! The control channel and topology tracker.
//!
//! Exactly one control connection is live at any time. It registers for
//! server-push events, keeps the host registry and schema snapshot fresh
//! through debounced catalog queries, and drives per-host reconnection when
//! nodes go down. Host notifications are serialized per host through the
//! host's fairness mutex; different hosts proceed independently.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use basalt_proto::event::{
    EventClass, ProtocolEvent, StatusChangeType, TopologyChangeType,
};
use basalt_proto::messages::{QueryParameters, Request, Response, ResultBody};
use basalt_proto::Consistency;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cluster::{Host, ReconnectionHandle};
use crate::codec::CqlValue;
use crate::connection::{open, open_negotiated, Connection};
use crate::errors::{AttemptError, ConnectionError, ExecutionError};
use crate::session::ResultSet;
use crate::ClusterInner;

/// Control connection lifecycle, for observability and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlStatus {
    Disconnected = 0,
    Connecting = 1,
    Ready = 2,
}

/// Names and schema version captured at the last schema refresh.
#[derive(Clone, Debug, Default)]
pub struct SchemaSnapshot {
    pub keyspaces: Vec<String>,
    pub version: Option<Uuid>,
}

/// Coalesces bursts of triggers into one action per quiet window.
pub(crate) struct Debouncer {
    tx: mpsc::UnboundedSender<()>,
}

impl Debouncer {
    pub(crate) fn new<F, Fut>(window: Duration, action: F) -> Debouncer
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                tokio::time::sleep(window).await;
                // Everything that arrived during the window rides along.
                while rx.try_recv().is_ok() {}
                action().await;
            }
        });
        Debouncer { tx }
    }

    pub(crate) fn trigger(&self) {
        let _ = self.tx.send(());
    }
}

struct Debouncers {
    node: Debouncer,
    node_list: Debouncer,
    schema: Debouncer,
}

/// Control-channel state hanging off the cluster handle.
pub(crate) struct ControlState {
    connection: Mutex<Option<Arc<Connection>>>,
    status: AtomicU8,
    debouncers: Mutex<Option<Debouncers>>,
    schema: RwLock<SchemaSnapshot>,
}

impl ControlState {
    pub(crate) fn new() -> ControlState {
        ControlState {
            connection: Mutex::new(None),
            status: AtomicU8::new(ControlStatus::Disconnected as u8),
            debouncers: Mutex::new(None),
            schema: RwLock::new(SchemaSnapshot::default()),
        }
    }

    pub(crate) fn status(&self) -> ControlStatus {
        match self.status.load(Ordering::Acquire) {
            1 => ControlStatus::Connecting,
            2 => ControlStatus::Ready,
            _ => ControlStatus::Disconnected,
        }
    }

    fn set_status(&self, status: ControlStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn current(&self) -> Option<Arc<Connection>> {
        self.connection.lock().expect("control lock").clone()
    }

    fn store(&self, connection: Option<Arc<Connection>>) {
        *self.connection.lock().expect("control lock") = connection;
    }

    pub(crate) fn schema(&self) -> SchemaSnapshot {
        self.schema.read().expect("schema lock").clone()
    }

    pub(crate) fn close(&self) {
        if let Some(connection) = self.current() {
            connection.close();
        }
        self.store(None);
        self.set_status(ControlStatus::Disconnected);
    }
}

/// Establish the control channel against the configured contact points,
/// perform the initial refresh, and start the event loop.
pub(crate) async fn init(inner: &Arc<ClusterInner>) -> Result<(), ExecutionError> {
    let contact_points = inner.config.contact_points.clone();
    if contact_points.is_empty() {
        return Err(ExecutionError::NoHostAvailable(Default::default()));
    }

    inner.control.set_status(ControlStatus::Connecting);
    let mut last_error = None;
    for address in contact_points {
        match establish(inner, address).await {
            Ok((connection, event_rx)) => {
                inner.control.store(Some(connection.clone()));
                inner.control.set_status(ControlStatus::Ready);
                refresh_hosts(inner, &connection).await?;
                refresh_schema(inner, &connection).await;
                if let Some(host) = inner.metadata.get_host(address) {
                    on_host_up(inner, &host).await;
                }
                start_debouncers(inner);
                let runner = inner.clone();
                tokio::spawn(run(runner, event_rx));
                return Ok(());
            }
            Err(error) => {
                debug!(addr = %address, error = %error, "contact point failed");
                last_error = Some(error);
            }
        }
    }
    inner.control.set_status(ControlStatus::Disconnected);
    Err(last_error.unwrap_or(ExecutionError::NoHostAvailable(Default::default())))
}

/// Open a control connection to one node and register for events.
async fn establish(
    inner: &Arc<ClusterInner>,
    address: SocketAddr,
) -> Result<(Arc<Connection>, mpsc::Receiver<ProtocolEvent>), ExecutionError> {
    let (event_tx, event_rx) = mpsc::channel(64);
    let options = inner.connect_options(inner.version(), Some(event_tx));
    let connection = open_negotiated(address, &options, 0, Arc::new(Notify::new())).await?;
    inner.set_version(connection.version());

    let response = connection
        .send_request(&Request::Register {
            events: EventClass::ALL.to_vec(),
        })
        .await
        .map_err(attempt_to_execution)?;
    match response {
        Response::Ready => Ok((connection, event_rx)),
        other => Err(ConnectionError::Wire {
            address,
            detail: format!("unexpected REGISTER response {:?}", other.opcode()),
        }
        .into()),
    }
}

fn attempt_to_execution(error: AttemptError) -> ExecutionError {
    match error {
        AttemptError::Server(exception) => ExecutionError::Server(exception),
        AttemptError::Connection(error) => ExecutionError::Connection(error),
        other => ExecutionError::NoHostAvailable(crate::errors::NoHostAvailable {
            errors: vec![(
                match &other {
                    AttemptError::BusyPool { address }
                    | AttemptError::BusyConnection { address }
                    | AttemptError::NoPool { address }
                    | AttemptError::Timeout { address } => *address,
                    _ => unreachable!("handled above"),
                },
                other,
            )],
        }),
    }
}

fn start_debouncers(inner: &Arc<ClusterInner>) {
    let query = &inner.config.query;
    let node = {
        let inner = inner.clone();
        Debouncer::new(query.refresh_node_interval, move || {
            let inner = inner.clone();
            async move { refresh_from_current(&inner).await }
        })
    };
    let node_list = {
        let inner = inner.clone();
        Debouncer::new(query.refresh_node_list_interval, move || {
            let inner = inner.clone();
            async move { refresh_from_current(&inner).await }
        })
    };
    let schema = {
        let inner = inner.clone();
        Debouncer::new(query.refresh_schema_interval, move || {
            let inner = inner.clone();
            async move {
                if let Some(connection) = inner.control.current() {
                    refresh_schema(&inner, &connection).await;
                }
            }
        })
    };
    *inner.control.debouncers.lock().expect("debouncers lock") = Some(Debouncers {
        node,
        node_list,
        schema,
    });
}

async fn refresh_from_current(inner: &Arc<ClusterInner>) {
    if let Some(connection) = inner.control.current() {
        if let Err(error) = refresh_hosts(inner, &connection).await {
            warn!(error = %error, "topology refresh failed");
        }
    }
}

fn trigger(inner: &ClusterInner, pick: impl Fn(&Debouncers) -> &Debouncer) {
    if let Some(debouncers) = inner
        .control
        .debouncers
        .lock()
        .expect("debouncers lock")
        .as_ref()
    {
        pick(debouncers).trigger();
    }
}

/// Event loop: drain events until the control connection dies, then
/// reconnect with the reconnection policy's backoff.
async fn run(inner: Arc<ClusterInner>, mut event_rx: mpsc::Receiver<ProtocolEvent>) {
    // Periodic full refresh alongside the event-driven ones.
    {
        let inner = inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                if inner.is_shutdown() {
                    return;
                }
                trigger(&inner, |debouncers| &debouncers.node_list);
            }
        });
    }

    loop {
        while let Some(event) = event_rx.recv().await {
            handle_event(&inner, event).await;
        }
        // Channel closed: the control connection's router is gone.
        inner.control.store(None);
        inner.control.set_status(ControlStatus::Disconnected);
        if inner.is_shutdown() {
            return;
        }
        warn!("control connection lost, reconnecting");

        let mut schedule = inner.config.reconnection.new_schedule();
        loop {
            if inner.is_shutdown() {
                return;
            }
            inner.control.set_status(ControlStatus::Connecting);
            match reconnect_any(&inner).await {
                Some(rx) => {
                    event_rx = rx;
                    break;
                }
                None => {
                    inner.control.set_status(ControlStatus::Disconnected);
                    let delay = schedule.next().unwrap_or(Duration::from_secs(30));
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Try every known host once, preferring ones believed up.
async fn reconnect_any(inner: &Arc<ClusterInner>) -> Option<mpsc::Receiver<ProtocolEvent>> {
    let mut hosts = inner.metadata.all_hosts();
    hosts.sort_by_key(|host| (!host.is_up(), host.address()));
    let addresses: Vec<SocketAddr> = hosts.iter().map(|host| host.address()).collect();

    for address in addresses {
        match establish(inner, address).await {
            Ok((connection, event_rx)) => {
                inner.control.store(Some(connection.clone()));
                inner.control.set_status(ControlStatus::Ready);
                if let Err(error) = refresh_hosts(inner, &connection).await {
                    warn!(error = %error, "post-reconnect refresh failed");
                }
                refresh_schema(inner, &connection).await;
                if let Some(host) = inner.metadata.get_host(address) {
                    on_host_up(inner, &host).await;
                }
                info!(addr = %address, "control connection re-established");
                return Some(event_rx);
            }
            Err(error) => {
                debug!(addr = %address, error = %error, "control candidate failed");
            }
        }
    }
    None
}

async fn handle_event(inner: &Arc<ClusterInner>, event: ProtocolEvent) {
    match event {
        ProtocolEvent::StatusChange { status, node } => {
            // Events may carry the node's broadcast address rather than the
            // address clients connect to; correlate through the peer rows.
            let host = match inner
                .metadata
                .get_host(node)
                .or_else(|| inner.metadata.host_by_listen_address(node.ip()))
            {
                Some(host) => host,
                // Events can race ahead of the catalog; register the address.
                None => inner.metadata.add_host(node).0,
            };
            match status {
                StatusChangeType::Up => on_host_up(inner, &host).await,
                StatusChangeType::Down => on_host_down(inner, &host).await,
            }
        }
        ProtocolEvent::TopologyChange { change, node } => match change {
            TopologyChangeType::NewNode => {
                debug!(addr = %node, "new node announced");
                let inner = inner.clone();
                let delay = inner.config.new_node_delay;
                // Give the node time to finish joining before querying it.
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    trigger(&inner, |debouncers| &debouncers.node_list);
                });
            }
            TopologyChangeType::RemovedNode => on_host_removed(inner, node).await,
            TopologyChangeType::MovedNode => {
                trigger(inner, |debouncers| &debouncers.node_list);
            }
        },
        ProtocolEvent::SchemaChange(change) => {
            debug!(keyspace = %change.keyspace, target = ?change.target, "schema change");
            trigger(inner, |debouncers| &debouncers.schema);
        }
    }
}

/// Serialized per host; fires listeners only on an actual transition.
pub(crate) async fn on_host_up(inner: &Arc<ClusterInner>, host: &Arc<Host>) {
    let _guard = host.notification_guard().await;
    host.abort_reconnection();
    host.resume_reconnection();
    if host.transition(crate::cluster::HostState::Up) {
        info!(addr = %host.address(), "host is up");
        inner.notify_listeners(|listener| listener.on_up(host));
        inner.ensure_pool(host);
        trigger(inner, |debouncers| &debouncers.node);
    }
}

pub(crate) async fn on_host_down(inner: &Arc<ClusterInner>, host: &Arc<Host>) {
    let _guard = host.notification_guard().await;
    if host.transition(crate::cluster::HostState::Down) {
        warn!(addr = %host.address(), "host is down");
        inner.notify_listeners(|listener| listener.on_down(host));
    }
    if !host.reconnection_suspended() {
        schedule_reconnection(inner, host);
    }
}

/// A request attempt observed a connection-level failure on this host.
pub(crate) async fn on_connection_error(inner: &Arc<ClusterInner>, host: &Arc<Host>) {
    on_host_down(inner, host).await;
}

async fn on_host_removed(inner: &Arc<ClusterInner>, address: SocketAddr) {
    let Some(host) = inner.metadata.get_host(address) else {
        return;
    };
    {
        let _guard = host.notification_guard().await;
        host.abort_reconnection();
        inner.metadata.remove_host(address);
        inner.remove_pool(address);
        info!(addr = %address, "host removed from cluster");
        inner.notify_listeners(|listener| listener.on_remove(&host));
    }
}

/// Schedule repeated reconnection attempts on the policy's delay schedule.
/// The single-slot invariant makes this a no-op when an attempt is pending.
fn schedule_reconnection(inner: &Arc<ClusterInner>, host: &Arc<Host>) {
    if host.reconnection_pending() {
        return;
    }
    let cancelled = Arc::new(AtomicBool::new(false));
    let task = {
        let inner = inner.clone();
        let host = host.clone();
        let cancelled = cancelled.clone();
        tokio::spawn(async move {
            let mut schedule = inner.config.reconnection.new_schedule();
            loop {
                let delay = schedule.next().unwrap_or(Duration::from_secs(600));
                tokio::time::sleep(delay).await;
                if cancelled.load(Ordering::Acquire) || inner.is_shutdown() {
                    break;
                }
                match probe(&inner, &host).await {
                    Ok(()) => {
                        host.clear_reconnection();
                        on_host_up(&inner, &host).await;
                        return;
                    }
                    Err(error) => {
                        debug!(addr = %host.address(), error = %error, "reconnection attempt failed");
                    }
                }
            }
            host.clear_reconnection();
        })
    };
    host.try_set_reconnection(ReconnectionHandle { cancelled, task });
}

/// Exactly one probe, for IGNORED-distance hosts or after a cancelled
/// reconnection. No-op when the host is up or an attempt is pending.
pub(crate) fn try_reconnect_once(inner: &Arc<ClusterInner>, host: &Arc<Host>) {
    if host.is_up() || host.reconnection_pending() {
        return;
    }
    host.resume_reconnection();
    let cancelled = Arc::new(AtomicBool::new(false));
    let task = {
        let inner = inner.clone();
        let host = host.clone();
        tokio::spawn(async move {
            let result = probe(&inner, &host).await;
            host.clear_reconnection();
            if result.is_ok() {
                on_host_up(&inner, &host).await;
            }
        })
    };
    host.try_set_reconnection(ReconnectionHandle { cancelled, task });
}

/// One bare connection attempt, closed immediately on success.
async fn probe(inner: &Arc<ClusterInner>, host: &Arc<Host>) -> Result<(), ExecutionError> {
    let options = inner.connect_options(inner.version(), None);
    let connection = open(host.address(), &options, 0, Arc::new(Notify::new())).await?;
    connection.close();
    Ok(())
}

async fn query_rows(
    inner: &Arc<ClusterInner>,
    connection: &Arc<Connection>,
    query: &str,
) -> Result<ResultSet, ExecutionError> {
    let request = Request::Query {
        query: query.to_string(),
        params: QueryParameters {
            consistency: Some(Consistency::One),
            ..QueryParameters::default()
        },
    };
    let response = connection
        .send_request(&request)
        .await
        .map_err(attempt_to_execution)?;
    match response {
        Response::Result(ResultBody::Rows(rows)) => {
            ResultSet::decode(&inner.registry, connection.version(), rows)
        }
        other => Err(ConnectionError::Wire {
            address: connection.address(),
            detail: format!("unexpected catalog response {:?}", other.opcode()),
        }
        .into()),
    }
}

fn parse_tokens(value: Option<&CqlValue>) -> Vec<i64> {
    value
        .and_then(CqlValue::text_items)
        .map(|items| {
            items
                .iter()
                .filter_map(|token| token.parse::<i64>().ok())
                .collect()
        })
        .unwrap_or_default()
}

fn text_of(row: &crate::session::Row, name: &str) -> Option<String> {
    row.get_by_name(name)
        .and_then(CqlValue::as_text)
        .map(str::to_string)
}

/// Re-read the node catalog and reconcile the host registry against it.
pub(crate) async fn refresh_hosts(
    inner: &Arc<ClusterInner>,
    connection: &Arc<Connection>,
) -> Result<(), ExecutionError> {
    let control_address = connection.address();
    let port = control_address.port();

    let local = query_rows(
        inner,
        connection,
        "SELECT data_center, rack, release_version, tokens, broadcast_address \
         FROM system.local WHERE key='local'",
    )
    .await?;
    let peers = query_rows(
        inner,
        connection,
        "SELECT peer, rpc_address, data_center, rack, release_version, tokens \
         FROM system.peers",
    )
    .await?;

    let mut present = vec![control_address];

    let (control_host, _) = inner.metadata.add_host(control_address);
    if let Some(row) = local.one() {
        control_host.set_location(text_of(row, "data_center"), text_of(row, "rack"));
        control_host.set_version_and_listen_address(
            text_of(row, "release_version"),
            row.get_by_name("broadcast_address").and_then(CqlValue::as_inet),
        );
        control_host.set_tokens(parse_tokens(row.get_by_name("tokens")));
    }

    for row in &peers.rows {
        let Some(peer_address) = row.get_by_name("peer").and_then(CqlValue::as_inet) else {
            continue;
        };
        // rpc_address is what clients connect to; 0.0.0.0 means "same as the
        // peer's internal address" (bind-all convention).
        let rpc = row
            .get_by_name("rpc_address")
            .and_then(CqlValue::as_inet)
            .filter(|address| !address.is_unspecified())
            .unwrap_or(peer_address);
        let address = SocketAddr::new(rpc, port);
        present.push(address);

        let (host, created) = inner.metadata.add_host(address);
        host.set_location(text_of(row, "data_center"), text_of(row, "rack"));
        host.set_version_and_listen_address(text_of(row, "release_version"), Some(peer_address));
        host.set_tokens(parse_tokens(row.get_by_name("tokens")));
        if created {
            debug!(addr = %address, "discovered peer");
            inner.notify_listeners(|listener| listener.on_add(&host));
            inner.ensure_pool(&host);
        }
    }

    // Drop hosts that disappeared from the catalog. An empty peers table is
    // treated as a partial read rather than a one-node cluster, so contact
    // points are not wiped by a node that has not seen its peers yet.
    if !peers.rows.is_empty() {
        for host in inner.metadata.all_hosts() {
            if !present.contains(&host.address()) {
                on_host_removed(inner, host.address()).await;
            }
        }
    }

    inner.metadata.rebuild_ring();
    Ok(())
}

/// Refresh the schema snapshot; failures are logged, not fatal, because the
/// snapshot is advisory.
pub(crate) async fn refresh_schema(inner: &Arc<ClusterInner>, connection: &Arc<Connection>) {
    let keyspace_table = if connection.version() >= basalt_proto::ProtocolVersion::V4 {
        "SELECT keyspace_name FROM system_schema.keyspaces"
    } else {
        "SELECT keyspace_name FROM system.schema_keyspaces"
    };
    let keyspaces = match query_rows(inner, connection, keyspace_table).await {
        Ok(result) => result
            .rows
            .iter()
            .filter_map(|row| text_of(row, "keyspace_name"))
            .collect(),
        Err(error) => {
            warn!(error = %error, "schema keyspace refresh failed");
            return;
        }
    };
    let version = query_rows(
        inner,
        connection,
        "SELECT schema_version FROM system.local WHERE key='local'",
    )
    .await
    .ok()
    .and_then(|result| {
        result
            .one()
            .and_then(|row| row.get_by_name("schema_version"))
            .and_then(CqlValue::as_uuid)
    });

    *inner.control.schema.write().expect("schema lock") = SchemaSnapshot {
        keyspaces,
        version,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn debouncer_coalesces_bursts() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let debouncer = Debouncer::new(Duration::from_millis(100), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        for _ in 0..25 {
            debouncer.trigger();
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        debouncer.trigger();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
