//! Cluster-aware async client driver for CQL-compatible wide-column stores.
//!
//! The driver keeps one control connection per cluster for server-push
//! topology/status/schema events, a per-host connection pool multiplexing
//! requests over stream ids, and a per-query request handler coordinating
//! retries, speculative executions, cancellation and timeouts. Values are
//! converted through a [`codec::CodecRegistry`] shared by every session
//! bound to the cluster handle.
//!
//! ```no_run
//! # async fn example() -> Result<(), basalt_driver::errors::ExecutionError> {
//! use basalt_driver::{Cluster, Statement};
//!
//! let cluster = Cluster::builder()
//!     .contact_point("127.0.0.1:9042".parse().unwrap())
//!     .build()
//!     .await?;
//! let session = cluster.session();
//! let rows = session
//!     .execute(&Statement::new("SELECT release_version FROM system.local"))
//!     .await?;
//! # let _ = rows;
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod codec;
pub mod config;
mod connection;
mod control;
pub mod errors;
mod handler;
pub mod policies;
mod pool;
pub mod session;

pub use basalt_proto::frame::Compression;
pub use basalt_proto::messages::{BatchType, ColumnSpec};
pub use basalt_proto::types::{CqlType, UdtType};
pub use basalt_proto::{Consistency, ProtocolVersion};
pub use cluster::{Host, HostState, HostStateListener, Metadata};
pub use codec::{CodecRegistry, CqlValue, RustType};
pub use control::{ControlStatus, SchemaSnapshot};
pub use config::{ClusterConfig, PoolingOptions, QueryOptions};
pub use pool::PoolSnapshot;
pub use session::{
    Cancellation, PreparedStatement, ResultSet, Row, Session, Statement,
};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::info;

use crate::connection::ConnectOptions;
use crate::errors::ExecutionError;
use crate::pool::HostPool;

/// Shared cluster state: configuration, metadata, pools, and the control
/// channel. Everything hangs off one `Arc<ClusterInner>`.
pub(crate) struct ClusterInner {
    pub(crate) config: ClusterConfig,
    pub(crate) metadata: Metadata,
    pub(crate) registry: Arc<CodecRegistry>,
    pub(crate) pools: RwLock<HashMap<SocketAddr, Arc<HostPool>>>,
    pub(crate) listeners: RwLock<Vec<Arc<dyn HostStateListener>>>,
    /// Version agreed with the cluster during the control handshake; data
    /// connections are opened directly at this version.
    negotiated_version: AtomicU8,
    pub(crate) control: control::ControlState,
    pub(crate) shutdown: AtomicBool,
    /// Runtime handle captured at connect time; lets the blocking wrappers
    /// work from non-async threads.
    pub(crate) runtime: tokio::runtime::Handle,
}

impl ClusterInner {
    pub(crate) fn version(&self) -> ProtocolVersion {
        ProtocolVersion::from_byte(self.negotiated_version.load(Ordering::Acquire))
            .unwrap_or(self.config.protocol_version)
    }

    pub(crate) fn set_version(&self, version: ProtocolVersion) {
        self.negotiated_version
            .store(version.as_byte(), Ordering::Release);
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn connect_options(
        &self,
        version: ProtocolVersion,
        event_tx: Option<mpsc::Sender<basalt_proto::event::ProtocolEvent>>,
    ) -> ConnectOptions {
        ConnectOptions {
            version,
            compression: self.config.compression,
            connect_timeout: self.config.connect_timeout,
            heartbeat_interval: self.config.pooling.heartbeat_interval,
            max_requests: self.config.pooling.max_requests_per_connection,
            auth_provider: self.config.auth_provider.clone(),
            event_tx,
        }
    }

    pub(crate) fn pool_for(&self, address: SocketAddr) -> Option<Arc<HostPool>> {
        self.pools.read().expect("pools lock").get(&address).cloned()
    }

    /// Create the pool for a host if missing, and fill it in the background.
    pub(crate) fn ensure_pool(self: &Arc<Self>, host: &Arc<Host>) {
        let distance = self.config.load_balancing.distance(host);
        if distance == policies::HostDistance::Ignored {
            return;
        }
        let mut pools = self.pools.write().expect("pools lock");
        if pools.contains_key(&host.address()) {
            return;
        }
        let pool = HostPool::new(
            host.clone(),
            distance,
            self.config.pooling.clone(),
            self.connect_options(self.version(), None),
        );
        pool.spawn_maintenance(std::time::Duration::from_secs(10));
        pools.insert(host.address(), pool.clone());
        drop(pools);

        let inner = self.clone();
        let host = host.clone();
        tokio::spawn(async move {
            match pool.ensure_core().await {
                Ok(()) => {
                    control::on_host_up(&inner, &host).await;
                }
                Err(err) => {
                    tracing::debug!(host = %host.address(), error = %err,
                        "could not fill pool for host");
                }
            }
        });
    }

    pub(crate) fn remove_pool(&self, address: SocketAddr) {
        if let Some(pool) = self.pools.write().expect("pools lock").remove(&address) {
            pool.close();
        }
    }

    pub(crate) fn notify_listeners(&self, notify: impl Fn(&dyn HostStateListener)) {
        for listener in self.listeners.read().expect("listeners lock").iter() {
            notify(listener.as_ref());
        }
    }
}

/// Handle to one logical cluster.
///
/// Cheap to clone through [`Cluster::session`]; dropping the handle does not
/// close connections, call [`Cluster::shutdown`] for that.
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl Cluster {
    pub fn builder() -> ClusterBuilder {
        ClusterBuilder::default()
    }

    /// Connect: establish the control channel against one of the contact
    /// points, fetch the initial topology, and start the per-host pools.
    pub async fn connect(config: ClusterConfig) -> Result<Cluster, ExecutionError> {
        Self::connect_with_registry(config, Arc::new(CodecRegistry::new())).await
    }

    pub async fn connect_with_registry(
        config: ClusterConfig,
        registry: Arc<CodecRegistry>,
    ) -> Result<Cluster, ExecutionError> {
        let inner = Arc::new(ClusterInner {
            negotiated_version: AtomicU8::new(config.protocol_version.as_byte()),
            config,
            metadata: Metadata::new(),
            registry,
            pools: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            control: control::ControlState::new(),
            shutdown: AtomicBool::new(false),
            runtime: tokio::runtime::Handle::current(),
        });

        for contact_point in &inner.config.contact_points {
            inner.metadata.add_host(*contact_point);
        }

        control::init(&inner).await?;
        info!(version = %inner.version(), hosts = inner.metadata.all_hosts().len(),
            "cluster connected");

        for host in inner.metadata.all_hosts() {
            inner.ensure_pool(&host);
        }
        Ok(Cluster { inner })
    }

    /// A session bound to this cluster. Sessions are lightweight handles and
    /// are safe to clone and share across tasks.
    pub fn session(&self) -> Session {
        Session::new(self.inner.clone())
    }

    pub fn metadata(&self) -> &Metadata {
        &self.inner.metadata
    }

    pub fn codec_registry(&self) -> &Arc<CodecRegistry> {
        &self.inner.registry
    }

    /// The protocol version negotiated with the cluster.
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.inner.version()
    }

    /// Control-channel lifecycle state.
    pub fn control_status(&self) -> ControlStatus {
        self.inner.control.status()
    }

    /// Keyspace names and schema version from the last schema refresh.
    pub fn schema_snapshot(&self) -> SchemaSnapshot {
        self.inner.control.schema()
    }

    /// Counters for one host's pool, if it exists.
    pub fn pool_snapshot(&self, address: SocketAddr) -> Option<PoolSnapshot> {
        self.inner.pool_for(address).map(|pool| pool.snapshot())
    }

    pub fn register_listener(&self, listener: Arc<dyn HostStateListener>) {
        self.inner
            .listeners
            .write()
            .expect("listeners lock")
            .push(listener);
    }

    /// Trigger exactly one reconnection probe to the host, unless an attempt
    /// is already pending. Intended for hosts kept at IGNORED distance.
    pub fn try_reconnect_once(&self, address: SocketAddr) {
        if let Some(host) = self.inner.metadata.get_host(address) {
            control::try_reconnect_once(&self.inner, &host);
        }
    }

    /// Close the control channel, every pool, and pending reconnections.
    pub async fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.control.close();
        let pools: Vec<_> = {
            let mut map = self.inner.pools.write().expect("pools lock");
            map.drain().map(|(_, pool)| pool).collect()
        };
        for pool in pools {
            pool.close();
        }
        for host in self.inner.metadata.all_hosts() {
            host.cancel_reconnection();
        }
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("version", &self.inner.version())
            .field("hosts", &self.inner.metadata.all_hosts().len())
            .finish()
    }
}

/// Fluent configuration for [`Cluster::connect`].
#[derive(Default)]
pub struct ClusterBuilder {
    config: ClusterConfig,
    registry: Option<Arc<CodecRegistry>>,
}

impl ClusterBuilder {
    pub fn contact_point(mut self, address: SocketAddr) -> Self {
        self.config.contact_points.push(address);
        self
    }

    pub fn contact_points(mut self, addresses: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.config.contact_points.extend(addresses);
        self
    }

    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.config.protocol_version = version;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.config.compression = compression;
        self
    }

    pub fn pooling_options(mut self, pooling: PoolingOptions) -> Self {
        self.config.pooling = pooling;
        self
    }

    pub fn query_options(mut self, query: QueryOptions) -> Self {
        self.config.query = query;
        self
    }

    pub fn new_node_delay(mut self, delay: std::time::Duration) -> Self {
        self.config.new_node_delay = delay;
        self
    }

    pub fn load_balancing_policy(
        mut self,
        policy: Arc<dyn policies::LoadBalancingPolicy>,
    ) -> Self {
        self.config.load_balancing = policy;
        self
    }

    pub fn retry_policy(mut self, policy: Arc<dyn policies::RetryPolicy>) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn reconnection_policy(mut self, policy: Arc<dyn policies::ReconnectionPolicy>) -> Self {
        self.config.reconnection = policy;
        self
    }

    pub fn speculative_execution_policy(
        mut self,
        policy: Arc<dyn policies::SpeculativeExecutionPolicy>,
    ) -> Self {
        self.config.speculative = policy;
        self
    }

    pub fn auth_provider(mut self, provider: Arc<dyn policies::AuthProvider>) -> Self {
        self.config.auth_provider = Some(provider);
        self
    }

    pub fn codec_registry(mut self, registry: Arc<CodecRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub async fn build(self) -> Result<Cluster, ExecutionError> {
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(CodecRegistry::new()));
        Cluster::connect_with_registry(self.config, registry).await
    }
}
