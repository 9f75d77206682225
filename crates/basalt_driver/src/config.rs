//! Driver configuration.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use basalt_proto::frame::Compression;
use basalt_proto::{Consistency, ProtocolVersion};

use crate::policies::{
    AuthProvider, DefaultRetryPolicy, ExponentialReconnectionPolicy, HostDistance,
    LoadBalancingPolicy, NoSpeculativeExecutionPolicy, ReconnectionPolicy, RetryPolicy,
    RoundRobinPolicy, SpeculativeExecutionPolicy,
};

/// Per-host connection pool sizing and behavior.
#[derive(Clone, Debug)]
pub struct PoolingOptions {
    pub core_connections_local: usize,
    pub core_connections_remote: usize,
    pub max_connections_local: usize,
    pub max_connections_remote: usize,
    /// Bound on concurrent in-flight requests per connection; also bounded by
    /// the protocol's stream-id space.
    pub max_requests_per_connection: usize,
    /// Idle period after which an OPTIONS probe is written. Zero disables
    /// heartbeats.
    pub heartbeat_interval: Duration,
    /// Bound on requests parked while waiting for a connection; overflow
    /// fails the borrow with a busy-pool error.
    pub max_queued_requests: usize,
    /// Fraction of `max_requests_per_connection * pool_size` above which the
    /// pool grows (and of `core * threshold` below which it shrinks).
    pub resize_busy_ratio: f64,
}

impl Default for PoolingOptions {
    fn default() -> Self {
        PoolingOptions {
            core_connections_local: 2,
            core_connections_remote: 1,
            max_connections_local: 8,
            max_connections_remote: 2,
            max_requests_per_connection: 1024,
            heartbeat_interval: Duration::from_secs(30),
            max_queued_requests: 256,
            resize_busy_ratio: 0.8,
        }
    }
}

impl PoolingOptions {
    pub fn core_connections(&self, distance: HostDistance) -> usize {
        match distance {
            HostDistance::Local => self.core_connections_local,
            HostDistance::Remote => self.core_connections_remote,
            HostDistance::Ignored => 0,
        }
    }

    pub fn max_connections(&self, distance: HostDistance) -> usize {
        match distance {
            HostDistance::Local => self.max_connections_local,
            HostDistance::Remote => self.max_connections_remote,
            HostDistance::Ignored => 0,
        }
    }
}

/// Query execution and metadata refresh behavior.
#[derive(Clone, Debug)]
pub struct QueryOptions {
    pub consistency: Consistency,
    /// Client-side deadline for one user-level request, across all attempts.
    pub request_timeout: Duration,
    /// Bound on same-host retries for one request.
    pub max_retries: u32,
    /// Debounce window for single-node metadata refreshes.
    pub refresh_node_interval: Duration,
    /// Debounce window for full topology refreshes.
    pub refresh_node_list_interval: Duration,
    /// Debounce window for schema refreshes.
    pub refresh_schema_interval: Duration,
    pub page_size: i32,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions {
            consistency: Consistency::LocalOne,
            request_timeout: Duration::from_secs(12),
            max_retries: 3,
            refresh_node_interval: Duration::from_secs(1),
            refresh_node_list_interval: Duration::from_secs(1),
            refresh_schema_interval: Duration::from_secs(1),
            page_size: 5000,
        }
    }
}

/// Everything needed to build a cluster handle.
#[derive(Clone)]
pub struct ClusterConfig {
    pub contact_points: Vec<SocketAddr>,
    /// Upper bound for protocol negotiation; the driver downgrades from here.
    pub protocol_version: ProtocolVersion,
    pub compression: Compression,
    pub pooling: PoolingOptions,
    pub query: QueryOptions,
    /// Delay before a newly announced node is probed for metadata.
    pub new_node_delay: Duration,
    pub connect_timeout: Duration,
    pub load_balancing: Arc<dyn LoadBalancingPolicy>,
    pub retry: Arc<dyn RetryPolicy>,
    pub reconnection: Arc<dyn ReconnectionPolicy>,
    pub speculative: Arc<dyn SpeculativeExecutionPolicy>,
    pub auth_provider: Option<Arc<dyn AuthProvider>>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            contact_points: Vec::new(),
            protocol_version: ProtocolVersion::MAX,
            compression: Compression::None,
            pooling: PoolingOptions::default(),
            query: QueryOptions::default(),
            new_node_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            load_balancing: Arc::new(RoundRobinPolicy::new()),
            retry: Arc::new(DefaultRetryPolicy),
            reconnection: Arc::new(ExponentialReconnectionPolicy::default()),
            speculative: Arc::new(NoSpeculativeExecutionPolicy),
            auth_provider: None,
        }
    }
}

impl std::fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("contact_points", &self.contact_points)
            .field("protocol_version", &self.protocol_version)
            .field("compression", &self.compression)
            .field("pooling", &self.pooling)
            .field("query", &self.query)
            .field("new_node_delay", &self.new_node_delay)
            .finish()
    }
}
