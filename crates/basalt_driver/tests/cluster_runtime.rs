//! Control-channel and topology integration tests against in-process nodes.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use basalt_driver::policies::{ConstantReconnectionPolicy, PlainTextAuthProvider};
use basalt_driver::{
    Cluster, ControlStatus, HostState, HostStateListener, PoolingOptions, ProtocolVersion,
};
use basalt_proto::event::{ProtocolEvent, StatusChangeType};
use common::{wait_for, MockNode, MockNodeConfig};

#[tokio::test]
async fn connect_negotiates_downward_to_v2() {
    let node = MockNode::start(MockNodeConfig {
        max_version: ProtocolVersion::V2,
        ..MockNodeConfig::default()
    })
    .await
    .unwrap();

    let cluster = Cluster::builder()
        .contact_point(node.addr())
        .build()
        .await
        .unwrap();

    // One rejection each for v4 and v3, then success at v2.
    assert_eq!(cluster.protocol_version(), ProtocolVersion::V2);
    assert!(node.startup_count() >= 3);
    assert_eq!(cluster.control_status(), ControlStatus::Ready);

    let snapshot = cluster.schema_snapshot();
    assert!(snapshot.keyspaces.contains(&"system".to_string()));
    cluster.shutdown().await;
}

#[derive(Default)]
struct CountingListener {
    ups: AtomicUsize,
    downs: AtomicUsize,
}

impl HostStateListener for CountingListener {
    fn on_up(&self, _host: &Arc<basalt_driver::Host>) {
        self.ups.fetch_add(1, Ordering::SeqCst);
    }

    fn on_down(&self, _host: &Arc<basalt_driver::Host>) {
        self.downs.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn status_events_drive_host_state_and_reconnection_slot() {
    let control_node = MockNode::start(MockNodeConfig::default()).await.unwrap();
    let data_node = MockNode::start(MockNodeConfig::default()).await.unwrap();

    let cluster = Cluster::builder()
        .contact_points([control_node.addr(), data_node.addr()])
        // Long delay keeps the pending attempt observable.
        .reconnection_policy(Arc::new(ConstantReconnectionPolicy::new(
            Duration::from_secs(60),
        )))
        .build()
        .await
        .unwrap();
    let listener = Arc::new(CountingListener::default());
    cluster.register_listener(listener.clone());

    let host = cluster.metadata().get_host(data_node.addr()).unwrap();
    wait_for("data host up", Duration::from_secs(5), || host.is_up()).await;

    control_node.push_event(&ProtocolEvent::StatusChange {
        status: StatusChangeType::Down,
        node: data_node.addr(),
    });
    wait_for("host marked down", Duration::from_secs(5), || {
        host.state() == HostState::Down && host.reconnection_pending()
    })
    .await;
    assert_eq!(listener.downs.load(Ordering::SeqCst), 1);

    // A duplicate DOWN is idempotent: no second listener callback.
    control_node.push_event(&ProtocolEvent::StatusChange {
        status: StatusChangeType::Down,
        node: data_node.addr(),
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(listener.downs.load(Ordering::SeqCst), 1);

    control_node.push_event(&ProtocolEvent::StatusChange {
        status: StatusChangeType::Up,
        node: data_node.addr(),
    });
    wait_for("host marked up again", Duration::from_secs(5), || {
        host.state() == HostState::Up && !host.reconnection_pending()
    })
    .await;
    assert!(listener.ups.load(Ordering::SeqCst) >= 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn idle_connections_send_heartbeat_probes() {
    let node = MockNode::start(MockNodeConfig::default()).await.unwrap();

    let cluster = Cluster::builder()
        .contact_point(node.addr())
        .pooling_options(PoolingOptions {
            heartbeat_interval: Duration::from_millis(200),
            ..PoolingOptions::default()
        })
        .build()
        .await
        .unwrap();

    let before = node.options_count();
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(
        node.options_count() > before,
        "expected OPTIONS probes on idle connections"
    );
    cluster.shutdown().await;
}

#[tokio::test]
async fn plain_text_authentication_round_trips() {
    let node = MockNode::start(MockNodeConfig {
        auth: Some(("cassandra".into(), "cassandra".into())),
        ..MockNodeConfig::default()
    })
    .await
    .unwrap();

    let cluster = Cluster::builder()
        .contact_point(node.addr())
        .auth_provider(Arc::new(PlainTextAuthProvider::new("cassandra", "cassandra")))
        .build()
        .await
        .unwrap();
    assert_eq!(cluster.control_status(), ControlStatus::Ready);
    cluster.shutdown().await;
}

#[tokio::test]
async fn bad_credentials_fail_the_connect() {
    let node = MockNode::start(MockNodeConfig {
        auth: Some(("cassandra".into(), "secret".into())),
        ..MockNodeConfig::default()
    })
    .await
    .unwrap();

    let error = Cluster::builder()
        .contact_point(node.addr())
        .auth_provider(Arc::new(PlainTextAuthProvider::new("cassandra", "wrong")))
        .build()
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        basalt_driver::errors::ExecutionError::Authentication { .. }
    ));
}
