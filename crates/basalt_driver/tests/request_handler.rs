//! Request-handler integration tests: retries, failover, speculative
//! executions, cancellation, and pool saturation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use basalt_driver::errors::{AttemptError, ExecutionError};
use basalt_driver::policies::ConstantSpeculativeExecutionPolicy;
use basalt_driver::{Cluster, Consistency, PoolingOptions, QueryOptions, Statement};
use basalt_proto::messages::{ErrorCode, ErrorDetails};
use common::{wait_for, FixedOrderPolicy, MockNode, MockNodeConfig, QueryOutcome};

async fn two_node_cluster(
    first: &MockNode,
    second: &MockNode,
) -> Cluster {
    Cluster::builder()
        .contact_points([first.addr(), second.addr()])
        .load_balancing_policy(Arc::new(FixedOrderPolicy {
            order: vec![first.addr(), second.addr()],
        }))
        .build()
        .await
        .unwrap()
}

async fn wait_for_pools(cluster: &Cluster, nodes: &[&MockNode]) {
    for node in nodes {
        let address = node.addr();
        wait_for("pool ready", Duration::from_secs(5), || {
            cluster
                .pool_snapshot(address)
                .map_or(false, |snapshot| snapshot.connections > 0)
        })
        .await;
    }
}

#[tokio::test]
async fn unavailable_retries_once_on_the_next_host() {
    let first = MockNode::start(MockNodeConfig::default()).await.unwrap();
    let second = MockNode::start(MockNodeConfig::default()).await.unwrap();
    first.set_query_handler(|_, _, _| {
        QueryOutcome::error(
            ErrorCode::Unavailable,
            ErrorDetails::Unavailable {
                consistency: Consistency::Quorum,
                required: 2,
                alive: 1,
            },
        )
    });

    let cluster = two_node_cluster(&first, &second).await;
    wait_for_pools(&cluster, &[&first, &second]).await;

    let result = cluster
        .session()
        .execute(&Statement::new("SELECT v FROM ks.t WHERE pk = 1"))
        .await;
    assert!(result.is_ok(), "failover should succeed: {result:?}");
    // Exactly one attempt on the unavailable coordinator, one on the next.
    assert_eq!(first.query_count(), 1);
    assert_eq!(second.query_count(), 1);
    cluster.shutdown().await;
}

#[tokio::test]
async fn fatal_errors_are_not_retried() {
    let first = MockNode::start(MockNodeConfig::default()).await.unwrap();
    let second = MockNode::start(MockNodeConfig::default()).await.unwrap();
    first.set_query_handler(|_, _, _| {
        QueryOutcome::error(ErrorCode::SyntaxError, ErrorDetails::None)
    });

    let cluster = two_node_cluster(&first, &second).await;
    wait_for_pools(&cluster, &[&first, &second]).await;

    let error = cluster
        .session()
        .execute(&Statement::new("SELEKT broken"))
        .await
        .unwrap_err();
    let ExecutionError::Server(exception) = error else {
        panic!("expected a server exception, got {error:?}");
    };
    assert_eq!(exception.code, ErrorCode::SyntaxError);
    assert_eq!(second.query_count(), 0);
    cluster.shutdown().await;
}

#[tokio::test]
async fn exhausted_plan_aggregates_errors_in_attempt_order() {
    let first = MockNode::start(MockNodeConfig::default()).await.unwrap();
    let second = MockNode::start(MockNodeConfig::default()).await.unwrap();
    for node in [&first, &second] {
        node.set_query_handler(|_, _, _| {
            QueryOutcome::error(ErrorCode::Overloaded, ErrorDetails::None)
        });
    }

    let cluster = two_node_cluster(&first, &second).await;
    wait_for_pools(&cluster, &[&first, &second]).await;

    let error = cluster
        .session()
        .execute(&Statement::new("SELECT v FROM ks.t"))
        .await
        .unwrap_err();
    let ExecutionError::NoHostAvailable(aggregate) = error else {
        panic!("expected NoHostAvailable, got {error:?}");
    };
    assert_eq!(aggregate.errors.len(), 2);
    assert_eq!(aggregate.errors[0].0, first.addr());
    assert_eq!(aggregate.errors[1].0, second.addr());
    for (_, attempt) in &aggregate.errors {
        let AttemptError::Server(exception) = attempt else {
            panic!("expected per-host server errors, got {attempt:?}");
        };
        assert_eq!(exception.code, ErrorCode::Overloaded);
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn unprepared_response_triggers_transparent_reprepare() {
    let node = MockNode::start(MockNodeConfig::default()).await.unwrap();
    let cluster = Cluster::builder()
        .contact_point(node.addr())
        .build()
        .await
        .unwrap();
    wait_for_pools(&cluster, &[&node]).await;

    let session = cluster.session();
    let prepared = session
        .prepare("SELECT v FROM ks.t WHERE pk = ?")
        .await
        .unwrap();

    // Simulate the server evicting the statement from its prepared cache.
    node.fail_executes_unprepared(1);
    let result = session
        .execute_prepared(&prepared, vec![basalt_driver::CqlValue::Int(1)], None)
        .await;
    assert!(result.is_ok(), "reprepare should recover: {result:?}");
    // Only the post-reprepare execute reaches the data handler.
    assert_eq!(node.query_count(), 1);
    cluster.shutdown().await;
}

#[tokio::test]
async fn speculative_execution_beats_a_slow_host() {
    let slow = MockNode::start(MockNodeConfig::default()).await.unwrap();
    let fast = MockNode::start(MockNodeConfig::default()).await.unwrap();
    slow.set_query_handler(|_, _, _| QueryOutcome::void_after(Duration::from_millis(600)));

    let cluster = Cluster::builder()
        .contact_points([slow.addr(), fast.addr()])
        .load_balancing_policy(Arc::new(FixedOrderPolicy {
            order: vec![slow.addr(), fast.addr()],
        }))
        .speculative_execution_policy(Arc::new(ConstantSpeculativeExecutionPolicy {
            delay: Duration::from_millis(50),
            max_executions: 1,
        }))
        .build()
        .await
        .unwrap();
    wait_for_pools(&cluster, &[&slow, &fast]).await;

    let started = tokio::time::Instant::now();
    let result = cluster
        .session()
        .execute(&Statement::new("SELECT v FROM ks.t WHERE pk = 1").idempotent())
        .await;
    assert!(result.is_ok(), "speculative attempt should win: {result:?}");
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "the fast host's response should complete the query first"
    );
    assert_eq!(fast.query_count(), 1);
    cluster.shutdown().await;
}

#[tokio::test]
async fn cancelled_queries_quiesce_with_no_leaked_stream_ids() {
    let node = MockNode::start(MockNodeConfig::default()).await.unwrap();
    node.set_query_handler(|_, _, _| QueryOutcome::void_after(Duration::from_millis(10)));

    let cluster = Cluster::builder()
        .contact_point(node.addr())
        .pooling_options(PoolingOptions {
            core_connections_local: 2,
            max_connections_local: 2,
            heartbeat_interval: Duration::ZERO,
            ..PoolingOptions::default()
        })
        .build()
        .await
        .unwrap();
    wait_for_pools(&cluster, &[&node]).await;
    let session = cluster.session();

    // Cancel each query around its estimated completion time: some futures
    // are dropped before the write, some mid-flight, some after completion.
    let mut tasks = Vec::new();
    for i in 0..400u64 {
        let session = session.clone();
        tasks.push(tokio::spawn(async move {
            let statement = Statement::new("SELECT v FROM ks.t WHERE pk = 1");
            let cancel_after = Duration::from_micros(2_000 + (i % 20) * 1_000);
            let _ = tokio::time::timeout(cancel_after, session.execute(&statement)).await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // Once the delayed responses have drained, every slot must be free.
    let address = node.addr();
    wait_for("in-flight drained", Duration::from_secs(5), || {
        cluster
            .pool_snapshot(address)
            .map_or(false, |snapshot| {
                snapshot.in_flight == 0 && snapshot.allocated_stream_ids == 0
            })
    })
    .await;

    // The pool is still usable afterwards.
    let result = session
        .execute(&Statement::new("SELECT v FROM ks.t WHERE pk = 1"))
        .await;
    assert!(result.is_ok(), "pool should survive the churn: {result:?}");
    cluster.shutdown().await;
}

#[tokio::test]
async fn saturated_pool_with_full_queue_reports_busy() {
    let node = MockNode::start(MockNodeConfig::default()).await.unwrap();
    node.set_query_handler(|_, _, _| QueryOutcome::void_after(Duration::from_millis(300)));

    let cluster = Cluster::builder()
        .contact_point(node.addr())
        .pooling_options(PoolingOptions {
            core_connections_local: 1,
            max_connections_local: 1,
            max_requests_per_connection: 2,
            max_queued_requests: 0,
            heartbeat_interval: Duration::ZERO,
            ..PoolingOptions::default()
        })
        .query_options(QueryOptions {
            request_timeout: Duration::from_secs(2),
            ..QueryOptions::default()
        })
        .build()
        .await
        .unwrap();
    wait_for_pools(&cluster, &[&node]).await;
    let session = cluster.session();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let session = session.clone();
        tasks.push(tokio::spawn(async move {
            session
                .execute(&Statement::new("SELECT v FROM ks.t WHERE pk = 1"))
                .await
        }));
    }
    let mut busy = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => {}
            Err(ExecutionError::NoHostAvailable(aggregate)) => {
                if aggregate
                    .errors
                    .iter()
                    .any(|(_, error)| matches!(error, AttemptError::BusyPool { .. }))
                {
                    busy += 1;
                }
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(busy > 0, "expected at least one busy-pool rejection");
    cluster.shutdown().await;
}
