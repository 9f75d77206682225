//! Per-query execution: host plan iteration, retries, speculative
//! executions, cancellation and the request deadline.
//!
//! One `Ctx` is shared by every execution of a query (the initial attempt and
//! its speculative siblings): they draw hosts from the same plan, accumulate
//! per-host errors into the same list, and the first terminal response wins.
//! Losing siblings are simply dropped; their in-flight stream ids are
//! reclaimed by the connection reader when the orphaned responses arrive.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use basalt_proto::messages::{
    BatchStatement, BatchType, ErrorCode, ErrorDetails, QueryParameters, Request, Response,
    ResultBody,
};
use basalt_proto::Consistency;
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::cluster::Host;
use crate::errors::{
    AttemptError, ConnectionError, ExecutionError, NoHostAvailable, ServerException,
};
use crate::policies::RetryDecision;
use crate::pool::HostPool;
use crate::session::{request_for, Cancellation, PreparedStatement, ResultSet};
use crate::{control, ClusterInner};

/// What to send, independent of which host ends up executing it.
#[derive(Clone, Debug)]
pub(crate) enum Payload {
    Query {
        query: String,
        params: QueryParameters,
    },
    Execute {
        prepared: Arc<PreparedStatement>,
        params: QueryParameters,
    },
    Batch {
        batch_type: BatchType,
        statements: Vec<BatchStatement>,
        consistency: Consistency,
    },
}

/// State shared by all executions of one query.
struct Ctx {
    inner: Arc<ClusterInner>,
    payload: Payload,
    plan: Mutex<Box<dyn Iterator<Item = Arc<Host>> + Send>>,
    errors: Mutex<Vec<(std::net::SocketAddr, AttemptError)>>,
    consistency_override: Mutex<Option<Consistency>>,
    retry_count: AtomicU32,
    cancellation: Cancellation,
}

impl Ctx {
    fn record(&self, address: std::net::SocketAddr, error: AttemptError) {
        self.errors.lock().expect("errors lock").push((address, error));
    }

    fn next_host(&self) -> Option<Arc<Host>> {
        self.plan.lock().expect("plan lock").next()
    }

    fn request(&self) -> Request {
        let mut request = request_for(&self.payload);
        if let Some(consistency) = *self.consistency_override.lock().expect("override lock") {
            match &mut request {
                Request::Query { params, .. } | Request::Execute { params, .. } => {
                    params.consistency = Some(consistency);
                }
                Request::Batch {
                    consistency: batch_consistency,
                    ..
                } => *batch_consistency = consistency,
                _ => {}
            }
        }
        request
    }

    fn no_host_available(&self) -> NoHostAvailable {
        NoHostAvailable {
            errors: self.errors.lock().expect("errors lock").clone(),
        }
    }
}

enum Outcome {
    Done(Result<ResultSet, ExecutionError>),
    /// This execution ran out of hosts; errors are in the shared list.
    Exhausted,
}

enum HostOutcome {
    Complete(Result<ResultSet, ExecutionError>),
    NextHost,
}

/// Execute a payload end-to-end, with speculative executions when the
/// statement is idempotent and the policy provides delays.
pub(crate) async fn execute(
    inner: &Arc<ClusterInner>,
    payload: Payload,
    idempotent: bool,
    cancellation: &Cancellation,
) -> Result<ResultSet, ExecutionError> {
    if inner.is_shutdown() {
        return Err(ExecutionError::Shutdown);
    }
    let deadline = Instant::now() + inner.config.query.request_timeout;
    let ctx = Arc::new(Ctx {
        inner: inner.clone(),
        plan: Mutex::new(inner.config.load_balancing.query_plan(&inner.metadata)),
        payload,
        errors: Mutex::new(Vec::new()),
        consistency_override: Mutex::new(None),
        retry_count: AtomicU32::new(0),
        cancellation: cancellation.clone(),
    });

    let mut executions: FuturesUnordered<BoxFuture<'static, Outcome>> = FuturesUnordered::new();
    executions.push(Box::pin(run_execution(ctx.clone())));
    let mut launched = 1usize;
    let speculative = inner.config.speculative.clone();
    let mut next_launch = idempotent
        .then(|| speculative.next_delay(launched).map(|delay| Instant::now() + delay))
        .flatten();

    loop {
        tokio::select! {
            outcome = executions.next() => match outcome {
                Some(Outcome::Done(result)) => return result,
                Some(Outcome::Exhausted) | None => {
                    // The plan is shared: once one execution exhausts it,
                    // spawning more cannot help. Wait only for siblings that
                    // are still in flight.
                    next_launch = None;
                    if executions.is_empty() {
                        return Err(ctx.no_host_available().into());
                    }
                }
            },
            _ = sleep_until_opt(next_launch), if next_launch.is_some() => {
                debug!(execution = launched + 1, "launching speculative execution");
                executions.push(Box::pin(run_execution(ctx.clone())));
                launched += 1;
                next_launch = speculative
                    .next_delay(launched)
                    .map(|delay| Instant::now() + delay);
            },
            _ = tokio::time::sleep_until(deadline) => {
                return Err(ExecutionError::Timeout {
                    timeout: inner.config.query.request_timeout,
                });
            }
        }
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// One execution: walk the host plan until a terminal result or exhaustion.
async fn run_execution(ctx: Arc<Ctx>) -> Outcome {
    loop {
        if ctx.cancellation.is_cancelled() {
            return Outcome::Done(Err(ExecutionError::Cancelled));
        }
        let Some(host) = ctx.next_host() else {
            return Outcome::Exhausted;
        };
        match attempt_host(&ctx, &host).await {
            HostOutcome::Complete(result) => return Outcome::Done(result),
            HostOutcome::NextHost => continue,
        }
    }
}

/// Try one host, including same-host retries and unprepared recovery.
async fn attempt_host(ctx: &Arc<Ctx>, host: &Arc<Host>) -> HostOutcome {
    let address = host.address();
    let mut reprepared = false;
    loop {
        if ctx.cancellation.is_cancelled() {
            return HostOutcome::Complete(Err(ExecutionError::Cancelled));
        }
        let Some(pool) = ctx.inner.pool_for(address) else {
            ctx.record(address, AttemptError::NoPool { address });
            return HostOutcome::NextHost;
        };
        let reservation = match pool.borrow().await {
            Ok(reservation) => reservation,
            Err(error) => {
                ctx.record(address, error);
                return HostOutcome::NextHost;
            }
        };

        let request = ctx.request();
        trace!(host = %address, "attempting request");
        // The reservation has done its job once the stream id is claimed.
        let pending = reservation.connection().start_request(&request);
        drop(reservation);
        let result = match pending {
            Ok(pending) => pending.response().await,
            Err(error) => Err(error),
        };

        let error = match result {
            Ok(Response::Result(body)) => {
                return HostOutcome::Complete(decode_result(ctx, body));
            }
            Ok(other) => AttemptError::Connection(ConnectionError::Wire {
                address,
                detail: format!("unexpected response {:?}", other.opcode()),
            }),
            Err(error) => error,
        };

        match classify(ctx, host, &pool, error, &mut reprepared).await {
            Classified::Complete(result) => return HostOutcome::Complete(result),
            Classified::RetrySameHost => continue,
            Classified::NextHost => return HostOutcome::NextHost,
        }
    }
}

enum Classified {
    Complete(Result<ResultSet, ExecutionError>),
    RetrySameHost,
    NextHost,
}

/// Route one attempt error through the propagation policy.
async fn classify(
    ctx: &Arc<Ctx>,
    host: &Arc<Host>,
    pool: &Arc<HostPool>,
    error: AttemptError,
    reprepared: &mut bool,
) -> Classified {
    let address = host.address();
    let retry_policy = ctx.inner.config.retry.clone();
    let retry_count = ctx.retry_count.load(Ordering::Acquire);

    let decision = match &error {
        AttemptError::Server(exception) => match exception.code {
            // Recovered locally: re-prepare on this host and retry it once.
            ErrorCode::Unprepared => {
                if *reprepared {
                    ctx.record(address, error);
                    return Classified::NextHost;
                }
                if let Payload::Execute { prepared, .. } = &ctx.payload {
                    match reprepare(pool, &prepared.query).await {
                        Ok(()) => {
                            *reprepared = true;
                            return Classified::RetrySameHost;
                        }
                        Err(prepare_error) => {
                            ctx.record(address, prepare_error);
                            return Classified::NextHost;
                        }
                    }
                }
                ctx.record(address, error);
                return Classified::NextHost;
            }
            // The coordinator asked us to go elsewhere right away.
            ErrorCode::Overloaded | ErrorCode::IsBootstrapping => {
                ctx.record(address, error);
                return Classified::NextHost;
            }
            ErrorCode::Unavailable => match exception.details {
                ErrorDetails::Unavailable {
                    consistency,
                    required,
                    alive,
                } => retry_policy.on_unavailable(consistency, required, alive, retry_count),
                _ => RetryDecision::Rethrow,
            },
            ErrorCode::ReadTimeout => match exception.details {
                ErrorDetails::ReadTimeout {
                    consistency,
                    received,
                    block_for,
                    data_present,
                } => retry_policy.on_read_timeout(
                    consistency,
                    received,
                    block_for,
                    data_present,
                    retry_count,
                ),
                _ => RetryDecision::Rethrow,
            },
            ErrorCode::WriteTimeout => match &exception.details {
                ErrorDetails::WriteTimeout {
                    consistency,
                    received,
                    block_for,
                    write_type,
                } => retry_policy.on_write_timeout(
                    *consistency,
                    *write_type,
                    *received,
                    *block_for,
                    retry_count,
                ),
                _ => RetryDecision::Rethrow,
            },
            // Fatal to the request: surfacing beats hammering other hosts.
            _ if exception.is_fatal() => {
                return Classified::Complete(Err(ExecutionError::Server(exception.clone())));
            }
            ErrorCode::ReadFailure | ErrorCode::WriteFailure | ErrorCode::FunctionFailure => {
                return Classified::Complete(Err(ExecutionError::Server(exception.clone())));
            }
            _ => retry_policy.on_request_error(&error, retry_count),
        },
        AttemptError::Connection(_) => {
            // The pool tears the connection down on its own; tell the
            // topology tracker so reconnection starts.
            control::on_connection_error(&ctx.inner, host).await;
            retry_policy.on_request_error(&error, retry_count)
        }
        AttemptError::Timeout { .. } => retry_policy.on_request_error(&error, retry_count),
        AttemptError::BusyPool { .. }
        | AttemptError::BusyConnection { .. }
        | AttemptError::NoPool { .. } => {
            ctx.record(address, error);
            return Classified::NextHost;
        }
    };

    match decision {
        RetryDecision::RetrySame(consistency) => {
            let retries = ctx.retry_count.fetch_add(1, Ordering::AcqRel) + 1;
            if retries > ctx.inner.config.query.max_retries {
                ctx.record(address, error);
                return Classified::NextHost;
            }
            if consistency.is_some() {
                *ctx.consistency_override.lock().expect("override lock") = consistency;
            }
            Classified::RetrySameHost
        }
        RetryDecision::RetryNext(consistency) => {
            ctx.retry_count.fetch_add(1, Ordering::AcqRel);
            if consistency.is_some() {
                *ctx.consistency_override.lock().expect("override lock") = consistency;
            }
            ctx.record(address, error);
            Classified::NextHost
        }
        RetryDecision::Rethrow => Classified::Complete(Err(rethrown(error))),
        RetryDecision::Ignore => Classified::Complete(Ok(ResultSet::empty())),
    }
}

fn rethrown(error: AttemptError) -> ExecutionError {
    match error {
        AttemptError::Server(exception) => ExecutionError::Server(exception),
        AttemptError::Connection(error) => ExecutionError::Connection(error),
        other => NoHostAvailable {
            errors: vec![(address_of(&other), other)],
        }
        .into(),
    }
}

fn address_of(error: &AttemptError) -> std::net::SocketAddr {
    match error {
        AttemptError::Connection(error) => error.address(),
        AttemptError::Server(exception) => exception.address,
        AttemptError::BusyPool { address }
        | AttemptError::BusyConnection { address }
        | AttemptError::NoPool { address }
        | AttemptError::Timeout { address } => *address,
    }
}

fn decode_result(ctx: &Arc<Ctx>, body: ResultBody) -> Result<ResultSet, ExecutionError> {
    match body {
        ResultBody::Rows(rows) => {
            ResultSet::decode(&ctx.inner.registry, ctx.inner.version(), rows)
        }
        ResultBody::Void
        | ResultBody::SetKeyspace(_)
        | ResultBody::SchemaChange(_)
        | ResultBody::Prepared(_) => Ok(ResultSet::empty()),
    }
}

/// Re-prepare a statement on a specific host after an unprepared response.
async fn reprepare(pool: &Arc<HostPool>, query: &str) -> Result<(), AttemptError> {
    let reservation = pool.borrow().await?;
    let pending = reservation.connection().start_request(&Request::Prepare {
        query: query.to_string(),
    });
    drop(reservation);
    let response = pending?.response().await?;
    match response {
        Response::Result(ResultBody::Prepared(_)) => Ok(()),
        other => Err(AttemptError::Connection(ConnectionError::Wire {
            address: pool.host().address(),
            detail: format!("unexpected reprepare response {:?}", other.opcode()),
        })),
    }
}

/// Prepare a statement on the first responsive host of a fresh plan.
pub(crate) async fn prepare(
    inner: &Arc<ClusterInner>,
    query: &str,
    cancellation: &Cancellation,
) -> Result<PreparedStatement, ExecutionError> {
    if inner.is_shutdown() {
        return Err(ExecutionError::Shutdown);
    }
    let deadline = Instant::now() + inner.config.query.request_timeout;
    let mut plan = inner.config.load_balancing.query_plan(&inner.metadata);
    let mut errors = Vec::new();

    while let Some(host) = plan.next() {
        if cancellation.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        if Instant::now() >= deadline {
            return Err(ExecutionError::Timeout {
                timeout: inner.config.query.request_timeout,
            });
        }
        let address = host.address();
        let Some(pool) = inner.pool_for(address) else {
            errors.push((address, AttemptError::NoPool { address }));
            continue;
        };
        let reservation = match pool.borrow().await {
            Ok(reservation) => reservation,
            Err(error) => {
                errors.push((address, error));
                continue;
            }
        };
        let pending = reservation.connection().start_request(&Request::Prepare {
            query: query.to_string(),
        });
        drop(reservation);
        let response = match pending {
            Ok(pending) => pending.response().await,
            Err(error) => Err(error),
        };
        match response {
            Ok(Response::Result(ResultBody::Prepared(prepared))) => {
                return Ok(PreparedStatement {
                    id: prepared.id,
                    query: query.to_string(),
                    bind_variables: prepared.bind_variables,
                    result_columns: prepared.result_columns,
                    idempotent: std::sync::atomic::AtomicBool::new(false),
                });
            }
            Ok(other) => {
                errors.push((
                    address,
                    AttemptError::Connection(ConnectionError::Wire {
                        address,
                        detail: format!("unexpected prepare response {:?}", other.opcode()),
                    }),
                ));
            }
            Err(AttemptError::Server(exception)) if exception.is_fatal() => {
                return Err(ExecutionError::Server(exception));
            }
            Err(error) => {
                if let AttemptError::Connection(_) = &error {
                    control::on_connection_error(inner, &host).await;
                }
                errors.push((address, error));
            }
        }
    }
    Err(NoHostAvailable { errors }.into())
}
