//! Shared helpers for integration tests: an in-process protocol server that
//! stands in for a database node, plus canned catalog responses.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use basalt_proto::event::ProtocolEvent;
use basalt_proto::frame::Frame;
use basalt_proto::messages::{
    ColumnSpec, ErrorCode, ErrorDetails, PreparedResult, Request, Response, ResultBody,
    RowsMetadata, RowsResult, ServerError,
};
use basalt_proto::types::CqlType;
use basalt_proto::{Opcode, ProtocolVersion};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// What a scripted node answers to one data query.
pub struct QueryOutcome {
    pub body: Result<ResultBody, ServerError>,
    pub delay: Duration,
}

impl QueryOutcome {
    pub fn void() -> QueryOutcome {
        QueryOutcome {
            body: Ok(ResultBody::Void),
            delay: Duration::ZERO,
        }
    }

    pub fn void_after(delay: Duration) -> QueryOutcome {
        QueryOutcome {
            body: Ok(ResultBody::Void),
            delay,
        }
    }

    pub fn error(code: ErrorCode, details: ErrorDetails) -> QueryOutcome {
        QueryOutcome {
            body: Err(ServerError::with_details(code, "scripted failure", details)),
            delay: Duration::ZERO,
        }
    }
}

/// `query string, version, per-node attempt counter -> outcome`
pub type QueryHandler =
    dyn Fn(&str, ProtocolVersion, u64) -> QueryOutcome + Send + Sync + 'static;

pub struct MockNodeConfig {
    pub max_version: ProtocolVersion,
    /// Username/password pair enforced during the handshake, if any.
    pub auth: Option<(String, String)>,
}

impl Default for MockNodeConfig {
    fn default() -> Self {
        MockNodeConfig {
            max_version: ProtocolVersion::V4,
            auth: None,
        }
    }
}

struct NodeState {
    config: MockNodeConfig,
    addr: SocketAddr,
    handler: Mutex<Arc<QueryHandler>>,
    /// Event sinks of connections that sent REGISTER, with their versions.
    event_sinks: Mutex<Vec<(ProtocolVersion, mpsc::UnboundedSender<Frame>)>>,
    startups: AtomicUsize,
    options: AtomicUsize,
    queries: AtomicUsize,
    /// Next N EXECUTE requests answer `Unprepared`.
    unprepared_fuse: AtomicUsize,
    prepared: Mutex<HashMap<Vec<u8>, String>>,
}

/// An in-process node speaking the wire protocol on an ephemeral port.
pub struct MockNode {
    state: Arc<NodeState>,
}

/// Route driver logs through the test harness when `RUST_LOG` is set.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

impl MockNode {
    pub async fn start(config: MockNodeConfig) -> anyhow::Result<MockNode> {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(NodeState {
            config,
            addr,
            handler: Mutex::new(Arc::new(|_: &str, _, _| QueryOutcome::void())),
            event_sinks: Mutex::new(Vec::new()),
            startups: AtomicUsize::new(0),
            options: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
            unprepared_fuse: AtomicUsize::new(0),
            prepared: Mutex::new(HashMap::new()),
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let _ = socket.set_nodelay(true);
                tokio::spawn(serve_connection(accept_state.clone(), socket));
            }
        });

        Ok(MockNode { state })
    }

    pub fn addr(&self) -> SocketAddr {
        self.state.addr
    }

    pub fn set_query_handler(
        &self,
        handler: impl Fn(&str, ProtocolVersion, u64) -> QueryOutcome + Send + Sync + 'static,
    ) {
        *self.state.handler.lock().unwrap() = Arc::new(handler);
    }

    /// Push a server event to every registered (control) connection.
    pub fn push_event(&self, event: &ProtocolEvent) {
        let mut sinks = self.state.event_sinks.lock().unwrap();
        sinks.retain(|(version, sink)| {
            let frame = Frame::response(
                *version,
                version.event_stream(),
                Opcode::Event,
                event.serialize(*version),
            );
            sink.send(frame).is_ok()
        });
    }

    pub fn startup_count(&self) -> usize {
        self.state.startups.load(Ordering::SeqCst)
    }

    pub fn options_count(&self) -> usize {
        self.state.options.load(Ordering::SeqCst)
    }

    pub fn query_count(&self) -> usize {
        self.state.queries.load(Ordering::SeqCst)
    }

    /// Make the next `n` EXECUTE requests fail with `Unprepared`.
    pub fn fail_executes_unprepared(&self, n: usize) {
        self.state.unprepared_fuse.store(n, Ordering::SeqCst);
    }
}

async fn read_frame(read_half: &mut OwnedReadHalf) -> std::io::Result<Option<Frame>> {
    let mut first = [0u8; 1];
    match read_half.read_exact(&mut first).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let version = ProtocolVersion::from_byte(first[0])
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))?;

    let mut flags = [0u8; 1];
    read_half.read_exact(&mut flags).await?;
    let stream = match version.stream_width() {
        1 => {
            let mut raw = [0u8; 1];
            read_half.read_exact(&mut raw).await?;
            raw[0] as i8 as i16
        }
        _ => {
            let mut raw = [0u8; 2];
            read_half.read_exact(&mut raw).await?;
            i16::from_be_bytes(raw)
        }
    };
    let mut opcode = [0u8; 1];
    read_half.read_exact(&mut opcode).await?;
    let opcode = Opcode::from_byte(opcode[0])
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))?;
    let mut len = [0u8; 4];
    read_half.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len) as usize;
    let mut body = vec![0u8; len];
    read_half.read_exact(&mut body).await?;
    Ok(Some(Frame {
        version,
        flags: flags[0],
        stream,
        opcode,
        body: Bytes::from(body),
    }))
}

async fn write_frame(write_half: &mut OwnedWriteHalf, frame: &Frame) -> std::io::Result<()> {
    let mut out = BytesMut::with_capacity(frame.body.len() + 16);
    out.put_u8(frame.version.as_byte() | 0x80);
    out.put_u8(frame.flags);
    match frame.version.stream_width() {
        1 => out.put_i8(frame.stream as i8),
        _ => out.put_i16(frame.stream),
    }
    out.put_u8(frame.opcode.as_byte());
    out.put_u32(frame.body.len() as u32);
    out.extend_from_slice(&frame.body);
    write_half.write_all(&out).await?;
    write_half.flush().await
}

fn response_frame(version: ProtocolVersion, stream: i16, response: &Response) -> Frame {
    let body = response.serialize_body(version).expect("encode response");
    Frame::response(version, stream, response.opcode(), body)
}

async fn serve_connection(state: Arc<NodeState>, socket: tokio::net::TcpStream) {
    let (mut read_half, mut write_half) = socket.into_split();
    let (resp_tx, mut resp_rx) = mpsc::unbounded_channel::<Frame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = resp_rx.recv().await {
            if write_frame(&mut write_half, &frame).await.is_err() {
                return;
            }
        }
    });

    let mut authenticated = state.config.auth.is_none();
    while let Ok(Some(frame)) = read_frame(&mut read_half).await {
        let version = frame.version;
        let stream = frame.stream;
        let mut body = frame.body.clone();
        let Ok(request) = Request::parse(frame.opcode, &mut body, version) else {
            break;
        };

        match request {
            Request::Startup { .. } => {
                state.startups.fetch_add(1, Ordering::SeqCst);
                let response = if version > state.config.max_version {
                    Response::Error(ServerError::new(
                        ErrorCode::ProtocolError,
                        format!("unsupported protocol version {version}"),
                    ))
                } else if state.config.auth.is_some() {
                    Response::Authenticate {
                        authenticator: "org.apache.cassandra.auth.PasswordAuthenticator".into(),
                    }
                } else {
                    Response::Ready
                };
                let _ = resp_tx.send(response_frame(version, stream, &response));
            }
            Request::AuthResponse { token } => {
                let expected = state.config.auth.as_ref().map(|(user, pass)| {
                    let mut expected = vec![0u8];
                    expected.extend_from_slice(user.as_bytes());
                    expected.push(0);
                    expected.extend_from_slice(pass.as_bytes());
                    expected
                });
                let response = match (expected, token) {
                    (Some(expected), Some(token)) if token.as_ref() == expected.as_slice() => {
                        authenticated = true;
                        Response::AuthSuccess { token: None }
                    }
                    _ => Response::Error(ServerError::new(
                        ErrorCode::AuthenticationError,
                        "bad credentials",
                    )),
                };
                let _ = resp_tx.send(response_frame(version, stream, &response));
            }
            Request::Options => {
                state.options.fetch_add(1, Ordering::SeqCst);
                let response = Response::Supported {
                    options: HashMap::from([(
                        "COMPRESSION".to_string(),
                        vec!["snappy".to_string(), "lz4".to_string()],
                    )]),
                };
                let _ = resp_tx.send(response_frame(version, stream, &response));
            }
            Request::Register { .. } => {
                state
                    .event_sinks
                    .lock()
                    .unwrap()
                    .push((version, resp_tx.clone()));
                let _ = resp_tx.send(response_frame(version, stream, &Response::Ready));
            }
            Request::Prepare { query } => {
                let id = prepared_id(&query);
                state
                    .prepared
                    .lock()
                    .unwrap()
                    .insert(id.to_vec(), query.clone());
                let response = Response::Result(ResultBody::Prepared(PreparedResult {
                    id,
                    bind_variables: Vec::new(),
                    result_columns: Vec::new(),
                }));
                let _ = resp_tx.send(response_frame(version, stream, &response));
            }
            Request::Query { query, .. } => {
                if !authenticated {
                    break;
                }
                dispatch_query(&state, &resp_tx, version, stream, query);
            }
            Request::Execute { id, .. } => {
                if state.unprepared_fuse.load(Ordering::SeqCst) > 0 {
                    state.unprepared_fuse.fetch_sub(1, Ordering::SeqCst);
                    let response = Response::Error(ServerError::with_details(
                        ErrorCode::Unprepared,
                        "prepared statement evicted",
                        ErrorDetails::Unprepared { id: id.clone() },
                    ));
                    let _ = resp_tx.send(response_frame(version, stream, &response));
                    continue;
                }
                let query = state
                    .prepared
                    .lock()
                    .unwrap()
                    .get(id.as_ref())
                    .cloned()
                    .unwrap_or_default();
                dispatch_query(&state, &resp_tx, version, stream, query);
            }
            Request::Batch { .. } => {
                let _ = resp_tx.send(response_frame(
                    version,
                    stream,
                    &Response::Result(ResultBody::Void),
                ));
            }
        }
    }

    writer.abort();
}

/// Route one data query: canned catalog answers first, then the scripted
/// handler, on its own task so delayed responses do not serialize streams.
fn dispatch_query(
    state: &Arc<NodeState>,
    resp_tx: &mpsc::UnboundedSender<Frame>,
    version: ProtocolVersion,
    stream: i16,
    query: String,
) {
    if let Some(response) = catalog_response(state, version, &query) {
        let _ = resp_tx.send(response_frame(version, stream, &response));
        return;
    }

    let attempt = state.queries.fetch_add(1, Ordering::SeqCst) as u64;
    let handler = state.handler.lock().unwrap().clone();
    let outcome = handler(&query, version, attempt);
    let response = match outcome.body {
        Ok(body) => Response::Result(body),
        Err(error) => Response::Error(error),
    };
    let resp_tx = resp_tx.clone();
    tokio::spawn(async move {
        if !outcome.delay.is_zero() {
            tokio::time::sleep(outcome.delay).await;
        }
        let _ = resp_tx.send(response_frame(version, stream, &response));
    });
}

fn prepared_id(query: &str) -> Bytes {
    // Stable per query, readable in failure output.
    let mut hash = 0xcbf29ce484222325u64;
    for byte in query.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    Bytes::from(hash.to_be_bytes().to_vec())
}

fn column(name: &str, ty: CqlType) -> ColumnSpec {
    ColumnSpec {
        keyspace: "system".into(),
        table: "local".into(),
        name: name.into(),
        ty,
    }
}

fn text_cell(value: &str) -> Option<Bytes> {
    Some(Bytes::copy_from_slice(value.as_bytes()))
}

fn inet_cell(addr: std::net::IpAddr) -> Option<Bytes> {
    Some(match addr {
        std::net::IpAddr::V4(v4) => Bytes::copy_from_slice(&v4.octets()),
        std::net::IpAddr::V6(v6) => Bytes::copy_from_slice(&v6.octets()),
    })
}

fn uuid_cell(id: uuid::Uuid) -> Option<Bytes> {
    Some(Bytes::copy_from_slice(id.as_bytes()))
}

fn set_text_cell(items: &[&str], version: ProtocolVersion) -> Option<Bytes> {
    let mut out = BytesMut::new();
    if version.uses_int_collection_len() {
        out.put_i32(items.len() as i32);
        for item in items {
            out.put_i32(item.len() as i32);
            out.put_slice(item.as_bytes());
        }
    } else {
        out.put_u16(items.len() as u16);
        for item in items {
            out.put_u16(item.len() as u16);
            out.put_slice(item.as_bytes());
        }
    }
    Some(out.freeze())
}

fn rows(columns: Vec<ColumnSpec>, rows: Vec<Vec<Option<Bytes>>>) -> Response {
    Response::Result(ResultBody::Rows(RowsResult {
        metadata: RowsMetadata {
            columns,
            paging_state: None,
            no_metadata: false,
        },
        rows,
    }))
}

fn catalog_response(
    state: &Arc<NodeState>,
    version: ProtocolVersion,
    query: &str,
) -> Option<Response> {
    if query.contains("schema_version") {
        return Some(rows(
            vec![column("schema_version", CqlType::Uuid)],
            vec![vec![uuid_cell(uuid::Uuid::new_v4())]],
        ));
    }
    if query.contains("system.local") {
        return Some(rows(
            vec![
                column("data_center", CqlType::Varchar),
                column("rack", CqlType::Varchar),
                column("release_version", CqlType::Varchar),
                column("tokens", CqlType::set(CqlType::Varchar)),
                column("broadcast_address", CqlType::Inet),
            ],
            vec![vec![
                text_cell("dc1"),
                text_cell("r1"),
                text_cell("3.11.4"),
                set_text_cell(&["0"], version),
                inet_cell(state.addr.ip()),
            ]],
        ));
    }
    if query.contains("system.peers") {
        // Single-node view; multi-node tests list every node as a contact
        // point instead (the catalog cannot carry per-peer ports).
        return Some(rows(
            vec![
                column("peer", CqlType::Inet),
                column("rpc_address", CqlType::Inet),
                column("data_center", CqlType::Varchar),
                column("rack", CqlType::Varchar),
                column("release_version", CqlType::Varchar),
                column("tokens", CqlType::set(CqlType::Varchar)),
            ],
            Vec::new(),
        ));
    }
    if query.contains("keyspaces") {
        return Some(rows(
            vec![ColumnSpec {
                keyspace: "system_schema".into(),
                table: "keyspaces".into(),
                name: "keyspace_name".into(),
                ty: CqlType::Varchar,
            }],
            vec![
                vec![text_cell("system")],
                vec![text_cell("system_schema")],
            ],
        ));
    }
    None
}

/// Load-balancing policy with a fixed host order, for deterministic plans.
pub struct FixedOrderPolicy {
    pub order: Vec<SocketAddr>,
}

impl basalt_driver::policies::LoadBalancingPolicy for FixedOrderPolicy {
    fn distance(&self, _host: &basalt_driver::Host) -> basalt_driver::policies::HostDistance {
        basalt_driver::policies::HostDistance::Local
    }

    fn query_plan(
        &self,
        metadata: &basalt_driver::Metadata,
    ) -> Box<dyn Iterator<Item = Arc<basalt_driver::Host>> + Send> {
        let hosts: Vec<_> = self
            .order
            .iter()
            .filter_map(|address| metadata.get_host(*address))
            .collect();
        Box::new(hosts.into_iter())
    }
}

/// Wait until `condition` holds or the timeout elapses; panics on timeout.
pub async fn wait_for(what: &str, timeout: Duration, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
