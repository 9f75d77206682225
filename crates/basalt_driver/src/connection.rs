//! A single multiplexed connection to one node.
//!
//! One task owns both halves of the framed TCP stream plus the heartbeat
//! timer; requests are multiplexed over stream ids allocated from an atomic
//! bitset, and each in-flight request parks a oneshot completion sink keyed
//! by its stream id. When the connection dies, every pending sink is
//! completed with the same connection error so callers can fail over.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use basalt_proto::frame::{ClientCodec, Compression, Frame};
use basalt_proto::messages::{Request, Response};
use basalt_proto::{event::ProtocolEvent, Opcode, ProtocolVersion};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::errors::{AttemptError, ConnectionError, ExecutionError, ServerException};
use crate::policies::AuthProvider;

/// Lifecycle of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ConnectionState {
    Open = 0,
    /// Out of the pool rotation; drains in-flight requests, then closes.
    Trashed = 1,
    Closed = 2,
}

/// Atomic bitset of free stream ids.
///
/// Acquire flips a zero bit with compare-and-swap; release clears it. Ids are
/// bounded by the protocol version's stream space and the per-connection
/// request limit.
pub(crate) struct StreamIdSet {
    words: Vec<AtomicU64>,
    capacity: usize,
}

impl StreamIdSet {
    pub(crate) fn new(capacity: usize) -> StreamIdSet {
        let words = (0..capacity.div_ceil(64)).map(|_| AtomicU64::new(0)).collect();
        StreamIdSet { words, capacity }
    }

    pub(crate) fn acquire(&self) -> Option<i16> {
        for (word_index, word) in self.words.iter().enumerate() {
            loop {
                let current = word.load(Ordering::Acquire);
                let free = !current;
                if free == 0 {
                    break;
                }
                let bit = free.trailing_zeros() as usize;
                let id = word_index * 64 + bit;
                if id >= self.capacity {
                    break;
                }
                if word
                    .compare_exchange_weak(
                        current,
                        current | (1 << bit),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return Some(id as i16);
                }
            }
        }
        None
    }

    pub(crate) fn release(&self, id: i16) {
        let id = id as usize;
        let word = &self.words[id / 64];
        word.fetch_and(!(1 << (id % 64)), Ordering::AcqRel);
    }

    pub(crate) fn allocated(&self) -> usize {
        self.words
            .iter()
            .map(|word| word.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }
}

type ResponseSink = oneshot::Sender<Result<Frame, ConnectionError>>;

/// An in-flight request; await [`PendingRequest::response`] for its reply.
/// Dropping it orphans the stream id, which the reader reclaims when the
/// response eventually arrives.
pub(crate) struct PendingRequest {
    connection: Arc<Connection>,
    completion: oneshot::Receiver<Result<Frame, ConnectionError>>,
}

impl PendingRequest {
    pub(crate) async fn response(self) -> Result<Response, AttemptError> {
        let frame = self
            .completion
            .await
            .map_err(|_| ConnectionError::Closed {
                address: self.connection.address,
            })?
            .map_err(AttemptError::Connection)?;
        self.connection.parse_completed(frame)
    }
}

/// Guard for the pool's borrow reservation; converts over-subscription races
/// into a simple re-check after increment.
pub(crate) struct Reservation {
    connection: Arc<Connection>,
}

impl Reservation {
    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.connection.reservations.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) struct Connection {
    address: SocketAddr,
    version: ProtocolVersion,
    state: AtomicU8,
    streams: StreamIdSet,
    pending: Mutex<HashMap<i16, ResponseSink>>,
    in_flight: AtomicUsize,
    reservations: AtomicUsize,
    write_tx: mpsc::UnboundedSender<Frame>,
    /// Shared with the owning pool; pinged whenever capacity frees up.
    released: Arc<Notify>,
    shutdown: Notify,
    /// Monotonic insertion order in its pool; borrow tie-breaker.
    pub(crate) sequence: usize,
}

impl Connection {
    pub(crate) fn address(&self) -> SocketAddr {
        self.address
    }

    pub(crate) fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub(crate) fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            0 => ConnectionState::Open,
            1 => ConnectionState::Trashed,
            _ => ConnectionState::Closed,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn allocated_stream_ids(&self) -> usize {
        self.streams.allocated()
    }

    /// In-flight plus reserved-but-not-yet-written requests.
    pub(crate) fn load(&self) -> usize {
        self.in_flight.load(Ordering::Acquire) + self.reservations.load(Ordering::Acquire)
    }

    pub(crate) fn reserve(self: &Arc<Self>) -> Reservation {
        self.reservations.fetch_add(1, Ordering::AcqRel);
        Reservation {
            connection: self.clone(),
        }
    }

    /// Remove from rotation; the pool closes it once it drains.
    pub(crate) fn mark_trashed(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::Open as u8,
            ConnectionState::Trashed as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn close(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        self.shutdown.notify_waiters();
    }

    /// Allocate a stream id and hand the frame to the writer. Synchronous on
    /// purpose: a pool borrow reservation covers exactly the window between
    /// connection selection and this allocation.
    ///
    /// The stream id stays allocated until the response (or the connection
    /// error) arrives, even if the caller stops waiting; the reader reclaims
    /// it exactly once.
    pub(crate) fn start_request(
        self: &Arc<Self>,
        request: &Request,
    ) -> Result<PendingRequest, AttemptError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed {
                address: self.address,
            }
            .into());
        }
        let body = request
            .serialize_body(self.version)
            .map_err(|err| ConnectionError::Wire {
                address: self.address,
                detail: err.to_string(),
            })?;

        let stream = self.streams.acquire().ok_or(AttemptError::BusyConnection {
            address: self.address,
        })?;
        let (sink, completion) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map lock")
            .insert(stream, sink);
        self.in_flight.fetch_add(1, Ordering::AcqRel);

        let frame = Frame::request(self.version, stream, request.opcode(), body);
        if self.write_tx.send(frame).is_err() {
            // Writer already gone; reclaim here since no response will.
            self.reclaim(stream);
            return Err(ConnectionError::Closed {
                address: self.address,
            }
            .into());
        }
        trace!(addr = %self.address, stream, opcode = ?request.opcode(), "request written");
        Ok(PendingRequest {
            connection: self.clone(),
            completion,
        })
    }

    /// Write one request and await its response.
    pub(crate) async fn send_request(
        self: &Arc<Self>,
        request: &Request,
    ) -> Result<Response, AttemptError> {
        self.start_request(request)?.response().await
    }

    fn parse_completed(&self, frame: Frame) -> Result<Response, AttemptError> {
        let mut body = frame.body;
        let response = Response::parse(frame.opcode, &mut body, self.version).map_err(|err| {
            ConnectionError::Wire {
                address: self.address,
                detail: err.to_string(),
            }
        })?;
        if let Response::Error(error) = response {
            return Err(AttemptError::Server(ServerException {
                address: self.address,
                code: error.code,
                message: error.message,
                details: error.details,
            }));
        }
        Ok(response)
    }

    /// Free a stream id and its in-flight slot. Exactly one caller does this
    /// per allocation: the reader on response arrival, or the sender when the
    /// frame never reached the writer.
    fn reclaim(&self, stream: i16) {
        self.pending.lock().expect("pending map lock").remove(&stream);
        self.streams.release(stream);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.released.notify_waiters();
    }

    /// Complete every pending request with the given error and reset the
    /// stream space.
    fn teardown(&self, error: &ConnectionError) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        let pending: Vec<(i16, ResponseSink)> = {
            let mut map = self.pending.lock().expect("pending map lock");
            map.drain().collect()
        };
        for (stream, sink) in pending {
            self.streams.release(stream);
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            let _ = sink.send(Err(error.clone()));
        }
        self.released.notify_waiters();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Everything needed to open one connection.
#[derive(Clone)]
pub(crate) struct ConnectOptions {
    pub(crate) version: ProtocolVersion,
    pub(crate) compression: Compression,
    pub(crate) connect_timeout: Duration,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) max_requests: usize,
    pub(crate) auth_provider: Option<Arc<dyn AuthProvider>>,
    /// Where server-push event frames are routed; only the control
    /// connection registers for them.
    pub(crate) event_tx: Option<mpsc::Sender<ProtocolEvent>>,
}

/// Open a TCP connection and run the handshake at exactly the given version.
///
/// Fails with [`ExecutionError::InvalidProtocolVersion`] when the server
/// rejects the version, so the caller can downgrade and retry.
pub(crate) async fn open(
    address: SocketAddr,
    options: &ConnectOptions,
    sequence: usize,
    released: Arc<Notify>,
) -> Result<Arc<Connection>, ExecutionError> {
    let tcp = tokio::time::timeout(options.connect_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| ConnectionError::ConnectFailed {
            address,
            detail: format!("connect timed out after {:?}", options.connect_timeout),
        })?
        .map_err(|err| ConnectionError::ConnectFailed {
            address,
            detail: err.to_string(),
        })?;
    tcp.set_nodelay(true).map_err(|err| ConnectionError::ConnectFailed {
        address,
        detail: err.to_string(),
    })?;

    let mut framed = Framed::new(tcp, ClientCodec::new(options.version, options.compression));
    handshake(&mut framed, address, options).await?;

    let (write_tx, write_rx) = mpsc::unbounded_channel();
    let capacity = options.max_requests.min(options.version.max_streams());
    let connection = Arc::new(Connection {
        address,
        version: options.version,
        state: AtomicU8::new(ConnectionState::Open as u8),
        streams: StreamIdSet::new(capacity),
        pending: Mutex::new(HashMap::new()),
        in_flight: AtomicUsize::new(0),
        reservations: AtomicUsize::new(0),
        write_tx,
        released,
        shutdown: Notify::new(),
        sequence,
    });

    let (sink, stream) = framed.split();
    tokio::spawn(router(
        connection.clone(),
        sink,
        stream,
        write_rx,
        options.heartbeat_interval,
        options.event_tx.clone(),
    ));
    Ok(connection)
}

/// STARTUP and the optional authentication exchange.
async fn handshake(
    framed: &mut Framed<TcpStream, ClientCodec>,
    address: SocketAddr,
    options: &ConnectOptions,
) -> Result<(), ExecutionError> {
    let startup = Request::Startup {
        cql_version: "3.0.0".to_string(),
        compression: options
            .compression
            .startup_option()
            .map(str::to_string),
    };
    let mut response = roundtrip(framed, address, options.version, &startup).await?;

    if let Response::Authenticate { authenticator } = &response {
        let provider =
            options
                .auth_provider
                .as_ref()
                .ok_or_else(|| ExecutionError::Authentication {
                    address,
                    message: format!(
                        "server requires authentication ({authenticator}) but no auth provider is configured"
                    ),
                })?;
        let auth = provider.new_authenticator(address, authenticator);
        let mut token = auth.initial_response();
        loop {
            let request = Request::AuthResponse {
                token: token.take().map(Into::into),
            };
            response = roundtrip(framed, address, options.version, &request).await?;
            match &response {
                Response::AuthChallenge { token: challenge } => {
                    token = auth
                        .evaluate_challenge(challenge.as_deref())
                        .map_err(|message| ExecutionError::Authentication { address, message })?;
                }
                Response::AuthSuccess { token: final_token } => {
                    auth.on_success(final_token.as_deref());
                    return Ok(());
                }
                _ => break,
            }
        }
    }

    match response {
        Response::Ready => Ok(()),
        Response::Error(error)
            if error.code == basalt_proto::messages::ErrorCode::ProtocolError =>
        {
            Err(ExecutionError::InvalidProtocolVersion {
                address,
                detail: error.message,
            })
        }
        Response::Error(error)
            if error.code == basalt_proto::messages::ErrorCode::AuthenticationError =>
        {
            Err(ExecutionError::Authentication {
                address,
                message: error.message,
            })
        }
        other => Err(ConnectionError::Wire {
            address,
            detail: format!("unexpected handshake response {:?}", other.opcode()),
        }
        .into()),
    }
}

async fn roundtrip(
    framed: &mut Framed<TcpStream, ClientCodec>,
    address: SocketAddr,
    version: ProtocolVersion,
    request: &Request,
) -> Result<Response, ExecutionError> {
    let body = request
        .serialize_body(version)
        .map_err(|err| ConnectionError::Wire {
            address,
            detail: err.to_string(),
        })?;
    framed
        .send(Frame::request(version, 0, request.opcode(), body))
        .await
        .map_err(|err| ConnectionError::Io {
            address,
            detail: err.to_string(),
        })?;
    let frame = framed
        .next()
        .await
        .ok_or(ConnectionError::Closed { address })?
        .map_err(|err| ConnectionError::Io {
            address,
            detail: err.to_string(),
        })?;
    let mut body = frame.body;
    Response::parse(frame.opcode, &mut body, version).map_err(|err| {
        ConnectionError::Wire {
            address,
            detail: err.to_string(),
        }
        .into()
    })
}

type FrameSink = SplitSink<Framed<TcpStream, ClientCodec>, Frame>;
type FrameStream = SplitStream<Framed<TcpStream, ClientCodec>>;

/// Drives reads, writes and heartbeats for one connection, then tears it
/// down with the first error observed.
async fn router(
    connection: Arc<Connection>,
    sink: FrameSink,
    stream: FrameStream,
    write_rx: mpsc::UnboundedReceiver<Frame>,
    heartbeat_interval: Duration,
    event_tx: Option<mpsc::Sender<ProtocolEvent>>,
) {
    let last_write = Arc::new(Mutex::new(Instant::now()));

    let read_loop = reader(&connection, stream, event_tx);
    let write_loop = writer(connection.address, sink, write_rx, last_write.clone());
    let heartbeat_loop = heartbeat(&connection, heartbeat_interval, last_write.clone());

    let error = tokio::select! {
        result = read_loop => result.err(),
        result = write_loop => result.err(),
        result = heartbeat_loop => result.err(),
        _ = connection.shutdown.notified() => None,
    };

    let error = error.unwrap_or(ConnectionError::Closed {
        address: connection.address,
    });
    debug!(addr = %connection.address, error = %error, "connection terminated");
    connection.teardown(&error);
}

async fn reader(
    connection: &Arc<Connection>,
    mut stream: FrameStream,
    event_tx: Option<mpsc::Sender<ProtocolEvent>>,
) -> Result<(), ConnectionError> {
    let address = connection.address;
    loop {
        let frame = stream
            .next()
            .await
            .ok_or(ConnectionError::Closed { address })?
            .map_err(|err| ConnectionError::Io {
                address,
                detail: err.to_string(),
            })?;

        if connection.version.is_event_stream(frame.stream) {
            if frame.opcode == Opcode::Event {
                let mut body = frame.body;
                match ProtocolEvent::parse(&mut body, connection.version) {
                    Ok(event) => {
                        if let Some(tx) = &event_tx {
                            let _ = tx.send(event).await;
                        }
                    }
                    Err(err) => {
                        warn!(addr = %address, error = %err, "dropping undecodable event frame")
                    }
                }
            }
            continue;
        }
        if frame.stream < 0 {
            // v3/v4 reserve the negative space; only -1 is ever used.
            continue;
        }

        let sink = connection
            .pending
            .lock()
            .expect("pending map lock")
            .remove(&frame.stream);
        match sink {
            Some(sink) => {
                connection.streams.release(frame.stream);
                connection.in_flight.fetch_sub(1, Ordering::AcqRel);
                connection.released.notify_waiters();
                // A dropped receiver means the request was cancelled or timed
                // out; the response is discarded without user callbacks.
                let _ = sink.send(Ok(frame));
            }
            None => {
                warn!(addr = %address, stream = frame.stream, "response for unknown stream id");
            }
        }
    }
}

async fn writer(
    address: SocketAddr,
    mut sink: FrameSink,
    mut write_rx: mpsc::UnboundedReceiver<Frame>,
    last_write: Arc<Mutex<Instant>>,
) -> Result<(), ConnectionError> {
    while let Some(frame) = write_rx.recv().await {
        let mut pending = Some(frame);
        // Coalesce queued frames into one flush.
        while let Some(frame) = pending.take() {
            sink.feed(frame).await.map_err(|err| ConnectionError::Io {
                address,
                detail: err.to_string(),
            })?;
            pending = write_rx.try_recv().ok();
        }
        sink.flush().await.map_err(|err| ConnectionError::Io {
            address,
            detail: err.to_string(),
        })?;
        *last_write.lock().expect("last write lock") = Instant::now();
    }
    // All senders dropped: the connection handle is gone.
    Ok(())
}

/// Send an OPTIONS probe when the connection has been idle for the
/// configured interval; any failure kills the connection.
async fn heartbeat(
    connection: &Arc<Connection>,
    interval: Duration,
    last_write: Arc<Mutex<Instant>>,
) -> Result<(), ConnectionError> {
    if interval.is_zero() {
        return std::future::pending().await;
    }
    let address = connection.address;
    loop {
        let idle_for = last_write.lock().expect("last write lock").elapsed();
        if idle_for < interval {
            tokio::time::sleep(interval - idle_for).await;
            continue;
        }
        let probe = tokio::time::timeout(
            interval.min(Duration::from_secs(10)),
            connection.send_request(&Request::Options),
        )
        .await;
        match probe {
            Ok(Ok(Response::Supported { .. })) => {}
            Ok(Ok(other)) => {
                warn!(addr = %address, opcode = ?other.opcode(), "unexpected heartbeat response");
                return Err(ConnectionError::HeartbeatFailed { address });
            }
            Ok(Err(_)) | Err(_) => return Err(ConnectionError::HeartbeatFailed { address }),
        }
        tokio::time::sleep(interval).await;
    }
}

/// Open a connection, negotiating the protocol version downward on
/// `ProtocolError` until the server accepts one. Downgrading below v1 fails.
pub(crate) async fn open_negotiated(
    address: SocketAddr,
    options: &ConnectOptions,
    sequence: usize,
    released: Arc<Notify>,
) -> Result<Arc<Connection>, ExecutionError> {
    let mut options = options.clone();
    loop {
        match open(address, &options, sequence, released.clone()).await {
            Ok(connection) => return Ok(connection),
            Err(ExecutionError::InvalidProtocolVersion { address, detail }) => {
                match options.version.downgrade() {
                    Some(lower) => {
                        debug!(addr = %address, from = %options.version, to = %lower,
                            "protocol version rejected, downgrading");
                        options.version = lower;
                    }
                    None => {
                        return Err(ExecutionError::InvalidProtocolVersion { address, detail })
                    }
                }
            }
            Err(other) => return Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_ids_are_unique_until_released() {
        let set = StreamIdSet::new(128);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..128 {
            let id = set.acquire().expect("free id");
            assert!(seen.insert(id));
        }
        assert_eq!(set.acquire(), None);
        assert_eq!(set.allocated(), 128);

        set.release(64);
        assert_eq!(set.allocated(), 127);
        assert_eq!(set.acquire(), Some(64));
    }

    #[test]
    fn stream_id_capacity_is_not_word_rounded() {
        let set = StreamIdSet::new(100);
        for _ in 0..100 {
            set.acquire().expect("free id");
        }
        assert_eq!(set.acquire(), None);
    }

    #[test]
    fn allocated_matches_popcount_under_churn() {
        let set = Arc::new(StreamIdSet::new(256));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let set = set.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    if let Some(id) = set.acquire() {
                        set.release(id);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(set.allocated(), 0);
    }
}
