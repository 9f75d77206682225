//! The user-facing query surface.
//!
//! A `Session` is a cheap handle onto the shared cluster runtime. Statements
//! carry their execution options; results come back as decoded rows. The
//! blocking wrappers are thin shims over the async path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use basalt_proto::messages::{
    BatchStatement, BatchType, ColumnSpec, QueryParameters, Request, RowsResult,
};
use basalt_proto::{Consistency, ProtocolVersion};
use bytes::Bytes;

use crate::codec::{CodecRegistry, CqlValue};
use crate::errors::ExecutionError;
use crate::handler;
use crate::ClusterInner;

/// A CQL statement with its per-execution options.
#[derive(Clone, Debug)]
pub struct Statement {
    pub query: String,
    pub values: Vec<CqlValue>,
    pub consistency: Option<Consistency>,
    pub serial_consistency: Option<Consistency>,
    pub page_size: Option<i32>,
    pub paging_state: Option<Bytes>,
    /// Required for speculative executions: the driver only launches
    /// redundant attempts for statements marked idempotent.
    pub idempotent: bool,
}

impl Statement {
    pub fn new(query: impl Into<String>) -> Statement {
        Statement {
            query: query.into(),
            values: Vec::new(),
            consistency: None,
            serial_consistency: None,
            page_size: None,
            paging_state: None,
            idempotent: false,
        }
    }

    pub fn with_values(mut self, values: Vec<CqlValue>) -> Statement {
        self.values = values;
        self
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Statement {
        self.consistency = Some(consistency);
        self
    }

    pub fn with_page_size(mut self, page_size: i32) -> Statement {
        self.page_size = Some(page_size);
        self
    }

    pub fn idempotent(mut self) -> Statement {
        self.idempotent = true;
        self
    }
}

/// A statement prepared against the cluster.
///
/// The id is what the server keyed its prepared cache with; when a node
/// answers `Unprepared`, the request handler re-prepares there transparently
/// using [`PreparedStatement::query`].
#[derive(Debug)]
pub struct PreparedStatement {
    pub(crate) id: Bytes,
    pub query: String,
    pub bind_variables: Vec<ColumnSpec>,
    pub result_columns: Vec<ColumnSpec>,
    pub idempotent: AtomicBool,
}

impl PreparedStatement {
    pub fn id(&self) -> &Bytes {
        &self.id
    }

    pub fn set_idempotent(&self, idempotent: bool) {
        self.idempotent.store(idempotent, Ordering::Release);
    }
}

/// One decoded row.
#[derive(Clone, Debug)]
pub struct Row {
    columns: Arc<Vec<ColumnSpec>>,
    pub values: Vec<Option<CqlValue>>,
}

impl Row {
    pub fn get(&self, index: usize) -> Option<&CqlValue> {
        self.values.get(index).and_then(Option::as_ref)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&CqlValue> {
        let index = self.columns.iter().position(|column| column.name == name)?;
        self.get(index)
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }
}

/// Decoded result of one statement.
#[derive(Clone, Debug, Default)]
pub struct ResultSet {
    pub(crate) columns: Arc<Vec<ColumnSpec>>,
    pub rows: Vec<Row>,
    pub paging_state: Option<Bytes>,
}

impl ResultSet {
    pub(crate) fn empty() -> ResultSet {
        ResultSet::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn one(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Decode raw cells through the registry, column by column.
    pub(crate) fn decode(
        registry: &CodecRegistry,
        version: ProtocolVersion,
        raw: RowsResult,
    ) -> Result<ResultSet, ExecutionError> {
        let columns = Arc::new(raw.metadata.columns);
        let mut codecs = Vec::with_capacity(columns.len());
        for column in columns.iter() {
            codecs.push(registry.codec_for(&column.ty)?);
        }
        let mut rows = Vec::with_capacity(raw.rows.len());
        for raw_row in raw.rows {
            let mut values = Vec::with_capacity(raw_row.len());
            for (cell, codec) in raw_row.into_iter().zip(&codecs) {
                values.push(match cell {
                    Some(bytes) => Some(codec.deserialize(&bytes, version)?),
                    None => None,
                });
            }
            rows.push(Row {
                columns: columns.clone(),
                values,
            });
        }
        Ok(ResultSet {
            columns,
            rows,
            paging_state: raw.metadata.paging_state,
        })
    }
}

/// Cooperative cancellation for a single execution.
///
/// Once a terminal response has been committed to the caller, cancelling is a
/// no-op; if cancellation wins the race, the response is dropped on arrival
/// and the stream id reclaimed without user callbacks.
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Cancellation {
        Cancellation::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Handle for executing statements against the cluster.
#[derive(Clone)]
pub struct Session {
    inner: Arc<ClusterInner>,
    prepared: Arc<RwLock<HashMap<String, Arc<PreparedStatement>>>>,
}

impl Session {
    pub(crate) fn new(inner: Arc<ClusterInner>) -> Session {
        Session {
            inner,
            prepared: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Execute a statement asynchronously.
    pub async fn execute(&self, statement: &Statement) -> Result<ResultSet, ExecutionError> {
        self.execute_with_cancellation(statement, &Cancellation::new())
            .await
    }

    pub async fn execute_with_cancellation(
        &self,
        statement: &Statement,
        cancellation: &Cancellation,
    ) -> Result<ResultSet, ExecutionError> {
        let values = self.serialize_values(&statement.values, None)?;
        let payload = handler::Payload::Query {
            query: statement.query.clone(),
            params: self.parameters(
                statement.consistency,
                statement.serial_consistency,
                statement.page_size,
                statement.paging_state.clone(),
                values,
            ),
        };
        handler::execute(&self.inner, payload, statement.idempotent, cancellation).await
    }

    /// Prepare a statement, caching it by query string within this session.
    pub async fn prepare(&self, query: &str) -> Result<Arc<PreparedStatement>, ExecutionError> {
        if let Some(prepared) = self.prepared.read().expect("prepared cache lock").get(query) {
            return Ok(prepared.clone());
        }
        let prepared = Arc::new(
            handler::prepare(&self.inner, query, &Cancellation::new()).await?,
        );
        self.prepared
            .write()
            .expect("prepared cache lock")
            .insert(query.to_string(), prepared.clone());
        Ok(prepared)
    }

    /// Execute a previously prepared statement.
    pub async fn execute_prepared(
        &self,
        prepared: &Arc<PreparedStatement>,
        values: Vec<CqlValue>,
        consistency: Option<Consistency>,
    ) -> Result<ResultSet, ExecutionError> {
        let values = self.serialize_values(&values, Some(&prepared.bind_variables))?;
        let payload = handler::Payload::Execute {
            prepared: prepared.clone(),
            params: self.parameters(consistency, None, None, None, values),
        };
        let idempotent = prepared.idempotent.load(Ordering::Acquire);
        handler::execute(&self.inner, payload, idempotent, &Cancellation::new()).await
    }

    /// Execute a batch of simple statements.
    pub async fn batch(
        &self,
        statements: Vec<Statement>,
        batch_type: BatchType,
        consistency: Option<Consistency>,
    ) -> Result<ResultSet, ExecutionError> {
        let mut wire_statements = Vec::with_capacity(statements.len());
        for statement in statements {
            let values = self.serialize_values(&statement.values, None)?;
            wire_statements.push(BatchStatement::Query {
                query: statement.query,
                values,
            });
        }
        let payload = handler::Payload::Batch {
            batch_type,
            statements: wire_statements,
            consistency: consistency.unwrap_or(self.inner.config.query.consistency),
        };
        handler::execute(&self.inner, payload, false, &Cancellation::new()).await
    }

    /// Blocking wrapper over [`Session::execute`]; must be called from
    /// outside the driver's async runtime.
    pub fn execute_blocking(&self, statement: &Statement) -> Result<ResultSet, ExecutionError> {
        let session = self.clone();
        let statement = statement.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        self.inner.runtime.spawn(async move {
            let _ = tx.send(session.execute(&statement).await);
        });
        rx.recv().unwrap_or(Err(ExecutionError::Shutdown))
    }

    fn parameters(
        &self,
        consistency: Option<Consistency>,
        serial_consistency: Option<Consistency>,
        page_size: Option<i32>,
        paging_state: Option<Bytes>,
        values: Vec<Option<Bytes>>,
    ) -> QueryParameters {
        QueryParameters {
            consistency: Some(consistency.unwrap_or(self.inner.config.query.consistency)),
            values,
            skip_metadata: false,
            page_size: page_size.or(Some(self.inner.config.query.page_size)),
            paging_state,
            serial_consistency,
            default_timestamp: None,
        }
    }

    /// Serialize bind values through the codec registry: against declared
    /// bind-variable types when prepared metadata is available, by runtime
    /// shape otherwise.
    fn serialize_values(
        &self,
        values: &[CqlValue],
        bind_variables: Option<&[ColumnSpec]>,
    ) -> Result<Vec<Option<Bytes>>, ExecutionError> {
        let version = self.inner.version();
        let registry = &self.inner.registry;
        let mut out = Vec::with_capacity(values.len());
        for (index, value) in values.iter().enumerate() {
            let codec = match bind_variables.and_then(|columns| columns.get(index)) {
                Some(column) => registry.codec_for_cql_value(&column.ty, value)?,
                None => registry.codec_for_value(value)?,
            };
            out.push(Some(codec.serialize(value, version)?));
        }
        Ok(out)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("hosts", &self.inner.metadata.all_hosts().len())
            .finish()
    }
}

/// Build the wire request for a payload; shared with the request handler.
pub(crate) fn request_for(payload: &handler::Payload) -> Request {
    match payload {
        handler::Payload::Query { query, params } => Request::Query {
            query: query.clone(),
            params: params.clone(),
        },
        handler::Payload::Execute { prepared, params } => Request::Execute {
            id: prepared.id.clone(),
            params: params.clone(),
        },
        handler::Payload::Batch {
            batch_type,
            statements,
            consistency,
        } => Request::Batch {
            batch_type: *batch_type,
            statements: statements.clone(),
            consistency: *consistency,
        },
    }
}
