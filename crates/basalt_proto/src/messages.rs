//! Request and response message bodies.
//!
//! Requests know how to serialize themselves for a given protocol version;
//! responses are parsed from `(opcode, body)` pairs. The server error table
//! lives here too, since it is part of the response surface.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::event::{parse_schema_change, write_schema_change, ProtocolEvent, SchemaChange};
use crate::types::{
    read_bytes, read_int, read_short, read_short_bytes, read_string, read_string_list,
    read_string_multimap, write_bytes, write_long, write_long_string, write_short,
    write_short_bytes, write_string, write_string_list, write_string_map, write_string_multimap,
    CqlType,
};
use crate::{Consistency, Opcode, ProtoError, ProtocolVersion};

const QUERY_FLAG_VALUES: u8 = 0x01;
const QUERY_FLAG_SKIP_METADATA: u8 = 0x02;
const QUERY_FLAG_PAGE_SIZE: u8 = 0x04;
const QUERY_FLAG_PAGING_STATE: u8 = 0x08;
const QUERY_FLAG_SERIAL_CONSISTENCY: u8 = 0x10;
const QUERY_FLAG_DEFAULT_TIMESTAMP: u8 = 0x20;

const ROWS_FLAG_GLOBAL_TABLES_SPEC: i32 = 0x01;
const ROWS_FLAG_HAS_MORE_PAGES: i32 = 0x02;
const ROWS_FLAG_NO_METADATA: i32 = 0x04;

/// Parameters attached to QUERY and EXECUTE requests.
#[derive(Clone, Debug, Default)]
pub struct QueryParameters {
    pub consistency: Option<Consistency>,
    pub values: Vec<Option<Bytes>>,
    pub skip_metadata: bool,
    pub page_size: Option<i32>,
    pub paging_state: Option<Bytes>,
    pub serial_consistency: Option<Consistency>,
    pub default_timestamp: Option<i64>,
}

impl QueryParameters {
    fn consistency(&self) -> Consistency {
        self.consistency.unwrap_or(Consistency::One)
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if !self.values.is_empty() {
            flags |= QUERY_FLAG_VALUES;
        }
        if self.skip_metadata {
            flags |= QUERY_FLAG_SKIP_METADATA;
        }
        if self.page_size.is_some() {
            flags |= QUERY_FLAG_PAGE_SIZE;
        }
        if self.paging_state.is_some() {
            flags |= QUERY_FLAG_PAGING_STATE;
        }
        if self.serial_consistency.is_some() {
            flags |= QUERY_FLAG_SERIAL_CONSISTENCY;
        }
        if self.default_timestamp.is_some() {
            flags |= QUERY_FLAG_DEFAULT_TIMESTAMP;
        }
        flags
    }

    /// v2+ layout: consistency, flags, then flag-gated sections in order.
    fn write(&self, buf: &mut BytesMut, version: ProtocolVersion) -> Result<(), ProtoError> {
        write_short(buf, self.consistency().as_short());
        let mut flags = self.flags();
        if version < ProtocolVersion::V3 {
            // v2 has no timestamp section.
            flags &= !QUERY_FLAG_DEFAULT_TIMESTAMP;
        }
        buf.put_u8(flags);
        if flags & QUERY_FLAG_VALUES != 0 {
            write_short(buf, self.values.len() as u16);
            for value in &self.values {
                write_bytes(buf, value.as_deref());
            }
        }
        if flags & QUERY_FLAG_PAGE_SIZE != 0 {
            buf.put_i32(self.page_size.unwrap_or(0));
        }
        if flags & QUERY_FLAG_PAGING_STATE != 0 {
            write_bytes(buf, self.paging_state.as_deref());
        }
        if flags & QUERY_FLAG_SERIAL_CONSISTENCY != 0 {
            write_short(
                buf,
                self.serial_consistency.unwrap_or(Consistency::Serial).as_short(),
            );
        }
        if flags & QUERY_FLAG_DEFAULT_TIMESTAMP != 0 {
            write_long(buf, self.default_timestamp.unwrap_or(0));
        }
        Ok(())
    }
}

/// Statement kinds allowed in a BATCH.
#[derive(Clone, Debug)]
pub enum BatchStatement {
    Query {
        query: String,
        values: Vec<Option<Bytes>>,
    },
    Prepared {
        id: Bytes,
        values: Vec<Option<Bytes>>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BatchType {
    Logged = 0,
    Unlogged = 1,
    Counter = 2,
}

/// A request body ready for framing.
#[derive(Clone, Debug)]
pub enum Request {
    Startup {
        cql_version: String,
        compression: Option<String>,
    },
    Options,
    Query {
        query: String,
        params: QueryParameters,
    },
    Prepare {
        query: String,
    },
    Execute {
        id: Bytes,
        params: QueryParameters,
    },
    Batch {
        batch_type: BatchType,
        statements: Vec<BatchStatement>,
        consistency: Consistency,
    },
    Register {
        events: Vec<crate::event::EventClass>,
    },
    AuthResponse {
        token: Option<Bytes>,
    },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Startup { .. } => Opcode::Startup,
            Request::Options => Opcode::Options,
            Request::Query { .. } => Opcode::Query,
            Request::Prepare { .. } => Opcode::Prepare,
            Request::Execute { .. } => Opcode::Execute,
            Request::Batch { .. } => Opcode::Batch,
            Request::Register { .. } => Opcode::Register,
            Request::AuthResponse { .. } => Opcode::AuthResponse,
        }
    }

    pub fn serialize_body(&self, version: ProtocolVersion) -> Result<Bytes, ProtoError> {
        let mut buf = BytesMut::new();
        match self {
            Request::Startup {
                cql_version,
                compression,
            } => {
                let mut options = vec![("CQL_VERSION".to_string(), cql_version.clone())];
                if let Some(algorithm) = compression {
                    options.push(("COMPRESSION".to_string(), algorithm.clone()));
                }
                write_string_map(&mut buf, &options);
            }
            Request::Options => {}
            Request::Query { query, params } => {
                write_long_string(&mut buf, query);
                if version == ProtocolVersion::V1 {
                    if !params.values.is_empty() {
                        return Err(ProtoError::malformed(
                            "QUERY",
                            "bound values require protocol v2 or later",
                        ));
                    }
                    write_short(&mut buf, params.consistency().as_short());
                } else {
                    params.write(&mut buf, version)?;
                }
            }
            Request::Prepare { query } => {
                write_long_string(&mut buf, query);
            }
            Request::Execute { id, params } => {
                write_short_bytes(&mut buf, id);
                if version == ProtocolVersion::V1 {
                    write_short(&mut buf, params.values.len() as u16);
                    for value in &params.values {
                        write_bytes(&mut buf, value.as_deref());
                    }
                    write_short(&mut buf, params.consistency().as_short());
                } else {
                    params.write(&mut buf, version)?;
                }
            }
            Request::Batch {
                batch_type,
                statements,
                consistency,
            } => {
                if version < ProtocolVersion::V2 {
                    return Err(ProtoError::malformed(
                        "BATCH",
                        "batches require protocol v2 or later",
                    ));
                }
                buf.put_u8(*batch_type as u8);
                write_short(&mut buf, statements.len() as u16);
                for statement in statements {
                    match statement {
                        BatchStatement::Query { query, values } => {
                            buf.put_u8(0);
                            write_long_string(&mut buf, query);
                            write_short(&mut buf, values.len() as u16);
                            for value in values {
                                write_bytes(&mut buf, value.as_deref());
                            }
                        }
                        BatchStatement::Prepared { id, values } => {
                            buf.put_u8(1);
                            write_short_bytes(&mut buf, id);
                            write_short(&mut buf, values.len() as u16);
                            for value in values {
                                write_bytes(&mut buf, value.as_deref());
                            }
                        }
                    }
                }
                write_short(&mut buf, consistency.as_short());
                if version >= ProtocolVersion::V3 {
                    // No flag-gated sections used.
                    buf.put_u8(0);
                }
            }
            Request::Register { events } => {
                let names: Vec<String> =
                    events.iter().map(|event| event.name().to_string()).collect();
                write_string_list(&mut buf, &names);
            }
            Request::AuthResponse { token } => {
                write_bytes(&mut buf, token.as_deref());
            }
        }
        Ok(buf.freeze())
    }

    /// Parse a request body; the server half, used by in-process test servers.
    pub fn parse(
        opcode: Opcode,
        body: &mut Bytes,
        version: ProtocolVersion,
    ) -> Result<Self, ProtoError> {
        Ok(match opcode {
            Opcode::Startup => {
                let n = read_short(body)? as usize;
                let mut cql_version = String::new();
                let mut compression = None;
                for _ in 0..n {
                    let key = read_string(body)?;
                    let value = read_string(body)?;
                    match key.as_str() {
                        "CQL_VERSION" => cql_version = value,
                        "COMPRESSION" => compression = Some(value),
                        _ => {}
                    }
                }
                Request::Startup {
                    cql_version,
                    compression,
                }
            }
            Opcode::Options => Request::Options,
            Opcode::Query => {
                let query = crate::types::read_long_string(body)?;
                let params = parse_query_parameters(body, version)?;
                Request::Query { query, params }
            }
            Opcode::Prepare => Request::Prepare {
                query: crate::types::read_long_string(body)?,
            },
            Opcode::Execute => {
                let id = read_short_bytes(body)?;
                let params = if version == ProtocolVersion::V1 {
                    let n = read_short(body)? as usize;
                    let mut values = Vec::with_capacity(n);
                    for _ in 0..n {
                        values.push(read_bytes(body)?);
                    }
                    let consistency = Consistency::from_short(read_short(body)?)?;
                    QueryParameters {
                        consistency: Some(consistency),
                        values,
                        ..QueryParameters::default()
                    }
                } else {
                    parse_query_parameters(body, version)?
                };
                Request::Execute { id, params }
            }
            Opcode::Register => {
                let names = read_string_list(body)?;
                let mut events = Vec::with_capacity(names.len());
                for name in names {
                    events.push(match name.as_str() {
                        "TOPOLOGY_CHANGE" => crate::event::EventClass::TopologyChange,
                        "STATUS_CHANGE" => crate::event::EventClass::StatusChange,
                        "SCHEMA_CHANGE" => crate::event::EventClass::SchemaChange,
                        other => {
                            return Err(ProtoError::UnknownValue {
                                what: "event class",
                                value: other.to_string(),
                            })
                        }
                    });
                }
                Request::Register { events }
            }
            Opcode::Batch => {
                if version < ProtocolVersion::V2 {
                    return Err(ProtoError::malformed(
                        "BATCH",
                        "batches require protocol v2 or later",
                    ));
                }
                let batch_type = match crate::types::read_byte(body)? {
                    0 => BatchType::Logged,
                    1 => BatchType::Unlogged,
                    2 => BatchType::Counter,
                    other => {
                        return Err(ProtoError::UnknownValue {
                            what: "batch type",
                            value: other.to_string(),
                        })
                    }
                };
                fn read_values(body: &mut Bytes) -> Result<Vec<Option<Bytes>>, ProtoError> {
                    let count = read_short(body)? as usize;
                    let mut values = Vec::with_capacity(count);
                    for _ in 0..count {
                        values.push(read_bytes(body)?);
                    }
                    Ok(values)
                }
                let n = read_short(body)? as usize;
                let mut statements = Vec::with_capacity(n);
                for _ in 0..n {
                    let kind = crate::types::read_byte(body)?;
                    match kind {
                        0 => {
                            let query = crate::types::read_long_string(body)?;
                            let values = read_values(body)?;
                            statements.push(BatchStatement::Query { query, values });
                        }
                        1 => {
                            let id = read_short_bytes(body)?;
                            let values = read_values(body)?;
                            statements.push(BatchStatement::Prepared { id, values });
                        }
                        other => {
                            return Err(ProtoError::UnknownValue {
                                what: "batch statement kind",
                                value: other.to_string(),
                            })
                        }
                    }
                }
                let consistency = Consistency::from_short(read_short(body)?)?;
                if version >= ProtocolVersion::V3 && body.has_remaining() {
                    let _flags = crate::types::read_byte(body)?;
                }
                Request::Batch {
                    batch_type,
                    statements,
                    consistency,
                }
            }
            Opcode::AuthResponse => Request::AuthResponse {
                token: read_bytes(body)?,
            },
            other => {
                return Err(ProtoError::malformed(
                    "request",
                    format!("unexpected request opcode {other:?}"),
                ))
            }
        })
    }
}

fn parse_query_parameters(
    body: &mut Bytes,
    version: ProtocolVersion,
) -> Result<QueryParameters, ProtoError> {
    if version == ProtocolVersion::V1 {
        let consistency = Consistency::from_short(read_short(body)?)?;
        return Ok(QueryParameters {
            consistency: Some(consistency),
            ..QueryParameters::default()
        });
    }
    let consistency = Consistency::from_short(read_short(body)?)?;
    let flags = crate::types::read_byte(body)?;
    let mut params = QueryParameters {
        consistency: Some(consistency),
        skip_metadata: flags & QUERY_FLAG_SKIP_METADATA != 0,
        ..QueryParameters::default()
    };
    if flags & QUERY_FLAG_VALUES != 0 {
        let n = read_short(body)? as usize;
        for _ in 0..n {
            params.values.push(read_bytes(body)?);
        }
    }
    if flags & QUERY_FLAG_PAGE_SIZE != 0 {
        params.page_size = Some(read_int(body)?);
    }
    if flags & QUERY_FLAG_PAGING_STATE != 0 {
        params.paging_state = read_bytes(body)?;
    }
    if flags & QUERY_FLAG_SERIAL_CONSISTENCY != 0 {
        params.serial_consistency = Some(Consistency::from_short(read_short(body)?)?);
    }
    if version >= ProtocolVersion::V3 && flags & QUERY_FLAG_DEFAULT_TIMESTAMP != 0 {
        params.default_timestamp = Some(crate::types::read_long(body)?);
    }
    Ok(params)
}

/// One column in a rows or prepared result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnSpec {
    pub keyspace: String,
    pub table: String,
    pub name: String,
    pub ty: CqlType,
}

/// Metadata section of a rows result.
#[derive(Clone, Debug, Default)]
pub struct RowsMetadata {
    pub columns: Vec<ColumnSpec>,
    pub paging_state: Option<Bytes>,
    pub no_metadata: bool,
}

/// A rows result: column specs plus raw (undecoded) cells.
#[derive(Clone, Debug, Default)]
pub struct RowsResult {
    pub metadata: RowsMetadata,
    pub rows: Vec<Vec<Option<Bytes>>>,
}

/// A prepared result: statement id plus bind-variable metadata.
#[derive(Clone, Debug)]
pub struct PreparedResult {
    pub id: Bytes,
    pub bind_variables: Vec<ColumnSpec>,
    pub result_columns: Vec<ColumnSpec>,
}

/// RESULT body variants.
#[derive(Clone, Debug)]
pub enum ResultBody {
    Void,
    Rows(RowsResult),
    SetKeyspace(String),
    Prepared(PreparedResult),
    SchemaChange(SchemaChange),
}

/// A response body, parsed.
#[derive(Clone, Debug)]
pub enum Response {
    Ready,
    Authenticate { authenticator: String },
    AuthChallenge { token: Option<Bytes> },
    AuthSuccess { token: Option<Bytes> },
    Supported { options: HashMap<String, Vec<String>> },
    Result(ResultBody),
    Error(ServerError),
    Event(ProtocolEvent),
}

impl Response {
    pub fn parse(
        opcode: Opcode,
        body: &mut Bytes,
        version: ProtocolVersion,
    ) -> Result<Self, ProtoError> {
        Ok(match opcode {
            Opcode::Ready => Response::Ready,
            Opcode::Authenticate => Response::Authenticate {
                authenticator: read_string(body)?,
            },
            Opcode::AuthChallenge => Response::AuthChallenge {
                token: read_bytes(body)?,
            },
            Opcode::AuthSuccess => Response::AuthSuccess {
                token: read_bytes(body)?,
            },
            Opcode::Supported => Response::Supported {
                options: read_string_multimap(body)?,
            },
            Opcode::Result => Response::Result(parse_result(body, version)?),
            Opcode::Error => Response::Error(ServerError::parse(body)?),
            Opcode::Event => Response::Event(ProtocolEvent::parse(body, version)?),
            other => {
                return Err(ProtoError::malformed(
                    "response",
                    format!("unexpected response opcode {other:?}"),
                ))
            }
        })
    }

    /// Encode a response body; used by in-process test servers.
    pub fn serialize_body(&self, version: ProtocolVersion) -> Result<Bytes, ProtoError> {
        let mut buf = BytesMut::new();
        match self {
            Response::Ready => {}
            Response::Authenticate { authenticator } => write_string(&mut buf, authenticator),
            Response::AuthChallenge { token } => write_bytes(&mut buf, token.as_deref()),
            Response::AuthSuccess { token } => write_bytes(&mut buf, token.as_deref()),
            Response::Supported { options } => write_string_multimap(&mut buf, options),
            Response::Result(result) => write_result(&mut buf, result, version),
            Response::Error(error) => error.write(&mut buf),
            Response::Event(event) => return Ok(event.serialize(version)),
        }
        Ok(buf.freeze())
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Response::Ready => Opcode::Ready,
            Response::Authenticate { .. } => Opcode::Authenticate,
            Response::AuthChallenge { .. } => Opcode::AuthChallenge,
            Response::AuthSuccess { .. } => Opcode::AuthSuccess,
            Response::Supported { .. } => Opcode::Supported,
            Response::Result(_) => Opcode::Result,
            Response::Error(_) => Opcode::Error,
            Response::Event(_) => Opcode::Event,
        }
    }
}

fn parse_rows_metadata(body: &mut Bytes) -> Result<(RowsMetadata, usize), ProtoError> {
    let flags = read_int(body)?;
    let column_count = read_int(body)? as usize;
    let paging_state = if flags & ROWS_FLAG_HAS_MORE_PAGES != 0 {
        read_bytes(body)?
    } else {
        None
    };
    if flags & ROWS_FLAG_NO_METADATA != 0 {
        return Ok((
            RowsMetadata {
                columns: Vec::new(),
                paging_state,
                no_metadata: true,
            },
            column_count,
        ));
    }
    let global_spec = if flags & ROWS_FLAG_GLOBAL_TABLES_SPEC != 0 {
        let keyspace = read_string(body)?;
        let table = read_string(body)?;
        Some((keyspace, table))
    } else {
        None
    };
    let mut columns = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        let (keyspace, table) = match &global_spec {
            Some((keyspace, table)) => (keyspace.clone(), table.clone()),
            None => {
                let keyspace = read_string(body)?;
                let table = read_string(body)?;
                (keyspace, table)
            }
        };
        let name = read_string(body)?;
        let ty = CqlType::parse(body)?;
        columns.push(ColumnSpec {
            keyspace,
            table,
            name,
            ty,
        });
    }
    Ok((
        RowsMetadata {
            columns,
            paging_state,
            no_metadata: false,
        },
        column_count,
    ))
}

fn parse_result(body: &mut Bytes, version: ProtocolVersion) -> Result<ResultBody, ProtoError> {
    match read_int(body)? {
        0x0001 => Ok(ResultBody::Void),
        0x0002 => {
            let (metadata, column_count) = parse_rows_metadata(body)?;
            let row_count = read_int(body)?;
            if row_count < 0 {
                return Err(ProtoError::malformed(
                    "RESULT rows",
                    format!("negative row count {row_count}"),
                ));
            }
            let mut rows = Vec::with_capacity(row_count as usize);
            for _ in 0..row_count {
                let mut row = Vec::with_capacity(column_count);
                for _ in 0..column_count {
                    row.push(read_bytes(body)?);
                }
                rows.push(row);
            }
            Ok(ResultBody::Rows(RowsResult { metadata, rows }))
        }
        0x0003 => Ok(ResultBody::SetKeyspace(read_string(body)?)),
        0x0004 => {
            let id = read_short_bytes(body)?;
            // Bind-variable metadata; v4 adds partition-key indices.
            let flags = read_int(body)?;
            let column_count = read_int(body)? as usize;
            if version >= ProtocolVersion::V4 {
                let pk_count = read_int(body)?;
                for _ in 0..pk_count.max(0) {
                    let _ = read_short(body)?;
                }
            }
            let global_spec = if flags & ROWS_FLAG_GLOBAL_TABLES_SPEC != 0 {
                let keyspace = read_string(body)?;
                let table = read_string(body)?;
                Some((keyspace, table))
            } else {
                None
            };
            let mut bind_variables = Vec::with_capacity(column_count);
            for _ in 0..column_count {
                let (keyspace, table) = match &global_spec {
                    Some((keyspace, table)) => (keyspace.clone(), table.clone()),
                    None => (read_string(body)?, read_string(body)?),
                };
                let name = read_string(body)?;
                let ty = CqlType::parse(body)?;
                bind_variables.push(ColumnSpec {
                    keyspace,
                    table,
                    name,
                    ty,
                });
            }
            // v2+ carries result metadata after the bind variables.
            let result_columns = if version >= ProtocolVersion::V2 && body.has_remaining() {
                parse_rows_metadata(body)?.0.columns
            } else {
                Vec::new()
            };
            Ok(ResultBody::Prepared(PreparedResult {
                id,
                bind_variables,
                result_columns,
            }))
        }
        0x0005 => Ok(ResultBody::SchemaChange(parse_schema_change(
            body, version,
        )?)),
        other => Err(ProtoError::UnknownValue {
            what: "result kind",
            value: format!("{other:#010x}"),
        }),
    }
}

fn write_result(buf: &mut BytesMut, result: &ResultBody, version: ProtocolVersion) {
    match result {
        ResultBody::Void => buf.put_i32(0x0001),
        ResultBody::Rows(rows) => {
            buf.put_i32(0x0002);
            let mut flags = ROWS_FLAG_GLOBAL_TABLES_SPEC;
            if rows.metadata.paging_state.is_some() {
                flags |= ROWS_FLAG_HAS_MORE_PAGES;
            }
            buf.put_i32(flags);
            buf.put_i32(rows.metadata.columns.len() as i32);
            if let Some(state) = &rows.metadata.paging_state {
                write_bytes(buf, Some(state));
            }
            let (keyspace, table) = rows
                .metadata
                .columns
                .first()
                .map(|c| (c.keyspace.clone(), c.table.clone()))
                .unwrap_or_default();
            write_string(buf, &keyspace);
            write_string(buf, &table);
            for column in &rows.metadata.columns {
                write_string(buf, &column.name);
                column.ty.write(buf);
            }
            buf.put_i32(rows.rows.len() as i32);
            for row in &rows.rows {
                for cell in row {
                    write_bytes(buf, cell.as_deref());
                }
            }
        }
        ResultBody::SetKeyspace(keyspace) => {
            buf.put_i32(0x0003);
            write_string(buf, keyspace);
        }
        ResultBody::Prepared(prepared) => {
            buf.put_i32(0x0004);
            write_short_bytes(buf, &prepared.id);
            buf.put_i32(0);
            buf.put_i32(prepared.bind_variables.len() as i32);
            if version >= ProtocolVersion::V4 {
                buf.put_i32(0);
            }
            for column in &prepared.bind_variables {
                write_string(buf, &column.keyspace);
                write_string(buf, &column.table);
                write_string(buf, &column.name);
                column.ty.write(buf);
            }
            if version >= ProtocolVersion::V2 {
                buf.put_i32(ROWS_FLAG_GLOBAL_TABLES_SPEC);
                buf.put_i32(prepared.result_columns.len() as i32);
                let (keyspace, table) = prepared
                    .result_columns
                    .first()
                    .map(|c| (c.keyspace.clone(), c.table.clone()))
                    .unwrap_or_default();
                write_string(buf, &keyspace);
                write_string(buf, &table);
                for column in &prepared.result_columns {
                    write_string(buf, &column.name);
                    column.ty.write(buf);
                }
            }
        }
        ResultBody::SchemaChange(change) => {
            buf.put_i32(0x0005);
            write_schema_change(buf, change, version);
        }
    }
}

/// Write types reported in write-timeout and write-failure errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteType {
    Simple,
    Batch,
    UnloggedBatch,
    Counter,
    BatchLog,
    Cas,
}

impl WriteType {
    fn name(self) -> &'static str {
        match self {
            WriteType::Simple => "SIMPLE",
            WriteType::Batch => "BATCH",
            WriteType::UnloggedBatch => "UNLOGGED_BATCH",
            WriteType::Counter => "COUNTER",
            WriteType::BatchLog => "BATCH_LOG",
            WriteType::Cas => "CAS",
        }
    }

    fn parse(raw: &str) -> Result<Self, ProtoError> {
        Ok(match raw {
            "SIMPLE" => WriteType::Simple,
            "BATCH" => WriteType::Batch,
            "UNLOGGED_BATCH" => WriteType::UnloggedBatch,
            "COUNTER" => WriteType::Counter,
            "BATCH_LOG" => WriteType::BatchLog,
            "CAS" => WriteType::Cas,
            other => {
                return Err(ProtoError::UnknownValue {
                    what: "write type",
                    value: other.to_string(),
                })
            }
        })
    }
}

/// Server error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    ServerError = 0x0000,
    ProtocolError = 0x000A,
    AuthenticationError = 0x0100,
    Unavailable = 0x1000,
    Overloaded = 0x1001,
    IsBootstrapping = 0x1002,
    TruncateError = 0x1003,
    WriteTimeout = 0x1100,
    ReadTimeout = 0x1200,
    ReadFailure = 0x1300,
    FunctionFailure = 0x1400,
    WriteFailure = 0x1500,
    SyntaxError = 0x2000,
    Unauthorized = 0x2100,
    InvalidQuery = 0x2200,
    ConfigError = 0x2300,
    AlreadyExists = 0x2400,
    Unprepared = 0x2500,
}

impl ErrorCode {
    pub fn from_int(code: i32) -> Result<Self, ProtoError> {
        Ok(match code {
            0x0000 => ErrorCode::ServerError,
            0x000A => ErrorCode::ProtocolError,
            0x0100 => ErrorCode::AuthenticationError,
            0x1000 => ErrorCode::Unavailable,
            0x1001 => ErrorCode::Overloaded,
            0x1002 => ErrorCode::IsBootstrapping,
            0x1003 => ErrorCode::TruncateError,
            0x1100 => ErrorCode::WriteTimeout,
            0x1200 => ErrorCode::ReadTimeout,
            0x1300 => ErrorCode::ReadFailure,
            0x1400 => ErrorCode::FunctionFailure,
            0x1500 => ErrorCode::WriteFailure,
            0x2000 => ErrorCode::SyntaxError,
            0x2100 => ErrorCode::Unauthorized,
            0x2200 => ErrorCode::InvalidQuery,
            0x2300 => ErrorCode::ConfigError,
            0x2400 => ErrorCode::AlreadyExists,
            0x2500 => ErrorCode::Unprepared,
            other => {
                return Err(ProtoError::UnknownValue {
                    what: "error code",
                    value: format!("{other:#010x}"),
                })
            }
        })
    }
}

/// Structured payload attached to certain error codes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorDetails {
    None,
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        write_type: WriteType,
    },
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        data_present: bool,
    },
    ReadFailure {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        failures: i32,
        data_present: bool,
    },
    WriteFailure {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        failures: i32,
        write_type: WriteType,
    },
    FunctionFailure {
        keyspace: String,
        function: String,
        arg_types: Vec<String>,
    },
    AlreadyExists {
        keyspace: String,
        table: String,
    },
    Unprepared {
        id: Bytes,
    },
}

/// An ERROR response, decoded.
#[derive(Clone, Debug)]
pub struct ServerError {
    pub code: ErrorCode,
    pub message: String,
    pub details: ErrorDetails,
}

impl ServerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerError {
            code,
            message: message.into(),
            details: ErrorDetails::None,
        }
    }

    pub fn with_details(
        code: ErrorCode,
        message: impl Into<String>,
        details: ErrorDetails,
    ) -> Self {
        ServerError {
            code,
            message: message.into(),
            details,
        }
    }

    pub fn parse(body: &mut Bytes) -> Result<Self, ProtoError> {
        let code = ErrorCode::from_int(read_int(body)?)?;
        let message = read_string(body)?;
        let details = match code {
            ErrorCode::Unavailable => ErrorDetails::Unavailable {
                consistency: Consistency::from_short(read_short(body)?)?,
                required: read_int(body)?,
                alive: read_int(body)?,
            },
            ErrorCode::WriteTimeout => ErrorDetails::WriteTimeout {
                consistency: Consistency::from_short(read_short(body)?)?,
                received: read_int(body)?,
                block_for: read_int(body)?,
                write_type: WriteType::parse(&read_string(body)?)?,
            },
            ErrorCode::ReadTimeout => ErrorDetails::ReadTimeout {
                consistency: Consistency::from_short(read_short(body)?)?,
                received: read_int(body)?,
                block_for: read_int(body)?,
                data_present: crate::types::read_byte(body)? != 0,
            },
            ErrorCode::ReadFailure => ErrorDetails::ReadFailure {
                consistency: Consistency::from_short(read_short(body)?)?,
                received: read_int(body)?,
                block_for: read_int(body)?,
                failures: read_int(body)?,
                data_present: crate::types::read_byte(body)? != 0,
            },
            ErrorCode::WriteFailure => ErrorDetails::WriteFailure {
                consistency: Consistency::from_short(read_short(body)?)?,
                received: read_int(body)?,
                block_for: read_int(body)?,
                failures: read_int(body)?,
                write_type: WriteType::parse(&read_string(body)?)?,
            },
            ErrorCode::FunctionFailure => ErrorDetails::FunctionFailure {
                keyspace: read_string(body)?,
                function: read_string(body)?,
                arg_types: read_string_list(body)?,
            },
            ErrorCode::AlreadyExists => ErrorDetails::AlreadyExists {
                keyspace: read_string(body)?,
                table: read_string(body)?,
            },
            ErrorCode::Unprepared => ErrorDetails::Unprepared {
                id: read_short_bytes(body)?,
            },
            _ => ErrorDetails::None,
        };
        Ok(ServerError {
            code,
            message,
            details,
        })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_i32(self.code as i32);
        write_string(buf, &self.message);
        match &self.details {
            ErrorDetails::None => {}
            ErrorDetails::Unavailable {
                consistency,
                required,
                alive,
            } => {
                write_short(buf, consistency.as_short());
                buf.put_i32(*required);
                buf.put_i32(*alive);
            }
            ErrorDetails::WriteTimeout {
                consistency,
                received,
                block_for,
                write_type,
            } => {
                write_short(buf, consistency.as_short());
                buf.put_i32(*received);
                buf.put_i32(*block_for);
                write_string(buf, write_type.name());
            }
            ErrorDetails::ReadTimeout {
                consistency,
                received,
                block_for,
                data_present,
            } => {
                write_short(buf, consistency.as_short());
                buf.put_i32(*received);
                buf.put_i32(*block_for);
                buf.put_u8(u8::from(*data_present));
            }
            ErrorDetails::ReadFailure {
                consistency,
                received,
                block_for,
                failures,
                data_present,
            } => {
                write_short(buf, consistency.as_short());
                buf.put_i32(*received);
                buf.put_i32(*block_for);
                buf.put_i32(*failures);
                buf.put_u8(u8::from(*data_present));
            }
            ErrorDetails::WriteFailure {
                consistency,
                received,
                block_for,
                failures,
                write_type,
            } => {
                write_short(buf, consistency.as_short());
                buf.put_i32(*received);
                buf.put_i32(*block_for);
                buf.put_i32(*failures);
                write_string(buf, write_type.name());
            }
            ErrorDetails::FunctionFailure {
                keyspace,
                function,
                arg_types,
            } => {
                write_string(buf, keyspace);
                write_string(buf, function);
                write_string_list(buf, arg_types);
            }
            ErrorDetails::AlreadyExists { keyspace, table } => {
                write_string(buf, keyspace);
                write_string(buf, table);
            }
            ErrorDetails::Unprepared { id } => {
                write_short_bytes(buf, id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_body_carries_compression_option() {
        let request = Request::Startup {
            cql_version: "3.0.0".into(),
            compression: Some("lz4".into()),
        };
        let mut body = request.serialize_body(ProtocolVersion::V4).unwrap();
        let parsed = Request::parse(Opcode::Startup, &mut body, ProtocolVersion::V4).unwrap();
        let Request::Startup {
            cql_version,
            compression,
        } = parsed
        else {
            panic!("expected STARTUP");
        };
        assert_eq!(cql_version, "3.0.0");
        assert_eq!(compression.as_deref(), Some("lz4"));
    }

    #[test]
    fn query_parameters_round_trip_v4() {
        let request = Request::Query {
            query: "SELECT * FROM t WHERE pk = ?".into(),
            params: QueryParameters {
                consistency: Some(Consistency::LocalQuorum),
                values: vec![Some(Bytes::from_static(b"\x00\x00\x00\x01")), None],
                page_size: Some(5000),
                serial_consistency: Some(Consistency::LocalSerial),
                default_timestamp: Some(1_234_567),
                ..QueryParameters::default()
            },
        };
        let mut body = request.serialize_body(ProtocolVersion::V4).unwrap();
        let Request::Query { query, params } =
            Request::parse(Opcode::Query, &mut body, ProtocolVersion::V4).unwrap()
        else {
            panic!("expected QUERY");
        };
        assert_eq!(query, "SELECT * FROM t WHERE pk = ?");
        assert_eq!(params.consistency, Some(Consistency::LocalQuorum));
        assert_eq!(params.values.len(), 2);
        assert_eq!(params.values[1], None);
        assert_eq!(params.page_size, Some(5000));
        assert_eq!(params.serial_consistency, Some(Consistency::LocalSerial));
        assert_eq!(params.default_timestamp, Some(1_234_567));
    }

    #[test]
    fn v1_query_rejects_bound_values() {
        let request = Request::Query {
            query: "SELECT 1".into(),
            params: QueryParameters {
                values: vec![Some(Bytes::from_static(b"x"))],
                ..QueryParameters::default()
            },
        };
        assert!(request.serialize_body(ProtocolVersion::V1).is_err());
    }

    #[test]
    fn rows_result_round_trips() {
        let rows = ResultBody::Rows(RowsResult {
            metadata: RowsMetadata {
                columns: vec![
                    ColumnSpec {
                        keyspace: "ks".into(),
                        table: "t".into(),
                        name: "pk".into(),
                        ty: CqlType::Int,
                    },
                    ColumnSpec {
                        keyspace: "ks".into(),
                        table: "t".into(),
                        name: "v".into(),
                        ty: CqlType::Varchar,
                    },
                ],
                paging_state: None,
                no_metadata: false,
            },
            rows: vec![vec![
                Some(Bytes::from_static(b"\x00\x00\x00\x2a")),
                None,
            ]],
        });
        let mut body = Response::Result(rows)
            .serialize_body(ProtocolVersion::V4)
            .unwrap();
        let Response::Result(ResultBody::Rows(parsed)) =
            Response::parse(Opcode::Result, &mut body, ProtocolVersion::V4).unwrap()
        else {
            panic!("expected rows");
        };
        assert_eq!(parsed.metadata.columns.len(), 2);
        assert_eq!(parsed.metadata.columns[1].ty, CqlType::Varchar);
        assert_eq!(parsed.rows.len(), 1);
        assert_eq!(parsed.rows[0][1], None);
    }

    #[test]
    fn unavailable_error_round_trips_with_details() {
        let error = ServerError::with_details(
            ErrorCode::Unavailable,
            "cannot achieve consistency",
            ErrorDetails::Unavailable {
                consistency: Consistency::Quorum,
                required: 2,
                alive: 1,
            },
        );
        let mut body = Response::Error(error)
            .serialize_body(ProtocolVersion::V4)
            .unwrap();
        let Response::Error(parsed) =
            Response::parse(Opcode::Error, &mut body, ProtocolVersion::V4).unwrap()
        else {
            panic!("expected error");
        };
        assert_eq!(parsed.code, ErrorCode::Unavailable);
        assert_eq!(
            parsed.details,
            ErrorDetails::Unavailable {
                consistency: Consistency::Quorum,
                required: 2,
                alive: 1,
            }
        );
    }

    #[test]
    fn prepared_result_round_trips_v4() {
        let prepared = ResultBody::Prepared(PreparedResult {
            id: Bytes::from_static(b"\x01\x02"),
            bind_variables: vec![ColumnSpec {
                keyspace: "ks".into(),
                table: "t".into(),
                name: "pk".into(),
                ty: CqlType::Bigint,
            }],
            result_columns: vec![ColumnSpec {
                keyspace: "ks".into(),
                table: "t".into(),
                name: "v".into(),
                ty: CqlType::Blob,
            }],
        });
        let mut body = Response::Result(prepared)
            .serialize_body(ProtocolVersion::V4)
            .unwrap();
        let Response::Result(ResultBody::Prepared(parsed)) =
            Response::parse(Opcode::Result, &mut body, ProtocolVersion::V4).unwrap()
        else {
            panic!("expected prepared");
        };
        assert_eq!(parsed.id, Bytes::from_static(b"\x01\x02"));
        assert_eq!(parsed.bind_variables[0].ty, CqlType::Bigint);
        assert_eq!(parsed.result_columns[0].ty, CqlType::Blob);
    }
}
