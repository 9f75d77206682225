//! Typed serialization between wire cells and driver values.
//!
//! The registry resolves a [`Codec`] for any combination of wire type,
//! language type, and runtime value, synthesizing collection, tuple, UDT and
//! custom codecs on the fly and caching them by composition weight.

mod collections;
mod literal;
mod primitives;
mod registry;

pub use collections::{custom, list, map, set, tuple, udt};
pub use registry::CodecRegistry;

use std::net::IpAddr;
use std::sync::Arc;

use basalt_proto::types::{CqlType, UdtType};
use basalt_proto::ProtocolVersion;
use bytes::Bytes;
use uuid::Uuid;

use crate::errors::CodecError;

/// A dynamically-typed driver value, mirroring the wire type space.
#[derive(Clone, Debug, PartialEq)]
pub enum CqlValue {
    Ascii(String),
    Bigint(i64),
    Blob(Vec<u8>),
    Boolean(bool),
    Counter(i64),
    /// Arbitrary-precision decimal: scale plus a two's-complement unscaled
    /// value in big-endian bytes.
    Decimal { scale: i32, unscaled: Vec<u8> },
    Double(f64),
    Float(f32),
    Int(i32),
    Text(String),
    /// Milliseconds since the unix epoch.
    Timestamp(i64),
    Uuid(Uuid),
    /// Two's-complement big-endian bytes.
    Varint(Vec<u8>),
    Timeuuid(Uuid),
    Inet(IpAddr),
    /// Days since the unix epoch, offset by 2^31 as on the wire.
    Date(u32),
    /// Nanoseconds since midnight.
    Time(i64),
    Smallint(i16),
    Tinyint(i8),
    List(Vec<CqlValue>),
    Set(Vec<CqlValue>),
    Map(Vec<(CqlValue, CqlValue)>),
    Tuple(Vec<Option<CqlValue>>),
    Udt {
        type_name: String,
        fields: Vec<(String, Option<CqlValue>)>,
    },
    Custom {
        class: String,
        data: Vec<u8>,
    },
}

impl CqlValue {
    /// Short shape name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            CqlValue::Ascii(_) => "ascii",
            CqlValue::Bigint(_) => "bigint",
            CqlValue::Blob(_) => "blob",
            CqlValue::Boolean(_) => "boolean",
            CqlValue::Counter(_) => "counter",
            CqlValue::Decimal { .. } => "decimal",
            CqlValue::Double(_) => "double",
            CqlValue::Float(_) => "float",
            CqlValue::Int(_) => "int",
            CqlValue::Text(_) => "text",
            CqlValue::Timestamp(_) => "timestamp",
            CqlValue::Uuid(_) => "uuid",
            CqlValue::Varint(_) => "varint",
            CqlValue::Timeuuid(_) => "timeuuid",
            CqlValue::Inet(_) => "inet",
            CqlValue::Date(_) => "date",
            CqlValue::Time(_) => "time",
            CqlValue::Smallint(_) => "smallint",
            CqlValue::Tinyint(_) => "tinyint",
            CqlValue::List(_) => "list",
            CqlValue::Set(_) => "set",
            CqlValue::Map(_) => "map",
            CqlValue::Tuple(_) => "tuple",
            CqlValue::Udt { .. } => "udt",
            CqlValue::Custom { .. } => "custom",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CqlValue::Text(s) | CqlValue::Ascii(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            CqlValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_inet(&self) -> Option<IpAddr> {
        match self {
            CqlValue::Inet(addr) => Some(*addr),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            CqlValue::Uuid(id) | CqlValue::Timeuuid(id) => Some(*id),
            _ => None,
        }
    }

    /// Text elements of a set or list value, for catalog columns like `tokens`.
    pub fn text_items(&self) -> Option<Vec<&str>> {
        let items = match self {
            CqlValue::List(items) | CqlValue::Set(items) => items,
            _ => return None,
        };
        items.iter().map(CqlValue::as_text).collect()
    }
}

/// Structural descriptor of the driver-side type in a lookup, the static half
/// of a codec's contract. Parameterized variants own their element
/// descriptors, so `list<timestamp> <-> List<LocalDate>` style lookups recurse
/// the same way the wire descriptor does.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RustType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    String,
    Bytes,
    Uuid,
    IpAddr,
    Date,
    Time,
    Timestamp,
    Decimal,
    Varint,
    List(Box<RustType>),
    Set(Box<RustType>),
    Map(Box<RustType>, Box<RustType>),
    /// Structural tuple value; keyed by the wire descriptor, like the wire side.
    Tuple,
    /// Structural UDT value; keyed by the wire descriptor.
    Udt,
    /// A user-registered type, identified by name.
    Named(String),
}

impl RustType {
    pub fn list(elem: RustType) -> RustType {
        RustType::List(Box::new(elem))
    }

    pub fn set(elem: RustType) -> RustType {
        RustType::Set(Box::new(elem))
    }

    pub fn map(key: RustType, value: RustType) -> RustType {
        RustType::Map(Box::new(key), Box::new(value))
    }

    pub fn named(name: impl Into<String>) -> RustType {
        RustType::Named(name.into())
    }
}

impl std::fmt::Display for RustType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RustType::Bool => f.write_str("bool"),
            RustType::I8 => f.write_str("i8"),
            RustType::I16 => f.write_str("i16"),
            RustType::I32 => f.write_str("i32"),
            RustType::I64 => f.write_str("i64"),
            RustType::F32 => f.write_str("f32"),
            RustType::F64 => f.write_str("f64"),
            RustType::String => f.write_str("String"),
            RustType::Bytes => f.write_str("Vec<u8>"),
            RustType::Uuid => f.write_str("Uuid"),
            RustType::IpAddr => f.write_str("IpAddr"),
            RustType::Date => f.write_str("Date"),
            RustType::Time => f.write_str("Time"),
            RustType::Timestamp => f.write_str("Timestamp"),
            RustType::Decimal => f.write_str("Decimal"),
            RustType::Varint => f.write_str("Varint"),
            RustType::List(elem) => write!(f, "List<{elem}>"),
            RustType::Set(elem) => write!(f, "Set<{elem}>"),
            RustType::Map(key, value) => write!(f, "Map<{key}, {value}>"),
            RustType::Tuple => f.write_str("TupleValue"),
            RustType::Udt => f.write_str("UdtValue"),
            RustType::Named(name) => f.write_str(name),
        }
    }
}

/// A bidirectional converter between one wire type and one driver type.
///
/// Codecs are immutable and shared (`Arc<dyn Codec>`); all methods take
/// `&self` and are safe to call from any thread.
pub trait Codec: Send + Sync + std::fmt::Debug {
    /// The wire type this codec declares.
    fn cql_type(&self) -> &CqlType;

    /// The driver-side type this codec declares.
    fn rust_type(&self) -> &RustType;

    /// Whether this codec can decode cells of the given wire type.
    fn accepts_cql(&self, ty: &CqlType) -> bool {
        ty == self.cql_type()
    }

    /// Whether this codec can encode values of the given driver type.
    fn accepts_rust(&self, ty: &RustType) -> bool {
        ty == self.rust_type()
    }

    /// Runtime shape test on a concrete value.
    fn accepts_value(&self, value: &CqlValue) -> bool;

    fn serialize(
        &self,
        value: &CqlValue,
        version: ProtocolVersion,
    ) -> Result<Bytes, CodecError>;

    fn deserialize(
        &self,
        bytes: &[u8],
        version: ProtocolVersion,
    ) -> Result<CqlValue, CodecError>;

    /// Render the value as a CQL literal.
    fn format(&self, value: &CqlValue) -> Result<String, CodecError>;

    /// Parse a CQL literal.
    fn parse(&self, literal: &str) -> Result<CqlValue, CodecError>;
}

pub(crate) fn mismatch(codec: &dyn Codec, value: &CqlValue) -> CodecError {
    CodecError::ValueMismatch {
        cql: codec.cql_type().to_string(),
        kind: value.kind(),
    }
}

pub(crate) fn bad_cell(ty: &CqlType, detail: impl Into<String>) -> CodecError {
    CodecError::BadCell {
        cql: ty.to_string(),
        detail: detail.into(),
    }
}

/// Build a UDT wire descriptor; test and metadata helper.
pub fn udt_type(
    keyspace: &str,
    name: &str,
    fields: Vec<(&str, CqlType)>,
) -> CqlType {
    CqlType::Udt(UdtType {
        keyspace: keyspace.to_string(),
        name: name.to_string(),
        fields: fields
            .into_iter()
            .map(|(field, ty)| (field.to_string(), ty))
            .collect(),
    })
}

/// Shared handle to a codec.
pub type CodecRef = Arc<dyn Codec>;
