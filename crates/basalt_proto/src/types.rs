//! Wire primitives and the column type descriptor.
//!
//! Readers take `&mut impl Buf` and fail with a typed error instead of
//! panicking on short input; writers append to a `BufMut`.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes};
use uuid::Uuid;

use crate::ProtoError;

fn ensure(buf: &impl Buf, what: &'static str, needed: usize) -> Result<(), ProtoError> {
    if buf.remaining() < needed {
        Err(ProtoError::Truncated {
            what,
            needed: needed - buf.remaining(),
        })
    } else {
        Ok(())
    }
}

pub fn read_byte(buf: &mut impl Buf) -> Result<u8, ProtoError> {
    ensure(buf, "[byte]", 1)?;
    Ok(buf.get_u8())
}

pub fn read_short(buf: &mut impl Buf) -> Result<u16, ProtoError> {
    ensure(buf, "[short]", 2)?;
    Ok(buf.get_u16())
}

pub fn read_int(buf: &mut impl Buf) -> Result<i32, ProtoError> {
    ensure(buf, "[int]", 4)?;
    Ok(buf.get_i32())
}

pub fn read_long(buf: &mut impl Buf) -> Result<i64, ProtoError> {
    ensure(buf, "[long]", 8)?;
    Ok(buf.get_i64())
}

pub fn read_string(buf: &mut impl Buf) -> Result<String, ProtoError> {
    let len = read_short(buf)? as usize;
    ensure(buf, "[string]", len)?;
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    Ok(String::from_utf8(raw)?)
}

pub fn read_long_string(buf: &mut impl Buf) -> Result<String, ProtoError> {
    let len = read_int(buf)?;
    if len < 0 {
        return Err(ProtoError::malformed(
            "[long string]",
            format!("negative length {len}"),
        ));
    }
    let len = len as usize;
    ensure(buf, "[long string]", len)?;
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    Ok(String::from_utf8(raw)?)
}

/// `[bytes]`: int-prefixed byte block; a negative length encodes null.
pub fn read_bytes(buf: &mut impl Buf) -> Result<Option<Bytes>, ProtoError> {
    let len = read_int(buf)?;
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    ensure(buf, "[bytes]", len)?;
    Ok(Some(buf.copy_to_bytes(len)))
}

pub fn read_short_bytes(buf: &mut impl Buf) -> Result<Bytes, ProtoError> {
    let len = read_short(buf)? as usize;
    ensure(buf, "[short bytes]", len)?;
    Ok(buf.copy_to_bytes(len))
}

pub fn read_string_list(buf: &mut impl Buf) -> Result<Vec<String>, ProtoError> {
    let n = read_short(buf)? as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(read_string(buf)?);
    }
    Ok(out)
}

pub fn read_string_multimap(
    buf: &mut impl Buf,
) -> Result<HashMap<String, Vec<String>>, ProtoError> {
    let n = read_short(buf)? as usize;
    let mut out = HashMap::with_capacity(n);
    for _ in 0..n {
        let key = read_string(buf)?;
        let values = read_string_list(buf)?;
        out.insert(key, values);
    }
    Ok(out)
}

/// `[inet]`: one length byte, 4 or 16 address bytes, then an int port.
pub fn read_inet(buf: &mut impl Buf) -> Result<SocketAddr, ProtoError> {
    let addr = read_inetaddr(buf)?;
    let port = read_int(buf)?;
    Ok(SocketAddr::new(addr, port as u16))
}

/// Address part of `[inet]`, without the port.
pub fn read_inetaddr(buf: &mut impl Buf) -> Result<IpAddr, ProtoError> {
    let len = read_byte(buf)? as usize;
    ensure(buf, "[inetaddr]", len)?;
    match len {
        4 => {
            let mut raw = [0u8; 4];
            buf.copy_to_slice(&mut raw);
            Ok(IpAddr::V4(Ipv4Addr::from(raw)))
        }
        16 => {
            let mut raw = [0u8; 16];
            buf.copy_to_slice(&mut raw);
            Ok(IpAddr::V6(Ipv6Addr::from(raw)))
        }
        other => Err(ProtoError::InvalidInet(other)),
    }
}

pub fn read_uuid(buf: &mut impl Buf) -> Result<Uuid, ProtoError> {
    ensure(buf, "[uuid]", 16)?;
    let mut raw = [0u8; 16];
    buf.copy_to_slice(&mut raw);
    Ok(Uuid::from_bytes(raw))
}

pub fn write_byte(buf: &mut impl BufMut, value: u8) {
    buf.put_u8(value);
}

pub fn write_short(buf: &mut impl BufMut, value: u16) {
    buf.put_u16(value);
}

pub fn write_int(buf: &mut impl BufMut, value: i32) {
    buf.put_i32(value);
}

pub fn write_long(buf: &mut impl BufMut, value: i64) {
    buf.put_i64(value);
}

pub fn write_string(buf: &mut impl BufMut, value: &str) {
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
}

pub fn write_long_string(buf: &mut impl BufMut, value: &str) {
    buf.put_i32(value.len() as i32);
    buf.put_slice(value.as_bytes());
}

pub fn write_bytes(buf: &mut impl BufMut, value: Option<&[u8]>) {
    match value {
        Some(raw) => {
            buf.put_i32(raw.len() as i32);
            buf.put_slice(raw);
        }
        None => buf.put_i32(-1),
    }
}

pub fn write_short_bytes(buf: &mut impl BufMut, value: &[u8]) {
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
}

pub fn write_string_list(buf: &mut impl BufMut, values: &[String]) {
    buf.put_u16(values.len() as u16);
    for value in values {
        write_string(buf, value);
    }
}

pub fn write_string_map(buf: &mut impl BufMut, map: &[(String, String)]) {
    buf.put_u16(map.len() as u16);
    for (key, value) in map {
        write_string(buf, key);
        write_string(buf, value);
    }
}

pub fn write_string_multimap(buf: &mut impl BufMut, map: &HashMap<String, Vec<String>>) {
    buf.put_u16(map.len() as u16);
    for (key, values) in map {
        write_string(buf, key);
        write_string_list(buf, values);
    }
}

pub fn write_inet(buf: &mut impl BufMut, addr: SocketAddr) {
    write_inetaddr(buf, addr.ip());
    buf.put_i32(addr.port() as i32);
}

pub fn write_inetaddr(buf: &mut impl BufMut, addr: IpAddr) {
    match addr {
        IpAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(16);
            buf.put_slice(&v6.octets());
        }
    }
}

pub fn write_uuid(buf: &mut impl BufMut, uuid: Uuid) {
    buf.put_slice(uuid.as_bytes());
}

// Option ids used in result metadata.
const TYPE_CUSTOM: u16 = 0x0000;
const TYPE_ASCII: u16 = 0x0001;
const TYPE_BIGINT: u16 = 0x0002;
const TYPE_BLOB: u16 = 0x0003;
const TYPE_BOOLEAN: u16 = 0x0004;
const TYPE_COUNTER: u16 = 0x0005;
const TYPE_DECIMAL: u16 = 0x0006;
const TYPE_DOUBLE: u16 = 0x0007;
const TYPE_FLOAT: u16 = 0x0008;
const TYPE_INT: u16 = 0x0009;
const TYPE_TEXT: u16 = 0x000A;
const TYPE_TIMESTAMP: u16 = 0x000B;
const TYPE_UUID: u16 = 0x000C;
const TYPE_VARCHAR: u16 = 0x000D;
const TYPE_VARINT: u16 = 0x000E;
const TYPE_TIMEUUID: u16 = 0x000F;
const TYPE_INET: u16 = 0x0010;
const TYPE_DATE: u16 = 0x0011;
const TYPE_TIME: u16 = 0x0012;
const TYPE_SMALLINT: u16 = 0x0013;
const TYPE_TINYINT: u16 = 0x0014;
const TYPE_LIST: u16 = 0x0020;
const TYPE_MAP: u16 = 0x0021;
const TYPE_SET: u16 = 0x0022;
const TYPE_UDT: u16 = 0x0030;
const TYPE_TUPLE: u16 = 0x0031;

/// Structural descriptor of a column type, including parameters.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CqlType {
    Ascii,
    Bigint,
    Blob,
    Boolean,
    Counter,
    Decimal,
    Double,
    Float,
    Int,
    Text,
    Timestamp,
    Uuid,
    Varchar,
    Varint,
    Timeuuid,
    Inet,
    Date,
    Time,
    Smallint,
    Tinyint,
    List(Box<CqlType>),
    Set(Box<CqlType>),
    Map(Box<CqlType>, Box<CqlType>),
    Tuple(Vec<CqlType>),
    Udt(UdtType),
    Custom(String),
}

/// User-defined type descriptor, keyed by keyspace-qualified name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UdtType {
    pub keyspace: String,
    pub name: String,
    pub fields: Vec<(String, CqlType)>,
}

impl CqlType {
    pub fn list(elem: CqlType) -> CqlType {
        CqlType::List(Box::new(elem))
    }

    pub fn set(elem: CqlType) -> CqlType {
        CqlType::Set(Box::new(elem))
    }

    pub fn map(key: CqlType, value: CqlType) -> CqlType {
        CqlType::Map(Box::new(key), Box::new(value))
    }

    pub fn is_collection(&self) -> bool {
        matches!(
            self,
            CqlType::List(_) | CqlType::Set(_) | CqlType::Map(_, _)
        )
    }

    /// Parse a type option from result metadata.
    pub fn parse(buf: &mut impl Buf) -> Result<CqlType, ProtoError> {
        let id = read_short(buf)?;
        Ok(match id {
            TYPE_CUSTOM => CqlType::Custom(read_string(buf)?),
            TYPE_ASCII => CqlType::Ascii,
            TYPE_BIGINT => CqlType::Bigint,
            TYPE_BLOB => CqlType::Blob,
            TYPE_BOOLEAN => CqlType::Boolean,
            TYPE_COUNTER => CqlType::Counter,
            TYPE_DECIMAL => CqlType::Decimal,
            TYPE_DOUBLE => CqlType::Double,
            TYPE_FLOAT => CqlType::Float,
            TYPE_INT => CqlType::Int,
            TYPE_TEXT => CqlType::Text,
            TYPE_TIMESTAMP => CqlType::Timestamp,
            TYPE_UUID => CqlType::Uuid,
            TYPE_VARCHAR => CqlType::Varchar,
            TYPE_VARINT => CqlType::Varint,
            TYPE_TIMEUUID => CqlType::Timeuuid,
            TYPE_INET => CqlType::Inet,
            TYPE_DATE => CqlType::Date,
            TYPE_TIME => CqlType::Time,
            TYPE_SMALLINT => CqlType::Smallint,
            TYPE_TINYINT => CqlType::Tinyint,
            TYPE_LIST => CqlType::List(Box::new(CqlType::parse(buf)?)),
            TYPE_SET => CqlType::Set(Box::new(CqlType::parse(buf)?)),
            TYPE_MAP => {
                let key = CqlType::parse(buf)?;
                let value = CqlType::parse(buf)?;
                CqlType::map(key, value)
            }
            TYPE_TUPLE => {
                let n = read_short(buf)? as usize;
                let mut elems = Vec::with_capacity(n);
                for _ in 0..n {
                    elems.push(CqlType::parse(buf)?);
                }
                CqlType::Tuple(elems)
            }
            TYPE_UDT => {
                let keyspace = read_string(buf)?;
                let name = read_string(buf)?;
                let n = read_short(buf)? as usize;
                let mut fields = Vec::with_capacity(n);
                for _ in 0..n {
                    let field = read_string(buf)?;
                    let ty = CqlType::parse(buf)?;
                    fields.push((field, ty));
                }
                CqlType::Udt(UdtType {
                    keyspace,
                    name,
                    fields,
                })
            }
            other => {
                return Err(ProtoError::UnknownValue {
                    what: "type option id",
                    value: format!("{other:#06x}"),
                })
            }
        })
    }

    /// Write the type option in result-metadata form.
    pub fn write(&self, buf: &mut impl BufMut) {
        match self {
            CqlType::Custom(class) => {
                write_short(buf, TYPE_CUSTOM);
                write_string(buf, class);
            }
            CqlType::Ascii => write_short(buf, TYPE_ASCII),
            CqlType::Bigint => write_short(buf, TYPE_BIGINT),
            CqlType::Blob => write_short(buf, TYPE_BLOB),
            CqlType::Boolean => write_short(buf, TYPE_BOOLEAN),
            CqlType::Counter => write_short(buf, TYPE_COUNTER),
            CqlType::Decimal => write_short(buf, TYPE_DECIMAL),
            CqlType::Double => write_short(buf, TYPE_DOUBLE),
            CqlType::Float => write_short(buf, TYPE_FLOAT),
            CqlType::Int => write_short(buf, TYPE_INT),
            CqlType::Text => write_short(buf, TYPE_TEXT),
            CqlType::Timestamp => write_short(buf, TYPE_TIMESTAMP),
            CqlType::Uuid => write_short(buf, TYPE_UUID),
            CqlType::Varchar => write_short(buf, TYPE_VARCHAR),
            CqlType::Varint => write_short(buf, TYPE_VARINT),
            CqlType::Timeuuid => write_short(buf, TYPE_TIMEUUID),
            CqlType::Inet => write_short(buf, TYPE_INET),
            CqlType::Date => write_short(buf, TYPE_DATE),
            CqlType::Time => write_short(buf, TYPE_TIME),
            CqlType::Smallint => write_short(buf, TYPE_SMALLINT),
            CqlType::Tinyint => write_short(buf, TYPE_TINYINT),
            CqlType::List(elem) => {
                write_short(buf, TYPE_LIST);
                elem.write(buf);
            }
            CqlType::Set(elem) => {
                write_short(buf, TYPE_SET);
                elem.write(buf);
            }
            CqlType::Map(key, value) => {
                write_short(buf, TYPE_MAP);
                key.write(buf);
                value.write(buf);
            }
            CqlType::Tuple(elems) => {
                write_short(buf, TYPE_TUPLE);
                write_short(buf, elems.len() as u16);
                for elem in elems {
                    elem.write(buf);
                }
            }
            CqlType::Udt(udt) => {
                write_short(buf, TYPE_UDT);
                write_string(buf, &udt.keyspace);
                write_string(buf, &udt.name);
                write_short(buf, udt.fields.len() as u16);
                for (field, ty) in &udt.fields {
                    write_string(buf, field);
                    ty.write(buf);
                }
            }
        }
    }
}

impl std::fmt::Display for CqlType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CqlType::Ascii => f.write_str("ascii"),
            CqlType::Bigint => f.write_str("bigint"),
            CqlType::Blob => f.write_str("blob"),
            CqlType::Boolean => f.write_str("boolean"),
            CqlType::Counter => f.write_str("counter"),
            CqlType::Decimal => f.write_str("decimal"),
            CqlType::Double => f.write_str("double"),
            CqlType::Float => f.write_str("float"),
            CqlType::Int => f.write_str("int"),
            CqlType::Text => f.write_str("text"),
            CqlType::Timestamp => f.write_str("timestamp"),
            CqlType::Uuid => f.write_str("uuid"),
            CqlType::Varchar => f.write_str("varchar"),
            CqlType::Varint => f.write_str("varint"),
            CqlType::Timeuuid => f.write_str("timeuuid"),
            CqlType::Inet => f.write_str("inet"),
            CqlType::Date => f.write_str("date"),
            CqlType::Time => f.write_str("time"),
            CqlType::Smallint => f.write_str("smallint"),
            CqlType::Tinyint => f.write_str("tinyint"),
            CqlType::List(elem) => write!(f, "list<{elem}>"),
            CqlType::Set(elem) => write!(f, "set<{elem}>"),
            CqlType::Map(key, value) => write!(f, "map<{key}, {value}>"),
            CqlType::Tuple(elems) => {
                f.write_str("tuple<")?;
                for (i, elem) in elems.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{elem}")?;
                }
                f.write_str(">")
            }
            CqlType::Udt(udt) => write!(f, "{}.{}", udt.keyspace, udt.name),
            CqlType::Custom(class) => write!(f, "'{class}'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn short_reads_fail_cleanly_on_truncation() {
        let mut buf = &[0u8, 5, b'a'][..];
        let err = read_string(&mut buf).unwrap_err();
        assert!(matches!(err, ProtoError::Truncated { needed: 4, .. }));
    }

    #[test]
    fn bytes_negative_length_is_null() {
        let mut buf = BytesMut::new();
        write_bytes(&mut buf, None);
        assert_eq!(read_bytes(&mut buf.freeze()).unwrap(), None);
    }

    #[test]
    fn inet_round_trips_v4_and_v6() {
        for addr in ["127.0.0.1:9042", "[2001:db8::1]:9042"] {
            let addr: SocketAddr = addr.parse().unwrap();
            let mut buf = BytesMut::new();
            write_inet(&mut buf, addr);
            assert_eq!(read_inet(&mut buf.freeze()).unwrap(), addr);
        }
    }

    #[test]
    fn nested_type_descriptor_round_trips() {
        let ty = CqlType::map(
            CqlType::Text,
            CqlType::list(CqlType::Tuple(vec![CqlType::Int, CqlType::Inet])),
        );
        let mut buf = BytesMut::new();
        ty.write(&mut buf);
        let parsed = CqlType::parse(&mut buf.freeze()).unwrap();
        assert_eq!(parsed, ty);
        assert_eq!(parsed.to_string(), "map<text, list<tuple<int, inet>>>");
    }

    #[test]
    fn udt_descriptor_round_trips() {
        let ty = CqlType::Udt(UdtType {
            keyspace: "ks".into(),
            name: "address".into(),
            fields: vec![
                ("street".into(), CqlType::Text),
                ("zip".into(), CqlType::Int),
            ],
        });
        let mut buf = BytesMut::new();
        ty.write(&mut buf);
        assert_eq!(CqlType::parse(&mut buf.freeze()).unwrap(), ty);
    }
}
