//! Synthesized codecs: collections, tuples, UDTs and custom pass-through.
//!
//! These are constructed by factory functions (from the registry or directly
//! by users) rather than registered; their declared wire and driver types are
//! derived from their element codecs, which makes the registry's
//! post-synthesis verification a plain equality check.

use std::sync::Arc;

use basalt_proto::types::{CqlType, UdtType};
use basalt_proto::ProtocolVersion;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::literal::{bad_literal, quote, split_elements, split_pair, strip_brackets, unquote};
use super::{bad_cell, mismatch, Codec, CodecRef, CqlValue, RustType};
use crate::errors::CodecError;

/// Codec for `list<E>` built from an element codec.
pub fn list(elem: CodecRef) -> CodecRef {
    Arc::new(ListCodec {
        cql: CqlType::list(elem.cql_type().clone()),
        rust: RustType::list(elem.rust_type().clone()),
        elem,
    })
}

/// Codec for `set<E>` built from an element codec.
pub fn set(elem: CodecRef) -> CodecRef {
    Arc::new(SetCodec {
        cql: CqlType::set(elem.cql_type().clone()),
        rust: RustType::set(elem.rust_type().clone()),
        elem,
    })
}

/// Codec for `map<K, V>` built from key and value codecs.
pub fn map(key: CodecRef, value: CodecRef) -> CodecRef {
    Arc::new(MapCodec {
        cql: CqlType::map(key.cql_type().clone(), value.cql_type().clone()),
        rust: RustType::map(key.rust_type().clone(), value.rust_type().clone()),
        key,
        value,
    })
}

/// Structural codec for a tuple wire descriptor.
pub fn tuple(ty: Vec<CqlType>, elems: Vec<CodecRef>) -> CodecRef {
    debug_assert_eq!(ty.len(), elems.len());
    Arc::new(TupleCodec {
        cql: CqlType::Tuple(ty),
        rust: RustType::Tuple,
        elems,
    })
}

/// Structural codec for a UDT wire descriptor.
pub fn udt(ty: UdtType, fields: Vec<CodecRef>) -> CodecRef {
    debug_assert_eq!(ty.fields.len(), fields.len());
    Arc::new(UdtCodec {
        cql: CqlType::Udt(ty),
        rust: RustType::Udt,
        fields,
    })
}

/// Raw pass-through codec for a custom (non-CQL) type.
pub fn custom(class: impl Into<String>) -> CodecRef {
    let class = class.into();
    Arc::new(CustomCodec {
        cql: CqlType::Custom(class.clone()),
        rust: RustType::Bytes,
        class,
    })
}

fn write_count(buf: &mut BytesMut, count: usize, version: ProtocolVersion) {
    if version.uses_int_collection_len() {
        buf.put_i32(count as i32);
    } else {
        buf.put_u16(count as u16);
    }
}

fn read_count(
    ty: &CqlType,
    buf: &mut &[u8],
    version: ProtocolVersion,
) -> Result<usize, CodecError> {
    if version.uses_int_collection_len() {
        if buf.remaining() < 4 {
            return Err(bad_cell(ty, "truncated element count"));
        }
        let count = buf.get_i32();
        if count < 0 {
            return Err(bad_cell(ty, format!("negative element count {count}")));
        }
        Ok(count as usize)
    } else {
        if buf.remaining() < 2 {
            return Err(bad_cell(ty, "truncated element count"));
        }
        Ok(buf.get_u16() as usize)
    }
}

fn write_element(buf: &mut BytesMut, raw: &[u8], version: ProtocolVersion) {
    if version.uses_int_collection_len() {
        buf.put_i32(raw.len() as i32);
    } else {
        buf.put_u16(raw.len() as u16);
    }
    buf.put_slice(raw);
}

/// Read one element cell; a negative length (v3+) encodes null.
fn read_element<'a>(
    ty: &CqlType,
    buf: &mut &'a [u8],
    version: ProtocolVersion,
) -> Result<Option<&'a [u8]>, CodecError> {
    let len = if version.uses_int_collection_len() {
        if buf.remaining() < 4 {
            return Err(bad_cell(ty, "truncated element length"));
        }
        let len = buf.get_i32();
        if len < 0 {
            return Ok(None);
        }
        len as usize
    } else {
        if buf.remaining() < 2 {
            return Err(bad_cell(ty, "truncated element length"));
        }
        buf.get_u16() as usize
    };
    if buf.remaining() < len {
        return Err(bad_cell(ty, "truncated element body"));
    }
    let current: &'a [u8] = *buf;
    let (head, tail) = current.split_at(len);
    *buf = tail;
    Ok(Some(head))
}

fn serialize_sequence(
    elem: &CodecRef,
    items: &[CqlValue],
    version: ProtocolVersion,
) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    write_count(&mut buf, items.len(), version);
    for item in items {
        let raw = elem.serialize(item, version)?;
        write_element(&mut buf, &raw, version);
    }
    Ok(buf.freeze())
}

fn deserialize_sequence(
    ty: &CqlType,
    elem: &CodecRef,
    bytes: &[u8],
    version: ProtocolVersion,
) -> Result<Vec<CqlValue>, CodecError> {
    let mut buf = bytes;
    let count = read_count(ty, &mut buf, version)?;
    let mut items = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let raw = read_element(ty, &mut buf, version)?
            .ok_or_else(|| bad_cell(ty, "null element in collection"))?;
        items.push(elem.deserialize(raw, version)?);
    }
    Ok(items)
}

#[derive(Debug)]
struct ListCodec {
    cql: CqlType,
    rust: RustType,
    elem: CodecRef,
}

impl Codec for ListCodec {
    fn cql_type(&self) -> &CqlType {
        &self.cql
    }

    fn rust_type(&self) -> &RustType {
        &self.rust
    }

    fn accepts_value(&self, value: &CqlValue) -> bool {
        match value {
            CqlValue::List(items) => items
                .first()
                .map_or(true, |item| self.elem.accepts_value(item)),
            _ => false,
        }
    }

    fn serialize(&self, value: &CqlValue, version: ProtocolVersion) -> Result<Bytes, CodecError> {
        match value {
            CqlValue::List(items) => serialize_sequence(&self.elem, items, version),
            other => Err(mismatch(self, other)),
        }
    }

    fn deserialize(&self, bytes: &[u8], version: ProtocolVersion) -> Result<CqlValue, CodecError> {
        Ok(CqlValue::List(deserialize_sequence(
            &self.cql, &self.elem, bytes, version,
        )?))
    }

    fn format(&self, value: &CqlValue) -> Result<String, CodecError> {
        match value {
            CqlValue::List(items) => {
                let parts: Result<Vec<_>, _> =
                    items.iter().map(|item| self.elem.format(item)).collect();
                Ok(format!("[{}]", parts?.join(", ")))
            }
            other => Err(mismatch(self, other)),
        }
    }

    fn parse(&self, literal: &str) -> Result<CqlValue, CodecError> {
        let body = strip_brackets(literal, '[', ']', "list")
            .map_err(|detail| bad_literal(&self.cql, literal, detail))?;
        let parts =
            split_elements(body).map_err(|detail| bad_literal(&self.cql, literal, detail))?;
        let items: Result<Vec<_>, _> = parts.iter().map(|part| self.elem.parse(part)).collect();
        Ok(CqlValue::List(items?))
    }
}

#[derive(Debug)]
struct SetCodec {
    cql: CqlType,
    rust: RustType,
    elem: CodecRef,
}

impl Codec for SetCodec {
    fn cql_type(&self) -> &CqlType {
        &self.cql
    }

    fn rust_type(&self) -> &RustType {
        &self.rust
    }

    fn accepts_value(&self, value: &CqlValue) -> bool {
        match value {
            CqlValue::Set(items) => items
                .first()
                .map_or(true, |item| self.elem.accepts_value(item)),
            _ => false,
        }
    }

    fn serialize(&self, value: &CqlValue, version: ProtocolVersion) -> Result<Bytes, CodecError> {
        match value {
            CqlValue::Set(items) => serialize_sequence(&self.elem, items, version),
            other => Err(mismatch(self, other)),
        }
    }

    fn deserialize(&self, bytes: &[u8], version: ProtocolVersion) -> Result<CqlValue, CodecError> {
        Ok(CqlValue::Set(deserialize_sequence(
            &self.cql, &self.elem, bytes, version,
        )?))
    }

    fn format(&self, value: &CqlValue) -> Result<String, CodecError> {
        match value {
            CqlValue::Set(items) => {
                let parts: Result<Vec<_>, _> =
                    items.iter().map(|item| self.elem.format(item)).collect();
                Ok(format!("{{{}}}", parts?.join(", ")))
            }
            other => Err(mismatch(self, other)),
        }
    }

    fn parse(&self, literal: &str) -> Result<CqlValue, CodecError> {
        let body = strip_brackets(literal, '{', '}', "set")
            .map_err(|detail| bad_literal(&self.cql, literal, detail))?;
        let parts =
            split_elements(body).map_err(|detail| bad_literal(&self.cql, literal, detail))?;
        let items: Result<Vec<_>, _> = parts.iter().map(|part| self.elem.parse(part)).collect();
        Ok(CqlValue::Set(items?))
    }
}

#[derive(Debug)]
struct MapCodec {
    cql: CqlType,
    rust: RustType,
    key: CodecRef,
    value: CodecRef,
}

impl Codec for MapCodec {
    fn cql_type(&self) -> &CqlType {
        &self.cql
    }

    fn rust_type(&self) -> &RustType {
        &self.rust
    }

    fn accepts_value(&self, value: &CqlValue) -> bool {
        match value {
            CqlValue::Map(entries) => entries.first().map_or(true, |(k, v)| {
                self.key.accepts_value(k) && self.value.accepts_value(v)
            }),
            _ => false,
        }
    }

    fn serialize(&self, value: &CqlValue, version: ProtocolVersion) -> Result<Bytes, CodecError> {
        match value {
            CqlValue::Map(entries) => {
                let mut buf = BytesMut::new();
                write_count(&mut buf, entries.len(), version);
                for (k, v) in entries {
                    let raw_key = self.key.serialize(k, version)?;
                    write_element(&mut buf, &raw_key, version);
                    let raw_value = self.value.serialize(v, version)?;
                    write_element(&mut buf, &raw_value, version);
                }
                Ok(buf.freeze())
            }
            other => Err(mismatch(self, other)),
        }
    }

    fn deserialize(&self, bytes: &[u8], version: ProtocolVersion) -> Result<CqlValue, CodecError> {
        let mut buf = bytes;
        let count = read_count(&self.cql, &mut buf, version)?;
        let mut entries = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let raw_key = read_element(&self.cql, &mut buf, version)?
                .ok_or_else(|| bad_cell(&self.cql, "null map key"))?;
            let raw_value = read_element(&self.cql, &mut buf, version)?
                .ok_or_else(|| bad_cell(&self.cql, "null map value"))?;
            entries.push((
                self.key.deserialize(raw_key, version)?,
                self.value.deserialize(raw_value, version)?,
            ));
        }
        Ok(CqlValue::Map(entries))
    }

    fn format(&self, value: &CqlValue) -> Result<String, CodecError> {
        match value {
            CqlValue::Map(entries) => {
                let mut parts = Vec::with_capacity(entries.len());
                for (k, v) in entries {
                    parts.push(format!("{}: {}", self.key.format(k)?, self.value.format(v)?));
                }
                Ok(format!("{{{}}}", parts.join(", ")))
            }
            other => Err(mismatch(self, other)),
        }
    }

    fn parse(&self, literal: &str) -> Result<CqlValue, CodecError> {
        let body = strip_brackets(literal, '{', '}', "map")
            .map_err(|detail| bad_literal(&self.cql, literal, detail))?;
        let parts =
            split_elements(body).map_err(|detail| bad_literal(&self.cql, literal, detail))?;
        let mut entries = Vec::with_capacity(parts.len());
        for part in parts {
            let (raw_key, raw_value) =
                split_pair(part).map_err(|detail| bad_literal(&self.cql, literal, detail))?;
            entries.push((self.key.parse(raw_key)?, self.value.parse(raw_value)?));
        }
        Ok(CqlValue::Map(entries))
    }
}

/// Tuple and UDT cells always use int-length elements, regardless of version.
fn read_struct_field<'a>(
    ty: &CqlType,
    buf: &mut &'a [u8],
) -> Result<Option<&'a [u8]>, CodecError> {
    if buf.remaining() < 4 {
        return Err(bad_cell(ty, "truncated field length"));
    }
    let len = buf.get_i32();
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(bad_cell(ty, "truncated field body"));
    }
    let current: &'a [u8] = *buf;
    let (head, tail) = current.split_at(len);
    *buf = tail;
    Ok(Some(head))
}

#[derive(Debug)]
struct TupleCodec {
    cql: CqlType,
    rust: RustType,
    elems: Vec<CodecRef>,
}

impl Codec for TupleCodec {
    fn cql_type(&self) -> &CqlType {
        &self.cql
    }

    fn rust_type(&self) -> &RustType {
        &self.rust
    }

    fn accepts_value(&self, value: &CqlValue) -> bool {
        match value {
            CqlValue::Tuple(items) => {
                items.len() == self.elems.len()
                    && items.iter().zip(&self.elems).all(|(item, codec)| {
                        item.as_ref().map_or(true, |v| codec.accepts_value(v))
                    })
            }
            _ => false,
        }
    }

    fn serialize(&self, value: &CqlValue, version: ProtocolVersion) -> Result<Bytes, CodecError> {
        let CqlValue::Tuple(items) = value else {
            return Err(mismatch(self, value));
        };
        if items.len() != self.elems.len() {
            return Err(bad_cell(
                &self.cql,
                format!("expected {} elements, got {}", self.elems.len(), items.len()),
            ));
        }
        let mut buf = BytesMut::new();
        for (item, codec) in items.iter().zip(&self.elems) {
            match item {
                Some(v) => {
                    let raw = codec.serialize(v, version)?;
                    buf.put_i32(raw.len() as i32);
                    buf.put_slice(&raw);
                }
                None => buf.put_i32(-1),
            }
        }
        Ok(buf.freeze())
    }

    fn deserialize(&self, bytes: &[u8], version: ProtocolVersion) -> Result<CqlValue, CodecError> {
        let mut buf = bytes;
        let mut items = Vec::with_capacity(self.elems.len());
        for codec in &self.elems {
            // A short cell leaves trailing fields null.
            if !buf.has_remaining() {
                items.push(None);
                continue;
            }
            match read_struct_field(&self.cql, &mut buf)? {
                Some(raw) => items.push(Some(codec.deserialize(raw, version)?)),
                None => items.push(None),
            }
        }
        Ok(CqlValue::Tuple(items))
    }

    fn format(&self, value: &CqlValue) -> Result<String, CodecError> {
        let CqlValue::Tuple(items) = value else {
            return Err(mismatch(self, value));
        };
        let mut parts = Vec::with_capacity(items.len());
        for (item, codec) in items.iter().zip(&self.elems) {
            parts.push(match item {
                Some(v) => codec.format(v)?,
                None => "null".to_string(),
            });
        }
        Ok(format!("({})", parts.join(", ")))
    }

    fn parse(&self, literal: &str) -> Result<CqlValue, CodecError> {
        let body = strip_brackets(literal, '(', ')', "tuple")
            .map_err(|detail| bad_literal(&self.cql, literal, detail))?;
        let parts =
            split_elements(body).map_err(|detail| bad_literal(&self.cql, literal, detail))?;
        if parts.len() != self.elems.len() {
            return Err(bad_literal(
                &self.cql,
                literal,
                format!("expected {} elements, got {}", self.elems.len(), parts.len()),
            ));
        }
        let mut items = Vec::with_capacity(parts.len());
        for (part, codec) in parts.iter().zip(&self.elems) {
            items.push(if part.eq_ignore_ascii_case("null") {
                None
            } else {
                Some(codec.parse(part)?)
            });
        }
        Ok(CqlValue::Tuple(items))
    }
}

#[derive(Debug)]
struct UdtCodec {
    cql: CqlType,
    rust: RustType,
    fields: Vec<CodecRef>,
}

impl UdtCodec {
    fn descriptor(&self) -> &UdtType {
        match &self.cql {
            CqlType::Udt(udt) => udt,
            _ => unreachable!("UdtCodec always holds a udt descriptor"),
        }
    }
}

impl Codec for UdtCodec {
    fn cql_type(&self) -> &CqlType {
        &self.cql
    }

    fn rust_type(&self) -> &RustType {
        &self.rust
    }

    fn accepts_value(&self, value: &CqlValue) -> bool {
        match value {
            CqlValue::Udt { type_name, fields } => {
                let descriptor = self.descriptor();
                type_name == &descriptor.name && fields.len() == descriptor.fields.len()
            }
            _ => false,
        }
    }

    fn serialize(&self, value: &CqlValue, version: ProtocolVersion) -> Result<Bytes, CodecError> {
        let CqlValue::Udt { fields, .. } = value else {
            return Err(mismatch(self, value));
        };
        if fields.len() != self.fields.len() {
            return Err(bad_cell(
                &self.cql,
                format!("expected {} fields, got {}", self.fields.len(), fields.len()),
            ));
        }
        let mut buf = BytesMut::new();
        for ((_, item), codec) in fields.iter().zip(&self.fields) {
            match item {
                Some(v) => {
                    let raw = codec.serialize(v, version)?;
                    buf.put_i32(raw.len() as i32);
                    buf.put_slice(&raw);
                }
                None => buf.put_i32(-1),
            }
        }
        Ok(buf.freeze())
    }

    fn deserialize(&self, bytes: &[u8], version: ProtocolVersion) -> Result<CqlValue, CodecError> {
        let descriptor = self.descriptor();
        let mut buf = bytes;
        let mut fields = Vec::with_capacity(self.fields.len());
        for ((name, _), codec) in descriptor.fields.iter().zip(&self.fields) {
            // Cells written against an older type definition stop early.
            if !buf.has_remaining() {
                fields.push((name.clone(), None));
                continue;
            }
            match read_struct_field(&self.cql, &mut buf)? {
                Some(raw) => fields.push((name.clone(), Some(codec.deserialize(raw, version)?))),
                None => fields.push((name.clone(), None)),
            }
        }
        Ok(CqlValue::Udt {
            type_name: descriptor.name.clone(),
            fields,
        })
    }

    fn format(&self, value: &CqlValue) -> Result<String, CodecError> {
        let CqlValue::Udt { fields, .. } = value else {
            return Err(mismatch(self, value));
        };
        let mut parts = Vec::with_capacity(fields.len());
        for ((name, item), codec) in fields.iter().zip(&self.fields) {
            parts.push(match item {
                Some(v) => format!("{name}: {}", codec.format(v)?),
                None => format!("{name}: null"),
            });
        }
        Ok(format!("{{{}}}", parts.join(", ")))
    }

    fn parse(&self, literal: &str) -> Result<CqlValue, CodecError> {
        let descriptor = self.descriptor();
        let body = strip_brackets(literal, '{', '}', "udt")
            .map_err(|detail| bad_literal(&self.cql, literal, detail))?;
        let parts =
            split_elements(body).map_err(|detail| bad_literal(&self.cql, literal, detail))?;
        let mut fields: Vec<(String, Option<CqlValue>)> = descriptor
            .fields
            .iter()
            .map(|(name, _)| (name.clone(), None))
            .collect();
        for part in parts {
            let (raw_name, raw_value) =
                split_pair(part).map_err(|detail| bad_literal(&self.cql, literal, detail))?;
            let name = unquote(raw_name).unwrap_or_else(|| raw_name.to_string());
            let index = descriptor
                .fields
                .iter()
                .position(|(field, _)| field == &name)
                .ok_or_else(|| {
                    bad_literal(&self.cql, literal, format!("unknown field {name:?}"))
                })?;
            if !raw_value.eq_ignore_ascii_case("null") {
                fields[index].1 = Some(self.fields[index].parse(raw_value)?);
            }
        }
        Ok(CqlValue::Udt {
            type_name: descriptor.name.clone(),
            fields,
        })
    }
}

#[derive(Debug)]
struct CustomCodec {
    cql: CqlType,
    rust: RustType,
    class: String,
}

impl Codec for CustomCodec {
    fn cql_type(&self) -> &CqlType {
        &self.cql
    }

    fn rust_type(&self) -> &RustType {
        &self.rust
    }

    fn accepts_value(&self, value: &CqlValue) -> bool {
        match value {
            CqlValue::Blob(_) => true,
            CqlValue::Custom { class, .. } => class == &self.class,
            _ => false,
        }
    }

    fn serialize(&self, value: &CqlValue, _: ProtocolVersion) -> Result<Bytes, CodecError> {
        match value {
            CqlValue::Blob(data) => Ok(Bytes::copy_from_slice(data)),
            CqlValue::Custom { class, data } if class == &self.class => {
                Ok(Bytes::copy_from_slice(data))
            }
            other => Err(mismatch(self, other)),
        }
    }

    fn deserialize(&self, bytes: &[u8], _: ProtocolVersion) -> Result<CqlValue, CodecError> {
        Ok(CqlValue::Custom {
            class: self.class.clone(),
            data: bytes.to_vec(),
        })
    }

    fn format(&self, value: &CqlValue) -> Result<String, CodecError> {
        let data = match value {
            CqlValue::Blob(data) => data,
            CqlValue::Custom { class, data } if class == &self.class => data,
            other => return Err(mismatch(self, other)),
        };
        let mut out = String::with_capacity(2 + data.len() * 2);
        out.push_str("0x");
        for byte in data {
            out.push_str(&format!("{byte:02x}"));
        }
        Ok(out)
    }

    fn parse(&self, literal: &str) -> Result<CqlValue, CodecError> {
        let hex = literal
            .trim()
            .strip_prefix("0x")
            .ok_or_else(|| bad_literal(&self.cql, literal, "missing 0x prefix"))?;
        let data = super::primitives::parse_hex(hex)
            .ok_or_else(|| bad_literal(&self.cql, literal, "malformed hex"))?;
        Ok(CqlValue::Custom {
            class: self.class.clone(),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::primitives;
    use super::*;

    #[test]
    fn list_round_trips_with_version_dependent_lengths() {
        let codec = list(primitives::int());
        let value = CqlValue::List(vec![CqlValue::Int(1), CqlValue::Int(-2), CqlValue::Int(3)]);
        for version in [ProtocolVersion::V2, ProtocolVersion::V4] {
            let bytes = codec.serialize(&value, version).unwrap();
            assert_eq!(codec.deserialize(&bytes, version).unwrap(), value);
        }
        // v1/v2 use short lengths, so the encoding is smaller.
        let v2 = codec.serialize(&value, ProtocolVersion::V2).unwrap();
        let v4 = codec.serialize(&value, ProtocolVersion::V4).unwrap();
        assert!(v2.len() < v4.len());
    }

    #[test]
    fn map_round_trips_and_formats() {
        let codec = map(primitives::varchar(), primitives::int());
        let value = CqlValue::Map(vec![
            (CqlValue::Text("a".into()), CqlValue::Int(1)),
            (CqlValue::Text("b".into()), CqlValue::Int(2)),
        ]);
        let bytes = codec.serialize(&value, ProtocolVersion::V4).unwrap();
        assert_eq!(codec.deserialize(&bytes, ProtocolVersion::V4).unwrap(), value);
        let formatted = codec.format(&value).unwrap();
        assert_eq!(formatted, "{'a': 1, 'b': 2}");
        assert_eq!(codec.parse(&formatted).unwrap(), value);
    }

    #[test]
    fn tuple_handles_null_elements() {
        let codec = tuple(
            vec![CqlType::Int, CqlType::Varchar],
            vec![primitives::int(), primitives::varchar()],
        );
        let value = CqlValue::Tuple(vec![Some(CqlValue::Int(9)), None]);
        let bytes = codec.serialize(&value, ProtocolVersion::V4).unwrap();
        assert_eq!(codec.deserialize(&bytes, ProtocolVersion::V4).unwrap(), value);
        assert_eq!(codec.format(&value).unwrap(), "(9, null)");
        assert_eq!(codec.parse("(9, null)").unwrap(), value);
    }

    #[test]
    fn udt_round_trips_and_tolerates_short_cells() {
        let descriptor = UdtType {
            keyspace: "ks".into(),
            name: "address".into(),
            fields: vec![
                ("street".into(), CqlType::Varchar),
                ("zip".into(), CqlType::Int),
            ],
        };
        let codec = udt(
            descriptor,
            vec![primitives::varchar(), primitives::int()],
        );
        let value = CqlValue::Udt {
            type_name: "address".into(),
            fields: vec![
                ("street".into(), Some(CqlValue::Text("main st".into()))),
                ("zip".into(), Some(CqlValue::Int(12345))),
            ],
        };
        let bytes = codec.serialize(&value, ProtocolVersion::V4).unwrap();
        assert_eq!(codec.deserialize(&bytes, ProtocolVersion::V4).unwrap(), value);

        // Drop the trailing field: it must come back as null.
        let truncated = &bytes[..4 + 7];
        let CqlValue::Udt { fields, .. } = codec
            .deserialize(truncated, ProtocolVersion::V4)
            .unwrap()
        else {
            panic!("expected udt");
        };
        assert_eq!(fields[1], ("zip".into(), None));
    }

    #[test]
    fn nested_collections_round_trip() {
        let codec = set(list(primitives::varchar()));
        let value = CqlValue::Set(vec![
            CqlValue::List(vec![CqlValue::Text("x".into())]),
            CqlValue::List(vec![]),
        ]);
        for version in [ProtocolVersion::V2, ProtocolVersion::V4] {
            let bytes = codec.serialize(&value, version).unwrap();
            assert_eq!(codec.deserialize(&bytes, version).unwrap(), value);
        }
    }

    #[test]
    fn custom_codec_passes_bytes_through() {
        let codec = custom("org.example.Custom");
        let bytes = codec
            .serialize(&CqlValue::Blob(vec![1, 2, 3]), ProtocolVersion::V4)
            .unwrap();
        let back = codec.deserialize(&bytes, ProtocolVersion::V4).unwrap();
        let CqlValue::Custom { class, data } = back else {
            panic!("expected custom value");
        };
        assert_eq!(class, "org.example.Custom");
        assert_eq!(data, vec![1, 2, 3]);
    }
}
