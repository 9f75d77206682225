//! Codecs for the native (non-parameterized) wire types.
//!
//! Declaration order in [`default_codecs`] is the registry precedence order:
//! varchar is declared before ascii and uuid before timeuuid so they win when
//! only a driver type (or only a value) is available.

use std::net::IpAddr;
use std::sync::Arc;

use basalt_proto::types::CqlType;
use basalt_proto::ProtocolVersion;
use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use super::literal::{
    bad_literal, civil_from_days, days_from_civil, quote, unquote,
};
use super::{bad_cell, mismatch, Codec, CodecRef, CqlValue, RustType};
use crate::errors::CodecError;

/// Wire offset of the date epoch: day 0 on the wire is 2^31.
pub const DATE_EPOCH_OFFSET: i64 = 1 << 31;

/// The built-in codecs, in precedence order.
pub fn default_codecs() -> Vec<CodecRef> {
    vec![
        blob(),
        boolean(),
        smallint(),
        tinyint(),
        int(),
        bigint(),
        counter(),
        double(),
        float(),
        varint(),
        decimal(),
        varchar(),
        ascii(),
        timestamp(),
        date(),
        time(),
        uuid_codec(),
        timeuuid(),
        inet(),
    ]
}

pub fn blob() -> CodecRef {
    Arc::new(BlobCodec {
        cql: CqlType::Blob,
        rust: RustType::Bytes,
    })
}

pub fn boolean() -> CodecRef {
    Arc::new(BooleanCodec {
        cql: CqlType::Boolean,
        rust: RustType::Bool,
    })
}

pub fn tinyint() -> CodecRef {
    Arc::new(TinyintCodec {
        cql: CqlType::Tinyint,
        rust: RustType::I8,
    })
}

pub fn smallint() -> CodecRef {
    Arc::new(SmallintCodec {
        cql: CqlType::Smallint,
        rust: RustType::I16,
    })
}

pub fn int() -> CodecRef {
    Arc::new(IntCodec {
        cql: CqlType::Int,
        rust: RustType::I32,
    })
}

pub fn bigint() -> CodecRef {
    Arc::new(BigintCodec {
        cql: CqlType::Bigint,
        rust: RustType::I64,
    })
}

pub fn counter() -> CodecRef {
    Arc::new(CounterCodec {
        cql: CqlType::Counter,
        rust: RustType::I64,
    })
}

pub fn double() -> CodecRef {
    Arc::new(DoubleCodec {
        cql: CqlType::Double,
        rust: RustType::F64,
    })
}

pub fn float() -> CodecRef {
    Arc::new(FloatCodec {
        cql: CqlType::Float,
        rust: RustType::F32,
    })
}

pub fn varint() -> CodecRef {
    Arc::new(VarintCodec {
        cql: CqlType::Varint,
        rust: RustType::Varint,
    })
}

pub fn decimal() -> CodecRef {
    Arc::new(DecimalCodec {
        cql: CqlType::Decimal,
        rust: RustType::Decimal,
    })
}

pub fn varchar() -> CodecRef {
    Arc::new(TextCodec {
        cql: CqlType::Varchar,
        rust: RustType::String,
    })
}

/// `text` is an alias of `varchar` on the wire; same codec, different tag.
pub fn text() -> CodecRef {
    Arc::new(TextCodec {
        cql: CqlType::Text,
        rust: RustType::String,
    })
}

pub fn ascii() -> CodecRef {
    Arc::new(AsciiCodec {
        cql: CqlType::Ascii,
        rust: RustType::String,
    })
}

pub fn timestamp() -> CodecRef {
    Arc::new(TimestampCodec {
        cql: CqlType::Timestamp,
        rust: RustType::Timestamp,
    })
}

pub fn date() -> CodecRef {
    Arc::new(DateCodec {
        cql: CqlType::Date,
        rust: RustType::Date,
    })
}

pub fn time() -> CodecRef {
    Arc::new(TimeCodec {
        cql: CqlType::Time,
        rust: RustType::Time,
    })
}

pub fn uuid_codec() -> CodecRef {
    Arc::new(UuidCodec {
        cql: CqlType::Uuid,
        rust: RustType::Uuid,
        timeuuid_only: false,
    })
}

pub fn timeuuid() -> CodecRef {
    Arc::new(UuidCodec {
        cql: CqlType::Timeuuid,
        rust: RustType::Uuid,
        timeuuid_only: true,
    })
}

pub fn inet() -> CodecRef {
    Arc::new(InetCodec {
        cql: CqlType::Inet,
        rust: RustType::IpAddr,
    })
}

/// Decode an even-length ascii-hex string.
pub(crate) fn parse_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let raw = hex.as_bytes();
    let mut data = Vec::with_capacity(raw.len() / 2);
    for pair in raw.chunks(2) {
        let digit = |b: u8| (b as char).to_digit(16).unwrap_or(0) as u8;
        data.push(digit(pair[0]) << 4 | digit(pair[1]));
    }
    Some(data)
}

fn fixed_len<'a>(
    ty: &CqlType,
    bytes: &'a [u8],
    len: usize,
) -> Result<&'a [u8], CodecError> {
    if bytes.len() != len {
        return Err(bad_cell(
            ty,
            format!("expected {len} bytes, got {}", bytes.len()),
        ));
    }
    Ok(bytes)
}

macro_rules! codec_descriptor {
    () => {
        fn cql_type(&self) -> &CqlType {
            &self.cql
        }

        fn rust_type(&self) -> &RustType {
            &self.rust
        }
    };
}

#[derive(Debug)]
struct BlobCodec {
    cql: CqlType,
    rust: RustType,
}

impl Codec for BlobCodec {
    codec_descriptor!();

    fn accepts_value(&self, value: &CqlValue) -> bool {
        matches!(value, CqlValue::Blob(_))
    }

    fn serialize(&self, value: &CqlValue, _: ProtocolVersion) -> Result<Bytes, CodecError> {
        match value {
            CqlValue::Blob(data) => Ok(Bytes::copy_from_slice(data)),
            other => Err(mismatch(self, other)),
        }
    }

    fn deserialize(&self, bytes: &[u8], _: ProtocolVersion) -> Result<CqlValue, CodecError> {
        Ok(CqlValue::Blob(bytes.to_vec()))
    }

    fn format(&self, value: &CqlValue) -> Result<String, CodecError> {
        match value {
            CqlValue::Blob(data) => {
                let mut out = String::with_capacity(2 + data.len() * 2);
                out.push_str("0x");
                for byte in data {
                    out.push_str(&format!("{byte:02x}"));
                }
                Ok(out)
            }
            other => Err(mismatch(self, other)),
        }
    }

    fn parse(&self, literal: &str) -> Result<CqlValue, CodecError> {
        let hex = literal
            .strip_prefix("0x")
            .or_else(|| literal.strip_prefix("0X"))
            .ok_or_else(|| bad_literal(&self.cql, literal, "missing 0x prefix"))?;
        parse_hex(hex)
            .map(CqlValue::Blob)
            .ok_or_else(|| bad_literal(&self.cql, literal, "malformed hex"))
    }
}

#[derive(Debug)]
struct BooleanCodec {
    cql: CqlType,
    rust: RustType,
}

impl Codec for BooleanCodec {
    codec_descriptor!();

    fn accepts_value(&self, value: &CqlValue) -> bool {
        matches!(value, CqlValue::Boolean(_))
    }

    fn serialize(&self, value: &CqlValue, _: ProtocolVersion) -> Result<Bytes, CodecError> {
        match value {
            CqlValue::Boolean(flag) => Ok(Bytes::from(vec![u8::from(*flag)])),
            other => Err(mismatch(self, other)),
        }
    }

    fn deserialize(&self, bytes: &[u8], _: ProtocolVersion) -> Result<CqlValue, CodecError> {
        let raw = fixed_len(&self.cql, bytes, 1)?;
        Ok(CqlValue::Boolean(raw[0] != 0))
    }

    fn format(&self, value: &CqlValue) -> Result<String, CodecError> {
        match value {
            CqlValue::Boolean(flag) => Ok(flag.to_string()),
            other => Err(mismatch(self, other)),
        }
    }

    fn parse(&self, literal: &str) -> Result<CqlValue, CodecError> {
        match literal.to_ascii_lowercase().as_str() {
            "true" => Ok(CqlValue::Boolean(true)),
            "false" => Ok(CqlValue::Boolean(false)),
            _ => Err(bad_literal(&self.cql, literal, "expected true or false")),
        }
    }
}

macro_rules! fixed_int_codec {
    ($name:ident, $variant:ident, $prim:ty, $len:expr, $put:ident) => {
        #[derive(Debug)]
        struct $name {
            cql: CqlType,
            rust: RustType,
        }

        impl Codec for $name {
            codec_descriptor!();

            fn accepts_value(&self, value: &CqlValue) -> bool {
                matches!(value, CqlValue::$variant(_))
            }

            fn serialize(
                &self,
                value: &CqlValue,
                _: ProtocolVersion,
            ) -> Result<Bytes, CodecError> {
                match value {
                    CqlValue::$variant(v) => {
                        let mut buf = BytesMut::with_capacity($len);
                        buf.$put(*v);
                        Ok(buf.freeze())
                    }
                    other => Err(mismatch(self, other)),
                }
            }

            fn deserialize(
                &self,
                bytes: &[u8],
                _: ProtocolVersion,
            ) -> Result<CqlValue, CodecError> {
                let raw = fixed_len(&self.cql, bytes, $len)?;
                let mut arr = [0u8; $len];
                arr.copy_from_slice(raw);
                Ok(CqlValue::$variant(<$prim>::from_be_bytes(arr)))
            }

            fn format(&self, value: &CqlValue) -> Result<String, CodecError> {
                match value {
                    CqlValue::$variant(v) => Ok(v.to_string()),
                    other => Err(mismatch(self, other)),
                }
            }

            fn parse(&self, literal: &str) -> Result<CqlValue, CodecError> {
                literal
                    .trim()
                    .parse::<$prim>()
                    .map(CqlValue::$variant)
                    .map_err(|err| bad_literal(&self.cql, literal, err.to_string()))
            }
        }
    };
}

fixed_int_codec!(TinyintCodec, Tinyint, i8, 1, put_i8);
fixed_int_codec!(SmallintCodec, Smallint, i16, 2, put_i16);
fixed_int_codec!(IntCodec, Int, i32, 4, put_i32);
fixed_int_codec!(BigintCodec, Bigint, i64, 8, put_i64);

#[derive(Debug)]
struct CounterCodec {
    cql: CqlType,
    rust: RustType,
}

impl Codec for CounterCodec {
    codec_descriptor!();

    fn accepts_value(&self, value: &CqlValue) -> bool {
        matches!(value, CqlValue::Counter(_) | CqlValue::Bigint(_))
    }

    fn serialize(&self, value: &CqlValue, _: ProtocolVersion) -> Result<Bytes, CodecError> {
        let v = match value {
            CqlValue::Counter(v) | CqlValue::Bigint(v) => *v,
            other => return Err(mismatch(self, other)),
        };
        let mut buf = BytesMut::with_capacity(8);
        buf.put_i64(v);
        Ok(buf.freeze())
    }

    fn deserialize(&self, bytes: &[u8], _: ProtocolVersion) -> Result<CqlValue, CodecError> {
        let raw = fixed_len(&self.cql, bytes, 8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(raw);
        Ok(CqlValue::Counter(i64::from_be_bytes(arr)))
    }

    fn format(&self, value: &CqlValue) -> Result<String, CodecError> {
        match value {
            CqlValue::Counter(v) | CqlValue::Bigint(v) => Ok(v.to_string()),
            other => Err(mismatch(self, other)),
        }
    }

    fn parse(&self, literal: &str) -> Result<CqlValue, CodecError> {
        literal
            .trim()
            .parse::<i64>()
            .map(CqlValue::Counter)
            .map_err(|err| bad_literal(&self.cql, literal, err.to_string()))
    }
}

macro_rules! float_codec {
    ($name:ident, $variant:ident, $prim:ty, $len:expr, $put:ident) => {
        #[derive(Debug)]
        struct $name {
            cql: CqlType,
            rust: RustType,
        }

        impl Codec for $name {
            codec_descriptor!();

            fn accepts_value(&self, value: &CqlValue) -> bool {
                matches!(value, CqlValue::$variant(_))
            }

            fn serialize(
                &self,
                value: &CqlValue,
                _: ProtocolVersion,
            ) -> Result<Bytes, CodecError> {
                match value {
                    CqlValue::$variant(v) => {
                        let mut buf = BytesMut::with_capacity($len);
                        buf.$put(*v);
                        Ok(buf.freeze())
                    }
                    other => Err(mismatch(self, other)),
                }
            }

            fn deserialize(
                &self,
                bytes: &[u8],
                _: ProtocolVersion,
            ) -> Result<CqlValue, CodecError> {
                let raw = fixed_len(&self.cql, bytes, $len)?;
                let mut arr = [0u8; $len];
                arr.copy_from_slice(raw);
                Ok(CqlValue::$variant(<$prim>::from_be_bytes(arr)))
            }

            fn format(&self, value: &CqlValue) -> Result<String, CodecError> {
                match value {
                    CqlValue::$variant(v) => Ok(v.to_string()),
                    other => Err(mismatch(self, other)),
                }
            }

            fn parse(&self, literal: &str) -> Result<CqlValue, CodecError> {
                literal
                    .trim()
                    .parse::<$prim>()
                    .map(CqlValue::$variant)
                    .map_err(|err| bad_literal(&self.cql, literal, err.to_string()))
            }
        }
    };
}

float_codec!(FloatCodec, Float, f32, 4, put_f32);
float_codec!(DoubleCodec, Double, f64, 8, put_f64);

/// Minimal two's-complement big-endian encoding of an i128.
fn twos_complement_bytes(value: i128) -> Vec<u8> {
    let raw = value.to_be_bytes();
    let mut start = 0;
    while start < raw.len() - 1 {
        let redundant = (raw[start] == 0x00 && raw[start + 1] < 0x80)
            || (raw[start] == 0xFF && raw[start + 1] >= 0x80);
        if !redundant {
            break;
        }
        start += 1;
    }
    raw[start..].to_vec()
}

/// Decode a two's-complement big-endian integer if it fits in an i128.
fn int_from_twos_complement(bytes: &[u8]) -> Option<i128> {
    if bytes.is_empty() || bytes.len() > 16 {
        return None;
    }
    let negative = bytes[0] & 0x80 != 0;
    let mut arr = if negative { [0xFFu8; 16] } else { [0u8; 16] };
    arr[16 - bytes.len()..].copy_from_slice(bytes);
    Some(i128::from_be_bytes(arr))
}

#[derive(Debug)]
struct VarintCodec {
    cql: CqlType,
    rust: RustType,
}

impl Codec for VarintCodec {
    codec_descriptor!();

    fn accepts_value(&self, value: &CqlValue) -> bool {
        matches!(value, CqlValue::Varint(_))
    }

    fn serialize(&self, value: &CqlValue, _: ProtocolVersion) -> Result<Bytes, CodecError> {
        match value {
            CqlValue::Varint(bytes) => Ok(Bytes::copy_from_slice(bytes)),
            other => Err(mismatch(self, other)),
        }
    }

    fn deserialize(&self, bytes: &[u8], _: ProtocolVersion) -> Result<CqlValue, CodecError> {
        if bytes.is_empty() {
            return Err(bad_cell(&self.cql, "empty varint"));
        }
        Ok(CqlValue::Varint(bytes.to_vec()))
    }

    fn format(&self, value: &CqlValue) -> Result<String, CodecError> {
        match value {
            CqlValue::Varint(bytes) => int_from_twos_complement(bytes)
                .map(|v| v.to_string())
                .ok_or_else(|| CodecError::Unformattable {
                    cql: self.cql.to_string(),
                    detail: format!("{}-byte varint exceeds 128 bits", bytes.len()),
                }),
            other => Err(mismatch(self, other)),
        }
    }

    fn parse(&self, literal: &str) -> Result<CqlValue, CodecError> {
        literal
            .trim()
            .parse::<i128>()
            .map(|v| CqlValue::Varint(twos_complement_bytes(v)))
            .map_err(|err| bad_literal(&self.cql, literal, err.to_string()))
    }
}

#[derive(Debug)]
struct DecimalCodec {
    cql: CqlType,
    rust: RustType,
}

impl Codec for DecimalCodec {
    codec_descriptor!();

    fn accepts_value(&self, value: &CqlValue) -> bool {
        matches!(value, CqlValue::Decimal { .. })
    }

    fn serialize(&self, value: &CqlValue, _: ProtocolVersion) -> Result<Bytes, CodecError> {
        match value {
            CqlValue::Decimal { scale, unscaled } => {
                let mut buf = BytesMut::with_capacity(4 + unscaled.len());
                buf.put_i32(*scale);
                buf.put_slice(unscaled);
                Ok(buf.freeze())
            }
            other => Err(mismatch(self, other)),
        }
    }

    fn deserialize(&self, bytes: &[u8], _: ProtocolVersion) -> Result<CqlValue, CodecError> {
        if bytes.len() < 5 {
            return Err(bad_cell(&self.cql, "decimal cell shorter than 5 bytes"));
        }
        let scale = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Ok(CqlValue::Decimal {
            scale,
            unscaled: bytes[4..].to_vec(),
        })
    }

    fn format(&self, value: &CqlValue) -> Result<String, CodecError> {
        let CqlValue::Decimal { scale, unscaled } = value else {
            return Err(mismatch(self, value));
        };
        let unscaled = int_from_twos_complement(unscaled).ok_or_else(|| {
            CodecError::Unformattable {
                cql: self.cql.to_string(),
                detail: "unscaled value exceeds 128 bits".into(),
            }
        })?;
        if *scale <= 0 {
            let mut out = unscaled.to_string();
            for _ in *scale..0 {
                out.push('0');
            }
            return Ok(out);
        }
        let digits = unscaled.unsigned_abs().to_string();
        let sign = if unscaled < 0 { "-" } else { "" };
        let scale = *scale as usize;
        if digits.len() > scale {
            let split = digits.len() - scale;
            Ok(format!("{sign}{}.{}", &digits[..split], &digits[split..]))
        } else {
            Ok(format!("{sign}0.{}{}", "0".repeat(scale - digits.len()), digits))
        }
    }

    fn parse(&self, literal: &str) -> Result<CqlValue, CodecError> {
        let trimmed = literal.trim();
        let (int_part, frac_part) = match trimmed.split_once('.') {
            Some((i, f)) => (i, f),
            None => (trimmed, ""),
        };
        let joined = format!("{int_part}{frac_part}");
        let unscaled = joined
            .parse::<i128>()
            .map_err(|err| bad_literal(&self.cql, literal, err.to_string()))?;
        Ok(CqlValue::Decimal {
            scale: frac_part.len() as i32,
            unscaled: twos_complement_bytes(unscaled),
        })
    }
}

#[derive(Debug)]
struct TextCodec {
    cql: CqlType,
    rust: RustType,
}

impl Codec for TextCodec {
    codec_descriptor!();

    fn accepts_cql(&self, ty: &CqlType) -> bool {
        // text and varchar are interchangeable on the wire.
        matches!(ty, CqlType::Text | CqlType::Varchar)
    }

    fn accepts_value(&self, value: &CqlValue) -> bool {
        matches!(value, CqlValue::Text(_) | CqlValue::Ascii(_))
    }

    fn serialize(&self, value: &CqlValue, _: ProtocolVersion) -> Result<Bytes, CodecError> {
        match value {
            CqlValue::Text(s) | CqlValue::Ascii(s) => Ok(Bytes::copy_from_slice(s.as_bytes())),
            other => Err(mismatch(self, other)),
        }
    }

    fn deserialize(&self, bytes: &[u8], _: ProtocolVersion) -> Result<CqlValue, CodecError> {
        String::from_utf8(bytes.to_vec())
            .map(CqlValue::Text)
            .map_err(|err| bad_cell(&self.cql, err.to_string()))
    }

    fn format(&self, value: &CqlValue) -> Result<String, CodecError> {
        match value {
            CqlValue::Text(s) | CqlValue::Ascii(s) => Ok(quote(s)),
            other => Err(mismatch(self, other)),
        }
    }

    fn parse(&self, literal: &str) -> Result<CqlValue, CodecError> {
        unquote(literal.trim())
            .map(CqlValue::Text)
            .ok_or_else(|| bad_literal(&self.cql, literal, "expected a quoted string"))
    }
}

#[derive(Debug)]
struct AsciiCodec {
    cql: CqlType,
    rust: RustType,
}

impl Codec for AsciiCodec {
    codec_descriptor!();

    fn accepts_value(&self, value: &CqlValue) -> bool {
        match value {
            CqlValue::Ascii(_) => true,
            CqlValue::Text(s) => s.is_ascii(),
            _ => false,
        }
    }

    fn serialize(&self, value: &CqlValue, _: ProtocolVersion) -> Result<Bytes, CodecError> {
        match value {
            CqlValue::Ascii(s) | CqlValue::Text(s) => {
                if !s.is_ascii() {
                    return Err(bad_cell(&self.cql, "string contains non-ascii characters"));
                }
                Ok(Bytes::copy_from_slice(s.as_bytes()))
            }
            other => Err(mismatch(self, other)),
        }
    }

    fn deserialize(&self, bytes: &[u8], _: ProtocolVersion) -> Result<CqlValue, CodecError> {
        if !bytes.is_ascii() {
            return Err(bad_cell(&self.cql, "cell contains non-ascii bytes"));
        }
        Ok(CqlValue::Ascii(
            String::from_utf8(bytes.to_vec()).map_err(|err| bad_cell(&self.cql, err.to_string()))?,
        ))
    }

    fn format(&self, value: &CqlValue) -> Result<String, CodecError> {
        match value {
            CqlValue::Ascii(s) | CqlValue::Text(s) => Ok(quote(s)),
            other => Err(mismatch(self, other)),
        }
    }

    fn parse(&self, literal: &str) -> Result<CqlValue, CodecError> {
        let s = unquote(literal.trim())
            .ok_or_else(|| bad_literal(&self.cql, literal, "expected a quoted string"))?;
        if !s.is_ascii() {
            return Err(bad_literal(&self.cql, literal, "non-ascii characters"));
        }
        Ok(CqlValue::Ascii(s))
    }
}

fn format_timestamp_ms(ms: i64) -> String {
    let days = ms.div_euclid(86_400_000);
    let in_day = ms.rem_euclid(86_400_000);
    let (year, month, day) = civil_from_days(days);
    let seconds = in_day / 1000;
    let millis = in_day % 1000;
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{millis:03}Z",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60,
    )
}

fn parse_date_fields(raw: &str) -> Option<(i64, u32, u32)> {
    let mut parts = raw.splitn(3, '-');
    let year = parts.next()?.parse::<i64>().ok()?;
    let month = parts.next()?.parse::<u32>().ok()?;
    let day = parts.next()?.parse::<u32>().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    Some((year, month, day))
}

fn parse_time_of_day_ns(raw: &str) -> Option<i64> {
    let mut parts = raw.splitn(3, ':');
    let hours = parts.next()?.parse::<i64>().ok()?;
    let minutes = parts.next()?.parse::<i64>().ok()?;
    let (seconds, nanos) = match parts.next() {
        None => (0, 0),
        Some(rest) => match rest.split_once('.') {
            None => (rest.parse::<i64>().ok()?, 0),
            Some((secs, frac)) => {
                if frac.is_empty() || frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit())
                {
                    return None;
                }
                let mut nanos = frac.parse::<i64>().ok()?;
                for _ in frac.len()..9 {
                    nanos *= 10;
                }
                (secs.parse::<i64>().ok()?, nanos)
            }
        },
    };
    if !(0..24).contains(&hours) || !(0..60).contains(&minutes) || !(0..60).contains(&seconds) {
        return None;
    }
    Some(((hours * 3600 + minutes * 60 + seconds) * 1_000_000_000) + nanos)
}

#[derive(Debug)]
struct TimestampCodec {
    cql: CqlType,
    rust: RustType,
}

impl Codec for TimestampCodec {
    codec_descriptor!();

    fn accepts_value(&self, value: &CqlValue) -> bool {
        matches!(value, CqlValue::Timestamp(_))
    }

    fn serialize(&self, value: &CqlValue, _: ProtocolVersion) -> Result<Bytes, CodecError> {
        match value {
            CqlValue::Timestamp(ms) => {
                let mut buf = BytesMut::with_capacity(8);
                buf.put_i64(*ms);
                Ok(buf.freeze())
            }
            other => Err(mismatch(self, other)),
        }
    }

    fn deserialize(&self, bytes: &[u8], _: ProtocolVersion) -> Result<CqlValue, CodecError> {
        let raw = fixed_len(&self.cql, bytes, 8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(raw);
        Ok(CqlValue::Timestamp(i64::from_be_bytes(arr)))
    }

    fn format(&self, value: &CqlValue) -> Result<String, CodecError> {
        match value {
            CqlValue::Timestamp(ms) => Ok(quote(&format_timestamp_ms(*ms))),
            other => Err(mismatch(self, other)),
        }
    }

    fn parse(&self, literal: &str) -> Result<CqlValue, CodecError> {
        let trimmed = literal.trim();
        if let Ok(ms) = trimmed.parse::<i64>() {
            return Ok(CqlValue::Timestamp(ms));
        }
        let raw = unquote(trimmed)
            .ok_or_else(|| bad_literal(&self.cql, literal, "expected millis or quoted date"))?;
        let raw = raw.trim_end_matches('Z');
        let (date_part, time_part) = match raw.split_once(['T', ' ']) {
            Some((d, t)) => (d, Some(t)),
            None => (raw, None),
        };
        let (year, month, day) = parse_date_fields(date_part)
            .ok_or_else(|| bad_literal(&self.cql, literal, "malformed date"))?;
        let time_ns = match time_part {
            None => 0,
            Some(t) => parse_time_of_day_ns(t)
                .ok_or_else(|| bad_literal(&self.cql, literal, "malformed time of day"))?,
        };
        let ms = days_from_civil(year, month, day) * 86_400_000 + time_ns / 1_000_000;
        Ok(CqlValue::Timestamp(ms))
    }
}

#[derive(Debug)]
struct DateCodec {
    cql: CqlType,
    rust: RustType,
}

impl Codec for DateCodec {
    codec_descriptor!();

    fn accepts_value(&self, value: &CqlValue) -> bool {
        matches!(value, CqlValue::Date(_))
    }

    fn serialize(&self, value: &CqlValue, _: ProtocolVersion) -> Result<Bytes, CodecError> {
        match value {
            CqlValue::Date(raw) => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u32(*raw);
                Ok(buf.freeze())
            }
            other => Err(mismatch(self, other)),
        }
    }

    fn deserialize(&self, bytes: &[u8], _: ProtocolVersion) -> Result<CqlValue, CodecError> {
        let raw = fixed_len(&self.cql, bytes, 4)?;
        let mut arr = [0u8; 4];
        arr.copy_from_slice(raw);
        Ok(CqlValue::Date(u32::from_be_bytes(arr)))
    }

    fn format(&self, value: &CqlValue) -> Result<String, CodecError> {
        match value {
            CqlValue::Date(raw) => {
                let days = i64::from(*raw) - DATE_EPOCH_OFFSET;
                let (year, month, day) = civil_from_days(days);
                Ok(quote(&format!("{year:04}-{month:02}-{day:02}")))
            }
            other => Err(mismatch(self, other)),
        }
    }

    fn parse(&self, literal: &str) -> Result<CqlValue, CodecError> {
        let trimmed = literal.trim();
        if let Ok(raw) = trimmed.parse::<u32>() {
            return Ok(CqlValue::Date(raw));
        }
        let raw = unquote(trimmed)
            .ok_or_else(|| bad_literal(&self.cql, literal, "expected days or quoted date"))?;
        let (year, month, day) = parse_date_fields(&raw)
            .ok_or_else(|| bad_literal(&self.cql, literal, "malformed date"))?;
        let days = days_from_civil(year, month, day) + DATE_EPOCH_OFFSET;
        if !(0..=i64::from(u32::MAX)).contains(&days) {
            return Err(bad_literal(&self.cql, literal, "date out of range"));
        }
        Ok(CqlValue::Date(days as u32))
    }
}

#[derive(Debug)]
struct TimeCodec {
    cql: CqlType,
    rust: RustType,
}

impl Codec for TimeCodec {
    codec_descriptor!();

    fn accepts_value(&self, value: &CqlValue) -> bool {
        matches!(value, CqlValue::Time(_))
    }

    fn serialize(&self, value: &CqlValue, _: ProtocolVersion) -> Result<Bytes, CodecError> {
        match value {
            CqlValue::Time(ns) => {
                let mut buf = BytesMut::with_capacity(8);
                buf.put_i64(*ns);
                Ok(buf.freeze())
            }
            other => Err(mismatch(self, other)),
        }
    }

    fn deserialize(&self, bytes: &[u8], _: ProtocolVersion) -> Result<CqlValue, CodecError> {
        let raw = fixed_len(&self.cql, bytes, 8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(raw);
        let ns = i64::from_be_bytes(arr);
        if !(0..86_400_000_000_000).contains(&ns) {
            return Err(bad_cell(&self.cql, format!("time {ns} out of range")));
        }
        Ok(CqlValue::Time(ns))
    }

    fn format(&self, value: &CqlValue) -> Result<String, CodecError> {
        match value {
            CqlValue::Time(ns) => {
                let seconds = ns / 1_000_000_000;
                let nanos = ns % 1_000_000_000;
                Ok(quote(&format!(
                    "{:02}:{:02}:{:02}.{nanos:09}",
                    seconds / 3600,
                    (seconds % 3600) / 60,
                    seconds % 60,
                )))
            }
            other => Err(mismatch(self, other)),
        }
    }

    fn parse(&self, literal: &str) -> Result<CqlValue, CodecError> {
        let trimmed = literal.trim();
        if let Ok(ns) = trimmed.parse::<i64>() {
            return Ok(CqlValue::Time(ns));
        }
        let raw = unquote(trimmed)
            .ok_or_else(|| bad_literal(&self.cql, literal, "expected nanos or quoted time"))?;
        parse_time_of_day_ns(&raw)
            .map(CqlValue::Time)
            .ok_or_else(|| bad_literal(&self.cql, literal, "malformed time of day"))
    }
}

#[derive(Debug)]
struct UuidCodec {
    cql: CqlType,
    rust: RustType,
    timeuuid_only: bool,
}

impl Codec for UuidCodec {
    codec_descriptor!();

    fn accepts_value(&self, value: &CqlValue) -> bool {
        if self.timeuuid_only {
            matches!(value, CqlValue::Timeuuid(_))
        } else {
            matches!(value, CqlValue::Uuid(_) | CqlValue::Timeuuid(_))
        }
    }

    fn serialize(&self, value: &CqlValue, _: ProtocolVersion) -> Result<Bytes, CodecError> {
        match value {
            CqlValue::Uuid(id) | CqlValue::Timeuuid(id) => {
                Ok(Bytes::copy_from_slice(id.as_bytes()))
            }
            other => Err(mismatch(self, other)),
        }
    }

    fn deserialize(&self, bytes: &[u8], _: ProtocolVersion) -> Result<CqlValue, CodecError> {
        let raw = fixed_len(&self.cql, bytes, 16)?;
        let mut arr = [0u8; 16];
        arr.copy_from_slice(raw);
        let id = Uuid::from_bytes(arr);
        Ok(if self.timeuuid_only {
            CqlValue::Timeuuid(id)
        } else {
            CqlValue::Uuid(id)
        })
    }

    fn format(&self, value: &CqlValue) -> Result<String, CodecError> {
        match value {
            CqlValue::Uuid(id) | CqlValue::Timeuuid(id) => Ok(id.to_string()),
            other => Err(mismatch(self, other)),
        }
    }

    fn parse(&self, literal: &str) -> Result<CqlValue, CodecError> {
        let id = Uuid::parse_str(literal.trim())
            .map_err(|err| bad_literal(&self.cql, literal, err.to_string()))?;
        Ok(if self.timeuuid_only {
            CqlValue::Timeuuid(id)
        } else {
            CqlValue::Uuid(id)
        })
    }
}

#[derive(Debug)]
struct InetCodec {
    cql: CqlType,
    rust: RustType,
}

impl Codec for InetCodec {
    codec_descriptor!();

    fn accepts_value(&self, value: &CqlValue) -> bool {
        matches!(value, CqlValue::Inet(_))
    }

    fn serialize(&self, value: &CqlValue, _: ProtocolVersion) -> Result<Bytes, CodecError> {
        match value {
            CqlValue::Inet(IpAddr::V4(v4)) => Ok(Bytes::copy_from_slice(&v4.octets())),
            CqlValue::Inet(IpAddr::V6(v6)) => Ok(Bytes::copy_from_slice(&v6.octets())),
            other => Err(mismatch(self, other)),
        }
    }

    fn deserialize(&self, bytes: &[u8], _: ProtocolVersion) -> Result<CqlValue, CodecError> {
        match bytes.len() {
            4 => {
                let mut arr = [0u8; 4];
                arr.copy_from_slice(bytes);
                Ok(CqlValue::Inet(IpAddr::from(arr)))
            }
            16 => {
                let mut arr = [0u8; 16];
                arr.copy_from_slice(bytes);
                Ok(CqlValue::Inet(IpAddr::from(arr)))
            }
            other => Err(bad_cell(
                &self.cql,
                format!("expected 4 or 16 bytes, got {other}"),
            )),
        }
    }

    fn format(&self, value: &CqlValue) -> Result<String, CodecError> {
        match value {
            CqlValue::Inet(addr) => Ok(quote(&addr.to_string())),
            other => Err(mismatch(self, other)),
        }
    }

    fn parse(&self, literal: &str) -> Result<CqlValue, CodecError> {
        let raw = match unquote(literal.trim()) {
            Some(inner) => inner,
            None => literal.trim().to_string(),
        };
        raw.parse::<IpAddr>()
            .map(CqlValue::Inet)
            .map_err(|err| bad_literal(&self.cql, literal, err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(codec: &CodecRef, value: CqlValue) {
        for version in [ProtocolVersion::V2, ProtocolVersion::V4] {
            let bytes = codec.serialize(&value, version).unwrap();
            let back = codec.deserialize(&bytes, version).unwrap();
            assert_eq!(back, value, "{:?} via {}", value, codec.cql_type());
        }
    }

    #[test]
    fn primitive_values_round_trip() {
        round_trip(&boolean(), CqlValue::Boolean(true));
        round_trip(&tinyint(), CqlValue::Tinyint(-7));
        round_trip(&smallint(), CqlValue::Smallint(-12_345));
        round_trip(&int(), CqlValue::Int(i32::MIN));
        round_trip(&bigint(), CqlValue::Bigint(i64::MAX));
        round_trip(&counter(), CqlValue::Counter(42));
        round_trip(&float(), CqlValue::Float(1.5));
        round_trip(&double(), CqlValue::Double(-2.25));
        round_trip(&varchar(), CqlValue::Text("héllo".into()));
        round_trip(&ascii(), CqlValue::Ascii("hello".into()));
        round_trip(&blob(), CqlValue::Blob(vec![0, 1, 2, 255]));
        round_trip(&timestamp(), CqlValue::Timestamp(1_438_013_356_789));
        round_trip(&date(), CqlValue::Date(2_147_483_648));
        round_trip(&time(), CqlValue::Time(3_661_000_000_001));
        round_trip(&inet(), CqlValue::Inet("10.1.2.3".parse().unwrap()));
        round_trip(&inet(), CqlValue::Inet("2001:db8::1".parse().unwrap()));
        round_trip(&uuid_codec(), CqlValue::Uuid(Uuid::new_v4()));
        round_trip(
            &varint(),
            CqlValue::Varint(twos_complement_bytes(-1_234_567_890_123)),
        );
        round_trip(
            &decimal(),
            CqlValue::Decimal {
                scale: 2,
                unscaled: twos_complement_bytes(314),
            },
        );
    }

    #[test]
    fn wrong_cell_length_is_rejected() {
        let err = int().deserialize(&[0, 0, 1], ProtocolVersion::V4).unwrap_err();
        assert!(matches!(err, CodecError::BadCell { .. }));
    }

    #[test]
    fn ascii_rejects_non_ascii() {
        assert!(ascii()
            .serialize(&CqlValue::Text("héllo".into()), ProtocolVersion::V4)
            .is_err());
        assert!(!ascii().accepts_value(&CqlValue::Text("héllo".into())));
    }

    #[test]
    fn varint_minimal_encoding() {
        assert_eq!(twos_complement_bytes(0), vec![0x00]);
        assert_eq!(twos_complement_bytes(127), vec![0x7F]);
        assert_eq!(twos_complement_bytes(128), vec![0x00, 0x80]);
        assert_eq!(twos_complement_bytes(-1), vec![0xFF]);
        assert_eq!(twos_complement_bytes(-129), vec![0xFF, 0x7F]);
        for v in [-300_000_i128, -1, 0, 1, 127, 128, 255, 1 << 40] {
            assert_eq!(
                int_from_twos_complement(&twos_complement_bytes(v)),
                Some(v)
            );
        }
    }

    #[test]
    fn timestamp_literals_round_trip() {
        let codec = timestamp();
        let formatted = codec.format(&CqlValue::Timestamp(1_438_013_356_789)).unwrap();
        assert_eq!(formatted, "'2015-07-27T15:29:16.789Z'");
        assert_eq!(
            codec.parse(&formatted).unwrap(),
            CqlValue::Timestamp(1_438_013_356_789)
        );
        assert_eq!(codec.parse("12345").unwrap(), CqlValue::Timestamp(12_345));
    }

    #[test]
    fn date_literal_round_trips_at_epoch() {
        let codec = date();
        let epoch = CqlValue::Date(DATE_EPOCH_OFFSET as u32);
        assert_eq!(codec.format(&epoch).unwrap(), "'1970-01-01'");
        assert_eq!(codec.parse("'1970-01-01'").unwrap(), epoch);
    }

    #[test]
    fn decimal_literal_formatting() {
        let codec = decimal();
        let value = CqlValue::Decimal {
            scale: 2,
            unscaled: twos_complement_bytes(-314),
        };
        assert_eq!(codec.format(&value).unwrap(), "-3.14");
        assert_eq!(codec.parse("-3.14").unwrap(), value);
        let small = codec.parse("0.05").unwrap();
        assert_eq!(codec.format(&small).unwrap(), "0.05");
    }

    #[test]
    fn text_literal_quotes_embedded_quotes() {
        let codec = varchar();
        let value = CqlValue::Text("it's".into());
        let formatted = codec.format(&value).unwrap();
        assert_eq!(formatted, "'it''s'");
        assert_eq!(codec.parse(&formatted).unwrap(), value);
    }

    #[test]
    fn blob_literal_hex_round_trips() {
        let codec = blob();
        let value = CqlValue::Blob(vec![0xCA, 0xFE]);
        assert_eq!(codec.format(&value).unwrap(), "0xcafe");
        assert_eq!(codec.parse("0xCAFE").unwrap(), value);
    }
}
