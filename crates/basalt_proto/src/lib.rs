//! Framed binary wire protocol for CQL-compatible wide-column stores.
//!
//! This crate owns everything that goes on the wire: the frame header layout
//! across protocol versions v1-v4, request/response message bodies, the
//! server-push event formats, per-frame compression, and the `CqlType`
//! descriptor used to describe column types in result metadata.

pub mod event;
pub mod frame;
pub mod messages;
pub mod types;

use thiserror::Error;

/// Errors raised while encoding or decoding wire data.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("truncated wire data: needed {needed} more bytes reading {what}")]
    Truncated { what: &'static str, needed: usize },
    #[error("unsupported protocol version byte {0:#04x}")]
    InvalidVersion(u8),
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("frame body of {0} bytes exceeds the maximum accepted length")]
    BodyTooLarge(usize),
    #[error("invalid utf-8 in wire string")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("invalid inet address length {0}")]
    InvalidInet(usize),
    #[error("unknown {what} value {value}")]
    UnknownValue { what: &'static str, value: String },
    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },
    #[error("{algorithm} frame compression failed: {detail}")]
    Compression {
        algorithm: &'static str,
        detail: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProtoError {
    pub(crate) fn malformed(what: &'static str, detail: impl Into<String>) -> Self {
        ProtoError::Malformed {
            what,
            detail: detail.into(),
        }
    }
}

/// Protocol versions supported by this crate.
///
/// The driver opens with its maximum supported version and downgrades on a
/// server `ProtocolError`; downgrading below [`ProtocolVersion::V1`] is fatal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    V1,
    V2,
    V3,
    V4,
}

impl ProtocolVersion {
    pub const MAX: ProtocolVersion = ProtocolVersion::V4;

    pub fn as_byte(self) -> u8 {
        match self {
            ProtocolVersion::V1 => 0x01,
            ProtocolVersion::V2 => 0x02,
            ProtocolVersion::V3 => 0x03,
            ProtocolVersion::V4 => 0x04,
        }
    }

    /// Parse a header version byte with the direction bit masked off.
    pub fn from_byte(byte: u8) -> Result<Self, ProtoError> {
        match byte & 0x7f {
            0x01 => Ok(ProtocolVersion::V1),
            0x02 => Ok(ProtocolVersion::V2),
            0x03 => Ok(ProtocolVersion::V3),
            0x04 => Ok(ProtocolVersion::V4),
            _ => Err(ProtoError::InvalidVersion(byte)),
        }
    }

    /// Width of the stream-id header field in bytes.
    pub fn stream_width(self) -> usize {
        match self {
            ProtocolVersion::V1 | ProtocolVersion::V2 => 1,
            ProtocolVersion::V3 | ProtocolVersion::V4 => 2,
        }
    }

    /// Size of the stream-id space usable for requests.
    pub fn max_streams(self) -> usize {
        match self {
            ProtocolVersion::V1 | ProtocolVersion::V2 => 128,
            ProtocolVersion::V3 | ProtocolVersion::V4 => 32_768,
        }
    }

    /// Stream id the server uses for pushed events.
    pub fn event_stream(self) -> i16 {
        -1
    }

    /// Whether a response stream id identifies a server-push event frame.
    ///
    /// v1/v2 reserve all negative ids for events; v3/v4 reserve only -1.
    pub fn is_event_stream(self, stream: i16) -> bool {
        match self {
            ProtocolVersion::V1 | ProtocolVersion::V2 => stream < 0,
            ProtocolVersion::V3 | ProtocolVersion::V4 => stream == -1,
        }
    }

    /// Collection lengths are `[short]` in v1/v2 and `[int]` from v3 on.
    pub fn uses_int_collection_len(self) -> bool {
        self >= ProtocolVersion::V3
    }

    /// The next version to try after a `ProtocolError`, if any.
    pub fn downgrade(self) -> Option<Self> {
        match self {
            ProtocolVersion::V1 => None,
            ProtocolVersion::V2 => Some(ProtocolVersion::V1),
            ProtocolVersion::V3 => Some(ProtocolVersion::V2),
            ProtocolVersion::V4 => Some(ProtocolVersion::V3),
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.as_byte())
    }
}

/// Frame opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Error = 0x00,
    Startup = 0x01,
    Ready = 0x02,
    Authenticate = 0x03,
    Options = 0x05,
    Supported = 0x06,
    Query = 0x07,
    Result = 0x08,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Event = 0x0C,
    Batch = 0x0D,
    AuthChallenge = 0x0E,
    AuthResponse = 0x0F,
    AuthSuccess = 0x10,
}

impl Opcode {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Result<Self, ProtoError> {
        Ok(match byte {
            0x00 => Opcode::Error,
            0x01 => Opcode::Startup,
            0x02 => Opcode::Ready,
            0x03 => Opcode::Authenticate,
            0x05 => Opcode::Options,
            0x06 => Opcode::Supported,
            0x07 => Opcode::Query,
            0x08 => Opcode::Result,
            0x09 => Opcode::Prepare,
            0x0A => Opcode::Execute,
            0x0B => Opcode::Register,
            0x0C => Opcode::Event,
            0x0D => Opcode::Batch,
            0x0E => Opcode::AuthChallenge,
            0x0F => Opcode::AuthResponse,
            0x10 => Opcode::AuthSuccess,
            other => return Err(ProtoError::UnknownOpcode(other)),
        })
    }
}

/// Consistency levels carried in query parameters and server errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Consistency {
    Any = 0x0000,
    One = 0x0001,
    Two = 0x0002,
    Three = 0x0003,
    Quorum = 0x0004,
    All = 0x0005,
    LocalQuorum = 0x0006,
    EachQuorum = 0x0007,
    Serial = 0x0008,
    LocalSerial = 0x0009,
    LocalOne = 0x000A,
}

impl Consistency {
    pub fn as_short(self) -> u16 {
        self as u16
    }

    pub fn from_short(value: u16) -> Result<Self, ProtoError> {
        Ok(match value {
            0x0000 => Consistency::Any,
            0x0001 => Consistency::One,
            0x0002 => Consistency::Two,
            0x0003 => Consistency::Three,
            0x0004 => Consistency::Quorum,
            0x0005 => Consistency::All,
            0x0006 => Consistency::LocalQuorum,
            0x0007 => Consistency::EachQuorum,
            0x0008 => Consistency::Serial,
            0x0009 => Consistency::LocalSerial,
            0x000A => Consistency::LocalOne,
            other => {
                return Err(ProtoError::UnknownValue {
                    what: "consistency",
                    value: format!("{other:#06x}"),
                })
            }
        })
    }
}

impl std::fmt::Display for Consistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Consistency::Any => "ANY",
            Consistency::One => "ONE",
            Consistency::Two => "TWO",
            Consistency::Three => "THREE",
            Consistency::Quorum => "QUORUM",
            Consistency::All => "ALL",
            Consistency::LocalQuorum => "LOCAL_QUORUM",
            Consistency::EachQuorum => "EACH_QUORUM",
            Consistency::Serial => "SERIAL",
            Consistency::LocalSerial => "LOCAL_SERIAL",
            Consistency::LocalOne => "LOCAL_ONE",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_round_trips_through_header_byte() {
        for v in [
            ProtocolVersion::V1,
            ProtocolVersion::V2,
            ProtocolVersion::V3,
            ProtocolVersion::V4,
        ] {
            assert_eq!(ProtocolVersion::from_byte(v.as_byte()).unwrap(), v);
            // Response frames set the direction bit.
            assert_eq!(ProtocolVersion::from_byte(v.as_byte() | 0x80).unwrap(), v);
        }
        assert!(ProtocolVersion::from_byte(0x05).is_err());
    }

    #[test]
    fn event_stream_reservation_depends_on_version() {
        assert!(ProtocolVersion::V2.is_event_stream(-7));
        assert!(ProtocolVersion::V2.is_event_stream(-1));
        assert!(!ProtocolVersion::V4.is_event_stream(-7));
        assert!(ProtocolVersion::V4.is_event_stream(-1));
        assert!(!ProtocolVersion::V4.is_event_stream(0));
    }

    #[test]
    fn downgrade_chain_terminates_at_v1() {
        assert_eq!(ProtocolVersion::V4.downgrade(), Some(ProtocolVersion::V3));
        assert_eq!(ProtocolVersion::V2.downgrade(), Some(ProtocolVersion::V1));
        assert_eq!(ProtocolVersion::V1.downgrade(), None);
    }
}
