//! Frame layout and the tokio-util codecs used on both ends of a connection.
//!
//! Header: `[version:1][flags:1][stream:1|2][opcode:1][length:4][body...]`.
//! The version byte carries a direction bit (0x80 on responses); the stream
//! field is one byte wide in v1/v2 and two bytes from v3 on.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Opcode, ProtoError, ProtocolVersion};

/// Body is compressed with the negotiated algorithm.
pub const FLAG_COMPRESSED: u8 = 0x01;
/// Tracing requested / tracing id present.
pub const FLAG_TRACING: u8 = 0x02;

/// Hard cap on accepted body length, guarding the decoder against garbage.
pub const MAX_BODY_LEN: usize = 256 * 1024 * 1024;

/// Per-frame body compression.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    None,
    Snappy,
    Lz4,
}

impl Compression {
    /// Name used in STARTUP option maps, if any.
    pub fn startup_option(self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Snappy => Some("snappy"),
            Compression::Lz4 => Some("lz4"),
        }
    }

    pub fn compress(self, body: &[u8]) -> Result<Bytes, ProtoError> {
        match self {
            Compression::None => Ok(Bytes::copy_from_slice(body)),
            Compression::Snappy => {
                let mut encoder = snap::raw::Encoder::new();
                encoder
                    .compress_vec(body)
                    .map(Bytes::from)
                    .map_err(|err| ProtoError::Compression {
                        algorithm: "snappy",
                        detail: err.to_string(),
                    })
            }
            Compression::Lz4 => {
                // The protocol prefixes lz4 bodies with the uncompressed length.
                let mut out = Vec::with_capacity(body.len() / 2 + 4);
                out.put_u32(body.len() as u32);
                out.extend_from_slice(&lz4_flex::compress(body));
                Ok(Bytes::from(out))
            }
        }
    }

    pub fn decompress(self, body: &[u8]) -> Result<Bytes, ProtoError> {
        match self {
            Compression::None => Ok(Bytes::copy_from_slice(body)),
            Compression::Snappy => {
                let mut decoder = snap::raw::Decoder::new();
                decoder
                    .decompress_vec(body)
                    .map(Bytes::from)
                    .map_err(|err| ProtoError::Compression {
                        algorithm: "snappy",
                        detail: err.to_string(),
                    })
            }
            Compression::Lz4 => {
                if body.len() < 4 {
                    return Err(ProtoError::Compression {
                        algorithm: "lz4",
                        detail: "missing uncompressed-length prefix".into(),
                    });
                }
                let uncompressed_len = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                lz4_flex::decompress(&body[4..], uncompressed_len as usize)
                    .map(Bytes::from)
                    .map_err(|err| ProtoError::Compression {
                        algorithm: "lz4",
                        detail: err.to_string(),
                    })
            }
        }
    }
}

/// One frame, request or response; the body is already decompressed.
#[derive(Clone, Debug)]
pub struct Frame {
    pub version: ProtocolVersion,
    pub flags: u8,
    pub stream: i16,
    pub opcode: Opcode,
    pub body: Bytes,
}

impl Frame {
    pub fn request(version: ProtocolVersion, stream: i16, opcode: Opcode, body: Bytes) -> Frame {
        Frame {
            version,
            flags: 0,
            stream,
            opcode,
            body,
        }
    }

    pub fn response(version: ProtocolVersion, stream: i16, opcode: Opcode, body: Bytes) -> Frame {
        Frame {
            version,
            flags: 0,
            stream,
            opcode,
            body,
        }
    }
}

fn header_len(version: ProtocolVersion) -> usize {
    // version + flags + stream + opcode + length
    2 + version.stream_width() + 5
}

fn encode_frame(
    frame: &Frame,
    compression: Compression,
    response: bool,
    dst: &mut BytesMut,
) -> Result<(), ProtoError> {
    // STARTUP negotiates the compression algorithm, so it is never compressed.
    let compress = compression != Compression::None && frame.opcode != Opcode::Startup;
    let body = if compress {
        compression.compress(&frame.body)?
    } else {
        frame.body.clone()
    };
    let mut flags = frame.flags & !FLAG_COMPRESSED;
    if compress {
        flags |= FLAG_COMPRESSED;
    }

    let direction = if response { 0x80 } else { 0x00 };
    dst.reserve(header_len(frame.version) + body.len());
    dst.put_u8(frame.version.as_byte() | direction);
    dst.put_u8(flags);
    match frame.version.stream_width() {
        1 => dst.put_i8(frame.stream as i8),
        _ => dst.put_i16(frame.stream),
    }
    dst.put_u8(frame.opcode.as_byte());
    dst.put_u32(body.len() as u32);
    dst.put_slice(&body);
    Ok(())
}

fn decode_frame(
    version: ProtocolVersion,
    compression: Compression,
    src: &mut BytesMut,
) -> Result<Option<Frame>, ProtoError> {
    let header = header_len(version);
    if src.len() < header {
        return Ok(None);
    }

    let body_len = {
        let len_off = header - 4;
        u32::from_be_bytes([
            src[len_off],
            src[len_off + 1],
            src[len_off + 2],
            src[len_off + 3],
        ]) as usize
    };
    if body_len > MAX_BODY_LEN {
        return Err(ProtoError::BodyTooLarge(body_len));
    }
    if src.len() < header + body_len {
        src.reserve(header + body_len - src.len());
        return Ok(None);
    }

    let mut head = src.split_to(header);
    let version_byte = head.get_u8();
    let frame_version = ProtocolVersion::from_byte(version_byte)?;
    let flags = head.get_u8();
    let stream = match frame_version.stream_width() {
        1 => head.get_i8() as i16,
        _ => head.get_i16(),
    };
    let opcode = Opcode::from_byte(head.get_u8())?;

    let raw_body = src.split_to(body_len).freeze();
    let body = if flags & FLAG_COMPRESSED != 0 {
        compression.decompress(&raw_body)?
    } else {
        raw_body
    };

    Ok(Some(Frame {
        version: frame_version,
        flags: flags & !FLAG_COMPRESSED,
        stream,
        opcode,
        body,
    }))
}

/// Client-side codec: encodes requests, decodes responses.
#[derive(Clone, Copy, Debug)]
pub struct ClientCodec {
    pub version: ProtocolVersion,
    pub compression: Compression,
}

impl ClientCodec {
    pub fn new(version: ProtocolVersion, compression: Compression) -> Self {
        ClientCodec {
            version,
            compression,
        }
    }
}

impl Encoder<Frame> for ClientCodec {
    type Error = ProtoError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtoError> {
        encode_frame(&frame, self.compression, false, dst)
    }
}

impl Decoder for ClientCodec {
    type Item = Frame;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtoError> {
        decode_frame(self.version, self.compression, src)
    }
}

/// Server-side codec: the mirror image, used by in-process test servers.
#[derive(Clone, Copy, Debug)]
pub struct ServerCodec {
    pub version: ProtocolVersion,
    pub compression: Compression,
}

impl ServerCodec {
    pub fn new(version: ProtocolVersion, compression: Compression) -> Self {
        ServerCodec {
            version,
            compression,
        }
    }
}

impl Encoder<Frame> for ServerCodec {
    type Error = ProtoError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtoError> {
        encode_frame(&frame, self.compression, true, dst)
    }
}

impl Decoder for ServerCodec {
    type Item = Frame;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtoError> {
        decode_frame(self.version, self.compression, src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(version: ProtocolVersion, compression: Compression, stream: i16) -> Frame {
        let body = Bytes::from_static(b"the quick brown fox jumps over the lazy dog");
        let frame = Frame::request(version, stream, Opcode::Query, body.clone());

        let mut wire = BytesMut::new();
        ClientCodec::new(version, compression)
            .encode(frame, &mut wire)
            .unwrap();
        let decoded = ServerCodec::new(version, compression)
            .decode(&mut wire)
            .unwrap()
            .expect("whole frame buffered");
        assert_eq!(decoded.body, body);
        decoded
    }

    #[test]
    fn frame_round_trips_across_versions() {
        for version in [
            ProtocolVersion::V1,
            ProtocolVersion::V2,
            ProtocolVersion::V3,
            ProtocolVersion::V4,
        ] {
            let frame = round_trip(version, Compression::None, 42);
            assert_eq!(frame.version, version);
            assert_eq!(frame.stream, 42);
            assert_eq!(frame.opcode, Opcode::Query);
        }
    }

    #[test]
    fn wide_stream_ids_survive_v4_only() {
        let frame = round_trip(ProtocolVersion::V4, Compression::None, 20_000);
        assert_eq!(frame.stream, 20_000);
    }

    #[test]
    fn negative_stream_ids_round_trip() {
        assert_eq!(round_trip(ProtocolVersion::V2, Compression::None, -1).stream, -1);
        assert_eq!(round_trip(ProtocolVersion::V4, Compression::None, -1).stream, -1);
    }

    #[test]
    fn compressed_bodies_round_trip() {
        for compression in [Compression::Snappy, Compression::Lz4] {
            round_trip(ProtocolVersion::V4, compression, 7);
        }
    }

    #[test]
    fn startup_is_never_compressed() {
        let frame = Frame::request(
            ProtocolVersion::V4,
            0,
            Opcode::Startup,
            Bytes::from_static(b"\x00\x01"),
        );
        let mut wire = BytesMut::new();
        ClientCodec::new(ProtocolVersion::V4, Compression::Lz4)
            .encode(frame, &mut wire)
            .unwrap();
        // flags byte must not carry the compression bit
        assert_eq!(wire[1] & FLAG_COMPRESSED, 0);
    }

    #[test]
    fn partial_frames_wait_for_more_input() {
        let body = Bytes::from_static(b"abcdef");
        let frame = Frame::request(ProtocolVersion::V4, 1, Opcode::Options, body);
        let mut wire = BytesMut::new();
        ClientCodec::new(ProtocolVersion::V4, Compression::None)
            .encode(frame, &mut wire)
            .unwrap();

        let mut partial = BytesMut::from(&wire[..wire.len() - 2]);
        let mut codec = ServerCodec::new(ProtocolVersion::V4, Compression::None);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&wire[wire.len() - 2..]);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn oversized_body_is_rejected() {
        let mut wire = BytesMut::new();
        wire.put_u8(0x84);
        wire.put_u8(0);
        wire.put_i16(0);
        wire.put_u8(Opcode::Result.as_byte());
        wire.put_u32((MAX_BODY_LEN + 1) as u32);
        let mut codec = ClientCodec::new(ProtocolVersion::V4, Compression::None);
        assert!(matches!(
            codec.decode(&mut wire),
            Err(ProtoError::BodyTooLarge(_))
        ));
    }
}
