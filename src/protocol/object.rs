//! Object framing for datagrams and unidirectional streams

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;
use tokio_util::codec::Decoder;

use super::varint::{decode_varint, encode_bytes, encode_varint};
use crate::error::ProtocolError;

pub const OBJECT_STREAM: u64 = 0x00;
pub const OBJECT_DATAGRAM: u64 = 0x01;
pub const STREAM_HEADER_TRACK: u64 = 0x50;
pub const STREAM_HEADER_GROUP: u64 = 0x51;

/// Largest length-prefixed object accepted on a multi-object stream
pub const MAX_OBJECT_SIZE: u64 = 16 * 1024 * 1024;

/// Addressing of one object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    pub subscribe_id: u64,
    pub track_alias: u64,
    pub group: u64,
    pub object: u64,
    pub send_order: u64,
}

/// One object read off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectFrame {
    pub header: ObjectHeader,
    pub payload: Bytes,
}

fn encode_single<B: BufMut>(buf: &mut B, kind: u64, header: &ObjectHeader) -> Result<(), ProtocolError> {
    encode_varint(buf, kind)?;
    encode_varint(buf, header.subscribe_id)?;
    encode_varint(buf, header.track_alias)?;
    encode_varint(buf, header.group)?;
    encode_varint(buf, header.object)?;
    encode_varint(buf, header.send_order)
}

fn decode_single<B: Buf>(buf: &mut B) -> Result<ObjectHeader, ProtocolError> {
    Ok(ObjectHeader {
        subscribe_id: decode_varint(buf)?,
        track_alias: decode_varint(buf)?,
        group: decode_varint(buf)?,
        object: decode_varint(buf)?,
        send_order: decode_varint(buf)?,
    })
}

/// Encode a complete OBJECT_DATAGRAM
pub fn encode_object_datagram(header: &ObjectHeader, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(payload.len() + 24);
    encode_single(&mut buf, OBJECT_DATAGRAM, header)?;
    buf.put_slice(payload);
    Ok(buf.freeze())
}

pub fn decode_object_datagram(mut datagram: Bytes) -> Result<ObjectFrame, ProtocolError> {
    let kind = decode_varint(&mut datagram)?;
    if kind != OBJECT_DATAGRAM {
        return Err(ProtocolError::UnknownStreamType(kind));
    }
    let header = decode_single(&mut datagram)?;
    Ok(ObjectFrame {
        header,
        payload: datagram,
    })
}

/// Encode an OBJECT_STREAM header; the payload is the rest of the stream
pub fn encode_object_stream(header: &ObjectHeader, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(payload.len() + 24);
    encode_single(&mut buf, OBJECT_STREAM, header)?;
    buf.put_slice(payload);
    Ok(buf.freeze())
}

pub fn encode_track_header(subscribe_id: u64, track_alias: u64, send_order: u64) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(16);
    encode_varint(&mut buf, STREAM_HEADER_TRACK)?;
    encode_varint(&mut buf, subscribe_id)?;
    encode_varint(&mut buf, track_alias)?;
    encode_varint(&mut buf, send_order)?;
    Ok(buf.freeze())
}

pub fn encode_track_object(group: u64, object: u64, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(payload.len() + 16);
    encode_varint(&mut buf, group)?;
    encode_varint(&mut buf, object)?;
    encode_bytes(&mut buf, payload)?;
    Ok(buf.freeze())
}

pub fn encode_group_header(
    subscribe_id: u64,
    track_alias: u64,
    group: u64,
    send_order: u64,
) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(24);
    encode_varint(&mut buf, STREAM_HEADER_GROUP)?;
    encode_varint(&mut buf, subscribe_id)?;
    encode_varint(&mut buf, track_alias)?;
    encode_varint(&mut buf, group)?;
    encode_varint(&mut buf, send_order)?;
    Ok(buf.freeze())
}

pub fn encode_group_object(object: u64, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(payload.len() + 8);
    encode_varint(&mut buf, object)?;
    encode_bytes(&mut buf, payload)?;
    Ok(buf.freeze())
}

fn decode_sized_payload(cursor: &mut Cursor<&[u8]>) -> Result<Bytes, ProtocolError> {
    let len = decode_varint(cursor)?;
    if len > MAX_OBJECT_SIZE {
        return Err(ProtocolError::InvalidValue {
            field: "object length",
            value: len,
        });
    }
    if (cursor.remaining() as u64) < len {
        return Err(ProtocolError::UnexpectedEnd);
    }
    Ok(cursor.copy_to_bytes(len as usize))
}

/// A single-object stream has no length prefix; cap what is buffered until FIN
fn check_unsized_payload(src: &BytesMut) -> Result<(), ProtocolError> {
    let len = src.len() as u64;
    if len > MAX_OBJECT_SIZE {
        return Err(ProtocolError::InvalidValue {
            field: "object length",
            value: len,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum StreamState {
    Start,
    Object(ObjectHeader),
    Track {
        subscribe_id: u64,
        track_alias: u64,
        send_order: u64,
    },
    Group {
        subscribe_id: u64,
        track_alias: u64,
        group: u64,
        send_order: u64,
    },
    Done,
}

/// Decoder for an incoming unidirectional stream of any of the three stream mappings
///
/// Single-object streams only yield their object at end of stream.
#[derive(Debug)]
pub struct ObjectStreamDecoder {
    state: StreamState,
}

impl ObjectStreamDecoder {
    pub fn new() -> Self {
        Self {
            state: StreamState::Start,
        }
    }

    fn decode_header(&mut self, src: &mut BytesMut) -> Result<(), ProtocolError> {
        let mut cursor = Cursor::new(&src[..]);
        let state = match decode_varint(&mut cursor)? {
            OBJECT_STREAM => StreamState::Object(decode_single(&mut cursor)?),
            STREAM_HEADER_TRACK => StreamState::Track {
                subscribe_id: decode_varint(&mut cursor)?,
                track_alias: decode_varint(&mut cursor)?,
                send_order: decode_varint(&mut cursor)?,
            },
            STREAM_HEADER_GROUP => StreamState::Group {
                subscribe_id: decode_varint(&mut cursor)?,
                track_alias: decode_varint(&mut cursor)?,
                group: decode_varint(&mut cursor)?,
                send_order: decode_varint(&mut cursor)?,
            },
            other => return Err(ProtocolError::UnknownStreamType(other)),
        };
        let consumed = cursor.position() as usize;
        src.advance(consumed);
        self.state = state;
        Ok(())
    }

    fn try_decode(&mut self, src: &mut BytesMut) -> Result<Option<ObjectFrame>, ProtocolError> {
        if let StreamState::Start = self.state {
            if src.is_empty() {
                return Ok(None);
            }
            self.decode_header(src)?;
        }

        match self.state {
            StreamState::Object(_) => {
                check_unsized_payload(src)?;
                Ok(None)
            }
            StreamState::Start | StreamState::Done => Ok(None),
            StreamState::Track {
                subscribe_id,
                track_alias,
                send_order,
            } => {
                if src.is_empty() {
                    return Ok(None);
                }
                let mut cursor = Cursor::new(&src[..]);
                let group = decode_varint(&mut cursor)?;
                let object = decode_varint(&mut cursor)?;
                let payload = decode_sized_payload(&mut cursor)?;
                let consumed = cursor.position() as usize;
                src.advance(consumed);
                Ok(Some(ObjectFrame {
                    header: ObjectHeader {
                        subscribe_id,
                        track_alias,
                        group,
                        object,
                        send_order,
                    },
                    payload,
                }))
            }
            StreamState::Group {
                subscribe_id,
                track_alias,
                group,
                send_order,
            } => {
                if src.is_empty() {
                    return Ok(None);
                }
                let mut cursor = Cursor::new(&src[..]);
                let object = decode_varint(&mut cursor)?;
                let payload = decode_sized_payload(&mut cursor)?;
                let consumed = cursor.position() as usize;
                src.advance(consumed);
                Ok(Some(ObjectFrame {
                    header: ObjectHeader {
                        subscribe_id,
                        track_alias,
                        group,
                        object,
                        send_order,
                    },
                    payload,
                }))
            }
        }
    }
}

impl Default for ObjectStreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ObjectStreamDecoder {
    type Item = ObjectFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.try_decode(src) {
            Err(ProtocolError::UnexpectedEnd) => Ok(None),
            other => other,
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.state {
            StreamState::Object(header) => {
                check_unsized_payload(src)?;
                let payload = src.split().freeze();
                self.state = StreamState::Done;
                Ok(Some(ObjectFrame { header, payload }))
            }
            StreamState::Done => Ok(None),
            _ => {
                let frame = self.try_decode(src)?;
                // The header of a single-object stream may arrive together with the FIN
                if let StreamState::Object(_) = self.state {
                    return self.decode_eof(src);
                }
                if frame.is_none() && !src.is_empty() {
                    return Err(ProtocolError::UnexpectedEnd);
                }
                Ok(frame)
            }
        }
    }
}
