//! Media packet carried as the payload of every object

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::varint::{decode_bytes, decode_signed, decode_varint, encode_bytes, encode_signed, encode_varint};
use crate::error::ProtocolError;
use crate::media::{Chunk, ChunkType, EncodedMessage};

const CHUNK_KEY: u64 = 0;
const CHUNK_DELTA: u64 = 1;

/// Timing, sequencing and codec metadata wrapped around an encoded chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPacket {
    /// Timestamp on the shared A/V timeline in microseconds
    pub compensated_ts: i64,
    /// Duration in microseconds
    pub estimated_duration: i64,
    pub chunk_type: ChunkType,
    pub seq_id: i64,
    pub capture_clock_ms: i64,
    pub metadata: Option<Bytes>,
    pub data: Bytes,
}

impl MediaPacket {
    pub fn from_message(msg: &EncodedMessage) -> Self {
        Self {
            compensated_ts: msg.compensated_ts,
            estimated_duration: msg.wire_duration(),
            chunk_type: msg.chunk.chunk_type,
            seq_id: msg.seq_id,
            capture_clock_ms: msg.capture_clock_ms,
            metadata: msg.metadata.clone(),
            data: msg.chunk.payload.clone(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let metadata_len = self.metadata.as_ref().map_or(0, |m| m.len());
        let mut buf = BytesMut::with_capacity(self.data.len() + metadata_len + 40);
        encode_signed(&mut buf, self.compensated_ts)?;
        encode_signed(&mut buf, self.estimated_duration)?;
        encode_varint(
            &mut buf,
            match self.chunk_type {
                ChunkType::Key => CHUNK_KEY,
                ChunkType::Delta => CHUNK_DELTA,
            },
        )?;
        encode_signed(&mut buf, self.seq_id)?;
        encode_signed(&mut buf, self.capture_clock_ms)?;
        match &self.metadata {
            Some(metadata) => {
                buf.put_u8(1);
                encode_bytes(&mut buf, metadata)?;
            }
            None => buf.put_u8(0),
        }
        encode_bytes(&mut buf, &self.data)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        let compensated_ts = decode_signed(&mut buf)?;
        let estimated_duration = decode_signed(&mut buf)?;
        let chunk_type = match decode_varint(&mut buf)? {
            CHUNK_KEY => ChunkType::Key,
            CHUNK_DELTA => ChunkType::Delta,
            other => {
                return Err(ProtocolError::InvalidValue {
                    field: "chunk type",
                    value: other,
                })
            }
        };
        let seq_id = decode_signed(&mut buf)?;
        let capture_clock_ms = decode_signed(&mut buf)?;
        if !buf.has_remaining() {
            return Err(ProtocolError::UnexpectedEnd);
        }
        let metadata = match buf.get_u8() {
            0 => None,
            1 => Some(decode_bytes(&mut buf)?),
            other => {
                return Err(ProtocolError::InvalidValue {
                    field: "metadata flag",
                    value: u64::from(other),
                })
            }
        };
        let data = decode_bytes(&mut buf)?;
        Ok(Self {
            compensated_ts,
            estimated_duration,
            chunk_type,
            seq_id,
            capture_clock_ms,
            metadata,
            data,
        })
    }

    /// Chunk to feed the jitter buffer and decoder
    pub fn to_chunk(&self) -> Chunk {
        Chunk::new(
            self.compensated_ts,
            self.estimated_duration,
            self.chunk_type,
            self.data.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaType;

    #[test]
    fn test_packet_from_message() {
        let chunk = Chunk::delta(40_000, 33_333, vec![9u8; 100]);
        let mut msg = EncodedMessage::new(MediaType::Video, chunk, 12);
        msg.compensated_ts = -1_000;
        msg.capture_clock_ms = 1_700_000_000_123;

        let packet = MediaPacket::decode(MediaPacket::from_message(&msg).encode().unwrap()).unwrap();
        assert_eq!(packet.compensated_ts, -1_000);
        assert_eq!(packet.estimated_duration, 33_333);
        assert_eq!(packet.seq_id, 12);
        assert_eq!(packet.capture_clock_ms, 1_700_000_000_123);
        assert_eq!(packet.metadata, None);
        assert_eq!(packet.data.len(), 100);

        let chunk = packet.to_chunk();
        assert_eq!(chunk.timestamp, -1_000);
        assert_eq!(chunk.chunk_type, ChunkType::Delta);
    }

    #[test]
    fn test_packet_keeps_empty_metadata() {
        let chunk = Chunk::key(0, 20_000, vec![1u8]);
        let msg = EncodedMessage::new(MediaType::Audio, chunk, 0).with_metadata(Bytes::new());
        let packet = MediaPacket::decode(MediaPacket::from_message(&msg).encode().unwrap()).unwrap();
        assert_eq!(packet.metadata, Some(Bytes::new()));
    }

    #[test]
    fn test_truncated_packet() {
        let chunk = Chunk::key(0, 20_000, vec![1u8, 2, 3, 4]);
        let msg = EncodedMessage::new(MediaType::Audio, chunk, 0);
        let bytes = MediaPacket::from_message(&msg).encode().unwrap();
        let truncated = bytes.slice(..bytes.len() - 1);
        assert_eq!(MediaPacket::decode(truncated), Err(ProtocolError::UnexpectedEnd));
    }
}
