//! Control stream messages and their codec

use bytes::{Buf, BufMut, BytesMut};
use std::io::Cursor;
use tokio_util::codec::{Decoder, Encoder};

use super::varint::{
    decode_bytes, decode_string, decode_varint, encode_bytes, encode_string, encode_varint,
};
use super::Role;
use crate::error::ProtocolError;

const MSG_SUBSCRIBE: u64 = 0x03;
const MSG_SUBSCRIBE_OK: u64 = 0x04;
const MSG_SUBSCRIBE_ERROR: u64 = 0x05;
const MSG_ANNOUNCE: u64 = 0x06;
const MSG_ANNOUNCE_OK: u64 = 0x07;
const MSG_ANNOUNCE_ERROR: u64 = 0x08;
const MSG_UNANNOUNCE: u64 = 0x09;
const MSG_UNSUBSCRIBE: u64 = 0x0a;
const MSG_SUBSCRIBE_DONE: u64 = 0x0b;
const MSG_SETUP: u64 = 0x40;
const MSG_SERVER_SETUP: u64 = 0x41;

const PARAM_ROLE: u64 = 0x00;
const PARAM_AUTHORIZATION_INFO: u64 = 0x02;

/// Last group/object pair reported in SUBSCRIBE_OK and SUBSCRIBE_DONE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub group: u64,
    pub object: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Setup {
    pub versions: Vec<u64>,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSetup {
    pub version: u64,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub subscribe_id: u64,
    pub track_alias: u64,
    pub namespace: String,
    pub track_name: String,
    pub auth_info: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOk {
    pub subscribe_id: u64,
    /// Milliseconds until the subscription expires, 0 = never
    pub expires: u64,
    pub largest: Option<Location>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeError {
    pub subscribe_id: u64,
    pub code: u64,
    pub reason: String,
    pub track_alias: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announce {
    pub namespace: String,
    pub auth_info: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceOk {
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceError {
    pub namespace: String,
    pub code: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unannounce {
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub subscribe_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeDone {
    pub subscribe_id: u64,
    pub code: u64,
    pub reason: String,
    pub last: Option<Location>,
}

/// Every message that can appear on the control stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Setup(Setup),
    ServerSetup(ServerSetup),
    Subscribe(Subscribe),
    SubscribeOk(SubscribeOk),
    SubscribeError(SubscribeError),
    Announce(Announce),
    AnnounceOk(AnnounceOk),
    AnnounceError(AnnounceError),
    Unannounce(Unannounce),
    Unsubscribe(Unsubscribe),
    SubscribeDone(SubscribeDone),
}

impl ControlMessage {
    /// Message name for logs and protocol errors
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::Setup(_) => "SETUP",
            ControlMessage::ServerSetup(_) => "SERVER_SETUP",
            ControlMessage::Subscribe(_) => "SUBSCRIBE",
            ControlMessage::SubscribeOk(_) => "SUBSCRIBE_OK",
            ControlMessage::SubscribeError(_) => "SUBSCRIBE_ERROR",
            ControlMessage::Announce(_) => "ANNOUNCE",
            ControlMessage::AnnounceOk(_) => "ANNOUNCE_OK",
            ControlMessage::AnnounceError(_) => "ANNOUNCE_ERROR",
            ControlMessage::Unannounce(_) => "UNANNOUNCE",
            ControlMessage::Unsubscribe(_) => "UNSUBSCRIBE",
            ControlMessage::SubscribeDone(_) => "SUBSCRIBE_DONE",
        }
    }

    fn type_code(&self) -> u64 {
        match self {
            ControlMessage::Setup(_) => MSG_SETUP,
            ControlMessage::ServerSetup(_) => MSG_SERVER_SETUP,
            ControlMessage::Subscribe(_) => MSG_SUBSCRIBE,
            ControlMessage::SubscribeOk(_) => MSG_SUBSCRIBE_OK,
            ControlMessage::SubscribeError(_) => MSG_SUBSCRIBE_ERROR,
            ControlMessage::Announce(_) => MSG_ANNOUNCE,
            ControlMessage::AnnounceOk(_) => MSG_ANNOUNCE_OK,
            ControlMessage::AnnounceError(_) => MSG_ANNOUNCE_ERROR,
            ControlMessage::Unannounce(_) => MSG_UNANNOUNCE,
            ControlMessage::Unsubscribe(_) => MSG_UNSUBSCRIBE,
            ControlMessage::SubscribeDone(_) => MSG_SUBSCRIBE_DONE,
        }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), ProtocolError> {
        encode_varint(buf, self.type_code())?;
        match self {
            ControlMessage::Setup(msg) => {
                encode_varint(buf, msg.versions.len() as u64)?;
                for version in &msg.versions {
                    encode_varint(buf, *version)?;
                }
                encode_role_params(buf, msg.role)
            }
            ControlMessage::ServerSetup(msg) => {
                encode_varint(buf, msg.version)?;
                encode_role_params(buf, msg.role)
            }
            ControlMessage::Subscribe(msg) => {
                encode_varint(buf, msg.subscribe_id)?;
                encode_varint(buf, msg.track_alias)?;
                encode_string(buf, &msg.namespace)?;
                encode_string(buf, &msg.track_name)?;
                encode_auth_params(buf, msg.auth_info.as_deref())
            }
            ControlMessage::SubscribeOk(msg) => {
                encode_varint(buf, msg.subscribe_id)?;
                encode_varint(buf, msg.expires)?;
                encode_location(buf, msg.largest)
            }
            ControlMessage::SubscribeError(msg) => {
                encode_varint(buf, msg.subscribe_id)?;
                encode_varint(buf, msg.code)?;
                encode_string(buf, &msg.reason)?;
                encode_varint(buf, msg.track_alias)
            }
            ControlMessage::Announce(msg) => {
                encode_string(buf, &msg.namespace)?;
                encode_auth_params(buf, msg.auth_info.as_deref())
            }
            ControlMessage::AnnounceOk(msg) => encode_string(buf, &msg.namespace),
            ControlMessage::AnnounceError(msg) => {
                encode_string(buf, &msg.namespace)?;
                encode_varint(buf, msg.code)?;
                encode_string(buf, &msg.reason)
            }
            ControlMessage::Unannounce(msg) => encode_string(buf, &msg.namespace),
            ControlMessage::Unsubscribe(msg) => encode_varint(buf, msg.subscribe_id),
            ControlMessage::SubscribeDone(msg) => {
                encode_varint(buf, msg.subscribe_id)?;
                encode_varint(buf, msg.code)?;
                encode_string(buf, &msg.reason)?;
                encode_location(buf, msg.last)
            }
        }
    }

    /// Decode one message; `UnexpectedEnd` means more bytes are needed
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, ProtocolError> {
        let msg_type = decode_varint(buf)?;
        let msg = match msg_type {
            MSG_SETUP => {
                let count = decode_varint(buf)?;
                let mut versions = Vec::new();
                for _ in 0..count {
                    versions.push(decode_varint(buf)?);
                }
                let params = Params::decode(buf)?;
                ControlMessage::Setup(Setup {
                    versions,
                    role: params.role()?,
                })
            }
            MSG_SERVER_SETUP => {
                let version = decode_varint(buf)?;
                let params = Params::decode(buf)?;
                ControlMessage::ServerSetup(ServerSetup {
                    version,
                    role: params.role()?,
                })
            }
            MSG_SUBSCRIBE => {
                let subscribe_id = decode_varint(buf)?;
                let track_alias = decode_varint(buf)?;
                let namespace = decode_string(buf)?;
                let track_name = decode_string(buf)?;
                let params = Params::decode(buf)?;
                ControlMessage::Subscribe(Subscribe {
                    subscribe_id,
                    track_alias,
                    namespace,
                    track_name,
                    auth_info: params.auth_info,
                })
            }
            MSG_SUBSCRIBE_OK => ControlMessage::SubscribeOk(SubscribeOk {
                subscribe_id: decode_varint(buf)?,
                expires: decode_varint(buf)?,
                largest: decode_location(buf)?,
            }),
            MSG_SUBSCRIBE_ERROR => ControlMessage::SubscribeError(SubscribeError {
                subscribe_id: decode_varint(buf)?,
                code: decode_varint(buf)?,
                reason: decode_string(buf)?,
                track_alias: decode_varint(buf)?,
            }),
            MSG_ANNOUNCE => {
                let namespace = decode_string(buf)?;
                let params = Params::decode(buf)?;
                ControlMessage::Announce(Announce {
                    namespace,
                    auth_info: params.auth_info,
                })
            }
            MSG_ANNOUNCE_OK => ControlMessage::AnnounceOk(AnnounceOk {
                namespace: decode_string(buf)?,
            }),
            MSG_ANNOUNCE_ERROR => ControlMessage::AnnounceError(AnnounceError {
                namespace: decode_string(buf)?,
                code: decode_varint(buf)?,
                reason: decode_string(buf)?,
            }),
            MSG_UNANNOUNCE => ControlMessage::Unannounce(Unannounce {
                namespace: decode_string(buf)?,
            }),
            MSG_UNSUBSCRIBE => ControlMessage::Unsubscribe(Unsubscribe {
                subscribe_id: decode_varint(buf)?,
            }),
            MSG_SUBSCRIBE_DONE => ControlMessage::SubscribeDone(SubscribeDone {
                subscribe_id: decode_varint(buf)?,
                code: decode_varint(buf)?,
                reason: decode_string(buf)?,
                last: decode_location(buf)?,
            }),
            other => return Err(ProtocolError::UnknownMessage(other)),
        };
        Ok(msg)
    }
}

/// Parameters we understand; unknown keys are skipped
#[derive(Default)]
struct Params {
    role: Option<Role>,
    auth_info: Option<String>,
}

impl Params {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, ProtocolError> {
        let mut params = Params::default();
        let count = decode_varint(buf)?;
        for _ in 0..count {
            let key = decode_varint(buf)?;
            let mut value = decode_bytes(buf)?;
            match key {
                PARAM_ROLE => params.role = Some(Role::from_code(decode_varint(&mut value)?)?),
                PARAM_AUTHORIZATION_INFO => {
                    let info = String::from_utf8(value.to_vec())
                        .map_err(|_| ProtocolError::InvalidString)?;
                    params.auth_info = Some(info);
                }
                _ => {}
            }
        }
        Ok(params)
    }

    fn role(&self) -> Result<Role, ProtocolError> {
        self.role.ok_or(ProtocolError::InvalidValue {
            field: "missing role parameter",
            value: 0,
        })
    }
}

fn encode_role_params<B: BufMut>(buf: &mut B, role: Role) -> Result<(), ProtocolError> {
    let mut value = BytesMut::with_capacity(1);
    encode_varint(&mut value, role.code())?;
    encode_varint(buf, 1)?;
    encode_varint(buf, PARAM_ROLE)?;
    encode_bytes(buf, &value)
}

fn encode_auth_params<B: BufMut>(buf: &mut B, auth_info: Option<&str>) -> Result<(), ProtocolError> {
    match auth_info {
        Some(info) => {
            encode_varint(buf, 1)?;
            encode_varint(buf, PARAM_AUTHORIZATION_INFO)?;
            encode_string(buf, info)
        }
        None => encode_varint(buf, 0),
    }
}

fn encode_location<B: BufMut>(buf: &mut B, location: Option<Location>) -> Result<(), ProtocolError> {
    match location {
        Some(loc) => {
            encode_varint(buf, 1)?;
            encode_varint(buf, loc.group)?;
            encode_varint(buf, loc.object)
        }
        None => encode_varint(buf, 0),
    }
}

fn decode_location<B: Buf>(buf: &mut B) -> Result<Option<Location>, ProtocolError> {
    match decode_varint(buf)? {
        0 => Ok(None),
        1 => Ok(Some(Location {
            group: decode_varint(buf)?,
            object: decode_varint(buf)?,
        })),
        other => Err(ProtocolError::InvalidValue {
            field: "content exists",
            value: other,
        }),
    }
}

/// Framing for the control stream
///
/// Messages carry no length prefix, so decoding is attempted on a cursor and
/// only committed once a whole message parsed.
#[derive(Debug, Default, Clone, Copy)]
pub struct ControlCodec;

impl Decoder for ControlCodec {
    type Item = ControlMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let mut cursor = Cursor::new(&src[..]);
        match ControlMessage::decode(&mut cursor) {
            Ok(msg) => {
                let consumed = cursor.position() as usize;
                src.advance(consumed);
                Ok(Some(msg))
            }
            Err(ProtocolError::UnexpectedEnd) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: ControlMessage) -> ControlMessage {
        let mut codec = ControlCodec;
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        decoded
    }

    #[test]
    fn test_subscribe_carries_auth() {
        let msg = ControlMessage::Subscribe(Subscribe {
            subscribe_id: 7,
            track_alias: 300,
            namespace: "vc".into(),
            track_name: "v".into(),
            auth_info: Some("secret".into()),
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_subscribe_ok_without_content() {
        let msg = ControlMessage::SubscribeOk(SubscribeOk {
            subscribe_id: 1,
            expires: 0,
            largest: None,
        });
        assert_eq!(roundtrip(msg.clone()), msg);

        let msg = ControlMessage::SubscribeDone(SubscribeDone {
            subscribe_id: 1,
            code: super::super::subscribe_done::SUBSCRIPTION_ENDED,
            reason: "ended".into(),
            last: Some(Location { group: 4, object: 12 }),
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_partial_message_waits_for_more() {
        let msg = ControlMessage::Announce(Announce {
            namespace: "conference/alice".into(),
            auth_info: Some("token".into()),
        });
        let mut full = BytesMut::new();
        msg.encode(&mut full).unwrap();

        let mut codec = ControlCodec;
        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
        assert_eq!(partial.len(), full.len() - 3);

        partial.extend_from_slice(&full[full.len() - 3..]);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(msg));
    }

    #[test]
    fn test_two_messages_in_one_read() {
        let mut codec = ControlCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(ControlMessage::Unsubscribe(Unsubscribe { subscribe_id: 3 }), &mut buf)
            .unwrap();
        codec
            .encode(
                ControlMessage::AnnounceOk(AnnounceOk { namespace: "ns".into() }),
                &mut buf,
            )
            .unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().name(), "UNSUBSCRIBE");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().name(), "ANNOUNCE_OK");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_unknown_message_is_protocol_error() {
        let mut codec = ControlCodec;
        let mut buf = BytesMut::from(&[0x3f_u8, 0x00][..]);
        assert_eq!(codec.decode(&mut buf), Err(ProtocolError::UnknownMessage(0x3f)));
    }

    #[test]
    fn test_setup_requires_role() {
        let mut buf = BytesMut::new();
        encode_varint(&mut buf, MSG_SERVER_SETUP).unwrap();
        encode_varint(&mut buf, 1).unwrap();
        encode_varint(&mut buf, 0).unwrap();
        assert!(matches!(
            ControlMessage::decode(&mut buf.freeze()),
            Err(ProtocolError::InvalidValue { .. })
        ));
    }
}
