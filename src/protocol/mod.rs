//! MOQT-style wire protocol
//!
//! Control messages travel on one bidirectional stream, media objects on
//! datagrams or unidirectional streams depending on the track's
//! [`ObjectMapping`]. Every integer on the wire is a QUIC varint.

pub mod control;
pub mod object;
pub mod packet;
pub mod varint;

pub use control::{ControlCodec, ControlMessage};
pub use object::{ObjectHeader, ObjectStreamDecoder};
pub use packet::MediaPacket;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ProtocolError;
use varint::MAX_VARINT;

/// Protocol version offered in SETUP (draft-ietf-moq-transport-02)
pub const PROTOCOL_VERSION: u64 = 0xff00_0002;

/// SUBSCRIBE_ERROR codes
pub mod subscribe_error {
    pub const INTERNAL: u64 = 0x0;
    pub const INVALID_RANGE: u64 = 0x1;
    pub const RETRY_TRACK_ALIAS: u64 = 0x2;
    pub const TRACK_DOES_NOT_EXIST: u64 = 0x3;
    pub const UNAUTHORIZED: u64 = 0x4;
}

/// SUBSCRIBE_DONE status codes
pub mod subscribe_done {
    pub const UNSUBSCRIBED: u64 = 0x0;
    pub const INTERNAL: u64 = 0x1;
    pub const TRACK_ENDED: u64 = 0x3;
    pub const SUBSCRIPTION_ENDED: u64 = 0x4;
    pub const GOING_AWAY: u64 = 0x5;
}

/// Endpoint role negotiated in SETUP / SERVER_SETUP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Publisher,
    Subscriber,
    Both,
}

impl Role {
    pub fn code(&self) -> u64 {
        match self {
            Role::Publisher => 0x01,
            Role::Subscriber => 0x02,
            Role::Both => 0x03,
        }
    }

    pub fn from_code(code: u64) -> Result<Self, ProtocolError> {
        match code {
            0x01 => Ok(Role::Publisher),
            0x02 => Ok(Role::Subscriber),
            0x03 => Ok(Role::Both),
            other => Err(ProtocolError::InvalidValue {
                field: "role",
                value: other,
            }),
        }
    }

    /// Whether a peer with this role accepts objects we publish
    pub fn can_subscribe(&self) -> bool {
        matches!(self, Role::Subscriber | Role::Both)
    }

    /// Whether a peer with this role may publish objects to us
    pub fn can_publish(&self) -> bool {
        matches!(self, Role::Publisher | Role::Both)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Publisher => write!(f, "publisher"),
            Role::Subscriber => write!(f, "subscriber"),
            Role::Both => write!(f, "both"),
        }
    }
}

/// How objects of a track are mapped onto the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectMapping {
    /// One unreliable datagram per object
    ObjectPerDatagram,
    /// One unidirectional stream per object
    ObjectPerStream,
    /// One long-lived stream per track
    TrackPerStream,
    /// One stream per group of objects
    GroupPerStream,
}

impl Default for ObjectMapping {
    fn default() -> Self {
        ObjectMapping::ObjectPerStream
    }
}

/// Priority class of a track under contention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityClass {
    High,
    Low,
}

impl Default for PriorityClass {
    fn default() -> Self {
        PriorityClass::Low
    }
}

/// Send order used for objects that must go out before anything else
pub const SEND_ORDER_IMMEDIATE: u64 = MAX_VARINT;

/// Offset added to high priority objects so they outrank low priority objects of the same age
pub const HIGH_PRIORITY_OFFSET: u64 = MAX_VARINT / 2;

/// Compute the send order of an object; higher goes first
///
/// Newer objects outrank older ones, high priority tracks outrank low
/// priority tracks, and a negative sequence id means "send now". The result
/// always fits a varint and only `seq_id < 0` reaches
/// [`SEND_ORDER_IMMEDIATE`].
pub fn send_order(seq_id: i64, priority: PriorityClass) -> u64 {
    if seq_id < 0 {
        return SEND_ORDER_IMMEDIATE;
    }
    let base = (seq_id as u64).min(HIGH_PRIORITY_OFFSET - 1);
    match priority {
        PriorityClass::Low => base,
        PriorityClass::High => (base + HIGH_PRIORITY_OFFSET).min(SEND_ORDER_IMMEDIATE - 1),
    }
}

/// Full track name used to resolve subscriptions
pub fn full_track_name(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}
