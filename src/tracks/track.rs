//! Track descriptors and subscribers

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::constants::DEFAULT_MAX_IN_FLIGHT_REQUESTS;
use crate::error::ConfigError;
use crate::media::MediaType;
use crate::protocol::{full_track_name, ObjectMapping, PriorityClass};

fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT_REQUESTS
}

/// A published track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackDescriptor {
    pub media_type: MediaType,
    pub namespace: String,
    pub name: String,
    /// Token subscribers must present
    #[serde(default)]
    pub auth_info: Option<String>,
    /// Pending sends for the track, across subscribers, before new objects are dropped
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_requests: usize,
    #[serde(default)]
    pub priority: PriorityClass,
    #[serde(default)]
    pub mapping: ObjectMapping,
}

impl TrackDescriptor {
    /// Create a new track with default limits
    pub fn new(media_type: MediaType, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let priority = match media_type {
            MediaType::Audio => PriorityClass::High,
            _ => PriorityClass::Low,
        };
        Self {
            media_type,
            namespace: namespace.into(),
            name: name.into(),
            auth_info: None,
            max_in_flight_requests: DEFAULT_MAX_IN_FLIGHT_REQUESTS,
            priority,
            mapping: ObjectMapping::default(),
        }
    }

    pub fn with_auth_info(mut self, auth_info: impl Into<String>) -> Self {
        self.auth_info = Some(auth_info.into());
        self
    }

    pub fn with_mapping(mut self, mapping: ObjectMapping) -> Self {
        self.mapping = mapping;
        self
    }

    pub fn with_priority(mut self, priority: PriorityClass) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_in_flight_requests(mut self, max: usize) -> Self {
        self.max_in_flight_requests = max;
        self
    }

    pub fn full_name(&self) -> String {
        full_track_name(&self.namespace, &self.name)
    }

    /// Whether `presented` matches this track's token; absent and empty are equal
    pub fn authorizes(&self, presented: Option<&str>) -> bool {
        self.auth_info.as_deref().unwrap_or("") == presented.unwrap_or("")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() {
            return Err(ConfigError::MalformedTrack(format!("{} track has no namespace", self.media_type)));
        }
        if self.name.is_empty() {
            return Err(ConfigError::MalformedTrack(format!("{} track has no name", self.media_type)));
        }
        if self.max_in_flight_requests == 0 {
            return Err(ConfigError::MalformedTrack(format!(
                "{} maxInFlightRequests must be > 0",
                self.full_name()
            )));
        }
        Ok(())
    }
}

/// One subscription to a track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub subscribe_id: u64,
    pub track_alias: u64,
}

impl Subscriber {
    pub fn new(subscribe_id: u64, track_alias: u64) -> Self {
        Self {
            subscribe_id,
            track_alias,
        }
    }
}

/// Sends pending for one track, summed over all of its subscribers
#[derive(Debug, Clone, Default)]
pub struct InFlightCounter(Arc<AtomicUsize>);

impl InFlightCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// Reserve one send slot if fewer than `max` are pending
    pub fn try_reserve(&self, max: usize) -> Option<InFlightGuard> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| InFlightGuard(self.0.clone()))
    }
}

/// Held while a send is pending; releases the slot on drop
#[derive(Debug)]
pub struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
