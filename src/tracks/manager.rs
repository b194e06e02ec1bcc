//! Publisher-side track table
//!
//! Resolves SUBSCRIBE requests against the configured tracks and keeps the
//! subscriber lists. Subscribe ids and track aliases are unique across all
//! tracks of a session.

use super::track::{InFlightCounter, Subscriber, TrackDescriptor};
use crate::error::ConfigError;
use crate::media::MediaType;
use crate::protocol::control::Subscribe;
use crate::protocol::subscribe_error;

/// Why a SUBSCRIBE was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeRejection {
    TrackDoesNotExist(String),
    Unauthorized(String),
    DuplicateTrackAlias(u64),
    DuplicateSubscribeId(u64),
}

impl SubscribeRejection {
    /// SUBSCRIBE_ERROR code sent back to the peer
    pub fn code(&self) -> u64 {
        match self {
            SubscribeRejection::TrackDoesNotExist(_) => subscribe_error::TRACK_DOES_NOT_EXIST,
            SubscribeRejection::Unauthorized(_) => subscribe_error::UNAUTHORIZED,
            SubscribeRejection::DuplicateTrackAlias(_) => subscribe_error::RETRY_TRACK_ALIAS,
            SubscribeRejection::DuplicateSubscribeId(_) => subscribe_error::INTERNAL,
        }
    }

    pub fn reason(&self) -> String {
        match self {
            SubscribeRejection::TrackDoesNotExist(name) => format!("Track {} does not exist", name),
            SubscribeRejection::Unauthorized(name) => format!("Invalid authInfo for {}", name),
            SubscribeRejection::DuplicateTrackAlias(alias) => format!("TrackAlias already in use {}", alias),
            SubscribeRejection::DuplicateSubscribeId(id) => format!("SubscribeID already in use {}", id),
        }
    }
}

/// A track and its current subscribers
#[derive(Debug, Clone)]
pub struct TrackEntry {
    pub descriptor: TrackDescriptor,
    pub subscribers: Vec<Subscriber>,
    /// Shared by every subscriber of the track
    pub in_flight: InFlightCounter,
}

/// All tracks published by a session
#[derive(Debug)]
pub struct TrackManager {
    tracks: Vec<TrackEntry>,
}

impl TrackManager {
    /// Validate the descriptors and build the table
    pub fn new(descriptors: Vec<TrackDescriptor>) -> Result<Self, ConfigError> {
        if descriptors.is_empty() {
            return Err(ConfigError::NoTracks);
        }

        let mut tracks: Vec<TrackEntry> = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            descriptor.validate()?;
            if tracks.iter().any(|t| t.descriptor.media_type == descriptor.media_type) {
                return Err(ConfigError::DuplicateTrack(descriptor.media_type.to_string()));
            }
            if tracks.iter().any(|t| t.descriptor.full_name() == descriptor.full_name()) {
                return Err(ConfigError::DuplicateTrack(descriptor.full_name()));
            }
            tracks.push(TrackEntry {
                descriptor,
                subscribers: Vec::new(),
                in_flight: InFlightCounter::new(),
            });
        }
        Ok(Self { tracks })
    }

    /// Distinct namespaces in configuration order
    pub fn namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = Vec::new();
        for track in &self.tracks {
            if !namespaces.contains(&track.descriptor.namespace) {
                namespaces.push(track.descriptor.namespace.clone());
            }
        }
        namespaces
    }

    pub fn track(&self, media_type: MediaType) -> Option<&TrackEntry> {
        self.tracks.iter().find(|t| t.descriptor.media_type == media_type)
    }

    pub fn tracks(&self) -> &[TrackEntry] {
        &self.tracks
    }

    fn find_alias(&self, track_alias: u64) -> bool {
        self.tracks
            .iter()
            .any(|t| t.subscribers.iter().any(|s| s.track_alias == track_alias))
    }

    fn find_subscribe_id(&self, subscribe_id: u64) -> bool {
        self.tracks
            .iter()
            .any(|t| t.subscribers.iter().any(|s| s.subscribe_id == subscribe_id))
    }

    /// Add a subscriber, returning the media type of the resolved track
    pub fn subscribe(&mut self, request: &Subscribe) -> Result<MediaType, SubscribeRejection> {
        let full_name = crate::protocol::full_track_name(&request.namespace, &request.track_name);
        let index = self
            .tracks
            .iter()
            .position(|t| t.descriptor.full_name() == full_name)
            .ok_or_else(|| SubscribeRejection::TrackDoesNotExist(full_name.clone()))?;

        if !self.tracks[index].descriptor.authorizes(request.auth_info.as_deref()) {
            return Err(SubscribeRejection::Unauthorized(full_name));
        }
        if self.find_alias(request.track_alias) {
            return Err(SubscribeRejection::DuplicateTrackAlias(request.track_alias));
        }
        if self.find_subscribe_id(request.subscribe_id) {
            return Err(SubscribeRejection::DuplicateSubscribeId(request.subscribe_id));
        }

        let track = &mut self.tracks[index];
        track
            .subscribers
            .push(Subscriber::new(request.subscribe_id, request.track_alias));
        Ok(track.descriptor.media_type)
    }

    /// Remove a subscriber by subscribe id
    pub fn unsubscribe(&mut self, subscribe_id: u64) -> Option<Subscriber> {
        for track in &mut self.tracks {
            if let Some(pos) = track.subscribers.iter().position(|s| s.subscribe_id == subscribe_id) {
                return Some(track.subscribers.remove(pos));
            }
        }
        None
    }

    pub fn subscriber_count(&self) -> usize {
        self.tracks.iter().map(|t| t.subscribers.len()).sum()
    }
}
