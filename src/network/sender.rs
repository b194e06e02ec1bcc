//! Publisher side of a media transport session
//!
//! Opens the control stream, announces the configured namespaces, answers
//! SUBSCRIBE/UNSUBSCRIBE from the relay and turns every encoded chunk into
//! one object per subscriber. Objects go out on datagrams or unidirectional
//! streams according to the track's [`ObjectMapping`].

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::session::{SessionState, StateCell};
use super::transport::{RecvStream, SendStream, Transport};
use crate::error::{ConfigError, NetworkError, ProtocolError, SessionError};
use crate::events::{DropEvent, DropReason, EventSink, PipelineEvent};
use crate::media::{now_ms, ChunkType, EncodedMessage, MediaType};
use crate::protocol::control::{
    Announce, Location, ServerSetup, Setup, Subscribe, SubscribeDone, SubscribeError, SubscribeOk,
    Unannounce, Unsubscribe,
};
use crate::protocol::object::{
    encode_group_header, encode_group_object, encode_object_datagram, encode_object_stream,
    encode_track_header, encode_track_object,
};
use crate::protocol::{
    send_order, subscribe_done, ControlCodec, ControlMessage, MediaPacket, ObjectHeader, ObjectMapping,
    Role, PROTOCOL_VERSION,
};
use crate::tracks::{InFlightGuard, TrackDescriptor, TrackManager};

const ROLE: &str = "publisher";

/// Time allowed for each UNANNOUNCE while stopping
const UNANNOUNCE_TIMEOUT: Duration = Duration::from_secs(1);

type ControlWriter = FramedWrite<SendStream, ControlCodec>;
type ControlReader = FramedRead<RecvStream, ControlCodec>;

/// Publisher session configuration
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub tracks: Vec<TrackDescriptor>,
    /// Send a keep-alive ANNOUNCE when no object went out for this long; zero disables it
    pub keep_alive_interval: Duration,
}

impl PublisherConfig {
    pub fn new(tracks: Vec<TrackDescriptor>) -> Self {
        Self {
            tracks,
            keep_alive_interval: Duration::from_millis(crate::constants::DEFAULT_KEEP_ALIVE_MS),
        }
    }
}

/// Long-lived stream shared by consecutive objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum WriterKey {
    Track { alias: u64 },
    Group { alias: u64, group: u64 },
}

impl WriterKey {
    fn alias(&self) -> u64 {
        match self {
            WriterKey::Track { alias } | WriterKey::Group { alias, .. } => *alias,
        }
    }
}

struct WriterCommand {
    bytes: Bytes,
    _guard: InFlightGuard,
}

struct WriterHandle {
    tx: mpsc::Sender<WriterCommand>,
    generation: u64,
}

#[derive(Debug, Default)]
struct Counters {
    objects_sent: AtomicU64,
    objects_dropped: AtomicU64,
    send_errors: AtomicU64,
}

/// Per subscriber snapshot
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberStats {
    pub media_type: MediaType,
    pub subscribe_id: u64,
    pub track_alias: u64,
}

/// Per track snapshot; `in_flight` counts pending sends to all subscribers
#[derive(Debug, Clone, Serialize)]
pub struct TrackStats {
    pub media_type: MediaType,
    pub full_name: String,
    pub subscribers: usize,
    pub in_flight: usize,
    pub max_in_flight: usize,
}

/// Publisher statistics
#[derive(Debug, Clone, Serialize)]
pub struct SenderStats {
    pub clock_ms: i64,
    pub state: SessionState,
    pub objects_sent: u64,
    pub objects_dropped: u64,
    pub send_errors: u64,
    pub open_streams: usize,
    pub tracks: Vec<TrackStats>,
    pub subscribers: Vec<SubscriberStats>,
}

struct Shared<T: Transport> {
    transport: Arc<T>,
    state: StateCell,
    starting: AtomicBool,
    tracks: Mutex<TrackManager>,
    /// Last (group, object) sent per track alias
    last_sent: Mutex<HashMap<u64, Location>>,
    writers: DashMap<WriterKey, WriterHandle>,
    next_generation: AtomicU64,
    control: AsyncMutex<Option<ControlWriter>>,
    announced: Mutex<Vec<String>>,
    keep_alive_namespace: String,
    keep_alive_interval: Duration,
    last_object_sent_ms: AtomicI64,
    cancel: CancellationToken,
    tasks: TaskTracker,
    events: EventSink,
    counters: Counters,
}

/// Publishing endpoint of a media transport session
///
/// Cheap to clone; clones share the same session.
pub struct PublisherSession<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for PublisherSession<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Transport> PublisherSession<T> {
    /// Validate the configuration and create an idle session
    pub fn new(transport: Arc<T>, config: PublisherConfig, events: EventSink) -> Result<Self, ConfigError> {
        let tracks = TrackManager::new(config.tracks)?;
        let keep_alive_namespace = format!("{}-keepAlive", uuid::Uuid::new_v4().simple());

        Ok(Self {
            shared: Arc::new(Shared {
                transport,
                state: StateCell::new(),
                starting: AtomicBool::new(false),
                tracks: Mutex::new(tracks),
                last_sent: Mutex::new(HashMap::new()),
                writers: DashMap::new(),
                next_generation: AtomicU64::new(0),
                control: AsyncMutex::new(None),
                announced: Mutex::new(Vec::new()),
                keep_alive_namespace,
                keep_alive_interval: config.keep_alive_interval,
                last_object_sent_ms: AtomicI64::new(now_ms()),
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
                events,
                counters: Counters::default(),
            }),
        })
    }

    /// Get current session state
    pub fn state(&self) -> SessionState {
        self.shared.state.get()
    }

    /// Last (group, object) sent on a track alias
    pub fn last_sent(&self, track_alias: u64) -> Option<Location> {
        self.shared.last_sent(track_alias)
    }

    /// Set up the control stream and announce every namespace
    ///
    /// Resolves once the session is running. On failure the session is
    /// stopped and the transport closed.
    pub async fn start(&self) -> Result<(), SessionError> {
        let shared = &self.shared;
        match shared.state.touch() {
            SessionState::Instantiated => {}
            SessionState::Stopped => {
                tracing::warn!("Publisher session already stopped, ignoring start");
                return Err(SessionError::InvalidState("session is stopped".into()));
            }
            state => return Err(SessionError::InvalidState(format!("start called while {}", state))),
        }
        if shared.starting.swap(true, Ordering::AcqRel) {
            return Err(SessionError::InvalidState("start already in progress".into()));
        }

        let handshake = tokio::select! {
            _ = shared.cancel.cancelled() => Err(NetworkError::Aborted.into()),
            result = shared.handshake() => result,
        };
        let reader = match handshake {
            Ok(reader) => reader,
            Err(e) => {
                shared.fail(e.clone());
                return Err(e);
            }
        };

        if !shared.state.set_running() {
            return Err(SessionError::InvalidState("session stopped during setup".into()));
        }
        shared.last_object_sent_ms.store(now_ms(), Ordering::Relaxed);
        tracing::info!("Publisher session running");
        shared.events.emit(PipelineEvent::SessionRunning { role: ROLE });

        let control = shared.clone();
        shared.tasks.spawn(async move { control.control_loop(reader).await });
        if !shared.keep_alive_interval.is_zero() {
            let keep_alive = shared.clone();
            shared.tasks.spawn(async move { keep_alive.keep_alive_loop().await });
        }
        Ok(())
    }

    /// Publish one encoded chunk to every subscriber of its track
    ///
    /// Never blocks: sends run on spawned tasks, and a subscriber with too
    /// many pending sends loses the object. Must be called from within a
    /// tokio runtime. Chunks arriving before the session runs are dropped.
    pub fn handle_encoded_frame(&self, msg: EncodedMessage) -> Result<(), SessionError> {
        self.shared.handle_encoded_frame(msg)
    }

    /// Unannounce, close the transport and wait for pending sends to finish
    pub async fn stop(&self) {
        let shared = &self.shared;
        shared.state.touch();
        if shared.state.stop() == SessionState::Stopped {
            tracing::warn!("Publisher session already stopped");
            return;
        }
        tracing::info!("Stopping publisher session");
        shared.cancel.cancel();
        shared.writers.clear();

        let announced = std::mem::take(&mut *shared.announced.lock());
        for namespace in announced {
            let msg = ControlMessage::Unannounce(Unannounce {
                namespace: namespace.clone(),
            });
            match tokio::time::timeout(UNANNOUNCE_TIMEOUT, shared.send_control(msg)).await {
                Ok(Ok(())) => tracing::debug!("Unannounced {}", namespace),
                Ok(Err(e)) => tracing::warn!("Failed to unannounce {}: {}", namespace, e),
                Err(_) => tracing::warn!("Timed out unannouncing {}", namespace),
            }
        }
        if let Some(mut writer) = shared.control.lock().await.take() {
            if let Err(e) = writer.close().await {
                tracing::debug!("Control stream close failed: {}", e);
            }
        }

        shared.transport.close(0, "publisher stopped");
        shared.tasks.close();
        shared.tasks.wait().await;
        shared.events.emit(PipelineEvent::SessionClosed {
            role: ROLE,
            reason: "stopped".into(),
        });
        tracing::info!("Publisher session stopped");
    }

    /// Get publisher statistics
    pub fn stats(&self) -> SenderStats {
        let shared = &self.shared;
        let (tracks, subscribers) = {
            let manager = shared.tracks.lock();
            let tracks = manager
                .tracks()
                .iter()
                .map(|track| TrackStats {
                    media_type: track.descriptor.media_type,
                    full_name: track.descriptor.full_name(),
                    subscribers: track.subscribers.len(),
                    in_flight: track.in_flight.current(),
                    max_in_flight: track.descriptor.max_in_flight_requests,
                })
                .collect();
            let subscribers = manager
                .tracks()
                .iter()
                .flat_map(|track| {
                    track.subscribers.iter().map(move |s| SubscriberStats {
                        media_type: track.descriptor.media_type,
                        subscribe_id: s.subscribe_id,
                        track_alias: s.track_alias,
                    })
                })
                .collect();
            (tracks, subscribers)
        };

        SenderStats {
            clock_ms: now_ms(),
            state: shared.state.get(),
            objects_sent: shared.counters.objects_sent.load(Ordering::Relaxed),
            objects_dropped: shared.counters.objects_dropped.load(Ordering::Relaxed),
            send_errors: shared.counters.send_errors.load(Ordering::Relaxed),
            open_streams: shared.writers.len(),
            tracks,
            subscribers,
        }
    }
}

async fn read_message(reader: &mut ControlReader) -> Result<ControlMessage, SessionError> {
    match reader.next().await {
        Some(Ok(msg)) => Ok(msg),
        Some(Err(e)) => Err(e.into()),
        None => Err(NetworkError::TransportClosed("control stream ended".into()).into()),
    }
}

fn write_failed(err: std::io::Error) -> NetworkError {
    NetworkError::WriteFailed(err.to_string())
}

impl<T: Transport> Shared<T> {
    fn last_sent(&self, track_alias: u64) -> Option<Location> {
        self.last_sent.lock().get(&track_alias).copied()
    }

    async fn handshake(&self) -> Result<ControlReader, SessionError> {
        let (send, recv) = self.transport.open_bi().await?;
        let mut writer = FramedWrite::new(send, ControlCodec);
        let mut reader = FramedRead::new(recv, ControlCodec);

        writer
            .send(ControlMessage::Setup(Setup {
                versions: vec![PROTOCOL_VERSION],
                role: Role::Publisher,
            }))
            .await?;

        match read_message(&mut reader).await? {
            ControlMessage::ServerSetup(ServerSetup { version, role }) => {
                if version != PROTOCOL_VERSION {
                    return Err(ProtocolError::InvalidValue {
                        field: "version",
                        value: version,
                    }
                    .into());
                }
                if !role.can_subscribe() {
                    return Err(ProtocolError::IncompatibleRole(role.to_string()).into());
                }
                tracing::debug!("Received SERVER_SETUP, peer role {}", role);
            }
            other => {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: "SERVER_SETUP",
                    received: other.name().to_string(),
                }
                .into())
            }
        }

        // One ANNOUNCE per namespace, carrying the auth of its first track
        let announcements: Vec<(String, Option<String>)> = {
            let tracks = self.tracks.lock();
            tracks
                .namespaces()
                .into_iter()
                .map(|namespace| {
                    let auth_info = tracks
                        .tracks()
                        .iter()
                        .find(|t| t.descriptor.namespace == namespace)
                        .and_then(|t| t.descriptor.auth_info.clone());
                    (namespace, auth_info)
                })
                .collect()
        };

        for (namespace, auth_info) in announcements {
            writer
                .send(ControlMessage::Announce(Announce {
                    namespace: namespace.clone(),
                    auth_info,
                }))
                .await?;

            match read_message(&mut reader).await? {
                ControlMessage::AnnounceOk(ok) if ok.namespace == namespace => {
                    tracing::info!("Announced namespace {}", namespace);
                    self.announced.lock().push(namespace);
                }
                ControlMessage::AnnounceOk(ok) => {
                    return Err(ProtocolError::NamespaceMismatch {
                        expected: namespace,
                        received: ok.namespace,
                    }
                    .into())
                }
                ControlMessage::AnnounceError(err) => {
                    return Err(ProtocolError::AnnounceRejected {
                        namespace: err.namespace,
                        code: err.code,
                        reason: err.reason,
                    }
                    .into())
                }
                other => {
                    return Err(ProtocolError::UnexpectedMessage {
                        expected: "ANNOUNCE_OK",
                        received: other.name().to_string(),
                    }
                    .into())
                }
            }
        }

        *self.control.lock().await = Some(writer);
        Ok(reader)
    }

    async fn send_control(&self, msg: ControlMessage) -> Result<(), SessionError> {
        let mut control = self.control.lock().await;
        let writer = control
            .as_mut()
            .ok_or_else(|| SessionError::InvalidState("control stream not open".into()))?;
        writer.send(msg).await?;
        Ok(())
    }

    /// Tear the session down after an unrecoverable error
    fn fail(&self, err: SessionError) {
        if self.state.stop() == SessionState::Stopped {
            return;
        }
        tracing::error!("Publisher session failed: {}", err);
        self.cancel.cancel();
        self.writers.clear();
        self.transport.close(1, "publisher session error");
        self.events.emit(PipelineEvent::SessionClosed {
            role: ROLE,
            reason: err.to_string(),
        });
    }

    async fn control_loop(self: Arc<Self>, mut reader: ControlReader) {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return,
                next = reader.next() => next,
            };
            let result = match next {
                Some(Ok(msg)) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        result = self.handle_control(msg) => result,
                    }
                }
                Some(Err(e)) => Err(e.into()),
                None => Err(NetworkError::TransportClosed("control stream ended".into()).into()),
            };
            if let Err(e) = result {
                self.fail(e);
                return;
            }
        }
    }

    async fn handle_control(&self, msg: ControlMessage) -> Result<(), SessionError> {
        match msg {
            ControlMessage::Subscribe(request) => self.handle_subscribe(request).await,
            ControlMessage::Unsubscribe(Unsubscribe { subscribe_id }) => {
                let removed = self.tracks.lock().unsubscribe(subscribe_id);
                let Some(subscriber) = removed else {
                    tracing::warn!("UNSUBSCRIBE for unknown subscribe id {}", subscribe_id);
                    return Ok(());
                };
                let alias = subscriber.track_alias;
                self.writers.retain(|key, _| key.alias() != alias);
                tracing::info!("Unsubscribed id {} (alias {})", subscribe_id, alias);

                self.send_control(ControlMessage::SubscribeDone(SubscribeDone {
                    subscribe_id,
                    code: subscribe_done::SUBSCRIPTION_ENDED,
                    reason: "Subscription ended".into(),
                    last: self.last_sent(alias),
                }))
                .await
            }
            ControlMessage::AnnounceOk(ok) if ok.namespace == self.keep_alive_namespace => {
                tracing::trace!("Keep-alive acknowledged");
                Ok(())
            }
            other => {
                tracing::warn!("Ignoring unexpected {} on publisher control stream", other.name());
                Ok(())
            }
        }
    }

    async fn handle_subscribe(&self, request: Subscribe) -> Result<(), SessionError> {
        let result = self.tracks.lock().subscribe(&request);
        let reply = match result {
            Ok(media_type) => {
                tracing::info!(
                    "Subscribed {}/{} ({}) id {} alias {}",
                    request.namespace,
                    request.track_name,
                    media_type,
                    request.subscribe_id,
                    request.track_alias
                );
                ControlMessage::SubscribeOk(SubscribeOk {
                    subscribe_id: request.subscribe_id,
                    expires: 0,
                    largest: self.last_sent(request.track_alias),
                })
            }
            Err(rejection) => {
                tracing::warn!("Rejected SUBSCRIBE {}: {}", request.subscribe_id, rejection.reason());
                ControlMessage::SubscribeError(SubscribeError {
                    subscribe_id: request.subscribe_id,
                    code: rejection.code(),
                    reason: rejection.reason(),
                    track_alias: request.track_alias,
                })
            }
        };
        self.send_control(reply).await
    }

    async fn keep_alive_loop(self: Arc<Self>) {
        let interval = self.keep_alive_interval;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let idle_ms = now_ms() - self.last_object_sent_ms.load(Ordering::Relaxed);
            if idle_ms < interval.as_millis() as i64 {
                continue;
            }

            tracing::debug!("No object sent for {}ms, sending keep-alive", idle_ms);
            let msg = ControlMessage::Announce(Announce {
                namespace: self.keep_alive_namespace.clone(),
                auth_info: None,
            });
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = self.send_control(msg) => result,
            };
            if let Err(e) = result {
                tracing::warn!("Keep-alive failed: {}", e);
            }
        }
    }

    fn handle_encoded_frame(self: &Arc<Self>, msg: EncodedMessage) -> Result<(), SessionError> {
        match self.state.touch() {
            SessionState::Running => {}
            SessionState::Stopped => {
                tracing::warn!("Publisher session stopped, dropping {} chunk {}", msg.media_type, msg.seq_id);
                return Ok(());
            }
            _ => {
                tracing::debug!("Publisher session not running yet, dropping {} chunk", msg.media_type);
                return Ok(());
            }
        }

        let (mapping, priority, max_in_flight, in_flight, subscribers) = {
            let tracks = self.tracks.lock();
            let Some(track) = tracks.track(msg.media_type) else {
                tracing::warn!("No track configured for {}, dropping chunk", msg.media_type);
                return Ok(());
            };
            if track.subscribers.is_empty() {
                return Ok(());
            }
            (
                msg.mapping.unwrap_or(track.descriptor.mapping),
                track.descriptor.priority,
                track.descriptor.max_in_flight_requests,
                track.in_flight.clone(),
                track.subscribers.clone(),
            )
        };

        let order = send_order(msg.seq_id, priority);
        let payload = MediaPacket::from_message(&msg).encode()?;
        let mut result = Ok(());
        let mut dispatched = false;

        for subscriber in subscribers {
            let Some(guard) = in_flight.try_reserve(max_in_flight) else {
                self.counters.objects_dropped.fetch_add(1, Ordering::Relaxed);
                self.events.drop_event(
                    DropEvent::new(msg.media_type, DropReason::InFlightLimit)
                        .with_seq_id(msg.seq_id)
                        .with_timestamp(msg.chunk.timestamp),
                );
                continue;
            };

            let location = match self.next_location(subscriber.track_alias, msg.chunk.chunk_type) {
                Ok(location) => location,
                Err(e) => {
                    tracing::warn!("Dropping {} chunk {}: {}", msg.media_type, msg.seq_id, e);
                    self.counters.objects_dropped.fetch_add(1, Ordering::Relaxed);
                    if result.is_ok() {
                        result = Err(e.into());
                    }
                    continue;
                }
            };

            let header = ObjectHeader {
                subscribe_id: subscriber.subscribe_id,
                track_alias: subscriber.track_alias,
                group: location.group,
                object: location.object,
                send_order: order,
            };
            match self.dispatch(mapping, header, &payload, guard) {
                Ok(()) => dispatched = true,
                Err(e) => {
                    tracing::warn!("Failed to frame object {}/{}: {}", location.group, location.object, e);
                    if result.is_ok() {
                        result = Err(e.into());
                    }
                }
            }
        }

        // Keep-alive only counts objects that actually went out
        if dispatched {
            self.last_object_sent_ms.store(now_ms(), Ordering::Relaxed);
        }
        result
    }

    /// Assign (group, object) for the next object of an alias
    ///
    /// A key chunk opens a new group; a delta continues the current one.
    fn next_location(&self, track_alias: u64, chunk_type: ChunkType) -> Result<Location, ConfigError> {
        let mut last_sent = self.last_sent.lock();
        let location = match (last_sent.get(&track_alias), chunk_type) {
            (None, ChunkType::Delta) => return Err(ConfigError::FirstObjectDelta(track_alias)),
            (None, ChunkType::Key) => Location { group: 0, object: 0 },
            (Some(last), ChunkType::Key) => Location {
                group: last.group + 1,
                object: 0,
            },
            (Some(last), ChunkType::Delta) => Location {
                group: last.group,
                object: last.object + 1,
            },
        };
        last_sent.insert(track_alias, location);
        Ok(location)
    }

    fn dispatch(
        self: &Arc<Self>,
        mapping: ObjectMapping,
        header: ObjectHeader,
        payload: &[u8],
        guard: InFlightGuard,
    ) -> Result<(), ProtocolError> {
        match mapping {
            ObjectMapping::ObjectPerDatagram => {
                let datagram = encode_object_datagram(&header, payload)?;
                let shared = self.clone();
                self.tasks.spawn(async move {
                    let _guard = guard;
                    let result = tokio::select! {
                        _ = shared.cancel.cancelled() => Err(NetworkError::Aborted),
                        result = shared.transport.send_datagram(datagram) => result,
                    };
                    shared.finish_send(result);
                });
            }
            ObjectMapping::ObjectPerStream => {
                let bytes = encode_object_stream(&header, payload)?;
                let shared = self.clone();
                self.tasks.spawn(async move {
                    let _guard = guard;
                    let send = async {
                        let mut stream = shared.transport.open_uni(header.send_order).await?;
                        stream.write_all(&bytes).await.map_err(write_failed)?;
                        stream.shutdown().await.map_err(write_failed)?;
                        Ok(())
                    };
                    let result = tokio::select! {
                        _ = shared.cancel.cancelled() => Err(NetworkError::Aborted),
                        result = send => result,
                    };
                    shared.finish_send(result);
                });
            }
            ObjectMapping::TrackPerStream => {
                let key = WriterKey::Track {
                    alias: header.track_alias,
                };
                let stream_header = encode_track_header(header.subscribe_id, header.track_alias, header.send_order)?;
                let command = WriterCommand {
                    bytes: encode_track_object(header.group, header.object, payload)?,
                    _guard: guard,
                };
                self.write_on_stream(key, stream_header, header.send_order, command);
            }
            ObjectMapping::GroupPerStream => {
                let key = WriterKey::Group {
                    alias: header.track_alias,
                    group: header.group,
                };
                let stream_header = encode_group_header(
                    header.subscribe_id,
                    header.track_alias,
                    header.group,
                    header.send_order,
                )?;
                let command = WriterCommand {
                    bytes: encode_group_object(header.object, payload)?,
                    _guard: guard,
                };
                let opened = self.write_on_stream(key, stream_header, header.send_order, command);
                if opened && header.group > 0 {
                    // Closing the sender lets the previous group's stream finish
                    self.writers.remove(&WriterKey::Group {
                        alias: header.track_alias,
                        group: header.group - 1,
                    });
                }
            }
        }
        Ok(())
    }

    /// Queue an object on the stream for `key`, opening it if needed
    ///
    /// Returns true when a new stream was opened.
    fn write_on_stream(
        self: &Arc<Self>,
        key: WriterKey,
        stream_header: Bytes,
        send_order: u64,
        command: WriterCommand,
    ) -> bool {
        let mut command = command;
        if let Some(handle) = self.writers.get(&key) {
            match handle.tx.try_send(command) {
                Ok(()) => return false,
                Err(TrySendError::Full(_)) => {
                    tracing::debug!("Stream queue full for {:?}, object dropped", key);
                    self.counters.objects_dropped.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                Err(TrySendError::Closed(returned)) => {
                    command = returned;
                    let generation = handle.generation;
                    drop(handle);
                    self.writers.remove_if(&key, |_, h| h.generation == generation);
                }
            }
        }

        let (tx, rx) = mpsc::channel(crate::constants::STREAM_WRITER_QUEUE);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.writers.insert(key, WriterHandle { tx, generation });

        let shared = self.clone();
        self.tasks.spawn(async move {
            shared
                .run_stream_writer(key, generation, stream_header, send_order, command, rx)
                .await
        });
        true
    }

    async fn run_stream_writer(
        self: Arc<Self>,
        key: WriterKey,
        generation: u64,
        stream_header: Bytes,
        send_order: u64,
        first: WriterCommand,
        mut rx: mpsc::Receiver<WriterCommand>,
    ) {
        let counters = &self.counters;
        let transport = &self.transport;
        let rx = &mut rx;
        let work = async move {
            let mut stream = transport.open_uni(send_order).await?;
            stream.write_all(&stream_header).await.map_err(write_failed)?;

            let mut next = Some(first);
            while let Some(command) = next {
                stream.write_all(&command.bytes).await.map_err(write_failed)?;
                counters.objects_sent.fetch_add(1, Ordering::Relaxed);
                drop(command);
                next = rx.recv().await;
            }
            stream.shutdown().await.map_err(write_failed)?;
            Ok::<(), NetworkError>(())
        };

        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(NetworkError::Aborted),
            result = work => result,
        };
        match result {
            Ok(()) => tracing::trace!("Stream {:?} finished", key),
            Err(NetworkError::Aborted) => tracing::trace!("Stream {:?} aborted", key),
            Err(e) => {
                tracing::warn!("Stream {:?} failed: {}", key, e);
                counters.send_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.writers.remove_if(&key, |_, h| h.generation == generation);
    }

    fn finish_send(&self, result: Result<(), NetworkError>) {
        match result {
            Ok(()) => {
                self.counters.objects_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(NetworkError::Aborted) => {}
            Err(e) => {
                tracing::warn!("Object send failed: {}", e);
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSink;
    use crate::media::Chunk;
    use crate::network::memory::MemoryTransport;
    use crate::protocol::control::AnnounceOk;
    use crate::protocol::object::ObjectFrame;
    use crate::protocol::{subscribe_error, ObjectStreamDecoder};

    const NS: &str = "vc/alice";

    /// Relay side of the control stream
    struct Relay {
        transport: MemoryTransport,
        writer: ControlWriter,
        reader: ControlReader,
    }

    impl Relay {
        async fn accept(transport: MemoryTransport) -> (Self, Setup) {
            let (send, recv) = transport.accept_bi().await.unwrap();
            let mut relay = Self {
                transport,
                writer: FramedWrite::new(send, ControlCodec),
                reader: FramedRead::new(recv, ControlCodec),
            };
            let setup = match relay.recv().await {
                ControlMessage::Setup(setup) => setup,
                other => panic!("expected SETUP, got {}", other.name()),
            };
            (relay, setup)
        }

        async fn send(&mut self, msg: ControlMessage) {
            self.writer.send(msg).await.unwrap();
        }

        async fn recv(&mut self) -> ControlMessage {
            tokio::time::timeout(Duration::from_secs(2), self.reader.next())
                .await
                .expect("control message timed out")
                .unwrap()
                .unwrap()
        }

        /// Complete SETUP and accept every ANNOUNCE
        async fn handshake(transport: MemoryTransport, namespaces: usize) -> Self {
            let (mut relay, _) = Self::accept(transport).await;
            relay
                .send(ControlMessage::ServerSetup(ServerSetup {
                    version: PROTOCOL_VERSION,
                    role: Role::Subscriber,
                }))
                .await;
            for _ in 0..namespaces {
                let ControlMessage::Announce(announce) = relay.recv().await else {
                    panic!("expected ANNOUNCE");
                };
                relay
                    .send(ControlMessage::AnnounceOk(AnnounceOk {
                        namespace: announce.namespace,
                    }))
                    .await;
            }
            relay
        }

        async fn subscribe(&mut self, subscribe_id: u64, track_alias: u64, name: &str) -> ControlMessage {
            self.send(ControlMessage::Subscribe(Subscribe {
                subscribe_id,
                track_alias,
                namespace: NS.into(),
                track_name: name.into(),
                auth_info: None,
            }))
            .await;
            self.recv().await
        }

        async fn next_stream_object(&self) -> ObjectFrame {
            let stream = self.transport.accept_uni().await.unwrap();
            let mut objects = FramedRead::new(stream, ObjectStreamDecoder::new());
            tokio::time::timeout(Duration::from_secs(2), objects.next())
                .await
                .expect("object timed out")
                .unwrap()
                .unwrap()
        }
    }

    fn tracks(mapping: ObjectMapping) -> Vec<TrackDescriptor> {
        vec![
            TrackDescriptor::new(MediaType::Audio, NS, "audio").with_mapping(mapping),
            TrackDescriptor::new(MediaType::Video, NS, "video").with_mapping(mapping),
        ]
    }

    fn publisher(
        transport: MemoryTransport,
        tracks: Vec<TrackDescriptor>,
    ) -> (PublisherSession<MemoryTransport>, crossbeam_channel::Receiver<PipelineEvent>) {
        let (events, rx) = EventSink::bounded(64);
        let config = PublisherConfig {
            tracks,
            keep_alive_interval: Duration::ZERO,
        };
        (PublisherSession::new(Arc::new(transport), config, events).unwrap(), rx)
    }

    async fn running(mapping: ObjectMapping) -> (PublisherSession<MemoryTransport>, Relay) {
        let (local, remote) = MemoryTransport::pair();
        let (session, _events) = publisher(local, tracks(mapping));
        let (started, relay) = tokio::join!(session.start(), Relay::handshake(remote, 1));
        started.unwrap();
        (session, relay)
    }

    fn video(seq_id: i64, key: bool) -> EncodedMessage {
        let ts = seq_id * 33_000;
        let chunk = if key {
            Chunk::key(ts, 33_000, vec![seq_id as u8; 32])
        } else {
            Chunk::delta(ts, 33_000, vec![seq_id as u8; 32])
        };
        EncodedMessage::new(MediaType::Video, chunk, seq_id)
    }

    #[test]
    fn test_empty_config_rejected_before_io() {
        let (local, _remote) = MemoryTransport::pair();
        let result = PublisherSession::new(
            Arc::new(local),
            PublisherConfig::new(vec![]),
            EventSink::disabled(),
        );
        assert!(matches!(result, Err(ConfigError::NoTracks)));
    }

    #[tokio::test]
    async fn test_handshake() {
        let (local, remote) = MemoryTransport::pair();
        let (session, events) = publisher(local, tracks(ObjectMapping::ObjectPerStream));
        assert_eq!(session.state(), SessionState::Created);

        let relay = async {
            let (mut relay, setup) = Relay::accept(remote).await;
            assert_eq!(setup.role, Role::Publisher);
            assert!(setup.versions.contains(&PROTOCOL_VERSION));
            relay
                .send(ControlMessage::ServerSetup(ServerSetup {
                    version: PROTOCOL_VERSION,
                    role: Role::Both,
                }))
                .await;
            let ControlMessage::Announce(announce) = relay.recv().await else {
                panic!("expected ANNOUNCE");
            };
            assert_eq!(announce.namespace, NS);
            relay
                .send(ControlMessage::AnnounceOk(AnnounceOk { namespace: NS.into() }))
                .await;
            relay
        };
        let (started, _relay) = tokio::join!(session.start(), relay);
        started.unwrap();

        assert_eq!(session.state(), SessionState::Running);
        assert!(matches!(
            events.try_recv(),
            Ok(PipelineEvent::SessionRunning { role: "publisher" })
        ));
    }

    #[tokio::test]
    async fn test_incompatible_role_stops_session() {
        let (local, remote) = MemoryTransport::pair();
        let (session, _events) = publisher(local, tracks(ObjectMapping::ObjectPerStream));

        let relay = async {
            let (mut relay, _) = Relay::accept(remote).await;
            relay
                .send(ControlMessage::ServerSetup(ServerSetup {
                    version: PROTOCOL_VERSION,
                    role: Role::Publisher,
                }))
                .await;
            relay
        };
        let (started, _relay) = tokio::join!(session.start(), relay);

        assert_eq!(
            started,
            Err(SessionError::Protocol(ProtocolError::IncompatibleRole("publisher".into())))
        );
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_announce_rejected() {
        let (local, remote) = MemoryTransport::pair();
        let (session, _events) = publisher(local, tracks(ObjectMapping::ObjectPerStream));

        let relay = async {
            let (mut relay, _) = Relay::accept(remote).await;
            relay
                .send(ControlMessage::ServerSetup(ServerSetup {
                    version: PROTOCOL_VERSION,
                    role: Role::Subscriber,
                }))
                .await;
            relay.recv().await;
            relay
                .send(ControlMessage::AnnounceError(crate::protocol::control::AnnounceError {
                    namespace: NS.into(),
                    code: 1,
                    reason: "nope".into(),
                }))
                .await;
            relay
        };
        let (started, _relay) = tokio::join!(session.start(), relay);

        assert!(matches!(
            started,
            Err(SessionError::Protocol(ProtocolError::AnnounceRejected { code: 1, .. }))
        ));
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_subscribe_replies() {
        let (_session, mut relay) = running(ObjectMapping::ObjectPerStream).await;

        let ControlMessage::SubscribeOk(ok) = relay.subscribe(1, 100, "video").await else {
            panic!("expected SUBSCRIBE_OK");
        };
        assert_eq!(ok.subscribe_id, 1);
        assert_eq!(ok.largest, None);

        let ControlMessage::SubscribeError(err) = relay.subscribe(1, 101, "audio").await else {
            panic!("expected SUBSCRIBE_ERROR");
        };
        assert_eq!(err.code, subscribe_error::INTERNAL);

        let ControlMessage::SubscribeError(err) = relay.subscribe(2, 100, "audio").await else {
            panic!("expected SUBSCRIBE_ERROR");
        };
        assert_eq!(err.code, subscribe_error::RETRY_TRACK_ALIAS);
        assert_eq!(err.track_alias, 100);

        let ControlMessage::SubscribeError(err) = relay.subscribe(3, 102, "screen").await else {
            panic!("expected SUBSCRIBE_ERROR");
        };
        assert_eq!(err.code, subscribe_error::TRACK_DOES_NOT_EXIST);
    }

    #[tokio::test]
    async fn test_object_per_stream_numbering() {
        let (session, mut relay) = running(ObjectMapping::ObjectPerStream).await;
        relay.subscribe(1, 100, "video").await;

        session.handle_encoded_frame(video(0, true)).unwrap();
        let first = relay.next_stream_object().await;
        assert_eq!((first.header.group, first.header.object), (0, 0));
        assert_eq!(first.header.track_alias, 100);
        let packet = MediaPacket::decode(first.payload).unwrap();
        assert_eq!(packet.seq_id, 0);
        assert_eq!(packet.chunk_type, ChunkType::Key);

        session.handle_encoded_frame(video(1, false)).unwrap();
        let second = relay.next_stream_object().await;
        assert_eq!((second.header.group, second.header.object), (0, 1));

        session.handle_encoded_frame(video(2, true)).unwrap();
        let third = relay.next_stream_object().await;
        assert_eq!((third.header.group, third.header.object), (1, 0));
        assert!(third.header.send_order > first.header.send_order);

        assert_eq!(session.last_sent(100), Some(Location { group: 1, object: 0 }));
    }

    #[tokio::test]
    async fn test_first_object_delta_rejected() {
        let (session, mut relay) = running(ObjectMapping::ObjectPerStream).await;
        relay.subscribe(1, 100, "video").await;

        assert_eq!(
            session.handle_encoded_frame(video(0, false)),
            Err(SessionError::Config(ConfigError::FirstObjectDelta(100)))
        );
        assert_eq!(session.last_sent(100), None);

        session.handle_encoded_frame(video(1, true)).unwrap();
        let object = relay.next_stream_object().await;
        assert_eq!((object.header.group, object.header.object), (0, 0));
    }

    #[tokio::test]
    async fn test_no_subscribers_no_objects() {
        let (session, _relay) = running(ObjectMapping::ObjectPerStream).await;
        session.handle_encoded_frame(video(0, true)).unwrap();
        assert_eq!(session.last_sent(100), None);
        assert_eq!(session.stats().objects_sent, 0);
    }

    #[tokio::test]
    async fn test_in_flight_limit_drops() {
        let (local, remote) = MemoryTransport::pair_with_capacity(16);
        let tracks = vec![TrackDescriptor::new(MediaType::Video, NS, "video").with_max_in_flight_requests(1)];
        let (session, events) = publisher(local, tracks);
        let (started, mut relay) = tokio::join!(session.start(), Relay::handshake(remote, 1));
        started.unwrap();
        relay.subscribe(1, 100, "video").await;

        // Nobody reads the object stream, so the first send stays pending
        session.handle_encoded_frame(video(0, true)).unwrap();
        session.handle_encoded_frame(video(1, false)).unwrap();

        let stats = session.stats();
        assert_eq!(stats.tracks[0].in_flight, 1);
        assert_eq!(stats.objects_dropped, 1);
        // The dropped object did not consume a number
        assert_eq!(session.last_sent(100), Some(Location { group: 0, object: 0 }));

        let dropped: Vec<DropEvent> = events
            .try_iter()
            .filter_map(|e| match e {
                PipelineEvent::Dropped(d) => Some(d),
                _ => None,
            })
            .collect();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].reason, DropReason::InFlightLimit);
        assert_eq!(dropped[0].seq_id, Some(1));
    }

    #[tokio::test]
    async fn test_in_flight_limit_spans_subscribers() {
        let (local, remote) = MemoryTransport::pair_with_capacity(16);
        let tracks = vec![TrackDescriptor::new(MediaType::Video, NS, "video").with_max_in_flight_requests(1)];
        let (session, events) = publisher(local, tracks);
        let (started, mut relay) = tokio::join!(session.start(), Relay::handshake(remote, 1));
        started.unwrap();
        relay.subscribe(1, 100, "video").await;
        relay.subscribe(2, 101, "video").await;

        session.handle_encoded_frame(video(0, true)).unwrap();

        let stats = session.stats();
        assert_eq!(stats.subscribers.len(), 2);
        assert_eq!(stats.tracks[0].subscribers, 2);
        assert_eq!(stats.tracks[0].in_flight, 1);
        assert_eq!(stats.objects_dropped, 1);
        assert_eq!(session.last_sent(100), Some(Location { group: 0, object: 0 }));
        assert_eq!(session.last_sent(101), None);

        let reasons: Vec<DropReason> = events
            .try_iter()
            .filter_map(|e| match e {
                PipelineEvent::Dropped(d) => Some(d.reason),
                _ => None,
            })
            .collect();
        assert_eq!(reasons, vec![DropReason::InFlightLimit]);
    }

    #[tokio::test]
    async fn test_keep_alive_while_objects_dropped() {
        let (local, remote) = MemoryTransport::pair_with_capacity(16);
        let config = PublisherConfig {
            tracks: vec![TrackDescriptor::new(MediaType::Video, NS, "video").with_max_in_flight_requests(1)],
            keep_alive_interval: Duration::from_millis(40),
        };
        let session = PublisherSession::new(Arc::new(local), config, EventSink::disabled()).unwrap();
        let (started, mut relay) = tokio::join!(session.start(), Relay::handshake(remote, 1));
        started.unwrap();
        relay.subscribe(1, 100, "video").await;

        // The key frame stays pending, every later delta hits the limit
        session.handle_encoded_frame(video(0, true)).unwrap();
        let dropping = async {
            for seq in 1..100 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                session.handle_encoded_frame(video(seq, false)).unwrap();
            }
        };

        tokio::select! {
            msg = relay.recv() => match msg {
                ControlMessage::Announce(announce) => assert!(announce.namespace.ends_with("-keepAlive")),
                other => panic!("expected keep-alive ANNOUNCE, got {}", other.name()),
            },
            _ = dropping => panic!("no keep-alive while every object was dropped"),
        }
        assert!(session.stats().objects_dropped > 0);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let (session, mut relay) = running(ObjectMapping::ObjectPerStream).await;
        relay.subscribe(7, 100, "video").await;
        session.handle_encoded_frame(video(0, true)).unwrap();
        relay.next_stream_object().await;

        // Unknown ids get no reply
        relay
            .send(ControlMessage::Unsubscribe(Unsubscribe { subscribe_id: 999 }))
            .await;
        relay
            .send(ControlMessage::Unsubscribe(Unsubscribe { subscribe_id: 7 }))
            .await;

        let ControlMessage::SubscribeDone(done) = relay.recv().await else {
            panic!("expected SUBSCRIBE_DONE");
        };
        assert_eq!(done.subscribe_id, 7);
        assert_eq!(done.code, subscribe_done::SUBSCRIPTION_ENDED);
        assert_eq!(done.last, Some(Location { group: 0, object: 0 }));
        assert!(session.stats().subscribers.is_empty());
    }

    #[tokio::test]
    async fn test_track_per_stream_shares_stream() {
        let (session, mut relay) = running(ObjectMapping::TrackPerStream).await;
        relay.subscribe(1, 100, "video").await;

        for seq in 0..3 {
            session.handle_encoded_frame(video(seq, seq == 0)).unwrap();
        }
        let stream = relay.transport.accept_uni().await.unwrap();
        let mut objects = FramedRead::new(stream, ObjectStreamDecoder::new());
        for expected in 0..3u64 {
            let frame = objects.next().await.unwrap().unwrap();
            assert_eq!((frame.header.group, frame.header.object), (0, expected));
        }
    }

    #[tokio::test]
    async fn test_group_per_stream_opens_stream_per_group() {
        let (session, mut relay) = running(ObjectMapping::GroupPerStream).await;
        relay.subscribe(1, 100, "video").await;

        session.handle_encoded_frame(video(0, true)).unwrap();
        session.handle_encoded_frame(video(1, false)).unwrap();
        session.handle_encoded_frame(video(2, true)).unwrap();

        let first = relay.transport.accept_uni().await.unwrap();
        let mut objects = FramedRead::new(first, ObjectStreamDecoder::new());
        let a = objects.next().await.unwrap().unwrap();
        let b = objects.next().await.unwrap().unwrap();
        assert_eq!((a.header.group, a.header.object), (0, 0));
        assert_eq!((b.header.group, b.header.object), (0, 1));
        // Group 0 stream ends once group 1 starts
        assert!(objects.next().await.is_none());

        let c = relay.next_stream_object().await;
        assert_eq!((c.header.group, c.header.object), (1, 0));
    }

    #[tokio::test]
    async fn test_datagram_mapping() {
        let (session, mut relay) = running(ObjectMapping::ObjectPerDatagram).await;
        relay.subscribe(1, 100, "video").await;

        session.handle_encoded_frame(video(0, true)).unwrap();
        let datagram = relay.transport.recv_datagram().await.unwrap();
        let frame = crate::protocol::object::decode_object_datagram(datagram).unwrap();
        assert_eq!(frame.header.track_alias, 100);
        assert_eq!(MediaPacket::decode(frame.payload).unwrap().seq_id, 0);
    }

    #[tokio::test]
    async fn test_keep_alive_announce() {
        let (local, remote) = MemoryTransport::pair();
        let (events, _rx) = EventSink::bounded(8);
        let config = PublisherConfig {
            tracks: tracks(ObjectMapping::ObjectPerStream),
            keep_alive_interval: Duration::from_millis(20),
        };
        let session = PublisherSession::new(Arc::new(local), config, events).unwrap();
        let (started, mut relay) = tokio::join!(session.start(), Relay::handshake(remote, 1));
        started.unwrap();

        let ControlMessage::Announce(announce) = relay.recv().await else {
            panic!("expected keep-alive ANNOUNCE");
        };
        assert!(announce.namespace.ends_with("-keepAlive"));
        relay
            .send(ControlMessage::AnnounceOk(AnnounceOk {
                namespace: announce.namespace,
            }))
            .await;
        assert_eq!(session.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn test_stop_unannounces() {
        let (session, mut relay) = running(ObjectMapping::ObjectPerStream).await;

        let (_, msg) = tokio::join!(session.stop(), relay.recv());
        let ControlMessage::Unannounce(unannounce) = msg else {
            panic!("expected UNANNOUNCE");
        };
        assert_eq!(unannounce.namespace, NS);
        assert_eq!(session.state(), SessionState::Stopped);

        // Second stop and late chunks are no-ops
        session.stop().await;
        assert_eq!(session.handle_encoded_frame(video(0, true)), Ok(()));
    }

    #[tokio::test]
    async fn test_control_stream_loss_stops_session() {
        let (local, remote) = MemoryTransport::pair();
        let (session, events) = publisher(local, tracks(ObjectMapping::ObjectPerStream));
        let (started, relay) = tokio::join!(session.start(), Relay::handshake(remote, 1));
        started.unwrap();

        drop(relay);
        for _ in 0..100 {
            if session.state() == SessionState::Stopped {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(events
            .try_iter()
            .any(|e| matches!(e, PipelineEvent::SessionClosed { role: "publisher", .. })));
    }
}
