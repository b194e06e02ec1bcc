//! Subscriber side of a media transport session
//!
//! Accepts the control stream opened by a publisher (or relay), acknowledges
//! its announcements, subscribes to the configured tracks and demultiplexes
//! incoming objects into [`ReceivedObject`]s. Objects are handed over through
//! a bounded channel; when the consumer falls behind they are dropped rather
//! than stalling the receive loops.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::session::{SessionState, StateCell};
use super::transport::{RecvStream, SendStream, Transport};
use crate::error::{ConfigError, NetworkError, ProtocolError, SessionError};
use crate::events::{DropEvent, DropReason, EventSink, PipelineEvent};
use crate::media::{now_ms, MediaType};
use crate::protocol::control::{AnnounceOk, ServerSetup, Subscribe, Unsubscribe};
use crate::protocol::object::{decode_object_datagram, ObjectFrame};
use crate::protocol::{ControlCodec, ControlMessage, MediaPacket, ObjectStreamDecoder, Role, PROTOCOL_VERSION};

const ROLE: &str = "subscriber";

/// Time allowed for each UNSUBSCRIBE while stopping
const UNSUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(1);

type ControlWriter = FramedWrite<SendStream, ControlCodec>;
type ControlReader = FramedRead<RecvStream, ControlCodec>;

/// A track to subscribe to once its namespace is announced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackSubscription {
    pub media_type: MediaType,
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub auth_info: Option<String>,
}

impl TrackSubscription {
    pub fn new(media_type: MediaType, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            media_type,
            namespace: namespace.into(),
            name: name.into(),
            auth_info: None,
        }
    }

    pub fn with_auth_info(mut self, auth_info: impl Into<String>) -> Self {
        self.auth_info = Some(auth_info.into());
        self
    }
}

/// Subscriber session configuration
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub tracks: Vec<TrackSubscription>,
    /// Capacity of the received objects channel
    pub receive_queue: usize,
}

impl SubscriberConfig {
    pub fn new(tracks: Vec<TrackSubscription>) -> Self {
        Self {
            tracks,
            receive_queue: crate::constants::DEFAULT_RECEIVE_QUEUE,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tracks.is_empty() {
            return Err(ConfigError::NoTracks);
        }
        if self.receive_queue == 0 {
            return Err(ConfigError::InvalidValue("receive_queue must be > 0".into()));
        }
        let mut seen = HashSet::new();
        for track in &self.tracks {
            if track.namespace.is_empty() || track.name.is_empty() {
                return Err(ConfigError::MalformedTrack(format!(
                    "{} subscription needs a namespace and a name",
                    track.media_type
                )));
            }
            if !seen.insert(track.media_type) {
                return Err(ConfigError::DuplicateTrack(track.media_type.to_string()));
            }
        }
        Ok(())
    }
}

/// One object delivered by the subscriber session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedObject {
    pub media_type: MediaType,
    pub subscribe_id: u64,
    pub track_alias: u64,
    pub group: u64,
    pub object: u64,
    pub send_order: u64,
    pub packet: MediaPacket,
}

/// Where a subscription stands with the publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    Pending,
    Active,
}

#[derive(Debug, Clone)]
struct Subscription {
    track: TrackSubscription,
    subscribe_id: u64,
    state: SubscriptionState,
}

/// Per subscription snapshot
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStats {
    pub media_type: MediaType,
    pub subscribe_id: u64,
    pub track_alias: u64,
    pub state: SubscriptionState,
}

/// Subscriber statistics
#[derive(Debug, Clone, Serialize)]
pub struct ReceiverStats {
    pub clock_ms: i64,
    pub state: SessionState,
    pub objects_received: u64,
    pub objects_dropped: u64,
    pub malformed_objects: u64,
    pub subscriptions: Vec<SubscriptionStats>,
}

#[derive(Debug, Default)]
struct Counters {
    objects_received: AtomicU64,
    objects_dropped: AtomicU64,
    malformed_objects: AtomicU64,
}

struct Shared<T: Transport> {
    transport: Arc<T>,
    state: StateCell,
    starting: AtomicBool,
    tracks: Vec<TrackSubscription>,
    /// Keyed by track alias
    subscriptions: Mutex<HashMap<u64, Subscription>>,
    announced: Mutex<HashSet<String>>,
    next_subscribe_id: AtomicU64,
    next_track_alias: AtomicU64,
    control: AsyncMutex<Option<ControlWriter>>,
    objects: Mutex<Option<mpsc::Sender<ReceivedObject>>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    events: EventSink,
    counters: Counters,
}

/// Subscribing endpoint of a media transport session
pub struct SubscriberSession<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for SubscriberSession<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Transport> SubscriberSession<T> {
    /// Validate the configuration and create an idle session plus its object receiver
    pub fn new(
        transport: Arc<T>,
        config: SubscriberConfig,
        events: EventSink,
    ) -> Result<(Self, mpsc::Receiver<ReceivedObject>), ConfigError> {
        config.validate()?;
        let (tx, rx) = mpsc::channel(config.receive_queue);

        let session = Self {
            shared: Arc::new(Shared {
                transport,
                state: StateCell::new(),
                starting: AtomicBool::new(false),
                tracks: config.tracks,
                subscriptions: Mutex::new(HashMap::new()),
                announced: Mutex::new(HashSet::new()),
                next_subscribe_id: AtomicU64::new(0),
                next_track_alias: AtomicU64::new(0),
                control: AsyncMutex::new(None),
                objects: Mutex::new(Some(tx)),
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
                events,
                counters: Counters::default(),
            }),
        };
        Ok((session, rx))
    }

    /// Get current session state
    pub fn state(&self) -> SessionState {
        self.shared.state.get()
    }

    /// Accept the publisher's control stream and complete SETUP
    ///
    /// Subscriptions are sent from the control loop as namespaces get
    /// announced.
    pub async fn start(&self) -> Result<(), SessionError> {
        let shared = &self.shared;
        match shared.state.touch() {
            SessionState::Instantiated => {}
            SessionState::Stopped => {
                tracing::warn!("Subscriber session already stopped, ignoring start");
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
        tracing::info!("Subscriber session running");
        shared.events.emit(PipelineEvent::SessionRunning { role: ROLE });

        let control = shared.clone();
        shared.tasks.spawn(async move { control.control_loop(reader).await });
        let streams = shared.clone();
        shared.tasks.spawn(async move { streams.accept_streams().await });
        let datagrams = shared.clone();
        shared.tasks.spawn(async move { datagrams.receive_datagrams().await });
        Ok(())
    }

    /// Cancel the subscription using `track_alias`
    pub async fn unsubscribe(&self, track_alias: u64) -> Result<(), SessionError> {
        let shared = &self.shared;
        if shared.state.touch() != SessionState::Running {
            tracing::warn!("Subscriber session not running, ignoring unsubscribe {}", track_alias);
            return Ok(());
        }
        let removed = shared.subscriptions.lock().remove(&track_alias);
        let Some(subscription) = removed else {
            tracing::warn!("No subscription with alias {}", track_alias);
            return Ok(());
        };
        tracing::info!(
            "Unsubscribing {}/{} (alias {})",
            subscription.track.namespace,
            subscription.track.name,
            track_alias
        );
        shared
            .send_control(ControlMessage::Unsubscribe(Unsubscribe {
                subscribe_id: subscription.subscribe_id,
            }))
            .await
    }

    /// Unsubscribe everything, close the transport and wait for the receive loops
    ///
    /// The object receiver sees the end of the channel once this returns.
    pub async fn stop(&self) {
        let shared = &self.shared;
        shared.state.touch();
        if shared.state.stop() == SessionState::Stopped {
            tracing::warn!("Subscriber session already stopped");
            return;
        }
        tracing::info!("Stopping subscriber session");
        shared.cancel.cancel();

        let subscriptions: Vec<Subscription> = shared.subscriptions.lock().drain().map(|(_, s)| s).collect();
        for subscription in subscriptions {
            let msg = ControlMessage::Unsubscribe(Unsubscribe {
                subscribe_id: subscription.subscribe_id,
            });
            match tokio::time::timeout(UNSUBSCRIBE_TIMEOUT, shared.send_control(msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Failed to unsubscribe {}: {}", subscription.subscribe_id, e),
                Err(_) => tracing::warn!("Timed out unsubscribing {}", subscription.subscribe_id),
            }
        }
        if let Some(mut writer) = shared.control.lock().await.take() {
            if let Err(e) = writer.close().await {
                tracing::debug!("Control stream close failed: {}", e);
            }
        }

        shared.transport.close(0, "subscriber stopped");
        shared.tasks.close();
        shared.tasks.wait().await;
        shared.objects.lock().take();
        shared.events.emit(PipelineEvent::SessionClosed {
            role: ROLE,
            reason: "stopped".into(),
        });
        tracing::info!("Subscriber session stopped");
    }

    /// Get subscriber statistics
    pub fn stats(&self) -> ReceiverStats {
        let shared = &self.shared;
        let mut subscriptions: Vec<SubscriptionStats> = shared
            .subscriptions
            .lock()
            .iter()
            .map(|(alias, s)| SubscriptionStats {
                media_type: s.track.media_type,
                subscribe_id: s.subscribe_id,
                track_alias: *alias,
                state: s.state,
            })
            .collect();
        subscriptions.sort_by_key(|s| s.track_alias);

        ReceiverStats {
            clock_ms: now_ms(),
            state: shared.state.get(),
            objects_received: shared.counters.objects_received.load(Ordering::Relaxed),
            objects_dropped: shared.counters.objects_dropped.load(Ordering::Relaxed),
            malformed_objects: shared.counters.malformed_objects.load(Ordering::Relaxed),
            subscriptions,
        }
    }
}

impl<T: Transport> Shared<T> {
    async fn handshake(&self) -> Result<ControlReader, SessionError> {
        let (send, recv) = self.transport.accept_bi().await?;
        let mut writer = FramedWrite::new(send, ControlCodec);
        let mut reader = FramedRead::new(recv, ControlCodec);

        let setup = match reader.next().await {
            Some(Ok(ControlMessage::Setup(setup))) => setup,
            Some(Ok(other)) => {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: "SETUP",
                    received: other.name().to_string(),
                }
                .into())
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Err(NetworkError::TransportClosed("control stream ended".into()).into()),
        };
        if !setup.versions.contains(&PROTOCOL_VERSION) {
            return Err(ProtocolError::InvalidValue {
                field: "version",
                value: setup.versions.first().copied().unwrap_or_default(),
            }
            .into());
        }
        if !setup.role.can_publish() {
            return Err(ProtocolError::IncompatibleRole(setup.role.to_string()).into());
        }
        tracing::debug!("Received SETUP, peer role {}", setup.role);

        writer
            .send(ControlMessage::ServerSetup(ServerSetup {
                version: PROTOCOL_VERSION,
                role: Role::Subscriber,
            }))
            .await?;

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

    fn fail(&self, err: SessionError) {
        if self.state.stop() == SessionState::Stopped {
            return;
        }
        tracing::error!("Subscriber session failed: {}", err);
        self.cancel.cancel();
        self.transport.close(1, "subscriber session error");
        self.objects.lock().take();
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
            ControlMessage::Announce(announce) => {
                tracing::debug!("Received ANNOUNCE {}", announce.namespace);
                self.send_control(ControlMessage::AnnounceOk(AnnounceOk {
                    namespace: announce.namespace.clone(),
                }))
                .await?;
                if self.announced.lock().insert(announce.namespace.clone()) {
                    self.subscribe_namespace(&announce.namespace).await?;
                }
                Ok(())
            }
            ControlMessage::Unannounce(unannounce) => {
                tracing::info!("Namespace {} unannounced", unannounce.namespace);
                self.announced.lock().remove(&unannounce.namespace);
                Ok(())
            }
            ControlMessage::SubscribeOk(ok) => {
                let mut subscriptions = self.subscriptions.lock();
                match subscriptions.values_mut().find(|s| s.subscribe_id == ok.subscribe_id) {
                    Some(subscription) => {
                        subscription.state = SubscriptionState::Active;
                        tracing::info!(
                            "Subscribed {}/{} (id {}), largest {:?}",
                            subscription.track.namespace,
                            subscription.track.name,
                            ok.subscribe_id,
                            ok.largest
                        );
                    }
                    None => tracing::warn!("SUBSCRIBE_OK for unknown subscribe id {}", ok.subscribe_id),
                }
                Ok(())
            }
            ControlMessage::SubscribeError(err) => {
                tracing::warn!(
                    "SUBSCRIBE {} rejected: {} ({})",
                    err.subscribe_id,
                    err.reason,
                    err.code
                );
                self.subscriptions.lock().retain(|_, s| s.subscribe_id != err.subscribe_id);
                Ok(())
            }
            ControlMessage::SubscribeDone(done) => {
                tracing::info!(
                    "Subscription {} done: {} ({}), last {:?}",
                    done.subscribe_id,
                    done.reason,
                    done.code,
                    done.last
                );
                self.subscriptions.lock().retain(|_, s| s.subscribe_id != done.subscribe_id);
                Ok(())
            }
            other => {
                tracing::warn!("Ignoring unexpected {} on subscriber control stream", other.name());
                Ok(())
            }
        }
    }

    /// Subscribe every configured track of a freshly announced namespace
    async fn subscribe_namespace(&self, namespace: &str) -> Result<(), SessionError> {
        let pending: Vec<TrackSubscription> = {
            let subscriptions = self.subscriptions.lock();
            self.tracks
                .iter()
                .filter(|t| t.namespace == namespace)
                .filter(|t| !subscriptions.values().any(|s| s.track.media_type == t.media_type))
                .cloned()
                .collect()
        };

        for track in pending {
            let subscribe_id = self.next_subscribe_id.fetch_add(1, Ordering::Relaxed);
            let track_alias = self.next_track_alias.fetch_add(1, Ordering::Relaxed);
            let request = Subscribe {
                subscribe_id,
                track_alias,
                namespace: track.namespace.clone(),
                track_name: track.name.clone(),
                auth_info: track.auth_info.clone(),
            };
            tracing::debug!(
                "Subscribing {}/{} id {} alias {}",
                track.namespace,
                track.name,
                subscribe_id,
                track_alias
            );
            self.subscriptions.lock().insert(
                track_alias,
                Subscription {
                    track,
                    subscribe_id,
                    state: SubscriptionState::Pending,
                },
            );
            self.send_control(ControlMessage::Subscribe(request)).await?;
        }
        Ok(())
    }

    async fn accept_streams(self: Arc<Self>) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => return,
                accepted = self.transport.accept_uni() => accepted,
            };
            match accepted {
                Ok(stream) => {
                    let reader = self.clone();
                    self.tasks.spawn(async move { reader.read_stream(stream).await });
                }
                Err(e) => {
                    self.fail(e.into());
                    return;
                }
            }
        }
    }

    async fn read_stream(self: Arc<Self>, stream: RecvStream) {
        let mut objects = FramedRead::new(stream, ObjectStreamDecoder::new());
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return,
                next = objects.next() => next,
            };
            match next {
                Some(Ok(frame)) => self.deliver(frame),
                Some(Err(e)) => {
                    tracing::warn!("Discarding object stream: {}", e);
                    self.counters.malformed_objects.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                None => return,
            }
        }
    }

    async fn receive_datagrams(self: Arc<Self>) {
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => return,
                received = self.transport.recv_datagram() => received,
            };
            let datagram = match received {
                Ok(datagram) => datagram,
                Err(e) => {
                    tracing::debug!("Datagram loop ended: {}", e);
                    return;
                }
            };
            match decode_object_datagram(datagram) {
                Ok(frame) => self.deliver(frame),
                Err(e) => {
                    tracing::warn!("Discarding datagram: {}", e);
                    self.counters.malformed_objects.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn deliver(&self, frame: ObjectFrame) {
        let header = frame.header;
        let media_type = match self.subscriptions.lock().get(&header.track_alias) {
            Some(subscription) => subscription.track.media_type,
            None => {
                tracing::debug!("Object for unknown track alias {}, discarded", header.track_alias);
                return;
            }
        };
        let packet = match MediaPacket::decode(frame.payload) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!("Malformed {} packet {}/{}: {}", media_type, header.group, header.object, e);
                self.counters.malformed_objects.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        let object = ReceivedObject {
            media_type,
            subscribe_id: header.subscribe_id,
            track_alias: header.track_alias,
            group: header.group,
            object: header.object,
            send_order: header.send_order,
            packet,
        };

        let Some(tx) = self.objects.lock().clone() else {
            return;
        };
        match tx.try_send(object) {
            Ok(()) => {
                self.counters.objects_received.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(object)) => {
                self.counters.objects_dropped.fetch_add(1, Ordering::Relaxed);
                self.events.drop_event(
                    DropEvent::new(media_type, DropReason::ReceiveQueueFull)
                        .with_seq_id(object.packet.seq_id)
                        .with_timestamp(object.packet.compensated_ts),
                );
            }
            Err(TrySendError::Closed(_)) => {
                tracing::trace!("Object receiver gone, object discarded");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{Chunk, EncodedMessage};
    use crate::network::memory::MemoryTransport;
    use crate::protocol::control::{Announce, Setup, SubscribeError, SubscribeOk};
    use crate::protocol::object::{encode_object_datagram, encode_object_stream, ObjectHeader};
    use tokio::io::AsyncWriteExt;

    const NS: &str = "vc/bob";

    /// Publisher side of the control stream
    struct Publisher {
        transport: MemoryTransport,
        writer: ControlWriter,
        reader: ControlReader,
    }

    impl Publisher {
        async fn connect(transport: MemoryTransport, role: Role) -> (Self, Option<ControlMessage>) {
            let (send, recv) = transport.open_bi().await.unwrap();
            let mut publisher = Self {
                transport,
                writer: FramedWrite::new(send, ControlCodec),
                reader: FramedRead::new(recv, ControlCodec),
            };
            publisher
                .send(ControlMessage::Setup(Setup {
                    versions: vec![PROTOCOL_VERSION],
                    role,
                }))
                .await;
            let reply = tokio::time::timeout(Duration::from_millis(500), publisher.reader.next())
                .await
                .ok()
                .flatten()
                .and_then(|r| r.ok());
            (publisher, reply)
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

        /// Announce `NS` and collect the subscriptions that follow
        async fn announce(&mut self, expected: usize) -> Vec<Subscribe> {
            self.send(ControlMessage::Announce(Announce {
                namespace: NS.into(),
                auth_info: None,
            }))
            .await;
            assert!(matches!(self.recv().await, ControlMessage::AnnounceOk(ok) if ok.namespace == NS));

            let mut subscribes = Vec::new();
            for _ in 0..expected {
                match self.recv().await {
                    ControlMessage::Subscribe(subscribe) => subscribes.push(subscribe),
                    other => panic!("expected SUBSCRIBE, got {}", other.name()),
                }
            }
            subscribes
        }

        async fn send_object(&self, subscribe: &Subscribe, group: u64, object: u64, seq_id: i64) {
            let header = ObjectHeader {
                subscribe_id: subscribe.subscribe_id,
                track_alias: subscribe.track_alias,
                group,
                object,
                send_order: 1,
            };
            let mut stream = self.transport.open_uni(1).await.unwrap();
            stream
                .write_all(&encode_object_stream(&header, &packet(seq_id)).unwrap())
                .await
                .unwrap();
            stream.shutdown().await.unwrap();
        }
    }

    fn packet(seq_id: i64) -> bytes::Bytes {
        let chunk = Chunk::key(seq_id * 10_000, 10_000, vec![1u8; 16]);
        MediaPacket::from_message(&EncodedMessage::new(MediaType::Audio, chunk, seq_id))
            .encode()
            .unwrap()
    }

    fn config(receive_queue: usize) -> SubscriberConfig {
        SubscriberConfig {
            tracks: vec![
                TrackSubscription::new(MediaType::Audio, NS, "audio").with_auth_info("secret"),
                TrackSubscription::new(MediaType::Video, NS, "video").with_auth_info("secret"),
            ],
            receive_queue,
        }
    }

    async fn running(
        receive_queue: usize,
    ) -> (
        SubscriberSession<MemoryTransport>,
        mpsc::Receiver<ReceivedObject>,
        Publisher,
        crossbeam_channel::Receiver<PipelineEvent>,
    ) {
        let (local, remote) = MemoryTransport::pair();
        let (events, events_rx) = EventSink::bounded(64);
        let (session, objects) = SubscriberSession::new(Arc::new(local), config(receive_queue), events).unwrap();
        let (started, (publisher, reply)) = tokio::join!(session.start(), Publisher::connect(remote, Role::Publisher));
        started.unwrap();
        assert!(matches!(
            reply,
            Some(ControlMessage::ServerSetup(ServerSetup { role: Role::Subscriber, .. }))
        ));
        (session, objects, publisher, events_rx)
    }

    #[test]
    fn test_config_validation() {
        assert_eq!(SubscriberConfig::new(vec![]).validate(), Err(ConfigError::NoTracks));
        assert!(matches!(config(0).validate(), Err(ConfigError::InvalidValue(_))));
        let dup = SubscriberConfig::new(vec![
            TrackSubscription::new(MediaType::Audio, NS, "a"),
            TrackSubscription::new(MediaType::Audio, NS, "b"),
        ]);
        assert!(matches!(dup.validate(), Err(ConfigError::DuplicateTrack(_))));
    }

    #[tokio::test]
    async fn test_subscribes_after_announce() {
        let (session, _objects, mut publisher, _events) = running(8).await;
        let subscribes = publisher.announce(2).await;

        assert_eq!(subscribes[0].track_name, "audio");
        assert_eq!(subscribes[1].track_name, "video");
        assert_eq!(subscribes[0].auth_info.as_deref(), Some("secret"));
        assert_ne!(subscribes[0].track_alias, subscribes[1].track_alias);
        assert_ne!(subscribes[0].subscribe_id, subscribes[1].subscribe_id);

        publisher
            .send(ControlMessage::SubscribeOk(SubscribeOk {
                subscribe_id: subscribes[0].subscribe_id,
                expires: 0,
                largest: None,
            }))
            .await;
        publisher
            .send(ControlMessage::SubscribeError(SubscribeError {
                subscribe_id: subscribes[1].subscribe_id,
                code: crate::protocol::subscribe_error::UNAUTHORIZED,
                reason: "bad token".into(),
                track_alias: subscribes[1].track_alias,
            }))
            .await;

        for _ in 0..100 {
            let stats = session.stats();
            if stats.subscriptions.len() == 1 && stats.subscriptions[0].state == SubscriptionState::Active {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("subscription states never settled: {:?}", session.stats().subscriptions);
    }

    #[tokio::test]
    async fn test_rejects_subscriber_role() {
        let (local, remote) = MemoryTransport::pair();
        let (session, _objects) = SubscriberSession::new(Arc::new(local), config(8), EventSink::disabled()).unwrap();
        let (started, _publisher) = tokio::join!(session.start(), Publisher::connect(remote, Role::Subscriber));

        assert_eq!(
            started,
            Err(SessionError::Protocol(ProtocolError::IncompatibleRole("subscriber".into())))
        );
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_receives_stream_and_datagram_objects() {
        let (_session, mut objects, mut publisher, _events) = running(8).await;
        let subscribes = publisher.announce(2).await;
        let audio = &subscribes[0];

        publisher.send_object(audio, 0, 0, 42).await;
        let received = objects.recv().await.unwrap();
        assert_eq!(received.media_type, MediaType::Audio);
        assert_eq!(received.track_alias, audio.track_alias);
        assert_eq!(received.packet.seq_id, 42);

        let header = ObjectHeader {
            subscribe_id: audio.subscribe_id,
            track_alias: audio.track_alias,
            group: 0,
            object: 1,
            send_order: 1,
        };
        let datagram = encode_object_datagram(&header, &packet(43)).unwrap();
        publisher.transport.send_datagram(datagram).await.unwrap();
        let received = objects.recv().await.unwrap();
        assert_eq!((received.group, received.object), (0, 1));
        assert_eq!(received.packet.seq_id, 43);
    }

    #[tokio::test]
    async fn test_full_receive_queue_drops() {
        let (session, _objects, mut publisher, events) = running(1).await;
        let subscribes = publisher.announce(2).await;

        publisher.send_object(&subscribes[0], 0, 0, 1).await;
        publisher.send_object(&subscribes[0], 0, 1, 2).await;

        for _ in 0..100 {
            if session.stats().objects_dropped == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let stats = session.stats();
        assert_eq!(stats.objects_received, 1);
        assert_eq!(stats.objects_dropped, 1);
        assert!(events.try_iter().any(|e| matches!(
            e,
            PipelineEvent::Dropped(DropEvent { reason: DropReason::ReceiveQueueFull, .. })
        )));
    }

    #[tokio::test]
    async fn test_unsubscribe_and_stop() {
        let (session, mut objects, mut publisher, _events) = running(8).await;
        let subscribes = publisher.announce(2).await;

        session.unsubscribe(subscribes[1].track_alias).await.unwrap();
        let ControlMessage::Unsubscribe(unsubscribe) = publisher.recv().await else {
            panic!("expected UNSUBSCRIBE");
        };
        assert_eq!(unsubscribe.subscribe_id, subscribes[1].subscribe_id);

        // Objects for the dropped alias are ignored
        publisher.send_object(&subscribes[1], 0, 0, 7).await;

        let (_, msg) = tokio::join!(session.stop(), publisher.recv());
        assert!(matches!(msg, ControlMessage::Unsubscribe(u) if u.subscribe_id == subscribes[0].subscribe_id));
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(objects.recv().await.is_none());
    }
}
