//! Loopback Conference Application
//!
//! Publishes synthetic audio and video through the in-memory transport and
//! plays them back on the subscriber side in the same process.
//!
//! Usage: `loopback [config.toml] [seconds]`

use anyhow::{Context, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use moq_conference::{
    audio::{AudioConsumer, AudioFrame, CircularAudioBuffer},
    codec::{EncoderConfig, MediaEncoder, PcmDecoder, PcmEncoder, RawVideoDecoder, RawVideoEncoder},
    config::AppConfig,
    events::{EventSink, PipelineEvent},
    media::{now_ms, EncodedMessage, MediaType},
    network::{MemoryTransport, PublisherSession, ReceivedObject, SubscriberSession},
    pipeline::{CapturePipeline, DecodePipeline, PacerInput, PlaybackClock, RenderedFrame, VideoPacer},
    timing::{SharedSyncRegion, SyncOffsetCoordinator, SyncStream},
    video::VideoFrame,
};

const SAMPLE_RATE: u32 = 48_000;
const CHANNELS: u16 = 2;
const AUDIO_FRAME_MS: u64 = 10;
const VIDEO_FRAME_MS: u64 = 33;
const VIDEO_WIDTH: u32 = 160;
const VIDEO_HEIGHT: u32 = 90;
const STATS_EVERY: Duration = Duration::from_secs(2);

type Publisher = PublisherSession<MemoryTransport>;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting loopback conference");

    let mut args = std::env::args().skip(1);
    let config_path = args.next().map(PathBuf::from);
    let duration = args
        .next()
        .map(|s| s.parse::<u64>())
        .transpose()
        .context("Invalid duration in seconds")?
        .map(Duration::from_secs);

    let config = AppConfig::load_or_default(config_path.as_deref())?;
    if let Some(relay) = config.sender.relay() {
        tracing::info!("Relay {} (zone '{}'), using in-memory transport for loopback", relay.url, relay.zone);
    }

    let (events, event_rx) = EventSink::bounded(1024);
    let (local, remote) = MemoryTransport::pair();
    let publisher = PublisherSession::new(Arc::new(local), config.sender.publisher_config(), events.clone())?;
    let (subscriber, objects) =
        SubscriberSession::new(Arc::new(remote), config.receiver.subscriber_config(), events.clone())?;

    tokio::try_join!(publisher.start(), subscriber.start()).context("Session setup failed")?;
    tracing::info!("Sessions running");

    let cancel = CancellationToken::new();
    let tasks = TaskTracker::new();

    // Capture side
    let region = SharedSyncRegion::new();
    let started = Instant::now();

    let mut audio_encoder = PcmEncoder::new();
    audio_encoder.configure(&EncoderConfig::Audio {
        sample_rate: SAMPLE_RATE,
        channels: CHANNELS,
    })?;
    let audio_capture = CapturePipeline::new(
        MediaType::Audio,
        audio_encoder,
        SyncOffsetCoordinator::new(region.clone(), SyncStream::Audio, config.capture.sync_mode),
        config.capture,
        events.clone(),
    );
    tasks.spawn(run_capture(
        audio_capture,
        publisher.clone(),
        Duration::from_millis(AUDIO_FRAME_MS),
        cancel.clone(),
        move |n| sine_frame(n, started),
    ));

    let mut video_encoder = RawVideoEncoder::new();
    video_encoder.configure(&EncoderConfig::Video {
        width: VIDEO_WIDTH,
        height: VIDEO_HEIGHT,
    })?;
    let video_capture = CapturePipeline::new(
        MediaType::Video,
        video_encoder,
        SyncOffsetCoordinator::new(region, SyncStream::Video, config.capture.sync_mode),
        config.capture,
        events.clone(),
    );
    tasks.spawn(run_capture(
        video_capture,
        publisher.clone(),
        Duration::from_millis(VIDEO_FRAME_MS),
        cancel.clone(),
        move |n| test_pattern(n, started),
    ));

    // Render side
    let clock = PlaybackClock::new();
    let (pacer, pacer_input, rendered) = VideoPacer::new(&config.render, Some(clock.clone()), events.clone());
    tasks.spawn(pacer.run(cancel.clone()));
    tasks.spawn(run_renderer(rendered));
    tasks.spawn(run_receiver(config.clone(), objects, pacer_input, clock, events.clone()));

    // Stats
    tasks.spawn(log_stats(
        publisher.clone(),
        subscriber.clone(),
        event_rx,
        cancel.clone(),
    ));

    tracing::info!("Running - press Ctrl+C to stop");
    match duration {
        Some(duration) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = tokio::time::sleep(duration) => {}
            }
        }
        None => {
            tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
        }
    }

    tracing::info!("Shutting down");
    cancel.cancel();
    publisher.stop().await;
    subscriber.stop().await;
    tasks.close();
    tasks.wait().await;
    tracing::info!("Stopped");
    Ok(())
}

/// Interleaved stereo 440 Hz tone
fn sine_frame(n: u64, started: Instant) -> AudioFrame {
    let samples_per_frame = (SAMPLE_RATE as u64 * AUDIO_FRAME_MS / 1000) as usize;
    let first = n as usize * samples_per_frame;
    let mut samples = Vec::with_capacity(samples_per_frame * CHANNELS as usize);
    for i in 0..samples_per_frame {
        let t = (first + i) as f32 / SAMPLE_RATE as f32;
        let value = (t * 440.0 * std::f32::consts::TAU).sin() * 0.2;
        samples.extend(std::iter::repeat(value).take(CHANNELS as usize));
    }
    AudioFrame::new(samples, CHANNELS, SAMPLE_RATE, started.elapsed().as_micros() as i64)
}

/// Gray frame whose brightness follows the frame number
fn test_pattern(n: u64, started: Instant) -> VideoFrame {
    let size = (VIDEO_WIDTH * VIDEO_HEIGHT) as usize;
    VideoFrame {
        timestamp: started.elapsed().as_micros() as i64,
        duration: (VIDEO_FRAME_MS * 1000) as i64,
        width: VIDEO_WIDTH,
        height: VIDEO_HEIGHT,
        data: Bytes::from(vec![(n % 256) as u8; size]),
    }
}

async fn run_capture<E, G>(
    mut pipeline: CapturePipeline<E>,
    publisher: Publisher,
    period: Duration,
    cancel: CancellationToken,
    mut source: G,
) where
    E: MediaEncoder,
    G: FnMut(u64) -> E::Frame + Send,
{
    let media = pipeline.media_type();
    let mut interval = tokio::time::interval(period);
    let mut n = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                match pipeline.process_frame(source(n)) {
                    Ok(messages) => publish(&publisher, messages),
                    Err(e) => tracing::warn!("{} encoding failed: {}", media, e),
                }
                n += 1;
            }
        }
    }

    match pipeline.flush() {
        Ok(messages) => publish(&publisher, messages),
        Err(e) => tracing::warn!("{} flush failed: {}", media, e),
    }
    pipeline.close();
    let stats = pipeline.stats();
    tracing::info!(
        "{} capture: {} frames, {} dropped, {} chunks",
        media,
        stats.frames_captured,
        stats.frames_dropped,
        stats.chunks_emitted
    );
}

fn publish(publisher: &Publisher, messages: Vec<EncodedMessage>) {
    for msg in messages {
        if let Err(e) = publisher.handle_encoded_frame(msg) {
            tracing::warn!("Failed to publish: {}", e);
        }
    }
}

async fn run_receiver(
    config: AppConfig,
    mut objects: mpsc::Receiver<ReceivedObject>,
    video_out: PacerInput<VideoFrame>,
    clock: PlaybackClock,
    events: EventSink,
) {
    let jitter_ms = config.receiver.jitter_buffer_ms;
    let mut audio = DecodePipeline::new(
        MediaType::Audio,
        PcmDecoder::new(),
        jitter_ms,
        config.receiver.max_queued_chunks,
        events.clone(),
    );
    let mut video = DecodePipeline::new(
        MediaType::Video,
        RawVideoDecoder::new(),
        jitter_ms,
        config.receiver.max_queued_chunks,
        events.clone(),
    );
    let mut ring = CircularAudioBuffer::new(events);
    let speaker_stop = CancellationToken::new();
    let speaker_done = TaskTracker::new();

    // Ends when the subscriber session stops
    while let Some(object) = objects.recv().await {
        match object.media_type {
            MediaType::Audio => match audio.push(object) {
                Ok(outputs) => {
                    for output in outputs {
                        if !ring.is_initialized() {
                            let frame = &output.frame;
                            let samples = (frame.sample_rate as u64 * config.render.audio_ring_ms / 1000) as usize;
                            match ring.init(frame.channels as usize, samples, frame.sample_rate) {
                                Ok(consumer) => {
                                    ring.play();
                                    speaker_done.spawn(run_speaker(consumer, frame.sample_rate, speaker_stop.clone()));
                                }
                                Err(e) => tracing::warn!("Audio ring init failed: {}", e),
                            }
                        }
                        if let Err(e) = ring.try_push(&output.frame, None) {
                            tracing::warn!("Audio ring push failed: {}", e);
                        }
                    }
                    if let Ok(stats) = ring.stats() {
                        if let Some(ts) = stats.current_timestamp {
                            clock.set(ts);
                        }
                    }
                }
                Err(e) => tracing::warn!("Audio decode failed: {}", e),
            },
            MediaType::Video => match video.push(object) {
                Ok(outputs) => {
                    for output in outputs {
                        video_out.push(output.frame, output.capture_clock_ms);
                    }
                }
                Err(e) => tracing::warn!("Video decode failed: {}", e),
            },
            MediaType::Data => {}
        }
    }

    audio.stop();
    video.stop();
    clock.reset();
    ring.clear();
    speaker_stop.cancel();
    speaker_done.close();
    speaker_done.wait().await;

    for stats in [audio.stats(), video.stats()] {
        match serde_json::to_string(&stats) {
            Ok(json) => tracing::info!("Decode stats: {}", json),
            Err(e) => tracing::warn!("Failed to serialize stats: {}", e),
        }
    }
}

/// Stands in for the audio device callback
async fn run_speaker(mut consumer: AudioConsumer, sample_rate: u32, cancel: CancellationToken) {
    let per_tick = (sample_rate as u64 * AUDIO_FRAME_MS / 1000) as usize;
    let mut out = vec![vec![0.0f32; per_tick]; consumer.channels()];
    let mut interval = tokio::time::interval(Duration::from_millis(AUDIO_FRAME_MS));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if !consumer.is_playing() {
                    continue;
                }
                let read = consumer.try_pop(&mut out);
                if read < per_tick {
                    let missing_ms = ((per_tick - read) as u64 * 1000) / sample_rate as u64;
                    consumer.insert_silence_ms(missing_ms);
                }
            }
        }
    }
}

async fn run_renderer(mut rendered: mpsc::Receiver<RenderedFrame<VideoFrame>>) {
    let mut frames = 0u64;
    let mut latency_sum_ms = 0i64;

    while let Some(frame) = rendered.recv().await {
        frames += 1;
        if frame.capture_clock_ms > 0 {
            latency_sum_ms += now_ms() - frame.capture_clock_ms;
        }
        tracing::trace!(ts = frame.frame.timestamp, queue = frame.queue_size, "Rendered frame");
    }

    if frames > 0 {
        tracing::info!(
            "Rendered {} video frames, average capture to render latency {} ms",
            frames,
            latency_sum_ms / frames as i64
        );
    }
}

async fn log_stats(
    publisher: Publisher,
    subscriber: SubscriberSession<MemoryTransport>,
    event_rx: crossbeam_channel::Receiver<PipelineEvent>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(STATS_EVERY);
    let mut drops: HashMap<String, u64> = HashMap::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                for event in event_rx.try_iter() {
                    match event {
                        PipelineEvent::Dropped(dropped) => {
                            *drops.entry(format!("{}/{}", dropped.media_type, dropped.reason)).or_default() += 1;
                        }
                        other => tracing::info!("Event: {:?}", other),
                    }
                }

                let sender = publisher.stats();
                let receiver = subscriber.stats();
                tracing::info!(
                    "Stats: {} objects sent, {} dropped, {} send errors | {} received, {} dropped",
                    sender.objects_sent,
                    sender.objects_dropped,
                    sender.send_errors,
                    receiver.objects_received,
                    receiver.objects_dropped
                );
                if !drops.is_empty() {
                    tracing::info!("Drops so far: {:?}", drops);
                }
                if let Ok(json) = serde_json::to_string(&sender) {
                    tracing::debug!("Sender stats: {}", json);
                }
            }
        }
    }
}
