//! Simulated output device
//!
//! A null backend that keeps time, tracks gain automation and schedules
//! playback completion exactly like a real device would, without producing
//! sound. Decoding probes the bytes with symphonia so durations are real.
//!
//! Used by the `chorus-ap` binary for headless runs and by tests.
//!
//! # Clock
//!
//! The device clock advances with `tokio::time::Instant` while the device is
//! running and freezes while it is suspended, so paused-time tests can drive
//! it with `tokio::time::advance`.

use super::{
    AudioBackend, AudioBuffer, BackendError, Destination, EndedCallback, NodeId, PlaybackId,
};
use chorus_common::FadeCurve;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Formats the bundled symphonia features can probe
const SUPPORTED_FORMATS: &[&str] = &[
    "wav", "wave", "mp3", "mpeg", "flac", "ogg", "oga", "m4a", "mp4", "aac", "webm", "weba",
];

/// Native payload of buffers decoded by the simulated backend
#[derive(Debug, Clone, Copy)]
pub struct SimulatedBuffer {
    /// Total frames in the default track
    pub frames: u64,
}

/// Gain ramp in progress
#[derive(Debug, Clone, Copy)]
struct Ramp {
    from: f32,
    to: f32,
    start: f64,
    end: f64,
    curve: FadeCurve,
}

impl Ramp {
    fn value_at(&self, now: f64) -> f32 {
        let span = self.end - self.start;
        let progress = if span <= 0.0 {
            1.0
        } else {
            ((now - self.start) / span) as f32
        };
        self.curve.interpolate(self.from, self.to, progress)
    }
}

#[derive(Debug, Default)]
struct GainNode {
    value: f32,
    ramp: Option<Ramp>,
    destination: Option<Destination>,
}

impl GainNode {
    fn value_at(&self, now: f64) -> f32 {
        match self.ramp {
            Some(ramp) => ramp.value_at(now),
            None => self.value,
        }
    }
}

struct Playback {
    buffer_duration: f64,
    output: NodeId,
    started: bool,
    /// Media position at `anchor_time`
    anchor_media: f64,
    /// Device time of the last rate/start anchor
    anchor_time: f64,
    /// Media position at which a non-looping playback ends
    end_media: f64,
    rate: f64,
    looping: bool,
    loop_start: f64,
    loop_end: f64,
    ended: Option<EndedCallback>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

impl Playback {
    fn media_position(&self, now: f64) -> f64 {
        let raw = self.anchor_media + (now - self.anchor_time).max(0.0) * self.rate;
        let span = self.loop_end - self.loop_start;
        if self.looping && span > 0.0 && raw > self.loop_end {
            self.loop_start + (raw - self.loop_start) % span
        } else {
            raw
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation += 1;
    }
}

struct DeviceState {
    /// Seconds accumulated before `running_since`
    clock_base: f64,
    /// Set while the device is running
    running_since: Option<Instant>,
    closed: bool,
    next_handle: u64,
    nodes: HashMap<NodeId, GainNode>,
    playbacks: HashMap<PlaybackId, Playback>,
}

impl DeviceState {
    fn now(&self) -> f64 {
        self.clock_base
            + self
                .running_since
                .map(|since| since.elapsed().as_secs_f64())
                .unwrap_or(0.0)
    }

    fn freeze_clock(&mut self) {
        self.clock_base = self.now();
        self.running_since = None;
    }

    fn run_clock(&mut self) {
        if self.running_since.is_none() {
            self.running_since = Some(Instant::now());
        }
    }

    fn allocate(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

struct Shared {
    available: bool,
    latency: Duration,
    state: Mutex<DeviceState>,
}

/// Headless [`AudioBackend`] implementation
#[derive(Clone)]
pub struct SimulatedBackend {
    shared: Arc<Shared>,
}

impl SimulatedBackend {
    /// Running device, instant transitions
    pub fn new() -> Self {
        Self::build(true, false, Duration::ZERO)
    }

    /// Backend reporting that no audio is available
    pub fn unavailable() -> Self {
        Self::build(false, false, Duration::ZERO)
    }

    /// Device that starts suspended (autoplay-restricted platforms)
    pub fn starting_suspended() -> Self {
        Self::build(true, true, Duration::ZERO)
    }

    /// Delay applied to suspend/resume/close before they complete
    pub fn with_transition_latency(self, latency: Duration) -> Self {
        let suspended = self.is_suspended();
        Self::build(self.shared.available, suspended, latency)
    }

    fn build(available: bool, suspended: bool, latency: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                available,
                latency,
                state: Mutex::new(DeviceState {
                    clock_base: 0.0,
                    running_since: if suspended { None } else { Some(Instant::now()) },
                    closed: false,
                    next_handle: 0,
                    nodes: HashMap::new(),
                    playbacks: HashMap::new(),
                }),
            }),
        }
    }

    /// Number of playbacks currently scheduled
    pub fn active_playbacks(&self) -> usize {
        self.shared
            .state
            .lock()
            .playbacks
            .values()
            .filter(|p| p.started)
            .count()
    }

    /// Gain nodes currently allocated
    pub fn node_count(&self) -> usize {
        self.shared.state.lock().nodes.len()
    }

    /// Where a gain node is connected, if anywhere
    pub fn destination(&self, node: NodeId) -> Option<Destination> {
        self.shared
            .state
            .lock()
            .nodes
            .get(&node)
            .and_then(|n| n.destination)
    }

    /// Current media position of a playback
    pub fn playback_position(&self, playback: PlaybackId) -> Option<f64> {
        let state = self.shared.state.lock();
        let now = state.now();
        state.playbacks.get(&playback).map(|p| p.media_position(now))
    }

    /// (Re)arm the completion timer of a started, non-looping playback
    fn schedule_end(shared: &Arc<Shared>, state: &mut DeviceState, id: PlaybackId) {
        let now = state.now();
        let Some(playback) = state.playbacks.get_mut(&id) else {
            return;
        };
        playback.cancel_timer();
        if !playback.started || playback.looping {
            return;
        }

        let remaining_media = (playback.end_media - playback.media_position(now)).max(0.0);
        let wait = Duration::from_secs_f64(remaining_media / playback.rate.max(f64::EPSILON));
        let generation = playback.generation;

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime; playback {:?} will never report completion", id);
            return;
        };
        let weak = Arc::downgrade(shared);
        playback.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(wait).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let callback = {
                let mut state = shared.state.lock();
                match state.playbacks.get(&id) {
                    Some(p) if p.generation == generation => {}
                    _ => return,
                }
                state.playbacks.remove(&id).and_then(|mut p| p.ended.take())
            };
            debug!("Simulated playback {:?} ended", id);
            if let Some(callback) = callback {
                callback();
            }
        }));
    }

    fn transition(
        &self,
        operation: &'static str,
        apply: fn(&mut DeviceState),
    ) -> BoxFuture<'static, Result<(), BackendError>> {
        let shared = Arc::clone(&self.shared);
        async move {
            if !shared.latency.is_zero() {
                tokio::time::sleep(shared.latency).await;
            }
            let mut state = shared.state.lock();
            if state.closed {
                return Err(BackendError::new(format!("cannot {} a closed device", operation)));
            }
            apply(&mut state);
            debug!("Simulated device {} complete at t={:.3}", operation, state.now());
            Ok(())
        }
        .boxed()
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Probe encoded audio and build a buffer descriptor from its default track
fn probe_buffer(bytes: Vec<u8>) -> Result<AudioBuffer, BackendError> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| BackendError::new(format!("unrecognized audio data: {}", e)))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| BackendError::new("no audio track found"))?;

    let track_id = track.id;
    let params = track.codec_params.clone();
    let sample_rate = params
        .sample_rate
        .ok_or_else(|| BackendError::new("track has no sample rate"))?;
    let channels = params.channels.map(|c| c.count() as u16).unwrap_or(2);

    let frames = match params.n_frames {
        Some(frames) => frames,
        None => {
            // Container does not declare a length; sum packet durations instead
            let mut total = 0u64;
            loop {
                match format.next_packet() {
                    Ok(packet) if packet.track_id() == track_id => total += packet.dur,
                    Ok(_) => {}
                    Err(SymphoniaError::IoError(e))
                        if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        break
                    }
                    Err(e) => return Err(BackendError::new(format!("corrupt stream: {}", e))),
                }
            }
            total
        }
    };

    Ok(
        AudioBuffer::new(frames as f64 / sample_rate as f64, sample_rate, channels)
            .with_native(SimulatedBuffer { frames }),
    )
}

impl AudioBackend for SimulatedBackend {
    fn is_available(&self) -> bool {
        self.shared.available
    }

    fn is_suspended(&self) -> bool {
        self.shared.state.lock().running_since.is_none()
    }

    fn supports_format(&self, format: &str) -> bool {
        let format = format.to_ascii_lowercase();
        SUPPORTED_FORMATS.contains(&format.as_str())
    }

    fn current_time(&self) -> f64 {
        self.shared.state.lock().now()
    }

    fn decode(&self, bytes: Vec<u8>) -> BoxFuture<'static, Result<AudioBuffer, BackendError>> {
        async move {
            tokio::task::spawn_blocking(move || probe_buffer(bytes))
                .await
                .map_err(|e| BackendError::new(format!("decode task failed: {}", e)))?
        }
        .boxed()
    }

    fn create_volume_node(&self) -> NodeId {
        let mut state = self.shared.state.lock();
        let id = NodeId(state.allocate());
        state.nodes.insert(
            id,
            GainNode {
                value: 1.0,
                ..Default::default()
            },
        );
        id
    }

    fn connect(&self, node: NodeId, destination: Destination) {
        if let Some(n) = self.shared.state.lock().nodes.get_mut(&node) {
            n.destination = Some(destination);
        }
    }

    fn disconnect(&self, node: NodeId) {
        if let Some(n) = self.shared.state.lock().nodes.get_mut(&node) {
            n.destination = None;
        }
    }

    fn release_node(&self, node: NodeId) {
        self.shared.state.lock().nodes.remove(&node);
    }

    fn set_gain(&self, node: NodeId, value: f32, _at_time: f64) {
        if let Some(n) = self.shared.state.lock().nodes.get_mut(&node) {
            n.ramp = None;
            n.value = value;
        }
    }

    fn gain(&self, node: NodeId) -> f32 {
        let state = self.shared.state.lock();
        let now = state.now();
        state.nodes.get(&node).map(|n| n.value_at(now)).unwrap_or(0.0)
    }

    fn schedule_ramp(&self, node: NodeId, target: f32, end_time: f64, curve: FadeCurve) {
        let mut state = self.shared.state.lock();
        let now = state.now();
        if let Some(n) = state.nodes.get_mut(&node) {
            let from = n.value_at(now);
            n.value = from;
            n.ramp = Some(Ramp {
                from,
                to: target,
                start: now,
                end: end_time,
                curve,
            });
        }
    }

    fn cancel_scheduled_ramp(&self, node: NodeId, at_time: f64) {
        if let Some(n) = self.shared.state.lock().nodes.get_mut(&node) {
            n.value = n.value_at(at_time);
            n.ramp = None;
        }
    }

    fn create_playback(&self, buffer: &Arc<AudioBuffer>, output: NodeId) -> PlaybackId {
        let mut state = self.shared.state.lock();
        let id = PlaybackId(state.allocate());
        state.playbacks.insert(
            id,
            Playback {
                buffer_duration: buffer.duration(),
                output,
                started: false,
                anchor_media: 0.0,
                anchor_time: 0.0,
                end_media: buffer.duration(),
                rate: 1.0,
                looping: false,
                loop_start: 0.0,
                loop_end: buffer.duration(),
                ended: None,
                timer: None,
                generation: 0,
            },
        );
        id
    }

    fn start(&self, playback: PlaybackId, at_time: f64, offset: f64, duration: Option<f64>) {
        let mut state = self.shared.state.lock();
        let Some(p) = state.playbacks.get_mut(&playback) else {
            return;
        };
        if p.started {
            warn!("Playback {:?} started twice; ignoring", playback);
            return;
        }
        p.started = true;
        p.anchor_media = offset.clamp(0.0, p.buffer_duration);
        p.anchor_time = at_time;
        p.end_media = duration
            .map(|d| (offset + d).min(p.buffer_duration))
            .unwrap_or(p.buffer_duration);
        debug!(
            "Simulated playback {:?} -> node {:?}: offset={:.3} end={:.3}",
            playback, p.output, offset, p.end_media
        );
        Self::schedule_end(&self.shared, &mut state, playback);
    }

    fn stop(&self, playback: PlaybackId) {
        let mut state = self.shared.state.lock();
        if let Some(mut p) = state.playbacks.remove(&playback) {
            p.cancel_timer();
        }
    }

    fn on_ended(&self, playback: PlaybackId, callback: EndedCallback) {
        if let Some(p) = self.shared.state.lock().playbacks.get_mut(&playback) {
            p.ended = Some(callback);
        }
    }

    fn set_rate(&self, playback: PlaybackId, rate: f64, at_time: f64) {
        let mut state = self.shared.state.lock();
        let Some(p) = state.playbacks.get_mut(&playback) else {
            return;
        };
        if p.started {
            p.anchor_media = p.media_position(at_time);
            p.anchor_time = at_time;
        }
        p.rate = rate;
        Self::schedule_end(&self.shared, &mut state, playback);
    }

    fn set_loop_region(&self, playback: PlaybackId, start: f64, end: f64, enabled: bool) {
        let mut state = self.shared.state.lock();
        let now = state.now();
        let Some(p) = state.playbacks.get_mut(&playback) else {
            return;
        };
        if p.started {
            p.anchor_media = p.media_position(now);
            p.anchor_time = now;
        }
        p.looping = enabled;
        if enabled {
            p.loop_start = start;
            p.loop_end = end;
        }
        Self::schedule_end(&self.shared, &mut state, playback);
    }

    fn suspend(&self) -> BoxFuture<'static, Result<(), BackendError>> {
        self.transition("suspend", DeviceState::freeze_clock)
    }

    fn resume(&self) -> BoxFuture<'static, Result<(), BackendError>> {
        self.transition("resume", DeviceState::run_clock)
    }

    fn close(&self) -> BoxFuture<'static, Result<(), BackendError>> {
        let shared = Arc::clone(&self.shared);
        async move {
            if !shared.latency.is_zero() {
                tokio::time::sleep(shared.latency).await;
            }
            let mut state = shared.state.lock();
            for (_, mut p) in state.playbacks.drain() {
                p.cancel_timer();
            }
            state.nodes.clear();
            state.freeze_clock();
            state.closed = true;
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_clock_advances_and_freezes_when_suspended() {
        let backend = SimulatedBackend::new();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!((backend.current_time() - 2.0).abs() < 1e-6);

        backend.suspend().await.unwrap();
        assert!(backend.is_suspended());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!((backend.current_time() - 2.0).abs() < 1e-6);

        backend.resume().await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!((backend.current_time() - 3.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_ramp_and_cancel() {
        let backend = SimulatedBackend::new();
        let node = backend.create_volume_node();
        backend.schedule_ramp(node, 0.0, backend.current_time() + 2.0, FadeCurve::Linear);

        tokio::time::advance(Duration::from_secs(1)).await;
        let mid = backend.gain(node);
        assert!((mid - 0.5).abs() < 1e-3);

        backend.cancel_scheduled_ramp(node, backend.current_time());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!((backend.gain(node) - mid).abs() < 1e-3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_fires_ended() {
        let backend = SimulatedBackend::new();
        let node = backend.create_volume_node();
        let buffer = Arc::new(AudioBuffer::new(3.0, 44100, 2));
        let playback = backend.create_playback(&buffer, node);

        let (tx, rx) = tokio::sync::oneshot::channel();
        backend.on_ended(
            playback,
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        backend.start(playback, backend.current_time(), 1.0, Some(1.5));
        assert_eq!(backend.active_playbacks(), 1);

        tokio::time::sleep(Duration::from_millis(1600)).await;
        rx.await.unwrap();
        assert_eq!(backend.active_playbacks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_playback_never_ends() {
        let backend = SimulatedBackend::new();
        let node = backend.create_volume_node();
        let buffer = Arc::new(AudioBuffer::new(1.0, 44100, 2));
        let playback = backend.create_playback(&buffer, node);

        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        backend.on_ended(
            playback,
            Box::new(move || flag.store(true, std::sync::atomic::Ordering::SeqCst)),
        );
        backend.start(playback, backend.current_time(), 0.0, Some(1.0));
        backend.stop(playback);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!fired.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_transitions_fail_after_close() {
        let backend = SimulatedBackend::new();
        backend.close().await.unwrap();
        assert!(backend.resume().await.is_err());
    }

    #[test]
    fn test_supported_formats() {
        let backend = SimulatedBackend::new();
        assert!(backend.supports_format("WAV"));
        assert!(backend.supports_format("mp3"));
        assert!(!backend.supports_format("xyz"));
        assert!(!SimulatedBackend::unavailable().is_available());
        assert!(SimulatedBackend::starting_suspended().is_suspended());
    }
}
