//! Sound instance
//!
//! One playable voice over a shared decoded buffer. A sound owns a gain node
//! (connected to the engine's master gain by the engine) and at most one
//! backend playback at a time; playbacks are single use, so every `play`
//! creates a fresh one and pause/stop/seek release it.
//!
//! # States
//!
//! ```text
//! Ready --play--> Playing --ended/stop--> Ready
//!                 Playing --pause--> Paused --play--> Playing
//! any --destroy--> Destroyed (terminal)
//! ```
//!
//! Every mutator is a silent no-op once the sound is destroyed.
//!
//! # Position bookkeeping
//!
//! `current_pos` holds the paused/seeked position, and the offset playback
//! started from while playing. The live position is derived from the device
//! clock: time elapsed since `start_time`, scaled by the rate. A rate change records the position at
//! that instant in `rate_seek` and re-anchors `start_time`, so the derived
//! position stays continuous across rate changes.

use crate::backend::{AudioBackend, AudioBuffer, NodeId, PlaybackId};
use crate::config::fade_duration;
use crate::types::{SoundId, SoundState};
use chorus_common::FadeCurve;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Callback receiving the id of the sound that triggered it
pub type SoundCallback = Arc<dyn Fn(SoundId) + Send + Sync + 'static>;

/// Construction parameters of a sound
#[derive(Clone)]
pub struct SoundOptions {
    /// Explicit id; a fresh one is allocated when `None`
    pub id: Option<SoundId>,
    /// Initial volume (0.0 - 1.0)
    pub volume: f32,
    /// Initial playback rate (0.5 - 5.0)
    pub rate: f64,
    pub muted: bool,
    pub looping: bool,
    /// Region start in seconds (defaults to 0)
    pub start: Option<f64>,
    /// Region end in seconds (defaults to the buffer duration)
    pub end: Option<f64>,
    pub on_play_end: Option<SoundCallback>,
    pub on_fade_end: Option<SoundCallback>,
    pub on_destroy: Option<SoundCallback>,
}

impl Default for SoundOptions {
    fn default() -> Self {
        Self {
            id: None,
            volume: 1.0,
            rate: 1.0,
            muted: false,
            looping: false,
            start: None,
            end: None,
            on_play_end: None,
            on_fade_end: None,
            on_destroy: None,
        }
    }
}

impl std::fmt::Debug for SoundOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoundOptions")
            .field("id", &self.id)
            .field("volume", &self.volume)
            .field("rate", &self.rate)
            .field("muted", &self.muted)
            .field("looping", &self.looping)
            .field("start", &self.start)
            .field("end", &self.end)
            .finish_non_exhaustive()
    }
}

struct SoundData {
    state: SoundState,
    volume: f32,
    rate: f64,
    muted: bool,
    looping: bool,
    buffer: Option<Arc<AudioBuffer>>,
    playback: Option<PlaybackId>,
    start_pos: f64,
    end_pos: f64,
    current_pos: f64,
    rate_seek: f64,
    start_time: f64,
    /// Bumped per `play`; stale ended signals carry an older value
    play_generation: u64,
    fading: bool,
    fade_timer: Option<JoinHandle<()>>,
    /// Bumped when a fade starts or is cancelled
    fade_generation: u64,
}

struct SoundInner {
    id: SoundId,
    backend: Arc<dyn AudioBackend>,
    gain_node: NodeId,
    data: Mutex<SoundData>,
    on_play_end: Option<SoundCallback>,
    on_fade_end: Option<SoundCallback>,
    on_destroy: Option<SoundCallback>,
}

/// Handle to one sound instance (cheap to clone)
#[derive(Clone)]
pub struct Sound {
    inner: Arc<SoundInner>,
}

impl Sound {
    /// Create a sound over `buffer` with its own gain node
    ///
    /// The region is clamped into the buffer: `0 <= start <= end <= duration`.
    /// The gain node is left unconnected.
    pub fn new(backend: Arc<dyn AudioBackend>, buffer: Arc<AudioBuffer>, options: SoundOptions) -> Self {
        let length = buffer.duration();
        let start_pos = options.start.unwrap_or(0.0).clamp(0.0, length);
        let end_pos = options.end.unwrap_or(length).clamp(start_pos, length);

        let gain_node = backend.create_volume_node();
        let initial_gain = if options.muted { 0.0 } else { options.volume };
        backend.set_gain(gain_node, initial_gain, backend.current_time());

        let id = options.id.unwrap_or_else(SoundId::next);
        trace!("Sound {} created: region [{:.3}, {:.3}]", id, start_pos, end_pos);

        Self {
            inner: Arc::new(SoundInner {
                id,
                backend,
                gain_node,
                data: Mutex::new(SoundData {
                    state: SoundState::Ready,
                    volume: options.volume,
                    rate: options.rate,
                    muted: options.muted,
                    looping: options.looping,
                    buffer: Some(buffer),
                    playback: None,
                    start_pos,
                    end_pos,
                    current_pos: 0.0,
                    rate_seek: 0.0,
                    start_time: 0.0,
                    play_generation: 0,
                    fading: false,
                    fade_timer: None,
                    fade_generation: 0,
                }),
                on_play_end: options.on_play_end,
                on_fade_end: options.on_fade_end,
                on_destroy: options.on_destroy,
            }),
        }
    }

    /// Start (or resume) playback
    pub fn play(&self) -> &Self {
        let mut data = self.inner.data.lock();
        self.play_locked(&mut data);
        self
    }

    /// Pause playback, keeping the position
    pub fn pause(&self) -> &Self {
        let mut data = self.inner.data.lock();
        self.pause_locked(&mut data);
        self
    }

    /// Stop playback and rewind
    pub fn stop(&self) -> &Self {
        let mut data = self.inner.data.lock();
        self.stop_locked(&mut data);
        self
    }

    pub fn mute(&self) -> &Self {
        let mut data = self.inner.data.lock();
        if data.state == SoundState::Destroyed {
            return self;
        }
        self.fade_stop_locked(&mut data);
        let backend = &self.inner.backend;
        backend.set_gain(self.inner.gain_node, 0.0, backend.current_time());
        data.muted = true;
        self
    }

    pub fn unmute(&self) -> &Self {
        let mut data = self.inner.data.lock();
        if data.state == SoundState::Destroyed {
            return self;
        }
        self.fade_stop_locked(&mut data);
        let backend = &self.inner.backend;
        backend.set_gain(self.inner.gain_node, data.volume, backend.current_time());
        data.muted = false;
        self
    }

    /// Logical (unmuted) volume
    pub fn volume(&self) -> f32 {
        self.inner.data.lock().volume
    }

    /// Set the logical volume, cancelling any fade
    ///
    /// Range validation is the caller's job.
    pub fn set_volume(&self, volume: f32) -> &Self {
        let mut data = self.inner.data.lock();
        if data.state == SoundState::Destroyed {
            return self;
        }
        self.fade_stop_locked(&mut data);
        self.apply_volume_locked(&mut data, volume);
        self
    }

    /// Ramp the gain to `to` over `duration` seconds
    ///
    /// On completion the logical volume becomes `to` and the fade-end
    /// callback fires. A running fade is stopped first.
    pub fn fade(&self, to: f32, duration: f64, curve: FadeCurve) -> &Self {
        let mut data = self.inner.data.lock();
        if data.state == SoundState::Destroyed {
            return self;
        }
        let Some(wait) = fade_duration(duration) else {
            warn!("Sound {} ignoring fade over {}s", self.inner.id, duration);
            return self;
        };
        if data.fading {
            self.fade_stop_locked(&mut data);
        }

        let duration = wait.as_secs_f64();
        let backend = &self.inner.backend;
        backend.schedule_ramp(
            self.inner.gain_node,
            to,
            backend.current_time() + duration,
            curve,
        );

        data.fading = true;
        data.fade_generation += 1;
        let generation = data.fade_generation;

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let weak = Arc::downgrade(&self.inner);
                data.fade_timer = Some(runtime.spawn(async move {
                    tokio::time::sleep(wait).await;
                    complete_fade(weak, generation, to);
                }));
            }
            Err(_) => {
                // No timer available; land on the target immediately
                data.fading = false;
                self.apply_volume_locked(&mut data, to);
                drop(data);
                if let Some(callback) = &self.inner.on_fade_end {
                    callback(self.inner.id);
                }
            }
        }
        self
    }

    /// Cancel a running fade, keeping the gain where it currently is
    pub fn fade_stop(&self) -> &Self {
        let mut data = self.inner.data.lock();
        if data.state == SoundState::Destroyed {
            return self;
        }
        self.fade_stop_locked(&mut data);
        self
    }

    /// Current playback position in seconds
    pub fn seek(&self) -> f64 {
        let data = self.inner.data.lock();
        self.seek_locked(&data)
    }

    /// Move the playback position
    ///
    /// Positions outside `[start, end]` are ignored. A playing sound is
    /// re-anchored at the new position.
    pub fn set_seek(&self, position: f64) -> &Self {
        self.seek_to(position);
        self
    }

    /// Move the playback position, returning false if it was rejected
    pub(crate) fn seek_to(&self, position: f64) -> bool {
        let mut data = self.inner.data.lock();
        if data.state == SoundState::Destroyed
            || position < data.start_pos
            || position > data.end_pos
        {
            return false;
        }

        let was_playing = data.state == SoundState::Playing;
        if was_playing {
            self.pause_locked(&mut data);
        }
        data.current_pos = position;
        data.rate_seek = 0.0;
        if was_playing {
            self.play_locked(&mut data);
        }
        true
    }

    pub fn rate(&self) -> f64 {
        self.inner.data.lock().rate
    }

    /// Change the playback rate without restarting
    pub fn set_rate(&self, rate: f64) -> &Self {
        let mut data = self.inner.data.lock();
        if data.state == SoundState::Destroyed {
            return self;
        }

        data.rate_seek = self.seek_locked(&data);
        data.rate = rate;

        if data.state == SoundState::Playing {
            let now = self.inner.backend.current_time();
            data.start_time = now;
            if let Some(playback) = data.playback {
                self.inner.backend.set_rate(playback, rate, now);
            }
        }
        self
    }

    pub fn looping(&self) -> bool {
        self.inner.data.lock().looping
    }

    pub fn set_loop(&self, looping: bool) -> &Self {
        let mut data = self.inner.data.lock();
        if data.state == SoundState::Destroyed {
            return self;
        }
        data.looping = looping;
        if let Some(playback) = data.playback {
            self.inner
                .backend
                .set_loop_region(playback, data.start_pos, data.end_pos, looping);
        }
        self
    }

    /// Release the sound (idempotent)
    ///
    /// Stops playback, releases the gain node and drops the buffer
    /// reference. The destroy callback fires exactly once.
    pub fn destroy(&self) -> &Self {
        {
            let mut data = self.inner.data.lock();
            if data.state == SoundState::Destroyed {
                return self;
            }
            self.stop_locked(&mut data);
            self.cancel_fade_timer(&mut data);
            data.fading = false;
            self.inner.backend.release_node(self.inner.gain_node);
            data.buffer = None;
            data.state = SoundState::Destroyed;
        }
        debug!("Sound {} destroyed", self.inner.id);

        if let Some(callback) = &self.inner.on_destroy {
            callback(self.inner.id);
        }
        self
    }

    pub fn id(&self) -> SoundId {
        self.inner.id
    }

    pub fn state(&self) -> SoundState {
        self.inner.data.lock().state
    }

    pub fn muted(&self) -> bool {
        self.inner.data.lock().muted
    }

    /// Length of the playable region (`end - start`)
    pub fn duration(&self) -> f64 {
        let data = self.inner.data.lock();
        data.end_pos - data.start_pos
    }

    /// Region `(start, end)` in seconds
    pub fn region(&self) -> (f64, f64) {
        let data = self.inner.data.lock();
        (data.start_pos, data.end_pos)
    }

    pub fn is_playing(&self) -> bool {
        self.state() == SoundState::Playing
    }

    pub fn is_paused(&self) -> bool {
        self.state() == SoundState::Paused
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == SoundState::Destroyed
    }

    pub fn is_fading(&self) -> bool {
        self.inner.data.lock().fading
    }

    /// Gain node the engine connects to its master gain
    pub fn gain_node(&self) -> NodeId {
        self.inner.gain_node
    }

    /// Playback currently scheduled on the backend, if any
    pub fn playback(&self) -> Option<PlaybackId> {
        self.inner.data.lock().playback
    }

    fn play_locked(&self, data: &mut SoundData) {
        if matches!(data.state, SoundState::Playing | SoundState::Destroyed) {
            return;
        }
        let Some(buffer) = data.buffer.clone() else {
            return;
        };

        let backend = &self.inner.backend;
        let offset = if data.current_pos > 0.0 {
            data.current_pos
        } else {
            data.start_pos
        }
        .max(0.0);
        let now = backend.current_time();

        let playback = backend.create_playback(&buffer, self.inner.gain_node);
        backend.set_rate(playback, data.rate, now);
        if data.looping {
            backend.set_loop_region(playback, data.start_pos, data.end_pos, true);
        }

        data.play_generation += 1;
        let generation = data.play_generation;
        let weak = Arc::downgrade(&self.inner);
        backend.on_ended(
            playback,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    Sound { inner }.handle_ended(generation);
                }
            }),
        );

        let length = if data.looping {
            None
        } else {
            Some((data.end_pos - offset).max(0.0))
        };
        backend.start(playback, now, offset, length);

        data.playback = Some(playback);
        data.current_pos = offset;
        data.rate_seek = 0.0;
        data.start_time = now;
        data.state = SoundState::Playing;
        trace!("Sound {} playing from {:.3}", self.inner.id, offset);
    }

    fn pause_locked(&self, data: &mut SoundData) {
        if data.state != SoundState::Playing {
            return;
        }
        self.fade_stop_locked(data);
        data.current_pos = self.seek_locked(data);
        data.rate_seek = 0.0;
        self.release_playback(data);
        data.state = SoundState::Paused;
    }

    fn stop_locked(&self, data: &mut SoundData) {
        if !matches!(data.state, SoundState::Playing | SoundState::Paused) {
            return;
        }
        self.fade_stop_locked(data);
        data.current_pos = 0.0;
        data.rate_seek = 0.0;
        self.release_playback(data);
        data.state = SoundState::Ready;
    }

    fn seek_locked(&self, data: &SoundData) -> f64 {
        let elapsed = if data.state == SoundState::Playing {
            self.inner.backend.current_time() - data.start_time
        } else {
            0.0
        };
        let rate_elapsed = if data.rate_seek != 0.0 {
            data.rate_seek - data.current_pos
        } else {
            0.0
        };
        data.current_pos + rate_elapsed + elapsed * data.rate
    }

    fn apply_volume_locked(&self, data: &mut SoundData, volume: f32) {
        let backend = &self.inner.backend;
        let gain = if data.muted { 0.0 } else { volume };
        backend.set_gain(self.inner.gain_node, gain, backend.current_time());
        data.volume = volume;
    }

    fn fade_stop_locked(&self, data: &mut SoundData) {
        if !data.fading {
            return;
        }
        let backend = &self.inner.backend;
        let gain = backend.gain(self.inner.gain_node);
        backend.cancel_scheduled_ramp(self.inner.gain_node, backend.current_time());
        self.cancel_fade_timer(data);
        data.fading = false;
        self.apply_volume_locked(data, gain);
    }

    fn cancel_fade_timer(&self, data: &mut SoundData) {
        if let Some(timer) = data.fade_timer.take() {
            timer.abort();
        }
        data.fade_generation += 1;
    }

    fn release_playback(&self, data: &mut SoundData) {
        if let Some(playback) = data.playback.take() {
            self.inner.backend.stop(playback);
        }
    }

    fn handle_ended(&self, generation: u64) {
        {
            let mut data = self.inner.data.lock();
            if data.state != SoundState::Playing || data.play_generation != generation {
                return;
            }
            data.current_pos = 0.0;
            data.rate_seek = 0.0;
            self.release_playback(&mut data);
            data.state = SoundState::Ready;
        }
        trace!("Sound {} reached its end", self.inner.id);

        if let Some(callback) = &self.inner.on_play_end {
            callback(self.inner.id);
        }
    }
}

fn complete_fade(weak: Weak<SoundInner>, generation: u64, to: f32) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let sound = Sound { inner };
    {
        let mut data = sound.inner.data.lock();
        if data.state == SoundState::Destroyed
            || !data.fading
            || data.fade_generation != generation
        {
            return;
        }
        data.fading = false;
        data.fade_timer = None;
        sound.apply_volume_locked(&mut data, to);
    }
    if let Some(callback) = &sound.inner.on_fade_end {
        callback(sound.inner.id);
    }
}

impl std::fmt::Debug for Sound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.inner.data.lock();
        f.debug_struct("Sound")
            .field("id", &self.inner.id)
            .field("state", &data.state)
            .field("volume", &data.volume)
            .field("muted", &data.muted)
            .field("rate", &data.rate)
            .field("looping", &data.looping)
            .finish()
    }
}
