//! Audio backend seam
//!
//! The player core never talks to an audio API directly. Everything it needs
//! from the output device goes through [`AudioBackend`]: creating gain nodes,
//! scheduling buffer playback at a device clock time, decoding raw bytes and
//! driving the device suspend/resume/close lifecycle.
//!
//! # Contract
//!
//! - All handles are plain ids; the backend owns the underlying resources.
//! - `decode`, `suspend`, `resume` and `close` resolve exactly once.
//! - `on_ended` callbacks are delivered asynchronously (never from inside a
//!   call made by the core) and are not delivered for a playback released
//!   through `stop`.
//! - Times are in seconds on the backend's own clock (`current_time`).

pub mod simulated;

pub use simulated::SimulatedBackend;

use chorus_common::FadeCurve;
use futures::future::BoxFuture;
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by the backend
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct BackendError(pub String);

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        BackendError(message.into())
    }
}

/// Handle to a gain (volume) node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u64);

/// Handle to one scheduled buffer playback
///
/// Playbacks are single use: once stopped or ended they are not restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaybackId(pub u64);

/// Where a gain node's output goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// The device output
    Output,
    /// Another gain node
    Node(NodeId),
}

/// Callback invoked when a playback reaches its scheduled end
pub type EndedCallback = Box<dyn FnOnce() + Send + 'static>;

/// Decoded, ready-to-play audio for one source
///
/// Shared as `Arc<AudioBuffer>` between the loader cache and every sound
/// instance created from it.
pub struct AudioBuffer {
    duration: f64,
    sample_rate: u32,
    channels: u16,
    native: Option<Box<dyn Any + Send + Sync>>,
}

impl AudioBuffer {
    /// Create a buffer descriptor without backend-native data
    pub fn new(duration: f64, sample_rate: u32, channels: u16) -> Self {
        Self {
            duration: duration.max(0.0),
            sample_rate,
            channels,
            native: None,
        }
    }

    /// Attach backend-native data (sample storage, device handle, ...)
    pub fn with_native<T: Any + Send + Sync>(mut self, native: T) -> Self {
        self.native = Some(Box::new(native));
        self
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Borrow the backend-native data, if it has type `T`
    pub fn native<T: Any>(&self) -> Option<&T> {
        self.native.as_ref().and_then(|n| n.downcast_ref::<T>())
    }
}

impl std::fmt::Debug for AudioBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioBuffer")
            .field("duration", &self.duration)
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("has_native", &self.native.is_some())
            .finish()
    }
}

/// Capability interface of the audio output backend
pub trait AudioBackend: Send + Sync {
    /// Whether the platform can produce audio at all
    fn is_available(&self) -> bool;

    /// Whether the device is currently suspended (checked once at setup)
    fn is_suspended(&self) -> bool;

    /// Whether the backend can decode the given format/extension ("mp3", "wav", ...)
    fn supports_format(&self, format: &str) -> bool;

    /// Device clock in seconds
    fn current_time(&self) -> f64;

    /// Decode raw bytes into a playable buffer
    fn decode(&self, bytes: Vec<u8>) -> BoxFuture<'static, Result<AudioBuffer, BackendError>>;

    /// Create a gain node with gain 1.0, not connected anywhere
    fn create_volume_node(&self) -> NodeId;

    fn connect(&self, node: NodeId, destination: Destination);

    fn disconnect(&self, node: NodeId);

    /// Free a gain node that will not be used again
    fn release_node(&self, node: NodeId) {
        self.disconnect(node);
    }

    /// Set the gain at `at_time`, replacing any scheduled ramp
    fn set_gain(&self, node: NodeId, value: f32, at_time: f64);

    /// Instantaneous gain value (including any ramp in progress)
    fn gain(&self, node: NodeId) -> f32;

    /// Ramp the gain from its current value to `target`, arriving at `end_time`
    fn schedule_ramp(&self, node: NodeId, target: f32, end_time: f64, curve: FadeCurve);

    /// Cancel scheduled ramps, holding the gain at its value at `at_time`
    fn cancel_scheduled_ramp(&self, node: NodeId, at_time: f64);

    /// Create a playback of `buffer` feeding `output`
    fn create_playback(&self, buffer: &Arc<AudioBuffer>, output: NodeId) -> PlaybackId;

    /// Start playback at `at_time` from `offset` for `duration` seconds
    /// (`None` plays until stopped, used for looping)
    fn start(&self, playback: PlaybackId, at_time: f64, offset: f64, duration: Option<f64>);

    /// Stop and release a playback
    fn stop(&self, playback: PlaybackId);

    /// Register the natural-completion callback of a playback
    fn on_ended(&self, playback: PlaybackId, callback: EndedCallback);

    fn set_rate(&self, playback: PlaybackId, rate: f64, at_time: f64);

    fn set_loop_region(&self, playback: PlaybackId, start: f64, end: f64, enabled: bool);

    fn suspend(&self) -> BoxFuture<'static, Result<(), BackendError>>;

    fn resume(&self) -> BoxFuture<'static, Result<(), BackendError>>;

    fn close(&self) -> BoxFuture<'static, Result<(), BackendError>>;
}
