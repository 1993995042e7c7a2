//! Identifier and state types shared across the player

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-wide unique, non-zero id
///
/// Sound ids and group ids share this counter, so an id is never reused by
/// either kind within one process.
pub fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Unique id of one sound instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SoundId(pub u64);

impl SoundId {
    /// Allocate a fresh id
    pub fn next() -> Self {
        SoundId(next_id())
    }
}

impl std::fmt::Display for SoundId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique id of one sound group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub u64);

impl GroupId {
    /// Allocate a fresh id
    pub fn next() -> Self {
        GroupId(next_id())
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Playback state of one sound instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoundState {
    /// Idle, can be played
    Ready,
    /// Scheduled on the device
    Playing,
    /// Stopped with the position retained
    Paused,
    /// Released; every further call is a no-op
    Destroyed,
}

impl std::fmt::Display for SoundState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SoundState::Ready => write!(f, "ready"),
            SoundState::Playing => write!(f, "playing"),
            SoundState::Paused => write!(f, "paused"),
            SoundState::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Device state of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineState {
    NotReady,
    Ready,
    Suspending,
    Suspended,
    Resuming,
    Destroying,
    Done,
    /// Absorbing: backend was unavailable at setup
    NoAudio,
}

impl EngineState {
    /// True while a suspend or resume is in flight or the device is suspended
    pub fn is_suspended_or_transitioning(&self) -> bool {
        matches!(
            self,
            EngineState::Suspending | EngineState::Suspended | EngineState::Resuming
        )
    }

    /// True once terminate has started or finished
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, EngineState::Destroying | EngineState::Done)
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineState::NotReady => "not-ready",
            EngineState::Ready => "ready",
            EngineState::Suspending => "suspending",
            EngineState::Suspended => "suspended",
            EngineState::Resuming => "resuming",
            EngineState::Destroying => "destroying",
            EngineState::Done => "done",
            EngineState::NoAudio => "no-audio",
        };
        write!(f, "{}", s)
    }
}

/// Load state of a group's buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadState {
    NotLoaded,
    Loading,
    Loaded,
}

/// Lifecycle state of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupState {
    Ready,
    Destroyed,
}
