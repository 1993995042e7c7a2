//! Notifications published by the engine and by groups
//!
//! Both enums are broadcast over a [`chorus_common::EventBus`]; subscribers
//! see them after the emitting operation has returned.

use crate::error::{Error, ErrorKind};
use crate::types::{GroupId, SoundId};
use serde::Serialize;

pub use chorus_common::EventBus;

// ========================================
// Engine Events
// ========================================

/// Notification from the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A sound was registered in the pool
    Add {
        sound: SoundId,
        group: Option<GroupId>,
    },
    /// A sound was evicted from the pool
    Remove { sound: SoundId },
    /// Master volume changed
    Volume { volume: f32 },
    /// Master mute toggled
    Mute { muted: bool },
    /// Every sound was paused
    Pause,
    /// Every sound was stopped
    Stop,
    /// Device suspended
    Suspend,
    /// Device resumed
    Resume,
    Error { kind: ErrorKind, message: String },
    /// Terminate finished
    Done,
}

impl EngineEvent {
    pub fn error(error: &Error) -> Self {
        EngineEvent::Error {
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    /// Short name, used in logs
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::Add { .. } => "add",
            EngineEvent::Remove { .. } => "remove",
            EngineEvent::Volume { .. } => "volume",
            EngineEvent::Mute { .. } => "mute",
            EngineEvent::Pause => "pause",
            EngineEvent::Stop => "stop",
            EngineEvent::Suspend => "suspend",
            EngineEvent::Resume => "resume",
            EngineEvent::Error { .. } => "error",
            EngineEvent::Done => "done",
        }
    }
}

// ========================================
// Group Events
// ========================================

/// Notification from a group
///
/// `sound` is the instance the event concerns, or `None` for group-wide
/// events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GroupEvent {
    /// Buffer loaded
    Load { source: String, duration: f64 },
    /// Buffer released
    Unload,
    PlayStart { sound: SoundId },
    PlayEnd { sound: SoundId },
    Pause { sound: Option<SoundId> },
    Stop { sound: Option<SoundId> },
    Volume { sound: Option<SoundId>, volume: f32 },
    Mute { sound: Option<SoundId>, muted: bool },
    Seek { sound: SoundId, position: f64 },
    Rate { sound: Option<SoundId>, rate: f64 },
    FadeStart { sound: Option<SoundId> },
    FadeEnd { sound: Option<SoundId> },
    FadeStop { sound: Option<SoundId> },
    Error {
        kind: ErrorKind,
        message: String,
        sound: Option<SoundId>,
    },
    /// A sound (`Some`) or the whole group (`None`) was destroyed
    Destroy { sound: Option<SoundId> },
}

impl GroupEvent {
    pub fn error(error: &Error, sound: Option<SoundId>) -> Self {
        GroupEvent::Error {
            kind: error.kind(),
            message: error.to_string(),
            sound,
        }
    }

    /// Instance the event concerns, if any
    pub fn sound(&self) -> Option<SoundId> {
        match self {
            GroupEvent::PlayStart { sound }
            | GroupEvent::PlayEnd { sound }
            | GroupEvent::Seek { sound, .. } => Some(*sound),
            GroupEvent::Pause { sound }
            | GroupEvent::Stop { sound }
            | GroupEvent::Volume { sound, .. }
            | GroupEvent::Mute { sound, .. }
            | GroupEvent::Rate { sound, .. }
            | GroupEvent::FadeStart { sound }
            | GroupEvent::FadeEnd { sound }
            | GroupEvent::FadeStop { sound }
            | GroupEvent::Error { sound, .. }
            | GroupEvent::Destroy { sound } => *sound,
            GroupEvent::Load { .. } | GroupEvent::Unload => None,
        }
    }
}
