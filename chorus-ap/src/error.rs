//! Error types for chorus-ap
//!
//! Failures never cross the public call boundary as panics. Most operations
//! return a benign value and report problems through an `Error` event; the
//! variants here are the payloads of those events and of the few
//! constructors that can reject their input.
//!
//! `Error` is `Clone` so that one decode failure can be handed to every
//! waiter of a coalesced load.

use serde::Serialize;
use thiserror::Error;

/// Main error type for chorus-ap
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// No audio backend is available on this platform (terminal)
    #[error("Audio backend is not available")]
    NoAudioBackend,

    /// Raw bytes could not be decoded into a playable buffer
    #[error("Decode failed for {uri}: {reason}")]
    Decode { uri: String, reason: String },

    /// None of the candidate sources matches a decodable format
    #[error("No supported source among candidates: {0}")]
    UnsupportedSource(String),

    /// Raw bytes could not be fetched
    #[error("Fetch failed for {uri}: {reason}")]
    Fetch { uri: String, reason: String },

    /// Backend rejected a suspend/resume/close request
    #[error("Device {operation} failed: {reason}")]
    DeviceTransition { operation: String, reason: String },

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Notification category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoAudioBackend => ErrorKind::NoAudio,
            Error::Decode { .. } | Error::UnsupportedSource(_) | Error::Fetch { .. } => {
                ErrorKind::Load
            }
            Error::DeviceTransition { .. } => ErrorKind::Engine,
            Error::Config(_) | Error::InvalidState(_) => ErrorKind::Play,
        }
    }
}

impl From<chorus_common::Error> for Error {
    fn from(e: chorus_common::Error) -> Self {
        Error::Config(e.to_string())
    }
}

/// Category carried by `Error` notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Audio backend unavailable
    NoAudio,
    /// Source could not be loaded
    Load,
    /// Playback request could not be honored
    Play,
    /// Device transition failed
    Engine,
}

/// Convenience Result type using chorus-ap Error
pub type Result<T> = std::result::Result<T, Error>;
