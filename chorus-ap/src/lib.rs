//! # Chorus Audio Player Library (chorus-ap)
//!
//! Playback orchestration over an abstract audio device.
//!
//! **Purpose:** Load and cache decoded buffers, manage pools of concurrent
//! sound instances with per-instance volume, rate, seek, loop and fades, and
//! drive the device through suspend/resume/terminate without racing
//! in-flight transitions.
//!
//! **Architecture:**
//! - [`Engine`] owns the device connection, master gain, [`Loader`] cache,
//!   instance [`Heap`] and an [`ActionQueue`] of deferred work.
//! - [`Group`] is the user-facing logical sound: one set of candidate
//!   sources, an optional sprite map, and deferred play/seek until loaded.
//! - [`AudioBackend`] abstracts the device; [`SimulatedBackend`] is a
//!   clock-driven implementation used by the CLI and the tests.
//!
//! Every handle is cheap to clone. Notifications are broadcast on
//! [`EventBus`] channels and observed after the emitting call returns.

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod fetch;
pub mod group;
pub mod heap;
pub mod loader;
pub mod queue;
pub mod sound;
pub mod source;
pub mod types;

pub use backend::{AudioBackend, AudioBuffer, SimulatedBackend};
pub use config::{ChorusConfig, EngineConfig, GroupConfig, SpriteRegion};
pub use engine::Engine;
pub use error::{Error, ErrorKind, Result};
pub use events::{EngineEvent, EventBus, GroupEvent};
pub use fetch::{DefaultFetcher, SourceFetcher};
pub use group::Group;
pub use heap::Heap;
pub use loader::{LoadOutcome, Loader};
pub use queue::ActionQueue;
pub use sound::{Sound, SoundOptions};
pub use types::{EngineState, GroupId, GroupState, LoadState, SoundId, SoundState};

pub use chorus_common::FadeCurve;
