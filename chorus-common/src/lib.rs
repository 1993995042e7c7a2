//! # Chorus Common Library
//!
//! Shared code for the Chorus crates including:
//! - Error types
//! - Generic broadcast event bus
//! - Config file resolution and TOML loading
//! - Fade curve definitions and calculations

pub mod config;
pub mod error;
pub mod events;
pub mod fade_curves;

pub use error::{Error, Result};
pub use events::EventBus;
pub use fade_curves::FadeCurve;
