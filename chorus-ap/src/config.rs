//! Engine and group configuration
//!
//! Every recognized option is an explicit field with a validated range.
//! Out-of-range values are rejected by `validate()` rather than clamped.
//!
//! # File format
//!
//! ```toml
//! [engine]
//! volume = 0.8
//! cleanup_interval_minutes = 5
//!
//! [[groups]]
//! sources = ["sounds/dog.mp3", "sounds/dog.wav"]
//! volume = 0.5
//!
//! [groups.sprite]
//! bark = { start = 0.0, end = 1.2 }
//! ```

use crate::error::{Error, Result};
use crate::types::GroupId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Lowest accepted playback rate
pub const MIN_RATE: f64 = 0.5;
/// Highest accepted playback rate
pub const MAX_RATE: f64 = 5.0;

/// True if `volume` is a valid volume (0.0 - 1.0)
pub fn is_valid_volume(volume: f32) -> bool {
    (0.0..=1.0).contains(&volume)
}

/// True if `rate` is a valid playback rate (0.5 - 5.0)
pub fn is_valid_rate(rate: f64) -> bool {
    (MIN_RATE..=MAX_RATE).contains(&rate)
}

/// Fade length as a timer duration
///
/// Negative lengths fade instantly; `None` for lengths a timer cannot
/// represent (NaN, infinite or out of range).
pub fn fade_duration(seconds: f64) -> Option<Duration> {
    if seconds.is_nan() {
        return None;
    }
    Duration::try_from_secs_f64(seconds.max(0.0)).ok()
}

// ========================================
// Engine
// ========================================

/// Engine settings applied once by `Engine::setup`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Master volume (0.0 - 1.0)
    pub volume: f32,
    /// Start with the master gain muted
    pub muted: bool,
    /// Period of the idle-sound eviction sweep
    pub cleanup_interval_minutes: f64,
    /// Resume a device that starts suspended on the first user interaction
    pub auto_enable: bool,
    /// Notification channel capacity
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            volume: 1.0,
            muted: false,
            cleanup_interval_minutes: 5.0,
            auto_enable: true,
            event_capacity: 100,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if !is_valid_volume(self.volume) {
            return Err(Error::Config(format!(
                "engine volume {} out of range 0.0-1.0",
                self.volume
            )));
        }
        if !(self.cleanup_interval_minutes.is_finite() && self.cleanup_interval_minutes > 0.0) {
            return Err(Error::Config(format!(
                "cleanup_interval_minutes must be positive, got {}",
                self.cleanup_interval_minutes
            )));
        }
        if self.event_capacity == 0 {
            return Err(Error::Config("event_capacity must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Parse and validate a TOML document containing only engine settings
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = chorus_common::config::parse_toml(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate engine settings from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = chorus_common::config::load_toml(path)?;
        config.validate()?;
        Ok(config)
    }
}

// ========================================
// Group
// ========================================

/// Named sub-region of a buffer, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpriteRegion {
    pub start: f64,
    pub end: f64,
}

impl SpriteRegion {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

impl From<(f64, f64)> for SpriteRegion {
    fn from((start, end): (f64, f64)) -> Self {
        Self { start, end }
    }
}

/// Settings of one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Explicit id; a fresh one is allocated when `None`
    pub id: Option<GroupId>,
    /// Candidate sources, in preference order
    pub sources: Vec<String>,
    /// Format hints paired with `sources` by index
    pub formats: Vec<String>,
    pub sprite: BTreeMap<String, SpriteRegion>,
    pub volume: f32,
    pub rate: f64,
    pub muted: bool,
    #[serde(alias = "loop")]
    pub looping: bool,
    /// Load as soon as the group is created
    pub preload: bool,
    /// Play as soon as the group is created
    pub autoplay: bool,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            id: None,
            sources: Vec::new(),
            formats: Vec::new(),
            sprite: BTreeMap::new(),
            volume: 1.0,
            rate: 1.0,
            muted: false,
            looping: false,
            preload: false,
            autoplay: false,
        }
    }
}

impl GroupConfig {
    /// Group over a single source
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            sources: vec![source.into()],
            ..Default::default()
        }
    }

    /// Group over several candidate sources
    pub fn with_sources<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sources: sources.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: GroupId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_formats<I, S>(mut self, formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.formats = formats.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_sprite(mut self, label: impl Into<String>, region: impl Into<SpriteRegion>) -> Self {
        self.sprite.insert(label.into(), region.into());
        self
    }

    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = volume;
        self
    }

    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_muted(mut self, muted: bool) -> Self {
        self.muted = muted;
        self
    }

    pub fn with_loop(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn with_preload(mut self, preload: bool) -> Self {
        self.preload = preload;
        self
    }

    pub fn with_autoplay(mut self, autoplay: bool) -> Self {
        self.autoplay = autoplay;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(Error::Config("a group needs at least one source".to_string()));
        }
        if !is_valid_volume(self.volume) {
            return Err(Error::Config(format!(
                "group volume {} out of range 0.0-1.0",
                self.volume
            )));
        }
        if !is_valid_rate(self.rate) {
            return Err(Error::Config(format!(
                "group rate {} out of range {}-{}",
                self.rate, MIN_RATE, MAX_RATE
            )));
        }
        for (label, region) in &self.sprite {
            if !(region.start >= 0.0 && region.start <= region.end) {
                return Err(Error::Config(format!(
                    "sprite '{}' has invalid region [{}, {}]",
                    label, region.start, region.end
                )));
            }
        }
        Ok(())
    }
}

// ========================================
// Config file
// ========================================

/// Contents of a chorus config file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChorusConfig {
    pub engine: EngineConfig,
    pub groups: Vec<GroupConfig>,
}

impl ChorusConfig {
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        for group in &self.groups {
            group.validate()?;
        }
        Ok(())
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = chorus_common::config::parse_toml(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config file (CLI, `CHORUS_CONFIG`, user config dir) and load it
    ///
    /// Falls back to defaults when no file is found.
    pub fn resolve(cli_arg: Option<&Path>) -> Result<Self> {
        let config: Self = chorus_common::config::load_or_default(
            cli_arg,
            chorus_common::config::CONFIG_ENV_VAR,
        )?;
        config.validate()?;
        Ok(config)
    }
}
