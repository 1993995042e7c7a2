//! Group: a named logical sound
//!
//! A group wraps one set of candidate sources (plus an optional sprite map)
//! and creates sound instances over the buffer it loads. Calls that arrive
//! before their precondition holds are parked on the group's own queue:
//!
//! - `"after-load"`: `play-{id}` and `seek-{id}` actions waiting for the
//!   buffer to finish loading.
//! - `"after-engine-resume"`: `sound-{id}` actions waiting for the device to
//!   resume.
//!
//! `play()` allocates the instance id up front, so callers get a stable id
//! synchronously even when construction is deferred.
//!
//! Methods taking `Option<SoundId>` act on one instance when given an id and
//! on the whole group (every instance plus the group defaults) otherwise.

use crate::backend::AudioBuffer;
use crate::config::{
    fade_duration, is_valid_rate, is_valid_volume, EngineConfig, GroupConfig, SpriteRegion,
};
use crate::engine::{spawn_task, Engine, AFTER_RESUME};
use crate::error::{Error, Result};
use crate::events::{EventBus, GroupEvent};
use crate::loader::LoadOutcome;
use crate::queue::ActionQueue;
use crate::sound::{Sound, SoundCallback, SoundOptions};
use crate::source::compatible_source;
use crate::types::{EngineState, GroupId, GroupState, LoadState, SoundId, SoundState};
use chorus_common::FadeCurve;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Group queue key released when the buffer has loaded
pub const AFTER_LOAD: &str = "after-load";
/// Group queue key released when the engine has resumed
pub const AFTER_ENGINE_RESUME: &str = "after-engine-resume";

struct GroupData {
    state: GroupState,
    load_state: LoadState,
    /// Bumped by every load start, unload and destroy
    load_generation: u64,
    source: Option<String>,
    /// Held while loaded so cache unloads elsewhere do not affect this group
    buffer: Option<Arc<AudioBuffer>>,
    duration: f64,
    volume: f32,
    rate: f64,
    muted: bool,
    looping: bool,
    fading: bool,
    fade_timer: Option<JoinHandle<()>>,
    fade_generation: u64,
}

struct GroupInner {
    id: GroupId,
    engine: Engine,
    sources: Vec<String>,
    formats: Vec<String>,
    sprite: std::collections::BTreeMap<String, SpriteRegion>,
    queue: ActionQueue,
    events: EventBus<GroupEvent>,
    /// Id of this group's hook under the engine's `"after-resume"` key
    resume_hook: String,
    data: Mutex<GroupData>,
}

/// Handle to a group (cheap to clone)
#[derive(Clone)]
pub struct Group {
    inner: Arc<GroupInner>,
}

impl Group {
    /// Create a group on `engine`
    ///
    /// Sets the engine up with default settings if nobody has yet. Fails only
    /// on an invalid configuration; an engine without audio yields a group
    /// that reports a `NoAudio` error notification.
    pub fn new(engine: &Engine, config: GroupConfig) -> Result<Self> {
        Self::with_receiver(engine, config).map(|(group, _)| group)
    }

    /// Like [`Group::new`], also returning a receiver subscribed before any
    /// construction-time notification (autoplay, preload, no-audio error)
    pub fn with_receiver(
        engine: &Engine,
        config: GroupConfig,
    ) -> Result<(Self, broadcast::Receiver<GroupEvent>)> {
        config.validate()?;
        engine.setup(&EngineConfig::default());

        let id = config.id.unwrap_or_else(GroupId::next);
        let events = EventBus::new(engine.config().event_capacity);
        let receiver = events.subscribe();

        let group = Self {
            inner: Arc::new(GroupInner {
                id,
                engine: engine.clone(),
                sources: config.sources,
                formats: config.formats,
                sprite: config.sprite,
                queue: ActionQueue::new(),
                events,
                resume_hook: format!("group-{}", id),
                data: Mutex::new(GroupData {
                    state: GroupState::Ready,
                    load_state: LoadState::NotLoaded,
                    load_generation: 0,
                    source: None,
                    buffer: None,
                    duration: 0.0,
                    volume: config.volume,
                    rate: config.rate,
                    muted: config.muted,
                    looping: config.looping,
                    fading: false,
                    fade_timer: None,
                    fade_generation: 0,
                }),
            }),
        };

        let weak = Arc::downgrade(&group.inner);
        engine.queue().add(
            AFTER_RESUME,
            &group.inner.resume_hook,
            move || {
                if let Some(inner) = weak.upgrade() {
                    Group { inner }.on_engine_resume();
                }
            },
            false,
        );

        if engine.state() == EngineState::NoAudio {
            group.emit(GroupEvent::error(&Error::NoAudioBackend, None));
            return Ok((group, receiver));
        }

        debug!("Group {} created over {:?}", id, group.inner.sources);
        if config.autoplay {
            group.play();
        } else if config.preload {
            group.load();
        }
        Ok((group, receiver))
    }

    // ========================================
    // Loading
    // ========================================

    /// Start loading the buffer (no-op if loaded or loading)
    pub fn load(&self) -> &Self {
        let (source, generation) = {
            let mut data = self.inner.data.lock();
            if data.state == GroupState::Destroyed
                || matches!(data.load_state, LoadState::Loaded | LoadState::Loading)
            {
                return self;
            }

            let negotiated = data.source.clone().or_else(|| {
                let backend = self.inner.engine.backend();
                compatible_source(&self.inner.sources, &self.inner.formats, |f| {
                    backend.supports_format(f)
                })
            });
            let Some(source) = negotiated else {
                drop(data);
                self.on_load_failure(Error::UnsupportedSource(self.inner.sources.join(", ")));
                return self;
            };
            data.source = Some(source.clone());

            data.load_state = LoadState::Loading;
            data.load_generation += 1;
            (source, data.load_generation)
        };

        debug!("Group {} loading {}", self.inner.id, source);
        let engine = self.inner.engine.clone();
        let weak = Arc::downgrade(&self.inner);
        let spawned = spawn_task(async move {
            let outcome = engine.load_one(&source).await;
            if let Some(inner) = weak.upgrade() {
                Group { inner }.finish_load(generation, outcome);
            }
        });
        if spawned.is_none() {
            self.on_load_failure(Error::InvalidState(
                "no async runtime to load the buffer".to_string(),
            ));
        }
        self
    }

    fn finish_load(&self, generation: u64, outcome: LoadOutcome) {
        {
            let mut data = self.inner.data.lock();
            if data.state == GroupState::Destroyed
                || data.load_state != LoadState::Loading
                || data.load_generation != generation
            {
                debug!("Group {} discarding stale load of {}", self.inner.id, outcome.source);
                return;
            }
            match &outcome.result {
                Ok(buffer) => {
                    data.load_state = LoadState::Loaded;
                    data.duration = buffer.duration();
                    data.buffer = Some(Arc::clone(buffer));
                }
                Err(_) => data.load_state = LoadState::NotLoaded,
            }
        }

        match outcome.result {
            Ok(buffer) => {
                self.emit(GroupEvent::Load {
                    source: outcome.source,
                    duration: buffer.duration(),
                });
                self.inner.queue.run(AFTER_LOAD, None);
            }
            Err(e) => self.on_load_failure(e),
        }
    }

    fn on_load_failure(&self, error: Error) {
        warn!("Group {} failed to load: {}", self.inner.id, error);
        self.inner.queue.remove(AFTER_LOAD, None);
        self.inner.data.lock().load_state = LoadState::NotLoaded;
        self.emit(GroupEvent::error(&error, None));
    }

    /// Release the buffer and drop pending load-dependent actions
    pub fn unload(&self) -> &Self {
        self.inner.queue.remove(AFTER_LOAD, None);
        let source = {
            let mut data = self.inner.data.lock();
            if data.state == GroupState::Destroyed {
                return self;
            }
            data.load_state = LoadState::NotLoaded;
            data.load_generation += 1;
            data.duration = 0.0;
            data.buffer = None;
            data.source.clone()
        };
        if let Some(source) = source {
            self.inner.engine.unload(&[source]);
        }
        self.emit(GroupEvent::Unload);
        self
    }

    // ========================================
    // Playback
    // ========================================

    /// Play a new instance over the whole buffer
    ///
    /// Returns the new instance id immediately; construction waits for the
    /// buffer to load if needed.
    pub fn play(&self) -> SoundId {
        let id = SoundId::next();
        self.play_new(id, None);
        id
    }

    /// Play a new instance over the sprite region `label`
    ///
    /// Unknown labels emit a `Play` error notification and return `None`.
    pub fn play_sprite(&self, label: &str) -> Option<SoundId> {
        let Some(region) = self.inner.sprite.get(label).copied() else {
            warn!("Group {} has no sprite '{}'", self.inner.id, label);
            self.emit(GroupEvent::error(
                &Error::InvalidState(format!("unknown sprite '{}'", label)),
                None,
            ));
            return None;
        };
        let id = SoundId::next();
        self.play_new(id, Some(region));
        Some(id)
    }

    /// Play (or resume) an existing instance
    pub fn play_sound(&self, id: SoundId) -> &Self {
        if let Some(sound) = self.inner.engine.sound(id) {
            self.start(sound);
        }
        self
    }

    fn play_new(&self, id: SoundId, region: Option<SpriteRegion>) {
        let (destroyed, loaded) = {
            let data = self.inner.data.lock();
            (
                data.state == GroupState::Destroyed,
                data.load_state == LoadState::Loaded,
            )
        };
        if destroyed {
            self.emit(GroupEvent::error(
                &Error::InvalidState("group has been destroyed".to_string()),
                Some(id),
            ));
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let construct = move || {
            if let Some(inner) = weak.upgrade() {
                Group { inner }.construct_and_play(id, region);
            }
        };

        if loaded {
            construct();
        } else {
            self.inner
                .queue
                .add(AFTER_LOAD, &format!("play-{}", id), construct, true);
            self.load();
        }
    }

    fn construct_and_play(&self, id: SoundId, region: Option<SpriteRegion>) {
        let (source, buffer, options) = {
            let data = self.inner.data.lock();
            if data.state == GroupState::Destroyed {
                return;
            }
            let (Some(source), Some(buffer)) = (data.source.clone(), data.buffer.clone()) else {
                return;
            };
            let options = SoundOptions {
                id: Some(id),
                volume: data.volume,
                rate: data.rate,
                muted: data.muted,
                looping: data.looping,
                start: region.map(|r| r.start),
                end: region.map(|r| r.end),
                on_play_end: Some(self.forward(|sound| GroupEvent::PlayEnd { sound })),
                on_fade_end: Some(self.forward(|sound| GroupEvent::FadeEnd { sound: Some(sound) })),
                on_destroy: Some(self.forward(|sound| GroupEvent::Destroy { sound: Some(sound) })),
            };
            (source, buffer, options)
        };

        match self
            .inner
            .engine
            .create_sound_with(&source, buffer, Some(self.inner.id), options)
        {
            Some(sound) => self.start(sound),
            None => self.emit(GroupEvent::error(
                &Error::InvalidState(format!("could not create sound for {}", source)),
                Some(id),
            )),
        }
    }

    /// Sound callback that publishes `make(id)` on this group's bus
    fn forward(&self, make: fn(SoundId) -> GroupEvent) -> SoundCallback {
        let events = self.inner.events.clone();
        Arc::new(move |sound| events.emit_lossy(make(sound)))
    }

    fn start(&self, sound: Sound) {
        let state = self.inner.engine.state();
        match state {
            EngineState::Destroying | EngineState::Done | EngineState::NotReady => {
                self.emit(GroupEvent::error(
                    &Error::InvalidState(format!("engine is {}", state)),
                    Some(sound.id()),
                ));
            }
            EngineState::NoAudio => {
                self.emit(GroupEvent::error(&Error::NoAudioBackend, Some(sound.id())));
            }
            EngineState::Suspending | EngineState::Suspended | EngineState::Resuming => {
                debug!(
                    "Group {}: sound {} waits for the engine to resume",
                    self.inner.id,
                    sound.id()
                );
                let id = sound.id();
                let weak = Arc::downgrade(&self.inner);
                self.inner.queue.add(
                    AFTER_ENGINE_RESUME,
                    &format!("sound-{}", id),
                    move || {
                        if let Some(inner) = weak.upgrade() {
                            Group { inner }.play_and_fire(&sound);
                        }
                    },
                    true,
                );
                if state != EngineState::Resuming {
                    self.inner.engine.resume();
                }
            }
            EngineState::Ready => self.play_and_fire(&sound),
        }
    }

    fn play_and_fire(&self, sound: &Sound) {
        if sound.is_destroyed() {
            return;
        }
        sound.play();
        self.emit(GroupEvent::PlayStart { sound: sound.id() });
    }

    fn on_engine_resume(&self) {
        if self.inner.engine.state() != EngineState::Ready {
            return;
        }
        self.inner.queue.run(AFTER_ENGINE_RESUME, None);
    }

    /// Pause one instance or the whole group
    pub fn pause(&self, id: Option<SoundId>) -> &Self {
        self.remove_play_actions(id);
        if id.is_none() {
            self.fade_stop(None);
        }
        for sound in self.sounds_for(id) {
            sound.pause();
        }
        self.emit(GroupEvent::Pause { sound: id });
        self
    }

    /// Stop one instance or the whole group
    pub fn stop(&self, id: Option<SoundId>) -> &Self {
        self.remove_play_actions(id);
        if id.is_none() {
            self.fade_stop(None);
        }
        for sound in self.sounds_for(id) {
            sound.stop();
        }
        self.emit(GroupEvent::Stop { sound: id });
        self
    }

    fn remove_play_actions(&self, id: Option<SoundId>) {
        let play = id.map(|id| format!("play-{}", id));
        let sound = id.map(|id| format!("sound-{}", id));
        self.inner.queue.remove(AFTER_LOAD, play.as_deref());
        self.inner.queue.remove(AFTER_ENGINE_RESUME, sound.as_deref());
    }

    // ========================================
    // Volume, fades, rate, seek, loop
    // ========================================

    pub fn mute(&self, id: Option<SoundId>) -> &Self {
        self.set_muted(true, id)
    }

    pub fn unmute(&self, id: Option<SoundId>) -> &Self {
        self.set_muted(false, id)
    }

    fn set_muted(&self, muted: bool, id: Option<SoundId>) -> &Self {
        if id.is_none() {
            self.fade_stop(None);
        }
        for sound in self.sounds_for(id) {
            if muted {
                sound.mute();
            } else {
                sound.unmute();
            }
        }
        if id.is_none() {
            self.inner.data.lock().muted = muted;
        }
        self.emit(GroupEvent::Mute { sound: id, muted });
        self
    }

    /// Volume of one instance, or the group default
    pub fn volume(&self, id: Option<SoundId>) -> Option<f32> {
        match id {
            Some(id) => self.inner.engine.sound(id).map(|s| s.volume()),
            None => Some(self.inner.data.lock().volume),
        }
    }

    /// Set the volume; values outside 0.0-1.0 are ignored
    pub fn set_volume(&self, volume: f32, id: Option<SoundId>) -> &Self {
        if !is_valid_volume(volume) {
            debug!("Group {} ignoring volume {}", self.inner.id, volume);
            return self;
        }
        if id.is_none() {
            self.fade_stop(None);
        }
        for sound in self.sounds_for(id) {
            sound.set_volume(volume);
        }
        if id.is_none() {
            self.inner.data.lock().volume = volume;
        }
        self.emit(GroupEvent::Volume { sound: id, volume });
        self
    }

    /// Fade one instance or the whole group to `to` over `duration` seconds
    ///
    /// A group-wide fade is ignored while another group-wide fade runs. When
    /// it completes the group volume becomes `to`.
    pub fn fade(&self, to: f32, duration: f64, curve: FadeCurve, id: Option<SoundId>) -> &Self {
        if id.is_none() && self.inner.data.lock().fading {
            return self;
        }
        let Some(wait) = fade_duration(duration) else {
            warn!("Group {} ignoring fade over {}s", self.inner.id, duration);
            return self;
        };

        self.emit(GroupEvent::FadeStart { sound: id });
        for sound in self.sounds_for(id) {
            sound.fade(to, duration, curve);
        }

        if id.is_none() {
            let mut data = self.inner.data.lock();
            data.fading = true;
            data.fade_generation += 1;
            let generation = data.fade_generation;
            let weak = Arc::downgrade(&self.inner);
            data.fade_timer = spawn_task(async move {
                tokio::time::sleep(wait).await;
                complete_group_fade(weak, generation, to);
            });
            let spawned = data.fade_timer.is_some();
            drop(data);
            if !spawned {
                complete_group_fade(Arc::downgrade(&self.inner), generation, to);
            }
        }
        self
    }

    /// Cancel a fade on one instance or the whole group
    pub fn fade_stop(&self, id: Option<SoundId>) -> &Self {
        if id.is_none() {
            let mut data = self.inner.data.lock();
            if !data.fading {
                return self;
            }
            if let Some(timer) = data.fade_timer.take() {
                timer.abort();
            }
            data.fading = false;
            data.fade_generation += 1;
        }
        for sound in self.sounds_for(id) {
            sound.fade_stop();
        }
        self.emit(GroupEvent::FadeStop { sound: id });
        self
    }

    /// Whether a group-wide fade is running
    pub fn is_fading(&self) -> bool {
        self.inner.data.lock().fading
    }

    pub fn rate(&self, id: Option<SoundId>) -> Option<f64> {
        match id {
            Some(id) => self.inner.engine.sound(id).map(|s| s.rate()),
            None => Some(self.inner.data.lock().rate),
        }
    }

    /// Set the playback rate; values outside 0.5-5.0 are ignored
    pub fn set_rate(&self, rate: f64, id: Option<SoundId>) -> &Self {
        if !is_valid_rate(rate) {
            debug!("Group {} ignoring rate {}", self.inner.id, rate);
            return self;
        }
        for sound in self.sounds_for(id) {
            sound.set_rate(rate);
        }
        if id.is_none() {
            self.inner.data.lock().rate = rate;
        }
        self.emit(GroupEvent::Rate { sound: id, rate });
        self
    }

    /// Position of an instance
    pub fn seek(&self, id: SoundId) -> Option<f64> {
        self.inner.engine.sound(id).map(|s| s.seek())
    }

    /// Move an instance; deferred until the buffer is loaded
    pub fn set_seek(&self, id: SoundId, position: f64) -> &Self {
        let Some(sound) = self.inner.engine.sound(id) else {
            return self;
        };

        if !self.is_loaded() {
            let weak = Arc::downgrade(&self.inner);
            self.inner.queue.add(
                AFTER_LOAD,
                &format!("seek-{}", id),
                move || {
                    if let Some(inner) = weak.upgrade() {
                        Group { inner }.set_seek(id, position);
                    }
                },
                true,
            );
            self.load();
            return self;
        }

        if sound.seek_to(position) {
            self.emit(GroupEvent::Seek {
                sound: id,
                position,
            });
        }
        self
    }

    pub fn looping(&self, id: Option<SoundId>) -> Option<bool> {
        match id {
            Some(id) => self.inner.engine.sound(id).map(|s| s.looping()),
            None => Some(self.inner.data.lock().looping),
        }
    }

    pub fn set_loop(&self, looping: bool, id: Option<SoundId>) -> &Self {
        for sound in self.sounds_for(id) {
            sound.set_loop(looping);
        }
        if id.is_none() {
            self.inner.data.lock().looping = looping;
        }
        self
    }

    // ========================================
    // Queries
    // ========================================

    pub fn playing(&self, id: SoundId) -> Option<bool> {
        self.inner.engine.sound(id).map(|s| s.is_playing())
    }

    pub fn muted(&self, id: Option<SoundId>) -> Option<bool> {
        match id {
            Some(id) => self.inner.engine.sound(id).map(|s| s.muted()),
            None => Some(self.inner.data.lock().muted),
        }
    }

    pub fn sound_state(&self, id: SoundId) -> Option<SoundState> {
        self.inner.engine.sound(id).map(|s| s.state())
    }

    /// Region length of an instance, or the loaded buffer duration
    pub fn duration(&self, id: Option<SoundId>) -> Option<f64> {
        match id {
            Some(id) => self.inner.engine.sound(id).map(|s| s.duration()),
            None => Some(self.inner.data.lock().duration),
        }
    }

    /// Whether the instance is still in the pool
    pub fn alive(&self, id: SoundId) -> bool {
        self.inner.engine.sound(id).is_some()
    }

    pub fn sound(&self, id: SoundId) -> Option<Sound> {
        self.inner.engine.sound(id)
    }

    /// Every live instance created by this group
    pub fn sounds(&self) -> Vec<Sound> {
        self.inner.engine.sounds(Some(self.inner.id))
    }

    fn sounds_for(&self, id: Option<SoundId>) -> Vec<Sound> {
        match id {
            Some(id) => self.inner.engine.sound(id).into_iter().collect(),
            None => self.sounds(),
        }
    }

    pub fn id(&self) -> GroupId {
        self.inner.id
    }

    pub fn state(&self) -> GroupState {
        self.inner.data.lock().state
    }

    pub fn load_state(&self) -> LoadState {
        self.inner.data.lock().load_state
    }

    pub fn is_loaded(&self) -> bool {
        self.load_state() == LoadState::Loaded
    }

    /// Source chosen by format negotiation (after the first load)
    pub fn source(&self) -> Option<String> {
        self.inner.data.lock().source.clone()
    }

    pub fn sprite(&self, label: &str) -> Option<SpriteRegion> {
        self.inner.sprite.get(label).copied()
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Group-level deferred actions
    pub fn queue(&self) -> &ActionQueue {
        &self.inner.queue
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GroupEvent> {
        self.inner.events.subscribe()
    }

    // ========================================
    // Teardown
    // ========================================

    /// Stop and release every instance of the group (idempotent)
    pub fn destroy(&self) {
        if self.state() == GroupState::Destroyed {
            return;
        }
        self.stop(None);
        self.inner.queue.clear();
        let engine = &self.inner.engine;
        engine
            .queue()
            .remove(AFTER_RESUME, Some(&self.inner.resume_hook));
        engine.free(false, Some(self.inner.id));

        {
            let mut data = self.inner.data.lock();
            data.state = GroupState::Destroyed;
            data.load_generation += 1;
            data.buffer = None;
            if let Some(timer) = data.fade_timer.take() {
                timer.abort();
            }
            data.fading = false;
        }
        debug!("Group {} destroyed", self.inner.id);
        self.emit(GroupEvent::Destroy { sound: None });
    }

    fn emit(&self, event: GroupEvent) {
        self.inner.events.emit_lossy(event);
    }
}

fn complete_group_fade(weak: Weak<GroupInner>, generation: u64, to: f32) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let group = Group { inner };
    {
        let mut data = group.inner.data.lock();
        if !data.fading || data.fade_generation != generation {
            return;
        }
        data.fading = false;
        data.fade_timer = None;
    }
    group.set_volume(to, None);
    group.emit(GroupEvent::FadeEnd { sound: None });
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.inner.data.lock();
        f.debug_struct("Group")
            .field("id", &self.inner.id)
            .field("state", &data.state)
            .field("load_state", &data.load_state)
            .field("source", &data.source)
            .finish()
    }
}
