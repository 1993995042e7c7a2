//! Engine
//!
//! Owns the device connection, the master gain, the buffer loader, the
//! sound pool and a deferred-action queue. One engine drives one output
//! device; construct it explicitly and hand clones to the groups that use it.
//!
//! # Device states
//!
//! ```text
//! NotReady --setup--> Ready <--> Suspending --> Suspended <--> Resuming --> Ready
//!    |                  any non-terminal --terminate--> Destroying --> Done
//!    +--setup (no backend)--> NoAudio (absorbing)
//! ```
//!
//! Suspend and resume never race an in-flight transition: `suspend()` while
//! resuming is queued under `"after-resume"`, `resume()` while suspending is
//! queued under `"after-suspend"`, and `terminate()` during either queues
//! itself behind it.
//!
//! Requires a tokio runtime: device transitions, teardown and the idle
//! eviction sweep run on spawned tasks.

use crate::backend::{AudioBackend, AudioBuffer, BackendError, Destination, NodeId};
use crate::config::{is_valid_volume, EngineConfig};
use crate::error::Error;
use crate::events::{EngineEvent, EventBus};
use crate::fetch::{DefaultFetcher, SourceFetcher};
use crate::heap::Heap;
use crate::loader::{LoadOutcome, Loader};
use crate::queue::ActionQueue;
use crate::sound::{Sound, SoundOptions};
use crate::types::{EngineState, GroupId, SoundId};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Queue key released when a suspend completes
pub const AFTER_SUSPEND: &str = "after-suspend";
/// Queue key released when a resume completes
pub const AFTER_RESUME: &str = "after-resume";

/// Capacity of the engine notification channel
const ENGINE_EVENT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Suspend,
    Resume,
}

impl Transition {
    fn operation(&self) -> &'static str {
        match self {
            Transition::Suspend => "suspend",
            Transition::Resume => "resume",
        }
    }
}

struct EngineData {
    state: EngineState,
    config: EngineConfig,
    volume: f32,
    muted: bool,
    available: bool,
    master_gain: Option<NodeId>,
    loader: Option<Loader>,
    eviction_task: Option<JoinHandle<()>>,
    auto_enable_armed: bool,
}

struct EngineInner {
    backend: Arc<dyn AudioBackend>,
    fetcher: Arc<dyn SourceFetcher>,
    heap: Heap,
    queue: ActionQueue,
    events: EventBus<EngineEvent>,
    data: Mutex<EngineData>,
}

/// Handle to the audio engine (cheap to clone)
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Engine over `backend`, fetching sources with [`DefaultFetcher`]
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self::with_fetcher(backend, Arc::new(DefaultFetcher::new()))
    }

    /// Engine over `backend` with a custom byte fetcher
    pub fn with_fetcher(backend: Arc<dyn AudioBackend>, fetcher: Arc<dyn SourceFetcher>) -> Self {
        let config = EngineConfig::default();
        Self {
            inner: Arc::new(EngineInner {
                backend,
                fetcher,
                heap: Heap::new(),
                queue: ActionQueue::new(),
                events: EventBus::new(ENGINE_EVENT_CAPACITY),
                data: Mutex::new(EngineData {
                    state: EngineState::NotReady,
                    volume: config.volume,
                    muted: config.muted,
                    config,
                    available: false,
                    master_gain: None,
                    loader: None,
                    eviction_task: None,
                    auto_enable_armed: false,
                }),
            }),
        }
    }

    // ========================================
    // Lifecycle
    // ========================================

    /// Connect to the device and apply `config` (one-shot)
    ///
    /// No-op unless the engine is `NotReady`. An unavailable backend moves the
    /// engine to `NoAudio` and emits an error notification. An invalid config
    /// is logged and replaced by the defaults.
    pub fn setup(&self, config: &EngineConfig) -> &Self {
        let backend = &self.inner.backend;
        let mut data = self.inner.data.lock();
        if data.state != EngineState::NotReady {
            return self;
        }

        if !backend.is_available() {
            data.state = EngineState::NoAudio;
            drop(data);
            warn!("Audio backend unavailable; engine entering no-audio state");
            self.emit(EngineEvent::error(&Error::NoAudioBackend));
            return self;
        }

        let config = match config.validate() {
            Ok(()) => config.clone(),
            Err(e) => {
                warn!("Ignoring invalid engine config ({}); using defaults", e);
                EngineConfig::default()
            }
        };

        let master = backend.create_volume_node();
        let gain = if config.muted { 0.0 } else { config.volume };
        backend.set_gain(master, gain, backend.current_time());
        backend.connect(master, Destination::Output);

        let suspended = backend.is_suspended();
        data.available = true;
        data.volume = config.volume;
        data.muted = config.muted;
        data.master_gain = Some(master);
        data.loader = Some(Loader::new(
            Arc::clone(backend),
            Arc::clone(&self.inner.fetcher),
        ));
        data.eviction_task = self.start_eviction(config.cleanup_interval_minutes);
        data.auto_enable_armed = config.auto_enable && suspended;
        data.state = if suspended {
            EngineState::Suspended
        } else {
            EngineState::Ready
        };
        info!(
            "Engine ready: state={}, volume={:.2}, muted={}, eviction every {}min",
            data.state, config.volume, config.muted, config.cleanup_interval_minutes
        );
        data.config = config;
        self
    }

    fn start_eviction(&self, minutes: f64) -> Option<JoinHandle<()>> {
        let period = Duration::from_secs_f64(minutes * 60.0);
        let weak = Arc::downgrade(&self.inner);
        spawn_task(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                debug!("Idle eviction sweep");
                Engine { inner }.free(true, None);
            }
        })
    }

    /// Suspend the device
    ///
    /// Queued behind an in-flight resume; no-op unless `Ready`. Stops every
    /// sound before suspending.
    pub fn suspend(&self) -> &Self {
        {
            let mut data = self.inner.data.lock();
            let state = data.state;
            match state {
                EngineState::Resuming => {
                    drop(data);
                    debug!("Suspend requested while resuming; deferring");
                    self.defer(AFTER_RESUME, "suspend", |engine| {
                        engine.suspend();
                    });
                    return self;
                }
                EngineState::Ready => data.state = EngineState::Suspending,
                _ => return self,
            }
        }

        self.stop();
        let transition = self.inner.backend.suspend();
        self.run_transition(Transition::Suspend, transition);
        self
    }

    /// Resume the device
    ///
    /// Queued behind an in-flight suspend; no-op unless `Suspended`.
    pub fn resume(&self) -> &Self {
        {
            let mut data = self.inner.data.lock();
            let state = data.state;
            match state {
                EngineState::Suspending => {
                    drop(data);
                    debug!("Resume requested while suspending; deferring");
                    self.defer(AFTER_SUSPEND, "resume", |engine| {
                        engine.resume();
                    });
                    return self;
                }
                EngineState::Suspended => data.state = EngineState::Resuming,
                _ => return self,
            }
        }

        let transition = self.inner.backend.resume();
        self.run_transition(Transition::Resume, transition);
        self
    }

    fn run_transition<F>(&self, transition: Transition, future: F)
    where
        F: Future<Output = Result<(), BackendError>> + Send + 'static,
    {
        debug!("Device {} started", transition.operation());
        let weak = Arc::downgrade(&self.inner);
        let spawned = spawn_task(async move {
            let result = future.await;
            if let Some(inner) = weak.upgrade() {
                Engine { inner }.finish_transition(transition, result);
            }
        });
        if spawned.is_none() {
            self.finish_transition(
                transition,
                Err(BackendError::new("no async runtime to drive the device")),
            );
        }
    }

    fn finish_transition(&self, transition: Transition, result: Result<(), BackendError>) {
        let (in_flight, done, reverted, key) = match transition {
            Transition::Suspend => (
                EngineState::Suspending,
                EngineState::Suspended,
                EngineState::Ready,
                AFTER_SUSPEND,
            ),
            Transition::Resume => (
                EngineState::Resuming,
                EngineState::Ready,
                EngineState::Suspended,
                AFTER_RESUME,
            ),
        };

        {
            let mut data = self.inner.data.lock();
            if data.state != in_flight {
                debug!(
                    "Discarding stale {} completion (state is {})",
                    transition.operation(),
                    data.state
                );
                return;
            }
            data.state = if result.is_ok() { done } else { reverted };
            if result.is_ok() && transition == Transition::Resume {
                data.auto_enable_armed = false;
            }
        }

        self.inner.queue.run(key, None);

        match result {
            Ok(()) => {
                info!("Device {} complete", transition.operation());
                self.emit(match transition {
                    Transition::Suspend => EngineEvent::Suspend,
                    Transition::Resume => EngineEvent::Resume,
                });
            }
            Err(e) => {
                warn!("Device {} failed: {}", transition.operation(), e);
                self.emit(EngineEvent::error(&Error::DeviceTransition {
                    operation: transition.operation().to_string(),
                    reason: e.to_string(),
                }));
            }
        }
    }

    /// Tear everything down (idempotent)
    ///
    /// Queued behind an in-flight suspend/resume, replacing whatever else was
    /// waiting on it. Ends in `Done` with a `Done` notification, even if the
    /// backend fails to close.
    pub fn terminate(&self) -> &Self {
        let close = {
            let mut data = self.inner.data.lock();
            let state = data.state;
            match state {
                EngineState::Done | EngineState::Destroying | EngineState::NoAudio => {
                    return self;
                }
                EngineState::NotReady => {
                    data.state = EngineState::Destroying;
                    false
                }
                EngineState::Suspending | EngineState::Resuming => {
                    let key = if state == EngineState::Suspending {
                        AFTER_SUSPEND
                    } else {
                        AFTER_RESUME
                    };
                    drop(data);
                    debug!("Terminate requested during a transition; deferring behind {}", key);
                    self.inner.queue.remove(key, None);
                    self.defer(key, "destroy", |engine| {
                        engine.terminate();
                    });
                    return self;
                }
                EngineState::Ready | EngineState::Suspended => {
                    data.state = EngineState::Destroying;
                    data.auto_enable_armed = false;
                    true
                }
            }
        };

        info!("Engine terminating");
        if !close {
            self.cleanup(None);
            return self;
        }

        self.stop_sounds();
        let future = self.inner.backend.close();
        let weak = Arc::downgrade(&self.inner);
        let spawned = spawn_task(async move {
            let result = future.await;
            if let Some(inner) = weak.upgrade() {
                Engine { inner }.cleanup(result.err());
            }
        });
        if spawned.is_none() {
            self.cleanup(Some(BackendError::new("no async runtime to close the device")));
        }
        self
    }

    fn cleanup(&self, close_error: Option<BackendError>) {
        let (eviction, loader) = {
            let mut data = self.inner.data.lock();
            if data.state != EngineState::Destroying {
                return;
            }
            data.master_gain = None;
            (data.eviction_task.take(), data.loader.take())
        };

        if let Some(task) = eviction {
            task.abort();
        }
        let destroyed = self.inner.heap.destroy();
        if let Some(loader) = loader {
            loader.dispose();
        }
        self.inner.queue.clear();

        self.inner.data.lock().state = EngineState::Done;
        info!("Engine done ({} sound(s) released)", destroyed.len());

        if let Some(e) = close_error {
            warn!("Device close failed: {}", e);
            self.emit(EngineEvent::error(&Error::DeviceTransition {
                operation: "close".to_string(),
                reason: e.to_string(),
            }));
        }
        self.emit(EngineEvent::Done);
    }

    /// Resume a device that started suspended (auto-enable)
    ///
    /// Call on the first user interaction. Only acts once, and only when
    /// `auto_enable` was set and the device came up suspended.
    pub fn notify_user_interaction(&self) -> &Self {
        let armed = {
            let mut data = self.inner.data.lock();
            std::mem::replace(&mut data.auto_enable_armed, false)
        };
        if armed {
            debug!("User interaction; auto-enabling device");
            self.resume();
        }
        self
    }

    // ========================================
    // Buffers
    // ========================================

    /// Load (fetch + decode + cache) several sources
    pub async fn load(&self, sources: &[String]) -> Vec<LoadOutcome> {
        match self.loader() {
            Ok(loader) => loader.load(sources).await,
            Err(e) => sources
                .iter()
                .map(|source| LoadOutcome {
                    source: source.clone(),
                    result: Err(e.clone()),
                })
                .collect(),
        }
    }

    /// Load one source
    pub async fn load_one(&self, source: &str) -> LoadOutcome {
        match self.loader() {
            Ok(loader) => loader.load_one(source).await,
            Err(e) => LoadOutcome {
                source: source.to_string(),
                result: Err(e),
            },
        }
    }

    fn loader(&self) -> Result<Loader, Error> {
        let data = self.inner.data.lock();
        match (&data.loader, data.state) {
            (Some(loader), _) => Ok(loader.clone()),
            (None, EngineState::NoAudio) => Err(Error::NoAudioBackend),
            (None, state) => Err(Error::InvalidState(format!(
                "engine cannot load sources while {}",
                state
            ))),
        }
    }

    /// Release cached buffers of the given sources
    pub fn unload(&self, sources: &[String]) -> &Self {
        if let Ok(loader) = self.loader() {
            loader.unload(sources);
        }
        self
    }

    /// Release every cached buffer
    pub fn unload_all(&self) -> &Self {
        if let Ok(loader) = self.loader() {
            loader.unload_all();
        }
        self
    }

    /// Cached buffer of a source
    pub fn buffer(&self, source: &str) -> Option<Arc<AudioBuffer>> {
        self.loader().ok().and_then(|loader| loader.cached(source))
    }

    // ========================================
    // Master volume
    // ========================================

    pub fn volume(&self) -> f32 {
        self.inner.data.lock().volume
    }

    /// Set the master volume; values outside 0.0-1.0 are ignored
    pub fn set_volume(&self, volume: f32) -> &Self {
        if !is_valid_volume(volume) {
            debug!("Ignoring out-of-range master volume {}", volume);
            return self;
        }
        {
            let mut data = self.inner.data.lock();
            if let Some(master) = data.master_gain {
                let gain = if data.muted { 0.0 } else { volume };
                let backend = &self.inner.backend;
                backend.set_gain(master, gain, backend.current_time());
            }
            data.volume = volume;
        }
        self.emit(EngineEvent::Volume { volume });
        self
    }

    pub fn muted(&self) -> bool {
        self.inner.data.lock().muted
    }

    pub fn mute(&self) -> &Self {
        self.set_muted(true)
    }

    pub fn unmute(&self) -> &Self {
        self.set_muted(false)
    }

    fn set_muted(&self, muted: bool) -> &Self {
        {
            let mut data = self.inner.data.lock();
            if data.muted == muted {
                return self;
            }
            if let Some(master) = data.master_gain {
                let gain = if muted { 0.0 } else { data.volume };
                let backend = &self.inner.backend;
                backend.set_gain(master, gain, backend.current_time());
            }
            data.muted = muted;
        }
        self.emit(EngineEvent::Mute { muted });
        self
    }

    // ========================================
    // Sounds
    // ========================================

    /// Stop every sound
    pub fn stop(&self) -> &Self {
        self.stop_sounds();
        self.emit(EngineEvent::Stop);
        self
    }

    /// Pause every playing sound
    pub fn pause(&self) -> &Self {
        for sound in self.inner.heap.sounds(None) {
            sound.pause();
        }
        self.emit(EngineEvent::Pause);
        self
    }

    fn stop_sounds(&self) {
        for sound in self.inner.heap.sounds(None) {
            sound.stop();
        }
    }

    /// Look up a live sound by id
    pub fn sound(&self, id: SoundId) -> Option<Sound> {
        self.inner.heap.sound(id)
    }

    /// Create a sound over the cached buffer of `source`
    ///
    /// Returns `None` if the source is not loaded; otherwise behaves like
    /// [`Engine::create_sound_with`].
    pub fn create_sound(
        &self,
        source: &str,
        group: Option<GroupId>,
        options: SoundOptions,
    ) -> Option<Sound> {
        let Some(loader) = self.inner.data.lock().loader.clone() else {
            warn!("Cannot create a sound for {}: engine not set up", source);
            return None;
        };
        let Some(buffer) = loader.cached(source) else {
            warn!("Cannot create a sound for {}: not loaded", source);
            return None;
        };
        self.create_sound_with(source, buffer, group, options)
    }

    /// Create a sound over a buffer the caller already holds
    ///
    /// The sound is registered in the pool under `source` and `group`, and
    /// its gain is connected to the master gain. Unloading `source` from the
    /// cache does not affect callers holding the buffer. Returns `None` if
    /// the engine is not running or the id is taken.
    pub fn create_sound_with(
        &self,
        source: &str,
        buffer: Arc<AudioBuffer>,
        group: Option<GroupId>,
        options: SoundOptions,
    ) -> Option<Sound> {
        let master = {
            let data = self.inner.data.lock();
            match data.master_gain {
                Some(master) if !data.state.is_shutting_down() => master,
                _ => {
                    warn!("Cannot create a sound while the engine is {}", data.state);
                    return None;
                }
            }
        };

        if let Some(id) = options.id {
            if self.inner.heap.sound(id).is_some() {
                warn!("Sound id {} is already registered", id);
                return None;
            }
        }

        let sound = Sound::new(Arc::clone(&self.inner.backend), buffer, options);
        if !self.inner.heap.add(source, group, sound.clone()) {
            warn!("Sound id {} is already registered", sound.id());
            sound.destroy();
            return None;
        }
        self.inner
            .backend
            .connect(sound.gain_node(), Destination::Node(master));

        debug!("Sound {} added for {} (group {:?})", sound.id(), source, group);
        self.emit(EngineEvent::Add {
            sound: sound.id(),
            group,
        });
        Some(sound)
    }

    /// All sounds, or those of one group
    pub fn sounds(&self, group: Option<GroupId>) -> Vec<Sound> {
        self.inner.heap.sounds(group)
    }

    /// Evict sounds from the pool
    ///
    /// With `idle_only`, playing and paused sounds survive.
    pub fn free(&self, idle_only: bool, group: Option<GroupId>) -> &Self {
        for id in self.inner.heap.free(idle_only, group) {
            self.emit(EngineEvent::Remove { sound: id });
        }
        self
    }

    // ========================================
    // Accessors
    // ========================================

    pub fn state(&self) -> EngineState {
        self.inner.data.lock().state
    }

    /// Whether `setup` found a usable backend
    pub fn is_audio_available(&self) -> bool {
        self.inner.data.lock().available
    }

    /// Configuration applied by `setup`
    pub fn config(&self) -> EngineConfig {
        self.inner.data.lock().config.clone()
    }

    /// Master gain node (after setup)
    pub fn master_gain(&self) -> Option<NodeId> {
        self.inner.data.lock().master_gain
    }

    pub fn backend(&self) -> &Arc<dyn AudioBackend> {
        &self.inner.backend
    }

    /// Engine-level deferred actions (`"after-suspend"`, `"after-resume"`)
    pub fn queue(&self) -> &ActionQueue {
        &self.inner.queue
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Weak handle that does not keep the engine alive
    pub fn downgrade(&self) -> WeakEngine {
        WeakEngine {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn defer(&self, key: &str, id: &str, action: fn(&Engine)) {
        let weak = self.downgrade();
        self.inner.queue.add(
            key,
            id,
            move || {
                if let Some(engine) = weak.upgrade() {
                    action(&engine);
                }
            },
            true,
        );
    }

    fn emit(&self, event: EngineEvent) {
        debug!("Engine event: {}", event.name());
        self.inner.events.emit_lossy(event);
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.inner.data.lock();
        f.debug_struct("Engine")
            .field("state", &data.state)
            .field("volume", &data.volume)
            .field("muted", &data.muted)
            .field("sounds", &self.inner.heap.len())
            .finish()
    }
}

/// Non-owning engine handle
#[derive(Clone)]
pub struct WeakEngine {
    inner: Weak<EngineInner>,
}

impl WeakEngine {
    pub fn upgrade(&self) -> Option<Engine> {
        self.inner.upgrade().map(|inner| Engine { inner })
    }
}

/// Spawn on the current tokio runtime, if there is one
pub(crate) fn spawn_task<F>(future: F) -> Option<JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => Some(runtime.spawn(future)),
        Err(_) => {
            warn!("No tokio runtime available; task not started");
            None
        }
    }
}
