//! Hand-driven audio backend for deterministic tests
//!
//! - The clock only moves when the test calls `advance()`.
//! - Decodes, suspends and resumes complete immediately unless gated, in
//!   which case they wait until the test releases them.
//! - Playbacks never end on their own; `finish()` fires the ended callback.
//!
//! "Encoded bytes" are the UTF-8 source key (see [`KeyFetcher`]). Keys
//! starting with `corrupt` fail to decode; durations default to 10s and can
//! be overridden per key.

use chorus_ap::backend::{
    AudioBackend, AudioBuffer, BackendError, Destination, EndedCallback, NodeId, PlaybackId,
};
use chorus_ap::fetch::SourceFetcher;
use chorus_ap::{Error, FadeCurve};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

pub const DEFAULT_DURATION: f64 = 10.0;

/// Snapshot of one playback as the core configured it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackInfo {
    pub output: NodeId,
    pub started: bool,
    pub start_time: f64,
    pub offset: f64,
    pub duration: Option<f64>,
    pub rate: f64,
    pub looping: bool,
}

#[derive(Debug, Clone, Copy)]
struct Ramp {
    from: f32,
    to: f32,
    start: f64,
    end: f64,
}

struct ManualPlayback {
    info: PlaybackInfo,
    ended: Option<EndedCallback>,
}

#[derive(Default)]
struct State {
    now: f64,
    suspended: bool,
    closed: bool,
    next_handle: u64,
    gains: HashMap<NodeId, f32>,
    ramps: HashMap<NodeId, Ramp>,
    destinations: HashMap<NodeId, Destination>,
    playbacks: HashMap<PlaybackId, ManualPlayback>,
    durations: HashMap<String, f64>,
    gate_decodes: bool,
    pending_decodes: Vec<oneshot::Sender<()>>,
    gate_transitions: bool,
    pending_transitions: Vec<(&'static str, oneshot::Sender<Result<(), BackendError>>)>,
    fail_close: bool,
}

impl State {
    fn gain_at(&self, node: NodeId, now: f64) -> f32 {
        match self.ramps.get(&node) {
            Some(ramp) => {
                let span = ramp.end - ramp.start;
                let progress = if span <= 0.0 {
                    1.0
                } else {
                    ((now - ramp.start) / span).clamp(0.0, 1.0) as f32
                };
                ramp.from + (ramp.to - ramp.from) * progress
            }
            None => self.gains.get(&node).copied().unwrap_or(0.0),
        }
    }
}

struct Shared {
    available: bool,
    decode_calls: AtomicUsize,
    state: Mutex<State>,
}

/// Backend whose every asynchronous step is driven by the test
#[derive(Clone)]
pub struct ManualBackend {
    shared: Arc<Shared>,
}

impl ManualBackend {
    pub fn new() -> Self {
        Self::build(true, false)
    }

    pub fn unavailable() -> Self {
        Self::build(false, false)
    }

    pub fn starting_suspended() -> Self {
        Self::build(true, true)
    }

    fn build(available: bool, suspended: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                available,
                decode_calls: AtomicUsize::new(0),
                state: Mutex::new(State {
                    suspended,
                    ..Default::default()
                }),
            }),
        }
    }

    /// Hold decodes until `release_decodes()`
    pub fn gate_decodes(&self) -> &Self {
        self.shared.state.lock().gate_decodes = true;
        self
    }

    /// Hold suspend/resume/close until `complete_transition()`
    pub fn gate_transitions(&self) -> &Self {
        self.shared.state.lock().gate_transitions = true;
        self
    }

    /// Make `close()` report a failure
    pub fn fail_close(&self) -> &Self {
        self.shared.state.lock().fail_close = true;
        self
    }

    pub fn set_duration(&self, source: &str, seconds: f64) -> &Self {
        self.shared
            .state
            .lock()
            .durations
            .insert(source.to_string(), seconds);
        self
    }

    pub fn advance(&self, seconds: f64) {
        self.shared.state.lock().now += seconds;
    }

    pub fn decode_calls(&self) -> usize {
        self.shared.decode_calls.load(Ordering::SeqCst)
    }

    pub fn pending_decodes(&self) -> usize {
        self.shared.state.lock().pending_decodes.len()
    }

    /// Let every held decode proceed
    pub fn release_decodes(&self) {
        let pending = std::mem::take(&mut self.shared.state.lock().pending_decodes);
        for gate in pending {
            let _ = gate.send(());
        }
    }

    /// Operations ("suspend", "resume", "close") waiting to complete
    pub fn pending_transitions(&self) -> Vec<&'static str> {
        self.shared
            .state
            .lock()
            .pending_transitions
            .iter()
            .map(|(op, _)| *op)
            .collect()
    }

    /// Complete the oldest held transition with `result`
    pub fn complete_transition(&self, result: Result<(), BackendError>) -> Option<&'static str> {
        let next = {
            let mut state = self.shared.state.lock();
            if state.pending_transitions.is_empty() {
                None
            } else {
                Some(state.pending_transitions.remove(0))
            }
        };
        next.map(|(op, tx)| {
            let _ = tx.send(result);
            op
        })
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn gain_value(&self, node: NodeId) -> f32 {
        self.gain(node)
    }

    pub fn destination(&self, node: NodeId) -> Option<Destination> {
        self.shared.state.lock().destinations.get(&node).copied()
    }

    pub fn playback(&self, playback: PlaybackId) -> Option<PlaybackInfo> {
        self.shared
            .state
            .lock()
            .playbacks
            .get(&playback)
            .map(|p| p.info)
    }

    /// Started playbacks feeding `node`
    pub fn playbacks_into(&self, node: NodeId) -> Vec<PlaybackInfo> {
        self.shared
            .state
            .lock()
            .playbacks
            .values()
            .filter(|p| p.info.started && p.info.output == node)
            .map(|p| p.info)
            .collect()
    }

    pub fn active_playbacks(&self) -> usize {
        self.shared
            .state
            .lock()
            .playbacks
            .values()
            .filter(|p| p.info.started)
            .count()
    }

    /// Fire the ended callback of a playback, as a device would at its end
    pub fn finish(&self, playback: PlaybackId) -> bool {
        let callback = self
            .shared
            .state
            .lock()
            .playbacks
            .remove(&playback)
            .and_then(|mut p| p.ended.take());
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    fn transition(
        &self,
        operation: &'static str,
        apply: fn(&mut State),
    ) -> BoxFuture<'static, Result<(), BackendError>> {
        let shared = Arc::clone(&self.shared);
        let gate = {
            let mut state = shared.state.lock();
            if state.gate_transitions {
                let (tx, rx) = oneshot::channel();
                state.pending_transitions.push((operation, tx));
                Some(rx)
            } else {
                None
            }
        };
        async move {
            let result = match gate {
                Some(rx) => rx
                    .await
                    .unwrap_or_else(|_| Err(BackendError::new("transition abandoned"))),
                None => Ok(()),
            };
            if result.is_ok() {
                apply(&mut shared.state.lock());
            }
            result
        }
        .boxed()
    }
}

impl Default for ManualBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for ManualBackend {
    fn is_available(&self) -> bool {
        self.shared.available
    }

    fn is_suspended(&self) -> bool {
        self.shared.state.lock().suspended
    }

    fn supports_format(&self, format: &str) -> bool {
        matches!(format, "wav" | "mp3" | "ogg")
    }

    fn current_time(&self) -> f64 {
        self.shared.state.lock().now
    }

    fn decode(&self, bytes: Vec<u8>) -> BoxFuture<'static, Result<AudioBuffer, BackendError>> {
        self.shared.decode_calls.fetch_add(1, Ordering::SeqCst);
        let key = String::from_utf8_lossy(&bytes).into_owned();
        let (gate, duration) = {
            let mut state = self.shared.state.lock();
            let duration = state.durations.get(&key).copied().unwrap_or(DEFAULT_DURATION);
            let gate = if state.gate_decodes {
                let (tx, rx) = oneshot::channel();
                state.pending_decodes.push(tx);
                Some(rx)
            } else {
                None
            };
            (gate, duration)
        };
        async move {
            if let Some(rx) = gate {
                let _ = rx.await;
            }
            if key.starts_with("corrupt") {
                return Err(BackendError::new(format!("cannot decode {}", key)));
            }
            Ok(AudioBuffer::new(duration, 44100, 2))
        }
        .boxed()
    }

    fn create_volume_node(&self) -> NodeId {
        let mut state = self.shared.state.lock();
        state.next_handle += 1;
        let node = NodeId(state.next_handle);
        state.gains.insert(node, 1.0);
        node
    }

    fn connect(&self, node: NodeId, destination: Destination) {
        self.shared
            .state
            .lock()
            .destinations
            .insert(node, destination);
    }

    fn disconnect(&self, node: NodeId) {
        self.shared.state.lock().destinations.remove(&node);
    }

    fn set_gain(&self, node: NodeId, value: f32, _at_time: f64) {
        let mut state = self.shared.state.lock();
        state.ramps.remove(&node);
        state.gains.insert(node, value);
    }

    fn gain(&self, node: NodeId) -> f32 {
        let state = self.shared.state.lock();
        state.gain_at(node, state.now)
    }

    fn schedule_ramp(&self, node: NodeId, target: f32, end_time: f64, _curve: FadeCurve) {
        let mut state = self.shared.state.lock();
        let now = state.now;
        let from = state.gain_at(node, now);
        state.ramps.insert(
            node,
            Ramp {
                from,
                to: target,
                start: now,
                end: end_time,
            },
        );
    }

    fn cancel_scheduled_ramp(&self, node: NodeId, at_time: f64) {
        let mut state = self.shared.state.lock();
        let held = state.gain_at(node, at_time);
        state.ramps.remove(&node);
        state.gains.insert(node, held);
    }

    fn create_playback(&self, _buffer: &Arc<AudioBuffer>, output: NodeId) -> PlaybackId {
        let mut state = self.shared.state.lock();
        state.next_handle += 1;
        let id = PlaybackId(state.next_handle);
        state.playbacks.insert(
            id,
            ManualPlayback {
                info: PlaybackInfo {
                    output,
                    started: false,
                    start_time: 0.0,
                    offset: 0.0,
                    duration: None,
                    rate: 1.0,
                    looping: false,
                },
                ended: None,
            },
        );
        id
    }

    fn start(&self, playback: PlaybackId, at_time: f64, offset: f64, duration: Option<f64>) {
        if let Some(p) = self.shared.state.lock().playbacks.get_mut(&playback) {
            p.info.started = true;
            p.info.start_time = at_time;
            p.info.offset = offset;
            p.info.duration = duration;
        }
    }

    fn stop(&self, playback: PlaybackId) {
        self.shared.state.lock().playbacks.remove(&playback);
    }

    fn on_ended(&self, playback: PlaybackId, callback: EndedCallback) {
        if let Some(p) = self.shared.state.lock().playbacks.get_mut(&playback) {
            p.ended = Some(callback);
        }
    }

    fn set_rate(&self, playback: PlaybackId, rate: f64, _at_time: f64) {
        if let Some(p) = self.shared.state.lock().playbacks.get_mut(&playback) {
            p.info.rate = rate;
        }
    }

    fn set_loop_region(&self, playback: PlaybackId, _start: f64, _end: f64, enabled: bool) {
        if let Some(p) = self.shared.state.lock().playbacks.get_mut(&playback) {
            p.info.looping = enabled;
        }
    }

    fn suspend(&self) -> BoxFuture<'static, Result<(), BackendError>> {
        self.transition("suspend", |state| state.suspended = true)
    }

    fn resume(&self) -> BoxFuture<'static, Result<(), BackendError>> {
        self.transition("resume", |state| state.suspended = false)
    }

    fn close(&self) -> BoxFuture<'static, Result<(), BackendError>> {
        let fail = self.shared.state.lock().fail_close;
        let inner = self.transition("close", |state| {
            state.playbacks.clear();
            state.closed = true;
        });
        async move {
            inner.await?;
            if fail {
                return Err(BackendError::new("device refused to close"));
            }
            Ok(())
        }
        .boxed()
    }
}

/// Fetcher whose bytes are the source key itself
///
/// Keys starting with `missing` fail to fetch.
#[derive(Default)]
pub struct KeyFetcher {
    calls: AtomicUsize,
}

impl KeyFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SourceFetcher for KeyFetcher {
    fn fetch(&self, source: &str) -> BoxFuture<'static, chorus_ap::Result<Vec<u8>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let source = source.to_string();
        async move {
            if source.starts_with("missing") {
                return Err(Error::Fetch {
                    uri: source,
                    reason: "not found".to_string(),
                });
            }
            Ok(source.into_bytes())
        }
        .boxed()
    }
}
