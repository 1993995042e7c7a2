//! Deferred action queue
//!
//! Keyed registry of closures waiting for a precondition ("after-load",
//! "after-resume", ...). The owner of the precondition calls [`ActionQueue::run`]
//! when it is satisfied.
//!
//! Actions are invoked with no internal lock held, so an action may freely
//! add, run or remove queue entries (including its own).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Deferred closure
pub type Action = Arc<dyn Fn() + Send + Sync + 'static>;

struct QueuedAction {
    id: String,
    action: Action,
    remove_after_run: bool,
    /// Registration token; a re-registration of the same id gets a new one
    token: u64,
}

/// Event name -> registered actions, in registration order
#[derive(Default)]
pub struct ActionQueue {
    events: Mutex<HashMap<String, Vec<QueuedAction>>>,
    next_token: AtomicU64,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `action` under `event`/`id`
    ///
    /// An existing registration with the same id is overwritten in place
    /// (keeping its position). With `remove_after_run` set the action runs
    /// once; otherwise it stays registered and runs on every trigger.
    pub fn add<F>(&self, event: &str, id: &str, action: F, remove_after_run: bool)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let entry = QueuedAction {
            id: id.to_string(),
            action: Arc::new(action),
            remove_after_run,
            token,
        };

        let mut events = self.events.lock();
        let actions = events.entry(event.to_string()).or_default();
        match actions.iter_mut().find(|a| a.id == id) {
            Some(existing) => *existing = entry,
            None => actions.push(entry),
        }
        debug!("Queued action {}/{} (one-shot: {})", event, id, remove_after_run);
    }

    /// Run the action `id` under `event`, or every action under `event`
    ///
    /// Unknown events and ids are ignored. A batch run executes the ids that
    /// were registered when it started, in registration order, skipping any
    /// removed by an earlier action of the same batch.
    pub fn run(&self, event: &str, id: Option<&str>) {
        let ids: Vec<String> = {
            let events = self.events.lock();
            let Some(actions) = events.get(event) else {
                return;
            };
            match id {
                Some(id) => actions
                    .iter()
                    .filter(|a| a.id == id)
                    .map(|a| a.id.clone())
                    .collect(),
                None => actions.iter().map(|a| a.id.clone()).collect(),
            }
        };

        if !ids.is_empty() {
            debug!("Running {} queued action(s) for {}", ids.len(), event);
        }
        for id in ids {
            self.run_one(event, &id);
        }
    }

    fn run_one(&self, event: &str, id: &str) {
        let (action, token, remove_after_run) = {
            let events = self.events.lock();
            let Some(queued) = events
                .get(event)
                .and_then(|actions| actions.iter().find(|a| a.id == id))
            else {
                return;
            };
            (
                Arc::clone(&queued.action),
                queued.token,
                queued.remove_after_run,
            )
        };

        action();

        if remove_after_run {
            let mut events = self.events.lock();
            if let Some(actions) = events.get_mut(event) {
                // A re-registration made by the action itself has a new token
                actions.retain(|a| !(a.id == id && a.token == token));
                if actions.is_empty() {
                    events.remove(event);
                }
            }
        }
    }

    /// Remove one action, or every action under `event` when `id` is `None`
    pub fn remove(&self, event: &str, id: Option<&str>) {
        let mut events = self.events.lock();
        match id {
            None => {
                events.remove(event);
            }
            Some(id) => {
                if let Some(actions) = events.get_mut(event) {
                    actions.retain(|a| a.id != id);
                    if actions.is_empty() {
                        events.remove(event);
                    }
                }
            }
        }
    }

    /// Drop every registration
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn has_event(&self, event: &str) -> bool {
        self.events.lock().contains_key(event)
    }

    pub fn has_action(&self, event: &str, id: &str) -> bool {
        self.events
            .lock()
            .get(event)
            .map(|actions| actions.iter().any(|a| a.id == id))
            .unwrap_or(false)
    }

    /// Number of registered actions across all events
    pub fn len(&self) -> usize {
        self.events.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ActionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let events = self.events.lock();
        let mut map = f.debug_map();
        for (event, actions) in events.iter() {
            let ids: Vec<&str> = actions.iter().map(|a| a.id.as_str()).collect();
            map.entry(event, &ids);
        }
        map.finish()
    }
}
