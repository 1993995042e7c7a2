//! Instance pool
//!
//! Owns every live sound, grouped by source key and tagged with the group
//! that created it. Ids are unique across the whole pool.
//!
//! Eviction (`free`) is selective: by default only idle sounds (not playing,
//! not paused) are reclaimed, so background cleanup never cuts off audio.
//! Victims are destroyed after the pool lock is released.

use crate::sound::Sound;
use crate::types::{GroupId, SoundId};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

struct HeapItem {
    group: Option<GroupId>,
    sound: Sound,
}

#[derive(Default)]
struct HeapState {
    /// source key -> sound id -> item
    collections: HashMap<String, HashMap<SoundId, HeapItem>>,
    /// sound id -> source key
    index: HashMap<SoundId, String>,
}

/// Pool of live sounds
#[derive(Default)]
pub struct Heap {
    state: Mutex<HeapState>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sound under `source`, tagged with `group`
    ///
    /// Returns false (and leaves the pool unchanged) if the id is already
    /// registered under any source.
    pub fn add(&self, source: &str, group: Option<GroupId>, sound: Sound) -> bool {
        let mut state = self.state.lock();
        let id = sound.id();
        if state.index.contains_key(&id) {
            return false;
        }
        state.index.insert(id, source.to_string());
        state
            .collections
            .entry(source.to_string())
            .or_default()
            .insert(id, HeapItem { group, sound });
        true
    }

    /// Look up a sound by id
    pub fn sound(&self, id: SoundId) -> Option<Sound> {
        let state = self.state.lock();
        let source = state.index.get(&id)?;
        state
            .collections
            .get(source)
            .and_then(|items| items.get(&id))
            .map(|item| item.sound.clone())
    }

    /// All sounds, or only those created by `group` (unordered)
    pub fn sounds(&self, group: Option<GroupId>) -> Vec<Sound> {
        let state = self.state.lock();
        state
            .collections
            .values()
            .flat_map(|items| items.values())
            .filter(|item| group.is_none() || item.group == group)
            .map(|item| item.sound.clone())
            .collect()
    }

    /// Group tag of a registered sound
    pub fn group_of(&self, id: SoundId) -> Option<GroupId> {
        let state = self.state.lock();
        let source = state.index.get(&id)?;
        state.collections.get(source)?.get(&id)?.group
    }

    /// Evict sounds matching `group` (all groups when `None`)
    ///
    /// With `idle_only`, playing and paused sounds are kept. Returns the ids
    /// of the destroyed sounds.
    pub fn free(&self, idle_only: bool, group: Option<GroupId>) -> Vec<SoundId> {
        let victims: Vec<Sound> = {
            let mut state = self.state.lock();
            let mut victims = Vec::new();
            for items in state.collections.values_mut() {
                items.retain(|_, item| {
                    if group.is_some() && item.group != group {
                        return true;
                    }
                    if idle_only && (item.sound.is_playing() || item.sound.is_paused()) {
                        return true;
                    }
                    victims.push(item.sound.clone());
                    false
                });
            }
            state.collections.retain(|_, items| !items.is_empty());
            for sound in &victims {
                state.index.remove(&sound.id());
            }
            victims
        };

        if !victims.is_empty() {
            debug!(
                "Evicting {} sound(s) (idle_only={}, group={:?})",
                victims.len(),
                idle_only,
                group
            );
        }
        victims
            .into_iter()
            .map(|sound| {
                sound.destroy();
                sound.id()
            })
            .collect()
    }

    /// Destroy and forget every sound
    pub fn destroy(&self) -> Vec<SoundId> {
        let victims: Vec<Sound> = {
            let mut state = self.state.lock();
            state.index.clear();
            state
                .collections
                .drain()
                .flat_map(|(_, items)| items.into_values().map(|item| item.sound))
                .collect()
        };
        victims
            .into_iter()
            .map(|sound| {
                sound.destroy();
                sound.id()
            })
            .collect()
    }

    /// Number of registered sounds
    pub fn len(&self) -> usize {
        self.state.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Source keys that currently have sounds
    pub fn sources(&self) -> Vec<String> {
        self.state.lock().collections.keys().cloned().collect()
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Heap")
            .field("sources", &state.collections.len())
            .field("sounds", &state.index.len())
            .finish()
    }
}
