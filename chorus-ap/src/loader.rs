//! Buffer loader and cache
//!
//! Fetches raw bytes through a [`SourceFetcher`], decodes them through the
//! [`AudioBackend`] and caches the decoded buffer per source key.
//!
//! Concurrent loads of a source that is not cached yet are coalesced: the
//! first request starts one fetch+decode, later requests join it, and every
//! waiter receives a clone of the single result (success or failure).
//!
//! `unload` while a decode is in flight does not cancel it. Waiters still get
//! the result, but it is not stored in the cache.

use crate::backend::{AudioBackend, AudioBuffer};
use crate::error::{Error, Result};
use crate::fetch::SourceFetcher;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

type SharedDecode = Shared<BoxFuture<'static, Result<Arc<AudioBuffer>>>>;

/// Result of loading one source
#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub source: String,
    pub result: Result<Arc<AudioBuffer>>,
}

impl LoadOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn buffer(&self) -> Option<&Arc<AudioBuffer>> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&Error> {
        self.result.as_ref().err()
    }
}

struct InFlight {
    token: u64,
    decode: SharedDecode,
}

#[derive(Default)]
struct LoaderState {
    cache: HashMap<String, Arc<AudioBuffer>>,
    in_flight: HashMap<String, InFlight>,
    next_token: u64,
    disposed: bool,
}

/// Decoded buffer cache with per-source decode coalescing
#[derive(Clone)]
pub struct Loader {
    backend: Arc<dyn AudioBackend>,
    fetcher: Arc<dyn SourceFetcher>,
    state: Arc<Mutex<LoaderState>>,
}

impl Loader {
    pub fn new(backend: Arc<dyn AudioBackend>, fetcher: Arc<dyn SourceFetcher>) -> Self {
        Self {
            backend,
            fetcher,
            state: Arc::new(Mutex::new(LoaderState::default())),
        }
    }

    /// Load several sources concurrently; outcomes are in input order
    pub async fn load(&self, sources: &[String]) -> Vec<LoadOutcome> {
        join_all(sources.iter().map(|s| self.load_one(s))).await
    }

    /// Load one source, joining an in-flight decode of the same key
    pub async fn load_one(&self, source: &str) -> LoadOutcome {
        let (token, decode) = {
            let mut state = self.state.lock();
            if state.disposed {
                return LoadOutcome {
                    source: source.to_string(),
                    result: Err(Error::InvalidState("loader has been disposed".to_string())),
                };
            }
            if let Some(buffer) = state.cache.get(source) {
                return LoadOutcome {
                    source: source.to_string(),
                    result: Ok(Arc::clone(buffer)),
                };
            }
            match state.in_flight.get(source) {
                Some(pending) => {
                    debug!("Joining in-flight decode of {}", source);
                    (pending.token, pending.decode.clone())
                }
                None => {
                    state.next_token += 1;
                    let token = state.next_token;
                    let decode = self.start_decode(source);
                    state.in_flight.insert(
                        source.to_string(),
                        InFlight {
                            token,
                            decode: decode.clone(),
                        },
                    );
                    (token, decode)
                }
            }
        };

        let result = decode.await;

        {
            let mut state = self.state.lock();
            let current = state
                .in_flight
                .get(source)
                .map(|p| p.token == token)
                .unwrap_or(false);
            if current {
                state.in_flight.remove(source);
                if let (Ok(buffer), false) = (&result, state.disposed) {
                    state.cache.insert(source.to_string(), Arc::clone(buffer));
                    debug!("Cached buffer for {} ({:.3}s)", source, buffer.duration());
                }
            }
        }

        if let Err(e) = &result {
            warn!("Load of {} failed: {}", source, e);
        }
        LoadOutcome {
            source: source.to_string(),
            result,
        }
    }

    fn start_decode(&self, source: &str) -> SharedDecode {
        let backend = Arc::clone(&self.backend);
        let fetch = self.fetcher.fetch(source);
        let uri = source.to_string();
        async move {
            let bytes = fetch.await?;
            debug!("Decoding {} ({} bytes)", uri, bytes.len());
            let buffer = backend.decode(bytes).await.map_err(|e| Error::Decode {
                uri: uri.clone(),
                reason: e.to_string(),
            })?;
            Ok(Arc::new(buffer))
        }
        .boxed()
        .shared()
    }

    /// Cached buffer of a source, if loaded
    pub fn cached(&self, source: &str) -> Option<Arc<AudioBuffer>> {
        self.state.lock().cache.get(source).cloned()
    }

    pub fn is_loading(&self, source: &str) -> bool {
        self.state.lock().in_flight.contains_key(source)
    }

    /// Release cached buffers of the given sources
    ///
    /// In-flight decodes of these sources are detached from the cache.
    pub fn unload(&self, sources: &[String]) {
        let mut state = self.state.lock();
        for source in sources {
            state.cache.remove(source);
            state.in_flight.remove(source);
        }
    }

    /// Release every cached buffer
    pub fn unload_all(&self) {
        let mut state = self.state.lock();
        state.cache.clear();
        state.in_flight.clear();
    }

    /// Release everything and refuse further loads (idempotent)
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        state.cache.clear();
        state.in_flight.clear();
        state.disposed = true;
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Number of cached buffers
    pub fn cached_count(&self) -> usize {
        self.state.lock().cache.len()
    }
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Loader")
            .field("cached", &state.cache.len())
            .field("in_flight", &state.in_flight.len())
            .field("disposed", &state.disposed)
            .finish()
    }
}
