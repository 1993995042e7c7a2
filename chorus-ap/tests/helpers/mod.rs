//! Test helper modules for Chorus integration tests
//!
//! - ManualBackend: backend driven step by step by the test
//! - KeyFetcher: fetcher returning the source key as its bytes
//! - settle / drain helpers for spawned continuations and notifications

#![allow(dead_code)]

pub mod manual_backend;

pub use manual_backend::{KeyFetcher, ManualBackend, PlaybackInfo, DEFAULT_DURATION};

use chorus_ap::{Engine, EngineConfig};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Let spawned continuations (loads, transitions, closes) run to completion
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Engine over `backend`, set up with default config
pub fn engine_with(backend: &ManualBackend) -> Engine {
    engine_with_config(backend, &EngineConfig::default())
}

pub fn engine_with_config(backend: &ManualBackend, config: &EngineConfig) -> Engine {
    let engine = Engine::with_fetcher(Arc::new(backend.clone()), Arc::new(KeyFetcher::new()));
    engine.setup(config);
    engine
}

/// Every notification received so far
pub fn drain<E: Clone>(rx: &mut broadcast::Receiver<E>) -> Vec<E> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

pub fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}
