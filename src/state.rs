//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket connection.
//!
//! ## Key Rust Concepts (IMPORTANT for beginners):
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Allows multiple parts of the program to safely share ownership of data
//! - **Why needed**: Every connection's session task needs the same registry, collaborators and counters
//! - **Memory safety**: Automatically cleans up data when the last reference is dropped
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Allows multiple readers OR one writer at a time (but not both)
//! - **Why needed**: The metrics endpoint reads counters while session tasks update them
//! - **Poisoning**: a panicking writer "poisons" a std lock; we recover the inner
//!   value instead of propagating the panic, since counters are always valid
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: Multiple ownership (many handlers can hold a reference)
//! - **RwLock**: Thread-safe read/write access
//! - **T**: The actual data type being protected

use crate::config::AppConfig;
use crate::voice::session::SessionRuntime;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// The main application state that's shared across all HTTP request handlers.
///
/// ## Rust Concepts:
/// - **#[derive(Clone)]**: Cloning only bumps reference counts, so actix can hand a copy to each worker
/// - **Instant**: A point in time (for measuring uptime)
#[derive(Clone)]
pub struct AppState {
    /// Configuration, fixed after startup
    pub config: Arc<AppConfig>,

    /// Everything a session task needs: collaborators, registry, limits, counters
    pub runtime: SessionRuntime,

    /// When the server started (never changes, so no lock needed)
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: AppConfig, runtime: SessionRuntime) -> Self {
        Self {
            config: Arc::new(config),
            runtime,
            start_time: Instant::now(),
        }
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    pub fn get_metrics_snapshot(&self) -> VoiceMetrics {
        self.runtime.metrics.snapshot()
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Counters collected across all voice sessions since server start.
///
/// ## Why these metrics matter:
/// - **sessions_started / sessions_ended**: churn, and leaks if they drift apart
/// - **transcription_failures**: STT health as users experience it
/// - **safety_escalations**: how often the safety script replaced a reply
/// - **barge_ins**: how often users interrupt (replies too long?)
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct VoiceMetrics {
    pub sessions_started: u64,
    pub sessions_ended: u64,
    pub utterances: u64,
    pub transcription_failures: u64,
    pub safety_escalations: u64,
    pub barge_ins: u64,
}

/// Cloneable handle to the shared [`VoiceMetrics`].
///
/// ## Rust Concepts:
/// - **Closures as update functions**: `record(|m| m.barge_ins += 1)` keeps the
///   lock scope to exactly one statement
/// - **PoisonError::into_inner**: take the data even if another thread panicked while holding the lock
#[derive(Debug, Clone, Default)]
pub struct MetricsHandle {
    inner: Arc<RwLock<VoiceMetrics>>,
}

impl MetricsHandle {
    pub fn record(&self, update: impl FnOnce(&mut VoiceMetrics)) {
        let mut metrics = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut metrics);
    }

    /// Copy of the current counters, so no lock is held while serializing.
    pub fn snapshot(&self) -> VoiceMetrics {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
impl AppState {
    /// State wired to the scripted collaborators, for handler tests.
    pub fn for_tests(doubles: &crate::providers::testing::TestDoubles) -> Self {
        use crate::voice::pipeline::UtterancePipeline;
        use crate::voice::registry::SessionRegistry;

        let config = AppConfig::default();
        let runtime = SessionRuntime {
            pipeline: Arc::new(UtterancePipeline::new(doubles.services(), config.pipeline.clone())),
            registry: Arc::new(SessionRegistry::new(config.session.max_concurrent_sessions)),
            config: config.session.clone(),
            metrics: MetricsHandle::default(),
            demo_mode: true,
        };
        Self::new(config, runtime)
    }
}
