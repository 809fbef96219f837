//! # Application State Management
//!
//! State shared by every HTTP handler and every call actor.
//!
//! ## Shared Data:
//! - **config**: `Arc<RwLock<AppConfig>>`, readable by many handlers at once and
//!   replaced wholesale by `PUT /api/v1/config`
//! - **metrics**: request counters, the active call count and relay totals
//! - **start_time**: fixed at startup, used for uptime
//!
//! Each call takes a snapshot of the configuration when it starts, so a config
//! update never changes the behavior of a call already in progress.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! Cloning an `AppState` clones the `Arc`s, not the data. Every worker thread
//! and every call actor holds a handle to the same config and counters.
//!
//! ### RwLock (Reader-Writer Lock)
//! Many readers or one writer at a time. Handlers mostly read the config;
//! counters are written on every request.
//!
//! Locks are held only for the duration of a counter update or a clone. A
//! poisoned lock still holds consistent counters, so it is recovered rather
//! than propagated.

use crate::config::AppConfig;
use crate::relay::session::SessionStats;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// Application state handed to every handler through `web::Data`.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Current configuration, updatable at runtime
    pub config: Arc<RwLock<AppConfig>>,

    /// Counters updated by the middleware and the call actors
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected since startup.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// HTTP requests processed
    pub request_count: u64,

    /// HTTP requests that ended in a 4xx or 5xx
    pub error_count: u64,

    /// Calls currently bridged
    pub active_sessions: u32,

    /// Totals over every finished call
    pub relay: RelayTotals,

    /// Per-endpoint statistics, keyed by `"METHOD /path"`
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Aggregated [`SessionStats`] of finished calls.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct RelayTotals {
    pub completed_sessions: u64,
    pub rejected_sessions: u64,
    pub uplink_chunks: u64,
    pub downlink_chunks: u64,
    pub dropped_chunks: u64,
    pub malformed_frames: u64,
    pub interruptions: u64,
}

/// Statistics for one endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    /// Summed handling time in milliseconds
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    fn metrics_read(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics_write(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current configuration.
    ///
    /// Cloning releases the read lock immediately.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the configuration if the new one validates.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn increment_request_count(&self) {
        self.metrics_write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_write().error_count += 1;
    }

    /// Record one request against `endpoint` (e.g. `"GET /health"`).
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Reserve a slot for a new call.
    ///
    /// Returns `false`, and counts a rejection, when `limit` calls are already
    /// active. The check and the increment happen under one lock so two
    /// simultaneous upgrades cannot both take the last slot.
    ///
    /// ## Rust Concepts:
    /// - **Write guard**: `metrics` stays locked until it goes out of scope at
    ///   the end of the function
    /// - **as usize**: the counter is `u32`, the configured limit is `usize`
    pub fn try_acquire_session(&self, limit: usize) -> bool {
        let mut metrics = self.metrics_write();
        if metrics.active_sessions as usize >= limit {
            metrics.relay.rejected_sessions += 1;
            return false;
        }
        metrics.active_sessions += 1;
        true
    }

    /// Release a call slot. Never underflows.
    pub fn decrement_active_sessions(&self) {
        let mut metrics = self.metrics_write();
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    /// Fold the counters of a finished call into the totals.
    pub fn record_session(&self, stats: &SessionStats) {
        let mut metrics = self.metrics_write();
        let totals = &mut metrics.relay;
        totals.completed_sessions += 1;
        totals.uplink_chunks += stats.uplink_chunks;
        totals.downlink_chunks += stats.downlink_chunks;
        totals.dropped_chunks += stats.dropped_chunks;
        totals.malformed_frames += stats.malformed_frames;
        totals.interruptions += stats.interruptions;
    }

    /// Calls currently holding a slot.
    pub fn active_sessions(&self) -> u32 {
        self.metrics_read().active_sessions
    }

    /// Consistent copy of all counters, taken under one read lock.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, between 0.0 and 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_slots_respect_limit() {
        let state = AppState::new(AppConfig::default());

        assert!(state.try_acquire_session(2));
        assert!(state.try_acquire_session(2));
        assert!(!state.try_acquire_session(2));
        assert_eq!(state.active_sessions(), 2);

        state.decrement_active_sessions();
        assert!(state.try_acquire_session(2));
        assert_eq!(state.get_metrics_snapshot().relay.rejected_sessions, 1);
    }

    #[test]
    fn test_decrement_never_underflows() {
        let state = AppState::new(AppConfig::default());
        state.decrement_active_sessions();
        assert_eq!(state.active_sessions(), 0);
    }

    #[test]
    fn test_record_session_accumulates() {
        let state = AppState::new(AppConfig::default());
        let stats = SessionStats {
            uplink_chunks: 10,
            downlink_chunks: 4,
            dropped_chunks: 1,
            interruptions: 1,
            ..SessionStats::default()
        };
        state.record_session(&stats);
        state.record_session(&stats);

        let totals = state.get_metrics_snapshot().relay;
        assert_eq!(totals.completed_sessions, 2);
        assert_eq!(totals.uplink_chunks, 20);
        assert_eq!(totals.downlink_chunks, 8);
        assert_eq!(totals.interruptions, 2);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = AppState::new(AppConfig::default());
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }

    #[test]
    fn test_rejected_config_update_keeps_old_config() {
        let state = AppState::new(AppConfig::default());
        let mut bad = AppConfig::default();
        bad.performance.max_concurrent_sessions = 0;

        assert!(state.update_config(bad).is_err());
        assert_eq!(state.get_config().performance.max_concurrent_sessions, 10);
    }
}
