//! Link and dispatch statistics
//!
//! Atomic counters shared (via `Arc`) by the supervisor, dispatcher and
//! telemetry publisher. All components run on one loop, so the atomics only
//! exist to make the counters readable from a shutdown path or a test.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the connection and message paths
#[derive(Debug, Default)]
pub struct LinkStats {
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    link_drops: AtomicU64,
    auth_failures: AtomicU64,
    samples_published: AtomicU64,
    samples_dropped: AtomicU64,
    commands_dispatched: AtomicU64,
    commands_unmatched: AtomicU64,
    payloads_malformed: AtomicU64,
    handler_failures: AtomicU64,
}

/// Point-in-time copy of [`LinkStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub link_drops: u64,
    pub auth_failures: u64,
    pub samples_published: u64,
    pub samples_dropped: u64,
    pub commands_dispatched: u64,
    pub commands_unmatched: u64,
    pub payloads_malformed: u64,
    pub handler_failures: u64,
}

impl LinkStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_link_drop(&self) {
        self.link_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sample_published(&self) {
        self.samples_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sample_dropped(&self) {
        self.samples_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command_dispatched(&self) {
        self.commands_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command_unmatched(&self) {
        self.commands_unmatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_payload_malformed(&self) {
        self.payloads_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            link_drops: self.link_drops.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            samples_published: self.samples_published.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
            commands_dispatched: self.commands_dispatched.load(Ordering::Relaxed),
            commands_unmatched: self.commands_unmatched.load(Ordering::Relaxed),
            payloads_malformed: self.payloads_malformed.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}
