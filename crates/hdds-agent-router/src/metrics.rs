// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Router metrics.
//!
//! Lock-free counters shared by the event loop, the workers and the
//! liveness tasks:
//! - Connection statistics (accepted, active, closed)
//! - Inbound frames and bytes
//! - Forwarding and queuing
//! - Registration, heartbeat and eviction activity
//! - Error counts
//!
//! # Example
//!
//! ```
//! use hdds_agent_router::RouterMetrics;
//!
//! let metrics = RouterMetrics::new();
//! metrics.record_connection_accepted();
//! metrics.record_bytes_received(128);
//! metrics.record_frame_received();
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.connections_accepted, 1);
//! assert_eq!(snapshot.bytes_received, 128);
//! assert_eq!(snapshot.active_connections, 1);
//! ```

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Counters for one router instance.
#[derive(Debug)]
pub struct RouterMetrics {
    // Connection metrics
    active_connections: AtomicUsize,
    connections_accepted: AtomicU64,
    connections_closed: AtomicU64,

    // Inbound traffic
    frames_received: AtomicU64,
    bytes_received: AtomicU64,

    // Routing
    messages_forwarded: AtomicU64,
    messages_queued: AtomicU64,
    delivery_errors: AtomicU64,

    // Dispatch
    busy_workers: AtomicUsize,

    // Errors
    framing_errors: AtomicU64,
    send_stalls: AtomicU64,

    // Registration
    registrations: AtomicU64,
    registration_failures: AtomicU64,

    // Liveness
    heartbeats_sent: AtomicU64,
    heartbeat_disconnections: AtomicU64,
    evictions: AtomicU64,

    // Administration
    reloads: AtomicU64,

    /// When metrics collection started
    start_time: Instant,
}

impl Default for RouterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self {
            active_connections: AtomicUsize::new(0),
            connections_accepted: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_forwarded: AtomicU64::new(0),
            messages_queued: AtomicU64::new(0),
            delivery_errors: AtomicU64::new(0),
            busy_workers: AtomicUsize::new(0),
            framing_errors: AtomicU64::new(0),
            send_stalls: AtomicU64::new(0),
            registrations: AtomicU64::new(0),
            registration_failures: AtomicU64::new(0),
            heartbeats_sent: AtomicU64::new(0),
            heartbeat_disconnections: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            reloads: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    // ========================================================================
    // Connections
    // ========================================================================

    pub fn record_connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Traffic
    // ========================================================================

    pub fn record_bytes_received(&self, bytes: usize) {
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a complete inbound frame.
    pub fn record_frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self) {
        self.messages_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queued(&self) {
        self.messages_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery_error(&self) {
        self.delivery_errors.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    pub fn record_task_started(&self) {
        self.busy_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_finished(&self) {
        self.busy_workers.fetch_sub(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Errors
    // ========================================================================

    pub fn record_framing_error(&self) {
        self.framing_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// A write found the socket buffer full.
    pub fn record_send_stall(&self) {
        self.send_stalls.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Registration, liveness, administration
    // ========================================================================

    pub fn record_registration(&self) {
        self.registrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_registration_failure(&self) {
        self.registration_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat_sent(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat_disconnection(&self) {
        self.heartbeat_disconnections
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_reload(&self) {
        self.reloads.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Getters
    // ========================================================================

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Workers currently running a task.
    pub fn busy_workers(&self) -> usize {
        self.busy_workers.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_forwarded: self.messages_forwarded.load(Ordering::Relaxed),
            messages_queued: self.messages_queued.load(Ordering::Relaxed),
            delivery_errors: self.delivery_errors.load(Ordering::Relaxed),
            busy_workers: self.busy_workers.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            send_stalls: self.send_stalls.load(Ordering::Relaxed),
            registrations: self.registrations.load(Ordering::Relaxed),
            registration_failures: self.registration_failures.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            heartbeat_disconnections: self.heartbeat_disconnections.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            reloads: self.reloads.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`RouterMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub active_connections: usize,
    pub connections_accepted: u64,
    pub connections_closed: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub messages_forwarded: u64,
    pub messages_queued: u64,
    pub delivery_errors: u64,
    pub busy_workers: usize,
    pub framing_errors: u64,
    pub send_stalls: u64,
    pub registrations: u64,
    pub registration_failures: u64,
    pub heartbeats_sent: u64,
    pub heartbeat_disconnections: u64,
    pub evictions: u64,
    pub reloads: u64,
}
