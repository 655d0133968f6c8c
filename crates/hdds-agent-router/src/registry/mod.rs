// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Agent registry.
//!
//! Maps agent ids to [`Client`] records behind one coarse lock. Forwarding
//! only reads the map; registration, reload and eviction are rare enough
//! for the coarse lock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::ConfigError;
use crate::protocol::{AgentId, MagicCookie, MIN_DYNAMIC_AGENT_ID};
use crate::reserved::ReservedAgents;

mod client;

pub use client::{Client, Delivery, SendError};

/// What a reload changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    /// Newly listed reserved agents
    pub added: usize,
    /// Reserved agents whose cookie changed
    pub updated: usize,
    /// Reserved agents no longer listed
    pub removed: usize,
    /// Reserved agents left as they were
    pub unchanged: usize,
}

/// Registry of every known agent.
#[derive(Debug)]
pub struct AgentRegistry {
    /// Agents indexed by id
    clients: Mutex<HashMap<AgentId, Arc<Client>>>,

    /// Next dynamic id
    next_dynamic_id: AtomicU64,

    /// Cookie authorizing reloads, `None` without a reserved-agent file
    admin_cookie: RwLock<Option<MagicCookie>>,

    /// Source of reserved agents
    reserved_file: Option<PathBuf>,
}

impl AgentRegistry {
    /// Empty registry reloading from `reserved_file`.
    pub fn new(reserved_file: Option<PathBuf>) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_dynamic_id: AtomicU64::new(MIN_DYNAMIC_AGENT_ID),
            admin_cookie: RwLock::new(None),
            reserved_file,
        }
    }

    /// Registry populated from `reserved_file`, if any.
    pub fn load(reserved_file: Option<PathBuf>) -> Result<Self, ConfigError> {
        let registry = Self::new(reserved_file);
        if registry.reserved_file.is_some() {
            registry.reload()?;
        }
        Ok(registry)
    }

    pub fn get(&self, agent: AgentId) -> Option<Arc<Client>> {
        self.clients.lock().get(&agent).cloned()
    }

    /// Insert `client`, returning the record it replaced.
    pub fn add(&self, client: Arc<Client>) -> Option<Arc<Client>> {
        self.clients.lock().insert(client.agent_id(), client)
    }

    /// Remove `client` if it is still the record held for its id.
    pub fn remove(&self, client: &Arc<Client>) -> bool {
        let mut clients = self.clients.lock();
        match clients.get(&client.agent_id()) {
            Some(current) if Arc::ptr_eq(current, client) => {
                clients.remove(&client.agent_id());
                true
            }
            _ => false,
        }
    }

    /// Allocate a fresh dynamic id.
    pub fn next_dynamic_id(&self) -> AgentId {
        loop {
            let raw = self.next_dynamic_id.fetch_add(1, Ordering::Relaxed);
            if let Some(id) = AgentId::new(raw) {
                return id;
            }
        }
    }

    /// Current clients, for iteration without holding the lock.
    pub fn snapshot(&self) -> Vec<Arc<Client>> {
        self.clients.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.snapshot().iter().filter(|c| c.is_connected()).count()
    }

    pub fn reserved_count(&self) -> usize {
        self.clients
            .lock()
            .keys()
            .filter(|id| id.is_reserved())
            .count()
    }

    pub fn admin_cookie(&self) -> Option<MagicCookie> {
        self.admin_cookie.read().clone()
    }

    /// Re-read the reserved-agent file and apply it.
    ///
    /// The file is parsed completely before anything changes; a bad file
    /// leaves the registry untouched.
    pub fn reload(&self) -> Result<ReloadSummary, ConfigError> {
        let path = self
            .reserved_file
            .as_ref()
            .ok_or(ConfigError::NoReservedFile)?;
        let reserved = ReservedAgents::from_file(path)?;
        let summary = self.apply_reserved(&reserved);
        info!(
            "[REGISTRY] reloaded {}: {} added, {} updated, {} removed, {} unchanged",
            path.display(),
            summary.added,
            summary.updated,
            summary.removed,
            summary.unchanged
        );
        Ok(summary)
    }

    /// Apply a parsed reserved-agent set. Dynamic agents are left alone.
    pub fn apply_reserved(&self, reserved: &ReservedAgents) -> ReloadSummary {
        let mut summary = ReloadSummary::default();
        let mut clients = self.clients.lock();

        let stale: Vec<AgentId> = clients
            .keys()
            .filter(|id| id.is_reserved() && reserved.get(**id).is_none())
            .copied()
            .collect();
        for agent in stale {
            if let Some(client) = clients.remove(&agent) {
                client.retire();
                debug!("[REGISTRY] reserved agent {} removed", agent);
                summary.removed += 1;
            }
        }

        for (agent, cookie) in reserved.agents() {
            match clients.get(&agent) {
                Some(existing) if existing.cookie().matches(cookie) => {
                    summary.unchanged += 1;
                }
                Some(existing) => {
                    let pending = existing.retire();
                    let replacement = Arc::new(Client::new(agent, cookie.clone()));
                    replacement.inherit_pending(pending);
                    clients.insert(agent, replacement);
                    debug!("[REGISTRY] reserved agent {} cookie changed", agent);
                    summary.updated += 1;
                }
                None => {
                    clients.insert(agent, Arc::new(Client::new(agent, cookie.clone())));
                    summary.added += 1;
                }
            }
        }

        *self.admin_cookie.write() = Some(reserved.admin_cookie().clone());
        summary
    }

    /// Remove dynamic agents disconnected for at least `timeout`.
    ///
    /// Reserved agents are never evicted.
    pub fn evict_stale(&self, timeout: Duration, now: Instant) -> Vec<AgentId> {
        let mut evicted = Vec::new();
        self.clients.lock().retain(|agent, client| {
            if agent.is_reserved() || !client.retire_if_stale(timeout, now) {
                return true;
            }
            evicted.push(*agent);
            false
        });
        evicted
    }
}
