// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One logical agent across its successive connections.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

use crate::attachment::Attachment;
use crate::protocol::{AgentId, MagicCookie};

/// Delivery failures.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("agent {0} is not connected")]
    NotConnected(AgentId),

    #[error("tunnel to agent {agent} is broken: {source}")]
    Broken {
        agent: AgentId,
        #[source]
        source: io::Error,
    },

    #[error("agent {0} is no longer registered")]
    Retired(AgentId),
}

/// Outcome of a cacheable send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the current connection
    Sent,
    /// Stored until the agent reconnects
    Queued,
}

#[derive(Default)]
struct ClientState {
    /// Current connection, `None` while disconnected
    attachment: Option<Arc<Attachment>>,

    /// Encoded envelopes waiting for a reconnection
    pending: VecDeque<Vec<u8>>,

    /// Removed from the registry, refuses new connections
    retired: bool,
}

/// A registered agent.
pub struct Client {
    agent_id: AgentId,
    cookie: MagicCookie,
    state: Mutex<ClientState>,

    /// Reference point for `last_seen_ms`
    epoch: Instant,

    /// Milliseconds since `epoch` of the last inbound byte
    last_seen_ms: AtomicU64,
}

impl Client {
    pub fn new(agent_id: AgentId, cookie: MagicCookie) -> Self {
        Self {
            agent_id,
            cookie,
            state: Mutex::new(ClientState::default()),
            epoch: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        }
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn cookie(&self) -> &MagicCookie {
        &self.cookie
    }

    pub fn is_reserved(&self) -> bool {
        self.agent_id.is_reserved()
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    /// Mark the agent as seen now. Lock free.
    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    pub fn touch_at(&self, when: Instant) {
        let ms = when.saturating_duration_since(self.epoch).as_millis() as u64;
        self.last_seen_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed))
    }

    /// Time since the agent was last seen, as of `now`.
    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen())
    }

    // ========================================================================
    // Connection state
    // ========================================================================

    pub fn is_connected(&self) -> bool {
        self.state.lock().attachment.is_some()
    }

    pub fn attachment(&self) -> Option<Arc<Attachment>> {
        self.state.lock().attachment.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_retired(&self) -> bool {
        self.state.lock().retired
    }

    /// Make `attachment` the current connection.
    ///
    /// Under the client lock: any previous connection is disconnected, the
    /// registration `reply` is written, then pending envelopes are flushed
    /// in FIFO order. Nothing else can reach the new connection before the
    /// reply.
    pub fn attach(
        self: &Arc<Self>,
        attachment: Arc<Attachment>,
        reply: &[u8],
    ) -> Result<(), SendError> {
        let mut state = self.state.lock();
        if state.retired {
            return Err(SendError::Retired(self.agent_id));
        }

        if let Some(previous) = state.attachment.take() {
            if previous.id() != attachment.id() {
                debug!(
                    "[CLIENT] agent {} replaces connection {} with {}",
                    self.agent_id,
                    previous.id(),
                    attachment.id()
                );
                previous.disconnect();
            }
        }

        if attachment.is_disconnected() {
            return Err(SendError::NotConnected(self.agent_id));
        }

        self.touch();
        attachment
            .send(reply)
            .map_err(|source| self.broken(&attachment, source))?;

        while let Some(envelope) = state.pending.front() {
            if let Err(source) = attachment.send(envelope) {
                return Err(self.broken(&attachment, source));
            }
            state.pending.pop_front();
        }

        state.attachment = Some(attachment);
        Ok(())
    }

    /// Send on the current connection, without caching.
    pub fn send_message(&self, envelope: &[u8]) -> Result<(), SendError> {
        let mut state = self.state.lock();
        let attachment = state
            .attachment
            .clone()
            .ok_or(SendError::NotConnected(self.agent_id))?;

        attachment.send(envelope).map_err(|source| {
            state.attachment = None;
            self.broken(&attachment, source)
        })
    }

    /// Send, queuing the envelope if the agent is disconnected or the
    /// tunnel breaks. Never drops the envelope.
    pub fn send_message_or_cache(&self, envelope: Vec<u8>) -> Delivery {
        let mut state = self.state.lock();
        if let Some(attachment) = state.attachment.clone() {
            match attachment.send(&envelope) {
                Ok(()) => return Delivery::Sent,
                Err(source) => {
                    state.attachment = None;
                    let err = self.broken(&attachment, source);
                    debug!("[CLIENT] {}, queuing", err);
                }
            }
        }
        state.pending.push_back(envelope);
        Delivery::Queued
    }

    /// Request semantics: queue while disconnected, fail if the current
    /// tunnel breaks.
    pub fn send_request(&self, envelope: Vec<u8>) -> Result<Delivery, SendError> {
        let mut state = self.state.lock();
        match state.attachment.clone() {
            None => {
                state.pending.push_back(envelope);
                Ok(Delivery::Queued)
            }
            Some(attachment) => match attachment.send(&envelope) {
                Ok(()) => Ok(Delivery::Sent),
                Err(source) => {
                    state.attachment = None;
                    Err(self.broken(&attachment, source))
                }
            },
        }
    }

    /// Forget the connection if it is still `attachment_id`.
    ///
    /// Returns `true` when the client went from connected to disconnected.
    pub fn discard_attachment(&self, attachment_id: u64) -> bool {
        let mut state = self.state.lock();
        match &state.attachment {
            Some(current) if current.id() == attachment_id => {
                state.attachment = None;
                true
            }
            _ => false,
        }
    }

    /// Drop the current connection. Returns `true` if there was one.
    pub fn disconnect(&self) -> bool {
        let attachment = self.state.lock().attachment.take();
        match attachment {
            Some(attachment) => {
                attachment.disconnect();
                true
            }
            None => false,
        }
    }

    /// Disconnect and refuse any later connection. Returns the pending
    /// envelopes.
    pub(crate) fn retire(&self) -> VecDeque<Vec<u8>> {
        let mut state = self.state.lock();
        state.retired = true;
        if let Some(attachment) = state.attachment.take() {
            attachment.disconnect();
        }
        std::mem::take(&mut state.pending)
    }

    /// Retire the client if it has been disconnected for at least `timeout`.
    pub(crate) fn retire_if_stale(&self, timeout: Duration, now: Instant) -> bool {
        let mut state = self.state.lock();
        if state.retired || state.attachment.is_some() || self.silence(now) < timeout {
            return false;
        }
        state.retired = true;
        state.pending.clear();
        true
    }

    /// Seed pending envelopes carried over from a replaced record.
    pub(crate) fn inherit_pending(&self, pending: VecDeque<Vec<u8>>) {
        let mut state = self.state.lock();
        state.pending.extend(pending);
    }

    fn broken(&self, attachment: &Attachment, source: io::Error) -> SendError {
        trace!(
            "[CLIENT] send to agent {} on connection {} failed: {}",
            self.agent_id,
            attachment.id(),
            source
        );
        attachment.disconnect();
        SendError::Broken {
            agent: self.agent_id,
            source,
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("agent_id", &self.agent_id)
            .field("reserved", &self.is_reserved())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
