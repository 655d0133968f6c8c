// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Router wire protocol.
//!
//! Every message travels in a fixed envelope:
//!
//! ```text
//! +-------------+----------------+---------+--------------+-------------+----------------+---------+
//! | length (4B) | version (4B)   | type 1B | msg id (8B)  | sender (8B) | recipient (8B) | payload |
//! +-------------+----------------+---------+--------------+-------------+----------------+---------+
//! ```
//!
//! All integers are big-endian. `length` covers the whole envelope, header
//! included. An agent id of `0` on the wire means "no agent".

use std::fmt;
use std::num::NonZeroU64;
use std::str::FromStr;

use subtle::ConstantTimeEq;
use thiserror::Error;

pub mod assembler;
pub mod message;

pub use assembler::MessageAssembler;
pub use message::{
    ErrorType, Frame, FramingError, Message, MessageType, Registration, PREFIX_SIZE,
};

// ============================================================================
// Constants
// ============================================================================

/// Protocol version carried in every envelope.
pub const PROTOCOL_VERSION: u32 = 2;

/// Envelope header size: length + version + type + message id + sender + recipient.
pub const HEADER_SIZE: usize = 4 + 4 + 1 + 8 + 8 + 8;

/// First dynamically assigned agent id. Everything below is reserved.
pub const MIN_DYNAMIC_AGENT_ID: u64 = 4096;

/// Size of a magic cookie on the wire.
pub const COOKIE_SIZE: usize = 64;

/// Default maximum envelope size (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

// ============================================================================
// AgentId
// ============================================================================

/// Identifier of an agent connected through the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId(NonZeroU64);

impl AgentId {
    /// Build an id from its wire value. `0` is not an agent.
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// Raw numeric value.
    pub fn get(self) -> u64 {
        self.0.get()
    }

    /// Reserved ids are provisioned from the reserved-agent file.
    pub fn is_reserved(self) -> bool {
        self.get() < MIN_DYNAMIC_AGENT_ID
    }

    /// Wire encoding of an optional id.
    pub fn to_wire(id: Option<AgentId>) -> u64 {
        id.map_or(0, AgentId::get)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AgentId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw: u64 = s
            .trim()
            .parse()
            .map_err(|e| format!("invalid agent id {:?}: {}", s, e))?;
        AgentId::new(raw).ok_or_else(|| "agent id 0 is not valid".to_string())
    }
}

// ============================================================================
// MagicCookie
// ============================================================================

/// Errors building a [`MagicCookie`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CookieError {
    #[error("magic cookie is empty")]
    Empty,

    #[error("magic cookie is {0} bytes, at most {max} allowed", max = COOKIE_SIZE)]
    TooLong(usize),

    #[error("magic cookie must be exactly {size} bytes, got {0}", size = COOKIE_SIZE)]
    InvalidLength(usize),
}

/// Shared secret authenticating a reserved agent or the administrator.
///
/// Comparison is constant time and the formatted form only shows a prefix.
#[derive(Clone)]
pub struct MagicCookie([u8; COOKIE_SIZE]);

impl MagicCookie {
    /// Cookie from its exact wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CookieError> {
        let raw: [u8; COOKIE_SIZE] = bytes
            .try_into()
            .map_err(|_| CookieError::InvalidLength(bytes.len()))?;
        Ok(Self(raw))
    }

    /// Cookie from a textual value, zero padded to [`COOKIE_SIZE`].
    pub fn from_text(text: &str) -> Result<Self, CookieError> {
        let bytes = text.as_bytes();
        if bytes.is_empty() {
            return Err(CookieError::Empty);
        }
        if bytes.len() > COOKIE_SIZE {
            return Err(CookieError::TooLong(bytes.len()));
        }
        let mut raw = [0u8; COOKIE_SIZE];
        raw[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(raw))
    }

    /// Wire bytes.
    pub fn as_bytes(&self) -> &[u8; COOKIE_SIZE] {
        &self.0
    }

    /// Constant-time comparison.
    pub fn matches(&self, other: &MagicCookie) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl PartialEq for MagicCookie {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other)
    }
}

impl Eq for MagicCookie {}

impl fmt::Debug for MagicCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MagicCookie({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl FromStr for MagicCookie {
    type Err = CookieError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_text(s)
    }
}
