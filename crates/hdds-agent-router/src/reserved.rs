// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reserved-agent file.
//!
//! A properties file mapping reserved agent ids to their cookie, plus the
//! administrator cookie:
//!
//! ```text
//! # admin cookie, mandatory
//! configuration = s3cr3t
//! 10 = agent-ten-cookie
//! 20 : agent-twenty-cookie
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use crate::config::ConfigError;
use crate::protocol::{AgentId, MagicCookie, MIN_DYNAMIC_AGENT_ID};

/// Key holding the administrator cookie.
pub const ADMIN_COOKIE_KEY: &str = "configuration";

/// Parsed reserved-agent file.
#[derive(Debug, Clone)]
pub struct ReservedAgents {
    admin_cookie: MagicCookie,
    agents: BTreeMap<AgentId, MagicCookie>,
}

impl ReservedAgents {
    /// Read and parse a reserved-agent file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse the properties content. Any error rejects the whole file.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut admin_cookie = None;
        let mut agents = BTreeMap::new();

        for (idx, raw) in content.lines().enumerate() {
            let line = idx + 1;
            let entry = raw.trim();
            if entry.is_empty() || entry.starts_with('#') || entry.starts_with('!') {
                continue;
            }

            let (key, value) = entry
                .split_once(['=', ':'])
                .map(|(k, v)| (k.trim(), v.trim()))
                .ok_or_else(|| reserved_error(line, "expected `key = value`"))?;

            let cookie = MagicCookie::from_text(value)
                .map_err(|e| reserved_error(line, &format!("cookie for {:?}: {}", key, e)))?;

            if key == ADMIN_COOKIE_KEY {
                if admin_cookie.replace(cookie).is_some() {
                    return Err(reserved_error(line, "duplicate `configuration` key"));
                }
                continue;
            }

            let agent: AgentId = key.parse().map_err(|e: String| reserved_error(line, &e))?;
            if !agent.is_reserved() {
                return Err(reserved_error(
                    line,
                    &format!(
                        "agent id {} outside the reserved range 1..{}",
                        agent, MIN_DYNAMIC_AGENT_ID
                    ),
                ));
            }
            if agents.insert(agent, cookie).is_some() {
                return Err(reserved_error(line, &format!("duplicate agent id {}", agent)));
            }
        }

        let admin_cookie = admin_cookie.ok_or_else(|| ConfigError::Reserved {
            line: 0,
            reason: format!("missing mandatory `{}` key", ADMIN_COOKIE_KEY),
        })?;

        Ok(Self {
            admin_cookie,
            agents,
        })
    }

    pub fn admin_cookie(&self) -> &MagicCookie {
        &self.admin_cookie
    }

    /// Reserved agents in ascending id order.
    pub fn agents(&self) -> impl Iterator<Item = (AgentId, &MagicCookie)> {
        self.agents.iter().map(|(id, cookie)| (*id, cookie))
    }

    pub fn get(&self, agent: AgentId) -> Option<&MagicCookie> {
        self.agents.get(&agent)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

fn reserved_error(line: usize, reason: &str) -> ConfigError {
    ConfigError::Reserved {
        line,
        reason: reason.to_string(),
    }
}
