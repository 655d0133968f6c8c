// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HDDS Agent Router
//!
//! Standalone TCP message router. Agents connect, register under a
//! numeric id and exchange framed binary messages through the router,
//! which relays them verbatim and queues them while the recipient is
//! disconnected.
//!
//! # Features
//!
//! - **Reserved and dynamic agents**: fixed ids with cookies from a
//!   properties file, or ids allocated on first registration
//! - **Store and forward**: messages to a disconnected agent are delivered
//!   in order when it reconnects
//! - **Liveness**: heartbeats, disconnection broadcasts, optional eviction
//!   of forgotten dynamic agents
//! - **Hot reload**: reserved agents reloaded on an authenticated request
//!
//! # Quick Start
//!
//! ```bash
//! # Default port, no reserved agents
//! hdds-agent-router
//!
//! # Reserved agents and a config file
//! hdds-agent-router --config router.toml --reserved-agents agents.properties
//!
//! # Ask a running router to reload its reserved agents
//! hdds-agent-router reload --cookie <admin cookie> --address 127.0.0.1:33647
//! ```
//!
//! # Embedding
//!
//! ```no_run
//! use hdds_agent_router::{Router, RouterConfig};
//!
//! let mut handle = Router::start(RouterConfig::default())?;
//! println!("listening on {}", handle.local_addr());
//! handle.shutdown();
//! # Ok::<(), hdds_agent_router::RouterError>(())
//! ```

pub mod admin;
pub mod attachment;
pub mod config;
pub mod dispatch;
mod event_loop;
pub mod liveness;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod reserved;
pub mod router;

pub use attachment::Attachment;
pub use config::{ConfigError, RouterConfig, DEFAULT_PORT};
pub use dispatch::{DebugReport, DEBUG_REPORT_VERSION};
pub use metrics::{MetricsSnapshot, RouterMetrics};
pub use protocol::{
    AgentId, ErrorType, Frame, FramingError, MagicCookie, Message, MessageAssembler, MessageType,
    Registration,
};
pub use registry::{AgentRegistry, Client, ReloadSummary};
pub use reserved::ReservedAgents;
pub use router::{Router, RouterError, RouterHandle};
