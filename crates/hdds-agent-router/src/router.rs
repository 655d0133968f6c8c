// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Router lifecycle.
//!
//! [`Router::start`] wires the registry, the dispatch pool, the event loop
//! and the liveness tasks together and returns a [`RouterHandle`]. Dropping
//! the handle shuts everything down.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ConfigError, RouterConfig};
use crate::dispatch::{DebugReport, Dispatcher, WorkerPool};
use crate::event_loop::{ConnectionSettings, EventLoop, EventLoopHandle};
use crate::liveness::LivenessManager;
use crate::metrics::RouterMetrics;
use crate::registry::AgentRegistry;

/// Listen backlog
const LISTEN_BACKLOG: i32 = 1024;

/// Router startup errors.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Router entry point.
pub struct Router;

impl Router {
    /// Start a router. Returns once the listener is bound.
    pub fn start(config: RouterConfig) -> Result<RouterHandle, RouterError> {
        config.validate()?;

        let registry = Arc::new(AgentRegistry::load(config.reserved_agents_file.clone())?);
        let metrics = Arc::new(RouterMetrics::new());
        let router_id = fastrand::u64(1..);

        let addr = config.listen_addr();
        let listener = bind(addr).map_err(|source| RouterError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let dispatcher = Arc::new(Dispatcher::new(
            router_id,
            config.heartbeat_timeout_ms,
            registry.clone(),
            metrics.clone(),
        ));
        let mut pool = WorkerPool::spawn(config.worker_threads, dispatcher.clone())?;
        let tasks = pool.sender().ok_or_else(|| io::Error::other("worker pool stopped"))?;

        let event_loop = EventLoop::spawn(
            mio::net::TcpListener::from_std(listener),
            ConnectionSettings {
                max_message_size: config.max_message_size,
                write_stall_timeout: config.write_stall_timeout(),
                tcp_nodelay: config.tcp_nodelay,
            },
            tasks.clone(),
            metrics.clone(),
        );
        let event_loop = match event_loop {
            Ok(handle) => handle,
            Err(e) => {
                drop(tasks);
                pool.shutdown();
                return Err(e.into());
            }
        };

        let liveness = LivenessManager::start(&config, registry.clone(), metrics.clone(), tasks)?;

        info!(
            "[ROUTER] router {:016x} listening on {} ({} workers, {} reserved agents)",
            router_id,
            local_addr,
            pool.threads(),
            registry.reserved_count()
        );

        Ok(RouterHandle {
            router_id,
            local_addr,
            registry,
            metrics,
            dispatcher,
            event_loop: Some(event_loop),
            liveness: Some(liveness),
            pool: Some(pool),
        })
    }
}

/// Non-blocking listener with address reuse, so a restarted router can
/// rebind while old connections linger in TIME_WAIT.
fn bind(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// A running router.
pub struct RouterHandle {
    router_id: u64,
    local_addr: SocketAddr,
    registry: Arc<AgentRegistry>,
    metrics: Arc<RouterMetrics>,
    dispatcher: Arc<Dispatcher>,
    event_loop: Option<EventLoopHandle>,
    liveness: Option<LivenessManager>,
    pool: Option<WorkerPool>,
}

impl RouterHandle {
    pub fn router_id(&self) -> u64 {
        self.router_id
    }

    /// Bound address, with the actual port when configured with port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<RouterMetrics> {
        &self.metrics
    }

    /// Same report a DEBUG request returns.
    pub fn debug_report(&self) -> DebugReport {
        self.dispatcher.debug_report()
    }

    pub fn is_running(&self) -> bool {
        self.event_loop.as_ref().is_some_and(|e| e.is_running())
    }

    /// Stop accepting, close every connection, stop the liveness tasks and
    /// drain the dispatch pool. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(mut event_loop) = self.event_loop.take() else {
            return;
        };
        info!("[ROUTER] shutting down router {:016x}", self.router_id);

        if let Err(e) = event_loop.shutdown() {
            warn!("[ROUTER] event loop: {}", e);
        }
        drop(event_loop);

        if let Some(mut liveness) = self.liveness.take() {
            liveness.stop();
        }
        if let Some(mut pool) = self.pool.take() {
            pool.shutdown();
        }

        for client in self.registry.snapshot() {
            client.disconnect();
        }
        info!("[ROUTER] stopped");
    }
}

impl Drop for RouterHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
