// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Network event loop.
//!
//! One thread owns the listener and the readable side of every connection,
//! multiplexed with mio. It accepts connections, assembles envelopes and
//! hands each complete frame to the dispatch pool. It never takes a client
//! lock and never writes to a socket.
//!
//! ```text
//! +--------------------------------------------------+
//! |                    EventLoop                     |
//! |  +--------------------------------------------+  |
//! |  |                mio::Poll                   |  |
//! |  |  - listener (accept)                       |  |
//! |  |  - agent streams (read)                    |  |
//! |  |  - waker (shutdown)                        |  |
//! |  +--------------------------------------------+  |
//! |          |                       |               |
//! |          v                       v               |
//! |   +-------------+      +--------------------+    |
//! |   |   Accept    |      | MessageAssembler   |    |
//! |   | Attachment  |      |   -> Task::Process |    |
//! |   +-------------+      +--------------------+    |
//! +--------------------------------------------------+
//! ```

use std::collections::HashMap;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::SockRef;
use tracing::{debug, error, info, trace, warn};

use crate::attachment::Attachment;
use crate::dispatch::{Task, TaskSender};
use crate::metrics::RouterMetrics;
use crate::protocol::MessageAssembler;

// ============================================================================
// Constants
// ============================================================================

/// Token for the TCP listener
const LISTENER_TOKEN: Token = Token(0);

/// Token for the shutdown waker
const WAKER_TOKEN: Token = Token(1);

/// Starting token for connections
const CONNECTION_TOKEN_START: usize = 2;

/// Poll timeout, bounds the reaction time to the running flag
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Maximum events to process per poll
const MAX_EVENTS: usize = 128;

/// Read buffer size
const READ_BUFFER_SIZE: usize = 64 * 1024;

// ============================================================================
// Handle
// ============================================================================

/// Settings applied to accepted connections.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionSettings {
    pub max_message_size: usize,
    pub write_stall_timeout: Duration,
    pub tcp_nodelay: bool,
}

/// Handle on the running event loop thread.
pub(crate) struct EventLoopHandle {
    waker: Arc<Waker>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl EventLoopHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop the loop and wait for it to close every connection.
    pub fn shutdown(&mut self) -> io::Result<()> {
        self.running.store(false, Ordering::Relaxed);
        let _ = self.waker.wake();

        if let Some(handle) = self.thread_handle.take() {
            handle
                .join()
                .map_err(|_| io::Error::other("event loop thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for EventLoopHandle {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

// ============================================================================
// Event loop
// ============================================================================

/// Per-connection state owned by the loop.
struct IoConnection {
    stream: TcpStream,
    assembler: MessageAssembler,
    attachment: Arc<Attachment>,
}

pub(crate) struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    connections: HashMap<Token, IoConnection>,
    next_token: usize,
    settings: ConnectionSettings,
    tasks: TaskSender,
    metrics: Arc<RouterMetrics>,
    running: Arc<AtomicBool>,
    read_buf: Vec<u8>,
}

impl EventLoop {
    /// Spawn the loop on `listener`.
    pub fn spawn(
        mut listener: TcpListener,
        settings: ConnectionSettings,
        tasks: TaskSender,
        metrics: Arc<RouterMetrics>,
    ) -> io::Result<EventLoopHandle> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let running = Arc::new(AtomicBool::new(true));

        let event_loop = Self {
            poll,
            listener,
            connections: HashMap::new(),
            next_token: CONNECTION_TOKEN_START,
            settings,
            tasks,
            metrics,
            running: running.clone(),
            read_buf: vec![0u8; READ_BUFFER_SIZE],
        };

        let thread_handle = thread::Builder::new()
            .name("hdds-router-io".to_string())
            .spawn(move || event_loop.run())?;

        Ok(EventLoopHandle {
            waker,
            running,
            thread_handle: Some(thread_handle),
        })
    }

    fn run(mut self) {
        if let Ok(addr) = self.listener.local_addr() {
            debug!("[EVENT-LOOP] listening on {}", addr);
        }

        let mut events = Events::with_capacity(MAX_EVENTS);

        while self.running.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    error!("[EVENT-LOOP] poll error: {}", e);
                }
                continue;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.handle_accept(),
                    WAKER_TOKEN => {}
                    token => {
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            self.handle_readable(token);
                        }
                    }
                }
            }
        }

        // Cleanup
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close(token, "router shutdown");
        }
        let _ = self.poll.registry().deregister(&mut self.listener);
        debug!("[EVENT-LOOP] stopped");
    }

    fn handle_accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, remote_addr)) => {
                    if let Err(e) = self.register(stream, remote_addr) {
                        warn!("[EVENT-LOOP] dropping connection from {}: {}", remote_addr, e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("[EVENT-LOOP] accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn register(&mut self, mut stream: TcpStream, remote_addr: SocketAddr) -> io::Result<()> {
        let token = Token(self.next_token);
        self.next_token += 1;

        if self.settings.tcp_nodelay {
            stream.set_nodelay(true)?;
        }
        let writer: std::net::TcpStream = SockRef::from(&stream).try_clone()?.into();

        self.poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)?;

        let attachment = Arc::new(Attachment::new(
            token.0 as u64,
            remote_addr,
            writer,
            self.settings.write_stall_timeout,
            self.metrics.clone(),
        ));

        self.metrics.record_connection_accepted();
        info!(
            "[EVENT-LOOP] connection {} accepted from {}",
            attachment.id(),
            remote_addr
        );

        self.connections.insert(
            token,
            IoConnection {
                stream,
                assembler: MessageAssembler::new(self.settings.max_message_size),
                attachment,
            },
        );
        Ok(())
    }

    fn handle_readable(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };

        let reason = loop {
            match conn.stream.read(&mut self.read_buf) {
                Ok(0) => break Some("end of stream".to_string()),
                Ok(n) => {
                    self.metrics.record_bytes_received(n);
                    if let Some(client) = conn.attachment.client() {
                        client.touch();
                    }

                    let mut frames = Vec::new();
                    let result = conn.assembler.push_into(&self.read_buf[..n], &mut frames);
                    for frame in frames {
                        self.metrics.record_frame_received();
                        trace!(
                            "[EVENT-LOOP] frame type {} ({} bytes) on connection {}",
                            frame.raw_type(),
                            frame.len(),
                            conn.attachment.id()
                        );
                        self.tasks.submit(Task::Process {
                            frame,
                            attachment: conn.attachment.clone(),
                        });
                    }
                    if let Err(e) = result {
                        self.metrics.record_framing_error();
                        break Some(format!("framing error: {}", e));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break None,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => break Some(format!("read error: {}", e)),
            }
        };

        if let Some(reason) = reason {
            self.close(token, &reason);
        }
    }

    fn close(&mut self, token: Token, reason: &str) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };

        let _ = self.poll.registry().deregister(&mut conn.stream);
        if conn.attachment.release() {
            self.metrics.record_connection_closed();
        }
        info!(
            "[EVENT-LOOP] connection {} ({}) closed: {}",
            conn.attachment.id(),
            conn.attachment.remote_addr(),
            reason
        );
        self.tasks.submit(Task::ConnectionClosed {
            attachment: conn.attachment,
        });
    }
}
