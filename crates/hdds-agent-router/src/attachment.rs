// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Router-side state of one live TCP connection.
//!
//! The event loop owns the readable side of the socket (the mio stream and
//! its assembler). The [`Attachment`] holds a duplicated handle of the same
//! socket and is shared with workers and liveness tasks for writes and
//! shutdown.

use std::fmt;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use crate::metrics::RouterMetrics;
use crate::protocol::AgentId;
use crate::registry::Client;

/// Pause between two writes when the socket buffer is full.
const WRITE_BACKOFF: Duration = Duration::from_millis(1);

/// One accepted connection, before and after registration.
pub struct Attachment {
    /// Router-unique connection id
    id: u64,

    /// Remote address
    remote_addr: SocketAddr,

    /// Write/shutdown handle (duplicate of the polled socket)
    stream: TcpStream,

    /// Serializes writers so envelopes never interleave
    send_lock: Mutex<()>,

    /// Client linked by a successful registration, set at most once
    client: OnceLock<Weak<Client>>,

    /// Set by the first disconnect or release
    disconnected: AtomicBool,

    /// One-shot release guard
    released: AtomicBool,

    /// Give up on a peer that accepts no bytes for this long
    write_stall_timeout: Duration,

    metrics: Arc<RouterMetrics>,
}

impl Attachment {
    pub fn new(
        id: u64,
        remote_addr: SocketAddr,
        stream: TcpStream,
        write_stall_timeout: Duration,
        metrics: Arc<RouterMetrics>,
    ) -> Self {
        Self {
            id,
            remote_addr,
            stream,
            send_lock: Mutex::new(()),
            client: OnceLock::new(),
            disconnected: AtomicBool::new(false),
            released: AtomicBool::new(false),
            write_stall_timeout,
            metrics,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Client this connection registered as, if still alive.
    pub fn client(&self) -> Option<Arc<Client>> {
        self.client.get().and_then(Weak::upgrade)
    }

    /// Agent this connection registered as.
    pub fn agent_id(&self) -> Option<AgentId> {
        self.client().map(|c| c.agent_id())
    }

    /// True once a registration linked this connection to a client.
    pub fn is_registered(&self) -> bool {
        self.client.get().is_some()
    }

    /// Link this connection to `client`. Fails if it is already linked to
    /// another client.
    pub(crate) fn link_client(&self, client: &Arc<Client>) -> bool {
        let linked = self.client.get_or_init(|| Arc::downgrade(client));
        Weak::ptr_eq(linked, &Arc::downgrade(client))
    }

    /// Write the whole buffer, looping on partial writes.
    pub fn send(&self, bytes: &[u8]) -> io::Result<()> {
        let _guard = self.send_lock.lock();

        let mut written = 0;
        let mut stalled_since: Option<Instant> = None;

        while written < bytes.len() {
            if self.is_disconnected() {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    format!("connection {} closed", self.id),
                ));
            }

            match (&self.stream).write(&bytes[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    written += n;
                    stalled_since = None;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let since = *stalled_since.get_or_insert_with(|| {
                        self.metrics.record_send_stall();
                        Instant::now()
                    });
                    if since.elapsed() >= self.write_stall_timeout {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!(
                                "connection {} accepted no bytes for {:?}",
                                self.id, self.write_stall_timeout
                            ),
                        ));
                    }
                    std::thread::sleep(WRITE_BACKOFF);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Shut the connection down. Idempotent.
    ///
    /// The event loop notices the shutdown as end of stream and performs
    /// the release.
    pub fn disconnect(&self) {
        if !self.disconnected.swap(true, Ordering::AcqRel) {
            trace!("[ATTACHMENT] disconnect {} ({})", self.id, self.remote_addr);
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Release the connection. Only the first call has an effect.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.disconnected.store(true, Ordering::Release);
        let _ = self.stream.shutdown(Shutdown::Both);
        trace!("[ATTACHMENT] released {} ({})", self.id, self.remote_addr);
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("agent", &self.agent_id())
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

/// Connected loopback pair: the router-side attachment and the peer socket.
#[cfg(test)]
pub(crate) fn test_pair(id: u64) -> (Arc<Attachment>, TcpStream) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, remote_addr) = listener.accept().unwrap();
    let attachment = Attachment::new(
        id,
        remote_addr,
        server,
        Duration::from_secs(5),
        Arc::new(RouterMetrics::new()),
    );
    (Arc::new(attachment), peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_send_reaches_peer() {
        let (attachment, mut peer) = test_pair(1);
        attachment.send(b"hello").unwrap();

        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (attachment, mut peer) = test_pair(2);
        attachment.disconnect();
        attachment.disconnect();
        assert!(attachment.is_disconnected());

        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).unwrap(), 0);
        assert!(attachment.send(b"late").is_err());
    }

    #[test]
    fn test_release_once() {
        let (attachment, _peer) = test_pair(3);
        assert!(attachment.release());
        assert!(!attachment.release());
        assert!(attachment.is_released());
        assert!(attachment.is_disconnected());
    }

    #[test]
    fn test_link_client_once() {
        let (attachment, _peer) = test_pair(4);
        let first = Arc::new(Client::new(
            AgentId::new(10).unwrap(),
            crate::protocol::MagicCookie::from_text("a").unwrap(),
        ));
        let second = Arc::new(Client::new(
            AgentId::new(11).unwrap(),
            crate::protocol::MagicCookie::from_text("b").unwrap(),
        ));

        assert!(!attachment.is_registered());
        assert!(attachment.link_client(&first));
        assert!(attachment.link_client(&first));
        assert!(!attachment.link_client(&second));
        assert_eq!(attachment.agent_id(), AgentId::new(10));
    }
}
