// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One-shot administrative clients.
//!
//! Used by the `reload` and `status` subcommands. Both open a bare
//! connection, send one envelope and close it.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::dispatch::DebugReport;
use crate::protocol::{MagicCookie, Message, MessageAssembler, MessageType};

/// Ask the router at `addr` to reload its reserved-agent file.
///
/// The router sends no reply: success only means the request was written.
pub fn send_reload(addr: SocketAddr, cookie: &MagicCookie, timeout: Duration) -> io::Result<()> {
    let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_write_timeout(Some(timeout))?;
    stream.write_all(&Message::reload(cookie, fastrand::u64(..)).encode())?;
    stream.flush()?;
    debug!("[ADMIN] reload request sent to {}", addr);
    Ok(())
}

/// Fetch the diagnostic report of the router at `addr`.
pub fn query_debug(addr: SocketAddr, timeout: Duration) -> io::Result<DebugReport> {
    let deadline = Instant::now() + timeout;
    let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_write_timeout(Some(timeout))?;

    let request_id = fastrand::u64(..);
    stream.write_all(&Message::debug_request(None, request_id).encode())?;

    let mut assembler = MessageAssembler::default();
    let mut buf = [0u8; 4096];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::ErrorKind::TimedOut.into());
        }
        stream.set_read_timeout(Some(remaining))?;

        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let frames = assembler
            .push_buffer(&buf[..n])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        for frame in frames {
            let msg = frame
                .decode()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            if msg.msg_type == MessageType::Debug && msg.message_id == request_id {
                return serde_json::from_slice(&msg.payload)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
            }
        }
    }
}
