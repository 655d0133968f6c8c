// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared helpers for router integration tests.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use hdds_agent_router::{
    AgentId, MagicCookie, Message, MessageAssembler, MessageType, Registration, Router,
    RouterConfig, RouterHandle,
};

pub const RESERVED: &str = "configuration = admin\n10 = ten\n20 = twenty\n";

pub const WAIT: Duration = Duration::from_secs(5);

pub fn id(raw: u64) -> AgentId {
    AgentId::new(raw).unwrap()
}

pub fn cookie(text: &str) -> MagicCookie {
    MagicCookie::from_text(text).unwrap()
}

pub fn reserved_file(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

pub fn test_config(reserved: &Path) -> RouterConfig {
    RouterConfig {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        worker_threads: 2,
        heartbeat_sender_threads: 2,
        reserved_agents_file: Some(reserved.to_path_buf()),
        ..RouterConfig::default()
    }
}

pub fn start_router(reserved: &Path) -> RouterHandle {
    Router::start(test_config(reserved)).unwrap()
}

/// Poll `condition` until it holds or `WAIT` elapses.
pub fn wait_until<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Minimal blocking agent.
pub struct TestAgent {
    pub stream: TcpStream,
    assembler: MessageAssembler,
    inbox: Vec<Message>,
    pub agent_id: Option<AgentId>,
    pub router_id: u64,
    answer_heartbeats: bool,
}

impl TestAgent {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_nodelay(true).unwrap();
        Self {
            stream,
            assembler: MessageAssembler::default(),
            inbox: Vec::new(),
            agent_id: None,
            router_id: 0,
            answer_heartbeats: true,
        }
    }

    /// Stop answering router heartbeats.
    pub fn go_silent(&mut self) {
        self.answer_heartbeats = false;
    }

    /// Send a registration request and return the router's answer.
    pub fn register(&mut self, agent: Option<AgentId>, router_id: u64, secret: &str) -> Message {
        let request = Message::registration_request(
            agent,
            fastrand::u64(..),
            &Registration {
                router_id,
                heartbeat_timeout_ms: 0,
                cookie: cookie(secret),
            },
        );
        self.send(&request);
        let reply = self
            .recv_matching(|m| {
                m.msg_type == MessageType::RegistrationReply || m.msg_type == MessageType::Error
            })
            .expect("no registration answer");
        if reply.msg_type == MessageType::RegistrationReply {
            self.agent_id = reply.recipient;
            self.router_id = reply.registration().unwrap().router_id;
        }
        reply
    }

    pub fn send(&mut self, msg: &Message) {
        self.stream.write_all(&msg.encode()).unwrap();
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    pub fn send_data(&mut self, recipient: AgentId, message_id: u64, payload: &[u8]) {
        let msg = Message::data_request(
            self.agent_id.unwrap(),
            recipient,
            message_id,
            payload.to_vec(),
        );
        self.send(&msg);
    }

    /// Next message satisfying `pred`, answering heartbeats on the way.
    /// `None` on timeout or end of stream.
    pub fn recv_matching<F: Fn(&Message) -> bool>(&mut self, pred: F) -> Option<Message> {
        let deadline = Instant::now() + WAIT;
        loop {
            if let Some(pos) = self.inbox.iter().position(&pred) {
                return Some(self.inbox.remove(pos));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            self.stream.set_read_timeout(Some(remaining)).unwrap();

            let mut buf = [0u8; 4096];
            let n = match self.stream.read(&mut buf) {
                Ok(0) | Err(_) => return None,
                Ok(n) => n,
            };
            for frame in self.assembler.push_buffer(&buf[..n]).unwrap() {
                let msg = frame.decode().unwrap();
                if msg.msg_type == MessageType::HeartbeatRouter {
                    if self.answer_heartbeats {
                        if let Some(agent) = self.agent_id {
                            let ack = Message::heartbeat_client(agent, msg.message_id);
                            let _ = self.stream.write_all(&ack.encode());
                        }
                    }
                    continue;
                }
                self.inbox.push(msg);
            }
        }
    }

    pub fn recv_data(&mut self) -> Option<Message> {
        self.recv_matching(|m| {
            m.msg_type == MessageType::DataRequest || m.msg_type == MessageType::DataReply
        })
    }

    pub fn recv_error(&mut self) -> Option<Message> {
        self.recv_matching(|m| m.msg_type == MessageType::Error)
    }

    /// True once the router closed the connection.
    pub fn is_closed_by_router(&mut self) -> bool {
        self.stream.set_read_timeout(Some(WAIT)).unwrap();
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(e) => {
                    return e.kind() != std::io::ErrorKind::WouldBlock
                        && e.kind() != std::io::ErrorKind::TimedOut
                }
            }
        }
    }
}
