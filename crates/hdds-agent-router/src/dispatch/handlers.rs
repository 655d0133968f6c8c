// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol handlers run by the dispatch pool.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use super::Task;
use crate::attachment::Attachment;
use crate::config::ConfigError;
use crate::metrics::{MetricsSnapshot, RouterMetrics};
use crate::protocol::{
    AgentId, ErrorType, Frame, FramingError, Message, MessageType, Registration,
};
use crate::registry::{AgentRegistry, Client, Delivery, SendError};

/// Version of the [`DebugReport`] layout.
pub const DEBUG_REPORT_VERSION: u32 = 1;

/// Handler failures. Logged by the worker, never propagated.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("delivery error: {0}")]
    Send(#[from] SendError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("reload failed: {0}")]
    Reload(#[from] ConfigError),

    #[error("registration refused: {0:?}")]
    Refused(ErrorType),

    #[error("connection {0} is not registered")]
    Unregistered(u64),

    #[error("unexpected {0:?} from an agent")]
    Unexpected(MessageType),

    #[error("reload rejected: bad admin cookie")]
    BadAdminCookie,

    #[error("debug report encoding failed: {0}")]
    Report(#[from] serde_json::Error),
}

/// Diagnostic state returned to DEBUG requests, encoded as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugReport {
    pub version: u32,
    pub router_id: u64,
    pub uptime_ms: u64,
    pub connections: usize,
    pub clients: usize,
    pub connected_clients: usize,
    pub reserved_clients: usize,
    pub metrics: MetricsSnapshot,
}

/// Executes [`Task`]s against the registry.
#[derive(Debug)]
pub struct Dispatcher {
    router_id: u64,
    heartbeat_timeout_ms: u32,
    registry: Arc<AgentRegistry>,
    metrics: Arc<RouterMetrics>,
}

impl Dispatcher {
    pub fn new(
        router_id: u64,
        heartbeat_timeout_ms: u64,
        registry: Arc<AgentRegistry>,
        metrics: Arc<RouterMetrics>,
    ) -> Self {
        Self {
            router_id,
            heartbeat_timeout_ms: u32::try_from(heartbeat_timeout_ms).unwrap_or(u32::MAX),
            registry,
            metrics,
        }
    }

    pub fn router_id(&self) -> u64 {
        self.router_id
    }

    pub fn metrics(&self) -> &RouterMetrics {
        &self.metrics
    }

    /// Run one task, logging any failure.
    pub fn execute(&self, task: Task) {
        match task {
            Task::Process { frame, attachment } => {
                let msg_type = frame.raw_type();
                if let Err(e) = self.process(frame, &attachment) {
                    match e {
                        HandlerError::Send(_) | HandlerError::Io(_) => {
                            debug!(
                                "[DISPATCH] type {} from connection {}: {}",
                                msg_type,
                                attachment.id(),
                                e
                            )
                        }
                        _ => warn!(
                            "[DISPATCH] type {} from connection {} ({}): {}",
                            msg_type,
                            attachment.id(),
                            attachment.remote_addr(),
                            e
                        ),
                    }
                }
            }
            Task::ConnectionClosed { attachment } => self.connection_closed(&attachment),
            Task::BroadcastDisconnection { agent } => self.broadcast_disconnection(agent),
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    fn process(&self, frame: Frame, attachment: &Arc<Attachment>) -> Result<(), HandlerError> {
        let msg = match frame.decode() {
            Ok(msg) => msg,
            Err(e) => {
                self.metrics.record_framing_error();
                self.reply_error(
                    attachment,
                    ErrorType::MalformedMessage,
                    frame.sender(),
                    frame.message_id(),
                );
                return Err(e.into());
            }
        };

        match msg.msg_type {
            MessageType::RegistrationRequest => self.handle_registration(&msg, attachment),
            MessageType::DataRequest | MessageType::DataReply => {
                self.handle_data(frame, &msg, attachment)
            }
            MessageType::HeartbeatClient => self.handle_heartbeat(&msg, attachment),
            MessageType::Debug => self.handle_debug(&msg, attachment),
            MessageType::ReloadConfiguration => self.handle_reload(&msg, attachment),
            MessageType::Error => {
                debug!(
                    "[DISPATCH] agent {:?} reported {:?} for message {}",
                    attachment.agent_id(),
                    msg.error_type(),
                    msg.message_id
                );
                Ok(())
            }
            MessageType::RegistrationReply | MessageType::HeartbeatRouter => {
                Err(HandlerError::Unexpected(msg.msg_type))
            }
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    fn handle_registration(
        &self,
        msg: &Message,
        attachment: &Arc<Attachment>,
    ) -> Result<(), HandlerError> {
        if attachment.is_registered() {
            self.refuse(attachment, msg, ErrorType::MalformedMessage);
            return Err(HandlerError::Refused(ErrorType::MalformedMessage));
        }

        let registration = match msg.registration() {
            Ok(r) => r,
            Err(e) => {
                self.refuse(attachment, msg, ErrorType::MalformedMessage);
                return Err(e.into());
            }
        };

        let client = match msg.sender {
            None if registration.router_id != 0 => Err(ErrorType::InvalidRouterId),
            None => Ok(self.register_new(&registration)),
            Some(agent) if agent.is_reserved() => self.lookup_reserved(agent, &registration),
            Some(agent) => self.lookup_known(agent, &registration),
        };
        let client = match client {
            Ok(client) => client,
            Err(error_type) => {
                self.refuse(attachment, msg, error_type);
                return Err(HandlerError::Refused(error_type));
            }
        };

        if !attachment.link_client(&client) {
            self.forget_new(msg, &client);
            self.refuse(attachment, msg, ErrorType::MalformedMessage);
            return Err(HandlerError::Refused(ErrorType::MalformedMessage));
        }

        let reply = Message::registration_reply(
            client.agent_id(),
            msg.message_id,
            &Registration {
                router_id: self.router_id,
                heartbeat_timeout_ms: self.heartbeat_timeout_ms,
                cookie: client.cookie().clone(),
            },
        )
        .encode();

        if let Err(e) = client.attach(attachment.clone(), &reply) {
            self.forget_new(msg, &client);
            match e {
                SendError::Retired(_) => self.refuse(attachment, msg, ErrorType::InvalidAgentId),
                _ => self.metrics.record_registration_failure(),
            }
            return Err(e.into());
        }

        self.metrics.record_registration();
        info!(
            "[DISPATCH] agent {} registered on connection {} ({})",
            client.agent_id(),
            attachment.id(),
            attachment.remote_addr()
        );
        Ok(())
    }

    fn register_new(&self, registration: &Registration) -> Arc<Client> {
        let agent = self.registry.next_dynamic_id();
        let client = Arc::new(Client::new(agent, registration.cookie.clone()));
        self.registry.add(client.clone());
        client
    }

    /// Drop a dynamic record created by `msg` whose registration failed.
    fn forget_new(&self, msg: &Message, client: &Arc<Client>) {
        if msg.sender.is_none() && self.registry.remove(client) {
            debug!(
                "[DISPATCH] dynamic agent {} dropped after failed registration",
                client.agent_id()
            );
        }
    }

    fn lookup_reserved(
        &self,
        agent: AgentId,
        registration: &Registration,
    ) -> Result<Arc<Client>, ErrorType> {
        let client = self.registry.get(agent).ok_or(ErrorType::InvalidAgentId)?;
        if !client.cookie().matches(&registration.cookie) {
            return Err(ErrorType::WrongMagicCookie);
        }
        if registration.router_id != 0 && registration.router_id != self.router_id {
            return Err(ErrorType::InvalidRouterId);
        }
        Ok(client)
    }

    fn lookup_known(
        &self,
        agent: AgentId,
        registration: &Registration,
    ) -> Result<Arc<Client>, ErrorType> {
        if registration.router_id != self.router_id {
            return Err(ErrorType::InvalidRouterId);
        }
        let client = self.registry.get(agent).ok_or(ErrorType::InvalidAgentId)?;
        if !client.cookie().matches(&registration.cookie) {
            return Err(ErrorType::WrongMagicCookie);
        }
        Ok(client)
    }

    /// Report a failed registration and drop the connection.
    fn refuse(&self, attachment: &Attachment, msg: &Message, error_type: ErrorType) {
        self.metrics.record_registration_failure();
        debug!(
            "[DISPATCH] registration of {:?} on connection {} refused: {:?}",
            msg.sender,
            attachment.id(),
            error_type
        );
        self.reply_error(attachment, error_type, msg.sender, msg.message_id);
        attachment.disconnect();
    }

    // ========================================================================
    // Data
    // ========================================================================

    fn handle_data(
        &self,
        frame: Frame,
        msg: &Message,
        attachment: &Arc<Attachment>,
    ) -> Result<(), HandlerError> {
        let sender = match attachment.agent_id() {
            Some(agent) if msg.sender == Some(agent) => agent,
            registered => {
                self.reply_error(attachment, ErrorType::InvalidAgentId, msg.sender, msg.message_id);
                return match registered {
                    Some(_) => Err(HandlerError::Refused(ErrorType::InvalidAgentId)),
                    None => Err(HandlerError::Unregistered(attachment.id())),
                };
            }
        };

        let recipient = match msg.recipient.and_then(|r| self.registry.get(r)) {
            Some(client) => client,
            None => {
                self.metrics.record_delivery_error();
                trace!(
                    "[DISPATCH] agent {} sent message {} to unknown {:?}",
                    sender,
                    msg.message_id,
                    msg.recipient
                );
                self.reply_error(
                    attachment,
                    ErrorType::UnknownRecipient,
                    msg.recipient,
                    msg.message_id,
                );
                return Ok(());
            }
        };

        let envelope = frame.into_bytes();
        let delivery = match msg.msg_type {
            MessageType::DataReply => Ok(recipient.send_message_or_cache(envelope)),
            _ => recipient.send_request(envelope),
        };

        match delivery {
            Ok(Delivery::Sent) => self.metrics.record_forwarded(),
            Ok(Delivery::Queued) => self.metrics.record_queued(),
            Err(e) => {
                self.metrics.record_delivery_error();
                self.reply_error(
                    attachment,
                    ErrorType::NotConnectedRecipient,
                    Some(recipient.agent_id()),
                    msg.message_id,
                );
                self.broadcast_disconnection(recipient.agent_id());
                return Err(e.into());
            }
        }
        Ok(())
    }

    // ========================================================================
    // Heartbeat, debug, reload
    // ========================================================================

    fn handle_heartbeat(&self, msg: &Message, attachment: &Attachment) -> Result<(), HandlerError> {
        let client = attachment
            .client()
            .ok_or(HandlerError::Unregistered(attachment.id()))?;
        client.touch();
        trace!(
            "[DISPATCH] heartbeat #{} acknowledged by agent {}",
            msg.message_id,
            client.agent_id()
        );
        Ok(())
    }

    fn handle_debug(&self, msg: &Message, attachment: &Attachment) -> Result<(), HandlerError> {
        let report = serde_json::to_vec(&self.debug_report())?;
        let reply = Message::debug_reply(attachment.agent_id(), msg.message_id, report);
        attachment.send(&reply.encode())?;
        Ok(())
    }

    /// Current diagnostic state.
    pub fn debug_report(&self) -> DebugReport {
        let clients = self.registry.snapshot();
        DebugReport {
            version: DEBUG_REPORT_VERSION,
            router_id: self.router_id,
            uptime_ms: self.metrics.uptime().as_millis() as u64,
            connections: self.metrics.active_connections(),
            clients: clients.len(),
            connected_clients: clients.iter().filter(|c| c.is_connected()).count(),
            reserved_clients: clients.iter().filter(|c| c.is_reserved()).count(),
            metrics: self.metrics.snapshot(),
        }
    }

    fn handle_reload(&self, msg: &Message, attachment: &Attachment) -> Result<(), HandlerError> {
        let cookie = msg.admin_cookie()?;
        let authorized = self
            .registry
            .admin_cookie()
            .is_some_and(|admin| admin.matches(&cookie));
        if !authorized {
            warn!(
                "[DISPATCH] reload request from {} rejected",
                attachment.remote_addr()
            );
            return Err(HandlerError::BadAdminCookie);
        }

        info!("[DISPATCH] reload requested by {}", attachment.remote_addr());
        self.registry.reload()?;
        self.metrics.record_reload();
        Ok(())
    }

    // ========================================================================
    // Disconnections
    // ========================================================================

    fn connection_closed(&self, attachment: &Attachment) {
        let Some(client) = attachment.client() else {
            return;
        };
        if client.discard_attachment(attachment.id()) {
            info!(
                "[DISPATCH] agent {} disconnected (connection {})",
                client.agent_id(),
                attachment.id()
            );
            self.broadcast_disconnection(client.agent_id());
        }
    }

    /// Best-effort notice to every other connected agent.
    pub fn broadcast_disconnection(&self, agent: AgentId) {
        for client in self.registry.snapshot() {
            if client.agent_id() == agent || !client.is_connected() {
                continue;
            }
            let notice = Message::error(
                ErrorType::DisconnectionBroadcast,
                Some(agent),
                Some(client.agent_id()),
                0,
            );
            if let Err(e) = client.send_message(&notice.encode()) {
                trace!("[DISPATCH] disconnection notice not delivered: {}", e);
            }
        }
    }

    /// Send an error envelope back on `attachment`. Failures are ignored.
    fn reply_error(
        &self,
        attachment: &Attachment,
        error_type: ErrorType,
        faulty: Option<AgentId>,
        message_id: u64,
    ) {
        let reply = Message::error(error_type, faulty, attachment.agent_id(), message_id);
        if let Err(e) = attachment.send(&reply.encode()) {
            trace!(
                "[DISPATCH] {:?} not delivered to connection {}: {}",
                error_type,
                attachment.id(),
                e
            );
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::test_pair;
    use crate::protocol::{MagicCookie, MessageAssembler};
    use crate::reserved::ReservedAgents;
    use std::io::Read;
    use std::net::TcpStream;
    use std::time::Duration;

    const ROUTER_ID: u64 = 0xABCD;

    fn id(raw: u64) -> AgentId {
        AgentId::new(raw).unwrap()
    }

    fn cookie(text: &str) -> MagicCookie {
        MagicCookie::from_text(text).unwrap()
    }

    fn dispatcher() -> Dispatcher {
        let registry = AgentRegistry::new(None);
        registry.apply_reserved(
            &ReservedAgents::parse("configuration = admin\n10 = ten\n20 = twenty\n").unwrap(),
        );
        Dispatcher::new(
            ROUTER_ID,
            3000,
            Arc::new(registry),
            Arc::new(RouterMetrics::new()),
        )
    }

    fn frame(msg: &Message) -> Frame {
        Frame::from_bytes(msg.encode(), 1 << 20).unwrap()
    }

    fn recv(peer: &mut TcpStream) -> Message {
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut assembler = MessageAssembler::new(1 << 20);
        let mut buf = [0u8; 1];
        loop {
            let n = peer.read(&mut buf).unwrap();
            assert!(n > 0, "connection closed");
            if let Some(frame) = assembler.push_buffer(&buf[..n]).unwrap().pop() {
                return frame.decode().unwrap();
            }
        }
    }

    fn register(
        dispatcher: &Dispatcher,
        agent: Option<AgentId>,
        router_id: u64,
        secret: &str,
        conn: u64,
    ) -> (Arc<Attachment>, TcpStream, Message) {
        let (attachment, mut peer) = test_pair(conn);
        let request = Message::registration_request(
            agent,
            1,
            &Registration {
                router_id,
                heartbeat_timeout_ms: 0,
                cookie: cookie(secret),
            },
        );
        dispatcher.execute(Task::Process {
            frame: frame(&request),
            attachment: attachment.clone(),
        });
        let reply = recv(&mut peer);
        (attachment, peer, reply)
    }

    #[test]
    fn test_reserved_registration() {
        let dispatcher = dispatcher();
        let (attachment, _peer, reply) = register(&dispatcher, Some(id(10)), 0, "ten", 1);

        assert_eq!(reply.msg_type, MessageType::RegistrationReply);
        assert_eq!(reply.recipient, Some(id(10)));
        let registration = reply.registration().unwrap();
        assert_eq!(registration.router_id, ROUTER_ID);
        assert_eq!(registration.heartbeat_timeout_ms, 3000);
        assert_eq!(attachment.agent_id(), Some(id(10)));
    }

    #[test]
    fn test_reserved_wrong_cookie() {
        let dispatcher = dispatcher();
        let (attachment, _peer, reply) = register(&dispatcher, Some(id(10)), 0, "nope", 1);

        assert_eq!(reply.error_type().unwrap(), ErrorType::WrongMagicCookie);
        assert!(attachment.is_disconnected());
        assert!(!dispatcher.registry.get(id(10)).unwrap().is_connected());
    }

    #[test]
    fn test_reserved_cookie_checked_before_router_id() {
        let dispatcher = dispatcher();
        let (_attachment, _peer, reply) = register(&dispatcher, Some(id(10)), 1, "nope", 1);
        assert_eq!(reply.error_type().unwrap(), ErrorType::WrongMagicCookie);
    }

    #[test]
    fn test_unknown_reserved_id() {
        let dispatcher = dispatcher();
        let (_attachment, _peer, reply) = register(&dispatcher, Some(id(11)), 0, "x", 1);
        assert_eq!(reply.error_type().unwrap(), ErrorType::InvalidAgentId);
    }

    #[test]
    fn test_dynamic_registration_and_reconnection() {
        let dispatcher = dispatcher();
        let (_first, _peer, reply) = register(&dispatcher, None, 0, "mine", 1);
        let agent = reply.recipient.unwrap();
        assert!(!agent.is_reserved());

        let (_second, _peer2, wrong_router) = register(&dispatcher, Some(agent), 1, "mine", 2);
        assert_eq!(wrong_router.error_type().unwrap(), ErrorType::InvalidRouterId);

        let (_third, _peer3, wrong_cookie) =
            register(&dispatcher, Some(agent), ROUTER_ID, "theirs", 3);
        assert_eq!(wrong_cookie.error_type().unwrap(), ErrorType::WrongMagicCookie);

        let (fourth, _peer4, ok) = register(&dispatcher, Some(agent), ROUTER_ID, "mine", 4);
        assert_eq!(ok.msg_type, MessageType::RegistrationReply);
        assert_eq!(
            dispatcher.registry.get(agent).unwrap().attachment().unwrap().id(),
            fourth.id()
        );
    }

    #[test]
    fn test_first_registration_with_router_id_refused() {
        let dispatcher = dispatcher();
        let (attachment, _peer, reply) = register(&dispatcher, None, 0x1234, "mine", 1);

        assert_eq!(reply.error_type().unwrap(), ErrorType::InvalidRouterId);
        assert!(attachment.is_disconnected());
        assert_eq!(dispatcher.registry.len(), 2);
    }

    #[test]
    fn test_failed_dynamic_registrations_leave_no_record() {
        let dispatcher = dispatcher();
        for conn in 1..=5 {
            let (attachment, _peer) = test_pair(conn);
            attachment.disconnect();
            let request = Message::registration_request(
                None,
                conn,
                &Registration {
                    router_id: 0,
                    heartbeat_timeout_ms: 0,
                    cookie: cookie("gone"),
                },
            );
            dispatcher.execute(Task::Process {
                frame: frame(&request),
                attachment,
            });
        }

        assert_eq!(dispatcher.registry.len(), 2);
        assert_eq!(dispatcher.metrics.snapshot().registrations, 0);
    }

    #[test]
    fn test_data_relay_and_unknown_recipient() {
        let dispatcher = dispatcher();
        let (a, mut a_peer, _) = register(&dispatcher, Some(id(10)), 0, "ten", 1);
        let (_b, mut b_peer, _) = register(&dispatcher, Some(id(20)), 0, "twenty", 2);

        let request = Message::data_request(id(10), id(20), 5, b"hello".to_vec());
        dispatcher.execute(Task::Process {
            frame: frame(&request),
            attachment: a.clone(),
        });
        assert_eq!(recv(&mut b_peer), request);

        let lost = Message::data_request(id(10), id(30), 6, b"?".to_vec());
        dispatcher.execute(Task::Process {
            frame: frame(&lost),
            attachment: a,
        });
        let error = recv(&mut a_peer);
        assert_eq!(error.error_type().unwrap(), ErrorType::UnknownRecipient);
        assert_eq!(error.message_id, 6);
        assert_eq!(error.sender, Some(id(30)));
    }

    #[test]
    fn test_spoofed_sender_rejected() {
        let dispatcher = dispatcher();
        let (a, mut a_peer, _) = register(&dispatcher, Some(id(10)), 0, "ten", 1);

        let spoofed = Message::data_request(id(20), id(10), 9, Vec::new());
        dispatcher.execute(Task::Process {
            frame: frame(&spoofed),
            attachment: a,
        });
        assert_eq!(
            recv(&mut a_peer).error_type().unwrap(),
            ErrorType::InvalidAgentId
        );
    }

    #[test]
    fn test_malformed_frame_gets_error_reply() {
        let dispatcher = dispatcher();
        let (attachment, mut peer) = test_pair(1);
        let mut bytes = Message::debug_request(None, 77).encode();
        bytes[8] = 250;
        dispatcher.execute(Task::Process {
            frame: Frame::from_bytes(bytes, 1024).unwrap(),
            attachment: attachment.clone(),
        });

        let reply = recv(&mut peer);
        assert_eq!(reply.error_type().unwrap(), ErrorType::MalformedMessage);
        assert_eq!(reply.message_id, 77);
        assert!(!attachment.is_disconnected());
    }

    #[test]
    fn test_debug_report() {
        let dispatcher = dispatcher();
        let (attachment, mut peer) = test_pair(1);
        dispatcher.execute(Task::Process {
            frame: frame(&Message::debug_request(None, 3)),
            attachment,
        });

        let reply = recv(&mut peer);
        assert_eq!(reply.msg_type, MessageType::Debug);
        let report: DebugReport = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(report.version, DEBUG_REPORT_VERSION);
        assert_eq!(report.router_id, ROUTER_ID);
        assert_eq!(report.clients, 2);
        assert_eq!(report.reserved_clients, 2);
    }

    #[test]
    fn test_reload_with_bad_cookie_is_silent() {
        let dispatcher = dispatcher();
        let (attachment, _peer) = test_pair(1);
        dispatcher.execute(Task::Process {
            frame: frame(&Message::reload(&cookie("guess"), 0)),
            attachment: attachment.clone(),
        });
        assert!(!attachment.is_disconnected());
        assert_eq!(dispatcher.metrics.snapshot().reloads, 0);
    }

    #[test]
    fn test_connection_closed_broadcasts() {
        let dispatcher = dispatcher();
        let (a, _a_peer, _) = register(&dispatcher, Some(id(10)), 0, "ten", 1);
        let (_b, mut b_peer, _) = register(&dispatcher, Some(id(20)), 0, "twenty", 2);

        dispatcher.execute(Task::ConnectionClosed { attachment: a });
        assert!(!dispatcher.registry.get(id(10)).unwrap().is_connected());

        let notice = recv(&mut b_peer);
        assert_eq!(notice.error_type().unwrap(), ErrorType::DisconnectionBroadcast);
        assert_eq!(notice.sender, Some(id(10)));
    }

    #[test]
    fn test_request_to_disconnected_agent_is_queued() {
        let dispatcher = dispatcher();
        let (a, _a_peer, _) = register(&dispatcher, Some(id(10)), 0, "ten", 1);

        dispatcher.execute(Task::Process {
            frame: frame(&Message::data_request(id(10), id(20), 1, b"later".to_vec())),
            attachment: a,
        });
        assert_eq!(dispatcher.registry.get(id(20)).unwrap().pending_len(), 1);

        let (_b, mut b_peer, reply) = register(&dispatcher, Some(id(20)), 0, "twenty", 2);
        assert_eq!(reply.msg_type, MessageType::RegistrationReply);
        assert_eq!(recv(&mut b_peer).payload, b"later");
    }
}
