// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Envelope encoding and decoding.
//!
//! Decoding is split in two steps. [`check_prefix`] validates the first
//! [`PREFIX_SIZE`] bytes (length + protocol version) and is all the
//! assembler needs to size a buffer. [`Message::decode`] then parses a
//! complete envelope. A [`Frame`] is an envelope that passed the first step
//! and can be relayed without re-encoding.

use thiserror::Error;

use super::{AgentId, CookieError, MagicCookie, COOKIE_SIZE, HEADER_SIZE, PROTOCOL_VERSION};

/// Length + protocol version.
pub const PREFIX_SIZE: usize = 8;

/// Registration payload: router id + heartbeat timeout + cookie.
pub const REGISTRATION_PAYLOAD_SIZE: usize = 8 + 4 + COOKIE_SIZE;

/// Error payload: error code.
pub const ERROR_PAYLOAD_SIZE: usize = 4;

const TYPE_OFFSET: usize = 8;
const MESSAGE_ID_OFFSET: usize = 9;
const SENDER_OFFSET: usize = 17;
const RECIPIENT_OFFSET: usize = 25;

// ============================================================================
// Errors
// ============================================================================

/// Envelope decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("unknown protocol version {0:#010x}")]
    UnknownProtocol(u32),

    #[error("declared length {0} is below the {min} byte header", min = HEADER_SIZE)]
    TooShort(usize),

    #[error("declared length {length} exceeds maximum {max}")]
    TooLarge { length: usize, max: usize },

    #[error("envelope declares {declared} bytes but {available} are available")]
    Truncated { declared: usize, available: usize },

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("unknown error code {0}")]
    UnknownErrorCode(u32),

    #[error("invalid {msg_type:?} payload: {reason}")]
    InvalidPayload {
        msg_type: MessageType,
        reason: &'static str,
    },

    #[error("invalid cookie: {0}")]
    Cookie(#[from] CookieError),
}

impl FramingError {
    /// Errors that leave the stream position unknown and must close the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FramingError::UnknownProtocol(_)
                | FramingError::TooShort(_)
                | FramingError::TooLarge { .. }
        )
    }
}

/// Validate an envelope prefix and return the declared envelope length.
pub fn check_prefix(prefix: &[u8; PREFIX_SIZE], max_size: usize) -> Result<usize, FramingError> {
    let length = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    let version = u32::from_be_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]);

    if version != PROTOCOL_VERSION {
        return Err(FramingError::UnknownProtocol(version));
    }
    if length < HEADER_SIZE {
        return Err(FramingError::TooShort(length));
    }
    if length > max_size {
        return Err(FramingError::TooLarge {
            length,
            max: max_size,
        });
    }
    Ok(length)
}

// ============================================================================
// Message and error types
// ============================================================================

/// Envelope message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    RegistrationRequest = 0,
    RegistrationReply = 1,
    DataRequest = 2,
    DataReply = 3,
    HeartbeatClient = 4,
    HeartbeatRouter = 5,
    Error = 6,
    Debug = 7,
    ReloadConfiguration = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = FramingError;

    fn try_from(value: u8) -> Result<Self, FramingError> {
        Ok(match value {
            0 => MessageType::RegistrationRequest,
            1 => MessageType::RegistrationReply,
            2 => MessageType::DataRequest,
            3 => MessageType::DataReply,
            4 => MessageType::HeartbeatClient,
            5 => MessageType::HeartbeatRouter,
            6 => MessageType::Error,
            7 => MessageType::Debug,
            8 => MessageType::ReloadConfiguration,
            other => return Err(FramingError::UnknownMessageType(other)),
        })
    }
}

/// Error codes carried by [`MessageType::Error`] envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorType {
    /// The faulty agent disconnected from the router.
    DisconnectionBroadcast = 0,
    /// The recipient is known but its tunnel broke while sending.
    NotConnectedRecipient = 1,
    /// The recipient was never registered (or was evicted).
    UnknownRecipient = 2,
    /// Registration with an id the router does not know.
    InvalidAgentId = 3,
    /// Reconnection to a router instance other than this one.
    InvalidRouterId = 4,
    /// Registration with a cookie that does not match.
    WrongMagicCookie = 5,
    /// The envelope could not be decoded.
    MalformedMessage = 6,
}

impl TryFrom<u32> for ErrorType {
    type Error = FramingError;

    fn try_from(value: u32) -> Result<Self, FramingError> {
        Ok(match value {
            0 => ErrorType::DisconnectionBroadcast,
            1 => ErrorType::NotConnectedRecipient,
            2 => ErrorType::UnknownRecipient,
            3 => ErrorType::InvalidAgentId,
            4 => ErrorType::InvalidRouterId,
            5 => ErrorType::WrongMagicCookie,
            6 => ErrorType::MalformedMessage,
            other => return Err(FramingError::UnknownErrorCode(other)),
        })
    }
}

// ============================================================================
// Registration payload
// ============================================================================

/// Payload of registration requests and replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Router instance id. `0` in a first request.
    pub router_id: u64,
    /// Router heartbeat timeout in a reply, ignored in a request.
    pub heartbeat_timeout_ms: u32,
    /// Agent cookie.
    pub cookie: MagicCookie,
}

impl Registration {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.router_id.to_be_bytes());
        buf.extend_from_slice(&self.heartbeat_timeout_ms.to_be_bytes());
        buf.extend_from_slice(self.cookie.as_bytes());
    }

    fn decode(msg_type: MessageType, payload: &[u8]) -> Result<Self, FramingError> {
        if payload.len() != REGISTRATION_PAYLOAD_SIZE {
            return Err(FramingError::InvalidPayload {
                msg_type,
                reason: "registration payload has the wrong size",
            });
        }
        Ok(Self {
            router_id: read_u64(payload, 0),
            heartbeat_timeout_ms: read_u32(payload, 8),
            cookie: MagicCookie::from_bytes(&payload[12..])?,
        })
    }
}

// ============================================================================
// Message
// ============================================================================

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub message_id: u64,
    pub sender: Option<AgentId>,
    pub recipient: Option<AgentId>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(
        msg_type: MessageType,
        message_id: u64,
        sender: Option<AgentId>,
        recipient: Option<AgentId>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            msg_type,
            message_id,
            sender,
            recipient,
            payload,
        }
    }

    /// Registration request. `agent` is `None` to ask for a fresh id.
    pub fn registration_request(
        agent: Option<AgentId>,
        message_id: u64,
        registration: &Registration,
    ) -> Self {
        let mut payload = Vec::with_capacity(REGISTRATION_PAYLOAD_SIZE);
        registration.encode_into(&mut payload);
        Self::new(
            MessageType::RegistrationRequest,
            message_id,
            agent,
            None,
            payload,
        )
    }

    /// Registration reply sent to `agent`.
    pub fn registration_reply(agent: AgentId, message_id: u64, registration: &Registration) -> Self {
        let mut payload = Vec::with_capacity(REGISTRATION_PAYLOAD_SIZE);
        registration.encode_into(&mut payload);
        Self::new(
            MessageType::RegistrationReply,
            message_id,
            None,
            Some(agent),
            payload,
        )
    }

    pub fn data_request(
        sender: AgentId,
        recipient: AgentId,
        message_id: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self::new(
            MessageType::DataRequest,
            message_id,
            Some(sender),
            Some(recipient),
            payload,
        )
    }

    pub fn data_reply(sender: AgentId, recipient: AgentId, message_id: u64, payload: Vec<u8>) -> Self {
        Self::new(
            MessageType::DataReply,
            message_id,
            Some(sender),
            Some(recipient),
            payload,
        )
    }

    /// Router heartbeat. The heartbeat id travels as the message id.
    pub fn heartbeat_router(recipient: AgentId, heartbeat_id: u64) -> Self {
        Self::new(
            MessageType::HeartbeatRouter,
            heartbeat_id,
            None,
            Some(recipient),
            Vec::new(),
        )
    }

    /// Agent answer to a router heartbeat.
    pub fn heartbeat_client(sender: AgentId, heartbeat_id: u64) -> Self {
        Self::new(
            MessageType::HeartbeatClient,
            heartbeat_id,
            Some(sender),
            None,
            Vec::new(),
        )
    }

    /// Error notification. `faulty` is the agent the error is about,
    /// `message_id` the id of the message that caused it.
    pub fn error(
        error_type: ErrorType,
        faulty: Option<AgentId>,
        recipient: Option<AgentId>,
        message_id: u64,
    ) -> Self {
        Self::new(
            MessageType::Error,
            message_id,
            faulty,
            recipient,
            (error_type as u32).to_be_bytes().to_vec(),
        )
    }

    pub fn debug_request(sender: Option<AgentId>, message_id: u64) -> Self {
        Self::new(MessageType::Debug, message_id, sender, None, Vec::new())
    }

    pub fn debug_reply(recipient: Option<AgentId>, message_id: u64, report: Vec<u8>) -> Self {
        Self::new(MessageType::Debug, message_id, None, recipient, report)
    }

    /// Administrative reload request authenticated by the admin cookie.
    pub fn reload(cookie: &MagicCookie, message_id: u64) -> Self {
        Self::new(
            MessageType::ReloadConfiguration,
            message_id,
            None,
            None,
            cookie.as_bytes().to_vec(),
        )
    }

    /// Size of the encoded envelope.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Append the encoded envelope to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.encoded_len() as u32).to_be_bytes());
        buf.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        buf.push(self.msg_type as u8);
        buf.extend_from_slice(&self.message_id.to_be_bytes());
        buf.extend_from_slice(&AgentId::to_wire(self.sender).to_be_bytes());
        buf.extend_from_slice(&AgentId::to_wire(self.recipient).to_be_bytes());
        buf.extend_from_slice(&self.payload);
    }

    /// Decode one complete envelope. `bytes` must hold exactly that envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, FramingError> {
        let prefix: &[u8; PREFIX_SIZE] = bytes
            .get(..PREFIX_SIZE)
            .and_then(|p| p.try_into().ok())
            .ok_or(FramingError::Truncated {
                declared: HEADER_SIZE,
                available: bytes.len(),
            })?;
        let declared = check_prefix(prefix, usize::MAX)?;
        if bytes.len() != declared {
            return Err(FramingError::Truncated {
                declared,
                available: bytes.len(),
            });
        }

        Ok(Self {
            msg_type: MessageType::try_from(bytes[TYPE_OFFSET])?,
            message_id: read_u64(bytes, MESSAGE_ID_OFFSET),
            sender: AgentId::new(read_u64(bytes, SENDER_OFFSET)),
            recipient: AgentId::new(read_u64(bytes, RECIPIENT_OFFSET)),
            payload: bytes[HEADER_SIZE..].to_vec(),
        })
    }

    /// Registration payload of a request or reply.
    pub fn registration(&self) -> Result<Registration, FramingError> {
        match self.msg_type {
            MessageType::RegistrationRequest | MessageType::RegistrationReply => {
                Registration::decode(self.msg_type, &self.payload)
            }
            other => Err(FramingError::InvalidPayload {
                msg_type: other,
                reason: "not a registration message",
            }),
        }
    }

    /// Error code of an error envelope.
    pub fn error_type(&self) -> Result<ErrorType, FramingError> {
        if self.msg_type != MessageType::Error || self.payload.len() != ERROR_PAYLOAD_SIZE {
            return Err(FramingError::InvalidPayload {
                msg_type: self.msg_type,
                reason: "error payload must be a 4 byte code",
            });
        }
        ErrorType::try_from(read_u32(&self.payload, 0))
    }

    /// Admin cookie of a reload request.
    pub fn admin_cookie(&self) -> Result<MagicCookie, FramingError> {
        if self.msg_type != MessageType::ReloadConfiguration {
            return Err(FramingError::InvalidPayload {
                msg_type: self.msg_type,
                reason: "not a reload message",
            });
        }
        Ok(MagicCookie::from_bytes(&self.payload)?)
    }
}

// ============================================================================
// Frame
// ============================================================================

/// A complete envelope whose prefix has been validated.
///
/// Header fields are readable without decoding the payload, and the raw
/// bytes can be forwarded as is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Vec<u8>);

impl Frame {
    /// Wrap an already assembled envelope.
    pub(crate) fn from_assembled(bytes: Vec<u8>) -> Self {
        debug_assert!(bytes.len() >= HEADER_SIZE);
        Self(bytes)
    }

    /// Validate and wrap a complete envelope.
    pub fn from_bytes(bytes: Vec<u8>, max_size: usize) -> Result<Self, FramingError> {
        let prefix: &[u8; PREFIX_SIZE] = bytes
            .get(..PREFIX_SIZE)
            .and_then(|p| p.try_into().ok())
            .ok_or(FramingError::Truncated {
                declared: HEADER_SIZE,
                available: bytes.len(),
            })?;
        let declared = check_prefix(prefix, max_size)?;
        if declared != bytes.len() {
            return Err(FramingError::Truncated {
                declared,
                available: bytes.len(),
            });
        }
        Ok(Self(bytes))
    }

    /// Raw type byte, possibly unknown.
    pub fn raw_type(&self) -> u8 {
        self.0[TYPE_OFFSET]
    }

    pub fn message_id(&self) -> u64 {
        read_u64(&self.0, MESSAGE_ID_OFFSET)
    }

    pub fn sender(&self) -> Option<AgentId> {
        AgentId::new(read_u64(&self.0, SENDER_OFFSET))
    }

    pub fn recipient(&self) -> Option<AgentId> {
        AgentId::new(read_u64(&self.0, RECIPIENT_OFFSET))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Fully decode the envelope.
    pub fn decode(&self) -> Result<Message, FramingError> {
        Message::decode(&self.0)
    }
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(raw)
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_be_bytes(raw)
}

// ============================================================================
// Tests
// ============================================================================
