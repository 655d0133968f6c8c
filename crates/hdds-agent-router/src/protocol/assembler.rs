// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Incremental envelope reassembly.
//!
//! TCP delivers a byte stream with no message boundaries. The assembler
//! turns arbitrary chunks into complete [`Frame`]s:
//!
//! ```text
//!  chunk 1          chunk 2                 chunk 3
//! +--------+  +---------------------+  +-------------+
//! | prefix |  | rest of envelope A  |  | envelope B  |
//! +--------+  +---------------------+  +-------------+
//!     |                 |                     |
//!     v                 v                     v
//!  ReadingPrefix -> ReadingBody -> emit A -> ... -> emit B
//! ```
//!
//! Nothing is allocated until the prefix (length + protocol version) has
//! been validated. A prefix error leaves the stream position undefined, so
//! the caller must close the connection.

use super::message::{check_prefix, Frame, FramingError, PREFIX_SIZE};
use super::DEFAULT_MAX_MESSAGE_SIZE;

/// Per-connection reassembly state.
#[derive(Debug)]
pub struct MessageAssembler {
    /// Current read state
    state: ReadState,

    /// Prefix accumulator
    prefix: [u8; PREFIX_SIZE],

    /// Envelope being filled, sized to the declared length
    buffer: Vec<u8>,

    /// Maximum accepted envelope size (anti-OOM protection)
    max_size: usize,

    /// Statistics: frames emitted
    frames_assembled: u64,
}

#[derive(Debug, Clone, Copy)]
enum ReadState {
    /// Collecting the length + version prefix
    ReadingPrefix { bytes_read: usize },

    /// Filling the envelope buffer
    ReadingBody {
        expected_len: usize,
        bytes_read: usize,
    },
}

impl Default for ReadState {
    fn default() -> Self {
        ReadState::ReadingPrefix { bytes_read: 0 }
    }
}

impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl MessageAssembler {
    /// Create an assembler rejecting envelopes above `max_size` bytes.
    pub fn new(max_size: usize) -> Self {
        Self {
            state: ReadState::default(),
            prefix: [0u8; PREFIX_SIZE],
            buffer: Vec::new(),
            max_size,
            frames_assembled: 0,
        }
    }

    pub fn frames_assembled(&self) -> u64 {
        self.frames_assembled
    }

    /// True while part of an envelope is buffered.
    pub fn is_partial(&self) -> bool {
        !matches!(self.state, ReadState::ReadingPrefix { bytes_read: 0 })
    }

    /// Consume `chunk` and return every envelope it completes, in order.
    ///
    /// Envelopes completed before a framing error are lost with the error;
    /// stream readers use [`push_into`](Self::push_into) instead.
    pub fn push_buffer(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, FramingError> {
        let mut frames = Vec::new();
        self.push_into(chunk, &mut frames)?;
        Ok(frames)
    }

    /// Consume `chunk`, appending every completed envelope to `frames`.
    ///
    /// On error `frames` still holds the envelopes that preceded the bad
    /// header, so the output does not depend on how the stream was split.
    pub fn push_into(
        &mut self,
        chunk: &[u8],
        frames: &mut Vec<Frame>,
    ) -> Result<(), FramingError> {
        let mut pos = 0;

        while pos < chunk.len() {
            let available = &chunk[pos..];

            match self.state {
                ReadState::ReadingPrefix { bytes_read } => {
                    let take = (PREFIX_SIZE - bytes_read).min(available.len());
                    self.prefix[bytes_read..bytes_read + take].copy_from_slice(&available[..take]);
                    pos += take;

                    let bytes_read = bytes_read + take;
                    if bytes_read < PREFIX_SIZE {
                        self.state = ReadState::ReadingPrefix { bytes_read };
                        continue;
                    }

                    let expected_len = match check_prefix(&self.prefix, self.max_size) {
                        Ok(len) => len,
                        Err(e) => {
                            self.reset();
                            return Err(e);
                        }
                    };

                    self.buffer = Vec::with_capacity(expected_len);
                    self.buffer.extend_from_slice(&self.prefix);
                    self.state = ReadState::ReadingBody {
                        expected_len,
                        bytes_read: PREFIX_SIZE,
                    };
                }

                ReadState::ReadingBody {
                    expected_len,
                    bytes_read,
                } => {
                    let take = (expected_len - bytes_read).min(available.len());
                    self.buffer.extend_from_slice(&available[..take]);
                    pos += take;

                    let bytes_read = bytes_read + take;
                    if bytes_read < expected_len {
                        self.state = ReadState::ReadingBody {
                            expected_len,
                            bytes_read,
                        };
                        continue;
                    }

                    let envelope = std::mem::take(&mut self.buffer);
                    self.frames_assembled += 1;
                    frames.push(Frame::from_assembled(envelope));
                    self.state = ReadState::default();
                }
            }
        }

        Ok(())
    }

    /// Drop any partial envelope.
    pub fn reset(&mut self) {
        self.state = ReadState::default();
        self.buffer = Vec::new();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AgentId, Message, MessageType, HEADER_SIZE, PROTOCOL_VERSION};

    fn id(raw: u64) -> AgentId {
        AgentId::new(raw).unwrap()
    }

    fn sample(payload_len: usize) -> Message {
        let payload = (0..payload_len).map(|i| (i % 251) as u8).collect();
        Message::data_request(id(10), id(20), 99, payload)
    }

    #[test]
    fn test_single_chunk() {
        let msg = sample(16);
        let mut assembler = MessageAssembler::new(1024);

        let frames = assembler.push_buffer(&msg.encode()).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].decode().unwrap(), msg);
        assert!(!assembler.is_partial());
        assert_eq!(assembler.frames_assembled(), 1);
    }

    #[test]
    fn test_one_byte_chunks() {
        let msg = sample(300 - HEADER_SIZE);
        let bytes = msg.encode();
        assert_eq!(bytes.len(), 300);

        let mut assembler = MessageAssembler::new(1024);
        let mut frames = Vec::new();
        for b in &bytes {
            frames.extend(assembler.push_buffer(std::slice::from_ref(b)).unwrap());
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].decode().unwrap(), msg);
    }

    #[test]
    fn test_random_splits_are_equivalent() {
        let messages: Vec<Message> = [0usize, 1, 33, 300, 4000].iter().map(|n| sample(*n)).collect();
        let mut stream = Vec::new();
        for msg in &messages {
            msg.encode_into(&mut stream);
        }

        let mut rng = fastrand::Rng::with_seed(0x5eed);
        for _ in 0..50 {
            let mut assembler = MessageAssembler::new(64 * 1024);
            let mut frames = Vec::new();
            let mut pos = 0;
            while pos < stream.len() {
                let end = (pos + rng.usize(1..=512)).min(stream.len());
                frames.extend(assembler.push_buffer(&stream[pos..end]).unwrap());
                pos = end;
            }
            let decoded: Vec<Message> = frames.iter().map(|f| f.decode().unwrap()).collect();
            assert_eq!(decoded, messages);
        }
    }

    #[test]
    fn test_many_frames_in_one_chunk() {
        let mut stream = Vec::new();
        for i in 0..10 {
            Message::heartbeat_client(id(7), i).encode_into(&mut stream);
        }
        let mut assembler = MessageAssembler::new(1024);
        let frames = assembler.push_buffer(&stream).unwrap();
        assert_eq!(frames.len(), 10);
        assert_eq!(frames[9].message_id(), 9);
        assert_eq!(frames[0].raw_type(), MessageType::HeartbeatClient as u8);
    }

    #[test]
    fn test_partial_then_complete() {
        let bytes = sample(40).encode();
        let mut assembler = MessageAssembler::new(1024);

        assert!(assembler.push_buffer(&bytes[..5]).unwrap().is_empty());
        assert!(assembler.is_partial());
        assert!(assembler.push_buffer(&bytes[5..20]).unwrap().is_empty());
        let frames = assembler.push_buffer(&bytes[20..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(!assembler.is_partial());
    }

    #[test]
    fn test_wrong_protocol_rejected() {
        let mut bytes = sample(8).encode();
        bytes[4..8].copy_from_slice(&(PROTOCOL_VERSION + 1).to_be_bytes());
        let mut assembler = MessageAssembler::new(1024);
        assert_eq!(
            assembler.push_buffer(&bytes),
            Err(FramingError::UnknownProtocol(PROTOCOL_VERSION + 1))
        );
    }

    #[test]
    fn test_frames_before_bad_header_survive() {
        let valid = sample(12);
        let mut bad = Message::debug_request(None, 2).encode();
        bad[4..8].copy_from_slice(&(PROTOCOL_VERSION + 1).to_be_bytes());
        let mut stream = valid.encode();
        stream.extend_from_slice(&bad);

        let mut whole = Vec::new();
        let mut assembler = MessageAssembler::new(1024);
        assert_eq!(
            assembler.push_into(&stream, &mut whole),
            Err(FramingError::UnknownProtocol(PROTOCOL_VERSION + 1))
        );

        let split = valid.encode().len();
        let mut parts = Vec::new();
        let mut assembler = MessageAssembler::new(1024);
        assert!(assembler.push_into(&stream[..split], &mut parts).is_ok());
        assert!(assembler.push_into(&stream[split..], &mut parts).is_err());

        assert_eq!(whole.len(), 1);
        assert_eq!(whole[0].decode().unwrap(), valid);
        assert_eq!(whole, parts);
    }

    #[test]
    fn test_short_length_rejected() {
        let mut bytes = sample(8).encode();
        bytes[..4].copy_from_slice(&4u32.to_be_bytes());
        let mut assembler = MessageAssembler::new(1024);
        assert_eq!(assembler.push_buffer(&bytes), Err(FramingError::TooShort(4)));
    }

    #[test]
    fn test_oversized_rejected_before_allocation() {
        let mut prefix = Vec::new();
        prefix.extend_from_slice(&u32::MAX.to_be_bytes());
        prefix.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        let mut assembler = MessageAssembler::new(1024);
        let err = assembler.push_buffer(&prefix).unwrap_err();
        assert!(matches!(err, FramingError::TooLarge { .. }));
        assert!(!assembler.is_partial());
    }
}
