//! Reassembly of chunk streams into messages
//!
//! Chunks of different messages may interleave on one connection, but the
//! chunks of a single message always arrive in send order. The assembler
//! keeps one partial buffer per in-flight message id and hands back the
//! message once the declared length has been received.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tracing::trace;
use vst_core::{Result, VstError};

use crate::chunk::Chunk;

/// A logical VelocyStream message. The payload is the serialized head
/// followed by the body; splitting it is left to the serializer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u64,
    pub payload: Bytes,
}

impl Message {
    pub fn new(id: u64, payload: Bytes) -> Self {
        Self { id, payload }
    }
}

struct PartialMessage {
    expected_length: u64,
    expected_chunks: u32,
    next_index: u32,
    buffer: BytesMut,
}

#[derive(Default)]
pub struct MessageAssembler {
    partial: HashMap<u64, PartialMessage>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages with at least one chunk received but not complete.
    #[inline]
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.partial.len()
    }

    /// Feed one decoded chunk. Returns the message when this chunk completes it.
    pub fn feed(&mut self, chunk: Chunk) -> Result<Option<Message>> {
        let message_id = chunk.message_id();

        if chunk.is_first() {
            if self.partial.contains_key(&message_id) {
                return Err(VstError::InvalidChunk(format!(
                    "second first chunk for in-flight message {}",
                    message_id
                )));
            }

            let expected_length = chunk.header.message_length.unwrap_or_default();
            let expected_chunks = chunk.header.chunk_x.total_chunks().unwrap_or(1);
            let capacity = usize::try_from(expected_length).unwrap_or(usize::MAX).min(1 << 20);
            let mut buffer = BytesMut::with_capacity(capacity);
            buffer.extend_from_slice(&chunk.payload);

            trace!(message_id, expected_length, expected_chunks, "First chunk received");

            self.partial.insert(
                message_id,
                PartialMessage {
                    expected_length,
                    expected_chunks,
                    next_index: 1,
                    buffer,
                },
            );
        } else {
            let partial = self
                .partial
                .get_mut(&message_id)
                .ok_or(VstError::UnknownMessage(message_id))?;

            let index = chunk.header.chunk_x.index();
            if index != partial.next_index || index >= partial.expected_chunks {
                return Err(VstError::InvalidChunk(format!(
                    "message {} expected chunk {} of {}, got {}",
                    message_id, partial.next_index, partial.expected_chunks, index
                )));
            }

            partial.buffer.extend_from_slice(&chunk.payload);
            partial.next_index += 1;
        }

        self.take_if_complete(message_id)
    }

    /// Drop every partial message, e.g. after the stream was torn down.
    pub fn clear(&mut self) {
        self.partial.clear();
    }

    fn take_if_complete(&mut self, message_id: u64) -> Result<Option<Message>> {
        let Some(partial) = self.partial.get(&message_id) else {
            return Ok(None);
        };

        let received = partial.buffer.len() as u64;
        if received < partial.expected_length {
            if partial.next_index >= partial.expected_chunks {
                let expected = partial.expected_length;
                self.partial.remove(&message_id);
                return Err(VstError::LengthMismatch {
                    message_id,
                    expected,
                    actual: received,
                });
            }
            return Ok(None);
        }

        let Some(partial) = self.partial.remove(&message_id) else {
            return Ok(None);
        };

        if received > partial.expected_length {
            return Err(VstError::LengthMismatch {
                message_id,
                expected: partial.expected_length,
                actual: received,
            });
        }

        trace!(message_id, length = received, "Message reassembled");
        Ok(Some(Message::new(message_id, partial.buffer.freeze())))
    }
}
