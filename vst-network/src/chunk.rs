//! VelocyStream chunk framing
//!
//! Every message on a connection travels as one or more chunks. All integers
//! are little-endian:
//!
//! ```text
//! chunk_length   u32  total bytes of this chunk, header included
//! chunk_x        u32  bit0 = first chunk; rest = total chunks (first) or index
//! message_id     u64
//! message_length u64  first chunk only
//! payload        chunk_length - header size
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use vst_core::{Result, VstError};

pub const FIRST_CHUNK_HEADER_SIZE: usize = 24;
pub const CHUNK_HEADER_SIZE: usize = 16;

/// Bytes needed before the header size of a chunk is known.
const CHUNK_PREFIX_SIZE: usize = 8;

/// Largest chunk count representable in the 31 upper bits of `chunk_x`.
const MAX_CHUNKS: u64 = (u32::MAX >> 1) as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkX(u32);

impl ChunkX {
    #[inline]
    #[must_use]
    pub fn first(total_chunks: u32) -> Self {
        Self((total_chunks << 1) | 1)
    }

    #[inline]
    #[must_use]
    pub fn follow(index: u32) -> Self {
        Self(index << 1)
    }

    #[inline]
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub fn is_first(self) -> bool {
        self.0 & 1 == 1
    }

    /// Total chunk count of the message; only meaningful on a first chunk.
    #[inline]
    #[must_use]
    pub fn total_chunks(self) -> Option<u32> {
        self.is_first().then_some(self.0 >> 1)
    }

    /// Position of the chunk inside its message; the first chunk is index 0.
    #[inline]
    #[must_use]
    pub fn index(self) -> u32 {
        if self.is_first() { 0 } else { self.0 >> 1 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_length: u32,
    pub chunk_x: ChunkX,
    pub message_id: u64,
    /// Present on the first chunk only.
    pub message_length: Option<u64>,
}

impl ChunkHeader {
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        if self.chunk_x.is_first() {
            FIRST_CHUNK_HEADER_SIZE
        } else {
            CHUNK_HEADER_SIZE
        }
    }

    #[inline]
    #[must_use]
    pub fn payload_length(&self) -> usize {
        (self.chunk_length as usize).saturating_sub(self.size())
    }

    /// Parse a header from the front of `buf`. `Ok(None)` means more bytes
    /// are needed.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>> {
        if buf.len() < CHUNK_PREFIX_SIZE {
            return Ok(None);
        }

        let chunk_length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let chunk_x = ChunkX::from_raw(u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]));
        let header_size = if chunk_x.is_first() {
            FIRST_CHUNK_HEADER_SIZE
        } else {
            CHUNK_HEADER_SIZE
        };

        if (chunk_length as usize) <= header_size {
            return Err(VstError::InvalidChunk(format!(
                "chunk length {} leaves no payload after {} byte header",
                chunk_length, header_size
            )));
        }

        if buf.len() < header_size {
            return Ok(None);
        }

        let message_id = read_u64(&buf[8..16]);
        let message_length = if chunk_x.is_first() {
            let len = read_u64(&buf[16..24]);
            if len == 0 {
                return Err(VstError::InvalidChunk(
                    "first chunk declares an empty message".into(),
                ));
            }
            if chunk_x.total_chunks() == Some(0) {
                return Err(VstError::InvalidChunk(
                    "first chunk declares zero chunks".into(),
                ));
            }
            Some(len)
        } else {
            None
        };

        Ok(Some(Self {
            chunk_length,
            chunk_x,
            message_id,
            message_length,
        }))
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.chunk_length);
        buf.put_u32_le(self.chunk_x.raw());
        buf.put_u64_le(self.message_id);
        if let Some(len) = self.message_length {
            buf.put_u64_le(len);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub header: ChunkHeader,
    pub payload: Bytes,
}

impl Chunk {
    pub fn first(message_id: u64, total_chunks: u32, message_length: u64, payload: Bytes) -> Self {
        Self {
            header: ChunkHeader {
                chunk_length: (FIRST_CHUNK_HEADER_SIZE + payload.len()) as u32,
                chunk_x: ChunkX::first(total_chunks),
                message_id,
                message_length: Some(message_length),
            },
            payload,
        }
    }

    pub fn follow(message_id: u64, index: u32, payload: Bytes) -> Self {
        Self {
            header: ChunkHeader {
                chunk_length: (CHUNK_HEADER_SIZE + payload.len()) as u32,
                chunk_x: ChunkX::follow(index),
                message_id,
                message_length: None,
            },
            payload,
        }
    }

    #[inline]
    #[must_use]
    pub fn message_id(&self) -> u64 {
        self.header.message_id
    }

    #[inline]
    #[must_use]
    pub fn is_first(&self) -> bool {
        self.header.chunk_x.is_first()
    }

    #[inline]
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.header.chunk_length as usize
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        self.header.encode_into(buf);
        buf.extend_from_slice(&self.payload);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.to_vec()
    }
}

/// Split one message payload into chunks carrying at most `chunk_size`
/// payload bytes each.
pub fn encode_message(message_id: u64, payload: &Bytes, chunk_size: usize) -> Result<Vec<Chunk>> {
    if payload.is_empty() {
        return Err(VstError::EmptyMessage);
    }
    validate_chunk_size(chunk_size)?;

    let total = payload.len().div_ceil(chunk_size) as u64;
    if total > MAX_CHUNKS {
        return Err(VstError::Config(format!(
            "message of {} bytes needs {} chunks of {} bytes, limit is {}",
            payload.len(),
            total,
            chunk_size,
            MAX_CHUNKS
        )));
    }

    let message_length = payload.len() as u64;
    let chunks = (0..payload.len())
        .step_by(chunk_size)
        .enumerate()
        .map(|(index, start)| {
            let end = (start + chunk_size).min(payload.len());
            let slice = payload.slice(start..end);
            if index == 0 {
                Chunk::first(message_id, total as u32, message_length, slice)
            } else {
                Chunk::follow(message_id, index as u32, slice)
            }
        })
        .collect();

    Ok(chunks)
}

/// Serialise the chunks of one message into a single contiguous buffer so
/// they can be written with one call.
pub fn encode_chunks(chunks: &[Chunk]) -> BytesMut {
    let total: usize = chunks.iter().map(Chunk::encoded_len).sum();
    let mut buf = BytesMut::with_capacity(total);
    for chunk in chunks {
        chunk.encode_into(&mut buf);
    }
    buf
}

/// Decode one chunk from the front of `buf`, returning it with the number of
/// bytes consumed. `Ok(None)` means the chunk is not complete yet.
pub fn parse_chunk(buf: &[u8]) -> Result<Option<(Chunk, usize)>> {
    let Some(header) = ChunkHeader::parse(buf)? else {
        return Ok(None);
    };

    let total_len = header.chunk_length as usize;
    if buf.len() < total_len {
        return Ok(None);
    }

    let payload = Bytes::copy_from_slice(&buf[header.size()..total_len]);
    Ok(Some((Chunk { header, payload }, total_len)))
}

pub fn validate_chunk_size(chunk_size: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(VstError::Config("chunk size must be greater than zero".into()));
    }
    if chunk_size > u32::MAX as usize - FIRST_CHUNK_HEADER_SIZE {
        return Err(VstError::Config(format!(
            "chunk size {} does not fit a u32 chunk length",
            chunk_size
        )));
    }
    Ok(())
}

#[inline]
fn read_u64(buf: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[..8]);
    u64::from_le_bytes(bytes)
}
