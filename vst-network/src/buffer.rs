use bytes::BytesMut;

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Receive buffer for a connection's read half. Bytes are appended as they
/// arrive and consumed from the front once a whole chunk has been parsed.
pub struct ChunkBuffer {
    buffer: BytesMut,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn consume(&mut self, len: usize) {
        if len >= self.buffer.len() {
            self.buffer.clear();
        } else {
            let _ = self.buffer.split_to(len);
        }
    }

    /// Shrink the buffer back to its default size after a burst of large
    /// chunks has been drained.
    pub fn compact(&mut self) {
        if self.buffer.capacity() > DEFAULT_BUFFER_SIZE * 4
            && self.buffer.len() < DEFAULT_BUFFER_SIZE
        {
            let mut new_buffer = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);
            new_buffer.extend_from_slice(&self.buffer);
            self.buffer = new_buffer;
        }
    }

    /// Spare space for the next socket read, growing the buffer when fewer
    /// than `min_size` bytes are free.
    pub fn read_buf(&mut self, min_size: usize) -> &mut BytesMut {
        if self.buffer.capacity() - self.buffer.len() < min_size {
            self.buffer.reserve(min_size);
        }
        &mut self.buffer
    }

    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[..]
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for ChunkBuffer {
    fn default() -> Self {
        Self::new()
    }
}
