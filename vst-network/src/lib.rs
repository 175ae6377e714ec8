#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

mod assembler;
mod buffer;
mod chunk;
pub mod tls;

pub use assembler::{Message, MessageAssembler};
pub use buffer::ChunkBuffer;
pub use chunk::{
    CHUNK_HEADER_SIZE, Chunk, ChunkHeader, ChunkX, FIRST_CHUNK_HEADER_SIZE, encode_chunks,
    encode_message, parse_chunk, validate_chunk_size,
};
pub use tls::{TlsConfig, TlsConnector, TlsError, TlsResult};
