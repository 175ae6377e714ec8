#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod error;
mod host;

pub use error::{Result, VstError};
pub use host::Host;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8529;

/// Maximum payload bytes carried by a single chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 30_000;
pub const DEFAULT_MAX_CONNECTIONS: usize = 1;

/// Sent once by the client right after the transport is opened.
pub const VST_PREAMBLE: &[u8] = b"VST/1.0\r\n\r\n";

pub const SYSTEM_DATABASE: &str = "_system";
pub const PATH_ENDPOINTS: &str = "/_api/cluster/endpoints";
