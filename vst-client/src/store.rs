//! In-flight request correlation
//!
//! Every message sent on a connection is registered here under its message id
//! before the first chunk hits the socket. The connection's reader completes
//! entries as responses are reassembled; a dying connection fails whatever is
//! left.

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::trace;
use vst_network::Message;

use crate::error::{ClientError, Result, TransportError};

pub type ResponseReceiver = oneshot::Receiver<Result<Message>>;

/// Why every pending entry of a connection is being failed.
#[derive(Debug, Clone)]
pub enum FailureKind {
    ConnectionLost(String),
    Protocol(String),
}

impl FailureKind {
    fn to_error(&self) -> ClientError {
        match self {
            Self::ConnectionLost(reason) => {
                ClientError::Transport(TransportError::ConnectionLost(reason.clone()))
            },
            Self::Protocol(reason) => ClientError::Protocol(reason.clone()),
        }
    }
}

#[derive(Default)]
pub struct MessageStore {
    pending: DashMap<u64, oneshot::Sender<Result<Message>>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, message_id: u64) -> ResponseReceiver {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(message_id, tx);
        rx
    }

    /// Hand a reassembled message to its waiter. Returns false when nobody was
    /// waiting, e.g. a late response for a request that already timed out.
    pub fn complete(&self, message: Message) -> bool {
        let Some((_, tx)) = self.pending.remove(&message.id) else {
            trace!(message_id = message.id, "No pending request for message");
            return false;
        };
        // Receiver may have been dropped by a cancelled caller.
        let _ = tx.send(Ok(message));
        true
    }

    /// Fail every pending entry; returns how many were failed.
    pub fn fail_all(&self, kind: &FailureKind) -> usize {
        let keys: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for key in keys {
            if let Some((_, tx)) = self.pending.remove(&key) {
                let _ = tx.send(Err(kind.to_error()));
                failed += 1;
            }
        }
        failed
    }

    /// Forget an entry without resolving it.
    pub fn remove(&self, message_id: u64) {
        self.pending.remove(&message_id);
    }

    pub fn contains(&self, message_id: u64) -> bool {
        self.pending.contains_key(&message_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
