//! Host runtime surface the summarizer consumes.

use std::sync::Arc;

use tokio::sync::watch;

use crate::message::SequencedOp;

/// One inbound stream delivery. `error` mirrors the host's batch-end pair;
/// ops carrying an error are dropped by the summarizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpEvent {
    pub error: Option<String>,
    pub op: SequencedOp,
}

impl OpEvent {
    pub fn op(op: SequencedOp) -> Self {
        Self { error: None, op }
    }
}

/// The ordering-service connection as seen by the parent client.
pub trait DeltaManager: Send + Sync {
    /// The stream position the parent client joined at.
    fn initial_sequence_number(&self) -> u64;
    /// Latest position observed on the stream.
    fn last_sequence_number(&self) -> u64;
    /// Whether this client may write to the stream.
    fn active(&self) -> bool;
    /// Subscribes to the inbound op stream.
    fn subscribe(&self) -> async_channel::Receiver<OpEvent>;
}

/// The embedding runtime.
pub trait SummarizerRuntime: Send + Sync {
    /// This client's id, once connected.
    fn client_id(&self) -> Option<String>;
    /// The elected summarizer's client id, if one is computed.
    fn summarizer_client_id(&self) -> Option<String>;
    fn delta_manager(&self) -> Arc<dyn DeltaManager>;
    /// Connection signal: the connected client id, `None` while disconnected.
    fn connection(&self) -> watch::Receiver<Option<String>>;
    /// Terminates the parent container.
    fn close(&self);
}
