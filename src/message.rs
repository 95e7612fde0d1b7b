//! Wire-visible message model for the ordered delta stream.

/// Back-reference from an ack/nack to the stream position the summarize op
/// itself was assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryProposal {
    pub summary_sequence_number: u64,
}

/// Typed contents of a sequenced op, discriminating the message types the
/// summarizer reacts to. Ordinary document traffic is opaque `Operation`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OpContents {
    #[default]
    Operation,
    Save {
        contents: String,
    },
    ClientJoin {
        client_id: String,
    },
    ClientLeave {
        client_id: String,
    },
    Propose,
    Reject,
    Summarize {
        /// Storage handle of the uploaded summary tree.
        handle: String,
    },
    SummaryAck {
        /// Storage handle of the committed summary.
        handle: String,
        summary_proposal: SummaryProposal,
    },
    SummaryNack {
        error_message: Option<String>,
        summary_proposal: SummaryProposal,
    },
}

/// An op as delivered by the ordering service.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SequencedOp {
    /// Position assigned by the ordering service.
    pub sequence_number: u64,
    /// Submission id assigned by the sending client, used to correlate a
    /// submitted op with its stream echo.
    pub client_sequence_number: u64,
    /// Originating client; `None` for server-generated messages.
    pub client_id: Option<String>,
    /// The stream position the op was made against.
    pub reference_sequence_number: u64,
    /// Ordering-service wall clock, epoch milliseconds.
    pub timestamp_ms: u64,
    pub contents: OpContents,
}

impl SequencedOp {
    /// Quorum ops are membership/consensus traffic: join, leave, propose,
    /// reject.
    pub fn is_quorum(&self) -> bool {
        matches!(
            self.contents,
            OpContents::ClientJoin { .. }
                | OpContents::ClientLeave { .. }
                | OpContents::Propose
                | OpContents::Reject
        )
    }
}
