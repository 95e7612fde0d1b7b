use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::message::{OpContents, SequencedOp, SummaryProposal};

/// A summarize op observed on the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummarizeRecord {
    /// Position the op was assigned on the stream.
    pub sequence_number: u64,
    /// Position the summary was taken against.
    pub reference_sequence_number: u64,
    pub client_sequence_number: u64,
    pub client_id: String,
    pub timestamp_ms: u64,
    /// Storage handle of the uploaded summary tree.
    pub handle: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryAckRecord {
    pub sequence_number: u64,
    /// Storage handle of the committed summary.
    pub handle: String,
    pub summary_sequence_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryNackRecord {
    pub sequence_number: u64,
    pub error_message: Option<String>,
    pub summary_sequence_number: u64,
}

/// Adjudication of one proposal, discriminated by message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SummaryAckNack {
    Ack(SummaryAckRecord),
    Nack(SummaryNackRecord),
}

impl SummaryAckNack {
    pub fn is_ack(&self) -> bool {
        matches!(self, SummaryAckNack::Ack(_))
    }
}

/// A committed summary: the broadcast proposal together with its ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckedSummary {
    pub summarize: SummarizeRecord,
    pub ack: SummaryAckRecord,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchError {
    #[error("summary collection disposed")]
    Disposed,
}

type WatchKey = (String, u64);

/// Per-proposal state shared between the collection maps and any
/// [`WatchedSummary`] handed out for it. The maps drop their reference once
/// the proposal is adjudicated; a live watcher keeps resolving through its
/// own handle.
#[derive(Default)]
struct Proposal {
    broadcast: Option<SummarizeRecord>,
    outcome: Option<SummaryAckNack>,
    /// Set once a `WatchedSummary` has been handed out for this proposal.
    watched: bool,
    broadcast_waiters: Vec<oneshot::Sender<SummarizeRecord>>,
    outcome_waiters: Vec<oneshot::Sender<SummaryAckNack>>,
}

type SharedProposal = Arc<Mutex<Proposal>>;

/// A broadcast proposal awaiting its ack/nack.
struct PendingProposal {
    key: WatchKey,
    proposal: SharedProposal,
    /// Broadcast timestamp, for the by-ops ack-wait fallback.
    timestamp_ms: u64,
}

struct AckTimeout {
    window_ms: u64,
    callback: Box<dyn Fn() + Send + Sync>,
}

#[derive(Default)]
struct CollectionState {
    /// Proposals not yet adjudicated (or adjudicated before their watcher
    /// claimed them), keyed by originator. Entries are dropped once the
    /// ack/nack is observed; an unclaimed local proposal is dropped when
    /// `watch_summary` claims it.
    proposals: HashMap<WatchKey, SharedProposal>,
    /// Broadcast proposals not yet adjudicated, keyed by their own stream
    /// position (the position acks/nacks point back to).
    pending: HashMap<u64, PendingProposal>,
    /// Clients with an active watcher; their adjudicated proposals are held
    /// for the watcher to claim instead of being dropped outright.
    watched_clients: HashSet<String>,
    latest_ack: Option<AckedSummary>,
    ack_waiters: Vec<(u64, oneshot::Sender<AckedSummary>)>,
    flush_waiters: Vec<oneshot::Sender<Option<AckedSummary>>>,
    ack_timeout: Option<AckTimeout>,
    disposed: bool,
}

/// Multiplexer over the ordered stream for summarize / summary-ack /
/// summary-nack traffic.
///
/// Tracks every broadcast proposal (from any client) until its ack or nack is
/// observed, then clears it, and resolves per-proposal futures handed out
/// through [`SummaryWatcher`]. An ack or nack can only resolve through a
/// previously observed broadcast, so for any proposal the broadcast future
/// resolves strictly before the ack/nack future.
#[derive(Clone, Default)]
pub struct SummaryCollection {
    state: Arc<Mutex<CollectionState>>,
}

impl SummaryCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingests one op from the inbound stream. Ops other than summarize /
    /// ack / nack only feed the pending-ack timestamp fallback.
    pub fn handle_op(&self, op: &SequencedOp) {
        match &op.contents {
            OpContents::Summarize { handle } => self.handle_summarize(op, handle),
            OpContents::SummaryAck {
                handle,
                summary_proposal,
            } => self.handle_ack(op, handle, summary_proposal),
            OpContents::SummaryNack {
                error_message,
                summary_proposal,
            } => self.handle_nack(op, error_message.clone(), summary_proposal),
            _ => {}
        }
        self.check_ack_timeout(op.timestamp_ms);
    }

    fn handle_summarize(&self, op: &SequencedOp, handle: &str) {
        let Some(client_id) = op.client_id.clone() else {
            tracing::warn!(seq = op.sequence_number, "summarize op without a client id");
            return;
        };
        let record = SummarizeRecord {
            sequence_number: op.sequence_number,
            reference_sequence_number: op.reference_sequence_number,
            client_sequence_number: op.client_sequence_number,
            client_id: client_id.clone(),
            timestamp_ms: op.timestamp_ms,
            handle: handle.to_string(),
        };
        tracing::trace!(
            seq = record.sequence_number,
            ref_seq = record.reference_sequence_number,
            client_id = %record.client_id,
            "summarize op observed"
        );
        let mut state = self.state.lock();
        let key = (client_id, op.client_sequence_number);
        let shared = state.proposals.entry(key.clone()).or_default().clone();
        state.pending.insert(
            op.sequence_number,
            PendingProposal {
                key,
                proposal: shared.clone(),
                timestamp_ms: op.timestamp_ms,
            },
        );
        let mut proposal = shared.lock();
        for waiter in proposal.broadcast_waiters.drain(..) {
            let _ = waiter.send(record.clone());
        }
        proposal.broadcast = Some(record);
    }

    fn handle_ack(&self, op: &SequencedOp, handle: &str, proposal_ref: &SummaryProposal) {
        let ack = SummaryAckRecord {
            sequence_number: op.sequence_number,
            handle: handle.to_string(),
            summary_sequence_number: proposal_ref.summary_sequence_number,
        };
        let mut state = self.state.lock();
        let Some(summarize) =
            Self::adjudicate(&mut state, proposal_ref, SummaryAckNack::Ack(ack.clone()))
        else {
            return;
        };
        let acked = AckedSummary { summarize, ack };
        state.latest_ack = Some(acked.clone());
        let waiters = std::mem::take(&mut state.ack_waiters);
        for (ref_seq, waiter) in waiters {
            if acked.summarize.reference_sequence_number >= ref_seq {
                let _ = waiter.send(acked.clone());
            } else {
                state.ack_waiters.push((ref_seq, waiter));
            }
        }
        Self::notify_flushed(&mut state);
    }

    fn handle_nack(
        &self,
        op: &SequencedOp,
        error_message: Option<String>,
        proposal_ref: &SummaryProposal,
    ) {
        let nack = SummaryNackRecord {
            sequence_number: op.sequence_number,
            error_message,
            summary_sequence_number: proposal_ref.summary_sequence_number,
        };
        let mut state = self.state.lock();
        if Self::adjudicate(&mut state, proposal_ref, SummaryAckNack::Nack(nack)).is_some() {
            Self::notify_flushed(&mut state);
        }
    }

    /// Resolves the pending proposal the ack/nack points back to and clears
    /// its bookkeeping. Returns the broadcast record, or `None` for an
    /// unknown proposal (warned and dropped). An adjudicated proposal a local
    /// watcher has not claimed yet is held until `watch_summary` claims it.
    fn adjudicate(
        state: &mut CollectionState,
        proposal_ref: &SummaryProposal,
        outcome: SummaryAckNack,
    ) -> Option<SummarizeRecord> {
        let Some(pending) = state.pending.remove(&proposal_ref.summary_sequence_number) else {
            tracing::warn!(
                summary_seq = proposal_ref.summary_sequence_number,
                ack = outcome.is_ack(),
                "ack/nack for unknown summary proposal"
            );
            return None;
        };
        let (broadcast, watched) = {
            let mut proposal = pending.proposal.lock();
            for waiter in proposal.outcome_waiters.drain(..) {
                let _ = waiter.send(outcome.clone());
            }
            proposal.outcome = Some(outcome);
            (proposal.broadcast.clone(), proposal.watched)
        };
        if watched || !state.watched_clients.contains(&pending.key.0) {
            state.proposals.remove(&pending.key);
        }
        broadcast
    }

    fn notify_flushed(state: &mut CollectionState) {
        if !state.pending.is_empty() {
            return;
        }
        let latest = state.latest_ack.clone();
        for waiter in state.flush_waiters.drain(..) {
            let _ = waiter.send(latest.clone());
        }
    }

    fn check_ack_timeout(&self, now_ms: u64) {
        let callback = {
            let mut state = self.state.lock();
            let Some(timeout) = state.ack_timeout.as_ref() else {
                return;
            };
            let Some(oldest) = state.pending.values().map(|p| p.timestamp_ms).min() else {
                return;
            };
            if now_ms.saturating_sub(oldest) <= timeout.window_ms {
                return;
            }
            // Fires at most once per installed window.
            state.ack_timeout.take()
        };
        if let Some(timeout) = callback {
            tracing::debug!("pending summary ack exceeded the op-timestamp window");
            (timeout.callback)();
        }
    }

    /// Installs the startup fallback fired when the gap between the oldest
    /// unadjudicated proposal's timestamp and the latest observed op
    /// timestamp exceeds `max_ack_wait`.
    pub fn set_pending_ack_timer_timeout_callback(
        &self,
        max_ack_wait: Duration,
        callback: impl Fn() + Send + Sync + 'static,
    ) {
        self.state.lock().ack_timeout = Some(AckTimeout {
            window_ms: max_ack_wait.as_millis() as u64,
            callback: Box::new(callback),
        });
    }

    pub fn unset_pending_ack_timer_timeout_callback(&self) {
        self.state.lock().ack_timeout = None;
    }

    /// Scopes subsequent `watch_summary` calls to proposals originated by
    /// this client.
    pub fn create_watcher(&self, client_id: impl Into<String>) -> SummaryWatcher {
        let client_id = client_id.into();
        self.state.lock().watched_clients.insert(client_id.clone());
        SummaryWatcher {
            client_id,
            collection: self.clone(),
        }
    }

    /// Resolves once every observed proposal has been adjudicated, with the
    /// latest acked summary (`None` if no ack has been observed yet).
    pub async fn wait_flushed(&self) -> Result<Option<AckedSummary>, WatchError> {
        let receiver = {
            let mut state = self.state.lock();
            if state.disposed {
                return Err(WatchError::Disposed);
            }
            if state.pending.is_empty() {
                return Ok(state.latest_ack.clone());
            }
            let (tx, rx) = oneshot::channel();
            state.flush_waiters.push(tx);
            rx
        };
        receiver.await.map_err(|_| WatchError::Disposed)
    }

    /// Resolves with the next ack whose proposal references a position at or
    /// past `ref_sequence_number` (immediately if the latest observed ack
    /// already qualifies).
    pub async fn wait_summary_ack(
        &self,
        ref_sequence_number: u64,
    ) -> Result<AckedSummary, WatchError> {
        let receiver = {
            let mut state = self.state.lock();
            if state.disposed {
                return Err(WatchError::Disposed);
            }
            if let Some(latest) = &state.latest_ack {
                if latest.summarize.reference_sequence_number >= ref_sequence_number {
                    return Ok(latest.clone());
                }
            }
            let (tx, rx) = oneshot::channel();
            state.ack_waiters.push((ref_sequence_number, tx));
            rx
        };
        receiver.await.map_err(|_| WatchError::Disposed)
    }

    /// Drops every waiter; their futures resolve as disposed. Idempotent.
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;
        state.ack_waiters.clear();
        state.flush_waiters.clear();
        state.ack_timeout = None;
        for shared in state.proposals.values() {
            let mut proposal = shared.lock();
            proposal.broadcast_waiters.clear();
            proposal.outcome_waiters.clear();
        }
        state.proposals.clear();
        state.pending.clear();
    }
}

/// Per-client view over the collection.
pub struct SummaryWatcher {
    client_id: String,
    collection: SummaryCollection,
}

impl SummaryWatcher {
    /// Registers interest in the proposal that will be broadcast with this
    /// local client sequence number. Registration may precede or follow the
    /// broadcast; a proposal already adjudicated is claimed out of the
    /// collection and resolves from the watcher's own handle.
    pub fn watch_summary(&self, client_sequence_number: u64) -> WatchedSummary {
        let key = (self.client_id.clone(), client_sequence_number);
        let mut state = self.collection.state.lock();
        let shared = state.proposals.entry(key.clone()).or_default().clone();
        let adjudicated = {
            let mut proposal = shared.lock();
            proposal.watched = true;
            proposal.outcome.is_some()
        };
        if adjudicated {
            state.proposals.remove(&key);
        }
        WatchedSummary {
            proposal: shared,
            collection: self.collection.clone(),
        }
    }

    /// See [`SummaryCollection::wait_flushed`].
    pub async fn wait_flushed(&self) -> Result<Option<AckedSummary>, WatchError> {
        self.collection.wait_flushed().await
    }

    /// Drops this client's proposals and their waiters.
    pub fn dispose(&self) {
        let mut state = self.collection.state.lock();
        state.watched_clients.remove(&self.client_id);
        state.proposals.retain(|(client_id, _), shared| {
            if client_id == &self.client_id {
                let mut proposal = shared.lock();
                proposal.broadcast_waiters.clear();
                proposal.outcome_waiters.clear();
                false
            } else {
                true
            }
        });
    }
}

/// One watched proposal. Holds the proposal state directly, so it keeps
/// resolving after the collection has cleared its bookkeeping.
pub struct WatchedSummary {
    proposal: SharedProposal,
    collection: SummaryCollection,
}

impl WatchedSummary {
    /// Resolves with the summarize op once it appears on the inbound stream.
    pub async fn wait_broadcast(&self) -> Result<SummarizeRecord, WatchError> {
        let receiver = {
            if self.collection.state.lock().disposed {
                return Err(WatchError::Disposed);
            }
            let mut proposal = self.proposal.lock();
            if let Some(broadcast) = &proposal.broadcast {
                return Ok(broadcast.clone());
            }
            let (tx, rx) = oneshot::channel();
            proposal.broadcast_waiters.push(tx);
            rx
        };
        receiver.await.map_err(|_| WatchError::Disposed)
    }

    /// Resolves with the matching ack or nack. Resolves at most once, and
    /// never before the matching broadcast has been observed.
    pub async fn wait_ack_nack(&self) -> Result<SummaryAckNack, WatchError> {
        let receiver = {
            if self.collection.state.lock().disposed {
                return Err(WatchError::Disposed);
            }
            let mut proposal = self.proposal.lock();
            if let Some(outcome) = &proposal.outcome {
                return Ok(outcome.clone());
            }
            let (tx, rx) = oneshot::channel();
            proposal.outcome_waiters.push(tx);
            rx
        };
        receiver.await.map_err(|_| WatchError::Disposed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering::SeqCst};

    fn summarize_op(seq: u64, client_id: &str, client_seq: u64, ref_seq: u64) -> SequencedOp {
        SequencedOp {
            sequence_number: seq,
            client_sequence_number: client_seq,
            client_id: Some(client_id.to_string()),
            reference_sequence_number: ref_seq,
            timestamp_ms: seq * 100,
            contents: OpContents::Summarize {
                handle: format!("proposal-{seq}"),
            },
        }
    }

    fn ack_op(seq: u64, summary_seq: u64) -> SequencedOp {
        SequencedOp {
            sequence_number: seq,
            timestamp_ms: seq * 100,
            contents: OpContents::SummaryAck {
                handle: format!("ack-{seq}"),
                summary_proposal: SummaryProposal {
                    summary_sequence_number: summary_seq,
                },
            },
            ..Default::default()
        }
    }

    fn nack_op(seq: u64, summary_seq: u64, error: &str) -> SequencedOp {
        SequencedOp {
            sequence_number: seq,
            timestamp_ms: seq * 100,
            contents: OpContents::SummaryNack {
                error_message: Some(error.to_string()),
                summary_proposal: SummaryProposal {
                    summary_sequence_number: summary_seq,
                },
            },
            ..Default::default()
        }
    }

    fn tracked_proposals(collection: &SummaryCollection) -> usize {
        collection.state.lock().proposals.len()
    }

    #[tokio::test]
    async fn broadcast_resolves_before_ack_nack() {
        let collection = SummaryCollection::new();
        let watcher = collection.create_watcher("client-a");
        let watched = watcher.watch_summary(1);

        collection.handle_op(&summarize_op(11, "client-a", 1, 10));
        let broadcast = watched.wait_broadcast().await.unwrap();
        assert_eq!(broadcast.sequence_number, 11);
        assert_eq!(broadcast.handle, "proposal-11");

        collection.handle_op(&ack_op(12, 11));
        let outcome = watched.wait_ack_nack().await.unwrap();
        match outcome {
            SummaryAckNack::Ack(ack) => {
                assert_eq!(ack.summary_sequence_number, 11);
                assert_eq!(ack.handle, "ack-12");
            }
            SummaryAckNack::Nack(_) => panic!("expected an ack"),
        }
        // The adjudicated proposal is cleared from the collection.
        assert_eq!(tracked_proposals(&collection), 0);
    }

    #[tokio::test]
    async fn late_watch_claims_an_already_adjudicated_proposal() {
        let collection = SummaryCollection::new();
        let watcher = collection.create_watcher("client-a");
        collection.handle_op(&summarize_op(11, "client-a", 1, 10));
        collection.handle_op(&nack_op(12, 11, "stale"));

        let watched = watcher.watch_summary(1);
        assert_eq!(watched.wait_broadcast().await.unwrap().sequence_number, 11);
        match watched.wait_ack_nack().await.unwrap() {
            SummaryAckNack::Nack(nack) => {
                assert_eq!(nack.error_message.as_deref(), Some("stale"))
            }
            SummaryAckNack::Ack(_) => panic!("expected a nack"),
        }
        // Claiming removed the held entry.
        assert_eq!(tracked_proposals(&collection), 0);
    }

    #[tokio::test]
    async fn other_clients_proposals_are_cleared_on_adjudication() {
        let collection = SummaryCollection::new();
        let _watcher = collection.create_watcher("client-a");
        for round in 0..10 {
            let summarize_seq = 100 + round * 2;
            collection.handle_op(&summarize_op(summarize_seq, "client-b", round, 50));
            collection.handle_op(&ack_op(summarize_seq + 1, summarize_seq));
        }
        assert_eq!(tracked_proposals(&collection), 0);
    }

    #[tokio::test]
    async fn ack_for_unknown_proposal_is_dropped() {
        let collection = SummaryCollection::new();
        collection.handle_op(&ack_op(12, 11));
        let watched = collection.create_watcher("client-a").watch_summary(1);
        collection.handle_op(&summarize_op(13, "client-a", 1, 10));
        // The stray ack resolved nothing; the proposal is still pending.
        assert_eq!(watched.wait_broadcast().await.unwrap().sequence_number, 13);
        collection.handle_op(&ack_op(14, 13));
        assert!(watched.wait_ack_nack().await.unwrap().is_ack());
    }

    #[tokio::test]
    async fn wait_flushed_returns_latest_ack_once_nothing_pending() {
        let collection = SummaryCollection::new();
        // Nothing observed yet: immediate, no ack.
        assert_eq!(collection.wait_flushed().await.unwrap(), None);

        collection.handle_op(&summarize_op(11, "client-a", 1, 10));
        let pending = {
            let collection = collection.clone();
            tokio::spawn(async move { collection.wait_flushed().await })
        };
        collection.handle_op(&ack_op(12, 11));
        let flushed = pending.await.unwrap().unwrap().unwrap();
        assert_eq!(flushed.summarize.sequence_number, 11);
        assert_eq!(flushed.ack.handle, "ack-12");
    }

    #[tokio::test]
    async fn wait_summary_ack_filters_by_reference_position() {
        let collection = SummaryCollection::new();
        collection.handle_op(&summarize_op(11, "client-a", 1, 10));
        collection.handle_op(&ack_op(12, 11));

        // Latest ack already qualifies.
        let acked = collection.wait_summary_ack(5).await.unwrap();
        assert_eq!(acked.summarize.reference_sequence_number, 10);

        // A later position must wait for the next qualifying ack.
        let waiting = {
            let collection = collection.clone();
            tokio::spawn(async move { collection.wait_summary_ack(11).await })
        };
        collection.handle_op(&summarize_op(21, "client-a", 2, 20));
        collection.handle_op(&ack_op(22, 21));
        let acked = waiting.await.unwrap().unwrap();
        assert_eq!(acked.summarize.reference_sequence_number, 20);
    }

    #[tokio::test]
    async fn pending_ack_fallback_fires_once_on_op_timestamp_gap() {
        let collection = SummaryCollection::new();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        collection.set_pending_ack_timer_timeout_callback(Duration::from_millis(500), move || {
            counter.fetch_add(1, SeqCst);
        });

        collection.handle_op(&summarize_op(11, "client-a", 1, 10));
        // Within the window.
        collection.handle_op(&SequencedOp {
            sequence_number: 12,
            timestamp_ms: 11 * 100 + 400,
            ..Default::default()
        });
        assert_eq!(fired.load(SeqCst), 0);
        // Past the window: fires exactly once.
        collection.handle_op(&SequencedOp {
            sequence_number: 13,
            timestamp_ms: 11 * 100 + 600,
            ..Default::default()
        });
        collection.handle_op(&SequencedOp {
            sequence_number: 14,
            timestamp_ms: 11 * 100 + 700,
            ..Default::default()
        });
        assert_eq!(fired.load(SeqCst), 1);
    }

    #[tokio::test]
    async fn dispose_resolves_waiters_as_disposed() {
        let collection = SummaryCollection::new();
        let watched = collection.create_watcher("client-a").watch_summary(1);
        let pending = {
            let collection = collection.clone();
            tokio::spawn(async move { collection.wait_summary_ack(0).await })
        };
        let broadcast = tokio::spawn(async move { watched.wait_broadcast().await });
        tokio::task::yield_now().await;
        collection.dispose();
        assert_eq!(pending.await.unwrap(), Err(WatchError::Disposed));
        assert_eq!(broadcast.await.unwrap(), Err(WatchError::Disposed));
    }

    #[tokio::test]
    async fn watcher_dispose_drops_its_clients_proposals() {
        let collection = SummaryCollection::new();
        let watcher = collection.create_watcher("client-a");
        let _watched = watcher.watch_summary(1);
        collection.handle_op(&summarize_op(11, "client-a", 2, 10));
        assert_eq!(tracked_proposals(&collection), 2);
        watcher.dispose();
        assert_eq!(tracked_proposals(&collection), 0);
    }
}
