use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::coordinator::StopReason;
use crate::error::{SummarizeError, SummarizingWarning};
use crate::generator::{SummarizeOptions, SummaryGenerator};
use crate::heuristics::{SummarizeReason, SummaryAttempt, SummaryConfiguration, SummaryHeuristics};
use crate::message::{OpContents, SequencedOp};
use crate::summary_collection::{SummaryAckNack, SummaryCollection, SummaryWatcher};
use crate::timer::{PromiseTimer, TimerOutcome};

/// Receives warnings raised on attempt failures. Must not block.
pub type RaiseWarningFn = Arc<dyn Fn(SummarizingWarning) + Send + Sync>;
/// Asks the host to stop the run.
pub type StopHostFn = Arc<dyn Fn(StopReason) + Send + Sync>;

/// Upper bound on the configured ack-wait window.
const MAX_ACK_WAIT: Duration = Duration::from_secs(120);
/// Op lag past which `wait_stop` takes a best-effort final summary.
const LAST_SUMMARY_OP_LAG: u64 = 50;
/// Long-summarize telemetry: first warning delay, doubling afterwards.
const SUMMARIZE_WARNING_DELAY: Duration = Duration::from_secs(20);
const MAX_SUMMARIZE_WARNINGS: u32 = 5;

#[derive(Default)]
struct FlightState {
    /// Completion signal of the in-flight attempt chain; present iff one is
    /// running. Doubles as the single-flight mutex.
    summarizing: Option<watch::Receiver<bool>>,
    /// Coalesces triggers arriving while an attempt chain is in flight.
    try_while_summarizing: bool,
    stopping: bool,
    disposed: bool,
    summarize_count: u64,
    watchdog: Option<CancellationToken>,
}

/// The hot subsystem: owns the heuristics, runs the three-attempt protocol
/// and enforces that at most one attempt chain is in flight.
pub struct RunningSummarizer {
    client_id: String,
    on_behalf_of_client_id: String,
    heuristics: SummaryHeuristics,
    watcher: SummaryWatcher,
    collection: SummaryCollection,
    generator: Arc<dyn SummaryGenerator>,
    pending_ack_timer: PromiseTimer,
    raise_warning: RaiseWarningFn,
    stop_host: StopHostFn,
    state: Mutex<FlightState>,
}

impl RunningSummarizer {
    /// Constructs the summarizer, synchronizes with the latest acked summary
    /// and seeds the first heuristic tick.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        client_id: impl Into<String>,
        on_behalf_of_client_id: impl Into<String>,
        configuration: SummaryConfiguration,
        collection: SummaryCollection,
        generator: Arc<dyn SummaryGenerator>,
        last_op_seq_number: u64,
        first_attempt: SummaryAttempt,
        raise_warning: RaiseWarningFn,
        stop_host: StopHostFn,
    ) -> Arc<Self> {
        let client_id = client_id.into();
        let ack_wait = configuration.max_ack_wait_time.min(MAX_ACK_WAIT);
        let (trigger_tx, mut trigger_rx) = mpsc::unbounded_channel();
        let heuristics =
            SummaryHeuristics::new(configuration, first_attempt, last_op_seq_number, trigger_tx);
        let watcher = collection.create_watcher(client_id.clone());
        let summarizer = Arc::new(Self {
            client_id,
            on_behalf_of_client_id: on_behalf_of_client_id.into(),
            heuristics,
            watcher,
            collection,
            generator,
            pending_ack_timer: PromiseTimer::new(ack_wait),
            raise_warning,
            stop_host,
            state: Mutex::new(FlightState::default()),
        });

        // Heuristic and timer triggers post back through this queue so they
        // never mutate flight state from a timer task.
        let weak = Arc::downgrade(&summarizer);
        tokio::spawn(async move {
            while let Some(reason) = trigger_rx.recv().await {
                match weak.upgrade() {
                    Some(summarizer) => summarizer.trigger(reason),
                    None => break,
                }
            }
        });

        summarizer.wait_start(ack_wait).await;
        summarizer.heuristics.run();
        summarizer
    }

    /// Waits (no longer than the ack window) for outstanding proposals to be
    /// adjudicated, then installs the latest observed ack.
    async fn wait_start(&self, ack_wait: Duration) {
        let timer = self.pending_ack_timer.clone();
        self.collection
            .set_pending_ack_timer_timeout_callback(ack_wait, move || timer.clear());

        let timeout = self.pending_ack_timer.start();
        tokio::pin!(timeout);
        select! {
            flushed = self.watcher.wait_flushed() => {
                self.pending_ack_timer.clear();
                if let Ok(Some(acked)) = flushed {
                    tracing::debug!(
                        ref_seq = acked.summarize.reference_sequence_number,
                        summary_seq = acked.summarize.sequence_number,
                        "resuming from latest acked summary"
                    );
                    self.heuristics.initialize(SummaryAttempt {
                        ref_sequence_number: acked.summarize.reference_sequence_number,
                        summary_time: Instant::now(),
                        summary_sequence_number: Some(acked.summarize.sequence_number),
                    });
                }
            }
            _ = &mut timeout => {
                tracing::debug!("gave up waiting for outstanding summary acks");
            }
        }
        self.collection.unset_pending_ack_timer_timeout_callback();
    }

    /// Handles one op from the inbound stream.
    pub fn handle_op(self: &Arc<Self>, error: Option<&str>, op: &SequencedOp) {
        if let Some(error) = error {
            tracing::trace!(error, seq = op.sequence_number, "dropping errored op");
            return;
        }
        self.heuristics.set_last_op_seq_number(op.sequence_number);
        if let OpContents::Save { contents } = &op.contents {
            self.trigger(SummarizeReason::Save {
                client_id: op.client_id.clone().unwrap_or_default(),
                contents: contents.clone(),
            });
            return;
        }
        let deferred = {
            let mut state = self.state.lock();
            if state.summarizing.is_some() {
                // Coalesced into one follow-up evaluation after completion.
                state.try_while_summarizing = true;
                true
            } else {
                false
            }
        };
        if !deferred {
            self.heuristics.run();
        }
    }

    /// Handles a system op. Leave ops for this client or the parent are
    /// ignored so no farewell summary is generated for our own departure.
    pub fn handle_system_op(self: &Arc<Self>, op: &SequencedOp) {
        match &op.contents {
            OpContents::ClientLeave { client_id } => {
                if client_id == &self.client_id || client_id == &self.on_behalf_of_client_id {
                    return;
                }
                self.handle_op(None, op);
            }
            OpContents::ClientJoin { .. } | OpContents::Propose | OpContents::Reject => {
                self.handle_op(None, op);
            }
            _ => {}
        }
    }

    /// Starts an attempt chain, or coalesces the trigger if one is already
    /// in flight.
    pub fn trigger(self: &Arc<Self>, reason: SummarizeReason) {
        let done = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            if state.summarizing.is_some() {
                tracing::debug!(reason = %reason, "summarize already in flight; coalescing");
                state.try_while_summarizing = true;
                return;
            }
            let (tx, rx) = watch::channel(false);
            state.summarizing = Some(rx);
            tx
        };
        // A pending idle trigger is stale once an attempt begins.
        self.heuristics.cancel_idle();

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.try_summarize(reason).await;
            let rerun = {
                let mut state = this.state.lock();
                state.summarizing = None;
                let rerun =
                    state.try_while_summarizing && !state.stopping && !state.disposed;
                state.try_while_summarizing = false;
                rerun
            };
            let _ = done.send(true);
            if rerun {
                this.heuristics.run();
            }
        });
    }

    /// Three-attempt escalation. Exhausting all attempts is fatal to the run.
    async fn try_summarize(self: &Arc<Self>, reason: SummarizeReason) {
        if self
            .summarize(
                &reason,
                SummarizeOptions {
                    refresh_latest_ack: false,
                    full_tree: false,
                },
            )
            .await
        {
            return;
        }
        if self.disposed() {
            return;
        }
        if self
            .summarize(
                &SummarizeReason::Retry1,
                SummarizeOptions {
                    refresh_latest_ack: true,
                    full_tree: false,
                },
            )
            .await
        {
            return;
        }
        if self.disposed() {
            return;
        }
        if self
            .summarize(
                &SummarizeReason::Retry2,
                SummarizeOptions {
                    refresh_latest_ack: true,
                    full_tree: true,
                },
            )
            .await
        {
            return;
        }
        tracing::error!(reason = %reason, "failed to summarize in three attempts");
        (self.stop_host)(StopReason::FailToSummarize);
    }

    /// One attempt: generate, await the broadcast, await the ack.
    async fn summarize(&self, reason: &SummarizeReason, options: SummarizeOptions) -> bool {
        let count = {
            let mut state = self.state.lock();
            state.summarize_count += 1;
            state.summarize_count
        };
        tracing::debug!(
            count,
            reason = %reason,
            full_tree = options.full_tree,
            refresh_latest_ack = options.refresh_latest_ack,
            "starting summarize attempt"
        );

        let watchdog = self.arm_watchdog(count);
        let generated = self.generator.generate_summary(options).await;
        // The attempt clock moves even when generation failed.
        self.heuristics
            .record_attempt(generated.as_ref().ok().map(|d| d.reference_sequence_number));
        self.disarm_watchdog(watchdog);

        let data = match generated {
            Ok(data) => data,
            Err(error) => {
                self.fail(SummarizeError::GenerateSummaryFailure {
                    detail: Some(error.to_string()),
                });
                return false;
            }
        };
        if !data.submitted {
            self.fail(SummarizeError::GenerateSummaryFailure { detail: data.error });
            return false;
        }
        if self.disposed() {
            return false;
        }
        tracing::debug!(
            count,
            ref_seq = data.reference_sequence_number,
            client_seq = data.client_sequence_number,
            "summary op submitted"
        );

        // One deadline spans the whole broadcast+ack window.
        let proposal = self.watcher.watch_summary(data.client_sequence_number);
        let timeout = self.pending_ack_timer.start();
        tokio::pin!(timeout);

        let summarize_op = select! {
            broadcast = proposal.wait_broadcast() => match broadcast {
                Ok(record) => record,
                Err(_) => {
                    self.pending_ack_timer.clear();
                    return false;
                }
            },
            outcome = &mut timeout => {
                if outcome == TimerOutcome::Fired {
                    self.fail(SummarizeError::SummaryOpWaitTimeout);
                }
                return false;
            }
        };
        self.heuristics.record_broadcast(summarize_op.sequence_number);
        tracing::debug!(count, summary_seq = summarize_op.sequence_number, "summary op broadcast");

        let adjudication = select! {
            outcome = proposal.wait_ack_nack() => match outcome {
                Ok(adjudication) => adjudication,
                Err(_) => {
                    self.pending_ack_timer.clear();
                    return false;
                }
            },
            outcome = &mut timeout => {
                if outcome == TimerOutcome::Fired {
                    self.fail(SummarizeError::SummaryAckWaitTimeout);
                }
                return false;
            }
        };
        self.pending_ack_timer.clear();

        match adjudication {
            SummaryAckNack::Ack(ack) => {
                self.heuristics.ack_last_sent();
                tracing::debug!(count, handle = %ack.handle, "summary acked");
                true
            }
            SummaryAckNack::Nack(nack) => {
                self.fail(SummarizeError::SummaryNack {
                    message: nack.error_message,
                });
                false
            }
        }
    }

    fn fail(&self, error: SummarizeError) {
        self.pending_ack_timer.clear();
        tracing::warn!(error = %error, detail = error.detail(), "summarize attempt failed");
        (self.raise_warning)(SummarizingWarning::from(&error));
    }

    fn arm_watchdog(&self, count: u64) -> CancellationToken {
        let token = CancellationToken::new();
        self.state.lock().watchdog = Some(token.clone());
        let guard = token.clone();
        tokio::spawn(async move {
            let mut delay = SUMMARIZE_WARNING_DELAY;
            for warned in 1..=MAX_SUMMARIZE_WARNINGS {
                select! {
                    _ = guard.cancelled() => return,
                    _ = sleep(delay) => {
                        tracing::warn!(count, warned, waited = ?delay, "summarize is taking a long time");
                        delay *= 2;
                    }
                }
            }
        });
        token
    }

    fn disarm_watchdog(&self, token: CancellationToken) {
        token.cancel();
        self.state.lock().watchdog = None;
    }

    fn disposed(&self) -> bool {
        self.state.lock().disposed
    }

    pub fn is_summarizing(&self) -> bool {
        self.state.lock().summarizing.is_some()
    }

    pub fn summarize_count(&self) -> u64 {
        self.state.lock().summarize_count
    }

    /// Waits for the run to wind down, taking a best-effort final summary
    /// when the parent is leaving with significant unsummarized state.
    pub async fn wait_stop(self: &Arc<Self>) {
        let first = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            let first = !state.stopping;
            state.stopping = true;
            first
        };
        if first && self.heuristics.ops_since_last_ack() > LAST_SUMMARY_OP_LAG {
            tracing::debug!(
                ops = self.heuristics.ops_since_last_ack(),
                "taking a final summary before stopping"
            );
            self.trigger(SummarizeReason::LastSummary);
        }
        let in_flight = self.state.lock().summarizing.clone();
        if let Some(mut done) = in_flight {
            while !*done.borrow_and_update() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    /// Cancels timers and watcher interest. Idempotent.
    pub fn dispose(&self) {
        {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            if let Some(watchdog) = state.watchdog.take() {
                watchdog.cancel();
            }
        }
        self.watcher.dispose();
        self.heuristics.dispose();
        self.pending_ack_timer.clear();
        tracing::debug!(client_id = %self.client_id, "running summarizer disposed");
    }
}
