use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::coordinator::{RunCoordinator, StopReason};
use crate::error::{RequestError, SummarizingWarning};
use crate::generator::{RefreshSummaryAckError, SummaryGenerator};
use crate::heuristics::{SummaryAttempt, SummaryConfiguration};
use crate::running_summarizer::{RaiseWarningFn, RunningSummarizer, StopHostFn};
use crate::runtime::{OpEvent, SummarizerRuntime};
use crate::summary_collection::SummaryCollection;

/// Warnings queued past this size are dropped; consumers must not block the
/// core.
const WARNING_QUEUE_SIZE: usize = 64;

/// Lifecycle owner of the summarize protocol.
///
/// `run` gates on the run coordinator, wires the inbound stream into the
/// [`SummaryCollection`] and a [`RunningSummarizer`], keeps the host rebased
/// onto committed summaries via the ack-refresh loop, and converges every
/// stop path on dispose-and-close.
impl std::fmt::Debug for Summarizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Summarizer").finish_non_exhaustive()
    }
}

pub struct Summarizer {
    runtime: Arc<dyn SummarizerRuntime>,
    generator: Arc<dyn SummaryGenerator>,
    configuration: SummaryConfiguration,
    coordinator: RunCoordinator,
    collection: SummaryCollection,
    on_behalf_of: Mutex<Option<String>>,
    warning_tx: async_channel::Sender<SummarizingWarning>,
    warning_rx: async_channel::Receiver<SummarizingWarning>,
    running: Mutex<Option<Arc<RunningSummarizer>>>,
    next_summarizer: Mutex<Option<oneshot::Sender<Arc<Summarizer>>>>,
}

impl Summarizer {
    pub fn new(
        runtime: Arc<dyn SummarizerRuntime>,
        generator: Arc<dyn SummaryGenerator>,
        configuration: SummaryConfiguration,
    ) -> Arc<Self> {
        let coordinator = RunCoordinator::new(runtime.connection());
        let (warning_tx, warning_rx) = async_channel::bounded(WARNING_QUEUE_SIZE);
        Arc::new(Self {
            runtime,
            generator,
            configuration,
            coordinator,
            collection: SummaryCollection::new(),
            on_behalf_of: Mutex::new(None),
            warning_tx,
            warning_rx,
            running: Mutex::new(None),
            next_summarizer: Mutex::new(None),
        })
    }

    /// Runs the summarize protocol on behalf of the parent client until
    /// stopped, then closes the parent container. Returns the stop reason.
    pub async fn run(self: &Arc<Self>, on_behalf_of: &str) -> StopReason {
        *self.on_behalf_of.lock() = Some(on_behalf_of.to_string());
        let reason = self.run_core(on_behalf_of).await;
        if let Some(running) = self.running.lock().take() {
            running.dispose();
        }
        self.collection.dispose();
        self.runtime.close();
        reason
    }

    async fn run_core(self: &Arc<Self>, on_behalf_of: &str) -> StopReason {
        let Some(client_id) = self.coordinator.wait_start().await else {
            tracing::info!("summarizer not started: stopped before the parent connected");
            return self
                .coordinator
                .stop_reason()
                .unwrap_or(StopReason::ParentNotConnected);
        };
        let delta_manager = self.runtime.delta_manager();
        if !delta_manager.active() {
            tracing::info!("summarizer not started: parent connection cannot write");
            self.coordinator.stop(StopReason::ParentShouldNotSummarize);
            return StopReason::ParentShouldNotSummarize;
        }
        let computed = self.runtime.summarizer_client_id();
        if computed.as_deref() != Some(on_behalf_of) && computed != self.runtime.client_id() {
            tracing::info!(
                computed = computed.as_deref(),
                on_behalf_of,
                "summarizer not started: another client is the elected summarizer"
            );
            self.coordinator.stop(StopReason::ParentNoLongerSummarizer);
            return StopReason::ParentNoLongerSummarizer;
        }

        let ops = delta_manager.subscribe();
        let pump = tokio::spawn(Self::pump_ops(
            ops,
            self.collection.clone(),
            Arc::downgrade(self),
        ));

        let raise_warning: RaiseWarningFn = {
            let warnings = self.warning_tx.clone();
            Arc::new(move |warning: SummarizingWarning| {
                if warnings.try_send(warning).is_err() {
                    tracing::trace!("warning consumer lagging; dropping summarizing warning");
                }
            })
        };
        let stop_host: StopHostFn = {
            let coordinator = self.coordinator.clone();
            Arc::new(move |reason| coordinator.stop(reason))
        };

        let running = RunningSummarizer::start(
            client_id.clone(),
            on_behalf_of,
            self.configuration.clone(),
            self.collection.clone(),
            self.generator.clone(),
            delta_manager.last_sequence_number(),
            SummaryAttempt::new(delta_manager.initial_sequence_number()),
            raise_warning,
            stop_host,
        )
        .await;
        *self.running.lock() = Some(running.clone());
        tracing::info!(client_id = %client_id, on_behalf_of, "summarizer running");

        let refresh = tokio::spawn(Self::refresh_summary_acks(
            self.collection.clone(),
            self.generator.clone(),
            delta_manager.initial_sequence_number(),
            self.coordinator.clone(),
            self.warning_tx.clone(),
        ));

        let reason = self.coordinator.wait_stopped().await;
        tracing::info!(reason = %reason, "summarizer stopping");
        // Let an in-flight (or final) summary run to its natural end before
        // tearing the stream down.
        running.wait_stop().await;
        refresh.abort();
        pump.abort();
        reason
    }

    /// Feeds the inbound stream: the collection sees every op; quorum ops go
    /// to `handle_system_op`, the rest to `handle_op`.
    async fn pump_ops(
        ops: async_channel::Receiver<OpEvent>,
        collection: SummaryCollection,
        summarizer: Weak<Summarizer>,
    ) {
        while let Ok(event) = ops.recv().await {
            collection.handle_op(&event.op);
            let Some(summarizer) = summarizer.upgrade() else {
                break;
            };
            let running = summarizer.running.lock().clone();
            if let Some(running) = running {
                if event.op.is_quorum() {
                    running.handle_system_op(&event.op);
                } else {
                    running.handle_op(event.error.as_deref(), &event.op);
                }
            }
        }
    }

    /// Reports every committed summary to the host so it can rebase its
    /// in-memory tree. Retryable failures are logged; a fatal failure stops
    /// the run.
    async fn refresh_summary_acks(
        collection: SummaryCollection,
        generator: Arc<dyn SummaryGenerator>,
        initial_sequence_number: u64,
        coordinator: RunCoordinator,
        warnings: async_channel::Sender<SummarizingWarning>,
    ) {
        let mut ref_seq = initial_sequence_number;
        loop {
            let acked = match collection.wait_summary_ack(ref_seq).await {
                Ok(acked) => acked,
                Err(_) => break,
            };
            ref_seq = acked.summarize.reference_sequence_number;
            match generator
                .refresh_latest_summary_ack(&acked.summarize.handle, &acked.ack.handle)
                .await
            {
                Ok(()) => {
                    tracing::debug!(ref_seq, handle = %acked.ack.handle, "refreshed latest summary ack");
                }
                Err(RefreshSummaryAckError::Retryable(error)) => {
                    tracing::warn!(error = %error, ref_seq, "failed to refresh latest summary ack");
                }
                Err(RefreshSummaryAckError::Fatal(message)) => {
                    tracing::error!(error = %message, ref_seq, "fatal failure refreshing latest summary ack");
                    let _ = warnings.try_send(SummarizingWarning::new(message, true));
                    coordinator.stop(StopReason::FailToSummarize);
                    break;
                }
            }
            ref_seq += 1;
        }
    }

    /// Requests a stop. Idempotent; the first reason wins.
    pub fn stop(&self, reason: StopReason) {
        self.coordinator.stop(reason);
    }

    pub fn dispose(&self) {
        self.coordinator.stop(StopReason::Disposed);
    }

    pub fn update_on_behalf_of(&self, client_id: impl Into<String>) {
        *self.on_behalf_of.lock() = Some(client_id.into());
    }

    pub fn on_behalf_of(&self) -> Option<String> {
        self.on_behalf_of.lock().clone()
    }

    /// Warning stream. Receivers share one bounded queue.
    pub fn warnings(&self) -> async_channel::Receiver<SummarizingWarning> {
        self.warning_rx.clone()
    }

    /// Registers the successor slot: resolves once a next summarizer
    /// attaches via [`Summarizer::attach_next_summarizer`].
    pub fn set_summarizer(&self) -> oneshot::Receiver<Arc<Summarizer>> {
        let (tx, rx) = oneshot::channel();
        *self.next_summarizer.lock() = Some(tx);
        rx
    }

    pub fn attach_next_summarizer(&self, next: Arc<Summarizer>) {
        if let Some(slot) = self.next_summarizer.lock().take() {
            let _ = slot.send(next);
        }
    }

    /// The only routable path is the summarizer itself.
    pub fn request(self: &Arc<Self>, url: &str) -> Result<Arc<Summarizer>, RequestError> {
        if url.is_empty() || url == "/" {
            Ok(Arc::clone(self))
        } else {
            Err(RequestError::NotFound {
                url: url.to_string(),
            })
        }
    }
}
