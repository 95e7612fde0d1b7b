use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

use crate::timer::Timer;

/// Summarize cadence configuration, immutable per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryConfiguration {
    /// Quiet period after the last op before an idle summary is taken.
    pub idle_time: Duration,
    /// Maximum wall-clock time between acked summaries.
    pub max_time: Duration,
    /// Maximum number of unsummarized ops.
    pub max_ops: u64,
    /// Deadline for the whole broadcast+ack window of one attempt. Capped at
    /// 120 seconds regardless of configuration.
    pub max_ack_wait_time: Duration,
}

impl Default for SummaryConfiguration {
    fn default() -> Self {
        Self {
            idle_time: Duration::from_secs(5),
            max_time: Duration::from_secs(60),
            max_ops: 1000,
            max_ack_wait_time: Duration::from_secs(120),
        }
    }
}

/// Why a summarize was triggered. Only used for telemetry and retry
/// dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SummarizeReason {
    Idle,
    MaxTime,
    MaxOps,
    /// Best-effort final summary while the parent is leaving.
    LastSummary,
    Retry1,
    Retry2,
    Save { client_id: String, contents: String },
}

impl fmt::Display for SummarizeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SummarizeReason::Idle => f.write_str("idle"),
            SummarizeReason::MaxTime => f.write_str("maxTime"),
            SummarizeReason::MaxOps => f.write_str("maxOps"),
            SummarizeReason::LastSummary => f.write_str("lastSummary"),
            SummarizeReason::Retry1 => f.write_str("retry1"),
            SummarizeReason::Retry2 => f.write_str("retry2"),
            SummarizeReason::Save { client_id, contents } => {
                write!(f, "save;{client_id}: {contents}")
            }
        }
    }
}

/// One summary attempt, as tracked by the heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryAttempt {
    /// The stream position the summary was taken against.
    pub ref_sequence_number: u64,
    /// When the attempt was submitted or recorded.
    pub summary_time: Instant,
    /// Position the broadcast summarize op was assigned, once observed.
    pub summary_sequence_number: Option<u64>,
}

impl SummaryAttempt {
    pub fn new(ref_sequence_number: u64) -> Self {
        Self {
            ref_sequence_number,
            summary_time: Instant::now(),
            summary_sequence_number: None,
        }
    }
}

struct HeuristicsState {
    last_op_seq_number: u64,
    last_attempted: SummaryAttempt,
    last_acked: SummaryAttempt,
}

/// Decides when a summarize should be triggered under live traffic.
///
/// Trigger decisions are posted onto an unbounded queue; the running
/// summarizer drains it on its own context, so the idle-timer callback never
/// mutates flight state directly.
pub struct SummaryHeuristics {
    configuration: SummaryConfiguration,
    trigger: UnboundedSender<SummarizeReason>,
    idle_timer: Timer,
    state: Mutex<HeuristicsState>,
}

impl SummaryHeuristics {
    pub fn new(
        configuration: SummaryConfiguration,
        first_attempt: SummaryAttempt,
        last_op_seq_number: u64,
        trigger: UnboundedSender<SummarizeReason>,
    ) -> Self {
        let idle_trigger = trigger.clone();
        let idle_timer = Timer::new(configuration.idle_time, move || {
            let _ = idle_trigger.send(SummarizeReason::Idle);
        });
        Self {
            configuration,
            trigger,
            idle_timer,
            state: Mutex::new(HeuristicsState {
                last_op_seq_number,
                last_attempted: first_attempt,
                last_acked: first_attempt,
            }),
        }
    }

    pub fn configuration(&self) -> &SummaryConfiguration {
        &self.configuration
    }

    /// Resets both last-attempted and last-acked, used after startup
    /// resynchronization against the latest observed ack.
    pub fn initialize(&self, attempt: SummaryAttempt) {
        let mut state = self.state.lock();
        state.last_attempted = attempt;
        state.last_acked = attempt;
    }

    /// Records an attempt as submitted now. Runs whether or not generation
    /// succeeded, so the attempt clock moves even on failure.
    pub fn record_attempt(&self, ref_sequence_number: Option<u64>) {
        let mut state = self.state.lock();
        state.last_attempted = SummaryAttempt {
            ref_sequence_number: ref_sequence_number.unwrap_or(state.last_op_seq_number),
            summary_time: Instant::now(),
            summary_sequence_number: None,
        };
    }

    /// Fills in the stream position the broadcast summarize op was assigned.
    pub fn record_broadcast(&self, summary_sequence_number: u64) {
        self.state.lock().last_attempted.summary_sequence_number = Some(summary_sequence_number);
    }

    /// Marks the last attempted summary as acked.
    pub fn ack_last_sent(&self) {
        let mut state = self.state.lock();
        state.last_acked = state.last_attempted;
    }

    pub fn set_last_op_seq_number(&self, sequence_number: u64) {
        self.state.lock().last_op_seq_number = sequence_number;
    }

    pub fn last_op_seq_number(&self) -> u64 {
        self.state.lock().last_op_seq_number
    }

    pub fn last_attempted(&self) -> SummaryAttempt {
        self.state.lock().last_attempted
    }

    pub fn last_acked(&self) -> SummaryAttempt {
        self.state.lock().last_acked
    }

    /// Number of ops past the last acked summary.
    pub fn ops_since_last_ack(&self) -> u64 {
        let state = self.state.lock();
        state
            .last_op_seq_number
            .saturating_sub(state.last_acked.ref_sequence_number)
    }

    pub fn idle_timer_armed(&self) -> bool {
        self.idle_timer.has_pending()
    }

    /// Evaluates the clocks. Time is checked before ops; the idle timer is
    /// restarted only when neither threshold triggers.
    pub fn run(&self) {
        self.idle_timer.clear();
        let (elapsed, ops) = {
            let state = self.state.lock();
            (
                state.last_acked.summary_time.elapsed(),
                state
                    .last_op_seq_number
                    .saturating_sub(state.last_acked.ref_sequence_number),
            )
        };
        if elapsed > self.configuration.max_time {
            self.send(SummarizeReason::MaxTime);
        } else if ops > self.configuration.max_ops {
            self.send(SummarizeReason::MaxOps);
        } else {
            self.idle_timer.start();
        }
    }

    fn send(&self, reason: SummarizeReason) {
        if self.trigger.send(reason).is_err() {
            tracing::trace!("summarize trigger dropped: receiver gone");
        }
    }

    /// Cancels a pending idle trigger. An idle firing armed before an
    /// attempt began is stale once the attempt is in flight.
    pub fn cancel_idle(&self) {
        self.idle_timer.clear();
    }

    /// Cancels the idle timer. Idempotent.
    pub fn dispose(&self) {
        self.idle_timer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::sleep;

    fn heuristics(
        configuration: SummaryConfiguration,
    ) -> (SummaryHeuristics, mpsc::UnboundedReceiver<SummarizeReason>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let heuristics = SummaryHeuristics::new(configuration, SummaryAttempt::new(0), 0, tx);
        (heuristics, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_triggers_after_quiet_period() {
        let (heuristics, mut rx) = heuristics(SummaryConfiguration {
            idle_time: Duration::from_millis(100),
            ..Default::default()
        });
        heuristics.set_last_op_seq_number(1);
        heuristics.run();
        assert!(heuristics.idle_timer_armed());
        sleep(Duration::from_millis(150)).await;
        assert_eq!(rx.recv().await, Some(SummarizeReason::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn each_run_restarts_the_idle_timer() {
        let (heuristics, mut rx) = heuristics(SummaryConfiguration {
            idle_time: Duration::from_millis(100),
            ..Default::default()
        });
        for seq in 1..=5 {
            heuristics.set_last_op_seq_number(seq);
            heuristics.run();
            sleep(Duration::from_millis(60)).await;
            assert!(rx.try_recv().is_err());
        }
        sleep(Duration::from_millis(60)).await;
        assert_eq!(rx.recv().await, Some(SummarizeReason::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn max_ops_triggers_without_waiting() {
        let (heuristics, mut rx) = heuristics(SummaryConfiguration {
            max_ops: 10,
            ..Default::default()
        });
        heuristics.set_last_op_seq_number(11);
        heuristics.run();
        assert_eq!(rx.recv().await, Some(SummarizeReason::MaxOps));
        assert!(!heuristics.idle_timer_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn max_time_is_checked_before_max_ops() {
        let (heuristics, mut rx) = heuristics(SummaryConfiguration {
            max_time: Duration::from_secs(60),
            max_ops: 10,
            ..Default::default()
        });
        // Both thresholds exceeded; time wins.
        sleep(Duration::from_secs(61)).await;
        heuristics.set_last_op_seq_number(100);
        heuristics.run();
        assert_eq!(rx.recv().await, Some(SummarizeReason::MaxTime));
    }

    #[tokio::test(start_paused = true)]
    async fn ack_last_sent_resets_the_op_window() {
        let (heuristics, mut rx) = heuristics(SummaryConfiguration {
            max_ops: 10,
            ..Default::default()
        });
        heuristics.set_last_op_seq_number(11);
        heuristics.record_attempt(Some(11));
        heuristics.record_broadcast(12);
        heuristics.ack_last_sent();
        assert_eq!(heuristics.last_acked().ref_sequence_number, 11);
        assert_eq!(heuristics.last_acked().summary_sequence_number, Some(12));
        assert_eq!(heuristics.ops_since_last_ack(), 0);
        heuristics.run();
        assert!(rx.try_recv().is_err());
        assert!(heuristics.idle_timer_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn record_attempt_defaults_to_last_op() {
        let (heuristics, _rx) = heuristics(SummaryConfiguration::default());
        heuristics.set_last_op_seq_number(42);
        heuristics.record_attempt(None);
        assert_eq!(heuristics.last_attempted().ref_sequence_number, 42);
        // The attempt ordering invariant holds.
        assert!(
            heuristics.last_acked().ref_sequence_number
                <= heuristics.last_attempted().ref_sequence_number
        );
        assert!(heuristics.last_attempted().ref_sequence_number <= heuristics.last_op_seq_number());
    }
}
