//! Interface to the external summary generator: the component that builds
//! the summary tree, uploads it to storage, and submits the summarize op.

use async_trait::async_trait;

/// Per-attempt generation options. Retries escalate these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SummarizeOptions {
    /// Generate the full tree instead of reusing unchanged subtree handles.
    pub full_tree: bool,
    /// Refresh the latest ack from storage before generating.
    pub refresh_latest_ack: bool,
}

/// Size accounting for a generated summary tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SummaryStats {
    pub tree_node_count: u64,
    pub blob_node_count: u64,
    pub handle_node_count: u64,
    pub total_blob_size_bytes: u64,
}

/// Outcome of one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateSummaryData {
    /// The stream position the summary was taken against.
    pub reference_sequence_number: u64,
    /// Whether the summarize op was actually sent. When false the ack-wait
    /// phase is skipped and the attempt fails immediately.
    pub submitted: bool,
    /// Submission id of the summarize op, used to match its stream echo.
    pub client_sequence_number: u64,
    pub summary_stats: SummaryStats,
    pub error: Option<String>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct GenerateSummaryError(pub String);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshSummaryAckError {
    /// Logged; the ack-refresh loop keeps running.
    #[error("failed to refresh latest summary ack: {0}")]
    Retryable(String),
    /// Terminates the ack-refresh loop and stops the summarizer.
    #[error("fatal failure refreshing latest summary ack: {0}")]
    Fatal(String),
}

#[async_trait]
pub trait SummaryGenerator: Send + Sync {
    /// Builds and submits a summary of the current document state.
    async fn generate_summary(
        &self,
        options: SummarizeOptions,
    ) -> Result<GenerateSummaryData, GenerateSummaryError>;

    /// Called once per observed summary ack so the host can rebase its
    /// in-memory tree onto the latest committed summary.
    async fn refresh_latest_summary_ack(
        &self,
        proposal_handle: &str,
        ack_handle: &str,
    ) -> Result<(), RefreshSummaryAckError>;
}
