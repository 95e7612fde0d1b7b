//! Failure taxonomy of a summarize attempt. The `Display` strings are the
//! public contract and must not change.

/// `error_type` carried by every warning the summarizer emits.
pub const SUMMARIZING_ERROR: &str = "summarizingError";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SummarizeError {
    /// The generator threw, or reported the op was not submitted.
    #[error("generateSummaryFailure")]
    GenerateSummaryFailure { detail: Option<String> },
    /// The summarize op was not broadcast back within the ack-wait window.
    #[error("summaryOpWaitTimeout")]
    SummaryOpWaitTimeout,
    /// The broadcast was observed but no ack/nack arrived within the window.
    #[error("summaryAckWaitTimeout")]
    SummaryAckWaitTimeout,
    /// Explicit server rejection.
    #[error("summaryNack")]
    SummaryNack { message: Option<String> },
}

impl SummarizeError {
    /// Non-canonical diagnostic detail, when the failure carried one.
    pub fn detail(&self) -> Option<&str> {
        match self {
            SummarizeError::GenerateSummaryFailure { detail } => detail.as_deref(),
            SummarizeError::SummaryNack { message } => message.as_deref(),
            _ => None,
        }
    }
}

/// Warning record surfaced to the host. `logged` tells the host whether the
/// core already logged the detail, so it can decide whether to re-log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummarizingWarning {
    pub error_type: &'static str,
    pub message: String,
    pub logged: bool,
}

impl SummarizingWarning {
    pub fn new(message: impl Into<String>, logged: bool) -> Self {
        Self {
            error_type: SUMMARIZING_ERROR,
            message: message.into(),
            logged,
        }
    }
}

impl From<&SummarizeError> for SummarizingWarning {
    fn from(error: &SummarizeError) -> Self {
        Self::new(error.to_string(), true)
    }
}

/// Routing failure for [`crate::summarizer::Summarizer::request`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("not found: {url}")]
    NotFound { url: String },
}

impl RequestError {
    /// HTTP-equivalent status code.
    pub fn status(&self) -> u16 {
        match self {
            RequestError::NotFound { .. } => 404,
        }
    }
}
