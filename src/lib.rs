//! # collab-summarizer
//!
//! Summarizer agent for a collaborative-document runtime.
//!
//! An elected client observes the ordered op stream of a live document and
//! periodically produces a summary: a compacted snapshot of document state
//! identified by a storage handle. The summary is submitted through the
//! ordering service as a summarize op, and committed once the server
//! broadcasts a summary-ack for it. This crate owns the *when* and the
//! *protocol*: the heuristic clock (idle / max-time / max-ops), the
//! three-attempt retry escalation, strict single-flight with trigger
//! coalescing, and the cooperative lifecycle with the parent client. The
//! summary tree itself is built by an external [`generator::SummaryGenerator`].
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use collab_summarizer::coordinator::StopReason;
//! use collab_summarizer::generator::SummaryGenerator;
//! use collab_summarizer::heuristics::SummaryConfiguration;
//! use collab_summarizer::runtime::SummarizerRuntime;
//! use collab_summarizer::summarizer::Summarizer;
//!
//! async fn run(runtime: Arc<dyn SummarizerRuntime>, generator: Arc<dyn SummaryGenerator>) {
//!     let configuration = SummaryConfiguration {
//!         idle_time: Duration::from_secs(5),
//!         max_time: Duration::from_secs(60),
//!         max_ops: 1000,
//!         max_ack_wait_time: Duration::from_secs(120),
//!     };
//!     let summarizer = Summarizer::new(runtime, generator, configuration);
//!
//!     // Surface warnings without blocking the core.
//!     let warnings = summarizer.warnings();
//!     tokio::spawn(async move {
//!         while let Ok(warning) = warnings.recv().await {
//!             eprintln!("{}: {}", warning.error_type, warning.message);
//!         }
//!     });
//!
//!     // Blocks until the run coordinator stops or `stop` is called, then
//!     // closes the parent container.
//!     let reason = summarizer.run("parent-client-id").await;
//!     assert_ne!(reason, StopReason::FailToSummarize);
//! }
//! ```
pub mod coordinator;
pub mod error;
pub mod generator;
pub mod heuristics;
pub mod message;
pub mod running_summarizer;
pub mod runtime;
pub mod summarizer;
pub mod summary_collection;
pub mod timer;
