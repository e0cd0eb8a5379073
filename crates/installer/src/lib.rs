//! Install reconciliation for subscription-managed operators.
//!
//! [`Installer`] drives the verbs; [`ResolutionWaiter`] does the two-leg wait
//! and [`StatusAggregator`] the live reads behind every verdict.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod status;
pub mod waiter;

pub use config::WaitConfig;
pub use error::InstallError;
pub use orchestrator::Installer;
pub use status::{ObjectOutcome, ObjectStatus, ObjectSummary, StatusAggregator, StatusSummary, StatusView, Verdict};
pub use tokio_util::sync::CancellationToken;
pub use waiter::{RecordAbsence, ResolutionWaiter};
