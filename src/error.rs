pub use anyhow::Error as RuntimeError;
use thiserror::Error;

use crate::SeriesId;

/// Configuration errors detected while wiring stage tasks, before any task
/// executes.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("stage '{0}': `reset` and `overall_reset` must not both be specified")]
    AmbiguousStage(String),

    #[error("stage '{0}': an overall stage cannot target every series, it would block all pipelines")]
    OverallOnAllSeries(String),

    #[error("series '{0}' is not registered")]
    UnknownSeries(SeriesId),
}

/// A stage handler or view callback failed during a scheduling pass.
///
/// The remainder of the pass is abandoned and no rollback is attempted; the
/// scheduling state should be considered unreliable until the pipelines are
/// rebuilt or [`Scheduler::restore_data`](crate::Scheduler::restore_data)
/// forces a clean reset.
#[derive(Debug, Error)]
pub enum PerformError {
    #[error("stage '{0}':\n{1}")]
    Stage(String, RuntimeError),

    #[error("view for series '{0}':\n{1}")]
    View(SeriesId, RuntimeError),
}
