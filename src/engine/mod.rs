mod pipeline;
mod scheduler;
mod stage;
mod task;
mod ticker;

pub use crate::engine::pipeline::{Pipeline, PipelineContext};
pub use crate::engine::scheduler::{PassOptions, Scheduler};
pub use crate::engine::stage::{
    CountFn, OverallResetFn, PlanFn, ProgressFn, Reset, ResetFn, SelectFn, SeriesView, StageCtx,
    StageHandler, StageKind, Target,
};
pub use crate::engine::task::{PerformArgs, Plan, Slice};
pub use crate::engine::ticker::{Tick, TickStats, Ticker, TickerKind};
