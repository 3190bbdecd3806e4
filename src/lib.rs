#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod engine;
mod error;
#[cfg(feature = "logging")]
mod logging;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use crate::engine::{
    CountFn, OverallResetFn, PassOptions, PerformArgs, Pipeline, PipelineContext, Plan, PlanFn,
    ProgressFn, Reset, ResetFn, Scheduler, SelectFn, SeriesView, Slice, StageCtx, StageHandler,
    StageKind, Target, Tick, TickStats, Ticker, TickerKind,
};
pub use crate::error::*;
#[cfg(feature = "logging")]
pub use crate::logging::init_logging;

/// Type-erased handle to a dataset or payload.
///
/// The engine never looks inside it; it only threads the handle from each
/// task's published output to its downstream's input. Stage handlers downcast
/// it and read or mutate the underlying data through their own side channel
/// (typically interior mutability owned by the host).
pub type Dynamic = Arc<dyn Any + Send + Sync>;

/// Ordered registry of every series known to the scheduler, keyed by id.
pub type SeriesSet = BTreeMap<SeriesId, SeriesDesc>;

/// Identifier of one data series, and therefore of its [`Pipeline`].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesId(Box<str>);

impl SeriesId {
    pub fn new(id: impl Into<Box<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SeriesId {
    fn from(id: &str) -> Self {
        Self(id.into())
    }
}

impl From<String> for SeriesId {
    fn from(id: String) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeriesId({})", self.0)
    }
}

/// How a progressive chunk picks indices within a due range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkMode {
    /// Plain contiguous prefix, in index order.
    #[default]
    Sequential,
    /// Interleaved sampling: the first K visited indices are spread
    /// near-uniformly over the whole dataset instead of forming a prefix,
    /// which keeps partially rendered output representative.
    Mod,
}

/// Per-series progressive-execution options.
///
/// These only select the pipeline's threshold, chunk size and sampling
/// behaviour; they carry no other semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Progressive {
    /// Rows per chunk. `0` disables progressive execution for the series.
    pub step: usize,
    /// Row count above which progressive mode is permitted.
    pub threshold: usize,
    pub chunk_mode: ChunkMode,
    /// Opt into the alternate bulk-encoding mode for huge datasets.
    pub large: bool,
    /// Row count above which `large` takes effect.
    pub large_threshold: usize,
}

impl Default for Progressive {
    fn default() -> Self {
        Self {
            step: 400,
            threshold: 3_000,
            chunk_mode: ChunkMode::Sequential,
            large: false,
            large_threshold: 2_000,
        }
    }
}

/// Description of one data series as registered with the scheduler.
#[derive(Clone)]
pub struct SeriesDesc {
    pub id: SeriesId,
    /// Series kind, matched by [`Target::Kind`].
    pub kind: Box<str>,
    pub progressive: Progressive,
    /// Raw dataset handle published by the series' ingestion task.
    pub dataset: Dynamic,
    /// Current row count of the dataset.
    pub rows: usize,
    /// Whether the series is currently filtered out of rendering.
    pub filtered: bool,
}

impl SeriesDesc {
    pub fn new(id: SeriesId, kind: impl Into<Box<str>>, dataset: Dynamic, rows: usize) -> Self {
        Self {
            id,
            kind: kind.into(),
            progressive: Progressive::default(),
            dataset,
            rows,
            filtered: false,
        }
    }

    pub fn progressive(mut self, progressive: Progressive) -> Self {
        self.progressive = progressive;
        self
    }
}

impl Debug for SeriesDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeriesDesc")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("rows", &self.rows)
            .field("filtered", &self.filtered)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progressive_deserializes_from_options() {
        let options: Progressive = serde_json::from_str(
            r#"{ "step": 500, "threshold": 1000, "chunk_mode": "mod" }"#,
        )
        .unwrap();

        assert_eq!(options.step, 500);
        assert_eq!(options.threshold, 1_000);
        assert_eq!(options.chunk_mode, ChunkMode::Mod);
        // Unspecified fields fall back to defaults.
        assert!(!options.large);
        assert_eq!(options.large_threshold, 2_000);
    }

    #[test]
    fn progressive_roundtrip() {
        let options = Progressive {
            step: 50,
            threshold: 40,
            chunk_mode: ChunkMode::Mod,
            large: true,
            large_threshold: 10_000,
        };

        let text = serde_json::to_string(&options).unwrap();
        let back: Progressive = serde_json::from_str(&text).unwrap();

        assert_eq!(back.step, options.step);
        assert_eq!(back.chunk_mode, options.chunk_mode);
        assert!(back.large);
    }
}
