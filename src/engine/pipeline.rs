use crate::engine::task::TaskId;
use crate::{SeriesDesc, SeriesId};

/// Chunk size used for bookkeeping when a series does not specify one.
pub(crate) const DEFAULT_STEP: usize = 700;

/// Stream-mode determination for one pipeline, recomputed by
/// [`Scheduler::update_stream_modes`](crate::Scheduler::update_stream_modes).
#[derive(Debug, Clone)]
pub struct PipelineContext {
    /// Whether the tail of the pipeline can render incrementally this cycle.
    pub progressive_render: bool,
    /// Sampling count for interleaved chunking, when active.
    pub mod_data_count: Option<usize>,
    /// Whether the series crossed into the alternate bulk-encoding mode.
    pub large: bool,
}

/// Topology and progressive policy of one series' ordered task chain.
///
/// A pipeline is not an active component: it is the record each task consults
/// when the scheduler computes perform arguments. The chain order is fixed:
/// ingestion, then stage tasks in handler-registration order, then render.
pub struct Pipeline {
    pub id: SeriesId,
    pub(crate) head: Option<TaskId>,
    pub(crate) tail: Option<TaskId>,
    /// Row count above which progressive mode is permitted.
    pub threshold: usize,
    pub progressive_enabled: bool,
    /// Index of the first task that must run to completion; tasks strictly
    /// after it may be granted a bounded step. `None` means nothing blocks.
    pub(crate) block_index: Option<usize>,
    /// Rows per chunk.
    pub step: usize,
    pub(crate) count: usize,
    pub context: Option<PipelineContext>,
}

impl Pipeline {
    pub(crate) fn new(desc: &SeriesDesc) -> Self {
        let progressive = desc.progressive.step;

        Self {
            id: desc.id.clone(),
            head: None,
            tail: None,
            threshold: desc.progressive.threshold,
            progressive_enabled: progressive > 0,
            block_index: None,
            step: if progressive > 0 {
                progressive
            } else {
                DEFAULT_STEP
            },
            count: 0,
            context: None,
        }
    }

    /// Number of tasks currently wired into the chain.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Progressive, SeriesDesc, SeriesId};
    use std::sync::Arc;

    fn desc(step: usize) -> SeriesDesc {
        SeriesDesc::new(SeriesId::from("s"), "line", Arc::new(()), 100).progressive(Progressive {
            step,
            threshold: 50,
            ..Progressive::default()
        })
    }

    #[test]
    fn zero_step_disables_progressive() {
        let pipeline = Pipeline::new(&desc(0));
        assert!(!pipeline.progressive_enabled);
        assert_eq!(pipeline.step, DEFAULT_STEP);
        assert_eq!(pipeline.threshold, 50);
    }

    #[test]
    fn explicit_step_enables_progressive() {
        let pipeline = Pipeline::new(&desc(250));
        assert!(pipeline.progressive_enabled);
        assert_eq!(pipeline.step, 250);
        assert!(pipeline.is_empty());
        assert!(pipeline.block_index.is_none());
    }
}
