use petgraph::stable_graph::NodeIndex;

use crate::engine::stage::ProgressFn;
use crate::{Dynamic, SeriesId};

/// Stable handle of a task node in the scheduler's arena.
pub(crate) type TaskId = NodeIndex;

/// Outcome of a task's `plan` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Keep the current progress bookkeeping.
    Continue,
    /// Discard all progress and reset before performing.
    ForceReset,
}

/// Per-`perform` scheduling arguments computed from the pipeline's
/// progressive policy.
#[derive(Debug, Clone, Default)]
pub struct PerformArgs {
    /// Upper bound on the number of due indices to process. `None` means the
    /// task must run to completion in this call.
    pub step: Option<usize>,
    /// Skip the handler callbacks, only move the due-range bookkeeping.
    pub skip: bool,
    /// Sampling window size; `<= 1` selects plain sequential order.
    pub mod_by: usize,
    /// Sampling count; `0` disables interleaved sampling.
    pub mod_data_count: usize,
}

/// One due slice handed to a progress callback.
///
/// Iterating yields the logical data indices of the slice. With interleaved
/// sampling active the mapping is the column-major enumeration of the
/// row-major `mod_by`-column grid over `[0, mod_data_count)`, an exact
/// bijection, so the first K visited indices are spread near-uniformly over
/// the dataset. Cursor positions past `mod_data_count` (rows appended after
/// the sampling window was fixed) fall back to plain sequential order.
#[derive(Debug, Clone)]
pub struct Slice {
    start: usize,
    end: usize,
    cursor: usize,
    mode: Interleave,
}

#[derive(Debug, Clone)]
enum Interleave {
    Sequential,
    Mod {
        mod_by: usize,
        mod_data_count: usize,
        /// Height of the short columns; the first `tall` columns are one
        /// taller.
        height: usize,
        tall: usize,
    },
}

impl Slice {
    pub(crate) fn new(start: usize, end: usize, mod_by: usize, mod_data_count: usize) -> Self {
        let mode = if mod_by > 1 && mod_data_count > 0 {
            Interleave::Mod {
                mod_by,
                mod_data_count,
                height: mod_data_count / mod_by,
                tall: mod_data_count % mod_by,
            }
        } else {
            Interleave::Sequential
        };

        Self {
            start,
            end,
            cursor: start,
            mode,
        }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    /// Number of indices in the slice.
    pub fn count(&self) -> usize {
        self.end - self.start
    }
}

impl Iterator for Slice {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.cursor >= self.end {
            return None;
        }

        let i = self.cursor;
        self.cursor += 1;

        Some(match self.mode {
            Interleave::Sequential => i,
            Interleave::Mod {
                mod_by,
                mod_data_count,
                height,
                tall,
            } => {
                if i >= mod_data_count || height == 0 {
                    // Outside the sampling window, or fewer rows than
                    // columns: the transpose is the identity.
                    i
                } else if i < tall * (height + 1) {
                    let column = i / (height + 1);
                    let row = i % (height + 1);
                    row * mod_by + column
                } else {
                    let rest = i - tall * (height + 1);
                    let column = tall + rest / height;
                    let row = rest % height;
                    row * mod_by + column
                }
            }
        })
    }
}

/// What a task does when its due slice is performed, installed by the most
/// recent reset.
pub(crate) enum Progress<G> {
    /// No progress body: the due range passes straight through.
    None,
    /// Ingestion; rows are published through the shared dataset handle, the
    /// advancing due range alone is the signal.
    Ingest,
    /// Per-series stage-handler callbacks obtained from the handler's reset.
    Handler(Vec<ProgressFn<G>>),
    /// Stub of an overall task: forwards the dirty signal to its agent and
    /// its own downstream each performed cycle.
    Stub,
    Render(RenderMode),
}

impl<G> Default for Progress<G> {
    fn default() -> Self {
        Progress::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RenderMode {
    /// One-shot render driven by a forced first progress.
    Full,
    /// `incremental_prepare` at reset, then one `incremental_render` per
    /// slice.
    Incremental,
}

/// Which collaborator a task dispatches to at reset and progress time.
#[derive(Debug, Clone)]
pub(crate) enum TaskRole {
    Ingest {
        series: SeriesId,
    },
    Stage {
        handler: usize,
        series: SeriesId,
    },
    Stub {
        handler: usize,
        series: SeriesId,
        agent: TaskId,
    },
    Overall {
        handler: usize,
    },
    Render {
        series: SeriesId,
    },
}

#[derive(Default)]
pub(crate) struct TaskCtx {
    pub data: Option<Dynamic>,
    pub output: Option<Dynamic>,
    pub payload: Option<Dynamic>,
}

/// Smallest schedulable unit: a due-range cursor with a dirty/reset cycle.
///
/// Upstream/downstream links live as edges of the scheduler's task graph,
/// not as fields, so a task can be disposed by removing its node.
pub(crate) struct Task<G> {
    pub role: TaskRole,
    pub ctx: TaskCtx,
    pub progress: Progress<G>,
    pub dirty: bool,
    /// A block task and everything upstream of it must always run to
    /// completion in one perform.
    pub block: bool,
    pub mod_by: usize,
    pub mod_data_count: usize,
    pub due_index: usize,
    pub due_end: usize,
    pub output_due_end: usize,
    /// Output end pinned by a handler; sticky until the next reset.
    pub set_output_end: Option<usize>,
    pub pipeline: Option<SeriesId>,
    pub idx_in_pipeline: usize,
}

impl<G> Task<G> {
    pub fn new(role: TaskRole) -> Self {
        Self {
            role,
            ctx: TaskCtx::default(),
            progress: Progress::None,
            dirty: true,
            block: false,
            mod_by: 0,
            mod_data_count: 0,
            due_index: 0,
            due_end: 0,
            output_due_end: 0,
            set_output_end: None,
            pipeline: None,
            idx_in_pipeline: 0,
        }
    }

    pub fn unfinished(&self) -> bool {
        !matches!(self.progress, Progress::None) && self.due_index < self.due_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visit(n: usize, b: usize) -> Vec<usize> {
        Slice::new(0, n, b, n).collect()
    }

    #[test]
    fn sequential_when_mod_disabled() {
        assert_eq!(
            Slice::new(3, 8, 1, 100).collect::<Vec<_>>(),
            vec![3, 4, 5, 6, 7]
        );
        assert_eq!(Slice::new(0, 4, 7, 0).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn interleave_is_a_bijection() {
        for (n, b) in [
            (1, 5),
            (4, 3),
            (5, 2),
            (6, 2),
            (7, 7),
            (10, 3),
            (100, 7),
            (120, 3),
            (997, 13),
        ] {
            let mut seen = visit(n, b);
            seen.sort_unstable();
            let expected: Vec<usize> = (0..n).collect();
            assert_eq!(seen, expected, "N={n} B={b}");
        }
    }

    #[test]
    fn interleave_spreads_first_chunk() {
        // With 12 rows in 3 columns the first visited indices walk the
        // dataset in strides of 3.
        assert_eq!(visit(12, 3)[..4], [0, 3, 6, 9]);
    }

    #[test]
    fn interleave_matches_plain_transpose_when_divisible() {
        // N divisible by B: the mapping degenerates to (i % W) * B + i / W
        // with W = N / B.
        let n = 120;
        let b = 4;
        let w = n / b;
        let got = visit(n, b);
        for (i, &idx) in got.iter().enumerate() {
            assert_eq!(idx, (i % w) * b + i / w);
        }
    }

    #[test]
    fn appended_rows_fall_back_to_sequential() {
        // The sampling window covers 6 rows, the slice runs past it.
        let got: Vec<usize> = Slice::new(6, 9, 2, 6).collect();
        assert_eq!(got, vec![6, 7, 8]);
    }

    #[test]
    fn slice_reports_bounds() {
        let slice = Slice::new(10, 25, 1, 0);
        assert_eq!(slice.start(), 10);
        assert_eq!(slice.end(), 25);
        assert_eq!(slice.count(), 15);
    }

    #[test]
    fn fresh_task_is_dirty_and_finished() {
        let task: Task<()> = Task::new(TaskRole::Ingest {
            series: SeriesId::from("a"),
        });
        assert!(task.dirty);
        assert!(!task.unfinished());
    }
}
