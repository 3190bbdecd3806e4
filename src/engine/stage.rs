use std::any::Any;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::task::{Plan, Slice, TaskId};
use crate::{Dynamic, SeriesId, SeriesSet};

/// Which pass of the scheduling cycle a handler belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Runs blocking, before stream modes are decided for the cycle.
    DataProcessor,
    /// Runs after stream modes are decided and may run progressively.
    Visual,
}

/// Everything a stage callback can see while performing.
///
/// The borrow of the host's globals lives only for the duration of one
/// callback; the type-erased handles are cheap clones of the task's slots and
/// are written back when the callback returns.
pub struct StageCtx<'g, G> {
    pub series: SeriesId,
    /// Current row count of the series' dataset.
    pub rows: usize,
    /// Input pulled from the upstream task's published output.
    pub data: Option<Dynamic>,
    /// Output to publish downstream. Defaults to the input handle.
    pub output: Option<Dynamic>,
    /// Pass payload forwarded from the host, if any.
    pub payload: Option<Dynamic>,
    pub(crate) output_end: Option<usize>,
    pub globals: &'g mut G,
}

impl<'g, G> StageCtx<'g, G> {
    /// Downcast the input handle.
    pub fn input<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.data.as_deref().and_then(|data| data.downcast_ref())
    }

    /// Publish a new output handle downstream.
    pub fn publish<T: Any + Send + Sync>(&mut self, output: T) {
        self.output = Some(Arc::new(output));
    }

    /// Pin the logical output length, for handlers that shrink or grow the
    /// data they pass downstream. Sticky until the task's next reset.
    pub fn set_output_end(&mut self, end: usize) {
        self.output_end = Some(end);
    }
}

pub type ProgressFn<G> =
    Box<dyn FnMut(&mut Slice, &mut StageCtx<'_, G>) -> anyhow::Result<()> + Send>;
pub type ResetFn<G> = Box<dyn FnMut(&mut StageCtx<'_, G>) -> anyhow::Result<Reset<G>> + Send>;
pub type PlanFn<G> = Box<dyn FnMut(&mut StageCtx<'_, G>) -> anyhow::Result<Plan> + Send>;
pub type CountFn<G> = Box<dyn Fn(&StageCtx<'_, G>) -> usize + Send>;
pub type OverallResetFn<G> =
    Box<dyn FnMut(&mut G, Option<&Dynamic>) -> anyhow::Result<()> + Send>;
pub type SelectFn<G> = Box<dyn Fn(&SeriesSet, &G) -> Vec<SeriesId> + Send>;

/// Which series a stage handler applies to.
pub enum Target<G> {
    /// Every registered series.
    All,
    /// Series whose `kind` matches.
    Kind(Cow<'static, str>),
    /// Arbitrary selection against the series registry and host state.
    Select(SelectFn<G>),
}

/// What a per-series reset hands back: zero or more progress callbacks that
/// will each receive every due slice until the next reset.
pub struct Reset<G> {
    pub(crate) progress: Vec<ProgressFn<G>>,
    /// Run the first progress callback even for an empty due range, so that
    /// one-shot work still happens when the dataset has no rows.
    pub(crate) force_first_progress: bool,
}

impl<G> Reset<G> {
    /// No per-slice work; the due range passes straight through.
    pub fn none() -> Self {
        Self {
            progress: Vec::new(),
            force_first_progress: false,
        }
    }

    pub fn progress(
        f: impl FnMut(&mut Slice, &mut StageCtx<'_, G>) -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        Self {
            progress: vec![Box::new(f)],
            force_first_progress: false,
        }
    }

    /// Several callbacks which each see every slice, in order.
    pub fn multi(progress: Vec<ProgressFn<G>>) -> Self {
        Self {
            progress,
            force_first_progress: false,
        }
    }

    pub fn forced(
        f: impl FnMut(&mut Slice, &mut StageCtx<'_, G>) -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        Self {
            progress: vec![Box::new(f)],
            force_first_progress: true,
        }
    }
}

/// One registered processing stage.
///
/// A handler is either per-series (`reset`) or overall (`overall_reset`);
/// declaring both is rejected when stage tasks are wired. An overall handler
/// runs once per cycle and is represented inside each targeted pipeline by a
/// stub task that forwards dirtiness.
pub struct StageHandler<G> {
    pub name: Cow<'static, str>,
    pub(crate) target: Option<Target<G>>,
    pub(crate) reset: Option<ResetFn<G>>,
    pub(crate) plan: Option<PlanFn<G>>,
    pub(crate) count: Option<CountFn<G>>,
    pub(crate) overall_reset: Option<OverallResetFn<G>>,
    /// Run for filtered-out series too.
    pub(crate) perform_raw_series: bool,
}

impl<G> StageHandler<G> {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            target: None,
            reset: None,
            plan: None,
            count: None,
            overall_reset: None,
            perform_raw_series: false,
        }
    }

    pub fn target(mut self, target: Target<G>) -> Self {
        self.target = Some(target);
        self
    }

    pub fn reset(
        mut self,
        f: impl FnMut(&mut StageCtx<'_, G>) -> anyhow::Result<Reset<G>> + Send + 'static,
    ) -> Self {
        self.reset = Some(Box::new(f));
        self
    }

    pub fn plan(
        mut self,
        f: impl FnMut(&mut StageCtx<'_, G>) -> anyhow::Result<Plan> + Send + 'static,
    ) -> Self {
        self.plan = Some(Box::new(f));
        self
    }

    /// Due-range length for a task of this handler that has no upstream to
    /// inherit one from. Without it such a task's range is unbounded.
    pub fn count(mut self, f: impl Fn(&StageCtx<'_, G>) -> usize + Send + 'static) -> Self {
        self.count = Some(Box::new(f));
        self
    }

    pub fn overall_reset(
        mut self,
        f: impl FnMut(&mut G, Option<&Dynamic>) -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        self.overall_reset = Some(Box::new(f));
        self
    }

    pub fn perform_raw_series(mut self) -> Self {
        self.perform_raw_series = true;
        self
    }

    pub(crate) fn resolve_targets(&self, series: &SeriesSet, globals: &G) -> Vec<SeriesId> {
        match &self.target {
            None | Some(Target::All) => series.keys().cloned().collect(),
            Some(Target::Kind(kind)) => series
                .values()
                .filter(|desc| *desc.kind == **kind)
                .map(|desc| desc.id.clone())
                .collect(),
            Some(Target::Select(select)) => select(series, globals),
        }
    }
}

/// Renderer of one series, driven by the tail task of its pipeline.
pub trait SeriesView<G> {
    /// Whether this view supports incremental rendering. Views that do not
    /// always receive one full render per cycle.
    fn incremental(&self) -> bool {
        false
    }

    fn plan(&mut self, ctx: &mut StageCtx<'_, G>) -> anyhow::Result<Plan> {
        let _ = ctx;
        Ok(Plan::Continue)
    }

    /// Full one-shot render.
    fn render(&mut self, ctx: &mut StageCtx<'_, G>) -> anyhow::Result<()>;

    /// Called once when an incremental render cycle starts.
    fn incremental_prepare(&mut self, ctx: &mut StageCtx<'_, G>) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Called once per due slice of an incremental render cycle.
    fn incremental_render(
        &mut self,
        slice: &mut Slice,
        ctx: &mut StageCtx<'_, G>,
    ) -> anyhow::Result<()> {
        let _ = (slice, ctx);
        Ok(())
    }
}

pub(crate) struct StageRecord<G> {
    pub handler: StageHandler<G>,
    pub category: StageKind,
    pub tasks: StageTasks,
}

/// Task wiring of one stage, decided when pipelines are prepared.
#[derive(Default)]
pub(crate) enum StageTasks {
    #[default]
    Unprepared,
    Series(HashMap<SeriesId, TaskId>),
    Overall {
        task: TaskId,
        stubs: HashMap<SeriesId, TaskId>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SeriesDesc;
    use std::sync::Arc;

    fn registry() -> SeriesSet {
        let mut series = SeriesSet::new();
        for (id, kind) in [("a", "line"), ("b", "scatter"), ("c", "line")] {
            let desc = SeriesDesc::new(SeriesId::from(id), kind, Arc::new(()), 10);
            series.insert(desc.id.clone(), desc);
        }
        series
    }

    #[test]
    fn untargeted_handler_covers_every_series() {
        let handler: StageHandler<()> = StageHandler::new("fill");
        let ids = handler.resolve_targets(&registry(), &());
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn kind_target_filters_by_series_kind() {
        let handler: StageHandler<()> =
            StageHandler::new("symbols").target(Target::Kind("line".into()));
        let ids = handler.resolve_targets(&registry(), &());
        assert_eq!(ids, vec![SeriesId::from("a"), SeriesId::from("c")]);
    }

    #[test]
    fn select_target_consults_host_state() {
        let handler: StageHandler<bool> =
            StageHandler::new("picky").target(Target::Select(Box::new(|series, enabled| {
                if *enabled {
                    series.keys().take(1).cloned().collect()
                } else {
                    Vec::new()
                }
            })));
        assert_eq!(handler.resolve_targets(&registry(), &true).len(), 1);
        assert!(handler.resolve_targets(&registry(), &false).is_empty());
    }
}
