use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::Arc;

use petgraph::Direction;
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::EdgeRef;
use tracing::{debug, trace};

use crate::engine::pipeline::{Pipeline, PipelineContext};
use crate::engine::stage::{
    SeriesView, StageCtx, StageHandler, StageKind, StageRecord, StageTasks, Target,
};
use crate::engine::task::{
    PerformArgs, Plan, Progress, RenderMode, Slice, Task, TaskCtx, TaskId, TaskRole,
};
use crate::engine::ticker::Tick;
use crate::{ChunkMode, Dynamic, PerformError, SeriesDesc, SeriesId, SeriesSet, SetupError};

type TaskGraph<G> = StableDiGraph<Task<G>, ()>;

/// Per-pass options for the visual stages.
#[derive(Debug, Clone, Default)]
pub struct PassOptions {
    /// Run every task to completion, ignoring progressive policies.
    pub block: bool,
    /// Re-dirty stage tasks so their handlers recompute from scratch.
    pub set_dirty: bool,
    /// Restrict `set_dirty` to these series. `None` dirties all of them.
    pub dirty_set: Option<HashSet<SeriesId>>,
}

/// Single-threaded cooperative scheduler over per-series task pipelines.
///
/// Tasks live as nodes of a stable graph; upstream-to-downstream data flow is
/// its edges. One scheduling pass performs ingestion, data-processor stages,
/// visual stages and renders, in that order, and a sequence of passes is
/// driven by [`progress`](Scheduler::progress) under a [`Tick`] budget until
/// every pipeline reports finished.
pub struct Scheduler<G> {
    graph: TaskGraph<G>,
    series: SeriesSet,
    pipelines: HashMap<SeriesId, Pipeline>,
    views: HashMap<SeriesId, Box<dyn SeriesView<G>>>,
    stages: Vec<StageRecord<G>>,
    ingest: HashMap<SeriesId, TaskId>,
    render: HashMap<SeriesId, TaskId>,
    /// Whether any task still has due rows pending. Sticky across passes
    /// within a cycle; host-visible so frame loops know to keep ticking.
    pub unfinished: bool,
    rows_performed: usize,
}

impl<G> Scheduler<G> {
    pub fn new(data_processors: Vec<StageHandler<G>>, visual: Vec<StageHandler<G>>) -> Self {
        let stages = data_processors
            .into_iter()
            .map(|handler| StageRecord {
                handler,
                category: StageKind::DataProcessor,
                tasks: StageTasks::Unprepared,
            })
            .chain(visual.into_iter().map(|handler| StageRecord {
                handler,
                category: StageKind::Visual,
                tasks: StageTasks::Unprepared,
            }))
            .collect();

        Self {
            graph: StableDiGraph::default(),
            series: SeriesSet::new(),
            pipelines: HashMap::new(),
            views: HashMap::new(),
            stages,
            ingest: HashMap::new(),
            render: HashMap::new(),
            unfinished: false,
            rows_performed: 0,
        }
    }

    /// Install or replace the renderer of one series.
    pub fn set_view(&mut self, id: SeriesId, view: Box<dyn SeriesView<G>>) {
        self.views.insert(id, view);
    }

    pub fn series(&self) -> &SeriesSet {
        &self.series
    }

    pub fn pipeline(&self, id: &SeriesId) -> Option<&Pipeline> {
        self.pipelines.get(id)
    }

    /// Rows moved through progress callbacks during the last pass sequence.
    pub fn rows_performed(&self) -> usize {
        self.rows_performed
    }

    /// Rebuild every pipeline from the given series registry, reusing the
    /// ingestion tasks of series that survive and disposing those that
    /// vanished. Stage and render tasks are re-piped by the subsequent
    /// prepare steps.
    pub fn restore_pipelines(&mut self, descs: Vec<SeriesDesc>) {
        let mut fresh = SeriesSet::new();
        let mut pipelines = HashMap::new();
        let graph = &mut self.graph;

        for desc in descs {
            let id = desc.id.clone();
            let mut pipeline = Pipeline::new(&desc);

            let ingest = *self.ingest.entry(id.clone()).or_insert_with(|| {
                graph.add_node(Task::new(TaskRole::Ingest { series: id.clone() }))
            });
            pipe_into(graph, &mut pipeline, ingest);

            fresh.insert(id.clone(), desc);
            pipelines.insert(id, pipeline);
        }

        let stale: Vec<SeriesId> = self
            .ingest
            .keys()
            .filter(|id| !fresh.contains_key(*id))
            .cloned()
            .collect();
        for id in stale {
            if let Some(task) = self.ingest.remove(&id) {
                graph.remove_node(task);
            }
            if let Some(task) = self.render.remove(&id) {
                graph.remove_node(task);
            }
            self.views.remove(&id);
        }

        debug!(series = pipelines.len(), "pipelines restored");
        self.series = fresh;
        self.pipelines = pipelines;
    }

    /// Wire every registered stage into the pipelines it targets.
    ///
    /// Validates handler shape first: a handler must be either per-series or
    /// overall, and an overall handler must carry an explicit narrower
    /// target.
    pub fn prepare_stage_tasks(&mut self, globals: &G) -> Result<(), SetupError> {
        for index in 0..self.stages.len() {
            let handler = &self.stages[index].handler;
            if handler.reset.is_some() && handler.overall_reset.is_some() {
                return Err(SetupError::AmbiguousStage(handler.name.to_string()));
            }
            if handler.overall_reset.is_some() && matches!(handler.target, Some(Target::All)) {
                return Err(SetupError::OverallOnAllSeries(handler.name.to_string()));
            }

            if self.stages[index].handler.overall_reset.is_some() {
                self.prepare_overall_stage(index, globals);
            } else {
                self.prepare_series_stage(index, globals);
            }
        }
        Ok(())
    }

    fn prepare_series_stage(&mut self, index: usize, globals: &G) {
        let targets = self.stages[index].handler.resolve_targets(&self.series, globals);
        let graph = &mut self.graph;

        let mut previous = match mem::take(&mut self.stages[index].tasks) {
            StageTasks::Series(map) => map,
            StageTasks::Unprepared => HashMap::new(),
            StageTasks::Overall { task, stubs } => {
                graph.remove_node(task);
                for (_, stub) in stubs {
                    graph.remove_node(stub);
                }
                HashMap::new()
            }
        };

        let mut tasks = HashMap::new();
        for id in targets {
            let Some(pipeline) = self.pipelines.get_mut(&id) else {
                continue;
            };
            let task = match previous.remove(&id) {
                Some(task) => task,
                None => graph.add_node(Task::new(TaskRole::Stage {
                    handler: index,
                    series: id.clone(),
                })),
            };
            pipe_into(graph, pipeline, task);
            tasks.insert(id, task);
        }

        for (_, task) in previous {
            graph.remove_node(task);
        }
        self.stages[index].tasks = StageTasks::Series(tasks);
    }

    fn prepare_overall_stage(&mut self, index: usize, globals: &G) {
        let targeted = self.stages[index].handler.target.is_some();
        let targets = self.stages[index].handler.resolve_targets(&self.series, globals);
        let graph = &mut self.graph;

        let (task, mut previous) = match mem::take(&mut self.stages[index].tasks) {
            StageTasks::Overall { task, stubs } => (task, stubs),
            StageTasks::Series(map) => {
                for (_, task) in map {
                    graph.remove_node(task);
                }
                let task = graph.add_node(Task::new(TaskRole::Overall { handler: index }));
                (task, HashMap::new())
            }
            StageTasks::Unprepared => {
                let task = graph.add_node(Task::new(TaskRole::Overall { handler: index }));
                (task, HashMap::new())
            }
        };

        let mut dirty_overall = false;
        let mut stubs = HashMap::new();

        for id in targets {
            let Some(pipeline) = self.pipelines.get_mut(&id) else {
                continue;
            };
            let stub = match previous.remove(&id) {
                Some(stub) => stub,
                None => {
                    dirty_overall = true;
                    let stub = graph.add_node(Task::new(TaskRole::Stub {
                        handler: index,
                        series: id.clone(),
                        agent: task,
                    }));
                    // An untargeted overall stage observes every pipeline
                    // without blocking any of them.
                    graph[stub].block = targeted;
                    stub
                }
            };
            pipe_into(graph, pipeline, stub);
            stubs.insert(id, stub);
        }

        // A stub disappearing is as much a membership change as one
        // appearing; the aggregate must be recomputed either way.
        if !previous.is_empty() {
            dirty_overall = true;
            for (_, stub) in previous {
                graph.remove_node(stub);
            }
        }
        if dirty_overall {
            mark_dirty(graph, task);
        }

        self.stages[index].tasks = StageTasks::Overall { task, stubs };
    }

    /// Append a render task to every pipeline that has a view installed.
    pub fn prepare_views(&mut self) {
        let graph = &mut self.graph;
        let render = &mut self.render;

        for (id, pipeline) in &mut self.pipelines {
            let Some(view) = self.views.get(id) else {
                continue;
            };
            let task = *render.entry(id.clone()).or_insert_with(|| {
                graph.add_node(Task::new(TaskRole::Render { series: id.clone() }))
            });
            graph[task].block = !view.incremental();
            pipe_into(graph, pipeline, task);
        }
    }

    /// Locate each pipeline's last blocking task. Tasks strictly after it are
    /// the only ones eligible for bounded steps.
    pub fn plan(&mut self) {
        for pipeline in self.pipelines.values_mut() {
            let mut block_index = None;
            let mut cursor = pipeline.tail;
            while let Some(id) = cursor {
                if self.graph[id].block {
                    block_index = Some(self.graph[id].idx_in_pipeline);
                    break;
                }
                cursor = if Some(id) == pipeline.head {
                    None
                } else {
                    upstream_of(&self.graph, id)
                };
            }
            pipeline.block_index = block_index;
        }
    }

    /// Decide each pipeline's stream mode for the coming pass from the
    /// current row counts. Safe to call between passes; a change in sampling
    /// forces the affected tasks to reset.
    pub fn update_stream_modes(&mut self) {
        for (id, pipeline) in &mut self.pipelines {
            let Some(desc) = self.series.get(id) else {
                continue;
            };
            let incremental_view = self.views.get(id).is_some_and(|view| view.incremental());
            let progressive_render = pipeline.progressive_enabled
                && incremental_view
                && desc.rows >= pipeline.threshold;
            let large = desc.progressive.large && desc.rows >= desc.progressive.large_threshold;
            let mod_data_count = (progressive_render
                && desc.progressive.chunk_mode == ChunkMode::Mod)
                .then_some(desc.rows);

            pipeline.context = Some(PipelineContext {
                progressive_render,
                mod_data_count,
                large,
            });
        }
    }

    /// Convenience: rebuild and re-wire everything for a new series registry
    /// and arm the scheduler for a fresh cycle.
    pub fn prepare(&mut self, descs: Vec<SeriesDesc>, globals: &G) -> Result<(), SetupError> {
        self.restore_pipelines(descs);
        self.prepare_stage_tasks(globals)?;
        self.prepare_views();
        self.plan();
        self.update_stream_modes();
        self.unfinished = true;
        Ok(())
    }

    /// Invalidate every pipeline from its source: ingestion tasks and overall
    /// tasks are dirtied, so the next pass recomputes everything downstream.
    pub fn restore_data(&mut self, payload: Option<Dynamic>) {
        for &task in self.ingest.values() {
            mark_dirty(&mut self.graph, task);
            self.graph[task].ctx.payload = payload.clone();
        }
        for index in 0..self.stages.len() {
            if let StageTasks::Overall { task, .. } = self.stages[index].tasks {
                mark_dirty(&mut self.graph, task);
            }
        }
        self.unfinished = true;
    }

    /// Swap in a grown dataset for one series.
    ///
    /// When the handle is the same allocation the new rows simply extend the
    /// due range and flow through without any reset; a replaced handle
    /// invalidates the pipeline from its ingestion task.
    pub fn append_data(
        &mut self,
        id: &SeriesId,
        dataset: Dynamic,
        rows: usize,
    ) -> Result<(), SetupError> {
        let desc = self
            .series
            .get_mut(id)
            .ok_or_else(|| SetupError::UnknownSeries(id.clone()))?;
        let replaced = !Arc::ptr_eq(&desc.dataset, &dataset);
        desc.dataset = dataset;
        desc.rows = rows;

        if replaced && let Some(&task) = self.ingest.get(id) {
            mark_dirty(&mut self.graph, task);
        }
        self.unfinished = true;
        Ok(())
    }

    pub fn set_series_filtered(&mut self, id: &SeriesId, filtered: bool) -> Result<(), SetupError> {
        let desc = self
            .series
            .get_mut(id)
            .ok_or_else(|| SetupError::UnknownSeries(id.clone()))?;
        desc.filtered = filtered;
        Ok(())
    }

    /// Drop every task, pipeline and view. Stage handlers stay registered and
    /// can be re-wired by a later [`prepare`](Scheduler::prepare).
    pub fn dispose(&mut self) {
        self.graph.clear();
        self.pipelines.clear();
        self.series.clear();
        self.ingest.clear();
        self.render.clear();
        self.views.clear();
        for record in &mut self.stages {
            record.tasks = StageTasks::Unprepared;
        }
        self.unfinished = false;
    }

    /// Perform every ingestion task, unbounded.
    pub fn perform_series_tasks(&mut self, globals: &mut G) -> Result<(), PerformError> {
        let mut unfinished = false;
        let ids: Vec<TaskId> = self.ingest.values().copied().collect();
        let args = PerformArgs::default();

        for id in ids {
            unfinished |= self.perform_task(id, &args, globals)?;
        }
        self.unfinished |= unfinished;
        Ok(())
    }

    /// Perform the data-processor stages. These always run blocking so that
    /// stream modes are decided over fully processed data.
    pub fn perform_data_processor_tasks(
        &mut self,
        globals: &mut G,
        payload: Option<Dynamic>,
    ) -> Result<(), PerformError> {
        let opts = PassOptions {
            block: true,
            ..PassOptions::default()
        };
        self.perform_stage_pass(StageKind::DataProcessor, payload, &opts, globals)
    }

    /// Perform the visual stages under the given pass options.
    pub fn perform_visual_tasks(
        &mut self,
        globals: &mut G,
        payload: Option<Dynamic>,
        opts: &PassOptions,
    ) -> Result<(), PerformError> {
        self.perform_stage_pass(StageKind::Visual, payload, opts, globals)
    }

    /// Perform the render task of every unfiltered series with a view.
    pub fn perform_render_tasks(
        &mut self,
        globals: &mut G,
        payload: Option<Dynamic>,
    ) -> Result<(), PerformError> {
        let mut unfinished = false;
        let ids: Vec<(SeriesId, TaskId)> = self
            .render
            .iter()
            .map(|(id, &task)| (id.clone(), task))
            .collect();

        for (sid, task) in ids {
            if self.series.get(&sid).is_some_and(|desc| desc.filtered) {
                continue;
            }
            let args = self.perform_args(task, false);
            self.graph[task].ctx.payload = payload.clone();
            unfinished |= self.perform_task(task, &args, globals)?;
        }
        self.unfinished |= unfinished;
        Ok(())
    }

    /// Run full scheduling passes until everything is finished or the tick's
    /// time budget runs out. Returns whether work remains.
    pub fn progress(
        &mut self,
        globals: &mut G,
        payload: Option<Dynamic>,
        tick: &mut Tick,
    ) -> Result<bool, PerformError> {
        if !self.unfinished {
            return Ok(false);
        }

        loop {
            self.unfinished = false;
            self.rows_performed = 0;

            self.perform_series_tasks(globals)?;
            self.perform_data_processor_tasks(globals, payload.clone())?;
            self.update_stream_modes();
            self.perform_visual_tasks(globals, payload.clone(), &PassOptions::default())?;
            self.perform_render_tasks(globals, payload.clone())?;

            tick.add_rows(self.rows_performed);
            trace!(
                rows = self.rows_performed,
                unfinished = self.unfinished,
                "scheduling pass"
            );

            if !self.unfinished || tick.should_yield() {
                break;
            }
        }

        if self.unfinished {
            tick.require_more_tick();
        }
        Ok(self.unfinished)
    }

    fn perform_stage_pass(
        &mut self,
        category: StageKind,
        payload: Option<Dynamic>,
        opts: &PassOptions,
        globals: &mut G,
    ) -> Result<(), PerformError> {
        enum Work {
            Series(Vec<(SeriesId, TaskId)>),
            Overall {
                task: TaskId,
                stubs: Vec<(SeriesId, TaskId)>,
            },
        }

        let mut unfinished = false;

        for index in 0..self.stages.len() {
            if self.stages[index].category != category {
                continue;
            }

            let work = match &self.stages[index].tasks {
                StageTasks::Unprepared => continue,
                StageTasks::Series(map) => Work::Series(
                    map.iter().map(|(id, &task)| (id.clone(), task)).collect(),
                ),
                StageTasks::Overall { task, stubs } => Work::Overall {
                    task: *task,
                    stubs: stubs.iter().map(|(id, &stub)| (id.clone(), stub)).collect(),
                },
            };

            match work {
                Work::Overall { task, stubs } => {
                    for (sid, stub) in &stubs {
                        if need_set_dirty(opts, sid) {
                            mark_dirty(&mut self.graph, *stub);
                        }
                    }
                    self.graph[task].ctx.payload = payload.clone();

                    // Stubs run unbounded; their role is to forward dirtiness
                    // into the agent, not to report progress of their own.
                    let args = PerformArgs::default();
                    for (_, stub) in &stubs {
                        self.perform_task(*stub, &args, globals)?;
                    }
                    unfinished |= self.perform_task(task, &args, globals)?;
                }
                Work::Series(list) => {
                    let perform_raw = self.stages[index].handler.perform_raw_series;
                    for (sid, task) in list {
                        if need_set_dirty(opts, &sid) {
                            mark_dirty(&mut self.graph, task);
                        }
                        let mut args = self.perform_args(task, opts.block);
                        args.skip = !perform_raw
                            && self.series.get(&sid).is_some_and(|desc| desc.filtered);
                        self.graph[task].ctx.payload = payload.clone();
                        unfinished |= self.perform_task(task, &args, globals)?;
                    }
                }
            }
        }

        self.unfinished |= unfinished;
        Ok(())
    }

    /// Compute the scheduling arguments a task is entitled to: a bounded step
    /// with sampling when its pipeline is in progressive mode and nothing at
    /// or after it blocks, unbounded otherwise.
    fn perform_args(&self, id: TaskId, block: bool) -> PerformArgs {
        let task = &self.graph[id];
        let Some(pipeline) = task.pipeline.as_ref().and_then(|sid| self.pipelines.get(sid))
        else {
            return PerformArgs::default();
        };

        let incremental = !block
            && pipeline.progressive_enabled
            && pipeline
                .context
                .as_ref()
                .is_none_or(|ctx| ctx.progressive_render)
            && pipeline
                .block_index
                .is_none_or(|blocked| task.idx_in_pipeline > blocked);
        if !incremental {
            return PerformArgs::default();
        }

        let step = pipeline.step;
        let mod_data_count = pipeline
            .context
            .as_ref()
            .and_then(|ctx| ctx.mod_data_count)
            .unwrap_or(0);

        PerformArgs {
            step: Some(step),
            skip: false,
            mod_by: if mod_data_count > 0 {
                mod_data_count.div_ceil(step)
            } else {
                0
            },
            mod_data_count,
        }
    }

    /// Perform one task: pull fresh input when dirty, plan, reset when
    /// invalidated, then move its due range by at most one step. Returns
    /// whether the task still has due rows.
    fn perform_task(
        &mut self,
        id: TaskId,
        args: &PerformArgs,
        globals: &mut G,
    ) -> Result<bool, PerformError> {
        let upstream = upstream_of(&self.graph, id);

        if self.graph[id].dirty && let Some(up) = upstream {
            let output = self.graph[up].ctx.output.clone();
            let task = &mut self.graph[id];
            task.ctx.data = output.clone();
            task.ctx.output = output;
        }

        let mut plan = Plan::Continue;
        if !args.skip {
            match self.graph[id].role.clone() {
                TaskRole::Stage { handler, series: sid } => {
                    let (data, output, payload) = snapshot(&self.graph[id].ctx);
                    let rows = self.series.get(&sid).map_or(0, |desc| desc.rows);
                    let record = &mut self.stages[handler];
                    if let Some(plan_fn) = record.handler.plan.as_mut() {
                        let mut ctx = StageCtx {
                            series: sid,
                            rows,
                            data,
                            output,
                            payload,
                            output_end: None,
                            globals: &mut *globals,
                        };
                        plan = plan_fn(&mut ctx).map_err(|err| {
                            PerformError::Stage(record.handler.name.to_string(), err)
                        })?;
                    }
                }
                TaskRole::Render { series: sid } => {
                    let (data, output, payload) = snapshot(&self.graph[id].ctx);
                    let rows = self.series.get(&sid).map_or(0, |desc| desc.rows);
                    if let Some(view) = self.views.get_mut(&sid) {
                        let mut ctx = StageCtx {
                            series: sid.clone(),
                            rows,
                            data,
                            output,
                            payload,
                            output_end: None,
                            globals: &mut *globals,
                        };
                        plan = view
                            .plan(&mut ctx)
                            .map_err(|err| PerformError::View(sid.clone(), err))?;
                    }
                }
                _ => {}
            }
        }

        // A change in the sampling window invalidates partial progress: the
        // already-visited index set would not line up with the new mapping.
        let mod_by = args.mod_by.max(1);
        let mod_data_count = args.mod_data_count;
        {
            let task = &self.graph[id];
            if task.mod_by.max(1) != mod_by || task.mod_data_count != mod_data_count {
                plan = Plan::ForceReset;
            }
        }

        let mut force_first = false;
        let mut did_reset = false;
        if self.graph[id].dirty || plan == Plan::ForceReset {
            self.graph[id].dirty = false;
            did_reset = true;
            force_first = self.reset_task(id, args.skip, globals)?;
        }
        {
            let task = &mut self.graph[id];
            task.mod_by = mod_by;
            task.mod_data_count = mod_data_count;
        }

        let due_end = match upstream {
            Some(up) => self.graph[up].output_due_end,
            None => match self.graph[id].role.clone() {
                TaskRole::Ingest { series: sid } => {
                    self.series.get(&sid).map_or(0, |desc| desc.rows)
                }
                TaskRole::Stage { handler, series: sid } => {
                    let (data, output, payload) = snapshot(&self.graph[id].ctx);
                    let rows = self.series.get(&sid).map_or(0, |desc| desc.rows);
                    match self.stages[handler].handler.count.as_ref() {
                        Some(count) => {
                            let ctx = StageCtx {
                                series: sid,
                                rows,
                                data,
                                output,
                                payload,
                                output_end: None,
                                globals: &mut *globals,
                            };
                            count(&ctx)
                        }
                        None => usize::MAX,
                    }
                }
                _ => usize::MAX,
            },
        };
        self.graph[id].due_end = due_end;

        if matches!(self.graph[id].progress, Progress::None) {
            let task = &mut self.graph[id];
            let out = task.set_output_end.unwrap_or(due_end);
            debug_assert!(
                did_reset || out >= task.output_due_end,
                "output_due_end must not decrease without a reset"
            );
            task.due_index = out;
            task.output_due_end = out;
        } else {
            let start = self.graph[id].due_index;
            let end = match args.step {
                Some(step) => due_end.min(start.saturating_add(step)),
                None => due_end,
            };

            if !args.skip && (force_first || start < end) {
                self.rows_performed += end - start;
                self.progress_task(id, start, end, globals)?;
            }
            let task = &mut self.graph[id];
            task.due_index = end;
            debug_assert!(task.due_index <= task.due_end);
            let out = task.set_output_end.unwrap_or(end);
            debug_assert!(
                did_reset || out >= task.output_due_end,
                "output_due_end must not decrease without a reset"
            );
            task.output_due_end = out;
        }

        Ok(self.graph[id].unfinished())
    }

    /// Zero the task's cursors and re-obtain its progress body from the
    /// collaborator its role points at. Dirties downstream. Returns whether
    /// the first progress must run even over an empty due range.
    fn reset_task(
        &mut self,
        id: TaskId,
        skip: bool,
        globals: &mut G,
    ) -> Result<bool, PerformError> {
        {
            let task = &mut self.graph[id];
            task.due_index = 0;
            task.due_end = 0;
            task.output_due_end = 0;
            task.set_output_end = None;
        }

        let mut force_first = false;

        if skip {
            self.graph[id].progress = Progress::None;
        } else {
            match self.graph[id].role.clone() {
                TaskRole::Ingest { series: sid } => {
                    let dataset = self.series.get(&sid).map(|desc| desc.dataset.clone());
                    let task = &mut self.graph[id];
                    task.ctx.output = dataset;
                    task.progress = Progress::Ingest;
                }
                TaskRole::Stage { handler, series: sid } => {
                    let (data, output, payload) = snapshot(&self.graph[id].ctx);
                    let rows = self.series.get(&sid).map_or(0, |desc| desc.rows);
                    let record = &mut self.stages[handler];
                    match record.handler.reset.as_mut() {
                        Some(reset) => {
                            let mut ctx = StageCtx {
                                series: sid,
                                rows,
                                data,
                                output,
                                payload,
                                output_end: None,
                                globals: &mut *globals,
                            };
                            let outcome = reset(&mut ctx).map_err(|err| {
                                PerformError::Stage(record.handler.name.to_string(), err)
                            })?;
                            let output = ctx.output.take();
                            let output_end = ctx.output_end;

                            let task = &mut self.graph[id];
                            task.ctx.output = output;
                            if let Some(end) = output_end {
                                task.set_output_end = Some(end);
                            }
                            task.progress = if outcome.progress.is_empty() {
                                Progress::None
                            } else {
                                Progress::Handler(outcome.progress)
                            };
                            force_first = outcome.force_first_progress;
                        }
                        None => self.graph[id].progress = Progress::None,
                    }
                }
                TaskRole::Stub { .. } => {
                    let task = &mut self.graph[id];
                    task.progress = if task.block {
                        Progress::Stub
                    } else {
                        Progress::None
                    };
                }
                TaskRole::Overall { handler } => {
                    let payload = self.graph[id].ctx.payload.clone();
                    let record = &mut self.stages[handler];
                    if let Some(reset) = record.handler.overall_reset.as_mut() {
                        reset(globals, payload.as_ref()).map_err(|err| {
                            PerformError::Stage(record.handler.name.to_string(), err)
                        })?;
                    }
                    self.graph[id].progress = Progress::None;
                }
                TaskRole::Render { series: sid } => {
                    let incremental = self
                        .pipelines
                        .get(&sid)
                        .and_then(|pipeline| pipeline.context.as_ref())
                        .is_some_and(|ctx| ctx.progressive_render);
                    let (data, output, payload) = snapshot(&self.graph[id].ctx);
                    let rows = self.series.get(&sid).map_or(0, |desc| desc.rows);

                    match self.views.get_mut(&sid) {
                        Some(view) if incremental => {
                            let mut ctx = StageCtx {
                                series: sid.clone(),
                                rows,
                                data,
                                output,
                                payload,
                                output_end: None,
                                globals: &mut *globals,
                            };
                            view.incremental_prepare(&mut ctx)
                                .map_err(|err| PerformError::View(sid.clone(), err))?;
                            self.graph[id].progress = Progress::Render(RenderMode::Incremental);
                        }
                        Some(_) => {
                            self.graph[id].progress = Progress::Render(RenderMode::Full);
                            force_first = true;
                        }
                        None => self.graph[id].progress = Progress::None,
                    }
                }
            }
        }

        if let Some(down) = downstream_of(&self.graph, id) {
            mark_dirty(&mut self.graph, down);
        }
        Ok(force_first)
    }

    /// Run the task's progress body over one due slice.
    fn progress_task(
        &mut self,
        id: TaskId,
        start: usize,
        end: usize,
        globals: &mut G,
    ) -> Result<(), PerformError> {
        let role = self.graph[id].role.clone();
        let mut body = mem::take(&mut self.graph[id].progress);
        let (mod_by, mod_data_count) = {
            let task = &self.graph[id];
            (task.mod_by, task.mod_data_count)
        };

        let outcome = match (&mut body, &role) {
            (Progress::Handler(callbacks), TaskRole::Stage { handler, series: sid }) => {
                let name = self.stages[*handler].handler.name.clone();
                let mut result = Ok(());
                for callback in callbacks.iter_mut() {
                    let (data, output, payload) = snapshot(&self.graph[id].ctx);
                    let rows = self.series.get(sid).map_or(0, |desc| desc.rows);
                    let mut ctx = StageCtx {
                        series: sid.clone(),
                        rows,
                        data,
                        output,
                        payload,
                        output_end: None,
                        globals: &mut *globals,
                    };
                    let mut slice = Slice::new(start, end, mod_by, mod_data_count);
                    if let Err(err) = callback(&mut slice, &mut ctx) {
                        result = Err(PerformError::Stage(name.to_string(), err));
                        break;
                    }
                    let output = ctx.output.take();
                    let output_end = ctx.output_end;
                    let task = &mut self.graph[id];
                    task.ctx.output = output;
                    if let Some(end) = output_end {
                        task.set_output_end = Some(end);
                    }
                }
                result
            }
            (Progress::Stub, TaskRole::Stub { agent, .. }) => {
                mark_dirty(&mut self.graph, *agent);
                if let Some(down) = downstream_of(&self.graph, id) {
                    mark_dirty(&mut self.graph, down);
                }
                Ok(())
            }
            (Progress::Render(mode), TaskRole::Render { series: sid }) => {
                let (data, output, payload) = snapshot(&self.graph[id].ctx);
                let rows = self.series.get(sid).map_or(0, |desc| desc.rows);
                match self.views.get_mut(sid) {
                    Some(view) => {
                        let mut ctx = StageCtx {
                            series: sid.clone(),
                            rows,
                            data,
                            output,
                            payload,
                            output_end: None,
                            globals: &mut *globals,
                        };
                        let result = match mode {
                            RenderMode::Full => view.render(&mut ctx),
                            RenderMode::Incremental => {
                                let mut slice = Slice::new(start, end, mod_by, mod_data_count);
                                view.incremental_render(&mut slice, &mut ctx)
                            }
                        };
                        result.map_err(|err| PerformError::View(sid.clone(), err))
                    }
                    None => Ok(()),
                }
            }
            _ => Ok(()),
        };

        self.graph[id].progress = body;
        outcome
    }
}

fn snapshot(ctx: &TaskCtx) -> (Option<Dynamic>, Option<Dynamic>, Option<Dynamic>) {
    (ctx.data.clone(), ctx.output.clone(), ctx.payload.clone())
}

fn need_set_dirty(opts: &PassOptions, series: &SeriesId) -> bool {
    opts.set_dirty
        && opts
            .dirty_set
            .as_ref()
            .is_none_or(|set| set.contains(series))
}

fn upstream_of<G>(graph: &TaskGraph<G>, id: TaskId) -> Option<TaskId> {
    graph.neighbors_directed(id, Direction::Incoming).next()
}

fn downstream_of<G>(graph: &TaskGraph<G>, id: TaskId) -> Option<TaskId> {
    graph.neighbors_directed(id, Direction::Outgoing).next()
}

/// Dirty a task. A stub carries the signal into its agent so the overall
/// task recomputes whenever any of its member pipelines does.
fn mark_dirty<G>(graph: &mut TaskGraph<G>, id: TaskId) {
    let agent = match graph.node_weight_mut(id) {
        Some(task) => {
            task.dirty = true;
            match task.role {
                TaskRole::Stub { agent, .. } => Some(agent),
                _ => None,
            }
        }
        None => None,
    };
    if let Some(agent) = agent
        && let Some(task) = graph.node_weight_mut(agent)
    {
        task.dirty = true;
    }
}

/// Make `down` the sole downstream of `up`, detaching whatever either end
/// was linked to before. Any change of shape dirties the downstream task.
fn link<G>(graph: &mut TaskGraph<G>, up: TaskId, down: TaskId) {
    if downstream_of(graph, up) == Some(down) {
        if graph[up].dirty {
            mark_dirty(graph, down);
        }
        return;
    }

    let stale: Vec<_> = graph
        .edges_directed(up, Direction::Outgoing)
        .map(|edge| edge.id())
        .chain(
            graph
                .edges_directed(down, Direction::Incoming)
                .map(|edge| edge.id()),
        )
        .collect();
    for edge in stale {
        graph.remove_edge(edge);
    }

    graph.add_edge(up, down, ());
    mark_dirty(graph, down);
}

fn pipe_into<G>(graph: &mut TaskGraph<G>, pipeline: &mut Pipeline, id: TaskId) {
    if let Some(tail) = pipeline.tail {
        link(graph, tail, id);
    } else {
        pipeline.head = Some(id);
    }

    let task = &mut graph[id];
    task.pipeline = Some(pipeline.id.clone());
    task.idx_in_pipeline = pipeline.count;
    pipeline.tail = Some(id);
    pipeline.count += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::stage::Reset;
    use crate::{Progressive, SeriesDesc, SeriesId};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        visited: Vec<usize>,
        resets: usize,
        overall_resets: usize,
        renders: usize,
        incremental_rows: usize,
    }

    struct IncrementalView;

    impl SeriesView<Recorder> for IncrementalView {
        fn incremental(&self) -> bool {
            true
        }

        fn render(&mut self, ctx: &mut StageCtx<'_, Recorder>) -> anyhow::Result<()> {
            ctx.globals.renders += 1;
            Ok(())
        }

        fn incremental_render(
            &mut self,
            slice: &mut Slice,
            ctx: &mut StageCtx<'_, Recorder>,
        ) -> anyhow::Result<()> {
            ctx.globals.incremental_rows += slice.count();
            Ok(())
        }
    }

    struct BlockView;

    impl SeriesView<Recorder> for BlockView {
        fn render(&mut self, ctx: &mut StageCtx<'_, Recorder>) -> anyhow::Result<()> {
            ctx.globals.renders += 1;
            Ok(())
        }
    }

    fn visit_stage() -> StageHandler<Recorder> {
        StageHandler::new("visit").target(Target::All).reset(|ctx: &mut StageCtx<'_, Recorder>| {
            ctx.globals.resets += 1;
            Ok(Reset::progress(|slice, ctx: &mut StageCtx<'_, Recorder>| {
                for i in slice {
                    ctx.globals.visited.push(i);
                }
                Ok(())
            }))
        })
    }

    fn desc(rows: usize, step: usize, threshold: usize) -> SeriesDesc {
        SeriesDesc::new(SeriesId::from("s"), "line", Arc::new(()), rows).progressive(
            Progressive {
                step,
                threshold,
                ..Progressive::default()
            },
        )
    }

    /// A zero-budget tick yields after every pass, so each `progress` call
    /// runs exactly one pass.
    fn one_pass() -> Tick {
        Tick::new(Duration::ZERO)
    }

    #[test]
    fn progressive_pipeline_advances_in_chunks() {
        let mut globals = Recorder::default();
        let mut scheduler = Scheduler::new(Vec::new(), vec![visit_stage()]);
        scheduler.set_view(SeriesId::from("s"), Box::new(IncrementalView));
        scheduler.prepare(vec![desc(120, 50, 40)], &globals).unwrap();

        assert!(scheduler.progress(&mut globals, None, &mut one_pass()).unwrap());
        assert_eq!(globals.visited.len(), 50);
        assert_eq!(globals.incremental_rows, 50);

        assert!(scheduler.progress(&mut globals, None, &mut one_pass()).unwrap());
        assert_eq!(globals.visited.len(), 100);

        assert!(!scheduler.progress(&mut globals, None, &mut one_pass()).unwrap());
        assert_eq!(globals.visited, (0..120).collect::<Vec<_>>());
        assert_eq!(globals.incremental_rows, 120);
        // The cursor never went backwards and nothing was revisited.
        assert_eq!(globals.resets, 1);
    }

    #[test]
    fn blocking_pass_completes_partial_progress() {
        let mut globals = Recorder::default();
        let mut scheduler = Scheduler::new(Vec::new(), vec![visit_stage()]);
        scheduler.set_view(SeriesId::from("s"), Box::new(IncrementalView));
        scheduler.prepare(vec![desc(120, 50, 40)], &globals).unwrap();

        scheduler.progress(&mut globals, None, &mut one_pass()).unwrap();
        assert_eq!(globals.visited.len(), 50);

        let opts = PassOptions {
            block: true,
            ..PassOptions::default()
        };
        scheduler.perform_visual_tasks(&mut globals, None, &opts).unwrap();

        // The blocking call picked up where the bounded steps left off.
        assert_eq!(globals.visited, (0..120).collect::<Vec<_>>());
        assert_eq!(globals.resets, 1);
    }

    #[test]
    fn mod_sampling_interleaves_chunks() {
        let mut globals = Recorder::default();
        let mut scheduler = Scheduler::new(Vec::new(), vec![visit_stage()]);
        scheduler.set_view(SeriesId::from("s"), Box::new(IncrementalView));
        let series = SeriesDesc::new(SeriesId::from("s"), "line", Arc::new(()), 12).progressive(
            Progressive {
                step: 4,
                threshold: 10,
                chunk_mode: ChunkMode::Mod,
                ..Progressive::default()
            },
        );
        scheduler.prepare(vec![series], &globals).unwrap();

        scheduler.progress(&mut globals, None, &mut one_pass()).unwrap();
        // mod_by = ceil(12 / 4) = 3: the first chunk strides the dataset.
        assert_eq!(globals.visited, vec![0, 3, 6, 9]);

        let mut tick = Tick::new(Duration::from_secs(1));
        scheduler.progress(&mut globals, None, &mut tick).unwrap();
        let mut seen = globals.visited.clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..12).collect::<Vec<_>>());
        assert_eq!(globals.visited.len(), 12);
    }

    #[test]
    fn sampling_change_discards_partial_progress() {
        let data: Dynamic = Arc::new(());
        let mut globals = Recorder::default();
        let mut scheduler = Scheduler::new(Vec::new(), vec![visit_stage()]);
        scheduler.set_view(SeriesId::from("s"), Box::new(IncrementalView));
        let series = SeriesDesc::new(SeriesId::from("s"), "line", data.clone(), 12).progressive(
            Progressive {
                step: 4,
                threshold: 10,
                chunk_mode: ChunkMode::Mod,
                ..Progressive::default()
            },
        );
        scheduler.prepare(vec![series], &globals).unwrap();

        scheduler.progress(&mut globals, None, &mut one_pass()).unwrap();
        assert_eq!(globals.visited, vec![0, 3, 6, 9]);

        // Growing the dataset changes the sampling window, which must throw
        // the partially visited set away rather than mix two mappings.
        scheduler.append_data(&SeriesId::from("s"), data, 16).unwrap();
        globals.visited.clear();

        let mut tick = Tick::new(Duration::from_secs(1));
        scheduler.progress(&mut globals, None, &mut tick).unwrap();
        let mut seen = globals.visited.clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..16).collect::<Vec<_>>());
        assert_eq!(globals.resets, 2);
    }

    #[test]
    fn appended_rows_flow_without_reset() {
        let data: Dynamic = Arc::new(());
        let mut globals = Recorder::default();
        let mut scheduler = Scheduler::new(Vec::new(), vec![visit_stage()]);
        let series = SeriesDesc::new(SeriesId::from("s"), "line", data.clone(), 10);
        scheduler.prepare(vec![series], &globals).unwrap();

        let mut tick = Tick::new(Duration::from_secs(1));
        scheduler.progress(&mut globals, None, &mut tick).unwrap();
        assert_eq!(globals.visited, (0..10).collect::<Vec<_>>());

        // Same handle: only the due range grows, no reset happens and the
        // already-processed prefix is not revisited.
        scheduler.append_data(&SeriesId::from("s"), data, 15).unwrap();
        scheduler.progress(&mut globals, None, &mut tick).unwrap();
        assert_eq!(globals.visited, (0..15).collect::<Vec<_>>());
        assert_eq!(globals.resets, 1);
    }

    #[test]
    fn replaced_dataset_resets_the_pipeline() {
        let mut globals = Recorder::default();
        let mut scheduler = Scheduler::new(Vec::new(), vec![visit_stage()]);
        let series = SeriesDesc::new(SeriesId::from("s"), "line", Arc::new(()), 5);
        scheduler.prepare(vec![series], &globals).unwrap();

        let mut tick = Tick::new(Duration::from_secs(1));
        scheduler.progress(&mut globals, None, &mut tick).unwrap();
        assert_eq!(globals.visited.len(), 5);

        scheduler
            .append_data(&SeriesId::from("s"), Arc::new(()), 8)
            .unwrap();
        scheduler.progress(&mut globals, None, &mut tick).unwrap();

        assert_eq!(globals.resets, 2);
        assert_eq!(globals.visited.len(), 5 + 8);
    }

    #[test]
    fn downstream_follows_upstream_reset() {
        #[derive(Default)]
        struct Counts {
            first: usize,
            second: usize,
        }

        let first = StageHandler::new("first").target(Target::All).reset(
            |ctx: &mut StageCtx<'_, Counts>| {
                ctx.globals.first += 1;
                Ok(Reset::none())
            },
        );
        let second = StageHandler::new("second").target(Target::All).reset(
            |ctx: &mut StageCtx<'_, Counts>| {
                ctx.globals.second += 1;
                Ok(Reset::none())
            },
        );

        let mut globals = Counts::default();
        let mut scheduler = Scheduler::new(Vec::new(), vec![first, second]);
        let series = SeriesDesc::new(SeriesId::from("s"), "line", Arc::new(()), 10);
        scheduler.prepare(vec![series], &globals).unwrap();

        let mut tick = Tick::new(Duration::from_secs(1));
        scheduler.progress(&mut globals, None, &mut tick).unwrap();
        assert_eq!((globals.first, globals.second), (1, 1));

        // Invalidating the source re-resets the whole chain, in order.
        scheduler.restore_data(None);
        scheduler.progress(&mut globals, None, &mut tick).unwrap();
        assert_eq!((globals.first, globals.second), (2, 2));

        // A clean pass resets nothing.
        scheduler.unfinished = true;
        scheduler.progress(&mut globals, None, &mut tick).unwrap();
        assert_eq!((globals.first, globals.second), (2, 2));
    }

    #[test]
    fn overall_stage_resets_once_per_pass() {
        let aggregate = StageHandler::new("legend")
            .target(Target::Kind("line".into()))
            .overall_reset(|globals: &mut Recorder, _payload| {
                globals.overall_resets += 1;
                Ok(())
            });

        let mut globals = Recorder::default();
        let mut scheduler = Scheduler::new(Vec::new(), vec![aggregate]);
        let a = SeriesDesc::new(SeriesId::from("a"), "line", Arc::new(()), 10);
        let b = SeriesDesc::new(SeriesId::from("b"), "line", Arc::new(()), 10);
        scheduler.prepare(vec![a, b], &globals).unwrap();

        let mut tick = Tick::new(Duration::from_secs(1));
        scheduler.progress(&mut globals, None, &mut tick).unwrap();
        // Both member pipelines were dirty, the aggregate ran exactly once.
        assert_eq!(globals.overall_resets, 1);

        // Nothing dirty: the aggregate stays put.
        scheduler.unfinished = true;
        scheduler.progress(&mut globals, None, &mut tick).unwrap();
        assert_eq!(globals.overall_resets, 1);

        // Dirtying one member is enough to recompute the aggregate, once.
        let opts = PassOptions {
            set_dirty: true,
            dirty_set: Some(HashSet::from([SeriesId::from("a")])),
            ..PassOptions::default()
        };
        scheduler.perform_visual_tasks(&mut globals, None, &opts).unwrap();
        assert_eq!(globals.overall_resets, 2);
    }

    #[test]
    fn stage_with_both_resets_is_rejected() {
        let handler = StageHandler::new("both")
            .reset(|_ctx: &mut StageCtx<'_, Recorder>| Ok(Reset::none()))
            .overall_reset(|_, _| Ok(()));
        let mut scheduler = Scheduler::new(Vec::new(), vec![handler]);

        let err = scheduler
            .prepare(vec![desc(10, 0, 100)], &Recorder::default())
            .unwrap_err();
        assert!(matches!(err, SetupError::AmbiguousStage(_)));
    }

    #[test]
    fn overall_stage_on_all_series_is_rejected() {
        let handler: StageHandler<Recorder> = StageHandler::new("agg")
            .target(Target::All)
            .overall_reset(|_, _| Ok(()));
        let mut scheduler = Scheduler::new(Vec::new(), vec![handler]);

        let err = scheduler
            .prepare(vec![desc(10, 0, 100)], &Recorder::default())
            .unwrap_err();
        assert!(matches!(err, SetupError::OverallOnAllSeries(_)));
    }

    #[test]
    fn filtered_series_skips_handler_callbacks() {
        let mut globals = Recorder::default();
        let mut scheduler = Scheduler::new(Vec::new(), vec![visit_stage()]);
        let mut series = SeriesDesc::new(SeriesId::from("s"), "line", Arc::new(()), 10);
        series.filtered = true;
        scheduler.prepare(vec![series], &globals).unwrap();

        let mut tick = Tick::new(Duration::from_secs(1));
        scheduler.progress(&mut globals, None, &mut tick).unwrap();
        assert!(globals.visited.is_empty());
        assert_eq!(globals.resets, 0);

        scheduler
            .set_series_filtered(&SeriesId::from("s"), false)
            .unwrap();
        let opts = PassOptions {
            set_dirty: true,
            ..PassOptions::default()
        };
        scheduler.perform_visual_tasks(&mut globals, None, &opts).unwrap();
        assert_eq!(globals.visited, (0..10).collect::<Vec<_>>());
        assert_eq!(globals.resets, 1);
    }

    #[test]
    fn non_incremental_view_renders_once_per_cycle() {
        let mut globals = Recorder::default();
        let mut scheduler = Scheduler::new(Vec::new(), vec![visit_stage()]);
        scheduler.set_view(SeriesId::from("s"), Box::new(BlockView));
        scheduler.prepare(vec![desc(120, 50, 40)], &globals).unwrap();

        // The blocking render task disables progressive mode for the whole
        // pipeline; one pass finishes everything.
        assert!(!scheduler.progress(&mut globals, None, &mut one_pass()).unwrap());
        assert_eq!(globals.visited.len(), 120);
        assert_eq!(globals.renders, 1);

        scheduler.restore_data(None);
        scheduler.progress(&mut globals, None, &mut one_pass()).unwrap();
        assert_eq!(globals.renders, 2);
    }

    #[test]
    fn pinned_output_end_drives_downstream_range() {
        let shrink = StageHandler::new("shrink").target(Target::All).reset(
            |ctx: &mut StageCtx<'_, Recorder>| {
                let keep = ctx.rows / 2;
                ctx.set_output_end(keep);
                Ok(Reset::none())
            },
        );

        let mut globals = Recorder::default();
        let mut scheduler = Scheduler::new(Vec::new(), vec![shrink, visit_stage()]);
        let series = SeriesDesc::new(SeriesId::from("s"), "line", Arc::new(()), 10);
        scheduler.prepare(vec![series], &globals).unwrap();

        let mut tick = Tick::new(Duration::from_secs(1));
        scheduler.progress(&mut globals, None, &mut tick).unwrap();
        assert_eq!(globals.visited, (0..5).collect::<Vec<_>>());
    }

    #[test]
    fn kind_targeted_stage_ignores_other_series() {
        let handler = StageHandler::new("lines-only")
            .target(Target::Kind("line".into()))
            .reset(|ctx: &mut StageCtx<'_, Recorder>| {
                ctx.globals.resets += 1;
                Ok(Reset::none())
            });

        let mut globals = Recorder::default();
        let mut scheduler = Scheduler::new(Vec::new(), vec![handler]);
        let a = SeriesDesc::new(SeriesId::from("a"), "line", Arc::new(()), 10);
        let b = SeriesDesc::new(SeriesId::from("b"), "scatter", Arc::new(()), 10);
        scheduler.prepare(vec![a, b], &globals).unwrap();

        let mut tick = Tick::new(Duration::from_secs(1));
        scheduler.progress(&mut globals, None, &mut tick).unwrap();
        assert_eq!(globals.resets, 1);
        assert_eq!(scheduler.pipeline(&SeriesId::from("a")).unwrap().len(), 2);
        assert_eq!(scheduler.pipeline(&SeriesId::from("b")).unwrap().len(), 1);
    }

    #[test]
    fn removed_series_drops_its_tasks() {
        let mut globals = Recorder::default();
        let mut scheduler = Scheduler::new(Vec::new(), vec![visit_stage()]);
        let a = SeriesDesc::new(SeriesId::from("a"), "line", Arc::new(()), 10);
        let b = SeriesDesc::new(SeriesId::from("b"), "line", Arc::new(()), 10);
        scheduler.prepare(vec![a.clone(), b], &globals).unwrap();

        let mut tick = Tick::new(Duration::from_secs(1));
        scheduler.progress(&mut globals, None, &mut tick).unwrap();
        assert_eq!(globals.visited.len(), 20);

        scheduler.prepare(vec![a], &globals).unwrap();
        assert!(scheduler.pipeline(&SeriesId::from("b")).is_none());
        assert_eq!(scheduler.series().len(), 1);

        // The surviving pipeline was re-piped, not re-run from scratch.
        globals.visited.clear();
        scheduler.progress(&mut globals, None, &mut tick).unwrap();
        assert!(globals.visited.is_empty());
    }

    #[test]
    fn pinned_output_end_survives_bounded_passes() {
        // Pins once, on the first reset only.
        let mut pin = Some(6);
        let clamp = StageHandler::new("clamp").target(Target::All).reset(
            move |ctx: &mut StageCtx<'_, Recorder>| {
                if let Some(end) = pin.take() {
                    ctx.set_output_end(end);
                }
                Ok(Reset::progress(|slice, ctx: &mut StageCtx<'_, Recorder>| {
                    for i in slice {
                        ctx.globals.visited.push(i);
                    }
                    Ok(())
                }))
            },
        );

        let mut globals = Recorder::default();
        let mut scheduler = Scheduler::new(Vec::new(), vec![clamp]);
        scheduler.set_view(SeriesId::from("s"), Box::new(IncrementalView));
        scheduler.prepare(vec![desc(12, 4, 1)], &globals).unwrap();

        // The stage walks all 12 rows in bounded steps while its published
        // end stays clamped, so the renderer never sees past row 6.
        scheduler.progress(&mut globals, None, &mut one_pass()).unwrap();
        assert_eq!(globals.incremental_rows, 4);
        scheduler.progress(&mut globals, None, &mut one_pass()).unwrap();
        assert_eq!(globals.incremental_rows, 6);
        assert!(!scheduler.progress(&mut globals, None, &mut one_pass()).unwrap());
        assert_eq!(globals.visited.len(), 12);
        assert_eq!(globals.incremental_rows, 6);

        // Restoring the data resets the stage; with no pin re-installed the
        // full range reaches the renderer.
        scheduler.restore_data(None);
        let mut tick = Tick::new(Duration::from_secs(1));
        scheduler.progress(&mut globals, None, &mut tick).unwrap();
        assert_eq!(globals.incremental_rows, 6 + 12);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "must not decrease")]
    fn shrinking_published_end_is_caught_in_debug() {
        let wobble = StageHandler::new("wobble").target(Target::All).reset(
            |_ctx: &mut StageCtx<'_, Recorder>| {
                Ok(Reset::progress(|slice, ctx| {
                    // Publishes a shorter output on the second chunk.
                    let end = if slice.start() == 0 { 8 } else { 4 };
                    ctx.set_output_end(end);
                    Ok(())
                }))
            },
        );

        let mut globals = Recorder::default();
        let mut scheduler = Scheduler::new(Vec::new(), vec![wobble]);
        scheduler.set_view(SeriesId::from("s"), Box::new(IncrementalView));
        scheduler.prepare(vec![desc(12, 4, 1)], &globals).unwrap();

        scheduler.progress(&mut globals, None, &mut one_pass()).unwrap();
        scheduler.progress(&mut globals, None, &mut one_pass()).unwrap();
    }

    #[test]
    fn count_feeds_stage_tasks_without_an_upstream() {
        let counted = StageHandler::new("counted")
            .target(Target::All)
            .count(|ctx: &StageCtx<'_, Recorder>| ctx.rows / 2)
            .reset(|_ctx: &mut StageCtx<'_, Recorder>| {
                Ok(Reset::progress(|slice, ctx: &mut StageCtx<'_, Recorder>| {
                    for i in slice {
                        ctx.globals.visited.push(i);
                    }
                    Ok(())
                }))
            });

        let mut globals = Recorder::default();
        let mut scheduler = Scheduler::new(Vec::new(), vec![counted]);
        scheduler.restore_pipelines(vec![desc(10, 0, 0)]);

        // A stage task with nothing piped into it takes its due range from
        // the handler's count instead of an upstream's published end.
        let head = scheduler.graph.add_node(Task::new(TaskRole::Stage {
            handler: 0,
            series: SeriesId::from("s"),
        }));
        let unfinished = scheduler
            .perform_task(head, &PerformArgs::default(), &mut globals)
            .unwrap();

        assert!(!unfinished);
        assert_eq!(scheduler.graph[head].due_end, 5);
        assert_eq!(globals.visited, (0..5).collect::<Vec<_>>());
    }
}
