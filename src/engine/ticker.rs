use std::time::{Duration, Instant};

use tracing::trace;

/// How the host wakes the scheduler up between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickerKind {
    /// The host ticks on its own cadence, typically once per animation
    /// frame. [`Ticker::tick`] never asks for an extra wake-up.
    Frame,
    /// The host owns no frame loop and reposts itself a wake-up message
    /// whenever [`Ticker::tick`] returns `true`.
    Message,
}

const FRAME_QUOTA: Duration = Duration::from_millis(1);
const MESSAGE_QUOTA: Duration = Duration::from_millis(5);

/// Running totals over every tick driven through one [`Ticker`].
#[derive(Debug, Clone, Default)]
pub struct TickStats {
    pub ticks: u64,
    /// Wall time the last tick actually spent working.
    pub last_cost: Duration,
    /// Budget the last tick left unused.
    pub last_idle: Duration,
    pub total_rows: u64,
    pub avg_rows_per_tick: f64,
}

/// Time-budget driver for cooperative scheduling.
///
/// A frame ticker keeps each tick short so the surrounding loop stays
/// responsive; a message ticker gets a larger budget since nothing else
/// shares its turn.
#[derive(Debug)]
pub struct Ticker {
    kind: TickerKind,
    quota: Duration,
    stats: TickStats,
}

impl Ticker {
    pub fn frame() -> Self {
        Self::with_quota(TickerKind::Frame, FRAME_QUOTA)
    }

    pub fn message() -> Self {
        Self::with_quota(TickerKind::Message, MESSAGE_QUOTA)
    }

    pub fn with_quota(kind: TickerKind, quota: Duration) -> Self {
        Self {
            kind,
            quota,
            stats: TickStats::default(),
        }
    }

    pub fn kind(&self) -> TickerKind {
        self.kind
    }

    pub fn quota(&self) -> Duration {
        self.quota
    }

    pub fn stats(&self) -> &TickStats {
        &self.stats
    }

    /// Run one tick of work under this ticker's budget. Returns whether the
    /// host should post itself another wake-up; always `false` for a frame
    /// ticker, which is assumed to tick again regardless.
    pub fn tick(&mut self, work: impl FnOnce(&mut Tick)) -> bool {
        let mut tick = Tick::new(self.quota);
        work(&mut tick);

        let cost = tick.started.elapsed();
        self.stats.ticks += 1;
        self.stats.last_cost = cost;
        self.stats.last_idle = self.quota.saturating_sub(cost);
        self.stats.total_rows += tick.rows as u64;
        self.stats.avg_rows_per_tick = self.stats.total_rows as f64 / self.stats.ticks as f64;
        trace!(?cost, rows = tick.rows, more = tick.more, "tick");

        self.kind == TickerKind::Message && tick.more
    }
}

/// One tick's remaining-budget view, handed to the work closure.
#[derive(Debug)]
pub struct Tick {
    started: Instant,
    quota: Duration,
    rows: usize,
    more: bool,
}

impl Tick {
    pub fn new(quota: Duration) -> Self {
        Self {
            started: Instant::now(),
            quota,
            rows: 0,
            more: false,
        }
    }

    /// Whether the budget is exhausted and control should return to the
    /// host.
    pub fn should_yield(&self) -> bool {
        self.started.elapsed() >= self.quota
    }

    /// Ask for another tick because work remains.
    pub fn require_more_tick(&mut self) {
        self.more = true;
    }

    pub fn add_rows(&mut self, rows: usize) {
        self.rows += rows;
    }

    /// Rows moved through progress callbacks during this tick.
    pub fn rows(&self) -> usize {
        self.rows
    }
}
