//! Stop predicates for an in-flight search.
//!
//! A search carries a chain of stoppers; the first one to fire wins. Every
//! predicate is cheap: polling cost is O(number of root children), never
//! O(tree). Time anchors are monotonic and tolerate jitter by clamping
//! negative deltas to zero.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    VisitLimit,
    PlayoutLimit,
    TimeBudget,
    KldGain,
    SmartPruning,
    External,
}

/// Snapshot of search progress handed to the stoppers each poll.
pub struct StopContext<'a> {
    pub root_visits: u32,
    pub playouts: u64,
    /// Per-root-edge visit counts, in edge order.
    pub child_visits: &'a [u32],
}

pub trait Stopper: Send {
    fn check(&mut self, ctx: &StopContext) -> Option<StopReason>;
}

/// Shared movetime anchor, swappable on `ponderhit` without restarting the
/// search.
pub struct TimeControl {
    anchor: Mutex<Instant>,
    budget: Option<Duration>,
    pondering: AtomicBool,
}

impl TimeControl {
    pub fn new(budget: Option<Duration>, pondering: bool) -> Self {
        TimeControl {
            anchor: Mutex::new(Instant::now()),
            budget,
            pondering: AtomicBool::new(pondering),
        }
    }

    /// Time since the anchor, zero-clamped.
    pub fn elapsed(&self) -> Duration {
        let anchor = *self.anchor.lock().unwrap();
        Instant::now().checked_duration_since(anchor).unwrap_or(Duration::ZERO)
    }

    pub fn budget(&self) -> Option<Duration> {
        self.budget
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.budget.map(|b| b.saturating_sub(self.elapsed()))
    }

    pub fn is_pondering(&self) -> bool {
        self.pondering.load(Ordering::Acquire)
    }

    /// Ponderhit: the clock starts now; time predicates arm.
    pub fn ponderhit(&self) {
        *self.anchor.lock().unwrap() = Instant::now();
        self.pondering.store(false, Ordering::Release);
    }
}

pub struct VisitLimitStopper {
    limit: u32,
}

impl VisitLimitStopper {
    pub fn new(limit: u32) -> Self {
        VisitLimitStopper { limit }
    }
}

impl Stopper for VisitLimitStopper {
    fn check(&mut self, ctx: &StopContext) -> Option<StopReason> {
        (ctx.root_visits >= self.limit).then_some(StopReason::VisitLimit)
    }
}

pub struct PlayoutLimitStopper {
    limit: u64,
}

impl PlayoutLimitStopper {
    pub fn new(limit: u64) -> Self {
        PlayoutLimitStopper { limit }
    }
}

impl Stopper for PlayoutLimitStopper {
    fn check(&mut self, ctx: &StopContext) -> Option<StopReason> {
        (ctx.playouts >= self.limit).then_some(StopReason::PlayoutLimit)
    }
}

pub struct DeadlineStopper {
    time: std::sync::Arc<TimeControl>,
}

impl DeadlineStopper {
    pub fn new(time: std::sync::Arc<TimeControl>) -> Self {
        DeadlineStopper { time }
    }
}

impl Stopper for DeadlineStopper {
    fn check(&mut self, _ctx: &StopContext) -> Option<StopReason> {
        if self.time.is_pondering() {
            return None;
        }
        match self.time.budget() {
            Some(budget) if self.time.elapsed() >= budget => Some(StopReason::TimeBudget),
            _ => None,
        }
    }
}

/// Stops when the per-visit KL divergence between successive normalised
/// root visit distributions drops below a threshold: further visits are no
/// longer changing the answer.
pub struct KldGainStopper {
    interval: u64,
    threshold: f64,
    prev_dist: Option<Vec<f64>>,
    prev_visits: u64,
}

impl KldGainStopper {
    pub fn new(interval: u64, threshold: f64) -> Self {
        KldGainStopper {
            interval: interval.max(1),
            threshold,
            prev_dist: None,
            prev_visits: 0,
        }
    }
}

impl Stopper for KldGainStopper {
    fn check(&mut self, ctx: &StopContext) -> Option<StopReason> {
        let visits: u64 = ctx.child_visits.iter().map(|&n| n as u64).sum();
        if visits < self.prev_visits + self.interval {
            return None;
        }
        let total = visits as f64;
        if total <= 0.0 {
            return None;
        }
        let dist: Vec<f64> = ctx
            .child_visits
            .iter()
            .map(|&n| n as f64 / total)
            .collect();

        let fired = match (&self.prev_dist, self.prev_visits) {
            (Some(prev), prev_visits) if prev.len() == dist.len() && visits > prev_visits => {
                let mut kld = 0.0;
                for (p_new, p_old) in dist.iter().zip(prev) {
                    if *p_new > 0.0 {
                        kld += p_new * (p_new / p_old.max(1e-12)).ln();
                    }
                }
                let gain = kld.max(0.0) / (visits - prev_visits) as f64;
                gain < self.threshold
            }
            _ => false,
        };

        self.prev_dist = Some(dist);
        self.prev_visits = visits;
        fired.then_some(StopReason::KldGain)
    }
}

/// Stops when the runner-up root edge can no longer catch the leader in the
/// remaining time, given the observed playout rate.
pub struct SmartPruningStopper {
    factor: f64,
    time: std::sync::Arc<TimeControl>,
    min_playouts: u64,
}

impl SmartPruningStopper {
    pub fn new(factor: f64, time: std::sync::Arc<TimeControl>) -> Self {
        SmartPruningStopper {
            factor,
            time,
            min_playouts: 100,
        }
    }
}

impl Stopper for SmartPruningStopper {
    fn check(&mut self, ctx: &StopContext) -> Option<StopReason> {
        if self.time.is_pondering() || ctx.playouts < self.min_playouts {
            return None;
        }
        let remaining = self.time.remaining()?;
        let elapsed = self.time.elapsed().as_secs_f64();
        if elapsed <= 0.0 || ctx.child_visits.len() < 2 {
            return None;
        }
        let rate = ctx.playouts as f64 / elapsed;
        let mut top = 0u32;
        let mut second = 0u32;
        for &n in ctx.child_visits {
            if n > top {
                second = top;
                top = n;
            } else if n > second {
                second = n;
            }
        }
        let catchable = self.factor * remaining.as_secs_f64() * rate;
        ((top - second) as f64 > catchable).then_some(StopReason::SmartPruning)
    }
}

/// First-to-fire composition.
pub struct ChainedStopper {
    stoppers: Vec<Box<dyn Stopper>>,
}

impl ChainedStopper {
    pub fn new(stoppers: Vec<Box<dyn Stopper>>) -> Self {
        ChainedStopper { stoppers }
    }

    pub fn check(&mut self, ctx: &StopContext) -> Option<StopReason> {
        self.stoppers.iter_mut().find_map(|s| s.check(ctx))
    }
}
