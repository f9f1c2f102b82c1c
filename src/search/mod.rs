//! Search orchestration.
//!
//! [`Engine`] owns at most one in-flight search. On `go` it builds the
//! stopper chain, makes sure the root is expanded (applying Dirichlet noise
//! exactly once per root expansion), spawns the worker pool, and hands
//! control to a driver thread. The driver polls the stoppers, emits
//! periodic `info` events, drains the workers on stop, picks the root move,
//! and reports `bestmove` — unless the search was aborted or the evaluator
//! failed, in which case a diagnostic is emitted and no result is reported.

pub mod params;
pub mod puct;
pub mod stopper;
pub mod time_manager;
pub mod worker;

use crate::cache::EvalCache;
use crate::egtb::EgtbProber;
use crate::encoding::encode_planes;
use crate::eval::batching::{BatchCollector, CollectorConfig, EvalRequest};
use crate::eval::{BackendOptions, BackendRegistry, EvalError};
use crate::position::{Position, PositionError, Verdict};
use crate::tree::{self, ExpansionState, GameTree, Node};
use crate::weights::WeightsFile;
use crossbeam_channel::Sender;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

pub use params::{FpuStrategy, SearchParams};
pub use stopper::{StopReason, TimeControl};
pub use time_manager::{GoLimits, TimeManager};
pub use worker::{SearchContext, SearchStats};

use stopper::{
    ChainedStopper, DeadlineStopper, KldGainStopper, PlayoutLimitStopper, SmartPruningStopper,
    StopContext, Stopper, VisitLimitStopper,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Position(#[from] PositionError),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error(transparent)]
    Weights(#[from] crate::weights::WeightsError),
}

/// Periodic search progress, mapped by the front-end onto an `info` line.
#[derive(Debug, Clone)]
pub struct SearchReport {
    pub depth: u32,
    pub seldepth: u32,
    pub time_ms: u64,
    pub nodes: u64,
    pub nps: u64,
    pub score_cp: i32,
    pub wdl: (u32, u32, u32),
    pub hashfull: u32,
    pub pv: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum SearchEvent {
    Info(SearchReport),
    Diagnostic(String),
    BestMove { best: String, ponder: Option<String> },
}

struct ActiveSearch {
    ctx: Arc<SearchContext>,
    time: Arc<TimeControl>,
    halt: Arc<AtomicBool>,
    driver: Option<JoinHandle<()>>,
    allocated: Option<Duration>,
    started: Instant,
}

/// The search orchestrator: wires position, tree, cache, collector, EGTB,
/// stoppers and workers together, one search at a time.
pub struct Engine {
    params: SearchParams,
    registry: BackendRegistry,
    cache: Arc<EvalCache>,
    collector: BatchCollector,
    abort_flag: Arc<AtomicBool>,
    egtb: Option<Arc<EgtbProber>>,
    tree: GameTree,
    time_manager: TimeManager,
    weights: Option<Arc<WeightsFile>>,
    events: Sender<SearchEvent>,
    active: Option<ActiveSearch>,
}

impl Engine {
    pub fn new(
        params: SearchParams,
        weights: Option<Arc<WeightsFile>>,
        events: Sender<SearchEvent>,
    ) -> Result<Self, EngineError> {
        let registry = BackendRegistry::new();
        let evaluator = registry.create(
            Some(&params.backend),
            &BackendOptions {
                weights: weights.clone(),
                max_batch_size: params.max_batch_size,
            },
        )?;
        let cache = Arc::new(EvalCache::new(params.cache_size));
        let abort_flag = Arc::new(AtomicBool::new(false));
        let collector = BatchCollector::spawn(
            evaluator,
            cache.clone(),
            CollectorConfig {
                max_batch_size: params.max_batch_size,
                batch_timeout: params.batch_timeout,
            },
            abort_flag.clone(),
        );
        let egtb = match &params.syzygy_paths {
            Some(paths) => match EgtbProber::new(paths) {
                Ok(prober) => Some(Arc::new(prober)),
                Err(e) => {
                    warn!("tablebases disabled: {e}");
                    None
                }
            },
            None => None,
        };
        let time_manager = TimeManager::new(params.move_overhead);
        Ok(Engine {
            params,
            registry,
            cache,
            collector,
            abort_flag,
            egtb,
            tree: GameTree::new(),
            time_manager,
            weights,
            events,
            active: None,
        })
    }

    pub fn params(&self) -> &SearchParams {
        &self.params
    }

    pub fn tree(&self) -> &GameTree {
        &self.tree
    }

    pub fn cache(&self) -> &Arc<EvalCache> {
        &self.cache
    }

    /// Apply a `setoption` assignment and react to the ones with side
    /// effects (cache resize, backend swap, tablebase reload).
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<(), EngineError> {
        self.params
            .set_option(name, value)
            .map_err(|e| EngineError::Config(e.to_string()))?;
        let key = name.to_ascii_lowercase();
        match key.as_str() {
            "nn-cache-size" => self.cache.set_capacity(self.params.cache_size),
            "move-overhead-ms" => self
                .time_manager
                .set_move_overhead(self.params.move_overhead),
            "backend" | "max-batch-size" => self.rebuild_backend()?,
            "syzygy-paths" => {
                self.egtb = match &self.params.syzygy_paths {
                    Some(paths) => match EgtbProber::new(paths) {
                        Ok(prober) => Some(Arc::new(prober)),
                        Err(e) => return Err(EngineError::Config(e.to_string())),
                    },
                    None => None,
                };
            }
            _ => {}
        }
        Ok(())
    }

    fn rebuild_backend(&mut self) -> Result<(), EngineError> {
        self.stop();
        let evaluator = self.registry.create(
            Some(&self.params.backend),
            &BackendOptions {
                weights: self.weights.clone(),
                max_batch_size: self.params.max_batch_size,
            },
        )?;
        self.abort_flag = Arc::new(AtomicBool::new(false));
        self.collector = BatchCollector::spawn(
            evaluator,
            self.cache.clone(),
            CollectorConfig {
                max_batch_size: self.params.max_batch_size,
                batch_timeout: self.params.batch_timeout,
            },
            self.abort_flag.clone(),
        );
        Ok(())
    }

    pub fn new_game(&mut self) {
        self.stop();
        self.tree = GameTree::new();
        self.cache.clear();
        self.time_manager.reset();
    }

    /// Point the engine at a controller position; reuses the subtree when
    /// the position continues the current game.
    pub fn set_position(
        &mut self,
        fen: Option<&str>,
        moves: &[String],
    ) -> Result<bool, EngineError> {
        self.stop();
        Ok(self
            .tree
            .reset_to_position(fen, moves, self.params.chess960)?)
    }

    /// Start a search. Returns immediately; results arrive as events.
    pub fn go(&mut self, limits: GoLimits) -> Result<(), EngineError> {
        // Reap (or halt) any previous search first.
        self.stop();
        self.abort_flag.store(false, Ordering::Release);

        let pos = self.tree.head_position().clone();
        if pos.legal_moves().is_empty() {
            // Checkmate or stalemate on the board: report without searching
            // and without touching the evaluator.
            let report = SearchReport {
                depth: 0,
                seldepth: 0,
                time_ms: 0,
                nodes: 0,
                nps: 0,
                score_cp: q_to_centipawns(terminal_q(&pos)),
                wdl: wdl_permille(terminal_q(&pos), 1.0),
                hashfull: self.cache.fullness_permille(),
                pv: Vec::new(),
            };
            self.events.send(SearchEvent::Info(report)).ok();
            self.events
                .send(SearchEvent::BestMove {
                    best: "0000".to_string(),
                    ponder: None,
                })
                .ok();
            return Ok(());
        }

        let allocated = self.time_manager.allocate(&limits, pos.turn());
        let time = Arc::new(TimeControl::new(allocated, limits.ponder));
        let root = self.tree.root();

        self.expand_root_if_needed(&root, &pos)?;

        let mut stoppers: Vec<Box<dyn Stopper>> = Vec::new();
        if let Some(nodes) = limits.nodes {
            stoppers.push(Box::new(VisitLimitStopper::new(
                nodes.min(u32::MAX as u64) as u32
            )));
        }
        if self.params.max_playouts > 0 {
            stoppers.push(Box::new(PlayoutLimitStopper::new(self.params.max_playouts)));
        }
        if allocated.is_some() {
            stoppers.push(Box::new(DeadlineStopper::new(time.clone())));
            if self.params.smart_pruning_factor > 0.0 {
                stoppers.push(Box::new(SmartPruningStopper::new(
                    self.params.smart_pruning_factor,
                    time.clone(),
                )));
            }
        }
        if self.params.min_kldgain_per_node > 0.0 {
            stoppers.push(Box::new(KldGainStopper::new(
                self.params.kldgain_average_interval,
                self.params.min_kldgain_per_node,
            )));
        }
        let chain = ChainedStopper::new(stoppers);

        let visit_target = limits.nodes.map(|n| n.min(u32::MAX as u64) as u32);
        let ctx = Arc::new(SearchContext {
            root: root.clone(),
            root_pos: pos,
            params: self.params.clone(),
            cache: self.cache.clone(),
            collector: self.collector.handle(),
            egtb: self.egtb.clone(),
            stop: AtomicBool::new(false),
            visit_target,
            searchmoves: limits.searchmoves.clone(),
            failure: Mutex::new(None),
            stats: SearchStats::default(),
        });

        let halt = Arc::new(AtomicBool::new(false));
        let driver = {
            let ctx = ctx.clone();
            let time = time.clone();
            let halt = halt.clone();
            let abort = self.abort_flag.clone();
            let events = self.events.clone();
            thread::Builder::new()
                .name("goshawk-search".to_string())
                .spawn(move || drive_search(ctx, chain, time, halt, abort, events))
                .expect("failed to spawn search driver")
        };

        self.active = Some(ActiveSearch {
            ctx,
            time,
            halt,
            driver: Some(driver),
            allocated,
            started: Instant::now(),
        });
        info!("search started (budget {allocated:?})");
        Ok(())
    }

    /// Synchronously evaluate and expand a fresh root, applying Dirichlet
    /// noise once. Counts as the root's own evaluation visit.
    fn expand_root_if_needed(
        &mut self,
        root: &Arc<Node>,
        pos: &Position,
    ) -> Result<(), EngineError> {
        if root.state() == ExpansionState::Expanded || root.terminal().is_terminal() {
            return Ok(());
        }
        if !root.try_claim() {
            return Ok(());
        }
        let fingerprint = pos.fingerprint();
        let key = pos.verify_key();
        let fetched = match self.cache.lookup(fingerprint, &key) {
            Some(record) => Ok(record),
            None => {
                let (request, reply) = EvalRequest::new(fingerprint, encode_planes(pos), key);
                self.collector
                    .handle()
                    .submit(request)
                    .and_then(|()| match reply.recv() {
                        Ok(result) => result,
                        Err(_) => Err(EvalError::Backend("collector reply lost".into())),
                    })
            }
        };
        let record = match fetched {
            Ok(record) => record,
            Err(e) => {
                root.release_claim();
                return Err(EngineError::Eval(e));
            }
        };
        let mut noise_rng;
        let noise = if self.params.dirichlet_epsilon > 0.0 {
            noise_rng = StdRng::from_entropy();
            Some(&mut noise_rng)
        } else {
            None
        };
        root.add_virtual_visit();
        puct::expand_node(root, pos, &record, &self.params, noise);
        puct::backpropagate(
            &[root.clone()],
            record.value as f64,
            record.moves_left as f64,
        );
        Ok(())
    }

    /// Stop the active search; `bestmove` is still reported by the driver.
    pub fn stop(&mut self) {
        if let Some(active) = &self.active {
            active.halt.store(true, Ordering::Release);
            active.ctx.stop.store(true, Ordering::Release);
        }
        self.stop_and_join();
    }

    /// Hard abort: additionally cancels pending evaluator work and
    /// suppresses the result.
    pub fn abort(&mut self) {
        self.abort_flag.store(true, Ordering::Release);
        self.stop();
    }

    /// The pondered move was played: arm the time predicates from now.
    pub fn ponderhit(&mut self) {
        if let Some(active) = &self.active {
            active.time.ponderhit();
        }
    }

    /// Block until the active search has finished and been reaped.
    pub fn wait(&mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        if let Some(mut active) = self.active.take() {
            if let Some(driver) = active.driver.take() {
                driver.join().ok();
            }
            let spent = active.started.elapsed();
            if let Some(allocated) = active.allocated {
                self.time_manager.on_move_done(allocated, spent);
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            active.halt.store(true, Ordering::Release);
            active.ctx.stop.store(true, Ordering::Release);
        }
        self.stop_and_join();
    }
}

fn drive_search(
    ctx: Arc<SearchContext>,
    mut chain: ChainedStopper,
    time: Arc<TimeControl>,
    halt: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
    events: Sender<SearchEvent>,
) {
    let started = Instant::now();

    // A pre-satisfied stopper (visit target already reached, movetime 0)
    // must not let any worker start a descent.
    if poll_stoppers(&ctx, &mut chain) {
        ctx.stop.store(true, Ordering::Release);
    }

    let workers: Vec<JoinHandle<()>> = if ctx.stop.load(Ordering::Acquire) {
        Vec::new()
    } else {
        (0..ctx.params.threads.max(1))
            .map(|i| {
                let ctx = ctx.clone();
                thread::Builder::new()
                    .name(format!("goshawk-worker-{i}"))
                    .spawn(move || worker::worker_loop(&ctx))
                    .expect("failed to spawn search worker")
            })
            .collect()
    };

    let mut last_info = Instant::now();
    while !ctx.stop.load(Ordering::Acquire) {
        if halt.load(Ordering::Acquire) {
            ctx.stop.store(true, Ordering::Release);
            break;
        }
        if poll_stoppers(&ctx, &mut chain) {
            ctx.stop.store(true, Ordering::Release);
            break;
        }
        if last_info.elapsed() >= Duration::from_millis(500) {
            events
                .send(SearchEvent::Info(build_report(&ctx, started)))
                .ok();
            last_info = Instant::now();
        }
        thread::sleep(Duration::from_millis(1));
    }

    for w in workers {
        w.join().ok();
    }

    // `go ponder` holds the result until ponderhit or stop.
    while time.is_pondering() && !halt.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(2));
    }

    if abort.load(Ordering::Acquire) {
        events
            .send(SearchEvent::Diagnostic("search aborted".to_string()))
            .ok();
        return;
    }
    if let Some(failure) = ctx.failed() {
        events
            .send(SearchEvent::Diagnostic(format!(
                "search aborted by evaluator failure: {failure}"
            )))
            .ok();
        return;
    }

    events
        .send(SearchEvent::Info(build_report(&ctx, started)))
        .ok();

    let mut rng = StdRng::from_entropy();
    let choice = if ctx.searchmoves.is_empty() {
        puct::sample_root_edge(&ctx.root, &ctx.root_pos, &ctx.params, &mut rng)
    } else {
        puct::pick_best_root_edge_among(&ctx.root, &ctx.root_pos, &ctx.params, &ctx.searchmoves)
            .or_else(|| puct::sample_root_edge(&ctx.root, &ctx.root_pos, &ctx.params, &mut rng))
    };
    match choice {
        Some(idx) => {
            let edges = ctx.root.edges().expect("root expanded before search");
            let best_mv = edges[idx].mv().clone();
            let best = ctx.root_pos.uci(&best_mv);
            let ponder = puct::ponder_edge(&ctx.root, idx).map(|(child, pidx)| {
                let after = ctx.root_pos.apply(&best_mv);
                let pedges = child.edges().expect("ponder child expanded");
                after.uci(pedges[pidx].mv())
            });
            events.send(SearchEvent::BestMove { best, ponder }).ok();
        }
        None => {
            events
                .send(SearchEvent::Diagnostic(
                    "no move available at root".to_string(),
                ))
                .ok();
            events
                .send(SearchEvent::BestMove {
                    best: "0000".to_string(),
                    ponder: None,
                })
                .ok();
        }
    }
}

fn poll_stoppers(ctx: &SearchContext, chain: &mut ChainedStopper) -> bool {
    // One O(root children) gather per poll, shared by every predicate.
    let child_visits: Vec<u32> = match ctx.root.edges() {
        Some(edges) => edges.iter().map(|e| e.visits()).collect(),
        None => Vec::new(),
    };
    let stop_ctx = StopContext {
        root_visits: ctx.root.n(),
        playouts: ctx.stats.iterations(),
        child_visits: &child_visits,
    };
    if let Some(target) = ctx.visit_target {
        if stop_ctx.root_visits >= target {
            return true;
        }
    }
    chain.check(&stop_ctx).is_some()
}

fn build_report(ctx: &SearchContext, started: Instant) -> SearchReport {
    let elapsed = started.elapsed();
    let time_ms = elapsed.as_millis() as u64;
    let playouts = ctx.stats.playouts.load(Ordering::Relaxed);
    let nps = if time_ms > 0 {
        playouts * 1000 / time_ms
    } else {
        playouts * 1000
    };
    let q = ctx.root.q();
    SearchReport {
        depth: ctx.stats.avg_depth(),
        seldepth: ctx.stats.max_depth.load(Ordering::Relaxed),
        time_ms,
        nodes: ctx.root.n() as u64,
        nps,
        score_cp: q_to_centipawns(q),
        wdl: wdl_permille(q, draw_weight(ctx)),
        hashfull: ctx.cache.fullness_permille(),
        pv: tree::principal_variation_from(&ctx.root, &ctx.root_pos, 12),
    }
}

fn draw_weight(ctx: &SearchContext) -> f64 {
    match ctx.root.terminal() {
        crate::tree::Terminal::Draw | crate::tree::Terminal::TablebaseDraw => 1.0,
        _ => 0.5,
    }
}

/// Classic centipawn mapping of the value head output.
fn q_to_centipawns(q: f64) -> i32 {
    let clamped = q.clamp(-0.999, 0.999);
    let cp = 90.0 * (1.5637 * clamped).tan();
    cp.clamp(-12800.0, 12800.0) as i32
}

fn wdl_permille(q: f64, draw_share: f64) -> (u32, u32, u32) {
    let d = (draw_share.clamp(0.0, 1.0) * (1.0 - q.abs())).clamp(0.0, 1.0);
    let w = ((1.0 + q - d) / 2.0).clamp(0.0, 1.0);
    let wp = (w * 1000.0).round() as u32;
    let dp = (d * 1000.0).round() as u32;
    let lp = 1000u32.saturating_sub(wp + dp);
    (wp, dp, lp)
}

fn terminal_q(pos: &Position) -> f64 {
    match pos.verdict() {
        Verdict::Loss => -1.0,
        Verdict::Win => 1.0,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn centipawn_mapping_is_monotone_and_bounded() {
        assert_eq!(q_to_centipawns(0.0), 0);
        assert!(q_to_centipawns(0.5) > q_to_centipawns(0.1));
        assert!(q_to_centipawns(-0.5) < 0);
        assert!(q_to_centipawns(1.0) <= 12800);
        assert!(q_to_centipawns(-1.0) >= -12800);
    }

    #[test]
    fn wdl_sums_to_thousand() {
        for q in [-1.0, -0.4, 0.0, 0.7, 1.0] {
            let (w, d, l) = wdl_permille(q, 0.5);
            assert_eq!(w + d + l, 1000, "q={q}");
        }
    }
}
