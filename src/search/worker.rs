//! Search workers.
//!
//! Each worker loops root-to-leaf: descend by PUCT (leaving a virtual visit
//! on every node of the path), claim the leaf, resolve it (terminal check,
//! tablebase probe, cache, or batched network evaluation), then
//! backpropagate. A worker that loses the claim race waits on the shared
//! in-flight evaluation and cancels its playout: virtual visits come off,
//! nothing is double-counted, and the claimer's virtual loss keeps the next
//! descent away from the contested path.

use crate::eval::batching::{CollectorHandle, EvalRequest};
use crate::eval::{EvalError, EvalRecord};
use crate::cache::EvalCache;
use crate::egtb::EgtbProber;
use crate::encoding::encode_planes;
use crate::position::{Position, Verdict};
use crate::search::params::SearchParams;
use crate::search::puct;
use crate::tree::{ExpansionState, Node, Terminal};
use log::error;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct SearchStats {
    pub playouts: AtomicU64,
    pub collisions: AtomicU64,
    pub cache_hits: AtomicU64,
    pub evals: AtomicU64,
    pub tb_hits: AtomicU64,
    pub max_depth: AtomicU32,
    pub depth_sum: AtomicU64,
}

impl SearchStats {
    /// Worker iterations: completed playouts plus cancelled collisions.
    pub fn iterations(&self) -> u64 {
        self.playouts.load(Ordering::Relaxed) + self.collisions.load(Ordering::Relaxed)
    }

    /// Mean playout depth in plies, rounded down; at least 1 once any
    /// playout has completed.
    pub fn avg_depth(&self) -> u32 {
        let playouts = self.playouts.load(Ordering::Relaxed);
        if playouts == 0 {
            return 0;
        }
        ((self.depth_sum.load(Ordering::Relaxed) / playouts) as u32).max(1)
    }
}

/// Everything a worker needs, shared across the pool.
pub struct SearchContext {
    pub root: Arc<Node>,
    pub root_pos: Position,
    pub params: SearchParams,
    pub cache: Arc<EvalCache>,
    pub collector: CollectorHandle,
    pub egtb: Option<Arc<EgtbProber>>,
    /// Workers stop initiating descents once set; in-flight evaluations
    /// still complete and apply.
    pub stop: AtomicBool,
    /// Exact root-visit target (`go nodes`); checked before every descent
    /// so a fast evaluator cannot overshoot between stopper polls.
    pub visit_target: Option<u32>,
    /// Root move whitelist from `go searchmoves`; empty means all moves.
    pub searchmoves: Vec<String>,
    /// First evaluator failure, if any; the search aborts without a result.
    pub failure: Mutex<Option<String>>,
    pub stats: SearchStats,
}

impl SearchContext {
    pub fn fail(&self, message: String) {
        let mut slot = self.failure.lock().unwrap();
        if slot.is_none() {
            *slot = Some(message);
        }
        drop(slot);
        self.stop.store(true, Ordering::Release);
    }

    pub fn failed(&self) -> Option<String> {
        self.failure.lock().unwrap().clone()
    }
}

pub fn worker_loop(ctx: &SearchContext) {
    while !ctx.stop.load(Ordering::Acquire) {
        if let Some(target) = ctx.visit_target {
            if ctx.root.n() >= target {
                ctx.stop.store(true, Ordering::Release);
                break;
            }
        }
        if let Err(e) = run_playout(ctx) {
            match e {
                EvalError::Aborted => {}
                ref other => error!("search worker aborting: {other}"),
            }
            ctx.fail(e.to_string());
            return;
        }
    }
}

enum PlayoutOutcome {
    Completed,
    Collision,
}

fn run_playout(ctx: &SearchContext) -> Result<(), EvalError> {
    let mut node = ctx.root.clone();
    let mut pos = ctx.root_pos.clone();
    node.add_virtual_visit();
    let mut path = vec![node.clone()];

    let outcome = loop {
        let terminal = node.terminal();
        if terminal.is_terminal() {
            puct::backpropagate(&path, terminal.value(), 0.0);
            break PlayoutOutcome::Completed;
        }

        match node.state() {
            ExpansionState::Expanded => {
                let idx = puct::select_edge(&node, &ctx.params);
                let edges = node.edges().expect("expanded node has edges");
                let edge = &edges[idx];
                pos = pos.apply(edge.mv());
                let child = edge.child_or_create(&node);
                child.add_virtual_visit();
                path.push(child.clone());
                node = child;
            }
            ExpansionState::Fresh => {
                if node.try_claim() {
                    match resolve_leaf(ctx, &node, &pos, &path) {
                        Ok(outcome) => break outcome,
                        Err(e) => {
                            node.release_claim();
                            puct::cancel_path(&path);
                            return Err(e);
                        }
                    }
                }
                // Lost the claim race; the next pass observes PendingEval.
            }
            ExpansionState::PendingEval => {
                // Another worker owns this leaf. Wait for the shared
                // evaluation (the collector deduplicates by fingerprint),
                // then cancel: the claimer does the only backpropagation.
                let (request, reply) =
                    EvalRequest::new(pos.fingerprint(), encode_planes(&pos), pos.verify_key());
                if let Err(e) = ctx.collector.submit(request) {
                    puct::cancel_path(&path);
                    return Err(e);
                }
                match reply.recv() {
                    Ok(Ok(_)) | Ok(Err(EvalError::Aborted)) => {}
                    Ok(Err(e)) => {
                        puct::cancel_path(&path);
                        return Err(e);
                    }
                    Err(_) => {
                        puct::cancel_path(&path);
                        return Err(EvalError::Backend("collector reply lost".to_string()));
                    }
                }
                puct::cancel_path(&path);
                break PlayoutOutcome::Collision;
            }
        }
    };

    match outcome {
        PlayoutOutcome::Completed => {
            ctx.stats.playouts.fetch_add(1, Ordering::Relaxed);
            let depth = path.len() as u32;
            ctx.stats.max_depth.fetch_max(depth, Ordering::Relaxed);
            ctx.stats
                .depth_sum
                .fetch_add(depth as u64, Ordering::Relaxed);
        }
        PlayoutOutcome::Collision => {
            ctx.stats.collisions.fetch_add(1, Ordering::Relaxed);
            // Give the claimer's evaluation a moment to land before the
            // next descent re-contests the same region.
            std::thread::yield_now();
        }
    }
    Ok(())
}

fn resolve_leaf(
    ctx: &SearchContext,
    node: &Arc<Node>,
    pos: &Position,
    path: &[Arc<Node>],
) -> Result<PlayoutOutcome, EvalError> {
    let terminal = match pos.verdict() {
        Verdict::Loss => Some(Terminal::Loss),
        Verdict::Win => Some(Terminal::Win),
        Verdict::Draw => Some(Terminal::Draw),
        Verdict::Ongoing => None,
    };
    if let Some(tag) = terminal {
        node.make_terminal(tag);
        puct::backpropagate(path, tag.value(), 0.0);
        return Ok(PlayoutOutcome::Completed);
    }

    if let Some(egtb) = &ctx.egtb {
        if let Some(tag) = egtb.probe(pos) {
            node.make_terminal(tag);
            ctx.stats.tb_hits.fetch_add(1, Ordering::Relaxed);
            puct::backpropagate(path, tag.value(), 0.0);
            return Ok(PlayoutOutcome::Completed);
        }
    }

    let record = fetch_record(ctx, pos)?;
    puct::expand_node(node, pos, &record, &ctx.params, None);
    puct::backpropagate(path, record.value as f64, record.moves_left as f64);
    Ok(PlayoutOutcome::Completed)
}

fn fetch_record(ctx: &SearchContext, pos: &Position) -> Result<Arc<EvalRecord>, EvalError> {
    let fingerprint = pos.fingerprint();
    let key = pos.verify_key();
    if let Some(record) = ctx.cache.lookup(fingerprint, &key) {
        ctx.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
        return Ok(record);
    }
    let (request, reply) = EvalRequest::new(fingerprint, encode_planes(pos), key);
    ctx.collector.submit(request)?;
    let record = reply
        .recv()
        .map_err(|_| EvalError::Backend("collector reply lost".to_string()))??;
    ctx.stats.evals.fetch_add(1, Ordering::Relaxed);
    Ok(record)
}
