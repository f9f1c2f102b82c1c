//! Shared test utilities for the Goshawk test suite.

use crossbeam_channel::{unbounded, Receiver};
use goshawk::search::{Engine, GoLimits, SearchEvent, SearchParams};
use goshawk::tree::Node;
use std::sync::Arc;
use std::time::Duration;

/// Standard test positions with known properties.
pub mod positions {
    pub const STARTING: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";
    pub const MATE_IN_1_WHITE: &str = "6k1/5ppp/8/8/8/8/8/4R1K1 w - - 0 1"; // Re8#
    pub const STALEMATE: &str = "7k/8/6Q1/6K1/8/8/8/8 b - - 0 1"; // Black stalemated
    pub const FOOLS_MATE: &str = "rnb1kbnr/pppp1ppp/8/4p3/6Pq/5P2/PPPPP2P/RNBQKBNR w KQkq - 1 3";
}

/// Single-threaded, single-batch configuration over the built-in uniform
/// evaluator stub: fully deterministic searches.
pub fn deterministic_params() -> SearchParams {
    SearchParams {
        threads: 1,
        max_batch_size: 1,
        ..SearchParams::default()
    }
}

pub fn engine_with(params: SearchParams) -> (Engine, Receiver<SearchEvent>) {
    let (tx, rx) = unbounded();
    let engine = Engine::new(params, None, tx).expect("engine construction");
    (engine, rx)
}

/// Run a `go` to completion and return every event it produced.
pub fn search_to_completion(
    engine: &mut Engine,
    limits: GoLimits,
    rx: &Receiver<SearchEvent>,
) -> Vec<SearchEvent> {
    engine.go(limits).expect("go");
    engine.wait();
    drain_events(rx)
}

pub fn drain_events(rx: &Receiver<SearchEvent>) -> Vec<SearchEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.recv_timeout(Duration::from_millis(50)) {
        events.push(event);
    }
    events
}

pub fn best_move_of(events: &[SearchEvent]) -> Option<(String, Option<String>)> {
    events.iter().rev().find_map(|e| match e {
        SearchEvent::BestMove { best, ponder } => Some((best.clone(), ponder.clone())),
        _ => None,
    })
}

pub fn last_report_of(events: &[SearchEvent]) -> Option<goshawk::search::SearchReport> {
    events.iter().rev().find_map(|e| match e {
        SearchEvent::Info(report) => Some(report.clone()),
        _ => None,
    })
}

pub fn nodes_limits(nodes: u64) -> GoLimits {
    GoLimits {
        nodes: Some(nodes),
        ..GoLimits::default()
    }
}

/// Per-root-edge visit counts, in edge order.
pub fn root_child_visits(engine: &Engine) -> Vec<u32> {
    match engine.tree().root().edges() {
        Some(edges) => edges.iter().map(|e| e.visits()).collect(),
        None => Vec::new(),
    }
}

/// Walk the whole tree and check the quiescent-point invariants: visit
/// accounting, prior normalisation, pinned terminal values, and drained
/// virtual visits.
pub fn assert_tree_invariants(node: &Arc<Node>) {
    assert_eq!(
        node.virtual_visits(),
        0,
        "virtual visits must drain at quiescence"
    );
    let terminal = node.terminal();
    if terminal.is_terminal() && node.n() > 0 {
        assert_eq!(node.q(), terminal.value(), "terminal Q is fixed");
        assert!(node.edges().is_none(), "terminal nodes are never expanded");
    }
    let Some(edges) = node.edges() else {
        return;
    };
    let prior_sum: f32 = edges.iter().map(|e| e.prior()).sum();
    assert!(
        (prior_sum - 1.0).abs() < 1e-4,
        "priors sum to {prior_sum}, expected 1"
    );
    let child_sum: u32 = edges.iter().map(|e| e.visits()).sum();
    assert_eq!(
        node.n(),
        1 + child_sum,
        "node visits must equal its own evaluation plus its children's"
    );
    for edge in edges {
        if let Some(child) = edge.child() {
            assert_tree_invariants(child);
        }
    }
}
