//! Search-tree nodes and edges.
//!
//! Every mutable scalar on a node is an atomic so that workers can update
//! the shared tree without locks: visit count N, accumulated value W,
//! moves-left accumulator M, the virtual-visit counter, and the expansion
//! state. The edge array is built once, fully, and then published with a
//! release store; any worker that observes `Expanded` therefore sees a
//! complete edge array.
//!
//! Values in W are from the node's own side-to-move perspective. Q of a
//! child as seen from its parent is `-child.q()`.

use crate::position::Move;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// f64 stored as bits in an AtomicU64, with a CAS loop for accumulation.
pub struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        AtomicF64 {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    #[inline]
    pub fn load(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn fetch_add(&self, delta: f64) {
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match self.bits.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExpansionState {
    Fresh = 0,
    PendingEval = 1,
    Expanded = 2,
}

/// Terminal tag of a node. Win/Loss/Draw are from the node's own
/// side-to-move perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Terminal {
    No = 0,
    Win = 1,
    Loss = 2,
    Draw = 3,
    TablebaseWin = 4,
    TablebaseLoss = 5,
    TablebaseDraw = 6,
}

impl Terminal {
    pub fn is_terminal(self) -> bool {
        self != Terminal::No
    }

    /// Fixed value backpropagated on every visit of a terminal node.
    pub fn value(self) -> f64 {
        match self {
            Terminal::Win | Terminal::TablebaseWin => 1.0,
            Terminal::Loss | Terminal::TablebaseLoss => -1.0,
            _ => 0.0,
        }
    }

    fn from_u8(v: u8) -> Terminal {
        match v {
            1 => Terminal::Win,
            2 => Terminal::Loss,
            3 => Terminal::Draw,
            4 => Terminal::TablebaseWin,
            5 => Terminal::TablebaseLoss,
            6 => Terminal::TablebaseDraw,
            _ => Terminal::No,
        }
    }
}

/// A move out of a node: the move itself, its prior from the policy head,
/// and the lazily materialised child node.
pub struct Edge {
    mv: Move,
    prior: f32,
    child: OnceLock<Arc<Node>>,
}

impl Edge {
    pub fn new(mv: Move, prior: f32) -> Self {
        Edge {
            mv,
            prior,
            child: OnceLock::new(),
        }
    }

    pub fn mv(&self) -> &Move {
        &self.mv
    }

    pub fn prior(&self) -> f32 {
        self.prior
    }

    pub fn child(&self) -> Option<&Arc<Node>> {
        self.child.get()
    }

    /// Materialise the child node, racing safely with other workers.
    pub fn child_or_create(&self, parent: &Arc<Node>) -> Arc<Node> {
        self.child
            .get_or_init(|| Arc::new(Node::new(Arc::downgrade(parent))))
            .clone()
    }

    pub fn visits(&self) -> u32 {
        self.child().map_or(0, |c| c.n())
    }

    /// Child Q from the parent's perspective; 0 when unvisited.
    pub fn q_from_parent(&self) -> f64 {
        match self.child() {
            Some(child) if child.n() > 0 => -child.q(),
            _ => 0.0,
        }
    }
}

pub struct Node {
    parent: Weak<Node>,
    edges: OnceLock<Box<[Edge]>>,
    n: AtomicU32,
    w: AtomicF64,
    m: AtomicF64,
    virtual_visits: AtomicU32,
    state: AtomicU8,
    terminal: AtomicU8,
}

impl Node {
    pub fn new_root() -> Arc<Node> {
        Arc::new(Node::new(Weak::new()))
    }

    pub(crate) fn new(parent: Weak<Node>) -> Node {
        Node {
            parent,
            edges: OnceLock::new(),
            n: AtomicU32::new(0),
            w: AtomicF64::new(0.0),
            m: AtomicF64::new(0.0),
            virtual_visits: AtomicU32::new(0),
            state: AtomicU8::new(ExpansionState::Fresh as u8),
            terminal: AtomicU8::new(Terminal::No as u8),
        }
    }

    pub fn parent(&self) -> Option<Arc<Node>> {
        self.parent.upgrade()
    }

    pub fn n(&self) -> u32 {
        self.n.load(Ordering::Relaxed)
    }

    pub fn virtual_visits(&self) -> u32 {
        self.virtual_visits.load(Ordering::Relaxed)
    }

    /// Accumulated value sum W from this node's perspective.
    pub fn w_total(&self) -> f64 {
        self.w.load()
    }

    /// Running average value from this node's side-to-move perspective.
    pub fn q(&self) -> f64 {
        let n = self.n();
        if n == 0 {
            0.0
        } else {
            self.w.load() / n as f64
        }
    }

    /// Average moves-left estimate at this node.
    pub fn m_avg(&self) -> f64 {
        let n = self.n();
        if n == 0 {
            0.0
        } else {
            self.m.load() / n as f64
        }
    }

    pub fn state(&self) -> ExpansionState {
        match self.state.load(Ordering::Acquire) {
            0 => ExpansionState::Fresh,
            1 => ExpansionState::PendingEval,
            _ => ExpansionState::Expanded,
        }
    }

    /// Elect this worker as the node's evaluator: Fresh -> PendingEval.
    /// Exactly one caller wins; everyone else observes PendingEval.
    pub fn try_claim(&self) -> bool {
        self.state
            .compare_exchange(
                ExpansionState::Fresh as u8,
                ExpansionState::PendingEval as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Give a claim back: PendingEval -> Fresh. Used when the claim winner
    /// cannot complete the evaluation (abort, backend failure) so a later
    /// search on the kept tree can claim the node again.
    pub fn release_claim(&self) {
        self.state
            .store(ExpansionState::Fresh as u8, Ordering::Release);
    }

    /// Publish a fully constructed edge array and flip to Expanded. Must be
    /// called at most once, by the claim winner.
    pub fn publish_edges(&self, edges: Box<[Edge]>) {
        let already = self.edges.set(edges).is_err();
        debug_assert!(!already, "edge array published twice");
        self.state
            .store(ExpansionState::Expanded as u8, Ordering::Release);
    }

    /// Edge array; `Some` only after the node has been expanded.
    pub fn edges(&self) -> Option<&[Edge]> {
        if self.state() != ExpansionState::Expanded {
            return None;
        }
        self.edges.get().map(|e| e.as_ref())
    }

    pub fn terminal(&self) -> Terminal {
        Terminal::from_u8(self.terminal.load(Ordering::Acquire))
    }

    /// Tag this node terminal. Terminal nodes are never expanded; visitors
    /// check the tag before the expansion state.
    pub fn make_terminal(&self, terminal: Terminal) {
        self.terminal.store(terminal as u8, Ordering::Release);
    }

    pub fn add_virtual_visit(&self) {
        self.virtual_visits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_virtual_visit(&self) {
        let prev = self.virtual_visits.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "virtual visit underflow");
    }

    /// Record one completed visit: N += 1, W += value, M += moves_left.
    pub fn apply_visit(&self, value: f64, moves_left: f64) {
        self.n.fetch_add(1, Ordering::Relaxed);
        self.w.fetch_add(value);
        self.m.fetch_add(moves_left);
    }

    /// Best edge for final move selection: most visits, then higher Q, then
    /// higher prior (edges are prior-sorted, so the first maximum wins).
    pub fn best_edge_index(&self) -> Option<usize> {
        let edges = self.edges()?;
        if edges.is_empty() {
            return None;
        }
        let mut best = 0usize;
        let mut best_key = (edges[0].visits(), edges[0].q_from_parent());
        for (i, edge) in edges.iter().enumerate().skip(1) {
            let key = (edge.visits(), edge.q_from_parent());
            if key.0 > best_key.0 || (key.0 == best_key.0 && key.1 > best_key.1) {
                best = i;
                best_key = key;
            }
        }
        Some(best)
    }
}
