//! Per-move time budgeting.
//!
//! The controller hands us clocks and increments; the time manager turns
//! them into a wall-clock budget for one move. The allocation is the legacy
//! heuristic: an even share of the remaining time over the expected number
//! of moves, most of the increment, minus the configured move overhead.
//! Unspent time accumulates in a bank and tops up later moves; the bank is
//! capped at ten increments plus a tenth of the remaining clock, as of the
//! last allocation.

use shakmaty::Color;
use std::time::Duration;

/// Parsed `go` parameters relevant to time allocation.
#[derive(Debug, Clone, Default)]
pub struct GoLimits {
    pub wtime: Option<Duration>,
    pub btime: Option<Duration>,
    pub winc: Option<Duration>,
    pub binc: Option<Duration>,
    pub movestogo: Option<u32>,
    pub movetime: Option<Duration>,
    pub depth: Option<u32>,
    pub nodes: Option<u64>,
    pub infinite: bool,
    pub ponder: bool,
    pub searchmoves: Vec<String>,
}

/// When no `movestogo` is given, assume this many moves remain.
const DEFAULT_MOVES_TO_GO: u32 = 28;
/// Fraction of the increment folded into the budget (x/10).
const INCREMENT_TENTHS: u32 = 8;
/// Fraction of the bank drawn per move (1/x).
const BANK_DRAW_DIVISOR: u32 = 4;

pub struct TimeManager {
    move_overhead: Duration,
    bank: Duration,
    /// Ceiling on banked time: `10 · increment + remaining / 10`, captured
    /// from the clock state at the most recent allocation.
    bank_cap: Duration,
}

impl TimeManager {
    pub fn new(move_overhead: Duration) -> Self {
        TimeManager {
            move_overhead,
            bank: Duration::ZERO,
            bank_cap: Duration::ZERO,
        }
    }

    pub fn set_move_overhead(&mut self, overhead: Duration) {
        self.move_overhead = overhead;
    }

    /// Reset banked time, e.g. on `ucinewgame`.
    pub fn reset(&mut self) {
        self.bank = Duration::ZERO;
        self.bank_cap = Duration::ZERO;
    }

    /// Budget for this move; `None` means unbounded (infinite analysis or
    /// no time controls at all).
    pub fn allocate(&mut self, limits: &GoLimits, side: Color) -> Option<Duration> {
        if limits.infinite {
            return None;
        }
        if let Some(movetime) = limits.movetime {
            return Some(movetime.saturating_sub(self.move_overhead));
        }

        let (remaining, increment) = match side {
            Color::White => (limits.wtime?, limits.winc.unwrap_or(Duration::ZERO)),
            Color::Black => (limits.btime?, limits.binc.unwrap_or(Duration::ZERO)),
        };

        let moves_to_go = limits.movestogo.unwrap_or(DEFAULT_MOVES_TO_GO).max(1);
        self.bank_cap = increment * 10 + remaining / 10;
        let base = remaining / moves_to_go + increment * INCREMENT_TENTHS / 10;
        let draw = self.bank / BANK_DRAW_DIVISOR;
        self.bank -= draw;

        let budget = (base + draw).saturating_sub(self.move_overhead);
        // Never allocate more than what is actually on the clock.
        let hard_cap = remaining.saturating_sub(self.move_overhead);
        Some(budget.min(hard_cap).max(Duration::from_millis(1)))
    }

    /// Record actual usage after the move; unspent time goes to the bank.
    pub fn on_move_done(&mut self, allocated: Duration, spent: Duration) {
        let unspent = allocated.saturating_sub(spent);
        self.bank = (self.bank + unspent).min(self.bank_cap);
    }
}
