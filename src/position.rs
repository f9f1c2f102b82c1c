//! Chess-state façade over the rules crate.
//!
//! The search core never touches `shakmaty` directly; everything it needs
//! from the rules of chess comes through [`Position`]: legal moves, pure
//! move application, position fingerprints, and terminal detection
//! (checkmate, stalemate, 50-move rule, repetition, insufficient material).
//!
//! History retention contract: a `Position` keeps the zobrist keys of every
//! ply since the last irreversible move (capture or pawn push). That is
//! exactly the window in which a repetition can occur, so repetition checks
//! are complete and O(plies since zeroing).

use shakmaty::fen::Fen;
use shakmaty::uci::UciMove;
use shakmaty::zobrist::{Zobrist64, ZobristHash};
use shakmaty::{Bitboard, CastlingMode, Chess, Color, EnPassantMode, Position as Rules, Square};
use thiserror::Error;

/// Move type used throughout the engine. Re-exported from the rules crate;
/// the adapter owns all conversions to and from the UCI text form.
pub type Move = shakmaty::Move;

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("invalid FEN '{fen}': {reason}")]
    InvalidFen { fen: String, reason: String },
    #[error("illegal or unparsable move '{0}'")]
    IllegalMove(String),
}

/// Game-theoretic status of a position, from the side to move's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ongoing,
    /// Side to move has won. Unreachable in standard chess (you cannot be
    /// on move in a position you have already won) but kept for symmetry
    /// with tablebase probes.
    Win,
    /// Side to move is checkmated.
    Loss,
    /// Stalemate, repetition, 50-move expiry, or insufficient material.
    Draw,
}

/// Full-position key stored in cache entries so that fingerprint collisions
/// can be detected on lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyKey {
    board: shakmaty::Board,
    turn: Color,
    castling: Bitboard,
    ep_square: Option<Square>,
    halfmoves: u32,
    repetitions: u32,
}

/// A chess position plus the reversible-move history needed for repetition
/// detection. Cloning is cheap enough to thread a copy down each descent.
#[derive(Debug, Clone)]
pub struct Position {
    board: Chess,
    /// Zobrist keys of every ply since the last irreversible move,
    /// most recent last. Always contains the current position's key.
    history: Vec<u64>,
    chess960: bool,
}

impl Position {
    pub fn startpos() -> Self {
        let board = Chess::default();
        let key = raw_key(&board);
        Position {
            board,
            history: vec![key],
            chess960: false,
        }
    }

    pub fn from_fen(fen: &str, chess960: bool) -> Result<Self, PositionError> {
        let parsed: Fen = fen.parse().map_err(|e| PositionError::InvalidFen {
            fen: fen.to_string(),
            reason: format!("{e}"),
        })?;
        let mode = if chess960 {
            CastlingMode::Chess960
        } else {
            CastlingMode::Standard
        };
        let board: Chess =
            parsed
                .into_position(mode)
                .map_err(|e| PositionError::InvalidFen {
                    fen: fen.to_string(),
                    reason: format!("{e}"),
                })?;
        let key = raw_key(&board);
        Ok(Position {
            board,
            history: vec![key],
            chess960,
        })
    }

    /// Pure move application: returns the successor position, leaving `self`
    /// untouched. The caller is responsible for only passing legal moves.
    pub fn apply(&self, mv: &Move) -> Position {
        let mut board = self.board.clone();
        board.play_unchecked(mv);
        let key = raw_key(&board);
        let mut history = if board.halfmoves() == 0 {
            // Irreversible move zeroes the repetition window.
            Vec::with_capacity(8)
        } else {
            self.history.clone()
        };
        history.push(key);
        Position {
            board,
            history,
            chess960: self.chess960,
        }
    }

    pub fn legal_moves(&self) -> Vec<Move> {
        self.board.legal_moves().into_iter().collect()
    }

    /// Parse a UCI move string and validate it against this position.
    pub fn parse_move(&self, uci: &str) -> Result<Move, PositionError> {
        let parsed = UciMove::from_ascii(uci.as_bytes())
            .map_err(|_| PositionError::IllegalMove(uci.to_string()))?;
        parsed
            .to_move(&self.board)
            .map_err(|_| PositionError::IllegalMove(uci.to_string()))
    }

    /// UCI text form of a move, honoring the castling-encoding mode this
    /// position was created with (king-takes-rook for Chess960).
    pub fn uci(&self, mv: &Move) -> String {
        let mode = if self.chess960 {
            CastlingMode::Chess960
        } else {
            CastlingMode::Standard
        };
        mv.to_uci(mode).to_string()
    }

    /// Cache fingerprint: the position's zobrist key mixed with the rule-50
    /// counter and the repetition count, so that transpositions with
    /// different draw-relevant history do not share cache entries.
    pub fn fingerprint(&self) -> u64 {
        let z = raw_key(&self.board);
        let r50 = self.board.halfmoves() as u64;
        let reps = self.repetitions() as u64;
        z ^ r50.wrapping_mul(0x9E37_79B9_7F4A_7C15).rotate_left(17)
            ^ reps.wrapping_mul(0xA24B_AED4_963E_E407)
    }

    /// Full-position key for fingerprint-collision verification.
    pub fn verify_key(&self) -> VerifyKey {
        VerifyKey {
            board: self.board.board().clone(),
            turn: self.board.turn(),
            castling: self.board.castles().castling_rights(),
            ep_square: self.board.ep_square(EnPassantMode::Legal),
            halfmoves: self.board.halfmoves(),
            repetitions: self.repetitions(),
        }
    }

    /// Number of earlier occurrences of the current position in the
    /// retained history window.
    pub fn repetitions(&self) -> u32 {
        let current = *self.history.last().expect("history is never empty");
        self.history[..self.history.len() - 1]
            .iter()
            .filter(|&&k| k == current)
            .count() as u32
    }

    /// Terminal status of this position. A single prior repetition counts as
    /// a draw: inside the search horizon a repeated position can always be
    /// steered into the threefold claim, so scoring it as drawn is exact.
    pub fn verdict(&self) -> Verdict {
        if self.board.is_checkmate() {
            return Verdict::Loss;
        }
        if self.board.is_stalemate() || self.board.is_insufficient_material() {
            return Verdict::Draw;
        }
        if self.board.halfmoves() >= 100 {
            return Verdict::Draw;
        }
        if self.repetitions() >= 1 {
            return Verdict::Draw;
        }
        Verdict::Ongoing
    }

    pub fn turn(&self) -> Color {
        self.board.turn()
    }

    pub fn is_check(&self) -> bool {
        self.board.is_check()
    }

    /// Game ply (0 at the initial position).
    pub fn ply(&self) -> u32 {
        let full = u32::from(self.board.fullmoves());
        (full - 1) * 2 + if self.board.turn() == Color::Black { 1 } else { 0 }
    }

    pub fn piece_count(&self) -> usize {
        self.board.board().occupied().count()
    }

    pub fn has_castling_rights(&self) -> bool {
        self.board.castles().any()
    }

    pub fn halfmove_clock(&self) -> u32 {
        self.board.halfmoves()
    }

    pub(crate) fn rules(&self) -> &Chess {
        &self.board
    }
}

fn raw_key(board: &Chess) -> u64 {
    let z: Zobrist64 = board.zobrist_hash(EnPassantMode::Legal);
    z.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startpos_has_twenty_moves() {
        let pos = Position::startpos();
        assert_eq!(pos.legal_moves().len(), 20);
        assert_eq!(pos.verdict(), Verdict::Ongoing);
        assert_eq!(pos.ply(), 0);
    }

    #[test]
    fn apply_is_pure() {
        let pos = Position::startpos();
        let mv = pos.parse_move("e2e4").unwrap();
        let next = pos.apply(&mv);
        assert_ne!(pos.fingerprint(), next.fingerprint());
        // Original untouched.
        assert_eq!(pos.legal_moves().len(), 20);
        assert_eq!(next.ply(), 1);
    }

    #[test]
    fn checkmate_is_loss_for_mover() {
        // Fool's mate.
        let pos = Position::from_fen(
            "rnb1kbnr/pppp1ppp/8/4p3/6Pq/5P2/PPPPP2P/RNBQKBNR w KQkq - 1 3",
            false,
        )
        .unwrap();
        assert_eq!(pos.verdict(), Verdict::Loss);
        assert!(pos.legal_moves().is_empty());
    }

    #[test]
    fn stalemate_is_draw() {
        let pos = Position::from_fen("7k/8/6Q1/6K1/8/8/8/8 b - - 0 1", false).unwrap();
        assert_eq!(pos.verdict(), Verdict::Draw);
        assert!(pos.legal_moves().is_empty());
    }

    #[test]
    fn fifty_move_rule_is_draw() {
        let pos = Position::from_fen("8/8/4k3/8/8/4K3/4R3/8 w - - 100 80", false).unwrap();
        assert_eq!(pos.verdict(), Verdict::Draw);
    }

    #[test]
    fn twofold_repetition_is_draw() {
        let mut pos = Position::startpos();
        for uci in ["g1f3", "g8f6", "f3g1", "f6g8"] {
            let mv = pos.parse_move(uci).unwrap();
            pos = pos.apply(&mv);
        }
        assert_eq!(pos.repetitions(), 1);
        assert_eq!(pos.verdict(), Verdict::Draw);
    }

    #[test]
    fn irreversible_move_clears_repetition_window() {
        let mut pos = Position::startpos();
        for uci in ["g1f3", "g8f6", "f3g1", "f6g8", "e2e4"] {
            let mv = pos.parse_move(uci).unwrap();
            pos = pos.apply(&mv);
        }
        assert_eq!(pos.repetitions(), 0);
        assert_eq!(pos.verdict(), Verdict::Ongoing);
    }

    #[test]
    fn fingerprint_separates_rule50_states() {
        let a = Position::from_fen("4k3/8/8/8/8/8/8/4K2R w K - 0 1", false).unwrap();
        let b = Position::from_fen("4k3/8/8/8/8/8/8/4K2R w K - 40 1", false).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.verify_key(), b.verify_key());
    }

    #[test]
    fn verify_key_matches_same_position() {
        let a = Position::from_fen("4k3/8/8/8/8/8/8/4K2R w K - 0 1", false).unwrap();
        let b = Position::from_fen("4k3/8/8/8/8/8/8/4K2R w K - 0 1", false).unwrap();
        assert_eq!(a.verify_key(), b.verify_key());
        assert_eq!(a.fingerprint(), b.fingerprint());
    }
}
