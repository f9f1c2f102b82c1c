//! Tensor mapping for the network interface.
//!
//! Maps positions to the fixed-shape input planes consumed by evaluators
//! (17×8×8, side-to-move relative) and moves to a flat index into the
//! 8×8×73 policy tensor.
//!
//! Plane layout (STM-relative):
//!   0-5:   STM pieces (P, N, B, R, Q, K)
//!   6-11:  Opponent pieces (P, N, B, R, Q, K)
//!   12:    En passant target square
//!   13-16: Castling rights (STM-KS, STM-QS, Opp-KS, Opp-QS)
//!
//! When Black is to move the ranks are flipped so that STM's pieces always
//! appear at the same tensor rows. Policy indices use absolute squares; the
//! caller flips Black moves vertically before indexing.

use crate::position::{Move, Position};
use shakmaty::{CastlingSide, Color, EnPassantMode, Position as Rules, Role, Square};

pub const INPUT_PLANES: usize = 17;
pub const INPUT_SIZE: usize = INPUT_PLANES * 64;
/// 64 source squares × 73 move planes.
pub const POLICY_SIZE: usize = 64 * 73;

/// Fixed-shape network input for one position.
pub type InputPlanes = Vec<f32>;

/// Encode a position into STM-relative input planes.
pub fn encode_planes(pos: &Position) -> InputPlanes {
    let mut planes = vec![0.0f32; INPUT_SIZE];
    let board = pos.rules();
    let stm = board.turn();
    let flip = stm == Color::Black;

    for sq_idx in 0..64u32 {
        let sq = Square::new(sq_idx);
        if let Some(piece) = board.board().piece_at(sq) {
            let side = if piece.color == stm { 0 } else { 1 };
            let plane = side * 6 + role_plane(piece.role);
            let rank = (sq_idx / 8) as usize;
            let file = (sq_idx % 8) as usize;
            let tensor_rank = if flip { rank } else { 7 - rank };
            planes[plane * 64 + tensor_rank * 8 + file] = 1.0;
        }
    }

    if let Some(ep) = board.ep_square(EnPassantMode::Legal) {
        let idx = ep as usize;
        let rank = idx / 8;
        let file = idx % 8;
        let tensor_rank = if flip { rank } else { 7 - rank };
        planes[12 * 64 + tensor_rank * 8 + file] = 1.0;
    }

    let castles = board.castles();
    let rights = [
        castles.has(stm, CastlingSide::KingSide),
        castles.has(stm, CastlingSide::QueenSide),
        castles.has(!stm, CastlingSide::KingSide),
        castles.has(!stm, CastlingSide::QueenSide),
    ];
    for (i, &allowed) in rights.iter().enumerate() {
        if allowed {
            let offset = (13 + i) * 64;
            for v in &mut planes[offset..offset + 64] {
                *v = 1.0;
            }
        }
    }

    planes
}

/// Flat policy index of a legal move in the given position.
///
/// Black moves are flipped vertically to match the STM-relative input
/// encoding. Castling indexes as the king's slide (e1g1-style); Chess960
/// king-takes-rook targets still fall on a horizontal slide plane.
pub fn move_to_index(pos: &Position, mv: &Move) -> usize {
    let stm = pos.turn();
    let from = mv.from().map(|s| s as usize).unwrap_or(0);
    let to = mv.to() as usize;
    let (src, dst) = if stm == Color::Black {
        (flip_vertical(from), flip_vertical(to))
    } else {
        (from, to)
    };

    let src_rank = (src / 8) as i32;
    let src_file = (src % 8) as i32;
    let dst_rank = (dst / 8) as i32;
    let dst_file = (dst % 8) as i32;
    let dx = dst_file - src_file;
    let dy = dst_rank - src_rank;

    let plane: i32 = match mv.promotion() {
        Some(promo) if promo != Role::Queen => {
            // Underpromotion: 3 directions × {N, B, R}.
            let direction_offset = match dx {
                0 => 0,
                -1 => 1,
                1 => 2,
                _ => 0,
            };
            let piece_offset = match promo {
                Role::Knight => 0,
                Role::Bishop => 3,
                _ => 6,
            };
            64 + direction_offset + piece_offset
        }
        _ => {
            if (dx * dy).abs() == 2 {
                // Knight move.
                let knight_idx = match (dx, dy) {
                    (1, 2) => 0,
                    (2, 1) => 1,
                    (2, -1) => 2,
                    (1, -2) => 3,
                    (-1, -2) => 4,
                    (-2, -1) => 5,
                    (-2, 1) => 6,
                    _ => 7,
                };
                56 + knight_idx
            } else {
                // Queen-like slide (includes queen promotion and castling).
                let direction = match (dx.signum(), dy.signum()) {
                    (0, 1) => 0,
                    (1, 1) => 1,
                    (1, 0) => 2,
                    (1, -1) => 3,
                    (0, -1) => 4,
                    (-1, -1) => 5,
                    (-1, 0) => 6,
                    _ => 7,
                };
                let distance = dx.abs().max(dy.abs()).max(1);
                direction * 7 + (distance - 1)
            }
        }
    };

    src * 73 + plane as usize
}

fn flip_vertical(sq: usize) -> usize {
    sq ^ 56
}

fn role_plane(role: Role) -> usize {
    match role {
        Role::Pawn => 0,
        Role::Knight => 1,
        Role::Bishop => 2,
        Role::Rook => 3,
        Role::Queen => 4,
        Role::King => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn startpos_piece_planes() {
        let pos = Position::startpos();
        let planes = encode_planes(&pos);
        assert_eq!(planes.len(), INPUT_SIZE);
        // 8 STM pawns on plane 0, 8 opponent pawns on plane 6.
        let stm_pawns: f32 = planes[0..64].iter().sum();
        let opp_pawns: f32 = planes[6 * 64..7 * 64].iter().sum();
        assert_eq!(stm_pawns, 8.0);
        assert_eq!(opp_pawns, 8.0);
        // All four castling planes set.
        for p in 13..17 {
            assert_eq!(planes[p * 64], 1.0);
        }
    }

    #[test]
    fn encoding_is_stm_relative() {
        // Mirrored positions with swapped side to move encode identically.
        let white = Position::startpos();
        let mv = white.parse_move("e2e4").unwrap();
        let black = white.apply(&mv);
        let wp = encode_planes(&white);
        let bp = encode_planes(&black);
        // STM pawn plane for Black has all eight pawns on the same rows
        // White's had (ranks are flipped).
        let stm_white: f32 = wp[0..64].iter().sum();
        let stm_black: f32 = bp[0..64].iter().sum();
        assert_eq!(stm_white, 8.0);
        assert_eq!(stm_black, 8.0);
    }

    #[test]
    fn slide_and_knight_indices() {
        let pos = Position::startpos();
        // e2e4: N slide, distance 2 from e2 (square 12). Plane 1.
        let mv = pos.parse_move("e2e4").unwrap();
        assert_eq!(move_to_index(&pos, &mv), 12 * 73 + 1);
        // g1f3: knight (-1, 2) -> idx 7, plane 63.
        let mv = pos.parse_move("g1f3").unwrap();
        assert_eq!(move_to_index(&pos, &mv), 6 * 73 + 63);
    }

    #[test]
    fn black_moves_are_flipped() {
        let start = Position::startpos();
        let e4 = start.apply(&start.parse_move("e2e4").unwrap());
        // e7e5 for Black flips to the same index as e2e4 for White.
        let mv = e4.parse_move("e7e5").unwrap();
        assert_eq!(move_to_index(&e4, &mv), 12 * 73 + 1);
    }

    #[test]
    fn underpromotion_indices() {
        let pos = Position::from_fen("8/P6k/8/8/8/8/8/K7 w - - 0 1", false).unwrap();
        let mv = pos.parse_move("a7a8n").unwrap();
        // a7 = 48, straight push, knight: plane 64.
        assert_eq!(move_to_index(&pos, &mv), 48 * 73 + 64);
        let mv = pos.parse_move("a7a8r").unwrap();
        assert_eq!(move_to_index(&pos, &mv), 48 * 73 + 70);
    }

    #[test]
    fn legal_move_indices_are_unique_and_in_range() {
        let pos = Position::from_fen(
            "r3k2r/p1ppqpb1/bn2pnp1/3PN3/1p2P3/2N2Q1p/PPPBBPPP/R3K2R w KQkq - 0 1",
            false,
        )
        .unwrap();
        let mut seen = HashSet::new();
        for mv in pos.legal_moves() {
            let idx = move_to_index(&pos, &mv);
            assert!(idx < POLICY_SIZE);
            assert!(seen.insert(idx), "duplicate policy index for {mv:?}");
        }
    }

    #[test]
    fn reencoding_is_stable() {
        let pos = Position::from_fen(
            "rnbq1rk1/ppp1bppp/4pn2/3p4/2PP4/5NP1/PP2PPBP/RNBQ1RK1 w - - 4 6",
            false,
        )
        .unwrap();
        let fp = pos.fingerprint();
        let planes = encode_planes(&pos);
        assert_eq!(pos.fingerprint(), fp);
        assert_eq!(encode_planes(&pos), planes);
    }
}
