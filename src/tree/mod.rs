//! The game tree: a root node plus the position it stands on.
//!
//! When the controller sends a position that is a descendant of the current
//! root (same game, a few moves played), the tree is trimmed to the new
//! root and all accumulated statistics under it survive. Anything else
//! discards the tree.

pub mod node;

use crate::position::{Position, PositionError};
use log::debug;
use std::sync::Arc;

pub use node::{Edge, ExpansionState, Node, Terminal};

pub struct GameTree {
    root: Arc<Node>,
    root_pos: Position,
    /// FEN the current game was set up from; `None` means startpos.
    base_fen: Option<String>,
    /// UCI moves from the base position to the current root.
    moves: Vec<String>,
    chess960: bool,
}

impl GameTree {
    pub fn new() -> Self {
        GameTree {
            root: Node::new_root(),
            root_pos: Position::startpos(),
            base_fen: None,
            moves: Vec::new(),
            chess960: false,
        }
    }

    pub fn root(&self) -> Arc<Node> {
        self.root.clone()
    }

    /// Position at the current root.
    pub fn head_position(&self) -> &Position {
        &self.root_pos
    }

    /// Point the tree at a new controller position. Returns `true` when the
    /// new position continued the current game and the subtree was reused.
    pub fn reset_to_position(
        &mut self,
        fen: Option<&str>,
        moves: &[String],
        chess960: bool,
    ) -> Result<bool, PositionError> {
        let same_base = self.chess960 == chess960
            && self.base_fen.as_deref() == fen
            && moves.len() >= self.moves.len()
            && moves[..self.moves.len()] == self.moves[..];

        if same_base {
            let tail = moves[self.moves.len()..].to_vec();
            // Validate the whole tail before mutating anything.
            let mut probe = self.root_pos.clone();
            let mut parsed = Vec::with_capacity(tail.len());
            for uci in &tail {
                let mv = probe.parse_move(uci)?;
                probe = probe.apply(&mv);
                parsed.push(mv);
            }
            for (uci, mv) in tail.iter().zip(&parsed) {
                self.advance_root(uci, mv);
            }
            self.moves = moves.to_vec();
            return Ok(true);
        }

        debug!("rebuilding tree: new game or unrelated position");
        self.root = Node::new_root();
        self.root_pos = match fen {
            Some(fen) => Position::from_fen(fen, chess960)?,
            None => {
                if chess960 {
                    // Startpos is legal under either castling encoding.
                    Position::from_fen(
                        "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1",
                        true,
                    )?
                } else {
                    Position::startpos()
                }
            }
        };
        self.base_fen = fen.map(|s| s.to_string());
        self.moves.clear();
        self.chess960 = chess960;
        for uci in moves {
            let mv = self.root_pos.parse_move(uci)?;
            self.root_pos = self.root_pos.apply(&mv);
            self.moves.push(uci.clone());
        }
        Ok(false)
    }

    /// Reseat the root one ply down the played move. The played child
    /// subtree survives; siblings are released when the old root drops.
    fn advance_root(&mut self, uci: &str, mv: &crate::position::Move) {
        let next = match self.root.edges() {
            Some(edges) => edges
                .iter()
                .find(|e| e.mv() == mv)
                .map(|e| e.child_or_create(&self.root)),
            None => None,
        };
        self.root = next.unwrap_or_else(Node::new_root);
        self.root_pos = self.root_pos.apply(mv);
        self.moves.push(uci.to_string());
    }

    /// Principal variation: the most-visited edge chain from the root.
    pub fn principal_variation(&self, max_len: usize) -> Vec<String> {
        principal_variation_from(&self.root, &self.root_pos, max_len)
    }
}

/// Most-visited edge chain from an arbitrary root. The first move is
/// reported even with zero visits (it is the prior-fallback best move);
/// deeper unvisited edges end the line.
pub fn principal_variation_from(root: &Arc<Node>, pos: &Position, max_len: usize) -> Vec<String> {
    let mut pv = Vec::new();
    let mut node = root.clone();
    let mut pos = pos.clone();
    while pv.len() < max_len {
        let Some(idx) = node.best_edge_index() else {
            break;
        };
        let edges = node.edges().expect("best_edge_index implies edges");
        let edge = &edges[idx];
        if edge.visits() == 0 && !pv.is_empty() {
            break;
        }
        pv.push(pos.uci(edge.mv()));
        let Some(child) = edge.child() else { break };
        pos = pos.apply(edge.mv());
        node = child.clone();
    }
    pv
}

impl Default for GameTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tree_is_startpos() {
        let tree = GameTree::new();
        assert_eq!(tree.head_position().legal_moves().len(), 20);
        assert_eq!(tree.root().n(), 0);
    }

    #[test]
    fn same_game_extension_is_detected() {
        let mut tree = GameTree::new();
        assert!(!tree
            .reset_to_position(None, &["e2e4".to_string()], false)
            .unwrap());
        // Extending by one move continues the game.
        assert!(tree
            .reset_to_position(None, &["e2e4".to_string(), "e7e5".to_string()], false)
            .unwrap());
        // An unrelated line rebuilds.
        assert!(!tree
            .reset_to_position(None, &["d2d4".to_string()], false)
            .unwrap());
    }

    #[test]
    fn same_position_twice_is_same_game() {
        let mut tree = GameTree::new();
        tree.reset_to_position(None, &["e2e4".to_string()], false)
            .unwrap();
        assert!(tree
            .reset_to_position(None, &["e2e4".to_string()], false)
            .unwrap());
    }

    #[test]
    fn bad_moves_are_rejected() {
        let mut tree = GameTree::new();
        assert!(tree
            .reset_to_position(None, &["e2e5".to_string()], false)
            .is_err());
        // The tree is still usable afterwards.
        assert_eq!(tree.head_position().legal_moves().len(), 20);
    }

    #[test]
    fn fen_games_are_separate_from_startpos() {
        let mut tree = GameTree::new();
        tree.reset_to_position(None, &["e2e4".to_string()], false)
            .unwrap();
        let fen = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1";
        assert!(!tree.reset_to_position(Some(fen), &[], false).unwrap());
    }
}
