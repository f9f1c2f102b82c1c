//! Endgame tablebase probing via Syzygy tables.
//!
//! Probes give perfect WDL information for positions with few pieces, which
//! short-circuits network evaluation at those leaves. Probe failures are
//! never fatal: the caller falls back to the network.

use crate::position::Position;
use crate::tree::Terminal;
use log::{info, warn};
use shakmaty::Chess;
use shakmaty_syzygy::{Tablebase, Wdl};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EgtbError {
    #[error("tablebase load error: {0}")]
    Load(String),
}

pub struct EgtbProber {
    tables: Tablebase<Chess>,
    pub max_pieces: u8,
}

impl EgtbProber {
    /// Load tables from a list of directories separated by `;` or `:`.
    pub fn new(paths: &str) -> Result<Self, EgtbError> {
        let mut tables = Tablebase::new();
        let mut loaded = 0usize;
        for dir in paths.split([';', ':']).filter(|p| !p.is_empty()) {
            match tables.add_directory(dir) {
                Ok(n) => {
                    info!("loaded {n} tablebase files from {dir}");
                    loaded += n;
                }
                Err(e) => {
                    return Err(EgtbError::Load(format!("{dir}: {e}")));
                }
            }
        }
        if loaded == 0 {
            return Err(EgtbError::Load(format!(
                "no tablebase files under '{paths}'"
            )));
        }
        Ok(EgtbProber {
            tables,
            max_pieces: 7,
        })
    }

    /// WDL verdict for this position, if it is probeable. Cursed wins and
    /// blessed losses are draws under the 50-move rule.
    pub fn probe(&self, pos: &Position) -> Option<Terminal> {
        if pos.piece_count() > self.max_pieces as usize {
            return None;
        }
        // Syzygy tables assume no castling rights.
        if pos.has_castling_rights() {
            return None;
        }
        match self.tables.probe_wdl(pos.rules()).map(|w| w.after_zeroing()) {
            Ok(Wdl::Win) => Some(Terminal::TablebaseWin),
            Ok(Wdl::Loss) => Some(Terminal::TablebaseLoss),
            Ok(Wdl::Draw) | Ok(Wdl::CursedWin) | Ok(Wdl::BlessedLoss) => {
                Some(Terminal::TablebaseDraw)
            }
            Err(e) => {
                warn!("tablebase probe failed: {e}");
                None
            }
        }
    }
}
