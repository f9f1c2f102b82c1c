//! UCI protocol front-end.
//!
//! Line-oriented loop over stdin/stdout. Unknown commands are ignored per
//! the protocol; malformed arguments to known commands are rejected with an
//! `info string` diagnostic and the engine keeps running. Search results
//! arrive asynchronously on the engine's event channel and are printed by a
//! dedicated writer thread, so a `stop` can be serviced while a search is
//! reporting.

use crate::search::{Engine, EngineError, GoLimits, SearchEvent, SearchParams, SearchReport};
use crate::search::params::option_descriptors;
use crate::weights::WeightsFile;
use crossbeam_channel::{unbounded, Receiver};
use log::debug;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const ENGINE_NAME: &str = concat!("Goshawk ", env!("CARGO_PKG_VERSION"));
const ENGINE_AUTHOR: &str = "the goshawk authors";

pub struct UciEngine {
    engine: Engine,
    events: Option<Receiver<SearchEvent>>,
}

impl UciEngine {
    pub fn new(
        params: SearchParams,
        weights: Option<Arc<WeightsFile>>,
    ) -> Result<Self, EngineError> {
        let (tx, rx) = unbounded();
        let engine = Engine::new(params, weights, tx)?;
        Ok(UciEngine {
            engine,
            events: Some(rx),
        })
    }

    /// Main protocol loop; returns the process exit code.
    pub fn run(mut self) -> i32 {
        let events = self.events.take().expect("event channel already taken");
        let printer = thread::spawn(move || {
            while let Ok(event) = events.recv() {
                print_event(&event);
            }
        });

        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => break,
            };
            if !self.handle_command(line.trim()) {
                break;
            }
        }

        // Dropping the engine stops any active search (its bestmove is
        // still queued) and closes the event channel, ending the printer.
        let UciEngine { engine, .. } = self;
        drop(engine);
        printer.join().ok();
        0
    }

    /// Dispatch one command line. Returns `false` on `quit`.
    pub fn handle_command(&mut self, line: &str) -> bool {
        let mut tokens = line.split_whitespace();
        let Some(command) = tokens.next() else {
            return true;
        };
        let rest: Vec<&str> = tokens.collect();

        match command {
            "uci" => {
                println!("id name {ENGINE_NAME}");
                println!("id author {ENGINE_AUTHOR}");
                for option in option_descriptors(self.engine.params()) {
                    println!("{}", option.decl);
                }
                println!("uciok");
                flush();
            }
            "isready" => {
                println!("readyok");
                flush();
            }
            "setoption" => match parse_setoption(&rest) {
                Some((name, value)) => {
                    if let Err(e) = self.engine.set_option(&name, &value) {
                        diag(&format!("{e}"));
                    }
                }
                None => diag("malformed setoption"),
            },
            "ucinewgame" => self.engine.new_game(),
            "position" => match parse_position(&rest) {
                Ok((fen, moves)) => {
                    if let Err(e) = self.engine.set_position(fen.as_deref(), &moves) {
                        diag(&format!("{e}"));
                    }
                }
                Err(e) => diag(&e),
            },
            "go" => match parse_go(&rest) {
                Ok(limits) => {
                    if let Err(e) = self.engine.go(limits) {
                        diag(&format!("{e}"));
                    }
                }
                Err(e) => diag(&e),
            },
            "stop" => self.engine.stop(),
            "ponderhit" => self.engine.ponderhit(),
            "quit" => return false,
            other => debug!("ignoring unknown command '{other}'"),
        }
        true
    }
}

fn flush() {
    io::stdout().flush().ok();
}

fn diag(message: &str) {
    println!("info string {message}");
    flush();
}

fn print_event(event: &SearchEvent) {
    match event {
        SearchEvent::Info(report) => {
            println!("{}", format_info(report));
        }
        SearchEvent::Diagnostic(message) => {
            println!("info string {message}");
        }
        SearchEvent::BestMove { best, ponder } => match ponder {
            Some(ponder) => println!("bestmove {best} ponder {ponder}"),
            None => println!("bestmove {best}"),
        },
    }
    flush();
}

fn format_info(report: &SearchReport) -> String {
    let (w, d, l) = report.wdl;
    let mut line = format!(
        "info depth {} seldepth {} time {} nodes {} nps {} score cp {} wdl {} {} {} hashfull {}",
        report.depth.max(1),
        report.seldepth,
        report.time_ms,
        report.nodes,
        report.nps,
        report.score_cp,
        w,
        d,
        l,
        report.hashfull,
    );
    if !report.pv.is_empty() {
        line.push_str(" pv ");
        line.push_str(&report.pv.join(" "));
    }
    line
}

/// `setoption name <name> [value <value>]`
fn parse_setoption(tokens: &[&str]) -> Option<(String, String)> {
    let mut iter = tokens.iter();
    if *iter.next()? != "name" {
        return None;
    }
    let mut name_parts = Vec::new();
    let mut value_parts = Vec::new();
    let mut in_value = false;
    for token in iter {
        if !in_value && *token == "value" {
            in_value = true;
        } else if in_value {
            value_parts.push(*token);
        } else {
            name_parts.push(*token);
        }
    }
    if name_parts.is_empty() {
        return None;
    }
    Some((name_parts.join(" "), value_parts.join(" ")))
}

/// `position [startpos | fen <fen...>] [moves <m1> <m2> ...]`
#[allow(clippy::type_complexity)]
fn parse_position(tokens: &[&str]) -> Result<(Option<String>, Vec<String>), String> {
    let mut iter = tokens.iter().peekable();
    let fen = match iter.next() {
        Some(&"startpos") => None,
        Some(&"fen") => {
            let mut parts = Vec::new();
            while let Some(&&token) = iter.peek() {
                if token == "moves" {
                    break;
                }
                parts.push(token);
                iter.next();
            }
            if parts.is_empty() {
                return Err("position fen without a FEN".to_string());
            }
            Some(parts.join(" "))
        }
        _ => return Err("position requires startpos or fen".to_string()),
    };
    let mut moves = Vec::new();
    if let Some(&&"moves") = iter.peek() {
        iter.next();
        moves.extend(iter.map(|t| t.to_string()));
    }
    Ok((fen, moves))
}

/// `go [wtime n] [btime n] [winc n] [binc n] [movestogo n] [movetime n]
///     [depth n] [nodes n] [searchmoves ...] [infinite] [ponder]`
fn parse_go(tokens: &[&str]) -> Result<GoLimits, String> {
    let mut limits = GoLimits::default();
    let mut iter = tokens.iter().peekable();

    fn next_u64(iter: &mut std::iter::Peekable<std::slice::Iter<&str>>, key: &str) -> Result<u64, String> {
        iter.next()
            .ok_or_else(|| format!("go {key} requires a value"))?
            .parse()
            .map_err(|_| format!("go {key} requires a number"))
    }

    while let Some(token) = iter.next() {
        match *token {
            "wtime" => limits.wtime = Some(Duration::from_millis(next_u64(&mut iter, "wtime")?)),
            "btime" => limits.btime = Some(Duration::from_millis(next_u64(&mut iter, "btime")?)),
            "winc" => limits.winc = Some(Duration::from_millis(next_u64(&mut iter, "winc")?)),
            "binc" => limits.binc = Some(Duration::from_millis(next_u64(&mut iter, "binc")?)),
            "movestogo" => limits.movestogo = Some(next_u64(&mut iter, "movestogo")? as u32),
            "movetime" => {
                limits.movetime = Some(Duration::from_millis(next_u64(&mut iter, "movetime")?))
            }
            "depth" => limits.depth = Some(next_u64(&mut iter, "depth")? as u32),
            "nodes" => limits.nodes = Some(next_u64(&mut iter, "nodes")?),
            "infinite" => limits.infinite = true,
            "ponder" => limits.ponder = true,
            "searchmoves" => {
                while let Some(&&mv) = iter.peek() {
                    if KEYWORDS.contains(&mv) {
                        break;
                    }
                    limits.searchmoves.push(mv.to_string());
                    iter.next();
                }
            }
            other => return Err(format!("unknown go parameter '{other}'")),
        }
    }
    Ok(limits)
}

const KEYWORDS: &[&str] = &[
    "wtime",
    "btime",
    "winc",
    "binc",
    "movestogo",
    "movetime",
    "depth",
    "nodes",
    "infinite",
    "ponder",
    "searchmoves",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_position_startpos_with_moves() {
        let (fen, moves) =
            parse_position(&["startpos", "moves", "e2e4", "e7e5"]).unwrap();
        assert!(fen.is_none());
        assert_eq!(moves, vec!["e2e4".to_string(), "e7e5".to_string()]);
    }

    #[test]
    fn parse_position_fen() {
        let (fen, moves) = parse_position(&[
            "fen", "8/8/8/8/8/8/8/K1k5", "w", "-", "-", "0", "1", "moves", "a1a2",
        ])
        .unwrap();
        assert_eq!(fen.unwrap(), "8/8/8/8/8/8/8/K1k5 w - - 0 1");
        assert_eq!(moves.len(), 1);
    }

    #[test]
    fn parse_position_rejects_garbage() {
        assert!(parse_position(&["sideways"]).is_err());
        assert!(parse_position(&["fen"]).is_err());
    }

    #[test]
    fn parse_go_clock_and_limits() {
        let limits = parse_go(&[
            "wtime", "60000", "btime", "60000", "winc", "1000", "binc", "1000", "movestogo",
            "20", "nodes", "800",
        ])
        .unwrap();
        assert_eq!(limits.wtime, Some(Duration::from_millis(60000)));
        assert_eq!(limits.movestogo, Some(20));
        assert_eq!(limits.nodes, Some(800));
        assert!(!limits.infinite);
    }

    #[test]
    fn parse_go_infinite_and_ponder() {
        let limits = parse_go(&["infinite", "ponder"]).unwrap();
        assert!(limits.infinite);
        assert!(limits.ponder);
    }

    #[test]
    fn parse_go_searchmoves_stops_at_keywords() {
        let limits = parse_go(&["searchmoves", "e2e4", "d2d4", "movetime", "100"]).unwrap();
        assert_eq!(limits.searchmoves, vec!["e2e4", "d2d4"]);
        assert_eq!(limits.movetime, Some(Duration::from_millis(100)));
    }

    #[test]
    fn parse_go_rejects_malformed_params() {
        assert!(parse_go(&["movetime"]).is_err());
        assert!(parse_go(&["movetime", "soon"]).is_err());
        assert!(parse_go(&["warp", "9"]).is_err());
    }

    #[test]
    fn parse_setoption_with_spaced_value() {
        let (name, value) =
            parse_setoption(&["name", "syzygy-paths", "value", "/a/b;/c", "d"]).unwrap();
        assert_eq!(name, "syzygy-paths");
        assert_eq!(value, "/a/b;/c d");
    }

    #[test]
    fn info_line_contains_all_fields() {
        let line = format_info(&SearchReport {
            depth: 7,
            seldepth: 19,
            time_ms: 1234,
            nodes: 4242,
            nps: 3438,
            score_cp: 35,
            wdl: (412, 310, 278),
            hashfull: 17,
            pv: vec!["e2e4".to_string(), "e7e5".to_string()],
        });
        assert_eq!(
            line,
            "info depth 7 seldepth 19 time 1234 nodes 4242 nps 3438 score cp 35 \
             wdl 412 310 278 hashfull 17 pv e2e4 e7e5"
        );
    }
}
