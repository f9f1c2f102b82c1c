//! Main entry point for the Goshawk chess engine.
//!
//! Runs the UCI protocol handler for communication with chess GUIs.
//! Exits non-zero only on fatal initialisation failure (unreadable weights
//! file, missing backend).

use goshawk::search::SearchParams;
use goshawk::uci::UciEngine;
use goshawk::weights;
use log::error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

fn main() -> ExitCode {
    env_logger::init();

    let mut params = SearchParams::default();
    let mut weights_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--weights" | "-w" => match args.next() {
                Some(path) => weights_path = Some(PathBuf::from(path)),
                None => {
                    eprintln!("--weights requires a path");
                    return ExitCode::FAILURE;
                }
            },
            "--backend" | "-b" => match args.next() {
                Some(name) => params.backend = name,
                None => {
                    eprintln!("--backend requires a name");
                    return ExitCode::FAILURE;
                }
            },
            other => {
                eprintln!("unknown argument '{other}'");
                return ExitCode::FAILURE;
            }
        }
    }

    let weights = match weights_path {
        Some(path) => match weights::load_weights(&path) {
            Ok(file) => Some(Arc::new(file)),
            Err(e) => {
                error!("failed to load weights from {}: {e}", path.display());
                eprintln!("failed to load weights: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => None,
    };

    match UciEngine::new(params, weights) {
        Ok(engine) => {
            let code = engine.run();
            if code == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!("engine initialisation failed: {e}");
            eprintln!("engine initialisation failed: {e}");
            ExitCode::FAILURE
        }
    }
}
