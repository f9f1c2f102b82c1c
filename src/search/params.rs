//! Search configuration and the engine option table.
//!
//! Every tunable the controller can reach via `setoption` lives here, with
//! its UCI name, range, and default. The search core only ever reads the
//! typed [`SearchParams`].

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("bad option: {0}")]
pub struct OptionError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpuStrategy {
    /// Unvisited children take a fixed Q.
    Absolute,
    /// Unvisited children take the parent's Q minus a reduction.
    Reduction,
}

#[derive(Debug, Clone)]
pub struct SearchParams {
    /// Worker thread count.
    pub threads: usize,
    /// Evaluation cache capacity in entries.
    pub cache_size: usize,
    /// Batch ceiling for the inference collector.
    pub max_batch_size: usize,
    /// How long the collector waits to fill a batch.
    pub batch_timeout: Duration,
    pub cpuct: f64,
    pub cpuct_base: f64,
    pub cpuct_factor: f64,
    pub fpu_strategy: FpuStrategy,
    pub fpu_value: f64,
    pub policy_softmax_temp: f64,
    pub dirichlet_alpha: f64,
    pub dirichlet_epsilon: f64,
    /// Q penalty per in-flight visit during selection.
    pub virtual_loss_weight: f64,
    pub move_overhead: Duration,
    /// 0 disables smart pruning.
    pub smart_pruning_factor: f64,
    pub kldgain_average_interval: u64,
    /// 0 disables the KLD-gain stopper.
    pub min_kldgain_per_node: f64,
    /// 0 disables the playout limit.
    pub max_playouts: u64,
    /// Moves-left bias at root move selection; 0 disables.
    pub moves_left_slope: f64,
    /// Root sampling temperature; 0 plays the most-visited move.
    pub temperature: f64,
    /// Game ply after which temperature drops to 0; 0 means never sample.
    pub temperature_cutoff_ply: u32,
    pub syzygy_paths: Option<String>,
    pub chess960: bool,
    pub backend: String,
}

impl Default for SearchParams {
    fn default() -> Self {
        SearchParams {
            threads: 2,
            cache_size: 200_000,
            max_batch_size: 256,
            batch_timeout: Duration::from_micros(500),
            cpuct: 1.745,
            cpuct_base: 38739.0,
            cpuct_factor: 3.894,
            fpu_strategy: FpuStrategy::Reduction,
            fpu_value: 0.33,
            policy_softmax_temp: 1.359,
            dirichlet_alpha: 0.3,
            dirichlet_epsilon: 0.0,
            virtual_loss_weight: 1.0,
            move_overhead: Duration::from_millis(100),
            smart_pruning_factor: 1.33,
            kldgain_average_interval: 100,
            min_kldgain_per_node: 0.0,
            max_playouts: 0,
            moves_left_slope: 0.0,
            temperature: 0.0,
            temperature_cutoff_ply: 0,
            syzygy_paths: None,
            chess960: false,
            backend: "uniform".to_string(),
        }
    }
}

impl SearchParams {
    /// Piecewise-log exploration schedule.
    pub fn cpuct_at(&self, parent_n: u32) -> f64 {
        self.cpuct
            + self.cpuct_factor * ((parent_n as f64 + self.cpuct_base + 1.0) / self.cpuct_base).ln()
    }

    /// Apply a `setoption`-style assignment. Names are matched
    /// case-insensitively.
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<(), OptionError> {
        let key = name.to_ascii_lowercase();
        match key.as_str() {
            "threads" => self.threads = parse_range(value, 1, 128)? as usize,
            "nn-cache-size" => self.cache_size = parse_range(value, 16, 100_000_000)? as usize,
            "max-batch-size" => self.max_batch_size = parse_range(value, 1, 4096)? as usize,
            "cpuct" => self.cpuct = parse_float(value)?,
            "cpuct-base" => self.cpuct_base = parse_float_min(value, 1.0)?,
            "cpuct-factor" => self.cpuct_factor = parse_float(value)?,
            "fpu-strategy" => {
                self.fpu_strategy = match value.to_ascii_lowercase().as_str() {
                    "absolute" => FpuStrategy::Absolute,
                    "reduction" => FpuStrategy::Reduction,
                    other => {
                        return Err(OptionError(format!("unknown fpu strategy '{other}'")))
                    }
                }
            }
            "fpu-value" => self.fpu_value = parse_float(value)?,
            "policy-softmax-temp" => self.policy_softmax_temp = parse_float_min(value, 1e-3)?,
            "dirichlet-noise-alpha" => self.dirichlet_alpha = parse_float_min(value, 0.0)?,
            "dirichlet-noise-epsilon" => {
                let eps = parse_float(value)?;
                if !(0.0..=1.0).contains(&eps) {
                    return Err(OptionError(format!("epsilon {eps} outside [0, 1]")));
                }
                self.dirichlet_epsilon = eps;
            }
            "move-overhead-ms" => {
                self.move_overhead = Duration::from_millis(parse_range(value, 0, 60_000)?)
            }
            "smart-pruning-factor" => self.smart_pruning_factor = parse_float_min(value, 0.0)?,
            "kldgain-average-interval" => {
                self.kldgain_average_interval = parse_range(value, 1, 1_000_000)?
            }
            "minimum-kldgain-per-node" => {
                self.min_kldgain_per_node = parse_float_min(value, 0.0)?
            }
            "max-playouts" => self.max_playouts = parse_range(value, 0, u64::MAX / 2)?,
            "moves-left-slope" => self.moves_left_slope = parse_float_min(value, 0.0)?,
            "temperature" => self.temperature = parse_float_min(value, 0.0)?,
            "temperature-cutoff-ply" => {
                self.temperature_cutoff_ply = parse_range(value, 0, 10_000)? as u32
            }
            "syzygy-paths" => {
                self.syzygy_paths = if value.is_empty() || value == "<empty>" {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "uci_chess960" => {
                self.chess960 = match value.to_ascii_lowercase().as_str() {
                    "true" => true,
                    "false" => false,
                    other => return Err(OptionError(format!("bad boolean '{other}'"))),
                }
            }
            "backend" => self.backend = value.to_string(),
            other => return Err(OptionError(format!("unknown option '{other}'"))),
        }
        Ok(())
    }
}

/// One line of the `uci` option listing.
pub struct OptionDescriptor {
    pub name: &'static str,
    pub decl: String,
}

pub fn option_descriptors(defaults: &SearchParams) -> Vec<OptionDescriptor> {
    let spin = |name: &'static str, default: i64, min: i64, max: i64| OptionDescriptor {
        name,
        decl: format!("option name {name} type spin default {default} min {min} max {max}"),
    };
    let string = |name: &'static str, default: &str| OptionDescriptor {
        name,
        decl: format!("option name {name} type string default {default}"),
    };
    vec![
        spin("threads", defaults.threads as i64, 1, 128),
        spin("nn-cache-size", defaults.cache_size as i64, 16, 100_000_000),
        spin("max-batch-size", defaults.max_batch_size as i64, 1, 4096),
        string("cpuct", &format!("{}", defaults.cpuct)),
        string("cpuct-base", &format!("{}", defaults.cpuct_base)),
        string("cpuct-factor", &format!("{}", defaults.cpuct_factor)),
        OptionDescriptor {
            name: "fpu-strategy",
            decl: "option name fpu-strategy type combo default reduction var absolute var reduction"
                .to_string(),
        },
        string("fpu-value", &format!("{}", defaults.fpu_value)),
        string(
            "policy-softmax-temp",
            &format!("{}", defaults.policy_softmax_temp),
        ),
        string(
            "dirichlet-noise-alpha",
            &format!("{}", defaults.dirichlet_alpha),
        ),
        string(
            "dirichlet-noise-epsilon",
            &format!("{}", defaults.dirichlet_epsilon),
        ),
        spin(
            "move-overhead-ms",
            defaults.move_overhead.as_millis() as i64,
            0,
            60_000,
        ),
        string(
            "smart-pruning-factor",
            &format!("{}", defaults.smart_pruning_factor),
        ),
        spin(
            "kldgain-average-interval",
            defaults.kldgain_average_interval as i64,
            1,
            1_000_000,
        ),
        string(
            "minimum-kldgain-per-node",
            &format!("{}", defaults.min_kldgain_per_node),
        ),
        spin("max-playouts", defaults.max_playouts as i64, 0, i64::MAX / 2),
        string("moves-left-slope", &format!("{}", defaults.moves_left_slope)),
        string("temperature", &format!("{}", defaults.temperature)),
        spin(
            "temperature-cutoff-ply",
            defaults.temperature_cutoff_ply as i64,
            0,
            10_000,
        ),
        string("syzygy-paths", ""),
        OptionDescriptor {
            name: "UCI_Chess960",
            decl: "option name UCI_Chess960 type check default false".to_string(),
        },
        string("backend", &defaults.backend),
    ]
}

fn parse_range(value: &str, min: u64, max: u64) -> Result<u64, OptionError> {
    let parsed: u64 = value
        .trim()
        .parse()
        .map_err(|_| OptionError(format!("'{value}' is not an integer")))?;
    if parsed < min || parsed > max {
        return Err(OptionError(format!(
            "{parsed} outside allowed range {min}..{max}"
        )));
    }
    Ok(parsed)
}

fn parse_float(value: &str) -> Result<f64, OptionError> {
    let parsed: f64 = value
        .trim()
        .parse()
        .map_err(|_| OptionError(format!("'{value}' is not a number")))?;
    if !parsed.is_finite() {
        return Err(OptionError(format!("'{value}' is not finite")));
    }
    Ok(parsed)
}

fn parse_float_min(value: &str, min: f64) -> Result<f64, OptionError> {
    let parsed = parse_float(value)?;
    if parsed < min {
        return Err(OptionError(format!("{parsed} below minimum {min}")));
    }
    Ok(parsed)
}
