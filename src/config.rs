//! Sizing constants fixed at compile time, plus the report settings read from
//! the environment at shutdown.

use std::{env, mem, path::PathBuf};

use once_cell::sync::Lazy;

use crate::report::Format;

/// Smallest latency (in nanoseconds) resolved distinctly by the histograms.
pub const LOWEST_TRACKABLE_NS: u64 = 5;

/// Latencies above this many nanoseconds (50ms) land in the top bucket.
pub const HIGHEST_TRACKABLE_NS: u64 = 50_000_000;

/// Decimal digits of relative accuracy preserved per histogram bucket.
pub const SIGNIFICANT_FIGURES: u8 = 3;

/// Capacity of the region that feeds the symbol resolver while it runs.
pub const BOOTSTRAP_ARENA_BYTES: usize = 1 << 20;

/// Size of the static buffer diagnostics are formatted into.
pub const DIAG_BUF_LEN: usize = 4096;

/// Minimum alignment of a block returned by `malloc` (glibc's `MALLOC_ALIGNMENT`).
pub const MIN_ALIGN: usize = 2 * mem::size_of::<usize>();

const FORMAT_VAR: &str = "LATALLOC_FORMAT";
const TICKS_VAR: &str = "LATALLOC_TICKS";
const DIR_VAR: &str = "LATALLOC_DIR";
const QUIET_VAR: &str = "LATALLOC_QUIET";

const DEFAULT_TICKS: u32 = 10;

/// Settings that only matter once the process is done allocating.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportConfig {
    pub format: Format,
    /// Ticks per half-distance when walking percentiles for the distribution table.
    pub ticks_per_half_distance: u32,
    /// Where to save the snapshot as YAML, if anywhere.
    pub output_dir: Option<PathBuf>,
    /// Skip the report on stderr.
    pub quiet: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        ReportConfig {
            format: Format::Csv,
            ticks_per_half_distance: DEFAULT_TICKS,
            output_dir: None,
            quiet: false,
        }
    }
}

impl ReportConfig {
    /// Read `LATALLOC_FORMAT`, `LATALLOC_TICKS`, `LATALLOC_DIR` and `LATALLOC_QUIET`.
    /// Malformed values fall back to the defaults with a warning on stderr.
    pub fn from_env() -> Self {
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let mut config = ReportConfig::default();

        if let Some(format) = lookup(FORMAT_VAR) {
            match format.parse() {
                Ok(format) => config.format = format,
                Err(e) => crate::log!("{}, using {}", e, config.format),
            }
        }

        if let Some(ticks) = lookup(TICKS_VAR) {
            match ticks.trim().parse::<u32>() {
                Ok(ticks) if ticks > 0 => config.ticks_per_half_distance = ticks,
                _ => crate::log!(
                    "invalid {} value '{}', using {}",
                    TICKS_VAR, ticks, DEFAULT_TICKS
                ),
            }
        }

        config.output_dir = lookup(DIR_VAR)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from);
        config.quiet = lookup(QUIET_VAR).is_some();
        config
    }
}

/// Report settings of the current process, read on first use.
pub static REPORT_CONFIG: Lazy<ReportConfig> = Lazy::new(ReportConfig::from_env);
