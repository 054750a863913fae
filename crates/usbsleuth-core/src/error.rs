/// Error types for the correlation engine.
///
/// Only two things can stop a run: the input directory itself being
/// unreadable, and a failure while writing a report. Everything else
/// (missing keys, malformed names, unreadable individual files) is
/// absorbed by the passes and surfaces as log output or a skipped-file
/// entry in the run summary.
use std::path::PathBuf;
use thiserror::Error;

/// Failures while opening or navigating an on-disk `regf` hive.
#[derive(Debug, Error)]
pub enum HiveError {
    #[error("cannot read hive file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("not a registry hive (base block signature is not \"regf\")")]
    BadSignature,

    #[error("hive data truncated: need {needed} bytes at offset {offset:#x}, have {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("cell at {offset:#x} has signature {found:?}, expected {expected:?}")]
    BadCell {
        offset: u32,
        expected: &'static str,
        found: [u8; 2],
    },
}

/// Hard failures of a correlation run.
#[derive(Debug, Error)]
pub enum CorrelateError {
    #[error("input directory {path} is not readable: {reason}")]
    UnreadableInput { path: PathBuf, reason: String },

    #[error("invalid install-log pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("cannot load configuration {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("report output failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV report failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON report failed: {0}")]
    Json(#[from] serde_json::Error),
}
