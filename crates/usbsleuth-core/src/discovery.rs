/// Evidence discovery: finds hive files and install logs under the input
/// directory.
///
/// The walk uses `jwalk`'s rayon-backed traversal with sorted output, so
/// the order files are reported in (and therefore the order passes see
/// them) is the same from run to run. Candidate hives are then opened and
/// classified in parallel; results are collected in walk order.
use crate::config::RunConfig;
use crate::error::{CorrelateError, HiveError};
use crate::hive::{classify, HiveKind, RegfHive};
use rayon::prelude::*;
use serde::Serialize;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// A file that could not be used, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// A hive file opened and classified.
#[derive(Debug)]
pub struct LoadedHive {
    pub path: PathBuf,
    pub kind: HiveKind,
    pub hive: RegfHive,
}

/// Everything found under the input directory, each list in walk order.
#[derive(Debug, Default)]
pub struct Evidence {
    pub system: Vec<LoadedHive>,
    pub software: Vec<LoadedHive>,
    pub user: Vec<LoadedHive>,
    pub logs: Vec<PathBuf>,
    pub skipped: Vec<SkippedFile>,
}

impl Evidence {
    pub fn hive_count(&self) -> usize {
        self.system.len() + self.software.len() + self.user.len()
    }
}

/// Walk `config.input` and load every hive and log candidate.
///
/// Only an input directory that cannot be read at all is an error.
pub fn discover(config: &RunConfig) -> Result<Evidence, CorrelateError> {
    let start = Instant::now();
    let root = &config.input;
    std::fs::read_dir(root).map_err(|e| CorrelateError::UnreadableInput {
        path: root.clone(),
        reason: e.to_string(),
    })?;

    let mut evidence = Evidence::default();
    let mut candidates: Vec<PathBuf> = Vec::new();

    let walker = jwalk::WalkDir::new(root)
        .sort(true)
        .skip_hidden(false)
        .follow_links(config.follow_links)
        .parallelism(jwalk::Parallelism::RayonNewPool(num_cpus::get()));

    for entry_result in walker {
        let entry = match entry_result {
            Ok(e) => e,
            Err(err) => {
                let path = err.path().map(Path::to_path_buf).unwrap_or_default();
                warn!(path = %path.display(), "cannot read directory entry: {err}");
                evidence.skipped.push(SkippedFile {
                    path,
                    reason: err.to_string(),
                });
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        if config.is_log_file(&path) {
            evidence.logs.push(path);
        } else {
            candidates.push(path);
        }
    }

    let probed: Vec<(PathBuf, Result<Option<LoadedHive>, HiveError>)> = candidates
        .into_par_iter()
        .map(|path| {
            let result = probe_hive(&path);
            (path, result)
        })
        .collect();

    for (path, result) in probed {
        match result {
            Ok(Some(loaded)) => {
                debug!(path = %path.display(), kind = loaded.kind.label(), "hive loaded");
                match loaded.kind {
                    HiveKind::System => evidence.system.push(loaded),
                    HiveKind::Software => evidence.software.push(loaded),
                    HiveKind::NtUser => evidence.user.push(loaded),
                    HiveKind::Other => debug!(path = %path.display(), "hive not used"),
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(path = %path.display(), "skipping unreadable hive: {err}");
                evidence.skipped.push(SkippedFile {
                    path,
                    reason: err.to_string(),
                });
            }
        }
    }

    info!(
        "discovered {} SYSTEM, {} SOFTWARE, {} NTUSER hives and {} logs in {:.2?}",
        evidence.system.len(),
        evidence.software.len(),
        evidence.user.len(),
        evidence.logs.len(),
        start.elapsed()
    );
    Ok(evidence)
}

/// `Ok(None)` for files that are not hives at all.
fn probe_hive(path: &Path) -> Result<Option<LoadedHive>, HiveError> {
    let io_err = |source| HiveError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut magic = [0u8; 4];
    let mut file = File::open(path).map_err(io_err)?;
    match file.read_exact(&mut magic) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(io_err(e)),
    }
    if &magic != b"regf" {
        return Ok(None);
    }

    let hive = RegfHive::open(path)?;
    let kind = classify(&hive, Some(hive.embedded_name()));
    Ok(Some(LoadedHive {
        path: path.to_path_buf(),
        kind,
        hive,
    }))
}
