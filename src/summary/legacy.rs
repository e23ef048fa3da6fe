//! Merge with the summary some older drivers write on their own.
//!
//! The driver-written file lives at `results/summary.json` inside the run
//! directory. When present, its `checks` are folded in ahead of the computed
//! ones (so their diagnostics win on conflict), its `warnings` come first,
//! and its `status` replaces the computed one. Without a legacy `status` the
//! verdict is recomputed over the folded checks. An `infra_error` is never
//! replaced, because it means the driver's own opinion cannot be trusted
//! either.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use super::{compute_status, fold_checks, RunStatus, Summary};
use crate::checks::Check;

/// Location of the legacy file relative to the run directory.
pub const LEGACY_SUMMARY: &str = "results/summary.json";

/// The fields of a legacy summary we honour. Everything is optional.
#[derive(Debug, Default, Deserialize)]
pub struct LegacySummary {
    #[serde(default)]
    pub checks: Option<Vec<Check>>,
    #[serde(default)]
    pub warnings: Option<Vec<String>>,
    #[serde(default)]
    pub status: Option<RunStatus>,
}

pub fn legacy_path(work_dir: &Path) -> PathBuf {
    work_dir.join(LEGACY_SUMMARY)
}

/// Read the legacy summary if one exists. A file that exists but does not
/// parse is reported as an error so the caller can record a warning.
pub fn read_legacy(work_dir: &Path) -> Result<Option<LegacySummary>> {
    let path = legacy_path(work_dir);
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read(&path)
        .with_context(|| format!("failed to read legacy summary: {}", path.display()))?;
    let legacy = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse legacy summary: {}", path.display()))?;
    Ok(Some(legacy))
}

/// Apply `legacy` on top of `fresh`.
pub fn merge(mut fresh: Summary, legacy: LegacySummary) -> Summary {
    let had_checks = legacy.checks.is_some();
    if let Some(checks) = legacy.checks {
        let computed = std::mem::take(&mut fresh.checks);
        fresh.checks = fold_checks(checks.into_iter().chain(computed));
    }
    if let Some(warnings) = legacy.warnings {
        let computed = std::mem::replace(&mut fresh.warnings, warnings);
        for w in computed {
            if !fresh.warnings.contains(&w) {
                fresh.warnings.push(w);
            }
        }
    }

    let computed = if had_checks {
        compute_status(&fresh.checks)
    } else {
        fresh.status
    };
    fresh.status = match legacy.status {
        Some(status) if computed == RunStatus::InfraError && status != RunStatus::InfraError => {
            warn!(
                run_id = %fresh.run.run_id,
                legacy = %status,
                "ignoring legacy status over an infrastructure failure"
            );
            RunStatus::InfraError
        }
        Some(status) => status,
        None => computed,
    };
    fresh
}

/// Read and merge in one step. Problems with the legacy file become a
/// warning on the summary rather than an error.
pub fn merge_from_dir(fresh: Summary, work_dir: &Path) -> Summary {
    match read_legacy(work_dir) {
        Ok(Some(legacy)) => {
            info!(run_id = %fresh.run.run_id, "merging legacy summary");
            merge(fresh, legacy)
        }
        Ok(None) => fresh,
        Err(e) => {
            warn!(run_id = %fresh.run.run_id, error = %e, "legacy summary unreadable");
            let mut fresh = fresh;
            fresh.warnings.push(format!("legacy summary ignored: {e}"));
            fresh
        }
    }
}
