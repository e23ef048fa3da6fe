//! Run summaries and the result aggregator that builds them.
//!
//! A run's checks are folded by id with a "worst wins" rule, then a single
//! verdict is computed with infrastructure failures taking precedence over
//! logical test failures.

pub mod legacy;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checks::{Check, Severity};

/// Written into every summary so readers can detect format changes.
pub const SCHEMA_VERSION: &str = "iruka-qa.summary/1";

/// File name of the summary inside a run directory.
pub const SUMMARY_FILE: &str = "summary.json";

/// Overall verdict of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pass,
    Fail,
    InfraError,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pass => "pass",
            RunStatus::Fail => "fail",
            RunStatus::InfraError => "infra_error",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution of the suite against one build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub run_id: String,
    pub game_url: String,
    pub hub_url: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
}

impl Run {
    pub fn new(run_id: impl Into<String>, game_url: impl Into<String>, hub_url: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            game_url: game_url.into(),
            hub_url: hub_url.into(),
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
            exit_code: None,
        }
    }
}

/// The durable record of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub schema_version: String,
    pub run: Run,
    pub status: RunStatus,
    pub checks: Vec<Check>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
}

impl Summary {
    pub fn path_in(work_dir: &Path) -> PathBuf {
        work_dir.join(SUMMARY_FILE)
    }

    /// Write the summary as pretty JSON into `work_dir`.
    pub fn write_to(&self, work_dir: &Path) -> Result<PathBuf> {
        let path = Self::path_in(work_dir);
        let json = serde_json::to_vec_pretty(self).context("failed to serialize summary")?;
        std::fs::write(&path, json)
            .with_context(|| format!("failed to write summary: {}", path.display()))?;
        Ok(path)
    }

    pub fn read_from(work_dir: &Path) -> Result<Self> {
        let path = Self::path_in(work_dir);
        let raw = std::fs::read(&path)
            .with_context(|| format!("failed to read summary: {}", path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse summary: {}", path.display()))
    }

    pub fn check(&self, id: &str) -> Option<&Check> {
        self.checks.iter().find(|c| c.id == id)
    }
}

/// Fold `new` into `old`, applying severity, outcome, then diagnostics.
pub fn merge_checks(old: &Check, new: Check) -> Check {
    let severity = if old.severity == Severity::Blocker || new.severity == Severity::Blocker {
        Severity::Blocker
    } else {
        Severity::Warning
    };
    let ok = old.ok && new.ok;

    // First failure wins; a first failure arriving late brings its own
    // diagnostics.
    let (message, details) = if !ok && !old.ok {
        (old.message.clone(), old.details.clone())
    } else if !ok && !new.ok {
        (new.message, new.details)
    } else {
        (old.message.clone(), old.details.clone())
    };

    Check {
        id: old.id.clone(),
        severity,
        ok,
        message,
        details,
    }
}

/// Fold `checks` by id in first-seen order, merging repeats.
pub fn fold_checks<I>(checks: I) -> Vec<Check>
where
    I: IntoIterator<Item = Check>,
{
    let mut out: Vec<Check> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for check in checks {
        match index.get(&check.id) {
            Some(&i) => out[i] = merge_checks(&out[i], check),
            None => {
                index.insert(check.id.clone(), out.len());
                out.push(check);
            }
        }
    }
    out
}

/// Verdict for a set of merged checks.
pub fn compute_status(checks: &[Check]) -> RunStatus {
    if checks.iter().any(|c| c.is_infra() && !c.ok) {
        RunStatus::InfraError
    } else if checks.iter().any(|c| c.severity == Severity::Blocker && !c.ok) {
        RunStatus::Fail
    } else {
        RunStatus::Pass
    }
}

/// Map a raw process status to the run's exit code: only a clean zero is
/// success, everything else (including signal termination) is 1.
pub fn normalize_exit_code(code: Option<i32>) -> i32 {
    match code {
        Some(0) => 0,
        _ => 1,
    }
}

/// Collects the checks of one run. Owned by a single pipeline; never shared
/// across runs or tasks.
#[derive(Debug)]
pub struct ResultAggregator {
    run: Run,
    checks: Vec<Check>,
    index: HashMap<String, usize>,
    warnings: Vec<String>,
    artifacts: BTreeMap<String, String>,
}

impl ResultAggregator {
    pub fn new(run: Run) -> Self {
        Self {
            run,
            checks: Vec::new(),
            index: HashMap::new(),
            warnings: Vec::new(),
            artifacts: BTreeMap::new(),
        }
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn set_exit_code(&mut self, code: i32) {
        self.run.exit_code = Some(code);
    }

    /// Store a check, folding it into an earlier one with the same id.
    pub fn upsert_check(&mut self, check: Check) {
        match self.index.get(&check.id) {
            Some(&i) => {
                let merged = merge_checks(&self.checks[i], check);
                self.checks[i] = merged;
            }
            None => {
                self.index.insert(check.id.clone(), self.checks.len());
                self.checks.push(check);
            }
        }
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn add_artifact(&mut self, name: impl Into<String>, relative_path: impl Into<String>) {
        self.artifacts.insert(name.into(), relative_path.into());
    }

    pub fn checks(&self) -> &[Check] {
        &self.checks
    }

    /// Close the run at the current time.
    pub fn finalize(&mut self) -> Summary {
        self.finalize_at(Utc::now())
    }

    /// Close the run at `finished_at`. A finish time before the start (clock
    /// skew) yields a zero duration.
    pub fn finalize_at(&mut self, finished_at: DateTime<Utc>) -> Summary {
        self.run.finished_at = Some(finished_at);
        self.run.duration_ms = (finished_at - self.run.started_at)
            .num_milliseconds()
            .max(0) as u64;

        Summary {
            schema_version: SCHEMA_VERSION.to_string(),
            run: self.run.clone(),
            status: compute_status(&self.checks),
            checks: self.checks.clone(),
            warnings: self.warnings.clone(),
            artifacts: self.artifacts.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
