//! Test-driver process wrapper: spawn one driver per run, capture its
//! output streams to files, report a normalized exit code.
//!
//! The runner has no timeout of its own. A hung driver has to be killed by
//! whatever orchestrates the service.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::config::DriverConfig;
use crate::summary::normalize_exit_code;

pub const STDOUT_FILE: &str = "stdout.log";
pub const STDERR_FILE: &str = "stderr.log";

/// Parallel workers would share one harness page, so the driver always gets
/// exactly one.
pub const WORKER_ARG: &str = "--workers=1";

/// Variables forwarded from the service's own environment when set.
const INHERITED: &[&str] = &["PATH", "HOME", "LANG", "TMPDIR", "NODE_PATH", "PLAYWRIGHT_BROWSERS_PATH"];

/// URLs under test for one run.
#[derive(Debug, Clone)]
pub struct RunTargets {
    pub game_url: String,
    pub hub_url: String,
}

/// Fully resolved description of the child process. Nothing in here is
/// optional; absent values were dropped while building it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub work_dir: PathBuf,
}

/// Keep only variables with a real value.
pub fn filter_env<I, K>(vars: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (K, Option<String>)>,
    K: Into<String>,
{
    vars.into_iter()
        .filter_map(|(k, v)| match v {
            Some(v) if !v.is_empty() => Some((k.into(), v)),
            _ => None,
        })
        .collect()
}

impl DriverSpec {
    /// Resolve the child configuration. `inherited` looks up variables of the
    /// parent environment.
    pub fn resolve<F>(
        config: &DriverConfig,
        run_id: &str,
        work_dir: &Path,
        targets: &RunTargets,
        inherited: F,
    ) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut vars: Vec<(String, Option<String>)> = INHERITED
            .iter()
            .map(|k| (k.to_string(), inherited(k)))
            .collect();
        vars.extend(
            config
                .extra_env
                .iter()
                .map(|(k, v)| (k.clone(), Some(v.clone()))),
        );
        vars.extend([
            ("RUN_ID".to_string(), Some(run_id.to_string())),
            ("RUN_DIR".to_string(), Some(work_dir.display().to_string())),
            ("GAME_URL".to_string(), Some(targets.game_url.clone())),
            ("HUB_URL".to_string(), Some(targets.hub_url.clone())),
            ("REPORT_DIR".to_string(), Some(config.report_dir.clone())),
            ("WORKERS".to_string(), Some("1".to_string())),
        ]);

        let mut args = config.args.clone();
        if !args.iter().any(|a| a.starts_with("--workers")) {
            args.push(WORKER_ARG.to_string());
        }

        Self {
            program: config.program.clone(),
            args,
            env: filter_env(vars),
            work_dir: work_dir.to_path_buf(),
        }
    }
}

/// What came out of one driver execution.
#[derive(Debug, Clone)]
pub struct DriverOutcome {
    /// 0 on success, 1 for everything else.
    pub exit_code: i32,
    /// The code the process actually returned, if it returned one.
    pub raw_code: Option<i32>,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    /// Set when the process could not be started or awaited at all.
    pub spawn_error: Option<String>,
}

/// Spawns the test driver.
#[derive(Debug, Clone)]
pub struct JobRunner {
    config: DriverConfig,
}

impl JobRunner {
    pub fn new(config: DriverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Run the driver for `run_id` inside `work_dir`. Never fails: problems
    /// starting the process are folded into the outcome with exit code 1.
    pub async fn run(&self, run_id: &str, work_dir: &Path, targets: &RunTargets) -> DriverOutcome {
        let stdout_path = work_dir.join(STDOUT_FILE);
        let stderr_path = work_dir.join(STDERR_FILE);
        let spec = DriverSpec::resolve(&self.config, run_id, work_dir, targets, |k| {
            std::env::var(k).ok()
        });

        match execute(&spec, &stdout_path, &stderr_path).await {
            Ok(raw_code) => {
                let exit_code = normalize_exit_code(raw_code);
                info!(run_id, ?raw_code, exit_code, "driver exited");
                DriverOutcome {
                    exit_code,
                    raw_code,
                    stdout_path,
                    stderr_path,
                    spawn_error: None,
                }
            }
            Err(e) => {
                error!(run_id, program = %spec.program, error = %e, "driver could not run");
                append_note(&stderr_path, &format!("[iruka-qa] driver failed to run: {e:#}\n"));
                DriverOutcome {
                    exit_code: 1,
                    raw_code: None,
                    stdout_path,
                    stderr_path,
                    spawn_error: Some(format!("{e:#}")),
                }
            }
        }
    }
}

async fn execute(spec: &DriverSpec, stdout_path: &Path, stderr_path: &Path) -> Result<Option<i32>> {
    tokio::fs::create_dir_all(&spec.work_dir)
        .await
        .with_context(|| format!("failed to create run dir: {}", spec.work_dir.display()))?;

    let stdout = open_append(stdout_path)?;
    let stderr = open_append(stderr_path)?;

    let mut child = tokio::process::Command::new(&spec.program)
        .args(&spec.args)
        .env_clear()
        .envs(&spec.env)
        .current_dir(&spec.work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn {}", spec.program))?;

    let status = child.wait().await.context("failed to wait for driver")?;
    Ok(status.code())
}

fn open_append(path: &Path) -> Result<std::fs::File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))
}

fn append_note(path: &Path, note: &str) {
    use std::io::Write;
    if let Err(e) = open_append(path).and_then(|mut f| {
        f.write_all(note.as_bytes())
            .with_context(|| format!("failed to write {}", path.display()))
    }) {
        warn!(error = %e, "could not record driver failure in stderr log");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
