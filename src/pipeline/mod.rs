//! One QA run end to end: driver, evaluation, summary, upload, callback.

pub mod qc;
pub mod submission;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::bridge::{BridgeDump, DUMP_FILE};
use crate::callback::{CallbackDispatcher, CallbackPayload};
use crate::checks::evaluator::{evaluate_automatic, EvalContext};
use crate::checks::{ids, Check, Severity};
use crate::config::ServiceConfig;
use crate::publish::ArtifactPublisher;
use crate::runner::{DriverOutcome, JobRunner, RunTargets, STDERR_FILE, STDOUT_FILE};
use crate::storage::{self, Pool};
use crate::summary::{legacy, ResultAggregator, Run, RunStatus, Summary, SUMMARY_FILE};

pub use self::submission::{host_allowed, validate_game_url, SubmissionError};

/// Checks evaluated in-page by the driver, one JSON object per line.
pub const CHECKS_FILE: &str = "checks.jsonl";

/// What a caller gets back for a finished run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    pub run_id: String,
    pub status: RunStatus,
    pub summary: Summary,
    pub report_url: Option<String>,
    pub local_path: String,
}

pub struct Pipeline {
    runs_dir: PathBuf,
    hub_url: String,
    allowed_domains: Vec<String>,
    report_dir: String,
    runner: JobRunner,
    publisher: ArtifactPublisher,
    callbacks: CallbackDispatcher,
    eval: EvalContext,
    pool: Option<Pool>,
    permits: Arc<Semaphore>,
}

impl Pipeline {
    /// Build a pipeline with the configured storage backend.
    pub fn from_config(config: &ServiceConfig, pool: Option<Pool>) -> Result<Self> {
        let publisher = ArtifactPublisher::from_config(&config.storage, &config.driver.report_dir)?;
        Self::new(config, publisher, pool)
    }

    pub fn new(config: &ServiceConfig, publisher: ArtifactPublisher, pool: Option<Pool>) -> Result<Self> {
        if config.submission.allowed_domains.is_empty() {
            warn!("submission.allowed_domains is empty; any host will be accepted");
        }
        Ok(Self {
            runs_dir: config.server.runs_dir.clone(),
            hub_url: config.submission.hub_url.clone(),
            allowed_domains: config.submission.allowed_domains.clone(),
            report_dir: config.driver.report_dir.trim_matches('/').to_string(),
            runner: JobRunner::new(config.driver.clone()),
            publisher,
            callbacks: CallbackDispatcher::from_config(&config.callback)?,
            eval: EvalContext {
                ready_budget_ms: config.bridge.ready_budget_ms,
            },
            pool,
            permits: Arc::new(Semaphore::new(config.server.max_concurrent_runs.max(1))),
        })
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    pub fn pool(&self) -> Option<&Pool> {
        self.pool.as_ref()
    }

    /// Validate a submission without running anything.
    pub fn validate(&self, game_url: Option<&str>) -> Result<reqwest::Url, SubmissionError> {
        validate_game_url(game_url, &self.allowed_domains)
    }

    /// Validate and run. Validation failures carry no state: no run id is
    /// allocated and no directory is created.
    pub async fn submit(
        &self,
        game_url: Option<&str>,
        meta: Value,
    ) -> Result<Result<RunResponse, SubmissionError>> {
        let url = match self.validate(game_url) {
            Ok(url) => url,
            Err(e) => return Ok(Err(e)),
        };
        self.execute(url.as_str(), meta).await.map(Ok)
    }

    /// Run the whole pipeline for an already validated build URL.
    pub async fn execute(&self, game_url: &str, meta: Value) -> Result<RunResponse> {
        let _permit = self
            .permits
            .acquire()
            .await
            .context("run limiter closed")?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let work_dir = self.run_dir(&run_id);
        tokio::fs::create_dir_all(&work_dir)
            .await
            .with_context(|| format!("failed to create run dir: {}", work_dir.display()))?;
        info!(run_id = %run_id, game_url, "run started");

        let mut agg = ResultAggregator::new(Run::new(&run_id, game_url, &self.hub_url));
        let targets = RunTargets {
            game_url: game_url.to_string(),
            hub_url: self.hub_url.clone(),
        };
        let outcome = self.runner.run(&run_id, &work_dir, &targets).await;
        agg.set_exit_code(outcome.exit_code);
        agg.add_artifact("stdout", STDOUT_FILE);
        agg.add_artifact("stderr", STDERR_FILE);

        record_driver(&mut agg, &outcome);
        if outcome.spawn_error.is_none() {
            self.evaluate(&mut agg, &work_dir);
        }

        let report_object = format!("{}/index.html", self.report_dir);
        if work_dir.join(&report_object).is_file() {
            agg.add_artifact("report", report_object);
        }
        agg.add_artifact("summary", SUMMARY_FILE);

        let summary = close_summary(&mut agg, &work_dir);
        summary.write_to(&work_dir)?;

        let (summary, report_url) = match self.publisher.publish(&run_id, &work_dir).await {
            Ok(published) => (summary, published.report_url),
            Err(e) => {
                warn!(run_id = %run_id, error = %format!("{e:#}"), "artifact upload failed");
                agg.upsert_check(Check::fail(
                    ids::INFRA_ARTIFACT_UPLOAD,
                    Severity::Blocker,
                    format!("{e:#}"),
                ));
                let summary = close_summary(&mut agg, &work_dir);
                summary.write_to(&work_dir)?;
                (summary, None)
            }
        };

        if let Some(pool) = self.pool.clone() {
            let record = summary.clone();
            let url = report_url.clone();
            tokio::task::spawn_blocking(move || storage::runs::save_run(&pool, &record, url.as_deref()))
                .await
                .context("run persistence task panicked")??;
        }

        info!(
            run_id = %run_id,
            status = %summary.status,
            duration_ms = summary.run.duration_ms,
            "run finished"
        );

        self.callbacks
            .dispatch(CallbackPayload::new(summary.clone(), report_url.clone(), meta));

        Ok(RunResponse {
            run_id,
            status: summary.status,
            summary,
            report_url,
            local_path: work_dir.display().to_string(),
        })
    }

    /// Fold the driver's own checks and the bridge evaluation into `agg`.
    fn evaluate(&self, agg: &mut ResultAggregator, work_dir: &Path) {
        let run_id = agg.run().run_id.clone();

        match read_driver_checks(work_dir) {
            Ok((checks, rejected)) => {
                for check in checks {
                    agg.upsert_check(check);
                }
                if rejected > 0 {
                    agg.add_warning(format!("{rejected} unreadable line(s) in {CHECKS_FILE}"));
                }
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "driver checks unreadable");
                agg.add_warning(format!("{CHECKS_FILE} ignored: {e}"));
            }
        }

        if !work_dir.join(DUMP_FILE).is_file() {
            agg.upsert_check(Check::fail(
                ids::INFRA_BRIDGE_LOG,
                Severity::Blocker,
                "driver wrote no bridge log",
            ));
            return;
        }
        match BridgeDump::read_from(work_dir) {
            Ok(dump) => {
                agg.upsert_check(
                    Check::pass(ids::INFRA_BRIDGE_LOG, Severity::Blocker)
                        .with_details(json!({ "entries": dump.entries.len(), "evicted": dump.evicted })),
                );
                for check in evaluate_automatic(&dump, &self.eval) {
                    agg.upsert_check(check);
                }
            }
            Err(e) => {
                agg.upsert_check(Check::fail(
                    ids::INFRA_BRIDGE_LOG,
                    Severity::Blocker,
                    format!("{e:#}"),
                ));
            }
        }
    }
}

/// Finalize, merge the legacy summary, and list the bridge dump as an
/// artifact when the run did not pass.
fn close_summary(agg: &mut ResultAggregator, work_dir: &Path) -> Summary {
    let mut summary = legacy::merge_from_dir(agg.finalize(), work_dir);
    if summary.status != RunStatus::Pass && work_dir.join(DUMP_FILE).is_file() {
        summary
            .artifacts
            .insert("bridge".to_string(), DUMP_FILE.to_string());
    }
    summary
}

/// Driver health as checks: an infra check for whether it ran at all and a
/// blocker for its exit code.
fn record_driver(agg: &mut ResultAggregator, outcome: &DriverOutcome) {
    match &outcome.spawn_error {
        Some(e) => agg.upsert_check(Check::fail(ids::INFRA_DRIVER_SPAWN, Severity::Blocker, e.clone())),
        None => {
            agg.upsert_check(Check::pass(ids::INFRA_DRIVER_SPAWN, Severity::Blocker));
            let details = json!({ "exitCode": outcome.exit_code, "rawCode": outcome.raw_code });
            let check = if outcome.exit_code == 0 {
                Check::pass(ids::DRIVER_EXIT, Severity::Blocker)
            } else {
                let how = match outcome.raw_code {
                    Some(code) => format!("driver exited with code {code}"),
                    None => "driver was terminated by a signal".to_string(),
                };
                Check::fail(ids::DRIVER_EXIT, Severity::Blocker, how)
            };
            agg.upsert_check(check.with_details(details));
        }
    }
}

/// Parse `checks.jsonl`. Returns the parsed checks and the number of lines
/// that were not valid checks. A missing file is not an error.
pub fn read_driver_checks(work_dir: &Path) -> Result<(Vec<Check>, usize)> {
    let path = work_dir.join(CHECKS_FILE);
    if !path.exists() {
        return Ok((Vec::new(), 0));
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let mut checks = Vec::new();
    let mut rejected = 0;
    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match serde_json::from_str::<Check>(line) {
            Ok(check) => checks.push(check),
            Err(_) => rejected += 1,
        }
    }
    Ok((checks, rejected))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{DriverConfig, StorageConfig};
    use crate::publish::store::BlobStore;
    use bytes::Bytes;

    /// A bridge log in which the build answers INIT, reports one result, and
    /// retries it identically.
    pub(crate) const PASSING_DUMP: &str = r#"{
        "frameUrl": null,
        "entries": [
            {"seq": 0, "type": "INIT", "direction": "outbound", "at": "2026-01-01T00:00:00Z"},
            {"seq": 1, "type": "READY", "direction": "inbound", "at": "2026-01-01T00:00:00.250Z"},
            {"seq": 2, "type": "RESULT", "direction": "inbound", "payload": {"attemptId": "a1", "score": 3, "completed": true}, "at": "2026-01-01T00:00:05Z"},
            {"seq": 3, "type": "RESULT", "direction": "inbound", "payload": {"attemptId": "a1", "score": 3, "completed": true}, "at": "2026-01-01T00:00:06Z"}
        ],
        "metadata": {},
        "evicted": 0
    }"#;

    /// Shell driver that writes the passing dump, then runs `tail`.
    pub(crate) fn driver_script(tail: &str) -> String {
        format!("cat > {DUMP_FILE} <<'EOF'\n{PASSING_DUMP}\nEOF\n{tail}")
    }

    pub(crate) fn config(dir: &Path, script: &str) -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.server.runs_dir = dir.join("runs");
        config.submission.allowed_domains = vec!["example.com".to_string()];
        config.driver = DriverConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..DriverConfig::default()
        };
        config
    }

    pub(crate) fn pipeline(dir: &Path, script: &str) -> Pipeline {
        let config = config(dir, script);
        let publisher = ArtifactPublisher::with_store(None, StorageConfig::default(), "playwright-report");
        Pipeline::new(&config, publisher, None).unwrap()
    }

    const GAME: &str = "https://cdn.example.com/build/index.html";

    struct FailingStore;

    #[async_trait::async_trait]
    impl BlobStore for FailingStore {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn put(&self, _key: &str, _body: Bytes, _content_type: &str) -> Result<()> {
            anyhow::bail!("bucket unavailable")
        }
    }

    #[tokio::test]
    async fn test_passing_run() {
        let dir = tempfile::TempDir::new().unwrap();
        let p = pipeline(dir.path(), &driver_script("exit 0"));
        let resp = p.execute(GAME, Value::Null).await.unwrap();

        assert_eq!(resp.status, RunStatus::Pass, "{:#?}", resp.summary.checks);
        assert_eq!(resp.summary.run.exit_code, Some(0));
        assert!(resp.summary.check(ids::HANDSHAKE_READY).unwrap().ok);
        assert!(!resp.summary.artifacts.contains_key("bridge"));

        let on_disk = Summary::read_from(Path::new(&resp.local_path)).unwrap();
        assert_eq!(on_disk.checks, resp.summary.checks);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_fail_not_infra() {
        let dir = tempfile::TempDir::new().unwrap();
        let p = pipeline(dir.path(), &driver_script("exit 2"));
        let resp = p.execute(GAME, Value::Null).await.unwrap();

        assert_eq!(resp.status, RunStatus::Fail);
        assert_eq!(resp.summary.run.exit_code, Some(1));
        assert_eq!(resp.summary.artifacts["bridge"], DUMP_FILE);
        let exit = resp.summary.check(ids::DRIVER_EXIT).unwrap();
        assert!(!exit.ok);
        assert_eq!(exit.details.as_ref().unwrap()["rawCode"], 2);
        assert!(resp.summary.checks.iter().filter(|c| c.is_infra()).all(|c| c.ok));
    }

    #[tokio::test]
    async fn test_spawn_error_is_infra_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = config(dir.path(), "");
        config.driver.program = "/nonexistent/iruka-driver".to_string();
        let publisher = ArtifactPublisher::with_store(None, StorageConfig::default(), "playwright-report");
        let p = Pipeline::new(&config, publisher, None).unwrap();

        let resp = p.execute(GAME, Value::Null).await.unwrap();
        assert_eq!(resp.status, RunStatus::InfraError);
        assert_eq!(resp.summary.run.exit_code, Some(1));
        assert!(!resp.summary.check(ids::INFRA_DRIVER_SPAWN).unwrap().ok);
    }

    #[tokio::test]
    async fn test_missing_bridge_log_is_infra_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let p = pipeline(dir.path(), "exit 0");
        let resp = p.execute(GAME, Value::Null).await.unwrap();
        assert_eq!(resp.status, RunStatus::InfraError);
        assert!(!resp.summary.check(ids::INFRA_BRIDGE_LOG).unwrap().ok);
    }

    #[tokio::test]
    async fn test_driver_checks_are_merged() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = driver_script(
            r#"printf '%s\n' '{"id":"qa02.result_shape","severity":"warning","ok":false,"message":"in-page"}' 'garbage' > checks.jsonl"#,
        );
        let p = pipeline(dir.path(), &script);
        let resp = p.execute(GAME, Value::Null).await.unwrap();

        let shape = resp.summary.check(ids::RESULT_SHAPE).unwrap();
        assert!(!shape.ok);
        assert_eq!(shape.severity, Severity::Blocker);
        assert_eq!(shape.message.as_deref(), Some("in-page"));
        assert_eq!(resp.status, RunStatus::Fail);
        assert!(resp.summary.warnings.iter().any(|w| w.contains(CHECKS_FILE)));
    }

    #[tokio::test]
    async fn test_legacy_summary_takes_precedence() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = driver_script(
            r#"mkdir -p results && printf '%s' '{"status":"fail","warnings":["from legacy"]}' > results/summary.json"#,
        );
        let p = pipeline(dir.path(), &script);
        let resp = p.execute(GAME, Value::Null).await.unwrap();
        assert_eq!(resp.status, RunStatus::Fail);
        assert_eq!(resp.summary.warnings[0], "from legacy");
    }

    #[tokio::test]
    async fn test_upload_failure_is_infra_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config(dir.path(), &driver_script("exit 0"));
        let publisher = ArtifactPublisher::with_store(
            Some(Arc::new(FailingStore)),
            StorageConfig::default(),
            "playwright-report",
        );
        let p = Pipeline::new(&config, publisher, None).unwrap();

        let resp = p.execute(GAME, Value::Null).await.unwrap();
        assert_eq!(resp.status, RunStatus::InfraError);
        assert!(resp.report_url.is_none());
        let on_disk = Summary::read_from(Path::new(&resp.local_path)).unwrap();
        assert!(!on_disk.check(ids::INFRA_ARTIFACT_UPLOAD).unwrap().ok);
    }

    #[tokio::test]
    async fn test_upload_failure_survives_legacy_checks() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = driver_script(
            r#"mkdir -p results && printf '%s' '{"checks":[{"id":"legacy.smoke","severity":"blocker","ok":true}]}' > results/summary.json"#,
        );
        let config = config(dir.path(), &script);
        let publisher = ArtifactPublisher::with_store(
            Some(Arc::new(FailingStore)),
            StorageConfig::default(),
            "playwright-report",
        );
        let p = Pipeline::new(&config, publisher, None).unwrap();

        let resp = p.execute(GAME, Value::Null).await.unwrap();
        assert_eq!(resp.status, RunStatus::InfraError);
        assert!(resp.summary.check("legacy.smoke").unwrap().ok);
        assert!(!resp.summary.check(ids::INFRA_ARTIFACT_UPLOAD).unwrap().ok);
        assert_eq!(
            resp.summary.checks.iter().filter(|c| c.id == ids::HANDSHAKE_READY).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_rejected_submission_leaves_no_trace() {
        let dir = tempfile::TempDir::new().unwrap();
        let p = pipeline(dir.path(), "exit 0");
        let res = p.submit(Some("https://evil.test/x"), Value::Null).await.unwrap();
        assert!(matches!(res, Err(SubmissionError::HostNotAllowed(_))));
        assert!(!p.runs_dir().exists());
    }

    #[tokio::test]
    async fn test_run_is_persisted() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = storage::open_pool(&dir.path().join("qa.db")).unwrap();
        let config = config(dir.path(), &driver_script("exit 0"));
        let publisher = ArtifactPublisher::with_store(None, StorageConfig::default(), "playwright-report");
        let p = Pipeline::new(&config, publisher, Some(pool.clone())).unwrap();

        let resp = p.submit(Some(GAME), json!({"source": "test"})).await.unwrap().unwrap();
        let stored = storage::runs::load_summary(&pool, &resp.run_id).unwrap().unwrap();
        assert_eq!(stored.status, resp.status);
    }
}
