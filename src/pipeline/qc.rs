//! Automated QC for a game version: run the pipeline against the version's
//! build, store the resulting QC report, and record the decision.

use serde_json::json;
use tracing::{error, info, warn};

use super::Pipeline;
use crate::checks::manual::ManualValidation;
use crate::release::{
    Action, Actor, Decision, QcReport, ReleaseError, ReleaseStore, Transition, VersionStatus,
};
use crate::summary::RunStatus;

/// Run blocking store work off the async executor.
pub(crate) async fn blocking<T, F>(store: &ReleaseStore, f: F) -> Result<T, ReleaseError>
where
    T: Send + 'static,
    F: FnOnce(&ReleaseStore) -> Result<T, ReleaseError> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| ReleaseError::Storage(anyhow::anyhow!("store task failed: {e}")))?
}

/// `uploaded -> qc_processing`.
pub async fn start_qc(store: &ReleaseStore, version_id: &str, actor: &Actor) -> Result<Transition, ReleaseError> {
    let id = version_id.to_string();
    let actor = actor.clone();
    blocking(store, move |s| s.apply(&id, Action::StartQc, &actor, None, None)).await
}

/// Execute QC for a version already in `qc_processing` and record the
/// automated decision: `qc_passed` through the gate when the run passed,
/// `qc_failed` otherwise.
pub async fn complete_qc(
    pipeline: &Pipeline,
    store: &ReleaseStore,
    version_id: &str,
) -> Result<Transition, ReleaseError> {
    let id = version_id.to_string();
    let version = blocking(store, move |s| s.get(&id)).await?;
    if version.status != VersionStatus::QcProcessing {
        return Err(ReleaseError::InvalidTransition {
            action: "run_qc",
            from: version.status,
        });
    }

    let meta = json!({ "versionId": version.id, "gameId": version.game_id, "label": version.label });
    let response = match pipeline.execute(&version.game_url, meta).await {
        Ok(r) => r,
        Err(e) => {
            error!(version_id = %version.id, error = %format!("{e:#}"), "QC run could not execute");
            return decide(store, &version.id, Decision::Fail, None).await;
        }
    };

    let report = QcReport::from_summary(&response.summary);
    let id = version.id.clone();
    blocking(store, move |s| s.record_report(&id, &report, "automatic")).await?;

    let run_id = Some(response.run_id.clone());
    if response.status != RunStatus::Pass {
        info!(version_id = %version.id, status = %response.status, "QC run did not pass");
        return decide(store, &version.id, Decision::Fail, run_id).await;
    }

    match decide(store, &version.id, Decision::Pass, run_id.clone()).await {
        Err(ReleaseError::GateFailed { gate, reason }) => {
            warn!(version_id = %version.id, gate = %gate, reason = %reason, "QC gate rejected passing run");
            decide(store, &version.id, Decision::Fail, run_id).await
        }
        other => other,
    }
}

async fn decide(
    store: &ReleaseStore,
    version_id: &str,
    decision: Decision,
    evidence: Option<String>,
) -> Result<Transition, ReleaseError> {
    let id = version_id.to_string();
    blocking(store, move |s| {
        s.apply(
            &id,
            Action::RecordDecision(decision),
            &Actor::system(),
            evidence.as_deref(),
            Some(VersionStatus::QcProcessing),
        )
    })
    .await
}

/// Store a new QC report carrying the latest automatic groups plus the
/// reviewer's manual validation. The automatic suite is not re-run.
pub async fn record_manual_validation(
    store: &ReleaseStore,
    version_id: &str,
    manual: ManualValidation,
) -> Result<QcReport, ReleaseError> {
    let id = version_id.to_string();
    blocking(store, move |s| {
        let latest = s.latest_report(&id)?.ok_or(ReleaseError::NoQcReport)?;
        let report = latest.with_manual(manual);
        s.record_report(&id, &report, "manual")?;
        Ok(report)
    })
    .await
}
