//! Persistent version records, QC reports and the transition audit trail.
//!
//! Every status change runs in one immediate transaction: the version row is
//! re-read, preconditions are checked, the row is updated with
//! `WHERE status = <expected>`, and one audit row is inserted. Either both
//! writes land or neither does.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    check_transition, Action, Actor, Attestations, Decision, QcReport, ReleaseError,
    VersionStatus,
};
use crate::storage::Pool;

/// Fields supplied when registering a version.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewVersion {
    pub game_id: String,
    pub label: String,
    pub game_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameVersion {
    pub id: String,
    pub game_id: String,
    pub label: String,
    pub game_url: String,
    pub status: VersionStatus,
    pub attestations: Attestations,
    pub created_at: String,
    pub updated_at: String,
}

/// One status change of a version.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: i64,
    pub version_id: String,
    pub from_status: VersionStatus,
    pub to_status: VersionStatus,
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_ref: Option<String>,
    pub created_at: String,
}

/// Outcome of applying an action.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub version: GameVersion,
    pub from: VersionStatus,
    /// False when the version was already in the target state.
    pub changed: bool,
}

#[derive(Clone)]
pub struct ReleaseStore {
    pool: Pool,
}

fn corrupt(what: &str, value: &str) -> ReleaseError {
    ReleaseError::Storage(anyhow::anyhow!("stored {what} is invalid: {value}"))
}

fn load_version(conn: &Connection, id: &str) -> Result<GameVersion, ReleaseError> {
    let row = conn
        .query_row(
            "SELECT id, game_id, label, game_url, status,
                    device_tested, audio_tested, gameplay_complete, content_verified,
                    created_at, updated_at
             FROM game_versions WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    GameVersion {
                        id: row.get(0)?,
                        game_id: row.get(1)?,
                        label: row.get(2)?,
                        game_url: row.get(3)?,
                        status: VersionStatus::Draft,
                        attestations: Attestations {
                            device_tested: row.get(5)?,
                            audio_tested: row.get(6)?,
                            gameplay_complete: row.get(7)?,
                            content_verified: row.get(8)?,
                        },
                        created_at: row.get(9)?,
                        updated_at: row.get(10)?,
                    },
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;

    let Some((mut version, status)) = row else {
        return Err(ReleaseError::NotFound(id.to_string()));
    };
    version.status = status.parse().map_err(|_| corrupt("status", &status))?;
    Ok(version)
}

/// The newest report of a version. The `decision` column is authoritative:
/// a decision recorded after the report was written replaces the one in
/// `report_json`.
fn latest_report_row(conn: &Connection, version_id: &str) -> Result<Option<(i64, QcReport)>, ReleaseError> {
    let row: Option<(i64, String, Option<String>)> = conn
        .query_row(
            "SELECT id, report_json, decision FROM qc_reports
             WHERE version_id = ?1 ORDER BY id DESC LIMIT 1",
            params![version_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let Some((id, json, decision)) = row else {
        return Ok(None);
    };
    let mut report: QcReport =
        serde_json::from_str(&json).map_err(|_| corrupt("QC report", &id.to_string()))?;
    if let Some(decision) = decision {
        report.decision = Some(decision.parse().map_err(|_| corrupt("decision", &decision))?);
    }
    Ok(Some((id, report)))
}

impl ReleaseStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn create(&self, new: &NewVersion) -> Result<GameVersion, ReleaseError> {
        for (field, value) in [
            ("gameId", &new.game_id),
            ("label", &new.label),
            ("gameUrl", &new.game_url),
        ] {
            if value.trim().is_empty() {
                return Err(ReleaseError::Invalid(format!("{field} is required")));
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO game_versions (id, game_id, label, game_url, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                id,
                new.game_id.trim(),
                new.label.trim(),
                new.game_url.trim(),
                VersionStatus::Draft.as_str(),
                now
            ],
        )?;
        info!(version_id = %id, game_id = %new.game_id, "version created");
        load_version(&conn, &id)
    }

    pub fn get(&self, id: &str) -> Result<GameVersion, ReleaseError> {
        let conn = self.pool.get()?;
        load_version(&conn, id)
    }

    pub fn list(&self, limit: usize) -> Result<Vec<GameVersion>, ReleaseError> {
        let conn = self.pool.get()?;
        let ids: Vec<String> = conn
            .prepare("SELECT id FROM game_versions ORDER BY created_at DESC, id LIMIT ?1")?
            .query_map(params![limit as i64], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        ids.iter().map(|id| load_version(&conn, id)).collect()
    }

    /// Replace the uploader's attestations.
    pub fn set_attestations(
        &self,
        id: &str,
        attestations: Attestations,
    ) -> Result<GameVersion, ReleaseError> {
        let conn = self.pool.get()?;
        let updated = conn.execute(
            "UPDATE game_versions
             SET device_tested = ?2, audio_tested = ?3, gameplay_complete = ?4,
                 content_verified = ?5, updated_at = ?6
             WHERE id = ?1",
            params![
                id,
                attestations.device_tested,
                attestations.audio_tested,
                attestations.gameplay_complete,
                attestations.content_verified,
                Utc::now().to_rfc3339()
            ],
        )?;
        if updated == 0 {
            return Err(ReleaseError::NotFound(id.to_string()));
        }
        load_version(&conn, id)
    }

    /// Append a QC report. The newest report is the authoritative one.
    pub fn record_report(
        &self,
        version_id: &str,
        report: &QcReport,
        source: &str,
    ) -> Result<i64, ReleaseError> {
        let conn = self.pool.get()?;
        load_version(&conn, version_id)?;
        let json = serde_json::to_string(report).map_err(anyhow::Error::from)?;
        conn.execute(
            "INSERT INTO qc_reports (version_id, run_id, source, decision, report_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                version_id,
                report.run_id,
                source,
                report.decision.map(|d| d.as_str()),
                json,
                report.created_at.to_rfc3339()
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(version_id, report_id = id, source, "QC report recorded");
        Ok(id)
    }

    pub fn latest_report(&self, version_id: &str) -> Result<Option<QcReport>, ReleaseError> {
        let conn = self.pool.get()?;
        load_version(&conn, version_id)?;
        Ok(latest_report_row(&conn, version_id)?.map(|(_, r)| r))
    }

    /// Apply `action` to a version.
    ///
    /// Retrying an action whose target state is already reached is a no-op
    /// and writes no audit row. With `expected` set, the call fails as stale
    /// unless the version is currently in that state.
    pub fn apply(
        &self,
        id: &str,
        action: Action,
        actor: &Actor,
        evidence_ref: Option<&str>,
        expected: Option<VersionStatus>,
    ) -> Result<Transition, ReleaseError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let version = load_version(&tx, id)?;
        let from = version.status;

        if let Some(permission) = action.required_permission() {
            if !actor.has(permission) {
                return Err(ReleaseError::Forbidden { permission });
            }
        }
        if let Some(expected) = expected.filter(|e| *e != from) {
            return Err(ReleaseError::Stale { expected });
        }
        if from == action.target() {
            debug!(version_id = id, status = %from, action = action.name(), "already in target state");
            return Ok(Transition {
                version,
                from,
                changed: false,
            });
        }

        let latest = match action {
            Action::RecordDecision(Decision::Pass) => latest_report_row(&tx, id)?,
            _ => None,
        };
        let to = check_transition(
            action,
            from,
            &version.attestations,
            latest.as_ref().map(|(_, r)| r),
            actor,
        )?;

        let now = Utc::now().to_rfc3339();
        let updated = tx.execute(
            "UPDATE game_versions SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![to.as_str(), now, id, from.as_str()],
        )?;
        if updated == 0 {
            return Err(ReleaseError::Stale { expected: from });
        }

        tx.execute(
            "INSERT INTO version_audit (version_id, from_status, to_status, actor, evidence_ref, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, from.as_str(), to.as_str(), actor.id, evidence_ref, now],
        )?;

        if let Action::RecordDecision(decision) = action {
            tx.execute(
                "UPDATE qc_reports SET decision = ?1
                 WHERE id = (SELECT MAX(id) FROM qc_reports WHERE version_id = ?2)",
                params![decision.as_str(), id],
            )?;
        }

        let version = load_version(&tx, id)?;
        tx.commit()?;

        info!(
            version_id = id,
            from = %from,
            to = %to,
            actor = %actor.id,
            "version transitioned"
        );
        Ok(Transition {
            version,
            from,
            changed: true,
        })
    }

    /// Audit trail of a version, oldest first.
    pub fn history(&self, version_id: &str) -> Result<Vec<AuditEntry>, ReleaseError> {
        let conn = self.pool.get()?;
        load_version(&conn, version_id)?;

        let rows: Vec<(i64, String, String, String, Option<String>, String)> = conn
            .prepare(
                "SELECT id, from_status, to_status, actor, evidence_ref, created_at
                 FROM version_audit WHERE version_id = ?1 ORDER BY id",
            )?
            .query_map(params![version_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<Result<_, _>>()?;

        rows.into_iter()
            .map(|(id, from, to, actor, evidence_ref, created_at)| {
                Ok(AuditEntry {
                    id,
                    version_id: version_id.to_string(),
                    from_status: from.parse().map_err(|_| corrupt("status", &from))?,
                    to_status: to.parse().map_err(|_| corrupt("status", &to))?,
                    actor,
                    evidence_ref,
                    created_at,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::Permission;
    use crate::storage::open_pool;

    fn store() -> (tempfile::TempDir, ReleaseStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = open_pool(&dir.path().join("release.db")).unwrap();
        (dir, ReleaseStore::new(pool))
    }

    fn new_version(store: &ReleaseStore) -> GameVersion {
        store
            .create(&NewVersion {
                game_id: "dolphin-dash".to_string(),
                label: "1.4.0".to_string(),
                game_url: "https://cdn.example.com/dolphin/1.4.0/index.html".to_string(),
            })
            .unwrap()
    }

    fn passing_report() -> QcReport {
        let mut r = QcReport::empty();
        r.qa01.pass = true;
        r.qa02.pass = true;
        r.qa04.pass = true;
        r
    }

    fn admin() -> Actor {
        Actor::new(
            "admin",
            vec![Permission::Approve, Permission::Publish, Permission::Archive],
        )
    }

    /// Drive a fresh version to `qc_processing`.
    fn processing(store: &ReleaseStore) -> GameVersion {
        let v = new_version(store);
        store.set_attestations(&v.id, Attestations::all()).unwrap();
        store
            .apply(&v.id, Action::SubmitToQc, &admin(), None, None)
            .unwrap();
        store
            .apply(&v.id, Action::StartQc, &admin(), None, None)
            .unwrap()
            .version
    }

    #[test]
    fn test_create_validates_fields() {
        let (_dir, store) = store();
        let err = store
            .create(&NewVersion {
                game_id: " ".to_string(),
                label: "1".to_string(),
                game_url: "https://x".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, ReleaseError::Invalid(_)));

        let v = new_version(&store);
        assert_eq!(v.status, VersionStatus::Draft);
        assert_eq!(store.get(&v.id).unwrap(), v);
        assert!(matches!(store.get("nope"), Err(ReleaseError::NotFound(_))));
    }

    #[test]
    fn test_submit_without_attestations_leaves_draft() {
        let (_dir, store) = store();
        let v = new_version(&store);
        let err = store
            .apply(&v.id, Action::SubmitToQc, &admin(), None, None)
            .unwrap_err();
        assert!(matches!(err, ReleaseError::Incomplete { .. }));
        assert_eq!(store.get(&v.id).unwrap().status, VersionStatus::Draft);
        assert!(store.history(&v.id).unwrap().is_empty());
    }

    #[test]
    fn test_full_lifecycle_writes_one_audit_per_step() {
        let (_dir, store) = store();
        let v = processing(&store);
        store
            .record_report(&v.id, &passing_report(), "automatic")
            .unwrap();

        let steps = [
            Action::RecordDecision(Decision::Pass),
            Action::Approve,
            Action::Publish,
            Action::Archive,
            Action::Republish,
        ];
        for action in steps {
            let t = store
                .apply(&v.id, action, &admin(), Some("run-1"), None)
                .unwrap();
            assert!(t.changed);
            assert_eq!(t.version.status, action.target());
        }

        let history = store.history(&v.id).unwrap();
        let path: Vec<(VersionStatus, VersionStatus)> =
            history.iter().map(|a| (a.from_status, a.to_status)).collect();
        use VersionStatus::*;
        assert_eq!(
            path,
            vec![
                (Draft, Uploaded),
                (Uploaded, QcProcessing),
                (QcProcessing, QcPassed),
                (QcPassed, Approved),
                (Approved, Published),
                (Published, Archived),
                (Archived, Published),
            ]
        );
        assert_eq!(history[2].evidence_ref.as_deref(), Some("run-1"));
        assert_eq!(history[0].actor, "admin");

        let latest = store.latest_report(&v.id).unwrap().unwrap();
        assert!(latest.qa01.pass);
    }

    #[test]
    fn test_gate_failure_keeps_state_and_names_gate() {
        let (_dir, store) = store();
        let v = processing(&store);
        let mut report = passing_report();
        report.qa02.pass = false;
        store.record_report(&v.id, &report, "automatic").unwrap();

        let err = store
            .apply(&v.id, Action::RecordDecision(Decision::Pass), &admin(), None, None)
            .unwrap_err();
        assert!(matches!(err, ReleaseError::GateFailed { ref gate, .. } if gate == "qa02"));
        assert_eq!(store.get(&v.id).unwrap().status, VersionStatus::QcProcessing);
    }

    #[test]
    fn test_latest_report_is_authoritative() {
        let (_dir, store) = store();
        let v = processing(&store);
        let mut failing = passing_report();
        failing.qa01.pass = false;
        store.record_report(&v.id, &failing, "automatic").unwrap();
        store.record_report(&v.id, &passing_report(), "rerun").unwrap();

        store
            .apply(&v.id, Action::RecordDecision(Decision::Pass), &admin(), None, None)
            .unwrap();
        let latest = store.latest_report(&v.id).unwrap().unwrap();
        assert!(latest.qa01.pass);
    }

    #[test]
    fn test_retry_is_idempotent() {
        let (_dir, store) = store();
        let v = processing(&store);
        let again = store
            .apply(&v.id, Action::StartQc, &admin(), None, None)
            .unwrap();
        assert!(!again.changed);
        assert_eq!(again.version.status, VersionStatus::QcProcessing);
        assert_eq!(store.history(&v.id).unwrap().len(), 2);
    }

    #[test]
    fn test_forbidden_leaves_state() {
        let (_dir, store) = store();
        let v = processing(&store);
        store
            .apply(&v.id, Action::RecordDecision(Decision::Fail), &admin(), None, None)
            .unwrap();

        let v = processing_from_failed(&store, &v.id);
        store.record_report(&v.id, &passing_report(), "automatic").unwrap();
        store
            .apply(&v.id, Action::RecordDecision(Decision::Pass), &Actor::system(), None, None)
            .unwrap();

        let viewer = Actor::new("viewer", vec![]);
        let err = store
            .apply(&v.id, Action::Approve, &viewer, None, None)
            .unwrap_err();
        assert!(matches!(err, ReleaseError::Forbidden { .. }));
        assert_eq!(store.get(&v.id).unwrap().status, VersionStatus::QcPassed);
    }

    fn processing_from_failed(store: &ReleaseStore, id: &str) -> GameVersion {
        store
            .apply(id, Action::SubmitToQc, &admin(), None, None)
            .unwrap();
        store
            .apply(id, Action::StartQc, &admin(), None, None)
            .unwrap()
            .version
    }

    #[test]
    fn test_stale_expected_status() {
        let (_dir, store) = store();
        let v = processing(&store);
        let err = store
            .apply(
                &v.id,
                Action::RecordDecision(Decision::Fail),
                &admin(),
                None,
                Some(VersionStatus::Uploaded),
            )
            .unwrap_err();
        assert!(matches!(err, ReleaseError::Stale { expected: VersionStatus::Uploaded }));
        assert_eq!(store.get(&v.id).unwrap().status, VersionStatus::QcProcessing);
    }

    #[test]
    fn test_decision_stamped_on_latest_report() {
        let (_dir, store) = store();
        let v = processing(&store);
        store.record_report(&v.id, &passing_report(), "automatic").unwrap();
        store
            .apply(&v.id, Action::RecordDecision(Decision::Fail), &admin(), None, None)
            .unwrap();

        let conn = store.pool.get().unwrap();
        let decision: Option<String> = conn
            .query_row(
                "SELECT decision FROM qc_reports WHERE version_id = ?1",
                params![v.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(decision.as_deref(), Some("fail"));
    }

    #[test]
    fn test_human_decision_is_visible_through_latest_report() {
        let (_dir, store) = store();
        let v = processing(&store);
        let mut report = passing_report();
        report.decision = Some(Decision::Pass);
        store.record_report(&v.id, &report, "automatic").unwrap();

        let t = store
            .apply(&v.id, Action::RecordDecision(Decision::Fail), &admin(), None, None)
            .unwrap();
        assert_eq!(t.version.status, VersionStatus::QcFailed);

        let latest = store.latest_report(&v.id).unwrap().unwrap();
        assert_eq!(latest.decision, Some(Decision::Fail));
        assert!(latest.qa01.pass);
    }
}
