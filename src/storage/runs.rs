//! Persisted run summaries.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::Pool;
use crate::summary::Summary;

/// One row of the `runs` table, without the summary body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: String,
    pub game_url: String,
    pub status: String,
    pub exit_code: Option<i32>,
    pub report_url: Option<String>,
    pub created_at: String,
    pub finished_at: Option<String>,
}

/// Store (or replace) the final summary of a run.
pub fn save_run(pool: &Pool, summary: &Summary, report_url: Option<&str>) -> Result<()> {
    let conn = pool.get()?;
    let body = serde_json::to_string(summary).context("failed to serialize summary")?;

    conn.execute(
        "INSERT INTO runs (run_id, game_url, status, exit_code, summary_json, report_url, created_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(run_id) DO UPDATE SET
            status = excluded.status,
            exit_code = excluded.exit_code,
            summary_json = excluded.summary_json,
            report_url = excluded.report_url,
            finished_at = excluded.finished_at",
        params![
            summary.run.run_id,
            summary.run.game_url,
            summary.status.as_str(),
            summary.run.exit_code,
            body,
            report_url,
            summary.run.started_at.to_rfc3339(),
            summary.run.finished_at.map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(())
}

/// Load the stored summary of a run.
pub fn load_summary(pool: &Pool, run_id: &str) -> Result<Option<Summary>> {
    let conn = pool.get()?;
    let body: Option<String> = conn
        .query_row(
            "SELECT summary_json FROM runs WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )
        .optional()?;

    body.map(|b| {
        serde_json::from_str(&b).with_context(|| format!("stored summary for {run_id} is corrupt"))
    })
    .transpose()
}

/// Most recent runs first.
pub fn list_runs(pool: &Pool, limit: usize) -> Result<Vec<RunRecord>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT run_id, game_url, status, exit_code, report_url, created_at, finished_at
         FROM runs ORDER BY created_at DESC, run_id DESC LIMIT ?1",
    )?;

    let rows = stmt
        .query_map(params![limit as i64], |row| {
            Ok(RunRecord {
                run_id: row.get(0)?,
                game_url: row.get(1)?,
                status: row.get(2)?,
                exit_code: row.get(3)?,
                report_url: row.get(4)?,
                created_at: row.get(5)?,
                finished_at: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
