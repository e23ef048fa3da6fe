//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS runs (
            run_id TEXT PRIMARY KEY,
            game_url TEXT NOT NULL,
            status TEXT NOT NULL,
            exit_code INTEGER,
            summary_json TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            finished_at TEXT
        );

        CREATE TABLE IF NOT EXISTS game_versions (
            id TEXT PRIMARY KEY,
            game_id TEXT NOT NULL,
            label TEXT NOT NULL,
            game_url TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'draft',
            device_tested INTEGER NOT NULL DEFAULT 0,
            audio_tested INTEGER NOT NULL DEFAULT 0,
            gameplay_complete INTEGER NOT NULL DEFAULT 0,
            content_verified INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS qc_reports (
            id INTEGER PRIMARY KEY,
            version_id TEXT NOT NULL,
            run_id TEXT,
            source TEXT NOT NULL,
            decision TEXT,
            report_json TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (version_id) REFERENCES game_versions(id)
        );

        CREATE TABLE IF NOT EXISTS version_audit (
            id INTEGER PRIMARY KEY,
            version_id TEXT NOT NULL,
            from_status TEXT NOT NULL,
            to_status TEXT NOT NULL,
            actor TEXT NOT NULL,
            evidence_ref TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (version_id) REFERENCES game_versions(id)
        );

        CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at);
        CREATE INDEX IF NOT EXISTS idx_qc_reports_version ON qc_reports(version_id, id);
        CREATE INDEX IF NOT EXISTS idx_version_audit_version ON version_audit(version_id, id);",
    )?;

    // Migration: Add 'report_url' to runs if missing
    let has_report_url: i32 = conn
        .query_row(
            "SELECT count(*) FROM pragma_table_info('runs') WHERE name='report_url'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if has_report_url == 0 {
        conn.execute("ALTER TABLE runs ADD COLUMN report_url TEXT", [])?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        for table in ["runs", "game_versions", "qc_reports", "version_audit"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0, "{table}");
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error

        let has_report_url: i32 = conn
            .query_row(
                "SELECT count(*) FROM pragma_table_info('runs') WHERE name='report_url'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(has_report_url, 1);
    }
}
