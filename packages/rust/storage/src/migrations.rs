//! SQL migration definitions for the pipeline state database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: bills, stage_records",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Bills known to the tracker, with their upstream metadata
CREATE TABLE IF NOT EXISTS bills (
    session       TEXT NOT NULL,
    number        TEXT NOT NULL,
    metadata_json TEXT,
    updated_at    TEXT NOT NULL,
    PRIMARY KEY (session, number)
);

-- One row per (bill, stage)
CREATE TABLE IF NOT EXISTS stage_records (
    session           TEXT NOT NULL,
    number            TEXT NOT NULL,
    stage             TEXT NOT NULL,
    status            TEXT NOT NULL,
    fingerprint       TEXT,
    artifact_json     TEXT,
    error_json        TEXT,
    attempts          INTEGER NOT NULL DEFAULT 0,
    last_attempt_at   TEXT,
    last_success_json TEXT,
    PRIMARY KEY (session, number, stage)
);

CREATE INDEX IF NOT EXISTS idx_stage_records_status ON stage_records(session, status);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
