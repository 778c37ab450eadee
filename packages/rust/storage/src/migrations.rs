//! SQL migration definitions for the matflow database.
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
        description: "Initial schema: runs, run_manifest, profiles, matches",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per pipeline invocation
CREATE TABLE IF NOT EXISTS runs (
    id          TEXT PRIMARY KEY,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    stats_json  TEXT
);

-- Durable per-fingerprint work status
CREATE TABLE IF NOT EXISTS run_manifest (
    fingerprint   TEXT PRIMARY KEY,
    stage         TEXT NOT NULL,
    record_id     TEXT NOT NULL,
    status        TEXT NOT NULL,
    artifact_path TEXT,
    reason        TEXT,
    run_id        TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_manifest_stage_record ON run_manifest(stage, record_id);

-- Stage 1 documents
CREATE TABLE IF NOT EXISTS profiles (
    record_id      TEXT PRIMARY KEY,
    fingerprint    TEXT NOT NULL,
    schema_version TEXT NOT NULL,
    prompt_version TEXT NOT NULL,
    model          TEXT NOT NULL,
    call_id        TEXT NOT NULL,
    generated_at   TEXT NOT NULL,
    file_path      TEXT NOT NULL,
    document_json  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS profile_attributes (
    record_id  TEXT NOT NULL REFERENCES profiles(record_id) ON DELETE CASCADE,
    attribute  TEXT NOT NULL,
    value_json TEXT NOT NULL,
    PRIMARY KEY (record_id, attribute)
);

-- Stage 2 documents
CREATE TABLE IF NOT EXISTS matches (
    subject_id         TEXT PRIMARY KEY,
    fingerprint        TEXT NOT NULL,
    schema_version     TEXT NOT NULL,
    prompt_version     TEXT NOT NULL,
    model              TEXT NOT NULL,
    call_id            TEXT NOT NULL,
    generated_at       TEXT NOT NULL,
    candidate_ids_json TEXT NOT NULL,
    file_path          TEXT NOT NULL,
    document_json      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS match_entries (
    subject_id   TEXT NOT NULL REFERENCES matches(subject_id) ON DELETE CASCADE,
    ordinal      INTEGER NOT NULL,
    candidate_id TEXT NOT NULL,
    score        REAL,
    category     TEXT,
    entry_json   TEXT NOT NULL,
    PRIMARY KEY (subject_id, ordinal)
);

CREATE INDEX IF NOT EXISTS idx_match_entries_candidate ON match_entries(candidate_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
