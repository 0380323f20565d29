//! Embedded SQLite dedup/cache/run-record ledger.
//!
//! The ticket tracker is the source of truth for issue state; this database
//! only ever answers "have I seen this before" and "what happened on past
//! runs". All writes go through a single `Mutex`-guarded connection.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::ticket::IssueRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Running,
    Success,
    Failure,
    Timeout,
    Cancelled,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "timeout" => Some(Self::Timeout),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone)]
pub struct Run {
    pub id: i64,
    pub issue_key: String,
    pub workflow_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: RunOutcome,
    pub log_path: String,
    pub session_id: Option<String>,
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                issue_key TEXT NOT NULL,
                workflow_name TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                outcome TEXT NOT NULL,
                log_path TEXT NOT NULL,
                session_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_runs_issue_key ON runs(issue_key);

            CREATE TABLE IF NOT EXISTS processed_comments (
                issue_key TEXT NOT NULL,
                comment_id INTEGER NOT NULL,
                processed_at TEXT NOT NULL,
                PRIMARY KEY (issue_key, comment_id)
            );

            CREATE TABLE IF NOT EXISTS sessions (
                issue_key TEXT NOT NULL,
                workflow_name TEXT NOT NULL,
                session_id TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (issue_key, workflow_name)
            );
            ",
        )
    }

    pub fn create_run(
        &self,
        issue_ref: &IssueRef,
        workflow_name: &str,
        log_path: &str,
    ) -> rusqlite::Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO runs (issue_key, workflow_name, started_at, outcome, log_path)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                issue_ref.key(),
                workflow_name,
                Utc::now().to_rfc3339(),
                RunOutcome::Running.as_str(),
                log_path,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn settle_run(
        &self,
        run_id: i64,
        outcome: RunOutcome,
        session_id: Option<&str>,
    ) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE runs SET outcome = ?1, finished_at = ?2, session_id = COALESCE(?3, session_id)
             WHERE id = ?4",
            params![
                outcome.as_str(),
                Utc::now().to_rfc3339(),
                session_id,
                run_id,
            ],
        )?;
        Ok(())
    }

    pub fn running_run_for_issue(
        &self,
        issue_ref: &IssueRef,
        workflow_name: &str,
    ) -> rusqlite::Result<Option<Run>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, issue_key, workflow_name, started_at, finished_at, outcome, log_path, session_id
             FROM runs
             WHERE issue_key = ?1 AND workflow_name = ?2 AND outcome = 'running'
             ORDER BY id DESC LIMIT 1",
            params![issue_ref.key(), workflow_name],
            row_to_run,
        )
        .optional()
    }

    pub fn has_processed_comment(&self, issue_ref: &IssueRef, comment_id: u64) -> rusqlite::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM processed_comments WHERE issue_key = ?1 AND comment_id = ?2",
            params![issue_ref.key(), comment_id as i64],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn mark_comment_processed(&self, issue_ref: &IssueRef, comment_id: u64) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO processed_comments (issue_key, comment_id, processed_at)
             VALUES (?1, ?2, ?3)",
            params![issue_ref.key(), comment_id as i64, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_session(&self, issue_ref: &IssueRef, workflow_name: &str) -> rusqlite::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT session_id FROM sessions WHERE issue_key = ?1 AND workflow_name = ?2",
            params![issue_ref.key(), workflow_name],
            |row| row.get(0),
        )
        .optional()
    }

    pub fn set_session(&self, issue_ref: &IssueRef, workflow_name: &str, session_id: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sessions (issue_key, workflow_name, session_id, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(issue_key, workflow_name) DO UPDATE SET session_id = excluded.session_id, updated_at = excluded.updated_at",
            params![issue_ref.key(), workflow_name, session_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn latest_run_log_path(&self, issue_ref: &IssueRef, workflow_name: Option<&str>) -> rusqlite::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        match workflow_name {
            Some(wf) => conn
                .query_row(
                    "SELECT log_path FROM runs WHERE issue_key = ?1 AND workflow_name = ?2 ORDER BY id DESC LIMIT 1",
                    params![issue_ref.key(), wf],
                    |row| row.get(0),
                )
                .optional(),
            None => conn
                .query_row(
                    "SELECT log_path FROM runs WHERE issue_key = ?1 ORDER BY id DESC LIMIT 1",
                    params![issue_ref.key()],
                    |row| row.get(0),
                )
                .optional(),
        }
    }
}

fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<Run> {
    let started_at: String = row.get(3)?;
    let finished_at: Option<String> = row.get(4)?;
    let outcome: String = row.get(5)?;
    Ok(Run {
        id: row.get(0)?,
        issue_key: row.get(1)?,
        workflow_name: row.get(2)?,
        started_at: DateTime::parse_from_rfc3339(&started_at)
            .unwrap()
            .with_timezone(&Utc),
        finished_at: finished_at
            .map(|s| DateTime::parse_from_rfc3339(&s).unwrap().with_timezone(&Utc)),
        outcome: RunOutcome::parse(&outcome).unwrap_or(RunOutcome::Running),
        log_path: row.get(6)?,
        session_id: row.get(7)?,
    })
}
