//! SQLite record store for projects, test cases, steps, runs and step results

use crate::types::*;
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                base_url TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS test_cases (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_test_cases_project ON test_cases(project_id);

            CREATE TABLE IF NOT EXISTS steps (
                id TEXT PRIMARY KEY,
                test_case_id TEXT NOT NULL REFERENCES test_cases(id) ON DELETE CASCADE,
                step_order INTEGER NOT NULL,
                raw_text TEXT NOT NULL,
                action TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_steps_case ON steps(test_case_id, step_order);

            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                test_case_id TEXT NOT NULL REFERENCES test_cases(id) ON DELETE CASCADE,
                browser TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                ended_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_runs_case ON runs(test_case_id, started_at);
            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);

            -- step_id is not a foreign key: results outlive edits to the step list
            CREATE TABLE IF NOT EXISTS step_results (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                step_id TEXT NOT NULL,
                status TEXT NOT NULL,
                error_text TEXT,
                screenshot_path TEXT,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_step_results_run ON step_results(run_id);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Projects
    // ========================================================================

    pub fn create_project(&self, name: &str, base_url: &str) -> Result<Project> {
        let conn = self.conn.lock();
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM projects WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        if exists > 0 {
            return Err(Error::AlreadyExists {
                kind: "project".to_string(),
                id: name.to_string(),
            });
        }

        let project = Project {
            id: new_id(),
            name: name.to_string(),
            base_url: base_url.to_string(),
            created_at: now_millis(),
        };
        conn.execute(
            "INSERT INTO projects (id, name, base_url, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![project.id, project.name, project.base_url, project.created_at],
        )?;

        debug!("Created project {} ({})", project.name, project.id);
        Ok(project)
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let conn = self.conn.lock();
        let project = conn
            .query_row(
                "SELECT id, name, base_url, created_at FROM projects WHERE id = ?1 OR name = ?1",
                params![id],
                project_from_row,
            )
            .optional()?;
        Ok(project)
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, name, base_url, created_at FROM projects ORDER BY created_at")?;
        let rows = stmt.query_map([], project_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Delete a project and, through cascading foreign keys, everything it owns
    pub fn delete_project(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM projects WHERE id = ?1", params![id])?;
        if rows > 0 {
            debug!("Deleted project {}", id);
        }
        Ok(rows > 0)
    }

    // ========================================================================
    // Test cases
    // ========================================================================

    pub fn create_test_case(&self, project_id: &str, title: &str) -> Result<TestCase> {
        let conn = self.conn.lock();
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM projects WHERE id = ?1",
            params![project_id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(Error::not_found("project", project_id));
        }

        let case = TestCase {
            id: new_id(),
            project_id: project_id.to_string(),
            title: title.to_string(),
            created_at: now_millis(),
        };
        conn.execute(
            "INSERT INTO test_cases (id, project_id, title, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![case.id, case.project_id, case.title, case.created_at],
        )?;

        debug!("Created test case {} ({})", case.title, case.id);
        Ok(case)
    }

    pub fn get_test_case(&self, id: &str) -> Result<Option<TestCase>> {
        let conn = self.conn.lock();
        let case = conn
            .query_row(
                "SELECT id, project_id, title, created_at FROM test_cases WHERE id = ?1",
                params![id],
                test_case_from_row,
            )
            .optional()?;
        Ok(case)
    }

    pub fn list_test_cases(&self, project_id: &str) -> Result<Vec<TestCase>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, project_id, title, created_at FROM test_cases
             WHERE project_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![project_id], test_case_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn delete_test_case(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM test_cases WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    /// Resolve the test title, owning project and base URL a run needs
    pub fn run_context(&self, test_case_id: &str) -> Result<Option<RunContext>> {
        let conn = self.conn.lock();
        let ctx = conn
            .query_row(
                "SELECT tc.id, tc.title, p.id, p.name, p.base_url
                 FROM test_cases tc JOIN projects p ON p.id = tc.project_id
                 WHERE tc.id = ?1",
                params![test_case_id],
                |row| {
                    Ok(RunContext {
                        test_case_id: row.get(0)?,
                        test_title: row.get(1)?,
                        project_id: row.get(2)?,
                        project_name: row.get(3)?,
                        base_url: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(ctx)
    }

    // ========================================================================
    // Steps
    // ========================================================================

    /// Append a step at the end of the test case
    pub fn add_step(&self, test_case_id: &str, raw_text: &str, action: &Action) -> Result<Step> {
        let conn = self.conn.lock();
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM test_cases WHERE id = ?1",
            params![test_case_id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(Error::not_found("test case", test_case_id));
        }

        let next_order: u32 = conn.query_row(
            "SELECT COALESCE(MAX(step_order), 0) + 1 FROM steps WHERE test_case_id = ?1",
            params![test_case_id],
            |row| row.get(0),
        )?;

        let step = Step {
            id: new_id(),
            test_case_id: test_case_id.to_string(),
            step_order: next_order,
            raw_text: raw_text.to_string(),
            action: action.clone(),
        };
        conn.execute(
            "INSERT INTO steps (id, test_case_id, step_order, raw_text, action)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                step.id,
                step.test_case_id,
                step.step_order,
                step.raw_text,
                serde_json::to_string(&step.action)?,
            ],
        )?;

        debug!("Added step {} to test case {}", step.step_order, test_case_id);
        Ok(step)
    }

    /// Replace the whole ordered step list of a test case in one transaction
    pub fn replace_steps(&self, test_case_id: &str, steps: &[(String, Action)]) -> Result<Vec<Step>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM steps WHERE test_case_id = ?1", params![test_case_id])?;

        let mut created = Vec::with_capacity(steps.len());
        for (idx, (raw_text, action)) in steps.iter().enumerate() {
            let step = Step {
                id: new_id(),
                test_case_id: test_case_id.to_string(),
                step_order: idx as u32 + 1,
                raw_text: raw_text.clone(),
                action: action.clone(),
            };
            tx.execute(
                "INSERT INTO steps (id, test_case_id, step_order, raw_text, action)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    step.id,
                    step.test_case_id,
                    step.step_order,
                    step.raw_text,
                    serde_json::to_string(&step.action)?,
                ],
            )?;
            created.push(step);
        }

        tx.commit()?;
        Ok(created)
    }

    pub fn list_steps(&self, test_case_id: &str) -> Result<Vec<Step>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, test_case_id, step_order, raw_text, action FROM steps
             WHERE test_case_id = ?1 ORDER BY step_order",
        )?;
        let rows = stmt.query_map(params![test_case_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (id, test_case_id, step_order, raw_text, action) = row?;
            results.push(Step {
                id,
                test_case_id,
                step_order,
                raw_text,
                action: serde_json::from_str(&action)?,
            });
        }
        Ok(results)
    }

    /// Delete a step. The gap in the ordering is closed only when no later
    /// step is referenced by a run, so recorded results keep their order.
    pub fn delete_step(&self, step_id: &str) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let found = tx
            .query_row(
                "SELECT test_case_id, step_order FROM steps WHERE id = ?1",
                params![step_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)),
            )
            .optional()?;

        let Some((test_case_id, order)) = found else {
            return Ok(false);
        };

        tx.execute("DELETE FROM steps WHERE id = ?1", params![step_id])?;

        let referenced_after: i64 = tx.query_row(
            "SELECT COUNT(*) FROM steps s
             WHERE s.test_case_id = ?1 AND s.step_order > ?2
               AND EXISTS (SELECT 1 FROM step_results sr WHERE sr.step_id = s.id)",
            params![test_case_id, order],
            |row| row.get(0),
        )?;
        if referenced_after == 0 {
            tx.execute(
                "UPDATE steps SET step_order = step_order - 1 WHERE test_case_id = ?1 AND step_order > ?2",
                params![test_case_id, order],
            )?;
        } else {
            debug!("Leaving a gap at step {} of test case {}", order, test_case_id);
        }
        tx.commit()?;
        Ok(true)
    }

    // ========================================================================
    // Runs
    // ========================================================================

    /// Insert a running Run and one pending StepResult per step, all or nothing
    pub fn create_run_with_results(
        &self,
        run_id: &str,
        test_case_id: &str,
        browser: BrowserKind,
        step_ids: &[String],
    ) -> Result<Run> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = now_millis();

        tx.execute(
            "INSERT INTO runs (id, test_case_id, browser, status, started_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, test_case_id, browser.as_str(), RunStatus::Running.as_str(), now],
        )?;

        for step_id in step_ids {
            tx.execute(
                "INSERT INTO step_results (id, run_id, step_id, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![new_id(), run_id, step_id, StepStatus::Pending.as_str(), now],
            )?;
        }

        tx.commit()?;
        debug!("Created run {} with {} pending results", run_id, step_ids.len());

        Ok(Run {
            id: run_id.to_string(),
            test_case_id: test_case_id.to_string(),
            browser,
            status: RunStatus::Running,
            started_at: now,
            ended_at: None,
        })
    }

    /// Move a running run to a terminal status. Returns false when the run is
    /// gone or was already finalized.
    pub fn finish_run(&self, run_id: &str, status: RunStatus) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE runs SET status = ?1, ended_at = ?2 WHERE id = ?3 AND status = ?4",
            params![status.as_str(), now_millis(), run_id, RunStatus::Running.as_str()],
        )?;
        Ok(rows > 0)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let conn = self.conn.lock();
        let run = conn
            .query_row(
                "SELECT id, test_case_id, browser, status, started_at, ended_at FROM runs WHERE id = ?1",
                params![run_id],
                raw_run_from_row,
            )
            .optional()?;
        run.map(RawRun::parse).transpose()
    }

    /// Runs of a test case, oldest first
    pub fn list_runs_for_test_case(&self, test_case_id: &str) -> Result<Vec<Run>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, test_case_id, browser, status, started_at, ended_at FROM runs
             WHERE test_case_id = ?1 ORDER BY started_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![test_case_id], raw_run_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?.parse()?);
        }
        Ok(results)
    }

    /// Most recent run still marked running, if any
    pub fn find_running_run(&self) -> Result<Option<Run>> {
        let conn = self.conn.lock();
        let run = conn
            .query_row(
                "SELECT id, test_case_id, browser, status, started_at, ended_at FROM runs
                 WHERE status = ?1 ORDER BY started_at DESC, rowid DESC LIMIT 1",
                params![RunStatus::Running.as_str()],
                raw_run_from_row,
            )
            .optional()?;
        run.map(RawRun::parse).transpose()
    }

    // ========================================================================
    // Step results
    // ========================================================================

    /// Move a pending result to a terminal status. Results already terminal
    /// and results that no longer exist are left untouched.
    pub fn update_step_result(
        &self,
        run_id: &str,
        step_id: &str,
        status: StepStatus,
        error_text: Option<&str>,
        screenshot_path: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE step_results
             SET status = ?1, error_text = COALESCE(?2, error_text),
                 screenshot_path = COALESCE(?3, screenshot_path), updated_at = ?4
             WHERE run_id = ?5 AND step_id = ?6 AND status = ?7",
            params![
                status.as_str(),
                error_text,
                screenshot_path,
                now_millis(),
                run_id,
                step_id,
                StepStatus::Pending.as_str(),
            ],
        )?;
        Ok(rows > 0)
    }

    /// Cancel every pending result of a run, keeping any error text already set
    pub fn cancel_pending_results(&self, run_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE step_results
             SET status = ?1, error_text = COALESCE(error_text, ?2), updated_at = ?3
             WHERE run_id = ?4 AND status = ?5",
            params![
                StepStatus::Cancelled.as_str(),
                STEP_DID_NOT_RUN,
                now_millis(),
                run_id,
                StepStatus::Pending.as_str(),
            ],
        )?;
        Ok(rows)
    }

    pub fn get_step_result(&self, run_id: &str, step_id: &str) -> Result<Option<StepResult>> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                &format!("{} WHERE sr.run_id = ?1 AND sr.step_id = ?2", STEP_RESULT_SELECT),
                params![run_id, step_id],
                raw_step_result_from_row,
            )
            .optional()?;
        result.map(RawStepResult::parse).transpose()
    }

    /// Results of a run ordered by step order
    pub fn list_step_results(&self, run_id: &str) -> Result<Vec<StepResult>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE sr.run_id = ?1 ORDER BY COALESCE(s.step_order, 0), sr.rowid",
            STEP_RESULT_SELECT
        ))?;
        let rows = stmt.query_map(params![run_id], raw_step_result_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?.parse()?);
        }
        Ok(results)
    }
}

const STEP_RESULT_SELECT: &str = "SELECT sr.id, sr.run_id, sr.step_id, s.step_order, s.raw_text, sr.status,
            sr.error_text, sr.screenshot_path, sr.updated_at
     FROM step_results sr LEFT JOIN steps s ON s.id = sr.step_id";

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        base_url: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn test_case_from_row(row: &Row<'_>) -> rusqlite::Result<TestCase> {
    Ok(TestCase {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        created_at: row.get(3)?,
    })
}

/// Raw run row before parsing enum columns
struct RawRun {
    id: String,
    test_case_id: String,
    browser: String,
    status: String,
    started_at: i64,
    ended_at: Option<i64>,
}

fn raw_run_from_row(row: &Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        id: row.get(0)?,
        test_case_id: row.get(1)?,
        browser: row.get(2)?,
        status: row.get(3)?,
        started_at: row.get(4)?,
        ended_at: row.get(5)?,
    })
}

impl RawRun {
    fn parse(self) -> Result<Run> {
        Ok(Run {
            id: self.id,
            test_case_id: self.test_case_id,
            browser: self.browser.parse()?,
            status: self.status.parse()?,
            started_at: self.started_at,
            ended_at: self.ended_at,
        })
    }
}

struct RawStepResult {
    id: String,
    run_id: String,
    step_id: String,
    step_order: Option<u32>,
    raw_text: Option<String>,
    status: String,
    error_text: Option<String>,
    screenshot_path: Option<String>,
    updated_at: i64,
}

fn raw_step_result_from_row(row: &Row<'_>) -> rusqlite::Result<RawStepResult> {
    Ok(RawStepResult {
        id: row.get(0)?,
        run_id: row.get(1)?,
        step_id: row.get(2)?,
        step_order: row.get(3)?,
        raw_text: row.get(4)?,
        status: row.get(5)?,
        error_text: row.get(6)?,
        screenshot_path: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

impl RawStepResult {
    fn parse(self) -> Result<StepResult> {
        Ok(StepResult {
            id: self.id,
            run_id: self.run_id,
            step_id: self.step_id,
            step_order: self.step_order.unwrap_or(0),
            raw_text: self.raw_text.unwrap_or_else(|| MISSING_STEP_TEXT.to_string()),
            status: self.status.parse()?,
            error_text: self.error_text,
            screenshot_path: self.screenshot_path,
            updated_at: self.updated_at,
        })
    }
}
