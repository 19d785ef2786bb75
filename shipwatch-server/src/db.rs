//! SQLite persistence for repositories, tasks, and deployment audit records.
//!
//! Repositories are read-only from the webhook path. Task rows carry the
//! merged-PR linkage (`merge_commit_sha`, `pr_status`) and the monotonic
//! deployment state; deployment rows are an append-only audit trail.
//!
//! # Schema Versioning
//!
//! The database uses SQLite's `user_version` pragma to track schema versions.
//! When the schema changes, increment `SCHEMA_VERSION` and add a migration
//! function in `run_migrations`.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use crate::payload::{Environment, Outcome};
use crate::secrets::SealedSecret;

/// Current schema version. Increment when making schema changes.
const SCHEMA_VERSION: i32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRecord {
    pub id: String,
    pub workspace_slug: String,
    pub full_name: String,
    pub html_url: String,
    pub webhook_id: String,
    pub installation_id: u64,
    pub secret_nonce: String,
    pub secret_ciphertext: String,
}

pub struct NewRepository<'a> {
    pub workspace_slug: &'a str,
    pub full_name: &'a str,
    pub html_url: &'a str,
    pub webhook_id: &'a str,
    pub installation_id: u64,
    pub secret: &'a SealedSecret,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub id: String,
    pub repository_id: String,
    pub title: String,
    pub merge_commit_sha: Option<String>,
    pub pr_status: Option<String>,
    pub deployment_status: Option<Environment>,
    pub deployed_to_staging_at: Option<String>,
    pub deployed_to_production_at: Option<String>,
}

pub struct NewTask<'a> {
    pub repository_id: &'a str,
    pub title: &'a str,
    pub merge_commit_sha: Option<&'a str>,
    pub pr_status: Option<&'a str>,
}

pub struct NewDeployment<'a> {
    pub task_id: &'a str,
    pub repository_id: &'a str,
    pub commit_sha: &'a str,
    pub environment: Environment,
    pub outcome: Outcome,
    pub deployment_url: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentRecord {
    pub id: String,
    pub task_id: String,
    pub repository_id: String,
    pub commit_sha: String,
    pub environment: String,
    pub status: String,
    pub deployment_url: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
}

/// SQLite database behind a `Mutex<Connection>`.
///
/// `rusqlite::Connection` is not `Sync`, so the Mutex provides the
/// required synchronization. No lock is ever held across an await point:
/// every method locks, runs its statements, and returns.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database file at the given path.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {:?}", path))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let current_version: i32 =
            conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        if current_version > SCHEMA_VERSION {
            anyhow::bail!(
                "Database schema version {} is newer than supported version {}. \
                 Please upgrade the application.",
                current_version,
                SCHEMA_VERSION
            );
        }

        if current_version < SCHEMA_VERSION {
            Self::run_migrations(&conn, current_version)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        Ok(())
    }

    fn run_migrations(conn: &Connection, from_version: i32) -> Result<()> {
        // Migration v0 -> v1: Initial schema
        if from_version < 1 {
            Self::migrate_v0_to_v1(conn)?;
        }

        Ok(())
    }

    fn migrate_v0_to_v1(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS repositories (
                id TEXT PRIMARY KEY,
                workspace_slug TEXT NOT NULL,
                full_name TEXT NOT NULL,
                html_url TEXT NOT NULL UNIQUE,
                webhook_id TEXT NOT NULL UNIQUE,
                installation_id INTEGER NOT NULL,
                secret_nonce TEXT NOT NULL,
                secret_ciphertext TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                repository_id TEXT NOT NULL REFERENCES repositories(id),
                title TEXT NOT NULL,
                merge_commit_sha TEXT,
                pr_status TEXT,
                deployment_status TEXT CHECK(deployment_status IS NULL OR
                    deployment_status IN ('staging', 'production')),
                deployed_to_staging_at TEXT,
                deployed_to_production_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_repository
            ON tasks(repository_id);

            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL REFERENCES tasks(id),
                repository_id TEXT NOT NULL REFERENCES repositories(id),
                commit_sha TEXT NOT NULL,
                environment TEXT NOT NULL CHECK(environment IN ('STAGING', 'PRODUCTION')),
                status TEXT NOT NULL CHECK(status IN ('SUCCESS', 'FAILURE', 'IN_PROGRESS')),
                deployment_url TEXT,
                started_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_deployments_repository
            ON deployments(repository_id, environment, status, started_at);
            "#,
        )
        .context("Failed to create initial schema (v0 -> v1)")?;

        Ok(())
    }

    /// Register a repository with its sealed webhook secret. Called from
    /// the workspace-linking flow, never from webhook processing.
    pub fn insert_repository(&self, new: &NewRepository) -> Result<String> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let id = Uuid::new_v4().to_string();

        conn.execute(
            r#"
            INSERT INTO repositories (
                id, workspace_slug, full_name, html_url, webhook_id,
                installation_id, secret_nonce, secret_ciphertext, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            rusqlite::params![
                id,
                new.workspace_slug,
                new.full_name,
                new.html_url,
                new.webhook_id,
                new.installation_id,
                new.secret.nonce,
                new.secret.ciphertext,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to insert repository")?;

        Ok(id)
    }

    pub fn repository_by_webhook_id(&self, webhook_id: &str) -> Result<Option<RepositoryRecord>> {
        let conn = self.conn.lock().expect("mutex poisoned");

        conn.query_row(
            r#"
            SELECT id, workspace_slug, full_name, html_url, webhook_id,
                   installation_id, secret_nonce, secret_ciphertext
            FROM repositories
            WHERE webhook_id = ?1
            "#,
            [webhook_id],
            |row| {
                Ok(RepositoryRecord {
                    id: row.get(0)?,
                    workspace_slug: row.get(1)?,
                    full_name: row.get(2)?,
                    html_url: row.get(3)?,
                    webhook_id: row.get(4)?,
                    installation_id: row.get(5)?,
                    secret_nonce: row.get(6)?,
                    secret_ciphertext: row.get(7)?,
                })
            },
        )
        .optional()
        .context("Failed to look up repository by webhook id")
    }

    pub fn insert_task(&self, new: &NewTask) -> Result<String> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let id = Uuid::new_v4().to_string();

        conn.execute(
            r#"
            INSERT INTO tasks (id, repository_id, title, merge_commit_sha, pr_status)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            rusqlite::params![
                id,
                new.repository_id,
                new.title,
                new.merge_commit_sha,
                new.pr_status,
            ],
        )
        .context("Failed to insert task")?;

        Ok(id)
    }

    /// Tasks in the repository whose pull request has merged, i.e. the
    /// ones a deployment event can apply to.
    pub fn merged_tasks(&self, repository_id: &str) -> Result<Vec<TaskRecord>> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, repository_id, title, merge_commit_sha, pr_status,
                       deployment_status, deployed_to_staging_at, deployed_to_production_at
                FROM tasks
                WHERE repository_id = ?1
                  AND pr_status = 'merged'
                  AND merge_commit_sha IS NOT NULL
                "#,
            )
            .context("Failed to prepare merged tasks query")?;

        let rows = stmt
            .query_map([repository_id], row_to_task)
            .context("Failed to query merged tasks")?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")??);
        }
        Ok(tasks)
    }

    pub fn task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let row = conn
            .query_row(
                r#"
                SELECT id, repository_id, title, merge_commit_sha, pr_status,
                       deployment_status, deployed_to_staging_at, deployed_to_production_at
                FROM tasks
                WHERE id = ?1
                "#,
                [task_id],
                row_to_task,
            )
            .optional()
            .context("Failed to look up task")?;

        row.transpose()
    }

    /// The commit of the most recent successful staging deployment for
    /// the repository, used as the range baseline for the next staging
    /// delivery. `None` before the first staging success.
    pub fn latest_staging_baseline(&self, repository_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("mutex poisoned");

        conn.query_row(
            r#"
            SELECT commit_sha FROM deployments
            WHERE repository_id = ?1 AND environment = 'STAGING' AND status = 'SUCCESS'
            ORDER BY started_at DESC, rowid DESC
            LIMIT 1
            "#,
            [repository_id],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to query staging baseline")
    }

    /// Advance a task's deployment state. The WHERE clause enforces the
    /// monotonic rule at the SQL level as well, so a stale or reordered
    /// delivery can never downgrade a task even if the caller's view of
    /// the task was outdated. Timestamps are set once via COALESCE.
    ///
    /// Returns whether a row was actually updated.
    pub fn promote_task(
        &self,
        task_id: &str,
        environment: Environment,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let now = now.to_rfc3339();

        let updated = match environment {
            Environment::Staging => conn
                .execute(
                    r#"
                    UPDATE tasks
                    SET deployment_status = 'staging',
                        deployed_to_staging_at = COALESCE(deployed_to_staging_at, ?2)
                    WHERE id = ?1 AND deployment_status IS NULL
                    "#,
                    rusqlite::params![task_id, now],
                )
                .context("Failed to promote task to staging")?,
            Environment::Production => conn
                .execute(
                    r#"
                    UPDATE tasks
                    SET deployment_status = 'production',
                        deployed_to_production_at = COALESCE(deployed_to_production_at, ?2)
                    WHERE id = ?1
                      AND (deployment_status IS NULL OR deployment_status = 'staging')
                    "#,
                    rusqlite::params![task_id, now],
                )
                .context("Failed to promote task to production")?,
        };

        Ok(updated > 0)
    }

    /// Append one immutable audit record for a processed delivery.
    /// `completed_at` stays NULL while the deployment is in progress.
    pub fn insert_deployment(&self, new: &NewDeployment) -> Result<String> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let completed_at = match new.outcome {
            Outcome::InProgress => None,
            Outcome::Success | Outcome::Failure => Some(now.clone()),
        };

        conn.execute(
            r#"
            INSERT INTO deployments (
                id, task_id, repository_id, commit_sha, environment, status,
                deployment_url, started_at, completed_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            rusqlite::params![
                id,
                new.task_id,
                new.repository_id,
                new.commit_sha,
                new.environment.audit_str(),
                new.outcome.audit_str(),
                new.deployment_url,
                now,
                completed_at,
            ],
        )
        .context("Failed to insert deployment record")?;

        Ok(id)
    }

    pub fn deployments_for_task(&self, task_id: &str) -> Result<Vec<DeploymentRecord>> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, task_id, repository_id, commit_sha, environment, status,
                       deployment_url, started_at, completed_at
                FROM deployments
                WHERE task_id = ?1
                ORDER BY started_at, rowid
                "#,
            )
            .context("Failed to prepare deployments query")?;

        let rows = stmt
            .query_map([task_id], |row| {
                Ok(DeploymentRecord {
                    id: row.get(0)?,
                    task_id: row.get(1)?,
                    repository_id: row.get(2)?,
                    commit_sha: row.get(3)?,
                    environment: row.get(4)?,
                    status: row.get(5)?,
                    deployment_url: row.get(6)?,
                    started_at: row.get(7)?,
                    completed_at: row.get(8)?,
                })
            })
            .context("Failed to query deployments")?;

        let mut deployments = Vec::new();
        for row in rows {
            deployments.push(row.context("Failed to read deployment row")?);
        }
        Ok(deployments)
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<TaskRecord>> {
    let status: Option<String> = row.get(5)?;
    Ok(build_task(
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        status,
        row.get(6)?,
        row.get(7)?,
    ))
}

#[allow(clippy::too_many_arguments)]
fn build_task(
    id: String,
    repository_id: String,
    title: String,
    merge_commit_sha: Option<String>,
    pr_status: Option<String>,
    deployment_status: Option<String>,
    deployed_to_staging_at: Option<String>,
    deployed_to_production_at: Option<String>,
) -> Result<TaskRecord> {
    let deployment_status = match deployment_status.as_deref() {
        None => None,
        Some(raw) => Some(
            Environment::from_raw(raw)
                .ok_or_else(|| anyhow!("Unknown deployment_status in database: {}", raw))?,
        ),
    };

    Ok(TaskRecord {
        id,
        repository_id,
        title,
        merge_commit_sha,
        pr_status,
        deployment_status,
        deployed_to_staging_at,
        deployed_to_production_at,
    })
}
