use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, Row};
use tracing::debug;

use auditflow_core::error::{AuditflowError, Result};
use auditflow_core::traits::WorkflowStore;
use auditflow_core::types::{Category, StepResult, UserId, Workflow, WorkflowId};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS workflows (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        slug TEXT NOT NULL UNIQUE,
        title TEXT NOT NULL,
        steps TEXT NOT NULL,
        dependencies TEXT NOT NULL,
        metadata TEXT NOT NULL,
        category_slug TEXT,
        favorites_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_workflows_user ON workflows(user_id);

    CREATE TABLE IF NOT EXISTS step_results (
        user_id TEXT NOT NULL,
        workflow_id TEXT NOT NULL,
        step_id TEXT NOT NULL,
        result TEXT NOT NULL,
        completed INTEGER NOT NULL DEFAULT 0,
        completed_at TEXT,
        PRIMARY KEY (user_id, workflow_id, step_id)
    );

    CREATE TABLE IF NOT EXISTS favorites (
        user_id TEXT NOT NULL,
        workflow_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (user_id, workflow_id)
    );

    CREATE TABLE IF NOT EXISTS categories (
        slug TEXT PRIMARY KEY,
        name TEXT NOT NULL
    );
";

/// SQLite-backed workflow store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AuditflowError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn =
            Connection::open(path).map_err(|e| AuditflowError::Database(e.to_string()))?;

        // WAL for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| AuditflowError::Database(e.to_string()))?;

        conn.execute_batch(SCHEMA)
            .map_err(|e| AuditflowError::Database(e.to_string()))?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| AuditflowError::Database(e.to_string()))?;

        conn.execute_batch(SCHEMA)
            .map_err(|e| AuditflowError::Database(e.to_string()))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or update a category row.
    pub fn upsert_category(&self, category: &Category) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| AuditflowError::Database(e.to_string()))?;
        conn.execute(
            "INSERT INTO categories (slug, name) VALUES (?1, ?2)
             ON CONFLICT(slug) DO UPDATE SET name = excluded.name",
            params![category.slug, category.name],
        )
        .map_err(|e| AuditflowError::Database(e.to_string()))?;
        Ok(())
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AuditflowError::Database(format!("bad timestamp '{}': {}", raw, e)))
}

fn workflow_from_row(row: &Row<'_>) -> rusqlite::Result<(Workflow, String, String)> {
    let steps_json: String = row.get(4)?;
    let deps_json: String = row.get(5)?;
    let metadata_json: String = row.get(6)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;

    let workflow = Workflow {
        id: WorkflowId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        slug: row.get(2)?,
        title: row.get(3)?,
        steps: serde_json::from_str(&steps_json).unwrap_or_default(),
        dependencies: serde_json::from_str(&deps_json).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null),
        category: row.get(7)?,
        favorites_count: row.get(8)?,
        // Filled in by the caller after timestamp parsing.
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    Ok((workflow, created_at, updated_at))
}

const WORKFLOW_COLUMNS: &str = "id, user_id, slug, title, steps, dependencies, metadata, \
                                category_slug, favorites_count, created_at, updated_at";

fn finish_workflow(raw: (Workflow, String, String)) -> Result<Workflow> {
    let (mut wf, created, updated) = raw;
    wf.created_at = parse_timestamp(&created)?;
    wf.updated_at = parse_timestamp(&updated)?;
    Ok(wf)
}

impl SqliteStore {
    fn query_workflows(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Workflow>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| AuditflowError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| AuditflowError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(args, workflow_from_row)
            .map_err(|e| AuditflowError::Database(e.to_string()))?;

        let mut workflows = Vec::new();
        for row in rows {
            let raw = row.map_err(|e| AuditflowError::Database(e.to_string()))?;
            workflows.push(finish_workflow(raw)?);
        }
        Ok(workflows)
    }
}

impl WorkflowStore for SqliteStore {
    fn create_workflow(&self, workflow: &Workflow) -> BoxFuture<'_, Result<()>> {
        let wf = workflow.clone();
        Box::pin(async move {
            let steps = serde_json::to_string(&wf.steps)?;
            let deps = serde_json::to_string(&wf.dependencies)?;
            let metadata = serde_json::to_string(&wf.metadata)?;

            let conn = self
                .conn
                .lock()
                .map_err(|e| AuditflowError::Database(e.to_string()))?;
            conn.execute(
                "INSERT INTO workflows (id, user_id, slug, title, steps, dependencies, metadata,
                                        category_slug, favorites_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    wf.id.0,
                    wf.user_id.0,
                    wf.slug,
                    wf.title,
                    steps,
                    deps,
                    metadata,
                    wf.category,
                    wf.favorites_count,
                    wf.created_at.to_rfc3339(),
                    wf.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| AuditflowError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn get_workflow(&self, id: &WorkflowId) -> BoxFuture<'_, Result<Option<Workflow>>> {
        let id = id.0.clone();
        Box::pin(async move {
            let sql = format!("SELECT {} FROM workflows WHERE id = ?1", WORKFLOW_COLUMNS);
            let found = self.query_workflows(&sql, params![id])?;
            Ok(found.into_iter().next())
        })
    }

    fn get_workflow_by_slug(&self, slug: &str) -> BoxFuture<'_, Result<Option<Workflow>>> {
        let slug = slug.to_string();
        Box::pin(async move {
            let sql = format!("SELECT {} FROM workflows WHERE slug = ?1", WORKFLOW_COLUMNS);
            let found = self.query_workflows(&sql, params![slug])?;
            Ok(found.into_iter().next())
        })
    }

    fn update_workflow(&self, workflow: &Workflow) -> BoxFuture<'_, Result<()>> {
        let wf = workflow.clone();
        Box::pin(async move {
            let steps = serde_json::to_string(&wf.steps)?;
            let deps = serde_json::to_string(&wf.dependencies)?;
            let metadata = serde_json::to_string(&wf.metadata)?;

            let conn = self
                .conn
                .lock()
                .map_err(|e| AuditflowError::Database(e.to_string()))?;
            // Scoped to the owning user in the same statement.
            let changed = conn
                .execute(
                    "UPDATE workflows
                     SET slug = ?1, title = ?2, steps = ?3, dependencies = ?4, metadata = ?5,
                         category_slug = ?6, updated_at = ?7
                     WHERE id = ?8 AND user_id = ?9",
                    params![
                        wf.slug,
                        wf.title,
                        steps,
                        deps,
                        metadata,
                        wf.category,
                        Utc::now().to_rfc3339(),
                        wf.id.0,
                        wf.user_id.0,
                    ],
                )
                .map_err(|e| AuditflowError::Database(e.to_string()))?;

            if changed == 0 {
                return Err(AuditflowError::NotFound(format!(
                    "workflow {} for user {}",
                    wf.id, wf.user_id
                )));
            }
            Ok(())
        })
    }

    fn delete_workflow(&self, user: &UserId, id: &WorkflowId) -> BoxFuture<'_, Result<bool>> {
        let user = user.0.clone();
        let id = id.0.clone();
        Box::pin(async move {
            let mut conn = self
                .conn
                .lock()
                .map_err(|e| AuditflowError::Database(e.to_string()))?;
            let tx = conn
                .transaction()
                .map_err(|e| AuditflowError::Database(e.to_string()))?;

            let deleted = tx
                .execute(
                    "DELETE FROM workflows WHERE id = ?1 AND user_id = ?2",
                    params![id, user],
                )
                .map_err(|e| AuditflowError::Database(e.to_string()))?;
            if deleted > 0 {
                // Favorites go with the workflow; step results are never
                // implicitly deleted.
                tx.execute("DELETE FROM favorites WHERE workflow_id = ?1", params![id])
                    .map_err(|e| AuditflowError::Database(e.to_string()))?;
            }

            tx.commit()
                .map_err(|e| AuditflowError::Database(e.to_string()))?;
            Ok(deleted > 0)
        })
    }

    fn list_workflows(&self, user: &UserId) -> BoxFuture<'_, Result<Vec<Workflow>>> {
        let user = user.0.clone();
        Box::pin(async move {
            let sql = format!(
                "SELECT {} FROM workflows WHERE user_id = ?1 ORDER BY updated_at DESC",
                WORKFLOW_COLUMNS
            );
            self.query_workflows(&sql, params![user])
        })
    }

    fn upsert_step_result(&self, result: &StepResult) -> BoxFuture<'_, Result<()>> {
        let r = result.clone();
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| AuditflowError::Database(e.to_string()))?;
            conn.execute(
                "INSERT INTO step_results (user_id, workflow_id, step_id, result, completed, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(user_id, workflow_id, step_id) DO UPDATE SET
                     result = excluded.result,
                     completed = excluded.completed,
                     completed_at = excluded.completed_at",
                params![
                    r.user_id.0,
                    r.workflow_id.0,
                    r.step_id,
                    r.result,
                    r.completed as i64,
                    r.completed_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(|e| AuditflowError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn get_step_result(
        &self,
        user: &UserId,
        workflow: &WorkflowId,
        step_id: &str,
    ) -> BoxFuture<'_, Result<Option<StepResult>>> {
        let user = user.0.clone();
        let workflow = workflow.0.clone();
        let step_id = step_id.to_string();
        Box::pin(async move {
            let results = self.query_step_results(
                "SELECT user_id, workflow_id, step_id, result, completed, completed_at
                 FROM step_results
                 WHERE user_id = ?1 AND workflow_id = ?2 AND step_id = ?3",
                params![user, workflow, step_id],
            )?;
            Ok(results.into_iter().next())
        })
    }

    fn list_step_results(
        &self,
        user: &UserId,
        workflow: &WorkflowId,
    ) -> BoxFuture<'_, Result<Vec<StepResult>>> {
        let user = user.0.clone();
        let workflow = workflow.0.clone();
        Box::pin(async move {
            self.query_step_results(
                "SELECT user_id, workflow_id, step_id, result, completed, completed_at
                 FROM step_results
                 WHERE user_id = ?1 AND workflow_id = ?2
                 ORDER BY step_id",
                params![user, workflow],
            )
        })
    }

    fn add_favorite(&self, user: &UserId, workflow: &WorkflowId) -> BoxFuture<'_, Result<bool>> {
        let user = user.0.clone();
        let workflow = workflow.0.clone();
        Box::pin(async move {
            let mut conn = self
                .conn
                .lock()
                .map_err(|e| AuditflowError::Database(e.to_string()))?;
            let tx = conn
                .transaction()
                .map_err(|e| AuditflowError::Database(e.to_string()))?;

            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO favorites (user_id, workflow_id, created_at)
                     VALUES (?1, ?2, ?3)",
                    params![user, workflow, Utc::now().to_rfc3339()],
                )
                .map_err(|e| AuditflowError::Database(e.to_string()))?;
            if inserted > 0 {
                // Counter adjust stays inside the transaction so it cannot
                // drift from the favorites rows.
                tx.execute(
                    "UPDATE workflows SET favorites_count = favorites_count + 1 WHERE id = ?1",
                    params![workflow],
                )
                .map_err(|e| AuditflowError::Database(e.to_string()))?;
            }

            tx.commit()
                .map_err(|e| AuditflowError::Database(e.to_string()))?;
            Ok(inserted > 0)
        })
    }

    fn remove_favorite(
        &self,
        user: &UserId,
        workflow: &WorkflowId,
    ) -> BoxFuture<'_, Result<bool>> {
        let user = user.0.clone();
        let workflow = workflow.0.clone();
        Box::pin(async move {
            let mut conn = self
                .conn
                .lock()
                .map_err(|e| AuditflowError::Database(e.to_string()))?;
            let tx = conn
                .transaction()
                .map_err(|e| AuditflowError::Database(e.to_string()))?;

            let removed = tx
                .execute(
                    "DELETE FROM favorites WHERE user_id = ?1 AND workflow_id = ?2",
                    params![user, workflow],
                )
                .map_err(|e| AuditflowError::Database(e.to_string()))?;
            if removed > 0 {
                tx.execute(
                    "UPDATE workflows
                     SET favorites_count = MAX(favorites_count - 1, 0)
                     WHERE id = ?1",
                    params![workflow],
                )
                .map_err(|e| AuditflowError::Database(e.to_string()))?;
            }

            tx.commit()
                .map_err(|e| AuditflowError::Database(e.to_string()))?;
            Ok(removed > 0)
        })
    }

    fn list_favorites(&self, user: &UserId) -> BoxFuture<'_, Result<Vec<Workflow>>> {
        let user = user.0.clone();
        Box::pin(async move {
            let sql = format!(
                "SELECT {} FROM workflows w
                 JOIN favorites f ON f.workflow_id = w.id
                 WHERE f.user_id = ?1
                 ORDER BY f.created_at DESC",
                WORKFLOW_COLUMNS
                    .split(", ")
                    .map(|c| format!("w.{}", c))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            self.query_workflows(&sql, params![user])
        })
    }

    fn list_categories(&self) -> BoxFuture<'_, Result<Vec<Category>>> {
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| AuditflowError::Database(e.to_string()))?;
            let mut stmt = conn
                .prepare("SELECT slug, name FROM categories ORDER BY name")
                .map_err(|e| AuditflowError::Database(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(Category {
                        slug: row.get(0)?,
                        name: row.get(1)?,
                    })
                })
                .map_err(|e| AuditflowError::Database(e.to_string()))?;

            let mut categories = Vec::new();
            for row in rows {
                categories.push(row.map_err(|e| AuditflowError::Database(e.to_string()))?);
            }
            Ok(categories)
        })
    }
}

impl SqliteStore {
    fn query_step_results(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<StepResult>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| AuditflowError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| AuditflowError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(args, |row| {
                let completed: i64 = row.get(4)?;
                let completed_at: Option<String> = row.get(5)?;
                Ok((
                    StepResult {
                        user_id: UserId(row.get(0)?),
                        workflow_id: WorkflowId(row.get(1)?),
                        step_id: row.get(2)?,
                        result: row.get(3)?,
                        completed: completed != 0,
                        completed_at: None,
                    },
                    completed_at,
                ))
            })
            .map_err(|e| AuditflowError::Database(e.to_string()))?;

        let mut results = Vec::new();
        for row in rows {
            let (mut r, completed_at) =
                row.map_err(|e| AuditflowError::Database(e.to_string()))?;
            if let Some(raw) = completed_at {
                r.completed_at = Some(parse_timestamp(&raw)?);
            }
            results.push(r);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use auditflow_core::types::{Dependency, Step};

    fn user() -> UserId {
        UserId::from_str("auditor-1")
    }

    fn sample_workflow() -> Workflow {
        let mut wf = Workflow::new(user(), "soc2-q3", "SOC 2 Q3 Review");
        wf.steps.push(Step::new("scope", "Define scope"));
        wf.steps
            .push(Step::new("evidence", "Collect evidence").with_description("pull tickets"));
        wf.dependencies.push(Dependency::new("scope", "evidence"));
        wf.metadata = serde_json::json!({"framework": "soc2"});
        wf
    }

    #[tokio::test]
    async fn workflow_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        let wf = sample_workflow();
        store.create_workflow(&wf).await.unwrap();

        let loaded = store.get_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.slug, "soc2-q3");
        assert_eq!(loaded.steps.len(), 2);
        assert_eq!(loaded.dependencies.len(), 1);
        assert_eq!(loaded.metadata["framework"], "soc2");

        let by_slug = store.get_workflow_by_slug("soc2-q3").await.unwrap().unwrap();
        assert_eq!(by_slug.id, wf.id);
    }

    #[tokio::test]
    async fn update_is_scoped_to_owner() {
        let store = SqliteStore::in_memory().unwrap();
        let wf = sample_workflow();
        store.create_workflow(&wf).await.unwrap();

        let mut stolen = wf.clone();
        stolen.user_id = UserId::from_str("intruder");
        stolen.title = "Hijacked".into();
        assert!(matches!(
            store.update_workflow(&stolen).await,
            Err(AuditflowError::NotFound(_))
        ));

        let unchanged = store.get_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(unchanged.title, "SOC 2 Q3 Review");
    }

    #[tokio::test]
    async fn step_result_upsert_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        let wf = sample_workflow();
        store.create_workflow(&wf).await.unwrap();

        let draft = StepResult::draft(user(), wf.id.clone(), "scope", "draft text");
        store.upsert_step_result(&draft).await.unwrap();

        let loaded = store
            .get_step_result(&user(), &wf.id, "scope")
            .await
            .unwrap()
            .unwrap();
        assert!(!loaded.completed);
        assert!(loaded.completed_at.is_none());

        // Same key updates in place rather than duplicating.
        let approved = StepResult::completed(user(), wf.id.clone(), "scope", "final text");
        store.upsert_step_result(&approved).await.unwrap();

        let all = store.list_step_results(&user(), &wf.id).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].completed);
        assert_eq!(all[0].result, "final text");
        assert!(all[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn favorites_adjust_counter_atomically() {
        let store = SqliteStore::in_memory().unwrap();
        let wf = sample_workflow();
        store.create_workflow(&wf).await.unwrap();

        assert!(store.add_favorite(&user(), &wf.id).await.unwrap());
        // Re-adding the same favorite is a no-op.
        assert!(!store.add_favorite(&user(), &wf.id).await.unwrap());

        let other = UserId::from_str("auditor-2");
        assert!(store.add_favorite(&other, &wf.id).await.unwrap());

        let loaded = store.get_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.favorites_count, 2);

        assert!(store.remove_favorite(&user(), &wf.id).await.unwrap());
        assert!(!store.remove_favorite(&user(), &wf.id).await.unwrap());

        let loaded = store.get_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.favorites_count, 1);

        let favs = store.list_favorites(&other).await.unwrap();
        assert_eq!(favs.len(), 1);
        assert_eq!(favs[0].id, wf.id);
    }

    #[tokio::test]
    async fn delete_keeps_step_results() {
        let store = SqliteStore::in_memory().unwrap();
        let wf = sample_workflow();
        store.create_workflow(&wf).await.unwrap();
        store
            .upsert_step_result(&StepResult::completed(user(), wf.id.clone(), "scope", "ok"))
            .await
            .unwrap();

        assert!(store.delete_workflow(&user(), &wf.id).await.unwrap());
        assert!(store.get_workflow(&wf.id).await.unwrap().is_none());

        // Results outlive the workflow document.
        let results = store.list_step_results(&user(), &wf.id).await.unwrap();
        assert_eq!(results.len(), 1);

        // Deleting someone else's workflow does nothing.
        let wf2 = sample_workflow_with_slug("other");
        store.create_workflow(&wf2).await.unwrap();
        let intruder = UserId::from_str("intruder");
        assert!(!store.delete_workflow(&intruder, &wf2.id).await.unwrap());
    }

    fn sample_workflow_with_slug(slug: &str) -> Workflow {
        let mut wf = sample_workflow();
        wf.id = WorkflowId::new();
        wf.slug = slug.to_string();
        wf
    }

    #[tokio::test]
    async fn categories_listed_sorted() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .upsert_category(&Category {
                slug: "security".into(),
                name: "Security".into(),
            })
            .unwrap();
        store
            .upsert_category(&Category {
                slug: "finance".into(),
                name: "Finance".into(),
            })
            .unwrap();

        let cats = store.list_categories().await.unwrap();
        assert_eq!(cats.len(), 2);
        assert_eq!(cats[0].slug, "finance");
    }

    #[tokio::test]
    async fn on_disk_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.create_workflow(&sample_workflow()).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let listed = store.list_workflows(&user()).await.unwrap();
        assert_eq!(listed.len(), 1);
    }
}
