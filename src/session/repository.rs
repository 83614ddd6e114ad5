//! Session row persistence.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use super::models::{now_rfc3339, SessionRecord, SessionState};

const SELECT_COLUMNS: &str = "id, session_type, project_path, model, plan_mode, auto_accept, \
                              state, cols, rows, created_at, updated_at, ended_at, summary";

/// Repository for session rows.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new row.
    pub async fn insert(&self, record: &SessionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, session_type, project_path, model, plan_mode, auto_accept,
                state, cols, rows, created_at, updated_at, ended_at, summary
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(record.session_type.to_string())
        .bind(&record.project_path)
        .bind(&record.model)
        .bind(record.plan_mode)
        .bind(record.auto_accept)
        .bind(record.state.to_string())
        .bind(record.cols)
        .bind(record.rows)
        .bind(&record.created_at)
        .bind(&record.updated_at)
        .bind(&record.ended_at)
        .bind(&record.summary)
        .execute(&self.pool)
        .await
        .context("inserting session row")?;

        Ok(())
    }

    /// Fetch one row by id.
    pub async fn get(&self, id: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {SELECT_COLUMNS} FROM sessions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching session row")?;

        Ok(row)
    }

    /// All rows, newest first.
    pub async fn list(&self) -> Result<Vec<SessionRecord>> {
        let rows = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {SELECT_COLUMNS} FROM sessions ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("listing session rows")?;

        Ok(rows)
    }

    /// Rows that have not ended.
    pub async fn list_open(&self) -> Result<Vec<SessionRecord>> {
        let rows = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {SELECT_COLUMNS} FROM sessions WHERE ended_at IS NULL ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("listing open session rows")?;

        Ok(rows)
    }

    /// Persist a state change, bumping the activity timestamp.
    pub async fn update_state(&self, id: &str, state: SessionState) -> Result<()> {
        sqlx::query("UPDATE sessions SET state = ?, updated_at = ? WHERE id = ?")
            .bind(state.to_string())
            .bind(now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session state")?;

        Ok(())
    }

    /// Persist the declared viewport.
    pub async fn update_size(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        sqlx::query("UPDATE sessions SET cols = ?, rows = ?, updated_at = ? WHERE id = ?")
            .bind(cols as i64)
            .bind(rows as i64)
            .bind(now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session size")?;

        Ok(())
    }

    /// Persist a model change.
    pub async fn update_model(&self, id: &str, model: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE sessions SET model = ?, updated_at = ? WHERE id = ?")
            .bind(model)
            .bind(now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session model")?;

        Ok(())
    }

    /// Persist a mode toggle.
    pub async fn update_modes(&self, id: &str, plan_mode: bool, auto_accept: bool) -> Result<()> {
        sqlx::query("UPDATE sessions SET plan_mode = ?, auto_accept = ?, updated_at = ? WHERE id = ?")
            .bind(plan_mode)
            .bind(auto_accept)
            .bind(now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session modes")?;

        Ok(())
    }

    /// Persist the restart summary.
    pub async fn update_summary(&self, id: &str, summary: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET summary = ?, updated_at = ? WHERE id = ?")
            .bind(summary)
            .bind(now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session summary")?;

        Ok(())
    }

    /// Mark a session dead, stamping `ended_at`.
    pub async fn mark_ended(&self, id: &str) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query("UPDATE sessions SET state = ?, ended_at = ?, updated_at = ? WHERE id = ? AND ended_at IS NULL")
            .bind(SessionState::Dead.to_string())
            .bind(&now)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("marking session ended")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::session::models::{SessionKind, SessionRecord};

    async fn repo() -> SessionRepository {
        let db = Database::in_memory().await.unwrap();
        SessionRepository::new(db.pool().clone())
    }

    #[tokio::test]
    async fn insert_then_load_round_trips_config() {
        let repo = repo().await;
        let record = SessionRecord::new(
            "abc123def456".to_string(),
            SessionKind::Assistant,
            "/tmp/proj".to_string(),
            Some("opus".to_string()),
            true,
        );
        repo.insert(&record).await.unwrap();

        let loaded = repo.get("abc123def456").await.unwrap().unwrap();
        assert_eq!(loaded.id, record.id);
        assert_eq!(loaded.project_path, record.project_path);
        assert_eq!(loaded.model, record.model);
        assert_eq!(loaded.plan_mode, record.plan_mode);
        assert_eq!(loaded.auto_accept, record.auto_accept);
        assert_eq!(loaded.session_type, record.session_type);
        assert_eq!(loaded.state, SessionState::Starting);
    }

    #[tokio::test]
    async fn mark_ended_sets_terminal_state_once() {
        let repo = repo().await;
        let record = SessionRecord::new(
            "abc123def456".to_string(),
            SessionKind::Shell,
            "/tmp".to_string(),
            None,
            false,
        );
        repo.insert(&record).await.unwrap();

        repo.mark_ended("abc123def456").await.unwrap();
        let loaded = repo.get("abc123def456").await.unwrap().unwrap();
        assert_eq!(loaded.state, SessionState::Dead);
        assert!(loaded.ended_at.is_some());

        // ended_at does not move on a second call.
        let stamp = loaded.ended_at.clone();
        repo.mark_ended("abc123def456").await.unwrap();
        let again = repo.get("abc123def456").await.unwrap().unwrap();
        assert_eq!(again.ended_at, stamp);
    }

    #[tokio::test]
    async fn list_open_excludes_ended_rows() {
        let repo = repo().await;
        for (id, end) in [("aaaaaaaaaaaa", false), ("bbbbbbbbbbbb", true)] {
            let record = SessionRecord::new(
                id.to_string(),
                SessionKind::Shell,
                "/tmp".to_string(),
                None,
                false,
            );
            repo.insert(&record).await.unwrap();
            if end {
                repo.mark_ended(id).await.unwrap();
            }
        }

        let open = repo.list_open().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "aaaaaaaaaaaa");
        assert_eq!(repo.list().await.unwrap().len(), 2);
    }
}
