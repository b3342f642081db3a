//! Session and exit-status persistence

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::errors::StoreError;
use crate::models::{ExitReason, ExitStatus, ProfileSpec, SessionRecord, SessionState};

use super::Store;

impl Store {
    /// Persist a freshly created session. Runs in a transaction so a crash
    /// never leaves a half-written record.
    pub async fn create_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let profile_json =
            serde_json::to_string(&record.profile).map_err(|e| StoreError::CorruptedSchema {
                detail: format!("profile serialization failed: {e}"),
            })?;

        let mut tx = self.pool().begin().await?;
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, service_ref, profile_name, profile_json, state,
                created_at, started_at, ended_at, exit_reason, exit_code,
                last_error, owner_context_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.service_ref)
        .bind(&record.profile.name)
        .bind(&profile_json)
        .bind(record.state.as_str())
        .bind(record.created_at)
        .bind(record.started_at)
        .bind(record.ended_at)
        .bind(record.exit_reason.map(|r| r.as_str()))
        .bind(record.exit_code)
        .bind(&record.last_error)
        .bind(&record.owner_context_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Update the live state column as the FSM progresses
    pub async fn update_session_state(
        &self,
        id: &str,
        state: SessionState,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET state = ?, started_at = COALESCE(?, started_at) WHERE id = ?")
            .bind(state.as_str())
            .bind(started_at)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Record the terminal exit: session row and exit row in one transaction
    pub async fn record_exit(
        &self,
        id: &str,
        exit: &ExitStatus,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool().begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE sessions
            SET state = ?, ended_at = ?, exit_reason = ?, exit_code = ?, last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(SessionState::Stopped.as_str())
        .bind(exit.ended_at)
        .bind(exit.reason.as_str())
        .bind(exit.code)
        .bind(last_error)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                table: "sessions",
                key: id.to_string(),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO session_exits (session_id, exit_code, reason, started_at, ended_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (session_id) DO UPDATE SET
                exit_code = excluded.exit_code,
                reason = excluded.reason,
                started_at = excluded.started_at,
                ended_at = excluded.ended_at
            "#,
        )
        .bind(id)
        .bind(exit.code)
        .bind(exit.reason.as_str())
        .bind(exit.started_at)
        .bind(exit.ended_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.map(session_from_row).transpose()
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sessions ORDER BY created_at DESC")
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(session_from_row).collect()
    }

    pub async fn get_exit(&self, id: &str) -> Result<Option<ExitStatus>, StoreError> {
        let row = sqlx::query(
            "SELECT exit_code, reason, started_at, ended_at FROM session_exits WHERE session_id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.map(|row| {
            let reason: String = row.get("reason");
            Ok(ExitStatus {
                code: row.get("exit_code"),
                reason: ExitReason::parse(&reason).ok_or_else(|| StoreError::CorruptedSchema {
                    detail: format!("unknown exit reason {reason:?}"),
                })?,
                started_at: row.get("started_at"),
                ended_at: row.get("ended_at"),
            })
        })
        .transpose()
    }

    /// Remove session rows older than the retention horizon
    pub async fn prune_sessions_before(
        &self,
        horizon: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM sessions WHERE state = 'stopped' AND ended_at < ?")
                .bind(horizon)
                .execute(self.pool())
                .await?;
        Ok(result.rows_affected())
    }
}

fn session_from_row(row: SqliteRow) -> Result<SessionRecord, StoreError> {
    let profile_json: String = row.get("profile_json");
    let profile: ProfileSpec =
        serde_json::from_str(&profile_json).map_err(|e| StoreError::CorruptedSchema {
            detail: format!("profile deserialization failed: {e}"),
        })?;
    let state: String = row.get("state");
    let exit_reason: Option<String> = row.get("exit_reason");

    Ok(SessionRecord {
        id: row.get("id"),
        service_ref: row.get("service_ref"),
        profile,
        state: SessionState::parse(&state).ok_or_else(|| StoreError::CorruptedSchema {
            detail: format!("unknown session state {state:?}"),
        })?,
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
        exit_reason: exit_reason
            .as_deref()
            .map(|r| {
                ExitReason::parse(r).ok_or_else(|| StoreError::CorruptedSchema {
                    detail: format!("unknown exit reason {r:?}"),
                })
            })
            .transpose()?,
        exit_code: row.get("exit_code"),
        last_error: row.get("last_error"),
        owner_context_id: row.get("owner_context_id"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            service_ref: "1:0:19:EF75:3F9:1:C00000:0:0:0".to_string(),
            profile: ProfileSpec::builtin_live(),
            state: SessionState::New,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            exit_reason: None,
            exit_code: None,
            last_error: None,
            owner_context_id: "ctx-test".to_string(),
        }
    }

    #[tokio::test]
    async fn session_record_round_trips() {
        let store = Store::open_in_memory().await.unwrap();
        let original = record("sess-roundtrip");
        store.create_session(&original).await.unwrap();

        let loaded = store.get_session("sess-roundtrip").await.unwrap().unwrap();
        assert_eq!(loaded, original);
    }

    #[tokio::test]
    async fn exit_round_trips_with_all_fields() {
        let store = Store::open_in_memory().await.unwrap();
        store.create_session(&record("sess-exit")).await.unwrap();

        let exit = ExitStatus {
            code: 1,
            reason: ExitReason::Error,
            started_at: Some(Utc::now()),
            ended_at: Utc::now(),
        };
        store
            .record_exit("sess-exit", &exit, Some("pipe:0: corrupt input"))
            .await
            .unwrap();

        let loaded = store.get_session("sess-exit").await.unwrap().unwrap();
        assert_eq!(loaded.state, SessionState::Stopped);
        assert_eq!(loaded.exit_reason, Some(ExitReason::Error));
        assert_eq!(loaded.exit_code, Some(1));
        assert_eq!(loaded.last_error.as_deref(), Some("pipe:0: corrupt input"));

        let stored_exit = store.get_exit("sess-exit").await.unwrap().unwrap();
        assert_eq!(stored_exit, exit);
    }

    #[tokio::test]
    async fn recording_exit_for_unknown_session_fails() {
        let store = Store::open_in_memory().await.unwrap();
        let exit = ExitStatus {
            code: 0,
            reason: ExitReason::Clean,
            started_at: None,
            ended_at: Utc::now(),
        };
        let err = store.record_exit("missing", &exit, None).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn pruning_removes_only_old_stopped_sessions() {
        let store = Store::open_in_memory().await.unwrap();
        store.create_session(&record("sess-live")).await.unwrap();
        store.create_session(&record("sess-old")).await.unwrap();
        let exit = ExitStatus {
            code: 0,
            reason: ExitReason::Clean,
            started_at: None,
            ended_at: Utc::now() - chrono::Duration::hours(2),
        };
        store.record_exit("sess-old", &exit, None).await.unwrap();

        let pruned = store
            .prune_sessions_before(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(store.get_session("sess-old").await.unwrap().is_none());
        assert!(store.get_session("sess-live").await.unwrap().is_some());
    }
}
