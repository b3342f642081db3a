//! Resume positions
//!
//! Last playback offset per (pseudonymous user, recording). Updated
//! opportunistically; a failed write is never fatal to playback.

use chrono::Utc;
use sqlx::Row;

use crate::errors::StoreError;

use super::Store;

impl Store {
    pub async fn upsert_resume_position(
        &self,
        user_hash: &str,
        recording_id: &str,
        position_ms: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO resume_positions (user_hash, recording_id, position_ms, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (user_hash, recording_id) DO UPDATE SET
                position_ms = excluded.position_ms,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_hash)
        .bind(recording_id)
        .bind(position_ms)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_resume_position(
        &self,
        user_hash: &str,
        recording_id: &str,
    ) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query(
            "SELECT position_ms FROM resume_positions WHERE user_hash = ? AND recording_id = ?",
        )
        .bind(user_hash)
        .bind(recording_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|row| row.get("position_ms")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resume_position_upserts() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .upsert_resume_position("u-hash", "rec-1", 42_000)
            .await
            .unwrap();
        store
            .upsert_resume_position("u-hash", "rec-1", 90_500)
            .await
            .unwrap();
        assert_eq!(
            store.get_resume_position("u-hash", "rec-1").await.unwrap(),
            Some(90_500)
        );
        assert_eq!(
            store.get_resume_position("u-hash", "rec-2").await.unwrap(),
            None
        );
    }
}
