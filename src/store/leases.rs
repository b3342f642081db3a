//! Idempotency leases
//!
//! Short-lived records mapping a client correlation key to a session id,
//! protecting against duplicate start intents within the TTL.

use chrono::{DateTime, Utc};
use sqlx::Row;
use std::time::Duration;

use crate::errors::StoreError;

use super::Store;

impl Store {
    /// Returns the session id held by a still-valid lease, if any
    pub async fn get_lease(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT session_id, expires_at FROM leases WHERE idempotency_key = ?")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.and_then(|row| {
            let expires_at: DateTime<Utc> = row.get("expires_at");
            if expires_at > Utc::now() {
                Some(row.get("session_id"))
            } else {
                None
            }
        }))
    }

    /// Create or refresh the lease for a key
    pub async fn put_lease(
        &self,
        key: &str,
        session_id: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30));
        sqlx::query(
            r#"
            INSERT INTO leases (idempotency_key, session_id, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT (idempotency_key) DO UPDATE SET
                session_id = excluded.session_id,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(session_id)
        .bind(expires_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn purge_expired_leases(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM leases WHERE expires_at <= ?")
            .bind(Utc::now())
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
