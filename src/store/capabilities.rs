//! Capability profile cache
//!
//! Caches client capability documents by device fingerprint so repeat
//! decisions skip re-parsing. The cache is advisory; the store row is never
//! promoted over a capability document sent with the request.

use chrono::Utc;
use sqlx::Row;

use crate::errors::StoreError;
use crate::models::CapabilityProfile;

use super::Store;

impl Store {
    pub async fn cache_capabilities(
        &self,
        fingerprint: &str,
        capabilities: &CapabilityProfile,
    ) -> Result<(), StoreError> {
        let json =
            serde_json::to_string(capabilities).map_err(|e| StoreError::CorruptedSchema {
                detail: format!("capability serialization failed: {e}"),
            })?;
        sqlx::query(
            r#"
            INSERT INTO capabilities_cache (fingerprint, capabilities_json, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (fingerprint) DO UPDATE SET
                capabilities_json = excluded.capabilities_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(fingerprint)
        .bind(&json)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_cached_capabilities(
        &self,
        fingerprint: &str,
    ) -> Result<Option<CapabilityProfile>, StoreError> {
        let row =
            sqlx::query("SELECT capabilities_json FROM capabilities_cache WHERE fingerprint = ?")
                .bind(fingerprint)
                .fetch_optional(self.pool())
                .await?;
        row.map(|row| {
            let json: String = row.get("capabilities_json");
            serde_json::from_str(&json).map_err(|e| StoreError::CorruptedSchema {
                detail: format!("capability deserialization failed: {e}"),
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn capability_cache_round_trips() {
        let store = Store::open_in_memory().await.unwrap();
        let caps = CapabilityProfile {
            containers: vec!["mp4".to_string(), "mpegts".to_string()],
            video_codecs: vec!["h264".to_string()],
            audio_codecs: vec!["aac".to_string()],
            supports_hls: true,
            supports_range: Some(true),
            max_video_width: Some(1920),
            device_type: Some("browser".to_string()),
        };
        store.cache_capabilities("fp-1", &caps).await.unwrap();
        let loaded = store.get_cached_capabilities("fp-1").await.unwrap().unwrap();
        assert_eq!(loaded.containers, caps.containers);
        assert_eq!(loaded.supports_range, Some(true));
        assert!(store.get_cached_capabilities("fp-2").await.unwrap().is_none());
    }
}
