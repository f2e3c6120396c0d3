use super::{Scope, SqlAdapter};
use crate::error::{Result, StoreError};
use crate::model::{validate_key, KvEntry, KvType, KvValue};

impl SqlAdapter {
    /// Store `value` under `key`, replacing any previous entry.
    ///
    /// The tag follows the value's shape: strings are `string`, bytes are
    /// `buffer` (kept as their lossy UTF-8 text), anything else is `object`
    /// (kept as JSON text).
    pub async fn write_key(&self, key: &str, value: impl Into<KvValue>) -> Result<()> {
        self.ensure_ready()?;
        validate_key(key)?;
        let value = value.into();
        let kind = value.kind();
        let stored = value.into_stored();
        tracing::debug!(key, kind = %kind, "write key");
        self.execute(&self.strategy.upsert_kv(key, kind, &stored), Scope::default())
            .await?;
        Ok(())
    }

    /// The entry under `key`. Object values come back as their JSON text.
    pub async fn read_key(&self, key: &str) -> Result<Option<KvEntry>> {
        self.ensure_ready()?;
        validate_key(key)?;
        let rows = self
            .query(&self.strategy.select_kv(key), Scope::default())
            .await?;
        let Some(mut row) = rows.into_iter().next() else {
            return Ok(None);
        };
        let kind: KvType = row
            .take("kv_type")
            .and_then(|v| v.into_text())
            .ok_or_else(|| StoreError::Codec(format!("key {:?} has no type tag", key)))?
            .trim()
            .parse()?;
        let value = row
            .take("kv_value")
            .and_then(|v| v.into_text())
            .unwrap_or_default();
        Ok(Some(KvEntry { kind, value }))
    }

    /// Returns whether the key existed.
    pub async fn delete_key(&self, key: &str) -> Result<bool> {
        self.ensure_ready()?;
        validate_key(key)?;
        let affected = self
            .execute(&self.strategy.delete_kv(key), Scope::default())
            .await?;
        Ok(affected > 0)
    }
}
