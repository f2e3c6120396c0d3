use serde_json::{Map, Value};
use uuid::Uuid;

use super::{Scope, SqlAdapter};
use crate::error::{Result, StoreError};
use crate::filter::SortOrder;
use crate::model::{validate_collection_name, Record};

/// Key generation attempts when `ensure_unique` is set.
const MAX_KEY_ATTEMPTS: usize = 8;

impl SqlAdapter {
    /// A queue is a collection without secondary indexes.
    pub async fn create_queue(&self, name: &str) -> Result<()> {
        self.create_collection::<&str>(name, &[]).await
    }

    /// Append `item` under a generated key and return the key.
    ///
    /// With `ensure_unique`, a key collision is retried with a fresh key.
    /// Identical items always produce distinct entries.
    pub async fn add_in_queue(
        &self,
        name: &str,
        item: Map<String, Value>,
        ensure_unique: bool,
    ) -> Result<String> {
        let attempts = if ensure_unique { MAX_KEY_ATTEMPTS } else { 1 };
        let mut attempt = 1;
        loop {
            let key = Uuid::new_v4().to_string();
            match self.insert_record(name, &key, item.clone()).await {
                Ok(_) => return Ok(key),
                Err(StoreError::DuplicateKey { .. }) if attempt < attempts => {
                    tracing::warn!(queue = name, key = %key, attempt, "queue key collision");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn queue_size(&self, name: &str) -> Result<u64> {
        self.ensure_ready()?;
        validate_collection_name(name)?;
        let rows = self
            .query(&self.strategy.count_records(name), Scope::collection(name))
            .await?;
        let total = rows
            .first()
            .and_then(|row| row.get("total"))
            .and_then(|v| v.as_i64())
            .ok_or_else(|| StoreError::Codec(format!("no row count for queue {:?}", name)))?;
        Ok(u64::try_from(total).unwrap_or_default())
    }

    /// Queue entries in creation order, or newest first with `SortOrder::Desc`.
    pub async fn list_queue(
        &self,
        name: &str,
        order: SortOrder,
        limit: Option<u64>,
    ) -> Result<Vec<Record>> {
        self.filter::<&str>(name, &[], order, limit).await
    }

    pub async fn get_object_from_queue(&self, name: &str, key: &str) -> Result<Option<Record>> {
        self.get_record(name, key).await
    }

    pub async fn delete_object_from_queue(&self, name: &str, key: &str) -> Result<bool> {
        self.delete_record(name, key).await
    }
}
