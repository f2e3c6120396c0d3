//! The document-store engine.
//!
//! `SqlAdapter` owns one connection and the strategy matching its dialect.
//! Operations issued before [`SqlAdapter::initialize`] completes fail with
//! [`StoreError::NotReady`]; after [`SqlAdapter::close`] they fail with
//! [`StoreError::Closed`].

mod kv;
mod queue;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::db::{Connection, SqlRow, Statement};
use crate::dialect::{strategy_for, Dialect, DialectStrategy, ErrorClass};
use crate::error::{DriverError, Result, StoreError};
use crate::filter::{parse_condition, resolve_conditions, SortOrder};
use crate::model::{
    validate_collection_name, validate_index_field, validate_key, Record, SaveReport, DATA_COLUMN,
    ID_COLUMN, TIMESTAMP_COLUMN,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Pending,
    Ready,
    Closed,
}

/// What a failed statement was operating on, for error reporting.
#[derive(Debug, Clone, Copy, Default)]
struct Scope<'a> {
    collection: Option<&'a str>,
    key: Option<&'a str>,
}

impl<'a> Scope<'a> {
    fn collection(name: &'a str) -> Self {
        Self {
            collection: Some(name),
            key: None,
        }
    }

    fn record(collection: &'a str, key: &'a str) -> Self {
        Self {
            collection: Some(collection),
            key: Some(key),
        }
    }
}

/// Strictly increasing microsecond clock for `__timestamp`.
#[derive(Debug, Default)]
struct Clock {
    last: AtomicI64,
}

impl Clock {
    fn next(&self) -> i64 {
        let now = Utc::now().timestamp_micros();
        let prev = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(prev + 1)
    }
}

pub struct SqlAdapter {
    strategy: Box<dyn DialectStrategy>,
    conn: Mutex<Option<Box<dyn Connection>>>,
    state: RwLock<Readiness>,
    /// Collection name -> indexed fields.
    schema: RwLock<HashMap<String, Vec<String>>>,
    clock: Clock,
}

impl SqlAdapter {
    /// Wrap an open connection. The strategy is chosen from the
    /// connection's dialect; call [`initialize`](Self::initialize) next.
    pub fn new(conn: Box<dyn Connection>) -> Self {
        let strategy = strategy_for(conn.dialect());
        Self {
            strategy,
            conn: Mutex::new(Some(conn)),
            state: RwLock::new(Readiness::Pending),
            schema: RwLock::new(HashMap::new()),
            clock: Clock::default(),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.strategy.dialect()
    }

    pub fn is_ready(&self) -> bool {
        *self.state.read() == Readiness::Ready
    }

    /// Create the internal tables and load the schema cache.
    ///
    /// Safe to call again once ready.
    pub async fn initialize(&self) -> Result<()> {
        match *self.state.read() {
            Readiness::Ready => return Ok(()),
            Readiness::Closed => return Err(StoreError::Closed),
            Readiness::Pending => {}
        }
        for stmt in self.strategy.bootstrap() {
            self.execute_ddl(&stmt, Scope::default()).await?;
        }
        self.reload_schema().await?;

        let mut state = self.state.write();
        if *state == Readiness::Closed {
            return Err(StoreError::Closed);
        }
        *state = Readiness::Ready;
        tracing::info!(dialect = %self.dialect(), "adapter initialized");
        Ok(())
    }

    /// Release the connection. Every later call fails with `Closed`.
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard.take().ok_or(StoreError::Closed)?;
        *self.state.write() = Readiness::Closed;
        self.schema.write().clear();
        drop(conn);
        tracing::info!(dialect = %self.dialect(), "adapter closed");
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        match *self.state.read() {
            Readiness::Ready => Ok(()),
            Readiness::Pending => Err(StoreError::NotReady),
            Readiness::Closed => Err(StoreError::Closed),
        }
    }

    // ---- collections ----

    /// Create a collection with secondary indexes on `index_fields`.
    ///
    /// An existing collection is left intact; any fields it is not yet
    /// indexed on are added.
    pub async fn create_collection<S: AsRef<str>>(
        &self,
        name: &str,
        index_fields: &[S],
    ) -> Result<()> {
        self.ensure_ready()?;
        validate_collection_name(name)?;
        let mut requested: Vec<&str> = Vec::with_capacity(index_fields.len());
        for field in index_fields {
            let field = field.as_ref();
            validate_index_field(field)?;
            if !requested.contains(&field) {
                requested.push(field);
            }
        }

        tracing::debug!(collection = name, fields = ?requested, "create collection");
        for stmt in self.strategy.create_collection(name) {
            self.execute_ddl(&stmt, Scope::collection(name)).await?;
        }

        let mut indices = self.indices_or_refresh(name).await?.unwrap_or_default();
        for field in requested {
            if indices.iter().any(|f| f == field) {
                continue;
            }
            for stmt in self.strategy.create_index(name, field) {
                self.execute_ddl(&stmt, Scope::collection(name)).await?;
            }
            indices.push(field.to_string());
        }

        self.execute(&self.strategy.upsert_metadata(name, &indices), Scope::collection(name))
            .await?;
        self.schema.write().insert(name.to_string(), indices);
        Ok(())
    }

    /// Drop a collection. Missing collections are not an error.
    pub async fn remove_collection(&self, name: &str) -> Result<()> {
        self.ensure_ready()?;
        validate_collection_name(name)?;
        tracing::debug!(collection = name, "remove collection");
        for stmt in self.strategy.drop_collection(name) {
            match self.try_execute(&stmt).await? {
                Ok(_) => {}
                Err(err) if self.strategy.classify_error(&err) == ErrorClass::UndefinedTable => {}
                Err(err) => return Err(self.normalize(err, Scope::collection(name))),
            }
        }
        self.execute(&self.strategy.delete_metadata(name), Scope::collection(name))
            .await?;
        self.schema.write().remove(name);
        Ok(())
    }

    /// Live collection names, sorted.
    pub async fn get_collections(&self) -> Result<Vec<String>> {
        self.ensure_ready()?;
        self.list_tables().await
    }

    /// Add a secondary index on `field`. Existing indexes are left alone.
    pub async fn add_index(&self, collection: &str, field: &str) -> Result<()> {
        self.ensure_ready()?;
        validate_collection_name(collection)?;
        validate_index_field(field)?;
        let mut indices = self.require_collection(collection).await?;

        for stmt in self.strategy.create_index(collection, field) {
            self.execute_ddl(&stmt, Scope::collection(collection)).await?;
        }
        if !indices.iter().any(|f| f == field) {
            indices.push(field.to_string());
            self.execute(
                &self.strategy.upsert_metadata(collection, &indices),
                Scope::collection(collection),
            )
            .await?;
            self.schema.write().insert(collection.to_string(), indices);
        }
        Ok(())
    }

    /// Indexed fields of `collection` as currently cached.
    pub fn collection_indices(&self, collection: &str) -> Option<Vec<String>> {
        self.schema.read().get(collection).cloned()
    }

    // ---- records ----

    /// Insert a new record. An existing `id` fails with `DuplicateKey`.
    pub async fn insert_record(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<Record> {
        self.ensure_ready()?;
        validate_collection_name(collection)?;
        validate_key(id)?;
        let payload = self.strategy.encode_payload(&fields);
        let timestamp = self.clock.next();
        let stmt = self.strategy.insert_record(collection, id, payload, timestamp);
        self.execute(&stmt, Scope::record(collection, id)).await?;
        Ok(Record {
            id: id.to_string(),
            fields,
            timestamp,
        })
    }

    /// Replace the fields of `id`; its timestamp is kept.
    ///
    /// A missing `id` is not reported: MySQL counts only changed rows, so
    /// the affected-row count cannot tell "absent" from "unchanged".
    pub async fn update_record(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<()> {
        self.ensure_ready()?;
        validate_collection_name(collection)?;
        validate_key(id)?;
        let payload = self.strategy.encode_payload(&fields);
        let stmt = self.strategy.update_record(collection, id, payload);
        self.execute(&stmt, Scope::record(collection, id)).await?;
        Ok(())
    }

    /// Returns whether a row was removed.
    pub async fn delete_record(&self, collection: &str, id: &str) -> Result<bool> {
        self.ensure_ready()?;
        validate_collection_name(collection)?;
        validate_key(id)?;
        let stmt = self.strategy.delete_record(collection, id);
        let affected = self.execute(&stmt, Scope::record(collection, id)).await?;
        Ok(affected > 0)
    }

    pub async fn get_record(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        self.ensure_ready()?;
        validate_collection_name(collection)?;
        validate_key(id)?;
        let stmt = self.strategy.select_record(collection, id);
        let rows = self.query(&stmt, Scope::record(collection, id)).await?;
        rows.into_iter().next().map(|row| self.decode_record(row)).transpose()
    }

    /// The earliest record, if any.
    pub async fn get_one_record(&self, collection: &str) -> Result<Option<Record>> {
        self.ensure_ready()?;
        validate_collection_name(collection)?;
        let stmt = self.strategy.select_one(collection);
        let rows = self.query(&stmt, Scope::collection(collection)).await?;
        rows.into_iter().next().map(|row| self.decode_record(row)).transpose()
    }

    /// Every record, oldest first.
    pub async fn get_all_records(&self, collection: &str) -> Result<Vec<Record>> {
        self.ensure_ready()?;
        validate_collection_name(collection)?;
        let stmt = self.strategy.select_all(collection);
        let rows = self.query(&stmt, Scope::collection(collection)).await?;
        self.decode_records(rows)
    }

    /// Records matching every condition, ordered by creation time.
    ///
    /// Conditions take the form `<field> <op> <value>`. A field must be
    /// `id`, `__timestamp` or one of the collection's indexed fields.
    pub async fn filter<S: AsRef<str>>(
        &self,
        collection: &str,
        conditions: &[S],
        order: SortOrder,
        limit: Option<u64>,
    ) -> Result<Vec<Record>> {
        self.ensure_ready()?;
        validate_collection_name(collection)?;
        if limit == Some(0) {
            return Err(StoreError::Syntax("limit must be a positive integer".into()));
        }
        // Malformed text is reported before anything touches the backend.
        for condition in conditions {
            parse_condition(condition.as_ref())?;
        }
        let indices = self.require_collection(collection).await?;
        let predicates = resolve_conditions(conditions, &indices)?;

        let stmt = self
            .strategy
            .select_filtered(collection, &predicates, order, limit);
        tracing::debug!(collection, sql = %stmt.sql, "filter");
        let rows = self.query(&stmt, Scope::collection(collection)).await?;
        self.decode_records(rows)
    }

    // ---- lifecycle ----

    /// Reload cached schema information from the backend.
    pub async fn refresh(&self) -> Result<()> {
        self.ensure_ready()?;
        self.reload_schema().await
    }

    /// Ask the backend to flush to durable storage, where that applies.
    pub async fn save_database(&self) -> Result<SaveReport> {
        self.ensure_ready()?;
        let checkpointed = match self.strategy.checkpoint() {
            Some(stmt) => {
                self.execute(&stmt, Scope::default()).await?;
                true
            }
            None => false,
        };
        tracing::info!(dialect = %self.dialect(), checkpointed, "save database");
        Ok(SaveReport {
            dialect: self.dialect(),
            checkpointed,
        })
    }

    // ---- internals ----

    async fn list_tables(&self) -> Result<Vec<String>> {
        let rows = self
            .query(&self.strategy.list_collections(), Scope::default())
            .await?;
        let mut names: Vec<String> = rows
            .into_iter()
            .filter_map(|mut row| row.take("name").and_then(|v| v.into_text()))
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn reload_schema(&self) -> Result<()> {
        let tables = self.list_tables().await?;
        let rows = self
            .query(&self.strategy.select_metadata(), Scope::default())
            .await?;

        let mut metadata: HashMap<String, Vec<String>> = HashMap::new();
        for mut row in rows {
            let Some(name) = row.take("name").and_then(|v| v.into_text()) else {
                continue;
            };
            let raw = row.take("indices").and_then(|v| v.into_text());
            let indices = match raw.as_deref().map(serde_json::from_str::<Vec<String>>) {
                Some(Ok(indices)) => indices,
                Some(Err(e)) => {
                    tracing::warn!(collection = %name, error = %e, "unreadable index metadata");
                    Vec::new()
                }
                None => Vec::new(),
            };
            metadata.insert(name, indices);
        }

        let schema: HashMap<String, Vec<String>> = tables
            .into_iter()
            .map(|name| {
                let indices = metadata.remove(&name).unwrap_or_default();
                (name, indices)
            })
            .collect();
        tracing::debug!(collections = schema.len(), "schema refreshed");
        *self.schema.write() = schema;
        Ok(())
    }

    /// Cached indices of `collection`, refreshing once on a miss.
    async fn indices_or_refresh(&self, collection: &str) -> Result<Option<Vec<String>>> {
        if let Some(indices) = self.collection_indices(collection) {
            return Ok(Some(indices));
        }
        self.reload_schema().await?;
        Ok(self.collection_indices(collection))
    }

    async fn require_collection(&self, collection: &str) -> Result<Vec<String>> {
        self.indices_or_refresh(collection)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("collection {:?} does not exist", collection)))
    }

    fn decode_records(&self, rows: Vec<SqlRow>) -> Result<Vec<Record>> {
        rows.into_iter().map(|row| self.decode_record(row)).collect()
    }

    fn decode_record(&self, mut row: SqlRow) -> Result<Record> {
        let id = row
            .take(ID_COLUMN)
            .and_then(|v| v.into_text())
            .ok_or_else(|| StoreError::Codec("row has no id".into()))?;
        let data = row
            .take(DATA_COLUMN)
            .ok_or_else(|| StoreError::Codec(format!("row {:?} has no payload", id)))?;
        let fields = self.strategy.decode_payload(data)?;
        let timestamp = row
            .get(TIMESTAMP_COLUMN)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| StoreError::Codec(format!("row {:?} has no timestamp", id)))?;
        Ok(Record {
            id,
            fields,
            timestamp,
        })
    }

    /// Run a statement, keeping the driver error for the caller to classify.
    /// The outer error is only `Closed`.
    async fn try_execute(&self, stmt: &Statement) -> Result<std::result::Result<u64, DriverError>> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        Ok(conn.execute(stmt).await)
    }

    async fn try_query(
        &self,
        stmt: &Statement,
    ) -> Result<std::result::Result<Vec<SqlRow>, DriverError>> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        Ok(conn.query(stmt).await)
    }

    async fn execute(&self, stmt: &Statement, scope: Scope<'_>) -> Result<u64> {
        self.try_execute(stmt)
            .await?
            .map_err(|err| self.normalize(err, scope))
    }

    async fn query(&self, stmt: &Statement, scope: Scope<'_>) -> Result<Vec<SqlRow>> {
        self.try_query(stmt)
            .await?
            .map_err(|err| self.normalize(err, scope))
    }

    /// Schema change that may already have been applied.
    async fn execute_ddl(&self, stmt: &Statement, scope: Scope<'_>) -> Result<()> {
        match self.try_execute(stmt).await? {
            Ok(_) => Ok(()),
            Err(err) if self.strategy.classify_error(&err) == ErrorClass::AlreadyExists => {
                tracing::debug!(error = %err, "schema object already exists");
                Ok(())
            }
            Err(err) => Err(self.normalize(err, scope)),
        }
    }

    fn normalize(&self, err: DriverError, scope: Scope<'_>) -> StoreError {
        match self.strategy.classify_error(&err) {
            ErrorClass::DuplicateKey => StoreError::DuplicateKey {
                collection: scope.collection.unwrap_or_default().to_string(),
                key: scope.key.unwrap_or_default().to_string(),
            },
            ErrorClass::UndefinedTable => match scope.collection {
                Some(name) => {
                    self.schema.write().remove(name);
                    StoreError::NotFound(format!("collection {:?} does not exist", name))
                }
                None => StoreError::NotFound(err.message),
            },
            ErrorClass::Syntax => StoreError::Syntax(err.message),
            ErrorClass::Connection => StoreError::Connection(err.message),
            ErrorClass::AlreadyExists | ErrorClass::Other => {
                tracing::warn!(dialect = %self.dialect(), error = %err, "backend error");
                StoreError::Backend {
                    dialect: self.dialect(),
                    code: err.code,
                    message: err.message,
                }
            }
        }
    }
}

impl std::fmt::Debug for SqlAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlAdapter")
            .field("dialect", &self.dialect())
            .field("state", &*self.state.read())
            .finish()
    }
}
