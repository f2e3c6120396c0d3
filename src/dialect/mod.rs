//! Per-backend SQL translation.
//!
//! Every backend difference the adapter has to hide lives behind
//! [`DialectStrategy`]: identifier quoting, placeholders, payload column type
//! and codec, pagination, upsert syntax, catalog queries and the mapping of
//! native error codes onto [`ErrorClass`]. Strategies are stateless and
//! connection-agnostic; the adapter picks one at construction and never
//! branches on the backend again.
//!
//! ```text
//! SqlAdapter ── builds ──▶ Statement ──▶ Connection (driver)
//!      ▲                                      │
//!      └──── classify_error / decode_payload ◀┘
//! ```
mod mssql;
mod mysql;
mod postgres;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::db::{SqlParam, SqlValue, Statement};
use crate::error::{DriverError, Result, StoreError};
use crate::filter::{FilterTarget, Literal, Predicate, SortOrder};
use crate::model::{
    KvType, DATA_COLUMN, ID_COLUMN, KV_TABLE, METADATA_TABLE, TIMESTAMP_COLUMN,
};

pub use mssql::MssqlStrategy;
pub use mysql::MySqlStrategy;
pub use postgres::PostgresStrategy;

/// Maximum index name length accepted by all three backends (MySQL: 64).
const MAX_INDEX_NAME_LEN: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Postgres,
    #[serde(rename = "mysql")]
    MySql,
    Mssql,
}

impl Dialect {
    pub const ALL: [Dialect; 3] = [Dialect::Postgres, Dialect::MySql, Dialect::Mssql];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::MySql => "mysql",
            Dialect::Mssql => "mssql",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Dialect::Postgres => 5432,
            Dialect::MySql => 3306,
            Dialect::Mssql => 1433,
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Dialect::Postgres),
            "mysql" | "mariadb" => Ok(Dialect::MySql),
            "mssql" | "sqlserver" | "sql_server" | "sql-server" => Ok(Dialect::Mssql),
            _ => Err(StoreError::UnknownDialect(s.to_string())),
        }
    }
}

/// Backend-independent meaning of a native error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Unique or primary-key constraint violation.
    DuplicateKey,
    /// The referenced table does not exist.
    UndefinedTable,
    /// The object being created (table, index, column) already exists.
    AlreadyExists,
    /// The server rejected the statement text.
    Syntax,
    /// Transport or session failure.
    Connection,
    Other,
}

/// Construct the strategy for a dialect identifier such as `"postgres"`.
pub fn create_strategy(name: &str) -> Result<Box<dyn DialectStrategy>> {
    let dialect: Dialect = name.parse()?;
    Ok(strategy_for(dialect))
}

pub fn strategy_for(dialect: Dialect) -> Box<dyn DialectStrategy> {
    match dialect {
        Dialect::Postgres => Box::new(PostgresStrategy),
        Dialect::MySql => Box::new(MySqlStrategy),
        Dialect::Mssql => Box::new(MssqlStrategy),
    }
}

/// Pure SQL translation for one backend.
///
/// Statements that read the same on every backend apart from quoting and
/// placeholders have default implementations; dialects override the rest.
pub trait DialectStrategy: Send + Sync + fmt::Debug {
    fn dialect(&self) -> Dialect;

    /// Quote an identifier. Callers validate names first; quoting is the
    /// second line, not the only one.
    fn quote_ident(&self, ident: &str) -> String;

    /// Placeholder for the 1-based parameter `index`.
    fn placeholder(&self, index: usize) -> String;

    /// Placeholder used inside filter predicates, where the backend cannot
    /// infer the parameter type from a column.
    fn typed_placeholder(&self, index: usize, _param: &SqlParam) -> String {
        self.placeholder(index)
    }

    /// Statements creating the adapter's internal tables.
    fn bootstrap(&self) -> Vec<Statement>;

    /// Statements creating a collection table if it does not exist.
    fn create_collection(&self, name: &str) -> Vec<Statement>;

    /// Statements creating a secondary index over a payload field.
    fn create_index(&self, collection: &str, field: &str) -> Vec<Statement>;

    fn drop_collection(&self, name: &str) -> Vec<Statement> {
        vec![Statement::new(format!(
            "DROP TABLE IF EXISTS {}",
            self.quote_ident(name)
        ))]
    }

    /// Names of user tables, excluding the adapter's internal ones,
    /// returned in a column called `name`.
    fn list_collections(&self) -> Statement;

    fn select_metadata(&self) -> Statement {
        Statement::new(format!(
            "SELECT {name}, {indices} FROM {table}",
            name = self.quote_ident("name"),
            indices = self.quote_ident("indices"),
            table = self.quote_ident(METADATA_TABLE),
        ))
    }

    fn upsert_metadata(&self, name: &str, indices: &[String]) -> Statement {
        let encoded = Value::from(indices.to_vec()).to_string();
        self.upsert(
            METADATA_TABLE,
            "name",
            &["indices"],
            vec![SqlParam::text(name), SqlParam::Text(encoded)],
        )
    }

    fn delete_metadata(&self, name: &str) -> Statement {
        Statement::with_params(
            format!(
                "DELETE FROM {} WHERE {} = {}",
                self.quote_ident(METADATA_TABLE),
                self.quote_ident("name"),
                self.placeholder(1)
            ),
            vec![SqlParam::text(name)],
        )
    }

    /// Insert-or-replace keyed on `key_column`, as one atomic statement.
    /// `params` holds the key followed by one value per `value_columns` entry.
    fn upsert(
        &self,
        table: &str,
        key_column: &str,
        value_columns: &[&str],
        params: Vec<SqlParam>,
    ) -> Statement;

    fn insert_record(&self, collection: &str, id: &str, payload: SqlParam, timestamp: i64) -> Statement {
        Statement::with_params(
            format!(
                "INSERT INTO {} ({}) VALUES ({}, {}, {})",
                self.quote_ident(collection),
                record_columns(self),
                self.placeholder(1),
                self.placeholder(2),
                self.placeholder(3)
            ),
            vec![SqlParam::text(id), payload, SqlParam::Int(timestamp)],
        )
    }

    fn update_record(&self, collection: &str, id: &str, payload: SqlParam) -> Statement {
        Statement::with_params(
            format!(
                "UPDATE {} SET {} = {} WHERE {} = {}",
                self.quote_ident(collection),
                self.quote_ident(DATA_COLUMN),
                self.placeholder(1),
                self.quote_ident(ID_COLUMN),
                self.placeholder(2)
            ),
            vec![payload, SqlParam::text(id)],
        )
    }

    fn delete_record(&self, collection: &str, id: &str) -> Statement {
        Statement::with_params(
            format!(
                "DELETE FROM {} WHERE {} = {}",
                self.quote_ident(collection),
                self.quote_ident(ID_COLUMN),
                self.placeholder(1)
            ),
            vec![SqlParam::text(id)],
        )
    }

    fn select_record(&self, collection: &str, id: &str) -> Statement {
        Statement::with_params(
            format!(
                "SELECT {} FROM {} WHERE {} = {}",
                record_columns(self),
                self.quote_ident(collection),
                self.quote_ident(ID_COLUMN),
                self.placeholder(1)
            ),
            vec![SqlParam::text(id)],
        )
    }

    /// `SELECT` keyword plus any row cap that goes before the column list.
    fn select_head(&self, _limit: Option<u64>) -> String {
        "SELECT".to_string()
    }

    /// Row cap that goes after `ORDER BY`, including its leading space.
    fn limit_tail(&self, limit: Option<u64>) -> String {
        limit.map(|n| format!(" LIMIT {}", n)).unwrap_or_default()
    }

    /// SQL condition for a predicate over an indexed payload field.
    /// Parameters are appended to `params`.
    fn field_predicate(&self, field: &str, pred: &Predicate, params: &mut Vec<SqlParam>) -> String;

    fn select_filtered(
        &self,
        collection: &str,
        predicates: &[Predicate],
        order: SortOrder,
        limit: Option<u64>,
    ) -> Statement {
        let mut params = Vec::new();
        let clauses: Vec<String> = predicates
            .iter()
            .map(|pred| match &pred.target {
                FilterTarget::Id => {
                    let ph = bind(self, &mut params, SqlParam::Text(pred.value.as_text()));
                    format!("{} {} {}", self.quote_ident(ID_COLUMN), pred.op.sql(), ph)
                }
                FilterTarget::Timestamp => {
                    let param = match pred.value {
                        Literal::Number(n) => SqlParam::Float(n),
                        _ => SqlParam::Text(pred.value.as_text()),
                    };
                    let ph = bind(self, &mut params, param);
                    format!("{} {} {}", self.quote_ident(TIMESTAMP_COLUMN), pred.op.sql(), ph)
                }
                FilterTarget::Field(field) => self.field_predicate(field, pred, &mut params),
            })
            .collect();

        let mut sql = format!(
            "{} {} FROM {}",
            self.select_head(limit),
            record_columns(self),
            self.quote_ident(collection)
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(
            " ORDER BY {ts} {dir}, {id} {dir}",
            ts = self.quote_ident(TIMESTAMP_COLUMN),
            id = self.quote_ident(ID_COLUMN),
            dir = order.sql()
        ));
        sql.push_str(&self.limit_tail(limit));
        Statement::with_params(sql, params)
    }

    fn select_one(&self, collection: &str) -> Statement {
        self.select_filtered(collection, &[], SortOrder::Asc, Some(1))
    }

    fn select_all(&self, collection: &str) -> Statement {
        self.select_filtered(collection, &[], SortOrder::Asc, None)
    }

    fn count_records(&self, collection: &str) -> Statement {
        Statement::new(format!(
            "SELECT COUNT(*) AS {} FROM {}",
            self.quote_ident("total"),
            self.quote_ident(collection)
        ))
    }

    fn upsert_kv(&self, key: &str, kind: KvType, value: &str) -> Statement {
        self.upsert(
            KV_TABLE,
            "kv_key",
            &["kv_type", "kv_value"],
            vec![
                SqlParam::text(key),
                SqlParam::text(kind.as_str()),
                SqlParam::text(value),
            ],
        )
    }

    fn select_kv(&self, key: &str) -> Statement {
        Statement::with_params(
            format!(
                "SELECT {}, {} FROM {} WHERE {} = {}",
                self.quote_ident("kv_type"),
                self.quote_ident("kv_value"),
                self.quote_ident(KV_TABLE),
                self.quote_ident("kv_key"),
                self.placeholder(1)
            ),
            vec![SqlParam::text(key)],
        )
    }

    fn delete_kv(&self, key: &str) -> Statement {
        Statement::with_params(
            format!(
                "DELETE FROM {} WHERE {} = {}",
                self.quote_ident(KV_TABLE),
                self.quote_ident("kv_key"),
                self.placeholder(1)
            ),
            vec![SqlParam::text(key)],
        )
    }

    /// Durability checkpoint, if the backend has a meaningful one.
    fn checkpoint(&self) -> Option<Statement> {
        None
    }

    /// Encode a record's fields for the payload column.
    fn encode_payload(&self, fields: &Map<String, Value>) -> SqlParam;

    /// Decode the payload column back into fields.
    fn decode_payload(&self, raw: SqlValue) -> Result<Map<String, Value>> {
        decode_json_object(raw)
    }

    fn classify_error(&self, err: &DriverError) -> ErrorClass;
}

/// Append `param` and return the placeholder that refers to it.
pub(crate) fn bind<S: DialectStrategy + ?Sized>(
    strategy: &S,
    params: &mut Vec<SqlParam>,
    param: SqlParam,
) -> String {
    let ph = strategy.typed_placeholder(params.len() + 1, &param);
    params.push(param);
    ph
}

pub(crate) fn record_columns<S: DialectStrategy + ?Sized>(strategy: &S) -> String {
    format!(
        "{}, {}, {}",
        strategy.quote_ident(ID_COLUMN),
        strategy.quote_ident(DATA_COLUMN),
        strategy.quote_ident(TIMESTAMP_COLUMN)
    )
}

/// Index name for `field` on `collection`, kept under every backend's limit.
pub(crate) fn index_name(collection: &str, field: &str) -> String {
    let name = format!("ix_{}_{}", collection, field);
    if name.len() <= MAX_INDEX_NAME_LEN {
        return name;
    }
    let mut hasher = Sha256::new();
    hasher.update(collection.as_bytes());
    hasher.update([0u8]);
    hasher.update(field.as_bytes());
    let digest = hasher.finalize();
    let prefix: String = collection.chars().take(MAX_INDEX_NAME_LEN - 20).collect();
    format!("ix_{}_{}", prefix, hex::encode(&digest[..8]))
}

/// Payload decoding shared by every dialect: the column arrives as native
/// JSON, text or raw bytes depending on driver and protocol.
pub(crate) fn decode_json_object(raw: SqlValue) -> Result<Map<String, Value>> {
    let value = match raw {
        SqlValue::Json(value) => value,
        SqlValue::Text(text) => serde_json::from_str(&text)?,
        SqlValue::Bytes(bytes) => serde_json::from_slice(&bytes)?,
        other => {
            return Err(StoreError::Codec(format!(
                "payload column holds {:?}, expected JSON",
                other
            )))
        }
    };
    match value {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Codec(format!(
            "payload is not a JSON object: {}",
            other
        ))),
    }
}

/// Internal tables and their literal SQL spelling, for catalog exclusions.
pub(crate) fn internal_tables_literal(prefix: &str) -> String {
    [METADATA_TABLE, KV_TABLE]
        .iter()
        .map(|t| format!("{}'{}'", prefix, t))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::filter::resolve_conditions;
    use serde_json::json;

    #[test]
    fn test_dialect_from_str_aliases() {
        assert_eq!("postgres".parse::<Dialect>().unwrap(), Dialect::Postgres);
        assert_eq!("PostgreSQL".parse::<Dialect>().unwrap(), Dialect::Postgres);
        assert_eq!("pg".parse::<Dialect>().unwrap(), Dialect::Postgres);
        assert_eq!("mysql".parse::<Dialect>().unwrap(), Dialect::MySql);
        assert_eq!("MariaDB".parse::<Dialect>().unwrap(), Dialect::MySql);
        assert_eq!("mssql".parse::<Dialect>().unwrap(), Dialect::Mssql);
        assert_eq!("sql-server".parse::<Dialect>().unwrap(), Dialect::Mssql);
    }

    #[test]
    fn test_factory_rejects_unknown_dialect() {
        let err = create_strategy("oracle").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownDialect);
        assert!(err.to_string().contains("oracle"));
    }

    #[test]
    fn test_factory_builds_matching_strategy() {
        for dialect in Dialect::ALL {
            let strategy = create_strategy(dialect.as_str()).unwrap();
            assert_eq!(strategy.dialect(), dialect);
        }
    }

    #[test]
    fn test_dialect_serde() {
        assert_eq!(serde_json::to_value(Dialect::MySql).unwrap(), json!("mysql"));
        let d: Dialect = serde_json::from_value(json!("mssql")).unwrap();
        assert_eq!(d, Dialect::Mssql);
        assert_eq!(Dialect::Postgres.default_port(), 5432);
    }

    #[test]
    fn test_index_name_short_and_long() {
        assert_eq!(index_name("users", "email"), "ix_users_email");

        let long_coll = "c".repeat(64);
        let a = index_name(&long_coll, "field_a");
        let b = index_name(&long_coll, "field_b");
        assert!(a.len() <= MAX_INDEX_NAME_LEN);
        assert_ne!(a, b);
        assert_eq!(a, index_name(&long_coll, "field_a"));

        let suffix = a.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), 16);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(a.starts_with(&format!("ix_{}_", "c".repeat(MAX_INDEX_NAME_LEN - 20))));
    }

    #[test]
    fn test_decode_json_object_variants() {
        let expected = json!({"a": [1, {"b": null}]});
        let map = expected.as_object().unwrap().clone();

        assert_eq!(decode_json_object(SqlValue::Json(expected.clone())).unwrap(), map);
        assert_eq!(
            decode_json_object(SqlValue::Text(expected.to_string())).unwrap(),
            map
        );
        assert_eq!(
            decode_json_object(SqlValue::Bytes(expected.to_string().into_bytes())).unwrap(),
            map
        );
        assert_eq!(
            decode_json_object(SqlValue::Int(1)).unwrap_err().kind(),
            ErrorKind::Codec
        );
        assert_eq!(
            decode_json_object(SqlValue::Text("[1]".into())).unwrap_err().kind(),
            ErrorKind::Codec
        );
    }

    #[test]
    fn test_filtered_select_shapes_per_dialect() {
        let preds = resolve_conditions(&["score >= 20"], &["score".to_string()]).unwrap();
        for dialect in Dialect::ALL {
            let strategy = strategy_for(dialect);
            let stmt = strategy.select_filtered("scores", &preds, SortOrder::Desc, Some(5));
            assert!(stmt.sql.contains("WHERE"), "{}: {}", dialect, stmt.sql);
            assert!(stmt.sql.contains("DESC"), "{}: {}", dialect, stmt.sql);
            assert_eq!(stmt.params, vec![SqlParam::Float(20.0)], "{}", dialect);
        }
    }

    #[test]
    fn test_unfiltered_select_has_no_where() {
        for dialect in Dialect::ALL {
            let stmt = strategy_for(dialect).select_all("things");
            assert!(!stmt.sql.contains("WHERE"));
            assert!(stmt.sql.contains("ORDER BY"));
            assert!(stmt.params.is_empty());
        }
    }

    #[test]
    fn test_upsert_metadata_encodes_indices_as_json() {
        let stmt = strategy_for(Dialect::Postgres)
            .upsert_metadata("users", &["email".to_string(), "age".to_string()]);
        assert_eq!(
            stmt.params,
            vec![
                SqlParam::text("users"),
                SqlParam::text(r#"["email","age"]"#)
            ]
        );
    }

    #[test]
    fn test_internal_tables_literal() {
        assert_eq!(
            internal_tables_literal("N"),
            "N'__sqldoc_collections', N'__sqldoc_kv'"
        );
    }
}
