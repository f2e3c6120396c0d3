use serde_json::{Map, Value};

use super::{bind, index_name, internal_tables_literal, Dialect, DialectStrategy, ErrorClass};
use crate::db::{SqlParam, Statement};
use crate::error::DriverError;
use crate::filter::{CompareOp, Literal, Predicate};
use crate::model::{DATA_COLUMN, ID_COLUMN, KV_TABLE, METADATA_TABLE, TIMESTAMP_COLUMN};

/// Binary collation so keys compare byte-wise, as on the other backends.
const TABLE_OPTIONS: &str = "DEFAULT CHARACTER SET utf8mb4 COLLATE utf8mb4_bin";

/// Server error numbers reporting a unique-constraint violation.
const DUPLICATE_KEY_CODES: [&str; 5] = [
    "1022", // ER_DUP_KEY
    "1062", // ER_DUP_ENTRY
    "1169", // ER_DUP_UNIQUE
    "1557", // ER_FOREIGN_DUPLICATE_KEY_OLD_UNUSED
    "1586", // ER_DUP_ENTRY_WITH_KEY_NAME
];

/// MySQL / MariaDB: `JSON` payload, `?` placeholders, numeric error codes.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlStrategy;

impl MySqlStrategy {
    fn json_field(&self, field: &str) -> String {
        format!("JSON_EXTRACT({}, '$.{}')", self.quote_ident(DATA_COLUMN), field)
    }
}

impl DialectStrategy for MySqlStrategy {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn bootstrap(&self) -> Vec<Statement> {
        vec![
            Statement::new(format!(
                "CREATE TABLE IF NOT EXISTS {} ({} VARCHAR(255) NOT NULL PRIMARY KEY, {} TEXT NOT NULL) {}",
                self.quote_ident(METADATA_TABLE),
                self.quote_ident("name"),
                self.quote_ident("indices"),
                TABLE_OPTIONS,
            )),
            Statement::new(format!(
                "CREATE TABLE IF NOT EXISTS {} ({} VARCHAR(255) NOT NULL PRIMARY KEY, {} VARCHAR(16) NOT NULL, {} LONGTEXT NOT NULL) {}",
                self.quote_ident(KV_TABLE),
                self.quote_ident("kv_key"),
                self.quote_ident("kv_type"),
                self.quote_ident("kv_value"),
                TABLE_OPTIONS,
            )),
        ]
    }

    fn create_collection(&self, name: &str) -> Vec<Statement> {
        vec![Statement::new(format!(
            "CREATE TABLE IF NOT EXISTS {} ({id} VARCHAR(255) NOT NULL PRIMARY KEY, {data} JSON NOT NULL, {ts} BIGINT NOT NULL, INDEX {ix} ({ts})) {opts}",
            self.quote_ident(name),
            id = self.quote_ident(ID_COLUMN),
            data = self.quote_ident(DATA_COLUMN),
            ts = self.quote_ident(TIMESTAMP_COLUMN),
            ix = self.quote_ident(&index_name(name, TIMESTAMP_COLUMN)),
            opts = TABLE_OPTIONS,
        ))]
    }

    /// Functional index (MySQL 8.0.13+). There is no `IF NOT EXISTS` for
    /// indexes, so an existing one surfaces as error 1061 (`AlreadyExists`).
    fn create_index(&self, collection: &str, field: &str) -> Vec<Statement> {
        vec![Statement::new(format!(
            "CREATE INDEX {} ON {} ((CAST(JSON_UNQUOTE({}) AS CHAR(255)) COLLATE utf8mb4_bin))",
            self.quote_ident(&index_name(collection, field)),
            self.quote_ident(collection),
            self.json_field(field),
        ))]
    }

    fn list_collections(&self) -> Statement {
        Statement::new(format!(
            "SELECT TABLE_NAME AS name \
             FROM information_schema.tables \
             WHERE table_schema = DATABASE() \
               AND table_type = 'BASE TABLE' \
               AND TABLE_NAME NOT IN ({}) \
             ORDER BY TABLE_NAME",
            internal_tables_literal("")
        ))
    }

    fn upsert(
        &self,
        table: &str,
        key_column: &str,
        value_columns: &[&str],
        params: Vec<SqlParam>,
    ) -> Statement {
        let columns: Vec<String> = std::iter::once(key_column)
            .chain(value_columns.iter().copied())
            .map(|c| self.quote_ident(c))
            .collect();
        let placeholders = vec!["?"; columns.len()].join(", ");
        let updates: Vec<String> = value_columns
            .iter()
            .map(|c| format!("{col} = VALUES({col})", col = self.quote_ident(c)))
            .collect();
        Statement::with_params(
            format!(
                "INSERT INTO {} ({}) VALUES ({}) ON DUPLICATE KEY UPDATE {}",
                self.quote_ident(table),
                columns.join(", "),
                placeholders,
                updates.join(", ")
            ),
            params,
        )
    }

    fn field_predicate(&self, field: &str, pred: &Predicate, params: &mut Vec<SqlParam>) -> String {
        let json = self.json_field(field);
        match &pred.value {
            Literal::Null => match pred.op {
                CompareOp::Eq => format!("({json} IS NULL OR JSON_TYPE({json}) = 'NULL')"),
                _ => format!("({json} IS NOT NULL AND JSON_TYPE({json}) <> 'NULL')"),
            },
            Literal::Number(n) => {
                let ph = bind(self, params, SqlParam::Float(*n));
                format!(
                    "(CASE WHEN JSON_TYPE({json}) IN ('INTEGER', 'UNSIGNED INTEGER', 'DOUBLE', 'DECIMAL') THEN {json} + 0 END) {op} {ph}",
                    op = pred.op.sql(),
                )
            }
            Literal::Bool(_) | Literal::Text(_) => {
                let ph = bind(self, params, SqlParam::Text(pred.value.as_text()));
                format!("JSON_UNQUOTE({}) {} {}", json, pred.op.sql(), ph)
            }
        }
    }

    fn encode_payload(&self, fields: &Map<String, Value>) -> SqlParam {
        SqlParam::Text(Value::Object(fields.clone()).to_string())
    }

    fn classify_error(&self, err: &DriverError) -> ErrorClass {
        if err.transport {
            return ErrorClass::Connection;
        }
        let Some(code) = err.code.as_deref() else {
            return ErrorClass::Other;
        };
        if DUPLICATE_KEY_CODES.contains(&code) {
            return ErrorClass::DuplicateKey;
        }
        match code {
            // ER_NO_SUCH_TABLE, ER_BAD_TABLE_ERROR
            "1146" | "1051" => ErrorClass::UndefinedTable,
            // ER_TABLE_EXISTS_ERROR, ER_DUP_KEYNAME
            "1050" | "1061" => ErrorClass::AlreadyExists,
            // ER_PARSE_ERROR, ER_BAD_FIELD_ERROR
            "1064" | "1054" => ErrorClass::Syntax,
            // client-side CR_* codes and server connection limits
            "2002" | "2003" | "2006" | "2013" | "2055" | "1040" | "1053" | "1152" | "1158"
            | "1159" | "1160" | "1161" => ErrorClass::Connection,
            _ => ErrorClass::Other,
        }
    }
}
