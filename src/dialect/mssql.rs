use serde_json::{Map, Value};

use super::{bind, index_name, internal_tables_literal, Dialect, DialectStrategy, ErrorClass};
use crate::db::{SqlParam, Statement};
use crate::error::DriverError;
use crate::filter::{CompareOp, Literal, Predicate};
use crate::model::{DATA_COLUMN, ID_COLUMN, KV_TABLE, METADATA_TABLE, TIMESTAMP_COLUMN};

/// Case- and accent-sensitive collation for key columns.
const KEY_COLLATION: &str = "Latin1_General_100_BIN2";

/// SQL Server: `NVARCHAR(MAX)` JSON text, `@Pn` placeholders, `TOP (n)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MssqlStrategy;

impl MssqlStrategy {
    fn json_value(&self, field: &str) -> String {
        format!("JSON_VALUE({}, '$.{}')", self.quote_ident(DATA_COLUMN), field)
    }

    /// `EXISTS` test on the `OPENJSON` type code of a top-level field:
    /// 0 null, 1 string, 2 number, 3 boolean, 4 array, 5 object.
    fn has_json_type(&self, field: &str, test: &str) -> String {
        format!(
            "EXISTS (SELECT 1 FROM OPENJSON({}) WHERE [key] = N'{}' AND [type] {})",
            self.quote_ident(DATA_COLUMN),
            field,
            test
        )
    }

    /// Computed column backing the index on `field`.
    fn index_column(field: &str) -> String {
        format!("__ix_{}", field)
    }

    /// `N'[name]'` literal for OBJECT_ID / COL_LENGTH lookups.
    fn object_literal(&self, name: &str) -> String {
        format!("N'{}'", self.quote_ident(name).replace('\'', "''"))
    }

    fn create_table_if_missing(&self, name: &str, columns: &str, extra: &str) -> Statement {
        Statement::new(format!(
            "IF OBJECT_ID({}, N'U') IS NULL BEGIN CREATE TABLE {} ({}); {}END",
            self.object_literal(name),
            self.quote_ident(name),
            columns,
            extra
        ))
    }
}

impl DialectStrategy for MssqlStrategy {
    fn dialect(&self) -> Dialect {
        Dialect::Mssql
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("[{}]", ident.replace(']', "]]"))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("@P{}", index)
    }

    fn bootstrap(&self) -> Vec<Statement> {
        vec![
            self.create_table_if_missing(
                METADATA_TABLE,
                &format!(
                    "{} NVARCHAR(450) COLLATE {} NOT NULL PRIMARY KEY, {} NVARCHAR(MAX) NOT NULL",
                    self.quote_ident("name"),
                    KEY_COLLATION,
                    self.quote_ident("indices")
                ),
                "",
            ),
            self.create_table_if_missing(
                KV_TABLE,
                &format!(
                    "{} NVARCHAR(450) COLLATE {} NOT NULL PRIMARY KEY, {} NVARCHAR(16) NOT NULL, {} NVARCHAR(MAX) NOT NULL",
                    self.quote_ident("kv_key"),
                    KEY_COLLATION,
                    self.quote_ident("kv_type"),
                    self.quote_ident("kv_value")
                ),
                "",
            ),
        ]
    }

    fn create_collection(&self, name: &str) -> Vec<Statement> {
        let columns = format!(
            "{} NVARCHAR(450) COLLATE {} NOT NULL PRIMARY KEY, {} NVARCHAR(MAX) NOT NULL, {} BIGINT NOT NULL",
            self.quote_ident(ID_COLUMN),
            KEY_COLLATION,
            self.quote_ident(DATA_COLUMN),
            self.quote_ident(TIMESTAMP_COLUMN)
        );
        let ts_index = format!(
            "CREATE INDEX {} ON {} ({}); ",
            self.quote_ident(&index_name(name, TIMESTAMP_COLUMN)),
            self.quote_ident(name),
            self.quote_ident(TIMESTAMP_COLUMN)
        );
        vec![self.create_table_if_missing(name, &columns, &ts_index)]
    }

    /// SQL Server cannot index an expression directly, so the field is
    /// exposed as a computed column first and that column is indexed.
    fn create_index(&self, collection: &str, field: &str) -> Vec<Statement> {
        let column = Self::index_column(field);
        let ix = index_name(collection, field);
        vec![
            Statement::new(format!(
                "IF COL_LENGTH({table_lit}, N'{column}') IS NULL ALTER TABLE {table} ADD {col} AS CAST({expr} AS NVARCHAR(450))",
                table_lit = self.object_literal(collection),
                table = self.quote_ident(collection),
                col = self.quote_ident(&column),
                expr = self.json_value(field),
            )),
            Statement::new(format!(
                "IF NOT EXISTS (SELECT 1 FROM sys.indexes WHERE name = N'{ix}' AND object_id = OBJECT_ID({table_lit})) CREATE INDEX {ix_q} ON {table} ({col})",
                table_lit = self.object_literal(collection),
                ix_q = self.quote_ident(&ix),
                table = self.quote_ident(collection),
                col = self.quote_ident(&column),
            )),
        ]
    }

    fn drop_collection(&self, name: &str) -> Vec<Statement> {
        vec![Statement::new(format!(
            "IF OBJECT_ID({}, N'U') IS NOT NULL DROP TABLE {}",
            self.object_literal(name),
            self.quote_ident(name)
        ))]
    }

    fn list_collections(&self) -> Statement {
        Statement::new(format!(
            "SELECT name FROM sys.tables \
             WHERE is_ms_shipped = 0 \
               AND schema_id = SCHEMA_ID() \
               AND name NOT IN ({}) \
             ORDER BY name",
            internal_tables_literal("N")
        ))
    }

    fn upsert(
        &self,
        table: &str,
        key_column: &str,
        value_columns: &[&str],
        params: Vec<SqlParam>,
    ) -> Statement {
        let all: Vec<&str> = std::iter::once(key_column)
            .chain(value_columns.iter().copied())
            .collect();
        let source: Vec<String> = all
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} AS {}", self.placeholder(i + 1), self.quote_ident(c)))
            .collect();
        let updates: Vec<String> = value_columns
            .iter()
            .map(|c| format!("target.{col} = source.{col}", col = self.quote_ident(c)))
            .collect();
        let insert_cols: Vec<String> = all.iter().map(|c| self.quote_ident(c)).collect();
        let insert_vals: Vec<String> = all
            .iter()
            .map(|c| format!("source.{}", self.quote_ident(c)))
            .collect();
        let key = self.quote_ident(key_column);
        Statement::with_params(
            format!(
                "MERGE INTO {} WITH (HOLDLOCK) AS target \
                 USING (SELECT {}) AS source \
                 ON target.{key} = source.{key} \
                 WHEN MATCHED THEN UPDATE SET {} \
                 WHEN NOT MATCHED THEN INSERT ({}) VALUES ({});",
                self.quote_ident(table),
                source.join(", "),
                updates.join(", "),
                insert_cols.join(", "),
                insert_vals.join(", "),
            ),
            params,
        )
    }

    fn select_head(&self, limit: Option<u64>) -> String {
        match limit {
            Some(n) => format!("SELECT TOP ({})", n),
            None => "SELECT".to_string(),
        }
    }

    fn limit_tail(&self, _limit: Option<u64>) -> String {
        String::new()
    }

    fn field_predicate(&self, field: &str, pred: &Predicate, params: &mut Vec<SqlParam>) -> String {
        let value = self.json_value(field);
        match &pred.value {
            // A missing field and an explicit JSON null both count as null.
            Literal::Null => match pred.op {
                CompareOp::Eq => format!("NOT {}", self.has_json_type(field, "<> 0")),
                _ => self.has_json_type(field, "<> 0"),
            },
            Literal::Number(n) => {
                let ph = bind(self, params, SqlParam::Float(*n));
                format!(
                    "({} AND TRY_CAST({} AS FLOAT) {} {})",
                    self.has_json_type(field, "= 2"),
                    value,
                    pred.op.sql(),
                    ph
                )
            }
            Literal::Bool(_) | Literal::Text(_) => {
                let ph = bind(self, params, SqlParam::Text(pred.value.as_text()));
                format!("{} {} {}", value, pred.op.sql(), ph)
            }
        }
    }

    fn checkpoint(&self) -> Option<Statement> {
        Some(Statement::new("CHECKPOINT"))
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
        match code {
            // PRIMARY KEY / UNIQUE constraint, unique index
            "2627" | "2601" => ErrorClass::DuplicateKey,
            // invalid object name, cannot find object, cannot drop
            "208" | "4902" | "3701" => ErrorClass::UndefinedTable,
            // object, index, column name already exists
            "2714" | "1913" | "2705" => ErrorClass::AlreadyExists,
            "102" | "156" | "207" | "4145" => ErrorClass::Syntax,
            // timeouts, network errors, database unavailable
            "-2" | "53" | "233" | "10053" | "10054" | "10060" | "40613" => ErrorClass::Connection,
            _ => ErrorClass::Other,
        }
    }
}
