use serde_json::{Map, Value};

use super::{bind, index_name, internal_tables_literal, DialectStrategy, Dialect, ErrorClass};
use crate::db::{SqlParam, Statement};
use crate::error::DriverError;
use crate::filter::{CompareOp, Literal, Predicate};
use crate::model::{DATA_COLUMN, ID_COLUMN, KV_TABLE, METADATA_TABLE, TIMESTAMP_COLUMN};

/// PostgreSQL: `JSONB` payload, `$n` placeholders, SQLSTATE error codes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresStrategy;

impl PostgresStrategy {
    fn json_field(&self, field: &str) -> String {
        format!("{}->'{}'", self.quote_ident(DATA_COLUMN), field)
    }

    fn text_field(&self, field: &str) -> String {
        format!("({}->>'{}')", self.quote_ident(DATA_COLUMN), field)
    }
}

impl DialectStrategy for PostgresStrategy {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn typed_placeholder(&self, index: usize, param: &SqlParam) -> String {
        match param {
            SqlParam::Int(_) => format!("CAST(${} AS BIGINT)", index),
            SqlParam::Float(_) => format!("CAST(${} AS DOUBLE PRECISION)", index),
            SqlParam::Text(_) => format!("CAST(${} AS TEXT)", index),
            SqlParam::Json(_) => format!("CAST(${} AS JSONB)", index),
            SqlParam::Null => format!("${}", index),
        }
    }

    fn bootstrap(&self) -> Vec<Statement> {
        vec![
            Statement::new(format!(
                "CREATE TABLE IF NOT EXISTS {} ({} TEXT PRIMARY KEY, {} TEXT NOT NULL)",
                self.quote_ident(METADATA_TABLE),
                self.quote_ident("name"),
                self.quote_ident("indices"),
            )),
            Statement::new(format!(
                "CREATE TABLE IF NOT EXISTS {} ({} TEXT PRIMARY KEY, {} TEXT NOT NULL, {} TEXT NOT NULL)",
                self.quote_ident(KV_TABLE),
                self.quote_ident("kv_key"),
                self.quote_ident("kv_type"),
                self.quote_ident("kv_value"),
            )),
        ]
    }

    fn create_collection(&self, name: &str) -> Vec<Statement> {
        let table = self.quote_ident(name);
        vec![
            Statement::new(format!(
                "CREATE TABLE IF NOT EXISTS {} ({} TEXT PRIMARY KEY, {} JSONB NOT NULL, {} BIGINT NOT NULL)",
                table,
                self.quote_ident(ID_COLUMN),
                self.quote_ident(DATA_COLUMN),
                self.quote_ident(TIMESTAMP_COLUMN),
            )),
            Statement::new(format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                self.quote_ident(&index_name(name, TIMESTAMP_COLUMN)),
                table,
                self.quote_ident(TIMESTAMP_COLUMN),
            )),
        ]
    }

    fn create_index(&self, collection: &str, field: &str) -> Vec<Statement> {
        vec![Statement::new(format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            self.quote_ident(&index_name(collection, field)),
            self.quote_ident(collection),
            self.text_field(field),
        ))]
    }

    fn list_collections(&self) -> Statement {
        Statement::new(format!(
            "SELECT table_name::text AS name \
             FROM information_schema.tables \
             WHERE table_schema = current_schema() \
               AND table_type = 'BASE TABLE' \
               AND table_name::text NOT IN ({}) \
             ORDER BY table_name",
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
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| self.placeholder(i)).collect();
        let updates: Vec<String> = value_columns
            .iter()
            .map(|c| format!("{col} = EXCLUDED.{col}", col = self.quote_ident(c)))
            .collect();
        Statement::with_params(
            format!(
                "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {}",
                self.quote_ident(table),
                columns.join(", "),
                placeholders.join(", "),
                self.quote_ident(key_column),
                updates.join(", ")
            ),
            params,
        )
    }

    fn field_predicate(&self, field: &str, pred: &Predicate, params: &mut Vec<SqlParam>) -> String {
        let json = self.json_field(field);
        match &pred.value {
            Literal::Null => match pred.op {
                CompareOp::Eq => format!("({json} IS NULL OR jsonb_typeof({json}) = 'null')"),
                _ => format!("({json} IS NOT NULL AND jsonb_typeof({json}) <> 'null')"),
            },
            Literal::Number(n) => {
                let ph = bind(self, params, SqlParam::Float(*n));
                format!(
                    "(CASE WHEN jsonb_typeof({json}) = 'number' THEN {text}::double precision END) {op} {ph}",
                    text = self.text_field(field),
                    op = pred.op.sql(),
                )
            }
            Literal::Bool(_) | Literal::Text(_) => {
                let ph = bind(self, params, SqlParam::Text(pred.value.as_text()));
                format!("{} {} {}", self.text_field(field), pred.op.sql(), ph)
            }
        }
    }

    fn encode_payload(&self, fields: &Map<String, Value>) -> SqlParam {
        SqlParam::Json(Value::Object(fields.clone()))
    }

    fn classify_error(&self, err: &DriverError) -> ErrorClass {
        if err.transport {
            return ErrorClass::Connection;
        }
        let Some(code) = err.code.as_deref() else {
            return ErrorClass::Other;
        };
        match code {
            // unique_violation covers both primary keys and unique indexes
            "23505" => ErrorClass::DuplicateKey,
            "42P01" => ErrorClass::UndefinedTable,
            // duplicate_table is also raised for an existing index name
            "42P07" | "42710" => ErrorClass::AlreadyExists,
            "42601" | "42703" | "42883" | "22P02" => ErrorClass::Syntax,
            "57P01" | "57P02" | "57P03" | "53300" => ErrorClass::Connection,
            _ if code.starts_with("08") => ErrorClass::Connection,
            _ => ErrorClass::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{resolve_conditions, SortOrder};
    use crate::model::KvType;
    use serde_json::json;

    fn predicates(conditions: &[&str]) -> Vec<Predicate> {
        resolve_conditions(conditions, &["score".to_string(), "name".to_string()]).unwrap()
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        let s = PostgresStrategy;
        assert_eq!(s.quote_ident("users"), "\"users\"");
        assert_eq!(s.quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_create_collection_statements() {
        let stmts = PostgresStrategy.create_collection("users");
        assert_eq!(stmts.len(), 2);
        assert_eq!(
            stmts[0].sql,
            "CREATE TABLE IF NOT EXISTS \"users\" (\"id\" TEXT PRIMARY KEY, \"data\" JSONB NOT NULL, \"__timestamp\" BIGINT NOT NULL)"
        );
        assert!(stmts[1].sql.contains("\"ix_users___timestamp\""));
    }

    #[test]
    fn test_create_index_uses_json_expression() {
        let stmts = PostgresStrategy.create_index("users", "email");
        assert_eq!(
            stmts[0].sql,
            "CREATE INDEX IF NOT EXISTS \"ix_users_email\" ON \"users\" ((\"data\"->>'email'))"
        );
    }

    #[test]
    fn test_insert_binds_json_payload() {
        let fields = json!({"name": "Ada", "tags": ["x"]});
        let payload = PostgresStrategy.encode_payload(fields.as_object().unwrap());
        let stmt = PostgresStrategy.insert_record("users", "u1", payload, 42);
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"users\" (\"id\", \"data\", \"__timestamp\") VALUES ($1, $2, $3)"
        );
        assert_eq!(stmt.params[0], SqlParam::text("u1"));
        assert_eq!(stmt.params[1], SqlParam::Json(fields));
        assert_eq!(stmt.params[2], SqlParam::Int(42));
    }

    #[test]
    fn test_numeric_filter_with_limit() {
        let stmt = PostgresStrategy.select_filtered(
            "scores",
            &predicates(&["score >= 20"]),
            SortOrder::Asc,
            Some(2),
        );
        assert_eq!(
            stmt.sql,
            "SELECT \"id\", \"data\", \"__timestamp\" FROM \"scores\" \
             WHERE (CASE WHEN jsonb_typeof(\"data\"->'score') = 'number' THEN (\"data\"->>'score')::double precision END) >= CAST($1 AS DOUBLE PRECISION) \
             ORDER BY \"__timestamp\" ASC, \"id\" ASC LIMIT 2"
        );
        assert_eq!(stmt.params, vec![SqlParam::Float(20.0)]);
    }

    #[test]
    fn test_text_and_null_filters() {
        let stmt = PostgresStrategy.select_filtered(
            "people",
            &predicates(&["name == 'Ada'", "score != null"]),
            SortOrder::Desc,
            None,
        );
        assert!(stmt
            .sql
            .contains("(\"data\"->>'name') = CAST($1 AS TEXT) AND (\"data\"->'score' IS NOT NULL"));
        assert!(!stmt.sql.contains("LIMIT"));
        assert_eq!(stmt.params, vec![SqlParam::text("Ada")]);
    }

    #[test]
    fn test_numbers_and_nulls_are_type_guarded() {
        let stmt = PostgresStrategy.select_filtered(
            "people",
            &resolve_conditions(&["score >= 20", "note == null"], &["score".into(), "note".into()])
                .unwrap(),
            SortOrder::Asc,
            None,
        );
        assert!(stmt
            .sql
            .contains("(CASE WHEN jsonb_typeof(\"data\"->'score') = 'number' THEN"));
        assert!(stmt.sql.contains(
            "(\"data\"->'note' IS NULL OR jsonb_typeof(\"data\"->'note') = 'null')"
        ));
        assert_eq!(stmt.params, vec![SqlParam::Float(20.0)]);
    }

    #[test]
    fn test_kv_upsert_on_conflict() {
        let stmt = PostgresStrategy.upsert_kv("k", KvType::Object, "{}");
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"__sqldoc_kv\" (\"kv_key\", \"kv_type\", \"kv_value\") VALUES ($1, $2, $3) \
             ON CONFLICT (\"kv_key\") DO UPDATE SET \"kv_type\" = EXCLUDED.\"kv_type\", \"kv_value\" = EXCLUDED.\"kv_value\""
        );
        assert_eq!(stmt.params.len(), 3);
    }

    #[test]
    fn test_list_collections_excludes_internal_tables() {
        let stmt = PostgresStrategy.list_collections();
        assert!(stmt.sql.contains("'__sqldoc_collections', '__sqldoc_kv'"));
        assert!(stmt.sql.contains("current_schema()"));
    }

    #[test]
    fn test_no_checkpoint() {
        assert!(PostgresStrategy.checkpoint().is_none());
    }

    #[test]
    fn test_classify_error() {
        let s = PostgresStrategy;
        assert_eq!(
            s.classify_error(&DriverError::server("23505", "duplicate key value")),
            ErrorClass::DuplicateKey
        );
        assert_eq!(
            s.classify_error(&DriverError::server("42P01", "relation does not exist")),
            ErrorClass::UndefinedTable
        );
        assert_eq!(
            s.classify_error(&DriverError::server("42P07", "already exists")),
            ErrorClass::AlreadyExists
        );
        assert_eq!(
            s.classify_error(&DriverError::server("42601", "syntax error")),
            ErrorClass::Syntax
        );
        assert_eq!(
            s.classify_error(&DriverError::server("08006", "connection failure")),
            ErrorClass::Connection
        );
        assert_eq!(
            s.classify_error(&DriverError::transport("reset")),
            ErrorClass::Connection
        );
        assert_eq!(
            s.classify_error(&DriverError::server("XX000", "internal")),
            ErrorClass::Other
        );
        assert_eq!(s.classify_error(&DriverError::other("?")), ErrorClass::Other);
    }
}
