use anyhow::{Context, Result};
use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, OptsBuilder, Params, Row, SslOpts, Value};

use super::connection::{ConnectionConfig, SslMode, CONNECT_TIMEOUT};
use super::query::{Connection, SqlParam, SqlRow, SqlValue, Statement};
use crate::dialect::Dialect;
use crate::error::DriverError;

#[async_trait]
impl Connection for Conn {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    async fn execute(&mut self, stmt: &Statement) -> Result<u64, DriverError> {
        // DDL goes over the text protocol; not every statement can be prepared.
        if stmt.params.is_empty() {
            self.query_drop(stmt.sql.as_str())
                .await
                .map_err(driver_error)?;
        } else {
            self.exec_drop(stmt.sql.as_str(), bind_params(&stmt.params))
                .await
                .map_err(driver_error)?;
        }
        Ok(self.affected_rows())
    }

    async fn query(&mut self, stmt: &Statement) -> Result<Vec<SqlRow>, DriverError> {
        let rows: Vec<Row> = if stmt.params.is_empty() {
            Queryable::query(self, stmt.sql.as_str())
                .await
                .map_err(driver_error)?
        } else {
            self.exec(stmt.sql.as_str(), bind_params(&stmt.params))
                .await
                .map_err(driver_error)?
        };
        Ok(rows.into_iter().map(convert_row).collect())
    }

    async fn ping(&mut self) -> Result<(), DriverError> {
        Queryable::ping(self).await.map_err(driver_error)
    }
}

fn bind_params(params: &[SqlParam]) -> Params {
    Params::Positional(
        params
            .iter()
            .map(|p| match p {
                SqlParam::Null => Value::NULL,
                SqlParam::Int(i) => Value::Int(*i),
                SqlParam::Float(f) => Value::Double(*f),
                SqlParam::Text(s) => Value::Bytes(s.as_bytes().to_vec()),
                SqlParam::Json(v) => Value::Bytes(v.to_string().into_bytes()),
            })
            .collect(),
    )
}

fn driver_error(err: mysql_async::Error) -> DriverError {
    match err {
        mysql_async::Error::Server(server) => {
            DriverError::server(server.code.to_string(), server.message)
        }
        mysql_async::Error::Io(io) => DriverError::transport(io.to_string()),
        other => DriverError::other(other.to_string()),
    }
}

fn convert_row(mut row: Row) -> SqlRow {
    let names: Vec<String> = row
        .columns_ref()
        .iter()
        .map(|c| c.name_str().into_owned())
        .collect();
    let mut out = SqlRow::new();
    for (i, name) in names.into_iter().enumerate() {
        let value = row.take::<Value, usize>(i).unwrap_or(Value::NULL);
        out.push(name, convert_value(value));
    }
    out
}

fn convert_value(value: Value) -> SqlValue {
    match value {
        Value::NULL => SqlValue::Null,
        Value::Int(i) => SqlValue::Int(i),
        Value::UInt(u) => i64::try_from(u)
            .map(SqlValue::Int)
            .unwrap_or(SqlValue::Float(u as f64)),
        Value::Float(f) => SqlValue::Float(f.into()),
        Value::Double(f) => SqlValue::Float(f),
        Value::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(text) => SqlValue::Text(text),
            Err(e) => SqlValue::Bytes(e.into_bytes()),
        },
        Value::Date(y, mo, d, h, mi, s, us) => SqlValue::Text(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
            y, mo, d, h, mi, s, us
        )),
        Value::Time(neg, days, h, mi, s, us) => SqlValue::Text(format!(
            "{}{}:{:02}:{:02}.{:06}",
            if neg { "-" } else { "" },
            u32::from(h) + days * 24,
            mi,
            s,
            us
        )),
    }
}

/// Open a MySQL connection.
pub async fn create_conn(config: &ConnectionConfig) -> Result<Conn> {
    let opts = Opts::from_url(&config.connection_string()?)
        .map_err(|e| anyhow::anyhow!("Invalid MySQL connection settings: {}", e))?;

    let mut builder = OptsBuilder::from_opts(opts);
    if config.ssl_mode != SslMode::Disable {
        let lenient = config.accept_invalid_certs && !config.ssl_mode.is_strict();
        let ssl = SslOpts::default()
            .with_danger_accept_invalid_certs(lenient)
            .with_danger_skip_domain_validation(lenient || config.ssl_mode == SslMode::VerifyCa);
        builder = builder.ssl_opts(ssl);
    }

    let conn = tokio::time::timeout(CONNECT_TIMEOUT, Conn::new(builder))
        .await
        .map_err(|_| anyhow::anyhow!("Connection timed out after 15s"))?
        .context("Failed to connect to MySQL")?;

    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_params_positional() {
        let Params::Positional(values) = bind_params(&[
            SqlParam::Null,
            SqlParam::Int(7),
            SqlParam::text("x"),
            SqlParam::Json(serde_json::json!({"a": 1})),
        ]) else {
            panic!("expected positional params");
        };
        assert_eq!(values[0], Value::NULL);
        assert_eq!(values[1], Value::Int(7));
        assert_eq!(values[2], Value::Bytes(b"x".to_vec()));
        assert_eq!(values[3], Value::Bytes(br#"{"a":1}"#.to_vec()));
    }

    #[test]
    fn test_convert_value_bytes() {
        assert_eq!(
            convert_value(Value::Bytes(b"abc".to_vec())),
            SqlValue::Text("abc".into())
        );
        assert_eq!(
            convert_value(Value::Bytes(vec![0xff, 0xfe])),
            SqlValue::Bytes(vec![0xff, 0xfe])
        );
        assert_eq!(convert_value(Value::UInt(5)), SqlValue::Int(5));
        assert_eq!(convert_value(Value::NULL), SqlValue::Null);
    }
}
