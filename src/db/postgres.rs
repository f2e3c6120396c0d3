use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use postgres_native_tls::MakeTlsConnector;
use std::error::Error as StdError;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, NoTls, Row};

use super::connection::{ConnectionConfig, SslMode, CONNECT_TIMEOUT};
use super::query::{Connection, SqlParam, SqlRow, SqlValue, Statement};
use crate::dialect::Dialect;
use crate::error::DriverError;

#[async_trait]
impl Connection for Client {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn execute(&mut self, stmt: &Statement) -> Result<u64, DriverError> {
        let params = bind_params(&stmt.params);
        let refs = param_refs(&params);
        Client::execute(self, stmt.sql.as_str(), &refs)
            .await
            .map_err(|e| driver_error(&e))
    }

    async fn query(&mut self, stmt: &Statement) -> Result<Vec<SqlRow>, DriverError> {
        let params = bind_params(&stmt.params);
        let refs = param_refs(&params);
        let rows = Client::query(self, stmt.sql.as_str(), &refs)
            .await
            .map_err(|e| driver_error(&e))?;
        Ok(rows.iter().map(convert_row).collect())
    }

    async fn ping(&mut self) -> Result<(), DriverError> {
        self.simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(|e| driver_error(&e))
    }
}

type BoxedParam = Box<dyn ToSql + Sync + Send>;

fn bind_params(params: &[SqlParam]) -> Vec<BoxedParam> {
    params
        .iter()
        .map(|p| -> BoxedParam {
            match p {
                SqlParam::Null => Box::new(Option::<String>::None),
                SqlParam::Int(i) => Box::new(*i),
                SqlParam::Float(f) => Box::new(*f),
                SqlParam::Text(s) => Box::new(s.clone()),
                SqlParam::Json(v) => Box::new(v.clone()),
            }
        })
        .collect()
}

fn param_refs(params: &[BoxedParam]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

/// Convert a tokio_postgres error, keeping the SQLSTATE when the server sent one.
fn driver_error(err: &tokio_postgres::Error) -> DriverError {
    if let Some(db_err) = err.as_db_error() {
        let mut message = db_err.message().to_string();
        if let Some(detail) = db_err.detail() {
            message.push_str(": ");
            message.push_str(detail);
        }
        return DriverError::server(db_err.code().code(), message);
    }
    if is_transport(err.is_closed(), err.source()) {
        DriverError::transport(err.to_string())
    } else {
        DriverError::other(err.to_string())
    }
}

/// A closed client or an I/O source is a transport failure. Conversion
/// errors carry a source too and are not.
fn is_transport(closed: bool, source: Option<&(dyn StdError + 'static)>) -> bool {
    closed || source.is_some_and(|s| s.is::<std::io::Error>())
}

fn convert_row(row: &Row) -> SqlRow {
    let mut out = SqlRow::new();
    for (i, col) in row.columns().iter().enumerate() {
        out.push(col.name(), extract_value(row, i, col.type_()));
    }
    out
}

fn extract_value(row: &Row, idx: usize, pg_type: &Type) -> SqlValue {
    // Try to extract based on type
    match *pg_type {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Bool)
            .unwrap_or(SqlValue::Null),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(|v| SqlValue::Int(v.into()))
            .unwrap_or(SqlValue::Null),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(|v| SqlValue::Int(v.into()))
            .unwrap_or(SqlValue::Null),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Int)
            .unwrap_or(SqlValue::Null),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .map(|v| SqlValue::Float(v.into()))
            .unwrap_or(SqlValue::Null),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Float)
            .unwrap_or(SqlValue::Null),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Bytes)
            .unwrap_or(SqlValue::Null),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(|v| SqlValue::Text(v.to_string()))
            .unwrap_or(SqlValue::Null),
        Type::TIME => row
            .try_get::<_, Option<NaiveTime>>(idx)
            .ok()
            .flatten()
            .map(|v| SqlValue::Text(v.to_string()))
            .unwrap_or(SqlValue::Null),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(|v| SqlValue::Text(v.to_string()))
            .unwrap_or(SqlValue::Null),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)
            .ok()
            .flatten()
            .map(|v| SqlValue::Text(v.to_rfc3339()))
            .unwrap_or(SqlValue::Null),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Json)
            .unwrap_or(SqlValue::Null),
        _ => {
            // Fallback: try to get as string
            row.try_get::<_, Option<String>>(idx)
                .ok()
                .flatten()
                .map(SqlValue::Text)
                .unwrap_or(SqlValue::Null)
        }
    }
}

/// Open a PostgreSQL client. The connection task is spawned onto the
/// current tokio runtime.
pub async fn create_client(config: &ConnectionConfig) -> Result<Client> {
    let conn_string = config.connection_string()?;

    let client = match config.ssl_mode {
        SslMode::Disable => {
            let (client, connection) =
                tokio::time::timeout(CONNECT_TIMEOUT, tokio_postgres::connect(&conn_string, NoTls))
                    .await
                    .map_err(|_| anyhow::anyhow!("Connection timed out after 15s"))?
                    .context("Failed to connect to PostgreSQL")?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!(error = %e, "postgres connection error");
                }
            });
            client
        }
        mode => {
            let tls = build_tls_connector(config, mode.is_strict())?;
            let (client, connection) =
                tokio::time::timeout(CONNECT_TIMEOUT, tokio_postgres::connect(&conn_string, tls))
                    .await
                    .map_err(|_| anyhow::anyhow!("Connection timed out after 15s"))?
                    .context("Failed to connect to PostgreSQL")?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!(error = %e, "postgres connection error");
                }
            });
            client
        }
    };

    Ok(client)
}

/// Build a TLS connector with appropriate certificate configuration.
///
/// # Arguments
/// * `config` - Connection configuration
/// * `strict_verify` - If true, always verify certificates (for verify-ca/verify-full modes)
fn build_tls_connector(config: &ConnectionConfig, strict_verify: bool) -> Result<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if config.accept_invalid_certs && !strict_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if let Some(ca_path) = &config.ca_cert_path {
        let ca_data = std::fs::read(ca_path)
            .with_context(|| format!("Failed to read CA certificate file: {}", ca_path))?;
        for pem in split_pem_certificates(&ca_data)? {
            let cert = native_tls::Certificate::from_pem(pem.as_bytes())
                .context("Failed to parse certificate")?;
            builder.add_root_certificate(cert);
        }
    }
    // Otherwise the system trust store is used.

    let connector = builder.build().context("Failed to build TLS connector")?;

    Ok(MakeTlsConnector::new(connector))
}

/// Split a PEM bundle into individual certificate blocks.
fn split_pem_certificates(pem_data: &[u8]) -> Result<Vec<String>> {
    const END: &str = "-----END CERTIFICATE-----";
    let pem_str =
        std::str::from_utf8(pem_data).context("CA certificate file is not valid UTF-8")?;

    let certs: Vec<String> = pem_str
        .split_inclusive(END)
        .filter_map(|chunk| {
            let start = chunk.find("-----BEGIN CERTIFICATE-----")?;
            chunk.ends_with(END).then(|| chunk[start..].to_string())
        })
        .collect();

    if certs.is_empty() {
        anyhow::bail!("No valid certificates found in PEM data");
    }

    Ok(certs)
}
