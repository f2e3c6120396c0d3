use anyhow::{Context, Result};
use async_trait::async_trait;
use tiberius::{Client, ColumnData, Config, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use super::connection::{ConnectionConfig, CONNECT_TIMEOUT};
use super::query::{Connection, SqlParam, SqlRow, SqlValue, Statement};
use crate::dialect::Dialect;
use crate::error::DriverError;

pub type MssqlClient = Client<Compat<TcpStream>>;

#[async_trait]
impl Connection for MssqlClient {
    fn dialect(&self) -> Dialect {
        Dialect::Mssql
    }

    async fn execute(&mut self, stmt: &Statement) -> Result<u64, DriverError> {
        let params = bind_params(&stmt.params);
        let refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let result = Client::execute(self, stmt.sql.as_str(), &refs)
            .await
            .map_err(driver_error)?;
        Ok(result.total())
    }

    async fn query(&mut self, stmt: &Statement) -> Result<Vec<SqlRow>, DriverError> {
        let params = bind_params(&stmt.params);
        let refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = Client::query(self, stmt.sql.as_str(), &refs)
            .await
            .map_err(driver_error)?
            .into_first_result()
            .await
            .map_err(driver_error)?;
        Ok(rows.into_iter().map(convert_row).collect())
    }
}

fn bind_params(params: &[SqlParam]) -> Vec<Box<dyn ToSql>> {
    params
        .iter()
        .map(|p| -> Box<dyn ToSql> {
            match p {
                SqlParam::Null => Box::new(Option::<String>::None),
                SqlParam::Int(i) => Box::new(*i),
                SqlParam::Float(f) => Box::new(*f),
                SqlParam::Text(s) => Box::new(s.clone()),
                SqlParam::Json(v) => Box::new(v.to_string()),
            }
        })
        .collect()
}

fn driver_error(err: tiberius::error::Error) -> DriverError {
    use tiberius::error::Error;
    match err {
        Error::Server(token) => DriverError::server(token.code().to_string(), token.message()),
        Error::Io { .. } | Error::Tls(_) | Error::Routing { .. } => {
            DriverError::transport(err.to_string())
        }
        other => DriverError::other(other.to_string()),
    }
}

fn convert_row(row: tiberius::Row) -> SqlRow {
    let names: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
    let mut out = SqlRow::new();
    for (name, data) in names.into_iter().zip(row) {
        out.push(name, convert_value(data));
    }
    out
}

fn convert_value(data: ColumnData<'static>) -> SqlValue {
    match data {
        ColumnData::U8(v) => v.map(|v| SqlValue::Int(v.into())),
        ColumnData::I16(v) => v.map(|v| SqlValue::Int(v.into())),
        ColumnData::I32(v) => v.map(|v| SqlValue::Int(v.into())),
        ColumnData::I64(v) => v.map(SqlValue::Int),
        ColumnData::F32(v) => v.map(|v| SqlValue::Float(v.into())),
        ColumnData::F64(v) => v.map(SqlValue::Float),
        ColumnData::Bit(v) => v.map(SqlValue::Bool),
        ColumnData::String(v) => v.map(|s| SqlValue::Text(s.into_owned())),
        ColumnData::Guid(v) => v.map(|g| SqlValue::Text(g.to_string())),
        ColumnData::Binary(v) => v.map(|b| SqlValue::Bytes(b.into_owned())),
        ColumnData::Numeric(v) => v.map(|n| SqlValue::Float(f64::from(n))),
        other => Some(SqlValue::Text(format!("{:?}", other))),
    }
    .unwrap_or(SqlValue::Null)
}

/// Open a SQL Server client over TCP.
pub async fn create_client(config: &ConnectionConfig) -> Result<MssqlClient> {
    let mut tds = Config::from_ado_string(&config.connection_string()?)
        .context("Invalid SQL Server connection settings")?;
    if let Some(ca_path) = &config.ca_cert_path {
        tds.trust_cert_ca(ca_path);
    }

    let connect = async {
        let tcp = TcpStream::connect(tds.get_addr()).await?;
        tcp.set_nodelay(true)?;
        let client = Client::connect(tds, tcp.compat_write()).await?;
        anyhow::Ok(client)
    };

    let client = tokio::time::timeout(CONNECT_TIMEOUT, connect)
        .await
        .map_err(|_| anyhow::anyhow!("Connection timed out after 15s"))?
        .context("Failed to connect to SQL Server")?;

    Ok(client)
}
