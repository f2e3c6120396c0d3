mod connection;
#[cfg(feature = "mssql")]
mod mssql;
#[cfg(feature = "mysql")]
mod mysql;
#[cfg(feature = "postgres")]
mod postgres;
mod query;
#[cfg(test)]
pub(crate) mod scripted;

pub use connection::*;
#[cfg(feature = "mssql")]
pub use mssql::MssqlClient;
pub use query::*;
