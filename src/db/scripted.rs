//! In-memory `Connection` double for adapter tests.
//!
//! Replies are chosen by the first rule whose needle occurs in the SQL text.
//! Unmatched statements succeed: `execute` reports one affected row and
//! `query` returns no rows.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use super::query::{Connection, SqlRow, Statement};
use crate::dialect::Dialect;
use crate::error::DriverError;

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Rows(Vec<SqlRow>),
    Affected(u64),
    Fail(DriverError),
}

#[derive(Debug)]
struct Rule {
    needle: String,
    reply: Reply,
    once: bool,
}

#[derive(Debug, Default)]
struct Script {
    rules: Vec<Rule>,
    log: Vec<Statement>,
}

/// Handle kept by the test after the connection is moved into an adapter.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptHandle {
    inner: Arc<Mutex<Script>>,
}

impl ScriptHandle {
    /// Reply to every statement containing `needle`.
    pub fn on(&self, needle: &str, reply: Reply) -> &Self {
        self.push(needle, reply, false)
    }

    /// Reply once, then fall through to later rules.
    pub fn once(&self, needle: &str, reply: Reply) -> &Self {
        self.push(needle, reply, true)
    }

    fn push(&self, needle: &str, reply: Reply, once: bool) -> &Self {
        self.inner.lock().rules.push(Rule {
            needle: needle.to_string(),
            reply,
            once,
        });
        self
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.inner.lock().log.clone()
    }

    pub fn sql(&self) -> Vec<String> {
        self.inner.lock().log.iter().map(|s| s.sql.clone()).collect()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.inner
            .lock()
            .log
            .iter()
            .filter(|s| s.sql.contains(needle))
            .count()
    }

    pub fn clear_log(&self) {
        self.inner.lock().log.clear();
    }

    fn respond(&self, stmt: &Statement) -> Option<Reply> {
        let mut script = self.inner.lock();
        script.log.push(stmt.clone());
        let idx = script
            .rules
            .iter()
            .position(|r| stmt.sql.contains(&r.needle))?;
        if script.rules[idx].once {
            Some(script.rules.remove(idx).reply)
        } else {
            Some(script.rules[idx].reply.clone())
        }
    }
}

pub(crate) struct ScriptedConnection {
    dialect: Dialect,
    handle: ScriptHandle,
}

impl ScriptedConnection {
    pub fn new(dialect: Dialect) -> (Self, ScriptHandle) {
        let handle = ScriptHandle::default();
        (
            Self {
                dialect,
                handle: handle.clone(),
            },
            handle,
        )
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn execute(&mut self, stmt: &Statement) -> Result<u64, DriverError> {
        match self.handle.respond(stmt) {
            None => Ok(1),
            Some(Reply::Affected(n)) => Ok(n),
            Some(Reply::Rows(rows)) => Ok(rows.len() as u64),
            Some(Reply::Fail(err)) => Err(err),
        }
    }

    async fn query(&mut self, stmt: &Statement) -> Result<Vec<SqlRow>, DriverError> {
        match self.handle.respond(stmt) {
            None | Some(Reply::Affected(_)) => Ok(Vec::new()),
            Some(Reply::Rows(rows)) => Ok(rows),
            Some(Reply::Fail(err)) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqlValue;

    #[tokio::test]
    async fn test_rules_match_in_order_and_once_expires() {
        let (mut conn, handle) = ScriptedConnection::new(Dialect::Postgres);
        handle
            .once("SELECT", Reply::Rows(vec![SqlRow::new().with("n", SqlValue::Int(1))]))
            .on("SELECT", Reply::Rows(Vec::new()));

        let first = conn.query(&Statement::new("SELECT 1")).await.unwrap();
        let second = conn.query(&Statement::new("SELECT 1")).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(handle.count("SELECT"), 2);
    }

    #[tokio::test]
    async fn test_failures_and_defaults() {
        let (mut conn, handle) = ScriptedConnection::new(Dialect::MySql);
        handle.on("INSERT", Reply::Fail(DriverError::server("1062", "dup")));

        let err = conn.execute(&Statement::new("INSERT INTO t")).await.unwrap_err();
        assert_eq!(err.code.as_deref(), Some("1062"));
        assert_eq!(conn.execute(&Statement::new("DELETE FROM t")).await.unwrap(), 1);
        assert!(conn.ping().await.is_ok());
    }
}
