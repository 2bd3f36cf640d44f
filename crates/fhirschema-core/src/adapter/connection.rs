//! Blocking connection contract implemented by each dialect driver.

use super::translator::Translator;
use super::value::{DbRow, DbValue, FromDbValue};
use crate::error::{Error, Result};

/// A single blocking database connection.
///
/// Statements use `?` placeholders; drivers with a different placeholder
/// style rewrite them before execution.
pub trait Connection: Send {
    /// Execute a statement, returning the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[DbValue]) -> Result<u64>;

    /// Run a query and return all rows.
    fn query(&mut self, sql: &str, params: &[DbValue]) -> Result<Vec<DbRow>>;

    /// Start a transaction.
    fn begin(&mut self) -> Result<()>;

    /// Commit the current transaction.
    fn commit(&mut self) -> Result<()>;

    /// Roll back the current transaction.
    fn rollback(&mut self) -> Result<()>;

    /// Whether a transaction is open on this connection.
    fn in_transaction(&self) -> bool;

    /// Whether the connection can be handed out again.
    fn is_healthy(&self) -> bool {
        true
    }
}

impl<'a> dyn Connection + 'a {
    /// Query and return the first row, if any.
    pub fn query_optional(&mut self, sql: &str, params: &[DbValue]) -> Result<Option<DbRow>> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    /// Query a single scalar value from the first column of the first row.
    pub fn query_scalar<T: FromDbValue>(&mut self, sql: &str, params: &[DbValue]) -> Result<T> {
        let row = self
            .query_optional(sql, params)?
            .ok_or_else(|| Error::data_access("expected one row, got none"))?;
        row.get(0)
    }
}

/// Opens new connections for the pool.
pub trait ConnectionFactory: Send + Sync {
    /// Open a new connection.
    fn connect(&self) -> Result<Box<dyn Connection>>;

    /// Human-readable target description for logs (no credentials).
    fn describe(&self) -> String;
}

/// Run `op` inside a transaction on `conn`.
///
/// Commits on success and rolls back on error. A rollback failure is logged
/// and the original error is returned.
pub fn transaction<T, F>(conn: &mut dyn Connection, op: F) -> Result<T>
where
    F: FnOnce(&mut dyn Connection) -> Result<T>,
{
    conn.begin()?;
    match op(conn) {
        Ok(value) => {
            conn.commit()?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = conn.rollback() {
                tracing::warn!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

/// A typed statement run against a connection with the dialect translator.
pub trait Command {
    /// Value produced by the statement.
    type Output;

    /// Run the statement.
    fn run(&self, translator: &dyn Translator, conn: &mut dyn Connection) -> Result<Self::Output>;
}
