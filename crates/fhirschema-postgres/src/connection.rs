//! Blocking connections over sqlx.
//!
//! Each connection is a single `sqlx::PgConnection` driven by a runtime
//! shared with its factory. Pooling is left to the core's `ConnectionPool`
//! so the scheduler and the lease heartbeat share one budget.

use std::sync::Arc;

use fhirschema_core::adapter::{Connection, ConnectionFactory, DbRow, DbValue};
use fhirschema_core::{Error, Result};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgRow, PgSslMode};
use sqlx::query::Query;
use sqlx::{Column, ConnectOptions, Executor, Postgres, Row, TypeInfo, ValueRef};
use tokio::runtime::Runtime;

/// Connection settings as they appear in a property file.
#[derive(Debug, Clone)]
pub struct PgSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub ssl: bool,
}

impl Default for PgSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "fhirdb".to_string(),
            user: None,
            password: None,
            ssl: false,
        }
    }
}

impl PgSettings {
    pub fn to_options(&self) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .ssl_mode(if self.ssl { PgSslMode::Require } else { PgSslMode::Prefer });
        if let Some(user) = &self.user {
            options = options.username(user);
        }
        if let Some(password) = &self.password {
            options = options.password(password);
        }
        options
    }
}

/// SQLSTATE classes and codes the engine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SqlState {
    UniqueViolation,
    Contention,
    NotReady,
    Other,
}

pub(crate) fn classify_sqlstate(code: &str) -> SqlState {
    match code {
        "23505" => SqlState::UniqueViolation,
        // serialization failure, deadlock, lock not available
        "40001" | "40P01" | "55P03" => SqlState::Contention,
        // cannot connect now, too many connections, admin shutdown
        "57P03" | "53300" | "57P01" => SqlState::NotReady,
        c if c.starts_with("08") => SqlState::NotReady,
        _ => SqlState::Other,
    }
}

/// Classify a driver error into the engine's error taxonomy.
pub fn map_sqlx_error(context: &str, err: sqlx::Error) -> Error {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            let message = format!("{}: {} ({})", context, db.message(), code);
            match classify_sqlstate(&code) {
                SqlState::UniqueViolation => Error::UniqueViolation(message),
                SqlState::Contention => Error::ConcurrentUpdate(message),
                SqlState::NotReady => Error::DatabaseNotReady(message),
                SqlState::Other => Error::data_access_with(message, err),
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed => Error::DatabaseNotReady(format!("{}: {}", context, err)),
        _ => Error::data_access_with(context.to_string(), err),
    }
}

/// Rewrite `?` placeholders to `$1, $2, ...`, leaving quoted text alone.
pub(crate) fn number_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut n = 0;
    let mut quote: Option<char> = None;
    for ch in sql.chars() {
        match (quote, ch) {
            (Some(q), c) if c == q => {
                quote = None;
                out.push(c);
            }
            (Some(_), c) => out.push(c),
            (None, '\'') | (None, '"') => {
                quote = Some(ch);
                out.push(ch);
            }
            (None, '?') => {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            }
            (None, c) => out.push(c),
        }
    }
    out
}

fn bind_all<'q>(mut query: Query<'q, Postgres, PgArguments>, params: &[DbValue]) -> Query<'q, Postgres, PgArguments> {
    for value in params {
        query = match value {
            DbValue::Null => query.bind(None::<String>),
            DbValue::Integer(v) => query.bind(*v),
            DbValue::Real(v) => query.bind(*v),
            DbValue::Text(v) => query.bind(v.clone()),
            DbValue::Boolean(v) => query.bind(*v),
        };
    }
    query
}

fn decode_cell(row: &PgRow, index: usize) -> std::result::Result<DbValue, sqlx::Error> {
    let type_name = {
        let raw = row.try_get_raw(index)?;
        if raw.is_null() {
            return Ok(DbValue::Null);
        }
        raw.type_info().name().to_string()
    };
    Ok(match type_name.as_str() {
        "INT2" => DbValue::Integer(i64::from(row.try_get::<i16, _>(index)?)),
        "INT4" => DbValue::Integer(i64::from(row.try_get::<i32, _>(index)?)),
        "INT8" => DbValue::Integer(row.try_get::<i64, _>(index)?),
        "FLOAT4" => DbValue::Real(f64::from(row.try_get::<f32, _>(index)?)),
        "FLOAT8" => DbValue::Real(row.try_get::<f64, _>(index)?),
        "BOOL" => DbValue::Boolean(row.try_get::<bool, _>(index)?),
        _ => DbValue::Text(row.try_get_unchecked::<String, _>(index)?),
    })
}

fn to_db_row(row: &PgRow) -> std::result::Result<DbRow, sqlx::Error> {
    let columns: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
    let values = (0..columns.len())
        .map(|i| decode_cell(row, i))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(DbRow::new(columns, values))
}

/// Opens sqlx connections on a private runtime.
pub struct PgConnectionFactory {
    runtime: Arc<Runtime>,
    options: PgConnectOptions,
}

impl PgConnectionFactory {
    pub fn new(options: PgConnectOptions) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("fhirschema-pg")
            .enable_all()
            .build()
            .map_err(|e| Error::data_access_with("starting the postgres driver runtime", e))?;
        Ok(Self {
            runtime: Arc::new(runtime),
            options: options.disable_statement_logging(),
        })
    }

    /// Factory for a `postgres://` URL.
    pub fn from_url(url: &str) -> Result<Self> {
        let options: PgConnectOptions = url
            .parse()
            .map_err(|e| Error::config(format!("invalid postgres url: {}", e)))?;
        Self::new(options)
    }

    pub fn from_settings(settings: &PgSettings) -> Result<Self> {
        Self::new(settings.to_options())
    }
}

impl ConnectionFactory for PgConnectionFactory {
    fn connect(&self) -> Result<Box<dyn Connection>> {
        let conn = self
            .runtime
            .block_on(self.options.connect())
            .map_err(|e| map_sqlx_error("connecting", e))?;
        Ok(Box::new(PgConnection {
            runtime: Arc::clone(&self.runtime),
            conn,
            in_transaction: false,
            broken: false,
        }))
    }

    fn describe(&self) -> String {
        format!(
            "postgresql://{}@{}:{}/{}",
            self.options.get_username(),
            self.options.get_host(),
            self.options.get_port(),
            self.options.get_database().unwrap_or("")
        )
    }
}

/// One server connection.
pub struct PgConnection {
    runtime: Arc<Runtime>,
    conn: sqlx::PgConnection,
    in_transaction: bool,
    broken: bool,
}

impl PgConnection {
    fn check(&mut self, context: &str, err: sqlx::Error) -> Error {
        let mapped = map_sqlx_error(context, err);
        if matches!(mapped, Error::DatabaseNotReady(_)) {
            self.broken = true;
        }
        mapped
    }

    fn simple(&mut self, sql: &str) -> Result<()> {
        let outcome = self.runtime.block_on(self.conn.execute(sqlx::raw_sql(sql)));
        match outcome {
            Ok(_) => Ok(()),
            Err(e) => Err(self.check(sql, e)),
        }
    }
}

impl Connection for PgConnection {
    fn execute(&mut self, sql: &str, params: &[DbValue]) -> Result<u64> {
        let outcome = if params.is_empty() {
            // simple protocol: routine bodies may hold several statements
            self.runtime.block_on(self.conn.execute(sqlx::raw_sql(sql)))
        } else {
            let numbered = number_placeholders(sql);
            let query = bind_all(sqlx::query(&numbered), params);
            self.runtime.block_on(query.execute(&mut self.conn))
        };
        match outcome {
            Ok(result) => Ok(result.rows_affected()),
            Err(e) => Err(self.check(sql, e)),
        }
    }

    fn query(&mut self, sql: &str, params: &[DbValue]) -> Result<Vec<DbRow>> {
        let numbered = number_placeholders(sql);
        let query = bind_all(sqlx::query(&numbered), params);
        let outcome = self.runtime.block_on(query.fetch_all(&mut self.conn));
        let rows = match outcome {
            Ok(rows) => rows,
            Err(e) => return Err(self.check(sql, e)),
        };
        rows.iter()
            .map(|r| to_db_row(r).map_err(|e| map_sqlx_error("decoding row", e)))
            .collect()
    }

    fn begin(&mut self) -> Result<()> {
        self.simple("BEGIN")?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let outcome = self.simple("COMMIT");
        self.in_transaction = false;
        outcome
    }

    fn rollback(&mut self) -> Result<()> {
        let outcome = self.simple("ROLLBACK");
        self.in_transaction = false;
        outcome
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn is_healthy(&self) -> bool {
        !self.broken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_are_numbered() {
        assert_eq!(
            number_placeholders("UPDATE T SET A = ? WHERE B = ? AND C = '?'"),
            "UPDATE T SET A = $1 WHERE B = $2 AND C = '?'"
        );
        assert_eq!(number_placeholders("SELECT 1"), "SELECT 1");
    }

    #[test]
    fn test_sqlstate_classification() {
        assert_eq!(classify_sqlstate("23505"), SqlState::UniqueViolation);
        assert_eq!(classify_sqlstate("40P01"), SqlState::Contention);
        assert_eq!(classify_sqlstate("08006"), SqlState::NotReady);
        assert_eq!(classify_sqlstate("57P03"), SqlState::NotReady);
        assert_eq!(classify_sqlstate("42P01"), SqlState::Other);
    }

    #[test]
    fn test_settings_to_options() {
        let settings = PgSettings {
            host: "db.internal".into(),
            port: 6432,
            database: "fhir".into(),
            user: Some("fhiradmin".into()),
            password: Some("secret".into()),
            ssl: true,
        };
        let options = settings.to_options();
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 6432);
        assert_eq!(options.get_database(), Some("fhir"));
        assert_eq!(options.get_username(), "fhiradmin");
    }
}
