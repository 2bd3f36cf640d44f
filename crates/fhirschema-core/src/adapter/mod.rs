//! Dialect adapter contract.
//!
//! The deployment engine never embeds dialect SQL. Everything it needs from a
//! database family goes through [`DialectAdapter`] and its [`Translator`]:
//!
//! - schema lifecycle (`create_schema`, `drop_schema`, `grant_schema_usage`)
//! - object lifecycle (`apply_object`, `drop_object`, `grant_object`)
//! - catalog inspection (`list_schema_objects`, `check_compatibility`)
//! - dialect hooks that only the distributed dialect overrides
//!
//! Dry-run is a constructor flag on each adapter. When set, [`DialectAdapter::run_ddl`]
//! logs statements instead of executing them.

pub mod connection;
pub mod pool;
pub mod translator;
pub mod value;

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

pub use connection::{transaction, Command, Connection, ConnectionFactory};
pub use pool::{ConnectionPool, PoolConfig, PooledConnection, POOL_HEADROOM};
pub use translator::Translator;
pub use value::{DbRow, DbValue, FromDbValue};

use crate::ddl;
use crate::error::{Error, Result};
use crate::model::{ObjectKind, SchemaObject};

/// Supported database families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum DbType {
    /// Embedded, file-backed.
    Sqlite,
    /// Single-node PostgreSQL.
    Postgres,
    /// PostgreSQL with the Citus extension.
    Citus,
}

impl DbType {
    /// Name accepted on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            DbType::Sqlite => "sqlite",
            DbType::Postgres => "postgresql",
            DbType::Citus => "citus",
        }
    }

    /// Whether tables are sharded over worker nodes.
    pub fn is_distributed(&self) -> bool {
        matches!(self, DbType::Citus)
    }
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DbType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(DbType::Sqlite),
            "postgresql" | "postgres" => Ok(DbType::Postgres),
            "citus" => Ok(DbType::Citus),
            other => Err(Error::config(format!("unsupported database type '{}'", other))),
        }
    }
}

/// An object found in a schema's catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectInfo {
    /// Catalog object type, normalized to upper case (`TABLE`, `INDEX`, ...).
    pub object_type: String,
    /// Object name as stored in the catalog.
    pub name: String,
}

impl ObjectInfo {
    pub fn new(object_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into().to_ascii_uppercase(),
            name: name.into(),
        }
    }
}

/// Privileges that can be granted on schema objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Privilege {
    Select,
    Insert,
    Update,
    Delete,
    Execute,
    Usage,
}

impl Privilege {
    /// Read-write access: DML on tables, sequence usage, routine execution.
    pub const FULL: &'static [Privilege] = &[
        Privilege::Select,
        Privilege::Insert,
        Privilege::Update,
        Privilege::Delete,
        Privilege::Execute,
        Privilege::Usage,
    ];

    /// Read-only access.
    pub const READ: &'static [Privilege] = &[Privilege::Select];

    pub fn as_str(&self) -> &'static str {
        match self {
            Privilege::Select => "SELECT",
            Privilege::Insert => "INSERT",
            Privilege::Update => "UPDATE",
            Privilege::Delete => "DELETE",
            Privilege::Execute => "EXECUTE",
            Privilege::Usage => "USAGE",
        }
    }
}

/// Executes DDL and DML for one database family.
///
/// Implementations must be shareable across scheduler workers and the lease
/// heartbeat thread.
pub trait DialectAdapter: Send + Sync {
    /// The database family.
    fn db_type(&self) -> DbType;

    /// SQL fragments for this dialect.
    fn translator(&self) -> &dyn Translator;

    /// Check out a connection from the adapter's pool.
    fn connection(&self) -> Result<PooledConnection>;

    /// Whether DDL is logged instead of executed.
    fn is_dry_run(&self) -> bool;

    /// Create `schema` if it does not exist.
    fn create_schema(&self, conn: &mut dyn Connection, schema: &str) -> Result<()>;

    /// Drop the (already emptied) `schema`.
    fn drop_schema(&self, conn: &mut dyn Connection, schema: &str) -> Result<()>;

    /// Tables, indexes, sequences and routines still present in `schema`.
    fn list_schema_objects(&self, conn: &mut dyn Connection, schema: &str)
        -> Result<Vec<ObjectInfo>>;

    /// Whether the server and `schema` can be used by this release.
    fn check_compatibility(&self, conn: &mut dyn Connection, schema: &str) -> Result<bool>;

    /// Execute one DDL statement, or log it in dry-run mode.
    fn run_ddl(&self, conn: &mut dyn Connection, sql: &str) -> Result<()> {
        if self.is_dry_run() {
            tracing::info!(target: "fhirschema::dry_run", "{};", sql);
            return Ok(());
        }
        tracing::debug!(sql = %sql, "ddl");
        conn.execute(sql, &[])?;
        Ok(())
    }

    /// Allow `grantee` to resolve objects in `schema`.
    fn grant_schema_usage(&self, conn: &mut dyn Connection, schema: &str, grantee: &str) -> Result<()> {
        if !self.translator().supports_grants() {
            tracing::debug!(schema, grantee, "dialect has no grants, skipping schema usage");
            return Ok(());
        }
        let t = self.translator();
        self.run_ddl(
            conn,
            &format!("GRANT USAGE ON SCHEMA {} TO {}", t.quote(schema), t.quote(grantee)),
        )
    }

    /// Bring `obj` up to its declared version.
    ///
    /// `prior` is the installed version from the ledger; tables use it to add
    /// only the columns and indexes introduced after it.
    fn apply_object(&self, conn: &mut dyn Connection, obj: &SchemaObject, prior: Option<i32>) -> Result<()> {
        for statement in ddl::render_apply(self.translator(), obj, prior) {
            self.run_ddl(conn, &statement)?;
        }
        Ok(())
    }

    /// Drop `obj` if it exists.
    fn drop_object(&self, conn: &mut dyn Connection, obj: &SchemaObject) -> Result<()> {
        for statement in ddl::render_drop(self.translator(), obj) {
            self.run_ddl(conn, &statement)?;
        }
        Ok(())
    }

    /// Grant the applicable subset of `privileges` on `obj` to `grantee`.
    fn grant_object(
        &self,
        conn: &mut dyn Connection,
        obj: &SchemaObject,
        privileges: &[Privilege],
        grantee: &str,
    ) -> Result<()> {
        for statement in ddl::render_grant(self.translator(), obj, privileges, grantee) {
            self.run_ddl(conn, &statement)?;
        }
        Ok(())
    }

    /// Whether `schema.table` exists.
    fn table_exists(&self, conn: &mut dyn Connection, schema: &str, table: &str) -> Result<bool> {
        Ok(self
            .list_schema_objects(conn, schema)?
            .iter()
            .any(|o| o.object_type == ObjectKind::Table.as_str() && o.name.eq_ignore_ascii_case(table)))
    }

    /// Distribute or replicate a table. Only the distributed dialect acts.
    fn apply_distribution_rule(&self, _conn: &mut dyn Connection, _obj: &SchemaObject) -> Result<()> {
        Ok(())
    }

    /// Whether foreign keys are added in one transaction per child table
    /// instead of together with the rest of the pass.
    fn splits_foreign_key_transactions(&self) -> bool {
        false
    }
}

impl<'a> dyn DialectAdapter + 'a {
    /// Run a typed statement with this adapter's translator.
    pub fn run_statement<C: Command>(&self, conn: &mut dyn Connection, command: &C) -> Result<C::Output> {
        command.run(self.translator(), conn)
    }
}
