//! Logical schemas and numbered data migrations.

use crate::adapter::{transaction, Connection, DbValue, DialectAdapter, PooledConnection, Translator};
use crate::error::{Error, Result};
use crate::model::{PhysicalDataModel, Tag};

/// Object type under which applied migration steps are ledgered.
pub const MIGRATION_OBJECT_TYPE: &str = "MIGRATION";

/// Ledger name of the step with `version`, e.g. `V0003`.
pub fn step_name(version: i32) -> String {
    format!("V{:04}", version)
}

/// A deployable schema: its objects, its whole-schema version and the data
/// migrations that lead up to that version.
pub trait LogicalSchema: Send + Sync {
    /// Short name used in logs, such as `data` or `oauth`.
    fn name(&self) -> &str;

    /// The database schema the objects live in.
    fn schema_name(&self) -> &str;

    /// Whole-schema version this release deploys.
    fn latest_version(&self) -> i32;

    /// Add this schema's objects to `model`.
    fn build(&self, model: &mut PhysicalDataModel) -> Result<()>;

    /// Tag selecting this schema's objects when several share a model.
    fn tag(&self) -> Option<Tag> {
        None
    }

    /// Numbered data migrations, in any order.
    fn migrations(&self) -> Vec<Box<dyn MigrationStep>> {
        Vec::new()
    }

    /// Seed rows the server expects, after the objects are in place.
    /// Must be idempotent; runs on every deployment pass.
    fn load_reference_data(&self, _ctx: &MigrationContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// A one-shot data transformation tied to a schema version boundary.
///
/// A step runs once per schema, only when the installed whole-schema version
/// is below [`version`](Self::version). Steps that touch many rows should
/// commit per unit of work so a retry does not redo finished units.
pub trait MigrationStep: Send + Sync {
    fn version(&self) -> i32;

    fn description(&self) -> &str;

    /// Refuse to run by returning [`Error::ValidationFailure`].
    fn precondition(&self, _ctx: &MigrationContext<'_>) -> Result<()> {
        Ok(())
    }

    fn apply(&self, ctx: &MigrationContext<'_>) -> Result<()>;
}

/// What a migration step or reference-data loader may touch.
pub struct MigrationContext<'a> {
    adapter: &'a dyn DialectAdapter,
    schema: &'a str,
    installed_version: i32,
}

impl<'a> MigrationContext<'a> {
    pub fn new(adapter: &'a dyn DialectAdapter, schema: &'a str, installed_version: i32) -> Self {
        Self {
            adapter,
            schema,
            installed_version,
        }
    }

    pub fn adapter(&self) -> &'a dyn DialectAdapter {
        self.adapter
    }

    pub fn schema(&self) -> &'a str {
        self.schema
    }

    /// Whole-schema version found before this pass began.
    pub fn installed_version(&self) -> i32 {
        self.installed_version
    }

    pub fn translator(&self) -> &'a dyn Translator {
        self.adapter.translator()
    }

    /// `table` qualified with the target schema.
    pub fn qualified(&self, table: &str) -> String {
        self.translator().qualified(self.schema, table)
    }

    pub fn connection(&self) -> Result<PooledConnection> {
        self.adapter.connection()
    }

    /// Run `op` in its own transaction on a pooled connection.
    pub fn transaction<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut dyn Connection) -> Result<T>,
    {
        let mut conn = self.adapter.connection()?;
        transaction(&mut *conn, op)
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        let mut conn = self.adapter.connection()?;
        self.adapter.table_exists(&mut *conn, self.schema, table)
    }

    /// Row count of `table`, optionally restricted by a `WHERE` clause.
    pub fn count_rows(&self, table: &str, filter: Option<&str>, params: &[DbValue]) -> Result<i64> {
        let mut sql = format!("SELECT COUNT(*) FROM {}", self.qualified(table));
        if let Some(filter) = filter {
            sql.push_str(" WHERE ");
            sql.push_str(filter);
        }
        let mut conn = self.adapter.connection()?;
        conn.query_scalar(&sql, params)
    }

    /// Fail with [`Error::ValidationFailure`] unless `condition` holds.
    pub fn require(&self, condition: bool, message: impl FnOnce() -> String) -> Result<()> {
        if condition {
            Ok(())
        } else {
            Err(Error::validation(message()))
        }
    }
}

impl std::fmt::Debug for MigrationContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationContext")
            .field("db_type", &self.adapter.db_type())
            .field("schema", &self.schema)
            .field("installed_version", &self.installed_version)
            .finish()
    }
}
