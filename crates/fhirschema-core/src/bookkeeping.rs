//! Tables the deployment engine owns, and the typed statements that read and
//! write them.
//!
//! | Table | Schema | Rows |
//! |-------|--------|------|
//! | `CONTROL` | admin | one lease per target schema |
//! | `VERSION_HISTORY` | admin | one per versioned object per schema |
//! | `WHOLE_SCHEMA_VERSION` | target | exactly one |
//!
//! Timestamps are stored as epoch milliseconds so every dialect compares them
//! the same way.

use crate::adapter::{transaction, Command, Connection, DbValue, DialectAdapter, Translator};
use crate::error::Result;
use crate::model::{ColumnDef, ColumnType, SchemaObject, TableDef};

pub const CONTROL: &str = "CONTROL";
pub const VERSION_HISTORY: &str = "VERSION_HISTORY";
pub const WHOLE_SCHEMA_VERSION: &str = "WHOLE_SCHEMA_VERSION";

/// The single row of `WHOLE_SCHEMA_VERSION`.
const SCHEMA_VERSION_RECORD_ID: i32 = 1;

/// Lease table in the admin schema.
pub fn control_table(admin_schema: &str) -> SchemaObject {
    let def = TableDef::new()
        .with_column(ColumnDef::required("SCHEMA_NAME", ColumnType::Varchar(128)))
        .with_column(ColumnDef::required("LEASE_OWNER", ColumnType::Varchar(255)))
        .with_column(ColumnDef::required("ACQUIRED_AT", ColumnType::BigInt))
        .with_column(ColumnDef::required("LEASE_UNTIL", ColumnType::BigInt))
        .with_primary_key("PK_CONTROL", ["SCHEMA_NAME"]);
    SchemaObject::table(admin_schema, CONTROL, 1, def)
}

/// Per-object version ledger in the admin schema.
pub fn version_history_table(admin_schema: &str) -> SchemaObject {
    let def = TableDef::new()
        .with_column(ColumnDef::required("SCHEMA_NAME", ColumnType::Varchar(128)))
        .with_column(ColumnDef::required("OBJECT_TYPE", ColumnType::Varchar(32)))
        .with_column(ColumnDef::required("OBJECT_NAME", ColumnType::Varchar(128)))
        .with_column(ColumnDef::required("VERSION", ColumnType::Integer))
        .with_column(ColumnDef::required("APPLIED_AT", ColumnType::BigInt))
        .with_primary_key(
            "PK_VERSION_HISTORY",
            ["SCHEMA_NAME", "OBJECT_TYPE", "OBJECT_NAME"],
        );
    SchemaObject::table(admin_schema, VERSION_HISTORY, 1, def)
}

/// Whole-schema version row in the target schema.
pub fn whole_schema_version_table(schema: &str) -> SchemaObject {
    let def = TableDef::new()
        .with_column(ColumnDef::required("RECORD_ID", ColumnType::Integer))
        .with_column(ColumnDef::required("VERSION_ID", ColumnType::Integer))
        .with_column(ColumnDef::required("UPDATED_AT", ColumnType::BigInt))
        .with_primary_key("PK_WHOLE_SCHEMA_VERSION", ["RECORD_ID"]);
    SchemaObject::table(schema, WHOLE_SCHEMA_VERSION, 1, def)
}

/// Create the admin schema and its lease table when missing.
///
/// Runs before any lease is taken, so both statements must be idempotent.
pub fn ensure_admin_schema(adapter: &dyn DialectAdapter, admin_schema: &str) -> Result<()> {
    let mut conn = adapter.connection()?;
    adapter.create_schema(&mut *conn, admin_schema)?;
    let control = control_table(admin_schema);
    transaction(&mut *conn, |c| adapter.apply_object(c, &control, None))
}

/// A row of `VERSION_HISTORY`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VersionedObjectRecord {
    pub schema_name: String,
    pub object_type: String,
    pub object_name: String,
    pub installed_version: i32,
    pub applied_at: i64,
}

/// Insert or raise the ledger entry for one object.
pub struct UpsertVersion<'a> {
    pub admin_schema: &'a str,
    pub schema: &'a str,
    pub object_type: &'a str,
    pub object_name: &'a str,
    pub version: i32,
    pub applied_at: i64,
}

impl Command for UpsertVersion<'_> {
    type Output = ();

    fn run(&self, t: &dyn Translator, conn: &mut dyn Connection) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (SCHEMA_NAME, OBJECT_TYPE, OBJECT_NAME, VERSION, APPLIED_AT) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (SCHEMA_NAME, OBJECT_TYPE, OBJECT_NAME) \
             DO UPDATE SET VERSION = excluded.VERSION, APPLIED_AT = excluded.APPLIED_AT",
            t.qualified(self.admin_schema, VERSION_HISTORY)
        );
        conn.execute(
            &sql,
            &[
                self.schema.into(),
                self.object_type.into(),
                self.object_name.into(),
                self.version.into(),
                self.applied_at.into(),
            ],
        )?;
        Ok(())
    }
}

/// All ledger entries of one schema.
pub struct SelectVersions<'a> {
    pub admin_schema: &'a str,
    pub schema: &'a str,
}

impl Command for SelectVersions<'_> {
    type Output = Vec<VersionedObjectRecord>;

    fn run(&self, t: &dyn Translator, conn: &mut dyn Connection) -> Result<Self::Output> {
        let sql = format!(
            "SELECT SCHEMA_NAME, OBJECT_TYPE, OBJECT_NAME, VERSION, APPLIED_AT FROM {} \
             WHERE SCHEMA_NAME = ? ORDER BY OBJECT_TYPE, OBJECT_NAME",
            t.qualified(self.admin_schema, VERSION_HISTORY)
        );
        conn.query(&sql, &[self.schema.into()])?
            .iter()
            .map(|row| {
                Ok(VersionedObjectRecord {
                    schema_name: row.get(0)?,
                    object_type: row.get(1)?,
                    object_name: row.get(2)?,
                    installed_version: row.get(3)?,
                    applied_at: row.get(4)?,
                })
            })
            .collect()
    }
}

/// Remove every ledger entry of one schema.
pub struct DeleteVersions<'a> {
    pub admin_schema: &'a str,
    pub schema: &'a str,
}

impl Command for DeleteVersions<'_> {
    type Output = u64;

    fn run(&self, t: &dyn Translator, conn: &mut dyn Connection) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE SCHEMA_NAME = ?",
            t.qualified(self.admin_schema, VERSION_HISTORY)
        );
        conn.execute(&sql, &[self.schema.into()])
    }
}

/// Read the whole-schema version, `None` when the row is missing.
pub struct SelectSchemaVersion<'a> {
    pub schema: &'a str,
}

impl Command for SelectSchemaVersion<'_> {
    type Output = Option<i32>;

    fn run(&self, t: &dyn Translator, conn: &mut dyn Connection) -> Result<Option<i32>> {
        let sql = format!(
            "SELECT VERSION_ID FROM {} WHERE RECORD_ID = ?",
            t.qualified(self.schema, WHOLE_SCHEMA_VERSION)
        );
        match conn.query_optional(&sql, &[SCHEMA_VERSION_RECORD_ID.into()])? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }
}

/// Raise the whole-schema version. Never lowers it.
///
/// Returns the number of rows updated: zero when the row is missing or
/// already at or above `version`.
pub struct RaiseSchemaVersion<'a> {
    pub schema: &'a str,
    pub version: i32,
    pub updated_at: i64,
}

impl Command for RaiseSchemaVersion<'_> {
    type Output = u64;

    fn run(&self, t: &dyn Translator, conn: &mut dyn Connection) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET VERSION_ID = ?, UPDATED_AT = ? WHERE RECORD_ID = ? AND VERSION_ID < ?",
            t.qualified(self.schema, WHOLE_SCHEMA_VERSION)
        );
        conn.execute(
            &sql,
            &[
                self.version.into(),
                self.updated_at.into(),
                SCHEMA_VERSION_RECORD_ID.into(),
                self.version.into(),
            ],
        )
    }
}

/// Create the whole-schema version row.
pub struct InsertSchemaVersion<'a> {
    pub schema: &'a str,
    pub version: i32,
    pub updated_at: i64,
}

impl Command for InsertSchemaVersion<'_> {
    type Output = ();

    fn run(&self, t: &dyn Translator, conn: &mut dyn Connection) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (RECORD_ID, VERSION_ID, UPDATED_AT) VALUES (?, ?, ?)",
            t.qualified(self.schema, WHOLE_SCHEMA_VERSION)
        );
        conn.execute(
            &sql,
            &[
                SCHEMA_VERSION_RECORD_ID.into(),
                self.version.into(),
                self.updated_at.into(),
            ],
        )?;
        Ok(())
    }
}

/// A row of `CONTROL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRow {
    pub owner: String,
    pub acquired_at: i64,
    pub lease_until: i64,
}

/// Take over an expired lease row, or re-claim our own.
///
/// Returns the number of rows updated.
pub struct ClaimLease<'a> {
    pub admin_schema: &'a str,
    pub schema: &'a str,
    pub owner: &'a str,
    pub now: i64,
    pub lease_until: i64,
}

impl Command for ClaimLease<'_> {
    type Output = u64;

    fn run(&self, t: &dyn Translator, conn: &mut dyn Connection) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET LEASE_OWNER = ?, ACQUIRED_AT = ?, LEASE_UNTIL = ? \
             WHERE SCHEMA_NAME = ? AND (LEASE_UNTIL <= ? OR LEASE_OWNER = ?)",
            t.qualified(self.admin_schema, CONTROL)
        );
        conn.execute(
            &sql,
            &[
                self.owner.into(),
                self.now.into(),
                self.lease_until.into(),
                self.schema.into(),
                self.now.into(),
                self.owner.into(),
            ],
        )
    }
}

/// Insert a fresh lease row. Fails with a unique violation on contention.
pub struct InsertLease<'a> {
    pub admin_schema: &'a str,
    pub schema: &'a str,
    pub owner: &'a str,
    pub now: i64,
    pub lease_until: i64,
}

impl Command for InsertLease<'_> {
    type Output = ();

    fn run(&self, t: &dyn Translator, conn: &mut dyn Connection) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (SCHEMA_NAME, LEASE_OWNER, ACQUIRED_AT, LEASE_UNTIL) VALUES (?, ?, ?, ?)",
            t.qualified(self.admin_schema, CONTROL)
        );
        conn.execute(
            &sql,
            &[
                self.schema.into(),
                self.owner.into(),
                self.now.into(),
                self.lease_until.into(),
            ],
        )?;
        Ok(())
    }
}

/// Extend a lease we still hold. Returns zero when the lease was lost.
pub struct RenewLease<'a> {
    pub admin_schema: &'a str,
    pub schema: &'a str,
    pub owner: &'a str,
    pub now: i64,
    pub lease_until: i64,
}

impl Command for RenewLease<'_> {
    type Output = u64;

    fn run(&self, t: &dyn Translator, conn: &mut dyn Connection) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET LEASE_UNTIL = ? WHERE SCHEMA_NAME = ? AND LEASE_OWNER = ? AND LEASE_UNTIL > ?",
            t.qualified(self.admin_schema, CONTROL)
        );
        conn.execute(
            &sql,
            &[
                self.lease_until.into(),
                self.schema.into(),
                self.owner.into(),
                self.now.into(),
            ],
        )
    }
}

/// Delete our own lease row. Returns the number of rows deleted.
pub struct ReleaseLease<'a> {
    pub admin_schema: &'a str,
    pub schema: &'a str,
    pub owner: &'a str,
}

impl Command for ReleaseLease<'_> {
    type Output = u64;

    fn run(&self, t: &dyn Translator, conn: &mut dyn Connection) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE SCHEMA_NAME = ? AND LEASE_OWNER = ?",
            t.qualified(self.admin_schema, CONTROL)
        );
        conn.execute(&sql, &[self.schema.into(), self.owner.into()])
    }
}

/// Current lease row for a schema, if any.
pub struct SelectLease<'a> {
    pub admin_schema: &'a str,
    pub schema: &'a str,
}

impl Command for SelectLease<'_> {
    type Output = Option<LeaseRow>;

    fn run(&self, t: &dyn Translator, conn: &mut dyn Connection) -> Result<Option<LeaseRow>> {
        let sql = format!(
            "SELECT LEASE_OWNER, ACQUIRED_AT, LEASE_UNTIL FROM {} WHERE SCHEMA_NAME = ?",
            t.qualified(self.admin_schema, CONTROL)
        );
        let params: [DbValue; 1] = [self.schema.into()];
        match conn.query_optional(&sql, &params)? {
            Some(row) => Ok(Some(LeaseRow {
                owner: row.get(0)?,
                acquired_at: row.get(1)?,
                lease_until: row.get(2)?,
            })),
            None => Ok(None),
        }
    }
}
