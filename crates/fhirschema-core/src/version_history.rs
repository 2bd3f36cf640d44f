//! Per-object version ledger.
//!
//! Rows live in `VERSION_HISTORY` in the admin schema. Reads are served from
//! an in-memory cache filled by [`VersionHistoryService::load`]. Writes go to
//! the caller's connection so the ledger row commits together with the DDL it
//! describes; the cache is only updated through
//! [`VersionHistoryService::mark_applied`] once that commit succeeded.

use std::sync::Arc;

use dashmap::DashMap;

use crate::adapter::{transaction, Connection, DialectAdapter};
use crate::bookkeeping::{self, DeleteVersions, SelectVersions, UpsertVersion, VersionedObjectRecord};
use crate::error::Result;

type Key = (String, String, String);

fn key(schema: &str, object_type: &str, object_name: &str) -> Key {
    (
        schema.to_string(),
        object_type.to_string(),
        object_name.to_string(),
    )
}

/// Durable ledger of installed object versions.
pub struct VersionHistoryService {
    adapter: Arc<dyn DialectAdapter>,
    admin_schema: String,
    cache: DashMap<Key, i32>,
}

impl VersionHistoryService {
    pub fn new(adapter: Arc<dyn DialectAdapter>, admin_schema: impl Into<String>) -> Self {
        Self {
            adapter,
            admin_schema: admin_schema.into(),
            cache: DashMap::new(),
        }
    }

    /// The admin schema holding the ledger.
    pub fn admin_schema(&self) -> &str {
        &self.admin_schema
    }

    /// Create the backing table if absent.
    pub fn init(&self) -> Result<()> {
        let table = bookkeeping::version_history_table(&self.admin_schema);
        let mut conn = self.adapter.connection()?;
        transaction(&mut *conn, |c| self.adapter.apply_object(c, &table, None))
    }

    /// Fill the cache with the ledger rows of `schemas`.
    ///
    /// Reads nothing when the backing table does not exist yet, which only
    /// happens in dry-run mode.
    pub fn load(&self, schemas: &[&str]) -> Result<()> {
        let mut conn = self.adapter.connection()?;
        if self.adapter.is_dry_run()
            && !self
                .adapter
                .table_exists(&mut *conn, &self.admin_schema, bookkeeping::VERSION_HISTORY)?
        {
            return Ok(());
        }

        for &schema in schemas {
            let records = self.adapter.run_statement(
                &mut *conn,
                &SelectVersions {
                    admin_schema: &self.admin_schema,
                    schema,
                },
            )?;
            tracing::debug!(schema, objects = records.len(), "loaded version history");
            for r in records {
                self.cache.insert(
                    (r.schema_name, r.object_type, r.object_name),
                    r.installed_version,
                );
            }
        }
        Ok(())
    }

    /// Installed version of an object, if it has ever been applied.
    pub fn get_version(&self, schema: &str, object_type: &str, object_name: &str) -> Option<i32> {
        self.cache
            .get(&key(schema, object_type, object_name))
            .map(|v| *v)
    }

    /// Upsert the ledger row on `conn`, inside the caller's transaction.
    pub fn record_version(
        &self,
        conn: &mut dyn Connection,
        schema: &str,
        object_type: &str,
        object_name: &str,
        version: i32,
    ) -> Result<()> {
        if self.adapter.is_dry_run() {
            return Ok(());
        }
        self.adapter.run_statement(
            conn,
            &UpsertVersion {
                admin_schema: &self.admin_schema,
                schema,
                object_type,
                object_name,
                version,
                applied_at: chrono::Utc::now().timestamp_millis(),
            },
        )
    }

    /// Reflect a committed [`record_version`](Self::record_version) in the cache.
    pub fn mark_applied(&self, schema: &str, object_type: &str, object_name: &str, version: i32) {
        self.cache
            .insert(key(schema, object_type, object_name), version);
    }

    /// Ledger rows of `schema` as stored in the database.
    pub fn records(&self, schema: &str) -> Result<Vec<VersionedObjectRecord>> {
        let mut conn = self.adapter.connection()?;
        self.adapter.run_statement(
            &mut *conn,
            &SelectVersions {
                admin_schema: &self.admin_schema,
                schema,
            },
        )
    }

    /// Delete every record of `schema`. Only used after a verified drop.
    pub fn clear(&self, schema: &str) -> Result<()> {
        if !self.adapter.is_dry_run() {
            let mut conn = self.adapter.connection()?;
            let deleted = transaction(&mut *conn, |c| {
                self.adapter.run_statement(
                    c,
                    &DeleteVersions {
                        admin_schema: &self.admin_schema,
                        schema,
                    },
                )
            })?;
            tracing::info!(schema, deleted, "cleared version history");
        }
        self.cache.retain(|(s, _, _), _| s != schema);
        Ok(())
    }

    /// Number of cached records.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

impl std::fmt::Debug for VersionHistoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionHistoryService")
            .field("admin_schema", &self.admin_schema)
            .field("cached", &self.cache.len())
            .finish()
    }
}
