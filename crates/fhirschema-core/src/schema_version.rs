//! Whole-schema version ledger.
//!
//! One row per target schema answers "is there anything to do at all", so an
//! up-to-date schema never pays for building and scanning the object graph.

use std::sync::Arc;

use crate::adapter::{transaction, DialectAdapter};
use crate::bookkeeping::{
    self, InsertSchemaVersion, RaiseSchemaVersion, SelectSchemaVersion,
};
use crate::error::{Error, Result};

/// Version reported for a schema that has never been deployed.
pub const NOT_BUILT: i32 = -1;

/// Reads and raises the `WHOLE_SCHEMA_VERSION` row of one schema.
pub struct SchemaVersionManager {
    adapter: Arc<dyn DialectAdapter>,
    schema: String,
    latest: i32,
}

impl SchemaVersionManager {
    /// Manager for `schema` whose newest known version is `latest`.
    pub fn new(adapter: Arc<dyn DialectAdapter>, schema: impl Into<String>, latest: i32) -> Self {
        Self {
            adapter,
            schema: schema.into(),
            latest,
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// The version this release deploys.
    pub fn latest_version(&self) -> i32 {
        self.latest
    }

    /// Create the backing table if absent.
    pub fn init(&self) -> Result<()> {
        let table = bookkeeping::whole_schema_version_table(&self.schema);
        let mut conn = self.adapter.connection()?;
        transaction(&mut *conn, |c| self.adapter.apply_object(c, &table, None))
    }

    /// Installed whole-schema version, or [`NOT_BUILT`].
    pub fn get_version_for_schema(&self) -> Result<i32> {
        let mut conn = self.adapter.connection()?;
        if !self
            .adapter
            .table_exists(&mut *conn, &self.schema, bookkeeping::WHOLE_SCHEMA_VERSION)?
        {
            return Ok(NOT_BUILT);
        }
        let version = self
            .adapter
            .run_statement(&mut *conn, &SelectSchemaVersion { schema: &self.schema })?;
        Ok(version.unwrap_or(NOT_BUILT))
    }

    /// Record [`latest_version`](Self::latest_version) as installed.
    ///
    /// The stored value is only ever raised. Calling this when a newer
    /// release already deployed the schema leaves the row untouched.
    pub fn update_schema_version(&self) -> Result<()> {
        if self.adapter.is_dry_run() {
            tracing::info!(schema = %self.schema, version = self.latest, "dry run, schema version not recorded");
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp_millis();
        let mut conn = self.adapter.connection()?;
        let outcome = transaction(&mut *conn, |c| {
            let raised = self.adapter.run_statement(
                c,
                &RaiseSchemaVersion {
                    schema: &self.schema,
                    version: self.latest,
                    updated_at: now,
                },
            )?;
            if raised > 0 {
                return Ok(true);
            }
            match self
                .adapter
                .run_statement(c, &SelectSchemaVersion { schema: &self.schema })?
            {
                Some(_) => Ok(false),
                None => {
                    self.adapter.run_statement(
                        c,
                        &InsertSchemaVersion {
                            schema: &self.schema,
                            version: self.latest,
                            updated_at: now,
                        },
                    )?;
                    Ok(true)
                }
            }
        });

        match outcome {
            Ok(true) => {
                tracing::info!(schema = %self.schema, version = self.latest, "schema version updated");
                Ok(())
            }
            Ok(false) => {
                tracing::debug!(schema = %self.schema, version = self.latest, "schema version already current");
                Ok(())
            }
            Err(Error::UniqueViolation(msg)) => Err(Error::ConcurrentUpdate(format!(
                "schema version row for {} was created concurrently: {}",
                self.schema, msg
            ))),
            Err(e) => Err(e),
        }
    }

    /// Whether the installed version is below the latest.
    pub fn is_schema_old(&self) -> Result<bool> {
        Ok(self.get_version_for_schema()? < self.latest)
    }

    /// Whether the installed version equals the latest.
    pub fn is_schema_version_match(&self) -> Result<bool> {
        Ok(self.get_version_for_schema()? == self.latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::PoolConfig;
    use crate::embedded::SqliteAdapter;

    fn setup(dir: &tempfile::TempDir) -> Arc<dyn DialectAdapter> {
        let adapter: Arc<dyn DialectAdapter> = Arc::new(SqliteAdapter::new(
            dir.path().join("fhir.db"),
            PoolConfig::new(2),
            false,
        ));
        let mut conn = adapter.connection().unwrap();
        adapter.create_schema(&mut *conn, "FHIRDATA").unwrap();
        adapter
    }

    #[test]
    fn test_missing_table_is_not_built() {
        let dir = tempfile::tempdir().unwrap();
        let svm = SchemaVersionManager::new(setup(&dir), "FHIRDATA", 3);
        assert_eq!(svm.get_version_for_schema().unwrap(), NOT_BUILT);
        assert!(svm.is_schema_old().unwrap());
        assert!(!svm.is_schema_version_match().unwrap());
    }

    #[test]
    fn test_update_then_match() {
        let dir = tempfile::tempdir().unwrap();
        let svm = SchemaVersionManager::new(setup(&dir), "FHIRDATA", 3);
        svm.init().unwrap();
        assert_eq!(svm.get_version_for_schema().unwrap(), NOT_BUILT);

        svm.update_schema_version().unwrap();
        assert_eq!(svm.get_version_for_schema().unwrap(), 3);
        assert!(svm.is_schema_version_match().unwrap());
        assert!(!svm.is_schema_old().unwrap());

        // idempotent
        svm.update_schema_version().unwrap();
        assert_eq!(svm.get_version_for_schema().unwrap(), 3);
    }

    #[test]
    fn test_version_never_decreases() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = setup(&dir);

        let newer = SchemaVersionManager::new(adapter.clone(), "FHIRDATA", 5);
        newer.init().unwrap();
        newer.update_schema_version().unwrap();

        let older = SchemaVersionManager::new(adapter.clone(), "FHIRDATA", 2);
        older.update_schema_version().unwrap();
        assert_eq!(older.get_version_for_schema().unwrap(), 5);
        assert!(!older.is_schema_old().unwrap());
        assert!(!older.is_schema_version_match().unwrap());

        let newest = SchemaVersionManager::new(adapter, "FHIRDATA", 7);
        newest.update_schema_version().unwrap();
        assert_eq!(newest.get_version_for_schema().unwrap(), 7);
    }
}
