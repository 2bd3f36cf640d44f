//! Deployment orchestrator.
//!
//! Sequences one deployment pass per logical schema: lease, bookkeeping,
//! whole-schema version check, graph apply, numbered migrations, reference
//! data, grants, version update, release.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::step::{step_name, LogicalSchema, MigrationContext, MIGRATION_OBJECT_TYPE};
use crate::adapter::{transaction, DialectAdapter, PoolConfig, Privilege};
use crate::bookkeeping;
use crate::error::{Error, Result};
use crate::lease::{LeaseConfig, LeaseManager};
use crate::model::{PhysicalDataModel, Tag};
use crate::schema_version::{SchemaVersionManager, NOT_BUILT};
use crate::version_history::VersionHistoryService;

/// Default admin schema holding the lease and version history tables.
pub const DEFAULT_ADMIN_SCHEMA: &str = "FHIR_ADMIN";

/// Deployment settings.
#[derive(Debug, Clone)]
pub struct DeployConfig {
    /// Schema holding `CONTROL` and `VERSION_HISTORY`.
    pub admin_schema: String,
    /// Requested connection pool size.
    pub pool_size: usize,
    /// Scheduler worker threads.
    pub thread_pool_size: usize,
    /// Lease timing.
    pub lease: LeaseConfig,
    /// How long to wait for a contended lease.
    pub lease_wait: Duration,
    /// Re-run the graph pass on a schema that is already current.
    pub force: bool,
    /// Log DDL instead of executing it. Adapters take the same flag.
    pub dry_run: bool,
    /// Grantee of read-write access.
    pub grant_to: Option<String>,
    /// Grantee of read-only access.
    pub grant_read_to: Option<String>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            admin_schema: DEFAULT_ADMIN_SCHEMA.to_string(),
            pool_size: 10,
            thread_pool_size: 4,
            lease: LeaseConfig::default(),
            lease_wait: Duration::from_secs(60),
            force: false,
            dry_run: false,
            grant_to: None,
            grant_read_to: None,
        }
    }
}

impl DeployConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_admin_schema(mut self, admin_schema: impl Into<String>) -> Self {
        self.admin_schema = admin_schema.into();
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_thread_pool_size(mut self, threads: usize) -> Self {
        self.thread_pool_size = threads.max(1);
        self
    }

    pub fn with_lease(mut self, lease: LeaseConfig) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_lease_wait(mut self, wait: Duration) -> Self {
        self.lease_wait = wait;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_grant_to(mut self, grantee: impl Into<String>) -> Self {
        self.grant_to = Some(grantee.into());
        self
    }

    pub fn with_grant_read_to(mut self, grantee: impl Into<String>) -> Self {
        self.grant_read_to = Some(grantee.into());
        self
    }

    /// Pool sizing for the adapter, with headroom over the worker count.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::for_workers(self.thread_pool_size, self.pool_size)
    }
}

/// What a deployment pass did to one schema.
#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    pub schema: String,
    pub previous_version: i32,
    pub version: i32,
    /// Objects whose DDL ran.
    pub objects_applied: usize,
    /// Objects the ledger already had at their declared version.
    pub objects_up_to_date: usize,
    /// Versions of the migration steps that ran.
    pub migrations_applied: Vec<i32>,
    pub forced: bool,
}

/// Result of [`MigrationOrchestrator::update_schema`].
#[derive(Debug, Clone)]
pub enum DeployOutcome {
    /// A pass ran.
    Applied(DeployReport),
    /// The installed version was already current; nothing was touched.
    UpToDate { schema: String, version: i32 },
}

impl DeployOutcome {
    pub fn schema(&self) -> &str {
        match self {
            DeployOutcome::Applied(report) => &report.schema,
            DeployOutcome::UpToDate { schema, .. } => schema,
        }
    }

    pub fn is_up_to_date(&self) -> bool {
        matches!(self, DeployOutcome::UpToDate { .. })
    }
}

/// Releases the lease when dropped, on every exit path.
struct LeaseGuard {
    manager: LeaseManager,
}

impl LeaseGuard {
    /// Fail if the lease lapsed while we worked.
    fn ensure_held(&self) -> Result<()> {
        if self.manager.has_lease() {
            Ok(())
        } else {
            Err(Error::ConcurrentUpdate(format!(
                "lease on {} lost before the pass finished",
                self.manager.schema()
            )))
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Err(e) = self.manager.cancel_lease() {
            tracing::warn!(schema = %self.manager.schema(), error = %e, "failed to release lease");
        }
    }
}

/// Runs deployments against one database.
pub struct MigrationOrchestrator {
    adapter: Arc<dyn DialectAdapter>,
    config: DeployConfig,
}

impl MigrationOrchestrator {
    pub fn new(adapter: Arc<dyn DialectAdapter>, config: DeployConfig) -> Self {
        Self { adapter, config }
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    pub fn adapter(&self) -> &Arc<dyn DialectAdapter> {
        &self.adapter
    }

    /// Build the object graph of `schemas` into one model.
    pub fn build_model(schemas: &[&dyn LogicalSchema]) -> Result<PhysicalDataModel> {
        let mut model = PhysicalDataModel::new();
        for logical in schemas {
            logical.build(&mut model)?;
        }
        Ok(model)
    }

    fn history(&self) -> VersionHistoryService {
        VersionHistoryService::new(Arc::clone(&self.adapter), self.config.admin_schema.clone())
    }

    fn acquire_lease(&self, schema: &str) -> Result<Option<LeaseGuard>> {
        if self.adapter.is_dry_run() {
            tracing::info!(schema, "dry run, not taking the lease");
            return Ok(None);
        }
        let manager = LeaseManager::new(
            Arc::clone(&self.adapter),
            self.config.admin_schema.clone(),
            schema,
            self.config.lease.clone(),
        );
        if !manager.wait_for_lease(self.config.lease_wait)? {
            let holder = manager
                .current_holder()?
                .map(|row| row.owner)
                .unwrap_or_else(|| "unknown".to_string());
            return Err(Error::ConcurrentUpdate(format!(
                "lease on {} is held by {}",
                schema, holder
            )));
        }
        Ok(Some(LeaseGuard { manager }))
    }

    fn create_schema(&self, schema: &str) -> Result<()> {
        let mut conn = self.adapter.connection()?;
        self.adapter.create_schema(&mut *conn, schema)
    }

    /// Create the admin schema, the target schemas and every bookkeeping
    /// table, without deploying any objects.
    pub fn create_schemas(&self, schemas: &[&dyn LogicalSchema]) -> Result<()> {
        bookkeeping::ensure_admin_schema(&*self.adapter, &self.config.admin_schema)?;
        self.history().init()?;
        for logical in schemas {
            let schema = logical.schema_name();
            self.create_schema(schema)?;
            SchemaVersionManager::new(Arc::clone(&self.adapter), schema, logical.latest_version()).init()?;
            tracing::info!(schema, "schema created");
        }
        Ok(())
    }

    /// Deploy each schema in turn, stopping at the first failure.
    pub fn update_schemas(&self, schemas: &[&dyn LogicalSchema]) -> Result<Vec<DeployOutcome>> {
        schemas.iter().map(|s| self.update_schema(*s)).collect()
    }

    /// Bring one logical schema up to its latest version.
    pub fn update_schema(&self, logical: &dyn LogicalSchema) -> Result<DeployOutcome> {
        let schema = logical.schema_name();
        let latest = logical.latest_version();
        let admin = self.config.admin_schema.as_str();

        bookkeeping::ensure_admin_schema(&*self.adapter, admin)?;
        let lease = self.acquire_lease(schema)?;

        let history = self.history();
        history.init()?;
        self.create_schema(schema)?;
        let svm = SchemaVersionManager::new(Arc::clone(&self.adapter), schema, latest);
        svm.init()?;

        let installed = svm.get_version_for_schema()?;
        if installed > latest {
            // force never rolls a schema back
            tracing::info!(
                schema,
                installed,
                latest,
                forced = self.config.force,
                "schema deployed by a newer release, skipping"
            );
            return Ok(DeployOutcome::UpToDate {
                schema: schema.to_string(),
                version: installed,
            });
        }
        if installed == latest {
            if !self.config.force {
                tracing::info!(schema, version = installed, "schema is current, skipping");
                return Ok(DeployOutcome::UpToDate {
                    schema: schema.to_string(),
                    version: installed,
                });
            }
            tracing::info!(schema, version = installed, "schema is current, forcing a full pass");
        }

        tracing::info!(schema = logical.name(), installed, latest, "deploying schema");
        let model = Self::build_model(&[logical])?;
        let mut ledgered: BTreeSet<&str> = model.iter().map(|(_, obj)| obj.schema.as_str()).collect();
        ledgered.insert(schema);
        history.load(&ledgered.into_iter().collect::<Vec<_>>())?;

        let distributed = self.adapter.db_type().is_distributed();
        let apply = model.apply_with_history(
            &*self.adapter,
            &history,
            self.config.thread_pool_size,
            !distributed,
        )?;
        if !apply.is_success() {
            tracing::error!(schema, failed = apply.failed.len(), skipped = apply.skipped.len(), "object apply failed");
            return Err(Error::data_access(format!(
                "{} objects failed in {}: {}",
                apply.failed.len(),
                schema,
                apply.failure_summary()
            )));
        }
        if distributed {
            let distributed_tables = model.apply_distribution_rules(&*self.adapter, None)?;
            tracing::info!(schema, tables = distributed_tables, "applied distribution rules");
            model.apply_foreign_keys(&*self.adapter, &history, None)?;
        }
        tracing::info!(
            schema,
            applied = apply.applied.len(),
            up_to_date = apply.up_to_date,
            "object graph applied"
        );

        let migrations_applied = if self.adapter.is_dry_run() {
            tracing::info!(schema, "dry run, skipping data migrations and reference data");
            Vec::new()
        } else {
            let ctx = MigrationContext::new(&*self.adapter, schema, installed);
            let ran = self.run_migrations(logical, &history, &ctx)?;
            if !ran.is_empty() {
                model.apply_routines(&*self.adapter, &history, None)?;
            }
            logical.load_reference_data(&ctx)?;
            ran
        };

        self.apply_grants(&model, logical.tag().as_ref())?;

        if let Some(guard) = &lease {
            guard.ensure_held()?;
        }
        svm.update_schema_version()?;
        tracing::info!(schema, version = latest, "schema deployed");

        Ok(DeployOutcome::Applied(DeployReport {
            schema: schema.to_string(),
            previous_version: installed,
            version: latest,
            objects_applied: apply.applied.len(),
            objects_up_to_date: apply.up_to_date,
            migrations_applied,
            forced: self.config.force && installed == latest,
        }))
    }

    /// Run the steps above `ctx.installed_version()` that are not ledgered
    /// yet, in ascending order. Returns the versions that ran.
    fn run_migrations(
        &self,
        logical: &dyn LogicalSchema,
        history: &VersionHistoryService,
        ctx: &MigrationContext<'_>,
    ) -> Result<Vec<i32>> {
        let schema = ctx.schema();
        let mut steps = logical.migrations();
        steps.sort_by_key(|s| s.version());

        let mut ran = Vec::new();
        for step in steps {
            let version = step.version();
            let name = step_name(version);
            if ctx.installed_version() >= version {
                tracing::debug!(schema, step = %name, "installed version covers step");
                continue;
            }
            if history.get_version(schema, MIGRATION_OBJECT_TYPE, &name).is_some() {
                tracing::debug!(schema, step = %name, "step already applied");
                continue;
            }

            step.precondition(ctx)?;
            tracing::info!(schema, step = %name, description = step.description(), "applying migration step");
            step.apply(ctx)?;

            let mut conn = self.adapter.connection()?;
            transaction(&mut *conn, |c| {
                history.record_version(c, schema, MIGRATION_OBJECT_TYPE, &name, version)
            })?;
            history.mark_applied(schema, MIGRATION_OBJECT_TYPE, &name, version);
            tracing::info!(schema, step = %name, "migration step applied");
            ran.push(version);
        }
        Ok(ran)
    }

    fn apply_grants(&self, model: &PhysicalDataModel, filter: Option<&Tag>) -> Result<()> {
        if let Some(grantee) = &self.config.grant_to {
            model.apply_grants(&*self.adapter, filter, Privilege::FULL, grantee)?;
        }
        if let Some(grantee) = &self.config.grant_read_to {
            model.apply_grants(&*self.adapter, filter, Privilege::READ, grantee)?;
        }
        Ok(())
    }

    /// Apply the configured grants to a deployed schema.
    pub fn grant(&self, logical: &dyn LogicalSchema) -> Result<()> {
        if self.config.grant_to.is_none() && self.config.grant_read_to.is_none() {
            return Err(Error::config("no grantee given"));
        }
        let model = Self::build_model(&[logical])?;
        self.apply_grants(&model, logical.tag().as_ref())
    }

    /// Drop every object of `logical`, verify the schema is empty, forget its
    /// version history and drop the schema itself.
    pub fn drop_schema(&self, logical: &dyn LogicalSchema, confirm: bool) -> Result<()> {
        let schema = logical.schema_name();
        if !confirm {
            return Err(Error::config(format!("dropping {} requires confirmation", schema)));
        }

        bookkeeping::ensure_admin_schema(&*self.adapter, &self.config.admin_schema)?;
        let _lease = self.acquire_lease(schema)?;

        let model = Self::build_model(&[logical])?;
        let filter = logical.tag();
        model.drop_foreign_keys(&*self.adapter, filter.as_ref())?;
        model.drop(&*self.adapter, filter.as_ref())?;

        let mut conn = self.adapter.connection()?;
        let version_table = bookkeeping::whole_schema_version_table(schema);
        transaction(&mut *conn, |c| self.adapter.drop_object(c, &version_table))?;

        if self.adapter.is_dry_run() {
            tracing::info!(schema, "dry run, not verifying the drop");
            return Ok(());
        }

        let remaining = self.adapter.list_schema_objects(&mut *conn, schema)?;
        if !remaining.is_empty() {
            let names: Vec<String> = remaining
                .iter()
                .map(|o| format!("{} {}", o.object_type, o.name))
                .collect();
            return Err(Error::TablespaceRemovalNotComplete(format!(
                "{} still contains {}",
                schema,
                names.join(", ")
            )));
        }

        let history = self.history();
        history.init()?;
        history.clear(schema)?;
        self.adapter.drop_schema(&mut *conn, schema)?;
        tracing::info!(schema, "schema dropped");
        Ok(())
    }

    /// Drop the admin schema with its lease and version history tables.
    pub fn drop_admin(&self, confirm: bool) -> Result<()> {
        let admin = self.config.admin_schema.as_str();
        if !confirm {
            return Err(Error::config(format!("dropping {} requires confirmation", admin)));
        }

        let mut conn = self.adapter.connection()?;
        transaction(&mut *conn, |c| {
            self.adapter.drop_object(c, &bookkeeping::version_history_table(admin))?;
            self.adapter.drop_object(c, &bookkeeping::control_table(admin))
        })?;
        self.adapter.drop_schema(&mut *conn, admin)?;
        tracing::info!(schema = admin, "admin schema dropped");
        Ok(())
    }

    /// Whether this release can use `logical` as deployed: the database
    /// passes the dialect's checks and the schema is at least at the latest
    /// version.
    pub fn check_compatibility(&self, logical: &dyn LogicalSchema) -> Result<bool> {
        let schema = logical.schema_name();
        let mut conn = self.adapter.connection()?;
        if !self.adapter.check_compatibility(&mut *conn, schema)? {
            return Ok(false);
        }
        drop(conn);

        let installed = SchemaVersionManager::new(Arc::clone(&self.adapter), schema, logical.latest_version())
            .get_version_for_schema()?;
        if installed == NOT_BUILT || installed < logical.latest_version() {
            tracing::warn!(schema, installed, latest = logical.latest_version(), "schema needs an update");
            return Ok(false);
        }
        Ok(true)
    }
}

impl std::fmt::Debug for MigrationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationOrchestrator")
            .field("db_type", &self.adapter.db_type())
            .field("config", &self.config)
            .finish()
    }
}
