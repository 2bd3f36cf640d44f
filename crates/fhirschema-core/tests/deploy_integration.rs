//! End-to-end deployment tests against the embedded dialect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fhirschema_core::adapter::{Connection, DialectAdapter, ObjectInfo, PooledConnection, Translator};
use fhirschema_core::migration::{step_name, MIGRATION_OBJECT_TYPE};
use fhirschema_core::{
    ColumnDef, ColumnType, DbType, DeployConfig, DeployOutcome, Error, ErrorKind, LeaseConfig,
    LeaseManager, LogicalSchema, MigrationContext, MigrationOrchestrator, MigrationStep, ObjectId,
    PhysicalDataModel, PoolConfig, Result, SchemaObject, SchemaVersionManager, SqliteAdapter,
    TableDef, VersionHistoryService, NOT_BUILT,
};
use parking_lot::Mutex;

const SCHEMA: &str = "FHIRDATA";
const ADMIN: &str = "FHIR_ADMIN";

/// Delegates to SQLite and logs when each table apply starts and ends.
struct RecordingAdapter {
    inner: SqliteAdapter,
    events: Mutex<Vec<String>>,
}

impl DialectAdapter for RecordingAdapter {
    fn db_type(&self) -> DbType {
        self.inner.db_type()
    }

    fn translator(&self) -> &dyn Translator {
        self.inner.translator()
    }

    fn connection(&self) -> Result<PooledConnection> {
        self.inner.connection()
    }

    fn is_dry_run(&self) -> bool {
        self.inner.is_dry_run()
    }

    fn create_schema(&self, conn: &mut dyn Connection, schema: &str) -> Result<()> {
        self.inner.create_schema(conn, schema)
    }

    fn drop_schema(&self, conn: &mut dyn Connection, schema: &str) -> Result<()> {
        self.inner.drop_schema(conn, schema)
    }

    fn list_schema_objects(&self, conn: &mut dyn Connection, schema: &str) -> Result<Vec<ObjectInfo>> {
        self.inner.list_schema_objects(conn, schema)
    }

    fn check_compatibility(&self, conn: &mut dyn Connection, schema: &str) -> Result<bool> {
        self.inner.check_compatibility(conn, schema)
    }

    fn apply_object(&self, conn: &mut dyn Connection, obj: &SchemaObject, prior: Option<i32>) -> Result<()> {
        let tracked = obj.name.starts_with('T');
        if tracked {
            self.events.lock().push(format!("start:{}", obj.name));
        }
        self.inner.apply_object(conn, obj, prior)?;
        if tracked {
            self.events.lock().push(format!("end:{}", obj.name));
        }
        Ok(())
    }
}

/// Step that inserts its version into T0, optionally failing once first.
#[derive(Clone)]
struct InsertStep {
    version: i32,
    runs: Arc<AtomicUsize>,
    fail_once: Arc<AtomicBool>,
    refuse: bool,
}

impl InsertStep {
    fn new(version: i32) -> Self {
        Self {
            version,
            runs: Arc::new(AtomicUsize::new(0)),
            fail_once: Arc::new(AtomicBool::new(false)),
            refuse: false,
        }
    }

    fn failing_once(self) -> Self {
        self.fail_once.store(true, Ordering::SeqCst);
        self
    }

    fn refusing(mut self) -> Self {
        self.refuse = true;
        self
    }
}

impl MigrationStep for InsertStep {
    fn version(&self) -> i32 {
        self.version
    }

    fn description(&self) -> &str {
        "insert marker row"
    }

    fn precondition(&self, ctx: &MigrationContext<'_>) -> Result<()> {
        ctx.require(!self.refuse, || format!("{} refuses to run", step_name(self.version)))
    }

    fn apply(&self, ctx: &MigrationContext<'_>) -> Result<()> {
        if self.fail_once.swap(false, Ordering::SeqCst) {
            return Err(Error::data_access("simulated failure"));
        }
        self.runs.fetch_add(1, Ordering::SeqCst);
        let sql = format!("INSERT INTO {} (ID) VALUES (?)", ctx.qualified("T0"));
        ctx.transaction(|c| c.execute(&sql, &[self.version.into()]).map(|_| ()))
    }
}

/// Ten tables in three levels: T0-T2, then T3-T6, then T7-T9.
struct ChainSchema {
    latest: i32,
    steps: Vec<InsertStep>,
}

impl ChainSchema {
    fn new(latest: i32) -> Self {
        Self {
            latest,
            steps: Vec::new(),
        }
    }

    fn with_step(mut self, step: InsertStep) -> Self {
        self.steps.push(step);
        self
    }

    fn dependencies(i: usize) -> Vec<usize> {
        match i {
            0..=2 => vec![],
            3..=6 => vec![i % 3],
            _ => vec![i - 4, i - 3],
        }
    }
}

impl LogicalSchema for ChainSchema {
    fn name(&self) -> &str {
        "chain"
    }

    fn schema_name(&self) -> &str {
        SCHEMA
    }

    fn latest_version(&self) -> i32 {
        self.latest
    }

    fn build(&self, model: &mut PhysicalDataModel) -> Result<()> {
        let mut ids: Vec<ObjectId> = Vec::new();
        for i in 0..10 {
            let def = TableDef::new()
                .with_column(ColumnDef::required("ID", ColumnType::BigInt))
                .with_primary_key(format!("PK_T{}", i), ["ID"]);
            let table = SchemaObject::table(SCHEMA, format!("T{}", i), 1, def)
                .depends_on_all(Self::dependencies(i).into_iter().map(|d| ids[d]));
            ids.push(model.add_object(table)?);
        }
        Ok(())
    }

    fn migrations(&self) -> Vec<Box<dyn MigrationStep>> {
        self.steps
            .iter()
            .cloned()
            .map(|s| Box::new(s) as Box<dyn MigrationStep>)
            .collect()
    }
}

struct TestContext {
    adapter: Arc<dyn DialectAdapter>,
    recorder: Option<Arc<RecordingAdapter>>,
    dir: tempfile::TempDir,
}

impl TestContext {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Arc::new(SqliteAdapter::new(dir.path().join("fhir.db"), PoolConfig::new(8), false));
        Self {
            adapter,
            recorder: None,
            dir,
        }
    }

    fn recording() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(RecordingAdapter {
            inner: SqliteAdapter::new(dir.path().join("fhir.db"), PoolConfig::for_workers(4, 4), false),
            events: Mutex::new(Vec::new()),
        });
        Self {
            adapter: recorder.clone(),
            recorder: Some(recorder),
            dir,
        }
    }

    fn config() -> DeployConfig {
        DeployConfig::new()
            .with_admin_schema(ADMIN)
            .with_thread_pool_size(4)
            .with_lease(LeaseConfig::default().with_poll_interval(Duration::from_millis(20)))
            .with_lease_wait(Duration::from_secs(5))
    }

    fn orchestrator(&self, config: DeployConfig) -> MigrationOrchestrator {
        MigrationOrchestrator::new(self.adapter.clone(), config)
    }

    fn history(&self) -> VersionHistoryService {
        VersionHistoryService::new(self.adapter.clone(), ADMIN)
    }

    fn installed_version(&self) -> i32 {
        SchemaVersionManager::new(self.adapter.clone(), SCHEMA, 0)
            .get_version_for_schema()
            .unwrap()
    }

    fn marker_rows(&self) -> i64 {
        let mut conn = self.adapter.connection().unwrap();
        conn.query_scalar("SELECT COUNT(*) FROM FHIRDATA.T0", &[]).unwrap()
    }
}

fn applied(outcome: DeployOutcome) -> fhirschema_core::DeployReport {
    match outcome {
        DeployOutcome::Applied(report) => report,
        other => panic!("expected a deployment pass, got {:?}", other),
    }
}

#[test]
fn test_chain_applies_in_dependency_order() {
    let ctx = TestContext::recording();
    let report = applied(
        ctx.orchestrator(TestContext::config())
            .update_schema(&ChainSchema::new(1))
            .unwrap(),
    );
    assert_eq!(report.objects_applied, 10);
    assert_eq!(report.previous_version, NOT_BUILT);
    assert_eq!(ctx.installed_version(), 1);

    let records = ctx.history().records(SCHEMA).unwrap();
    assert_eq!(records.len(), 10);
    assert!(records.iter().all(|r| r.object_type == "TABLE" && r.installed_version == 1));

    let events = ctx.recorder.as_ref().unwrap().events.lock().clone();
    let position: HashMap<&str, usize> = events.iter().enumerate().map(|(i, e)| (e.as_str(), i)).collect();
    for i in 0..10 {
        let start = position[format!("start:T{}", i).as_str()];
        for d in ChainSchema::dependencies(i) {
            let end = position[format!("end:T{}", d).as_str()];
            assert!(end < start, "T{} started before T{} finished", i, d);
        }
    }
}

#[test]
fn test_second_run_applies_nothing() {
    let ctx = TestContext::new();
    let orchestrator = ctx.orchestrator(TestContext::config());
    let schema = ChainSchema::new(1);

    applied(orchestrator.update_schema(&schema).unwrap());
    let second = orchestrator.update_schema(&schema).unwrap();
    assert!(second.is_up_to_date());

    // forcing walks the graph again but the ledger covers every table
    let forced = applied(
        ctx.orchestrator(TestContext::config().with_force(true))
            .update_schema(&schema)
            .unwrap(),
    );
    assert!(forced.forced);
    assert_eq!(forced.objects_applied, 0);
    assert_eq!(forced.objects_up_to_date, 10);
}

#[test]
fn test_force_skips_newer_schema() {
    let ctx = TestContext::new();
    applied(
        ctx.orchestrator(TestContext::config())
            .update_schema(&ChainSchema::new(3))
            .unwrap(),
    );

    let older = ChainSchema::new(2);
    assert!(ctx
        .orchestrator(TestContext::config())
        .update_schema(&older)
        .unwrap()
        .is_up_to_date());

    let outcome = ctx
        .orchestrator(TestContext::config().with_force(true))
        .update_schema(&older)
        .unwrap();
    assert!(outcome.is_up_to_date());
    assert_eq!(ctx.installed_version(), 3);
}

#[test]
fn test_migration_steps_run_once() {
    let ctx = TestContext::new();
    let v2 = InsertStep::new(2);
    let v3 = InsertStep::new(3).failing_once();
    let schema = ChainSchema::new(3).with_step(v3.clone()).with_step(v2.clone());
    let orchestrator = ctx.orchestrator(TestContext::config());

    // V0002 commits, V0003 fails: the pass fails and the version stays put
    let err = orchestrator.update_schema(&schema).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DataAccess);
    assert_eq!(ctx.installed_version(), NOT_BUILT);
    assert_eq!(v2.runs.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.marker_rows(), 1);

    let report = applied(orchestrator.update_schema(&schema).unwrap());
    assert_eq!(report.migrations_applied, vec![3]);
    assert_eq!(v2.runs.load(Ordering::SeqCst), 1);
    assert_eq!(v3.runs.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.marker_rows(), 2);
    assert_eq!(ctx.installed_version(), 3);

    let history = ctx.history();
    history.load(&[SCHEMA]).unwrap();
    assert_eq!(history.get_version(SCHEMA, MIGRATION_OBJECT_TYPE, "V0002"), Some(2));
    assert_eq!(history.get_version(SCHEMA, MIGRATION_OBJECT_TYPE, "V0003"), Some(3));
}

#[test]
fn test_steps_at_or_below_installed_version_are_skipped() {
    let ctx = TestContext::new();
    let orchestrator = ctx.orchestrator(TestContext::config());
    applied(orchestrator.update_schema(&ChainSchema::new(2)).unwrap());

    let v2 = InsertStep::new(2);
    let v4 = InsertStep::new(4);
    let schema = ChainSchema::new(4).with_step(v2.clone()).with_step(v4.clone());
    let report = applied(orchestrator.update_schema(&schema).unwrap());

    assert_eq!(report.previous_version, 2);
    assert_eq!(report.migrations_applied, vec![4]);
    assert_eq!(v2.runs.load(Ordering::SeqCst), 0);
    assert_eq!(v4.runs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failed_precondition_aborts() {
    let ctx = TestContext::new();
    let v2 = InsertStep::new(2).refusing();
    let v3 = InsertStep::new(3);
    let schema = ChainSchema::new(3).with_step(v2).with_step(v3.clone());

    let err = ctx
        .orchestrator(TestContext::config())
        .update_schema(&schema)
        .unwrap_err();
    assert!(matches!(err, Error::ValidationFailure(_)));
    assert_eq!(v3.runs.load(Ordering::SeqCst), 0);
    assert_eq!(ctx.installed_version(), NOT_BUILT);
}

#[test]
fn test_held_lease_is_concurrent_update() {
    let ctx = TestContext::new();
    fhirschema_core::bookkeeping::ensure_admin_schema(&*ctx.adapter, ADMIN).unwrap();
    let other = LeaseManager::new(ctx.adapter.clone(), ADMIN, SCHEMA, LeaseConfig::default())
        .with_holder_id("other-host:1:beef");
    assert!(other.wait_for_lease(Duration::from_secs(1)).unwrap());

    let config = TestContext::config().with_lease_wait(Duration::from_millis(200));
    let err = ctx.orchestrator(config).update_schema(&ChainSchema::new(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConcurrentUpdate);
    assert!(err.is_retryable());
    assert!(err.to_string().contains("other-host"));

    assert!(other.cancel_lease().unwrap());
    applied(
        ctx.orchestrator(TestContext::config())
            .update_schema(&ChainSchema::new(1))
            .unwrap(),
    );
}

#[test]
fn test_lease_released_after_failure() {
    let ctx = TestContext::new();
    let schema = ChainSchema::new(2).with_step(InsertStep::new(2).refusing());
    ctx.orchestrator(TestContext::config())
        .update_schema(&schema)
        .unwrap_err();

    let observer = LeaseManager::new(ctx.adapter.clone(), ADMIN, SCHEMA, LeaseConfig::default().without_heartbeat());
    assert!(observer.current_holder().unwrap().is_none());
}

#[test]
fn test_drop_schema() {
    let ctx = TestContext::new();
    let orchestrator = ctx.orchestrator(TestContext::config());
    let schema = ChainSchema::new(1);
    applied(orchestrator.update_schema(&schema).unwrap());

    let err = orchestrator.drop_schema(&schema, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);

    orchestrator.drop_schema(&schema, true).unwrap();
    assert!(!ctx.dir.path().join("fhir.FHIRDATA.db").exists());
    assert!(ctx.history().records(SCHEMA).unwrap().is_empty());
    assert_eq!(ctx.installed_version(), NOT_BUILT);

    // and it can be deployed again from scratch
    let report = applied(orchestrator.update_schema(&schema).unwrap());
    assert_eq!(report.objects_applied, 10);
}

#[test]
fn test_create_schemas_and_compatibility() {
    let ctx = TestContext::new();
    let orchestrator = ctx.orchestrator(TestContext::config());
    let schema = ChainSchema::new(1);

    orchestrator.create_schemas(&[&schema]).unwrap();
    assert!(ctx.dir.path().join("fhir.FHIRDATA.db").exists());
    assert_eq!(ctx.installed_version(), NOT_BUILT);
    assert!(!orchestrator.check_compatibility(&schema).unwrap());

    applied(orchestrator.update_schema(&schema).unwrap());
    assert!(orchestrator.check_compatibility(&schema).unwrap());
}

#[test]
fn test_dry_run_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let adapter: Arc<dyn DialectAdapter> =
        Arc::new(SqliteAdapter::new(dir.path().join("fhir.db"), PoolConfig::new(6), true));
    let step = InsertStep::new(1);
    let schema = ChainSchema::new(1).with_step(step.clone());

    let report = applied(
        MigrationOrchestrator::new(adapter, TestContext::config().with_dry_run(true))
            .update_schema(&schema)
            .unwrap(),
    );
    assert_eq!(report.objects_applied, 10);
    assert!(report.migrations_applied.is_empty());
    assert_eq!(step.runs.load(Ordering::SeqCst), 0);
    assert!(!dir.path().join("fhir.FHIRDATA.db").exists());
    assert!(!dir.path().join("fhir.FHIR_ADMIN.db").exists());
}
