//! Physical data model: the dependency graph of schema objects for one run.
//!
//! Objects live in an arena indexed by [`ObjectId`]. A dependency can only
//! name an object that is already in the arena, so insertion order is always
//! a valid topological order and the graph cannot contain a cycle. A
//! secondary index maps each [`Tag`] to the ids carrying it.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use super::object::{ObjectDefinition, ObjectKind, SchemaObject, Tag};
use crate::adapter::{transaction, Connection, DialectAdapter, Privilege};
use crate::error::Result;
use crate::scheduler::{FailedTask, TaskScheduler};
use crate::version_history::VersionHistoryService;

/// Stable index of an object in a [`PhysicalDataModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ObjectId(usize);

impl ObjectId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Errors raised while building or scheduling the graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A dependency was declared before the object it names was added.
    #[error("{object} depends on {dependency}, which is not in the model")]
    MissingDependency {
        /// The object being added.
        object: String,
        /// The unknown dependency.
        dependency: ObjectId,
    },

    /// An object with the same schema, kind and name already exists.
    #[error("duplicate {kind} {schema}.{name}")]
    Duplicate {
        kind: ObjectKind,
        schema: String,
        name: String,
    },

    /// A task named a dependency that was not submitted before it.
    #[error("task {task} depends on unregistered task {dependency}")]
    UnknownTask { task: String, dependency: String },

    /// The same task id was submitted twice.
    #[error("duplicate task {0}")]
    DuplicateTask(String),
}

/// How [`PhysicalDataModel::visit`] scopes transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// All visited objects share one transaction.
    Single,
    /// Each top-level object gets its own transaction. Distributed
    /// dialects use this to bound catalog lock scope.
    PerObject,
}

impl TransactionMode {
    /// The mode a dialect needs for catalog-touching passes.
    pub fn for_adapter(adapter: &dyn DialectAdapter) -> Self {
        if adapter.db_type().is_distributed() {
            TransactionMode::PerObject
        } else {
            TransactionMode::Single
        }
    }
}

/// Outcome of [`PhysicalDataModel::apply_with_history`].
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    /// Objects whose DDL ran, in completion order.
    pub applied: Vec<String>,
    /// Objects already at or above their declared version.
    pub up_to_date: usize,
    /// Objects whose apply failed.
    pub failed: Vec<FailedTask>,
    /// Objects not attempted because a dependency failed.
    pub skipped: Vec<String>,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    /// One line naming every failed and skipped object.
    pub fn failure_summary(&self) -> String {
        let mut parts: Vec<String> = self
            .failed
            .iter()
            .map(|f| format!("{} ({})", f.id, f.error))
            .collect();
        if !self.skipped.is_empty() {
            parts.push(format!("skipped: {}", self.skipped.join(", ")));
        }
        parts.join("; ")
    }
}

/// Serializable summary of one object.
#[derive(Debug, Clone, Serialize)]
pub struct ObjectSummary {
    pub id: usize,
    pub kind: ObjectKind,
    pub schema: String,
    pub name: String,
    pub version: i32,
    pub tags: Vec<String>,
    pub dependencies: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
}

/// Serializable summary of a whole model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelDescription {
    pub object_count: usize,
    pub objects: Vec<ObjectSummary>,
}

type ObjectKey = (String, ObjectKind, String);

/// Arena of schema objects with a tag index.
#[derive(Debug, Default)]
pub struct PhysicalDataModel {
    objects: Vec<SchemaObject>,
    keys: HashMap<ObjectKey, ObjectId>,
    tag_index: HashMap<Tag, Vec<ObjectId>>,
}

impl PhysicalDataModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an object. Every dependency must already be in the model.
    pub fn add_object(&mut self, obj: SchemaObject) -> std::result::Result<ObjectId, GraphError> {
        if let Some(&missing) = obj.dependencies.iter().find(|d| d.0 >= self.objects.len()) {
            return Err(GraphError::MissingDependency {
                object: obj.qualified_name(),
                dependency: missing,
            });
        }

        let key = (obj.schema.clone(), obj.kind(), obj.name.clone());
        if self.keys.contains_key(&key) {
            return Err(GraphError::Duplicate {
                kind: obj.kind(),
                schema: obj.schema,
                name: obj.name,
            });
        }

        let id = ObjectId(self.objects.len());
        for tag in &obj.tags {
            self.tag_index.entry(tag.clone()).or_default().push(id);
        }
        self.keys.insert(key, id);
        self.objects.push(obj);
        Ok(id)
    }

    pub fn get(&self, id: ObjectId) -> Option<&SchemaObject> {
        self.objects.get(id.0)
    }

    /// Look an object up by schema, kind and name.
    pub fn find(&self, schema: &str, kind: ObjectKind, name: &str) -> Option<ObjectId> {
        self.keys
            .get(&(schema.to_string(), kind, name.to_string()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// All objects in insertion (dependency) order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &SchemaObject)> {
        self.objects.iter().enumerate().map(|(i, o)| (ObjectId(i), o))
    }

    /// Objects tagged `group=value`, in insertion order.
    pub fn objects_by_tag(&self, group: &str, value: &str) -> Vec<&SchemaObject> {
        self.tag_index
            .get(&Tag::new(group, value))
            .map(|ids| ids.iter().map(|id| &self.objects[id.0]).collect())
            .unwrap_or_default()
    }

    /// Ids matching `filter` in dependency order; every object when `None`.
    fn select(&self, filter: Option<&Tag>) -> Vec<ObjectId> {
        match filter {
            None => (0..self.objects.len()).map(ObjectId).collect(),
            Some(tag) => self.tag_index.get(tag).cloned().unwrap_or_default(),
        }
    }

    fn task_id(obj: &SchemaObject) -> String {
        format!("{}:{}.{}", obj.kind(), obj.schema, obj.name)
    }

    /// Run `op` on each selected object in dependency order.
    pub fn visit<F>(
        &self,
        adapter: &dyn DialectAdapter,
        filter: Option<&Tag>,
        mode: TransactionMode,
        mut op: F,
    ) -> Result<()>
    where
        F: FnMut(&mut dyn Connection, &SchemaObject) -> Result<()>,
    {
        let ids = self.select(filter);
        let mut conn = adapter.connection()?;
        match mode {
            TransactionMode::Single => transaction(&mut *conn, |c| {
                ids.iter().try_for_each(|id| op(&mut *c, &self.objects[id.0]))
            }),
            TransactionMode::PerObject => ids.iter().try_for_each(|id| {
                transaction(&mut *conn, |c| op(c, &self.objects[id.0]))
            }),
        }
    }

    /// Drop the selected objects in reverse dependency order, one
    /// transaction each.
    pub fn drop(&self, adapter: &dyn DialectAdapter, filter: Option<&Tag>) -> Result<()> {
        let ids = self.select(filter);
        let mut conn = adapter.connection()?;
        for id in ids.iter().rev() {
            let obj = &self.objects[id.0];
            tracing::debug!(object = %obj, "dropping");
            transaction(&mut *conn, |c| adapter.drop_object(c, obj))?;
        }
        tracing::info!(objects = ids.len(), "dropped objects");
        Ok(())
    }

    /// Apply every object through the task scheduler, skipping those the
    /// ledger already has at or above their declared version.
    ///
    /// With `include_foreign_keys` false, foreign keys are left for
    /// [`apply_foreign_keys`](Self::apply_foreign_keys).
    pub fn apply_with_history(
        &self,
        adapter: &dyn DialectAdapter,
        history: &VersionHistoryService,
        workers: usize,
        include_foreign_keys: bool,
    ) -> Result<ApplyReport> {
        let applied = Mutex::new(Vec::new());
        let up_to_date = AtomicUsize::new(0);
        let mut scheduler = TaskScheduler::new(workers);
        let mut submitted = vec![false; self.objects.len()];

        for (id, obj) in self.iter() {
            if !include_foreign_keys && obj.kind() == ObjectKind::ForeignKey {
                continue;
            }
            let deps: Vec<String> = obj
                .dependencies
                .iter()
                .filter(|d| submitted[d.0])
                .map(|d| Self::task_id(&self.objects[d.0]))
                .collect();

            let applied = &applied;
            let up_to_date = &up_to_date;
            scheduler.submit(Self::task_id(obj), deps, move || {
                if apply_one(adapter, history, obj, false)? {
                    applied.lock().push(obj.qualified_name());
                } else {
                    up_to_date.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            })?;
            submitted[id.0] = true;
        }

        let run = scheduler.start_and_wait();
        Ok(ApplyReport {
            applied: applied.into_inner(),
            up_to_date: up_to_date.into_inner(),
            failed: run.failed,
            skipped: run.skipped,
        })
    }

    /// Re-apply procedures and functions regardless of the ledger.
    pub fn apply_routines(
        &self,
        adapter: &dyn DialectAdapter,
        history: &VersionHistoryService,
        filter: Option<&Tag>,
    ) -> Result<usize> {
        let mut count = 0;
        for id in self.select(filter) {
            let obj = &self.objects[id.0];
            if matches!(obj.kind(), ObjectKind::Procedure | ObjectKind::Function) {
                apply_one(adapter, history, obj, true)?;
                count += 1;
            }
        }
        tracing::info!(routines = count, "re-applied routines");
        Ok(count)
    }

    /// Grant `privileges` on the selected objects, and usage on their schemas.
    pub fn apply_grants(
        &self,
        adapter: &dyn DialectAdapter,
        filter: Option<&Tag>,
        privileges: &[Privilege],
        grantee: &str,
    ) -> Result<()> {
        let schemas: BTreeSet<String> = self
            .select(filter)
            .iter()
            .map(|id| self.objects[id.0].schema.clone())
            .collect();

        let mut conn = adapter.connection()?;
        transaction(&mut *conn, |c| {
            schemas
                .iter()
                .try_for_each(|s| adapter.grant_schema_usage(&mut *c, s, grantee))
        })?;

        self.visit(adapter, filter, TransactionMode::for_adapter(adapter), |c, obj| {
            adapter.grant_object(c, obj, privileges, grantee)
        })?;
        tracing::info!(grantee, schemas = ?schemas, "granted privileges");
        Ok(())
    }

    /// Distribute or replicate every table carrying a distribution hint,
    /// one transaction per top-level object. The tables of a group share
    /// their group's transaction.
    pub fn apply_distribution_rules(&self, adapter: &dyn DialectAdapter, filter: Option<&Tag>) -> Result<usize> {
        let mut count = 0;
        self.visit(adapter, filter, TransactionMode::PerObject, |c, obj| {
            for table in distributed_tables(obj) {
                adapter.apply_distribution_rule(&mut *c, table)?;
                count += 1;
            }
            Ok(())
        })?;
        Ok(count)
    }

    /// Apply foreign keys, grouped by child table.
    ///
    /// When the adapter splits foreign-key transactions each child table's
    /// constraints commit separately; otherwise all commit together.
    pub fn apply_foreign_keys(
        &self,
        adapter: &dyn DialectAdapter,
        history: &VersionHistoryService,
        filter: Option<&Tag>,
    ) -> Result<usize> {
        let groups = self.foreign_key_groups(filter);
        let batches: Vec<Vec<&SchemaObject>> = if adapter.splits_foreign_key_transactions() {
            groups
        } else {
            vec![groups.into_iter().flatten().collect()]
        };

        let mut conn = adapter.connection()?;
        let mut count = 0;
        for batch in batches {
            let applied = transaction(&mut *conn, |c| {
                let mut applied = Vec::new();
                for fk in &batch {
                    let kind = fk.kind().as_str();
                    let installed = history.get_version(&fk.schema, kind, &fk.name);
                    if installed.map_or(false, |v| v >= fk.version) {
                        continue;
                    }
                    adapter.apply_object(c, fk, installed)?;
                    history.record_version(c, &fk.schema, kind, &fk.name, fk.version)?;
                    applied.push(*fk);
                }
                Ok(applied)
            })?;
            for fk in applied {
                history.mark_applied(&fk.schema, fk.kind().as_str(), &fk.name, fk.version);
                count += 1;
            }
        }
        tracing::debug!(foreign_keys = count, "applied foreign keys");
        Ok(count)
    }

    /// Drop foreign keys in reverse order, grouped like
    /// [`apply_foreign_keys`](Self::apply_foreign_keys).
    pub fn drop_foreign_keys(&self, adapter: &dyn DialectAdapter, filter: Option<&Tag>) -> Result<()> {
        let mut groups = self.foreign_key_groups(filter);
        groups.reverse();
        let batches: Vec<Vec<&SchemaObject>> = if adapter.splits_foreign_key_transactions() {
            groups
        } else {
            vec![groups.into_iter().flatten().collect()]
        };

        let mut conn = adapter.connection()?;
        for batch in batches {
            transaction(&mut *conn, |c| {
                batch.iter().rev().try_for_each(|fk| adapter.drop_object(&mut *c, fk))
            })?;
        }
        Ok(())
    }

    fn foreign_key_groups(&self, filter: Option<&Tag>) -> Vec<Vec<&SchemaObject>> {
        let mut order: Vec<&str> = Vec::new();
        let mut groups: HashMap<&str, Vec<&SchemaObject>> = HashMap::new();
        for id in self.select(filter) {
            let obj = &self.objects[id.0];
            if let ObjectDefinition::ForeignKey(fk) = &obj.definition {
                let child = fk.table.as_str();
                if !groups.contains_key(child) {
                    order.push(child);
                }
                groups.entry(child).or_default().push(obj);
            }
        }
        order
            .into_iter()
            .filter_map(|child| groups.remove(child))
            .collect()
    }

    /// Serializable summary for display.
    pub fn describe(&self) -> ModelDescription {
        let objects = self
            .iter()
            .map(|(id, obj)| ObjectSummary {
                id: id.0,
                kind: obj.kind(),
                schema: obj.schema.clone(),
                name: obj.name.clone(),
                version: obj.version,
                tags: obj.tags.iter().map(Tag::to_string).collect(),
                dependencies: obj
                    .dependencies
                    .iter()
                    .map(|d| self.objects[d.0].qualified_name())
                    .collect(),
                children: match &obj.definition {
                    ObjectDefinition::Group(children) => {
                        children.iter().map(SchemaObject::qualified_name).collect()
                    }
                    _ => Vec::new(),
                },
            })
            .collect::<Vec<_>>();
        ModelDescription {
            object_count: objects.len(),
            objects,
        }
    }
}

/// Apply one object unless the ledger says it is current. Returns whether
/// DDL ran.
fn apply_one(
    adapter: &dyn DialectAdapter,
    history: &VersionHistoryService,
    obj: &SchemaObject,
    force: bool,
) -> Result<bool> {
    let kind = obj.kind().as_str();
    let installed = history.get_version(&obj.schema, kind, &obj.name);
    if !force && installed.map_or(false, |v| v >= obj.version) {
        tracing::trace!(object = %obj, ?installed, "up to date");
        return Ok(false);
    }

    tracing::debug!(object = %obj, ?installed, "applying");
    let mut conn = adapter.connection()?;
    transaction(&mut *conn, |c| {
        adapter.apply_object(c, obj, installed)?;
        history.record_version(c, &obj.schema, kind, &obj.name, obj.version)
    })?;
    history.mark_applied(&obj.schema, kind, &obj.name, obj.version);
    Ok(true)
}

/// Tables with a distribution hint, looking inside groups.
fn distributed_tables(obj: &SchemaObject) -> Vec<&SchemaObject> {
    match &obj.definition {
        ObjectDefinition::Table(def) if def.distribution != Default::default() => vec![obj],
        ObjectDefinition::Group(children) => children.iter().flat_map(distributed_tables).collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::adapter::{
        ConnectionFactory, ConnectionPool, DbRow, DbType, DbValue, ObjectInfo, PoolConfig, PooledConnection,
        Translator,
    };
    use crate::embedded::SqliteTranslator;
    use crate::model::{ColumnDef, ColumnType, ForeignKeyDef, SequenceDef, TableDef};

    /// Transaction boundaries and adapter calls, in order.
    #[derive(Default)]
    struct Journal {
        events: Mutex<Vec<String>>,
    }

    impl Journal {
        fn push(&self, event: impl Into<String>) {
            self.events.lock().push(event.into());
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    struct JournalConnection {
        journal: Arc<Journal>,
        in_tx: bool,
    }

    impl Connection for JournalConnection {
        fn execute(&mut self, sql: &str, params: &[DbValue]) -> Result<u64> {
            if sql.contains(crate::bookkeeping::VERSION_HISTORY) {
                let name = match params.get(2) {
                    Some(DbValue::Text(name)) => name.clone(),
                    _ => String::new(),
                };
                self.journal.push(format!("ledger {}", name));
            } else {
                self.journal.push(format!("execute {}", sql));
            }
            Ok(1)
        }

        fn query(&mut self, _sql: &str, _params: &[DbValue]) -> Result<Vec<DbRow>> {
            Ok(Vec::new())
        }

        fn begin(&mut self) -> Result<()> {
            self.in_tx = true;
            self.journal.push("begin");
            Ok(())
        }

        fn commit(&mut self) -> Result<()> {
            self.in_tx = false;
            self.journal.push("commit");
            Ok(())
        }

        fn rollback(&mut self) -> Result<()> {
            self.in_tx = false;
            self.journal.push("rollback");
            Ok(())
        }

        fn in_transaction(&self) -> bool {
            self.in_tx
        }
    }

    struct JournalFactory(Arc<Journal>);

    impl ConnectionFactory for JournalFactory {
        fn connect(&self) -> Result<Box<dyn Connection>> {
            Ok(Box::new(JournalConnection {
                journal: Arc::clone(&self.0),
                in_tx: false,
            }))
        }

        fn describe(&self) -> String {
            "journal".to_string()
        }
    }

    /// Adapter that records what the graph asks of it instead of running DDL.
    struct RecordingAdapter {
        db_type: DbType,
        journal: Arc<Journal>,
        pool: ConnectionPool,
    }

    impl RecordingAdapter {
        fn new(db_type: DbType) -> Arc<Self> {
            let journal = Arc::new(Journal::default());
            let pool = ConnectionPool::new(Arc::new(JournalFactory(Arc::clone(&journal))), PoolConfig::new(2));
            Arc::new(Self { db_type, journal, pool })
        }
    }

    impl DialectAdapter for RecordingAdapter {
        fn db_type(&self) -> DbType {
            self.db_type
        }

        fn translator(&self) -> &dyn Translator {
            &SqliteTranslator
        }

        fn connection(&self) -> Result<PooledConnection> {
            self.pool.acquire()
        }

        fn is_dry_run(&self) -> bool {
            false
        }

        fn create_schema(&self, _conn: &mut dyn Connection, _schema: &str) -> Result<()> {
            Ok(())
        }

        fn drop_schema(&self, _conn: &mut dyn Connection, _schema: &str) -> Result<()> {
            Ok(())
        }

        fn list_schema_objects(&self, _conn: &mut dyn Connection, _schema: &str) -> Result<Vec<ObjectInfo>> {
            Ok(Vec::new())
        }

        fn check_compatibility(&self, _conn: &mut dyn Connection, _schema: &str) -> Result<bool> {
            Ok(true)
        }

        fn apply_object(&self, _conn: &mut dyn Connection, obj: &SchemaObject, _prior: Option<i32>) -> Result<()> {
            self.journal.push(format!("apply {}", obj.name));
            Ok(())
        }

        fn grant_object(
            &self,
            _conn: &mut dyn Connection,
            obj: &SchemaObject,
            _privileges: &[Privilege],
            grantee: &str,
        ) -> Result<()> {
            self.journal.push(format!("grant {} {}", obj.name, grantee));
            Ok(())
        }

        fn apply_distribution_rule(&self, _conn: &mut dyn Connection, obj: &SchemaObject) -> Result<()> {
            self.journal.push(format!("distribute {}", obj.name));
            Ok(())
        }

        fn splits_foreign_key_transactions(&self) -> bool {
            self.db_type.is_distributed()
        }
    }

    fn foreign_key(name: &str, child: &str) -> SchemaObject {
        SchemaObject::foreign_key(
            "FHIRDATA",
            name,
            1,
            ForeignKeyDef::new(child, ["PARENT_ID"], "FHIRDATA", "PARENT", ["ID"]),
        )
    }

    /// PARENT, two child tables, and three foreign keys; FK_A2 is already installed.
    fn foreign_key_model() -> PhysicalDataModel {
        let mut model = PhysicalDataModel::new();
        let parent = model.add_object(table("PARENT")).unwrap();
        let a = model.add_object(table("CHILD_A").depends_on(parent)).unwrap();
        let b = model.add_object(table("CHILD_B").depends_on(parent)).unwrap();
        model.add_object(foreign_key("FK_A1", "CHILD_A").depends_on_all([parent, a])).unwrap();
        model.add_object(foreign_key("FK_A2", "CHILD_A").depends_on_all([parent, a])).unwrap();
        model.add_object(foreign_key("FK_B1", "CHILD_B").depends_on_all([parent, b])).unwrap();
        model
    }

    fn history_for(adapter: &Arc<RecordingAdapter>) -> VersionHistoryService {
        let shared: Arc<dyn DialectAdapter> = adapter.clone();
        let history = VersionHistoryService::new(shared, "FHIR_ADMIN");
        history.mark_applied("FHIRDATA", ObjectKind::ForeignKey.as_str(), "FK_A2", 1);
        history
    }

    fn table(name: &str) -> SchemaObject {
        SchemaObject::table(
            "FHIRDATA",
            name,
            1,
            TableDef::new().with_column(ColumnDef::required("ID", ColumnType::BigInt)),
        )
    }

    #[test]
    fn test_dependencies_must_exist() {
        let mut model = PhysicalDataModel::new();
        let a = model.add_object(table("A")).unwrap();
        model.add_object(table("B").depends_on(a)).unwrap();

        let err = model
            .add_object(table("C").depends_on(ObjectId(42)))
            .unwrap_err();
        assert!(matches!(err, GraphError::MissingDependency { .. }));
        assert_eq!(model.len(), 2);
    }

    #[test]
    fn test_duplicate_rejected_per_kind() {
        let mut model = PhysicalDataModel::new();
        model.add_object(table("A")).unwrap();
        assert!(matches!(
            model.add_object(table("A")),
            Err(GraphError::Duplicate { .. })
        ));
        // same name, different kind
        model
            .add_object(SchemaObject::sequence("FHIRDATA", "A", 1, SequenceDef::default()))
            .unwrap();
        assert!(model.find("FHIRDATA", ObjectKind::Sequence, "A").is_some());
    }

    #[test]
    fn test_objects_by_tag_in_insertion_order() {
        let mut model = PhysicalDataModel::new();
        model.add_object(table("A").with_tag("SCHEMA_GROUP", "DATA")).unwrap();
        model.add_object(table("B").with_tag("SCHEMA_GROUP", "OAUTH")).unwrap();
        model.add_object(table("C").with_tag("SCHEMA_GROUP", "DATA")).unwrap();

        let names: Vec<&str> = model
            .objects_by_tag("SCHEMA_GROUP", "DATA")
            .iter()
            .map(|o| o.name.as_str())
            .collect();
        assert_eq!(names, vec!["A", "C"]);
        assert!(model.objects_by_tag("SCHEMA_GROUP", "BATCH").is_empty());
    }

    #[test]
    fn test_foreign_keys_grouped_by_child_table() {
        let mut model = PhysicalDataModel::new();
        let parent = model.add_object(table("PARENT")).unwrap();
        let child = model.add_object(table("CHILD").depends_on(parent)).unwrap();
        for (name, col) in [("FK_1", "A"), ("FK_2", "B")] {
            model
                .add_object(
                    SchemaObject::foreign_key(
                        "FHIRDATA",
                        name,
                        1,
                        ForeignKeyDef::new("CHILD", [col], "FHIRDATA", "PARENT", ["ID"]),
                    )
                    .depends_on_all([parent, child]),
                )
                .unwrap();
        }
        model
            .add_object(SchemaObject::foreign_key(
                "FHIRDATA",
                "FK_3",
                1,
                ForeignKeyDef::new("OTHER", ["X"], "FHIRDATA", "PARENT", ["ID"]),
            ))
            .unwrap();

        let groups = model.foreign_key_groups(None);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1][0].name, "FK_3");
    }

    #[test]
    fn test_foreign_keys_commit_per_child_table_when_split() {
        let adapter = RecordingAdapter::new(DbType::Citus);
        let history = history_for(&adapter);
        let model = foreign_key_model();

        let applied = model.apply_foreign_keys(adapter.as_ref(), &history, None).unwrap();
        assert_eq!(applied, 2);
        assert_eq!(
            adapter.journal.take(),
            vec![
                "begin",
                "apply FK_A1",
                "ledger FK_A1",
                "commit",
                "begin",
                "apply FK_B1",
                "ledger FK_B1",
                "commit",
            ]
        );
        assert_eq!(history.get_version("FHIRDATA", "FOREIGN_KEY", "FK_A1"), Some(1));
        assert_eq!(history.get_version("FHIRDATA", "FOREIGN_KEY", "FK_B1"), Some(1));

        // everything is ledgered now
        assert_eq!(model.apply_foreign_keys(adapter.as_ref(), &history, None).unwrap(), 0);
        assert_eq!(adapter.journal.take(), vec!["begin", "commit", "begin", "commit"]);
    }

    #[test]
    fn test_foreign_keys_share_one_transaction_when_not_split() {
        let adapter = RecordingAdapter::new(DbType::Postgres);
        let history = history_for(&adapter);

        let applied = foreign_key_model()
            .apply_foreign_keys(adapter.as_ref(), &history, None)
            .unwrap();
        assert_eq!(applied, 2);
        assert_eq!(
            adapter.journal.take(),
            vec!["begin", "apply FK_A1", "ledger FK_A1", "apply FK_B1", "ledger FK_B1", "commit"]
        );
    }

    #[test]
    fn test_distribution_rules_one_transaction_per_object() {
        let adapter = RecordingAdapter::new(DbType::Citus);
        let mut model = PhysicalDataModel::new();
        model
            .add_object(SchemaObject::table(
                "FHIRDATA",
                "RESOURCE_TYPES",
                1,
                TableDef::new()
                    .with_column(ColumnDef::required("ID", ColumnType::BigInt))
                    .reference(),
            ))
            .unwrap();
        model
            .add_object(SchemaObject::sequence("FHIRDATA", "FHIR_SEQUENCE", 1, SequenceDef::default()))
            .unwrap();
        let sharded = |name: &str| {
            SchemaObject::table(
                "FHIRDATA",
                name,
                1,
                TableDef::new()
                    .with_column(ColumnDef::required("LOGICAL_RESOURCE_ID", ColumnType::BigInt))
                    .distributed_by("LOGICAL_RESOURCE_ID"),
            )
        };
        model
            .add_object(SchemaObject::group(
                "FHIRDATA",
                "PATIENT_RESOURCE_TABLES",
                1,
                vec![sharded("PATIENT_LOGICAL_RESOURCES"), table("PATIENT_NOTES"), sharded("PATIENT_RESOURCES")],
            ))
            .unwrap();

        let distributed = model.apply_distribution_rules(adapter.as_ref(), None).unwrap();
        assert_eq!(distributed, 3);
        assert_eq!(
            adapter.journal.take(),
            vec![
                "begin",
                "distribute RESOURCE_TYPES",
                "commit",
                "begin",
                "commit",
                "begin",
                "distribute PATIENT_LOGICAL_RESOURCES",
                "distribute PATIENT_RESOURCES",
                "commit",
            ]
        );
    }

    #[test]
    fn test_grants_split_transactions_on_distributed_dialect() {
        let mut model = PhysicalDataModel::new();
        model.add_object(table("A")).unwrap();
        model.add_object(table("B")).unwrap();

        let citus = RecordingAdapter::new(DbType::Citus);
        model.apply_grants(citus.as_ref(), None, &[Privilege::Select], "FHIRSERVER").unwrap();
        assert_eq!(
            citus.journal.take(),
            vec!["begin", "commit", "begin", "grant A FHIRSERVER", "commit", "begin", "grant B FHIRSERVER", "commit"]
        );

        let postgres = RecordingAdapter::new(DbType::Postgres);
        model.apply_grants(postgres.as_ref(), None, &[Privilege::Select], "FHIRSERVER").unwrap();
        assert_eq!(
            postgres.journal.take(),
            vec!["begin", "commit", "begin", "grant A FHIRSERVER", "grant B FHIRSERVER", "commit"]
        );
    }

    #[test]
    fn test_describe_lists_dependencies() {
        let mut model = PhysicalDataModel::new();
        let a = model.add_object(table("A").with_tag("SCHEMA_GROUP", "DATA")).unwrap();
        model.add_object(table("B").depends_on(a)).unwrap();

        let description = model.describe();
        assert_eq!(description.object_count, 2);
        assert_eq!(description.objects[1].dependencies, vec!["FHIRDATA.A"]);
        assert_eq!(description.objects[0].tags, vec!["SCHEMA_GROUP=DATA"]);
    }
}
