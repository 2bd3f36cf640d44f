//! Deployment against a live PostgreSQL server.
//!
//! Set `FHIRSCHEMA_PG_URL` (e.g. `postgres://fhiradmin:pw@localhost/fhirdb`)
//! to run these; they are skipped otherwise.

use std::sync::Arc;

use fhirschema_core::adapter::DialectAdapter;
use fhirschema_core::{
    ColumnDef, ColumnType, DbType, DeployConfig, DeployOutcome, ForeignKeyDef, LogicalSchema,
    MigrationOrchestrator, PhysicalDataModel, PoolConfig, Result, RoutineDef, SchemaObject,
    SequenceDef, TableDef,
};
use fhirschema_postgres::{PgConnectionFactory, PostgresAdapter};

fn adapter() -> Option<Arc<dyn DialectAdapter>> {
    let url = std::env::var("FHIRSCHEMA_PG_URL").ok()?;
    let factory = PgConnectionFactory::from_url(&url).unwrap();
    Some(Arc::new(PostgresAdapter::new(factory, PoolConfig::for_workers(2, 4), false)))
}

struct SmallSchema {
    schema: String,
}

impl LogicalSchema for SmallSchema {
    fn name(&self) -> &str {
        "small"
    }

    fn schema_name(&self) -> &str {
        &self.schema
    }

    fn latest_version(&self) -> i32 {
        1
    }

    fn build(&self, model: &mut PhysicalDataModel) -> Result<()> {
        let s = self.schema.as_str();
        let seq = model.add_object(SchemaObject::sequence(s, "FHIR_SEQUENCE", 1, SequenceDef::default()))?;
        let parent = model.add_object(SchemaObject::table(
            s,
            "RESOURCE_TYPES",
            1,
            TableDef::new()
                .with_column(ColumnDef::required("RESOURCE_TYPE_ID", ColumnType::Integer))
                .with_column(ColumnDef::required("RESOURCE_TYPE", ColumnType::Varchar(64)))
                .with_primary_key("PK_RESOURCE_TYPES", ["RESOURCE_TYPE_ID"]),
        ))?;
        let child = model.add_object(
            SchemaObject::table(
                s,
                "LOGICAL_RESOURCES",
                1,
                TableDef::new()
                    .with_column(ColumnDef::required("LOGICAL_RESOURCE_ID", ColumnType::BigInt))
                    .with_column(ColumnDef::required("RESOURCE_TYPE_ID", ColumnType::Integer))
                    .with_primary_key("PK_LOGICAL_RESOURCES", ["LOGICAL_RESOURCE_ID"]),
            )
            .depends_on_all([seq, parent]),
        )?;
        model.add_object(
            SchemaObject::foreign_key(
                s,
                "FK_LR_RESOURCE_TYPE",
                1,
                ForeignKeyDef::new("LOGICAL_RESOURCES", ["RESOURCE_TYPE_ID"], s, "RESOURCE_TYPES", ["RESOURCE_TYPE_ID"]),
            )
            .depends_on(child),
        )?;
        model.add_object(SchemaObject::function(
            s,
            "NEXT_ID",
            1,
            RoutineDef::new()
                .with_signature("()")
                .with_body(
                    DbType::Postgres,
                    format!(
                        "CREATE OR REPLACE FUNCTION {s}.NEXT_ID() RETURNS BIGINT LANGUAGE sql AS $$ SELECT nextval('{s}.FHIR_SEQUENCE') $$"
                    ),
                ),
        ).depends_on(seq))?;
        Ok(())
    }
}

#[test]
fn test_deploy_and_drop() {
    let Some(adapter) = adapter() else {
        eprintln!("FHIRSCHEMA_PG_URL not set, skipping");
        return;
    };
    let schema = SmallSchema {
        schema: format!("FHIRTEST_{}", std::process::id()),
    };
    let orchestrator = MigrationOrchestrator::new(
        adapter.clone(),
        DeployConfig::new()
            .with_admin_schema(format!("FHIRTEST_ADMIN_{}", std::process::id()))
            .with_thread_pool_size(2),
    );

    match orchestrator.update_schema(&schema).unwrap() {
        DeployOutcome::Applied(report) => assert_eq!(report.objects_applied, 5),
        other => panic!("unexpected {:?}", other),
    }
    assert!(orchestrator.update_schema(&schema).unwrap().is_up_to_date());
    assert!(orchestrator.check_compatibility(&schema).unwrap());

    let mut conn = adapter.connection().unwrap();
    let objects = adapter.list_schema_objects(&mut *conn, &schema.schema).unwrap();
    assert!(objects.iter().any(|o| o.object_type == "SEQUENCE"));
    assert!(objects.iter().any(|o| o.object_type == "FUNCTION"));
    drop(conn);

    orchestrator.drop_schema(&schema, true).unwrap();
    orchestrator.drop_admin(true).unwrap();
}
