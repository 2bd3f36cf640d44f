//! Job repository tables for the bulk data batch runtime.

use fhirschema_core::migration::LogicalSchema;
use fhirschema_core::{
    ColumnDef, ColumnType, ForeignKeyDef, IndexDef, PhysicalDataModel, Result, SchemaObject, SequenceDef,
    TableDef, Tag,
};

use crate::tags::{DEFAULT_BATCH_SCHEMA, JBATCH_GROUP, SCHEMA_GROUP_TAG};

pub const JOB_INSTANCE_DATA: &str = "JOBINSTANCEDATA";
pub const EXECUTION_INSTANCE_DATA: &str = "EXECUTIONINSTANCEDATA";
pub const STEP_EXECUTION_INSTANCE_DATA: &str = "STEPEXECUTIONINSTANCEDATA";

#[derive(Debug, Clone)]
pub struct BatchSchema {
    schema: String,
}

impl BatchSchema {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into().to_ascii_uppercase(),
        }
    }

    fn tagged(obj: SchemaObject) -> SchemaObject {
        obj.with_tag(SCHEMA_GROUP_TAG, JBATCH_GROUP)
    }
}

impl Default for BatchSchema {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SCHEMA)
    }
}

impl LogicalSchema for BatchSchema {
    fn name(&self) -> &str {
        "batch"
    }

    fn schema_name(&self) -> &str {
        &self.schema
    }

    fn latest_version(&self) -> i32 {
        1
    }

    fn tag(&self) -> Option<Tag> {
        Some(Tag::new(SCHEMA_GROUP_TAG, JBATCH_GROUP))
    }

    fn build(&self, model: &mut PhysicalDataModel) -> Result<()> {
        let s = self.schema.as_str();
        let seq = model.add_object(Self::tagged(SchemaObject::sequence(
            s,
            "JBATCH_SEQUENCE",
            1,
            SequenceDef::default(),
        )))?;

        let jobs = model.add_object(Self::tagged(
            SchemaObject::table(
                s,
                JOB_INSTANCE_DATA,
                1,
                TableDef::new()
                    .with_column(ColumnDef::required("JOBINSTANCEID", ColumnType::BigInt))
                    .with_column(ColumnDef::nullable("NAME", ColumnType::Varchar(512)))
                    .with_column(ColumnDef::nullable("APPTAG", ColumnType::Varchar(512)))
                    .with_column(ColumnDef::nullable("BATCHSTATUS", ColumnType::Integer))
                    .with_column(ColumnDef::nullable("EXITSTATUS", ColumnType::Varchar(512)))
                    .with_column(ColumnDef::nullable("UPDATETIME", ColumnType::Timestamp))
                    .with_primary_key("PK_JOBINSTANCEDATA", ["JOBINSTANCEID"]),
            )
            .depends_on(seq),
        ))?;
        let executions = model.add_object(Self::tagged(
            SchemaObject::table(
                s,
                EXECUTION_INSTANCE_DATA,
                1,
                TableDef::new()
                    .with_column(ColumnDef::required("JOBEXECID", ColumnType::BigInt))
                    .with_column(ColumnDef::required("JOBINSTANCEID", ColumnType::BigInt))
                    .with_column(ColumnDef::nullable("CREATETIME", ColumnType::Timestamp))
                    .with_column(ColumnDef::nullable("STARTTIME", ColumnType::Timestamp))
                    .with_column(ColumnDef::nullable("ENDTIME", ColumnType::Timestamp))
                    .with_column(ColumnDef::nullable("BATCHSTATUS", ColumnType::Integer))
                    .with_column(ColumnDef::nullable("EXITSTATUS", ColumnType::Varchar(512)))
                    .with_column(ColumnDef::nullable("JOBPARAMETERS", ColumnType::Blob))
                    .with_primary_key("PK_EXECUTIONINSTANCEDATA", ["JOBEXECID"])
                    .with_index(IndexDef::new("IDX_EXECUTIONINSTANCE_JI", ["JOBINSTANCEID"])),
            )
            .depends_on(jobs),
        ))?;
        let steps = model.add_object(Self::tagged(
            SchemaObject::table(
                s,
                STEP_EXECUTION_INSTANCE_DATA,
                1,
                TableDef::new()
                    .with_column(ColumnDef::required("STEPEXECID", ColumnType::BigInt))
                    .with_column(ColumnDef::required("JOBEXECID", ColumnType::BigInt))
                    .with_column(ColumnDef::nullable("STEPNAME", ColumnType::Varchar(512)))
                    .with_column(ColumnDef::nullable("BATCHSTATUS", ColumnType::Integer))
                    .with_column(ColumnDef::nullable("EXITSTATUS", ColumnType::Varchar(512)))
                    .with_column(ColumnDef::nullable("READCOUNT", ColumnType::Integer))
                    .with_column(ColumnDef::nullable("WRITECOUNT", ColumnType::Integer))
                    .with_column(ColumnDef::nullable("PERSISTENTDATA", ColumnType::Blob))
                    .with_primary_key("PK_STEPEXECUTIONINSTANCEDATA", ["STEPEXECID"])
                    .with_index(IndexDef::new("IDX_STEPEXECUTION_JE", ["JOBEXECID"])),
            )
            .depends_on(executions),
        ))?;

        model.add_object(Self::tagged(
            SchemaObject::foreign_key(
                s,
                "FK_EXECUTIONINSTANCE_JOBINSTANCE",
                1,
                ForeignKeyDef::new(EXECUTION_INSTANCE_DATA, ["JOBINSTANCEID"], s, JOB_INSTANCE_DATA, ["JOBINSTANCEID"]),
            )
            .depends_on_all([executions, jobs]),
        ))?;
        model.add_object(Self::tagged(
            SchemaObject::foreign_key(
                s,
                "FK_STEPEXECUTION_EXECUTION",
                1,
                ForeignKeyDef::new(
                    STEP_EXECUTION_INSTANCE_DATA,
                    ["JOBEXECID"],
                    s,
                    EXECUTION_INSTANCE_DATA,
                    ["JOBEXECID"],
                ),
            )
            .depends_on_all([steps, executions]),
        ))?;
        Ok(())
    }
}
