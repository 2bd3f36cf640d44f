//! The FHIR data schema: reference tables, the global logical resource
//! table and one table group per resource type.

use fhirschema_core::migration::{LogicalSchema, MigrationContext, MigrationStep};
use fhirschema_core::{
    ColumnDef, ColumnType, DbType, ForeignKeyDef, IndexDef, ObjectId, PhysicalDataModel, Result,
    RoutineDef, SchemaObject, SequenceDef, TableDef, Tag,
};

use crate::migrations;
use crate::resource_types::RESOURCE_TYPES;
use crate::tags::{DEFAULT_DATA_SCHEMA, FHIRDATA_GROUP, RESOURCE_TYPE_TAG, SCHEMA_GROUP_TAG};
use crate::version::FhirSchemaVersion;

pub const FHIR_SEQUENCE: &str = "FHIR_SEQUENCE";
pub const FHIR_REF_SEQUENCE: &str = "FHIR_REF_SEQUENCE";
pub const RESOURCE_TYPES_TABLE: &str = "RESOURCE_TYPES";
pub const PARAMETER_NAMES: &str = "PARAMETER_NAMES";
pub const CODE_SYSTEMS: &str = "CODE_SYSTEMS";
pub const LOGICAL_RESOURCES: &str = "LOGICAL_RESOURCES";
pub const COMMON_TOKEN_VALUES: &str = "COMMON_TOKEN_VALUES";
pub const RESOURCE_CHANGE_LOG: &str = "RESOURCE_CHANGE_LOG";

/// Value stored in `IS_DELETED` by rows written before `V0002`.
pub const IS_DELETED_UNSET: &str = "X";

pub fn logical_resources_table(resource_type: &str) -> String {
    format!("{}_LOGICAL_RESOURCES", resource_type.to_ascii_uppercase())
}

pub fn resources_table(resource_type: &str) -> String {
    format!("{}_RESOURCES", resource_type.to_ascii_uppercase())
}

pub fn str_values_table(resource_type: &str) -> String {
    format!("{}_STR_VALUES", resource_type.to_ascii_uppercase())
}

pub fn token_refs_table(resource_type: &str) -> String {
    format!("{}_RESOURCE_TOKEN_REFS", resource_type.to_ascii_uppercase())
}

/// The group holding every table of one resource type.
///
/// Also used by the `V0005` step to drop groups of removed types, which the
/// current model no longer declares.
pub fn resource_type_group(schema: &str, resource_type: &str) -> SchemaObject {
    let prefix = resource_type.to_ascii_uppercase();
    let logical = SchemaObject::table(
        schema,
        logical_resources_table(resource_type),
        1,
        TableDef::new()
            .with_column(ColumnDef::required("LOGICAL_RESOURCE_ID", ColumnType::BigInt))
            .with_column(ColumnDef::required("LOGICAL_ID", ColumnType::Varchar(255)))
            .with_column(ColumnDef::nullable("VERSION_ID", ColumnType::Integer))
            .with_column(
                ColumnDef::required("IS_DELETED", ColumnType::Char(1))
                    .with_default(format!("'{}'", IS_DELETED_UNSET))
                    .since(2),
            )
            .with_column(ColumnDef::nullable("LAST_UPDATED", ColumnType::Timestamp).since(2))
            .with_primary_key(format!("PK_{}_LOGICAL_RESOURCES", prefix), ["LOGICAL_RESOURCE_ID"])
            .with_index(IndexDef::unique(
                format!("IDX_{}_LR_LOGICAL_ID", prefix),
                ["LOGICAL_ID", "LOGICAL_RESOURCE_ID"],
            ))
            .distributed_by("LOGICAL_RESOURCE_ID"),
    );
    let resources = SchemaObject::table(
        schema,
        resources_table(resource_type),
        1,
        TableDef::new()
            .with_column(ColumnDef::required("LOGICAL_RESOURCE_ID", ColumnType::BigInt))
            .with_column(ColumnDef::required("VERSION_ID", ColumnType::Integer))
            .with_column(ColumnDef::required("LAST_UPDATED", ColumnType::Timestamp))
            .with_column(ColumnDef::required("IS_DELETED", ColumnType::Char(1)))
            .with_column(ColumnDef::nullable("DATA", ColumnType::Blob))
            .with_primary_key(
                format!("PK_{}_RESOURCES", prefix),
                ["LOGICAL_RESOURCE_ID", "VERSION_ID"],
            )
            .distributed_by("LOGICAL_RESOURCE_ID"),
    );
    let str_values = SchemaObject::table(
        schema,
        str_values_table(resource_type),
        1,
        TableDef::new()
            .with_column(ColumnDef::required("PARAMETER_NAME_ID", ColumnType::Integer))
            .with_column(ColumnDef::nullable("STR_VALUE", ColumnType::Varchar(1024)))
            .with_column(ColumnDef::nullable("STR_VALUE_LCASE", ColumnType::Varchar(1024)))
            .with_column(ColumnDef::required("LOGICAL_RESOURCE_ID", ColumnType::BigInt))
            .with_index(IndexDef::new(
                format!("IDX_{}_STR_VALUES_RPS", prefix),
                ["LOGICAL_RESOURCE_ID", "PARAMETER_NAME_ID", "STR_VALUE"],
            ))
            .distributed_by("LOGICAL_RESOURCE_ID"),
    );
    let token_refs = SchemaObject::table(
        schema,
        token_refs_table(resource_type),
        1,
        TableDef::new()
            .with_column(ColumnDef::required("PARAMETER_NAME_ID", ColumnType::Integer))
            .with_column(ColumnDef::nullable("COMMON_TOKEN_VALUE_ID", ColumnType::BigInt))
            .with_column(ColumnDef::required("LOGICAL_RESOURCE_ID", ColumnType::BigInt))
            .with_index(IndexDef::new(
                format!("IDX_{}_RTR_TPLR", prefix),
                ["COMMON_TOKEN_VALUE_ID", "PARAMETER_NAME_ID", "LOGICAL_RESOURCE_ID"],
            ))
            .distributed_by("LOGICAL_RESOURCE_ID"),
    );
    SchemaObject::group(
        schema,
        format!("{}_RESOURCE_TABLES", prefix),
        FhirSchemaVersion::V0002.vid(),
        vec![logical, resources, str_values, token_refs],
    )
    .with_tag(SCHEMA_GROUP_TAG, FHIRDATA_GROUP)
    .with_tag(RESOURCE_TYPE_TAG, resource_type)
}

/// The data schema deployed into `FHIRDATA` (or another name).
#[derive(Debug, Clone)]
pub struct FhirDataSchema {
    schema: String,
}

impl FhirDataSchema {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into().to_ascii_uppercase(),
        }
    }

    fn add(&self, model: &mut PhysicalDataModel, obj: SchemaObject) -> Result<ObjectId> {
        Ok(model.add_object(obj.with_tag(SCHEMA_GROUP_TAG, FHIRDATA_GROUP))?)
    }

    fn foreign_key(&self, name: String, version: i32, def: ForeignKeyDef) -> SchemaObject {
        SchemaObject::foreign_key(&self.schema, name, version, def)
    }

    fn references(&self, table: String, columns: &[&str], target: &str, target_columns: &[&str]) -> ForeignKeyDef {
        ForeignKeyDef::new(
            table,
            columns.iter().copied(),
            &self.schema,
            target,
            target_columns.iter().copied(),
        )
    }

    fn add_resource_type_function(&self) -> RoutineDef {
        let s = &self.schema;
        let body = format!(
            "CREATE OR REPLACE FUNCTION {s}.ADD_RESOURCE_TYPE(p_resource_type VARCHAR) RETURNS INT \
             LANGUAGE plpgsql AS $$ \
             DECLARE v_id INT; \
             BEGIN \
               SELECT RESOURCE_TYPE_ID INTO v_id FROM {s}.RESOURCE_TYPES WHERE RESOURCE_TYPE = p_resource_type; \
               IF v_id IS NULL THEN \
                 SELECT COALESCE(MAX(RESOURCE_TYPE_ID), 0) + 1 INTO v_id FROM {s}.RESOURCE_TYPES; \
                 INSERT INTO {s}.RESOURCE_TYPES (RESOURCE_TYPE_ID, RESOURCE_TYPE) VALUES (v_id, p_resource_type); \
               END IF; \
               RETURN v_id; \
             END $$"
        );
        RoutineDef::new()
            .with_signature("(VARCHAR)")
            .with_body(DbType::Postgres, body.clone())
            .with_body(DbType::Citus, body)
    }
}

impl Default for FhirDataSchema {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_SCHEMA)
    }
}

impl LogicalSchema for FhirDataSchema {
    fn name(&self) -> &str {
        "fhir"
    }

    fn schema_name(&self) -> &str {
        &self.schema
    }

    fn latest_version(&self) -> i32 {
        FhirSchemaVersion::latest().vid()
    }

    fn tag(&self) -> Option<Tag> {
        Some(Tag::new(SCHEMA_GROUP_TAG, FHIRDATA_GROUP))
    }

    fn build(&self, model: &mut PhysicalDataModel) -> Result<()> {
        let s = self.schema.as_str();

        let tablespace = self.add(model, SchemaObject::tablespace(s, "FHIR_TS", 1))?;
        self.add(model, SchemaObject::session_variable(s, "SV_TENANT_ID", 1))?;
        let seq = self.add(model, SchemaObject::sequence(s, FHIR_SEQUENCE, 1, SequenceDef::default()))?;
        let ref_seq = self.add(
            model,
            SchemaObject::sequence(s, FHIR_REF_SEQUENCE, 1, SequenceDef { start: 1000, cache: 1000 }),
        )?;

        let resource_types = self.add(
            model,
            SchemaObject::table(
                s,
                RESOURCE_TYPES_TABLE,
                1,
                TableDef::new()
                    .with_column(ColumnDef::required("RESOURCE_TYPE_ID", ColumnType::Integer))
                    .with_column(ColumnDef::required("RESOURCE_TYPE", ColumnType::Varchar(64)))
                    .with_primary_key("PK_RESOURCE_TYPES", ["RESOURCE_TYPE_ID"])
                    .with_index(IndexDef::unique("IDX_UNQ_RESOURCE_TYPES_RT", ["RESOURCE_TYPE"]))
                    .reference(),
            )
            .depends_on(tablespace),
        )?;
        let parameter_names = self.add(
            model,
            SchemaObject::table(
                s,
                PARAMETER_NAMES,
                1,
                TableDef::new()
                    .with_column(ColumnDef::required("PARAMETER_NAME_ID", ColumnType::Integer))
                    .with_column(ColumnDef::required("PARAMETER_NAME", ColumnType::Varchar(255)))
                    .with_primary_key("PK_PARAMETER_NAMES", ["PARAMETER_NAME_ID"])
                    .with_index(IndexDef::unique("IDX_PARAMETER_NAME", ["PARAMETER_NAME"]))
                    .reference(),
            )
            .depends_on_all([tablespace, ref_seq]),
        )?;
        let code_systems = self.add(
            model,
            SchemaObject::table(
                s,
                CODE_SYSTEMS,
                1,
                TableDef::new()
                    .with_column(ColumnDef::required("CODE_SYSTEM_ID", ColumnType::Integer))
                    .with_column(ColumnDef::required("CODE_SYSTEM_NAME", ColumnType::Varchar(255)))
                    .with_primary_key("PK_CODE_SYSTEMS", ["CODE_SYSTEM_ID"])
                    .with_index(IndexDef::unique("IDX_CODE_SYSTEM_CINM", ["CODE_SYSTEM_NAME"]))
                    .reference(),
            )
            .depends_on_all([tablespace, ref_seq]),
        )?;

        let logical_resources = self.add(
            model,
            SchemaObject::table(
                s,
                LOGICAL_RESOURCES,
                FhirSchemaVersion::V0004.vid(),
                TableDef::new()
                    .with_column(ColumnDef::required("LOGICAL_RESOURCE_ID", ColumnType::BigInt))
                    .with_column(ColumnDef::required("RESOURCE_TYPE_ID", ColumnType::Integer))
                    .with_column(ColumnDef::required("LOGICAL_ID", ColumnType::Varchar(255)))
                    .with_column(
                        ColumnDef::required("IS_DELETED", ColumnType::Char(1))
                            .with_default(format!("'{}'", IS_DELETED_UNSET))
                            .since(2),
                    )
                    .with_column(ColumnDef::nullable("LAST_UPDATED", ColumnType::Timestamp).since(2))
                    .with_column(ColumnDef::nullable("VERSION_ID", ColumnType::Integer).since(4))
                    .with_primary_key("PK_LOGICAL_RESOURCES", ["LOGICAL_RESOURCE_ID"])
                    .with_index(IndexDef::unique(
                        "IDX_LOGICAL_RESOURCES_RITLI",
                        ["RESOURCE_TYPE_ID", "LOGICAL_ID"],
                    ))
                    .reference(),
            )
            .depends_on_all([tablespace, seq, resource_types]),
        )?;
        self.add(
            model,
            self.foreign_key(
                "FK_LOGICAL_RESOURCES_RTID".to_string(),
                1,
                self.references(
                    LOGICAL_RESOURCES.to_string(),
                    &["RESOURCE_TYPE_ID"],
                    RESOURCE_TYPES_TABLE,
                    &["RESOURCE_TYPE_ID"],
                ),
            )
            .depends_on_all([logical_resources, resource_types]),
        )?;

        let common_tokens = self.add(
            model,
            SchemaObject::table(
                s,
                COMMON_TOKEN_VALUES,
                1,
                TableDef::new()
                    .with_column(ColumnDef::required("COMMON_TOKEN_VALUE_ID", ColumnType::BigInt))
                    .with_column(ColumnDef::required("CODE_SYSTEM_ID", ColumnType::Integer))
                    .with_column(ColumnDef::required("TOKEN_VALUE", ColumnType::Varchar(1024)))
                    .with_primary_key("PK_COMMON_TOKEN_VALUES", ["COMMON_TOKEN_VALUE_ID"])
                    .with_index(IndexDef::unique(
                        "IDX_COMMON_TOKEN_VALUES_TVCP",
                        ["TOKEN_VALUE", "CODE_SYSTEM_ID", "COMMON_TOKEN_VALUE_ID"],
                    ))
                    .distributed_by("COMMON_TOKEN_VALUE_ID"),
            )
            .depends_on_all([tablespace, ref_seq, code_systems]),
        )?;
        self.add(
            model,
            self.foreign_key(
                "FK_COMMON_TOKEN_VALUES_CSID".to_string(),
                1,
                self.references(
                    COMMON_TOKEN_VALUES.to_string(),
                    &["CODE_SYSTEM_ID"],
                    CODE_SYSTEMS,
                    &["CODE_SYSTEM_ID"],
                ),
            )
            .depends_on_all([common_tokens, code_systems]),
        )?;

        self.add(
            model,
            SchemaObject::table(
                s,
                RESOURCE_CHANGE_LOG,
                FhirSchemaVersion::V0003.vid(),
                TableDef::new()
                    .with_column(ColumnDef::required("RESOURCE_ID", ColumnType::BigInt))
                    .with_column(ColumnDef::required("RESOURCE_TYPE_ID", ColumnType::Integer))
                    .with_column(ColumnDef::required("LOGICAL_RESOURCE_ID", ColumnType::BigInt))
                    .with_column(ColumnDef::required("CHANGE_TSTAMP", ColumnType::Timestamp))
                    .with_column(ColumnDef::required("VERSION_ID", ColumnType::Integer))
                    .with_column(ColumnDef::required("CHANGE_TYPE", ColumnType::Char(1)))
                    .with_primary_key("PK_RESOURCE_CHANGE_LOG", ["RESOURCE_ID"])
                    .with_index(IndexDef::new("IDX_RESOURCE_CHANGE_LOG_CTRI", ["CHANGE_TSTAMP", "RESOURCE_ID"]))
                    .reference(),
            )
            .depends_on_all([tablespace, seq]),
        )?;

        for (_, resource_type) in RESOURCE_TYPES {
            let group = model.add_object(
                resource_type_group(s, resource_type).depends_on_all([
                    tablespace,
                    logical_resources,
                    common_tokens,
                    parameter_names,
                ]),
            )?;
            let prefix = resource_type.to_ascii_uppercase();
            self.add(
                model,
                self.foreign_key(
                    format!("FK_{}_RESOURCES_LR", prefix),
                    1,
                    self.references(
                        resources_table(resource_type),
                        &["LOGICAL_RESOURCE_ID"],
                        &logical_resources_table(resource_type),
                        &["LOGICAL_RESOURCE_ID"],
                    ),
                )
                .with_tag(RESOURCE_TYPE_TAG, *resource_type)
                .depends_on(group),
            )?;
            self.add(
                model,
                self.foreign_key(
                    format!("FK_{}_STR_VALUES_PN", prefix),
                    1,
                    self.references(
                        str_values_table(resource_type),
                        &["PARAMETER_NAME_ID"],
                        PARAMETER_NAMES,
                        &["PARAMETER_NAME_ID"],
                    ),
                )
                .with_tag(RESOURCE_TYPE_TAG, *resource_type)
                .depends_on_all([group, parameter_names]),
            )?;
            self.add(
                model,
                self.foreign_key(
                    format!("FK_{}_RESOURCE_TOKEN_REFS_CTV", prefix),
                    1,
                    self.references(
                        token_refs_table(resource_type),
                        &["COMMON_TOKEN_VALUE_ID"],
                        COMMON_TOKEN_VALUES,
                        &["COMMON_TOKEN_VALUE_ID"],
                    )
                    // sharded on different columns
                    .not_enforced_on_distributed(),
                )
                .with_tag(RESOURCE_TYPE_TAG, *resource_type)
                .depends_on_all([group, common_tokens]),
            )?;
        }

        self.add(
            model,
            SchemaObject::function(s, "ADD_RESOURCE_TYPE", 1, self.add_resource_type_function())
                .depends_on(resource_types),
        )?;
        Ok(())
    }

    fn migrations(&self) -> Vec<Box<dyn MigrationStep>> {
        migrations::data_migrations()
    }

    fn load_reference_data(&self, ctx: &MigrationContext<'_>) -> Result<()> {
        let table = ctx.qualified(RESOURCE_TYPES_TABLE);
        let sql = format!(
            "INSERT INTO {table} (RESOURCE_TYPE_ID, RESOURCE_TYPE) \
             SELECT ?, ? WHERE NOT EXISTS (SELECT 1 FROM {table} WHERE RESOURCE_TYPE = ?)"
        );
        let inserted = ctx.transaction(|conn| {
            let mut inserted = 0;
            for (id, resource_type) in RESOURCE_TYPES {
                inserted += conn.execute(&sql, &[(*id).into(), (*resource_type).into(), (*resource_type).into()])?;
            }
            Ok(inserted)
        })?;
        tracing::info!(schema = ctx.schema(), inserted, "resource types loaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhirschema_core::{ObjectDefinition, ObjectKind};

    fn model() -> PhysicalDataModel {
        let mut model = PhysicalDataModel::new();
        FhirDataSchema::default().build(&mut model).unwrap();
        model
    }

    #[test]
    fn test_every_object_is_tagged() {
        let model = model();
        let tagged = model.objects_by_tag(SCHEMA_GROUP_TAG, FHIRDATA_GROUP).len();
        assert_eq!(tagged, model.len());
    }

    #[test]
    fn test_one_group_per_resource_type() {
        let model = model();
        for (_, resource_type) in RESOURCE_TYPES {
            let objects = model.objects_by_tag(RESOURCE_TYPE_TAG, resource_type);
            let groups: Vec<_> = objects.iter().filter(|o| o.kind() == ObjectKind::ObjectGroup).collect();
            assert_eq!(groups.len(), 1, "{}", resource_type);
            match &groups[0].definition {
                ObjectDefinition::Group(children) => assert_eq!(children.len(), 4),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_token_refs_fk_not_enforced_on_citus() {
        let model = model();
        let fk = model
            .find("FHIRDATA", ObjectKind::ForeignKey, "FK_PATIENT_RESOURCE_TOKEN_REFS_CTV")
            .and_then(|id| model.get(id))
            .unwrap();
        match &fk.definition {
            ObjectDefinition::ForeignKey(def) => assert!(!def.enforce_on_distributed),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_schema_name_is_uppercased() {
        assert_eq!(FhirDataSchema::new("fhirdata2").schema_name(), "FHIRDATA2");
        assert_eq!(logical_resources_table("Patient"), "PATIENT_LOGICAL_RESOURCES");
    }
}
