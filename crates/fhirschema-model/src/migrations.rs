//! Numbered data migrations of the FHIR data schema.
//!
//! Backfills commit once per resource type, so a step interrupted halfway
//! only redoes the types it had not finished; each update is guarded so
//! rows already migrated are left alone.

use fhirschema_core::migration::{MigrationContext, MigrationStep};
use fhirschema_core::Result;

use crate::data::{
    logical_resources_table, resource_type_group, resources_table, IS_DELETED_UNSET, LOGICAL_RESOURCES,
    RESOURCE_TYPES_TABLE,
};
use crate::resource_types::{REMOVED_RESOURCE_TYPES, RESOURCE_TYPES};
use crate::version::FhirSchemaVersion;

pub fn data_migrations() -> Vec<Box<dyn MigrationStep>> {
    vec![
        Box::new(BackfillDeletedAndUpdated),
        Box::new(BackfillGlobalVersionId),
        Box::new(RemoveDeprecatedResourceTypes),
    ]
}

/// Copy `IS_DELETED` and `LAST_UPDATED` from each resource's current
/// version onto its logical resource row.
pub struct BackfillDeletedAndUpdated;

impl MigrationStep for BackfillDeletedAndUpdated {
    fn version(&self) -> i32 {
        FhirSchemaVersion::V0002.vid()
    }

    fn description(&self) -> &str {
        FhirSchemaVersion::V0002.description()
    }

    fn apply(&self, ctx: &MigrationContext<'_>) -> Result<()> {
        for (_, resource_type) in RESOURCE_TYPES {
            let logical = ctx.qualified(&logical_resources_table(resource_type));
            let resources = ctx.qualified(&resources_table(resource_type));
            let current = "r.LOGICAL_RESOURCE_ID = lr.LOGICAL_RESOURCE_ID AND r.VERSION_ID = lr.VERSION_ID";
            let sql = format!(
                "UPDATE {logical} AS lr \
                    SET IS_DELETED = (SELECT r.IS_DELETED FROM {resources} r WHERE {current}), \
                        LAST_UPDATED = (SELECT r.LAST_UPDATED FROM {resources} r WHERE {current}) \
                  WHERE lr.IS_DELETED = ? \
                    AND EXISTS (SELECT 1 FROM {resources} r WHERE {current})"
            );
            let updated = ctx.transaction(|conn| conn.execute(&sql, &[IS_DELETED_UNSET.into()]))?;
            tracing::info!(resource_type, updated, "backfilled is_deleted and last_updated");
        }
        Ok(())
    }
}

/// Copy the current `VERSION_ID` of each resource onto the global
/// `LOGICAL_RESOURCES` table.
pub struct BackfillGlobalVersionId;

impl MigrationStep for BackfillGlobalVersionId {
    fn version(&self) -> i32 {
        FhirSchemaVersion::V0004.vid()
    }

    fn description(&self) -> &str {
        FhirSchemaVersion::V0004.description()
    }

    fn apply(&self, ctx: &MigrationContext<'_>) -> Result<()> {
        let global = ctx.qualified(LOGICAL_RESOURCES);
        for (id, resource_type) in RESOURCE_TYPES {
            let per_type = ctx.qualified(&logical_resources_table(resource_type));
            let sql = format!(
                "UPDATE {global} AS lr \
                    SET VERSION_ID = (SELECT x.VERSION_ID FROM {per_type} x WHERE x.LOGICAL_RESOURCE_ID = lr.LOGICAL_RESOURCE_ID) \
                  WHERE lr.RESOURCE_TYPE_ID = ? \
                    AND lr.VERSION_ID IS NULL \
                    AND EXISTS (SELECT 1 FROM {per_type} x WHERE x.LOGICAL_RESOURCE_ID = lr.LOGICAL_RESOURCE_ID)"
            );
            let updated = ctx.transaction(|conn| conn.execute(&sql, &[(*id).into()]))?;
            tracing::info!(resource_type, updated, "backfilled version_id");
        }
        Ok(())
    }
}

/// Drop the tables of resource types the server no longer supports.
///
/// Refuses to run while any logical resource of those types remains, since
/// dropping would lose data the operator has not exported.
pub struct RemoveDeprecatedResourceTypes;

impl MigrationStep for RemoveDeprecatedResourceTypes {
    fn version(&self) -> i32 {
        FhirSchemaVersion::V0005.vid()
    }

    fn description(&self) -> &str {
        FhirSchemaVersion::V0005.description()
    }

    fn precondition(&self, ctx: &MigrationContext<'_>) -> Result<()> {
        for (id, resource_type) in REMOVED_RESOURCE_TYPES {
            let remaining = ctx.count_rows(LOGICAL_RESOURCES, Some("RESOURCE_TYPE_ID = ?"), &[(*id).into()])?;
            ctx.require(remaining == 0, || {
                format!(
                    "{} {} resources remain in {}; remove them before upgrading",
                    remaining,
                    resource_type,
                    ctx.schema()
                )
            })?;
        }
        Ok(())
    }

    fn apply(&self, ctx: &MigrationContext<'_>) -> Result<()> {
        let adapter = ctx.adapter();
        let resource_types = ctx.qualified(RESOURCE_TYPES_TABLE);
        for (id, resource_type) in REMOVED_RESOURCE_TYPES {
            let group = resource_type_group(ctx.schema(), resource_type);
            ctx.transaction(|conn| {
                adapter.drop_object(conn, &group)?;
                conn.execute(
                    &format!("DELETE FROM {} WHERE RESOURCE_TYPE_ID = ?", resource_types),
                    &[(*id).into()],
                )
            })?;
            tracing::info!(resource_type, "removed resource type");
        }
        Ok(())
    }
}
