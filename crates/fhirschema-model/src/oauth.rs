//! Client registrations for the OAuth provider.

use fhirschema_core::migration::LogicalSchema;
use fhirschema_core::{ColumnDef, ColumnType, PhysicalDataModel, Result, SchemaObject, TableDef, Tag};

use crate::tags::{DEFAULT_OAUTH_SCHEMA, OAUTH_GROUP, SCHEMA_GROUP_TAG};

pub const OAUTH_CLIENTS: &str = "OAUTH_CLIENTS";

#[derive(Debug, Clone)]
pub struct OAuthSchema {
    schema: String,
}

impl OAuthSchema {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into().to_ascii_uppercase(),
        }
    }
}

impl Default for OAuthSchema {
    fn default() -> Self {
        Self::new(DEFAULT_OAUTH_SCHEMA)
    }
}

impl LogicalSchema for OAuthSchema {
    fn name(&self) -> &str {
        "oauth"
    }

    fn schema_name(&self) -> &str {
        &self.schema
    }

    fn latest_version(&self) -> i32 {
        1
    }

    fn tag(&self) -> Option<Tag> {
        Some(Tag::new(SCHEMA_GROUP_TAG, OAUTH_GROUP))
    }

    fn build(&self, model: &mut PhysicalDataModel) -> Result<()> {
        model.add_object(
            SchemaObject::table(
                &self.schema,
                OAUTH_CLIENTS,
                1,
                TableDef::new()
                    .with_column(ColumnDef::required("CLIENT_ID", ColumnType::Varchar(256)))
                    .with_column(ColumnDef::required("CLIENT_SECRET", ColumnType::Varchar(256)))
                    .with_column(ColumnDef::nullable("REDIRECT_URIS", ColumnType::Text))
                    .with_column(ColumnDef::nullable("SCOPES", ColumnType::Varchar(1024)))
                    .with_column(ColumnDef::nullable("EXPIRES_AT", ColumnType::Timestamp))
                    .with_column(ColumnDef::nullable("CLIENT_METADATA", ColumnType::Text))
                    .with_primary_key("PK_OAUTH_CLIENTS", ["CLIENT_ID"]),
            )
            .with_tag(SCHEMA_GROUP_TAG, OAUTH_GROUP),
        )?;
        Ok(())
    }
}
