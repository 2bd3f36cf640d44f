//! FHIR server schemas for fhirschema.
//!
//! Three logical schemas ship together: the FHIR data schema with its
//! numbered data migrations, the OAuth client registry, and the batch job
//! repository. Each implements [`LogicalSchema`](fhirschema_core::LogicalSchema)
//! and is deployed by the core orchestrator.

pub mod batch;
pub mod data;
pub mod migrations;
pub mod oauth;
pub mod resource_types;
pub mod tags;
pub mod version;

pub use batch::BatchSchema;
pub use data::{resource_type_group, FhirDataSchema};
pub use migrations::{
    data_migrations, BackfillDeletedAndUpdated, BackfillGlobalVersionId, RemoveDeprecatedResourceTypes,
};
pub use oauth::OAuthSchema;
pub use resource_types::{resource_type_id, REMOVED_RESOURCE_TYPES, RESOURCE_TYPES};
pub use tags::{
    DEFAULT_BATCH_SCHEMA, DEFAULT_DATA_SCHEMA, DEFAULT_OAUTH_SCHEMA, FHIRDATA_GROUP, JBATCH_GROUP,
    OAUTH_GROUP, RESOURCE_TYPE_TAG, SCHEMA_GROUP_TAG,
};
pub use version::FhirSchemaVersion;
