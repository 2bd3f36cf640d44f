//! Tags and default schema names.

/// Tag group naming the logical schema an object belongs to.
pub const SCHEMA_GROUP_TAG: &str = "SCHEMA_GROUP";

pub const FHIRDATA_GROUP: &str = "FHIRDATA";
pub const OAUTH_GROUP: &str = "OAUTH";
pub const JBATCH_GROUP: &str = "JBATCH";

/// Tag group naming the resource type an object serves.
pub const RESOURCE_TYPE_TAG: &str = "RESOURCE_TYPE";

pub const DEFAULT_DATA_SCHEMA: &str = "FHIRDATA";
pub const DEFAULT_OAUTH_SCHEMA: &str = "FHIR_OAUTH";
pub const DEFAULT_BATCH_SCHEMA: &str = "FHIR_JBATCH";
