//! Deployment passes and numbered data migrations.
//!
//! A [`LogicalSchema`] describes one deployable schema: the objects to put in
//! a [`PhysicalDataModel`](crate::model::PhysicalDataModel), the whole-schema
//! version of this release and the [`MigrationStep`]s that move existing data
//! forward. The [`MigrationOrchestrator`] runs the pass under the schema's
//! lease.
//!
//! # Example
//!
//! ```ignore
//! use fhirschema_core::migration::{DeployConfig, MigrationOrchestrator};
//!
//! let orchestrator = MigrationOrchestrator::new(adapter, DeployConfig::new().with_thread_pool_size(4));
//! let outcome = orchestrator.update_schema(&data_schema)?;
//! ```

pub mod orchestrator;
pub mod step;

pub use orchestrator::{
    DeployConfig, DeployOutcome, DeployReport, MigrationOrchestrator, DEFAULT_ADMIN_SCHEMA,
};
pub use step::{step_name, LogicalSchema, MigrationContext, MigrationStep, MIGRATION_OBJECT_TYPE};
