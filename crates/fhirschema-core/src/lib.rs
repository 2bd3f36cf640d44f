//! fhirschema core - schema deployment engine.
//!
//! Builds a dependency graph of database objects, applies it in parallel,
//! and keeps per-object and whole-schema version ledgers so repeated runs
//! are idempotent. A lease row serializes deployments across processes.
//! Dialects plug in through [`DialectAdapter`]; the embedded SQLite dialect
//! lives in [`embedded`].

pub mod adapter;
pub mod bookkeeping;
pub mod ddl;
pub mod embedded;
pub mod error;
pub mod lease;
pub mod migration;
pub mod model;
pub mod scheduler;
pub mod schema_version;
pub mod version_history;

pub use adapter::{
    transaction, Command, Connection, ConnectionFactory, ConnectionPool, DbRow, DbType, DbValue,
    DialectAdapter, FromDbValue, ObjectInfo, PoolConfig, PooledConnection, Privilege, Translator,
    POOL_HEADROOM,
};
pub use error::{Error, ErrorKind, Result};
pub use model::{
    ApplyReport, ColumnDef, ColumnType, Distribution, ForeignKeyDef, GraphError, IndexDef,
    ModelDescription, ObjectDefinition, ObjectId, ObjectKind, PhysicalDataModel, PrimaryKey,
    RoutineDef, SchemaObject, SequenceDef, TableDef, Tag, TransactionMode,
};

// Engine services
pub use lease::{Clock, LeaseConfig, LeaseManager, LeaseState, ManualClock, SystemClock};
pub use migration::{
    DeployConfig, DeployOutcome, DeployReport, LogicalSchema, MigrationContext,
    MigrationOrchestrator, MigrationStep,
};
pub use scheduler::{FailedTask, RunReport, TaskScheduler};
pub use schema_version::{SchemaVersionManager, NOT_BUILT};
pub use version_history::VersionHistoryService;

// Embedded dialect
pub use embedded::{SqliteAdapter, SqliteConnectionFactory, SqliteTranslator};
