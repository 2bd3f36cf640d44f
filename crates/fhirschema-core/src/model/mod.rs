//! Schema object model and the dependency graph built from it.

pub mod graph;
pub mod object;

pub use graph::{
    ApplyReport, GraphError, ModelDescription, ObjectId, ObjectSummary, PhysicalDataModel,
    TransactionMode,
};
pub use object::{
    ColumnDef, ColumnType, Distribution, ForeignKeyDef, IndexDef, ObjectDefinition, ObjectKind,
    PrimaryKey, RoutineDef, SchemaObject, SequenceDef, TableDef, Tag,
};
