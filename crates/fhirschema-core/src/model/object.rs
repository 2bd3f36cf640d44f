//! Typed schema objects: the nodes of the physical data model.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use super::graph::ObjectId;
use crate::adapter::DbType;

/// Kind of a schema object. The string form is the ledger object type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ObjectKind {
    Table,
    Sequence,
    Tablespace,
    Procedure,
    Function,
    ForeignKey,
    SessionVariable,
    ObjectGroup,
}

impl ObjectKind {
    /// Object type string stored in the version history.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Table => "TABLE",
            ObjectKind::Sequence => "SEQUENCE",
            ObjectKind::Tablespace => "TABLESPACE",
            ObjectKind::Procedure => "PROCEDURE",
            ObjectKind::Function => "FUNCTION",
            ObjectKind::ForeignKey => "FOREIGN_KEY",
            ObjectKind::SessionVariable => "VARIABLE",
            ObjectKind::ObjectGroup => "GROUP",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(group, value)` label used to select sub-schemas.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Tag {
    pub group: String,
    pub value: String,
}

impl Tag {
    /// Create a tag.
    pub fn new(group: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.group, self.value)
    }
}

/// Portable column types; each translator renders them for its dialect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ColumnType {
    SmallInt,
    Integer,
    BigInt,
    Double,
    Varchar(u32),
    Char(u32),
    Text,
    Timestamp,
    Blob,
}

/// A table column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    /// Default value as a SQL literal.
    pub default: Option<String>,
    /// Table version that introduced the column.
    pub since_version: i32,
}

impl ColumnDef {
    /// A `NOT NULL` column.
    pub fn required(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
            default: None,
            since_version: 1,
        }
    }

    /// A nullable column.
    pub fn nullable(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            nullable: true,
            ..Self::required(name, column_type)
        }
    }

    /// Set the default value (a SQL literal such as `'N'` or `0`).
    pub fn with_default(mut self, literal: impl Into<String>) -> Self {
        self.default = Some(literal.into());
        self
    }

    /// Mark the column as added in table version `version`.
    pub fn since(mut self, version: i32) -> Self {
        self.since_version = version;
        self
    }
}

/// Primary key constraint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrimaryKey {
    pub name: String,
    pub columns: Vec<String>,
}

/// A secondary index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    /// Table version that introduced the index.
    pub since_version: i32,
}

impl IndexDef {
    /// A non-unique index.
    pub fn new<I, S>(name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
            since_version: 1,
        }
    }

    /// A unique index.
    pub fn unique<I, S>(name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            unique: true,
            ..Self::new(name, columns)
        }
    }

    /// Mark the index as added in table version `version`.
    pub fn since(mut self, version: i32) -> Self {
        self.since_version = version;
        self
    }
}

/// How the distributed dialect spreads a table over its workers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub enum Distribution {
    /// Stays on the coordinator only.
    #[default]
    None,
    /// Replicated to every worker.
    Reference,
    /// Sharded by the given column.
    Distributed { column: String },
}

/// Table definition.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TableDef {
    pub columns: Vec<ColumnDef>,
    pub primary_key: Option<PrimaryKey>,
    pub indexes: Vec<IndexDef>,
    pub distribution: Distribution,
}

impl TableDef {
    /// Create an empty table definition.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a column.
    pub fn with_column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Add multiple columns.
    pub fn with_columns(mut self, columns: impl IntoIterator<Item = ColumnDef>) -> Self {
        self.columns.extend(columns);
        self
    }

    /// Set the primary key.
    pub fn with_primary_key<I, S>(mut self, name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = Some(PrimaryKey {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Add an index.
    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    /// Replicate the table to every worker on the distributed dialect.
    pub fn reference(mut self) -> Self {
        self.distribution = Distribution::Reference;
        self
    }

    /// Shard the table by `column` on the distributed dialect.
    pub fn distributed_by(mut self, column: impl Into<String>) -> Self {
        self.distribution = Distribution::Distributed {
            column: column.into(),
        };
        self
    }

    /// Get a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Columns introduced after `version`.
    pub fn columns_after(&self, version: i32) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(move |c| c.since_version > version)
    }

    /// Indexes introduced after `version`.
    pub fn indexes_after(&self, version: i32) -> impl Iterator<Item = &IndexDef> {
        self.indexes.iter().filter(move |i| i.since_version > version)
    }
}

/// Sequence definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequenceDef {
    pub start: i64,
    pub cache: i64,
}

impl Default for SequenceDef {
    fn default() -> Self {
        Self { start: 1, cache: 1000 }
    }
}

/// Procedure or function: one full `CREATE OR REPLACE` body per dialect.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct RoutineDef {
    pub bodies: BTreeMap<DbType, String>,
    /// Argument list used by `DROP`/`GRANT`, e.g. `(VARCHAR, BIGINT)`.
    pub signature: Option<String>,
}

impl RoutineDef {
    /// Create a routine without bodies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Provide the body for one dialect.
    pub fn with_body(mut self, db_type: DbType, body: impl Into<String>) -> Self {
        self.bodies.insert(db_type, body.into());
        self
    }

    /// Set the argument list used by `DROP` and `GRANT`.
    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    /// Body for `db_type`, if one was given.
    pub fn body_for(&self, db_type: DbType) -> Option<&str> {
        self.bodies.get(&db_type).map(String::as_str)
    }
}

/// Foreign key constraint from `table(columns)` to `target_table(target_columns)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForeignKeyDef {
    pub table: String,
    pub columns: Vec<String>,
    pub target_schema: String,
    pub target_table: String,
    pub target_columns: Vec<String>,
    /// False when the distributed dialect cannot enforce the constraint
    /// (both sides sharded on different columns).
    pub enforce_on_distributed: bool,
}

impl ForeignKeyDef {
    /// Create a foreign key definition.
    pub fn new<I, S, J, T>(
        table: impl Into<String>,
        columns: I,
        target_schema: impl Into<String>,
        target_table: impl Into<String>,
        target_columns: J,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        J: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            table: table.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            target_schema: target_schema.into(),
            target_table: target_table.into(),
            target_columns: target_columns.into_iter().map(Into::into).collect(),
            enforce_on_distributed: true,
        }
    }

    /// Skip this constraint on the distributed dialect.
    pub fn not_enforced_on_distributed(mut self) -> Self {
        self.enforce_on_distributed = false;
        self
    }
}

/// Kind-specific part of a schema object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ObjectDefinition {
    Table(TableDef),
    Sequence(SequenceDef),
    Tablespace,
    Procedure(RoutineDef),
    Function(RoutineDef),
    ForeignKey(ForeignKeyDef),
    SessionVariable,
    /// Children applied in order, in one transaction.
    Group(Vec<SchemaObject>),
}

/// A typed node of the physical data model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaObject {
    pub schema: String,
    pub name: String,
    /// Declared object version; the ledger is compared against it.
    pub version: i32,
    pub tags: BTreeSet<Tag>,
    #[serde(skip)]
    pub dependencies: Vec<ObjectId>,
    pub definition: ObjectDefinition,
}

impl SchemaObject {
    fn new(
        schema: impl Into<String>,
        name: impl Into<String>,
        version: i32,
        definition: ObjectDefinition,
    ) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            version,
            tags: BTreeSet::new(),
            dependencies: Vec::new(),
            definition,
        }
    }

    /// A table.
    pub fn table(schema: impl Into<String>, name: impl Into<String>, version: i32, def: TableDef) -> Self {
        Self::new(schema, name, version, ObjectDefinition::Table(def))
    }

    /// A sequence.
    pub fn sequence(
        schema: impl Into<String>,
        name: impl Into<String>,
        version: i32,
        def: SequenceDef,
    ) -> Self {
        Self::new(schema, name, version, ObjectDefinition::Sequence(def))
    }

    /// A tablespace.
    pub fn tablespace(schema: impl Into<String>, name: impl Into<String>, version: i32) -> Self {
        Self::new(schema, name, version, ObjectDefinition::Tablespace)
    }

    /// A stored procedure.
    pub fn procedure(
        schema: impl Into<String>,
        name: impl Into<String>,
        version: i32,
        def: RoutineDef,
    ) -> Self {
        Self::new(schema, name, version, ObjectDefinition::Procedure(def))
    }

    /// A function.
    pub fn function(
        schema: impl Into<String>,
        name: impl Into<String>,
        version: i32,
        def: RoutineDef,
    ) -> Self {
        Self::new(schema, name, version, ObjectDefinition::Function(def))
    }

    /// A foreign key constraint.
    pub fn foreign_key(
        schema: impl Into<String>,
        name: impl Into<String>,
        version: i32,
        def: ForeignKeyDef,
    ) -> Self {
        Self::new(schema, name, version, ObjectDefinition::ForeignKey(def))
    }

    /// A session variable.
    pub fn session_variable(schema: impl Into<String>, name: impl Into<String>, version: i32) -> Self {
        Self::new(schema, name, version, ObjectDefinition::SessionVariable)
    }

    /// A group of objects applied sequentially as one unit.
    pub fn group(
        schema: impl Into<String>,
        name: impl Into<String>,
        version: i32,
        children: Vec<SchemaObject>,
    ) -> Self {
        Self::new(schema, name, version, ObjectDefinition::Group(children))
    }

    /// The object kind.
    pub fn kind(&self) -> ObjectKind {
        match self.definition {
            ObjectDefinition::Table(_) => ObjectKind::Table,
            ObjectDefinition::Sequence(_) => ObjectKind::Sequence,
            ObjectDefinition::Tablespace => ObjectKind::Tablespace,
            ObjectDefinition::Procedure(_) => ObjectKind::Procedure,
            ObjectDefinition::Function(_) => ObjectKind::Function,
            ObjectDefinition::ForeignKey(_) => ObjectKind::ForeignKey,
            ObjectDefinition::SessionVariable => ObjectKind::SessionVariable,
            ObjectDefinition::Group(_) => ObjectKind::ObjectGroup,
        }
    }

    /// Add a tag.
    pub fn with_tag(mut self, group: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(Tag::new(group, value));
        self
    }

    /// Add a dependency on an object already in the graph.
    pub fn depends_on(mut self, id: ObjectId) -> Self {
        if !self.dependencies.contains(&id) {
            self.dependencies.push(id);
        }
        self
    }

    /// Add several dependencies.
    pub fn depends_on_all(self, ids: impl IntoIterator<Item = ObjectId>) -> Self {
        ids.into_iter().fold(self, |obj, id| obj.depends_on(id))
    }

    /// Whether the object carries `tag`.
    pub fn has_tag(&self, tag: &Tag) -> bool {
        self.tags.contains(tag)
    }

    /// `SCHEMA.NAME`, used as the task id and in logs.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Table definition, when this object is a table.
    pub fn as_table(&self) -> Option<&TableDef> {
        match &self.definition {
            ObjectDefinition::Table(def) => Some(def),
            _ => None,
        }
    }
}

impl fmt::Display for SchemaObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}.{} v{}", self.kind(), self.schema, self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_builder() {
        let def = TableDef::new()
            .with_column(ColumnDef::required("LOGICAL_RESOURCE_ID", ColumnType::BigInt))
            .with_column(ColumnDef::required("LOGICAL_ID", ColumnType::Varchar(255)))
            .with_column(
                ColumnDef::required("IS_DELETED", ColumnType::Char(1))
                    .with_default("'X'")
                    .since(2),
            )
            .with_primary_key("PK_LOGICAL_RESOURCES", ["LOGICAL_RESOURCE_ID"])
            .with_index(IndexDef::unique("UQ_LOGICAL_ID", ["LOGICAL_ID"]))
            .distributed_by("LOGICAL_ID");

        let table = SchemaObject::table("FHIRDATA", "LOGICAL_RESOURCES", 2, def)
            .with_tag("SCHEMA_GROUP", "FHIRDATA_GROUP");

        assert_eq!(table.kind(), ObjectKind::Table);
        assert_eq!(table.qualified_name(), "FHIRDATA.LOGICAL_RESOURCES");
        let def = table.as_table().unwrap();
        assert_eq!(def.columns_after(1).count(), 1);
        assert_eq!(def.columns_after(0).count(), 3);
        assert!(table.has_tag(&Tag::new("SCHEMA_GROUP", "FHIRDATA_GROUP")));
    }

    #[test]
    fn test_kind_strings_are_stable() {
        assert_eq!(ObjectKind::ForeignKey.as_str(), "FOREIGN_KEY");
        assert_eq!(ObjectKind::ObjectGroup.to_string(), "GROUP");
    }

    #[test]
    fn test_routine_body_lookup() {
        let routine = RoutineDef::new()
            .with_body(DbType::Postgres, "CREATE OR REPLACE FUNCTION f() ...")
            .with_signature("()");
        assert!(routine.body_for(DbType::Postgres).is_some());
        assert!(routine.body_for(DbType::Sqlite).is_none());
    }
}
