//! Portable DDL rendering.
//!
//! Turns a [`SchemaObject`] into the statements that create, drop or grant
//! it, using the dialect's [`Translator`] for everything dialect-specific.
//! Objects the dialect has no notion of (sequences on SQLite, tablespaces
//! everywhere) render to nothing and are still ledgered by the caller.

use crate::adapter::{Privilege, Translator};
use crate::model::{
    ColumnDef, ForeignKeyDef, ObjectDefinition, ObjectKind, RoutineDef, SchemaObject, TableDef,
};

/// `NAME TYPE [DEFAULT x] [NOT NULL]`.
pub fn render_column(t: &dyn Translator, column: &ColumnDef) -> String {
    let mut sql = format!("{} {}", t.quote(&column.name), t.column_type(&column.column_type));
    if let Some(default) = &column.default {
        sql.push_str(" DEFAULT ");
        sql.push_str(default);
    }
    if !column.nullable {
        sql.push_str(" NOT NULL");
    }
    sql
}

/// `CREATE TABLE IF NOT EXISTS` with every column and the primary key.
pub fn render_create_table(t: &dyn Translator, schema: &str, name: &str, def: &TableDef) -> String {
    let mut parts: Vec<String> = def.columns.iter().map(|c| render_column(t, c)).collect();
    if let Some(pk) = &def.primary_key {
        parts.push(format!(
            "CONSTRAINT {} PRIMARY KEY ({})",
            t.quote(&pk.name),
            t.column_list(&pk.columns)
        ));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        t.qualified(schema, name),
        parts.join(", ")
    )
}

fn render_table(t: &dyn Translator, schema: &str, name: &str, def: &TableDef, prior: Option<i32>) -> Vec<String> {
    match prior {
        None => std::iter::once(render_create_table(t, schema, name, def))
            .chain(def.indexes.iter().map(|i| t.create_index(schema, name, i)))
            .collect(),
        Some(installed) => def
            .columns_after(installed)
            .map(|c| t.add_column(schema, name, &render_column(t, c)))
            .chain(def.indexes_after(installed).map(|i| t.create_index(schema, name, i)))
            .collect(),
    }
}

fn render_foreign_key(t: &dyn Translator, schema: &str, name: &str, fk: &ForeignKeyDef) -> Vec<String> {
    if !t.supports_foreign_key_alter() {
        return Vec::new();
    }
    let table = t.qualified(schema, &fk.table);
    vec![
        format!("ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}", table, t.quote(name)),
        format!(
            "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
            table,
            t.quote(name),
            t.column_list(&fk.columns),
            t.qualified(&fk.target_schema, &fk.target_table),
            t.column_list(&fk.target_columns)
        ),
    ]
}

fn routine_body(t: &dyn Translator, obj: &SchemaObject, routine: &RoutineDef) -> Vec<String> {
    if !t.supports_routines() {
        return Vec::new();
    }
    match routine.body_for(t.db_type()) {
        Some(body) => vec![body.to_string()],
        None => {
            tracing::debug!(object = %obj, db_type = %t.db_type(), "no routine body for dialect");
            Vec::new()
        }
    }
}

fn routine_ref(t: &dyn Translator, obj: &SchemaObject, routine: &RoutineDef) -> String {
    format!(
        "{}{}",
        t.qualified(&obj.schema, &obj.name),
        routine.signature.as_deref().unwrap_or("")
    )
}

/// Statements bringing `obj` from `prior` to its declared version.
pub fn render_apply(t: &dyn Translator, obj: &SchemaObject, prior: Option<i32>) -> Vec<String> {
    match &obj.definition {
        ObjectDefinition::Table(def) => render_table(t, &obj.schema, &obj.name, def, prior),
        ObjectDefinition::Sequence(def) if t.supports_sequences() => {
            vec![t.create_sequence(&obj.schema, &obj.name, def)]
        }
        ObjectDefinition::Sequence(_) => Vec::new(),
        ObjectDefinition::Procedure(r) | ObjectDefinition::Function(r) => routine_body(t, obj, r),
        ObjectDefinition::ForeignKey(fk) => render_foreign_key(t, &obj.schema, &obj.name, fk),
        ObjectDefinition::Tablespace | ObjectDefinition::SessionVariable => Vec::new(),
        ObjectDefinition::Group(children) => children
            .iter()
            .flat_map(|child| render_apply(t, child, prior))
            .collect(),
    }
}

/// Statements dropping `obj` if present.
pub fn render_drop(t: &dyn Translator, obj: &SchemaObject) -> Vec<String> {
    let name = t.qualified(&obj.schema, &obj.name);
    match &obj.definition {
        ObjectDefinition::Table(_) => vec![format!("DROP TABLE IF EXISTS {}", name)],
        ObjectDefinition::Sequence(_) if t.supports_sequences() => {
            vec![format!("DROP SEQUENCE IF EXISTS {}", name)]
        }
        ObjectDefinition::Procedure(r) if t.supports_routines() && r.body_for(t.db_type()).is_some() => {
            vec![format!("DROP PROCEDURE IF EXISTS {}", routine_ref(t, obj, r))]
        }
        ObjectDefinition::Function(r) if t.supports_routines() && r.body_for(t.db_type()).is_some() => {
            vec![format!("DROP FUNCTION IF EXISTS {}", routine_ref(t, obj, r))]
        }
        ObjectDefinition::ForeignKey(fk) if t.supports_foreign_key_alter() => vec![format!(
            "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}",
            t.qualified(&obj.schema, &fk.table),
            t.quote(&obj.name)
        )],
        ObjectDefinition::Group(children) => children.iter().rev().flat_map(|c| render_drop(t, c)).collect(),
        _ => Vec::new(),
    }
}

/// Grant statements for the privileges of `privileges` that apply to `obj`.
pub fn render_grant(t: &dyn Translator, obj: &SchemaObject, privileges: &[Privilege], grantee: &str) -> Vec<String> {
    if !t.supports_grants() {
        return Vec::new();
    }
    let applicable: &[Privilege] = match obj.kind() {
        ObjectKind::Table => &[Privilege::Select, Privilege::Insert, Privilege::Update, Privilege::Delete],
        ObjectKind::Sequence => &[Privilege::Usage],
        ObjectKind::Procedure | ObjectKind::Function => &[Privilege::Execute],
        ObjectKind::ObjectGroup => {
            if let ObjectDefinition::Group(children) = &obj.definition {
                return children
                    .iter()
                    .flat_map(|c| render_grant(t, c, privileges, grantee))
                    .collect();
            }
            &[]
        }
        _ => &[],
    };

    let granted: Vec<&str> = applicable
        .iter()
        .filter(|p| privileges.contains(*p))
        .map(|p| p.as_str())
        .collect();
    if granted.is_empty() {
        return Vec::new();
    }

    let target = match &obj.definition {
        ObjectDefinition::Table(_) => t.qualified(&obj.schema, &obj.name),
        ObjectDefinition::Sequence(_) if t.supports_sequences() => {
            format!("SEQUENCE {}", t.qualified(&obj.schema, &obj.name))
        }
        ObjectDefinition::Procedure(r) if t.supports_routines() && r.body_for(t.db_type()).is_some() => {
            format!("PROCEDURE {}", routine_ref(t, obj, r))
        }
        ObjectDefinition::Function(r) if t.supports_routines() && r.body_for(t.db_type()).is_some() => {
            format!("FUNCTION {}", routine_ref(t, obj, r))
        }
        _ => return Vec::new(),
    };

    vec![format!(
        "GRANT {} ON {} TO {}",
        granted.join(", "),
        target,
        t.quote(grantee)
    )]
}
