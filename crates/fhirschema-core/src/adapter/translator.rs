//! Dialect-specific SQL fragments.
//!
//! Everything the portable DDL renderer and the bookkeeping statements need
//! to know about a database family goes through this trait.

use super::DbType;
use crate::model::{ColumnType, IndexDef, SequenceDef};

/// Dialect-specific SQL fragments and capability flags.
pub trait Translator: Send + Sync {
    /// The database family this translator targets.
    fn db_type(&self) -> DbType;

    /// Render a column type.
    fn column_type(&self, column_type: &ColumnType) -> String;

    /// Quote an identifier when it is not a plain identifier.
    ///
    /// Plain identifiers are left bare so every dialect applies its own case
    /// folding consistently across DDL and DML.
    fn quote(&self, ident: &str) -> String {
        if is_plain_identifier(ident) {
            ident.to_string()
        } else {
            let mut quoted = String::with_capacity(ident.len() + 2);
            quoted.push('"');
            for ch in ident.chars() {
                if ch == '"' {
                    quoted.push('"');
                }
                quoted.push(ch);
            }
            quoted.push('"');
            quoted
        }
    }

    /// Schema-qualified object name.
    fn qualified(&self, schema: &str, name: &str) -> String {
        format!("{}.{}", self.quote(schema), self.quote(name))
    }

    /// `CREATE [UNIQUE] INDEX IF NOT EXISTS` statement for `table`.
    fn create_index(&self, schema: &str, table: &str, index: &IndexDef) -> String {
        format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            self.quote(&index.name),
            self.qualified(schema, table),
            self.column_list(&index.columns)
        )
    }

    /// Statement adding an already rendered column definition to `table`.
    fn add_column(&self, schema: &str, table: &str, column_sql: &str) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {}",
            self.qualified(schema, table),
            column_sql
        )
    }

    /// `CREATE SEQUENCE` statement.
    fn create_sequence(&self, schema: &str, name: &str, def: &SequenceDef) -> String {
        format!(
            "CREATE SEQUENCE IF NOT EXISTS {} START WITH {} CACHE {}",
            self.qualified(schema, name),
            def.start,
            def.cache
        )
    }

    /// `DROP INDEX IF EXISTS` statement.
    fn drop_index(&self, schema: &str, index_name: &str) -> String {
        format!("DROP INDEX IF EXISTS {}", self.qualified(schema, index_name))
    }

    /// Comma separated, quoted column list.
    fn column_list(&self, columns: &[String]) -> String {
        columns
            .iter()
            .map(|c| self.quote(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Whether `CREATE SEQUENCE` exists in this dialect.
    fn supports_sequences(&self) -> bool {
        true
    }

    /// Whether stored procedures and functions exist in this dialect.
    fn supports_routines(&self) -> bool {
        true
    }

    /// Whether foreign keys can be added to an existing table.
    fn supports_foreign_key_alter(&self) -> bool {
        true
    }

    /// Whether `GRANT` statements exist in this dialect.
    fn supports_grants(&self) -> bool {
        true
    }
}

/// Letters, digits and underscores, not starting with a digit.
pub fn is_plain_identifier(ident: &str) -> bool {
    let mut chars = ident.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Generic;

    impl Translator for Generic {
        fn db_type(&self) -> DbType {
            DbType::Postgres
        }

        fn column_type(&self, column_type: &ColumnType) -> String {
            format!("{:?}", column_type)
        }
    }

    #[test]
    fn test_plain_identifiers_stay_bare() {
        assert_eq!(Generic.quote("PATIENT_RESOURCES"), "PATIENT_RESOURCES");
        assert_eq!(Generic.qualified("FHIRDATA", "CONTROL"), "FHIRDATA.CONTROL");
    }

    #[test]
    fn test_odd_identifiers_are_quoted() {
        assert_eq!(Generic.quote("fhir-data"), "\"fhir-data\"");
        assert_eq!(Generic.quote("a\"b"), "\"a\"\"b\"");
        assert_eq!(Generic.quote("1ABC"), "\"1ABC\"");
    }

    #[test]
    fn test_create_index_default_form() {
        let index = IndexDef::unique("IDX_LR_LOGICAL_ID", ["RESOURCE_TYPE_ID", "LOGICAL_ID"]);
        assert_eq!(
            Generic.create_index("FHIRDATA", "LOGICAL_RESOURCES", &index),
            "CREATE UNIQUE INDEX IF NOT EXISTS IDX_LR_LOGICAL_ID ON FHIRDATA.LOGICAL_RESOURCES (RESOURCE_TYPE_ID, LOGICAL_ID)"
        );
    }
}
