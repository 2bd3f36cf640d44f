//! PostgreSQL SQL fragments.

use fhirschema_core::adapter::DbType;
use fhirschema_core::{ColumnType, Translator};

/// Translator shared by PostgreSQL and Citus; only the reported family differs.
#[derive(Debug, Clone, Copy)]
pub struct PostgresTranslator {
    db_type: DbType,
}

impl PostgresTranslator {
    pub fn postgres() -> Self {
        Self {
            db_type: DbType::Postgres,
        }
    }

    pub fn citus() -> Self {
        Self {
            db_type: DbType::Citus,
        }
    }
}

impl Default for PostgresTranslator {
    fn default() -> Self {
        Self::postgres()
    }
}

impl Translator for PostgresTranslator {
    fn db_type(&self) -> DbType {
        self.db_type
    }

    fn column_type(&self, column_type: &ColumnType) -> String {
        match column_type {
            ColumnType::SmallInt => "SMALLINT".to_string(),
            ColumnType::Integer => "INT".to_string(),
            ColumnType::BigInt => "BIGINT".to_string(),
            ColumnType::Double => "DOUBLE PRECISION".to_string(),
            ColumnType::Varchar(n) => format!("VARCHAR({})", n),
            ColumnType::Char(n) => format!("CHAR({})", n),
            ColumnType::Text => "TEXT".to_string(),
            ColumnType::Timestamp => "TIMESTAMP".to_string(),
            ColumnType::Blob => "BYTEA".to_string(),
        }
    }
}
