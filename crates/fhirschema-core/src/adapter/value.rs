//! Statement parameter and result row types shared by every dialect.

use crate::error::{Error, Result};

/// Value type for statement parameters and result columns.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Boolean(bool),
}

impl From<i32> for DbValue {
    fn from(v: i32) -> Self {
        DbValue::Integer(v as i64)
    }
}

impl From<i64> for DbValue {
    fn from(v: i64) -> Self {
        DbValue::Integer(v)
    }
}

impl From<f64> for DbValue {
    fn from(v: f64) -> Self {
        DbValue::Real(v)
    }
}

impl From<String> for DbValue {
    fn from(v: String) -> Self {
        DbValue::Text(v)
    }
}

impl From<&str> for DbValue {
    fn from(v: &str) -> Self {
        DbValue::Text(v.to_string())
    }
}

impl From<bool> for DbValue {
    fn from(v: bool) -> Self {
        DbValue::Boolean(v)
    }
}

impl<T: Into<DbValue>> From<Option<T>> for DbValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => DbValue::Null,
        }
    }
}

/// Row data from a query result.
#[derive(Debug, Clone)]
pub struct DbRow {
    columns: Vec<String>,
    values: Vec<DbValue>,
}

impl DbRow {
    /// Create a new row with column names and values.
    pub fn new(columns: Vec<String>, values: Vec<DbValue>) -> Self {
        Self { columns, values }
    }

    /// Get a value by column index.
    pub fn get<T: FromDbValue>(&self, index: usize) -> Result<T> {
        self.values
            .get(index)
            .ok_or_else(|| Error::data_access(format!("column index {} out of bounds", index)))
            .and_then(T::from_db_value)
    }

    /// Get a value by column name (case-insensitive, drivers disagree on folding).
    pub fn get_by_name<T: FromDbValue>(&self, name: &str) -> Result<T> {
        let index = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::data_access(format!("column '{}' not found", name)))?;
        self.get(index)
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the row is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Column names.
    pub fn column_names(&self) -> &[String] {
        &self.columns
    }
}

/// Conversion from a [`DbValue`] into a Rust type.
pub trait FromDbValue: Sized {
    fn from_db_value(value: &DbValue) -> Result<Self>;
}

impl FromDbValue for i64 {
    fn from_db_value(value: &DbValue) -> Result<Self> {
        match value {
            DbValue::Integer(v) => Ok(*v),
            DbValue::Null => Err(Error::data_access(
                "i64 field is NULL - use Option<i64> for nullable columns",
            )),
            other => Err(Error::data_access(format!("expected integer, got {:?}", other))),
        }
    }
}

impl FromDbValue for i32 {
    fn from_db_value(value: &DbValue) -> Result<Self> {
        let v = i64::from_db_value(value)?;
        i32::try_from(v).map_err(|_| Error::data_access(format!("{} does not fit in i32", v)))
    }
}

impl FromDbValue for f64 {
    fn from_db_value(value: &DbValue) -> Result<Self> {
        match value {
            DbValue::Real(v) => Ok(*v),
            DbValue::Integer(v) => Ok(*v as f64),
            other => Err(Error::data_access(format!("expected real, got {:?}", other))),
        }
    }
}

impl FromDbValue for String {
    fn from_db_value(value: &DbValue) -> Result<Self> {
        match value {
            DbValue::Text(v) => Ok(v.clone()),
            DbValue::Null => Err(Error::data_access(
                "String field is NULL - use Option<String> for nullable columns",
            )),
            other => Err(Error::data_access(format!("expected text, got {:?}", other))),
        }
    }
}

impl FromDbValue for bool {
    fn from_db_value(value: &DbValue) -> Result<Self> {
        match value {
            DbValue::Boolean(v) => Ok(*v),
            DbValue::Integer(v) => Ok(*v != 0),
            other => Err(Error::data_access(format!("expected boolean, got {:?}", other))),
        }
    }
}

impl<T: FromDbValue> FromDbValue for Option<T> {
    fn from_db_value(value: &DbValue) -> Result<Self> {
        match value {
            DbValue::Null => Ok(None),
            _ => T::from_db_value(value).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_access_by_name_ignores_case() {
        let row = DbRow::new(
            vec!["object_name".into(), "version".into()],
            vec![DbValue::from("PATIENT_RESOURCES"), DbValue::from(3_i64)],
        );
        let name: String = row.get_by_name("OBJECT_NAME").unwrap();
        let version: i32 = row.get_by_name("VERSION").unwrap();
        assert_eq!(name, "PATIENT_RESOURCES");
        assert_eq!(version, 3);
    }

    #[test]
    fn test_null_requires_option() {
        let row = DbRow::new(vec!["v".into()], vec![DbValue::Null]);
        assert!(row.get::<i64>(0).is_err());
        assert_eq!(row.get::<Option<i64>>(0).unwrap(), None);
    }

    #[test]
    fn test_out_of_range_i32() {
        assert!(i32::from_db_value(&DbValue::Integer(i64::MAX)).is_err());
    }
}
