//! `key=value` connection property files.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use fhirschema_core::{Error, Result};

pub const DB_PATH: &str = "db.path";
pub const DB_HOST: &str = "db.host";
pub const DB_PORT: &str = "db.port";
pub const DB_DATABASE: &str = "db.database";
pub const USER: &str = "user";
pub const PASSWORD: &str = "password";
pub const SSL: &str = "ssl";

/// Connection properties. Later entries win, so `--prop` overrides go last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    values: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse property text. Blank lines and lines starting with `#` or `!`
    /// are ignored; `:` is accepted as a separator too.
    pub fn parse(text: &str) -> Result<Self> {
        let mut props = Self::new();
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            props
                .set_pair(line)
                .map_err(|_| Error::config(format!("line {}: expected key=value, got '{}'", n + 1, line)))?;
        }
        Ok(props)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&text)
    }

    /// Apply one `key=value` override.
    pub fn set_pair(&mut self, pair: &str) -> Result<()> {
        let Some(split) = pair.find(['=', ':']) else {
            return Err(Error::config(format!("expected key=value, got '{}'", pair)));
        };
        let key = pair[..split].trim();
        if key.is_empty() {
            return Err(Error::config(format!("empty property name in '{}'", pair)));
        }
        self.set(key, pair[split + 1..].trim());
        Ok(())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| Error::config(format!("missing connection property '{}'", key)))
    }

    /// Typed value of `key`, if present.
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| Error::config(format!("invalid value '{}' for property '{}'", raw, key))),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_comments() {
        let props = Properties::parse(
            "# connection\n\
             db.host = db.internal\n\
             ! legacy comment\n\
             db.port: 6432\n\
             \n\
             password=a=b\n",
        )
        .unwrap();
        assert_eq!(props.len(), 3);
        assert_eq!(props.get(DB_HOST), Some("db.internal"));
        assert_eq!(props.get_parsed::<u16>(DB_PORT).unwrap(), Some(6432));
        assert_eq!(props.get(PASSWORD), Some("a=b"));
    }

    #[test]
    fn test_bad_line_reports_position() {
        let err = Properties::parse("db.host=x\nnonsense\n").unwrap_err();
        assert!(err.to_string().contains("line 2"), "{}", err);
    }

    #[test]
    fn test_override_and_typed_errors() {
        let mut props = Properties::parse("db.port=5432").unwrap();
        props.set_pair("db.port=abc").unwrap();
        assert!(props.get_parsed::<u16>(DB_PORT).is_err());
        assert!(props.set_pair("=x").is_err());
        assert!(props.require(USER).is_err());
    }
}
