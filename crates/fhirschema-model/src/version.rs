//! Whole-schema versions of the FHIR data schema.

use std::fmt;

/// Each release that changes the data schema adds a variant. Never reorder
/// or renumber: the numbers are stored in `WHOLE_SCHEMA_VERSION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FhirSchemaVersion {
    V0001 = 1,
    V0002 = 2,
    V0003 = 3,
    V0004 = 4,
    V0005 = 5,
}

impl FhirSchemaVersion {
    pub const ALL: [FhirSchemaVersion; 5] = [
        FhirSchemaVersion::V0001,
        FhirSchemaVersion::V0002,
        FhirSchemaVersion::V0003,
        FhirSchemaVersion::V0004,
        FhirSchemaVersion::V0005,
    ];

    pub fn vid(self) -> i32 {
        self as i32
    }

    pub fn latest() -> Self {
        FhirSchemaVersion::V0005
    }

    pub fn from_vid(vid: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.vid() == vid)
    }

    pub fn description(self) -> &'static str {
        match self {
            FhirSchemaVersion::V0001 => "initial schema",
            FhirSchemaVersion::V0002 => "IS_DELETED and LAST_UPDATED on logical resources",
            FhirSchemaVersion::V0003 => "resource change log",
            FhirSchemaVersion::V0004 => "VERSION_ID on the global logical resources table",
            FhirSchemaVersion::V0005 => "remove resource types dropped from the specification",
        }
    }
}

impl fmt::Display for FhirSchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{:04}", self.vid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_are_contiguous() {
        for (i, v) in FhirSchemaVersion::ALL.iter().enumerate() {
            assert_eq!(v.vid(), i as i32 + 1);
            assert_eq!(FhirSchemaVersion::from_vid(v.vid()), Some(*v));
        }
        assert_eq!(FhirSchemaVersion::latest(), *FhirSchemaVersion::ALL.last().unwrap());
        assert_eq!(FhirSchemaVersion::from_vid(0), None);
    }

    #[test]
    fn test_display_matches_step_names() {
        assert_eq!(
            FhirSchemaVersion::V0004.to_string(),
            fhirschema_core::migration::step_name(4)
        );
    }
}
