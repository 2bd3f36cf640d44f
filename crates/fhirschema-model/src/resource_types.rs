//! Resource types with stable ids.

/// Types the server stores, with their `RESOURCE_TYPE_ID`.
pub const RESOURCE_TYPES: &[(i32, &str)] = &[
    (1, "Patient"),
    (2, "Practitioner"),
    (3, "Organization"),
    (4, "Encounter"),
    (5, "Observation"),
    (6, "Condition"),
    (7, "MedicationRequest"),
    (8, "Procedure"),
];

/// Types earlier releases created tables for and `V0005` removes.
pub const REMOVED_RESOURCE_TYPES: &[(i32, &str)] = &[
    (101, "DeviceComponent"),
    (102, "ProcessRequest"),
    (103, "ProcessResponse"),
];

pub fn resource_type_id(name: &str) -> Option<i32> {
    RESOURCE_TYPES
        .iter()
        .chain(REMOVED_RESOURCE_TYPES)
        .find(|(_, n)| *n == name)
        .map(|(id, _)| *id)
}
