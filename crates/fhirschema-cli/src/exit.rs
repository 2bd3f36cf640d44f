//! Process exit statuses.

use fhirschema_core::{Error, ErrorKind};

pub const EXIT_OK: u8 = 0;
pub const EXIT_BAD_ARGS: u8 = 1;
pub const EXIT_RUNTIME_ERROR: u8 = 2;
pub const EXIT_VALIDATION_FAILED: u8 = 3;
pub const EXIT_NOT_READY: u8 = 4;
pub const EXIT_TABLESPACE_REMOVAL_NOT_COMPLETE: u8 = 5;
pub const EXIT_CONCURRENT_UPDATE: u8 = 6;

pub fn exit_code(err: &Error) -> u8 {
    match err.kind() {
        ErrorKind::Config => EXIT_BAD_ARGS,
        ErrorKind::DataAccess | ErrorKind::Graph => EXIT_RUNTIME_ERROR,
        ErrorKind::ValidationFailure => EXIT_VALIDATION_FAILED,
        ErrorKind::DatabaseNotReady => EXIT_NOT_READY,
        ErrorKind::TablespaceRemovalNotComplete => EXIT_TABLESPACE_REMOVAL_NOT_COMPLETE,
        ErrorKind::ConcurrentUpdate => EXIT_CONCURRENT_UPDATE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&Error::config("x")), 1);
        assert_eq!(exit_code(&Error::data_access("x")), 2);
        assert_eq!(exit_code(&Error::UniqueViolation("x".into())), 2);
        assert_eq!(exit_code(&Error::validation("x")), 3);
        assert_eq!(exit_code(&Error::DatabaseNotReady("x".into())), 4);
        assert_eq!(exit_code(&Error::TablespaceRemovalNotComplete("x".into())), 5);
        assert_eq!(exit_code(&Error::ConcurrentUpdate("x".into())), 6);
    }
}
