//! The `fhirschema` command-line tool.

pub mod config;
pub mod exit;
pub mod properties;
pub mod runner;

pub use config::{Action, Args, CliConfig, DbTypeArg, Target};
pub use exit::exit_code;
pub use properties::Properties;
pub use runner::{build_adapter, run, Schemas};
