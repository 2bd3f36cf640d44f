//! PostgreSQL and Citus dialects for fhirschema.
//!
//! sqlx drives the server on a private tokio runtime; every call the engine
//! makes is blocking. `?` placeholders are renumbered to `$n` on the way in.

pub mod adapter;
pub mod connection;
pub mod translator;

pub use adapter::{CitusAdapter, PostgresAdapter};
pub use connection::{map_sqlx_error, PgConnection, PgConnectionFactory, PgSettings};
pub use translator::PostgresTranslator;
