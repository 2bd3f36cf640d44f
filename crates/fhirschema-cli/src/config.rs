//! Command-line arguments and the configuration derived from them.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use fhirschema_core::migration::DEFAULT_ADMIN_SCHEMA;
use fhirschema_core::{DbType, DeployConfig, Error, LeaseConfig, Result};
use fhirschema_model::{DEFAULT_BATCH_SCHEMA, DEFAULT_DATA_SCHEMA, DEFAULT_OAUTH_SCHEMA};

use crate::properties::Properties;

/// Default lease time in seconds.
pub const DEFAULT_LEASE_TIME_SECS: u64 = 120;

/// Default lease wait in seconds.
pub const DEFAULT_LEASE_WAIT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DbTypeArg {
    Sqlite,
    Postgresql,
    Citus,
}

impl From<DbTypeArg> for DbType {
    fn from(arg: DbTypeArg) -> Self {
        match arg {
            DbTypeArg::Sqlite => DbType::Sqlite,
            DbTypeArg::Postgresql => DbType::Postgres,
            DbTypeArg::Citus => DbType::Citus,
        }
    }
}

/// One of the three logical schemas the tool manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Target {
    Fhir,
    Oauth,
    Batch,
}

impl Target {
    pub const ALL: [Target; 3] = [Target::Fhir, Target::Oauth, Target::Batch];
}

/// Work requested on the command line, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    DescribeModel,
    CreateSchemas,
    Update(Target),
    Grant(Target),
    Drop(Target),
    DropAdmin,
    CheckCompatibility,
}

/// Everything a run needs.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub db_type: DbType,
    pub properties: Properties,
    pub data_schema: String,
    pub oauth_schema: String,
    pub batch_schema: String,
    pub deploy: DeployConfig,
    pub actions: Vec<Action>,
}

impl CliConfig {
    pub fn schema_name(&self, target: Target) -> &str {
        match target {
            Target::Fhir => &self.data_schema,
            Target::Oauth => &self.oauth_schema,
            Target::Batch => &self.batch_schema,
        }
    }

    /// Whether any action needs a database connection.
    pub fn needs_database(&self) -> bool {
        self.actions.iter().any(|a| *a != Action::DescribeModel)
    }
}

/// Command-line arguments of `fhirschema`.
#[derive(Parser, Debug)]
#[command(name = "fhirschema")]
#[command(version, about = "Deploy and migrate the FHIR server schema", long_about = None)]
pub struct Args {
    /// Database family.
    #[arg(long, value_enum)]
    pub db_type: DbTypeArg,

    /// Connection property file (key=value lines).
    #[arg(long)]
    pub prop_file: Option<PathBuf>,

    /// Connection property override, e.g. --prop db.host=localhost.
    #[arg(long = "prop", value_name = "KEY=VALUE")]
    pub props: Vec<String>,

    /// Name of the FHIR data schema.
    #[arg(long, default_value = DEFAULT_DATA_SCHEMA)]
    pub schema_name: String,

    /// Schema holding the lease and version history tables.
    #[arg(long, default_value = DEFAULT_ADMIN_SCHEMA)]
    pub admin_schema_name: String,

    /// Create the schemas and bookkeeping tables only.
    #[arg(long)]
    pub create_schemas: bool,

    /// Deploy or upgrade the data, oauth and batch schemas.
    #[arg(long)]
    pub update_schema: bool,

    /// Deploy or upgrade the data schema with the given name.
    #[arg(long, value_name = "SCHEMA")]
    pub update_schema_fhir: Option<String>,

    /// Deploy or upgrade the batch schema with the given name.
    #[arg(long, value_name = "SCHEMA")]
    pub update_schema_batch: Option<String>,

    /// Deploy or upgrade the oauth schema with the given name.
    #[arg(long, value_name = "SCHEMA")]
    pub update_schema_oauth: Option<String>,

    #[arg(long)]
    pub drop_schema_fhir: bool,

    #[arg(long)]
    pub drop_schema_batch: bool,

    #[arg(long)]
    pub drop_schema_oauth: bool,

    /// Drop the admin schema with its lease and version history tables.
    #[arg(long)]
    pub drop_admin: bool,

    /// Required with any drop.
    #[arg(long)]
    pub confirm_drop: bool,

    /// Grant read-write access on the deployed objects.
    #[arg(long, value_name = "USER")]
    pub grant_to: Option<String>,

    /// Grant read-only access on the deployed objects.
    #[arg(long, value_name = "USER")]
    pub grant_read_to: Option<String>,

    /// Connection pool size (raised to cover the worker threads).
    #[arg(long, default_value_t = 10)]
    pub pool_size: usize,

    /// Worker threads applying the object graph.
    #[arg(long, default_value_t = 4)]
    pub thread_pool_size: usize,

    /// Re-run the object pass on a schema that is already current.
    #[arg(long)]
    pub force: bool,

    /// Log DDL instead of executing it.
    #[arg(long)]
    pub dry_run: bool,

    /// Verify the data schema is usable by this release.
    #[arg(long)]
    pub check_compatibility: bool,

    /// Print the physical data model as JSON.
    #[arg(long)]
    pub describe_model: bool,

    /// Lease validity in seconds.
    #[arg(long, default_value_t = DEFAULT_LEASE_TIME_SECS)]
    pub lease_time: u64,

    /// How long to wait for a lease held by another process, in seconds.
    #[arg(long, default_value_t = DEFAULT_LEASE_WAIT_SECS)]
    pub lease_wait: u64,
}

impl Args {
    /// Validate the arguments and load connection properties.
    pub fn into_config(self) -> Result<CliConfig> {
        let mut properties = match &self.prop_file {
            Some(path) => Properties::load(path)?,
            None => Properties::new(),
        };
        for pair in &self.props {
            properties.set_pair(pair)?;
        }

        let data_schema = self
            .update_schema_fhir
            .clone()
            .unwrap_or_else(|| self.schema_name.clone())
            .to_ascii_uppercase();
        let oauth_schema = self
            .update_schema_oauth
            .clone()
            .unwrap_or_else(|| DEFAULT_OAUTH_SCHEMA.to_string())
            .to_ascii_uppercase();
        let batch_schema = self
            .update_schema_batch
            .clone()
            .unwrap_or_else(|| DEFAULT_BATCH_SCHEMA.to_string())
            .to_ascii_uppercase();

        let mut updates = Vec::new();
        if self.update_schema || self.update_schema_fhir.is_some() {
            updates.push(Target::Fhir);
        }
        if self.update_schema || self.update_schema_oauth.is_some() {
            updates.push(Target::Oauth);
        }
        if self.update_schema || self.update_schema_batch.is_some() {
            updates.push(Target::Batch);
        }

        let mut drops = Vec::new();
        if self.drop_schema_fhir {
            drops.push(Target::Fhir);
        }
        if self.drop_schema_oauth {
            drops.push(Target::Oauth);
        }
        if self.drop_schema_batch {
            drops.push(Target::Batch);
        }
        if (!drops.is_empty() || self.drop_admin) && !self.confirm_drop {
            return Err(Error::config("dropping requires --confirm-drop"));
        }
        if !drops.is_empty() && !updates.is_empty() {
            return Err(Error::config("cannot update and drop in the same run"));
        }

        let mut actions = Vec::new();
        if self.describe_model {
            actions.push(Action::DescribeModel);
        }
        if self.create_schemas {
            actions.push(Action::CreateSchemas);
        }
        actions.extend(updates.iter().copied().map(Action::Update));
        // grants ride along with an update; on their own they cover every schema
        let granting = self.grant_to.is_some() || self.grant_read_to.is_some();
        if granting && updates.is_empty() {
            actions.extend(Target::ALL.into_iter().map(Action::Grant));
        }
        actions.extend(drops.into_iter().map(Action::Drop));
        if self.drop_admin {
            actions.push(Action::DropAdmin);
        }
        if self.check_compatibility {
            actions.push(Action::CheckCompatibility);
        }
        if actions.is_empty() {
            return Err(Error::config("nothing to do; pass an action such as --update-schema"));
        }

        let lease = LeaseConfig::default().with_lease_time(Duration::from_secs(self.lease_time.max(1)));
        let mut deploy = DeployConfig::new()
            .with_admin_schema(self.admin_schema_name.to_ascii_uppercase())
            .with_pool_size(self.pool_size)
            .with_thread_pool_size(self.thread_pool_size)
            .with_lease(lease)
            .with_lease_wait(Duration::from_secs(self.lease_wait))
            .with_force(self.force)
            .with_dry_run(self.dry_run);
        if let Some(grantee) = self.grant_to {
            deploy = deploy.with_grant_to(grantee);
        }
        if let Some(grantee) = self.grant_read_to {
            deploy = deploy.with_grant_read_to(grantee);
        }

        Ok(CliConfig {
            db_type: self.db_type.into(),
            properties,
            data_schema,
            oauth_schema,
            batch_schema,
            deploy,
            actions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CliConfig> {
        let mut argv = vec!["fhirschema"];
        argv.extend_from_slice(args);
        Args::try_parse_from(argv).unwrap().into_config()
    }

    #[test]
    fn test_update_all_schemas() {
        let config = parse(&["--db-type", "sqlite", "--update-schema", "--prop", "db.path=/tmp/x.db"]).unwrap();
        assert_eq!(config.db_type, DbType::Sqlite);
        assert_eq!(
            config.actions,
            vec![
                Action::Update(Target::Fhir),
                Action::Update(Target::Oauth),
                Action::Update(Target::Batch)
            ]
        );
        assert_eq!(config.schema_name(Target::Fhir), "FHIRDATA");
        assert_eq!(config.deploy.admin_schema, "FHIR_ADMIN");
        assert_eq!(config.properties.get("db.path"), Some("/tmp/x.db"));
    }

    #[test]
    fn test_named_update_overrides_schema_name() {
        let config = parse(&["--db-type", "postgresql", "--update-schema-fhir", "tenant1"]).unwrap();
        assert_eq!(config.actions, vec![Action::Update(Target::Fhir)]);
        assert_eq!(config.schema_name(Target::Fhir), "TENANT1");
        assert_eq!(config.db_type, DbType::Postgres);
    }

    #[test]
    fn test_drop_requires_confirmation() {
        let err = parse(&["--db-type", "citus", "--drop-schema-fhir"]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        let config = parse(&["--db-type", "citus", "--drop-schema-fhir", "--drop-admin", "--confirm-drop"]).unwrap();
        assert_eq!(config.actions, vec![Action::Drop(Target::Fhir), Action::DropAdmin]);
    }

    #[test]
    fn test_grants_without_update_cover_every_schema() {
        let config = parse(&["--db-type", "postgresql", "--grant-read-to", "fhirreader"]).unwrap();
        assert_eq!(config.actions.len(), 3);
        assert!(config.actions.iter().all(|a| matches!(a, Action::Grant(_))));
        assert_eq!(config.deploy.grant_read_to.as_deref(), Some("fhirreader"));

        let with_update = parse(&["--db-type", "postgresql", "--update-schema-oauth", "oauth", "--grant-to", "fhirserver"]).unwrap();
        assert_eq!(with_update.actions, vec![Action::Update(Target::Oauth)]);
    }

    #[test]
    fn test_no_action_is_an_error() {
        assert!(parse(&["--db-type", "sqlite"]).is_err());
    }

    #[test]
    fn test_describe_needs_no_database() {
        let config = parse(&["--db-type", "sqlite", "--describe-model"]).unwrap();
        assert!(!config.needs_database());
    }

    #[test]
    fn test_tuning_flags() {
        let config = parse(&[
            "--db-type",
            "sqlite",
            "--update-schema",
            "--thread-pool-size",
            "8",
            "--pool-size",
            "4",
            "--lease-time",
            "30",
            "--lease-wait",
            "5",
            "--force",
            "--dry-run",
        ])
        .unwrap();
        assert_eq!(config.deploy.thread_pool_size, 8);
        assert_eq!(config.deploy.pool_config().max_connections, 10);
        assert_eq!(config.deploy.lease.lease_time, Duration::from_secs(30));
        assert_eq!(config.deploy.lease_wait, Duration::from_secs(5));
        assert!(config.deploy.force && config.deploy.dry_run);
    }
}
