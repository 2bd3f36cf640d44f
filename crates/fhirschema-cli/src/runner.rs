//! Executes the actions of a [`CliConfig`].

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use fhirschema_core::adapter::DialectAdapter;
use fhirschema_core::{DbType, DeployOutcome, Error, LogicalSchema, MigrationOrchestrator, Result, SqliteAdapter};
use fhirschema_model::{BatchSchema, FhirDataSchema, OAuthSchema};
use fhirschema_postgres::{CitusAdapter, PgSettings, PostgresAdapter};

use crate::config::{Action, CliConfig, Target};
use crate::properties::{self, Properties};

/// The three logical schemas under their configured names.
pub struct Schemas {
    pub data: FhirDataSchema,
    pub oauth: OAuthSchema,
    pub batch: BatchSchema,
}

impl Schemas {
    pub fn from_config(config: &CliConfig) -> Self {
        Self {
            data: FhirDataSchema::new(config.schema_name(Target::Fhir)),
            oauth: OAuthSchema::new(config.schema_name(Target::Oauth)),
            batch: BatchSchema::new(config.schema_name(Target::Batch)),
        }
    }

    pub fn get(&self, target: Target) -> &dyn LogicalSchema {
        match target {
            Target::Fhir => &self.data,
            Target::Oauth => &self.oauth,
            Target::Batch => &self.batch,
        }
    }

    pub fn all(&self) -> [&dyn LogicalSchema; 3] {
        [&self.data, &self.oauth, &self.batch]
    }
}

/// Connection settings for the PostgreSQL family.
pub fn pg_settings(props: &Properties) -> Result<PgSettings> {
    let defaults = PgSettings::default();
    Ok(PgSettings {
        host: props.get(properties::DB_HOST).unwrap_or(defaults.host.as_str()).to_string(),
        port: props.get_parsed(properties::DB_PORT)?.unwrap_or(defaults.port),
        database: props
            .get(properties::DB_DATABASE)
            .unwrap_or(defaults.database.as_str())
            .to_string(),
        user: props.get(properties::USER).map(str::to_string),
        password: props.get(properties::PASSWORD).map(str::to_string),
        ssl: props.get_parsed(properties::SSL)?.unwrap_or(defaults.ssl),
    })
}

/// Build the dialect adapter selected by `--db-type`.
pub fn build_adapter(config: &CliConfig) -> Result<Arc<dyn DialectAdapter>> {
    let pool = config.deploy.pool_config();
    let dry_run = config.deploy.dry_run;
    let adapter: Arc<dyn DialectAdapter> = match config.db_type {
        DbType::Sqlite => {
            let path = PathBuf::from(config.properties.require(properties::DB_PATH)?);
            Arc::new(SqliteAdapter::new(path, pool, dry_run))
        }
        DbType::Postgres => Arc::new(PostgresAdapter::from_settings(&pg_settings(&config.properties)?, pool, dry_run)?),
        DbType::Citus => Arc::new(CitusAdapter::from_settings(&pg_settings(&config.properties)?, pool, dry_run)?),
    };
    tracing::info!(db_type = %config.db_type, dry_run, "adapter ready");
    Ok(adapter)
}

fn describe_model(schemas: &Schemas, out: &mut dyn Write) -> Result<()> {
    let model = MigrationOrchestrator::build_model(&schemas.all())?;
    let json = serde_json::to_string_pretty(&model.describe())
        .map_err(|e| Error::data_access_with("serializing the model", e))?;
    writeln!(out, "{}", json).map_err(|e| Error::data_access_with("writing the model", e))?;
    Ok(())
}

fn log_outcome(outcome: &DeployOutcome) {
    match outcome {
        DeployOutcome::Applied(report) => tracing::info!(
            schema = %report.schema,
            from = report.previous_version,
            to = report.version,
            applied = report.objects_applied,
            up_to_date = report.objects_up_to_date,
            migrations = ?report.migrations_applied,
            forced = report.forced,
            "schema updated"
        ),
        DeployOutcome::UpToDate { schema, version } => {
            tracing::info!(schema = %schema, version, "schema already current")
        }
    }
}

/// Run every action in order, writing model output to `out`.
pub fn run(config: &CliConfig, out: &mut dyn Write) -> Result<()> {
    let schemas = Schemas::from_config(config);
    if config.actions.contains(&Action::DescribeModel) {
        describe_model(&schemas, out)?;
    }
    if !config.needs_database() {
        return Ok(());
    }

    let adapter = build_adapter(config)?;
    let orchestrator = MigrationOrchestrator::new(adapter, config.deploy.clone());
    for action in &config.actions {
        match action {
            Action::DescribeModel => {}
            Action::CreateSchemas => orchestrator.create_schemas(&schemas.all())?,
            Action::Update(target) => log_outcome(&orchestrator.update_schema(schemas.get(*target))?),
            Action::Grant(target) => {
                orchestrator.grant(schemas.get(*target))?;
                tracing::info!(schema = schemas.get(*target).schema_name(), "grants applied");
            }
            Action::Drop(target) => orchestrator.drop_schema(schemas.get(*target), true)?,
            Action::DropAdmin => orchestrator.drop_admin(true)?,
            Action::CheckCompatibility => {
                if !orchestrator.check_compatibility(&schemas.data)? {
                    return Err(Error::validation(format!(
                        "{} is not compatible with this release",
                        schemas.data.schema_name()
                    )));
                }
                tracing::info!(schema = schemas.data.schema_name(), "schema is compatible");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pg_settings_from_properties() {
        let props = Properties::parse("db.host=pg1\ndb.port=6432\nuser=fhiradmin\nssl=true\n").unwrap();
        let settings = pg_settings(&props).unwrap();
        assert_eq!(settings.host, "pg1");
        assert_eq!(settings.port, 6432);
        assert_eq!(settings.database, "fhirdb");
        assert_eq!(settings.user.as_deref(), Some("fhiradmin"));
        assert!(settings.ssl);
    }

    #[test]
    fn test_bad_port_is_a_config_error() {
        let props = Properties::parse("db.port=many").unwrap();
        assert!(matches!(pg_settings(&props), Err(Error::Config(_))));
    }
}
