//! PostgreSQL and Citus dialect adapters.

use fhirschema_core::adapter::{
    Connection, ConnectionPool, DbType, DialectAdapter, ObjectInfo, PoolConfig, PooledConnection,
    Translator,
};
use fhirschema_core::{Distribution, ObjectDefinition, Result, SchemaObject};
use std::sync::Arc;

use crate::connection::{PgConnectionFactory, PgSettings};
use crate::translator::PostgresTranslator;

/// Oldest server with `CREATE PROCEDURE`.
const MIN_SERVER_VERSION: i32 = 110000;

const LIST_OBJECTS: &str = "\
SELECT CASE c.relkind WHEN 'S' THEN 'SEQUENCE' WHEN 'i' THEN 'INDEX' WHEN 'v' THEN 'VIEW' ELSE 'TABLE' END AS object_type, \
       c.relname::text AS name \
  FROM pg_catalog.pg_class c JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
 WHERE n.nspname = lower(?) AND c.relkind IN ('r', 'p', 'v', 'S', 'i') \
UNION ALL \
SELECT CASE p.prokind WHEN 'p' THEN 'PROCEDURE' ELSE 'FUNCTION' END, p.proname::text \
  FROM pg_catalog.pg_proc p JOIN pg_catalog.pg_namespace n ON n.oid = p.pronamespace \
 WHERE n.nspname = lower(?) \
 ORDER BY 1, 2";

/// Dialect adapter for a single PostgreSQL server.
pub struct PostgresAdapter {
    pool: ConnectionPool,
    translator: PostgresTranslator,
    dry_run: bool,
}

impl PostgresAdapter {
    pub fn new(factory: PgConnectionFactory, pool_config: PoolConfig, dry_run: bool) -> Self {
        Self::with_translator(factory, pool_config, dry_run, PostgresTranslator::postgres())
    }

    pub fn from_settings(settings: &PgSettings, pool_config: PoolConfig, dry_run: bool) -> Result<Self> {
        Ok(Self::new(PgConnectionFactory::from_settings(settings)?, pool_config, dry_run))
    }

    fn with_translator(
        factory: PgConnectionFactory,
        pool_config: PoolConfig,
        dry_run: bool,
        translator: PostgresTranslator,
    ) -> Self {
        Self {
            pool: ConnectionPool::new(Arc::new(factory), pool_config),
            translator,
            dry_run,
        }
    }

    fn schema_exists(conn: &mut dyn Connection, schema: &str) -> Result<bool> {
        let count: i64 = conn.query_scalar(
            "SELECT COUNT(*) FROM pg_catalog.pg_namespace WHERE nspname = lower(?)",
            &[schema.into()],
        )?;
        Ok(count > 0)
    }
}

impl DialectAdapter for PostgresAdapter {
    fn db_type(&self) -> DbType {
        self.translator.db_type()
    }

    fn translator(&self) -> &dyn Translator {
        &self.translator
    }

    fn connection(&self) -> Result<PooledConnection> {
        self.pool.acquire()
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn create_schema(&self, conn: &mut dyn Connection, schema: &str) -> Result<()> {
        self.run_ddl(conn, &format!("CREATE SCHEMA IF NOT EXISTS {}", self.translator.quote(schema)))
    }

    fn drop_schema(&self, conn: &mut dyn Connection, schema: &str) -> Result<()> {
        self.run_ddl(conn, &format!("DROP SCHEMA IF EXISTS {} RESTRICT", self.translator.quote(schema)))
    }

    fn list_schema_objects(&self, conn: &mut dyn Connection, schema: &str) -> Result<Vec<ObjectInfo>> {
        conn.query(LIST_OBJECTS, &[schema.into(), schema.into()])?
            .iter()
            .map(|row| Ok(ObjectInfo::new(row.get::<String>(0)?, row.get::<String>(1)?)))
            .collect()
    }

    fn check_compatibility(&self, conn: &mut dyn Connection, schema: &str) -> Result<bool> {
        let version: i32 = conn.query_scalar("SELECT current_setting('server_version_num')::int", &[])?;
        if version < MIN_SERVER_VERSION {
            tracing::warn!(version, "postgresql server is too old");
            return Ok(false);
        }
        if !Self::schema_exists(conn, schema)? {
            tracing::warn!(schema, "schema does not exist");
            return Ok(false);
        }
        Ok(true)
    }
}

/// Dialect adapter for Citus: PostgreSQL plus table distribution, with
/// foreign keys committed per child table.
pub struct CitusAdapter {
    inner: PostgresAdapter,
}

impl CitusAdapter {
    pub fn new(factory: PgConnectionFactory, pool_config: PoolConfig, dry_run: bool) -> Self {
        Self {
            inner: PostgresAdapter::with_translator(factory, pool_config, dry_run, PostgresTranslator::citus()),
        }
    }

    pub fn from_settings(settings: &PgSettings, pool_config: PoolConfig, dry_run: bool) -> Result<Self> {
        Ok(Self::new(PgConnectionFactory::from_settings(settings)?, pool_config, dry_run))
    }

    /// The `SELECT create_*_table(...)` call for a table, if it has a hint.
    pub fn distribution_statement(&self, obj: &SchemaObject) -> Option<String> {
        let def = obj.as_table()?;
        let table = self.inner.translator.qualified(&obj.schema, &obj.name);
        match &def.distribution {
            Distribution::None => None,
            Distribution::Reference => Some(format!("SELECT create_reference_table('{}')", table)),
            Distribution::Distributed { column } => Some(format!(
                "SELECT create_distributed_table('{}', '{}')",
                table,
                column.to_ascii_lowercase()
            )),
        }
    }
}

impl DialectAdapter for CitusAdapter {
    fn db_type(&self) -> DbType {
        DbType::Citus
    }

    fn translator(&self) -> &dyn Translator {
        self.inner.translator()
    }

    fn connection(&self) -> Result<PooledConnection> {
        self.inner.connection()
    }

    fn is_dry_run(&self) -> bool {
        self.inner.is_dry_run()
    }

    fn create_schema(&self, conn: &mut dyn Connection, schema: &str) -> Result<()> {
        self.inner.create_schema(conn, schema)
    }

    fn drop_schema(&self, conn: &mut dyn Connection, schema: &str) -> Result<()> {
        self.inner.drop_schema(conn, schema)
    }

    fn list_schema_objects(&self, conn: &mut dyn Connection, schema: &str) -> Result<Vec<ObjectInfo>> {
        self.inner.list_schema_objects(conn, schema)
    }

    fn check_compatibility(&self, conn: &mut dyn Connection, schema: &str) -> Result<bool> {
        if !self.inner.check_compatibility(conn, schema)? {
            return Ok(false);
        }
        let citus: i64 = conn.query_scalar(
            "SELECT COUNT(*) FROM pg_catalog.pg_extension WHERE extname = 'citus'",
            &[],
        )?;
        if citus == 0 {
            tracing::warn!("citus extension is not installed");
        }
        Ok(citus > 0)
    }

    fn apply_object(&self, conn: &mut dyn Connection, obj: &SchemaObject, prior: Option<i32>) -> Result<()> {
        if let ObjectDefinition::ForeignKey(fk) = &obj.definition {
            if !fk.enforce_on_distributed {
                tracing::debug!(object = %obj, "foreign key not enforced on citus");
                return Ok(());
            }
        }
        for statement in fhirschema_core::ddl::render_apply(self.translator(), obj, prior) {
            self.run_ddl(conn, &statement)?;
        }
        Ok(())
    }

    fn apply_distribution_rule(&self, conn: &mut dyn Connection, obj: &SchemaObject) -> Result<()> {
        let Some(statement) = self.distribution_statement(obj) else {
            return Ok(());
        };
        if !self.is_dry_run() {
            let table = self.inner.translator.qualified(&obj.schema, &obj.name);
            let distributed: i64 = conn.query_scalar(
                "SELECT COUNT(*) FROM pg_dist_partition WHERE logicalrelid = to_regclass(?)",
                &[table.into()],
            )?;
            if distributed > 0 {
                tracing::debug!(object = %obj, "already distributed");
                return Ok(());
            }
        }
        self.run_ddl(conn, &statement)
    }

    fn splits_foreign_key_transactions(&self) -> bool {
        true
    }
}
