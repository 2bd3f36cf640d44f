//! Embedded SQLite dialect.
//!
//! SQLite has no schemas of its own, so each schema is a sibling database
//! file attached under the schema's name: with a main file `fhir.db`, schema
//! `FHIRDATA` lives in `fhir.FHIRDATA.db`. Every connection re-syncs its
//! attachments with the files on disk before it starts a transaction, so a
//! schema created through one pooled connection is visible on all of them.
//! Creating or dropping a schema bumps its generation; a connection holding
//! an attachment from an older generation detaches and re-attaches it, so an
//! idle connection never writes through a handle to an unlinked file.
//!
//! Write transactions use `BEGIN IMMEDIATE`, which takes the write lock on
//! every attached file up front; concurrent writers queue on the busy
//! timeout instead of failing mid-transaction.
//!
//! Sequences, routines, foreign-key alters and grants do not exist here and
//! render to nothing; the engine still ledgers those objects.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rusqlite::types::Value;
use rusqlite::ErrorCode;

use crate::adapter::translator::is_plain_identifier;
use crate::adapter::{
    Connection, ConnectionFactory, ConnectionPool, DbRow, DbType, DbValue, DialectAdapter,
    ObjectInfo, PoolConfig, PooledConnection, Translator,
};
use crate::error::{Error, Result};
use crate::model::{ColumnType, IndexDef};

/// Default busy timeout for every connection.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Oldest SQLite release with everything the engine relies on
/// (`ON CONFLICT DO UPDATE`, `DROP COLUMN`).
const MIN_SQLITE_VERSION: (u32, u32) = (3, 35);

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, msg) => {
                let detail = msg.clone().unwrap_or_else(|| e.to_string());
                match e.code {
                    ErrorCode::ConstraintViolation
                        if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                            || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
                    {
                        Error::UniqueViolation(detail)
                    }
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => Error::ConcurrentUpdate(detail),
                    ErrorCode::CannotOpen | ErrorCode::NotADatabase => Error::DatabaseNotReady(detail),
                    _ => Error::data_access_with(detail, err),
                }
            }
            _ => Error::data_access_with("sqlite error", err),
        }
    }
}

fn io_error(context: String, err: io::Error) -> Error {
    Error::data_access_with(context, err)
}

/// Where the main file and the per-schema files live.
#[derive(Debug)]
struct FileLayout {
    main: PathBuf,
    dir: PathBuf,
    stem: String,
    /// Bumped whenever a schema file is created or removed.
    generations: DashMap<String, u64>,
}

impl FileLayout {
    fn new(main: PathBuf) -> Self {
        let dir = main
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let stem = main
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "fhir".to_string());
        Self {
            main,
            dir,
            stem,
            generations: DashMap::new(),
        }
    }

    fn schema_file(&self, schema: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}.db", self.stem, schema.to_ascii_uppercase()))
    }

    fn generation(&self, schema: &str) -> u64 {
        self.generations
            .get(&schema.to_ascii_uppercase())
            .map(|g| *g)
            .unwrap_or(0)
    }

    fn bump_generation(&self, schema: &str) -> u64 {
        let mut entry = self.generations.entry(schema.to_ascii_uppercase()).or_insert(0);
        *entry += 1;
        *entry
    }

    fn schema_exists(&self, schema: &str) -> bool {
        self.schema_file(schema).is_file()
    }

    /// Schema names with a file on disk.
    fn existing_schemas(&self) -> Result<BTreeSet<String>> {
        let prefix = format!("{}.", self.stem);
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(io_error(format!("listing {}", self.dir.display()), e)),
        };

        let mut schemas = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_error(format!("listing {}", self.dir.display()), e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let schema = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".db"));
            if let Some(schema) = schema {
                if is_plain_identifier(schema) {
                    schemas.insert(schema.to_string());
                }
            }
        }
        Ok(schemas)
    }
}

/// Opens connections to the main file with all schema files attached.
#[derive(Debug)]
pub struct SqliteConnectionFactory {
    layout: Arc<FileLayout>,
    busy_timeout: Duration,
}

impl SqliteConnectionFactory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            layout: Arc::new(FileLayout::new(path.into())),
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }
}

impl ConnectionFactory for SqliteConnectionFactory {
    fn connect(&self) -> Result<Box<dyn Connection>> {
        let conn = rusqlite::Connection::open(&self.layout.main)?;
        conn.busy_timeout(self.busy_timeout)?;
        let mut conn = SqliteConnection {
            conn,
            layout: Arc::clone(&self.layout),
            attached: BTreeMap::new(),
        };
        conn.sync_attachments()?;
        Ok(Box::new(conn))
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.layout.main.display())
    }
}

/// One SQLite connection.
pub struct SqliteConnection {
    conn: rusqlite::Connection,
    layout: Arc<FileLayout>,
    /// Attached schema and the file generation it was attached at.
    attached: BTreeMap<String, u64>,
}

impl SqliteConnection {
    /// Attach schema files created since the last sync, detach removed ones
    /// and re-attach files replaced since they were attached. A no-op inside
    /// a transaction, where SQLite forbids all three.
    fn sync_attachments(&mut self) -> Result<()> {
        if !self.conn.is_autocommit() {
            return Ok(());
        }
        let present = self.layout.existing_schemas()?;

        let stale: Vec<String> = self
            .attached
            .iter()
            .filter(|(schema, generation)| {
                !present.contains(*schema) || self.layout.generation(schema) != **generation
            })
            .map(|(schema, _)| schema.clone())
            .collect();
        for schema in stale {
            self.conn
                .execute(&format!("DETACH DATABASE {}", schema), [])?;
            tracing::trace!(schema = %schema, "detached schema file");
            self.attached.remove(&schema);
        }

        for schema in &present {
            if self.attached.contains_key(schema) {
                continue;
            }
            let generation = self.layout.generation(schema);
            let file = self.layout.schema_file(schema);
            self.conn.execute(
                &format!("ATTACH DATABASE ?1 AS {}", schema),
                [file.to_string_lossy().as_ref()],
            )?;
            tracing::trace!(schema = %schema, generation, "attached schema file");
            self.attached.insert(schema.clone(), generation);
        }
        Ok(())
    }
}

fn to_sql_value(value: &DbValue) -> Value {
    match value {
        DbValue::Null => Value::Null,
        DbValue::Integer(v) => Value::Integer(*v),
        DbValue::Real(v) => Value::Real(*v),
        DbValue::Text(v) => Value::Text(v.clone()),
        DbValue::Boolean(v) => Value::Integer(i64::from(*v)),
    }
}

fn from_sql_value(value: Value) -> DbValue {
    match value {
        Value::Null => DbValue::Null,
        Value::Integer(v) => DbValue::Integer(v),
        Value::Real(v) => DbValue::Real(v),
        Value::Text(v) => DbValue::Text(v),
        Value::Blob(v) => DbValue::Text(String::from_utf8_lossy(&v).into_owned()),
    }
}

impl Connection for SqliteConnection {
    fn execute(&mut self, sql: &str, params: &[DbValue]) -> Result<u64> {
        self.sync_attachments()?;
        let values: Vec<Value> = params.iter().map(to_sql_value).collect();
        let affected = self
            .conn
            .execute(sql, rusqlite::params_from_iter(values.iter()))?;
        Ok(affected as u64)
    }

    fn query(&mut self, sql: &str, params: &[DbValue]) -> Result<Vec<DbRow>> {
        self.sync_attachments()?;
        let values: Vec<Value> = params.iter().map(to_sql_value).collect();
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let width = columns.len();

        let mut rows = stmt.query(rusqlite::params_from_iter(values.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut cells = Vec::with_capacity(width);
            for i in 0..width {
                cells.push(from_sql_value(row.get::<_, Value>(i)?));
            }
            out.push(DbRow::new(columns.clone(), cells));
        }
        Ok(out)
    }

    fn begin(&mut self) -> Result<()> {
        self.sync_attachments()?;
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }
}

/// SQL fragments for SQLite.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteTranslator;

impl Translator for SqliteTranslator {
    fn db_type(&self) -> DbType {
        DbType::Sqlite
    }

    fn column_type(&self, column_type: &ColumnType) -> String {
        match column_type {
            ColumnType::SmallInt => "SMALLINT".to_string(),
            ColumnType::Integer => "INTEGER".to_string(),
            ColumnType::BigInt => "BIGINT".to_string(),
            ColumnType::Double => "DOUBLE".to_string(),
            ColumnType::Varchar(n) => format!("VARCHAR({})", n),
            ColumnType::Char(n) => format!("CHAR({})", n),
            ColumnType::Text => "TEXT".to_string(),
            ColumnType::Timestamp => "TIMESTAMP".to_string(),
            ColumnType::Blob => "BLOB".to_string(),
        }
    }

    /// SQLite qualifies the index name, never the table.
    fn create_index(&self, schema: &str, table: &str, index: &IndexDef) -> String {
        format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            self.qualified(schema, &index.name),
            self.quote(table),
            self.column_list(&index.columns)
        )
    }

    fn add_column(&self, schema: &str, table: &str, column_sql: &str) -> String {
        format!("ALTER TABLE {} ADD COLUMN {}", self.qualified(schema, table), column_sql)
    }

    fn supports_sequences(&self) -> bool {
        false
    }

    fn supports_routines(&self) -> bool {
        false
    }

    fn supports_foreign_key_alter(&self) -> bool {
        false
    }

    fn supports_grants(&self) -> bool {
        false
    }
}

/// Dialect adapter for an embedded SQLite database.
pub struct SqliteAdapter {
    layout: Arc<FileLayout>,
    pool: ConnectionPool,
    translator: SqliteTranslator,
    dry_run: bool,
}

impl SqliteAdapter {
    /// Adapter for the database whose main file is `path`. Nothing is opened
    /// until the first connection is requested.
    pub fn new(path: impl Into<PathBuf>, pool_config: PoolConfig, dry_run: bool) -> Self {
        Self::with_factory(SqliteConnectionFactory::new(path), pool_config, dry_run)
    }

    pub fn with_factory(factory: SqliteConnectionFactory, pool_config: PoolConfig, dry_run: bool) -> Self {
        let layout = Arc::clone(&factory.layout);
        Self {
            layout,
            pool: ConnectionPool::new(Arc::new(factory), pool_config),
            translator: SqliteTranslator,
            dry_run,
        }
    }

    /// Main database file.
    pub fn path(&self) -> &Path {
        &self.layout.main
    }

    /// File backing `schema`.
    pub fn schema_file(&self, schema: &str) -> PathBuf {
        self.layout.schema_file(schema)
    }

    fn check_schema_name(schema: &str) -> Result<()> {
        if is_plain_identifier(schema) {
            Ok(())
        } else {
            Err(Error::config(format!(
                "schema name '{}' must be letters, digits and underscores",
                schema
            )))
        }
    }
}

impl DialectAdapter for SqliteAdapter {
    fn db_type(&self) -> DbType {
        DbType::Sqlite
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
        Self::check_schema_name(schema)?;
        if self.dry_run {
            tracing::info!(target: "fhirschema::dry_run", "CREATE SCHEMA {};", schema);
            return Ok(());
        }

        let file = self.layout.schema_file(schema);
        match fs::OpenOptions::new().write(true).create_new(true).open(&file) {
            Ok(_) => {
                let generation = self.layout.bump_generation(schema);
                tracing::info!(schema, file = %file.display(), generation, "created schema");
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                tracing::debug!(schema, "schema already exists");
            }
            Err(e) => return Err(io_error(format!("creating {}", file.display()), e)),
        }

        // attach on this connection right away
        if !conn.in_transaction() {
            conn.query("SELECT 1", &[])?;
        }
        Ok(())
    }

    fn drop_schema(&self, conn: &mut dyn Connection, schema: &str) -> Result<()> {
        Self::check_schema_name(schema)?;
        if self.dry_run {
            tracing::info!(target: "fhirschema::dry_run", "DROP SCHEMA {};", schema);
            return Ok(());
        }

        let file = self.layout.schema_file(schema);
        for path in [file.clone(), PathBuf::from(format!("{}-journal", file.display()))] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error(format!("removing {}", path.display()), e)),
            }
        }
        self.layout.bump_generation(schema);
        if !conn.in_transaction() {
            conn.query("SELECT 1", &[])?;
        }
        tracing::info!(schema, "dropped schema");
        Ok(())
    }

    fn list_schema_objects(&self, conn: &mut dyn Connection, schema: &str) -> Result<Vec<ObjectInfo>> {
        Self::check_schema_name(schema)?;
        if !self.layout.schema_exists(schema) {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT type, name FROM {}.sqlite_master WHERE name NOT LIKE 'sqlite_%' ORDER BY type, name",
            schema
        );
        conn.query(&sql, &[])?
            .iter()
            .map(|row| Ok(ObjectInfo::new(row.get::<String>(0)?, row.get::<String>(1)?)))
            .collect()
    }

    fn check_compatibility(&self, conn: &mut dyn Connection, schema: &str) -> Result<bool> {
        let version: String = conn.query_scalar("SELECT sqlite_version()", &[])?;
        let mut parts = version.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
        let found = (parts.next().unwrap_or(0), parts.next().unwrap_or(0));
        if found < MIN_SQLITE_VERSION {
            tracing::warn!(version = %version, "sqlite is too old");
            return Ok(false);
        }
        if !self.layout.schema_exists(schema) {
            tracing::warn!(schema, "schema does not exist");
            return Ok(false);
        }
        Ok(true)
    }
}

impl std::fmt::Debug for SqliteAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteAdapter")
            .field("path", &self.layout.main)
            .field("pool", &self.pool)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}
