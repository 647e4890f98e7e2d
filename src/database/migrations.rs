//! Schema migrations with cross-process serialisation.
//!
//! Migrations are discovered from the `migrations/` directory using a
//! timestamp-based naming convention (`YYYYMMDDHHMMSS_description.sql`) and
//! tracked in an application-isolated version table, so this service can
//! share a database with other tools without touching their bookkeeping.
//!
//! Multiple replicas may boot at once; a PostgreSQL advisory lock keyed on a
//! constant derived from the application name serialises the apply step.
//!
//! Environment gates:
//! - `ADI_RUN_MIGRATIONS=0` skips the whole step.
//! - `ADI_ALLOW_AUTO_STAMP=1` baselines a database that predates this
//!   migrator: when the version table is absent but the `imports` table
//!   already exists, all known versions are recorded without executing.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, info, warn};

use crate::error::Result;

const VERSION_TABLE: &str = "adi_schema_migrations";

/// Advisory lock key; constant hash of "omero_adi_migrations".
const MIGRATION_LOCK_KEY: i64 = 0x6F6D_6572_6F61_6469;

/// One discovered migration file.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: String,
    pub name: String,
    pub path: PathBuf,
}

pub struct Migrator {
    migrations_dir: PathBuf,
}

impl Migrator {
    pub fn new(migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            migrations_dir: migrations_dir.into(),
        }
    }

    /// Run all outstanding migrations, honouring the environment gates and
    /// the advisory lock. Idempotent: a database already at head is a no-op.
    ///
    /// Session-level advisory locks belong to one connection, so the whole
    /// lock → migrate → unlock sequence runs on a single connection checked
    /// out of the pool; releasing on another pooled connection would be a
    /// silent no-op and leave the lock held for the process lifetime.
    pub async fn run(&self, pool: &PgPool) -> Result<()> {
        if std::env::var("ADI_RUN_MIGRATIONS").as_deref() == Ok("0") {
            info!("ADI_RUN_MIGRATIONS=0, skipping schema migrations");
            return Ok(());
        }

        let mut conn = pool.acquire().await?;

        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        let result = self.run_locked(&mut conn).await;

        // Release on the same connection, regardless of the apply outcome.
        let unlock = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await;
        if let Err(e) = unlock {
            warn!(error = %e, "failed to release migration advisory lock");
        }

        result
    }

    async fn run_locked(&self, conn: &mut PgConnection) -> Result<()> {
        let has_version_table = table_exists(conn, VERSION_TABLE).await?;
        self.ensure_version_table(conn).await?;

        let migrations = self.discover()?;

        let allow_stamp = std::env::var("ADI_ALLOW_AUTO_STAMP").as_deref() == Ok("1");
        if allow_stamp && !has_version_table && table_exists(conn, "imports").await? {
            info!("existing schema without version table, stamping head");
            for migration in migrations.values() {
                self.record(conn, &migration.version).await?;
            }
            return Ok(());
        }

        let applied = self.applied_versions(conn).await?;
        let mut count = 0usize;
        for migration in migrations.values() {
            if applied.contains(&migration.version) {
                continue;
            }
            info!(
                version = %migration.version,
                name = %migration.name,
                "applying migration"
            );
            let sql = fs::read_to_string(&migration.path)?;
            sqlx::raw_sql(&sql).execute(&mut *conn).await?;
            self.record(conn, &migration.version).await?;
            count += 1;
        }

        if count == 0 {
            debug!("schema already at head");
        } else {
            info!(applied = count, "schema migrations complete");
        }
        Ok(())
    }

    fn discover(&self) -> Result<BTreeMap<String, Migration>> {
        let mut migrations = BTreeMap::new();
        if !self.migrations_dir.exists() {
            return Ok(migrations);
        }

        for entry in fs::read_dir(&self.migrations_dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().map(|s| s != "sql").unwrap_or(true) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some((version, name)) = parse_migration_filename(stem) {
                migrations.insert(version.clone(), Migration { version, name, path });
            }
        }

        Ok(migrations)
    }

    async fn ensure_version_table(&self, conn: &mut PgConnection) -> Result<()> {
        sqlx::raw_sql(&format!(
            "CREATE TABLE IF NOT EXISTS {VERSION_TABLE} (
                version VARCHAR(14) PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        ))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn applied_versions(&self, conn: &mut PgConnection) -> Result<HashSet<String>> {
        let rows = sqlx::query(&format!("SELECT version FROM {VERSION_TABLE}"))
            .fetch_all(&mut *conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("version"))
            .collect())
    }

    async fn record(&self, conn: &mut PgConnection, version: &str) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {VERSION_TABLE} (version) VALUES ($1) ON CONFLICT DO NOTHING"
        ))
        .bind(version)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

impl Default for Migrator {
    fn default() -> Self {
        Self::new(Path::new("migrations"))
    }
}

async fn table_exists(conn: &mut PgConnection, table: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (
            SELECT FROM information_schema.tables
            WHERE table_schema = current_schema() AND table_name = $1
        )",
    )
    .bind(table)
    .fetch_one(&mut *conn)
    .await?;
    Ok(exists)
}

/// Parse `YYYYMMDDHHMMSS_migration_name` into (version, readable name).
fn parse_migration_filename(filename: &str) -> Option<(String, String)> {
    if filename.len() < 15 {
        return None;
    }
    let (version, rest) = filename.split_at(14);
    if !version.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let name = rest.strip_prefix('_').unwrap_or(rest).replace('_', " ");
    Some((version.to_string(), name))
}
