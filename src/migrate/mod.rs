//! Embedded ClickHouse schema migrations for the `signal` and `data` tables.

use anyhow::{bail, Context, Result};
use clickhouse_rs::{ClientHandle, Pool};
use serde::Serialize;

/// Embedded SQL migration with version and both directions.
struct Migration {
    version: u32,
    up_sql: &'static str,
    down_sql: &'static str,
}

/// All embedded migrations, ordered by version.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up_sql: include_str!("sql/001_init.up.sql"),
    down_sql: include_str!("sql/001_init.down.sql"),
}];

/// Applied schema version as recorded in `schema_migrations`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub version: u32,
    pub dirty: bool,
    /// Highest version embedded in this build.
    pub latest: u32,
}

impl MigrationStatus {
    pub fn is_current(&self) -> bool {
        !self.dirty && self.version == self.latest
    }
}

/// Schema migration runner.
pub trait Migrator: Send {
    /// Applies all pending forward migrations. Returns how many were applied.
    fn up(&self) -> impl std::future::Future<Output = Result<u32>> + Send;

    /// Rolls back the last applied migration.
    fn down(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Returns the current migration version and dirty flag.
    fn status(&self) -> impl std::future::Future<Output = Result<MigrationStatus>> + Send;
}

/// ClickHouse migration runner tracking state in a `schema_migrations` table.
pub struct ClickHouseMigrator {
    pool: Pool,
}

impl ClickHouseMigrator {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn handle(&self, purpose: &'static str) -> Result<ClientHandle> {
        self.pool
            .get_handle()
            .await
            .with_context(|| format!("getting ClickHouse handle for {purpose}"))
    }

    async fn ensure_migrations_table(&self) -> Result<()> {
        let mut handle = self.handle("migrations table").await?;

        handle
            .execute(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version Int64,
                    dirty UInt8,
                    sequence UInt64
                ) ENGINE = TinyLog",
            )
            .await
            .context("creating schema_migrations table")?;

        Ok(())
    }

    async fn current_version(&self) -> Result<(u32, bool)> {
        let mut handle = self.handle("version check").await?;

        let block = handle
            .query("SELECT version, dirty FROM schema_migrations ORDER BY sequence DESC LIMIT 1")
            .fetch_all()
            .await
            .context("querying migration version")?;

        match block.rows().next() {
            Some(row) => {
                let version: i64 = row.get("version").context("reading version")?;
                let dirty: u8 = row.get("dirty").context("reading dirty flag")?;
                let version = u32::try_from(version)
                    .with_context(|| format!("migration version {version} out of range"))?;
                Ok((version, dirty != 0))
            }
            None => Ok((0, false)),
        }
    }

    async fn set_version(&self, version: u32, dirty: bool) -> Result<()> {
        let mut handle = self.handle("version update").await?;

        handle
            .execute("TRUNCATE TABLE schema_migrations")
            .await
            .context("truncating schema_migrations")?;

        if version == 0 {
            return Ok(());
        }

        let dirty_val = u8::from(dirty);
        let sql = format!(
            "INSERT INTO schema_migrations (version, dirty, sequence) VALUES ({version}, {dirty_val}, 1)"
        );

        handle
            .execute(sql.as_str())
            .await
            .context("inserting migration version")?;

        Ok(())
    }

    async fn execute_sql(&self, sql: &str) -> Result<()> {
        let mut handle = self.handle("SQL execution").await?;

        for statement in split_statements(sql) {
            handle.execute(statement).await.with_context(|| {
                let preview: String = statement.chars().take(80).collect();
                format!("executing migration statement: {preview}...")
            })?;
        }

        Ok(())
    }
}

impl Migrator for ClickHouseMigrator {
    async fn up(&self) -> Result<u32> {
        self.ensure_migrations_table().await?;

        let (current_version, dirty) = self.current_version().await?;
        if dirty {
            bail!("migration version {current_version} is dirty, manual intervention required");
        }

        let pending = pending_after(current_version);
        if pending.is_empty() {
            tracing::info!(version = current_version, "schema up to date");
            return Ok(0);
        }

        tracing::info!(current_version, pending = pending.len(), "running migrations");

        for migration in &pending {
            tracing::info!(version = migration.version, "applying migration");

            self.set_version(migration.version, true).await?;
            self.execute_sql(migration.up_sql)
                .await
                .with_context(|| format!("applying migration version {}", migration.version))?;
            self.set_version(migration.version, false).await?;
        }

        let applied = pending.len() as u32;
        tracing::info!(version = latest_version(), applied, "migrations completed");

        Ok(applied)
    }

    async fn down(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current_version, _) = self.current_version().await?;
        if current_version == 0 {
            tracing::info!("no migrations to roll back");
            return Ok(());
        }

        let migration = MIGRATIONS
            .iter()
            .find(|m| m.version == current_version)
            .with_context(|| format!("migration version {current_version} not found"))?;

        tracing::info!(version = current_version, "rolling back migration");

        self.set_version(current_version, true).await?;
        self.execute_sql(migration.down_sql)
            .await
            .with_context(|| format!("rolling back migration version {current_version}"))?;

        let prev_version = MIGRATIONS
            .iter()
            .filter(|m| m.version < current_version)
            .map(|m| m.version)
            .max()
            .unwrap_or(0);

        self.set_version(prev_version, false).await?;

        tracing::info!(version = prev_version, "rollback completed");

        Ok(())
    }

    async fn status(&self) -> Result<MigrationStatus> {
        self.ensure_migrations_table().await?;
        let (version, dirty) = self.current_version().await?;

        Ok(MigrationStatus {
            version,
            dirty,
            latest: latest_version(),
        })
    }
}

fn latest_version() -> u32 {
    MIGRATIONS.iter().map(|m| m.version).max().unwrap_or(0)
}

fn pending_after(version: u32) -> Vec<&'static Migration> {
    MIGRATIONS.iter().filter(|m| m.version > version).collect()
}

/// Splits SQL text into individual statements by semicolons.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect()
}
