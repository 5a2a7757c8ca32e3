//! SQLite access: pools, migrations and metadata lookups.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dp_core::Coordinates;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("invalid database url {database_url}"))?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(30));
    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to connect to {database_url}"))
}

/// Private in-memory database; one connection that is never recycled.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .context("failed to open in-memory database")
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("failed to apply schema migrations")
}

pub async fn ping(pool: &SqlitePool) -> Result<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .context("database is not reachable")?;
    Ok(())
}

pub async fn count_signals(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM signal")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

async fn id_by_name(pool: &SqlitePool, table: &str, name: &str) -> Result<Option<i64>> {
    let sql = format!("SELECT {table}_id FROM {table} WHERE name = ?");
    let id: Option<i64> = sqlx::query_scalar(&sql)
        .bind(name)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("looking up {table} {name}"))?;
    Ok(id)
}

pub async fn site_id(pool: &SqlitePool, name: &str) -> Result<Option<i64>> {
    id_by_name(pool, "site", name).await
}

pub async fn parameter_id(pool: &SqlitePool, name: &str) -> Result<Option<i64>> {
    id_by_name(pool, "parameter", name).await
}

pub async fn source_type_id(pool: &SqlitePool, name: &str) -> Result<Option<i64>> {
    id_by_name(pool, "source_type", name).await
}

pub async fn source_id(pool: &SqlitePool, name: &str) -> Result<Option<i64>> {
    id_by_name(pool, "source", name).await
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SiteRef {
    pub site_id: i64,
    pub coordinates: Coordinates,
}

/// Name to id maps used while validating one batch of signals.
#[derive(Debug, Clone, Default)]
pub struct MetadataCache {
    pub sources: HashMap<String, i64>,
    pub parameters: HashMap<String, i64>,
    pub sites: HashMap<String, SiteRef>,
}

impl MetadataCache {
    pub async fn load(pool: &SqlitePool) -> Result<Self> {
        let mut cache = Self::default();
        for row in sqlx::query("SELECT source_id, name FROM source")
            .fetch_all(pool)
            .await
            .context("loading sources")?
        {
            cache.sources.insert(row.try_get("name")?, row.try_get("source_id")?);
        }
        for row in sqlx::query("SELECT parameter_id, name FROM parameter")
            .fetch_all(pool)
            .await
            .context("loading parameters")?
        {
            cache
                .parameters
                .insert(row.try_get("name")?, row.try_get("parameter_id")?);
        }
        for row in sqlx::query("SELECT site_id, name, coord_x, coord_y, coord_z FROM site")
            .fetch_all(pool)
            .await
            .context("loading sites")?
        {
            cache.sites.insert(
                row.try_get("name")?,
                SiteRef {
                    site_id: row.try_get("site_id")?,
                    coordinates: Coordinates {
                        x: row.try_get("coord_x")?,
                        y: row.try_get("coord_y")?,
                        z: row.try_get("coord_z")?,
                    },
                },
            );
        }
        Ok(cache)
    }
}
