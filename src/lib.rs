//! filevault — multi-tenant, versioned object storage with soft-delete
//! trash, signed URLs, and a cached image-derivative pipeline.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;

use anyhow::Result;
use sqlx::SqlitePool;

/// Schema, embedded so server startup and tests apply the identical DDL.
const SCHEMA_SQL: &str = include_str!("../migrations/0001_init.sql");

/// Run the schema statements in order against a pool.
pub async fn run_migrations(db: &SqlitePool) -> Result<()> {
    let statements = SCHEMA_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}
