use anyhow::{Context, Result};
use clap::Parser;
use std::env;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub signing_secret: String,
    pub public_base_url: String,
    pub max_upload_bytes: i64,
    pub trash_retention_days: i64,
    pub sweep_batch_size: i64,
    pub max_concurrent_encodes: usize,
    pub transform_deadline_secs: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Versioned multi-tenant file storage API")]
pub struct Args {
    /// Host to bind to (overrides FILEVAULT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILEVAULT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where content blobs are stored (overrides FILEVAULT_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides FILEVAULT_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// HMAC secret for signed URLs (overrides FILEVAULT_SIGNING_SECRET)
    #[arg(long)]
    pub signing_secret: Option<String>,

    /// Base URL embedded in issued links (overrides FILEVAULT_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Run one eviction sweep and exit
    #[arg(long)]
    pub sweep: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig plus the
    /// run-mode flags.
    pub fn from_env_and_args() -> Result<(Self, Args)> {
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("FILEVAULT_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("FILEVAULT_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing FILEVAULT_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3000,
            Err(err) => return Err(err).context("reading FILEVAULT_PORT"),
        };
        let env_storage =
            env::var("FILEVAULT_STORAGE_DIR").unwrap_or_else(|_| "./data/blobs".into());
        let env_db = env::var("FILEVAULT_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/filevault.db".into());
        let env_secret = env::var("FILEVAULT_SIGNING_SECRET").unwrap_or_default();
        let env_base_url = env::var("FILEVAULT_PUBLIC_BASE_URL")
            .unwrap_or_else(|_| format!("http://localhost:{env_port}"));

        let max_upload_bytes = env_i64("FILEVAULT_MAX_UPLOAD_BYTES", 100 * 1024 * 1024)?;
        let trash_retention_days = env_i64("FILEVAULT_TRASH_RETENTION_DAYS", 7)?;
        let sweep_batch_size = env_i64("FILEVAULT_SWEEP_BATCH_SIZE", 100)?;
        let max_concurrent_encodes = env_i64("FILEVAULT_MAX_CONCURRENT_ENCODES", 4)? as usize;
        let transform_deadline_secs = env_i64("FILEVAULT_TRANSFORM_DEADLINE_SECS", 30)? as u64;

        // --- Merge ---
        let cfg = Self {
            host: args.host.clone().unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.clone().unwrap_or(env_storage),
            database_url: args.database_url.clone().unwrap_or(env_db),
            signing_secret: args.signing_secret.clone().unwrap_or(env_secret),
            public_base_url: args.public_base_url.clone().unwrap_or(env_base_url),
            max_upload_bytes,
            trash_retention_days,
            sweep_batch_size,
            max_concurrent_encodes,
            transform_deadline_secs,
        };

        if cfg.signing_secret.is_empty() {
            anyhow::bail!(
                "a signing secret is required: set FILEVAULT_SIGNING_SECRET or --signing-secret"
            );
        }

        Ok((cfg, args))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_i64(name: &str, default: i64) -> Result<i64> {
    match env::var(name) {
        Ok(value) => value
            .parse::<i64>()
            .with_context(|| format!("parsing {name} value `{value}`")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {name}")),
    }
}
