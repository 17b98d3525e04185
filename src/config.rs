use anyhow::{Context, Result, bail, ensure};
use clap::Parser;
use std::{env, fmt::Display, str::FromStr, time::Duration};

/// Where object payloads live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// Local disk under `storage_dir`.
    Local,
    /// An S3 bucket; credentials come from the `AWS_*` environment.
    S3 { bucket: String, region: String },
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub backend: StorageBackend,
    pub storage_dir: String,
    pub public_base_url: String,
    pub key_prefix: String,
    pub retention: Duration,
    pub sweep_interval: Duration,
    pub ttl_monitor_interval: Duration,
    pub sweep_page_size: usize,
    pub sweep_concurrency: usize,
    pub store_timeout: Duration,
    pub shutdown_grace: Duration,
    pub min_object_age: Duration,
    pub max_upload_bytes: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Ephemeral file drop with expiring links")]
pub struct Args {
    /// Host to bind to (overrides EPHEMERAL_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides EPHEMERAL_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides EPHEMERAL_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Storage backend, `local` or `s3` (overrides EPHEMERAL_STORAGE)
    #[arg(long)]
    pub storage: Option<String>,

    /// Directory for the local backend (overrides EPHEMERAL_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Bucket for the s3 backend (overrides EPHEMERAL_S3_BUCKET)
    #[arg(long)]
    pub s3_bucket: Option<String>,

    /// Base of the shareable links (overrides EPHEMERAL_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Seconds a file stays available (overrides EPHEMERAL_RETENTION_SECS)
    #[arg(long)]
    pub retention_secs: Option<u64>,

    /// Seconds between orphan sweeps (overrides EPHEMERAL_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read `name` from the environment, parsing it when present.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{err}"))
            .with_context(|| format!("parsing {name} value `{value}`")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {name}")),
    }
}

fn env_string(name: &str, default: &str) -> Result<String> {
    env_or(name, default.to_string())
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::from_args(args)?, migrate))
    }

    /// Merge `args` over the environment over defaults, then validate.
    pub fn from_args(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = env_string("EPHEMERAL_HOST", "0.0.0.0")?;
        let env_port = env_or("EPHEMERAL_PORT", 5001u16)?;
        let env_db = env_string("EPHEMERAL_DATABASE_URL", "sqlite://./data/meta/files.db")?;
        let env_storage = env_string("EPHEMERAL_STORAGE", "local")?;
        let env_storage_dir = env_string("EPHEMERAL_STORAGE_DIR", "./data/objects")?;
        let env_bucket = env::var("EPHEMERAL_S3_BUCKET").ok();
        let region = env_string("EPHEMERAL_S3_REGION", "us-east-1")?;
        let env_public = env_string(
            "EPHEMERAL_PUBLIC_BASE_URL",
            "http://localhost:5001/objects",
        )?;
        let env_retention = env_or("EPHEMERAL_RETENTION_SECS", 600u64)?;
        let env_sweep = env_or("EPHEMERAL_SWEEP_INTERVAL_SECS", 60u64)?;

        // --- Merge ---
        let backend = match args.storage.unwrap_or(env_storage).as_str() {
            "local" => StorageBackend::Local,
            "s3" => {
                let Some(bucket) = args.s3_bucket.or(env_bucket) else {
                    bail!("the s3 storage backend requires EPHEMERAL_S3_BUCKET or --s3-bucket");
                };
                StorageBackend::S3 { bucket, region }
            }
            other => bail!("unknown storage backend `{other}`; expected `local` or `s3`"),
        };

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            backend,
            storage_dir: args.storage_dir.unwrap_or(env_storage_dir),
            public_base_url: args.public_base_url.unwrap_or(env_public),
            key_prefix: env_string("EPHEMERAL_KEY_PREFIX", "uploads/")?,
            retention: Duration::from_secs(args.retention_secs.unwrap_or(env_retention)),
            sweep_interval: Duration::from_secs(args.sweep_interval_secs.unwrap_or(env_sweep)),
            ttl_monitor_interval: Duration::from_secs(env_or(
                "EPHEMERAL_TTL_MONITOR_INTERVAL_SECS",
                60u64,
            )?),
            sweep_page_size: env_or("EPHEMERAL_SWEEP_PAGE_SIZE", 1000usize)?,
            sweep_concurrency: env_or("EPHEMERAL_SWEEP_CONCURRENCY", 8usize)?,
            store_timeout: Duration::from_secs(env_or("EPHEMERAL_STORE_TIMEOUT_SECS", 10u64)?),
            shutdown_grace: Duration::from_secs(env_or("EPHEMERAL_SHUTDOWN_GRACE_SECS", 15u64)?),
            min_object_age: Duration::from_secs(env_or("EPHEMERAL_MIN_OBJECT_AGE_SECS", 0u64)?),
            max_upload_bytes: env_or("EPHEMERAL_MAX_UPLOAD_BYTES", 100 * 1024 * 1024usize)?,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        ensure!(!self.retention.is_zero(), "retention must be at least one second");
        ensure!(
            !self.sweep_interval.is_zero(),
            "sweep interval must be at least one second"
        );
        ensure!(
            !self.ttl_monitor_interval.is_zero(),
            "ttl monitor interval must be at least one second"
        );
        ensure!(
            !self.store_timeout.is_zero(),
            "store timeout must be at least one second"
        );
        ensure!(self.sweep_page_size > 0, "sweep page size must be positive");
        ensure!(self.sweep_concurrency > 0, "sweep concurrency must be positive");
        ensure!(
            self.key_prefix.ends_with('/') && !self.key_prefix.starts_with('/'),
            "key prefix `{}` must be relative and end with `/`",
            self.key_prefix
        );
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
