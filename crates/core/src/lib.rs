pub mod domain;
pub mod error;
pub mod ingest;
pub mod pipeline;
pub mod publish;
pub mod staging;
pub mod storage;
pub mod transform;

pub mod config {
    use anyhow::Context;
    use std::path::PathBuf;
    use std::str::FromStr;
    use std::time::Duration;

    const DEFAULT_PIPELINE_NAME: &str = "crypto_markets";
    const DEFAULT_SOURCE_ENDPOINT: &str = "https://api.coingecko.com/api/v3/coins/markets";
    const DEFAULT_API_KEY_HEADER: &str = "x-cg-demo-api-key";
    const DEFAULT_CONTAINER: &str = "crypto-exchange-pipeline";
    const DEFAULT_GCS_BASE_URL: &str = "https://storage.googleapis.com";

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum SinkBackend {
        Local,
        Gcs,
    }

    impl FromStr for SinkBackend {
        type Err = anyhow::Error;

        fn from_str(s: &str) -> anyhow::Result<Self> {
            match s.trim().to_ascii_lowercase().as_str() {
                "local" => Ok(Self::Local),
                "gcs" => Ok(Self::Gcs),
                other => anyhow::bail!("unknown sink backend {other:?} (expected local or gcs)"),
            }
        }
    }

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub pipeline_name: String,

        pub source_endpoint: String,
        pub source_api_key: Option<String>,
        pub source_api_key_header: String,
        pub currency_unit: String,
        pub source_order: String,
        pub page_size: u32,
        pub sparkline: bool,

        pub staging_dir: PathBuf,

        pub sink_backend: SinkBackend,
        pub sink_container_name: String,
        pub sink_location: String,
        pub sink_storage_class: String,
        pub sink_root: PathBuf,
        pub gcs_project: Option<String>,
        pub gcs_access_token: Option<String>,
        pub gcs_base_url: String,

        pub run_interval: Duration,
        pub request_timeout: Duration,
        pub stage_retries: u32,
        pub stage_retry_backoff: Duration,

        pub database_url: Option<String>,
        pub sentry_dsn: Option<String>,
        pub port: u16,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            Self::from_lookup(|key| std::env::var(key).ok())
        }

        /// Builds settings from an arbitrary key lookup so tests do not have to
        /// touch the process environment.
        pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
        where
            F: Fn(&str) -> Option<String>,
        {
            let var = |key: &str| lookup(key).filter(|s| !s.trim().is_empty());
            let or = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

            let settings = Self {
                pipeline_name: or("PIPELINE_NAME", DEFAULT_PIPELINE_NAME),
                source_endpoint: or("SOURCE_ENDPOINT", DEFAULT_SOURCE_ENDPOINT),
                source_api_key: var("SOURCE_API_KEY"),
                source_api_key_header: or("SOURCE_API_KEY_HEADER", DEFAULT_API_KEY_HEADER),
                currency_unit: or("CURRENCY_UNIT", "usd"),
                source_order: or("SOURCE_ORDER", "market_cap_desc"),
                page_size: parse_var(&var, "PAGE_SIZE", 10)?,
                sparkline: parse_var(&var, "SOURCE_SPARKLINE", false)?,
                staging_dir: PathBuf::from(or("STAGING_DIR", "staging")),
                sink_backend: parse_var(&var, "SINK_BACKEND", SinkBackend::Local)?,
                sink_container_name: or("SINK_CONTAINER_NAME", DEFAULT_CONTAINER),
                sink_location: or("SINK_LOCATION", "US"),
                sink_storage_class: or("SINK_STORAGE_CLASS", "MULTI_REGIONAL"),
                sink_root: PathBuf::from(or("SINK_ROOT", "object_store")),
                gcs_project: var("GCS_PROJECT"),
                gcs_access_token: var("GCS_ACCESS_TOKEN"),
                gcs_base_url: or("GCS_BASE_URL", DEFAULT_GCS_BASE_URL),
                run_interval: Duration::from_secs(parse_var(&var, "RUN_INTERVAL_SECS", 600)?),
                request_timeout: Duration::from_secs(parse_var(&var, "REQUEST_TIMEOUT_SECS", 30)?),
                stage_retries: parse_var(&var, "STAGE_RETRIES", 3)?,
                stage_retry_backoff: Duration::from_millis(parse_var(
                    &var,
                    "STAGE_RETRY_BACKOFF_MS",
                    1000,
                )?),
                database_url: var("DATABASE_URL"),
                sentry_dsn: var("SENTRY_DSN"),
                port: parse_var(&var, "PORT", 3000)?,
            };

            settings.validate()?;
            Ok(settings)
        }

        fn validate(&self) -> anyhow::Result<()> {
            anyhow::ensure!(
                is_valid_pipeline_name(&self.pipeline_name),
                "PIPELINE_NAME must match [a-z0-9_-]+ (got {:?})",
                self.pipeline_name
            );
            anyhow::ensure!(self.page_size > 0, "PAGE_SIZE must be > 0");
            anyhow::ensure!(
                !self.run_interval.is_zero(),
                "RUN_INTERVAL_SECS must be > 0"
            );
            anyhow::ensure!(
                !self.request_timeout.is_zero(),
                "REQUEST_TIMEOUT_SECS must be > 0"
            );
            anyhow::ensure!(self.stage_retries >= 1, "STAGE_RETRIES must be >= 1");
            anyhow::ensure!(
                !self.sink_container_name.contains('/'),
                "SINK_CONTAINER_NAME must not contain '/'"
            );
            Ok(())
        }

        pub fn require_database_url(&self) -> anyhow::Result<&str> {
            self.database_url
                .as_deref()
                .context("DATABASE_URL is required")
        }

        pub fn require_gcs_project(&self) -> anyhow::Result<&str> {
            self.gcs_project
                .as_deref()
                .context("GCS_PROJECT is required for SINK_BACKEND=gcs")
        }

        pub fn require_gcs_access_token(&self) -> anyhow::Result<&str> {
            self.gcs_access_token
                .as_deref()
                .context("GCS_ACCESS_TOKEN is required for SINK_BACKEND=gcs")
        }
    }

    fn parse_var<T, V>(var: &V, key: &str, default: T) -> anyhow::Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
        V: Fn(&str) -> Option<String>,
    {
        match var(key) {
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("{key} is invalid ({raw:?}): {e}")),
            None => Ok(default),
        }
    }

    pub fn is_valid_pipeline_name(name: &str) -> bool {
        !name.is_empty()
            && name
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
    }

}
