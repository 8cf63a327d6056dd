//! Runtime configuration resolved once at startup and threaded explicitly
//! into workers; the pipeline itself never reads the process environment.

use std::time::Duration;

use crate::error::IngestError;
use crate::util::env::{env_opt, env_parse};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub ingest_workers: usize,
    pub ingest_batch_size: i64,
    pub stale_lock_minutes: i64,
    pub http_timeout: Duration,
    pub fx_provider_url: Option<String>,
    pub max_db_connections: u32,
    /// Optional local Steam app-list cache (read streamingly when present).
    pub steam_apps_path: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, IngestError> {
        let database_url = env_opt("DATABASE_URL")
            .ok_or_else(|| IngestError::Config("DATABASE_URL is required".into()))?;

        let default_workers = std::thread::available_parallelism()
            .map(|n| n.get() * 2)
            .unwrap_or(4);

        Ok(Self {
            database_url,
            ingest_workers: env_parse("INGEST_WORKERS", default_workers),
            ingest_batch_size: env_parse("INGEST_BATCH_SIZE", 500i64),
            stale_lock_minutes: env_parse("STALE_LOCK_MINUTES", 30i64),
            http_timeout: Duration::from_secs(env_parse("HTTP_TIMEOUT_SECONDS", 15u64)),
            fx_provider_url: env_opt("FX_PROVIDER_URL"),
            max_db_connections: env_parse("MAX_DB_CONNECTIONS", 10u32),
            steam_apps_path: env_opt("STEAM_APPS_PATH"),
        })
    }

    /// Per-source API key, resolved from `SOURCE_<SLUG>_API_KEY`.
    pub fn source_api_key(slug: &str) -> Option<String> {
        let key = format!(
            "SOURCE_{}_API_KEY",
            slug.to_ascii_uppercase().replace('-', "_")
        );
        env_opt(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_api_key_env_name_uses_upper_snake_slug() {
        std::env::set_var("SOURCE_ITCH_IO_API_KEY", "k");
        assert_eq!(Config::source_api_key("itch-io").as_deref(), Some("k"));
        std::env::remove_var("SOURCE_ITCH_IO_API_KEY");
        assert_eq!(Config::source_api_key("itch-io"), None);
    }
}
