use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub cache_server: CacheServerConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub origin: OriginConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub populate: PopulateConfig,
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Socket address for the client-facing gateway (e.g. `0.0.0.0:1338`).
    #[serde(default = "default_gateway_listen")]
    pub listen: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_gateway_listen(),
        }
    }
}

fn default_gateway_listen() -> String {
    "0.0.0.0:1338".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheServerConfig {
    /// Socket address for the internal cache file server.
    #[serde(default = "default_cache_server_listen")]
    pub listen: String,
    /// Base URL the gateway forwards cache hits to.  Any path component is
    /// stripped by the cache file server before resolving files.
    #[serde(default = "default_cache_server_base_url")]
    pub base_url: String,
}

impl Default for CacheServerConfig {
    fn default() -> Self {
        Self {
            listen: default_cache_server_listen(),
            base_url: default_cache_server_base_url(),
        }
    }
}

fn default_cache_server_listen() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_cache_server_base_url() -> String {
    "http://localhost:3000".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    /// Socket address serving `/healthz` and `/metrics`.
    #[serde(default = "default_admin_listen")]
    pub listen: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: default_admin_listen(),
        }
    }
}

fn default_admin_listen() -> String {
    "127.0.0.1:9090".to_string()
}

// ---------------------------------------------------------------------------
// Origin registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct OriginConfig {
    /// Base URL of the upstream registry (e.g. `http://registry.npmjs.org`).
    #[serde(default = "default_origin_base_url")]
    pub base_url: String,
    /// User-Agent sent on populate fetches.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            base_url: default_origin_base_url(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_origin_base_url() -> String {
    "http://registry.npmjs.org".to_string()
}

fn default_user_agent() -> String {
    concat!("tarcache/", env!("CARGO_PKG_VERSION")).to_string()
}

// ---------------------------------------------------------------------------
// Cache store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Root directory holding cached archives.
    #[serde(default = "default_cache_path")]
    pub path: String,
    /// Request paths ending in one of these suffixes are treated as
    /// cacheable artifacts.
    #[serde(default = "default_archive_extensions")]
    pub archive_extensions: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            archive_extensions: default_archive_extensions(),
        }
    }
}

fn default_cache_path() -> String {
    "./cache".to_string()
}

fn default_archive_extensions() -> Vec<String> {
    vec![".tgz".to_string()]
}

// ---------------------------------------------------------------------------
// Background populate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PopulateConfig {
    /// Collapse concurrent misses for the same key into one origin fetch.
    #[serde(default = "bool_true")]
    pub single_flight: bool,
    /// Download into a temporary file and rename it into place on success.
    /// When disabled the destination is written directly and is visible
    /// (possibly empty or partial) from the moment it is created.
    #[serde(default = "bool_true")]
    pub atomic_publish: bool,
    /// Semaphore limit for concurrent populate fetches against the origin.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Overall deadline (seconds) for a single populate.  Unset means none.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// How long (seconds) shutdown waits for running populates before
    /// cancelling them.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for PopulateConfig {
    fn default() -> Self {
        Self {
            single_flight: true,
            atomic_publish: true,
            max_concurrent: default_max_concurrent(),
            timeout_secs: None,
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

fn bool_true() -> bool {
    true
}

fn default_max_concurrent() -> usize {
    16
}

fn default_shutdown_grace() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config = parse_config(&contents)
        .with_context(|| format!("failed to load config file: {}", path.display()))?;
    Ok(config)
}

/// Parse and validate a [`Config`] from YAML text.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("invalid YAML")?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    for (label, value) in [
        ("origin.base_url", &config.origin.base_url),
        ("cache_server.base_url", &config.cache_server.base_url),
    ] {
        let parsed =
            url::Url::parse(value).with_context(|| format!("{label} is not a valid URL"))?;
        anyhow::ensure!(
            matches!(parsed.scheme(), "http" | "https"),
            "{label} must use http or https"
        );
    }
    anyhow::ensure!(
        !config.cache.path.is_empty(),
        "cache.path must not be empty"
    );
    anyhow::ensure!(
        !config.cache.archive_extensions.is_empty(),
        "cache.archive_extensions must list at least one extension"
    );
    anyhow::ensure!(
        config
            .cache
            .archive_extensions
            .iter()
            .all(|ext| ext.len() > 1 && ext.starts_with('.')),
        "archive extensions must start with '.'"
    );
    anyhow::ensure!(
        config.populate.max_concurrent > 0,
        "populate.max_concurrent must be at least 1"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = parse_config("{}").unwrap();
        assert_eq!(config.gateway.listen, "0.0.0.0:1338");
        assert_eq!(config.cache_server.base_url, "http://localhost:3000");
        assert_eq!(config.origin.base_url, "http://registry.npmjs.org");
        assert_eq!(config.cache.path, "./cache");
        assert_eq!(config.cache.archive_extensions, vec![".tgz"]);
        assert!(config.populate.single_flight);
        assert!(config.populate.atomic_publish);
        assert_eq!(config.populate.timeout_secs, None);
    }

    #[test]
    fn partial_sections_keep_field_defaults() {
        let yaml = r#"
origin:
  base_url: "https://registry.example.com"
populate:
  single_flight: false
  timeout_secs: 120
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.origin.base_url, "https://registry.example.com");
        assert!(config.origin.user_agent.starts_with("tarcache/"));
        assert!(!config.populate.single_flight);
        assert!(config.populate.atomic_publish);
        assert_eq!(config.populate.timeout_secs, Some(120));
        assert_eq!(config.populate.max_concurrent, 16);
    }

    #[test]
    fn rejects_invalid_origin_url() {
        let err = parse_config("origin:\n  base_url: \"not a url\"\n").unwrap_err();
        assert!(format!("{err:#}").contains("origin.base_url"));
    }

    #[test]
    fn rejects_non_http_scheme() {
        assert!(parse_config("cache_server:\n  base_url: \"ftp://cache\"\n").is_err());
    }

    #[test]
    fn rejects_extension_without_dot() {
        assert!(parse_config("cache:\n  archive_extensions: [\"tgz\"]\n").is_err());
        assert!(parse_config("cache:\n  archive_extensions: []\n").is_err());
    }

    #[test]
    fn rejects_zero_concurrency() {
        assert!(parse_config("populate:\n  max_concurrent: 0\n").is_err());
    }

    #[test]
    fn load_config_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(dir.path().join("missing.yaml")).unwrap_err();
        assert!(format!("{err:#}").contains("failed to read config file"));
    }
}
