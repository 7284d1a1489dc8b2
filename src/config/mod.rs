//! Typed, layered configuration.
//!
//! Priority, lowest to highest: built-in defaults, an optional TOML file at
//! `{data_dir}/config.toml`, environment variables, CLI flags. This mirrors
//! the daemon's historical `DaemonConfig::new` layering — only the field set
//! has changed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Secrets and credentials the upstream client consumes.
///
/// `Debug` is implemented by hand so these never leak into a log line.
#[derive(Clone, Default)]
pub struct Secrets {
    pub upstream_api_key: Option<String>,
    pub upstream_service_account_path: Option<PathBuf>,
    pub webhook_secret: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("upstream_api_key", &self.upstream_api_key.as_ref().map(|_| "***"))
            .field(
                "upstream_service_account_path",
                &self.upstream_service_account_path,
            )
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => bail!("invalid log format {other:?}, expected \"pretty\" or \"json\""),
        }
    }
}

/// Fully resolved, validated process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    pub data_dir: PathBuf,

    pub upstream_base_url: String,
    pub secrets: Secrets,

    /// Absent ⇒ in-memory persistence profile.
    pub persistence_url: Option<String>,

    pub cors_allowed_origins: HashSet<String>,

    pub log_level: String,
    pub log_format: LogFormat,
    pub log_file: Option<PathBuf>,

    pub rate_limit_window_secs: u64,
    pub rate_limit_max: u64,

    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_open_secs: u64,

    pub cache_capacity: usize,
    pub cache_ttl_secs: u64,

    pub queue_max_retained: usize,
    pub template_cap: usize,
    pub batch_hard_cap: usize,

    pub webhook_monitored_services: HashSet<String>,
    pub webhook_auto_fix_enabled: bool,
    pub webhook_remediation_retention_secs: u64,

    /// Redacts `Internal` error messages in the HTTP error envelope when set.
    pub production: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 8080,
            data_dir: default_data_dir(),
            upstream_base_url: String::new(),
            secrets: Secrets::default(),
            persistence_url: None,
            cors_allowed_origins: HashSet::new(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            log_file: None,
            rate_limit_window_secs: 60,
            rate_limit_max: 100,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_open_secs: 60,
            cache_capacity: 100,
            cache_ttl_secs: 10,
            queue_max_retained: 100,
            template_cap: 100,
            batch_hard_cap: 8,
            webhook_monitored_services: HashSet::new(),
            webhook_auto_fix_enabled: false,
            webhook_remediation_retention_secs: 24 * 60 * 60,
            production: false,
        }
    }
}

/// CLI surface, layered over env vars via `clap`'s `env` attribute, then
/// over defaults/TOML. See [`Config::load`] for the full layering order.
#[derive(clap::Parser, Debug)]
#[command(name = "mcp-gateway", about = "MCP tool gateway and session orchestrator")]
pub struct Args {
    #[arg(long, env = "GATEWAY_HOST")]
    pub host: Option<String>,

    #[arg(long, env = "GATEWAY_PORT")]
    pub port: Option<u16>,

    #[arg(long, env = "GATEWAY_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, env = "GATEWAY_UPSTREAM_URL")]
    pub upstream_url: Option<String>,

    #[arg(long, env = "GATEWAY_UPSTREAM_API_KEY")]
    pub upstream_api_key: Option<String>,

    #[arg(long, env = "GATEWAY_UPSTREAM_SERVICE_ACCOUNT")]
    pub upstream_service_account: Option<PathBuf>,

    #[arg(long, env = "GATEWAY_WEBHOOK_SECRET")]
    pub webhook_secret: Option<String>,

    #[arg(long, env = "GATEWAY_PERSISTENCE_URL")]
    pub persistence_url: Option<String>,

    #[arg(long, env = "GATEWAY_CORS_ORIGINS")]
    pub cors_origins: Option<String>,

    #[arg(long, env = "GATEWAY_LOG_LEVEL")]
    pub log_level: Option<String>,

    #[arg(long, env = "GATEWAY_LOG_FORMAT")]
    pub log_format: Option<String>,

    #[arg(long, env = "GATEWAY_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    #[arg(long, env = "GATEWAY_WEBHOOK_MONITORED_SERVICES")]
    pub webhook_monitored_services: Option<String>,

    #[arg(long, env = "GATEWAY_WEBHOOK_AUTO_FIX")]
    pub webhook_auto_fix_enabled: Option<bool>,

    #[arg(long, env = "GATEWAY_WEBHOOK_REMEDIATION_RETENTION_SECS")]
    pub webhook_remediation_retention_secs: Option<u64>,

    #[arg(long, env = "GATEWAY_PRODUCTION")]
    pub production: Option<bool>,
}

/// On-disk TOML layer. Every field is optional — absence falls through to
/// the next-lower-priority layer.
#[derive(Debug, Default, Deserialize)]
struct TomlConfig {
    host: Option<String>,
    port: Option<u16>,
    upstream_url: Option<String>,
    upstream_api_key: Option<String>,
    upstream_service_account: Option<PathBuf>,
    webhook_secret: Option<String>,
    persistence_url: Option<String>,
    cors_origins: Option<String>,
    log_level: Option<String>,
    log_format: Option<String>,
    rate_limit_window_secs: Option<u64>,
    rate_limit_max: Option<u64>,
    circuit_breaker_failure_threshold: Option<u32>,
    circuit_breaker_open_secs: Option<u64>,
    cache_capacity: Option<usize>,
    cache_ttl_secs: Option<u64>,
    queue_max_retained: Option<usize>,
    template_cap: Option<usize>,
    batch_hard_cap: Option<usize>,
    webhook_monitored_services: Option<String>,
    webhook_auto_fix_enabled: Option<bool>,
    webhook_remediation_retention_secs: Option<u64>,
    production: Option<bool>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            tracing::warn!(path = %path.display(), err = %e, "ignoring malformed config.toml");
            None
        }
    }
}

impl Config {
    /// Layer defaults → TOML file → environment (already folded into `Args`
    /// via `clap`'s `env` attribute) → CLI flags, then validate once.
    pub fn load(args: Args) -> Result<Self> {
        let mut cfg = Config::default();

        if let Some(dir) = &args.data_dir {
            cfg.data_dir = dir.clone();
        }

        if let Some(toml_cfg) = load_toml(&cfg.data_dir) {
            apply_toml(&mut cfg, toml_cfg);
        }

        apply_args(&mut cfg, args);

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.listen_port == 0 {
            bail!("listen port must be nonzero");
        }
        if self.upstream_base_url.trim().is_empty() {
            bail!("upstream base URL must not be empty");
        }
        for origin in &self.cors_allowed_origins {
            if reqwest::Url::parse(origin).is_err() {
                bail!("invalid CORS origin {origin:?}, expected a full origin URL");
            }
        }
        if self.rate_limit_window_secs == 0 || self.rate_limit_max == 0 {
            bail!("rate limit window/cap must be positive");
        }
        if self.circuit_breaker_failure_threshold == 0 || self.circuit_breaker_open_secs == 0 {
            bail!("circuit breaker threshold/timeout must be positive");
        }
        if self.cache_capacity == 0 {
            bail!("cache capacity must be positive");
        }
        Ok(())
    }
}

fn apply_toml(cfg: &mut Config, t: TomlConfig) {
    if let Some(v) = t.host {
        cfg.listen_host = v;
    }
    if let Some(v) = t.port {
        cfg.listen_port = v;
    }
    if let Some(v) = t.upstream_url {
        cfg.upstream_base_url = v;
    }
    if let Some(v) = t.upstream_api_key {
        cfg.secrets.upstream_api_key = Some(v);
    }
    if let Some(v) = t.upstream_service_account {
        cfg.secrets.upstream_service_account_path = Some(v);
    }
    if let Some(v) = t.webhook_secret {
        cfg.secrets.webhook_secret = Some(v);
    }
    if let Some(v) = t.persistence_url {
        cfg.persistence_url = Some(v);
    }
    if let Some(v) = t.cors_origins {
        cfg.cors_allowed_origins = parse_origins(&v);
    }
    if let Some(v) = t.log_level {
        cfg.log_level = v;
    }
    if let Some(v) = t.log_format {
        if let Ok(fmt) = v.parse() {
            cfg.log_format = fmt;
        }
    }
    if let Some(v) = t.rate_limit_window_secs {
        cfg.rate_limit_window_secs = v;
    }
    if let Some(v) = t.rate_limit_max {
        cfg.rate_limit_max = v;
    }
    if let Some(v) = t.circuit_breaker_failure_threshold {
        cfg.circuit_breaker_failure_threshold = v;
    }
    if let Some(v) = t.circuit_breaker_open_secs {
        cfg.circuit_breaker_open_secs = v;
    }
    if let Some(v) = t.cache_capacity {
        cfg.cache_capacity = v;
    }
    if let Some(v) = t.cache_ttl_secs {
        cfg.cache_ttl_secs = v;
    }
    if let Some(v) = t.queue_max_retained {
        cfg.queue_max_retained = v;
    }
    if let Some(v) = t.template_cap {
        cfg.template_cap = v;
    }
    if let Some(v) = t.batch_hard_cap {
        cfg.batch_hard_cap = v;
    }
    if let Some(v) = t.webhook_monitored_services {
        cfg.webhook_monitored_services = parse_origins(&v);
    }
    if let Some(v) = t.webhook_auto_fix_enabled {
        cfg.webhook_auto_fix_enabled = v;
    }
    if let Some(v) = t.webhook_remediation_retention_secs {
        cfg.webhook_remediation_retention_secs = v;
    }
    if let Some(v) = t.production {
        cfg.production = v;
    }
}

fn apply_args(cfg: &mut Config, a: Args) {
    if let Some(v) = a.host {
        cfg.listen_host = v;
    }
    if let Some(v) = a.port {
        cfg.listen_port = v;
    }
    if let Some(v) = a.upstream_url {
        cfg.upstream_base_url = v;
    }
    if let Some(v) = a.upstream_api_key {
        cfg.secrets.upstream_api_key = Some(v);
    }
    if let Some(v) = a.upstream_service_account {
        cfg.secrets.upstream_service_account_path = Some(v);
    }
    if let Some(v) = a.webhook_secret {
        cfg.secrets.webhook_secret = Some(v);
    }
    if let Some(v) = a.persistence_url {
        cfg.persistence_url = Some(v);
    }
    if let Some(v) = a.cors_origins {
        cfg.cors_allowed_origins = parse_origins(&v);
    }
    if let Some(v) = a.log_level {
        cfg.log_level = v;
    }
    if let Some(v) = a.log_format {
        if let Ok(fmt) = v.parse() {
            cfg.log_format = fmt;
        }
    }
    if let Some(v) = a.log_file {
        cfg.log_file = Some(v);
    }
    if let Some(v) = a.webhook_monitored_services {
        cfg.webhook_monitored_services = parse_origins(&v);
    }
    if let Some(v) = a.webhook_auto_fix_enabled {
        cfg.webhook_auto_fix_enabled = v;
    }
    if let Some(v) = a.webhook_remediation_retention_secs {
        cfg.webhook_remediation_retention_secs = v;
    }
    if let Some(v) = a.production {
        cfg.production = v;
    }
}

fn parse_origins(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Platform default data directory, matching the teacher's layout
/// (`~/Library/Application Support/<app>` on macOS,
/// `$XDG_DATA_HOME/<app>` or `~/.local/share/<app>` on Linux,
/// `%APPDATA%\<app>` on Windows).
pub fn default_data_dir() -> PathBuf {
    const APP: &str = "mcp-gateway";

    #[cfg(target_os = "macos")]
    {
        dirs_home()
            .map(|h| h.join("Library/Application Support").join(APP))
            .unwrap_or_else(|| PathBuf::from(APP))
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(|d| PathBuf::from(d).join(APP))
            .unwrap_or_else(|| PathBuf::from(APP))
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| dirs_home().map(|h| h.join(".local/share")))
            .map(|d| d.join(APP))
            .unwrap_or_else(|| PathBuf::from(APP))
    }
}

#[allow(dead_code)]
fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Load the config from process CLI args (used by `main`).
pub fn load_from_env() -> Result<Config> {
    use clap::Parser;
    let args = Args::parse();
    Config::load(args).context("loading configuration")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            host: None,
            port: None,
            data_dir: None,
            upstream_url: Some("https://upstream.example".to_string()),
            upstream_api_key: None,
            upstream_service_account: None,
            webhook_secret: None,
            persistence_url: None,
            cors_origins: None,
            log_level: None,
            log_format: None,
            log_file: None,
            webhook_monitored_services: None,
            webhook_auto_fix_enabled: None,
            webhook_remediation_retention_secs: None,
            production: None,
        }
    }

    #[test]
    fn defaults_validate_once_upstream_url_is_set() {
        let cfg = Config::load(base_args()).unwrap();
        assert_eq!(cfg.listen_port, 8080);
        assert_eq!(cfg.rate_limit_max, 100);
    }

    #[test]
    fn empty_upstream_url_fails_validation() {
        let mut args = base_args();
        args.upstream_url = None;
        let err = Config::load(args).unwrap_err();
        assert!(err.to_string().contains("upstream"));
    }

    #[test]
    fn cli_flags_win_over_defaults() {
        let mut args = base_args();
        args.port = Some(9999);
        let cfg = Config::load(args).unwrap();
        assert_eq!(cfg.listen_port, 9999);
    }

    #[test]
    fn cors_origins_parsed_into_set() {
        let mut args = base_args();
        args.cors_origins = Some("https://a.example, https://b.example".to_string());
        let cfg = Config::load(args).unwrap();
        assert!(cfg.cors_allowed_origins.contains("https://a.example"));
        assert!(cfg.cors_allowed_origins.contains("https://b.example"));
    }

    #[test]
    fn secrets_debug_redacts_values() {
        let secrets = Secrets {
            upstream_api_key: Some("sk-super-secret".to_string()),
            upstream_service_account_path: None,
            webhook_secret: Some("whsec-xyz".to_string()),
        };
        let rendered = format!("{secrets:?}");
        assert!(!rendered.contains("sk-super-secret"));
        assert!(!rendered.contains("whsec-xyz"));
    }
}
