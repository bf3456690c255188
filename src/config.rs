use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the synchronizer process
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Route resolution and synchronization settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Docker daemon connection
    #[serde(default)]
    pub docker: DockerConfig,

    /// Routing-table store connection
    #[serde(default)]
    pub store: StoreConfig,

    /// Optional admin HTTP API
    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Suffix appended to prefix-derived virtual hosts
    #[serde(default = "default_vhost")]
    pub default_vhost: String,

    /// Port used when a slot declares none (default: 80)
    #[serde(default = "default_port")]
    pub default_port: u16,

    /// Wait after store mutations before signaling completion
    #[serde(default = "default_settle_interval")]
    pub settle_interval_ms: u64,

    /// Balance every running container once at startup
    #[serde(default = "default_true")]
    pub sync_on_start: bool,

    /// Serialize balance/unbalance per container id
    #[serde(default = "default_true")]
    pub serialize_per_container: bool,

    /// Environment-variable naming scheme
    #[serde(default)]
    pub env: EnvScheme,
}

impl SyncConfig {
    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_vhost: default_vhost(),
            default_port: default_port(),
            settle_interval_ms: default_settle_interval(),
            sync_on_start: true,
            serialize_per_container: true,
            env: EnvScheme::default(),
        }
    }
}

/// Names of the environment variables a container uses to declare routes.
///
/// Slot `i > 0` appends `{divisor}{i}` to each base name; custom keys are
/// `{custom_prefix}{divisor}{base}` with the same slot suffix.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct EnvScheme {
    #[serde(default = "default_env_hostname")]
    pub hostname: String,

    #[serde(default = "default_env_port")]
    pub port: String,

    #[serde(default = "default_env_prefix")]
    pub prefix: String,

    #[serde(default = "default_env_custom_prefix")]
    pub custom_prefix: String,

    #[serde(default = "default_env_divisor")]
    pub divisor: String,

    /// Highest slot index considered (inclusive)
    #[serde(default = "default_max_slots")]
    pub max_slots: u32,
}

impl Default for EnvScheme {
    fn default() -> Self {
        Self {
            hostname: default_env_hostname(),
            port: default_env_port(),
            prefix: default_env_prefix(),
            custom_prefix: default_env_custom_prefix(),
            divisor: default_env_divisor(),
            max_slots: default_max_slots(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DockerConfig {
    /// Docker host URL (default: DOCKER_HOST, then common socket paths)
    pub host: Option<String>,
}

/// Which routing-table store implementation to use
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Hipache-compatible Redis lists (default)
    #[default]
    Redis,
    /// Process-local store, for dry runs
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,

    /// Redis URL, `tcp://host:port` or `redis://host:port`
    pub url: Option<String>,

    /// Password sent with AUTH after connecting
    pub password: Option<String>,

    /// Database index sent with SELECT after connecting
    pub database: Option<u32>,

    /// Scheme prepended to backend addresses (hipache expects URLs)
    #[serde(default = "default_backend_scheme")]
    pub backend_scheme: String,
}

impl StoreConfig {
    /// Resolve the store URL.
    ///
    /// Priority: explicit `url`, then the linked-container variable
    /// `REDIS_PORT_6379`, then `REDIS_URL`, then `tcp://redis:6379`.
    pub fn resolve_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        std::env::var("REDIS_PORT_6379")
            .or_else(|_| std::env::var("REDIS_URL"))
            .unwrap_or_else(|_| default_store_url())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            url: None,
            password: None,
            database: None,
            backend_scheme: default_backend_scheme(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdminConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_admin_bind")]
    pub bind: String,

    #[serde(default = "default_admin_port")]
    pub port: u16,

    /// Bearer token for /routes and /sync. Generated at startup if not set
    pub token: Option<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_admin_bind(),
            port: default_admin_port(),
            token: None,
        }
    }
}

// Default value functions
fn default_vhost() -> String {
    "dev.docker-hipache.io".to_string()
}

fn default_port() -> u16 {
    80
}

fn default_settle_interval() -> u64 {
    100 // store consumers pick up changes asynchronously
}

fn default_true() -> bool {
    true
}

fn default_env_hostname() -> String {
    "VHOST".to_string()
}

fn default_env_port() -> String {
    "VHOST_PORT".to_string()
}

fn default_env_prefix() -> String {
    "VHOST_PREFIX".to_string()
}

fn default_env_custom_prefix() -> String {
    "ENV".to_string()
}

fn default_env_divisor() -> String {
    "_".to_string()
}

fn default_max_slots() -> u32 {
    10
}

fn default_store_url() -> String {
    "tcp://redis:6379".to_string()
}

fn default_backend_scheme() -> String {
    "http".to_string()
}

fn default_admin_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    9999
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.sync.default_vhost.is_empty() {
            errors.push("sync.default_vhost must not be empty".to_string());
        }
        if self.sync.default_port == 0 {
            errors.push("sync.default_port must be greater than 0".to_string());
        }

        let env = &self.sync.env;
        for (name, value) in [
            ("hostname", &env.hostname),
            ("port", &env.port),
            ("prefix", &env.prefix),
            ("custom_prefix", &env.custom_prefix),
            ("divisor", &env.divisor),
        ] {
            if value.is_empty() {
                errors.push(format!("sync.env.{} must not be empty", name));
            }
        }

        if self.store.kind == StoreKind::Redis {
            if let Some(url) = &self.store.url {
                if !(url.starts_with("tcp://") || url.starts_with("redis://")) {
                    errors.push(format!(
                        "store.url '{}' must start with tcp:// or redis://",
                        url
                    ));
                }
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[sync]
default_vhost = "apps.example.com"
default_port = 8080
settle_interval_ms = 250

[sync.env]
hostname = "ROUTE_HOST"
max_slots = 3

[docker]
host = "unix:///run/docker.sock"

[store]
url = "redis://10.0.0.5:6380"
database = 2

[admin]
enabled = true
port = 9100
token = "secret"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.sync.default_vhost, "apps.example.com");
        assert_eq!(config.sync.default_port, 8080);
        assert_eq!(config.sync.settle_interval(), Duration::from_millis(250));
        assert_eq!(config.sync.env.hostname, "ROUTE_HOST");
        assert_eq!(config.sync.env.port, "VHOST_PORT");
        assert_eq!(config.sync.env.max_slots, 3);
        assert_eq!(config.docker.host.as_deref(), Some("unix:///run/docker.sock"));
        assert_eq!(config.store.resolve_url(), "redis://10.0.0.5:6380");
        assert_eq!(config.store.database, Some(2));
        assert!(config.admin.enabled);
        assert_eq!(config.admin.port, 9100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.sync.default_vhost, "dev.docker-hipache.io");
        assert_eq!(config.sync.default_port, 80);
        assert_eq!(config.sync.settle_interval_ms, 100);
        assert!(config.sync.sync_on_start);
        assert!(config.sync.serialize_per_container);
        assert_eq!(config.sync.env, EnvScheme::default());
        assert_eq!(config.store.kind, StoreKind::Redis);
        assert_eq!(config.store.backend_scheme, "http");
        assert!(!config.admin.enabled);
        assert_eq!(config.admin.bind, "127.0.0.1");
    }

    #[test]
    fn test_default_env_scheme() {
        let env = EnvScheme::default();
        assert_eq!(env.hostname, "VHOST");
        assert_eq!(env.port, "VHOST_PORT");
        assert_eq!(env.prefix, "VHOST_PREFIX");
        assert_eq!(env.custom_prefix, "ENV");
        assert_eq!(env.divisor, "_");
        assert_eq!(env.max_slots, 10);
    }

    #[test]
    fn test_memory_store_kind() {
        let config: Config = toml::from_str(
            r#"
[store]
kind = "memory"
url = "whatever"
"#,
        )
        .unwrap();
        assert_eq!(config.store.kind, StoreKind::Memory);
        // URL is irrelevant for the memory store
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_multiple_errors() {
        let mut config = Config::default();
        config.sync.default_port = 0;
        config.sync.env.divisor = String::new();
        config.store.url = Some("http://redis:6379".to_string());

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("sync.default_port"));
        assert!(err.contains("sync.env.divisor"));
        assert!(err.contains("store.url"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sync]\ndefault_port = 3000").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.sync.default_port, 3000);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sync]\ndefault_vhost = \"\"").unwrap();

        assert!(Config::load(file.path()).is_err());
    }
}
