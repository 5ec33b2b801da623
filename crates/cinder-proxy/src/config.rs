//! Proxy configuration parsing.
//!
//! Configuration resolves in order: built-in defaults → TOML file →
//! environment variables → CLI flags. The TOML shape mirrors the
//! runtime structure: one `[[pools]]` entry per listening pool, each
//! with its cache backends (one connector group per backend), optional
//! hot-shard and full-database side groups, and rule-classifier table
//! lists.

use std::path::Path;

use cinder_core::HashKind;
use cinder_protocol::KeyType;
use serde::{Deserialize, Serialize};

/// Top-level proxy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Global concurrent-client ceiling across all pools.
    pub max_clients: usize,
    /// How often pool gauges are sampled, in seconds.
    pub stats_interval_secs: u64,
    pub pools: Vec<PoolConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_clients: 10_000,
            stats_interval_secs: 5,
            pools: vec![PoolConfig::default()],
        }
    }
}

/// One listening pool and its backend wiring.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    pub name: String,
    pub listen: String,
    /// Listen backlog.
    pub backlog: u32,
    /// Per-pool concurrent-client ceiling.
    pub max_clients: usize,
    /// Key digest function: "murmur" or "one-at-a-time".
    pub hash: String,
    /// Name of the key field extracted from statements.
    pub key_field: String,
    /// Schema type of the key field: "signed", "unsigned", "string",
    /// or "binary".
    pub key_type: String,
    /// End-to-end request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Helper connections per cache backend.
    pub helper_count: usize,
    /// Pending-job queue capacity per connector group.
    pub queue_capacity: usize,
    /// Cache-layer backends; the shard continuum is built over these.
    pub backends: Vec<BackendConfig>,
    /// Optional hot-shard database group.
    pub hot_backend: Option<SideBackendConfig>,
    /// Optional full-database group.
    pub full_backend: Option<SideBackendConfig>,
    /// Tables served by the cache layer.
    pub cacheable_tables: Vec<String>,
    /// Tables served by the hot shard.
    pub hot_tables: Vec<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "main".into(),
            listen: "127.0.0.1:3358".into(),
            backlog: 1024,
            max_clients: 4096,
            hash: "murmur".into(),
            key_field: "uid".into(),
            key_type: "unsigned".into(),
            timeout_ms: 3_000,
            helper_count: 4,
            queue_capacity: 1024,
            backends: vec![BackendConfig::default()],
            hot_backend: None,
            full_backend: None,
            cacheable_tables: Vec::new(),
            hot_tables: Vec::new(),
        }
    }
}

/// One cache backend: the target of one connector group.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    pub addr: String,
    /// Relative share of the hash space.
    pub weight: u32,
    /// Index of a sibling backend used as the fallback group when this
    /// one has no free helper.
    pub fallback: Option<usize>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:20015".into(),
            weight: 1,
            fallback: None,
        }
    }
}

/// A side group (hot shard or full database).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SideBackendConfig {
    pub addr: String,
    /// Helper connections; defaults to the pool's `helper_count`.
    pub helper_count: Option<usize>,
    /// Queue capacity; defaults to the pool's `queue_capacity`.
    pub queue_capacity: Option<usize>,
}

/// Loads and validates a configuration file.
pub fn load(path: &Path) -> Result<ProxyConfig, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read config '{}': {e}", path.display()))?;
    let cfg: ProxyConfig = toml::from_str(&raw)
        .map_err(|e| format!("failed to parse config '{}': {e}", path.display()))?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Checks cross-field constraints the type system can't express.
pub fn validate(cfg: &ProxyConfig) -> Result<(), String> {
    if cfg.pools.is_empty() {
        return Err("config defines no pools".into());
    }
    if cfg.max_clients == 0 {
        return Err("max_clients must be positive".into());
    }
    for pool in &cfg.pools {
        if pool.backends.is_empty() {
            return Err(format!("pool '{}' has no backends", pool.name));
        }
        if pool.helper_count == 0 {
            return Err(format!("pool '{}': helper_count must be positive", pool.name));
        }
        if pool.backends.iter().all(|b| b.weight == 0) {
            return Err(format!("pool '{}': all backend weights are zero", pool.name));
        }
        parse_hash_kind(&pool.hash).map_err(|e| format!("pool '{}': {e}", pool.name))?;
        parse_key_type(&pool.key_type).map_err(|e| format!("pool '{}': {e}", pool.name))?;
        for (i, b) in pool.backends.iter().enumerate() {
            if let Some(f) = b.fallback {
                if f >= pool.backends.len() {
                    return Err(format!(
                        "pool '{}': backend {i} fallback {f} out of range",
                        pool.name
                    ));
                }
                if f == i {
                    return Err(format!(
                        "pool '{}': backend {i} falls back to itself",
                        pool.name
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Parses a hash strategy name.
pub fn parse_hash_kind(input: &str) -> Result<HashKind, String> {
    match input.to_ascii_lowercase().as_str() {
        "murmur" => Ok(HashKind::Murmur),
        "one-at-a-time" | "one_at_a_time" => Ok(HashKind::OneAtATime),
        _ => Err(format!(
            "unknown hash '{input}'. valid options: murmur, one-at-a-time"
        )),
    }
}

/// Parses a key schema type name.
pub fn parse_key_type(input: &str) -> Result<KeyType, String> {
    match input.to_ascii_lowercase().as_str() {
        "signed" => Ok(KeyType::Signed),
        "unsigned" => Ok(KeyType::Unsigned),
        "string" => Ok(KeyType::String),
        "binary" => Ok(KeyType::Binary),
        _ => Err(format!(
            "unknown key type '{input}'. valid options: signed, unsigned, string, binary"
        )),
    }
}

/// Renders the default configuration as a TOML template.
pub fn template() -> String {
    toml::to_string_pretty(&ProxyConfig::default()).expect("default config serializes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        validate(&ProxyConfig::default()).unwrap();
    }

    #[test]
    fn template_round_trips() {
        let cfg: ProxyConfig = toml::from_str(&template()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.pools.len(), 1);
        assert_eq!(cfg.pools[0].key_field, "uid");
    }

    #[test]
    fn parse_full_config() {
        let cfg: ProxyConfig = toml::from_str(
            r#"
            max_clients = 100

            [[pools]]
            name = "cache"
            listen = "0.0.0.0:3358"
            hash = "one-at-a-time"
            key_field = "uid"
            key_type = "string"
            timeout_ms = 500
            cacheable_tables = ["users"]
            hot_tables = ["orders"]

            [[pools.backends]]
            addr = "127.0.0.1:20015"
            weight = 2
            fallback = 1

            [[pools.backends]]
            addr = "127.0.0.1:20016"

            [pools.hot_backend]
            addr = "127.0.0.1:3307"
            "#,
        )
        .unwrap();
        validate(&cfg).unwrap();

        let pool = &cfg.pools[0];
        assert_eq!(pool.backends.len(), 2);
        assert_eq!(pool.backends[0].weight, 2);
        assert_eq!(pool.backends[0].fallback, Some(1));
        assert_eq!(pool.backends[1].weight, 1);
        assert!(pool.hot_backend.is_some());
        assert!(pool.full_backend.is_none());
        assert_eq!(parse_hash_kind(&pool.hash).unwrap(), HashKind::OneAtATime);
        assert_eq!(parse_key_type(&pool.key_type).unwrap(), KeyType::String);
    }

    #[test]
    fn bad_fallback_rejected() {
        let mut cfg = ProxyConfig::default();
        cfg.pools[0].backends[0].fallback = Some(0);
        assert!(validate(&cfg).unwrap_err().contains("falls back to itself"));

        cfg.pools[0].backends[0].fallback = Some(9);
        assert!(validate(&cfg).unwrap_err().contains("out of range"));
    }

    #[test]
    fn bad_names_rejected() {
        let mut cfg = ProxyConfig::default();
        cfg.pools[0].hash = "crc32".into();
        assert!(validate(&cfg).is_err());

        let mut cfg = ProxyConfig::default();
        cfg.pools[0].key_type = "float64".into();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = load(Path::new("/nonexistent/cinder.toml")).unwrap_err();
        assert!(err.contains("failed to read config"));
    }

    #[test]
    fn load_parses_a_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cinder.toml");
        std::fs::write(&path, template()).unwrap();
        let cfg = load(&path).unwrap();
        assert_eq!(cfg.max_clients, 10_000);
    }
}
