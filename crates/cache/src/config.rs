//! Cache configuration: memory budget and disk cache location/size.
//!
//! Configuration can be loaded from a JSON file, environment variables,
//! or built programmatically.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const MB: usize = 1024 * 1024;

/// Configuration for the resource cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Ceiling in bytes for RAM + GPU memory held by live resources
    pub memory_budget: usize,
    /// Disk cache size limit in bytes
    pub disk_cache_size: usize,
    /// Directory for disk cache storage
    pub disk_cache_dir: PathBuf,
    /// When false every resource is fetched from the network
    pub disk_cache_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_budget: 512 * MB,
            disk_cache_size: 2048 * MB,
            disk_cache_dir: Self::default_cache_dir(),
            disk_cache_enabled: true,
        }
    }
}

impl CacheConfig {
    /// Creates a configuration with sizes in megabytes.
    pub fn new(memory_mb: usize, disk_mb: usize, disk_dir: PathBuf) -> Self {
        Self {
            memory_budget: memory_mb * MB,
            disk_cache_size: disk_mb * MB,
            disk_cache_dir: disk_dir,
            disk_cache_enabled: true,
        }
    }

    pub fn with_memory_budget_mb(mut self, mb: usize) -> Self {
        self.memory_budget = mb * MB;
        self
    }

    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = bytes;
        self
    }

    pub fn with_disk_mb(mut self, mb: usize) -> Self {
        self.disk_cache_size = mb * MB;
        self
    }

    pub fn with_disk_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.disk_cache_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn with_disk_cache_enabled(mut self, enabled: bool) -> Self {
        self.disk_cache_enabled = enabled;
        self
    }

    /// Returns the default cache directory for the current platform.
    ///
    /// - macOS: ~/Library/Caches/mapstream/resources
    /// - Linux: ~/.cache/mapstream/resources
    /// - Windows: %LOCALAPPDATA%\mapstream\resources
    pub fn default_cache_dir() -> PathBuf {
        if let Some(cache_dir) = dirs::cache_dir() {
            cache_dir.join("mapstream").join("resources")
        } else {
            PathBuf::from("cache/resources")
        }
    }

    /// Loads configuration from environment variables on top of the defaults.
    ///
    /// - `MAPSTREAM_MEMORY_BUDGET_MB`: memory budget in MB (default: 512)
    /// - `MAPSTREAM_DISK_CACHE_MB`: disk cache size in MB (default: 2048)
    /// - `MAPSTREAM_CACHE_DIR`: disk cache directory
    /// - `MAPSTREAM_DISK_CACHE`: `0`/`false` disables the disk cache
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("MAPSTREAM_MEMORY_BUDGET_MB") {
            config.memory_budget = parse_mb("MAPSTREAM_MEMORY_BUDGET_MB", &val)?;
        }

        if let Ok(val) = std::env::var("MAPSTREAM_DISK_CACHE_MB") {
            config.disk_cache_size = parse_mb("MAPSTREAM_DISK_CACHE_MB", &val)?;
        }

        if let Ok(val) = std::env::var("MAPSTREAM_CACHE_DIR") {
            config.disk_cache_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("MAPSTREAM_DISK_CACHE") {
            config.disk_cache_enabled = match val.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(ConfigError::InvalidValue("MAPSTREAM_DISK_CACHE".to_string())),
            };
        }

        Ok(config)
    }

    /// Loads configuration from a JSON file. Missing fields keep their defaults.
    ///
    /// ```json
    /// { "memory_budget": 536870912, "disk_cache_dir": "/var/cache/mapstream" }
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&contents)?)
    }

    /// Saves configuration as pretty-printed JSON.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(path.as_ref(), json)?;
        Ok(())
    }

    pub fn memory_budget_mb(&self) -> usize {
        self.memory_budget / MB
    }

    pub fn disk_cache_mb(&self) -> usize {
        self.disk_cache_size / MB
    }
}

fn parse_mb(name: &str, value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse::<usize>()
        .ok()
        .and_then(|mb| mb.checked_mul(MB))
        .ok_or_else(|| ConfigError::InvalidValue(name.to_string()))
}

/// Errors that can occur during configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for configuration key: {0}")]
    InvalidValue(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("configuration format error: {0}")]
    Format(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const ENV_VARS: [&str; 4] = [
        "MAPSTREAM_MEMORY_BUDGET_MB",
        "MAPSTREAM_DISK_CACHE_MB",
        "MAPSTREAM_CACHE_DIR",
        "MAPSTREAM_DISK_CACHE",
    ];

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.memory_budget, 512 * MB);
        assert_eq!(config.disk_cache_size, 2048 * MB);
        assert!(config.disk_cache_enabled);
    }

    #[test]
    fn test_builder_methods() {
        let config = CacheConfig::default()
            .with_memory_budget_mb(64)
            .with_disk_mb(128)
            .with_disk_dir("/custom/path")
            .with_disk_cache_enabled(false);

        assert_eq!(config.memory_budget_mb(), 64);
        assert_eq!(config.disk_cache_mb(), 128);
        assert_eq!(config.disk_cache_dir, PathBuf::from("/custom/path"));
        assert!(!config.disk_cache_enabled);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        let _guard = EnvGuard::new(&ENV_VARS);

        env::set_var("MAPSTREAM_MEMORY_BUDGET_MB", "128");
        env::set_var("MAPSTREAM_DISK_CACHE_MB", "256");
        env::set_var("MAPSTREAM_CACHE_DIR", "/tmp/test-cache");
        env::set_var("MAPSTREAM_DISK_CACHE", "off");

        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.memory_budget, 128 * MB);
        assert_eq!(config.disk_cache_size, 256 * MB);
        assert_eq!(config.disk_cache_dir, PathBuf::from("/tmp/test-cache"));
        assert!(!config.disk_cache_enabled);
    }

    #[test]
    #[serial]
    fn test_from_env_partial() {
        let _guard = EnvGuard::new(&ENV_VARS);

        for name in ENV_VARS {
            env::remove_var(name);
        }
        env::set_var("MAPSTREAM_MEMORY_BUDGET_MB", "32");

        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.memory_budget, 32 * MB);
        assert_eq!(config.disk_cache_size, 2048 * MB);
        assert!(config.disk_cache_enabled);
    }

    #[test]
    #[serial]
    fn test_from_env_invalid() {
        let _guard = EnvGuard::new(&ENV_VARS);

        env::set_var("MAPSTREAM_MEMORY_BUDGET_MB", "lots");
        assert!(matches!(
            CacheConfig::from_env(),
            Err(ConfigError::InvalidValue(key)) if key == "MAPSTREAM_MEMORY_BUDGET_MB"
        ));
    }

    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(var_names: &[&str]) -> Self {
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), env::var(name).ok()))
                .collect();
            Self { vars }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, r#"{ "memory_budget": 1048576 }"#).unwrap();

        let config = CacheConfig::from_file(&path).unwrap();
        assert_eq!(config.memory_budget, MB);
        assert_eq!(config.disk_cache_size, 2048 * MB);
    }

    #[test]
    fn test_file_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let config = CacheConfig::new(128, 256, PathBuf::from("/tmp/cache"));
        config.save_to_file(&path).unwrap();

        let loaded = CacheConfig::from_file(&path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, "memory_budget = 12").unwrap();

        assert!(matches!(CacheConfig::from_file(&path), Err(ConfigError::Format(_))));
    }
}
