use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Engine-wide configuration, loadable from `~/.config/falcon/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum concurrently active download tasks; further jobs wait.
    pub max_concurrent_tasks: usize,
    /// Global speed limit in bytes/second across all tasks (0 = unlimited).
    pub global_speed_limit: u64,
    /// Event poll timeout in milliseconds (upper bound on loop latency).
    pub poll_timeout_ms: u64,
    /// Buffer single-stream writes in memory before hitting disk.
    pub enable_disk_cache: bool,
    /// Write buffer size per task in bytes.
    pub disk_cache_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            global_speed_limit: 0,
            poll_timeout_ms: 100,
            enable_disk_cache: true,
            disk_cache_size: 4 * 1024 * 1024,
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("falcon")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<EngineConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = EngineConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: EngineConfig = toml::from_str(&data)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_concurrent_tasks, 5);
        assert_eq!(cfg.global_speed_limit, 0);
        assert_eq!(cfg.poll_timeout_ms, 100);
        assert!(cfg.enable_disk_cache);
        assert_eq!(cfg.disk_cache_size, 4 * 1024 * 1024);
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = EngineConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: EngineConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.max_concurrent_tasks, cfg.max_concurrent_tasks);
        assert_eq!(parsed.poll_timeout_ms, cfg.poll_timeout_ms);
    }

    #[test]
    fn config_toml_custom_values() {
        let toml = r#"
            max_concurrent_tasks = 2
            global_speed_limit = 1048576
            poll_timeout_ms = 50
            enable_disk_cache = false
            disk_cache_size = 65536
        "#;
        let cfg: EngineConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.max_concurrent_tasks, 2);
        assert_eq!(cfg.global_speed_limit, 1_048_576);
        assert_eq!(cfg.poll_timeout_ms, 50);
        assert!(!cfg.enable_disk_cache);
    }
}
