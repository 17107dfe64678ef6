//! Configuration for the connection manager.
//!
//! Values can be deserialized from a TOML file; every field has a default so
//! a partial (or absent) file works. The demo binary layers CLI overrides on
//! top, with CLI taking precedence.

use serde::Deserialize;

/// Tunables for a [`Manager`](crate::Manager).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backlog passed to `listen(2)` for every listener.
    pub backlog_depth: i32,
    /// Initial size of each connection's input buffer; also the read chunk
    /// size.
    pub buffer_start_size: usize,
    /// Number of worker threads. `0` selects the available parallelism.
    pub worker_count: usize,
    /// Emit verbose connection-manager tracing.
    pub debug_conmgr: bool,
    /// Enable TCP keepalive on non-listen stream sockets.
    pub keep_alive: bool,
    /// Log level used when `RUST_LOG` is not set.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backlog_depth: default_backlog_depth(),
            buffer_start_size: default_buffer_start_size(),
            worker_count: 0,
            debug_conmgr: false,
            keep_alive: true,
            log_level: default_log_level(),
        }
    }
}

fn default_backlog_depth() -> i32 {
    4096
}

fn default_buffer_start_size() -> usize {
    4096
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Resolve `worker_count`, mapping `0` to the available parallelism.
    pub fn effective_workers(&self) -> usize {
        if self.worker_count > 0 {
            return self.worker_count;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.backlog_depth, 4096);
        assert_eq!(config.buffer_start_size, 4096);
        assert_eq!(config.worker_count, 0);
        assert!(!config.debug_conmgr);
        assert!(config.keep_alive);
        assert_eq!(config.log_level, "info");
        assert!(config.effective_workers() >= 1);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            backlog_depth = 128
            buffer_start_size = 16384
            worker_count = 4
            debug_conmgr = true
            keep_alive = false
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.backlog_depth, 128);
        assert_eq!(config.buffer_start_size, 16384);
        assert_eq!(config.worker_count, 4);
        assert!(config.debug_conmgr);
        assert!(!config.keep_alive);
        // unset fields keep their defaults
        assert_eq!(config.log_level, "info");
        assert_eq!(config.effective_workers(), 4);
    }

    #[test]
    fn test_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.buffer_start_size, 4096);
    }
}
