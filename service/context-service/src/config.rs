//! Service configuration: one immutable value, loaded at startup from the
//! YAML file and overridden by environment variables, then passed explicitly
//! to the components that need it.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ServiceError;

pub const DEFAULT_PORT: u16 = 5173;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    /// Ingest worker pool size; 0 means "use the CPU count".
    pub workers: usize,
    pub vectors: VectorConfig,
    pub rerank: bool,
    pub mmr_lambda: f32,
    pub watch: WatchConfig,
    /// Days a soft-deleted document survives before GC removes it.
    pub retention_days: u32,
    pub queue_soft_cap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    /// `flat` (exact) or `hnsw` (approximate).
    pub backend: String,
    pub dimension: usize,
    /// Sidecar directory for the rebuildable index cache. Defaults to
    /// `<db_path>.vectors`.
    pub sidecar_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub enabled: bool,
    pub debounce_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            workers: 0,
            vectors: VectorConfig::default(),
            rerank: true,
            mmr_lambda: 0.5,
            watch: WatchConfig::default(),
            retention_days: 30,
            queue_soft_cap: 1024,
        }
    }
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            backend: "flat".to_string(),
            dimension: embedding_provider::config::HASHED_DEFAULTS.dimension,
            sidecar_dir: None,
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { enabled: true, debounce_ms: 500 }
    }
}

impl ServiceConfig {
    /// Load `~/.config/context-cache/config.yaml` when present, then apply
    /// `CTXC_DB_PATH`, `CTXC_HOST` and `CTXC_WORKERS`.
    pub fn load() -> Result<Self, ServiceError> {
        let mut cfg = match config_file_path() {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(&path)?;
                serde_yaml::from_str(&raw).map_err(|e| {
                    ServiceError::Config(format!("{}: {e}", path.display()))
                })?
            }
            _ => ServiceConfig::default(),
        };
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("CTXC_DB_PATH") {
            if !path.is_empty() {
                self.db_path = PathBuf::from(path);
            }
        }
        if let Ok(host) = std::env::var("CTXC_HOST") {
            if !host.is_empty() {
                // `host` or `host:port`.
                match host.rsplit_once(':') {
                    Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty() => {
                        self.host = h.to_string();
                        self.port = p.parse().unwrap_or(self.port);
                    }
                    _ => self.host = host,
                }
            }
        }
        if let Ok(workers) = std::env::var("CTXC_WORKERS") {
            if let Ok(n) = workers.parse() {
                self.workers = n;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ServiceError> {
        if !(0.0..=1.0).contains(&self.mmr_lambda) {
            return Err(ServiceError::Config(format!(
                "mmr_lambda must be within 0..1, got {}",
                self.mmr_lambda
            )));
        }
        if self.vectors.dimension == 0 {
            return Err(ServiceError::Config("vectors.dimension must be non-zero".into()));
        }
        match self.vectors.backend.as_str() {
            "flat" | "hnsw" => Ok(()),
            other => Err(ServiceError::Config(format!("unknown vector backend `{other}`"))),
        }
    }

    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2)
    }

    pub fn sidecar_dir(&self) -> PathBuf {
        match &self.vectors.sidecar_dir {
            Some(d) => d.clone(),
            None => {
                let mut s = self.db_path.as_os_str().to_os_string();
                s.push(".vectors");
                PathBuf::from(s)
            }
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".context-cache").join("cc.db"))
        .unwrap_or_else(|| PathBuf::from(".context-cache/cc.db"))
}

fn config_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("context-cache").join("config.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = ServiceConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.port, 5173);
        assert_eq!(cfg.watch.debounce_ms, 500);
        assert!(cfg.effective_workers() >= 1);
    }

    #[test]
    fn yaml_overrides_defaults() {
        let cfg: ServiceConfig = serde_yaml::from_str(
            "db_path: /tmp/x.db\nmmr_lambda: 0.3\nvectors:\n  backend: hnsw\n",
        )
        .expect("parse");
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(cfg.mmr_lambda, 0.3);
        assert_eq!(cfg.vectors.backend, "hnsw");
        // Untouched keys keep their defaults.
        assert_eq!(cfg.port, 5173);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn bad_lambda_is_rejected() {
        let mut cfg = ServiceConfig::default();
        cfg.mmr_lambda = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn sidecar_defaults_next_to_the_db() {
        let mut cfg = ServiceConfig::default();
        cfg.db_path = PathBuf::from("/data/cc.db");
        assert_eq!(cfg.sidecar_dir(), PathBuf::from("/data/cc.db.vectors"));
    }
}
