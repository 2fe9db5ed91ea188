//! Engine configuration document

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Recognized configuration options.
///
/// Stored as a JSON document in the application data directory; unknown keys
/// are ignored and a document that fails to parse falls back to defaults.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
  /// Listener port, valid range 1024..65535
  #[serde(default = "default_proxy_port")]
  pub proxy_port: u16,
  /// Recorder capacity
  #[serde(default = "default_max_request_records")]
  pub max_request_records: usize,
  /// Diagnostic verbosity, a tracing filter directive
  #[serde(default = "default_log_level")]
  pub log_level: String,
  /// Route CONNECTs through MITM instead of raw tunnels
  #[serde(default = "default_true")]
  pub https_mitm_enabled: bool,
  /// Drive the OS system proxy to point at this engine
  #[serde(default)]
  pub system_proxy_enabled: bool,
}

fn default_proxy_port() -> u16 {
  8888
}

fn default_max_request_records() -> usize {
  crate::recorder::DEFAULT_CAPACITY
}

fn default_log_level() -> String {
  "info".to_string()
}

fn default_true() -> bool {
  true
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      proxy_port: default_proxy_port(),
      max_request_records: default_max_request_records(),
      log_level: default_log_level(),
      https_mitm_enabled: true,
      system_proxy_enabled: false,
    }
  }
}

impl EngineConfig {
  /// Load from a JSON document, falling back to defaults when the file is
  /// missing or malformed
  pub fn load(path: &Path) -> Self {
    if !path.exists() {
      return Self::default();
    }
    match std::fs::read_to_string(path) {
      Ok(content) => match serde_json::from_str::<EngineConfig>(&content) {
        Ok(config) => config.validated(),
        Err(e) => {
          tracing::warn!("failed to parse {:?}, using defaults: {}", path, e);
          Self::default()
        }
      },
      Err(e) => {
        tracing::warn!("failed to read {:?}, using defaults: {}", path, e);
        Self::default()
      }
    }
  }

  /// Persist as pretty-printed JSON
  pub fn save(&self, path: &Path) -> crate::Result<()> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| crate::Error::config(format!("failed to create {:?}: {}", parent, e)))?;
    }
    let json = serde_json::to_string_pretty(self)
      .map_err(|e| crate::Error::config(format!("failed to serialize config: {}", e)))?;
    std::fs::write(path, json)
      .map_err(|e| crate::Error::config(format!("failed to write {:?}: {}", path, e)))?;
    Ok(())
  }

  /// Clamp out-of-range values back to defaults
  fn validated(mut self) -> Self {
    if self.proxy_port < 1024 {
      tracing::warn!("proxyPort {} below 1024, using default", self.proxy_port);
      self.proxy_port = default_proxy_port();
    }
    if self.max_request_records == 0 {
      self.max_request_records = default_max_request_records();
    }
    self
  }
}

/// Resolve the application data directory, creating it if needed
pub fn app_data_dir() -> crate::Result<PathBuf> {
  let base = if let Ok(home) = std::env::var("HOME") {
    PathBuf::from(home).join(".wiretap")
  } else {
    std::env::current_dir()
      .map_err(|e| crate::Error::config(format!("no working directory: {}", e)))?
      .join(".wiretap")
  };
  if !base.exists() {
    std::fs::create_dir_all(&base)
      .map_err(|e| crate::Error::config(format!("failed to create {:?}: {}", base, e)))?;
  }
  Ok(base)
}

/// Certs directory under the application data directory
pub fn cert_dir(root: &Path) -> PathBuf {
  root.join("certs")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_match_contract() {
    let config = EngineConfig::default();
    assert_eq!(config.proxy_port, 8888);
    assert_eq!(config.max_request_records, 2000);
    assert_eq!(config.log_level, "info");
    assert!(config.https_mitm_enabled);
    assert!(!config.system_proxy_enabled);
  }

  #[test]
  fn load_falls_back_on_malformed_document() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, "{not json").unwrap();
    let config = EngineConfig::load(&path);
    assert_eq!(config.proxy_port, 8888);
  }

  #[test]
  fn save_and_reload_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    let mut config = EngineConfig::default();
    config.proxy_port = 9999;
    config.https_mitm_enabled = false;
    config.save(&path).unwrap();

    let loaded = EngineConfig::load(&path);
    assert_eq!(loaded.proxy_port, 9999);
    assert!(!loaded.https_mitm_enabled);
  }

  #[test]
  fn out_of_range_port_resets_to_default() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{"proxyPort": 80}"#).unwrap();
    let config = EngineConfig::load(&path);
    assert_eq!(config.proxy_port, 8888);
  }
}
