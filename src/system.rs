//! OS integration seam
//!
//! System proxy mutation and trust-store installation are operating-system
//! procedures owned by an external collaborator. The engine only consumes
//! them through this capability trait; the default implementation does
//! nothing and says so.

use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;

/// Observed state of the OS system proxy setting
#[derive(Debug, Clone)]
pub struct SystemProxyState {
  /// Whether a system proxy is enabled at all
  pub enabled: bool,
  /// Whether it points at the expected host and port
  pub matches_expected: bool,
  /// Observed proxy host, when enabled
  pub host: Option<String>,
  /// Observed proxy port, when enabled
  pub port: Option<u16>,
  /// Where the answer came from (e.g. a settings scope or tool name)
  pub source: String,
  /// Raw tool output for diagnostics
  pub raw_output: String,
}

/// Result of a best-effort trust-store installation
#[derive(Debug, Clone)]
pub struct TrustInstallOutcome {
  pub success: bool,
  pub message: String,
}

/// Opaque capabilities the engine may invoke against the host OS
#[async_trait]
pub trait SystemIntegration: Send + Sync {
  /// Point the OS system proxy at (or away from) the engine
  async fn apply_system_proxy(&self, enable: bool, host: &str, port: u16) -> Result<()>;

  /// Inspect the current system proxy setting
  async fn detect_system_proxy(
    &self,
    expected_host: &str,
    expected_port: u16,
  ) -> Result<SystemProxyState>;

  /// Install the root CA into the OS trust store, best effort
  async fn install_root_ca(&self, cert_path: &Path) -> Result<TrustInstallOutcome>;
}

/// Default integration: every operation is a logged no-op
pub struct NoopSystemIntegration;

#[async_trait]
impl SystemIntegration for NoopSystemIntegration {
  async fn apply_system_proxy(&self, enable: bool, host: &str, port: u16) -> Result<()> {
    tracing::info!(
      "system proxy {} for {}:{} skipped (no OS integration configured)",
      if enable { "enable" } else { "disable" },
      host,
      port
    );
    Ok(())
  }

  async fn detect_system_proxy(
    &self,
    _expected_host: &str,
    _expected_port: u16,
  ) -> Result<SystemProxyState> {
    Ok(SystemProxyState {
      enabled: false,
      matches_expected: false,
      host: None,
      port: None,
      source: "noop".to_string(),
      raw_output: String::new(),
    })
  }

  async fn install_root_ca(&self, _cert_path: &Path) -> Result<TrustInstallOutcome> {
    Ok(TrustInstallOutcome {
      success: false,
      message: "no OS integration configured".to_string(),
    })
  }
}
