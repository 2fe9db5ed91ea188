//! Application root: wires the authority, stores, pipeline and engine
//! together and owns their lifetimes

use crate::ca::{CaStatus, CertificateManager};
use crate::config::{self, EngineConfig};
use crate::error::Result;
use crate::flow::{ComponentStore, DebugRun, FlowEngine, FlowStore};
use crate::message::HttpRequest;
use crate::recorder::Recorder;
use crate::server::ProxyServer;
use crate::system::{NoopSystemIntegration, SystemIntegration};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// The assembled debugging proxy
pub struct Wiretap {
  config: EngineConfig,
  ca: Arc<CertificateManager>,
  flows: Arc<FlowStore>,
  components: Arc<ComponentStore>,
  flow_engine: Arc<FlowEngine>,
  recorder: Arc<Recorder>,
  server: ProxyServer,
  system: Arc<dyn SystemIntegration>,
}

impl Wiretap {
  /// Build everything under the given data directory
  pub async fn new(data_dir: PathBuf, config: EngineConfig) -> Result<Self> {
    let ca = Arc::new(CertificateManager::new(config::cert_dir(&data_dir)).await?);
    let flows = Arc::new(FlowStore::load(&data_dir));
    let components = Arc::new(ComponentStore::load(&data_dir));
    let flow_engine = Arc::new(FlowEngine::new(flows.clone(), components.clone()));
    let recorder = Arc::new(Recorder::new(config.max_request_records));
    let server = ProxyServer::new(
      ca.clone(),
      flow_engine.clone(),
      recorder.clone(),
      config.https_mitm_enabled,
    );
    Ok(Self {
      config,
      ca,
      flows,
      components,
      flow_engine,
      recorder,
      server,
      system: Arc::new(NoopSystemIntegration),
    })
  }

  /// Swap in a real OS integration
  pub fn with_system_integration(mut self, system: Arc<dyn SystemIntegration>) -> Self {
    self.system = system;
    self
  }

  /// Start listening; drives the system proxy when configured to
  pub async fn start(&self) -> Result<SocketAddr> {
    let addr = self.server.start(self.config.proxy_port).await?;
    if self.config.system_proxy_enabled {
      if let Err(e) = self
        .system
        .apply_system_proxy(true, "127.0.0.1", addr.port())
        .await
      {
        tracing::warn!("failed to apply system proxy: {}", e);
      }
    }
    Ok(addr)
  }

  /// Aggressive stop, then release the system proxy if we claimed it
  pub async fn stop(&self) {
    let port = self.server.local_addr().map(|a| a.port());
    self.server.stop().await;
    if self.config.system_proxy_enabled {
      if let Some(port) = port {
        if let Err(e) = self.system.apply_system_proxy(false, "127.0.0.1", port).await {
          tracing::warn!("failed to release system proxy: {}", e);
        }
      }
    }
  }

  /// Listener address while running
  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.server.local_addr()
  }

  /// Runtime MITM toggle
  pub fn set_mitm_enabled(&self, enabled: bool) {
    self.server.set_mitm_enabled(enabled);
  }

  /// Current MITM routing decision for future CONNECTs
  pub fn mitm_enabled(&self) -> bool {
    self.server.mitm_enabled()
  }

  /// Run a specific flow against a supplied request without the network
  pub async fn debug_run(&self, flow_id: &str, request: HttpRequest) -> Result<DebugRun> {
    self.flow_engine.debug_run(flow_id, request).await
  }

  /// Certificate authority status with the trust probe
  pub async fn ca_status(&self) -> CaStatus {
    self.ca.status().await
  }

  /// The transaction recorder
  pub fn recorder(&self) -> &Arc<Recorder> {
    &self.recorder
  }

  /// The flow document store
  pub fn flows(&self) -> &Arc<FlowStore> {
    &self.flows
  }

  /// The component catalog
  pub fn components(&self) -> &Arc<ComponentStore> {
    &self.components
  }

  /// The certificate authority
  pub fn ca(&self) -> &Arc<CertificateManager> {
    &self.ca
  }

  /// The engine configuration this instance was built with
  pub fn config(&self) -> &EngineConfig {
    &self.config
  }
}
