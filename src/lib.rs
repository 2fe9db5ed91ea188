//! # wiretap
//!
//! An interactive HTTP/HTTPS debugging proxy engine. `wiretap` captures,
//! inspects and programmatically modifies traffic between a client and
//! arbitrary upstream servers:
//!
//! - CONNECT tunnels upgrade to opaque splices, or detour through on-demand
//!   MITM endpoints backed by a dynamic certificate authority
//! - a flow pipeline matches requests to user-authored graphs of components
//!   and conditions that rewrite, delay, tag or short-circuit them
//! - user scripts run against a tiny sandboxed language with no ambient
//!   access to the host
//! - every transaction lands in a bounded recorder, queryable by id, method,
//!   host or URL
//!
//! # Example
//!
//! ```no_run
//! use wiretap::{EngineConfig, Wiretap};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let data_dir = std::path::PathBuf::from(".wiretap");
//!   let proxy = Wiretap::new(data_dir, EngineConfig::default()).await?;
//!   let addr = proxy.start().await?;
//!   println!("intercepting on {}", addr);
//!   tokio::signal::ctrl_c().await?;
//!   proxy.stop().await;
//!   Ok(())
//! }
//! ```

mod ca;
mod component;
mod config;
mod error;
mod flow;
mod message;
mod proxy;
mod recorder;
mod script;
mod server;
mod system;
mod wire;

pub use ca::{CaStatus, CertificateAuthority, CertificateManager, TrustStatus};
pub use component::{
  builtin_definitions, Builtin, ComponentContext, ComponentDefinition, ComponentKind,
  ComponentResult, LogSink, ParamSpec, ParamType,
};
pub use config::{app_data_dir, cert_dir, EngineConfig};
pub use error::{Error, Result};
pub use flow::{
  glob_match, ComponentStore, DebugRun, FlowDefinition, FlowEdge, FlowEngine, FlowNode,
  FlowOutcome, FlowStore, MatchRule, TerminatorMode,
};
pub use message::{is_textual, HttpRequest, HttpResponse};
pub use proxy::Wiretap;
pub use recorder::{RecordQuery, Recorder, RequestRecord};
pub use script::{eval_condition, execute as execute_script, ScriptOutcome};
pub use server::ProxyServer;
pub use system::{NoopSystemIntegration, SystemIntegration, SystemProxyState, TrustInstallOutcome};
