//! Error types for the proxy engine

use std::io;
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for proxy engine operations
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// Certificate error
  #[error("Certificate error: {0}")]
  Certificate(String),

  /// TLS error
  #[error("TLS error: {0}")]
  Tls(String),

  /// HTTP construction error
  #[error("HTTP error: {0}")]
  Http(http::Error),

  /// Proxy error
  #[error("Proxy error: {0}")]
  Proxy(String),

  /// Invalid request on the wire
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// Upstream connection error
  #[error("Connection error: {0}")]
  Connection(String),

  /// Flow definition or execution error
  #[error("Flow error: {0}")]
  Flow(String),

  /// Component resolution or execution error
  #[error("Component error: {0}")]
  Component(String),

  /// Script compile or runtime error
  #[error("Script error: {0}")]
  Script(String),

  /// Store error
  #[error("Store error: {0}")]
  Store(String),

  /// Configuration error
  #[error("Config error: {0}")]
  Config(String),

  /// Other errors
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("Certificate error: {}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls(msg: impl Into<String>) -> Self {
    let error = Error::Tls(msg.into());
    tracing::error!("TLS error: {}", error);
    error
  }

  /// Create a proxy error and log it
  pub fn proxy(msg: impl Into<String>) -> Self {
    let error = Error::Proxy(msg.into());
    tracing::error!("Proxy error: {}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::error!("Invalid request: {}", error);
    error
  }

  /// Create a connection error and log it
  pub fn connection(msg: impl Into<String>) -> Self {
    let error = Error::Connection(msg.into());
    tracing::error!("Connection error: {}", error);
    error
  }

  /// Create a flow error and log it
  pub fn flow(msg: impl Into<String>) -> Self {
    let error = Error::Flow(msg.into());
    tracing::error!("Flow error: {}", error);
    error
  }

  /// Create a component error and log it
  pub fn component(msg: impl Into<String>) -> Self {
    let error = Error::Component(msg.into());
    tracing::error!("Component error: {}", error);
    error
  }

  /// Create a script error without logging; script failures are reported
  /// through the execution log of the flow that ran them
  pub fn script(msg: impl Into<String>) -> Self {
    Error::Script(msg.into())
  }

  /// Create a store error and log it
  pub fn store(msg: impl Into<String>) -> Self {
    let error = Error::Store(msg.into());
    tracing::error!("Store error: {}", error);
    error
  }

  /// Create a config error and log it
  pub fn config(msg: impl Into<String>) -> Self {
    let error = Error::Config(msg.into());
    tracing::error!("Config error: {}", error);
    error
  }

  /// Create an other error and log it
  pub fn other(msg: impl Into<String>) -> Self {
    let error = Error::Other(msg.into());
    tracing::error!("Error: {}", error);
    error
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    Error::Io(value)
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    let error = Error::Http(value);
    tracing::error!("HTTP error: {}", error);
    error
  }
}
