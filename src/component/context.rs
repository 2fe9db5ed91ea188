//! Execution context shared by builtin handlers and scripts

use crate::message::{HttpRequest, HttpResponse};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};

/// Destination for component log lines.
///
/// Live executions feed the process log; debug runs capture into an array
/// returned with the result.
#[derive(Clone)]
pub enum LogSink {
  /// Forward to the global tracing subscriber
  Tracing,
  /// Collect into a shared buffer
  Capture(Arc<Mutex<Vec<String>>>),
}

impl LogSink {
  /// A capturing sink plus a handle to read what it collected
  pub fn capture() -> (Self, Arc<Mutex<Vec<String>>>) {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    (Self::Capture(buffer.clone()), buffer)
  }

  /// Append a line
  pub fn log(&self, line: impl Into<String>) {
    let line = line.into();
    match self {
      Self::Tracing => tracing::info!(target: "wiretap::flow", "{}", line),
      Self::Capture(buffer) => buffer.lock().expect("log buffer").push(line),
    }
  }

  /// Append many lines
  pub fn extend(&self, lines: impl IntoIterator<Item = String>) {
    for line in lines {
      self.log(line);
    }
  }
}

/// Live state of one flow execution
pub struct ComponentContext {
  /// The request as mutated so far
  pub request: HttpRequest,
  /// Response installed by a component, if any
  pub response: Option<HttpResponse>,
  /// Free-form variable bag scoped to this execution
  pub vars: Map<String, Value>,
  /// Log sink for this execution
  pub log: LogSink,
}

impl ComponentContext {
  /// Start a context from a request clone
  pub fn new(request: HttpRequest, log: LogSink) -> Self {
    Self {
      request,
      response: None,
      vars: Map::new(),
      log,
    }
  }

  /// Deep-copy JSON projection handed to scripts and the debug runner
  pub fn to_json(&self) -> Value {
    json!({
      "request": self.request.to_json(),
      "response": self.response.as_ref().map(|r| r.to_json()),
      "vars": Value::Object(self.vars.clone()),
    })
  }

  /// Merge a component result into the live context: a replacement request
  /// takes over, a produced response installs, variable updates layer over
  /// existing vars
  pub fn merge(&mut self, result: &ComponentResult) {
    if let Some(request) = &result.request {
      self.request = request.clone();
    }
    if let Some(response) = &result.response {
      self.response = Some(response.clone());
    }
    for (key, value) in &result.vars {
      self.vars.insert(key.clone(), value.clone());
    }
  }
}

/// What a component produced; any subset of the fields may be set
#[derive(Default)]
pub struct ComponentResult {
  /// Replacement for the live request
  pub request: Option<HttpRequest>,
  /// Synthesized response
  pub response: Option<HttpResponse>,
  /// Variable updates, merged over the existing bag
  pub vars: Map<String, Value>,
  /// Stop walking the flow after this component
  pub terminate: bool,
}

impl ComponentResult {
  /// A result that changes nothing
  pub fn empty() -> Self {
    Self::default()
  }

  /// A replacement request only
  pub fn with_request(request: HttpRequest) -> Self {
    Self {
      request: Some(request),
      ..Default::default()
    }
  }

  /// A synthesized response that also terminates the flow
  pub fn terminating_response(response: HttpResponse) -> Self {
    Self {
      response: Some(response),
      terminate: true,
      ..Default::default()
    }
  }
}
