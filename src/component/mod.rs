//! Component catalog: definitions, parameter schemas and dispatch
//!
//! A component is either a builtin handler keyed by a stable internal name,
//! or a user script. Both declare a parameter schema the dispatcher uses to
//! coerce the heterogeneous config map before execution.

mod builtins;
mod context;

pub use builtins::Builtin;
pub use context::{ComponentContext, ComponentResult, LogSink};

use crate::error::{Error, Result};
use crate::message::HttpResponse;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Declared type of one component parameter
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
  String,
  Number,
  Boolean,
  Json,
}

/// One entry of a parameter schema
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ParamSpec {
  pub name: String,
  #[serde(rename = "type")]
  pub param_type: ParamType,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub default: Option<Value>,
  #[serde(default)]
  pub required: bool,
  #[serde(default)]
  pub description: String,
}

impl ParamSpec {
  fn new(name: &str, param_type: ParamType, description: &str) -> Self {
    Self {
      name: name.to_string(),
      param_type,
      default: None,
      required: false,
      description: description.to_string(),
    }
  }

  fn required(mut self) -> Self {
    self.required = true;
    self
  }

  fn with_default(mut self, value: Value) -> Self {
    self.default = Some(value);
    self
  }
}

/// Builtin handler reference or user script source
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComponentKind {
  /// Stable internal name keyed to a handler
  Builtin { name: String },
  /// User-supplied script text
  Script { source: String },
}

/// A catalog entry
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDefinition {
  pub id: String,
  pub display_name: String,
  #[serde(flatten)]
  pub kind: ComponentKind,
  #[serde(default)]
  pub params: Vec<ParamSpec>,
}

impl ComponentDefinition {
  /// Whether this definition is a protected builtin
  pub fn is_builtin(&self) -> bool {
    matches!(self.kind, ComponentKind::Builtin { .. })
  }
}

/// Coerce a raw configuration map against a schema: defaults fill gaps,
/// required parameters must be present, and string values convert to the
/// declared number/boolean/json shape. Keys without a schema entry pass
/// through unchanged.
pub fn coerce_params(specs: &[ParamSpec], raw: &Map<String, Value>) -> Result<Map<String, Value>> {
  let mut coerced = raw.clone();
  for spec in specs {
    let value = match coerced.get(&spec.name) {
      Some(value) if !value.is_null() => value.clone(),
      _ => match &spec.default {
        Some(default) => default.clone(),
        None if spec.required => {
          return Err(Error::component(format!("missing required parameter {}", spec.name)))
        }
        None => continue,
      },
    };
    let value = coerce_value(&spec.name, spec.param_type, value)?;
    coerced.insert(spec.name.clone(), value);
  }
  Ok(coerced)
}

fn coerce_value(name: &str, param_type: ParamType, value: Value) -> Result<Value> {
  let fail = || Error::component(format!("parameter {} has the wrong type", name));
  match param_type {
    ParamType::String => Ok(match value {
      Value::String(_) => value,
      other => Value::String(other.to_string()),
    }),
    ParamType::Number => match &value {
      Value::Number(_) => Ok(value),
      Value::String(s) => s
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(fail),
      _ => Err(fail()),
    },
    ParamType::Boolean => match &value {
      Value::Bool(_) => Ok(value),
      Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(Value::Bool(true)),
        "false" | "0" | "no" => Ok(Value::Bool(false)),
        _ => Err(fail()),
      },
      _ => Err(fail()),
    },
    ParamType::Json => match &value {
      Value::String(s) => serde_json::from_str(s).map_err(|_| fail()),
      _ => Ok(value),
    },
  }
}

/// Convert the JSON value a script returned from `run(config, ctx)` into a
/// typed result. Unknown fields are ignored; a malformed request or
/// response patch fails the component.
pub fn result_from_script(value: &Value, ctx: &ComponentContext) -> Result<ComponentResult> {
  let mut result = ComponentResult::empty();
  if let Some(request_patch) = value.get("request") {
    if !request_patch.is_null() {
      let mut request = ctx.request.clone();
      request.apply_json(request_patch)?;
      result.request = Some(request);
    }
  }
  if let Some(response) = value.get("response") {
    if !response.is_null() {
      result.response = Some(HttpResponse::from_json(response)?);
    }
  }
  if let Some(Value::Object(vars)) = value.get("vars") {
    result.vars = vars.clone();
  }
  result.terminate = value
    .get("terminate")
    .map(crate::script::truthy)
    .unwrap_or(false);
  Ok(result)
}

/// Project a post-execution context snapshot (from a script without `run`)
/// into a result: request and response come back from the snapshot, vars
/// replace wholesale.
pub fn result_from_ctx_snapshot(snapshot: &Value, ctx: &ComponentContext) -> Result<ComponentResult> {
  let mut result = ComponentResult::empty();
  if let Some(request_json) = snapshot.get("request") {
    if request_json.is_object() {
      let mut request = ctx.request.clone();
      request.apply_json(request_json)?;
      result.request = Some(request);
    }
  }
  if let Some(response_json) = snapshot.get("response") {
    if response_json.is_object() {
      result.response = Some(HttpResponse::from_json(response_json)?);
    }
  }
  if let Some(Value::Object(vars)) = snapshot.get("vars") {
    result.vars = vars.clone();
  }
  Ok(result)
}

/// The canonical builtin catalog. Ids double as the stable internal handler
/// names; these definitions cannot be overwritten or deleted.
pub fn builtin_definitions() -> Vec<ComponentDefinition> {
  use ParamType::*;

  let def = |id: &str, display: &str, params: Vec<ParamSpec>| ComponentDefinition {
    id: id.to_string(),
    display_name: display.to_string(),
    kind: ComponentKind::Builtin { name: id.to_string() },
    params,
  };

  vec![
    def(
      "header-rewrite",
      "Header Rewrite",
      vec![
        ParamSpec::new("addHeaderName", String, "Header to set"),
        ParamSpec::new("addHeaderValue", String, "Value for the added header"),
        ParamSpec::new("removeHeaderNames", String, "Comma-separated headers to remove"),
      ],
    ),
    def(
      "mock-response",
      "Mock Response",
      vec![
        ParamSpec::new("statusCode", Number, "Response status code").with_default(Value::from(200)),
        ParamSpec::new("statusMessage", String, "Status reason phrase"),
        ParamSpec::new("contentType", String, "Content-Type header")
          .with_default(Value::from("text/plain")),
        ParamSpec::new("body", String, "Response body").with_default(Value::from("")),
        ParamSpec::new("headersJson", Json, "Extra headers as a JSON object"),
      ],
    ),
    def(
      "delay",
      "Delay",
      vec![ParamSpec::new("ms", Number, "Milliseconds to suspend the flow").required()],
    ),
    def(
      "url-host-rewrite",
      "URL Host Rewrite",
      vec![
        ParamSpec::new("targetHost", String, "Replacement host, optionally host:port").required(),
        ParamSpec::new("targetScheme", String, "Replacement scheme"),
        ParamSpec::new("preserveHostHeader", Boolean, "Keep the original Host header")
          .with_default(Value::Bool(false)),
      ],
    ),
    def(
      "url-query-params",
      "URL Query Params",
      vec![
        ParamSpec::new("addParamsJson", Json, "Params to add, as a JSON object"),
        ParamSpec::new("removeParamNames", String, "Comma-separated param names to remove"),
      ],
    ),
    def(
      "upstream-host",
      "Upstream Host",
      vec![
        ParamSpec::new("targetHost", String, "Upstream host, optionally host:port").required(),
        ParamSpec::new("targetScheme", String, "Upstream scheme").with_default(Value::from("http")),
      ],
    ),
    def(
      "json-body-modify",
      "JSON Body Modify",
      vec![
        ParamSpec::new("jsonPath", String, "Path like user.name or items[0].price").required(),
        ParamSpec::new("operation", String, "set, remove or append").required(),
        ParamSpec::new("valueJson", Json, "Value for set/append"),
      ],
    ),
    def(
      "response-override",
      "Response Override",
      vec![
        ParamSpec::new("statusCode", Number, "Response status code").with_default(Value::from(200)),
        ParamSpec::new("statusMessage", String, "Status reason phrase"),
        ParamSpec::new("contentType", String, "Content-Type header")
          .with_default(Value::from("text/plain")),
        ParamSpec::new("body", String, "Response body").with_default(Value::from("")),
      ],
    ),
    def(
      "header-copy",
      "Header Copy",
      vec![
        ParamSpec::new("sourceHeader", String, "Header to copy from").required(),
        ParamSpec::new("targetHeader", String, "Header to copy to").required(),
      ],
    ),
    def(
      "cookie-inject",
      "Cookie Inject",
      vec![
        ParamSpec::new("cookieName", String, "Cookie name").required(),
        ParamSpec::new("cookieValue", String, "Cookie value").required(),
      ],
    ),
    def(
      "auth-inject",
      "Auth Inject",
      vec![
        ParamSpec::new("scheme", String, "Authorization scheme").with_default(Value::from("Bearer")),
        ParamSpec::new("token", String, "Credential token").required(),
        ParamSpec::new("overrideExisting", Boolean, "Replace an existing Authorization header")
          .with_default(Value::Bool(true)),
      ],
    ),
    def(
      "bandwidth-throttle",
      "Bandwidth Throttle",
      vec![ParamSpec::new("delayMs", Number, "Milliseconds to suspend the flow").required()],
    ),
    def(
      "random-failure",
      "Random Failure",
      vec![
        ParamSpec::new("errorRate", Number, "Failure probability between 0 and 1").required(),
        ParamSpec::new("statusCode", Number, "Status for the synthesized error")
          .with_default(Value::from(500)),
        ParamSpec::new("body", String, "Body for the synthesized error")
          .with_default(Value::from("injected failure")),
      ],
    ),
    def(
      "retry-hint",
      "Retry Hint",
      vec![
        ParamSpec::new("maxRetries", Number, "Suggested retry count"),
        ParamSpec::new("retryDelayMs", Number, "Suggested delay between retries"),
        ParamSpec::new("retryOnStatusCodes", String, "Comma-separated status codes"),
      ],
    ),
    def(
      "cors-allow-all",
      "CORS Allow All",
      vec![
        ParamSpec::new("allowOrigins", String, "Access-Control-Allow-Origin value")
          .with_default(Value::from("*")),
        ParamSpec::new("allowMethods", String, "Access-Control-Allow-Methods value")
          .with_default(Value::from("GET, POST, PUT, PATCH, DELETE, OPTIONS")),
        ParamSpec::new("allowHeaders", String, "Access-Control-Allow-Headers value")
          .with_default(Value::from("*")),
      ],
    ),
    def(
      "static-local-file",
      "Static Local File",
      vec![
        ParamSpec::new("filePath", String, "File to serve as the response body").required(),
        ParamSpec::new("contentType", String, "Content-Type header")
          .with_default(Value::from("text/plain")),
      ],
    ),
    def(
      "log-message",
      "Log Message",
      vec![ParamSpec::new("message", String, "Line to append to the flow log").required()],
    ),
    def(
      "tag-request",
      "Tag Request",
      vec![
        ParamSpec::new("tagKey", String, "Tag name").required(),
        ParamSpec::new("tagValue", String, "Tag value").required(),
      ],
    ),
  ]
}
