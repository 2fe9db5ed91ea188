//! Built-in component handlers
//!
//! Every handler reads the live context, builds a `ComponentResult` and
//! leaves merging to the flow engine. Header operations go through the
//! case-insensitive header map on the request itself.

use super::context::{ComponentContext, ComponentResult};
use crate::error::{Error, Result};
use crate::message::HttpResponse;
use rand::Rng;
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Stable internal names mapped to handlers
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Builtin {
  HeaderRewrite,
  MockResponse,
  Delay,
  UrlHostRewrite,
  UrlQueryParams,
  UpstreamHost,
  JsonBodyModify,
  ResponseOverride,
  HeaderCopy,
  CookieInject,
  AuthInject,
  BandwidthThrottle,
  RandomFailure,
  RetryHint,
  CorsAllowAll,
  StaticLocalFile,
  LogMessage,
  TagRequest,
}

impl Builtin {
  /// Resolve a stable internal name
  pub fn from_name(name: &str) -> Option<Self> {
    Some(match name {
      "header-rewrite" => Self::HeaderRewrite,
      "mock-response" => Self::MockResponse,
      "delay" => Self::Delay,
      "url-host-rewrite" => Self::UrlHostRewrite,
      "url-query-params" => Self::UrlQueryParams,
      "upstream-host" => Self::UpstreamHost,
      "json-body-modify" => Self::JsonBodyModify,
      "response-override" => Self::ResponseOverride,
      "header-copy" => Self::HeaderCopy,
      "cookie-inject" => Self::CookieInject,
      "auth-inject" => Self::AuthInject,
      "bandwidth-throttle" => Self::BandwidthThrottle,
      "random-failure" => Self::RandomFailure,
      "retry-hint" => Self::RetryHint,
      "cors-allow-all" => Self::CorsAllowAll,
      "static-local-file" => Self::StaticLocalFile,
      "log-message" => Self::LogMessage,
      "tag-request" => Self::TagRequest,
      _ => return None,
    })
  }

  /// Execute the handler against the context with coerced parameters
  pub async fn execute(
    self,
    params: &Map<String, Value>,
    ctx: &ComponentContext,
  ) -> Result<ComponentResult> {
    let p = Params(params);
    match self {
      Self::HeaderRewrite => header_rewrite(&p, ctx),
      Self::MockResponse => mock_response(&p, true),
      Self::Delay => {
        let ms = p.number("ms").unwrap_or(0.0).max(0.0);
        tokio::time::sleep(Duration::from_millis(ms as u64)).await;
        Ok(ComponentResult::empty())
      }
      Self::UrlHostRewrite => {
        let scheme = p.str("targetScheme").map(str::to_string);
        host_rewrite(&p, ctx, scheme, p.boolean("preserveHostHeader").unwrap_or(false))
      }
      Self::UrlQueryParams => query_params(&p, ctx),
      Self::UpstreamHost => {
        let scheme = Some(p.str("targetScheme").unwrap_or("http").to_string());
        host_rewrite(&p, ctx, scheme, false)
      }
      Self::JsonBodyModify => json_body_modify(&p, ctx),
      Self::ResponseOverride => mock_response(&p, false),
      Self::HeaderCopy => header_copy(&p, ctx),
      Self::CookieInject => cookie_inject(&p, ctx),
      Self::AuthInject => auth_inject(&p, ctx),
      Self::BandwidthThrottle => {
        let ms = p.number("delayMs").unwrap_or(0.0).max(0.0);
        tokio::time::sleep(Duration::from_millis(ms as u64)).await;
        Ok(ComponentResult::empty())
      }
      Self::RandomFailure => random_failure(&p),
      Self::RetryHint => retry_hint(&p),
      Self::CorsAllowAll => cors_allow_all(&p, ctx),
      Self::StaticLocalFile => static_local_file(&p).await,
      Self::LogMessage => {
        ctx.log.log(p.str("message").unwrap_or_default());
        Ok(ComponentResult::empty())
      }
      Self::TagRequest => tag_request(&p, ctx),
    }
  }
}

struct Params<'a>(&'a Map<String, Value>);

impl<'a> Params<'a> {
  fn str(&self, name: &str) -> Option<&str> {
    self.0.get(name).and_then(Value::as_str)
  }

  fn number(&self, name: &str) -> Option<f64> {
    self.0.get(name).and_then(Value::as_f64)
  }

  fn boolean(&self, name: &str) -> Option<bool> {
    self.0.get(name).and_then(Value::as_bool)
  }

  fn json(&self, name: &str) -> Option<&Value> {
    self.0.get(name)
  }

  fn csv(&self, name: &str) -> Vec<String> {
    self
      .str(name)
      .map(|s| {
        s.split(',')
          .map(str::trim)
          .filter(|p| !p.is_empty())
          .map(str::to_string)
          .collect()
      })
      .unwrap_or_default()
  }
}

fn header_rewrite(p: &Params, ctx: &ComponentContext) -> Result<ComponentResult> {
  let mut request = ctx.request.clone();
  if let (Some(name), Some(value)) = (p.str("addHeaderName"), p.str("addHeaderValue")) {
    if !name.is_empty() {
      request.set_header(name, value);
    }
  }
  for name in p.csv("removeHeaderNames") {
    request.remove_header(&name);
  }
  Ok(ComponentResult::with_request(request))
}

/// Shared by mock-response and response-override; only the former honors
/// extra headers from `headersJson`
fn mock_response(p: &Params, with_extra_headers: bool) -> Result<ComponentResult> {
  let status = p.number("statusCode").unwrap_or(200.0) as u16;
  let mut response = HttpResponse::synthesized(
    status,
    p.str("statusMessage").filter(|s| !s.is_empty()),
    p.str("contentType").unwrap_or("text/plain"),
    p.str("body").unwrap_or_default(),
  );
  if with_extra_headers {
    if let Some(Value::Object(extra)) = p.json("headersJson") {
      for (name, value) in extra {
        let text = match value {
          Value::String(s) => s.clone(),
          other => other.to_string(),
        };
        response.set_header(name, &text);
      }
    }
  }
  Ok(ComponentResult::terminating_response(response))
}

fn host_rewrite(
  p: &Params,
  ctx: &ComponentContext,
  scheme: Option<String>,
  preserve_host_header: bool,
) -> Result<ComponentResult> {
  let target = p
    .str("targetHost")
    .ok_or_else(|| Error::component("targetHost is required"))?;
  let (host, port) = split_host_port(target);
  let scheme = scheme
    .filter(|s| !s.is_empty())
    .unwrap_or_else(|| ctx.request.url.scheme_str().unwrap_or("http").to_string());

  let mut request = ctx.request.clone();
  request.set_authority(&scheme, host, port)?;
  if !preserve_host_header {
    let host_value = match port {
      Some(port) => format!("{}:{}", host, port),
      None => host.to_string(),
    };
    request.set_header("host", &host_value);
  }
  Ok(ComponentResult::with_request(request))
}

fn query_params(p: &Params, ctx: &ComponentContext) -> Result<ComponentResult> {
  let mut request = ctx.request.clone();
  let mut pairs = request.query_pairs();

  let removed: Vec<String> = p.csv("removeParamNames");
  pairs.retain(|(name, _)| !removed.iter().any(|r| r == name));

  if let Some(Value::Object(add)) = p.json("addParamsJson") {
    for (name, value) in add {
      let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
      };
      pairs.push((name.clone(), text));
    }
  }

  request.set_query_pairs(&pairs)?;
  Ok(ComponentResult::with_request(request))
}

fn json_body_modify(p: &Params, ctx: &ComponentContext) -> Result<ComponentResult> {
  let content_type = ctx.request.header("content-type").unwrap_or_default();
  if !content_type.to_lowercase().contains("application/json") {
    return Ok(ComponentResult::empty());
  }
  let Some(body) = ctx.request.body.as_deref() else {
    return Ok(ComponentResult::empty());
  };

  let mut root: Value = serde_json::from_str(body)
    .map_err(|e| Error::component(format!("request body is not valid JSON: {}", e)))?;
  let path = parse_path(p.str("jsonPath").unwrap_or_default())?;
  let value = p.json("valueJson").cloned().unwrap_or(Value::Null);

  match p.str("operation").unwrap_or("set") {
    "set" => json_set(&mut root, &path, value)?,
    "remove" => json_remove(&mut root, &path)?,
    "append" => json_append(&mut root, &path, value)?,
    other => return Err(Error::component(format!("unknown operation {}", other))),
  }

  let mut request = ctx.request.clone();
  let serialized = serde_json::to_string(&root)
    .map_err(|e| Error::component(format!("failed to serialize body: {}", e)))?;
  request.set_header("content-length", &serialized.len().to_string());
  request.body = Some(serialized);
  Ok(ComponentResult::with_request(request))
}

fn header_copy(p: &Params, ctx: &ComponentContext) -> Result<ComponentResult> {
  let source = p
    .str("sourceHeader")
    .ok_or_else(|| Error::component("sourceHeader is required"))?;
  let target = p
    .str("targetHeader")
    .ok_or_else(|| Error::component("targetHeader is required"))?;
  match ctx.request.header(source) {
    Some(value) => {
      let mut request = ctx.request.clone();
      request.set_header(target, &value);
      Ok(ComponentResult::with_request(request))
    }
    None => Ok(ComponentResult::empty()),
  }
}

fn cookie_inject(p: &Params, ctx: &ComponentContext) -> Result<ComponentResult> {
  let name = p
    .str("cookieName")
    .ok_or_else(|| Error::component("cookieName is required"))?;
  let value = p.str("cookieValue").unwrap_or_default();

  // merge into the cookie jar, replacing an existing entry of the same name
  let mut jar: Vec<(String, String)> = ctx
    .request
    .header("cookie")
    .map(|header| {
      header
        .split(';')
        .filter_map(|pair| {
          let pair = pair.trim();
          if pair.is_empty() {
            return None;
          }
          let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
          Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
    })
    .unwrap_or_default();
  jar.retain(|(k, _)| k != name);
  jar.push((name.to_string(), value.to_string()));

  let header = jar
    .iter()
    .map(|(k, v)| format!("{}={}", k, v))
    .collect::<Vec<_>>()
    .join("; ");
  let mut request = ctx.request.clone();
  request.set_header("cookie", &header);
  Ok(ComponentResult::with_request(request))
}

fn auth_inject(p: &Params, ctx: &ComponentContext) -> Result<ComponentResult> {
  let token = p.str("token").ok_or_else(|| Error::component("token is required"))?;
  let scheme = p.str("scheme").unwrap_or("Bearer");
  let override_existing = p.boolean("overrideExisting").unwrap_or(true);

  if !override_existing && ctx.request.header("authorization").is_some() {
    return Ok(ComponentResult::empty());
  }
  let mut request = ctx.request.clone();
  request.set_header("authorization", &format!("{} {}", scheme, token));
  Ok(ComponentResult::with_request(request))
}

fn random_failure(p: &Params) -> Result<ComponentResult> {
  let rate = p.number("errorRate").unwrap_or(0.0).clamp(0.0, 1.0);
  if rand::thread_rng().gen::<f64>() >= rate {
    return Ok(ComponentResult::empty());
  }
  let status = p.number("statusCode").unwrap_or(500.0) as u16;
  let body = p.str("body").unwrap_or("injected failure");
  let response = HttpResponse::synthesized(status, None, "text/plain", body);
  Ok(ComponentResult::terminating_response(response))
}

fn retry_hint(p: &Params) -> Result<ComponentResult> {
  let codes: Vec<u64> = p
    .csv("retryOnStatusCodes")
    .iter()
    .filter_map(|c| c.parse().ok())
    .collect();
  let mut result = ComponentResult::empty();
  result.vars.insert(
    "retry".to_string(),
    json!({
      "maxRetries": p.number("maxRetries").unwrap_or(0.0) as u64,
      "retryDelayMs": p.number("retryDelayMs").unwrap_or(0.0) as u64,
      "retryOnStatusCodes": codes,
    }),
  );
  Ok(result)
}

fn cors_allow_all(p: &Params, ctx: &ComponentContext) -> Result<ComponentResult> {
  if ctx.request.method != http::Method::OPTIONS {
    return Ok(ComponentResult::empty());
  }
  let mut response = HttpResponse::new(http::StatusCode::NO_CONTENT);
  response.set_header("access-control-allow-origin", p.str("allowOrigins").unwrap_or("*"));
  response.set_header(
    "access-control-allow-methods",
    p.str("allowMethods").unwrap_or("GET, POST, PUT, PATCH, DELETE, OPTIONS"),
  );
  response.set_header("access-control-allow-headers", p.str("allowHeaders").unwrap_or("*"));
  response.set_header("content-length", "0");
  Ok(ComponentResult::terminating_response(response))
}

async fn static_local_file(p: &Params<'_>) -> Result<ComponentResult> {
  let path = p
    .str("filePath")
    .ok_or_else(|| Error::component("filePath is required"))?;
  let content_type = p.str("contentType").unwrap_or("text/plain");
  let response = match tokio::fs::read_to_string(path).await {
    Ok(content) => HttpResponse::synthesized(200, None, content_type, &content),
    Err(e) => HttpResponse::synthesized(
      500,
      None,
      "text/plain",
      &format!("failed to read {}: {}", path, e),
    ),
  };
  Ok(ComponentResult::terminating_response(response))
}

fn tag_request(p: &Params, ctx: &ComponentContext) -> Result<ComponentResult> {
  let key = p.str("tagKey").ok_or_else(|| Error::component("tagKey is required"))?;
  let value = p.str("tagValue").unwrap_or_default();

  let mut tags = ctx
    .vars
    .get("tags")
    .and_then(Value::as_object)
    .cloned()
    .unwrap_or_default();
  tags.insert(key.to_string(), Value::String(value.to_string()));

  let mut result = ComponentResult::empty();
  result.vars.insert("tags".to_string(), Value::Object(tags));
  Ok(result)
}

fn split_host_port(target: &str) -> (&str, Option<u16>) {
  match target.rsplit_once(':') {
    Some((host, port)) => match port.parse::<u16>() {
      Ok(port) => (host, Some(port)),
      Err(_) => (target, None),
    },
    None => (target, None),
  }
}

// ---- JSON path operations ----

/// One step of a JSON path
#[derive(Debug, PartialEq)]
pub enum PathSeg {
  Key(String),
  Index(usize),
}

/// Parse `seg(.seg|[idx])*`, e.g. `user.name` or `items[0].price`
pub fn parse_path(path: &str) -> Result<Vec<PathSeg>> {
  if path.is_empty() {
    return Err(Error::component("empty JSON path"));
  }
  let mut segments = Vec::new();
  for part in path.split('.') {
    let mut rest = part;
    // leading key before any [idx]
    let key_end = rest.find('[').unwrap_or(rest.len());
    let key = &rest[..key_end];
    if !key.is_empty() {
      segments.push(PathSeg::Key(key.to_string()));
    } else if key_end == 0 && segments.is_empty() && !rest.starts_with('[') {
      return Err(Error::component(format!("invalid JSON path: {}", path)));
    }
    rest = &rest[key_end..];
    while let Some(stripped) = rest.strip_prefix('[') {
      let close = stripped
        .find(']')
        .ok_or_else(|| Error::component(format!("invalid JSON path: {}", path)))?;
      let index = stripped[..close]
        .parse::<usize>()
        .map_err(|_| Error::component(format!("invalid index in JSON path: {}", path)))?;
      segments.push(PathSeg::Index(index));
      rest = &stripped[close + 1..];
    }
    if !rest.is_empty() {
      return Err(Error::component(format!("invalid JSON path: {}", path)));
    }
  }
  if segments.is_empty() {
    return Err(Error::component(format!("invalid JSON path: {}", path)));
  }
  Ok(segments)
}

/// Set the value at the path, creating missing intermediate objects
pub fn json_set(root: &mut Value, path: &[PathSeg], value: Value) -> Result<()> {
  let mut cursor = root;
  for (i, segment) in path.iter().enumerate() {
    let last = i == path.len() - 1;
    match segment {
      PathSeg::Key(key) => {
        if !cursor.is_object() {
          *cursor = Value::Object(Map::new());
        }
        let map = cursor.as_object_mut().expect("object");
        if last {
          map.insert(key.clone(), value);
          return Ok(());
        }
        cursor = map.entry(key.clone()).or_insert(Value::Null);
      }
      PathSeg::Index(index) => {
        let items = cursor
          .as_array_mut()
          .ok_or_else(|| Error::component("path indexes into a non-array"))?;
        if *index >= items.len() {
          return Err(Error::component("array index out of bounds"));
        }
        if last {
          items[*index] = value;
          return Ok(());
        }
        cursor = &mut items[*index];
      }
    }
  }
  unreachable!("path is never empty")
}

/// Remove the value at the path: deletes object keys, splices arrays
pub fn json_remove(root: &mut Value, path: &[PathSeg]) -> Result<()> {
  let (last, parents) = path.split_last().expect("path is never empty");
  let mut cursor = &mut *root;
  for segment in parents {
    cursor = match segment {
      PathSeg::Key(key) => cursor
        .get_mut(key.as_str())
        .ok_or_else(|| Error::component("path not found"))?,
      PathSeg::Index(index) => cursor
        .get_mut(*index)
        .ok_or_else(|| Error::component("path not found"))?,
    };
  }
  match last {
    PathSeg::Key(key) => {
      cursor
        .as_object_mut()
        .ok_or_else(|| Error::component("path removes from a non-object"))?
        .remove(key.as_str());
    }
    PathSeg::Index(index) => {
      let items = cursor
        .as_array_mut()
        .ok_or_else(|| Error::component("path removes from a non-array"))?;
      if *index < items.len() {
        items.remove(*index);
      }
    }
  }
  Ok(())
}

/// Append at the path. An existing array gains the value; a scalar is
/// coerced to a list first; a missing slot becomes a one-element list.
pub fn json_append(root: &mut Value, path: &[PathSeg], value: Value) -> Result<()> {
  let (last, parents) = path.split_last().expect("path is never empty");
  let mut cursor = &mut *root;
  for segment in parents {
    cursor = match segment {
      PathSeg::Key(key) => {
        if !cursor.is_object() {
          *cursor = Value::Object(Map::new());
        }
        cursor
          .as_object_mut()
          .expect("object")
          .entry(key.clone())
          .or_insert(Value::Null)
      }
      PathSeg::Index(index) => cursor
        .get_mut(*index)
        .ok_or_else(|| Error::component("path not found"))?,
    };
  }
  let mut slot = match last {
    PathSeg::Key(key) => {
      if !cursor.is_object() {
        *cursor = Value::Object(Map::new());
      }
      cursor
        .as_object_mut()
        .expect("object")
        .entry(key.clone())
        .or_insert(Value::Null)
    }
    PathSeg::Index(index) => cursor
      .get_mut(*index)
      .ok_or_else(|| Error::component("path not found"))?,
  };
  match slot {
    Value::Array(items) => items.push(value),
    Value::Null => *slot = Value::Array(vec![value]),
    ref mut scalar => {
      let existing = scalar.take();
      *slot = Value::Array(vec![existing, value]);
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::super::context::LogSink;
  use super::*;
  use http::{HeaderMap, Method};
  use serde_json::json;

  fn ctx_for(method: Method, url: &str) -> ComponentContext {
    let request = crate::message::HttpRequest::new(method, url.parse().unwrap(), HeaderMap::new());
    ComponentContext::new(request, LogSink::Tracing)
  }

  fn params(value: Value) -> Map<String, Value> {
    value.as_object().unwrap().clone()
  }

  #[tokio::test]
  async fn header_rewrite_add_then_remove_restores_pre_call_state() {
    let ctx = ctx_for(Method::GET, "http://example.test/");
    assert!(ctx.request.header("x-probe").is_none());

    let added = Builtin::HeaderRewrite
      .execute(
        &params(json!({"addHeaderName": "x-probe", "addHeaderValue": "1"})),
        &ctx,
      )
      .await
      .unwrap();
    let mut ctx2 = ctx_for(Method::GET, "http://example.test/");
    ctx2.merge(&added);
    assert_eq!(ctx2.request.header("x-probe").as_deref(), Some("1"));

    let removed = Builtin::HeaderRewrite
      .execute(&params(json!({"removeHeaderNames": "x-probe"})), &ctx2)
      .await
      .unwrap();
    ctx2.merge(&removed);
    assert!(ctx2.request.header("x-probe").is_none());
  }

  #[tokio::test]
  async fn mock_response_terminates_with_extra_headers() {
    let ctx = ctx_for(Method::POST, "http://api.test/v1/things");
    let result = Builtin::MockResponse
      .execute(
        &params(json!({
          "statusCode": 201.0,
          "contentType": "application/json",
          "body": "{\"ok\":true}",
          "headersJson": {"x-mock": "yes"},
        })),
        &ctx,
      )
      .await
      .unwrap();
    assert!(result.terminate);
    let response = result.response.unwrap();
    assert_eq!(response.status.as_u16(), 201);
    assert_eq!(response.header("x-mock").as_deref(), Some("yes"));
    assert_eq!(response.body.as_deref(), Some("{\"ok\":true}"));
  }

  #[tokio::test]
  async fn url_host_rewrite_updates_host_header_unless_preserved() {
    let mut ctx = ctx_for(Method::GET, "http://old.test/api?x=1");
    ctx.request.set_header("host", "old.test");

    let result = Builtin::UrlHostRewrite
      .execute(
        &params(json!({"targetHost": "new.test:9000", "targetScheme": "https"})),
        &ctx,
      )
      .await
      .unwrap();
    let request = result.request.unwrap();
    assert_eq!(request.url.to_string(), "https://new.test:9000/api?x=1");
    assert_eq!(request.header("host").as_deref(), Some("new.test:9000"));

    let preserved = Builtin::UrlHostRewrite
      .execute(
        &params(json!({"targetHost": "new.test", "preserveHostHeader": true})),
        &ctx,
      )
      .await
      .unwrap();
    let request = preserved.request.unwrap();
    assert_eq!(request.header("host").as_deref(), Some("old.test"));
    // scheme defaults to the current one
    assert_eq!(request.url.scheme_str(), Some("http"));
  }

  #[tokio::test]
  async fn upstream_host_defaults_to_http_and_rewrites_host() {
    let mut ctx = ctx_for(Method::GET, "https://prod.test/api");
    ctx.request.set_header("host", "prod.test");
    let result = Builtin::UpstreamHost
      .execute(&params(json!({"targetHost": "localhost:3000"})), &ctx)
      .await
      .unwrap();
    let request = result.request.unwrap();
    assert_eq!(request.url.to_string(), "http://localhost:3000/api");
    assert_eq!(request.header("host").as_deref(), Some("localhost:3000"));
  }

  #[tokio::test]
  async fn query_params_add_then_remove_round_trips() {
    let ctx = ctx_for(Method::GET, "http://example.test/s?keep=1");
    let added = Builtin::UrlQueryParams
      .execute(&params(json!({"addParamsJson": {"probe": "x"}})), &ctx)
      .await
      .unwrap();
    let mut ctx2 = ctx_for(Method::GET, "http://example.test/s?keep=1");
    ctx2.merge(&added);
    assert!(ctx2.request.url.query().unwrap().contains("probe=x"));

    let removed = Builtin::UrlQueryParams
      .execute(&params(json!({"removeParamNames": "probe"})), &ctx2)
      .await
      .unwrap();
    ctx2.merge(&removed);
    assert_eq!(ctx2.request.query_pairs(), vec![("keep".to_string(), "1".to_string())]);
  }

  #[tokio::test]
  async fn json_body_modify_set_twice_is_idempotent() {
    let mut ctx = ctx_for(Method::POST, "http://api.test/v1");
    ctx.request.set_header("content-type", "application/json");
    ctx.request.body = Some(r#"{"user":{"name":"a"},"items":[{"price":1}]}"#.to_string());

    let p = params(json!({"jsonPath": "items[0].price", "operation": "set", "valueJson": 9}));
    let once = Builtin::JsonBodyModify.execute(&p, &ctx).await.unwrap();
    ctx.merge(&once);
    let twice = Builtin::JsonBodyModify.execute(&p, &ctx).await.unwrap();
    ctx.merge(&twice);

    let body: Value = serde_json::from_str(ctx.request.body.as_deref().unwrap()).unwrap();
    assert_eq!(body["items"][0]["price"], json!(9));
    let len = ctx.request.header("content-length").unwrap();
    assert_eq!(len, ctx.request.body.as_deref().unwrap().len().to_string());
  }

  #[tokio::test]
  async fn json_body_modify_is_noop_for_non_json() {
    let mut ctx = ctx_for(Method::POST, "http://api.test/v1");
    ctx.request.set_header("content-type", "text/plain");
    ctx.request.body = Some("just text".to_string());
    let result = Builtin::JsonBodyModify
      .execute(&params(json!({"jsonPath": "a", "operation": "set", "valueJson": 1})), &ctx)
      .await
      .unwrap();
    assert!(result.request.is_none());
    assert!(result.response.is_none());
  }

  #[tokio::test]
  async fn cookie_inject_merges_the_jar() {
    let mut ctx = ctx_for(Method::GET, "http://example.test/");
    ctx.request.set_header("cookie", "a=1; b=2");
    let result = Builtin::CookieInject
      .execute(&params(json!({"cookieName": "b", "cookieValue": "9"})), &ctx)
      .await
      .unwrap();
    let request = result.request.unwrap();
    assert_eq!(request.header("cookie").as_deref(), Some("a=1; b=9"));
  }

  #[tokio::test]
  async fn auth_inject_respects_override_flag() {
    let mut ctx = ctx_for(Method::GET, "http://example.test/");
    ctx.request.set_header("authorization", "Basic old");

    let kept = Builtin::AuthInject
      .execute(
        &params(json!({"scheme": "Bearer", "token": "T", "overrideExisting": false})),
        &ctx,
      )
      .await
      .unwrap();
    assert!(kept.request.is_none());

    let replaced = Builtin::AuthInject
      .execute(&params(json!({"scheme": "Bearer", "token": "T"})), &ctx)
      .await
      .unwrap();
    assert_eq!(
      replaced.request.unwrap().header("authorization").as_deref(),
      Some("Bearer T")
    );
  }

  #[tokio::test]
  async fn random_failure_edges() {
    let ctx = ctx_for(Method::GET, "http://example.test/");
    for _ in 0..50 {
      let never = Builtin::RandomFailure
        .execute(&params(json!({"errorRate": 0.0})), &ctx)
        .await
        .unwrap();
      assert!(never.response.is_none());
      let always = Builtin::RandomFailure
        .execute(&params(json!({"errorRate": 1.0, "statusCode": 503.0})), &ctx)
        .await
        .unwrap();
      assert_eq!(always.response.unwrap().status.as_u16(), 503);
      assert!(always.terminate);
    }
  }

  #[tokio::test]
  async fn retry_hint_only_writes_vars() {
    let ctx = ctx_for(Method::GET, "http://example.test/");
    let result = Builtin::RetryHint
      .execute(
        &params(json!({
          "maxRetries": 3.0,
          "retryDelayMs": 100.0,
          "retryOnStatusCodes": "502, 503",
        })),
        &ctx,
      )
      .await
      .unwrap();
    assert!(result.request.is_none() && result.response.is_none() && !result.terminate);
    assert_eq!(result.vars["retry"]["maxRetries"], json!(3));
    assert_eq!(result.vars["retry"]["retryOnStatusCodes"], json!([502, 503]));
  }

  #[tokio::test]
  async fn cors_preflight_short_circuits_options_only() {
    let options = ctx_for(Method::OPTIONS, "http://api.test/v1");
    let result = Builtin::CorsAllowAll.execute(&Map::new(), &options).await.unwrap();
    assert!(result.terminate);
    let response = result.response.unwrap();
    assert_eq!(response.status.as_u16(), 204);
    assert_eq!(response.header("access-control-allow-origin").as_deref(), Some("*"));

    let get = ctx_for(Method::GET, "http://api.test/v1");
    let result = Builtin::CorsAllowAll.execute(&Map::new(), &get).await.unwrap();
    assert!(result.response.is_none());
  }

  #[tokio::test]
  async fn static_local_file_serves_content_or_500() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("payload.json");
    std::fs::write(&file, "{\"local\":true}").unwrap();
    let ctx = ctx_for(Method::GET, "http://example.test/");

    let ok = Builtin::StaticLocalFile
      .execute(
        &params(json!({
          "filePath": file.to_str().unwrap(),
          "contentType": "application/json",
        })),
        &ctx,
      )
      .await
      .unwrap();
    let response = ok.response.unwrap();
    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(response.body.as_deref(), Some("{\"local\":true}"));

    let missing = Builtin::StaticLocalFile
      .execute(&params(json!({"filePath": "/nonexistent/z"})), &ctx)
      .await
      .unwrap();
    assert_eq!(missing.response.unwrap().status.as_u16(), 500);
    assert!(missing.terminate);
  }

  #[tokio::test]
  async fn tag_request_accumulates_tags() {
    let mut ctx = ctx_for(Method::GET, "http://example.test/");
    let first = Builtin::TagRequest
      .execute(&params(json!({"tagKey": "env", "tagValue": "dev"})), &ctx)
      .await
      .unwrap();
    ctx.merge(&first);
    let second = Builtin::TagRequest
      .execute(&params(json!({"tagKey": "team", "tagValue": "core"})), &ctx)
      .await
      .unwrap();
    ctx.merge(&second);
    assert_eq!(ctx.vars["tags"], json!({"env": "dev", "team": "core"}));
  }

  #[test]
  fn path_parsing_and_ops() {
    assert_eq!(
      parse_path("user.name").unwrap(),
      vec![PathSeg::Key("user".into()), PathSeg::Key("name".into())]
    );
    assert_eq!(
      parse_path("items[0].price").unwrap(),
      vec![
        PathSeg::Key("items".into()),
        PathSeg::Index(0),
        PathSeg::Key("price".into())
      ]
    );
    assert!(parse_path("").is_err());
    assert!(parse_path("a[x]").is_err());

    // set creates missing intermediate objects
    let mut root = json!({});
    json_set(&mut root, &parse_path("a.b.c").unwrap(), json!(1)).unwrap();
    assert_eq!(root, json!({"a": {"b": {"c": 1}}}));

    // remove splices arrays and deletes keys
    let mut root = json!({"list": [1, 2, 3], "k": true});
    json_remove(&mut root, &parse_path("list[1]").unwrap()).unwrap();
    json_remove(&mut root, &parse_path("k").unwrap()).unwrap();
    assert_eq!(root, json!({"list": [1, 3]}));

    // append coerces a scalar to a list
    let mut root = json!({"v": "single"});
    json_append(&mut root, &parse_path("v").unwrap(), json!("more")).unwrap();
    assert_eq!(root, json!({"v": ["single", "more"]}));
    let mut root = json!({});
    json_append(&mut root, &parse_path("fresh").unwrap(), json!(1)).unwrap();
    assert_eq!(root, json!({"fresh": [1]}));
  }
}
