//! HTTP message types shared by the proxy, flow and component layers
//!
//! Every request held by the engine carries an absolute URL, even when the
//! client sent an origin-form target; the proxy synthesizes scheme and
//! authority from CONNECT context or the Host header before anything else
//! sees the request.

use chrono::{DateTime, Utc};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{Method, StatusCode, Uri};
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use uuid::Uuid;

/// An in-flight HTTP request as seen by the engine.
///
/// The body is textual only; binary or compressed payloads leave it `None`
/// and travel as raw bytes through the wire layer.
#[derive(Debug, Clone)]
pub struct HttpRequest {
  /// Opaque unique identifier
  pub id: String,
  /// Uppercase method token
  pub method: Method,
  /// Absolute URL (scheme + authority always present)
  pub url: Uri,
  /// Header mapping, case-insensitive keys
  pub headers: HeaderMap,
  /// Textual body, if the payload is known text
  pub body: Option<String>,
  /// Capture timestamp
  pub timestamp: DateTime<Utc>,
  /// Client address, when known
  pub client_addr: Option<SocketAddr>,
}

impl HttpRequest {
  /// Create a request with a fresh id and the current timestamp
  pub fn new(method: Method, url: Uri, headers: HeaderMap) -> Self {
    Self {
      id: Uuid::new_v4().to_string(),
      method,
      url,
      headers,
      body: None,
      timestamp: Utc::now(),
      client_addr: None,
    }
  }

  /// Hostname of the absolute URL
  pub fn host(&self) -> &str {
    self.url.host().unwrap_or_default()
  }

  /// Explicit port, when the URL carries one
  pub fn port(&self) -> Option<u16> {
    self.url.port_u16()
  }

  /// Port to actually dial, falling back to the scheme default
  pub fn effective_port(&self) -> u16 {
    self.url.port_u16().unwrap_or(if self.is_https() { 443 } else { 80 })
  }

  /// Whether the URL scheme is https
  pub fn is_https(&self) -> bool {
    self.url.scheme() == Some(&Scheme::HTTPS)
  }

  /// Path component of the URL
  pub fn path(&self) -> &str {
    self.url.path()
  }

  /// First value of a header, lossily decoded
  pub fn header(&self, name: &str) -> Option<String> {
    self.headers.get(name).map(|v| String::from_utf8_lossy(v.as_bytes()).to_string())
  }

  /// Set a header, replacing any existing values
  pub fn set_header(&mut self, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) =
      (HeaderName::try_from(name), HeaderValue::try_from(value))
    {
      self.headers.insert(name, value);
    }
  }

  /// Remove a header by name
  pub fn remove_header(&mut self, name: &str) {
    if let Ok(name) = HeaderName::try_from(name) {
      self.headers.remove(name);
    }
  }

  /// Replace scheme, host and port on the absolute URL, keeping path+query.
  ///
  /// `port` of `None` drops any explicit port.
  pub fn set_authority(&mut self, scheme: &str, host: &str, port: Option<u16>) -> crate::Result<()> {
    let scheme = Scheme::try_from(scheme)
      .map_err(|_| crate::Error::invalid_request(format!("invalid scheme: {}", scheme)))?;
    let authority = match port {
      Some(p) => format!("{}:{}", host, p),
      None => host.to_string(),
    };
    let authority = Authority::try_from(authority.as_str())
      .map_err(|_| crate::Error::invalid_request(format!("invalid host: {}", host)))?;
    let pq = self
      .url
      .path_and_query()
      .cloned()
      .unwrap_or_else(|| PathAndQuery::from_static("/"));
    self.url = Uri::builder()
      .scheme(scheme)
      .authority(authority)
      .path_and_query(pq)
      .build()?;
    Ok(())
  }

  /// Query string decoded into ordered name/value pairs
  pub fn query_pairs(&self) -> Vec<(String, String)> {
    let query = self.url.query().unwrap_or_default();
    query
      .split('&')
      .filter(|p| !p.is_empty())
      .map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        (
          percent_decode_str(k).decode_utf8_lossy().to_string(),
          percent_decode_str(v).decode_utf8_lossy().to_string(),
        )
      })
      .collect()
  }

  /// Replace the query string from ordered name/value pairs
  pub fn set_query_pairs(&mut self, pairs: &[(String, String)]) -> crate::Result<()> {
    let encoded: Vec<String> = pairs
      .iter()
      .map(|(k, v)| {
        format!(
          "{}={}",
          utf8_percent_encode(k, QUERY_ENCODE_SET),
          utf8_percent_encode(v, QUERY_ENCODE_SET)
        )
      })
      .collect();
    let pq = if encoded.is_empty() {
      self.url.path().to_string()
    } else {
      format!("{}?{}", self.url.path(), encoded.join("&"))
    };
    let pq = PathAndQuery::try_from(pq.as_str())
      .map_err(|e| crate::Error::invalid_request(format!("invalid query: {}", e)))?;
    let mut parts = self.url.clone().into_parts();
    parts.path_and_query = Some(pq);
    self.url = Uri::from_parts(parts)
      .map_err(|e| crate::Error::invalid_request(format!("invalid url: {}", e)))?;
    Ok(())
  }

  /// JSON projection used by the sandbox and the debug runner
  pub fn to_json(&self) -> Value {
    json!({
      "id": self.id,
      "method": self.method.as_str(),
      "url": self.url.to_string(),
      "headers": headers_to_json(&self.headers),
      "body": self.body,
      "timestamp": self.timestamp.to_rfc3339(),
      "clientAddr": self.client_addr.map(|a| a.to_string()),
    })
  }

  /// Apply a JSON patch produced by a script: any of `method`, `url`,
  /// `headers`, `body` replace the corresponding field.
  pub fn apply_json(&mut self, value: &Value) -> crate::Result<()> {
    if let Some(method) = value.get("method").and_then(Value::as_str) {
      self.method = Method::try_from(method.to_uppercase().as_str())
        .map_err(|_| crate::Error::invalid_request(format!("invalid method: {}", method)))?;
    }
    if let Some(url) = value.get("url").and_then(Value::as_str) {
      let url: Uri = url
        .parse()
        .map_err(|_| crate::Error::invalid_request(format!("invalid url: {}", url)))?;
      if url.scheme().is_none() || url.authority().is_none() {
        return Err(crate::Error::invalid_request("url must be absolute".to_string()));
      }
      self.url = url;
    }
    if let Some(headers) = value.get("headers").and_then(Value::as_object) {
      self.headers = headers_from_json(headers);
    }
    match value.get("body") {
      Some(Value::String(body)) => self.body = Some(body.clone()),
      Some(Value::Null) => self.body = None,
      _ => {}
    }
    Ok(())
  }
}

/// A captured HTTP response.
///
/// Raw body bytes accompany a response inside the wire layer only; this type
/// is the recorded view plus whatever a component synthesized.
#[derive(Debug, Clone)]
pub struct HttpResponse {
  /// Status code
  pub status: StatusCode,
  /// Status reason phrase
  pub reason: String,
  /// Header mapping, case-insensitive keys
  pub headers: HeaderMap,
  /// Textual body, if the payload is known text
  pub body: Option<String>,
}

impl HttpResponse {
  /// Create an empty response with the given status
  pub fn new(status: StatusCode) -> Self {
    let reason = status.canonical_reason().unwrap_or("Unknown").to_string();
    Self {
      status,
      reason,
      headers: HeaderMap::new(),
      body: None,
    }
  }

  /// Build a synthesized response with a textual body and content type
  pub fn synthesized(status: u16, reason: Option<&str>, content_type: &str, body: &str) -> Self {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    let mut response = Self::new(status);
    if let Some(reason) = reason {
      response.reason = reason.to_string();
    }
    response.set_header("content-type", content_type);
    response.set_header("content-length", &body.len().to_string());
    response.body = Some(body.to_string());
    response
  }

  /// First value of a header, lossily decoded
  pub fn header(&self, name: &str) -> Option<String> {
    self.headers.get(name).map(|v| String::from_utf8_lossy(v.as_bytes()).to_string())
  }

  /// Set a header, replacing any existing values
  pub fn set_header(&mut self, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) =
      (HeaderName::try_from(name), HeaderValue::try_from(value))
    {
      self.headers.insert(name, value);
    }
  }

  /// JSON projection used by the sandbox and the debug runner
  pub fn to_json(&self) -> Value {
    json!({
      "statusCode": self.status.as_u16(),
      "statusMessage": self.reason,
      "headers": headers_to_json(&self.headers),
      "body": self.body,
    })
  }

  /// Build a response from a script-produced JSON object
  pub fn from_json(value: &Value) -> crate::Result<Self> {
    let status = value
      .get("statusCode")
      .and_then(Value::as_u64)
      .unwrap_or(200) as u16;
    let status = StatusCode::from_u16(status)
      .map_err(|_| crate::Error::invalid_request(format!("invalid status: {}", status)))?;
    let mut response = Self::new(status);
    if let Some(reason) = value.get("statusMessage").and_then(Value::as_str) {
      response.reason = reason.to_string();
    }
    if let Some(headers) = value.get("headers").and_then(Value::as_object) {
      response.headers = headers_from_json(headers);
    }
    if let Some(body) = value.get("body").and_then(Value::as_str) {
      response.body = Some(body.to_string());
      if !response.headers.contains_key("content-length") {
        response.set_header("content-length", &body.len().to_string());
      }
    }
    if let Some(content_type) = value.get("contentType").and_then(Value::as_str) {
      response.set_header("content-type", content_type);
    }
    Ok(response)
  }
}

/// Query-string encode set: everything but unreserved characters
const QUERY_ENCODE_SET: &percent_encoding::AsciiSet = &NON_ALPHANUMERIC
  .remove(b'-')
  .remove(b'_')
  .remove(b'.')
  .remove(b'~');

/// Lowercased header map projection; repeated names join with `, `
pub fn headers_to_json(headers: &HeaderMap) -> Value {
  let mut map = Map::new();
  for name in headers.keys() {
    let joined = headers
      .get_all(name)
      .iter()
      .map(|v| String::from_utf8_lossy(v.as_bytes()).to_string())
      .collect::<Vec<_>>()
      .join(", ");
    map.insert(name.as_str().to_string(), Value::String(joined));
  }
  Value::Object(map)
}

/// Rebuild a header map from a JSON object, skipping invalid entries
pub fn headers_from_json(map: &Map<String, Value>) -> HeaderMap {
  let mut headers = HeaderMap::new();
  for (name, value) in map {
    let text = match value {
      Value::String(s) => s.clone(),
      other => other.to_string(),
    };
    if let (Ok(name), Ok(value)) =
      (HeaderName::try_from(name.as_str()), HeaderValue::try_from(text.as_str()))
    {
      headers.append(name, value);
    }
  }
  headers
}

/// Whether a payload with these headers is treated as text.
///
/// Textual only when no content encoding applies and the content type is one
/// of text/*, json, javascript, xml or form-urlencoded variants. Everything
/// else flows through the engine as raw bytes and is never recorded as a
/// body string.
pub fn is_textual(headers: &HeaderMap) -> bool {
  if let Some(encoding) = headers.get(http::header::CONTENT_ENCODING) {
    let encoding = String::from_utf8_lossy(encoding.as_bytes()).to_lowercase();
    if !encoding.is_empty() && encoding != "identity" {
      return false;
    }
  }
  let content_type = match headers.get(http::header::CONTENT_TYPE) {
    Some(v) => String::from_utf8_lossy(v.as_bytes()).to_string(),
    None => return false,
  };
  let mime: mime::Mime = match content_type.trim().parse() {
    Ok(m) => m,
    Err(_) => return false,
  };
  if mime.type_() == mime::TEXT {
    return true;
  }
  let subtype = mime.subtype().as_str().to_ascii_lowercase();
  let suffix = mime.suffix().map(|s| s.as_str().to_ascii_lowercase()).unwrap_or_default();
  ["json", "javascript", "xml", "x-www-form-urlencoded"]
    .iter()
    .any(|t| subtype.contains(t) || suffix.contains(t))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn request(url: &str) -> HttpRequest {
    HttpRequest::new(Method::GET, url.parse().unwrap(), HeaderMap::new())
  }

  #[test]
  fn authority_rewrite_keeps_path_and_query() {
    let mut req = request("http://example.test:8080/a/b?x=1");
    req.set_authority("https", "other.test", Some(9443)).unwrap();
    assert_eq!(req.url.to_string(), "https://other.test:9443/a/b?x=1");
    assert!(req.is_https());
    assert_eq!(req.effective_port(), 9443);
  }

  #[test]
  fn query_pairs_round_trip() {
    let mut req = request("http://example.test/search?q=a%20b&flag=");
    let mut pairs = req.query_pairs();
    assert_eq!(pairs, vec![("q".into(), "a b".into()), ("flag".into(), "".into())]);
    pairs.push(("n".into(), "2".into()));
    req.set_query_pairs(&pairs).unwrap();
    assert_eq!(req.url.query(), Some("q=a%20b&flag=&n=2"));
  }

  #[test]
  fn headers_are_case_insensitive() {
    let mut req = request("http://example.test/");
    req.set_header("X-Token", "abc");
    assert_eq!(req.header("x-token").as_deref(), Some("abc"));
    req.remove_header("X-TOKEN");
    assert!(req.header("x-token").is_none());
  }

  #[test]
  fn textuality_rules() {
    let mut headers = HeaderMap::new();
    assert!(!is_textual(&headers));
    headers.insert("content-type", HeaderValue::from_static("text/html; charset=utf-8"));
    assert!(is_textual(&headers));
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    assert!(is_textual(&headers));
    headers.insert("content-type", HeaderValue::from_static("application/problem+json"));
    assert!(is_textual(&headers));
    headers.insert("content-type", HeaderValue::from_static("application/x-www-form-urlencoded"));
    assert!(is_textual(&headers));
    headers.insert("content-type", HeaderValue::from_static("image/png"));
    assert!(!is_textual(&headers));
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    headers.insert("content-encoding", HeaderValue::from_static("gzip"));
    assert!(!is_textual(&headers));
  }

  #[test]
  fn script_patch_replaces_fields() {
    let mut req = request("http://example.test/v1");
    req
      .apply_json(&serde_json::json!({
        "method": "post",
        "url": "http://example.test/v2",
        "headers": {"x-a": "1"},
        "body": "hello",
      }))
      .unwrap();
    assert_eq!(req.method, Method::POST);
    assert_eq!(req.url.path(), "/v2");
    assert_eq!(req.header("x-a").as_deref(), Some("1"));
    assert_eq!(req.body.as_deref(), Some("hello"));
  }

  #[test]
  fn synthesized_response_sets_length() {
    let resp = HttpResponse::synthesized(201, None, "application/json", "{\"ok\":true}");
    assert_eq!(resp.status.as_u16(), 201);
    assert_eq!(resp.header("content-length").as_deref(), Some("11"));
    assert_eq!(resp.body.as_deref(), Some("{\"ok\":true}"));
  }
}
