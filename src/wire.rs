//! Hand-parsed HTTP/1.1 wire codec
//!
//! Request and response heads are read line-by-line off a buffered stream
//! with size caps. Response bodies keep the raw framed bytes exactly as read
//! so the engine can replay them to the client verbatim, alongside a decoded
//! copy for the recorded view.

use crate::error::{Error, Result};
use crate::message::HttpRequest;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

/// Maximum request/status line length
const MAX_LINE: usize = 8 * 1024;
/// Maximum accumulated header bytes
const MAX_HEADERS: usize = 64 * 1024;
/// Maximum buffered body size
const MAX_BODY: usize = 64 * 1024 * 1024;

/// Parsed request line plus headers
#[derive(Debug)]
pub struct RequestHead {
  pub method: String,
  pub target: String,
  pub version: String,
  pub headers: HeaderMap,
}

impl RequestHead {
  /// First header value as text
  pub fn header(&self, name: &str) -> Option<String> {
    self
      .headers
      .get(name)
      .map(|v| String::from_utf8_lossy(v.as_bytes()).to_string())
  }
}

/// Parsed status line plus headers, with the raw head bytes as read
#[derive(Debug)]
pub struct ResponseHead {
  pub status: u16,
  pub reason: String,
  pub headers: HeaderMap,
  /// Status line + headers + blank line, byte-for-byte
  pub raw: Bytes,
}

/// A message body: the bytes as they appeared on the wire (including chunk
/// framing) and the decoded payload
#[derive(Debug, Default)]
pub struct BodyBytes {
  pub raw: Bytes,
  pub decoded: Bytes,
}

/// Read one request head. `Ok(None)` means the peer closed between requests.
pub async fn read_request_head<R>(reader: &mut R) -> Result<Option<RequestHead>>
where
  R: AsyncBufReadExt + Unpin,
{
  let mut line = String::new();
  let n = reader.read_line(&mut line).await?;
  if n == 0 {
    return Ok(None);
  }
  if line.len() > MAX_LINE {
    return Err(Error::invalid_request("request line too long"));
  }
  let mut parts = line.split_whitespace();
  let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
    (Some(m), Some(t), Some(v)) => (m.to_string(), t.to_string(), v.to_string()),
    _ => return Err(Error::invalid_request(format!("invalid request line: {}", line.trim()))),
  };

  let headers = read_headers(reader).await?;
  Ok(Some(RequestHead {
    method,
    target,
    version,
    headers,
  }))
}

/// Read one response head, preserving the raw bytes
pub async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead>
where
  R: AsyncBufReadExt + Unpin,
{
  let mut raw = Vec::new();
  let mut line = String::new();
  let n = reader.read_line(&mut line).await?;
  if n == 0 {
    return Err(Error::connection("upstream closed before the status line"));
  }
  if line.len() > MAX_LINE {
    return Err(Error::invalid_request("status line too long"));
  }
  raw.extend_from_slice(line.as_bytes());

  let trimmed = line.trim_end();
  let mut parts = trimmed.splitn(3, ' ');
  let _version = parts.next().unwrap_or_default();
  let status = parts
    .next()
    .and_then(|s| s.parse::<u16>().ok())
    .ok_or_else(|| Error::invalid_request(format!("invalid status line: {}", trimmed)))?;
  let reason = parts.next().unwrap_or_default().to_string();

  let mut headers = HeaderMap::new();
  let mut accumulated = 0usize;
  loop {
    let mut header_line = String::new();
    let n = reader.read_line(&mut header_line).await?;
    if n == 0 {
      return Err(Error::connection("upstream closed inside the headers"));
    }
    raw.extend_from_slice(header_line.as_bytes());
    accumulated += n;
    if accumulated > MAX_HEADERS {
      return Err(Error::invalid_request("headers exceed maximum size"));
    }
    let trimmed = header_line.trim_end();
    if trimmed.is_empty() {
      break;
    }
    append_header(&mut headers, trimmed);
  }

  Ok(ResponseHead {
    status,
    reason,
    headers,
    raw: Bytes::from(raw),
  })
}

async fn read_headers<R>(reader: &mut R) -> Result<HeaderMap>
where
  R: AsyncBufReadExt + Unpin,
{
  let mut headers = HeaderMap::new();
  let mut accumulated = 0usize;
  loop {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
      return Err(Error::invalid_request("connection closed inside the headers"));
    }
    accumulated += n;
    if accumulated > MAX_HEADERS {
      return Err(Error::invalid_request("headers exceed maximum size"));
    }
    let trimmed = line.trim_end();
    if trimmed.is_empty() {
      return Ok(headers);
    }
    append_header(&mut headers, trimmed);
  }
}

fn append_header(headers: &mut HeaderMap, line: &str) {
  if let Some((name, value)) = line.split_once(':') {
    if let (Ok(name), Ok(value)) = (
      HeaderName::try_from(name.trim()),
      HeaderValue::try_from(value.trim()),
    ) {
      headers.append(name, value);
    }
  }
}

/// Read a request body when the headers indicate one
pub async fn read_request_body<R>(reader: &mut R, headers: &HeaderMap) -> Result<Option<BodyBytes>>
where
  R: AsyncBufReadExt + Unpin,
{
  if is_chunked(headers) {
    return Ok(Some(read_chunked(reader).await?));
  }
  match content_length(headers) {
    Some(0) | None => Ok(None),
    Some(length) => Ok(Some(read_exact_body(reader, length).await?)),
  }
}

/// Read a response body according to the head and the request method
pub async fn read_response_body<R>(
  reader: &mut R,
  head: &ResponseHead,
  request_method: &str,
) -> Result<BodyBytes>
where
  R: AsyncBufReadExt + Unpin,
{
  if request_method.eq_ignore_ascii_case("HEAD") || head.status == 204 || head.status == 304 {
    return Ok(BodyBytes::default());
  }
  if is_chunked(&head.headers) {
    return read_chunked(reader).await;
  }
  if let Some(length) = content_length(&head.headers) {
    if length == 0 {
      return Ok(BodyBytes::default());
    }
    return read_exact_body(reader, length).await;
  }
  // no framing: the body runs to EOF
  let mut buffer = Vec::new();
  reader.read_to_end(&mut buffer).await?;
  if buffer.len() > MAX_BODY {
    return Err(Error::invalid_request("body exceeds maximum size"));
  }
  let bytes = Bytes::from(buffer);
  Ok(BodyBytes {
    raw: bytes.clone(),
    decoded: bytes,
  })
}

async fn read_exact_body<R>(reader: &mut R, length: usize) -> Result<BodyBytes>
where
  R: AsyncReadExt + Unpin,
{
  if length > MAX_BODY {
    return Err(Error::invalid_request("body exceeds maximum size"));
  }
  let mut buffer = vec![0u8; length];
  reader.read_exact(&mut buffer).await?;
  let bytes = Bytes::from(buffer);
  Ok(BodyBytes {
    raw: bytes.clone(),
    decoded: bytes,
  })
}

/// Read a chunked body, keeping the framed bytes for verbatim replay and the
/// joined chunks as the decoded payload; trailers stay in the raw copy
async fn read_chunked<R>(reader: &mut R) -> Result<BodyBytes>
where
  R: AsyncBufReadExt + Unpin,
{
  let mut raw = Vec::new();
  let mut decoded = Vec::new();
  loop {
    let mut size_line = String::new();
    let n = reader.read_line(&mut size_line).await?;
    if n == 0 {
      return Err(Error::connection("connection closed inside a chunked body"));
    }
    raw.extend_from_slice(size_line.as_bytes());
    let size = usize::from_str_radix(
      size_line.trim().split(';').next().unwrap_or_default().trim(),
      16,
    )
    .map_err(|_| Error::invalid_request(format!("invalid chunk size: {}", size_line.trim())))?;

    if size == 0 {
      // trailers run to the final blank line
      loop {
        let mut trailer = String::new();
        let n = reader.read_line(&mut trailer).await?;
        if n == 0 {
          return Err(Error::connection("connection closed inside chunk trailers"));
        }
        raw.extend_from_slice(trailer.as_bytes());
        if trailer.trim_end().is_empty() {
          return Ok(BodyBytes {
            raw: Bytes::from(raw),
            decoded: Bytes::from(decoded),
          });
        }
      }
    }

    if decoded.len() + size > MAX_BODY {
      return Err(Error::invalid_request("body exceeds maximum size"));
    }
    let mut chunk = vec![0u8; size + 2]; // chunk data plus trailing CRLF
    reader.read_exact(&mut chunk).await?;
    raw.extend_from_slice(&chunk);
    decoded.extend_from_slice(&chunk[..size]);
  }
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
  headers
    .get(http::header::CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.trim().parse().ok())
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get(http::header::TRANSFER_ENCODING)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.to_lowercase().contains("chunked"))
    .unwrap_or(false)
}

/// Serialize a request for the upstream connection in origin form.
///
/// Hop-by-hop headers (`Proxy-Connection`, `Connection`) are stripped, the
/// Host header is ensured, and the body is framed with a Content-Length
/// (chunked request bodies are forwarded de-chunked).
pub fn serialize_request(request: &HttpRequest, body: Option<&[u8]>) -> Vec<u8> {
  let path_and_query = request
    .url
    .path_and_query()
    .map(|pq| pq.as_str())
    .unwrap_or("/");

  let mut headers = request.headers.clone();
  headers.remove("proxy-connection");
  headers.remove("connection");
  headers.remove("transfer-encoding");
  if !headers.contains_key(http::header::HOST) {
    let host = match request.port() {
      Some(port) => format!("{}:{}", request.host(), port),
      None => request.host().to_string(),
    };
    if let Ok(value) = HeaderValue::try_from(host) {
      headers.insert(http::header::HOST, value);
    }
  }
  match body {
    Some(body) => {
      if let Ok(value) = HeaderValue::try_from(body.len().to_string()) {
        headers.insert(http::header::CONTENT_LENGTH, value);
      }
    }
    None => {
      headers.remove(http::header::CONTENT_LENGTH);
    }
  }

  let mut buffer = Vec::new();
  buffer.extend_from_slice(
    format!("{} {} HTTP/1.1\r\n", request.method.as_str(), path_and_query).as_bytes(),
  );
  for (name, value) in headers.iter() {
    buffer.extend_from_slice(name.as_str().as_bytes());
    buffer.extend_from_slice(b": ");
    buffer.extend_from_slice(value.as_bytes());
    buffer.extend_from_slice(b"\r\n");
  }
  buffer.extend_from_slice(b"\r\n");
  if let Some(body) = body {
    buffer.extend_from_slice(body);
  }
  buffer
}

/// Serialize a synthesized response for the client
pub fn serialize_response(response: &crate::message::HttpResponse) -> Vec<u8> {
  let mut buffer = Vec::new();
  buffer.extend_from_slice(
    format!("HTTP/1.1 {} {}\r\n", response.status.as_u16(), response.reason).as_bytes(),
  );
  let body = response.body.as_deref().unwrap_or_default();
  let mut headers = response.headers.clone();
  if !headers.contains_key(http::header::CONTENT_LENGTH) {
    if let Ok(value) = HeaderValue::try_from(body.len().to_string()) {
      headers.insert(http::header::CONTENT_LENGTH, value);
    }
  }
  for (name, value) in headers.iter() {
    buffer.extend_from_slice(name.as_str().as_bytes());
    buffer.extend_from_slice(b": ");
    buffer.extend_from_slice(value.as_bytes());
    buffer.extend_from_slice(b"\r\n");
  }
  buffer.extend_from_slice(b"\r\n");
  buffer.extend_from_slice(body.as_bytes());
  buffer
}

/// Write a plain-text error response
pub async fn write_error_response<W>(writer: &mut W, status: u16, reason: &str, body: &str) -> Result<()>
where
  W: AsyncWriteExt + Unpin,
{
  let payload = format!(
    "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
    status,
    reason,
    body.len(),
    body
  );
  writer.write_all(payload.as_bytes()).await?;
  writer.flush().await?;
  Ok(())
}

/// The standard CONNECT acknowledgement
pub const CONNECT_ESTABLISHED: &[u8] =
  b"HTTP/1.1 200 Connection Established\r\nProxy-Agent: wiretap\r\n\r\n";
