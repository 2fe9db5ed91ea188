//! The proxy engine: listener, classification, MITM and forwarding
//!
//! Every accepted connection runs as its own task, tracked so `stop` can
//! destroy live sockets (tunnels included) before the listener closes.
//! CONNECTs either splice a raw tunnel or detour through a per-host local
//! TLS endpoint whose leaf comes from the certificate authority; decrypted
//! requests re-enter the same plain path every other request takes.

use crate::ca::CertificateManager;
use crate::error::{Error, Result};
use crate::flow::FlowEngine;
use crate::message::{self, HttpRequest, HttpResponse};
use crate::recorder::{Recorder, RequestRecord};
use crate::wire;
use http::{Method, Uri};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Upstream connect timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// The proxy engine. Cheap to clone; all state lives behind the inner arc.
#[derive(Clone)]
pub struct ProxyServer {
  inner: Arc<ServerInner>,
}

struct ServerInner {
  ca: Arc<CertificateManager>,
  flow_engine: Arc<FlowEngine>,
  recorder: Arc<Recorder>,
  mitm_enabled: AtomicBool,
  conns: ConnTracker,
  /// host:port of the CONNECT target -> local MITM endpoint port
  mitm_endpoints: tokio::sync::Mutex<HashMap<String, u16>>,
  mitm_listeners: Mutex<Vec<AbortHandle>>,
  accept_task: Mutex<Option<AbortHandle>>,
  local_addr: Mutex<Option<SocketAddr>>,
}

/// Live connection task registry; `stop` aborts everything in it
struct ConnTracker {
  next_id: AtomicU64,
  tasks: Mutex<HashMap<u64, AbortHandle>>,
}

impl ConnTracker {
  fn new() -> Self {
    Self {
      next_id: AtomicU64::new(0),
      tasks: Mutex::new(HashMap::new()),
    }
  }

  fn abort_all(&self) {
    let mut tasks = self.tasks.lock().expect("conn tracker lock");
    for (_, handle) in tasks.drain() {
      handle.abort();
    }
  }
}

impl ProxyServer {
  pub fn new(
    ca: Arc<CertificateManager>,
    flow_engine: Arc<FlowEngine>,
    recorder: Arc<Recorder>,
    mitm_enabled: bool,
  ) -> Self {
    Self {
      inner: Arc::new(ServerInner {
        ca,
        flow_engine,
        recorder,
        mitm_enabled: AtomicBool::new(mitm_enabled),
        conns: ConnTracker::new(),
        mitm_endpoints: tokio::sync::Mutex::new(HashMap::new()),
        mitm_listeners: Mutex::new(Vec::new()),
        accept_task: Mutex::new(None),
        local_addr: Mutex::new(None),
      }),
    }
  }

  /// Bind the listener and start accepting; returns the bound address
  pub async fn start(&self, port: u16) -> Result<SocketAddr> {
    let listener = TcpListener::bind(("127.0.0.1", port))
      .await
      .map_err(|e| Error::proxy(format!("failed to bind port {}: {}", port, e)))?;
    let addr = listener.local_addr()?;
    *self.inner.local_addr.lock().expect("addr lock") = Some(addr);
    tracing::info!("proxy listening on {}", addr);

    let inner = self.inner.clone();
    let accept = tokio::spawn(async move {
      loop {
        match listener.accept().await {
          Ok((stream, peer)) => {
            spawn_tracked(&inner, {
              let inner = inner.clone();
              async move {
                if let Err(e) = handle_client(inner, stream, peer).await {
                  tracing::debug!("connection from {} ended: {}", peer, e);
                }
              }
            });
          }
          Err(e) => {
            tracing::error!("accept failed: {}", e);
          }
        }
      }
    });
    *self.inner.accept_task.lock().expect("accept lock") = Some(accept.abort_handle());
    Ok(addr)
  }

  /// Aggressive stop: destroy every tracked socket (tunnels included), then
  /// the listener, then each local MITM endpoint. Completes in bounded time
  /// with no graceful drain.
  pub async fn stop(&self) {
    if let Some(accept) = self.inner.accept_task.lock().expect("accept lock").take() {
      accept.abort();
    }
    self.inner.conns.abort_all();
    {
      let mut listeners = self.inner.mitm_listeners.lock().expect("mitm listeners lock");
      for handle in listeners.drain(..) {
        handle.abort();
      }
    }
    self.inner.mitm_endpoints.lock().await.clear();
    *self.inner.local_addr.lock().expect("addr lock") = None;
    tracing::info!("proxy stopped");
  }

  /// Bound address while running
  pub fn local_addr(&self) -> Option<SocketAddr> {
    *self.inner.local_addr.lock().expect("addr lock")
  }

  /// Flip MITM routing for future CONNECTs; existing tunnels are untouched
  pub fn set_mitm_enabled(&self, enabled: bool) {
    self.inner.mitm_enabled.store(enabled, Ordering::SeqCst);
  }

  /// Whether future CONNECTs will be intercepted
  pub fn mitm_enabled(&self) -> bool {
    self.inner.mitm_enabled.load(Ordering::SeqCst)
  }
}

/// Spawn a connection task and keep its abort handle until it finishes
fn spawn_tracked<F>(inner: &Arc<ServerInner>, fut: F)
where
  F: std::future::Future<Output = ()> + Send + 'static,
{
  let id = inner.conns.next_id.fetch_add(1, Ordering::Relaxed);
  let tracker = inner.clone();
  let handle = tokio::spawn(async move {
    fut.await;
    tracker.conns.tasks.lock().expect("conn tracker lock").remove(&id);
  });
  inner
    .conns
    .tasks
    .lock()
    .expect("conn tracker lock")
    .insert(id, handle.abort_handle());
}

async fn handle_client(inner: Arc<ServerInner>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
  let mut reader = BufReader::new(stream);
  let Some(head) = wire::read_request_head(&mut reader).await? else {
    return Ok(());
  };
  if head.method.eq_ignore_ascii_case("CONNECT") {
    handle_connect(inner, reader, head).await
  } else {
    serve_requests(inner, reader, peer, None, Some(head)).await
  }
}

/// Serve one connection's worth of plain HTTP requests. `tls_origin` carries
/// the CONNECT target when the stream already went through a MITM endpoint.
async fn serve_requests<S>(
  inner: Arc<ServerInner>,
  mut stream: BufReader<S>,
  peer: SocketAddr,
  tls_origin: Option<(String, u16)>,
  mut first: Option<wire::RequestHead>,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  loop {
    let head = match first.take() {
      Some(head) => head,
      None => match wire::read_request_head(&mut stream).await? {
        Some(head) => head,
        None => break,
      },
    };
    let close_requested = head
      .header("connection")
      .map(|c| c.to_lowercase().contains("close"))
      .unwrap_or(false)
      || head.version == "HTTP/1.0";

    let keep_alive = process_request(&inner, &mut stream, head, peer, tls_origin.as_ref()).await?;
    if close_requested || !keep_alive {
      break;
    }
  }
  // a clean shutdown so TLS clients see close_notify
  let _ = stream.shutdown().await;
  Ok(())
}

/// Read, record, run the flow pipeline, then answer or forward one request.
/// Returns whether the client connection can take another request.
async fn process_request<S>(
  inner: &Arc<ServerInner>,
  stream: &mut BufReader<S>,
  head: wire::RequestHead,
  peer: SocketAddr,
  tls_origin: Option<&(String, u16)>,
) -> Result<bool>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let body = wire::read_request_body(stream, &head.headers).await?;
  let url = absolute_url(&head, tls_origin)?;
  let method = Method::try_from(head.method.as_str())
    .map_err(|_| Error::invalid_request(format!("invalid method: {}", head.method)))?;

  let mut request = HttpRequest::new(method, url, head.headers.clone());
  request.client_addr = Some(peer);
  if let Some(body) = &body {
    if message::is_textual(&request.headers) {
      request.body = Some(String::from_utf8_lossy(&body.decoded).to_string());
    }
  }
  let record_id = request.id.clone();
  inner.recorder.insert(RequestRecord::new(request.clone()));

  let started = Instant::now();
  let outcome = inner.flow_engine.process(request).await;
  inner
    .recorder
    .set_matched_flow(&record_id, outcome.matched_flow.clone());

  // a terminating component synthesized the response: answer directly,
  // upstream is never contacted
  if let Some(response) = outcome.response {
    stream.write_all(&wire::serialize_response(&response)).await?;
    stream.flush().await?;
    inner
      .recorder
      .complete(&record_id, Some(response), started.elapsed().as_millis() as u64);
    return Ok(true);
  }

  // forward the (possibly mutated) request upstream
  let forward_body: Option<Vec<u8>> = match &outcome.request.body {
    Some(text) => Some(text.clone().into_bytes()),
    None => body.map(|b| b.decoded.to_vec()),
  };
  match forward_upstream(&outcome.request, forward_body.as_deref()).await {
    Ok((response_head, response_body)) => {
      // replay the upstream bytes to the client verbatim
      stream.write_all(&response_head.raw).await?;
      stream.write_all(&response_body.raw).await?;
      stream.flush().await?;

      let mut recorded = HttpResponse::new(
        http::StatusCode::from_u16(response_head.status)
          .unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR),
      );
      recorded.reason = response_head.reason.clone();
      recorded.headers = response_head.headers.clone();
      if message::is_textual(&recorded.headers) && !response_body.decoded.is_empty() {
        recorded.body = Some(String::from_utf8_lossy(&response_body.decoded).to_string());
      }
      let framed = response_head.headers.contains_key(http::header::CONTENT_LENGTH)
        || response_head
          .headers
          .get(http::header::TRANSFER_ENCODING)
          .is_some();
      let upstream_close = response_head
        .headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("close"))
        .unwrap_or(false);
      inner
        .recorder
        .complete(&record_id, Some(recorded), started.elapsed().as_millis() as u64);
      Ok(framed && !upstream_close)
    }
    Err(e) => {
      tracing::warn!("upstream failure for {}: {}", outcome.request.url, e);
      wire::write_error_response(stream, 502, "Bad Gateway", &format!("upstream error: {}", e))
        .await?;
      inner
        .recorder
        .complete(&record_id, None, started.elapsed().as_millis() as u64);
      Ok(false)
    }
  }
}

/// Compute the absolute URL for a request-target.
///
/// Inside a MITM stream the target is origin-form and the URL is rebuilt as
/// `https://<host>[:port]<path>`; on the plain path an absolute-form target
/// is used as-is and origin-form falls back to the Host header.
fn absolute_url(head: &wire::RequestHead, tls_origin: Option<&(String, u16)>) -> Result<Uri> {
  if let Some((host, port)) = tls_origin {
    let authority = if *port == 443 {
      host.clone()
    } else {
      format!("{}:{}", host, port)
    };
    let url = format!("https://{}{}", authority, head.target);
    return url
      .parse()
      .map_err(|_| Error::invalid_request(format!("invalid request target: {}", head.target)));
  }
  if head.target.starts_with("http://") || head.target.starts_with("https://") {
    return head
      .target
      .parse()
      .map_err(|_| Error::invalid_request(format!("invalid request target: {}", head.target)));
  }
  let host = head
    .header("host")
    .ok_or_else(|| Error::invalid_request("origin-form target without a Host header"))?;
  let url = format!("http://{}{}", host, head.target);
  url
    .parse()
    .map_err(|_| Error::invalid_request(format!("invalid request target: {}", head.target)))
}

/// Open the upstream connection, write the request, read back head and body
async fn forward_upstream(
  request: &HttpRequest,
  body: Option<&[u8]>,
) -> Result<(wire::ResponseHead, wire::BodyBytes)> {
  let host = request.host().to_string();
  let port = request.effective_port();
  let payload = wire::serialize_request(request, body);

  let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), port)))
    .await
    .map_err(|_| Error::connection(format!("connect to {}:{} timed out", host, port)))?
    .map_err(|e| Error::connection(format!("connect to {}:{} failed: {}", host, port, e)))?;

  if request.is_https() {
    let connector = TlsConnector::from(upstream_tls_config());
    let server_name = ServerName::try_from(host.clone())
      .map_err(|_| Error::tls(format!("invalid server name: {}", host)))?;
    let tls = connector
      .connect(server_name, stream)
      .await
      .map_err(|e| Error::tls(format!("upstream TLS handshake with {} failed: {}", host, e)))?;
    exchange(tls, &payload, request.method.as_str()).await
  } else {
    exchange(stream, &payload, request.method.as_str()).await
  }
}

async fn exchange<S>(
  mut stream: S,
  payload: &[u8],
  method: &str,
) -> Result<(wire::ResponseHead, wire::BodyBytes)>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  stream.write_all(payload).await?;
  stream.flush().await?;
  let mut reader = BufReader::new(stream);
  let head = wire::read_response_head(&mut reader).await?;
  let body = wire::read_response_body(&mut reader, &head, method).await?;
  Ok((head, body))
}

/// CONNECT handling: raw tunnel when MITM is off, detour through the local
/// TLS endpoint when it is on
async fn handle_connect(
  inner: Arc<ServerInner>,
  mut client: BufReader<TcpStream>,
  head: wire::RequestHead,
) -> Result<()> {
  let (host, port) = match head.target.rsplit_once(':') {
    Some((host, port)) => (
      host.to_string(),
      port
        .parse::<u16>()
        .map_err(|_| Error::invalid_request(format!("invalid CONNECT target: {}", head.target)))?,
    ),
    None => (head.target.clone(), 443),
  };

  if inner.mitm_enabled.load(Ordering::SeqCst) {
    let endpoint_port = match ensure_mitm_endpoint(&inner, &host, port).await {
      Ok(endpoint_port) => endpoint_port,
      Err(e) => {
        tracing::error!("MITM setup for {} failed: {}", host, e);
        let _ = client
          .write_all(b"HTTP/1.1 500 Internal Server Error\r\n\r\n")
          .await;
        return Ok(());
      }
    };
    client.write_all(wire::CONNECT_ESTABLISHED).await?;
    client.flush().await?;

    let preface = client.buffer().to_vec();
    let client = client.into_inner();
    let local = TcpStream::connect(("127.0.0.1", endpoint_port))
      .await
      .map_err(|e| Error::connection(format!("local MITM endpoint unreachable: {}", e)))?;
    splice(client, local, &preface).await
  } else {
    // raw tunnel: nothing inside it is recorded
    let upstream = match TcpStream::connect((host.as_str(), port)).await {
      Ok(upstream) => upstream,
      Err(e) => {
        wire::write_error_response(
          &mut client,
          502,
          "Bad Gateway",
          &format!("tunnel to {}:{} failed: {}", host, port, e),
        )
        .await?;
        return Ok(());
      }
    };
    client.write_all(wire::CONNECT_ESTABLISHED).await?;
    client.flush().await?;

    let preface = client.buffer().to_vec();
    let client = client.into_inner();
    splice(client, upstream, &preface).await
  }
}

/// Bidirectional byte splice until either side closes; preface bytes that
/// arrived with the CONNECT are flushed to the target first
async fn splice(mut client: TcpStream, mut target: TcpStream, preface: &[u8]) -> Result<()> {
  if !preface.is_empty() {
    target.write_all(preface).await?;
  }
  let (mut client_read, mut client_write) = client.split();
  let (mut target_read, mut target_write) = target.split();
  let client_to_target = tokio::io::copy(&mut client_read, &mut target_write);
  let target_to_client = tokio::io::copy(&mut target_read, &mut client_write);
  tokio::select! {
    _ = client_to_target => {}
    _ = target_to_client => {}
  }
  Ok(())
}

/// Get or create the local TLS endpoint for a CONNECT target. Idempotent
/// under concurrent calls: the table lock is held across creation.
async fn ensure_mitm_endpoint(inner: &Arc<ServerInner>, host: &str, port: u16) -> Result<u16> {
  let key = format!("{}:{}", host, port);
  let mut endpoints = inner.mitm_endpoints.lock().await;
  if let Some(existing) = endpoints.get(&key) {
    return Ok(*existing);
  }

  let (chain, leaf_key) = inner.ca.leaf_for_host(host).await?;
  let tls_config = ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(chain, leaf_key)
    .map_err(|e| Error::tls(format!("failed to build TLS config for {}: {}", host, e)))?;
  let acceptor = TlsAcceptor::from(Arc::new(tls_config));

  let listener = TcpListener::bind(("127.0.0.1", 0))
    .await
    .map_err(|e| Error::proxy(format!("failed to bind MITM endpoint: {}", e)))?;
  let local_port = listener.local_addr()?.port();

  let origin = (host.to_string(), port);
  let server = inner.clone();
  let accept_loop = tokio::spawn(async move {
    loop {
      match listener.accept().await {
        Ok((stream, peer)) => {
          let acceptor = acceptor.clone();
          let origin = origin.clone();
          spawn_tracked(&server, {
            let server = server.clone();
            async move {
              match acceptor.accept(stream).await {
                Ok(tls) => {
                  let reader = BufReader::new(tls);
                  if let Err(e) =
                    serve_requests(server, reader, peer, Some(origin), None).await
                  {
                    tracing::debug!("MITM stream ended: {}", e);
                  }
                }
                // a failed handshake just closes the client connection
                Err(e) => tracing::debug!("TLS handshake failed: {}", e),
              }
            }
          });
        }
        Err(e) => tracing::error!("MITM endpoint accept failed: {}", e),
      }
    }
  });
  inner
    .mitm_listeners
    .lock()
    .expect("mitm listeners lock")
    .push(accept_loop.abort_handle());

  endpoints.insert(key, local_port);
  tracing::debug!("MITM endpoint for {}:{} on local port {}", host, port, local_port);
  Ok(local_port)
}

/// Accept-all verifier for upstream TLS: a debugging proxy forwards to
/// whatever the client asked for, certificate problems included
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &tokio_rustls::rustls::pki_types::CertificateDer,
    _intermediates: &[tokio_rustls::rustls::pki_types::CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &tokio_rustls::rustls::pki_types::CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &tokio_rustls::rustls::pki_types::CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}

fn upstream_tls_config() -> Arc<ClientConfig> {
  let config = ClientConfig::builder()
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(NoVerifier))
    .with_no_client_auth();
  Arc::new(config)
}

#[cfg(test)]
mod tests {
  use super::*;
  use http::header::{HeaderMap, HeaderValue};

  fn head(method: &str, target: &str, host: Option<&str>) -> wire::RequestHead {
    let mut headers = HeaderMap::new();
    if let Some(host) = host {
      headers.insert(http::header::HOST, HeaderValue::from_str(host).unwrap());
    }
    wire::RequestHead {
      method: method.to_string(),
      target: target.to_string(),
      version: "HTTP/1.1".to_string(),
      headers,
    }
  }

  #[test]
  fn absolute_form_target_is_used_as_is() {
    let url = absolute_url(&head("GET", "http://example.test/hello", None), None).unwrap();
    assert_eq!(url.to_string(), "http://example.test/hello");
  }

  #[test]
  fn origin_form_uses_host_header() {
    let url = absolute_url(&head("GET", "/hello?x=1", Some("example.test:8080")), None).unwrap();
    assert_eq!(url.to_string(), "http://example.test:8080/hello?x=1");
    assert!(absolute_url(&head("GET", "/hello", None), None).is_err());
  }

  #[test]
  fn mitm_stream_reconstructs_https_url() {
    let origin = ("secure.test".to_string(), 443u16);
    let url = absolute_url(&head("GET", "/me", None), Some(&origin)).unwrap();
    assert_eq!(url.to_string(), "https://secure.test/me");

    let origin = ("secure.test".to_string(), 8443u16);
    let url = absolute_url(&head("GET", "/me", None), Some(&origin)).unwrap();
    assert_eq!(url.to_string(), "https://secure.test:8443/me");
  }
}
