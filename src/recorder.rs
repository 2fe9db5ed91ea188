//! Bounded log of observed transactions
//!
//! The recorder keeps the most recent records in insertion order, keyed by
//! request id. Re-inserting an id updates the existing entry in place, which
//! is how responses attach to an already-recorded request.

use crate::message::{HttpRequest, HttpResponse};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Default ring capacity
pub const DEFAULT_CAPACITY: usize = 2_000;

/// One observed transaction
#[derive(Debug, Clone)]
pub struct RequestRecord {
  /// Record id, equal to the request id
  pub id: String,
  /// The request as it entered the flow pipeline
  pub request: HttpRequest,
  /// The response, once complete
  pub response: Option<HttpResponse>,
  /// Elapsed milliseconds, once complete
  pub duration_ms: Option<u64>,
  /// Id of the flow that matched, if any
  pub matched_flow: Option<String>,
}

impl RequestRecord {
  /// Create a record for a freshly parsed request
  pub fn new(request: HttpRequest) -> Self {
    Self {
      id: request.id.clone(),
      request,
      response: None,
      duration_ms: None,
      matched_flow: None,
    }
  }

  /// JSON projection for consumers outside the engine
  pub fn to_json(&self) -> Value {
    json!({
      "id": self.id,
      "request": self.request.to_json(),
      "response": self.response.as_ref().map(|r| r.to_json()),
      "durationMs": self.duration_ms,
      "matchedFlow": self.matched_flow,
    })
  }

  /// Render the recorded request as a copy-pasteable curl command
  pub fn curl_command(&self) -> String {
    let mut command = vec!["curl".to_string(), "-X".to_string(), self.request.method.to_string()];
    if self.request.is_https() {
      command.push("-k".to_string());
    }
    for (name, value) in self.request.headers.iter() {
      command.push("-H".to_string());
      command.push(bash_escape(&format!(
        "{}: {}",
        name.as_str(),
        String::from_utf8_lossy(value.as_bytes())
      )));
    }
    if let Some(body) = &self.request.body {
      command.push("-d".to_string());
      command.push(bash_escape(body));
    }
    command.push(bash_escape(&self.request.url.to_string()));
    command.join(" ")
  }
}

fn bash_escape(s: &str) -> String {
  format!("'{}'", s.replace('\'', "'\\''"))
}

/// Filter over recorded transactions; unset dimensions match anything
#[derive(Debug, Default, Clone)]
pub struct RecordQuery {
  /// Exact method token, case-insensitive
  pub method: Option<String>,
  /// Substring of the URL hostname, case-insensitive
  pub host: Option<String>,
  /// Exact response status code
  pub status: Option<u16>,
  /// Substring of the full URL, case-insensitive
  pub url: Option<String>,
}

impl RecordQuery {
  fn matches(&self, record: &RequestRecord) -> bool {
    if let Some(method) = &self.method {
      if !record.request.method.as_str().eq_ignore_ascii_case(method) {
        return false;
      }
    }
    if let Some(host) = &self.host {
      if !record.request.host().to_lowercase().contains(&host.to_lowercase()) {
        return false;
      }
    }
    if let Some(status) = self.status {
      match &record.response {
        Some(response) if response.status.as_u16() == status => {}
        _ => return false,
      }
    }
    if let Some(url) = &self.url {
      if !record.request.url.to_string().to_lowercase().contains(&url.to_lowercase()) {
        return false;
      }
    }
    true
  }
}

/// Bounded, append-only transaction log
pub struct Recorder {
  inner: Mutex<Inner>,
}

struct Inner {
  entries: VecDeque<RequestRecord>,
  capacity: usize,
}

impl Recorder {
  /// Create a recorder with the given capacity (minimum 1)
  pub fn new(capacity: usize) -> Self {
    Self {
      inner: Mutex::new(Inner {
        entries: VecDeque::new(),
        capacity: capacity.max(1),
      }),
    }
  }

  /// Insert or update a record by id; the oldest entry is evicted when the
  /// buffer would exceed capacity
  pub fn insert(&self, record: RequestRecord) {
    let mut inner = self.inner.lock().expect("recorder lock");
    if let Some(existing) = inner.entries.iter_mut().find(|r| r.id == record.id) {
      *existing = record;
      return;
    }
    if inner.entries.len() >= inner.capacity {
      inner.entries.pop_front();
    }
    inner.entries.push_back(record);
  }

  /// Attach the matched flow id to an existing record
  pub fn set_matched_flow(&self, id: &str, flow_id: Option<String>) {
    let mut inner = self.inner.lock().expect("recorder lock");
    if let Some(record) = inner.entries.iter_mut().find(|r| r.id == id) {
      record.matched_flow = flow_id;
    }
  }

  /// Attach the completed response and elapsed duration to an existing record
  pub fn complete(&self, id: &str, response: Option<HttpResponse>, duration_ms: u64) {
    let mut inner = self.inner.lock().expect("recorder lock");
    if let Some(record) = inner.entries.iter_mut().find(|r| r.id == id) {
      record.response = response;
      record.duration_ms = Some(duration_ms);
    }
  }

  /// All records, newest first
  pub fn list(&self) -> Vec<RequestRecord> {
    let inner = self.inner.lock().expect("recorder lock");
    inner.entries.iter().rev().cloned().collect()
  }

  /// Lookup by record id
  pub fn get(&self, id: &str) -> Option<RequestRecord> {
    let inner = self.inner.lock().expect("recorder lock");
    inner.entries.iter().find(|r| r.id == id).cloned()
  }

  /// Number of records currently held
  pub fn len(&self) -> usize {
    self.inner.lock().expect("recorder lock").entries.len()
  }

  /// Whether the buffer is empty
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Filtered view, newest first
  pub fn query(&self, query: &RecordQuery) -> Vec<RequestRecord> {
    let inner = self.inner.lock().expect("recorder lock");
    inner.entries.iter().rev().filter(|r| query.matches(r)).cloned().collect()
  }

  /// Drop every record
  pub fn clear(&self) {
    self.inner.lock().expect("recorder lock").entries.clear();
  }
}

impl Default for Recorder {
  fn default() -> Self {
    Self::new(DEFAULT_CAPACITY)
  }
}
