//! Flow graph documents
//!
//! A flow is a directed graph stored as an arena of nodes with stable
//! integer indices; edges carry from/to indices and an optional branch
//! label. Validation enforces the graph shape before a document is saved.

use crate::error::{Error, Result};
use crate::message::HttpRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;

/// How a terminator ends the walk
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TerminatorMode {
  /// Forward upstream even if a component produced a response
  PassThrough,
  /// End with the response installed on the context
  EndWithResponse,
}

/// Entry match rule; an omitted dimension matches anything
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct MatchRule {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub methods: Option<Vec<String>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub hosts: Option<Vec<String>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub paths: Option<Vec<String>>,
}

impl MatchRule {
  /// Every constrained dimension must pass
  pub fn matches(&self, request: &HttpRequest) -> bool {
    if let Some(methods) = &self.methods {
      if !methods.iter().any(|m| m.eq_ignore_ascii_case(request.method.as_str())) {
        return false;
      }
    }
    if let Some(hosts) = &self.hosts {
      if !hosts.iter().any(|g| glob_match(g, request.host())) {
        return false;
      }
    }
    if let Some(paths) = &self.paths {
      if !paths.iter().any(|g| glob_match(g, request.path())) {
        return false;
      }
    }
    true
  }
}

/// Graph node variants
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowNode {
  #[serde(rename_all = "camelCase")]
  Entry {
    #[serde(default)]
    rule: MatchRule,
  },
  #[serde(rename_all = "camelCase")]
  Component {
    component_id: String,
    #[serde(default)]
    params: Map<String, Value>,
  },
  #[serde(rename_all = "camelCase")]
  Condition { expression: String },
  #[serde(rename_all = "camelCase")]
  Terminator { mode: TerminatorMode },
}

/// Directed edge between node indices
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FlowEdge {
  pub from: usize,
  pub to: usize,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub label: Option<String>,
}

/// A stored flow document
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub enabled: bool,
  pub nodes: Vec<FlowNode>,
  #[serde(default)]
  pub edges: Vec<FlowEdge>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl FlowDefinition {
  /// Index of the single entry node
  pub fn entry_index(&self) -> Option<usize> {
    self.nodes.iter().position(|n| matches!(n, FlowNode::Entry { .. }))
  }

  /// Whether this flow's entry matches a request
  pub fn matches(&self, request: &HttpRequest) -> bool {
    match self.entry_index().map(|i| &self.nodes[i]) {
      Some(FlowNode::Entry { rule }) => rule.matches(request),
      _ => false,
    }
  }

  /// First successor of a node, ignoring labels
  pub fn successor(&self, from: usize) -> Option<usize> {
    self.edges.iter().find(|e| e.from == from).map(|e| e.to)
  }

  /// Successor along the edge with the given label
  pub fn labeled_successor(&self, from: usize, label: &str) -> Option<usize> {
    self
      .edges
      .iter()
      .find(|e| e.from == from && e.label.as_deref() == Some(label))
      .map(|e| e.to)
  }

  /// Enforce the graph invariants
  pub fn validate(&self) -> Result<()> {
    for edge in &self.edges {
      if edge.from >= self.nodes.len() || edge.to >= self.nodes.len() {
        return Err(Error::flow(format!(
          "flow {}: edge {} -> {} references a missing node",
          self.id, edge.from, edge.to
        )));
      }
    }

    let entries: Vec<usize> = self
      .nodes
      .iter()
      .enumerate()
      .filter(|(_, n)| matches!(n, FlowNode::Entry { .. }))
      .map(|(i, _)| i)
      .collect();
    if entries.len() != 1 {
      return Err(Error::flow(format!(
        "flow {}: expected exactly one entry node, found {}",
        self.id,
        entries.len()
      )));
    }
    let entry = entries[0];

    for (index, node) in self.nodes.iter().enumerate() {
      let outgoing: Vec<&FlowEdge> = self.edges.iter().filter(|e| e.from == index).collect();
      let incoming = self.edges.iter().filter(|e| e.to == index).count();
      match node {
        FlowNode::Entry { .. } => {
          if outgoing.len() != 1 {
            return Err(Error::flow(format!(
              "flow {}: entry node must have exactly one outgoing edge",
              self.id
            )));
          }
        }
        FlowNode::Component { .. } => {
          if incoming > 1 || outgoing.len() > 1 {
            return Err(Error::flow(format!(
              "flow {}: component node {} must have at most one incoming and outgoing edge",
              self.id, index
            )));
          }
        }
        FlowNode::Condition { .. } => {
          if incoming > 1 {
            return Err(Error::flow(format!(
              "flow {}: condition node {} must have at most one incoming edge",
              self.id, index
            )));
          }
          let mut labels = Vec::new();
          for edge in &outgoing {
            let label = edge.label.as_deref().ok_or_else(|| {
              Error::flow(format!(
                "flow {}: condition node {} has an unlabeled outgoing edge",
                self.id, index
              ))
            })?;
            if labels.contains(&label) {
              return Err(Error::flow(format!(
                "flow {}: condition node {} has duplicate branch label {}",
                self.id, index, label
              )));
            }
            labels.push(label);
          }
        }
        FlowNode::Terminator { .. } => {
          if !outgoing.is_empty() {
            return Err(Error::flow(format!(
              "flow {}: terminator node {} must have no outgoing edges",
              self.id, index
            )));
          }
        }
      }
    }

    // every non-entry node reachable from the entry
    let mut seen = vec![false; self.nodes.len()];
    seen[entry] = true;
    let mut queue = VecDeque::from([entry]);
    while let Some(current) = queue.pop_front() {
      for edge in self.edges.iter().filter(|e| e.from == current) {
        if !seen[edge.to] {
          seen[edge.to] = true;
          queue.push_back(edge.to);
        }
      }
    }
    if let Some(unreachable) = seen.iter().position(|s| !s) {
      return Err(Error::flow(format!(
        "flow {}: node {} is unreachable from the entry",
        self.id, unreachable
      )));
    }

    Ok(())
  }
}

/// Case-insensitive glob over `*` (any run) and `?` (single character);
/// `*` alone matches anything
pub fn glob_match(pattern: &str, text: &str) -> bool {
  let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
  let text: Vec<char> = text.to_lowercase().chars().collect();

  let (mut p, mut t) = (0usize, 0usize);
  let mut star: Option<(usize, usize)> = None;
  while t < text.len() {
    if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
      p += 1;
      t += 1;
    } else if p < pattern.len() && pattern[p] == '*' {
      star = Some((p, t));
      p += 1;
    } else if let Some((star_p, star_t)) = star {
      p = star_p + 1;
      t = star_t + 1;
      star = Some((star_p, star_t + 1));
    } else {
      return false;
    }
  }
  while p < pattern.len() && pattern[p] == '*' {
    p += 1;
  }
  p == pattern.len()
}

#[cfg(test)]
mod tests {
  use super::*;
  use http::{HeaderMap, Method};
  use serde_json::json;

  fn request(method: Method, url: &str) -> HttpRequest {
    HttpRequest::new(method, url.parse().unwrap(), HeaderMap::new())
  }

  #[test]
  fn glob_grammar() {
    assert!(glob_match("*", "anything at all"));
    assert!(glob_match("*", ""));
    assert!(glob_match("api.test", "API.TEST"));
    assert!(glob_match("*.test", "api.test"));
    assert!(!glob_match("*.test", "api.dev"));
    assert!(glob_match("/v1/*", "/v1/things"));
    assert!(!glob_match("/v1/*", "/v2/things"));
    assert!(glob_match("a?c", "abc"));
    assert!(!glob_match("a?c", "abbc"));
    assert!(glob_match("*middle*", "has middle part"));
  }

  #[test]
  fn match_rule_dimensions() {
    let rule = MatchRule {
      methods: Some(vec!["POST".to_string()]),
      hosts: Some(vec!["api.test".to_string()]),
      paths: Some(vec!["/v1/*".to_string()]),
    };
    assert!(rule.matches(&request(Method::POST, "http://api.test/v1/things")));
    assert!(!rule.matches(&request(Method::GET, "http://api.test/v1/things")));
    assert!(!rule.matches(&request(Method::POST, "http://other.test/v1/things")));
    assert!(!rule.matches(&request(Method::POST, "http://api.test/v2/things")));

    // omission matches anything
    assert!(MatchRule::default().matches(&request(Method::DELETE, "http://x.test/any")));
  }

  fn two_node_flow() -> FlowDefinition {
    FlowDefinition {
      id: "f1".to_string(),
      name: "test".to_string(),
      enabled: true,
      nodes: vec![
        FlowNode::Entry { rule: MatchRule::default() },
        FlowNode::Terminator { mode: TerminatorMode::PassThrough },
      ],
      edges: vec![FlowEdge { from: 0, to: 1, label: None }],
      created_at: Utc::now(),
      updated_at: Utc::now(),
    }
  }

  #[test]
  fn validation_accepts_minimal_flow() {
    assert!(two_node_flow().validate().is_ok());
  }

  #[test]
  fn validation_rejects_bad_shapes() {
    // two entries
    let mut flow = two_node_flow();
    flow.nodes.push(FlowNode::Entry { rule: MatchRule::default() });
    assert!(flow.validate().is_err());

    // terminator with outgoing edge
    let mut flow = two_node_flow();
    flow.edges.push(FlowEdge { from: 1, to: 0, label: None });
    assert!(flow.validate().is_err());

    // unreachable node
    let mut flow = two_node_flow();
    flow.nodes.push(FlowNode::Component {
      component_id: "delay".to_string(),
      params: Map::new(),
    });
    assert!(flow.validate().is_err());

    // unlabeled condition edge
    let mut flow = two_node_flow();
    flow.nodes[1] = FlowNode::Condition { expression: "true".to_string() };
    flow.nodes.push(FlowNode::Terminator { mode: TerminatorMode::PassThrough });
    flow.edges.push(FlowEdge { from: 1, to: 2, label: None });
    assert!(flow.validate().is_err());

    // edge out of range
    let mut flow = two_node_flow();
    flow.edges[0].to = 9;
    assert!(flow.validate().is_err());
  }

  #[test]
  fn documents_round_trip_as_camel_case() {
    let flow = FlowDefinition {
      id: "f1".to_string(),
      name: "mock".to_string(),
      enabled: true,
      nodes: vec![
        FlowNode::Entry {
          rule: MatchRule {
            methods: Some(vec!["POST".to_string()]),
            hosts: None,
            paths: None,
          },
        },
        FlowNode::Component {
          component_id: "mock-response".to_string(),
          params: json!({"statusCode": 201}).as_object().unwrap().clone(),
        },
        FlowNode::Terminator { mode: TerminatorMode::EndWithResponse },
      ],
      edges: vec![
        FlowEdge { from: 0, to: 1, label: None },
        FlowEdge { from: 1, to: 2, label: None },
      ],
      created_at: Utc::now(),
      updated_at: Utc::now(),
    };
    let doc = serde_json::to_value(&flow).unwrap();
    assert_eq!(doc["nodes"][1]["type"], json!("component"));
    assert_eq!(doc["nodes"][1]["componentId"], json!("mock-response"));
    assert_eq!(doc["nodes"][2]["mode"], json!("end_with_response"));

    let parsed: FlowDefinition = serde_json::from_value(doc).unwrap();
    assert!(parsed.validate().is_ok());
    assert_eq!(parsed.entry_index(), Some(0));
  }
}
