//! Integration tests for the assembled engine, no network involved

use chrono::Utc;
use http::{HeaderMap, Method};
use serde_json::{json, Map, Value};
use wiretap::{
  ComponentDefinition, ComponentKind, EngineConfig, FlowDefinition, FlowEdge, FlowNode,
  HttpRequest, MatchRule, TerminatorMode, Wiretap,
};

fn request(method: Method, url: &str) -> HttpRequest {
  HttpRequest::new(method, url.parse().unwrap(), HeaderMap::new())
}

fn pass_through_flow(id: &str, middle: Vec<FlowNode>) -> FlowDefinition {
  let mut nodes = vec![FlowNode::Entry { rule: MatchRule::default() }];
  let count = middle.len() + 1;
  nodes.extend(middle);
  nodes.push(FlowNode::Terminator { mode: TerminatorMode::PassThrough });
  FlowDefinition {
    id: id.to_string(),
    name: id.to_string(),
    enabled: true,
    nodes,
    edges: (0..count).map(|i| FlowEdge { from: i, to: i + 1, label: None }).collect(),
    created_at: Utc::now(),
    updated_at: Utc::now(),
  }
}

async fn engine(dir: &std::path::Path) -> Wiretap {
  Wiretap::new(dir.to_path_buf(), EngineConfig::default())
    .await
    .expect("engine should assemble")
}

#[tokio::test]
async fn ca_initializes_and_reports_status() {
  let dir = tempfile::tempdir().unwrap();
  let proxy = engine(dir.path()).await;

  let status = proxy.ca_status().await;
  assert!(status.loaded);
  assert_eq!(status.subject, "Wiretap Root CA");
  assert!(status.not_before.is_some());
  assert!(status.not_after.is_some());
  assert!(status.cert_path.exists());

  let pem = proxy.ca().ca_cert_pem().await;
  assert!(pem.contains("BEGIN CERTIFICATE"));
}

#[tokio::test]
async fn builtin_catalog_is_exposed_and_protected() {
  let dir = tempfile::tempdir().unwrap();
  let proxy = engine(dir.path()).await;

  let all = proxy.components().list_all();
  assert!(all.len() >= 18);
  assert!(proxy.components().get_by_id("mock-response").is_some());
  assert!(proxy.components().delete("mock-response").is_err());
}

#[tokio::test]
async fn debug_run_executes_script_component_with_captured_logs() {
  let dir = tempfile::tempdir().unwrap();
  let proxy = engine(dir.path()).await;

  proxy
    .components()
    .save(ComponentDefinition {
      id: "stamp".to_string(),
      display_name: "Stamp".to_string(),
      kind: ComponentKind::Script {
        source: r#"
          function run(config, ctx) {
            ctx.log("stamping " + ctx.request.url);
            return { vars: { stamped: config.label } };
          }
        "#
        .to_string(),
      },
      params: vec![],
    })
    .unwrap();

  let mut params = Map::new();
  params.insert("label".to_string(), json!("v1"));
  proxy
    .flows()
    .save(pass_through_flow(
      "stamp-flow",
      vec![FlowNode::Component {
        component_id: "stamp".to_string(),
        params,
      }],
    ))
    .unwrap();

  let run = proxy
    .debug_run("stamp-flow", request(Method::GET, "http://api.test/v1/x"))
    .await
    .unwrap();
  assert_eq!(run.flow_id, "stamp-flow");
  assert!(run.error.is_none());
  assert_eq!(run.context["vars"]["stamped"], json!("v1"));
  assert!(run.logs.iter().any(|l| l.contains("stamping http://api.test/v1/x")));
  // debug runs never publish to the recorder
  assert!(proxy.recorder().is_empty());
}

#[tokio::test]
async fn flow_store_toggle_changes_matching() {
  let dir = tempfile::tempdir().unwrap();
  let proxy = engine(dir.path()).await;
  proxy.flows().save(pass_through_flow("toggle-me", vec![])).unwrap();

  assert_eq!(proxy.flows().enabled().len(), 1);
  proxy.flows().toggle("toggle-me", false).unwrap();
  assert!(proxy.flows().enabled().is_empty());
}

#[tokio::test]
async fn recorder_round_trips_through_the_facade() {
  let dir = tempfile::tempdir().unwrap();
  let proxy = engine(dir.path()).await;

  let req = request(Method::POST, "http://api.test/v1/things");
  let id = req.id.clone();
  proxy.recorder().insert(wiretap::RequestRecord::new(req));
  proxy.recorder().complete(
    &id,
    Some(wiretap::HttpResponse::synthesized(201, None, "application/json", "{}")),
    7,
  );

  let found = proxy.recorder().query(&wiretap::RecordQuery {
    status: Some(201),
    ..Default::default()
  });
  assert_eq!(found.len(), 1);
  let as_json: Value = found[0].to_json();
  assert_eq!(as_json["durationMs"], json!(7));
  assert_eq!(as_json["request"]["method"], json!("POST"));
}

#[tokio::test]
async fn condition_expression_semantics_follow_the_sandbox() {
  // the exact expression from the product docs
  let ctx = json!({
    "request": {"method": "POST", "url": "http://x.test/", "headers": {}, "body": null},
    "response": null,
    "vars": {},
  });
  assert!(wiretap::eval_condition(r#"ctx.request.method === "POST""#, &ctx));
  assert!(!wiretap::eval_condition(r#"ctx.request.method === "GET""#, &ctx));
  // evaluation failure is false, never an error
  assert!(!wiretap::eval_condition("ctx.response.statusCode > 100", &ctx));
}
