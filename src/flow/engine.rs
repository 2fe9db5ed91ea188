//! Flow matching and graph execution
//!
//! The engine walks a matched flow node-by-node: components dispatch to
//! builtin handlers or the script sandbox and merge their results into the
//! context, conditions pick a labeled branch, terminators decide whether the
//! walk yields a synthesized response or passes through to upstream.

use super::model::{FlowDefinition, FlowNode, TerminatorMode};
use super::store::{ComponentStore, FlowStore};
use crate::component::{
  coerce_params, result_from_ctx_snapshot, result_from_script, Builtin, ComponentContext,
  ComponentKind, ComponentResult, LogSink,
};
use crate::error::{Error, Result};
use crate::message::{HttpRequest, HttpResponse};
use crate::script;
use serde_json::Value;
use std::sync::Arc;

/// Hard cap on nodes visited in one walk; well above any reasonable graph
const MAX_STEPS: usize = 256;

/// What the pipeline decided for one request
pub struct FlowOutcome {
  /// The possibly-mutated request
  pub request: HttpRequest,
  /// A response to serialize directly to the client instead of forwarding
  pub response: Option<HttpResponse>,
  /// Id of the flow that matched, if any
  pub matched_flow: Option<String>,
}

/// Result of a debug execution: the final context snapshot plus captured
/// logs, never touching the network or the recorder
pub struct DebugRun {
  pub flow_id: String,
  /// Final context snapshot as JSON
  pub context: Value,
  /// Log lines captured during the run
  pub logs: Vec<String>,
  /// First component error observed, if any
  pub error: Option<String>,
}

struct WalkEnd {
  response: Option<HttpResponse>,
  first_error: Option<String>,
}

/// Matches requests to flows and drives their execution
pub struct FlowEngine {
  flows: Arc<FlowStore>,
  components: Arc<ComponentStore>,
}

impl FlowEngine {
  pub fn new(flows: Arc<FlowStore>, components: Arc<ComponentStore>) -> Self {
    Self { flows, components }
  }

  /// First enabled flow whose entry matches, in flow id order
  pub fn match_flow(&self, request: &HttpRequest) -> Option<FlowDefinition> {
    self.flows.enabled().into_iter().find(|flow| flow.matches(request))
  }

  /// Run the pipeline for a live request
  pub async fn process(&self, request: HttpRequest) -> FlowOutcome {
    let Some(flow) = self.match_flow(&request) else {
      return FlowOutcome {
        request,
        response: None,
        matched_flow: None,
      };
    };

    tracing::debug!("request {} matched flow {}", request.id, flow.id);
    let mut ctx = ComponentContext::new(request, LogSink::Tracing);
    let end = self.walk(&flow, &mut ctx).await;
    FlowOutcome {
      request: ctx.request,
      response: end.response,
      matched_flow: Some(flow.id),
    }
  }

  /// Run a specific flow against a supplied request, capturing logs and the
  /// final context; the entry match rule is not consulted
  pub async fn debug_run(&self, flow_id: &str, request: HttpRequest) -> Result<DebugRun> {
    let flow = self
      .flows
      .get_by_id(flow_id)
      .ok_or_else(|| Error::flow(format!("flow {} not found", flow_id)))?;

    let (sink, buffer) = LogSink::capture();
    let mut ctx = ComponentContext::new(request, sink);
    let end = self.walk(&flow, &mut ctx).await;

    // a synthesized end is part of the snapshot the caller inspects
    if let Some(response) = end.response {
      ctx.response = Some(response);
    }
    let context = ctx.to_json();
    let logs = buffer.lock().expect("log buffer").clone();
    Ok(DebugRun {
      flow_id: flow.id,
      context,
      logs,
      error: end.first_error,
    })
  }

  async fn walk(&self, flow: &FlowDefinition, ctx: &mut ComponentContext) -> WalkEnd {
    let mut first_error: Option<String> = None;
    let record_error = |e: String, first: &mut Option<String>| {
      if first.is_none() {
        *first = Some(e);
      }
    };

    let Some(mut current) = flow.entry_index() else {
      return WalkEnd {
        response: None,
        first_error: Some(format!("flow {} has no entry node", flow.id)),
      };
    };

    for _ in 0..MAX_STEPS {
      match &flow.nodes[current] {
        FlowNode::Entry { .. } => match flow.successor(current) {
          Some(next) => current = next,
          None => break,
        },
        FlowNode::Component { component_id, params } => {
          match self.dispatch(component_id, params, ctx).await {
            Ok(result) => {
              ctx.merge(&result);
              if result.terminate {
                return WalkEnd {
                  response: ctx.response.clone(),
                  first_error,
                };
              }
            }
            Err(e) => {
              // a failing component never fails the request; log and keep
              // walking the normal successor
              let line = format!("component {} failed: {}", component_id, e);
              ctx.log.log(line.clone());
              record_error(line, &mut first_error);
            }
          }
          match flow.successor(current) {
            Some(next) => current = next,
            None => break,
          }
        }
        FlowNode::Condition { expression } => {
          let outcome = script::eval_condition(expression, &ctx.to_json());
          let label = if outcome { "true" } else { "false" };
          match flow.labeled_successor(current, label) {
            Some(next) => current = next,
            // no matching labeled edge: the walk ends at this node
            None => break,
          }
        }
        FlowNode::Terminator { mode } => {
          let response = match mode {
            TerminatorMode::EndWithResponse => ctx.response.clone(),
            // terminator mode alone decides: pass through forwards
            // upstream even when a component installed a response
            TerminatorMode::PassThrough => None,
          };
          return WalkEnd {
            response,
            first_error,
          };
        }
      }
    }

    WalkEnd {
      response: None,
      first_error,
    }
  }

  async fn dispatch(
    &self,
    component_id: &str,
    raw_params: &serde_json::Map<String, Value>,
    ctx: &mut ComponentContext,
  ) -> Result<ComponentResult> {
    let def = self
      .components
      .get_by_id(component_id)
      .ok_or_else(|| Error::component(format!("unknown component {}", component_id)))?;
    let params = coerce_params(&def.params, raw_params)?;

    match &def.kind {
      ComponentKind::Builtin { name } => {
        let builtin = Builtin::from_name(name)
          .ok_or_else(|| Error::component(format!("unknown builtin {}", name)))?;
        builtin.execute(&params, ctx).await
      }
      ComponentKind::Script { source } => {
        let config = Value::Object(params);
        let outcome = script::execute(source, &config, ctx.to_json());
        ctx.log.extend(outcome.logs.clone());
        if let Some(error) = outcome.error {
          return Err(Error::script(error));
        }
        match outcome.result {
          Some(result) => result_from_script(&result, ctx),
          None => result_from_ctx_snapshot(&outcome.ctx, ctx),
        }
      }
    }
  }
}
