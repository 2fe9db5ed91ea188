//! Sandboxed scripting surface for user components
//!
//! Scripts run in an isolated expression environment with exactly three
//! names bound: `config` (the coerced parameter map), `ctx` (a deep copy of
//! the component context with a callable `log`), and a restricted `console`
//! whose `log` and `error` both feed the context log. There are no timers,
//! no network access and no module loading.
//!
//! After evaluation, a script that declared a function named `run` has it
//! invoked as `run(config, ctx)` and the return value is taken as the
//! component result. Otherwise the post-execution `ctx` is projected into a
//! result by the dispatcher.

mod interp;
mod lexer;
mod parser;

use crate::error::Result;
pub use interp::truthy;
use interp::Interpreter;
use serde_json::Value;

/// Result of one sandboxed execution.
///
/// `error` is set instead of failing the call so the collected logs survive
/// a throwing script; the dispatcher decides whether to surface it.
#[derive(Debug)]
pub struct ScriptOutcome {
  /// Return value of `run(config, ctx)`, when the script declared one
  pub result: Option<Value>,
  /// Post-execution context snapshot
  pub ctx: Value,
  /// Log lines captured during execution
  pub logs: Vec<String>,
  /// Error message, when the script failed to compile or threw
  pub error: Option<String>,
}

/// Execute a script against a context copy
pub fn execute(source: &str, config: &Value, ctx: Value) -> ScriptOutcome {
  let program = match lexer::tokenize(source).and_then(|tokens| parser::parse_program(&tokens)) {
    Ok(program) => program,
    Err(e) => {
      let message = e.to_string();
      return ScriptOutcome {
        result: None,
        ctx,
        logs: vec![message.clone()],
        error: Some(message),
      };
    }
  };

  let mut interp = Interpreter::new();
  interp.define("config", config.clone());
  interp.define("ctx", ctx.clone());

  if let Err(e) = interp.run_program(&program) {
    let message = e.to_string();
    let mut logs = interp.take_logs();
    logs.push(message.clone());
    return ScriptOutcome {
      result: None,
      ctx: interp.global("ctx").cloned().unwrap_or(ctx),
      logs,
      error: Some(message),
    };
  }

  let mut result = None;
  let mut final_ctx = interp.global("ctx").cloned().unwrap_or(ctx);
  let mut error = None;

  if interp.has_function("run") {
    let args = vec![config.clone(), final_ctx.clone()];
    match interp.call_function("run", args) {
      Ok((value, finals)) => {
        // mutations made through the second parameter stand in for
        // reference semantics on the context
        if let Some(ctx_after) = finals.get(1) {
          final_ctx = ctx_after.clone();
        }
        if !value.is_null() {
          result = Some(value);
        }
      }
      Err(e) => error = Some(e.to_string()),
    }
  }

  let mut logs = interp.take_logs();
  if let Some(message) = &error {
    logs.push(message.clone());
  }

  ScriptOutcome {
    result,
    ctx: final_ctx,
    logs,
    error,
  }
}

/// Evaluate a boolean condition expression against a context.
///
/// Any lexing, parsing or evaluation failure yields `false`; conditions
/// never fail a flow.
pub fn eval_condition(expression: &str, ctx: &Value) -> bool {
  let parsed = match lexer::tokenize(expression).and_then(|tokens| parser::parse_expression(&tokens))
  {
    Ok(expr) => expr,
    Err(e) => {
      tracing::debug!("condition failed to parse: {}", e);
      return false;
    }
  };

  let mut interp = Interpreter::new();
  interp.define("ctx", ctx.clone());
  match interp.eval(&parsed) {
    Ok(value) => truthy(&value),
    Err(e) => {
      tracing::debug!("condition failed to evaluate: {}", e);
      false
    }
  }
}

/// Validate that a script compiles; used by the component store on save
pub fn check(source: &str) -> Result<()> {
  let tokens = lexer::tokenize(source)?;
  parser::parse_program(&tokens)?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn ctx() -> Value {
    json!({
      "request": {
        "method": "POST",
        "url": "http://api.test/v1/things",
        "headers": {"host": "api.test", "content-type": "application/json"},
        "body": "{\"n\":1}",
      },
      "response": null,
      "vars": {},
    })
  }

  #[test]
  fn condition_over_request_method() {
    assert!(eval_condition(r#"ctx.request.method === "POST""#, &ctx()));
    assert!(!eval_condition(r#"ctx.request.method === "GET""#, &ctx()));
  }

  #[test]
  fn condition_with_string_methods_and_logic() {
    let c = ctx();
    assert!(eval_condition(
      r#"ctx.request.url.includes("/v1/") && ctx.request.headers["host"] === "api.test""#,
      &c
    ));
    assert!(eval_condition(r#"ctx.request.method.toLowerCase() === "post""#, &c));
  }

  #[test]
  fn condition_errors_are_false() {
    assert!(!eval_condition("ctx.missing.deep.path === 1", &ctx()));
    assert!(!eval_condition("this is not a script", &ctx()));
    assert!(!eval_condition("", &ctx()));
  }

  #[test]
  fn script_mutates_ctx_without_run() {
    let outcome = execute(
      r#"
        ctx.vars.seen = true;
        ctx.request.headers["x-flag"] = "1";
        console.log("tagged", ctx.request.method);
      "#,
      &json!({}),
      ctx(),
    );
    assert!(outcome.error.is_none());
    assert!(outcome.result.is_none());
    assert_eq!(outcome.ctx["vars"]["seen"], json!(true));
    assert_eq!(outcome.ctx["request"]["headers"]["x-flag"], json!("1"));
    assert_eq!(outcome.logs, vec!["tagged POST"]);
  }

  #[test]
  fn run_convention_returns_component_result() {
    let outcome = execute(
      r#"
        function run(config, ctx) {
          if (ctx.request.method === "POST") {
            return {
              response: { statusCode: 418, body: config.message },
              terminate: true,
            };
          }
          return null;
        }
      "#,
      &json!({"message": "short and stout"}),
      ctx(),
    );
    assert!(outcome.error.is_none());
    let result = outcome.result.unwrap();
    assert_eq!(result["response"]["statusCode"], json!(418));
    assert_eq!(result["response"]["body"], json!("short and stout"));
    assert_eq!(result["terminate"], json!(true));
  }

  #[test]
  fn run_parameter_mutations_are_observed() {
    let outcome = execute(
      r#"
        function run(config, c) {
          c.vars.touched = 1;
          c.log("inside run");
        }
      "#,
      &json!({}),
      ctx(),
    );
    assert!(outcome.error.is_none());
    assert_eq!(outcome.ctx["vars"]["touched"], json!(1));
    assert_eq!(outcome.logs, vec!["inside run"]);
  }

  #[test]
  fn throwing_script_keeps_logs_and_reports_error() {
    let outcome = execute(
      r#"
        console.log("before");
        let x = nosuchname + 1;
        console.log("after");
      "#,
      &json!({}),
      ctx(),
    );
    let error = outcome.error.unwrap();
    assert!(error.contains("nosuchname"));
    assert_eq!(outcome.logs.len(), 2); // "before" plus the error line
    assert_eq!(outcome.logs[0], "before");
  }

  #[test]
  fn sandbox_has_no_ambient_capabilities() {
    for source in [
      "setTimeout(1, 2)",
      "require('fs')",
      "fetch('http://example.test')",
      "process.exit()",
    ] {
      let outcome = execute(source, &json!({}), ctx());
      assert!(outcome.error.is_some(), "{} should not resolve", source);
    }
  }

  #[test]
  fn json_namespace_round_trips() {
    let outcome = execute(
      r#"
        let parsed = JSON.parse(ctx.request.body);
        parsed.n = parsed.n + 1;
        ctx.request.body = JSON.stringify(parsed);
      "#,
      &json!({}),
      ctx(),
    );
    assert!(outcome.error.is_none());
    assert_eq!(outcome.ctx["request"]["body"], json!("{\"n\":2}"));
  }

  #[test]
  fn runaway_recursion_is_cut_off() {
    let outcome = execute("function loop() { return loop(); } loop();", &json!({}), ctx());
    assert!(outcome.error.unwrap().contains("call depth"));
  }

  #[test]
  fn check_accepts_valid_and_rejects_invalid() {
    assert!(check("let a = 1; log(a)").is_ok());
    assert!(check("function run(").is_err());
  }
}
