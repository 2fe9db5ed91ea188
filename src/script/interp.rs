//! Tree-walking evaluator for the sandbox language
//!
//! Values are `serde_json::Value`; the only host surface is the log sink
//! (`console.log`, `console.error`, `ctx.log`) and the `JSON`
//! parse/stringify pair. There is deliberately nothing to reach timers,
//! sockets or the filesystem with.

use super::parser::{BinOp, Expr, Stmt, UnaryOp};
use crate::error::{Error, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Evaluation step budget
const STEP_LIMIT: usize = 100_000;
/// Maximum user-function call depth; keeps runaway recursion off the host
/// stack
const CALL_DEPTH_LIMIT: usize = 64;

enum Flow {
  Normal,
  Return(Value),
}

pub struct Interpreter {
  scopes: Vec<HashMap<String, Value>>,
  functions: HashMap<String, (Vec<String>, Vec<Stmt>)>,
  logs: Vec<String>,
  steps: usize,
  depth: usize,
}

impl Interpreter {
  pub fn new() -> Self {
    Self {
      scopes: vec![HashMap::new()],
      functions: HashMap::new(),
      logs: Vec::new(),
      steps: 0,
      depth: 0,
    }
  }

  /// Bind a name in the global scope
  pub fn define(&mut self, name: &str, value: Value) {
    self.scopes[0].insert(name.to_string(), value);
  }

  /// Current value of a global binding
  pub fn global(&self, name: &str) -> Option<&Value> {
    self.scopes[0].get(name)
  }

  /// Whether a function with this name was declared
  pub fn has_function(&self, name: &str) -> bool {
    self.functions.contains_key(name)
  }

  /// Collected log lines
  pub fn take_logs(&mut self) -> Vec<String> {
    std::mem::take(&mut self.logs)
  }

  /// Run a whole program: function declarations are hoisted, then the
  /// remaining statements execute in order
  pub fn run_program(&mut self, program: &[Stmt]) -> Result<()> {
    for stmt in program {
      if let Stmt::Function(name, params, body) = stmt {
        self.functions.insert(name.clone(), (params.clone(), body.clone()));
      }
    }
    for stmt in program {
      if matches!(stmt, Stmt::Function(..)) {
        continue;
      }
      if let Flow::Return(_) = self.exec_stmt(stmt)? {
        break;
      }
    }
    Ok(())
  }

  /// Call a declared function; returns its return value and the final values
  /// of its parameter bindings (the caller uses these to observe context
  /// mutations made through a parameter)
  pub fn call_function(&mut self, name: &str, args: Vec<Value>) -> Result<(Value, Vec<Value>)> {
    if self.depth >= CALL_DEPTH_LIMIT {
      return Err(Error::script("call depth exceeded"));
    }
    self.depth += 1;
    let result = self.call_function_inner(name, args);
    self.depth -= 1;
    result
  }

  fn call_function_inner(&mut self, name: &str, args: Vec<Value>) -> Result<(Value, Vec<Value>)> {
    let (params, body) = self
      .functions
      .get(name)
      .cloned()
      .ok_or_else(|| Error::script(format!("function {} is not defined", name)))?;

    let mut frame = HashMap::new();
    for (i, param) in params.iter().enumerate() {
      frame.insert(param.clone(), args.get(i).cloned().unwrap_or(Value::Null));
    }

    // functions see the globals and their own frame, nothing in between
    let saved: Vec<HashMap<String, Value>> = self.scopes.drain(1..).collect();
    self.scopes.push(frame);

    let mut result = Value::Null;
    let mut error = None;
    for stmt in &body {
      match self.exec_stmt(stmt) {
        Ok(Flow::Return(value)) => {
          result = value;
          break;
        }
        Ok(Flow::Normal) => {}
        Err(e) => {
          error = Some(e);
          break;
        }
      }
    }

    let frame = self.scopes.pop().unwrap_or_default();
    self.scopes.extend(saved);
    if let Some(e) = error {
      return Err(e);
    }

    let finals = params
      .iter()
      .map(|p| frame.get(p).cloned().unwrap_or(Value::Null))
      .collect();
    Ok((result, finals))
  }

  /// Evaluate a standalone expression
  pub fn eval(&mut self, expr: &Expr) -> Result<Value> {
    self.eval_expr(expr)
  }

  fn tick(&mut self) -> Result<()> {
    self.steps += 1;
    if self.steps > STEP_LIMIT {
      return Err(Error::script("step budget exceeded"));
    }
    Ok(())
  }

  fn exec_stmt(&mut self, stmt: &Stmt) -> Result<Flow> {
    self.tick()?;
    match stmt {
      Stmt::Let(name, expr) => {
        let value = self.eval_expr(expr)?;
        self
          .scopes
          .last_mut()
          .expect("scope stack")
          .insert(name.clone(), value);
        Ok(Flow::Normal)
      }
      Stmt::Assign(target, expr) => {
        let value = self.eval_expr(expr)?;
        self.assign(target, value)?;
        Ok(Flow::Normal)
      }
      Stmt::If(condition, then_branch, else_branch) => {
        if truthy(&self.eval_expr(condition)?) {
          self.exec_block(then_branch)
        } else if let Some(else_branch) = else_branch {
          self.exec_block(else_branch)
        } else {
          Ok(Flow::Normal)
        }
      }
      Stmt::Return(expr) => {
        let value = match expr {
          Some(expr) => self.eval_expr(expr)?,
          None => Value::Null,
        };
        Ok(Flow::Return(value))
      }
      Stmt::Expr(expr) => {
        self.eval_expr(expr)?;
        Ok(Flow::Normal)
      }
      Stmt::Function(name, params, body) => {
        self.functions.insert(name.clone(), (params.clone(), body.clone()));
        Ok(Flow::Normal)
      }
    }
  }

  fn exec_block(&mut self, stmts: &[Stmt]) -> Result<Flow> {
    for stmt in stmts {
      if let Flow::Return(value) = self.exec_stmt(stmt)? {
        return Ok(Flow::Return(value));
      }
    }
    Ok(Flow::Normal)
  }

  fn eval_expr(&mut self, expr: &Expr) -> Result<Value> {
    self.tick()?;
    match expr {
      Expr::Null => Ok(Value::Null),
      Expr::Bool(b) => Ok(Value::Bool(*b)),
      Expr::Num(n) => Ok(num(*n)),
      Expr::Str(s) => Ok(Value::String(s.clone())),
      Expr::Ident(name) => self
        .lookup(name)
        .cloned()
        .ok_or_else(|| Error::script(format!("{} is not defined", name))),
      Expr::Array(items) => {
        let mut values = Vec::with_capacity(items.len());
        for item in items {
          values.push(self.eval_expr(item)?);
        }
        Ok(Value::Array(values))
      }
      Expr::Object(entries) => {
        let mut map = Map::new();
        for (key, value) in entries {
          map.insert(key.clone(), self.eval_expr(value)?);
        }
        Ok(Value::Object(map))
      }
      Expr::Member(base, name) => {
        let base = self.eval_expr(base)?;
        member(&base, name)
      }
      Expr::Index(base, index) => {
        let base = self.eval_expr(base)?;
        let index = self.eval_expr(index)?;
        match (&base, &index) {
          (Value::Array(items), _) => {
            let i = to_number(&index)
              .ok_or_else(|| Error::script("array index must be a number"))?;
            Ok(items.get(i as usize).cloned().unwrap_or(Value::Null))
          }
          (Value::Object(map), Value::String(key)) => {
            Ok(map.get(key).cloned().unwrap_or(Value::Null))
          }
          (Value::String(s), _) => {
            let i = to_number(&index)
              .ok_or_else(|| Error::script("string index must be a number"))?;
            Ok(
              s.chars()
                .nth(i as usize)
                .map(|c| Value::String(c.to_string()))
                .unwrap_or(Value::Null),
            )
          }
          _ => Err(Error::script("cannot index this value")),
        }
      }
      Expr::Call(callee, args) => self.eval_call(callee, args),
      Expr::Unary(op, operand) => {
        let value = self.eval_expr(operand)?;
        match op {
          UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
          UnaryOp::Neg => {
            let n = to_number(&value).ok_or_else(|| Error::script("cannot negate non-number"))?;
            Ok(num(-n))
          }
        }
      }
      Expr::Binary(op, left, right) => self.eval_binary(*op, left, right),
    }
  }

  fn eval_binary(&mut self, op: BinOp, left: &Expr, right: &Expr) -> Result<Value> {
    // short-circuiting forms first
    match op {
      BinOp::And => {
        let l = self.eval_expr(left)?;
        if !truthy(&l) {
          return Ok(l);
        }
        return self.eval_expr(right);
      }
      BinOp::Or => {
        let l = self.eval_expr(left)?;
        if truthy(&l) {
          return Ok(l);
        }
        return self.eval_expr(right);
      }
      _ => {}
    }

    let l = self.eval_expr(left)?;
    let r = self.eval_expr(right)?;
    match op {
      BinOp::StrictEq => Ok(Value::Bool(strict_eq(&l, &r))),
      BinOp::StrictNotEq => Ok(Value::Bool(!strict_eq(&l, &r))),
      BinOp::Eq => Ok(Value::Bool(loose_eq(&l, &r))),
      BinOp::NotEq => Ok(Value::Bool(!loose_eq(&l, &r))),
      BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
        let ordering = compare(&l, &r)?;
        Ok(Value::Bool(match op {
          BinOp::Lt => ordering.is_lt(),
          BinOp::Le => ordering.is_le(),
          BinOp::Gt => ordering.is_gt(),
          _ => ordering.is_ge(),
        }))
      }
      BinOp::Add => {
        if l.is_string() || r.is_string() {
          Ok(Value::String(format!("{}{}", display(&l), display(&r))))
        } else {
          let (a, b) = numeric_pair(&l, &r)?;
          Ok(num(a + b))
        }
      }
      BinOp::Sub => {
        let (a, b) = numeric_pair(&l, &r)?;
        Ok(num(a - b))
      }
      BinOp::Mul => {
        let (a, b) = numeric_pair(&l, &r)?;
        Ok(num(a * b))
      }
      BinOp::Div => {
        let (a, b) = numeric_pair(&l, &r)?;
        Ok(num(a / b))
      }
      BinOp::Rem => {
        let (a, b) = numeric_pair(&l, &r)?;
        Ok(num(a % b))
      }
      BinOp::And | BinOp::Or => unreachable!("handled above"),
    }
  }

  fn eval_call(&mut self, callee: &Expr, args: &[Expr]) -> Result<Value> {
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
      values.push(self.eval_expr(arg)?);
    }

    match callee {
      // console.log / console.error and the bare log() shorthand
      Expr::Member(base, method)
        if matches!(base.as_ref(), Expr::Ident(name) if name == "console")
          && (method == "log" || method == "error") =>
      {
        let prefix = if method == "error" { "[error] " } else { "" };
        self.log_values(prefix, &values);
        Ok(Value::Null)
      }
      Expr::Ident(name) if name == "log" => {
        self.log_values("", &values);
        Ok(Value::Null)
      }
      // JSON.parse / JSON.stringify
      Expr::Member(base, method)
        if matches!(base.as_ref(), Expr::Ident(name) if name == "JSON") =>
      {
        match method.as_str() {
          "parse" => {
            let text = values
              .first()
              .and_then(Value::as_str)
              .ok_or_else(|| Error::script("JSON.parse expects a string"))?;
            serde_json::from_str(text).map_err(|e| Error::script(format!("JSON.parse: {}", e)))
          }
          "stringify" => {
            let value = values.first().cloned().unwrap_or(Value::Null);
            Ok(Value::String(
              serde_json::to_string(&value).unwrap_or_else(|_| "null".to_string()),
            ))
          }
          other => Err(Error::script(format!("JSON.{} is not available", other))),
        }
      }
      Expr::Member(base, method) => {
        let base_value = self.eval_expr(base)?;
        // any object exposing `log` routes to the context log; this covers
        // ctx.log whatever the parameter is named inside run()
        if method == "log" && base_value.is_object() {
          self.log_values("", &values);
          return Ok(Value::Null);
        }
        method_call(&base_value, method, &values)
      }
      Expr::Ident(name) => {
        let (result, _) = self.call_function(name, values)?;
        Ok(result)
      }
      _ => Err(Error::script("value is not callable")),
    }
  }

  fn log_values(&mut self, prefix: &str, values: &[Value]) {
    let line = values.iter().map(display).collect::<Vec<_>>().join(" ");
    self.logs.push(format!("{}{}", prefix, line));
  }

  fn lookup(&self, name: &str) -> Option<&Value> {
    self.scopes.iter().rev().find_map(|scope| scope.get(name))
  }

  fn assign(&mut self, target: &Expr, value: Value) -> Result<()> {
    // flatten the target into a root identifier and a path of segments,
    // evaluating index expressions up front
    let mut segments = Vec::new();
    let mut current = target;
    let root = loop {
      match current {
        Expr::Ident(name) => break name.clone(),
        Expr::Member(base, name) => {
          segments.push(Segment::Key(name.clone()));
          current = base;
        }
        Expr::Index(base, index) => {
          let index = self.eval_expr(index)?;
          segments.push(match index {
            Value::String(key) => Segment::Key(key),
            other => Segment::Index(
              to_number(&other).ok_or_else(|| Error::script("invalid index"))? as usize,
            ),
          });
          current = base;
        }
        _ => return Err(Error::script("invalid assignment target")),
      }
    };
    segments.reverse();

    if segments.is_empty() {
      // plain identifier: update the innermost binding or create one
      for scope in self.scopes.iter_mut().rev() {
        if scope.contains_key(&root) {
          scope.insert(root, value);
          return Ok(());
        }
      }
      self.scopes.last_mut().expect("scope stack").insert(root, value);
      return Ok(());
    }

    let slot = self
      .scopes
      .iter_mut()
      .rev()
      .find_map(|scope| scope.get_mut(&root))
      .ok_or_else(|| Error::script(format!("{} is not defined", root)))?;

    let mut cursor = slot;
    for (i, segment) in segments.iter().enumerate() {
      let last = i == segments.len() - 1;
      match segment {
        Segment::Key(key) => {
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
        Segment::Index(index) => {
          let items = cursor
            .as_array_mut()
            .ok_or_else(|| Error::script("cannot index into non-array"))?;
          if *index >= items.len() {
            return Err(Error::script("array index out of bounds"));
          }
          if last {
            items[*index] = value;
            return Ok(());
          }
          cursor = &mut items[*index];
        }
      }
    }
    Ok(())
  }
}

enum Segment {
  Key(String),
  Index(usize),
}

/// Member access; `length` works on strings and arrays, missing object keys
/// read as null
fn member(base: &Value, name: &str) -> Result<Value> {
  match base {
    Value::Object(map) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
    Value::String(s) if name == "length" => Ok(num(s.chars().count() as f64)),
    Value::Array(items) if name == "length" => Ok(num(items.len() as f64)),
    Value::Null => Err(Error::script(format!("cannot read property {} of null", name))),
    _ => Ok(Value::Null),
  }
}

/// Built-in methods on strings and arrays
fn method_call(base: &Value, method: &str, args: &[Value]) -> Result<Value> {
  match base {
    Value::String(s) => {
      let arg = || args.first().and_then(Value::as_str).unwrap_or_default().to_string();
      match method {
        "includes" => Ok(Value::Bool(s.contains(&arg()))),
        "startsWith" => Ok(Value::Bool(s.starts_with(&arg()))),
        "endsWith" => Ok(Value::Bool(s.ends_with(&arg()))),
        "toLowerCase" => Ok(Value::String(s.to_lowercase())),
        "toUpperCase" => Ok(Value::String(s.to_uppercase())),
        "trim" => Ok(Value::String(s.trim().to_string())),
        other => Err(Error::script(format!("string has no method {}", other))),
      }
    }
    Value::Array(items) => match method {
      "includes" => {
        let needle = args.first().cloned().unwrap_or(Value::Null);
        Ok(Value::Bool(items.iter().any(|item| strict_eq(item, &needle))))
      }
      other => Err(Error::script(format!("array has no method {}", other))),
    },
    _ => Err(Error::script(format!("value has no method {}", method))),
  }
}

/// Construct a numeric value, preferring integers when exact
pub fn num(n: f64) -> Value {
  if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
    Value::from(n as i64)
  } else {
    Value::from(n)
  }
}

pub fn truthy(value: &Value) -> bool {
  match value {
    Value::Null => false,
    Value::Bool(b) => *b,
    Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
    Value::String(s) => !s.is_empty(),
    Value::Array(_) | Value::Object(_) => true,
  }
}

fn to_number(value: &Value) -> Option<f64> {
  match value {
    Value::Number(n) => n.as_f64(),
    Value::String(s) => s.trim().parse().ok(),
    Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
    _ => None,
  }
}

fn strict_eq(a: &Value, b: &Value) -> bool {
  match (a, b) {
    (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
    _ => a == b,
  }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
  if strict_eq(a, b) {
    return true;
  }
  match (a, b) {
    (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
      match (to_number(a), to_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
      }
    }
    _ => false,
  }
}

fn compare(a: &Value, b: &Value) -> Result<std::cmp::Ordering> {
  match (a, b) {
    (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
    _ => {
      let x = to_number(a).ok_or_else(|| Error::script("cannot compare these values"))?;
      let y = to_number(b).ok_or_else(|| Error::script("cannot compare these values"))?;
      x.partial_cmp(&y)
        .ok_or_else(|| Error::script("cannot compare these values"))
    }
  }
}

fn display(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    Value::Null => "null".to_string(),
    other => other.to_string(),
  }
}

fn numeric_pair(l: &Value, r: &Value) -> Result<(f64, f64)> {
  let a = to_number(l).ok_or_else(|| Error::script("expected a number"))?;
  let b = to_number(r).ok_or_else(|| Error::script("expected a number"))?;
  Ok((a, b))
}
