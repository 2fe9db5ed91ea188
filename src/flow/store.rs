//! Read-through document stores for flows and components
//!
//! Documents live as JSON arrays in the application data directory. Reads
//! hand out a cheap snapshot; writes are serialized behind the lock, persist
//! to disk, then swap the snapshot. A document that fails to parse or
//! validate is skipped with a log line and never poisons the rest.

use super::model::FlowDefinition;
use crate::component::{builtin_definitions, ComponentDefinition};
use crate::error::{Error, Result};
use chrono::Utc;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

const FLOWS_FILE: &str = "flows.json";
const COMPONENTS_FILE: &str = "components.json";

/// Store of flow documents
pub struct FlowStore {
  path: PathBuf,
  flows: RwLock<Arc<Vec<FlowDefinition>>>,
}

impl FlowStore {
  /// Load from `<dir>/flows.json`, skipping malformed documents
  pub fn load(dir: &Path) -> Self {
    let path = dir.join(FLOWS_FILE);
    let mut flows = Vec::new();
    for value in read_documents(&path) {
      match serde_json::from_value::<FlowDefinition>(value) {
        Ok(flow) => match flow.validate() {
          Ok(()) => flows.push(flow),
          Err(e) => tracing::warn!("skipping invalid flow document: {}", e),
        },
        Err(e) => tracing::warn!("skipping malformed flow document: {}", e),
      }
    }
    flows.sort_by(|a, b| a.id.cmp(&b.id));
    Self {
      path,
      flows: RwLock::new(Arc::new(flows)),
    }
  }

  /// Consistent snapshot for lock-free iteration
  pub fn snapshot(&self) -> Arc<Vec<FlowDefinition>> {
    self.flows.read().expect("flow store lock").clone()
  }

  /// All flows, ordered by id
  pub fn list_all(&self) -> Vec<FlowDefinition> {
    self.snapshot().as_ref().clone()
  }

  /// Lookup by id
  pub fn get_by_id(&self, id: &str) -> Option<FlowDefinition> {
    self.snapshot().iter().find(|f| f.id == id).cloned()
  }

  /// Enabled flows, ordered by id; the engine's deterministic match order
  pub fn enabled(&self) -> Vec<FlowDefinition> {
    self.snapshot().iter().filter(|f| f.enabled).cloned().collect()
  }

  /// Upsert a flow; validation failures reject the save, the update
  /// timestamp is refreshed, and the document set is persisted
  pub fn save(&self, mut flow: FlowDefinition) -> Result<()> {
    flow.validate()?;
    flow.updated_at = Utc::now();
    let mut guard = self.flows.write().expect("flow store lock");
    let mut flows = guard.as_ref().clone();
    match flows.iter_mut().find(|f| f.id == flow.id) {
      Some(existing) => {
        flow.created_at = existing.created_at;
        *existing = flow;
      }
      None => {
        flows.push(flow);
        flows.sort_by(|a, b| a.id.cmp(&b.id));
      }
    }
    persist_documents(&self.path, &flows)?;
    *guard = Arc::new(flows);
    Ok(())
  }

  /// Delete by id
  pub fn delete(&self, id: &str) -> Result<()> {
    let mut guard = self.flows.write().expect("flow store lock");
    let mut flows = guard.as_ref().clone();
    let before = flows.len();
    flows.retain(|f| f.id != id);
    if flows.len() == before {
      return Err(Error::store(format!("flow {} not found", id)));
    }
    persist_documents(&self.path, &flows)?;
    *guard = Arc::new(flows);
    Ok(())
  }

  /// Flip the enabled flag
  pub fn toggle(&self, id: &str, enabled: bool) -> Result<()> {
    let mut guard = self.flows.write().expect("flow store lock");
    let mut flows = guard.as_ref().clone();
    let flow = flows
      .iter_mut()
      .find(|f| f.id == id)
      .ok_or_else(|| Error::store(format!("flow {} not found", id)))?;
    flow.enabled = enabled;
    flow.updated_at = Utc::now();
    persist_documents(&self.path, &flows)?;
    *guard = Arc::new(flows);
    Ok(())
  }
}

/// Store of component documents; builtins are seeded in memory and never
/// written to disk
pub struct ComponentStore {
  path: PathBuf,
  builtins: Vec<ComponentDefinition>,
  scripts: RwLock<Arc<Vec<ComponentDefinition>>>,
}

impl ComponentStore {
  /// Load user components from `<dir>/components.json`, skipping malformed
  /// documents and anything that claims to be a builtin
  pub fn load(dir: &Path) -> Self {
    let path = dir.join(COMPONENTS_FILE);
    let mut scripts = Vec::new();
    for value in read_documents(&path) {
      match serde_json::from_value::<ComponentDefinition>(value) {
        Ok(def) if def.is_builtin() => {
          tracing::warn!("skipping stored builtin definition {}", def.id);
        }
        Ok(def) => scripts.push(def),
        Err(e) => tracing::warn!("skipping malformed component document: {}", e),
      }
    }
    scripts.sort_by(|a, b| a.id.cmp(&b.id));
    Self {
      path,
      builtins: builtin_definitions(),
      scripts: RwLock::new(Arc::new(scripts)),
    }
  }

  /// Builtins first, then user components ordered by id
  pub fn list_all(&self) -> Vec<ComponentDefinition> {
    let mut all = self.builtins.clone();
    all.extend(self.scripts.read().expect("component store lock").iter().cloned());
    all
  }

  /// Lookup by id across builtins and user components
  pub fn get_by_id(&self, id: &str) -> Option<ComponentDefinition> {
    if let Some(builtin) = self.builtins.iter().find(|d| d.id == id) {
      return Some(builtin.clone());
    }
    self
      .scripts
      .read()
      .expect("component store lock")
      .iter()
      .find(|d| d.id == id)
      .cloned()
  }

  /// Upsert a user component; builtin ids are protected and script sources
  /// must compile
  pub fn save(&self, def: ComponentDefinition) -> Result<()> {
    if self.builtins.iter().any(|b| b.id == def.id) {
      return Err(Error::store(format!("component {} is builtin and cannot be overwritten", def.id)));
    }
    match &def.kind {
      crate::component::ComponentKind::Builtin { .. } => {
        return Err(Error::store("user components cannot declare builtin handlers"))
      }
      crate::component::ComponentKind::Script { source } => crate::script::check(source)?,
    }

    let mut guard = self.scripts.write().expect("component store lock");
    let mut scripts = guard.as_ref().clone();
    match scripts.iter_mut().find(|d| d.id == def.id) {
      Some(existing) => *existing = def,
      None => {
        scripts.push(def);
        scripts.sort_by(|a, b| a.id.cmp(&b.id));
      }
    }
    persist_documents(&self.path, &scripts)?;
    *guard = Arc::new(scripts);
    Ok(())
  }

  /// Delete a user component; builtins are protected
  pub fn delete(&self, id: &str) -> Result<()> {
    if self.builtins.iter().any(|b| b.id == id) {
      return Err(Error::store(format!("component {} is builtin and cannot be deleted", id)));
    }
    let mut guard = self.scripts.write().expect("component store lock");
    let mut scripts = guard.as_ref().clone();
    let before = scripts.len();
    scripts.retain(|d| d.id != id);
    if scripts.len() == before {
      return Err(Error::store(format!("component {} not found", id)));
    }
    persist_documents(&self.path, &scripts)?;
    *guard = Arc::new(scripts);
    Ok(())
  }
}

/// Read a JSON array document into raw values; a missing file is empty, a
/// malformed file is logged and treated as empty
fn read_documents(path: &Path) -> Vec<Value> {
  if !path.exists() {
    return Vec::new();
  }
  let content = match std::fs::read_to_string(path) {
    Ok(content) => content,
    Err(e) => {
      tracing::warn!("failed to read {:?}: {}", path, e);
      return Vec::new();
    }
  };
  match serde_json::from_str::<Vec<Value>>(&content) {
    Ok(values) => values,
    Err(e) => {
      tracing::warn!("failed to parse {:?}: {}", path, e);
      Vec::new()
    }
  }
}

fn persist_documents<T: serde::Serialize>(path: &Path, documents: &[T]) -> Result<()> {
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)
      .map_err(|e| Error::store(format!("failed to create {:?}: {}", parent, e)))?;
  }
  let json = serde_json::to_string_pretty(documents)
    .map_err(|e| Error::store(format!("failed to serialize documents: {}", e)))?;
  std::fs::write(path, json).map_err(|e| Error::store(format!("failed to write {:?}: {}", path, e)))
}
