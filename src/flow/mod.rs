//! User-authored flow graphs: model, stores and the execution engine

mod engine;
mod model;
mod store;

pub use engine::{DebugRun, FlowEngine, FlowOutcome};
pub use model::{glob_match, FlowDefinition, FlowEdge, FlowNode, MatchRule, TerminatorMode};
pub use store::{ComponentStore, FlowStore};
