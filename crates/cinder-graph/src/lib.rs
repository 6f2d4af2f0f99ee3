//! Turns a submitted [`GraphDef`](cinder_config::GraphDef) into an
//! [`ExecutionPlan`].
//!
//! Resolution checks everything that can be checked without running a node:
//! structure, kinds, slot names, types, bindings and iteration scopes. A
//! graph that resolves never fails for structural reasons at run time.

mod error;
mod graph;
mod plan;
mod resolver;

pub use error::ResolutionError;
pub use graph::Graph;
pub use plan::{ExecutionPlan, NodeRole, PlanStep, PlannedNode, instance_id};
pub use resolver::Resolver;
