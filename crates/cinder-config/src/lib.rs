//! Cinder Config
//!
//! This crate contains the serializable types that enter the scheduler from the
//! outside: graph definitions submitted as sessions, and the read-only core
//! configuration consulted once at startup.
//!
//! Graph definitions are loaded from:
//! - JSON files (via the CLI)
//! - The session store (as JSON blobs, which is why they must round-trip losslessly)
//!
//! The resolver takes these definitions, validates them against the kind
//! schemas, and produces an execution plan.

mod edge;
mod error;
mod graph;
mod node;
mod settings;

pub use edge::{EdgeDef, FieldRef};
pub use error::ConfigError;
pub use graph::GraphDef;
pub use node::{InputValue, NodeDef};
pub use settings::{CoreConfig, StorageMode};
