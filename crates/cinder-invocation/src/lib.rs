//! Cinder Invocation
//!
//! Everything the scheduler needs to know about *what* an invocation is,
//! without caring what it computes:
//!
//! - [`SlotType`] and [`KindSchema`] declare the typed input/output slots of a kind
//! - [`Invocation`] is the body of a kind; [`FnInvocation`] wraps a pure closure
//! - [`InvocationRegistry`] maps kind names to bodies
//! - [`InvocationContext`] carries the cancellation token and [`Services`] into a body
//! - [`RecordStore`] and [`ModelLoader`] are the narrow interfaces to external
//!   collaborators
//!
//! The built-in kinds (see [`builtins`]) are trivial; they exist so graphs can be
//! built and run without any model code.

pub mod builtins;
mod error;
mod invocation;
mod registry;
mod services;
mod types;

pub use error::{InvocationFailure, ModelLoadError, RecordError};
pub use invocation::{FnInvocation, Invocation, InvocationContext, require, require_i64};
pub use registry::InvocationRegistry;
pub use services::{
  MemoryRecordStore, ModelHandle, ModelLoader, ModelRef, NullModelLoader, RecordKind, RecordStore,
  Services,
};
pub use types::{InputSlot, Inputs, KindSchema, OutputSlot, Outputs, SlotType};
