//! Interfaces to external collaborators.
//!
//! The scheduler never touches record storage or model files directly. Bodies
//! reach them through these traits, injected via [`Services`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ModelLoadError, RecordError};

/// The kinds of record the storage collaborator keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
  Board,
  Image,
  Workflow,
  Tensor,
  Conditioning,
  Value,
}

impl fmt::Display for RecordKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      RecordKind::Board => "board",
      RecordKind::Image => "image",
      RecordKind::Workflow => "workflow",
      RecordKind::Tensor => "tensor",
      RecordKind::Conditioning => "conditioning",
      RecordKind::Value => "value",
    };
    f.write_str(name)
  }
}

/// CRUD access to records keyed by opaque identifiers.
#[async_trait]
pub trait RecordStore: Send + Sync {
  async fn get(&self, kind: RecordKind, id: &str) -> Result<serde_json::Value, RecordError>;

  /// Store a value and return its new identifier.
  async fn put(&self, kind: RecordKind, value: serde_json::Value) -> Result<String, RecordError>;

  async fn delete(&self, kind: RecordKind, id: &str) -> Result<(), RecordError>;
}

/// In-memory record storage.
#[derive(Default)]
pub struct MemoryRecordStore {
  records: RwLock<HashMap<(RecordKind, String), serde_json::Value>>,
}

impl MemoryRecordStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn poisoned() -> RecordError {
    RecordError::Storage {
      message: "record lock poisoned".to_string(),
    }
  }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
  async fn get(&self, kind: RecordKind, id: &str) -> Result<serde_json::Value, RecordError> {
    let records = self.records.read().map_err(|_| Self::poisoned())?;
    records
      .get(&(kind, id.to_string()))
      .cloned()
      .ok_or_else(|| RecordError::NotFound {
        kind,
        id: id.to_string(),
      })
  }

  async fn put(&self, kind: RecordKind, value: serde_json::Value) -> Result<String, RecordError> {
    let id = uuid::Uuid::new_v4().to_string();
    let mut records = self.records.write().map_err(|_| Self::poisoned())?;
    records.insert((kind, id.clone()), value);
    Ok(id)
  }

  async fn delete(&self, kind: RecordKind, id: &str) -> Result<(), RecordError> {
    let mut records = self.records.write().map_err(|_| Self::poisoned())?;
    records
      .remove(&(kind, id.to_string()))
      .map(|_| ())
      .ok_or_else(|| RecordError::NotFound {
        kind,
        id: id.to_string(),
      })
  }
}

/// Reference to a model known to the model manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
  pub key: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub submodel: Option<String>,
}

/// A loaded model. Opaque to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHandle {
  pub key: String,
  #[serde(default)]
  pub metadata: serde_json::Value,
}

/// Loads models on behalf of invocation bodies.
#[async_trait]
pub trait ModelLoader: Send + Sync {
  async fn load(&self, model: &ModelRef) -> Result<ModelHandle, ModelLoadError>;
}

/// A loader with no models installed. Every load fails with `NotFound`.
#[derive(Debug, Clone, Default)]
pub struct NullModelLoader;

#[async_trait]
impl ModelLoader for NullModelLoader {
  async fn load(&self, model: &ModelRef) -> Result<ModelHandle, ModelLoadError> {
    Err(ModelLoadError::NotFound {
      key: model.key.clone(),
    })
  }
}

/// Collaborator handles passed into every invocation.
#[derive(Clone)]
pub struct Services {
  pub records: Arc<dyn RecordStore>,
  pub models: Arc<dyn ModelLoader>,
}

impl Services {
  pub fn new(records: Arc<dyn RecordStore>, models: Arc<dyn ModelLoader>) -> Self {
    Self { records, models }
  }
}

impl Default for Services {
  fn default() -> Self {
    Self {
      records: Arc::new(MemoryRecordStore::new()),
      models: Arc::new(NullModelLoader),
    }
  }
}
