use thiserror::Error;

use crate::services::RecordKind;

/// A failure reported by an invocation body.
///
/// `error_type` is a short classifier ("ValueError", "ModelLoadError", ...)
/// kept alongside the message so clients can group failures without parsing text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error_type}: {message}")]
pub struct InvocationFailure {
  pub error_type: String,
  pub message: String,
}

impl InvocationFailure {
  pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      error_type: error_type.into(),
      message: message.into(),
    }
  }

  /// An input value was missing or had the wrong shape.
  pub fn invalid_input(message: impl Into<String>) -> Self {
    Self::new("ValueError", message)
  }
}

/// Errors from the record storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
  #[error("{kind} record not found: {id}")]
  NotFound { kind: RecordKind, id: String },

  #[error("record storage failed: {message}")]
  Storage { message: String },
}

/// Errors from the model loading collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelLoadError {
  #[error("model not found: {key}")]
  NotFound { key: String },

  #[error("failed to load model '{key}': {message}")]
  Failed { key: String, message: String },
}

impl From<ModelLoadError> for InvocationFailure {
  fn from(e: ModelLoadError) -> Self {
    Self::new("ModelLoadError", e.to_string())
  }
}

impl From<RecordError> for InvocationFailure {
  fn from(e: RecordError) -> Self {
    Self::new("RecordError", e.to_string())
  }
}
