use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatsError {
  #[error("no statistics recorded for session: {0}")]
  UnknownSession(String),
}
