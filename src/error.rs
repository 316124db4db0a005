use crate::model::Run;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid parameters: {0}")]
    Parse(String),

    #[error("ledger unavailable: {0}")]
    Storage(String),

    #[error("run {0:?} not found")]
    NotFound(String),

    #[error("all {limit} run slots are busy")]
    Busy { limit: usize },

    /// The run finished but could not be written yet; the ledger keeps it in
    /// its pending buffer until storage recovers.
    #[error("run {} finished but was not persisted: {message}", run.id)]
    Unpersisted { run: Box<Run>, message: String },
}

impl HubError {
    pub fn configuration<T: Into<String>>(message: T) -> Self {
        HubError::Configuration(message.into())
    }

    pub fn parse<T: Into<String>>(message: T) -> Self {
        HubError::Parse(message.into())
    }

    pub fn storage<T: Into<String>>(message: T) -> Self {
        HubError::Storage(message.into())
    }
}
