use thiserror::Error;

/// Errors that abort a flow run.
#[derive(Debug, Error)]
pub enum FlowError {
    /// A start id or a `next` id names a task that was never registered.
    #[error("Task {0} not found")]
    UnknownTask(String),

    /// The task action returned an error or panicked.
    #[error("Task '{0}' failed: {1:#}")]
    TaskFailed(String, anyhow::Error),

    #[error("Failed to build worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("Failed to start stream driver thread")]
    Spawn(#[from] std::io::Error),

    #[error("Flow driver stopped without reporting an outcome")]
    Disconnected,
}

impl FlowError {
    /// The id of the task this error is about, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            FlowError::UnknownTask(id) | FlowError::TaskFailed(id, _) => Some(id),
            FlowError::Pool(_) | FlowError::Spawn(_) | FlowError::Disconnected => None,
        }
    }

    /// The original error raised by a failing task action.
    pub fn cause(&self) -> Option<&anyhow::Error> {
        match self {
            FlowError::TaskFailed(_, cause) => Some(cause),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Key {key} does not hold a value of type {expected}")]
    WrongType { key: String, expected: &'static str },
}
