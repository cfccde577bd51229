use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskErrorKind {
    /// Engine not initialized or not answering. Fatal before the first trial.
    EngineUnavailable,
    /// Parameter name outside the recognized set, or a value of the wrong shape.
    MalformedParameter,
    /// Instrumentation record for a trial that is no longer current.
    StaleEvent,
    /// Fewer finalized trials than planned.
    IncompleteSession,
    /// Output target already holds data that cannot be appended to.
    PersistenceConflict,
    /// A host call failed after setup.
    Engine,
    Storage,
}

impl TaskErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskErrorKind::EngineUnavailable => "engine_unavailable",
            TaskErrorKind::MalformedParameter => "malformed_parameter",
            TaskErrorKind::StaleEvent => "stale_event",
            TaskErrorKind::IncompleteSession => "incomplete_session",
            TaskErrorKind::PersistenceConflict => "persistence_conflict",
            TaskErrorKind::Engine => "engine",
            TaskErrorKind::Storage => "storage",
        }
    }

    /// Anomalies that are absorbed locally and never abort a session.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TaskErrorKind::StaleEvent | TaskErrorKind::IncompleteSession)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for TaskError {}

impl From<rusqlite::Error> for TaskError {
    fn from(err: rusqlite::Error) -> Self {
        storage_error(err.to_string())
    }
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        storage_error(err.to_string())
    }
}

pub fn engine_unavailable(message: impl Into<String>) -> TaskError {
    TaskError::new(TaskErrorKind::EngineUnavailable, message)
}

pub fn malformed_parameter(message: impl Into<String>) -> TaskError {
    TaskError::new(TaskErrorKind::MalformedParameter, message)
}

pub fn stale_event(message: impl Into<String>) -> TaskError {
    TaskError::new(TaskErrorKind::StaleEvent, message)
}

pub fn incomplete_session(message: impl Into<String>) -> TaskError {
    TaskError::new(TaskErrorKind::IncompleteSession, message)
}

pub fn persistence_conflict(message: impl Into<String>) -> TaskError {
    TaskError::new(TaskErrorKind::PersistenceConflict, message)
}

pub fn engine_error(message: impl Into<String>) -> TaskError {
    TaskError::new(TaskErrorKind::Engine, message)
}

pub fn storage_error(message: impl Into<String>) -> TaskError {
    TaskError::new(TaskErrorKind::Storage, message)
}

pub type TaskResult<T> = Result<T, TaskError>;
