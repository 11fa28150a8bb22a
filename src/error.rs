use thiserror::Error;

/// Errors returned synchronously by [`crate::TaskGroup::spawn`].
///
/// Failures inside a payload never show up here; they are recorded as
/// [`crate::Outcome::Failed`] in the group's outcome mapping.
#[derive(Error, Debug)]
pub enum TaskGroupError {
    #[error("Duplicate task label: {0}")]
    DuplicateLabel(String),

    #[error("Task group is sealed: wait_all has already returned")]
    Sealed,

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TaskGroupError>;
