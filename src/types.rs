//! Shared task model: lifecycle states, outcomes, and the payload abstraction.

use std::collections::{BTreeMap, HashMap, btree_map};
use std::fmt;

/// Label identifying a task within its group.
pub type Label = String;

/// Lifecycle of a single task. Terminal states are sinks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    /// True for `Completed` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a payload terminated abnormally.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskFailure {
    /// The payload returned `Err`; holds its `Display` rendering.
    Error(String),
    /// The payload panicked; holds the panic message when it was a string.
    Panicked(String),
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFailure::Error(reason) => write!(f, "error: {reason}"),
            TaskFailure::Panicked(message) => write!(f, "panicked: {message}"),
        }
    }
}

/// Terminal result of a task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome<T> {
    Completed(T),
    Failed(TaskFailure),
}

impl<T> Outcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    /// Terminal state matching this outcome.
    pub fn state(&self) -> TaskState {
        match self {
            Outcome::Completed(_) => TaskState::Completed,
            Outcome::Failed(_) => TaskState::Failed,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Completed(value) => Some(value),
            Outcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&TaskFailure> {
        match self {
            Outcome::Completed(_) => None,
            Outcome::Failed(failure) => Some(failure),
        }
    }
}

/// Label-keyed outcome mapping.
///
/// Entries keep the order in which tasks were spawned, not the order in
/// which they finished, so printed output is deterministic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcomes<T> {
    // Keyed by spawn ordinal.
    entries: BTreeMap<usize, (Label, Outcome<T>)>,
    index: HashMap<Label, usize>,
}

impl<T> Default for Outcomes<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            index: HashMap::new(),
        }
    }
}

impl<T> Outcomes<T> {
    /// Record the outcome of the task spawned `ordinal`-th.
    pub(crate) fn insert(&mut self, ordinal: usize, label: Label, outcome: Outcome<T>) {
        self.index.insert(label.clone(), ordinal);
        self.entries.insert(ordinal, (label, outcome));
    }

    pub fn get(&self, label: &str) -> Option<&Outcome<T>> {
        let ordinal = self.index.get(label)?;
        self.entries.get(ordinal).map(|(_, outcome)| outcome)
    }

    pub fn contains(&self, label: &str) -> bool {
        self.index.contains_key(label)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Outcome<T>)> {
        self.entries.values().map(|(l, o)| (l.as_str(), o))
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(|(l, _)| l.as_str())
    }

    pub fn completed(&self) -> usize {
        self.entries.values().filter(|(_, o)| o.is_completed()).count()
    }

    pub fn failed(&self) -> usize {
        self.entries.values().filter(|(_, o)| o.is_failed()).count()
    }
}

impl<T> IntoIterator for Outcomes<T> {
    type Item = (Label, Outcome<T>);
    type IntoIter = btree_map::IntoValues<usize, (Label, Outcome<T>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_values()
    }
}

/// A zero-argument unit of work that captures its own arguments.
///
/// Any `FnOnce() -> Result<T, E>` closure is a payload when `E: Display`;
/// use `Ok::<_, std::convert::Infallible>(..)` for payloads that cannot fail.
pub trait Payload<T>: Send + 'static {
    fn run(self) -> std::result::Result<T, String>;
}

impl<T, E, F> Payload<T> for F
where
    F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
    E: fmt::Display,
{
    fn run(self) -> std::result::Result<T, String> {
        self().map_err(|err| err.to_string())
    }
}
