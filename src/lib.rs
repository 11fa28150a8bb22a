//! Bounded task groups on native threads.
//!
//! A [`TaskGroup`] launches named, independent payloads on their own OS
//! threads and tracks them until every one reaches a terminal state, either
//! by blocking ([`TaskGroup::wait_all`]) or by draining with bounded joins
//! ([`TaskGroup::poll_all`]).

pub mod clock;
pub mod error;
pub mod group;
pub mod logging;
pub mod task;
pub mod types;

pub use clock::{Clock, InstantClock, SystemClock};
pub use error::{Result, TaskGroupError};
pub use group::{TaskGroup, TaskGroupBuilder};
pub use task::TaskHandle;
pub use types::{Label, Outcome, Outcomes, Payload, TaskFailure, TaskState};
