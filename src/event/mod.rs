//! In-process event bus and keyed worker routing.

mod bus;
mod workers;

pub use bus::{topic, Event, EventBus, SessionSnapshot};
pub use workers::{TopicHandler, WorkerPool, DEFAULT_WORKERS};
