//! Polling fallback for the push channel.

mod scheduler;

pub use scheduler::{BackendPoll, PollHandle, PollSchedule, PollScheduler, PollSource};
