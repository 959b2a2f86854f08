//! Process-local world backends.

mod log;
mod streamer;

pub use log::InMemoryEventLog;
pub use streamer::MemoryStreamer;

use crate::engine::EventSourcedStorage;

/// Event-sourced storage held in memory.
pub type MemoryStorage = EventSourcedStorage<InMemoryEventLog>;

pub fn create_storage() -> MemoryStorage {
    EventSourcedStorage::new(InMemoryEventLog::new())
}

pub fn create_streamer() -> MemoryStreamer {
    MemoryStreamer::new()
}
