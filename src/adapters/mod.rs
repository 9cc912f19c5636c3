pub mod memory;

pub use memory::{
    MemoryEventPublisher, MemoryRepository, MemoryTracker, MemoryUserResolver,
};
