//! Data mapper implementations for the core `DataMapper` port.

pub mod in_memory;

pub use in_memory::InMemoryDataMapper;
