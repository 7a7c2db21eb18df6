// Store module: durable key-value persistence shared by offline messages and transfers

pub mod backend;

pub use backend::{MemoryStorage, SledStorage, StorageBackend, StorageError};
