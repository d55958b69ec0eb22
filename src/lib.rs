// src/lib.rs
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logger;
pub mod metrics;
pub mod queue;
pub mod router;
pub mod server;
pub mod slab;
pub mod store;
pub mod sync;
pub mod syscalls;
pub mod timer;
pub mod worker;

// Re-exports for users
pub use config::{DispatchMode, ServerConfig, TriggerMode};
pub use error::{PetrelError, PetrelResult};
pub use server::{Server, ShutdownHandle};
