//! Purpose: Concurrent session layer driving the ring store over duplex byte connections.
//! Exports: Config, session handler, periodic injector, registry, and supervisor types.
//! Role: Everything above `core`; the binary only parses flags and wires signals into it.
//! Invariants: All cross-task interaction goes through `core::guard::StoreGuard`.
pub mod config;
pub mod injector;
pub mod registry;
pub mod session;
pub mod supervisor;

pub use config::{ServerConfig, validate_config};
pub use supervisor::{Server, ServerSummary, ShutdownHandle, Supervisor, start};
