//! Purpose: Library crate behind the `ringlogd` daemon and its tests.
//! Exports: `core` (records, ring store, backing mirror, guard, errors) and `server`.
//! Role: Bounded log store addressed by byte offset, served to many concurrent sessions.
//! Invariants: No process-wide mutable state; the store lives inside one `StoreGuard`.
//! Invariants: Core modules take explicit inputs and never touch the network.
pub mod core;
pub mod server;
