// Store primitives: records, the ring, its persistence mirror, the guard, and errors.
pub mod backing;
pub mod error;
pub mod guard;
pub mod record;
pub mod ring;
