//! Durable record of the sandbox fleet.
//!
//! Several sc processes may run against the same project at once, so writes
//! go through read-merge-write instead of a plain overwrite.

mod store;

pub use store::{Fleet, StateStore};
