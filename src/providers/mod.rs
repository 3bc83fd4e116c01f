//! Backend implementations shipped with the hub.
//!
//! Real adapters live in their own crates and implement
//! [`Backend`](crate::traits::Backend); this module only carries the
//! in-memory mock used by tests and demos.

pub mod mock;
pub use mock::MockBackend;
