//! Persistence interface for threads, messages, and projects.
//!
//! The runtime treats storage as an opaque table store behind the
//! [`ThreadStore`] and [`ProjectStore`] traits.  [`InMemoryStore`] is the
//! in-process implementation used by tests and local single-node runs; a
//! database-backed implementation lives outside this crate.

pub mod memory;
pub mod traits;

pub use memory::InMemoryStore;
pub use traits::{Message, MessageKind, Project, ProjectStore, StoreError, ThreadStore};
