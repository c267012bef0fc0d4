//! # courier-store
//!
//! Durable document store for conversations, messages, receipts and
//! profiles.
//!
//! The [`DocumentStore`] trait is the seam the server and tooling depend
//! on. Two implementations ship with the crate:
//!
//! - [`SqliteStore`]: a `rusqlite` database behind a blocking-task bridge,
//!   with versioned migrations;
//! - [`MemoryStore`]: an in-process store with fault injection, used by
//!   tests and by `STORE_BACKEND=memory`.
//!
//! Receipt and reaction writes are atomic set operations in both
//! implementations, so concurrent writers never lose each other's updates.

pub mod conversations;
pub mod database;
pub mod document;
pub mod memory;
pub mod messages;
pub mod migrations;
pub mod profiles;
pub mod reactions;
pub mod receipts;
pub mod sqlite;

mod error;

pub use database::Database;
pub use document::{DocumentStore, SnapshotHub, Subscription};
pub use error::{Result, StoreError};
pub use memory::{Fault, MemoryStore};
pub use sqlite::SqliteStore;
