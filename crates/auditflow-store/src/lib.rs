//! SQLite-backed implementation of the `WorkflowStore` trait.

pub mod store;

pub use store::SqliteStore;
