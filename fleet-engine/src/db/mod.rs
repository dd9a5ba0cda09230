//! SQLite persistence for host records.

pub mod connection;
pub mod migrate;
pub mod store;

pub use connection::DbPool;
pub use store::HostStore;
