//! In-memory reference driver for Tessera.
//!
//! `tessera-memory` implements [`Connection`](tessera_core::Connection) over
//! plain Rust collections. Tables and sequences come from a model's
//! [`Catalog`](tessera_core::Catalog); primary key, unique, not-null and
//! foreign key constraints are enforced per statement with the SQLSTATE codes
//! a real server would report. Transactions are read-committed with
//! savepoints, and [`MemoryStats`] counts round trips and open cursors so
//! batching and cursor hygiene can be asserted in tests.
//!
//! ```ignore
//! let db = MemoryDatabase::from_model(&model, MemoryConfig::default());
//! let mut session = Session::new(Arc::clone(&model), db.connect(), SessionConfig::default());
//! ```

pub mod config;
pub mod connection;
pub mod database;
mod eval;
mod store;

pub use config::MemoryConfig;
pub use connection::MemoryConnection;
pub use database::{MemoryDatabase, MemoryStats};
