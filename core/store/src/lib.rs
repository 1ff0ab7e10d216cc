//! Embedded relational store used by the sync engine.
//!
//! The engine talks to the store only through the [`LocalStore`] contract:
//! plain SQL with positional parameters, rows returned as column maps. The
//! same store holds the domain tables and the engine's own bookkeeping
//! tables (see [`schema`]).

pub mod schema;
pub mod sqlite;
pub mod store;

pub use sqlite::SqliteStore;
pub use store::{json_to_sql, sql_to_json, LocalStore, SqlValue, Statement, StoreRow};
