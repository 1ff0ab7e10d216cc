//! Common utilities and types shared across the Poleshift sync crates.
//!
//! This module provides the error taxonomy and the small value types
//! (table names, rows, operation kinds, timestamps) every other crate uses.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    parse_timestamp, validate_identifier, OpType, OperationId, Row, TableName, TableSpec,
};
