//! Database layer for the ledger.
//!
//! Holds the local sync log, the materialized ledger rows, key records and
//! sync metadata in one SQLite file per ledger.

pub mod schema;

pub use schema::Database;
