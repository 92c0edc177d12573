//! Persistence layer: libSQL-backed session and result storage.

pub mod libsql_backend;
pub mod migrations;

pub use libsql_backend::LibSqlBackend;
