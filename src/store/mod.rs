//! Persistence layer: libSQL-backed storage for chats, messages and workspaces.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::ChatStore;
