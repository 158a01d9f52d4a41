//! Persistence layer: libSQL-backed storage for sessions, roadmaps and the conversation log.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{ConversationEntry, Database, Direction};
