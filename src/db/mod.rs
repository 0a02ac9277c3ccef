//! PostgreSQL backing for the collaborator traits
//!
//! One pool serves the file catalog, the identity lookup, per-upload table
//! creation and the chat engine's read queries.

pub mod connection;
pub mod pg;
pub mod schema;

pub use connection::{init_pool, DbPool};
pub use pg::{PgFileCatalog, PgIdentityProvider, PgStore};
pub use schema::run_migrations;
