mod cli_session_store;
mod env;
mod error;
pub mod migrations;
mod preference_store;
mod services;
mod sqlite_store;
mod storage;
#[cfg(test)]
mod test_support;

pub use cli_session_store::CliSessionStore;
pub use env::default_app_root;
pub use error::{MigrationError, PreferenceFileError, StorageError};
pub use migrations::{MigrationReport, SCHEMA_VERSION};
pub use preference_store::{PreferenceLoad, PreferenceStore};
pub use services::{PreferenceService, PreferenceState, SessionService};
pub use sqlite_store::SqliteStore;
pub use storage::SessionStorage;
