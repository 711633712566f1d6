use tandem_domain::Session;

use crate::error::StorageError;

/// The session surface the history UI needs. Implemented by the primary
/// SQLite store and by the read-only adapter over the wrapped CLI's own
/// transcript files; the latter rejects mutation with
/// [`StorageError::NotSupported`].
pub trait SessionStorage {
    fn list_sessions(&self) -> Result<Vec<Session>, StorageError>;
    fn get_session(&self, id: &str) -> Result<Option<Session>, StorageError>;
    fn delete_session(&self, id: &str) -> Result<(), StorageError>;
    fn delete_all_sessions(&self) -> Result<(), StorageError>;
}
