use anyhow::Context as _;
use tandem_domain::{ChatMessage, Session};

use crate::sqlite_store::SqliteStore;

/// Thin orchestration between the in-memory chat state and the session
/// store. Holds no state of its own; it exists as the contract the chat
/// layer programs against.
pub struct SessionService {
    store: SqliteStore,
}

impl SessionService {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    /// Record a brand-new conversation after its first successful turn.
    pub fn begin_session(
        &self,
        id: &str,
        first_user_message: &str,
        working_directory: Option<String>,
    ) -> anyhow::Result<()> {
        self.store
            .create_session(id, first_user_message, working_directory)
            .with_context(|| format!("failed to create session {id}"))
    }

    /// Persist the caller's full transcript; afterwards the stored message
    /// set matches it exactly.
    pub fn flush_transcript(
        &self,
        session_id: &str,
        transcript: &[ChatMessage],
    ) -> anyhow::Result<()> {
        self.store
            .replace_messages(session_id, transcript.to_vec())
            .with_context(|| format!("failed to persist transcript for session {session_id}"))
    }

    pub fn resume_session(&self, id: &str) -> anyhow::Result<Option<Session>> {
        self.store
            .touch_last_accessed(id)
            .with_context(|| format!("failed to touch session {id}"))?;
        self.store
            .get_session(id)
            .with_context(|| format!("failed to load session {id}"))
    }

    /// The CLI sometimes reports a different identifier for a conversation
    /// in flight; adopt it without losing history. Safe to call again on a
    /// duplicate notification.
    pub fn adopt_session_id(&self, old_id: &str, new_id: &str) -> anyhow::Result<()> {
        self.store
            .rekey_session(old_id, new_id)
            .with_context(|| format!("failed to rekey session {old_id} to {new_id}"))
    }

    pub fn record_workspace_info(
        &self,
        id: &str,
        branch_name: Option<String>,
        is_worktree: bool,
    ) -> anyhow::Result<()> {
        self.store
            .update_workspace_info(id, branch_name, is_worktree)
            .with_context(|| format!("failed to record workspace info for session {id}"))
    }

    pub fn history(&self) -> anyhow::Result<Vec<Session>> {
        self.store.list_sessions().context("failed to list sessions")
    }

    pub fn forget_session(&self, id: &str) -> anyhow::Result<()> {
        self.store
            .delete_session(id)
            .with_context(|| format!("failed to delete session {id}"))
    }

    pub fn forget_all(&self) -> anyhow::Result<()> {
        self.store
            .delete_all_sessions()
            .context("failed to delete all sessions")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_domain::MessageRole;
    use uuid::Uuid;

    fn service() -> SessionService {
        let dir = std::env::temp_dir().join("tandem-tests");
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join(format!(
            "session-service-{}-{}.db",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        ));
        SessionService::new(SqliteStore::new(path).expect("open store"))
    }

    #[test]
    fn conversation_lifecycle_flows_through_the_store() {
        let service = service();

        service
            .begin_session("cli-1", "add a logout button", Some("/tmp/app".to_owned()))
            .unwrap();
        let transcript = vec![
            ChatMessage::text(Uuid::new_v4(), MessageRole::User, "add a logout button", 1_000),
            ChatMessage::text(Uuid::new_v4(), MessageRole::Assistant, "added", 2_000),
        ];
        service.flush_transcript("cli-1", &transcript).unwrap();

        let resumed = service
            .resume_session("cli-1")
            .unwrap()
            .expect("session exists");
        assert_eq!(resumed.messages, transcript);

        // Mid-conversation the CLI announces a different id for the same
        // thread.
        service.adopt_session_id("cli-1", "cli-2").unwrap();
        assert!(service.resume_session("cli-1").unwrap().is_none());
        let adopted = service.resume_session("cli-2").unwrap().expect("rekeyed");
        assert_eq!(adopted.messages.len(), 2);

        service
            .record_workspace_info("cli-2", Some("main".to_owned()), false)
            .unwrap();
        let history = service.history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].branch_name.as_deref(), Some("main"));

        service.forget_session("cli-2").unwrap();
        assert!(service.history().unwrap().is_empty());
    }
}
