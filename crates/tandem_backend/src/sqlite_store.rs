use rusqlite::{Connection, OptionalExtension as _, params, types::Type};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{SystemTime, UNIX_EPOCH};
use tandem_domain::{ChatMessage, MessageAttachment, MessageRole, MessageType, Session};
use tracing::error;
use uuid::Uuid;

use crate::error::StorageError;
use crate::migrations;
use crate::storage::SessionStorage;

/// Handle to the session database.
///
/// A dedicated worker thread owns the only connection; public methods
/// enqueue a command and block on its reply, so concurrent callers are
/// serviced strictly in submission order. Migrations run on the worker
/// before the first command is picked up.
#[derive(Clone)]
pub struct SqliteStore {
    tx: mpsc::Sender<DbCommand>,
}

enum DbCommand {
    CreateSession {
        id: String,
        first_user_message: String,
        working_directory: Option<String>,
        reply: mpsc::Sender<Result<(), StorageError>>,
    },
    ListSessions {
        reply: mpsc::Sender<Result<Vec<Session>, StorageError>>,
    },
    GetSession {
        id: String,
        reply: mpsc::Sender<Result<Option<Session>, StorageError>>,
    },
    TouchLastAccessed {
        id: String,
        reply: mpsc::Sender<Result<(), StorageError>>,
    },
    DeleteSession {
        id: String,
        reply: mpsc::Sender<Result<(), StorageError>>,
    },
    DeleteAllSessions {
        reply: mpsc::Sender<Result<(), StorageError>>,
    },
    ReplaceMessages {
        session_id: String,
        messages: Vec<ChatMessage>,
        reply: mpsc::Sender<Result<(), StorageError>>,
    },
    RekeySession {
        old_id: String,
        new_id: String,
        reply: mpsc::Sender<Result<(), StorageError>>,
    },
    UpdateWorkspaceInfo {
        id: String,
        branch_name: Option<String>,
        is_worktree: bool,
        reply: mpsc::Sender<Result<(), StorageError>>,
    },
    CheckIntegrity {
        reply: mpsc::Sender<Result<(), StorageError>>,
    },
}

impl SqliteStore {
    pub fn new(db_path: PathBuf) -> Result<Self, StorageError> {
        let (tx, rx) = mpsc::channel::<DbCommand>();

        std::thread::Builder::new()
            .name("tandem-sqlite".to_owned())
            .spawn(move || {
                let mut db = match SessionDatabase::open(&db_path) {
                    Ok(db) => Ok(db),
                    Err(err) => {
                        error!(path = %db_path.display(), error = %err, "failed to open session database");
                        Err(err.to_string())
                    }
                };
                while let Ok(cmd) = rx.recv() {
                    match (&mut db, cmd) {
                        (
                            Ok(db),
                            DbCommand::CreateSession {
                                id,
                                first_user_message,
                                working_directory,
                                reply,
                            },
                        ) => {
                            let _ = reply.send(db.create_session(
                                &id,
                                &first_user_message,
                                working_directory.as_deref(),
                            ));
                        }
                        (Ok(db), DbCommand::ListSessions { reply }) => {
                            let _ = reply.send(db.list_sessions());
                        }
                        (Ok(db), DbCommand::GetSession { id, reply }) => {
                            let _ = reply.send(db.get_session(&id));
                        }
                        (Ok(db), DbCommand::TouchLastAccessed { id, reply }) => {
                            let _ = reply.send(db.touch_last_accessed(&id));
                        }
                        (Ok(db), DbCommand::DeleteSession { id, reply }) => {
                            let _ = reply.send(db.delete_session(&id));
                        }
                        (Ok(db), DbCommand::DeleteAllSessions { reply }) => {
                            let _ = reply.send(db.delete_all_sessions());
                        }
                        (
                            Ok(db),
                            DbCommand::ReplaceMessages {
                                session_id,
                                messages,
                                reply,
                            },
                        ) => {
                            let _ = reply.send(db.replace_messages(&session_id, &messages));
                        }
                        (
                            Ok(db),
                            DbCommand::RekeySession {
                                old_id,
                                new_id,
                                reply,
                            },
                        ) => {
                            let _ = reply.send(db.rekey_session(&old_id, &new_id));
                        }
                        (
                            Ok(db),
                            DbCommand::UpdateWorkspaceInfo {
                                id,
                                branch_name,
                                is_worktree,
                                reply,
                            },
                        ) => {
                            let _ = reply.send(db.update_workspace_info(
                                &id,
                                branch_name.as_deref(),
                                is_worktree,
                            ));
                        }
                        (Ok(db), DbCommand::CheckIntegrity { reply }) => {
                            let _ = reply.send(db.check_integrity());
                        }
                        (Err(message), cmd) => {
                            respond_db_open_error(message, cmd);
                        }
                    }
                }
            })?;

        Ok(Self { tx })
    }

    pub fn create_session(
        &self,
        id: impl Into<String>,
        first_user_message: impl Into<String>,
        working_directory: Option<String>,
    ) -> Result<(), StorageError> {
        self.call(|reply| DbCommand::CreateSession {
            id: id.into(),
            first_user_message: first_user_message.into(),
            working_directory,
            reply,
        })
    }

    pub fn list_sessions(&self) -> Result<Vec<Session>, StorageError> {
        self.call(|reply| DbCommand::ListSessions { reply })
    }

    pub fn get_session(&self, id: impl Into<String>) -> Result<Option<Session>, StorageError> {
        self.call(|reply| DbCommand::GetSession {
            id: id.into(),
            reply,
        })
    }

    pub fn touch_last_accessed(&self, id: impl Into<String>) -> Result<(), StorageError> {
        self.call(|reply| DbCommand::TouchLastAccessed {
            id: id.into(),
            reply,
        })
    }

    pub fn delete_session(&self, id: impl Into<String>) -> Result<(), StorageError> {
        self.call(|reply| DbCommand::DeleteSession {
            id: id.into(),
            reply,
        })
    }

    pub fn delete_all_sessions(&self) -> Result<(), StorageError> {
        self.call(|reply| DbCommand::DeleteAllSessions { reply })
    }

    /// Replace the whole stored message set for a session with `messages`.
    /// After this returns, the database matches the caller's in-memory
    /// transcript exactly.
    pub fn replace_messages(
        &self,
        session_id: impl Into<String>,
        messages: Vec<ChatMessage>,
    ) -> Result<(), StorageError> {
        self.call(|reply| DbCommand::ReplaceMessages {
            session_id: session_id.into(),
            messages,
            reply,
        })
    }

    /// Move a session (and its messages) from `old_id` to `new_id` after
    /// the CLI reports a different identifier for the same conversation.
    /// A no-op when `new_id` already exists, so duplicate notifications
    /// are harmless.
    pub fn rekey_session(
        &self,
        old_id: impl Into<String>,
        new_id: impl Into<String>,
    ) -> Result<(), StorageError> {
        self.call(|reply| DbCommand::RekeySession {
            old_id: old_id.into(),
            new_id: new_id.into(),
            reply,
        })
    }

    pub fn update_workspace_info(
        &self,
        id: impl Into<String>,
        branch_name: Option<String>,
        is_worktree: bool,
    ) -> Result<(), StorageError> {
        self.call(|reply| DbCommand::UpdateWorkspaceInfo {
            id: id.into(),
            branch_name,
            is_worktree,
            reply,
        })
    }

    pub fn check_integrity(&self) -> Result<(), StorageError> {
        self.call(|reply| DbCommand::CheckIntegrity { reply })
    }

    fn call<T>(
        &self,
        build: impl FnOnce(mpsc::Sender<Result<T, StorageError>>) -> DbCommand,
    ) -> Result<T, StorageError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(build(reply_tx))
            .map_err(|_| StorageError::WorkerGone)?;
        reply_rx.recv().map_err(|_| StorageError::WorkerGone)?
    }
}

impl SessionStorage for SqliteStore {
    fn list_sessions(&self) -> Result<Vec<Session>, StorageError> {
        SqliteStore::list_sessions(self)
    }

    fn get_session(&self, id: &str) -> Result<Option<Session>, StorageError> {
        SqliteStore::get_session(self, id)
    }

    fn delete_session(&self, id: &str) -> Result<(), StorageError> {
        SqliteStore::delete_session(self, id)
    }

    fn delete_all_sessions(&self) -> Result<(), StorageError> {
        SqliteStore::delete_all_sessions(self)
    }
}

fn respond_db_open_error(message: &str, cmd: DbCommand) {
    let err = StorageError::Open(message.to_owned());
    match cmd {
        DbCommand::CreateSession { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        DbCommand::ListSessions { reply } => {
            let _ = reply.send(Err(err));
        }
        DbCommand::GetSession { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        DbCommand::TouchLastAccessed { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        DbCommand::DeleteSession { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        DbCommand::DeleteAllSessions { reply } => {
            let _ = reply.send(Err(err));
        }
        DbCommand::ReplaceMessages { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        DbCommand::RekeySession { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        DbCommand::UpdateWorkspaceInfo { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        DbCommand::CheckIntegrity { reply } => {
            let _ = reply.send(Err(err));
        }
    }
}

struct SessionDatabase {
    conn: Connection,
}

impl SessionDatabase {
    fn open(db_path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(db_path)?;
        configure_connection(&conn)?;
        migrations::run_migrations_if_needed(&mut conn, db_path)?;

        Ok(Self { conn })
    }

    fn create_session(
        &mut self,
        id: &str,
        first_user_message: &str,
        working_directory: Option<&str>,
    ) -> Result<(), StorageError> {
        let now = now_unix_millis() as i64;
        let result = self.conn.execute(
            "INSERT INTO sessions (id, created_at, first_user_message, last_accessed_at, working_directory)
             VALUES (?1, ?2, ?3, ?2, ?4)",
            params![id, now, first_user_message, working_directory],
        );
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(StorageError::SessionExists(id.to_owned()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn list_sessions(&mut self) -> Result<Vec<Session>, StorageError> {
        let mut sessions = {
            let mut stmt = self.conn.prepare(
                "SELECT id, created_at, first_user_message, last_accessed_at, working_directory,
                        branch_name, is_worktree
                 FROM sessions ORDER BY last_accessed_at DESC, id ASC",
            )?;
            let rows = stmt.query_map([], row_to_session)?;
            rows.collect::<rusqlite::Result<Vec<Session>>>()?
        };

        for session in &mut sessions {
            session.messages = self.load_messages(&session.id)?;
        }
        Ok(sessions)
    }

    fn get_session(&mut self, id: &str) -> Result<Option<Session>, StorageError> {
        let session = self
            .conn
            .query_row(
                "SELECT id, created_at, first_user_message, last_accessed_at, working_directory,
                        branch_name, is_worktree
                 FROM sessions WHERE id = ?1",
                params![id],
                row_to_session,
            )
            .optional()?;

        let Some(mut session) = session else {
            return Ok(None);
        };
        session.messages = self.load_messages(id)?;
        Ok(Some(session))
    }

    fn touch_last_accessed(&mut self, id: &str) -> Result<(), StorageError> {
        self.conn.execute(
            "UPDATE sessions SET last_accessed_at = ?2 WHERE id = ?1",
            params![id, now_unix_millis() as i64],
        )?;
        Ok(())
    }

    fn delete_session(&mut self, id: &str) -> Result<(), StorageError> {
        self.conn
            .execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn delete_all_sessions(&mut self) -> Result<(), StorageError> {
        self.conn.execute("DELETE FROM sessions", [])?;
        Ok(())
    }

    fn replace_messages(
        &mut self,
        session_id: &str,
        messages: &[ChatMessage],
    ) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM messages WHERE session_id = ?1",
            params![session_id],
        )?;
        insert_messages(&tx, session_id, messages)?;
        tx.commit()?;
        Ok(())
    }

    fn rekey_session(&mut self, old_id: &str, new_id: &str) -> Result<(), StorageError> {
        let now = now_unix_millis() as i64;
        let tx = self.conn.transaction()?;

        let new_exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM sessions WHERE id = ?1",
            params![new_id],
            |row| row.get(0),
        )?;
        if new_exists > 0 {
            // Duplicate CLI notification; the target identity is already
            // live and must not be disturbed.
            return Ok(());
        }

        // Insert the new row before repointing so every message always has
        // a parent, and delete the old row last so its cascade finds no
        // messages left to destroy.
        tx.execute(
            "INSERT INTO sessions (id, created_at, first_user_message, last_accessed_at,
                                   working_directory, branch_name, is_worktree)
             SELECT ?2, created_at, first_user_message, ?3, working_directory, branch_name, is_worktree
             FROM sessions WHERE id = ?1",
            params![old_id, new_id, now],
        )?;
        tx.execute(
            "UPDATE messages SET session_id = ?2 WHERE session_id = ?1",
            params![old_id, new_id],
        )?;
        tx.execute("DELETE FROM sessions WHERE id = ?1", params![old_id])?;
        tx.commit()?;
        Ok(())
    }

    fn update_workspace_info(
        &mut self,
        id: &str,
        branch_name: Option<&str>,
        is_worktree: bool,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "UPDATE sessions SET branch_name = ?2, is_worktree = ?3 WHERE id = ?1",
            params![id, branch_name, is_worktree],
        )?;
        Ok(())
    }

    fn check_integrity(&mut self) -> Result<(), StorageError> {
        migrations::integrity_check(&self.conn)?;
        Ok(())
    }

    fn load_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>, StorageError> {
        let mut messages = {
            let mut stmt = self.conn.prepare(
                "SELECT id, content, role, timestamp, message_type, tool_name, tool_input_data,
                        is_error, is_complete, was_cancelled, task_group_id, is_task_container
                 FROM messages WHERE session_id = ?1
                 ORDER BY timestamp ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![session_id], row_to_message)?;
            rows.collect::<rusqlite::Result<Vec<ChatMessage>>>()?
        };

        let mut attachments: HashMap<String, Vec<MessageAttachment>> = HashMap::new();
        let mut stmt = self.conn.prepare(
            "SELECT a.message_id, a.id, a.file_name, a.file_path, a.file_type
             FROM attachments a
             JOIN messages m ON a.message_id = m.id
             WHERE m.session_id = ?1
             ORDER BY a.id ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                MessageAttachment {
                    id: row.get(1)?,
                    file_name: row.get(2)?,
                    file_path: row.get(3)?,
                    file_type: row.get(4)?,
                },
            ))
        })?;
        for row in rows {
            let (message_id, attachment) = row?;
            attachments.entry(message_id).or_default().push(attachment);
        }

        for message in &mut messages {
            if let Some(list) = attachments.remove(&message.id.to_string()) {
                message.attachments = list;
            }
        }
        Ok(messages)
    }
}

fn insert_messages(
    tx: &rusqlite::Transaction<'_>,
    session_id: &str,
    messages: &[ChatMessage],
) -> Result<(), StorageError> {
    let mut msg_stmt = tx.prepare(
        "INSERT INTO messages (id, session_id, content, role, timestamp, message_type, tool_name,
                               tool_input_data, is_error, is_complete, was_cancelled,
                               task_group_id, is_task_container)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
    )?;
    let mut att_stmt = tx.prepare(
        "INSERT INTO attachments (id, message_id, file_name, file_path, file_type)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;

    for message in messages {
        let tool_input = message
            .tool_input
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))?;
        msg_stmt.execute(params![
            message.id.to_string(),
            session_id,
            message.content,
            message.role.as_str(),
            message.timestamp_unix_ms as i64,
            message.message_type.as_str(),
            message.tool_name,
            tool_input,
            message.is_error,
            message.is_complete,
            message.was_cancelled,
            message.task_group_id.map(|id| id.to_string()),
            message.is_task_container,
        ])?;

        for attachment in &message.attachments {
            att_stmt.execute(params![
                attachment.id,
                message.id.to_string(),
                attachment.file_name,
                attachment.file_path,
                attachment.file_type,
            ])?;
        }
    }
    Ok(())
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        created_at_unix_ms: row.get::<_, i64>(1)? as u64,
        first_user_message: row.get(2)?,
        last_accessed_at_unix_ms: row.get::<_, i64>(3)? as u64,
        working_directory: row.get(4)?,
        branch_name: row.get(5)?,
        is_worktree: row.get(6)?,
        messages: Vec::new(),
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let id_raw: String = row.get(0)?;
    let id = Uuid::parse_str(&id_raw)
        .map_err(|err| decode_error(0, format!("invalid message id {id_raw}: {err}")))?;

    let role_raw: String = row.get(2)?;
    let role = MessageRole::parse(&role_raw)
        .ok_or_else(|| decode_error(2, format!("unknown message role {role_raw}")))?;

    let type_raw: String = row.get(4)?;
    let message_type = MessageType::parse(&type_raw)
        .ok_or_else(|| decode_error(4, format!("unknown message type {type_raw}")))?;

    let tool_input = row
        .get::<_, Option<String>>(6)?
        .map(|raw| {
            serde_json::from_str(&raw)
                .map_err(|err| decode_error(6, format!("invalid tool input payload: {err}")))
        })
        .transpose()?;

    let task_group_id = row
        .get::<_, Option<String>>(10)?
        .map(|raw| {
            Uuid::parse_str(&raw)
                .map_err(|err| decode_error(10, format!("invalid task group id {raw}: {err}")))
        })
        .transpose()?;

    Ok(ChatMessage {
        id,
        content: row.get(1)?,
        role,
        timestamp_unix_ms: row.get::<_, i64>(3)? as u64,
        message_type,
        tool_name: row.get(5)?,
        tool_input,
        is_error: row.get(7)?,
        is_complete: row.get(8)?,
        was_cancelled: row.get(9)?,
        task_group_id,
        is_task_container: row.get(11)?,
        attachments: Vec::new(),
    })
}

fn decode_error(index: usize, detail: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, detail.into())
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Cascade deletes only fire when foreign keys are enabled, and SQLite
/// leaves them off by default, so every connection must turn them on.
fn configure_connection(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}

fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
