//! Read-only view over the wrapped agent CLI's own transcript files.
//!
//! The CLI keeps one JSONL file per session under its data directory; each
//! line is a JSON record with a `type`, an RFC3339 `timestamp`, and a
//! `message` payload. Tandem surfaces those sessions in the history UI but
//! never owns them, so every mutating operation is rejected with a typed
//! not-supported error.

use chrono::DateTime;
use serde_json::Value;
use std::io::{BufRead as _, BufReader};
use std::path::PathBuf;
use tandem_domain::{ChatMessage, MessageRole, MessageType, Session};
use tracing::warn;
use uuid::Uuid;

use crate::error::StorageError;
use crate::storage::SessionStorage;

pub struct CliSessionStore {
    sessions_root: PathBuf,
}

impl CliSessionStore {
    pub fn new(sessions_root: PathBuf) -> Self {
        Self { sessions_root }
    }

    fn read_session_file(&self, path: &std::path::Path, id: &str) -> Result<Session, StorageError> {
        let file = std::fs::File::open(path)?;
        let reader = BufReader::new(file);

        let mut messages = Vec::new();
        let mut first_ts: Option<u64> = None;
        let mut last_ts: Option<u64> = None;
        let mut working_directory: Option<String> = None;
        let mut first_user_message: Option<String> = None;

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: Value = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(err) => {
                    warn!(session = id, error = %err, "skipping unparseable transcript line");
                    continue;
                }
            };

            let timestamp_unix_ms = record
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|ts| ts.timestamp_millis().max(0) as u64)
                .unwrap_or_else(|| last_ts.unwrap_or(0));
            if first_ts.is_none() {
                first_ts = Some(timestamp_unix_ms);
            }
            last_ts = Some(timestamp_unix_ms);

            if working_directory.is_none() {
                working_directory = record
                    .get("cwd")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
            }

            let Some(message) = record_to_message(&record, timestamp_unix_ms) else {
                continue;
            };
            if first_user_message.is_none() && message.role == MessageRole::User {
                first_user_message = Some(message.content.clone());
            }
            messages.push(message);
        }

        Ok(Session {
            id: id.to_owned(),
            created_at_unix_ms: first_ts.unwrap_or(0),
            first_user_message: first_user_message.unwrap_or_default(),
            last_accessed_at_unix_ms: last_ts.unwrap_or(0),
            working_directory,
            branch_name: None,
            is_worktree: false,
            messages,
        })
    }
}

impl SessionStorage for CliSessionStore {
    fn list_sessions(&self) -> Result<Vec<Session>, StorageError> {
        if !self.sessions_root.exists() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&self.sessions_root)? {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "jsonl") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            sessions.push(self.read_session_file(&path, id)?);
        }

        sessions.sort_by(|a, b| {
            b.last_accessed_at_unix_ms
                .cmp(&a.last_accessed_at_unix_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(sessions)
    }

    fn get_session(&self, id: &str) -> Result<Option<Session>, StorageError> {
        let path = self.sessions_root.join(format!("{id}.jsonl"));
        if !path.exists() {
            return Ok(None);
        }
        self.read_session_file(&path, id).map(Some)
    }

    fn delete_session(&self, _id: &str) -> Result<(), StorageError> {
        Err(StorageError::NotSupported(
            "agent CLI transcripts are read-only",
        ))
    }

    fn delete_all_sessions(&self) -> Result<(), StorageError> {
        Err(StorageError::NotSupported(
            "agent CLI transcripts are read-only",
        ))
    }
}

fn record_to_message(record: &Value, timestamp_unix_ms: u64) -> Option<ChatMessage> {
    let payload = record.get("message")?;
    let role_raw = payload
        .get("role")
        .and_then(Value::as_str)
        .or_else(|| record.get("type").and_then(Value::as_str))?;
    let role = MessageRole::parse(role_raw)?;

    let id = record
        .get("uuid")
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .unwrap_or_else(Uuid::new_v4);

    let content = payload.get("content");
    let text = match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    };

    let tool_use = content.and_then(Value::as_array).and_then(|blocks| {
        blocks
            .iter()
            .find(|block| block.get("type").and_then(Value::as_str) == Some("tool_use"))
    });

    let mut message = ChatMessage::text(id, role, text, timestamp_unix_ms);
    if let Some(block) = tool_use {
        message.message_type = MessageType::ToolUse;
        message.tool_name = block
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_owned);
        message.tool_input = block.get("input").cloned();
    }
    Some(message)
}
