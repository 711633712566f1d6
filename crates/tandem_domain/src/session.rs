use uuid::Uuid;

use crate::SESSION_TITLE_MAX_CHARS;

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    ToolUse,
    ToolResult,
    Error,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::ToolUse => "tool_use",
            Self::ToolResult => "tool_result",
            Self::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "text" => Some(Self::Text),
            "tool_use" => Some(Self::ToolUse),
            "tool_result" => Some(Self::ToolResult),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MessageAttachment {
    pub id: String,
    pub file_name: String,
    pub file_path: String,
    pub file_type: String,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub content: String,
    pub role: MessageRole,
    pub timestamp_unix_ms: u64,
    pub message_type: MessageType,
    pub tool_name: Option<String>,
    pub tool_input: Option<serde_json::Value>,
    pub is_error: bool,
    pub is_complete: bool,
    pub was_cancelled: bool,
    pub task_group_id: Option<Uuid>,
    pub is_task_container: bool,
    pub attachments: Vec<MessageAttachment>,
}

impl ChatMessage {
    /// A plain text message with everything else defaulted.
    pub fn text(id: Uuid, role: MessageRole, content: impl Into<String>, at_unix_ms: u64) -> Self {
        Self {
            id,
            content: content.into(),
            role,
            timestamp_unix_ms: at_unix_ms,
            message_type: MessageType::Text,
            tool_name: None,
            tool_input: None,
            is_error: false,
            is_complete: true,
            was_cancelled: false,
            task_group_id: None,
            is_task_container: false,
            attachments: Vec::new(),
        }
    }
}

/// One persisted conversation with the wrapped agent CLI.
///
/// `id` is owned by the external CLI and may be re-assigned mid-conversation;
/// the session store's rekey operation absorbs that.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at_unix_ms: u64,
    pub first_user_message: String,
    pub last_accessed_at_unix_ms: u64,
    pub working_directory: Option<String>,
    pub branch_name: Option<String>,
    pub is_worktree: bool,
    pub messages: Vec<ChatMessage>,
}

impl Session {
    pub fn display_title(&self) -> String {
        derive_session_title(&self.first_user_message)
    }
}

pub(crate) fn derive_session_title(text: &str) -> String {
    let first_line = text.lines().find(|line| !line.trim().is_empty());
    let Some(first_line) = first_line else {
        return String::new();
    };
    let trimmed = first_line.trim();
    if trimmed.chars().count() <= SESSION_TITLE_MAX_CHARS {
        return trimmed.to_owned();
    }
    let mut title: String = trimmed.chars().take(SESSION_TITLE_MAX_CHARS).collect();
    title.push('…');
    title
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_and_type_round_trip_through_labels() {
        for role in [MessageRole::User, MessageRole::Assistant, MessageRole::System] {
            assert_eq!(MessageRole::parse(role.as_str()), Some(role));
        }
        for kind in [
            MessageType::Text,
            MessageType::ToolUse,
            MessageType::ToolResult,
            MessageType::Error,
        ] {
            assert_eq!(MessageType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageRole::parse("robot"), None);
        assert_eq!(MessageType::parse(""), None);
    }

    #[test]
    fn display_title_uses_first_non_empty_line() {
        let session = Session {
            id: "s1".to_owned(),
            created_at_unix_ms: 0,
            first_user_message: "\n\n  fix the login bug  \nmore detail".to_owned(),
            last_accessed_at_unix_ms: 0,
            working_directory: None,
            branch_name: None,
            is_worktree: false,
            messages: Vec::new(),
        };
        assert_eq!(session.display_title(), "fix the login bug");
    }

    #[test]
    fn display_title_truncates_long_messages() {
        let long = "a".repeat(SESSION_TITLE_MAX_CHARS + 10);
        let title = derive_session_title(&long);
        assert_eq!(title.chars().count(), SESSION_TITLE_MAX_CHARS + 1);
        assert!(title.ends_with('…'));
    }
}
