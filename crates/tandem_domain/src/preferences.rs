use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub const PREFERENCE_DOCUMENT_VERSION: &str = "1.0";

/// One tool's stored allow/deny decision plus bookkeeping.
///
/// `created_at` never changes after first creation; `last_modified` moves
/// only when the decision flips or a rename is recorded.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolPreference {
    pub is_allowed: bool,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous_names: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl ToolPreference {
    pub fn new(is_allowed: bool, now: DateTime<Utc>) -> Self {
        Self {
            is_allowed,
            last_seen: now,
            notes: None,
            previous_names: Vec::new(),
            created_at: now,
            last_modified: now,
        }
    }

    pub fn set_allowed(&mut self, is_allowed: bool, now: DateTime<Utc>) {
        if self.is_allowed == is_allowed {
            return;
        }
        self.is_allowed = is_allowed;
        self.last_modified = now;
    }

    pub fn record_rename(&mut self, old_name: &str, now: DateTime<Utc>) {
        if !self.previous_names.iter().any(|name| name == old_name) {
            self.previous_names.push(old_name.to_owned());
        }
        self.last_modified = now;
    }
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolPreferenceSet {
    #[serde(default)]
    pub builtin: BTreeMap<String, ToolPreference>,
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, BTreeMap<String, ToolPreference>>,
}

/// The on-disk preference document. `BTreeMap` keys keep the serialized
/// JSON sorted and diffable.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferenceDocument {
    pub version: String,
    pub last_updated: DateTime<Utc>,
    pub tool_preferences: ToolPreferenceSet,
    #[serde(default)]
    pub general_preferences: BTreeMap<String, serde_json::Value>,
}

impl PreferenceDocument {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            version: PREFERENCE_DOCUMENT_VERSION.to_owned(),
            last_updated: now,
            tool_preferences: ToolPreferenceSet::default(),
            general_preferences: BTreeMap::new(),
        }
    }

    pub fn builtin_allowed(&self, name: &str) -> bool {
        self.tool_preferences
            .builtin
            .get(name)
            .is_some_and(|pref| pref.is_allowed)
    }

    pub fn server_tool_allowed(&self, server: &str, name: &str) -> bool {
        self.tool_preferences
            .mcp_servers
            .get(server)
            .and_then(|tools| tools.get(name))
            .is_some_and(|pref| pref.is_allowed)
    }

    pub fn allowed_tool_count(&self) -> usize {
        let builtin = self
            .tool_preferences
            .builtin
            .values()
            .filter(|pref| pref.is_allowed)
            .count();
        let servers = self
            .tool_preferences
            .mcp_servers
            .values()
            .flat_map(|tools| tools.values())
            .filter(|pref| pref.is_allowed)
            .count();
        builtin + servers
    }
}
