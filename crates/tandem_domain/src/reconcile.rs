use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

use crate::preferences::{PreferenceDocument, ToolPreference, ToolPreferenceSet};

const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.8;
const DEFAULT_MIN_SIMILARITY_LEN: usize = 3;

/// Built-in tools that are read-only or otherwise low-risk and may start
/// out approved on a fresh install.
const DEFAULT_ALLOWED_BUILTIN: &[&str] = &[
    "Glob",
    "Grep",
    "LS",
    "Read",
    "TodoRead",
    "WebFetch",
    "WebSearch",
];

/// Substrings that mark a tool name as mutating or otherwise risky. A new
/// tool whose name contains any of these never starts out approved.
const DEFAULT_RISK_KEYWORDS: &[&str] =
    &["bash", "exec", "write", "edit", "delete", "remove", "kill"];

/// Verb pairs that commonly show up as tool renames across CLI releases.
const DEFAULT_SYNONYM_PAIRS: &[(&str, &str)] = &[
    ("read", "readfile"),
    ("write", "writefile"),
    ("exec", "execute"),
    ("del", "delete"),
    ("rm", "remove"),
];

/// Tunables for rename detection and the new-tool safety policy.
///
/// The defaults reproduce the shipped behavior; none of the constants are
/// load-bearing invariants, so callers may tune them.
#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    pub similarity_threshold: f64,
    pub min_similarity_len: usize,
    pub synonym_pairs: Vec<(String, String)>,
    pub allowed_builtin: Vec<String>,
    pub risk_keywords: Vec<String>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            min_similarity_len: DEFAULT_MIN_SIMILARITY_LEN,
            synonym_pairs: DEFAULT_SYNONYM_PAIRS
                .iter()
                .map(|(a, b)| ((*a).to_owned(), (*b).to_owned()))
                .collect(),
            allowed_builtin: DEFAULT_ALLOWED_BUILTIN
                .iter()
                .map(|name| (*name).to_owned())
                .collect(),
            risk_keywords: DEFAULT_RISK_KEYWORDS
                .iter()
                .map(|word| (*word).to_owned())
                .collect(),
        }
    }
}

/// The tool surface reported by the wrapped CLI on (re)connect: one flat
/// list of built-in tools plus per-server tool lists for MCP servers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiscoveredTools {
    pub builtin: Vec<String>,
    pub mcp_servers: BTreeMap<String, Vec<String>>,
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum ToolSource {
    Builtin,
    McpServer,
}

/// Merge a freshly discovered tool list into the stored preference
/// document.
///
/// Known tools keep their decision and get a fresh `last_seen`; likely
/// renames carry the old decision forward and record the old name; new
/// tools default per the safety policy; stored tools that no longer appear
/// are retained untouched. `stored` is never mutated and the result is a
/// pure function of the arguments.
pub fn reconcile(
    discovered: &DiscoveredTools,
    stored: &PreferenceDocument,
    now: DateTime<Utc>,
    config: &ReconcilerConfig,
) -> PreferenceDocument {
    let builtin = reconcile_group(
        &discovered.builtin,
        &stored.tool_preferences.builtin,
        now,
        config,
        ToolSource::Builtin,
    );

    let mut mcp_servers = BTreeMap::new();
    for (server, tools) in &discovered.mcp_servers {
        let empty = BTreeMap::new();
        let stored_tools = stored
            .tool_preferences
            .mcp_servers
            .get(server)
            .unwrap_or(&empty);
        mcp_servers.insert(
            server.clone(),
            reconcile_group(tools, stored_tools, now, config, ToolSource::McpServer),
        );
    }
    // A server missing from discovery is most likely just disconnected;
    // keep its whole sub-map so the user's decisions survive reconnects.
    for (server, tools) in &stored.tool_preferences.mcp_servers {
        if !mcp_servers.contains_key(server) {
            mcp_servers.insert(server.clone(), tools.clone());
        }
    }

    PreferenceDocument {
        version: stored.version.clone(),
        last_updated: now,
        tool_preferences: ToolPreferenceSet {
            builtin,
            mcp_servers,
        },
        general_preferences: stored.general_preferences.clone(),
    }
}

fn reconcile_group(
    discovered: &[String],
    stored: &BTreeMap<String, ToolPreference>,
    now: DateTime<Utc>,
    config: &ReconcilerConfig,
    source: ToolSource,
) -> BTreeMap<String, ToolPreference> {
    let discovered_set: BTreeSet<&str> = discovered.iter().map(String::as_str).collect();
    let mut claimed_renames: BTreeSet<&str> = BTreeSet::new();
    let mut out = BTreeMap::new();

    for name in discovered {
        if let Some(pref) = stored.get(name) {
            let mut pref = pref.clone();
            pref.last_seen = now;
            out.insert(name.clone(), pref);
            continue;
        }

        let candidates: Vec<&str> = stored
            .keys()
            .map(String::as_str)
            .filter(|key| !discovered_set.contains(key) && !claimed_renames.contains(key))
            .collect();
        if let Some(old_name) = find_rename_source(name, &candidates, config) {
            claimed_renames.insert(old_name);
            let mut pref = stored[old_name].clone();
            pref.last_seen = now;
            pref.record_rename(old_name, now);
            out.insert(name.clone(), pref);
            continue;
        }

        let is_allowed = match source {
            ToolSource::Builtin => default_builtin_allowed(name, config),
            ToolSource::McpServer => false,
        };
        out.insert(name.clone(), ToolPreference::new(is_allowed, now));
    }

    // Retain everything that was neither seen nor consumed as a rename
    // source. Absent tools keep their stored decision but are not marked
    // seen, so they never resurrect as active.
    for (name, pref) in stored {
        if discovered_set.contains(name.as_str()) || claimed_renames.contains(name.as_str()) {
            continue;
        }
        out.entry(name.clone()).or_insert_with(|| pref.clone());
    }

    out
}

/// New built-in tools start approved only when they are on the explicit
/// allow-list and carry no risk keyword; everything else starts denied.
fn default_builtin_allowed(name: &str, config: &ReconcilerConfig) -> bool {
    let lowered = name.to_lowercase();
    if config
        .risk_keywords
        .iter()
        .any(|keyword| lowered.contains(keyword.as_str()))
    {
        return false;
    }
    config.allowed_builtin.iter().any(|allowed| allowed == name)
}

/// Pick the stored key most likely to be an earlier name of `discovered`.
///
/// Convention matches (normalization, synonyms, containment) win over
/// edit-distance similarity; candidates are scanned in sorted order so the
/// result is deterministic, and similarity ties keep the lexicographically
/// smallest candidate.
fn find_rename_source<'a>(
    discovered: &str,
    candidates: &[&'a str],
    config: &ReconcilerConfig,
) -> Option<&'a str> {
    for &candidate in candidates {
        if names_related_by_convention(discovered, candidate, config) {
            return Some(candidate);
        }
    }

    let mut best: Option<(&str, f64)> = None;
    for &candidate in candidates {
        if candidate.chars().count() <= config.min_similarity_len {
            continue;
        }
        let score = strsim::normalized_levenshtein(
            &discovered.to_lowercase(),
            &candidate.to_lowercase(),
        );
        if score < config.similarity_threshold {
            continue;
        }
        if best.is_none_or(|(_, best_score)| score > best_score) {
            best = Some((candidate, score));
        }
    }
    best.map(|(candidate, _)| candidate)
}

fn names_related_by_convention(a: &str, b: &str, config: &ReconcilerConfig) -> bool {
    let a = normalize_tool_name(a);
    let b = normalize_tool_name(b);
    if a == b {
        return true;
    }
    if config
        .synonym_pairs
        .iter()
        .any(|(x, y)| (a == *x && b == *y) || (a == *y && b == *x))
    {
        return true;
    }
    let (short, long) = if a.len() <= b.len() { (&a, &b) } else { (&b, &a) };
    short.len() >= 3 && long.contains(short.as_str())
}

fn normalize_tool_name(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

/// The document seeded on a genuinely missing preference file: the
/// allow-list tools start approved, nothing else exists yet.
pub fn first_run_defaults(config: &ReconcilerConfig, now: DateTime<Utc>) -> PreferenceDocument {
    let mut doc = PreferenceDocument::empty(now);
    for name in &config.allowed_builtin {
        doc.tool_preferences
            .builtin
            .insert(name.clone(), ToolPreference::new(true, now));
    }
    doc
}

/// The document installed after a corrupted preference file is detected:
/// no tool of any kind is approved until the user resets or restores.
pub fn locked_down_defaults(now: DateTime<Utc>) -> PreferenceDocument {
    PreferenceDocument::empty(now)
}
