use std::path::{Path, PathBuf};

/// Overrides the per-user application-data root (defaults to the platform
/// data directory).
pub const TANDEM_ROOT_ENV: &str = "TANDEM_ROOT";
/// Overrides where the wrapped agent CLI keeps its own session transcripts.
pub const TANDEM_AGENT_SESSIONS_ENV: &str = "TANDEM_AGENT_SESSIONS";

pub fn sqlite_path(tandem_root: &Path) -> PathBuf {
    tandem_root.join("tandem.db")
}

pub fn preferences_path(tandem_root: &Path) -> PathBuf {
    tandem_root.join("tool_preferences.json")
}

pub fn preference_backup_path(preferences_path: &Path) -> PathBuf {
    sibling_with_suffix(preferences_path, ".backup")
}

pub fn corrupted_preferences_path(preferences_path: &Path) -> PathBuf {
    sibling_with_suffix(preferences_path, ".corrupted")
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(suffix);
    path.with_file_name(name)
}
