use anyhow::Context as _;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tandem_domain::{
    DiscoveredTools, PreferenceDocument, ReconcilerConfig, ToolPreference, first_run_defaults,
    locked_down_defaults, reconcile,
};
use tracing::warn;

use crate::error::PreferenceFileError;
use crate::preference_store::{PreferenceLoad, PreferenceStore};

/// How the preference document came to exist at startup. The UI renders
/// these differently: a corrupted file gets a recovery banner with
/// restore/reset actions.
#[derive(Debug)]
pub enum PreferenceState {
    Loaded,
    FirstRun,
    Corrupted(PreferenceFileError),
}

/// Owns the preference document and its file store. Constructed once by
/// the composition root and passed down explicitly; all mutation goes
/// through setters that persist, so there are no implicit writes on field
/// assignment. The mutex keeps the store's backup-then-write sequence a
/// critical section.
pub struct PreferenceService {
    inner: Mutex<Inner>,
    config: ReconcilerConfig,
}

struct Inner {
    store: PreferenceStore,
    document: PreferenceDocument,
}

impl PreferenceService {
    /// Load (or seed) the preference document and report how it loaded.
    ///
    /// A missing file seeds and persists first-run defaults. A corrupted
    /// file locks every tool approval down in memory and persists nothing:
    /// the bad file stays on disk for restore or quarantine, and no tool
    /// runs without the user explicitly re-approving or recovering.
    pub fn open(
        store: PreferenceStore,
        config: ReconcilerConfig,
    ) -> anyhow::Result<(Self, PreferenceState)> {
        let now = Utc::now();
        let (document, state) = match store.load() {
            Ok(PreferenceLoad::Loaded(document)) => (document, PreferenceState::Loaded),
            Ok(PreferenceLoad::NotFound) => {
                let document = first_run_defaults(&config, now);
                store
                    .save(&document)
                    .context("failed to seed first-run preferences")?;
                (document, PreferenceState::FirstRun)
            }
            Err(err) => {
                warn!(
                    path = %store.path().display(),
                    error = %err,
                    "preference file is corrupted; locking all tool approvals down"
                );
                (locked_down_defaults(now), PreferenceState::Corrupted(err))
            }
        };

        let service = Self {
            inner: Mutex::new(Inner { store, document }),
            config,
        };
        Ok((service, state))
    }

    pub fn document(&self) -> PreferenceDocument {
        self.lock().document.clone()
    }

    pub fn is_builtin_allowed(&self, name: &str) -> bool {
        self.lock().document.builtin_allowed(name)
    }

    pub fn is_server_tool_allowed(&self, server: &str, name: &str) -> bool {
        self.lock().document.server_tool_allowed(server, name)
    }

    /// Merge a freshly discovered tool surface into the stored document
    /// and persist the result.
    pub fn sync_discovered(
        &self,
        discovered: &DiscoveredTools,
    ) -> anyhow::Result<PreferenceDocument> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let updated = reconcile(discovered, &inner.document, Utc::now(), &self.config);
        inner
            .store
            .save(&updated)
            .context("failed to persist reconciled preferences")?;
        inner.document = updated.clone();
        Ok(updated)
    }

    pub fn set_builtin_allowed(&self, name: &str, allowed: bool) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner
            .document
            .tool_preferences
            .builtin
            .entry(name.to_owned())
            .and_modify(|pref| pref.set_allowed(allowed, now))
            .or_insert_with(|| ToolPreference::new(allowed, now));
        inner.document.last_updated = now;
        inner
            .store
            .save(&inner.document)
            .with_context(|| format!("failed to persist preference for {name}"))
    }

    pub fn set_server_tool_allowed(
        &self,
        server: &str,
        name: &str,
        allowed: bool,
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner
            .document
            .tool_preferences
            .mcp_servers
            .entry(server.to_owned())
            .or_default()
            .entry(name.to_owned())
            .and_modify(|pref| pref.set_allowed(allowed, now))
            .or_insert_with(|| ToolPreference::new(allowed, now));
        inner.document.last_updated = now;
        inner
            .store
            .save(&inner.document)
            .with_context(|| format!("failed to persist preference for {server}/{name}"))
    }

    pub fn set_general(&self, key: &str, value: serde_json::Value) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner
            .document
            .general_preferences
            .insert(key.to_owned(), value);
        inner.document.last_updated = now;
        inner
            .store
            .save(&inner.document)
            .with_context(|| format!("failed to persist general preference {key}"))
    }

    pub fn general(&self, key: &str) -> Option<serde_json::Value> {
        self.lock().document.general_preferences.get(key).cloned()
    }

    /// "Reset preferences" recovery action: discard the in-memory document
    /// for fresh first-run defaults and persist them.
    pub fn reset_to_defaults(&self) -> anyhow::Result<PreferenceDocument> {
        let document = first_run_defaults(&self.config, Utc::now());
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner
            .store
            .save(&document)
            .context("failed to persist default preferences")?;
        inner.document = document.clone();
        Ok(document)
    }

    /// "Restore from backup" recovery action. Fails without touching
    /// anything when the backup itself does not parse.
    pub fn restore_from_backup(&self) -> anyhow::Result<PreferenceDocument> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let document = inner
            .store
            .restore_from_backup()
            .context("failed to restore preferences from backup")?;
        inner.document = document.clone();
        Ok(document)
    }

    /// Move the corrupted canonical file aside for later inspection.
    pub fn quarantine_corrupted(&self) -> anyhow::Result<PathBuf> {
        self.lock()
            .store
            .delete_corrupted()
            .context("failed to quarantine corrupted preference file")
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> PreferenceStore {
        PreferenceStore::new(dir.path().join("tool_preferences.json"))
    }

    fn open(dir: &tempfile::TempDir) -> (PreferenceService, PreferenceState) {
        PreferenceService::open(store_in(dir), ReconcilerConfig::default()).expect("open service")
    }

    #[test]
    fn first_run_seeds_and_persists_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (service, state) = open(&dir);

        assert!(matches!(state, PreferenceState::FirstRun));
        assert!(service.is_builtin_allowed("Read"));
        assert!(!service.is_builtin_allowed("Bash"));
        assert!(dir.path().join("tool_preferences.json").exists());
    }

    #[test]
    fn second_open_loads_the_persisted_document() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = open(&dir);
        service.set_builtin_allowed("Bash", true).unwrap();
        drop(service);

        let (service, state) = open(&dir);
        assert!(matches!(state, PreferenceState::Loaded));
        assert!(service.is_builtin_allowed("Bash"));
    }

    #[test]
    fn corrupted_file_locks_all_approvals_down() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool_preferences.json");
        std::fs::write(&path, "{ definitely not json").unwrap();

        let (service, state) = open(&dir);

        assert!(matches!(
            state,
            PreferenceState::Corrupted(PreferenceFileError::InvalidJson { .. })
        ));
        assert_eq!(
            service.document().allowed_tool_count(),
            0,
            "corruption must never fall back to first-run defaults"
        );
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "{ definitely not json",
            "the corrupted file stays on disk for inspection"
        );
    }

    #[test]
    fn sync_discovered_persists_the_reconciled_document() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = open(&dir);

        let mut discovered = DiscoveredTools {
            builtin: vec!["Read".to_owned(), "bash_exec".to_owned()],
            ..DiscoveredTools::default()
        };
        discovered
            .mcp_servers
            .insert("db".to_owned(), vec!["query".to_owned()]);

        let updated = service.sync_discovered(&discovered).unwrap();
        assert!(updated.builtin_allowed("Read"));
        assert!(!updated.builtin_allowed("bash_exec"));
        assert!(!updated.server_tool_allowed("db", "query"));

        // The persisted file matches what the service holds.
        match store_in(&dir).load().unwrap() {
            PreferenceLoad::Loaded(on_disk) => assert_eq!(on_disk, updated),
            PreferenceLoad::NotFound => panic!("document should be persisted"),
        }
    }

    #[test]
    fn setters_persist_and_later_reads_see_them() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = open(&dir);

        service.set_server_tool_allowed("db", "query", true).unwrap();
        assert!(service.is_server_tool_allowed("db", "query"));

        service
            .set_general("fontSize", serde_json::json!(14))
            .unwrap();
        assert_eq!(service.general("fontSize"), Some(serde_json::json!(14)));

        let (reloaded, _) = open(&dir);
        assert!(reloaded.is_server_tool_allowed("db", "query"));
        assert_eq!(reloaded.general("fontSize"), Some(serde_json::json!(14)));
    }

    #[test]
    fn restore_from_backup_recovers_the_previous_generation() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = open(&dir);
        service.set_builtin_allowed("Bash", true).unwrap();

        // Corrupt the canonical file behind the service's back, then
        // reopen: locked down, but the backup still holds the last good
        // generation.
        std::fs::write(dir.path().join("tool_preferences.json"), "{ torn").unwrap();
        let (service, state) = open(&dir);
        assert!(matches!(state, PreferenceState::Corrupted(_)));
        assert_eq!(service.document().allowed_tool_count(), 0);

        let restored = service.restore_from_backup().unwrap();
        assert!(restored.allowed_tool_count() > 0);
        assert!(service.is_builtin_allowed("Read"));
    }

    #[test]
    fn quarantine_moves_the_corrupted_file_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool_preferences.json");
        std::fs::write(&path, "{ broken").unwrap();
        let (service, _) = open(&dir);

        let quarantine = service.quarantine_corrupted().unwrap();
        assert!(!path.exists());
        assert!(quarantine.ends_with("tool_preferences.json.corrupted"));
    }
}
