use std::path::{Path, PathBuf};
use tandem_domain::PreferenceDocument;
use tandem_domain::paths::{corrupted_preferences_path, preference_backup_path};
use tracing::warn;

use crate::error::PreferenceFileError;

/// Outcome of reading the canonical preference file. A missing file is a
/// normal first run, not an error; every corruption shape is a distinct
/// [`PreferenceFileError`] because the caller's safety policy differs.
#[derive(Debug)]
pub enum PreferenceLoad {
    Loaded(PreferenceDocument),
    NotFound,
}

/// File-backed store for the preference document: canonical JSON file, one
/// rolling backup generation, and a `.corrupted` quarantine slot.
pub struct PreferenceStore {
    path: PathBuf,
}

impl PreferenceStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        preference_backup_path(&self.path)
    }

    pub fn corrupted_path(&self) -> PathBuf {
        corrupted_preferences_path(&self.path)
    }

    pub fn load(&self) -> Result<PreferenceLoad, PreferenceFileError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PreferenceLoad::NotFound);
            }
            Err(err) => return Err(PreferenceFileError::Io(err)),
        };
        if raw.trim().is_empty() {
            return Err(PreferenceFileError::EmptyFile);
        }
        parse_document(&raw).map(PreferenceLoad::Loaded)
    }

    /// Persist `document`, keeping the previous on-disk generation in the
    /// backup slot when it still parses. The write goes through a sibling
    /// temp file and a rename, so a crash never leaves a torn canonical
    /// file.
    pub fn save(&self, document: &PreferenceDocument) -> Result<(), PreferenceFileError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match std::fs::read_to_string(&self.path) {
            Ok(existing) if !existing.trim().is_empty() && parse_document(&existing).is_ok() => {
                std::fs::copy(&self.path, self.backup_path())?;
            }
            Ok(_) => {
                warn!(
                    path = %self.path.display(),
                    "existing preference file does not parse; not rotating it into the backup slot"
                );
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(PreferenceFileError::Io(err)),
        }

        let json = serde_json::to_string_pretty(document)
            .map_err(|err| PreferenceFileError::Unknown {
                detail: err.to_string(),
            })?;
        write_atomic(&self.path, &json)
    }

    /// Promote the backup generation over the canonical file, but only
    /// after it parses; an invalid backup leaves the canonical file
    /// untouched.
    pub fn restore_from_backup(&self) -> Result<PreferenceDocument, PreferenceFileError> {
        let raw = std::fs::read_to_string(self.backup_path())?;
        if raw.trim().is_empty() {
            return Err(PreferenceFileError::EmptyFile);
        }
        let document = parse_document(&raw)?;
        write_atomic(&self.path, &raw)?;
        Ok(document)
    }

    /// Move (never destroy) the canonical file to the quarantine path so a
    /// corrupted document stays inspectable.
    pub fn delete_corrupted(&self) -> Result<PathBuf, PreferenceFileError> {
        let quarantine = self.corrupted_path();
        std::fs::rename(&self.path, &quarantine)?;
        Ok(quarantine)
    }
}

fn parse_document(raw: &str) -> Result<PreferenceDocument, PreferenceFileError> {
    serde_json::from_str(raw).map_err(|err| match err.classify() {
        serde_json::error::Category::Syntax | serde_json::error::Category::Eof => {
            PreferenceFileError::InvalidJson {
                detail: err.to_string(),
            }
        }
        serde_json::error::Category::Data => PreferenceFileError::InvalidFormat {
            detail: err.to_string(),
        },
        serde_json::error::Category::Io => PreferenceFileError::Unknown {
            detail: err.to_string(),
        },
    })
}

fn write_atomic(path: &Path, contents: &str) -> Result<(), PreferenceFileError> {
    let mut tmp_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    tmp_name.push_str(".tmp");
    let tmp = path.with_file_name(tmp_name);

    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
