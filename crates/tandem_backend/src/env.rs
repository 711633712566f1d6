use anyhow::anyhow;
use std::path::PathBuf;
use tandem_domain::paths::TANDEM_ROOT_ENV;

pub(crate) fn optional_trimmed_path_from_env(name: &str) -> anyhow::Result<Option<PathBuf>> {
    let value = match std::env::var_os(name) {
        Some(value) => value,
        None => return Ok(None),
    };

    let value = value.to_string_lossy();
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("{name} is set but empty"));
    }

    Ok(Some(PathBuf::from(trimmed)))
}

/// The per-user application-data root: the `TANDEM_ROOT` override when
/// set, otherwise the platform data directory.
pub fn default_app_root() -> anyhow::Result<PathBuf> {
    if let Some(root) = optional_trimmed_path_from_env(TANDEM_ROOT_ENV)? {
        return Ok(root);
    }
    let base = dirs::data_dir()
        .ok_or_else(|| anyhow!("could not determine the platform data directory"))?;
    Ok(base.join("tandem"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScopedEnv;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn lock_env() -> MutexGuard<'static, ()> {
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap()
    }

    #[test]
    fn unset_env_resolves_to_platform_default() {
        let _guard = lock_env();
        let _env = ScopedEnv::unset(TANDEM_ROOT_ENV);

        let root = default_app_root().expect("platform default should resolve");
        assert!(root.ends_with("tandem"));
    }

    #[test]
    fn env_override_wins_and_is_trimmed() {
        let _guard = lock_env();
        let _env = ScopedEnv::set(TANDEM_ROOT_ENV, " /tmp/tandem-test-root ");

        let root = default_app_root().expect("override should resolve");
        assert_eq!(root, PathBuf::from("/tmp/tandem-test-root"));
    }

    #[test]
    fn empty_env_override_errors() {
        let _guard = lock_env();
        let _env = ScopedEnv::set(TANDEM_ROOT_ENV, "   ");

        let err = default_app_root().expect_err("empty override should error");
        assert!(err.to_string().contains("is set but empty"));
    }
}
