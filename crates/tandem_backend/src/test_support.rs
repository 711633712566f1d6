use std::ffi::{OsStr, OsString};

/// Scoped environment override for tests: applies on construction and
/// restores the previous value on drop.
pub(crate) struct ScopedEnv {
    key: &'static str,
    saved: Option<OsString>,
}

impl ScopedEnv {
    pub(crate) fn set(key: &'static str, value: &str) -> Self {
        Self::apply(key, Some(value.as_ref()))
    }

    pub(crate) fn unset(key: &'static str) -> Self {
        Self::apply(key, None)
    }

    fn apply(key: &'static str, value: Option<&OsStr>) -> Self {
        let saved = std::env::var_os(key);
        set_or_remove(key, value);
        Self { key, saved }
    }
}

impl Drop for ScopedEnv {
    fn drop(&mut self) {
        let saved = self.saved.take();
        set_or_remove(self.key, saved.as_deref());
    }
}

fn set_or_remove(key: &str, value: Option<&OsStr>) {
    match value {
        Some(value) => unsafe { std::env::set_var(key, value) },
        None => unsafe { std::env::remove_var(key) },
    }
}
