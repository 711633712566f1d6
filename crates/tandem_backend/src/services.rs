mod preferences;
mod sessions;

pub use preferences::{PreferenceService, PreferenceState};
pub use sessions::SessionService;
