mod preferences;
pub use preferences::{
    PREFERENCE_DOCUMENT_VERSION, PreferenceDocument, ToolPreference, ToolPreferenceSet,
};

mod reconcile;
pub use reconcile::{
    DiscoveredTools, ReconcilerConfig, first_run_defaults, locked_down_defaults, reconcile,
};

mod session;
pub use session::{ChatMessage, MessageAttachment, MessageRole, MessageType, Session};

pub mod paths;

pub const SESSION_TITLE_MAX_CHARS: usize = 40;
