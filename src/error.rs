use thiserror::Error;

use crate::hierarchy::ViewHierarchy;

/// Failure classes surfaced by flow execution.
///
/// Domain errors (element lookups, assertions, app lifecycle) participate in
/// the optional-demotion rule: when the failing command or its selector is
/// marked optional they are downgraded to a warning instead of failing the
/// flow. `CommandSkipped` is a control-flow signal, never user-visible.
/// `Driver` wraps opaque transport failures reported by the device layer.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("element matching {description} not found")]
    ElementNotFound {
        description: String,
        debug_message: String,
        /// Hierarchy snapshot taken at the last failed lookup.
        hierarchy: Option<Box<ViewHierarchy>>,
    },

    #[error("assertion failed: {message}")]
    AssertionFailure {
        message: String,
        debug_message: String,
        hierarchy: Option<Box<ViewHierarchy>>,
    },

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("unable to copy text from element matching {0}")]
    UnableToCopyTextFrom(String),

    #[error("unable to launch app {app_id}: {reason}")]
    UnableToLaunchApp { app_id: String, reason: String },

    #[error("unable to clear state of app {app_id}: {reason}")]
    UnableToClearState { app_id: String, reason: String },

    #[error("unicode characters are not supported by this driver: {text}")]
    UnicodeNotSupported { text: String },

    #[error("AI commands require a configured AI engine and API key")]
    CloudApiKeyNotAvailable,

    #[error("script error in {source_name}: {message}")]
    Script {
        source_name: String,
        message: String,
    },

    /// Raised by conditionals, repeats and gated commands to mark
    /// non-execution. Always swallowed by the command loop.
    #[error("command skipped")]
    CommandSkipped,

    /// A domain error demoted because the command or selector was optional.
    #[error("{0}")]
    CommandWarned(String),

    #[error(transparent)]
    Driver(#[from] anyhow::Error),
}

impl FlowError {
    /// Whether this error belongs to the domain class that the
    /// optional-demotion rule applies to.
    pub fn is_domain(&self) -> bool {
        !matches!(
            self,
            FlowError::CommandSkipped | FlowError::CommandWarned(_) | FlowError::Driver(_)
        )
    }

    /// Debug hint attached to lookup and assertion failures, if any.
    pub fn debug_message(&self) -> Option<&str> {
        match self {
            FlowError::ElementNotFound { debug_message, .. }
            | FlowError::AssertionFailure { debug_message, .. } => Some(debug_message),
            _ => None,
        }
    }
}
