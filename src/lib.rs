//! Flow orchestration engine for multi-platform UI automation.
//!
//! The crate consumes a declarative, ordered list of [`command::Command`]s
//! and drives them against a [`driver::Driver`], producing structured
//! progress through [`runner::FlowObserver`] callbacks and per-command
//! [`runner::CommandMetadata`]. Device transports, flow loading and report
//! rendering live outside this crate.

pub mod ai;
pub mod command;
pub mod driver;
pub mod error;
pub mod hierarchy;
pub mod runner;
pub mod script;
pub mod selector;

// Re-export the user-facing surface.
pub use ai::{AiEngine, Defect};
pub use command::{Command, CommandKind, Condition, FlowConfig};
pub use driver::{DeviceInfo, Driver, Platform, ScreenRecording};
pub use error::FlowError;
pub use hierarchy::{Bounds, TreeNode, ViewHierarchy};
pub use runner::{
    CommandMetadata, ErrorResolution, FlowController, FlowObserver, NoopObserver, Orchestrator,
};
pub use script::{BoaScriptEngine, ScriptEngine, TemplateScriptEngine};
pub use selector::ElementSelector;
