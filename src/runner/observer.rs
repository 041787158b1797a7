use crate::ai::Defect;
use crate::command::Command;
use crate::error::FlowError;
use crate::runner::metadata::CommandMetadata;

/// What the flow should do after an unhandled command failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorResolution {
    /// Move on to the next command.
    Continue,
    /// Abort the flow (the default).
    Fail,
}

/// Callbacks fired by the orchestrator as a flow executes.
///
/// All methods are no-ops by default and are invoked synchronously from the
/// flow task — implementations must be quick and must not block on the flow
/// itself. For every raw command the loop reaches, `on_command_start` fires
/// first and exactly one of complete/warned/skipped/failed fires after it.
pub trait FlowObserver: Send + Sync {
    fn on_flow_start(&self, _commands: &[Command]) {}

    fn on_command_start(&self, _index: usize, _command: &Command) {}

    fn on_command_complete(&self, _index: usize, _command: &Command) {}

    /// Decide whether the flow continues past an unhandled failure.
    fn on_command_failed(
        &self,
        _index: usize,
        _command: &Command,
        _error: &FlowError,
    ) -> ErrorResolution {
        ErrorResolution::Fail
    }

    fn on_command_warned(&self, _index: usize, _command: &Command) {}

    fn on_command_skipped(&self, _index: usize, _command: &Command) {}

    /// A repeat is about to re-run this (child) command.
    fn on_command_reset(&self, _command: &Command) {}

    /// Metadata changed; `metadata` is a snapshot, safe to keep.
    fn on_command_metadata_update(&self, _command: &Command, _metadata: &CommandMetadata) {}

    /// An AI command produced artifacts (defects + the screenshot they
    /// were found on).
    fn on_command_generated_output(
        &self,
        _command: &Command,
        _defects: &[Defect],
        _screenshot: &[u8],
    ) {
    }
}

/// Observer that ignores everything; failures abort the flow.
pub struct NoopObserver;

impl FlowObserver for NoopObserver {}
