use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::command::{Command, CommandId};
use crate::runner::observer::FlowObserver;

/// Advisory message attached to a command's metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Insight {
    pub level: InsightLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightLevel {
    Info,
    Warning,
}

/// Per-raw-command accumulator surfaced to the reporter.
///
/// Keyed by command identity (not structure): repeats and nested re-runs of
/// the same raw command land in one entry, the substituted form is stored
/// inside. All fields only ever grow except `number_of_runs`, which a
/// repeat resets per run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMetadata {
    pub evaluated_command: Option<Command>,
    pub log_messages: Vec<String>,
    pub insight: Option<Insight>,
    pub number_of_runs: Option<u32>,
    pub ai_reasoning: Option<String>,
    pub labeled_command: Option<String>,
}

/// Shared map of raw command id to metadata. Entries are created lazily on
/// first touch; every mutation fires `on_command_metadata_update` with a
/// snapshot.
#[derive(Clone, Default)]
pub struct MetadataStore {
    inner: Arc<Mutex<HashMap<CommandId, CommandMetadata>>>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(
        &self,
        command: &Command,
        observer: &dyn FlowObserver,
        f: impl FnOnce(&mut CommandMetadata),
    ) {
        let snapshot = {
            let mut map = self.inner.lock();
            let entry = map.entry(command.id).or_default();
            f(entry);
            entry.clone()
        };
        observer.on_command_metadata_update(command, &snapshot);
    }

    pub fn get(&self, id: CommandId) -> Option<CommandMetadata> {
        self.inner.lock().get(&id).cloned()
    }

    pub fn contains(&self, id: CommandId) -> bool {
        self.inner.lock().contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;
    use crate::runner::observer::NoopObserver;

    #[test]
    fn test_entries_are_lazy_and_identity_keyed() {
        let store = MetadataStore::new();
        let a = Command::new(CommandKind::Back);
        let b = Command::new(CommandKind::Back);

        assert!(!store.contains(a.id));
        store.update(&a, &NoopObserver, |m| {
            m.log_messages.push("first".to_string())
        });
        assert!(store.contains(a.id));
        // Structurally identical command keeps its own entry.
        assert!(!store.contains(b.id));

        store.update(&a, &NoopObserver, |m| {
            m.log_messages.push("second".to_string())
        });
        assert_eq!(store.get(a.id).unwrap().log_messages.len(), 2);
    }

    #[test]
    fn test_update_fires_observer_with_snapshot() {
        use parking_lot::Mutex;

        struct Recorder(Mutex<Vec<CommandMetadata>>);
        impl FlowObserver for Recorder {
            fn on_command_metadata_update(&self, _c: &Command, m: &CommandMetadata) {
                self.0.lock().push(m.clone());
            }
        }

        let store = MetadataStore::new();
        let recorder = Recorder(Mutex::new(Vec::new()));
        let cmd = Command::new(CommandKind::Back);

        store.update(&cmd, &recorder, |m| m.number_of_runs = Some(1));
        store.update(&cmd, &recorder, |m| m.number_of_runs = Some(2));

        let seen = recorder.0.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].number_of_runs, Some(1));
        assert_eq!(seen[1].number_of_runs, Some(2));
    }
}
