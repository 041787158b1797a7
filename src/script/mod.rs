//! Embedded script engine behind the orchestrator.
//!
//! Two interchangeable backends: [`BoaScriptEngine`] evaluates full
//! JavaScript, [`TemplateScriptEngine`] only substitutes `${…}` variable
//! references. Both share the same scoped variable model: a stack of
//! frames where env scopes isolate sub-flow bindings and lexical scopes
//! isolate script-local declarations.

pub mod boa;
pub mod template;

pub use self::boa::BoaScriptEngine;
pub use self::template::TemplateScriptEngine;

use std::collections::HashMap;

use tracing::warn;

use crate::error::FlowError;

/// Env var overriding the backend choice (same precedence as
/// `config.ext["jsEngine"]`).
pub const JS_ENGINE_ENV: &str = "LUMI_FLOW_JS_ENGINE";

/// Scoped variable store with log and clipboard plumbing.
pub trait ScriptEngine: Send {
    /// Bind a variable in the innermost env scope.
    fn put_env(&mut self, name: &str, value: &str);

    fn get_env(&self, name: &str) -> Option<String>;

    /// Open a lexical scope (script-local declarations).
    fn enter_scope(&mut self);
    fn leave_scope(&mut self);

    /// Open an env scope (sub-flow variable isolation).
    fn enter_env_scope(&mut self);
    fn leave_env_scope(&mut self);

    fn env_scope_depth(&self) -> usize;
    fn lexical_scope_depth(&self) -> usize;

    /// Run a script. `env` adds bindings visible to this evaluation only;
    /// `run_in_sub_scope` wraps the run in a lexical scope so declarations
    /// don't escape. Returns the result stringified.
    fn evaluate_script(
        &mut self,
        source: &str,
        env: &HashMap<String, String>,
        source_name: &str,
        run_in_sub_scope: bool,
    ) -> Result<String, FlowError>;

    /// Resolve every `${…}` segment of `template` to its value.
    fn evaluate_template(&mut self, template: &str) -> Result<String, FlowError>;

    /// Mirror of the orchestrator's copy buffer, exposed to scripts.
    fn set_copied_text(&mut self, text: Option<String>);

    /// Route script log output (e.g. `console.log`) to the given sink.
    fn on_log_message(&mut self, sink: Box<dyn Fn(String) + Send>);

    /// Release backend resources. Called before the engine is replaced.
    fn close(&mut self);
}

/// Pick a backend from flow configuration, falling back to the
/// `LUMI_FLOW_JS_ENGINE` env var and defaulting to the JavaScript engine.
pub fn create_engine(ext: &HashMap<String, String>) -> Box<dyn ScriptEngine> {
    let choice = ext
        .get("jsEngine")
        .cloned()
        .or_else(|| std::env::var(JS_ENGINE_ENV).ok())
        .unwrap_or_default();

    match choice.as_str() {
        "template" => Box::new(TemplateScriptEngine::new()),
        "" | "boa" => Box::new(BoaScriptEngine::new()),
        other => {
            warn!(engine = other, "unknown jsEngine, using the default backend");
            Box::new(BoaScriptEngine::new())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScopeKind {
    Env,
    Lexical,
}

struct Frame {
    kind: ScopeKind,
    vars: HashMap<String, String>,
}

/// Stack of variable frames shared by both backends. The base frame is an
/// env scope and is never popped.
pub(crate) struct ScopeStack {
    frames: Vec<Frame>,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self {
            frames: vec![Frame {
                kind: ScopeKind::Env,
                vars: HashMap::new(),
            }],
        }
    }

    pub fn enter(&mut self, kind: ScopeKind) {
        self.frames.push(Frame {
            kind,
            vars: HashMap::new(),
        });
    }

    pub fn leave(&mut self, kind: ScopeKind) {
        if self.frames.len() <= 1 {
            warn!("attempted to leave the base variable scope");
            return;
        }
        let top = self.frames.pop().expect("non-empty scope stack");
        if top.kind != kind {
            warn!(
                expected = ?kind,
                found = ?top.kind,
                "unbalanced scope exit"
            );
        }
    }

    pub fn depth(&self, kind: ScopeKind) -> usize {
        self.frames.iter().filter(|f| f.kind == kind).count()
    }

    /// Bind into the innermost env frame (skipping lexical frames).
    pub fn put_env(&mut self, name: &str, value: &str) {
        let frame = self
            .frames
            .iter_mut()
            .rev()
            .find(|f| f.kind == ScopeKind::Env)
            .expect("base env frame");
        frame.vars.insert(name.to_string(), value.to_string());
    }

    /// Update the innermost frame already holding `name`, if any.
    pub fn set_existing(&mut self, name: &str, value: &str) -> bool {
        for frame in self.frames.iter_mut().rev() {
            if let Some(slot) = frame.vars.get_mut(name) {
                *slot = value.to_string();
                return true;
            }
        }
        false
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.frames
            .iter()
            .rev()
            .find_map(|f| f.vars.get(name))
            .map(|s| s.as_str())
    }

    /// All visible bindings, inner frames shadowing outer ones.
    pub fn flatten(&self) -> HashMap<String, String> {
        let mut merged = HashMap::new();
        for frame in &self.frames {
            for (k, v) in &frame.vars {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_scopes_isolate_bindings() {
        let mut scopes = ScopeStack::new();
        scopes.put_env("A", "1");

        scopes.enter(ScopeKind::Env);
        scopes.put_env("A", "2");
        assert_eq!(scopes.get("A"), Some("2"));

        scopes.leave(ScopeKind::Env);
        assert_eq!(scopes.get("A"), Some("1"));
    }

    #[test]
    fn test_put_env_skips_lexical_frames() {
        let mut scopes = ScopeStack::new();
        scopes.enter(ScopeKind::Lexical);
        scopes.put_env("X", "10");
        scopes.leave(ScopeKind::Lexical);
        // Binding landed in the env frame underneath, so it survives.
        assert_eq!(scopes.get("X"), Some("10"));
    }

    #[test]
    fn test_base_frame_is_never_popped() {
        let mut scopes = ScopeStack::new();
        scopes.put_env("keep", "me");
        scopes.leave(ScopeKind::Env);
        assert_eq!(scopes.get("keep"), Some("me"));
        assert_eq!(scopes.depth(ScopeKind::Env), 1);
    }
}
