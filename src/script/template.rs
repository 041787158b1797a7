//! Substitution-only backend.
//!
//! Resolves `${name}` against the scope stack, supports the dynamic
//! `time`/`date`/`timestamp` variables and `${var.path.into.json}`
//! drill-down into JSON-valued variables. Scripts are treated as templates;
//! a plain `name = value` assignment binds the substituted value. Use the
//! JavaScript backend for real expressions.

use chrono::{Local, Utc};
use regex::Regex;
use std::collections::HashMap;

use super::{ScopeKind, ScopeStack, ScriptEngine};
use crate::error::FlowError;

pub struct TemplateScriptEngine {
    scopes: ScopeStack,
    copied_text: Option<String>,
    log_sink: Box<dyn Fn(String) + Send>,
}

impl TemplateScriptEngine {
    pub fn new() -> Self {
        Self {
            scopes: ScopeStack::new(),
            copied_text: None,
            log_sink: Box::new(|_| {}),
        }
    }

    fn lookup(&self, key: &str, extra: &HashMap<String, String>) -> Option<String> {
        if let Some(v) = extra.get(key) {
            return Some(v.clone());
        }
        if let Some(v) = self.scopes.get(key) {
            return Some(v.to_string());
        }
        match key {
            "copiedText" => self.copied_text.clone(),
            "time" => Some(Local::now().format("%H:%M:%S").to_string()),
            "date" => Some(Local::now().format("%Y-%m-%d").to_string()),
            "timestamp" => Some(Utc::now().timestamp().to_string()),
            _ => None,
        }
    }

    fn substitute(&self, text: &str, extra: &HashMap<String, String>) -> String {
        let re = Regex::new(r"\$\{([a-zA-Z0-9_.]+)\}").expect("valid template regex");
        re.replace_all(text, |caps: &regex::Captures| {
            let full_key = &caps[1];

            if let Some(value) = self.lookup(full_key, extra) {
                return value;
            }

            // "var.path.into.json": drill into a JSON-valued variable.
            if let Some((var_name, json_path)) = full_key.split_once('.') {
                if let Some(json_str) = self.lookup(var_name, extra) {
                    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&json_str) {
                        let pointer = format!("/{}", json_path.replace('.', "/"));
                        if let Some(target) = value.pointer(&pointer) {
                            return match target.as_str() {
                                Some(s) => s.to_string(),
                                None => target.to_string(),
                            };
                        }
                    }
                }
            }

            // Keep the original marker when nothing matches.
            format!("${{{full_key}}}")
        })
        .to_string()
    }
}

impl Default for TemplateScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptEngine for TemplateScriptEngine {
    fn put_env(&mut self, name: &str, value: &str) {
        self.scopes.put_env(name, value);
    }

    fn get_env(&self, name: &str) -> Option<String> {
        self.scopes.get(name).map(|s| s.to_string())
    }

    fn enter_scope(&mut self) {
        self.scopes.enter(ScopeKind::Lexical);
    }

    fn leave_scope(&mut self) {
        self.scopes.leave(ScopeKind::Lexical);
    }

    fn enter_env_scope(&mut self) {
        self.scopes.enter(ScopeKind::Env);
    }

    fn leave_env_scope(&mut self) {
        self.scopes.leave(ScopeKind::Env);
    }

    fn env_scope_depth(&self) -> usize {
        self.scopes.depth(ScopeKind::Env)
    }

    fn lexical_scope_depth(&self) -> usize {
        self.scopes.depth(ScopeKind::Lexical)
    }

    fn evaluate_script(
        &mut self,
        source: &str,
        env: &HashMap<String, String>,
        _source_name: &str,
        run_in_sub_scope: bool,
    ) -> Result<String, FlowError> {
        if run_in_sub_scope {
            self.enter_scope();
        }

        let substituted = self.substitute(source, env);
        let result = match substituted.split_once('=') {
            Some((name, value))
                if !value.starts_with('=')
                    && name.trim().chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                    && !name.trim().is_empty() =>
            {
                let value = value.trim().to_string();
                self.scopes.put_env(name.trim(), &value);
                value
            }
            _ => substituted,
        };

        if run_in_sub_scope {
            self.leave_scope();
        }
        (self.log_sink)(format!("evaluated: {result}"));
        Ok(result)
    }

    fn evaluate_template(&mut self, template: &str) -> Result<String, FlowError> {
        Ok(self.substitute(template, &HashMap::new()))
    }

    fn set_copied_text(&mut self, text: Option<String>) {
        self.copied_text = text;
    }

    fn on_log_message(&mut self, sink: Box<dyn Fn(String) + Send>) {
        self.log_sink = sink;
    }

    fn close(&mut self) {
        self.log_sink = Box::new(|_| {});
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitutes_known_variables() {
        let mut engine = TemplateScriptEngine::new();
        engine.put_env("name", "ada");
        assert_eq!(
            engine.evaluate_template("hi ${name}").unwrap(),
            "hi ada"
        );
    }

    #[test]
    fn test_unknown_variable_keeps_marker() {
        let mut engine = TemplateScriptEngine::new();
        assert_eq!(
            engine.evaluate_template("hi ${nobody}").unwrap(),
            "hi ${nobody}"
        );
    }

    #[test]
    fn test_json_path_drill_down() {
        let mut engine = TemplateScriptEngine::new();
        engine.put_env("response", r#"{"data":{"token":"abc"}}"#);
        assert_eq!(
            engine.evaluate_template("${response.data.token}").unwrap(),
            "abc"
        );
    }

    #[test]
    fn test_assignment_binds_value() {
        let mut engine = TemplateScriptEngine::new();
        engine.put_env("base", "10");
        engine
            .evaluate_script("total = ${base}", &HashMap::new(), "test", false)
            .unwrap();
        assert_eq!(engine.get_env("total"), Some("10".to_string()));
    }
}
