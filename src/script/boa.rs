//! JavaScript backend using boa_engine.
//!
//! Each evaluation builds a fresh `Context` seeded from the visible scope
//! frames, the copy buffer and the dynamic time variables, then writes
//! observable results (changed bindings, the `output` object, console
//! lines) back into the scope stack. Keeping the `Context` evaluation-local
//! keeps the engine `Send` without an interpreter thread.

use boa_engine::{Context, JsValue, Source};
use chrono::{Local, Utc};
use regex::Regex;
use std::collections::HashMap;

use super::{ScopeKind, ScopeStack, ScriptEngine};
use crate::error::FlowError;

pub struct BoaScriptEngine {
    scopes: ScopeStack,
    copied_text: Option<String>,
    log_sink: Box<dyn Fn(String) + Send>,
}

impl BoaScriptEngine {
    pub fn new() -> Self {
        Self {
            scopes: ScopeStack::new(),
            copied_text: None,
            log_sink: Box::new(|_| {}),
        }
    }

    fn eval_in_context(
        &mut self,
        source: &str,
        extra_env: &HashMap<String, String>,
        source_name: &str,
        assignment_target: Option<&str>,
    ) -> Result<String, FlowError> {
        let script_err = |message: String| FlowError::Script {
            source_name: source_name.to_string(),
            message,
        };

        let mut context = Context::default();

        let mut prelude = String::new();
        prelude.push_str(&format!(
            "var time = {}; var date = {}; var timestamp = {};\n",
            js_literal(&Local::now().format("%H:%M:%S").to_string()),
            js_literal(&Local::now().format("%Y-%m-%d").to_string()),
            Utc::now().timestamp(),
        ));
        prelude.push_str(&format!(
            "var copiedText = {};\n",
            self.copied_text
                .as_deref()
                .map_or("null".to_string(), js_literal),
        ));
        prelude.push_str(
            "var __logs = [];\n\
             var console = { log: function() {\n\
                 var parts = [];\n\
                 for (var i = 0; i < arguments.length; i++) { parts.push(String(arguments[i])); }\n\
                 __logs.push(parts.join(' '));\n\
             } };\n",
        );

        let visible = self.scopes.flatten();
        let output_seed = visible
            .get("output")
            .filter(|s| serde_json::from_str::<serde_json::Value>(s).is_ok())
            .cloned()
            .unwrap_or_else(|| "{}".to_string());
        prelude.push_str(&format!("var output = {output_seed};\n"));

        let mut bound_names = Vec::new();
        for (name, value) in visible.iter().chain(extra_env.iter()) {
            if name == "output" || !is_identifier(name) {
                continue;
            }
            prelude.push_str(&format!("var {} = {};\n", name, js_literal(value)));
            bound_names.push(name.clone());
        }

        context
            .eval(Source::from_bytes(&prelude))
            .map_err(|e| script_err(format!("failed to seed environment: {e}")))?;

        let value = context
            .eval(Source::from_bytes(source))
            .map_err(|e| script_err(e.to_string()))?;
        let result = js_value_to_string(&value);

        // Forward console output to the registered sink.
        if let Ok(logs) = context.eval(Source::from_bytes("JSON.stringify(__logs)")) {
            if let Some(s) = logs.as_string() {
                if let Ok(serde_json::Value::Array(lines)) =
                    serde_json::from_str::<serde_json::Value>(&s.to_std_string_escaped())
                {
                    for line in lines {
                        if let Some(msg) = line.as_str() {
                            (self.log_sink)(msg.to_string());
                        }
                    }
                }
            }
        }

        // Persist the output object across evaluations within the flow.
        if let Ok(out) = context.eval(Source::from_bytes("JSON.stringify(output)")) {
            if let Some(s) = out.as_string() {
                let json = s.to_std_string_escaped();
                if json != "undefined" {
                    self.scopes.put_env("output", &json);
                }
            }
        }

        // Write changed bindings back into the frame that owns them.
        for name in &bound_names {
            if extra_env.contains_key(name) && !visible.contains_key(name) {
                continue;
            }
            if let Ok(value) = context.eval(Source::from_bytes(name.as_str())) {
                let current = js_value_to_string(&value);
                if visible.get(name).map(|s| s.as_str()) != Some(current.as_str()) {
                    self.scopes.set_existing(name, &current);
                }
            }
        }

        // A top-level assignment introduces its target into the env scope.
        if let Some(name) = assignment_target {
            if let Ok(value) = context.eval(Source::from_bytes(name)) {
                self.scopes.put_env(name, &js_value_to_string(&value));
            }
        }

        Ok(result)
    }
}

impl Default for BoaScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptEngine for BoaScriptEngine {
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
        source_name: &str,
        run_in_sub_scope: bool,
    ) -> Result<String, FlowError> {
        let assignment_target = if run_in_sub_scope {
            None
        } else {
            assignment_target(source)
        };

        if run_in_sub_scope {
            self.enter_scope();
        }
        let result = self.eval_in_context(source, env, source_name, assignment_target.as_deref());
        if run_in_sub_scope {
            self.leave_scope();
        }
        result
    }

    fn evaluate_template(&mut self, template: &str) -> Result<String, FlowError> {
        if !template.contains("${") {
            return Ok(template.to_string());
        }

        let re = Regex::new(r"\$\{([^}]+)\}").expect("valid template regex");
        let mut out = String::with_capacity(template.len());
        let mut last = 0;
        for caps in re.captures_iter(template) {
            let whole = caps.get(0).expect("match");
            out.push_str(&template[last..whole.start()]);

            let expr = caps.get(1).expect("group").as_str().trim();
            // Missing identifiers render as "undefined" (the value a script
            // condition tests for); real script errors still propagate.
            let wrapped = format!(
                "(function() {{ try {{ return String({expr}); }} \
                 catch (e) {{ if (e instanceof ReferenceError) return 'undefined'; throw e; }} }})()"
            );
            let value = self.eval_in_context(&wrapped, &HashMap::new(), "template", None)?;
            out.push_str(&value);
            last = whole.end();
        }
        out.push_str(&template[last..]);
        Ok(out)
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

/// Detect a plain top-level assignment (`name = expr`) so its target can be
/// captured into the environment. Comparisons are excluded.
fn assignment_target(source: &str) -> Option<String> {
    let re = Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*=[^=]").expect("valid regex");
    re.captures(source)
        .map(|c| c.get(1).expect("group").as_str().to_string())
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Render a variable value as a JS literal: plain numbers and booleans pass
/// through, everything else becomes a quoted string. The digit check keeps
/// spellings like "inf" or "NaN" (accepted by the float parser, not by JS)
/// on the string path.
fn js_literal(value: &str) -> String {
    let numeric = value.parse::<f64>().is_ok()
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'));
    if numeric || value == "true" || value == "false" {
        value.to_string()
    } else {
        serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
    }
}

fn js_value_to_string(value: &JsValue) -> String {
    if value.is_undefined() {
        "undefined".to_string()
    } else if value.is_null() {
        "null".to_string()
    } else if let Some(b) = value.as_boolean() {
        b.to_string()
    } else if let Some(n) = value.as_number() {
        if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
            (n as i64).to_string()
        } else {
            n.to_string()
        }
    } else if let Some(s) = value.as_string() {
        s.to_std_string_escaped()
    } else {
        format!("{value:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval_arithmetic() {
        let mut engine = BoaScriptEngine::new();
        assert_eq!(
            engine
                .evaluate_script("1 + 2", &HashMap::new(), "test", false)
                .unwrap(),
            "3"
        );
        assert_eq!(
            engine
                .evaluate_script("'a' + 'b'", &HashMap::new(), "test", false)
                .unwrap(),
            "ab"
        );
    }

    #[test]
    fn test_env_variables_are_visible() {
        let mut engine = BoaScriptEngine::new();
        engine.put_env("count", "5");
        engine.put_env("name", "flow");
        assert_eq!(
            engine
                .evaluate_script("count + 1", &HashMap::new(), "test", false)
                .unwrap(),
            "6"
        );
        assert_eq!(
            engine
                .evaluate_script("name", &HashMap::new(), "test", false)
                .unwrap(),
            "flow"
        );
    }

    #[test]
    fn test_assignment_lands_in_env() {
        let mut engine = BoaScriptEngine::new();
        engine
            .evaluate_script("x = 10 + 5", &HashMap::new(), "test", false)
            .unwrap();
        assert_eq!(engine.get_env("x"), Some("15".to_string()));
    }

    #[test]
    fn test_template_substitution() {
        let mut engine = BoaScriptEngine::new();
        engine.put_env("user", "ada");
        assert_eq!(
            engine.evaluate_template("hello ${user}!").unwrap(),
            "hello ada!"
        );
        assert_eq!(
            engine.evaluate_template("${1 + 1} items").unwrap(),
            "2 items"
        );
        // No template markers: untouched, including percent points.
        assert_eq!(engine.evaluate_template("50%,50%").unwrap(), "50%,50%");
        // Missing identifier renders as undefined rather than failing.
        assert_eq!(engine.evaluate_template("${missing}").unwrap(), "undefined");
    }

    #[test]
    fn test_sub_scope_declarations_do_not_escape() {
        let mut engine = BoaScriptEngine::new();
        engine.put_env("visible", "1");
        engine
            .evaluate_script("var hidden = 42; visible = 2", &HashMap::new(), "test", true)
            .unwrap();
        assert_eq!(engine.get_env("visible"), Some("2".to_string()));
        assert_eq!(engine.get_env("hidden"), None);
    }

    #[test]
    fn test_console_log_reaches_sink() {
        use std::sync::{Arc, Mutex};
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();

        let mut engine = BoaScriptEngine::new();
        engine.on_log_message(Box::new(move |msg| sink.lock().unwrap().push(msg)));
        engine
            .evaluate_script("console.log('hello', 1)", &HashMap::new(), "test", true)
            .unwrap();
        assert_eq!(lines.lock().unwrap().as_slice(), ["hello 1"]);
    }

    #[test]
    fn test_output_persists_across_evaluations() {
        let mut engine = BoaScriptEngine::new();
        engine
            .evaluate_script("output.token = 'abc'", &HashMap::new(), "test", true)
            .unwrap();
        assert_eq!(
            engine
                .evaluate_script("output.token", &HashMap::new(), "test", true)
                .unwrap(),
            "abc"
        );
    }

    #[test]
    fn test_copied_text_is_exposed() {
        let mut engine = BoaScriptEngine::new();
        engine.set_copied_text(Some("clip".to_string()));
        assert_eq!(
            engine
                .evaluate_script("copiedText", &HashMap::new(), "test", false)
                .unwrap(),
            "clip"
        );
    }

    #[test]
    fn test_script_error_names_the_source() {
        let mut engine = BoaScriptEngine::new();
        let err = engine
            .evaluate_script("syntax error here", &HashMap::new(), "login.js", false)
            .unwrap_err();
        match err {
            FlowError::Script { source_name, .. } => assert_eq!(source_name, "login.js"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
