use serde::{Deserialize, Serialize};

use crate::driver::Platform;
use crate::error::FlowError;
use crate::script::ScriptEngine;
use crate::selector::ElementSelector;

/// Conjunctive guard deciding whether a command (or loop iteration) runs.
///
/// An empty condition is true. The script clause is resolved to its result
/// string by the substitution pass; the evaluator then applies truthiness
/// to that string.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Condition {
    pub platform: Option<Platform>,
    pub visible: Option<ElementSelector>,
    pub not_visible: Option<ElementSelector>,
    pub script: Option<String>,
}

impl Condition {
    pub fn is_empty(&self) -> bool {
        self.platform.is_none()
            && self.visible.is_none()
            && self.not_visible.is_none()
            && self.script.is_none()
    }

    pub fn description(&self) -> String {
        let mut parts = Vec::new();
        if let Some(p) = &self.platform {
            parts.push(format!("platform is {p:?}"));
        }
        if let Some(s) = &self.visible {
            parts.push(format!("{} is visible", s.description()));
        }
        if let Some(s) = &self.not_visible {
            parts.push(format!("{} is not visible", s.description()));
        }
        if let Some(s) = &self.script {
            parts.push(format!("{s} is true"));
        }
        if parts.is_empty() {
            "true".to_string()
        } else {
            parts.join(" and ")
        }
    }

    /// Resolve `${…}` in selector clauses and evaluate the script clause to
    /// its result string.
    pub fn evaluate_scripts(&self, engine: &mut dyn ScriptEngine) -> Result<Condition, FlowError> {
        Ok(Condition {
            platform: self.platform,
            visible: self
                .visible
                .as_ref()
                .map(|s| super::evaluate_selector(s, &mut *engine))
                .transpose()?,
            not_visible: self
                .not_visible
                .as_ref()
                .map(|s| super::evaluate_selector(s, &mut *engine))
                .transpose()?,
            script: self
                .script
                .as_ref()
                .map(|s| engine.evaluate_script(s, &Default::default(), "condition", false))
                .transpose()?,
        })
    }
}

/// Truthiness of an evaluated script-condition result: false iff empty,
/// "false"/"undefined"/"null" (any casing) or a numeric zero.
pub fn is_truthy(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return false;
    }
    let lowered = trimmed.to_ascii_lowercase();
    if lowered == "false" || lowered == "undefined" || lowered == "null" {
        return false;
    }
    if let Ok(n) = trimmed.parse::<f64>() {
        return n != 0.0;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(""));
        assert!(!is_truthy("  "));
        assert!(!is_truthy("false"));
        assert!(!is_truthy("FALSE"));
        assert!(!is_truthy("undefined"));
        assert!(!is_truthy("null"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy("0.0"));

        assert!(is_truthy("true"));
        assert!(is_truthy("1"));
        assert!(is_truthy("-3.5"));
        assert!(is_truthy("anything"));
    }

    #[test]
    fn test_empty_condition() {
        assert!(Condition::default().is_empty());
        assert_eq!(Condition::default().description(), "true");
    }
}
