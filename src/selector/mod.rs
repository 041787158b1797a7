pub mod filters;

use serde::{Deserialize, Serialize};

/// Declarative matcher resolved against a view-hierarchy snapshot.
///
/// Every populated clause contributes one filter (intersection semantics)
/// and one fragment of the human-readable description used in lookup
/// failures. Spatial clauses (`below`/`above`/`left_of`/`right_of`) and
/// `contains_child` are resolved against a live element before filtering;
/// `child_of` scopes the search to a resolved parent subtree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ElementSelector {
    pub text_regex: Option<String>,
    pub id_regex: Option<String>,
    pub size: Option<SizeSpec>,
    pub traits: Vec<ElementTrait>,

    pub enabled: Option<bool>,
    pub selected: Option<bool>,
    pub checked: Option<bool>,
    pub focused: Option<bool>,

    pub below: Option<Box<ElementSelector>>,
    pub above: Option<Box<ElementSelector>>,
    pub left_of: Option<Box<ElementSelector>>,
    pub right_of: Option<Box<ElementSelector>>,

    pub child_of: Option<Box<ElementSelector>>,
    pub contains_child: Option<Box<ElementSelector>>,
    pub contains_descendants: Vec<ElementSelector>,

    pub css: Option<String>,

    /// 0-based pick among matches, kept as a string so it can carry `${…}`
    /// until the substitution pass has run.
    pub index: Option<String>,

    pub optional: bool,
}

impl ElementSelector {
    pub fn text(pattern: impl Into<String>) -> Self {
        Self {
            text_regex: Some(pattern.into()),
            ..Default::default()
        }
    }

    pub fn id(pattern: impl Into<String>) -> Self {
        Self {
            id_regex: Some(pattern.into()),
            ..Default::default()
        }
    }

    /// Human-readable rendition of all populated clauses.
    pub fn description(&self) -> String {
        let mut parts = Vec::new();
        if let Some(t) = &self.text_regex {
            parts.push(format!("\"{t}\""));
        }
        if let Some(id) = &self.id_regex {
            parts.push(format!("id: {id}"));
        }
        if let Some(size) = &self.size {
            parts.push(size.description());
        }
        for t in &self.traits {
            parts.push(format!("has trait: {t:?}"));
        }
        if let Some(v) = self.enabled {
            parts.push(format!("enabled: {v}"));
        }
        if let Some(v) = self.selected {
            parts.push(format!("selected: {v}"));
        }
        if let Some(v) = self.checked {
            parts.push(format!("checked: {v}"));
        }
        if let Some(v) = self.focused {
            parts.push(format!("focused: {v}"));
        }
        if let Some(s) = &self.below {
            parts.push(format!("below: {}", s.description()));
        }
        if let Some(s) = &self.above {
            parts.push(format!("above: {}", s.description()));
        }
        if let Some(s) = &self.left_of {
            parts.push(format!("left of: {}", s.description()));
        }
        if let Some(s) = &self.right_of {
            parts.push(format!("right of: {}", s.description()));
        }
        if let Some(s) = &self.child_of {
            parts.push(format!("child of: {}", s.description()));
        }
        if let Some(s) = &self.contains_child {
            parts.push(format!("contains child: {}", s.description()));
        }
        for s in &self.contains_descendants {
            parts.push(format!("contains descendant: {}", s.description()));
        }
        if let Some(css) = &self.css {
            parts.push(format!("css: {css}"));
        }
        if let Some(i) = &self.index {
            parts.push(format!("index: {i}"));
        }

        if parts.is_empty() {
            "(any element)".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// Expected element dimensions with an optional pixel tolerance.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SizeSpec {
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub tolerance: Option<i32>,
}

impl SizeSpec {
    fn description(&self) -> String {
        format!(
            "size: {}x{} (±{})",
            self.width.map_or("*".to_string(), |w| w.to_string()),
            self.height.map_or("*".to_string(), |h| h.to_string()),
            self.tolerance.unwrap_or(0),
        )
    }
}

/// Coarse element kinds matchable without platform-specific class names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ElementTrait {
    /// Carries visible text.
    Text,
    /// Accepts text input.
    TextInput,
    /// Reacts to taps.
    Clickable,
    /// Scrollable container.
    Scrollable,
}
