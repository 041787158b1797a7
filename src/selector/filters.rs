//! Pure node filters composed out of selector clauses.
//!
//! A filter narrows a candidate list against a hierarchy snapshot; clause
//! filters are intersected in order and a disambiguator picks the final
//! element. Nothing here blocks or talks to the driver — eager clauses
//! (spatial anchors, `containsChild`) receive their already-resolved
//! element.

use std::sync::Arc;

use regex::{Regex, RegexBuilder};

use crate::error::FlowError;
use crate::hierarchy::{Bounds, TreeNode, ViewHierarchy};
use crate::selector::{ElementTrait, SizeSpec};

pub type ElementFilter = Arc<dyn Fn(&ViewHierarchy, &[TreeNode]) -> Vec<TreeNode> + Send + Sync>;

/// Compile a selector regex: case-insensitive, dot-matches-all, multiline,
/// matching the whole string.
pub fn build_regex(pattern: &str) -> Result<Regex, FlowError> {
    RegexBuilder::new(&format!(r"\A(?:{pattern})\z"))
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .multi_line(true)
        .build()
        .map_err(|e| FlowError::InvalidCommand(format!("invalid regex '{pattern}': {e}")))
}

/// Apply `filters` left to right, each narrowing the previous result.
pub fn intersect(filters: Vec<ElementFilter>) -> ElementFilter {
    Arc::new(move |hierarchy, candidates| {
        let mut current: Vec<TreeNode> = candidates.to_vec();
        for filter in &filters {
            current = filter(hierarchy, &current);
            if current.is_empty() {
                break;
            }
        }
        current
    })
}

/// Matches when any of `text`, `hintText` or `accessibilityText` matches.
pub fn text_matches(regex: Regex) -> ElementFilter {
    Arc::new(move |_, candidates| {
        candidates
            .iter()
            .filter(|n| {
                ["text", "hintText", "accessibilityText"]
                    .iter()
                    .filter_map(|a| n.attr(a))
                    .any(|v| regex.is_match(v))
            })
            .cloned()
            .collect()
    })
}

pub fn id_matches(regex: Regex) -> ElementFilter {
    Arc::new(move |_, candidates| {
        candidates
            .iter()
            .filter(|n| n.attr("resource-id").is_some_and(|v| regex.is_match(v)))
            .cloned()
            .collect()
    })
}

pub fn size_matches(spec: SizeSpec) -> ElementFilter {
    Arc::new(move |_, candidates| {
        let tolerance = spec.tolerance.unwrap_or(0);
        candidates
            .iter()
            .filter(|n| {
                let Some(bounds) = n.bounds() else {
                    return false;
                };
                let width_ok = spec
                    .width
                    .map_or(true, |w| (bounds.width() - w).abs() <= tolerance);
                let height_ok = spec
                    .height
                    .map_or(true, |h| (bounds.height() - h).abs() <= tolerance);
                width_ok && height_ok
            })
            .cloned()
            .collect()
    })
}

pub fn has_trait(t: ElementTrait) -> ElementFilter {
    Arc::new(move |_, candidates| {
        candidates
            .iter()
            .filter(|n| match t {
                ElementTrait::Text => n.attr("text").is_some_and(|s| !s.is_empty()),
                ElementTrait::TextInput => n.attr("editable").is_some_and(|s| s == "true"),
                ElementTrait::Clickable => n.clickable == Some(true),
                ElementTrait::Scrollable => n.attr("scrollable").is_some_and(|s| s == "true"),
            })
            .cloned()
            .collect()
    })
}

pub fn enabled(value: bool) -> ElementFilter {
    bool_state(value, |n| n.enabled)
}

pub fn selected(value: bool) -> ElementFilter {
    bool_state(value, |n| n.selected)
}

pub fn checked(value: bool) -> ElementFilter {
    bool_state(value, |n| n.checked)
}

pub fn focused(value: bool) -> ElementFilter {
    bool_state(value, |n| n.focused)
}

fn bool_state(value: bool, get: impl Fn(&TreeNode) -> Option<bool> + Send + Sync + 'static) -> ElementFilter {
    Arc::new(move |_, candidates| {
        candidates
            .iter()
            .filter(|n| get(n) == Some(value))
            .cloned()
            .collect()
    })
}

/// Candidates strictly below the anchor, nearest first.
pub fn below(anchor: Bounds) -> ElementFilter {
    spatial(anchor, |b, a| b.top >= a.bottom, |b, a| b.top - a.bottom)
}

pub fn above(anchor: Bounds) -> ElementFilter {
    spatial(anchor, |b, a| b.bottom <= a.top, |b, a| a.top - b.bottom)
}

pub fn left_of(anchor: Bounds) -> ElementFilter {
    spatial(anchor, |b, a| b.right <= a.left, |b, a| a.left - b.right)
}

pub fn right_of(anchor: Bounds) -> ElementFilter {
    spatial(anchor, |b, a| b.left >= a.right, |b, a| b.left - a.right)
}

fn spatial(
    anchor: Bounds,
    keep: impl Fn(&Bounds, &Bounds) -> bool + Send + Sync + 'static,
    distance: impl Fn(&Bounds, &Bounds) -> i32 + Send + Sync + 'static,
) -> ElementFilter {
    Arc::new(move |_, candidates| {
        let mut kept: Vec<(i32, TreeNode)> = candidates
            .iter()
            .filter_map(|n| {
                let bounds = n.bounds()?;
                keep(&bounds, &anchor).then(|| (distance(&bounds, &anchor), n.clone()))
            })
            .collect();
        kept.sort_by_key(|(d, _)| *d);
        kept.into_iter().map(|(_, n)| n).collect()
    })
}

/// Keeps nodes having the resolved element as a direct child.
pub fn contains_child(child: TreeNode) -> ElementFilter {
    Arc::new(move |_, candidates| {
        candidates
            .iter()
            .filter(|n| n.children.iter().any(|c| *c == child))
            .cloned()
            .collect()
    })
}

/// Keeps nodes whose subtree satisfies every descendant filter. Lazy: the
/// inner filters run against each candidate's subtree, no pre-resolution.
pub fn contains_descendants(descendants: Vec<ElementFilter>) -> ElementFilter {
    Arc::new(move |_, candidates| {
        candidates
            .iter()
            .filter(|n| {
                let subtree = ViewHierarchy::new((*n).clone());
                let nodes = subtree.flatten();
                descendants
                    .iter()
                    .all(|f| !f(&subtree, &nodes).is_empty())
            })
            .cloned()
            .collect()
    })
}

pub fn attribute_equals(name: &'static str, value: String) -> ElementFilter {
    Arc::new(move |_, candidates| {
        candidates
            .iter()
            .filter(|n| n.attr(name) == Some(value.as_str()))
            .cloned()
            .collect()
    })
}

/// Final pick among filtered matches: explicit index wins, then the first
/// clickable element, then the first element in document order.
pub fn disambiguate(index: Option<usize>, matches: &[TreeNode]) -> Option<TreeNode> {
    if let Some(i) = index {
        return matches.get(i).cloned();
    }
    matches
        .iter()
        .find(|n| n.clickable == Some(true))
        .or_else(|| matches.first())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn node(attrs: &[(&str, &str)]) -> TreeNode {
        let attributes: HashMap<String, String> = attrs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TreeNode::new(attributes)
    }

    fn hierarchy_of(children: Vec<TreeNode>) -> ViewHierarchy {
        ViewHierarchy::new(TreeNode {
            children,
            ..Default::default()
        })
    }

    #[test]
    fn test_text_matches_is_case_insensitive_full_match() {
        let h = hierarchy_of(vec![
            node(&[("text", "Login")]),
            node(&[("text", "Login to continue")]),
        ]);
        let nodes = h.flatten();

        let filter = text_matches(build_regex("login").unwrap());
        let out = filter(&h, &nodes);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].attr("text"), Some("Login"));

        let filter = text_matches(build_regex("login.*").unwrap());
        assert_eq!(filter(&h, &nodes).len(), 2);
    }

    #[test]
    fn test_text_matches_falls_back_to_hint_and_accessibility() {
        let h = hierarchy_of(vec![
            node(&[("hintText", "Email")]),
            node(&[("accessibilityText", "Email")]),
        ]);
        let nodes = h.flatten();
        let filter = text_matches(build_regex("email").unwrap());
        assert_eq!(filter(&h, &nodes).len(), 2);
    }

    #[test]
    fn test_size_matches_with_tolerance() {
        let h = hierarchy_of(vec![node(&[("bounds", "[0,0][100,50]")])]);
        let nodes = h.flatten();

        let exact = size_matches(SizeSpec {
            width: Some(100),
            height: Some(50),
            tolerance: None,
        });
        assert_eq!(exact(&h, &nodes).len(), 1);

        let near = size_matches(SizeSpec {
            width: Some(104),
            height: None,
            tolerance: Some(5),
        });
        assert_eq!(near(&h, &nodes).len(), 1);

        let off = size_matches(SizeSpec {
            width: Some(120),
            height: None,
            tolerance: Some(5),
        });
        assert!(off(&h, &nodes).is_empty());
    }

    #[test]
    fn test_below_orders_by_distance() {
        let anchor = Bounds::new(0, 0, 100, 100);
        let far = node(&[("text", "far"), ("bounds", "[0,500][100,600]")]);
        let close = node(&[("text", "close"), ("bounds", "[0,150][100,250]")]);
        let h = hierarchy_of(vec![far.clone(), close.clone()]);
        let nodes = h.flatten();

        let out = below(anchor)(&h, &nodes);
        assert_eq!(out[0].attr("text"), Some("close"));
        assert_eq!(out[1].attr("text"), Some("far"));
    }

    #[test]
    fn test_disambiguate_prefers_clickable() {
        let plain = node(&[("text", "a")]);
        let mut clickable_node = node(&[("text", "b")]);
        clickable_node.clickable = Some(true);

        let picked = disambiguate(None, &[plain.clone(), clickable_node.clone()]).unwrap();
        assert_eq!(picked.attr("text"), Some("b"));

        let picked = disambiguate(Some(0), &[plain.clone(), clickable_node]).unwrap();
        assert_eq!(picked.attr("text"), Some("a"));

        assert!(disambiguate(Some(5), &[plain]).is_none());
    }

    #[test]
    fn test_contains_descendants_is_lazy_per_candidate() {
        let child = node(&[("text", "Price")]);
        let card = TreeNode {
            children: vec![child],
            ..node(&[("resource-id", "card")])
        };
        let other = node(&[("resource-id", "card")]);
        let h = hierarchy_of(vec![card, other]);
        let nodes = h.flatten();

        let inner = text_matches(build_regex("price").unwrap());
        let filter = contains_descendants(vec![inner]);
        let out = filter(&h, &nodes);
        // The card itself and its child subtree both contain the match;
        // only nodes whose subtree holds "Price" survive.
        assert!(out.iter().all(|n| {
            ViewHierarchy::new(n.clone())
                .flatten()
                .iter()
                .any(|m| m.attr("text") == Some("Price"))
        }));
        assert!(!out.is_empty());
    }
}
