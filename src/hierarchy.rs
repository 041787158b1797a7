use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A snapshot of the UI tree reported by the driver at a point in time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ViewHierarchy {
    pub root: TreeNode,
}

impl ViewHierarchy {
    pub fn new(root: TreeNode) -> Self {
        Self { root }
    }

    /// All nodes of the tree in document order (depth-first, parent first).
    pub fn flatten(&self) -> Vec<TreeNode> {
        self.root.flatten()
    }
}

/// A single node of the view hierarchy.
///
/// Attributes are driver-reported strings (`text`, `hintText`,
/// `accessibilityText`, `resource-id`, `bounds`, `css`, ...). Boolean UI
/// state is kept out of the map so filters can match on it without string
/// comparisons.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TreeNode {
    #[serde(default)]
    pub attributes: HashMap<String, String>,

    #[serde(default)]
    pub clickable: Option<bool>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub focused: Option<bool>,
    #[serde(default)]
    pub checked: Option<bool>,
    #[serde(default)]
    pub selected: Option<bool>,

    #[serde(default)]
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn new(attributes: HashMap<String, String>) -> Self {
        Self {
            attributes,
            ..Default::default()
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(|s| s.as_str())
    }

    /// Bounds parsed from the `bounds` attribute (`"[l,t][r,b]"` form).
    pub fn bounds(&self) -> Option<Bounds> {
        self.attr("bounds").and_then(Bounds::from_string)
    }

    pub fn flatten(&self) -> Vec<TreeNode> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect(&self, out: &mut Vec<TreeNode>) {
        out.push(self.clone());
        for child in &self.children {
            child.collect(out);
        }
    }

    /// Whether `other` is this node or one of its descendants.
    pub fn contains(&self, other: &TreeNode) -> bool {
        if self == other {
            return true;
        }
        self.children.iter().any(|c| c.contains(other))
    }
}

/// Pixel-space rectangle of a node on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Bounds {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Bounds {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Parse bounds from a string like "[0,0][1080,1920]".
    pub fn from_string(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split("][").collect();
        if parts.len() != 2 {
            return None;
        }

        let left_top = parts[0].trim_start_matches('[');
        let right_bottom = parts[1].trim_end_matches(']');

        let lt: Vec<i32> = left_top.split(',').filter_map(|v| v.trim().parse().ok()).collect();
        let rb: Vec<i32> = right_bottom
            .split(',')
            .filter_map(|v| v.trim().parse().ok())
            .collect();

        if lt.len() == 2 && rb.len() == 2 {
            Some(Bounds {
                left: lt[0],
                top: lt[1],
                right: rb[0],
                bottom: rb[1],
            })
        } else {
            None
        }
    }

    pub fn width(&self) -> i32 {
        (self.right - self.left).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.bottom - self.top).max(0)
    }

    pub fn center(&self) -> (i32, i32) {
        ((self.left + self.right) / 2, (self.top + self.bottom) / 2)
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.left && x < self.right && y >= self.top && y < self.bottom
    }

    /// Fraction of this rectangle visible inside a `width` x `height`
    /// viewport, sampled over a 10x10 grid of interior points.
    pub fn visibility_percentage(&self, width: i32, height: i32) -> f64 {
        if self.width() == 0 || self.height() == 0 {
            return 0.0;
        }
        const GRID: i32 = 10;
        let mut visible = 0;
        let mut total = 0;
        for gy in 0..GRID {
            for gx in 0..GRID {
                let x = self.left + self.width() * (2 * gx + 1) / (2 * GRID);
                let y = self.top + self.height() * (2 * gy + 1) / (2 * GRID);
                total += 1;
                if x >= 0 && x < width && y >= 0 && y < height {
                    visible += 1;
                }
            }
        }
        visible as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(text: &str, children: Vec<TreeNode>) -> TreeNode {
        let mut attributes = HashMap::new();
        attributes.insert("text".to_string(), text.to_string());
        TreeNode {
            attributes,
            children,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_bounds() {
        let b = Bounds::from_string("[0,0][1080,1920]").unwrap();
        assert_eq!(b.width(), 1080);
        assert_eq!(b.height(), 1920);
        assert_eq!(b.center(), (540, 960));

        assert!(Bounds::from_string("not bounds").is_none());
    }

    #[test]
    fn test_flatten_document_order() {
        let tree = node("a", vec![node("b", vec![node("c", vec![])]), node("d", vec![])]);
        let texts: Vec<_> = tree
            .flatten()
            .iter()
            .map(|n| n.attr("text").unwrap().to_string())
            .collect();
        assert_eq!(texts, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_contains() {
        let inner = node("inner", vec![]);
        let tree = node("outer", vec![inner.clone()]);
        assert!(tree.contains(&inner));
        assert!(!inner.contains(&tree));
    }

    #[test]
    fn test_visibility_percentage() {
        let fully = Bounds::new(0, 0, 100, 100);
        assert!(fully.visibility_percentage(1080, 1920) > 0.99);

        let half_off = Bounds::new(-50, 0, 50, 100);
        let pct = half_off.visibility_percentage(1080, 1920);
        assert!(pct > 0.4 && pct < 0.6, "expected ~50%, got {pct}");

        let off_screen = Bounds::new(2000, 0, 2100, 100);
        assert_eq!(off_screen.visibility_percentage(1080, 1920), 0.0);
    }
}
