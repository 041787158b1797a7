//! Element resolution: compile a selector into filters, then poll the
//! hierarchy until a match appears or the deadline passes.
//!
//! Compilation is the only place that queries the live hierarchy, and only
//! for eager clauses: spatial anchors and `containsChild` resolve their
//! inner selector up front; `childOf` compiles the parent chain so each
//! poll re-resolves the scope inside the fresh snapshot.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::FlowError;
use crate::hierarchy::{TreeNode, ViewHierarchy};
use crate::runner::orchestrator::Orchestrator;
use crate::selector::filters::{self, ElementFilter};
use crate::selector::ElementSelector;

const FIND_POLL_INTERVAL_MS: u64 = 200;

/// A resolved element together with the snapshot it was found in.
pub struct FindResult {
    pub element: TreeNode,
    pub hierarchy: ViewHierarchy,
}

/// Selector lowered to pure filters plus the scoping parent chain.
pub(crate) struct CompiledSelector {
    pub description: String,
    pub filter: ElementFilter,
    pub index: Option<usize>,
    pub parent: Option<Box<CompiledSelector>>,
}

impl Orchestrator {
    /// Resolve a selector, waiting up to `timeout_ms`. Without an explicit
    /// timeout the default lookup window applies (the shorter optional
    /// window when the selector or command is optional), reduced by time
    /// already spent since the last interaction.
    pub(crate) async fn find_element(
        &mut self,
        selector: &ElementSelector,
        command_optional: bool,
        timeout_ms: Option<u64>,
    ) -> Result<FindResult, FlowError> {
        let timeout = match timeout_ms {
            Some(t) => t,
            None => {
                let base = if selector.optional || command_optional {
                    self.optional_lookup_timeout_ms
                } else {
                    self.lookup_timeout_ms
                };
                self.adjusted_to_latest_interaction(base)
            }
        };
        let compiled = self.compile_selector(selector).await?;
        self.find_with_timeout(&compiled, timeout).await
    }

    /// Poll the driver for a hierarchy matching `compiled`. Always probes
    /// at least once, so a zero timeout still checks the current screen.
    pub(crate) async fn find_with_timeout(
        &mut self,
        compiled: &CompiledSelector,
        timeout_ms: u64,
    ) -> Result<FindResult, FlowError> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let hierarchy = self.driver.view_hierarchy().await?;
            if let Some(element) = resolve_in(&hierarchy, compiled) {
                debug!(element = %compiled.description, "element found");
                return Ok(FindResult { element, hierarchy });
            }
            if Instant::now() >= deadline {
                return Err(FlowError::ElementNotFound {
                    description: compiled.description.clone(),
                    debug_message: format!(
                        "Element matching [{}] was not found within {timeout_ms} ms. The \
                         selector is a full match (text/id regexes must cover the whole \
                         value); loosen it, give the screen more time, or mark the command \
                         optional if the element may legitimately be absent.",
                        compiled.description
                    ),
                    hierarchy: Some(Box::new(hierarchy)),
                });
            }
            tokio::time::sleep(Duration::from_millis(FIND_POLL_INTERVAL_MS)).await;
        }
    }

    /// Lower a selector to `(description, filters, index, parent-chain)`.
    /// Async because eager clauses resolve live elements; recursion is
    /// boxed.
    pub(crate) fn compile_selector<'a>(
        &'a mut self,
        selector: &'a ElementSelector,
    ) -> Pin<Box<dyn Future<Output = Result<CompiledSelector, FlowError>> + Send + 'a>> {
        Box::pin(async move {
            let mut parts: Vec<ElementFilter> = Vec::new();

            if let Some(pattern) = &selector.text_regex {
                parts.push(filters::text_matches(filters::build_regex(pattern)?));
            }
            if let Some(pattern) = &selector.id_regex {
                parts.push(filters::id_matches(filters::build_regex(pattern)?));
            }
            if let Some(size) = &selector.size {
                parts.push(filters::size_matches(size.clone()));
            }
            for t in &selector.traits {
                parts.push(filters::has_trait(*t));
            }
            if let Some(v) = selector.enabled {
                parts.push(filters::enabled(v));
            }
            if let Some(v) = selector.selected {
                parts.push(filters::selected(v));
            }
            if let Some(v) = selector.checked {
                parts.push(filters::checked(v));
            }
            if let Some(v) = selector.focused {
                parts.push(filters::focused(v));
            }

            if let Some(anchor) = &selector.below {
                parts.push(filters::below(self.resolve_anchor_bounds(anchor).await?));
            }
            if let Some(anchor) = &selector.above {
                parts.push(filters::above(self.resolve_anchor_bounds(anchor).await?));
            }
            if let Some(anchor) = &selector.left_of {
                parts.push(filters::left_of(self.resolve_anchor_bounds(anchor).await?));
            }
            if let Some(anchor) = &selector.right_of {
                parts.push(filters::right_of(self.resolve_anchor_bounds(anchor).await?));
            }

            if let Some(child) = &selector.contains_child {
                let resolved = self.find_element(child, false, None).await?;
                parts.push(filters::contains_child(resolved.element));
            }
            if !selector.contains_descendants.is_empty() {
                let mut inner = Vec::new();
                for descendant in &selector.contains_descendants {
                    inner.push(self.compile_selector(descendant).await?.filter);
                }
                parts.push(filters::contains_descendants(inner));
            }
            if let Some(css) = &selector.css {
                parts.push(filters::attribute_equals("css", css.clone()));
            }

            let index = selector
                .index
                .as_ref()
                .map(|raw| {
                    raw.trim().parse::<usize>().map_err(|_| {
                        FlowError::InvalidCommand(format!("selector index is not a number: {raw}"))
                    })
                })
                .transpose()?;

            let parent = match &selector.child_of {
                Some(parent_selector) => {
                    Some(Box::new(self.compile_selector(parent_selector).await?))
                }
                None => None,
            };

            Ok(CompiledSelector {
                description: selector.description(),
                filter: filters::intersect(parts),
                index,
                parent,
            })
        })
    }

    async fn resolve_anchor_bounds(
        &mut self,
        anchor: &ElementSelector,
    ) -> Result<crate::hierarchy::Bounds, FlowError> {
        let resolved = self.find_element(anchor, false, None).await?;
        resolved.element.bounds().ok_or_else(|| {
            FlowError::InvalidCommand(format!(
                "anchor element {} has no bounds",
                anchor.description()
            ))
        })
    }
}

/// Resolve within one snapshot: scope through the parent chain (outermost
/// first), filter the scoped subtree, disambiguate.
fn resolve_in(hierarchy: &ViewHierarchy, compiled: &CompiledSelector) -> Option<TreeNode> {
    let scope_root = match &compiled.parent {
        Some(parent) => resolve_in(hierarchy, parent)?,
        None => hierarchy.root.clone(),
    };
    let scoped = ViewHierarchy::new(scope_root);
    let candidates = scoped.flatten();
    let matches = (compiled.filter)(&scoped, &candidates);
    filters::disambiguate(compiled.index, &matches)
}
