//! Coordinate-driven element resolution over a UI hierarchy snapshot.
//!
//! Given a [`HierarchyNode`] tree and a point, [`find_smallest_containing`]
//! returns the deepest element whose bounds contain the point and
//! [`synthesize_locator`] builds a structural XPath-style locator for it.
//!
//! Snapshots are never validated: a node whose `bounds` cannot be parsed
//! simply does not match, so a malformed snapshot degrades to "no element".

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::element::{Bounds, HierarchyNode, Point};

/// Attributes that become locator predicates, in emission order.
const PREDICATE_ATTRIBUTES: [&str; 4] = ["resource-id", "content-desc", "text", "index"];

/// The element resolved for a touch: its locator plus every snapshot attribute.
///
/// Serializes flat, as `{"xpath": "...", "class": "...", "bounds": "...", ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementData {
    pub xpath: String,

    #[serde(flatten)]
    pub attributes: BTreeMap<String, String>,
}

impl ElementData {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// Finds the deepest node whose bounds contain `point`.
///
/// The walk is depth-first. A containing node is superseded by the last of
/// its children that yields a match; a node without `bounds` forwards the
/// last match among its children; a node whose `bounds` is present but
/// unparsable yields no match and its subtree is not explored.
pub fn find_smallest_containing(root: &HierarchyNode, point: Point) -> Option<&HierarchyNode> {
    let own = match root.attr("bounds") {
        Some(raw) => {
            let bounds = Bounds::parse(raw)?;
            if !bounds.contains(point) {
                return None;
            }
            Some(root)
        }
        None => None,
    };

    root.children
        .iter()
        .filter_map(|child| find_smallest_containing(child, point))
        .last()
        .or(own)
}

/// Builds a structural locator for `node`.
///
/// The form is `//type[@attr='v' and ...]` where `type` is the element type
/// (or `*`) and predicates appear in the fixed order resource-id,
/// content-desc, text, index for each non-empty attribute.
pub fn synthesize_locator(node: &HierarchyNode) -> String {
    let element_type = node.element_type().unwrap_or("*");
    let predicates: Vec<String> = PREDICATE_ATTRIBUTES
        .iter()
        .filter_map(|name| {
            node.non_empty_attr(name)
                .map(|value| format!("@{name}={}", quote(value)))
        })
        .collect();

    if predicates.is_empty() {
        format!("//{element_type}")
    } else {
        format!("//{element_type}[{}]", predicates.join(" and "))
    }
}

fn quote(value: &str) -> String {
    if value.contains('\'') {
        format!("\"{value}\"")
    } else {
        format!("'{value}'")
    }
}

/// Builds the [`ElementData`] payload for a resolved node.
pub fn element_data(node: &HierarchyNode) -> ElementData {
    let mut attributes = node.attributes.clone();
    // `xpath` is reserved for the synthesized locator.
    attributes.remove("xpath");
    ElementData {
        xpath: synthesize_locator(node),
        attributes,
    }
}

/// Resolves `point` against `root` and returns the element payload, if any.
pub fn resolve(root: &HierarchyNode, point: Point) -> Option<ElementData> {
    find_smallest_containing(root, point).map(element_data)
}
