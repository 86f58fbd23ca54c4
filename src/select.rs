use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client-specified subset of fields to include in a response.
///
/// Two wire forms are accepted: a flat list of field names
/// (`["id", "content"]`) or a nested map where each value is either `true`
/// (keep the field as-is) or another selection to recurse into
/// (`{"id": true, "author": {"name": true}}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldSelection {
    /// Flat list form: keep exactly these keys.
    Fields(Vec<String>),
    /// Map form: `true` keeps the whole value, a nested selection recurses.
    Nested(BTreeMap<String, SelectionNode>),
}

/// A single entry in the map form of a [`FieldSelection`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SelectionNode {
    /// `true` keeps the field untouched, `false` drops it.
    Keep(bool),
    /// Recurse into the corresponding sub-object (or each array element).
    Select(FieldSelection),
}

impl FieldSelection {
    /// Build a flat selection from a list of field names.
    pub fn fields<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Fields(names.into_iter().map(Into::into).collect())
    }
}

/// Prune `data` down to the fields named by `selection`.
///
/// `None` returns the data unchanged. Objects keep only selected keys,
/// selections map over array elements, and primitives pass through untouched
/// since selection only prunes object/array shapes. Requested fields that are
/// absent on a given instance are silently omitted.
///
/// Pure function: no side effects, deterministic for identical inputs.
pub fn apply_field_selection(data: &Value, selection: Option<&FieldSelection>) -> Value {
    let Some(selection) = selection else {
        return data.clone();
    };

    match data {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| apply_field_selection(item, Some(selection)))
                .collect(),
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            match selection {
                FieldSelection::Fields(names) => {
                    for name in names {
                        if let Some(value) = map.get(name) {
                            out.insert(name.clone(), value.clone());
                        }
                    }
                }
                FieldSelection::Nested(nodes) => {
                    for (name, node) in nodes {
                        let Some(value) = map.get(name) else {
                            continue;
                        };
                        match node {
                            SelectionNode::Keep(true) => {
                                out.insert(name.clone(), value.clone());
                            }
                            SelectionNode::Keep(false) => {}
                            SelectionNode::Select(inner) => {
                                out.insert(
                                    name.clone(),
                                    apply_field_selection(value, Some(inner)),
                                );
                            }
                        }
                    }
                }
            }
            Value::Object(out)
        }
        // Selection only prunes object/array shapes.
        other => other.clone(),
    }
}
