//! Update strategy engine.
//!
//! Computes the payload sent to a live subscriber when a value changes, and
//! applies that payload on the receiving side. Three concrete strategies plus
//! an automatic selector:
//!
//! - **Value** — send the full new value. Always correct, used as the safe
//!   default and as the fallback when a smarter mode cannot represent a change.
//! - **Delta** — send only the appended suffix of a growing string (e.g. text
//!   generated incrementally).
//! - **Patch** — send an ordered list of structural operations transforming
//!   one object into another.
//! - **Auto** — pick a mode per field from static resource configuration, not
//!   per-message heuristics, so client and server always agree on which
//!   `apply` to run.
//!
//! The round-trip law holds for every mode:
//! `apply(prev, encode(mode, prev, next)) == next`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LensError, Result};

/// Requested encoding for subscription updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    Value,
    Delta,
    Patch,
    #[default]
    Auto,
}

/// Static update configuration carried by a resource definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UpdateStrategy {
    pub mode: StrategyMode,
    /// Fields whose runtime behavior is delta-oriented (text built up by
    /// appends). All other fields default to value/patch depending on shape.
    pub streaming_fields: Vec<String>,
}

/// Whether update modes are chosen automatically or pinned by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StrategyMode {
    #[default]
    Auto,
    Manual,
}

impl UpdateStrategy {
    pub fn streaming(fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            mode: StrategyMode::Auto,
            streaming_fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_streaming_field(&self, field: &str) -> bool {
        self.streaming_fields.iter().any(|f| f == field)
    }
}

/// One structural operation in a patch. Paths address object keys only;
/// array-valued fields are replaced wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    Add { path: Vec<String>, value: Value },
    Remove { path: Vec<String> },
    Replace { path: Vec<String>, value: Value },
}

/// The encoded representation of one change, as sent to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum UpdatePayload {
    /// Full replacement value.
    Value(Value),
    /// Appended string suffix; concatenated onto the previous value.
    Delta(String),
    /// Ordered structural ops; must be applied in emission order.
    Patch(Vec<PatchOp>),
}

/// Pick the effective mode for an `Auto` subscription.
///
/// Selection is static: string values of fields marked `streaming_fields` on
/// the owning resource use Delta, object-to-object changes use Patch, and
/// everything else (scalars, first emission with no prior snapshot) uses
/// Value. No runtime mode-switching per field.
pub fn resolve_auto(
    strategy: &UpdateStrategy,
    field: Option<&str>,
    prev: Option<&Value>,
    next: &Value,
) -> UpdateMode {
    if let Some(field) = field {
        if strategy.is_streaming_field(field) && next.is_string() {
            return UpdateMode::Delta;
        }
    }
    match prev {
        Some(p) if p.is_object() && next.is_object() => UpdateMode::Patch,
        _ => UpdateMode::Value,
    }
}

/// Encode the change from `prev` to `next` under the given mode (server side).
///
/// Delta and Patch fall back to Value when their preconditions do not hold
/// (non-extending string change, non-object operands), so every payload
/// produced here is applicable. `Auto` here resolves without resource
/// configuration; callers that have a resource strategy should resolve the
/// mode first via [`resolve_auto`].
pub fn encode(mode: UpdateMode, prev: Option<&Value>, next: &Value) -> UpdatePayload {
    match mode {
        UpdateMode::Value => UpdatePayload::Value(next.clone()),
        UpdateMode::Delta => match (prev.and_then(Value::as_str), next.as_str()) {
            (Some(p), Some(n)) if n.starts_with(p) => UpdatePayload::Delta(n[p.len()..].to_string()),
            _ => UpdatePayload::Value(next.clone()),
        },
        UpdateMode::Patch => match (prev.and_then(Value::as_object), next.as_object()) {
            (Some(p), Some(n)) => UpdatePayload::Patch(diff_objects(p, n)),
            _ => UpdatePayload::Value(next.clone()),
        },
        UpdateMode::Auto => {
            let resolved = resolve_auto(&UpdateStrategy::default(), None, prev, next);
            encode(resolved, prev, next)
        }
    }
}

/// Apply a payload produced by [`encode`] to the last known value (client
/// side).
///
/// Fails with a validation error when the payload cannot be interpreted
/// deterministically (a delta arriving without a string base, a patch without
/// an object base). Subscribers recover by dropping accumulated state and
/// waiting for the next Value emission or an explicit refetch.
pub fn apply(prev: Option<&Value>, payload: &UpdatePayload) -> Result<Value> {
    match payload {
        UpdatePayload::Value(next) => Ok(next.clone()),
        UpdatePayload::Delta(suffix) => {
            let base = prev.and_then(Value::as_str).ok_or_else(|| {
                LensError::Validation("delta payload requires a string base value".to_string())
            })?;
            Ok(Value::String(format!("{base}{suffix}")))
        }
        UpdatePayload::Patch(ops) => {
            let base = prev.and_then(Value::as_object).ok_or_else(|| {
                LensError::Validation("patch payload requires an object base value".to_string())
            })?;
            let mut out = base.clone();
            for op in ops {
                apply_op(&mut out, op)?;
            }
            Ok(Value::Object(out))
        }
    }
}

/// Minimal ordered op list transforming `prev` into `next`.
///
/// Key order is deterministic (sorted, from `serde_json::Map`): removals and
/// replacements in `prev` order first, then additions in `next` order. Nested
/// objects are diffed recursively.
fn diff_objects(
    prev: &serde_json::Map<String, Value>,
    next: &serde_json::Map<String, Value>,
) -> Vec<PatchOp> {
    let mut ops = Vec::new();
    diff_into(&mut Vec::new(), prev, next, &mut ops);
    ops
}

fn diff_into(
    path: &mut Vec<String>,
    prev: &serde_json::Map<String, Value>,
    next: &serde_json::Map<String, Value>,
    ops: &mut Vec<PatchOp>,
) {
    for (key, prev_value) in prev {
        path.push(key.clone());
        match next.get(key) {
            None => ops.push(PatchOp::Remove { path: path.clone() }),
            Some(next_value) if next_value != prev_value => {
                match (prev_value.as_object(), next_value.as_object()) {
                    (Some(p), Some(n)) => diff_into(path, p, n, ops),
                    _ => ops.push(PatchOp::Replace {
                        path: path.clone(),
                        value: next_value.clone(),
                    }),
                }
            }
            Some(_) => {}
        }
        path.pop();
    }
    for (key, next_value) in next {
        if !prev.contains_key(key) {
            path.push(key.clone());
            ops.push(PatchOp::Add {
                path: path.clone(),
                value: next_value.clone(),
            });
            path.pop();
        }
    }
}

fn apply_op(root: &mut serde_json::Map<String, Value>, op: &PatchOp) -> Result<()> {
    let (path, value) = match op {
        PatchOp::Add { path, value } | PatchOp::Replace { path, value } => (path, Some(value)),
        PatchOp::Remove { path } => (path, None),
    };
    let Some((leaf, parents)) = path.split_last() else {
        return Err(LensError::Validation("patch op with empty path".to_string()));
    };

    let mut target = root;
    for segment in parents {
        target = target
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(serde_json::Map::new()))
            .as_object_mut()
            .ok_or_else(|| {
                LensError::Validation(format!("patch path `{segment}` is not an object"))
            })?;
    }
    match value {
        Some(value) => {
            target.insert(leaf.clone(), value.clone());
        }
        None => {
            target.remove(leaf);
        }
    }
    Ok(())
}
