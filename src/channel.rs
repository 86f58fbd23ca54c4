//! Channel naming strategies.
//!
//! A channel name is the contract point between a live query and the
//! mutations that should refresh it: both sides derive the name from
//! `(path, input)` with no out-of-band coordination, so the derivation must
//! be a pure, deterministic function of its inputs.

use std::sync::Arc;

use serde_json::Value;

/// Identifier fields checked, in priority order, by
/// [`ChannelNaming::IdBased`].
pub const ID_FIELD_PRIORITY: [&str; 5] = ["id", "sessionId", "messageId", "userId", "key"];

/// Custom naming function.
pub type NamingFn = Arc<dyn Fn(&[String], &Value) -> String + Send + Sync>;

/// Strategy for deriving a pub/sub channel name from a request.
#[derive(Clone, Default)]
pub enum ChannelNaming {
    /// `path` joined with `:`, followed by `:key:value` for every scalar
    /// input field in sorted key order. Null-, object- and array-valued
    /// fields are skipped; a null input field means "not constraining the
    /// query", so it must not split the channel.
    #[default]
    Default,
    /// `path` joined with `:` only; every instance of a query shares one
    /// channel.
    Simple,
    /// `path` joined with `:`, followed by `:value` of the first field found
    /// in [`ID_FIELD_PRIORITY`], then of the first scalar field named like an
    /// identifier (`*Id`); falls back to the plain path when none is present.
    IdBased,
    Custom(NamingFn),
}

impl ChannelNaming {
    /// Compute the channel name for `(path, input)`.
    pub fn name(&self, path: &[String], input: &Value) -> String {
        match self {
            Self::Default => {
                let mut name = path.join(":");
                if let Some(map) = input.as_object() {
                    for (key, value) in map {
                        if let Some(scalar) = scalar_text(value) {
                            name.push(':');
                            name.push_str(key);
                            name.push(':');
                            name.push_str(&scalar);
                        }
                    }
                }
                name
            }
            Self::Simple => path.join(":"),
            Self::IdBased => {
                let mut name = path.join(":");
                if let Some(map) = input.as_object() {
                    let conventional = ID_FIELD_PRIORITY
                        .iter()
                        .find_map(|field| map.get(*field).and_then(scalar_text));
                    let id_like = || {
                        map.iter()
                            .filter(|(key, _)| key.ends_with("Id"))
                            .find_map(|(_, value)| scalar_text(value))
                    };
                    if let Some(scalar) = conventional.or_else(id_like) {
                        name.push(':');
                        name.push_str(&scalar);
                    }
                }
                name
            }
            Self::Custom(naming) => naming(path, input),
        }
    }
}

impl std::fmt::Debug for ChannelNaming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Default => "Default",
            Self::Simple => "Simple",
            Self::IdBased => "IdBased",
            Self::Custom(_) => "Custom",
        };
        f.write_str(name)
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}
