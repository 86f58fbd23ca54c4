use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LensError;
use crate::select::FieldSelection;
use crate::update::UpdateMode;

/// Kind of operation carried by a [`LensRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Query,
    Mutation,
    Subscription,
}

/// The transport-agnostic request envelope.
///
/// `path` is the dotted address of the endpoint (`["message", "get"]`),
/// `input` the resolver argument, `select` an optional field selection applied
/// to the result, and `update_mode` an optional override for subscription
/// encoding (defaults to auto).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LensRequest {
    #[serde(rename = "type")]
    pub kind: RequestKind,
    pub path: Vec<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub select: Option<FieldSelection>,
    #[serde(rename = "updateMode", skip_serializing_if = "Option::is_none")]
    pub update_mode: Option<UpdateMode>,
}

impl LensRequest {
    pub fn query(path: impl IntoIterator<Item = impl Into<String>>, input: Value) -> Self {
        Self::new(RequestKind::Query, path, input)
    }

    pub fn mutation(path: impl IntoIterator<Item = impl Into<String>>, input: Value) -> Self {
        Self::new(RequestKind::Mutation, path, input)
    }

    pub fn subscription(path: impl IntoIterator<Item = impl Into<String>>, input: Value) -> Self {
        Self::new(RequestKind::Subscription, path, input)
    }

    fn new(
        kind: RequestKind,
        path: impl IntoIterator<Item = impl Into<String>>,
        input: Value,
    ) -> Self {
        Self {
            kind,
            path: path.into_iter().map(Into::into).collect(),
            input,
            select: None,
            update_mode: None,
        }
    }

    /// Attach a field selection (builder pattern).
    pub fn with_select(mut self, select: FieldSelection) -> Self {
        self.select = Some(select);
        self
    }

    /// Pin the subscription update mode (builder pattern).
    pub fn with_update_mode(mut self, mode: UpdateMode) -> Self {
        self.update_mode = Some(mode);
        self
    }

    /// Dotted path used for routing and channel derivation.
    pub fn joined_path(&self) -> String {
        self.path.join(".")
    }
}

/// Error half of a [`LensResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&LensError> for ErrorPayload {
    fn from(error: &LensError) -> Self {
        let data = match error {
            LensError::Resolver { data, .. } => data.clone(),
            _ => None,
        };
        Self {
            message: error.to_string(),
            code: Some(error.code().to_string()),
            data,
        }
    }
}

/// The response envelope. Never carries both `data` and `error`; the only
/// constructors are [`LensResponse::ok`] and [`LensResponse::err`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LensResponse<T> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl<T> LensResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: &LensError) -> Self {
        Self {
            data: None,
            error: Some(ErrorPayload::from(error)),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

impl<T> From<crate::error::Result<T>> for LensResponse<T> {
    fn from(result: crate::error::Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(error) => Self::err(&error),
        }
    }
}
