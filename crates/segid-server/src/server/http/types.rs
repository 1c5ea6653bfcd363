use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use segid::{Error, MultiSetError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Shortest accepted service name on the HTTP surface.
pub const MIN_NAME_LEN: usize = 2;

/// Smallest accepted value for `set` and `mset`.
pub const MIN_VALUE: i64 = 1;

/// Body of `POST /v1/id`.
#[derive(Debug, Clone, Deserialize)]
pub struct ValueGet {
    pub name: String,
}

/// Reply of `POST /v1/id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdReply {
    pub name: String,
    pub id: i64,
}

/// Body of `POST /v1/id/set`, and one entry of `POST /v1/id/mset`.
#[derive(Debug, Clone, Deserialize)]
pub struct ValueSet {
    pub name: String,
    pub value: i64,
    #[serde(default)]
    pub force: bool,
}

impl ValueSet {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.name.chars().count() < MIN_NAME_LEN {
            return Err(ApiError::BadRequest(format!(
                "name must be at least {MIN_NAME_LEN} characters"
            )));
        }
        if self.value < MIN_VALUE {
            return Err(ApiError::BadRequest(format!(
                "value must be at least {MIN_VALUE}"
            )));
        }
        Ok(())
    }
}

/// Reply of `POST /v1/id/set`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetReply {
    pub name: String,
    pub current: i64,
}

/// One entry of [`MultiSet`]. A per-entry `force` is ignored in favour of
/// the request-level flag.
#[derive(Debug, Clone, Deserialize)]
pub struct MultiSetEntry {
    pub name: String,
    pub value: i64,
}

/// Body of `POST /v1/id/mset`.
#[derive(Debug, Clone, Deserialize)]
pub struct MultiSet {
    #[serde(default)]
    pub force: bool,
    pub values: Vec<MultiSetEntry>,
}

impl MultiSet {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.values.is_empty() {
            return Err(ApiError::BadRequest(
                "values must hold at least one entry".to_owned(),
            ));
        }
        for entry in &self.values {
            ValueSet {
                name: entry.name.clone(),
                value: entry.value,
                force: self.force,
            }
            .validate()?;
        }
        Ok(())
    }
}

/// Reply of `POST /v1/id/mset`. `error` is set when an entry failed; `values`
/// then holds the entries applied before it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiSetReply {
    pub values: BTreeMap<String, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reply of `GET /v1/services`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicesReply {
    pub services: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
}

/// Errors returned by the HTTP handlers, rendered as `{"error": ...}`.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Allocator(#[from] Error),

    #[error("{0}")]
    MultiSet(Box<MultiSetError>),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Allocator(err) if err.is_not_found() => StatusCode::NOT_FOUND,
            Self::Allocator(err) if err.is_invalid_argument() => StatusCode::BAD_REQUEST,
            Self::Allocator(_) | Self::MultiSet(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<MultiSetError> for ApiError {
    fn from(err: MultiSetError) -> Self {
        Self::MultiSet(Box::new(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            Self::MultiSet(err) => {
                let MultiSetError {
                    applied, source, ..
                } = *err;
                let body = MultiSetReply {
                    values: applied,
                    error: Some(source.to_string()),
                };
                (status, Json(body)).into_response()
            }
            err => {
                let body = ErrorReply {
                    error: err.to_string(),
                };
                (status, Json(body)).into_response()
            }
        }
    }
}
