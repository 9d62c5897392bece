use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{FlagUpdate, StoreError};

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct FlagState {
    pub key: String,
    pub enabled: bool,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct BatchOutcome {
    pub updated: u64,
    pub total: usize,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeletedFlag {
    pub key: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FlagSetRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FlagBatchRequest {
    pub updates: Vec<FlagUpdate>,
}

#[derive(Error, Debug)]
pub enum FlagError {
    #[error("request carries no actor identity")]
    MissingActor,
    #[error("mutating flags requires an admin role")]
    Unauthorized,

    #[error("invalid flag key: {0}")]
    InvalidKey(String),
    #[error("batch holds no updates")]
    EmptyBatch,

    #[error("flag store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

impl IntoResponse for FlagError {
    fn into_response(self) -> Response {
        match self {
            FlagError::InvalidKey(_) | FlagError::EmptyBatch => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }

            FlagError::MissingActor => (StatusCode::UNAUTHORIZED, self.to_string()),
            FlagError::Unauthorized => (StatusCode::FORBIDDEN, self.to_string()),

            FlagError::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
        }
        .into_response()
    }
}
