// src/error.rs
use crate::models::UserId;
use crate::quote::QuoteError;
use log::error;
use rust_decimal::Decimal;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt;
use thiserror::Error;
use warp::http::StatusCode;
use warp::reject::Reject;
use warp::{Rejection, Reply};

/// Failures of a ledger operation.
///
/// Everything except the storage-class variants is a terminal, user-facing
/// outcome: the ledger is untouched and the message is safe to show.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("{0}")]
    Validation(String),

    #[error("invalid symbol: {0}")]
    UnknownSymbol(String),

    #[error("not enough funds: need {required}, have {available}")]
    InsufficientFunds { required: Decimal, available: Decimal },

    #[error("can't sell {requested} shares of {symbol}, holding {held}")]
    Oversell {
        symbol: String,
        requested: i64,
        held: i64,
    },

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("quote lookup failed: {0}")]
    Quote(#[from] QuoteError),

    #[error("cash balance changed during the operation")]
    ConcurrentModification,

    #[error("storage failure: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    #[error("credential hashing failed: {0}")]
    Credential(String),
}

impl LedgerError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Storage-class failures abort the operation and are reported generically.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentModification
                | Self::Storage(_)
                | Self::CorruptRecord(_)
                | Self::Credential(_)
        )
    }
}

/// A rejection carrying an HTTP status and a stable error code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl Reject for ApiError {}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        if err.is_fatal() {
            return Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "STORAGE_FAILURE",
                "operation failed, please try again later",
            );
        }
        let message = err.to_string();
        match err {
            LedgerError::Validation(_) => {
                Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
            }
            LedgerError::UnknownSymbol(_) => {
                Self::new(StatusCode::BAD_REQUEST, "UNKNOWN_SYMBOL", message)
            }
            LedgerError::InsufficientFunds { .. } => {
                Self::new(StatusCode::BAD_REQUEST, "INSUFFICIENT_FUNDS", message)
            }
            LedgerError::Oversell { .. } => Self::new(StatusCode::BAD_REQUEST, "OVERSELL", message),
            LedgerError::Conflict(_) => Self::new(StatusCode::CONFLICT, "CONFLICT", message),
            LedgerError::Unauthorized(_) => {
                Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
            }
            LedgerError::UserNotFound(_) => {
                Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "unknown user")
            }
            LedgerError::Quote(_) => Self::new(StatusCode::BAD_GATEWAY, "QUOTE_UNAVAILABLE", message),
            _ => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "STORAGE_FAILURE",
                "operation failed, please try again later",
            ),
        }
    }
}

pub fn reject(err: LedgerError) -> Rejection {
    warp::reject::custom(ApiError::from(err))
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: &'a str,
}

/// Renders every rejection as a `{code, message}` JSON body.
pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, code, message) = if let Some(api) = err.find::<ApiError>() {
        (api.status, api.code, api.message.clone())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "NOT_FOUND", "not found".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string())
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string())
    } else if let Some(e) = err.find::<warp::reject::PayloadTooLarge>() {
        (StatusCode::PAYLOAD_TOO_LARGE, "VALIDATION_ERROR", e.to_string())
    } else if let Some(e) = err.find::<warp::reject::UnsupportedMediaType>() {
        (StatusCode::UNSUPPORTED_MEDIA_TYPE, "VALIDATION_ERROR", e.to_string())
    } else if let Some(e) = err.find::<warp::reject::LengthRequired>() {
        (StatusCode::LENGTH_REQUIRED, "VALIDATION_ERROR", e.to_string())
    } else if let Some(e) = err.find::<warp::reject::MissingHeader>() {
        (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string())
    } else if let Some(e) = err.find::<warp::reject::InvalidHeader>() {
        (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "METHOD_NOT_ALLOWED",
            "method not allowed".to_string(),
        )
    } else {
        error!("Unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL",
            "internal error".to_string(),
        )
    };

    let body = warp::reply::json(&ErrorBody {
        code,
        message: &message,
    });
    Ok(warp::reply::with_status(body, status))
}
