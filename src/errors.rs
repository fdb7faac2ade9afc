use http::StatusCode;
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One product's shortfall inside a rejected checkout batch. Carried on
/// [`ServiceError::OutOfStock`] so callers can surface an actionable message
/// ("P1: requested 2, available 1") instead of retrying blindly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockShortage {
    pub product_id: Uuid,
    pub requested: i32,
    pub available: i32,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Payment verification failed: {0}")]
    PaymentInvalid(String),

    #[error("Out of stock for {} product(s)", shortages.len())]
    OutOfStock { shortages: Vec<StockShortage> },

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    #[error("Event error: {0}")]
    EventError(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Builds an `OutOfStock` error for a single product.
    pub fn out_of_stock(product_id: Uuid, requested: i32, available: i32) -> Self {
        ServiceError::OutOfStock {
            shortages: vec![StockShortage {
                product_id,
                requested,
                available,
            }],
        }
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) | Self::InvalidInput(_) | Self::InvalidStatus(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::PaymentInvalid(_) => StatusCode::PAYMENT_REQUIRED,
            Self::OutOfStock { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) | Self::ConcurrentModification(_) => StatusCode::CONFLICT,
            Self::EventError(_) | Self::InternalError(_) | Self::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Returns the error message suitable for API responses.
    /// Internal errors return generic messages to avoid leaking details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) | Self::Other(_) => "Internal server error".to_string(),
            Self::OutOfStock { shortages } => {
                let lines: Vec<String> = shortages
                    .iter()
                    .map(|s| {
                        format!(
                            "product {}: requested {}, available {}",
                            s.product_id, s.requested, s.available
                        )
                    })
                    .collect();
                format!("Insufficient stock: {}", lines.join("; "))
            }
            other => other.to_string(),
        }
    }

    /// Transient infrastructure failures are safe to retry because the
    /// checkout transaction is all-or-nothing.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DatabaseError(DbErr::Conn(_))
                | Self::DatabaseError(DbErr::ConnectionAcquire(_))
                | Self::ConcurrentModification(_)
        )
    }
}
