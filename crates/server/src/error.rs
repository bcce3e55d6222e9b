use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use askql_error::{AskqlError, ErrorClass, ErrorCode};

/// An [`AskqlError`] on its way out of a handler.
#[derive(Debug)]
pub struct ApiError(pub AskqlError);

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self(AskqlError::new(ErrorCode::InvalidStatement, message).with_class(ErrorClass::Validation))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self(AskqlError::new(ErrorCode::ResourceNotFound, message))
    }

    pub fn status(&self) -> StatusCode {
        match self.0.code {
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::ResourceNotFound => StatusCode::NOT_FOUND,
            _ => status_for(self.0.class),
        }
    }
}

pub fn status_for(class: ErrorClass) -> StatusCode {
    match class {
        ErrorClass::Validation | ErrorClass::Authorization => StatusCode::BAD_REQUEST,
        ErrorClass::CircuitOpen | ErrorClass::Transient => StatusCode::SERVICE_UNAVAILABLE,
        ErrorClass::UpstreamShape => StatusCode::BAD_GATEWAY,
        ErrorClass::Query | ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl<E> From<E> for ApiError
where
    E: Into<AskqlError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(target: "errors", code = %self.0.code, status = status.as_u16(), "{}", self.0.message);
        }
        (status, Json(self.0)).into_response()
    }
}
