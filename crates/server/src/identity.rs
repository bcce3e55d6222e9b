//! Caller identity from request headers.
//!
//! Authentication happens in front of this service; we only read the
//! forwarded user name and the datasource the caller is working against.
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;

use askql_error::{AskqlError, ErrorClass, ErrorCode};

use crate::error::ApiError;
use crate::state::AppState;

pub const USER_HEADER: &str = "x-user";
pub const DATASOURCE_HEADER: &str = "x-datasource-id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user: String,
    pub datasource_id: String,
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let user = header_value(&parts.headers, USER_HEADER).ok_or_else(|| {
            ApiError(AskqlError::new(
                ErrorCode::AuthenticationFailed,
                format!("missing {USER_HEADER} header"),
            ))
        })?;
        let datasource_id = header_value(&parts.headers, DATASOURCE_HEADER)
            .or_else(|| state.default_datasource.clone())
            .ok_or_else(|| {
                ApiError(
                    AskqlError::new(ErrorCode::DatasourceNotFound, "no datasource configured")
                        .with_class(ErrorClass::Validation)
                        .with_hint(format!("Send the {DATASOURCE_HEADER} header")),
                )
            })?;
        Ok(Caller {
            user,
            datasource_id,
        })
    }
}
