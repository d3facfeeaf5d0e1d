//! Error handler for vouch.

use axum::extract::rejection::JsonRejection;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use validator::ValidationErrors;

pub type Result<T> = std::result::Result<T, ServerError>;

/// Enum representing server-side errors.
///
/// Storage backends, the token service and the plugin transport all speak
/// this taxonomy, so a failure keeps its meaning across process boundaries.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("validation error occurred")]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Axum(#[from] JsonRejection),

    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("wrong data format, {0}")]
    WrongDataFormat(String),

    #[error("user is inactive")]
    InactiveUser,

    #[error("not implemented by this storage")]
    NotImplemented,

    #[error("token has been revoked")]
    Revoked,

    #[error("token is invalid")]
    Invalid,

    #[error("configuration error, {0}")]
    Config(String),

    #[error("internal server error, {details}")]
    Internal {
        details: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("invalid 'Authorization' header")]
    Unauthorized,
}

impl ServerError {
    /// Create an [`ServerError::Internal`] without source error.
    pub fn internal(details: impl Into<String>) -> Self {
        Self::Internal {
            details: details.into(),
            source: None,
        }
    }
}

impl From<sqlx::Error> for ServerError {
    fn from(err: sqlx::Error) -> Self {
        if matches!(err, sqlx::Error::RowNotFound) {
            return ServerError::NotFound;
        }

        if err
            .as_database_error()
            .is_some_and(|e| e.is_unique_violation())
        {
            return ServerError::AlreadyExists;
        }

        ServerError::Internal {
            details: "database request failed".into(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<tokio::time::error::Elapsed> for ServerError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        ServerError::Internal {
            details: "storage call timed out".into(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::WrongDataFormat(err.to_string())
    }
}

impl From<crate::crypto::CryptoError> for ServerError {
    fn from(err: crate::crypto::CryptoError) -> Self {
        ServerError::Internal {
            details: "cryptographic operation failed".into(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<crate::crypto::KeyError> for ServerError {
    fn from(err: crate::crypto::KeyError) -> Self {
        ServerError::Config(err.to_string())
    }
}

/// Turn any foreign error into [`ServerError::Internal`].
pub trait ToInternal<T> {
    fn catch(self) -> Result<T>;
}

impl<T, E> ToInternal<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn catch(self) -> Result<T> {
        self.map_err(|err| ServerError::Internal {
            details: err.to_string(),
            source: Some(Box::new(err)),
        })
    }
}

/// Structure for detailed error responses.
#[derive(Debug, Serialize)]
pub struct ResponseError {
    r#type: Option<String>,
    title: String,
    status: u16,
    detail: String,
    instance: Option<String>,
    errors: Option<Vec<FieldError>>,
}

impl ResponseError {
    /// Update error status code.
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = code.as_u16();
        self
    }

    /// Update `title` field.
    pub fn title(mut self, title: &str) -> Self {
        self.title = title.into();
        self
    }

    /// Add detailed error.
    pub fn details(mut self, description: &str) -> Self {
        self.detail = description.into();
        self
    }

    /// Automatically add errors field.
    pub fn errors(mut self, errors: &ValidationErrors) -> Self {
        self.errors = Some(parse_validation_errors(errors));
        self
    }

    /// Transform [`ResponseError`] into axum [`Response`].
    pub fn into_response(
        self,
    ) -> std::result::Result<Response, axum::http::Error> {
        if let Ok(body) = serde_json::to_string(&self) {
            Response::builder()
                .status(self.status)
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.into())
        } else {
            Ok(internal_server_error())
        }
    }
}

impl Default for ResponseError {
    fn default() -> Self {
        Self {
            r#type: None,
            title: "Internal server error.".to_owned(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            detail: String::default(),
            instance: None,
            errors: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct FieldError {
    field: String,
    message: String,
}

fn parse_validation_errors(errors: &ValidationErrors) -> Vec<FieldError> {
    errors
        .field_errors()
        .iter()
        .flat_map(|(field, issues)| {
            issues.iter().map(move |issue| FieldError {
                field: field.to_string(),
                message: issue.to_string(),
            })
        })
        .collect()
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let response = ResponseError::default()
            .title("There were validation errors with your request.")
            .details(&self.to_string())
            .status(StatusCode::BAD_REQUEST);

        let response = match &self {
            ServerError::Validation(validation_errors) => {
                response.errors(validation_errors)
            },

            ServerError::NotFound => response
                .title("Resource not found.")
                .status(StatusCode::NOT_FOUND),

            ServerError::AlreadyExists => response
                .title("Resource already exists.")
                .status(StatusCode::CONFLICT),

            ServerError::InactiveUser => response
                .title("User is inactive.")
                .status(StatusCode::FORBIDDEN),

            ServerError::NotImplemented => response
                .title("Operation not supported.")
                .status(StatusCode::NOT_IMPLEMENTED),

            // Revoked and invalid tokens must look the same to callers.
            ServerError::Revoked | ServerError::Invalid => response
                .title("Invalid token.")
                .details("token is invalid")
                .status(StatusCode::UNAUTHORIZED),

            ServerError::Unauthorized => response
                .title("Missing or invalid 'Authorization' header.")
                .status(StatusCode::UNAUTHORIZED),

            ServerError::Config(details) => {
                tracing::error!(%details, "server returned 500 status");

                ResponseError::default()
            },

            ServerError::Internal { details, source } => {
                tracing::error!(
                    err = source.as_ref().map(|e| e.to_string()),
                    %details,
                    "server returned 500 status"
                );

                ResponseError::default()
            },

            _ => response,
        };

        response
            .into_response()
            .unwrap_or_else(|_| internal_server_error())
    }
}

fn internal_server_error() -> Response {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(
            serde_json::json!({
                "type": null,
                "title": "Internal server error.",
                "status": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                "detail": null,
                "instance": null,
                "errors": null,
            })
            .to_string()
            .into(),
        )
        .unwrap_or_else(|_| Response::new("Internal server error".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlx_row_not_found() {
        let err: ServerError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, ServerError::NotFound));
    }

    #[test]
    fn test_status_codes() {
        let cases = [
            (ServerError::NotFound, StatusCode::NOT_FOUND),
            (ServerError::AlreadyExists, StatusCode::CONFLICT),
            (ServerError::InactiveUser, StatusCode::FORBIDDEN),
            (ServerError::NotImplemented, StatusCode::NOT_IMPLEMENTED),
            (ServerError::Revoked, StatusCode::UNAUTHORIZED),
            (ServerError::Invalid, StatusCode::UNAUTHORIZED),
            (
                ServerError::WrongDataFormat("bad id".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                ServerError::internal("boom"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
