//! HTTP API.
pub mod status;
pub mod token;
pub mod users;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::de::DeserializeOwned;
use validator::Validate;

use crate::{AppState, ServerError};

const BASIC: &str = "Basic ";

/// JSON body validated with [`Validate`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Valid<T>(pub T);

impl<T, S> FromRequest<S> for Valid<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
{
    type Rejection = ServerError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        value.validate()?;
        Ok(Valid(value))
    }
}

/// Require administrator credentials as HTTP Basic authentication.
pub async fn admin(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ServerError> {
    let credentials = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|header| header.strip_prefix(BASIC))
        .and_then(|encoded| STANDARD.decode(encoded.trim()).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok())
        .ok_or(ServerError::Unauthorized)?;

    match credentials.split_once(':') {
        Some((login, password))
            if login == state.credentials.login
                && password == state.credentials.password =>
        {
            Ok(next.run(req).await)
        },
        _ => {
            tracing::warn!("rejected admin credentials");
            Err(ServerError::Unauthorized)
        },
    }
}

/// Prometheus scrape endpoint.
pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.as_ref().map(PrometheusHandle::render) {
        Some(body) => body.into_response(),
        None => ServerError::NotFound.into_response(),
    }
}

/// Encode administrator credentials, tests only.
#[cfg(test)]
pub(crate) fn basic(login: &str, password: &str) -> String {
    format!("{BASIC}{}", STANDARD.encode(format!("{login}:{password}")))
}
