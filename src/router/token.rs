//! Password login, refresh and revocation of tokens.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::router::Valid;
use crate::token::Token;
use crate::{AppState, ServerError};

pub const TOKEN_TYPE: &str = "Bearer";
const OFFLINE_SCOPE: &str = "offline";

#[derive(Debug, Validate, Serialize, Deserialize)]
pub struct LoginBody {
    #[validate(length(min = 1, message = "Missing app identifier."))]
    pub app_id: String,
    #[validate(length(min = 1, message = "Username cannot be empty."))]
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Validate, Serialize, Deserialize)]
pub struct RefreshBody {
    #[validate(length(min = 1))]
    pub refresh_token: String,
}

#[derive(Debug, Validate, Serialize, Deserialize)]
pub struct RevokeBody {
    #[validate(length(min = 1))]
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub token_type: String,
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Seconds before access token expiry.
    pub expires_in: i64,
}

impl Response {
    fn new(access: Token, refresh: Option<Token>) -> Self {
        Self {
            token_type: TOKEN_TYPE.to_owned(),
            expires_in: access.claims().exp - access.claims().iat,
            access_token: access.to_string(),
            refresh_token: refresh.map(|token| token.to_string()),
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        // `POST /token` goes to `login`.
        .route("/", post(login))
        .route("/refresh", post(refresh))
        .route("/revoke", post(revoke))
}

async fn login(
    State(state): State<AppState>,
    Valid(body): Valid<LoginBody>,
) -> Result<Json<Response>, ServerError> {
    let app = state.storage.app_storage.app_by_id(&body.app_id).await?;
    if !app.active {
        return Err(ServerError::NotFound);
    }

    let tokens = &state.storage.token_service;
    let access = tokens
        .authenticate(&body.username, &body.password, &body.scopes, &app)
        .await?;

    let refresh = if app.offline && body.scopes.iter().any(|s| s == OFFLINE_SCOPE) {
        let user = state
            .storage
            .user_storage
            .user_by_id(access.user_id())
            .await?;
        Some(tokens.new_refresh_token(&user, &body.scopes, &app).await?)
    } else {
        None
    };

    Ok(Json(Response::new(access, refresh)))
}

async fn refresh(
    State(state): State<AppState>,
    Valid(body): Valid<RefreshBody>,
) -> Result<Json<Response>, ServerError> {
    let access = state
        .storage
        .token_service
        .refresh_access_token(&body.refresh_token)
        .await?;

    Ok(Json(Response::new(access, None)))
}

async fn revoke(
    State(state): State<AppState>,
    Valid(body): Valid<RevokeBody>,
) -> Result<StatusCode, ServerError> {
    let tokens = &state.storage.token_service;
    let token = tokens.parse(&body.token).await?;
    tokens.revoke(&token).await?;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::json;

    use super::*;
    use crate::model::App;
    use crate::*;

    async fn setup() -> (AppState, App) {
        let state = test_state().await;
        state
            .storage
            .user_storage
            .add_user_by_name_and_password("alice", "StRong_PaÂ§$W0rD", "user", false)
            .await
            .unwrap();
        let app = state
            .storage
            .app_storage
            .add_app(App {
                name: "web".into(),
                active: true,
                offline: true,
                ..Default::default()
            })
            .await
            .unwrap();

        (state, app)
    }

    async fn tokens(response: axum::http::Response<axum::body::Body>) -> Response {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_login_refresh_revoke() {
        let (state, app) = setup().await;

        let response = make_request(
            None,
            crate::app(state.clone()),
            Method::POST,
            "/token",
            json!({
                "app_id": app.id,
                "username": "alice",
                "password": "StRong_PaÂ§$W0rD",
                "scopes": ["offline", "user"],
            })
            .to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let login = tokens(response).await;
        assert_eq!(login.token_type, TOKEN_TYPE);
        assert_eq!(login.expires_in, 900);
        let refresh_token = login.refresh_token.unwrap();

        let response = make_request(
            None,
            crate::app(state.clone()),
            Method::POST,
            "/token/refresh",
            json!({ "refresh_token": refresh_token }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let refreshed = tokens(response).await;
        assert!(refreshed.refresh_token.is_none());

        let response = make_request(
            None,
            crate::app(state.clone()),
            Method::POST,
            "/token/revoke",
            json!({ "token": refreshed.access_token }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        assert!(matches!(
            state.storage.token_service.parse(&refreshed.access_token).await,
            Err(ServerError::Revoked)
        ));
    }

    #[tokio::test]
    async fn test_wrong_password() {
        let (state, app) = setup().await;

        let response = make_request(
            None,
            crate::app(state),
            Method::POST,
            "/token",
            json!({
                "app_id": app.id,
                "username": "alice",
                "password": "wrong",
            })
            .to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_refresh_token() {
        let (state, _) = setup().await;

        let response = make_request(
            None,
            crate::app(state),
            Method::POST,
            "/token/refresh",
            json!({ "refresh_token": "not.a.token" }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
