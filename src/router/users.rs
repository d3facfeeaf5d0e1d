//! Users administration. Every route requires admin credentials.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::model::User;
use crate::router::{Valid, admin};
use crate::{AppState, ServerError};

const DEFAULT_LIMIT: usize = 20;
const DEFAULT_ROLE: &str = "user";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Pagination {
    filter: String,
    skip: usize,
    limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserList {
    pub users: Vec<User>,
    pub total: u64,
}

#[derive(Debug, Validate, Serialize, Deserialize)]
pub struct Body {
    #[validate(length(min = 1, max = 256, message = "Username cannot be empty."))]
    pub username: String,
    #[validate(length(
        min = 8,
        message = "Password must contain at least 8 characters."
    ))]
    pub password: String,
    #[serde(default)]
    pub access_role: Option<String>,
    #[serde(default)]
    pub anonymous: bool,
}

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        // `GET /users` lists, `POST /users` creates.
        .route("/", get(list).post(create))
        .route("/import", post(import))
        .route("/{user_id}", get(find).put(update).delete(remove))
        .route_layer(middleware::from_fn_with_state(state, admin))
}

async fn list(
    State(state): State<AppState>,
    Query(query): Query<Pagination>,
) -> Result<Json<UserList>, ServerError> {
    let (users, total) = state
        .storage
        .user_storage
        .fetch_users(
            &query.filter,
            query.skip,
            query.limit.unwrap_or(DEFAULT_LIMIT),
        )
        .await?;

    Ok(Json(UserList {
        users: users.into_iter().map(User::sanitized).collect(),
        total,
    }))
}

async fn create(
    State(state): State<AppState>,
    Valid(body): Valid<Body>,
) -> Result<(StatusCode, Json<User>), ServerError> {
    let user = state
        .storage
        .user_storage
        .add_user_by_name_and_password(
            &body.username,
            &body.password,
            body.access_role.as_deref().unwrap_or(DEFAULT_ROLE),
            body.anonymous,
        )
        .await?;

    tracing::info!(user_id = user.id, "user created by admin");
    Ok((StatusCode::CREATED, Json(user.sanitized())))
}

async fn find(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<User>, ServerError> {
    let user = state.storage.user_storage.user_by_id(&user_id).await?;
    Ok(Json(user.sanitized()))
}

async fn update(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(user): Json<User>,
) -> Result<Json<User>, ServerError> {
    let user = state.storage.user_storage.update_user(&user_id, user).await?;
    Ok(Json(user.sanitized()))
}

async fn remove(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<StatusCode, ServerError> {
    state.storage.user_storage.delete_user(&user_id).await?;

    tracing::info!(user_id, "user deleted by admin");
    Ok(StatusCode::NO_CONTENT)
}

async fn import(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<StatusCode, ServerError> {
    state.storage.user_storage.import_json(&body).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::json;

    use std::sync::Arc;

    use super::*;
    use crate::*;

    async fn body<T: serde::de::DeserializeOwned>(
        response: axum::http::Response<axum::body::Body>,
    ) -> T {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_requires_admin() {
        let state = test_state().await;

        let response = make_request(
            None,
            app(state.clone()),
            Method::GET,
            "/users",
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let wrong = config::Credentials {
            login: state.credentials.login.clone(),
            password: "wrong".into(),
        };
        let response = make_request(
            Some(&wrong),
            app(state.clone()),
            Method::GET,
            "/users",
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_crud_handlers() {
        let state = test_state().await;
        let admin = Arc::clone(&state.credentials);
        let credentials = Some(admin.as_ref());

        let response = make_request(
            credentials,
            app(state.clone()),
            Method::POST,
            "/users",
            json!({ "username": "alice", "password": "StRong_PaÂ§$W0rD" })
                .to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let user: User = body(response).await;
        assert_eq!(user.username, "alice");

        let response = make_request(
            credentials,
            app(state.clone()),
            Method::POST,
            "/users",
            json!({ "username": "ALICE", "password": "StRong_PaÂ§$W0rD" })
                .to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let path = format!("/users/{}", user.id);
        let response = make_request(
            credentials,
            app(state.clone()),
            Method::GET,
            &path,
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let mut update = user.clone();
        update.email = Some("Alice@Example.com".into());
        let response = make_request(
            credentials,
            app(state.clone()),
            Method::PUT,
            &path,
            serde_json::to_string(&update).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let updated: User = body(response).await;
        assert_eq!(updated.email.as_deref(), Some("alice@example.com"));

        let response = make_request(
            credentials,
            app(state.clone()),
            Method::DELETE,
            &path,
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = make_request(
            credentials,
            app(state),
            Method::GET,
            &path,
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_keeps_tfa_secret() {
        let state = test_state().await;
        let admin = Arc::clone(&state.credentials);
        let credentials = Some(admin.as_ref());

        let mut user = User::new();
        user.username = "alice".into();
        user.tfa_info.is_enabled = true;
        user.tfa_info.secret = "JBSWY3DPEHPK3PXP".into();
        let user = state
            .storage
            .user_storage
            .add_new_user(user, "StRong_PaÂ§$W0rD")
            .await
            .unwrap();

        let path = format!("/users/{}", user.id);
        let response = make_request(
            credentials,
            app(state.clone()),
            Method::GET,
            &path,
            String::default(),
        )
        .await;
        let mut fetched: User = body(response).await;
        assert!(fetched.tfa_info.secret.is_empty());

        fetched.access_role = "admin".into();
        let response = make_request(
            credentials,
            app(state.clone()),
            Method::PUT,
            &path,
            serde_json::to_string(&fetched).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let stored = state.storage.user_storage.user_by_id(&user.id).await.unwrap();
        assert_eq!(stored.access_role, "admin");
        assert!(stored.tfa_info.is_enabled);
        assert_eq!(stored.tfa_info.secret, "JBSWY3DPEHPK3PXP");
    }

    #[tokio::test]
    async fn test_validation() {
        let state = test_state().await;

        let response = make_request(
            Some(state.credentials.as_ref()),
            app(state.clone()),
            Method::POST,
            "/users",
            json!({ "username": "alice", "password": "short" }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_import_and_list() {
        let state = test_state().await;
        let admin = Arc::clone(&state.credentials);
        let credentials = Some(admin.as_ref());

        let users = (0..25)
            .map(|i| json!({ "username": format!("user{i:02}"), "pswd": "" }))
            .collect::<Vec<_>>();
        let response = make_request(
            credentials,
            app(state.clone()),
            Method::POST,
            "/users/import",
            serde_json::Value::Array(users).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = make_request(
            credentials,
            app(state.clone()),
            Method::GET,
            "/users",
            String::default(),
        )
        .await;
        let list: UserList = body(response).await;
        assert_eq!((list.users.len(), list.total), (20, 25));

        let response = make_request(
            credentials,
            app(state),
            Method::GET,
            "/users?skip=2&filter=user2",
            String::default(),
        )
        .await;
        let list: UserList = body(response).await;
        assert_eq!((list.users.len(), list.total), (3, 5));
        assert_eq!(list.users[0].username, "user22");
    }
}
