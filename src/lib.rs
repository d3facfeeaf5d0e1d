//! vouch is an identity provider issuing signed tokens over swappable
//! storage backends.

#[forbid(unsafe_code)]
#[deny(missing_docs, unused_mut)]
mod router;

pub mod composer;
pub mod config;
pub mod crypto;
pub mod error;
pub mod model;
pub mod plugin;
pub mod storage;
pub mod telemetry;
pub mod token;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{Method, StatusCode, header};
use axum::routing::get;
use axum::{Router, middleware as AxumMiddleware};
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};

pub use error::ServerError;

use composer::{Composed, Composer};
use config::{Configuration, Credentials, DatabaseKind};
use crypto::PasswordManager;
use plugin::{PluginClient, USER_STORAGE_SERVICE};
use storage::Category;

/// MUST NEVER be used in production.
#[cfg(test)]
pub(crate) async fn make_request(
    credentials: Option<&Credentials>,
    app: Router,
    method: Method,
    path: &str,
    body: String,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use tower::util::ServiceExt;

    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(credentials) = credentials {
        request = request.header(
            header::AUTHORIZATION,
            router::basic(&credentials.login, &credentials.password),
        );
    }

    app.oneshot(request.body(axum::body::Body::from(body)).unwrap())
        .await
        .unwrap()
}

/// State backed by memory storages and an ephemeral ES256 key.
#[cfg(test)]
pub(crate) async fn test_state() -> AppState {
    use composer::MemoryPartialComposer;

    let mut config = Configuration::default();
    config.url = "https://id.example.com/".into();
    config.token.generate = true;

    let composer = Composer::new(
        &config,
        vec![Box::new(MemoryPartialComposer::new(
            Category::ALL.to_vec(),
            crypto::test_password_manager(),
        ))],
    );
    let sources = sources(&composer);

    AppState {
        config: Arc::new(config),
        storage: composer.compose().await.unwrap(),
        credentials: Arc::new(Credentials {
            login: config::DEFAULT_ADMIN_LOGIN.into(),
            password: config::DEFAULT_ADMIN_PASSWORD.into(),
        }),
        sources: Arc::new(sources),
        metrics: None,
        plugin: None,
    }
}

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Configuration>,
    pub storage: Composed,
    pub credentials: Arc<Credentials>,
    /// Backend family serving each category.
    pub sources: Arc<BTreeMap<&'static str, &'static str>>,
    pub metrics: Option<PrometheusHandle>,
    pub plugin: Option<Arc<PluginClient>>,
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(
                    |chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                        tracing::trace!(
                            size_bytes = chunk.len(),
                            latency = ?latency,
                            "sending body chunk"
                        )
                    },
                )
                .make_span_with(
                    DefaultMakeSpan::new()
                        .include_headers(true)
                        .level(tracing::Level::INFO),
                )
                .on_request(DefaultOnRequest::new())
                .on_response(
                    DefaultOnResponse::new()
                        .include_headers(true)
                        .latency_unit(LatencyUnit::Micros),
                ),
        )
        // Set a timeout.
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(10),
        ))
        // Remove senstive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([
            header::AUTHORIZATION,
            header::COOKIE,
        ]))
        // Add CORS preflight support.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers(Any)
                .vary([header::AUTHORIZATION]),
        );

    Router::new()
        // `GET /status.json` goes to `status`.
        .route("/status.json", get(router::status::status))
        .route("/metrics", get(router::metrics))
        .nest("/token", router::token::router())
        .nest("/users", router::users::router(state.clone()))
        .with_state(state)
        .route_layer(AxumMiddleware::from_fn(telemetry::track))
        .layer(middleware)
}

fn sources(composer: &Composer) -> BTreeMap<&'static str, &'static str> {
    Category::ALL
        .iter()
        .filter_map(|category| {
            composer
                .source(*category)
                .map(|family| (category.as_str(), family.as_str()))
        })
        .collect()
}

/// Initialize the application state.
///
/// The plugin, when configured, is killed on any failure.
pub async fn initialize_state(
    config: Arc<Configuration>,
) -> error::Result<AppState> {
    let passwords = Arc::new(PasswordManager::new(config.argon2.clone())?);

    let partials = composer::build_partial_composers(
        &config.storage,
        Arc::clone(&passwords),
    )
    .await?;
    let mut composer = Composer::new(&config, partials);

    let plugin = if config.storage.user_storage.kind == DatabaseKind::Plugin {
        let client = PluginClient::launch(
            &config.storage.user_storage,
            config.storage.timeout(),
        )
        .await
        .map(Arc::new)?;

        match client.dispense(USER_STORAGE_SERVICE) {
            Ok(storage) => composer = composer.with_user_storage(storage),
            Err(err) => {
                client.shutdown().await;
                return Err(err);
            },
        }
        Some(client)
    } else {
        None
    };

    let sources = sources(&composer);
    let result = async {
        let storage = composer.compose().await?;
        import_initial_data(&config, &storage).await?;
        Ok::<_, ServerError>(storage)
    }
    .await;
    let storage = match result {
        Ok(storage) => storage,
        Err(err) => {
            if let Some(plugin) = &plugin {
                plugin.shutdown().await;
            }
            return Err(err);
        },
    };

    Ok(AppState {
        credentials: Arc::new(config.admin_account.credentials()),
        config,
        storage,
        sources: Arc::new(sources),
        metrics: None,
        plugin,
    })
}

/// Import apps and users files into empty storages.
async fn import_initial_data(
    config: &Configuration,
    storage: &Composed,
) -> error::Result<()> {
    let Some(import) = &config.import else {
        return Ok(());
    };

    if let Some(path) = &import.apps {
        let (_, total) = storage.app_storage.fetch_apps("", 0, 1).await?;
        if total == 0 {
            storage.app_storage.import_json(&read_import(path)?).await?;
            tracing::info!(path = %path.display(), "apps imported");
        }
    }

    if let Some(path) = &import.users {
        let (_, total) = storage.user_storage.fetch_users("", 0, 1).await?;
        if total == 0 {
            storage.user_storage.import_json(&read_import(path)?).await?;
            tracing::info!(path = %path.display(), "users imported");
        }
    }

    Ok(())
}

fn read_import(path: &Path) -> error::Result<Vec<u8>> {
    std::fs::read(path).map_err(|err| {
        ServerError::Config(format!("cannot read {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn test_initialize_state() {
        let mut apps = tempfile::NamedTempFile::new().unwrap();
        apps.write_all(br#"[{"id": "web", "name": "Web", "active": true}]"#)
            .unwrap();
        let mut users = tempfile::NamedTempFile::new().unwrap();
        users
            .write_all(br#"[{"username": "alice", "pswd": "password"}]"#)
            .unwrap();

        let mut config = Configuration::default();
        config.token.generate = true;
        config.argon2 = Some(config::Argon2 {
            memory_cost: 64,
            iterations: 1,
            parallelism: 1,
            hash_length: 32,
        });
        config.import = Some(config::Import {
            apps: Some(apps.path().to_path_buf()),
            users: Some(users.path().to_path_buf()),
        });

        let state = initialize_state(Arc::new(config)).await.unwrap();
        assert!(state.plugin.is_none());
        assert_eq!(state.sources["app_storage"], "memory");

        let app = state.storage.app_storage.app_by_id("web").await.unwrap();
        assert!(!app.secret.is_empty());
        state
            .storage
            .user_storage
            .user_by_name_password("alice", "password")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_plugin() {
        let mut config = Configuration::default();
        config.token.generate = true;
        config.storage.user_storage.kind = DatabaseKind::Plugin;
        config.storage.user_storage.path =
            Some("/nonexistent/vouch-plugin".into());

        assert!(matches!(
            initialize_state(Arc::new(config)).await,
            Err(ServerError::Config(_))
        ));
    }
}
