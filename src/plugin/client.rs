use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

use crate::config::Database;
use crate::error::{Result, ServerError, ToInternal};
use crate::model::User;
use crate::plugin::protocol::{
    self, JsonRpcRequest, JsonRpcResponse, method,
};
use crate::plugin::{
    MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, USER_STORAGE_SERVICE,
    parse_handshake,
};
use crate::storage::UserStorage;

type Pending = Arc<DashMap<u64, oneshot::Sender<JsonRpcResponse>>>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Removes a pending call once its future completes or is dropped.
struct PendingGuard<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Hand a response line to the call waiting for it.
fn route_response(pending: &Pending, line: &str) {
    let response = match serde_json::from_str::<JsonRpcResponse>(line) {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(%err, "malformed plugin response");
            return;
        },
    };

    match response.id.and_then(|id| pending.remove(&id)) {
        Some((_, sender)) => {
            let _ = sender.send(response);
        },
        None => {
            tracing::warn!(id = response.id, "plugin response without caller")
        },
    }
}

/// Host side of a plugin connection.
///
/// Calls are multiplexed on one pipe, a reader task routes each response
/// to its caller by request ID.
pub struct PluginClient {
    child: Mutex<Option<Child>>,
    writer: Mutex<Writer>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    services: Vec<String>,
    timeout: Duration,
    reader: JoinHandle<()>,
}

impl PluginClient {
    /// Spawn the plugin executable described by `database`.
    ///
    /// The child is killed on any handshake failure.
    pub async fn launch(
        database: &Database,
        timeout: Duration,
    ) -> Result<Self> {
        let path = database
            .path
            .as_deref()
            .filter(|path| !path.is_empty())
            .ok_or_else(|| {
                ServerError::Config("plugin storage requires a `path`".into())
            })?;

        let mut child = Command::new(path)
            .args(&database.args)
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                let message = format!("cannot start plugin {path}: {err}");
                ServerError::Config(message)
            })?;

        let (Some(stdin), Some(stdout)) =
            (child.stdin.take(), child.stdout.take())
        else {
            let _ = child.start_kill();
            return Err(ServerError::internal("plugin pipes are unavailable"));
        };

        match Self::connect(stdout, stdin, timeout).await {
            Ok(client) => {
                tracing::info!(path, pid = child.id(), "plugin started");
                *client.child.lock().await = Some(child);
                Ok(client)
            },
            Err(err) => {
                tracing::error!(path, %err, "plugin handshake failed");
                let _ = child.start_kill();
                Err(err)
            },
        }
    }

    /// Perform handshake over an established pipe.
    pub async fn connect<R, W>(
        reader: R,
        writer: W,
        timeout: Duration,
    ) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut lines = BufReader::new(reader).lines();

        let first = tokio::time::timeout(timeout, lines.next_line()).await;
        let line = match first {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                return Err(ServerError::Config(
                    "plugin exited before handshake".into(),
                ));
            },
            Ok(Err(err)) => {
                return Err(ServerError::Config(format!(
                    "cannot read plugin handshake: {err}"
                )));
            },
            Err(_) => {
                return Err(ServerError::Config(
                    "plugin handshake timed out".into(),
                ));
            },
        };
        let services = parse_handshake(&line)?;

        let pending: Pending = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let reader = {
            let pending = Arc::clone(&pending);
            let closed = Arc::clone(&closed);

            tokio::spawn(async move {
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) if line.trim().is_empty() => continue,
                        Ok(Some(line)) => route_response(&pending, &line),
                        Ok(None) => break,
                        Err(err) => {
                            tracing::error!(%err, "cannot read from plugin");
                            break;
                        },
                    }
                }

                closed.store(true, Ordering::SeqCst);
                // Dropping senders fails every call still waiting.
                pending.clear();
                tracing::warn!("plugin connection closed");
            })
        };

        Ok(Self {
            child: Mutex::new(None),
            writer: Mutex::new(Box::new(writer)),
            pending,
            closed,
            next_id: AtomicU64::new(1),
            services,
            timeout,
            reader,
        })
    }

    /// Services advertised during handshake.
    pub fn services(&self) -> &[String] {
        &self.services
    }

    /// Get a storage backed by this plugin.
    pub fn dispense(
        self: &Arc<Self>,
        service: &str,
    ) -> Result<Arc<dyn UserStorage>> {
        if service != USER_STORAGE_SERVICE
            || !self.services.iter().any(|s| s == service)
        {
            return Err(ServerError::Config(format!(
                "plugin does not provide {service:?}"
            )));
        }

        Ok(Arc::clone(self) as Arc<dyn UserStorage>)
    }

    /// Kill the plugin process. Pending calls fail.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(err) = child.kill().await {
                tracing::error!(%err, "cannot kill plugin");
            }
        }

        self.reader.abort();
        self.pending.clear();
    }

    async fn call<P, R>(
        &self,
        method: &str,
        params: P,
        timeout: Duration,
    ) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ServerError::internal("plugin is not running"));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let params = serde_json::to_value(params)?;
        let request = JsonRpcRequest::new(id, method, params);
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        let response = tokio::time::timeout(timeout, async {
            {
                let mut writer = self.writer.lock().await;
                writer.write_all(&line).await.catch()?;
                writer.flush().await.catch()?;
            }

            rx.await
                .map_err(|_| ServerError::internal("plugin closed connection"))
        })
        .await??;

        if let Some(error) = response.error {
            return Err(error.into());
        }

        serde_json::from_value(response.result.unwrap_or_default()).catch()
    }
}

impl Drop for PluginClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl UserStorage for PluginClient {
    async fn user_by_id(&self, id: &str) -> Result<User> {
        self.call(
            method::USER_BY_ID,
            protocol::Id { id: id.to_owned() },
            self.timeout,
        )
        .await
    }

    async fn user_by_email(&self, email: &str) -> Result<User> {
        self.call(
            method::USER_BY_EMAIL,
            protocol::Email {
                email: email.to_owned(),
            },
            self.timeout,
        )
        .await
    }

    async fn user_by_phone(&self, phone: &str) -> Result<User> {
        self.call(
            method::USER_BY_PHONE,
            protocol::Phone {
                phone: phone.to_owned(),
            },
            self.timeout,
        )
        .await
    }

    async fn user_by_federated_id(
        &self,
        provider: &str,
        id: &str,
    ) -> Result<User> {
        self.call(
            method::USER_BY_FEDERATED_ID,
            protocol::FederatedId {
                provider: provider.to_owned(),
                id: id.to_owned(),
            },
            self.timeout,
        )
        .await
    }

    async fn user_exists(&self, name: &str) -> Result<bool> {
        self.call(
            method::USER_EXISTS,
            protocol::Name {
                name: name.to_owned(),
            },
            self.timeout,
        )
        .await
    }

    async fn user_by_name_password(
        &self,
        name: &str,
        password: &str,
    ) -> Result<User> {
        self.call(
            method::USER_BY_NAME_PASSWORD,
            protocol::Credentials {
                name: name.to_owned(),
                password: password.to_owned(),
            },
            self.timeout,
        )
        .await
    }

    async fn id_by_name(&self, name: &str) -> Result<String> {
        self.call(
            method::ID_BY_NAME,
            protocol::Name {
                name: name.to_owned(),
            },
            self.timeout,
        )
        .await
    }

    async fn add_new_user(&self, user: User, password: &str) -> Result<User> {
        self.call(
            method::ADD_NEW_USER,
            protocol::NewUser {
                user,
                password: password.to_owned(),
            },
            self.timeout,
        )
        .await
    }

    async fn add_user_by_name_and_password(
        &self,
        username: &str,
        password: &str,
        role: &str,
        is_anonymous: bool,
    ) -> Result<User> {
        self.call(
            method::ADD_USER_BY_NAME_AND_PASSWORD,
            protocol::NewNamedUser {
                username: username.to_owned(),
                password: password.to_owned(),
                role: role.to_owned(),
                is_anonymous,
            },
            self.timeout,
        )
        .await
    }

    async fn add_user_by_phone(
        &self,
        phone: &str,
        role: &str,
    ) -> Result<User> {
        self.call(
            method::ADD_USER_BY_PHONE,
            protocol::NewPhoneUser {
                phone: phone.to_owned(),
                role: role.to_owned(),
            },
            self.timeout,
        )
        .await
    }

    async fn add_user_with_federated_id(
        &self,
        provider: &str,
        federated_id: &str,
        role: &str,
    ) -> Result<User> {
        self.call(
            method::ADD_USER_WITH_FEDERATED_ID,
            protocol::NewFederatedUser {
                provider: provider.to_owned(),
                federated_id: federated_id.to_owned(),
                role: role.to_owned(),
            },
            self.timeout,
        )
        .await
    }

    async fn update_user(&self, id: &str, user: User) -> Result<User> {
        self.call(
            method::UPDATE_USER,
            protocol::UpdateUser {
                id: id.to_owned(),
                user,
            },
            self.timeout,
        )
        .await
    }

    async fn reset_password(&self, id: &str, password: &str) -> Result<()> {
        self.call(
            method::RESET_PASSWORD,
            protocol::ResetPassword {
                id: id.to_owned(),
                password: password.to_owned(),
            },
            self.timeout,
        )
        .await
    }

    async fn reset_username(&self, id: &str, username: &str) -> Result<()> {
        self.call(
            method::RESET_USERNAME,
            protocol::ResetUsername {
                id: id.to_owned(),
                username: username.to_owned(),
            },
            self.timeout,
        )
        .await
    }

    async fn delete_user(&self, id: &str) -> Result<()> {
        self.call(
            method::DELETE_USER,
            protocol::Id { id: id.to_owned() },
            self.timeout,
        )
        .await
    }

    async fn fetch_users(
        &self,
        filter: &str,
        skip: usize,
        limit: usize,
    ) -> Result<(Vec<User>, u64)> {
        let page: protocol::UserPage = self
            .call(
                method::FETCH_USERS,
                protocol::FetchUsers {
                    filter: filter.to_owned(),
                    skip,
                    limit,
                },
                self.timeout * 2,
            )
            .await?;

        Ok((page.users, page.total))
    }

    async fn update_login_metadata(&self, id: &str) {
        let result: Result<()> = self
            .call(
                method::UPDATE_LOGIN_METADATA,
                protocol::Id { id: id.to_owned() },
                self.timeout * 2,
            )
            .await;

        if let Err(err) = result {
            tracing::warn!(user_id = id, %err, "cannot update login metadata");
        }
    }

    async fn request_scopes(
        &self,
        user_id: &str,
        scopes: &[String],
    ) -> Result<Vec<String>> {
        self.call(
            method::REQUEST_SCOPES,
            protocol::RequestScopes {
                user_id: user_id.to_owned(),
                scopes: scopes.to_vec(),
            },
            self.timeout,
        )
        .await
    }

    async fn scopes(&self) -> Vec<String> {
        match self
            .call(method::SCOPES, serde_json::json!({}), self.timeout)
            .await
        {
            Ok(scopes) => scopes,
            Err(err) => {
                tracing::warn!(%err, "cannot fetch plugin scopes");
                Vec::new()
            },
        }
    }

    async fn attach_device_token(&self, id: &str, token: &str) -> Result<()> {
        self.call(
            method::ATTACH_DEVICE_TOKEN,
            protocol::DeviceToken {
                id: id.to_owned(),
                token: token.to_owned(),
            },
            self.timeout,
        )
        .await
    }

    async fn detach_device_token(&self, token: &str) -> Result<()> {
        self.call(
            method::DETACH_DEVICE_TOKEN,
            protocol::DeviceToken {
                id: String::default(),
                token: token.to_owned(),
            },
            self.timeout,
        )
        .await
    }

    async fn import_json(&self, data: &[u8]) -> Result<()> {
        let data: serde_json::Value = serde_json::from_slice(data)?;

        let params = protocol::Import { data };
        self.call(method::IMPORT_JSON, params, self.timeout * 2)
            .await
    }
}
