use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::sync::Mutex;

use crate::error::{Result, ToInternal};
use crate::plugin::protocol::{
    self, INTERNAL_ERROR, INVALID_PARAMS, JsonRpcError, JsonRpcRequest,
    JsonRpcResponse, METHOD_NOT_FOUND, PARSE_ERROR, method,
};
use crate::plugin::{USER_STORAGE_SERVICE, handshake_line};
use crate::storage::UserStorage;

/// Serve `storage` over stdin and stdout until stdin is closed.
pub async fn serve(storage: Arc<dyn UserStorage>) -> Result<()> {
    serve_with(tokio::io::stdin(), tokio::io::stdout(), storage).await
}

/// Serve `storage` over any pipe. Each request runs in its own task.
pub async fn serve_with<R, W>(
    reader: R,
    writer: W,
    storage: Arc<dyn UserStorage>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let writer = Arc::new(Mutex::new(writer));
    let handshake = handshake_line(&[USER_STORAGE_SERVICE]);
    write_line(&writer, handshake.as_bytes()).await?;

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await.catch()? {
        if line.trim().is_empty() {
            continue;
        }

        let storage = Arc::clone(&storage);
        let writer = Arc::clone(&writer);

        tokio::spawn(async move {
            let request = serde_json::from_str::<JsonRpcRequest>(&line);
            let response = match request {
                Ok(request) => {
                    tracing::debug!(
                        method = request.method,
                        id = request.id,
                        "plugin call"
                    );

                    let JsonRpcRequest {
                        id, method: name, params, ..
                    } = request;
                    match handle(storage.as_ref(), &name, params).await {
                        Ok(result) => JsonRpcResponse::success(id, result),
                        Err(err) => JsonRpcResponse::failure(Some(id), err),
                    }
                },
                Err(err) => JsonRpcResponse::failure(
                    None,
                    JsonRpcError::new(PARSE_ERROR, err.to_string()),
                ),
            };

            let result = match serde_json::to_vec(&response) {
                Ok(bytes) => write_line(&writer, &bytes).await,
                Err(err) => Err(err.into()),
            };
            if let Err(err) = result {
                tracing::error!(%err, "cannot write plugin response");
            }
        });
    }

    tracing::info!("host closed plugin input");
    Ok(())
}

async fn write_line<W>(writer: &Mutex<W>, line: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = writer.lock().await;
    writer.write_all(line).await.catch()?;
    writer.write_all(b"\n").await.catch()?;
    writer.flush().await.catch()
}

fn params<P: DeserializeOwned>(
    params: Value,
) -> std::result::Result<P, JsonRpcError> {
    serde_json::from_value(params)
        .map_err(|err| JsonRpcError::new(INVALID_PARAMS, err.to_string()))
}

fn reply<T: Serialize>(
    result: Result<T>,
) -> std::result::Result<Value, JsonRpcError> {
    let value = result.map_err(JsonRpcError::from)?;
    serde_json::to_value(value)
        .map_err(|err| JsonRpcError::new(INTERNAL_ERROR, err.to_string()))
}

async fn handle(
    storage: &dyn UserStorage,
    name: &str,
    value: Value,
) -> std::result::Result<Value, JsonRpcError> {
    match name {
        method::USER_BY_ID => {
            let p: protocol::Id = params(value)?;
            reply(storage.user_by_id(&p.id).await)
        },
        method::USER_BY_EMAIL => {
            let p: protocol::Email = params(value)?;
            reply(storage.user_by_email(&p.email).await)
        },
        method::USER_BY_PHONE => {
            let p: protocol::Phone = params(value)?;
            reply(storage.user_by_phone(&p.phone).await)
        },
        method::USER_BY_FEDERATED_ID => {
            let p: protocol::FederatedId = params(value)?;
            reply(storage.user_by_federated_id(&p.provider, &p.id).await)
        },
        method::USER_EXISTS => {
            let p: protocol::Name = params(value)?;
            reply(storage.user_exists(&p.name).await)
        },
        method::USER_BY_NAME_PASSWORD => {
            let p: protocol::Credentials = params(value)?;
            reply(storage.user_by_name_password(&p.name, &p.password).await)
        },
        method::ID_BY_NAME => {
            let p: protocol::Name = params(value)?;
            reply(storage.id_by_name(&p.name).await)
        },
        method::ADD_NEW_USER => {
            let p: protocol::NewUser = params(value)?;
            reply(storage.add_new_user(p.user, &p.password).await)
        },
        method::ADD_USER_BY_NAME_AND_PASSWORD => {
            let p: protocol::NewNamedUser = params(value)?;
            reply(
                storage
                    .add_user_by_name_and_password(
                        &p.username,
                        &p.password,
                        &p.role,
                        p.is_anonymous,
                    )
                    .await,
            )
        },
        method::ADD_USER_BY_PHONE => {
            let p: protocol::NewPhoneUser = params(value)?;
            reply(storage.add_user_by_phone(&p.phone, &p.role).await)
        },
        method::ADD_USER_WITH_FEDERATED_ID => {
            let p: protocol::NewFederatedUser = params(value)?;
            reply(
                storage
                    .add_user_with_federated_id(
                        &p.provider,
                        &p.federated_id,
                        &p.role,
                    )
                    .await,
            )
        },
        method::UPDATE_USER => {
            let p: protocol::UpdateUser = params(value)?;
            reply(storage.update_user(&p.id, p.user).await)
        },
        method::RESET_PASSWORD => {
            let p: protocol::ResetPassword = params(value)?;
            reply(storage.reset_password(&p.id, &p.password).await)
        },
        method::RESET_USERNAME => {
            let p: protocol::ResetUsername = params(value)?;
            reply(storage.reset_username(&p.id, &p.username).await)
        },
        method::DELETE_USER => {
            let p: protocol::Id = params(value)?;
            reply(storage.delete_user(&p.id).await)
        },
        method::FETCH_USERS => {
            let p: protocol::FetchUsers = params(value)?;
            reply(
                storage
                    .fetch_users(&p.filter, p.skip, p.limit)
                    .await
                    .map(|(users, total)| protocol::UserPage { users, total }),
            )
        },
        method::UPDATE_LOGIN_METADATA => {
            let p: protocol::Id = params(value)?;
            storage.update_login_metadata(&p.id).await;
            Ok(Value::Null)
        },
        method::REQUEST_SCOPES => {
            let p: protocol::RequestScopes = params(value)?;
            reply(storage.request_scopes(&p.user_id, &p.scopes).await)
        },
        method::SCOPES => reply(Ok(storage.scopes().await)),
        method::ATTACH_DEVICE_TOKEN => {
            let p: protocol::DeviceToken = params(value)?;
            reply(storage.attach_device_token(&p.id, &p.token).await)
        },
        method::DETACH_DEVICE_TOKEN => {
            let p: protocol::DeviceToken = params(value)?;
            reply(storage.detach_device_token(&p.token).await)
        },
        method::IMPORT_JSON => {
            let p: protocol::Import = params(value)?;
            let data = serde_json::to_vec(&p.data).map_err(|err| {
                JsonRpcError::new(INVALID_PARAMS, err.to_string())
            })?;
            reply(storage.import_json(&data).await)
        },
        _ => Err(JsonRpcError::new(
            METHOD_NOT_FOUND,
            format!("unknown method {name:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::crypto::test_password_manager;
    use crate::error::ServerError;
    use crate::plugin::PluginClient;
    use crate::storage::memory::MemoryUserStorage;

    /// Plugin served in-process over a duplex pipe.
    async fn connect() -> Arc<PluginClient> {
        let (host, plugin) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host);
        let (plugin_read, plugin_write) = tokio::io::split(plugin);

        let storage = Arc::new(MemoryUserStorage::new(test_password_manager()));
        tokio::spawn(serve_with(plugin_read, plugin_write, storage));

        Arc::new(
            PluginClient::connect(host_read, host_write, Duration::from_secs(5))
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_round_trip() {
        let client = connect().await;
        let storage = client.dispense(USER_STORAGE_SERVICE).unwrap();

        let user = storage
            .add_user_by_name_and_password("alice", "password", "user", false)
            .await
            .unwrap();
        assert!(user.password_hash.is_empty());

        let found = storage
            .user_by_name_password("Alice", "password")
            .await
            .unwrap();
        assert_eq!(found.id, user.id);
        assert!(storage.user_exists("ALICE").await.unwrap());

        assert!(matches!(
            storage.user_by_name_password("alice", "wrong").await,
            Err(ServerError::NotFound)
        ));
        let duplicate = storage
            .add_user_by_name_and_password("alice", "secret", "user", false)
            .await;
        assert!(matches!(duplicate, Err(ServerError::AlreadyExists)));
        assert!(matches!(
            storage.user_by_id("not-an-id").await,
            Err(ServerError::WrongDataFormat(_))
        ));
        assert!(matches!(
            storage.attach_device_token(&user.id, "device").await,
            Err(ServerError::NotImplemented)
        ));

        storage.update_login_metadata(&user.id).await;
        let user = storage.user_by_id(&user.id).await.unwrap();
        assert_eq!(user.num_of_logins, 1);

        storage.delete_user(&user.id).await.unwrap();
        assert!(matches!(
            storage.user_by_id(&user.id).await,
            Err(ServerError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_calls() {
        let client = connect().await;
        let storage = client.dispense(USER_STORAGE_SERVICE).unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..25 {
            let storage = Arc::clone(&storage);
            tasks.spawn(async move {
                let name = format!("user{i:02}");
                storage
                    .add_user_by_name_and_password(&name, "", "user", false)
                    .await
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        let (page, total) = storage.fetch_users("", 0, 20).await.unwrap();
        assert_eq!((page.len(), total), (20, 25));
        let (page, _) = storage.fetch_users("", 20, 20).await.unwrap();
        assert_eq!(page.len(), 5);
        assert_eq!(page[0].username, "user20");
    }

    #[tokio::test]
    async fn test_import() {
        let client = connect().await;
        let storage = client.dispense(USER_STORAGE_SERVICE).unwrap();

        storage
            .import_json(br#"[{"username": "bob", "pswd": "secret"}]"#)
            .await
            .unwrap();
        storage.user_by_name_password("bob", "secret").await.unwrap();

        assert!(matches!(
            storage.import_json(b"not json").await,
            Err(ServerError::WrongDataFormat(_))
        ));
    }

    #[tokio::test]
    async fn test_dispense_unknown() {
        let client = connect().await;
        assert!(matches!(
            client.dispense("app_storage"),
            Err(ServerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let storage = MemoryUserStorage::new(test_password_manager());
        let err = handle(&storage, "drop_database", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code, METHOD_NOT_FOUND);

        let err = handle(&storage, method::USER_BY_ID, Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_closed_plugin() {
        let (host, plugin) = tokio::io::duplex(1024);
        let (host_read, host_write) = tokio::io::split(host);
        let (_, mut plugin_write) = tokio::io::split(plugin);

        plugin_write
            .write_all(b"1|jsonrpc|user_storage\n")
            .await
            .unwrap();
        let timeout = Duration::from_millis(200);
        let client = Arc::new(
            PluginClient::connect(host_read, host_write, timeout)
                .await
                .unwrap(),
        );
        drop(plugin_write);

        let storage = client.dispense(USER_STORAGE_SERVICE).unwrap();
        assert!(matches!(
            storage.user_exists("alice").await,
            Err(ServerError::Internal { .. })
        ));
    }
}
