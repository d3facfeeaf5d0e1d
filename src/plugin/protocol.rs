//! JSON-RPC 2.0 messages exchanged with a plugin, one per line.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ServerError;
use crate::model::User;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i32 = -32700;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32000;
pub const NOT_FOUND: i32 = -32001;
pub const ALREADY_EXISTS: i32 = -32002;
pub const WRONG_DATA_FORMAT: i32 = -32003;
pub const INACTIVE_USER: i32 = -32004;
pub const NOT_IMPLEMENTED: i32 = -32005;

/// Names of remote [`crate::storage::UserStorage`] methods.
pub mod method {
    pub const USER_BY_ID: &str = "user_by_id";
    pub const USER_BY_EMAIL: &str = "user_by_email";
    pub const USER_BY_PHONE: &str = "user_by_phone";
    pub const USER_BY_FEDERATED_ID: &str = "user_by_federated_id";
    pub const USER_EXISTS: &str = "user_exists";
    pub const USER_BY_NAME_PASSWORD: &str = "user_by_name_password";
    pub const ID_BY_NAME: &str = "id_by_name";
    pub const ADD_NEW_USER: &str = "add_new_user";
    pub const ADD_USER_BY_NAME_AND_PASSWORD: &str = "add_user_by_name_and_password";
    pub const ADD_USER_BY_PHONE: &str = "add_user_by_phone";
    pub const ADD_USER_WITH_FEDERATED_ID: &str = "add_user_with_federated_id";
    pub const UPDATE_USER: &str = "update_user";
    pub const RESET_PASSWORD: &str = "reset_password";
    pub const RESET_USERNAME: &str = "reset_username";
    pub const DELETE_USER: &str = "delete_user";
    pub const FETCH_USERS: &str = "fetch_users";
    pub const UPDATE_LOGIN_METADATA: &str = "update_login_metadata";
    pub const REQUEST_SCOPES: &str = "request_scopes";
    pub const SCOPES: &str = "scopes";
    pub const ATTACH_DEVICE_TOKEN: &str = "attach_device_token";
    pub const DETACH_DEVICE_TOKEN: &str = "detach_device_token";
    pub const IMPORT_JSON: &str = "import_json";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub id: u64,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.to_owned(),
            params,
            id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Option<u64>,
}

impl JsonRpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: Some(result),
            error: None,
            id: Some(id),
        }
    }

    pub fn failure(id: Option<u64>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<ServerError> for JsonRpcError {
    fn from(err: ServerError) -> Self {
        let code = match &err {
            ServerError::NotFound => NOT_FOUND,
            ServerError::AlreadyExists => ALREADY_EXISTS,
            ServerError::WrongDataFormat(_) => WRONG_DATA_FORMAT,
            ServerError::InactiveUser => INACTIVE_USER,
            ServerError::NotImplemented => NOT_IMPLEMENTED,
            _ => INTERNAL_ERROR,
        };

        let message = match err {
            ServerError::WrongDataFormat(details) => details,
            err => err.to_string(),
        };

        Self { code, message }
    }
}

impl From<JsonRpcError> for ServerError {
    fn from(err: JsonRpcError) -> Self {
        match err.code {
            NOT_FOUND => ServerError::NotFound,
            ALREADY_EXISTS => ServerError::AlreadyExists,
            WRONG_DATA_FORMAT => ServerError::WrongDataFormat(err.message),
            INACTIVE_USER => ServerError::InactiveUser,
            NOT_IMPLEMENTED => ServerError::NotImplemented,
            code => ServerError::internal(format!(
                "plugin error {code}: {}",
                err.message
            )),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Id {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Name {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Email {
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Phone {
    pub phone: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FederatedId {
    pub provider: String,
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Credentials {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NewUser {
    pub user: User,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NewNamedUser {
    pub username: String,
    pub password: String,
    pub role: String,
    pub is_anonymous: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NewPhoneUser {
    pub phone: String,
    pub role: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NewFederatedUser {
    pub provider: String,
    pub federated_id: String,
    pub role: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateUser {
    pub id: String,
    pub user: User,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResetPassword {
    pub id: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResetUsername {
    pub id: String,
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchUsers {
    pub filter: String,
    pub skip: usize,
    pub limit: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserPage {
    pub users: Vec<User>,
    pub total: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RequestScopes {
    pub user_id: String,
    pub scopes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceToken {
    #[serde(default)]
    pub id: String,
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Import {
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        for err in [
            ServerError::NotFound,
            ServerError::AlreadyExists,
            ServerError::InactiveUser,
            ServerError::NotImplemented,
        ] {
            let expected = err.to_string();
            let back = ServerError::from(JsonRpcError::from(err));
            assert_eq!(back.to_string(), expected);
        }

        let err = JsonRpcError::from(ServerError::WrongDataFormat("bad id".into()));
        assert_eq!(err.code, WRONG_DATA_FORMAT);
        assert!(matches!(
            ServerError::from(err),
            ServerError::WrongDataFormat(details) if details == "bad id"
        ));

        assert!(matches!(
            ServerError::from(JsonRpcError::new(METHOD_NOT_FOUND, "nope")),
            ServerError::Internal { .. }
        ));
        assert_eq!(
            JsonRpcError::from(ServerError::Config("x".into())).code,
            INTERNAL_ERROR
        );
    }

    #[test]
    fn test_response_shape() {
        let response = JsonRpcResponse::failure(
            Some(7),
            JsonRpcError::new(NOT_FOUND, "not found"),
        );
        let value = serde_json::to_value(&response).unwrap();

        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 7);
        assert_eq!(value["error"]["code"], -32001);
        assert!(value.get("result").is_none());
    }
}
