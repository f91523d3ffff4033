//! HashiCorp Vault KV (version 1) backend.
//!
//! A store path holds one flat map of secret names to values. There is no
//! version history, so versioned reads, history and disabling are reported
//! as unsupported and rotation falls back to an overwrite.

use super::{
    Annotations, Backend, BackendKind, Operation, Outcome, SecretMap, SecretValue, StorePath,
    http,
};
use crate::config::{VaultAuth, VaultKvConfig};
use crate::deadline::{self, Deadline};
use crate::error::{Error, Result};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};
use url::Url;
use zeroize::Zeroizing;

const BACKEND: &str = "vault-kv";

/// Raw access to a KV mount.
pub trait KvClient {
    fn authenticate(&mut self) -> Result<()>;

    /// Read the map at `path`; `None` when nothing is stored there.
    fn read(&self, path: &str, deadline: &Deadline) -> Result<Option<SecretMap>>;

    /// Replace the map at `path`.
    fn write(&self, path: &str, data: &SecretMap, deadline: &Deadline) -> Result<()>;
}

pub struct VaultKvBackend<C = RestKvClient> {
    client: C,
}

impl<C: KvClient> VaultKvBackend<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    fn read_path(&self, path: &str, operation: &'static str) -> Result<SecretMap> {
        let deadline = Deadline::after(operation, deadline::POINT_LOOKUP);
        match self.client.read(path, &deadline)? {
            Some(data) => Ok(data),
            None => {
                debug!(backend = BACKEND, path, "nothing stored at path");
                Ok(SecretMap::new())
            }
        }
    }
}

impl<C: KvClient> Backend for VaultKvBackend<C> {
    fn kind(&self) -> BackendKind {
        BackendKind::VaultKv
    }

    fn login(&mut self) -> Result<()> {
        self.client.authenticate()
    }

    fn get_secrets(
        &self,
        path: &StorePath,
        version: &str,
        _annotations: Option<&Annotations>,
    ) -> Result<Outcome<SecretMap>> {
        if !version.is_empty() {
            return Ok(Outcome::Unsupported(Operation::GetVersionedSecrets));
        }
        Ok(Outcome::Supported(self.read_path(path, "vault-kv get_secrets")?))
    }

    fn get_individual_secret(
        &self,
        path: &StorePath,
        secret: &str,
        version: &str,
        _annotations: Option<&Annotations>,
    ) -> Result<Outcome<SecretValue>> {
        if !version.is_empty() {
            return Ok(Outcome::Unsupported(Operation::GetIndividualSecret));
        }
        let mut data = self.read_path(path, "vault-kv get_individual_secret")?;
        data.remove(secret)
            .map(Outcome::Supported)
            .ok_or_else(|| Error::not_found(path, secret, version))
    }

    fn set_individual_secret(
        &mut self,
        path: &StorePath,
        secret: &str,
        version: &str,
        value: &str,
    ) -> Result<Outcome<()>> {
        if !version.is_empty() {
            debug!(backend = BACKEND, path, secret, version, "ignoring version on flat store");
        }
        let deadline = Deadline::after("vault-kv set_individual_secret", deadline::POINT_LOOKUP);
        let mut data = self.client.read(path, &deadline)?.unwrap_or_default();
        data.insert(secret.to_string(), value.to_string());
        self.client.write(path, &data, &deadline)?;
        info!(backend = BACKEND, path, secret, "secret written");
        Ok(Outcome::Supported(()))
    }

    fn get_secret(
        &self,
        _path: &StorePath,
        _secret: &str,
        _annotations: Option<&Annotations>,
    ) -> Result<Outcome<SecretMap>> {
        Ok(Outcome::Unsupported(Operation::GetSecret))
    }

    fn get_all_secrets_in_path(
        &self,
        path: &StorePath,
        _annotations: Option<&Annotations>,
    ) -> Result<Outcome<SecretMap>> {
        Ok(Outcome::Supported(
            self.read_path(path, "vault-kv get_all_secrets_in_path")?,
        ))
    }
}

/// `KvClient` over Vault's HTTP API.
pub struct RestKvClient {
    http: Client,
    config: VaultKvConfig,
    token: Option<Zeroizing<String>>,
}

#[derive(Deserialize)]
struct ReadResponse {
    #[serde(default)]
    data: serde_json::Map<String, Value>,
}

impl ReadResponse {
    /// Strings stay as they are; any other JSON value is kept as JSON text.
    fn into_map(self) -> SecretMap {
        self.data
            .into_iter()
            .map(|(key, value)| match value {
                Value::String(s) => (key, s),
                other => (key, other.to_string()),
            })
            .collect()
    }
}

#[derive(Deserialize)]
struct LoginResponse {
    auth: LoginAuth,
}

#[derive(Deserialize)]
struct LoginAuth {
    client_token: String,
}

impl RestKvClient {
    pub fn new(config: VaultKvConfig) -> Result<Self> {
        Ok(Self {
            http: http::client()?,
            config,
            token: None,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        let address = &self.config.address;
        let mut url = Url::parse(address)?;
        url.path_segments_mut()
            .map_err(|_| Error::config(format!("`{address}` cannot be used as a Vault address")))?
            .pop_if_empty()
            .push("v1")
            .extend(path.split('/').filter(|s| !s.is_empty()));
        Ok(url)
    }

    fn token(&self) -> Result<&str> {
        self.token
            .as_ref()
            .map(|t| t.as_str())
            .ok_or_else(|| Error::auth(BACKEND, "login has not been called"))
    }
}

impl KvClient for RestKvClient {
    fn authenticate(&mut self) -> Result<()> {
        if self.token.is_some() {
            return Ok(());
        }
        let deadline = Deadline::after("vault-kv login", deadline::POINT_LOOKUP);
        let token = match &self.config.auth {
            VaultAuth::Token(token) => {
                let request = self
                    .http
                    .get(self.url("auth/token/lookup-self")?)
                    .header("X-Vault-Token", token.expose());
                let response = http::send(request, &deadline)?;
                if !response.status().is_success() {
                    return Err(Error::auth(
                        BACKEND,
                        format!("token rejected: {}", response.status()),
                    ));
                }
                token.expose().to_string()
            }
            VaultAuth::AppRole { role_id, secret_id } => {
                let request = self.http.post(self.url("auth/approle/login")?).json(
                    &serde_json::json!({ "role_id": role_id, "secret_id": secret_id.expose() }),
                );
                let response = http::send(request, &deadline)?;
                if !response.status().is_success() {
                    return Err(Error::auth(
                        BACKEND,
                        format!("approle login rejected: {}", response.status()),
                    ));
                }
                let login: LoginResponse = http::decode(response)?;
                login.auth.client_token
            }
        };
        self.token = Some(Zeroizing::new(token));
        info!(backend = BACKEND, address = %self.config.address, "logged in");
        Ok(())
    }

    fn read(&self, path: &str, deadline: &Deadline) -> Result<Option<SecretMap>> {
        let request = self
            .http
            .get(self.url(path)?)
            .header("X-Vault-Token", self.token()?);
        let response = http::send(request, deadline)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = http::check(BACKEND, response, || Error::not_found(path, "", ""))?;
        Ok(Some(http::decode::<ReadResponse>(response)?.into_map()))
    }

    fn write(&self, path: &str, data: &SecretMap, deadline: &Deadline) -> Result<()> {
        let request = self
            .http
            .post(self.url(path)?)
            .header("X-Vault-Token", self.token()?)
            .json(data);
        let response = http::send(request, deadline)?;
        http::check(BACKEND, response, || Error::not_found(path, "", ""))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::http::tests::serve_once;
    use crate::config::Secret;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MemoryKv {
        paths: RefCell<HashMap<String, SecretMap>>,
        logged_in: bool,
    }

    impl KvClient for MemoryKv {
        fn authenticate(&mut self) -> Result<()> {
            self.logged_in = true;
            Ok(())
        }

        fn read(&self, path: &str, _deadline: &Deadline) -> Result<Option<SecretMap>> {
            Ok(self.paths.borrow().get(path).cloned())
        }

        fn write(&self, path: &str, data: &SecretMap, _deadline: &Deadline) -> Result<()> {
            self.paths.borrow_mut().insert(path.to_string(), data.clone());
            Ok(())
        }
    }

    fn backend_with(path: &str, pairs: &[(&str, &str)]) -> VaultKvBackend<MemoryKv> {
        let client = MemoryKv::default();
        client.paths.borrow_mut().insert(
            path.to_string(),
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        VaultKvBackend::new(client)
    }

    #[test]
    fn set_then_get_returns_new_value() {
        let mut backend = backend_with("secret/app", &[("db-pass", "old")]);
        backend.login().unwrap();
        assert!(backend.client.logged_in);

        let outcome = backend
            .set_individual_secret("secret/app", "db-pass", "", "newvalue")
            .unwrap();
        assert_eq!(outcome, Outcome::Supported(()));
        let value = backend
            .get_individual_secret("secret/app", "db-pass", "", None)
            .unwrap();
        assert_eq!(value, Outcome::Supported("newvalue".to_string()));
    }

    #[test]
    fn write_keeps_sibling_keys() {
        let mut backend = backend_with("secret/app", &[("a", "1")]);
        let _ = backend
            .set_individual_secret("secret/app", "b", "", "2")
            .unwrap();
        let all = backend
            .get_all_secrets_in_path("secret/app", None)
            .unwrap()
            .supported()
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["a"], "1");
        assert_eq!(all["b"], "2");
    }

    #[test]
    fn missing_key_is_not_found() {
        let backend = backend_with("secret/app", &[("a", "1")]);
        let err = backend
            .get_individual_secret("secret/app", "zzz", "", None)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { ref secret, .. } if secret == "zzz"));
    }

    #[test]
    fn empty_path_is_an_empty_success() {
        let backend = backend_with("secret/app", &[]);
        let outcome = backend.get_secrets("secret/other", "", None).unwrap();
        assert_eq!(outcome, Outcome::Supported(SecretMap::new()));
    }

    #[test]
    fn versioned_operations_are_unsupported() {
        let mut backend = backend_with("secret/app", &[("a", "1")]);
        assert_eq!(
            backend.get_secrets("secret/app", "v2", None).unwrap(),
            Outcome::Unsupported(Operation::GetVersionedSecrets)
        );
        assert_eq!(
            backend.get_secret("secret/app", "a", None).unwrap(),
            Outcome::Unsupported(Operation::GetSecret)
        );
        assert_eq!(
            backend.disable_version("secret/app", "a", "v1").unwrap(),
            Outcome::Unsupported(Operation::DisableVersion)
        );
    }

    fn rest_client(address: &str) -> RestKvClient {
        RestKvClient {
            http: http::client().unwrap(),
            config: VaultKvConfig {
                address: address.to_string(),
                auth: VaultAuth::Token(Secret::new("s.token".to_string())),
            },
            token: Some(Zeroizing::new("s.token".to_string())),
        }
    }

    fn point_lookup() -> Deadline {
        Deadline::after("test", deadline::POINT_LOOKUP)
    }

    #[test]
    fn urls_escape_each_path_segment() {
        let client = rest_client("http://127.0.0.1:8200/");
        assert_eq!(
            client.url("/secret/app/").unwrap().as_str(),
            "http://127.0.0.1:8200/v1/secret/app"
        );
        assert_eq!(
            client.url("secret/a?b#c").unwrap().as_str(),
            "http://127.0.0.1:8200/v1/secret/a%3Fb%23c"
        );
    }

    #[test]
    fn non_string_values_are_kept_as_json_text() {
        let body: ReadResponse = serde_json::from_str(
            r#"{"data": {"port": 5, "debug": true, "user": "admin", "opts": {"a": 1}}}"#,
        )
        .unwrap();
        let map = body.into_map();
        assert_eq!(map["port"], "5");
        assert_eq!(map["debug"], "true");
        assert_eq!(map["user"], "admin");
        assert_eq!(map["opts"], r#"{"a":1}"#);
        let empty: ReadResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.into_map().is_empty());
    }

    #[test]
    fn rest_read_returns_the_data_block() {
        let address = serve_once("200 OK", r#"{"data": {"db-pass": "pw"}, "lease_duration": 0}"#);
        let data = rest_client(&address)
            .read("secret/app", &point_lookup())
            .unwrap()
            .unwrap();
        assert_eq!(data["db-pass"], "pw");
    }

    #[test]
    fn rest_read_of_a_missing_path_is_none() {
        let address = serve_once("404 Not Found", r#"{"errors": []}"#);
        let data = rest_client(&address).read("secret/none", &point_lookup()).unwrap();
        assert_eq!(data, None);
    }

    #[test]
    fn rest_read_with_a_bad_token_is_an_auth_error() {
        let address = serve_once("401 Unauthorized", r#"{"errors": ["permission denied"]}"#);
        let err = rest_client(&address).read("secret/app", &point_lookup()).unwrap_err();
        assert!(matches!(err, Error::Auth { .. }));
    }
}
