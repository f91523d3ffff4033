//! Yandex Cloud Lockbox backend.
//!
//! The store path is a lockbox secret id; its payload entries are the
//! secrets. Payloads are versioned as a whole, so a version-constrained read
//! returns the payload at that version id. Lockbox exposes no per-entry
//! history and this backend does not write.

use super::{
    Annotations, Backend, BackendKind, Operation, Outcome, SecretMap, SecretValue, StorePath,
    http,
};
use crate::config::LockboxConfig;
use crate::deadline::{self, Deadline};
use crate::error::{Error, Result};
use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

const BACKEND: &str = "yandex-lockbox";

/// Payload of one lockbox secret at one version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub version_id: String,
    pub entries: SecretMap,
}

pub trait PayloadClient {
    fn authenticate(&mut self) -> Result<()>;

    /// Payload at `version`, or the current one when `None`.
    fn get_payload(
        &self,
        secret_id: &str,
        version: Option<&str>,
        deadline: &Deadline,
    ) -> Result<Payload>;
}

pub struct LockboxBackend<C = RestPayloadClient> {
    client: C,
}

impl<C: PayloadClient> LockboxBackend<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    fn payload(&self, secret_id: &str, version: &str, operation: &'static str) -> Result<Payload> {
        let deadline = Deadline::after(operation, deadline::POINT_LOOKUP);
        let version = (!version.is_empty()).then_some(version);
        let payload = self.client.get_payload(secret_id, version, &deadline)?;
        debug!(
            backend = BACKEND,
            secret_id,
            version = %payload.version_id,
            entries = payload.entries.len(),
            "fetched payload"
        );
        Ok(payload)
    }
}

impl<C: PayloadClient> Backend for LockboxBackend<C> {
    fn kind(&self) -> BackendKind {
        BackendKind::YandexLockbox
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
        let payload = self.payload(path, version, "lockbox get_secrets")?;
        Ok(Outcome::Supported(payload.entries))
    }

    fn get_individual_secret(
        &self,
        path: &StorePath,
        secret: &str,
        version: &str,
        _annotations: Option<&Annotations>,
    ) -> Result<Outcome<SecretValue>> {
        let mut payload = self.payload(path, version, "lockbox get_individual_secret")?;
        payload
            .entries
            .remove(secret)
            .map(Outcome::Supported)
            .ok_or_else(|| Error::not_found(path, secret, version))
    }

    fn set_individual_secret(
        &mut self,
        _path: &StorePath,
        _secret: &str,
        _version: &str,
        _value: &str,
    ) -> Result<Outcome<()>> {
        Ok(Outcome::Unsupported(Operation::SetIndividualSecret))
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
        let payload = self.payload(path, "", "lockbox get_all_secrets_in_path")?;
        Ok(Outcome::Supported(payload.entries))
    }
}

/// `PayloadClient` over the Lockbox payload REST API, using a pre-issued IAM token.
pub struct RestPayloadClient {
    http: Client,
    config: LockboxConfig,
    ready: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayloadDto {
    #[serde(default)]
    version_id: String,
    #[serde(default)]
    entries: Vec<EntryDto>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryDto {
    key: String,
    text_value: Option<String>,
}

impl RestPayloadClient {
    pub fn new(config: LockboxConfig) -> Result<Self> {
        Ok(Self {
            http: http::client()?,
            config,
            ready: false,
        })
    }

    fn payload_url(&self, secret_id: &str) -> Result<Url> {
        let endpoint = &self.config.endpoint;
        let mut url = Url::parse(endpoint)?;
        url.path_segments_mut()
            .map_err(|_| {
                Error::config(format!("`{endpoint}` cannot be used as a Lockbox endpoint"))
            })?
            .pop_if_empty()
            .extend(["lockbox", "v1", "secrets", secret_id, "payload"]);
        Ok(url)
    }
}

impl From<PayloadDto> for Payload {
    fn from(dto: PayloadDto) -> Self {
        let entries = dto
            .entries
            .into_iter()
            .filter_map(|entry| match entry.text_value {
                Some(value) => Some((entry.key, value)),
                None => {
                    debug!(backend = BACKEND, key = %entry.key, "skipping binary entry");
                    None
                }
            })
            .collect();
        Self {
            version_id: dto.version_id,
            entries,
        }
    }
}

impl PayloadClient for RestPayloadClient {
    fn authenticate(&mut self) -> Result<()> {
        if self.config.iam_token.expose().trim().is_empty() {
            return Err(Error::auth(BACKEND, "IAM token is empty"));
        }
        if !self.ready {
            info!(backend = BACKEND, endpoint = %self.config.endpoint, "using IAM token");
            self.ready = true;
        }
        Ok(())
    }

    fn get_payload(
        &self,
        secret_id: &str,
        version: Option<&str>,
        deadline: &Deadline,
    ) -> Result<Payload> {
        if !self.ready {
            return Err(Error::auth(BACKEND, "login has not been called"));
        }
        let url = self.payload_url(secret_id)?;
        let mut request = self
            .http
            .get(url)
            .bearer_auth(self.config.iam_token.expose());
        if let Some(version) = version {
            request = request.query(&[("versionId", version)]);
        }
        let response = http::send(request, deadline)?;
        let response = http::check(BACKEND, response, || {
            Error::not_found(secret_id, "", version.unwrap_or(""))
        })?;
        Ok(http::decode::<PayloadDto>(response)?.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::http::tests::serve_once;
    use crate::config::Secret;
    use std::collections::HashMap;

    struct StaticLockbox {
        versions: HashMap<String, SecretMap>,
        current: String,
    }

    impl PayloadClient for StaticLockbox {
        fn authenticate(&mut self) -> Result<()> {
            Ok(())
        }

        fn get_payload(
            &self,
            secret_id: &str,
            version: Option<&str>,
            _deadline: &Deadline,
        ) -> Result<Payload> {
            let version_id = version.unwrap_or(&self.current).to_string();
            let entries = self
                .versions
                .get(&version_id)
                .cloned()
                .ok_or_else(|| Error::not_found(secret_id, "", &version_id))?;
            Ok(Payload {
                version_id,
                entries,
            })
        }
    }

    fn lockbox() -> LockboxBackend<StaticLockbox> {
        let map = |pairs: &[(&str, &str)]| -> SecretMap {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };
        LockboxBackend::new(StaticLockbox {
            versions: HashMap::from([
                ("ver1".to_string(), map(&[("user", "admin"), ("pass", "old")])),
                ("ver2".to_string(), map(&[("user", "admin"), ("pass", "new")])),
            ]),
            current: "ver2".to_string(),
        })
    }

    #[test]
    fn reads_current_and_versioned_payloads() {
        let backend = lockbox();
        let current = backend.get_secrets("e6q1", "", None).unwrap().supported().unwrap();
        assert_eq!(current["pass"], "new");
        let old = backend.get_secrets("e6q1", "ver1", None).unwrap().supported().unwrap();
        assert_eq!(old["pass"], "old");
        assert_eq!(
            backend.get_all_secrets_in_path("e6q1", None).unwrap(),
            Outcome::Supported(current)
        );
    }

    #[test]
    fn missing_key_is_not_found() {
        let err = lockbox()
            .get_individual_secret("e6q1", "token", "ver1", None)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { ref version, .. } if version == "ver1"));
    }

    #[test]
    fn writes_and_history_are_unsupported() {
        let mut backend = lockbox();
        assert_eq!(
            backend.set_individual_secret("e6q1", "pass", "", "x").unwrap(),
            Outcome::Unsupported(Operation::SetIndividualSecret)
        );
        assert_eq!(
            backend.get_secret("e6q1", "pass", None).unwrap(),
            Outcome::Unsupported(Operation::GetSecret)
        );
    }

    #[test]
    fn binary_entries_are_skipped() {
        let dto: PayloadDto = serde_json::from_str(
            r#"{
                "versionId": "v9",
                "entries": [{"key": "a", "textValue": "1"}, {"key": "b", "binaryValue": "AAE="}]
            }"#,
        )
        .unwrap();
        let payload = Payload::from(dto);
        assert_eq!(payload.version_id, "v9");
        assert_eq!(payload.entries.len(), 1);
        assert_eq!(payload.entries["a"], "1");
    }

    fn rest_client(endpoint: &str) -> RestPayloadClient {
        let mut client = RestPayloadClient::new(LockboxConfig {
            iam_token: Secret::new("t1.iam".to_string()),
            endpoint: endpoint.to_string(),
        })
        .unwrap();
        client.authenticate().unwrap();
        client
    }

    fn point_lookup() -> Deadline {
        Deadline::after("test", deadline::POINT_LOOKUP)
    }

    #[test]
    fn payload_url_escapes_the_secret_id() {
        let client = rest_client("https://payload.lockbox.api.cloud.yandex.net/");
        assert_eq!(
            client.payload_url("e6q1").unwrap().as_str(),
            "https://payload.lockbox.api.cloud.yandex.net/lockbox/v1/secrets/e6q1/payload"
        );
        assert_eq!(
            client.payload_url("e6q?x#y/z").unwrap().path(),
            "/lockbox/v1/secrets/e6q%3Fx%23y%2Fz/payload"
        );
    }

    #[test]
    fn rest_payload_is_decoded() {
        let endpoint = serve_once(
            "200 OK",
            r#"{"versionId":"ver2","entries":[{"key":"pass","textValue":"new"}]}"#,
        );
        let payload = rest_client(&endpoint)
            .get_payload("e6q1", Some("ver2"), &point_lookup())
            .unwrap();
        assert_eq!(payload.version_id, "ver2");
        assert_eq!(payload.entries["pass"], "new");
    }

    #[test]
    fn rest_missing_payload_is_not_found() {
        let endpoint = serve_once("404 Not Found", r#"{"code":5,"message":"not found"}"#);
        let err = rest_client(&endpoint)
            .get_payload("e6q1", Some("ver9"), &point_lookup())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { ref version, .. } if version == "ver9"));
    }

    #[test]
    fn empty_iam_token_fails_login() {
        let mut client = RestPayloadClient::new(LockboxConfig {
            iam_token: Secret::new("  ".to_string()),
            endpoint: "https://payload.lockbox.api.cloud.yandex.net".to_string(),
        })
        .unwrap();
        assert!(matches!(client.authenticate(), Err(Error::Auth { .. })));
    }
}
