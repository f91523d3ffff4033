//! Azure Key Vault backend.
//!
//! Key Vault keeps every version of a secret, each with its own enabled
//! flag, and pages every listing through `nextLink` cursors. The store path
//! is the vault name (`https://<name>.vault.azure.net`) or a full vault URL.
//!
//! Version resolution for a whole vault:
//! - no version: page the secret listing and read each current value, the
//!   newest enabled version. When the newest version is disabled, the
//!   secret's history is paged for the newest enabled one. Any failed read
//!   aborts the call.
//! - version `v`: page each secret's history, skip disabled versions, and
//!   take the first version whose id contains `v`. Secrets without a match
//!   are left out.
//!
//! The service refuses to read a disabled version (`403` with inner code
//! `SecretDisabled`); the REST client reports that as `Error::NotFound`.

use super::{
    Annotations, Backend, BackendKind, Operation, Outcome, SecretMap, SecretValue, StorePath,
    http,
};
use crate::config::AzureConfig;
use crate::deadline::{self, Deadline};
use crate::error::{Error, Result};
use crate::paging::{Page, PageSource, Pager};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use url::Url;
use zeroize::Zeroizing;

const BACKEND: &str = "azure-key-vault";
const API_VERSION: &str = "7.4";
const SCOPE: &str = "https://vault.azure.net/.default";
const SECRET_DISABLED: &str = "SecretDisabled";

/// A secret or secret version as it appears in a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretItem {
    /// Full identifier, `https://<vault>/secrets/<name>[/<version>]`.
    pub id: String,
    pub enabled: bool,
    /// Creation time in Unix seconds; 0 when the service omits it.
    pub created: u64,
}

/// A secret version with its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretBundle {
    pub id: String,
    pub value: String,
    pub enabled: bool,
}

/// Raw Key Vault operations. `vault` is the normalized vault URL.
pub trait KeyVaultClient {
    fn authenticate(&mut self) -> Result<()>;

    fn list_secrets(
        &self,
        vault: &str,
        cursor: Option<&str>,
        deadline: &Deadline,
    ) -> Result<Page<SecretItem>>;

    fn list_versions(
        &self,
        vault: &str,
        name: &str,
        cursor: Option<&str>,
        deadline: &Deadline,
    ) -> Result<Page<SecretItem>>;

    /// Read one version; an empty `version` reads the newest one, enabled or
    /// not. Reading a version the service refuses to serve is `NotFound`.
    fn get_secret(
        &self,
        vault: &str,
        name: &str,
        version: &str,
        deadline: &Deadline,
    ) -> Result<SecretBundle>;

    fn set_enabled(
        &self,
        vault: &str,
        name: &str,
        version: &str,
        enabled: bool,
        deadline: &Deadline,
    ) -> Result<()>;

    /// Create a new enabled version holding `value`.
    fn set_secret(
        &self,
        vault: &str,
        name: &str,
        value: &str,
        deadline: &Deadline,
    ) -> Result<SecretBundle>;
}

/// Vault URL for a store path: a bare vault name or a full URL.
pub fn vault_url(path: &str) -> String {
    let path = path.trim().trim_end_matches('/');
    if path.starts_with("https://") || path.starts_with("http://") {
        path.to_string()
    } else {
        format!("https://{path}.vault.azure.net")
    }
}

/// Last path segment of an identifier: the name of a listed secret or the
/// version id of a listed version.
pub fn last_segment(id: &str) -> &str {
    id.trim_end_matches('/').rsplit('/').next().unwrap_or(id)
}

struct SecretListing<'a, C: ?Sized> {
    client: &'a C,
    vault: &'a str,
}

impl<C: KeyVaultClient + ?Sized> PageSource for SecretListing<'_, C> {
    type Item = SecretItem;

    fn fetch(&mut self, cursor: Option<&str>, deadline: &Deadline) -> Result<Page<SecretItem>> {
        self.client.list_secrets(self.vault, cursor, deadline)
    }
}

struct VersionListing<'a, C: ?Sized> {
    client: &'a C,
    vault: &'a str,
    name: &'a str,
}

impl<C: KeyVaultClient + ?Sized> PageSource for VersionListing<'_, C> {
    type Item = SecretItem;

    fn fetch(&mut self, cursor: Option<&str>, deadline: &Deadline) -> Result<Page<SecretItem>> {
        self.client.list_versions(self.vault, self.name, cursor, deadline)
    }
}

pub struct AzureKeyVaultBackend<C = RestKeyVaultClient> {
    client: C,
}

impl<C: KeyVaultClient> AzureKeyVaultBackend<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    fn secrets<'a>(&'a self, vault: &'a str, deadline: Deadline) -> Pager<SecretListing<'a, C>> {
        Pager::new(
            SecretListing {
                client: &self.client,
                vault,
            },
            deadline,
        )
    }

    fn versions<'a>(
        &'a self,
        vault: &'a str,
        name: &'a str,
        deadline: Deadline,
    ) -> Pager<VersionListing<'a, C>> {
        Pager::new(
            VersionListing {
                client: &self.client,
                vault,
                name,
            },
            deadline,
        )
    }

    /// Value of the newest enabled version of `name`, or `None` when every
    /// version is disabled. `listed_enabled` is the flag the secret listing
    /// reported for the newest version; when it is false the point read is
    /// skipped.
    fn current_value(
        &self,
        vault: &str,
        name: &str,
        listed_enabled: bool,
        deadline: Deadline,
    ) -> Result<Option<String>> {
        if listed_enabled {
            match self.client.get_secret(vault, name, "", &deadline) {
                Ok(bundle) if bundle.enabled => return Ok(Some(bundle.value)),
                Ok(_) | Err(Error::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        debug!(backend = BACKEND, secret = name, "newest version disabled, searching history");
        let Some(version_id) = self.newest_enabled(vault, name, deadline)? else {
            return Ok(None);
        };
        let bundle = self.client.get_secret(vault, name, &version_id, &deadline)?;
        Ok(Some(bundle.value))
    }

    /// Newest enabled version by creation time; ties go to the later item.
    fn newest_enabled(
        &self,
        vault: &str,
        name: &str,
        deadline: Deadline,
    ) -> Result<Option<String>> {
        let mut newest: Option<SecretItem> = None;
        for item in self.versions(vault, name, deadline) {
            let item = item?;
            if item.enabled && newest.as_ref().is_none_or(|n| item.created >= n.created) {
                newest = Some(item);
            }
        }
        Ok(newest.map(|item| last_segment(&item.id).to_string()))
    }

    fn current_values(&self, vault: &str, deadline: Deadline) -> Result<SecretMap> {
        let mut data = SecretMap::new();
        for item in self.secrets(vault, deadline) {
            let item = item?;
            let name = last_segment(&item.id);
            match self.current_value(vault, name, item.enabled, deadline)? {
                Some(value) => {
                    data.insert(name.to_string(), value);
                }
                None => debug!(backend = BACKEND, secret = name, "every version is disabled"),
            }
        }
        Ok(data)
    }

    fn values_at_version(
        &self,
        vault: &str,
        version: &str,
        deadline: Deadline,
    ) -> Result<SecretMap> {
        let mut data = SecretMap::new();
        for item in self.secrets(vault, deadline) {
            let item = item?;
            let name = last_segment(&item.id);
            match self.first_enabled_match(vault, name, version, deadline)? {
                Some(version_id) => {
                    let bundle = self.client.get_secret(vault, name, &version_id, &deadline)?;
                    data.insert(name.to_string(), bundle.value);
                }
                None => {
                    debug!(backend = BACKEND, secret = name, version, "no enabled version matches")
                }
            }
        }
        Ok(data)
    }

    fn first_enabled_match(
        &self,
        vault: &str,
        name: &str,
        version: &str,
        deadline: Deadline,
    ) -> Result<Option<String>> {
        for item in self.versions(vault, name, deadline) {
            let item = item?;
            if !item.enabled {
                continue;
            }
            let version_id = last_segment(&item.id);
            if version_id.contains(version) {
                return Ok(Some(version_id.to_string()));
            }
        }
        Ok(None)
    }
}

impl<C: KeyVaultClient> Backend for AzureKeyVaultBackend<C> {
    fn kind(&self) -> BackendKind {
        BackendKind::AzureKeyVault
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
        let vault = vault_url(path);
        let deadline = Deadline::after("azure get_secrets", deadline::CONTAINER_VERSIONS);
        let data = if version.is_empty() {
            self.current_values(&vault, deadline)?
        } else {
            self.values_at_version(&vault, version, deadline)?
        };
        Ok(Outcome::Supported(data))
    }

    fn get_individual_secret(
        &self,
        path: &StorePath,
        secret: &str,
        version: &str,
        _annotations: Option<&Annotations>,
    ) -> Result<Outcome<SecretValue>> {
        let vault = vault_url(path);
        let deadline = Deadline::after("azure get_individual_secret", deadline::POINT_LOOKUP);
        if version.is_empty() {
            return self
                .current_value(&vault, secret, true, deadline)?
                .map(Outcome::Supported)
                .ok_or_else(|| Error::not_found(path, secret, version));
        }
        let bundle = self.client.get_secret(&vault, secret, version, &deadline)?;
        if !bundle.enabled {
            return Err(Error::not_found(path, secret, version));
        }
        Ok(Outcome::Supported(bundle.value))
    }

    fn set_individual_secret(
        &mut self,
        path: &StorePath,
        secret: &str,
        _version: &str,
        value: &str,
    ) -> Result<Outcome<()>> {
        let vault = vault_url(path);
        let deadline = Deadline::after("azure set_individual_secret", deadline::POINT_LOOKUP);
        let bundle = self.client.set_secret(&vault, secret, value, &deadline)?;
        info!(
            backend = BACKEND,
            secret,
            version = last_segment(&bundle.id),
            "created secret version"
        );
        Ok(Outcome::Supported(()))
    }

    fn get_secret(
        &self,
        path: &StorePath,
        secret: &str,
        _annotations: Option<&Annotations>,
    ) -> Result<Outcome<SecretMap>> {
        let vault = vault_url(path);
        let deadline = Deadline::after("azure get_secret", deadline::SECRET_HISTORY);
        let mut data = SecretMap::new();
        for item in self.versions(&vault, secret, deadline) {
            let item = item?;
            let version_id = last_segment(&item.id);
            match self.client.get_secret(&vault, secret, version_id, &deadline) {
                Ok(bundle) => {
                    data.insert(version_id.to_string(), bundle.value);
                }
                Err(Error::NotFound { .. }) if !item.enabled => {
                    debug!(
                        backend = BACKEND,
                        secret,
                        version = version_id,
                        "disabled version is not readable"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(Outcome::Supported(data))
    }

    fn get_all_secrets_in_path(
        &self,
        path: &StorePath,
        _annotations: Option<&Annotations>,
    ) -> Result<Outcome<SecretMap>> {
        let vault = vault_url(path);
        let deadline =
            Deadline::after("azure get_all_secrets_in_path", deadline::CONTAINER_LISTING);
        Ok(Outcome::Supported(self.current_values(&vault, deadline)?))
    }

    fn disable_version(
        &mut self,
        path: &StorePath,
        secret: &str,
        version: &str,
    ) -> Result<Outcome<()>> {
        let vault = vault_url(path);
        let deadline = Deadline::after("azure disable_version", deadline::POINT_LOOKUP);
        self.client.set_enabled(&vault, secret, version, false, &deadline)?;
        info!(backend = BACKEND, secret, version, "disabled secret version");
        Ok(Outcome::Supported(()))
    }
}

/// `KeyVaultClient` over the Key Vault REST API, authenticated with the
/// client-credentials flow.
pub struct RestKeyVaultClient {
    http: Client,
    config: AzureConfig,
    token: Option<Zeroizing<String>>,
}

#[derive(Deserialize, Default)]
struct Attributes {
    enabled: Option<bool>,
    created: Option<u64>,
}

#[derive(Deserialize)]
struct ItemDto {
    id: String,
    #[serde(default)]
    attributes: Attributes,
}

#[derive(Deserialize)]
struct ListDto {
    #[serde(default)]
    value: Vec<ItemDto>,
    #[serde(rename = "nextLink")]
    next_link: Option<String>,
}

#[derive(Deserialize)]
struct BundleDto {
    id: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    attributes: Attributes,
}

#[derive(Deserialize)]
struct TokenDto {
    access_token: String,
}

#[derive(Deserialize)]
struct ErrorDto {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    innererror: Option<Box<ErrorBody>>,
}

impl From<ItemDto> for SecretItem {
    fn from(dto: ItemDto) -> Self {
        Self {
            id: dto.id,
            enabled: dto.attributes.enabled.unwrap_or(true),
            created: dto.attributes.created.unwrap_or_default(),
        }
    }
}

impl From<BundleDto> for SecretBundle {
    fn from(dto: BundleDto) -> Self {
        Self {
            id: dto.id,
            value: dto.value,
            enabled: dto.attributes.enabled.unwrap_or(true),
        }
    }
}

impl From<ListDto> for Page<SecretItem> {
    fn from(list: ListDto) -> Self {
        Self {
            items: list.value.into_iter().map(SecretItem::from).collect(),
            next: list.next_link.filter(|link| !link.is_empty()),
        }
    }
}

/// True when an error body names `SecretDisabled` at any nesting level.
fn is_secret_disabled(body: &str) -> bool {
    let Ok(dto) = serde_json::from_str::<ErrorDto>(body) else {
        return false;
    };
    let mut error = Some(&dto.error);
    while let Some(current) = error {
        if current.code == SECRET_DISABLED {
            return true;
        }
        error = current.innererror.as_deref();
    }
    false
}

/// Status check for secret reads: a `403 SecretDisabled` means the version
/// exists but cannot be read, which callers see as `not_found`.
fn check_read(response: Response, not_found: impl FnOnce() -> Error) -> Result<Response> {
    if response.status() != StatusCode::FORBIDDEN {
        return http::check(BACKEND, response, not_found);
    }
    let body = response.text().unwrap_or_default();
    if is_secret_disabled(&body) {
        return Err(not_found());
    }
    Err(Error::Service {
        status: StatusCode::FORBIDDEN.as_u16(),
        message: body,
    })
}

impl RestKeyVaultClient {
    pub fn new(config: AzureConfig) -> Result<Self> {
        Ok(Self {
            http: http::client()?,
            config,
            token: None,
        })
    }

    fn secret_url(vault: &str, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(vault)?;
        url.path_segments_mut()
            .map_err(|_| Error::config(format!("`{vault}` cannot be used as a vault URL")))?
            .pop_if_empty()
            .push("secrets")
            .extend(segments.iter().filter(|s| !s.is_empty()));
        url.query_pairs_mut().append_pair("api-version", API_VERSION);
        Ok(url)
    }

    fn call(&self, method: Method, url: Url, deadline: &Deadline) -> Result<RequestBuilder> {
        let token = self
            .token
            .as_ref()
            .ok_or_else(|| Error::auth(BACKEND, "login has not been called"))?;
        deadline.check()?;
        Ok(self.http.request(method, url).bearer_auth(token.as_str()))
    }

    fn list(
        &self,
        first: Url,
        cursor: Option<&str>,
        deadline: &Deadline,
    ) -> Result<Page<SecretItem>> {
        let url = match cursor {
            Some(next) => Url::parse(next)?,
            None => first,
        };
        let not_found = url.to_string();
        let response = http::send(self.call(Method::GET, url, deadline)?, deadline)?;
        let response = http::check(BACKEND, response, || Error::not_found(&not_found, "", ""))?;
        Ok(http::decode::<ListDto>(response)?.into())
    }
}

impl KeyVaultClient for RestKeyVaultClient {
    fn authenticate(&mut self) -> Result<()> {
        if self.token.is_some() {
            return Ok(());
        }
        let deadline = Deadline::after("azure login", deadline::POINT_LOOKUP);
        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.config.authority, self.config.tenant_id
        );
        let form = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.expose()),
            ("scope", SCOPE),
            ("grant_type", "client_credentials"),
        ];
        let response = http::send(self.http.post(url).form(&form), &deadline)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(Error::auth(BACKEND, format!("token endpoint returned {status}: {body}")));
        }
        let token: TokenDto = http::decode(response)?;
        self.token = Some(Zeroizing::new(token.access_token));
        info!(backend = BACKEND, tenant = %self.config.tenant_id, "logged in");
        Ok(())
    }

    fn list_secrets(
        &self,
        vault: &str,
        cursor: Option<&str>,
        deadline: &Deadline,
    ) -> Result<Page<SecretItem>> {
        self.list(Self::secret_url(vault, &[])?, cursor, deadline)
    }

    fn list_versions(
        &self,
        vault: &str,
        name: &str,
        cursor: Option<&str>,
        deadline: &Deadline,
    ) -> Result<Page<SecretItem>> {
        self.list(Self::secret_url(vault, &[name, "versions"])?, cursor, deadline)
    }

    fn get_secret(
        &self,
        vault: &str,
        name: &str,
        version: &str,
        deadline: &Deadline,
    ) -> Result<SecretBundle> {
        let url = Self::secret_url(vault, &[name, version])?;
        let response = http::send(self.call(Method::GET, url, deadline)?, deadline)?;
        let response = check_read(response, || Error::not_found(vault, name, version))?;
        Ok(http::decode::<BundleDto>(response)?.into())
    }

    fn set_enabled(
        &self,
        vault: &str,
        name: &str,
        version: &str,
        enabled: bool,
        deadline: &Deadline,
    ) -> Result<()> {
        let url = Self::secret_url(vault, &[name, version])?;
        let request = self
            .call(Method::PATCH, url, deadline)?
            .json(&json!({ "attributes": { "enabled": enabled } }));
        let response = http::send(request, deadline)?;
        http::check(BACKEND, response, || Error::not_found(vault, name, version))?;
        Ok(())
    }

    fn set_secret(
        &self,
        vault: &str,
        name: &str,
        value: &str,
        deadline: &Deadline,
    ) -> Result<SecretBundle> {
        let url = Self::secret_url(vault, &[name])?;
        let request = self
            .call(Method::PUT, url, deadline)?
            .json(&json!({ "value": value }));
        let response = http::send(request, deadline)?;
        let response = http::check(BACKEND, response, || Error::not_found(vault, name, ""))?;
        Ok(http::decode::<BundleDto>(response)?.into())
    }
}
