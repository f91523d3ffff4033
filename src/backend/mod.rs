use crate::config::BackendConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub type StorePath = str;
pub type SecretName = String;
pub type SecretValue = String;

/// Retrieved values keyed by secret name or version id, in key order.
pub type SecretMap = BTreeMap<SecretName, SecretValue>;
pub type Annotations = BTreeMap<String, String>;

/// Contract operations, named when a backend reports one as unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    GetSecrets,
    GetVersionedSecrets,
    GetIndividualSecret,
    SetIndividualSecret,
    GetSecret,
    GetAllSecretsInPath,
    DisableVersion,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::GetSecrets => "get secrets",
            Self::GetVersionedSecrets => "get secrets at version",
            Self::GetIndividualSecret => "get individual secret",
            Self::SetIndividualSecret => "set individual secret",
            Self::GetSecret => "get secret history",
            Self::GetAllSecretsInPath => "get all secrets in path",
            Self::DisableVersion => "disable version",
        };
        f.write_str(name)
    }
}

/// Result of a contract operation on a backend that may lack the capability.
///
/// `Supported` with an empty map means the store really is empty;
/// `Unsupported` means the backend never looked.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Supported(T),
    Unsupported(Operation),
}

impl<T> Outcome<T> {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }

    pub fn supported(self) -> Option<T> {
        match self {
            Self::Supported(value) => Some(value),
            Self::Unsupported(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Supported(value) => Outcome::Supported(f(value)),
            Self::Unsupported(op) => Outcome::Unsupported(op),
        }
    }
}

impl<T: Default> Outcome<T> {
    pub fn unwrap_or_default(self) -> T {
        self.supported().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    VaultKv,
    AzureKeyVault,
    YandexLockbox,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::VaultKv => "vault-kv",
            Self::AzureKeyVault => "azure-key-vault",
            Self::YandexLockbox => "yandex-lockbox",
        })
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vault-kv" | "vault" => Ok(Self::VaultKv),
            "azure-key-vault" | "azurekeyvault" => Ok(Self::AzureKeyVault),
            "yandex-lockbox" | "yandexcloudlockbox" | "lockbox" => Ok(Self::YandexLockbox),
            other => Err(Error::config(format!("unknown backend type `{other}`"))),
        }
    }
}

/// Uniform contract every secret store implements.
///
/// An operation a store cannot perform returns `Outcome::Unsupported`
/// instead of an error.
pub trait Backend {
    fn kind(&self) -> BackendKind;

    /// Establish a session for the calls that follow. Calling it again after
    /// a successful login is a no-op.
    fn login(&mut self) -> Result<()>;

    /// Current value of every secret in `path`, or, when `version` is not
    /// empty, the first enabled version of each secret whose id contains it.
    fn get_secrets(
        &self,
        path: &StorePath,
        version: &str,
        annotations: Option<&Annotations>,
    ) -> Result<Outcome<SecretMap>>;

    /// One secret at `version` (empty for current); `Error::NotFound` when the
    /// pair does not resolve.
    fn get_individual_secret(
        &self,
        path: &StorePath,
        secret: &str,
        version: &str,
        annotations: Option<&Annotations>,
    ) -> Result<Outcome<SecretValue>>;

    /// Plain write. Versioned stores add a new enabled version and leave the
    /// existing ones untouched.
    fn set_individual_secret(
        &mut self,
        path: &StorePath,
        secret: &str,
        version: &str,
        value: &str,
    ) -> Result<Outcome<()>>;

    /// Every version of one secret keyed by version id, enabled or not.
    fn get_secret(
        &self,
        path: &StorePath,
        secret: &str,
        annotations: Option<&Annotations>,
    ) -> Result<Outcome<SecretMap>>;

    /// Current value of every secret in `path`.
    fn get_all_secrets_in_path(
        &self,
        path: &StorePath,
        annotations: Option<&Annotations>,
    ) -> Result<Outcome<SecretMap>>;

    /// Mark one version disabled. Stores without version history keep the default.
    fn disable_version(
        &mut self,
        _path: &StorePath,
        _secret: &str,
        _version: &str,
    ) -> Result<Outcome<()>> {
        Ok(Outcome::Unsupported(Operation::DisableVersion))
    }
}

pub(crate) mod http;

#[cfg(feature = "vault-kv")]
pub mod vault_kv;

#[cfg(feature = "azure-key-vault")]
pub mod azure_key_vault;

#[cfg(feature = "yandex-lockbox")]
pub mod lockbox;

/// Build the configured backend. Nothing is sent until `login` is called.
pub fn build(config: &BackendConfig) -> Result<Box<dyn Backend>> {
    match config {
        #[cfg(feature = "vault-kv")]
        BackendConfig::VaultKv(cfg) => Ok(Box::new(vault_kv::VaultKvBackend::new(
            vault_kv::RestKvClient::new(cfg.clone())?,
        ))),
        #[cfg(feature = "azure-key-vault")]
        BackendConfig::AzureKeyVault(cfg) => Ok(Box::new(
            azure_key_vault::AzureKeyVaultBackend::new(azure_key_vault::RestKeyVaultClient::new(
                cfg.clone(),
            )?),
        )),
        #[cfg(feature = "yandex-lockbox")]
        BackendConfig::YandexLockbox(cfg) => Ok(Box::new(lockbox::LockboxBackend::new(
            lockbox::RestPayloadClient::new(cfg.clone())?,
        ))),
        #[allow(unreachable_patterns)]
        other => Err(Error::config(format!(
            "backend `{}` is not compiled into this build",
            other.kind()
        ))),
    }
}
