//! Backend selection and credentials.
//!
//! Settings come from an optional YAML/JSON file and are then overridden by
//! environment variables. When no file is given, `<config dir>/vaultplate/config.yaml`
//! is read if it exists.

use crate::backend::BackendKind;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

pub const DEFAULT_AZURE_AUTHORITY: &str = "https://login.microsoftonline.com";
pub const DEFAULT_LOCKBOX_ENDPOINT: &str = "https://payload.lockbox.api.cloud.yandex.net";

/// Credential material; wiped on drop and never printed.
#[derive(Clone)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: String) -> Self {
        Self(Zeroizing::new(value))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone)]
pub enum VaultAuth {
    Token(Secret),
    AppRole { role_id: String, secret_id: Secret },
}

#[derive(Debug, Clone)]
pub struct VaultKvConfig {
    pub address: String,
    pub auth: VaultAuth,
}

#[derive(Debug, Clone)]
pub struct AzureConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: Secret,
    pub authority: String,
}

#[derive(Debug, Clone)]
pub struct LockboxConfig {
    pub iam_token: Secret,
    pub endpoint: String,
}

#[derive(Debug, Clone)]
pub enum BackendConfig {
    VaultKv(VaultKvConfig),
    AzureKeyVault(AzureConfig),
    YandexLockbox(LockboxConfig),
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::VaultKv(_) => BackendKind::VaultKv,
            Self::AzureKeyVault(_) => BackendKind::AzureKeyVault,
            Self::YandexLockbox(_) => BackendKind::YandexLockbox,
        }
    }
}

/// Raw settings before validation. Field names double as config file keys.
#[derive(Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub backend: Option<BackendKind>,
    pub vault_addr: Option<String>,
    pub vault_token: Option<String>,
    pub role_id: Option<String>,
    pub secret_id: Option<String>,
    pub azure_tenant_id: Option<String>,
    pub azure_client_id: Option<String>,
    pub azure_client_secret: Option<String>,
    pub azure_authority: Option<String>,
    pub iam_token: Option<String>,
    pub lockbox_endpoint: Option<String>,
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&text).map_err(|e| {
            Error::config(format!("failed to parse config file {}: {e}", path.display()))
        })
    }

    /// Override fields with values from `lookup`, usually the process environment.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(kind) = get("VAULTPLATE_BACKEND") {
            self.backend = Some(kind.parse()?);
        }
        let overrides: [(&str, &mut Option<String>); 10] = [
            ("VAULT_ADDR", &mut self.vault_addr),
            ("VAULT_TOKEN", &mut self.vault_token),
            ("VAULTPLATE_ROLE_ID", &mut self.role_id),
            ("VAULTPLATE_SECRET_ID", &mut self.secret_id),
            ("AZURE_TENANT_ID", &mut self.azure_tenant_id),
            ("AZURE_CLIENT_ID", &mut self.azure_client_id),
            ("AZURE_CLIENT_SECRET", &mut self.azure_client_secret),
            ("AZURE_AUTHORITY_HOST", &mut self.azure_authority),
            ("YC_IAM_TOKEN", &mut self.iam_token),
            ("VAULTPLATE_LOCKBOX_ENDPOINT", &mut self.lockbox_endpoint),
        ];
        for (key, slot) in overrides {
            if let Some(value) = get(key) {
                *slot = Some(value);
            }
        }
        Ok(self)
    }

    pub fn into_backend_config(self, kind: Option<BackendKind>) -> Result<BackendConfig> {
        let kind = kind
            .or(self.backend)
            .ok_or_else(|| {
                Error::config("no backend selected; set `backend` or VAULTPLATE_BACKEND")
            })?;

        match kind {
            BackendKind::VaultKv => {
                let address = required(self.vault_addr, "vault_addr", "VAULT_ADDR")?;
                let auth = match (self.vault_token, self.role_id, self.secret_id) {
                    (Some(token), _, _) => VaultAuth::Token(Secret::new(token)),
                    (None, Some(role_id), Some(secret_id)) => VaultAuth::AppRole {
                        role_id,
                        secret_id: Secret::new(secret_id),
                    },
                    _ => {
                        return Err(Error::config(
                            "vault-kv needs VAULT_TOKEN or both VAULTPLATE_ROLE_ID and \
                             VAULTPLATE_SECRET_ID",
                        ));
                    }
                };
                Ok(BackendConfig::VaultKv(VaultKvConfig {
                    address: address.trim_end_matches('/').to_string(),
                    auth,
                }))
            }
            BackendKind::AzureKeyVault => Ok(BackendConfig::AzureKeyVault(AzureConfig {
                tenant_id: required(self.azure_tenant_id, "azure_tenant_id", "AZURE_TENANT_ID")?,
                client_id: required(self.azure_client_id, "azure_client_id", "AZURE_CLIENT_ID")?,
                client_secret: Secret::new(required(
                    self.azure_client_secret,
                    "azure_client_secret",
                    "AZURE_CLIENT_SECRET",
                )?),
                authority: self
                    .azure_authority
                    .unwrap_or_else(|| DEFAULT_AZURE_AUTHORITY.to_string())
                    .trim_end_matches('/')
                    .to_string(),
            })),
            BackendKind::YandexLockbox => Ok(BackendConfig::YandexLockbox(LockboxConfig {
                iam_token: Secret::new(required(self.iam_token, "iam_token", "YC_IAM_TOKEN")?),
                endpoint: self
                    .lockbox_endpoint
                    .unwrap_or_else(|| DEFAULT_LOCKBOX_ENDPOINT.to_string())
                    .trim_end_matches('/')
                    .to_string(),
            })),
        }
    }
}

fn required(value: Option<String>, key: &str, env: &str) -> Result<String> {
    value.ok_or_else(|| Error::config(format!("missing `{key}` (or {env})")))
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("vaultplate").join("config.yaml"))
}

/// Load settings from `path` (or the default location) plus the environment.
pub fn load(path: Option<&Path>, kind: Option<BackendKind>) -> Result<BackendConfig> {
    let settings = match path {
        Some(path) => Settings::from_file(path)?,
        None => match default_config_path().filter(|p| p.exists()) {
            Some(path) => Settings::from_file(&path)?,
            None => Settings::default(),
        },
    };
    settings
        .with_env(|key| std::env::var(key).ok())?
        .into_backend_config(kind)
}
