//! Re-shapes backend results into ordered entry lists for templating.

use crate::backend::{Backend, Outcome, SecretMap, StorePath};
use crate::error::Result;

/// One retrieved value and the key it was looked up by: a version id for
/// secret history, a secret name for container reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: String,
}

/// Every map entry in key order; nothing is merged or dropped.
pub fn entries(map: SecretMap) -> Vec<Entry> {
    map.into_iter()
        .map(|(key, value)| Entry { key, value })
        .collect()
}

pub struct Aggregator<'a> {
    backend: &'a dyn Backend,
}

impl<'a> Aggregator<'a> {
    pub fn new(backend: &'a dyn Backend) -> Self {
        Self { backend }
    }

    /// One secret, every version, keyed by version id.
    pub fn history(&self, path: &StorePath, secret: &str) -> Result<Outcome<Vec<Entry>>> {
        Ok(self.backend.get_secret(path, secret, None)?.map(entries))
    }

    /// Every secret in `path` at its current value.
    pub fn latest(&self, path: &StorePath) -> Result<Outcome<Vec<Entry>>> {
        Ok(self
            .backend
            .get_all_secrets_in_path(path, None)?
            .map(entries))
    }

    /// Every secret in `path` resolved at `version`; an empty version
    /// defers to [`Aggregator::latest`].
    pub fn at_version(&self, path: &StorePath, version: &str) -> Result<Outcome<Vec<Entry>>> {
        if version.is_empty() {
            return self.latest(path);
        }
        Ok(self.backend.get_secrets(path, version, None)?.map(entries))
    }
}
