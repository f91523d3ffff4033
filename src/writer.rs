//! Version rotation: disable the given version, then write the new value as
//! a fresh version of the same secret. Stores without version history get a
//! plain overwrite.

use crate::backend::{Backend, Outcome, StorePath};
use crate::error::Result;
use tracing::{info, warn};

/// What to do when disabling the previous version fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RotationPolicy {
    /// Abort; the new version is not created.
    #[default]
    Strict,
    /// Create the new version anyway and report the failed disable. The old
    /// version stays enabled alongside the new one.
    BestEffort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rotation {
    /// The old version was disabled and a new one created.
    Rotated { disabled: String },
    /// Plain write: an overwrite on flat stores, a new version that leaves
    /// the others enabled on versioned ones.
    Written,
    /// Disabling failed under `BestEffort`; the new version was still created.
    CreatedWithoutDisable { version: String, error: String },
}

pub fn rotate(
    backend: &mut dyn Backend,
    path: &StorePath,
    secret: &str,
    version: &str,
    value: &str,
    policy: RotationPolicy,
) -> Result<Outcome<Rotation>> {
    if version.is_empty() {
        return write_plain(backend, path, secret, value);
    }

    let rotation = match backend.disable_version(path, secret, version) {
        Ok(Outcome::Unsupported(_)) => return write_plain(backend, path, secret, value),
        Ok(Outcome::Supported(())) => Rotation::Rotated {
            disabled: version.to_string(),
        },
        Err(err) => match policy {
            RotationPolicy::Strict => return Err(err),
            RotationPolicy::BestEffort => {
                warn!(
                    backend = %backend.kind(),
                    path,
                    secret,
                    version,
                    error = %err,
                    "disable failed; creating the new version anyway"
                );
                Rotation::CreatedWithoutDisable {
                    version: version.to_string(),
                    error: err.to_string(),
                }
            }
        },
    };

    let created = backend.set_individual_secret(path, secret, "", value)?;
    info!(backend = %backend.kind(), path, secret, "rotated secret");
    Ok(created.map(|()| rotation))
}

fn write_plain(
    backend: &mut dyn Backend,
    path: &StorePath,
    secret: &str,
    value: &str,
) -> Result<Outcome<Rotation>> {
    Ok(backend
        .set_individual_secret(path, secret, "", value)?
        .map(|()| Rotation::Written))
}
