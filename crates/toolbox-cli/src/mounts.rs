//! Bind-mount policy.
//!
//! Turns the `local:container` strings of a profile into validated
//! host/container path pairs. Every session mounts the caller's home
//! directory first; home volumes are anchored under it and additional
//! volumes are taken as given.

use crate::client::Mount;
use crate::config::EffectiveConfig;
use crate::identity::Identity;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised by the mount policy.
#[derive(Debug, Error)]
pub enum MountError {
    /// Spec is not of the form `local:container[:ro|rw]`.
    #[error("invalid volume '{spec}', expected local_path:container_path[:ro|rw]")]
    Malformed { spec: String },

    /// A path segment could escape its anchor.
    #[error("invalid volume path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// The home directory to mount does not exist.
    #[error("home directory {} does not exist", .path.display())]
    HomeMissing { path: PathBuf },
}

/// A validated bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub read_only: bool,
}

impl MountSpec {
    /// Engine representation of this mount.
    #[must_use]
    pub fn to_engine(&self) -> Mount {
        Mount::bind(
            self.host_path.to_string_lossy(),
            self.container_path.to_string_lossy(),
        )
        .with_read_only(self.read_only)
    }
}

/// Validates a home-relative path segment.
pub fn validate(segment: &str) -> Result<(), MountError> {
    let reason = if segment.contains("..") {
        "must not contain '..'"
    } else if segment.starts_with('/') {
        "must be relative to the home directory"
    } else if segment.starts_with("./") {
        "must not start with './'"
    } else {
        return Ok(());
    };

    Err(MountError::InvalidPath {
        path: segment.to_string(),
        reason,
    })
}

/// Resolves a `local:container` home volume, anchoring both sides in `home`.
pub fn resolve_home_volume(spec: &str, home: &Path) -> Result<MountSpec, MountError> {
    let (local, container, read_only) = split_spec(spec)?;
    validate(local)?;
    validate(container)?;

    Ok(MountSpec {
        host_path: home.join(local),
        container_path: home.join(container),
        read_only,
    })
}

/// Resolves a free-form `host:container` volume.
pub fn resolve_additional_volume(spec: &str) -> Result<MountSpec, MountError> {
    let (host, container, read_only) = split_spec(spec)?;
    for path in [host, container] {
        if path.contains("..") {
            return Err(MountError::InvalidPath {
                path: path.to_string(),
                reason: "must not contain '..'",
            });
        }
    }

    Ok(MountSpec {
        host_path: PathBuf::from(host),
        container_path: PathBuf::from(container),
        read_only,
    })
}

/// Builds the mount list of a session.
///
/// Order: the home directory, home volumes, additional volumes. A mount
/// whose container target is already taken is skipped.
pub fn build_mounts(
    config: &EffectiveConfig,
    identity: &Identity,
) -> Result<Vec<MountSpec>, MountError> {
    let home = &identity.home_dir;
    let mut mounts = vec![MountSpec {
        host_path: home.clone(),
        container_path: home.clone(),
        read_only: false,
    }];

    let home_volumes = config
        .home_volumes
        .iter()
        .map(|spec| resolve_home_volume(spec, home));
    let additional = config
        .additional_volumes
        .iter()
        .map(|spec| resolve_additional_volume(spec));

    for mount in home_volumes.chain(additional) {
        let mount = mount?;
        if mounts
            .iter()
            .any(|m| m.container_path == mount.container_path)
        {
            // TODO: reject duplicate targets once existing profiles are cleaned up.
            tracing::debug!(
                "Skipping mount {} -> {}: target already mounted",
                mount.host_path.display(),
                mount.container_path.display()
            );
            continue;
        }
        mounts.push(mount);
    }

    Ok(mounts)
}

/// Fails when the identity's home directory is missing.
pub fn ensure_home_exists(identity: &Identity) -> Result<(), MountError> {
    if identity.home_dir.is_dir() {
        Ok(())
    } else {
        Err(MountError::HomeMissing {
            path: identity.home_dir.clone(),
        })
    }
}

/// Splits `local:container[:mode]`; mode is `ro` or `rw` (the default).
fn split_spec(spec: &str) -> Result<(&str, &str, bool), MountError> {
    let malformed = || MountError::Malformed {
        spec: spec.to_string(),
    };

    let mut parts = spec.split(':').map(str::trim);
    let (Some(local), Some(container)) = (parts.next(), parts.next()) else {
        return Err(malformed());
    };
    let read_only = match parts.next() {
        None | Some("rw") => false,
        Some("ro") => true,
        Some(_) => return Err(malformed()),
    };
    if local.is_empty() || container.is_empty() || parts.next().is_some() {
        return Err(malformed());
    }
    Ok((local, container, read_only))
}
