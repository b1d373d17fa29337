//! Configuration management.
//!
//! Two kinds of configuration exist:
//!
//! 1. Application [`Settings`] (where default profiles live, which engine
//!    socket to use, session timings), layered from built-in defaults and
//!    `ADMIN_TOOLBOX_*` environment variables.
//! 2. YAML profiles describing the session itself, resolved into an
//!    [`EffectiveConfig`] by [`resolve`].
//!
//! ## Example profile
//!
//! ```yaml
//! image: registry.local/ops/toolbox:2024.06
//! additional_volumes:
//!   - /srv/shared:/srv/shared
//! inherit_env: true
//! inherit_env_exclude: [SSH_AUTH_SOCK]
//! user_config:
//!   cmd: [bash, -l]
//!   env: [EDITOR=vim]
//!   ssh_agent:
//!     host: bastion.local
//!     key_path: .ssh/id_ed25519
//!   home_volumes:
//!     - .kube:.kube
//! ```
//!
//! For a privileged (setuid) invocation the base profile comes from the
//! default profile directory and the user's file may only contribute the
//! `user_config` subset.

use crate::identity::Identity;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Directory holding the default (root) profiles.
pub const DEFAULT_CONF_DIR: &str = "/opt/admin-toolbox/defaults";

/// Prefix of environment variables overriding [`Settings`].
pub const ENV_PREFIX: &str = "ADMIN_TOOLBOX_";

/// Keys a privileged invocation never accepts from the user's file.
const RESTRICTED_KEYS: [&str; 4] = [
    "image",
    "additional_volumes",
    "inherit_env",
    "inherit_env_exclude",
];

/// Errors that can occur while resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The root profile name is a path rather than a file name.
    #[error("profile must be a file name, not a path: {0}")]
    InvalidProfileName(String),

    /// Privileged invocations require a default profile.
    #[error(
        "no default profile (-p) given; a file name from {} is required in privileged mode",
        .dir.display()
    )]
    MissingProfile { dir: PathBuf },

    /// A profile file could not be read.
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A profile file is not valid YAML for the expected schema.
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<figment::Error>,
    },

    /// The resolved profile names no image.
    #[error("'image' is empty in {}", .path.display())]
    MissingImage { path: PathBuf },

    /// A privileged invocation was pointed at a file the user does not own.
    #[error("{} is owned by uid {owner}, not by the invoking user", .path.display())]
    ForeignProfile { path: PathBuf, owner: u32 },

    /// Application settings could not be loaded.
    #[error("invalid settings: {0}")]
    Settings(#[source] Box<figment::Error>),
}

// =============================================================================
// Application settings
// =============================================================================

/// Application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding the default profiles.
    pub default_conf_dir: PathBuf,
    /// Engine socket path (falls back to `DOCKER_HOST` / the default socket).
    pub socket: Option<PathBuf>,
    /// Interval between terminal size samples.
    pub resize_interval_ms: u64,
    /// How long a failed start waits for the container to settle.
    pub start_failure_grace_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_conf_dir: PathBuf::from(DEFAULT_CONF_DIR),
            socket: None,
            resize_interval_ms: 250,
            start_failure_grace_ms: 5000,
        }
    }
}

impl Settings {
    /// Loads settings from defaults and `ADMIN_TOOLBOX_*` variables.
    ///
    /// A privileged invocation ignores the environment so the caller cannot
    /// redirect the default profile directory.
    pub fn load(privileged: bool) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if !privileged {
            figment = figment.merge(Env::prefixed(ENV_PREFIX));
        }
        figment
            .extract()
            .map_err(|e| ConfigError::Settings(Box::new(e)))
    }

    #[must_use]
    pub fn resize_interval(&self) -> Duration {
        Duration::from_millis(self.resize_interval_ms.max(10))
    }

    #[must_use]
    pub fn start_failure_grace(&self) -> Duration {
        Duration::from_millis(self.start_failure_grace_ms)
    }
}

// =============================================================================
// Profiles
// =============================================================================

/// SSH agent forwarding settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshAgent {
    pub host: String,
    pub key_path: String,
}

impl SshAgent {
    /// Non-empty fields of `overrides` replace ours.
    #[must_use]
    fn merged_with(self, overrides: Self) -> Self {
        Self {
            host: non_empty_or(overrides.host, self.host),
            key_path: non_empty_or(overrides.key_path, self.key_path),
        }
    }
}

/// User-controllable subset of a profile.
///
/// `None` means "absent from the file", which matters for merging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSettings {
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub env: Option<Vec<String>>,
    pub ssh_agent: Option<SshAgent>,
    pub home_volumes: Option<Vec<String>>,
}

impl UserSettings {
    /// Applies `overrides` on top of `self`.
    ///
    /// Lists present in `overrides` replace ours wholesale; the SSH agent
    /// block is merged field by field.
    #[must_use]
    pub fn merged_with(self, overrides: Self) -> Self {
        let ssh_agent = match (self.ssh_agent, overrides.ssh_agent) {
            (Some(base), Some(user)) => Some(base.merged_with(user)),
            (base, user) => user.or(base),
        };

        Self {
            cmd: overrides.cmd.or(self.cmd),
            entrypoint: overrides.entrypoint.or(self.entrypoint),
            env: overrides.env.or(self.env),
            ssh_agent,
            home_volumes: overrides.home_volumes.or(self.home_volumes),
        }
    }
}

/// A complete profile file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileFile {
    pub image: Option<String>,
    pub additional_volumes: Option<Vec<String>>,
    pub inherit_env: Option<bool>,
    pub inherit_env_exclude: Option<Vec<String>>,
    pub user_config: Option<UserSettings>,
}

/// Fully resolved session parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveConfig {
    /// Profile name (file stem of the user's profile).
    pub name: String,
    pub image: String,
    /// Free-form `host:container` volumes.
    pub additional_volumes: Vec<String>,
    pub inherit_env: bool,
    pub inherit_env_exclude: Vec<String>,
    pub user_entrypoint: Option<Vec<String>>,
    pub user_cmd: Option<Vec<String>>,
    pub user_env: Vec<String>,
    /// `local:container` volumes, both relative to the home directory.
    pub home_volumes: Vec<String>,
    pub ssh_agent: Option<SshAgent>,
    /// File the base configuration came from.
    pub conf_path: PathBuf,
    /// User file merged on top, in privileged mode.
    pub user_conf_path: Option<PathBuf>,
}

impl EffectiveConfig {
    fn from_parts(
        name: String,
        base: ProfileFile,
        user: UserSettings,
        conf_path: PathBuf,
        user_conf_path: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let image = base.image.unwrap_or_default();
        if image.trim().is_empty() {
            return Err(ConfigError::MissingImage { path: conf_path });
        }

        Ok(Self {
            name,
            image,
            additional_volumes: base.additional_volumes.unwrap_or_default(),
            inherit_env: base.inherit_env.unwrap_or(false),
            inherit_env_exclude: base.inherit_env_exclude.unwrap_or_default(),
            user_entrypoint: user.entrypoint,
            user_cmd: user.cmd,
            user_env: user.env.unwrap_or_default(),
            home_volumes: user.home_volumes.unwrap_or_default(),
            ssh_agent: user.ssh_agent,
            conf_path,
            user_conf_path,
        })
    }
}

/// Resolves the effective configuration of a session.
///
/// * `root_profile` names a file inside `default_dir`; it must not be a path.
/// * Unprivileged callers get exactly what their own file says.
/// * Privileged callers must name a root profile; their own file then only
///   contributes [`UserSettings`], merged with override semantics.
pub fn resolve(
    default_dir: &Path,
    root_profile: Option<&str>,
    user_profile: &Path,
    identity: &Identity,
    privileged: bool,
) -> Result<EffectiveConfig, ConfigError> {
    let root_profile = root_profile.filter(|p| !p.is_empty());
    if let Some(profile) = root_profile {
        validate_profile_name(profile)?;
    }

    let name = profile_name(user_profile);

    if !privileged {
        if root_profile.is_some() {
            tracing::debug!("Ignoring default profile: not running privileged");
        }
        tracing::debug!("Load config without default profiles");
        let mut profile: ProfileFile = extract(user_profile, &load(user_profile)?)?;
        let user = profile.user_config.take().unwrap_or_default();
        return EffectiveConfig::from_parts(name, profile, user, user_profile.to_path_buf(), None);
    }

    let Some(root_profile) = root_profile else {
        return Err(ConfigError::MissingProfile {
            dir: default_dir.to_path_buf(),
        });
    };

    tracing::debug!("Load config from default profile {}", root_profile);

    let default_path = default_dir.join(root_profile);
    let mut base: ProfileFile = extract(&default_path, &load(&default_path)?)?;
    let base_user = base.user_config.take().unwrap_or_default();

    ensure_owned_by(user_profile, identity)?;
    let user = load_user_settings(user_profile)?;

    EffectiveConfig::from_parts(
        name,
        base,
        base_user.merged_with(user),
        default_path,
        Some(user_profile.to_path_buf()),
    )
}

/// Rejects profile names that are paths.
pub fn validate_profile_name(name: &str) -> Result<(), ConfigError> {
    if name.contains("..") || name.contains('/') {
        return Err(ConfigError::InvalidProfileName(name.to_string()));
    }
    Ok(())
}

/// Reads the user-settings subset of a user's file.
///
/// Settings may sit under `user_config:` or at the top level.
fn load_user_settings(path: &Path) -> Result<UserSettings, ConfigError> {
    let figment = load(path)?;

    for key in RESTRICTED_KEYS {
        if figment.contains(key) {
            tracing::warn!(
                "Ignoring '{}' from {}: only user settings may be overridden",
                key,
                path.display()
            );
        }
    }

    if figment.contains("user_config") {
        figment
            .extract_inner("user_config")
            .map_err(|e| parse_error(path, e))
    } else {
        extract(path, &figment)
    }
}

/// Reads a YAML file into a figment. Empty files yield an empty figment.
fn load(path: &Path) -> Result<Figment, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    if contents.trim().is_empty() {
        return Ok(Figment::new());
    }
    Ok(Figment::from(Yaml::string(&contents)))
}

fn extract<T: serde::de::DeserializeOwned>(
    path: &Path,
    figment: &Figment,
) -> Result<T, ConfigError> {
    figment.extract().map_err(|e| parse_error(path, e))
}

fn parse_error(path: &Path, source: figment::Error) -> ConfigError {
    ConfigError::Parse {
        path: path.to_path_buf(),
        source: Box::new(source),
    }
}

/// A privileged process must not read arbitrary files on a user's behalf.
fn ensure_owned_by(path: &Path, identity: &Identity) -> Result<(), ConfigError> {
    let metadata = fs::metadata(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let owner = metadata.uid();
    if owner != identity.uid && owner != 0 {
        return Err(ConfigError::ForeignProfile {
            path: path.to_path_buf(),
            owner,
        });
    }
    Ok(())
}

fn profile_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "default".to_string())
}

fn non_empty_or(value: String, fallback: String) -> String {
    if value.is_empty() { fallback } else { value }
}
