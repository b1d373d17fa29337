//! Create-container request construction.

use crate::client::{CreateContainerRequest, HostConfig};
use crate::config::EffectiveConfig;
use crate::identity::Identity;
use crate::mounts::{self, MountError};
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::path::Path;

/// Label marking containers created by this tool.
pub const LABEL_OWNER: &str = "admin_toolbox";

/// Label carrying the uid a session was created for.
pub const LABEL_FOR_UID: &str = "for_uid";

/// Host variables never copied into a session.
const ALWAYS_EXCLUDED_ENV: [&str; 2] = ["SHLVL", "SHELLOPTS"];

/// Builds the create request from the host's current environment.
pub fn build(
    config: &EffectiveConfig,
    identity: &Identity,
    cwd: &Path,
) -> Result<CreateContainerRequest, MountError> {
    build_with_env(config, identity, cwd, std::env::vars())
}

/// Builds the create request with an explicit host environment.
pub fn build_with_env(
    config: &EffectiveConfig,
    identity: &Identity,
    cwd: &Path,
    host_env: impl IntoIterator<Item = (String, String)>,
) -> Result<CreateContainerRequest, MountError> {
    let mounts = mounts::build_mounts(config, identity)?
        .iter()
        .map(mounts::MountSpec::to_engine)
        .collect();

    let working_dir = if cwd.starts_with(&identity.home_dir) {
        cwd
    } else {
        identity.home_dir.as_path()
    };

    let mut env = Vec::new();
    if config.inherit_env {
        env.extend(
            host_env
                .into_iter()
                .filter(|(key, _)| {
                    !ALWAYS_EXCLUDED_ENV.contains(&key.as_str())
                        && !config.inherit_env_exclude.iter().any(|e| e == key)
                })
                .map(|(key, value)| format!("{key}={value}")),
        );
    }
    // Appended last so they win on duplicate keys.
    env.extend(config.user_env.iter().cloned());

    Ok(CreateContainerRequest {
        image: config.image.clone(),
        cmd: non_empty(config.user_cmd.as_ref()),
        entrypoint: non_empty(config.user_entrypoint.as_ref()),
        env,
        working_dir: Some(working_dir.to_string_lossy().into_owned()),
        user: Some(identity.user_spec()),
        labels: labels(identity),
        tty: true,
        open_stdin: true,
        attach_stdin: true,
        attach_stdout: true,
        attach_stderr: true,
        host_config: Some(HostConfig {
            mounts,
            auto_remove: false,
        }),
    })
}

/// Labels attached to every session container.
#[must_use]
pub fn labels(identity: &Identity) -> HashMap<String, String> {
    HashMap::from([
        (LABEL_OWNER.to_string(), "true".to_string()),
        (LABEL_FOR_UID.to_string(), identity.uid.to_string()),
    ])
}

/// Unique container name for a session started at `now`.
///
/// Format: `admbox-<user>-<profile>-<HHMMSS>-<DDMMYYYY>-<pid>`.
#[must_use]
pub fn container_name(username: &str, profile: &str, now: DateTime<Local>, pid: u32) -> String {
    let raw = format!(
        "admbox-{username}-{profile}-{}-{pid}",
        now.format("%H%M%S-%d%m%Y")
    );

    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn non_empty(values: Option<&Vec<String>>) -> Option<Vec<String>> {
    values.filter(|v| !v.is_empty()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn identity() -> Identity {
        Identity {
            uid: 1000,
            gid: 1001,
            username: "alice".to_string(),
            home_dir: PathBuf::from("/home/alice"),
        }
    }

    fn config() -> EffectiveConfig {
        EffectiveConfig {
            name: "dev".to_string(),
            image: "alpine:3.20".to_string(),
            additional_volumes: vec!["/srv:/srv".to_string()],
            inherit_env: false,
            inherit_env_exclude: Vec::new(),
            user_entrypoint: None,
            user_cmd: None,
            user_env: Vec::new(),
            home_volumes: Vec::new(),
            ssh_agent: None,
            conf_path: PathBuf::from("/tmp/dev.yaml"),
            user_conf_path: None,
        }
    }

    fn host_env() -> Vec<(String, String)> {
        [
            ("PATH", "/usr/bin"),
            ("SHLVL", "2"),
            ("SHELLOPTS", "braceexpand"),
            ("SSH_AUTH_SOCK", "/tmp/agent"),
            ("EDITOR", "vi"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_build_basic_request() {
        let request =
            build_with_env(&config(), &identity(), Path::new("/home/alice/src"), host_env())
                .unwrap();

        assert_eq!(request.image, "alpine:3.20");
        assert_eq!(request.user.as_deref(), Some("1000:1001"));
        assert_eq!(request.working_dir.as_deref(), Some("/home/alice/src"));
        assert!(request.cmd.is_none());
        assert!(request.entrypoint.is_none());
        assert!(request.env.is_empty());
        assert!(request.tty && request.open_stdin);
        assert!(request.attach_stdin && request.attach_stdout && request.attach_stderr);
        assert_eq!(request.labels.get(LABEL_OWNER).map(String::as_str), Some("true"));
        assert_eq!(request.labels.get(LABEL_FOR_UID).map(String::as_str), Some("1000"));

        let host_config = request.host_config.unwrap();
        assert!(!host_config.auto_remove);
        assert_eq!(host_config.mounts.len(), 2);
        assert_eq!(host_config.mounts[0].source, "/home/alice");
        assert_eq!(host_config.mounts[1].target, "/srv");
    }

    #[test]
    fn test_working_dir_outside_home_falls_back() {
        for cwd in ["/etc", "/home/alice2/x", "/"] {
            let request =
                build_with_env(&config(), &identity(), Path::new(cwd), Vec::new()).unwrap();
            assert_eq!(request.working_dir.as_deref(), Some("/home/alice"), "{cwd}");
        }
    }

    #[test]
    fn test_inherited_env_filtering_and_precedence() {
        let mut config = config();
        config.inherit_env = true;
        config.inherit_env_exclude = vec!["SSH_AUTH_SOCK".to_string()];
        config.user_env = vec!["EDITOR=vim".to_string()];

        let request =
            build_with_env(&config, &identity(), Path::new("/home/alice"), host_env()).unwrap();

        assert_eq!(
            request.env,
            vec!["PATH=/usr/bin", "EDITOR=vi", "EDITOR=vim"]
        );
    }

    #[test]
    fn test_user_env_without_inheritance() {
        let mut config = config();
        config.user_env = vec!["A=1".to_string()];

        let request =
            build_with_env(&config, &identity(), Path::new("/home/alice"), host_env()).unwrap();
        assert_eq!(request.env, vec!["A=1"]);
    }

    #[test]
    fn test_empty_overrides_keep_image_defaults() {
        let mut config = config();
        config.user_cmd = Some(Vec::new());
        config.user_entrypoint = Some(vec!["/bin/sh".to_string(), "-c".to_string()]);

        let request = build_with_env(&config, &identity(), Path::new("/"), Vec::new()).unwrap();
        assert!(request.cmd.is_none());
        assert_eq!(
            request.entrypoint,
            Some(vec!["/bin/sh".to_string(), "-c".to_string()])
        );
    }

    #[test]
    fn test_invalid_mount_fails_build() {
        let mut config = config();
        config.home_volumes = vec!["/etc:etc".to_string()];
        assert!(build_with_env(&config, &identity(), Path::new("/"), Vec::new()).is_err());
    }

    #[test]
    fn test_container_name_format() {
        let now = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 1).unwrap();
        assert_eq!(
            container_name("alice", "dev", now, 4242),
            "admbox-alice-dev-090501-07032024-4242"
        );
        assert_eq!(
            container_name("bob smith", "ops@prod", now, 1),
            "admbox-bob-smith-ops-prod-090501-07032024-1"
        );
    }
}
