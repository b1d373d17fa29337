//! Invoking user identity.

use nix::unistd::{Uid, User, getuid};
use std::path::PathBuf;
use thiserror::Error;

/// Errors resolving the invoking identity.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Password database lookup failed.
    #[error("failed to look up uid {uid}: {source}")]
    Lookup {
        uid: u32,
        #[source]
        source: nix::Error,
    },

    /// No account exists for the uid.
    #[error("no user with uid {0}")]
    UnknownUid(u32),

    /// Only the superuser may act on behalf of another uid.
    #[error("--uid is only honoured when invoked by root")]
    ForeignUid,
}

/// Identity of the invoking user.
///
/// Resolved once per invocation; the container runs as this uid:gid with
/// this home directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub username: String,
    pub home_dir: PathBuf,
}

impl Identity {
    /// Resolves the real (not effective) user of this process.
    pub fn current() -> Result<Self, IdentityError> {
        Self::for_uid(getuid().as_raw())
    }

    /// Resolves the account owning `uid`.
    pub fn for_uid(uid: u32) -> Result<Self, IdentityError> {
        let user = User::from_uid(Uid::from_raw(uid))
            .map_err(|source| IdentityError::Lookup { uid, source })?
            .ok_or(IdentityError::UnknownUid(uid))?;

        Ok(Self {
            uid,
            gid: user.gid.as_raw(),
            username: user.name,
            home_dir: user.dir,
        })
    }

    /// Resolves the identity a session runs as.
    ///
    /// An explicit uid is accepted only from the superuser (sudo usage).
    pub fn resolve(requested_uid: Option<u32>) -> Result<Self, IdentityError> {
        match requested_uid {
            Some(uid) if getuid().is_root() => Self::for_uid(uid),
            Some(uid) if uid == getuid().as_raw() => Self::current(),
            Some(_) => Err(IdentityError::ForeignUid),
            None => Self::current(),
        }
    }

    /// `uid:gid` as expected by the engine's `User` field.
    #[must_use]
    pub fn user_spec(&self) -> String {
        format!("{}:{}", self.uid, self.gid)
    }
}

/// Returns true when the process runs with superuser privileges
/// (e.g. a setuid-root binary).
#[must_use]
pub fn is_privileged() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_identity_matches_process() {
        // Sandboxed CI users may have no passwd entry.
        match Identity::current() {
            Ok(identity) => {
                assert_eq!(identity.uid, getuid().as_raw());
                assert!(!identity.username.is_empty());
            }
            Err(IdentityError::UnknownUid(_)) => {}
            Err(e) => panic!("unexpected lookup failure: {e}"),
        }
    }

    #[test]
    fn test_user_spec() {
        let identity = Identity {
            uid: 1000,
            gid: 100,
            username: "alice".to_string(),
            home_dir: PathBuf::from("/home/alice"),
        };
        assert_eq!(identity.user_spec(), "1000:100");
    }
}
