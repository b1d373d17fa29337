//! Per-profile scratch directory under `~/.cache/admin-toolbox`.

use crate::identity::Identity;
use nix::fcntl::AtFlags;
use nix::unistd::{Gid, Uid, fchownat};
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

const CACHE_ROOT: &str = ".cache";
const CACHE_DIR: &str = "admin-toolbox";

#[derive(Debug, Error)]
pub enum WorkdirError {
    #[error("failed to create workdir {}: {source}", .path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A path component is a symlink or not a directory.
    #[error("refusing to use workdir {}: {reason}", .path.display())]
    Unsafe { path: PathBuf, reason: &'static str },

    #[error("failed to chown workdir {}: {source}", .path.display())]
    Chown {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
}

/// Session workdir, removed when dropped.
#[derive(Debug)]
pub struct Workdir {
    path: PathBuf,
}

impl Workdir {
    /// Creates `~/.cache/admin-toolbox/<profile>` (mode 0700) owned by
    /// `identity`.
    ///
    /// Every component below the home directory is created one at a time
    /// and must be a real directory. Symlinks are refused, never followed.
    pub fn create(identity: &Identity, profile: &str) -> Result<Self, WorkdirError> {
        let cache = identity.home_dir.join(CACHE_ROOT);
        if ensure_dir(&cache)? {
            chown_no_follow(&cache, identity)?;
        }

        let base = cache.join(CACHE_DIR);
        let path = base.join(profile);
        tracing::debug!("Workdir is {}", path.display());
        for dir in [&base, &path] {
            ensure_dir(dir)?;
            chown_no_follow(dir, identity)?;
        }

        Ok(Self { path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Creates `path` unless it is already a directory. Returns true if it
/// was created.
fn ensure_dir(path: &Path) -> Result<bool, WorkdirError> {
    let unsafe_path = |reason| WorkdirError::Unsafe {
        path: path.to_path_buf(),
        reason,
    };

    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => Err(unsafe_path("it is a symbolic link")),
        Ok(meta) if meta.is_dir() => Ok(false),
        Ok(_) => Err(unsafe_path("it is not a directory")),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            DirBuilder::new()
                .mode(0o700)
                .create(path)
                .map_err(|source| WorkdirError::Create {
                    path: path.to_path_buf(),
                    source,
                })?;
            Ok(true)
        }
        Err(source) => Err(WorkdirError::Create {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn chown_no_follow(path: &Path, identity: &Identity) -> Result<(), WorkdirError> {
    fchownat(
        None,
        path,
        Some(Uid::from_raw(identity.uid)),
        Some(Gid::from_raw(identity.gid)),
        AtFlags::AT_SYMLINK_NOFOLLOW,
    )
    .map_err(|source| WorkdirError::Chown {
        path: path.to_path_buf(),
        source,
    })
}

impl Drop for Workdir {
    fn drop(&mut self) {
        tracing::debug!("Cleanup workdir {}", self.path.display());
        match fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove workdir {}: {}", self.path.display(), e),
        }
    }
}
