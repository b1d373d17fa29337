//! admin-toolbox library.
//!
//! Launches one ephemeral, interactive container per invocation: the
//! caller's home is bind-mounted, the container runs as the caller's
//! uid:gid, and the container is force-removed when the session ends.
//!
//! The pieces are exposed for the binary and for tests:
//!
//! - [`config`] resolves profiles into an [`config::EffectiveConfig`]
//! - [`mounts`] and [`container_spec`] turn it into a create request
//! - [`session`] drives the container from creation to removal
//! - [`lifecycle`] resolves the exit code across engine API versions
//! - [`client`] talks to the engine over its Unix socket

pub mod client;
pub mod config;
pub mod container_spec;
pub mod engine;
pub mod identity;
pub mod lifecycle;
pub mod mounts;
pub mod session;
pub mod terminal;
pub mod workdir;
