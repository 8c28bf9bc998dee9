//! Hatchery - a multi-tenant host for uploaded application bundles
//!
//! This library provides a single-host application server that:
//! - Accepts application bundles (config + file tree, optional TLS material)
//!   over a framed-JSON admin socket and installs them as versioned sites
//! - Routes public HTTP(S) traffic by Host header and path prefix, newest
//!   version first
//! - Spawns each site's backend process lazily on the first request, with a
//!   single-flight launch and a warm-up dial window
//! - Bleeds old backends out when a new version arrives or the backend
//!   misbehaves: in-flight requests finish, then the child is killed
//! - Serves bundles with no command as static file trees
//! - Terminates TLS with SNI against uploaded certificates, optionally
//!   backed by an ACME (Let's Encrypt) manager

pub mod acme;
pub mod admin;
pub mod config;
pub mod error;
pub mod process;
pub mod proxy;
pub mod registry;
pub mod static_files;
pub mod tls;
pub mod wire;
