#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Default certificate collaborators for `tunnel-http`.
//!
//! This crate locates an installed [`mkcert`](https://github.com/FiloSottile/mkcert)
//! and turns its local certificate authority into a PEM bundle that an HTTP
//! client can trust. It does not manage trust stores or install `mkcert`.
//!
//! # Modules
//!
//! - [`locate`] — `PATH` search and monorepo-root discovery
//! - [`certs`] — `{ca, cert, key}` resolution through `mkcert`
//! - [`error`] — [`MkcertError`]
//!
//! # Feature Flags
//!
//! - `telemetry` - Enables tracing of executable discovery and leaf generation

pub mod certs;
pub mod error;
pub mod locate;

pub use certs::{Mkcert, MkcertBundle};
pub use error::MkcertError;
pub use locate::{find_executable, find_executable_in, find_monorepo_root};

/// Name of the `mkcert` executable.
pub const MKCERT_BIN: &str = "mkcert";
