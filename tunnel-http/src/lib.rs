#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Local-trust TLS injection and readable request errors for `reqwest`.
//!
//! Two pieces are layered onto a [`reqwest_middleware`] client:
//!
//! - a [`TrustInjector`] middleware that, for hosts under `.test`, resolves
//!   a local CA bundle and sends the request through a client trusting it;
//! - an [`ErrorEnricher`] hook that rewrites failed requests into
//!   `"{status} {method} {url}"` plus the truncated response body, splices
//!   the caller's stack, and hides verbose fields.
//!
//! [`HttpClient`] wires both up.
//!
//! # Modules
//!
//! - [`client`] — [`HttpClient`], its builder and request builder
//! - [`constants`] — Trigger suffix, defaults, environment variable names
//! - [`context`] — Per-request [`RequestContext`] and [`CapturedError`]
//! - [`enrich`] — The error enricher and its helpers
//! - [`error`] — [`RequestError`], [`ResolutionError`], [`ConfigError`]
//! - [`hooks`] — The [`ErrorHook`] trait and [`ErrorHooks`] chain
//! - [`options`] — [`ClientOptions`] and TOML loading
//! - [`trust`] — Locator/provider traits, [`TrustInjector`], [`AgentDispatch`]
//!
//! # Feature Flags
//!
//! - `mkcert` (default) - Default collaborators backed by `tunnel-mkcert`
//! - `telemetry` - Tracing spans around trust resolution

pub mod client;
pub mod constants;
pub mod context;
pub mod enrich;
pub mod error;
pub mod hooks;
pub mod options;
pub mod trust;

pub use client::{HttpClient, HttpClientBuilder, RequestBuilder};
pub use context::{CapturedError, RequestContext};
pub use enrich::{ErrorEnricher, StackSpliceRules};
pub use error::{
    ConfigError, RequestError, RequestErrorKind, RequestOptions, ResolutionError, ResponseBody,
    ResponseSnapshot, Timings,
};
pub use hooks::{ErrorHook, ErrorHooks};
pub use options::ClientOptions;
#[cfg(feature = "mkcert")]
pub use trust::{MonorepoLocator, PathLocator};
pub use trust::{
    AgentBuilderFn, AgentDispatch, CaBundleProvider, ExecutableLocator, HttpsAgent,
    LocalCaBundle, LocatedExecutable, TrustInjector,
};
