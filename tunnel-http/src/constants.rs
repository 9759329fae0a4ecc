//! Constants shared by the trust injector and the error enricher.

/// Reserved top-level label for local development hosts.
///
/// Requests whose hostname ends with this suffix get the local CA trust.
pub const LOCAL_DEV_SUFFIX: &str = ".test";

/// Replacement shown instead of a URL password.
pub const REDACTED: &str = "[redacted]";

/// Default cap on the pretty-printed response body in error messages.
pub const DEFAULT_MAX_RESPONSE_LENGTH: usize = 10_000;

/// Environment variable naming the deployment environment.
pub const ENV_VAR: &str = "TUNNEL_HTTP_ENV";

/// Fallback environment variable consulted when [`ENV_VAR`] is unset.
pub const FALLBACK_ENV_VAR: &str = "APP_ENV";

/// Value of [`ENV_VAR`] that switches off per-request debug lines.
pub const PRODUCTION: &str = "production";

/// Environment variable pointing at the configuration file.
pub const CONFIG_ENV_VAR: &str = "TUNNEL_HTTP_CONFIG";

/// Configuration file read when [`CONFIG_ENV_VAR`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "tunnel-http.toml";
