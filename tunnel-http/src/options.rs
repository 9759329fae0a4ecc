//! Client configuration.
//!
//! [`ClientOptions`] controls how failed requests are rendered and which
//! per-request debug lines are written. It can be built in code or loaded
//! from a TOML file with `$VAR` / `${VAR}` environment expansion.
//!
//! # Example Configuration
//!
//! ```toml
//! log_with_prefix_url = false
//! log_with_search_params = false
//! max_response_length = 2000
//! log_finished = true
//! ```
//!
//! camelCase keys (`logWithPrefixUrl`, `maxResponseLength`, ...) are
//! accepted as aliases.
//!
//! # Environment Variables
//!
//! - `TUNNEL_HTTP_CONFIG` — Path to the configuration file (default: `tunnel-http.toml`)
//! - `TUNNEL_HTTP_ENV` / `APP_ENV` — `production` silences per-request debug lines

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::{
    CONFIG_ENV_VAR, DEFAULT_CONFIG_PATH, DEFAULT_MAX_RESPONSE_LENGTH, ENV_VAR, FALLBACK_ENV_VAR,
    PRODUCTION,
};
use crate::error::ConfigError;

/// Logging and redaction switches for an [`HttpClient`](crate::HttpClient).
///
/// All switches are independent of each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Enables every verbosity switch below. Not safe in production, as
    /// response headers end up in the logs.
    pub debug: bool,

    /// Log a line before each request is dispatched.
    #[serde(alias = "logStart")]
    pub log_start: bool,

    /// Log a line when a request finishes successfully.
    #[serde(alias = "logFinished")]
    pub log_finished: bool,

    /// Log outgoing request headers at TRACE level.
    #[serde(alias = "logRequest")]
    pub log_request: bool,

    /// Log response headers at TRACE level.
    #[serde(alias = "logResponse")]
    pub log_response: bool,

    /// Set to `false` to drop the prefix URL from logged and displayed URLs.
    #[serde(alias = "logWithPrefixUrl")]
    pub log_with_prefix_url: bool,

    /// Set to `false` to drop the query string from logged and displayed URLs.
    #[serde(alias = "logWithSearchParams")]
    pub log_with_search_params: bool,

    /// Max length of the rendered response body before it is truncated.
    #[serde(alias = "maxResponseLength")]
    pub max_response_length: usize,

    /// Forces production mode on or off. When unset, the environment decides.
    pub production: Option<bool>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            debug: false,
            log_start: false,
            log_finished: false,
            log_request: false,
            log_response: false,
            log_with_prefix_url: true,
            log_with_search_params: true,
            max_response_length: DEFAULT_MAX_RESPONSE_LENGTH,
            production: None,
        }
    }
}

impl ClientOptions {
    /// Loads options from the path in `TUNNEL_HTTP_CONFIG`, falling back to
    /// `tunnel-http.toml` in the current directory.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            std::env::var(CONFIG_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_owned());
        Self::load_from(path)
    }

    /// Loads options from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file exists but cannot be read or parsed.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = if path.exists() {
            std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: PathBuf::from(path),
                source,
            })?
        } else {
            String::new()
        };
        Self::from_toml(&expand_env_vars(&content, |name| std::env::var(name).ok()))
    }

    /// Parses options from a TOML document. No environment expansion is done.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on invalid TOML or mistyped values.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Whether per-request debug lines are suppressed.
    #[must_use]
    pub fn is_production(&self) -> bool {
        self.production.unwrap_or_else(production_from_env)
    }

    /// Whether a line is logged before dispatch.
    #[must_use]
    pub const fn logs_start(&self) -> bool {
        self.debug || self.log_start
    }

    /// Whether a line is logged after a successful response.
    #[must_use]
    pub const fn logs_finished(&self) -> bool {
        self.debug || self.log_finished
    }

    /// Whether request headers are logged.
    #[must_use]
    pub const fn logs_request(&self) -> bool {
        self.debug || self.log_request
    }

    /// Whether response headers are logged.
    #[must_use]
    pub const fn logs_response(&self) -> bool {
        self.debug || self.log_response
    }
}

/// Reads the process-wide production signal from `TUNNEL_HTTP_ENV`, then `APP_ENV`.
#[must_use]
pub fn production_from_env() -> bool {
    std::env::var(ENV_VAR)
        .or_else(|_| std::env::var(FALLBACK_ENV_VAR))
        .is_ok_and(|value| value.trim().eq_ignore_ascii_case(PRODUCTION))
}

/// Expands `$VAR` and `${VAR}` references using `lookup`.
///
/// Unresolved references, and a `${` without its closing brace, are copied
/// through unchanged.
fn expand_env_vars<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(dollar) = rest.find('$') {
        out.push_str(&rest[..dollar]);
        let after = &rest[dollar + 1..];

        // `consumed` counts the bytes after `$` that belong to the reference.
        let (name, consumed) = match after.strip_prefix('{') {
            Some(braced) => braced
                .find('}')
                .map_or(("", 0), |end| (&braced[..end], end + 2)),
            None => {
                let end = after
                    .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                    .unwrap_or(after.len());
                (&after[..end], end)
            }
        };

        let reference = &rest[dollar..=dollar + consumed];
        match (!name.is_empty()).then(|| lookup(name)).flatten() {
            Some(value) => out.push_str(&value),
            None => out.push_str(reference),
        }
        rest = &rest[dollar + 1 + consumed..];
    }

    out.push_str(rest);
    out
}
