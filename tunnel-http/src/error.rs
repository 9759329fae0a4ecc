//! Error types for the client layer.
//!
//! [`RequestError`] is the single error surfaced by [`HttpClient`](crate::HttpClient).
//! Error hooks receive it by value and hand the same value back, so its
//! [`RequestErrorKind`] and [`source`](std::error::Error::source) chain stay
//! intact while its message and stack are rewritten.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::Method;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use serde_json::Value;
use url::Url;

use crate::context::RequestContext;

/// Errors raised while loading [`ClientOptions`](crate::ClientOptions).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file exists but could not be read.
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        /// Path of the configuration file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration is not valid TOML or has mistyped values.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Failures while resolving local CA trust for a `.test` request.
///
/// These are not caught by the trust injector; they fail the request.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ResolutionError {
    /// The local CA executable is not installed.
    #[error("local CA executable `{name}` not found")]
    ExecutableNotFound {
        /// Executable name or expected path.
        name: String,
    },

    /// The monorepo root the executable is scoped to could not be found.
    #[error("monorepo root not found above {}", .start.display())]
    MonorepoRootNotFound {
        /// Directory the upward search started from.
        start: PathBuf,
    },

    /// The certificate collaborator failed.
    #[error("failed to resolve local CA bundle: {0}")]
    Provider(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The bundle was resolved but could not be turned into a transport agent.
    #[error("failed to build transport agent: {0}")]
    Agent(#[source] reqwest::Error),
}

#[cfg(feature = "mkcert")]
impl From<tunnel_mkcert::MkcertError> for ResolutionError {
    fn from(err: tunnel_mkcert::MkcertError) -> Self {
        match err {
            tunnel_mkcert::MkcertError::NotFound { name } => Self::ExecutableNotFound { name },
            tunnel_mkcert::MkcertError::MonorepoRootNotFound { start } => {
                Self::MonorepoRootNotFound { start }
            }
            other => Self::Provider(Box::new(other)),
        }
    }
}

/// Classification of a [`RequestError`], fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RequestErrorKind {
    /// The server answered with an error status.
    Http,
    /// Connection, TLS handshake, or body transfer failed.
    Transport,
    /// The request timed out.
    Timeout,
    /// Local CA trust could not be resolved for a `.test` host.
    Resolution,
    /// The target URL could not be parsed.
    InvalidUrl,
    /// The request could not be assembled (bad header, body encoding).
    Build,
    /// A user middleware failed.
    Middleware,
    /// The response body could not be decoded.
    Parse,
}

impl RequestErrorKind {
    /// Name used as the header line of the error's stack.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Http => "HttpError",
            Self::Transport => "TransportError",
            Self::Timeout => "TimeoutError",
            Self::Resolution => "ResolutionError",
            Self::InvalidUrl => "InvalidUrlError",
            Self::Build => "BuildError",
            Self::Middleware => "MiddlewareError",
            Self::Parse => "ParseError",
        }
    }
}

impl fmt::Display for RequestErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Snapshot of the request a [`RequestError`] belongs to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    /// HTTP method.
    #[serde(serialize_with = "serialize_method")]
    pub method: Method,
    /// Resolved target URL, absent if it failed to parse.
    pub url: Option<Url>,
    /// Prefix joined in front of relative inputs.
    pub prefix_url: Option<String>,
    /// Caller-supplied context bag.
    pub context: Option<RequestContext>,
}

impl RequestOptions {
    /// Creates a snapshot with no URL, prefix, or context.
    #[must_use]
    pub const fn new(method: Method) -> Self {
        Self {
            method,
            url: None,
            prefix_url: None,
            context: None,
        }
    }

    /// Sets the target URL.
    #[must_use]
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// Sets the prefix URL.
    #[must_use]
    pub fn with_prefix_url(mut self, prefix_url: impl Into<String>) -> Self {
        self.prefix_url = Some(prefix_url.into());
        self
    }

    /// Sets the context bag.
    #[must_use]
    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = Some(context);
        self
    }
}

fn serialize_method<S: Serializer>(method: &Method, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(method.as_str())
}

/// When an attempt started and how long it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timings {
    /// Milliseconds since the Unix epoch at dispatch.
    pub start: u64,
    /// Time until the failure was observed.
    pub elapsed: Duration,
}

/// Decoded body of an error response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponseBody {
    /// The body parsed as JSON.
    Json(Value),
    /// The body as text.
    Text(String),
}

impl ResponseBody {
    /// Parses `text` as JSON, keeping it as text if that fails.
    #[must_use]
    pub fn from_text(text: String) -> Self {
        serde_json::from_str(&text).map_or(Self::Text(text), Self::Json)
    }

    /// Whether there is nothing worth showing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Json(value) => value.is_null(),
            Self::Text(text) => text.is_empty(),
        }
    }
}

/// The parts of an error response kept on a [`RequestError`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSnapshot {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body, if one could be read.
    pub body: Option<ResponseBody>,
}

/// A failed request.
///
/// `Display` shows [`Self::message`]. `Debug` and `Serialize` leave out
/// [`Self::options`] and [`Self::timings`] once
/// [`Self::hide_verbose_fields`] has been called; the accessors keep
/// returning them.
pub struct RequestError {
    kind: RequestErrorKind,
    message: String,
    stack: String,
    options: RequestOptions,
    timings: Option<Timings>,
    response: Option<ResponseSnapshot>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
    verbose_hidden: bool,
}

impl RequestError {
    /// Creates an error and records its stack.
    ///
    /// The stack holds a `"{kind}: {message}"` header line, followed by a
    /// backtrace when `RUST_BACKTRACE` enables one.
    #[must_use]
    pub fn new(
        kind: RequestErrorKind,
        message: impl Into<String>,
        options: RequestOptions,
    ) -> Self {
        let message = message.into();
        let backtrace = Backtrace::capture();
        let stack = if backtrace.status() == BacktraceStatus::Captured {
            format!("{kind}: {message}\n{backtrace}")
        } else {
            format!("{kind}: {message}")
        };
        Self {
            kind,
            message,
            stack,
            options,
            timings: None,
            response: None,
            source: None,
            verbose_hidden: false,
        }
    }

    /// Attaches the underlying cause.
    #[must_use]
    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Attaches the error response.
    #[must_use]
    pub fn with_response(mut self, response: ResponseSnapshot) -> Self {
        self.response = Some(response);
        self
    }

    /// Attaches attempt timings.
    #[must_use]
    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = Some(timings);
        self
    }

    /// The error classification.
    #[must_use]
    pub const fn kind(&self) -> RequestErrorKind {
        self.kind
    }

    /// The current message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Replaces the message.
    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = message.into();
    }

    /// The current stack text, header line first.
    #[must_use]
    pub fn stack(&self) -> &str {
        &self.stack
    }

    /// Replaces the stack text.
    pub fn set_stack(&mut self, stack: impl Into<String>) {
        self.stack = stack.into();
    }

    /// The request this error belongs to.
    #[must_use]
    pub const fn options(&self) -> &RequestOptions {
        &self.options
    }

    /// Attempt timings, if the request was dispatched.
    #[must_use]
    pub const fn timings(&self) -> Option<&Timings> {
        self.timings.as_ref()
    }

    /// The error response, if the server answered.
    #[must_use]
    pub const fn response(&self) -> Option<&ResponseSnapshot> {
        self.response.as_ref()
    }

    /// Response status code, or `0` when there was no response.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        self.response.as_ref().map_or(0, |r| r.status_code)
    }

    /// Leaves `options` and `timings` out of `Debug` and `Serialize` output.
    pub const fn hide_verbose_fields(&mut self) {
        self.verbose_hidden = true;
    }

    /// Whether [`Self::hide_verbose_fields`] has been called.
    #[must_use]
    pub const fn verbose_fields_hidden(&self) -> bool {
        self.verbose_hidden
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("RequestError");
        debug
            .field("kind", &self.kind)
            .field("message", &self.message);
        if let Some(response) = &self.response {
            debug.field("response", response);
        }
        if let Some(source) = &self.source {
            debug.field("source", source);
        }
        if self.verbose_hidden {
            debug.finish_non_exhaustive()
        } else {
            debug
                .field("options", &self.options)
                .field("timings", &self.timings)
                .finish()
        }
    }
}

impl std::error::Error for RequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl Serialize for RequestError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.verbose_hidden { 5 } else { 7 };
        let mut state = serializer.serialize_struct("RequestError", len)?;
        state.serialize_field("name", self.kind.name())?;
        state.serialize_field("message", &self.message)?;
        state.serialize_field("stack", &self.stack)?;
        state.serialize_field("statusCode", &self.status_code())?;
        state.serialize_field("response", &self.response)?;
        if !self.verbose_hidden {
            state.serialize_field("options", &self.options)?;
            state.serialize_field("timings", &self.timings)?;
        }
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RequestError {
        let options = RequestOptions::new(Method::GET)
            .with_url("https://api.example.test/foo".parse().unwrap())
            .with_context(RequestContext::started_at(5));
        RequestError::new(RequestErrorKind::Http, "Response code 404 (Not Found)", options)
            .with_response(ResponseSnapshot {
                status_code: 404,
                body: Some(ResponseBody::from_text("{\"msg\":\"nope\"}".to_owned())),
            })
            .with_timings(Timings {
                start: 5,
                elapsed: Duration::from_millis(12),
            })
    }

    #[test]
    fn test_stack_starts_with_kind_and_message() {
        let err = sample();
        assert!(
            err.stack()
                .starts_with("HttpError: Response code 404 (Not Found)")
        );
        assert_eq!(err.to_string(), "Response code 404 (Not Found)");
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn test_status_code_defaults_to_zero() {
        let err = RequestError::new(
            RequestErrorKind::Transport,
            "connection refused",
            RequestOptions::new(Method::POST),
        );
        assert_eq!(err.status_code(), 0);
        assert!(err.response().is_none());
    }

    #[test]
    fn test_response_body_from_text() {
        assert_eq!(
            ResponseBody::from_text("{\"a\":1}".to_owned()),
            ResponseBody::Json(serde_json::json!({"a": 1}))
        );
        assert_eq!(
            ResponseBody::from_text("<html>".to_owned()),
            ResponseBody::Text("<html>".to_owned())
        );
        assert!(ResponseBody::Text(String::new()).is_empty());
        assert!(ResponseBody::Json(Value::Null).is_empty());
    }

    #[test]
    fn test_hidden_fields_leave_debug_and_serialize() {
        let mut err = sample();
        let debug = format!("{err:?}");
        assert!(debug.contains("options"));
        assert!(debug.contains("timings"));

        err.hide_verbose_fields();
        let debug = format!("{err:?}");
        assert!(!debug.contains("options"));
        assert!(!debug.contains("timings"));

        let json = serde_json::to_value(&err).unwrap();
        assert!(json.get("options").is_none());
        assert!(json.get("timings").is_none());
        assert_eq!(json["statusCode"], 404);
        assert_eq!(json["response"]["body"]["msg"], "nope");

        // Still reachable by direct access.
        assert_eq!(err.options().method, Method::GET);
        assert_eq!(err.timings().unwrap().elapsed, Duration::from_millis(12));
    }

    #[test]
    fn test_source_chain_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = RequestError::new(
            RequestErrorKind::Transport,
            "error sending request",
            RequestOptions::new(Method::GET),
        )
        .with_source(io);
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "refused");
    }

    #[test]
    fn test_options_serialize_method_as_string() {
        let json = serde_json::to_value(sample().options()).unwrap();
        assert_eq!(json["method"], "GET");
        assert_eq!(json["url"], "https://api.example.test/foo");
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(RequestErrorKind::Resolution.to_string(), "ResolutionError");
        assert_eq!(RequestErrorKind::Http.name(), "HttpError");
    }
}
