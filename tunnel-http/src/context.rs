//! Per-request context bag.
//!
//! A [`RequestContext`] is attached to a request with
//! [`RequestBuilder::context`](crate::RequestBuilder::context) and travels
//! through the middleware chain as a typed [`http::Extensions`] entry. The
//! error enricher reads it back when a request fails.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Caller-populated values threaded through a single request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    /// Milliseconds since the Unix epoch when the request was started.
    pub started: u64,

    /// Error captured at the call site; its stack is spliced into the
    /// stack of a failed request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<CapturedError>,

    /// How many times the caller has retried this request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,

    /// Caller-defined keys.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RequestContext {
    /// Creates a context started now.
    #[must_use]
    pub fn now() -> Self {
        Self::started_at(now_millis())
    }

    /// Creates a context with an explicit start timestamp.
    #[must_use]
    pub fn started_at(started: u64) -> Self {
        Self {
            started,
            ..Self::default()
        }
    }

    /// Attaches a call-site error for stack splicing.
    #[must_use]
    pub fn with_captured_error(mut self, err: CapturedError) -> Self {
        self.err = Some(err);
        self
    }

    /// Captures the current call stack and attaches it.
    ///
    /// Call this before the request crosses an `.await` so the spliced stack
    /// points at the code that issued the request.
    #[must_use]
    pub fn with_call_site(self) -> Self {
        self.with_captured_error(CapturedError::capture("RequestError"))
    }

    /// Sets the retry counter.
    #[must_use]
    pub const fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    /// Stores a caller-defined value, returning the previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.extra.insert(key.into(), value.into())
    }

    /// Looks up a caller-defined value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Milliseconds elapsed since [`Self::started`], saturating at zero.
    #[must_use]
    pub fn elapsed_millis(&self) -> u64 {
        now_millis().saturating_sub(self.started)
    }
}

/// A message plus the textual stack trace captured with it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedError {
    message: String,
    stack: String,
}

impl CapturedError {
    /// Captures a backtrace at the caller, regardless of `RUST_BACKTRACE`.
    ///
    /// The stack is rendered one frame per line, `    at {symbol} ({file})`,
    /// under an `Error: {message}` header. The first frame is this function;
    /// the frames of this module that called it are dropped, so the second
    /// frame is the code that asked for the capture.
    #[must_use]
    pub fn capture(message: impl Into<String>) -> Self {
        let message = message.into();
        let backtrace = Backtrace::force_capture();
        let mut stack = format!("Error: {message}");
        if backtrace.status() == BacktraceStatus::Captured {
            for frame in capture_frames(&backtrace.to_string()) {
                stack.push('\n');
                stack.push_str(&frame);
            }
        }
        Self { message, stack }
    }

    /// Wraps an already formatted stack.
    #[must_use]
    pub fn from_stack(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: stack.into(),
        }
    }

    /// The error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The stack, header line first.
    #[must_use]
    pub fn stack(&self) -> &str {
        &self.stack
    }
}

impl fmt::Debug for CapturedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedError")
            .field("message", &self.message)
            .field("stack", &format!("<{} lines>", self.stack.lines().count()))
            .finish()
    }
}

impl fmt::Display for CapturedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CapturedError {}

const CAPTURE_SYMBOL: &str = "CapturedError::capture";
const CONTEXT_MODULE: &str = "tunnel_http::context::";

/// Flattens `Backtrace`'s two-line frames into `    at {symbol} ({file})`
/// lines, starting at [`CapturedError::capture`].
///
/// Frames of this module between the capture and its caller are skipped. If
/// the capture frame cannot be found (no symbols), every frame is kept.
fn capture_frames(rendered: &str) -> Vec<String> {
    let mut frames: Vec<(&str, Option<&str>)> = Vec::new();
    for line in rendered.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(location) = line.strip_prefix("at ") {
            if let Some(last) = frames.last_mut()
                && last.1.is_none()
            {
                last.1 = Some(location);
            }
            continue;
        }
        if line.starts_with("note:") {
            continue;
        }
        // `  12: symbol` starts a frame; inlined symbols follow unnumbered.
        let symbol = line
            .split_once(": ")
            .filter(|(index, _)| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()))
            .map_or(line, |(_, symbol)| symbol);
        frames.push((symbol, None));
    }

    let start = frames
        .iter()
        .position(|(symbol, _)| symbol.contains(CAPTURE_SYMBOL));
    let frames = match start {
        Some(start) => {
            let (capture, callers) = frames[start..].split_at(1);
            capture
                .iter()
                .chain(
                    callers
                        .iter()
                        .skip_while(|(symbol, _)| symbol.starts_with(CONTEXT_MODULE)),
                )
                .copied()
                .collect::<Vec<_>>()
        }
        None => frames,
    };

    frames
        .into_iter()
        .map(|(symbol, location)| match location {
            Some(location) => format!("    at {symbol} ({location})"),
            None => format!("    at {symbol}"),
        })
        .collect()
}

/// Milliseconds since the Unix epoch, or zero if the clock is before it.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_recent() {
        let before = now_millis();
        let ctx = RequestContext::now();
        assert!(ctx.started >= before);
        assert!(ctx.err.is_none());
        assert!(ctx.retry_count.is_none());
    }

    #[test]
    fn test_extra_keys() {
        let mut ctx = RequestContext::started_at(1);
        assert!(ctx.insert("traceId", "abc").is_none());
        assert_eq!(ctx.get("traceId"), Some(&Value::from("abc")));
        assert_eq!(ctx.insert("traceId", 7), Some(Value::from("abc")));
    }

    #[test]
    fn test_serializes_camel_case_with_flattened_extra() {
        let mut ctx = RequestContext::started_at(1_700_000_000_000).with_retry_count(2);
        ctx.insert("tenant", "acme");
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"started": 1_700_000_000_000_u64, "retryCount": 2, "tenant": "acme"})
        );
        let back: RequestContext = serde_json::from_value(json).unwrap();
        assert_eq!(back, ctx);
    }

    #[test]
    fn test_capture_has_header_and_frames() {
        let captured = CapturedError::capture("boom");
        let mut lines = captured.stack().lines();
        assert_eq!(lines.next(), Some("Error: boom"));
        assert!(lines.next().is_some());
        assert_eq!(captured.to_string(), "boom");
    }

    const RENDERED: &str = "   0: tunnel_http::context::CapturedError::capture
             at ./src/context.rs:110:25
   1: tunnel_http::context::RequestContext::with_call_site
             at ./src/context.rs:65:34
   2: app::orders::load
             at ./src/orders.rs:42:9
      app::orders::load::{{closure}}
             at ./src/orders.rs:40:5
   3: <unknown>
   4: hyper::client::send
             at /home/dev/.cargo/registry/src/hyper/client.rs:9:1";

    #[test]
    fn test_capture_frames_one_line_per_frame() {
        assert_eq!(
            capture_frames(RENDERED),
            vec![
                "    at tunnel_http::context::CapturedError::capture (./src/context.rs:110:25)",
                "    at app::orders::load (./src/orders.rs:42:9)",
                "    at app::orders::load::{{closure}} (./src/orders.rs:40:5)",
                "    at <unknown>",
                "    at hyper::client::send (/home/dev/.cargo/registry/src/hyper/client.rs:9:1)",
            ]
        );
    }

    #[test]
    fn test_capture_frames_without_symbols_keeps_everything() {
        let rendered = "   0: <unknown>\n   1: <unknown>";
        assert_eq!(capture_frames(rendered), vec!["    at <unknown>", "    at <unknown>"]);
    }

    #[test]
    fn test_capture_starts_at_capture_frame() {
        let captured = CapturedError::capture("boom");
        let lines: Vec<&str> = captured.stack().lines().collect();
        assert_eq!(lines[0], "Error: boom");
        assert!(lines[1].contains(CAPTURE_SYMBOL), "{}", captured.stack());
        assert!(lines[1..].iter().all(|line| line.starts_with("    at ")));
        assert!(!captured.stack().contains("std::backtrace"));
    }

    #[test]
    fn test_with_call_site_attaches_error() {
        let ctx = RequestContext::started_at(0).with_call_site();
        let err = ctx.err.unwrap();
        assert!(err.stack().starts_with("Error: RequestError"));
    }
}
