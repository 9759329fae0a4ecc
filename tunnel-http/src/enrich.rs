//! Rewrites failed-request errors into compact, log-friendly messages.
//!
//! Without enrichment a failed call surfaces as
//!
//! ```text
//! HttpError: Response code 422 (Unprocessable Entity)
//! ```
//!
//! With [`ErrorEnricher`] installed the same failure reads
//!
//! ```text
//! 422 GET https://api.example.test/refs?q=1
//! {
//!   "message": "Reference already exists"
//! }
//! ```
//!
//! The message carries the status, method, and URL (password redacted,
//! optionally trimmed), followed by the response body capped at
//! [`ClientOptions::max_response_length`]. Elapsed time is deliberately not
//! part of the message, so error trackers can group identical failures.
//!
//! When the request context holds a [`CapturedError`](crate::CapturedError)
//! its stack is spliced under the error's own header lines, pointing the
//! trace back at the code that issued the request. The splice is a
//! best-effort heuristic over backtrace text; see [`StackSpliceRules`].

use url::Url;

use crate::constants::REDACTED;
use crate::error::{RequestError, ResponseBody};
use crate::hooks::ErrorHook;
use crate::options::ClientOptions;

/// Tracing target of the per-request debug line.
pub const LOG_TARGET: &str = "tunnel_http::request";

/// Text-matching rules for [`splice_stack`].
///
/// The defaults match the stacks produced by
/// [`CapturedError::capture`](crate::CapturedError::capture): an `Error:`
/// header, the capture frame, then one `    at {symbol} ({file})` line per
/// caller frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSpliceRules {
    /// Substring identifying a frame location line in the current stack.
    pub frame_marker: String,
    /// Leading lines dropped from the captured stack (its header plus
    /// frames from the capture machinery itself).
    pub skip_prior_lines: usize,
    /// Substring identifying frames that live inside third-party crates.
    pub dependency_marker: String,
}

impl Default for StackSpliceRules {
    fn default() -> Self {
        Self {
            frame_marker: " at ".to_owned(),
            skip_prior_lines: 2,
            dependency_marker: ".cargo/registry".to_owned(),
        }
    }
}

/// The built-in [`ErrorHook`].
#[derive(Debug, Clone, Default)]
pub struct ErrorEnricher {
    options: ClientOptions,
    rules: StackSpliceRules,
}

impl ErrorEnricher {
    /// Creates an enricher for the given options.
    #[must_use]
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            rules: StackSpliceRules::default(),
        }
    }

    /// Replaces the stack splicing rules.
    #[must_use]
    pub fn with_splice_rules(mut self, rules: StackSpliceRules) -> Self {
        self.rules = rules;
        self
    }

    /// The options this enricher renders with.
    #[must_use]
    pub const fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Rewrites message and stack, then hides the verbose fields.
    #[must_use]
    pub fn enrich(&self, mut err: RequestError) -> RequestError {
        let status_code = err.status_code();
        let request = err.options();
        let method = request.method.to_string();
        let short = request.url.as_ref().map_or_else(String::new, |url| {
            short_url(&self.options, url, request.prefix_url.as_deref())
        });
        let (started, retry_count) = request
            .context
            .as_ref()
            .map_or((0, None), |ctx| (ctx.started, ctx.retry_count));

        if !self.options.is_production() {
            tracing::debug!(
                target: LOG_TARGET,
                started,
                "{}",
                debug_line(status_code, &method, &short, retry_count)
            );
        }

        let body = err
            .response()
            .and_then(|response| response.body.as_ref())
            .filter(|body| !body.is_empty())
            .map_or_else(
                || err.message().to_owned(),
                |body| format_body(body, self.options.max_response_length),
            );

        let status = (status_code != 0).then(|| status_code.to_string());
        let head = join_tokens([status, Some(method), Some(short)], " ");
        let message = join_tokens([Some(head), Some(body)], "\n");

        let prior = err
            .options()
            .context
            .as_ref()
            .and_then(|ctx| ctx.err.as_ref())
            .map(|captured| captured.stack().to_owned())
            .filter(|stack| !stack.is_empty());

        err.set_message(message);
        if let Some(prior) = prior {
            let spliced = splice_stack(err.stack(), &prior, &self.rules);
            err.set_stack(spliced);
        }
        err.hide_verbose_fields();
        err
    }
}

impl ErrorHook for ErrorEnricher {
    fn before_error(&self, err: RequestError) -> RequestError {
        self.enrich(err)
    }
}

/// Returns the display form of `url`.
///
/// The password is replaced with `[redacted]`, then the query string is
/// dropped if `log_with_search_params` is off, then `prefix_url` is stripped
/// once if `log_with_prefix_url` is off and it is a literal prefix. A
/// credentialed `prefix_url` is redacted the same way before comparing.
#[must_use]
pub fn short_url(options: &ClientOptions, url: &Url, prefix_url: Option<&str>) -> String {
    let mut short = redact_url(url);

    if !options.log_with_search_params
        && let Some(index) = short.find('?')
    {
        short.truncate(index);
    }

    if !options.log_with_prefix_url
        && let Some(prefix) = prefix_url.map(redact_prefix).filter(|p| !p.is_empty())
        && let Some(rest) = short.strip_prefix(prefix.as_str())
    {
        short = rest.to_owned();
    }

    short
}

/// Serialises `url` with any password replaced by `[redacted]`.
///
/// The caller's URL is never modified.
#[must_use]
pub fn redact_url(url: &Url) -> String {
    if url.password().is_none_or(str::is_empty) {
        return url.to_string();
    }

    let mut redacted = url.clone();
    if redacted.set_password(Some(REDACTED)).is_err() {
        return url.to_string();
    }
    // `Url` percent-encodes the brackets; show the token verbatim.
    match redacted.password() {
        Some(stored) if stored != REDACTED => redacted
            .to_string()
            .replacen(&format!(":{stored}@"), &format!(":{REDACTED}@"), 1),
        _ => redacted.to_string(),
    }
}

/// Redacts the password inside the caller's prefix text, leaving the rest of
/// it (trailing slash or not) exactly as written.
fn redact_prefix(prefix: &str) -> String {
    let Ok(url) = Url::parse(prefix) else {
        return prefix.to_owned();
    };
    match url.password() {
        Some(password) if !password.is_empty() => {
            prefix.replacen(&format!(":{password}@"), &format!(":{REDACTED}@"), 1)
        }
        _ => prefix.to_owned(),
    }
}

/// Pretty-prints a response body and caps it at `max_len` characters.
///
/// JSON is indented, text is kept as-is. No colour codes are emitted.
#[must_use]
pub fn format_body(body: &ResponseBody, max_len: usize) -> String {
    let rendered = match body {
        ResponseBody::Json(value) => {
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        }
        ResponseBody::Text(text) => text.clone(),
    };
    truncate_chars(&rendered, max_len)
}

/// Caps `text` at `max_len` characters.
///
/// A `... N more characters` marker is appended when there is room for it;
/// the marker counts towards `max_len`.
#[must_use]
pub fn truncate_chars(text: &str, max_len: usize) -> String {
    let total = text.chars().count();
    if total <= max_len {
        return text.to_owned();
    }

    let mut keep = max_len;
    loop {
        let marker = format!("... {} more characters", total - keep);
        if keep + marker.len() <= max_len {
            let mut out: String = text.chars().take(keep).collect();
            out.push_str(&marker);
            return out;
        }
        if marker.len() >= max_len {
            return text.chars().take(max_len).collect();
        }
        keep = max_len - marker.len();
    }
}

/// Joins the current stack's header lines with the caller's captured stack.
///
/// Header lines are those before the first line containing
/// [`StackSpliceRules::frame_marker`]. If none does, all but the last line
/// are kept, and a lone header line is always kept.
/// The captured stack loses its first
/// [`StackSpliceRules::skip_prior_lines`] lines and any leading lines that
/// contain [`StackSpliceRules::dependency_marker`].
#[must_use]
pub fn splice_stack(current: &str, prior: &str, rules: &StackSpliceRules) -> String {
    let original: Vec<&str> = current.split('\n').collect();
    let header_len = original
        .iter()
        .position(|line| line.contains(rules.frame_marker.as_str()))
        .unwrap_or_else(|| original.len().saturating_sub(1).max(1));

    let synthetic: Vec<&str> = prior.split('\n').skip(rules.skip_prior_lines).collect();
    let first_own_frame = synthetic
        .iter()
        .position(|line| !line.contains(rules.dependency_marker.as_str()))
        .unwrap_or(0);

    original[..header_len]
        .iter()
        .chain(&synthetic[first_own_frame..])
        .copied()
        .collect::<Vec<_>>()
        .join("\n")
}

/// The non-production debug line: status, method, URL, retry, `error`.
///
/// Zero and empty tokens are skipped.
#[must_use]
pub fn debug_line(
    status_code: u16,
    method: &str,
    short_url: &str,
    retry_count: Option<u32>,
) -> String {
    join_tokens(
        [
            (status_code != 0).then(|| status_code.to_string()),
            Some(method.to_owned()),
            Some(short_url.to_owned()),
            retry_count
                .filter(|count| *count > 0)
                .map(|count| format!("(retry {count})")),
            Some("error".to_owned()),
        ],
        " ",
    )
}

fn join_tokens<const N: usize>(tokens: [Option<String>; N], separator: &str) -> String {
    tokens
        .into_iter()
        .flatten()
        .filter(|token| !token.is_empty())
        .collect::<Vec<_>>()
        .join(separator)
}
