//! The pre-configured client.
//!
//! [`HttpClient`] composes a [`reqwest::Client`] with the trust middleware
//! and the error hooks so that every call site gets both without wiring
//! anything up:
//!
//! ```no_run
//! # async fn run() -> Result<(), tunnel_http::RequestError> {
//! use tunnel_http::{ClientOptions, HttpClient};
//!
//! let client = HttpClient::builder()
//!     .prefix_url("https://api.example.test/v1/")
//!     .options(ClientOptions {
//!         log_with_prefix_url: false,
//!         ..ClientOptions::default()
//!     })
//!     .build();
//!
//! let user: serde_json::Value = client.get("users/42").json_response().await?;
//! # let _ = user;
//! # Ok(())
//! # }
//! ```
//!
//! Every failure comes back as a [`RequestError`] that has already been
//! through the user hooks and, last, the [`ErrorEnricher`].

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use http::{Extensions, Method, StatusCode};
use reqwest::{Body, Response};
use reqwest_middleware as rqm;
use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::context::{RequestContext, now_millis};
use crate::enrich::{ErrorEnricher, LOG_TARGET, StackSpliceRules, short_url};
use crate::error::{
    RequestError, RequestErrorKind, RequestOptions, ResolutionError, ResponseBody,
    ResponseSnapshot, Timings,
};
use crate::hooks::{ErrorHook, ErrorHooks};
use crate::options::ClientOptions;
use crate::trust::{
    AgentBuilderFn, AgentDispatch, CaBundleProvider, ExecutableLocator, TrustInjector,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A `reqwest` client with local trust injection and enriched errors.
///
/// Cloning is cheap; clones share the connection pool, middlewares and hooks.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    inner: rqm::ClientWithMiddleware,
    prefix_url: Option<String>,
    options: Arc<ClientOptions>,
    hooks: ErrorHooks,
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("prefix_url", &self.prefix_url)
            .field("options", &self.options)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "mkcert")]
impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// The default client: `mkcert` from `PATH` for `.test` hosts and the
    /// enricher with default options.
    #[cfg(feature = "mkcert")]
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts configuring a client.
    #[must_use]
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::default()
    }

    /// Starts a request. `input` is joined onto the prefix URL if one is set.
    pub fn request(&self, method: Method, input: impl AsRef<str>) -> RequestBuilder {
        RequestBuilder {
            url: self.resolve_url(input.as_ref()),
            client: self.clone(),
            method,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            context: None,
            build_error: None,
        }
    }

    /// Starts a `GET` request.
    pub fn get(&self, input: impl AsRef<str>) -> RequestBuilder {
        self.request(Method::GET, input)
    }

    /// Starts a `POST` request.
    pub fn post(&self, input: impl AsRef<str>) -> RequestBuilder {
        self.request(Method::POST, input)
    }

    /// Starts a `PUT` request.
    pub fn put(&self, input: impl AsRef<str>) -> RequestBuilder {
        self.request(Method::PUT, input)
    }

    /// Starts a `PATCH` request.
    pub fn patch(&self, input: impl AsRef<str>) -> RequestBuilder {
        self.request(Method::PATCH, input)
    }

    /// Starts a `DELETE` request.
    pub fn delete(&self, input: impl AsRef<str>) -> RequestBuilder {
        self.request(Method::DELETE, input)
    }

    /// Starts a `HEAD` request.
    pub fn head(&self, input: impl AsRef<str>) -> RequestBuilder {
        self.request(Method::HEAD, input)
    }

    /// The options errors are rendered with.
    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// The prefix joined in front of request inputs.
    #[must_use]
    pub fn prefix_url(&self) -> Option<&str> {
        self.prefix_url.as_deref()
    }

    /// The hooks every error passes through, the enricher last.
    #[must_use]
    pub const fn error_hooks(&self) -> &ErrorHooks {
        &self.hooks
    }

    /// The underlying middleware client.
    #[must_use]
    pub const fn inner(&self) -> &rqm::ClientWithMiddleware {
        &self.inner
    }

    fn resolve_url(&self, input: &str) -> Result<Url, url::ParseError> {
        match &self.prefix_url {
            Some(prefix) if prefix.ends_with('/') => {
                Url::parse(&format!("{prefix}{}", input.trim_start_matches('/')))
            }
            Some(prefix) => Url::parse(&format!("{prefix}/{}", input.trim_start_matches('/'))),
            None => Url::parse(input),
        }
    }

    fn fail(&self, err: RequestError) -> RequestError {
        self.hooks.apply(err)
    }

    fn short_url(&self, url: &Url) -> String {
        short_url(&self.options, url, self.prefix_url.as_deref())
    }
}

/// Configures an [`HttpClient`].
pub struct HttpClientBuilder {
    client: Option<reqwest::Client>,
    prefix_url: Option<String>,
    options: ClientOptions,
    locator: Option<Arc<dyn ExecutableLocator>>,
    provider: Option<Arc<dyn CaBundleProvider>>,
    cache_bundles: bool,
    local_trust: bool,
    agent_builder: Option<AgentBuilderFn>,
    middlewares: Vec<Arc<dyn rqm::Middleware>>,
    hooks: ErrorHooks,
    splice_rules: StackSpliceRules,
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self {
            client: None,
            prefix_url: None,
            options: ClientOptions::default(),
            locator: None,
            provider: None,
            cache_bundles: false,
            local_trust: true,
            agent_builder: None,
            middlewares: Vec::new(),
            hooks: ErrorHooks::new(),
            splice_rules: StackSpliceRules::default(),
        }
    }
}

impl fmt::Debug for HttpClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClientBuilder")
            .field("prefix_url", &self.prefix_url)
            .field("options", &self.options)
            .field("cache_bundles", &self.cache_bundles)
            .field("local_trust", &self.local_trust)
            .field("middlewares", &self.middlewares.len())
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

impl HttpClientBuilder {
    /// Uses an existing `reqwest` client for requests without custom trust.
    ///
    /// Requests that get a local-trust agent are sent through a separate
    /// client, so nothing set here (default headers, proxy, redirect policy)
    /// applies to them. Use [`Self::agent_builder`] to configure that client.
    #[must_use]
    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Joins every request input onto `prefix_url`.
    #[must_use]
    pub fn prefix_url(mut self, prefix_url: impl Into<String>) -> Self {
        self.prefix_url = Some(prefix_url.into());
        self
    }

    /// Sets the logging and redaction options.
    #[must_use]
    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Replaces the executable locator.
    #[must_use]
    pub fn locator(mut self, locator: impl ExecutableLocator + 'static) -> Self {
        self.locator = Some(Arc::new(locator));
        self
    }

    /// Replaces the CA bundle provider.
    #[must_use]
    pub fn provider(mut self, provider: impl CaBundleProvider + 'static) -> Self {
        self.provider = Some(Arc::new(provider));
        self
    }

    /// Reuses a resolved bundle per executable path. Off by default.
    #[must_use]
    pub fn cache_bundles(mut self, enabled: bool) -> Self {
        self.cache_bundles = enabled;
        self
    }

    /// Starts every local-trust agent from `factory()`, so its headers, proxy
    /// and redirect policy match the shared client's.
    #[must_use]
    pub fn agent_builder<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> reqwest::ClientBuilder + Send + Sync + 'static,
    {
        self.agent_builder = Some(Arc::new(factory));
        self
    }

    /// Leaves `.test` requests to the shared client's trust store.
    #[must_use]
    pub fn without_local_trust(mut self) -> Self {
        self.local_trust = false;
        self
    }

    /// Adds a middleware between the trust injector and dispatch.
    #[must_use]
    pub fn with<M: rqm::Middleware>(self, middleware: M) -> Self {
        self.with_arc(Arc::new(middleware))
    }

    /// Adds a shared middleware between the trust injector and dispatch.
    #[must_use]
    pub fn with_arc(mut self, middleware: Arc<dyn rqm::Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Adds an error hook. Hooks run in registration order, before the
    /// built-in enricher.
    #[must_use]
    pub fn with_error_hook(mut self, hook: impl ErrorHook + 'static) -> Self {
        self.hooks = self.hooks.with_hook(hook);
        self
    }

    /// Replaces the stack splicing rules of the enricher.
    #[must_use]
    pub fn splice_rules(mut self, rules: StackSpliceRules) -> Self {
        self.splice_rules = rules;
        self
    }

    /// Builds the client.
    ///
    /// Without the `mkcert` feature, local trust is only installed when both
    /// a locator and a provider were given.
    #[must_use]
    pub fn build(mut self) -> HttpClient {
        let client = self.client.take().unwrap_or_default();
        let mut chain = rqm::ClientBuilder::new(client.clone());
        if let Some(injector) = self.trust_injector() {
            chain = chain.with(injector);
        }
        for middleware in self.middlewares {
            chain = chain.with_arc(middleware);
        }
        let inner = chain.with(AgentDispatch).build();

        let enricher =
            ErrorEnricher::new(self.options.clone()).with_splice_rules(self.splice_rules);

        HttpClient {
            client,
            inner,
            prefix_url: self.prefix_url,
            options: Arc::new(self.options),
            hooks: self.hooks.with_hook(enricher),
        }
    }

    fn trust_injector(&mut self) -> Option<TrustInjector> {
        if !self.local_trust {
            return None;
        }

        #[cfg(feature = "mkcert")]
        let (locator, provider) = {
            let locator: Arc<dyn ExecutableLocator> = match self.locator.take() {
                Some(locator) => locator,
                None => Arc::new(crate::trust::PathLocator::default()),
            };
            let provider: Arc<dyn CaBundleProvider> = match self.provider.take() {
                Some(provider) => provider,
                None => Arc::new(tunnel_mkcert::Mkcert::new()),
            };
            (locator, provider)
        };
        #[cfg(not(feature = "mkcert"))]
        let (locator, provider) = (self.locator.take()?, self.provider.take()?);

        Some(
            TrustInjector::from_arcs(locator, provider)
                .with_cache(self.cache_bundles)
                .with_agent_builder_arc(self.agent_builder.take()),
        )
    }
}

/// A request being assembled. Nothing is sent until [`Self::send`].
#[must_use = "a request does nothing until it is sent"]
pub struct RequestBuilder {
    client: HttpClient,
    method: Method,
    url: Result<Url, url::ParseError>,
    headers: HeaderMap,
    body: Option<Body>,
    timeout: Option<Duration>,
    context: Option<RequestContext>,
    build_error: Option<BoxError>,
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBuilder")
            .field("method", &self.method)
            .field("url", &self.url.as_ref().map(crate::enrich::redact_url))
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RequestBuilder {
    /// Appends a header.
    pub fn header<K, V>(mut self, key: K, value: V) -> Self
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        match (HeaderName::try_from(key), HeaderValue::try_from(value)) {
            (Ok(key), Ok(value)) => {
                self.headers.append(key, value);
            }
            (Err(e), _) => self.fail(e.into()),
            (_, Err(e)) => self.fail(e.into()),
        }
        self
    }

    /// Appends query pairs to the URL.
    pub fn query<K, V>(mut self, pairs: &[(K, V)]) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        if let Ok(url) = &mut self.url {
            url.query_pairs_mut().extend_pairs(pairs);
        }
        self
    }

    /// Sends `body` as JSON.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Self {
        match serde_json::to_vec(body) {
            Ok(bytes) => {
                self.headers
                    .entry(CONTENT_TYPE)
                    .or_insert(HeaderValue::from_static("application/json"));
                self.body = Some(bytes.into());
            }
            Err(e) => self.fail(e),
        }
        self
    }

    /// Sets a raw body.
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Sets a timeout for this request.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attaches a [`RequestContext`].
    pub fn context(mut self, context: RequestContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Sends the request.
    ///
    /// # Errors
    ///
    /// Returns an enriched [`RequestError`] if the URL is invalid, the
    /// request cannot be built, local trust cannot be resolved, the
    /// transport fails, or the response is neither 2xx nor 3xx.
    pub async fn send(self) -> Result<Response, RequestError> {
        let client = self.client.clone();
        self.dispatch().await.map(|(res, _)| res).map_err(|e| client.fail(e))
    }

    /// Sends the request and decodes a JSON response body.
    ///
    /// # Errors
    ///
    /// Same as [`Self::send`], plus [`RequestErrorKind::Parse`] if the body
    /// does not decode into `T`.
    pub async fn json_response<T: DeserializeOwned>(self) -> Result<T, RequestError> {
        let client = self.client.clone();
        let (res, snapshot) = self.dispatch().await.map_err(|e| client.fail(e))?;
        let bytes = res.bytes().await.map_err(|e| {
            let e = e.without_url();
            let message = display_chain(&e);
            let err = RequestError::new(RequestErrorKind::Transport, message, snapshot.clone());
            client.fail(err.with_source(e))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            let err = RequestError::new(RequestErrorKind::Parse, e.to_string(), snapshot);
            client.fail(err.with_source(e))
        })
    }

    fn fail(&mut self, err: impl Into<BoxError>) {
        if self.build_error.is_none() {
            self.build_error = Some(err.into());
        }
    }

    async fn dispatch(self) -> Result<(Response, RequestOptions), RequestError> {
        let Self {
            client,
            method,
            url,
            headers,
            body,
            timeout,
            context,
            build_error,
        } = self;

        let mut snapshot = RequestOptions::new(method.clone());
        snapshot.prefix_url.clone_from(&client.prefix_url);
        snapshot.context.clone_from(&context);

        let url = match url {
            Ok(url) => url,
            Err(e) => {
                return Err(RequestError::new(
                    RequestErrorKind::InvalidUrl,
                    format!("Invalid URL: {e}"),
                    snapshot,
                )
                .with_source(e));
            }
        };
        snapshot.url = Some(url.clone());

        if let Some(e) = build_error {
            let err = RequestError::new(RequestErrorKind::Build, e.to_string(), snapshot);
            return Err(err.with_source(e));
        }

        let mut builder = client.client.request(method.clone(), url.clone()).headers(headers);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }
        let request = match builder.build() {
            Ok(request) => request,
            Err(e) => {
                let e = e.without_url();
                return Err(
                    RequestError::new(RequestErrorKind::Build, display_chain(&e), snapshot)
                        .with_source(e),
                );
            }
        };

        let logging = !client.options.is_production();
        let short = client.short_url(&url);
        if logging && client.options.logs_start() {
            tracing::debug!(target: LOG_TARGET, ">> {method} {short}");
        }
        if logging && client.options.logs_request() {
            let headers = request.headers();
            tracing::trace!(target: LOG_TARGET, ?headers, ">> {method} {short}");
        }

        let mut extensions = Extensions::new();
        if let Some(context) = context {
            extensions.insert(context);
        }

        let start = now_millis();
        let timer = Instant::now();
        let result = client
            .inner
            .execute_with_extensions(request, &mut extensions)
            .await;
        let timings = Timings {
            start,
            elapsed: timer.elapsed(),
        };

        let res = match result {
            Ok(res) => res,
            Err(e) => return Err(classify(e, snapshot).with_timings(timings)),
        };

        let status = res.status();
        if logging && client.options.logs_response() {
            tracing::trace!(
                target: LOG_TARGET,
                headers = ?res.headers(),
                "<< {} {method} {short}",
                status.as_u16()
            );
        }

        // Redirects are followed by reqwest; any other 3xx that surfaces is
        // an error, except a cache revalidation.
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            if logging && client.options.logs_finished() {
                tracing::debug!(
                    target: LOG_TARGET,
                    "<< {} {method} {short} in {} ms",
                    status.as_u16(),
                    timings.elapsed.as_millis()
                );
            }
            return Ok((res, snapshot));
        }

        let body = res
            .text()
            .await
            .ok()
            .map(ResponseBody::from_text);
        let message = format!(
            "Response code {} ({})",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown")
        );
        Err(RequestError::new(RequestErrorKind::Http, message, snapshot)
            .with_response(ResponseSnapshot {
                status_code: status.as_u16(),
                body,
            })
            .with_timings(timings))
    }
}

fn classify(err: rqm::Error, snapshot: RequestOptions) -> RequestError {
    match err {
        rqm::Error::Reqwest(e) => {
            let kind = if e.is_timeout() {
                RequestErrorKind::Timeout
            } else if e.is_builder() {
                RequestErrorKind::Build
            } else {
                RequestErrorKind::Transport
            };
            let e = e.without_url();
            RequestError::new(kind, display_chain(&e), snapshot).with_source(e)
        }
        rqm::Error::Middleware(e) => match e.downcast::<ResolutionError>() {
            Ok(e) => RequestError::new(RequestErrorKind::Resolution, e.to_string(), snapshot)
                .with_source(e),
            Err(e) => RequestError::new(RequestErrorKind::Middleware, format!("{e:#}"), snapshot)
                .with_source(e),
        },
    }
}

/// `err` followed by each of its sources, joined with `": "`.
fn display_chain(err: &(dyn std::error::Error + 'static)) -> String {
    std::iter::successors(Some(err), |e| e.source())
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ")
}
