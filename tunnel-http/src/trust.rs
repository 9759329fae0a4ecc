//! Local CA trust for `.test` hosts.
//!
//! [`TrustInjector`] is a [`reqwest_middleware::Middleware`] that notices
//! requests to the reserved local-development TLD, resolves a CA bundle
//! through two injected collaborators, and parks a purpose-built
//! [`reqwest::Client`] in the request's extensions as an [`HttpsAgent`].
//! [`AgentDispatch`], installed at the end of the chain, sends such requests
//! through that agent instead of the shared client.
//!
//! ```text
//! TrustInjector ──► user middlewares ──► AgentDispatch ──► HttpsAgent | shared client
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use http::Extensions;
use reqwest::{Request, Response};
use reqwest_middleware as rqm;
use url::Url;

use crate::constants::LOCAL_DEV_SUFFIX;
use crate::error::ResolutionError;

/// A located CA executable and the monorepo it is scoped to, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedExecutable {
    /// Path to the executable.
    pub path: PathBuf,
    /// Root of the enclosing monorepo.
    pub monorepo_root: Option<PathBuf>,
}

impl LocatedExecutable {
    /// An executable not tied to any monorepo.
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self {
            path,
            monorepo_root: None,
        }
    }

    /// Scopes the executable to a monorepo root.
    #[must_use]
    pub fn with_monorepo_root(mut self, root: PathBuf) -> Self {
        self.monorepo_root = Some(root);
        self
    }
}

/// Finds the local CA executable.
#[async_trait]
pub trait ExecutableLocator: Send + Sync {
    /// Returns the executable path and optional monorepo root.
    async fn locate(&self) -> Result<LocatedExecutable, ResolutionError>;
}

/// Produces the PEM bundle for a located executable.
#[async_trait]
pub trait CaBundleProvider: Send + Sync {
    /// Resolves `{ca, cert, key}` using `executable`.
    async fn resolve_local_ca(
        &self,
        executable: &Path,
        monorepo_root: Option<&Path>,
    ) -> Result<LocalCaBundle, ResolutionError>;
}

/// Produces the base builder a local-trust agent is configured from.
pub type AgentBuilderFn = Arc<dyn Fn() -> reqwest::ClientBuilder + Send + Sync>;

/// CA chain plus client certificate and key, all PEM-encoded.
#[derive(Clone, PartialEq, Eq)]
pub struct LocalCaBundle {
    /// CA certificate chain.
    pub ca: String,
    /// Client certificate.
    pub cert: String,
    /// Client private key.
    pub key: String,
}

impl fmt::Debug for LocalCaBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCaBundle")
            .field("ca", &format!("<{} bytes>", self.ca.len()))
            .field("cert", &format!("<{} bytes>", self.cert.len()))
            .field("key", &"<redacted>")
            .finish()
    }
}

impl LocalCaBundle {
    /// Builds a client that trusts `ca` and presents `cert`/`key`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolutionError::Agent`] if the PEM material is rejected.
    pub fn build_agent(&self) -> Result<HttpsAgent, ResolutionError> {
        self.build_agent_with(reqwest::Client::builder())
    }

    /// Same as [`Self::build_agent`], starting from `builder` so that its
    /// headers, proxy and redirect policy apply to the agent too.
    ///
    /// # Errors
    ///
    /// Returns [`ResolutionError::Agent`] if the PEM material is rejected.
    pub fn build_agent_with(
        &self,
        builder: reqwest::ClientBuilder,
    ) -> Result<HttpsAgent, ResolutionError> {
        let roots = reqwest::Certificate::from_pem_bundle(self.ca.as_bytes())
            .map_err(ResolutionError::Agent)?;
        let pem = format!("{}\n{}", self.cert, self.key);
        let identity = reqwest::Identity::from_pem(pem.as_bytes()).map_err(ResolutionError::Agent)?;

        roots
            .into_iter()
            .fold(builder.identity(identity), |builder, cert| {
                builder.add_root_certificate(cert)
            })
            .build()
            .map(HttpsAgent)
            .map_err(ResolutionError::Agent)
    }
}

#[cfg(feature = "mkcert")]
impl From<tunnel_mkcert::MkcertBundle> for LocalCaBundle {
    fn from(bundle: tunnel_mkcert::MkcertBundle) -> Self {
        Self {
            ca: bundle.ca,
            cert: bundle.cert,
            key: bundle.key,
        }
    }
}

/// The per-request HTTPS agent slot.
///
/// Present in a request's [`Extensions`] when the request must be sent with
/// custom trust.
#[derive(Debug, Clone)]
pub struct HttpsAgent(pub reqwest::Client);

impl HttpsAgent {
    /// The client requests are dispatched through.
    #[must_use]
    pub const fn client(&self) -> &reqwest::Client {
        &self.0
    }
}

/// Looks the executable up on `PATH`.
#[cfg(feature = "mkcert")]
#[derive(Debug, Clone)]
pub struct PathLocator {
    name: String,
}

#[cfg(feature = "mkcert")]
impl PathLocator {
    /// Locates `name` on `PATH`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[cfg(feature = "mkcert")]
impl Default for PathLocator {
    fn default() -> Self {
        Self::new(tunnel_mkcert::MKCERT_BIN)
    }
}

#[cfg(feature = "mkcert")]
#[async_trait]
impl ExecutableLocator for PathLocator {
    async fn locate(&self) -> Result<LocatedExecutable, ResolutionError> {
        let path = tunnel_mkcert::find_executable(&self.name)?;
        Ok(LocatedExecutable::new(path))
    }
}

/// Uses an executable checked into a monorepo.
///
/// Walks up from `start` to the first directory holding one of `markers`,
/// then expects the executable at `tool_path` relative to it.
#[cfg(feature = "mkcert")]
#[derive(Debug, Clone)]
pub struct MonorepoLocator {
    start: PathBuf,
    markers: Vec<String>,
    tool_path: PathBuf,
}

#[cfg(feature = "mkcert")]
impl MonorepoLocator {
    /// Creates a locator searching upward from `start`.
    #[must_use]
    pub fn new<I, S>(start: impl Into<PathBuf>, markers: I, tool_path: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            start: start.into(),
            markers: markers.into_iter().map(Into::into).collect(),
            tool_path: tool_path.into(),
        }
    }
}

#[cfg(feature = "mkcert")]
#[async_trait]
impl ExecutableLocator for MonorepoLocator {
    async fn locate(&self) -> Result<LocatedExecutable, ResolutionError> {
        let markers: Vec<&str> = self.markers.iter().map(String::as_str).collect();
        let root = tunnel_mkcert::find_monorepo_root(&self.start, &markers)?;
        let path = root.join(&self.tool_path);
        if !path.is_file() {
            return Err(ResolutionError::ExecutableNotFound {
                name: path.display().to_string(),
            });
        }
        Ok(LocatedExecutable::new(path).with_monorepo_root(root))
    }
}

#[cfg(feature = "mkcert")]
#[async_trait]
impl CaBundleProvider for tunnel_mkcert::Mkcert {
    async fn resolve_local_ca(
        &self,
        executable: &Path,
        monorepo_root: Option<&Path>,
    ) -> Result<LocalCaBundle, ResolutionError> {
        let bundle = self.certs(executable, monorepo_root).await?;
        Ok(bundle.into())
    }
}

/// Attaches an [`HttpsAgent`] to requests for local development hosts.
///
/// Other requests are forwarded untouched and never reach the collaborators.
/// Resolution failures are not swallowed: they fail the request.
pub struct TrustInjector {
    locator: Arc<dyn ExecutableLocator>,
    provider: Arc<dyn CaBundleProvider>,
    suffix: String,
    cache: Option<DashMap<PathBuf, LocalCaBundle>>,
    agent_builder: Option<AgentBuilderFn>,
}

impl fmt::Debug for TrustInjector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustInjector")
            .field("suffix", &self.suffix)
            .field("cached", &self.cache.as_ref().map(DashMap::len))
            .field("agent_builder", &self.agent_builder.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "mkcert")]
impl Default for TrustInjector {
    fn default() -> Self {
        Self::new(PathLocator::default(), tunnel_mkcert::Mkcert::new())
    }
}

impl TrustInjector {
    /// Creates an injector from its two collaborators.
    #[must_use]
    pub fn new(
        locator: impl ExecutableLocator + 'static,
        provider: impl CaBundleProvider + 'static,
    ) -> Self {
        Self::from_arcs(Arc::new(locator), Arc::new(provider))
    }

    /// Creates an injector from shared collaborators.
    #[must_use]
    pub fn from_arcs(
        locator: Arc<dyn ExecutableLocator>,
        provider: Arc<dyn CaBundleProvider>,
    ) -> Self {
        Self {
            locator,
            provider,
            suffix: LOCAL_DEV_SUFFIX.to_owned(),
            cache: None,
            agent_builder: None,
        }
    }

    /// Reuses the bundle per executable path instead of resolving it for
    /// every request.
    #[must_use]
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache = enabled.then(DashMap::new);
        self
    }

    /// Starts every agent from `factory()` instead of a default builder.
    #[must_use]
    pub fn with_agent_builder<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> reqwest::ClientBuilder + Send + Sync + 'static,
    {
        self.agent_builder = Some(Arc::new(factory));
        self
    }

    /// Uses a shared agent builder factory, or none.
    #[must_use]
    pub fn with_agent_builder_arc(mut self, factory: Option<AgentBuilderFn>) -> Self {
        self.agent_builder = factory;
        self
    }

    /// Replaces the trigger suffix (default `.test`).
    #[must_use]
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into().to_ascii_lowercase();
        self
    }

    /// Whether `url` targets a local development host.
    #[must_use]
    pub fn matches(&self, url: &Url) -> bool {
        url.host_str().is_some_and(|host| {
            host.trim_end_matches('.')
                .to_ascii_lowercase()
                .ends_with(self.suffix.as_str())
        })
    }

    /// Locates the executable, resolves its bundle and builds the agent.
    ///
    /// # Errors
    ///
    /// Returns whatever [`ResolutionError`] a collaborator raised, or
    /// [`ResolutionError::Agent`] if the bundle is unusable.
    pub async fn resolve_agent(&self) -> Result<HttpsAgent, ResolutionError> {
        let located = self.locator.locate().await?;
        let root = located.monorepo_root.as_deref();
        tracing::debug!(executable = %located.path.display(), "located local CA executable");

        let cached = self
            .cache
            .as_ref()
            .and_then(|cache| cache.get(&located.path))
            .map(|entry| entry.value().clone());

        let bundle = if let Some(bundle) = cached {
            bundle
        } else {
            let bundle = self.provider.resolve_local_ca(&located.path, root).await?;
            if let Some(cache) = &self.cache {
                cache.insert(located.path.clone(), bundle.clone());
            }
            bundle
        };

        match &self.agent_builder {
            Some(factory) => bundle.build_agent_with(factory()),
            None => bundle.build_agent(),
        }
    }
}

#[async_trait]
impl rqm::Middleware for TrustInjector {
    #[cfg_attr(
        feature = "telemetry",
        tracing::instrument(name = "tunnel_http.trust.handle", skip_all, fields(url = %req.url()))
    )]
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: rqm::Next<'_>,
    ) -> rqm::Result<Response> {
        if self.matches(req.url()) {
            tracing::debug!(
                host = req.url().host_str().unwrap_or_default(),
                "resolving local CA trust"
            );
            let agent = self
                .resolve_agent()
                .await
                .map_err(|e| rqm::Error::Middleware(e.into()))?;
            extensions.insert(agent);
        }
        next.run(req, extensions).await
    }
}

/// Terminal middleware that honours the [`HttpsAgent`] slot.
///
/// HTTPS requests carrying an agent are sent through it. Everything else
/// continues down the chain to the shared client.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentDispatch;

#[async_trait]
impl rqm::Middleware for AgentDispatch {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: rqm::Next<'_>,
    ) -> rqm::Result<Response> {
        if req.url().scheme() == "https"
            && let Some(agent) = extensions.get::<HttpsAgent>().cloned()
        {
            return agent.client().execute(req).await.map_err(rqm::Error::Reqwest);
        }
        next.run(req, extensions).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn self_signed() -> LocalCaBundle {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();
        LocalCaBundle {
            ca: cert.pem(),
            cert: cert.pem(),
            key: key_pair.serialize_pem(),
        }
    }

    #[derive(Default)]
    struct CountingLocator {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ExecutableLocator for CountingLocator {
        async fn locate(&self) -> Result<LocatedExecutable, ResolutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ResolutionError::ExecutableNotFound {
                    name: "mkcert".to_owned(),
                });
            }
            Ok(LocatedExecutable::new(PathBuf::from("/opt/bin/mkcert"))
                .with_monorepo_root(PathBuf::from("/repo")))
        }
    }

    struct StubProvider {
        calls: AtomicUsize,
        seen: Mutex<Vec<(PathBuf, Option<PathBuf>)>>,
        bundle: LocalCaBundle,
    }

    impl StubProvider {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                bundle: self_signed(),
            }
        }
    }

    #[async_trait]
    impl CaBundleProvider for StubProvider {
        async fn resolve_local_ca(
            &self,
            executable: &Path,
            monorepo_root: Option<&Path>,
        ) -> Result<LocalCaBundle, ResolutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .push((executable.to_path_buf(), monorepo_root.map(Path::to_path_buf)));
            Ok(self.bundle.clone())
        }
    }

    /// Answers every request itself and records whether an agent was attached.
    #[derive(Default)]
    struct AgentRecorder {
        saw_agent: Arc<Mutex<Vec<bool>>>,
    }

    #[async_trait]
    impl rqm::Middleware for AgentRecorder {
        async fn handle(
            &self,
            _req: Request,
            extensions: &mut Extensions,
            _next: rqm::Next<'_>,
        ) -> rqm::Result<Response> {
            self.saw_agent
                .lock()
                .unwrap()
                .push(extensions.get::<HttpsAgent>().is_some());
            Ok(Response::from(
                http::Response::builder().status(200).body("ok").unwrap(),
            ))
        }
    }

    fn chain(injector: TrustInjector) -> (rqm::ClientWithMiddleware, Arc<Mutex<Vec<bool>>>) {
        let recorder = AgentRecorder::default();
        let seen = Arc::clone(&recorder.saw_agent);
        let client = rqm::ClientBuilder::new(reqwest::Client::new())
            .with(injector)
            .with(recorder)
            .build();
        (client, seen)
    }

    #[test]
    fn test_matches_only_test_suffix() {
        let injector = TrustInjector::from_arcs(
            Arc::new(CountingLocator::default()),
            Arc::new(StubProvider::new()),
        );
        let matches = |s: &str| injector.matches(&s.parse().unwrap());
        assert!(matches("https://app.test/"));
        assert!(matches("https://API.Example.TEST/path"));
        assert!(matches("https://app.test./"));
        assert!(!matches("https://example.com/"));
        assert!(!matches("https://app.testing.com/"));
        assert!(!matches("https://test/"));
        assert!(!matches("http://127.0.0.1:8080/"));
    }

    #[test]
    fn test_custom_suffix() {
        let injector = TrustInjector::from_arcs(
            Arc::new(CountingLocator::default()),
            Arc::new(StubProvider::new()),
        )
        .with_suffix(".LOCALHOST");
        assert!(injector.matches(&"https://app.localhost/".parse().unwrap()));
        assert!(!injector.matches(&"https://app.test/".parse().unwrap()));
    }

    #[test]
    fn test_bundle_debug_redacts_key() {
        let debug = format!("{:?}", self_signed());
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_build_agent_rejects_garbage() {
        let bundle = LocalCaBundle {
            ca: "not a pem".to_owned(),
            cert: "nope".to_owned(),
            key: "nope".to_owned(),
        };
        assert!(matches!(bundle.build_agent(), Err(ResolutionError::Agent(_))));
    }

    #[tokio::test]
    async fn test_agent_starts_from_configured_builder() {
        use wiremock::matchers::header;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(header("x-team", "orders"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let injector = TrustInjector::new(CountingLocator::default(), StubProvider::new())
            .with_agent_builder(|| {
                let mut headers = http::HeaderMap::new();
                headers.insert("x-team", http::HeaderValue::from_static("orders"));
                reqwest::Client::builder().default_headers(headers)
            });
        let agent = injector.resolve_agent().await.unwrap();

        let res = agent.client().get(server.uri()).send().await.unwrap();
        assert_eq!(res.status(), 200);
    }

    #[tokio::test]
    async fn test_local_host_gets_agent() {
        let locator = Arc::new(CountingLocator::default());
        let provider = Arc::new(StubProvider::new());
        let injector = TrustInjector::from_arcs(locator.clone(), provider.clone());
        let (client, seen) = chain(injector);

        let res = client.get("https://app.test/health").send().await.unwrap();
        assert_eq!(res.status(), 200);
        assert_eq!(*seen.lock().unwrap(), vec![true]);
        assert_eq!(locator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *provider.seen.lock().unwrap(),
            vec![(
                PathBuf::from("/opt/bin/mkcert"),
                Some(PathBuf::from("/repo"))
            )]
        );
    }

    #[tokio::test]
    async fn test_public_host_passes_through() {
        let locator = Arc::new(CountingLocator::default());
        let provider = Arc::new(StubProvider::new());
        let injector = TrustInjector::from_arcs(locator.clone(), provider.clone());
        let (client, seen) = chain(injector);

        client.get("https://example.com/").send().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![false]);
        assert_eq!(locator.calls.load(Ordering::SeqCst), 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_locator_failure_fails_request() {
        let locator = Arc::new(CountingLocator {
            fail: true,
            ..CountingLocator::default()
        });
        let provider = Arc::new(StubProvider::new());
        let injector = TrustInjector::from_arcs(locator, provider.clone());
        let (client, seen) = chain(injector);

        let err = match client.get("https://app.test/").send().await.unwrap_err() {
            rqm::Error::Middleware(err) => err,
            other => panic!("expected middleware error, got {other:?}"),
        };
        assert!(matches!(
            err.downcast_ref::<ResolutionError>(),
            Some(ResolutionError::ExecutableNotFound { .. })
        ));
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_bundle_resolved_per_request_by_default() {
        let provider = Arc::new(StubProvider::new());
        let injector =
            TrustInjector::from_arcs(Arc::new(CountingLocator::default()), provider.clone());
        injector.resolve_agent().await.unwrap();
        injector.resolve_agent().await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cached_bundle_resolved_once() {
        let provider = Arc::new(StubProvider::new());
        let injector =
            TrustInjector::from_arcs(Arc::new(CountingLocator::default()), provider.clone())
                .with_cache(true);
        let (client, seen) = chain(injector);

        for _ in 0..3 {
            client.get("https://app.test/").send().await.unwrap();
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), vec![true, true, true]);
    }

    #[tokio::test]
    async fn test_agent_dispatch_without_agent_calls_next() {
        let recorder = AgentRecorder::default();
        let seen = Arc::clone(&recorder.saw_agent);
        let client = rqm::ClientBuilder::new(reqwest::Client::new())
            .with(AgentDispatch)
            .with(recorder)
            .build();

        client.get("https://example.com/").send().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![false]);
    }

    #[cfg(feature = "mkcert")]
    #[tokio::test]
    async fn test_monorepo_locator() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("repo");
        let nested = root.join("apps").join("web");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(root.join("pnpm-workspace.yaml"), "").unwrap();

        let locator = MonorepoLocator::new(&nested, ["pnpm-workspace.yaml"], "tools/mkcert");
        let err = locator.locate().await.unwrap_err();
        assert!(matches!(err, ResolutionError::ExecutableNotFound { .. }));

        std::fs::create_dir_all(root.join("tools")).unwrap();
        std::fs::write(root.join("tools").join("mkcert"), "").unwrap();
        let located = locator.locate().await.unwrap();
        assert_eq!(located.path, root.join("tools").join("mkcert"));
        assert_eq!(located.monorepo_root, Some(root));
    }

    #[cfg(feature = "mkcert")]
    #[tokio::test]
    async fn test_monorepo_locator_without_marker() {
        let dir = tempfile::tempdir().unwrap();
        let locator = MonorepoLocator::new(dir.path(), ["no-such-marker-4f1c"], "mkcert");
        let err = locator.locate().await.unwrap_err();
        assert!(matches!(err, ResolutionError::MonorepoRootNotFound { .. }));
    }

    #[cfg(feature = "mkcert")]
    #[tokio::test]
    async fn test_path_locator_missing_binary() {
        let err = PathLocator::new("definitely-not-installed-mkcert-9a7e")
            .locate()
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionError::ExecutableNotFound { .. }));
    }
}
