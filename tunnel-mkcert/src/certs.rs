//! CA bundle resolution by driving the `mkcert` executable.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::error::MkcertError;

/// File name of the CA certificate inside `mkcert -CAROOT`.
pub const ROOT_CA_FILE: &str = "rootCA.pem";

/// Directory (under the monorepo root) holding the generated leaf pair.
pub const MONOREPO_CACHE_DIR: &str = ".mkcert";

/// Directory (under the CA root) used when no monorepo root is known.
pub const CAROOT_CACHE_DIR: &str = "tunnel";

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";

/// PEM material produced by `mkcert`: CA chain, leaf certificate and key.
#[derive(Clone, PartialEq, Eq)]
pub struct MkcertBundle {
    /// CA certificate chain.
    pub ca: String,
    /// Leaf certificate.
    pub cert: String,
    /// Leaf private key.
    pub key: String,
}

impl std::fmt::Debug for MkcertBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MkcertBundle")
            .field("ca", &format!("<{} bytes>", self.ca.len()))
            .field("cert", &format!("<{} bytes>", self.cert.len()))
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Resolves the local CA bundle through an installed `mkcert`.
///
/// The leaf pair is generated once per cache directory and reused after
/// that; the CA certificate is always read fresh from `mkcert -CAROOT`.
#[derive(Debug, Clone)]
pub struct Mkcert {
    hosts: Vec<String>,
}

impl Default for Mkcert {
    fn default() -> Self {
        Self {
            hosts: Self::DEFAULT_HOSTS.iter().map(|h| (*h).to_owned()).collect(),
        }
    }
}

impl Mkcert {
    /// Hosts the generated leaf certificate is valid for.
    pub const DEFAULT_HOSTS: &'static [&'static str] = &["localhost", "*.test", "127.0.0.1", "::1"];

    /// Creates a resolver with [`Self::DEFAULT_HOSTS`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the hosts the leaf certificate is generated for.
    #[must_use]
    pub fn with_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Returns the configured leaf hosts.
    #[must_use]
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Asks `mkcert` where its CA lives.
    ///
    /// # Errors
    ///
    /// Returns [`MkcertError`] if `mkcert` cannot be run or exits non-zero.
    pub async fn caroot(&self, bin: &Path) -> Result<PathBuf, MkcertError> {
        let stdout = run(bin, &["-CAROOT".to_owned()]).await?;
        Ok(PathBuf::from(stdout.trim()))
    }

    /// Returns the `{ca, cert, key}` bundle, generating the leaf pair if it
    /// is not cached yet.
    ///
    /// With a `monorepo_root` the pair is cached in `<root>/.mkcert`,
    /// otherwise in `<CAROOT>/tunnel`.
    ///
    /// # Errors
    ///
    /// Returns [`MkcertError`] if `mkcert` fails or a file cannot be read.
    pub async fn certs(
        &self,
        bin: &Path,
        monorepo_root: Option<&Path>,
    ) -> Result<MkcertBundle, MkcertError> {
        let caroot = self.caroot(bin).await?;
        let ca = read(&caroot.join(ROOT_CA_FILE)).await?;

        let cache_dir = monorepo_root.map_or_else(
            || caroot.join(CAROOT_CACHE_DIR),
            |root| root.join(MONOREPO_CACHE_DIR),
        );
        let cert_path = cache_dir.join(CERT_FILE);
        let key_path = cache_dir.join(KEY_FILE);

        if !(cert_path.is_file() && key_path.is_file()) {
            tokio::fs::create_dir_all(&cache_dir)
                .await
                .map_err(|source| MkcertError::Io {
                    path: cache_dir.clone(),
                    source,
                })?;

            #[cfg(feature = "telemetry")]
            tracing::info!(dir = %cache_dir.display(), hosts = ?self.hosts, "generating mkcert leaf certificate");

            let mut args = vec![
                "-cert-file".to_owned(),
                cert_path.display().to_string(),
                "-key-file".to_owned(),
                key_path.display().to_string(),
            ];
            args.extend(self.hosts.iter().cloned());
            run(bin, &args).await?;
        }

        Ok(MkcertBundle {
            ca,
            cert: read(&cert_path).await?,
            key: read(&key_path).await?,
        })
    }
}

async fn run(bin: &Path, args: &[String]) -> Result<String, MkcertError> {
    let output = Command::new(bin)
        .args(args)
        .output()
        .await
        .map_err(|source| MkcertError::Spawn {
            bin: bin.to_path_buf(),
            source,
        })?;

    if !output.status.success() {
        return Err(MkcertError::CommandFailed {
            bin: bin.to_path_buf(),
            args: args.join(" "),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn read(path: &Path) -> Result<String, MkcertError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| MkcertError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn write_script(path: &Path, body: &str) {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file.sync_all().unwrap();
        drop(file);
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    // Spawning freshly written scripts from parallel tests can hit ETXTBSY,
    // so the whole flow lives in one test.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_certs_with_fake_mkcert() {
        let caroot = tempfile::tempdir().unwrap();
        std::fs::write(caroot.path().join(ROOT_CA_FILE), "CA PEM").unwrap();

        let bin_dir = tempfile::tempdir().unwrap();
        let bin = bin_dir.path().join("mkcert");
        write_script(
            &bin,
            &format!(
                "#!/bin/sh\n\
                 if [ \"$1\" = \"-CAROOT\" ]; then echo '{}'; exit 0; fi\n\
                 echo \"CERT $5 $6\" > \"$2\"\n\
                 echo KEY > \"$4\"\n",
                caroot.path().display()
            ),
        );

        let mkcert = Mkcert::new().with_hosts(["localhost", "*.test"]);
        assert_eq!(mkcert.caroot(&bin).await.unwrap(), caroot.path());

        // Without a monorepo root the pair lands under CAROOT.
        let bundle = mkcert.certs(&bin, None).await.unwrap();
        assert_eq!(bundle.ca, "CA PEM");
        assert_eq!(bundle.cert.trim(), "CERT localhost *.test");
        assert_eq!(bundle.key.trim(), "KEY");
        assert!(caroot.path().join(CAROOT_CACHE_DIR).join(CERT_FILE).is_file());

        // With a monorepo root, an existing pair is reused as-is.
        let root = tempfile::tempdir().unwrap();
        let cache = root.path().join(MONOREPO_CACHE_DIR);
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join(CERT_FILE), "CACHED CERT").unwrap();
        std::fs::write(cache.join(KEY_FILE), "CACHED KEY").unwrap();

        let bundle = mkcert.certs(&bin, Some(root.path())).await.unwrap();
        assert_eq!(bundle.cert, "CACHED CERT");
        assert_eq!(bundle.key, "CACHED KEY");

        // A failing executable surfaces its exit status and stderr.
        let failing = bin_dir.path().join("broken-mkcert");
        write_script(&failing, "#!/bin/sh\necho 'no CA installed' >&2\nexit 3\n");
        let err = mkcert.certs(&failing, None).await.unwrap_err();
        match err {
            MkcertError::CommandFailed { args, stderr, .. } => {
                assert_eq!(args, "-CAROOT");
                assert_eq!(stderr, "no CA installed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_certs_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let err = Mkcert::new()
            .certs(&dir.path().join("missing-mkcert"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MkcertError::Spawn { .. }));
    }

    #[test]
    fn test_bundle_debug_hides_key() {
        let bundle = MkcertBundle {
            ca: "ca".to_owned(),
            cert: "cert".to_owned(),
            key: "super-secret".to_owned(),
        };
        let debug = format!("{bundle:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("<redacted>"));
    }
}
