//! Sends one HTTP request through a `tunnel-http` client.
//!
//! `.test` hosts are trusted through the local `mkcert` CA, and failures are
//! printed as enriched messages.
//!
//! # Usage
//!
//! ```bash
//! # Plain GET
//! tunnel-fetch https://api.example.test/health
//!
//! # POST relative to a prefix, hiding the prefix and query in errors
//! tunnel-fetch --prefix-url https://api.example.test/v1/ --no-prefix-url \
//!     -X POST -H 'content-type: application/json' -d '{"name":"x"}' items?dry_run=1
//!
//! # Show debug lines from the client
//! RUST_LOG=tunnel_http=debug tunnel-fetch https://app.test/
//! ```
//!
//! # Environment Variables
//!
//! - `TUNNEL_HTTP_CONFIG` — Path to the TOML options file (default: `tunnel-http.toml`)
//! - `TUNNEL_FETCH_PREFIX_URL` — Default for `--prefix-url`
//! - `TUNNEL_HTTP_ENV` / `APP_ENV` — `production` silences per-request debug lines
//! - `RUST_LOG` — Log level filter (default: `info`)

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use http::Method;
use tracing_subscriber::EnvFilter;
use tunnel_http::{ClientOptions, ConfigError, HttpClient, RequestContext, RequestError};

#[derive(Debug, Parser)]
#[command(name = "tunnel-fetch", version, about = "Send one request through tunnel-http")]
struct Cli {
    /// Absolute URL, or a path joined onto --prefix-url
    url: String,

    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET", value_parser = parse_method)]
    method: Method,

    /// Prefix joined in front of the URL argument
    #[arg(long, env = "TUNNEL_FETCH_PREFIX_URL")]
    prefix_url: Option<String>,

    /// TOML options file
    #[arg(long, env = "TUNNEL_HTTP_CONFIG")]
    config: Option<PathBuf>,

    /// Request header, repeatable
    #[arg(short = 'H', long = "header", value_name = "NAME:VALUE", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Request body
    #[arg(short, long)]
    data: Option<String>,

    /// Drop the query string from URLs in error messages
    #[arg(long)]
    no_search_params: bool,

    /// Drop the prefix URL from URLs in error messages
    #[arg(long)]
    no_prefix_url: bool,

    /// Cap on the response body shown in error messages
    #[arg(long)]
    max_response_length: Option<usize>,

    /// Also print the error stack on failure
    #[arg(long)]
    stack: bool,
}

impl Cli {
    /// Applies flag overrides on top of the loaded options.
    fn apply(&self, mut options: ClientOptions) -> ClientOptions {
        if self.no_search_params {
            options.log_with_search_params = false;
        }
        if self.no_prefix_url {
            options.log_with_prefix_url = false;
        }
        if let Some(max) = self.max_response_length {
            options.max_response_length = max;
        }
        options
    }
}

#[derive(Debug, thiserror::Error)]
enum FetchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("failed to read response body: {0}")]
    Body(#[source] reqwest::Error),
}

fn parse_method(value: &str) -> Result<Method, String> {
    value
        .to_ascii_uppercase()
        .parse()
        .map_err(|_| format!("invalid HTTP method `{value}`"))
}

fn parse_header(value: &str) -> Result<(String, String), String> {
    value
        .split_once(':')
        .map(|(name, value)| (name.trim().to_owned(), value.trim().to_owned()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("expected NAME:VALUE, got `{value}`"))
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli).await {
        Ok(body) => {
            print_body(&body);
            ExitCode::SUCCESS
        }
        Err(e) => {
            print_error(&e, cli.stack);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<String, FetchError> {
    let options = match &cli.config {
        Some(path) => ClientOptions::load_from(path)?,
        None => ClientOptions::load()?,
    };
    let options = cli.apply(options);
    tracing::debug!(?options, "loaded client options");

    let mut builder = HttpClient::builder().options(options);
    if let Some(prefix_url) = &cli.prefix_url {
        builder = builder.prefix_url(prefix_url);
    }
    let client = builder.build();

    let mut request = client
        .request(cli.method.clone(), &cli.url)
        .context(RequestContext::now().with_call_site());
    for (name, value) in &cli.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(data) = &cli.data {
        request = request.body(data.clone());
    }

    let response = request.send().await?;
    tracing::info!(status = response.status().as_u16(), "request finished");
    response.text().await.map_err(FetchError::Body)
}

#[allow(clippy::print_stdout)]
fn print_body(body: &str) {
    println!("{body}");
}

#[allow(clippy::print_stderr)]
fn print_error(err: &FetchError, with_stack: bool) {
    eprintln!("{err}");
    if with_stack && let FetchError::Request(request_error) = err {
        eprintln!("\n{}", request_error.stack());
    }
}
