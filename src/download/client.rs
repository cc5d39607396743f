//! HTTP client construction and the size probe.
//!
//! Segments share one `reqwest::Client` so connections are pooled. The client
//! has a connect timeout only: per-attempt deadlines are enforced by the
//! segment downloader's idle watchdog, which has to survive long transfers.

use std::panic::{AssertUnwindSafe, catch_unwind, set_hook, take_hook};
use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::Jar;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, HeaderValue, RANGE};
use reqwest::{Client, ClientBuilder, Proxy, Request, StatusCode};
use tracing::{debug, instrument, warn};

use super::constants::CONNECT_TIMEOUT_SECS;
use super::error::DownloadError;

/// Default User-Agent identifying the tool.
#[must_use]
pub fn default_user_agent() -> String {
    format!("partfetch/{}", env!("CARGO_PKG_VERSION"))
}

/// Options for [`build_client`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
    /// User-Agent header; [`default_user_agent`] when `None`.
    pub user_agent: Option<String>,
    /// Cookie store shared across requests.
    pub cookie_jar: Option<Arc<Jar>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            user_agent: None,
            cookie_jar: None,
        }
    }
}

/// Builds the shared HTTP client.
///
/// Some platforms panic inside the system proxy lookup; in that case the
/// build is retried with proxies taken from the environment only.
///
/// # Errors
///
/// Returns the builder error when the client cannot be constructed.
#[instrument(level = "debug", skip(options), fields(ua = options.user_agent.as_deref()))]
pub fn build_client(options: &ClientOptions) -> Result<Client, reqwest::Error> {
    match try_build_client(options, false) {
        Ok(client) => Ok(client),
        Err(BuildClientFailure::Build(error)) => Err(error),
        Err(BuildClientFailure::Panic) => {
            warn!("system proxy lookup panicked; retrying with environment proxies");
            match try_build_client(options, true) {
                Ok(client) => Ok(client),
                Err(BuildClientFailure::Build(error)) => Err(error),
                Err(BuildClientFailure::Panic) => {
                    // last resort: no proxy support at all
                    base_client_builder(options).no_proxy().build()
                }
            }
        }
    }
}

enum BuildClientFailure {
    Panic,
    Build(reqwest::Error),
}

// catch_unwind does not silence the panic hook; serialize hook swaps
static CLIENT_BUILD_PANIC_HOOK_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

fn try_build_client(
    options: &ClientOptions,
    env_proxies_only: bool,
) -> Result<Client, BuildClientFailure> {
    catch_unwind_silent(AssertUnwindSafe(|| {
        let mut builder = base_client_builder(options);
        if env_proxies_only {
            builder = apply_env_proxies(builder.no_proxy());
        }
        builder.build().map_err(BuildClientFailure::Build)
    }))
    .map_err(|_| BuildClientFailure::Panic)?
}

fn catch_unwind_silent<F, T>(operation: F) -> Result<T, Box<dyn std::any::Any + Send + 'static>>
where
    F: FnOnce() -> T + std::panic::UnwindSafe,
{
    let _guard = CLIENT_BUILD_PANIC_HOOK_LOCK
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let previous_hook = take_hook();
    set_hook(Box::new(|_| {}));
    let outcome = catch_unwind(operation);
    set_hook(previous_hook);
    outcome
}

fn base_client_builder(options: &ClientOptions) -> ClientBuilder {
    let user_agent = options
        .user_agent
        .clone()
        .unwrap_or_else(default_user_agent);
    let mut builder = Client::builder()
        .connect_timeout(options.connect_timeout)
        .user_agent(user_agent);
    if let Some(jar) = &options.cookie_jar {
        builder = builder.cookie_provider(Arc::clone(jar));
    }
    builder
}

fn apply_env_proxies(mut builder: ClientBuilder) -> ClientBuilder {
    if let Some(proxy) = env_proxy(&["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"])
        && let Ok(resolved) = Proxy::https(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    if let Some(proxy) = env_proxy(&["HTTP_PROXY", "http_proxy", "ALL_PROXY", "all_proxy"])
        && let Ok(resolved) = Proxy::http(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    builder
}

fn env_proxy(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

/// What the server told us about the resource before splitting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    /// Status of the probe response.
    pub status: u16,
    /// Full resource size, when the server disclosed it.
    pub content_length: Option<u64>,
    /// True when the server answered the probe range with 206.
    pub accepts_ranges: bool,
}

/// Asks for the first byte of the resource to learn its size and whether
/// ranged requests are honored.
///
/// The response body is dropped unread.
///
/// # Errors
///
/// - [`DownloadError::Request`] when the template has a streaming body
/// - [`DownloadError::Network`] when the request cannot be sent
/// - [`DownloadError::Http`] for any status other than 200 or 206
#[instrument(skip(client, template), fields(url = %template.url()))]
pub async fn probe(client: &Client, template: &Request) -> Result<ProbeResult, DownloadError> {
    let url = template.url().to_string();
    let mut request = template
        .try_clone()
        .ok_or_else(|| DownloadError::request("request body cannot be replayed"))?;
    request
        .headers_mut()
        .insert(RANGE, HeaderValue::from_static("bytes=0-0"));

    let response = client
        .execute(request)
        .await
        .map_err(|e| DownloadError::network(&url, e))?;
    let status = response.status();

    let result = match status {
        StatusCode::PARTIAL_CONTENT => ProbeResult {
            status: status.as_u16(),
            content_length: response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_content_range_total),
            accepts_ranges: true,
        },
        StatusCode::OK => ProbeResult {
            status: status.as_u16(),
            content_length: response
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse().ok()),
            accepts_ranges: false,
        },
        other => return Err(DownloadError::http(other.as_u16(), other.to_string())),
    };

    debug!(
        status = result.status,
        content_length = ?result.content_length,
        accepts_ranges = result.accepts_ranges,
        "probe complete"
    );
    Ok(result)
}

/// Extracts the complete length from `bytes <a>-<b>/<total>`.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (unit, rest) = value.trim().split_once(' ')?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return None;
    }
    let (_, total) = rest.split_once('/')?;
    total.trim().parse().ok()
}
