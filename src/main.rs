//! CLI entry point for partfetch.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use indicatif::{HumanBytes, MultiProgress, ProgressDrawTarget};
use partfetch_core::download::{
    ClientOptions, DownloadError, Segment, SegmentDownloader, build_client, probe,
};
use partfetch_core::progress::{BarFactory, ProgressSink, RetryState};
use partfetch_core::session::Session;
use reqwest::cookie::Jar;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

mod cli;

use cli::Args;

/// Output name used when the URL path has no usable last segment.
const FALLBACK_OUTPUT: &str = "download.bin";

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (warn,
    // so log lines do not tear through the progress bars)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let client = build_client(&ClientOptions {
        user_agent: args.user_agent.clone(),
        cookie_jar: Some(Arc::new(Jar::default())),
        ..ClientOptions::default()
    })
    .context("failed to build HTTP client")?;

    let mut session = match &args.resume {
        Some(path) => {
            let mut session = Session::load(path)?.with_max_attempts(args.max_retries);
            session.reconcile()?;
            info!(url = %session.url, written = session.written(), "resuming session");
            session
        }
        None => {
            let url = args
                .url
                .clone()
                .ok_or_else(|| anyhow!("a URL is required"))?;
            let template = request_template(&client, &url, &args.headers)?;
            let probed = probe(&client, &template).await?;
            let output = args
                .output
                .clone()
                .unwrap_or_else(|| default_output(&url));

            if probed.content_length == Some(0) {
                tokio::fs::File::create(&output)
                    .await
                    .with_context(|| format!("failed to create {}", output.display()))?;
                report(args.quiet, &output, 0);
                return Ok(());
            }

            let parts = if probed.accepts_ranges && probed.content_length.is_some() {
                usize::from(args.parts)
            } else {
                info!("server does not support ranges; using a single segment");
                1
            };
            Session::new(url, output, probed.content_length, parts)?
                .with_max_attempts(args.max_retries)
        }
    };
    let template = request_template(&client, &session.url, &args.headers)?;

    let multi = if args.quiet {
        MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
    } else {
        MultiProgress::new()
    };
    let retry_state = Arc::new(RetryState::new());
    let factory = Arc::new(BarFactory::new(multi, Arc::clone(&retry_state)).quiet(args.quiet));
    let total = factory.total_bar(session.content_length.unwrap_or(0));
    total.set_position(session.written());

    let downloader = SegmentDownloader::new(client)
        .with_aggregate(Arc::new(total.clone()))
        .with_retry_state(Arc::clone(&retry_state));

    let scope = CancellationToken::new();
    let interrupt = scope.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; stopping segments");
            interrupt.cancel();
        }
    });

    let timeout = Duration::from_secs(args.timeout);
    let mut tasks = Vec::with_capacity(session.parts.len());
    for part in session.parts.drain(..) {
        let downloader = downloader.clone();
        let factory = Arc::clone(&factory);
        let scope = scope.clone();
        let request = template
            .try_clone()
            .ok_or_else(|| anyhow!("request cannot be cloned"))?;
        tasks.push(tokio::spawn(async move {
            let mut part = part;
            let result = downloader
                .download(&mut part, &scope, factory.as_ref(), &request, timeout)
                .await;
            (part, result)
        }));
    }

    let mut failures: Vec<(String, DownloadError)> = Vec::new();
    for task in tasks {
        let (part, result) = task.await.context("segment task panicked")?;
        if let Err(e) = result {
            failures.push((part.name.clone(), e));
        }
        session.parts.push(part);
    }

    if failures.is_empty() && session.is_complete() {
        let bytes = session.assemble().await?;
        total.finish();
        info!(
            bytes,
            retries = retry_state.total_retries(),
            "download complete"
        );
        report(args.quiet, &session.output, bytes);
        return Ok(());
    }

    total.abort(false);
    let saved = session.save()?;
    for (name, e) in &failures {
        error!(segment = %name, error = %e, "segment failed");
    }
    let interrupted =
        !failures.is_empty() && failures.iter().all(|(_, e)| matches!(e, DownloadError::Cancelled));
    if interrupted {
        bail!("interrupted; resume with --continue {}", saved.display());
    }
    bail!(
        "{} of {} segments did not finish; resume with --continue {}",
        incomplete(&session.parts),
        session.parts.len(),
        saved.display()
    );
}

/// Builds the request every segment attempt is cloned from.
fn request_template(
    client: &reqwest::Client,
    url: &str,
    headers: &[(String, String)],
) -> Result<reqwest::Request> {
    let mut builder = client.get(url);
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .build()
        .with_context(|| format!("invalid request for {url}"))
}

/// Last non-empty path segment of `url`, or [`FALLBACK_OUTPUT`].
fn default_output(url: &str) -> PathBuf {
    Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty() && name != "." && name != "..")
        .map_or_else(|| PathBuf::from(FALLBACK_OUTPUT), PathBuf::from)
}

fn incomplete(parts: &[Segment]) -> usize {
    parts
        .iter()
        .filter(|part| !part.skip && !part.is_done())
        .count()
}

fn report(quiet: bool, output: &Path, bytes: u64) {
    if !quiet {
        println!("Saved {} ({})", output.display(), HumanBytes(bytes));
    }
}
