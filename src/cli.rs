//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use partfetch_core::download::constants::{DEFAULT_MAX_ATTEMPTS, DEFAULT_TIMEOUT_SECS};

/// Default number of segments.
const DEFAULT_PARTS: u8 = 2;

/// Fetch a file over HTTP in parallel byte ranges.
///
/// Interrupted downloads leave a session file next to the output; pass it to
/// --continue to pick up where the previous run stopped.
#[derive(Parser, Debug)]
#[command(name = "partfetch")]
#[command(author, version, about)]
pub struct Args {
    /// URL to download (taken from the session file with --continue)
    #[arg(required_unless_present = "resume")]
    pub url: Option<String>,

    /// Number of parallel segments (1-32)
    #[arg(short, long, default_value_t = DEFAULT_PARTS, value_parser = clap::value_parser!(u8).range(1..=32))]
    pub parts: u8,

    /// Initial per-attempt idle timeout in seconds (1-600)
    #[arg(short, long, default_value_t = DEFAULT_TIMEOUT_SECS, value_parser = clap::value_parser!(u64).range(1..=600))]
    pub timeout: u64,

    /// Attempts per segment before giving up (1-100)
    #[arg(short = 'r', long, default_value_t = DEFAULT_MAX_ATTEMPTS, value_parser = clap::value_parser!(u32).range(1..=100))]
    pub max_retries: u32,

    /// Output file (defaults to the last URL path segment)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Extra request header as `Name: value` (repeatable)
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Override the User-Agent header
    #[arg(short = 'U', long)]
    pub user_agent: Option<String>,

    /// Resume from a saved session file
    #[arg(short = 'c', long = "continue", value_name = "FILE")]
    pub resume: Option<PathBuf>,

    /// Suppress progress bars and non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Parses `Name: value` into a header pair.
fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected `Name: value`, got `{raw}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in `{raw}`"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_default_args_parses_successfully() {
        let args = Args::try_parse_from(["partfetch", "http://example.com/f.bin"]).unwrap();
        assert_eq!(args.url.as_deref(), Some("http://example.com/f.bin"));
        assert_eq!(args.parts, 2);
        assert_eq!(args.timeout, 15); // DEFAULT_TIMEOUT_SECS
        assert_eq!(args.max_retries, 10); // DEFAULT_MAX_ATTEMPTS
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        assert!(args.headers.is_empty());
        assert!(args.resume.is_none());
    }

    #[test]
    fn test_cli_url_required_without_continue() {
        let result = Args::try_parse_from(["partfetch"]);
        let err = result.unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_cli_continue_makes_url_optional() {
        let args = Args::try_parse_from(["partfetch", "-c", "f.bin.partfetch.json"]).unwrap();
        assert!(args.url.is_none());
        assert_eq!(args.resume, Some(PathBuf::from("f.bin.partfetch.json")));

        let args = Args::try_parse_from(["partfetch", "--continue", "s.json"]).unwrap();
        assert_eq!(args.resume, Some(PathBuf::from("s.json")));
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["partfetch", "-v", "u"]).unwrap();
        assert_eq!(args.verbose, 1);

        let args = Args::try_parse_from(["partfetch", "-vvv", "u"]).unwrap();
        assert_eq!(args.verbose, 3);
    }

    #[test]
    fn test_cli_quiet_flag_sets_quiet() {
        let args = Args::try_parse_from(["partfetch", "-q", "u"]).unwrap();
        assert!(args.quiet);

        let args = Args::try_parse_from(["partfetch", "--quiet", "u"]).unwrap();
        assert!(args.quiet);
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let result = Args::try_parse_from(["partfetch", "--help"]);
        let err = result.unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_cli_version_flag_shows_version() {
        let result = Args::try_parse_from(["partfetch", "--version"]);
        let err = result.unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[test]
    fn test_cli_parts_range() {
        let args = Args::try_parse_from(["partfetch", "-p", "1", "u"]).unwrap();
        assert_eq!(args.parts, 1);
        let args = Args::try_parse_from(["partfetch", "--parts", "32", "u"]).unwrap();
        assert_eq!(args.parts, 32);

        assert!(Args::try_parse_from(["partfetch", "-p", "0", "u"]).is_err());
        assert!(Args::try_parse_from(["partfetch", "-p", "33", "u"]).is_err());
    }

    #[test]
    fn test_cli_timeout_range() {
        let args = Args::try_parse_from(["partfetch", "-t", "600", "u"]).unwrap();
        assert_eq!(args.timeout, 600);

        assert!(Args::try_parse_from(["partfetch", "-t", "0", "u"]).is_err());
        assert!(Args::try_parse_from(["partfetch", "-t", "601", "u"]).is_err());
    }

    #[test]
    fn test_cli_max_retries_range() {
        let args = Args::try_parse_from(["partfetch", "-r", "1", "u"]).unwrap();
        assert_eq!(args.max_retries, 1);
        let args = Args::try_parse_from(["partfetch", "--max-retries", "100", "u"]).unwrap();
        assert_eq!(args.max_retries, 100);

        assert!(Args::try_parse_from(["partfetch", "-r", "0", "u"]).is_err());
        assert!(Args::try_parse_from(["partfetch", "-r", "101", "u"]).is_err());
    }

    #[test]
    fn test_cli_headers_are_repeatable() {
        let args = Args::try_parse_from([
            "partfetch",
            "-H",
            "Authorization: Bearer abc",
            "--header",
            "X-Trace:1",
            "u",
        ])
        .unwrap();
        assert_eq!(
            args.headers,
            vec![
                ("Authorization".to_string(), "Bearer abc".to_string()),
                ("X-Trace".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn test_cli_header_without_colon_is_rejected() {
        let result = Args::try_parse_from(["partfetch", "-H", "nocolon", "u"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_header_rejects_empty_name() {
        assert!(parse_header(": value").is_err());
        assert_eq!(
            parse_header("Accept:  */* ").unwrap(),
            ("Accept".to_string(), "*/*".to_string())
        );
    }

    #[test]
    fn test_cli_output_and_user_agent() {
        let args =
            Args::try_parse_from(["partfetch", "-o", "out.iso", "-U", "agent/1", "u"]).unwrap();
        assert_eq!(args.output, Some(PathBuf::from("out.iso")));
        assert_eq!(args.user_agent.as_deref(), Some("agent/1"));
    }
}
