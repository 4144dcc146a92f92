use parminer::command_argument_builder;
use parminer::handlers::*;
use parminer_scanner::{Stage, StageMask};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::NamedTempFile;

fn scan_matches(args: &[&str]) -> clap::ArgMatches {
    let mut argv = vec!["parminer", "scan"];
    argv.extend_from_slice(args);
    let matches = command_argument_builder().try_get_matches_from(argv).unwrap();
    matches.subcommand_matches("scan").unwrap().clone()
}

// ============================================================================
// URL loading
// ============================================================================

#[test]
fn test_parse_url_line_with_scheme() {
    let result = parse_url_line("http://example.com");
    assert_eq!(result, Some("http://example.com".to_string()));
}

#[test]
fn test_parse_url_line_without_scheme() {
    let result = parse_url_line("example.com/login");
    assert_eq!(result, Some("https://example.com/login".to_string()));
}

#[test]
fn test_parse_url_line_invalid() {
    assert_eq!(parse_url_line("not a valid url!!!"), None);
}

#[test]
fn test_load_urls_from_file() -> Result<(), Box<dyn std::error::Error>> {
    let mut temp_file = NamedTempFile::new()?;
    writeln!(temp_file, "https://example.com")?;
    writeln!(temp_file, "# staging")?;
    writeln!(temp_file, "staging.example.com")?;
    writeln!(temp_file)?;
    writeln!(temp_file, "  https://api.example.com  ")?;

    let path = PathBuf::from(temp_file.path());
    let urls = load_urls_from_file(&path)?;

    assert_eq!(
        urls,
        vec![
            "https://example.com",
            "https://staging.example.com",
            "https://api.example.com"
        ]
    );
    Ok(())
}

#[test]
fn test_load_urls_from_file_empty() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file).unwrap();
    writeln!(temp_file, "   ").unwrap();

    let path = PathBuf::from(temp_file.path());
    let err = load_urls_from_file(&path).unwrap_err();
    assert!(err.contains("No valid URLs"));
}

#[test]
fn test_load_urls_from_missing_file() {
    let path = PathBuf::from("/nonexistent/hosts.txt");
    assert!(load_urls_from_file(&path).is_err());
}

#[test]
fn test_load_urls_from_source_prefers_file() -> Result<(), Box<dyn std::error::Error>> {
    let mut temp_file = NamedTempFile::new()?;
    writeln!(temp_file, "a.example.com")?;
    let path = PathBuf::from(temp_file.path());
    let url = "b.example.com".to_string();

    let urls = load_urls_from_source(Some(&url), Some(&path))?;
    assert_eq!(urls, vec!["https://a.example.com"]);
    Ok(())
}

#[test]
fn test_load_urls_from_source_requires_input() {
    assert!(load_urls_from_source(None, None).is_err());
}

// ============================================================================
// Headers
// ============================================================================

#[test]
fn test_parse_header() {
    assert_eq!(
        parse_header("X-Researcher-Username: alice").unwrap(),
        ("X-Researcher-Username".to_string(), "alice".to_string())
    );
}

#[test]
fn test_parse_header_keeps_colons_in_value() {
    let (name, value) = parse_header("Referer: https://example.com/").unwrap();
    assert_eq!(name, "Referer");
    assert_eq!(value, "https://example.com/");
}

#[test]
fn test_parse_header_rejects_malformed() {
    assert!(parse_header("no separator").is_err());
    assert!(parse_header(": value").is_err());
}

// ============================================================================
// Argument mapping
// ============================================================================

#[test]
fn test_defaults_map_to_default_options() {
    let options = options_from_matches(&scan_matches(&["-u", "example.com"])).unwrap();
    assert_eq!(options.max_depth, 2);
    assert!(options.crawl);
    assert_eq!(options.stages, StageMask::ALL);
    assert_eq!(options.requests_per_second, 8);
    assert_eq!(options.budget, None);
}

#[test]
fn test_flags_map_onto_options() {
    let matches = scan_matches(&[
        "-u",
        "example.com",
        "--depth",
        "4",
        "--no-crawl",
        "--stages",
        "inputs,reflected",
        "--rps",
        "2",
        "--timeout",
        "5",
        "--budget",
        "60",
        "--marker",
        "zz9",
        "--user-agent",
        "researcher",
        "--header",
        "X-Researcher-Username: alice",
        "--header",
        "Cookie: session=1",
    ]);
    let options = options_from_matches(&matches).unwrap();

    assert_eq!(options.max_depth, 4);
    assert_eq!(options.effective_depth(), 0);
    assert!(options.stages.contains(Stage::InputFields));
    assert!(options.stages.contains(Stage::ReflectedProbe));
    assert!(!options.stages.contains(Stage::JsScan));
    assert_eq!(options.requests_per_second, 2);
    assert_eq!(options.renderer.timeout, Duration::from_secs(5));
    assert_eq!(options.budget, Some(Duration::from_secs(60)));
    assert_eq!(options.probe.marker, "zz9");
    assert_eq!(options.probe_client.user_agent, "researcher");
    assert_eq!(options.renderer.headers.len(), 2);
}

#[test]
fn test_zero_rps_means_unlimited() {
    let options = options_from_matches(&scan_matches(&["-u", "example.com", "--rps", "0"])).unwrap();
    assert_eq!(options.requests_per_second, 0);
    assert!(parminer_scanner::RateLimiter::new(options.requests_per_second).is_unlimited());
}

#[test]
fn test_quiet_accepted_after_subcommand() {
    let matches = command_argument_builder()
        .try_get_matches_from(["parminer", "scan", "-u", "example.com", "-q"])
        .unwrap();
    assert!(matches.get_flag("quiet"));

    let before = command_argument_builder()
        .try_get_matches_from(["parminer", "-q", "scan", "-u", "example.com"])
        .unwrap();
    assert!(before.get_flag("quiet"));
}

#[test]
fn test_unknown_stage_is_rejected() {
    let matches = scan_matches(&["-u", "example.com", "--stages", "fuzz"]);
    assert!(options_from_matches(&matches).is_err());
}

#[test]
fn test_scan_requires_target() {
    let result = command_argument_builder().try_get_matches_from(["parminer", "scan"]);
    assert!(result.is_err());
}

#[test]
fn test_url_and_hosts_file_conflict() {
    let result = command_argument_builder().try_get_matches_from([
        "parminer", "scan", "-u", "example.com", "-H", "hosts.txt",
    ]);
    assert!(result.is_err());
}

#[test]
fn test_verbosity_filter() {
    assert_eq!(verbosity_filter(0), "warn");
    assert_eq!(verbosity_filter(1), "info");
    assert_eq!(verbosity_filter(3), "debug");
}
