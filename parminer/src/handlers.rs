use anyhow::{Context, bail};
use clap::ArgMatches;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use parminer_core::persist::write_report;
use parminer_core::report::render_report;
use parminer_core::{
    CoreError, ReportFormat, RunReport, RunStatus, ScanOptions, ScanProgressCallback, execute_scan,
};
use parminer_scanner::StageMask;
use parminer_scanner::scope::ensure_scheme;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Load URLs from either a file or a single URL argument
pub fn load_urls_from_source(
    url: Option<&String>,
    hosts_file: Option<&PathBuf>,
) -> Result<Vec<String>, String> {
    if let Some(hosts_file_path) = hosts_file {
        load_urls_from_file(hosts_file_path)
    } else if let Some(url) = url {
        parse_url_line(url)
            .map(|u| vec![u])
            .ok_or_else(|| format!("Invalid URL '{}'", url))
    } else {
        Err("Either --url or --hosts-file must be provided".to_string())
    }
}

/// Load and parse URLs from a file, skipping blank lines and `#` comments
pub fn load_urls_from_file(path: &PathBuf) -> Result<Vec<String>, String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read hosts file {}: {}", path.display(), e))?;

    let urls: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(parse_url_line)
        .collect();

    if urls.is_empty() {
        return Err(format!("No valid URLs found in {}", path.display()));
    }

    Ok(urls)
}

/// Parse a single line as an http(s) URL, adding https:// if needed
pub fn parse_url_line(line: &str) -> Option<String> {
    let candidate = ensure_scheme(line);
    match Url::parse(&candidate) {
        Ok(url) if url.host_str().is_some() => Some(candidate),
        _ => {
            eprintln!("{} Skipping invalid URL '{}'", "⚠".yellow(), line);
            None
        }
    }
}

/// Split `Name: value` into a header pair.
pub fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("Header '{}' is not in 'Name: value' form", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("Header '{}' has an empty name", raw));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Map `scan` arguments onto run options.
pub fn options_from_matches(matches: &ArgMatches) -> anyhow::Result<ScanOptions> {
    let mut options = ScanOptions::default()
        .with_max_depth(matches.get_one::<usize>("depth").copied().unwrap_or(2))
        .with_crawl(!matches.get_flag("no-crawl"))
        .with_requests_per_second(matches.get_one::<u32>("rps").copied().unwrap_or(8))
        .with_budget(matches.get_one::<u64>("budget").map(|s| Duration::from_secs(*s)));

    if let Some(timeout) = matches.get_one::<u64>("timeout") {
        options = options.with_timeout(Duration::from_secs(*timeout));
    }
    if let Some(stages) = matches.get_one::<String>("stages") {
        let mask = StageMask::parse_list(stages).with_context(|| format!("--stages {}", stages))?;
        if mask == StageMask::NONE {
            bail!("--stages selects no stage");
        }
        options = options.with_stages(mask);
    }
    if let Some(marker) = matches.get_one::<String>("marker") {
        if marker.is_empty() {
            bail!("--marker must not be empty");
        }
        options = options.with_marker(marker.as_str());
    }
    if let Some(agent) = matches.get_one::<String>("user-agent") {
        options = options.with_user_agent(agent.as_str());
    }
    if let Some(headers) = matches.get_many::<String>("header") {
        for raw in headers {
            let (name, value) = parse_header(raw).map_err(anyhow::Error::msg)?;
            options = options.with_header(name, value);
        }
    }

    Ok(options)
}

/// Log filter for the `-v` count. `RUST_LOG` takes precedence in `main`.
pub fn verbosity_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

pub fn print_banner() {
    println!(
        "{} {}",
        "parminer".bright_magenta().bold(),
        env!("CARGO_PKG_VERSION").bright_black()
    );
    println!("{}", "parameter mining for authorised web testing".bright_black());
    println!();
}

fn print_divider() {
    println!("{}", "═".repeat(60).bright_blue().bold());
}

fn scan_spinner(quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

fn print_outcome(report: &RunReport, path: &Path) {
    let status = match report.status {
        RunStatus::Completed => "✓ Scan complete".green().bold(),
        RunStatus::Cancelled => "⚠ Scan cancelled, partial report kept".yellow().bold(),
    };
    println!("{}", status);
    if !report.valid {
        println!(
            "{} Report failed {} shape check(s)",
            "✗".red().bold(),
            report.violations.len()
        );
    }
    println!(
        "{} Report written to {}",
        "→".blue(),
        path.display().to_string().bright_white()
    );
    println!();
}

pub async fn handle_scan(matches: &ArgMatches, quiet: bool, cancel: CancellationToken) -> anyhow::Result<()> {
    let urls = load_urls_from_source(
        matches.get_one::<String>("url"),
        matches.get_one::<PathBuf>("hosts-file"),
    )
    .map_err(anyhow::Error::msg)?;
    let options = options_from_matches(matches)?;
    let format = matches
        .get_one::<String>("format")
        .and_then(|f| ReportFormat::from_str(f))
        .unwrap_or(ReportFormat::Text);
    let output = matches
        .get_one::<String>("output")
        .map(String::as_str)
        .unwrap_or(parminer_core::persist::DEFAULT_OUTPUT_DIR);
    let output_dir = PathBuf::from(shellexpand::tilde(output).as_ref());

    if !quiet {
        print_divider();
        println!(
            "{} {} target(s), depth {}, stages: {}",
            "→".blue(),
            urls.len(),
            options.effective_depth(),
            options
                .stages
                .stages()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        print_divider();
        println!();
    }

    for url in &urls {
        if cancel.is_cancelled() {
            break;
        }

        let spinner = scan_spinner(quiet);
        spinner.set_message(format!("Scanning {}", url));
        let progress = spinner.clone();
        let callback: ScanProgressCallback = Arc::new(move |msg: String| progress.set_message(msg));

        let result = execute_scan(options.clone(), url, cancel.clone(), Some(callback)).await;
        spinner.finish_and_clear();

        let report = match result {
            Ok(report) => report,
            Err(CoreError::InvalidSeed(reason)) => {
                eprintln!("{} Skipping {}: {}", "✗".red().bold(), url, reason);
                continue;
            }
            Err(e) => return Err(e).context("scan could not start"),
        };

        let path = write_report(&report, &output_dir)
            .with_context(|| format!("writing report to {}", output_dir.display()))?;
        print!("{}", render_report(&report, &format)?);
        if !quiet {
            print_outcome(&report, &path);
        }
    }

    Ok(())
}
