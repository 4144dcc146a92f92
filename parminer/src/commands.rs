use crate::CLAP_STYLING;
use clap::{ArgAction, arg, command};
use parminer_core::persist::DEFAULT_OUTPUT_DIR;

pub fn command_argument_builder() -> clap::Command {
    clap::Command::new("parminer")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("parminer")
        .styles(CLAP_STYLING)
        .arg(
            arg!(-q --"quiet" "Suppress banner and non-essential output")
                .required(false)
                .global(true),
        )
        .arg(
            arg!(-v --"verbose" "Increase log verbosity (-v info, -vv debug)")
                .required(false)
                .action(ArgAction::Count)
                .global(true),
        )
        .arg_required_else_help(true)
        .subcommand(
            command!("scan")
                .about(
                    "Crawl a domain and mine every page for input fields, hidden parameters, \
                network traffic, script endpoints and reflected values.",
                )
                .arg(
                    arg!(-u --"url" <URL>)
                        .required(false)
                        .help("The seed URL (https:// is assumed when no scheme is given)")
                        .conflicts_with("hosts-file"),
                )
                .arg(
                    arg!(-H --"hosts-file" <PATH>)
                        .required(false)
                        .help("Path to a newline-delimited file of seed URLs, one run per URL")
                        .value_parser(clap::value_parser!(std::path::PathBuf))
                        .conflicts_with("url"),
                )
                .group(
                    clap::ArgGroup::new("target")
                        .args(["url", "hosts-file"])
                        .required(true),
                )
                .arg(
                    arg!(-d --"depth" <DEPTH>)
                        .required(false)
                        .help("Maximum link depth from the seed")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("2"),
                )
                .arg(
                    arg!(--"no-crawl")
                        .required(false)
                        .help("Only analyse the seed page")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    arg!(-s --"stages" <STAGES>)
                        .required(false)
                        .help(
                            "Comma-separated stages to run: input_fields, hidden_parameters, \
                        network_transactions, js_scan, reflected_probe (default: all)",
                        ),
                )
                .arg(
                    arg!(--"rps" <REQUESTS>)
                        .required(false)
                        .help("Maximum requests per second against the target, 0 for unlimited")
                        .value_parser(clap::value_parser!(u32))
                        .default_value("8"),
                )
                .arg(
                    arg!(-t --"timeout" <SECONDS>)
                        .required(false)
                        .help("Per-request timeout in seconds")
                        .value_parser(clap::value_parser!(u64))
                        .default_value("30"),
                )
                .arg(
                    arg!(-b --"budget" <SECONDS>)
                        .required(false)
                        .help("Wall-clock limit for each run; the partial report is kept")
                        .value_parser(clap::value_parser!(u64)),
                )
                .arg(
                    arg!(-o --"output" <DIR>)
                        .required(false)
                        .help("Directory for the JSON reports")
                        .default_value(DEFAULT_OUTPUT_DIR),
                )
                .arg(
                    arg!(-m --"marker" <MARKER>)
                        .required(false)
                        .help("Probe value injected when testing for reflection"),
                )
                .arg(
                    arg!(-A --"user-agent" <AGENT>)
                        .required(false)
                        .help("User-Agent sent by both the crawler and the prober"),
                )
                .arg(
                    arg!(--"header" <HEADER>)
                        .required(false)
                        .help("Extra request header as 'Name: value' (repeatable)")
                        .action(ArgAction::Append),
                )
                .arg(
                    arg!(-f --"format" <FORMAT>)
                        .required(false)
                        .help("Report format printed to the terminal: text, json")
                        .value_parser(["text", "json"])
                        .default_value("text"),
                ),
        )
}
