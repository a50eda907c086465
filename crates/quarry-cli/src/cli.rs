use std::path::PathBuf;

use clap::{ArgAction, Args, Parser};

#[derive(Parser, Debug)]
#[command(
    name = "quarry",
    author,
    version,
    about = "Find and download packages from a PEP 508 requirement string."
)]
#[allow(clippy::struct_excessive_bools)]
pub struct QuarryCli {
    #[arg(help = "A PEP 508 requirement string, e.g. 'requests>=2.18.4'")]
    pub requirement: String,
    #[arg(short, long, action = ArgAction::Count, help = "Increase logging (-vv reaches trace)")]
    pub verbose: u8,
    #[arg(
        short = 'i',
        long = "index-url",
        value_name = "URL",
        help = "(Multiple) simple index URLs; defaults to QUARRY_INDEX_URL"
    )]
    pub index_urls: Vec<String>,
    #[arg(long, help = "Ignore the default index and only use --find-link locations")]
    pub no_index: bool,
    #[arg(
        short = 'f',
        long = "find-link",
        value_name = "LOCATION",
        help = "(Multiple) URLs or local directories to find links from"
    )]
    pub find_links: Vec<String>,
    #[arg(
        long = "trusted-host",
        value_name = "HOST",
        help = "(Multiple) hosts that skip certificate verification"
    )]
    pub trusted_hosts: Vec<String>,
    #[arg(long, help = "Exclude binary packages from the results")]
    pub no_binary: bool,
    #[arg(long, help = "Only include binary packages in the results")]
    pub only_binary: bool,
    #[arg(
        long,
        help = "Prefer binary packages even if sdists of newer versions exist"
    )]
    pub prefer_binary: bool,
    #[arg(
        long,
        help = "Rank each source on its own and keep the configured source order"
    )]
    pub respect_source_order: bool,
    #[arg(long, help = "Return all applicable versions")]
    pub all: bool,
    #[arg(
        short = 'L',
        long,
        help = "Only print links instead of a JSON object"
    )]
    pub link_only: bool,
    #[arg(
        short = 'd',
        long,
        value_name = "DIR",
        num_args = 0..=1,
        default_missing_value = ".",
        help = "Download the package(s) to DIR"
    )]
    pub download: Option<PathBuf>,
    #[command(flatten)]
    pub target: TargetArgs,
}

#[derive(Args, Debug, Default)]
#[command(next_help_heading = "Target Python options")]
pub struct TargetArgs {
    #[arg(
        long = "python-version",
        visible_alias = "py",
        value_name = "VERSION",
        help = "Target Python version, e.g. 3.11"
    )]
    pub python_version: Option<String>,
    #[arg(
        long,
        value_delimiter = ',',
        help = "Comma-separated list of ABIs, e.g. cp39,cp310"
    )]
    pub abis: Option<Vec<String>>,
    #[arg(
        long,
        visible_alias = "impl",
        help = "Python implementation, e.g. cp,pp"
    )]
    pub implementation: Option<String>,
    #[arg(
        long,
        value_delimiter = ',',
        help = "Comma-separated list of platforms, e.g. win_amd64,linux_x86_64"
    )]
    pub platforms: Option<Vec<String>>,
}
