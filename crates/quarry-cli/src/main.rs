use std::{
    fs,
    path::{Path, PathBuf},
};

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use quarry_core::{Config, PackageFinder, SessionOptions};
use quarry_domain::{
    splitext, Link, Package, PackageRecord, PythonVersion, RequirementSpec, TargetPython,
};
use serde::Serialize;

mod cli;

use cli::QuarryCli;

/// One reported match: the package record plus where it landed locally.
#[derive(Debug, Serialize)]
struct MatchOutput {
    #[serde(flatten)]
    record: PackageRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    local_path: Option<String>,
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = QuarryCli::parse();
    init_tracing(cli.verbose);

    let config = Config::from_env().map_err(|err| eyre!("{err:#}"))?;
    let requirement: RequirementSpec = cli
        .requirement
        .parse()
        .map_err(|err| eyre!("{err:#}"))?;
    let finder = build_finder(&cli, &config, &requirement)?;

    let matches = finder.find_matches(&requirement, None, None, None)?;
    let matches: Vec<Package> = if cli.all {
        matches.to_vec()?
    } else {
        matches.first()?.into_iter().collect()
    };
    if matches.is_empty() {
        eprintln!("No matches are found.");
        std::process::exit(1);
    }

    let outputs = collect_outputs(&cli, &finder, &matches)?;
    if cli.link_only {
        for output in &outputs {
            println!("{}", output.record.reference.url);
            if let Some(local_path) = &output.local_path {
                println!("  ==> {local_path}");
            }
        }
    } else if let [single] = outputs.as_slice() {
        println!("{}", serde_json::to_string_pretty(single)?);
    } else {
        println!("{}", serde_json::to_string_pretty(&outputs)?);
    }
    Ok(())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = format!("quarry_cli={level},quarry_core={level},quarry_domain={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn build_finder(
    cli: &QuarryCli,
    config: &Config,
    requirement: &RequirementSpec,
) -> Result<PackageFinder> {
    let python_version = cli
        .target
        .python_version
        .as_deref()
        .map(str::parse::<PythonVersion>)
        .transpose()
        .map_err(|err| eyre!("{err:#}"))?;
    let target_python = TargetPython::new(
        python_version,
        cli.target.abis.clone(),
        cli.target.implementation.clone(),
        cli.target.platforms.clone(),
    )
    .with_host(config.host());

    let name = requirement.name();
    let selected = |enabled: bool| if enabled { vec![name] } else { Vec::new() };
    let mut builder = PackageFinder::builder()
        .session_options(SessionOptions::from_config(config))
        .target_python(target_python)
        .no_binary(selected(cli.no_binary))
        .only_binary(selected(cli.only_binary))
        .prefer_binary(selected(cli.prefer_binary))
        .respect_source_order(cli.respect_source_order);
    if !cli.no_index {
        if cli.index_urls.is_empty() {
            builder = builder.index_url(config.index_url.clone());
        }
        for url in &cli.index_urls {
            builder = builder.index_url(url.clone());
        }
    }
    for location in &cli.find_links {
        builder = builder.find_links(location.clone());
    }
    for host in &cli.trusted_hosts {
        builder = builder.trusted_host(host.clone());
    }
    builder.build().map_err(|err| eyre!("{err:#}"))
}

/// Wheels stay as files in `dest`; anything else unpacks into its own folder.
fn dest_for_package(dest: &Path, link: &Link) -> PathBuf {
    if link.is_wheel() {
        return dest.to_path_buf();
    }
    let filename = link.filename();
    let filename = filename.rsplit_once('@').map_or(filename.as_str(), |(head, _)| head);
    let (stem, _) = splitext(filename);
    dest.join(stem)
}

fn collect_outputs(
    cli: &QuarryCli,
    finder: &PackageFinder,
    matches: &[Package],
) -> Result<Vec<MatchOutput>> {
    let Some(download) = &cli.download else {
        return Ok(matches
            .iter()
            .map(|package| MatchOutput {
                record: package.to_record(),
                local_path: None,
            })
            .collect());
    };
    fs::create_dir_all(download)?;
    let scratch = tempfile::Builder::new()
        .prefix("quarry-download-")
        .tempdir()?;
    let mut outputs = Vec::with_capacity(matches.len());
    for package in matches {
        let dest = dest_for_package(download, package.link());
        let local_path = finder
            .download_and_unpack(package.link(), &dest, Some(scratch.path()), None)
            .map_err(|err| eyre!("{err:#}"))?;
        tracing::debug!(package = %package, path = %local_path.display(), "prepared");
        outputs.push(MatchOutput {
            record: package.to_record(),
            local_path: Some(local_path.display().to_string()),
        });
    }
    Ok(outputs)
}
