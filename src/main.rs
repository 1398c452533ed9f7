//! kpatchfinder - Find patch sites in a raw 64-bit ARM kernel image.
//!
//! Runs the selected locators against a decompressed kernel and prints one
//! `0x<address> <hex bytes>` line per patch found.

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use kpatchfinder::{FinderOptions, Locator, Patch, PatchFinder};

/// Signature-based patch finder for 64-bit ARM kernel images.
#[derive(Parser, Debug)]
#[command(name = "kpatchfinder")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the raw, decompressed kernel image
    kernel: PathBuf,

    /// Kernel slide added to every reported address (hex, e.g. 0x4000000)
    #[arg(short, long, value_parser = parse_hex, default_value = "0")]
    slide: u64,

    /// Patch to locate (repeatable). Defaults to every implemented patch.
    /// One of: sandbox, amfi-substrate, cs-enforcement, i-can-has-debugger,
    /// amfi-offsets
    #[arg(short, long = "patch")]
    patches: Vec<Locator>,

    /// Resolve a symbol and print its address (repeatable)
    #[arg(long = "symbol")]
    symbols: Vec<String>,

    /// Write the patches found to this file, one per line
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Maximum instructions visited by any single scan
    #[arg(long, value_parser = parse_hex_or_dec, default_value = "0x10000")]
    max_scan: u64,

    /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug, 4=trace)
    #[arg(short, long, default_value = "1")]
    verbosity: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbosity);

    let start = Instant::now();

    let finder = PatchFinder::open_with_slide(&cli.kernel, cli.slide)
        .with_context(|| format!("Failed to load kernel: {}", cli.kernel.display()))?
        .with_options(FinderOptions {
            max_scan: cli.max_scan as usize,
            verbosity: cli.verbosity,
        });

    for name in &cli.symbols {
        let addr = finder
            .find_symbol(name)
            .with_context(|| format!("Failed to resolve symbol: {}", name))?;
        println!("{:#018x}  {}", addr, name);
    }

    let explicit = !cli.patches.is_empty();
    let results: Vec<_> = if explicit {
        cli.patches
            .iter()
            .map(|&l| (l, finder.find_patch(l)))
            .collect()
    } else {
        finder.find_all_patches()
    };

    let mut found: Vec<Patch> = Vec::new();
    let mut failed = 0usize;
    for (locator, result) in results {
        match result {
            Ok(patch) => {
                println!("{:<20} {}", locator.name(), patch);
                found.push(patch);
            }
            Err(e) => {
                failed += 1;
                if explicit {
                    error!("{}: {}", locator, e);
                }
            }
        }
    }

    if let Some(ref output) = cli.output {
        let diff: String = found.iter().map(|p| format!("{}\n", p)).collect();
        fs::write(output, diff)
            .with_context(|| format!("Failed to write patches: {}", output.display()))?;
        info!("Wrote {} patches to {}", found.len(), output.display());
    }

    info!(
        "Found {} patches ({} failed) in {:.2}s",
        found.len(),
        failed,
        start.elapsed().as_secs_f64()
    );

    if explicit && failed > 0 {
        bail!("{} of {} requested patches not found", failed, cli.patches.len());
    }
    if found.is_empty() {
        bail!("No patches found");
    }

    Ok(())
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Parses a hexadecimal value with an optional `0x` prefix.
fn parse_hex(s: &str) -> Result<u64> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).with_context(|| format!("Invalid hex value: {}", s))
}

/// Parses a value that is hexadecimal with a `0x` prefix, decimal otherwise.
fn parse_hex_or_dec(s: &str) -> Result<u64> {
    if s.starts_with("0x") || s.starts_with("0X") {
        parse_hex(s)
    } else {
        s.parse()
            .with_context(|| format!("Invalid number: {}", s))
    }
}
