use anyhow::{Context, Result};
use clap::Parser;
use rgsweep::backend::{BackendKind, BackendOptions};
use rgsweep::context::RunContext;
use rgsweep::policy::GainMode;
use rgsweep::scanner::{DirectoryBatches, ScanCounts, ScanError, ScanOptions};
use rgsweep::scheduler::{Scheduler, WorkSource};
use rgsweep::tagwriter::LoftyTagWriter;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "rgsweep", version, about = "Add ReplayGain tags to your music files")]
struct Cli {
    /// Directories (or files) in which to search for music (defaults to config music_dirs)
    music_dirs: Vec<PathBuf>,

    /// Reanalyze all files, even those that already have valid replaygain tags
    #[arg(short, long)]
    force_reanalyze: bool,

    /// Do not skip hidden files and directories
    #[arg(short, long)]
    include_hidden: bool,

    /// Don't modify any files; only analyze and report gain
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// "track" computes track gain only and erases album gain; "album" computes both;
    /// "auto" uses album mode except in directories containing a TRACKGAIN or .TRACKGAIN file
    #[arg(short, long, value_enum)]
    gain_type: Option<GainMode>,

    /// Gain computation backend ("auto" picks the first one available)
    #[arg(short, long, value_enum)]
    backend: Option<BackendKind>,

    /// Number of albums to analyze in parallel (default: number of cores)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Discover and analyze albums one directory at a time instead of scanning everything first
    #[arg(long)]
    low_memory: bool,

    /// Path to the bs1770gain executable
    #[arg(long, env = "BS1770GAIN_PATH")]
    bs1770gain_path: Option<PathBuf>,

    /// Only print warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Print debug messages (-vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

/// Returns whether every work item succeeded.
fn run() -> Result<bool> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = rgsweep::config::AppConfig::load();

    // Resolve music paths: CLI args > config music_dirs
    let paths = if !cli.music_dirs.is_empty() {
        cli.music_dirs.clone()
    } else if !config.music_dirs.is_empty() {
        config.music_dirs.clone()
    } else {
        anyhow::bail!("No music directories given. Pass paths as arguments or set music_dirs in config.");
    };
    let roots = rgsweep::scanner::resolve_roots(&paths).context("No valid music directories")?;

    let backend_opts = BackendOptions {
        bs1770gain_path: cli.bs1770gain_path.clone().or(config.bs1770gain_path.clone()),
    };
    let kind = cli.backend.or(config.backend).unwrap_or_default();
    let backend = rgsweep::backend::select(kind, &backend_opts).context("No usable gain backend")?;
    log::info!("Using the {} backend", backend.name());

    let gain_mode = cli.gain_type.or(config.gain_type).unwrap_or_default();
    let jobs = config.resolve_jobs(cli.jobs);
    let scan_opts = ScanOptions {
        include_hidden: cli.include_hidden,
        extensions: config.extensions().unwrap_or_else(|| ScanOptions::default().extensions),
    };

    let ctx = RunContext::new(cli.dry_run, !cli.quiet);
    let interrupt = ctx.interrupt_handle();
    ctrlc::set_handler(move || {
        if interrupt.interrupt() {
            // Second interrupt: drop unwritten results, but never leave a set half-tagged.
            log::error!("Aborting. Waiting for tag writes in progress to finish...");
            interrupt.abort_and_wait();
            std::process::exit(130);
        }
        log::error!("Canceled. Waiting for running albums to finish (press Ctrl-C again to abort)...");
    })
    .context("Failed to install interrupt handler")?;

    if cli.dry_run {
        log::warn!("Running in dry-run mode, so no files will actually be modified.");
    }
    log::info!(
        "Searching for music files in the following directories:\n{}",
        roots.iter().map(|r| r.display().to_string()).collect::<Vec<_>>().join("\n")
    );

    let counts = Arc::new(ScanCounts::default());
    let mut unreadable = 0;
    let source = if cli.low_memory {
        let batches = DirectoryBatches::new(roots, scan_opts);
        WorkSource::lazy(batches, gain_mode, cli.force_reanalyze, Arc::clone(&counts))
    } else {
        let scanned = rgsweep::scanner::scan(roots, scan_opts, &ctx);
        if scanned.interrupted {
            eprintln!("Interrupted while scanning; no track sets were processed.");
            return Ok(false);
        }
        if scanned.tracks.is_empty() {
            return Err(ScanError::NoTracks.into());
        }
        unreadable = scanned.errors.len();
        let sets = rgsweep::grouping::group(scanned.tracks);
        log::info!("Found {} track sets", sets.len());
        WorkSource::eager(sets, gain_mode, cli.force_reanalyze)
    };

    let writer = LoftyTagWriter;
    let report = Scheduler::new(backend.as_ref(), &writer, jobs)
        .run(source, &ctx)
        .context("Analysis failed")?;

    if cli.low_memory {
        // Same outcome as the eager scan finding nothing.
        if !report.interrupted {
            counts.ensure_tracks()?;
        }
        unreadable = counts.errors();
    }

    println!(
        "Analysis complete: {} analyzed, {} skipped, {} cleaned, {} failed, {} unreadable files",
        report.analyzed,
        report.skipped,
        report.erased,
        report.failed,
        unreadable
    );
    for failure in report.failures() {
        eprintln!("  {}", failure);
    }
    if report.interrupted {
        eprintln!("Interrupted: {} track sets were not processed.", report.cancelled);
    }
    if cli.dry_run {
        log::warn!("Ran in dry-run mode, so no files were actually modified.");
    }

    Ok(report.success())
}
