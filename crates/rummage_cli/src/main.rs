//! # Commands
//!
//! - `rummage filesystem` - Scan files and directories
//! - `rummage git` - Scan a repository's revision history
//!
//! The CLI is a thin shell: it assembles an `EngineConfig` from flags,
//! enrols one source, waits for the scan, and picks an exit code. All
//! scanning behaviour lives in `rummage_core`.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod parse;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{CommandFactory, FromArgMatches, Parser, Subcommand};
use tracing::{error, info};

use rummage_core::{
    CiAnnotationSink, Dispatcher, Engine, EngineConfig, FilesystemConfig, FindingStatus, GitConfig, HandlerLimits,
    JsonLinesSink, LegacyJsonSink, PlainTextSink, SpanPolicy, UnitMetrics,
};

/// Exit code when `--fail` is set and at least one finding was produced.
const EXIT_FOUND: i32 = 183;

#[derive(Debug, Parser)]
#[command(name = "rummage", version, about = "Dig credentials out of the places they leak into.")]
struct Cli {
    /// Output findings as JSON, one object per line.
    #[arg(long, short = 'j', global = true)]
    json: bool,

    /// Use the legacy flat JSON schema (git sources only).
    #[arg(long, global = true, conflicts_with = "json")]
    json_legacy: bool,

    /// Output findings as CI annotation workflow commands.
    #[arg(long = "github-actions", global = true, conflicts_with_all = ["json", "json_legacy"])]
    ci_annotations: bool,

    /// Number of detector workers. Defaults to the CPU count.
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Do not verify findings against their issuing services.
    #[arg(long, global = true)]
    no_verification: bool,

    /// Result kinds to output: verified, unknown, unverified,
    /// filtered_unverified (comma-separated). Default outputs all.
    #[arg(long, global = true)]
    results: Option<String>,

    /// Verify overlapping matches with every detector instead of the
    /// most specific one.
    #[arg(long = "allow-verification-overlap", global = true)]
    verification_overlap: bool,

    /// Keep only the first unverified result per chunk and detector.
    #[arg(long, global = true)]
    filter_unverified: bool,

    /// Drop unverified results below this Shannon entropy. Start at 3.0.
    #[arg(long, global = true)]
    filter_entropy: Option<f64>,

    /// Scan whole chunks instead of windows around keyword hits.
    #[arg(long, global = true, hide = true)]
    scan_entire_chunk: bool,

    /// Run both span strategies and compare their finding counts.
    #[arg(long, global = true, hide = true)]
    compare_detection_strategies: bool,

    /// Detectors to enable: names, ids, or lo-hi ranges, comma-separated.
    #[arg(long, global = true, default_value = "all")]
    include_detectors: String,

    /// Detectors to disable; wins over --include-detectors.
    #[arg(long, global = true, default_value = "")]
    exclude_detectors: String,

    /// Custom verification endpoint as detector=url. Repeatable.
    #[arg(long = "verifier", global = true, value_parser = parse::parse_verifier)]
    verifiers: Vec<(String, String)>,

    /// Only use custom verification endpoints.
    #[arg(long, global = true)]
    custom_verifiers_only: bool,

    /// Maximum time each detector may spend on one chunk (e.g. 30s).
    #[arg(long, global = true, value_parser = parse::parse_duration)]
    detector_timeout: Option<Duration>,

    /// Maximum decompressed size per archive level (e.g. 512B, 4MB).
    #[arg(long, global = true, value_parser = parse::parse_byte_size)]
    archive_max_size: Option<u64>,

    /// Maximum archive nesting depth.
    #[arg(long, global = true)]
    archive_max_depth: Option<usize>,

    /// Maximum time to spend extracting one archive (e.g. 30s).
    #[arg(long, global = true, value_parser = parse::parse_duration)]
    archive_timeout: Option<Duration>,

    /// Exit with code 183 when at least one finding was produced.
    #[arg(long, global = true)]
    fail: bool,

    /// Disable the in-memory verification cache.
    #[arg(long, global = true)]
    no_verification_cache: bool,

    /// Drop binary executables instead of scanning them.
    #[arg(long, global = true)]
    force_skip_binaries: bool,

    /// Drop archives instead of expanding them.
    #[arg(long, global = true)]
    force_skip_archives: bool,

    /// Walk HEAD only instead of every local branch.
    #[arg(long, global = true)]
    skip_additional_refs: bool,

    /// Suffix appended to the verification User-Agent.
    #[arg(long, global = true)]
    user_agent_suffix: Option<String>,

    /// Write the per-unit JSON scan report to this path.
    #[arg(long = "output-report", global = true)]
    output_report: Option<PathBuf>,

    /// Print the average processing time per detector after the scan.
    #[arg(long, global = true)]
    print_avg_detector_time: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Find credentials in files and directories.
    Filesystem(FilesystemArgs),
    /// Find credentials in a git repository's history.
    Git(GitArgs),
}

#[derive(Debug, Parser)]
struct FilesystemArgs {
    /// Files or directories to scan.
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// File of newline-separated regexes; only matching paths are scanned.
    #[arg(long, short = 'i')]
    include_paths: Option<PathBuf>,

    /// File of newline-separated regexes; matching paths are skipped.
    #[arg(long, short = 'x')]
    exclude_paths: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct GitArgs {
    /// Repository location: local path, file://, https:// or ssh:// URI.
    uri: String,

    /// File of newline-separated regexes; only matching paths are scanned.
    #[arg(long, short = 'i')]
    include_paths: Option<PathBuf>,

    /// File of newline-separated regexes; matching paths are skipped.
    #[arg(long, short = 'x')]
    exclude_paths: Option<PathBuf>,

    /// Comma-separated globs excluded at the tree-diff level.
    #[arg(long)]
    exclude_globs: Option<String>,

    /// Scan only commits after this one, oldest first.
    #[arg(long)]
    since_commit: Option<String>,

    /// Branch or ref to scan.
    #[arg(long)]
    branch: Option<String>,

    /// Maximum number of commits to walk.
    #[arg(long)]
    max_depth: Option<usize>,

    /// Open the repository as bare (for pre-receive hooks).
    #[arg(long)]
    bare: bool,
}

fn main() {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = match parse_cli() {
        Ok(cli) => cli,
        Err(err) => {
            // Help/version are ordinary exits; anything else is usage + 1.
            if err.use_stderr() {
                let _ = err.print();
                std::process::exit(1);
            }
            let _ = err.print();
            std::process::exit(0);
        }
    };
    let fail_on_findings = cli.fail;

    let outcome = run(cli);
    match outcome {
        Ok(found) if fail_on_findings && found => std::process::exit(EXIT_FOUND),
        Ok(_) => {}
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

fn parse_cli() -> Result<Cli, clap::Error> {
    let matches = Cli::command().try_get_matches()?;
    Cli::from_arg_matches(&matches).map_err(Into::into)
}

fn run(cli: Cli) -> anyhow::Result<bool> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build async runtime")?;
    runtime.block_on(scan(cli))
}

async fn scan(cli: Cli) -> anyhow::Result<bool> {
    let dispatcher = build_dispatcher(&cli);
    let results = parse_results(cli.results.as_deref())?;

    let mut handler = HandlerLimits {
        skip_archives: cli.force_skip_archives,
        skip_binaries: cli.force_skip_binaries,
        ..HandlerLimits::default()
    };
    if let Some(depth) = cli.archive_max_depth {
        handler.max_depth = depth;
    }
    if let Some(size) = cli.archive_max_size {
        handler.max_size = size;
    }
    if let Some(timeout) = cli.archive_timeout {
        handler.timeout = timeout;
    }

    let mut config = EngineConfig {
        include_detectors: cli.include_detectors.clone(),
        exclude_detectors: cli.exclude_detectors.clone(),
        verifier_endpoints: cli.verifiers.clone(),
        custom_verifiers_only: cli.custom_verifiers_only,
        verify: !cli.no_verification,
        verification_overlap: cli.verification_overlap,
        filter_entropy: cli.filter_entropy,
        filter_unverified: cli.filter_unverified,
        results,
        span_policy: span_policy(&cli),
        handler,
        verification_cache: !cli.no_verification_cache,
        user_agent_suffix: cli.user_agent_suffix.clone(),
        dispatcher,
        ..EngineConfig::default()
    };
    if let Some(concurrency) = cli.concurrency {
        config.concurrency = concurrency;
        config.max_concurrent_sources = concurrency;
        config.max_concurrent_units = concurrency;
    }
    if let Some(timeout) = cli.detector_timeout {
        config.detector_timeout = timeout;
    }

    // A base-commit scan must preserve chunk order end to end.
    if let Command::Git(args) = &cli.command
        && args.since_commit.is_some()
    {
        config.concurrency = 1;
        config.max_concurrent_units = 1;
    }

    let mut report_task = None;
    if let Some(path) = &cli.output_report {
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        config.unit_metrics = Some(tx);
        report_task = Some(spawn_report_writer(path.clone(), rx)?);
    }

    let engine = Arc::new(Engine::new(config).context("failed to initialize engine")?);
    engine.start().context("failed to start engine")?;

    let signal_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, shutting down");
            signal_engine.cancel();
        }
    });

    let progress = match &cli.command {
        Command::Filesystem(args) => engine
            .scan_filesystem(FilesystemConfig {
                paths: args.paths.clone(),
                include_paths_file: args.include_paths.clone(),
                exclude_paths_file: args.exclude_paths.clone(),
            })
            .context("failed to scan filesystem")?,
        Command::Git(args) => engine
            .scan_git(GitConfig {
                uri: args.uri.clone(),
                head_ref: args.branch.clone(),
                base_ref: args.since_commit.clone(),
                max_depth: args.max_depth,
                bare: args.bare,
                include_paths_file: args.include_paths.clone(),
                exclude_paths_file: args.exclude_paths.clone(),
                exclude_globs: args.exclude_globs.clone(),
                skip_additional_refs: cli.skip_additional_refs,
            })
            .context("failed to scan git repository")?,
    };

    progress.done().await;
    engine.finish().await.context("engine failed to finish")?;

    if let Some(task) = report_task {
        let _ = task.await;
    }

    let snapshot = progress.snapshot();
    if !snapshot.errors.is_empty() {
        let messages: Vec<String> = snapshot
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.unit, e.error))
            .collect();
        error!(errors = ?messages, "encountered errors during scan");
    }

    let metrics = engine.metrics();
    info!(
        chunks = metrics.chunks_scanned,
        bytes = metrics.bytes_scanned,
        verified_secrets = metrics.verified_secrets,
        unverified_secrets = metrics.unverified_secrets,
        scan_duration = ?metrics.scan_duration,
        "finished scanning"
    );
    if let Some(cache) = engine.cache_metrics() {
        info!(
            hits = cache.hits,
            misses = cache.misses,
            hits_wasted = cache.wasted_hits,
            attempts_saved = cache.attempts_saved,
            verification_time_ms = cache.verify_time_ms,
            "verification caching"
        );
    }
    if cli.print_avg_detector_time {
        print_average_detector_time(&engine);
    }

    Ok(engine.has_found_results())
}

fn build_dispatcher(cli: &Cli) -> Arc<dyn Dispatcher> {
    if cli.json {
        Arc::new(JsonLinesSink::new(std::io::stdout()))
    } else if cli.json_legacy {
        Arc::new(LegacyJsonSink::new(std::io::stdout()))
    } else if cli.ci_annotations {
        Arc::new(CiAnnotationSink::new(std::io::stdout()))
    } else {
        Arc::new(PlainTextSink::new(std::io::stdout()))
    }
}

fn span_policy(cli: &Cli) -> SpanPolicy {
    if cli.compare_detection_strategies {
        SpanPolicy::Compare
    } else if cli.scan_entire_chunk {
        SpanPolicy::EntireChunk
    } else {
        SpanPolicy::MaxLength
    }
}

fn parse_results(input: Option<&str>) -> anyhow::Result<HashSet<FindingStatus>> {
    let Some(input) = input else {
        return Ok(HashSet::new());
    };

    let mut results = HashSet::new();
    for value in input.split(',').map(str::trim).filter(|v| !v.is_empty()) {
        let status: FindingStatus = value.parse().map_err(|e| anyhow::anyhow!("{e}"))?;
        results.insert(status);
    }
    Ok(results)
}

fn spawn_report_writer(
    path: PathBuf,
    mut rx: tokio::sync::mpsc::Receiver<UnitMetrics>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    use std::io::Write as _;

    let file = std::fs::File::create(&path)
        .with_context(|| format!("cannot create report file '{}'", path.display()))?;
    let mut out = std::io::BufWriter::new(file);

    Ok(tokio::spawn(async move {
        while let Some(metrics) = rx.recv().await {
            let record = serde_json::json!({ "version": 1, "data": metrics });
            if let Ok(line) = serde_json::to_string(&record) {
                let _ = writeln!(out, "{line}");
            }
        }
        let _ = out.flush();
        info!(path = %path.display(), "report written");
    }))
}

fn print_average_detector_time(engine: &Engine) {
    eprintln!("Average detector time is the time spent per detector when results are returned.");
    for (detector, duration) in engine.detector_metrics() {
        eprintln!("{detector}: {duration:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_flag_accepts_the_four_kinds() {
        let set = parse_results(Some("verified,unknown,unverified,filtered_unverified")).unwrap();
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn results_flag_rejects_unknown_kinds() {
        assert!(parse_results(Some("verified,maybe")).is_err());
    }

    #[test]
    fn absent_results_flag_keeps_everything() {
        assert!(parse_results(None).unwrap().is_empty());
    }

    #[test]
    fn cli_parses_a_filesystem_scan() {
        let cli = Cli::try_parse_from(["rummage", "filesystem", ".", "--fail", "--json"]).unwrap();
        assert!(cli.fail);
        assert!(cli.json);
        assert!(matches!(cli.command, Command::Filesystem(_)));
    }

    #[test]
    fn cli_parses_a_git_scan_with_since_commit() {
        let cli = Cli::try_parse_from(["rummage", "git", "https://example.com/r.git", "--since-commit", "abc"]).unwrap();
        match cli.command {
            Command::Git(args) => assert_eq!(args.since_commit.as_deref(), Some("abc")),
            Command::Filesystem(_) => panic!("expected git subcommand"),
        }
    }

    #[test]
    fn cli_rejects_conflicting_output_modes() {
        assert!(Cli::try_parse_from(["rummage", "--json", "--json-legacy", "filesystem", "."]).is_err());
    }

    #[test]
    fn span_policy_follows_the_hidden_flags() {
        let cli = Cli::try_parse_from(["rummage", "--scan-entire-chunk", "filesystem", "."]).unwrap();
        assert_eq!(span_policy(&cli), SpanPolicy::EntireChunk);

        let cli = Cli::try_parse_from(["rummage", "--compare-detection-strategies", "filesystem", "."]).unwrap();
        assert_eq!(span_policy(&cli), SpanPolicy::Compare);
    }
}
