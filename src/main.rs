use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use covunion::cache::ResultCache;
use covunion::cli::{self, Context, OutputFormat};
use covunion::discrepancy::Strategy;
use covunion::ignore::{IgnoreRuleSet, DEFAULT_IGNORE_FILE};
use covunion::scan::BuildRoots;

/// covunion: union line coverage across unit-test and blackbox gcov builds.
#[derive(Parser)]
#[command(name = "covunion", version, about)]
struct Cli {
    /// Project root: holds the ignore file and is stripped from absolute
    /// source paths.
    #[arg(long, global = true, default_value = ".")]
    project_root: PathBuf,

    /// Ignore file, relative to the project root unless absolute.
    #[arg(long, global = true, default_value = DEFAULT_IGNORE_FILE)]
    ignore_file: PathBuf,

    /// Result cache database (default: <project-root>/.covunion.db).
    #[arg(long, global = true)]
    cache: Option<PathBuf>,

    /// Always rescan; neither read nor write the result cache.
    #[arg(long, global = true)]
    no_cache: bool,

    /// Worker threads (default: one per CPU core).
    #[arg(long, global = true)]
    jobs: Option<usize>,

    /// Debug logging on stderr (RUST_LOG takes precedence).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RootArgs {
    /// Build tree of the unit-test (Unity) run.
    #[arg(long)]
    unity: PathBuf,

    /// Build tree of the blackbox (integration) run.
    #[arg(long)]
    blackbox: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute per-file and total coverage for both build trees.
    Scan {
        #[command(flatten)]
        roots: RootArgs,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,

        /// Show the worst-covered files first.
        #[arg(long)]
        sort_by_coverage: bool,

        /// Exit non-zero when combined coverage is below this percentage.
        #[arg(long)]
        min_coverage: Option<f64>,
    },

    /// Compare the union figures with a legacy calculation method.
    Diff {
        #[command(flatten)]
        roots: RootArgs,

        /// Method to compare against (concatenate, per-file-sum, max-count).
        #[arg(long, default_value = "concatenate")]
        against: Strategy,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Diff two reports saved with `scan --format json`.
    Compare {
        a: PathBuf,
        b: PathBuf,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Delete every cached scan.
    ClearCache,
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let rules = IgnoreRuleSet::load_file(&cli.project_root.join(&cli.ignore_file));
    for warning in rules.warnings() {
        eprintln!("Warning: {warning}");
    }

    let cache = if cli.no_cache {
        ResultCache::disabled()
    } else {
        let path = cli
            .cache
            .clone()
            .unwrap_or_else(|| cli::default_cache_path(&cli.project_root));
        ResultCache::open(&path)
    };

    let mut ctx = Context::new(rules, cache);
    ctx.jobs = cli.jobs;

    let flag = Arc::clone(&ctx.interrupt);
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
        tracing::warn!("could not install Ctrl-C handler: {e}");
    }

    let roots = |args: RootArgs| {
        BuildRoots::new(args.unity, args.blackbox).with_project_root(&cli.project_root)
    };

    match cli.command {
        Commands::Scan {
            roots: args,
            format,
            sort_by_coverage,
            min_coverage,
        } => {
            let outcome = cli::cmd_scan(&mut ctx, &roots(args), &format, sort_by_coverage)?;
            print!("{}", outcome.output);
            if let Some(min) = min_coverage {
                cli::check_threshold(&outcome.totals, min)?;
            }
            Ok(())
        }
        Commands::Diff {
            roots: args,
            against,
            format,
        } => {
            print!("{}", cli::cmd_diff(&ctx, &roots(args), against, &format)?);
            Ok(())
        }
        Commands::Compare { a, b, format } => {
            print!("{}", cli::cmd_compare(&a, &b, &format)?);
            Ok(())
        }
        Commands::ClearCache => {
            print!("{}", cli::cmd_clear_cache(&mut ctx)?);
            Ok(())
        }
    }
}
