//! `ccpool`
//!
//! Compiles a set of sources into object files using a bounded pool of
//! concurrent compiler processes.

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{info, warn};

use ccpool::plan::{BuildPlan, BuildSettings};
use ccpool::pool::{CompileCommand, CompilerPool};
use ccpool_core::config::{cpu_count, load_config};
use ccpool_core::tracing_init::init_tracing;

#[derive(Parser, Debug)]
#[command(name = "ccpool")]
#[command(version, about = "Compile sources concurrently with a bounded compiler pool")]
struct Args {
    /// Source files to compile
    #[arg(required = true)]
    sources: Vec<PathBuf>,

    /// Compiler executable
    #[arg(long, default_value = "cc", env = "CCPOOL_COMPILER")]
    compiler: PathBuf,

    /// Flag passed to every compiler invocation (repeatable)
    #[arg(long = "flag", short = 'f', allow_hyphen_values = true)]
    flags: Vec<String>,

    /// Maximum concurrent compiler processes (0 = CPU count + 2)
    #[arg(short = 'j', long)]
    jobs: Option<usize>,

    /// Build timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Directory for object files
    #[arg(long, default_value = "build")]
    out_dir: PathBuf,

    /// Skip sources whose object file is newer than the source and its
    /// headers, as long as compiler and flags match the previous build
    #[arg(long)]
    incremental: bool,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let cwd = std::env::current_dir().context("failed to resolve working directory")?;
    let (mut config, ignored_env) = load_config(Some(&cwd))?;
    if let Some(jobs) = args.jobs {
        config.pool.max_concurrency = jobs;
    }
    if let Some(timeout) = args.timeout {
        config.pool.timeout_secs = timeout;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.logging.json |= args.log_json;

    init_tracing(&config.logging);
    for ignored in &ignored_env {
        warn!(
            var = ignored.var,
            value = %ignored.value,
            "Ignoring invalid environment override"
        );
    }

    let settings = BuildSettings::new(&args.compiler, &args.flags);
    let freshness = settings.freshness(&args.out_dir, args.incremental);
    let plan = BuildPlan::new(&args.out_dir, args.sources, &freshness)?;
    std::fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("failed to create {}", args.out_dir.display()))?;
    settings.store(&args.out_dir)?;

    let mut pool = CompilerPool::from_config(&config.pool);
    let cores = cpu_count();
    info!("Building on {} core(s)", pool.max_concurrency().min(cores));
    if pool.max_concurrency() > cores {
        info!("Using {} subprocess(es)", pool.max_concurrency());
    }

    for unit in plan.units() {
        let command =
            CompileCommand::object(&args.compiler, &unit.source, &unit.object, &args.flags);
        pool.submit(&unit.source, &unit.object, command).await?;
    }

    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };
    pool.wait_until_done_or(config.pool.timeout(), interrupt).await?;

    match plan.skipped() {
        [] => {}
        [only] => info!(
            "Skipping file {} because the intermediate object file is already built",
            only.display()
        ),
        many => {
            for source in many {
                info!("Skipping file {}", source.display());
            }
            info!("Because the intermediate object files are already built");
        }
    }

    if pool.failed() {
        bail!("Build failed: not every source compiled");
    }

    info!(
        compiled = plan.units().len(),
        skipped = plan.skipped().len(),
        "Build finished"
    );
    Ok(())
}
