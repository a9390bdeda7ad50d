use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use test_runner::context::StdoutPrinter;
use test_runner::{BoardRunner, CheckReport, Config, Outcome, Pattern, RunContext, Target};

#[derive(Parser)]
#[command(name = "test-runner", about = "Run a test target and check its console output")]
struct Cli {
    /// Platform file (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Platform id from the platform file
    #[arg(short, long)]
    platform: String,

    /// Expected output pattern; repeat to check an ordered sequence
    #[arg(short, long = "expect", required = true)]
    expect: Vec<String>,

    /// Treat patterns as regular expressions
    #[arg(long)]
    regex: bool,

    /// Timeout per pattern in seconds (0 waits forever)
    #[arg(short, long, default_value = "60")]
    timeout: u64,

    /// Target runs independent test threads; an assertion from one does not
    /// short-circuit checks for the others
    #[arg(long)]
    multi_thread: bool,

    /// Print target output to stdout instead of the log
    #[arg(long)]
    echo: bool,

    /// Print a JSON report of every check
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Report<'a> {
    platform: &'a str,
    passed: bool,
    checks: &'a [CheckReport],
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;
    let platform = config.platform(&cli.platform)?;
    let patterns = cli
        .expect
        .iter()
        .map(|p| if cli.regex { Pattern::regex(p) } else { Ok(Pattern::literal(p)) })
        .collect::<Result<Vec<_>, _>>()?;

    let timeout = Duration::from_secs(cli.timeout);
    let mut context = RunContext::new(cli.platform.clone(), timeout);
    if cli.echo {
        context = context.with_printer(Arc::new(StdoutPrinter));
    }

    tracing::info!(platform = %cli.platform, timeout = cli.timeout, "starting target");

    let mut runner = BoardRunner::new(Target::from_config(&cli.platform, platform)?);
    runner
        .start(&context)
        .await
        .with_context(|| format!("failed to start `{}`", cli.platform))?;

    let checks = run_checks(&mut runner, &patterns, !cli.multi_thread).await;
    let stopped = runner.stop().await;

    let checks = checks?;
    if let Err(err) = stopped {
        tracing::warn!(%err, "teardown failed");
    }

    let passed = checks.iter().all(|c| c.outcome.is_success());
    if cli.json {
        let report = Report {
            platform: &cli.platform,
            passed,
            checks: &checks,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for check in &checks {
            match &check.outcome {
                Outcome::Success { matched } => println!("PASS  {matched} ({:?})", check.elapsed),
                Outcome::Failure { assertion } => {
                    println!("FAIL  {} -- {}", check.pattern, assertion.location_text)
                }
                Outcome::Timeout => println!("TIMEOUT  {} ({:?})", check.pattern, check.elapsed),
            }
        }
    }

    if !passed {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_checks(
    runner: &mut BoardRunner,
    patterns: &[Pattern],
    single_threaded: bool,
) -> Result<Vec<CheckReport>> {
    let mut checks = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        let report = runner
            .check(pattern, None, single_threaded)
            .await
            .with_context(|| format!("checking `{pattern}`"))?;
        checks.push(report);
    }
    Ok(checks)
}
