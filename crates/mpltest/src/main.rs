use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Args, Parser};
use mpltest_harness::{HarnessConfig, TestCase};

mod config;
mod discover;
mod report;
mod util;

use report::{compute_exit_code, finalize_report, CaseReport, MplTestReport};

#[derive(Parser, Debug)]
#[command(name = "mpltest")]
#[command(about = "Directive-driven compiler testsuite harness.", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Discover and run testsuite cases.
    Run(RunArgs),
}

#[derive(Debug, Clone, Args)]
struct RunArgs {
    /// Suite root searched recursively for cases.
    #[arg(value_name = "DIR", default_value = ".")]
    suite: PathBuf,

    /// Suite config file; defaults to mpltest.json in the suite root.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Compiler driver substituted for %maple.
    #[arg(long, value_name = "CMD")]
    maple: Option<String>,

    /// Runtime shell substituted for %run.
    #[arg(long, value_name = "CMD")]
    run_cmd: Option<String>,

    /// Text substituted for %build_option.
    #[arg(long, value_name = "OPTS")]
    build_option: Option<String>,

    /// Text substituted for %run_option.
    #[arg(long, value_name = "OPTS")]
    run_option: Option<String>,

    /// Extra directory searched for dependency sources.
    #[arg(long, value_name = "DIR")]
    fixture_dir: Option<PathBuf>,

    #[arg(long, value_name = "SUBSTR")]
    filter: Option<String>,

    #[arg(long)]
    exact: bool,

    #[arg(long)]
    list: bool,

    #[arg(long, value_name = "N", default_value_t = 1)]
    jobs: usize,

    #[arg(long, value_name = "SECS")]
    build_timeout_secs: Option<u64>,

    /// Per-run-step wall timeout.
    #[arg(long, value_name = "SECS")]
    timeout_secs: Option<u64>,

    /// Whole-run deadline; cases not dispatched in time report as not_run.
    #[arg(long, value_name = "SECS")]
    deadline_secs: Option<u64>,

    #[arg(long, value_name = "BYTES", default_value_t = 1024 * 1024)]
    max_output_bytes: usize,

    #[arg(
        long,
        action = clap::ArgAction::Set,
        value_name = "BOOL",
        value_parser = clap::value_parser!(bool),
        default_value = "true"
    )]
    json: bool,

    #[arg(long, value_name = "PATH")]
    report_out: Option<PathBuf>,

    #[arg(long)]
    keep_artifacts: bool,

    #[arg(long, value_name = "DIR", default_value = "target/mpltest")]
    artifact_dir: PathBuf,

    #[arg(long)]
    verbose: bool,
}

fn main() -> std::process::ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            std::process::ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<std::process::ExitCode> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => cmd_run(args),
    }
}

fn cmd_run(args: RunArgs) -> Result<std::process::ExitCode> {
    let started = Instant::now();

    let suite_config = config::load(args.config.as_deref(), &args.suite)?;
    let harness_config = effective_harness_config(&args, &suite_config);

    let mut cases = discover::discover_cases(&args.suite)?;
    if let Some(filter) = &args.filter {
        if args.exact {
            cases.retain(|c| c.id == *filter);
        } else {
            cases.retain(|c| c.id.contains(filter));
        }
    }

    if args.list {
        for case in &cases {
            println!("{}\t{}", case.id, case.primary);
        }
        return Ok(std::process::ExitCode::SUCCESS);
    }

    if args.verbose {
        eprintln!(
            "mpltest: {} cases (jobs={}, maple={}, run={})",
            cases.len(),
            args.jobs,
            harness_config.build_cmd,
            harness_config.run_cmd
        );
    }

    let results = run_cases(&args, &harness_config, &cases)?;

    let report = finalize_report(&args.suite, args.jobs, started.elapsed(), results);
    let exit_code = compute_exit_code(&report);
    write_report_and_exit(args, report, exit_code)
}

fn effective_harness_config(args: &RunArgs, suite: &config::SuiteConfig) -> HarnessConfig {
    let mut config = HarnessConfig::new(args.artifact_dir.join("_tmp"));
    if let Some(cmd) = args.maple.clone().or_else(|| suite.maple.clone()) {
        config.build_cmd = cmd;
    }
    if let Some(cmd) = args.run_cmd.clone().or_else(|| suite.run_cmd.clone()) {
        config.run_cmd = cmd;
    }
    if let Some(opts) = args.build_option.clone().or_else(|| suite.build_option.clone()) {
        config.build_options = opts;
    }
    if let Some(opts) = args.run_option.clone().or_else(|| suite.run_option.clone()) {
        config.run_options = opts;
    }
    config.fixture_dir = args
        .fixture_dir
        .clone()
        .or_else(|| suite.fixture_dir.clone());
    if let Some(secs) = args.build_timeout_secs.or(suite.build_timeout_secs) {
        config.build_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = args.timeout_secs.or(suite.timeout_secs) {
        config.run_timeout = Duration::from_secs(secs);
    }
    config.max_output_bytes = args.max_output_bytes;
    config
}

fn run_cases(
    args: &RunArgs,
    harness_config: &HarnessConfig,
    cases: &[TestCase],
) -> Result<Vec<CaseReport>> {
    let deadline = args
        .deadline_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));

    let mut out: Vec<CaseReport> = Vec::with_capacity(cases.len());

    if args.jobs <= 1 {
        for case in cases {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                out.push(CaseReport::not_run(&case.id));
                continue;
            }
            if args.verbose {
                eprintln!("case: {}", case.id);
            }
            out.push(run_one_case(args, harness_config, case)?);
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        return Ok(out);
    }

    let next = AtomicUsize::new(0);
    let results: Mutex<Vec<CaseReport>> = Mutex::new(Vec::with_capacity(cases.len()));
    let first_err: Mutex<Option<anyhow::Error>> = Mutex::new(None);

    std::thread::scope(|scope| {
        let jobs = args.jobs.min(cases.len().max(1));
        for _ in 0..jobs {
            scope.spawn(|| loop {
                if let Ok(guard) = first_err.lock() {
                    if guard.is_some() {
                        return;
                    }
                }
                let idx = next.fetch_add(1, Ordering::Relaxed);
                if idx >= cases.len() {
                    return;
                }
                let case = &cases[idx];
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    if let Ok(mut guard) = results.lock() {
                        guard.push(CaseReport::not_run(&case.id));
                    }
                    continue;
                }
                if args.verbose {
                    eprintln!("case: {}", case.id);
                }
                match run_one_case(args, harness_config, case) {
                    Ok(r) => {
                        if let Ok(mut guard) = results.lock() {
                            guard.push(r);
                        }
                    }
                    Err(err) => {
                        if let Ok(mut guard) = first_err.lock() {
                            if guard.is_none() {
                                *guard = Some(err);
                            }
                        }
                        return;
                    }
                }
            });
        }
    });

    if let Some(err) = first_err.into_inner().unwrap_or_else(|e| e.into_inner()) {
        return Err(err);
    }
    out = results.into_inner().unwrap_or_else(|e| e.into_inner());

    out.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(out)
}

fn run_one_case(
    args: &RunArgs,
    harness_config: &HarnessConfig,
    case: &TestCase,
) -> Result<CaseReport> {
    let retain_dir = if args.keep_artifacts {
        Some(
            args.artifact_dir
                .join("cases")
                .join(safe_artifact_dir_name(&case.id)),
        )
    } else {
        None
    };

    let outcome = mpltest_harness::run_case(case, harness_config, retain_dir.as_deref())
        .with_context(|| format!("case {}", case.id))?;

    if args.verbose {
        if let Some(dir) = &retain_dir {
            eprintln!("artifacts: {}", dir.display());
        }
    }

    Ok(CaseReport::from_outcome(&case.id, &outcome))
}

fn write_report_and_exit(
    args: RunArgs,
    report: MplTestReport,
    exit_code: u8,
) -> Result<std::process::ExitCode> {
    let json = serde_json::to_string(&report)? + "\n";

    if let Some(out_path) = &args.report_out {
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create report dir: {}", parent.display()))?;
        }
        std::fs::write(out_path, json.as_bytes())
            .with_context(|| format!("write report: {}", out_path.display()))?;
    }

    if args.json {
        print!("{json}");
    } else {
        for case in &report.cases {
            println!("{}\t{}", case.verdict.as_str(), case.id);
        }
        println!(
            "summary: passed={} failed={} build_errors={} build_timeouts={} timeouts={} crashes={} not_run={} (exit={})",
            report.summary.passed,
            report.summary.failed,
            report.summary.build_errors,
            report.summary.build_timeouts,
            report.summary.timeouts,
            report.summary.crashes,
            report.summary.not_run,
            exit_code
        );
    }

    Ok(std::process::ExitCode::from(exit_code))
}

/// Case ids contain path separators; artifact directories get a stable
/// hashed name instead.
fn safe_artifact_dir_name(id: &str) -> String {
    format!("id_{}", util::sha256_hex(id.as_bytes()))
}
