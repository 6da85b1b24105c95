//! Per-case pipeline for directive-driven compiler test cases.
//!
//! A case is a primary `.java` source whose comment directives declare its
//! dependencies, its build/run command templates, and the pattern its output
//! must satisfy. [`run_case`] takes one case through parse, dependency
//! staging, build, run, and comparison, and folds every per-case problem
//! into a [`Verdict`] so one broken case never aborts a whole suite run.

pub mod compare;
pub mod directive;
pub mod exec;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::compare::{compare_output, compile_scan_pattern, Comparison, ExpectedOutcome};
use crate::directive::{
    parse_directives, Directives, ExecStep, StepKind, Substitutions, DEFAULT_ASSERT_PATTERN,
};
use crate::exec::{run_command, ExecLimits, ExecOutcome};

/// Diagnostic codes carried on case reports.
pub mod diag_code {
    pub const DIRECTIVE_MALFORMED: &str = "EDIRECTIVE_MALFORMED";
    pub const DEP_MISSING: &str = "EDEP_MISSING";
    pub const CASE_READ: &str = "ECASE_READ";
    pub const BUILD: &str = "EBUILD";
    pub const BUILD_TIMEOUT: &str = "EBUILD_TIMEOUT";
    pub const RUN_TIMEOUT: &str = "ERUN_TIMEOUT";
    pub const RUN_CRASH: &str = "ERUN_CRASH";
    pub const COMPARE_MISMATCH: &str = "ECOMPARE_MISMATCH";
}

/// File shipped next to a case when its expected output lives outside the
/// source comments.
pub const EXPECTED_FILE_NAME: &str = "expected.txt";

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Compiler driver substituted for `%maple`.
    pub build_cmd: String,
    /// Runtime shell substituted for `%run`.
    pub run_cmd: String,
    pub build_options: String,
    pub run_options: String,
    /// Extra directory searched for dependency sources shared across cases.
    pub fixture_dir: Option<PathBuf>,
    pub build_timeout: Duration,
    pub run_timeout: Duration,
    /// RLIMIT_CPU for children, seconds.
    pub cpu_time_limit_seconds: Option<u64>,
    /// Per-stream capture cap for child stdout/stderr.
    pub max_output_bytes: usize,
    /// Scratch directories are created (and removed) under here.
    pub work_root: PathBuf,
}

impl HarnessConfig {
    pub fn new(work_root: PathBuf) -> HarnessConfig {
        HarnessConfig {
            build_cmd: "maple".to_string(),
            run_cmd: "mplsh".to_string(),
            build_options: String::new(),
            run_options: String::new(),
            fixture_dir: None,
            build_timeout: Duration::from_secs(60),
            run_timeout: Duration::from_secs(10),
            cpu_time_limit_seconds: Some(120),
            max_output_bytes: 1024 * 1024,
            work_root,
        }
    }
}

/// One discovered case: a directory plus the primary source inside it.
#[derive(Debug, Clone)]
pub struct TestCase {
    pub id: String,
    pub dir: PathBuf,
    /// File name of the primary source, relative to `dir`.
    pub primary: String,
}

impl TestCase {
    pub fn primary_path(&self) -> PathBuf {
        self.dir.join(&self.primary)
    }

    /// Case name: primary file stem, substituted for `%n`.
    pub fn name(&self) -> &str {
        self.primary
            .strip_suffix(".java")
            .unwrap_or(&self.primary)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    BuildError,
    BuildTimeout,
    Timeout,
    Crash,
    NotRun,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Pass => "pass",
            Verdict::Fail => "fail",
            Verdict::BuildError => "build_error",
            Verdict::BuildTimeout => "build_timeout",
            Verdict::Timeout => "timeout",
            Verdict::Crash => "crash",
            Verdict::NotRun => "not_run",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Diag {
    pub code: String,
    pub message: String,
}

impl Diag {
    pub fn new(code: &str, message: impl Into<String>) -> Diag {
        Diag {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// One executed build or run command, with its captured output.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub kind: StepKind,
    pub cmd: Vec<String>,
    pub outcome: ExecOutcome,
}

#[derive(Debug, Clone)]
pub struct CaseOutcome {
    pub verdict: Verdict,
    pub diags: Vec<Diag>,
    pub steps: Vec<StepRecord>,
    pub duration: Duration,
}

impl CaseOutcome {
    fn settled(verdict: Verdict, diag: Diag, steps: Vec<StepRecord>, start: Instant) -> CaseOutcome {
        CaseOutcome {
            verdict,
            diags: vec![diag],
            steps,
            duration: start.elapsed(),
        }
    }
}

static TEMP_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Scratch directory removed on drop. Names carry the pid and a process-wide
/// counter so concurrent workers never collide.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn create(root: &Path, label: &str) -> Result<TempDir> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("create temp root: {}", root.display()))?;
        let n = TEMP_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = root.join(format!("{label}-{}-{n}", std::process::id()));
        std::fs::create_dir(&path)
            .with_context(|| format!("create temp dir: {}", path.display()))?;
        Ok(TempDir { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// Runs one case end to end.
///
/// With `retain_dir` set, staging and artifacts land there and survive the
/// call; otherwise a scratch directory under `config.work_root` is used and
/// removed before returning.
///
/// Per-case problems (unreadable source, malformed directives, missing
/// dependencies, build/run failures) become verdicts. `Err` is reserved for
/// harness-level defects: an expected pattern that does not compile, or an
/// environment failure such as an unspawnable tool.
pub fn run_case(
    case: &TestCase,
    config: &HarnessConfig,
    retain_dir: Option<&Path>,
) -> Result<CaseOutcome> {
    let start = Instant::now();

    let source = match std::fs::read_to_string(case.primary_path()) {
        Ok(s) => s,
        Err(err) => {
            return Ok(CaseOutcome::settled(
                Verdict::BuildError,
                Diag::new(
                    diag_code::CASE_READ,
                    format!("read {}: {err}", case.primary_path().display()),
                ),
                Vec::new(),
                start,
            ));
        }
    };

    let mut directives = match parse_directives(&source) {
        Ok(d) => d,
        Err(err) => {
            return Ok(CaseOutcome::settled(
                Verdict::BuildError,
                Diag::new(diag_code::DIRECTIVE_MALFORMED, err.to_string()),
                Vec::new(),
                start,
            ));
        }
    };
    directives.apply_defaults();

    // The expected outcome is fixed before anything is spawned; a pattern
    // that does not compile is a corpus defect, not a test failure.
    let expected = expected_outcome(case, &directives)?;
    if let ExpectedOutcome::Pattern(pattern) = &expected {
        compile_scan_pattern(pattern)?;
    }

    let deps = match resolve_dependencies(case, config, &directives.dependencies) {
        Ok(deps) => deps,
        Err(missing) => {
            return Ok(CaseOutcome::settled(
                Verdict::BuildError,
                Diag::new(
                    diag_code::DEP_MISSING,
                    format!("dependency not found: {missing}"),
                ),
                Vec::new(),
                start,
            ));
        }
    };

    let scratch;
    let work_dir = match retain_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create work dir: {}", dir.display()))?;
            dir
        }
        None => {
            scratch = TempDir::create(&config.work_root, case.name())?;
            scratch.path()
        }
    };
    stage_sources(case, &deps, work_dir)?;

    let subs = Substitutions {
        maple: config.build_cmd.clone(),
        run: config.run_cmd.clone(),
        file: case.primary.clone(),
        name: case.name().to_string(),
        build_option: config.build_options.clone(),
        run_option: config.run_options.clone(),
    };

    let mut steps: Vec<StepRecord> = Vec::new();
    let mut compare_input: Option<usize> = None;

    for step in &directives.steps {
        let cmd = expand_argv(&directive::substitute(&step.template, &subs), case, &deps);
        let limits = step_limits(step, config);
        let outcome = match run_command(&cmd, work_dir, &limits) {
            Ok(o) => o,
            // An unspawnable build tool settles the case; a broken run
            // environment is a harness-level defect.
            Err(err) if step.kind == StepKind::Build => {
                return Ok(CaseOutcome::settled(
                    Verdict::BuildError,
                    Diag::new(
                        diag_code::BUILD,
                        format!("cannot execute {}: {err:#}", cmd.join(" ")),
                    ),
                    steps,
                    start,
                ));
            }
            Err(err) => {
                return Err(err.context(format!("execute: {}", cmd.join(" "))));
            }
        };

        let idx = steps.len();
        let settle = judge_step(step, &outcome);
        if step.compare {
            compare_input = Some(idx);
        }
        steps.push(StepRecord {
            kind: step.kind,
            cmd,
            outcome,
        });

        if let Some((verdict, diag)) = settle {
            return Ok(CaseOutcome::settled(verdict, diag, steps, start));
        }
    }

    let stdout = compare_input
        .or_else(|| {
            steps
                .iter()
                .rposition(|s| s.kind == StepKind::Run)
        })
        .map(|idx| String::from_utf8_lossy(&steps[idx].outcome.stdout).into_owned())
        .unwrap_or_default();

    let (verdict, diags) = match compare_output(&expected, &stdout)? {
        Comparison::Match => (Verdict::Pass, Vec::new()),
        Comparison::Mismatch { expected, actual } => (
            Verdict::Fail,
            vec![Diag::new(
                diag_code::COMPARE_MISMATCH,
                format!("expected {:?}, got {:?}", expected, tail(&actual, 512)),
            )],
        ),
    };

    Ok(CaseOutcome {
        verdict,
        diags,
        steps,
        duration: start.elapsed(),
    })
}

/// Expected-output source precedence: ASSERT directive, then `expected.txt`
/// beside the case, then the conventional `0\n`.
fn expected_outcome(case: &TestCase, directives: &Directives) -> Result<ExpectedOutcome> {
    if let Some(pattern) = &directives.assert_pattern {
        // A scan directive declares its mode; mode sniffing applies only to
        // expected.txt, so a pattern mentioning a checksum line stays a
        // pattern.
        return Ok(ExpectedOutcome::Pattern(pattern.clone()));
    }
    let expected_file = case.dir.join(EXPECTED_FILE_NAME);
    if expected_file.exists() {
        let text = std::fs::read_to_string(&expected_file)
            .with_context(|| format!("read {}", expected_file.display()))?;
        return Ok(ExpectedOutcome::from_expected_text(&text));
    }
    Ok(ExpectedOutcome::Pattern(DEFAULT_ASSERT_PATTERN.to_string()))
}

/// Locates each declared dependency: beside the case first, then in the
/// shared fixture directory. Returns the first missing name as `Err`.
fn resolve_dependencies(
    case: &TestCase,
    config: &HarnessConfig,
    names: &[String],
) -> std::result::Result<Vec<(String, PathBuf)>, String> {
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        let local = case.dir.join(name);
        if local.is_file() {
            out.push((name.clone(), local));
            continue;
        }
        if let Some(fixtures) = &config.fixture_dir {
            let shared = fixtures.join(name);
            if shared.is_file() {
                out.push((name.clone(), shared));
                continue;
            }
        }
        return Err(name.clone());
    }
    Ok(out)
}

/// Copies the primary source and its dependencies into the work directory so
/// builds never write next to the corpus.
fn stage_sources(case: &TestCase, deps: &[(String, PathBuf)], work_dir: &Path) -> Result<()> {
    let primary = case.primary_path();
    std::fs::copy(&primary, work_dir.join(&case.primary))
        .with_context(|| format!("stage {}", primary.display()))?;
    for (name, src) in deps {
        std::fs::copy(src, work_dir.join(name))
            .with_context(|| format!("stage {}", src.display()))?;
    }
    Ok(())
}

/// Splits a substituted command line into argv, expanding the literal
/// `*.java` token to the primary source followed by the dependencies in
/// declaration order. Class initialization order is sensitive to compile
/// order, so the expansion is deterministic, never directory-listing order.
fn expand_argv(command: &str, case: &TestCase, deps: &[(String, PathBuf)]) -> Vec<String> {
    let mut argv = Vec::new();
    for token in command.split_whitespace() {
        if token == "*.java" {
            argv.push(case.primary.clone());
            argv.extend(
                deps.iter()
                    .filter(|(name, _)| name.ends_with(".java"))
                    .map(|(name, _)| name.clone()),
            );
        } else {
            argv.push(token.to_string());
        }
    }
    argv
}

fn step_limits(step: &ExecStep, config: &HarnessConfig) -> ExecLimits {
    ExecLimits {
        wall: match step.kind {
            StepKind::Build => config.build_timeout,
            StepKind::Run => config.run_timeout,
        },
        cpu_time_limit_seconds: config.cpu_time_limit_seconds,
        max_stdout_bytes: config.max_output_bytes,
        max_stderr_bytes: config.max_output_bytes,
    }
}

/// Maps a finished step to a terminal verdict, or `None` when the pipeline
/// should continue.
fn judge_step(step: &ExecStep, outcome: &ExecOutcome) -> Option<(Verdict, Diag)> {
    match step.kind {
        StepKind::Build => {
            if outcome.timed_out {
                return Some((
                    Verdict::BuildTimeout,
                    Diag::new(
                        diag_code::BUILD_TIMEOUT,
                        format!("build exceeded wall limit after {:?}", outcome.duration),
                    ),
                ));
            }
            if outcome.exit_status != 0 {
                return Some((
                    Verdict::BuildError,
                    Diag::new(
                        diag_code::BUILD,
                        format!(
                            "build exited {}: {}",
                            outcome.exit_status,
                            tail(&String::from_utf8_lossy(&outcome.stderr), 512)
                        ),
                    ),
                ));
            }
        }
        StepKind::Run => {
            if outcome.timed_out {
                return Some((
                    Verdict::Timeout,
                    Diag::new(
                        diag_code::RUN_TIMEOUT,
                        format!("run exceeded wall limit after {:?}", outcome.duration),
                    ),
                ));
            }
            if let Some(signal) = outcome.exit_signal {
                return Some((
                    Verdict::Crash,
                    Diag::new(
                        diag_code::RUN_CRASH,
                        format!("run terminated by signal {signal}"),
                    ),
                ));
            }
            // A non-zero exit without a signal still goes to comparison:
            // some cases report failure codes on stdout instead of crashing.
        }
    }
    None
}

/// Last `max` characters of `text`, for diagnostics.
pub fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
