//! Machine-readable run report.

use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use mpltest_contracts::MPLTEST_REPORT_SCHEMA_VERSION;
use mpltest_harness::directive::StepKind;
use mpltest_harness::{CaseOutcome, Diag, StepRecord, Verdict};

#[derive(Debug, Clone, serde::Serialize)]
pub struct MplTestReport {
    pub schema_version: String,
    pub tool: ToolInfo,
    pub invocation: InvocationInfo,
    pub summary: Summary,
    pub cases: Vec<CaseReport>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct InvocationInfo {
    pub argv: Vec<String>,
    pub cwd: String,
    pub suite_dir: String,
    pub jobs: usize,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Summary {
    pub passed: u64,
    pub failed: u64,
    pub build_errors: u64,
    pub build_timeouts: u64,
    pub timeouts: u64,
    pub crashes: u64,
    pub not_run: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CaseReport {
    pub id: String,
    pub verdict: Verdict,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepSection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diags: Vec<Diag>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StepSection {
    pub kind: &'static str,
    pub cmd: Vec<String>,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_signal: Option<i32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
    pub duration_ms: u64,
    pub stdout_b64: String,
    pub stderr_b64: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stdout_truncated: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stderr_truncated: bool,
}

impl StepSection {
    fn from_record(record: &StepRecord) -> StepSection {
        let b64 = base64::engine::general_purpose::STANDARD;
        let out = &record.outcome;
        StepSection {
            kind: match record.kind {
                StepKind::Build => "build",
                StepKind::Run => "run",
            },
            cmd: record.cmd.clone(),
            exit_code: out.exit_status,
            exit_signal: out.exit_signal,
            timed_out: out.timed_out,
            duration_ms: out.duration.as_millis() as u64,
            stdout_b64: b64.encode(&out.stdout),
            stderr_b64: b64.encode(&out.stderr),
            stdout_truncated: out.stdout_truncated,
            stderr_truncated: out.stderr_truncated,
        }
    }
}

impl CaseReport {
    pub fn from_outcome(id: &str, outcome: &CaseOutcome) -> CaseReport {
        CaseReport {
            id: id.to_string(),
            verdict: outcome.verdict,
            duration_ms: outcome.duration.as_millis() as u64,
            steps: outcome.steps.iter().map(StepSection::from_record).collect(),
            diags: outcome.diags.clone(),
        }
    }

    pub fn not_run(id: &str) -> CaseReport {
        CaseReport {
            id: id.to_string(),
            verdict: Verdict::NotRun,
            duration_ms: 0,
            steps: Vec::new(),
            diags: vec![Diag::new(
                "EDEADLINE",
                "not dispatched before the run deadline",
            )],
        }
    }
}

pub fn finalize_report(
    suite_dir: &std::path::Path,
    jobs: usize,
    elapsed: Duration,
    cases: Vec<CaseReport>,
) -> MplTestReport {
    let mut summary = Summary::default();
    for case in &cases {
        match case.verdict {
            Verdict::Pass => summary.passed += 1,
            Verdict::Fail => summary.failed += 1,
            Verdict::BuildError => summary.build_errors += 1,
            Verdict::BuildTimeout => summary.build_timeouts += 1,
            Verdict::Timeout => summary.timeouts += 1,
            Verdict::Crash => summary.crashes += 1,
            Verdict::NotRun => summary.not_run += 1,
        }
    }
    summary.duration_ms = elapsed.as_millis() as u64;

    MplTestReport {
        schema_version: MPLTEST_REPORT_SCHEMA_VERSION.to_string(),
        tool: ToolInfo {
            name: "mpltest".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        invocation: InvocationInfo {
            argv: std::env::args().collect(),
            cwd: std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .display()
                .to_string(),
            suite_dir: suite_dir.display().to_string(),
            jobs,
        },
        summary,
        cases,
    }
}

/// Exit 0 when every case passed, 10 when any case did not; harness-level
/// errors exit 2 from `main`.
pub fn compute_exit_code(report: &MplTestReport) -> u8 {
    let s = &report.summary;
    let failing = s.failed
        + s.build_errors
        + s.build_timeouts
        + s.timeouts
        + s.crashes
        + s.not_run;
    if failing > 0 {
        10
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn case(verdict: Verdict) -> CaseReport {
        CaseReport {
            id: "t".to_string(),
            verdict,
            duration_ms: 1,
            steps: Vec::new(),
            diags: Vec::new(),
        }
    }

    #[test]
    fn summary_counts_each_verdict_bucket() {
        let report = finalize_report(
            Path::new("."),
            1,
            Duration::from_millis(7),
            vec![
                case(Verdict::Pass),
                case(Verdict::Pass),
                case(Verdict::Fail),
                case(Verdict::BuildError),
                case(Verdict::Timeout),
                case(Verdict::Crash),
                case(Verdict::NotRun),
            ],
        );
        assert_eq!(report.summary.passed, 2);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.build_errors, 1);
        assert_eq!(report.summary.timeouts, 1);
        assert_eq!(report.summary.crashes, 1);
        assert_eq!(report.summary.not_run, 1);
        assert_eq!(compute_exit_code(&report), 10);
    }

    #[test]
    fn all_pass_exits_zero() {
        let report = finalize_report(
            Path::new("."),
            1,
            Duration::from_millis(1),
            vec![case(Verdict::Pass)],
        );
        assert_eq!(compute_exit_code(&report), 0);
    }
}
