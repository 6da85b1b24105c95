#![cfg(unix)]

use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

static SUITE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Stand-in compiler driver: collects the `// PRINT:` payload of its inputs
/// (in argv order) into the `-o` artifact, plus run-mode markers. Refuses
/// inputs carrying a BUILDFAIL marker.
const FAKE_MAPLE: &str = r#"out=""
prev=""
inputs=""
for a in "$@"; do
  if [ "$prev" = "-o" ]; then out="$a"; fi
  prev="$a"
  case "$a" in *.java) inputs="$inputs $a";; esac
done
: > "$out"
for f in $inputs; do
  if grep -q BUILDFAIL "$f"; then
    echo "build failed: $f" >&2
    exit 1
  fi
  grep '^// PRINT:' "$f" | sed 's|^// PRINT:||' >> "$out"
  if grep -q '^// MODE:hang' "$f"; then echo '@hang' >> "$out"; fi
  if grep -q '^// MODE:crash' "$f"; then echo '@crash' >> "$out"; fi
done
exit 0"#;

/// Stand-in runtime shell: replays the artifact built by the fake compiler.
const FAKE_RUN: &str = r#"art="$1"
if grep -q '@hang' "$art"; then sleep 30; fi
if grep -q '@crash' "$art"; then kill -SEGV $$; fi
grep -v '^@' "$art"
exit 0"#;

struct Suite {
    root: PathBuf,
    maple: PathBuf,
    run: PathBuf,
}

impl Suite {
    fn new() -> Suite {
        let n = SUITE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!(
            "mpltest-cli-{}-{n}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(root.join("suite")).expect("create suite root");

        let maple = write_script(&root.join("fakemaple.sh"), FAKE_MAPLE);
        let run = write_script(&root.join("fakerun.sh"), FAKE_RUN);
        Suite { root, maple, run }
    }

    fn suite_dir(&self) -> PathBuf {
        self.root.join("suite")
    }

    fn case(&self, id: &str, primary: &str, source: &str) {
        let dir = self.suite_dir().join(id);
        std::fs::create_dir_all(&dir).expect("create case dir");
        std::fs::write(dir.join(primary), source).expect("write case source");
    }

    fn run_args(&self) -> Vec<String> {
        vec![
            "run".to_string(),
            self.suite_dir().display().to_string(),
            "--maple".to_string(),
            self.maple.display().to_string(),
            "--run-cmd".to_string(),
            self.run.display().to_string(),
            "--artifact-dir".to_string(),
            self.root.join("artifacts").display().to_string(),
        ]
    }
}

impl Drop for Suite {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

fn write_script(path: &Path, body: &str) -> PathBuf {
    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod script");
    path.to_path_buf()
}

fn mpltest(args: &[String]) -> std::process::Output {
    let exe = env!("CARGO_BIN_EXE_mpltest");
    Command::new(exe).args(args).output().expect("run mpltest")
}

fn parse_report(out: &std::process::Output) -> Value {
    serde_json::from_slice(&out.stdout).unwrap_or_else(|err| {
        panic!(
            "report JSON ({err}), stdout:\n{}\nstderr:\n{}",
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr)
        )
    })
}

fn case_by_id<'a>(report: &'a Value, id: &str) -> &'a Value {
    report["cases"]
        .as_array()
        .expect("cases[]")
        .iter()
        .find(|c| c["id"] == id)
        .unwrap_or_else(|| panic!("no case {id} in report"))
}

fn diag_codes(case: &Value) -> Vec<&str> {
    case["diags"]
        .as_array()
        .map(|d| {
            d.iter()
                .map(|v| v["code"].as_str().expect("diag.code"))
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn default_pipeline_passes_and_reports() {
    let suite = Suite::new();
    suite.case(
        "t0001",
        "Start.java",
        "// PRINT:0\npublic class Start {}\n",
    );

    let out = mpltest(&suite.run_args());
    assert_eq!(
        out.status.code(),
        Some(0),
        "stderr:\n{}",
        String::from_utf8_lossy(&out.stderr)
    );

    let report = parse_report(&out);
    assert_eq!(report["schema_version"], "mpltest.report@0.1.0");
    assert_eq!(report["tool"]["name"], "mpltest");
    assert_eq!(report["summary"]["passed"], 1);
    assert_eq!(report["summary"]["failed"], 0);

    let case = case_by_id(&report, "t0001");
    assert_eq!(case["verdict"], "pass");
    let steps = case["steps"].as_array().expect("steps[]");
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0]["kind"], "build");
    assert_eq!(steps[1]["kind"], "run");
    // The run stdout is embedded base64: "0\n".
    assert_eq!(steps[1]["stdout_b64"], "MAo=");
}

#[test]
fn output_mismatch_fails_with_exit_10() {
    let suite = Suite::new();
    suite.case(
        "t0001",
        "Start.java",
        "// PRINT:7\npublic class Start {}\n",
    );

    let out = mpltest(&suite.run_args());
    assert_eq!(out.status.code(), Some(10));

    let report = parse_report(&out);
    let case = case_by_id(&report, "t0001");
    assert_eq!(case["verdict"], "fail");
    assert!(diag_codes(case).contains(&"ECOMPARE_MISMATCH"));
}

#[test]
fn assert_scan_directive_spans_whitespace() {
    let suite = Suite::new();
    suite.case(
        "t0001",
        "Start.java",
        "// PRINT:33 33\n// PRINT:-1\n// ASSERT: scan 33\\s*33\\s*-1\\n\npublic class Start {}\n",
    );

    let out = mpltest(&suite.run_args());
    let report = parse_report(&out);
    assert_eq!(
        case_by_id(&report, "t0001")["verdict"],
        "pass",
        "stderr:\n{}",
        String::from_utf8_lossy(&out.stderr)
    );
}

#[test]
fn missing_dependency_is_a_build_error_and_never_builds() {
    let suite = Suite::new();
    suite.case(
        "t0001",
        "Start.java",
        "// DEPENDENCE: Nope.java\npublic class Start {}\n",
    );
    // A build tool that leaves proof it was invoked.
    let sentinel = suite.root.join("built");
    let tattling_maple = write_script(
        &suite.root.join("tattle.sh"),
        &format!("touch {}", sentinel.display()),
    );

    let mut args = suite.run_args();
    args[3] = tattling_maple.display().to_string();
    let out = mpltest(&args);
    assert_eq!(out.status.code(), Some(10));

    let report = parse_report(&out);
    let case = case_by_id(&report, "t0001");
    assert_eq!(case["verdict"], "build_error");
    assert!(diag_codes(case).contains(&"EDEP_MISSING"));
    assert!(!sentinel.exists(), "build tool must not run");
}

#[test]
fn malformed_directive_does_not_abort_the_suite() {
    let suite = Suite::new();
    suite.case(
        "bad",
        "Start.java",
        "// EXEC:%maple %bogus -o %n.so\npublic class Start {}\n",
    );
    suite.case(
        "good",
        "Start.java",
        "// PRINT:0\npublic class Start {}\n",
    );

    let out = mpltest(&suite.run_args());
    assert_eq!(out.status.code(), Some(10));

    let report = parse_report(&out);
    assert_eq!(report["summary"]["passed"], 1);
    assert_eq!(report["summary"]["build_errors"], 1);
    let bad = case_by_id(&report, "bad");
    assert_eq!(bad["verdict"], "build_error");
    assert!(diag_codes(bad).contains(&"EDIRECTIVE_MALFORMED"));
    assert_eq!(case_by_id(&report, "good")["verdict"], "pass");
}

#[test]
fn build_failure_is_a_build_error_verdict() {
    let suite = Suite::new();
    suite.case(
        "t0001",
        "Start.java",
        "// BUILDFAIL\npublic class Start {}\n",
    );

    let out = mpltest(&suite.run_args());
    let report = parse_report(&out);
    let case = case_by_id(&report, "t0001");
    assert_eq!(case["verdict"], "build_error");
    assert!(diag_codes(case).contains(&"EBUILD"));
    // Only the build step ran.
    assert_eq!(case["steps"].as_array().expect("steps[]").len(), 1);
}

#[test]
fn hung_case_times_out_and_scratch_space_is_removed() {
    let suite = Suite::new();
    suite.case(
        "t0001",
        "Start.java",
        "// MODE:hang\npublic class Start {}\n",
    );

    let mut args = suite.run_args();
    args.push("--timeout-secs".to_string());
    args.push("1".to_string());
    let out = mpltest(&args);
    assert_eq!(out.status.code(), Some(10));

    let report = parse_report(&out);
    let case = case_by_id(&report, "t0001");
    assert_eq!(case["verdict"], "timeout");
    assert!(diag_codes(case).contains(&"ERUN_TIMEOUT"));

    // Scratch dirs under <artifact-dir>/_tmp are per-case and removed.
    let tmp_root = suite.root.join("artifacts/_tmp");
    let leftovers: Vec<_> = std::fs::read_dir(&tmp_root)
        .expect("tmp root exists")
        .collect();
    assert!(leftovers.is_empty(), "leftover scratch dirs: {leftovers:?}");
}

#[test]
fn crashing_case_reports_the_signal() {
    let suite = Suite::new();
    suite.case(
        "t0001",
        "Start.java",
        "// MODE:crash\npublic class Start {}\n",
    );

    let out = mpltest(&suite.run_args());
    let report = parse_report(&out);
    let case = case_by_id(&report, "t0001");
    assert_eq!(case["verdict"], "crash");
    assert!(diag_codes(case).contains(&"ERUN_CRASH"));
    let run = &case["steps"].as_array().expect("steps[]")[1];
    assert_eq!(run["exit_signal"], 11);
}

#[test]
fn checksum_expectation_from_expected_file() {
    let suite = Suite::new();
    suite.case(
        "t0001",
        "Start.java",
        "// PRINT:FIGO-FUZZ-START-FLAG\n// PRINT:FIGO-FUZZ-Checksum=0xdeadbeef\npublic class Start {}\n",
    );
    std::fs::write(
        suite.suite_dir().join("t0001/expected.txt"),
        "FIGO-FUZZ-START-FLAG\nFIGO-FUZZ-Checksum=0xdeadbeef\n",
    )
    .expect("write expected.txt");

    let out = mpltest(&suite.run_args());
    let report = parse_report(&out);
    assert_eq!(
        case_by_id(&report, "t0001")["verdict"],
        "pass",
        "stderr:\n{}",
        String::from_utf8_lossy(&out.stderr)
    );
}

#[test]
fn wildcard_build_keeps_declaration_order() {
    let suite = Suite::new();
    // The fake compiler concatenates inputs in argv order, so declaration
    // order is observable in the program output.
    suite.case(
        "t0001",
        "Start.java",
        "// DEPENDENCE: Bb.java Aa.java\n// EXEC:%maple *.java %build_option -o %n.so\n// EXEC:%run %n.so %n %run_option | compare %f\n// ASSERT: scan start\\s*bb\\s*aa\\n\npublic class Start {}\n// PRINT:start\n",
    );
    std::fs::write(
        suite.suite_dir().join("t0001/Bb.java"),
        "class Bb {}\n// PRINT:bb\n",
    )
    .expect("write Bb.java");
    std::fs::write(
        suite.suite_dir().join("t0001/Aa.java"),
        "class Aa {}\n// PRINT:aa\n",
    )
    .expect("write Aa.java");

    let out = mpltest(&suite.run_args());
    let report = parse_report(&out);
    assert_eq!(
        case_by_id(&report, "t0001")["verdict"],
        "pass",
        "stderr:\n{}",
        String::from_utf8_lossy(&out.stderr)
    );
}

#[test]
fn expired_deadline_reports_undispatched_cases_as_not_run() {
    let suite = Suite::new();
    suite.case("t0001", "Start.java", "// PRINT:0\npublic class Start {}\n");
    suite.case("t0002", "Start.java", "// PRINT:0\npublic class Start {}\n");

    let mut args = suite.run_args();
    args.push("--deadline-secs".to_string());
    args.push("0".to_string());
    let out = mpltest(&args);
    assert_eq!(out.status.code(), Some(10));

    let report = parse_report(&out);
    assert_eq!(report["summary"]["not_run"], 2);
    for id in ["t0001", "t0002"] {
        let case = case_by_id(&report, id);
        assert_eq!(case["verdict"], "not_run");
        assert!(diag_codes(case).contains(&"EDEADLINE"));
        assert!(case["steps"].as_array().map(Vec::is_empty).unwrap_or(true));
    }
}

#[test]
fn list_prints_case_ids_without_running() {
    let suite = Suite::new();
    suite.case("zz", "Start.java", "// PRINT:0\npublic class Start {}\n");
    suite.case("aa", "Main.java", "// PRINT:0\npublic class Main {}\n");

    let mut args = suite.run_args();
    args.push("--list".to_string());
    let out = mpltest(&args);
    assert_eq!(out.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert_eq!(stdout, "aa\tMain.java\nzz\tStart.java\n");
}

#[test]
fn filter_selects_matching_cases() {
    let suite = Suite::new();
    suite.case("strings/concat", "Start.java", "// PRINT:0\nclass Start {}\n");
    suite.case("arrays/init", "Start.java", "// PRINT:7\nclass Start {}\n");

    let mut args = suite.run_args();
    args.push("--filter".to_string());
    args.push("strings".to_string());
    let out = mpltest(&args);
    assert_eq!(
        out.status.code(),
        Some(0),
        "stderr:\n{}",
        String::from_utf8_lossy(&out.stderr)
    );
    let report = parse_report(&out);
    assert_eq!(report["cases"].as_array().expect("cases[]").len(), 1);
}

#[test]
fn report_out_writes_the_same_json() {
    let suite = Suite::new();
    suite.case("t0001", "Start.java", "// PRINT:0\npublic class Start {}\n");
    let report_path = suite.root.join("report.json");

    let mut args = suite.run_args();
    args.push("--report-out".to_string());
    args.push(report_path.display().to_string());
    args.push("--jobs".to_string());
    args.push("2".to_string());
    let out = mpltest(&args);
    assert_eq!(out.status.code(), Some(0));

    let on_disk: Value =
        serde_json::from_slice(&std::fs::read(&report_path).expect("read report"))
            .expect("parse report file");
    assert_eq!(on_disk["summary"]["passed"], 1);
    assert_eq!(on_disk["invocation"]["jobs"], 2);
}

#[test]
fn suite_config_file_supplies_tool_defaults() {
    let suite = Suite::new();
    suite.case("t0001", "Start.java", "// PRINT:0\npublic class Start {}\n");
    std::fs::write(
        suite.suite_dir().join("mpltest.json"),
        format!(
            r#"{{"schema_version":"mpltest.config@0.1.0","maple":"{}","run_cmd":"{}"}}"#,
            suite.maple.display(),
            suite.run.display()
        ),
    )
    .expect("write mpltest.json");

    // No --maple/--run-cmd flags: both come from the config file.
    let args = vec![
        "run".to_string(),
        suite.suite_dir().display().to_string(),
        "--artifact-dir".to_string(),
        suite.root.join("artifacts").display().to_string(),
    ];
    let out = mpltest(&args);
    assert_eq!(
        out.status.code(),
        Some(0),
        "stderr:\n{}",
        String::from_utf8_lossy(&out.stderr)
    );
}

#[test]
fn keep_artifacts_retains_staged_case_dirs() {
    let suite = Suite::new();
    suite.case("t0001", "Start.java", "// PRINT:0\npublic class Start {}\n");

    let mut args = suite.run_args();
    args.push("--keep-artifacts".to_string());
    let out = mpltest(&args);
    assert_eq!(out.status.code(), Some(0));

    let cases_dir = suite.root.join("artifacts/cases");
    let kept: Vec<_> = std::fs::read_dir(&cases_dir)
        .expect("cases dir exists")
        .map(|e| e.expect("dir entry").path())
        .collect();
    assert_eq!(kept.len(), 1);
    assert!(kept[0].join("Start.java").is_file());
    assert!(kept[0].join("Start.so").is_file());
}
