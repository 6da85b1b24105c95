//! Directive comment parsing.
//!
//! Test cases embed their build/run/compare contract in comment lines with
//! fixed literal prefixes:
//!
//! ```text
//! // DEPENDENCE: MainClass.java CRC32.java
//! // EXEC:%maple *.java %build_option -o %n.so
//! // EXEC:%run %n.so %n %run_option | compare %f
//! // ASSERT: scan 0\n
//! ```
//!
//! Order of appearance is preserved: multiple EXEC lines form an ordered
//! build-then-run pipeline. Missing directives apply documented defaults.

use std::fmt;

pub const DEPENDENCE_PREFIX: &str = "// DEPENDENCE:";
pub const EXEC_PREFIX: &str = "// EXEC:";
pub const ASSERT_PREFIX: &str = "// ASSERT:";

/// Applied when a case declares no build EXEC.
pub const DEFAULT_BUILD_TEMPLATE: &str = "%maple %f %build_option -o %n.so";
/// Applied when a case declares no run EXEC.
pub const DEFAULT_RUN_TEMPLATE: &str = "%run %n.so %n %run_option | compare %f";
/// Applied when a case declares no ASSERT and ships no expected.txt.
pub const DEFAULT_ASSERT_PATTERN: &str = "0\\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    Maple,
    Run,
    File,
    Name,
    BuildOption,
    RunOption,
}

// Longest names first so `%build_option` is never read as `%build` + junk
// and `%run_option` is never read as `%run`.
const PLACEHOLDER_NAMES: &[(&str, Placeholder)] = &[
    ("%build_option", Placeholder::BuildOption),
    ("%run_option", Placeholder::RunOption),
    ("%maple", Placeholder::Maple),
    ("%run", Placeholder::Run),
    ("%f", Placeholder::File),
    ("%n", Placeholder::Name),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Build,
    Run,
}

/// One EXEC line, template still unsubstituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecStep {
    pub kind: StepKind,
    pub template: String,
    /// The template carried a `| compare …` suffix: this step's stdout is
    /// the comparison input. The suffix itself is stripped, never executed.
    pub compare: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directives {
    pub dependencies: Vec<String>,
    pub steps: Vec<ExecStep>,
    pub assert_pattern: Option<String>,
}

impl Directives {
    pub fn build_steps(&self) -> impl Iterator<Item = &ExecStep> {
        self.steps.iter().filter(|s| s.kind == StepKind::Build)
    }

    pub fn run_steps(&self) -> impl Iterator<Item = &ExecStep> {
        self.steps.iter().filter(|s| s.kind == StepKind::Run)
    }

    /// Fill in the conventional build/run steps where the case declares none.
    pub fn apply_defaults(&mut self) {
        if self.build_steps().next().is_none() {
            self.steps.insert(
                0,
                parse_exec_step(DEFAULT_BUILD_TEMPLATE, 0)
                    .expect("default build template is well formed"),
            );
        }
        if self.run_steps().next().is_none() {
            self.steps.push(
                parse_exec_step(DEFAULT_RUN_TEMPLATE, 0)
                    .expect("default run template is well formed"),
            );
        }
    }
}

/// A directive line the harness cannot accept. Reported, not fatal to the
/// whole run: the offending case is verdicted as a build error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedDirective {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for MalformedDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for MalformedDirective {}

pub fn parse_directives(source: &str) -> Result<Directives, MalformedDirective> {
    let mut out = Directives::default();

    for (idx, raw) in source.lines().enumerate() {
        // Indented directives count; discovery recognizes them the same way.
        let line = raw.trim();
        if let Some(rest) = line.strip_prefix(DEPENDENCE_PREFIX) {
            out.dependencies
                .extend(rest.split_whitespace().map(str::to_string));
        } else if let Some(rest) = line.strip_prefix(EXEC_PREFIX) {
            out.steps.push(parse_exec_step(rest, idx + 1)?);
        } else if let Some(rest) = line.strip_prefix(ASSERT_PREFIX) {
            out.assert_pattern = Some(parse_assert(rest, idx + 1)?);
        }
    }

    Ok(out)
}

fn parse_exec_step(raw: &str, line: usize) -> Result<ExecStep, MalformedDirective> {
    let mut template = raw.trim();
    let mut compare = false;

    if let Some(pos) = template.find('|') {
        let tail = template[pos + 1..].trim();
        if tail != "compare" && !tail.starts_with("compare ") {
            return Err(MalformedDirective {
                line,
                message: format!("unsupported pipeline stage: {tail:?}"),
            });
        }
        scan_placeholders(tail).map_err(|tok| MalformedDirective {
            line,
            message: format!("unknown placeholder {tok:?}"),
        })?;
        compare = true;
        template = template[..pos].trim_end();
    }

    if template.is_empty() {
        return Err(MalformedDirective {
            line,
            message: "empty EXEC command".to_string(),
        });
    }

    let placeholders = scan_placeholders(template).map_err(|tok| MalformedDirective {
        line,
        message: format!("unknown placeholder {tok:?}"),
    })?;

    let kind = if placeholders.contains(&Placeholder::Run) {
        StepKind::Run
    } else {
        StepKind::Build
    };

    Ok(ExecStep {
        kind,
        template: template.to_string(),
        compare,
    })
}

fn parse_assert(raw: &str, line: usize) -> Result<String, MalformedDirective> {
    let rest = raw.trim_start();
    // The mode is a whole token: `scanner` is not `scan`.
    let (mode, pattern) = match rest.split_once(char::is_whitespace) {
        Some((mode, pattern)) => (mode, pattern),
        None => (rest, ""),
    };
    if mode != "scan" {
        return Err(MalformedDirective {
            line,
            message: format!("unknown comparison mode: {mode:?}"),
        });
    }

    let pattern = pattern.trim();
    if pattern.is_empty() {
        return Err(MalformedDirective {
            line,
            message: "empty scan pattern".to_string(),
        });
    }
    Ok(pattern.to_string())
}

/// Lists the placeholders a template references; an unknown `%` token is an
/// error carrying the offending token text.
pub fn scan_placeholders(template: &str) -> Result<Vec<Placeholder>, String> {
    let bytes = template.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'%' {
            i += 1;
            continue;
        }
        let rest = &template[i..];
        match PLACEHOLDER_NAMES
            .iter()
            .find(|(name, _)| rest.starts_with(name))
        {
            Some((name, placeholder)) => {
                found.push(*placeholder);
                i += name.len();
            }
            None => {
                let token: String = rest
                    .chars()
                    .take_while(|c| !c.is_whitespace())
                    .collect();
                return Err(token);
            }
        }
    }

    Ok(found)
}

/// Concrete values for one case's template expansion.
#[derive(Debug, Clone)]
pub struct Substitutions {
    pub maple: String,
    pub run: String,
    pub file: String,
    pub name: String,
    pub build_option: String,
    pub run_option: String,
}

/// Expands every placeholder in `template`. The template must already have
/// passed [`scan_placeholders`].
pub fn substitute(template: &str, subs: &Substitutions) -> String {
    let bytes = template.as_bytes();
    let mut out = String::with_capacity(template.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'%' {
            let ch = template[i..].chars().next().expect("char at byte index");
            out.push(ch);
            i += ch.len_utf8();
            continue;
        }
        let rest = &template[i..];
        match PLACEHOLDER_NAMES
            .iter()
            .find(|(name, _)| rest.starts_with(name))
        {
            Some((name, placeholder)) => {
                out.push_str(match placeholder {
                    Placeholder::Maple => &subs.maple,
                    Placeholder::Run => &subs.run,
                    Placeholder::File => &subs.file,
                    Placeholder::Name => &subs.name,
                    Placeholder::BuildOption => &subs.build_option,
                    Placeholder::RunOption => &subs.run_option,
                });
                i += name.len();
            }
            None => {
                out.push('%');
                i += 1;
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_corpus_style_directives() {
        let src = "\
public class Start {}\n\
// DEPENDENCE: MainClass.java CRC32.java CrcCheck.java\n\
// EXEC:%maple *.java %build_option -o %n.so\n\
// EXEC:%run %n.so %n %run_option | compare %f\n\
// ASSERT: scan 0\\n\n";

        let d = parse_directives(src).expect("parse");
        assert_eq!(
            d.dependencies,
            vec!["MainClass.java", "CRC32.java", "CrcCheck.java"]
        );
        assert_eq!(d.steps.len(), 2);
        assert_eq!(d.steps[0].kind, StepKind::Build);
        assert!(!d.steps[0].compare);
        assert_eq!(d.steps[1].kind, StepKind::Run);
        assert!(d.steps[1].compare);
        assert_eq!(d.steps[1].template, "%run %n.so %n %run_option");
        assert_eq!(d.assert_pattern.as_deref(), Some("0\\n"));
    }

    #[test]
    fn no_directives_yields_empty_set_and_defaults_fill_in() {
        let mut d = parse_directives("public class A {}\n").expect("parse");
        assert!(d.dependencies.is_empty());
        assert!(d.steps.is_empty());
        assert!(d.assert_pattern.is_none());

        d.apply_defaults();
        assert_eq!(d.build_steps().count(), 1);
        assert_eq!(d.run_steps().count(), 1);
        assert_eq!(d.steps[0].template, DEFAULT_BUILD_TEMPLATE);
    }

    #[test]
    fn defaults_do_not_duplicate_declared_steps() {
        let mut d =
            parse_directives("// EXEC:%maple %f %build_option -o %n.so\n").expect("parse");
        d.apply_defaults();
        assert_eq!(d.build_steps().count(), 1);
        assert_eq!(d.run_steps().count(), 1);
        // Declared build step stays first.
        assert_eq!(d.steps[0].template, "%maple %f %build_option -o %n.so");
    }

    #[test]
    fn unknown_placeholder_is_malformed() {
        let err = parse_directives("// EXEC:%maple %bogus -o %n.so\n").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.message.contains("%bogus"), "{}", err.message);
    }

    #[test]
    fn unknown_assert_mode_is_malformed() {
        let err = parse_directives("// ASSERT: diff expected.txt\n").unwrap_err();
        assert!(err.message.contains("diff"), "{}", err.message);
    }

    #[test]
    fn assert_mode_must_be_the_whole_token() {
        let err = parse_directives("// ASSERT: scanner x\n").unwrap_err();
        assert!(err.message.contains("scanner"), "{}", err.message);
    }

    #[test]
    fn indented_directives_are_recognized() {
        let d = parse_directives("    // EXEC:%maple %f %build_option -o %n.so\n")
            .expect("parse");
        assert_eq!(d.steps.len(), 1);
        assert_eq!(d.steps[0].kind, StepKind::Build);
    }

    #[test]
    fn non_compare_pipeline_is_malformed() {
        let err = parse_directives("// EXEC:%run %n.so | tee out.txt\n").unwrap_err();
        assert!(err.message.contains("tee"), "{}", err.message);
    }

    #[test]
    fn substitute_expands_adjacent_suffixes() {
        let subs = Substitutions {
            maple: "maple".to_string(),
            run: "mplsh".to_string(),
            file: "Start.java".to_string(),
            name: "Start".to_string(),
            build_option: "-O2".to_string(),
            run_option: String::new(),
        };
        let out = substitute("%run %n.so %n %run_option", &subs);
        assert_eq!(out, "mplsh Start.so Start ");
        let out = substitute("%maple %f %build_option -o %n.so", &subs);
        assert_eq!(out, "maple Start.java -O2 -o Start.so");
    }
}
