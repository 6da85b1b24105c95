//! Suite discovery.
//!
//! A case is a directory holding `.java` sources. The primary source is the
//! one carrying directive comments; a directory with a single `.java` file
//! and no directives is still a case, running entirely on defaults.
//! Directories whose sources are only referenced as dependencies of other
//! cases carry no directives and more than one file, and are skipped.

use std::path::Path;

use anyhow::{Context, Result};
use mpltest_harness::directive::{ASSERT_PREFIX, DEPENDENCE_PREFIX, EXEC_PREFIX};
use mpltest_harness::TestCase;
use walkdir::WalkDir;

pub fn discover_cases(suite_dir: &Path) -> Result<Vec<TestCase>> {
    let suite_dir = suite_dir
        .canonicalize()
        .with_context(|| format!("suite directory: {}", suite_dir.display()))?;

    let mut cases = Vec::new();
    for entry in WalkDir::new(&suite_dir).follow_links(false) {
        let entry = entry.context("walk suite directory")?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let dir = entry.path();

        if let Some(primary) = select_primary(dir)? {
            let id = case_id(&suite_dir, dir);
            cases.push(TestCase {
                id,
                dir: dir.to_path_buf(),
                primary,
            });
        }
    }

    cases.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(cases)
}

/// Picks the primary source of a directory, or `None` when the directory is
/// not a case. Ties between directive-carrying files break lexicographically.
fn select_primary(dir: &Path) -> Result<Option<String>> {
    let mut sources: Vec<String> = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("read dir: {}", dir.display()))?
    {
        let entry = entry.with_context(|| format!("read dir: {}", dir.display()))?;
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.ends_with(".java") {
            sources.push(name.to_string());
        }
    }
    sources.sort();

    let mut directive_carriers = sources.iter().filter(|name| {
        std::fs::read_to_string(dir.join(name.as_str()))
            .map(|src| has_directives(&src))
            .unwrap_or(false)
    });
    if let Some(primary) = directive_carriers.next() {
        return Ok(Some(primary.clone()));
    }

    if sources.len() == 1 {
        return Ok(Some(sources.remove(0)));
    }
    Ok(None)
}

fn has_directives(source: &str) -> bool {
    source.lines().any(|line| {
        let line = line.trim_start();
        line.starts_with(DEPENDENCE_PREFIX)
            || line.starts_with(EXEC_PREFIX)
            || line.starts_with(ASSERT_PREFIX)
    })
}

/// Case id: directory path relative to the suite root, `/`-separated. The
/// suite root itself gets the id `.`.
fn case_id(suite_dir: &Path, dir: &Path) -> String {
    let rel = dir.strip_prefix(suite_dir).unwrap_or(dir);
    let id: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if id.is_empty() {
        ".".to_string()
    } else {
        id.join("/")
    }
}
