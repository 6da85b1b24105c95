//! Optional `mpltest.json` suite configuration.
//!
//! The file carries suite-wide defaults (tool names, options, timeouts) so CI
//! invocations stay short. Command-line flags always win over file values.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use mpltest_contracts::MPLTEST_CONFIG_SCHEMA_VERSION;
use serde::Deserialize;

pub const CONFIG_FILE_NAME: &str = "mpltest.json";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteConfig {
    #[serde(default)]
    pub schema_version: Option<String>,
    #[serde(default)]
    pub maple: Option<String>,
    #[serde(default)]
    pub run_cmd: Option<String>,
    #[serde(default)]
    pub build_option: Option<String>,
    #[serde(default)]
    pub run_option: Option<String>,
    #[serde(default)]
    pub fixture_dir: Option<PathBuf>,
    #[serde(default)]
    pub build_timeout_secs: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Loads the suite config: an explicit `--config` path must exist, otherwise
/// `mpltest.json` in the suite directory is picked up when present.
pub fn load(explicit: Option<&Path>, suite_dir: &Path) -> Result<SuiteConfig> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => {
            let cand = suite_dir.join(CONFIG_FILE_NAME);
            if !cand.is_file() {
                return Ok(SuiteConfig::default());
            }
            cand
        }
    };

    let bytes = std::fs::read(&path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let config: SuiteConfig = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse config JSON: {}", path.display()))?;

    if let Some(version) = &config.schema_version {
        if version.trim() != MPLTEST_CONFIG_SCHEMA_VERSION {
            anyhow::bail!(
                "config schema_version mismatch: expected {} got {:?}",
                MPLTEST_CONFIG_SCHEMA_VERSION,
                version
            );
        }
    }

    // Relative fixture_dir is suite-relative, not cwd-relative.
    let fixture_dir = config.fixture_dir.as_ref().map(|d| {
        if d.is_absolute() {
            d.clone()
        } else {
            suite_dir.join(d)
        }
    });

    Ok(SuiteConfig {
        fixture_dir,
        ..config
    })
}
