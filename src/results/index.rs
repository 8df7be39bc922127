//! The aggregate `runs/index.json` and per-suite `stats.json` emitters.
//!
//! Both files are derived purely from the on-disk result tree so they can
//! be regenerated at any time.

use super::layout::RunResult;
use crate::fsutil::FsWriter;
use color_eyre::Result;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, fs, path::Path};
use tracing::warn;

/// One entry in `runs/index.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct IndexEntry {
    /// The run id (directory name).
    pub(crate) run_id: String,
    /// The run status; `"unknown"` when `config.json` is missing.
    pub(crate) status: String,
    /// The start timestamp, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) timestamp: Option<String>,
    /// The instance id, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) instance: Option<String>,
    /// The client family, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) client: Option<String>,
    /// The suite hash, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) suite: Option<String>,
    /// The test counts, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) test_counts: Option<Value>,
}

/// Scans `runs/` and rewrites `runs/index.json`.
pub(crate) fn generate_runs_index(results_dir: &Path, fs_writer: &FsWriter) -> Result<Vec<IndexEntry>> {
    let runs_dir = results_dir.join("runs");
    let mut entries = Vec::new();

    if runs_dir.is_dir() {
        for entry in fs::read_dir(&runs_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let run_id = entry.file_name().to_string_lossy().into_owned();
            entries.push(index_entry(&entry.path(), run_id));
        }
    }

    entries.sort_by(|a, b| a.run_id.cmp(&b.run_id));
    fs_writer.write_json(&runs_dir.join("index.json"), &entries)?;
    Ok(entries)
}

/// Builds the index entry of one run directory. A missing or unreadable
/// `config.json` yields an `"unknown"` status rather than dropping the run.
fn index_entry(run_dir: &Path, run_id: String) -> IndexEntry {
    let config: Option<Value> = fs::read_to_string(run_dir.join("config.json"))
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok());

    let field = |name: &str| -> Option<String> {
        config
            .as_ref()
            .and_then(|c| c.get(name))
            .and_then(Value::as_str)
            .map(Into::into)
    };

    IndexEntry {
        status: field("status").unwrap_or_else(|| "unknown".into()),
        timestamp: field("timestamp"),
        instance: config
            .as_ref()
            .and_then(|c| c.pointer("/instance/id"))
            .and_then(Value::as_str)
            .map(Into::into),
        client: config
            .as_ref()
            .and_then(|c| c.pointer("/instance/family"))
            .and_then(Value::as_str)
            .map(Into::into),
        suite: field("suite"),
        test_counts: config.as_ref().and_then(|c| c.get("test_counts")).cloned(),
        run_id,
    }
}

/// One per-run test summary inside a suite's `stats.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SuiteTestRunStats {
    /// The run id.
    pub(crate) run_id: String,
    /// The instance id, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) instance: Option<String>,
    /// Test-step wall time, nanoseconds.
    pub(crate) wall_time_ns: u64,
    /// Test-step gas total.
    pub(crate) gas_used_total: u64,
    /// Test-step successful calls.
    pub(crate) succeeded: u64,
    /// Test-step failed calls.
    pub(crate) failed: u64,
}

/// Rewrites `suites/<hash>/stats.json`: for every test of the suite, the
/// per-run test-step summaries of all runs that executed it.
pub(crate) fn generate_suite_stats(
    results_dir: &Path,
    suite_hash: &str,
    fs_writer: &FsWriter,
) -> Result<BTreeMap<String, Vec<SuiteTestRunStats>>> {
    let runs_dir = results_dir.join("runs");
    let mut stats: BTreeMap<String, Vec<SuiteTestRunStats>> = BTreeMap::new();

    if runs_dir.is_dir() {
        let run_dirs = fs::read_dir(&runs_dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .sorted_by_key(|entry| entry.file_name());

        for entry in run_dirs {
            let run_dir = entry.path();
            let run_id = entry.file_name().to_string_lossy().into_owned();

            let config: Option<Value> = fs::read_to_string(run_dir.join("config.json"))
                .ok()
                .and_then(|raw| serde_json::from_str(&raw).ok());
            let run_suite = config
                .as_ref()
                .and_then(|c| c.get("suite"))
                .and_then(Value::as_str);
            if run_suite != Some(suite_hash) {
                continue;
            }
            let instance = config
                .as_ref()
                .and_then(|c| c.pointer("/instance/id"))
                .and_then(Value::as_str)
                .map(String::from);

            let result: RunResult = match fs::read_to_string(run_dir.join("result.json")) {
                Ok(raw) => match serde_json::from_str(&raw) {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(target: "results", "unreadable result.json in {run_id}: {e}");
                        continue;
                    }
                },
                Err(_) => continue,
            };

            for (test_name, test) in &result.tests {
                let Some(aggregated) = &test.test else {
                    continue;
                };
                stats.entry(test_name.clone()).or_default().push(SuiteTestRunStats {
                    run_id: run_id.clone(),
                    instance: instance.clone(),
                    wall_time_ns: aggregated.wall_time_ns,
                    gas_used_total: aggregated.gas_used_total,
                    succeeded: aggregated.succeeded,
                    failed: aggregated.failed,
                });
            }
        }
    }

    fs_writer.write_json(
        &crate::suite::suite_dir(results_dir, suite_hash).join("stats.json"),
        &stats,
    )?;
    Ok(stats)
}
