//! The per-run result directory: step result writers and the `result.json`
//! walker.
//!
//! Layout, relative to the results root:
//!
//! ```text
//! runs/<runId>/config.json
//! runs/<runId>/result.json
//! runs/<runId>/<test>/{setup,test,cleanup}.response
//! runs/<runId>/<test>/{setup,test,cleanup}.result-details.json
//! runs/<runId>/<test>/{setup,test,cleanup}.result-aggregated.json
//! runs/<runId>/<test>/post_test_rpc_calls/<name>.json
//! runs/<runId>/pre_run_steps/<step>/pre_run.*.json
//! ```

use super::{
    stats::{aggregate, AggregatedStats, CallRecord},
    StepKind,
};
use crate::fsutil::FsWriter;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use tracing::warn;

/// The directory pre-run step results live under.
const PRE_RUN_DIR: &str = "pre_run_steps";

/// The aggregated result of one run, reconstructed from the
/// `*.result-aggregated.json` files under the run directory.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct RunResult {
    /// The run id.
    pub(crate) run_id: String,
    /// Per-test aggregates, keyed by test name.
    pub(crate) tests: BTreeMap<String, TestResult>,
    /// Per-pre-run-step aggregates, keyed by step name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) pre_run_steps: BTreeMap<String, AggregatedStats>,
}

/// The per-step aggregates of one test.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct TestResult {
    /// The setup step aggregate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) setup: Option<AggregatedStats>,
    /// The test step aggregate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) test: Option<AggregatedStats>,
    /// The cleanup step aggregate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) cleanup: Option<AggregatedStats>,
}

/// Test outcome counts recorded in `config.json`.
///
/// A test is counted `passed` when its test step had no failed calls, and
/// `failed` when any of its steps had failures; a test with a failing setup
/// and a passing test step contributes to both.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TestCounts {
    /// The number of tests that produced results.
    pub(crate) total: u64,
    /// Tests whose test step fully succeeded.
    pub(crate) passed: u64,
    /// Tests with at least one failed call in any step.
    pub(crate) failed: u64,
}

impl RunResult {
    /// Derives the test counts.
    pub(crate) fn test_counts(&self) -> TestCounts {
        let mut counts = TestCounts {
            total: self.tests.len() as u64,
            ..Default::default()
        };
        for test in self.tests.values() {
            if test.test.as_ref().is_some_and(|s| s.failed == 0) {
                counts.passed += 1;
            }
            let any_failed = [&test.setup, &test.test, &test.cleanup]
                .into_iter()
                .flatten()
                .any(|s| s.failed > 0);
            if any_failed {
                counts.failed += 1;
            }
        }
        counts
    }
}

/// Writes step results into one run directory.
#[derive(Debug, Clone)]
pub(crate) struct RunWriter {
    run_dir: PathBuf,
    fs: FsWriter,
}

impl RunWriter {
    /// Creates the writer (and the run directory).
    pub(crate) fn new(run_dir: PathBuf, fs: FsWriter) -> Result<Self> {
        fs.create_dir_all(&run_dir)?;
        Ok(Self { run_dir, fs })
    }

    /// The run directory.
    pub(crate) fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// The directory a step's result files live in.
    fn step_dir(&self, test_name: Option<&str>, kind: StepKind) -> PathBuf {
        match (kind, test_name) {
            (StepKind::PreRun, Some(step)) => self.run_dir.join(PRE_RUN_DIR).join(step),
            (_, Some(test)) => self.run_dir.join(test),
            (_, None) => self.run_dir.clone(),
        }
    }

    /// Writes the `.response`, `.result-details.json` and
    /// `.result-aggregated.json` files of one executed step and returns the
    /// aggregate. Write failures degrade to warnings; the missing file is
    /// visible in the result tree.
    pub(crate) fn write_step(
        &self,
        test_name: Option<&str>,
        kind: StepKind,
        calls: &[CallRecord],
        responses: &[String],
        wall_time_ns: u64,
    ) -> AggregatedStats {
        let aggregated = aggregate(calls, wall_time_ns);
        let dir = self.step_dir(test_name, kind);
        let base = kind.basename();

        if let Err(e) = self.fs.write(&dir.join(format!("{base}.response")), responses.join("\n")) {
            warn!(target: "results", "failed to write {base}.response: {e:#}");
        }
        if let Err(e) = self.fs.write_json(&dir.join(format!("{base}.result-details.json")), &calls)
        {
            warn!(target: "results", "failed to write {base}.result-details.json: {e:#}");
        }
        if let Err(e) = self
            .fs
            .write_json(&dir.join(format!("{base}.result-aggregated.json")), &aggregated)
        {
            warn!(target: "results", "failed to write {base}.result-aggregated.json: {e:#}");
        }

        aggregated
    }

    /// Writes a post-test RPC dump.
    pub(crate) fn write_post_test_dump(
        &self,
        test_name: &str,
        filename: &str,
        body: &str,
    ) -> Result<()> {
        let path = self
            .run_dir
            .join(test_name)
            .join("post_test_rpc_calls")
            .join(format!("{filename}.json"));
        // Pretty-print when the body is valid JSON; raw otherwise.
        match serde_json::from_str::<serde_json::Value>(body) {
            Ok(value) => self.fs.write_json(&path, &value),
            Err(_) => self.fs.write(&path, body),
        }
    }

    /// Writes `result.json` from the aggregates present on disk.
    pub(crate) fn write_result(&self, run_id: &str) -> Result<RunResult> {
        let result = collect_run_result(run_id, &self.run_dir)?;
        self.fs.write_json(&self.run_dir.join("result.json"), &result)?;
        Ok(result)
    }
}

/// Reconstructs a [RunResult] by walking the run directory for
/// `*.result-aggregated.json` files. The step kind is inferred from the
/// file basename and the test name from the containing directory.
pub(crate) fn collect_run_result(run_id: &str, run_dir: &Path) -> Result<RunResult> {
    const SUFFIX: &str = ".result-aggregated.json";

    let mut result = RunResult {
        run_id: run_id.to_string(),
        ..Default::default()
    };

    for entry in walkdir::WalkDir::new(run_dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(file_name) = entry.file_name().to_str() else {
            continue;
        };
        let Some(basename) = file_name.strip_suffix(SUFFIX) else {
            continue;
        };
        let Some(kind) = StepKind::from_basename(basename) else {
            continue;
        };

        let aggregated: AggregatedStats =
            match serde_json::from_str(&fs::read_to_string(entry.path())?) {
                Ok(aggregated) => aggregated,
                Err(e) => {
                    warn!(target: "results", "skipping unreadable {}: {e}", entry.path().display());
                    continue;
                }
            };

        let container = entry
            .path()
            .parent()
            .and_then(|dir| dir.strip_prefix(run_dir).ok())
            .map(|rel| rel.display().to_string())
            .unwrap_or_default();

        match kind {
            StepKind::PreRun => {
                let step = container
                    .strip_prefix(&format!("{PRE_RUN_DIR}/"))
                    .unwrap_or(&container)
                    .to_string();
                result.pre_run_steps.insert(step, aggregated);
            }
            kind => {
                let test = result.tests.entry(container).or_default();
                match kind {
                    StepKind::Setup => test.setup = Some(aggregated),
                    StepKind::Test => test.test = Some(aggregated),
                    StepKind::Cleanup => test.cleanup = Some(aggregated),
                    StepKind::PreRun => unreachable!(),
                }
            }
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::stats::ResourceDelta;

    fn call(method: &str, ns: u64, succeeded: bool) -> CallRecord {
        CallRecord {
            method: method.into(),
            server_time_ns: ns,
            full_duration_ns: ns,
            succeeded,
            error: None,
            gas_used: None,
            mgas_per_sec: None,
            resources: Some(ResourceDelta::default()),
        }
    }

    #[test]
    fn write_step_emits_three_files_and_result_walks_them() {
        let dir = tempfile::tempdir().unwrap();
        let writer = RunWriter::new(dir.path().join("runs/20260101-aaa"), FsWriter::new(None)).unwrap();

        writer.write_step(
            Some("001/a.txt"),
            StepKind::Test,
            &[call("engine_newPayloadV3", 100, true)],
            &["{\"result\":{}}".to_string()],
            150,
        );
        writer.write_step(
            Some("001/a.txt"),
            StepKind::Setup,
            &[call("engine_newPayloadV3", 50, false)],
            &["".to_string()],
            60,
        );
        writer.write_step(
            Some("genesis"),
            StepKind::PreRun,
            &[call("engine_forkchoiceUpdatedV3", 10, true)],
            &["{}".to_string()],
            12,
        );

        let test_dir = writer.run_dir().join("001/a.txt");
        assert!(test_dir.join("test.response").exists());
        assert!(test_dir.join("test.result-details.json").exists());
        assert!(test_dir.join("test.result-aggregated.json").exists());
        assert!(writer
            .run_dir()
            .join("pre_run_steps/genesis/pre_run.result-aggregated.json")
            .exists());

        let result = writer.write_result("20260101-aaa").unwrap();
        assert_eq!(result.run_id, "20260101-aaa");
        assert_eq!(result.tests.len(), 1);
        let test = &result.tests["001/a.txt"];
        assert_eq!(test.test.as_ref().unwrap().succeeded, 1);
        assert_eq!(test.setup.as_ref().unwrap().failed, 1);
        assert!(test.cleanup.is_none());
        assert_eq!(result.pre_run_steps.len(), 1);
        assert!(result.pre_run_steps.contains_key("genesis"));

        // A setup failure plus a passing test step counts in both buckets.
        let counts = result.test_counts();
        assert_eq!(counts.total, 1);
        assert_eq!(counts.passed, 1);
        assert_eq!(counts.failed, 1);
    }

    #[test]
    fn post_test_dump_pretty_prints_json() {
        let dir = tempfile::tempdir().unwrap();
        let writer = RunWriter::new(dir.path().to_path_buf(), FsWriter::new(None)).unwrap();
        writer
            .write_post_test_dump("001", "trace", "{\"calls\":[1,2]}")
            .unwrap();
        let text =
            fs::read_to_string(dir.path().join("001/post_test_rpc_calls/trace.json")).unwrap();
        assert!(text.contains("\n  \"calls\""));

        writer.write_post_test_dump("001", "raw", "not-json").unwrap();
        let raw = fs::read_to_string(dir.path().join("001/post_test_rpc_calls/raw.json")).unwrap();
        assert_eq!(raw, "not-json");
    }

    #[test]
    fn collect_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("t")).unwrap();
        fs::write(dir.path().join("t/other.json"), "{}").unwrap();
        fs::write(dir.path().join("t/bogus.result-aggregated.json"), "{}").unwrap();
        let result = collect_run_result("id", dir.path()).unwrap();
        assert!(result.tests.is_empty());
    }
}
