//! The local directory source provider.
//!
//! Step files are discovered by glob-expanding the configured pattern
//! groups. Setup/test/cleanup files are paired by their path after
//! stripping the longest static glob prefix, so `stateful/setup/*/*`
//! matching `stateful/setup/001/a.txt` yields the pairing key `001/a.txt`.

use super::{PreparedSource, SourceProvider, StepFile, SuiteSourceDescriptor, TestWithSteps};
use crate::config::{LocalSourceConfig, StepPatterns};
use color_eyre::{eyre::ensure, Result};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Only step files with this extension participate.
const STEP_EXTENSION: &str = "txt";

/// The local directory source provider.
#[derive(Debug, Clone)]
pub(crate) struct LocalSource {
    config: LocalSourceConfig,
    filter: Option<String>,
}

impl LocalSource {
    /// Creates a provider over a base directory.
    pub(crate) fn new(config: LocalSourceConfig, filter: Option<String>) -> Self {
        Self { config, filter }
    }
}

#[async_trait::async_trait]
impl SourceProvider for LocalSource {
    async fn prepare(&mut self) -> Result<PreparedSource> {
        prepare_from_directory(
            &self.config.directory,
            &self.config.pre_run_steps,
            &self.config.steps,
            self.filter.as_deref(),
        )
    }

    fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }

    fn source_info(&self) -> SuiteSourceDescriptor {
        SuiteSourceDescriptor::Local {
            directory: self.config.directory.display().to_string(),
        }
    }
}

/// Scans a base directory for pre-run steps and paired test steps. Shared
/// with the git provider, which prepares from its clone path.
pub(crate) fn prepare_from_directory(
    base: &Path,
    pre_run_patterns: &[String],
    steps: &StepPatterns,
    filter: Option<&str>,
) -> Result<PreparedSource> {
    ensure!(base.is_dir(), "source directory {} does not exist", base.display());

    // Pre-run steps are infrastructure; the test filter never applies.
    let mut pre_run_steps = Vec::new();
    for pattern in pre_run_patterns {
        for (key, path) in expand(base, pattern)? {
            pre_run_steps.push((key, path));
        }
    }
    pre_run_steps.sort_by(|a, b| a.0.cmp(&b.0));
    let pre_run_steps = pre_run_steps
        .into_iter()
        .map(|(key, path)| StepFile::from_file(key, path))
        .collect();

    // Pair setup/test/cleanup files by key.
    let mut paired: BTreeMap<String, TestWithSteps> = BTreeMap::new();
    for (patterns, slot) in [
        (&steps.setup, Slot::Setup),
        (&steps.test, Slot::Test),
        (&steps.cleanup, Slot::Cleanup),
    ] {
        for pattern in patterns {
            for (key, path) in expand(base, pattern)? {
                if slot == Slot::Test {
                    if let Some(filter) = filter {
                        let rel = path
                            .strip_prefix(base)
                            .unwrap_or(&path)
                            .display()
                            .to_string();
                        if !rel.contains(filter) {
                            debug!(target: "source", "filtered out test step {rel}");
                            continue;
                        }
                    }
                }
                let entry = paired.entry(key.clone()).or_insert_with(|| TestWithSteps {
                    name: key.clone(),
                    ..Default::default()
                });
                let step = StepFile::from_file(key.clone(), path);
                match slot {
                    Slot::Setup => entry.setup = Some(step),
                    Slot::Test => entry.test = Some(step),
                    Slot::Cleanup => entry.cleanup = Some(step),
                }
            }
        }
    }

    // A filter that removed the test step removes the whole test; setup and
    // cleanup files without a surviving test step are orphans.
    let has_test_patterns = !steps.test.is_empty();
    let tests: Vec<_> = paired
        .into_values()
        .filter(|test| !has_test_patterns || test.test.is_some())
        .collect();
    for test in &tests {
        test.validate()?;
    }

    Ok(PreparedSource {
        base_path: base.to_path_buf(),
        pre_run_steps,
        tests,
        genesis_dir: None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Setup,
    Test,
    Cleanup,
}

/// Glob-expands one pattern under `base`, yielding `(pairing key, path)`
/// pairs for `.txt` files, sorted by key.
fn expand(base: &Path, pattern: &str) -> Result<Vec<(String, PathBuf)>> {
    let prefix = static_prefix(pattern);
    let full_pattern = base.join(pattern);
    let mut matches = Vec::new();

    for entry in glob::glob(&full_pattern.display().to_string())? {
        let path = entry?;
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(STEP_EXTENSION) {
            continue;
        }
        let rel = path.strip_prefix(base)?.to_path_buf();
        let key = rel
            .strip_prefix(&prefix)
            .map(|stripped| stripped.display().to_string())
            .unwrap_or_else(|_| {
                rel.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| rel.display().to_string())
            });
        matches.push((key, path));
    }

    matches.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(matches)
}

/// The longest static prefix of a glob pattern: everything before the first
/// `*`, `?` or `[`, truncated to the last path separator.
fn static_prefix(pattern: &str) -> PathBuf {
    let meta = pattern
        .find(['*', '?', '['])
        .unwrap_or(pattern.len());
    let static_part = &pattern[..meta];
    match static_part.rfind('/') {
        Some(sep) => PathBuf::from(&static_part[..sep]),
        None => PathBuf::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(base: &Path, rel: &str, contents: &str) {
        let path = base.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn suite_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        write(base, "pre_run/genesis.txt", "{\"method\":\"engine_forkchoiceUpdatedV3\"}\n");
        write(base, "stateful/setup/001/a.txt", "{\"method\":\"engine_newPayloadV3\"}\n");
        write(base, "stateful/test/001/a.txt", "{\"method\":\"engine_newPayloadV3\"}\n");
        write(base, "stateful/cleanup/001/a.txt", "{\"method\":\"debug_setHead\"}\n");
        write(base, "stateful/setup/002/b.txt", "{\"method\":\"engine_newPayloadV3\"}\n");
        write(base, "stateful/test/002/b.txt", "{\"method\":\"engine_newPayloadV3\"}\n");
        // Non-.txt files never participate.
        write(base, "stateful/test/001/readme.md", "nope");
        dir
    }

    fn patterns() -> StepPatterns {
        StepPatterns {
            setup: vec!["stateful/setup/*/*".into()],
            test: vec!["stateful/test/*/*".into()],
            cleanup: vec!["stateful/cleanup/*/*".into()],
        }
    }

    #[test]
    fn static_prefix_stops_at_first_meta_character() {
        assert_eq!(static_prefix("stateful/setup/*/*"), PathBuf::from("stateful/setup"));
        assert_eq!(static_prefix("pre_run/*.txt"), PathBuf::from("pre_run"));
        assert_eq!(static_prefix("a/b[0-9]/c"), PathBuf::from("a"));
        assert_eq!(static_prefix("*.txt"), PathBuf::new());
    }

    #[test]
    fn pairs_steps_by_key_in_lexicographic_order() {
        let dir = suite_dir();
        let prepared = prepare_from_directory(
            dir.path(),
            &["pre_run/*".to_string()],
            &patterns(),
            None,
        )
        .unwrap();

        assert_eq!(prepared.pre_run_steps.len(), 1);
        assert_eq!(prepared.pre_run_steps[0].name, "genesis.txt");

        let names: Vec<_> = prepared.tests.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["001/a.txt", "002/b.txt"]);

        let first = &prepared.tests[0];
        assert!(first.setup.is_some());
        assert!(first.test.is_some());
        assert!(first.cleanup.is_some());
        let second = &prepared.tests[1];
        assert!(second.cleanup.is_none());
    }

    #[test]
    fn filter_applies_to_test_steps_only() {
        let dir = suite_dir();
        let prepared = prepare_from_directory(
            dir.path(),
            &["pre_run/*".to_string()],
            &patterns(),
            Some("001"),
        )
        .unwrap();

        let names: Vec<_> = prepared.tests.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["001/a.txt"]);
        // Pre-run steps are independent of the filter.
        assert_eq!(prepared.pre_run_steps.len(), 1);
    }

    #[test]
    fn filter_matching_nothing_keeps_pre_run_steps() {
        let dir = suite_dir();
        let prepared = prepare_from_directory(
            dir.path(),
            &["pre_run/*".to_string()],
            &patterns(),
            Some("does-not-match"),
        )
        .unwrap();
        assert!(prepared.tests.is_empty());
        assert_eq!(prepared.pre_run_steps.len(), 1);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(prepare_from_directory(&missing, &[], &StepPatterns::default(), None).is_err());
    }

    #[tokio::test]
    async fn provider_reports_local_descriptor() {
        let dir = suite_dir();
        let mut provider = LocalSource::new(
            LocalSourceConfig {
                directory: dir.path().to_path_buf(),
                pre_run_steps: vec!["pre_run/*".into()],
                steps: patterns(),
            },
            None,
        );
        let prepared = provider.prepare().await.unwrap();
        assert_eq!(prepared.tests.len(), 2);
        assert!(matches!(
            provider.source_info(),
            SuiteSourceDescriptor::Local { .. }
        ));
        provider.cleanup().unwrap();
    }
}
