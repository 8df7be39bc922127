//! Test-suite sources.
//!
//! A [SourceProvider] materialises a [PreparedSource] (the ordered set of
//! pre-run steps and tests a run executes) from a local directory, a git
//! repository, or an execution-spec-tests fixtures archive.

use color_eyre::{eyre::ensure, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

pub(crate) mod fixtures;
pub(crate) mod git;
pub(crate) mod local;

/// One unit of RPC input: an ordered sequence of JSON-RPC request lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StepFile {
    /// The logical name, stable across preparations of the same source.
    pub(crate) name: String,
    /// Where the request lines come from.
    pub(crate) source: StepSource,
}

/// The backing storage of a [StepFile].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StepSource {
    /// A file whose lines are JSON-RPC request strings.
    File(PathBuf),
    /// An in-memory ordered sequence of request strings.
    Inline(Vec<String>),
}

impl StepFile {
    /// A step backed by a file on disk.
    pub(crate) fn from_file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source: StepSource::File(path.into()),
        }
    }

    /// A step backed by in-memory request lines.
    pub(crate) fn from_lines(name: impl Into<String>, lines: Vec<String>) -> Self {
        Self {
            name: name.into(),
            source: StepSource::Inline(lines),
        }
    }

    /// The canonical byte serialisation used for hashing and for copying
    /// into the suite tree.
    pub(crate) fn canonical_bytes(&self) -> Result<Vec<u8>> {
        match &self.source {
            StepSource::File(path) => Ok(fs::read(path)?),
            StepSource::Inline(lines) => {
                let mut bytes = Vec::new();
                for line in lines {
                    bytes.extend_from_slice(line.as_bytes());
                    bytes.push(b'\n');
                }
                Ok(bytes)
            }
        }
    }
}

/// A test unit: up to three ordered steps plus source-specific metadata.
#[derive(Debug, Clone, Default)]
pub(crate) struct TestWithSteps {
    /// The test name, stable across preparations of the same source.
    pub(crate) name: String,
    /// The setup step, if any.
    pub(crate) setup: Option<StepFile>,
    /// The test step, if any.
    pub(crate) test: Option<StepFile>,
    /// The cleanup step, if any.
    pub(crate) cleanup: Option<StepFile>,
    /// The genesis bucket hash, for multi-genesis fixtures.
    pub(crate) genesis_hash: Option<alloy_primitives::B256>,
    /// Opaque source-specific metadata.
    pub(crate) metadata: BTreeMap<String, String>,
}

impl TestWithSteps {
    /// Asserts the at-least-one-step invariant.
    pub(crate) fn validate(&self) -> Result<()> {
        ensure!(
            self.setup.is_some() || self.test.is_some() || self.cleanup.is_some(),
            "test {} has no steps",
            self.name
        );
        Ok(())
    }
}

/// The materialised suite a run executes.
#[derive(Debug, Clone, Default)]
pub(crate) struct PreparedSource {
    /// The directory the suite was materialised under.
    pub(crate) base_path: PathBuf,
    /// Steps executed once per run, before any test.
    pub(crate) pre_run_steps: Vec<StepFile>,
    /// The ordered tests.
    pub(crate) tests: Vec<TestWithSteps>,
    /// The extracted per-client genesis tree, when the source provides one.
    pub(crate) genesis_dir: Option<PathBuf>,
}

/// A description of where a suite came from, embedded in `summary.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub(crate) enum SuiteSourceDescriptor {
    /// A local directory.
    Local {
        /// The base directory.
        directory: String,
    },
    /// A git repository.
    Git {
        /// The repository URL.
        repo: String,
        /// The checked-out reference.
        #[serde(rename = "ref")]
        reference: String,
    },
    /// An execution-spec-tests fixtures archive.
    EestFixtures {
        /// The GitHub repository the archives came from.
        repo: String,
        /// The resolved release tag or CI run id.
        id: String,
    },
}

/// A provider that can materialise a suite.
#[async_trait::async_trait]
pub(crate) trait SourceProvider {
    /// Materialises the suite. Finite; network I/O is bounded by the run
    /// context.
    async fn prepare(&mut self) -> Result<PreparedSource>;

    /// Releases any resources held by the provider. Idempotent.
    fn cleanup(&mut self) -> Result<()>;

    /// Describes the source for embedding in the suite summary.
    fn source_info(&self) -> SuiteSourceDescriptor;
}

/// Extracts a gzipped tarball under `dest`, rejecting entries that escape
/// the extraction root.
pub(crate) fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(archive)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut tar = tar::Archive::new(decoder);

    fs::create_dir_all(dest)?;
    for entry in tar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let resolved = safe_join(dest, &path)?;
        if entry.header().entry_type().is_dir() {
            fs::create_dir_all(&resolved)?;
        } else {
            if let Some(parent) = resolved.parent() {
                fs::create_dir_all(parent)?;
            }
            entry.unpack(&resolved)?;
        }
    }
    Ok(())
}

/// Joins an archive entry path onto the extraction root, rejecting absolute
/// paths and parent-directory components.
pub(crate) fn safe_join(root: &Path, entry: &Path) -> Result<PathBuf> {
    use std::path::Component;

    let mut resolved = root.to_path_buf();
    for component in entry.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => color_eyre::eyre::bail!(
                "archive entry {} escapes extraction root",
                entry.display()
            ),
        }
    }
    ensure!(
        resolved.starts_with(root),
        "archive entry {} escapes extraction root",
        entry.display()
    );
    Ok(resolved)
}
