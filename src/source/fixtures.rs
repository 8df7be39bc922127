//! The execution-spec-tests fixture-archive source provider.
//!
//! Downloads a fixtures archive (and per-client genesis archives) from a
//! release asset, a CI artifact, a local tarball or a local directory,
//! extracts them under the cache, and converts each JSON fixture into an
//! in-memory test through a [FixtureConverter].

use super::{
    extract_tar_gz, PreparedSource, SourceProvider, StepFile, SuiteSourceDescriptor, TestWithSteps,
};
use crate::{config::FixtureSourceConfig, registry::ClientFamily};
use alloy_primitives::B256;
use color_eyre::{
    eyre::{ensure, eyre},
    Result,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    fs,
    io::IsTerminal,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, info, warn};

/// A converted fixture: the in-memory step lines of one test.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConvertedFixture {
    /// The test name.
    pub(crate) name: String,
    /// Setup request lines.
    pub(crate) setup_lines: Vec<String>,
    /// Test request lines.
    pub(crate) test_lines: Vec<String>,
    /// The genesis bucket of the fixture, when known.
    pub(crate) genesis_hash: Option<B256>,
}

/// Converts third-party fixture files into request-line sequences.
///
/// Returning `Ok(None)` marks the fixture format as unsupported; the
/// provider skips it with a warning.
pub(crate) trait FixtureConverter: Send + Sync {
    /// Converts a single named fixture object.
    fn convert(&self, name: &str, fixture: &Value) -> Result<Option<ConvertedFixture>>;
}

/// The converter for the engine-format blockchain fixtures shipped by
/// execution-spec-tests: every block becomes an `engine_newPayload` call,
/// with all blocks but the last forming the setup step.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EngineFixtureConverter;

impl FixtureConverter for EngineFixtureConverter {
    fn convert(&self, name: &str, fixture: &Value) -> Result<Option<ConvertedFixture>> {
        let Some(payloads) = fixture
            .get("engineNewPayloads")
            .and_then(Value::as_array)
            .filter(|payloads| !payloads.is_empty())
        else {
            return Ok(None);
        };

        let mut lines = Vec::with_capacity(payloads.len());
        for (index, payload) in payloads.iter().enumerate() {
            lines.push(new_payload_line(index as u64 + 1, payload)?);
        }
        let test_line = lines.pop().expect("payloads is non-empty");

        let genesis_hash = fixture
            .get("genesisBlockHeader")
            .and_then(|header| header.get("hash"))
            .and_then(Value::as_str)
            .map(B256::from_str)
            .transpose()
            .map_err(|e| eyre!("fixture {name}: bad genesis hash: {e}"))?;

        Ok(Some(ConvertedFixture {
            name: name.to_string(),
            setup_lines: lines,
            test_lines: vec![test_line],
            genesis_hash,
        }))
    }
}

/// Renders one `engine_newPayload` request line from a fixture payload
/// entry (`{"params": [...], "version": N}` or a bare execution payload).
fn new_payload_line(id: u64, payload: &Value) -> Result<String> {
    let version = payload.get("version").and_then(Value::as_u64).unwrap_or(3);
    let params = match payload.get("params") {
        Some(params) => params.clone(),
        None => Value::Array(vec![payload.clone()]),
    };
    ensure!(params.is_array(), "payload params must be an array");
    Ok(serde_json::to_string(&serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": format!("engine_newPayloadV{version}"),
        "params": params,
    }))?)
}

/// Resolves CI artifact download URLs. External capability; the GitHub
/// implementation is the default.
#[async_trait::async_trait]
pub(crate) trait ArtifactApi: Send + Sync {
    /// Resolves the download URL of a named artifact of a workflow run.
    async fn artifact_url(&self, repo: &str, run_id: u64, name: &str) -> Result<String>;
}

/// The GitHub actions artifact API.
#[derive(Debug, Clone)]
pub(crate) struct GithubArtifactApi {
    http: reqwest::Client,
    token: Option<String>,
}

impl GithubArtifactApi {
    /// Creates a client, optionally authenticated.
    pub(crate) fn new(token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
        }
    }
}

#[async_trait::async_trait]
impl ArtifactApi for GithubArtifactApi {
    async fn artifact_url(&self, repo: &str, run_id: u64, name: &str) -> Result<String> {
        let url = format!("https://api.github.com/repos/{repo}/actions/runs/{run_id}/artifacts");
        let mut request = self
            .http
            .get(&url)
            .header("User-Agent", "benchmarkoor")
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response: Value = request.send().await?.error_for_status()?.json().await?;

        let artifact = response
            .get("artifacts")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .find(|artifact| artifact.get("name").and_then(Value::as_str) == Some(name))
            .ok_or_else(|| eyre!("artifact {name} not found in run {run_id} of {repo}"))?;
        artifact
            .get("archive_download_url")
            .and_then(Value::as_str)
            .map(Into::into)
            .ok_or_else(|| eyre!("artifact {name} has no download url"))
    }
}

/// The fixture-archive source provider.
pub(crate) struct FixtureSource {
    config: FixtureSourceConfig,
    filter: Option<String>,
    cache_root: PathBuf,
    families: Vec<ClientFamily>,
    converter: Box<dyn FixtureConverter>,
    artifact_api: Box<dyn ArtifactApi>,
    github_token: Option<String>,
    http: reqwest::Client,
}

impl FixtureSource {
    /// Creates a provider for the given client families.
    pub(crate) fn new(
        config: FixtureSourceConfig,
        filter: Option<String>,
        cache_root: PathBuf,
        families: Vec<ClientFamily>,
        github_token: Option<String>,
    ) -> Self {
        Self {
            config,
            filter,
            cache_root,
            families,
            converter: Box::new(EngineFixtureConverter),
            artifact_api: Box::new(GithubArtifactApi::new(github_token.clone())),
            github_token,
            http: reqwest::Client::new(),
        }
    }

    /// The resolved release/run identifier used in the cache path and the
    /// source descriptor.
    fn resolved_id(&self) -> String {
        if let Some(release) = &self.config.release {
            release.clone()
        } else if let Some(run_id) = self.config.ci_run_id {
            format!("run-{run_id}")
        } else if let Some(tarball) = &self.config.local_tarball {
            format!("local-{}", crate::suite::short_hash(tarball.display().to_string().as_bytes()))
        } else if let Some(dir) = &self.config.local_dir {
            format!("localdir-{}", crate::suite::short_hash(dir.display().to_string().as_bytes()))
        } else {
            "unresolved".into()
        }
    }

    fn extraction_root(&self) -> PathBuf {
        self.cache_root
            .join(self.config.repo.replace('/', "_"))
            .join(self.resolved_id())
    }

    /// Materialises the fixtures directory under the extraction root.
    async fn fetch_fixtures(&self) -> Result<PathBuf> {
        let root = self.extraction_root();
        let fixtures_dir = root.join("fixtures");
        if fixtures_dir.is_dir() {
            debug!(target: "source", "reusing extracted fixtures at {}", fixtures_dir.display());
            return Ok(fixtures_dir);
        }

        if let Some(dir) = &self.config.local_dir {
            ensure!(dir.is_dir(), "fixtures dir {} does not exist", dir.display());
            return Ok(dir.clone());
        }

        let archive = if let Some(tarball) = &self.config.local_tarball {
            ensure!(tarball.is_file(), "fixtures tarball {} does not exist", tarball.display());
            tarball.clone()
        } else {
            let url = self.archive_url(&self.config.fixtures_archive).await?;
            let dest = root.join(&self.config.fixtures_archive);
            self.download(&url, &dest).await?;
            dest
        };

        info!(target: "source", "extracting {}", archive.display());
        extract_tar_gz(&archive, &fixtures_dir)?;
        Ok(fixtures_dir)
    }

    /// Downloads and extracts the genesis archives for the configured
    /// client families. Missing archives are skipped with a warning.
    async fn fetch_genesis(&self) -> Result<Option<PathBuf>> {
        if self.families.is_empty() || self.config.local_dir.is_some() {
            return Ok(None);
        }
        let genesis_root = self.extraction_root().join("genesis");
        for family in &self.families {
            let family_dir = genesis_root.join(family.to_string());
            if family_dir.is_dir() {
                continue;
            }
            let asset = self.config.genesis_archive.replace("{client}", &family.to_string());
            let url = match self.archive_url(&asset).await {
                Ok(url) => url,
                Err(e) => {
                    warn!(target: "source", "no genesis archive for {family}: {e:#}");
                    continue;
                }
            };
            let archive = self.extraction_root().join(&asset);
            if let Err(e) = self.download(&url, &archive).await {
                warn!(target: "source", "genesis download for {family} failed: {e:#}");
                continue;
            }
            extract_tar_gz(&archive, &family_dir)?;
        }
        Ok(genesis_root.is_dir().then_some(genesis_root))
    }

    /// Resolves the download URL of an archive asset.
    async fn archive_url(&self, asset: &str) -> Result<String> {
        if let Some(release) = &self.config.release {
            Ok(format!(
                "https://github.com/{}/releases/download/{release}/{asset}",
                self.config.repo
            ))
        } else if let Some(run_id) = self.config.ci_run_id {
            self.artifact_api
                .artifact_url(&self.config.repo, run_id, asset)
                .await
        } else {
            Err(eyre!("no remote archive location configured"))
        }
    }

    /// Streams a URL to a file, with a progress bar on a TTY.
    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        info!(target: "source", "downloading {url}");
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut request = self.http.get(url).header("User-Agent", "benchmarkoor");
        if let Some(token) = &self.github_token {
            request = request.bearer_auth(token);
        }
        let mut response = request.send().await?.error_for_status()?;

        let bar = if std::io::stderr().is_terminal() {
            let bar = ProgressBar::new(response.content_length().unwrap_or(0));
            bar.set_style(ProgressStyle::default_bar().template("{msg} {wide_bar} {bytes}/{total_bytes}")?);
            bar.set_message(dest.file_name().unwrap_or_default().to_string_lossy().into_owned());
            Some(bar)
        } else {
            None
        };

        let mut file = fs::File::create(dest)?;
        while let Some(chunk) = response.chunk().await? {
            std::io::Write::write_all(&mut file, &chunk)?;
            if let Some(bar) = &bar {
                bar.inc(chunk.len() as u64);
            }
        }
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }
        Ok(())
    }

    /// Walks the fixtures directory and converts every JSON fixture.
    fn convert_fixtures(&self, fixtures_dir: &Path) -> Result<Vec<TestWithSteps>> {
        let mut tests = Vec::new();
        for entry in walkdir::WalkDir::new(fixtures_dir).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file()
                || entry.path().extension().and_then(|e| e.to_str()) != Some("json")
            {
                continue;
            }
            let rel = entry.path().strip_prefix(fixtures_dir)?.display().to_string();
            let raw: Value = match serde_json::from_str(&fs::read_to_string(entry.path())?) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(target: "source", "skipping unparseable fixture {rel}: {e}");
                    continue;
                }
            };

            // A fixture file holds one or more named fixtures.
            let Some(object) = raw.as_object() else {
                warn!(target: "source", "skipping non-object fixture file {rel}");
                continue;
            };
            for (name, fixture) in object {
                let qualified = format!("{rel}::{name}");
                if let Some(filter) = &self.filter {
                    if !qualified.contains(filter.as_str()) {
                        continue;
                    }
                }
                match self.converter.convert(&qualified, fixture)? {
                    Some(converted) => tests.push(test_from_fixture(converted, &rel)),
                    None => {
                        warn!(target: "source", "skipping unsupported fixture format: {qualified}")
                    }
                }
            }
        }
        Ok(tests)
    }
}

/// Builds a [TestWithSteps] from a converted fixture.
fn test_from_fixture(converted: ConvertedFixture, fixture_file: &str) -> TestWithSteps {
    let setup = (!converted.setup_lines.is_empty()).then(|| {
        StepFile::from_lines(converted.name.clone(), converted.setup_lines)
    });
    let test = (!converted.test_lines.is_empty())
        .then(|| StepFile::from_lines(converted.name.clone(), converted.test_lines));
    TestWithSteps {
        name: converted.name,
        setup,
        test,
        cleanup: None,
        genesis_hash: converted.genesis_hash,
        metadata: BTreeMap::from([("fixture_file".to_string(), fixture_file.to_string())]),
    }
}

/// Re-orders tests into genesis buckets when a `pre_alloc` index ships with
/// the fixtures: tests grouped by genesis hash, buckets ordered by hash,
/// converted order preserved within a bucket.
fn bucket_by_genesis(tests: Vec<TestWithSteps>) -> Vec<TestWithSteps> {
    let mut buckets: BTreeMap<Option<String>, Vec<TestWithSteps>> = BTreeMap::new();
    for test in tests {
        buckets
            .entry(test.genesis_hash.map(|hash| hash.to_string()))
            .or_default()
            .push(test);
    }
    buckets.into_values().flatten().collect()
}

#[async_trait::async_trait]
impl SourceProvider for FixtureSource {
    async fn prepare(&mut self) -> Result<PreparedSource> {
        let fixtures_dir = self.fetch_fixtures().await?;
        let genesis_dir = self.fetch_genesis().await?;

        let mut tests = self.convert_fixtures(&fixtures_dir)?;
        if fixtures_dir.join("pre_alloc").is_dir()
            || fixtures_dir.parent().map(|p| p.join("pre_alloc").is_dir()) == Some(true)
        {
            tests = bucket_by_genesis(tests);
        }
        for test in &tests {
            test.validate()?;
        }

        Ok(PreparedSource {
            base_path: fixtures_dir,
            pre_run_steps: Vec::new(),
            tests,
            genesis_dir,
        })
    }

    fn cleanup(&mut self) -> Result<()> {
        // The extraction root is a shared content-addressed cache.
        Ok(())
    }

    fn source_info(&self) -> SuiteSourceDescriptor {
        SuiteSourceDescriptor::EestFixtures {
            repo: self.config.repo.clone(),
            id: self.resolved_id(),
        }
    }
}
