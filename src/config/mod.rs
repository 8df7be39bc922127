//! The runner configuration: YAML records, file merging, `${VAR}`
//! interpolation and `BENCHMARKOOR_*` environment overrides.
//!
//! Loading produces a [Config] that has already passed the cross-field
//! validation in [validate]; everything downstream treats the record as
//! trusted.

use crate::{
    datadir::DataDirConfig,
    fsutil::OwnerConfig,
    registry::ClientFamily,
    resources::{DropMemoryCaches, ResourceLimits},
};
use color_eyre::{
    eyre::{bail, ensure, eyre},
    Result,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::Display,
    fs,
    path::PathBuf,
    time::Duration,
};

mod validate;

pub(crate) use validate::validate;

/// The environment-variable prefix for configuration overrides.
const ENV_PREFIX: &str = "BENCHMARKOOR_";

/// The key vocabulary used to resolve `BENCHMARKOOR_<PATH>` override names
/// against the configuration tree. Longest-match-first resolution; keys
/// containing underscores must be listed so they are not split.
const KNOWN_KEYS: &[&str] = &[
    "system_resource_collection_enabled",
    "retry_new_payloads_syncing_state",
    "checkpoint_restore_strategy_options",
    "wait_after_tcp_drop_connections",
    "restart_before_checkpoint",
    "client_logs_to_stdout",
    "generate_results_index",
    "generate_suite_stats",
    "wait_after_rpc_ready",
    "post_test_rpc_calls",
    "container_runtime",
    "drop_memory_caches",
    "cleanup_on_start",
    "drop_caches_path",
    "cpu_sysfs_path",
    "head_block_hash",
    "rollback_strategy",
    "resource_limits",
    "results_owner",
    "results_upload",
    "results_dir",
    "skip_test_run",
    "docker_network",
    "github_token",
    "tmp_cachedir",
    "tmp_datadir",
    "pre_run_steps",
    "tmpfs_threshold",
    "tmpfs_max_size",
    "fixtures_archive",
    "genesis_archive",
    "image_pull_policy",
    "bootstrap_fcu",
    "max_retries",
    "log_level",
    "directories",
    "benchmark",
    "instances",
    "metadata",
    "swap_disabled",
    "cpuset_count",
    "cpu_freq_governor",
    "cpu_turboboost",
    "cpu_freq",
    "local_tarball",
    "local_dir",
    "ci_run_id",
    "release",
    "eest_fixtures",
    "source_dir",
    "mount_path",
    "enabled",
    "backoff",
    "genesis",
    "datadir",
    "labels",
    "filter",
    "global",
    "runner",
    "client",
    "config",
    "cpuset",
    "endpoint",
    "memory",
    "method",
    "source",
    "token",
    "steps",
    "tests",
    "local",
    "git",
    "jwt",
    "ref",
    "repo",
    "uid",
    "gid",
];

/// The validated top-level configuration record.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct Config {
    /// Global settings.
    pub(crate) global: GlobalConfig,
    /// Runner settings.
    pub(crate) runner: RunnerConfig,
}

impl Config {
    /// Loads configuration from one or more YAML files. Later files override
    /// earlier ones; environment variables override everything.
    pub(crate) fn load(paths: &[PathBuf]) -> Result<Self> {
        ensure!(!paths.is_empty(), "at least one --config file is required");

        let mut merged = serde_yaml::Value::Mapping(Default::default());
        for path in paths {
            let raw = fs::read_to_string(path)
                .map_err(|e| eyre!("failed to read config {}: {e}", path.display()))?;
            let interpolated = interpolate_env(&raw)?;
            let value: serde_yaml::Value = serde_yaml::from_str(&interpolated)
                .map_err(|e| eyre!("failed to parse {}: {e}", path.display()))?;
            merge_values(&mut merged, value);
        }

        let overrides: BTreeMap<String, String> = std::env::vars()
            .filter(|(name, _)| name.starts_with(ENV_PREFIX))
            .collect();
        apply_env_overrides(&mut merged, ENV_PREFIX, &overrides);

        let config: Config = serde_yaml::from_value(merged)?;
        validate(&config)?;
        Ok(config)
    }

    /// The effective (defaults-merged) records of all enabled instances.
    pub(crate) fn enabled_instances(&self) -> Vec<EffectiveInstance> {
        self.runner
            .instances
            .iter()
            .filter(|instance| instance.enabled())
            .map(|instance| instance.resolve(&self.runner.client.config))
            .collect()
    }
}

/// Global settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct GlobalConfig {
    /// The log level (`error`/`warn`/`info`/`debug`/`trace`).
    pub(crate) log_level: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self { log_level: "info".into() }
    }
}

/// Runner settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct RunnerConfig {
    /// The container runtime to drive.
    pub(crate) container_runtime: ContainerRuntime,
    /// Whether client container logs are copied to stdout.
    pub(crate) client_logs_to_stdout: bool,
    /// The bridge network clients are attached to.
    pub(crate) docker_network: String,
    /// Whether leftover runner containers are removed before a run.
    pub(crate) cleanup_on_start: bool,
    /// Overridable directory roots.
    pub(crate) directories: DirectoriesConfig,
    /// The drop-caches file written when dropping page caches.
    pub(crate) drop_caches_path: PathBuf,
    /// The sysfs CPU root (overridable for tests).
    pub(crate) cpu_sysfs_path: PathBuf,
    /// Optional GitHub token used by source providers.
    pub(crate) github_token: Option<String>,
    /// Free-form metadata embedded in suite summaries and run configs.
    pub(crate) metadata: MetadataConfig,
    /// Benchmark settings.
    pub(crate) benchmark: BenchmarkConfig,
    /// Client defaults inherited by all instances.
    pub(crate) client: ClientDefaults,
    /// The client instances to benchmark.
    pub(crate) instances: Vec<InstanceConfig>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            container_runtime: ContainerRuntime::default(),
            client_logs_to_stdout: false,
            docker_network: "benchmarkoor".into(),
            cleanup_on_start: false,
            directories: DirectoriesConfig::default(),
            drop_caches_path: "/proc/sys/vm/drop_caches".into(),
            cpu_sysfs_path: crate::resources::SysfsCpuController::DEFAULT_ROOT.into(),
            github_token: None,
            metadata: MetadataConfig::default(),
            benchmark: BenchmarkConfig::default(),
            client: ClientDefaults::default(),
            instances: Vec::new(),
        }
    }
}

/// The supported container runtimes.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum ContainerRuntime {
    /// Docker.
    #[default]
    Docker,
    /// Podman.
    Podman,
}

impl Display for ContainerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Podman => write!(f, "podman"),
        }
    }
}

/// Overridable directory roots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct DirectoriesConfig {
    /// The root for ephemeral client data directories.
    pub(crate) tmp_datadir: PathBuf,
    /// The root for the shared source cache.
    pub(crate) tmp_cachedir: PathBuf,
}

impl Default for DirectoriesConfig {
    fn default() -> Self {
        Self {
            tmp_datadir: "/tmp/benchmarkoor/datadir".into(),
            tmp_cachedir: "/tmp/benchmarkoor/cache".into(),
        }
    }
}

/// Free-form metadata labels.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct MetadataConfig {
    /// Labels embedded in `summary.json` and run configs.
    pub(crate) labels: BTreeMap<String, String>,
}

/// Benchmark settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct BenchmarkConfig {
    /// The root of the emitted result tree.
    pub(crate) results_dir: PathBuf,
    /// Optional owner applied to every written result file.
    pub(crate) results_owner: Option<OwnerConfig>,
    /// Prepare the suite tree, then exit without running tests.
    pub(crate) skip_test_run: bool,
    /// Whether per-call host-resource deltas are collected.
    pub(crate) system_resource_collection_enabled: bool,
    /// Whether `runs/index.json` is regenerated after the run.
    pub(crate) generate_results_index: bool,
    /// Whether per-suite `stats.json` files are regenerated after the run.
    pub(crate) generate_suite_stats: bool,
    /// Optional upload target.
    pub(crate) results_upload: Option<UploadConfig>,
    /// Test-suite selection.
    pub(crate) tests: TestsConfig,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            results_dir: "results".into(),
            results_owner: None,
            skip_test_run: false,
            system_resource_collection_enabled: true,
            generate_results_index: true,
            generate_suite_stats: true,
            results_upload: None,
            tests: TestsConfig::default(),
        }
    }
}

/// An upload target for the emitted result tree.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct UploadConfig {
    /// The destination endpoint.
    pub(crate) endpoint: String,
    /// Optional bearer token.
    pub(crate) token: Option<String>,
}

/// Test-suite selection.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct TestsConfig {
    /// Substring filter applied to test-step paths (never to pre-run steps).
    pub(crate) filter: Option<String>,
    /// The suite source; exactly one variant must be set.
    pub(crate) source: SourceConfig,
}

/// The suite source. Exactly one of the variants must be configured.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct SourceConfig {
    /// A local directory of step files.
    pub(crate) local: Option<LocalSourceConfig>,
    /// A git repository of step files.
    pub(crate) git: Option<GitSourceConfig>,
    /// An execution-spec-tests fixtures archive.
    pub(crate) eest_fixtures: Option<FixtureSourceConfig>,
}

impl SourceConfig {
    /// The number of configured variants.
    pub(crate) fn configured(&self) -> usize {
        [self.local.is_some(), self.git.is_some(), self.eest_fixtures.is_some()]
            .iter()
            .filter(|set| **set)
            .count()
    }
}

/// Step-file pattern groups shared by the local and git providers.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct StepPatterns {
    /// Glob patterns for setup steps.
    pub(crate) setup: Vec<String>,
    /// Glob patterns for test steps.
    pub(crate) test: Vec<String>,
    /// Glob patterns for cleanup steps.
    pub(crate) cleanup: Vec<String>,
}

/// A local directory suite source.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct LocalSourceConfig {
    /// The base directory.
    pub(crate) directory: PathBuf,
    /// Glob patterns for pre-run steps, relative to the base directory.
    pub(crate) pre_run_steps: Vec<String>,
    /// Glob patterns for test steps.
    pub(crate) steps: StepPatterns,
}

/// A git repository suite source.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct GitSourceConfig {
    /// The repository URL.
    pub(crate) repo: String,
    /// The branch, tag or commit to check out.
    #[serde(rename = "ref")]
    pub(crate) reference: String,
    /// Glob patterns for pre-run steps, relative to the repository root.
    pub(crate) pre_run_steps: Vec<String>,
    /// Glob patterns for test steps.
    pub(crate) steps: StepPatterns,
}

/// An execution-spec-tests fixtures archive suite source. Exactly one of
/// `release`, `ci_run_id`, `local_tarball` and `local_dir` must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct FixtureSourceConfig {
    /// The GitHub repository (`owner/name`) the archives come from.
    pub(crate) repo: String,
    /// A release tag whose assets contain the archives.
    pub(crate) release: Option<String>,
    /// A CI run whose artifacts contain the archives.
    pub(crate) ci_run_id: Option<u64>,
    /// A pre-downloaded fixtures tarball.
    pub(crate) local_tarball: Option<PathBuf>,
    /// A pre-extracted fixtures directory.
    pub(crate) local_dir: Option<PathBuf>,
    /// The fixtures archive asset name.
    pub(crate) fixtures_archive: String,
    /// The per-client genesis archive asset name; `{client}` expands to the
    /// client family.
    pub(crate) genesis_archive: String,
}

impl Default for FixtureSourceConfig {
    fn default() -> Self {
        Self {
            repo: "ethereum/execution-spec-tests".into(),
            release: None,
            ci_run_id: None,
            local_tarball: None,
            local_dir: None,
            fixtures_archive: "fixtures_benchmark.tar.gz".into(),
            genesis_archive: "genesis-{client}.tar.gz".into(),
        }
    }
}

impl FixtureSourceConfig {
    /// The number of configured archive locations.
    pub(crate) fn configured(&self) -> usize {
        [
            self.release.is_some(),
            self.ci_run_id.is_some(),
            self.local_tarball.is_some(),
            self.local_dir.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }
}

/// Client defaults inherited by all instances.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct ClientDefaults {
    /// The default client configuration.
    pub(crate) config: ClientConfig,
}

/// Per-client configuration. Every field is optional; `None` on an instance
/// means "inherit the run default".
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct ClientConfig {
    /// The hex-encoded Engine-API JWT secret.
    pub(crate) jwt: Option<String>,
    /// Per-family genesis URL map.
    pub(crate) genesis: Option<BTreeMap<ClientFamily, String>>,
    /// The rollback strategy.
    pub(crate) rollback_strategy: Option<RollbackStrategyKind>,
    /// When to drop page caches during a run.
    pub(crate) drop_memory_caches: Option<DropMemoryCaches>,
    /// Container and host resource limits.
    pub(crate) resource_limits: Option<ResourceLimits>,
    /// Retry policy for `engine_newPayload*` calls answered with SYNCING.
    pub(crate) retry_new_payloads_syncing_state: Option<RetryConfig>,
    /// An extra pause after the Engine-API endpoint becomes ready.
    #[serde(with = "serde_duration_opt", skip_serializing_if = "Option::is_none")]
    pub(crate) wait_after_rpc_ready: Option<Duration>,
    /// RPC calls executed after every test step (untimed).
    pub(crate) post_test_rpc_calls: Option<Vec<PostTestRpcCall>>,
    /// Bootstrap forkchoiceUpdated issued after readiness.
    pub(crate) bootstrap_fcu: Option<BootstrapFcuConfig>,
    /// Options for the checkpoint-restore rollback strategy.
    pub(crate) checkpoint_restore_strategy_options: Option<CheckpointRestoreOptions>,
}

impl ClientConfig {
    /// Merges `self` (instance overrides) over `defaults`.
    fn merged_over(&self, defaults: &Self) -> Self {
        Self {
            jwt: self.jwt.clone().or_else(|| defaults.jwt.clone()),
            genesis: self.genesis.clone().or_else(|| defaults.genesis.clone()),
            rollback_strategy: self.rollback_strategy.or(defaults.rollback_strategy),
            drop_memory_caches: self.drop_memory_caches.or(defaults.drop_memory_caches),
            resource_limits: self
                .resource_limits
                .clone()
                .or_else(|| defaults.resource_limits.clone()),
            retry_new_payloads_syncing_state: self
                .retry_new_payloads_syncing_state
                .clone()
                .or_else(|| defaults.retry_new_payloads_syncing_state.clone()),
            wait_after_rpc_ready: self.wait_after_rpc_ready.or(defaults.wait_after_rpc_ready),
            post_test_rpc_calls: self
                .post_test_rpc_calls
                .clone()
                .or_else(|| defaults.post_test_rpc_calls.clone()),
            bootstrap_fcu: self.bootstrap_fcu.clone().or_else(|| defaults.bootstrap_fcu.clone()),
            checkpoint_restore_strategy_options: self
                .checkpoint_restore_strategy_options
                .clone()
                .or_else(|| defaults.checkpoint_restore_strategy_options.clone()),
        }
    }
}

/// The configured rollback strategy kind.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum RollbackStrategyKind {
    /// No rollback.
    #[default]
    #[serde(rename = "none")]
    None,
    /// Head reset through the client's debug RPC.
    #[serde(rename = "rpc-debug-setHead")]
    RpcDebugSetHead,
    /// Stop the container and start a fresh one on the same data volume.
    #[serde(rename = "container-recreate")]
    ContainerRecreate,
    /// CRIU checkpoint + ZFS snapshot restore.
    #[serde(rename = "container-checkpoint-restore")]
    ContainerCheckpointRestore,
}

impl Display for RollbackStrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::RpcDebugSetHead => write!(f, "rpc-debug-setHead"),
            Self::ContainerRecreate => write!(f, "container-recreate"),
            Self::ContainerCheckpointRestore => write!(f, "container-checkpoint-restore"),
        }
    }
}

/// Retry policy for SYNCING `engine_newPayload*` responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct RetryConfig {
    /// Whether retries are enabled.
    pub(crate) enabled: bool,
    /// The maximum number of retries.
    pub(crate) max_retries: u32,
    /// The constant pause between attempts.
    #[serde(with = "serde_duration")]
    pub(crate) backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

/// A bootstrap forkchoiceUpdated issued once the Engine API is ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct BootstrapFcuConfig {
    /// The head block hash to point the client at.
    pub(crate) head_block_hash: String,
    /// The maximum number of attempts while the client reports SYNCING.
    pub(crate) max_retries: u32,
    /// The constant pause between attempts.
    #[serde(with = "serde_duration")]
    pub(crate) backoff: Duration,
}

impl Default for BootstrapFcuConfig {
    fn default() -> Self {
        Self {
            head_block_hash: String::new(),
            max_retries: 10,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Options for the checkpoint-restore rollback strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct CheckpointRestoreOptions {
    /// Restart the container for a clean process state before the first
    /// checkpoint.
    pub(crate) restart_before_checkpoint: bool,
    /// How long to wait for client sockets to drain before checkpointing.
    #[serde(with = "serde_duration")]
    pub(crate) wait_after_tcp_drop_connections: Duration,
    /// Checkpoint images below this size are placed on tmpfs.
    pub(crate) tmpfs_threshold: Option<String>,
    /// The tmpfs mount size cap; defaults to twice the threshold.
    pub(crate) tmpfs_max_size: Option<String>,
}

impl Default for CheckpointRestoreOptions {
    fn default() -> Self {
        Self {
            restart_before_checkpoint: false,
            wait_after_tcp_drop_connections: Duration::from_secs(5),
            tmpfs_threshold: None,
            tmpfs_max_size: None,
        }
    }
}

/// An untimed RPC call executed after every test step.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct PostTestRpcCall {
    /// The JSON-RPC method.
    pub(crate) method: String,
    /// The JSON-RPC params, subject to `{{.Block*}}` template expansion.
    pub(crate) params: serde_json::Value,
    /// Optional response dump.
    pub(crate) dump: Option<DumpConfig>,
}

/// A response dump destination for a post-test RPC call.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct DumpConfig {
    /// The file name (without extension) under `post_test_rpc_calls/`.
    pub(crate) filename: String,
}

/// The image pull policy for client containers.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum PullPolicy {
    /// Always pull before starting.
    Always,
    /// Pull only when the image is missing locally.
    #[default]
    IfNotPresent,
    /// Never pull.
    Never,
}

/// One client instance to benchmark.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct InstanceConfig {
    /// The unique instance identifier.
    pub(crate) id: String,
    /// The client family.
    pub(crate) client: ClientFamily,
    /// The container image reference.
    pub(crate) image: String,
    /// The image pull policy.
    pub(crate) image_pull_policy: PullPolicy,
    /// Whether this instance participates in the run.
    pub(crate) enabled: Option<bool>,
    /// An entrypoint override.
    pub(crate) entrypoint: Option<Vec<String>>,
    /// A command override.
    pub(crate) command: Option<Vec<String>>,
    /// Arguments appended to the command.
    pub(crate) extra_args: Option<Vec<String>>,
    /// Extra environment variables.
    pub(crate) environment: Option<BTreeMap<String, String>>,
    /// A pre-populated data directory.
    pub(crate) datadir: Option<DataDirConfig>,
    /// Per-instance client configuration overrides.
    #[serde(flatten)]
    pub(crate) config: ClientConfig,
}

impl InstanceConfig {
    /// Whether the instance is enabled (default true).
    pub(crate) fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    fn resolve(&self, defaults: &ClientConfig) -> EffectiveInstance {
        let mut client = self.config.merged_over(defaults);
        // The persisted instance record carries the effective values, not
        // "inherit" markers.
        client.rollback_strategy.get_or_insert(RollbackStrategyKind::None);
        client.drop_memory_caches.get_or_insert(DropMemoryCaches::None);
        EffectiveInstance {
            id: self.id.clone(),
            family: self.client,
            image: self.image.clone(),
            image_pull_policy: self.image_pull_policy,
            entrypoint: self.entrypoint.clone(),
            command: self.command.clone(),
            extra_args: self.extra_args.clone().unwrap_or_default(),
            environment: self.environment.clone().unwrap_or_default(),
            datadir: self.datadir.clone(),
            client,
        }
    }
}

/// A fully resolved instance: per-instance values merged over the run
/// defaults.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct EffectiveInstance {
    /// The unique instance identifier.
    pub(crate) id: String,
    /// The client family.
    pub(crate) family: ClientFamily,
    /// The container image reference.
    pub(crate) image: String,
    /// The image pull policy.
    pub(crate) image_pull_policy: PullPolicy,
    /// An entrypoint override.
    pub(crate) entrypoint: Option<Vec<String>>,
    /// A command override.
    pub(crate) command: Option<Vec<String>>,
    /// Arguments appended to the command.
    pub(crate) extra_args: Vec<String>,
    /// Extra environment variables.
    pub(crate) environment: BTreeMap<String, String>,
    /// A pre-populated data directory.
    pub(crate) datadir: Option<DataDirConfig>,
    /// The merged client configuration.
    pub(crate) client: ClientConfig,
}

impl EffectiveInstance {
    /// The decoded JWT secret.
    pub(crate) fn jwt_secret(&self) -> Result<Vec<u8>> {
        let jwt = self
            .client
            .jwt
            .as_deref()
            .ok_or_else(|| eyre!("instance {}: no jwt secret configured", self.id))?;
        let decoded = hex::decode(jwt.trim_start_matches("0x"))
            .map_err(|e| eyre!("instance {}: jwt secret is not hex: {e}", self.id))?;
        ensure!(
            decoded.len() == 32,
            "instance {}: jwt secret must be 32 bytes, got {}",
            self.id,
            decoded.len()
        );
        Ok(decoded)
    }

    /// The effective rollback strategy (default: none).
    pub(crate) fn rollback_strategy(&self) -> RollbackStrategyKind {
        self.client.rollback_strategy.unwrap_or_default()
    }

    /// The effective cache-drop policy (default: none).
    pub(crate) fn drop_memory_caches(&self) -> DropMemoryCaches {
        self.client.drop_memory_caches.unwrap_or_default()
    }
}

/// Expands `${VAR}` and `${VAR:-default}` references in raw YAML text.
fn interpolate_env(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| eyre!("unterminated ${{...}} reference"))?;
        let reference = &after[..end];
        let (name, default) = match reference.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (reference, None),
        };
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => match default {
                Some(default) => out.push_str(default),
                None => bail!("environment variable {name} referenced but not set"),
            },
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Deep-merges `overlay` into `base`. Mappings merge recursively; everything
/// else (including sequences) is replaced wholesale.
fn merge_values(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Applies `BENCHMARKOOR_<UPPER_SNAKE_PATH>` overrides onto the value tree.
///
/// Paths are resolved against the [KNOWN_KEYS] vocabulary, longest key
/// first, so key names containing underscores are never split. Override
/// values are parsed as YAML scalars (or inline YAML for sequences).
fn apply_env_overrides(
    value: &mut serde_yaml::Value,
    prefix: &str,
    overrides: &BTreeMap<String, String>,
) {
    let mut keys: Vec<&str> = KNOWN_KEYS.to_vec();
    keys.sort_by_key(|key| std::cmp::Reverse(key.len()));
    apply_env_overrides_at(value, prefix, &keys, overrides);
}

fn apply_env_overrides_at(
    value: &mut serde_yaml::Value,
    prefix: &str,
    keys: &[&str],
    overrides: &BTreeMap<String, String>,
) {
    for key in keys {
        let env_name = format!("{prefix}{}", key.to_uppercase());
        let mapping = match value {
            serde_yaml::Value::Mapping(mapping) => mapping,
            _ => return,
        };

        if let Some(raw) = overrides.get(&env_name) {
            let parsed =
                serde_yaml::from_str(raw).unwrap_or(serde_yaml::Value::String(raw.clone()));
            mapping.insert(serde_yaml::Value::String(key.to_string()), parsed);
            continue;
        }

        // Descend only when a deeper override exists for this branch,
        // materialising the section if the files never mentioned it.
        let branch_prefix = format!("{env_name}_");
        if !overrides.keys().any(|name| name.starts_with(&branch_prefix)) {
            continue;
        }
        let now_empty = {
            let entry = mapping
                .entry(serde_yaml::Value::String(key.to_string()))
                .or_insert(serde_yaml::Value::Null);
            if entry.is_null() {
                *entry = serde_yaml::Value::Mapping(Default::default());
            }
            apply_env_overrides_at(entry, &branch_prefix, keys, overrides);
            matches!(entry, serde_yaml::Value::Mapping(created) if created.is_empty())
        };
        if now_empty {
            mapping.remove(&serde_yaml::Value::String(key.to_string()));
        }
    }
}

/// Serde support for humantime duration strings (`100ms`, `2s`).
pub(crate) mod serde_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(crate) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Serde support for optional humantime duration strings.
pub(crate) mod serde_duration_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(crate) fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => {
                serializer.serialize_str(&humantime::format_duration(*duration).to_string())
            }
            None => serializer.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.map(|raw| humantime::parse_duration(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
runner:
  benchmark:
    results_dir: /tmp/results
    tests:
      source:
        local:
          directory: /tmp/suite
  client:
    config:
      jwt: "688f5d737bad920bdfb2fc2f488d6b6209eebda1dae949a8de91398d932c517a"
  instances:
    - id: geth-default
      client: geth
      image: ethereum/client-go:latest
"#;

    fn parse(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config = parse(MINIMAL);
        assert_eq!(config.runner.container_runtime, ContainerRuntime::Docker);
        assert_eq!(config.global.log_level, "info");
        assert!(config.runner.benchmark.system_resource_collection_enabled);
        let instances = config.enabled_instances();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].family, ClientFamily::Geth);
        assert_eq!(instances[0].jwt_secret().unwrap().len(), 32);
    }

    #[test]
    fn instance_overrides_win_over_defaults() {
        let yaml = r#"
runner:
  benchmark:
    tests:
      source:
        local:
          directory: /tmp/suite
  client:
    config:
      rollback_strategy: container-recreate
      wait_after_rpc_ready: 2s
  instances:
    - id: a
      client: geth
      image: img
    - id: b
      client: reth
      image: img
      rollback_strategy: none
"#;
        let config = parse(yaml);
        let instances = config.enabled_instances();
        assert_eq!(
            instances[0].rollback_strategy(),
            RollbackStrategyKind::ContainerRecreate
        );
        assert_eq!(instances[1].rollback_strategy(), RollbackStrategyKind::None);
        // Non-overridden fields inherit.
        assert_eq!(
            instances[1].client.wait_after_rpc_ready,
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn rollback_strategy_names_round_trip() {
        for (name, kind) in [
            ("none", RollbackStrategyKind::None),
            ("rpc-debug-setHead", RollbackStrategyKind::RpcDebugSetHead),
            ("container-recreate", RollbackStrategyKind::ContainerRecreate),
            (
                "container-checkpoint-restore",
                RollbackStrategyKind::ContainerCheckpointRestore,
            ),
        ] {
            let parsed: RollbackStrategyKind =
                serde_yaml::from_str(&format!("\"{name}\"")).unwrap();
            assert_eq!(parsed, kind);
            assert_eq!(kind.to_string(), name);
        }
    }

    #[test]
    fn interpolation_expands_vars_and_defaults() {
        temp_env::with_vars([("BMK_TEST_DIR", Some("/data"))], || {
            let raw = "dir: ${BMK_TEST_DIR}\nother: ${BMK_TEST_UNSET:-fallback}\n";
            let expanded = interpolate_env(raw).unwrap();
            assert_eq!(expanded, "dir: /data\nother: fallback\n");
        });
    }

    #[test]
    fn interpolation_fails_on_unset_without_default() {
        temp_env::with_vars([("BMK_TEST_UNSET2", None::<&str>)], || {
            assert!(interpolate_env("x: ${BMK_TEST_UNSET2}").is_err());
        });
    }

    #[test]
    fn merge_overrides_scalars_and_merges_maps() {
        let mut base: serde_yaml::Value =
            serde_yaml::from_str("a: 1\nnested: {x: 1, y: 2}\nlist: [1, 2]").unwrap();
        let overlay: serde_yaml::Value =
            serde_yaml::from_str("nested: {y: 3}\nlist: [9]").unwrap();
        merge_values(&mut base, overlay);
        assert_eq!(base["a"], serde_yaml::Value::from(1));
        assert_eq!(base["nested"]["x"], serde_yaml::Value::from(1));
        assert_eq!(base["nested"]["y"], serde_yaml::Value::from(3));
        // Sequences replace wholesale.
        assert_eq!(base["list"], serde_yaml::from_str::<serde_yaml::Value>("[9]").unwrap());
    }

    #[test]
    fn env_overrides_resolve_underscore_keys() {
        let mut value: serde_yaml::Value = serde_yaml::from_str(MINIMAL).unwrap();
        let overrides = BTreeMap::from([
            ("BENCHMARKOOR_GLOBAL_LOG_LEVEL".to_string(), "debug".to_string()),
            ("BENCHMARKOOR_RUNNER_GITHUB_TOKEN".to_string(), "tok".to_string()),
            (
                "BENCHMARKOOR_RUNNER_CLIENT_LOGS_TO_STDOUT".to_string(),
                "true".to_string(),
            ),
        ]);
        apply_env_overrides(&mut value, ENV_PREFIX, &overrides);

        let config: Config = serde_yaml::from_value(value).unwrap();
        assert_eq!(config.global.log_level, "debug");
        // `github_token` was absent from the file; the override creates it.
        assert_eq!(config.runner.github_token.as_deref(), Some("tok"));
        assert!(config.runner.client_logs_to_stdout);
    }

    #[test]
    fn env_overrides_reach_nested_client_defaults() {
        let mut value: serde_yaml::Value = serde_yaml::from_str(MINIMAL).unwrap();
        let overrides = BTreeMap::from([(
            "BENCHMARKOOR_RUNNER_CLIENT_CONFIG_ROLLBACK_STRATEGY".to_string(),
            "container-recreate".to_string(),
        )]);
        apply_env_overrides(&mut value, ENV_PREFIX, &overrides);

        let config: Config = serde_yaml::from_value(value).unwrap();
        assert_eq!(
            config.runner.client.config.rollback_strategy,
            Some(RollbackStrategyKind::ContainerRecreate)
        );
    }

    #[test]
    fn env_overrides_do_not_materialise_untouched_sections() {
        let mut value: serde_yaml::Value = serde_yaml::from_str("{}").unwrap();
        apply_env_overrides(&mut value, ENV_PREFIX, &BTreeMap::new());
        assert_eq!(value, serde_yaml::from_str::<serde_yaml::Value>("{}").unwrap());
    }

    #[test]
    fn durations_parse_humantime_strings() {
        let yaml = r#"
enabled: true
max_retries: 5
backoff: 250ms
"#;
        let retry: RetryConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(retry.backoff, Duration::from_millis(250));
        assert_eq!(retry.max_retries, 5);
    }
}
