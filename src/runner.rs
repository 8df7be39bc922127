//! The run supervisor: orchestrates suite preparation, the client
//! lifecycle, the test loop and result finalisation for every enabled
//! instance.
//!
//! Instances are processed sequentially; running clients side by side
//! would contend for the resources being measured.

use crate::{
    config::{Config, EffectiveInstance, SourceConfig},
    container::{
        cli_runtime::CliRuntime,
        stats::{CgroupV2Reader, RuntimeExecReader, StatsReader},
        ContainerAdapter, ContainerSpec, ContainerState, Mount,
    },
    datadir::WorkingDir,
    fsutil::FsWriter,
    registry::CLIENT_REGISTRY,
    resources::{CacheDropper, DropMemoryCaches, SysfsCpuController},
    results::{
        index,
        layout::{RunWriter, TestCounts},
        StepKind,
    },
    rollback::{PreTestState, RollbackEngine},
    rpc::{client::EngineClient, executor::StepExecutor, post_test},
    source::{PreparedSource, SourceProvider, StepFile, TestWithSteps},
    suite,
    upload::{HttpUploader, UploadAdapter},
};
use chrono::{SecondsFormat, Utc};
use color_eyre::{
    eyre::{ensure, eyre},
    Result,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

/// How long the engine endpoint gets to become ready.
const READY_TIMEOUT: Duration = Duration::from_secs(180);

/// The path the JWT secret is mounted at inside the container.
const JWT_MOUNT_PATH: &str = "/jwt/jwt.hex";

/// The path the genesis tree is mounted at inside the container.
const GENESIS_MOUNT_PATH: &str = "/genesis";

/// The outcome of a full supervisor run.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RunSummary {
    /// The number of instances that ran to completion.
    pub(crate) completed: usize,
    /// The number of instances that failed or were interrupted.
    pub(crate) failed: usize,
}

/// The lifecycle status recorded in `config.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum RunStatus {
    /// The run is in progress.
    Running,
    /// The run finished normally.
    Completed,
    /// The run was cut short (signal or container death).
    Interrupted,
    /// The run aborted before producing meaningful results.
    Failed,
}

/// The head captured once the client is ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StartBlock {
    /// The block number.
    pub(crate) number: u64,
    /// The block hash.
    pub(crate) hash: String,
}

/// Host metadata captured into `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SystemInfo {
    /// The operating system.
    pub(crate) os: String,
    /// The kernel version.
    pub(crate) kernel: String,
    /// The CPU model.
    pub(crate) cpu_model: String,
    /// The number of logical CPUs.
    pub(crate) cpu_cores: usize,
    /// The CPU frequency, MHz.
    pub(crate) cpu_mhz: u64,
    /// Total RAM, bytes.
    pub(crate) total_memory_bytes: u64,
}

impl SystemInfo {
    /// Collects host metadata.
    pub(crate) fn collect() -> Self {
        use sysinfo::{CpuExt, System, SystemExt};
        let sys = System::new_all();
        let cpu = sys.cpus().first();
        Self {
            os: sys
                .long_os_version()
                .or_else(|| sys.name())
                .unwrap_or_else(|| "unknown".into()),
            kernel: sys.kernel_version().unwrap_or_else(|| "unknown".into()),
            cpu_model: cpu.map(|cpu| cpu.brand().to_string()).unwrap_or_default(),
            cpu_cores: sys.cpus().len(),
            cpu_mhz: cpu.map(|cpu| cpu.frequency()).unwrap_or_default(),
            total_memory_bytes: sys.total_memory(),
        }
    }
}

/// The per-run metadata record, persisted as `config.json`. Written with
/// `status=running` before the container starts and finalised exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RunConfigRecord {
    /// The run id.
    pub(crate) run_id: String,
    /// The start timestamp, UTC RFC 3339.
    pub(crate) timestamp: String,
    /// The end timestamp, set at finalisation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) timestamp_end: Option<String>,
    /// The run status.
    pub(crate) status: RunStatus,
    /// The suite hash.
    pub(crate) suite: String,
    /// The full effective instance record.
    pub(crate) instance: EffectiveInstance,
    /// Host metadata.
    pub(crate) system: SystemInfo,
    /// Free-form metadata labels.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub(crate) labels: std::collections::BTreeMap<String, String>,
    /// The container runtime in use.
    pub(crate) container_runtime: String,
    /// The stats-reader type, when resource collection is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) stats_reader: Option<String>,
    /// The head at readiness.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) start_block: Option<StartBlock>,
    /// Test outcome counts, set at finalisation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) test_counts: Option<TestCounts>,
    /// Why the run ended early, when it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) termination_reason: Option<String>,
    /// Whether the container exited before the run finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) container_died: Option<bool>,
    /// The container exit code, when it died.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) container_exit_code: Option<i64>,
    /// Whether the OOM killer terminated the container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) container_oom_killed: Option<bool>,
}

/// Generates a stable-sortable run id: UTC timestamp plus a short random
/// suffix.
pub(crate) fn new_run_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| {
            let charset = b"abcdefghijklmnopqrstuvwxyz0123456789";
            charset[rng.gen_range(0..charset.len())] as char
        })
        .collect();
    format!("{}-{suffix}", Utc::now().format("%Y%m%d-%H%M%S"))
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// The run supervisor.
pub(crate) struct RunSupervisor {
    config: Config,
    fs: FsWriter,
}

impl RunSupervisor {
    /// Creates a supervisor over a validated configuration.
    pub(crate) fn new(config: Config) -> Self {
        let fs = FsWriter::new(config.runner.benchmark.results_owner);
        Self { config, fs }
    }

    /// Builds the configured source provider.
    pub(crate) fn build_provider(&self) -> Result<Box<dyn SourceProvider + Send>> {
        let tests = &self.config.runner.benchmark.tests;
        let filter = tests.filter.clone();
        let cache = self.config.runner.directories.tmp_cachedir.clone();

        Ok(match &tests.source {
            SourceConfig {
                local: Some(local), ..
            } => Box::new(crate::source::local::LocalSource::new(local.clone(), filter)),
            SourceConfig { git: Some(git), .. } => Box::new(crate::source::git::GitSource::new(
                git.clone(),
                filter,
                cache,
            )),
            SourceConfig {
                eest_fixtures: Some(fixtures),
                ..
            } => {
                let families = self
                    .config
                    .enabled_instances()
                    .iter()
                    .map(|instance| instance.family)
                    .collect();
                Box::new(crate::source::fixtures::FixtureSource::new(
                    fixtures.clone(),
                    filter,
                    cache,
                    families,
                    self.config.runner.github_token.clone(),
                ))
            }
            _ => return Err(eyre!("no suite source configured")),
        })
    }

    /// Runs the whole benchmark: suite preparation, every enabled instance,
    /// then index/stats regeneration and the optional upload.
    pub(crate) async fn run(&self, cancel: CancellationToken) -> Result<RunSummary> {
        let results_dir = self.config.runner.benchmark.results_dir.clone();
        let mut provider = self.build_provider()?;

        let prepared = tokio::select! {
            prepared = provider.prepare() => prepared?,
            _ = cancel.cancelled() => return Err(eyre!("cancelled during suite preparation")),
        };
        ensure!(
            !prepared.tests.is_empty() || !prepared.pre_run_steps.is_empty(),
            "the prepared suite is empty"
        );

        let suite_info = suite::write_suite_layout(
            &results_dir,
            &prepared,
            provider.source_info(),
            self.config.runner.benchmark.tests.filter.clone(),
            self.config.runner.metadata.labels.clone(),
            &self.fs,
        )?;
        info!(
            target: "runner",
            "suite {} prepared from {}: {} tests, {} pre-run steps",
            suite_info.hash,
            prepared.base_path.display(),
            prepared.tests.len(),
            prepared.pre_run_steps.len()
        );

        let mut summary = RunSummary::default();
        if !self.config.runner.benchmark.skip_test_run {
            for instance in self.config.enabled_instances() {
                if cancel.is_cancelled() {
                    break;
                }
                info!(target: "runner", "benchmarking instance {}", instance.id);
                match self
                    .run_instance(&instance, &prepared, &suite_info.hash, &cancel)
                    .await
                {
                    Ok(RunStatus::Completed) => summary.completed += 1,
                    Ok(_) => summary.failed += 1,
                    Err(e) => {
                        error!(target: "runner", "instance {} failed: {e:#}", instance.id);
                        summary.failed += 1;
                    }
                }
            }
        }

        if self.config.runner.benchmark.generate_results_index {
            if let Err(e) = index::generate_runs_index(&results_dir, &self.fs) {
                warn!(target: "runner", "index generation failed: {e:#}");
            }
        }
        if self.config.runner.benchmark.generate_suite_stats {
            if let Err(e) = index::generate_suite_stats(&results_dir, &suite_info.hash, &self.fs) {
                warn!(target: "runner", "suite stats generation failed: {e:#}");
            }
        }
        self.upload_results(&results_dir, &suite_info.hash).await;

        if let Err(e) = provider.cleanup() {
            warn!(target: "runner", "source cleanup failed: {e:#}");
        }
        Ok(summary)
    }

    async fn upload_results(&self, results_dir: &Path, suite_hash: &str) {
        let Some(upload) = &self.config.runner.benchmark.results_upload else {
            return;
        };
        let uploader = HttpUploader::new(upload);
        if let Err(e) = uploader.preflight().await {
            warn!(target: "upload", "upload preflight failed: {e:#}");
            return;
        }

        let runs_dir = results_dir.join("runs");
        if let Ok(entries) = std::fs::read_dir(&runs_dir) {
            for entry in entries.flatten() {
                if entry.path().is_dir() {
                    if let Err(e) = uploader.upload(&entry.path()).await {
                        warn!(target: "upload", "run upload failed: {e:#}");
                    }
                }
            }
        }
        if let Err(e) = uploader
            .upload_suite_dir(&suite::suite_dir(results_dir, suite_hash))
            .await
        {
            warn!(target: "upload", "suite upload failed: {e:#}");
        }
    }

    /// Runs one instance end to end, returning its final status.
    async fn run_instance(
        &self,
        instance: &EffectiveInstance,
        prepared: &PreparedSource,
        suite_hash: &str,
        run_cancel: &CancellationToken,
    ) -> Result<RunStatus> {
        let run_id = new_run_id();
        let results_dir = &self.config.runner.benchmark.results_dir;
        let writer = RunWriter::new(results_dir.join("runs").join(&run_id), self.fs.clone())?;

        let mut record = RunConfigRecord {
            run_id: run_id.clone(),
            timestamp: now_rfc3339(),
            timestamp_end: None,
            status: RunStatus::Running,
            suite: suite_hash.to_string(),
            instance: instance.clone(),
            system: SystemInfo::collect(),
            labels: self.config.runner.metadata.labels.clone(),
            container_runtime: self.config.runner.container_runtime.to_string(),
            stats_reader: None,
            start_block: None,
            test_counts: None,
            termination_reason: None,
            container_died: None,
            container_exit_code: None,
            container_oom_killed: None,
        };
        self.fs
            .write_json(&writer.run_dir().join("config.json"), &record)?;

        // Sysfs tuning wraps the whole instance run; originals are restored
        // no matter how the run ends.
        let sysfs = SysfsCpuController::new(&self.config.runner.cpu_sysfs_path);
        let saved = match &instance.client.resource_limits {
            Some(limits) => sysfs.apply(limits)?,
            None => Default::default(),
        };

        let mut driver = InstanceDriver::new(self, instance, prepared, &run_id, writer, run_cancel);
        let finish = driver.drive(&mut record).await;
        // A premature container exit is recorded whichever branch the run
        // unwound through.
        if let Some(state) = *driver.exit_state.lock().unwrap_or_else(|e| e.into_inner()) {
            record.container_died = Some(true);
            record.container_exit_code = Some(state.exit_code);
            record.container_oom_killed = Some(state.oom_killed);
            record.termination_reason.get_or_insert_with(|| "container exited".into());
        }
        driver.teardown().await;
        sysfs.restore(saved);

        // Flush partial aggregations before the directory goes terminal.
        match driver.writer.write_result(&run_id) {
            Ok(result) => record.test_counts = Some(result.test_counts()),
            Err(e) => warn!(target: "runner", "result.json write failed: {e:#}"),
        }

        record.status = match &finish {
            Ok(()) if run_cancel.is_cancelled() => {
                record.termination_reason = Some("signal".into());
                RunStatus::Interrupted
            }
            Ok(()) => RunStatus::Completed,
            Err(e) => {
                record.termination_reason.get_or_insert(format!("{e:#}"));
                if record.container_died == Some(true) || run_cancel.is_cancelled() {
                    RunStatus::Interrupted
                } else {
                    RunStatus::Failed
                }
            }
        };
        record.timestamp_end = Some(now_rfc3339());
        self.fs
            .write_json(&driver.writer.run_dir().join("config.json"), &record)?;

        info!(
            target: "runner",
            "instance {} run {run_id} finished: {:?}", instance.id, record.status
        );
        Ok(record.status)
    }
}

/// Everything alive while one instance runs; torn down in reverse order.
struct InstanceDriver<'a> {
    supervisor: &'a RunSupervisor,
    instance: &'a EffectiveInstance,
    prepared: &'a PreparedSource,
    run_id: &'a str,
    writer: RunWriter,
    cancel: CancellationToken,
    run_cancel: &'a CancellationToken,
    adapter: CliRuntime,
    workdir: Option<WorkingDir>,
    jwt_dir: Option<PathBuf>,
    genesis_dir: Option<PathBuf>,
    container_started: bool,
    log_task: Option<tokio::task::JoinHandle<()>>,
    exit_watcher: Option<tokio::task::JoinHandle<()>>,
    exit_state: Arc<Mutex<Option<ContainerState>>>,
    rollback: Option<RollbackEngine>,
    client: Option<EngineClient>,
    stats: Option<Arc<dyn StatsReader>>,
    cache_dropper: Option<CacheDropper>,
}

impl<'a> InstanceDriver<'a> {
    fn new(
        supervisor: &'a RunSupervisor,
        instance: &'a EffectiveInstance,
        prepared: &'a PreparedSource,
        run_id: &'a str,
        writer: RunWriter,
        run_cancel: &'a CancellationToken,
    ) -> Self {
        let suffix = run_id.rsplit('-').next().unwrap_or("run");
        let name = format!("benchmarkoor-{}-{suffix}", instance.id);
        Self {
            supervisor,
            instance,
            prepared,
            run_id,
            writer,
            cancel: run_cancel.child_token(),
            run_cancel,
            adapter: CliRuntime::new(supervisor.config.runner.container_runtime, name),
            workdir: None,
            jwt_dir: None,
            genesis_dir: None,
            container_started: false,
            log_task: None,
            exit_watcher: None,
            exit_state: Arc::new(Mutex::new(None)),
            rollback: None,
            client: None,
            stats: None,
            cache_dropper: None,
        }
    }

    /// The whole measured lifecycle of one instance.
    async fn drive(&mut self, record: &mut RunConfigRecord) -> Result<()> {
        let runner_config = &self.supervisor.config.runner;

        if runner_config.cleanup_on_start {
            self.adapter.remove_labelled().await?;
        }

        // Data directory and JWT secret.
        if let Some(datadir) = &self.instance.datadir {
            self.workdir = Some(
                WorkingDir::materialize(
                    datadir,
                    &runner_config.directories.tmp_datadir,
                    self.run_id,
                )
                .await?,
            );
        }
        let secret = self.instance.jwt_secret()?;
        let jwt_dir = runner_config
            .directories
            .tmp_datadir
            .join(format!("benchmarkoor-{}-jwt", self.run_id));
        std::fs::create_dir_all(&jwt_dir)?;
        std::fs::write(jwt_dir.join("jwt.hex"), hex::encode(&secret))?;
        self.jwt_dir = Some(jwt_dir.clone());

        if self.instance.drop_memory_caches() != DropMemoryCaches::None {
            self.cache_dropper = Some(CacheDropper::new(&runner_config.drop_caches_path)?);
        }

        // A configured genesis URL fills in when the source did not ship a
        // genesis tree of its own.
        if self.prepared.genesis_dir.is_none() {
            let genesis_url = self
                .instance
                .client
                .genesis
                .as_ref()
                .and_then(|map| map.get(&self.instance.family));
            if let Some(url) = genesis_url {
                let genesis_dir = runner_config
                    .directories
                    .tmp_datadir
                    .join(format!("benchmarkoor-{}-genesis", self.run_id));
                std::fs::create_dir_all(&genesis_dir)?;
                info!(target: "runner", "downloading genesis from {url}");
                let body = reqwest::get(url).await?.error_for_status()?.bytes().await?;
                std::fs::write(genesis_dir.join("genesis.json"), &body)?;
                self.genesis_dir = Some(genesis_dir);
            }
        }

        // Container.
        let spec = self.build_spec(&jwt_dir);
        self.adapter.start(&spec).await?;
        self.container_started = true;
        self.spawn_exit_watcher();
        self.log_task = Some(self.adapter.stream_logs(
            runner_config.client_logs_to_stdout,
            Some(self.writer.run_dir().join("client.log")),
        ));

        // Readiness, bootstrap FCU, start block.
        let client = self.connect(&secret).await?;
        if let Some(bootstrap) = &self.instance.client.bootstrap_fcu {
            client.bootstrap_fcu(bootstrap, &self.cancel).await?;
        }
        if let Some(wait) = self.instance.client.wait_after_rpc_ready {
            tokio::time::sleep(wait).await;
        }
        match client.latest_block().await {
            Ok(block) => {
                record.start_block = Some(StartBlock {
                    number: block.number,
                    hash: block.hash.to_string(),
                })
            }
            Err(e) => warn!(target: "runner", "could not capture start block: {e:#}"),
        }

        self.stats = self.make_stats_reader().await;
        record.stats_reader = self.stats.as_ref().map(|reader| reader.kind().to_string());
        self.client = Some(client);

        // Rollback engine.
        let definition = CLIENT_REGISTRY.get(self.instance.family);
        let reset = definition
            .reset_method
            .clone()
            .zip(definition.reset_param_style);
        let mut rollback = RollbackEngine::new(
            self.instance.rollback_strategy(),
            self.adapter.clone(),
            spec,
            reset,
            self.instance
                .client
                .checkpoint_restore_strategy_options
                .clone()
                .unwrap_or_default(),
            runner_config
                .directories
                .tmp_datadir
                .join(format!("benchmarkoor-{}-checkpoint", self.run_id)),
        );
        // The watcher must not mistake rollback-driven restarts for a
        // crash; it pauses across them.
        self.pause_exit_watcher();
        let restarted = rollback.init(self.workdir.as_ref(), &self.cancel).await?;
        self.rollback = Some(rollback);
        if restarted {
            self.clear_exit_state();
            self.reconnect(&secret).await?;
        }
        self.spawn_exit_watcher();

        // Pre-run steps, then the test loop.
        self.run_pre_run_steps().await?;
        self.run_tests(&secret).await?;

        if self.cancel.is_cancelled() && !self.run_cancel.is_cancelled() {
            // The instance token fired without a run-wide signal: the
            // container died underneath us.
            return Err(eyre!("container exited mid-run"));
        }
        Ok(())
    }

    fn build_spec(&self, jwt_dir: &Path) -> ContainerSpec {
        let mut mounts = vec![Mount {
            host: jwt_dir.join("jwt.hex"),
            container: JWT_MOUNT_PATH.into(),
            read_only: true,
        }];
        if let Some(workdir) = &self.workdir {
            mounts.push(Mount {
                host: workdir.path.clone(),
                container: workdir.mount_path.clone(),
                read_only: false,
            });
        }
        if let Some(genesis_dir) = self.prepared.genesis_dir.as_ref().or(self.genesis_dir.as_ref()) {
            mounts.push(Mount {
                host: genesis_dir.clone(),
                container: GENESIS_MOUNT_PATH.into(),
                read_only: true,
            });
        }

        let mut command = self.instance.command.clone().unwrap_or_default();
        command.extend(self.instance.extra_args.iter().cloned());

        ContainerSpec {
            name: self.adapter.name().to_string(),
            image: self.instance.image.clone(),
            pull_policy: self.instance.image_pull_policy,
            network: self.supervisor.config.runner.docker_network.clone(),
            entrypoint: self.instance.entrypoint.clone(),
            command,
            environment: self.instance.environment.clone(),
            mounts,
            engine_port: CLIENT_REGISTRY.get(self.instance.family).engine_port,
            limits: self.instance.client.resource_limits.clone(),
        }
    }

    fn pause_exit_watcher(&mut self) {
        if let Some(watcher) = self.exit_watcher.take() {
            watcher.abort();
        }
    }

    fn clear_exit_state(&mut self) {
        *self.exit_state.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn spawn_exit_watcher(&mut self) {
        self.pause_exit_watcher();
        let adapter = self.adapter.clone();
        let cancel = self.cancel.clone();
        let exit_state = self.exit_state.clone();
        self.exit_watcher = Some(tokio::spawn(async move {
            let code = adapter.wait_exit().await;
            let state = match adapter.inspect().await {
                Ok(state) => state,
                Err(_) => ContainerState {
                    exit_code: code.unwrap_or(-1),
                    oom_killed: false,
                },
            };
            warn!(target: "runner", "container exited with code {}", state.exit_code);
            *exit_state.lock().unwrap_or_else(|e| e.into_inner()) = Some(state);
            cancel.cancel();
        }));
    }

    /// Resolves the published engine port and waits for readiness.
    async fn connect(&self, secret: &[u8]) -> Result<EngineClient> {
        let engine_port = CLIENT_REGISTRY.get(self.instance.family).engine_port;
        let host_port = self.adapter.mapped_engine_port(engine_port).await?;
        let endpoint = Url::parse(&format!("http://127.0.0.1:{host_port}/"))?;
        let client = EngineClient::new(endpoint, secret.to_vec())?;
        client.wait_ready(READY_TIMEOUT, &self.cancel).await?;
        Ok(client)
    }

    /// Re-resolves the endpoint after the container was replaced.
    async fn reconnect(&mut self, secret: &[u8]) -> Result<()> {
        let client = self.connect(secret).await?;
        self.stats = self.make_stats_reader().await;
        self.client = Some(client);
        Ok(())
    }

    async fn make_stats_reader(&self) -> Option<Arc<dyn StatsReader>> {
        if !self
            .supervisor
            .config
            .runner
            .benchmark
            .system_resource_collection_enabled
        {
            return None;
        }
        let runtime = self.supervisor.config.runner.container_runtime;
        if let Ok(id) = self.adapter.container_id().await {
            if let Some(cgroup_dir) =
                CgroupV2Reader::discover(Path::new("/sys/fs/cgroup"), runtime, &id)
            {
                match CgroupV2Reader::open(&cgroup_dir) {
                    Ok(reader) => return Some(Arc::new(reader)),
                    Err(e) => warn!(target: "runner", "cgroup reader unavailable: {e:#}"),
                }
            }
        }
        Some(Arc::new(RuntimeExecReader::new(
            runtime,
            self.adapter.name(),
        )))
    }

    fn executor(&self) -> Result<StepExecutor> {
        let client = self
            .client
            .clone()
            .ok_or_else(|| eyre!("no engine client connected"))?;
        Ok(StepExecutor::new(
            client,
            self.stats.clone(),
            self.instance
                .client
                .retry_new_payloads_syncing_state
                .clone()
                .unwrap_or_default(),
            None,
            self.cancel.clone(),
        ))
    }

    async fn run_pre_run_steps(&mut self) -> Result<()> {
        for step in &self.prepared.pre_run_steps {
            if self.cancel.is_cancelled() {
                break;
            }
            info!(target: "runner", "pre-run step {}", step.name);
            let outcome = self.executor()?.run_step(step).await?;
            self.writer.write_step(
                Some(&step.name),
                StepKind::PreRun,
                &outcome.calls,
                &outcome.responses,
                outcome.wall_time_ns,
            );
            self.drop_caches_if(DropMemoryCaches::Steps);
        }
        Ok(())
    }

    async fn run_tests(&mut self, secret: &[u8]) -> Result<()> {
        let tests: Vec<TestWithSteps> = self.prepared.tests.clone();
        for test in &tests {
            if self.cancel.is_cancelled() {
                break;
            }
            info!(target: "runner", "test {}", test.name);

            let client = self
                .client
                .clone()
                .ok_or_else(|| eyre!("no engine client connected"))?;
            let state = match &self.rollback {
                Some(rollback) => rollback.capture(&client).await,
                None => PreTestState::None,
            };

            self.run_test_steps(test).await?;
            self.post_test(&client, test).await;

            if let Some(mut rollback) = self.rollback.take() {
                let restarts = matches!(
                    self.instance.rollback_strategy(),
                    crate::config::RollbackStrategyKind::ContainerRecreate
                        | crate::config::RollbackStrategyKind::ContainerCheckpointRestore
                );
                if restarts {
                    self.pause_exit_watcher();
                }
                let outcome = rollback
                    .rollback(&client, state, self.workdir.as_ref())
                    .await;
                self.rollback = Some(rollback);
                if outcome.container_restarted && !self.cancel.is_cancelled() {
                    self.clear_exit_state();
                    self.reconnect(secret).await?;
                }
                if restarts {
                    self.spawn_exit_watcher();
                }
            }
            self.drop_caches_if(DropMemoryCaches::Tests);
        }
        Ok(())
    }

    async fn run_test_steps(&mut self, test: &TestWithSteps) -> Result<()> {
        let steps: [(&Option<StepFile>, StepKind); 3] = [
            (&test.setup, StepKind::Setup),
            (&test.test, StepKind::Test),
            (&test.cleanup, StepKind::Cleanup),
        ];
        for (step, kind) in steps {
            let Some(step) = step else { continue };
            if self.cancel.is_cancelled() {
                break;
            }
            let outcome = self.executor()?.run_step(step).await?;
            if outcome.cancelled {
                warn!(target: "runner", "step {kind} of {} aborted by cancellation", test.name);
            }
            self.writer.write_step(
                Some(&test.name),
                kind,
                &outcome.calls,
                &outcome.responses,
                outcome.wall_time_ns,
            );
            self.drop_caches_if(DropMemoryCaches::Steps);
        }
        Ok(())
    }

    /// Post-test RPC calls: untimed, never part of the results.
    async fn post_test(&self, client: &EngineClient, test: &TestWithSteps) {
        let Some(calls) = &self.instance.client.post_test_rpc_calls else {
            return;
        };
        if calls.is_empty() || self.cancel.is_cancelled() {
            return;
        }
        // The block captured immediately before the calls drives template
        // expansion.
        let block = match client.latest_block().await {
            Ok(block) => block,
            Err(e) => {
                warn!(target: "runner", "post-test block capture failed: {e:#}");
                return;
            }
        };
        post_test::run_post_test_calls(client, calls, &block, &self.writer, &test.name).await;
    }

    /// Drops page caches when the policy asks for this boundary. `Steps`
    /// implies `Tests`.
    fn drop_caches_if(&self, boundary: DropMemoryCaches) {
        let policy = self.instance.drop_memory_caches();
        let active = match boundary {
            DropMemoryCaches::Steps => policy == DropMemoryCaches::Steps,
            DropMemoryCaches::Tests => {
                policy == DropMemoryCaches::Tests || policy == DropMemoryCaches::Steps
            }
            DropMemoryCaches::None => false,
        };
        if !active {
            return;
        }
        if let Some(dropper) = &self.cache_dropper {
            if let Err(e) = dropper.drop_caches() {
                warn!(target: "runner", "cache drop failed: {e:#}");
            }
        }
    }

    /// Tears everything down in reverse order of acquisition.
    async fn teardown(&mut self) {
        if let Some(watcher) = self.exit_watcher.take() {
            watcher.abort();
        }
        if let Some(rollback) = &mut self.rollback {
            rollback.teardown().await;
        }
        if self.container_started {
            if let Err(e) = self.adapter.stop().await {
                warn!(target: "runner", "container stop failed: {e:#}");
            }
        }
        if let Some(log_task) = self.log_task.take() {
            log_task.abort();
        }
        if let Some(workdir) = self.workdir.take() {
            workdir.teardown().await;
        }
        if let Some(jwt_dir) = self.jwt_dir.take() {
            let _ = std::fs::remove_dir_all(&jwt_dir);
        }
        if let Some(genesis_dir) = self.genesis_dir.take() {
            let _ = std::fs::remove_dir_all(&genesis_dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_sortable_and_unique() {
        let a = new_run_id();
        let b = new_run_id();
        assert_eq!(a.len(), "20260101-000000-abcdef".len());
        assert_ne!(a, b);
        // Lexicographic order tracks time order for same-second ids too,
        // thanks to the fixed-width layout.
        assert!(a[..15].chars().all(|c| c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn preliminary_config_record_omits_final_fields() {
        let record = RunConfigRecord {
            run_id: "r".into(),
            timestamp: now_rfc3339(),
            timestamp_end: None,
            status: RunStatus::Running,
            suite: "abcd".into(),
            instance: EffectiveInstance::default(),
            system: SystemInfo::collect(),
            labels: Default::default(),
            container_runtime: "docker".into(),
            stats_reader: None,
            start_block: None,
            test_counts: None,
            termination_reason: None,
            container_died: None,
            container_exit_code: None,
            container_oom_killed: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "running");
        assert!(json.get("timestamp_end").is_none());
        assert!(json.get("test_counts").is_none());
        assert!(json.get("container_exit_code").is_none());
        assert!(json["system"]["cpu_cores"].as_u64().unwrap() >= 1);
    }

    #[test]
    fn provider_selection_follows_the_source_config() {
        let yaml = r#"
runner:
  benchmark:
    results_dir: /tmp/results
    tests:
      source:
        local:
          directory: /tmp/suite
  instances: []
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let supervisor = RunSupervisor::new(config);
        let provider = supervisor.build_provider().unwrap();
        assert!(matches!(
            provider.source_info(),
            crate::source::SuiteSourceDescriptor::Local { .. }
        ));
    }

    #[tokio::test]
    async fn run_fails_fast_on_an_empty_suite() {
        let suite_dir = tempfile::tempdir().unwrap();
        let results_dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            r#"
runner:
  benchmark:
    results_dir: {}
    tests:
      source:
        local:
          directory: {}
  instances: []
"#,
            results_dir.path().display(),
            suite_dir.path().display()
        );
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        let supervisor = RunSupervisor::new(config);
        let err = supervisor
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[tokio::test]
    async fn failed_instance_still_finalises_config_and_result() {
        let suite_dir = tempfile::tempdir().unwrap();
        let steps = suite_dir.path().join("test");
        std::fs::create_dir_all(&steps).unwrap();
        std::fs::write(
            steps.join("a.txt"),
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"eth_chainId\",\"params\":[]}\n",
        )
        .unwrap();
        let results_dir = tempfile::tempdir().unwrap();
        let tmp_dir = tempfile::tempdir().unwrap();

        let yaml = format!(
            r#"
runner:
  # A runtime binary that cannot exist forces the container start to fail.
  directories:
    tmp_datadir: {tmp}
    tmp_cachedir: {tmp}
  benchmark:
    results_dir: {results}
    tests:
      source:
        local:
          directory: {suite}
          steps:
            test: ["test/*"]
  client:
    config:
      jwt: "688f5d737bad920bdfb2fc2f488d6b6209eebda1dae949a8de91398d932c517a"
  instances:
    - id: geth-a
      client: geth
      image: benchmarkoor-test/does-not-exist:none
"#,
            tmp = tmp_dir.path().display(),
            results = results_dir.path().display(),
            suite = suite_dir.path().display()
        );
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        let supervisor = RunSupervisor::new(config);
        let summary = supervisor.run(CancellationToken::new()).await.unwrap();
        assert_eq!(summary.failed, 1);

        // The run directory is terminal: a finalised config.json and a
        // result.json, even though nothing executed.
        let runs: Vec<_> = std::fs::read_dir(results_dir.path().join("runs"))
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .collect();
        assert_eq!(runs.len(), 1);
        let run_dir = runs[0].path();
        let record: RunConfigRecord = serde_json::from_str(
            &std::fs::read_to_string(run_dir.join("config.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.timestamp_end.is_some());
        assert!(record.termination_reason.is_some());
        assert!(run_dir.join("result.json").exists());
    }

    #[tokio::test]
    async fn skip_test_run_prepares_the_suite_tree_only() {
        let suite_dir = tempfile::tempdir().unwrap();
        let steps = suite_dir.path().join("test");
        std::fs::create_dir_all(&steps).unwrap();
        std::fs::write(
            steps.join("a.txt"),
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"eth_chainId\",\"params\":[]}\n",
        )
        .unwrap();
        let results_dir = tempfile::tempdir().unwrap();

        let yaml = format!(
            r#"
runner:
  benchmark:
    results_dir: {}
    skip_test_run: true
    tests:
      source:
        local:
          directory: {}
          steps:
            test: ["test/*"]
  client:
    config:
      jwt: "688f5d737bad920bdfb2fc2f488d6b6209eebda1dae949a8de91398d932c517a"
  instances:
    - id: geth-a
      client: geth
      image: img
"#,
            results_dir.path().display(),
            suite_dir.path().display()
        );
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        let supervisor = RunSupervisor::new(config);
        let summary = supervisor.run(CancellationToken::new()).await.unwrap();

        assert_eq!(summary.completed, 0);
        assert_eq!(summary.failed, 0);
        // The suite tree exists; no runs were produced.
        let suites: Vec<_> = std::fs::read_dir(results_dir.path().join("suites"))
            .unwrap()
            .collect();
        assert_eq!(suites.len(), 1);
        assert!(results_dir.path().join("runs/index.json").exists());
    }
}
