//! The docker/podman CLI container adapter.
//!
//! The runtime binary is driven through `tokio::process::Command`; the
//! runner never links a container-engine client library. Every container
//! started here carries the `io.benchmarkoor` label so leftovers can be
//! swept before a new run.

use super::{ContainerAdapter, ContainerSpec, ContainerState};
use crate::{
    config::{ContainerRuntime, PullPolicy},
    util::{parse_size, run_cmd, run_cmd_stdout},
};
use color_eyre::{
    eyre::{ensure, eyre},
    Result,
};
use std::path::{Path, PathBuf};
use tokio::{io::AsyncBufReadExt, process::Command, task::JoinHandle};
use tracing::{debug, info, warn};

/// The label attached to every runner-managed container.
pub(crate) const CONTAINER_LABEL: &str = "io.benchmarkoor";

/// A container managed through the runtime CLI.
#[derive(Debug, Clone)]
pub(crate) struct CliRuntime {
    runtime: ContainerRuntime,
    name: String,
}

impl CliRuntime {
    /// Creates an adapter for one named container.
    pub(crate) fn new(runtime: ContainerRuntime, name: impl Into<String>) -> Self {
        Self {
            runtime,
            name: name.into(),
        }
    }

    /// The container name.
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn command(&self) -> Command {
        Command::new(self.runtime.to_string())
    }

    /// Ensures the bridge network exists.
    pub(crate) async fn ensure_network(&self, network: &str) -> Result<()> {
        let exists = self
            .command()
            .args(["network", "inspect", network])
            .output()
            .await?
            .status
            .success();
        if !exists {
            info!(target: "container", "creating network {network}");
            run_cmd(
                self.command().args(["network", "create", network]),
                "network create",
            )
            .await?;
        }
        Ok(())
    }

    /// Pulls the image according to the policy.
    pub(crate) async fn pull(&self, image: &str, policy: PullPolicy) -> Result<()> {
        let should_pull = match policy {
            PullPolicy::Always => true,
            PullPolicy::Never => false,
            PullPolicy::IfNotPresent => !self
                .command()
                .args(["image", "inspect", image])
                .output()
                .await?
                .status
                .success(),
        };
        if should_pull {
            info!(target: "container", "pulling {image}");
            run_cmd(self.command().args(["pull", image]), "image pull").await?;
        }
        Ok(())
    }

    /// Removes every container carrying the runner label.
    pub(crate) async fn remove_labelled(&self) -> Result<()> {
        let ids = run_cmd_stdout(
            self.command()
                .args(["ps", "-aq", "--filter", &format!("label={CONTAINER_LABEL}")]),
            "container list",
        )
        .await?;
        for id in ids.split_whitespace() {
            warn!(target: "container", "removing leftover container {id}");
            run_cmd(self.command().args(["rm", "-f", id]), "container rm").await?;
        }
        Ok(())
    }

    /// The full container id.
    pub(crate) async fn container_id(&self) -> Result<String> {
        run_cmd_stdout(
            self.command()
                .args(["inspect", "--format", "{{.Id}}", &self.name]),
            "container inspect",
        )
        .await
    }

    /// Streams the container's logs to stdout and/or a file until the
    /// container exits or the task is aborted.
    pub(crate) fn stream_logs(
        &self,
        to_stdout: bool,
        file: Option<PathBuf>,
    ) -> JoinHandle<()> {
        let runtime = self.runtime.to_string();
        let name = self.name.clone();
        tokio::spawn(async move {
            let mut child = match Command::new(&runtime)
                .args(["logs", "-f", &name])
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .spawn()
            {
                Ok(child) => child,
                Err(e) => {
                    warn!(target: "container", "log streaming failed to start: {e}");
                    return;
                }
            };

            let mut sink = match &file {
                Some(path) => match tokio::fs::File::create(path).await {
                    Ok(file) => Some(file),
                    Err(e) => {
                        warn!(target: "container", "log file {} not writable: {e}", path.display());
                        None
                    }
                },
                None => None,
            };

            let stdout = child.stdout.take().expect("stdout was piped");
            let stderr = child.stderr.take().expect("stderr was piped");
            let mut lines = tokio::io::BufReader::new(stdout).lines();
            let mut err_lines = tokio::io::BufReader::new(stderr).lines();

            loop {
                let line = tokio::select! {
                    line = lines.next_line() => line,
                    line = err_lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) => {
                        if to_stdout {
                            println!("[{name}] {line}");
                        }
                        if let Some(sink) = &mut sink {
                            use tokio::io::AsyncWriteExt;
                            let _ = sink.write_all(line.as_bytes()).await;
                            let _ = sink.write_all(b"\n").await;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(target: "container", "log stream ended: {e}");
                        break;
                    }
                }
            }
        })
    }

    /// Builds the `run` argument vector for a spec.
    fn run_args(&self, spec: &ContainerSpec) -> Result<Vec<String>> {
        let mut args = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            spec.name.clone(),
            "--label".into(),
            format!("{CONTAINER_LABEL}=1"),
            "--network".into(),
            spec.network.clone(),
            "-p".into(),
            format!("127.0.0.1::{}", spec.engine_port),
        ];

        if let Some(limits) = &spec.limits {
            if let Some(cpuset) = limits.cpuset_cpus() {
                args.push("--cpuset-cpus".into());
                args.push(cpuset);
            }
            if let Some(memory) = &limits.memory {
                // Validated at config time; parse to normalise.
                let bytes = parse_size(memory)?;
                args.push("--memory".into());
                args.push(bytes.to_string());
                if limits.swap_disabled {
                    args.push("--memory-swap".into());
                    args.push(bytes.to_string());
                }
            }
            for throttle in &limits.blkio {
                if let Some(rate) = &throttle.read_bps {
                    args.push("--device-read-bps".into());
                    args.push(format!("{}:{}", throttle.device, parse_size(rate)?));
                }
                if let Some(rate) = &throttle.write_bps {
                    args.push("--device-write-bps".into());
                    args.push(format!("{}:{}", throttle.device, parse_size(rate)?));
                }
                if let Some(iops) = throttle.read_iops {
                    args.push("--device-read-iops".into());
                    args.push(format!("{}:{iops}", throttle.device));
                }
                if let Some(iops) = throttle.write_iops {
                    args.push("--device-write-iops".into());
                    args.push(format!("{}:{iops}", throttle.device));
                }
            }
        }

        for (key, value) in &spec.environment {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        for mount in &spec.mounts {
            let mut volume = format!("{}:{}", mount.host.display(), mount.container.display());
            if mount.read_only {
                volume.push_str(":ro");
            }
            args.push("-v".into());
            args.push(volume);
        }

        // The runtime CLI takes a single entrypoint binary; further
        // entrypoint elements lead the command.
        let mut trailing = Vec::new();
        if let Some(entrypoint) = &spec.entrypoint {
            let binary = entrypoint
                .first()
                .ok_or_else(|| eyre!("empty entrypoint override"))?;
            args.push("--entrypoint".into());
            args.push(binary.clone());
            trailing.extend(entrypoint.iter().skip(1).cloned());
        }

        args.push(spec.image.clone());
        args.extend(trailing);
        args.extend(spec.command.iter().cloned());
        Ok(args)
    }
}

#[async_trait::async_trait]
impl ContainerAdapter for CliRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<()> {
        ensure!(spec.name == self.name, "spec name does not match adapter");
        self.ensure_network(&spec.network).await?;
        self.pull(&spec.image, spec.pull_policy).await?;

        let args = self.run_args(spec)?;
        debug!(target: "container", "{} {}", self.runtime, args.join(" "));
        run_cmd(self.command().args(&args), "container run").await?;
        info!(target: "container", "started {}", self.name);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        run_cmd(
            self.command().args(["stop", "-t", "30", &self.name]),
            "container stop",
        )
        .await?;
        run_cmd(self.command().args(["rm", "-f", &self.name]), "container rm").await?;
        Ok(())
    }

    async fn recreate(&self, spec: &ContainerSpec) -> Result<()> {
        info!(target: "container", "recreating {}", self.name);
        self.stop().await?;
        let args = self.run_args(spec)?;
        run_cmd(self.command().args(&args), "container run").await?;
        Ok(())
    }

    async fn checkpoint(&self, image_path: &Path) -> Result<()> {
        ensure!(
            self.runtime == ContainerRuntime::Podman,
            "checkpointing requires podman"
        );
        run_cmd(
            self.command()
                .args(["container", "checkpoint", "--leave-running", "-e"])
                .arg(image_path)
                .arg(&self.name),
            "container checkpoint",
        )
        .await?;
        Ok(())
    }

    async fn restore(&self, image_path: &Path) -> Result<()> {
        ensure!(
            self.runtime == ContainerRuntime::Podman,
            "restoring requires podman"
        );
        // Restoring from an exported image recreates the container, so the
        // current one has to go first.
        run_cmd(
            self.command().args(["rm", "-f", "--ignore", &self.name]),
            "container rm",
        )
        .await?;
        run_cmd(
            self.command()
                .args(["container", "restore", "-i"])
                .arg(image_path),
            "container restore",
        )
        .await?;
        Ok(())
    }

    async fn inspect(&self) -> Result<ContainerState> {
        let output = run_cmd_stdout(
            self.command().args([
                "inspect",
                "--format",
                "{{.State.ExitCode}}|{{.State.OOMKilled}}",
                &self.name,
            ]),
            "container inspect",
        )
        .await?;
        let mut parts = output.split('|');
        let exit_code = parts
            .next()
            .and_then(|code| code.parse().ok())
            .unwrap_or(-1);
        let oom_killed = parts.next() == Some("true");
        Ok(ContainerState {
            exit_code,
            oom_killed,
        })
    }

    async fn mapped_engine_port(&self, engine_port: u16) -> Result<u16> {
        let output = run_cmd_stdout(
            self.command()
                .args(["port", &self.name, &engine_port.to_string()]),
            "container port",
        )
        .await?;
        // `port` prints lines like `127.0.0.1:49153`.
        output
            .lines()
            .filter_map(|line| line.rsplit_once(':'))
            .filter_map(|(_, port)| port.trim().parse().ok())
            .next()
            .ok_or_else(|| eyre!("no published port for {engine_port}: {output}"))
    }

    async fn wait_exit(&self) -> Result<i64> {
        let output = run_cmd_stdout(self.command().args(["wait", &self.name]), "container wait")
            .await?;
        Ok(output.trim().parse()?)
    }
}
