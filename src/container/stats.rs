//! Host-resource stats readers.
//!
//! The preferred reader consumes the container's cgroup v2 files directly;
//! when the cgroup cannot be located the runner falls back to reading the
//! same files through the container runtime (`exec cat`). The reader type
//! is recorded on the run.

use crate::{config::ContainerRuntime, results::stats::ResourceDelta, util::run_cmd_stdout};
use color_eyre::{eyre::eyre, Result};
use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::Mutex,
};
use tokio::process::Command;
use tracing::debug;

/// One sample of a container's cumulative resource counters.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StatsSample {
    /// Cumulative CPU usage, microseconds.
    pub(crate) cpu_usec: u64,
    /// Current memory usage, bytes.
    pub(crate) mem_bytes: u64,
    /// Cumulative bytes read from disk.
    pub(crate) rd_bytes: u64,
    /// Cumulative bytes written to disk.
    pub(crate) wr_bytes: u64,
    /// Cumulative disk read operations.
    pub(crate) rd_ops: u64,
    /// Cumulative disk write operations.
    pub(crate) wr_ops: u64,
}

impl StatsSample {
    /// The per-call delta between two samples. Counters are cumulative and
    /// monotonic; memory is a level, so its delta is signed.
    pub(crate) fn delta(before: Self, after: Self) -> ResourceDelta {
        ResourceDelta {
            disk_read_bytes: after.rd_bytes.saturating_sub(before.rd_bytes),
            disk_write_bytes: after.wr_bytes.saturating_sub(before.wr_bytes),
            disk_read_ops: after.rd_ops.saturating_sub(before.rd_ops),
            disk_write_ops: after.wr_ops.saturating_sub(before.wr_ops),
            cpu_usec: after.cpu_usec.saturating_sub(before.cpu_usec),
            memory_delta_bytes: after.mem_bytes as i64 - before.mem_bytes as i64,
        }
    }
}

/// A reader of container resource counters.
#[async_trait::async_trait]
pub(crate) trait StatsReader: Send + Sync {
    /// Reads the current counters.
    async fn read(&self) -> Result<StatsSample>;

    /// The reader type, recorded in the run metadata.
    fn kind(&self) -> &'static str;
}

/// Reads the container's cgroup v2 files directly. The file handles are
/// opened once per run and reused with read-seek-read cycles.
pub(crate) struct CgroupV2Reader {
    cpu_stat: Mutex<File>,
    memory_current: Mutex<File>,
    io_stat: Mutex<File>,
}

impl std::fmt::Debug for CgroupV2Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CgroupV2Reader").finish_non_exhaustive()
    }
}

impl CgroupV2Reader {
    /// Opens the reader over a cgroup directory.
    pub(crate) fn open(cgroup_dir: &Path) -> Result<Self> {
        Ok(Self {
            cpu_stat: Mutex::new(File::open(cgroup_dir.join("cpu.stat"))?),
            memory_current: Mutex::new(File::open(cgroup_dir.join("memory.current"))?),
            io_stat: Mutex::new(File::open(cgroup_dir.join("io.stat"))?),
        })
    }

    /// Locates the cgroup directory of a container by id, trying the usual
    /// docker and podman slices under `cgroup_root`.
    pub(crate) fn discover(
        cgroup_root: &Path,
        runtime: ContainerRuntime,
        container_id: &str,
    ) -> Option<PathBuf> {
        let candidates = match runtime {
            ContainerRuntime::Docker => vec![
                cgroup_root.join(format!("system.slice/docker-{container_id}.scope")),
                cgroup_root.join(format!("docker/{container_id}")),
            ],
            ContainerRuntime::Podman => vec![
                cgroup_root.join(format!("machine.slice/libpod-{container_id}.scope")),
                cgroup_root.join(format!(
                    "machine.slice/libpod-{container_id}.scope/container"
                )),
            ],
        };
        candidates.into_iter().find(|path| path.join("cpu.stat").is_file())
    }

    fn read_file(file: &Mutex<File>) -> Result<String> {
        let mut file = file.lock().map_err(|_| eyre!("stats reader lock poisoned"))?;
        file.seek(SeekFrom::Start(0))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(contents)
    }
}

#[async_trait::async_trait]
impl StatsReader for CgroupV2Reader {
    async fn read(&self) -> Result<StatsSample> {
        let cpu_stat = Self::read_file(&self.cpu_stat)?;
        let memory_current = Self::read_file(&self.memory_current)?;
        let io_stat = Self::read_file(&self.io_stat)?;
        parse_sample(&cpu_stat, &memory_current, &io_stat)
    }

    fn kind(&self) -> &'static str {
        "cgroup-v2"
    }
}

/// Reads the same cgroup files through the container runtime. Slower, but
/// works when the host cannot see the container's cgroup directly.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeExecReader {
    runtime: ContainerRuntime,
    container: String,
}

impl RuntimeExecReader {
    /// Creates a reader for a running container.
    pub(crate) fn new(runtime: ContainerRuntime, container: impl Into<String>) -> Self {
        Self {
            runtime,
            container: container.into(),
        }
    }
}

#[async_trait::async_trait]
impl StatsReader for RuntimeExecReader {
    async fn read(&self) -> Result<StatsSample> {
        let output = run_cmd_stdout(
            Command::new(self.runtime.to_string()).args([
                "exec",
                &self.container,
                "cat",
                "/sys/fs/cgroup/cpu.stat",
                "/sys/fs/cgroup/memory.current",
                "/sys/fs/cgroup/io.stat",
            ]),
            "stats exec",
        )
        .await?;

        // The three files are concatenated; the memory level is the only
        // bare-number line.
        let memory_line = output
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && line.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or("0");
        parse_sample(&output, memory_line, &output)
    }

    fn kind(&self) -> &'static str {
        "runtime-exec"
    }
}

/// Parses a sample out of `cpu.stat`, `memory.current` and `io.stat`
/// contents.
fn parse_sample(cpu_stat: &str, memory_current: &str, io_stat: &str) -> Result<StatsSample> {
    let mut sample = StatsSample {
        mem_bytes: memory_current.trim().parse().unwrap_or(0),
        ..Default::default()
    };

    for line in cpu_stat.lines() {
        if let Some(value) = line.strip_prefix("usage_usec ") {
            sample.cpu_usec = value.trim().parse()?;
            break;
        }
    }

    // io.stat: one line per device, `maj:min rbytes=N wbytes=N rios=N
    // wios=N ...`, summed across devices.
    for line in io_stat.lines() {
        for field in line.split_whitespace() {
            let Some((key, value)) = field.split_once('=') else {
                continue;
            };
            let Ok(value) = value.parse::<u64>() else {
                continue;
            };
            match key {
                "rbytes" => sample.rd_bytes += value,
                "wbytes" => sample.wr_bytes += value,
                "rios" => sample.rd_ops += value,
                "wios" => sample.wr_ops += value,
                _ => {}
            }
        }
    }

    debug!(target: "container", "stats sample: {sample:?}");
    Ok(sample)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const CPU_STAT: &str = "usage_usec 123456\nuser_usec 100000\nsystem_usec 23456\n";
    const IO_STAT: &str = "8:0 rbytes=1000 wbytes=2000 rios=10 wios=20 dbytes=0 dios=0\n\
                           8:16 rbytes=500 wbytes=100 rios=5 wios=1 dbytes=0 dios=0\n";

    #[test]
    fn parse_sums_io_across_devices() {
        let sample = parse_sample(CPU_STAT, "4096\n", IO_STAT).unwrap();
        assert_eq!(sample.cpu_usec, 123_456);
        assert_eq!(sample.mem_bytes, 4096);
        assert_eq!(sample.rd_bytes, 1_500);
        assert_eq!(sample.wr_bytes, 2_100);
        assert_eq!(sample.rd_ops, 15);
        assert_eq!(sample.wr_ops, 21);
    }

    #[test]
    fn delta_is_signed_for_memory_only() {
        let before = StatsSample {
            cpu_usec: 100,
            mem_bytes: 2_000,
            rd_bytes: 10,
            wr_bytes: 10,
            rd_ops: 1,
            wr_ops: 1,
        };
        let after = StatsSample {
            cpu_usec: 150,
            mem_bytes: 1_500,
            rd_bytes: 30,
            wr_bytes: 15,
            rd_ops: 3,
            wr_ops: 2,
        };
        let delta = StatsSample::delta(before, after);
        assert_eq!(delta.cpu_usec, 50);
        assert_eq!(delta.memory_delta_bytes, -500);
        assert_eq!(delta.disk_read_bytes, 20);
        assert_eq!(delta.disk_write_ops, 1);
    }

    #[tokio::test]
    async fn cgroup_reader_rereads_changing_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cpu.stat"), CPU_STAT).unwrap();
        fs::write(dir.path().join("memory.current"), "1000\n").unwrap();
        fs::write(dir.path().join("io.stat"), IO_STAT).unwrap();

        let reader = CgroupV2Reader::open(dir.path()).unwrap();
        let first = reader.read().await.unwrap();
        assert_eq!(first.mem_bytes, 1_000);

        fs::write(dir.path().join("memory.current"), "9000\n").unwrap();
        let second = reader.read().await.unwrap();
        assert_eq!(second.mem_bytes, 9_000);
        assert_eq!(reader.kind(), "cgroup-v2");
    }

    #[test]
    fn discover_prefers_existing_scope() {
        let root = tempfile::tempdir().unwrap();
        let scope = root.path().join("system.slice/docker-abc123.scope");
        fs::create_dir_all(&scope).unwrap();
        fs::write(scope.join("cpu.stat"), CPU_STAT).unwrap();

        let found = CgroupV2Reader::discover(root.path(), ContainerRuntime::Docker, "abc123");
        assert_eq!(found, Some(scope));
        assert_eq!(
            CgroupV2Reader::discover(root.path(), ContainerRuntime::Docker, "missing"),
            None
        );
    }
}
