//! Host-resource policy: container resource limits, the sysfs CPU-frequency
//! controller, and the page-cache dropper.
//!
//! The sysfs knobs and the drop-caches file are process-global. Both are
//! wrapped in controllers that capture the original values before modifying
//! anything and restore them on teardown; the controllers are the only
//! writers.

use crate::util::parse_size;
use color_eyre::{
    eyre::{bail, ensure, eyre},
    Result,
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Resource limits applied to a client container and the host CPUs it runs
/// on.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ResourceLimits {
    /// An explicit set of CPU ids the container is pinned to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) cpuset: Option<Vec<usize>>,
    /// The number of CPUs to pin the container to (ids chosen by the
    /// runner). Mutually exclusive with `cpuset`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) cpuset_count: Option<usize>,
    /// The memory cap, as a Docker-style size string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) memory: Option<String>,
    /// Whether swap is disabled for the container.
    #[serde(default)]
    pub(crate) swap_disabled: bool,
    /// Block-I/O throttles, per device.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) blkio: Vec<BlkioThrottle>,
    /// The CPU frequency target, in kHz, or `"max"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) cpu_freq: Option<CpuFreq>,
    /// The CPU frequency governor to select.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) cpu_freq_governor: Option<String>,
    /// Whether turbo boost is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) cpu_turboboost: Option<bool>,
}

impl ResourceLimits {
    /// The effective cpuset as a Docker `--cpuset-cpus` string.
    pub(crate) fn cpuset_cpus(&self) -> Option<String> {
        if let Some(ids) = &self.cpuset {
            return Some(
                ids.iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
        self.cpuset_count
            .map(|count| (0..count).map(|id| id.to_string()).collect::<Vec<_>>().join(","))
    }

    /// The CPU ids affected by the frequency policy.
    pub(crate) fn cpu_ids(&self) -> Vec<usize> {
        if let Some(ids) = &self.cpuset {
            ids.clone()
        } else if let Some(count) = self.cpuset_count {
            (0..count).collect()
        } else {
            (0..num_cpus::get()).collect()
        }
    }

    /// Whether any sysfs-level CPU tuning is requested.
    pub(crate) fn wants_cpu_tuning(&self) -> bool {
        self.cpu_freq.is_some() || self.cpu_freq_governor.is_some() || self.cpu_turboboost.is_some()
    }

    /// Validates the limits against the host.
    pub(crate) fn validate(&self) -> Result<()> {
        ensure!(
            !(self.cpuset.is_some() && self.cpuset_count.is_some()),
            "cpuset and cpuset_count are mutually exclusive"
        );
        let num_cpus = num_cpus::get();
        if let Some(ids) = &self.cpuset {
            for id in ids {
                ensure!(*id < num_cpus, "cpuset id {id} out of range [0, {num_cpus})");
            }
        }
        if let Some(count) = self.cpuset_count {
            ensure!(count > 0 && count <= num_cpus, "cpuset_count {count} out of range");
        }
        if let Some(memory) = &self.memory {
            parse_size(memory)?;
        }
        for throttle in &self.blkio {
            throttle.validate()?;
        }
        Ok(())
    }
}

/// A per-device block-I/O throttle.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct BlkioThrottle {
    /// The device path (e.g. `/dev/sda`).
    pub(crate) device: String,
    /// Read rate cap, bytes per second, as a size string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) read_bps: Option<String>,
    /// Write rate cap, bytes per second, as a size string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) write_bps: Option<String>,
    /// Read IOPS cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) read_iops: Option<u64>,
    /// Write IOPS cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) write_iops: Option<u64>,
}

impl BlkioThrottle {
    fn validate(&self) -> Result<()> {
        ensure!(!self.device.is_empty(), "blkio throttle without a device");
        if let Some(rate) = &self.read_bps {
            parse_size(rate)?;
        }
        if let Some(rate) = &self.write_bps {
            parse_size(rate)?;
        }
        Ok(())
    }
}

/// A CPU frequency target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CpuFreq {
    /// Pin to the maximum frequency supported by each CPU.
    Max,
    /// Pin to a fixed frequency, in kHz.
    Khz(u64),
}

impl Serialize for CpuFreq {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Max => serializer.serialize_str("max"),
            Self::Khz(khz) => serializer.serialize_u64(*khz),
        }
    }
}

impl<'de> Deserialize<'de> for CpuFreq {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        let value = serde_yaml::Value::deserialize(deserializer)?;
        match value {
            serde_yaml::Value::String(s) if s == "max" => Ok(Self::Max),
            serde_yaml::Value::Number(n) => n
                .as_u64()
                .map(Self::Khz)
                .ok_or_else(|| D::Error::custom("cpu_freq must be a positive integer")),
            _ => Err(D::Error::custom("cpu_freq must be a kHz integer or \"max\"")),
        }
    }
}

/// When to drop the kernel page cache during a run.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum DropMemoryCaches {
    /// Never.
    #[default]
    None,
    /// Between tests.
    Tests,
    /// Between steps (implies between tests).
    Steps,
}

/// Drops the kernel page cache through the configured drop-caches file.
#[derive(Debug, Clone)]
pub(crate) struct CacheDropper {
    path: PathBuf,
}

impl CacheDropper {
    /// Creates a dropper, verifying write access up front.
    pub(crate) fn new(path: &Path) -> Result<Self> {
        // O_WRONLY probe so missing permission surfaces as a config-time
        // error rather than mid-run.
        fs::OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| eyre!("drop-caches file {} is not writable: {e}", path.display()))?;
        Ok(Self { path: path.to_path_buf() })
    }

    /// Syncs dirty pages and drops the page cache.
    pub(crate) fn drop_caches(&self) -> Result<()> {
        // SAFETY: sync(2) has no failure modes of interest here.
        unsafe { libc::sync() };
        let mut file = fs::OpenOptions::new().write(true).open(&self.path)?;
        file.write_all(b"3")?;
        debug!(target: "resources", "dropped page caches");
        Ok(())
    }
}

/// The sysfs files touched per CPU by the frequency controller.
const SCALING_GOVERNOR: &str = "scaling_governor";
const SCALING_MAX_FREQ: &str = "scaling_max_freq";
const SCALING_MIN_FREQ: &str = "scaling_min_freq";

/// Captured pre-modification sysfs state, restored on teardown.
#[derive(Debug, Default)]
pub(crate) struct SavedCpuState {
    /// Per-CPU (id, file, original value) triples, restored in reverse.
    entries: Vec<(PathBuf, String)>,
}

/// Applies CPU-frequency policy by writing `/sys/devices/system/cpu/...`
/// files, capturing the original values first.
#[derive(Debug, Clone)]
pub(crate) struct SysfsCpuController {
    root: PathBuf,
    default_root: bool,
}

impl SysfsCpuController {
    /// The default sysfs CPU root.
    pub(crate) const DEFAULT_ROOT: &'static str = "/sys/devices/system/cpu";

    /// Creates a controller rooted at `root`.
    pub(crate) fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            default_root: root == Path::new(Self::DEFAULT_ROOT),
        }
    }

    /// Applies the CPU-tuning parts of `limits`, returning the saved state.
    ///
    /// Frequency targets are validated against the kernel-reported min/max
    /// range and governors against `scaling_available_governors`. The real
    /// sysfs root is Linux-only; a non-default root (tests) bypasses the
    /// platform check.
    pub(crate) fn apply(&self, limits: &ResourceLimits) -> Result<SavedCpuState> {
        if !limits.wants_cpu_tuning() {
            return Ok(SavedCpuState::default());
        }
        if !cfg!(target_os = "linux") && self.default_root {
            bail!("CPU frequency tuning requires Linux");
        }

        let mut saved = SavedCpuState::default();
        for cpu in limits.cpu_ids() {
            let cpufreq = self.root.join(format!("cpu{cpu}/cpufreq"));

            if let Some(governor) = &limits.cpu_freq_governor {
                let available = fs::read_to_string(cpufreq.join("scaling_available_governors"))?;
                ensure!(
                    available.split_whitespace().any(|g| g == governor),
                    "governor {governor} not available for cpu{cpu} (available: {})",
                    available.trim()
                );
                self.write_saving(&cpufreq.join(SCALING_GOVERNOR), governor, &mut saved)?;
            }

            if let Some(freq) = limits.cpu_freq {
                let min: u64 = read_trimmed(&cpufreq.join("cpuinfo_min_freq"))?.parse()?;
                let max: u64 = read_trimmed(&cpufreq.join("cpuinfo_max_freq"))?.parse()?;
                let target = match freq {
                    CpuFreq::Max => max,
                    CpuFreq::Khz(khz) => {
                        ensure!(
                            (min..=max).contains(&khz),
                            "cpu_freq {khz} kHz outside cpu{cpu} range [{min}, {max}]"
                        );
                        khz
                    }
                };
                self.write_saving(&cpufreq.join(SCALING_MAX_FREQ), &target.to_string(), &mut saved)?;
                self.write_saving(&cpufreq.join(SCALING_MIN_FREQ), &target.to_string(), &mut saved)?;
            }
        }

        if let Some(turbo) = limits.cpu_turboboost {
            self.apply_turbo(turbo, &mut saved)?;
        }

        Ok(saved)
    }

    /// Restores the previously captured sysfs values, in reverse order.
    pub(crate) fn restore(&self, saved: SavedCpuState) {
        for (path, value) in saved.entries.into_iter().rev() {
            if let Err(e) = fs::write(&path, &value) {
                warn!(target: "resources", "failed to restore {}: {e}", path.display());
            }
        }
    }

    fn apply_turbo(&self, enabled: bool, saved: &mut SavedCpuState) -> Result<()> {
        // intel_pstate exposes an inverted `no_turbo` knob; acpi-cpufreq a
        // plain `boost` one.
        let no_turbo = self.root.join("intel_pstate/no_turbo");
        if no_turbo.exists() {
            return self.write_saving(&no_turbo, if enabled { "0" } else { "1" }, saved);
        }
        let boost = self.root.join("cpufreq/boost");
        if boost.exists() {
            return self.write_saving(&boost, if enabled { "1" } else { "0" }, saved);
        }
        bail!("no turbo-boost control found under {}", self.root.display())
    }

    fn write_saving(&self, path: &Path, value: &str, saved: &mut SavedCpuState) -> Result<()> {
        let original = read_trimmed(path)?;
        fs::write(path, value)?;
        saved.entries.push((path.to_path_buf(), original));
        Ok(())
    }
}

fn read_trimmed(path: &Path) -> Result<String> {
    Ok(fs::read_to_string(path)
        .map_err(|e| eyre!("failed to read {}: {e}", path.display()))?
        .trim()
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_sysfs(cpus: usize) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for cpu in 0..cpus {
            let cpufreq = dir.path().join(format!("cpu{cpu}/cpufreq"));
            fs::create_dir_all(&cpufreq).unwrap();
            fs::write(cpufreq.join("cpuinfo_min_freq"), "800000\n").unwrap();
            fs::write(cpufreq.join("cpuinfo_max_freq"), "3500000\n").unwrap();
            fs::write(cpufreq.join("scaling_min_freq"), "800000\n").unwrap();
            fs::write(cpufreq.join("scaling_max_freq"), "3500000\n").unwrap();
            fs::write(cpufreq.join("scaling_governor"), "schedutil\n").unwrap();
            fs::write(
                cpufreq.join("scaling_available_governors"),
                "performance powersave schedutil\n",
            )
            .unwrap();
        }
        fs::create_dir_all(dir.path().join("intel_pstate")).unwrap();
        fs::write(dir.path().join("intel_pstate/no_turbo"), "0\n").unwrap();
        dir
    }

    fn limits(cpu_freq: Option<CpuFreq>, governor: Option<&str>, turbo: Option<bool>) -> ResourceLimits {
        ResourceLimits {
            cpuset: Some(vec![0, 1]),
            cpu_freq,
            cpu_freq_governor: governor.map(Into::into),
            cpu_turboboost: turbo,
            ..Default::default()
        }
    }

    #[test]
    fn apply_and_restore_round_trips_sysfs() {
        let sysfs = fake_sysfs(2);
        let controller = SysfsCpuController::new(sysfs.path());

        let saved = controller
            .apply(&limits(Some(CpuFreq::Khz(2_000_000)), Some("performance"), Some(false)))
            .unwrap();

        let cpu0 = sysfs.path().join("cpu0/cpufreq");
        assert_eq!(fs::read_to_string(cpu0.join("scaling_governor")).unwrap(), "performance");
        assert_eq!(fs::read_to_string(cpu0.join("scaling_max_freq")).unwrap(), "2000000");
        assert_eq!(
            fs::read_to_string(sysfs.path().join("intel_pstate/no_turbo")).unwrap(),
            "1"
        );

        controller.restore(saved);
        assert_eq!(fs::read_to_string(cpu0.join("scaling_governor")).unwrap(), "schedutil");
        assert_eq!(fs::read_to_string(cpu0.join("scaling_max_freq")).unwrap(), "3500000");
        assert_eq!(
            fs::read_to_string(sysfs.path().join("intel_pstate/no_turbo")).unwrap(),
            "0"
        );
    }

    #[test]
    fn apply_rejects_out_of_range_frequency() {
        let sysfs = fake_sysfs(2);
        let controller = SysfsCpuController::new(sysfs.path());
        let err = controller
            .apply(&limits(Some(CpuFreq::Khz(9_999_999)), None, None))
            .unwrap_err();
        assert!(err.to_string().contains("outside"));
    }

    #[test]
    fn apply_rejects_unknown_governor() {
        let sysfs = fake_sysfs(2);
        let controller = SysfsCpuController::new(sysfs.path());
        let err = controller
            .apply(&limits(None, Some("warpspeed"), None))
            .unwrap_err();
        assert!(err.to_string().contains("not available"));
    }

    #[test]
    fn cpuset_cpus_renders_explicit_ids_and_counts() {
        let explicit = ResourceLimits {
            cpuset: Some(vec![2, 4, 6]),
            ..Default::default()
        };
        assert_eq!(explicit.cpuset_cpus().unwrap(), "2,4,6");

        let counted = ResourceLimits {
            cpuset_count: Some(3),
            ..Default::default()
        };
        assert_eq!(counted.cpuset_cpus().unwrap(), "0,1,2");
    }

    #[test]
    fn validate_rejects_conflicting_cpusets() {
        let conflicting = ResourceLimits {
            cpuset: Some(vec![0]),
            cpuset_count: Some(1),
            ..Default::default()
        };
        assert!(conflicting.validate().is_err());
    }

    #[test]
    fn cpu_freq_deserialises_max_and_khz() {
        #[derive(Deserialize)]
        struct Wrapper {
            cpu_freq: CpuFreq,
        }
        let max: Wrapper = serde_yaml::from_str("cpu_freq: max").unwrap();
        assert_eq!(max.cpu_freq, CpuFreq::Max);
        let khz: Wrapper = serde_yaml::from_str("cpu_freq: 2400000").unwrap();
        assert_eq!(khz.cpu_freq, CpuFreq::Khz(2_400_000));
    }

    #[test]
    fn cache_dropper_requires_writable_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("drop_caches");
        assert!(CacheDropper::new(&missing).is_err());

        fs::write(&missing, "0").unwrap();
        let dropper = CacheDropper::new(&missing).unwrap();
        dropper.drop_caches().unwrap();
        assert_eq!(fs::read_to_string(&missing).unwrap(), "3");
    }
}
