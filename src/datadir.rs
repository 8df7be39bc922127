//! Client data-directory materialisation.
//!
//! Every method produces an ephemeral working directory whose lifetime
//! equals the run: `copy` duplicates the source tree, the overlay methods
//! mount the source as a read-only lower layer, and `zfs` clones a
//! pre-existing snapshot of the source dataset.

use crate::{
    fsutil::FsWriter,
    util::{run_cmd, run_cmd_stdout},
};
use color_eyre::{eyre::ensure, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tokio::process::Command;
use tracing::{debug, warn};

/// The snapshot of the source dataset that `zfs` working copies are cloned
/// from.
const ZFS_SOURCE_SNAPSHOT: &str = "benchmarkoor";

/// The snapshot taken on the clone for checkpoint-restore rollback.
const ZFS_ROLLBACK_SNAPSHOT: &str = "pretest";

/// A pre-populated client data directory.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct DataDirConfig {
    /// The source directory holding the pre-populated data.
    pub(crate) source_dir: PathBuf,
    /// Where the working copy is mounted inside the container.
    pub(crate) mount_path: PathBuf,
    /// How the per-run working copy is produced.
    pub(crate) method: DataDirMethod,
}

/// How a per-run working copy of the data directory is produced.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum DataDirMethod {
    /// Recursive copy of the source directory.
    #[default]
    Copy,
    /// Kernel overlayfs mount with the source as the lower layer.
    Overlayfs,
    /// fuse-overlayfs mount with the source as the lower layer.
    FuseOverlayfs,
    /// Clone of a pre-existing ZFS snapshot of the source dataset.
    Zfs,
}

/// An ephemeral working copy of a client data directory.
#[derive(Debug)]
pub(crate) struct WorkingDir {
    /// The host path mounted into the container.
    pub(crate) path: PathBuf,
    /// The container mount path.
    pub(crate) mount_path: PathBuf,
    backing: Backing,
}

#[derive(Debug)]
enum Backing {
    Copy { root: PathBuf },
    Overlay { root: PathBuf, merged: PathBuf },
    Zfs { clone: String },
}

impl WorkingDir {
    /// Materialises a working copy for one run.
    pub(crate) async fn materialize(
        config: &DataDirConfig,
        tmp_root: &Path,
        run_id: &str,
    ) -> Result<Self> {
        ensure!(
            config.source_dir.is_dir(),
            "datadir source {} does not exist",
            config.source_dir.display()
        );
        let root = tmp_root.join(format!("benchmarkoor-{run_id}"));

        let (path, backing) = match config.method {
            DataDirMethod::Copy => {
                let dest = root.join("datadir");
                debug!(target: "datadir", "copying {} -> {}", config.source_dir.display(), dest.display());
                FsWriter::new(None).copy_dir_all(&config.source_dir, &dest)?;
                (dest, Backing::Copy { root: root.clone() })
            }
            DataDirMethod::Overlayfs | DataDirMethod::FuseOverlayfs => {
                let upper = root.join("upper");
                let work = root.join("work");
                let merged = root.join("merged");
                for dir in [&upper, &work, &merged] {
                    fs::create_dir_all(dir)?;
                }
                let options = format!(
                    "lowerdir={},upperdir={},workdir={}",
                    config.source_dir.display(),
                    upper.display(),
                    work.display()
                );
                if config.method == DataDirMethod::Overlayfs {
                    run_cmd(
                        Command::new("mount")
                            .args(["-t", "overlay", "overlay", "-o"])
                            .arg(&options)
                            .arg(&merged),
                        "overlay mount",
                    )
                    .await?;
                } else {
                    run_cmd(
                        Command::new("fuse-overlayfs").arg("-o").arg(&options).arg(&merged),
                        "fuse-overlayfs mount",
                    )
                    .await?;
                }
                (
                    merged.clone(),
                    Backing::Overlay { root: root.clone(), merged },
                )
            }
            DataDirMethod::Zfs => {
                let dataset = dataset_for(&config.source_dir).await?;
                let clone = format!("{dataset}/benchmarkoor-{run_id}");
                run_cmd(
                    Command::new("zfs")
                        .arg("clone")
                        .arg(format!("{dataset}@{ZFS_SOURCE_SNAPSHOT}"))
                        .arg(&clone),
                    "zfs clone",
                )
                .await?;
                let mountpoint = run_cmd_stdout(
                    Command::new("zfs").args(["get", "-H", "-o", "value", "mountpoint"]).arg(&clone),
                    "zfs get mountpoint",
                )
                .await?;
                (PathBuf::from(mountpoint), Backing::Zfs { clone })
            }
        };

        Ok(Self {
            path,
            mount_path: config.mount_path.clone(),
            backing,
        })
    }

    /// Takes the per-test rollback snapshot on a ZFS-backed working copy.
    pub(crate) async fn zfs_snapshot(&self) -> Result<()> {
        let Backing::Zfs { clone } = &self.backing else {
            color_eyre::eyre::bail!("rollback snapshot requires a zfs datadir");
        };
        run_cmd(
            Command::new("zfs")
                .arg("snapshot")
                .arg(format!("{clone}@{ZFS_ROLLBACK_SNAPSHOT}")),
            "zfs snapshot",
        )
        .await?;
        Ok(())
    }

    /// Rolls a ZFS-backed working copy back to the per-test snapshot.
    pub(crate) async fn zfs_rollback(&self) -> Result<()> {
        let Backing::Zfs { clone } = &self.backing else {
            color_eyre::eyre::bail!("rollback requires a zfs datadir");
        };
        run_cmd(
            Command::new("zfs")
                .args(["rollback", "-r"])
                .arg(format!("{clone}@{ZFS_ROLLBACK_SNAPSHOT}")),
            "zfs rollback",
        )
        .await?;
        Ok(())
    }

    /// Tears the working copy down. Failures are logged, not propagated; the
    /// run is already over.
    pub(crate) async fn teardown(self) {
        let result = match self.backing {
            Backing::Copy { root } => fs::remove_dir_all(&root).map_err(Into::into),
            Backing::Overlay { root, merged } => async {
                run_cmd(Command::new("umount").arg(&merged), "overlay umount").await?;
                fs::remove_dir_all(&root)?;
                Ok::<_, color_eyre::Report>(())
            }
            .await,
            Backing::Zfs { clone } => async {
                run_cmd(
                    Command::new("zfs").args(["destroy", "-r"]).arg(&clone),
                    "zfs destroy",
                )
                .await?;
                Ok(())
            }
            .await,
        };
        if let Err(e) = result {
            warn!(target: "datadir", "working dir teardown failed: {e:#}");
        }
    }
}

/// Resolves the ZFS dataset backing a directory.
async fn dataset_for(path: &Path) -> Result<String> {
    run_cmd_stdout(
        Command::new("zfs").args(["list", "-H", "-o", "name"]).arg(path),
        "zfs list",
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copy_method_duplicates_the_source() {
        let source = tempfile::tempdir().unwrap();
        fs::create_dir_all(source.path().join("chaindata")).unwrap();
        fs::write(source.path().join("chaindata/000001.log"), "data").unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let config = DataDirConfig {
            source_dir: source.path().to_path_buf(),
            mount_path: "/data".into(),
            method: DataDirMethod::Copy,
        };
        let workdir = WorkingDir::materialize(&config, tmp.path(), "20260101-000000-abc123")
            .await
            .unwrap();
        assert_eq!(
            fs::read_to_string(workdir.path.join("chaindata/000001.log")).unwrap(),
            "data"
        );

        let copy_root = workdir.path.clone();
        workdir.teardown().await;
        assert!(!copy_root.exists());
    }

    #[tokio::test]
    async fn materialize_rejects_missing_source() {
        let tmp = tempfile::tempdir().unwrap();
        let config = DataDirConfig {
            source_dir: tmp.path().join("nope"),
            mount_path: "/data".into(),
            method: DataDirMethod::Copy,
        };
        assert!(WorkingDir::materialize(&config, tmp.path(), "id").await.is_err());
    }

    #[test]
    fn method_names_are_kebab_case() {
        for (name, method) in [
            ("copy", DataDirMethod::Copy),
            ("overlayfs", DataDirMethod::Overlayfs),
            ("fuse-overlayfs", DataDirMethod::FuseOverlayfs),
            ("zfs", DataDirMethod::Zfs),
        ] {
            let parsed: DataDirMethod = serde_yaml::from_str(&format!("\"{name}\"")).unwrap();
            assert_eq!(parsed, method);
        }
    }
}
