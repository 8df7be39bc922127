//! Cross-field configuration validation.
//!
//! Runs once at startup, before any side effects. Everything here is a
//! config-time error: the run must not start with a setup that can only
//! fail later.

use super::{Config, ContainerRuntime, RollbackStrategyKind};
use crate::{
    datadir::DataDirMethod,
    registry::CLIENT_REGISTRY,
    resources::{CacheDropper, DropMemoryCaches},
    util::parse_size,
};
use color_eyre::{eyre::ensure, Result};
use std::collections::HashSet;

/// Validates the full configuration record.
pub(crate) fn validate(config: &Config) -> Result<()> {
    let runner = &config.runner;

    ensure!(
        !runner.benchmark.results_dir.as_os_str().is_empty(),
        "runner.benchmark.results_dir must be set"
    );
    ensure!(
        runner.benchmark.tests.source.configured() == 1,
        "runner.benchmark.tests.source must configure exactly one of git, local, eest_fixtures"
    );
    if let Some(fixtures) = &runner.benchmark.tests.source.eest_fixtures {
        ensure!(
            fixtures.configured() == 1,
            "eest_fixtures must configure exactly one of release, ci_run_id, local_tarball, local_dir"
        );
    }

    let mut seen_ids = HashSet::new();
    for instance in &runner.instances {
        ensure!(!instance.id.is_empty(), "instance with empty id");
        ensure!(
            seen_ids.insert(instance.id.as_str()),
            "duplicate instance id: {}",
            instance.id
        );
        ensure!(
            !instance.image.is_empty(),
            "instance {}: image must be set",
            instance.id
        );
    }

    for instance in config.enabled_instances() {
        let id = &instance.id;

        // The secret is required and must decode; surface that now.
        instance.jwt_secret()?;

        if let Some(limits) = &instance.client.resource_limits {
            limits
                .validate()
                .map_err(|e| e.wrap_err(format!("instance {id}: invalid resource_limits")))?;
        }

        if let Some(datadir) = &instance.datadir {
            ensure!(
                datadir.source_dir.is_dir(),
                "instance {id}: datadir source {} does not exist",
                datadir.source_dir.display()
            );
            ensure!(
                !datadir.mount_path.as_os_str().is_empty(),
                "instance {id}: datadir mount_path must be set"
            );
        }

        if instance.drop_memory_caches() != DropMemoryCaches::None {
            CacheDropper::new(&runner.drop_caches_path)
                .map_err(|e| e.wrap_err(format!("instance {id}: drop_memory_caches enabled")))?;
        }

        if instance.rollback_strategy() == RollbackStrategyKind::RpcDebugSetHead {
            ensure!(
                CLIENT_REGISTRY.get(instance.family).reset_method.is_some(),
                "instance {id}: client {} has no head-reset RPC for rpc-debug-setHead",
                instance.family
            );
        }

        if instance.rollback_strategy() == RollbackStrategyKind::ContainerCheckpointRestore {
            ensure!(
                runner.container_runtime == ContainerRuntime::Podman,
                "instance {id}: container-checkpoint-restore requires container_runtime=podman"
            );
            if let Some(datadir) = &instance.datadir {
                ensure!(
                    datadir.method == DataDirMethod::Zfs,
                    "instance {id}: container-checkpoint-restore requires datadir.method=zfs"
                );
            }
            if let Some(options) = &instance.client.checkpoint_restore_strategy_options {
                if let Some(threshold) = &options.tmpfs_threshold {
                    parse_size(threshold)?;
                }
                if let Some(max_size) = &options.tmpfs_max_size {
                    parse_size(max_size)?;
                }
            }
        }

        if let Some(bootstrap) = &instance.client.bootstrap_fcu {
            let hash = &bootstrap.head_block_hash;
            ensure!(
                hash.starts_with("0x")
                    && hash.len() == 66
                    && hash[2..].chars().all(|c| c.is_ascii_hexdigit()),
                "instance {id}: bootstrap_fcu.head_block_hash must be a 0x-prefixed 32-byte hex string"
            );
        }

        if let Some(retry) = &instance.client.retry_new_payloads_syncing_state {
            if retry.enabled {
                ensure!(
                    retry.max_retries > 0,
                    "instance {id}: retry_new_payloads_syncing_state.max_retries must be > 0"
                );
            }
        }

        for call in instance.client.post_test_rpc_calls.iter().flatten() {
            ensure!(
                !call.method.is_empty(),
                "instance {id}: post-test RPC call without a method"
            );
            if let Some(dump) = &call.dump {
                ensure!(
                    !dump.filename.is_empty() && !dump.filename.contains('/'),
                    "instance {id}: post-test dump filename must be a bare file name"
                );
            }
        }
    }

    Ok(())
}
