//! Pool Builder
//!
//! Materializes a [`PoolPlan`]: resolves conflicts with an existing pool of
//! the same name, wipes devices when destruction was authorized, creates the
//! pool from the first vdev, adds the rest, applies dataset properties and
//! checks the engine's view of the layout against the plan.

use super::resolver::ResolvedTools;
use super::status::parse_layout;
use super::wipe::{settle_devices, DeviceWiper, WipeReport};
use crate::config::{ExistingPoolPolicy, ProvisionConfig, SettleConfig, TimeoutConfig};
use crate::domain::ports::{CommandRunner, CommandSpec, Confirmer, FixedAnswer, PoolPlan, VdevKind, VdevPlan};
use crate::error::{Error, Result};
use crate::exec::{retry, RetryPolicy};
use serde::Serialize;
use std::cmp::Reverse;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts at a clean export before destroying
const EXPORT_ATTEMPTS: u32 = 3;

// =============================================================================
// Options & Result
// =============================================================================

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub policy: ExistingPoolPolicy,
    /// Alternate root the pool's datasets mount under
    pub altroot: Option<PathBuf>,
    pub timeouts: TimeoutConfig,
    pub settle: SettleConfig,
}

impl BuildOptions {
    pub fn from_config(config: &ProvisionConfig) -> Self {
        Self {
            policy: config.existing_pool,
            altroot: Some(config.target_root.clone()),
            timeouts: config.timeouts.clone(),
            settle: config.settle.clone(),
        }
    }
}

/// A pool that exists and matches its plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuiltPool {
    pub name: String,
    pub layout: Vec<VdevKind>,
    /// An existing pool of the same name was torn down first
    pub replaced: bool,
    /// Devices wiped before creation
    pub wiped: Vec<String>,
}

// =============================================================================
// Pool Builder
// =============================================================================

pub struct PoolBuilder {
    runner: Arc<dyn CommandRunner>,
    tools: ResolvedTools,
    options: BuildOptions,
    confirmer: Arc<dyn Confirmer>,
}

impl PoolBuilder {
    pub fn new(runner: Arc<dyn CommandRunner>, tools: ResolvedTools, options: BuildOptions) -> Self {
        Self {
            runner,
            tools,
            options,
            confirmer: Arc::new(FixedAnswer(false)),
        }
    }

    pub fn with_confirmer(mut self, confirmer: Arc<dyn Confirmer>) -> Self {
        self.confirmer = confirmer;
        self
    }

    /// Build the pool described by `plan`
    pub async fn build(&self, plan: &PoolPlan) -> Result<BuiltPool> {
        let Some((first, rest)) = plan.vdevs.split_first() else {
            return Err(Error::PoolBuildFailed {
                pool: plan.name.clone(),
                reason: "plan has no vdevs".into(),
            });
        };

        let (destructive, replaced) = self.resolve_conflict(&plan.name).await?;

        let mut wiped = Vec::new();
        if destructive {
            for report in self.wipe_devices(&plan.devices()).await {
                if !report.is_clean() {
                    warn!(
                        "Device {} may still carry old metadata ({:?})",
                        report.device, report.failed_steps
                    );
                }
                wiped.push(report.device);
            }
        }

        self.create(plan, first, destructive).await?;

        for vdev in rest {
            if let Err(e) = self.add(plan, first.kind, vdev, destructive).await {
                // A partially redundant pool is worse than none
                self.destroy_partial(&plan.name).await;
                return Err(e);
            }
        }

        self.apply_dataset_properties(plan).await;
        let layout = match self.verify_layout(plan).await {
            Ok(layout) => layout,
            Err(e) => {
                self.destroy_partial(&plan.name).await;
                return Err(e);
            }
        };

        info!("Pool {} built: {}", plan.name, plan);
        Ok(BuiltPool {
            name: plan.name.clone(),
            layout,
            replaced,
            wiped,
        })
    }

    /// Whether a pool with this name is currently imported
    pub async fn pool_exists(&self, pool: &str) -> Result<bool> {
        let spec = CommandSpec::new(&self.tools.zpool)
            .args(["list", "-H", "-o", "name", pool])
            .timeout(self.options.timeouts.command());
        let out = self.runner.run(&spec).await?;
        Ok(out.success() && out.stdout.lines().any(|l| l.trim() == pool))
    }

    /// Export the pool, retrying; returns the last error when it stays busy
    pub async fn export(&self, pool: &str) -> Result<()> {
        let spec = CommandSpec::new(&self.tools.zpool)
            .args(["export", pool])
            .timeout(self.options.timeouts.command());
        let policy = RetryPolicy::fixed(
            EXPORT_ATTEMPTS,
            Duration::from_millis(self.options.settle.export_retry_ms),
        );

        retry("export pool", policy, |_| {
            let spec = spec.clone();
            let runner = self.runner.clone();
            async move { runner.run_checked(&spec).await.map(|_| ()) }
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Conflict Resolution
    // -------------------------------------------------------------------------

    /// Returns (destruction authorized, existing pool replaced)
    async fn resolve_conflict(&self, pool: &str) -> Result<(bool, bool)> {
        let exists = self.pool_exists(pool).await?;
        let policy = self.options.policy;

        match (exists, policy) {
            (false, ExistingPoolPolicy::Force) => Ok((true, false)),
            (false, _) => Ok((false, false)),
            (true, ExistingPoolPolicy::Fail) => Err(Error::PoolExists {
                pool: pool.to_string(),
            }),
            (true, ExistingPoolPolicy::Prompt) => {
                if !self.ask(pool).await? {
                    info!("Operator declined to replace pool {}", pool);
                    return Err(Error::OperatorDeclined {
                        pool: pool.to_string(),
                    });
                }
                self.teardown(pool).await?;
                Ok((true, true))
            }
            (true, ExistingPoolPolicy::Force) => {
                self.teardown(pool).await?;
                Ok((true, true))
            }
        }
    }

    async fn ask(&self, pool: &str) -> Result<bool> {
        let question = format!(
            "Pool {} already exists. Destroy it and wipe its devices?",
            pool
        );
        let confirmer = self.confirmer.clone();
        tokio::task::spawn_blocking(move || confirmer.confirm(&question))
            .await
            .map_err(|e| Error::Internal(format!("confirmation task failed: {}", e)))
    }

    /// Unmount every dataset (deepest first), then export or destroy
    async fn teardown(&self, pool: &str) -> Result<()> {
        warn!("Tearing down existing pool {}", pool);
        let timeout = self.options.timeouts.command();

        let list = CommandSpec::new(&self.tools.zfs)
            .args(["list", "-H", "-o", "name", "-r", pool])
            .timeout(timeout);
        let mut datasets: Vec<String> = match self.runner.run(&list).await {
            Ok(out) if out.success() => out
                .stdout
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect(),
            _ => Vec::new(),
        };
        datasets.sort_by_key(|d| Reverse(d.matches('/').count()));

        for dataset in &datasets {
            let spec = CommandSpec::new(&self.tools.zfs)
                .args(["unmount", "-f", dataset.as_str()])
                .timeout(timeout);
            match self.runner.run(&spec).await {
                Ok(out) if !out.success() => debug!("unmount {}: {}", dataset, out.stderr.trim()),
                Err(e) => warn!("unmount {}: {}", dataset, e),
                Ok(_) => {}
            }
        }

        match self.export(pool).await {
            Ok(()) => {
                info!("Exported existing pool {}", pool);
                Ok(())
            }
            Err(e) => {
                warn!("Export of {} failed ({}); destroying", pool, e);
                let spec = CommandSpec::new(&self.tools.zpool)
                    .args(["destroy", "-f", pool])
                    .timeout(timeout);
                self.runner
                    .run_checked(&spec)
                    .await
                    .map(|_| ())
                    .map_err(|e| Error::PoolBuildFailed {
                        pool: pool.to_string(),
                        reason: format!("cannot remove existing pool: {}", e),
                    })
            }
        }
    }

    async fn wipe_devices(&self, devices: &[String]) -> Vec<WipeReport> {
        let wiper = DeviceWiper::new(
            self.runner.as_ref(),
            &self.tools.zpool,
            self.options.timeouts.wipe(),
        );

        let mut reports = Vec::with_capacity(devices.len());
        for device in devices {
            reports.push(wiper.wipe(device).await);
        }

        settle_devices(
            self.runner.as_ref(),
            self.options.timeouts.command(),
            Duration::from_millis(self.options.settle.wipe_ms),
        )
        .await;
        reports
    }

    // -------------------------------------------------------------------------
    // Creation
    // -------------------------------------------------------------------------

    async fn create(&self, plan: &PoolPlan, first: &VdevPlan, force: bool) -> Result<()> {
        let mut spec = CommandSpec::new(&self.tools.zpool).arg("create");
        if force {
            spec = spec.arg("-f");
        }
        for (key, value) in &plan.properties.pool {
            spec = spec.arg("-o").arg(format!("{}={}", key, value));
        }
        spec = spec.args(["-O", "canmount=off", "-O", "mountpoint=none"]);
        if let Some(root) = &self.options.altroot {
            spec = spec.arg("-R").arg(root.display().to_string());
        }
        let spec = spec
            .arg(&plan.name)
            .args(first.to_args())
            .timeout(self.options.timeouts.command());

        info!("Creating pool {} with {}", plan.name, first);
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Err(Error::PoolBuildFailed {
                pool: plan.name.clone(),
                reason: format!("create with {} failed: {}", first, out.stderr.trim()),
            });
        }
        Ok(())
    }

    async fn add(&self, plan: &PoolPlan, first: VdevKind, vdev: &VdevPlan, force: bool) -> Result<()> {
        let mut spec = CommandSpec::new(&self.tools.zpool).arg("add");
        // Mismatched replication level needs an explicit override
        if force || vdev.kind != first {
            spec = spec.arg("-f");
        }
        let spec = spec
            .arg(&plan.name)
            .args(vdev.to_args())
            .timeout(self.options.timeouts.command());

        debug!("Adding {} to {}", vdev, plan.name);
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Err(Error::PoolBuildFailed {
                pool: plan.name.clone(),
                reason: format!("adding {} failed: {}", vdev, out.stderr.trim()),
            });
        }
        Ok(())
    }

    async fn destroy_partial(&self, pool: &str) {
        let spec = CommandSpec::new(&self.tools.zpool)
            .args(["destroy", "-f", pool])
            .timeout(self.options.timeouts.command());
        match self.runner.run_checked(&spec).await {
            Ok(_) => warn!("Destroyed partially built pool {}", pool),
            Err(e) => warn!("Partially built pool {} left behind: {}", pool, e),
        }
    }

    async fn apply_dataset_properties(&self, plan: &PoolPlan) {
        for (key, value) in &plan.properties.dataset {
            let spec = CommandSpec::new(&self.tools.zfs)
                .arg("set")
                .arg(format!("{}={}", key, value))
                .arg(&plan.name)
                .timeout(self.options.timeouts.command());
            if let Err(e) = self.runner.run_checked(&spec).await {
                warn!("Could not set {}={} on {}: {}", key, value, plan.name, e);
            }
        }
    }

    /// Compare the engine's layout with the plan
    async fn verify_layout(&self, plan: &PoolPlan) -> Result<Vec<VdevKind>> {
        let spec = CommandSpec::new(&self.tools.zpool)
            .args(["status", "-P", plan.name.as_str()])
            .timeout(self.options.timeouts.command());

        let reported = match self.runner.run(&spec).await {
            Ok(out) if out.success() => parse_layout(&out.stdout, &plan.name),
            Ok(out) => {
                warn!("Cannot read status of {}: {}", plan.name, out.stderr.trim());
                Vec::new()
            }
            Err(e) => {
                warn!("Cannot read status of {}: {}", plan.name, e);
                Vec::new()
            }
        };

        let planned = plan.layout();
        if reported.is_empty() {
            warn!("Layout of {} not verified", plan.name);
            return Ok(planned);
        }
        if reported != planned {
            return Err(Error::PoolBuildFailed {
                pool: plan.name.clone(),
                reason: format!(
                    "layout mismatch: planned {:?}, engine reports {:?}",
                    planned, reported
                ),
            });
        }
        Ok(reported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{CommandOutput, PoolProperties};
    use crate::exec::testing::ScriptedRunner;
    use crate::storage::resolver::Resolution;
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;

    fn plan() -> PoolPlan {
        let mut pool = BTreeMap::new();
        pool.insert("ashift".to_string(), "12".to_string());
        let mut dataset = BTreeMap::new();
        dataset.insert("compression".to_string(), "lz4".to_string());

        PoolPlan {
            name: "rpool".into(),
            vdevs: vec![
                VdevPlan::mirror("/dev/sda", "/dev/sdb"),
                VdevPlan::single("/dev/sdc"),
            ],
            properties: PoolProperties { pool, dataset },
        }
    }

    /// Status text the engine would print for `plan`
    fn status_for(plan: &PoolPlan) -> String {
        let mut out = format!("  pool: {}\n state: ONLINE\nconfig:\n\n\tNAME STATE\n\t{} ONLINE\n", plan.name, plan.name);
        for (i, vdev) in plan.vdevs.iter().enumerate() {
            match vdev.kind {
                VdevKind::Mirror => {
                    out.push_str(&format!("\t  mirror-{} ONLINE\n", i));
                    for m in &vdev.members {
                        out.push_str(&format!("\t    {}1 ONLINE\n", m));
                    }
                }
                VdevKind::Single => out.push_str(&format!("\t  {}1 ONLINE\n", vdev.members[0])),
            }
        }
        out.push_str("\nerrors: No known data errors\n");
        out
    }

    fn builder(runner: &Arc<ScriptedRunner>, policy: ExistingPoolPolicy) -> PoolBuilder {
        PoolBuilder::new(
            runner.clone(),
            ResolvedTools::on_path(Resolution::AlreadyLoaded),
            BuildOptions {
                policy,
                altroot: Some(PathBuf::from("/mnt")),
                timeouts: TimeoutConfig::default(),
                settle: SettleConfig::immediate(),
            },
        )
    }

    fn scripted(plan: &PoolPlan) -> Arc<ScriptedRunner> {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("zpool status", CommandOutput::ok(status_for(plan)));
        runner
    }

    #[tokio::test]
    async fn test_fresh_build() {
        let plan = plan();
        let runner = scripted(&plan);

        let built = builder(&runner, ExistingPoolPolicy::Fail)
            .build(&plan)
            .await
            .unwrap();

        assert_eq!(built.layout, vec![VdevKind::Mirror, VdevKind::Single]);
        assert!(!built.replaced);
        assert!(built.wiped.is_empty());

        let calls = runner.calls();
        let create = calls.iter().find(|c| c.starts_with("zpool create")).unwrap();
        assert!(create.contains("-o ashift=12"));
        assert!(create.contains("-R /mnt"));
        assert!(create.ends_with("rpool mirror /dev/sda /dev/sdb"));
        assert!(!create.contains(" -f "));

        // Single after mirror needs the replication override
        assert!(calls.contains(&"zpool add -f rpool /dev/sdc".to_string()));
        assert_eq!(runner.count("zfs set compression=lz4 rpool"), 1);
        assert_eq!(runner.count("wipefs"), 0);
    }

    #[tokio::test]
    async fn test_existing_pool_fails_by_default() {
        let plan = plan();
        let runner = scripted(&plan);
        runner.on("zpool list", CommandOutput::ok("rpool\n"));

        let err = builder(&runner, ExistingPoolPolicy::Fail)
            .build(&plan)
            .await
            .unwrap_err();

        assert_matches!(err, Error::PoolExists { ref pool } if pool == "rpool");
        assert_eq!(runner.count("zpool create"), 0);
    }

    #[tokio::test]
    async fn test_prompt_declined_touches_nothing() {
        let plan = plan();
        let runner = scripted(&plan);
        runner.on("zpool list", CommandOutput::ok("rpool\n"));

        let err = builder(&runner, ExistingPoolPolicy::Prompt)
            .with_confirmer(Arc::new(FixedAnswer(false)))
            .build(&plan)
            .await
            .unwrap_err();

        assert_matches!(err, Error::OperatorDeclined { .. });
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_prompt_confirmed_rebuilds() {
        let plan = plan();
        let runner = scripted(&plan);
        runner.on("zpool list", CommandOutput::ok("rpool\n"));
        runner.on("zfs list", CommandOutput::ok("rpool\nrpool/ROOT\nrpool/ROOT/debian\n"));

        let built = builder(&runner, ExistingPoolPolicy::Prompt)
            .with_confirmer(Arc::new(FixedAnswer(true)))
            .build(&plan)
            .await
            .unwrap();

        assert!(built.replaced);
        assert_eq!(built.wiped, vec!["/dev/sda", "/dev/sdb", "/dev/sdc"]);

        // Deepest dataset unmounted first, export before wipe before create
        let first_unmount = runner.position("zfs unmount").unwrap();
        assert_eq!(runner.calls()[first_unmount], "zfs unmount -f rpool/ROOT/debian");
        assert!(runner.position("zpool export").unwrap() < runner.position("wipefs").unwrap());
        assert!(runner.position("udevadm settle").unwrap() < runner.position("zpool create").unwrap());
        assert_eq!(runner.count("zpool create -f"), 1);
    }

    #[tokio::test]
    async fn test_export_failure_falls_back_to_destroy() {
        let plan = plan();
        let runner = scripted(&plan);
        runner.on("zpool list", CommandOutput::ok("rpool\n"));
        runner.fail("zpool export");

        builder(&runner, ExistingPoolPolicy::Force)
            .build(&plan)
            .await
            .unwrap();

        assert_eq!(runner.count("zpool export"), EXPORT_ATTEMPTS as usize);
        assert_eq!(runner.count("zpool destroy -f rpool"), 1);
    }

    #[tokio::test]
    async fn test_add_failure_destroys_partial_pool() {
        let plan = plan();
        let runner = scripted(&plan);
        runner.fail("zpool add");

        let err = builder(&runner, ExistingPoolPolicy::Fail)
            .build(&plan)
            .await
            .unwrap_err();

        assert_matches!(err, Error::PoolBuildFailed { ref reason, .. } if reason.contains("/dev/sdc"));
        assert_eq!(runner.count("zpool destroy -f rpool"), 1);
    }

    #[tokio::test]
    async fn test_create_failure() {
        let plan = plan();
        let runner = scripted(&plan);
        runner.on("zpool create", CommandOutput::failed(1, "/dev/sda is in use"));

        let err = builder(&runner, ExistingPoolPolicy::Fail)
            .build(&plan)
            .await
            .unwrap_err();

        assert_matches!(err, Error::PoolBuildFailed { ref reason, .. } if reason.contains("in use"));
        assert_eq!(runner.count("zpool add"), 0);
    }

    #[tokio::test]
    async fn test_layout_mismatch() {
        let plan = plan();
        let runner = Arc::new(ScriptedRunner::new());
        let wrong = PoolPlan {
            vdevs: vec![VdevPlan::single("/dev/sda"), VdevPlan::single("/dev/sdb")],
            ..plan.clone()
        };
        runner.on("zpool status", CommandOutput::ok(status_for(&wrong)));

        let err = builder(&runner, ExistingPoolPolicy::Fail)
            .build(&plan)
            .await
            .unwrap_err();

        assert_matches!(err, Error::PoolBuildFailed { ref reason, .. } if reason.contains("mismatch"));
        assert_eq!(runner.count("zpool destroy -f rpool"), 1);
    }

    #[tokio::test]
    async fn test_property_failure_only_warns() {
        let plan = plan();
        let runner = scripted(&plan);
        runner.fail("zfs set");

        assert!(builder(&runner, ExistingPoolPolicy::Fail)
            .build(&plan)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_force_rebuild_is_repeatable() {
        let plan = plan();
        let runner = scripted(&plan);
        let builder = builder(&runner, ExistingPoolPolicy::Force);

        let first = builder.build(&plan).await.unwrap();

        runner.on("zpool list", CommandOutput::ok("rpool\n"));
        let second = builder.build(&plan).await.unwrap();

        assert_eq!(first.layout, second.layout);
        assert!(!first.replaced);
        assert!(second.replaced);
        assert_eq!(runner.count("zpool create -f"), 2);
    }

    #[tokio::test]
    async fn test_empty_plan() {
        let plan = PoolPlan {
            vdevs: Vec::new(),
            ..plan()
        };
        let runner = Arc::new(ScriptedRunner::new());

        let err = builder(&runner, ExistingPoolPolicy::Force)
            .build(&plan)
            .await
            .unwrap_err();
        assert_matches!(err, Error::PoolBuildFailed { .. });
        assert!(runner.calls().is_empty());
    }
}
