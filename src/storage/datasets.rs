//! Dataset Layout
//!
//! The boot-environment hierarchy created on a fresh pool:
//!
//! ```text
//! <pool>/ROOT          canmount=off, mountpoint=none
//! <pool>/ROOT/<name>   canmount=noauto, mountpoint=/
//! <pool>/home          mountpoint=/home
//! ```
//!
//! Datasets are created unmounted; mounting goes through the lifecycle
//! manager so every mount has a release path.

use crate::config::ProvisionConfig;
use crate::domain::ports::{CommandRunner, CommandSpec};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// One dataset to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSpec {
    pub name: String,
    pub properties: Vec<(String, String)>,
    /// Mountpoint inside the target root, for datasets that get mounted
    pub mountpoint: Option<String>,
}

impl DatasetSpec {
    fn new(name: String) -> Self {
        Self {
            name,
            properties: Vec::new(),
            mountpoint: None,
        }
    }

    fn property(mut self, key: &str, value: &str) -> Self {
        self.properties.push((key.to_string(), value.to_string()));
        self
    }

    fn mounted_at(mut self, mountpoint: &str) -> Self {
        self.mountpoint = Some(mountpoint.to_string());
        self.property("mountpoint", mountpoint)
    }

    /// Where this dataset appears under `root`
    pub fn target(&self, root: &Path) -> Option<PathBuf> {
        self.mountpoint.as_deref().map(|m| match m.trim_start_matches('/') {
            "" => root.to_path_buf(),
            relative => root.join(relative),
        })
    }
}

#[derive(Debug, Clone)]
pub struct DatasetLayout {
    pub pool: String,
    pub root_name: String,
}

impl DatasetLayout {
    pub fn from_config(config: &ProvisionConfig) -> Self {
        Self {
            pool: config.pool_name.clone(),
            root_name: config.root_dataset.clone(),
        }
    }

    /// `<pool>/ROOT/<name>`
    pub fn root_dataset(&self) -> String {
        format!("{}/ROOT/{}", self.pool, self.root_name)
    }

    /// Container plus OS root, created and mounted before anything else
    pub fn boot_environment(&self) -> Vec<DatasetSpec> {
        vec![
            DatasetSpec::new(format!("{}/ROOT", self.pool))
                .property("canmount", "off")
                .property("mountpoint", "none"),
            DatasetSpec::new(self.root_dataset())
                .property("canmount", "noauto")
                .mounted_at("/"),
        ]
    }

    /// Datasets mounted beneath the OS root
    pub fn children(&self) -> Vec<DatasetSpec> {
        vec![DatasetSpec::new(format!("{}/home", self.pool)).mounted_at("/home")]
    }

    /// Create `specs` in order, unmounted
    pub async fn create(
        &self,
        runner: &dyn CommandRunner,
        zfs: &str,
        specs: &[DatasetSpec],
        timeout: Duration,
    ) -> Result<()> {
        for spec in specs {
            let mut cmd = CommandSpec::new(zfs).args(["create", "-u"]);
            for (key, value) in &spec.properties {
                cmd = cmd.arg("-o").arg(format!("{}={}", key, value));
            }
            let cmd = cmd.arg(&spec.name).timeout(timeout);

            runner
                .run_checked(&cmd)
                .await
                .map_err(|e| Error::PoolBuildFailed {
                    pool: self.pool.clone(),
                    reason: format!("cannot create {}: {}", spec.name, e),
                })?;
            debug!("Created dataset {}", spec.name);
        }
        Ok(())
    }

    /// Point the pool's boot filesystem at the OS root
    pub async fn set_bootfs(&self, runner: &dyn CommandRunner, zpool: &str, timeout: Duration) -> Result<()> {
        let cmd = CommandSpec::new(zpool)
            .arg("set")
            .arg(format!("bootfs={}", self.root_dataset()))
            .arg(&self.pool)
            .timeout(timeout);
        runner
            .run_checked(&cmd)
            .await
            .map_err(|e| Error::PoolBuildFailed {
                pool: self.pool.clone(),
                reason: format!("cannot set bootfs: {}", e),
            })?;
        info!("Boot filesystem of {} is {}", self.pool, self.root_dataset());
        Ok(())
    }
}
