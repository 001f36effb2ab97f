//! Planning Policy
//!
//! Defines how discovered devices are turned into vdevs and which
//! properties the resulting pool carries.

use crate::config::ProvisionConfig;
use crate::domain::ports::PoolProperties;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Block alignment hint (2^12 = 4K sectors)
pub const ASHIFT: &str = "12";

/// Feature set a GRUB-readable pool must stay within
pub const BOOT_COMPATIBILITY: &str = "grub2";

// =============================================================================
// Planner Policy
// =============================================================================

/// Complete planning policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerPolicy {
    /// Pool to assign every vdev to
    pub pool_name: String,

    /// Capacity groups at or above this size are mirrored
    pub mirror_threshold_bytes: u64,

    /// Pair equal-capacity devices into mirrors
    pub auto_mirror: bool,

    /// Options passed at pool creation
    pub pool_properties: BTreeMap<String, String>,

    /// Options applied after creation
    pub dataset_properties: BTreeMap<String, String>,
}

impl Default for PlannerPolicy {
    fn default() -> Self {
        Self::from_config(&ProvisionConfig::default())
    }
}

impl PlannerPolicy {
    /// Derive the policy from the run configuration
    pub fn from_config(config: &ProvisionConfig) -> Self {
        let mut pool_properties = BTreeMap::new();
        pool_properties.insert("ashift".to_string(), ASHIFT.to_string());
        pool_properties.insert("compatibility".to_string(), BOOT_COMPATIBILITY.to_string());

        let mut dataset_properties = BTreeMap::new();
        dataset_properties.insert("compression".to_string(), config.compression.clone());
        for (key, value) in config.atime.properties() {
            dataset_properties.insert(key.to_string(), value.to_string());
        }

        Self {
            pool_name: config.pool_name.clone(),
            mirror_threshold_bytes: config.mirror_threshold_bytes,
            auto_mirror: config.auto_mirror,
            pool_properties,
            dataset_properties,
        }
    }

    /// Whether a capacity group of this size gets mirrored
    pub fn mirrors(&self, capacity_bytes: u64) -> bool {
        self.auto_mirror && capacity_bytes >= self.mirror_threshold_bytes
    }

    pub fn properties(&self) -> PoolProperties {
        PoolProperties {
            pool: self.pool_properties.clone(),
            dataset: self.dataset_properties.clone(),
        }
    }
}
