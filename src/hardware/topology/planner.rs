//! Topology Planner
//!
//! Buckets devices by exact capacity and derives a redundancy-aware layout
//! for a single pool. Pairing follows discovery order only, so the same
//! inventory always yields the same plan.

use super::policy::PlannerPolicy;
use crate::domain::ports::{CapacityGroup, Device, PoolPlan, VdevPlan};
use crate::error::{Error, Result};
use indexmap::IndexMap;
use tracing::{debug, info, warn};

/// Capacities closer than this fraction are reported as likely the same
/// nominal size (1% = 1/100)
const NEAR_EQUAL_DIVISOR: u64 = 100;

// =============================================================================
// Topology Planner
// =============================================================================

/// Derives a pool plan from a device inventory
pub struct TopologyPlanner;

impl TopologyPlanner {
    /// Group devices by exact byte capacity, in first-seen order
    pub fn group_by_capacity(devices: &[Device]) -> Vec<CapacityGroup> {
        let mut by_capacity: IndexMap<u64, Vec<Device>> = IndexMap::new();
        for device in devices {
            by_capacity
                .entry(device.capacity_bytes)
                .or_default()
                .push(device.clone());
        }

        by_capacity
            .into_iter()
            .map(|(capacity_bytes, devices)| CapacityGroup {
                capacity_bytes,
                devices,
            })
            .collect()
    }

    /// Plan one pool from the eligible devices
    pub fn plan(devices: &[Device], policy: &PlannerPolicy) -> Result<PoolPlan> {
        let eligible: Vec<Device> = devices.iter().filter(|d| !d.excluded).cloned().collect();

        if eligible.is_empty() {
            return Err(Error::NoEligibleDevices {
                scanned: devices.len(),
                excluded: devices.iter().filter(|d| d.excluded).count(),
            });
        }

        let groups = Self::group_by_capacity(&eligible);
        Self::report_near_equal(&groups);

        let mut vdevs = Vec::new();
        for group in &groups {
            let planned = Self::plan_group(group, policy);
            debug!(
                "Capacity group {} bytes: {} devices -> {} vdevs",
                group.capacity_bytes,
                group.devices.len(),
                planned.len()
            );
            vdevs.extend(planned);
        }

        let plan = PoolPlan {
            name: policy.pool_name.clone(),
            vdevs,
            properties: policy.properties(),
        };

        info!("Planned pool {}", plan);

        if plan.is_mixed_redundancy() {
            warn!(
                "Pool {} mixes mirrored and single-device vdevs; a single device failure can lose the pool",
                plan.name
            );
        }

        Ok(plan)
    }

    /// Turn one capacity group into vdevs
    fn plan_group(group: &CapacityGroup, policy: &PlannerPolicy) -> Vec<VdevPlan> {
        if !policy.mirrors(group.capacity_bytes) {
            return group
                .devices
                .iter()
                .map(|d| VdevPlan::single(d.path.clone()))
                .collect();
        }

        group
            .devices
            .chunks(2)
            .map(|pair| match pair {
                [a, b] => VdevPlan::mirror(a.path.clone(), b.path.clone()),
                // Leftover odd device
                _ => VdevPlan::single(pair[0].path.clone()),
            })
            .collect()
    }

    /// Log groups that are probably the same nominal size
    fn report_near_equal(groups: &[CapacityGroup]) {
        let mut capacities: Vec<u64> = groups.iter().map(|g| g.capacity_bytes).collect();
        capacities.sort_unstable();

        for pair in capacities.windows(2) {
            let (small, large) = (pair[0], pair[1]);
            if large - small < large / NEAR_EQUAL_DIVISOR {
                warn!(
                    "Capacity groups {} and {} bytes differ by {} bytes; they are not paired",
                    small,
                    large,
                    large - small
                );
            }
        }
    }
}
