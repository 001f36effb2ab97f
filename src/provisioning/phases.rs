//! Installation phases and run state
//!
//! Phases run strictly in order. Prepare and Storage are fatal: failure
//! stops the run and later phases stay pending. Populate, Bootloader and
//! Finalize degrade: failure is recorded and the run continues. Degradation
//! is sticky for the whole run.

use crate::boot::BootReport;
use crate::domain::ports::{Device, FirmwareKind, PoolPlan};
use crate::error::{Error, Severity};
use crate::storage::{BuiltPool, ResolvedTools};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Exit code of a clean run
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code when the run completed with degradations
pub const EXIT_DEGRADED: i32 = 1;
/// Exit code when a fatal phase failed
pub const EXIT_FATAL: i32 = 2;

// =============================================================================
// Phase Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseName {
    Prepare,
    Storage,
    Populate,
    Bootloader,
    Finalize,
}

impl PhaseName {
    pub const ALL: [PhaseName; 5] = [
        PhaseName::Prepare,
        PhaseName::Storage,
        PhaseName::Populate,
        PhaseName::Bootloader,
        PhaseName::Finalize,
    ];

    pub fn criticality(&self) -> Criticality {
        match self {
            PhaseName::Prepare | PhaseName::Storage => Criticality::Fatal,
            PhaseName::Populate | PhaseName::Bootloader | PhaseName::Finalize => {
                Criticality::Degradable
            }
        }
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PhaseName::Prepare => "prepare",
            PhaseName::Storage => "storage",
            PhaseName::Populate => "populate",
            PhaseName::Bootloader => "bootloader",
            PhaseName::Finalize => "finalize",
        };
        f.pad(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Criticality {
    Fatal,
    Degradable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Pending,
    Running,
    Succeeded,
    Degraded,
    Failed,
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Succeeded => "succeeded",
            PhaseStatus::Degraded => "degraded",
            PhaseStatus::Failed => "failed",
        };
        f.pad(status)
    }
}

/// What a phase body reports when it returns normally
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    Succeeded,
    Degraded(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct Phase {
    pub name: PhaseName,
    pub status: PhaseStatus,
    pub detail: Option<String>,
    /// Classification of the error that ended the phase
    pub severity: Option<Severity>,
    pub remediation: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Phase {
    fn new(name: PhaseName) -> Self {
        Self {
            name,
            status: PhaseStatus::Pending,
            detail: None,
            severity: None,
            remediation: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Why the run stopped
#[derive(Debug, Clone, Serialize)]
pub struct FatalReport {
    pub phase: PhaseName,
    pub error: String,
    pub remediation: String,
}

/// Values produced by phases and consumed by later ones
#[derive(Debug, Clone, Default, Serialize)]
pub struct Artifacts {
    pub tools: Option<ResolvedTools>,
    pub firmware: Option<FirmwareKind>,
    pub devices: Vec<Device>,
    pub plan: Option<PoolPlan>,
    pub pool: Option<BuiltPool>,
    /// Pool was imported from an earlier installation
    pub imported: bool,
    /// Target root holds an OS and is prepared for chroot use
    pub root_ready: bool,
    pub boot: Option<BootReport>,
    /// Mounts still busy after teardown
    pub busy_mounts: usize,
}

// =============================================================================
// Installation State
// =============================================================================

/// The run's phases, sticky degraded flag and shared artifacts
#[derive(Debug, Clone, Serialize)]
pub struct InstallationState {
    pub phases: Vec<Phase>,
    overall_degraded: bool,
    pub fatal: Option<FatalReport>,
    pub artifacts: Artifacts,
}

impl Default for InstallationState {
    fn default() -> Self {
        Self::new()
    }
}

impl InstallationState {
    pub fn new() -> Self {
        Self {
            phases: PhaseName::ALL.iter().map(|&n| Phase::new(n)).collect(),
            overall_degraded: false,
            fatal: None,
            artifacts: Artifacts::default(),
        }
    }

    pub fn phase(&self, name: PhaseName) -> &Phase {
        &self.phases[name as usize]
    }

    pub fn status(&self, name: PhaseName) -> PhaseStatus {
        self.phase(name).status
    }

    pub fn succeeded(&self, name: PhaseName) -> bool {
        self.status(name) == PhaseStatus::Succeeded
    }

    pub(crate) fn start(&mut self, name: PhaseName) {
        let phase = &mut self.phases[name as usize];
        phase.status = PhaseStatus::Running;
        phase.started_at = Some(Utc::now());
    }

    pub(crate) fn finish(&mut self, name: PhaseName, status: PhaseStatus, detail: Option<String>) {
        let phase = &mut self.phases[name as usize];
        phase.status = status;
        phase.detail = detail;
        phase.finished_at = Some(Utc::now());
        if status == PhaseStatus::Degraded {
            self.overall_degraded = true;
        }
    }

    /// A degradable phase returned an error
    pub(crate) fn degrade(&mut self, name: PhaseName, error: &Error) {
        self.finish(name, PhaseStatus::Degraded, Some(error.to_string()));
        let phase = &mut self.phases[name as usize];
        phase.severity = Some(error.severity());
        phase.remediation = Some(error.remediation().to_string());
    }

    pub(crate) fn abort(&mut self, name: PhaseName, error: &Error) {
        self.finish(name, PhaseStatus::Failed, Some(error.to_string()));
        let phase = &mut self.phases[name as usize];
        phase.severity = Some(Severity::Fatal);
        phase.remediation = Some(error.remediation().to_string());
        self.fatal = Some(FatalReport {
            phase: name,
            error: error.to_string(),
            remediation: error.remediation().to_string(),
        });
    }

    pub fn overall_degraded(&self) -> bool {
        self.overall_degraded
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }

    /// A degradation left the installed system's bootability in doubt
    pub fn needs_manual_verification(&self) -> bool {
        self.phases
            .iter()
            .any(|p| p.severity == Some(Severity::Degraded))
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_fatal() {
            EXIT_FATAL
        } else if self.overall_degraded {
            EXIT_DEGRADED
        } else {
            EXIT_SUCCESS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = InstallationState::new();
        assert_eq!(state.phases.len(), 5);
        assert!(state
            .phases
            .iter()
            .all(|p| p.status == PhaseStatus::Pending));
        assert_eq!(state.exit_code(), EXIT_SUCCESS);
    }

    #[test]
    fn test_criticality() {
        assert_eq!(PhaseName::Prepare.criticality(), Criticality::Fatal);
        assert_eq!(PhaseName::Storage.criticality(), Criticality::Fatal);
        assert_eq!(PhaseName::Populate.criticality(), Criticality::Degradable);
        assert_eq!(PhaseName::Bootloader.criticality(), Criticality::Degradable);
        assert_eq!(PhaseName::Finalize.criticality(), Criticality::Degradable);
    }

    #[test]
    fn test_degraded_is_sticky() {
        let mut state = InstallationState::new();
        state.start(PhaseName::Populate);
        state.finish(PhaseName::Populate, PhaseStatus::Degraded, Some("mirror down".into()));
        state.start(PhaseName::Bootloader);
        state.finish(PhaseName::Bootloader, PhaseStatus::Succeeded, None);

        assert!(state.overall_degraded());
        assert_eq!(state.exit_code(), EXIT_DEGRADED);
        assert!(state.phase(PhaseName::Populate).finished_at.is_some());
    }

    #[test]
    fn test_degrade_classifies_error() {
        let mut state = InstallationState::new();
        state.start(PhaseName::Finalize);
        state.degrade(
            PhaseName::Finalize,
            &Error::ResourceBusy {
                target: "/mnt/proc".into(),
            },
        );
        assert_eq!(state.exit_code(), EXIT_DEGRADED);
        assert_eq!(
            state.phase(PhaseName::Finalize).severity,
            Some(Severity::Recoverable)
        );
        assert!(!state.needs_manual_verification());

        state.start(PhaseName::Bootloader);
        state.degrade(
            PhaseName::Bootloader,
            &Error::BootloaderPartial {
                succeeded: 1,
                total: 2,
            },
        );
        let phase = state.phase(PhaseName::Bootloader);
        assert_eq!(phase.status, PhaseStatus::Degraded);
        assert!(phase.remediation.as_deref().unwrap().contains("repair-boot"));
        assert!(state.needs_manual_verification());
    }

    #[test]
    fn test_abort_records_remediation() {
        let mut state = InstallationState::new();
        state.start(PhaseName::Storage);
        state.abort(
            PhaseName::Storage,
            &Error::PoolExists {
                pool: "rpool".into(),
            },
        );

        assert_eq!(state.status(PhaseName::Storage), PhaseStatus::Failed);
        assert_eq!(state.exit_code(), EXIT_FATAL);
        let fatal = state.fatal.as_ref().unwrap();
        assert_eq!(fatal.phase, PhaseName::Storage);
        assert!(!fatal.remediation.is_empty());
    }

    #[test]
    fn test_state_serializes() {
        let state = InstallationState::new();
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["phases"][0]["name"], "prepare");
        assert_eq!(json["phases"][0]["status"], "pending");
        assert_eq!(json["overall_degraded"], false);
    }
}
