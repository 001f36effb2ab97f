//! Provisioning Context
//!
//! Everything a phase needs, passed explicitly: configuration, the command
//! runner, the mount registry, the operator confirmation port and the run's
//! tracing span.

use crate::config::ProvisionConfig;
use crate::domain::ports::{CommandRunner, Confirmer};
use crate::exec::SystemRunner;
use crate::lifecycle::{HolderControl, MountManager, ProcHolders};
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info_span, Span};

pub struct ProvisionContext {
    pub config: Arc<ProvisionConfig>,
    pub runner: Arc<dyn CommandRunner>,
    pub mounts: Arc<MountManager>,
    pub confirmer: Arc<dyn Confirmer>,
    pub span: Span,
}

impl ProvisionContext {
    pub fn new(
        config: ProvisionConfig,
        runner: Arc<dyn CommandRunner>,
        holders: Arc<dyn HolderControl>,
        confirmer: Arc<dyn Confirmer>,
    ) -> Self {
        let mounts = Arc::new(MountManager::new(
            runner.clone(),
            holders,
            config.timeouts.command(),
            Duration::from_millis(config.settle.release_initial_ms),
        ));
        let span = info_span!("provision", pool = %config.pool_name);

        Self {
            config: Arc::new(config),
            runner,
            mounts,
            confirmer,
            span,
        }
    }

    /// Context driving the real host
    pub fn system(config: ProvisionConfig) -> Self {
        Self::new(
            config,
            Arc::new(SystemRunner::new()),
            Arc::new(ProcHolders),
            Arc::new(StdinConfirmer),
        )
    }
}

/// Asks the operator on the terminal
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinConfirmer;

impl Confirmer for StdinConfirmer {
    fn confirm(&self, question: &str) -> bool {
        eprint!("{} [y/N] ", question);
        if std::io::stderr().flush().is_err() {
            return false;
        }

        let mut answer = String::new();
        match std::io::stdin().lock().read_line(&mut answer) {
            Ok(_) => is_yes(&answer),
            Err(_) => false,
        }
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
