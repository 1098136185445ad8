use log::warn;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
#[error("Failed to install interrupt handler: {0}")]
pub struct CancelInstallError(#[from] ctrlc::Error);

/// Shared flag flipped when the operator asks the orchestrator to stop.
///
/// Clones observe the same flag. The supervisor polls it while a child is
/// running; the campaign and triage loops check it between units of work.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token wired to SIGINT/SIGTERM. Only one handler may be
    /// installed per process.
    pub fn install_interrupt_handler() -> Result<Self, CancelInstallError> {
        let token = Self::new();
        let handler_token = token.clone();
        ctrlc::set_handler(move || {
            warn!("Received interrupt, stopping after the current process is terminated..");
            handler_token.cancel();
        })?;
        Ok(token)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
