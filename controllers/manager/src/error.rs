//! Manager-specific error types.
//!
//! Every variant here is fatal: the process logs the failing component and
//! exits non-zero. Per-object reconciliation errors are not part of this
//! taxonomy; they are handed back to the controller's requeue policy.

use thiserror::Error;

/// Fatal errors raised by the orchestration core.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Failure before the run loop starts (cluster unreachable, metrics
    /// address unbindable). Never retried.
    #[error("manager construction failed ({step}): {reason}")]
    Construction {
        /// The construction step that failed
        step: &'static str,
        /// Underlying cause
        reason: String,
    },

    /// Failure while wiring a reconciler or webhook. No partial startup is
    /// permitted, the first failure aborts the process.
    #[error("failed to register {name}: {reason}")]
    Registration {
        /// Name of the controller or webhook that failed to register
        name: String,
        /// Underlying cause
        reason: String,
    },

    /// Debug server failure. Introspection availability is a required
    /// operational guarantee, so this is fatal for the whole process.
    #[error("debug server failed: {0}")]
    Sidecar(String),

    /// Unrecoverable error during the blocking run loop.
    #[error("run loop failed: {0}")]
    Run(String),
}

impl ManagerError {
    /// Construction error helper.
    pub fn construction(step: &'static str, reason: impl ToString) -> Self {
        Self::Construction {
            step,
            reason: reason.to_string(),
        }
    }

    /// Registration error helper.
    pub fn registration(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Registration {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_error_names_the_component() {
        let err = ManagerError::registration("MetalMachine", "CRD not served");
        let msg = err.to_string();
        assert!(msg.contains("MetalMachine"));
        assert!(msg.contains("CRD not served"));
    }

    #[test]
    fn construction_error_names_the_step() {
        let err = ManagerError::construction("metrics-listener", "address in use");
        assert!(err.to_string().contains("metrics-listener"));
    }
}
