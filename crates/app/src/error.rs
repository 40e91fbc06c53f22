use std::io;

/// Failures surfaced by the provisioning and orchestration engine.
///
/// A Behat run that finishes with a non-zero status is not an error; it is reported through
/// [`crate::driver::Outcome::Completed`].
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// The instance or a mandatory artifact is not usable; nothing has been started.
    #[error("{0}")]
    Precondition(String),

    /// A download or install step did not produce the expected artifact.
    #[error("failed to provision {artifact}: {reason}")]
    Provision { artifact: String, reason: String },

    /// A process could not be launched.
    #[error("failed to start {name} ({command}): {source}")]
    Spawn {
        name: String,
        command: String,
        #[source]
        source: io::Error,
    },

    /// The instance collaborator failed (config persistence, runtime probe, script run).
    #[error(transparent)]
    Instance(#[from] anyhow::Error),
}

impl HarnessError {
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    pub fn provision(artifact: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Provision {
            artifact: artifact.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;
