use thiserror::Error;

/// Errors raised while bringing the scheduler up.
///
/// Everything past startup follows the abort-on-violation policy: benign
/// CAS failures are retried locally and genuine invariant breaks panic.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("scheduler requires at least one worker")]
    NoWorkers,

    #[error("failed to spawn worker thread")]
    Spawn(#[from] std::io::Error),
}
