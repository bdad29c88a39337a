use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All failure modes surfaced by the engine.
///
/// Lock-phase and precondition failures are recovered locally (rollback,
/// then surface). Commit-phase failures are surfaced but cannot be rolled
/// back. Release-phase failures are logged, never surfaced, and therefore
/// have no variant here.
#[derive(Debug, Error)]
pub enum Error {
    /// A label was used that is not in the machine's fixed set.
    #[error("unknown label '{label}' on machine '{machine}'")]
    UnknownLabel { machine: String, label: String },

    /// A label set violated a construction-time rule (empty, not
    /// lowercase, or not distinct).
    #[error("invalid label set: {reason}")]
    InvalidLabels { reason: String },

    /// A child name collided with an existing child or attribute.
    #[error("an object named '{name}' was already defined on '{parent}'")]
    NameConflict { parent: String, name: String },

    /// The node being attached already has a parent.
    #[error("'{name}' is already attached to '{parent}'")]
    AlreadyAttached { parent: String, name: String },

    /// Children and attributes can only live on object nodes.
    #[error("'{path}' is a state machine and cannot hold children or attributes")]
    NotAContainer { path: String },

    /// Attaching the node would make it its own ancestor.
    #[error("attaching '{name}' would create a cycle in the tree")]
    WouldCycle { name: String },

    /// An id or handle does not resolve inside this system.
    #[error("handle does not refer to a machine in this system")]
    InvalidHandle,

    /// An output vetoed the transition during the lock phase. All locks
    /// taken so far were rolled back before this surfaced.
    #[error("output refused lock for '{label}' on '{machine}': {cause}")]
    LockRefused {
        machine: String,
        label: String,
        cause: anyhow::Error,
    },

    /// A synchronous transition would reach an output that requires
    /// cooperative suspension. No side effects were produced.
    #[error("transition to '{label}' on '{machine}' reaches an async output; use transition_async")]
    AsyncRequired { machine: String, label: String },

    /// An output that acquired its lock failed to apply the change. The
    /// machine's current label is unchanged; physical effects already
    /// applied by other outputs are not reverted.
    #[error("output failed to commit '{label}' on '{machine}': {cause}")]
    CommitViolation {
        machine: String,
        label: String,
        cause: anyhow::Error,
    },

    /// A wiring edge referenced an unknown label.
    #[error("wiring references unknown label '{label}' on '{machine}'")]
    WiringMismatch { machine: String, label: String },

    /// A gate needs at least one input and one output handle.
    #[error("gate requires at least one input and one output")]
    EmptyGate,

    /// The declarative loader could not build an object.
    #[error("failed to construct '{name}': {cause}")]
    ConstructionFailed { name: String, cause: anyhow::Error },
}
