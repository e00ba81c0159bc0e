//! Typed error taxonomy shared by the queue engine, agent channel, and
//! manager plane (see SPEC_FULL.md §7).

use thiserror::Error;

/// A coarse classification of [`CoreError`], used by the queue application
/// to pick a `QUEUESTATUS` value and by the manager plane to pick a
/// `Response: Error` message without matching on the full enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Transient,
    NotFound,
    Unavailable,
    Full,
    Busy,
    Timeout,
    Deadlock,
    Internal,
}

/// Errors produced by this crate.
///
/// Configuration errors never abort a load (SPEC_FULL.md §7); they are
/// collected separately by [`crate::config`]. This enum covers errors raised
/// by operations performed *after* a config has been accepted.
#[derive(Error, Debug)]
pub enum CoreError {
    /// No queue by that name exists, and no realtime definition matches it.
    #[error("no such queue: {0}")]
    NoSuchQueue(String),

    /// No agent by that id exists in the agent registry.
    #[error("no such agent: {0}")]
    NoSuchAgent(String),

    /// No member by that interface exists in the given queue.
    #[error("no such member: {interface} in queue {queue}")]
    NoSuchMember { queue: String, interface: String },

    /// Join refused because the queue has no members at all.
    #[error("queue {0} has no members")]
    JoinEmpty(String),

    /// Join refused because the queue has no reachable members.
    #[error("queue {0} has no reachable members")]
    JoinUnavail(String),

    /// Join refused because the queue is at its configured maximum length.
    #[error("queue {0} is full")]
    Full(String),

    /// A channel-level failure while attempting to ring a member
    /// (busy/congestion/no-such-driver); the caller advances strategy state
    /// and does not abort the overall attempt.
    #[error("channel failure ringing {interface}: {reason}")]
    ChannelFailure { interface: String, reason: String },

    /// A second lock could not be acquired (weight arbitration trylock, or
    /// agent app-lock trylock); treated as "not available this cycle".
    #[error("lock contended: {0}")]
    Contended(String),

    /// An operation did not complete within its allotted time.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// A resource is transiently unavailable (allocation failure, socket
    /// refusal); the current operation fails but unrelated state is
    /// untouched.
    #[error("transient resource error: {0}")]
    Transient(String),

    /// An agent's app lock is already held by another offer.
    #[error("agent {0} is busy with another offer")]
    AgentBusy(String),

    /// A manager session attempted an action without sufficient privilege.
    #[error("permission denied: action requires {0:?} category")]
    PermissionDenied(crate::manager::events::Category),

    /// A manager session is not authenticated.
    #[error("not authenticated")]
    NotAuthenticated,

    /// Callback-login presented a wrong password, or the agent has already
    /// exhausted its configured `maxlogintries`.
    #[error("agent {0} authentication failed")]
    AgentAuthFailed(String),

    /// Catch-all for invariant violations and unexpected internal states.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::NoSuchQueue(_) | CoreError::NoSuchAgent(_) | CoreError::NoSuchMember { .. } => {
                ErrorKind::NotFound
            }
            CoreError::JoinEmpty(_) => ErrorKind::Unavailable,
            CoreError::JoinUnavail(_) => ErrorKind::Unavailable,
            CoreError::Full(_) => ErrorKind::Full,
            CoreError::ChannelFailure { .. } => ErrorKind::Transient,
            CoreError::Contended(_) => ErrorKind::Deadlock,
            CoreError::Timeout(_) => ErrorKind::Timeout,
            CoreError::Transient(_) => ErrorKind::Transient,
            CoreError::AgentBusy(_) => ErrorKind::Busy,
            CoreError::PermissionDenied(_) | CoreError::NotAuthenticated | CoreError::AgentAuthFailed(_) => {
                ErrorKind::Internal
            }
            CoreError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The `QUEUESTATUS` value the queue application sets on the caller's
    /// channel when this error ends a join attempt (SPEC_FULL.md §4.1.8,
    /// §6). Returns `None` for errors that are not join-time outcomes.
    pub fn queue_status(&self) -> Option<&'static str> {
        match self {
            CoreError::JoinEmpty(_) => Some("JOINEMPTY"),
            CoreError::JoinUnavail(_) => Some("JOINUNAVAIL"),
            CoreError::Full(_) => Some("FULL"),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
