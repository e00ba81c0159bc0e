//! Agent-registry events fed to the manager plane (`spec.md` §4.2.3,
//! §4.2.4; manager plane event emission in §4.3.4).

/// An event emitted at a significant agent-lifecycle transition. The
/// manager plane (`crate::manager::events`) wraps these into wire-format
/// `Event:` messages; nothing here knows about the wire protocol.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    LoggedOff {
        agent_id: String,
        /// Whether the agent was callback-logged-in (`AgentCallbackLogoff`)
        /// rather than fixed (`Agentlogoff`) at the moment it logged off.
        callback: bool,
        reason: Option<String>,
    },
}
