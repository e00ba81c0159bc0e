//! Privilege categories and event construction for the manager plane
//! (`spec.md` §4.3.2 "event categories"; §4.3.4 "event emission").

use super::message::Message;
use crate::agent::{AgentEvent, AgentState};
use crate::queue::{ExitReason, QueueEvent};

/// A single privilege bit. Read/write/send-events masks are bitwise
/// combinations of these (`spec.md` §3, "Manager session"; §4.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Category {
    System = 0b0000_0001,
    Call = 0b0000_0010,
    Command = 0b0000_0100,
    Agent = 0b0000_1000,
    User = 0b0001_0000,
    Log = 0b0010_0000,
}

impl Category {
    pub fn bit(self) -> u32 {
        self as u32
    }
}

/// A bitmask of [`Category`] values, used for a session's read/write/
/// send-events permissions (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CategoryMask(pub u32);

impl CategoryMask {
    pub const NONE: CategoryMask = CategoryMask(0);

    pub fn all() -> Self {
        CategoryMask(
            Category::System.bit()
                | Category::Call.bit()
                | Category::Command.bit()
                | Category::Agent.bit()
                | Category::User.bit()
                | Category::Log.bit(),
        )
    }

    /// `(read_perm ∧ category) = category` style containment test
    /// (`spec.md` §4.3.4).
    pub fn contains(self, category: Category) -> bool {
        self.0 & category.bit() == category.bit()
    }

    pub fn with(self, category: Category) -> Self {
        CategoryMask(self.0 | category.bit())
    }

    pub fn category_names(self) -> Vec<&'static str> {
        Self::NAMED_CATEGORIES.iter().filter(|(c, _)| self.contains(*c)).map(|(_, name)| *name).collect()
    }

    const NAMED_CATEGORIES: [(Category, &'static str); 6] = [
        (Category::System, "system"),
        (Category::Call, "call"),
        (Category::Command, "command"),
        (Category::Agent, "agent"),
        (Category::User, "user"),
        (Category::Log, "log"),
    ];

    /// Parse a `manager.conf` `read`/`write` value (`spec.md` §6), e.g.
    /// `"system,call,agent"`, into a mask. Unknown category names are
    /// ignored rather than rejecting the whole line (`spec.md` §7,
    /// "Configuration errors").
    pub fn parse(value: &str) -> Self {
        let mut mask = CategoryMask::NONE;
        for token in value.split(',') {
            let token = token.trim();
            if let Some((category, _)) = Self::NAMED_CATEGORIES.iter().find(|(_, name)| name.eq_ignore_ascii_case(token)) {
                mask = mask.with(*category);
            }
        }
        mask
    }
}

/// The privilege category a [`QueueEvent`] is fanned out under (`spec.md`
/// §4.3.4). Caller/position transitions are `call` events; dynamic member
/// administration mirrors the `agent` category `QueueAdd`/`QueueRemove`/
/// `QueuePause` actions that cause them (`spec.md` §4.3.5).
pub fn queue_event_category(event: &QueueEvent) -> Category {
    match event {
        QueueEvent::Join { .. }
        | QueueEvent::Leave { .. }
        | QueueEvent::CallerExit { .. }
        | QueueEvent::QueueDestroyed { .. } => Category::Call,
        QueueEvent::MemberAdded { .. } | QueueEvent::MemberRemoved { .. } | QueueEvent::MemberPaused { .. } => {
            Category::Agent
        }
    }
}

/// Wrap a [`QueueEvent`] into a wire-format `Event:` message. Construction
/// is cheap; callers only build this after confirming at least one eligible
/// session exists (`spec.md` §4.3.4, "lazy construction").
pub fn queue_event_to_message(event: &QueueEvent) -> Message {
    match event {
        QueueEvent::Join { queue, channel_id, position, count } => Message::new()
            .push("Event", "Join")
            .push("Privilege", "call,all")
            .push("Queue", queue)
            .push("Channel", channel_id)
            .push("Position", position.to_string())
            .push("Count", count.to_string()),
        QueueEvent::Leave { queue, channel_id, count } => Message::new()
            .push("Event", "Leave")
            .push("Privilege", "call,all")
            .push("Queue", queue)
            .push("Channel", channel_id)
            .push("Count", count.to_string()),
        QueueEvent::CallerExit { queue, channel_id, reason } => Message::new()
            .push("Event", "QueueCallerExit")
            .push("Privilege", "call,all")
            .push("Queue", queue)
            .push("Channel", channel_id)
            .push("Reason", exit_reason_name(*reason)),
        QueueEvent::MemberAdded { queue, interface, penalty, dynamic } => Message::new()
            .push("Event", "QueueMemberAdded")
            .push("Privilege", "agent,all")
            .push("Queue", queue)
            .push("Interface", interface)
            .push("Penalty", penalty.to_string())
            .push("Membership", if *dynamic { "dynamic" } else { "static" }),
        QueueEvent::MemberRemoved { queue, interface } => Message::new()
            .push("Event", "QueueMemberRemoved")
            .push("Privilege", "agent,all")
            .push("Queue", queue)
            .push("Interface", interface),
        QueueEvent::MemberPaused { queue, interface, paused } => Message::new()
            .push("Event", "QueueMemberPaused")
            .push("Privilege", "agent,all")
            .push("Queue", queue)
            .push("Interface", interface)
            .push("Paused", if *paused { "1" } else { "0" }),
        QueueEvent::QueueDestroyed { queue } => {
            Message::new().push("Event", "QueueDestroyed").push("Privilege", "call,all").push("Queue", queue)
        }
    }
}

fn exit_reason_name(reason: ExitReason) -> &'static str {
    match reason {
        ExitReason::Answered => "Answered",
        ExitReason::Timeout => "Timeout",
        ExitReason::Abandon => "Abandon",
        ExitReason::ExitWithKey => "ExitWithKey",
        ExitReason::LeaveEmpty => "LeaveEmpty",
        ExitReason::LeaveUnavail => "LeaveUnavail",
    }
}

/// `AgentCallbackLogoff` / `Agentlogoff` event (`spec.md` §4.2.3, §4.2.4).
pub fn agent_logoff_event(agent_id: &str, callback: bool, reason: Option<&str>) -> Message {
    let mut msg = Message::new()
        .push("Event", if callback { "AgentCallbackLogoff" } else { "Agentlogoff" })
        .push("Privilege", "agent,all")
        .push("Agent", agent_id);
    if let Some(reason) = reason {
        msg = msg.push("Reason", reason);
    }
    msg
}

/// The privilege category an [`AgentEvent`] is fanned out under (`spec.md`
/// §4.3.4). All agent-lifecycle events are `agent` category.
pub fn agent_event_category(_event: &AgentEvent) -> Category {
    Category::Agent
}

/// Wrap an [`AgentEvent`] into a wire-format `Event:` message.
pub fn agent_event_to_message(event: &AgentEvent) -> Message {
    match event {
        AgentEvent::LoggedOff { agent_id, callback, reason } => {
            agent_logoff_event(agent_id, *callback, reason.as_deref())
        }
    }
}

/// `OriginateSuccess` / `OriginateFailure`, correlated by `ActionID`
/// (`spec.md` §4.3.6).
pub fn originate_result_event(action_id: Option<&str>, channel: &str, success: bool, reason: Option<&str>) -> Message {
    let mut msg = Message::new()
        .push("Event", if success { "OriginateSuccess" } else { "OriginateFailure" })
        .push("Privilege", "call,all")
        .push("Channel", channel);
    if let Some(id) = action_id {
        msg = msg.push("ActionID", id);
    }
    if let Some(reason) = reason {
        msg = msg.push("Reason", reason);
    }
    msg
}

pub fn agent_state_name(state: AgentState) -> &'static str {
    match state {
        AgentState::LoggedOff => "LOGGEDOFF",
        AgentState::Idle => "AGENT_IDLE",
        AgentState::Reserved => "AGENT_RESERVED",
        AgentState::Ringing => "RINGING",
        AgentState::OnCall => "AGENT_ONCALL",
        AgentState::Wrapup => "AGENT_WRAPUP",
        AgentState::Pending => "AGENT_PENDING",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_containment() {
        let mask = CategoryMask::NONE.with(Category::Call).with(Category::Agent);
        assert!(mask.contains(Category::Call));
        assert!(!mask.contains(Category::Command));
    }

    #[test]
    fn join_event_has_stable_header_order() {
        let event = QueueEvent::Join { queue: "support".into(), channel_id: "Tech/A-1".into(), position: 1, count: 1 };
        let msg = queue_event_to_message(&event);
        let keys: Vec<&str> = msg.headers().iter().map(|h| h.key.as_str()).collect();
        assert_eq!(keys, vec!["Event", "Privilege", "Queue", "Channel", "Position", "Count"]);
    }
}
