//! Agent data model (`spec.md` §3, "Agent"; §4.2).

use serde::{Deserialize, Serialize};

/// How the agent must confirm a ring before being bridged (`spec.md`
/// §4.2.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckCallMode {
    None,
    Required,
    /// Treated identically to `Required` (`spec.md` §9, Open Questions:
    /// the distinction between `Required` and `Always` is ambiguous in the
    /// source at two sites; this crate documents only "require `#` before
    /// bridging" for both).
    RequiredAlways,
}

impl AckCallMode {
    pub fn requires_ack(self) -> bool {
        !matches!(self, AckCallMode::None)
    }
}

impl Default for AckCallMode {
    fn default() -> Self {
        AckCallMode::None
    }
}

/// Agent presence state (`spec.md` §3, "Agent / Attributes / state").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    LoggedOff,
    Idle,
    Reserved,
    Ringing,
    OnCall,
    Wrapup,
    Pending,
}

/// A registered call-center agent (`spec.md` §3, "Agent").
#[derive(Debug, Clone)]
pub struct Agent {
    pub id: String,
    pub password: String,
    pub display_name: String,
    pub group_mask: u32,
    pub auto_logoff_seconds: u32,
    pub wrapup_ms: u32,
    pub ack_call: AckCallMode,
    pub music_on_hold_class: String,
    pub state: AgentState,
    pub owning_channel_id: Option<String>,
    pub bridged_peer_channel_id: Option<String>,
    pub login_start_ms: i64,
    pub last_disconnect_ms: i64,
    pub login_channel: Option<String>,
    pub last_acknowledged: bool,
    pub dead: bool,
    /// `agents.conf`'s `maxlogintries` (SPEC_FULL.md §3, supplemented).
    pub max_login_tries: u32,
    pub login_attempts: u32,
}

impl Agent {
    pub fn new(id: impl Into<String>, password: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            password: password.into(),
            display_name: display_name.into(),
            group_mask: 0,
            auto_logoff_seconds: 0,
            wrapup_ms: 0,
            ack_call: AckCallMode::None,
            music_on_hold_class: "default".to_string(),
            state: AgentState::LoggedOff,
            owning_channel_id: None,
            bridged_peer_channel_id: None,
            login_start_ms: 0,
            last_disconnect_ms: 0,
            login_channel: None,
            last_acknowledged: true,
            dead: false,
            max_login_tries: 0,
            login_attempts: 0,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        !matches!(self.state, AgentState::LoggedOff) || self.login_channel.is_some()
    }

    pub fn is_fixed_login(&self) -> bool {
        self.owning_channel_id.is_some() && self.login_channel.is_none()
    }

    pub fn is_callback_login(&self) -> bool {
        self.login_channel.is_some()
    }

    /// An agent is eligible to be bound to a new offer when it has no
    /// active owner and is not mid-wrapup (`spec.md` §4.2.2, step 1).
    pub fn is_free(&self, now_ms: i64) -> bool {
        self.owning_channel_id.is_none()
            && !matches!(self.state, AgentState::Wrapup if self.last_disconnect_ms > now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_call_mode_none_does_not_require_ack() {
        assert!(!AckCallMode::None.requires_ack());
        assert!(AckCallMode::Required.requires_ack());
        assert!(AckCallMode::RequiredAlways.requires_ack());
    }

    #[test]
    fn new_agent_starts_logged_off_and_free() {
        let agent = Agent::new("100", "secret", "Alice");
        assert!(!agent.is_logged_in());
        assert!(!agent.is_fixed_login());
        assert!(!agent.is_callback_login());
        assert!(agent.is_free(0));
    }

    #[test]
    fn fixed_login_is_an_owning_channel_with_no_login_channel() {
        let mut agent = Agent::new("100", "secret", "Alice");
        agent.owning_channel_id = Some("Tech/100".to_string());
        assert!(agent.is_fixed_login());
        assert!(!agent.is_callback_login());
        assert!(agent.is_logged_in());
    }

    #[test]
    fn callback_login_is_a_login_channel() {
        let mut agent = Agent::new("100", "secret", "Alice");
        agent.login_channel = Some("SIP/1001".to_string());
        assert!(agent.is_callback_login());
        assert!(agent.is_logged_in());
    }

    #[test]
    fn agent_with_an_owner_is_not_free() {
        let mut agent = Agent::new("100", "secret", "Alice");
        agent.owning_channel_id = Some("Tech/100".to_string());
        assert!(!agent.is_free(0));
    }

    #[test]
    fn agent_in_wrapup_is_not_free_until_the_window_elapses() {
        let mut agent = Agent::new("100", "secret", "Alice");
        agent.state = AgentState::Wrapup;
        agent.last_disconnect_ms = 10_000;
        assert!(!agent.is_free(5_000));
        assert!(agent.is_free(10_000));
        assert!(agent.is_free(15_000));
    }
}
