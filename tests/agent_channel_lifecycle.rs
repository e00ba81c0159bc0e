//! End-to-end agent-channel lifecycle: callback login, a dialed call, and
//! the autologoff-on-upstream-hangup path (`spec.md` §4.2.4). The
//! distinct ack-timeout autologoff path of §4.2.3 Scenario 4 is covered by
//! `answer_auto_logs_off_the_agent_once_the_ack_window_elapses` in
//! `src/agent/channel.rs`, since it needs to script the physical leg's
//! DTMF wait directly.

use std::sync::Arc;
use std::time::Duration;

use pbxq_core::agent::{dial, Agent, AgentRegistry, AgentState, HangupOutcome};
use pbxq_core::testutil::MockOriginator;

#[tokio::test]
async fn callback_agent_is_logged_off_automatically_on_upstream_hangup_once_its_autologoff_window_has_elapsed() {
    let registry = Arc::new(AgentRegistry::new());
    let mut agent = Agent::new("100", "secret", "Alice");
    agent.auto_logoff_seconds = 30;
    registry.register_static(agent);

    registry.callback_login("100", "SIP/alice-home", "Alice <100>", 0).await.unwrap();

    let originator = MockOriginator::new();
    let channel = dial(&registry, &originator, "100", Duration::from_secs(5), 0).await.unwrap();
    assert_eq!(channel.agent_id, "100");
    assert_eq!(registry.get("100").unwrap().data.lock().state, AgentState::Ringing);

    // The agent hangs up well past its 30-second autologoff window.
    let outcome = channel.on_upstream_hangup(60_000).await.unwrap();

    assert_eq!(outcome, HangupOutcome::AutoLoggedOff);
    let agent_after = registry.get("100").unwrap();
    let data = agent_after.data.lock();
    assert_eq!(data.state, AgentState::LoggedOff);
    assert!(data.login_channel.is_none());
}

#[tokio::test]
async fn callback_agent_enters_wrapup_without_logging_off_inside_the_autologoff_window() {
    let registry = Arc::new(AgentRegistry::new());
    let mut agent = Agent::new("100", "secret", "Alice");
    agent.auto_logoff_seconds = 30;
    registry.register_static(agent);
    registry.callback_login("100", "SIP/alice-home", "Alice <100>", 0).await.unwrap();

    let originator = MockOriginator::new();
    let channel = dial(&registry, &originator, "100", Duration::from_secs(5), 0).await.unwrap();

    let outcome = channel.on_upstream_hangup(5_000).await.unwrap();

    assert_eq!(outcome, HangupOutcome::Normal);
    assert_eq!(registry.get("100").unwrap().data.lock().state, AgentState::Wrapup);
}

#[tokio::test]
async fn dialing_an_unregistered_agent_id_fails_unregistered() {
    let registry = Arc::new(AgentRegistry::new());
    let originator = MockOriginator::new();
    let err = dial(&registry, &originator, "999", Duration::from_secs(5), 0).await.unwrap_err();
    assert_eq!(err, pbxq_core::agent::AgentDialFailure::Unregistered);
}
