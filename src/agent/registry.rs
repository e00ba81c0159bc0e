//! Agent registry: lookup-by-id, login/logoff, and the searches the agent
//! channel dial path performs (`spec.md` §3 "Agent / Lifecycle"; §4.2.2).

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::info;

use crate::error::{CoreError, Result};
use crate::external::PersistentStore;

use super::events::AgentEvent;
use super::types::{Agent, AgentState};

pub const PERSIST_FAMILY: &str = "/Agents";

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// An agent's two locks, per `spec.md` §4.2.5: a data lock guarding the
/// record, and an app lock serializing ownership between the agent's login
/// thread and whichever queue thread currently holds an offered call.
pub struct AgentHandle {
    pub data: Mutex<Agent>,
    pub app_lock: tokio::sync::Mutex<()>,
}

impl AgentHandle {
    fn new(agent: Agent) -> Self {
        Self { data: Mutex::new(agent), app_lock: tokio::sync::Mutex::new(()) }
    }

    /// Try to acquire the app lock without blocking, as the concurrency
    /// contract requires (`spec.md` §4.2.5 step 1: "trylock; if busy the
    /// agent is treated as unavailable").
    pub fn try_claim(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        self.app_lock.try_lock().ok()
    }
}

/// Registry of agents, keyed by agent id. Each agent is independently
/// guarded so the login thread and an offering queue thread never contend
/// on unrelated agents (`spec.md` §4.2.5).
pub struct AgentRegistry {
    agents: DashMap<String, Arc<AgentHandle>>,
    store: Option<Arc<dyn PersistentStore>>,
    events_tx: broadcast::Sender<AgentEvent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        let (events_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { agents: DashMap::new(), store: None, events_tx }
    }

    pub fn with_store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events_tx.subscribe()
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn register_static(&self, agent: Agent) {
        self.agents.insert(agent.id.clone(), Arc::new(AgentHandle::new(agent)));
    }

    pub fn get(&self, id: &str) -> Option<Arc<AgentHandle>> {
        self.agents.get(id).map(|e| e.clone())
    }

    pub fn exists(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    /// Create an agent at callback-login time if it doesn't already exist
    /// from static config (`spec.md` §3, "Agent / Lifecycle").
    pub fn get_or_create(&self, id: &str) -> Arc<AgentHandle> {
        self.agents
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(AgentHandle::new(Agent::new(id, "", id))))
            .clone()
    }

    /// `spec.md` §4.2.2 step 1: logged-in fixed agents (physical channel
    /// present, no active owner, not in wrap-up) matching `id`.
    pub fn find_free_fixed(&self, id: &str, now_ms: i64) -> Option<Arc<AgentHandle>> {
        self.agents.get(id).and_then(|entry| {
            let a = entry.data.lock();
            if a.is_fixed_login() && a.is_free(now_ms) && !a.dead {
                Some(entry.clone())
            } else {
                None
            }
        })
    }

    /// `spec.md` §4.2.2 step 1, group form (`Agent/@<group>`): any free
    /// fixed agent whose group bitmask matches.
    pub fn find_free_fixed_in_group(&self, group_mask: u32, now_ms: i64) -> Option<Arc<AgentHandle>> {
        self.agents.iter().find_map(|entry| {
            let a = entry.data.lock();
            if a.is_fixed_login() && a.is_free(now_ms) && !a.dead && (a.group_mask & group_mask) != 0 {
                Some(entry.clone())
            } else {
                None
            }
        })
    }

    /// `spec.md` §4.2.2 step 2: callback-logged-in agents (no physical
    /// channel but have a recorded login channel).
    pub fn find_callback(&self, id: &str, now_ms: i64) -> Option<Arc<AgentHandle>> {
        self.agents.get(id).and_then(|entry| {
            let a = entry.data.lock();
            if a.is_callback_login() && a.is_free(now_ms) && !a.dead {
                Some(entry.clone())
            } else {
                None
            }
        })
    }

    pub fn find_callback_in_group(&self, group_mask: u32, now_ms: i64) -> Option<Arc<AgentHandle>> {
        self.agents.iter().find_map(|entry| {
            let a = entry.data.lock();
            if a.is_callback_login() && a.is_free(now_ms) && !a.dead && (a.group_mask & group_mask) != 0 {
                Some(entry.clone())
            } else {
                None
            }
        })
    }

    /// Any matching agent at all, free or not — used to distinguish
    /// `Busy` from `Unregistered` failure (`spec.md` §4.2.2 step 4).
    pub fn any_match(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    /// Verify `password` against the agent's configured password and
    /// enforce `max_login_tries` (`agents.conf` `[general]` `maxlogintries`;
    /// `chan_agent.c`'s login-prompt retry loop). An agent with no
    /// configured password (including one just created on demand by
    /// [`Self::get_or_create`]) accepts any password, mirroring
    /// `chan_agent.c`'s "only prompt for a password if one is set" rule.
    /// Does not perform the login transition itself; callers still call
    /// [`Self::callback_login`] afterward. A successful check resets the
    /// attempt counter.
    pub fn authenticate(&self, id: &str, password: &str) -> Result<()> {
        let agent = self.get_or_create(id);
        let mut a = agent.data.lock();
        if a.password.is_empty() {
            return Ok(());
        }
        if a.max_login_tries != 0 && a.login_attempts >= a.max_login_tries {
            return Err(CoreError::AgentAuthFailed(id.to_string()));
        }
        if a.password == password {
            a.login_attempts = 0;
            Ok(())
        } else {
            a.login_attempts += 1;
            Err(CoreError::AgentAuthFailed(id.to_string()))
        }
    }

    /// Callback-login an agent: record the login channel, set state, and
    /// (if a store is configured) persist `loginchannel;logincallerid`
    /// (`spec.md` §4.1.10 pattern reused for `/Agents`; §6). Does not check
    /// the password itself; callers needing enforcement call
    /// [`Self::authenticate`] first (`src/manager/actions.rs` does, for the
    /// `AgentCallbackLogin` manager action).
    pub async fn callback_login(
        &self,
        id: &str,
        login_channel: &str,
        login_caller_id: &str,
        now_ms: i64,
    ) -> Result<()> {
        let agent = self.get_or_create(id);
        {
            let mut a = agent.data.lock();
            a.login_channel = Some(login_channel.to_string());
            a.login_start_ms = now_ms;
            a.state = AgentState::Idle;
            a.login_attempts = 0;
        }
        if let Some(store) = &self.store {
            let value = format!("{};{}", login_channel, login_caller_id);
            store.put(PERSIST_FAMILY, id, &value).await?;
        }
        info!(agent = id, login_channel, "agent callback-logged-in");
        Ok(())
    }

    /// Log an agent off, clearing login state, deleting its persisted
    /// callback record if any, and emitting an `Agentlogoff`/
    /// `AgentCallbackLogoff` event (`spec.md` §4.2.3, §4.2.4, §6). `reason`
    /// is carried onto the emitted event verbatim (e.g. `"Autologoff"` for
    /// the ack-timeout path); pass `None` for an operator-requested logoff.
    pub async fn logoff(&self, id: &str, reason: Option<&str>) -> Result<()> {
        let agent = self.get(id).ok_or_else(|| CoreError::NoSuchAgent(id.to_string()))?;
        let was_callback = {
            let mut a = agent.data.lock();
            let was_callback = a.is_callback_login();
            a.state = AgentState::LoggedOff;
            a.owning_channel_id = None;
            a.bridged_peer_channel_id = None;
            a.login_channel = None;
            a.login_start_ms = 0;
            was_callback
        };
        if was_callback {
            if let Some(store) = &self.store {
                store.delete(PERSIST_FAMILY, id).await?;
            }
        }
        self.emit(AgentEvent::LoggedOff {
            agent_id: id.to_string(),
            callback: was_callback,
            reason: reason.map(|r| r.to_string()),
        });
        info!(agent = id, reason = reason.unwrap_or(""), "agent logged off");
        Ok(())
    }

    /// Replay persisted callback-logged-in agents on startup (`spec.md`
    /// §4.1.10 pattern, applied to `/Agents`).
    pub async fn replay_persisted(&self, now_ms: i64) -> Result<()> {
        let Some(store) = self.store.clone() else { return Ok(()) };
        for (id, value) in store.enumerate(PERSIST_FAMILY).await? {
            let mut parts = value.splitn(2, ';');
            let login_channel = parts.next().unwrap_or_default();
            let caller_id = parts.next().unwrap_or_default();
            if !self.exists(&id) {
                // Nothing to attach the replayed login to; drop the stale
                // record rather than fabricate an agent with no config.
                store.delete(PERSIST_FAMILY, &id).await?;
                continue;
            }
            self.callback_login(&id, login_channel, caller_id, now_ms).await?;
        }
        Ok(())
    }

    pub fn ids(&self) -> Vec<String> {
        self.agents.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockPersistentStore;

    #[tokio::test]
    async fn callback_login_creates_agent_and_persists_record() {
        let store: Arc<dyn PersistentStore> = Arc::new(MockPersistentStore::new());
        let registry = AgentRegistry::new().with_store(store.clone());

        registry.callback_login("100", "SIP/1001", "Alice", 1000).await.unwrap();

        assert!(registry.exists("100"));
        let handle = registry.get("100").unwrap();
        assert_eq!(handle.data.lock().state, AgentState::Idle);
        assert_eq!(store.get(PERSIST_FAMILY, "100").await.unwrap().unwrap(), "SIP/1001;Alice");
    }

    #[tokio::test]
    async fn find_callback_only_returns_free_callback_agents() {
        let registry = AgentRegistry::new();
        registry.callback_login("100", "SIP/1001", "Alice", 0).await.unwrap();
        assert!(registry.find_callback("100", 0).is_some());

        registry.get("100").unwrap().data.lock().owning_channel_id = Some("Tech/100".to_string());
        assert!(registry.find_callback("100", 0).is_none());
    }

    #[test]
    fn find_free_fixed_requires_no_login_channel() {
        let registry = AgentRegistry::new();
        let mut agent = Agent::new("200", "secret", "Bob");
        agent.owning_channel_id = Some("Tech/200".to_string());
        registry.register_static(agent);

        assert!(registry.find_free_fixed("200", 0).is_some());
        assert!(registry.find_callback("200", 0).is_none());
    }

    #[test]
    fn group_lookups_match_on_bitmask() {
        let registry = AgentRegistry::new();
        let mut agent = Agent::new("200", "secret", "Bob");
        agent.owning_channel_id = Some("Tech/200".to_string());
        agent.group_mask = 0b0010;
        registry.register_static(agent);

        assert!(registry.find_free_fixed_in_group(0b0010, 0).is_some());
        assert!(registry.find_free_fixed_in_group(0b0100, 0).is_none());
    }

    #[test]
    fn authenticate_accepts_correct_password_and_resets_attempts() {
        let registry = AgentRegistry::new();
        let mut agent = Agent::new("100", "secret", "Alice");
        agent.login_attempts = 2;
        registry.register_static(agent);

        registry.authenticate("100", "secret").unwrap();
        assert_eq!(registry.get("100").unwrap().data.lock().login_attempts, 0);
    }

    #[test]
    fn authenticate_with_no_configured_password_accepts_anything() {
        let registry = AgentRegistry::new();
        registry.register_static(Agent::new("100", "", "Alice"));
        registry.authenticate("100", "whatever").unwrap();
    }

    #[test]
    fn authenticate_rejects_wrong_password_and_counts_attempts() {
        let registry = AgentRegistry::new();
        registry.register_static(Agent::new("100", "secret", "Alice"));

        assert!(registry.authenticate("100", "wrong").is_err());
        assert_eq!(registry.get("100").unwrap().data.lock().login_attempts, 1);
    }

    #[test]
    fn authenticate_locks_out_once_max_login_tries_is_reached() {
        let registry = AgentRegistry::new();
        let mut agent = Agent::new("100", "secret", "Alice");
        agent.max_login_tries = 2;
        registry.register_static(agent);

        assert!(registry.authenticate("100", "wrong").is_err());
        assert!(registry.authenticate("100", "wrong").is_err());
        // Third attempt is refused outright, even with the right password,
        // until something resets the counter (a future successful attempt
        // below the cap, or an operator clearing it).
        let err = registry.authenticate("100", "secret").unwrap_err();
        assert!(matches!(err, CoreError::AgentAuthFailed(_)));
    }

    #[tokio::test]
    async fn logoff_clears_state_and_deletes_callback_record() {
        let store: Arc<dyn PersistentStore> = Arc::new(MockPersistentStore::new());
        let registry = AgentRegistry::new().with_store(store.clone());
        registry.callback_login("100", "SIP/1001", "Alice", 0).await.unwrap();

        let mut events = registry.subscribe();
        registry.logoff("100", None).await.unwrap();

        let handle = registry.get("100").unwrap();
        let a = handle.data.lock();
        assert_eq!(a.state, AgentState::LoggedOff);
        assert!(a.login_channel.is_none());
        drop(a);
        assert!(store.get(PERSIST_FAMILY, "100").await.unwrap().is_none());

        match events.try_recv().unwrap() {
            AgentEvent::LoggedOff { agent_id, callback, reason } => {
                assert_eq!(agent_id, "100");
                assert!(callback);
                assert!(reason.is_none());
            }
        }
    }

    #[tokio::test]
    async fn logoff_unknown_agent_errors() {
        let registry = AgentRegistry::new();
        let err = registry.logoff("nosuch", None).await.unwrap_err();
        assert!(matches!(err, CoreError::NoSuchAgent(_)));
    }

    #[tokio::test]
    async fn replay_persisted_restores_existing_agents_and_prunes_unknown() {
        let store: Arc<dyn PersistentStore> = Arc::new(MockPersistentStore::new());
        store.put(PERSIST_FAMILY, "100", "SIP/1001;Alice").await.unwrap();
        store.put(PERSIST_FAMILY, "999", "SIP/9999;Ghost").await.unwrap();

        let registry = AgentRegistry::new().with_store(store.clone());
        registry.register_static(Agent::new("100", "secret", "Alice"));

        registry.replay_persisted(0).await.unwrap();

        assert!(registry.find_callback("100", 0).is_some());
        assert!(!registry.exists("999"));
        assert!(store.get(PERSIST_FAMILY, "999").await.unwrap().is_none());
    }

    #[test]
    fn try_claim_fails_while_already_held() {
        let handle = AgentHandle::new(Agent::new("100", "secret", "Alice"));
        let _first = handle.try_claim().unwrap();
        assert!(handle.try_claim().is_none());
    }
}
