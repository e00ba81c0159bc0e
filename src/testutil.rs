//! In-memory reference implementations of every [`crate::external`] trait,
//! used by this crate's own tests and available to embedders wiring up a
//! quick integration test of their own (`spec.md` §2).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::{CoreError, Result};
use crate::external::{
    ChannelHandle, ChannelOriginator, DeviceState, DeviceStateBus, DialOutcome, ExtensionStateLookup, MailboxCounts,
    PersistentStore, RealtimeLookup, RealtimeMemberRow, RealtimeQueueRow, VoicemailLookup,
};

/// A channel handle whose `dial`/`answer`/`play` outcomes are scripted
/// ahead of time, so tests can exercise the queue application and agent
/// channel without a real media stack.
#[derive(Debug)]
pub struct MockChannel {
    id: String,
    interface: String,
    dial_outcome: Mutex<DialOutcome>,
    answer_digit: Mutex<Option<char>>,
    play_digit: Mutex<Option<char>>,
    variables: Mutex<HashMap<String, String>>,
    hangups: AtomicUsize,
    bridges: AtomicUsize,
    bridge_hold_ms: Mutex<u64>,
    hang_on_sound: Mutex<Option<String>>,
    gotos: Mutex<Vec<(String, String, u32)>>,
}

impl MockChannel {
    pub fn new(id: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            interface: interface.into(),
            dial_outcome: Mutex::new(DialOutcome::Answered),
            answer_digit: Mutex::new(Some('#')),
            play_digit: Mutex::new(None),
            variables: Mutex::new(HashMap::new()),
            hangups: AtomicUsize::new(0),
            bridges: AtomicUsize::new(0),
            bridge_hold_ms: Mutex::new(0),
            hang_on_sound: Mutex::new(None),
            gotos: Mutex::new(Vec::new()),
        }
    }

    pub fn last_goto(&self) -> Option<(String, String, u32)> {
        self.gotos.lock().last().cloned()
    }

    pub fn with_dial_outcome(self: Arc<Self>, outcome: DialOutcome) -> Arc<Self> {
        *self.dial_outcome.lock() = outcome;
        self
    }

    /// How long `bridge()` sleeps (virtual time, under `start_paused`)
    /// before returning, simulating call duration so tests can tell a
    /// bridge's answer instant apart from its hangup instant.
    pub fn with_bridge_hold_ms(self: Arc<Self>, ms: u64) -> Arc<Self> {
        *self.bridge_hold_ms.lock() = ms;
        self
    }

    /// Make `play(sound)` block forever instead of returning, so a caller
    /// waiting on it under `tokio::time::timeout` genuinely times out
    /// rather than racing an instantly-ready `Ok(None)`.
    pub fn with_hanging_play(self: Arc<Self>, sound: impl Into<String>) -> Arc<Self> {
        *self.hang_on_sound.lock() = Some(sound.into());
        self
    }

    /// The digit `answer()` will report was collected to satisfy an
    /// `ackcall` confirmation (`None` simulates no digit arriving before
    /// the caller times out waiting for it).
    pub fn with_answer_digit(self: Arc<Self>, digit: Option<char>) -> Arc<Self> {
        *self.answer_digit.lock() = digit;
        self
    }

    pub fn hangup_count(&self) -> usize {
        self.hangups.load(Ordering::SeqCst)
    }

    pub fn bridge_count(&self) -> usize {
        self.bridges.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelHandle for MockChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn interface(&self) -> &str {
        &self.interface
    }

    async fn dial(&self, _interface: &str, _timeout: Duration) -> Result<DialOutcome> {
        Ok(self.dial_outcome.lock().clone())
    }

    async fn answer(&self) -> Result<()> {
        Ok(())
    }

    async fn hangup(&self) -> Result<()> {
        self.hangups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn bridge(&self, _other: &dyn ChannelHandle) -> Result<()> {
        self.bridges.fetch_add(1, Ordering::SeqCst);
        let hold_ms = *self.bridge_hold_ms.lock();
        if hold_ms > 0 {
            tokio::time::sleep(Duration::from_millis(hold_ms)).await;
        }
        Ok(())
    }

    async fn play(&self, sound: &str) -> Result<Option<char>> {
        if self.hang_on_sound.lock().as_deref() == Some(sound) {
            std::future::pending::<()>().await;
        }
        Ok(*self.play_digit.lock())
    }

    async fn say_number(&self, _n: i64) -> Result<Option<char>> {
        Ok(*self.play_digit.lock())
    }

    async fn set_variable(&self, name: &str, value: &str) -> Result<()> {
        self.variables.lock().insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn get_variable(&self, name: &str) -> Result<Option<String>> {
        Ok(self.variables.lock().get(name).cloned())
    }

    async fn goto(&self, context: &str, exten: &str, priority: u32) -> Result<()> {
        self.gotos.lock().push((context.to_string(), exten.to_string(), priority));
        Ok(())
    }
}

/// In-memory [`DeviceStateBus`] backed by a `HashMap` and a broadcast
/// channel, so tests can flip a member's reachability and observe the
/// queue application react.
pub struct MockDeviceStateBus {
    states: Mutex<HashMap<String, DeviceState>>,
    tx: broadcast::Sender<(String, DeviceState)>,
}

impl MockDeviceStateBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { states: Mutex::new(HashMap::new()), tx }
    }

    pub fn set(&self, interface: &str, state: DeviceState) {
        self.states.lock().insert(interface.to_string(), state);
        let _ = self.tx.send((interface.to_string(), state));
    }
}

impl Default for MockDeviceStateBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceStateBus for MockDeviceStateBus {
    async fn state_of(&self, interface: &str) -> DeviceState {
        self.states.lock().get(interface).copied().unwrap_or(DeviceState::Unknown)
    }

    fn subscribe(&self) -> broadcast::Receiver<(String, DeviceState)> {
        self.tx.subscribe()
    }
}

/// In-memory [`PersistentStore`], keyed by `(family, key)`.
#[derive(Default)]
pub struct MockPersistentStore {
    data: Mutex<HashMap<(String, String), String>>,
}

impl MockPersistentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistentStore for MockPersistentStore {
    async fn get(&self, family: &str, key: &str) -> Result<Option<String>> {
        Ok(self.data.lock().get(&(family.to_string(), key.to_string())).cloned())
    }

    async fn put(&self, family: &str, key: &str, value: &str) -> Result<()> {
        self.data.lock().insert((family.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    async fn delete(&self, family: &str, key: &str) -> Result<()> {
        self.data.lock().remove(&(family.to_string(), key.to_string()));
        Ok(())
    }

    async fn enumerate(&self, family: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .data
            .lock()
            .iter()
            .filter(|((f, _), _)| f == family)
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Static [`RealtimeLookup`] fixture: definitions are seeded up front and
/// never change during a test run.
#[derive(Default)]
pub struct StaticRealtimeLookup {
    queues: HashMap<String, RealtimeQueueRow>,
    members: HashMap<String, Vec<RealtimeMemberRow>>,
}

impl StaticRealtimeLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(mut self, name: impl Into<String>, row: RealtimeQueueRow) -> Self {
        self.queues.insert(name.into(), row);
        self
    }

    pub fn with_members(mut self, name: impl Into<String>, rows: Vec<RealtimeMemberRow>) -> Self {
        self.members.insert(name.into(), rows);
        self
    }
}

#[async_trait]
impl RealtimeLookup for StaticRealtimeLookup {
    async fn lookup_queue(&self, name: &str) -> Result<Option<RealtimeQueueRow>> {
        Ok(self.queues.get(name).cloned())
    }

    async fn lookup_members(&self, queue: &str) -> Result<Vec<RealtimeMemberRow>> {
        Ok(self.members.get(queue).cloned().unwrap_or_default())
    }
}

/// [`ChannelOriginator`] that always hands back a fresh [`MockChannel`]
/// (or fails, if configured to).
pub struct MockOriginator {
    should_fail: Mutex<bool>,
    next_id: AtomicUsize,
}

impl MockOriginator {
    pub fn new() -> Self {
        Self { should_fail: Mutex::new(false), next_id: AtomicUsize::new(0) }
    }

    pub fn set_should_fail(&self, fail: bool) {
        *self.should_fail.lock() = fail;
    }
}

impl Default for MockOriginator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelOriginator for MockOriginator {
    async fn originate(&self, interface: &str, _timeout: Duration) -> Result<Arc<dyn ChannelHandle>> {
        if *self.should_fail.lock() {
            return Err(CoreError::ChannelFailure { interface: interface.to_string(), reason: "mock failure".to_string() });
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockChannel::new(format!("{interface}-{n:08x}"), interface)))
    }
}

/// [`crate::external::ExtensionMatcher`] fixture: a fixed set of
/// `context/exten` pairs known to exist.
#[derive(Default)]
pub struct StaticExtensionMatcher {
    known: std::collections::HashSet<(String, String)>,
}

impl StaticExtensionMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extension(mut self, context: impl Into<String>, exten: impl Into<String>) -> Self {
        self.known.insert((context.into(), exten.into()));
        self
    }
}

impl crate::external::ExtensionMatcher for StaticExtensionMatcher {
    fn exists(&self, context: &str, exten: &str) -> bool {
        self.known.contains(&(context.to_string(), exten.to_string()))
    }
}

/// [`crate::manager::ChannelLookup`] fixture backed by a plain map,
/// registered by hand as channels are created in a test.
#[derive(Default)]
pub struct MockChannelLookup {
    channels: Mutex<HashMap<String, Arc<dyn ChannelHandle>>>,
}

impl MockChannelLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, channel: Arc<dyn ChannelHandle>) {
        self.channels.lock().insert(channel.id().to_string(), channel);
    }
}

impl crate::manager::ChannelLookup for MockChannelLookup {
    fn find(&self, channel_id: &str) -> Option<Arc<dyn ChannelHandle>> {
        self.channels.lock().get(channel_id).cloned()
    }
}

/// [`VoicemailLookup`] fixture backed by a plain map of `mailbox@context`
/// to counts, seeded by hand in a test.
#[derive(Default)]
pub struct MockVoicemailLookup {
    boxes: Mutex<HashMap<String, MailboxCounts>>,
}

impl MockVoicemailLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mailbox(self, mailbox: impl Into<String>, counts: MailboxCounts) -> Self {
        self.boxes.lock().insert(mailbox.into(), counts);
        self
    }
}

#[async_trait]
impl VoicemailLookup for MockVoicemailLookup {
    async fn mailbox_status(&self, mailbox: &str) -> Result<bool> {
        Ok(self.boxes.lock().get(mailbox).map(|c| c.new_messages > 0).unwrap_or(false))
    }

    async fn mailbox_count(&self, mailbox: &str) -> Result<MailboxCounts> {
        Ok(self.boxes.lock().get(mailbox).copied().unwrap_or_default())
    }
}

/// [`ExtensionStateLookup`] fixture backed by a plain map of
/// `(context, exten)` to device state, seeded by hand in a test.
#[derive(Default)]
pub struct MockExtensionStateLookup {
    states: Mutex<HashMap<(String, String), DeviceState>>,
}

impl MockExtensionStateLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(self, context: impl Into<String>, exten: impl Into<String>, state: DeviceState) -> Self {
        self.states.lock().insert((context.into(), exten.into()), state);
        self
    }
}

#[async_trait]
impl ExtensionStateLookup for MockExtensionStateLookup {
    async fn state_of(&self, context: &str, exten: &str) -> Result<DeviceState> {
        Ok(self.states.lock().get(&(context.to_string(), exten.to_string())).copied().unwrap_or(DeviceState::Unknown))
    }
}
