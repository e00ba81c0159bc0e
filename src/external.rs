//! Trait boundaries for the collaborators `spec.md` §1/§2/§6 places out of
//! scope: channel I/O, device-state publication, persistent key/value
//! storage, and realtime (database-like) queue/member lookup.
//!
//! The queue engine, agent channel, and manager plane depend only on these
//! traits, never on a concrete PBX core, so they can be driven in tests with
//! the in-memory implementations in [`crate::testutil`].

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use crate::error::Result;

/// Endpoint state as published by the device-state bus (`spec.md` §2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Invalid,
    Unavailable,
    Unknown,
    Idle,
    InUse,
    Busy,
    Ringing,
}

impl DeviceState {
    /// A member is "reachable" if its device state is neither `Invalid` nor
    /// `Unavailable` (`spec.md` §4.1.1).
    pub fn is_reachable(self) -> bool {
        !matches!(self, DeviceState::Invalid | DeviceState::Unavailable)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Invalid => "Invalid",
            DeviceState::Unavailable => "Unavailable",
            DeviceState::Unknown => "Unknown",
            DeviceState::Idle => "Idle",
            DeviceState::InUse => "InUse",
            DeviceState::Busy => "Busy",
            DeviceState::Ringing => "Ringing",
        };
        f.write_str(s)
    }
}

/// Outcome of attempting to ring a single interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialOutcome {
    Answered,
    Busy,
    Congestion,
    NoAnswer,
    NoSuchDriver,
    Cancelled,
}

/// Opaque handle to one call leg (`spec.md` §2, "Channel interface").
///
/// Implementors own the actual dial/answer/bridge/media plumbing; this core
/// only ever sequences calls to this trait.
#[async_trait]
pub trait ChannelHandle: Send + Sync + fmt::Debug {
    /// Stable identifier for this leg, e.g. `SIP/1001-00000001`.
    fn id(&self) -> &str;

    /// Technology/location string addressing the endpoint, e.g. `SIP/1001`.
    fn interface(&self) -> &str;

    /// Dial this interface and wait up to `timeout` for an outcome.
    async fn dial(&self, interface: &str, timeout: Duration) -> Result<DialOutcome>;

    /// Answer an inbound leg.
    async fn answer(&self) -> Result<()>;

    /// Hang up this leg.
    async fn hangup(&self) -> Result<()>;

    /// Bridge this leg with `other` so media flows between them, returning
    /// only once the bridge tears down (either leg hangs up). Callers that
    /// need real call duration (`spec.md` §4.1.7: wrap-up begins at hangup,
    /// not at answer) take a timestamp before and after this call rather
    /// than assuming the bridge ends instantly.
    async fn bridge(&self, other: &dyn ChannelHandle) -> Result<()>;

    /// Play a named sound file, returning any DTMF digit collected while
    /// playing (interruptible per `spec.md` §4.1.3).
    async fn play(&self, sound: &str) -> Result<Option<char>>;

    /// Speak a number (used for position/hold-time announcements).
    async fn say_number(&self, n: i64) -> Result<Option<char>>;

    /// Set a channel variable (e.g. `QUEUESTATUS`).
    async fn set_variable(&self, name: &str, value: &str) -> Result<()>;

    /// Read the current value of a channel variable, if set.
    async fn get_variable(&self, name: &str) -> Result<Option<String>>;

    /// Asynchronous goto: redirect this leg to `priority` of `exten` in
    /// `context` without waiting for the dial-plan thread to reach it
    /// (`spec.md` §4.3.5, `Redirect`). Dial-plan *execution* remains out of
    /// scope; this only schedules the jump.
    async fn goto(&self, context: &str, exten: &str, priority: u32) -> Result<()>;
}

/// Publishes endpoint state changes (`spec.md` §2, "Device-state bus").
#[async_trait]
pub trait DeviceStateBus: Send + Sync {
    /// Current state of `interface`.
    async fn state_of(&self, interface: &str) -> DeviceState;

    /// Subscribe to subsequent `(interface, state)` changes. Implementations
    /// fan these out on a background task (`spec.md` §4.2.5, §5,
    /// "Background work") so callers never block holding a registry lock.
    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<(String, DeviceState)>;
}

/// String-keyed persistent store with prefix enumeration/deletion
/// (`spec.md` §2, "Persistent K/V store"; §6, "Persistent store keys").
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn get(&self, family: &str, key: &str) -> Result<Option<String>>;
    async fn put(&self, family: &str, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, family: &str, key: &str) -> Result<()>;
    /// Enumerate all `(key, value)` pairs under `family`.
    async fn enumerate(&self, family: &str) -> Result<Vec<(String, String)>>;
}

/// A single realtime-backed queue definition (`spec.md` §4.1.11).
#[derive(Debug, Clone)]
pub struct RealtimeQueueRow {
    pub strategy: String,
    pub fields: Vec<(String, String)>,
}

/// A single realtime-backed member row.
#[derive(Debug, Clone)]
pub struct RealtimeMemberRow {
    pub interface: String,
    pub penalty: i64,
    pub paused: bool,
}

/// Pull-based backend that may define queues/members dynamically
/// (`spec.md` §2, "Realtime lookup"; §4.1.11).
#[async_trait]
pub trait RealtimeLookup: Send + Sync {
    async fn lookup_queue(&self, name: &str) -> Result<Option<RealtimeQueueRow>>;
    async fn lookup_members(&self, queue: &str) -> Result<Vec<RealtimeMemberRow>>;
}

/// Places outbound calls on behalf of the agent channel and the manager
/// plane's `Originate` action (`spec.md` §4.2.2 step 2, §4.3.6). Kept
/// distinct from [`ChannelHandle::dial`] (which rings a peer from an
/// *existing* leg) because originating creates a brand new leg with no
/// caller-side channel yet.
#[async_trait]
pub trait ChannelOriginator: Send + Sync {
    async fn originate(
        &self,
        interface: &str,
        timeout: Duration,
    ) -> Result<std::sync::Arc<dyn ChannelHandle>>;
}

/// Answers "does this digit buffer name an extension in this context?"
/// without executing the dial plan (`spec.md` §4.1.3: DTMF exit-key
/// matching). Dial-plan *execution* remains fully out of scope (`spec.md`
/// §1); this is the narrow lookup the queue application needs to decide
/// whether to exit.
pub trait ExtensionMatcher: Send + Sync {
    fn exists(&self, context: &str, exten: &str) -> bool;
}

/// Queries dial-plan hint state for an extension (`spec.md` §4.3.5,
/// `ExtensionState`). The dial plan itself stays out of scope; this is the
/// narrow "what does this hint currently say" lookup the manager plane
/// needs to answer the action.
#[async_trait]
pub trait ExtensionStateLookup: Send + Sync {
    async fn state_of(&self, context: &str, exten: &str) -> Result<DeviceState>;
}

/// A single voicemail mailbox's status (`spec.md` §4.3.5,
/// `MailboxStatus`/`MailboxCount`). Voicemail storage/playback is external
/// (`spec.md` §1); this is the narrow read-only summary the manager plane
/// surfaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxCounts {
    pub new_messages: u32,
    pub old_messages: u32,
}

#[async_trait]
pub trait VoicemailLookup: Send + Sync {
    /// Whether `mailbox` (format `mailbox@context`) currently has any
    /// waiting messages.
    async fn mailbox_status(&self, mailbox: &str) -> Result<bool>;

    /// New/old message counts for `mailbox`.
    async fn mailbox_count(&self, mailbox: &str) -> Result<MailboxCounts>;
}

