//! Core data model for the queue engine (`spec.md` §3).

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::external::DeviceState;

/// Member-selection strategy (`spec.md` §3, §4.1.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RingAll,
    RoundRobin,
    LeastRecent,
    FewestCalls,
    Random,
    RoundRobinMemory,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::RingAll
    }
}

/// How ringing a strategy's winning candidate(s) should proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    /// Ring every member tied for the lowest metric at once (RingAll).
    Parallel,
    /// Ring a single best candidate, retrying the next on failure.
    Single,
}

impl Strategy {
    pub fn selection_mode(self) -> SelectionMode {
        match self {
            Strategy::RingAll => SelectionMode::Parallel,
            _ => SelectionMode::Single,
        }
    }
}

/// `joinempty` policy (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinEmptyPolicy {
    Allow,
    Normal,
    Strict,
}

impl Default for JoinEmptyPolicy {
    fn default() -> Self {
        JoinEmptyPolicy::Allow
    }
}

/// `leavewhenempty` policy (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveWhenEmptyPolicy {
    Never,
    Normal,
    Strict,
}

impl Default for LeaveWhenEmptyPolicy {
    fn default() -> Self {
        LeaveWhenEmptyPolicy::Never
    }
}

/// `announceholdtime` policy (`spec.md` §3, §4.1.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnounceHoldTime {
    Never,
    Once,
    Always,
}

impl Default for AnnounceHoldTime {
    fn default() -> Self {
        AnnounceHoldTime::Never
    }
}

/// Member status summary used to decide join admissibility (`spec.md`
/// §4.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatusSummary {
    NoMembers,
    NoReachableMembers,
    Normal,
}

/// Reasons a caller leaves a queue (`spec.md` §4.1.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Answered,
    Timeout,
    Abandon,
    ExitWithKey,
    LeaveEmpty,
    LeaveUnavail,
}

impl ExitReason {
    /// `QUEUESTATUS` value set on the caller's channel (`spec.md` §6).
    pub fn queue_status(self) -> &'static str {
        match self {
            ExitReason::Answered => "",
            ExitReason::Timeout => "TIMEOUT",
            ExitReason::Abandon => "",
            ExitReason::ExitWithKey => "",
            ExitReason::LeaveEmpty => "LEAVEEMPTY",
            ExitReason::LeaveUnavail => "LEAVEUNAVAIL",
        }
    }
}

/// Caller state machine (`spec.md` §4.1.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerState {
    Waiting,
    Announcing,
    Offering,
    Bridged,
    Completed,
    Abandoned,
    Exited,
    TimedOut,
}

/// Monotonic seconds-since-epoch clock used throughout the engine so tests
/// can reason about elapsed time without sleeping. Production embedders
/// read real time; tests may substitute a fake clock via the same
/// `now_millis` free function by controlling `SystemTime` is not practical,
/// so instead every timing-sensitive entry point accepts an explicit `now`
/// parameter (see `Queue::insert_caller`, `select_candidate`, etc.) and this
/// helper is only the default source at the call sites in `dispatch.rs`.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// An agent's presence in a specific queue (`spec.md` §3, "Member").
#[derive(Debug, Clone)]
pub struct Member {
    pub interface: String,
    pub penalty: u32,
    pub dynamic: bool,
    pub paused: bool,
    pub last_call_ms: i64,
    pub calls_taken: u64,
    pub state: DeviceState,
    pub dead: bool,
}

impl Member {
    pub fn new(interface: impl Into<String>, penalty: u32, dynamic: bool) -> Self {
        Self {
            interface: interface.into(),
            penalty,
            dynamic,
            paused: false,
            last_call_ms: 0,
            calls_taken: 0,
            state: DeviceState::Unknown,
            dead: false,
        }
    }

    /// Whether this member is still cooling down from its last call
    /// (`spec.md` §4.1.7).
    pub fn in_wrapup(&self, now_ms: i64, wrapup_ms: i64) -> bool {
        self.last_call_ms > 0 && wrapup_ms > 0 && (now_ms - self.last_call_ms) < wrapup_ms
    }

    pub fn is_reachable(&self) -> bool {
        self.state.is_reachable()
    }
}

/// A customer waiting in a queue (`spec.md` §3, "Caller").
#[derive(Debug, Clone)]
pub struct Caller {
    pub channel_id: String,
    pub priority: i32,
    pub position: usize,
    pub original_position: usize,
    pub join_time_ms: i64,
    pub expiry_ms: i64,
    pub last_position_announced_ms: i64,
    pub last_position_value_announced: usize,
    pub last_periodic_announce_ms: i64,
    pub moh_class: String,
    pub exit_context: String,
    pub digit_buffer: String,
    pub handled: bool,
    pub state: CallerState,
    pub hold_time_announced: bool,
}

impl Caller {
    pub fn new(channel_id: impl Into<String>, priority: i32, timeout_ms: i64, now_ms: i64) -> Self {
        Self {
            channel_id: channel_id.into(),
            priority,
            position: 0,
            original_position: 0,
            join_time_ms: now_ms,
            expiry_ms: if timeout_ms > 0 { now_ms + timeout_ms } else { 0 },
            last_position_announced_ms: 0,
            last_position_value_announced: 0,
            last_periodic_announce_ms: now_ms,
            moh_class: String::new(),
            exit_context: String::new(),
            digit_buffer: String::new(),
            handled: false,
            state: CallerState::Waiting,
            hold_time_announced: false,
        }
    }

    /// Whether the overall expiry has elapsed. An expiry of 0 means "never"
    /// (`spec.md` §8, boundary behaviors).
    pub fn has_expired(&self, now_ms: i64) -> bool {
        self.expiry_ms > 0 && now_ms >= self.expiry_ms
    }
}

/// Smoothed hold-time estimator: a recursive boxcar filter with coefficient
/// 4 (`spec.md` §4.1.4).
#[derive(Debug, Clone, Copy, Default)]
pub struct HoldTimeEstimator {
    pub average_ms: i64,
}

impl HoldTimeEstimator {
    /// Fold in one completed-call sample (bridge_time - join_time).
    pub fn update(&mut self, sample_ms: i64) {
        self.average_ms = ((self.average_ms * 3) + sample_ms) / 4;
    }
}

/// Per-queue configuration (`spec.md` §3, "Queue / Configuration").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub strategy: Strategy,
    #[serde(rename = "retry")]
    pub retry_seconds: u32,
    #[serde(rename = "timeout")]
    pub timeout_seconds: u32,
    #[serde(rename = "maxlen")]
    pub max_length: usize,
    #[serde(rename = "wrapuptime")]
    pub wrapup_seconds: u32,
    pub weight: u32,
    #[serde(rename = "servicelevel")]
    pub service_level_seconds: u32,
    #[serde(rename = "announcefrequency")]
    pub announce_frequency_seconds: u32,
    #[serde(rename = "periodicannouncefrequency")]
    pub periodic_announce_frequency_seconds: u32,
    #[serde(rename = "roundingseconds")]
    pub round_seconds: u32,
    #[serde(rename = "joinempty")]
    pub join_empty: JoinEmptyPolicy,
    #[serde(rename = "leavewhenempty")]
    pub leave_when_empty: LeaveWhenEmptyPolicy,
    #[serde(rename = "reportholdtime")]
    pub report_hold_time: bool,
    #[serde(rename = "announceholdtime")]
    pub announce_hold_time: AnnounceHoldTime,
    #[serde(rename = "eventwhencalled")]
    pub event_when_called: bool,
    #[serde(rename = "maskmemberstatus")]
    pub mask_member_status: bool,
    #[serde(rename = "monitorformat")]
    pub monitor_format: String,
    #[serde(rename = "musiconhold")]
    pub music_on_hold_class: String,
    #[serde(rename = "context")]
    pub exit_context: String,
    #[serde(rename = "timeoutrestart")]
    pub timeout_restart: bool,
    #[serde(rename = "memberdelay")]
    pub member_delay_seconds: u32,
    /// `app_queue.c`'s `autofill`: ring multiple waiting callers
    /// concurrently instead of serializing through the head of line
    /// (SPEC_FULL.md §3, supplemented attribute).
    pub autofill: bool,
    /// `app_queue.c`'s `ringinuse`: whether a member whose device state is
    /// already `InUse` may still be offered a call (SPEC_FULL.md §3).
    pub ringinuse: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            retry_seconds: 5,
            timeout_seconds: 15,
            max_length: 0,
            wrapup_seconds: 0,
            weight: 0,
            service_level_seconds: 60,
            announce_frequency_seconds: 0,
            periodic_announce_frequency_seconds: 0,
            round_seconds: 0,
            join_empty: JoinEmptyPolicy::default(),
            leave_when_empty: LeaveWhenEmptyPolicy::default(),
            report_hold_time: false,
            announce_hold_time: AnnounceHoldTime::default(),
            event_when_called: false,
            mask_member_status: false,
            monitor_format: String::new(),
            music_on_hold_class: "default".to_string(),
            exit_context: String::new(),
            timeout_restart: false,
            member_delay_seconds: 0,
            autofill: true,
            ringinuse: true,
        }
    }
}

/// Running counters and strategy cursor state for a queue (`spec.md` §3,
/// "Queue / State").
#[derive(Debug, Clone, Default)]
pub struct QueueCounters {
    pub calls_completed: u64,
    pub calls_abandoned: u64,
    pub calls_completed_in_sl: u64,
}

/// A named queue: callers, members, strategy state, counters (`spec.md`
/// §3, "Queue").
#[derive(Debug)]
pub struct Queue {
    pub name: String,
    pub config: QueueConfig,
    pub callers: VecDeque<Caller>,
    pub members: Vec<Member>,
    pub rr_cursor: usize,
    pub rr_wrapped: bool,
    pub counters: QueueCounters,
    pub hold_time: HoldTimeEstimator,
    pub dead: bool,
    pub realtime: bool,
}

impl Queue {
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Self {
        Self {
            name: name.into(),
            config,
            callers: VecDeque::new(),
            members: Vec::new(),
            rr_cursor: 0,
            rr_wrapped: false,
            counters: QueueCounters::default(),
            hold_time: HoldTimeEstimator::default(),
            dead: false,
            realtime: false,
        }
    }

    /// Recompute 1-based, contiguous positions for all waiting callers
    /// (`spec.md` §3 invariants, §4.1.1, §4.1.2).
    pub fn renumber(&mut self) {
        for (idx, caller) in self.callers.iter_mut().enumerate() {
            caller.position = idx + 1;
        }
    }

    /// Summarize member reachability for join admissibility (`spec.md`
    /// §4.1.1).
    pub fn member_status_summary(&self) -> MemberStatusSummary {
        if self.members.is_empty() {
            MemberStatusSummary::NoMembers
        } else if self.members.iter().all(|m| !m.is_reachable()) {
            MemberStatusSummary::NoReachableMembers
        } else {
            MemberStatusSummary::Normal
        }
    }

    pub fn is_full(&self) -> bool {
        self.config.max_length != 0 && self.callers.len() >= self.config.max_length
    }

    pub fn find_member_mut(&mut self, interface: &str) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| m.interface == interface)
    }

    pub fn find_member(&self, interface: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.interface == interface)
    }
}
