//! Queue engine: data model, member-selection strategies, announcements,
//! realtime reconciliation, persistence, and the queue application
//! (`spec.md` §4.1).

pub mod announce;
pub mod dispatch;
pub mod events;
pub mod persistence;
pub mod realtime;
pub mod registry;
pub mod strategy;
pub mod types;

pub use dispatch::serve_caller;
pub use events::QueueEvent;
pub use registry::{JoinOutcome, QueueRegistry};
pub use types::{
    AnnounceHoldTime, Caller, ExitReason, HoldTimeEstimator, JoinEmptyPolicy, LeaveWhenEmptyPolicy, Member,
    MemberStatusSummary, Queue, QueueConfig, QueueCounters, SelectionMode, Strategy,
};
