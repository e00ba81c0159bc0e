//! Queue-engine events fed to the manager plane (`spec.md` §4.1.1, §4.1.2,
//! §4.1.8; manager plane event emission in §4.3.4).

use super::types::ExitReason;

/// An event emitted at every significant queue-engine transition. The
/// manager plane (`crate::manager::events`) wraps these into wire-format
/// `Event:` messages; nothing here knows about the wire protocol.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Join {
        queue: String,
        channel_id: String,
        position: usize,
        count: usize,
    },
    Leave {
        queue: String,
        channel_id: String,
        count: usize,
    },
    CallerExit {
        queue: String,
        channel_id: String,
        reason: ExitReason,
    },
    MemberAdded {
        queue: String,
        interface: String,
        penalty: u32,
        dynamic: bool,
    },
    MemberRemoved {
        queue: String,
        interface: String,
    },
    MemberPaused {
        queue: String,
        interface: String,
        paused: bool,
    },
    QueueDestroyed {
        queue: String,
    },
}
