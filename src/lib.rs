//! # PBX call-queue dispatch core
//!
//! A call-queue dispatch core for a PBX: queue admission and the
//! head-of-line member-selection application, the agent-channel
//! abstraction that multiplexes a logged-in agent's physical channel
//! across queues, and a manager event/action plane for administration and
//! observability.
//!
//! ## Architecture
//!
//! - [`queue`]: queue data model, member-selection strategies,
//!   announcements, realtime reconciliation, persistence, and the queue
//!   application's dispatch loop.
//! - [`agent`]: agent registration, the two-lock claim protocol, and the
//!   synthetic `Agent/<id>` channel that multiplexes an agent across
//!   queues.
//! - [`manager`]: the manager wire protocol, session/authentication model,
//!   event construction, action dispatch, and listener management.
//! - [`external`]: trait boundaries this core depends on but does not
//!   implement (channel I/O, device-state publication, persistence,
//!   realtime lookup) so it can be embedded against any PBX core.
//! - [`config`]: `queues.conf`/`agents.conf`/`manager.conf` schema and
//!   tolerant loaders.
//! - [`testutil`]: in-memory reference implementations of every
//!   [`external`] trait.
//!
//! This crate places no calls itself; it sequences calls against the
//! traits in [`external`], leaving real dial-plan execution, media, and
//! storage to the embedder.

pub mod agent;
pub mod config;
pub mod error;
pub mod external;
pub mod manager;
pub mod queue;

pub mod testutil;

pub use error::{CoreError, Result};

/// Common imports for embedders wiring this core against a concrete PBX.
pub mod prelude {
    pub use crate::agent::{AckCallMode, Agent, AgentHandle, AgentRegistry, AgentState, DialTarget, HangupOutcome};
    pub use crate::config::{AgentsConf, ManagerConf, QueuesConf, Warning};
    pub use crate::error::{CoreError, ErrorKind, Result};
    pub use crate::external::{
        ChannelHandle, ChannelOriginator, DeviceState, DeviceStateBus, DialOutcome, ExtensionMatcher,
        ExtensionStateLookup, MailboxCounts, PersistentStore, RealtimeLookup, VoicemailLookup,
    };
    pub use crate::manager::{ActionContext, ManagerServer, ManagerSession, ManagerUser};
    pub use crate::queue::{serve_caller, JoinOutcome, Queue, QueueConfig, QueueEvent, QueueRegistry, Strategy};
}
