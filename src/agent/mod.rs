//! Agent channel abstraction: data model, registry, and the synthetic
//! `Agent/<id>` endpoint (`spec.md` §4.2).

pub mod channel;
pub mod events;
pub mod registry;
pub mod types;

pub use channel::{dial, AgentChannel, AgentDialFailure, DialTarget, HangupOutcome};
pub use events::AgentEvent;
pub use registry::{AgentHandle, AgentRegistry};
pub use types::{AckCallMode, Agent, AgentState};
