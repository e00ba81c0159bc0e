//! The manager plane: wire protocol, authentication, event construction,
//! action dispatch, and listener management (`spec.md` §4.3).

pub mod actions;
pub mod events;
pub mod message;
pub mod server;
pub mod session;

pub use actions::{dispatch, ActionContext, ActionSpec, ChannelLookup, KNOWN_ACTIONS};
pub use events::{queue_event_to_message, Category, CategoryMask};
pub use message::{DecodeError, Header, Message, MessageDecoder, BANNER};
pub use server::{Bind, ListenerConfig, ManagerServer, UserTable};
pub use session::{ManagerSession, ManagerUser};
