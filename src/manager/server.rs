//! Manager listeners: bind TCP and Unix-domain endpoints, run the
//! banner/authenticate handshake, and spawn the reader/writer task pair
//! for each accepted session (`spec.md` §4.3.1, §4.3.3, §4.3.7).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::broadcast;
use tracing::{info, warn, Instrument};

use super::actions::{dispatch, ActionContext};
use super::events::{agent_event_category, agent_event_to_message, queue_event_category, queue_event_to_message, CategoryMask};
use super::message::{Message, MessageDecoder, BANNER};
use super::session::{ManagerSession, ManagerUser};
use crate::agent::AgentEvent;
use crate::queue::QueueEvent;

/// Where a listener accepts connections.
#[derive(Debug, Clone)]
pub enum Bind {
    Tcp(String),
    Unix(std::path::PathBuf),
}

/// Static configuration for one listener (`spec.md` §4.3.7): its
/// transport, default permission masks, and whether connections on it
/// skip the Login handshake entirely (trusted local sockets).
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind: Bind,
    pub banner: String,
    pub default_read: CategoryMask,
    pub default_write: CategoryMask,
    pub pre_authenticated: bool,
    pub queue_size: usize,
}

impl ListenerConfig {
    pub fn tcp(addr: impl Into<String>) -> Self {
        Self {
            bind: Bind::Tcp(addr.into()),
            banner: BANNER.to_string(),
            default_read: CategoryMask::NONE,
            default_write: CategoryMask::NONE,
            pre_authenticated: false,
            queue_size: super::session::DEFAULT_QUEUE_SIZE,
        }
    }

    pub fn unix_console(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            bind: Bind::Unix(path.into()),
            banner: BANNER.to_string(),
            default_read: CategoryMask::all(),
            default_write: CategoryMask::all(),
            pre_authenticated: true,
            queue_size: super::session::DEFAULT_QUEUE_SIZE,
        }
    }
}

/// The user table loaded from `manager.conf` (`spec.md` §6). Keyed by
/// username, case-sensitively as the source does.
#[derive(Debug, Clone, Default)]
pub struct UserTable(HashMap<String, ManagerUser>);

impl UserTable {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn insert(&mut self, user: ManagerUser) {
        self.0.insert(user.username.clone(), user);
    }

    pub fn get(&self, username: &str) -> Option<&ManagerUser> {
        self.0.get(username)
    }
}

/// Runs listeners and dispatches sessions against a shared
/// [`ActionContext`] (`spec.md` §4.3.7).
pub struct ManagerServer {
    ctx: ActionContext,
    users: Arc<UserTable>,
}

impl ManagerServer {
    pub fn new(ctx: ActionContext, users: UserTable) -> Self {
        Self { ctx, users: Arc::new(users) }
    }

    /// Bind and serve one listener until the process is torn down. Callers
    /// typically `tokio::spawn` one of these per configured `listen` line
    /// (`spec.md` §6, `manager.conf`).
    pub async fn serve(&self, config: ListenerConfig) -> std::io::Result<()> {
        match &config.bind {
            Bind::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await?;
                info!(addr, "manager listener bound");
                loop {
                    let (stream, peer) = listener.accept().await?;
                    let ctx = self.ctx.clone();
                    let users = self.users.clone();
                    let config = config.clone();
                    tokio::spawn(async move {
                        let (reader, writer) = stream.into_split();
                        run_session(ctx, users, config, peer.to_string(), reader, writer).await;
                    });
                }
            }
            Bind::Unix(path) => {
                let _ = std::fs::remove_file(path);
                let listener = UnixListener::bind(path)?;
                info!(path = %path.display(), "manager listener bound");
                loop {
                    let (stream, _addr) = listener.accept().await?;
                    let ctx = self.ctx.clone();
                    let users = self.users.clone();
                    let config = config.clone();
                    let peer = path.display().to_string();
                    tokio::spawn(async move {
                        let (reader, writer) = stream.into_split();
                        run_session(ctx, users, config, peer, reader, writer).await;
                    });
                }
            }
        }
    }
}

async fn run_session<R, W>(
    ctx: ActionContext,
    users: Arc<UserTable>,
    config: ListenerConfig,
    peer: String,
    mut reader: R,
    mut writer: W,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let session = Arc::new(ManagerSession::new(peer.clone(), config.queue_size));
    if config.pre_authenticated {
        // Trusted local sockets skip Login entirely (`spec.md` §4.3.7).
        *session.read_perm.write() = config.default_read;
        *session.write_perm.write() = config.default_write;
        *session.send_events.write() = config.default_read;
        session.authenticated.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    if writer.write_all(config.banner.as_bytes()).await.is_err() {
        return;
    }

    let Some(mut outgoing) = session.take_receiver() else { return };
    let mut queue_events = ctx.queues.subscribe();
    let mut agent_events = ctx.agents.subscribe();

    let span = tracing::info_span!("manager_session", peer = %peer, session = %session.id);
    async {
        let mut decoder = MessageDecoder::new();
        let mut buf = [0u8; 4096];

        loop {
            tokio::select! {
                read = reader.read(&mut buf) => {
                    let n = match read {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            warn!(error = %e, "manager session read error");
                            break;
                        }
                    };
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    let messages = match decoder.feed(&chunk) {
                        Ok(messages) => messages,
                        Err(e) => {
                            warn!(error = %e, "manager session malformed message, closing");
                            break;
                        }
                    };
                    for request in messages {
                        let responses = handle_request(&ctx, &users, &session, &config, &request).await;
                        for response in responses {
                            if !session.enqueue(response) {
                                // Responses are critical; a dropped response
                                // closes the session (`spec.md` §4.3.3).
                                break;
                            }
                        }
                    }
                }
                event = queue_events.recv() => {
                    match event {
                        Ok(event) => forward_event(&session, &event),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                event = agent_events.recv() => {
                    match event {
                        Ok(event) => forward_agent_event(&session, &event),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                outgoing_message = outgoing.recv() => {
                    let Some(message) = outgoing_message else { break };
                    if writer.write_all(message.encode().as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
    .instrument(span)
    .await;
}

async fn handle_request(
    ctx: &ActionContext,
    users: &UserTable,
    session: &Arc<ManagerSession>,
    config: &ListenerConfig,
    request: &Message,
) -> Vec<Message> {
    if let Some(action) = request.action() {
        if action.eq_ignore_ascii_case("challenge") {
            let challenge = session.issue_challenge();
            let action_id = request.action_id().map(|s| s.to_string());
            let mut msg = Message::new().push("Response", "Success").push("Challenge", challenge);
            if let Some(id) = action_id {
                msg = msg.push("ActionID", id);
            }
            return vec![msg];
        }
        if action.eq_ignore_ascii_case("login") {
            return vec![handle_login(users, session, config, request).await];
        }
    }
    dispatch(ctx, session, request).await
}

/// `spec.md` §4.3.2: on any authentication failure, delay briefly before
/// replying (and keep the connection open so the client may retry) rather
/// than rejecting instantly, to blunt trivial password-guessing loops.
const AUTH_FAILURE_DELAY: std::time::Duration = std::time::Duration::from_millis(250);

async fn handle_login(
    users: &UserTable,
    session: &Arc<ManagerSession>,
    config: &ListenerConfig,
    request: &Message,
) -> Message {
    let action_id = request.action_id().map(|s| s.to_string());
    let Some(username) = request.get("Username") else {
        return error(&action_id, "Missing Username");
    };
    let Some(user) = users.get(username) else {
        tokio::time::sleep(AUTH_FAILURE_DELAY).await;
        return error(&action_id, "Authentication failed");
    };

    if !user.allows(peer_ipv4(&session.remote_addr)) {
        tokio::time::sleep(AUTH_FAILURE_DELAY).await;
        return error(&action_id, "Authentication failed");
    }

    let authenticated = match request.get("Key") {
        Some(key) => session.authenticate_md5(user, key),
        None => match request.get("Secret") {
            Some(secret) => session.authenticate_plaintext(user, secret),
            None => false,
        },
    };

    if !authenticated {
        tokio::time::sleep(AUTH_FAILURE_DELAY).await;
        return error(&action_id, "Authentication failed");
    }

    *session.send_events.write() = *session.read_perm.read() & config.default_read;
    let mut msg = Message::new().push("Response", "Success").push("Message", "Authentication accepted");
    if let Some(id) = action_id {
        msg = msg.push("ActionID", id);
    }
    msg
}

impl std::ops::BitAnd for CategoryMask {
    type Output = CategoryMask;
    fn bitand(self, rhs: CategoryMask) -> CategoryMask {
        CategoryMask(self.0 & rhs.0)
    }
}

/// Extracts the IPv4 address from a `host:port` remote-address string
/// (`spec.md` §6, ACL enforcement). Non-IPv4 or unparseable peers (Unix
/// sockets, IPv6) return `None`, which [`ManagerUser::allows`] treats as
/// unrestricted.
fn peer_ipv4(remote_addr: &str) -> Option<std::net::Ipv4Addr> {
    remote_addr.rsplit_once(':').and_then(|(host, _)| host.parse().ok())
}

fn error(action_id: &Option<String>, message: &str) -> Message {
    let mut msg = Message::new().push("Response", "Error").push("Message", message);
    if let Some(id) = action_id {
        msg = msg.push("ActionID", id.clone());
    }
    msg
}

/// `spec.md` §4.3.4: fan out a queue event to this session only if its
/// read/send-events masks admit the event's category.
fn forward_event(session: &Arc<ManagerSession>, event: &QueueEvent) {
    let category = queue_event_category(event);
    if !session.read_perm.read().contains(category) || !session.send_events.read().contains(category) {
        return;
    }
    session.enqueue(queue_event_to_message(event));
}

/// `spec.md` §4.3.4: fan out an agent event to this session only if its
/// read/send-events masks admit the `agent` category.
fn forward_agent_event(session: &Arc<ManagerSession>, event: &AgentEvent) {
    let category = agent_event_category(event);
    if !session.read_perm.read().contains(category) || !session.send_events.read().contains(category) {
        return;
    }
    session.enqueue(agent_event_to_message(event));
}
