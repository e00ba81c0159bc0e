//! Standard manager actions (`spec.md` §4.3.5, §4.3.6), dispatched by
//! required [`Category`] and executed against the queue/agent registries.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::agent::AgentRegistry;
use crate::error::CoreError;
use crate::external::{ChannelHandle, ChannelOriginator, ExtensionStateLookup, VoicemailLookup};
use crate::queue::QueueRegistry;

use super::events::{originate_result_event, Category};
use super::message::Message;
use super::session::ManagerSession;

/// One known action's metadata, as surfaced by `ListCommands` (`spec.md`
/// §4.3.5).
pub struct ActionSpec {
    pub name: &'static str,
    pub category: Option<Category>,
    pub synopsis: &'static str,
}

/// The minimum action set named in `spec.md` §4.3.5, used both to dispatch
/// and to answer `ListCommands`.
pub const KNOWN_ACTIONS: &[ActionSpec] = &[
    ActionSpec { name: "Ping", category: None, synopsis: "Test server responsiveness" },
    ActionSpec { name: "Version", category: None, synopsis: "Report server version" },
    ActionSpec { name: "ListCommands", category: None, synopsis: "List available actions" },
    ActionSpec { name: "ListCategories", category: None, synopsis: "List this session's privilege categories" },
    ActionSpec { name: "Events", category: None, synopsis: "Control event delivery for this session" },
    ActionSpec { name: "Logoff", category: None, synopsis: "Terminate this session" },
    ActionSpec { name: "Hangup", category: Some(Category::Call), synopsis: "Hang up a channel" },
    ActionSpec { name: "Status", category: Some(Category::Call), synopsis: "List channel status" },
    ActionSpec { name: "Setvar", category: Some(Category::Call), synopsis: "Set a channel variable" },
    ActionSpec { name: "Getvar", category: Some(Category::Call), synopsis: "Get a channel variable" },
    ActionSpec { name: "Redirect", category: Some(Category::Call), synopsis: "Redirect a channel" },
    ActionSpec { name: "Originate", category: Some(Category::Call), synopsis: "Originate a call" },
    ActionSpec { name: "Command", category: Some(Category::Command), synopsis: "Execute a CLI command" },
    ActionSpec { name: "Complete", category: Some(Category::Command), synopsis: "Tab-complete a CLI command" },
    ActionSpec { name: "MailboxStatus", category: Some(Category::Call), synopsis: "Query whether a mailbox has waiting messages" },
    ActionSpec { name: "MailboxCount", category: Some(Category::Call), synopsis: "Query new/old message counts for a mailbox" },
    ActionSpec { name: "ExtensionState", category: Some(Category::Call), synopsis: "Query dial-plan hint state for an extension" },
    ActionSpec { name: "AbsoluteTimeout", category: Some(Category::Call), synopsis: "Schedule hangup of a channel" },
    ActionSpec { name: "QueueAdd", category: Some(Category::Agent), synopsis: "Add a queue member" },
    ActionSpec { name: "QueueRemove", category: Some(Category::Agent), synopsis: "Remove a queue member" },
    ActionSpec { name: "QueuePause", category: Some(Category::Agent), synopsis: "Pause or unpause a queue member" },
    ActionSpec { name: "AgentCallbackLogin", category: Some(Category::Agent), synopsis: "Log in a callback agent" },
    ActionSpec { name: "AgentLogoff", category: Some(Category::Agent), synopsis: "Log off an agent" },
];

fn find_action(name: &str) -> Option<&'static ActionSpec> {
    KNOWN_ACTIONS.iter().find(|a| a.name.eq_ignore_ascii_case(name))
}

/// Everything an action handler needs to read or mutate (`spec.md` §4.1,
/// §4.2, in aggregate via the manager plane). Held as `Arc`s and cloned
/// into every session so async jobs (`Action: Originate / Async: true`) can
/// outlive the request that spawned them.
#[derive(Clone)]
pub struct ActionContext {
    pub queues: Arc<QueueRegistry>,
    pub agents: Arc<AgentRegistry>,
    pub originator: Arc<dyn ChannelOriginator>,
    pub channels: Arc<dyn ChannelLookup>,
    pub voicemail: Arc<dyn VoicemailLookup>,
    pub extension_state: Arc<dyn ExtensionStateLookup>,
}

/// Resolves a channel id to a live [`ChannelHandle`] for actions like
/// `Hangup`/`Setvar`/`Getvar` (`spec.md` §4.3.5). A thin lookup kept
/// separate from [`ChannelOriginator`] since most channels referenced by
/// the manager plane already exist.
pub trait ChannelLookup: Send + Sync {
    fn find(&self, channel_id: &str) -> Option<Arc<dyn ChannelHandle>>;
}

/// Dispatch one request message, returning the response(s) to enqueue.
/// Authorization is checked against the action's required category before
/// execution (`spec.md` §4.3.5, "checking that the caller's write
/// permission contains the action's required category").
pub async fn dispatch(ctx: &ActionContext, session: &Arc<ManagerSession>, request: &Message) -> Vec<Message> {
    let action_id = request.action_id().map(|s| s.to_string());
    let Some(action_name) = request.action() else {
        return vec![error_response(&action_id, "Missing action")];
    };

    let Some(spec) = find_action(action_name) else {
        return vec![error_response(&action_id, &format!("Unknown action: {action_name}"))];
    };

    if action_name.eq_ignore_ascii_case("Login") || action_name.eq_ignore_ascii_case("Challenge") {
        // Authentication itself is handled by the listener before actions
        // reach this dispatcher; reaching here with Action: Login means the
        // session tried to re-authenticate mid-session, which this core
        // rejects uniformly.
        return vec![error_response(&action_id, "Already authenticated")];
    }

    if !session.is_authenticated() {
        return vec![error_response(&action_id, "Authentication required")];
    }

    if let Some(category) = spec.category {
        if !session.write_perm.read().contains(category) {
            return vec![error_response(&action_id, &format!("Permission denied: requires {category:?}"))];
        }
    }

    match action_name.to_ascii_lowercase().as_str() {
        "ping" => vec![ok_response(&action_id).push("Ping", "Pong")],
        "version" => vec![ok_response(&action_id)
            .push("Version", env!("CARGO_PKG_VERSION"))
            .push("Hostname", hostname())
            .push("Pid", std::process::id().to_string())],
        "listcommands" => vec![list_commands(&action_id)],
        "listcategories" => vec![list_categories(&action_id, session)],
        "events" => handle_events(ctx, session, request, &action_id),
        "logoff" => vec![ok_response(&action_id)],
        "hangup" => handle_hangup(ctx, request, &action_id).await,
        "status" => handle_status(ctx, request, &action_id),
        "setvar" => handle_setvar(ctx, request, &action_id).await,
        "getvar" => handle_getvar(ctx, request, &action_id).await,
        "redirect" => handle_redirect(ctx, request, &action_id).await,
        "originate" => handle_originate(ctx, request, &action_id, session).await,
        "command" => handle_command(&action_id),
        "complete" => vec![ok_response(&action_id)],
        "mailboxstatus" => handle_mailbox_status(ctx, request, &action_id).await,
        "mailboxcount" => handle_mailbox_count(ctx, request, &action_id).await,
        "extensionstate" => handle_extension_state(ctx, request, &action_id).await,
        "absolutetimeout" => handle_absolute_timeout(ctx, request, &action_id).await,
        "queueadd" => handle_queue_add(ctx, request, &action_id).await,
        "queueremove" => handle_queue_remove(ctx, request, &action_id).await,
        "queuepause" => handle_queue_pause(ctx, request, &action_id).await,
        "agentcallbacklogin" => handle_agent_callback_login(ctx, request, &action_id).await,
        "agentlogoff" => handle_agent_logoff(ctx, request, &action_id).await,
        _ => vec![error_response(&action_id, "Not implemented")],
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn ok_response(action_id: &Option<String>) -> Message {
    let mut msg = Message::new().push("Response", "Success");
    if let Some(id) = action_id {
        msg = msg.push("ActionID", id.clone());
    }
    msg
}

fn error_response(action_id: &Option<String>, message: &str) -> Message {
    let mut msg = Message::new().push("Response", "Error").push("Message", message);
    if let Some(id) = action_id {
        msg = msg.push("ActionID", id.clone());
    }
    msg
}

fn error_response_for(action_id: &Option<String>, err: &CoreError) -> Message {
    error_response(action_id, &err.to_string())
}

fn list_commands(action_id: &Option<String>) -> Message {
    let mut msg = ok_response(action_id);
    for action in KNOWN_ACTIONS {
        let privilege = action.category.map(|c| format!("{c:?}")).unwrap_or_else(|| "none".to_string());
        msg = msg.push(action.name, format!("{} ({})", action.synopsis, privilege));
    }
    msg
}

fn list_categories(action_id: &Option<String>, session: &ManagerSession) -> Message {
    let mut msg = ok_response(action_id);
    for name in session.read_perm.read().category_names() {
        msg = msg.push("Category", name);
    }
    msg
}

fn handle_events(
    _ctx: &ActionContext,
    session: &ManagerSession,
    request: &Message,
    action_id: &Option<String>,
) -> Vec<Message> {
    let on = request.get("EventMask").map(|v| v != "off").unwrap_or(true);
    *session.send_events.write() = if on { *session.read_perm.read() } else { super::events::CategoryMask::NONE };
    vec![ok_response(action_id)]
}

async fn handle_hangup(ctx: &ActionContext, request: &Message, action_id: &Option<String>) -> Vec<Message> {
    let Some(channel_id) = request.get("Channel") else {
        return vec![error_response(action_id, "Missing Channel")];
    };
    match ctx.channels.find(channel_id) {
        Some(channel) => match channel.hangup().await {
            Ok(()) => vec![ok_response(action_id)],
            Err(e) => vec![error_response_for(action_id, &e)],
        },
        None => vec![error_response_for(action_id, &CoreError::ChannelFailure {
            interface: channel_id.to_string(),
            reason: "no such channel".to_string(),
        })],
    }
}

fn handle_status(ctx: &ActionContext, request: &Message, action_id: &Option<String>) -> Vec<Message> {
    let target = request.get("Channel");
    let mut out = Vec::new();
    for name in ctx.queues.names() {
        let Some(queue_arc) = ctx.queues.get(&name) else { continue };
        let queue = queue_arc.read();
        for caller in &queue.callers {
            if let Some(target) = target {
                if caller.channel_id != target {
                    continue;
                }
            }
            out.push(
                Message::new()
                    .push("Event", "Status")
                    .push("Privilege", "call,all")
                    .push("Channel", caller.channel_id.clone())
                    .push("Queue", name.clone())
                    .push("Position", caller.position.to_string()),
            );
        }
    }
    out.push(
        Message::new().push("Event", "StatusComplete").push("Privilege", "call,all").push("Items", out.len().to_string()),
    );
    if let Some(id) = action_id {
        let last = out.len() - 1;
        out[last] = out[last].clone().push("ActionID", id.clone());
    }
    out
}

async fn handle_setvar(ctx: &ActionContext, request: &Message, action_id: &Option<String>) -> Vec<Message> {
    let (Some(channel_id), Some(var), Some(value)) = (request.get("Channel"), request.get("Variable"), request.get("Value"))
    else {
        return vec![error_response(action_id, "Missing Channel/Variable/Value")];
    };
    match ctx.channels.find(channel_id) {
        Some(channel) => match channel.set_variable(var, value).await {
            Ok(()) => vec![ok_response(action_id)],
            Err(e) => vec![error_response_for(action_id, &e)],
        },
        None => vec![error_response(action_id, "No such channel")],
    }
}

async fn handle_getvar(ctx: &ActionContext, request: &Message, action_id: &Option<String>) -> Vec<Message> {
    let (Some(channel_id), Some(var)) = (request.get("Channel"), request.get("Variable")) else {
        return vec![error_response(action_id, "Missing Channel/Variable")];
    };
    match ctx.channels.find(channel_id) {
        Some(channel) => match channel.get_variable(var).await {
            Ok(value) => vec![ok_response(action_id).push("Value", value.unwrap_or_default())],
            Err(e) => vec![error_response_for(action_id, &e)],
        },
        None => vec![error_response(action_id, "No such channel")],
    }
}

/// `spec.md` §4.3.5, `Redirect`: async-goto on one or two channels. The
/// second channel (`ExtraChannel`) is optional, matching the source's
/// "(context, exten, priority) on one or two channels".
async fn handle_redirect(ctx: &ActionContext, request: &Message, action_id: &Option<String>) -> Vec<Message> {
    let (Some(channel_id), Some(context), Some(exten)) =
        (request.get("Channel"), request.get("Context"), request.get("Exten"))
    else {
        return vec![error_response(action_id, "Missing Channel/Context/Exten")];
    };
    let priority = request.get("Priority").and_then(|v| v.parse::<u32>().ok()).unwrap_or(1);

    let Some(channel) = ctx.channels.find(channel_id) else {
        return vec![error_response_for(action_id, &CoreError::ChannelFailure {
            interface: channel_id.to_string(),
            reason: "no such channel".to_string(),
        })];
    };
    if let Err(e) = channel.goto(context, exten, priority).await {
        return vec![error_response_for(action_id, &e)];
    }

    if let Some(extra_id) = request.get("ExtraChannel") {
        let extra_context = request.get("ExtraContext").unwrap_or(context);
        let extra_exten = request.get("ExtraExten").unwrap_or(exten);
        let extra_priority = request.get("ExtraPriority").and_then(|v| v.parse::<u32>().ok()).unwrap_or(priority);
        match ctx.channels.find(extra_id) {
            Some(extra) => {
                if let Err(e) = extra.goto(extra_context, extra_exten, extra_priority).await {
                    return vec![error_response_for(action_id, &e)];
                }
            }
            None => {
                return vec![error_response_for(action_id, &CoreError::ChannelFailure {
                    interface: extra_id.to_string(),
                    reason: "no such channel".to_string(),
                })]
            }
        }
    }

    vec![ok_response(action_id)]
}

/// `spec.md` §4.3.5, `MailboxStatus`: query whether `Mailbox` has any
/// waiting messages.
async fn handle_mailbox_status(ctx: &ActionContext, request: &Message, action_id: &Option<String>) -> Vec<Message> {
    let Some(mailbox) = request.get("Mailbox") else {
        return vec![error_response(action_id, "Missing Mailbox")];
    };
    match ctx.voicemail.mailbox_status(mailbox).await {
        Ok(waiting) => vec![ok_response(action_id).push("Mailbox", mailbox).push("Waiting", if waiting { "1" } else { "0" })],
        Err(e) => vec![error_response_for(action_id, &e)],
    }
}

/// `spec.md` §4.3.5, `MailboxCount`: query new/old message counts for
/// `Mailbox`.
async fn handle_mailbox_count(ctx: &ActionContext, request: &Message, action_id: &Option<String>) -> Vec<Message> {
    let Some(mailbox) = request.get("Mailbox") else {
        return vec![error_response(action_id, "Missing Mailbox")];
    };
    match ctx.voicemail.mailbox_count(mailbox).await {
        Ok(counts) => vec![ok_response(action_id)
            .push("Mailbox", mailbox)
            .push("NewMessages", counts.new_messages.to_string())
            .push("OldMessages", counts.old_messages.to_string())],
        Err(e) => vec![error_response_for(action_id, &e)],
    }
}

/// `spec.md` §4.3.5, `ExtensionState`: query dial-plan hint/state for
/// `Exten`@`Context`.
async fn handle_extension_state(ctx: &ActionContext, request: &Message, action_id: &Option<String>) -> Vec<Message> {
    let (Some(exten), Some(context)) = (request.get("Exten"), request.get("Context")) else {
        return vec![error_response(action_id, "Missing Exten/Context")];
    };
    match ctx.extension_state.state_of(context, exten).await {
        Ok(state) => vec![ok_response(action_id)
            .push("Exten", exten)
            .push("Context", context)
            .push("Status", state.to_string())],
        Err(e) => vec![error_response_for(action_id, &e)],
    }
}

/// `spec.md` §4.3.5, `AbsoluteTimeout`: schedule hangup of `Channel` after
/// `Timeout` seconds.
async fn handle_absolute_timeout(ctx: &ActionContext, request: &Message, action_id: &Option<String>) -> Vec<Message> {
    let Some(channel_id) = request.get("Channel") else {
        return vec![error_response(action_id, "Missing Channel")];
    };
    let Some(timeout_secs) = request.get("Timeout").and_then(|v| v.parse::<u64>().ok()) else {
        return vec![error_response(action_id, "Missing or invalid Timeout")];
    };
    let Some(channel) = ctx.channels.find(channel_id) else {
        return vec![error_response_for(action_id, &CoreError::ChannelFailure {
            interface: channel_id.to_string(),
            reason: "no such channel".to_string(),
        })];
    };
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
        let _ = channel.hangup().await;
    });
    vec![ok_response(action_id)]
}

/// `spec.md` §4.3.6: originate a call, synchronously or as a background job
/// correlated by `ActionID`. The async form replies immediately and emits
/// `OriginateSuccess`/`OriginateFailure` from a spawned task once the
/// dial resolves, matching the "queue a background job and reply
/// immediately" requirement.
async fn handle_originate(
    ctx: &ActionContext,
    request: &Message,
    action_id: &Option<String>,
    session: &Arc<ManagerSession>,
) -> Vec<Message> {
    let Some(channel_spec) = request.get("Channel") else {
        return vec![error_response(action_id, "Missing Channel")];
    };
    let is_async = request.get("Async").map(|v| v.eq_ignore_ascii_case("true") || v == "1").unwrap_or(false);
    let timeout = request
        .get("Timeout")
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(30));

    if !is_async {
        return match ctx.originator.originate(channel_spec, timeout).await {
            Ok(_handle) => vec![ok_response(action_id)],
            Err(e) => vec![error_response_for(action_id, &e)],
        };
    }

    let originator = ctx.originator.clone();
    let channel_spec = channel_spec.to_string();
    let action_id_owned = action_id.clone();
    let session = session.clone();
    tokio::spawn(async move {
        let event = match originator.originate(&channel_spec, timeout).await {
            Ok(_handle) => originate_result_event(action_id_owned.as_deref(), &channel_spec, true, None),
            Err(e) => originate_result_event(action_id_owned.as_deref(), &channel_spec, false, Some(&e.to_string())),
        };
        session.enqueue(event);
    });

    vec![ok_response(action_id)]
}

fn handle_command(action_id: &Option<String>) -> Vec<Message> {
    // Real CLI command execution is out of this core's scope (`spec.md`
    // §1, "configuration file parsing" and dial-plan execution are
    // external); this returns the framing the wire protocol requires with
    // an empty body so clients can exercise the `Follows`/terminator
    // contract against this server.
    let mut msg = Message::new().push("Response", "Follows");
    if let Some(id) = action_id {
        msg = msg.push("ActionID", id.clone());
    }
    vec![msg, Message::new().push("Output", "--END COMMAND--")]
}

async fn handle_queue_add(ctx: &ActionContext, request: &Message, action_id: &Option<String>) -> Vec<Message> {
    let (Some(queue), Some(interface)) = (request.get("Queue"), request.get("Interface")) else {
        return vec![error_response(action_id, "Missing Queue/Interface")];
    };
    let penalty = request.get("Penalty").and_then(|v| v.parse().ok()).unwrap_or(0);
    match ctx.queues.add_dynamic_member(queue, interface, penalty).await {
        Ok(()) => vec![ok_response(action_id)],
        Err(e) => vec![error_response_for(action_id, &e)],
    }
}

async fn handle_queue_remove(ctx: &ActionContext, request: &Message, action_id: &Option<String>) -> Vec<Message> {
    let (Some(queue), Some(interface)) = (request.get("Queue"), request.get("Interface")) else {
        return vec![error_response(action_id, "Missing Queue/Interface")];
    };
    match ctx.queues.remove_member(queue, interface).await {
        Ok(()) => vec![ok_response(action_id)],
        Err(e) => vec![error_response_for(action_id, &e)],
    }
}

async fn handle_queue_pause(ctx: &ActionContext, request: &Message, action_id: &Option<String>) -> Vec<Message> {
    let (Some(queue), Some(interface)) = (request.get("Queue"), request.get("Interface")) else {
        return vec![error_response(action_id, "Missing Queue/Interface")];
    };
    let paused = request.get("Paused").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(true);
    match ctx.queues.set_paused(queue, interface, paused).await {
        Ok(()) => vec![ok_response(action_id)],
        Err(e) => vec![error_response_for(action_id, &e)],
    }
}

async fn handle_agent_callback_login(
    ctx: &ActionContext,
    request: &Message,
    action_id: &Option<String>,
) -> Vec<Message> {
    let Some(agent_id) = request.get("Agent") else {
        return vec![error_response(action_id, "Missing Agent")];
    };
    let login_channel = request.get("LoginChannel").unwrap_or_default();
    let caller_id = request.get("LoginCallerId").unwrap_or_default();
    let password = request.get("Password").unwrap_or_default();
    if let Err(e) = ctx.agents.authenticate(agent_id, password) {
        warn!(agent = agent_id, "AgentCallbackLogin rejected: bad password or too many attempts");
        return vec![error_response_for(action_id, &e)];
    }
    let now_ms = crate::queue::types::now_millis();
    match ctx.agents.callback_login(agent_id, login_channel, caller_id, now_ms).await {
        Ok(()) => {
            info!(agent = agent_id, "AgentCallbackLogin via manager action");
            vec![ok_response(action_id)]
        }
        Err(e) => vec![error_response_for(action_id, &e)],
    }
}

async fn handle_agent_logoff(ctx: &ActionContext, request: &Message, action_id: &Option<String>) -> Vec<Message> {
    let Some(agent_id) = request.get("Agent") else {
        return vec![error_response(action_id, "Missing Agent")];
    };
    match ctx.agents.logoff(agent_id, None).await {
        Ok(()) => vec![ok_response(action_id)],
        Err(e) => vec![error_response_for(action_id, &e)],
    }
}
