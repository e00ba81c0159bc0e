//! `cwqueued`: a minimal reference binary that wires the queue engine, agent
//! registry, and manager plane together behind a TCP manager listener, for
//! manual exercising against a real `Action:` client. Not part of the
//! library's public surface (SPEC_FULL.md §10).
//!
//! This binary backs every external collaborator with the in-memory
//! reference implementations from [`pbxq_core::testutil`]; a production
//! embedder supplies its own [`pbxq_core::external`] implementations and
//! does not use this binary at all.

use std::sync::Arc;

use clap::Parser;
use pbxq_core::config::{load_agents_conf, load_manager_conf, load_queues_conf};
use pbxq_core::manager::{ActionContext, CategoryMask, ListenerConfig, ManagerServer, ManagerUser, UserTable};
use pbxq_core::prelude::*;
use pbxq_core::testutil::{MockChannelLookup, MockExtensionStateLookup, MockOriginator, MockVoicemailLookup};

/// Run a standalone manager listener over an in-memory queue/agent core.
#[derive(Parser, Debug)]
#[command(name = "cwqueued", about = "Reference manager-plane listener for pbxq-core")]
struct Args {
    /// Address the manager plane's TCP listener binds to, used only when
    /// `--manager-conf` is not given or configures no `listen` entries.
    #[arg(long, default_value = "127.0.0.1:5038")]
    manager_bind: String,

    /// Username accepted by the reference listener when `--manager-conf`
    /// is not given (see also --secret).
    #[arg(long, default_value = "admin")]
    username: String,

    /// Plaintext secret for --username (`spec.md` §4.3.2).
    #[arg(long, default_value = "changeme")]
    secret: String,

    /// Path to a `queues.conf` to provision the queue registry from
    /// (`spec.md` §6).
    #[arg(long)]
    queues_conf: Option<std::path::PathBuf>,

    /// Path to an `agents.conf` to provision the agent registry from.
    #[arg(long)]
    agents_conf: Option<std::path::PathBuf>,

    /// Path to a `manager.conf`; when given, its `listen` entries and user
    /// table replace `--manager-bind`/`--username`/`--secret` entirely.
    #[arg(long)]
    manager_conf: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let args = Args::parse();

    let queues = Arc::new(QueueRegistry::new());
    let agents = Arc::new(AgentRegistry::new());

    if let Some(path) = &args.queues_conf {
        let text = std::fs::read_to_string(path)?;
        let (conf, warnings) = load_queues_conf(&text);
        for w in &warnings {
            tracing::warn!(section = %w.section, message = %w.message, "queues.conf");
        }
        conf.apply(&queues);
    }

    if let Some(path) = &args.agents_conf {
        let text = std::fs::read_to_string(path)?;
        let (conf, warnings) = load_agents_conf(&text);
        for w in &warnings {
            tracing::warn!(section = %w.section, message = %w.message, "agents.conf");
        }
        conf.apply(&agents);
    }

    let originator = Arc::new(MockOriginator::new());
    let channels = Arc::new(MockChannelLookup::new());
    let voicemail = Arc::new(MockVoicemailLookup::new());
    let extension_state = Arc::new(MockExtensionStateLookup::new());

    let ctx = ActionContext {
        queues: queues.clone(),
        agents: agents.clone(),
        originator,
        channels,
        voicemail,
        extension_state,
    };

    let (users, listeners) = match &args.manager_conf {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            let (conf, warnings) = load_manager_conf(&text);
            for w in &warnings {
                tracing::warn!(section = %w.section, message = %w.message, "manager.conf");
            }
            let mut users = UserTable::new();
            for entry in &conf.users {
                users.insert(entry.to_manager_user());
            }
            let listeners: Vec<ListenerConfig> = conf
                .general
                .listen
                .iter()
                .map(|l| {
                    let mut cfg = ListenerConfig::tcp(&l.target);
                    cfg.banner = l.banner.clone();
                    cfg.queue_size = conf.general.queuesize;
                    cfg
                })
                .collect();
            if listeners.is_empty() {
                (users, vec![ListenerConfig::tcp(args.manager_bind.clone())])
            } else {
                (users, listeners)
            }
        }
        None => {
            let mut users = UserTable::new();
            users.insert(ManagerUser {
                username: args.username.clone(),
                secret: args.secret.clone(),
                read_perm: CategoryMask::all(),
                write_perm: CategoryMask::all(),
                acl: Vec::new(),
            });
            (users, vec![ListenerConfig::tcp(args.manager_bind.clone())])
        }
    };

    tracing::info!(listeners = listeners.len(), "starting cwqueued reference manager listener");

    let server = Arc::new(ManagerServer::new(ctx, users));
    let mut handles = Vec::new();
    for listener in listeners {
        let server = server.clone();
        handles.push(tokio::spawn(async move { server.serve(listener).await }));
    }
    for handle in handles {
        handle.await??;
    }
    Ok(())
}
