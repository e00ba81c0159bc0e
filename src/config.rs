//! Configuration schema for `queues.conf`, `agents.conf`, and
//! `manager.conf` (`spec.md` §6, "Config files (abstract schema)").
//!
//! Parsing never aborts on a malformed field (`spec.md` §7,
//! "Configuration errors"): loaders collect a [`Vec<Warning>`] alongside
//! the parsed config and fall back to the field's default.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::agent::{AckCallMode, Agent, AgentRegistry};
use crate::queue::{AnnounceHoldTime, JoinEmptyPolicy, LeaveWhenEmptyPolicy, Member, QueueConfig, QueueRegistry, Strategy};

/// One configuration problem noticed at load time. Never fatal on its
/// own; the field that produced it keeps its default value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub section: String,
    pub message: String,
}

impl Warning {
    fn new(section: impl Into<String>, message: impl Into<String>) -> Self {
        Self { section: section.into(), message: message.into() }
    }
}

/// `queues.conf` `[general]` section.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueuesGeneral {
    #[serde(default)]
    pub persistentmembers: bool,
}

/// One `queues.conf` queue section: the engine's [`QueueConfig`] plus its
/// static `member =>` lines.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueueSection {
    #[serde(flatten)]
    pub config: QueueConfig,
    #[serde(default)]
    pub members: Vec<StaticMember>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticMember {
    pub interface: String,
    #[serde(default)]
    pub penalty: u32,
}

/// The full parsed `queues.conf` (`spec.md` §6).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueuesConf {
    #[serde(default)]
    pub general: QueuesGeneral,
    #[serde(default)]
    pub queues: HashMap<String, QueueSection>,
}

impl QueuesConf {
    /// Provision `registry` with every parsed queue and its static members
    /// (`spec.md` §6). Static definitions always take precedence over
    /// realtime ones of the same name, mirroring [`QueueRegistry::define_static_queue`].
    pub fn apply(&self, registry: &QueueRegistry) {
        for (name, section) in &self.queues {
            let queue = registry.define_static_queue(name, section.config.clone());
            let mut q = queue.write();
            for member in &section.members {
                q.members.push(Member::new(member.interface.clone(), member.penalty, false));
            }
        }
    }
}

/// `agents.conf` `[general]` section (`spec.md` §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsGeneral {
    #[serde(default)]
    pub persistentagents: bool,
    #[serde(default = "default_maxlogintries")]
    pub maxlogintries: u32,
    #[serde(default)]
    pub autologoff: u32,
    #[serde(default)]
    pub wrapuptime: u32,
    #[serde(default)]
    pub ackcall: AckCallMode,
    #[serde(default)]
    pub musiconhold: String,
    #[serde(default)]
    pub recordagentcalls: bool,
    #[serde(default)]
    pub goodbye: Option<String>,
}

fn default_maxlogintries() -> u32 {
    3
}

impl Default for AgentsGeneral {
    fn default() -> Self {
        Self {
            persistentagents: false,
            maxlogintries: default_maxlogintries(),
            autologoff: 0,
            wrapuptime: 0,
            ackcall: AckCallMode::default(),
            musiconhold: String::new(),
            recordagentcalls: false,
            goodbye: None,
        }
    }
}

/// One `[agents]` entry: `agent => id,password,name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    pub id: String,
    pub password: String,
    pub name: String,
}

/// The full parsed `agents.conf`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentsConf {
    #[serde(default)]
    pub general: AgentsGeneral,
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
}

impl AgentsConf {
    /// Register every parsed agent against `registry` with the `[general]`
    /// section's `ackcall`/`autologoff`/`wrapuptime`/`maxlogintries`
    /// defaults applied (`spec.md` §6).
    pub fn apply(&self, registry: &AgentRegistry) {
        for entry in &self.agents {
            let mut agent = Agent::new(entry.id.clone(), entry.password.clone(), entry.name.clone());
            agent.ack_call = self.general.ackcall;
            agent.auto_logoff_seconds = self.general.autologoff;
            agent.wrapup_ms = self.general.wrapuptime * 1000;
            agent.max_login_tries = self.general.maxlogintries;
            registry.register_static(agent);
        }
    }
}

/// One `listen` line in `manager.conf`'s `[general]` section
/// (`spec.md` §4.3.7, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenEntry {
    pub banner: String,
    /// Either `host:port` or a filesystem path to a Unix-domain socket.
    pub target: String,
}

/// `manager.conf` `[general]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerGeneral {
    #[serde(default)]
    pub listen: Vec<ListenEntry>,
    #[serde(default = "default_queue_size")]
    pub queuesize: usize,
    #[serde(default)]
    pub displayconnects: bool,
}

fn default_queue_size() -> usize {
    1024
}

impl Default for ManagerGeneral {
    fn default() -> Self {
        Self { listen: Vec::new(), queuesize: default_queue_size(), displayconnects: false }
    }
}

/// One `permit`/`deny` ACL rule from a `manager.conf` user section
/// (`spec.md` §6: "`permit/deny` ACL lines"), e.g.
/// `permit = "192.168.1.0/255.255.255.0"`. A bare address with no `/mask`
/// is treated as a single host (`/255.255.255.255`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclRule {
    pub allow: bool,
    pub network: Ipv4Addr,
    pub mask: Ipv4Addr,
}

impl AclRule {
    pub fn matches(&self, addr: Ipv4Addr) -> bool {
        let mask = u32::from(self.mask);
        u32::from(addr) & mask == u32::from(self.network) & mask
    }
}

fn parse_acl_line(allow: bool, raw: &str) -> Option<AclRule> {
    let mut parts = raw.splitn(2, '/');
    let network: Ipv4Addr = parts.next()?.trim().parse().ok()?;
    let mask: Ipv4Addr = match parts.next() {
        Some(m) => m.trim().parse().ok()?,
        None => Ipv4Addr::new(255, 255, 255, 255),
    };
    Some(AclRule { allow, network, mask })
}

/// Parse a user section's `permit`/`deny` lines into an ordered rule list
/// (`spec.md` §6). `permit` entries are evaluated before `deny` entries (the
/// TOML schema keeps the two as separate arrays rather than preserving
/// interleaved file order), last match wins; no matching rule means the
/// connection is allowed (an empty ACL grants every address, matching the
/// source's "no ACL configured = no restriction" default).
pub fn parse_acl(permit: &[String], deny: &[String]) -> Vec<AclRule> {
    let mut rules: Vec<AclRule> = Vec::new();
    for raw in permit {
        if let Some(rule) = parse_acl_line(true, raw) {
            rules.push(rule);
        }
    }
    for raw in deny {
        if let Some(rule) = parse_acl_line(false, raw) {
            rules.push(rule);
        }
    }
    rules
}

/// One `manager.conf` user section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerUserEntry {
    pub username: String,
    pub secret: String,
    #[serde(default)]
    pub read: String,
    #[serde(default)]
    pub write: String,
    #[serde(default)]
    pub permit: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// The full parsed `manager.conf`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ManagerConf {
    #[serde(default)]
    pub general: ManagerGeneral,
    #[serde(default)]
    pub users: Vec<ManagerUserEntry>,
}

impl ManagerUserEntry {
    /// Build the runtime [`crate::manager::ManagerUser`] this section
    /// describes: parse `read`/`write` category lists and `permit`/`deny`
    /// ACL lines (`spec.md` §6).
    pub fn to_manager_user(&self) -> crate::manager::ManagerUser {
        crate::manager::ManagerUser {
            username: self.username.clone(),
            secret: self.secret.clone(),
            read_perm: crate::manager::CategoryMask::parse(&self.read),
            write_perm: crate::manager::CategoryMask::parse(&self.write),
            acl: parse_acl(&self.permit, &self.deny),
        }
    }
}

/// Parse a TOML-encoded `queues.conf`. Unknown strategy names or
/// malformed numeric fields are reported as warnings rather than
/// rejecting the whole queue section (`spec.md` §7).
pub fn load_queues_conf(text: &str) -> (QueuesConf, Vec<Warning>) {
    let mut warnings = Vec::new();
    let conf: QueuesConf = match toml::from_str(text) {
        Ok(conf) => conf,
        Err(e) => {
            warnings.push(Warning::new("queues.conf", format!("failed to parse, using empty config: {e}")));
            QueuesConf::default()
        }
    };
    for (name, section) in &conf.queues {
        if matches!(section.config.strategy, Strategy::RoundRobinMemory) && section.members.is_empty() {
            warnings.push(Warning::new(name.clone(), "roundrobinmemo strategy configured with no static members"));
        }
        validate_policies(name, &section.config, &mut warnings);
    }
    (conf, warnings)
}

fn validate_policies(name: &str, config: &QueueConfig, warnings: &mut Vec<Warning>) {
    // `maxlen = 0` is a valid "unbounded" setting (`spec.md` §8 boundary
    // behavior), not a misconfiguration, so it is intentionally not
    // flagged here.
    if matches!(config.join_empty, JoinEmptyPolicy::Strict)
        && matches!(config.leave_when_empty, LeaveWhenEmptyPolicy::Never)
    {
        warnings.push(Warning::new(
            name,
            "joinempty=strict with leavewhenempty=never can strand callers indefinitely",
        ));
    }
    if matches!(config.announce_hold_time, AnnounceHoldTime::Always) && config.service_level_seconds == 0 {
        warnings.push(Warning::new(name, "announceholdtime enabled with servicelevel=0"));
    }
}

/// Parse a TOML-encoded `agents.conf`.
pub fn load_agents_conf(text: &str) -> (AgentsConf, Vec<Warning>) {
    let mut warnings = Vec::new();
    let conf: AgentsConf = match toml::from_str(text) {
        Ok(conf) => conf,
        Err(e) => {
            warnings.push(Warning::new("agents.conf", format!("failed to parse, using empty config: {e}")));
            AgentsConf::default()
        }
    };
    for agent in &conf.agents {
        if agent.password.is_empty() {
            warnings.push(Warning::new(agent.id.clone(), "agent has an empty password"));
        }
    }
    (conf, warnings)
}

/// Parse a TOML-encoded `manager.conf`.
pub fn load_manager_conf(text: &str) -> (ManagerConf, Vec<Warning>) {
    let mut warnings = Vec::new();
    let conf: ManagerConf = match toml::from_str(text) {
        Ok(conf) => conf,
        Err(e) => {
            warnings.push(Warning::new("manager.conf", format!("failed to parse, using empty config: {e}")));
            ManagerConf::default()
        }
    };
    if conf.general.listen.is_empty() {
        warnings.push(Warning::new("general", "no listen entries configured; manager plane will not accept connections"));
    }
    for user in &conf.users {
        if user.read.is_empty() && user.write.is_empty() {
            warnings.push(Warning::new(user.username.clone(), "user has no read or write categories granted"));
        }
    }
    (conf, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_queues_conf_parses_sections_and_static_members() {
        let text = r#"
[general]
persistentmembers = true

[queues.support]
strategy = "fewest_calls"

[[queues.support.members]]
interface = "SIP/1"
penalty = 2
"#;
        let (conf, warnings) = load_queues_conf(text);
        assert!(warnings.is_empty());
        assert!(conf.general.persistentmembers);
        let support = conf.queues.get("support").unwrap();
        assert_eq!(support.config.strategy, Strategy::FewestCalls);
        assert_eq!(support.members.len(), 1);
        assert_eq!(support.members[0].interface, "SIP/1");
    }

    #[test]
    fn load_queues_conf_falls_back_to_empty_config_on_parse_error() {
        let (conf, warnings) = load_queues_conf("this is not valid toml {{{");
        assert!(conf.queues.is_empty());
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].section, "queues.conf");
    }

    #[test]
    fn load_queues_conf_warns_on_roundrobinmemo_with_no_static_members() {
        let text = r#"
[queues.support]
strategy = "round_robin_memory"
"#;
        let (_conf, warnings) = load_queues_conf(text);
        assert!(warnings.iter().any(|w| w.message.contains("no static members")));
    }

    #[test]
    fn load_queues_conf_warns_on_strict_joinempty_with_never_leavewhenempty() {
        let text = r#"
[queues.support]
joinempty = "strict"
leavewhenempty = "never"
"#;
        let (_conf, warnings) = load_queues_conf(text);
        assert!(warnings.iter().any(|w| w.message.contains("strand callers")));
    }

    #[test]
    fn load_queues_conf_does_not_warn_on_maxlen_zero() {
        let text = r#"
[queues.support]
maxlen = 0
"#;
        let (_conf, warnings) = load_queues_conf(text);
        assert!(warnings.is_empty());
    }

    #[test]
    fn load_agents_conf_warns_on_empty_password() {
        let text = r#"
[[agents]]
id = "100"
password = ""
name = "Alice"
"#;
        let (conf, warnings) = load_agents_conf(text);
        assert_eq!(conf.agents.len(), 1);
        assert_eq!(conf.general.maxlogintries, 3);
        assert!(warnings.iter().any(|w| w.message.contains("empty password")));
    }

    #[test]
    fn load_manager_conf_warns_on_no_listeners_and_underprivileged_users() {
        let text = r#"
[[users]]
username = "admin"
secret = "changeme"
"#;
        let (conf, warnings) = load_manager_conf(text);
        assert_eq!(conf.users.len(), 1);
        assert!(warnings.iter().any(|w| w.message.contains("no listen entries")));
        assert!(warnings.iter().any(|w| w.message.contains("no read or write")));
    }

    #[test]
    fn manager_user_entry_parses_categories_and_acl() {
        let entry = ManagerUserEntry {
            username: "admin".to_string(),
            secret: "s3cret".to_string(),
            read: "system,call".to_string(),
            write: "call".to_string(),
            permit: vec!["10.0.0.0/255.255.255.0".to_string()],
            deny: vec!["10.0.0.5".to_string()],
        };
        let user = entry.to_manager_user();
        assert!(user.read_perm.contains(crate::manager::Category::System));
        assert!(!user.write_perm.contains(crate::manager::Category::System));
        assert!(user.allows(Some("10.0.0.1".parse().unwrap())));
        assert!(!user.allows(Some("10.0.0.5".parse().unwrap())));
        // No rule matches 192.168.1.1: an unmatched address is allowed
        // (`spec.md` §6, "no ACL configured = no restriction" default).
        assert!(user.allows(Some("192.168.1.1".parse().unwrap())));
    }

    #[test]
    fn queues_conf_apply_provisions_static_queues_and_members() {
        let text = r#"
[queues.support]
strategy = "fewest_calls"

[[queues.support.members]]
interface = "SIP/1"
penalty = 2
"#;
        let (conf, _warnings) = load_queues_conf(text);
        let registry = QueueRegistry::new();
        conf.apply(&registry);

        assert!(registry.is_static("support"));
        let queue = registry.get("support").unwrap();
        let q = queue.read();
        assert_eq!(q.members.len(), 1);
        assert_eq!(q.members[0].interface, "SIP/1");
        assert_eq!(q.members[0].penalty, 2);
    }

    #[test]
    fn agents_conf_apply_registers_agents_with_general_defaults() {
        let text = r#"
[general]
autologoff = 30
ackcall = "required"

[[agents]]
id = "100"
password = "secret"
name = "Alice"
"#;
        let (conf, _warnings) = load_agents_conf(text);
        let registry = AgentRegistry::new();
        conf.apply(&registry);

        assert!(registry.exists("100"));
        let handle = registry.get("100").unwrap();
        let a = handle.data.lock();
        assert_eq!(a.auto_logoff_seconds, 30);
        assert_eq!(a.ack_call, crate::agent::AckCallMode::Required);
        assert_eq!(a.max_login_tries, 3);
    }

    #[test]
    fn load_manager_conf_accepts_a_listen_entry() {
        let text = r#"
[general]
queuesize = 2048

[[general.listen]]
banner = "Asterisk Call Manager/1.3"
target = "0.0.0.0:5038"
"#;
        let (conf, warnings) = load_manager_conf(text);
        assert_eq!(conf.general.queuesize, 2048);
        assert_eq!(conf.general.listen.len(), 1);
        assert!(!warnings.iter().any(|w| w.message.contains("no listen entries")));
    }
}
