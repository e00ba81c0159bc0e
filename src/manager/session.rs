//! Manager session model: permission masks, authentication, and the
//! bounded outgoing queue that backs one connection (`spec.md` §3, "Manager
//! session"; §4.3.2, §4.3.3).

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::config::AclRule;

use super::events::CategoryMask;
use super::message::Message;

pub const DEFAULT_QUEUE_SIZE: usize = 1024;

/// A registered manager user, as loaded from `manager.conf` (`spec.md` §6).
#[derive(Debug, Clone, Default)]
pub struct ManagerUser {
    pub username: String,
    pub secret: String,
    pub read_perm: CategoryMask,
    pub write_perm: CategoryMask,
    pub acl: Vec<AclRule>,
}

impl ManagerUser {
    /// `spec.md` §6, `permit`/`deny` ACL lines: whether a connection from
    /// `addr` may even attempt to log in as this user. An unparseable or
    /// absent address (e.g. a Unix-domain peer) is always allowed — the ACL
    /// only restricts IPv4 TCP peers.
    pub fn allows(&self, addr: Option<Ipv4Addr>) -> bool {
        let Some(addr) = addr else { return true };
        let mut allowed = true;
        for rule in &self.acl {
            if rule.matches(addr) {
                allowed = rule.allow;
            }
        }
        allowed
    }
}

/// One connected manager client (`spec.md` §3, "Manager session").
///
/// The outgoing queue is a bounded `tokio::sync::mpsc` channel consumed by a
/// single writer task (`spec.md` §4.3.3); this is the async analogue of the
/// source's "bounded ring buffer drained by a writer thread" (§9,
/// "Background work").
pub struct ManagerSession {
    pub id: Uuid,
    pub remote_addr: String,
    pub username: parking_lot::RwLock<String>,
    pub read_perm: parking_lot::RwLock<CategoryMask>,
    pub write_perm: parking_lot::RwLock<CategoryMask>,
    pub send_events: parking_lot::RwLock<CategoryMask>,
    pub authenticated: AtomicBool,
    pub challenge: parking_lot::RwLock<Option<String>>,
    outgoing_tx: mpsc::Sender<Message>,
    outgoing_rx: parking_lot::Mutex<Option<mpsc::Receiver<Message>>>,
    q_max: AtomicU64,
    q_overflow: AtomicU64,
    queue_size: usize,
}

impl ManagerSession {
    pub fn new(remote_addr: impl Into<String>, queue_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        Self {
            id: Uuid::new_v4(),
            remote_addr: remote_addr.into(),
            username: parking_lot::RwLock::new(String::new()),
            read_perm: parking_lot::RwLock::new(CategoryMask::NONE),
            write_perm: parking_lot::RwLock::new(CategoryMask::NONE),
            send_events: parking_lot::RwLock::new(CategoryMask::NONE),
            authenticated: AtomicBool::new(false),
            challenge: parking_lot::RwLock::new(None),
            outgoing_tx: tx,
            outgoing_rx: parking_lot::Mutex::new(Some(rx)),
            q_max: AtomicU64::new(0),
            q_overflow: AtomicU64::new(0),
            queue_size,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// `Action: Challenge` (`spec.md` §4.3.2): issue and remember a fresh
    /// MD5 challenge string.
    pub fn issue_challenge(&self) -> String {
        let challenge = Uuid::new_v4().simple().to_string();
        *self.challenge.write() = Some(challenge.clone());
        challenge
    }

    /// Authenticate with a plaintext secret.
    pub fn authenticate_plaintext(&self, user: &ManagerUser, secret: &str) -> bool {
        if user.secret == secret {
            self.complete_login(user);
            true
        } else {
            false
        }
    }

    /// Authenticate with `Key = MD5(challenge || secret)` against a
    /// previously issued challenge (`spec.md` §4.3.2).
    pub fn authenticate_md5(&self, user: &ManagerUser, key: &str) -> bool {
        let Some(challenge) = self.challenge.read().clone() else {
            return false;
        };
        let expected = format!("{:x}", md5::compute(format!("{}{}", challenge, user.secret)));
        if expected.eq_ignore_ascii_case(key) {
            self.complete_login(user);
            true
        } else {
            false
        }
    }

    fn complete_login(&self, user: &ManagerUser) {
        *self.username.write() = user.username.clone();
        *self.read_perm.write() = user.read_perm;
        *self.write_perm.write() = user.write_perm;
        self.authenticated.store(true, Ordering::SeqCst);
    }

    /// Enqueue an outgoing message (response or event). On a full queue,
    /// increments the overflow counter and drops the message — the
    /// source's "counter-then-drop with no silent loss" rule (`spec.md`
    /// §9, Open Questions). Responses are critical (the caller should treat
    /// a `false` return as grounds to close the session); events are not.
    pub fn enqueue(&self, message: Message) -> bool {
        match self.outgoing_tx.try_send(message) {
            Ok(()) => {
                let depth = self.queue_size - self.outgoing_tx.capacity();
                self.q_max.fetch_max(depth as u64, Ordering::SeqCst);
                true
            }
            Err(_) => {
                self.q_overflow.fetch_add(1, Ordering::SeqCst);
                warn!(session = %self.id, "manager session outgoing queue overflowed, dropping message");
                false
            }
        }
    }

    /// Take the receiving half for the writer task to drain. Returns `None`
    /// if already taken (a session's writer task may only be spawned once).
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<Message>> {
        self.outgoing_rx.lock().take()
    }

    pub fn q_max(&self) -> u64 {
        self.q_max.load(Ordering::SeqCst)
    }

    pub fn q_overflow(&self) -> u64 {
        self.q_overflow.load(Ordering::SeqCst)
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> ManagerUser {
        ManagerUser {
            username: "admin".into(),
            secret: "swordfish".into(),
            read_perm: CategoryMask::all(),
            write_perm: CategoryMask::all(),
            acl: Vec::new(),
        }
    }

    #[test]
    fn allows_defaults_to_permit_with_no_acl_rules() {
        assert!(user().allows(Some("203.0.113.7".parse().unwrap())));
        assert!(user().allows(None));
    }

    #[test]
    fn allows_honors_last_matching_rule() {
        let mut u = user();
        u.acl = crate::config::parse_acl(
            &["192.168.1.0/255.255.255.0".to_string()],
            &["192.168.1.50/255.255.255.255".to_string()],
        );
        assert!(u.allows(Some("192.168.1.10".parse().unwrap())));
        assert!(!u.allows(Some("192.168.1.50".parse().unwrap())));
        assert!(u.allows(Some("10.0.0.1".parse().unwrap())));
    }

    #[test]
    fn plaintext_auth_succeeds_with_correct_secret() {
        let session = ManagerSession::new("127.0.0.1:5555", DEFAULT_QUEUE_SIZE);
        assert!(session.authenticate_plaintext(&user(), "swordfish"));
        assert!(session.is_authenticated());
    }

    #[test]
    fn plaintext_auth_fails_with_wrong_secret() {
        let session = ManagerSession::new("127.0.0.1:5555", DEFAULT_QUEUE_SIZE);
        assert!(!session.authenticate_plaintext(&user(), "wrong"));
        assert!(!session.is_authenticated());
    }

    #[test]
    fn md5_auth_matches_challenge_hash() {
        let session = ManagerSession::new("127.0.0.1:5555", DEFAULT_QUEUE_SIZE);
        let challenge = session.issue_challenge();
        let key = format!("{:x}", md5::compute(format!("{}{}", challenge, user().secret)));
        assert!(session.authenticate_md5(&user(), &key));
    }

    #[test]
    fn overflow_increments_counter_and_drops() {
        let session = ManagerSession::new("127.0.0.1:5555", 1);
        assert!(session.enqueue(Message::new().push("Event", "A")));
        assert!(!session.enqueue(Message::new().push("Event", "B")));
        assert_eq!(session.q_overflow(), 1);
    }
}
