//! The queue registry: lookup-by-name, join/leave, member administration,
//! weight arbitration, and lifecycle (`spec.md` §4.1.1, §4.1.2, §4.1.6,
//! §9 "Global mutable registries").

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::{CoreError, Result};
use crate::external::{PersistentStore, RealtimeLookup};

use super::events::QueueEvent;
use super::persistence;
use super::realtime;
use super::types::{Caller, JoinEmptyPolicy, LeaveWhenEmptyPolicy, Member, MemberStatusSummary, Queue, QueueConfig};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Outcome of a successful join (`spec.md` §4.1.1).
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub position: usize,
    pub count: usize,
}

/// Central, name-keyed registry of live queues. Held behind `Arc` so the
/// manager plane, the queue application, and background reconciliation
/// tasks can all share one instance; per-queue mutation is guarded by a
/// `parking_lot::RwLock` around each `Queue`, never by a lock over the
/// whole map (`spec.md` §5, "Global queue-registry lock ... never held
/// across channel I/O").
pub struct QueueRegistry {
    queues: DashMap<String, Arc<RwLock<Queue>>>,
    static_names: RwLock<HashSet<String>>,
    events_tx: broadcast::Sender<QueueEvent>,
    store: Option<Arc<dyn PersistentStore>>,
    realtime: Option<Arc<dyn RealtimeLookup>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        let (events_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            queues: DashMap::new(),
            static_names: RwLock::new(HashSet::new()),
            events_tx,
            store: None,
            realtime: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_realtime(mut self, realtime: Arc<dyn RealtimeLookup>) -> Self {
        self.realtime = Some(realtime);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events_tx.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        // Lazy fan-out (`spec.md` §4.3.4): a send with no receivers is a
        // cheap no-op, so construction cost here is already minimal.
        let _ = self.events_tx.send(event);
    }

    fn key(name: &str) -> String {
        name.to_ascii_lowercase()
    }

    /// Define a queue from static configuration. Static definitions always
    /// take precedence over realtime ones of the same name (`spec.md`
    /// §4.1.11, last paragraph).
    pub fn define_static_queue(&self, name: &str, config: QueueConfig) -> Arc<RwLock<Queue>> {
        let key = Self::key(name);
        self.static_names.write().insert(key.clone());
        let queue = Arc::new(RwLock::new(Queue::new(name, config)));
        self.queues.insert(key, queue.clone());
        queue
    }

    pub fn is_static(&self, name: &str) -> bool {
        self.static_names.read().contains(&Self::key(name))
    }

    pub fn get(&self, name: &str) -> Option<Arc<RwLock<Queue>>> {
        self.queues.get(&Self::key(name)).map(|q| q.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.queues.iter().map(|e| e.value().read().name.clone()).collect()
    }

    /// Remove a queue from the registry outright (used once a dead queue's
    /// last caller has left, `spec.md` §4.1.2).
    fn remove(&self, name: &str) {
        self.queues.remove(&Self::key(name));
        self.emit(QueueEvent::QueueDestroyed { queue: name.to_string() });
    }

    /// §4.1.1: join a queue by name, creating it from a realtime
    /// definition if necessary and absent from static config.
    pub async fn join(
        &self,
        queue_name: &str,
        channel_id: &str,
        priority: i32,
        timeout_ms: i64,
        now_ms: i64,
    ) -> Result<JoinOutcome> {
        let queue_arc = match self.get(queue_name) {
            Some(q) => q,
            None => {
                let realtime = self
                    .realtime
                    .as_ref()
                    .ok_or_else(|| CoreError::NoSuchQueue(queue_name.to_string()))?;
                if realtime.lookup_queue(queue_name).await?.is_none() {
                    return Err(CoreError::NoSuchQueue(queue_name.to_string()));
                }
                let mut q = Queue::new(queue_name, QueueConfig::default());
                q.realtime = true;
                realtime::reconcile_queue(realtime.as_ref(), &mut q).await?;
                let arc = Arc::new(RwLock::new(q));
                self.queues.insert(Self::key(queue_name), arc.clone());
                arc
            }
        };

        // Realtime reconciliation on every join for realtime-backed queues
        // not shadowed by static config (`spec.md` §4.1.11).
        if !self.is_static(queue_name) {
            if let Some(realtime) = &self.realtime {
                if queue_arc.read().realtime {
                    // Open question (`spec.md` §9): if reconciliation marks
                    // the queue dead mid-join, the source still inserts the
                    // caller. We preserve that behavior here.
                    let mut q = queue_arc.write();
                    realtime::reconcile_queue(realtime.as_ref(), &mut q).await?;
                }
            }
        }

        let mut queue = queue_arc.write();

        let summary = queue.member_status_summary();
        match queue.config.join_empty {
            JoinEmptyPolicy::Normal if summary == MemberStatusSummary::NoMembers => {
                return Err(CoreError::JoinEmpty(queue_name.to_string()));
            }
            JoinEmptyPolicy::Strict
                if matches!(
                    summary,
                    MemberStatusSummary::NoMembers | MemberStatusSummary::NoReachableMembers
                ) =>
            {
                return Err(CoreError::JoinUnavail(queue_name.to_string()));
            }
            _ => {}
        }

        if queue.is_full() {
            return Err(CoreError::Full(queue_name.to_string()));
        }

        let mut caller = Caller::new(channel_id, priority, timeout_ms, now_ms);
        caller.moh_class = queue.config.music_on_hold_class.clone();
        caller.exit_context = queue.config.exit_context.clone();

        // Stable insertion: all callers with strictly greater priority
        // precede; equal-or-lesser priority follow in arrival order
        // (`spec.md` §4.1.1, §8 invariant 2).
        let insert_at = queue
            .callers
            .iter()
            .position(|existing| existing.priority < caller.priority)
            .unwrap_or(queue.callers.len());

        caller.original_position = insert_at + 1;
        queue.callers.insert(insert_at, caller);
        queue.renumber();

        let position = queue.callers[insert_at].position;
        let count = queue.callers.len();

        info!(queue = queue_name, channel_id, position, count, "caller joined");
        self.emit(QueueEvent::Join {
            queue: queue_name.to_string(),
            channel_id: channel_id.to_string(),
            position,
            count,
        });

        Ok(JoinOutcome { position, count })
    }

    /// §4.1.2: remove a caller from a queue, renumber, and destroy the
    /// queue if it was marked dead and is now empty.
    pub fn leave(&self, queue_name: &str, channel_id: &str) -> Result<usize> {
        let queue_arc = self.get(queue_name).ok_or_else(|| CoreError::NoSuchQueue(queue_name.to_string()))?;

        let (count, dead) = {
            let mut queue = queue_arc.write();
            let before = queue.callers.len();
            queue.callers.retain(|c| c.channel_id != channel_id);
            if queue.callers.len() == before {
                warn!(queue = queue_name, channel_id, "leave: caller not present");
            }
            queue.renumber();
            (queue.callers.len(), queue.dead)
        };

        info!(queue = queue_name, channel_id, count, "caller left");
        self.emit(QueueEvent::Leave {
            queue: queue_name.to_string(),
            channel_id: channel_id.to_string(),
            count,
        });

        if dead && count == 0 {
            self.remove(queue_name);
        }

        Ok(count)
    }

    /// Emit a `CallerExit` event (`spec.md` §4.1.8). Called by the queue
    /// application once it has removed the caller via [`Self::leave`].
    pub fn emit_caller_exit(&self, queue_name: &str, channel_id: &str, reason: super::types::ExitReason) {
        self.emit(QueueEvent::CallerExit {
            queue: queue_name.to_string(),
            channel_id: channel_id.to_string(),
            reason,
        });
    }

    /// `spec.md` §4.1.6: suppress ringing `interface` for `queue_name` if
    /// any other queue with waiting callers, containing the same member,
    /// has a strictly greater weight.
    pub fn is_weight_suppressed(&self, queue_name: &str, interface: &str) -> bool {
        let this_weight = match self.get(queue_name) {
            Some(q) => q.read().config.weight,
            None => return false,
        };

        for entry in self.queues.iter() {
            if entry.key() == &Self::key(queue_name) {
                continue;
            }
            let other = entry.value().read();
            if other.config.weight <= this_weight {
                continue;
            }
            if other.callers.is_empty() {
                continue;
            }
            if other.find_member(interface).is_some() {
                return true;
            }
        }
        false
    }

    /// Update the smoothed hold-time estimator from the queue-wait sample
    /// (`join_time_ms` to `bridge_time_ms`) and start the member's wrap-up
    /// window at `hangup_time_ms`, the moment the bridge actually tore down
    /// (`spec.md` §4.1.4, §4.1.7). The two timestamps anchor different
    /// things: hold time measures how long the caller waited before being
    /// answered; wrap-up measures how long the member gets to recover after
    /// the call ends, so it must not start ticking until the call is over.
    pub async fn record_completed_call(
        &self,
        queue_name: &str,
        interface: &str,
        join_time_ms: i64,
        bridge_time_ms: i64,
        hangup_time_ms: i64,
    ) -> Result<()> {
        let queue_arc = self.get(queue_name).ok_or_else(|| CoreError::NoSuchQueue(queue_name.to_string()))?;
        {
            let mut queue = queue_arc.write();
            let sample_ms = bridge_time_ms - join_time_ms;
            queue.hold_time.update(sample_ms);
            if sample_ms <= queue.config.service_level_seconds as i64 * 1000 {
                queue.counters.calls_completed_in_sl += 1;
            }
            queue.counters.calls_completed += 1;

            if let Some(member) = queue.find_member_mut(interface) {
                member.last_call_ms = hangup_time_ms;
                member.calls_taken += 1;
            }
        }
        Ok(())
    }

    pub fn record_abandoned_call(&self, queue_name: &str) -> Result<()> {
        let queue_arc = self.get(queue_name).ok_or_else(|| CoreError::NoSuchQueue(queue_name.to_string()))?;
        queue_arc.write().counters.calls_abandoned += 1;
        Ok(())
    }

    /// Add a dynamic member (`spec.md` §4.1.10) and persist the updated
    /// record if a store is configured.
    pub async fn add_dynamic_member(&self, queue_name: &str, interface: &str, penalty: u32) -> Result<()> {
        let queue_arc = self.get(queue_name).ok_or_else(|| CoreError::NoSuchQueue(queue_name.to_string()))?;
        {
            let mut queue = queue_arc.write();
            if queue.find_member(interface).is_none() {
                queue.members.push(Member::new(interface, penalty, true));
            }
        }
        self.persist_members(queue_name, &queue_arc).await?;
        self.emit(QueueEvent::MemberAdded {
            queue: queue_name.to_string(),
            interface: interface.to_string(),
            penalty,
            dynamic: true,
        });
        Ok(())
    }

    pub async fn remove_member(&self, queue_name: &str, interface: &str) -> Result<()> {
        let queue_arc = self.get(queue_name).ok_or_else(|| CoreError::NoSuchQueue(queue_name.to_string()))?;
        {
            let mut queue = queue_arc.write();
            let before = queue.members.len();
            queue.members.retain(|m| m.interface != interface);
            if queue.members.len() == before {
                return Err(CoreError::NoSuchMember {
                    queue: queue_name.to_string(),
                    interface: interface.to_string(),
                });
            }
        }
        self.persist_members(queue_name, &queue_arc).await?;
        self.emit(QueueEvent::MemberRemoved {
            queue: queue_name.to_string(),
            interface: interface.to_string(),
        });
        Ok(())
    }

    pub async fn set_paused(&self, queue_name: &str, interface: &str, paused: bool) -> Result<()> {
        let queue_arc = self.get(queue_name).ok_or_else(|| CoreError::NoSuchQueue(queue_name.to_string()))?;
        {
            let mut queue = queue_arc.write();
            let member = queue
                .find_member_mut(interface)
                .ok_or_else(|| CoreError::NoSuchMember {
                    queue: queue_name.to_string(),
                    interface: interface.to_string(),
                })?;
            member.paused = paused;
        }
        self.persist_members(queue_name, &queue_arc).await?;
        self.emit(QueueEvent::MemberPaused {
            queue: queue_name.to_string(),
            interface: interface.to_string(),
            paused,
        });
        Ok(())
    }

    async fn persist_members(&self, queue_name: &str, queue_arc: &Arc<RwLock<Queue>>) -> Result<()> {
        if let Some(store) = &self.store {
            let members = queue_arc.read().members.clone();
            persistence::sync_record(store.as_ref(), queue_name, &members).await?;
        }
        Ok(())
    }

    /// Replay persisted dynamic members on startup (`spec.md` §4.1.10).
    /// Records naming a queue that no longer exists are deleted.
    pub async fn replay_persisted_members(&self) -> Result<()> {
        let Some(store) = self.store.clone() else { return Ok(()) };
        let records = persistence::load_all(store.as_ref()).await?;
        for (queue_name, tuples) in records {
            if self.get(&queue_name).is_none() {
                store.delete(persistence::FAMILY, &queue_name).await?;
                continue;
            }
            for (interface, penalty, paused) in tuples {
                self.add_dynamic_member(&queue_name, &interface, penalty).await?;
                if paused {
                    self.set_paused(&queue_name, &interface, true).await?;
                }
            }
        }
        Ok(())
    }
}

impl Default for QueueRegistry {
    fn default() -> Self {
        Self::new()
    }
}
