//! The queue application: the entry point binding a caller's channel to a
//! queue for the duration of one call attempt (`spec.md` §2, "Queue
//! application"; §4.1.3, §4.1.5–§4.1.9).
//!
//! This module assumes the caller has already been inserted via
//! [`QueueRegistry::join`]; [`serve_caller`] drives it through
//! announce/offer/bridge/exit and removes it via [`QueueRegistry::leave`] on
//! every exit path, mirroring the source's single pbx-thread suspension
//! points (`spec.md` §5).

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::time::sleep;
use tracing::{info, info_span, Instrument};

use crate::error::{CoreError, Result};
use crate::external::{ChannelHandle, DialOutcome, ExtensionMatcher};

use super::announce::{self, AnnounceAction};
use super::registry::QueueRegistry;
use super::strategy::{self};
use super::types::{ExitReason, LeaveWhenEmptyPolicy, MemberStatusSummary, Queue, SelectionMode, Strategy};

/// §5, "Suspension points": the queue application polls its turn every
/// `RECHECK` second.
const RECHECK_MS: u64 = 1000;
const DEFAULT_ATTEMPT_TIMEOUT_SECS: u32 = 15;
const DEFAULT_RETRY_SECS: u32 = 5;

/// Drive one caller through its full lifecycle in `queue_name`. `now_ms` is
/// called to read the current time at every decision point so tests can
/// supply a controllable clock rather than sleeping real wall-clock time.
pub async fn serve_caller<F>(
    registry: &QueueRegistry,
    queue_name: &str,
    channel: &dyn ChannelHandle,
    matcher: &dyn ExtensionMatcher,
    now_ms: F,
) -> Result<ExitReason>
where
    F: Fn() -> i64,
{
    let span = info_span!("queue", queue = %queue_name, channel = channel.id());
    async {
        let reason = run(registry, queue_name, channel, matcher, &now_ms).await?;
        let _ = registry.leave(queue_name, channel.id());
        channel.set_variable("QUEUESTATUS", reason.queue_status()).await.ok();
        registry.emit_caller_exit(queue_name, channel.id(), reason);
        info!(reason = ?reason, "caller exited queue");
        Ok(reason)
    }
    .instrument(span)
    .await
}

async fn run<F: Fn() -> i64>(
    registry: &QueueRegistry,
    queue_name: &str,
    channel: &dyn ChannelHandle,
    matcher: &dyn ExtensionMatcher,
    now_ms: &F,
) -> Result<ExitReason> {
    loop {
        let queue_arc = registry
            .get(queue_name)
            .ok_or_else(|| CoreError::NoSuchQueue(queue_name.to_string()))?;

        if let Some(exit) = check_terminal_conditions(&queue_arc, channel, now_ms()) {
            return Ok(exit);
        }

        // Position/periodic announcements tick for every waiting caller
        // regardless of queue position (`spec.md` §4.1.3: "Announcing is
        // re-entrant on each announcement tick"), but only the head of the
        // queue is offered to members unless `autofill` lets later callers
        // be offered concurrently too (`SPEC_FULL.md` §3, "autofill").
        run_announcement_tick(&queue_arc, channel, matcher, now_ms()).await?;

        if exit_with_key_pending(&queue_arc, channel.id(), matcher) {
            return Ok(ExitReason::ExitWithKey);
        }

        let is_head = queue_arc
            .read()
            .callers
            .front()
            .map(|c| c.channel_id == channel.id())
            .unwrap_or(false);
        let autofill = queue_arc.read().config.autofill;

        if is_head || autofill {
            if let Some(exit) = attempt_ring_cycle(registry, queue_name, &queue_arc, channel, now_ms).await? {
                return Ok(exit);
            }
        }

        sleep(Duration::from_millis(RECHECK_MS)).await;
    }
}

/// Overall expiry and leave-when-empty, evaluated before every wait tick
/// (`spec.md` §4.1.8, boundary behaviors in §8).
fn check_terminal_conditions(
    queue_arc: &Arc<RwLock<Queue>>,
    channel: &dyn ChannelHandle,
    now_ms: i64,
) -> Option<ExitReason> {
    let queue = queue_arc.read();
    let caller = queue.callers.iter().find(|c| c.channel_id == channel.id())?;

    if caller.has_expired(now_ms) {
        return Some(ExitReason::Timeout);
    }

    match queue.config.leave_when_empty {
        LeaveWhenEmptyPolicy::Normal if queue.member_status_summary() == MemberStatusSummary::NoMembers => {
            Some(ExitReason::LeaveEmpty)
        }
        LeaveWhenEmptyPolicy::Strict
            if matches!(
                queue.member_status_summary(),
                MemberStatusSummary::NoMembers | MemberStatusSummary::NoReachableMembers
            ) =>
        {
            Some(ExitReason::LeaveUnavail)
        }
        _ => None,
    }
}

async fn run_announcement_tick(
    queue_arc: &Arc<RwLock<Queue>>,
    channel: &dyn ChannelHandle,
    _matcher: &dyn ExtensionMatcher,
    now_ms: i64,
) -> Result<()> {
    // Take a snapshot of the caller and the queue fields the announcement
    // functions read, then release the lock before the (potentially slow)
    // channel I/O, re-acquiring it only to write back the caller's
    // bookkeeping fields (`spec.md` §5: per-queue lock is not held across
    // channel I/O for this sequence, unlike join/leave).
    let (action, mut caller_snapshot, queue_snapshot) = {
        let queue = queue_arc.read();
        let Some(caller) = queue.callers.iter().find(|c| c.channel_id == channel.id()) else {
            return Ok(());
        };
        let action = announce::due_action(caller, &queue, now_ms);
        if action == AnnounceAction::None {
            return Ok(());
        }
        announce::debug_log_tick(caller, action);
        (action, caller.clone(), snapshot_for_announce(&queue))
    };

    let digit = match action {
        AnnounceAction::Position => {
            announce::play_position_announcement(&mut caller_snapshot, &queue_snapshot, now_ms, channel).await?
        }
        AnnounceAction::Periodic => announce::play_periodic_announcement(&mut caller_snapshot, now_ms, channel).await?,
        AnnounceAction::None => None,
    };
    let _ = digit;

    let mut queue = queue_arc.write();
    if let Some(caller) = queue.callers.iter_mut().find(|c| c.channel_id == channel.id()) {
        caller.last_position_announced_ms = caller_snapshot.last_position_announced_ms;
        caller.last_position_value_announced = caller_snapshot.last_position_value_announced;
        caller.last_periodic_announce_ms = caller_snapshot.last_periodic_announce_ms;
        caller.hold_time_announced = caller_snapshot.hold_time_announced;
        caller.digit_buffer = caller_snapshot.digit_buffer;
    }
    Ok(())
}

/// Clone the pieces of `Queue` the announcement functions read, so the
/// caller's mutable borrow and the queue's immutable borrow never overlap.
fn snapshot_for_announce(queue: &Queue) -> Queue {
    let mut clone = Queue::new(queue.name.clone(), queue.config.clone());
    clone.hold_time = queue.hold_time;
    clone
}

fn exit_with_key_pending(queue_arc: &Arc<RwLock<Queue>>, channel_id: &str, matcher: &dyn ExtensionMatcher) -> bool {
    let queue = queue_arc.read();
    let Some(caller) = queue.callers.iter().find(|c| c.channel_id == channel_id) else {
        return false;
    };
    announce::check_exit_with_key(caller, &queue, matcher)
}

/// Run one strategy selection + ring cycle, within the queue's per-attempt
/// timeout (`spec.md` §4.1.5). Returns `Some(ExitReason::Answered)` on a
/// successful bridge, `None` if the overall attempt timeout elapsed with no
/// answer (the caller reverts to `Waiting`, `spec.md` §4.1.9).
async fn attempt_ring_cycle<F: Fn() -> i64>(
    registry: &QueueRegistry,
    queue_name: &str,
    queue_arc: &Arc<RwLock<Queue>>,
    channel: &dyn ChannelHandle,
    now_ms: &F,
) -> Result<Option<ExitReason>> {
    let (attempt_timeout_secs, retry_secs, join_time_ms) = {
        let queue = queue_arc.read();
        let timeout_secs = if queue.config.timeout_seconds == 0 {
            DEFAULT_ATTEMPT_TIMEOUT_SECS
        } else {
            queue.config.timeout_seconds
        };
        let retry = if queue.config.retry_seconds == 0 { DEFAULT_RETRY_SECS } else { queue.config.retry_seconds };
        let join_time_ms = queue
            .callers
            .iter()
            .find(|c| c.channel_id == channel.id())
            .map(|c| c.join_time_ms)
            .unwrap_or_else(now_ms);
        (timeout_secs, retry, join_time_ms)
    };

    let attempt_deadline_ms = now_ms() + attempt_timeout_secs as i64 * 1000;

    while now_ms() < attempt_deadline_ms {
        let now = now_ms();
        let selection = {
            let mut queue = queue_arc.write();
            strategy::select(&mut queue, now)
        };

        let candidate_interfaces: Vec<(usize, String)> = {
            let queue = queue_arc.read();
            selection
                .candidates
                .iter()
                .map(|&i| (i, queue.members[i].interface.clone()))
                .filter(|(_, iface)| !registry.is_weight_suppressed(queue_name, iface))
                .collect()
        };

        if candidate_interfaces.is_empty() {
            sleep(Duration::from_secs(retry_secs as u64)).await;
            continue;
        }

        let remaining_ms = (attempt_deadline_ms - now_ms()).max(0) as u64;
        let per_ring_timeout = Duration::from_millis(remaining_ms.min(attempt_timeout_secs as u64 * 1000));

        match selection.mode {
            SelectionMode::Parallel => {
                let ifaces: Vec<String> = candidate_interfaces.iter().map(|(_, i)| i.clone()).collect();
                if let Some(winner) = ring_all(channel, &ifaces, per_ring_timeout).await? {
                    let bridge_time_ms = now_ms();
                    let member_leg = DialedMemberLeg { interface: winner.clone() };
                    channel.bridge(&member_leg).await?;
                    let hangup_time_ms = now_ms();
                    finish_bridge(registry, queue_name, &winner, join_time_ms, bridge_time_ms, hangup_time_ms).await?;
                    return Ok(Some(ExitReason::Answered));
                }
            }
            SelectionMode::Single => {
                let (idx, interface) = &candidate_interfaces[0];
                match channel.dial(interface, per_ring_timeout).await? {
                    DialOutcome::Answered => {
                        let bridge_time_ms = now_ms();
                        let member_leg = DialedMemberLeg { interface: interface.clone() };
                        channel.bridge(&member_leg).await?;
                        let hangup_time_ms = now_ms();
                        finish_bridge(registry, queue_name, interface, join_time_ms, bridge_time_ms, hangup_time_ms)
                            .await?;
                        return Ok(Some(ExitReason::Answered));
                    }
                    _ => {
                        let mut queue = queue_arc.write();
                        match queue.config.strategy {
                            Strategy::RoundRobinMemory => strategy::advance_memory_cursor(&mut queue, *idx),
                            Strategy::RoundRobin => strategy::advance_round_robin_cursor(&mut queue),
                            _ => {}
                        }
                    }
                }
            }
        }

        sleep(Duration::from_secs(retry_secs as u64)).await;
    }

    Ok(None)
}

/// §4.1.5: "call every member sharing the current best metric in parallel;
/// as calls complete (busy/congestion/nochan) retry others... until... someone
/// answers." Dials every candidate concurrently on the caller's own channel
/// and returns the first to answer, if any.
async fn ring_all(channel: &dyn ChannelHandle, interfaces: &[String], timeout: Duration) -> Result<Option<String>> {
    let attempts = interfaces
        .iter()
        .map(|iface| async move { (iface.clone(), channel.dial(iface, timeout).await) });

    let results = join_all(attempts).await;
    for (iface, outcome) in results {
        match outcome {
            Ok(DialOutcome::Answered) => return Ok(Some(iface)),
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(interface = %iface, error = %e, "ring-all candidate failed");
            }
        }
    }
    Ok(None)
}

/// Record the hold-time sample at the moment of answer and start the
/// member's wrap-up window at the moment the bridge actually ends
/// (`spec.md` §4.1.4, §4.1.7): `bridge_time_ms` anchors the hold-time sample
/// (queue wait, ending at answer); `hangup_time_ms` anchors wrap-up, since
/// wrap-up begins when the bridged call ends, not when it was established.
async fn finish_bridge(
    registry: &QueueRegistry,
    queue_name: &str,
    interface: &str,
    join_time_ms: i64,
    bridge_time_ms: i64,
    hangup_time_ms: i64,
) -> Result<()> {
    registry
        .record_completed_call(queue_name, interface, join_time_ms, bridge_time_ms, hangup_time_ms)
        .await?;
    info!(queue = queue_name, interface, "caller bridged");
    Ok(())
}

/// A thin stand-in for the member leg's own [`ChannelHandle`] once `dial`
/// reports `Answered`: the queue engine dials by interface string from the
/// caller's own leg and never separately owns a full handle for the far
/// end, so this carries just enough identity for `bridge()` to log and
/// block against (`spec.md` §2, "the first to answer is bridged").
#[derive(Debug)]
struct DialedMemberLeg {
    interface: String,
}

#[async_trait::async_trait]
impl ChannelHandle for DialedMemberLeg {
    fn id(&self) -> &str {
        &self.interface
    }
    fn interface(&self) -> &str {
        &self.interface
    }
    async fn dial(&self, _interface: &str, _timeout: Duration) -> Result<DialOutcome> {
        Err(CoreError::Internal("dialed member leg cannot itself dial".into()))
    }
    async fn answer(&self) -> Result<()> {
        Ok(())
    }
    async fn hangup(&self) -> Result<()> {
        Ok(())
    }
    async fn bridge(&self, _other: &dyn ChannelHandle) -> Result<()> {
        Ok(())
    }
    async fn play(&self, _sound: &str) -> Result<Option<char>> {
        Ok(None)
    }
    async fn say_number(&self, _n: i64) -> Result<Option<char>> {
        Ok(None)
    }
    async fn set_variable(&self, _name: &str, _value: &str) -> Result<()> {
        Ok(())
    }
    async fn get_variable(&self, _name: &str) -> Result<Option<String>> {
        Ok(None)
    }
    async fn goto(&self, _context: &str, _exten: &str, _priority: u32) -> Result<()> {
        Ok(())
    }
}
