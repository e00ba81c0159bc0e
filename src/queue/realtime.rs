//! Realtime reconciliation of dynamically defined queues (`spec.md`
//! §4.1.11).

use tracing::{debug, info};

use crate::error::Result;
use crate::external::RealtimeLookup;

use super::types::{Member, Queue, QueueConfig, Strategy};

/// Apply a realtime member snapshot to `queue`'s in-memory member list:
/// mark every existing member dead, clear the flag (updating penalty) for
/// rows that still exist, create new members for unseen rows, then drop
/// anything still marked dead (`spec.md` §4.1.11, step 2).
pub fn reconcile_members(queue: &mut Queue, rows: &[(String, i64)]) {
    for m in queue.members.iter_mut() {
        m.dead = true;
    }

    for (interface, penalty) in rows {
        if let Some(existing) = queue.members.iter_mut().find(|m| &m.interface == interface) {
            existing.penalty = (*penalty).max(0) as u32;
            existing.dead = false;
        } else {
            let mut member = Member::new(interface.clone(), (*penalty).max(0) as u32, false);
            member.dead = false;
            queue.members.push(member);
            debug!(queue = %queue.name, interface, "realtime member created");
        }
    }

    let before = queue.members.len();
    queue.members.retain(|m| !m.dead);
    if queue.members.len() != before {
        info!(queue = %queue.name, removed = before - queue.members.len(), "realtime members pruned");
    }
}

/// Fetch a queue's realtime definition and merge it in. If the queue is
/// absent from the realtime backend, mark it dead but leave it in place
/// until its last caller departs (`spec.md` §4.1.11, step 1). Static
/// configuration always takes precedence and this function must not be
/// called for a queue defined statically.
pub async fn reconcile_queue(
    realtime: &dyn RealtimeLookup,
    queue: &mut Queue,
) -> Result<()> {
    match realtime.lookup_queue(&queue.name).await? {
        None => {
            queue.dead = true;
        }
        Some(row) => {
            if let Ok(strategy) = parse_strategy(&row.strategy) {
                queue.config.strategy = strategy;
            }
            apply_fields(&mut queue.config, &row.fields);
        }
    }

    let member_rows = realtime.lookup_members(&queue.name).await?;
    let pairs: Vec<(String, i64)> = member_rows
        .into_iter()
        .map(|r| (r.interface, r.penalty))
        .collect();
    reconcile_members(queue, &pairs);

    Ok(())
}

fn parse_strategy(s: &str) -> std::result::Result<Strategy, ()> {
    match s {
        "ringall" => Ok(Strategy::RingAll),
        "roundrobin" => Ok(Strategy::RoundRobin),
        "leastrecent" => Ok(Strategy::LeastRecent),
        "fewestcalls" => Ok(Strategy::FewestCalls),
        "random" => Ok(Strategy::Random),
        "rrmemory" | "roundrobinmemory" => Ok(Strategy::RoundRobinMemory),
        _ => Err(()),
    }
}

fn apply_fields(config: &mut QueueConfig, fields: &[(String, String)]) {
    for (key, value) in fields {
        match key.as_str() {
            "retry" => {
                if let Ok(v) = value.parse() {
                    config.retry_seconds = v;
                }
            }
            "timeout" => {
                if let Ok(v) = value.parse() {
                    config.timeout_seconds = v;
                }
            }
            "maxlen" => {
                if let Ok(v) = value.parse() {
                    config.max_length = v;
                }
            }
            "wrapuptime" => {
                if let Ok(v) = value.parse() {
                    config.wrapup_seconds = v;
                }
            }
            "weight" => {
                if let Ok(v) = value.parse() {
                    config.weight = v;
                }
            }
            _ => {}
        }
    }
}
