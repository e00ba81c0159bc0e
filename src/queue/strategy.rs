//! Member-selection metric computation (`spec.md` §4.1.5).

use rand::Rng;

use crate::external::DeviceState;

use super::types::{Queue, SelectionMode, Strategy};

/// Penalty weighting so higher-penalty members only ring once all
/// lower-penalty members are exhausted (`spec.md` §4.1.5).
const PENALTY_WEIGHT: i64 = 1_000_000;

/// Compute the selection metric for the member at `index` within `queue`,
/// under `queue.config.strategy`. Lower wins; ties break by insertion order
/// (i.e. by `index`, since `Vec` iteration order is insertion order).
///
/// Returns `None` if the member is not eligible this cycle (paused or in
/// wrap-up) — such members never enter the min-metric comparison.
pub fn compute_metric(queue: &Queue, index: usize, now_ms: i64) -> Option<i64> {
    let member = &queue.members[index];
    if member.paused {
        return None;
    }
    if member.in_wrapup(now_ms, queue.config.wrapup_seconds as i64 * 1000) {
        return None;
    }
    // `SPEC_FULL.md` §3, "ringinuse": a member already `InUse` on another
    // call is skipped unless the queue explicitly allows ringing busy
    // endpoints.
    if member.state == DeviceState::InUse && !queue.config.ringinuse {
        return None;
    }

    let base = match queue.config.strategy {
        Strategy::RingAll => 0,
        Strategy::RoundRobin | Strategy::RoundRobinMemory => {
            let cursor = queue.rr_cursor % queue.members.len().max(1);
            if index < cursor {
                1000 + index as i64
            } else {
                index as i64
            }
        }
        Strategy::Random => {
            let mut rng = rand::thread_rng();
            rng.gen_range(0..1000)
        }
        Strategy::FewestCalls => member.calls_taken as i64,
        Strategy::LeastRecent => {
            if member.last_call_ms == 0 {
                0
            } else {
                PENALTY_WEIGHT - (now_ms - member.last_call_ms)
            }
        }
    };

    Some(base + member.penalty as i64 * PENALTY_WEIGHT)
}

/// Whether selecting under `queue`'s strategy wrapped the round-robin
/// cursor for the member at `index` (`spec.md` §4.1.5: "mark wrapped").
pub fn marks_wrapped(queue: &Queue, index: usize) -> bool {
    matches!(queue.config.strategy, Strategy::RoundRobin | Strategy::RoundRobinMemory)
        && index > queue.rr_cursor % queue.members.len().max(1)
}

/// Result of a selection pass over all members of a queue.
pub struct Selection {
    pub mode: SelectionMode,
    /// Indices into `queue.members`, all sharing the winning metric for
    /// `SelectionMode::Parallel`, or the single best candidate for
    /// `SelectionMode::Single`.
    pub candidates: Vec<usize>,
}

/// Select the member(s) eligible to be offered the head caller this cycle,
/// applying `spec.md` §4.1.5 (strategy metric) and leaving weight
/// arbitration (§4.1.6) to the caller, which should filter `candidates`
/// through [`super::registry::QueueRegistry::is_weight_suppressed`] before
/// ringing.
pub fn select(queue: &mut Queue, now_ms: i64) -> Selection {
    let mode = queue.config.strategy.selection_mode();

    let mut metrics: Vec<(usize, i64)> = (0..queue.members.len())
        .filter_map(|i| compute_metric(queue, i, now_ms).map(|m| (i, m)))
        .collect();

    if metrics.is_empty() {
        return Selection { mode, candidates: Vec::new() };
    }

    metrics.sort_by_key(|(_, m)| *m);
    let min_metric = metrics[0].1;

    let candidates = match mode {
        SelectionMode::Parallel => metrics
            .iter()
            .filter(|(_, m)| *m == min_metric)
            .map(|(i, _)| *i)
            .collect(),
        SelectionMode::Single => vec![metrics[0].0],
    };

    if matches!(queue.config.strategy, Strategy::RoundRobin | Strategy::RoundRobinMemory) {
        if let Some(&winner) = candidates.first() {
            if marks_wrapped(queue, winner) {
                queue.rr_wrapped = true;
            }
        }
    }

    Selection { mode, candidates }
}

/// Advance the `RoundRobinMemory` cursor to remember where the next
/// attempt cycle should start (`spec.md` §4.1.5, last paragraph).
pub fn advance_memory_cursor(queue: &mut Queue, last_tried_index: usize) {
    if queue.members.is_empty() {
        return;
    }
    queue.rr_cursor = (last_tried_index + 1) % queue.members.len();
}

/// Advance the plain `RoundRobin` cursor after a failed attempt. Unlike
/// `RoundRobinMemory`, which always remembers the exact next index, plain
/// `RoundRobin` only remembers whether this cycle's selection pass ever saw
/// a member past the cursor (`rr_wrapped`, set by `marks_wrapped` during
/// `select`): if it never did, every member at or after the cursor has now
/// been tried, so the next cycle restarts at 0; if it did, there is still a
/// lower-index member left to prefer, so just nudge forward by one.
pub fn advance_round_robin_cursor(queue: &mut Queue) {
    if queue.members.is_empty() {
        return;
    }
    if queue.rr_wrapped {
        queue.rr_cursor = (queue.rr_cursor + 1) % queue.members.len();
    } else {
        queue.rr_cursor = 0;
    }
    queue.rr_wrapped = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::types::{Member, QueueConfig};

    fn queue_with(strategy: Strategy, count: usize) -> Queue {
        let mut config = QueueConfig::default();
        config.strategy = strategy;
        let mut q = Queue::new("q", config);
        for i in 0..count {
            q.members.push(Member::new(format!("SIP/{i}"), 0, false));
        }
        q
    }

    #[test]
    fn paused_member_never_wins() {
        let mut q = queue_with(Strategy::RingAll, 2);
        q.members[0].paused = true;
        let selection = select(&mut q, 1000);
        assert_eq!(selection.candidates, vec![1]);
    }

    #[test]
    fn wrapup_member_excluded_until_window_elapses() {
        let mut q = queue_with(Strategy::FewestCalls, 2);
        q.config.wrapup_seconds = 10;
        q.members[0].last_call_ms = 1000;
        // 5s elapsed: still in wrap-up.
        assert_eq!(select(&mut q, 6000).candidates, vec![1]);
        // 11s elapsed: eligible again, and ties with member 1 on calls_taken=0
        // so the lower index wins (insertion-order tie-break).
        assert_eq!(select(&mut q, 12_000).candidates, vec![0]);
    }

    #[test]
    fn penalty_outranks_base_metric() {
        let mut q = queue_with(Strategy::FewestCalls, 2);
        q.members[0].penalty = 1;
        q.members[1].calls_taken = 5; // would otherwise lose to member 0
        assert_eq!(select(&mut q, 0).candidates, vec![1]);
    }

    #[test]
    fn ring_all_selects_every_tied_minimum() {
        let q = queue_with(Strategy::RingAll, 3);
        let mut q = q;
        let selection = select(&mut q, 0);
        assert_eq!(selection.mode, SelectionMode::Parallel);
        assert_eq!(selection.candidates, vec![0, 1, 2]);
    }

    #[test]
    fn round_robin_memory_cursor_wraps() {
        let mut q = queue_with(Strategy::RoundRobinMemory, 3);
        advance_memory_cursor(&mut q, 2);
        assert_eq!(q.rr_cursor, 0);
        advance_memory_cursor(&mut q, 0);
        assert_eq!(q.rr_cursor, 1);
    }

    #[test]
    fn round_robin_cursor_resets_once_no_member_wraps_past_it() {
        let mut q = queue_with(Strategy::RoundRobin, 3);
        q.rr_cursor = 2;

        // Selecting with the cursor at the last index never marks wrapped
        // (no member index exceeds 2), so the next cycle restarts at 0.
        select(&mut q, 0);
        assert!(!q.rr_wrapped);
        advance_round_robin_cursor(&mut q);
        assert_eq!(q.rr_cursor, 0);
    }

    #[test]
    fn round_robin_cursor_nudges_forward_when_a_later_member_was_seen() {
        let mut q = queue_with(Strategy::RoundRobin, 3);
        q.rr_cursor = 0;

        // Member 2 is past the cursor, so this pass marks wrapped and the
        // next cycle should only step forward by one, not restart.
        select(&mut q, 0);
        assert!(q.rr_wrapped);
        advance_round_robin_cursor(&mut q);
        assert_eq!(q.rr_cursor, 1);
        assert!(!q.rr_wrapped);
    }

    #[test]
    fn in_use_member_excluded_unless_ringinuse() {
        let mut q = queue_with(Strategy::FewestCalls, 2);
        q.members[0].state = crate::external::DeviceState::InUse;
        q.config.ringinuse = false;
        assert_eq!(select(&mut q, 0).candidates, vec![1]);

        q.config.ringinuse = true;
        assert_eq!(select(&mut q, 0).candidates, vec![0]);
    }

    #[test]
    fn least_recent_prefers_never_called_member() {
        let mut q = queue_with(Strategy::LeastRecent, 2);
        q.members[0].last_call_ms = 500;
        // member 1 has never been called (last_call_ms == 0), so it wins.
        assert_eq!(select(&mut q, 10_000).candidates, vec![1]);
    }
}
