//! End-to-end lifecycle tests driving [`pbxq_core::queue::serve_caller`]
//! against the real [`pbxq_core::queue::QueueRegistry`] and the in-memory
//! [`pbxq_core::testutil`] fixtures, with no mocked queue internals.

use std::sync::Arc;

use pbxq_core::queue::{serve_caller, ExitReason, Member, QueueConfig, QueueRegistry};
use pbxq_core::testutil::{MockChannel, StaticExtensionMatcher};

/// A clock tied to the (paused) tokio runtime's virtual time, so a test
/// that lets `serve_caller` sleep through several `RECHECK`/retry ticks
/// sees those ticks reflected in `now_ms()` without any real wall-clock
/// delay.
fn clock() -> impl Fn() -> i64 {
    let start = tokio::time::Instant::now();
    move || start.elapsed().as_millis() as i64
}

/// A caller joins a single-member queue, the member answers on the first
/// ring, and the caller exits `Answered` with the hold-time estimator
/// updated from the join-to-bridge latency.
#[tokio::test(start_paused = true)]
async fn single_member_queue_answers_on_first_ring() {
    let registry = QueueRegistry::new();
    registry.define_static_queue("support", QueueConfig::default());
    registry.get("support").unwrap().write().members.push(Member::new("SIP/1", 0, false));

    registry.join("support", "SIP/caller-1", 0, 0, 0).await.unwrap();

    let caller_channel = Arc::new(MockChannel::new("SIP/caller-1", "SIP/caller"));
    let matcher = StaticExtensionMatcher::new();

    let reason = serve_caller(&registry, "support", caller_channel.as_ref(), &matcher, clock()).await.unwrap();

    assert_eq!(reason, ExitReason::Answered);
    assert_eq!(caller_channel.bridge_count(), 1);
    let queue = registry.get("support").unwrap();
    assert!(queue.read().callers.is_empty());
    assert_eq!(queue.read().members[0].calls_taken, 1);
}

/// Wrap-up starts when the bridge actually tears down, not when it was
/// established: a member who talks for several seconds after answering
/// still gets a full wrap-up window measured from hangup (`spec.md`
/// §4.1.7), not one silently shortened by the call's talk time.
#[tokio::test(start_paused = true)]
async fn wrap_up_is_anchored_to_hangup_time_not_answer_time() {
    let registry = QueueRegistry::new();
    registry.define_static_queue("support", QueueConfig::default());
    registry.get("support").unwrap().write().members.push(Member::new("SIP/1", 0, false));

    registry.join("support", "SIP/caller-1", 0, 0, 0).await.unwrap();

    let caller_channel =
        Arc::new(MockChannel::new("SIP/caller-1", "SIP/caller")).with_bridge_hold_ms(5_000);
    let matcher = StaticExtensionMatcher::new();

    serve_caller(&registry, "support", caller_channel.as_ref(), &matcher, clock()).await.unwrap();

    let queue = registry.get("support").unwrap();
    let member = queue.read().members[0].clone();
    // The bridge held for 5s of virtual time after answering; the member's
    // wrap-up anchor must reflect that the call only just ended, not the
    // instant it was answered.
    assert!(member.last_call_ms >= 5_000);
}

/// When every member is busy the caller exhausts its overall timeout and
/// exits `Timeout` rather than looping forever.
#[tokio::test(start_paused = true)]
async fn caller_times_out_when_no_member_ever_answers() {
    let registry = QueueRegistry::new();
    let mut config = QueueConfig::default();
    config.timeout_seconds = 2;
    config.retry_seconds = 1;
    registry.define_static_queue("support", config);
    registry.get("support").unwrap().write().members.push(Member::new("SIP/1", 0, false));

    // join_time + timeout_ms = absolute expiry read by check_terminal_conditions.
    registry.join("support", "SIP/caller-1", 0, 3_000, 0).await.unwrap();

    let caller_channel =
        Arc::new(MockChannel::new("SIP/caller-1", "SIP/caller")).with_dial_outcome(pbxq_core::external::DialOutcome::Busy);
    let matcher = StaticExtensionMatcher::new();

    let reason = serve_caller(&registry, "support", caller_channel.as_ref(), &matcher, clock()).await.unwrap();

    assert_eq!(reason, ExitReason::Timeout);
}

/// A member shared by two queues is only offered calls from the
/// lower-weight queue once the higher-weight queue has no one waiting
/// (`spec.md` §4.1.6).
#[tokio::test(start_paused = true)]
async fn weight_arbitration_suppresses_the_lower_weight_queue_while_the_higher_one_has_callers() {
    let registry = QueueRegistry::new();

    let mut low = QueueConfig::default();
    low.weight = 0;
    registry.define_static_queue("low", low);
    registry.get("low").unwrap().write().members.push(Member::new("SIP/shared", 0, false));

    let mut high = QueueConfig::default();
    high.weight = 10;
    registry.define_static_queue("high", high);
    registry.get("high").unwrap().write().members.push(Member::new("SIP/shared", 0, false));

    registry.join("high", "SIP/waiting-in-high", 0, 0, 0).await.unwrap();
    assert!(registry.is_weight_suppressed("low", "SIP/shared"));

    registry.leave("high", "SIP/waiting-in-high").unwrap();
    assert!(!registry.is_weight_suppressed("low", "SIP/shared"));
}

/// Strictly higher priority callers are served before equal-or-lower
/// priority ones regardless of arrival order (`spec.md` §4.1.1, insertion
/// ordering).
#[tokio::test(start_paused = true)]
async fn higher_priority_caller_is_served_first_even_when_it_joins_later() {
    let registry = QueueRegistry::new();
    registry.define_static_queue("support", QueueConfig::default());
    registry.get("support").unwrap().write().members.push(Member::new("SIP/1", 0, false));

    registry.join("support", "SIP/normal", 0, 0, 0).await.unwrap();
    let vip_outcome = registry.join("support", "SIP/vip", 10, 0, 1).await.unwrap();

    assert_eq!(vip_outcome.position, 1);
    let queue = registry.get("support").unwrap();
    let head = queue.read().callers.front().unwrap().channel_id.clone();
    assert_eq!(head, "SIP/vip");
}
