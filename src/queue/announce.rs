//! Position and periodic announcements for the head caller (`spec.md`
//! §4.1.3; modeled as state, not control flow, per §9 "Announcements as
//! state, not control flow").

use tracing::debug;

use crate::error::Result;
use crate::external::{ChannelHandle, ExtensionMatcher};

use super::types::{AnnounceHoldTime, Caller, Queue};

/// What the 1-second recheck tick (`RECHECK`, `spec.md` §5) should do for
/// the head caller this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceAction {
    None,
    Position,
    Periodic,
}

/// Decide which announcement (if any) is due for the head caller, without
/// performing any I/O. Pure so it's trivially unit-testable.
pub fn due_action(caller: &Caller, queue: &Queue, now_ms: i64) -> AnnounceAction {
    let announce_every_ms = queue.config.announce_frequency_seconds as i64 * 1000;
    if announce_every_ms > 0 {
        let elapsed = now_ms - caller.last_position_announced_ms;
        let position_changed = caller.position != caller.last_position_value_announced;
        if elapsed >= announce_every_ms && (position_changed || elapsed >= 15_000) {
            return AnnounceAction::Position;
        }
    }

    let periodic_every_ms = queue.config.periodic_announce_frequency_seconds as i64 * 1000;
    if periodic_every_ms > 0 && now_ms - caller.last_periodic_announce_ms >= periodic_every_ms {
        return AnnounceAction::Periodic;
    }

    AnnounceAction::None
}

/// Run the position announcement sequence (`spec.md` §4.1.3) against a real
/// channel, updating `caller`'s bookkeeping fields. Returns any DTMF digit
/// collected while playing.
pub async fn play_position_announcement(
    caller: &mut Caller,
    queue: &Queue,
    now_ms: i64,
    channel: &dyn ChannelHandle,
) -> Result<Option<char>> {
    channel.set_variable("MOH_PAUSED", "1").await.ok();
    let mut digit = None;

    if caller.position == 1 {
        digit = digit.or(channel.play("queue-youarenext").await?);
    } else {
        digit = digit.or(channel.play("queue-thereare").await?);
        digit = digit.or(channel.say_number(caller.position as i64).await?);
        digit = digit.or(channel.play("queue-callswaiting").await?);
    }

    let announce_hold = queue.config.announce_hold_time;
    let should_announce_hold = announce_hold != AnnounceHoldTime::Never
        && queue.hold_time.average_ms >= 60_000
        && (announce_hold == AnnounceHoldTime::Always || !caller.hold_time_announced);

    if should_announce_hold {
        digit = digit.or(channel.play("queue-holdtime").await?);
        let minutes = queue.hold_time.average_ms / 60_000;
        if minutes < 2 {
            digit = digit.or(channel.play("queue-less-than").await?);
            digit = digit.or(channel.say_number(2).await?);
        } else {
            digit = digit.or(channel.say_number(minutes).await?);
        }
        digit = digit.or(channel.play("queue-minutes").await?);

        if queue.config.round_seconds > 0 {
            let remainder_seconds = (queue.hold_time.average_ms % 60_000) / 1000;
            let rounded = (remainder_seconds / queue.config.round_seconds as i64)
                * queue.config.round_seconds as i64;
            if rounded > 0 {
                digit = digit.or(channel.say_number(rounded).await?);
                digit = digit.or(channel.play("queue-seconds").await?);
            }
        }

        caller.hold_time_announced = true;
    }

    digit = digit.or(channel.play("queue-thankyou").await?);
    channel.set_variable("MOH_PAUSED", "0").await.ok();

    caller.last_position_announced_ms = now_ms;
    caller.last_position_value_announced = caller.position;

    if let Some(d) = digit {
        caller.digit_buffer.push(d);
    }

    Ok(digit)
}

/// Run the periodic announcement (`spec.md` §4.1.3, independent of
/// position). The periodic file is DTMF-interruptible.
pub async fn play_periodic_announcement(
    caller: &mut Caller,
    now_ms: i64,
    channel: &dyn ChannelHandle,
) -> Result<Option<char>> {
    channel.set_variable("MOH_PAUSED", "1").await.ok();
    let digit = channel.play("queue-periodic-announce").await?;
    channel.set_variable("MOH_PAUSED", "0").await.ok();

    caller.last_periodic_announce_ms = now_ms;
    if let Some(d) = digit {
        caller.digit_buffer.push(d);
    }
    Ok(digit)
}

/// Check whether the caller's accumulated digit buffer names an extension
/// in the queue's exit context; if so, the caller should exit the queue
/// with `ExitReason::ExitWithKey` (`spec.md` §4.1.3, last bullet).
pub fn check_exit_with_key(caller: &Caller, queue: &Queue, matcher: &dyn ExtensionMatcher) -> bool {
    if caller.digit_buffer.is_empty() || queue.config.exit_context.is_empty() {
        return false;
    }
    matcher.exists(&queue.config.exit_context, &caller.digit_buffer)
}

pub fn debug_log_tick(caller: &Caller, action: AnnounceAction) {
    debug!(channel = %caller.channel_id, ?action, "announcement tick");
}
