//! Diagnostic staleness judgment for a recorded leader
//!
//! Staleness never revokes a lock. Only the OS lock state decides leadership;
//! this is an observability signal for followers.

use crate::leader_info::LeaderInfo;

/// Decide whether the recorded leader looks dead.
///
/// `latest` is the record just read, `previous` the record read on the prior
/// observation. Checks run in a fixed order: a missing record is stale, a
/// changed leader is fresh (there is no baseline for it yet), then the heartbeat
/// is compared, and only an unchanged heartbeat falls through to the timeout of
/// `interval * timeout_multiplier` measured from the previous heartbeat.
///
/// Without a previous observation there is no baseline, so a present record is fresh.
pub fn is_stale(
    latest: Option<&LeaderInfo>,
    previous: Option<&LeaderInfo>,
    now_millis: i64,
    timeout_multiplier: u32,
) -> bool {
    let Some(latest) = latest else {
        return true;
    };
    let Some(previous) = previous else {
        return false;
    };

    if latest.id() != previous.id() {
        return false;
    }
    if latest.heartbeat_millis() > previous.heartbeat_millis() {
        return false;
    }
    if latest.heartbeat_millis() < previous.heartbeat_millis() {
        return true;
    }

    let elapsed = now_millis.saturating_sub(previous.heartbeat_millis());
    let timeout = latest
        .heartbeat_interval_millis()
        .saturating_mul(i64::from(timeout_multiplier));
    elapsed > timeout
}
