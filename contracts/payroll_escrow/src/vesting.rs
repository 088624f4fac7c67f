//! Linear vesting schedule math.
//!
//! Everything here is a pure function of a schedule and a timestamp, so the
//! contract can evaluate it for any stream without touching storage.

use crate::{ContractError, Stream};

/// Amount of `total_amount` vested at `now` for the window `[start_time, end_time]`.
///
/// - `now <= start_time` → `0`
/// - `now >= end_time` → `total_amount`
/// - otherwise `total_amount × (now − start_time) / (end_time − start_time)`,
///   multiplied before dividing so no precision is lost to truncation.
///
/// Returns `InvalidSchedule` for an empty window or when the product does not fit
/// in `i128`. Streams that passed [`check_schedule`] never hit the overflow.
pub fn vested_amount(
    total_amount: i128,
    start_time: u64,
    end_time: u64,
    now: u64,
) -> Result<i128, ContractError> {
    if end_time <= start_time {
        return Err(ContractError::InvalidSchedule);
    }
    if now <= start_time {
        return Ok(0);
    }
    if now >= end_time {
        return Ok(total_amount);
    }

    let elapsed = (now - start_time) as i128;
    let span = (end_time - start_time) as i128;

    total_amount
        .checked_mul(elapsed)
        .map(|scaled| scaled / span)
        .ok_or(ContractError::InvalidSchedule)
}

/// Vested amount of a stored stream at `now`.
///
/// A cancelled stream is evaluated at its cancellation instant, so the result
/// stops growing once the stream is cancelled.
pub fn vested_at(stream: &Stream, now: u64) -> Result<i128, ContractError> {
    let at = match stream.cancelled_at {
        Some(cancelled_at) if stream.cancelled => cancelled_at,
        _ => now,
    };
    vested_amount(stream.total_amount, stream.start_time, stream.end_time, at)
}

/// Validates a new schedule and returns its `end_time`.
///
/// Rejects a non-positive amount, a zero duration, an end time past `u64::MAX`,
/// and any amount whose `total_amount × duration` would overflow.
pub fn check_schedule(total_amount: i128, now: u64, duration: u64) -> Result<u64, ContractError> {
    if total_amount <= 0 || duration == 0 {
        return Err(ContractError::InvalidSchedule);
    }
    total_amount
        .checked_mul(duration as i128)
        .ok_or(ContractError::InvalidSchedule)?;
    now.checked_add(duration).ok_or(ContractError::InvalidSchedule)
}
