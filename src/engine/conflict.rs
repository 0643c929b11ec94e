use rust_decimal::Decimal;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::repo::{BookingConflictPort, FleetRepository};
use super::EngineError;

pub(crate) const REASON_CAR_DOWN: &str = "car is not available";
pub(crate) const REASON_NO_INSURANCE: &str =
    "car does not have valid insurance for the requested period";
pub(crate) const REASON_RENTED: &str = "car is already rented during this period";
pub(crate) const REASON_RESERVED: &str = "car is already reserved during this period";

/// Range and width limits shared by every window the engine accepts.
pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_BOOKING_SPAN_MS {
        return Err(EngineError::LimitExceeded("booking window too wide"));
    }
    Ok(())
}

/// Zero is allowed; any negative amount is `InvalidInput`.
pub(crate) fn require_non_negative(amount: Decimal, what: &str) -> Result<(), EngineError> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(EngineError::InvalidInput(format!("{what} cannot be negative")));
    }
    Ok(())
}

/// `end > start`, nothing else. Used by read-only window queries.
pub(crate) fn ordered_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if end <= start {
        return Err(EngineError::InvalidInput(
            "end date must be after start date".into(),
        ));
    }
    Ok(Span::new(start, end))
}

/// Checks for a new booking window: ordered, not in the past, at least
/// `min_duration` long, inside the global limits.
pub(crate) fn validate_booking_window(
    start: Ms,
    end: Ms,
    now: Ms,
    min_duration: Ms,
) -> Result<Span, EngineError> {
    let span = ordered_span(start, end)?;
    if start < now {
        return Err(EngineError::InvalidInput(
            "start date cannot be in the past".into(),
        ));
    }
    if span.duration_ms() < min_duration {
        return Err(EngineError::InvalidInput(format!(
            "booking must last at least {}",
            describe_duration(min_duration)
        )));
    }
    validate_span(&span)?;
    Ok(span)
}

fn describe_duration(ms: Ms) -> String {
    if ms % DAY_MS == 0 {
        let days = ms / DAY_MS;
        format!("{days} day{}", if days == 1 { "" } else { "s" })
    } else {
        let hours = ms / HOUR_MS;
        format!("{hours} hour{}", if hours == 1 { "" } else { "s" })
    }
}

/// Only customers may be the subject of a booking.
pub(crate) fn require_renter<F: FleetRepository + ?Sized>(
    store: &F,
    user_id: Ulid,
) -> Result<User, EngineError> {
    let user = store.find_user(&user_id).ok_or(EngineError::NotFound(user_id))?;
    if user.role != Role::Customer {
        return Err(EngineError::InvalidInput(format!(
            "user {user_id} has role {} and cannot hold bookings",
            user.role
        )));
    }
    Ok(user)
}

/// Decides whether `car_id` can take a booking over `window`.
///
/// Unavailability is an ordinary result; only a missing car is an error.
/// `exclude` names a booking that should not count against itself
/// (extend, edit, confirm).
///
/// A service hold always refuses. Otherwise the occupancy flag
/// short-circuits only when no active rental explains it (drift); cars
/// that are merely rented are judged on their timeline.
pub(crate) fn check_availability<S>(
    store: &S,
    car_id: Ulid,
    window: &Span,
    exclude: Option<Ulid>,
) -> Result<Availability, EngineError>
where
    S: FleetRepository + BookingConflictPort + ?Sized,
{
    let car = store.find_car(&car_id).ok_or(EngineError::NotFound(car_id))?;

    if car.out_of_service || (!car.is_available && !store.has_active_rental(&car_id, None)) {
        return Ok(Availability::unavailable(REASON_CAR_DOWN));
    }

    let insured = store
        .insurance_for_car(&car_id)
        .is_some_and(|ins| ins.covers(window.end));
    if !insured {
        return Ok(Availability::unavailable(REASON_NO_INSURANCE));
    }

    if !store
        .find_overlapping(&car_id, window, KindFilter::Rentals, exclude)
        .is_empty()
    {
        return Ok(Availability::unavailable(REASON_RENTED));
    }

    if !store
        .find_overlapping(&car_id, window, KindFilter::Reservations, exclude)
        .is_empty()
    {
        return Ok(Availability::unavailable(REASON_RESERVED));
    }

    Ok(Availability::Available)
}

/// Turns an unavailable outcome into the `Conflict` error a mutation raises.
pub(crate) fn require_available(outcome: Availability) -> Result<(), EngineError> {
    match outcome {
        Availability::Available => Ok(()),
        Availability::Unavailable { reason } => Err(EngineError::Conflict(reason)),
    }
}
