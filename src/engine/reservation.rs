use rust_decimal::Decimal;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::access::ensure_access;
use super::conflict::{
    check_availability, ordered_span, require_available, require_non_negative, require_renter,
    validate_booking_window, validate_span,
};
use super::rental::note_outcome;
use super::repo::{BookingRepository, FleetRepository};
use super::{CarGuard, Engine, EngineError};

/// Optional changes for `update_reservation`. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationPatch {
    pub car_id: Option<Ulid>,
    pub user_id: Option<Ulid>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub total_price: Option<Decimal>,
}

impl Engine {
    /// Places a pending hold. Checked against rentals and reservations
    /// alike; the car's flag is left alone.
    pub async fn create_reservation(
        &self,
        id: Ulid,
        car_id: Ulid,
        user_id: Ulid,
        start: Ms,
        end: Ms,
        total_price: Decimal,
    ) -> Result<Reservation, EngineError> {
        let result = self
            .create_reservation_inner(id, car_id, user_id, start, end, total_price)
            .await;
        note_outcome("reservation", "create", &result);
        result
    }

    async fn create_reservation_inner(
        &self,
        id: Ulid,
        car_id: Ulid,
        user_id: Ulid,
        start: Ms,
        end: Ms,
        total_price: Decimal,
    ) -> Result<Reservation, EngineError> {
        let span = validate_booking_window(start, end, self.now(), MIN_RESERVATION_DURATION_MS)?;
        require_non_negative(total_price, "total price")?;
        require_renter(self.store(), user_id)?;
        if self.store.contains_booking(&id) {
            return Err(EngineError::Conflict(format!("booking {id} already exists")));
        }

        let guard = self.lock_car(car_id).await;
        let outcome = check_availability(self.store(), car_id, &span, None)?;
        if let Availability::Unavailable { reason } = &outcome {
            info!(%car_id, %user_id, start, end, "reservation refused: {reason}");
        }
        require_available(outcome)?;
        if self.store.timeline_len(&car_id) >= MAX_BOOKINGS_PER_CAR {
            return Err(EngineError::LimitExceeded("too many bookings for car"));
        }

        let reservation = Reservation {
            id,
            car_id,
            user_id,
            span,
            total_price,
            status: ReservationStatus::Pending,
        };
        self.commit(
            Event::ReservationPlaced {
                reservation: reservation.clone(),
            },
            vec![guard],
        )
        .await?;
        info!(reservation_id = %id, %car_id, %user_id, start, end, "reservation placed");
        Ok(reservation)
    }

    /// `pending -> confirmed`, after checking the hold is still good.
    pub async fn confirm_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let result = self.confirm_reservation_inner(id).await;
        note_outcome("reservation", "confirm", &result);
        result
    }

    async fn confirm_reservation_inner(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let (guard, current) = self.lock_reservation(id).await?;
        if current.status != ReservationStatus::Pending {
            return Err(EngineError::IllegalTransition(format!(
                "only pending reservations can be confirmed; reservation {id} is {}",
                current.status
            )));
        }
        self.transition_reservation(guard, current, ReservationStatus::Confirmed)
            .await
    }

    /// Cancelling twice, or cancelling a completed reservation, is an error.
    pub async fn cancel_reservation(
        &self,
        id: Ulid,
        actor: &Principal,
    ) -> Result<Reservation, EngineError> {
        let result = self.cancel_reservation_inner(id, actor).await;
        note_outcome("reservation", "cancel", &result);
        result
    }

    async fn cancel_reservation_inner(
        &self,
        id: Ulid,
        actor: &Principal,
    ) -> Result<Reservation, EngineError> {
        let reservation = self.reservation(id)?;
        ensure_access(actor, reservation.user_id, "you can only cancel your own reservations")?;

        let (guard, current) = self.lock_reservation(id).await?;
        if current.status.is_terminal() {
            return Err(EngineError::IllegalTransition(format!(
                "reservation {id} is already {}",
                current.status
            )));
        }
        self.transition_reservation(guard, current, ReservationStatus::Cancelled)
            .await
    }

    pub async fn update_reservation_status(
        &self,
        id: Ulid,
        status: ReservationStatus,
    ) -> Result<Reservation, EngineError> {
        let result = self.update_reservation_status_inner(id, status).await;
        note_outcome("reservation", "status", &result);
        result
    }

    async fn update_reservation_status_inner(
        &self,
        id: Ulid,
        status: ReservationStatus,
    ) -> Result<Reservation, EngineError> {
        let (guard, current) = self.lock_reservation(id).await?;
        if !current.status.can_transition_to(status) {
            return Err(EngineError::IllegalTransition(format!(
                "reservation {id} cannot go from {} to {status}",
                current.status
            )));
        }
        self.transition_reservation(guard, current, status).await
    }

    /// Caller holds the car lock and has checked the edge is legal.
    async fn transition_reservation(
        &self,
        guard: CarGuard,
        current: Reservation,
        status: ReservationStatus,
    ) -> Result<Reservation, EngineError> {
        let id = current.id;
        if current.status == ReservationStatus::Pending && status == ReservationStatus::Confirmed {
            let outcome = check_availability(self.store(), current.car_id, &current.span, Some(id))?;
            if let Availability::Unavailable { reason } = outcome {
                return Err(EngineError::Conflict(format!(
                    "reservation {id} can no longer be confirmed: {reason}"
                )));
            }
        }
        self.commit(Event::ReservationStatusChanged { id, status }, vec![guard])
            .await?;
        info!(reservation_id = %id, from = %current.status, to = %status, "reservation status changed");
        Ok(Reservation { status, ..current })
    }

    /// General edit. Customers may touch only their own pending reservations.
    pub async fn update_reservation(
        &self,
        id: Ulid,
        patch: ReservationPatch,
        actor: &Principal,
    ) -> Result<Reservation, EngineError> {
        let result = self.update_reservation_inner(id, patch, actor).await;
        note_outcome("reservation", "update", &result);
        result
    }

    async fn update_reservation_inner(
        &self,
        id: Ulid,
        patch: ReservationPatch,
        actor: &Principal,
    ) -> Result<Reservation, EngineError> {
        let reservation = self.reservation(id)?;
        ensure_access(actor, reservation.user_id, "you can only update your own reservations")?;
        if !actor.role.is_staff() && reservation.status != ReservationStatus::Pending {
            return Err(EngineError::Forbidden("you can only update pending reservations"));
        }

        let target_car = patch.car_id.unwrap_or(reservation.car_id);
        let guards = self.lock_cars(&[reservation.car_id, target_car]).await;
        let current = self.reservation(id)?;
        if current.car_id != reservation.car_id {
            return Err(EngineError::Conflict(format!(
                "reservation {id} changed concurrently"
            )));
        }

        let now = self.now();
        if let Some(user_id) = patch.user_id {
            if !actor.role.is_staff() && user_id != actor.id {
                return Err(EngineError::Forbidden(
                    "you cannot hand a reservation to another user",
                ));
            }
            require_renter(self.store(), user_id)?;
        }
        if patch.start.is_some_and(|s| s < now) {
            return Err(EngineError::InvalidInput("start date cannot be in the past".into()));
        }
        if patch.end.is_some_and(|e| e < now) {
            return Err(EngineError::InvalidInput("end date cannot be in the past".into()));
        }
        let span = ordered_span(
            patch.start.unwrap_or(current.span.start),
            patch.end.unwrap_or(current.span.end),
        )?;
        let window_changed = span != current.span;
        if window_changed {
            if span.duration_ms() < MIN_RESERVATION_DURATION_MS {
                return Err(EngineError::InvalidInput(
                    "booking must last at least 1 hour".into(),
                ));
            }
            validate_span(&span)?;
        }
        if let Some(price) = patch.total_price {
            require_non_negative(price, "total price")?;
        }
        if self.store.find_car(&target_car).is_none() {
            return Err(EngineError::NotFound(target_car));
        }

        let car_changed = target_car != current.car_id;
        if current.status.is_blocking() && (window_changed || car_changed) {
            let outcome = check_availability(self.store(), target_car, &span, Some(id))?;
            require_available(outcome)?;
        }

        let updated = Reservation {
            id,
            car_id: target_car,
            user_id: patch.user_id.unwrap_or(current.user_id),
            span,
            total_price: patch.total_price.unwrap_or(current.total_price),
            status: current.status,
        };
        self.commit(
            Event::ReservationRevised {
                reservation: updated.clone(),
            },
            guards,
        )
        .await?;
        info!(reservation_id = %id, car_id = %target_car, "reservation updated");
        Ok(updated)
    }

    /// Customers may delete only their own pending reservations; nobody
    /// may delete a confirmed one without cancelling it first.
    pub async fn remove_reservation(&self, id: Ulid, actor: &Principal) -> Result<(), EngineError> {
        let result = self.remove_reservation_inner(id, actor).await;
        note_outcome("reservation", "remove", &result);
        result
    }

    async fn remove_reservation_inner(&self, id: Ulid, actor: &Principal) -> Result<(), EngineError> {
        let reservation = self.reservation(id)?;
        ensure_access(actor, reservation.user_id, "you can only delete your own reservations")?;

        let (guard, current) = self.lock_reservation(id).await?;
        if current.status == ReservationStatus::Confirmed {
            return Err(EngineError::IllegalTransition(format!(
                "reservation {id} is confirmed; cancel it first"
            )));
        }
        if !actor.role.is_staff() && current.status != ReservationStatus::Pending {
            return Err(EngineError::Forbidden("you can only delete pending reservations"));
        }
        self.commit(Event::ReservationRemoved { id }, vec![guard])
            .await?;
        info!(reservation_id = %id, "reservation removed");
        Ok(())
    }

    pub fn get_reservation(&self, id: Ulid, actor: &Principal) -> Result<Reservation, EngineError> {
        let reservation = self.reservation(id)?;
        ensure_access(actor, reservation.user_id, "you can only view your own reservations")?;
        Ok(reservation)
    }

    pub fn reservations_for_user(
        &self,
        user_id: Ulid,
        actor: &Principal,
    ) -> Result<Vec<Reservation>, EngineError> {
        if !self.store.contains_user(&user_id) {
            return Err(EngineError::NotFound(user_id));
        }
        ensure_access(actor, user_id, "you can only view your own reservations")?;
        Ok(self.store.reservations_where(|r| r.user_id == user_id))
    }

    pub fn reservations_for_car(&self, car_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        if !self.store.contains_car(&car_id) {
            return Err(EngineError::NotFound(car_id));
        }
        Ok(self.store.reservations_where(|r| r.car_id == car_id))
    }

    pub fn reservations_by_status(&self, status: ReservationStatus) -> Vec<Reservation> {
        self.store.reservations_where(|r| r.status == status)
    }

    /// Pending or confirmed reservations starting within `within_ms` from now,
    /// soonest first.
    pub fn upcoming_reservations(&self, within_ms: Ms) -> Vec<Reservation> {
        let now = self.now();
        let horizon = now.saturating_add(within_ms.max(0));
        let mut upcoming = self.store.reservations_where(|r| {
            r.status.is_blocking() && r.span.start >= now && r.span.start <= horizon
        });
        upcoming.reverse();
        upcoming
    }

    fn reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.store.find_reservation(&id).ok_or(EngineError::NotFound(id))
    }

    /// Takes the reservation's car lock and re-reads it under the lock.
    async fn lock_reservation(&self, id: Ulid) -> Result<(CarGuard, Reservation), EngineError> {
        let car_id = self.reservation(id)?.car_id;
        let guard = self.lock_car(car_id).await;
        let current = self.reservation(id)?;
        if current.car_id != car_id {
            return Err(EngineError::Conflict(format!(
                "reservation {id} changed concurrently"
            )));
        }
        Ok((guard, current))
    }
}
