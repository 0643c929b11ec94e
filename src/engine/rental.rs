use rust_decimal::Decimal;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::access::{ensure_access, require_staff};
use super::conflict::{
    check_availability, ordered_span, require_available, require_non_negative, require_renter,
    validate_booking_window, validate_span,
};
use super::repo::{BookingRepository, FleetRepository};
use super::{Engine, EngineError};

/// Optional changes for `update_rental`. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RentalPatch {
    pub car_id: Option<Ulid>,
    pub user_id: Option<Ulid>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub total_cost: Option<Decimal>,
}

pub(super) fn note_outcome<T>(kind: &'static str, op: &'static str, result: &Result<T, EngineError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.category(),
    };
    metrics::counter!(
        crate::observability::BOOKING_OPS_TOTAL,
        "kind" => kind,
        "op" => op,
        "outcome" => outcome
    )
    .increment(1);
}

impl Engine {
    pub async fn create_rental(
        &self,
        id: Ulid,
        car_id: Ulid,
        user_id: Ulid,
        start: Ms,
        end: Ms,
        total_cost: Decimal,
    ) -> Result<Rental, EngineError> {
        let result = self
            .create_rental_inner(id, car_id, user_id, start, end, total_cost)
            .await;
        note_outcome("rental", "create", &result);
        result
    }

    async fn create_rental_inner(
        &self,
        id: Ulid,
        car_id: Ulid,
        user_id: Ulid,
        start: Ms,
        end: Ms,
        total_cost: Decimal,
    ) -> Result<Rental, EngineError> {
        let span = validate_booking_window(start, end, self.now(), MIN_RENTAL_DURATION_MS)?;
        require_non_negative(total_cost, "total cost")?;
        require_renter(self.store(), user_id)?;
        if self.store.contains_booking(&id) {
            return Err(EngineError::Conflict(format!("booking {id} already exists")));
        }

        let guard = self.lock_car(car_id).await;
        let outcome = check_availability(self.store(), car_id, &span, None)?;
        if let Availability::Unavailable { reason } = &outcome {
            info!(%car_id, %user_id, start, end, "rental refused: {reason}");
        }
        require_available(outcome)?;
        if self.store.timeline_len(&car_id) >= MAX_BOOKINGS_PER_CAR {
            return Err(EngineError::LimitExceeded("too many bookings for car"));
        }

        let rental = Rental {
            id,
            car_id,
            user_id,
            span,
            total_cost,
            status: RentalStatus::Active,
        };
        self.commit(
            Event::RentalCreated {
                rental: rental.clone(),
                car_available: false,
            },
            vec![guard],
        )
        .await?;
        info!(rental_id = %id, %car_id, %user_id, start, end, "rental created");
        Ok(rental)
    }

    pub async fn update_rental_status(
        &self,
        id: Ulid,
        status: RentalStatus,
    ) -> Result<Rental, EngineError> {
        let result = self.update_rental_status_inner(id, status).await;
        note_outcome("rental", "status", &result);
        result
    }

    async fn update_rental_status_inner(
        &self,
        id: Ulid,
        status: RentalStatus,
    ) -> Result<Rental, EngineError> {
        let car_id = self.rental(id)?.car_id;
        let guard = self.lock_car(car_id).await;
        let current = self.rental(id)?;
        if current.car_id != car_id {
            // Moved to another car while we waited; the caller may retry.
            return Err(EngineError::Conflict(format!("rental {id} changed concurrently")));
        }

        if !current.status.can_transition_to(status) {
            return Err(EngineError::IllegalTransition(format!(
                "rental {id} cannot go from {} to {status}",
                current.status
            )));
        }

        let car_available = if status == RentalStatus::Active {
            let outcome = check_availability(self.store(), car_id, &current.span, Some(id))?;
            require_available(outcome)?;
            false
        } else {
            self.store.derived_flag(&car_id, Some(id))
        };

        self.commit(
            Event::RentalStatusChanged {
                id,
                status,
                car_available,
            },
            vec![guard],
        )
        .await?;
        info!(rental_id = %id, from = %current.status, to = %status, car_available, "rental status changed");
        Ok(Rental { status, ..current })
    }

    /// Pushes an active rental's end later. Only the added stretch
    /// `[end, new_end]` is checked, with the rental itself excluded.
    pub async fn extend_rental(
        &self,
        id: Ulid,
        new_end: Ms,
        actor: &Principal,
    ) -> Result<Rental, EngineError> {
        let result = self.extend_rental_inner(id, new_end, actor).await;
        note_outcome("rental", "extend", &result);
        result
    }

    async fn extend_rental_inner(
        &self,
        id: Ulid,
        new_end: Ms,
        actor: &Principal,
    ) -> Result<Rental, EngineError> {
        let rental = self.rental(id)?;
        ensure_access(actor, rental.user_id, "you can only extend your own rentals")?;

        let guard = self.lock_car(rental.car_id).await;
        let current = self.rental(id)?;
        if current.status != RentalStatus::Active {
            return Err(EngineError::IllegalTransition(format!(
                "only active rentals can be extended; rental {id} is {}",
                current.status
            )));
        }
        if new_end <= current.span.end {
            return Err(EngineError::InvalidInput(
                "new end date must be after the current end date".into(),
            ));
        }
        let extended = Span::new(current.span.start, new_end);
        validate_span(&extended)?;

        let delta = Span::new(current.span.end, new_end);
        let outcome = check_availability(self.store(), current.car_id, &delta, Some(id))?;
        if let Availability::Unavailable { reason } = outcome {
            return Err(EngineError::Conflict(format!(
                "cannot extend rental: {reason}"
            )));
        }

        self.commit(Event::RentalExtended { id, end: new_end }, vec![guard])
            .await?;
        info!(rental_id = %id, old_end = current.span.end, new_end, "rental extended");
        Ok(Rental {
            span: extended,
            ..current
        })
    }

    /// General edit. Customers may touch only their own active rentals.
    pub async fn update_rental(
        &self,
        id: Ulid,
        patch: RentalPatch,
        actor: &Principal,
    ) -> Result<Rental, EngineError> {
        let result = self.update_rental_inner(id, patch, actor).await;
        note_outcome("rental", "update", &result);
        result
    }

    async fn update_rental_inner(
        &self,
        id: Ulid,
        patch: RentalPatch,
        actor: &Principal,
    ) -> Result<Rental, EngineError> {
        let rental = self.rental(id)?;
        ensure_access(actor, rental.user_id, "you can only update your own rentals")?;
        if !actor.role.is_staff() && rental.status != RentalStatus::Active {
            return Err(EngineError::Forbidden("you can only update active rentals"));
        }

        let target_car = patch.car_id.unwrap_or(rental.car_id);
        let guards = self.lock_cars(&[rental.car_id, target_car]).await;
        let current = self.rental(id)?;
        if current.car_id != rental.car_id {
            return Err(EngineError::Conflict(format!("rental {id} changed concurrently")));
        }

        let now = self.now();
        if let Some(user_id) = patch.user_id {
            if !actor.role.is_staff() && user_id != actor.id {
                return Err(EngineError::Forbidden("you cannot hand a rental to another user"));
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
            if span.duration_ms() < MIN_RENTAL_DURATION_MS {
                return Err(EngineError::InvalidInput(
                    "booking must last at least 1 day".into(),
                ));
            }
            validate_span(&span)?;
        }
        if let Some(cost) = patch.total_cost {
            require_non_negative(cost, "total cost")?;
        }
        if self.store.find_car(&target_car).is_none() {
            return Err(EngineError::NotFound(target_car));
        }

        let car_changed = target_car != current.car_id;
        let is_active = current.status == RentalStatus::Active;
        if is_active && (window_changed || car_changed) {
            let outcome = check_availability(self.store(), target_car, &span, Some(id))?;
            require_available(outcome)?;
        }

        let mut car_flags = Vec::new();
        if is_active && car_changed {
            car_flags.push((current.car_id, self.store.derived_flag(&current.car_id, Some(id))));
            car_flags.push((target_car, false));
        }

        let updated = Rental {
            id,
            car_id: target_car,
            user_id: patch.user_id.unwrap_or(current.user_id),
            span,
            total_cost: patch.total_cost.unwrap_or(current.total_cost),
            status: current.status,
        };
        self.commit(
            Event::RentalRevised {
                rental: updated.clone(),
                car_flags,
            },
            guards,
        )
        .await?;
        info!(rental_id = %id, car_id = %target_car, "rental updated");
        Ok(updated)
    }

    /// Deletes a finished rental. Staff only; active rentals must be
    /// cancelled or completed first.
    pub async fn remove_rental(&self, id: Ulid, actor: &Principal) -> Result<(), EngineError> {
        let result = self.remove_rental_inner(id, actor).await;
        note_outcome("rental", "remove", &result);
        result
    }

    async fn remove_rental_inner(&self, id: Ulid, actor: &Principal) -> Result<(), EngineError> {
        let rental = self.rental(id)?;
        require_staff(actor, "customers cannot delete rentals")?;

        let guard = self.lock_car(rental.car_id).await;
        let current = self.rental(id)?;
        if current.status == RentalStatus::Active {
            return Err(EngineError::IllegalTransition(format!(
                "rental {id} is active; cancel it first"
            )));
        }
        let car_available = self.store.derived_flag(&current.car_id, Some(id));
        self.commit(Event::RentalRemoved { id, car_available }, vec![guard])
            .await?;
        info!(rental_id = %id, "rental removed");
        Ok(())
    }

    pub fn get_rental(&self, id: Ulid, actor: &Principal) -> Result<Rental, EngineError> {
        let rental = self.rental(id)?;
        ensure_access(actor, rental.user_id, "you can only view your own rentals")?;
        Ok(rental)
    }

    pub fn rentals_for_user(
        &self,
        user_id: Ulid,
        actor: &Principal,
    ) -> Result<Vec<Rental>, EngineError> {
        if !self.store.contains_user(&user_id) {
            return Err(EngineError::NotFound(user_id));
        }
        ensure_access(actor, user_id, "you can only view your own rentals")?;
        Ok(self.store.rentals_where(|r| r.user_id == user_id))
    }

    pub fn rentals_for_car(&self, car_id: Ulid) -> Result<Vec<Rental>, EngineError> {
        if !self.store.contains_car(&car_id) {
            return Err(EngineError::NotFound(car_id));
        }
        Ok(self.store.rentals_where(|r| r.car_id == car_id))
    }

    pub fn rentals_by_status(&self, status: RentalStatus) -> Vec<Rental> {
        self.store.rentals_where(|r| r.status == status)
    }

    /// Active rentals whose end has already passed.
    pub fn overdue_rentals(&self) -> Vec<Rental> {
        let now = self.now();
        self.store
            .rentals_where(|r| r.status == RentalStatus::Active && r.span.end < now)
    }

    pub(super) fn rental(&self, id: Ulid) -> Result<Rental, EngineError> {
        self.store.find_rental(&id).ok_or(EngineError::NotFound(id))
    }
}
