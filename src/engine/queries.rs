use tracing::warn;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability;
use super::conflict::{self, ordered_span};
use super::repo::{BookingConflictPort, FleetRepository};
use super::{Engine, EngineError};

fn query_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let window = ordered_span(start, end)?;
    if window.start < MIN_VALID_TIMESTAMP_MS || window.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if window.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(window)
}

impl Engine {
    /// Read-only bookability check. Takes no lock, so the answer may be
    /// stale by the time a booking is attempted.
    pub fn check_availability(
        &self,
        car_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Availability, EngineError> {
        let window = ordered_span(start, end)?;
        let outcome = conflict::check_availability(self.store(), car_id, &window, None)?;
        let label = if outcome.is_available() { "available" } else { "unavailable" };
        metrics::counter!(crate::observability::AVAILABILITY_CHECKS_TOTAL, "result" => label)
            .increment(1);
        Ok(outcome)
    }

    /// Gaps in `[start, end]` where the car could still be booked.
    pub fn free_windows(&self, car_id: Ulid, start: Ms, end: Ms) -> Result<Vec<Span>, EngineError> {
        let window = query_window(start, end)?;
        let car = self.get_car(car_id)?;
        if car.out_of_service || (!car.is_available && !self.store.has_active_rental(&car_id, None)) {
            return Ok(Vec::new());
        }
        let bookings = self
            .store
            .find_overlapping(&car_id, &window, KindFilter::Both, None);
        let insured_until = self.store.insurance_for_car(&car_id).map(|i| i.expiry_date);
        Ok(availability::free_windows(&window, &bookings, insured_until))
    }

    /// Cars that would pass the conflict check for the whole window.
    pub fn available_cars(&self, start: Ms, end: Ms) -> Result<Vec<Car>, EngineError> {
        let window = query_window(start, end)?;
        let mut cars = Vec::new();
        for car in self.store.cars() {
            match conflict::check_availability(self.store(), car.id, &window, None) {
                Ok(Availability::Available) => cars.push(car),
                Ok(Availability::Unavailable { .. }) => {}
                // Removed between listing and checking.
                Err(EngineError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(cars)
    }

    /// Recomputes every car's occupancy flag from its service hold and
    /// active rentals and lists the cars whose stored flag disagrees.
    pub fn reconcile_availability(&self) -> Vec<FlagDrift> {
        let drift: Vec<FlagDrift> = self
            .store
            .cars()
            .into_iter()
            .filter_map(|car| {
                let expected = self.store.derived_flag(&car.id, None);
                (car.is_available != expected).then_some(FlagDrift {
                    car_id: car.id,
                    flag: car.is_available,
                    expected,
                })
            })
            .collect();
        for d in &drift {
            warn!(car_id = %d.car_id, flag = d.flag, expected = d.expected, "availability flag drift");
        }
        metrics::gauge!(crate::observability::FLAG_DRIFT_CARS).set(drift.len() as f64);
        drift
    }
}
