use ulid::Ulid;

use crate::model::*;

/// Read access to cars, users and insurance policies.
pub trait FleetRepository: Send + Sync {
    fn find_car(&self, id: &Ulid) -> Option<Car>;
    fn find_user(&self, id: &Ulid) -> Option<User>;
    fn find_insurance(&self, id: &Ulid) -> Option<Insurance>;
    /// A car has at most one policy.
    fn insurance_for_car(&self, car_id: &Ulid) -> Option<Insurance>;
}

/// Read access to the two booking tables.
pub trait BookingRepository: Send + Sync {
    fn find_rental(&self, id: &Ulid) -> Option<Rental>;
    fn find_reservation(&self, id: &Ulid) -> Option<Reservation>;
}

/// The single lookup both booking flows use to detect overlaps.
///
/// Implementations return only *blocking* bookings: active rentals and
/// pending or confirmed reservations. Overlap is closed at both ends.
pub trait BookingConflictPort: Send + Sync {
    fn find_overlapping(
        &self,
        car_id: &Ulid,
        window: &Span,
        kinds: KindFilter,
        exclude: Option<Ulid>,
    ) -> Vec<BookingInterval>;

    /// True when some active rental other than `exclude` holds the car.
    fn has_active_rental(&self, car_id: &Ulid, exclude: Option<Ulid>) -> bool;
}
