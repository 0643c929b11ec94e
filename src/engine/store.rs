use std::fmt;

use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

use super::repo::{BookingConflictPort, BookingRepository, FleetRepository};

/// Committed state. Only the WAL writer mutates it, through `apply_event`,
/// and only after the event is durable.
pub struct InMemoryStore {
    cars: DashMap<Ulid, Car>,
    users: DashMap<Ulid, User>,
    insurances: DashMap<Ulid, Insurance>,
    insurance_by_car: DashMap<Ulid, Ulid>,
    rentals: DashMap<Ulid, Rental>,
    reservations: DashMap<Ulid, Reservation>,
    timelines: DashMap<Ulid, CarTimeline>,
}

/// A unique key taken by a creation event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(super) enum Claim {
    Car(Ulid),
    User(Ulid),
    Email(String),
    Insurance(Ulid),
    Booking(Ulid),
}

impl Claim {
    pub(super) fn of(event: &Event) -> Vec<Claim> {
        match event {
            Event::CarAdded { car } => vec![Claim::Car(car.id)],
            Event::UserRegistered { user } => vec![
                Claim::User(user.id),
                Claim::Email(user.email.to_ascii_lowercase()),
            ],
            Event::InsuranceAdded { insurance } => vec![Claim::Insurance(insurance.id)],
            Event::RentalCreated { rental, .. } => vec![Claim::Booking(rental.id)],
            Event::ReservationPlaced { reservation } => vec![Claim::Booking(reservation.id)],
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Claim::Car(id) => write!(f, "car {id} already exists"),
            Claim::User(id) => write!(f, "user {id} already exists"),
            Claim::Email(email) => write!(f, "email {email} is already registered"),
            Claim::Insurance(id) => write!(f, "insurance {id} already exists"),
            Claim::Booking(id) => write!(f, "booking {id} already exists"),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            cars: DashMap::new(),
            users: DashMap::new(),
            insurances: DashMap::new(),
            insurance_by_car: DashMap::new(),
            rentals: DashMap::new(),
            reservations: DashMap::new(),
            timelines: DashMap::new(),
        }
    }

    // ── Counts and listings ──────────────────────────────────

    pub fn car_count(&self) -> usize {
        self.cars.len()
    }

    pub fn contains_car(&self, id: &Ulid) -> bool {
        self.cars.contains_key(id)
    }

    pub fn contains_user(&self, id: &Ulid) -> bool {
        self.users.contains_key(id)
    }

    pub fn contains_booking(&self, id: &Ulid) -> bool {
        self.rentals.contains_key(id) || self.reservations.contains_key(id)
    }

    pub(super) fn is_claimed(&self, claim: &Claim) -> bool {
        match claim {
            Claim::Car(id) => self.contains_car(id),
            Claim::User(id) => self.contains_user(id),
            Claim::Email(email) => self.find_user_by_email(email).is_some(),
            Claim::Insurance(id) => self.insurances.contains_key(id),
            Claim::Booking(id) => self.contains_booking(id),
        }
    }

    pub fn cars(&self) -> Vec<Car> {
        let mut cars: Vec<Car> = self.cars.iter().map(|e| e.value().clone()).collect();
        cars.sort_by_key(|c| c.id);
        cars
    }

    pub fn users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        users
    }

    pub fn find_user_by_email(&self, email: &str) -> Option<User> {
        self.users
            .iter()
            .find(|e| e.value().email.eq_ignore_ascii_case(email))
            .map(|e| e.value().clone())
    }

    pub fn insurances(&self) -> Vec<Insurance> {
        let mut all: Vec<Insurance> = self.insurances.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|i| i.id);
        all
    }

    /// Rentals matching `pred`, most recent start first.
    pub fn rentals_where(&self, pred: impl Fn(&Rental) -> bool) -> Vec<Rental> {
        let mut out: Vec<Rental> = self
            .rentals
            .iter()
            .filter(|e| pred(e.value()))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| b.span.start.cmp(&a.span.start).then(a.id.cmp(&b.id)));
        out
    }

    /// Reservations matching `pred`, most recent start first.
    pub fn reservations_where(&self, pred: impl Fn(&Reservation) -> bool) -> Vec<Reservation> {
        let mut out: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|e| pred(e.value()))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| b.span.start.cmp(&a.span.start).then(a.id.cmp(&b.id)));
        out
    }

    pub fn timeline_len(&self, car_id: &Ulid) -> usize {
        self.timelines
            .get(car_id)
            .map(|t| t.intervals.len())
            .unwrap_or(0)
    }

    /// Occupancy flag the car should carry given its service hold and
    /// active rentals, ignoring `exclude`.
    pub fn derived_flag(&self, car_id: &Ulid, exclude: Option<Ulid>) -> bool {
        let out_of_service = self
            .cars
            .get(car_id)
            .map(|c| c.out_of_service)
            .unwrap_or(false);
        !out_of_service && !self.has_active_rental(car_id, exclude)
    }

    // ── Event application ────────────────────────────────────

    fn set_flag(&self, car_id: &Ulid, available: bool) {
        if let Some(mut car) = self.cars.get_mut(car_id) {
            car.is_available = available;
        }
    }

    fn put_interval(&self, car_id: Ulid, interval: BookingInterval) {
        self.timelines.entry(car_id).or_default().upsert(interval);
    }

    fn drop_interval(&self, car_id: &Ulid, id: Ulid) {
        if let Some(mut tl) = self.timelines.get_mut(car_id) {
            tl.remove(id);
        }
    }

    fn index_rental(&self, rental: &Rental) {
        self.put_interval(
            rental.car_id,
            BookingInterval {
                id: rental.id,
                span: rental.span,
                kind: BookingKind::Rental(rental.status),
            },
        );
    }

    fn index_reservation(&self, reservation: &Reservation) {
        self.put_interval(
            reservation.car_id,
            BookingInterval {
                id: reservation.id,
                span: reservation.span,
                kind: BookingKind::Reservation(reservation.status),
            },
        );
    }

    pub fn apply_event(&self, event: &Event) {
        match event {
            Event::CarAdded { car } => {
                self.timelines.entry(car.id).or_default();
                self.cars.insert(car.id, car.clone());
            }
            Event::CarServiceChanged {
                id,
                out_of_service,
                is_available,
            } => {
                if let Some(mut car) = self.cars.get_mut(id) {
                    car.out_of_service = *out_of_service;
                    car.is_available = *is_available;
                }
            }
            Event::CarRemoved { id } => {
                self.cars.remove(id);
                if let Some((_, tl)) = self.timelines.remove(id) {
                    for interval in tl.intervals {
                        match interval.kind {
                            BookingKind::Rental(_) => {
                                self.rentals.remove(&interval.id);
                            }
                            BookingKind::Reservation(_) => {
                                self.reservations.remove(&interval.id);
                            }
                        }
                    }
                }
                if let Some((_, ins_id)) = self.insurance_by_car.remove(id) {
                    self.insurances.remove(&ins_id);
                }
            }
            Event::UserRegistered { user } => {
                self.users.insert(user.id, user.clone());
            }
            Event::InsuranceAdded { insurance } => {
                self.insurance_by_car.insert(insurance.car_id, insurance.id);
                self.insurances.insert(insurance.id, insurance.clone());
            }
            Event::InsuranceRenewed { id, expiry_date } => {
                if let Some(mut ins) = self.insurances.get_mut(id) {
                    ins.expiry_date = *expiry_date;
                }
            }
            Event::InsuranceRemoved { id } => {
                if let Some((_, ins)) = self.insurances.remove(id) {
                    self.insurance_by_car.remove(&ins.car_id);
                }
            }
            Event::RentalCreated {
                rental,
                car_available,
            } => {
                self.index_rental(rental);
                self.rentals.insert(rental.id, rental.clone());
                self.set_flag(&rental.car_id, *car_available);
            }
            Event::RentalStatusChanged {
                id,
                status,
                car_available,
            } => {
                let updated = self.rentals.get_mut(id).map(|mut r| {
                    r.status = *status;
                    r.clone()
                });
                if let Some(rental) = updated {
                    self.index_rental(&rental);
                    self.set_flag(&rental.car_id, *car_available);
                }
            }
            Event::RentalExtended { id, end } => {
                let updated = self.rentals.get_mut(id).map(|mut r| {
                    r.span.end = *end;
                    r.clone()
                });
                if let Some(rental) = updated {
                    self.index_rental(&rental);
                }
            }
            Event::RentalRevised { rental, car_flags } => {
                if let Some(previous) = self.rentals.insert(rental.id, rental.clone())
                    && previous.car_id != rental.car_id
                {
                    self.drop_interval(&previous.car_id, previous.id);
                }
                self.index_rental(rental);
                for (car_id, available) in car_flags {
                    self.set_flag(car_id, *available);
                }
            }
            Event::RentalRemoved { id, car_available } => {
                if let Some((_, rental)) = self.rentals.remove(id) {
                    self.drop_interval(&rental.car_id, rental.id);
                    self.set_flag(&rental.car_id, *car_available);
                }
            }
            Event::ReservationPlaced { reservation } => {
                self.index_reservation(reservation);
                self.reservations.insert(reservation.id, reservation.clone());
            }
            Event::ReservationStatusChanged { id, status } => {
                let updated = self.reservations.get_mut(id).map(|mut r| {
                    r.status = *status;
                    r.clone()
                });
                if let Some(reservation) = updated {
                    self.index_reservation(&reservation);
                }
            }
            Event::ReservationRevised { reservation } => {
                if let Some(previous) = self
                    .reservations
                    .insert(reservation.id, reservation.clone())
                    && previous.car_id != reservation.car_id
                {
                    self.drop_interval(&previous.car_id, previous.id);
                }
                self.index_reservation(reservation);
            }
            Event::ReservationRemoved { id } => {
                if let Some((_, reservation)) = self.reservations.remove(id) {
                    self.drop_interval(&reservation.car_id, reservation.id);
                }
            }
        }
    }

    /// Minimal event list that rebuilds the current state. Used for WAL
    /// compaction.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        for user in self.users() {
            events.push(Event::UserRegistered { user });
        }
        let cars = self.cars();
        for car in &cars {
            events.push(Event::CarAdded { car: car.clone() });
        }
        for insurance in self.insurances() {
            events.push(Event::InsuranceAdded { insurance });
        }
        for rental in self.rentals_where(|_| true) {
            let car_available = self
                .cars
                .get(&rental.car_id)
                .map(|c| c.is_available)
                .unwrap_or(false);
            events.push(Event::RentalCreated {
                rental,
                car_available,
            });
        }
        for reservation in self.reservations_where(|_| true) {
            events.push(Event::ReservationPlaced { reservation });
        }
        events
    }
}

impl FleetRepository for InMemoryStore {
    fn find_car(&self, id: &Ulid) -> Option<Car> {
        self.cars.get(id).map(|e| e.value().clone())
    }

    fn find_user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|e| e.value().clone())
    }

    fn find_insurance(&self, id: &Ulid) -> Option<Insurance> {
        self.insurances.get(id).map(|e| e.value().clone())
    }

    fn insurance_for_car(&self, car_id: &Ulid) -> Option<Insurance> {
        let ins_id = self.insurance_by_car.get(car_id).map(|e| *e.value())?;
        self.find_insurance(&ins_id)
    }
}

impl BookingRepository for InMemoryStore {
    fn find_rental(&self, id: &Ulid) -> Option<Rental> {
        self.rentals.get(id).map(|e| e.value().clone())
    }

    fn find_reservation(&self, id: &Ulid) -> Option<Reservation> {
        self.reservations.get(id).map(|e| e.value().clone())
    }
}

impl BookingConflictPort for InMemoryStore {
    fn find_overlapping(
        &self,
        car_id: &Ulid,
        window: &Span,
        kinds: KindFilter,
        exclude: Option<Ulid>,
    ) -> Vec<BookingInterval> {
        let Some(tl) = self.timelines.get(car_id) else {
            return Vec::new();
        };
        tl.overlapping(window)
            .filter(|i| i.kind.is_blocking() && kinds.accepts(&i.kind))
            .filter(|i| Some(i.id) != exclude)
            .copied()
            .collect()
    }

    fn has_active_rental(&self, car_id: &Ulid, exclude: Option<Ulid>) -> bool {
        self.timelines.get(car_id).is_some_and(|tl| {
            tl.intervals.iter().any(|i| {
                i.kind == BookingKind::Rental(RentalStatus::Active) && Some(i.id) != exclude
            })
        })
    }
}
