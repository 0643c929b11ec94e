use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Closed overlap test: touching windows count as overlapping.
pub fn overlaps(a_start: Ms, a_end: Ms, b_start: Ms, b_end: Ms) -> bool {
    a_start <= b_end && a_end >= b_start
}

/// A booking window `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }
}

// ── Roles and principals ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Customer,
    Driver,
    Manager,
    Admin,
}

impl Role {
    pub fn is_staff(self) -> bool {
        matches!(self, Role::Manager | Role::Admin)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Driver => "driver",
            Role::Manager => "manager",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "customer" => Ok(Role::Customer),
            "driver" => Ok(Role::Driver),
            "manager" => Ok(Role::Manager),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The authenticated caller of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub id: Ulid,
    pub role: Role,
}

impl Principal {
    pub fn new(id: Ulid, role: Role) -> Self {
        Self { id, role }
    }
}

// ── Statuses ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RentalStatus {
    Active,
    Completed,
    Cancelled,
    Overdue,
}

impl RentalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RentalStatus::Completed | RentalStatus::Cancelled)
    }

    /// Allowed edges of the rental lifecycle. Same-status moves are not edges.
    pub fn can_transition_to(self, next: RentalStatus) -> bool {
        use RentalStatus::*;
        matches!(
            (self, next),
            (Active, Completed)
                | (Active, Cancelled)
                | (Active, Overdue)
                | (Overdue, Active)
                | (Overdue, Completed)
                | (Overdue, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RentalStatus::Active => "active",
            RentalStatus::Completed => "completed",
            RentalStatus::Cancelled => "cancelled",
            RentalStatus::Overdue => "overdue",
        }
    }
}

impl FromStr for RentalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(RentalStatus::Active),
            "completed" => Ok(RentalStatus::Completed),
            "cancelled" => Ok(RentalStatus::Cancelled),
            "overdue" => Ok(RentalStatus::Overdue),
            other => Err(format!("unknown rental status: {other}")),
        }
    }
}

impl fmt::Display for RentalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl ReservationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReservationStatus::Cancelled | ReservationStatus::Completed)
    }

    /// Pending and confirmed reservations hold the car.
    pub fn is_blocking(self) -> bool {
        matches!(self, ReservationStatus::Pending | ReservationStatus::Confirmed)
    }

    pub fn can_transition_to(self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (Confirmed, Cancelled)
                | (Confirmed, Completed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Completed => "completed",
        }
    }
}

impl FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ReservationStatus::Pending),
            "confirmed" => Ok(ReservationStatus::Confirmed),
            "cancelled" => Ok(ReservationStatus::Cancelled),
            "completed" => Ok(ReservationStatus::Completed),
            other => Err(format!("unknown reservation status: {other}")),
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Entities ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Car {
    pub id: Ulid,
    pub make: String,
    pub model: String,
    pub year: u16,
    pub color: Option<String>,
    pub daily_rate: Decimal,
    /// Occupancy flag. Kept in step with active rentals and service holds.
    pub is_available: bool,
    /// Staff/maintenance hold: the whole car is down regardless of bookings.
    pub out_of_service: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub email: String,
    pub role: Role,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub is_active: bool,
}

impl User {
    pub fn principal(&self) -> Principal {
        Principal::new(self.id, self.role)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Insurance {
    pub id: Ulid,
    pub car_id: Ulid,
    pub provider: String,
    pub policy_number: String,
    pub coverage_type: String,
    pub expiry_date: Ms,
    pub premium: Decimal,
}

impl Insurance {
    /// True when the policy is still in force at `t`.
    pub fn covers(&self, t: Ms) -> bool {
        self.expiry_date >= t
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rental {
    pub id: Ulid,
    pub car_id: Ulid,
    pub user_id: Ulid,
    pub span: Span,
    pub total_cost: Decimal,
    pub status: RentalStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub car_id: Ulid,
    pub user_id: Ulid,
    pub span: Span,
    pub total_price: Decimal,
    pub status: ReservationStatus,
}

// ── Car timeline ─────────────────────────────────────────────────

/// Which booking table an interval came from, with its current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingKind {
    Rental(RentalStatus),
    Reservation(ReservationStatus),
}

impl BookingKind {
    /// Active rentals and pending/confirmed reservations occupy the car.
    pub fn is_blocking(&self) -> bool {
        match self {
            BookingKind::Rental(s) => *s == RentalStatus::Active,
            BookingKind::Reservation(s) => s.is_blocking(),
        }
    }
}

/// A single booking on a car's timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingInterval {
    pub id: Ulid,
    pub span: Span,
    pub kind: BookingKind,
}

/// Filter for conflict lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindFilter {
    Rentals,
    Reservations,
    Both,
}

impl KindFilter {
    pub fn accepts(self, kind: &BookingKind) -> bool {
        match (self, kind) {
            (KindFilter::Both, _) => true,
            (KindFilter::Rentals, BookingKind::Rental(_)) => true,
            (KindFilter::Reservations, BookingKind::Reservation(_)) => true,
            _ => false,
        }
    }
}

/// All bookings for one car, sorted by `span.start`.
#[derive(Debug, Clone, Default)]
pub struct CarTimeline {
    pub intervals: Vec<BookingInterval>,
}

impl CarTimeline {
    /// Insert interval maintaining sort order by span.start.
    pub fn insert(&mut self, interval: BookingInterval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<BookingInterval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    /// Replace an interval, keeping order (span may have moved).
    pub fn upsert(&mut self, interval: BookingInterval) {
        self.remove(interval.id);
        self.insert(interval);
    }

    /// Intervals whose span overlaps `query` under closed-boundary semantics.
    /// Binary search skips everything starting after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &BookingInterval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start <= query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.end >= query.start)
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }
}

// ── Availability ─────────────────────────────────────────────────

/// Outcome of the conflict query. Unavailability is a value, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Available,
    Unavailable { reason: String },
}

impl Availability {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Availability::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available)
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Availability::Available => None,
            Availability::Unavailable { reason } => Some(reason),
        }
    }
}

// ── Events (WAL record format) ───────────────────────────────────

/// Every committed mutation is exactly one event. Events that move the
/// availability flag carry its resulting value so replay is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CarAdded {
        car: Car,
    },
    CarServiceChanged {
        id: Ulid,
        out_of_service: bool,
        is_available: bool,
    },
    CarRemoved {
        id: Ulid,
    },
    UserRegistered {
        user: User,
    },
    InsuranceAdded {
        insurance: Insurance,
    },
    InsuranceRenewed {
        id: Ulid,
        expiry_date: Ms,
    },
    InsuranceRemoved {
        id: Ulid,
    },
    RentalCreated {
        rental: Rental,
        car_available: bool,
    },
    RentalStatusChanged {
        id: Ulid,
        status: RentalStatus,
        car_available: bool,
    },
    RentalExtended {
        id: Ulid,
        end: Ms,
    },
    /// General edit. `car_flags` lists every car whose flag the edit moved.
    RentalRevised {
        rental: Rental,
        car_flags: Vec<(Ulid, bool)>,
    },
    RentalRemoved {
        id: Ulid,
        car_available: bool,
    },
    ReservationPlaced {
        reservation: Reservation,
    },
    ReservationStatusChanged {
        id: Ulid,
        status: ReservationStatus,
    },
    ReservationRevised {
        reservation: Reservation,
    },
    ReservationRemoved {
        id: Ulid,
    },
}

impl Event {
    /// Short name used in logs and metrics labels.
    pub fn label(&self) -> &'static str {
        match self {
            Event::CarAdded { .. } => "car_added",
            Event::CarServiceChanged { .. } => "car_service_changed",
            Event::CarRemoved { .. } => "car_removed",
            Event::UserRegistered { .. } => "user_registered",
            Event::InsuranceAdded { .. } => "insurance_added",
            Event::InsuranceRenewed { .. } => "insurance_renewed",
            Event::InsuranceRemoved { .. } => "insurance_removed",
            Event::RentalCreated { .. } => "rental_created",
            Event::RentalStatusChanged { .. } => "rental_status_changed",
            Event::RentalExtended { .. } => "rental_extended",
            Event::RentalRevised { .. } => "rental_revised",
            Event::RentalRemoved { .. } => "rental_removed",
            Event::ReservationPlaced { .. } => "reservation_placed",
            Event::ReservationStatusChanged { .. } => "reservation_status_changed",
            Event::ReservationRevised { .. } => "reservation_revised",
            Event::ReservationRemoved { .. } => "reservation_removed",
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// A car whose flag disagrees with what its bookings and service hold imply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagDrift {
    pub car_id: Ulid,
    pub flag: bool,
    pub expected: bool,
}
