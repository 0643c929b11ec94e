use std::path::PathBuf;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use ulid::Ulid;

use super::conflict::{REASON_CAR_DOWN, REASON_NO_INSURANCE, REASON_RENTED, REASON_RESERVED};
use super::*;
use crate::clock::ManualClock;
use crate::model::*;

const H: Ms = HOUR_MS;
const D: Ms = DAY_MS;
/// 2030-01-01T00:00:00Z
const JAN_1: Ms = 1_893_456_000_000;

/// Midnight UTC on the given day of January 2030. Days past 31 roll into
/// February, so `jan(32)` is Feb 1.
fn jan(day: i64) -> Ms {
    JAN_1 + (day - 1) * D
}

fn feb(day: i64) -> Ms {
    jan(31 + day)
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("carhire_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

struct Fleet {
    engine: Arc<Engine>,
    clock: Arc<ManualClock>,
    manager: Principal,
}

impl Fleet {
    async fn new(name: &str) -> Self {
        Self::open(test_wal_path(name)).await
    }

    async fn open(path: PathBuf) -> Self {
        let clock = Arc::new(ManualClock::new(JAN_1));
        let engine = Arc::new(Engine::new(path, clock.clone()).unwrap());
        let manager = match engine
            .store()
            .users()
            .into_iter()
            .find(|u| u.role == Role::Manager)
        {
            Some(user) => user.principal(),
            None => user(&engine, Role::Manager).await,
        };
        Self {
            engine,
            clock,
            manager,
        }
    }

    async fn customer(&self) -> Principal {
        user(&self.engine, Role::Customer).await
    }

    /// A car whose policy runs until `insured_until`.
    async fn car(&self, insured_until: Ms) -> Ulid {
        let car_id = self.uninsured_car().await;
        self.engine
            .add_insurance(NewInsurance {
                id: Ulid::new(),
                car_id,
                provider: "Allianz".into(),
                policy_number: format!("POL-{car_id}"),
                coverage_type: "comprehensive".into(),
                expiry_date: insured_until,
                premium: Decimal::new(45000, 2),
            })
            .await
            .unwrap();
        car_id
    }

    async fn uninsured_car(&self) -> Ulid {
        let car_id = Ulid::new();
        self.engine
            .create_car(NewCar {
                id: car_id,
                make: "Toyota".into(),
                model: "Corolla".into(),
                year: 2027,
                color: Some("grey".into()),
                daily_rate: Decimal::new(4999, 2),
            })
            .await
            .unwrap();
        car_id
    }

    async fn rent(&self, car_id: Ulid, who: &Principal, start: Ms, end: Ms) -> Result<Rental, EngineError> {
        self.engine
            .create_rental(Ulid::new(), car_id, who.id, start, end, Decimal::new(10000, 2))
            .await
    }

    async fn reserve(
        &self,
        car_id: Ulid,
        who: &Principal,
        start: Ms,
        end: Ms,
    ) -> Result<Reservation, EngineError> {
        self.engine
            .create_reservation(Ulid::new(), car_id, who.id, start, end, Decimal::new(8000, 2))
            .await
    }

    fn is_available(&self, car_id: Ulid) -> bool {
        self.engine.get_car(car_id).unwrap().is_available
    }
}

async fn user(engine: &Engine, role: Role) -> Principal {
    let id = Ulid::new();
    engine
        .register_user(NewUser {
            id,
            email: format!("{}@example.com", id.to_string().to_lowercase()),
            role,
            first_name: Some("Test".into()),
            last_name: None,
        })
        .await
        .unwrap()
        .principal()
}

fn conflict_reason(err: EngineError) -> String {
    match err {
        EngineError::Conflict(reason) => reason,
        other => panic!("expected Conflict, got {other:?}"),
    }
}

// ── Booking scenarios ────────────────────────────────────

#[tokio::test]
async fn reservation_next_to_rental_is_judged_on_the_timeline() {
    let f = Fleet::new("rental_then_reserve.wal").await;
    let car = f.car(jan(20)).await;
    let renter = f.customer().await;

    f.rent(car, &renter, jan(10), jan(15)).await.unwrap();
    assert!(!f.is_available(car));

    let inside = f.engine.check_availability(car, jan(12), jan(14)).unwrap();
    assert_eq!(inside.message(), Some(REASON_RENTED));

    let after = f.engine.check_availability(car, jan(16), jan(18)).unwrap();
    assert!(after.is_available());

    let other = f.customer().await;
    f.reserve(car, &other, jan(16), jan(18)).await.unwrap();
    let err = f.reserve(car, &other, jan(12), jan(14)).await.unwrap_err();
    assert_eq!(conflict_reason(err), REASON_RENTED);
}

#[tokio::test]
async fn pending_reservation_blocks_rental_until_cancelled() {
    let f = Fleet::new("reserve_then_rent.wal").await;
    let car = f.car(feb(10)).await;
    let first = f.customer().await;
    let second = f.customer().await;

    let held = f.reserve(car, &first, feb(1), feb(3)).await.unwrap();
    assert_eq!(held.status, ReservationStatus::Pending);
    // Reservations do not move the flag.
    assert!(f.is_available(car));

    let err = f.rent(car, &second, feb(2), feb(3)).await.unwrap_err();
    assert_eq!(conflict_reason(err), REASON_RESERVED);

    f.engine.cancel_reservation(held.id, &first).await.unwrap();
    let rental = f.rent(car, &second, feb(2), feb(3)).await.unwrap();
    assert_eq!(rental.status, RentalStatus::Active);
}

#[tokio::test]
async fn touching_windows_conflict() {
    let f = Fleet::new("touching.wal").await;
    let car = f.car(jan(30)).await;
    let renter = f.customer().await;

    f.rent(car, &renter, jan(10), jan(15)).await.unwrap();
    let err = f.rent(car, &renter, jan(15), jan(17)).await.unwrap_err();
    assert_eq!(conflict_reason(err), REASON_RENTED);
    f.rent(car, &renter, jan(15) + 1, jan(17)).await.unwrap();
}

#[tokio::test]
async fn insurance_must_cover_the_booking_end() {
    let f = Fleet::new("insurance_gate.wal").await;
    let renter = f.customer().await;

    let bare = f.uninsured_car().await;
    let err = f.rent(bare, &renter, jan(10), jan(12)).await.unwrap_err();
    assert_eq!(conflict_reason(err), REASON_NO_INSURANCE);

    let car = f.car(jan(12)).await;
    let err = f.rent(car, &renter, jan(10), jan(12) + 1).await.unwrap_err();
    assert_eq!(conflict_reason(err), REASON_NO_INSURANCE);
    let err = f.reserve(car, &renter, jan(11), jan(13)).await.unwrap_err();
    assert_eq!(conflict_reason(err), REASON_NO_INSURANCE);

    // Expiry on the end instant still counts.
    f.rent(car, &renter, jan(10), jan(12)).await.unwrap();
}

#[tokio::test]
async fn minimum_durations() {
    let f = Fleet::new("min_duration.wal").await;
    let car = f.car(jan(30)).await;
    let renter = f.customer().await;

    let err = f.rent(car, &renter, jan(2), jan(3) - 1).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(msg) if msg.contains("1 day")));
    f.rent(car, &renter, jan(2), jan(3)).await.unwrap();

    let err = f.reserve(car, &renter, jan(10), jan(10) + H - 1).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(msg) if msg.contains("1 hour")));
    f.reserve(car, &renter, jan(10), jan(10) + H).await.unwrap();
}

#[tokio::test]
async fn window_checks_come_before_conflict_checks() {
    let f = Fleet::new("validation_order.wal").await;
    let car = f.car(jan(30)).await;
    let renter = f.customer().await;
    f.rent(car, &renter, jan(10), jan(15)).await.unwrap();

    // Overlaps the rental, but is too short: reported as bad input.
    let err = f.rent(car, &renter, jan(11), jan(11) + 12 * H).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));

    let err = f.rent(car, &renter, jan(12), jan(11)).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(msg) if msg.contains("after start")));

    f.clock.set(jan(5));
    let err = f.rent(car, &renter, jan(4), jan(6)).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(msg) if msg.contains("past")));
}

#[tokio::test]
async fn only_customers_hold_bookings() {
    let f = Fleet::new("renter_role.wal").await;
    let car = f.car(jan(30)).await;

    let err = f.rent(car, &f.manager, jan(2), jan(4)).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));

    let ghost = Principal::new(Ulid::new(), Role::Customer);
    let err = f.reserve(car, &ghost, jan(2), jan(4)).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(id) if id == ghost.id));

    let missing_car = Ulid::new();
    let renter = f.customer().await;
    let err = f.rent(missing_car, &renter, jan(2), jan(4)).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(id) if id == missing_car));
}

#[tokio::test]
async fn duplicate_booking_id_is_rejected() {
    let f = Fleet::new("dup_booking.wal").await;
    let car = f.car(jan(30)).await;
    let renter = f.customer().await;
    let rental = f.rent(car, &renter, jan(2), jan(4)).await.unwrap();

    let err = f
        .engine
        .create_reservation(rental.id, car, renter.id, jan(20), jan(21), Decimal::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
}

#[tokio::test]
async fn negative_amounts_are_invalid_input() {
    let f = Fleet::new("negative_amounts.wal").await;
    let car = f.car(jan(30)).await;
    let renter = f.customer().await;
    let minus_one = Decimal::NEGATIVE_ONE;

    let err = f
        .engine
        .create_rental(Ulid::new(), car, renter.id, jan(2), jan(4), minus_one)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
    let err = f
        .engine
        .create_reservation(Ulid::new(), car, renter.id, jan(5), jan(6), minus_one)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));

    let free = f
        .engine
        .create_reservation(Ulid::new(), car, renter.id, jan(5), jan(6), Decimal::ZERO)
        .await
        .unwrap();
    let patch = ReservationPatch {
        total_price: Some(minus_one),
        ..Default::default()
    };
    let err = f
        .engine
        .update_reservation(free.id, patch, &renter)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn booking_id_cannot_be_reused_on_another_car() {
    let f = Fleet::new("dup_booking_other_car.wal").await;
    let car_a = f.car(jan(30)).await;
    let car_b = f.car(jan(30)).await;
    let renter = f.customer().await;
    let rental = f.rent(car_a, &renter, jan(2), jan(4)).await.unwrap();

    let err = f
        .engine
        .create_rental(rental.id, car_b, renter.id, jan(2), jan(4), Decimal::ONE)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
    let err = f
        .engine
        .create_reservation(rental.id, car_b, renter.id, jan(10), jan(11), Decimal::ONE)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));

    assert!(f.engine.rentals_for_car(car_b).unwrap().is_empty());
    assert!(f.engine.reservations_for_car(car_b).unwrap().is_empty());
    assert!(f.is_available(car_b));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_rentals_with_one_id_admit_one() {
    let f = Fleet::new("dup_booking_race.wal").await;
    let car_a = f.car(jan(30)).await;
    let car_b = f.car(jan(30)).await;
    let renter = f.customer().await;
    let id = Ulid::new();

    let (on_a, on_b) = tokio::join!(
        f.engine
            .create_rental(id, car_a, renter.id, jan(2), jan(4), Decimal::ONE),
        f.engine
            .create_rental(id, car_b, renter.id, jan(2), jan(4), Decimal::ONE),
    );
    assert_eq!(on_a.is_ok() as u8 + on_b.is_ok() as u8, 1);
    let (winner, loser, refused) = match (on_a, on_b) {
        (Ok(_), Err(e)) => (car_a, car_b, e),
        (Err(e), Ok(_)) => (car_b, car_a, e),
        _ => unreachable!(),
    };
    assert!(matches!(refused, EngineError::Conflict(_)));

    assert_eq!(f.engine.get_rental(id, &f.manager).unwrap().car_id, winner);
    assert_eq!(f.engine.store().timeline_len(&loser), 0);
    assert!(f.is_available(loser));
    assert!(!f.is_available(winner));
    assert!(f.engine.reconcile_availability().is_empty());

    // The losing car is genuinely free for the same window.
    f.rent(loser, &renter, jan(2), jan(4)).await.unwrap();

    f.engine
        .update_rental_status(id, RentalStatus::Cancelled)
        .await
        .unwrap();
    assert!(f.is_available(winner));
    f.rent(winner, &renter, jan(2), jan(4)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_reservations_with_one_id_admit_one() {
    let f = Fleet::new("dup_reservation_race.wal").await;
    let car_a = f.car(jan(30)).await;
    let car_b = f.car(jan(30)).await;
    let renter = f.customer().await;
    let id = Ulid::new();

    let (on_a, on_b) = tokio::join!(
        f.engine
            .create_reservation(id, car_a, renter.id, jan(5), jan(6), Decimal::ONE),
        f.engine
            .create_reservation(id, car_b, renter.id, jan(5), jan(6), Decimal::ONE),
    );
    assert_eq!(on_a.is_ok() as u8 + on_b.is_ok() as u8, 1);
    let loser = if on_a.is_ok() { car_b } else { car_a };
    assert_eq!(f.engine.store().timeline_len(&loser), 0);
    f.reserve(loser, &renter, jan(5), jan(6)).await.unwrap();

    // Same id once more, this time as a rental racing a reservation.
    let id = Ulid::new();
    let (rented, reserved) = tokio::join!(
        f.engine
            .create_rental(id, car_a, renter.id, jan(10), jan(12), Decimal::ONE),
        f.engine
            .create_reservation(id, car_b, renter.id, jan(10), jan(12), Decimal::ONE),
    );
    assert_eq!(rented.is_ok() as u8 + reserved.is_ok() as u8, 1);
    let store = f.engine.store();
    assert_eq!(
        store.find_rental(&id).is_some() as u8 + store.find_reservation(&id).is_some() as u8,
        1
    );
    assert!(f.engine.reconcile_availability().is_empty());
}

// ── Rental lifecycle ─────────────────────────────────────

#[tokio::test]
async fn flag_follows_rental_lifecycle() {
    let f = Fleet::new("flag_lifecycle.wal").await;
    let car = f.car(jan(30)).await;
    let renter = f.customer().await;

    let a = f.rent(car, &renter, jan(2), jan(4)).await.unwrap();
    let b = f.rent(car, &renter, jan(6), jan(8)).await.unwrap();
    assert!(!f.is_available(car));

    f.engine
        .update_rental_status(a.id, RentalStatus::Completed)
        .await
        .unwrap();
    // `b` still holds the car.
    assert!(!f.is_available(car));

    f.engine
        .update_rental_status(b.id, RentalStatus::Cancelled)
        .await
        .unwrap();
    assert!(f.is_available(car));
    assert!(f.engine.reconcile_availability().is_empty());
}

#[tokio::test]
async fn terminal_rentals_and_reservations_stay_put() {
    let f = Fleet::new("terminal.wal").await;
    let car = f.car(jan(30)).await;
    let renter = f.customer().await;

    let done = f.rent(car, &renter, jan(2), jan(4)).await.unwrap();
    f.engine
        .update_rental_status(done.id, RentalStatus::Completed)
        .await
        .unwrap();
    for next in [
        RentalStatus::Active,
        RentalStatus::Cancelled,
        RentalStatus::Overdue,
        RentalStatus::Completed,
    ] {
        let err = f.engine.update_rental_status(done.id, next).await.unwrap_err();
        assert!(matches!(err, EngineError::IllegalTransition(_)), "{next:?}");
    }

    let held = f.reserve(car, &renter, jan(10), jan(11)).await.unwrap();
    f.engine.cancel_reservation(held.id, &renter).await.unwrap();
    let err = f.engine.cancel_reservation(held.id, &renter).await.unwrap_err();
    assert!(matches!(err, EngineError::IllegalTransition(_)));
    let err = f.engine.confirm_reservation(held.id).await.unwrap_err();
    assert!(matches!(err, EngineError::IllegalTransition(_)));

    let kept = f.reserve(car, &renter, jan(12), jan(13)).await.unwrap();
    f.engine.confirm_reservation(kept.id).await.unwrap();
    f.engine
        .update_reservation_status(kept.id, ReservationStatus::Completed)
        .await
        .unwrap();
    let err = f
        .engine
        .update_reservation_status(kept.id, ReservationStatus::Cancelled)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::IllegalTransition(_)));
}

#[tokio::test]
async fn overdue_rental_rechecks_before_reactivating() {
    let f = Fleet::new("overdue.wal").await;
    let car = f.car(jan(30)).await;
    let renter = f.customer().await;

    let late = f.rent(car, &renter, jan(2), jan(5)).await.unwrap();
    f.engine
        .update_rental_status(late.id, RentalStatus::Overdue)
        .await
        .unwrap();
    assert!(f.is_available(car));

    // Overdue no longer blocks, so the stretch can be rebooked.
    f.rent(car, &renter, jan(4), jan(6)).await.unwrap();
    let err = f
        .engine
        .update_rental_status(late.id, RentalStatus::Active)
        .await
        .unwrap_err();
    assert_eq!(conflict_reason(err), REASON_RENTED);

    f.engine
        .update_rental_status(late.id, RentalStatus::Completed)
        .await
        .unwrap();
}

#[tokio::test]
async fn overdue_report_lists_active_rentals_past_their_end() {
    let f = Fleet::new("overdue_report.wal").await;
    let car = f.car(jan(30)).await;
    let renter = f.customer().await;

    let early = f.rent(car, &renter, jan(2), jan(4)).await.unwrap();
    let later = f.rent(car, &renter, jan(6), jan(9)).await.unwrap();
    assert!(f.engine.overdue_rentals().is_empty());

    f.clock.set(jan(5));
    let overdue: Vec<Ulid> = f.engine.overdue_rentals().iter().map(|r| r.id).collect();
    assert_eq!(overdue, vec![early.id]);

    f.clock.set(jan(10));
    assert_eq!(f.engine.overdue_rentals().len(), 2);
    f.engine
        .update_rental_status(later.id, RentalStatus::Completed)
        .await
        .unwrap();
    assert_eq!(f.engine.overdue_rentals().len(), 1);
}

#[tokio::test]
async fn extend_checks_only_the_added_stretch() {
    let f = Fleet::new("extend.wal").await;
    let car = f.car(jan(30)).await;
    let renter = f.customer().await;
    let other = f.customer().await;

    let rental = f.rent(car, &renter, jan(2), jan(5)).await.unwrap();
    f.reserve(car, &other, jan(9), jan(10)).await.unwrap();

    let extended = f.engine.extend_rental(rental.id, jan(7), &renter).await.unwrap();
    assert_eq!(extended.span, Span::new(jan(2), jan(7)));

    let err = f
        .engine
        .extend_rental(rental.id, jan(9) + H, &renter)
        .await
        .unwrap_err();
    assert_eq!(
        conflict_reason(err),
        format!("cannot extend rental: {REASON_RESERVED}")
    );

    let err = f
        .engine
        .extend_rental(rental.id, jan(31), &renter)
        .await
        .unwrap_err();
    assert!(conflict_reason(err).contains(REASON_NO_INSURANCE));

    let err = f.engine.extend_rental(rental.id, jan(6), &renter).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));

    let err = f.engine.extend_rental(rental.id, jan(8), &other).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    f.engine
        .update_rental_status(rental.id, RentalStatus::Completed)
        .await
        .unwrap();
    let err = f.engine.extend_rental(rental.id, jan(8), &renter).await.unwrap_err();
    assert!(matches!(err, EngineError::IllegalTransition(_)));
}

#[tokio::test]
async fn moving_a_rental_moves_the_flag() {
    let f = Fleet::new("move_rental.wal").await;
    let from = f.car(jan(30)).await;
    let to = f.car(jan(30)).await;
    let renter = f.customer().await;

    let rental = f.rent(from, &renter, jan(2), jan(5)).await.unwrap();
    let moved = f
        .engine
        .update_rental(
            rental.id,
            RentalPatch {
                car_id: Some(to),
                ..Default::default()
            },
            &f.manager,
        )
        .await
        .unwrap();
    assert_eq!(moved.car_id, to);
    assert!(f.is_available(from));
    assert!(!f.is_available(to));
    assert!(f.engine.reconcile_availability().is_empty());

    // The old car is free again for the same stretch.
    f.rent(from, &renter, jan(2), jan(5)).await.unwrap();
}

#[tokio::test]
async fn rental_edit_rechecks_against_others_but_not_itself() {
    let f = Fleet::new("edit_rental.wal").await;
    let car = f.car(jan(30)).await;
    let renter = f.customer().await;

    let rental = f.rent(car, &renter, jan(2), jan(5)).await.unwrap();
    f.rent(car, &renter, jan(10), jan(12)).await.unwrap();

    let shifted = f
        .engine
        .update_rental(
            rental.id,
            RentalPatch {
                start: Some(jan(3)),
                end: Some(jan(6)),
                ..Default::default()
            },
            &renter,
        )
        .await
        .unwrap();
    assert_eq!(shifted.span, Span::new(jan(3), jan(6)));

    let err = f
        .engine
        .update_rental(
            rental.id,
            RentalPatch {
                end: Some(jan(11)),
                ..Default::default()
            },
            &renter,
        )
        .await
        .unwrap_err();
    assert_eq!(conflict_reason(err), REASON_RENTED);

    let price_only = f
        .engine
        .update_rental(
            rental.id,
            RentalPatch {
                total_cost: Some(Decimal::new(25000, 2)),
                ..Default::default()
            },
            &renter,
        )
        .await
        .unwrap();
    assert_eq!(price_only.total_cost, Decimal::new(25000, 2));
    assert_eq!(price_only.span, shifted.span);
}

#[tokio::test]
async fn only_staff_delete_rentals_and_only_finished_ones() {
    let f = Fleet::new("remove_rental.wal").await;
    let car = f.car(jan(30)).await;
    let renter = f.customer().await;

    let rental = f.rent(car, &renter, jan(2), jan(5)).await.unwrap();
    let err = f.engine.remove_rental(rental.id, &renter).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));
    let err = f.engine.remove_rental(rental.id, &f.manager).await.unwrap_err();
    assert!(matches!(err, EngineError::IllegalTransition(_)));

    f.engine
        .update_rental_status(rental.id, RentalStatus::Cancelled)
        .await
        .unwrap();
    f.engine.remove_rental(rental.id, &f.manager).await.unwrap();
    assert!(matches!(
        f.engine.get_rental(rental.id, &f.manager),
        Err(EngineError::NotFound(_))
    ));
    assert_eq!(f.engine.store().timeline_len(&car), 0);
}

// ── Reservations ─────────────────────────────────────────

#[tokio::test]
async fn confirming_rechecks_the_car() {
    let f = Fleet::new("confirm_recheck.wal").await;
    let car = f.car(jan(30)).await;
    let renter = f.customer().await;

    let held = f.reserve(car, &renter, jan(10), jan(11)).await.unwrap();
    f.engine.set_car_service(car, true).await.unwrap();

    let err = f.engine.confirm_reservation(held.id).await.unwrap_err();
    assert!(conflict_reason(err).contains(REASON_CAR_DOWN));

    f.engine.set_car_service(car, false).await.unwrap();
    let confirmed = f.engine.confirm_reservation(held.id).await.unwrap();
    assert_eq!(confirmed.status, ReservationStatus::Confirmed);
}

#[tokio::test]
async fn customers_edit_only_their_pending_reservations() {
    let f = Fleet::new("edit_reservation.wal").await;
    let car = f.car(jan(30)).await;
    let renter = f.customer().await;

    let held = f.reserve(car, &renter, jan(10), jan(11)).await.unwrap();
    let moved = f
        .engine
        .update_reservation(
            held.id,
            ReservationPatch {
                start: Some(jan(12)),
                end: Some(jan(13)),
                ..Default::default()
            },
            &renter,
        )
        .await
        .unwrap();
    assert_eq!(moved.span, Span::new(jan(12), jan(13)));

    f.engine.confirm_reservation(held.id).await.unwrap();
    let err = f
        .engine
        .update_reservation(
            held.id,
            ReservationPatch {
                end: Some(jan(14)),
                ..Default::default()
            },
            &renter,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    let err = f.engine.remove_reservation(held.id, &f.manager).await.unwrap_err();
    assert!(matches!(err, EngineError::IllegalTransition(_)));
}

#[tokio::test]
async fn upcoming_reservations_are_soonest_first() {
    let f = Fleet::new("upcoming.wal").await;
    let car = f.car(jan(30)).await;
    let renter = f.customer().await;

    let later = f.reserve(car, &renter, jan(6), jan(7)).await.unwrap();
    let sooner = f.reserve(car, &renter, jan(3), jan(4)).await.unwrap();
    let far = f.reserve(car, &renter, jan(25), jan(26)).await.unwrap();
    let cancelled = f.reserve(car, &renter, jan(4) + H, jan(5)).await.unwrap();
    f.engine.cancel_reservation(cancelled.id, &renter).await.unwrap();

    let ids: Vec<Ulid> = f
        .engine
        .upcoming_reservations(7 * D)
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec![sooner.id, later.id]);
    assert!(!ids.contains(&far.id));
}

// ── Ownership ────────────────────────────────────────────

#[tokio::test]
async fn customers_cannot_touch_each_others_bookings() {
    let f = Fleet::new("ownership.wal").await;
    let car = f.car(jan(30)).await;
    let owner = f.customer().await;
    let stranger = f.customer().await;

    let rental = f.rent(car, &owner, jan(2), jan(4)).await.unwrap();
    let held = f.reserve(car, &owner, jan(10), jan(11)).await.unwrap();

    assert!(matches!(
        f.engine.get_rental(rental.id, &stranger),
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        f.engine.get_reservation(held.id, &stranger),
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        f.engine.rentals_for_user(owner.id, &stranger),
        Err(EngineError::Forbidden(_))
    ));
    let err = f
        .engine
        .update_rental(rental.id, RentalPatch::default(), &stranger)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));
    let err = f.engine.cancel_reservation(held.id, &stranger).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    let err = f
        .engine
        .update_rental(
            rental.id,
            RentalPatch {
                user_id: Some(stranger.id),
                ..Default::default()
            },
            &owner,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    f.engine.get_rental(rental.id, &owner).unwrap();
    f.engine.get_rental(rental.id, &f.manager).unwrap();
    assert_eq!(f.engine.rentals_for_user(owner.id, &f.manager).unwrap().len(), 1);
    f.engine
        .update_rental(
            rental.id,
            RentalPatch {
                total_cost: Some(Decimal::new(12000, 2)),
                ..Default::default()
            },
            &f.manager,
        )
        .await
        .unwrap();
    f.engine.cancel_reservation(held.id, &f.manager).await.unwrap();
}

// ── Fleet and insurance ──────────────────────────────────

#[tokio::test]
async fn car_out_of_service_is_unavailable() {
    let f = Fleet::new("service_hold.wal").await;
    let car = f.car(jan(30)).await;
    let renter = f.customer().await;

    f.engine.set_car_service(car, true).await.unwrap();
    assert!(!f.is_available(car));
    let err = f.rent(car, &renter, jan(2), jan(4)).await.unwrap_err();
    assert_eq!(conflict_reason(err), REASON_CAR_DOWN);
    assert!(f.engine.free_windows(car, jan(2), jan(9)).unwrap().is_empty());
    assert!(f.engine.available_cars(jan(2), jan(4)).unwrap().is_empty());

    f.engine.set_car_service(car, false).await.unwrap();
    assert!(f.is_available(car));
    f.rent(car, &renter, jan(2), jan(4)).await.unwrap();

    // Back from service with a rental still running: flag stays down.
    f.engine.set_car_service(car, true).await.unwrap();
    f.engine.set_car_service(car, false).await.unwrap();
    assert!(!f.is_available(car));
}

#[tokio::test]
async fn free_windows_skip_bookings_and_uninsured_time() {
    let f = Fleet::new("free_windows.wal").await;
    let car = f.car(jan(20)).await;
    let renter = f.customer().await;

    f.rent(car, &renter, jan(10), jan(15)).await.unwrap();
    f.reserve(car, &renter, jan(6), jan(7)).await.unwrap();

    let windows = f.engine.free_windows(car, jan(5), jan(25)).unwrap();
    assert_eq!(
        windows,
        vec![
            Span::new(jan(5), jan(6)),
            Span::new(jan(7), jan(10)),
            Span::new(jan(15), jan(20)),
        ]
    );

    let err = f.engine.free_windows(car, jan(5), jan(5)).unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn available_cars_filters_by_window() {
    let f = Fleet::new("available_cars.wal").await;
    let busy = f.car(jan(30)).await;
    let free = f.car(jan(30)).await;
    let short_cover = f.car(jan(5)).await;
    let renter = f.customer().await;
    f.rent(busy, &renter, jan(2), jan(8)).await.unwrap();

    let ids: Vec<Ulid> = f
        .engine
        .available_cars(jan(3), jan(6))
        .unwrap()
        .iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(ids, vec![free]);
    assert!(!ids.contains(&short_cover));

    let later: Vec<Ulid> = f
        .engine
        .available_cars(jan(9), jan(10))
        .unwrap()
        .iter()
        .map(|c| c.id)
        .collect();
    assert!(later.contains(&busy) && later.contains(&free));
}

#[tokio::test]
async fn insurance_rules() {
    let f = Fleet::new("insurance_rules.wal").await;
    let car = f.car(jan(10)).await;
    let policy = f.engine.insurance_for_car(car).unwrap().unwrap();

    let err = f
        .engine
        .add_insurance(NewInsurance {
            id: Ulid::new(),
            car_id: car,
            provider: "AXA".into(),
            policy_number: "SECOND".into(),
            coverage_type: "basic".into(),
            expiry_date: jan(20),
            premium: Decimal::ONE,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));

    let err = f.engine.renew_insurance(policy.id, jan(9)).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
    let renewed = f.engine.renew_insurance(policy.id, jan(25)).await.unwrap();
    assert_eq!(renewed.expiry_date, jan(25));

    let expiring = f.engine.expiring_insurances(30 * D);
    assert_eq!(expiring.len(), 1);
    assert!(f.engine.expiring_insurances(7 * D).is_empty());

    let renter = f.customer().await;
    let rental = f.rent(car, &renter, jan(2), jan(4)).await.unwrap();
    let err = f.engine.remove_insurance(policy.id).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
    f.engine
        .update_rental_status(rental.id, RentalStatus::Completed)
        .await
        .unwrap();
    f.engine.remove_insurance(policy.id).await.unwrap();
    assert!(f.engine.insurance_for_car(car).unwrap().is_none());

    let bare = f.uninsured_car().await;
    let err = f
        .engine
        .add_insurance(NewInsurance {
            id: Ulid::new(),
            car_id: bare,
            provider: "AXA".into(),
            policy_number: "LAPSED".into(),
            coverage_type: "basic".into(),
            expiry_date: JAN_1 - D,
            premium: Decimal::ONE,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn removing_a_car_needs_it_idle_and_takes_its_history() {
    let f = Fleet::new("remove_car.wal").await;
    let car = f.car(jan(30)).await;
    let renter = f.customer().await;

    let rental = f.rent(car, &renter, jan(2), jan(4)).await.unwrap();
    let held = f.reserve(car, &renter, jan(10), jan(11)).await.unwrap();

    let err = f.engine.remove_car(car).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
    f.engine
        .update_rental_status(rental.id, RentalStatus::Completed)
        .await
        .unwrap();
    let err = f.engine.remove_car(car).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
    f.engine.cancel_reservation(held.id, &renter).await.unwrap();

    f.engine.remove_car(car).await.unwrap();
    assert!(matches!(f.engine.get_car(car), Err(EngineError::NotFound(_))));
    assert!(matches!(
        f.engine.get_rental(rental.id, &f.manager),
        Err(EngineError::NotFound(_))
    ));
    assert!(f.engine.store().insurances().is_empty());
}

#[tokio::test]
async fn user_registration_rules() {
    let f = Fleet::new("users.wal").await;
    let new_user = |email: &str| NewUser {
        id: Ulid::new(),
        email: email.into(),
        role: Role::Customer,
        first_name: None,
        last_name: None,
    };

    let user = f.engine.register_user(new_user(" Ada@Example.com ")).await.unwrap();
    assert_eq!(user.email, "ada@example.com");
    let err = f.engine.register_user(new_user("ada@example.com")).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
    let err = f.engine.register_user(new_user("not-an-email")).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_registrations_keep_ids_and_emails_unique() {
    let f = Fleet::new("users_race.wal").await;
    let new_user = |id: Ulid, email: &str| NewUser {
        id,
        email: email.into(),
        role: Role::Customer,
        first_name: None,
        last_name: None,
    };

    let (first, second) = tokio::join!(
        f.engine.register_user(new_user(Ulid::new(), "grace@example.com")),
        f.engine.register_user(new_user(Ulid::new(), "Grace@Example.com")),
    );
    assert_eq!(first.is_ok() as u8 + second.is_ok() as u8, 1);
    let winner = first.as_ref().or(second.as_ref()).unwrap().id;
    let holders: Vec<User> = f
        .engine
        .store()
        .users()
        .into_iter()
        .filter(|u| u.email == "grace@example.com")
        .collect();
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].id, winner);

    let id = Ulid::new();
    let (first, second) = tokio::join!(
        f.engine.register_user(new_user(id, "linus@example.com")),
        f.engine.register_user(new_user(id, "ken@example.com")),
    );
    assert_eq!(first.is_ok() as u8 + second.is_ok() as u8, 1);
    let err = first.as_ref().err().or(second.as_ref().err()).unwrap();
    assert!(matches!(err, EngineError::Conflict(_)));
    let kept = first.or(second).unwrap();
    assert_eq!(f.engine.get_user(id).unwrap().email, kept.email);
}

#[tokio::test]
async fn bootstrap_admin_runs_once() {
    let f = Fleet::new("bootstrap.wal").await;
    let (admin, created) = f.engine.bootstrap_admin(None).await.unwrap();
    assert!(created);
    assert_eq!(admin.role, Role::Admin);

    let (again, created) = f.engine.bootstrap_admin(None).await.unwrap();
    assert!(!created);
    assert_eq!(again.id, admin.id);

    let err = f.engine.bootstrap_admin(Some(f.manager.id)).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
}

// ── Flag reconciliation ──────────────────────────────────

#[tokio::test]
async fn reconciliation_reports_drifted_flags() {
    let f = Fleet::new("drift.wal").await;
    let car = f.car(jan(30)).await;
    let renter = f.customer().await;
    f.rent(car, &renter, jan(2), jan(4)).await.unwrap();
    assert!(f.engine.reconcile_availability().is_empty());

    let idle = f.car(jan(30)).await;
    f.engine.store().apply_event(&Event::CarServiceChanged {
        id: idle,
        out_of_service: false,
        is_available: false,
    });
    let drift = f.engine.reconcile_availability();
    assert_eq!(
        drift,
        vec![FlagDrift {
            car_id: idle,
            flag: false,
            expected: true,
        }]
    );

    // The fast path still trusts a flag no rental explains.
    let outcome = f.engine.check_availability(idle, jan(10), jan(12)).unwrap();
    assert_eq!(outcome.message(), Some(REASON_CAR_DOWN));
}

#[tokio::test]
async fn random_single_threaded_history_keeps_flags_consistent() {
    let f = Fleet::new("flag_property.wal").await;
    let mut rng = StdRng::seed_from_u64(7);
    let cars = [f.car(feb(28)).await, f.car(feb(28)).await, f.car(feb(28)).await];
    let renter = f.customer().await;
    let mut rentals: Vec<Ulid> = Vec::new();

    for _ in 0..200 {
        let car = cars[rng.gen_range(0..cars.len())];
        match rng.gen_range(0..4) {
            0 | 1 => {
                let start = jan(2) + rng.gen_range(0..40) * H * 12;
                let end = start + D + rng.gen_range(0..6) * H * 12;
                if let Ok(r) = f.rent(car, &renter, start, end).await {
                    rentals.push(r.id);
                }
            }
            2 if !rentals.is_empty() => {
                let id = rentals[rng.gen_range(0..rentals.len())];
                let next = [
                    RentalStatus::Completed,
                    RentalStatus::Cancelled,
                    RentalStatus::Overdue,
                    RentalStatus::Active,
                ][rng.gen_range(0..4)];
                let _ = f.engine.update_rental_status(id, next).await;
            }
            _ => {
                let _ = f.engine.set_car_service(car, rng.gen_bool(0.3)).await;
            }
        }
        assert!(f.engine.reconcile_availability().is_empty());
    }
}

// ── Concurrency ──────────────────────────────────────────

fn assert_no_overlap(spans: &[Span]) {
    for (i, a) in spans.iter().enumerate() {
        for b in &spans[i + 1..] {
            assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_bookings_never_double_book() {
    let f = Fleet::new("concurrent.wal").await;
    let car = f.car(feb(28)).await;
    let mut customers = Vec::new();
    for _ in 0..4 {
        customers.push(f.customer().await);
    }

    let mut rng = StdRng::seed_from_u64(42);
    let mut handles = Vec::new();
    for i in 0..64 {
        let engine = f.engine.clone();
        let who = customers[i % customers.len()].id;
        let start = jan(2) + rng.gen_range(0..30) * 6 * H;
        let end = start + D + rng.gen_range(0..8) * 6 * H;
        let as_rental = rng.gen_bool(0.5);
        handles.push(tokio::spawn(async move {
            let id = Ulid::new();
            let cost = Decimal::new(5000, 2);
            let accepted = if as_rental {
                engine.create_rental(id, car, who, start, end, cost).await.is_ok()
            } else {
                engine.create_reservation(id, car, who, start, end, cost).await.is_ok()
            };
            accepted.then_some(Span::new(start, end))
        }));
    }

    let mut accepted = Vec::new();
    for handle in handles {
        if let Some(span) = handle.await.unwrap() {
            accepted.push(span);
        }
    }
    assert!(!accepted.is_empty());
    assert_no_overlap(&accepted);

    let stored: Vec<Span> = f
        .engine
        .store()
        .rentals_where(|r| r.car_id == car)
        .into_iter()
        .map(|r| r.span)
        .chain(
            f.engine
                .store()
                .reservations_where(|r| r.car_id == car)
                .into_iter()
                .map(|r| r.span),
        )
        .collect();
    assert_eq!(stored.len(), accepted.len());
    assert_no_overlap(&stored);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn identical_concurrent_requests_admit_exactly_one() {
    let f = Fleet::new("identical.wal").await;
    let car = f.car(jan(30)).await;
    let renter = f.customer().await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = f.engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .create_rental(Ulid::new(), car, renter.id, jan(3), jan(6), Decimal::ONE)
                .await
        }));
    }
    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert_eq!(conflict_reason(e), REASON_RENTED),
        }
    }
    assert_eq!(ok, 1);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let path = test_wal_path("restart.wal");
    let (car, rental_id, held_id) = {
        let f = Fleet::open(path.clone()).await;
        let car = f.car(jan(30)).await;
        let renter = f.customer().await;
        let rental = f.rent(car, &renter, jan(2), jan(5)).await.unwrap();
        f.engine.extend_rental(rental.id, jan(6), &renter).await.unwrap();
        let held = f.reserve(car, &renter, jan(10), jan(11)).await.unwrap();
        f.engine.confirm_reservation(held.id).await.unwrap();
        (car, rental.id, held.id)
    };

    let f = Fleet::open(path).await;
    assert!(!f.is_available(car));
    let rental = f.engine.get_rental(rental_id, &f.manager).unwrap();
    assert_eq!(rental.span, Span::new(jan(2), jan(6)));
    let held = f.engine.get_reservation(held_id, &f.manager).unwrap();
    assert_eq!(held.status, ReservationStatus::Confirmed);
    assert!(f.engine.reconcile_availability().is_empty());

    let renter = f.customer().await;
    let err = f.rent(car, &renter, jan(5), jan(7)).await.unwrap_err();
    assert_eq!(conflict_reason(err), REASON_RENTED);
}

#[tokio::test]
async fn compaction_keeps_state_and_resets_counter() {
    let path = test_wal_path("compaction.wal");
    let (car, done_id, live_id) = {
        let f = Fleet::open(path.clone()).await;
        let car = f.car(jan(30)).await;
        let renter = f.customer().await;
        let done = f.rent(car, &renter, jan(2), jan(4)).await.unwrap();
        f.engine
            .update_rental_status(done.id, RentalStatus::Completed)
            .await
            .unwrap();
        let live = f.rent(car, &renter, jan(8), jan(9)).await.unwrap();
        for day in 12..16 {
            let held = f.reserve(car, &renter, jan(day), jan(day) + H).await.unwrap();
            f.engine.cancel_reservation(held.id, &renter).await.unwrap();
        }

        assert!(f.engine.wal_appends_since_compact().await > 10);
        let written = f.engine.compact_wal().await.unwrap();
        assert!(written > 0);
        assert_eq!(f.engine.wal_appends_since_compact().await, 0);
        (car, done.id, live.id)
    };

    let f = Fleet::open(path).await;
    assert!(!f.is_available(car));
    let done = f.engine.get_rental(done_id, &f.manager).unwrap();
    assert_eq!(done.status, RentalStatus::Completed);
    let live = f.engine.get_rental(live_id, &f.manager).unwrap();
    assert_eq!(live.status, RentalStatus::Active);
    assert_eq!(
        f.engine
            .reservations_by_status(ReservationStatus::Cancelled)
            .len(),
        4
    );
    assert!(f.engine.reconcile_availability().is_empty());
}

#[tokio::test]
async fn refused_bookings_leave_no_trace() {
    let path = test_wal_path("refused.wal");
    let car = {
        let f = Fleet::open(path.clone()).await;
        let car = f.car(jan(30)).await;
        let renter = f.customer().await;
        f.rent(car, &renter, jan(2), jan(5)).await.unwrap();
        let before = f.engine.wal_appends_since_compact().await;
        assert!(f.rent(car, &renter, jan(3), jan(6)).await.is_err());
        assert!(f.reserve(car, &renter, jan(4), jan(4) + H).await.is_err());
        assert_eq!(f.engine.wal_appends_since_compact().await, before);
        car
    };

    let f = Fleet::open(path).await;
    assert_eq!(f.engine.rentals_for_car(car).unwrap().len(), 1);
    assert!(f.engine.reservations_for_car(car).unwrap().is_empty());
}
