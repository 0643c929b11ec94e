use rust_decimal::Decimal;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::require_non_negative;
use super::repo::{BookingConflictPort, FleetRepository};
use super::{Engine, EngineError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCar {
    pub id: Ulid,
    pub make: String,
    pub model: String,
    pub year: u16,
    pub color: Option<String>,
    pub daily_rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub id: Ulid,
    pub email: String,
    pub role: Role,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInsurance {
    pub id: Ulid,
    pub car_id: Ulid,
    pub provider: String,
    pub policy_number: String,
    pub coverage_type: String,
    pub expiry_date: Ms,
    pub premium: Decimal,
}

fn check_len(value: &str, what: &'static str) -> Result<(), EngineError> {
    if value.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn require_text(value: &str, field: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::InvalidInput(format!("{field} must not be empty")));
    }
    Ok(())
}

impl Engine {
    // ── Cars ─────────────────────────────────────────────────

    pub async fn create_car(&self, new: NewCar) -> Result<Car, EngineError> {
        if self.store.car_count() >= MAX_CARS {
            return Err(EngineError::LimitExceeded("too many cars"));
        }
        require_text(&new.make, "make")?;
        require_text(&new.model, "model")?;
        check_len(&new.make, "make too long")?;
        check_len(&new.model, "model too long")?;
        if let Some(color) = &new.color {
            check_len(color, "color too long")?;
        }
        require_non_negative(new.daily_rate, "daily rate")?;

        let guard = self.lock_car(new.id).await;
        if self.store.contains_car(&new.id) {
            return Err(EngineError::Conflict(format!("car {} already exists", new.id)));
        }
        let car = Car {
            id: new.id,
            make: new.make,
            model: new.model,
            year: new.year,
            color: new.color,
            daily_rate: new.daily_rate,
            is_available: true,
            out_of_service: false,
        };
        self.commit(Event::CarAdded { car: car.clone() }, vec![guard])
            .await?;
        info!(car_id = %car.id, make = %car.make, model = %car.model, "car added");
        Ok(car)
    }

    pub fn get_car(&self, id: Ulid) -> Result<Car, EngineError> {
        self.store.find_car(&id).ok_or(EngineError::NotFound(id))
    }

    /// All cars, or only those whose occupancy flag is set.
    pub fn list_cars(&self, only_available: bool) -> Vec<Car> {
        let mut cars = self.store.cars();
        if only_available {
            cars.retain(|c| c.is_available);
        }
        cars
    }

    /// Puts a car on or off a maintenance hold and recomputes its flag.
    pub async fn set_car_service(&self, car_id: Ulid, out_of_service: bool) -> Result<Car, EngineError> {
        let guard = self.lock_car(car_id).await;
        let car = self.get_car(car_id)?;
        let is_available = !out_of_service && !self.store.has_active_rental(&car_id, None);
        self.commit(
            Event::CarServiceChanged {
                id: car_id,
                out_of_service,
                is_available,
            },
            vec![guard],
        )
        .await?;
        info!(%car_id, out_of_service, is_available, "car service state changed");
        Ok(Car {
            out_of_service,
            is_available,
            ..car
        })
    }

    /// Refused while any active rental or pending/confirmed reservation
    /// refers to the car. Finished bookings and the policy go with it.
    pub async fn remove_car(&self, car_id: Ulid) -> Result<(), EngineError> {
        let guard = self.lock_car(car_id).await;
        self.get_car(car_id)?;
        let blocking = self.store.rentals_where(|r| {
            r.car_id == car_id && r.status == RentalStatus::Active
        });
        if !blocking.is_empty() {
            return Err(EngineError::Conflict(format!(
                "car {car_id} has {} active rental(s)",
                blocking.len()
            )));
        }
        let held = self
            .store
            .reservations_where(|r| r.car_id == car_id && r.status.is_blocking());
        if !held.is_empty() {
            return Err(EngineError::Conflict(format!(
                "car {car_id} has {} open reservation(s)",
                held.len()
            )));
        }
        self.commit(Event::CarRemoved { id: car_id }, vec![guard])
            .await?;
        self.forget_lock(&car_id);
        info!(%car_id, "car removed");
        Ok(())
    }

    // ── Users ────────────────────────────────────────────────

    pub async fn register_user(&self, new: NewUser) -> Result<User, EngineError> {
        let email = new.email.trim().to_ascii_lowercase();
        let well_formed = email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
        if !well_formed {
            return Err(EngineError::InvalidInput(format!("invalid email address: {}", new.email)));
        }
        check_len(&email, "email too long")?;
        for name in [&new.first_name, &new.last_name].into_iter().flatten() {
            check_len(name, "name too long")?;
        }
        if self.store.contains_user(&new.id) {
            return Err(EngineError::Conflict(format!("user {} already exists", new.id)));
        }
        if self.store.find_user_by_email(&email).is_some() {
            return Err(EngineError::Conflict(format!("email {email} is already registered")));
        }

        let user = User {
            id: new.id,
            email,
            role: new.role,
            first_name: new.first_name,
            last_name: new.last_name,
            is_active: true,
        };
        self.commit(Event::UserRegistered { user: user.clone() }, Vec::new())
            .await?;
        info!(user_id = %user.id, role = %user.role, "user registered");
        Ok(user)
    }

    pub fn get_user(&self, id: Ulid) -> Result<User, EngineError> {
        self.store.find_user(&id).ok_or(EngineError::NotFound(id))
    }

    /// Makes sure an admin exists so the first connection has someone to
    /// log in as. Returns the admin and whether it was just created.
    pub async fn bootstrap_admin(&self, id: Option<Ulid>) -> Result<(User, bool), EngineError> {
        if let Some(id) = id
            && let Some(user) = self.store.find_user(&id)
        {
            if user.role != Role::Admin {
                return Err(EngineError::Conflict(format!("user {id} exists but is not an admin")));
            }
            return Ok((user, false));
        }
        if id.is_none()
            && let Some(admin) = self.store.users().into_iter().find(|u| u.role == Role::Admin)
        {
            return Ok((admin, false));
        }

        let id = id.unwrap_or_else(Ulid::new);
        let user = self
            .register_user(NewUser {
                id,
                email: format!("admin-{}@carhire.local", id.to_string().to_ascii_lowercase()),
                role: Role::Admin,
                first_name: None,
                last_name: None,
            })
            .await?;
        warn!(admin_id = %user.id, "bootstrapped admin user");
        Ok((user, true))
    }

    // ── Insurance ────────────────────────────────────────────

    pub async fn add_insurance(&self, new: NewInsurance) -> Result<Insurance, EngineError> {
        require_text(&new.provider, "provider")?;
        require_text(&new.policy_number, "policy number")?;
        check_len(&new.provider, "provider too long")?;
        check_len(&new.policy_number, "policy number too long")?;
        check_len(&new.coverage_type, "coverage type too long")?;
        require_non_negative(new.premium, "premium")?;
        if new.expiry_date <= self.now() {
            return Err(EngineError::InvalidInput(
                "insurance must have a future expiry date".into(),
            ));
        }
        if new.expiry_date > MAX_VALID_TIMESTAMP_MS {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }

        let guard = self.lock_car(new.car_id).await;
        self.get_car(new.car_id)?;
        if self.store.find_insurance(&new.id).is_some() {
            return Err(EngineError::Conflict(format!("insurance {} already exists", new.id)));
        }
        if let Some(existing) = self.store.insurance_for_car(&new.car_id) {
            return Err(EngineError::Conflict(format!(
                "car {} already has insurance {}",
                new.car_id, existing.id
            )));
        }

        let insurance = Insurance {
            id: new.id,
            car_id: new.car_id,
            provider: new.provider,
            policy_number: new.policy_number,
            coverage_type: new.coverage_type,
            expiry_date: new.expiry_date,
            premium: new.premium,
        };
        self.commit(
            Event::InsuranceAdded {
                insurance: insurance.clone(),
            },
            vec![guard],
        )
        .await?;
        info!(insurance_id = %insurance.id, car_id = %insurance.car_id, expiry = insurance.expiry_date, "insurance added");
        Ok(insurance)
    }

    /// Moves a policy's expiry strictly later.
    pub async fn renew_insurance(&self, id: Ulid, expiry_date: Ms) -> Result<Insurance, EngineError> {
        let car_id = self.get_insurance(id)?.car_id;
        let guard = self.lock_car(car_id).await;
        let current = self.get_insurance(id)?;
        if expiry_date <= current.expiry_date {
            return Err(EngineError::InvalidInput(
                "new expiry date must be after the current expiry date".into(),
            ));
        }
        if expiry_date > MAX_VALID_TIMESTAMP_MS {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
        self.commit(Event::InsuranceRenewed { id, expiry_date }, vec![guard])
            .await?;
        info!(insurance_id = %id, expiry = expiry_date, "insurance renewed");
        Ok(Insurance {
            expiry_date,
            ..current
        })
    }

    pub async fn remove_insurance(&self, id: Ulid) -> Result<(), EngineError> {
        let car_id = self.get_insurance(id)?.car_id;
        let guard = self.lock_car(car_id).await;
        self.get_insurance(id)?;
        if self.store.has_active_rental(&car_id, None) {
            return Err(EngineError::Conflict(format!(
                "car {car_id} has an active rental; its insurance cannot be removed"
            )));
        }
        self.commit(Event::InsuranceRemoved { id }, vec![guard])
            .await?;
        info!(insurance_id = %id, %car_id, "insurance removed");
        Ok(())
    }

    pub fn get_insurance(&self, id: Ulid) -> Result<Insurance, EngineError> {
        self.store.find_insurance(&id).ok_or(EngineError::NotFound(id))
    }

    pub fn insurance_for_car(&self, car_id: Ulid) -> Result<Option<Insurance>, EngineError> {
        self.get_car(car_id)?;
        Ok(self.store.insurance_for_car(&car_id))
    }

    /// Policies still in force that lapse within `within_ms`, soonest first.
    pub fn expiring_insurances(&self, within_ms: Ms) -> Vec<Insurance> {
        let now = self.now();
        let horizon = now.saturating_add(within_ms.max(0));
        let mut expiring: Vec<Insurance> = self
            .store
            .insurances()
            .into_iter()
            .filter(|i| i.expiry_date >= now && i.expiry_date <= horizon)
            .collect();
        expiring.sort_by_key(|i| (i.expiry_date, i.id));
        expiring
    }
}
