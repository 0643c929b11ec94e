use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;
use ulid::Ulid;

use crate::auth::CarHireAuthSource;
use crate::engine::{
    Engine, EngineError, NewCar, NewInsurance, NewUser, RentalPatch, ReservationPatch,
    require_staff,
};
use crate::model::*;
use crate::observability;
use crate::sql::{self, BookingFilter, Command};

/// Serves one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(CarHireFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

/// The logged-in user, as the engine sees them. The login name is the
/// user's ULID; the account must exist and be active.
pub(crate) fn lookup_principal(engine: &Engine, login: Option<&str>) -> Result<Principal, String> {
    let login = login.ok_or("no user name in startup message")?;
    let id = Ulid::from_string(login).map_err(|_| format!("login name {login} is not a user id"))?;
    match engine.get_user(id) {
        Ok(user) if user.is_active => Ok(user.principal()),
        Ok(_) => Err(format!("user {id} is deactivated")),
        Err(_) => Err(format!("unknown user {id}")),
    }
}

pub struct CarHireHandler {
    engine: Arc<Engine>,
    query_parser: Arc<CarHireQueryParser>,
}

impl CarHireHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(CarHireQueryParser),
        }
    }

    fn resolve_principal<C: ClientInfo>(&self, client: &C) -> PgWireResult<Principal> {
        let login = client.metadata().get("user").map(String::as_str);
        lookup_principal(&self.engine, login).map_err(|msg| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            user_error("28000", msg)
        })
    }

    async fn run(&self, actor: &Principal, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(actor, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            debug!(actor = %actor.id, command = label, "statement failed: {e}");
        }
        result
    }

    async fn execute_command(
        &self,
        actor: &Principal,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            // ── Fleet ────────────────────────────────────────
            Command::InsertCar {
                id,
                make,
                model,
                year,
                color,
                daily_rate,
            } => {
                require_staff(actor, "only staff can add cars").map_err(engine_err)?;
                engine
                    .create_car(NewCar {
                        id,
                        make,
                        model,
                        year,
                        color,
                        daily_rate,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::DeleteCar { id } => {
                require_staff(actor, "only staff can remove cars").map_err(engine_err)?;
                engine.remove_car(id).await.map_err(engine_err)?;
                Ok(vec![deleted()])
            }
            Command::SetCarService {
                car_id,
                out_of_service,
            } => {
                require_staff(actor, "only staff can change service state").map_err(engine_err)?;
                engine
                    .set_car_service(car_id, out_of_service)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::InsertUser {
                id,
                email,
                role,
                first_name,
                last_name,
            } => {
                if role != Role::Customer && actor.role != Role::Admin {
                    return Err(engine_err(EngineError::Forbidden(
                        "only admins can create staff or driver accounts",
                    )));
                }
                engine
                    .register_user(NewUser {
                        id,
                        email,
                        role,
                        first_name,
                        last_name,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }

            // ── Insurance ────────────────────────────────────
            Command::InsertInsurance {
                id,
                car_id,
                provider,
                policy_number,
                coverage_type,
                expiry_date,
                premium,
            } => {
                require_staff(actor, "only staff can manage insurance").map_err(engine_err)?;
                engine
                    .add_insurance(NewInsurance {
                        id,
                        car_id,
                        provider,
                        policy_number,
                        coverage_type,
                        expiry_date,
                        premium,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::RenewInsurance { id, expiry_date } => {
                require_staff(actor, "only staff can manage insurance").map_err(engine_err)?;
                engine
                    .renew_insurance(id, expiry_date)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::DeleteInsurance { id } => {
                require_staff(actor, "only staff can manage insurance").map_err(engine_err)?;
                engine.remove_insurance(id).await.map_err(engine_err)?;
                Ok(vec![deleted()])
            }

            // ── Rentals ──────────────────────────────────────
            Command::InsertRental {
                id,
                car_id,
                user_id,
                start,
                end,
                total_cost,
            } => {
                require_self_or_staff(actor, user_id)?;
                engine
                    .create_rental(id, car_id, user_id, start, end, total_cost)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::ReviseRental {
                id,
                car_id,
                user_id,
                start,
                end,
                total_cost,
            } => {
                let patch = RentalPatch {
                    car_id,
                    user_id,
                    start,
                    end,
                    total_cost,
                };
                engine
                    .update_rental(id, patch, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::SetRentalStatus { id, status } => {
                require_staff(actor, "only staff can change rental status").map_err(engine_err)?;
                engine
                    .update_rental_status(id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::ExtendRental { id, end } => {
                engine
                    .extend_rental(id, end, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::DeleteRental { id } => {
                engine.remove_rental(id, actor).await.map_err(engine_err)?;
                Ok(vec![deleted()])
            }

            // ── Reservations ─────────────────────────────────
            Command::InsertReservation {
                id,
                car_id,
                user_id,
                start,
                end,
                total_price,
            } => {
                require_self_or_staff(actor, user_id)?;
                engine
                    .create_reservation(id, car_id, user_id, start, end, total_price)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::ReviseReservation {
                id,
                car_id,
                user_id,
                start,
                end,
                total_price,
            } => {
                let patch = ReservationPatch {
                    car_id,
                    user_id,
                    start,
                    end,
                    total_price,
                };
                engine
                    .update_reservation(id, patch, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::SetReservationStatus { id, status } => {
                require_staff(actor, "only staff can change reservation status")
                    .map_err(engine_err)?;
                engine
                    .update_reservation_status(id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::ConfirmReservation { id } => {
                require_staff(actor, "only staff can confirm reservations").map_err(engine_err)?;
                engine.confirm_reservation(id).await.map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::CancelReservation { id } => {
                engine
                    .cancel_reservation(id, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::DeleteReservation { id } => {
                engine
                    .remove_reservation(id, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![deleted()])
            }

            // ── Queries ──────────────────────────────────────
            Command::SelectAvailability { car_id, start, end } => {
                let outcome = engine
                    .check_availability(car_id, start, end)
                    .map_err(engine_err)?;
                let row = (car_id, outcome);
                Ok(vec![rows_response(availability_schema(), &[row], |enc, (car_id, outcome)| {
                    enc.encode_field(&car_id.to_string())?;
                    enc.encode_field(&outcome.is_available())?;
                    enc.encode_field(&outcome.message().map(str::to_string))
                })])
            }
            Command::SelectFreeWindows { car_id, start, end } => {
                let windows = engine
                    .free_windows(car_id, start, end)
                    .map_err(engine_err)?;
                let car = car_id.to_string();
                Ok(vec![rows_response(free_windows_schema(), &windows, |enc, w| {
                    enc.encode_field(&car)?;
                    enc.encode_field(&w.start)?;
                    enc.encode_field(&w.end)
                })])
            }
            Command::SelectAvailableCars { start, end } => {
                let cars = engine.available_cars(start, end).map_err(engine_err)?;
                Ok(vec![rows_response(car_schema(), &cars, encode_car)])
            }
            Command::SelectCars { id, available } => {
                let cars = match id {
                    Some(id) => vec![engine.get_car(id).map_err(engine_err)?],
                    None => engine.list_cars(available == Some(true)),
                };
                let cars: Vec<Car> = match available {
                    Some(flag) => cars.into_iter().filter(|c| c.is_available == flag).collect(),
                    None => cars,
                };
                Ok(vec![rows_response(car_schema(), &cars, encode_car)])
            }
            Command::SelectUsers { id } => {
                let users = match id {
                    Some(id) if id == actor.id => vec![engine.get_user(id).map_err(engine_err)?],
                    Some(id) => {
                        require_staff(actor, "you can only view your own account")
                            .map_err(engine_err)?;
                        vec![engine.get_user(id).map_err(engine_err)?]
                    }
                    None => {
                        require_staff(actor, "only staff can list users").map_err(engine_err)?;
                        engine.store().users()
                    }
                };
                Ok(vec![rows_response(user_schema(), &users, encode_user)])
            }
            Command::SelectInsurances { car_id } => {
                require_staff(actor, "only staff can view insurance").map_err(engine_err)?;
                let policies = match car_id {
                    Some(car_id) => engine
                        .insurance_for_car(car_id)
                        .map_err(engine_err)?
                        .into_iter()
                        .collect(),
                    None => engine.store().insurances(),
                };
                Ok(vec![rows_response(insurance_schema(), &policies, encode_insurance)])
            }
            Command::SelectExpiringInsurances { within } => {
                require_staff(actor, "only staff can view insurance").map_err(engine_err)?;
                let policies = engine.expiring_insurances(within);
                Ok(vec![rows_response(insurance_schema(), &policies, encode_insurance)])
            }
            Command::SelectRentals { filter } => {
                let rentals = self.select_rentals(actor, filter)?;
                Ok(vec![rows_response(booking_schema("total_cost"), &rentals, encode_rental)])
            }
            Command::SelectOverdueRentals => {
                require_staff(actor, "only staff can list overdue rentals").map_err(engine_err)?;
                let rentals = engine.overdue_rentals();
                Ok(vec![rows_response(booking_schema("total_cost"), &rentals, encode_rental)])
            }
            Command::SelectReservations { filter } => {
                let reservations = self.select_reservations(actor, filter)?;
                Ok(vec![rows_response(
                    booking_schema("total_price"),
                    &reservations,
                    encode_reservation,
                )])
            }
            Command::SelectUpcomingReservations { within } => {
                require_staff(actor, "only staff can list upcoming reservations")
                    .map_err(engine_err)?;
                let reservations = engine.upcoming_reservations(within);
                Ok(vec![rows_response(
                    booking_schema("total_price"),
                    &reservations,
                    encode_reservation,
                )])
            }
            Command::SelectAvailabilityDrift => {
                require_staff(actor, "only staff can reconcile availability")
                    .map_err(engine_err)?;
                let drift = engine.reconcile_availability();
                Ok(vec![rows_response(drift_schema(), &drift, |enc, d| {
                    enc.encode_field(&d.car_id.to_string())?;
                    enc.encode_field(&d.flag)?;
                    enc.encode_field(&d.expected)
                })])
            }
        }
    }

    fn select_rentals(
        &self,
        actor: &Principal,
        filter: BookingFilter<RentalStatus>,
    ) -> PgWireResult<Vec<Rental>> {
        let engine = &self.engine;
        let mut rentals = if let Some(id) = filter.id {
            vec![engine.get_rental(id, actor).map_err(engine_err)?]
        } else if let Some(user_id) = filter.user_id {
            engine.rentals_for_user(user_id, actor).map_err(engine_err)?
        } else if actor.role.is_staff() {
            match (filter.car_id, filter.status) {
                (Some(car_id), _) => engine.rentals_for_car(car_id).map_err(engine_err)?,
                (None, Some(status)) => engine.rentals_by_status(status),
                (None, None) => engine.store().rentals_where(|_| true),
            }
        } else {
            engine.rentals_for_user(actor.id, actor).map_err(engine_err)?
        };
        rentals.retain(|r| {
            filter.car_id.is_none_or(|c| r.car_id == c)
                && filter.user_id.is_none_or(|u| r.user_id == u)
                && filter.status.is_none_or(|s| r.status == s)
        });
        Ok(rentals)
    }

    fn select_reservations(
        &self,
        actor: &Principal,
        filter: BookingFilter<ReservationStatus>,
    ) -> PgWireResult<Vec<Reservation>> {
        let engine = &self.engine;
        let mut reservations = if let Some(id) = filter.id {
            vec![engine.get_reservation(id, actor).map_err(engine_err)?]
        } else if let Some(user_id) = filter.user_id {
            engine
                .reservations_for_user(user_id, actor)
                .map_err(engine_err)?
        } else if actor.role.is_staff() {
            match (filter.car_id, filter.status) {
                (Some(car_id), _) => engine.reservations_for_car(car_id).map_err(engine_err)?,
                (None, Some(status)) => engine.reservations_by_status(status),
                (None, None) => engine.store().reservations_where(|_| true),
            }
        } else {
            engine
                .reservations_for_user(actor.id, actor)
                .map_err(engine_err)?
        };
        reservations.retain(|r| {
            filter.car_id.is_none_or(|c| r.car_id == c)
                && filter.user_id.is_none_or(|u| r.user_id == u)
                && filter.status.is_none_or(|s| r.status == s)
        });
        Ok(reservations)
    }
}

/// Customers book for themselves; staff may book on a customer's behalf.
fn require_self_or_staff(actor: &Principal, user_id: Ulid) -> PgWireResult<()> {
    if actor.role.is_staff() || actor.id == user_id {
        Ok(())
    } else {
        Err(engine_err(EngineError::Forbidden(
            "you can only book for yourself",
        )))
    }
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn deleted() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("car_id", Type::VARCHAR),
        field("available", Type::BOOL),
        field("message", Type::VARCHAR),
    ]
}

fn free_windows_schema() -> Vec<FieldInfo> {
    vec![
        field("car_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

fn car_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("make", Type::VARCHAR),
        field("model", Type::VARCHAR),
        field("year", Type::INT4),
        field("color", Type::VARCHAR),
        field("daily_rate", Type::VARCHAR),
        field("is_available", Type::BOOL),
        field("out_of_service", Type::BOOL),
    ]
}

fn user_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("email", Type::VARCHAR),
        field("role", Type::VARCHAR),
        field("first_name", Type::VARCHAR),
        field("last_name", Type::VARCHAR),
        field("is_active", Type::BOOL),
    ]
}

fn insurance_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("car_id", Type::VARCHAR),
        field("provider", Type::VARCHAR),
        field("policy_number", Type::VARCHAR),
        field("coverage_type", Type::VARCHAR),
        field("expiry_date", Type::INT8),
        field("premium", Type::VARCHAR),
    ]
}

fn booking_schema(amount: &str) -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("car_id", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field(amount, Type::VARCHAR),
        field("status", Type::VARCHAR),
    ]
}

fn drift_schema() -> Vec<FieldInfo> {
    vec![
        field("car_id", Type::VARCHAR),
        field("is_available", Type::BOOL),
        field("expected", Type::BOOL),
    ]
}

/// Schema a statement will produce, judged from its FROM table. Used
/// before parameters are bound, when the statement may not parse yet.
fn schema_for_statement(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return Vec::new();
    }
    let table = lower
        .split_once(" from ")
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|t| t.trim_matches(|c| c == ';' || c == '"'))
        .unwrap_or("");
    match table {
        "availability" => availability_schema(),
        "free_windows" => free_windows_schema(),
        "cars" | "available_cars" => car_schema(),
        "users" => user_schema(),
        "insurances" | "expiring_insurances" => insurance_schema(),
        "rentals" | "overdue_rentals" => booking_schema("total_cost"),
        "reservations" | "upcoming_reservations" => booking_schema("total_price"),
        "availability_drift" => drift_schema(),
        _ => Vec::new(),
    }
}

fn rows_response<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_car(enc: &mut DataRowEncoder, car: &Car) -> PgWireResult<()> {
    enc.encode_field(&car.id.to_string())?;
    enc.encode_field(&car.make)?;
    enc.encode_field(&car.model)?;
    enc.encode_field(&i32::from(car.year))?;
    enc.encode_field(&car.color)?;
    enc.encode_field(&car.daily_rate.to_string())?;
    enc.encode_field(&car.is_available)?;
    enc.encode_field(&car.out_of_service)
}

fn encode_user(enc: &mut DataRowEncoder, user: &User) -> PgWireResult<()> {
    enc.encode_field(&user.id.to_string())?;
    enc.encode_field(&user.email)?;
    enc.encode_field(&user.role.as_str())?;
    enc.encode_field(&user.first_name)?;
    enc.encode_field(&user.last_name)?;
    enc.encode_field(&user.is_active)
}

fn encode_insurance(enc: &mut DataRowEncoder, ins: &Insurance) -> PgWireResult<()> {
    enc.encode_field(&ins.id.to_string())?;
    enc.encode_field(&ins.car_id.to_string())?;
    enc.encode_field(&ins.provider)?;
    enc.encode_field(&ins.policy_number)?;
    enc.encode_field(&ins.coverage_type)?;
    enc.encode_field(&ins.expiry_date)?;
    enc.encode_field(&ins.premium.to_string())
}

fn encode_rental(enc: &mut DataRowEncoder, r: &Rental) -> PgWireResult<()> {
    enc.encode_field(&r.id.to_string())?;
    enc.encode_field(&r.car_id.to_string())?;
    enc.encode_field(&r.user_id.to_string())?;
    enc.encode_field(&r.span.start)?;
    enc.encode_field(&r.span.end)?;
    enc.encode_field(&r.total_cost.to_string())?;
    enc.encode_field(&r.status.as_str())
}

fn encode_reservation(enc: &mut DataRowEncoder, r: &Reservation) -> PgWireResult<()> {
    enc.encode_field(&r.id.to_string())?;
    enc.encode_field(&r.car_id.to_string())?;
    enc.encode_field(&r.user_id.to_string())?;
    enc.encode_field(&r.span.start)?;
    enc.encode_field(&r.span.end)?;
    enc.encode_field(&r.total_price.to_string())?;
    enc.encode_field(&r.status.as_str())
}

#[async_trait]
impl SimpleQueryHandler for CarHireHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.resolve_principal(client)?;
        self.run(&actor, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CarHireQueryParser;

#[async_trait]
impl QueryParser for CarHireQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for_statement(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CarHireHandler {
    type Statement = String;
    type QueryParser = CarHireQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.resolve_principal(client)?;
        let sql = substitute_params(portal);
        let mut responses = self.run(&actor, &sql).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            schema_for_statement(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for_statement(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text parameters as quoted literals. Highest index first,
/// so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CarHireFactory {
    handler: Arc<CarHireHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<CarHireAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CarHireFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = CarHireAuthSource::new(engine.clone(), password);
        Self {
            handler: Arc::new(CarHireHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CarHireFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, msg: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), msg)))
}

/// SQLSTATE per error category, so clients can tell a conflict (retry
/// later) from bad input (never retry).
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::InvalidInput(_) => "22023",
        EngineError::Conflict(_) => "23P01",
        EngineError::Forbidden(_) => "42501",
        EngineError::IllegalTransition(_) => "55000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    let code = match e {
        sql::SqlError::UnknownTable(_) => "42P01",
        sql::SqlError::Unsupported(_) => "0A000",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
