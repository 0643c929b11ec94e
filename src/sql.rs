use std::str::FromStr;

use rust_decimal::Decimal;
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Row filter shared by the `rentals` and `reservations` tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingFilter<S> {
    pub id: Option<Ulid>,
    pub car_id: Option<Ulid>,
    pub user_id: Option<Ulid>,
    pub status: Option<S>,
}

impl<S> Default for BookingFilter<S> {
    fn default() -> Self {
        Self {
            id: None,
            car_id: None,
            user_id: None,
            status: None,
        }
    }
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertCar {
        id: Ulid,
        make: String,
        model: String,
        year: u16,
        color: Option<String>,
        daily_rate: Decimal,
    },
    DeleteCar {
        id: Ulid,
    },
    SetCarService {
        car_id: Ulid,
        out_of_service: bool,
    },
    InsertUser {
        id: Ulid,
        email: String,
        role: Role,
        first_name: Option<String>,
        last_name: Option<String>,
    },
    InsertInsurance {
        id: Ulid,
        car_id: Ulid,
        provider: String,
        policy_number: String,
        coverage_type: String,
        expiry_date: Ms,
        premium: Decimal,
    },
    RenewInsurance {
        id: Ulid,
        expiry_date: Ms,
    },
    DeleteInsurance {
        id: Ulid,
    },
    InsertRental {
        id: Ulid,
        car_id: Ulid,
        user_id: Ulid,
        start: Ms,
        end: Ms,
        total_cost: Decimal,
    },
    /// `NULL` columns keep their current value.
    ReviseRental {
        id: Ulid,
        car_id: Option<Ulid>,
        user_id: Option<Ulid>,
        start: Option<Ms>,
        end: Option<Ms>,
        total_cost: Option<Decimal>,
    },
    SetRentalStatus {
        id: Ulid,
        status: RentalStatus,
    },
    ExtendRental {
        id: Ulid,
        end: Ms,
    },
    DeleteRental {
        id: Ulid,
    },
    InsertReservation {
        id: Ulid,
        car_id: Ulid,
        user_id: Ulid,
        start: Ms,
        end: Ms,
        total_price: Decimal,
    },
    ReviseReservation {
        id: Ulid,
        car_id: Option<Ulid>,
        user_id: Option<Ulid>,
        start: Option<Ms>,
        end: Option<Ms>,
        total_price: Option<Decimal>,
    },
    SetReservationStatus {
        id: Ulid,
        status: ReservationStatus,
    },
    ConfirmReservation {
        id: Ulid,
    },
    CancelReservation {
        id: Ulid,
    },
    DeleteReservation {
        id: Ulid,
    },
    SelectAvailability {
        car_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectFreeWindows {
        car_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectAvailableCars {
        start: Ms,
        end: Ms,
    },
    SelectCars {
        id: Option<Ulid>,
        available: Option<bool>,
    },
    SelectUsers {
        id: Option<Ulid>,
    },
    SelectInsurances {
        car_id: Option<Ulid>,
    },
    SelectExpiringInsurances {
        within: Ms,
    },
    SelectRentals {
        filter: BookingFilter<RentalStatus>,
    },
    SelectOverdueRentals,
    SelectReservations {
        filter: BookingFilter<ReservationStatus>,
    },
    SelectUpcomingReservations {
        within: Ms,
    },
    SelectAvailabilityDrift,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Known insert targets with the column order assumed when an INSERT
/// names no columns.
const INSERT_TABLES: &[(&str, &[&str])] = &[
    ("cars", &["id", "make", "model", "year", "color", "daily_rate"]),
    ("car_service", &["car_id", "out_of_service"]),
    ("users", &["id", "email", "role", "first_name", "last_name"]),
    (
        "insurances",
        &["id", "car_id", "provider", "policy_number", "coverage_type", "expiry_date", "premium"],
    ),
    ("insurance_renewals", &["insurance_id", "expiry_date"]),
    ("rentals", &["id", "car_id", "user_id", "start", "end", "total_cost"]),
    ("rental_updates", &["rental_id", "car_id", "user_id", "start", "end", "total_cost"]),
    ("rental_status", &["rental_id", "status"]),
    ("rental_extensions", &["rental_id", "end"]),
    ("reservations", &["id", "car_id", "user_id", "start", "end", "total_price"]),
    (
        "reservation_updates",
        &["reservation_id", "car_id", "user_id", "start", "end", "total_price"],
    ),
    ("reservation_status", &["reservation_id", "status"]),
    ("reservation_confirmations", &["reservation_id"]),
    ("reservation_cancellations", &["reservation_id"]),
];

/// One VALUES row keyed by column name.
struct Row<'a> {
    table: &'static str,
    columns: Vec<String>,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.require(column)?)
    }

    fn opt_ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.get(column).map_or(Ok(None), parse_ulid_or_null)
    }

    fn ms(&self, column: &'static str) -> Result<Ms, SqlError> {
        parse_i64(self.require(column)?)
    }

    fn opt_ms(&self, column: &str) -> Result<Option<Ms>, SqlError> {
        self.get(column).map_or(Ok(None), parse_i64_or_null)
    }

    fn text(&self, column: &'static str) -> Result<String, SqlError> {
        parse_string(self.require(column)?)
    }

    fn opt_text(&self, column: &str) -> Result<Option<String>, SqlError> {
        self.get(column).map_or(Ok(None), parse_string_or_null)
    }

    fn decimal(&self, column: &'static str) -> Result<Decimal, SqlError> {
        parse_decimal(self.require(column)?)
    }

    fn opt_decimal(&self, column: &str) -> Result<Option<Decimal>, SqlError> {
        match self.get(column) {
            None => Ok(None),
            Some(expr) if is_null(expr) => Ok(None),
            Some(expr) => parse_decimal(expr).map(Some),
        }
    }

    fn bool(&self, column: &'static str) -> Result<bool, SqlError> {
        parse_bool(self.require(column)?)
    }

    fn parsed<T: FromStr>(&self, column: &'static str) -> Result<T, SqlError> {
        let raw = self.text(column)?;
        raw.parse()
            .map_err(|_| SqlError::Parse(format!("bad {column}: {raw}")))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let name = insert_table_name(insert)?;
    let Some(&(table, defaults)) = INSERT_TABLES.iter().find(|(t, _)| *t == name) else {
        return Err(SqlError::UnknownTable(name));
    };
    let values = extract_insert_values(insert)?;

    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert
            .columns
            .iter()
            .map(|ident| ident.value.to_lowercase())
            .collect()
    };
    if values.len() != columns.len() {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    let row = Row {
        table,
        columns,
        values: &values,
    };

    match table {
        "cars" => {
            let year = row.ms("year")?;
            Ok(Command::InsertCar {
                id: row.ulid("id")?,
                make: row.text("make")?,
                model: row.text("model")?,
                year: u16::try_from(year)
                    .map_err(|_| SqlError::Parse(format!("{year} out of range for year")))?,
                color: row.opt_text("color")?,
                daily_rate: row.decimal("daily_rate")?,
            })
        }
        "car_service" => Ok(Command::SetCarService {
            car_id: row.ulid("car_id")?,
            out_of_service: row.bool("out_of_service")?,
        }),
        "users" => Ok(Command::InsertUser {
            id: row.ulid("id")?,
            email: row.text("email")?,
            role: row.parsed("role")?,
            first_name: row.opt_text("first_name")?,
            last_name: row.opt_text("last_name")?,
        }),
        "insurances" => Ok(Command::InsertInsurance {
            id: row.ulid("id")?,
            car_id: row.ulid("car_id")?,
            provider: row.text("provider")?,
            policy_number: row.text("policy_number")?,
            coverage_type: row.opt_text("coverage_type")?.unwrap_or_default(),
            expiry_date: row.ms("expiry_date")?,
            premium: row.opt_decimal("premium")?.unwrap_or_default(),
        }),
        "insurance_renewals" => Ok(Command::RenewInsurance {
            id: row.ulid("insurance_id")?,
            expiry_date: row.ms("expiry_date")?,
        }),
        "rentals" => Ok(Command::InsertRental {
            id: row.ulid("id")?,
            car_id: row.ulid("car_id")?,
            user_id: row.ulid("user_id")?,
            start: row.ms("start")?,
            end: row.ms("end")?,
            total_cost: row.decimal("total_cost")?,
        }),
        "rental_updates" => Ok(Command::ReviseRental {
            id: row.ulid("rental_id")?,
            car_id: row.opt_ulid("car_id")?,
            user_id: row.opt_ulid("user_id")?,
            start: row.opt_ms("start")?,
            end: row.opt_ms("end")?,
            total_cost: row.opt_decimal("total_cost")?,
        }),
        "rental_status" => Ok(Command::SetRentalStatus {
            id: row.ulid("rental_id")?,
            status: row.parsed("status")?,
        }),
        "rental_extensions" => Ok(Command::ExtendRental {
            id: row.ulid("rental_id")?,
            end: row.ms("end")?,
        }),
        "reservations" => Ok(Command::InsertReservation {
            id: row.ulid("id")?,
            car_id: row.ulid("car_id")?,
            user_id: row.ulid("user_id")?,
            start: row.ms("start")?,
            end: row.ms("end")?,
            total_price: row.decimal("total_price")?,
        }),
        "reservation_updates" => Ok(Command::ReviseReservation {
            id: row.ulid("reservation_id")?,
            car_id: row.opt_ulid("car_id")?,
            user_id: row.opt_ulid("user_id")?,
            start: row.opt_ms("start")?,
            end: row.opt_ms("end")?,
            total_price: row.opt_decimal("total_price")?,
        }),
        "reservation_status" => Ok(Command::SetReservationStatus {
            id: row.ulid("reservation_id")?,
            status: row.parsed("status")?,
        }),
        "reservation_confirmations" => Ok(Command::ConfirmReservation {
            id: row.ulid("reservation_id")?,
        }),
        "reservation_cancellations" => Ok(Command::CancelReservation {
            id: row.ulid("reservation_id")?,
        }),
        other => Err(SqlError::UnknownTable(other.to_string())),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let mut filters = Filters::default();
    if let Some(selection) = &delete.selection {
        collect_filters(selection, &mut filters)?;
    }
    let id = filters.id.ok_or(SqlError::MissingFilter("id"))?;

    match table.as_str() {
        "cars" => Ok(Command::DeleteCar { id }),
        "insurances" => Ok(Command::DeleteInsurance { id }),
        "rentals" => Ok(Command::DeleteRental { id }),
        "reservations" => Ok(Command::DeleteReservation { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

/// Equality and range predicates pulled out of a WHERE clause joined by AND.
#[derive(Debug, Default)]
struct Filters {
    id: Option<Ulid>,
    car_id: Option<Ulid>,
    user_id: Option<Ulid>,
    status: Option<String>,
    available: Option<bool>,
    start: Option<Ms>,
    end: Option<Ms>,
    within: Option<Ms>,
}

impl Filters {
    fn window(&self) -> Result<(Ms, Ms), SqlError> {
        Ok((
            self.start.ok_or(SqlError::MissingFilter("start"))?,
            self.end.ok_or(SqlError::MissingFilter("end"))?,
        ))
    }

    fn status<S: FromStr>(&self) -> Result<Option<S>, SqlError> {
        self.status
            .as_deref()
            .map(|raw| {
                raw.parse()
                    .map_err(|_| SqlError::Parse(format!("bad status: {raw}")))
            })
            .transpose()
    }

    fn booking<S: FromStr>(&self) -> Result<BookingFilter<S>, SqlError> {
        Ok(BookingFilter {
            id: self.id,
            car_id: self.car_id,
            user_id: self.user_id,
            status: self.status()?,
        })
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut f = Filters::default();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut f)?;
    }

    match table.as_str() {
        "availability" => {
            let (start, end) = f.window()?;
            Ok(Command::SelectAvailability {
                car_id: f.car_id.ok_or(SqlError::MissingFilter("car_id"))?,
                start,
                end,
            })
        }
        "free_windows" => {
            let (start, end) = f.window()?;
            Ok(Command::SelectFreeWindows {
                car_id: f.car_id.ok_or(SqlError::MissingFilter("car_id"))?,
                start,
                end,
            })
        }
        "available_cars" => {
            let (start, end) = f.window()?;
            Ok(Command::SelectAvailableCars { start, end })
        }
        "cars" => Ok(Command::SelectCars {
            id: f.id,
            available: f.available,
        }),
        "users" => Ok(Command::SelectUsers { id: f.id }),
        "insurances" => Ok(Command::SelectInsurances { car_id: f.car_id }),
        "expiring_insurances" => Ok(Command::SelectExpiringInsurances {
            within: f.within.ok_or(SqlError::MissingFilter("within_ms"))?,
        }),
        "rentals" => Ok(Command::SelectRentals {
            filter: f.booking()?,
        }),
        "overdue_rentals" => Ok(Command::SelectOverdueRentals),
        "reservations" => Ok(Command::SelectReservations {
            filter: f.booking()?,
        }),
        "upcoming_reservations" => Ok(Command::SelectUpcomingReservations {
            within: f.within.ok_or(SqlError::MissingFilter("within_ms"))?,
        }),
        "availability_drift" => Ok(Command::SelectAvailabilityDrift),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn collect_filters(expr: &Expr, f: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, f),
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left);
            match (op, col.as_deref()) {
                (ast::BinaryOperator::And, _) => {
                    collect_filters(left, f)?;
                    collect_filters(right, f)
                }
                (ast::BinaryOperator::Eq, Some("id")) => {
                    f.id = Some(parse_ulid(right)?);
                    Ok(())
                }
                (ast::BinaryOperator::Eq, Some("car_id")) => {
                    f.car_id = Some(parse_ulid(right)?);
                    Ok(())
                }
                (ast::BinaryOperator::Eq, Some("user_id")) => {
                    f.user_id = Some(parse_ulid(right)?);
                    Ok(())
                }
                (ast::BinaryOperator::Eq, Some("status")) => {
                    f.status = Some(parse_string(right)?);
                    Ok(())
                }
                (ast::BinaryOperator::Eq, Some("available" | "is_available")) => {
                    f.available = Some(parse_bool(right)?);
                    Ok(())
                }
                (ast::BinaryOperator::Eq, Some("within_ms")) => {
                    f.within = Some(parse_i64(right)?);
                    Ok(())
                }
                (ast::BinaryOperator::GtEq, Some("start")) => {
                    f.start = Some(parse_i64(right)?);
                    Ok(())
                }
                (ast::BinaryOperator::LtEq, Some("end")) => {
                    f.end = Some(parse_i64(right)?);
                    Ok(())
                }
                _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
            }
        }
        _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// Single-row VALUES only; each booking is its own statement.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.clone()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s}: {e}")))
        }
        Some(other) => Err(SqlError::Parse(format!("expected ULID string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return parse_i64(expr).map(|v| -v);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
        Some(other) => Err(SqlError::Parse(format!("expected number, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_i64(expr).map(Some)
}

fn parse_decimal(expr: &Expr) -> Result<Decimal, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return parse_decimal(expr).map(|v| -v);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => Decimal::from_str(s)
            .map_err(|e| SqlError::Parse(format!("bad amount {s}: {e}"))),
        Some(other) => Err(SqlError::Parse(format!("expected amount, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(other) => Err(SqlError::Parse(format!("expected bool, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing column {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
