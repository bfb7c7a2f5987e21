use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::config::parse_clock_time;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertProvider(Provider),
    InsertService(Service),
    InsertBooking(BookingRequest),
    SetBookingStatus {
        booking_id: BookingId,
        status: BookingStatus,
        requester_id: UserId,
    },
    CancelBooking {
        id: BookingId,
        requester_id: UserId,
    },
    SelectSlots {
        provider_id: ProviderId,
        service_id: ServiceId,
        date: NaiveDate,
    },
    SelectBooking {
        id: BookingId,
    },
    SelectBookings {
        provider_id: ProviderId,
        date: NaiveDate,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_ascii_uppercase();
    if let Some(rest) = upper.strip_prefix("LISTEN ") {
        let channel = trimmed[trimmed.len() - rest.len()..].trim();
        return Ok(Command::Listen { channel: channel.to_string() });
    }
    if upper == "UNLISTEN *" {
        return Ok(Command::UnlistenAll);
    }
    if let Some(rest) = upper.strip_prefix("UNLISTEN ") {
        let channel = trimmed[trimmed.len() - rest.len()..].trim();
        return Ok(Command::Unlisten { channel: channel.to_string() });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// One VALUES row addressed by column name, or by position when the INSERT
/// has no column list.
struct Row<'a> {
    table: &'static str,
    columns: Vec<String>,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn get(&self, name: &str, position: usize) -> Option<&'a Expr> {
        if self.columns.is_empty() {
            return self.values.get(position);
        }
        self.columns
            .iter()
            .position(|c| c == name)
            .and_then(|i| self.values.get(i))
    }

    fn required(&self, name: &'static str, position: usize) -> Result<&'a Expr, SqlError> {
        self.get(name, position)
            .ok_or(SqlError::MissingColumn(self.table, name))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    if !columns.is_empty() && columns.len() != values.len() {
        return Err(SqlError::WrongArity(columns.len(), values.len()));
    }

    match table.as_str() {
        "providers" => {
            let row = Row { table: "providers", columns, values };
            Ok(Command::InsertProvider(Provider {
                id: parse_ulid(row.required("id", 0)?)?,
                owner_id: optional(row.get("owner_id", 1), parse_ulid)?,
                open_time: optional(row.get("open_time", 2), parse_time)?,
                close_time: optional(row.get("close_time", 3), parse_time)?,
                slot_interval: optional(row.get("slot_interval", 4), parse_i64)?,
                name: optional(row.get("name", 5), parse_string)?,
            }))
        }
        "services" => {
            let row = Row { table: "services", columns, values };
            Ok(Command::InsertService(Service {
                id: parse_ulid(row.required("id", 0)?)?,
                provider_id: parse_ulid(row.required("provider_id", 1)?)?,
                duration_minutes: parse_i64(row.required("duration", 2)?)?,
                slot_interval: optional(row.get("slot_interval", 3), parse_i64)?,
                name: optional(row.get("name", 4), parse_string)?,
            }))
        }
        "bookings" => {
            let row = Row { table: "bookings", columns, values };
            Ok(Command::InsertBooking(BookingRequest {
                id: parse_ulid(row.required("id", 0)?)?,
                provider_id: parse_ulid(row.required("provider_id", 1)?)?,
                service_id: parse_ulid(row.required("service_id", 2)?)?,
                user_id: parse_ulid(row.required("user_id", 3)?)?,
                date: parse_date(row.required("date", 4)?)?,
                start: parse_time(row.required("start_time", 5)?)?,
                end: parse_time(row.required("end_time", 6)?)?,
                notes: optional(row.get("notes", 7), parse_string)?,
            }))
        }
        "booking_status" => {
            let row = Row { table: "booking_status", columns, values };
            Ok(Command::SetBookingStatus {
                booking_id: parse_ulid(row.required("booking_id", 0)?)?,
                status: parse_status(row.required("status", 1)?)?,
                requester_id: parse_ulid(row.required("requester_id", 2)?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    let filters = Filters::from_selection(delete.selection.as_ref())?;
    Ok(Command::CancelBooking {
        id: parse_ulid(filters.required("id")?)?,
        requester_id: parse_ulid(filters.required("requester_id")?)?,
    })
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
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            provider_id: parse_ulid(filters.required("provider_id")?)?,
            service_id: parse_ulid(filters.required("service_id")?)?,
            date: parse_date(filters.required("date")?)?,
        }),
        "bookings" => {
            if let Some(id) = filters.get("id") {
                return Ok(Command::SelectBooking { id: parse_ulid(id)? });
            }
            Ok(Command::SelectBookings {
                provider_id: parse_ulid(filters.required("provider_id")?)?,
                date: parse_date(filters.required("date")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` predicates joined by AND. Anything else is rejected rather
/// than silently ignored.
struct Filters<'a> {
    eq: Vec<(String, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut eq = Vec::new();
        if let Some(expr) = selection {
            collect_eq(expr, &mut eq)?;
        }
        Ok(Self { eq })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.eq.iter().find(|(c, _)| c == column).map(|(_, e)| *e)
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingFilter(column))
    }
}

fn collect_eq<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq(inner, out),
        Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
            collect_eq(left, out)?;
            collect_eq(right, out)
        }
        Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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

/// The single VALUES row. Multi-row inserts are rejected so that each booking
/// gets its own conflict check and its own error.
fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.as_slice()),
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

/// Absent column or NULL → `None`.
fn optional<T>(
    expr: Option<&Expr>,
    parse: impl Fn(&Expr) -> Result<T, SqlError>,
) -> Result<Option<T>, SqlError> {
    match expr {
        None => Ok(None),
        Some(e) if is_null(e) => Ok(None),
        Some(e) => parse(e).map(Some),
    }
}

fn parse_text(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_text(expr).map(str::to_string)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } = expr {
        return Ok(-parse_i64(expr)?);
    }
    let s = parse_text(expr)?;
    s.parse()
        .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_text(expr)?;
    parse_clock_time(s).ok_or_else(|| SqlError::Parse(format!("bad time {s:?}, expected HH:MM")))
}

fn parse_status(expr: &Expr) -> Result<BookingStatus, SqlError> {
    parse_text(expr)?.parse().map_err(SqlError::Parse)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("expected {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
