use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Which appointments a listing selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppointmentFilter {
    Id(Ulid),
    Tutor(Ulid),
    Student(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectAvailableSlots {
        tutor_id: Ulid,
        date: NaiveDate,
        duration_min: Option<Minutes>,
        step_min: Option<Minutes>,
    },
    InsertAppointment {
        id: Ulid,
        student_id: Ulid,
        tutor_id: Ulid,
        start: Ms,
        end: Ms,
        course_id: Option<Ulid>,
        notes: Option<String>,
    },
    DeleteAppointment {
        id: Ulid,
    },
    InsertOutcome {
        appointment_id: Ulid,
        outcome: AppointmentStatus,
    },
    InsertReschedule {
        appointment_id: Ulid,
        new_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectAppointments {
        filter: AppointmentFilter,
        from: Option<Ms>,
        to: Option<Ms>,
    },
    InsertWindow {
        window: AvailabilityWindow,
    },
    UpdateWindow {
        id: Ulid,
        patch: WindowPatch,
    },
    DeleteWindow {
        id: Ulid,
    },
    SelectWindows {
        tutor_id: Ulid,
    },
    InsertPurchase {
        student_id: Ulid,
        course_id: Option<Ulid>,
        minutes: Minutes,
    },
    SelectBalances {
        student_id: Ulid,
        course_id: Option<Ulid>,
    },
    InsertCreditBack {
        appointment_id: Ulid,
    },
}

const APPOINTMENT_COLUMNS: &[&str] =
    &["id", "student_id", "tutor_id", "start", "end", "course_id", "notes"];
const OUTCOME_COLUMNS: &[&str] = &["appointment_id", "outcome"];
const RESCHEDULE_COLUMNS: &[&str] = &["appointment_id", "new_id", "start", "end"];
const WINDOW_COLUMNS: &[&str] = &[
    "id",
    "tutor_id",
    "day_of_week",
    "specific_date",
    "start_time",
    "end_time",
];
const PURCHASE_COLUMNS: &[&str] = &["student_id", "course_id", "minutes"];
const CREDIT_BACK_COLUMNS: &[&str] = &["appointment_id"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row keyed by column name. Without a column list the table's
/// declared column order applies.
struct InsertRow<'a> {
    table: &'static str,
    columns: Vec<String>,
    values: &'a [Expr],
}

impl<'a> InsertRow<'a> {
    fn new(
        table: &'static str,
        declared: &[&str],
        required: usize,
        insert: &ast::Insert,
        values: &'a [Expr],
    ) -> Result<Self, SqlError> {
        let columns: Vec<String> = if insert.columns.is_empty() {
            if values.len() < required || values.len() > declared.len() {
                return Err(SqlError::WrongArity(table, declared.len(), values.len()));
            }
            declared.iter().take(values.len()).map(|c| c.to_string()).collect()
        } else {
            if insert.columns.len() != values.len() {
                return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
            }
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if let Some(unknown) = columns.iter().find(|c| !declared.contains(&c.as_str())) {
            return Err(SqlError::Parse(format!("{table}: unknown column {unknown}")));
        }
        Ok(Self { table, columns, values })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "appointments" => {
            let row = InsertRow::new("appointments", APPOINTMENT_COLUMNS, 5, insert, values)?;
            Ok(Command::InsertAppointment {
                id: parse_ulid_expr(row.require("id")?)?,
                student_id: parse_ulid_expr(row.require("student_id")?)?,
                tutor_id: parse_ulid_expr(row.require("tutor_id")?)?,
                start: parse_i64_expr(row.require("start")?)?,
                end: parse_i64_expr(row.require("end")?)?,
                course_id: optional(row.get("course_id"), parse_ulid_or_null)?,
                notes: optional(row.get("notes"), parse_string_or_null)?,
            })
        }
        "outcomes" => {
            let row = InsertRow::new("outcomes", OUTCOME_COLUMNS, 2, insert, values)?;
            Ok(Command::InsertOutcome {
                appointment_id: parse_ulid_expr(row.require("appointment_id")?)?,
                outcome: parse_status(row.require("outcome")?)?,
            })
        }
        "reschedules" => {
            let row = InsertRow::new("reschedules", RESCHEDULE_COLUMNS, 4, insert, values)?;
            Ok(Command::InsertReschedule {
                appointment_id: parse_ulid_expr(row.require("appointment_id")?)?,
                new_id: parse_ulid_expr(row.require("new_id")?)?,
                start: parse_i64_expr(row.require("start")?)?,
                end: parse_i64_expr(row.require("end")?)?,
            })
        }
        "availability_windows" => {
            let row = InsertRow::new("availability_windows", WINDOW_COLUMNS, 6, insert, values)?;
            let day_of_week = optional(row.get("day_of_week"), parse_day_of_week)?;
            let specific_date = optional(row.get("specific_date"), parse_date_or_null)?;
            let recurrence = match (day_of_week, specific_date) {
                (Some(day_of_week), None) => Recurrence::Weekly { day_of_week },
                (None, Some(date)) => Recurrence::Once { date },
                (Some(_), Some(_)) => {
                    return Err(SqlError::Invalid(
                        "set either day_of_week or specific_date, not both".into(),
                    ));
                }
                (None, None) => {
                    return Err(SqlError::Invalid(
                        "a window needs day_of_week or specific_date".into(),
                    ));
                }
            };
            Ok(Command::InsertWindow {
                window: AvailabilityWindow {
                    id: parse_ulid_expr(row.require("id")?)?,
                    tutor_id: parse_ulid_expr(row.require("tutor_id")?)?,
                    recurrence,
                    start: parse_time(row.require("start_time")?)?,
                    end: parse_time(row.require("end_time")?)?,
                },
            })
        }
        "purchases" => {
            let row = InsertRow::new("purchases", PURCHASE_COLUMNS, 3, insert, values)?;
            Ok(Command::InsertPurchase {
                student_id: parse_ulid_expr(row.require("student_id")?)?,
                course_id: optional(row.get("course_id"), parse_ulid_or_null)?,
                minutes: parse_i64_expr(row.require("minutes")?)?,
            })
        }
        "credit_backs" => {
            let row = InsertRow::new("credit_backs", CREDIT_BACK_COLUMNS, 1, insert, values)?;
            Ok(Command::InsertCreditBack {
                appointment_id: parse_ulid_expr(row.require("appointment_id")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE / DELETE ───────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "availability_windows" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(selection)?;

    let mut patch = WindowPatch::default();
    let mut day_of_week: Option<Option<u8>> = None;
    let mut specific_date: Option<Option<NaiveDate>> = None;
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        let value = &assignment.value;
        match column.as_str() {
            "day_of_week" => day_of_week = Some(parse_day_of_week(value)?),
            "specific_date" => specific_date = Some(parse_date_or_null(value)?),
            "start_time" => patch.start = Some(parse_time(value)?),
            "end_time" => patch.end = Some(parse_time(value)?),
            other => {
                return Err(SqlError::Unsupported(format!(
                    "availability_windows.{other} cannot be updated"
                )));
            }
        }
    }

    patch.recurrence = match (day_of_week, specific_date) {
        (None, None) => None,
        (Some(Some(day_of_week)), None | Some(None)) => Some(Recurrence::Weekly { day_of_week }),
        (None | Some(None), Some(Some(date))) => Some(Recurrence::Once { date }),
        (Some(Some(_)), Some(Some(_))) => {
            return Err(SqlError::Invalid(
                "set either day_of_week or specific_date, not both".into(),
            ));
        }
        _ => {
            return Err(SqlError::Invalid(
                "a window needs day_of_week or specific_date".into(),
            ));
        }
    };
    Ok(Command::UpdateWindow { id, patch })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "appointments" => Ok(Command::DeleteAppointment { id }),
        "availability_windows" => Ok(Command::DeleteWindow { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmp {
    Eq,
    GtEq,
    LtEq,
}

/// Conjunction of `column <op> value` predicates. Every predicate must be
/// consumed by the table it targets; leftovers are rejected.
struct Filters<'a> {
    preds: Vec<(String, Cmp, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn collect(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut preds = Vec::new();
        if let Some(expr) = selection {
            collect_predicates(expr, &mut preds)?;
        }
        Ok(Self { preds })
    }

    fn take(&mut self, column: &str, cmp: Cmp) -> Option<&'a Expr> {
        let i = self
            .preds
            .iter()
            .position(|(c, op, _)| c == column && *op == cmp)?;
        Some(self.preds.remove(i).2)
    }

    fn require(&mut self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.take(column, Cmp::Eq).ok_or(SqlError::MissingFilter(column))
    }

    fn finish(self) -> Result<(), SqlError> {
        match self.preds.first() {
            None => Ok(()),
            Some((column, _, _)) => Err(SqlError::Unsupported(format!("filter on {column}"))),
        }
    }
}

fn collect_predicates<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, Cmp, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let cmp = match op {
                ast::BinaryOperator::And => {
                    collect_predicates(left, out)?;
                    return collect_predicates(right, out);
                }
                ast::BinaryOperator::Eq => Cmp::Eq,
                ast::BinaryOperator::GtEq => Cmp::GtEq,
                ast::BinaryOperator::LtEq => Cmp::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
            out.push((column, cmp, right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("predicate {other}"))),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let mut filters = Filters::collect(select.selection.as_ref())?;

    let cmd = match table.as_str() {
        "available_slots" => Command::SelectAvailableSlots {
            tutor_id: parse_ulid_expr(filters.require("tutor_id")?)?,
            date: parse_date(filters.require("slot_date")?)?,
            duration_min: filters
                .take("duration_min", Cmp::Eq)
                .map(parse_i64_expr)
                .transpose()?,
            step_min: filters
                .take("step_min", Cmp::Eq)
                .map(parse_i64_expr)
                .transpose()?,
        },
        "appointments" => {
            let by_id = filters.take("id", Cmp::Eq);
            let by_tutor = filters.take("tutor_id", Cmp::Eq);
            let by_student = filters.take("student_id", Cmp::Eq);
            let filter = match (by_id, by_tutor, by_student) {
                (Some(e), None, None) => AppointmentFilter::Id(parse_ulid_expr(e)?),
                (None, Some(e), None) => AppointmentFilter::Tutor(parse_ulid_expr(e)?),
                (None, None, Some(e)) => AppointmentFilter::Student(parse_ulid_expr(e)?),
                (None, None, None) => {
                    return Err(SqlError::MissingFilter("id, tutor_id or student_id"));
                }
                _ => {
                    return Err(SqlError::Invalid(
                        "filter appointments by one of id, tutor_id or student_id".into(),
                    ));
                }
            };
            Command::SelectAppointments {
                filter,
                from: filters.take("start", Cmp::GtEq).map(parse_i64_expr).transpose()?,
                to: filters.take("end", Cmp::LtEq).map(parse_i64_expr).transpose()?,
            }
        }
        "availability_windows" => Command::SelectWindows {
            tutor_id: parse_ulid_expr(filters.require("tutor_id")?)?,
        },
        "balances" => Command::SelectBalances {
            student_id: parse_ulid_expr(filters.require("student_id")?)?,
            course_id: filters
                .take("course_id", Cmp::Eq)
                .map(parse_ulid_expr)
                .transpose()?,
        },
        _ => return Err(SqlError::UnknownTable(table)),
    };
    filters.finish()?;
    Ok(cmd)
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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

/// The single VALUES row of an INSERT.
fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.as_slice()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
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

/// An optional column: absent and NULL both read as `None`.
fn optional<T>(
    expr: Option<&Expr>,
    parse: impl Fn(&Expr) -> Result<Option<T>, SqlError>,
) -> Result<Option<T>, SqlError> {
    match expr {
        Some(e) => parse(e),
        None => Ok(None),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid_expr(expr).map(Some)
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_text(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_day_of_week(expr: &Expr) -> Result<Option<u8>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    let day = parse_i64_expr(expr)?;
    u8::try_from(day)
        .ok()
        .filter(|d| *d <= 6)
        .map(Some)
        .ok_or_else(|| {
            SqlError::Invalid(format!(
                "day_of_week must be 0 (Sunday) to 6 (Saturday), got {day}"
            ))
        })
}

/// `YYYY-MM-DD`.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let text = parse_text(expr)?;
    text.trim()
        .parse::<NaiveDate>()
        .map_err(|e| SqlError::Invalid(format!("bad date {text:?}: {e}")))
}

fn parse_date_or_null(expr: &Expr) -> Result<Option<NaiveDate>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_date(expr).map(Some)
}

/// `HH:MM` text, or minutes since midnight as a number.
fn parse_time(expr: &Expr) -> Result<TimeOfDay, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(n, _)) => n
            .parse::<u16>()
            .ok()
            .and_then(TimeOfDay::from_minutes)
            .ok_or_else(|| SqlError::Invalid(format!("minute of day out of range: {n}"))),
        _ => parse_text(expr)?.parse().map_err(SqlError::Invalid),
    }
}

fn parse_status(expr: &Expr) -> Result<AppointmentStatus, SqlError> {
    parse_text(expr)?.parse().map_err(SqlError::Invalid)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingColumn(&'static str, &'static str),
    /// Well-formed SQL carrying a value the domain rejects.
    Invalid(String),
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
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing column {col}"),
            SqlError::Invalid(s) => write!(f, "invalid value: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}
