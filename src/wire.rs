use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
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

use crate::auth::{TutorslotAuthSource, parse_actor};
use crate::engine::{BookingRequest, Engine, EngineError};
use crate::limits::MAX_QUERY_WINDOW_MS;
use crate::model::*;
use crate::observability;
use crate::sql::{self, AppointmentFilter, Command, SqlError};
use crate::tenant::TenantManager;

pub struct TutorslotHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<TutorslotQueryParser>,
}

impl TutorslotHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(TutorslotQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Actor> {
        let user = client.metadata().get("user").cloned().unwrap_or_default();
        parse_actor(&user).ok_or_else(|| user_error("28000", format!("unknown user {user:?}")))
    }

    /// Parse, execute and time one statement for the connected client.
    async fn run<C: ClientInfo>(
        &self,
        client: &C,
        query: &str,
        format: Option<&Format>,
    ) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let actor = self.resolve_actor(client)?;
        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(observability::QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                    .increment(1);
                return Err(sql_err(e));
            }
        };

        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = execute_command(&engine, &actor, cmd, format).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = match &result {
            Ok(_) => "ok",
            Err(e) if e.is_retryable() => "conflict",
            Err(_) => "error",
        };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);

        result.map_err(|e| {
            debug!("{label} by {} {} failed: {e}", actor.role.as_str(), actor.user_id);
            engine_err(e)
        })
    }
}

async fn execute_command(
    engine: &Engine,
    actor: &Actor,
    cmd: Command,
    format: Option<&Format>,
) -> Result<Response, EngineError> {
    match cmd {
        Command::SelectAvailableSlots {
            tutor_id,
            date,
            duration_min,
            step_min,
        } => {
            let slots = engine
                .available_slots(tutor_id, date, duration_min, step_min)
                .await?;
            let tutor = tutor_id.to_string();
            Ok(rows(ResultKind::Slots, format, slots, |enc, slot| {
                enc.encode_field(&tutor)?;
                enc.encode_field(&slot.start)?;
                enc.encode_field(&slot.end)
            }))
        }
        Command::InsertAppointment {
            id,
            student_id,
            tutor_id,
            start,
            end,
            course_id,
            notes,
        } => {
            let req = BookingRequest {
                id,
                student_id,
                tutor_id,
                span: checked_span(start, end)?,
                course_id,
                notes,
            };
            engine.book(actor, req).await?;
            Ok(execution("INSERT", 1))
        }
        Command::DeleteAppointment { id } => {
            engine.cancel(actor, id).await?;
            Ok(execution("DELETE", 1))
        }
        Command::InsertOutcome {
            appointment_id,
            outcome,
        } => {
            engine.mark_outcome(actor, appointment_id, outcome).await?;
            Ok(execution("INSERT", 1))
        }
        Command::InsertReschedule {
            appointment_id,
            new_id,
            start,
            end,
        } => {
            engine
                .reschedule(actor, appointment_id, new_id, checked_span(start, end)?)
                .await?;
            Ok(execution("INSERT", 1))
        }
        Command::SelectAppointments { filter, from, to } => {
            let range = query_range(from, to)?;
            let mut found = match filter {
                AppointmentFilter::Id(id) => vec![engine.get_appointment(actor, id).await?],
                AppointmentFilter::Tutor(tutor_id) => {
                    engine.list_by_tutor(actor, tutor_id, range).await?
                }
                AppointmentFilter::Student(student_id) => {
                    engine.list_by_student(actor, student_id, range).await?
                }
            };
            found.retain(|a| {
                from.is_none_or(|f| a.span.start >= f) && to.is_none_or(|t| a.span.end <= t)
            });
            Ok(rows(ResultKind::Appointments, format, found, |enc, a| {
                enc.encode_field(&a.id.to_string())?;
                enc.encode_field(&a.student_id.to_string())?;
                enc.encode_field(&a.tutor_id.to_string())?;
                enc.encode_field(&a.span.start)?;
                enc.encode_field(&a.span.end)?;
                enc.encode_field(&a.status.to_string())?;
                enc.encode_field(&a.course_id.map(|c| c.to_string()))?;
                enc.encode_field(&a.notes)?;
                enc.encode_field(&a.credited_back)?;
                enc.encode_field(&a.carried_to.map(|c| c.to_string()))
            }))
        }
        Command::InsertWindow { window } => {
            engine.add_window(actor, window).await?;
            Ok(execution("INSERT", 1))
        }
        Command::UpdateWindow { id, patch } => {
            engine.patch_window(actor, id, patch).await?;
            Ok(execution("UPDATE", 1))
        }
        Command::DeleteWindow { id } => {
            engine.remove_window(actor, id).await?;
            Ok(execution("DELETE", 1))
        }
        Command::SelectWindows { tutor_id } => {
            let windows = engine.list_windows(tutor_id).await;
            Ok(rows(ResultKind::Windows, format, windows, |enc, w| {
                let (day_of_week, specific_date) = match w.recurrence {
                    Recurrence::Weekly { day_of_week } => (Some(day_of_week as i32), None),
                    Recurrence::Once { date } => (None, Some(date.to_string())),
                };
                enc.encode_field(&w.id.to_string())?;
                enc.encode_field(&w.tutor_id.to_string())?;
                enc.encode_field(&day_of_week)?;
                enc.encode_field(&specific_date)?;
                enc.encode_field(&w.start.to_string())?;
                enc.encode_field(&w.end.to_string())
            }))
        }
        Command::InsertPurchase {
            student_id,
            course_id,
            minutes,
        } => {
            engine
                .purchase_hours(actor, BalanceKey::new(student_id, course_id), minutes)
                .await?;
            Ok(execution("INSERT", 1))
        }
        Command::SelectBalances {
            student_id,
            course_id,
        } => {
            let balances = match course_id {
                Some(course_id) => {
                    let key = BalanceKey::new(student_id, Some(course_id));
                    vec![engine.balance(actor, &key).await?]
                }
                None => engine.balances_of(actor, student_id).await?,
            };
            Ok(rows(ResultKind::Balances, format, balances, |enc, b| {
                enc.encode_field(&b.key.student_id.to_string())?;
                enc.encode_field(&b.key.course_id.map(|c| c.to_string()))?;
                enc.encode_field(&b.total_purchased)?;
                enc.encode_field(&b.used)?;
                enc.encode_field(&b.available())
            }))
        }
        Command::InsertCreditBack { appointment_id } => {
            let credited = engine.credit_back(actor, appointment_id).await?;
            Ok(execution("INSERT", usize::from(credited)))
        }
    }
}

fn checked_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    Span::try_new(start, end)
        .ok_or_else(|| EngineError::Validation(format!("end {end} must be after start {start}")))
}

/// Range handed to the store for an appointment listing. A one-sided
/// bound extends as far as a listing may reach.
fn query_range(from: Option<Ms>, to: Option<Ms>) -> Result<Option<Span>, EngineError> {
    match (from, to) {
        (None, None) => Ok(None),
        (Some(from), Some(to)) => checked_span(from, to).map(Some),
        (Some(from), None) => checked_span(from, from.saturating_add(MAX_QUERY_WINDOW_MS)).map(Some),
        (None, Some(to)) => checked_span(to.saturating_sub(MAX_QUERY_WINDOW_MS), to).map(Some),
    }
}

fn execution(tag: &str, rows: usize) -> Response {
    Response::Execution(Tag::new(tag).with_rows(rows))
}

// ── Result schemas ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultKind {
    Slots,
    Appointments,
    Windows,
    Balances,
}

impl ResultKind {
    /// Which rows a statement returns, judged from its text alone. Used to
    /// describe prepared statements before their parameters are known.
    fn of_statement(sql: &str) -> Option<Self> {
        let mut words = sql.split_whitespace();
        if !words.next()?.eq_ignore_ascii_case("select") {
            return None;
        }
        let table = words
            .skip_while(|w| !w.eq_ignore_ascii_case("from"))
            .nth(1)?
            .trim_end_matches(';')
            .trim_matches('"')
            .to_ascii_lowercase();
        match table.as_str() {
            "available_slots" => Some(ResultKind::Slots),
            "appointments" => Some(ResultKind::Appointments),
            "availability_windows" => Some(ResultKind::Windows),
            "balances" => Some(ResultKind::Balances),
            _ => None,
        }
    }

    fn columns(self) -> Vec<(&'static str, Type)> {
        match self {
            ResultKind::Slots => vec![
                ("tutor_id", Type::VARCHAR),
                ("start", Type::INT8),
                ("end", Type::INT8),
            ],
            ResultKind::Appointments => vec![
                ("id", Type::VARCHAR),
                ("student_id", Type::VARCHAR),
                ("tutor_id", Type::VARCHAR),
                ("start", Type::INT8),
                ("end", Type::INT8),
                ("status", Type::VARCHAR),
                ("course_id", Type::VARCHAR),
                ("notes", Type::VARCHAR),
                ("credited_back", Type::BOOL),
                ("rescheduled_to", Type::VARCHAR),
            ],
            ResultKind::Windows => vec![
                ("id", Type::VARCHAR),
                ("tutor_id", Type::VARCHAR),
                ("day_of_week", Type::INT4),
                ("specific_date", Type::VARCHAR),
                ("start_time", Type::VARCHAR),
                ("end_time", Type::VARCHAR),
            ],
            ResultKind::Balances => vec![
                ("student_id", Type::VARCHAR),
                ("course_id", Type::VARCHAR),
                ("total_purchased", Type::INT8),
                ("used", Type::INT8),
                ("available", Type::INT8),
            ],
        }
    }

    fn schema(self, format: Option<&Format>) -> Vec<FieldInfo> {
        self.columns()
            .into_iter()
            .enumerate()
            .map(|(i, (name, ty))| {
                let field_format = format.map_or(FieldFormat::Text, |f| f.format_for(i));
                FieldInfo::new(name.into(), None, None, ty, field_format)
            })
            .collect()
    }
}

fn statement_schema(sql: &str, format: Option<&Format>) -> Vec<FieldInfo> {
    ResultKind::of_statement(sql).map_or_else(Vec::new, |kind| kind.schema(format))
}

fn rows<T>(
    kind: ResultKind,
    format: Option<&Format>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(kind.schema(format));
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

#[async_trait]
impl SimpleQueryHandler for TutorslotHandler {
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
        Ok(vec![self.run(&*client, query, None).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct TutorslotQueryParser;

#[async_trait]
impl QueryParser for TutorslotQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_schema(stmt, column_format))
    }
}

#[async_trait]
impl ExtendedQueryHandler for TutorslotHandler {
    type Statement = String;
    type QueryParser = TutorslotQueryParser;

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
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(&*client, &sql, Some(&portal.result_column_format))
            .await
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
            statement_schema(&target.statement, None),
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
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
            Some(&target.result_column_format),
        )))
    }
}

/// Walk `sql`, calling `on_param` for every `$N` outside a quoted literal.
/// Returns the text with each placeholder replaced by what `on_param` yields.
fn scan_params(sql: &str, mut on_param: impl FnMut(usize) -> Option<String>) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut in_literal = false;
    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            in_literal = !in_literal;
        }
        if c != '$' || in_literal {
            out.push(c);
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while let Some(&(j, d)) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            end = j + 1;
            chars.next();
        }
        let replacement = sql[start..end].parse::<usize>().ok().and_then(&mut on_param);
        match replacement {
            Some(text) => out.push_str(&text),
            None => out.push_str(&sql[i..end]),
        }
    }
    out
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let mut max = 0;
    scan_params(sql, |n| {
        max = max.max(n);
        None
    });
    max
}

/// Inline bound parameters as SQL literals.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    scan_params(sql, |n| {
        let param = params.get(n.checked_sub(1)?)?;
        Some(match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        })
    })
}

// ── Factory ──────────────────────────────────────────────────────

pub struct TutorslotFactory {
    handler: Arc<TutorslotHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<TutorslotAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl TutorslotFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = TutorslotAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(TutorslotHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for TutorslotFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let factory = Arc::new(TutorslotFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await?;
    Ok(())
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE reported for an engine error.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::SlotUnavailable | EngineError::Overlap(_) => "40001",
        EngineError::InsufficientBalance { .. } => "53000",
        EngineError::NotFound(_) => "02000",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::InvalidTransition { .. } | EngineError::WindowInUse(_) => "55000",
        EngineError::Forbidden(_) => "42501",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) | EngineError::Reconciliation(_) => "58000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match &e {
        SqlError::Invalid(_) => "22023",
        SqlError::UnknownTable(_) => "42P01",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
