use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::auth::SlotbookAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::notify;
use crate::observability;
use crate::sql::{self, Command, SqlError};

/// One handler per client connection. LISTEN subscriptions live here and are
/// drained into NotificationResponse messages ahead of each query result.
pub struct SlotbookHandler {
    engine: Arc<Engine>,
    auth: SlotbookAuthSource,
    query_parser: Arc<SlotbookQueryParser>,
    listeners: Mutex<HashMap<String, broadcast::Receiver<Event>>>,
}

impl SlotbookHandler {
    pub fn new(engine: Arc<Engine>, auth: SlotbookAuthSource) -> Self {
        Self {
            engine,
            auth,
            query_parser: Arc::new(SlotbookQueryParser),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    fn is_admin<C: ClientInfo>(&self, client: &C) -> bool {
        self.auth
            .is_admin(client.metadata().get("user").map(String::as_str))
    }

    /// Everything that arrived on this connection's channels since the last
    /// query. Lagged receivers skip what they missed.
    fn pending_notifications(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        let Ok(mut listeners) = self.listeners.lock() else {
            return out;
        };
        for (channel, rx) in listeners.iter_mut() {
            loop {
                match rx.try_recv() {
                    Ok(event) => out.push((channel.clone(), notify::payload(&event))),
                    Err(TryRecvError::Lagged(n)) => {
                        tracing::warn!("listener on {channel} lagged, dropped {n} notifications");
                    }
                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                }
            }
        }
        out
    }

    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let pid = std::process::id() as i32;
        for (channel, payload) in self.pending_notifications() {
            client
                .send(PgWireBackendMessage::NotificationResponse(
                    NotificationResponse::new(pid, channel, payload),
                ))
                .await?;
        }
        Ok(())
    }

    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let admin = self.is_admin(client);

        let started = Instant::now();
        let result = self.execute_command(cmd, admin).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command, admin: bool) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertProvider(provider) => {
                require_admin(admin, "register providers")?;
                engine.register_provider(provider).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertService(service) => {
                require_admin(admin, "register services")?;
                engine.register_service(service).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertBooking(req) => {
                engine.reserve(req, None).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SetBookingStatus {
                booking_id,
                status,
                requester_id,
            } => {
                let requester = requester(requester_id, admin);
                match status {
                    BookingStatus::Confirmed => engine.confirm(booking_id, requester, None).await,
                    BookingStatus::Completed => engine.complete(booking_id, requester, None).await,
                    BookingStatus::Cancelled => engine.cancel(booking_id, requester, None).await,
                    BookingStatus::Pending => Err(EngineError::Validation(
                        "bookings cannot be moved back to pending".into(),
                    )),
                }
                .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::CancelBooking { id, requester_id } => {
                engine
                    .cancel(id, requester(requester_id, admin), None)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectSlots {
                provider_id,
                service_id,
                date,
            } => {
                let slots = engine
                    .available_slots(provider_id, service_id, date)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(slot_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot.start.format("%H:%M").to_string())?;
                        encoder.encode_field(&slot.end.format("%H:%M").to_string())?;
                        encoder.encode_field(&slot.label)?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectBooking { id } => {
                let booking = engine.get_booking(id).await.map_err(engine_err)?;
                Ok(booking_rows(vec![booking]))
            }
            Command::SelectBookings { provider_id, date } => {
                let bookings = engine
                    .bookings_for(provider_id, date)
                    .await
                    .map_err(engine_err)?;
                Ok(booking_rows(bookings))
            }
            Command::Listen { channel } => {
                let provider_id = notify::parse_channel(&channel).ok_or_else(|| {
                    user_error(
                        "42000",
                        format!("invalid channel: {channel} (expected provider_{{id}})"),
                    )
                })?;
                if let Ok(mut listeners) = self.listeners.lock() {
                    listeners
                        .entry(channel)
                        .or_insert_with(|| engine.notify.subscribe(provider_id));
                }
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                if let Ok(mut listeners) = self.listeners.lock() {
                    listeners.remove(&channel);
                }
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                if let Ok(mut listeners) = self.listeners.lock() {
                    listeners.clear();
                }
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }
}

fn requester(user_id: UserId, admin: bool) -> Requester {
    if admin {
        Requester::admin(user_id)
    } else {
        Requester::user(user_id)
    }
}

fn require_admin(admin: bool, what: &str) -> PgWireResult<()> {
    if admin {
        Ok(())
    } else {
        Err(user_error("42501", format!("only the admin user may {what}")))
    }
}

fn varchar(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![varchar("start"), varchar("end"), varchar("label")]
}

fn booking_schema() -> Vec<FieldInfo> {
    [
        "id",
        "provider_id",
        "service_id",
        "user_id",
        "date",
        "start_time",
        "end_time",
        "status",
        "notes",
    ]
    .into_iter()
    .map(varchar)
    .collect()
}

fn booking_rows(bookings: Vec<Booking>) -> Response {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.provider_id.to_string())?;
            encoder.encode_field(&b.service_id.to_string())?;
            encoder.encode_field(&b.user_id.to_string())?;
            encoder.encode_field(&b.date.format("%Y-%m-%d").to_string())?;
            encoder.encode_field(&b.interval.start.format("%H:%M").to_string())?;
            encoder.encode_field(&b.interval.end.format("%H:%M").to_string())?;
            encoder.encode_field(&b.status.to_string())?;
            encoder.encode_field(&b.notes)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Result columns for a statement, decided from the table it reads.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match sql::parse_sql(sql) {
        Ok(Command::SelectSlots { .. }) => slot_schema(),
        Ok(Command::SelectBooking { .. } | Command::SelectBookings { .. }) => booking_schema(),
        _ => {
            let upper = sql.to_uppercase();
            if !upper.contains("SELECT") {
                vec![]
            } else if upper.contains("SLOTS") {
                slot_schema()
            } else if upper.contains("BOOKINGS") {
                booking_schema()
            } else {
                vec![]
            }
        }
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
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
        self.flush_notifications(client).await?;
        let response = self.run(client, query).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

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
        self.flush_notifications(client).await?;
        let sql = substitute_params(portal);
        self.run(client, &sql).await
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in `sql`.
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

/// Inline bound text parameters as quoted literals.
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    inline_params(&portal.statement.statement, &params)
}

/// Replace each `$N` outside a quoted literal with parameter `N`, in one
/// left-to-right pass. Inlined text is never rescanned, so a value containing
/// `$1` stays as written. Placeholders without a bound value are left alone.
fn inline_params(sql: &str, params: &[Option<String>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut in_literal = false;
    while let Some((i, c)) = chars.next() {
        if in_literal {
            // a doubled quote closes and immediately reopens
            in_literal = c != '\'';
            out.push(c);
            continue;
        }
        match c {
            '\'' => {
                in_literal = true;
                out.push(c);
            }
            '$' => {
                let mut end = i + 1;
                while let Some(&(j, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    end = j + 1;
                    chars.next();
                }
                let bound = sql[i + 1..end]
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|n| params.get(n));
                match bound {
                    Some(Some(value)) => {
                        out.push('\'');
                        out.push_str(&value.replace('\'', "''"));
                        out.push('\'');
                    }
                    Some(None) => out.push_str("NULL"),
                    None => out.push_str(&sql[i..end]),
                }
            }
            _ => out.push(c),
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SlotbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(engine: Arc<Engine>, auth: SlotbookAuthSource) -> Self {
        Self {
            handler: Arc::new(SlotbookHandler::new(engine, auth.clone())),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth,
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
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

/// Serve one client until it disconnects. Each connection gets its own
/// handler so LISTEN state is never shared.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    auth: SlotbookAuthSource,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = SlotbookFactory::new(engine, auth);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for each engine failure, so clients can branch on the code.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidWindow(_) | EngineError::Validation(_) => "22023",
        EngineError::Conflict(_) => "23P01",
        EngineError::NotFound { .. } => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Permission { .. } => "42501",
        EngineError::Timeout(_) => "55P03",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
