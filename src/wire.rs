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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
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

use crate::auth::WorkbayAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::scheduler::{AvailabilityRequest, BookingOutcome, BookingRequest, Scheduler};
use crate::shop::ShopManager;
use crate::sql::{self, Command};

pub struct WorkbayHandler {
    shops: Arc<ShopManager>,
    scheduler: Arc<Scheduler>,
    query_parser: Arc<WorkbayQueryParser>,
}

impl WorkbayHandler {
    pub fn new(shops: Arc<ShopManager>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            shops,
            scheduler,
            query_parser: Arc::new(WorkbayQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let shop = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.shops
            .get_or_create(&shop)
            .map_err(|e| user_error("08006", format!("shop error: {e}")))
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, engine: &Engine, sql: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::InsertMechanic { id, name } => {
                engine.create_mechanic(id, name).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteMechanic { id } => {
                engine.delete_mechanic(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectMechanics => {
                let mechanics = engine.list_mechanics().await;
                let schema = Arc::new(mechanics_schema(format));
                let rows: Vec<PgWireResult<_>> = mechanics
                    .into_iter()
                    .map(|m| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&m.id.to_string())?;
                        encoder.encode_field(&m.name)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectAvailability {
                date,
                duration_minutes,
            } => {
                let request = AvailabilityRequest::parse(&date, duration_minutes).map_err(engine_err)?;
                let slots = self
                    .scheduler
                    .get_availability(engine, &request)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(availability_schema(format));
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot.mechanic_id.to_string())?;
                        encoder.encode_field(&slot.mechanic_name)?;
                        encoder.encode_field(&slot.span.start)?;
                        encoder.encode_field(&slot.span.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::InsertVisit {
                id,
                mechanic_id,
                client_id,
                vehicle_id,
                start,
                end,
                service_ids,
            } => {
                if start >= end {
                    return Err(engine_err(EngineError::invalid("visit must end after it starts")));
                }
                let request = BookingRequest {
                    visit_id: id,
                    offer: BookingOffer {
                        mechanic_id,
                        span: Span::new(start, end),
                    },
                    client_id,
                    vehicle_id,
                    service_ids,
                };
                match self.scheduler.book_slot(engine, request).await.map_err(engine_err)? {
                    BookingOutcome::Booked(_) => Ok(Response::Execution(Tag::new("INSERT").with_rows(1))),
                    BookingOutcome::Rejected(rejected) => Err(user_error(
                        "40001",
                        format!(
                            "slot no longer available on mechanic {}: conflicts with visit {}",
                            rejected.offer.mechanic_id, rejected.conflicting_visit
                        ),
                    )),
                }
            }
            Command::DeleteVisit { id } => {
                engine.delete_visit(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectVisits { id, mechanic_id } => {
                let visits = match id {
                    Some(id) => match engine.get_visit(id).await {
                        Ok(v) if mechanic_id.is_none_or(|m| m == v.mechanic_id) => vec![v],
                        Ok(_) | Err(EngineError::NotFound(_)) => Vec::new(),
                        Err(e) => return Err(engine_err(e)),
                    },
                    None => engine.list_visits(mechanic_id).await.map_err(engine_err)?,
                };

                let schema = Arc::new(visits_schema(format));
                let rows: Vec<PgWireResult<_>> = visits
                    .into_iter()
                    .map(|v| {
                        let services: Vec<String> = v.service_ids.iter().map(Ulid::to_string).collect();
                        let services = serde_json::to_string(&services)
                            .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&v.id.to_string())?;
                        encoder.encode_field(&v.mechanic_id.to_string())?;
                        encoder.encode_field(&v.client_id.to_string())?;
                        encoder.encode_field(&v.vehicle_id.to_string())?;
                        encoder.encode_field(&services)?;
                        encoder.encode_field(&v.span.start)?;
                        encoder.encode_field(&v.span.end)?;
                        encoder.encode_field(&v.status.as_str())?;
                        encoder.encode_field(&v.created_at)?;
                        encoder.encode_field(&v.updated_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::AdvanceVisit { visit_id, status } => {
                self.scheduler
                    .advance_visit(engine, visit_id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn fields(columns: &[(&str, Type)], format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| FieldInfo::new((*name).into(), None, None, ty.clone(), format.format_for(i)))
        .collect()
}

fn availability_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("mechanic_id", Type::VARCHAR),
            ("mechanic_name", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
        ],
        format,
    )
}

fn mechanics_schema(format: &Format) -> Vec<FieldInfo> {
    fields(&[("id", Type::VARCHAR), ("name", Type::VARCHAR)], format)
}

fn visits_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("mechanic_id", Type::VARCHAR),
            ("client_id", Type::VARCHAR),
            ("vehicle_id", Type::VARCHAR),
            ("services", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
            ("status", Type::VARCHAR),
            ("created_at", Type::INT8),
            ("updated_at", Type::INT8),
        ],
        format,
    )
}

/// Result columns for a statement, or none if it returns no rows.
fn result_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    match sql::select_table(sql).as_deref() {
        Some("availability") => availability_schema(format),
        Some("mechanics") => mechanics_schema(format),
        Some("visits") => visits_schema(format),
        _ => Vec::new(),
    }
}

#[async_trait]
impl SimpleQueryHandler for WorkbayHandler {
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
        let engine = self.resolve_engine(client)?;
        let response = self.run(&engine, query, &Format::UnifiedText).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct WorkbayQueryParser;

#[async_trait]
impl QueryParser for WorkbayQueryParser {
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
        Ok(result_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for WorkbayHandler {
    type Statement = String;
    type QueryParser = WorkbayQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        debug!("extended query: {sql}");
        self.run(&engine, &sql, &portal.result_column_format).await
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
            result_schema(&target.statement, &Format::UnifiedText),
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
            &target.result_column_format,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
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

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Replaced from the highest index down so `$1` never clobbers `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct WorkbayFactory {
    handler: Arc<WorkbayHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<WorkbayAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl WorkbayFactory {
    pub fn new(shops: Arc<ShopManager>, scheduler: Arc<Scheduler>, password: String) -> Self {
        let auth_source = WorkbayAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(WorkbayHandler::new(shops, scheduler)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for WorkbayFactory {
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
    shops: Arc<ShopManager>,
    scheduler: Arc<Scheduler>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(WorkbayFactory::new(shops, scheduler, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for each engine error. Clients branch on these, so they are stable.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidRequest(_) | EngineError::LimitExceeded(_) => "22023",
        EngineError::ResourceNotFound(_) | EngineError::NotFound(_) => "P0002",
        EngineError::SlotNoLongerAvailable { .. } => "40001",
        EngineError::IllegalTransition { .. } => "55000",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::HasVisits(_) => "23503",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
