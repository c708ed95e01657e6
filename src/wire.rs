use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
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
use tokio::net::TcpStream;
use tracing::debug;

use crate::engine::validation::{parse_listing_type, parse_price};
use crate::engine::{AvailabilityQuery, Engine, EngineError, Field, ReservationRequest, ValidationErrors};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

pub struct StaybookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<StaybookQueryParser>,
}

impl StaybookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(StaybookQueryParser),
        }
    }

    async fn run(&self, query: &str, format: &Format) -> PgWireResult<Response> {
        debug!("query: {query}");
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result.map_err(engine_err)
    }

    async fn execute_command(&self, cmd: Command, format: &Format) -> Result<Response, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::InsertListing {
                id,
                listing_type,
                country,
                city,
                title,
                price,
            } => {
                let mut errors = ValidationErrors::new();
                let listing_type = parse_listing_type(&listing_type).map_err(|e| errors.merge(e)).ok();
                let price = match price {
                    Some(raw) => parse_price(Field::Price, &raw).map_err(|e| errors.merge(e)).ok(),
                    None => None,
                };
                let Some(listing_type) = listing_type else {
                    return Err(errors.into());
                };
                errors.into_result()?;
                engine
                    .create_listing(id, listing_type, &title, &country, &city, price)
                    .await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertRoomType {
                id,
                listing_id,
                title,
                price,
            } => {
                let price = parse_price(Field::Price, &price)?;
                engine.add_room_type(id, listing_id, &title, price).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertRoom {
                id,
                room_type_id,
                room_number,
            } => {
                engine.add_room(id, room_type_id, &room_number).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertReservation {
                id,
                listing_id,
                room_id,
                check_in,
                check_out,
            } => {
                let req = ReservationRequest::parse(id, listing_id, room_id, &check_in, &check_out)?;
                engine.create_reservation(req).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectUnits {
                checkin,
                checkout,
                max_price,
            } => {
                let query = AvailabilityQuery::parse(checkin.as_deref(), checkout.as_deref(), max_price.as_deref())?;
                let offers = engine.available_units(&query).await?;
                Ok(units_response(offers, format))
            }
            Command::SelectListings => Ok(listings_response(engine.list_listings(), format)),
            Command::SelectReservations { listing_id } => Ok(reservations_response(
                engine.list_reservations(listing_id).await,
                format,
            )),
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

/// Column descriptions in the client's requested result format. Simple
/// queries always get text.
fn schema(columns: &[(&str, Type)], format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| {
            let field_format = match format {
                Format::Individual(codes) if i >= codes.len() => FieldFormat::Text,
                _ => format.format_for(i),
            };
            FieldInfo::new((*name).into(), None, None, ty.clone(), field_format)
        })
        .collect()
}

fn units_schema(format: &Format) -> Vec<FieldInfo> {
    schema(
        &[
            ("listing_type", Type::VARCHAR),
            ("country", Type::VARCHAR),
            ("city", Type::VARCHAR),
            ("title", Type::VARCHAR),
            ("price", Type::VARCHAR),
        ],
        format,
    )
}

fn listings_schema(format: &Format) -> Vec<FieldInfo> {
    schema(
        &[
            ("id", Type::VARCHAR),
            ("listing_type", Type::VARCHAR),
            ("country", Type::VARCHAR),
            ("city", Type::VARCHAR),
            ("title", Type::VARCHAR),
            ("price", Type::VARCHAR),
            ("rooms", Type::INT8),
        ],
        format,
    )
}

fn reservations_schema(format: &Format) -> Vec<FieldInfo> {
    schema(
        &[
            ("id", Type::VARCHAR),
            ("listing_id", Type::VARCHAR),
            ("room_id", Type::VARCHAR),
            ("check_in", Type::VARCHAR),
            ("check_out", Type::VARCHAR),
            ("created_on", Type::INT8),
        ],
        format,
    )
}

fn units_response(offers: Vec<UnitOffer>, format: &Format) -> Response {
    let schema = Arc::new(units_schema(format));
    let rows: Vec<PgWireResult<_>> = offers
        .into_iter()
        .map(|offer| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&offer.listing_type.as_str())?;
            encoder.encode_field(&offer.country)?;
            encoder.encode_field(&offer.city)?;
            encoder.encode_field(&offer.title)?;
            encoder.encode_field(&offer.price.to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn listings_response(listings: Vec<ListingInfo>, format: &Format) -> Response {
    let schema = Arc::new(listings_schema(format));
    let rows: Vec<PgWireResult<_>> = listings
        .into_iter()
        .map(|l| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&l.id.to_string())?;
            encoder.encode_field(&l.listing_type.as_str())?;
            encoder.encode_field(&l.location.country)?;
            encoder.encode_field(&l.location.city)?;
            encoder.encode_field(&l.title)?;
            encoder.encode_field(&l.price.map(|p| p.to_string()))?;
            encoder.encode_field(&(l.room_count as i64))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn reservations_response(reservations: Vec<Reservation>, format: &Format) -> Response {
    let schema = Arc::new(reservations_schema(format));
    let rows: Vec<PgWireResult<_>> = reservations
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.listing_id.to_string())?;
            encoder.encode_field(&r.room_id.map(|id| id.to_string()))?;
            encoder.encode_field(&r.stay.check_in.to_string())?;
            encoder.encode_field(&r.stay.check_out.to_string())?;
            encoder.encode_field(&r.created_on)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Result columns of a statement, judged from the table after `FROM`.
fn result_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let mut tokens = upper.split(|c: char| c.is_whitespace() || c == ';');
    if tokens.next() != Some("SELECT") {
        return vec![];
    }
    let table = tokens.skip_while(|t| *t != "FROM").find(|t| !t.is_empty() && *t != "FROM");
    match table {
        Some("UNITS") => units_schema(format),
        Some("LISTINGS") => listings_schema(format),
        Some("RESERVATIONS") => reservations_schema(format),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for StaybookHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query, &Format::UnifiedText).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct StaybookQueryParser;

#[async_trait]
impl QueryParser for StaybookQueryParser {
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
impl ExtendedQueryHandler for StaybookHandler {
    type Statement = String;
    type QueryParser = StaybookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
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
        self.run(&sql, &portal.result_column_format).await
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

/// Byte spans and indexes of the `$N` placeholders in `sql`. Text inside
/// single-quoted literals and double-quoted identifiers is skipped.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        i += 1;
        match quote {
            // A doubled quote closes and reopens, which reads the same.
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let start = i - 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    if n > 0 {
                        found.push((start..i, n));
                    }
                }
            }
            None => {}
        }
    }
    found
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Inline bound text parameters as quoted literals in one pass over the
/// statement, so bound values are never scanned for placeholders.
fn substitute_params(sql: &str, params: &[Option<Bytes>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (span, n) in placeholders(sql) {
        let Some(param) = params.get(n - 1) else {
            continue;
        };
        result.push_str(&sql[copied..span.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = span.end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Auth ─────────────────────────────────────────────────────────

/// Single shared password for every user.
#[derive(Debug)]
pub struct PasswordAuthSource {
    password: String,
}

impl PasswordAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for PasswordAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct StaybookFactory {
    handler: Arc<StaybookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<PasswordAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl StaybookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(StaybookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                PasswordAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for StaybookFactory {
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
    engine: Arc<Engine>,
    password: String,
) -> std::io::Result<()> {
    let factory = Arc::new(StaybookFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, None, factory).await
}

/// Field-scoped errors travel as their JSON object so clients can map them
/// back onto form fields.
fn error_message(e: &EngineError) -> String {
    match e.field_errors() {
        Some(errors) => errors.to_json(),
        None => e.to_string(),
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        error_message(&e),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
