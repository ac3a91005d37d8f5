use std::fmt::Debug;
use std::io;
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

use crate::auth::{self, SharedSecretAuth};
use crate::engine::{Engine, EngineError, ErrorKind};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, WarehouseFilter};

pub struct StockholdHandler {
    engine: Arc<Engine>,
    query_parser: Arc<StockholdQueryParser>,
}

impl StockholdHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(StockholdQueryParser),
        }
    }

    /// Parse, execute and record query metrics.
    async fn run(&self, sql_text: &str, created_by: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql_text).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = execute_command(&self.engine, cmd, created_by).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }
}

/// Login user name, recorded as `created_by` on ledger rows.
fn session_user<C: ClientInfo>(client: &C) -> String {
    let user = client.metadata().get("user").map(String::as_str);
    auth::ledger_identity(user).unwrap_or("anonymous").to_string()
}

async fn execute_command(engine: &Engine, cmd: Command, created_by: &str) -> PgWireResult<Response> {
    match cmd {
        Command::InsertWarehouse { id, warehouse } => {
            engine.create_warehouse(id, warehouse).await.map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::UpdateWarehouse { id, update } => {
            engine.update_warehouse(id, update).await.map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
        }
        Command::SelectWarehouses { filter } => {
            let warehouses = match filter {
                WarehouseFilter::All => engine.list_warehouses(None),
                WarehouseFilter::Active(active) => engine.list_warehouses(Some(active)),
                WarehouseFilter::Id(id) => lookup_optional(engine.get_warehouse(&id))?,
                WarehouseFilter::Code(code) => lookup_optional(engine.get_warehouse_by_code(&code))?,
            };
            Ok(query_response(warehouse_schema(), warehouses, encode_warehouse))
        }
        Command::InsertItem { id, item } => {
            engine.create_item(id, item, created_by).await.map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::UpdateItem { id, update } => {
            engine.update_item(id, update).await.map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
        }
        Command::SelectItem { key } => {
            let item = engine.get_item(&key).await.map_err(engine_err)?;
            Ok(query_response(item_schema(), vec![item], encode_item))
        }
        Command::ListItems { filter } => {
            let (items, _total) = engine.list_items(&filter).await.map_err(engine_err)?;
            Ok(query_response(item_schema(), items, encode_item))
        }
        Command::SelectLocations { item_id } => {
            let locations = engine.list_locations(item_id).await.map_err(engine_err)?;
            Ok(query_response(
                location_schema(),
                locations,
                move |enc: &mut DataRowEncoder, loc: InventoryLocation| {
                    enc.encode_field(&item_id.to_string())?;
                    enc.encode_field(&loc.warehouse_id.to_string())?;
                    enc.encode_field(&loc.quantity)?;
                    enc.encode_field(&loc.available_quantity)?;
                    enc.encode_field(&loc.reserved_quantity)
                },
            ))
        }
        Command::Reserve { request } => {
            let reservation = engine
                .reserve_inventory(request, created_by)
                .await
                .map_err(engine_err)?;
            Ok(reservation_response(vec![reservation]))
        }
        Command::ConfirmReservation { id } => {
            engine
                .confirm_reservation(id, created_by)
                .await
                .map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
        }
        Command::CancelReservation { id } => {
            engine
                .cancel_reservation(id, created_by)
                .await
                .map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
        }
        Command::SelectReservation { id } => {
            let reservation = engine.get_reservation(&id).map_err(engine_err)?;
            Ok(reservation_response(vec![reservation]))
        }
        Command::SelectReservationsByReference { reference_id } => {
            Ok(reservation_response(engine.list_reservations(&reference_id)))
        }
        Command::CheckAvailability { lines } => {
            let report = engine
                .check_inventory_availability(&lines)
                .await
                .map_err(engine_err)?;
            let all_available = report.all_available;
            Ok(query_response(
                availability_schema(),
                report.items,
                move |enc: &mut DataRowEncoder, line: ItemAvailability| {
                    enc.encode_field(&line.product_id)?;
                    enc.encode_field(&line.variant_id)?;
                    enc.encode_field(&line.sku)?;
                    enc.encode_field(&line.requested_quantity)?;
                    enc.encode_field(&line.available_quantity)?;
                    enc.encode_field(&line.is_available)?;
                    enc.encode_field(&line.status)?;
                    enc.encode_field(&all_available)
                },
            ))
        }
        Command::BulkUpdate { lines } => {
            let response = engine
                .bulk_update_inventory(lines, created_by)
                .await
                .map_err(engine_err)?;
            Ok(query_response(
                bulk_schema(),
                response.results,
                |enc: &mut DataRowEncoder, r: BulkUpdateResult| {
                    let item = r.updated_item.as_ref();
                    enc.encode_field(&r.sku)?;
                    enc.encode_field(&r.success)?;
                    enc.encode_field(&r.message)?;
                    enc.encode_field(&item.map(|i| i.total_quantity))?;
                    enc.encode_field(&item.map(|i| i.available_quantity))?;
                    enc.encode_field(&item.map(|i| i.reserved_quantity))?;
                    enc.encode_field(&item.map(|i| i.status.as_str()))
                },
            ))
        }
        Command::SelectTransactions { item_id } => {
            let transactions = engine.list_transactions(item_id).await.map_err(engine_err)?;
            Ok(query_response(
                transaction_schema(),
                transactions,
                |enc: &mut DataRowEncoder, tx: Transaction| {
                    enc.encode_field(&tx.id.to_string())?;
                    enc.encode_field(&tx.inventory_item_id.to_string())?;
                    enc.encode_field(&tx.transaction_type.as_str())?;
                    enc.encode_field(&tx.quantity)?;
                    enc.encode_field(&tx.warehouse_id.to_string())?;
                    enc.encode_field(&tx.reference_id)?;
                    enc.encode_field(&tx.reference_type)?;
                    enc.encode_field(&tx.notes)?;
                    enc.encode_field(&tx.created_by)?;
                    enc.encode_field(&tx.created_at)
                },
            ))
        }
    }
}

/// Point lookups that miss return zero rows rather than an error.
fn lookup_optional(found: Result<Warehouse, EngineError>) -> PgWireResult<Vec<Warehouse>> {
    match found {
        Ok(w) => Ok(vec![w]),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(engine_err(e)),
    }
}

fn query_response<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// One row per reservation line; header columns repeat.
fn reservation_response(reservations: Vec<Reservation>) -> Response {
    let lines: Vec<(Reservation, ReservationLine)> = reservations
        .into_iter()
        .flat_map(|r| {
            let lines = r.lines.clone();
            lines.into_iter().map(move |line| (r.clone(), line))
        })
        .collect();
    query_response(
        reservation_schema(),
        lines,
        |enc: &mut DataRowEncoder, (r, line): (Reservation, ReservationLine)| {
            enc.encode_field(&r.id.to_string())?;
            enc.encode_field(&r.reference_id)?;
            enc.encode_field(&r.reference_type)?;
            enc.encode_field(&r.status.as_str())?;
            enc.encode_field(&r.expiration_time)?;
            enc.encode_field(&line.inventory_item_id.to_string())?;
            enc.encode_field(&line.warehouse_id.to_string())?;
            enc.encode_field(&line.quantity)?;
            enc.encode_field(&r.created_at)?;
            enc.encode_field(&r.updated_at)
        },
    )
}

fn encode_warehouse(enc: &mut DataRowEncoder, w: Warehouse) -> PgWireResult<()> {
    enc.encode_field(&w.id.to_string())?;
    enc.encode_field(&w.name)?;
    enc.encode_field(&w.code)?;
    enc.encode_field(&w.priority)?;
    enc.encode_field(&w.is_active)?;
    enc.encode_field(&w.address.line1)?;
    enc.encode_field(&w.address.line2)?;
    enc.encode_field(&w.address.city)?;
    enc.encode_field(&w.address.state)?;
    enc.encode_field(&w.address.postal_code)?;
    enc.encode_field(&w.address.country)?;
    enc.encode_field(&w.created_at)?;
    enc.encode_field(&w.updated_at)
}

fn encode_item(enc: &mut DataRowEncoder, item: ItemInfo) -> PgWireResult<()> {
    enc.encode_field(&item.id.to_string())?;
    enc.encode_field(&item.product_id)?;
    enc.encode_field(&item.variant_id)?;
    enc.encode_field(&item.sku)?;
    enc.encode_field(&item.total_quantity)?;
    enc.encode_field(&item.available_quantity)?;
    enc.encode_field(&item.reserved_quantity)?;
    enc.encode_field(&item.reorder_point)?;
    enc.encode_field(&item.reorder_quantity)?;
    enc.encode_field(&item.status.as_str())?;
    enc.encode_field(&(item.version as i64))?;
    enc.encode_field(&item.last_updated)?;
    enc.encode_field(&item.created_at)?;
    enc.encode_field(&item.updated_at)
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn warehouse_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("code", Type::VARCHAR),
        field("priority", Type::INT4),
        field("is_active", Type::BOOL),
        field("address_line1", Type::VARCHAR),
        field("address_line2", Type::VARCHAR),
        field("city", Type::VARCHAR),
        field("state", Type::VARCHAR),
        field("postal_code", Type::VARCHAR),
        field("country", Type::VARCHAR),
        field("created_at", Type::INT8),
        field("updated_at", Type::INT8),
    ]
}

fn item_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("product_id", Type::VARCHAR),
        field("variant_id", Type::VARCHAR),
        field("sku", Type::VARCHAR),
        field("total_quantity", Type::INT8),
        field("available_quantity", Type::INT8),
        field("reserved_quantity", Type::INT8),
        field("reorder_point", Type::INT8),
        field("reorder_quantity", Type::INT8),
        field("status", Type::VARCHAR),
        field("version", Type::INT8),
        field("last_updated", Type::INT8),
        field("created_at", Type::INT8),
        field("updated_at", Type::INT8),
    ]
}

fn location_schema() -> Vec<FieldInfo> {
    vec![
        field("inventory_item_id", Type::VARCHAR),
        field("warehouse_id", Type::VARCHAR),
        field("quantity", Type::INT8),
        field("available_quantity", Type::INT8),
        field("reserved_quantity", Type::INT8),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("reference_id", Type::VARCHAR),
        field("reference_type", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("expiration_time", Type::INT8),
        field("inventory_item_id", Type::VARCHAR),
        field("warehouse_id", Type::VARCHAR),
        field("quantity", Type::INT8),
        field("created_at", Type::INT8),
        field("updated_at", Type::INT8),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("product_id", Type::VARCHAR),
        field("variant_id", Type::VARCHAR),
        field("sku", Type::VARCHAR),
        field("requested_quantity", Type::INT8),
        field("available_quantity", Type::INT8),
        field("is_available", Type::BOOL),
        field("status", Type::VARCHAR),
        field("all_available", Type::BOOL),
    ]
}

fn bulk_schema() -> Vec<FieldInfo> {
    vec![
        field("sku", Type::VARCHAR),
        field("success", Type::BOOL),
        field("message", Type::VARCHAR),
        field("total_quantity", Type::INT8),
        field("available_quantity", Type::INT8),
        field("reserved_quantity", Type::INT8),
        field("status", Type::VARCHAR),
    ]
}

fn transaction_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("inventory_item_id", Type::VARCHAR),
        field("transaction_type", Type::VARCHAR),
        field("quantity", Type::INT8),
        field("warehouse_id", Type::VARCHAR),
        field("reference_id", Type::VARCHAR),
        field("reference_type", Type::VARCHAR),
        field("notes", Type::VARCHAR),
        field("created_by", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

/// Result columns of a statement, judged from its verb and target table.
/// Statements without rows describe as empty.
fn result_schema(sql_text: &str) -> Vec<FieldInfo> {
    let lower = sql_text.to_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|t| !t.is_empty())
        .collect();
    let after = |keyword: &str| {
        tokens
            .iter()
            .position(|t| *t == keyword)
            .and_then(|i| tokens.get(i + 1))
            .map(|t| t.trim_matches('"'))
    };
    match tokens.first().copied() {
        Some("select") => match after("from") {
            Some("warehouses") => warehouse_schema(),
            Some("inventory_items") => item_schema(),
            Some("inventory_locations") => location_schema(),
            Some("reservations") => reservation_schema(),
            Some("availability") => availability_schema(),
            Some("transactions") => transaction_schema(),
            _ => Vec::new(),
        },
        Some("insert") => match after("into") {
            Some("reservations") => reservation_schema(),
            Some("adjustments") => bulk_schema(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

#[async_trait]
impl SimpleQueryHandler for StockholdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let user = session_user(client);
        Ok(vec![self.run(query, &user).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct StockholdQueryParser;

#[async_trait]
impl QueryParser for StockholdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
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
impl ExtendedQueryHandler for StockholdHandler {
    type Statement = String;
    type QueryParser = StockholdQueryParser;

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
        let user = session_user(client);
        let sql_text = substitute_params(portal);
        self.run(&sql_text, &user).await
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

/// Inline bound text parameters as quoted literals. Replaces from the highest
/// index down so `$1` never clobbers the prefix of `$10`.
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

pub struct StockholdFactory {
    handler: Arc<StockholdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SharedSecretAuth, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl StockholdFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(StockholdHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SharedSecretAuth::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for StockholdFactory {
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
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(StockholdFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::NotFound | ErrorKind::ReservationNotFound => "02000",
        ErrorKind::AlreadyExists => "23505",
        ErrorKind::InvalidInput | ErrorKind::InvalidQuantity => "22023",
        ErrorKind::InsufficientInventory => "53400",
        ErrorKind::ReservationExpired | ErrorKind::ReservationInvalidState => "55000",
        ErrorKind::WarehouseInactive => "55006",
        ErrorKind::LimitExceeded => "54000",
        ErrorKind::Timeout => "57014",
        ErrorKind::Storage | ErrorKind::Internal => "58000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    let kind = e.kind();
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(kind).into(),
        format!("{}: {e}", kind.code()),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
