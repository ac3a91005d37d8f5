use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Which warehouses a SELECT asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarehouseFilter {
    All,
    Id(Ulid),
    Code(String),
    Active(bool),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertWarehouse {
        id: Ulid,
        warehouse: NewWarehouse,
    },
    UpdateWarehouse {
        id: Ulid,
        update: WarehouseUpdate,
    },
    SelectWarehouses {
        filter: WarehouseFilter,
    },
    InsertItem {
        id: Ulid,
        item: NewItem,
    },
    UpdateItem {
        id: Ulid,
        update: ItemUpdate,
    },
    SelectItem {
        key: ItemKey,
    },
    ListItems {
        filter: ItemFilter,
    },
    SelectLocations {
        item_id: Ulid,
    },
    Reserve {
        request: ReserveRequest,
    },
    ConfirmReservation {
        id: Ulid,
    },
    CancelReservation {
        id: Ulid,
    },
    SelectReservation {
        id: Ulid,
    },
    SelectReservationsByReference {
        reference_id: String,
    },
    CheckAvailability {
        lines: Vec<AvailabilityRequest>,
    },
    BulkUpdate {
        lines: Vec<BulkLine>,
    },
    SelectTransactions {
        item_id: Ulid,
    },
}

const WAREHOUSE_ADDRESS_COLUMNS: &[&str] = &[
    "address_line1",
    "address_line2",
    "city",
    "state",
    "postal_code",
    "country",
];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
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

/// One VALUES row addressed by column name.
struct Row<'a> {
    columns: &'a [String],
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.require(column)?)
    }

    fn opt_ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.get(column).map(parse_ulid_or_null).transpose().map(Option::flatten)
    }

    fn string(&self, column: &'static str) -> Result<String, SqlError> {
        parse_string_expr(self.require(column)?)
    }

    fn opt_string(&self, column: &str) -> Result<Option<String>, SqlError> {
        self.get(column).map(parse_string_or_null).transpose().map(Option::flatten)
    }

    fn i64(&self, column: &'static str) -> Result<i64, SqlError> {
        parse_i64_expr(self.require(column)?)
    }

    fn i64_or(&self, column: &str, default: i64) -> Result<i64, SqlError> {
        self.get(column).map(parse_i64_expr).transpose().map(|v| v.unwrap_or(default))
    }

    fn bool_or(&self, column: &str, default: bool) -> Result<bool, SqlError> {
        self.get(column).map(parse_bool).transpose().map(|v| v.unwrap_or(default))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    let rows = extract_all_insert_rows(insert)?;
    if columns.is_empty() {
        return Err(SqlError::Parse(format!("INSERT INTO {table} requires a column list")));
    }
    let allowed: &[&str] = match table.as_str() {
        "warehouses" => &[
            "id",
            "name",
            "code",
            "priority",
            "is_active",
            "address_line1",
            "address_line2",
            "city",
            "state",
            "postal_code",
            "country",
        ],
        "inventory_items" => &[
            "id",
            "product_id",
            "variant_id",
            "sku",
            "initial_quantity",
            "reorder_point",
            "reorder_quantity",
            "allocations",
        ],
        "reservations" => &[
            "id",
            "inventory_item_id",
            "quantity",
            "warehouse_id",
            "reference_id",
            "reference_type",
            "reservation_minutes",
        ],
        "adjustments" => &[
            "sku",
            "quantity_delta",
            "warehouse_id",
            "reference_id",
            "reference_type",
            "notes",
        ],
        _ => return Err(SqlError::UnknownTable(table)),
    };
    check_columns(&columns, allowed)?;

    let mut parsed = Vec::with_capacity(rows.len());
    for values in &rows {
        if values.len() != columns.len() {
            return Err(SqlError::WrongArity(columns.len(), values.len()));
        }
        parsed.push(Row {
            columns: &columns,
            values,
        });
    }

    match table.as_str() {
        "warehouses" => {
            let row = single_row(&parsed)?;
            Ok(Command::InsertWarehouse {
                id: row.ulid("id")?,
                warehouse: NewWarehouse {
                    name: row.string("name")?,
                    code: row.string("code")?,
                    address: address_from(|c| row.opt_string(c))?,
                    is_active: row.bool_or("is_active", true)?,
                    priority: to_i32(row.i64_or("priority", 0)?)?,
                },
            })
        }
        "inventory_items" => {
            let row = single_row(&parsed)?;
            let allocations = match row.opt_string("allocations")? {
                Some(text) => parse_allocations(&text)?,
                None => Vec::new(),
            };
            Ok(Command::InsertItem {
                id: row.ulid("id")?,
                item: NewItem {
                    product_id: row.string("product_id")?,
                    variant_id: row.opt_string("variant_id")?,
                    sku: row.string("sku")?,
                    initial_quantity: row.i64_or("initial_quantity", 0)?,
                    reorder_point: row.i64_or("reorder_point", 0)?,
                    reorder_quantity: row.i64_or("reorder_quantity", 0)?,
                    warehouse_allocations: allocations,
                },
            })
        }
        "reservations" => parse_reserve_rows(&parsed),
        "adjustments" => {
            let lines = parsed
                .iter()
                .map(|row| {
                    Ok(BulkLine {
                        sku: row.string("sku")?,
                        quantity_delta: row.i64("quantity_delta")?,
                        warehouse_id: row.opt_ulid("warehouse_id")?,
                        reference_id: row.opt_string("reference_id")?,
                        reference_type: row.opt_string("reference_type")?,
                        notes: row.opt_string("notes")?,
                    })
                })
                .collect::<Result<Vec<_>, SqlError>>()?;
            Ok(Command::BulkUpdate { lines })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// One row per item; the reservation header columns repeat on every row and
/// must agree.
fn parse_reserve_rows(rows: &[Row<'_>]) -> Result<Command, SqlError> {
    let first = rows.first().ok_or_else(|| SqlError::Parse("empty VALUES".into()))?;
    let id = first.ulid("id")?;
    let reference_id = first.string("reference_id")?;
    let reference_type = first.opt_string("reference_type")?.unwrap_or_default();
    let reservation_minutes = first.i64_or("reservation_minutes", 0)?;

    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        let same_header = row.ulid("id")? == id
            && row.string("reference_id")? == reference_id
            && row.opt_string("reference_type")?.unwrap_or_default() == reference_type
            && row.i64_or("reservation_minutes", 0)? == reservation_minutes;
        if !same_header {
            return Err(SqlError::Parse(
                "reservation rows must share id, reference and duration".into(),
            ));
        }
        items.push(ReserveLine {
            inventory_item_id: row.ulid("inventory_item_id")?,
            quantity: row.i64("quantity")?,
            warehouse_id: row.opt_ulid("warehouse_id")?,
        });
    }

    Ok(Command::Reserve {
        request: ReserveRequest {
            id,
            items,
            reference_id,
            reference_type,
            reservation_minutes,
        },
    })
}

/// `'<warehouse ulid>:<qty>,<warehouse ulid>:<qty>'`
fn parse_allocations(text: &str) -> Result<Vec<(Ulid, i64)>, SqlError> {
    text.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (wid, qty) = part
                .split_once(':')
                .ok_or_else(|| SqlError::Parse(format!("bad allocation '{part}'")))?;
            let wid = Ulid::from_string(wid.trim())
                .map_err(|e| SqlError::Parse(format!("bad ULID in allocation: {e}")))?;
            let qty = qty
                .trim()
                .parse::<i64>()
                .map_err(|e| SqlError::Parse(format!("bad quantity in allocation: {e}")))?;
            Ok((wid, qty))
        })
        .collect()
}

fn single_row<'r, 'a>(rows: &'r [Row<'a>]) -> Result<&'r Row<'a>, SqlError> {
    match rows {
        [row] => Ok(row),
        _ => Err(SqlError::Unsupported("multi-row INSERT into this table".into())),
    }
}

fn address_from(
    mut get: impl FnMut(&str) -> Result<Option<String>, SqlError>,
) -> Result<Address, SqlError> {
    Ok(Address {
        line1: get("address_line1")?,
        line2: get("address_line2")?,
        city: get("city")?,
        state: get("state")?,
        postal_code: get("postal_code")?,
        country: get("country")?,
    })
}

fn check_columns(columns: &[String], allowed: &[&str]) -> Result<(), SqlError> {
    for (i, col) in columns.iter().enumerate() {
        if !allowed.contains(&col.as_str()) {
            return Err(SqlError::UnknownColumn(col.clone()));
        }
        if columns[..i].contains(col) {
            return Err(SqlError::Parse(format!("column {col} given twice")));
        }
    }
    Ok(())
}

// ── UPDATE / DELETE ───────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;
    let mut sets: Vec<(String, &Expr)> = Vec::with_capacity(assignments.len());
    for a in assignments {
        let column = match &a.target {
            ast::AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            ast::AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        sets.push((column, &a.value));
    }
    let lookup = |col: &str| sets.iter().find(|(c, _)| c == col).map(|(_, e)| *e);

    match table.as_str() {
        "warehouses" => {
            let names: Vec<String> = sets.iter().map(|(c, _)| c.clone()).collect();
            let mut allowed = vec!["name", "priority", "is_active"];
            allowed.extend_from_slice(WAREHOUSE_ADDRESS_COLUMNS);
            check_columns(&names, &allowed)?;

            let touches_address = names
                .iter()
                .any(|c| WAREHOUSE_ADDRESS_COLUMNS.contains(&c.as_str()));
            let address = if touches_address {
                Some(address_from(|c| {
                    lookup(c).map(parse_string_or_null).transpose().map(Option::flatten)
                })?)
            } else {
                None
            };
            Ok(Command::UpdateWarehouse {
                id,
                update: WarehouseUpdate {
                    name: lookup("name").map(parse_string_expr).transpose()?,
                    address,
                    is_active: lookup("is_active").map(parse_bool).transpose()?,
                    priority: lookup("priority")
                        .map(|e| parse_i64_expr(e).and_then(to_i32))
                        .transpose()?,
                },
            })
        }
        "inventory_items" => {
            let names: Vec<String> = sets.iter().map(|(c, _)| c.clone()).collect();
            check_columns(&names, &["reorder_point", "reorder_quantity", "status"])?;
            let status = match lookup("status") {
                Some(e) => {
                    let s = parse_string_expr(e)?;
                    Some(
                        StockStatus::parse(&s)
                            .ok_or_else(|| SqlError::Parse(format!("unknown stock status {s}")))?,
                    )
                }
                None => None,
            };
            Ok(Command::UpdateItem {
                id,
                update: ItemUpdate {
                    reorder_point: lookup("reorder_point").map(parse_i64_expr).transpose()?,
                    reorder_quantity: lookup("reorder_quantity").map(parse_i64_expr).transpose()?,
                    status,
                },
            })
        }
        "reservations" => {
            let [(column, value)] = sets.as_slice() else {
                return Err(SqlError::Unsupported("reservations: only SET status".into()));
            };
            if column != "status" {
                return Err(SqlError::UnknownColumn(column.clone()));
            }
            let target = parse_string_expr(value)?;
            match ReservationStatus::parse(&target) {
                Some(ReservationStatus::Confirmed) => Ok(Command::ConfirmReservation { id }),
                Some(ReservationStatus::Cancelled) => Ok(Command::CancelReservation { id }),
                _ => Err(SqlError::Unsupported(format!(
                    "reservation status can only be set to CONFIRMED or CANCELLED, got {target}"
                ))),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;
    match table.as_str() {
        "reservations" => Ok(Command::CancelReservation { id }),
        _ => Err(SqlError::Unsupported(format!("DELETE FROM {table}"))),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let from = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = table_factor_name(&from.relation)?;

    if table == "availability" {
        let selection = select
            .selection
            .as_ref()
            .ok_or(SqlError::MissingFilter("sku or product_id"))?;
        let mut groups = Vec::new();
        collect_disjuncts(selection, &mut groups);
        let lines = groups
            .into_iter()
            .map(|group| {
                let mut conds = Vec::new();
                collect_equalities(group, &mut conds)?;
                availability_line(&conds)
            })
            .collect::<Result<Vec<_>, SqlError>>()?;
        return Ok(Command::CheckAvailability { lines });
    }

    let mut conds: Vec<(String, &Expr)> = Vec::new();
    if let Some(selection) = &select.selection {
        collect_equalities(selection, &mut conds)?;
    }
    let names: Vec<String> = conds.iter().map(|(c, _)| c.clone()).collect();
    let lookup = |col: &str| conds.iter().find(|(c, _)| c == col).map(|(_, e)| *e);

    match table.as_str() {
        "warehouses" => {
            check_columns(&names, &["id", "code", "is_active"])?;
            let filter = if let Some(e) = lookup("id") {
                WarehouseFilter::Id(parse_ulid_expr(e)?)
            } else if let Some(e) = lookup("code") {
                WarehouseFilter::Code(parse_string_expr(e)?)
            } else if let Some(e) = lookup("is_active") {
                WarehouseFilter::Active(parse_bool(e)?)
            } else {
                WarehouseFilter::All
            };
            Ok(Command::SelectWarehouses { filter })
        }
        "inventory_items" => {
            check_columns(
                &names,
                &[
                    "id",
                    "sku",
                    "product_id",
                    "variant_id",
                    "status",
                    "warehouse_id",
                    "low_stock_only",
                    "page",
                    "page_size",
                ],
            )?;
            if let Some(e) = lookup("id") {
                return Ok(Command::SelectItem {
                    key: ItemKey::Id(parse_ulid_expr(e)?),
                });
            }
            if let Some(e) = lookup("sku") {
                return Ok(Command::SelectItem {
                    key: ItemKey::Sku(parse_string_expr(e)?),
                });
            }
            if let Some(e) = lookup("product_id") {
                return Ok(Command::SelectItem {
                    key: ItemKey::Product {
                        product_id: parse_string_expr(e)?,
                        variant_id: lookup("variant_id")
                            .map(parse_string_or_null)
                            .transpose()?
                            .flatten(),
                    },
                });
            }
            let mut filter = ItemFilter::default();
            if let Some(e) = lookup("status") {
                let s = parse_string_expr(e)?;
                filter.status = Some(
                    StockStatus::parse(&s)
                        .ok_or_else(|| SqlError::Parse(format!("unknown stock status {s}")))?,
                );
            }
            filter.warehouse_id = lookup("warehouse_id").map(parse_ulid_expr).transpose()?;
            filter.low_stock_only = lookup("low_stock_only").map(parse_bool).transpose()?.unwrap_or(false);
            if let Some(e) = lookup("page") {
                filter.page = to_usize(parse_i64_expr(e)?)?;
            }
            if let Some(e) = lookup("page_size") {
                filter.page_size = to_usize(parse_i64_expr(e)?)?;
            }
            Ok(Command::ListItems { filter })
        }
        "inventory_locations" => {
            check_columns(&names, &["inventory_item_id"])?;
            let e = lookup("inventory_item_id").ok_or(SqlError::MissingFilter("inventory_item_id"))?;
            Ok(Command::SelectLocations {
                item_id: parse_ulid_expr(e)?,
            })
        }
        "transactions" => {
            check_columns(&names, &["inventory_item_id"])?;
            let e = lookup("inventory_item_id").ok_or(SqlError::MissingFilter("inventory_item_id"))?;
            Ok(Command::SelectTransactions {
                item_id: parse_ulid_expr(e)?,
            })
        }
        "reservations" => {
            check_columns(&names, &["id", "reference_id"])?;
            if let Some(e) = lookup("id") {
                Ok(Command::SelectReservation {
                    id: parse_ulid_expr(e)?,
                })
            } else if let Some(e) = lookup("reference_id") {
                Ok(Command::SelectReservationsByReference {
                    reference_id: parse_string_expr(e)?,
                })
            } else {
                Err(SqlError::MissingFilter("id or reference_id"))
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn availability_line(conds: &[(String, &Expr)]) -> Result<AvailabilityRequest, SqlError> {
    let names: Vec<String> = conds.iter().map(|(c, _)| c.clone()).collect();
    check_columns(&names, &["sku", "product_id", "variant_id", "quantity"])?;
    let lookup = |col: &str| conds.iter().find(|(c, _)| c == col).map(|(_, e)| *e);

    let sku = lookup("sku").map(parse_string_expr).transpose()?.unwrap_or_default();
    let product_id = lookup("product_id")
        .map(parse_string_expr)
        .transpose()?
        .unwrap_or_default();
    if sku.is_empty() && product_id.is_empty() {
        return Err(SqlError::MissingFilter("sku or product_id"));
    }
    let quantity = lookup("quantity").ok_or(SqlError::MissingFilter("quantity"))?;
    Ok(AvailabilityRequest {
        product_id,
        variant_id: lookup("variant_id").map(parse_string_or_null).transpose()?.flatten(),
        sku,
        quantity: parse_i64_expr(quantity)?,
    })
}

/// Split `a OR b OR c` into its operands.
fn collect_disjuncts<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Or,
            right,
        } => {
            collect_disjuncts(left, out);
            collect_disjuncts(right, out);
        }
        Expr::Nested(inner) if matches!(inner.as_ref(), Expr::BinaryOp { op: ast::BinaryOperator::Or, .. }) => {
            collect_disjuncts(inner, out);
        }
        other => out.push(other),
    }
}

/// Flatten `col = value AND col = value ...`. Anything else is rejected.
fn collect_equalities<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_equalities(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_equalities(left, out)?;
            collect_equalities(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push((column, right));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE clause {other}"))),
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
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    let first = tables
        .first()
        .ok_or_else(|| SqlError::Parse("DELETE without table".into()))?;
    table_factor_name(&first.relation)
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(values.rows.clone()),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    let mut conds = Vec::new();
    collect_equalities(sel, &mut conds)?;
    match conds.as_slice() {
        [(column, value)] if column == "id" => parse_ulid_expr(value),
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) if s.is_empty() => Ok(None),
        _ => parse_ulid_expr(expr).map(Some),
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(n, _)) => Ok(n.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string_expr(expr).map(Some),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr: inner,
    } = expr
    {
        return Ok(-parse_i64_expr(inner)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
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
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn to_i32(v: i64) -> Result<i32, SqlError> {
    i32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of i32 range")))
}

fn to_usize(v: i64) -> Result<usize, SqlError> {
    usize::try_from(v).map_err(|_| SqlError::Parse(format!("{v} must not be negative")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    MissingColumn(&'static str),
    WrongArity(usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::MissingColumn(c) => write!(f, "missing column: {c}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values per row, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const W1: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";
    const W2: &str = "01BX5ZZKBKACTAV9WEVGEMMVS0";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn insert_warehouse_with_address() {
        let sql = format!(
            "INSERT INTO warehouses (id, name, code, priority, city, country) \
             VALUES ('{ID}', 'Main', 'MAIN', 10, 'Oslo', 'NO')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertWarehouse { id, warehouse } => {
                assert_eq!(id, ulid(ID));
                assert_eq!(warehouse.code, "MAIN");
                assert_eq!(warehouse.priority, 10);
                assert!(warehouse.is_active);
                assert_eq!(warehouse.address.city.as_deref(), Some("Oslo"));
                assert_eq!(warehouse.address.line1, None);
            }
            other => panic!("expected InsertWarehouse, got {other:?}"),
        }
    }

    #[test]
    fn insert_item_parses_allocations() {
        let sql = format!(
            "INSERT INTO inventory_items (id, product_id, variant_id, sku, initial_quantity, reorder_point, allocations) \
             VALUES ('{ID}', 'prod-1', NULL, 'SKU-1', 25, 5, '{W1}:20, {W2}:5')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertItem { id, item } => {
                assert_eq!(id, ulid(ID));
                assert_eq!(item.variant_id, None);
                assert_eq!(item.initial_quantity, 25);
                assert_eq!(item.reorder_quantity, 0);
                assert_eq!(item.warehouse_allocations, vec![(ulid(W1), 20), (ulid(W2), 5)]);
            }
            other => panic!("expected InsertItem, got {other:?}"),
        }
    }

    #[test]
    fn insert_requires_column_list() {
        let sql = format!("INSERT INTO warehouses VALUES ('{ID}', 'Main', 'MAIN')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn insert_rejects_unknown_column() {
        let sql = format!("INSERT INTO warehouses (id, name, code, colour) VALUES ('{ID}', 'a', 'b', 'red')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn(c)) if c == "colour"));
    }

    #[test]
    fn multi_row_reservation() {
        let sql = format!(
            "INSERT INTO reservations (id, inventory_item_id, quantity, warehouse_id, reference_id, reference_type, reservation_minutes) VALUES \
             ('{ID}', '{W1}', 3, NULL, 'order-7', 'order', 30), \
             ('{ID}', '{W2}', 1, '{W1}', 'order-7', 'order', 30)"
        );
        match parse_sql(&sql).unwrap() {
            Command::Reserve { request } => {
                assert_eq!(request.id, ulid(ID));
                assert_eq!(request.reference_id, "order-7");
                assert_eq!(request.reservation_minutes, 30);
                assert_eq!(request.items.len(), 2);
                assert_eq!(request.items[0].warehouse_id, None);
                assert_eq!(request.items[1].warehouse_id, Some(ulid(W1)));
            }
            other => panic!("expected Reserve, got {other:?}"),
        }
    }

    #[test]
    fn reservation_rows_must_share_header() {
        let sql = format!(
            "INSERT INTO reservations (id, inventory_item_id, quantity, reference_id) VALUES \
             ('{ID}', '{W1}', 3, 'order-7'), ('{ID}', '{W2}', 1, 'order-8')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn reservation_status_updates() {
        let confirm = format!("UPDATE reservations SET status = 'CONFIRMED' WHERE id = '{ID}'");
        assert_eq!(parse_sql(&confirm).unwrap(), Command::ConfirmReservation { id: ulid(ID) });

        let cancel = format!("UPDATE reservations SET status = 'cancelled' WHERE id = '{ID}'");
        assert_eq!(parse_sql(&cancel).unwrap(), Command::CancelReservation { id: ulid(ID) });

        let delete = format!("DELETE FROM reservations WHERE id = '{ID}'");
        assert_eq!(parse_sql(&delete).unwrap(), Command::CancelReservation { id: ulid(ID) });

        let expire = format!("UPDATE reservations SET status = 'EXPIRED' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&expire), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn update_warehouse_partial() {
        let sql = format!("UPDATE warehouses SET is_active = false, priority = 3 WHERE id = '{ID}'");
        match parse_sql(&sql).unwrap() {
            Command::UpdateWarehouse { id, update } => {
                assert_eq!(id, ulid(ID));
                assert_eq!(update.is_active, Some(false));
                assert_eq!(update.priority, Some(3));
                assert_eq!(update.name, None);
                assert_eq!(update.address, None);
            }
            other => panic!("expected UpdateWarehouse, got {other:?}"),
        }
    }

    #[test]
    fn update_item_status_override() {
        let sql = format!("UPDATE inventory_items SET reorder_point = 7, status = 'LOW_STOCK' WHERE id = '{ID}'");
        match parse_sql(&sql).unwrap() {
            Command::UpdateItem { update, .. } => {
                assert_eq!(update.reorder_point, Some(7));
                assert_eq!(update.reorder_quantity, None);
                assert_eq!(update.status, Some(StockStatus::LowStock));
            }
            other => panic!("expected UpdateItem, got {other:?}"),
        }
    }

    #[test]
    fn select_item_by_each_key() {
        assert_eq!(
            parse_sql("SELECT * FROM inventory_items WHERE sku = 'SKU-1'").unwrap(),
            Command::SelectItem { key: ItemKey::Sku("SKU-1".into()) }
        );
        assert_eq!(
            parse_sql("SELECT * FROM inventory_items WHERE product_id = 'p' AND variant_id = 'red'").unwrap(),
            Command::SelectItem {
                key: ItemKey::Product {
                    product_id: "p".into(),
                    variant_id: Some("red".into())
                }
            }
        );
    }

    #[test]
    fn list_items_with_filters() {
        let sql = format!(
            "SELECT * FROM inventory_items WHERE status = 'LOW_STOCK' AND warehouse_id = '{W1}' \
             AND low_stock_only = true AND page = 2 AND page_size = 50"
        );
        match parse_sql(&sql).unwrap() {
            Command::ListItems { filter } => {
                assert_eq!(filter.status, Some(StockStatus::LowStock));
                assert_eq!(filter.warehouse_id, Some(ulid(W1)));
                assert!(filter.low_stock_only);
                assert_eq!(filter.page, 2);
                assert_eq!(filter.page_size, 50);
            }
            other => panic!("expected ListItems, got {other:?}"),
        }
        assert_eq!(
            parse_sql("SELECT * FROM inventory_items").unwrap(),
            Command::ListItems { filter: ItemFilter::default() }
        );
    }

    #[test]
    fn availability_groups() {
        let sql = "SELECT * FROM availability WHERE (sku = 'A' AND quantity = 2) \
                   OR (product_id = 'p' AND variant_id = 'v' AND quantity = 5) \
                   OR (sku = 'C' AND quantity = 1)";
        match parse_sql(sql).unwrap() {
            Command::CheckAvailability { lines } => {
                assert_eq!(lines.len(), 3);
                assert_eq!(lines[0].sku, "A");
                assert_eq!(lines[1].product_id, "p");
                assert_eq!(lines[1].variant_id.as_deref(), Some("v"));
                assert_eq!(lines[1].quantity, 5);
                assert_eq!(lines[2].quantity, 1);
            }
            other => panic!("expected CheckAvailability, got {other:?}"),
        }
    }

    #[test]
    fn availability_needs_quantity() {
        let sql = "SELECT * FROM availability WHERE sku = 'A'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("quantity"))));
    }

    #[test]
    fn bulk_adjustments() {
        let sql = "INSERT INTO adjustments (sku, quantity_delta, notes) VALUES ('A', 5, 'restock'), ('B', -2, NULL)";
        match parse_sql(sql).unwrap() {
            Command::BulkUpdate { lines } => {
                assert_eq!(lines.len(), 2);
                assert_eq!(lines[0].quantity_delta, 5);
                assert_eq!(lines[0].notes.as_deref(), Some("restock"));
                assert_eq!(lines[1].quantity_delta, -2);
                assert_eq!(lines[1].warehouse_id, None);
            }
            other => panic!("expected BulkUpdate, got {other:?}"),
        }
    }

    #[test]
    fn select_reservations_and_ledger() {
        assert_eq!(
            parse_sql("SELECT * FROM reservations WHERE reference_id = 'order-7'").unwrap(),
            Command::SelectReservationsByReference { reference_id: "order-7".into() }
        );
        let sql = format!("SELECT * FROM transactions WHERE inventory_item_id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::SelectTransactions { item_id: ulid(ID) });
        let sql = format!("SELECT * FROM inventory_locations WHERE inventory_item_id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::SelectLocations { item_id: ulid(ID) });
    }

    #[test]
    fn select_warehouses_filters() {
        assert_eq!(
            parse_sql("SELECT * FROM warehouses").unwrap(),
            Command::SelectWarehouses { filter: WarehouseFilter::All }
        );
        assert_eq!(
            parse_sql("SELECT * FROM warehouses WHERE code = 'MAIN'").unwrap(),
            Command::SelectWarehouses { filter: WarehouseFilter::Code("MAIN".into()) }
        );
        assert_eq!(
            parse_sql("SELECT * FROM warehouses WHERE is_active = true").unwrap(),
            Command::SelectWarehouses { filter: WarehouseFilter::Active(true) }
        );
    }

    #[test]
    fn unknown_table_errors() {
        let sql = format!("INSERT INTO orders (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
