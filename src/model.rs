use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

// ── Enumerations ─────────────────────────────────────────────────

/// Display status of an item, derived from its available quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StockStatus {
    InStock,
    LowStock,
    OutOfStock,
}

impl StockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StockStatus::InStock => "IN_STOCK",
            StockStatus::LowStock => "LOW_STOCK",
            StockStatus::OutOfStock => "OUT_OF_STOCK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "IN_STOCK" => Some(StockStatus::InStock),
            "LOW_STOCK" => Some(StockStatus::LowStock),
            "OUT_OF_STOCK" => Some(StockStatus::OutOfStock),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Expired,
}

impl ReservationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "PENDING",
            ReservationStatus::Confirmed => "CONFIRMED",
            ReservationStatus::Cancelled => "CANCELLED",
            ReservationStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(ReservationStatus::Pending),
            "CONFIRMED" => Some(ReservationStatus::Confirmed),
            "CANCELLED" => Some(ReservationStatus::Cancelled),
            "EXPIRED" => Some(ReservationStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    /// Stock arriving into a warehouse. Positive quantity.
    Receive,
    /// Available moved to reserved.
    Reserve,
    /// Reserved stock leaving inventory.
    Confirm,
    /// Reserved moved back to available.
    Release,
    /// Signed manual correction of on-hand stock.
    Adjust,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Receive => "RECEIVE",
            TransactionType::Reserve => "RESERVE",
            TransactionType::Confirm => "CONFIRM",
            TransactionType::Release => "RELEASE",
            TransactionType::Adjust => "ADJUST",
        }
    }
}

// ── Entities ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub line1: Option<String>,
    pub line2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warehouse {
    pub id: Ulid,
    pub name: String,
    pub code: String,
    pub address: Address,
    pub is_active: bool,
    /// Higher priority warehouses are drawn from first.
    pub priority: i32,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// The part of a warehouse the allocator cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarehouseView {
    pub is_active: bool,
    pub priority: i32,
}

/// Per-(item, warehouse) split of an item's stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryLocation {
    pub warehouse_id: Ulid,
    pub quantity: i64,
    pub available_quantity: i64,
    pub reserved_quantity: i64,
}

impl InventoryLocation {
    pub fn empty(warehouse_id: Ulid) -> Self {
        Self {
            warehouse_id,
            quantity: 0,
            available_quantity: 0,
            reserved_quantity: 0,
        }
    }
}

/// Append-only ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Ulid,
    pub inventory_item_id: Ulid,
    pub transaction_type: TransactionType,
    /// Signed for `Adjust`, positive for every other type.
    pub quantity: i64,
    pub warehouse_id: Ulid,
    pub reference_id: Option<String>,
    pub reference_type: Option<String>,
    pub notes: Option<String>,
    pub created_by: String,
    pub created_at: Ms,
}

/// One contributing (item, warehouse) slice of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationLine {
    pub inventory_item_id: Ulid,
    pub warehouse_id: Ulid,
    pub quantity: i64,
}

/// A reservation header plus the allocation lines it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub reference_id: String,
    pub reference_type: String,
    pub status: ReservationStatus,
    pub expiration_time: Ms,
    pub lines: Vec<ReservationLine>,
    pub created_at: Ms,
    pub updated_at: Ms,
    /// Sweeper claim. Not persisted meaningfully: cleared on replay.
    pub claimed_by: Option<String>,
    pub claimed_at: Option<Ms>,
}

impl Reservation {
    pub fn quantity(&self) -> i64 {
        self.lines.iter().map(|l| l.quantity).sum()
    }

    /// Distinct item ids in sorted order; this is the lock order for this reservation.
    pub fn item_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.lines.iter().map(|l| l.inventory_item_id).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn is_expired_at(&self, now: Ms) -> bool {
        self.expiration_time <= now
    }
}

/// Full state of one inventory item. Guarded by the item's lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemState {
    pub id: Ulid,
    pub product_id: String,
    pub variant_id: Option<String>,
    pub sku: String,
    pub total_quantity: i64,
    pub available_quantity: i64,
    pub reserved_quantity: i64,
    pub reorder_point: i64,
    pub reorder_quantity: i64,
    pub status: StockStatus,
    /// Incremented once per committed change.
    pub version: u64,
    /// Last quantity change.
    pub last_updated: Ms,
    pub created_at: Ms,
    pub updated_at: Ms,
    /// Sorted by warehouse id.
    pub locations: Vec<InventoryLocation>,
    pub ledger: Vec<Transaction>,
}

impl ItemState {
    pub fn new(
        id: Ulid,
        product_id: String,
        variant_id: Option<String>,
        sku: String,
        reorder_point: i64,
        reorder_quantity: i64,
        now: Ms,
    ) -> Self {
        Self {
            id,
            product_id,
            variant_id,
            sku,
            total_quantity: 0,
            available_quantity: 0,
            reserved_quantity: 0,
            reorder_point,
            reorder_quantity,
            status: crate::engine::classify(0, reorder_point),
            version: 0,
            last_updated: now,
            created_at: now,
            updated_at: now,
            locations: Vec::new(),
            ledger: Vec::new(),
        }
    }

    pub fn location(&self, warehouse_id: &Ulid) -> Option<&InventoryLocation> {
        self.locations
            .binary_search_by_key(warehouse_id, |l| l.warehouse_id)
            .ok()
            .map(|pos| &self.locations[pos])
    }

    /// Location row for a warehouse, inserting a zero row if absent.
    fn location_mut(&mut self, warehouse_id: Ulid) -> &mut InventoryLocation {
        let pos = match self
            .locations
            .binary_search_by_key(&warehouse_id, |l| l.warehouse_id)
        {
            Ok(pos) => pos,
            Err(pos) => {
                self.locations.insert(pos, InventoryLocation::empty(warehouse_id));
                pos
            }
        };
        &mut self.locations[pos]
    }

    /// Apply one ledger row to the location it names and append it to the ledger.
    /// Item totals are not refreshed; call `touch` once the whole change is applied.
    pub fn apply_transaction(&mut self, tx: &Transaction) {
        let loc = self.location_mut(tx.warehouse_id);
        let q = tx.quantity;
        match tx.transaction_type {
            TransactionType::Receive | TransactionType::Adjust => {
                loc.quantity += q;
                loc.available_quantity += q;
            }
            TransactionType::Reserve => {
                loc.available_quantity -= q;
                loc.reserved_quantity += q;
            }
            TransactionType::Confirm => {
                loc.reserved_quantity -= q;
                loc.quantity -= q;
            }
            TransactionType::Release => {
                loc.reserved_quantity -= q;
                loc.available_quantity += q;
            }
        }
        self.ledger.push(tx.clone());
    }

    /// Recompute totals from locations, re-derive status and bump the version.
    pub fn touch(&mut self, at: Ms, quantities_changed: bool) {
        self.total_quantity = self.locations.iter().map(|l| l.quantity).sum();
        self.available_quantity = self.locations.iter().map(|l| l.available_quantity).sum();
        self.reserved_quantity = self.locations.iter().map(|l| l.reserved_quantity).sum();
        self.status = crate::engine::classify(self.available_quantity, self.reorder_point);
        self.version += 1;
        self.updated_at = at;
        if quantities_changed {
            self.last_updated = at;
        }
        debug_assert!(self.check_invariants().is_ok(), "{:?}", self.check_invariants());
    }

    pub fn is_low_stock(&self) -> bool {
        self.available_quantity <= self.reorder_point
    }

    /// Verify the quantity decomposition at item and location level.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.total_quantity != self.available_quantity + self.reserved_quantity {
            return Err(format!(
                "item {}: total {} != available {} + reserved {}",
                self.id, self.total_quantity, self.available_quantity, self.reserved_quantity
            ));
        }
        if self.available_quantity < 0 || self.reserved_quantity < 0 {
            return Err(format!("item {}: negative quantity", self.id));
        }
        let (mut q, mut a, mut r) = (0, 0, 0);
        for loc in &self.locations {
            if loc.quantity != loc.available_quantity + loc.reserved_quantity
                || loc.available_quantity < 0
                || loc.reserved_quantity < 0
            {
                return Err(format!(
                    "item {} location {}: bad split {:?}",
                    self.id, loc.warehouse_id, loc
                ));
            }
            q += loc.quantity;
            a += loc.available_quantity;
            r += loc.reserved_quantity;
        }
        if (q, a, r) != (self.total_quantity, self.available_quantity, self.reserved_quantity) {
            return Err(format!("item {}: locations do not sum to item totals", self.id));
        }
        Ok(())
    }

    pub fn info(&self) -> ItemInfo {
        ItemInfo {
            id: self.id,
            product_id: self.product_id.clone(),
            variant_id: self.variant_id.clone(),
            sku: self.sku.clone(),
            total_quantity: self.total_quantity,
            available_quantity: self.available_quantity,
            reserved_quantity: self.reserved_quantity,
            reorder_point: self.reorder_point,
            reorder_quantity: self.reorder_quantity,
            status: self.status,
            version: self.version,
            last_updated: self.last_updated,
            created_at: self.created_at,
            updated_at: self.updated_at,
            locations: self.locations.clone(),
        }
    }
}

/// The WAL record format. Each record is one atomic unit of change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    WarehouseCreated(Warehouse),
    WarehouseUpdated(Warehouse),
    ItemCreated {
        item: ItemState,
        receipts: Vec<Transaction>,
    },
    ItemUpdated {
        id: Ulid,
        reorder_point: i64,
        reorder_quantity: i64,
        status: Option<StockStatus>,
        at: Ms,
    },
    /// One bulk adjustment line; several rows when a withdrawal spans
    /// warehouses.
    StockAdjusted {
        transactions: Vec<Transaction>,
    },
    ReservationPlaced {
        reservation: Reservation,
        transactions: Vec<Transaction>,
    },
    ReservationResolved {
        id: Ulid,
        status: ReservationStatus,
        at: Ms,
        transactions: Vec<Transaction>,
    },
    /// Compaction snapshot of an item, ledger included.
    ItemRestored(ItemState),
    /// Compaction snapshot of a reservation.
    ReservationRestored(Reservation),
}

impl Event {
    /// Items whose lock must be held to apply this event, sorted.
    pub fn touched_items(&self) -> Vec<Ulid> {
        let mut ids = match self {
            Event::WarehouseCreated(_) | Event::WarehouseUpdated(_) => Vec::new(),
            Event::ItemCreated { item, .. } | Event::ItemRestored(item) => vec![item.id],
            Event::ItemUpdated { id, .. } => vec![*id],
            Event::StockAdjusted { transactions }
            | Event::ReservationPlaced { transactions, .. }
            | Event::ReservationResolved { transactions, .. } => {
                transactions.iter().map(|t| t.inventory_item_id).collect()
            }
            Event::ReservationRestored(r) => r.item_ids(),
        };
        ids.sort();
        ids.dedup();
        ids
    }
}

// ── Requests ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWarehouse {
    pub name: String,
    pub code: String,
    pub address: Address,
    pub is_active: bool,
    pub priority: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarehouseUpdate {
    pub name: Option<String>,
    pub address: Option<Address>,
    pub is_active: Option<bool>,
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewItem {
    pub product_id: String,
    pub variant_id: Option<String>,
    pub sku: String,
    pub initial_quantity: i64,
    pub reorder_point: i64,
    pub reorder_quantity: i64,
    /// `(warehouse_id, quantity)`; must sum to `initial_quantity` when non-empty.
    pub warehouse_allocations: Vec<(Ulid, i64)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemUpdate {
    pub reorder_point: Option<i64>,
    pub reorder_quantity: Option<i64>,
    pub status: Option<StockStatus>,
}

/// How to find an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemKey {
    Id(Ulid),
    Sku(String),
    Product {
        product_id: String,
        variant_id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFilter {
    /// 1-based.
    pub page: usize,
    pub page_size: usize,
    pub status: Option<StockStatus>,
    pub warehouse_id: Option<Ulid>,
    pub low_stock_only: bool,
}

impl Default for ItemFilter {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: crate::limits::DEFAULT_PAGE_SIZE,
            status: None,
            warehouse_id: None,
            low_stock_only: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveLine {
    pub inventory_item_id: Ulid,
    pub quantity: i64,
    pub warehouse_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveRequest {
    /// Caller-supplied; a retry with the same id is rejected as a duplicate.
    pub id: Ulid,
    pub items: Vec<ReserveLine>,
    pub reference_id: String,
    pub reference_type: String,
    /// 0 means the configured default.
    pub reservation_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityRequest {
    pub product_id: String,
    pub variant_id: Option<String>,
    pub sku: String,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkLine {
    pub sku: String,
    pub quantity_delta: i64,
    pub warehouse_id: Option<Ulid>,
    pub reference_id: Option<String>,
    pub reference_type: Option<String>,
    pub notes: Option<String>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemInfo {
    pub id: Ulid,
    pub product_id: String,
    pub variant_id: Option<String>,
    pub sku: String,
    pub total_quantity: i64,
    pub available_quantity: i64,
    pub reserved_quantity: i64,
    pub reorder_point: i64,
    pub reorder_quantity: i64,
    pub status: StockStatus,
    pub version: u64,
    pub last_updated: Ms,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub locations: Vec<InventoryLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemAvailability {
    pub product_id: String,
    pub variant_id: Option<String>,
    pub sku: String,
    pub requested_quantity: i64,
    pub available_quantity: i64,
    pub is_available: bool,
    /// Item status string, or `NOT_FOUND`.
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityReport {
    pub items: Vec<ItemAvailability>,
    pub all_available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkUpdateResult {
    pub sku: String,
    pub success: bool,
    pub message: String,
    pub updated_item: Option<ItemInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkUpdateResponse {
    pub results: Vec<BulkUpdateResult>,
    pub success_count: usize,
    pub failure_count: usize,
}
