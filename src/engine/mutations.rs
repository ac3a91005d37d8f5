use std::collections::HashMap;

use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::allocation::{allocate, deduct, spread_withdrawal};
use super::{Engine, EngineError, WalCommand, now_ms};

fn check_len(value: &str, max: usize, msg: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(msg));
    }
    Ok(())
}

fn check_quantity(q: i64, what: &str) -> Result<(), EngineError> {
    if q < 0 {
        return Err(EngineError::InvalidQuantity(format!("{what} must not be negative")));
    }
    if q > MAX_QUANTITY {
        return Err(EngineError::InvalidQuantity(format!("{what} exceeds {MAX_QUANTITY}")));
    }
    Ok(())
}

fn check_address(address: &Address) -> Result<(), EngineError> {
    for part in [
        &address.line1,
        &address.line2,
        &address.city,
        &address.state,
        &address.postal_code,
        &address.country,
    ]
    .into_iter()
    .flatten()
    {
        check_len(part, MAX_NAME_LEN, "address field too long")?;
    }
    Ok(())
}

impl Engine {
    // ── Warehouses ───────────────────────────────────────────

    pub async fn create_warehouse(&self, id: Ulid, new: NewWarehouse) -> Result<Warehouse, EngineError> {
        if new.name.trim().is_empty() {
            return Err(EngineError::InvalidInput("warehouse name is required".into()));
        }
        if new.code.trim().is_empty() {
            return Err(EngineError::InvalidInput("warehouse code is required".into()));
        }
        check_len(&new.name, MAX_NAME_LEN, "warehouse name too long")?;
        check_len(&new.code, MAX_CODE_LEN, "warehouse code too long")?;
        check_address(&new.address)?;

        let _admin = self.admin.lock().await;
        if self.store.warehouse_count() >= MAX_WAREHOUSES {
            return Err(EngineError::LimitExceeded("too many warehouses"));
        }
        if self.store.get_warehouse(&id).is_some() {
            return Err(EngineError::AlreadyExists(format!("warehouse {id}")));
        }
        if !self.store.claim_code(&new.code, id) {
            return Err(EngineError::AlreadyExists(format!("warehouse code {}", new.code)));
        }

        let now = now_ms();
        let warehouse = Warehouse {
            id,
            name: new.name,
            code: new.code,
            address: new.address,
            is_active: new.is_active,
            priority: new.priority,
            created_at: now,
            updated_at: now,
        };
        let mut locks = self.lock_items(&[]).await?;
        if let Err(e) = self.commit(&mut locks, Event::WarehouseCreated(warehouse.clone())).await {
            self.store.release_code(&warehouse.code, id);
            return Err(e);
        }
        tracing::info!("created warehouse {} ({})", warehouse.code, id);
        Ok(warehouse)
    }

    pub async fn update_warehouse(&self, id: Ulid, update: WarehouseUpdate) -> Result<Warehouse, EngineError> {
        if let Some(ref name) = update.name {
            if name.trim().is_empty() {
                return Err(EngineError::InvalidInput("warehouse name is required".into()));
            }
            check_len(name, MAX_NAME_LEN, "warehouse name too long")?;
        }
        if let Some(ref address) = update.address {
            check_address(address)?;
        }

        let _admin = self.admin.lock().await;
        let mut warehouse = self
            .store
            .get_warehouse(&id)
            .ok_or(EngineError::WarehouseNotFound(id))?;
        if let Some(name) = update.name {
            warehouse.name = name;
        }
        if let Some(address) = update.address {
            warehouse.address = address;
        }
        if let Some(is_active) = update.is_active {
            warehouse.is_active = is_active;
        }
        if let Some(priority) = update.priority {
            warehouse.priority = priority;
        }
        warehouse.updated_at = now_ms();

        let mut locks = self.lock_items(&[]).await?;
        self.commit(&mut locks, Event::WarehouseUpdated(warehouse.clone()))
            .await?;
        Ok(warehouse)
    }

    // ── Items ────────────────────────────────────────────────

    pub async fn create_item(&self, id: Ulid, new: NewItem, created_by: &str) -> Result<ItemInfo, EngineError> {
        if new.product_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("product_id is required".into()));
        }
        if new.sku.trim().is_empty() {
            return Err(EngineError::InvalidInput("sku is required".into()));
        }
        check_len(&new.product_id, MAX_ID_LEN, "product_id too long")?;
        check_len(&new.sku, MAX_SKU_LEN, "sku too long")?;
        if let Some(ref v) = new.variant_id {
            check_len(v, MAX_ID_LEN, "variant_id too long")?;
        }
        check_quantity(new.initial_quantity, "initial_quantity")?;
        check_quantity(new.reorder_point, "reorder_point")?;
        check_quantity(new.reorder_quantity, "reorder_quantity")?;

        let allocations = self.resolve_initial_allocations(&new)?;

        if self.store.item_count() >= MAX_ITEMS {
            return Err(EngineError::LimitExceeded("too many inventory items"));
        }
        if !self.store.claim_item_id(id) {
            return Err(EngineError::AlreadyExists(format!("inventory item {id}")));
        }
        let result = self.insert_new_item(id, new, allocations, created_by).await;
        self.store.release_item_id(&id);
        result
    }

    /// Runs while the caller holds the id claim, so no other create can
    /// commit the same id.
    async fn insert_new_item(
        &self,
        id: Ulid,
        new: NewItem,
        allocations: Vec<(Ulid, i64)>,
        created_by: &str,
    ) -> Result<ItemInfo, EngineError> {
        if !self.store.claim_sku(&new.sku, id) {
            return Err(EngineError::AlreadyExists(format!("sku {}", new.sku)));
        }
        let variant = new.variant_id.as_deref();
        if !self.store.claim_product(&new.product_id, variant, id) {
            self.store.release_sku(&new.sku, id);
            return Err(EngineError::AlreadyExists(format!(
                "product {} variant {}",
                new.product_id,
                variant.unwrap_or("-")
            )));
        }

        let now = now_ms();
        let receipts: Vec<Transaction> = allocations
            .iter()
            .map(|(warehouse_id, quantity)| Transaction {
                id: Ulid::new(),
                inventory_item_id: id,
                transaction_type: TransactionType::Receive,
                quantity: *quantity,
                warehouse_id: *warehouse_id,
                reference_id: None,
                reference_type: None,
                notes: Some("initial stock".into()),
                created_by: created_by.to_string(),
                created_at: now,
            })
            .collect();
        let item = ItemState::new(
            id,
            new.product_id.clone(),
            new.variant_id.clone(),
            new.sku.clone(),
            new.reorder_point,
            new.reorder_quantity,
            now,
        );

        let committed = match self.lock_items(&[]).await {
            Ok(mut locks) => self.commit(&mut locks, Event::ItemCreated { item, receipts }).await,
            Err(e) => Err(e),
        };
        if let Err(e) = committed {
            self.store.release_sku(&new.sku, id);
            self.store.release_product(&new.product_id, variant, id);
            return Err(e);
        }

        let shared = self
            .store
            .get_item(&id)
            .ok_or_else(|| EngineError::Internal(format!("item {id} missing after create")))?;
        let info = shared.read().await.info();
        tracing::debug!("created item {} sku={} total={}", id, info.sku, info.total_quantity);
        Ok(info)
    }

    /// Explicit allocations must be valid and sum to the initial quantity.
    /// Without them, stock lands in the highest-priority active warehouse.
    fn resolve_initial_allocations(&self, new: &NewItem) -> Result<Vec<(Ulid, i64)>, EngineError> {
        if new.warehouse_allocations.is_empty() {
            if new.initial_quantity == 0 {
                return Ok(Vec::new());
            }
            let wid = self.store.default_warehouse().ok_or_else(|| {
                EngineError::InvalidInput("no active warehouse to receive initial stock".into())
            })?;
            return Ok(vec![(wid, new.initial_quantity)]);
        }

        if new.warehouse_allocations.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("too many warehouse allocations"));
        }
        let mut seen = Vec::with_capacity(new.warehouse_allocations.len());
        let mut sum: i64 = 0;
        for (wid, q) in &new.warehouse_allocations {
            if self.store.get_warehouse(wid).is_none() {
                return Err(EngineError::WarehouseNotFound(*wid));
            }
            if *q <= 0 {
                return Err(EngineError::InvalidQuantity(format!(
                    "allocation for warehouse {wid} must be positive"
                )));
            }
            if seen.contains(wid) {
                return Err(EngineError::InvalidInput(format!("warehouse {wid} allocated twice")));
            }
            seen.push(*wid);
            sum = sum.saturating_add(*q);
        }
        if sum != new.initial_quantity {
            return Err(EngineError::InvalidInput(format!(
                "allocations sum to {sum}, initial_quantity is {}",
                new.initial_quantity
            )));
        }
        Ok(new.warehouse_allocations.clone())
    }

    pub async fn update_item(&self, id: Ulid, update: ItemUpdate) -> Result<ItemInfo, EngineError> {
        if let Some(rp) = update.reorder_point {
            check_quantity(rp, "reorder_point")?;
        }
        if let Some(rq) = update.reorder_quantity {
            check_quantity(rq, "reorder_quantity")?;
        }

        let mut locks = self.lock_items(&[id]).await?;
        let current = locks
            .get(&id)
            .ok_or_else(|| EngineError::ItemNotFound(id.to_string()))?;
        let event = Event::ItemUpdated {
            id,
            reorder_point: update.reorder_point.unwrap_or(current.reorder_point),
            reorder_quantity: update.reorder_quantity.unwrap_or(current.reorder_quantity),
            status: update.status,
            at: now_ms(),
        };
        self.commit(&mut locks, event).await?;
        locks
            .get(&id)
            .map(ItemState::info)
            .ok_or_else(|| EngineError::ItemNotFound(id.to_string()))
    }

    // ── Reservations ─────────────────────────────────────────

    /// Reserve every line or nothing. The reservation id is caller-supplied so
    /// a retried call is recognised as a duplicate.
    pub async fn reserve_inventory(&self, req: ReserveRequest, created_by: &str) -> Result<Reservation, EngineError> {
        self.reserve_at(req, created_by, now_ms()).await
    }

    pub(crate) async fn reserve_at(
        &self,
        req: ReserveRequest,
        created_by: &str,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        if req.items.is_empty() {
            return Err(EngineError::InvalidInput("reservation has no items".into()));
        }
        if req.items.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("too many reservation lines"));
        }
        for line in &req.items {
            if line.quantity <= 0 {
                return Err(EngineError::InvalidQuantity(format!(
                    "quantity for item {} must be positive",
                    line.inventory_item_id
                )));
            }
            check_quantity(line.quantity, "quantity")?;
        }
        if req.reference_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("reference_id is required".into()));
        }
        check_len(&req.reference_id, MAX_REFERENCE_LEN, "reference_id too long")?;
        check_len(&req.reference_type, MAX_REFERENCE_LEN, "reference_type too long")?;
        let minutes = match req.reservation_minutes {
            0 => self.config.default_reservation_minutes,
            m if !(1..=MAX_RESERVATION_MINUTES).contains(&m) => {
                return Err(EngineError::InvalidInput(format!(
                    "reservation_minutes must be between 1 and {MAX_RESERVATION_MINUTES}"
                )));
            }
            m => m,
        };

        if !self.store.claim_reservation_id(req.id) {
            metrics::counter!(observability::RESERVATIONS_TOTAL, "outcome" => "duplicate").increment(1);
            return Err(EngineError::AlreadyExists(format!("reservation {}", req.id)));
        }
        let result = self.place_reservation(&req, minutes, created_by, now).await;
        self.store.release_reservation_id(&req.id);

        let outcome = match &result {
            Ok(_) => "placed",
            Err(e) => e.kind().code(),
        };
        metrics::counter!(observability::RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn place_reservation(
        &self,
        req: &ReserveRequest,
        minutes: i64,
        created_by: &str,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        let mut item_ids: Vec<Ulid> = req.items.iter().map(|l| l.inventory_item_id).collect();
        item_ids.sort();
        item_ids.dedup();
        let mut locks = self.lock_items(&item_ids).await?;

        let warehouses = self.store.warehouse_views();
        let mut scratch: HashMap<Ulid, Vec<InventoryLocation>> = HashMap::new();
        for id in &item_ids {
            if let Some(item) = locks.get(id) {
                scratch.insert(*id, item.locations.clone());
            }
        }

        let mut lines: Vec<ReservationLine> = Vec::new();
        for line in &req.items {
            let item_id = line.inventory_item_id;
            let locations = scratch
                .get_mut(&item_id)
                .ok_or_else(|| EngineError::ItemNotFound(item_id.to_string()))?;
            let picks = allocate(item_id, locations, &warehouses, line.quantity, line.warehouse_id)?;
            deduct(locations, &picks);
            for (warehouse_id, quantity) in picks {
                match lines
                    .iter_mut()
                    .find(|l| l.inventory_item_id == item_id && l.warehouse_id == warehouse_id)
                {
                    Some(existing) => existing.quantity += quantity,
                    None => lines.push(ReservationLine {
                        inventory_item_id: item_id,
                        warehouse_id,
                        quantity,
                    }),
                }
            }
        }

        let transactions = lines
            .iter()
            .map(|l| Transaction {
                id: Ulid::new(),
                inventory_item_id: l.inventory_item_id,
                transaction_type: TransactionType::Reserve,
                quantity: l.quantity,
                warehouse_id: l.warehouse_id,
                reference_id: Some(req.reference_id.clone()),
                reference_type: Some(req.reference_type.clone()),
                notes: None,
                created_by: created_by.to_string(),
                created_at: now,
            })
            .collect();
        let reservation = Reservation {
            id: req.id,
            reference_id: req.reference_id.clone(),
            reference_type: req.reference_type.clone(),
            status: ReservationStatus::Pending,
            expiration_time: now + minutes * MINUTE_MS,
            lines,
            created_at: now,
            updated_at: now,
            claimed_by: None,
            claimed_at: None,
        };

        self.commit(
            &mut locks,
            Event::ReservationPlaced {
                reservation: reservation.clone(),
                transactions,
            },
        )
        .await?;
        tracing::debug!(
            "reserved {} units for {} ({} lines)",
            reservation.quantity(),
            reservation.reference_id,
            reservation.lines.len()
        );
        Ok(reservation)
    }

    pub async fn confirm_reservation(&self, id: Ulid, created_by: &str) -> Result<Reservation, EngineError> {
        self.resolve(id, ReservationStatus::Confirmed, created_by, None)
            .await
    }

    pub async fn cancel_reservation(&self, id: Ulid, created_by: &str) -> Result<Reservation, EngineError> {
        self.resolve(id, ReservationStatus::Cancelled, created_by, None)
            .await
    }

    /// Release an overdue reservation. Only valid once `expiration_time <= now`.
    pub async fn expire_reservation(&self, id: Ulid, worker: &str, now: Ms) -> Result<Reservation, EngineError> {
        self.resolve(id, ReservationStatus::Expired, worker, Some(now)).await
    }

    /// Move a PENDING reservation to `target`. The status is re-read after all
    /// item locks are held; whichever resolution locks first wins. Without an
    /// explicit `at`, the clock is read once the locks are held.
    pub(super) async fn resolve(
        &self,
        id: Ulid,
        target: ReservationStatus,
        created_by: &str,
        at: Option<Ms>,
    ) -> Result<Reservation, EngineError> {
        let snapshot = self
            .store
            .get_reservation(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let mut locks = self.lock_items(&snapshot.item_ids()).await?;
        let now = at.unwrap_or_else(now_ms);
        let current = self
            .store
            .get_reservation(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        check_transition(&current, target, now)?;

        let kind = match target {
            ReservationStatus::Confirmed => TransactionType::Confirm,
            _ => TransactionType::Release,
        };
        let transactions = current
            .lines
            .iter()
            .map(|l| Transaction {
                id: Ulid::new(),
                inventory_item_id: l.inventory_item_id,
                transaction_type: kind,
                quantity: l.quantity,
                warehouse_id: l.warehouse_id,
                reference_id: Some(current.reference_id.clone()),
                reference_type: Some(current.reference_type.clone()),
                notes: None,
                created_by: created_by.to_string(),
                created_at: now,
            })
            .collect();

        self.commit(
            &mut locks,
            Event::ReservationResolved {
                id,
                status: target,
                at: now,
                transactions,
            },
        )
        .await?;
        drop(locks);

        self.store
            .get_reservation(&id)
            .ok_or(EngineError::ReservationNotFound(id))
    }

    // ── Stock adjustments ────────────────────────────────────

    /// Apply each line independently. Only an oversized batch fails the call.
    pub async fn bulk_update_inventory(
        &self,
        lines: Vec<BulkLine>,
        created_by: &str,
    ) -> Result<BulkUpdateResponse, EngineError> {
        if lines.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let mut response = BulkUpdateResponse {
            results: Vec::with_capacity(lines.len()),
            success_count: 0,
            failure_count: 0,
        };
        for line in lines {
            let result = match self.apply_delta(&line, created_by).await {
                Ok(info) => {
                    response.success_count += 1;
                    metrics::counter!(observability::BULK_LINES_TOTAL, "outcome" => "ok").increment(1);
                    BulkUpdateResult {
                        sku: line.sku,
                        success: true,
                        message: "updated".into(),
                        updated_item: Some(info),
                    }
                }
                Err(e) => {
                    response.failure_count += 1;
                    metrics::counter!(observability::BULK_LINES_TOTAL, "outcome" => "error").increment(1);
                    tracing::debug!("bulk line for sku {} failed: {e}", line.sku);
                    BulkUpdateResult {
                        sku: line.sku,
                        success: false,
                        message: format!("{}: {e}", e.kind().code()),
                        updated_item: None,
                    }
                }
            };
            response.results.push(result);
        }
        Ok(response)
    }

    async fn apply_delta(&self, line: &BulkLine, created_by: &str) -> Result<ItemInfo, EngineError> {
        let delta = line.quantity_delta;
        if delta == 0 {
            return Err(EngineError::InvalidQuantity("quantity_delta must not be zero".into()));
        }
        if delta.abs() > MAX_QUANTITY {
            return Err(EngineError::InvalidQuantity(format!(
                "quantity_delta exceeds {MAX_QUANTITY}"
            )));
        }
        if let Some(ref r) = line.reference_id {
            check_len(r, MAX_REFERENCE_LEN, "reference_id too long")?;
        }
        if let Some(ref r) = line.reference_type {
            check_len(r, MAX_REFERENCE_LEN, "reference_type too long")?;
        }
        if let Some(ref n) = line.notes {
            check_len(n, MAX_NOTES_LEN, "notes too long")?;
        }

        let id = self
            .store
            .lookup_sku(&line.sku)
            .ok_or_else(|| EngineError::ItemNotFound(format!("sku {}", line.sku)))?;
        let mut locks = self.lock_items(&[id]).await?;
        let item = locks
            .get(&id)
            .ok_or_else(|| EngineError::ItemNotFound(id.to_string()))?;

        // Signed per-warehouse changes for this line.
        let moves: Vec<(Ulid, i64)> = match line.warehouse_id {
            Some(wid) => {
                if self.store.get_warehouse(&wid).is_none() {
                    return Err(EngineError::WarehouseNotFound(wid));
                }
                let available = item.location(&wid).map_or(0, |l| l.available_quantity);
                if delta < 0 && available < -delta {
                    return Err(EngineError::InsufficientInventory {
                        item_id: id,
                        requested: -delta,
                        available,
                    });
                }
                vec![(wid, delta)]
            }
            None if delta > 0 => vec![(self.receiving_warehouse(item)?, delta)],
            None => {
                let views = self.store.warehouse_views();
                spread_withdrawal(id, &item.locations, &views, -delta)?
                    .into_iter()
                    .map(|(wid, q)| (wid, -q))
                    .collect()
            }
        };

        if delta > 0 {
            for (wid, d) in &moves {
                let on_hand = item.location(wid).map_or(0, |l| l.quantity);
                if on_hand + d > MAX_QUANTITY {
                    return Err(EngineError::LimitExceeded("location quantity too large"));
                }
            }
        }

        let now = now_ms();
        let transactions = moves
            .into_iter()
            .map(|(warehouse_id, quantity)| Transaction {
                id: Ulid::new(),
                inventory_item_id: id,
                transaction_type: if quantity > 0 {
                    TransactionType::Receive
                } else {
                    TransactionType::Adjust
                },
                quantity,
                warehouse_id,
                reference_id: line.reference_id.clone(),
                reference_type: line.reference_type.clone(),
                notes: line.notes.clone(),
                created_by: created_by.to_string(),
                created_at: now,
            })
            .collect();
        self.commit(&mut locks, Event::StockAdjusted { transactions })
            .await?;
        locks
            .get(&id)
            .map(ItemState::info)
            .ok_or_else(|| EngineError::ItemNotFound(id.to_string()))
    }

    /// Where a receipt without a warehouse lands: the item's highest-priority
    /// active location, else the default warehouse.
    fn receiving_warehouse(&self, item: &ItemState) -> Result<Ulid, EngineError> {
        let views = self.store.warehouse_views();
        let best = item
            .locations
            .iter()
            .filter_map(|l| {
                views
                    .get(&l.warehouse_id)
                    .filter(|w| w.is_active)
                    .map(|w| (w.priority, l.available_quantity, l.warehouse_id))
            })
            .max_by(|a, b| {
                a.0.cmp(&b.0)
                    .then(a.1.cmp(&b.1))
                    .then(b.2.cmp(&a.2))
            })
            .map(|(_, _, wid)| wid);
        if let Some(wid) = best {
            return Ok(wid);
        }
        self.store
            .default_warehouse()
            .ok_or_else(|| EngineError::InvalidInput("no active warehouse for adjustment".into()))
    }

    // ── Sweeper claims ───────────────────────────────────────

    /// Claim a pending reservation for expiry. Fails if another worker holds a
    /// claim younger than the claim TTL.
    pub fn claim_for_expiry(&self, id: &Ulid, worker: &str, now: Ms) -> bool {
        self.store.try_claim(id, worker, now, self.config.claim_ttl_ms)
    }

    pub fn release_expiry_claim(&self, id: &Ulid, worker: &str) {
        self.store.release_claim(id, worker);
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as a snapshot of current state. Resolved reservations
    /// past the retention window are left out and forgotten; ledger rows past
    /// it move to the ledger archive.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        self.compact_at(now_ms()).await
    }

    pub(crate) async fn compact_at(&self, now: Ms) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let cutoff = now - self.config.retention_ms;

        let mut warehouses = self.store.warehouses();
        warehouses.sort_by_key(|w| w.id);
        let mut events: Vec<Event> = warehouses.into_iter().map(Event::WarehouseCreated).collect();

        let mut archive = Vec::new();
        let mut trimmed = Vec::new();
        for id in self.store.item_ids() {
            let Some(item) = self.store.get_item(&id) else {
                continue;
            };
            let mut snapshot = item.read().await.clone();
            let (old, recent): (Vec<Transaction>, Vec<Transaction>) = snapshot
                .ledger
                .into_iter()
                .partition(|t| t.created_at < cutoff);
            snapshot.ledger = recent;
            if !old.is_empty() {
                archive.extend(old);
                trimmed.push(item);
            }
            events.push(Event::ItemRestored(snapshot));
        }

        let mut reservations = self.store.reservations();
        reservations.sort_by_key(|r| r.id);
        let mut pruned = Vec::new();
        for mut r in reservations {
            if r.status.is_terminal() && r.updated_at < cutoff {
                pruned.push(r.id);
                continue;
            }
            r.claimed_by = None;
            r.claimed_at = None;
            events.push(Event::ReservationRestored(r));
        }

        let count = events.len();
        let archived = archive.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                archive,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        for id in &pruned {
            self.store.remove_reservation(id);
        }
        // The gate is still held, so no commit has touched these ledgers since
        // the snapshot.
        for item in &trimmed {
            item.write().await.ledger.retain(|t| t.created_at >= cutoff);
        }
        tracing::info!(
            "WAL compacted: {count} events, {} reservations pruned, {archived} ledger rows archived",
            pruned.len()
        );
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn check_transition(r: &Reservation, target: ReservationStatus, now: Ms) -> Result<(), EngineError> {
    let invalid = || EngineError::InvalidState { id: r.id, status: r.status };
    match (r.status, target) {
        (ReservationStatus::Pending, ReservationStatus::Confirmed) => {
            if r.is_expired_at(now) {
                Err(EngineError::ReservationExpired(r.id))
            } else {
                Ok(())
            }
        }
        (ReservationStatus::Expired, ReservationStatus::Confirmed) => {
            Err(EngineError::ReservationExpired(r.id))
        }
        (ReservationStatus::Pending, ReservationStatus::Cancelled) => Ok(()),
        (ReservationStatus::Pending, ReservationStatus::Expired) if r.is_expired_at(now) => Ok(()),
        _ => Err(invalid()),
    }
}
