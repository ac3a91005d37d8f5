use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::{ItemLocks, SharedItemState};

type ProductKey = (String, Option<String>);

/// In-memory tables and secondary indexes. Item quantities live behind each
/// item's own lock; everything else is a concurrent map.
pub struct InMemoryStore {
    items: DashMap<Ulid, SharedItemState>,
    skus: DashMap<String, Ulid>,
    products: DashMap<ProductKey, Ulid>,
    warehouses: DashMap<Ulid, Warehouse>,
    warehouse_codes: DashMap<String, Ulid>,
    reservations: DashMap<Ulid, Reservation>,
    /// Item ids currently being created.
    creating: DashMap<Ulid, ()>,
    /// Reservation ids currently being placed.
    reserving: DashMap<Ulid, ()>,
    references: DashMap<String, Vec<Ulid>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            items: DashMap::new(),
            skus: DashMap::new(),
            products: DashMap::new(),
            warehouses: DashMap::new(),
            warehouse_codes: DashMap::new(),
            reservations: DashMap::new(),
            creating: DashMap::new(),
            reserving: DashMap::new(),
            references: DashMap::new(),
        }
    }

    // ── Items ────────────────────────────────────────────────

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn contains_item(&self, id: &Ulid) -> bool {
        self.items.contains_key(id)
    }

    pub fn get_item(&self, id: &Ulid) -> Option<SharedItemState> {
        self.items.get(id).map(|e| e.value().clone())
    }

    /// All item ids in creation order.
    pub fn item_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.items.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Mark an item id as being created. False if the item exists or another
    /// create holds the id.
    pub fn claim_item_id(&self, id: Ulid) -> bool {
        match self.creating.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                if self.items.contains_key(&id) {
                    return false;
                }
                v.insert(());
                true
            }
        }
    }

    pub fn release_item_id(&self, id: &Ulid) {
        self.creating.remove(id);
    }

    fn insert_item(&self, state: ItemState) {
        let id = state.id;
        self.skus.insert(state.sku.clone(), id);
        self.products
            .insert((state.product_id.clone(), state.variant_id.clone()), id);
        self.items.insert(id, Arc::new(RwLock::new(state)));
    }

    pub fn lookup_sku(&self, sku: &str) -> Option<Ulid> {
        self.skus.get(sku).map(|e| *e.value())
    }

    /// Exact (product, variant) match first. Without a variant, fall back to the
    /// oldest item of that product.
    pub fn lookup_product(&self, product_id: &str, variant_id: Option<&str>) -> Option<Ulid> {
        let key = (product_id.to_string(), variant_id.map(str::to_string));
        if let Some(id) = self.products.get(&key) {
            return Some(*id.value());
        }
        if variant_id.is_some() {
            return None;
        }
        self.products
            .iter()
            .filter(|e| e.key().0 == product_id)
            .map(|e| *e.value())
            .min()
    }

    /// Reserve a SKU for a new item. False if taken.
    pub fn claim_sku(&self, sku: &str, id: Ulid) -> bool {
        match self.skus.entry(sku.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(id);
                true
            }
        }
    }

    pub fn release_sku(&self, sku: &str, id: Ulid) {
        self.skus.remove_if(sku, |_, owner| *owner == id);
    }

    pub fn claim_product(&self, product_id: &str, variant_id: Option<&str>, id: Ulid) -> bool {
        match self
            .products
            .entry((product_id.to_string(), variant_id.map(str::to_string)))
        {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(id);
                true
            }
        }
    }

    pub fn release_product(&self, product_id: &str, variant_id: Option<&str>, id: Ulid) {
        let key = (product_id.to_string(), variant_id.map(str::to_string));
        self.products.remove_if(&key, |_, owner| *owner == id);
    }

    // ── Warehouses ───────────────────────────────────────────

    pub fn warehouse_count(&self) -> usize {
        self.warehouses.len()
    }

    pub fn get_warehouse(&self, id: &Ulid) -> Option<Warehouse> {
        self.warehouses.get(id).map(|e| e.value().clone())
    }

    pub fn lookup_warehouse_code(&self, code: &str) -> Option<Ulid> {
        self.warehouse_codes.get(code).map(|e| *e.value())
    }

    pub fn claim_code(&self, code: &str, id: Ulid) -> bool {
        match self.warehouse_codes.entry(code.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(id);
                true
            }
        }
    }

    pub fn release_code(&self, code: &str, id: Ulid) {
        self.warehouse_codes.remove_if(code, |_, owner| *owner == id);
    }

    pub fn warehouses(&self) -> Vec<Warehouse> {
        self.warehouses.iter().map(|e| e.value().clone()).collect()
    }

    /// Snapshot of active flag and priority for the allocator.
    pub fn warehouse_views(&self) -> HashMap<Ulid, WarehouseView> {
        self.warehouses
            .iter()
            .map(|e| {
                let w = e.value();
                (w.id, WarehouseView { is_active: w.is_active, priority: w.priority })
            })
            .collect()
    }

    /// Highest-priority active warehouse, ties broken by name.
    pub fn default_warehouse(&self) -> Option<Ulid> {
        self.warehouses
            .iter()
            .filter(|e| e.value().is_active)
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.name.cmp(&a.name))
            })
            .map(|e| *e.key())
    }

    // ── Reservations ─────────────────────────────────────────

    pub fn get_reservation(&self, id: &Ulid) -> Option<Reservation> {
        self.reservations.get(id).map(|e| e.value().clone())
    }

    /// Mark a reservation id as in flight. False if it exists or is already in flight.
    pub fn claim_reservation_id(&self, id: Ulid) -> bool {
        match self.reserving.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                if self.reservations.contains_key(&id) {
                    return false;
                }
                v.insert(());
                true
            }
        }
    }

    pub fn release_reservation_id(&self, id: &Ulid) {
        self.reserving.remove(id);
    }

    pub fn reservations_for_reference(&self, reference_id: &str) -> Vec<Reservation> {
        let ids = self
            .references
            .get(reference_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.get_reservation(id)).collect()
    }

    pub fn reservations(&self) -> Vec<Reservation> {
        self.reservations.iter().map(|e| e.value().clone()).collect()
    }

    /// Pending reservations whose expiration time has passed.
    pub fn expired_pending(&self, now: Ms) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self
            .reservations
            .iter()
            .filter(|e| {
                let r = e.value();
                r.status == ReservationStatus::Pending && r.is_expired_at(now)
            })
            .map(|e| *e.key())
            .collect();
        ids.sort();
        ids
    }

    /// Conditional claim for the sweeper: wins only if the reservation is still
    /// pending and unclaimed, or the previous claim is older than `ttl`.
    pub fn try_claim(&self, id: &Ulid, worker: &str, now: Ms, ttl: Ms) -> bool {
        let Some(mut entry) = self.reservations.get_mut(id) else {
            return false;
        };
        let r = entry.value_mut();
        if r.status != ReservationStatus::Pending {
            return false;
        }
        let free = match r.claimed_at {
            None => true,
            Some(at) => now - at > ttl,
        };
        if !free {
            return false;
        }
        r.claimed_by = Some(worker.to_string());
        r.claimed_at = Some(now);
        true
    }

    pub fn release_claim(&self, id: &Ulid, worker: &str) {
        if let Some(mut entry) = self.reservations.get_mut(id) {
            let r = entry.value_mut();
            if r.claimed_by.as_deref() == Some(worker) {
                r.claimed_by = None;
                r.claimed_at = None;
            }
        }
    }

    fn insert_reservation(&self, reservation: Reservation) {
        let mut ids = self
            .references
            .entry(reservation.reference_id.clone())
            .or_default();
        if !ids.contains(&reservation.id) {
            ids.push(reservation.id);
        }
        drop(ids);
        self.reservations.insert(reservation.id, reservation);
    }

    /// Forget a resolved reservation (retention pruning).
    pub fn remove_reservation(&self, id: &Ulid) {
        if let Some((_, r)) = self.reservations.remove(id)
            && let Some(mut ids) = self.references.get_mut(&r.reference_id)
        {
            ids.retain(|x| x != id);
        }
    }

    // ── Event application ────────────────────────────────────

    /// Apply a committed event. Item-level events require the touched items'
    /// write locks in `locks`.
    pub(crate) fn apply(&self, locks: &mut ItemLocks, event: &Event) {
        match event {
            Event::WarehouseCreated(w) | Event::WarehouseUpdated(w) => {
                self.warehouse_codes.insert(w.code.clone(), w.id);
                self.warehouses.insert(w.id, w.clone());
            }
            Event::ItemCreated { item, receipts } => {
                let mut state = item.clone();
                for tx in receipts {
                    state.apply_transaction(tx);
                }
                state.touch(item.created_at, !receipts.is_empty());
                self.insert_item(state);
            }
            Event::ItemRestored(state) => self.insert_item(state.clone()),
            Event::ItemUpdated {
                id,
                reorder_point,
                reorder_quantity,
                status,
                at,
            } => {
                let Some(item) = locks.get_mut(id) else {
                    tracing::warn!("apply: item {id} not locked");
                    return;
                };
                item.reorder_point = *reorder_point;
                item.reorder_quantity = *reorder_quantity;
                item.touch(*at, false);
                if let Some(s) = status {
                    item.status = *s;
                }
            }
            Event::StockAdjusted { transactions } => {
                if let Some(first) = transactions.first() {
                    apply_transactions(locks, transactions, first.created_at);
                }
            }
            Event::ReservationPlaced {
                reservation,
                transactions,
            } => {
                apply_transactions(locks, transactions, reservation.created_at);
                self.insert_reservation(reservation.clone());
            }
            Event::ReservationResolved {
                id,
                status,
                at,
                transactions,
            } => {
                apply_transactions(locks, transactions, *at);
                if let Some(mut entry) = self.reservations.get_mut(id) {
                    let r = entry.value_mut();
                    r.status = *status;
                    r.updated_at = *at;
                    r.claimed_by = None;
                    r.claimed_at = None;
                }
            }
            Event::ReservationRestored(r) => self.insert_reservation(r.clone()),
        }
    }
}

/// Apply ledger rows to their items, then refresh each touched item once.
fn apply_transactions(locks: &mut ItemLocks, transactions: &[Transaction], at: Ms) {
    let mut touched: Vec<Ulid> = Vec::new();
    for tx in transactions {
        match locks.get_mut(&tx.inventory_item_id) {
            Some(item) => item.apply_transaction(tx),
            None => {
                tracing::warn!("apply: item {} not locked", tx.inventory_item_id);
                continue;
            }
        }
        if !touched.contains(&tx.inventory_item_id) {
            touched.push(tx.inventory_item_id);
        }
    }
    for id in touched {
        if let Some(item) = locks.get_mut(&id) {
            item.touch(at, true);
        }
    }
}
