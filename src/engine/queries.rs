use std::collections::HashSet;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::wal::LedgerArchive;

use super::{Engine, EngineError};

impl Engine {
    pub fn resolve_item(&self, key: &ItemKey) -> Option<Ulid> {
        match key {
            ItemKey::Id(id) => self.store.contains_item(id).then_some(*id),
            ItemKey::Sku(sku) => self.store.lookup_sku(sku),
            ItemKey::Product {
                product_id,
                variant_id,
            } => self.store.lookup_product(product_id, variant_id.as_deref()),
        }
    }

    pub async fn get_item(&self, key: &ItemKey) -> Result<ItemInfo, EngineError> {
        let id = self.resolve_item(key).ok_or_else(|| not_found(key))?;
        let item = self
            .store
            .get_item(&id)
            .ok_or_else(|| EngineError::ItemNotFound(id.to_string()))?;
        let guard = item.read().await;
        Ok(guard.info())
    }

    /// One page of items in creation order, plus the number of items matching
    /// the filter across all pages.
    pub async fn list_items(&self, filter: &ItemFilter) -> Result<(Vec<ItemInfo>, usize), EngineError> {
        if filter.page == 0 {
            return Err(EngineError::InvalidInput("page is 1-based".into()));
        }
        let page_size = match filter.page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };
        let skip = (filter.page - 1).saturating_mul(page_size);

        let mut page = Vec::with_capacity(page_size);
        let mut total = 0usize;
        for id in self.store.item_ids() {
            let Some(item) = self.store.get_item(&id) else {
                continue;
            };
            let guard = item.read().await;
            if let Some(status) = filter.status
                && guard.status != status
            {
                continue;
            }
            if let Some(wid) = filter.warehouse_id
                && guard.location(&wid).is_none()
            {
                continue;
            }
            if filter.low_stock_only && !guard.is_low_stock() {
                continue;
            }
            if total >= skip && page.len() < page_size {
                page.push(guard.info());
            }
            total += 1;
        }
        Ok((page, total))
    }

    pub async fn list_locations(&self, item_id: Ulid) -> Result<Vec<InventoryLocation>, EngineError> {
        let item = self
            .store
            .get_item(&item_id)
            .ok_or_else(|| EngineError::ItemNotFound(item_id.to_string()))?;
        let guard = item.read().await;
        Ok(guard.locations.clone())
    }

    /// Ledger rows for an item, oldest first: archived rows, then the ones
    /// still held in memory.
    pub async fn list_transactions(&self, item_id: Ulid) -> Result<Vec<Transaction>, EngineError> {
        let item = self
            .store
            .get_item(&item_id)
            .ok_or_else(|| EngineError::ItemNotFound(item_id.to_string()))?;
        // Held across the archive read so compaction can't move rows between
        // the two reads.
        let guard = item.read().await;
        let path = self.ledger_path.clone();
        let archived = tokio::task::spawn_blocking(move || LedgerArchive::read(&path))
            .await
            .map_err(|e| EngineError::Internal(format!("ledger archive read: {e}")))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        // A crash between archiving and the snapshot swap leaves rows in both.
        let mut seen = HashSet::new();
        let rows = archived
            .into_iter()
            .filter(|t| t.inventory_item_id == item_id)
            .chain(guard.ledger.iter().cloned())
            .filter(|t| seen.insert(t.id))
            .collect();
        Ok(rows)
    }

    pub fn get_warehouse(&self, id: &Ulid) -> Result<Warehouse, EngineError> {
        self.store
            .get_warehouse(id)
            .ok_or(EngineError::WarehouseNotFound(*id))
    }

    pub fn get_warehouse_by_code(&self, code: &str) -> Result<Warehouse, EngineError> {
        self.store
            .lookup_warehouse_code(code)
            .and_then(|id| self.store.get_warehouse(&id))
            .ok_or_else(|| EngineError::WarehouseCodeNotFound(code.to_string()))
    }

    /// Highest priority first, then by name.
    pub fn list_warehouses(&self, active: Option<bool>) -> Vec<Warehouse> {
        let mut list: Vec<Warehouse> = self
            .store
            .warehouses()
            .into_iter()
            .filter(|w| active.is_none_or(|a| w.is_active == a))
            .collect();
        list.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        list
    }

    pub fn get_reservation(&self, id: &Ulid) -> Result<Reservation, EngineError> {
        self.store
            .get_reservation(id)
            .ok_or(EngineError::ReservationNotFound(*id))
    }

    pub fn list_reservations(&self, reference_id: &str) -> Vec<Reservation> {
        let mut list = self.store.reservations_for_reference(reference_id);
        list.sort_by_key(|r| r.id);
        list
    }

    /// Pending reservations due for expiry at `now`.
    pub fn collect_expired_reservations(&self, now: Ms) -> Vec<Ulid> {
        self.store.expired_pending(now)
    }
}

fn not_found(key: &ItemKey) -> EngineError {
    match key {
        ItemKey::Id(id) => EngineError::ItemNotFound(id.to_string()),
        ItemKey::Sku(sku) => EngineError::ItemNotFound(format!("sku {sku}")),
        ItemKey::Product {
            product_id,
            variant_id: Some(v),
        } => EngineError::ItemNotFound(format!("product {product_id} variant {v}")),
        ItemKey::Product { product_id, .. } => {
            EngineError::ItemNotFound(format!("product {product_id}"))
        }
    }
}
