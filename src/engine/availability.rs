use crate::limits::MAX_BATCH_SIZE;
use crate::model::*;

use super::{Engine, EngineError, sellable_quantity};

impl Engine {
    /// Read-only stock check. Each line is answered from its own short read
    /// lock; an unknown item is reported as `NOT_FOUND` rather than failing the
    /// batch.
    pub async fn check_inventory_availability(
        &self,
        lines: &[AvailabilityRequest],
    ) -> Result<AvailabilityReport, EngineError> {
        if lines.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("too many availability lines"));
        }
        if let Some(bad) = lines.iter().find(|l| l.quantity <= 0) {
            return Err(EngineError::InvalidQuantity(format!(
                "requested quantity must be positive, got {}",
                bad.quantity
            )));
        }

        let warehouses = self.store.warehouse_views();
        let mut items = Vec::with_capacity(lines.len());
        for line in lines {
            let key = if line.sku.is_empty() {
                ItemKey::Product {
                    product_id: line.product_id.clone(),
                    variant_id: line.variant_id.clone(),
                }
            } else {
                ItemKey::Sku(line.sku.clone())
            };
            let shared = self.resolve_item(&key).and_then(|id| self.store.get_item(&id));

            let report = match shared {
                Some(item) => {
                    let guard = item.read().await;
                    let available = sellable_quantity(&guard.locations, &warehouses);
                    ItemAvailability {
                        product_id: guard.product_id.clone(),
                        variant_id: guard.variant_id.clone(),
                        sku: guard.sku.clone(),
                        requested_quantity: line.quantity,
                        available_quantity: available,
                        is_available: available >= line.quantity,
                        status: guard.status.as_str().to_string(),
                    }
                }
                None => ItemAvailability {
                    product_id: line.product_id.clone(),
                    variant_id: line.variant_id.clone(),
                    sku: line.sku.clone(),
                    requested_quantity: line.quantity,
                    available_quantity: 0,
                    is_available: false,
                    status: "NOT_FOUND".into(),
                },
            };
            items.push(report);
        }

        let all_available = items.iter().all(|i| i.is_available);
        Ok(AvailabilityReport {
            items,
            all_available,
        })
    }
}
