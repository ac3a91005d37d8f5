use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Stock an item can actually promise: available quantity in active warehouses.
pub fn sellable_quantity(
    locations: &[InventoryLocation],
    warehouses: &HashMap<Ulid, WarehouseView>,
) -> i64 {
    locations
        .iter()
        .filter(|l| warehouses.get(&l.warehouse_id).is_some_and(|w| w.is_active))
        .map(|l| l.available_quantity.max(0))
        .sum()
}

/// Decide which warehouses to draw `quantity` units from.
///
/// Returns `(warehouse_id, quantity)` pairs summing exactly to `quantity`.
/// A preferred warehouse that can cover the whole request by itself wins
/// outright; otherwise locations are drained greedily by warehouse priority
/// (desc), then available quantity (desc), then warehouse id. Pure: callers
/// apply the result.
pub fn allocate(
    item_id: Ulid,
    locations: &[InventoryLocation],
    warehouses: &HashMap<Ulid, WarehouseView>,
    quantity: i64,
    preferred: Option<Ulid>,
) -> Result<Vec<(Ulid, i64)>, EngineError> {
    if quantity <= 0 {
        return Err(EngineError::InvalidQuantity(format!(
            "requested quantity must be positive, got {quantity}"
        )));
    }

    if let Some(wid) = preferred {
        let view = warehouses
            .get(&wid)
            .ok_or(EngineError::WarehouseNotFound(wid))?;
        if !view.is_active {
            return Err(EngineError::WarehouseInactive(wid));
        }
        if let Some(loc) = locations.iter().find(|l| l.warehouse_id == wid)
            && loc.available_quantity >= quantity
        {
            return Ok(vec![(wid, quantity)]);
        }
    }

    let mut eligible: Vec<(&InventoryLocation, i32)> = locations
        .iter()
        .filter(|l| l.available_quantity > 0)
        .filter_map(|l| {
            warehouses
                .get(&l.warehouse_id)
                .filter(|w| w.is_active)
                .map(|w| (l, w.priority))
        })
        .collect();

    let available: i64 = eligible.iter().map(|(l, _)| l.available_quantity).sum();
    if available < quantity {
        return Err(EngineError::InsufficientInventory {
            item_id,
            requested: quantity,
            available,
        });
    }

    eligible.sort_by(|(a, pa), (b, pb)| {
        pb.cmp(pa)
            .then(b.available_quantity.cmp(&a.available_quantity))
            .then(a.warehouse_id.cmp(&b.warehouse_id))
    });

    let mut remaining = quantity;
    let mut picks = Vec::new();
    for (loc, _) in eligible {
        if remaining == 0 {
            break;
        }
        let take = loc.available_quantity.min(remaining);
        picks.push((loc.warehouse_id, take));
        remaining -= take;
    }
    Ok(picks)
}

/// Split a stock withdrawal of `quantity` units across an item's locations:
/// active warehouses in allocation order, then inactive ones. Fails only when
/// the item as a whole has less than `quantity` available.
pub fn spread_withdrawal(
    item_id: Ulid,
    locations: &[InventoryLocation],
    warehouses: &HashMap<Ulid, WarehouseView>,
    quantity: i64,
) -> Result<Vec<(Ulid, i64)>, EngineError> {
    if quantity <= 0 {
        return Err(EngineError::InvalidQuantity(format!(
            "withdrawal must be positive, got {quantity}"
        )));
    }

    let mut stocked: Vec<(&InventoryLocation, bool, i32)> = locations
        .iter()
        .filter(|l| l.available_quantity > 0)
        .map(|l| match warehouses.get(&l.warehouse_id) {
            Some(w) => (l, w.is_active, w.priority),
            None => (l, false, i32::MIN),
        })
        .collect();

    let available: i64 = stocked.iter().map(|(l, _, _)| l.available_quantity).sum();
    if available < quantity {
        return Err(EngineError::InsufficientInventory {
            item_id,
            requested: quantity,
            available,
        });
    }

    stocked.sort_by(|(a, active_a, pa), (b, active_b, pb)| {
        active_b
            .cmp(active_a)
            .then(pb.cmp(pa))
            .then(b.available_quantity.cmp(&a.available_quantity))
            .then(a.warehouse_id.cmp(&b.warehouse_id))
    });

    let mut remaining = quantity;
    let mut picks = Vec::new();
    for (loc, _, _) in stocked {
        if remaining == 0 {
            break;
        }
        let take = loc.available_quantity.min(remaining);
        picks.push((loc.warehouse_id, take));
        remaining -= take;
    }
    Ok(picks)
}

/// Deduct an allocation from a scratch copy of locations, so later lines of the
/// same request see what earlier lines already took.
pub(super) fn deduct(locations: &mut [InventoryLocation], picks: &[(Ulid, i64)]) {
    for (wid, q) in picks {
        if let Some(loc) = locations.iter_mut().find(|l| l.warehouse_id == *wid) {
            loc.available_quantity -= q;
            loc.reserved_quantity += q;
        }
    }
}
