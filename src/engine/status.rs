use crate::model::StockStatus;

/// Derive an item's display status from its available quantity.
///
/// Stored on every quantity change rather than computed at read time, so
/// filtering by status is a plain comparison.
pub fn classify(available_quantity: i64, reorder_point: i64) -> StockStatus {
    if available_quantity <= 0 {
        StockStatus::OutOfStock
    } else if available_quantity <= reorder_point {
        StockStatus::LowStock
    } else {
        StockStatus::InStock
    }
}
