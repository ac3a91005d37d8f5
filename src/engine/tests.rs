use super::*;
use crate::limits::*;
use tokio_test::{assert_err, assert_ok};

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("stockhold_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    let _ = std::fs::remove_file(crate::wal::LedgerArchive::path_for(&path));
    path
}

fn open(path: &PathBuf) -> Engine {
    Engine::new(path.clone(), Arc::new(NotifyHub::new()), EngineConfig::default()).unwrap()
}

fn new_engine(name: &str) -> Engine {
    open(&test_wal_path(name))
}

async fn warehouse(engine: &Engine, code: &str, priority: i32) -> Ulid {
    let id = Ulid::new();
    engine
        .create_warehouse(
            id,
            NewWarehouse {
                name: format!("Warehouse {code}"),
                code: code.into(),
                address: Address::default(),
                is_active: true,
                priority,
            },
        )
        .await
        .unwrap();
    id
}

fn new_item(sku: &str, reorder_point: i64, allocations: &[(Ulid, i64)]) -> NewItem {
    NewItem {
        product_id: format!("prod-{sku}"),
        variant_id: None,
        sku: sku.into(),
        initial_quantity: allocations.iter().map(|(_, q)| q).sum(),
        reorder_point,
        reorder_quantity: 0,
        warehouse_allocations: allocations.to_vec(),
    }
}

async fn item(engine: &Engine, sku: &str, allocations: &[(Ulid, i64)]) -> Ulid {
    let id = Ulid::new();
    engine
        .create_item(id, new_item(sku, 0, allocations), "tester")
        .await
        .unwrap();
    id
}

fn request(lines: &[(Ulid, i64)], reference: &str) -> ReserveRequest {
    ReserveRequest {
        id: Ulid::new(),
        items: lines
            .iter()
            .map(|(id, q)| ReserveLine {
                inventory_item_id: *id,
                quantity: *q,
                warehouse_id: None,
            })
            .collect(),
        reference_id: reference.into(),
        reference_type: "order".into(),
        reservation_minutes: 0,
    }
}

async fn info(engine: &Engine, id: Ulid) -> ItemInfo {
    engine.get_item(&ItemKey::Id(id)).await.unwrap()
}

async fn assert_consistent(engine: &Engine) {
    for id in engine.store.item_ids() {
        let item = engine.store.get_item(&id).unwrap();
        let guard = item.read().await;
        assert_ok!(guard.check_invariants());
    }
}

// ── Allocation ───────────────────────────────────────────

#[tokio::test]
async fn reserve_drains_higher_priority_warehouse_first() {
    let engine = new_engine("priority_spill.wal");
    let w1 = warehouse(&engine, "W1", 10).await;
    let w2 = warehouse(&engine, "W2", 5).await;
    let id = item(&engine, "SKU-1", &[(w1, 5), (w2, 20)]).await;

    let r = engine
        .reserve_inventory(request(&[(id, 8)], "order-1"), "tester")
        .await
        .unwrap();
    assert_eq!(r.status, ReservationStatus::Pending);
    assert_eq!(
        r.lines,
        vec![
            ReservationLine { inventory_item_id: id, warehouse_id: w1, quantity: 5 },
            ReservationLine { inventory_item_id: id, warehouse_id: w2, quantity: 3 },
        ]
    );

    let it = info(&engine, id).await;
    assert_eq!((it.total_quantity, it.available_quantity, it.reserved_quantity), (25, 17, 8));
    let l1 = it.locations.iter().find(|l| l.warehouse_id == w1).unwrap();
    assert_eq!((l1.available_quantity, l1.reserved_quantity), (0, 5));
    let l2 = it.locations.iter().find(|l| l.warehouse_id == w2).unwrap();
    assert_eq!((l2.available_quantity, l2.reserved_quantity), (17, 3));
    assert_consistent(&engine).await;
}

#[tokio::test]
async fn preferred_warehouse_is_used_when_it_covers_the_request() {
    let engine = new_engine("preferred.wal");
    let w1 = warehouse(&engine, "W1", 10).await;
    let w2 = warehouse(&engine, "W2", 5).await;
    let id = item(&engine, "SKU-1", &[(w1, 5), (w2, 20)]).await;

    let mut req = request(&[(id, 4)], "order-1");
    req.items[0].warehouse_id = Some(w2);
    let r = engine.reserve_inventory(req, "tester").await.unwrap();
    assert_eq!(r.lines.len(), 1);
    assert_eq!(r.lines[0].warehouse_id, w2);

    // Too much for W2 alone: falls back to priority order.
    let mut req = request(&[(id, 18)], "order-2");
    req.items[0].warehouse_id = Some(w2);
    let r = engine.reserve_inventory(req, "tester").await.unwrap();
    assert_eq!(r.lines[0].warehouse_id, w1);
    assert_eq!(r.quantity(), 18);
}

#[tokio::test]
async fn inactive_warehouse_stock_is_not_promised() {
    let engine = new_engine("inactive.wal");
    let w1 = warehouse(&engine, "W1", 10).await;
    let w2 = warehouse(&engine, "W2", 5).await;
    let id = item(&engine, "SKU-1", &[(w1, 5), (w2, 20)]).await;

    engine
        .update_warehouse(w1, WarehouseUpdate { is_active: Some(false), ..Default::default() })
        .await
        .unwrap();

    let report = engine
        .check_inventory_availability(&[AvailabilityRequest {
            product_id: String::new(),
            variant_id: None,
            sku: "SKU-1".into(),
            quantity: 21,
        }])
        .await
        .unwrap();
    assert_eq!(report.items[0].available_quantity, 20);
    assert!(!report.all_available);

    let r = engine
        .reserve_inventory(request(&[(id, 8)], "order-1"), "tester")
        .await
        .unwrap();
    assert_eq!(r.lines.len(), 1);
    assert_eq!(r.lines[0].warehouse_id, w2);

    let mut req = request(&[(id, 1)], "order-2");
    req.items[0].warehouse_id = Some(w1);
    let err = engine.reserve_inventory(req, "tester").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WarehouseInactive);
}

// ── Reserve failures ─────────────────────────────────────

#[tokio::test]
async fn insufficient_stock_changes_nothing() {
    let engine = new_engine("insufficient.wal");
    let w1 = warehouse(&engine, "W1", 1).await;
    let id = item(&engine, "SKU-1", &[(w1, 25)]).await;
    let before = info(&engine, id).await;

    let req = request(&[(id, 30)], "order-1");
    let rid = req.id;
    let err = engine.reserve_inventory(req, "tester").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientInventory);
    assert_eq!(err.kind().code(), "INSUFFICIENT_INVENTORY");

    assert_eq!(info(&engine, id).await, before);
    assert_eq!(engine.list_transactions(id).await.unwrap().len(), 1);
    assert_eq!(engine.get_reservation(&rid).unwrap_err().kind(), ErrorKind::ReservationNotFound);
}

#[tokio::test]
async fn multi_line_reserve_is_all_or_nothing() {
    let engine = new_engine("all_or_nothing.wal");
    let w1 = warehouse(&engine, "W1", 1).await;
    let a = item(&engine, "SKU-A", &[(w1, 10)]).await;
    let b = item(&engine, "SKU-B", &[(w1, 2)]).await;

    let err = engine
        .reserve_inventory(request(&[(a, 5), (b, 3)], "order-1"), "tester")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientInventory);
    assert_eq!(info(&engine, a).await.available_quantity, 10);
    assert_eq!(info(&engine, b).await.available_quantity, 2);

    let r = engine
        .reserve_inventory(request(&[(a, 5), (b, 2)], "order-1"), "tester")
        .await
        .unwrap();
    assert_eq!(r.quantity(), 7);
    assert_eq!(r.item_ids().len(), 2);
}

#[tokio::test]
async fn same_item_twice_in_one_request_sees_earlier_lines() {
    let engine = new_engine("same_item_twice.wal");
    let w1 = warehouse(&engine, "W1", 1).await;
    let id = item(&engine, "SKU-1", &[(w1, 6)]).await;

    let err = engine
        .reserve_inventory(request(&[(id, 4), (id, 4)], "order-1"), "tester")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientInventory);

    let r = engine
        .reserve_inventory(request(&[(id, 4), (id, 2)], "order-1"), "tester")
        .await
        .unwrap();
    // Merged per (item, warehouse).
    assert_eq!(r.lines.len(), 1);
    assert_eq!(r.lines[0].quantity, 6);
    assert_eq!(info(&engine, id).await.available_quantity, 0);
}

#[tokio::test]
async fn duplicate_reservation_id_is_rejected() {
    let engine = new_engine("duplicate_reservation.wal");
    let w1 = warehouse(&engine, "W1", 1).await;
    let id = item(&engine, "SKU-1", &[(w1, 10)]).await;

    let req = request(&[(id, 3)], "order-1");
    assert_ok!(engine.reserve_inventory(req.clone(), "tester").await);
    let err = assert_err!(engine.reserve_inventory(req, "tester").await);
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    assert_eq!(info(&engine, id).await.reserved_quantity, 3);
}

#[tokio::test]
async fn reserve_validates_input() {
    let engine = new_engine("reserve_validation.wal");
    let w1 = warehouse(&engine, "W1", 1).await;
    let id = item(&engine, "SKU-1", &[(w1, 10)]).await;

    let err = engine.reserve_inventory(request(&[], "order-1"), "t").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let err = engine.reserve_inventory(request(&[(id, 0)], "order-1"), "t").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidQuantity);

    let err = engine.reserve_inventory(request(&[(id, 1)], " "), "t").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let mut req = request(&[(id, 1)], "order-1");
    req.reservation_minutes = MAX_RESERVATION_MINUTES + 1;
    let err = engine.reserve_inventory(req, "t").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let err = engine
        .reserve_inventory(request(&[(Ulid::new(), 1)], "order-1"), "t")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    assert_eq!(info(&engine, id).await.reserved_quantity, 0);
}

#[tokio::test]
async fn default_reservation_window_applies() {
    let engine = new_engine("default_window.wal");
    let w1 = warehouse(&engine, "W1", 1).await;
    let id = item(&engine, "SKU-1", &[(w1, 10)]).await;

    let now = now_ms();
    let r = engine.reserve_at(request(&[(id, 1)], "order-1"), "t", now).await.unwrap();
    assert_eq!(r.expiration_time, now + DEFAULT_RESERVATION_MINUTES * MINUTE_MS);

    let mut req = request(&[(id, 1)], "order-2");
    req.reservation_minutes = 2;
    let r = engine.reserve_at(req, "t", now).await.unwrap();
    assert_eq!(r.expiration_time, now + 2 * MINUTE_MS);
}

// ── Confirm / cancel / expire ────────────────────────────

#[tokio::test]
async fn confirm_consumes_reserved_stock() {
    let engine = new_engine("confirm.wal");
    let w1 = warehouse(&engine, "W1", 1).await;
    let id = item(&engine, "SKU-1", &[(w1, 10)]).await;

    let r = engine.reserve_inventory(request(&[(id, 4)], "order-1"), "shop").await.unwrap();
    let confirmed = engine.confirm_reservation(r.id, "shop").await.unwrap();
    assert_eq!(confirmed.status, ReservationStatus::Confirmed);

    let it = info(&engine, id).await;
    assert_eq!((it.total_quantity, it.available_quantity, it.reserved_quantity), (6, 6, 0));

    let err = engine.confirm_reservation(r.id, "shop").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReservationInvalidState);
    let err = engine.cancel_reservation(r.id, "shop").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReservationInvalidState);

    let kinds: Vec<TransactionType> = engine
        .list_transactions(id)
        .await
        .unwrap()
        .iter()
        .map(|t| t.transaction_type)
        .collect();
    assert_eq!(
        kinds,
        vec![TransactionType::Receive, TransactionType::Reserve, TransactionType::Confirm]
    );
    assert_consistent(&engine).await;
}

#[tokio::test]
async fn cancel_restores_location_breakdown() {
    let engine = new_engine("cancel.wal");
    let w1 = warehouse(&engine, "W1", 10).await;
    let w2 = warehouse(&engine, "W2", 5).await;
    let id = item(&engine, "SKU-1", &[(w1, 5), (w2, 20)]).await;
    let before = info(&engine, id).await;

    let r = engine.reserve_inventory(request(&[(id, 8)], "order-1"), "shop").await.unwrap();
    let cancelled = engine.cancel_reservation(r.id, "shop").await.unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);

    let after = info(&engine, id).await;
    assert_eq!(after.locations, before.locations);
    assert_eq!(after.available_quantity, 25);
    assert_eq!(after.version, before.version + 2);

    let err = engine.confirm_reservation(r.id, "shop").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReservationInvalidState);
}

#[tokio::test]
async fn overdue_reservation_cannot_be_confirmed() {
    let engine = new_engine("confirm_expired.wal");
    let w1 = warehouse(&engine, "W1", 1).await;
    let id = item(&engine, "SKU-1", &[(w1, 10)]).await;

    let mut req = request(&[(id, 2)], "order-1");
    req.reservation_minutes = 1;
    let placed_at = now_ms() - 2 * MINUTE_MS;
    let r = engine.reserve_at(req, "shop", placed_at).await.unwrap();

    let err = engine.confirm_reservation(r.id, "shop").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReservationExpired);
    // Still held until the sweeper releases it.
    assert_eq!(info(&engine, id).await.reserved_quantity, 2);

    let expired = engine.expire_reservation(r.id, "sweeper", now_ms()).await.unwrap();
    assert_eq!(expired.status, ReservationStatus::Expired);
    assert_eq!(info(&engine, id).await.available_quantity, 10);

    let err = engine.confirm_reservation(r.id, "shop").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReservationExpired);
    let err = engine.cancel_reservation(r.id, "shop").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReservationInvalidState);
}

#[tokio::test]
async fn confirm_checks_expiry_once_it_holds_the_locks() {
    let engine = Arc::new(new_engine("confirm_after_lock_wait.wal"));
    let w1 = warehouse(&engine, "W1", 1).await;
    let id = item(&engine, "SKU-1", &[(w1, 10)]).await;

    // Due one second from now.
    let mut req = request(&[(id, 2)], "order-1");
    req.reservation_minutes = 1;
    let r = engine
        .reserve_at(req, "shop", now_ms() - MINUTE_MS + 1000)
        .await
        .unwrap();

    let held = engine.lock_items(&[id]).await.unwrap();
    let e = engine.clone();
    let rid = r.id;
    let confirm = tokio::spawn(async move { e.confirm_reservation(rid, "shop").await });
    tokio::time::sleep(Duration::from_millis(1500)).await;
    drop(held);

    let err = confirm.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReservationExpired);
    assert_eq!(engine.get_reservation(&rid).unwrap().status, ReservationStatus::Pending);
    assert_eq!(info(&engine, id).await.reserved_quantity, 2);
}

#[tokio::test]
async fn expiry_before_due_time_is_rejected() {
    let engine = new_engine("expire_early.wal");
    let w1 = warehouse(&engine, "W1", 1).await;
    let id = item(&engine, "SKU-1", &[(w1, 10)]).await;

    let r = engine.reserve_inventory(request(&[(id, 2)], "order-1"), "shop").await.unwrap();
    let err = engine.expire_reservation(r.id, "sweeper", now_ms()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReservationInvalidState);
    assert!(engine.collect_expired_reservations(now_ms()).is_empty());
    assert_eq!(engine.collect_expired_reservations(r.expiration_time), vec![r.id]);
}

#[tokio::test]
async fn unknown_reservation_is_not_found() {
    let engine = new_engine("unknown_reservation.wal");
    let err = engine.confirm_reservation(Ulid::new(), "shop").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReservationNotFound);
    let err = engine.cancel_reservation(Ulid::new(), "shop").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReservationNotFound);
}

#[tokio::test]
async fn reservations_listed_by_reference() {
    let engine = new_engine("by_reference.wal");
    let w1 = warehouse(&engine, "W1", 1).await;
    let id = item(&engine, "SKU-1", &[(w1, 10)]).await;

    let a = engine.reserve_inventory(request(&[(id, 1)], "order-7"), "shop").await.unwrap();
    let b = engine.reserve_inventory(request(&[(id, 1)], "order-7"), "shop").await.unwrap();
    engine.reserve_inventory(request(&[(id, 1)], "order-8"), "shop").await.unwrap();

    let ids: Vec<Ulid> = engine.list_reservations("order-7").iter().map(|r| r.id).collect();
    let mut expected = vec![a.id, b.id];
    expected.sort();
    assert_eq!(ids, expected);
    assert!(engine.list_reservations("order-9").is_empty());
}

// ── Bulk adjustments ─────────────────────────────────────

fn bulk_line(sku: &str, delta: i64) -> BulkLine {
    BulkLine {
        sku: sku.into(),
        quantity_delta: delta,
        warehouse_id: None,
        reference_id: Some("count-1".into()),
        reference_type: Some("stocktake".into()),
        notes: None,
    }
}

#[tokio::test]
async fn bulk_update_isolates_failing_lines() {
    let engine = new_engine("bulk.wal");
    let w1 = warehouse(&engine, "W1", 1).await;
    let a = item(&engine, "SKU-A", &[(w1, 10)]).await;
    let b = item(&engine, "SKU-B", &[(w1, 3)]).await;
    let c = item(&engine, "SKU-C", &[(w1, 1)]).await;
    let b_before = info(&engine, b).await;

    let response = engine
        .bulk_update_inventory(
            vec![bulk_line("SKU-A", 5), bulk_line("SKU-B", -4), bulk_line("SKU-C", -1)],
            "ops",
        )
        .await
        .unwrap();
    assert_eq!(response.success_count, 2);
    assert_eq!(response.failure_count, 1);
    assert!(response.results[0].success);
    assert!(!response.results[1].success);
    assert!(response.results[1].message.starts_with("INSUFFICIENT_INVENTORY"));
    assert_eq!(response.results[1].updated_item, None);
    assert_eq!(response.results[2].updated_item.as_ref().unwrap().available_quantity, 0);

    assert_eq!(info(&engine, a).await.total_quantity, 15);
    assert_eq!(info(&engine, b).await, b_before);
    assert_eq!(info(&engine, c).await.status, StockStatus::OutOfStock);

    let last = engine.list_transactions(c).await.unwrap().pop().unwrap();
    assert_eq!(last.transaction_type, TransactionType::Adjust);
    assert_eq!(last.quantity, -1);
    assert_eq!(last.created_by, "ops");
    assert_eq!(last.reference_type.as_deref(), Some("stocktake"));
}

#[tokio::test]
async fn bulk_update_reports_bad_lines() {
    let engine = new_engine("bulk_bad_lines.wal");
    let w1 = warehouse(&engine, "W1", 1).await;
    item(&engine, "SKU-A", &[(w1, 10)]).await;

    let mut to_missing = bulk_line("SKU-A", 1);
    to_missing.warehouse_id = Some(Ulid::new());
    let response = engine
        .bulk_update_inventory(
            vec![bulk_line("NOPE", 1), bulk_line("SKU-A", 0), to_missing],
            "ops",
        )
        .await
        .unwrap();
    assert_eq!(response.failure_count, 3);
    assert!(response.results[0].message.starts_with("NOT_FOUND"));
    assert!(response.results[1].message.starts_with("INVALID_QUANTITY"));
    assert!(response.results[2].message.starts_with("NOT_FOUND"));

    let too_many = vec![bulk_line("SKU-A", 1); MAX_BATCH_SIZE + 1];
    let err = engine.bulk_update_inventory(too_many, "ops").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LimitExceeded);
}

#[tokio::test]
async fn bulk_receive_into_empty_item_uses_default_warehouse() {
    let engine = new_engine("bulk_default_wh.wal");
    warehouse(&engine, "LOW", 1).await;
    let high = warehouse(&engine, "HIGH", 9).await;
    let id = item(&engine, "SKU-A", &[]).await;

    let response = engine
        .bulk_update_inventory(vec![bulk_line("SKU-A", -1), bulk_line("SKU-A", 7)], "ops")
        .await
        .unwrap();
    assert!(!response.results[0].success);
    assert!(response.results[1].success);

    let it = info(&engine, id).await;
    assert_eq!(it.locations.len(), 1);
    assert_eq!(it.locations[0].warehouse_id, high);
    assert_eq!(it.available_quantity, 7);
}

#[tokio::test]
async fn bulk_withdrawal_without_warehouse_spans_locations() {
    let engine = new_engine("bulk_spread.wal");
    let w1 = warehouse(&engine, "W1", 10).await;
    let w2 = warehouse(&engine, "W2", 5).await;
    let id = item(&engine, "SKU-S", &[(w1, 5), (w2, 20)]).await;

    let response = engine
        .bulk_update_inventory(vec![bulk_line("SKU-S", -10)], "ops")
        .await
        .unwrap();
    assert!(response.results[0].success, "{}", response.results[0].message);

    let it = info(&engine, id).await;
    assert_eq!((it.total_quantity, it.available_quantity), (15, 15));
    let l1 = it.locations.iter().find(|l| l.warehouse_id == w1).unwrap();
    let l2 = it.locations.iter().find(|l| l.warehouse_id == w2).unwrap();
    assert_eq!((l1.available_quantity, l2.available_quantity), (0, 15));

    let ledger = engine.list_transactions(id).await.unwrap();
    let adjustments: Vec<(Ulid, i64)> = ledger
        .iter()
        .filter(|t| t.transaction_type == TransactionType::Adjust)
        .map(|t| (t.warehouse_id, t.quantity))
        .collect();
    assert_eq!(adjustments, vec![(w1, -5), (w2, -5)]);

    // Short at the SKU level: the line fails and nothing moves.
    let response = engine
        .bulk_update_inventory(vec![bulk_line("SKU-S", -16)], "ops")
        .await
        .unwrap();
    assert!(response.results[0].message.starts_with("INSUFFICIENT_INVENTORY"));
    assert_eq!(info(&engine, id).await, it);
    assert_consistent(&engine).await;
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn availability_check_is_read_only() {
    let engine = new_engine("availability.wal");
    let w1 = warehouse(&engine, "W1", 1).await;
    let id = engine
        .create_item(
            Ulid::new(),
            NewItem {
                product_id: "shirt".into(),
                variant_id: Some("red-m".into()),
                sku: "SHIRT-RED-M".into(),
                initial_quantity: 5,
                reorder_point: 0,
                reorder_quantity: 0,
                warehouse_allocations: vec![(w1, 5)],
            },
            "tester",
        )
        .await
        .unwrap()
        .id;
    let before = info(&engine, id).await;

    let report = engine
        .check_inventory_availability(&[
            AvailabilityRequest {
                product_id: "shirt".into(),
                variant_id: Some("red-m".into()),
                sku: String::new(),
                quantity: 5,
            },
            AvailabilityRequest {
                product_id: String::new(),
                variant_id: None,
                sku: "GHOST".into(),
                quantity: 1,
            },
        ])
        .await
        .unwrap();
    assert!(report.items[0].is_available);
    assert_eq!(report.items[0].sku, "SHIRT-RED-M");
    assert_eq!(report.items[0].status, "IN_STOCK");
    assert_eq!(report.items[1].status, "NOT_FOUND");
    assert!(!report.items[1].is_available);
    assert!(!report.all_available);

    assert_eq!(info(&engine, id).await, before);

    let err = engine
        .check_inventory_availability(&[AvailabilityRequest {
            product_id: String::new(),
            variant_id: None,
            sku: "SHIRT-RED-M".into(),
            quantity: 0,
        }])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidQuantity);
}

// ── Items and warehouses ─────────────────────────────────

#[tokio::test]
async fn status_follows_reorder_point() {
    let engine = new_engine("status.wal");
    let w1 = warehouse(&engine, "W1", 1).await;
    for (sku, qty, expected) in [
        ("S0", 0, StockStatus::OutOfStock),
        ("S5", 5, StockStatus::LowStock),
        ("S6", 6, StockStatus::InStock),
    ] {
        let allocations: Vec<(Ulid, i64)> = if qty > 0 { vec![(w1, qty)] } else { Vec::new() };
        let it = engine
            .create_item(Ulid::new(), new_item(sku, 5, &allocations), "t")
            .await
            .unwrap();
        assert_eq!(it.status, expected, "{sku}");
    }

    let id = engine.resolve_item(&ItemKey::Sku("S6".into())).unwrap();
    engine.reserve_inventory(request(&[(id, 1)], "order-1"), "t").await.unwrap();
    assert_eq!(info(&engine, id).await.status, StockStatus::LowStock);
}

#[tokio::test]
async fn status_override_holds_until_next_quantity_change() {
    let engine = new_engine("status_override.wal");
    let w1 = warehouse(&engine, "W1", 1).await;
    let id = item(&engine, "SKU-1", &[(w1, 10)]).await;

    let updated = engine
        .update_item(
            id,
            ItemUpdate {
                reorder_point: Some(3),
                status: Some(StockStatus::OutOfStock),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.status, StockStatus::OutOfStock);
    assert_eq!(updated.reorder_point, 3);
    assert_eq!(updated.reorder_quantity, 0);

    engine.bulk_update_inventory(vec![bulk_line("SKU-1", 1)], "ops").await.unwrap();
    assert_eq!(info(&engine, id).await.status, StockStatus::InStock);
}

#[tokio::test]
async fn create_item_validates_allocations() {
    let engine = new_engine("create_item_validation.wal");
    let w1 = warehouse(&engine, "W1", 1).await;

    let mut bad_sum = new_item("SKU-1", 0, &[(w1, 4)]);
    bad_sum.initial_quantity = 5;
    let err = engine.create_item(Ulid::new(), bad_sum, "t").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let err = engine
        .create_item(Ulid::new(), new_item("SKU-1", 0, &[(Ulid::new(), 4)]), "t")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = engine
        .create_item(Ulid::new(), new_item("SKU-1", 0, &[(w1, 2), (w1, 2)]), "t")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let mut negative = new_item("SKU-1", 0, &[]);
    negative.reorder_point = -1;
    let err = engine.create_item(Ulid::new(), negative, "t").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidQuantity);

    assert_eq!(engine.store.item_count(), 0);
    assert!(engine.resolve_item(&ItemKey::Sku("SKU-1".into())).is_none());
}

#[tokio::test]
async fn initial_stock_without_allocations_lands_in_default_warehouse() {
    let engine = new_engine("initial_default.wal");
    let err = engine
        .create_item(Ulid::new(), NewItem { initial_quantity: 3, ..new_item("SKU-0", 0, &[]) }, "t")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    warehouse(&engine, "B", 5).await;
    let a = warehouse(&engine, "A", 5).await;
    let it = engine
        .create_item(Ulid::new(), NewItem { initial_quantity: 3, ..new_item("SKU-1", 0, &[]) }, "t")
        .await
        .unwrap();
    // Priority tie: name order decides.
    assert_eq!(it.locations.len(), 1);
    assert_eq!(it.locations[0].warehouse_id, a);
    assert_eq!(it.total_quantity, 3);
}

#[tokio::test]
async fn uniqueness_is_enforced() {
    let engine = new_engine("uniqueness.wal");
    let w1 = warehouse(&engine, "W1", 1).await;
    let id = item(&engine, "SKU-1", &[(w1, 1)]).await;

    let err = engine
        .create_item(Ulid::new(), new_item("SKU-1", 0, &[]), "t")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    let mut same_product = new_item("SKU-2", 0, &[]);
    same_product.product_id = "prod-SKU-1".into();
    let err = engine.create_item(Ulid::new(), same_product, "t").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    let err = engine
        .create_item(id, new_item("SKU-3", 0, &[]), "t")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    let err = engine
        .create_warehouse(
            Ulid::new(),
            NewWarehouse {
                name: "Other".into(),
                code: "W1".into(),
                address: Address::default(),
                is_active: true,
                priority: 0,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    // The failed attempts released their claims.
    assert_ok!(engine.create_item(Ulid::new(), new_item("SKU-2", 0, &[]), "t").await);
}

#[tokio::test]
async fn item_lookup_by_every_key() {
    let engine = new_engine("lookup.wal");
    let w1 = warehouse(&engine, "W1", 1).await;
    let id = item(&engine, "SKU-1", &[(w1, 2)]).await;

    assert_eq!(engine.get_item(&ItemKey::Sku("SKU-1".into())).await.unwrap().id, id);
    let by_product = ItemKey::Product { product_id: "prod-SKU-1".into(), variant_id: None };
    assert_eq!(engine.get_item(&by_product).await.unwrap().id, id);
    let err = engine.get_item(&ItemKey::Sku("nope".into())).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let locations = engine.list_locations(id).await.unwrap();
    assert_eq!(locations, vec![InventoryLocation {
        warehouse_id: w1,
        quantity: 2,
        available_quantity: 2,
        reserved_quantity: 0,
    }]);
}

#[tokio::test]
async fn list_items_pages_and_filters() {
    let engine = new_engine("list_items.wal");
    let w1 = warehouse(&engine, "W1", 1).await;
    let w2 = warehouse(&engine, "W2", 1).await;
    // Listing is in id order; make it match creation order.
    let mut ids: Vec<Ulid> = (0..6).map(|_| Ulid::new()).collect();
    ids.sort();
    for i in 0..5 {
        let allocations: Vec<(Ulid, i64)> = if i == 0 { Vec::new() } else { vec![(w1, i * 2)] };
        engine
            .create_item(ids[i as usize], new_item(&format!("SKU-{i}"), 3, &allocations), "t")
            .await
            .unwrap();
    }
    engine
        .create_item(ids[5], new_item("SKU-W2", 0, &[(w2, 50)]), "t")
        .await
        .unwrap();

    let filter = ItemFilter { page: 3, page_size: 2, ..Default::default() };
    let (page, total) = engine.list_items(&filter).await.unwrap();
    assert_eq!(total, 6);
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].sku, "SKU-4");

    let low = ItemFilter { low_stock_only: true, ..Default::default() };
    let (items, total) = engine.list_items(&low).await.unwrap();
    let skus: Vec<&str> = items.iter().map(|i| i.sku.as_str()).collect();
    assert_eq!(skus, vec!["SKU-0", "SKU-1"]);
    assert_eq!(total, 2);

    let in_w2 = ItemFilter { warehouse_id: Some(w2), ..Default::default() };
    assert_eq!(engine.list_items(&in_w2).await.unwrap().1, 1);

    let out = ItemFilter { status: Some(StockStatus::OutOfStock), ..Default::default() };
    assert_eq!(engine.list_items(&out).await.unwrap().0[0].sku, "SKU-0");

    let huge = ItemFilter { page_size: 10_000, ..Default::default() };
    assert_eq!(engine.list_items(&huge).await.unwrap().0.len(), 6);

    let zero = ItemFilter { page: 0, ..Default::default() };
    assert_eq!(engine.list_items(&zero).await.unwrap_err().kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn warehouses_listed_by_priority_then_name() {
    let engine = new_engine("warehouse_order.wal");
    warehouse(&engine, "C", 1).await;
    warehouse(&engine, "B", 7).await;
    let a = warehouse(&engine, "A", 7).await;
    engine
        .update_warehouse(
            a,
            WarehouseUpdate {
                is_active: Some(false),
                address: Some(Address { city: Some("Bergen".into()), ..Default::default() }),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let codes: Vec<String> = engine.list_warehouses(None).into_iter().map(|w| w.code).collect();
    assert_eq!(codes, vec!["A", "B", "C"]);
    let active: Vec<String> = engine.list_warehouses(Some(true)).into_iter().map(|w| w.code).collect();
    assert_eq!(active, vec!["B", "C"]);

    let w = engine.get_warehouse_by_code("A").unwrap();
    assert_eq!(w.address.city.as_deref(), Some("Bergen"));
    assert!(!w.is_active);
    assert_eq!(engine.get_warehouse_by_code("Z").unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(engine.get_warehouse(&Ulid::new()).unwrap_err().kind(), ErrorKind::NotFound);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_rebuilds_identical_state() {
    let path = test_wal_path("replay.wal");
    let (ids, reservations, warehouses) = {
        let engine = open(&path);
        let w1 = warehouse(&engine, "W1", 10).await;
        let w2 = warehouse(&engine, "W2", 5).await;
        let a = item(&engine, "SKU-A", &[(w1, 5), (w2, 20)]).await;
        let b = item(&engine, "SKU-B", &[(w2, 4)]).await;

        let r1 = engine.reserve_inventory(request(&[(a, 8), (b, 1)], "o-1"), "shop").await.unwrap();
        let r2 = engine.reserve_inventory(request(&[(a, 2)], "o-2"), "shop").await.unwrap();
        engine.confirm_reservation(r1.id, "shop").await.unwrap();
        engine.cancel_reservation(r2.id, "shop").await.unwrap();
        engine.bulk_update_inventory(vec![bulk_line("SKU-B", 6)], "ops").await.unwrap();
        engine
            .update_item(b, ItemUpdate { reorder_point: Some(9), ..Default::default() })
            .await
            .unwrap();

        let mut snapshot = Vec::new();
        for id in [a, b] {
            snapshot.push((info(&engine, id).await, engine.list_transactions(id).await.unwrap()));
        }
        let reservations = vec![
            engine.get_reservation(&r1.id).unwrap(),
            engine.get_reservation(&r2.id).unwrap(),
        ];
        (snapshot, reservations, engine.list_warehouses(None))
    };

    let engine = open(&path);
    for (before, ledger) in &ids {
        assert_eq!(&info(&engine, before.id).await, before);
        assert_eq!(&engine.list_transactions(before.id).await.unwrap(), ledger);
    }
    for r in &reservations {
        assert_eq!(&engine.get_reservation(&r.id).unwrap(), r);
    }
    assert_eq!(engine.list_warehouses(None), warehouses);
    assert_consistent(&engine).await;

    // Uniqueness indexes are rebuilt too.
    let err = engine.create_item(Ulid::new(), new_item("SKU-A", 0, &[]), "t").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
}

#[tokio::test]
async fn compaction_keeps_state_and_prunes_old_reservations() {
    let path = test_wal_path("compact_engine.wal");
    let (item_before, pending_id, cancelled_id) = {
        let engine = open(&path);
        let w1 = warehouse(&engine, "W1", 1).await;
        let id = item(&engine, "SKU-1", &[(w1, 10)]).await;
        let cancelled = engine.reserve_inventory(request(&[(id, 3)], "o-1"), "shop").await.unwrap();
        engine.cancel_reservation(cancelled.id, "shop").await.unwrap();
        let pending = engine.reserve_inventory(request(&[(id, 2)], "o-2"), "shop").await.unwrap();
        assert!(engine.wal_appends_since_compact().await > 0);

        let later = now_ms() + engine.config().retention_ms + MINUTE_MS;
        engine.compact_at(later).await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(
            engine.get_reservation(&cancelled.id).unwrap_err().kind(),
            ErrorKind::ReservationNotFound
        );

        engine.bulk_update_inventory(vec![bulk_line("SKU-1", 1)], "ops").await.unwrap();
        (info(&engine, id).await, pending.id, cancelled.id)
    };

    let engine = open(&path);
    assert_eq!(info(&engine, item_before.id).await, item_before);
    assert_eq!(engine.list_transactions(item_before.id).await.unwrap().len(), 5);
    assert_eq!(engine.get_reservation(&pending_id).unwrap().status, ReservationStatus::Pending);
    assert!(engine.get_reservation(&cancelled_id).is_err());

    // The surviving pending reservation still resolves normally.
    engine.cancel_reservation(pending_id, "shop").await.unwrap();
    assert_eq!(info(&engine, item_before.id).await.available_quantity, 11);
}

#[tokio::test]
async fn compaction_archives_old_ledger_rows() {
    let path = test_wal_path("compact_ledger.wal");
    let (id, before) = {
        let engine = open(&path);
        let w1 = warehouse(&engine, "W1", 1).await;
        let id = item(&engine, "SKU-1", &[(w1, 10)]).await;
        let r = engine.reserve_inventory(request(&[(id, 3)], "o-1"), "shop").await.unwrap();
        engine.cancel_reservation(r.id, "shop").await.unwrap();

        let later = now_ms() + engine.config().retention_ms + MINUTE_MS;
        engine.compact_at(later).await.unwrap();
        let resident = engine.store.get_item(&id).unwrap().read().await.ledger.len();
        assert_eq!(resident, 0);

        engine.bulk_update_inventory(vec![bulk_line("SKU-1", 1)], "ops").await.unwrap();
        let rows = engine.list_transactions(id).await.unwrap();
        let kinds: Vec<TransactionType> = rows.iter().map(|t| t.transaction_type).collect();
        assert_eq!(
            kinds,
            vec![
                TransactionType::Receive,
                TransactionType::Reserve,
                TransactionType::Release,
                TransactionType::Receive,
            ]
        );
        (id, rows)
    };

    let engine = open(&path);
    assert_eq!(engine.list_transactions(id).await.unwrap(), before);
    let resident = engine.store.get_item(&id).unwrap().read().await.ledger.len();
    assert_eq!(resident, 1);
    assert_eq!(info(&engine, id).await.total_quantity, 11);
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reserves_never_oversell() {
    let engine = Arc::new(new_engine("hot_sku.wal"));
    let w1 = warehouse(&engine, "W1", 1).await;
    let id = item(&engine, "HOT", &[(w1, 10)]).await;

    let mut handles = Vec::new();
    for i in 0..25 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .reserve_inventory(request(&[(id, 1)], &format!("order-{i}")), "shop")
                .await
        }));
    }
    let mut placed = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => placed += 1,
            Err(e) => assert_eq!(e.kind(), ErrorKind::InsufficientInventory),
        }
    }
    assert_eq!(placed, 10);
    let it = info(&engine, id).await;
    assert_eq!((it.available_quantity, it.reserved_quantity), (0, 10));
    assert_consistent(&engine).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn confirm_and_cancel_race_resolves_once() {
    let engine = Arc::new(new_engine("resolve_race.wal"));
    let w1 = warehouse(&engine, "W1", 1).await;
    let id = item(&engine, "SKU-1", &[(w1, 10)]).await;
    let r = engine.reserve_inventory(request(&[(id, 4)], "o-1"), "shop").await.unwrap();

    let e1 = engine.clone();
    let e2 = engine.clone();
    let rid = r.id;
    let confirm = tokio::spawn(async move { e1.confirm_reservation(rid, "shop").await });
    let cancel = tokio::spawn(async move { e2.cancel_reservation(rid, "shop").await });
    let results = [confirm.await.unwrap(), cancel.await.unwrap()];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);

    let it = info(&engine, id).await;
    assert_eq!(it.reserved_quantity, 0);
    assert!(it.total_quantity == 6 || it.total_quantity == 10);
    assert_consistent(&engine).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_with_same_id_admit_one() {
    let engine = Arc::new(new_engine("create_race.wal"));
    let w1 = warehouse(&engine, "W1", 1).await;

    for round in 0..20 {
        let id = Ulid::new();
        let (sku_a, sku_b) = (format!("A{round}"), format!("B{round}"));
        let (ea, eb) = (engine.clone(), engine.clone());
        let (na, nb) = (new_item(&sku_a, 0, &[(w1, 5)]), new_item(&sku_b, 0, &[(w1, 7)]));
        let a = tokio::spawn(async move { ea.create_item(id, na, "t").await });
        let b = tokio::spawn(async move { eb.create_item(id, nb, "t").await });
        let results = [a.await.unwrap(), b.await.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1, "round {round}");
        let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert_eq!(loser.kind(), ErrorKind::AlreadyExists);

        let winner = results.iter().find_map(|r| r.as_ref().ok()).unwrap();
        let (won, lost) = if winner.sku == sku_a { (&sku_a, &sku_b) } else { (&sku_b, &sku_a) };
        assert_eq!(engine.resolve_item(&ItemKey::Sku(won.clone())), Some(id));
        assert_eq!(engine.resolve_item(&ItemKey::Sku(lost.clone())), None);
        let stored = info(&engine, id).await;
        assert_eq!(stored.sku, *won);
        assert_eq!(stored.total_quantity, winner.total_quantity);
        assert_eq!(engine.list_transactions(id).await.unwrap().len(), 1);
    }
    assert_consistent(&engine).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn confirm_and_expiry_race_resolves_once() {
    let engine = Arc::new(new_engine("expire_race.wal"));
    let w1 = warehouse(&engine, "W1", 1).await;
    let id = item(&engine, "SKU-1", &[(w1, 100)]).await;

    for round in 0..10 {
        let reference = format!("race-{round}");
        let r = engine.reserve_inventory(request(&[(id, 2)], &reference), "shop").await.unwrap();
        // The sweeper's clock says the reservation is due; the wall clock
        // used by confirm says it is not. Lock order decides.
        let due = r.expiration_time;
        let (ec, es) = (engine.clone(), engine.clone());
        let rid = r.id;
        let confirm = tokio::spawn(async move { ec.confirm_reservation(rid, "shop").await });
        let expire = tokio::spawn(async move { es.expire_reservation(rid, "sweeper", due).await });
        let confirmed = confirm.await.unwrap();
        let expired = expire.await.unwrap();

        match (&confirmed, &expired) {
            (Ok(_), Err(e)) => assert_eq!(e.kind(), ErrorKind::ReservationInvalidState),
            (Err(e), Ok(_)) => assert_eq!(e.kind(), ErrorKind::ReservationExpired),
            other => panic!("round {round}: expected exactly one winner, got {other:?}"),
        }

        let resolutions = engine
            .list_transactions(id)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.reference_id.as_deref() == Some(reference.as_str()))
            .filter(|t| {
                matches!(t.transaction_type, TransactionType::Confirm | TransactionType::Release)
            })
            .count();
        assert_eq!(resolutions, 1, "round {round}");
    }

    assert_eq!(info(&engine, id).await.reserved_quantity, 0);
    assert_consistent(&engine).await;
}

#[tokio::test]
async fn committed_changes_are_published_per_item() {
    let engine = new_engine("notify.wal");
    let w1 = warehouse(&engine, "W1", 1).await;
    let id = item(&engine, "SKU-1", &[(w1, 10)]).await;

    let mut rx = engine.notify.subscribe(id);
    let r = engine.reserve_inventory(request(&[(id, 1)], "o-1"), "shop").await.unwrap();
    match rx.recv().await.unwrap() {
        Event::ReservationPlaced { reservation, .. } => assert_eq!(reservation.id, r.id),
        other => panic!("expected ReservationPlaced, got {other:?}"),
    }
}
