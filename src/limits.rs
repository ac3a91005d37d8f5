//! Hard bounds on caller input. Anything past these is rejected before it
//! reaches the WAL.

pub const MAX_ITEMS: usize = 1_000_000;
pub const MAX_WAREHOUSES: usize = 10_000;

pub const MAX_SKU_LEN: usize = 128;
pub const MAX_ID_LEN: usize = 128;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CODE_LEN: usize = 32;
pub const MAX_REFERENCE_LEN: usize = 128;
pub const MAX_NOTES_LEN: usize = 1024;

/// Upper bound for any single quantity or delta. Keeps sums far from overflow.
pub const MAX_QUANTITY: i64 = 1_000_000_000;

/// Lines per reserve / bulk / availability call.
pub const MAX_BATCH_SIZE: usize = 1000;

pub const DEFAULT_RESERVATION_MINUTES: i64 = 15;
pub const MAX_RESERVATION_MINUTES: i64 = 7 * 24 * 60;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;
