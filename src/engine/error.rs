use ulid::Ulid;

use crate::model::ReservationStatus;

/// Stable classification of an engine failure that callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidInput,
    InsufficientInventory,
    ReservationExpired,
    ReservationNotFound,
    ReservationInvalidState,
    WarehouseInactive,
    InvalidQuantity,
    LimitExceeded,
    Timeout,
    Storage,
    Internal,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::AlreadyExists => "ALREADY_EXISTS",
            ErrorKind::InvalidInput => "INVALID_INPUT",
            ErrorKind::InsufficientInventory => "INSUFFICIENT_INVENTORY",
            ErrorKind::ReservationExpired => "RESERVATION_EXPIRED",
            ErrorKind::ReservationNotFound => "RESERVATION_NOT_FOUND",
            ErrorKind::ReservationInvalidState => "RESERVATION_INVALID_STATE",
            ErrorKind::WarehouseInactive => "WAREHOUSE_INACTIVE",
            ErrorKind::InvalidQuantity => "INVALID_QUANTITY",
            ErrorKind::LimitExceeded => "LIMIT_EXCEEDED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Storage => "STORAGE_ERROR",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }

    /// Transient failures. Whether a retry is safe also depends on the
    /// operation: reserve needs the same reservation id to be idempotent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::Storage)
    }
}

#[derive(Debug)]
pub enum EngineError {
    ItemNotFound(String),
    WarehouseNotFound(Ulid),
    WarehouseCodeNotFound(String),
    ReservationNotFound(Ulid),
    AlreadyExists(String),
    InvalidInput(String),
    InvalidQuantity(String),
    InsufficientInventory {
        item_id: Ulid,
        requested: i64,
        available: i64,
    },
    WarehouseInactive(Ulid),
    ReservationExpired(Ulid),
    InvalidState {
        id: Ulid,
        status: ReservationStatus,
    },
    LimitExceeded(&'static str),
    LockTimeout(Ulid),
    WalError(String),
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::ItemNotFound(_)
            | EngineError::WarehouseNotFound(_)
            | EngineError::WarehouseCodeNotFound(_) => ErrorKind::NotFound,
            EngineError::ReservationNotFound(_) => ErrorKind::ReservationNotFound,
            EngineError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            EngineError::InvalidInput(_) => ErrorKind::InvalidInput,
            EngineError::InvalidQuantity(_) => ErrorKind::InvalidQuantity,
            EngineError::InsufficientInventory { .. } => ErrorKind::InsufficientInventory,
            EngineError::WarehouseInactive(_) => ErrorKind::WarehouseInactive,
            EngineError::ReservationExpired(_) => ErrorKind::ReservationExpired,
            EngineError::InvalidState { .. } => ErrorKind::ReservationInvalidState,
            EngineError::LimitExceeded(_) => ErrorKind::LimitExceeded,
            EngineError::LockTimeout(_) => ErrorKind::Timeout,
            EngineError::WalError(_) => ErrorKind::Storage,
            EngineError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::ItemNotFound(key) => write!(f, "inventory item not found: {key}"),
            EngineError::WarehouseNotFound(id) => write!(f, "warehouse not found: {id}"),
            EngineError::WarehouseCodeNotFound(code) => write!(f, "warehouse not found: code {code}"),
            EngineError::ReservationNotFound(id) => write!(f, "reservation not found: {id}"),
            EngineError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::InvalidQuantity(msg) => write!(f, "invalid quantity: {msg}"),
            EngineError::InsufficientInventory {
                item_id,
                requested,
                available,
            } => write!(
                f,
                "insufficient inventory for item {item_id}: requested {requested}, available {available}"
            ),
            EngineError::WarehouseInactive(id) => write!(f, "warehouse inactive: {id}"),
            EngineError::ReservationExpired(id) => write!(f, "reservation expired: {id}"),
            EngineError::InvalidState { id, status } => write!(
                f,
                "reservation in invalid state: {id} is {}",
                status.as_str()
            ),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::LockTimeout(id) => write!(f, "timed out waiting for item lock: {id}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
            EngineError::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
