mod allocation;
mod availability;
mod error;
mod mutations;
mod queries;
mod status;
mod store;
#[cfg(test)]
mod tests;

pub use allocation::{allocate, sellable_quantity};
pub use error::{EngineError, ErrorKind};
pub use status::classify;
pub use store::InMemoryStore;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::limits::DEFAULT_RESERVATION_MINUTES;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::{LedgerArchive, Wal};

pub type SharedItemState = Arc<RwLock<ItemState>>;

/// Runtime knobs for the engine. `main` fills these from the environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_reservation_minutes: i64,
    /// How long a mutation waits for an item lock before giving up.
    pub lock_timeout: Duration,
    /// A sweeper claim older than this may be taken over by another worker.
    pub claim_ttl_ms: Ms,
    /// Resolved reservations older than this are dropped at compaction, and
    /// ledger rows older than this move to the ledger archive.
    pub retention_ms: Ms,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_reservation_minutes: DEFAULT_RESERVATION_MINUTES,
            lock_timeout: Duration::from_secs(5),
            claim_ttl_ms: 60_000,
            retention_ms: 7 * 24 * 60 * MINUTE_MS,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        /// Ledger rows leaving memory; archived before the snapshot is written.
        archive: Vec<Transaction>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL file. Appends that arrive while a flush is pending are
/// buffered together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so half-written bytes don't ride along
    // with the next batch.
    let flush_result = wal.flush_sync();
    match append_err {
        Some(e) => Err(e),
        None => flush_result,
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact {
            events,
            archive,
            response,
        } => {
            let result = LedgerArchive::append(&LedgerArchive::path_for(wal.path()), &archive)
                .and_then(|()| Wal::write_compact_file(wal.path(), &events))
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { response, .. } => {
            let _ = response.send(Err(io::Error::other("append routed to control path")));
        }
    }
}

// ── Item lock set ────────────────────────────────────────

/// Write guards for the items one change touches, acquired in id order, plus a
/// shared hold on the commit gate so compaction never sees a half-applied change.
#[derive(Default)]
pub(crate) struct ItemLocks {
    _gate: Option<OwnedRwLockReadGuard<()>>,
    guards: Vec<OwnedRwLockWriteGuard<ItemState>>,
}

impl ItemLocks {
    fn position(&self, id: &Ulid) -> Option<usize> {
        self.guards.binary_search_by_key(id, |g| g.id).ok()
    }

    pub(crate) fn get(&self, id: &Ulid) -> Option<&ItemState> {
        self.position(id).map(|pos| &*self.guards[pos])
    }

    pub(crate) fn get_mut(&mut self, id: &Ulid) -> Option<&mut ItemState> {
        self.position(id).map(|pos| &mut *self.guards[pos])
    }

    /// Guards must be pushed in ascending id order.
    fn push(&mut self, guard: OwnedRwLockWriteGuard<ItemState>) {
        debug_assert!(self.guards.last().is_none_or(|g| g.id < guard.id));
        self.guards.push(guard);
    }
}

pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) config: EngineConfig,
    /// Shared by every commit, exclusive for compaction.
    pub(super) commit_gate: Arc<RwLock<()>>,
    /// Serializes warehouse writes.
    pub(super) admin: Mutex<()>,
    /// Ledger rows compacted out of memory.
    pub(super) ledger_path: PathBuf,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, config: EngineConfig) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let ledger_path = LedgerArchive::path_for(&wal_path);
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: InMemoryStore::new(),
            wal_tx,
            notify,
            config,
            commit_gate: Arc::new(RwLock::new(())),
            admin: Mutex::new(()),
            ledger_path,
        };

        // Nothing else can hold these locks yet, so try_write always succeeds.
        for event in &events {
            let mut locks = ItemLocks::default();
            for id in event.touched_items() {
                if let Some(item) = engine.store.get_item(&id)
                    && let Ok(guard) = item.try_write_owned()
                {
                    locks.push(guard);
                }
            }
            engine.store.apply(&mut locks, event);
        }
        tracing::info!(
            events = events.len(),
            items = engine.store.item_count(),
            warehouses = engine.store.warehouse_count(),
            "engine state replayed"
        );

        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Take the commit gate and the write locks of `ids` (sorted, deduped).
    /// Each lock wait is bounded by the configured timeout.
    pub(super) async fn lock_items(&self, ids: &[Ulid]) -> Result<ItemLocks, EngineError> {
        let mut locks = ItemLocks {
            _gate: Some(self.commit_gate.clone().read_owned().await),
            guards: Vec::with_capacity(ids.len()),
        };
        for id in ids {
            let item = self
                .store
                .get_item(id)
                .ok_or_else(|| EngineError::ItemNotFound(id.to_string()))?;
            let guard = tokio::time::timeout(self.config.lock_timeout, item.write_owned())
                .await
                .map_err(|_| EngineError::LockTimeout(*id))?;
            locks.push(guard);
        }
        Ok(locks)
    }

    /// WAL-append, apply, notify. The caller holds every lock the event touches.
    pub(super) async fn commit(&self, locks: &mut ItemLocks, event: Event) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        self.store.apply(locks, &event);
        for id in event.touched_items() {
            self.notify.send(id, &event);
        }
        Ok(())
    }
}

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}
