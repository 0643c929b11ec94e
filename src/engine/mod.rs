mod access;
mod availability;
mod conflict;
mod error;
mod fleet;
mod queries;
mod rental;
mod repo;
mod reservation;
mod store;
#[cfg(test)]
mod tests;

pub use access::{can_access, ensure_access, require_staff};
pub use availability::{merge_overlapping, subtract_intervals};
pub use error::EngineError;
pub use fleet::{NewCar, NewInsurance, NewUser};
pub use rental::RentalPatch;
pub use repo::{BookingConflictPort, BookingRepository, FleetRepository};
pub use reservation::ReservationPatch;
pub use store::InMemoryStore;

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard};
use tracing::{debug, info};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::observability;
use crate::wal::Wal;

use store::Claim;

/// Exclusive right to run check-then-write on one car.
pub type CarGuard = OwnedMutexGuard<()>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// `guards` travel with the event and are dropped only after the event
    /// is durable and applied, so the next writer for that car sees it.
    Append {
        event: Event,
        guards: Vec<CarGuard>,
        response: oneshot::Sender<Result<(), EngineError>>,
    },
    Compact {
        response: oneshot::Sender<io::Result<usize>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

struct PendingAppend {
    event: Event,
    guards: Vec<CarGuard>,
    response: oneshot::Sender<Result<(), EngineError>>,
}

/// Owns the WAL and is the only writer of the store.
///
/// Waits for one append, drains whatever else is queued, refuses events
/// whose unique keys are already taken, writes the rest with a single
/// fsync, then applies them in order and answers the callers. A failed
/// flush applies nothing.
async fn wal_writer_loop(
    mut wal: Wal,
    store: Arc<InMemoryStore>,
    mut rx: mpsc::Receiver<WalCommand>,
) {
    while let Some(cmd) = rx.recv().await {
        let (event, guards, response) = match cmd {
            WalCommand::Append {
                event,
                guards,
                response,
            } => (event, guards, response),
            other => {
                handle_non_append(&mut wal, &store, other);
                continue;
            }
        };

        let mut batch = vec![PendingAppend {
            event,
            guards,
            response,
        }];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append {
                    event,
                    guards,
                    response,
                }) => batch.push(PendingAppend {
                    event,
                    guards,
                    response,
                }),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &store, batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, &store, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, store: &InMemoryStore, batch: Vec<PendingAppend>) {
    let batch = refuse_taken_claims(store, batch);
    if batch.is_empty() {
        return;
    }
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for pending in batch {
        let reply = match &result {
            Ok(()) => {
                store.apply_event(&pending.event);
                debug!(event = pending.event.label(), "committed");
                Ok(())
            }
            Err(e) => Err(EngineError::WalError(e.to_string())),
        };
        drop(pending.guards);
        let _ = pending.response.send(reply);
    }
}

/// Checks ids and emails against the store and against earlier events of
/// the same batch. Callers test uniqueness before taking a car lock, so two
/// creates on different cars can both get here with one id.
fn refuse_taken_claims(store: &InMemoryStore, batch: Vec<PendingAppend>) -> Vec<PendingAppend> {
    let mut taken: HashSet<Claim> = HashSet::new();
    let mut admitted = Vec::with_capacity(batch.len());
    for pending in batch {
        let claims = Claim::of(&pending.event);
        if let Some(claim) = claims
            .iter()
            .find(|c| taken.contains(*c) || store.is_claimed(c))
        {
            debug!(event = pending.event.label(), "refused: {claim}");
            let reason = claim.to_string();
            drop(pending.guards);
            let _ = pending.response.send(Err(EngineError::Conflict(reason)));
            continue;
        }
        taken.extend(claims);
        admitted.push(pending);
    }
    admitted
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err = None;
    for pending in batch {
        if let Err(e) = wal.append_buffered(&pending.event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so a half-written batch does not
    // leak into the next one.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, store: &InMemoryStore, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { response } => {
            // Taken inside the writer, so no append can slip between the
            // snapshot and the swap.
            let events = store.snapshot_events();
            let result = wal.compact(&events).map(|()| events.len());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// The booking core: committed state, per-car lock arena, WAL writer and
/// an injected clock.
pub struct Engine {
    pub(super) store: Arc<InMemoryStore>,
    wal_tx: mpsc::Sender<WalCommand>,
    locks: DashMap<Ulid, Arc<Mutex<()>>>,
    pub(super) clock: Arc<dyn Clock>,
}

impl Engine {
    /// Replays `wal_path` into a fresh store and starts the WAL writer.
    /// Must be called inside a tokio runtime.
    pub fn new(wal_path: PathBuf, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let store = Arc::new(InMemoryStore::new());
        for event in &events {
            store.apply_event(event);
        }
        info!(
            path = %wal_path.display(),
            events = events.len(),
            cars = store.car_count(),
            "replayed WAL"
        );

        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, store.clone(), wal_rx));

        Ok(Self {
            store,
            wal_tx,
            locks: DashMap::new(),
            clock,
        })
    }

    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Scoped acquisition of a car's booking lock. Released when the guard
    /// drops, on every exit path.
    pub(super) async fn lock_car(&self, car_id: Ulid) -> CarGuard {
        let lock = self
            .locks
            .entry(car_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Locks several cars in ascending id order.
    pub(super) async fn lock_cars(&self, car_ids: &[Ulid]) -> Vec<CarGuard> {
        let mut ids = car_ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.lock_car(id).await);
        }
        guards
    }

    pub(super) fn forget_lock(&self, car_id: &Ulid) {
        self.locks.remove(car_id);
    }

    /// Makes `event` durable, applies it, then releases `guards`.
    ///
    /// Dropping this future before the send completes leaves no trace;
    /// once sent, the commit runs to completion regardless of the caller.
    /// A creation whose id (or email) is already taken comes back as
    /// `Conflict` and is neither written nor applied.
    pub(super) async fn commit(
        &self,
        event: Event,
        guards: Vec<CarGuard>,
    ) -> Result<(), EngineError> {
        let label = event.label();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event,
                guards,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))??;
        metrics::counter!(observability::EVENTS_COMMITTED_TOTAL, "event" => label).increment(1);
        Ok(())
    }

    /// Rewrites the WAL as a snapshot of current state. Returns the number
    /// of events written.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let written = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
        Ok(written)
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
