mod availability;
mod conflict;
mod error;
mod lifecycle;
mod queries;
mod window;

pub use availability::{ProjectionPolicy, project, project_table};
pub use conflict::{find_conflicts, table_conflicts};
pub use error::{EngineError, ErrorKind};
pub use lifecycle::{ConfirmOutcome, ConfirmStatus, TableUnlinkOutcome};
pub use queries::ReservationFilter;
pub use window::{BusinessHours, parse_date, parse_timestamp, validate, validate_request};

pub(crate) use conflict::now_ms;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::Dispatcher;
use crate::wal::Wal;

pub type SharedTableState = Arc<RwLock<TableState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCheckpoint {
        response: oneshot::Sender<u64>,
    },
    /// Commit and stop. Later sends fail.
    Shutdown {
        response: oneshot::Sender<io::Result<()>>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single commit (fsync) for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut pending = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            // flush what we have before compaction sees the file
                            pending = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = pending {
                    if !handle_non_append(&mut wal, other) {
                        break;
                    }
                }
            }
            other => {
                if !handle_non_append(&mut wal, other) {
                    break;
                }
            }
        }
    }
    info!("reservation log writer stopped");
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.stage(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always commit, so partially staged bytes don't leak into the next batch.
    let flush_err = wal.commit().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
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

/// Returns false once the writer must stop.
fn handle_non_append(wal: &mut Wal, cmd: WalCommand) -> bool {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_checkpoint(wal.path(), &events).and_then(|()| wal.install_checkpoint());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCheckpoint { response } => {
            let _ = response.send(wal.appends_since_checkpoint());
        }
        WalCommand::Append { event, response } => {
            let result = wal.stage(&event).and_then(|()| wal.commit());
            let _ = response.send(result);
        }
        WalCommand::Shutdown { response } => {
            let _ = response.send(wal.commit());
            return false;
        }
    }
    true
}

// ── Table locks ──────────────────────────────────────────

/// Write guards over a set of tables, held in ascending id order.
pub(super) struct LockedTables {
    guards: Vec<OwnedRwLockWriteGuard<TableState>>,
}

impl LockedTables {
    fn position(&self, id: &Ulid) -> Option<usize> {
        self.guards.binary_search_by_key(id, |g| g.id).ok()
    }

    pub(super) fn get(&self, id: &Ulid) -> Option<&TableState> {
        self.position(id).map(|i| &*self.guards[i])
    }

    pub(super) fn get_mut(&mut self, id: &Ulid) -> Option<&mut TableState> {
        self.position(id).map(|i| &mut *self.guards[i])
    }

    pub(super) fn contains_all(&self, ids: &[Ulid]) -> bool {
        ids.iter().all(|id| self.position(id).is_some())
    }

    pub(super) fn select<'a>(&'a self, ids: &'a [Ulid]) -> impl Iterator<Item = &'a TableState> + 'a {
        ids.iter().filter_map(|id| self.get(id))
    }
}

/// Sort and dedup table ids. Every multi-table lock goes through this order.
pub(super) fn normalize_ids(ids: &[Ulid]) -> Vec<Ulid> {
    let mut ids = ids.to_vec();
    ids.sort();
    ids.dedup();
    ids
}

pub struct Engine {
    pub(super) tables: DashMap<Ulid, SharedTableState>,
    /// Reservation records. Mutated only while holding write locks on all of
    /// the reservation's tables.
    pub(super) reservations: DashMap<Ulid, Reservation>,
    /// Confirmation token → reservation id.
    pub(super) tokens: DashMap<String, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Held by table creation and deletion and by compaction, so a checkpoint
    /// never misses a table event logged while it was being built.
    pub(super) provisioning: Mutex<()>,
    pub(super) dispatcher: Arc<Dispatcher>,
    pub hours: BusinessHours,
}

/// Tables whose interval lists an event touches. Needs the record state from
/// before the event.
fn event_table_ids(event: &Event, reservations: &DashMap<Ulid, Reservation>) -> Vec<Ulid> {
    let existing = |id: &Ulid| {
        reservations
            .get(id)
            .map(|r| r.table_ids.clone())
            .unwrap_or_default()
    };
    match event {
        Event::ReservationCreated { table_ids, .. } => table_ids.clone(),
        Event::ReservationUpdated { id, table_ids, .. } => {
            let mut all = existing(id);
            all.extend_from_slice(table_ids);
            normalize_ids(&all)
        }
        Event::ReservationUnlinked { table_id, .. } => vec![*table_id],
        Event::ReservationDeleted { id } => existing(id),
        Event::ReservationConfirmed { .. }
        | Event::ReservationCancelled { .. }
        | Event::TableCreated { .. }
        | Event::TableDeleted { .. } => Vec::new(),
    }
}

/// Apply a reservation event. The caller holds write locks on every table
/// named by [`event_table_ids`].
fn apply_event(
    tables: &mut LockedTables,
    reservations: &DashMap<Ulid, Reservation>,
    tokens: &DashMap<String, Ulid>,
    event: &Event,
) {
    match event {
        Event::ReservationCreated {
            id,
            name,
            email,
            date,
            span,
            table_ids,
            token,
            created_at,
        } => {
            for tid in table_ids {
                if let Some(t) = tables.get_mut(tid) {
                    t.insert_interval(Interval {
                        reservation_id: *id,
                        span: *span,
                    });
                }
            }
            tokens.insert(token.clone(), *id);
            reservations.insert(
                *id,
                Reservation {
                    id: *id,
                    name: name.clone(),
                    email: email.clone(),
                    date: *date,
                    span: *span,
                    table_ids: table_ids.clone(),
                    status: ReservationStatus::Pending,
                    cancel_reason: None,
                    token: token.clone(),
                    created_at: *created_at,
                },
            );
        }
        Event::ReservationConfirmed { id } => {
            if let Some(mut r) = reservations.get_mut(id) {
                r.status = ReservationStatus::Confirmed;
            }
        }
        Event::ReservationCancelled { id, reason } => {
            if let Some(mut r) = reservations.get_mut(id) {
                r.status = ReservationStatus::Cancelled;
                r.cancel_reason = Some(*reason);
            }
        }
        Event::ReservationUpdated {
            id,
            name,
            email,
            date,
            span,
            table_ids,
            status,
        } => {
            let Some(mut r) = reservations.get_mut(id) else {
                return;
            };
            for tid in &r.table_ids {
                if let Some(t) = tables.get_mut(tid) {
                    t.remove_interval(*id);
                }
            }
            for tid in table_ids {
                if let Some(t) = tables.get_mut(tid) {
                    t.insert_interval(Interval {
                        reservation_id: *id,
                        span: *span,
                    });
                }
            }
            if *status == ReservationStatus::Cancelled && r.status != ReservationStatus::Cancelled {
                r.cancel_reason = Some(CancelReason::Admin);
            }
            r.name = name.clone();
            r.email = email.clone();
            r.date = *date;
            r.span = *span;
            r.table_ids = table_ids.clone();
            r.status = *status;
        }
        Event::ReservationUnlinked { id, table_id } => {
            if let Some(t) = tables.get_mut(table_id) {
                t.remove_interval(*id);
            }
            if let Some(mut r) = reservations.get_mut(id) {
                r.table_ids.retain(|t| t != table_id);
            }
        }
        Event::ReservationDeleted { id } => {
            if let Some((_, r)) = reservations.remove(id) {
                for tid in &r.table_ids {
                    if let Some(t) = tables.get_mut(tid) {
                        t.remove_interval(*id);
                    }
                }
                tokens.remove(&r.token);
            }
        }
        // Table lifecycle is handled at the DashMap level.
        Event::TableCreated { .. } | Event::TableDeleted { .. } => {}
    }
}

impl Engine {
    /// Must be called inside a tokio runtime: spawns the WAL writer.
    pub fn new(wal_path: PathBuf, dispatcher: Arc<Dispatcher>, hours: BusinessHours) -> io::Result<Self> {
        let (wal, recovery) = Wal::open(&wal_path)?;
        if recovery.discarded > 0 {
            warn!(bytes = recovery.discarded, "discarded torn tail of reservation log");
        }
        let (tables, reservations) = recovery.live_counts();
        info!(events = recovery.events.len(), tables, reservations, "reservation log replayed");
        let events = recovery.events;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            tables: DashMap::new(),
            reservations: DashMap::new(),
            tokens: DashMap::new(),
            wal_tx,
            provisioning: Mutex::new(()),
            dispatcher,
            hours,
        };

        // We're the sole owner of these Arcs, so try_write always succeeds.
        // Never use blocking_write here: this runs inside an async context.
        for event in &events {
            match event {
                Event::TableCreated {
                    id,
                    label,
                    geometry,
                    capacity,
                } => {
                    let ts = TableState::new(*id, label.clone(), *geometry, *capacity);
                    engine.tables.insert(*id, Arc::new(RwLock::new(ts)));
                }
                Event::TableDeleted { id } => {
                    engine.tables.remove(id);
                }
                other => {
                    let ids = event_table_ids(other, &engine.reservations);
                    let mut guards = Vec::with_capacity(ids.len());
                    for tid in normalize_ids(&ids) {
                        let Some(arc) = engine.get_table(&tid) else {
                            continue;
                        };
                        match arc.try_write_owned() {
                            Ok(g) => guards.push(g),
                            Err(_) => warn!("replay: table {tid} unexpectedly locked"),
                        }
                    }
                    let mut locked = LockedTables { guards };
                    apply_event(&mut locked, &engine.reservations, &engine.tokens, other);
                }
            }
        }

        engine.prune_links_unshared(now_ms());
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
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

    /// Commit and stop the WAL writer. Every later mutation fails with a
    /// storage error; reads keep working.
    pub async fn close_wal(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        if self.wal_tx.send(WalCommand::Shutdown { response: tx }).await.is_err() {
            return Ok(());
        }
        match rx.await {
            Ok(result) => result.map_err(|e| EngineError::WalError(e.to_string())),
            // writer already gone
            Err(_) => Ok(()),
        }
    }

    pub fn get_table(&self, id: &Ulid) -> Option<SharedTableState> {
        self.tables.get(id).map(|e| e.value().clone())
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// WAL-append then apply. A failed append leaves memory untouched.
    pub(super) async fn persist_and_apply(&self, tables: &mut LockedTables, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_event(tables, &self.reservations, &self.tokens, event);
        Ok(())
    }

    /// Acquire write locks on `ids` in ascending order. Deleted tables are NotFound.
    pub(super) async fn lock_tables(&self, ids: &[Ulid]) -> Result<LockedTables, EngineError> {
        let ids = normalize_ids(ids);
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let table = self.get_table(&id).ok_or_else(|| EngineError::table_not_found(id))?;
            let guard = table.write_owned().await;
            if guard.retired {
                return Err(EngineError::table_not_found(id));
            }
            guards.push(guard);
        }
        Ok(LockedTables { guards })
    }

    /// Lock every table of a reservation (plus `extra`), then return the
    /// record as seen under those locks. Retries if the reservation's table
    /// set changed while we were waiting.
    pub(super) async fn lock_reservation(
        &self,
        id: Ulid,
        extra: &[Ulid],
    ) -> Result<(Reservation, LockedTables), EngineError> {
        loop {
            let before = self.reservation(&id).ok_or_else(|| EngineError::reservation_not_found(id))?;
            let mut wanted = before.table_ids.clone();
            wanted.extend_from_slice(extra);

            let locked = match self.lock_tables(&wanted).await {
                Ok(locked) => locked,
                Err(e) => {
                    let latest = self.reservation(&id).ok_or_else(|| EngineError::reservation_not_found(id))?;
                    if latest.table_ids != before.table_ids {
                        continue;
                    }
                    return Err(e);
                }
            };

            let current = self.reservation(&id).ok_or_else(|| EngineError::reservation_not_found(id))?;
            if locked.contains_all(&current.table_ids) {
                return Ok((current, locked));
            }
        }
    }

    /// Push a fresh floor projection of each table to live subscribers.
    pub(super) async fn publish_tables(&self, ids: &[Ulid], now: Ms) {
        for id in normalize_ids(ids) {
            if let Ok(view) = self.table_view(id, now, ProjectionPolicy::Floor).await {
                self.dispatcher.publish_table(&view);
            }
        }
    }
}
