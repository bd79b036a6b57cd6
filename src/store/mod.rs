mod error;
mod mutations;
mod queries;

pub use error::StorageError;

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

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
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL. Appends that arrive while a flush is
/// pending are batched behind a single fsync.
async fn wal_writer_loop(mut wal: Wal<Event>, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
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
        for (_, tx) in batch {
            let _ = tx.send(match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            });
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
    info!("WAL writer stopped");
}

fn flush_batch(wal: &mut Wal<Event>, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let appended = batch.iter().try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-buffered bytes don't leak
    // into the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal<Event>, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

// ── Event application ────────────────────────────────────

fn apply_to_reservations(reservations: &DashMap<Ulid, Reservation>, event: &Event) {
    match event {
        Event::ReservationCommitted { reservation, .. } | Event::ReservationInserted { reservation } => {
            reservations.insert(reservation.id, reservation.clone());
        }
        Event::ReservationUpdated { id, guest, updated_at } => {
            if let Some(mut r) = reservations.get_mut(id) {
                r.guest = guest.clone();
                r.updated_at = *updated_at;
            }
        }
        Event::ReservationProcessed { id, processed, updated_at } => {
            if let Some(mut r) = reservations.get_mut(id) {
                r.processed = *processed;
                r.updated_at = *updated_at;
            }
        }
        Event::ReservationDeleted { id, .. } => {
            reservations.remove(id);
        }
        Event::RoomCreated { .. } | Event::RestrictionInserted { .. } | Event::RestrictionRemoved { .. } => {}
    }
}

/// Register a newly created room. Existing entries are left alone.
fn apply_to_directory(rooms: &DashMap<Ulid, SharedRoomState>, directory: &DashMap<Ulid, Room>, event: &Event) {
    if let Event::RoomCreated { room } = event {
        directory.entry(room.id).or_insert_with(|| room.clone());
        rooms
            .entry(room.id)
            .or_insert_with(|| Arc::new(RwLock::new(RoomState::new(room.clone()))));
    }
}

/// Apply the room-scoped part of an event. Caller holds the room's lock.
fn apply_to_room(rs: &mut RoomState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ReservationCommitted { restriction, .. } | Event::RestrictionInserted { restriction } => {
            index.insert(restriction.id, restriction.room_id);
            rs.insert_restriction(restriction.clone());
        }
        Event::RestrictionRemoved { id, .. } => {
            rs.remove_restriction(*id);
            index.remove(id);
        }
        Event::ReservationDeleted { id, .. } => {
            for removed in rs.remove_for_reservation(*id) {
                index.remove(&removed.id);
            }
        }
        Event::RoomCreated { .. }
        | Event::ReservationInserted { .. }
        | Event::ReservationUpdated { .. }
        | Event::ReservationProcessed { .. } => {}
    }
}

fn event_room_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ReservationCommitted { restriction, .. } | Event::RestrictionInserted { restriction } => {
            Some(restriction.room_id)
        }
        Event::RestrictionRemoved { room_id, .. } | Event::ReservationDeleted { room_id, .. } => Some(*room_id),
        Event::RoomCreated { .. }
        | Event::ReservationInserted { .. }
        | Event::ReservationUpdated { .. }
        | Event::ReservationProcessed { .. } => None,
    }
}

/// WAL-backed in-memory repository.
///
/// Every mutation is bounded by `deadline`. A write that misses its deadline
/// reports `StorageError::Timeout` but still finishes in the background,
/// holding the room lock until the log acknowledges it, so memory and log
/// never disagree.
pub struct Store {
    pub(super) rooms: Arc<DashMap<Ulid, SharedRoomState>>,
    /// Room identity, readable without touching the room locks.
    pub(super) room_directory: Arc<DashMap<Ulid, Room>>,
    pub(super) reservations: Arc<DashMap<Ulid, Reservation>>,
    /// Restriction id → room id.
    pub(super) restriction_index: Arc<DashMap<Ulid, Ulid>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Writers share it; compaction takes it exclusively.
    pub(super) gate: Arc<RwLock<()>>,
    deadline: Duration,
}

impl Store {
    pub fn open(wal_path: &Path, deadline: Duration) -> io::Result<Self> {
        let replay = Wal::<Event>::replay(wal_path)?;
        if replay.truncated {
            warn!(path = %wal_path.display(), valid_len = replay.valid_len, "discarding torn WAL tail");
            Wal::<Event>::truncate_to(wal_path, replay.valid_len)?;
        }
        let wal = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let reservations = DashMap::new();
        let restriction_index = DashMap::new();
        let mut rooms: HashMap<Ulid, RoomState> = HashMap::new();
        for event in &replay.records {
            if let Event::RoomCreated { room } = event {
                rooms.insert(room.id, RoomState::new(room.clone()));
                continue;
            }
            apply_to_reservations(&reservations, event);
            if let Some(room_id) = event_room_id(event)
                && let Some(rs) = rooms.get_mut(&room_id)
            {
                apply_to_room(rs, event, &restriction_index);
            }
        }
        info!(
            rooms = rooms.len(),
            reservations = reservations.len(),
            events = replay.records.len(),
            "store replayed"
        );

        let room_directory: DashMap<Ulid, Room> = rooms.iter().map(|(id, rs)| (*id, rs.room.clone())).collect();
        let rooms: DashMap<Ulid, SharedRoomState> = rooms
            .into_iter()
            .map(|(id, rs)| (id, Arc::new(RwLock::new(rs))))
            .collect();
        Ok(Self {
            room_directory: Arc::new(room_directory),
            rooms: Arc::new(rooms),
            reservations: Arc::new(reservations),
            restriction_index: Arc::new(restriction_index),
            wal_tx,
            gate: Arc::new(RwLock::new(())),
            deadline,
        })
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub(super) fn start_clock(&self) -> Instant {
        Instant::now() + self.deadline
    }

    /// Run `fut`, failing closed with `Timeout` once `at` passes.
    pub(super) async fn within<T>(&self, at: Instant, fut: impl Future<Output = T>) -> Result<T, StorageError> {
        tokio::time::timeout_at(at, fut)
            .await
            .map_err(|_| StorageError::Timeout(self.deadline))
    }

    pub(super) fn get_room_state(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub(super) async fn lock_room(
        &self,
        id: Ulid,
        at: Instant,
    ) -> Result<OwnedRwLockWriteGuard<RoomState>, StorageError> {
        let rs = self.get_room_state(&id).ok_or(StorageError::NotFound(id))?;
        self.within(at, rs.write_owned()).await
    }

    pub(super) async fn enter_gate(&self, at: Instant) -> Result<OwnedRwLockReadGuard<()>, StorageError> {
        self.within(at, self.gate.clone().read_owned()).await
    }

    async fn enqueue(&self, event: Event, at: Instant) -> Result<oneshot::Receiver<io::Result<()>>, StorageError> {
        let (tx, rx) = oneshot::channel();
        self.within(at, self.wal_tx.send(WalCommand::Append { event, response: tx }))
            .await?
            .map_err(|_| StorageError::Wal("WAL writer shut down".into()))?;
        Ok(rx)
    }

    /// Log `event`, then apply it to the room directory, the reservation
    /// index and, when given, the locked room. Application happens in a detached task so it
    /// completes even if the caller's deadline fires first.
    ///
    /// Callers enter the gate before locking the room; compaction takes the
    /// gate first and room locks second, so the order must match.
    pub(super) async fn persist(
        &self,
        event: Event,
        gate: OwnedRwLockReadGuard<()>,
        room: Option<OwnedRwLockWriteGuard<RoomState>>,
        at: Instant,
    ) -> Result<(), StorageError> {
        let ack = self.enqueue(event.clone(), at).await?;
        let reservations = self.reservations.clone();
        let index = self.restriction_index.clone();
        let rooms = self.rooms.clone();
        let directory = self.room_directory.clone();

        let finish = tokio::spawn(async move {
            let _gate = gate;
            let mut room = room;
            ack.await
                .map_err(|_| StorageError::Wal("WAL writer dropped response".into()))?
                .map_err(|e| StorageError::Wal(e.to_string()))?;
            apply_to_directory(&rooms, &directory, &event);
            apply_to_reservations(&reservations, &event);
            if let Some(rs) = room.as_deref_mut() {
                apply_to_room(rs, &event, &index);
            }
            Ok(())
        });

        self.within(at, finish)
            .await?
            .map_err(|e| StorageError::Wal(format!("apply task failed: {e}")))?
    }
}
