use std::collections::HashSet;

use chrono::Utc;
use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Store, StorageError, WalCommand};

fn check_room_name(name: &str) -> Result<(), StorageError> {
    if name.trim().is_empty() {
        return Err(StorageError::LimitExceeded("room name is empty"));
    }
    if name.len() > MAX_ROOM_NAME_LEN {
        return Err(StorageError::LimitExceeded("room name too long"));
    }
    Ok(())
}

fn check_guest(guest: &GuestDetails) -> Result<(), StorageError> {
    let fields = [&guest.first_name, &guest.last_name, &guest.email, &guest.phone];
    if fields.iter().any(|f| f.len() > MAX_FIELD_LEN) {
        return Err(StorageError::LimitExceeded("guest field too long"));
    }
    Ok(())
}

fn check_stay(span: &DateSpan) -> Result<(), StorageError> {
    if span.start >= span.end {
        return Err(StorageError::LimitExceeded("stay must end after it starts"));
    }
    if span.nights() > MAX_STAY_NIGHTS {
        return Err(StorageError::LimitExceeded("stay too long"));
    }
    Ok(())
}

/// First restriction on the room overlapping `span`, blocks included.
fn first_conflict(rs: &RoomState, span: &DateSpan) -> Option<Ulid> {
    rs.overlapping(span).next().map(|r| r.id)
}

impl Store {
    pub async fn create_room(&self, room: Room) -> Result<(), StorageError> {
        check_room_name(&room.name)?;
        if self.rooms.len() >= MAX_ROOMS {
            return Err(StorageError::LimitExceeded("too many rooms"));
        }
        if self.rooms.contains_key(&room.id) {
            return Err(StorageError::AlreadyExists(room.id));
        }

        let at = self.start_clock();
        let gate = self.enter_gate(at).await?;
        self.persist(Event::RoomCreated { room }, gate, None, at).await

    }

    /// Write a reservation and the restriction backing it as one log record.
    ///
    /// Overlap is re-checked under the room's write lock, so two commits for
    /// the same dates cannot both succeed no matter what availability said
    /// when the guest searched.
    pub async fn commit_reservation(
        &self,
        reservation: Reservation,
        restriction: RoomRestriction,
    ) -> Result<Reservation, StorageError> {
        check_guest(&reservation.guest)?;
        check_stay(&reservation.span)?;
        if restriction.room_id != reservation.room_id
            || restriction.span != reservation.span
            || restriction.reservation_id != Some(reservation.id)
        {
            return Err(StorageError::LimitExceeded("restriction does not match reservation"));
        }
        if self.reservations.contains_key(&reservation.id) {
            return Err(StorageError::AlreadyExists(reservation.id));
        }

        let at = self.start_clock();
        let gate = self.enter_gate(at).await?;
        let room = self.lock_room(reservation.room_id, at).await?;
        if room.restrictions.len() >= MAX_RESTRICTIONS_PER_ROOM {
            return Err(StorageError::LimitExceeded("too many restrictions on room"));
        }
        if let Some(existing) = first_conflict(&room, &reservation.span) {
            return Err(StorageError::Conflict { existing, span: reservation.span });
        }

        let event = Event::ReservationCommitted {
            reservation: reservation.clone(),
            restriction,
        };
        self.persist(event, gate, Some(room), at).await?;
        metrics::counter!(crate::observability::RESERVATIONS_COMMITTED_TOTAL).increment(1);
        Ok(reservation)
    }

    /// Store a reservation without touching room occupancy.
    pub async fn insert_reservation(&self, reservation: Reservation) -> Result<Ulid, StorageError> {
        check_guest(&reservation.guest)?;
        check_stay(&reservation.span)?;
        if !self.rooms.contains_key(&reservation.room_id) {
            return Err(StorageError::NotFound(reservation.room_id));
        }
        if self.reservations.contains_key(&reservation.id) {
            return Err(StorageError::AlreadyExists(reservation.id));
        }
        let id = reservation.id;
        let at = self.start_clock();
        let gate = self.enter_gate(at).await?;
        self.persist(Event::ReservationInserted { reservation }, gate, None, at)
            .await?;
        Ok(id)
    }

    /// Reservation-backed restrictions are refused on overlap; owner blocks
    /// are not checked.
    pub async fn insert_restriction(&self, restriction: RoomRestriction) -> Result<Ulid, StorageError> {
        if restriction.span.start >= restriction.span.end {
            return Err(StorageError::LimitExceeded("restriction must end after it starts"));
        }
        if let Some(rid) = restriction.reservation_id
            && !self.reservations.contains_key(&rid)
        {
            return Err(StorageError::NotFound(rid));
        }

        let at = self.start_clock();
        let gate = self.enter_gate(at).await?;
        let room = self.lock_room(restriction.room_id, at).await?;
        if room.restrictions.len() >= MAX_RESTRICTIONS_PER_ROOM {
            return Err(StorageError::LimitExceeded("too many restrictions on room"));
        }
        if restriction.reservation_id.is_some()
            && let Some(existing) = first_conflict(&room, &restriction.span)
        {
            return Err(StorageError::Conflict { existing, span: restriction.span });
        }

        let id = restriction.id;
        self.persist(Event::RestrictionInserted { restriction }, gate, Some(room), at)
            .await?;
        Ok(id)
    }

    pub async fn remove_restriction(&self, id: Ulid) -> Result<(), StorageError> {
        let room_id = self
            .restriction_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(StorageError::NotFound(id))?;
        let at = self.start_clock();
        let gate = self.enter_gate(at).await?;
        let room = self.lock_room(room_id, at).await?;
        if !room.restrictions.iter().any(|r| r.id == id) {
            return Err(StorageError::NotFound(id));
        }
        self.persist(Event::RestrictionRemoved { id, room_id }, gate, Some(room), at)
            .await
    }

    pub async fn update_reservation(&self, id: Ulid, guest: GuestDetails) -> Result<Reservation, StorageError> {
        check_guest(&guest)?;
        if !self.reservations.contains_key(&id) {
            return Err(StorageError::NotFound(id));
        }
        let at = self.start_clock();
        let gate = self.enter_gate(at).await?;
        let event = Event::ReservationUpdated { id, guest, updated_at: Utc::now() };
        self.persist(event, gate, None, at).await?;
        self.reservations
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(StorageError::NotFound(id))
    }

    pub async fn mark_processed(&self, id: Ulid, processed: bool) -> Result<(), StorageError> {
        if !self.reservations.contains_key(&id) {
            return Err(StorageError::NotFound(id));
        }
        let at = self.start_clock();
        let gate = self.enter_gate(at).await?;
        let event = Event::ReservationProcessed { id, processed, updated_at: Utc::now() };
        self.persist(event, gate, None, at).await
    }

    /// Delete a reservation together with the restriction(s) it owns, which
    /// frees its dates.
    pub async fn delete_reservation(&self, id: Ulid) -> Result<(), StorageError> {
        let room_id = self
            .reservations
            .get(&id)
            .map(|r| r.room_id)
            .ok_or(StorageError::NotFound(id))?;
        let at = self.start_clock();
        let gate = self.enter_gate(at).await?;
        let room = self.lock_room(room_id, at).await?;
        self.persist(Event::ReservationDeleted { id, room_id }, gate, Some(room), at)
            .await
    }

    /// Rewrite the WAL as the minimal event set that recreates current state.
    /// Writers are held off for the duration so nothing lands between the
    /// snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<(), StorageError> {
        let _exclusive = self.gate.write().await;

        let mut events = Vec::new();
        let mut covered = HashSet::new();
        let room_states: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        for rs in room_states {
            let guard = rs.read().await;
            events.push(Event::RoomCreated { room: guard.room.clone() });
            for restriction in &guard.restrictions {
                let owner = restriction
                    .reservation_id
                    .and_then(|rid| self.reservations.get(&rid).map(|r| r.value().clone()));
                match owner {
                    Some(reservation) if covered.insert(reservation.id) => {
                        events.push(Event::ReservationCommitted {
                            reservation,
                            restriction: restriction.clone(),
                        });
                    }
                    _ => events.push(Event::RestrictionInserted {
                        restriction: restriction.clone(),
                    }),
                }
            }
        }
        for entry in self.reservations.iter() {
            if !covered.contains(entry.key()) {
                events.push(Event::ReservationInserted { reservation: entry.value().clone() });
            }
        }
        // RoomCreated must precede everything that references the room.
        events.sort_by_key(|e| !matches!(e, Event::RoomCreated { .. }));

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StorageError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StorageError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StorageError::Wal(e.to_string()))?;
        info!(events = count, "WAL compacted");
        Ok(())
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
