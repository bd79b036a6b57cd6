use async_trait::async_trait;
use ulid::Ulid;

use crate::availability;
use crate::model::*;
use crate::store::{StorageError, Store};

/// Persistence seam used by the workflow, calendar and admin screens.
///
/// Every call is bounded by the store's deadline and reports expiry as
/// `StorageError::Timeout`.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn all_rooms(&self) -> Result<Vec<Room>, StorageError>;

    async fn get_room(&self, id: Ulid) -> Result<Room, StorageError>;

    async fn restrictions_overlapping(&self, span: DateSpan) -> Result<Vec<RoomRestriction>, StorageError>;

    async fn restrictions_for_room_in_range(
        &self,
        room_id: Ulid,
        span: DateSpan,
    ) -> Result<Vec<RoomRestriction>, StorageError>;

    /// Reservation plus its restriction in one write, refused on overlap.
    async fn commit_reservation(
        &self,
        reservation: Reservation,
        restriction: RoomRestriction,
    ) -> Result<Reservation, StorageError>;

    async fn insert_reservation(&self, reservation: Reservation) -> Result<Ulid, StorageError>;

    async fn insert_restriction(&self, restriction: RoomRestriction) -> Result<Ulid, StorageError>;

    async fn remove_restriction(&self, id: Ulid) -> Result<(), StorageError>;

    async fn get_reservation(&self, id: Ulid) -> Result<Reservation, StorageError>;

    async fn all_reservations(&self) -> Result<Vec<Reservation>, StorageError>;

    async fn new_reservations(&self) -> Result<Vec<Reservation>, StorageError>;

    async fn update_reservation(&self, id: Ulid, guest: GuestDetails) -> Result<Reservation, StorageError>;

    async fn mark_processed(&self, id: Ulid, processed: bool) -> Result<(), StorageError>;

    /// Also drops the reservation's restriction, freeing its dates.
    async fn delete_reservation(&self, id: Ulid) -> Result<(), StorageError>;

    async fn is_room_free(&self, room_id: Ulid, span: DateSpan) -> Result<bool, StorageError> {
        availability::is_room_free(self, room_id, span).await
    }

    async fn free_rooms(&self, span: DateSpan) -> Result<Vec<Room>, StorageError> {
        availability::free_rooms(self, span).await
    }
}

#[async_trait]
impl Repository for Store {
    async fn all_rooms(&self) -> Result<Vec<Room>, StorageError> {
        Ok(Store::all_rooms(self))
    }

    async fn get_room(&self, id: Ulid) -> Result<Room, StorageError> {
        Store::get_room(self, &id).ok_or(StorageError::NotFound(id))
    }

    async fn restrictions_overlapping(&self, span: DateSpan) -> Result<Vec<RoomRestriction>, StorageError> {
        Store::restrictions_overlapping(self, &span).await
    }

    async fn restrictions_for_room_in_range(
        &self,
        room_id: Ulid,
        span: DateSpan,
    ) -> Result<Vec<RoomRestriction>, StorageError> {
        Store::restrictions_for_room_in_range(self, room_id, &span).await
    }

    async fn commit_reservation(
        &self,
        reservation: Reservation,
        restriction: RoomRestriction,
    ) -> Result<Reservation, StorageError> {
        Store::commit_reservation(self, reservation, restriction).await
    }

    async fn insert_reservation(&self, reservation: Reservation) -> Result<Ulid, StorageError> {
        Store::insert_reservation(self, reservation).await
    }

    async fn insert_restriction(&self, restriction: RoomRestriction) -> Result<Ulid, StorageError> {
        Store::insert_restriction(self, restriction).await
    }

    async fn remove_restriction(&self, id: Ulid) -> Result<(), StorageError> {
        Store::remove_restriction(self, id).await
    }

    async fn get_reservation(&self, id: Ulid) -> Result<Reservation, StorageError> {
        Store::get_reservation(self, &id).ok_or(StorageError::NotFound(id))
    }

    async fn all_reservations(&self) -> Result<Vec<Reservation>, StorageError> {
        Ok(Store::all_reservations(self))
    }

    async fn new_reservations(&self) -> Result<Vec<Reservation>, StorageError> {
        Ok(Store::new_reservations(self))
    }

    async fn update_reservation(&self, id: Ulid, guest: GuestDetails) -> Result<Reservation, StorageError> {
        Store::update_reservation(self, id, guest).await
    }

    async fn mark_processed(&self, id: Ulid, processed: bool) -> Result<(), StorageError> {
        Store::mark_processed(self, id, processed).await
    }

    async fn delete_reservation(&self, id: Ulid) -> Result<(), StorageError> {
        Store::delete_reservation(self, id).await
    }
}
