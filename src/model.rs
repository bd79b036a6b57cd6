use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open stay `[start, end)`: `end` is the checkout day and is not occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateSpan {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateSpan {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start < end, "DateSpan start must be before end");
        Self { start, end }
    }

    /// Checked constructor for caller-supplied dates.
    pub fn try_new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    /// A one-day span starting at `day`.
    pub fn single_day(day: NaiveDate) -> Self {
        let end = day.checked_add_days(Days::new(1)).unwrap_or(NaiveDate::MAX);
        Self { start: day, end }
    }

    pub fn nights(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn overlaps(&self, other: &DateSpan) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_day(&self, day: NaiveDate) -> bool {
        self.start <= day && day < self.end
    }

    /// Every occupied day, `start` up to but excluding `end`.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d < end)
    }

    /// Intersection with `other`, if any.
    pub fn clamp_to(&self, other: &DateSpan) -> Option<DateSpan> {
        DateSpan::try_new(self.start.max(other.start), self.end.min(other.end))
    }
}

impl std::fmt::Display for DateSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub name: String,
}

/// Why a room is unavailable. The numeric codes match the restriction table
/// the admin screens have always shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RestrictionKind {
    Reservation,
    OwnerBlock,
}

impl RestrictionKind {
    pub fn code(&self) -> u8 {
        match self {
            RestrictionKind::Reservation => 1,
            RestrictionKind::OwnerBlock => 2,
        }
    }
}

/// A date range during which a room cannot be booked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRestriction {
    pub id: Ulid,
    pub room_id: Ulid,
    pub span: DateSpan,
    /// `None` for administrative blocks.
    pub reservation_id: Option<Ulid>,
    pub kind: RestrictionKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RoomRestriction {
    pub fn for_reservation(reservation: &Reservation) -> Self {
        Self {
            id: Ulid::new(),
            room_id: reservation.room_id,
            span: reservation.span,
            reservation_id: Some(reservation.id),
            kind: RestrictionKind::Reservation,
            created_at: reservation.created_at,
            updated_at: reservation.created_at,
        }
    }

    /// Single-day owner block, the only shape the calendar creates.
    pub fn block(room_id: Ulid, day: NaiveDate) -> Self {
        let now = Utc::now();
        Self {
            id: Ulid::new(),
            room_id,
            span: DateSpan::single_day(day),
            reservation_id: None,
            kind: RestrictionKind::OwnerBlock,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_block(&self) -> bool {
        self.reservation_id.is_none()
    }
}

/// Contact fields a guest (or staff member) types into the reservation form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestDetails {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub guest: GuestDetails,
    pub span: DateSpan,
    pub room_id: Ulid,
    pub room_name: String,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn new(guest: GuestDetails, span: DateSpan, room: &Room) -> Self {
        let now = Utc::now();
        Self {
            id: Ulid::new(),
            guest,
            span,
            room_id: room.id,
            room_name: room.name.clone(),
            processed: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-room state held by the store.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    /// Reservation-backed restrictions and blocks, sorted by `span.start`.
    pub restrictions: Vec<RoomRestriction>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            restrictions: Vec::new(),
        }
    }

    /// Insert restriction maintaining sort order by span.start.
    pub fn insert_restriction(&mut self, restriction: RoomRestriction) {
        let pos = self
            .restrictions
            .binary_search_by_key(&restriction.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.restrictions.insert(pos, restriction);
    }

    pub fn remove_restriction(&mut self, id: Ulid) -> Option<RoomRestriction> {
        let pos = self.restrictions.iter().position(|r| r.id == id)?;
        Some(self.restrictions.remove(pos))
    }

    /// Remove every restriction backing the given reservation.
    pub fn remove_for_reservation(&mut self, reservation_id: Ulid) -> Vec<RoomRestriction> {
        let mut removed = Vec::new();
        self.restrictions.retain(|r| {
            if r.reservation_id == Some(reservation_id) {
                removed.push(r.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Return only restrictions whose span overlaps the query window.
    /// Uses binary search to skip restrictions starting at or after `query.end`.
    pub fn overlapping(&self, query: &DateSpan) -> impl Iterator<Item = &RoomRestriction> {
        let right_bound = self
            .restrictions
            .partition_point(|r| r.span.start < query.end);
        self.restrictions[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }
}

/// The WAL record format. Flat, no nesting beyond the value types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        room: Room,
    },
    /// Reservation and its restriction, committed as one record.
    ReservationCommitted {
        reservation: Reservation,
        restriction: RoomRestriction,
    },
    ReservationInserted {
        reservation: Reservation,
    },
    ReservationUpdated {
        id: Ulid,
        guest: GuestDetails,
        updated_at: DateTime<Utc>,
    },
    ReservationProcessed {
        id: Ulid,
        processed: bool,
        updated_at: DateTime<Utc>,
    },
    ReservationDeleted {
        id: Ulid,
        room_id: Ulid,
    },
    RestrictionInserted {
        restriction: RoomRestriction,
    },
    RestrictionRemoved {
        id: Ulid,
        room_id: Ulid,
    },
}
