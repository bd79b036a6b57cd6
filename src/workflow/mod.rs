//! Guest booking flow.
//!
//! The only state between requests is the visitor's session slot
//! `reservation`: first a [`DraftReservation`] that fills up step by step,
//! then the committed [`Reservation`] until the summary page consumes it.
//!
//! ```text
//! Empty --search--> DatesChosen --choose--> RoomChosen --submit--> DetailsEntered
//!                   book_room ------------>                 (invalid: re-render)
//! DetailsEntered --valid--> Committed --summary--> Empty
//! ```
//!
//! A missing or wrong-shaped slot is never fatal: the visitor is sent back
//! to the start with an error notice.


use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::app::App;
use crate::forms::{self, FormErrors};
use crate::limits::MAX_STAY_NIGHTS;
use crate::model::{DateSpan, GuestDetails, Reservation, Room, RoomRestriction};
use crate::observability::{BOOKING_CONFLICTS_TOTAL, SESSION_VIOLATIONS_TOTAL, VALIDATION_FAILURES_TOTAL};
use crate::outcome::{Outcome, Page, Route};
use crate::session::{Lookup, Session, SessionKey, SessionStateError};
use crate::store::StorageError;

const SLOT: &str = "reservation";

/// The slot while the booking is in progress.
pub const DRAFT: SessionKey<DraftReservation> = SessionKey::new(SLOT);
/// The same slot after commit, until the summary is shown.
pub const COMMITTED: SessionKey<Reservation> = SessionKey::new(SLOT);

/// A booking under construction. Fields fill in as the visitor advances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DraftReservation {
    pub span: DateSpan,
    pub room_id: Option<Ulid>,
    pub room_name: Option<String>,
    pub guest: GuestDetails,
}

impl DraftReservation {
    fn for_dates(span: DateSpan) -> Self {
        Self {
            span,
            room_id: None,
            room_name: None,
            guest: GuestDetails::default(),
        }
    }

    fn for_room(span: DateSpan, room: &Room) -> Self {
        Self {
            room_id: Some(room.id),
            room_name: Some(room.name.clone()),
            ..Self::for_dates(span)
        }
    }
}

/// Where a visitor's session says they are in the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingState {
    Empty,
    DatesChosen,
    RoomChosen,
    DetailsEntered,
    Committed,
}

pub fn current_state(session: &Session) -> BookingState {
    if let Lookup::Present(_) = session.get(&COMMITTED) {
        return BookingState::Committed;
    }
    match session.get(&DRAFT) {
        Lookup::Present(draft) if draft.guest != GuestDetails::default() => BookingState::DetailsEntered,
        Lookup::Present(draft) if draft.room_id.is_some() => BookingState::RoomChosen,
        Lookup::Present(_) => BookingState::DatesChosen,
        Lookup::Absent | Lookup::Malformed(_) => BookingState::Empty,
    }
}

/// Answer for the per-room "check availability" widget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomCheck {
    pub ok: bool,
    pub room_id: Ulid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub message: String,
}

fn violation(session: &mut Session, err: SessionStateError, notice: &str) -> Outcome {
    warn!(error = %err, "booking session out of sequence");
    metrics::counter!(SESSION_VIOLATIONS_TOTAL).increment(1);
    session.error(notice);
    Outcome::Redirect(Route::Home)
}

fn stay(start: NaiveDate, end: NaiveDate) -> Result<DateSpan, String> {
    let span = DateSpan::try_new(start, end).ok_or_else(|| "Departure must be after arrival".to_string())?;
    if span.nights() > MAX_STAY_NIGHTS {
        return Err(format!("Stays are limited to {MAX_STAY_NIGHTS} nights"));
    }
    Ok(span)
}

/// Look up a room, turning a missing one into a notice plus redirect.
async fn find_room(app: &App, session: &mut Session, id: Ulid, back: Route) -> Result<Result<Room, Outcome>, StorageError> {
    match app.repo.get_room(id).await {
        Ok(room) => Ok(Ok(room)),
        Err(StorageError::NotFound(_)) => {
            session.error("Can't find room");
            Ok(Err(Outcome::Redirect(back)))
        }
        Err(e) => Err(e),
    }
}

fn save_draft(session: &mut Session, draft: &DraftReservation) -> Result<(), Outcome> {
    session
        .put(&DRAFT, draft)
        .map_err(|e| violation(session, e, "Can't save reservation to session"))
}

/// `Empty → DatesChosen`: list the rooms free for the requested stay.
pub async fn search_availability(
    app: &App,
    session: &mut Session,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Outcome, StorageError> {
    let span = match stay(start, end) {
        Ok(span) => span,
        Err(notice) => {
            session.error(notice);
            return Ok(Outcome::Redirect(Route::Search));
        }
    };

    let rooms = app.repo.free_rooms(span).await?;
    if rooms.is_empty() {
        info!(%span, "no availability");
        session.remove(&DRAFT);
        session.error("No availability");
        return Ok(Outcome::Redirect(Route::Search));
    }

    if let Err(outcome) = save_draft(session, &DraftReservation::for_dates(span)) {
        return Ok(outcome);
    }
    Ok(Outcome::Render(Page::ChooseRoom { span, rooms }))
}

/// `DatesChosen → RoomChosen`.
pub async fn choose_room(app: &App, session: &mut Session, room_id: Ulid) -> Result<Outcome, StorageError> {
    let mut draft = match session.get(&DRAFT).require(SLOT) {
        Ok(draft) => draft,
        Err(e) => return Ok(violation(session, e, "Can't get reservation from session")),
    };
    let room = match find_room(app, session, room_id, Route::Search).await? {
        Ok(room) => room,
        Err(outcome) => return Ok(outcome),
    };
    if !app.repo.is_room_free(room.id, draft.span).await? {
        session.warning("That room is no longer available for your dates");
        return Ok(Outcome::Redirect(Route::Search));
    }

    draft.room_id = Some(room.id);
    draft.room_name = Some(room.name);
    if let Err(outcome) = save_draft(session, &draft) {
        return Ok(outcome);
    }
    Ok(Outcome::Redirect(Route::MakeReservation))
}

/// Direct "book now" link from a room page: straight to `RoomChosen`.
pub async fn book_room(
    app: &App,
    session: &mut Session,
    room_id: Ulid,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Outcome, StorageError> {
    let span = match stay(start, end) {
        Ok(span) => span,
        Err(notice) => {
            session.error(notice);
            return Ok(Outcome::Redirect(Route::Home));
        }
    };
    let room = match find_room(app, session, room_id, Route::Home).await? {
        Ok(room) => room,
        Err(outcome) => return Ok(outcome),
    };
    if let Err(outcome) = save_draft(session, &DraftReservation::for_room(span, &room)) {
        return Ok(outcome);
    }
    Ok(Outcome::Redirect(Route::MakeReservation))
}

pub async fn check_room(app: &App, room_id: Ulid, start: NaiveDate, end: NaiveDate) -> Result<RoomCheck, StorageError> {
    let mut check = RoomCheck {
        ok: false,
        room_id,
        start_date: start,
        end_date: end,
        message: String::new(),
    };
    let span = match stay(start, end) {
        Ok(span) => span,
        Err(notice) => {
            check.message = notice;
            return Ok(check);
        }
    };
    match app.repo.is_room_free(room_id, span).await {
        Ok(true) => check.ok = true,
        Ok(false) => check.message = "Not available for those dates".into(),
        Err(StorageError::NotFound(_)) => check.message = "Can't find room".into(),
        Err(e) => return Err(e),
    }
    Ok(check)
}

/// `RoomChosen`: the details form, pre-filled from the draft.
pub async fn show_details(app: &App, session: &mut Session) -> Result<Outcome, StorageError> {
    let mut draft = match session.get(&DRAFT).require(SLOT) {
        Ok(draft) => draft,
        Err(e) => return Ok(violation(session, e, "Can't get reservation from session")),
    };
    let Some(room_id) = draft.room_id else {
        return Ok(violation(session, SessionStateError::Missing("room"), "Please choose a room first"));
    };
    let room = match find_room(app, session, room_id, Route::Search).await? {
        Ok(room) => room,
        Err(outcome) => return Ok(outcome),
    };

    draft.room_name = Some(room.name);
    if let Err(outcome) = save_draft(session, &draft) {
        return Ok(outcome);
    }
    Ok(Outcome::Render(Page::MakeReservation { draft, errors: FormErrors::default() }))
}

/// `DetailsEntered`: validate, then commit or re-render with errors.
///
/// On commit the reservation and its restriction land in one repository
/// write that re-checks availability, the committed reservation replaces the
/// draft, and exactly two notifications are queued.
pub async fn submit_details(app: &App, session: &mut Session, guest: GuestDetails) -> Result<Outcome, StorageError> {
    let mut draft = match session.get(&DRAFT).require(SLOT) {
        Ok(draft) => draft,
        Err(e) => return Ok(violation(session, e, "Can't get reservation from session")),
    };
    let Some(room_id) = draft.room_id else {
        return Ok(violation(session, SessionStateError::Missing("room"), "Please choose a room first"));
    };

    draft.guest = forms::normalize(guest);
    if let Err(errors) = forms::validate_guest_details(&draft.guest) {
        metrics::counter!(VALIDATION_FAILURES_TOTAL).increment(1);
        if let Err(outcome) = save_draft(session, &draft) {
            return Ok(outcome);
        }
        return Ok(Outcome::Render(Page::MakeReservation { draft, errors }));
    }

    let room = match find_room(app, session, room_id, Route::Search).await? {
        Ok(room) => room,
        Err(outcome) => return Ok(outcome),
    };
    let reservation = Reservation::new(draft.guest.clone(), draft.span, &room);
    let restriction = RoomRestriction::for_reservation(&reservation);
    let reservation = match app.repo.commit_reservation(reservation, restriction).await {
        Ok(reservation) => reservation,
        Err(StorageError::Conflict { existing, span }) => {
            info!(%span, %existing, room = %room.id, "lost booking race");
            metrics::counter!(BOOKING_CONFLICTS_TOTAL).increment(1);
            session.remove(&DRAFT);
            session.error("Sorry, that room was just booked for those dates. Please search again.");
            return Ok(Outcome::Redirect(Route::Search));
        }
        Err(e) => return Err(e),
    };
    info!(reservation = %reservation.id, room = %room.id, span = %reservation.span, "reservation committed");

    if let Err(e) = session.put(&COMMITTED, &reservation) {
        return Ok(violation(session, e, "Your reservation was saved but can't be shown"));
    }
    if let Err(e) = app.mailer.reservation_committed(&reservation).await {
        error!(reservation = %reservation.id, "confirmation not queued: {e}");
    }
    Ok(Outcome::Redirect(Route::Summary))
}

/// `Committed → SummaryShown → Cleared`: the committed reservation is shown
/// once and removed.
pub fn summary(session: &mut Session) -> Outcome {
    let reservation = match session.get(&COMMITTED).require(SLOT) {
        Ok(reservation) => reservation,
        Err(e) => return violation(session, e, "Can't get reservation from session"),
    };
    session.remove(&COMMITTED);
    Outcome::Render(Page::Summary { reservation })
}
