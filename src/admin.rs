//! Staff reservation management.
//!
//! Every mutation leaves a one-shot notice and sends staff back to the list
//! they came from.

use serde::Serialize;
use tracing::{info, warn};
use ulid::Ulid;

use crate::app::App;
use crate::calendar::MonthKey;
use crate::forms;
use crate::model::GuestDetails;
use crate::observability::VALIDATION_FAILURES_TOTAL;
use crate::outcome::{Outcome, Page, Route};
use crate::session::Session;
use crate::store::StorageError;

/// The screen an admin action was started from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ListSource {
    New,
    All,
    Calendar(MonthKey),
}

impl ListSource {
    pub fn route(&self) -> Route {
        match self {
            ListSource::New => Route::AdminNew,
            ListSource::All => Route::AdminAll,
            ListSource::Calendar(month) => Route::AdminCalendar(*month),
        }
    }
}

pub async fn list_all(app: &App) -> Result<Outcome, StorageError> {
    let reservations = app.repo.all_reservations().await?;
    Ok(Outcome::Render(Page::Reservations { src: ListSource::All, reservations }))
}

/// Reservations nobody has processed yet.
pub async fn list_new(app: &App) -> Result<Outcome, StorageError> {
    let reservations = app.repo.new_reservations().await?;
    Ok(Outcome::Render(Page::Reservations { src: ListSource::New, reservations }))
}

fn missing(session: &mut Session, src: ListSource, id: Ulid) -> Outcome {
    warn!(reservation = %id, "reservation not found");
    session.error("Can't find reservation");
    Outcome::Redirect(src.route())
}

pub async fn show(app: &App, session: &mut Session, src: ListSource, id: Ulid) -> Result<Outcome, StorageError> {
    match app.repo.get_reservation(id).await {
        Ok(reservation) => Ok(Outcome::Render(Page::ShowReservation {
            src,
            reservation,
            errors: forms::FormErrors::default(),
        })),
        Err(StorageError::NotFound(_)) => Ok(missing(session, src, id)),
        Err(e) => Err(e),
    }
}

/// Replace the guest fields. Invalid input re-renders the reservation with
/// the submitted values and per-field errors.
pub async fn edit(
    app: &App,
    session: &mut Session,
    src: ListSource,
    id: Ulid,
    guest: GuestDetails,
) -> Result<Outcome, StorageError> {
    let guest = forms::normalize(guest);
    if let Err(errors) = forms::validate_guest_details(&guest) {
        metrics::counter!(VALIDATION_FAILURES_TOTAL).increment(1);
        let mut reservation = match app.repo.get_reservation(id).await {
            Ok(reservation) => reservation,
            Err(StorageError::NotFound(_)) => return Ok(missing(session, src, id)),
            Err(e) => return Err(e),
        };
        reservation.guest = guest;
        return Ok(Outcome::Render(Page::ShowReservation { src, reservation, errors }));
    }

    match app.repo.update_reservation(id, guest).await {
        Ok(_) => {
            info!(reservation = %id, "reservation edited");
            session.flash("Changes saved");
            Ok(Outcome::Redirect(src.route()))
        }
        Err(StorageError::NotFound(_)) => Ok(missing(session, src, id)),
        Err(e) => Err(e),
    }
}

pub async fn process(app: &App, session: &mut Session, src: ListSource, id: Ulid) -> Result<Outcome, StorageError> {
    match app.repo.mark_processed(id, true).await {
        Ok(()) => {
            info!(reservation = %id, "reservation processed");
            session.flash("Reservation marked as processed");
            Ok(Outcome::Redirect(src.route()))
        }
        Err(StorageError::NotFound(_)) => Ok(missing(session, src, id)),
        Err(e) => Err(e),
    }
}

/// Delete a reservation and the restriction holding its dates.
pub async fn delete(app: &App, session: &mut Session, src: ListSource, id: Ulid) -> Result<Outcome, StorageError> {
    match app.repo.delete_reservation(id).await {
        Ok(()) => {
            info!(reservation = %id, "reservation deleted");
            session.flash("Reservation deleted");
            Ok(Outcome::Redirect(src.route()))
        }
        Err(StorageError::NotFound(_)) => Ok(missing(session, src, id)),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::NaiveDate;

    use crate::forms::EMAIL;
    use crate::model::{DateSpan, Reservation, Room, RoomRestriction};
    use crate::notify;
    use crate::session::Notice;
    use crate::store::Store;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn guest(first: &str, email: &str) -> GuestDetails {
        GuestDetails {
            first_name: first.into(),
            last_name: "Doe".into(),
            email: email.into(),
            phone: "555-0100".into(),
        }
    }

    async fn setup(name: &str) -> (App, Arc<Store>, Room) {
        let dir = std::env::temp_dir().join("bookings_test_admin");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);

        let store = Arc::new(Store::open(&path, Duration::from_secs(3)).unwrap());
        let room = Room { id: Ulid::new(), name: "General's Quarters".into() };
        store.create_room(room.clone()).await.unwrap();
        let (mailer, _outbox) = notify::queue(4, "desk@example.com", "owner@example.com");
        (App::new(store.clone(), mailer), store, room)
    }

    async fn book(store: &Store, room: &Room, start: &str, end: &str) -> Reservation {
        let r = Reservation::new(guest("Jane", "jane@example.com"), DateSpan::new(d(start), d(end)), room);
        store.commit_reservation(r.clone(), RoomRestriction::for_reservation(&r)).await.unwrap()
    }

    #[tokio::test]
    async fn process_moves_reservation_out_of_new_list() {
        let (app, store, room) = setup("process.wal").await;
        let first = book(&store, &room, "2024-06-01", "2024-06-03").await;
        let second = book(&store, &room, "2024-06-05", "2024-06-07").await;
        let mut session = Session::new();

        let outcome = process(&app, &mut session, ListSource::New, first.id).await.unwrap();
        assert_eq!(outcome, Outcome::Redirect(Route::AdminNew));
        assert_eq!(session.take_notice(Notice::Flash).as_deref(), Some("Reservation marked as processed"));

        let Outcome::Render(Page::Reservations { src, reservations }) = list_new(&app).await.unwrap() else {
            panic!("expected list")
        };
        assert_eq!(src, ListSource::New);
        assert_eq!(reservations.iter().map(|r| r.id).collect::<Vec<_>>(), vec![second.id]);

        let Outcome::Render(Page::Reservations { reservations, .. }) = list_all(&app).await.unwrap() else {
            panic!("expected list")
        };
        assert_eq!(reservations.len(), 2);
        assert!(reservations.iter().find(|r| r.id == first.id).unwrap().processed);
    }

    #[tokio::test]
    async fn edit_validates_like_guest_form() {
        let (app, store, room) = setup("edit.wal").await;
        let r = book(&store, &room, "2024-06-01", "2024-06-03").await;
        let mut session = Session::new();

        let outcome = edit(&app, &mut session, ListSource::All, r.id, guest("Jane", "invalid@email."))
            .await
            .unwrap();
        let Outcome::Render(Page::ShowReservation { reservation, errors, .. }) = outcome else {
            panic!("expected re-render")
        };
        assert!(errors.get(EMAIL).is_some());
        assert_eq!(reservation.guest.email, "invalid@email.");
        assert_eq!(store.get_reservation(&r.id).unwrap().guest.email, "jane@example.com");

        let outcome = edit(&app, &mut session, ListSource::All, r.id, guest(" Janet ", "janet@example.com"))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Redirect(Route::AdminAll));
        assert_eq!(session.take_notice(Notice::Flash).as_deref(), Some("Changes saved"));
        let stored = store.get_reservation(&r.id).unwrap();
        assert_eq!(stored.guest.first_name, "Janet");
        assert_eq!(stored.span, r.span);
    }

    #[tokio::test]
    async fn delete_frees_the_dates() {
        let (app, store, room) = setup("delete.wal").await;
        let r = book(&store, &room, "2024-06-01", "2024-06-03").await;
        assert!(!app.repo.is_room_free(room.id, r.span).await.unwrap());

        let june = MonthKey::new(2024, 6).unwrap();
        let mut session = Session::new();
        let outcome = delete(&app, &mut session, ListSource::Calendar(june), r.id).await.unwrap();
        assert_eq!(outcome, Outcome::Redirect(Route::AdminCalendar(june)));
        assert!(app.repo.is_room_free(room.id, r.span).await.unwrap());
        assert!(store.get_reservation(&r.id).is_none());
    }

    #[tokio::test]
    async fn unknown_reservation_redirects_with_error() {
        let (app, _store, _room) = setup("unknown.wal").await;
        let mut session = Session::new();
        let ghost = Ulid::new();

        // Notices are one slot per kind, so each is taken before the next call.
        fn assert_not_found(session: &mut Session, outcome: Outcome) {
            assert_eq!(outcome, Outcome::Redirect(Route::AdminNew));
            assert_eq!(session.take_notice(Notice::Error).as_deref(), Some("Can't find reservation"));
        }

        let outcome = show(&app, &mut session, ListSource::New, ghost).await.unwrap();
        assert_not_found(&mut session, outcome);

        let outcome = process(&app, &mut session, ListSource::New, ghost).await.unwrap();
        assert_not_found(&mut session, outcome);

        let outcome = delete(&app, &mut session, ListSource::New, ghost).await.unwrap();
        assert_not_found(&mut session, outcome);

        let outcome = edit(&app, &mut session, ListSource::New, ghost, guest("Jane", "jane@example.com"))
            .await
            .unwrap();
        assert_not_found(&mut session, outcome);
    }

    #[tokio::test]
    async fn show_renders_reservation() {
        let (app, store, room) = setup("show.wal").await;
        let r = book(&store, &room, "2024-06-01", "2024-06-03").await;
        let mut session = Session::new();
        let outcome = show(&app, &mut session, ListSource::All, r.id).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Render(Page::ShowReservation { src: ListSource::All, reservation: r, errors: Default::default() })
        );
    }
}
