use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::future::join_all;
use ulid::Ulid;

use bookings::admin::{self, ListSource};
use bookings::app::{self, App};
use bookings::calendar::{self, CalendarEdits, DayRef, DayState, MonthKey};
use bookings::model::GuestDetails;
use bookings::notify::{self, DispatchError, DispatchStats, Dispatcher, Notification, ShutdownMode, Transport};
use bookings::outcome::{Outcome, Page, Route};
use bookings::session::Notice;
use bookings::store::Store;
use bookings::workflow;

// ── Test infrastructure ──────────────────────────────────────

#[derive(Clone, Default)]
struct RecordingTransport {
    sent: Arc<Mutex<Vec<Notification>>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, message: &Notification) -> Result<(), DispatchError> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

struct Harness {
    app: App,
    store: Arc<Store>,
    dispatcher: Dispatcher,
    transport: RecordingTransport,
    wal_path: PathBuf,
}

async fn start(name: &str) -> Harness {
    let dir = std::env::temp_dir().join(format!("bookings_int_test_{name}_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let wal_path = dir.join("bookings.wal");

    let store = Arc::new(Store::open(&wal_path, Duration::from_secs(3)).unwrap());
    assert_eq!(app::seed_default_rooms(&store).await.unwrap(), 2);

    let (mailer, outbox) = notify::queue(32, "desk@fort-smythe.example", "owner@fort-smythe.example");
    let transport = RecordingTransport::default();
    let dispatcher = Dispatcher::spawn(transport.clone(), outbox);
    let app = App::new(store.clone(), mailer);
    Harness { app, store, dispatcher, transport, wal_path }
}

fn d(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

fn guest(first: &str, email: &str) -> GuestDetails {
    GuestDetails {
        first_name: first.into(),
        last_name: "Smith".into(),
        email: email.into(),
        phone: "555-0100".into(),
    }
}

/// Run one visitor from search to summary, loading and saving the session
/// around every step like a request would.
async fn book(app: &App, session_id: Ulid, room: Ulid, start: &str, end: &str, who: GuestDetails) -> Outcome {
    let mut session = app.sessions.load(session_id);
    let outcome = workflow::search_availability(app, &mut session, d(start), d(end)).await.unwrap();
    app.sessions.save(session_id, session);
    if !matches!(outcome, Outcome::Render(Page::ChooseRoom { .. })) {
        return outcome;
    }

    let mut session = app.sessions.load(session_id);
    let outcome = workflow::choose_room(app, &mut session, room).await.unwrap();
    app.sessions.save(session_id, session);
    if outcome != Outcome::Redirect(Route::MakeReservation) {
        return outcome;
    }

    let mut session = app.sessions.load(session_id);
    let outcome = workflow::submit_details(app, &mut session, who).await.unwrap();
    app.sessions.save(session_id, session);
    outcome
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn guest_books_and_staff_manage() {
    let h = start("flow").await;
    let rooms = h.store.all_rooms();
    let general = rooms.iter().find(|r| r.name == "General's Quarters").unwrap().clone();

    let visitor = h.app.sessions.create();
    let outcome = book(&h.app, visitor, general.id, "2024-03-10", "2024-03-15", guest("John", "john@example.com")).await;
    assert_eq!(outcome, Outcome::Redirect(Route::Summary));

    let mut session = h.app.sessions.load(visitor);
    let Outcome::Render(Page::Summary { reservation }) = workflow::summary(&mut session) else {
        panic!("expected summary")
    };
    assert_eq!(reservation.room_id, general.id);
    assert_eq!(workflow::summary(&mut session), Outcome::Redirect(Route::Home));
    h.app.sessions.save(visitor, session);

    // Staff see it as new and on the calendar.
    let Outcome::Render(Page::Reservations { reservations, .. }) = admin::list_new(&h.app).await.unwrap() else {
        panic!("expected list")
    };
    assert_eq!(reservations, vec![reservation.clone()]);

    let march = MonthKey::new(2024, 3).unwrap();
    let staff = h.app.sessions.create();
    let mut staff_session = h.app.sessions.load(staff);
    let Outcome::Render(Page::Calendar(view)) = calendar::show(&h.app, &mut staff_session, Some(march)).await.unwrap()
    else {
        panic!("expected calendar")
    };
    let map = view.rooms.iter().find(|m| m.room.id == general.id).unwrap();
    assert_eq!(map.days[&d("2024-03-14")], DayState::Reserved(reservation.id));
    assert_eq!(map.days[&d("2024-03-15")], DayState::Free);

    // Block the checkout day, then process and delete the reservation.
    let edits = CalendarEdits {
        month: march,
        remove: vec![],
        add: vec![DayRef { room_id: general.id, day: d("2024-03-15") }],
    };
    assert_eq!(calendar::submit(&h.app, &mut staff_session, edits).await, Outcome::Redirect(Route::AdminCalendar(march)));
    assert_eq!(staff_session.take_notice(Notice::Flash).as_deref(), Some("Changes saved"));

    admin::process(&h.app, &mut staff_session, ListSource::New, reservation.id).await.unwrap();
    let Outcome::Render(Page::Reservations { reservations, .. }) = admin::list_new(&h.app).await.unwrap() else {
        panic!("expected list")
    };
    assert!(reservations.is_empty());

    admin::delete(&h.app, &mut staff_session, ListSource::All, reservation.id).await.unwrap();
    assert!(h.app.repo.is_room_free(general.id, reservation.span).await.unwrap());
    assert!(!h.app.repo.is_room_free(general.id, bookings::model::DateSpan::single_day(d("2024-03-15"))).await.unwrap());

    // Exactly one confirmation and one property notice went out.
    drop(h.app);
    let stats = h.dispatcher.shutdown(ShutdownMode::Drain).await;
    assert_eq!(stats, DispatchStats { sent: 2, failed: 0, dropped: 0 });
    let sent = h.transport.sent.lock().unwrap().clone();
    let recipients: Vec<_> = sent.iter().map(|n| n.to.as_str()).collect();
    assert_eq!(recipients, vec!["john@example.com", "owner@fort-smythe.example"]);
}

#[tokio::test]
async fn concurrent_visitors_cannot_double_book() {
    let h = start("race").await;
    let room = h.store.all_rooms()[0].clone();

    let visitors: Vec<_> = (0..8).map(|_| h.app.sessions.create()).collect();
    let outcomes = join_all(visitors.iter().enumerate().map(|(i, id)| {
        book(&h.app, *id, room.id, "2024-05-01", "2024-05-04", guest("Visitor", &format!("v{i}@example.com")))
    }))
    .await;

    let winners = outcomes.iter().filter(|o| **o == Outcome::Redirect(Route::Summary)).count();
    assert_eq!(winners, 1);
    assert_eq!(h.store.all_reservations().len(), 1);

    drop(h.app);
    let stats = h.dispatcher.shutdown(ShutdownMode::Drain).await;
    assert_eq!(stats.sent, 2);
}

#[tokio::test]
async fn bookings_survive_restart() {
    let h = start("restart").await;
    let room = h.store.all_rooms()[0].clone();
    let visitor = h.app.sessions.create();
    let outcome = book(&h.app, visitor, room.id, "2024-08-01", "2024-08-03", guest("Jane", "jane@example.com")).await;
    assert_eq!(outcome, Outcome::Redirect(Route::Summary));

    let Harness { app, store, dispatcher, wal_path, .. } = h;
    drop(app);
    dispatcher.shutdown(ShutdownMode::Discard).await;
    store.compact_wal().await.unwrap();
    drop(store);

    let reopened = Store::open(&wal_path, Duration::from_secs(3)).unwrap();
    assert_eq!(reopened.all_rooms().len(), 2);
    assert_eq!(app::seed_default_rooms(&reopened).await.unwrap(), 0);
    let reservations = reopened.all_reservations();
    assert_eq!(reservations.len(), 1);
    assert!(
        !reopened
            .restrictions_for_room_in_range(room.id, &reservations[0].span)
            .await
            .unwrap()
            .is_empty()
    );
}
