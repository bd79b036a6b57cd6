use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::model::Reservation;
use crate::observability::{
    NOTIFICATIONS_DROPPED_TOTAL, NOTIFICATIONS_ENQUEUED_TOTAL, NOTIFICATIONS_FAILED_TOTAL, NOTIFICATIONS_SENT_TOTAL,
};

/// One outgoing message. Immutable once queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("notification queue is closed")]
    Closed,
    #[error("invalid address {address:?}: {reason}")]
    Address { address: String, reason: String },
    #[error("could not build message: {0}")]
    Build(String),
    #[error("transport failed: {0}")]
    Transport(String),
}

/// Delivers a single message. Implementations connect per call.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, message: &Notification) -> Result<(), DispatchError>;
}

fn mailbox(address: &str) -> Result<Mailbox, DispatchError> {
    address.parse().map_err(|e: lettre::address::AddressError| DispatchError::Address {
        address: address.to_string(),
        reason: e.to_string(),
    })
}

/// Plain SMTP relay, no auth. A new connection is opened for every message
/// and closed when the transport is dropped.
pub struct SmtpTransport {
    host: String,
    port: u16,
}

/// Bodies carry guest-entered text, so they go out as plain text.
fn build_message(message: &Notification) -> Result<Message, DispatchError> {
    Message::builder()
        .from(mailbox(&message.from)?)
        .to(mailbox(&message.to)?)
        .subject(message.subject.clone())
        .header(ContentType::TEXT_PLAIN)
        .body(message.body.clone())
        .map_err(|e| DispatchError::Build(e.to_string()))
}

impl SmtpTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn send(&self, message: &Notification) -> Result<(), DispatchError> {
        let email = build_message(message)?;

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(self.host.as_str())
            .port(self.port)
            .build();
        mailer
            .send(email)
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;
        Ok(())
    }
}

/// Producer half of the notification queue. Cheap to clone.
#[derive(Clone)]
pub struct Mailer {
    tx: mpsc::Sender<Notification>,
    from: String,
    property_contact: String,
}

/// A bounded queue: the `Mailer` for request handlers and the receiver for
/// the one `Dispatcher`.
pub fn queue(
    capacity: usize,
    from: impl Into<String>,
    property_contact: impl Into<String>,
) -> (Mailer, mpsc::Receiver<Notification>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let mailer = Mailer {
        tx,
        from: from.into(),
        property_contact: property_contact.into(),
    };
    (mailer, rx)
}

impl Mailer {
    /// Queue a message. Waits, without a timeout, while the queue is full.
    pub async fn enqueue(&self, message: Notification) -> Result<(), DispatchError> {
        self.tx.send(message).await.map_err(|_| DispatchError::Closed)?;
        metrics::counter!(NOTIFICATIONS_ENQUEUED_TOTAL).increment(1);
        Ok(())
    }

    /// The guest confirmation and the property-contact notice for a booking.
    pub fn reservation_notifications(&self, reservation: &Reservation) -> [Notification; 2] {
        let guest = &reservation.guest;
        let (start, end) = (reservation.span.start, reservation.span.end);
        [
            Notification {
                to: guest.email.clone(),
                from: self.from.clone(),
                subject: "Reservation Confirmation".into(),
                body: format!(
                    "Reservation Confirmation\n\n\
                     Dear {}:\n\n\
                     This is to confirm your reservation at {} from {start} to {end}.\n",
                    guest.first_name, reservation.room_name
                ),
            },
            Notification {
                to: self.property_contact.clone(),
                from: self.from.clone(),
                subject: "Reservation Notification".into(),
                body: format!(
                    "Reservation Notification\n\n\
                     A reservation has been made for {} from {start} to {end} by {} {} ({}).\n",
                    reservation.room_name, guest.first_name, guest.last_name, guest.email
                ),
            },
        ]
    }

    pub async fn reservation_committed(&self, reservation: &Reservation) -> Result<(), DispatchError> {
        for message in self.reservation_notifications(reservation) {
            self.enqueue(message).await?;
        }
        Ok(())
    }
}

/// What happens to queued messages when the dispatcher is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop intake, deliver everything already queued.
    Drain,
    /// Finish the in-flight message, drop the rest.
    Discard,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub sent: u64,
    pub failed: u64,
    pub dropped: u64,
}

/// The single consumer of the notification queue.
pub struct Dispatcher {
    cancel: CancellationToken,
    discard: Arc<AtomicBool>,
    handle: JoinHandle<DispatchStats>,
}

impl Dispatcher {
    pub fn spawn<T: Transport>(transport: T, rx: mpsc::Receiver<Notification>) -> Self {
        let cancel = CancellationToken::new();
        let discard = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(run_dispatcher(transport, rx, cancel.clone(), discard.clone()));
        Self { cancel, discard, handle }
    }

    pub async fn shutdown(self, mode: ShutdownMode) -> DispatchStats {
        self.discard.store(mode == ShutdownMode::Discard, Ordering::SeqCst);
        self.cancel.cancel();
        match self.handle.await {
            Ok(stats) => stats,
            Err(e) => {
                error!("dispatcher task failed: {e}");
                DispatchStats::default()
            }
        }
    }
}

async fn deliver<T: Transport>(transport: &T, message: Notification, stats: &mut DispatchStats) {
    match transport.send(&message).await {
        Ok(()) => {
            stats.sent += 1;
            metrics::counter!(NOTIFICATIONS_SENT_TOTAL).increment(1);
            debug!(to = %message.to, subject = %message.subject, "notification sent");
        }
        Err(e) => {
            // At-most-once: no retry.
            stats.failed += 1;
            metrics::counter!(NOTIFICATIONS_FAILED_TOTAL).increment(1);
            error!(to = %message.to, subject = %message.subject, "notification dropped: {e}");
        }
    }
}

async fn run_dispatcher<T: Transport>(
    transport: T,
    mut rx: mpsc::Receiver<Notification>,
    cancel: CancellationToken,
    discard: Arc<AtomicBool>,
) -> DispatchStats {
    let mut stats = DispatchStats::default();
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => {
                    info!(?stats, "notification queue closed by producers");
                    return stats;
                }
            },
        };
        deliver(&transport, message, &mut stats).await;
    }

    rx.close();
    if discard.load(Ordering::SeqCst) {
        while rx.try_recv().is_ok() {
            stats.dropped += 1;
        }
        metrics::counter!(NOTIFICATIONS_DROPPED_TOTAL).increment(stats.dropped);
    } else {
        while let Some(message) = rx.recv().await {
            deliver(&transport, message, &mut stats).await;
        }
    }
    info!(?stats, "dispatcher stopped");
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    #[derive(Clone, Default)]
    struct Recording {
        sent: Arc<Mutex<Vec<Notification>>>,
    }

    #[async_trait]
    impl Transport for Recording {
        async fn send(&self, message: &Notification) -> Result<(), DispatchError> {
            if message.to.starts_with("bounce") {
                return Err(DispatchError::Transport("550 mailbox unavailable".into()));
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    fn note(to: &str) -> Notification {
        Notification {
            to: to.into(),
            from: "desk@example.com".into(),
            subject: "hello".into(),
            body: String::new(),
        }
    }

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let (mailer, rx) = queue(8, "desk@example.com", "owner@example.com");
        let transport = Recording::default();
        let dispatcher = Dispatcher::spawn(transport.clone(), rx);

        for to in ["a@example.com", "b@example.com", "c@example.com"] {
            mailer.enqueue(note(to)).await.unwrap();
        }
        drop(mailer);
        let stats = dispatcher.shutdown(ShutdownMode::Drain).await;

        assert_eq!(stats, DispatchStats { sent: 3, failed: 0, dropped: 0 });
        let order: Vec<_> = transport.sent.lock().unwrap().iter().map(|n| n.to.clone()).collect();
        assert_eq!(order, vec!["a@example.com", "b@example.com", "c@example.com"]);
    }

    #[tokio::test]
    async fn failed_send_is_dropped_and_rest_continue() {
        let (mailer, rx) = queue(8, "desk@example.com", "owner@example.com");
        let transport = Recording::default();
        let dispatcher = Dispatcher::spawn(transport.clone(), rx);

        mailer.enqueue(note("a@example.com")).await.unwrap();
        mailer.enqueue(note("bounce@example.com")).await.unwrap();
        mailer.enqueue(note("c@example.com")).await.unwrap();
        let stats = dispatcher.shutdown(ShutdownMode::Drain).await;

        assert_eq!(stats, DispatchStats { sent: 2, failed: 1, dropped: 0 });
        assert_eq!(transport.sent.lock().unwrap().len(), 2);
    }

    #[test]
    fn producer_waits_while_queue_is_full() {
        let (mailer, mut rx) = queue(2, "desk@example.com", "owner@example.com");

        let mut first = task::spawn(mailer.enqueue(note("a@example.com")));
        assert_ready_ok!(first.poll());
        let mut second = task::spawn(mailer.enqueue(note("b@example.com")));
        assert_ready_ok!(second.poll());

        let mut third = task::spawn(mailer.enqueue(note("c@example.com")));
        assert_pending!(third.poll());
        assert_pending!(third.poll());

        assert_eq!(rx.try_recv().unwrap().to, "a@example.com");
        assert!(third.is_woken());
        assert_ready_ok!(third.poll());

        assert_eq!(rx.try_recv().unwrap().to, "b@example.com");
        assert_eq!(rx.try_recv().unwrap().to, "c@example.com");
    }

    #[tokio::test]
    async fn drain_delivers_everything_queued() {
        let (mailer, rx) = queue(8, "desk@example.com", "owner@example.com");
        for to in ["a@example.com", "b@example.com", "c@example.com"] {
            mailer.enqueue(note(to)).await.unwrap();
        }
        let transport = Recording::default();
        let dispatcher = Dispatcher::spawn(transport.clone(), rx);
        let stats = dispatcher.shutdown(ShutdownMode::Drain).await;

        assert_eq!(stats, DispatchStats { sent: 3, failed: 0, dropped: 0 });
        assert!(matches!(mailer.enqueue(note("late@example.com")).await, Err(DispatchError::Closed)));
    }

    #[tokio::test]
    async fn discard_drops_what_is_queued() {
        let (mailer, rx) = queue(8, "desk@example.com", "owner@example.com");
        for to in ["a@example.com", "b@example.com", "c@example.com"] {
            mailer.enqueue(note(to)).await.unwrap();
        }
        let transport = Recording::default();
        // Current-thread runtime: the worker has not run yet when shutdown
        // flips the mode, so nothing is in flight.
        let dispatcher = Dispatcher::spawn(transport.clone(), rx);
        let stats = dispatcher.shutdown(ShutdownMode::Discard).await;

        assert_eq!(stats, DispatchStats { sent: 0, failed: 0, dropped: 3 });
        assert!(transport.sent.lock().unwrap().is_empty());
        assert!(matches!(mailer.enqueue(note("late@example.com")).await, Err(DispatchError::Closed)));
    }

    #[test]
    fn booking_produces_guest_and_property_messages() {
        use crate::model::{DateSpan, GuestDetails, Room};

        let (mailer, _rx) = queue(2, "desk@example.com", "owner@example.com");
        let room = Room { id: ulid::Ulid::new(), name: "Major's Suite".into() };
        let guest = GuestDetails {
            first_name: "John".into(),
            last_name: "Smith".into(),
            email: "john@example.com".into(),
            phone: String::new(),
        };
        let span = DateSpan::new("2024-03-10".parse().unwrap(), "2024-03-15".parse().unwrap());
        let reservation = Reservation::new(guest, span, &room);

        let [to_guest, to_owner] = mailer.reservation_notifications(&reservation);
        assert_eq!(to_guest.to, "john@example.com");
        assert_eq!(to_guest.from, "desk@example.com");
        assert!(to_guest.body.contains("2024-03-10"));
        assert_eq!(to_owner.to, "owner@example.com");
        assert!(to_owner.body.contains("Major's Suite"));
    }

    #[test]
    fn guest_text_goes_out_verbatim_as_plain_text() {
        use crate::model::{DateSpan, GuestDetails, Room};

        let (mailer, _rx) = queue(2, "desk@example.com", "owner@example.com");
        let room = Room { id: ulid::Ulid::new(), name: "General's Quarters".into() };
        let guest = GuestDetails {
            first_name: "<script>alert(1)</script>".into(),
            last_name: "O'Brien & Sons".into(),
            email: "john@example.com".into(),
            phone: String::new(),
        };
        let span = DateSpan::new("2024-03-10".parse().unwrap(), "2024-03-15".parse().unwrap());
        let reservation = Reservation::new(guest, span, &room);

        let [to_guest, to_owner] = mailer.reservation_notifications(&reservation);
        assert!(to_guest.body.starts_with("Reservation Confirmation\n\nDear <script>alert(1)</script>:"));
        assert!(to_owner.body.contains("by <script>alert(1)</script> O'Brien & Sons (john@example.com)"));
        assert!(!to_owner.body.contains("<br>"));

        let email = build_message(&to_guest).unwrap();
        assert_eq!(email.headers().get::<ContentType>(), Some(ContentType::TEXT_PLAIN));
    }

    #[test]
    fn invalid_address_is_dispatch_error() {
        assert!(matches!(mailbox("not an address"), Err(DispatchError::Address { .. })));
        assert!(mailbox("john@example.com").is_ok());
    }
}
