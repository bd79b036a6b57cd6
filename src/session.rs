use std::collections::HashMap;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;
use ulid::Ulid;

/// A named session slot holding values of type `T`.
///
/// Two keys may share a name with different types; reading through the
/// wrong one yields `Lookup::Malformed` rather than a bogus value.
pub struct SessionKey<T> {
    name: &'static str,
    _value: PhantomData<fn() -> T>,
}

impl<T> SessionKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self { name, _value: PhantomData }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Result of reading a typed session slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Present(T),
    Absent,
    /// Something is stored under the name but it is not a `T`.
    Malformed(String),
}

impl<T> Lookup<T> {
    pub fn require(self, key: &'static str) -> Result<T, SessionStateError> {
        match self {
            Lookup::Present(value) => Ok(value),
            Lookup::Absent => Err(SessionStateError::Missing(key)),
            Lookup::Malformed(reason) => Err(SessionStateError::Malformed { key, reason }),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionStateError {
    #[error("session has no {0}")]
    Missing(&'static str),
    #[error("session value {key} is malformed: {reason}")]
    Malformed { key: &'static str, reason: String },
    #[error("session value {key} could not be stored: {source}")]
    Encode {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Which one-shot notice slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Notice {
    Flash,
    Warning,
    Error,
}

/// Per-visitor key/value state plus read-once notices.
#[derive(Debug, Clone, Default)]
pub struct Session {
    values: HashMap<&'static str, serde_json::Value>,
    notices: HashMap<Notice, String>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: DeserializeOwned>(&self, key: &SessionKey<T>) -> Lookup<T> {
        match self.values.get(key.name) {
            None => Lookup::Absent,
            Some(raw) => match T::deserialize(raw) {
                Ok(value) => Lookup::Present(value),
                Err(e) => Lookup::Malformed(e.to_string()),
            },
        }
    }

    pub fn put<T: Serialize>(&mut self, key: &SessionKey<T>, value: &T) -> Result<(), SessionStateError> {
        let raw = serde_json::to_value(value).map_err(|source| SessionStateError::Encode {
            key: key.name,
            source,
        })?;
        self.values.insert(key.name, raw);
        Ok(())
    }

    pub fn remove<T>(&mut self, key: &SessionKey<T>) {
        self.values.remove(key.name);
    }

    pub fn contains<T>(&self, key: &SessionKey<T>) -> bool {
        self.values.contains_key(key.name)
    }

    pub fn notify(&mut self, notice: Notice, message: impl Into<String>) {
        self.notices.insert(notice, message.into());
    }

    /// Read a notice and clear it.
    pub fn take_notice(&mut self, notice: Notice) -> Option<String> {
        self.notices.remove(&notice)
    }

    pub fn flash(&mut self, message: impl Into<String>) {
        self.notify(Notice::Flash, message);
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.notify(Notice::Warning, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.notify(Notice::Error, message);
    }
}

struct Entry {
    session: Session,
    last_seen: Instant,
}

/// Session storage keyed by visitor id.
///
/// `load` hands out a copy and `save` writes it back, so two overlapping
/// requests of one visitor race and the later save wins.
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<Ulid, Entry>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh, empty session.
    pub fn create(&self) -> Ulid {
        let id = Ulid::new();
        self.sessions.insert(id, Entry { session: Session::new(), last_seen: Instant::now() });
        id
    }

    /// The visitor's session, or an empty one if it expired or never existed.
    pub fn load(&self, id: Ulid) -> Session {
        match self.sessions.get_mut(&id) {
            Some(mut entry) => {
                entry.last_seen = Instant::now();
                entry.session.clone()
            }
            None => Session::new(),
        }
    }

    pub fn save(&self, id: Ulid, session: Session) {
        self.sessions.insert(id, Entry { session, last_seen: Instant::now() });
    }

    pub fn destroy(&self, id: Ulid) {
        self.sessions.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop sessions idle for at least `max_idle`. Returns how many went.
    pub fn expire_idle(&self, max_idle: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, entry| entry.last_seen.elapsed() < max_idle);
        let expired = before.saturating_sub(self.sessions.len());
        if expired > 0 {
            debug!(expired, "expired idle sessions");
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Draft {
        nights: u32,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Confirmed {
        code: String,
        nights: u32,
    }

    const DRAFT: SessionKey<Draft> = SessionKey::new("booking");
    const CONFIRMED: SessionKey<Confirmed> = SessionKey::new("booking");

    #[test]
    fn typed_get_put_remove() {
        let mut session = Session::new();
        assert_eq!(session.get(&DRAFT), Lookup::Absent);

        session.put(&DRAFT, &Draft { nights: 3 }).unwrap();
        assert_eq!(session.get(&DRAFT), Lookup::Present(Draft { nights: 3 }));
        assert!(session.contains(&DRAFT));

        session.remove(&DRAFT);
        assert_eq!(session.get(&DRAFT), Lookup::Absent);
    }

    #[test]
    fn wrong_shape_is_malformed_not_panic() {
        let mut session = Session::new();
        session.put(&DRAFT, &Draft { nights: 3 }).unwrap();
        assert!(matches!(session.get(&CONFIRMED), Lookup::Malformed(_)));

        session.put(&CONFIRMED, &Confirmed { code: "A1".into(), nights: 2 }).unwrap();
        assert!(matches!(session.get(&DRAFT), Lookup::Malformed(_)));
    }

    #[test]
    fn require_maps_to_session_state_errors() {
        let mut session = Session::new();
        assert!(matches!(
            session.get(&DRAFT).require("booking"),
            Err(SessionStateError::Missing("booking"))
        ));
        session.put(&CONFIRMED, &Confirmed { code: "A1".into(), nights: 2 }).unwrap();
        assert!(matches!(
            session.get(&DRAFT).require("booking"),
            Err(SessionStateError::Malformed { key: "booking", .. })
        ));
    }

    #[test]
    fn notices_are_read_once() {
        let mut session = Session::new();
        session.error("No availability");
        session.flash("Changes saved");
        assert_eq!(session.take_notice(Notice::Error).as_deref(), Some("No availability"));
        assert_eq!(session.take_notice(Notice::Error), None);
        assert_eq!(session.take_notice(Notice::Warning), None);
        assert_eq!(session.take_notice(Notice::Flash).as_deref(), Some("Changes saved"));
    }

    #[test]
    fn store_load_save_roundtrip() {
        let store = SessionStore::new();
        let id = store.create();
        let mut session = store.load(id);
        session.put(&DRAFT, &Draft { nights: 1 }).unwrap();
        store.save(id, session);

        assert_eq!(store.load(id).get(&DRAFT), Lookup::Present(Draft { nights: 1 }));
        assert_eq!(store.load(Ulid::new()).get(&DRAFT), Lookup::Absent);

        store.destroy(id);
        assert!(store.is_empty());
    }

    #[test]
    fn expire_idle_sessions() {
        let store = SessionStore::new();
        store.create();
        store.create();
        assert_eq!(store.expire_idle(Duration::from_secs(3600)), 0);
        assert_eq!(store.len(), 2);
        assert_eq!(store.expire_idle(Duration::ZERO), 2);
        assert!(store.is_empty());
    }
}
