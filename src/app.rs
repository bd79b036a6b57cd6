use std::sync::Arc;

use tracing::info;
use ulid::Ulid;

use crate::model::Room;
use crate::notify::Mailer;
use crate::repository::Repository;
use crate::session::SessionStore;
use crate::store::{StorageError, Store};

pub const DEFAULT_ROOMS: [&str; 2] = ["General's Quarters", "Major's Suite"];

/// Everything a request handler needs, built once at startup and shared.
#[derive(Clone)]
pub struct App {
    pub repo: Arc<dyn Repository>,
    pub sessions: Arc<SessionStore>,
    pub mailer: Mailer,
}

impl App {
    pub fn new(repo: Arc<dyn Repository>, mailer: Mailer) -> Self {
        Self {
            repo,
            sessions: Arc::new(SessionStore::new()),
            mailer,
        }
    }
}

/// Create the default rooms on an empty store. Returns how many were added.
pub async fn seed_default_rooms(store: &Store) -> Result<usize, StorageError> {
    if !store.all_rooms().is_empty() {
        return Ok(0);
    }
    for name in DEFAULT_ROOMS {
        store.create_room(Room { id: Ulid::new(), name: name.into() }).await?;
    }
    info!(rooms = DEFAULT_ROOMS.len(), "seeded default rooms");
    Ok(DEFAULT_ROOMS.len())
}
