use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Runtime settings, read from `BOOKINGS_*` environment variables.
///
/// Unset or unparsable values fall back to the defaults below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// Deadline applied to every repository call.
    pub storage_timeout: Duration,
    pub mail_queue_capacity: usize,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub mail_from: String,
    /// Address that receives a copy of every new reservation.
    pub property_contact: String,
    /// Idle time after which a session is expired.
    pub session_lifetime: Duration,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            storage_timeout: Duration::from_secs(3),
            mail_queue_capacity: 100,
            smtp_host: "localhost".into(),
            smtp_port: 1025,
            mail_from: "reservations@fort-smythe.example".into(),
            property_contact: "owner@fort-smythe.example".into(),
            session_lifetime: Duration::from_secs(24 * 60 * 60),
            compact_threshold: 1000,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());
        let text = |key: &str, default: String| lookup(key).filter(|s| !s.trim().is_empty()).unwrap_or(default);

        Self {
            data_dir: lookup("BOOKINGS_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            metrics_port: lookup("BOOKINGS_METRICS_PORT").and_then(|s| parse(&s)),
            storage_timeout: parsed("BOOKINGS_STORAGE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.storage_timeout),
            mail_queue_capacity: lookup("BOOKINGS_MAIL_QUEUE_CAPACITY")
                .and_then(|s| parse::<usize>(&s))
                .filter(|&n| n > 0)
                .unwrap_or(defaults.mail_queue_capacity),
            smtp_host: text("BOOKINGS_SMTP_HOST", defaults.smtp_host),
            smtp_port: lookup("BOOKINGS_SMTP_PORT")
                .and_then(|s| parse(&s))
                .unwrap_or(defaults.smtp_port),
            mail_from: text("BOOKINGS_MAIL_FROM", defaults.mail_from),
            property_contact: text("BOOKINGS_PROPERTY_CONTACT", defaults.property_contact),
            session_lifetime: parsed("BOOKINGS_SESSION_LIFETIME_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.session_lifetime),
            compact_threshold: parsed("BOOKINGS_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }
}

fn parse<T: FromStr>(s: &str) -> Option<T> {
    s.trim().parse().ok()
}
