use std::time::Duration;

use crate::error::{AppError, Result};
use crate::i18n::Locale;
use crate::types::MeetingDate;
use crate::ws::TransportMode;

pub const API_URL: &str = "http://localhost:5010";
pub const REALTIME_URL: &str = "http://localhost:5010";

/// Namespace under which every cache entry of this client is stored.
pub const CACHE_NAMESPACE: &str = "reunion-live";

/// Bound on each REST request (snapshot and selections).
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on one realtime connect attempt, handshake included.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Bound on the websocket check when upgrading from long-polling; the
/// session stays on polling past it.
pub const UPGRADE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reconnect attempts after a drop or a failed connect. Server-initiated
/// disconnects are never retried.
pub const RECONNECT_ATTEMPTS: u32 = 3;

/// Reconnect delay doubles from the initial value up to the cap.
pub const RECONNECT_DELAY_INITIAL: Duration = Duration::from_secs(1);
pub const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(5);

/// Trailing window over which accepted updates collapse into one visible apply.
pub const COALESCE_WINDOW: Duration = Duration::from_millis(500);

/// Lifetime of transient notices ("updated", connection errors).
pub const NOTICE_LIFETIME: Duration = Duration::from_secs(3);

/// Capacity of the command channel into each view task.
pub const COMMAND_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub realtime_url: String,
    /// REALTIME_TRANSPORT: `websocket` skips the polling handshake.
    pub realtime_transport: TransportMode,
    pub cache_db_path: String,
    /// MEETING_DATE; local today when unset.
    pub meeting_date: Option<MeetingDate>,
    pub locale: Locale,
    pub log_level: String,
    pub status_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let meeting_date = match std::env::var("MEETING_DATE") {
            Ok(raw) if !raw.trim().is_empty() => Some(MeetingDate::parse(&raw).map_err(|_| {
                AppError::Config(format!("MEETING_DATE must be DDMMYYYY, got {raw:?}"))
            })?),
            _ => None,
        };

        Ok(Self {
            api_url: std::env::var("API_URL").unwrap_or_else(|_| API_URL.to_string()),
            realtime_url: std::env::var("REALTIME_URL")
                .unwrap_or_else(|_| REALTIME_URL.to_string()),
            realtime_transport: TransportMode::from_name(
                &std::env::var("REALTIME_TRANSPORT").unwrap_or_default(),
            ),
            cache_db_path: std::env::var("CACHE_DB_PATH")
                .unwrap_or_else(|_| "reunion_cache.db".to_string()),
            meeting_date,
            locale: Locale::from_tag(&std::env::var("LOCALE").unwrap_or_default()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            status_port: std::env::var("STATUS_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("STATUS_PORT must be a valid port number".to_string()))?,
        })
    }
}
