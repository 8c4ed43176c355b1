use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::i18n::{translate, Locale};

/// Banner shown above a view's data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeKind {
    /// A pushed update was accepted.
    Updated,
    /// The initial fetch failed; showing the cached snapshot.
    CachedData,
    /// The initial fetch failed and nothing was cached.
    LoadFailed,
    /// `error` event from the server, shown verbatim. Empty when the server
    /// sent no message.
    ServerError(String),
    /// The realtime transport could not connect.
    ConnectionError,
}

impl NoticeKind {
    pub fn text(&self, locale: Locale, updated_key: &str) -> String {
        match self {
            NoticeKind::Updated => translate(locale, updated_key),
            NoticeKind::CachedData => translate(locale, "meetings.cached"),
            NoticeKind::LoadFailed => translate(locale, "meetings.error"),
            NoticeKind::ServerError(message) if message.is_empty() => {
                translate(locale, "meetings.serverError")
            }
            NoticeKind::ServerError(message) => message.clone(),
            NoticeKind::ConnectionError => translate(locale, "meetings.connectionError"),
        }
    }

    fn severity(&self) -> Severity {
        match self {
            NoticeKind::Updated => Severity::Info,
            NoticeKind::CachedData => Severity::Warning,
            _ => Severity::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Rendered notice as exposed in view snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NoticeView {
    pub severity: Severity,
    pub text: String,
}

/// One pinned notice (load outcome) and one transient notice on top of it.
/// The transient one shows while it lives; the pinned one shows again once it
/// expires or is dismissed.
#[derive(Debug)]
pub struct NoticeBoard {
    pinned: Option<NoticeKind>,
    transient: Option<(NoticeKind, Instant)>,
    lifetime: Duration,
}

impl NoticeBoard {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            pinned: None,
            transient: None,
            lifetime,
        }
    }

    /// Shows `kind` until `now + lifetime`, replacing any transient notice.
    pub fn flash(&mut self, kind: NoticeKind, now: Instant) {
        self.transient = Some((kind, now + self.lifetime));
    }

    /// Shows `kind` until unpinned or dismissed.
    pub fn pin(&mut self, kind: NoticeKind) {
        self.pinned = Some(kind);
        self.transient = None;
    }

    /// Drops the pinned notice once the data it describes is superseded.
    pub fn unpin(&mut self) -> bool {
        self.pinned.take().is_some()
    }

    /// Clears the visible notice: the transient one if any, else the pinned one.
    pub fn dismiss(&mut self) -> bool {
        self.transient.take().is_some() || self.pinned.take().is_some()
    }

    /// Clears an expired transient notice. Returns whether one was cleared.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.transient {
            Some((_, at)) if at <= now => {
                self.transient = None;
                true
            }
            _ => false,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.transient.as_ref().map(|(_, at)| *at)
    }

    pub fn current(&self) -> Option<&NoticeKind> {
        self.transient
            .as_ref()
            .map(|(kind, _)| kind)
            .or(self.pinned.as_ref())
    }

    pub fn render(&self, locale: Locale, updated_key: &str) -> Option<NoticeView> {
        self.current().map(|kind| NoticeView {
            severity: kind.severity(),
            text: kind.text(locale, updated_key),
        })
    }
}
