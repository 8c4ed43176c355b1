use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{
    earliest, fresh_or_cached, Control, LiveView, LoadState, Navigator, NoticeBoard, NoticeKind,
    NoticeView, SnapshotOutcome,
};
use crate::cache::{put_json, CacheKey, CacheStore};
use crate::config::{COALESCE_WINDOW, NOTICE_LIFETIME};
use crate::fetcher::SnapshotFetcher;
use crate::i18n::{translate, Locale};
use crate::reconcile::{Reconciler, Reconciliation};
use crate::types::{MeetingDate, RaceDetail, ReunionCollection};
use crate::ws::{ChannelEvent, RealtimeChannel, RoomScope, Topic};

const UPDATED_KEY: &str = "meetings.updated";

/// Fetches the day's reunions, writing them through to the cache, or reads
/// the cached copy when the fetch fails.
pub async fn load_snapshot<F, C>(
    fetcher: &F,
    cache: &C,
    date: &MeetingDate,
) -> SnapshotOutcome<ReunionCollection>
where
    F: SnapshotFetcher + ?Sized,
    C: CacheStore + ?Sized,
{
    let fetched = fetcher.fetch_reunions(date).await;
    fresh_or_cached(fetched, cache, &CacheKey::Reunions(date.clone())).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReunionCommand {
    Next,
    Previous,
    DismissNotice,
    Unmount,
}

/// One race of the current reunion as displayed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RaceRow {
    #[serde(flatten)]
    pub detail: RaceDetail,
    /// Display start time, epoch millis.
    pub start_ms: Option<i64>,
}

impl From<&RaceDetail> for RaceRow {
    fn from(detail: &RaceDetail) -> Self {
        Self {
            start_ms: detail.start_ms(),
            detail: detail.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReunionSnapshot {
    pub title: String,
    pub date: MeetingDate,
    pub mounted: bool,
    pub load_state: LoadState,
    pub notice: Option<NoticeView>,
    /// Placeholder shown instead of the race list.
    pub empty_text: Option<String>,
    pub index: usize,
    pub total: usize,
    /// Label of the reunion under the cursor.
    pub label: Option<String>,
    pub races: Vec<RaceRow>,
    /// Reunion label → race labels of every visible reunion.
    pub schedule: IndexMap<String, Vec<String>>,
    /// Epoch millis of the last accepted push.
    pub last_update_ms: Option<i64>,
}

/// The day's reunions, kept live by the `reunions_update` room.
pub struct ReunionView<F, C, R> {
    fetcher: Arc<F>,
    cache: Arc<C>,
    channel: R,
    date: MeetingDate,
    locale: Locale,
    reconciler: Reconciler<ReunionCollection>,
    visible: ReunionCollection,
    navigator: Navigator,
    notices: NoticeBoard,
    load_state: LoadState,
    mounted: bool,
    last_update_ms: Option<i64>,
}

impl<F, C, R> ReunionView<F, C, R>
where
    F: SnapshotFetcher + 'static,
    C: CacheStore + 'static,
    R: RealtimeChannel + 'static,
{
    pub fn new(fetcher: Arc<F>, cache: Arc<C>, channel: R, date: MeetingDate, locale: Locale) -> Self {
        Self {
            fetcher,
            cache,
            channel,
            date,
            locale,
            reconciler: Reconciler::new(ReunionCollection::new(), COALESCE_WINDOW),
            visible: ReunionCollection::new(),
            navigator: Navigator::default(),
            notices: NoticeBoard::new(NOTICE_LIFETIME),
            load_state: LoadState::Loading,
            mounted: true,
            last_update_ms: None,
        }
    }

    fn show(&mut self, reunions: ReunionCollection) {
        self.visible = reunions;
        self.navigator.clamp(self.visible.len());
    }
}

impl<F, C, R> LiveView for ReunionView<F, C, R>
where
    F: SnapshotFetcher + 'static,
    C: CacheStore + 'static,
    R: RealtimeChannel + 'static,
{
    type Loaded = SnapshotOutcome<ReunionCollection>;
    type Command = ReunionCommand;
    type Snapshot = ReunionSnapshot;

    fn load(&self) -> BoxFuture<'static, Self::Loaded> {
        let fetcher = Arc::clone(&self.fetcher);
        let cache = Arc::clone(&self.cache);
        let date = self.date.clone();
        async move { load_snapshot(&*fetcher, &*cache, &date).await }.boxed()
    }

    fn apply_loaded(&mut self, loaded: Self::Loaded, _now: Instant) {
        self.load_state = loaded.load_state();
        match loaded {
            SnapshotOutcome::Fresh(reunions) => {
                info!(date = %self.date, reunions = reunions.len(), "reunions loaded");
                self.reconciler.reset_baseline(reunions.clone());
                self.show(reunions);
            }
            SnapshotOutcome::FromCache(reunions) => {
                info!(date = %self.date, reunions = reunions.len(), "reunions loaded from cache");
                self.reconciler.reset_baseline(reunions.clone());
                self.show(reunions);
                self.notices.pin(NoticeKind::CachedData);
            }
            SnapshotOutcome::Unavailable => {
                self.notices.pin(NoticeKind::LoadFailed);
            }
        }
    }

    fn open_channels(&mut self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channel.subscribe(Topic::Reunions, tx.clone());
        self.channel.subscribe(Topic::Errors, tx);
        self.channel.connect(RoomScope::Reunions(self.date.clone()));
        rx
    }

    async fn handle_event(&mut self, event: ChannelEvent, now: Instant) {
        if !self.mounted {
            return;
        }
        match event {
            ChannelEvent::Reunions(reunions) => {
                let key = CacheKey::Reunions(self.date.clone());
                match self.reconciler.reconcile(reunions, now) {
                    Reconciliation::Accepted => {
                        put_json(&*self.cache, &key, self.reconciler.baseline()).await;
                        self.notices.flash(NoticeKind::Updated, now);
                        self.last_update_ms = Some(chrono::Utc::now().timestamp_millis());
                        debug!(date = %self.date, "reunions update accepted");
                    }
                    Reconciliation::Suppressed => {
                        debug!(date = %self.date, "reunions update unchanged, suppressed");
                    }
                }
            }
            ChannelEvent::ServerError(message) => {
                self.notices.flash(NoticeKind::ServerError(message), now);
            }
            ChannelEvent::ConnectError(_) => {
                self.notices.flash(NoticeKind::ConnectionError, now);
            }
            other => debug!(topic = ?other.topic(), "ignoring event for another view"),
        }
    }

    fn handle_command(&mut self, command: ReunionCommand, _now: Instant) -> Control {
        let len = self.visible.len();
        match command {
            ReunionCommand::Next => self.navigator.next(len),
            ReunionCommand::Previous => self.navigator.previous(len),
            ReunionCommand::DismissNotice => {
                self.notices.dismiss();
            }
            ReunionCommand::Unmount => return Control::Unmount,
        }
        Control::Continue
    }

    fn on_tick(&mut self, now: Instant) {
        if let Some(reunions) = self.reconciler.take_due(now) {
            self.show(reunions);
            self.load_state = LoadState::Fresh;
            self.notices.unpin();
        }
        self.notices.expire(now);
    }

    fn next_deadline(&self) -> Option<Instant> {
        earliest(self.reconciler.next_deadline(), self.notices.next_deadline())
    }

    fn unmount(&mut self) {
        self.channel.disconnect();
        if self.reconciler.cancel() {
            debug!(date = %self.date, "dropped pending reunions apply");
        }
        self.mounted = false;
        info!(date = %self.date, "reunion view unmounted");
    }

    fn snapshot(&self) -> ReunionSnapshot {
        let index = self.navigator.index();
        let current = self.visible.get_index(index);
        let empty_key = match current {
            _ if self.load_state == LoadState::Loading => Some("meetings.loading"),
            None => Some("meetings.noMeetings"),
            Some((_, races)) if races.is_empty() => Some("races.noRaces"),
            Some(_) => None,
        };
        ReunionSnapshot {
            title: translate(self.locale, "meetings.title"),
            date: self.date.clone(),
            mounted: self.mounted,
            load_state: self.load_state,
            notice: self.notices.render(self.locale, UPDATED_KEY),
            empty_text: empty_key.map(|key| translate(self.locale, key)),
            index,
            total: self.visible.len(),
            label: current.map(|(label, _)| label.to_string()),
            races: current
                .map(|(_, races)| races.iter().map(RaceRow::from).collect())
                .unwrap_or_default(),
            schedule: self.visible.schedule(),
            last_update_ms: self.last_update_ms,
        }
    }
}
