use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{
    earliest, fresh_or_cached, Control, LiveView, LoadState, NoticeBoard, NoticeKind, NoticeView,
    SnapshotOutcome,
};
use crate::cache::{get_json, put_json, CacheKey, CacheStore};
use crate::config::NOTICE_LIFETIME;
use crate::fetcher::SnapshotFetcher;
use crate::i18n::{translate, Locale};
use crate::reconcile::{Reconciler, Reconciliation};
use crate::types::{Odds, OddsEntry, Participant, ParticipantKind, RaceScope};
use crate::ws::{ChannelEvent, RealtimeChannel, RoomScope, Topic};

const UPDATED_KEY: &str = "participants.updated";

/// Selection pushes are applied as they arrive.
const SELECTIONS_WINDOW: Duration = Duration::ZERO;

// ---------------------------------------------------------------------------
// Odds board
// ---------------------------------------------------------------------------

/// Current odds per participant number, tracked apart from the selection
/// list.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct OddsBoard {
    entries: IndexMap<String, OddsEntry>,
}

impl OddsBoard {
    pub fn from_entries(entries: Vec<OddsEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|e| (e.num_pmu.clone(), e))
                .collect(),
        }
    }

    pub fn seed(participants: &[Participant]) -> Self {
        Self::from_entries(participants.iter().map(OddsEntry::from).collect())
    }

    /// Rebuilds the board for a new selection list. A participant arriving
    /// without odds keeps whatever the board already had for it.
    pub fn merge(&mut self, participants: &[Participant]) {
        let mut merged = IndexMap::with_capacity(participants.len());
        for p in participants {
            let mut entry = OddsEntry::from(p);
            if matches!(entry.latest_odds, Odds::Unavailable(_)) {
                if let Some(known) = self.entries.get(&p.num_pmu) {
                    entry.latest_odds = known.latest_odds.clone();
                }
            }
            merged.insert(p.num_pmu.clone(), entry);
        }
        self.entries = merged;
    }

    /// Replaces one participant's odds. Unknown numbers are ignored. Returns
    /// whether anything changed.
    pub fn apply(&mut self, horse_id: &str, odds: Odds) -> bool {
        match self.entries.get_mut(horse_id) {
            Some(entry) if entry.latest_odds != odds => {
                entry.latest_odds = odds;
                true
            }
            _ => false,
        }
    }

    pub fn entries(&self) -> Vec<OddsEntry> {
        self.entries.values().cloned().collect()
    }

    /// Lowest odds first; entries without a numeric price go last, in board
    /// order.
    pub fn sorted(&self) -> Vec<OddsEntry> {
        let mut sorted = self.entries();
        sorted.sort_by(|a, b| {
            let a = a.latest_odds.record().and_then(|r| r.value());
            let b = b.latest_odds.record().and_then(|r| r.value());
            match (a, b) {
                (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        });
        sorted
    }
}

// ---------------------------------------------------------------------------
// Race view
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct RaceLoad {
    selections: SnapshotOutcome<Vec<Participant>>,
    odds: OddsBoard,
}

async fn load_race<F, C>(fetcher: &F, cache: &C, scope: &RaceScope) -> RaceLoad
where
    F: SnapshotFetcher + ?Sized,
    C: CacheStore + ?Sized,
{
    let fetched = fetcher.fetch_selections(scope).await;
    let selections = fresh_or_cached(fetched, cache, &CacheKey::Selections(scope.clone())).await;
    let odds_key = CacheKey::Odds(scope.clone());
    let odds = match &selections {
        SnapshotOutcome::Fresh(participants) => {
            let board = OddsBoard::seed(participants);
            put_json(cache, &odds_key, &board.entries()).await;
            board
        }
        SnapshotOutcome::FromCache(participants) => match get_json(cache, &odds_key).await {
            Some(entries) => OddsBoard::from_entries(entries),
            None => OddsBoard::seed(participants),
        },
        SnapshotOutcome::Unavailable => get_json(cache, &odds_key)
            .await
            .map(OddsBoard::from_entries)
            .unwrap_or_default(),
    };
    RaceLoad { selections, odds }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceCommand {
    DismissNotice,
    Unmount,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticipantView {
    pub num_pmu: String,
    pub name: String,
    pub kind: ParticipantKind,
    /// Localized category label.
    pub kind_label: String,
    pub latest_odds: Odds,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RaceSnapshot {
    pub scope: RaceScope,
    pub mounted: bool,
    pub load_state: LoadState,
    pub notice: Option<NoticeView>,
    /// Placeholder shown instead of the participant list.
    pub empty_text: Option<String>,
    pub participants: Vec<ParticipantView>,
    /// Sorted by odds, lowest first.
    pub odds: Vec<OddsEntry>,
    /// Placeholder shown instead of the odds list.
    pub odds_empty_text: Option<String>,
}

/// Participants and odds of one race, each kept live by its own room.
pub struct RaceView<F, C, R> {
    fetcher: Arc<F>,
    cache: Arc<C>,
    selections_channel: R,
    odds_channel: R,
    scope: RaceScope,
    locale: Locale,
    reconciler: Reconciler<Vec<Participant>>,
    participants: Vec<Participant>,
    odds: OddsBoard,
    notices: NoticeBoard,
    load_state: LoadState,
    mounted: bool,
}

impl<F, C, R> RaceView<F, C, R>
where
    F: SnapshotFetcher + 'static,
    C: CacheStore + 'static,
    R: RealtimeChannel + 'static,
{
    pub fn new(
        fetcher: Arc<F>,
        cache: Arc<C>,
        selections_channel: R,
        odds_channel: R,
        scope: RaceScope,
        locale: Locale,
    ) -> Self {
        Self {
            fetcher,
            cache,
            selections_channel,
            odds_channel,
            scope,
            locale,
            reconciler: Reconciler::new(Vec::new(), SELECTIONS_WINDOW),
            participants: Vec::new(),
            odds: OddsBoard::default(),
            notices: NoticeBoard::new(NOTICE_LIFETIME),
            load_state: LoadState::Loading,
            mounted: true,
        }
    }

    fn participant_view(&self, p: &Participant) -> ParticipantView {
        ParticipantView {
            num_pmu: p.num_pmu.clone(),
            name: p.name.clone(),
            kind: p.kind,
            kind_label: translate(self.locale, p.kind.label_key()),
            latest_odds: p.latest_odds.clone(),
        }
    }
}

impl<F, C, R> LiveView for RaceView<F, C, R>
where
    F: SnapshotFetcher + 'static,
    C: CacheStore + 'static,
    R: RealtimeChannel + 'static,
{
    type Loaded = RaceLoad;
    type Command = RaceCommand;
    type Snapshot = RaceSnapshot;

    fn load(&self) -> BoxFuture<'static, RaceLoad> {
        let fetcher = Arc::clone(&self.fetcher);
        let cache = Arc::clone(&self.cache);
        let scope = self.scope.clone();
        async move { load_race(&*fetcher, &*cache, &scope).await }.boxed()
    }

    fn apply_loaded(&mut self, loaded: RaceLoad, _now: Instant) {
        self.load_state = loaded.selections.load_state();
        self.odds = loaded.odds;
        match loaded.selections {
            SnapshotOutcome::Fresh(participants) => {
                info!(scope = %self.scope, count = participants.len(), "selections loaded");
                self.reconciler.reset_baseline(participants.clone());
                self.participants = participants;
            }
            SnapshotOutcome::FromCache(participants) => {
                info!(scope = %self.scope, count = participants.len(), "selections loaded from cache");
                self.reconciler.reset_baseline(participants.clone());
                self.participants = participants;
                self.notices.pin(NoticeKind::CachedData);
            }
            SnapshotOutcome::Unavailable => {
                self.notices.pin(NoticeKind::LoadFailed);
            }
        }
    }

    fn open_channels(&mut self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.selections_channel.subscribe(Topic::Selections, tx.clone());
        self.selections_channel.subscribe(Topic::Errors, tx.clone());
        self.selections_channel
            .connect(RoomScope::Selections(self.scope.clone()));

        self.odds_channel.subscribe(Topic::Odds, tx.clone());
        self.odds_channel.subscribe(Topic::Errors, tx);
        self.odds_channel.connect(RoomScope::Odds(self.scope.clone()));
        rx
    }

    async fn handle_event(&mut self, event: ChannelEvent, now: Instant) {
        if !self.mounted {
            return;
        }
        match event {
            ChannelEvent::Selections(participants) => {
                match self.reconciler.reconcile(participants, now) {
                    Reconciliation::Accepted => {
                        let accepted = self.reconciler.baseline();
                        put_json(&*self.cache, &CacheKey::Selections(self.scope.clone()), accepted)
                            .await;
                        self.odds.merge(accepted);
                        put_json(&*self.cache, &CacheKey::Odds(self.scope.clone()), &self.odds.entries())
                            .await;
                        self.notices.flash(NoticeKind::Updated, now);
                        debug!(scope = %self.scope, "selections update accepted");
                    }
                    Reconciliation::Suppressed => {
                        debug!(scope = %self.scope, "selections update unchanged, suppressed");
                    }
                }
            }
            ChannelEvent::Odds { horse_id, data } => {
                if self.odds.apply(&horse_id, data) {
                    put_json(&*self.cache, &CacheKey::Odds(self.scope.clone()), &self.odds.entries())
                        .await;
                    debug!(scope = %self.scope, horse = %horse_id, "odds updated");
                } else {
                    debug!(scope = %self.scope, horse = %horse_id, "odds unchanged or unknown horse");
                }
            }
            ChannelEvent::ServerError(message) => {
                self.notices.flash(NoticeKind::ServerError(message), now);
            }
            ChannelEvent::ConnectError(_) => {
                self.notices.flash(NoticeKind::ConnectionError, now);
            }
            ChannelEvent::Reunions(_) => debug!("ignoring reunions event in race view"),
        }
    }

    fn handle_command(&mut self, command: RaceCommand, _now: Instant) -> Control {
        match command {
            RaceCommand::DismissNotice => {
                self.notices.dismiss();
                Control::Continue
            }
            RaceCommand::Unmount => Control::Unmount,
        }
    }

    fn on_tick(&mut self, now: Instant) {
        if let Some(participants) = self.reconciler.take_due(now) {
            self.participants = participants;
            self.load_state = LoadState::Fresh;
            self.notices.unpin();
        }
        self.notices.expire(now);
    }

    fn next_deadline(&self) -> Option<Instant> {
        earliest(self.reconciler.next_deadline(), self.notices.next_deadline())
    }

    fn unmount(&mut self) {
        self.selections_channel.disconnect();
        self.odds_channel.disconnect();
        self.reconciler.cancel();
        self.mounted = false;
        info!(scope = %self.scope, "race view unmounted");
    }

    fn snapshot(&self) -> RaceSnapshot {
        let loading = self.load_state == LoadState::Loading;
        let odds = self.odds.sorted();
        let empty_text = if loading {
            Some(translate(self.locale, "participants.loading"))
        } else if self.participants.is_empty() {
            Some(translate(self.locale, "participants.noSelections"))
        } else {
            None
        };
        RaceSnapshot {
            scope: self.scope.clone(),
            mounted: self.mounted,
            load_state: self.load_state,
            notice: self.notices.render(self.locale, UPDATED_KEY),
            empty_text,
            participants: self
                .participants
                .iter()
                .map(|p| self.participant_view(p))
                .collect(),
            odds_empty_text: (!loading && odds.is_empty())
                .then(|| translate(self.locale, "odds.none")),
            odds,
        }
    }
}
