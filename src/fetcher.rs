use std::future::Future;

use indexmap::IndexMap;
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::FETCH_TIMEOUT;
use crate::error::{AppError, Result};
use crate::types::{MeetingDate, Participant, RaceDetail, RaceScope, ReunionCollection};

/// One-shot REST reads. Every call is bounded by [`FETCH_TIMEOUT`].
pub trait SnapshotFetcher: Send + Sync {
    fn fetch_reunions(
        &self,
        date: &MeetingDate,
    ) -> impl Future<Output = Result<ReunionCollection>> + Send;

    fn fetch_selections(
        &self,
        scope: &RaceScope,
    ) -> impl Future<Output = Result<Vec<Participant>>> + Send;
}

/// `GET /reunions/{date}`
#[derive(Debug, Deserialize)]
pub struct ReunionResponse {
    #[allow(dead_code)]
    pub date: String,
    /// Reunion label → race labels. Redundant with `full_details`.
    #[serde(default)]
    #[allow(dead_code)]
    pub reunions_races: IndexMap<String, Vec<String>>,
    pub full_details: ReunionCollection,
}

/// `GET /horse_selections/{date}/{reunion}/{race}`
#[derive(Debug, Deserialize)]
pub struct SelectionsResponse {
    #[serde(default)]
    pub selected_horses: Vec<Participant>,
}

pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpFetcher {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
        let base_url = Url::parse(base_url)
            .map_err(|e| AppError::Config(format!("invalid API URL {base_url:?}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::Config(format!("API URL cannot take a path: {base_url}")));
        }
        Ok(Self { client, base_url })
    }

    /// Appends `segments` to the base path, percent-encoding each one.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T> {
        let resp = self.client.get(url.clone()).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AppError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(resp.json::<T>().await?)
    }
}

impl SnapshotFetcher for HttpFetcher {
    async fn fetch_reunions(&self, date: &MeetingDate) -> Result<ReunionCollection> {
        let date = date.to_string();
        let resp: ReunionResponse = self.get_json(self.url(&["reunions", date.as_str()])).await?;
        debug!(%date, reunions = resp.full_details.len(), "fetched reunions snapshot");
        Ok(resp.full_details)
    }

    async fn fetch_selections(&self, scope: &RaceScope) -> Result<Vec<Participant>> {
        let date = scope.date.to_string();
        let url = self.url(&[
            "horse_selections",
            date.as_str(),
            scope.reunion_label.as_str(),
            scope.race_label.as_str(),
        ]);
        let resp: SelectionsResponse = self.get_json(url).await?;
        debug!(scope = %scope, count = resp.selected_horses.len(), "fetched selections");
        Ok(resp.selected_horses)
    }
}

/// Selections for every race of one reunion, fetched one race at a time.
/// A failed race gets an empty list; the others are unaffected.
pub async fn fetch_reunion_selections<F: SnapshotFetcher + ?Sized>(
    fetcher: &F,
    date: &MeetingDate,
    reunion_label: &str,
    races: &[RaceDetail],
) -> IndexMap<String, Vec<Participant>> {
    let mut by_race = IndexMap::with_capacity(races.len());
    for race in races {
        let scope = RaceScope::new(date.clone(), reunion_label, race.race_label.as_str());
        let selections = match fetcher.fetch_selections(&scope).await {
            Ok(s) => s,
            Err(e) => {
                warn!(scope = %scope, "selections fetch failed: {e}");
                Vec::new()
            }
        };
        by_race.insert(race.race_label.clone(), selections);
    }
    by_race
}
