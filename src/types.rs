use std::fmt;

use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{AppError, Result};

// ---------------------------------------------------------------------------
// MeetingDate
// ---------------------------------------------------------------------------

/// Day identifier in `DDMMYYYY` form. Partition key for REST lookups, realtime
/// rooms and cache entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct MeetingDate(String);

impl MeetingDate {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.len() != 8 || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AppError::InvalidDate(raw.to_string()));
        }
        NaiveDate::parse_from_str(raw, "%d%m%Y")
            .map_err(|_| AppError::InvalidDate(raw.to_string()))?;
        Ok(Self(raw.to_string()))
    }

    /// The client's local calendar day.
    pub fn today() -> Self {
        Self::from_naive(chrono::Local::now().date_naive())
    }

    pub fn from_naive(date: NaiveDate) -> Self {
        Self(date.format("%d%m%Y").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MeetingDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One race within a meeting day. Scopes the nested realtime rooms and the
/// selections / odds cache entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RaceScope {
    pub date: MeetingDate,
    pub reunion_label: String,
    pub race_label: String,
}

impl RaceScope {
    pub fn new(date: MeetingDate, reunion_label: impl Into<String>, race_label: impl Into<String>) -> Self {
        Self {
            date,
            reunion_label: reunion_label.into(),
            race_label: race_label.into(),
        }
    }
}

impl fmt::Display for RaceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.date, self.reunion_label, self.race_label)
    }
}

// ---------------------------------------------------------------------------
// Races and reunions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaceDetail {
    pub meeting_timestamp: i64,
    pub reunion_label: String,
    pub race_label: String,
    /// Epoch milliseconds despite the name.
    pub start_time_in_s: i64,
    pub race_status: String,
    pub race_name: String,
    pub race_is_quinte: bool,
    pub race_guid: String,
    pub start_date: String,
    pub start_timestamp: Option<i64>,
    pub distance: String,
    pub discipline: String,
    pub starters_count: u32,
    pub racecourse: String,
    pub ground_condition: String,
    pub weather_description: String,
}

impl RaceDetail {
    /// Start time in epoch ms. `start_timestamp` wins when both candidates are set.
    pub fn start_ms(&self) -> Option<i64> {
        match self.start_timestamp {
            Some(ts) if ts > 0 => Some(ts),
            _ if self.start_time_in_s > 0 => Some(self.start_time_in_s),
            _ => None,
        }
    }
}

/// Reunion label → races, in server order. Server order is navigation order,
/// so equality is order-sensitive (unlike `IndexMap`'s own `PartialEq`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReunionCollection(IndexMap<String, Vec<RaceDetail>>);

impl ReunionCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, label: impl Into<String>, races: Vec<RaceDetail>) {
        self.0.insert(label.into(), races);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Reunion label → race labels, in collection order.
    pub fn schedule(&self) -> IndexMap<String, Vec<String>> {
        self.0
            .iter()
            .map(|(label, races)| {
                let race_labels: Vec<String> = races.iter().map(|r| r.race_label.clone()).collect();
                (label.clone(), race_labels)
            })
            .collect()
    }

    pub fn races(&self, label: &str) -> Option<&[RaceDetail]> {
        self.0.get(label).map(Vec::as_slice)
    }

    /// Entry at navigation position `index`.
    pub fn get_index(&self, index: usize) -> Option<(&str, &[RaceDetail])> {
        self.0
            .get_index(index)
            .map(|(label, races)| (label.as_str(), races.as_slice()))
    }
}

impl PartialEq for ReunionCollection {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len() && self.0.iter().eq(other.0.iter())
    }
}

impl Eq for ReunionCollection {}

impl FromIterator<(String, Vec<RaceDetail>)> for ReunionCollection {
    fn from_iter<I: IntoIterator<Item = (String, Vec<RaceDetail>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// Participants and odds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantKind {
    #[serde(rename = "favori")]
    Favorite,
    #[serde(rename = "tocard")]
    Outsider,
    #[serde(rename = "watched")]
    Watched,
}

impl ParticipantKind {
    /// Translation key for the category label.
    pub fn label_key(self) -> &'static str {
        match self {
            ParticipantKind::Favorite => "participants.favori",
            ParticipantKind::Outsider => "participants.tocard",
            ParticipantKind::Watched => "participants.watched",
        }
    }
}

/// Market price snapshot. Every field arrives as a string on the wire, but
/// numbers and booleans are tolerated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OddsRecord {
    #[serde(deserialize_with = "lenient_string")]
    pub odds: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub odds_rank: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub big_bet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_diff: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub odds_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub odds_time: Option<String>,
}

impl OddsRecord {
    /// Numeric odds, for ordering. Accepts a decimal comma.
    pub fn value(&self) -> Option<f64> {
        self.odds.trim().replace(',', ".").parse::<f64>().ok()
    }
}

/// Why a participant has no odds record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum UnavailableReason {
    NotYetPublished,
    LoadFailed,
    Other(String),
}

const NO_ODDS: &str = "No odds available";
const ODDS_ERROR: &str = "Error loading odds";

impl From<String> for UnavailableReason {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            NO_ODDS => UnavailableReason::NotYetPublished,
            ODDS_ERROR => UnavailableReason::LoadFailed,
            _ => UnavailableReason::Other(raw),
        }
    }
}

impl From<UnavailableReason> for String {
    fn from(reason: UnavailableReason) -> Self {
        match reason {
            UnavailableReason::NotYetPublished => NO_ODDS.to_string(),
            UnavailableReason::LoadFailed => ODDS_ERROR.to_string(),
            UnavailableReason::Other(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Odds {
    Available(OddsRecord),
    Unavailable(UnavailableReason),
}

impl Default for Odds {
    fn default() -> Self {
        Odds::Unavailable(UnavailableReason::NotYetPublished)
    }
}

impl Odds {
    pub fn record(&self) -> Option<&OddsRecord> {
        match self {
            Odds::Available(record) => Some(record),
            Odds::Unavailable(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    #[serde(deserialize_with = "lenient_string")]
    pub num_pmu: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParticipantKind,
    #[serde(default)]
    pub latest_odds: Odds,
}

/// Current odds of one participant, tracked apart from the selection list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OddsEntry {
    pub num_pmu: String,
    pub name: String,
    pub latest_odds: Odds,
}

impl From<&Participant> for OddsEntry {
    fn from(p: &Participant) -> Self {
        Self {
            num_pmu: p.num_pmu.clone(),
            name: p.name.clone(),
            latest_odds: p.latest_odds.clone(),
        }
    }
}

/// Accepts a JSON string, number, bool or null and yields its string form.
fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde_json::Value;
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Bool(true) => "true".to_string(),
        Value::Bool(false) | Value::Null => String::new(),
        other => other.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meeting_date_accepts_real_days_only() {
        assert_eq!(MeetingDate::parse("25122024").unwrap().as_str(), "25122024");
        assert!(MeetingDate::parse("31022024").is_err());
        assert!(MeetingDate::parse("2512202").is_err());
        assert!(MeetingDate::parse("2024-12-25").is_err());
    }

    #[test]
    fn meeting_date_formats_naive_date() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(MeetingDate::from_naive(date).as_str(), "07032024");
        assert_eq!(MeetingDate::today().as_str().len(), 8);
    }

    #[test]
    fn collection_equality_is_order_sensitive() {
        let mut a = ReunionCollection::new();
        a.insert("R1", vec![]);
        a.insert("R2", vec![]);
        let mut b = ReunionCollection::new();
        b.insert("R2", vec![]);
        b.insert("R1", vec![]);
        assert_ne!(a, b);

        let mut c = ReunionCollection::new();
        c.insert("R1", vec![]);
        c.insert("R2", vec![]);
        assert_eq!(a, c);
    }

    #[test]
    fn collection_keeps_server_order() {
        let raw = r#"{"R3":[],"R1":[{"race_label":"C1"}],"R2":[]}"#;
        let collection: ReunionCollection = serde_json::from_str(raw).unwrap();
        let labels: Vec<_> = collection.schedule().into_keys().collect();
        assert_eq!(labels, ["R3", "R1", "R2"]);
        assert_eq!(collection.races("R1").unwrap()[0].race_label, "C1");
    }

    #[test]
    fn start_ms_prefers_start_timestamp() {
        let mut race = RaceDetail {
            start_time_in_s: 1_000,
            start_timestamp: Some(2_000),
            ..Default::default()
        };
        assert_eq!(race.start_ms(), Some(2_000));
        race.start_timestamp = None;
        assert_eq!(race.start_ms(), Some(1_000));
        race.start_time_in_s = 0;
        assert_eq!(race.start_ms(), None);
    }

    #[test]
    fn participant_odds_record_or_sentinel() {
        let raw = r#"[
            {"num_pmu":"4","name":"Bold Eagle","type":"favori",
             "latest_odds":{"time_diff":"2m","odds":"3.5","odds_rank":"1","big_bet":""}},
            {"num_pmu":7,"name":"Face Time","type":"tocard","latest_odds":"No odds available"},
            {"num_pmu":"9","name":"Davidson","type":"watched","latest_odds":"Error loading odds"},
            {"num_pmu":"11","name":"Idao","type":"watched"}
        ]"#;
        let participants: Vec<Participant> = serde_json::from_str(raw).unwrap();

        let record = participants[0].latest_odds.record().unwrap();
        assert_eq!(record.value(), Some(3.5));
        assert!(record.big_bet.is_empty());
        assert_eq!(participants[1].num_pmu, "7");
        assert_eq!(participants[1].kind, ParticipantKind::Outsider);
        assert_eq!(
            participants[1].latest_odds,
            Odds::Unavailable(UnavailableReason::NotYetPublished)
        );
        assert_eq!(
            participants[2].latest_odds,
            Odds::Unavailable(UnavailableReason::LoadFailed)
        );
        assert_eq!(participants[3].latest_odds, Odds::default());
    }

    #[test]
    fn sentinel_survives_serialization() {
        let odds = Odds::Unavailable(UnavailableReason::LoadFailed);
        assert_eq!(serde_json::to_string(&odds).unwrap(), r#""Error loading odds""#);
    }
}
