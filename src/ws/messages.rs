//! Socket.IO (protocol v5) over Engine.IO v4.
//!
//! Each websocket text frame, or each record of a long-polling payload,
//! carries one Engine.IO packet: a one-digit packet type followed by its
//! payload. Socket.IO packets ride inside Engine.IO
//! `message` packets (`4`) with their own one-digit type, so an event looks
//! like `42["reunions_update",{...}]`.

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::error::{AppError, Result};
use crate::types::{MeetingDate, Odds, Participant, RaceScope, ReunionCollection};

// ---------------------------------------------------------------------------
// Rooms and topics
// ---------------------------------------------------------------------------

/// Room joined right after the namespace connect is acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomScope {
    /// `join_reunions {date}`
    Reunions(MeetingDate),
    /// `join {date, reunion_label, race_label}`
    Selections(RaceScope),
    /// `join_odds {date, reunion_label, race_label}`
    Odds(RaceScope),
}

impl RoomScope {
    pub fn join_event(&self) -> (&'static str, Value) {
        match self {
            RoomScope::Reunions(date) => ("join_reunions", json!({ "date": date })),
            RoomScope::Selections(s) => ("join", race_payload(s)),
            RoomScope::Odds(s) => ("join_odds", race_payload(s)),
        }
    }
}

fn race_payload(scope: &RaceScope) -> Value {
    json!({
        "date": scope.date,
        "reunion_label": scope.reunion_label,
        "race_label": scope.race_label,
    })
}

/// Delivery topic. Each topic has at most one sink per channel manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Reunions,
    Selections,
    Odds,
    /// Server `error` events and transport connect errors.
    Errors,
}

/// Event handed to a view's sink.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Reunions(ReunionCollection),
    Selections(Vec<Participant>),
    Odds { horse_id: String, data: Odds },
    ServerError(String),
    ConnectError(String),
}

impl ChannelEvent {
    pub fn topic(&self) -> Topic {
        match self {
            ChannelEvent::Reunions(_) => Topic::Reunions,
            ChannelEvent::Selections(_) => Topic::Selections,
            ChannelEvent::Odds { .. } => Topic::Odds,
            ChannelEvent::ServerError(_) | ChannelEvent::ConnectError(_) => Topic::Errors,
        }
    }
}

// ---------------------------------------------------------------------------
// Frame decoding
// ---------------------------------------------------------------------------

/// Engine.IO `open` payload.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    /// Transports the session may upgrade to.
    #[serde(default)]
    pub upgrades: Vec<String>,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_ping_timeout() -> u64 {
    20_000
}

#[derive(Debug, PartialEq)]
pub enum Frame {
    Open(Handshake),
    Close,
    Ping,
    Pong,
    Noop,
    /// Namespace connect acknowledged.
    Connected,
    /// Server dropped us from the namespace.
    ServerDisconnect,
    ConnectError(String),
    Event { name: String, payload: Value },
    /// Acks, binary packets and upgrade pongs; nothing to do.
    Ignored,
}

pub fn parse_frame(raw: &str) -> Result<Frame> {
    let mut chars = raw.chars();
    let frame = match chars.next() {
        Some('0') => Frame::Open(serde_json::from_str(chars.as_str())?),
        Some('1') => Frame::Close,
        Some('2') => Frame::Ping,
        Some('3') => Frame::Pong,
        Some('4') => parse_socket_packet(chars.as_str())?,
        Some('5') => Frame::Ignored,
        Some('6') => Frame::Noop,
        _ => return Err(AppError::Protocol(format!("unknown engine packet: {}", sample(raw)))),
    };
    Ok(frame)
}

fn parse_socket_packet(raw: &str) -> Result<Frame> {
    let mut chars = raw.chars();
    let frame = match chars.next() {
        Some('0') => Frame::Connected,
        Some('1') => Frame::ServerDisconnect,
        Some('2') => parse_event(chars.as_str())?,
        Some('3') | Some('5') | Some('6') => Frame::Ignored,
        Some('4') => {
            let message = serde_json::from_str::<Value>(chars.as_str())
                .ok()
                .and_then(|v| match v {
                    Value::String(s) => Some(s),
                    v => v.get("message").and_then(Value::as_str).map(str::to_string),
                })
                .unwrap_or_else(|| "connect error".to_string());
            Frame::ConnectError(message)
        }
        _ => return Err(AppError::Protocol(format!("unknown socket packet: {}", sample(raw)))),
    };
    Ok(frame)
}

fn parse_event(raw: &str) -> Result<Frame> {
    // Optional ack id precedes the array.
    let body = raw.trim_start_matches(|c: char| c.is_ascii_digit());
    let mut items = match serde_json::from_str::<Value>(body)? {
        Value::Array(items) if !items.is_empty() => items.into_iter(),
        _ => return Err(AppError::Protocol(format!("event is not [name, ...]: {}", sample(raw)))),
    };
    let name = match items.next() {
        Some(Value::String(name)) => name,
        _ => return Err(AppError::Protocol(format!("event name missing: {}", sample(raw)))),
    };
    Ok(Frame::Event {
        name,
        payload: items.next().unwrap_or(Value::Null),
    })
}

#[derive(Deserialize)]
struct SelectionPayload {
    #[serde(default)]
    selected_horses: Option<Vec<Participant>>,
}

#[derive(Deserialize)]
struct OddsPayload {
    #[serde(deserialize_with = "horse_id")]
    horse_id: String,
    data: Odds,
}

fn horse_id<'de, D: serde::Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) => s,
        other => other.to_string(),
    })
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    message: Option<String>,
}

/// Maps a named event to its typed form. `Ok(None)` for events this client
/// does not consume.
pub fn decode_event(name: &str, payload: Value) -> Result<Option<ChannelEvent>> {
    let event = match name {
        "reunions_update" => ChannelEvent::Reunions(serde_json::from_value(payload)?),
        "selection_update" => {
            let p: SelectionPayload = serde_json::from_value(payload)?;
            ChannelEvent::Selections(p.selected_horses.unwrap_or_default())
        }
        "odds_update" => {
            let p: OddsPayload = serde_json::from_value(payload)?;
            ChannelEvent::Odds {
                horse_id: p.horse_id,
                data: p.data,
            }
        }
        "error" => {
            // Empty message: the view shows its localized fallback.
            let message = serde_json::from_value::<ErrorPayload>(payload)
                .ok()
                .and_then(|p| p.message)
                .unwrap_or_default();
            ChannelEvent::ServerError(message)
        }
        _ => return Ok(None),
    };
    Ok(Some(event))
}

// ---------------------------------------------------------------------------
// Frame encoding
// ---------------------------------------------------------------------------

pub const PONG: &str = "3";
pub const NAMESPACE_CONNECT: &str = "40";
pub const NAMESPACE_DISCONNECT: &str = "41";

pub fn encode_event(name: &str, payload: &Value) -> String {
    format!("42{}", json!([name, payload]))
}

pub const CLOSE: &str = "1";
pub const UPGRADE_PING: &str = "2probe";
pub const UPGRADE_PONG: &str = "3probe";
pub const UPGRADE: &str = "5";

/// How a session reaches the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportMode {
    /// Long-polling handshake, upgraded to a websocket when the server offers
    /// one and the upgrade succeeds.
    #[default]
    PollingFirst,
    /// Straight to the websocket transport.
    WebsocketOnly,
}

impl TransportMode {
    /// `websocket` selects [`TransportMode::WebsocketOnly`]; anything else
    /// keeps the polling-first default.
    pub fn from_name(name: &str) -> Self {
        if name.trim().eq_ignore_ascii_case("websocket") {
            TransportMode::WebsocketOnly
        } else {
            TransportMode::PollingFirst
        }
    }
}

/// Engine.IO endpoint of a Socket.IO server, for both transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEndpoint {
    http: String,
    ws: String,
    mode: TransportMode,
}

impl EngineEndpoint {
    /// Accepts an http(s) or ws(s) server base.
    pub fn parse(base: &str, mode: TransportMode) -> Result<Self> {
        let base = base.trim().trim_end_matches('/');
        let (scheme, rest) = base
            .split_once("://")
            .ok_or_else(|| AppError::Config(format!("realtime URL has no scheme: {base}")))?;
        let (http, ws) = match scheme {
            "http" | "ws" => ("http", "ws"),
            "https" | "wss" => ("https", "wss"),
            other => return Err(AppError::Config(format!("unsupported realtime scheme: {other}"))),
        };
        Ok(Self {
            http: format!("{http}://{rest}/socket.io/?EIO=4"),
            ws: format!("{ws}://{rest}/socket.io/?EIO=4"),
            mode,
        })
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn polling_url(&self, sid: Option<&str>) -> String {
        with_sid(format!("{}&transport=polling", self.http), sid)
    }

    pub fn websocket_url(&self, sid: Option<&str>) -> String {
        with_sid(format!("{}&transport=websocket", self.ws), sid)
    }
}

impl std::fmt::Display for EngineEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.mode {
            TransportMode::PollingFirst => f.write_str(&self.polling_url(None)),
            TransportMode::WebsocketOnly => f.write_str(&self.websocket_url(None)),
        }
    }
}

fn with_sid(url: String, sid: Option<&str>) -> String {
    match sid {
        Some(sid) => format!("{url}&sid={sid}"),
        None => url,
    }
}

fn sample(raw: &str) -> &str {
    match raw.char_indices().nth(200) {
        Some((idx, _)) => &raw[..idx],
        None => raw,
    }
}

/// Parse failures are logged and dropped; one bad frame never ends a session.
pub fn decode_text(raw: &str) -> Option<Frame> {
    match parse_frame(raw) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!("[WS PARSE] dropping frame: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OddsRecord, ParticipantKind, UnavailableReason};

    fn date() -> MeetingDate {
        MeetingDate::parse("25122024").unwrap()
    }

    #[test]
    fn parses_engine_open() {
        let raw = r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#;
        match parse_frame(raw).unwrap() {
            Frame::Open(h) => {
                assert_eq!(h.sid, "abc");
                assert_eq!(h.ping_interval, 25_000);
                assert_eq!(h.ping_timeout, 20_000);
            }
            other => panic!("expected Open, got {other:?}"),
        }
    }

    #[test]
    fn parses_control_packets() {
        assert_eq!(parse_frame("2").unwrap(), Frame::Ping);
        assert_eq!(parse_frame(r#"40{"sid":"x"}"#).unwrap(), Frame::Connected);
        assert_eq!(parse_frame("41").unwrap(), Frame::ServerDisconnect);
        assert_eq!(
            parse_frame(r#"44{"message":"Not authorized"}"#).unwrap(),
            Frame::ConnectError("Not authorized".to_string())
        );
        assert!(parse_frame("9oops").is_err());
        assert!(parse_frame("").is_err());
    }

    #[test]
    fn parses_event_with_and_without_ack_id() {
        let frame = parse_frame(r#"42["reunions_update",{"R1":[]}]"#).unwrap();
        assert_eq!(
            frame,
            Frame::Event {
                name: "reunions_update".to_string(),
                payload: json!({"R1": []}),
            }
        );
        let frame = parse_frame(r#"4213["error",{"message":"boom"}]"#).unwrap();
        assert!(matches!(frame, Frame::Event { ref name, .. } if name == "error"));
    }

    #[test]
    fn decodes_reunions_update() {
        let payload = json!({"R1": [{"race_label": "C1", "race_status": "running"}]});
        match decode_event("reunions_update", payload).unwrap() {
            Some(ChannelEvent::Reunions(c)) => {
                assert_eq!(c.races("R1").unwrap()[0].race_status, "running");
            }
            other => panic!("expected Reunions, got {other:?}"),
        }
    }

    #[test]
    fn decodes_selection_update_missing_list_as_empty() {
        let event = decode_event("selection_update", json!({})).unwrap();
        assert_eq!(event, Some(ChannelEvent::Selections(vec![])));

        let payload = json!({"selected_horses": [{"num_pmu": "1", "name": "A", "type": "watched"}]});
        match decode_event("selection_update", payload).unwrap() {
            Some(ChannelEvent::Selections(list)) => assert_eq!(list[0].kind, ParticipantKind::Watched),
            other => panic!("expected Selections, got {other:?}"),
        }
    }

    #[test]
    fn decodes_odds_update_record_or_sentinel() {
        let payload = json!({
            "horse_id": 5,
            "data": {"odds": "4.2", "odds_rank": "2", "big_bet": "yes", "odds_time": "14:02"}
        });
        match decode_event("odds_update", payload).unwrap() {
            Some(ChannelEvent::Odds { horse_id, data: Odds::Available(OddsRecord { odds, .. }) }) => {
                assert_eq!(horse_id, "5");
                assert_eq!(odds, "4.2");
            }
            other => panic!("expected Odds, got {other:?}"),
        }

        let payload = json!({"horse_id": "5", "data": "Error loading odds"});
        assert_eq!(
            decode_event("odds_update", payload).unwrap(),
            Some(ChannelEvent::Odds {
                horse_id: "5".to_string(),
                data: Odds::Unavailable(UnavailableReason::LoadFailed),
            })
        );
    }

    #[test]
    fn error_without_message_carries_empty_text() {
        assert_eq!(
            decode_event("error", json!({})).unwrap(),
            Some(ChannelEvent::ServerError(String::new()))
        );
        assert_eq!(
            decode_event("error", json!("not an object")).unwrap(),
            Some(ChannelEvent::ServerError(String::new()))
        );
    }

    #[test]
    fn unknown_event_is_skipped_and_malformed_is_error() {
        assert_eq!(decode_event("something_else", json!({})).unwrap(), None);
        assert!(decode_event("reunions_update", json!([1, 2])).is_err());
    }

    #[test]
    fn join_events_per_scope() {
        let (name, payload) = RoomScope::Reunions(date()).join_event();
        assert_eq!(encode_event(name, &payload), r#"42["join_reunions",{"date":"25122024"}]"#);

        let scope = RaceScope::new(date(), "R1", "C4");
        let (name, payload) = RoomScope::Odds(scope.clone()).join_event();
        assert_eq!(name, "join_odds");
        assert_eq!(payload["race_label"], "C4");
        assert_eq!(RoomScope::Selections(scope).join_event().0, "join");
    }

    #[test]
    fn handshake_lists_upgrades() {
        let raw = r#"0{"sid":"p1","upgrades":["websocket"],"pingInterval":25000,"pingTimeout":20000}"#;
        match parse_frame(raw).unwrap() {
            Frame::Open(h) => assert_eq!(h.upgrades, ["websocket"]),
            other => panic!("expected Open, got {other:?}"),
        }
        assert_eq!(parse_frame(UPGRADE_PONG).unwrap(), Frame::Pong);
    }

    #[test]
    fn builds_endpoint_urls_for_both_transports() {
        let endpoint = EngineEndpoint::parse("http://localhost:5010/", TransportMode::default()).unwrap();
        assert_eq!(endpoint.mode(), TransportMode::PollingFirst);
        assert_eq!(
            endpoint.polling_url(None),
            "http://localhost:5010/socket.io/?EIO=4&transport=polling"
        );
        assert_eq!(
            endpoint.websocket_url(Some("p1")),
            "ws://localhost:5010/socket.io/?EIO=4&transport=websocket&sid=p1"
        );

        let endpoint = EngineEndpoint::parse("wss://live.example.com", TransportMode::WebsocketOnly).unwrap();
        assert_eq!(
            endpoint.polling_url(Some("x")),
            "https://live.example.com/socket.io/?EIO=4&transport=polling&sid=x"
        );
        assert_eq!(
            endpoint.to_string(),
            "wss://live.example.com/socket.io/?EIO=4&transport=websocket"
        );
        assert!(EngineEndpoint::parse("localhost:5010", TransportMode::default()).is_err());
        assert!(EngineEndpoint::parse("ftp://x", TransportMode::default()).is_err());
    }

    #[test]
    fn transport_mode_names() {
        assert_eq!(TransportMode::from_name("WebSocket"), TransportMode::WebsocketOnly);
        assert_eq!(TransportMode::from_name("polling"), TransportMode::PollingFirst);
        assert_eq!(TransportMode::from_name(""), TransportMode::PollingFirst);
    }
}
