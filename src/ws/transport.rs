//! Engine.IO transports. A session starts on long-polling and moves to a
//! websocket when the server offers one; it stays on polling otherwise.

use std::collections::VecDeque;

use futures_util::{SinkExt, StreamExt};
use reqwest::header::CONTENT_TYPE;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::config::UPGRADE_TIMEOUT;
use crate::error::{AppError, Result};
use crate::ws::messages::{
    decode_text, EngineEndpoint, Frame, Handshake, TransportMode, CLOSE, UPGRADE, UPGRADE_PING,
    UPGRADE_PONG,
};

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Separates packets inside one polling payload.
const RECORD_SEPARATOR: char = '\u{1e}';

/// Opens an Engine.IO session the way `endpoint` asks for and returns it with
/// the server's open packet.
pub async fn open(endpoint: &EngineEndpoint) -> Result<(Transport, Handshake)> {
    match endpoint.mode() {
        TransportMode::WebsocketOnly => {
            let (socket, _) = connect_async(endpoint.websocket_url(None)).await?;
            let mut transport = Transport::Websocket(socket);
            loop {
                match transport.next_frame().await? {
                    Some(Frame::Open(h)) => return Ok((transport, h)),
                    Some(other) => debug!(?other, "ignored before engine open"),
                    None => return Err(closed("engine open")),
                }
            }
        }
        TransportMode::PollingFirst => {
            let client = reqwest::Client::builder().build()?;
            let (polling, handshake) = PollingSession::open(client, endpoint).await?;
            if !handshake.upgrades.iter().any(|u| u == "websocket") {
                debug!(sid = %handshake.sid, "no websocket upgrade offered, staying on polling");
                return Ok((Transport::Polling(polling), handshake));
            }
            match timeout(UPGRADE_TIMEOUT, upgrade(endpoint, &handshake.sid)).await {
                Ok(Ok(socket)) => {
                    debug!(sid = %handshake.sid, "upgraded to websocket");
                    Ok((Transport::Websocket(socket), handshake))
                }
                Ok(Err(e)) => {
                    warn!(sid = %handshake.sid, "websocket upgrade failed, staying on polling: {e}");
                    Ok((Transport::Polling(polling), handshake))
                }
                Err(_) => {
                    warn!(sid = %handshake.sid, "websocket upgrade timed out, staying on polling");
                    Ok((Transport::Polling(polling), handshake))
                }
            }
        }
    }
}

/// Pings a websocket on the polling session's sid, then commits the upgrade.
async fn upgrade(endpoint: &EngineEndpoint, sid: &str) -> Result<Socket> {
    let (mut socket, _) = connect_async(endpoint.websocket_url(Some(sid))).await?;
    socket.send(Message::Text(UPGRADE_PING.into())).await?;
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) if text == UPGRADE_PONG => break,
            Some(Ok(Message::Text(text))) => {
                debug!(frame = %text, "ignored while checking the upgrade")
            }
            Some(Ok(Message::Close(_))) | None => return Err(closed("upgrade check")),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
    socket.send(Message::Text(UPGRADE.into())).await?;
    Ok(socket)
}

fn closed(during: &str) -> AppError {
    AppError::Protocol(format!("transport closed during {during}"))
}

pub enum Transport {
    Websocket(Socket),
    Polling(PollingSession),
}

impl Transport {
    pub fn name(&self) -> &'static str {
        match self {
            Transport::Websocket(_) => "websocket",
            Transport::Polling(_) => "polling",
        }
    }

    pub async fn send(&mut self, packet: &str) -> Result<()> {
        match self {
            Transport::Websocket(socket) => socket.send(Message::Text(packet.into())).await?,
            Transport::Polling(polling) => polling.send(packet).await?,
        }
        Ok(())
    }

    /// Next decoded packet; `Ok(None)` once the peer has closed the transport.
    /// Undecodable packets are skipped.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            let raw = match self {
                Transport::Websocket(socket) => match socket.next().await {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Ping(data))) => {
                        socket.send(Message::Pong(data)).await?;
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(None),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                },
                Transport::Polling(polling) => polling.recv().await?,
            };
            if let Some(frame) = decode_text(&raw) {
                return Ok(Some(frame));
            }
        }
    }

    /// Best effort; the peer may already be gone.
    pub async fn close(&mut self) {
        let res = match self {
            Transport::Websocket(socket) => {
                socket.send(Message::Close(None)).await.map_err(AppError::from)
            }
            Transport::Polling(polling) => polling.send(CLOSE).await,
        };
        if let Err(e) = res {
            debug!("transport close: {e}");
        }
    }
}

/// Engine.IO long-polling: GET waits for server packets, POST carries ours.
pub struct PollingSession {
    client: reqwest::Client,
    url: String,
    inbox: VecDeque<String>,
}

impl PollingSession {
    async fn open(client: reqwest::Client, endpoint: &EngineEndpoint) -> Result<(Self, Handshake)> {
        let body = get_text(&client, &endpoint.polling_url(None)).await?;
        let mut packets = split_payload(&body);
        let handshake = match packets.pop_front().as_deref().and_then(decode_text) {
            Some(Frame::Open(h)) => h,
            other => {
                return Err(AppError::Protocol(format!(
                    "expected engine open over polling, got {other:?}"
                )))
            }
        };
        let url = endpoint.polling_url(Some(&handshake.sid));
        Ok((
            Self {
                client,
                url,
                inbox: packets,
            },
            handshake,
        ))
    }

    async fn send(&self, packet: &str) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "text/plain;charset=UTF-8")
            .body(packet.to_string())
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AppError::HttpStatus {
                status: status.as_u16(),
                url: self.url.clone(),
            });
        }
        Ok(())
    }

    /// Buffered packet if any, else one long-poll.
    async fn recv(&mut self) -> Result<String> {
        loop {
            if let Some(packet) = self.inbox.pop_front() {
                return Ok(packet);
            }
            let body = get_text(&self.client, &self.url).await?;
            self.inbox.extend(split_payload(&body));
        }
    }
}

async fn get_text(client: &reqwest::Client, url: &str) -> Result<String> {
    let resp = client.get(url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(AppError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
        });
    }
    Ok(resp.text().await?)
}

fn split_payload(body: &str) -> VecDeque<String> {
    body.split(RECORD_SEPARATOR)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polling_payload_splits_on_record_separator() {
        let packets = split_payload("2\u{1e}42[\"error\",{}]\u{1e}");
        assert_eq!(packets, ["2", "42[\"error\",{}]"]);
        assert!(split_payload("").is_empty());
    }
}
