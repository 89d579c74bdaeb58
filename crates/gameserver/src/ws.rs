use crate::rooms::{
    JoinError, MatchRoom, MatchRoomEvent, MatchServer, QueueRoom, QueueRoomEvent,
    RESERVATION_EXPIRED_CODE,
};
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Window after the join payload during which an immediate rejection (the
/// reservation-expired close) is surfaced as a join failure rather than a
/// room event.
const JOIN_REJECT_WINDOW: Duration = Duration::from_millis(1_000);

/// Live WebSocket room client. Queue rooms live at `{ws_base}/queue`,
/// match rooms at `{ws_base}/match/{match_id}`; the ws base is derived from
/// the game server's HTTP base URL.
pub struct GameSocket {
    ws_base: String,
}

impl GameSocket {
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            ws_base: ws_base_url(base_url),
        }
    }

    async fn open(&self, path: &str, join_payload: serde_json::Value) -> Result<WsStream> {
        let url = format!("{}{}", self.ws_base, path);
        tracing::debug!("Opening room socket {}", url);
        let (mut stream, _response) = connect_async(&url)
            .await
            .with_context(|| format!("failed to connect to {url}"))?;
        stream
            .send(Message::Text(join_payload.to_string()))
            .await
            .context("failed to send join payload")?;
        Ok(stream)
    }
}

fn ws_base_url(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        trimmed.to_string()
    }
}

#[async_trait]
impl MatchServer for GameSocket {
    async fn join_queue(
        &self,
        bot_id: &str,
        rating: i64,
    ) -> Result<Box<dyn QueueRoom>, JoinError> {
        let payload = serde_json::json!({
            "type": "join",
            "userId": bot_id,
            "rating": rating,
        });
        let stream = self.open("/queue", payload).await.map_err(JoinError::Other)?;
        let mut room = LiveQueueRoom {
            stream: Some(stream),
            pending: None,
        };

        // The server rejects a join whose seat reservation lapsed by
        // closing with code 4002 right away. Catch that here so the caller
        // can apply the bounded retry; buffer anything else as the first
        // room event.
        match tokio::time::timeout(JOIN_REJECT_WINDOW, room.next_event()).await {
            Ok(Ok(QueueRoomEvent::Error { code, message }))
                if code == RESERVATION_EXPIRED_CODE =>
            {
                tracing::debug!("Queue join rejected for {}: {}", bot_id, message);
                return Err(JoinError::ReservationExpired);
            }
            Ok(Ok(QueueRoomEvent::Closed)) => {
                return Err(JoinError::Other(anyhow::anyhow!(
                    "queue room closed during join"
                )));
            }
            Ok(Ok(event)) => room.pending = Some(event),
            Ok(Err(e)) => return Err(JoinError::Other(e)),
            Err(_elapsed) => {}
        }

        Ok(Box::new(room))
    }

    async fn join_match(&self, match_id: &str, bot_id: &str) -> Result<Box<dyn MatchRoom>> {
        let payload = serde_json::json!({
            "type": "join",
            "userId": bot_id,
        });
        let stream = self.open(&format!("/match/{match_id}"), payload).await?;
        Ok(Box::new(LiveMatchRoom {
            stream: Some(stream),
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum QueueFrame {
    Queued {
        #[serde(default)]
        position: i64,
    },
    MatchFound {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "matchId")]
        match_id: String,
        #[serde(rename = "problemId")]
        problem_id: String,
    },
    Error {
        code: u16,
        #[serde(default)]
        message: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum MatchFrame {
    MatchInit,
    CodeUpdate,
    Error {
        code: u16,
        #[serde(default)]
        message: String,
    },
}

struct LiveQueueRoom {
    stream: Option<WsStream>,
    pending: Option<QueueRoomEvent>,
}

struct LiveMatchRoom {
    stream: Option<WsStream>,
}

async fn close_stream(stream: &mut Option<WsStream>) -> Result<()> {
    if let Some(mut ws) = stream.take() {
        // Best effort; the server may already be gone.
        let _ = ws.close(None).await;
    }
    Ok(())
}

/// Pulls the next text frame, transparently skipping pings and pongs
/// (tungstenite answers pings on the next flush). Returns `None` when the
/// connection ended, with the close code if the server supplied one.
async fn next_text_frame(stream: &mut WsStream) -> Result<Option<TextOrClose>> {
    loop {
        let Some(message) = stream.next().await else {
            return Ok(None);
        };
        match message.context("room socket failed")? {
            Message::Text(text) => return Ok(Some(TextOrClose::Text(text))),
            Message::Close(frame) => {
                return Ok(Some(TextOrClose::Close(frame.map(|f| u16::from(f.code)))));
            }
            Message::Ping(_) | Message::Pong(_) => {
                tracing::trace!("Room keepalive frame");
            }
            _ => {}
        }
    }
}

enum TextOrClose {
    Text(String),
    Close(Option<u16>),
}

#[async_trait]
impl QueueRoom for LiveQueueRoom {
    async fn next_event(&mut self) -> Result<QueueRoomEvent> {
        if let Some(event) = self.pending.take() {
            return Ok(event);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(QueueRoomEvent::Closed);
        };
        loop {
            match next_text_frame(stream).await? {
                None => return Ok(QueueRoomEvent::Closed),
                Some(TextOrClose::Close(code)) => {
                    if let Some(code) = code {
                        if code >= 4000 {
                            return Ok(QueueRoomEvent::Error {
                                code,
                                message: "room closed with error code".to_string(),
                            });
                        }
                    }
                    return Ok(QueueRoomEvent::Closed);
                }
                Some(TextOrClose::Text(text)) => match serde_json::from_str(&text) {
                    Ok(QueueFrame::Queued { position }) => {
                        return Ok(QueueRoomEvent::Queued { position });
                    }
                    Ok(QueueFrame::MatchFound {
                        room_id,
                        match_id,
                        problem_id,
                    }) => {
                        return Ok(QueueRoomEvent::MatchFound {
                            room_id,
                            match_id,
                            problem_id,
                        });
                    }
                    Ok(QueueFrame::Error { code, message }) => {
                        return Ok(QueueRoomEvent::Error { code, message });
                    }
                    Err(_) => {
                        tracing::debug!("Discarding unknown queue frame: {}", text);
                    }
                },
            }
        }
    }

    async fn leave(&mut self) -> Result<()> {
        close_stream(&mut self.stream).await
    }
}

#[async_trait]
impl MatchRoom for LiveMatchRoom {
    async fn next_event(&mut self) -> Result<MatchRoomEvent> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(MatchRoomEvent::Closed);
        };
        loop {
            match next_text_frame(stream).await? {
                None => return Ok(MatchRoomEvent::Closed),
                Some(TextOrClose::Close(code)) => {
                    if let Some(code) = code {
                        if code >= 4000 {
                            return Ok(MatchRoomEvent::Error {
                                code,
                                message: "room closed with error code".to_string(),
                            });
                        }
                    }
                    return Ok(MatchRoomEvent::Closed);
                }
                Some(TextOrClose::Text(text)) => match serde_json::from_str(&text) {
                    Ok(MatchFrame::MatchInit) => return Ok(MatchRoomEvent::Init),
                    Ok(MatchFrame::CodeUpdate) => return Ok(MatchRoomEvent::CodeUpdate),
                    Ok(MatchFrame::Error { code, message }) => {
                        return Ok(MatchRoomEvent::Error { code, message });
                    }
                    Err(_) => {
                        tracing::debug!("Discarding unknown match frame: {}", text);
                    }
                },
            }
        }
    }

    async fn leave(&mut self) -> Result<()> {
        close_stream(&mut self.stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_base_from_http_and_https() {
        assert_eq!(ws_base_url("http://duel.local:4000"), "ws://duel.local:4000");
        assert_eq!(
            ws_base_url("https://duel.example.com/"),
            "wss://duel.example.com"
        );
        assert_eq!(ws_base_url("wss://already.ws"), "wss://already.ws");
    }

    #[test]
    fn queue_frames_decode() {
        let frame: QueueFrame =
            serde_json::from_str(r#"{"type":"queued","position":2}"#).unwrap();
        assert!(matches!(frame, QueueFrame::Queued { position: 2 }));

        let frame: QueueFrame = serde_json::from_str(
            r#"{"type":"match_found","roomId":"R1","matchId":"M1","problemId":"P9"}"#,
        )
        .unwrap();
        match frame {
            QueueFrame::MatchFound {
                room_id,
                match_id,
                problem_id,
            } => {
                assert_eq!(room_id, "R1");
                assert_eq!(match_id, "M1");
                assert_eq!(problem_id, "P9");
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let frame: QueueFrame =
            serde_json::from_str(r#"{"type":"error","code":4002,"message":"seat gone"}"#).unwrap();
        assert!(matches!(frame, QueueFrame::Error { code: 4002, .. }));
    }

    #[test]
    fn unknown_frames_fail_to_decode() {
        assert!(serde_json::from_str::<QueueFrame>(r#"{"type":"spectate"}"#).is_err());
        assert!(serde_json::from_str::<MatchFrame>(r#"{"type":"chat","body":"hi"}"#).is_err());
    }

    #[test]
    fn match_frames_decode() {
        let frame: MatchFrame = serde_json::from_str(r#"{"type":"match_init"}"#).unwrap();
        assert!(matches!(frame, MatchFrame::MatchInit));
        let frame: MatchFrame = serde_json::from_str(r#"{"type":"code_update"}"#).unwrap();
        assert!(matches!(frame, MatchFrame::CodeUpdate));
    }
}
