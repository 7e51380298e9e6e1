//! Transport seam for the realtime channel.
//!
//! [`RealtimeTransport`] opens a session against a realtime endpoint;
//! [`RealtimeSession`] is the resulting bidirectional event stream. The
//! production implementation speaks WebSocket via tokio-tungstenite;
//! tests substitute channel-backed fakes.

use crate::config::RealtimeConfig;
use crate::error::{Result, VoiceError};
use crate::realtime::protocol::{ClientEvent, ServerEvent};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use uuid::Uuid;

/// An open realtime session.
#[async_trait]
pub trait RealtimeSession: Send {
    /// Send one client event.
    async fn send(&mut self, event: ClientEvent) -> Result<()>;

    /// Receive the next server event. `None` means the session closed.
    async fn next_event(&mut self) -> Option<Result<ServerEvent>>;

    /// Close the session.
    async fn close(&mut self);
}

/// Opens realtime sessions.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Connect and return an open session.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::ConnectionUnavailable`] when the endpoint
    /// cannot be reached and [`VoiceError::Config`] on bad settings.
    async fn connect(&self, config: &RealtimeConfig) -> Result<Box<dyn RealtimeSession>>;
}

/// WebSocket transport against an OpenAI-style realtime endpoint.
#[derive(Debug, Default)]
pub struct WsTransport;

#[async_trait]
impl RealtimeTransport for WsTransport {
    async fn connect(&self, config: &RealtimeConfig) -> Result<Box<dyn RealtimeSession>> {
        if config.api_key.is_empty() {
            return Err(VoiceError::Config(
                "realtime API key is not set".to_owned(),
            ));
        }

        let url = format!("{}?model={}", config.endpoint, config.model);
        let mut request = url
            .into_client_request()
            .map_err(|e| VoiceError::Config(format!("invalid realtime endpoint: {e}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|e| VoiceError::Config(format!("invalid API key: {e}")))?;
        let headers = request.headers_mut();
        headers.insert("Authorization", bearer);
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        debug!(endpoint = %config.endpoint, model = %config.model, "connecting realtime session");
        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| {
                VoiceError::ConnectionUnavailable(format!("realtime connect failed: {e}"))
            })?;

        Ok(Box::new(WsSession { ws }))
    }
}

/// A live WebSocket session.
pub struct WsSession {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl RealtimeSession for WsSession {
    async fn send(&mut self, event: ClientEvent) -> Result<()> {
        let mut json = serde_json::to_value(&event)
            .map_err(|e| VoiceError::Realtime(format!("event serialization failed: {e}")))?;
        if let Some(obj) = json.as_object_mut() {
            obj.insert(
                "event_id".to_owned(),
                serde_json::Value::String(format!("evt_{}", Uuid::new_v4())),
            );
        }
        self.ws
            .send(Message::Text(json.to_string()))
            .await
            .map_err(|e| VoiceError::Realtime(format!("send failed: {e}")))
    }

    async fn next_event(&mut self) -> Option<Result<ServerEvent>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(ServerEvent::Ignored) => continue,
                    Ok(event) => return Some(Ok(event)),
                    Err(e) => {
                        warn!("unparseable realtime event: {e}");
                        continue;
                    }
                },
                Ok(Message::Close(_)) => return None,
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_)) => {
                    continue;
                }
                Err(e) => {
                    return Some(Err(VoiceError::Realtime(format!("receive failed: {e}"))));
                }
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::config::RealtimeConfig;

    #[tokio::test]
    async fn connect_requires_an_api_key() {
        let config = RealtimeConfig::default();
        let err = WsTransport.connect(&config).await.err().unwrap();
        assert!(matches!(err, VoiceError::Config(_)));
    }

    #[tokio::test]
    async fn connect_rejects_a_malformed_endpoint() {
        let config = RealtimeConfig {
            endpoint: "not a url".to_owned(),
            api_key: "sk-test".to_owned(),
            ..RealtimeConfig::default()
        };
        let err = WsTransport.connect(&config).await.err().unwrap();
        assert!(matches!(err, VoiceError::Config(_)));
    }
}
