//! Live channel transport.
//!
//! A transport yields the text frames of one connection; the channel
//! state machine in the parent module owns reconnection.

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LiveError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("WebSocket error: {0}")]
    Protocol(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// Text frames of one open connection. The stream ends when the
/// connection closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, LiveError>> + Send>>;

#[async_trait]
pub trait LiveTransport: Send + Sync {
    /// Open a connection; `Ok` means the handshake completed
    async fn connect(&self) -> Result<FrameStream, LiveError>;
}

/// Handshake limit when none is configured
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket transport over tokio-tungstenite
pub struct TungsteniteTransport {
    url: String,
    connect_timeout: Duration,
}

impl TungsteniteTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl LiveTransport for TungsteniteTransport {
    async fn connect(&self) -> Result<FrameStream, LiveError> {
        let (ws, _response) =
            match tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str())).await {
                Ok(result) => result.map_err(|e| LiveError::Connect(e.to_string()))?,
                Err(_) => {
                    return Err(LiveError::Connect(format!(
                        "handshake timed out after {:?}",
                        self.connect_timeout
                    )))
                }
            };
        debug!(url = %self.url, "WebSocket handshake complete");

        // Only text frames are surfaced; ping/pong is answered by tungstenite
        let frames = stream::unfold(ws, |mut ws| async move {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => return Some((Ok(text), ws)),
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "WebSocket closed by server");
                        return None;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Some((Err(LiveError::Protocol(e.to_string())), ws)),
                    None => return None,
                }
            }
        });
        Ok(Box::pin(frames))
    }
}
