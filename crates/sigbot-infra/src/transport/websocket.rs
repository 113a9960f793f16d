//! WebSocket transport for the gateway's receive endpoint.
//!
//! Connects to `ws(s)://host/v1/receive/{number}` and yields every text frame.
//! Dropped connections are retried with a capped exponential delay that resets
//! after a successful connect; only an unusable URL ends the stream with an
//! error.

use std::time::Duration;

use futures_util::StreamExt;
use sigbot_core::transport::{FrameStream, Transport};
use sigbot_types::error::TransportError;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Receive URL for `phone_number` under `service_url`.
///
/// `http` maps to `ws` and `https` to `wss`; `ws`/`wss` are kept as given.
pub fn build_ws_uri(service_url: &str, phone_number: &str) -> Result<String, TransportError> {
    let base = service_url.trim().trim_end_matches('/');
    let (scheme, rest) = base
        .split_once("://")
        .ok_or_else(|| TransportError::InvalidUrl(format!("missing scheme: {service_url}")))?;
    let scheme = match scheme.to_ascii_lowercase().as_str() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(TransportError::InvalidUrl(format!("unsupported scheme {other}: {service_url}"))),
    };
    if rest.is_empty() {
        return Err(TransportError::InvalidUrl(format!("missing host: {service_url}")));
    }
    let number = phone_number.trim();
    if number.is_empty() {
        return Err(TransportError::InvalidUrl("phone number is empty".into()));
    }
    Ok(format!("{scheme}://{rest}/v1/receive/{number}"))
}

/// Capped exponential reconnect delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; the following call returns double, up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(INITIAL_RECONNECT_DELAY, MAX_RECONNECT_DELAY)
    }
}

/// Gateway transport over a WebSocket connection.
#[derive(Debug)]
pub struct WebSocketTransport {
    url: String,
    backoff: ReconnectBackoff,
    closed: CancellationToken,
}

impl WebSocketTransport {
    pub fn new(service_url: &str, phone_number: &str) -> Result<Self, TransportError> {
        Ok(Self {
            url: build_ws_uri(service_url, phone_number)?,
            backoff: ReconnectBackoff::default(),
            closed: CancellationToken::new(),
        })
    }

    pub fn with_backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

enum Event {
    Closed,
    Frame(String),
    Disconnected(Option<String>),
    Ignored,
}

impl Transport for WebSocketTransport {
    fn listen(&self) -> FrameStream {
        let url = self.url.clone();
        let closed = self.closed.clone();
        let mut backoff = self.backoff;

        Box::pin(async_stream::stream! {
            loop {
                let connected = tokio::select! {
                    _ = closed.cancelled() => return,
                    result = tokio_tungstenite::connect_async(url.as_str()) => result,
                };

                let mut socket = match connected {
                    Ok((socket, _response)) => {
                        tracing::info!(url = %url, "connected to gateway");
                        backoff.reset();
                        socket
                    }
                    Err(tungstenite::Error::Url(e)) => {
                        yield Err(TransportError::Fatal(format!("{url}: {e}")));
                        return;
                    }
                    Err(e) => {
                        let delay = backoff.next_delay();
                        tracing::warn!(
                            url = %url,
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "gateway connection failed"
                        );
                        tokio::select! {
                            _ = closed.cancelled() => return,
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }
                };

                loop {
                    let event = tokio::select! {
                        _ = closed.cancelled() => Event::Closed,
                        message = socket.next() => match message {
                            Some(Ok(Message::Text(text))) => Event::Frame(text),
                            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                                Ok(text) => Event::Frame(text),
                                Err(_) => {
                                    tracing::debug!("ignoring non-utf8 binary frame");
                                    Event::Ignored
                                }
                            },
                            Some(Ok(Message::Close(frame))) => {
                                Event::Disconnected(frame.map(|f| f.reason.into_owned()))
                            }
                            Some(Ok(_)) => Event::Ignored,
                            Some(Err(e)) => Event::Disconnected(Some(e.to_string())),
                            None => Event::Disconnected(None),
                        },
                    };

                    match event {
                        Event::Frame(text) => yield Ok(text),
                        Event::Ignored => {}
                        Event::Closed => {
                            if let Err(e) = socket.close(None).await {
                                tracing::debug!(error = %e, "error closing gateway socket");
                            }
                            tracing::info!(url = %url, "gateway connection closed");
                            return;
                        }
                        Event::Disconnected(reason) => {
                            tracing::warn!(
                                url = %url,
                                reason = reason.as_deref().unwrap_or("stream ended"),
                                "gateway connection lost"
                            );
                            break;
                        }
                    }
                }

                let delay = backoff.next_delay();
                tokio::select! {
                    _ = closed.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        })
    }

    fn close(&self) {
        self.closed.cancel();
    }
}
