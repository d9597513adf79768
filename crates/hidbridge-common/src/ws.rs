//! Signaling WebSocket layer: dialing with the server token, and a send
//! handle that serializes every outbound frame.

use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::{Error, Result};

/// Handshake budget for signaling and HID dials.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsSink = SplitSink<WsStream, Message>;

/// Dial a WebSocket endpoint relative to the server base URL.
///
/// `http` maps to `ws` and `https` to `wss`; a non-empty token is sent as
/// the `X-HID-Token` header.
pub async fn dial_ws(base: &Url, path: &str, token: &str) -> Result<WsStream> {
    let mut url = base.clone();
    let scheme = if url.scheme().eq_ignore_ascii_case("https") {
        "wss"
    } else {
        "ws"
    };
    url.set_scheme(scheme)
        .map_err(|_| Error::config(format!("cannot derive ws url from {base}")))?;
    url.set_path(path);
    url.set_query(None);

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(Error::transport)?;
    let token = token.trim();
    if !token.is_empty() {
        let value = HeaderValue::from_str(token)
            .map_err(|_| Error::config("token is not a valid header value"))?;
        request.headers_mut().insert("X-HID-Token", value);
    }

    let (stream, _) = tokio::time::timeout(DIAL_TIMEOUT, connect_async(request))
        .await
        .map_err(|_| Error::transport(format!("dial {url}: handshake timed out")))?
        .map_err(Error::transport)?;
    Ok(stream)
}

/// Write half of the signaling socket behind a lock, so concurrent tasks
/// (dispatcher, ICE callbacks) never interleave frames.
pub struct SignalSender {
    sink: Mutex<WsSink>,
}

impl SignalSender {
    pub fn new(sink: WsSink) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<()> {
        let text = serde_json::to_string(value).map_err(Error::protocol)?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text.into()))
            .await
            .map_err(Error::transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_rejects_unroutable_scheme_mapping() {
        // A non-special scheme can never become ws://.
        let base = Url::parse("unix:/run/hidbridge.sock").unwrap();
        let err = dial_ws(&base, "/ws/webrtc", "").await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
