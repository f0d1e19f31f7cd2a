use crate::config::TargetConfig;
use crate::utils::error::{PhxLoadError, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::trace;

/// The duplex, message-oriented connection a client drives its protocol
/// over. Text frames in, text frames out; `recv` returning `Ok(None)` means
/// the peer closed the connection in an orderly way.
pub trait Transport {
    fn send(&mut self, text: String) -> impl std::future::Future<Output = Result<()>> + Send;
    fn recv(&mut self) -> impl std::future::Future<Output = Result<Option<String>>> + Send;
    fn close(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// WebSocket transport: upgrade handshake with a protocol-selecting header.
pub struct WsTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsTransport {
    /// Open a connection to the target, requesting its subprotocol.
    /// Any failure before the upgrade completes is a `Handshake` error.
    pub async fn connect(target: &TargetConfig) -> Result<Self> {
        let mut request = target
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| PhxLoadError::Handshake(format!("invalid URL: {}", e)))?;

        let header = HeaderValue::from_str(&target.protocol)
            .map_err(|e| PhxLoadError::Handshake(format!("invalid subprotocol: {}", e)))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", header);

        let (ws, response) = connect_async(request)
            .await
            .map_err(|e| PhxLoadError::Handshake(e.to_string()))?;

        trace!(status = %response.status(), "websocket open");

        Ok(Self { ws })
    }
}

impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.ws
            .send(Message::Text(text))
            .await
            .map_err(|e| PhxLoadError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        loop {
            match self.ws.next().await {
                None => return Ok(None),
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Close(_))) => return Ok(None),
                // Pings are answered by the library; anything else carries no
                // protocol frames
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                    return Ok(None)
                }
                Some(Err(e)) => return Err(PhxLoadError::Transport(e.to_string())),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self.ws.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(PhxLoadError::Transport(e.to_string())),
        }
    }
}
