//! WebSocket transport
//!
//! Opens one WebSocket per link, presenting the bearer credential in the
//! upgrade request. A single pump task per link moves JSON text frames between
//! the socket and the link channels; when either side goes away the pump ends
//! and drops the inbound sender, which the connection driver reads as a lost
//! link.

use async_trait::async_trait;
use florachat_core::{
    AuthError, ChannelConfig, ClientFrame, FlorachatError, NetworkError, Result, ServerFrame,
};
use florachat_runtime::{create_link, AuthToken, Transport, TransportLink};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`Transport`] over `ws://` or `wss://`
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: Url,
    channels: ChannelConfig,
}

impl WsTransport {
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|_| invalid_endpoint(url))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(invalid_endpoint(url.as_str()));
        }
        Ok(Self {
            url,
            channels: ChannelConfig::default(),
        })
    }

    pub fn with_channels(mut self, channels: ChannelConfig) -> Self {
        self.channels = channels;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&mut self, token: &AuthToken) -> Result<TransportLink> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|_| invalid_endpoint(self.url.as_str()))?;
        let credential =
            HeaderValue::from_str(&token.bearer_header()).map_err(|_| AuthError::InvalidCredential {
                reason: "token is not a valid header value".into(),
            })?;
        request.headers_mut().insert(AUTHORIZATION, credential);

        let (socket, response) = connect_async(request)
            .await
            .map_err(|error| handshake_error(&self.url, error))?;
        info!(endpoint = %self.url, status = %response.status(), "websocket connected");

        let (link, ends) = create_link(&self.channels);
        tokio::spawn(pump(socket, ends.outbound, ends.inbound));
        Ok(link)
    }

    fn endpoint(&self) -> String {
        self.url.to_string()
    }
}

/// Shuttle frames until the socket or the link closes
async fn pump(
    socket: Socket,
    mut outbound: mpsc::Receiver<ClientFrame>,
    inbound: mpsc::Sender<ServerFrame>,
) {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    let text = match frame.encode() {
                        Ok(text) => text,
                        Err(error) => {
                            error!(%error, "failed to encode client frame");
                            continue;
                        }
                    };
                    if let Err(error) = sink.send(Message::Text(text)).await {
                        error!(%error, "websocket write failed");
                        break;
                    }
                }
                None => {
                    debug!("link released, closing websocket");
                    let _ = sink.close().await;
                    break;
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => match ServerFrame::decode(&text) {
                    Ok(frame) => {
                        if inbound.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => warn!(%error, "dropping undecodable server frame"),
                },
                Some(Ok(Message::Close(close))) => {
                    info!(?close, "server closed the websocket");
                    break;
                }
                // Control frames are answered by tungstenite itself
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    error!(%error, "websocket read failed");
                    break;
                }
                None => break,
            },
        }
    }
}

fn invalid_endpoint(url: &str) -> FlorachatError {
    NetworkError::InvalidEndpoint {
        url: url.to_string(),
    }
    .into()
}

/// Map an upgrade failure; 401 and 403 mean the credential was refused
fn handshake_error(url: &Url, error: WsError) -> FlorachatError {
    match error {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                AuthError::Rejected { status }.into()
            } else {
                NetworkError::ConnectFailed {
                    endpoint: url.to_string(),
                    reason: format!("upgrade refused with HTTP {status}"),
                }
                .into()
            }
        }
        other => NetworkError::ConnectFailed {
            endpoint: url.to_string(),
            reason: other.to_string(),
        }
        .into(),
    }
}
