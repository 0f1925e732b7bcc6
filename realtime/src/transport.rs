//! The realtime transport seam and its Socket.IO implementation.

use async_trait::async_trait;
use events::{ClientEvent, ServerEvent};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::*;
use secrecy::{ExposeSecret, SecretString};
use session_auth::error::{transport_error, Error, TransportErrorKind};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::codec::{self, Heartbeat, Packet};

/// Opens one authenticated realtime connection.
///
/// `connect` resolves once the server has acknowledged the connection.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, access_token: &SecretString) -> Result<Link, Error>;
}

/// The manager's end of an open connection.
///
/// Dropping `outbound` closes the connection; `inbound` ending means the
/// transport closed.
#[derive(Debug)]
pub struct Link {
    /// Server-assigned session id, when the transport reports one.
    pub sid: Option<String>,
    pub outbound: UnboundedSender<ClientEvent>,
    pub inbound: UnboundedReceiver<ServerEvent>,
}

/// The transport's end of a [`Link`].
#[derive(Debug)]
pub struct LinkPeer {
    pub events: UnboundedSender<ServerEvent>,
    pub emitted: UnboundedReceiver<ClientEvent>,
}

impl Link {
    /// A connected pair of channel ends.
    pub fn channel(sid: Option<String>) -> (Link, LinkPeer) {
        let (outbound, emitted) = mpsc::unbounded_channel();
        let (events, inbound) = mpsc::unbounded_channel();
        (
            Link {
                sid,
                outbound,
                inbound,
            },
            LinkPeer { events, emitted },
        )
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// [`Connector`] speaking Socket.IO v5 over a WebSocket.
///
/// The access token goes both into the `token` query parameter and into the
/// namespace connect packet, which covers gateways that only look at one.
#[derive(Debug, Clone)]
pub struct SocketIoConnector {
    base_url: String,
}

impl SocketIoConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    /// WebSocket URL for the Engine.IO handshake.
    pub fn handshake_url(&self, access_token: &SecretString) -> Result<Url, Error> {
        let mut url = Url::parse(self.base_url.trim()).map_err(|e| {
            transport_error(
                TransportErrorKind::InvalidUrl,
                &format!("Invalid socket URL {}: {e}", self.base_url),
            )
        })?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(transport_error(
                    TransportErrorKind::InvalidUrl,
                    &format!("Unsupported socket URL scheme: {other}"),
                ))
            }
        };
        url.set_scheme(scheme).map_err(|_| {
            transport_error(TransportErrorKind::InvalidUrl, "Cannot switch to a WebSocket scheme")
        })?;

        let path = format!("{}/socket.io/", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.query_pairs_mut()
            .clear()
            .append_pair("EIO", "4")
            .append_pair("transport", "websocket")
            .append_pair("token", access_token.expose_secret());

        Ok(url)
    }
}

#[async_trait]
impl Connector for SocketIoConnector {
    async fn connect(&self, access_token: &SecretString) -> Result<Link, Error> {
        let url = self.handshake_url(access_token)?;
        debug!("Opening realtime connection to {}", url.host_str().unwrap_or(""));

        let (socket, _) = connect_async(url.to_string()).await.map_err(|e| Error {
            source: Some(Box::new(e)),
            error_kind: session_auth::ErrorKind::Transport(TransportErrorKind::ConnectFailed),
        })?;
        let (mut sink, mut source) = socket.split();

        let (sid, heartbeat) = handshake(&mut sink, &mut source, access_token).await?;
        info!("Realtime connection established");

        let (link, peer) = Link::channel(sid);
        tokio::spawn(pump(sink, source, peer, heartbeat));
        Ok(link)
    }
}

/// Drive the Engine.IO open and namespace connect until the server
/// acknowledges or refuses. Returns the namespace session id and the ping
/// schedule from the open packet.
async fn handshake(
    sink: &mut WsSink,
    source: &mut WsSource,
    access_token: &SecretString,
) -> Result<(Option<String>, Heartbeat), Error> {
    let mut heartbeat = Heartbeat::default();
    while let Some(frame) = source.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                return Err(transport_error(
                    TransportErrorKind::Closed,
                    &format!("Connection lost during handshake: {e}"),
                ))
            }
        };

        match codec::decode(&text)? {
            Packet::Open(open) => {
                heartbeat = Heartbeat::from_open(&open);
                send(sink, codec::encode_connect(access_token.expose_secret()))
                    .await
                    .map_err(|e| transport_error(TransportErrorKind::Closed, &e.to_string()))?
            }
            Packet::Ping => send(sink, codec::PONG.to_string())
                .await
                .map_err(|e| transport_error(TransportErrorKind::Closed, &e.to_string()))?,
            Packet::Connect(ack) => {
                let sid = ack.get("sid").and_then(|sid| sid.as_str()).map(str::to_string);
                return Ok((sid, heartbeat));
            }
            Packet::ConnectError(payload) => {
                return Err(transport_error(
                    TransportErrorKind::Rejected,
                    &codec::connect_error_message(&payload),
                ))
            }
            Packet::Close | Packet::Disconnect => break,
            _ => {}
        }
    }

    Err(transport_error(
        TransportErrorKind::Closed,
        "Connection closed during handshake",
    ))
}

async fn send(sink: &mut WsSink, text: String) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    sink.send(Message::Text(text)).await
}

/// Move frames between the socket and the link until either side closes,
/// or until the server stays silent longer than its ping schedule allows.
async fn pump(mut sink: WsSink, mut source: WsSource, mut peer: LinkPeer, heartbeat: Heartbeat) {
    let silence_limit = heartbeat.silence_limit();
    let deadline = tokio::time::sleep(silence_limit);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                warn!("No ping from the server within {:?}, closing", silence_limit);
                break;
            }
            frame = source.next() => {
                deadline.as_mut().reset(tokio::time::Instant::now() + silence_limit);
                match frame {
                    Some(Ok(Message::Text(text))) => match codec::decode(&text) {
                        Ok(Packet::Ping) => {
                            if send(&mut sink, codec::PONG.to_string()).await.is_err() {
                                break;
                            }
                        }
                        Ok(Packet::Event { name, payload }) => {
                            match ServerEvent::from_wire(&name, payload) {
                                Ok(event) => {
                                    if peer.events.send(event).is_err() {
                                        break;
                                    }
                                }
                                Err(e) => warn!("Dropping malformed {} event: {}", name, e),
                            }
                        }
                        Ok(Packet::Close) | Ok(Packet::Disconnect) => {
                            info!("Server closed the realtime connection");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Ignoring undecodable frame: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
            event = peer.emitted.recv() => match event {
                Some(event) => {
                    if send(&mut sink, codec::encode_event(&event)).await.is_err() {
                        break;
                    }
                }
                None => {
                    debug!("Realtime link dropped, closing socket");
                    let _ = send(&mut sink, codec::DISCONNECT.to_string()).await;
                    let _ = sink.close().await;
                    return;
                }
            },
        }
    }
    let _ = sink.close().await;
}
