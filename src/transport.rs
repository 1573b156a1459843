//! Text-frame transports used by relay connections.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async_tls, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};

/// Frame or lifecycle signal delivered by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Text(String),
    /// The far end went away; no more frames follow.
    Closed(Option<String>),
}

/// Bidirectional text-frame channel to one relay.
///
/// Dropping `outgoing` closes the underlying socket.
#[derive(Debug)]
pub struct Channel {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<Inbound>,
}

/// Opens channels to relay URLs.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolve once the connection is open, or fail.
    async fn open(&self, url: &str) -> Result<Channel>;
}

/// WebSocket transport, optionally routed through a SOCKS5 proxy.
#[derive(Debug, Clone)]
pub struct WsTransport {
    tor_socks: Option<String>,
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(tor_socks: Option<String>, connect_timeout: Duration) -> Self {
        Self {
            tor_socks,
            connect_timeout,
        }
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new(None, Duration::from_secs(10))
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &str) -> Result<Channel> {
        let ws = match timeout(
            self.connect_timeout,
            connect_ws(url, self.tor_socks.as_deref()),
        )
        .await
        {
            Ok(res) => res?,
            Err(_) => {
                return Err(Error::Transport(format!(
                    "connection timeout after {:?}",
                    self.connect_timeout
                )))
            }
        };
        Ok(bridge(url.to_string(), ws))
    }
}

type RelayStream = WebSocketStream<MaybeTlsStream<Box<dyn AsyncReadWrite + Unpin + Send>>>;

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(relay: &str, tor_socks: Option<&str>) -> Result<RelayStream> {
    let url = Url::parse(relay)?;
    if url.scheme() != "ws" && url.scheme() != "wss" {
        return Err(Error::Transport(format!(
            "URL must use ws:// or wss:// scheme, got: {}",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| Error::Transport("missing host".into()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::Transport("missing port".into()))?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(
            Socks5Stream::connect(proxy, (host, port))
                .await
                .map_err(|e| Error::Transport(format!("socks proxy: {e}")))?,
        )
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async_tls(req, stream).await?;
    Ok(ws)
}

/// Pump frames between the socket and a [`Channel`] with one writer and one reader task.
fn bridge(url: String, ws: RelayStream) -> Channel {
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let (in_tx, in_rx) = mpsc::unbounded_channel();

    let writer_url = url.clone();
    tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text)).await {
                warn!("send to {writer_url} failed: {e}");
                return;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
        debug!("writer for {writer_url} finished");
    });

    tokio::spawn(async move {
        let reason = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    if in_tx.send(Inbound::Text(text)).is_err() {
                        return;
                    }
                }
                Some(Ok(Message::Close(frame))) => break frame.map(|f| f.reason.to_string()),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(e.to_string()),
                None => break None,
            }
        };
        debug!("reader for {url} finished");
        let _ = in_tx.send(Inbound::Closed(reason));
    });

    Channel {
        outgoing: out_tx,
        incoming: in_rx,
    }
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

/// In-process transport whose relay side is driven by the caller.
pub mod memory {
    use std::{
        collections::HashSet,
        sync::{Arc, Mutex},
    };

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::{Channel, Inbound, Transport};
    use crate::error::{Error, Result};

    /// Relay end of an in-memory channel.
    #[derive(Debug)]
    pub struct RelayEnd {
        pub url: String,
        /// Frames the client sent.
        pub from_client: mpsc::UnboundedReceiver<String>,
        /// Frames delivered to the client.
        pub to_client: mpsc::UnboundedSender<Inbound>,
    }

    impl RelayEnd {
        /// Push a text frame to the client.
        pub fn send(&self, text: impl Into<String>) -> bool {
            self.to_client.send(Inbound::Text(text.into())).is_ok()
        }

        pub async fn recv(&mut self) -> Option<String> {
            self.from_client.recv().await
        }
    }

    #[derive(Debug)]
    struct State {
        refused: HashSet<String>,
        opened: Vec<String>,
    }

    /// Transport that hands the relay end of every opened channel to a receiver.
    #[derive(Debug, Clone)]
    pub struct MemoryTransport {
        state: Arc<Mutex<State>>,
        relays: mpsc::UnboundedSender<RelayEnd>,
    }

    impl MemoryTransport {
        pub fn new() -> (Self, mpsc::UnboundedReceiver<RelayEnd>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let transport = Self {
                state: Arc::new(Mutex::new(State {
                    refused: HashSet::new(),
                    opened: Vec::new(),
                })),
                relays: tx,
            };
            (transport, rx)
        }

        /// Make future opens of `url` fail.
        pub fn refuse(&self, url: &str) {
            if let Ok(mut s) = self.state.lock() {
                s.refused.insert(url.to_string());
            }
        }

        /// URLs successfully opened so far, in order.
        pub fn opened(&self) -> Vec<String> {
            self.state
                .lock()
                .map(|s| s.opened.clone())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn open(&self, url: &str) -> Result<Channel> {
            {
                let mut s = self
                    .state
                    .lock()
                    .map_err(|_| Error::Transport("transport lock poisoned".into()))?;
                if s.refused.contains(url) {
                    return Err(Error::Transport(format!("connection refused: {url}")));
                }
                s.opened.push(url.to_string());
            }
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            self.relays
                .send(RelayEnd {
                    url: url.to_string(),
                    from_client: out_rx,
                    to_client: in_tx,
                })
                .map_err(|_| Error::Transport("no relay listening".into()))?;
            Ok(Channel {
                outgoing: out_tx,
                incoming: in_rx,
            })
        }
    }
}
