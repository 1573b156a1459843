//! One socket to one relay, with subscription helpers and an observable
//! connection state.

use std::sync::{Arc, Mutex};

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    event::Event,
    message::{ClientMessage, Filter},
    observable::Observable,
    transport::{Inbound, Transport},
};

/// Lifecycle of a relay connection. There is no automatic reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

struct Live {
    outgoing: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
}

/// Connection to a single relay URL.
pub struct RelayConnection {
    url: String,
    transport: Arc<dyn Transport>,
    state: Arc<Observable<ConnectionState>>,
    live: Mutex<Option<Live>>,
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.url)
            .field("state", &self.state.get())
            .finish()
    }
}

impl RelayConnection {
    pub fn new(url: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self::with_state(url, transport, Arc::new(Observable::default()))
    }

    /// Build a connection that reports into an existing state container.
    pub fn with_state(
        url: impl Into<String>,
        transport: Arc<dyn Transport>,
        state: Arc<Observable<ConnectionState>>,
    ) -> Self {
        Self {
            url: url.into(),
            transport,
            state,
            live: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Open the transport and start delivering text frames to `on_message`
    /// in arrival order. Completes once the socket is open or has failed.
    pub async fn connect<F>(&self, on_message: F) -> Result<()>
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.disconnect();
        self.state.set(ConnectionState::Connecting);
        debug!("connecting to {}", self.url);
        let channel = match self.transport.open(&self.url).await {
            Ok(c) => c,
            Err(e) => {
                warn!("connect to {} failed: {e}", self.url);
                self.state.set(ConnectionState::Error(e.to_string()));
                return Err(e);
            }
        };

        let mut live = self
            .live
            .lock()
            .map_err(|_| Error::Transport("connection lock poisoned".into()))?;
        // Held until `live` is stored: senders woken by `Connected` block on it.
        self.state.set(ConnectionState::Connected);
        let mut incoming = channel.incoming;
        let state = self.state.clone();
        let url = self.url.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = incoming.recv().await {
                match frame {
                    Inbound::Text(text) => on_message(text),
                    Inbound::Closed(reason) => {
                        info!("relay {url} closed the connection: {reason:?}");
                        break;
                    }
                }
            }
            state.set(ConnectionState::Disconnected);
        });
        *live = Some(Live {
            outgoing: channel.outgoing,
            reader,
        });
        drop(live);
        info!("connected to {}", self.url);
        Ok(())
    }

    /// Wait until a pending connect settles.
    pub async fn wait_for_connection(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let settled = rx
            .wait_for(|s| *s != ConnectionState::Connecting)
            .await
            .map_err(|_| Error::NotConnected)?
            .clone();
        match settled {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Error(msg) => Err(Error::Transport(msg)),
            _ => Err(Error::NotConnected),
        }
    }

    /// Queue one text frame for the relay.
    pub fn send(&self, text: impl Into<String>) -> Result<()> {
        let live = self
            .live
            .lock()
            .map_err(|_| Error::Transport("connection lock poisoned".into()))?;
        let Some(live) = live.as_ref() else {
            return Err(Error::NotConnected);
        };
        live.outgoing
            .send(text.into())
            .map_err(|_| Error::Transport(format!("connection to {} is closed", self.url)))
    }

    /// Send `["REQ", sub_id, filters...]`.
    pub fn subscribe(&self, subscription_id: &str, filters: Vec<Filter>) -> Result<()> {
        let frame = ClientMessage::Req {
            subscription_id: subscription_id.to_string(),
            filters,
        }
        .to_json()?;
        self.send(frame)?;
        debug!("REQ {subscription_id} on {}", self.url);
        Ok(())
    }

    /// Send `["CLOSE", sub_id]`.
    pub fn close(&self, subscription_id: &str) -> Result<()> {
        self.send(ClientMessage::Close(subscription_id.to_string()).to_json()?)?;
        debug!("CLOSE {subscription_id} on {}", self.url);
        Ok(())
    }

    /// Send `["EVENT", event]`.
    pub fn publish(&self, event: &Event) -> Result<()> {
        self.send(ClientMessage::Event(Box::new(event.clone())).to_json()?)
    }

    /// Close the socket and drop the handler. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let taken = match self.live.lock() {
            Ok(mut live) => live.take(),
            Err(_) => None,
        };
        if let Some(live) = taken {
            live.reader.abort();
            drop(live.outgoing);
            info!("disconnected from {}", self.url);
            self.state.set(ConnectionState::Disconnected);
        }
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        if let Ok(mut live) = self.live.lock() {
            if let Some(live) = live.take() {
                live.reader.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryTransport;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn connect_delivers_frames_in_order() {
        let (transport, mut relays) = MemoryTransport::new();
        let conn = RelayConnection::new("wss://r", Arc::new(transport));
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.connect(move |m| {
            let _ = tx.send(m);
        })
        .await
        .unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        conn.wait_for_connection().await.unwrap();

        let relay = relays.recv().await.unwrap();
        for i in 0..5 {
            relay.send(format!("[\"NOTICE\",\"{i}\"]"));
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap(), format!("[\"NOTICE\",\"{i}\"]"));
        }
    }

    #[tokio::test]
    async fn subscribe_and_close_frames() {
        let (transport, mut relays) = MemoryTransport::new();
        let conn = RelayConnection::new("wss://r", Arc::new(transport));
        conn.connect(|_| {}).await.unwrap();
        let mut relay = relays.recv().await.unwrap();
        conn.subscribe("s1", vec![Filter::new().kinds([39000])])
            .unwrap();
        conn.close("s1").unwrap();
        assert_eq!(
            relay.recv().await.unwrap(),
            r#"["REQ","s1",{"kinds":[39000]}]"#
        );
        assert_eq!(relay.recv().await.unwrap(), r#"["CLOSE","s1"]"#);
    }

    #[tokio::test]
    async fn failed_connect_sets_error_state() {
        let (transport, _relays) = MemoryTransport::new();
        transport.refuse("wss://down");
        let conn = RelayConnection::new("wss://down", Arc::new(transport));
        assert!(conn.connect(|_| {}).await.is_err());
        assert!(matches!(conn.state(), ConnectionState::Error(_)));
        assert!(matches!(
            conn.wait_for_connection().await,
            Err(Error::Transport(_))
        ));
        assert!(matches!(conn.send("x"), Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (transport, mut relays) = MemoryTransport::new();
        let conn = RelayConnection::new("wss://r", Arc::new(transport));
        conn.connect(|_| {}).await.unwrap();
        let mut relay = relays.recv().await.unwrap();
        conn.disconnect();
        conn.disconnect();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(matches!(conn.send("x"), Err(Error::NotConnected)));
        assert!(relay.recv().await.is_none());
    }

    #[tokio::test]
    async fn remote_close_marks_disconnected() {
        let (transport, mut relays) = MemoryTransport::new();
        let conn = RelayConnection::new("wss://r", Arc::new(transport));
        conn.connect(|_| {}).await.unwrap();
        let relay = relays.recv().await.unwrap();
        relay.to_client.send(Inbound::Closed(None)).unwrap();
        let mut rx = conn.state.subscribe();
        timeout(
            Duration::from_secs(1),
            rx.wait_for(|s| *s == ConnectionState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_works_as_soon_as_connected_is_observed() {
        let (transport, mut relays) = MemoryTransport::new();
        let conn = Arc::new(RelayConnection::new("wss://r", Arc::new(transport)));
        let mut rx = conn.state.subscribe();
        let observer = {
            let conn = conn.clone();
            tokio::spawn(async move {
                rx.wait_for(|s| *s == ConnectionState::Connected)
                    .await
                    .map(|_| ())
                    .unwrap();
                conn.send("hello")
            })
        };
        conn.connect(|_| {}).await.unwrap();
        observer.await.unwrap().unwrap();
        let mut relay = relays.recv().await.unwrap();
        assert_eq!(relay.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn shared_state_container() {
        let (transport, _relays) = MemoryTransport::new();
        let state = Arc::new(Observable::default());
        let conn = RelayConnection::with_state("wss://r", Arc::new(transport), state.clone());
        conn.connect(|_| {}).await.unwrap();
        assert_eq!(state.get(), ConnectionState::Connected);
    }
}
