//! Direct-dial WebSocket transport.
//!
//! Each peer listens on a TCP port and is addressed by its listener URL
//! (`ws://host:port`). There is no signaling server: a join link carries the
//! host's URL and the joiner dials it directly. Right after the upgrade the
//! dialer sends one text frame introducing itself,
//!
//! ```text
//! tandem-hello ws://192.168.1.20:4100
//! ```
//!
//! so the accepting side learns an id it can deduplicate against. Every other
//! frame is binary and opaque to the transport.
//!
//! Each link runs one task that owns the socket; `send` and `close` push onto
//! that task's queue.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::identity::PeerId;

use super::{EventSender, LinkId, PeerLink, Transport, TransportError, TransportEvent};

const HELLO_PREFIX: &str = "tandem-hello ";
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

enum Outbound {
    Frame(Vec<u8>),
    Close,
}

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Address to bind the listener to
    pub bind_addr: String,
    /// Host advertised in the peer id; defaults to the bound IP
    pub advertise_host: Option<String>,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            advertise_host: None,
        }
    }
}

pub struct WsTransport {
    config: WsConfig,
    local: Arc<Mutex<Option<PeerId>>>,
    events: Option<EventSender>,
    next_link: Arc<AtomicU64>,
    listener: Option<JoinHandle<()>>,
}

impl WsTransport {
    pub fn new(config: WsConfig) -> Self {
        Self {
            config,
            local: Arc::new(Mutex::new(None)),
            events: None,
            next_link: Arc::new(AtomicU64::new(0)),
            listener: None,
        }
    }

    /// Listen on `bind_addr`, advertising the bound address.
    pub fn bind(bind_addr: impl Into<String>) -> Self {
        Self::new(WsConfig {
            bind_addr: bind_addr.into(),
            ..WsConfig::default()
        })
    }

    fn local_id(&self) -> Option<PeerId> {
        self.local.lock().ok().and_then(|id| id.clone())
    }

    async fn listen(
        config: WsConfig,
        local: Arc<Mutex<Option<PeerId>>>,
        events: EventSender,
        next_link: Arc<AtomicU64>,
    ) {
        let listener = match TcpListener::bind(&config.bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("Failed to bind {}: {e}", config.bind_addr);
                let _ = events.send(TransportEvent::Error {
                    link: None,
                    reason: e.to_string(),
                });
                return;
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                let _ = events.send(TransportEvent::Error {
                    link: None,
                    reason: e.to_string(),
                });
                return;
            }
        };

        let id = advertised_id(&config, addr);
        if let Ok(mut slot) = local.lock() {
            *slot = Some(id.clone());
        }
        log::info!("WebSocket transport listening as {id}");
        if events.send(TransportEvent::Registered(id)).is_err() {
            return;
        }

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("Accept failed: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {peer_addr}");

            let link = LinkId(next_link.fetch_add(1, Ordering::Relaxed) + 1);
            let events = events.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::accept_link(stream, link, events.clone()).await {
                    log::debug!("Handshake with {peer_addr} failed: {e}");
                }
            });
        }
    }

    async fn accept_link(
        stream: TcpStream,
        link: LinkId,
        events: EventSender,
    ) -> Result<(), TransportError> {
        let mut ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let remote = match tokio::time::timeout(HELLO_TIMEOUT, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => parse_hello(text.as_str()),
            _ => None,
        }
        .ok_or_else(|| TransportError::Io("missing hello frame".into()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        let endpoint = WsLink {
            id: link,
            remote: remote.clone(),
            outbound: tx,
            open: open.clone(),
        };

        log::info!("Accepted link {link} from {remote}");
        if events.send(TransportEvent::Incoming(Box::new(endpoint))).is_err() {
            return Ok(());
        }
        let _ = events.send(TransportEvent::Open(link));
        run_link(ws, link, rx, open, events).await;
        Ok(())
    }
}

impl Transport for WsTransport {
    fn register(
        &mut self,
        preferred: Option<&PeerId>,
        events: EventSender,
    ) -> Result<(), TransportError> {
        if self.listener.is_some() {
            return Ok(());
        }
        if let Some(preferred) = preferred {
            log::debug!("Ignoring preferred id {preferred}; ids follow the listener address");
        }

        let task = tokio::spawn(Self::listen(
            self.config.clone(),
            self.local.clone(),
            events.clone(),
            self.next_link.clone(),
        ));
        self.listener = Some(task);
        self.events = Some(events);
        Ok(())
    }

    fn connect(&mut self, remote: &PeerId) -> Result<Box<dyn PeerLink>, TransportError> {
        let local = self.local_id().ok_or(TransportError::NotRegistered)?;
        let events = self.events.clone().ok_or(TransportError::NotRegistered)?;

        let link = LinkId(self.next_link.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        let endpoint = WsLink {
            id: link,
            remote: remote.clone(),
            outbound: tx,
            open: open.clone(),
        };

        let url = remote.as_str().to_string();
        tokio::spawn(async move {
            let mut ws = match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((ws, _response)) => ws,
                Err(e) => {
                    log::error!("Failed to dial {url}: {e}");
                    let _ = events.send(TransportEvent::Error {
                        link: Some(link),
                        reason: e.to_string(),
                    });
                    return;
                }
            };

            let hello = format!("{HELLO_PREFIX}{local}");
            if let Err(e) = ws.send(Message::Text(hello.into())).await {
                let _ = events.send(TransportEvent::Error {
                    link: Some(link),
                    reason: e.to_string(),
                });
                return;
            }

            open.store(true, Ordering::Release);
            log::info!("Link {link} to {url} open");
            let _ = events.send(TransportEvent::Open(link));
            run_link(ws, link, rx, open, events).await;
        });

        Ok(Box::new(endpoint))
    }

    fn shutdown(&mut self) {
        if let Some(task) = self.listener.take() {
            task.abort();
            log::info!("WebSocket transport stopped");
        }
        self.events = None;
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub struct WsLink {
    id: LinkId,
    remote: PeerId,
    outbound: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
}

impl PeerLink for WsLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn remote(&self) -> &PeerId {
        &self.remote
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.outbound
            .send(Outbound::Frame(bytes))
            .map_err(|_| TransportError::LinkClosed(self.id))
    }

    fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

impl fmt::Debug for WsLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsLink")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Pump one socket until either side closes it.
async fn run_link<S>(
    ws: WebSocketStream<S>,
    link: LinkId,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    open: Arc<AtomicBool>,
    events: EventSender,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    let failure = loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    log::trace!("link {link}: {} bytes in", bytes.len());
                    if events.send(TransportEvent::Data { link, bytes }).is_err() {
                        break None;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break None,
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(e.to_string()),
            },
            queued = outbound.recv() => match queued {
                Some(Outbound::Frame(bytes)) => {
                    if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
                        break Some(e.to_string());
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.close().await;
                    break None;
                }
            },
        }
    };

    open.store(false, Ordering::Release);
    let event = match failure {
        Some(reason) => {
            log::error!("link {link} failed: {reason}");
            TransportEvent::Error {
                link: Some(link),
                reason,
            }
        }
        None => {
            log::debug!("link {link} closed");
            TransportEvent::Closed(link)
        }
    };
    let _ = events.send(event);
}

fn advertised_id(config: &WsConfig, addr: SocketAddr) -> PeerId {
    match &config.advertise_host {
        Some(host) => PeerId::new(format!("ws://{host}:{}", addr.port())),
        None => PeerId::new(format!("ws://{addr}")),
    }
}

fn parse_hello(frame: &str) -> Option<PeerId> {
    frame
        .strip_prefix(HELLO_PREFIX)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(PeerId::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hello() {
        assert_eq!(
            parse_hello("tandem-hello ws://127.0.0.1:4100"),
            Some(PeerId::new("ws://127.0.0.1:4100"))
        );
        assert_eq!(parse_hello("tandem-hello "), None);
        assert_eq!(parse_hello("hello ws://x"), None);
    }

    #[test]
    fn test_advertised_id() {
        let addr: SocketAddr = "0.0.0.0:4100".parse().unwrap();
        let config = WsConfig {
            advertise_host: Some("192.168.1.20".into()),
            ..WsConfig::default()
        };
        assert_eq!(advertised_id(&config, addr).as_str(), "ws://192.168.1.20:4100");
        assert_eq!(
            advertised_id(&WsConfig::default(), addr).as_str(),
            "ws://0.0.0.0:4100"
        );
    }

    #[tokio::test]
    async fn test_connect_before_register_fails() {
        let mut transport = WsTransport::bind("127.0.0.1:0");
        let err = transport.connect(&PeerId::new("ws://127.0.0.1:1")).unwrap_err();
        assert_eq!(err, TransportError::NotRegistered);
    }
}
