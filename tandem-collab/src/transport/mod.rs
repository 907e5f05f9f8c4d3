//! Peer transport adapter.
//!
//! A transport registers the local peer under an id other peers can dial,
//! opens outbound links, accepts inbound ones, and reports everything that
//! happens on them as [`TransportEvent`]s on a single channel:
//!
//! ```text
//! register ──► Registered(id)
//! connect  ──► Open(link) ──► Data(link, bytes)* ──► Closed(link)
//! accept   ──► Incoming(link) ──► Open(link) ──► Data* ──► Closed
//!                         any state ──► Error(link, reason)
//! ```
//!
//! Within one link, frames arrive in send order. Nothing is promised across
//! links.

pub mod memory;
pub mod ws;

use std::fmt;

use tokio::sync::mpsc;

use crate::identity::PeerId;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use ws::{WsConfig, WsTransport};

/// Transport-unique id of one link endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    /// The local peer is reachable under this id.
    Registered(PeerId),
    /// A remote peer dialed us. `Open` follows once the link is usable.
    Incoming(Box<dyn PeerLink>),
    Open(LinkId),
    Data { link: LinkId, bytes: Vec<u8> },
    Closed(LinkId),
    /// `link` is `None` for failures of the transport itself.
    Error { link: Option<LinkId>, reason: String },
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport is not registered")]
    NotRegistered,
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),
    #[error("link {0} is closed")]
    LinkClosed(LinkId),
    #[error("transport I/O error: {0}")]
    Io(String),
}

/// One end of a connection to a remote peer.
pub trait PeerLink: Send + fmt::Debug {
    fn id(&self) -> LinkId;
    fn remote(&self) -> &PeerId;
    fn is_open(&self) -> bool;
    /// Queue one frame. Fails once the link is closed or the remote is gone.
    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError>;
    fn close(&self);
}

pub trait Transport: Send {
    /// Start listening. `Registered` (or `Error`) is delivered on `events`.
    /// `preferred` is the id from a previous run; transports may ignore it.
    fn register(
        &mut self,
        preferred: Option<&PeerId>,
        events: EventSender,
    ) -> Result<(), TransportError>;

    /// Begin dialing `remote`. Returns immediately; the link reports `Open`
    /// or `Error` later.
    fn connect(&mut self, remote: &PeerId) -> Result<Box<dyn PeerLink>, TransportError>;

    /// Stop accepting connections. Existing links are closed by their owner.
    fn shutdown(&mut self);
}
