//! Mesh connection pool.
//!
//! Holds at most one link per remote peer and fans frames out to every open
//! one. Each link moves through
//!
//! ```text
//! Connecting ──► Open ──► Closed
//!      └───────────┴────► Error
//! ```
//!
//! and is dropped from the pool on `Closed` or `Error`. Events are matched by
//! [`LinkId`], so a late event from a link that was already replaced never
//! touches its successor.
//!
//! Fan-out is best-effort: a link that fails to take a frame is closed and
//! removed without affecting delivery to the others.

use std::collections::HashMap;

use crate::identity::PeerId;
use crate::transport::{LinkId, PeerLink, Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Closed,
    Error,
}

#[derive(Debug)]
pub struct PeerConnection {
    link: Box<dyn PeerLink>,
    state: LinkState,
    /// Whether the local peer dialed this link
    initiator: bool,
}

impl PeerConnection {
    pub fn remote(&self) -> &PeerId {
        self.link.remote()
    }

    pub fn link_id(&self) -> LinkId {
        self.link.id()
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn initiator(&self) -> bool {
        self.initiator
    }
}

/// Counters for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub broadcasts: u64,
    pub messages_sent: u64,
    pub send_failures: u64,
}

#[derive(Debug, Default)]
pub struct ConnectionPool {
    local: Option<PeerId>,
    connections: HashMap<PeerId, PeerConnection>,
    stats: PoolStats,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the id the transport registered us under.
    pub fn set_local(&mut self, local: PeerId) {
        self.local = Some(local);
    }

    pub fn local(&self) -> Option<&PeerId> {
        self.local.as_ref()
    }

    /// Dial `remote` unless a link to it already exists.
    ///
    /// Returns `Ok(false)` for a duplicate or for our own id.
    pub fn connect_to(
        &mut self,
        transport: &mut dyn Transport,
        remote: &PeerId,
    ) -> Result<bool, TransportError> {
        if self.local.as_ref() == Some(remote) {
            log::debug!("Refusing to dial ourselves ({remote})");
            return Ok(false);
        }
        if self.connections.contains_key(remote) {
            log::debug!("Already connected to {remote}");
            return Ok(false);
        }

        let link = transport.connect(remote)?;
        log::info!("Dialing {remote} on link {}", link.id());
        self.connections.insert(
            remote.clone(),
            PeerConnection {
                link,
                state: LinkState::Connecting,
                initiator: true,
            },
        );
        Ok(true)
    }

    /// Adopt a link a remote peer dialed. Returns whether it was kept.
    ///
    /// When both peers dial each other at once, each side keeps the link
    /// dialed by the peer with the smaller id and closes the other.
    pub fn on_incoming(&mut self, link: Box<dyn PeerLink>) -> bool {
        let remote = link.remote().clone();
        if self.local.as_ref() == Some(&remote) {
            link.close();
            return false;
        }

        if let Some(existing) = self.connections.get(&remote) {
            let keep_existing = existing.initiator
                && self.local.as_ref().is_some_and(|local| *local < remote);
            if keep_existing {
                log::debug!(
                    "Duplicate link from {remote}: keeping our link {}, closing {}",
                    existing.link_id(),
                    link.id()
                );
                link.close();
                return false;
            }
            if let Some(old) = self.connections.remove(&remote) {
                log::debug!(
                    "Duplicate link from {remote}: replacing {} with {}",
                    old.link_id(),
                    link.id()
                );
                old.link.close();
            }
        }

        log::info!("Accepted link {} from {remote}", link.id());
        self.connections.insert(
            remote,
            PeerConnection {
                link,
                state: LinkState::Connecting,
                initiator: false,
            },
        );
        true
    }

    /// Mark a link open. Returns the remote peer so the caller can greet it.
    pub fn on_open(&mut self, link: LinkId) -> Option<PeerId> {
        let conn = self.find_mut(link)?;
        conn.state = LinkState::Open;
        let remote = conn.remote().clone();
        log::info!("Link {link} to {remote} open ({} connected)", self.connected_count());
        Some(remote)
    }

    /// Remote peer behind a live link.
    pub fn peer_for(&self, link: LinkId) -> Option<&PeerId> {
        self.connections
            .values()
            .find(|c| c.link_id() == link)
            .map(PeerConnection::remote)
    }

    pub fn on_closed(&mut self, link: LinkId) -> Option<PeerId> {
        self.retire(link, LinkState::Closed)
    }

    pub fn on_error(&mut self, link: LinkId, reason: &str) -> Option<PeerId> {
        log::error!("Link {link} failed: {reason}");
        self.retire(link, LinkState::Error)
    }

    /// Send one frame on a specific link. A failed send retires the link.
    pub fn send_to(&mut self, link: LinkId, bytes: Vec<u8>) -> Result<(), TransportError> {
        let conn = self.find_mut(link).ok_or(TransportError::LinkClosed(link))?;
        match conn.link.send(bytes) {
            Ok(()) => {
                self.stats.messages_sent += 1;
                Ok(())
            }
            Err(e) => {
                self.stats.send_failures += 1;
                log::error!("Send on link {link} failed: {e}");
                self.retire(link, LinkState::Error);
                Err(e)
            }
        }
    }

    /// Send a frame to every open link. Returns how many accepted it.
    pub fn broadcast(&mut self, bytes: &[u8]) -> usize {
        self.stats.broadcasts += 1;

        let mut delivered = 0;
        let mut failed = Vec::new();
        for conn in self.connections.values() {
            if conn.state != LinkState::Open {
                continue;
            }
            match conn.link.send(bytes.to_vec()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::error!("Broadcast to {} failed: {e}", conn.remote());
                    failed.push(conn.link_id());
                }
            }
        }

        self.stats.messages_sent += delivered as u64;
        self.stats.send_failures += failed.len() as u64;
        for link in failed {
            self.retire(link, LinkState::Error);
        }
        delivered
    }

    /// Close every link and forget them.
    pub fn close_all(&mut self) {
        for (remote, conn) in self.connections.drain() {
            log::debug!("Closing link {} to {remote}", conn.link_id());
            conn.link.close();
        }
    }

    pub fn connected_count(&self) -> usize {
        self.connections
            .values()
            .filter(|c| c.state == LinkState::Open)
            .count()
    }

    pub fn is_connected(&self) -> bool {
        self.connected_count() > 0
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .connections
            .values()
            .filter(|c| c.state == LinkState::Open)
            .map(|c| c.remote().clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn connection(&self, remote: &PeerId) -> Option<&PeerConnection> {
        self.connections.get(remote)
    }

    /// Links in any state, including ones still connecting.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.clone()
    }

    fn find_mut(&mut self, link: LinkId) -> Option<&mut PeerConnection> {
        self.connections.values_mut().find(|c| c.link_id() == link)
    }

    fn retire(&mut self, link: LinkId, state: LinkState) -> Option<PeerId> {
        let remote = self.peer_for(link)?.clone();
        let mut conn = self.connections.remove(&remote)?;
        conn.state = state;
        conn.link.close();
        log::info!(
            "Link {link} to {remote} {:?} ({} connected)",
            conn.state,
            self.connected_count()
        );
        Some(remote)
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{EventReceiver, MemoryNetwork, MemoryTransport, TransportEvent};
    use tokio::sync::mpsc;

    struct Node {
        transport: MemoryTransport,
        events: EventReceiver,
        pool: ConnectionPool,
        id: PeerId,
    }

    impl Node {
        fn new(network: &MemoryNetwork, name: &str) -> Self {
            let (tx, mut events) = mpsc::unbounded_channel();
            let mut transport = network.transport();
            transport.register(Some(&PeerId::new(name)), tx).unwrap();
            let id = match events.try_recv().unwrap() {
                TransportEvent::Registered(id) => id,
                other => panic!("expected Registered, got {other:?}"),
            };
            let mut pool = ConnectionPool::new();
            pool.set_local(id.clone());
            Self {
                transport,
                events,
                pool,
                id,
            }
        }

        fn dial(&mut self, remote: &PeerId) -> bool {
            self.pool.connect_to(&mut self.transport, remote).unwrap()
        }

        /// Feed queued lifecycle events into the pool; returns data frames.
        fn pump(&mut self) -> Vec<Vec<u8>> {
            let mut frames = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                match event {
                    TransportEvent::Incoming(link) => {
                        self.pool.on_incoming(link);
                    }
                    TransportEvent::Open(link) => {
                        self.pool.on_open(link);
                    }
                    TransportEvent::Data { bytes, .. } => frames.push(bytes),
                    TransportEvent::Closed(link) => {
                        self.pool.on_closed(link);
                    }
                    TransportEvent::Error { link: Some(link), reason } => {
                        self.pool.on_error(link, &reason);
                    }
                    _ => {}
                }
            }
            frames
        }
    }

    #[test]
    fn test_connect_and_count() {
        let network = MemoryNetwork::new();
        let mut a = Node::new(&network, "a");
        let mut b = Node::new(&network, "b");

        assert!(a.dial(&b.id));
        assert_eq!(a.pool.connection(&b.id).unwrap().state(), LinkState::Connecting);
        assert_eq!(a.pool.connected_count(), 0);

        a.pump();
        b.pump();
        assert_eq!(a.pool.connected_count(), 1);
        assert_eq!(b.pool.connected_count(), 1);
        assert!(a.pool.connection(&b.id).unwrap().initiator());
        assert!(!b.pool.connection(&a.id).unwrap().initiator());
        assert_eq!(b.pool.connected_peers(), vec![a.id.clone()]);
    }

    #[test]
    fn test_duplicate_dial_is_idempotent() {
        let network = MemoryNetwork::new();
        let mut a = Node::new(&network, "a");
        let b = Node::new(&network, "b");

        assert!(a.dial(&b.id));
        assert!(!a.dial(&b.id));
        a.pump();
        assert!(!a.dial(&b.id));
        assert_eq!(a.pool.len(), 1);
    }

    #[test]
    fn test_refuses_self_dial() {
        let network = MemoryNetwork::new();
        let mut a = Node::new(&network, "a");
        let own = a.id.clone();
        assert!(!a.dial(&own));
        assert!(a.pool.is_empty());
    }

    #[test]
    fn test_simultaneous_dial_keeps_one_link() {
        let network = MemoryNetwork::new();
        let mut a = Node::new(&network, "a");
        let mut b = Node::new(&network, "b");

        assert!(a.dial(&b.id));
        assert!(b.dial(&a.id));
        for _ in 0..3 {
            a.pump();
            b.pump();
        }

        assert_eq!(a.pool.connected_count(), 1);
        assert_eq!(b.pool.connected_count(), 1);
        // "a" < "b": both sides keep the link "a" dialed.
        assert!(a.pool.connection(&b.id).unwrap().initiator());
        assert!(!b.pool.connection(&a.id).unwrap().initiator());

        let a_link = a.pool.connection(&b.id).unwrap().link_id();
        a.pool.send_to(a_link, vec![7]).unwrap();
        assert_eq!(b.pump(), vec![vec![7]]);
    }

    #[test]
    fn test_broadcast_reaches_all_open_links() {
        let network = MemoryNetwork::new();
        let mut hub = Node::new(&network, "hub");
        let mut others: Vec<Node> = ["x", "y", "z"]
            .iter()
            .map(|n| Node::new(&network, n))
            .collect();

        for other in &others {
            hub.dial(&other.id);
        }
        hub.pump();
        for other in &mut others {
            other.pump();
        }

        assert_eq!(hub.pool.broadcast(b"delta"), 3);
        for other in &mut others {
            assert_eq!(other.pump(), vec![b"delta".to_vec()]);
        }
        assert_eq!(
            hub.pool.stats(),
            PoolStats {
                broadcasts: 1,
                messages_sent: 3,
                send_failures: 0
            }
        );
    }

    #[test]
    fn test_send_failure_isolated_to_one_link() {
        let network = MemoryNetwork::new();
        let mut hub = Node::new(&network, "hub");
        let mut good = Node::new(&network, "good");
        let bad = Node::new(&network, "bad");

        hub.dial(&good.id);
        hub.dial(&bad.id);
        hub.pump();
        good.pump();
        network.set_reachable(&bad.id, false);

        assert_eq!(hub.pool.broadcast(b"x"), 1);
        assert_eq!(good.pump(), vec![b"x".to_vec()]);
        assert_eq!(hub.pool.connected_peers(), vec![good.id.clone()]);
        assert_eq!(hub.pool.stats().send_failures, 1);
    }

    #[test]
    fn test_close_removes_connection() {
        let network = MemoryNetwork::new();
        let mut a = Node::new(&network, "a");
        let mut b = Node::new(&network, "b");
        a.dial(&b.id);
        a.pump();
        b.pump();

        b.pool.close_all();
        a.pump();
        assert_eq!(a.pool.connected_count(), 0);
        assert!(a.pool.is_empty());
        assert!(!a.pool.is_connected());
    }

    #[test]
    fn test_stale_close_ignored_after_replacement() {
        let network = MemoryNetwork::new();
        let mut a = Node::new(&network, "a");
        let mut b = Node::new(&network, "b");

        a.dial(&b.id);
        a.pump();
        b.pump();
        let first = b.pool.connection(&a.id).unwrap().link_id();

        // A second dial from "a" replaces the first link on "b"; the Closed
        // event for the old link is then ignored.
        let _redial = a.transport.connect(&b.id).unwrap();
        b.pump();

        let second = b.pool.connection(&a.id).unwrap().link_id();
        assert_ne!(first, second);
        assert_eq!(b.pool.connected_count(), 1);
        assert_eq!(b.pool.on_closed(first), None);
        assert_eq!(b.pool.peer_for(second), Some(&a.id));
    }

    #[test]
    fn test_send_to_unknown_link() {
        let mut pool = ConnectionPool::new();
        assert_eq!(
            pool.send_to(LinkId(99), vec![1]).unwrap_err(),
            TransportError::LinkClosed(LinkId(99))
        );
    }
}
