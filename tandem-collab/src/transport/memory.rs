//! In-process transport.
//!
//! Every [`MemoryTransport`] created from the same [`MemoryNetwork`] can dial
//! every other one. Links are pairs of endpoints sharing an open flag; frames
//! go straight onto the remote transport's event channel, so per-link order
//! is the channel order. Peers can be made unreachable to simulate a peer
//! that vanished without closing its links.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::identity::PeerId;

use super::{EventSender, LinkId, PeerLink, Transport, TransportError, TransportEvent};

#[derive(Default)]
struct NetworkState {
    peers: HashMap<PeerId, EventSender>,
    unreachable: HashSet<PeerId>,
    next_link: u64,
    next_peer: u64,
}

impl NetworkState {
    fn allocate_link(&mut self) -> LinkId {
        self.next_link += 1;
        LinkId(self.next_link)
    }
}

/// Shared switchboard for in-process peers.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local: None,
        }
    }

    /// Number of registered peers.
    pub fn peer_count(&self) -> usize {
        self.state.lock().map(|s| s.peers.len()).unwrap_or(0)
    }

    /// Drop (or restore) every frame addressed to `peer`. Sends to an
    /// unreachable peer fail on the sending side.
    pub fn set_reachable(&self, peer: &PeerId, reachable: bool) {
        if let Ok(mut state) = self.state.lock() {
            if reachable {
                state.unreachable.remove(peer);
            } else {
                state.unreachable.insert(peer.clone());
            }
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, NetworkState>, TransportError> {
        self.state
            .lock()
            .map_err(|_| TransportError::Io("memory network poisoned".into()))
    }

    fn is_reachable(&self, peer: &PeerId) -> bool {
        self.state
            .lock()
            .map(|s| !s.unreachable.contains(peer) && s.peers.contains_key(peer))
            .unwrap_or(false)
    }
}

impl fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("peers", &self.peer_count())
            .finish()
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    local: Option<(PeerId, EventSender)>,
}

impl Transport for MemoryTransport {
    fn register(
        &mut self,
        preferred: Option<&PeerId>,
        events: EventSender,
    ) -> Result<(), TransportError> {
        let id = {
            let mut state = self.network.lock()?;
            let id = match preferred {
                Some(id) if !state.peers.contains_key(id) => id.clone(),
                _ => loop {
                    state.next_peer += 1;
                    let candidate = PeerId::new(format!("mem-{}", state.next_peer));
                    if !state.peers.contains_key(&candidate) {
                        break candidate;
                    }
                },
            };
            state.peers.insert(id.clone(), events.clone());
            id
        };

        log::debug!("memory transport registered as {id}");
        let _ = events.send(TransportEvent::Registered(id.clone()));
        self.local = Some((id, events));
        Ok(())
    }

    fn connect(&mut self, remote: &PeerId) -> Result<Box<dyn PeerLink>, TransportError> {
        let (local_id, local_tx) = self.local.clone().ok_or(TransportError::NotRegistered)?;

        let mut state = self.network.lock()?;
        let remote_tx = state
            .peers
            .get(remote)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeer(remote.clone()))?;
        let dial_id = state.allocate_link();
        let accept_id = state.allocate_link();
        drop(state);

        let open = Arc::new(AtomicBool::new(true));
        let dialer = MemoryLink {
            id: dial_id,
            remote: remote.clone(),
            remote_link: accept_id,
            remote_tx: remote_tx.clone(),
            local_tx: local_tx.clone(),
            open: open.clone(),
            network: self.network.clone(),
        };
        let acceptor = MemoryLink {
            id: accept_id,
            remote: local_id,
            remote_link: dial_id,
            remote_tx: local_tx.clone(),
            local_tx: remote_tx.clone(),
            open,
            network: self.network.clone(),
        };

        let _ = remote_tx.send(TransportEvent::Incoming(Box::new(acceptor)));
        let _ = remote_tx.send(TransportEvent::Open(accept_id));
        let _ = local_tx.send(TransportEvent::Open(dial_id));
        Ok(Box::new(dialer))
    }

    fn shutdown(&mut self) {
        if let Some((id, _)) = self.local.take() {
            if let Ok(mut state) = self.network.lock() {
                state.peers.remove(&id);
            }
            log::debug!("memory transport {id} shut down");
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub struct MemoryLink {
    id: LinkId,
    remote: PeerId,
    remote_link: LinkId,
    remote_tx: EventSender,
    local_tx: EventSender,
    open: Arc<AtomicBool>,
    network: MemoryNetwork,
}

impl PeerLink for MemoryLink {
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
        if !self.is_open() {
            return Err(TransportError::LinkClosed(self.id));
        }
        if !self.network.is_reachable(&self.remote) {
            return Err(TransportError::Unreachable(self.remote.clone()));
        }
        self.remote_tx
            .send(TransportEvent::Data {
                link: self.remote_link,
                bytes,
            })
            .map_err(|_| TransportError::LinkClosed(self.id))
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.remote_tx.send(TransportEvent::Closed(self.remote_link));
            let _ = self.local_tx.send(TransportEvent::Closed(self.id));
        }
    }
}

impl fmt::Debug for MemoryLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLink")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("open", &self.is_open())
            .finish()
    }
}
