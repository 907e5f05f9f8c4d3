//! Room and peer identity.
//!
//! A room names one shared editing session; it is generated on first launch,
//! adopted verbatim from a join link, and persisted so a restart rejoins the
//! same room. The local peer id is assigned by the transport and persisted
//! only as a hint for the next registration.
//!
//! Join links are the application's base URL with two query parameters:
//! ```text
//! https://editor.example/?room=<room id>&peer=<host peer id>
//! ```

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::storage::{LocalStore, PEER_KEY, ROOM_KEY};

/// Transport-level address of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id (UUID v4, hex without dashes).
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub room_id: RoomId,
    /// Unix milliseconds at which this process adopted the room
    pub created_at: u64,
}

impl Room {
    fn adopt(room_id: RoomId) -> Self {
        Self {
            room_id,
            created_at: unix_millis(),
        }
    }
}

/// Query parameters of an incoming join link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinLink {
    pub room: Option<RoomId>,
    pub peer: Option<PeerId>,
}

impl JoinLink {
    pub fn host() -> Self {
        Self::default()
    }

    pub fn join(room: impl Into<String>, peer: impl Into<String>) -> Self {
        Self {
            room: Some(RoomId::new(room)),
            peer: Some(PeerId::new(peer)),
        }
    }

    /// Whether opening this link should dial a host.
    pub fn dial_target(&self) -> Option<&PeerId> {
        self.room.as_ref().and(self.peer.as_ref())
    }
}

/// Resolve the room for this launch.
///
/// A room id from the join link wins and is persisted; otherwise the stored
/// room is reused, or a new one is generated and stored. Storage failures
/// are logged and the room lives in memory only.
pub fn get_or_create_room(url_room_id: Option<&str>, store: &mut dyn LocalStore) -> Room {
    if let Some(id) = url_room_id.filter(|id| !id.is_empty()) {
        let room_id = RoomId::new(id);
        persist_room(store, &room_id);
        log::info!("Joining room {room_id}");
        return Room::adopt(room_id);
    }

    match store.get(ROOM_KEY) {
        Ok(Some(stored)) if !stored.is_empty() => {
            log::debug!("Reusing stored room {stored}");
            return Room::adopt(RoomId::new(stored));
        }
        Ok(_) => {}
        Err(e) => log::warn!("Could not read stored room id: {e}"),
    }

    let room_id = RoomId::random();
    persist_room(store, &room_id);
    log::info!("Created room {room_id}");
    Room::adopt(room_id)
}

/// Replace the stored room with a fresh one.
pub fn new_room(store: &mut dyn LocalStore) -> Room {
    if let Err(e) = store.remove(ROOM_KEY) {
        log::warn!("Could not clear stored room id: {e}");
    }
    let room_id = RoomId::random();
    persist_room(store, &room_id);
    log::info!("Started new room {room_id}");
    Room::adopt(room_id)
}

/// Peer id kept from a previous registration, if any.
pub fn stored_peer_id(store: &dyn LocalStore) -> Option<PeerId> {
    match store.get(PEER_KEY) {
        Ok(id) => id.filter(|id| !id.is_empty()).map(PeerId::new),
        Err(e) => {
            log::warn!("Could not read stored peer id: {e}");
            None
        }
    }
}

pub fn persist_peer_id(store: &mut dyn LocalStore, peer_id: &PeerId) {
    if let Err(e) = store.set(PEER_KEY, peer_id.as_str()) {
        log::warn!("Could not persist peer id: {e}");
    }
}

fn persist_room(store: &mut dyn LocalStore, room_id: &RoomId) {
    if let Err(e) = store.set(ROOM_KEY, room_id.as_str()) {
        log::warn!("Could not persist room id, keeping it in memory: {e}");
    }
}

/// Join link for `room_id` hosted by `peer_id`.
///
/// Any query already on `base_url` is replaced. A base that is not an
/// absolute URL gets the query appended as-is.
pub fn build_share_url(base_url: &str, peer_id: &PeerId, room_id: &RoomId) -> String {
    match Url::parse(base_url) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.query_pairs_mut()
                .clear()
                .append_pair("room", room_id.as_str())
                .append_pair("peer", peer_id.as_str());
            url.to_string()
        }
        Err(_) => {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .append_pair("room", room_id.as_str())
                .append_pair("peer", peer_id.as_str())
                .finish();
            let base = base_url.split(['?', '#']).next().unwrap_or_default();
            format!("{base}?{query}")
        }
    }
}

/// Read `room` and `peer` from a join link. Anything unparseable is a host
/// link.
pub fn parse_join_link(link: &str) -> JoinLink {
    let query = match Url::parse(link) {
        Ok(url) => url.query().map(str::to_string),
        Err(_) => link
            .split_once('?')
            .map(|(_, q)| q.split('#').next().unwrap_or_default().to_string()),
    };
    let Some(query) = query else {
        return JoinLink::host();
    };

    let mut join = JoinLink::host();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if value.is_empty() {
            continue;
        }
        match &*key {
            "room" if join.room.is_none() => join.room = Some(RoomId::new(value)),
            "peer" if join.peer.is_none() => join.peer = Some(PeerId::new(value)),
            _ => {}
        }
    }
    join
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn test_host_flow_generates_and_persists() {
        let mut store = MemoryStore::new();
        let room = get_or_create_room(None, &mut store);

        assert_eq!(room.room_id.as_str().len(), 32);
        assert!(room.room_id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(
            store.get(ROOM_KEY).unwrap().as_deref(),
            Some(room.room_id.as_str())
        );
        assert!(room.created_at > 0);
    }

    #[test]
    fn test_host_flow_reuses_stored_room() {
        let mut store = MemoryStore::new();
        let first = get_or_create_room(None, &mut store);
        let second = get_or_create_room(None, &mut store);
        assert_eq!(first.room_id, second.room_id);
    }

    #[test]
    fn test_join_flow_adopts_link_room() {
        let mut store = MemoryStore::new();
        store.set(ROOM_KEY, "old-room").unwrap();

        let room = get_or_create_room(Some("abc123"), &mut store);
        assert_eq!(room.room_id.as_str(), "abc123");
        assert_eq!(store.get(ROOM_KEY).unwrap().as_deref(), Some("abc123"));
    }

    #[test]
    fn test_unavailable_storage_degrades_to_memory() {
        let mut store = MemoryStore::unavailable();
        let room = get_or_create_room(None, &mut store);
        assert!(!room.room_id.as_str().is_empty());

        let joined = get_or_create_room(Some("xyz"), &mut store);
        assert_eq!(joined.room_id.as_str(), "xyz");
    }

    #[test]
    fn test_new_room_replaces_stored() {
        let mut store = MemoryStore::new();
        let first = get_or_create_room(None, &mut store);
        let fresh = new_room(&mut store);

        assert_ne!(first.room_id, fresh.room_id);
        assert_eq!(
            store.get(ROOM_KEY).unwrap().as_deref(),
            Some(fresh.room_id.as_str())
        );
    }

    #[test]
    fn test_peer_id_persistence() {
        let mut store = MemoryStore::new();
        assert_eq!(stored_peer_id(&store), None);
        persist_peer_id(&mut store, &PeerId::new("peer-7"));
        assert_eq!(stored_peer_id(&store), Some(PeerId::new("peer-7")));
    }

    #[test]
    fn test_share_url_contains_room_and_peer() {
        let url = build_share_url(
            "https://editor.example/app",
            &PeerId::new("p1"),
            &RoomId::new("abc123"),
        );
        assert_eq!(url, "https://editor.example/app?room=abc123&peer=p1");
    }

    #[test]
    fn test_share_url_replaces_existing_query() {
        let url = build_share_url(
            "https://editor.example/?room=stale&x=1#frag",
            &PeerId::new("p1"),
            &RoomId::new("r"),
        );
        assert_eq!(url, "https://editor.example/?room=r&peer=p1");
    }

    #[test]
    fn test_share_url_encodes_peer() {
        let peer = PeerId::new("ws://127.0.0.1:4000");
        let url = build_share_url("http://localhost:5173/", &peer, &RoomId::new("r1"));
        assert!(url.contains("peer=ws%3A%2F%2F127.0.0.1%3A4000"), "{url}");

        let link = parse_join_link(&url);
        assert_eq!(link.peer, Some(peer));
        assert_eq!(link.room, Some(RoomId::new("r1")));
    }

    #[test]
    fn test_share_url_relative_base() {
        let url = build_share_url("/editor?old=1", &PeerId::new("p"), &RoomId::new("r"));
        assert_eq!(url, "/editor?room=r&peer=p");
    }

    #[test]
    fn test_parse_join_link_variants() {
        assert_eq!(parse_join_link("https://editor.example/"), JoinLink::host());
        assert_eq!(parse_join_link("not a url"), JoinLink::host());

        let room_only = parse_join_link("https://editor.example/?room=abc");
        assert_eq!(room_only.room, Some(RoomId::new("abc")));
        assert_eq!(room_only.peer, None);
        assert_eq!(room_only.dial_target(), None);

        let full = parse_join_link("?room=abc&peer=host-1");
        assert_eq!(full, JoinLink::join("abc", "host-1"));
        assert_eq!(full.dial_target(), Some(&PeerId::new("host-1")));
    }

    #[test]
    fn test_peer_without_room_does_not_dial() {
        let link = parse_join_link("https://editor.example/?peer=host-1");
        assert_eq!(link.dial_target(), None);
    }
}
