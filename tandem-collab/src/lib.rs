//! # tandem-collab: Serverless real-time collaboration for Tandem
//!
//! Connects independently running editors directly to each other and keeps
//! their text converged, while every user keeps a private undo history.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   FullSync / Update / Ack   ┌──────────────┐
//! │ Session (A)  │ ◄─────────────────────────► │ Session (B)  │
//! │  one task    │       PeerLink (mesh)       │  one task    │
//! └──────┬───────┘                             └──────┬───────┘
//!        │                                            │
//!        ├── ReplicatedText (yrs)                     ├── ReplicatedText
//!        ├── History (local only)                     ├── History
//!        ├── ChangeEmitter (150ms debounce)           ├── ChangeEmitter
//!        ├── ConnectionPool ──► Transport             ├── ConnectionPool
//!        └── LocalStore (room, peer id, content)      └── LocalStore
//! ```
//!
//! ## Modules
//!
//! - [`identity`]: Rooms, peer ids, join links
//! - [`storage`]: Local key/value persistence (memory, RocksDB)
//! - [`transport`]: Peer transport trait, in-process and WebSocket backends
//! - [`pool`]: Mesh connection pool with best-effort fan-out
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`emitter`]: Debounced outbound change batching
//! - [`session`]: The session task and its handle

pub mod emitter;
pub mod identity;
pub mod pool;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use emitter::ChangeEmitter;
pub use identity::{
    build_share_url, get_or_create_room, parse_join_link, JoinLink, PeerId, Room, RoomId,
};
pub use pool::{ConnectionPool, LinkState, PeerConnection, PoolStats};
pub use protocol::{MessageKind, ProtocolError, SyncMessage};
pub use session::{
    SaveStatus, SessionConfig, SessionError, SessionEvent, SessionHandle, SessionStats,
    SessionStatus, ShareInfo,
};
pub use storage::{LocalStore, MemoryStore, RocksStore, StoreConfig, StoreError};
pub use transport::{
    LinkId, MemoryNetwork, MemoryTransport, PeerLink, Transport, TransportError, TransportEvent,
    WsConfig, WsTransport,
};
