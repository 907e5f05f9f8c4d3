//! Collaboration session: one task owning the document, history, pool and
//! store for a room.
//!
//! ```text
//!  SessionHandle ──commands──►┐
//!                             │  tokio::select!   ┌──► ConnectionPool ──► links
//!  Transport ─────events─────►├──► SessionActor ──┤
//!                             │                   └──► LocalStore (autosave)
//!  earliest timer deadline ──►┘
//!                                   │
//!                                   └──► watch<SessionStatus>, SessionEvent
//! ```
//!
//! Local text goes History → ReplicatedText → ChangeEmitter → broadcast.
//! Received updates go ReplicatedText → History (as `Remote`) and are never
//! fed back into the emitter, so nothing a peer sends is echoed.
//!
//! All timers (history commit, outbound debounce, auto-dial, autosave) are
//! deadlines; the loop sleeps until the earliest one.

use std::future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tandem_core::debounce::earliest;
use tandem_core::{
    history_command, ContentChange, Debouncer, Focus, History, HistoryCommand, HistoryConfig,
    KeyChord, Origin, ReplicatedText,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::emitter::ChangeEmitter;
use crate::identity::{
    build_share_url, get_or_create_room, new_room, persist_peer_id, stored_peer_id, JoinLink,
    PeerId, Room, RoomId,
};
use crate::pool::{ConnectionPool, LinkState, PoolStats};
use crate::protocol::{MessageKind, ProtocolError, SyncMessage};
use crate::storage::{LocalStore, CONTENT_KEY, ROOM_KEY};
use crate::transport::{EventReceiver, LinkId, Transport, TransportError, TransportEvent};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Application URL that share links are built on
    pub base_url: String,
    /// Quiet window before local changes are broadcast
    pub sync_debounce: Duration,
    pub history: HistoryConfig,
    /// Delay between registration and dialing the host of a join link
    pub auto_dial_delay: Duration,
    /// Quiet window before content is written to the store
    pub autosave_delay: Duration,
    /// How long `SaveStatus::Saved` is shown
    pub saved_display: Duration,
    /// Command queue capacity per session
    pub command_capacity: usize,
    /// Event queue capacity; events beyond it are dropped
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5173/".to_string(),
            sync_debounce: Duration::from_millis(150),
            history: HistoryConfig::default(),
            auto_dial_delay: Duration::from_millis(800),
            autosave_delay: Duration::from_millis(500),
            saved_display: Duration::from_secs(2),
            command_capacity: 64,
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveStatus {
    #[default]
    Idle,
    /// Unsaved changes, waiting for the autosave window
    Saving,
    /// Written; shown for a short while before returning to `Idle`
    Saved,
}

/// Snapshot published after every step of the session loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub local_peer_id: Option<PeerId>,
    pub room_id: RoomId,
    pub share_url: Option<String>,
    pub connected_peers: usize,
    pub peers: Vec<PeerId>,
    pub content: String,
    pub can_undo: bool,
    pub can_redo: bool,
    pub save_status: SaveStatus,
}

impl SessionStatus {
    pub fn is_connected(&self) -> bool {
        self.connected_peers > 0
    }
}

/// Room and join link handed to the user for sharing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareInfo {
    pub room_id: RoomId,
    /// `None` until the transport has registered
    pub share_url: Option<String>,
}

/// Events emitted by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The transport assigned the local peer id
    Registered(PeerId),
    /// The document text changed, from any origin
    ContentChanged(ContentChange),
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub pool: PoolStats,
    pub updates_sent: u64,
    pub updates_received: u64,
    pub full_syncs_received: u64,
    pub acks_received: u64,
    pub rejected_messages: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session has shut down")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

enum Command {
    SetContent {
        text: String,
        reply: oneshot::Sender<()>,
    },
    Undo {
        reply: oneshot::Sender<bool>,
    },
    Redo {
        reply: oneshot::Sender<bool>,
    },
    Shortcut {
        chord: KeyChord,
        focus: Focus,
        reply: oneshot::Sender<bool>,
    },
    CreateSession {
        reply: oneshot::Sender<ShareInfo>,
    },
    JoinSession {
        room: RoomId,
        reply: oneshot::Sender<()>,
    },
    ConnectToPeer {
        peer: PeerId,
        reply: oneshot::Sender<Result<bool, SessionError>>,
    },
    ShareSession {
        reply: oneshot::Sender<ShareInfo>,
    },
    NewSession {
        reply: oneshot::Sender<ShareInfo>,
    },
    BroadcastUpdate {
        text: String,
        reply: oneshot::Sender<Result<usize, SessionError>>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running session.
///
/// Reads come from the latest published [`SessionStatus`] and never wait.
/// Everything else is a command processed in order by the session task.
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Clone for SessionHandle {
    /// Clones share the session but not the event receiver.
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            status: self.status.clone(),
            event_rx: None,
            task: self.task.clone(),
        }
    }
}

impl SessionHandle {
    /// Start a session on the current tokio runtime.
    ///
    /// `join` is the parsed join link the editor was opened with; an empty
    /// link hosts (or rejoins) the stored room.
    pub fn spawn<T, S>(config: SessionConfig, transport: T, store: S, join: JoinLink) -> Self
    where
        T: Transport + 'static,
        S: LocalStore + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel(config.command_capacity.max(1));
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();

        let mut actor =
            SessionActor::new(config, Box::new(transport), Box::new(store), join, event_tx);
        let status = actor.status_tx.subscribe();

        if let Err(e) = actor.register(transport_tx) {
            log::error!("Transport registration failed: {e}");
        }

        let task = tokio::spawn(actor.run(command_rx, transport_rx));
        Self {
            commands: command_tx,
            status,
            event_rx: Some(event_rx),
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Take the event receiver. Only the first call on the original handle
    /// gets it.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Watch for status changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Wait until the published status satisfies `predicate`.
    pub async fn wait_for<F>(&self, predicate: F) -> Result<SessionStatus, SessionError>
    where
        F: FnMut(&SessionStatus) -> bool,
    {
        let mut rx = self.status.clone();
        let status = rx.wait_for(predicate).await.map_err(|_| SessionError::Closed)?;
        Ok(status.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().is_connected()
    }

    pub fn share_url(&self) -> Option<String> {
        self.status.borrow().share_url.clone()
    }

    pub fn room_id(&self) -> RoomId {
        self.status.borrow().room_id.clone()
    }

    pub fn connected_peers(&self) -> usize {
        self.status.borrow().connected_peers
    }

    pub fn local_peer_id(&self) -> Option<PeerId> {
        self.status.borrow().local_peer_id.clone()
    }

    pub fn content(&self) -> String {
        self.status.borrow().content.clone()
    }

    pub fn can_undo(&self) -> bool {
        self.status.borrow().can_undo
    }

    pub fn can_redo(&self) -> bool {
        self.status.borrow().can_redo
    }

    pub fn save_status(&self) -> SaveStatus {
        self.status.borrow().save_status
    }

    /// Replace the editor text with a local edit.
    pub async fn set_content(&self, text: impl Into<String>) -> Result<(), SessionError> {
        let text = text.into();
        self.request(|reply| Command::SetContent { text, reply }).await
    }

    /// Returns whether anything was undone.
    pub async fn undo(&self) -> Result<bool, SessionError> {
        self.request(|reply| Command::Undo { reply }).await
    }

    pub async fn redo(&self) -> Result<bool, SessionError> {
        self.request(|reply| Command::Redo { reply }).await
    }

    /// Route a key chord. Returns whether it was consumed.
    pub async fn handle_shortcut(
        &self,
        chord: KeyChord,
        focus: Focus,
    ) -> Result<bool, SessionError> {
        self.request(|reply| Command::Shortcut {
            chord,
            focus,
            reply,
        })
        .await
    }

    /// Make sure the current room is stored and build its share link.
    pub async fn create_session(&self) -> Result<ShareInfo, SessionError> {
        self.request(|reply| Command::CreateSession { reply }).await
    }

    /// Switch to `room_id` without dialing anyone.
    pub async fn join_session(&self, room_id: impl Into<String>) -> Result<(), SessionError> {
        let room = RoomId::new(room_id);
        self.request(|reply| Command::JoinSession { room, reply }).await
    }

    /// Dial a peer. `Ok(false)` if a link to it already exists.
    pub async fn connect_to_peer(&self, peer_id: impl Into<String>) -> Result<bool, SessionError> {
        let peer = PeerId::new(peer_id);
        self.request(|reply| Command::ConnectToPeer { peer, reply }).await?
    }

    pub async fn share_session(&self) -> Result<ShareInfo, SessionError> {
        self.request(|reply| Command::ShareSession { reply }).await
    }

    /// Leave every peer and start over in a fresh room. The text is kept.
    pub async fn new_session(&self) -> Result<ShareInfo, SessionError> {
        self.request(|reply| Command::NewSession { reply }).await
    }

    /// Apply `text` as a local edit and send it to every peer immediately.
    /// Returns how many peers it was sent to.
    pub async fn broadcast_update(&self, text: impl Into<String>) -> Result<usize, SessionError> {
        let text = text.into();
        self.request(|reply| Command::BroadcastUpdate { text, reply }).await?
    }

    /// Commit pending history, send pending changes and save now.
    pub async fn flush(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Flush { reply }).await
    }

    pub async fn stats(&self) -> Result<SessionStats, SessionError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Flush, close every link, and stop the session task.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Shutdown { reply }).await?;
        let task = self.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }
}

struct SessionActor {
    config: SessionConfig,
    transport: Box<dyn Transport>,
    store: Box<dyn LocalStore>,
    room: Room,
    join: JoinLink,
    local: Option<PeerId>,
    share_url: Option<String>,
    text: ReplicatedText,
    history: History,
    emitter: ChangeEmitter,
    pool: ConnectionPool,
    auto_dial: Option<Instant>,
    autosave: Debouncer,
    save_status: SaveStatus,
    saved_until: Option<Instant>,
    stats: SessionStats,
    events: mpsc::Sender<SessionEvent>,
    status_tx: watch::Sender<SessionStatus>,
}

impl SessionActor {
    fn new(
        config: SessionConfig,
        transport: Box<dyn Transport>,
        mut store: Box<dyn LocalStore>,
        join: JoinLink,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let room = get_or_create_room(join.room.as_ref().map(RoomId::as_str), store.as_mut());

        // A joiner that dials the host adopts the host's document through the
        // handshake; seeding it from storage would duplicate the text.
        let mut text = if join.dial_target().is_some() {
            ReplicatedText::new()
        } else {
            restore_text(store.as_ref())
        };
        let initial = text.to_string();

        let observer_events = events.clone();
        text.observe(move |change| {
            if observer_events
                .try_send(SessionEvent::ContentChanged(change.clone()))
                .is_err()
            {
                log::trace!("event queue full, dropping content change");
            }
        });

        let status_tx = watch::Sender::new(SessionStatus {
            local_peer_id: None,
            room_id: room.room_id.clone(),
            share_url: None,
            connected_peers: 0,
            peers: Vec::new(),
            content: initial.clone(),
            can_undo: false,
            can_redo: false,
            save_status: SaveStatus::Idle,
        });

        Self {
            history: History::new(initial, config.history.clone()),
            emitter: ChangeEmitter::new(config.sync_debounce),
            autosave: Debouncer::quiet(config.autosave_delay),
            config,
            transport,
            store,
            room,
            join,
            local: None,
            share_url: None,
            text,
            pool: ConnectionPool::new(),
            auto_dial: None,
            save_status: SaveStatus::Idle,
            saved_until: None,
            stats: SessionStats::default(),
            events,
            status_tx,
        }
    }

    fn register(&mut self, events: crate::transport::EventSender) -> Result<(), TransportError> {
        let preferred = stored_peer_id(self.store.as_ref());
        self.transport.register(preferred.as_ref(), events)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut transport_events: EventReceiver,
    ) {
        log::info!("Session for room {} started", self.room.room_id);
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown();
                        self.reply(reply, ());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = transport_events.recv() => self.handle_transport(event),
                _ = sleep_until(deadline) => {}
            }
            self.on_timers(now());
            self.publish();
        }
        log::info!("Session for room {} stopped", self.room.room_id);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetContent { text, reply } => {
                self.local_edit(text, Origin::Local, now());
                self.reply(reply, ());
            }
            Command::Undo { reply } => {
                let undone = self.run_history(HistoryCommand::Undo);
                self.reply(reply, undone);
            }
            Command::Redo { reply } => {
                let redone = self.run_history(HistoryCommand::Redo);
                self.reply(reply, redone);
            }
            Command::Shortcut { chord, focus, reply } => {
                let consumed = match history_command(chord, focus) {
                    Some(command) => {
                        self.run_history(command);
                        true
                    }
                    None => false,
                };
                self.reply(reply, consumed);
            }
            Command::CreateSession { reply } => {
                if let Err(e) = self.store.set(ROOM_KEY, self.room.room_id.as_str()) {
                    log::warn!("Could not persist room id: {e}");
                }
                self.share_url = self.build_share_url();
                self.reply(reply, self.share_info());
            }
            Command::JoinSession { room, reply } => {
                self.room = get_or_create_room(Some(room.as_str()), self.store.as_mut());
                if self.share_url.is_some() {
                    self.share_url = self.build_share_url();
                }
                self.reply(reply, ());
            }
            Command::ConnectToPeer { peer, reply } => {
                let dialed = self.connect_to(&peer);
                self.reply(reply, dialed);
            }
            Command::ShareSession { reply } => {
                if let Some(url) = self.build_share_url() {
                    self.share_url = Some(url);
                }
                self.reply(reply, self.share_info());
            }
            Command::NewSession { reply } => {
                self.room = new_room(self.store.as_mut());
                for peer in self.pool.connected_peers() {
                    self.emit(SessionEvent::PeerDisconnected(peer));
                }
                self.pool.close_all();
                self.emitter.discard();
                self.share_url = self.build_share_url();
                self.reply(reply, self.share_info());
            }
            Command::BroadcastUpdate { text, reply } => {
                self.local_edit(text, Origin::Local, now());
                let sent = match self.emitter.flush() {
                    Some(message) => self.broadcast(&message),
                    None => Ok(0),
                };
                self.reply(reply, sent);
            }
            Command::Flush { reply } => {
                self.flush();
                self.reply(reply, ());
            }
            Command::Stats { reply } => {
                let mut stats = self.stats.clone();
                stats.pool = self.pool.stats();
                self.reply(reply, stats);
            }
            Command::Shutdown { reply } => {
                self.reply(reply, ());
            }
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Registered(id) => {
                log::info!("Registered as {id}");
                persist_peer_id(self.store.as_mut(), &id);
                self.pool.set_local(id.clone());
                self.local = Some(id.clone());
                if self.join.room.is_none() {
                    self.share_url = self.build_share_url();
                }
                if self.join.dial_target().is_some() {
                    self.auto_dial = Some(now() + self.config.auto_dial_delay);
                }
                self.emit(SessionEvent::Registered(id));
            }
            TransportEvent::Incoming(link) => {
                let remote = link.remote().clone();
                let was_open = self
                    .pool
                    .connection(&remote)
                    .is_some_and(|conn| conn.state() == LinkState::Open);
                // The replacement link announces the peer again once it opens.
                if self.pool.on_incoming(link) && was_open {
                    self.emit(SessionEvent::PeerDisconnected(remote));
                }
            }
            TransportEvent::Open(link) => {
                if let Some(remote) = self.pool.on_open(link) {
                    self.send_full_sync(link);
                    self.emit(SessionEvent::PeerConnected(remote));
                }
            }
            TransportEvent::Data { link, bytes } => self.handle_data(link, &bytes),
            TransportEvent::Closed(link) => {
                if let Some(remote) = self.pool.on_closed(link) {
                    self.emit(SessionEvent::PeerDisconnected(remote));
                }
            }
            TransportEvent::Error {
                link: Some(link),
                reason,
            } => {
                if let Some(remote) = self.pool.on_error(link, &reason) {
                    self.emit(SessionEvent::PeerDisconnected(remote));
                }
            }
            TransportEvent::Error { link: None, reason } => {
                log::error!("Transport error: {reason}");
            }
        }
    }

    fn handle_data(&mut self, link: LinkId, bytes: &[u8]) {
        if self.pool.peer_for(link).is_none() {
            log::debug!("Dropping frame from unknown link {link}");
            return;
        }
        let message = match SyncMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                self.stats.rejected_messages += 1;
                log::debug!("Dropping message on link {link}: {e}");
                return;
            }
        };

        match message.kind {
            MessageKind::FullSync => {
                if self.integrate(link, &message.updates) {
                    self.stats.full_syncs_received += 1;
                }
            }
            MessageKind::Update => {
                if !self.integrate(link, &message.updates) {
                    return;
                }
                self.stats.updates_received += 1;
                if let Some(sequence_id) = message.sequence_id {
                    self.send_on(link, &SyncMessage::ack(sequence_id));
                }
            }
            MessageKind::Ack => {
                self.stats.acks_received += 1;
                log::trace!("link {link} acked update {:?}", message.sequence_id);
            }
        }
    }

    /// Merge received CRDT updates. Returns false if they were rejected.
    fn integrate(&mut self, link: LinkId, updates: &[Vec<u8>]) -> bool {
        match self.text.apply_remote_all(updates) {
            Ok(true) => {
                let now = now();
                self.history
                    .set_content(self.text.to_string(), Origin::Remote, now);
                self.mark_unsaved(now);
                true
            }
            Ok(false) => true,
            Err(e) => {
                self.stats.rejected_messages += 1;
                log::debug!("Rejected updates on link {link}: {e}");
                false
            }
        }
    }

    /// Apply a local or history-replay edit and queue it for peers.
    fn local_edit(&mut self, text: String, origin: Origin, now: Instant) {
        if origin.records_history() {
            self.history.set_content(text.clone(), origin, now);
        }
        if let Some(delta) = self.text.mutate_local(&text, origin) {
            self.emitter.notify_local_change(&text, delta, now);
            self.mark_unsaved(now);
        }
    }

    /// Start or extend the autosave window; status reads `Saving` until the
    /// write lands.
    fn mark_unsaved(&mut self, now: Instant) {
        self.autosave.touch(now);
        self.save_status = SaveStatus::Saving;
        self.saved_until = None;
    }

    fn run_history(&mut self, command: HistoryCommand) -> bool {
        let change = match command {
            HistoryCommand::Undo => self.history.undo(),
            HistoryCommand::Redo => self.history.redo(),
        };
        match change {
            Some(change) => {
                self.local_edit(change.text, change.origin, now());
                true
            }
            None => false,
        }
    }

    fn connect_to(&mut self, peer: &PeerId) -> Result<bool, SessionError> {
        Ok(self.pool.connect_to(self.transport.as_mut(), peer)?)
    }

    fn send_full_sync(&mut self, link: LinkId) {
        let message = SyncMessage::full_sync(self.text.to_string(), self.text.snapshot());
        self.send_on(link, &message);
    }

    fn send_on(&mut self, link: LinkId, message: &SyncMessage) {
        match message.encode() {
            Ok(bytes) => {
                // A failed send retires the link, so look the peer up first.
                let remote = self.pool.peer_for(link).cloned();
                if let (Err(_), Some(remote)) = (self.pool.send_to(link, bytes), remote) {
                    self.emit(SessionEvent::PeerDisconnected(remote));
                }
            }
            Err(e) => log::error!("Failed to encode {:?} message: {e}", message.kind),
        }
    }

    fn broadcast(&mut self, message: &SyncMessage) -> Result<usize, SessionError> {
        let bytes = message.encode()?;
        let before = self.pool.connected_peers();
        let sent = self.pool.broadcast(&bytes);
        self.stats.updates_sent += 1;

        let after = self.pool.connected_peers();
        for peer in before.into_iter().filter(|p| !after.contains(p)) {
            self.emit(SessionEvent::PeerDisconnected(peer));
        }
        Ok(sent)
    }

    fn on_timers(&mut self, now: Instant) {
        self.history.poll(now);

        if let Some(message) = self.emitter.poll(now) {
            if let Err(e) = self.broadcast(&message) {
                log::error!("Failed to broadcast update: {e}");
            }
        }

        if self.auto_dial.is_some_and(|at| at <= now) {
            self.auto_dial = None;
            if let Some(host) = self.join.dial_target().cloned() {
                log::info!("Auto-dialing host {host}");
                if let Err(e) = self.connect_to(&host) {
                    log::error!("Failed to dial host {host}: {e}");
                }
            }
        }

        if self.autosave.fire_if_due(now) {
            self.save(now);
        }

        if self.saved_until.is_some_and(|at| at <= now) {
            self.saved_until = None;
            self.save_status = SaveStatus::Idle;
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        earliest([
            self.history.deadline(),
            self.emitter.deadline(),
            self.auto_dial,
            self.autosave.deadline(),
            self.saved_until,
        ])
    }

    fn save(&mut self, now: Instant) {
        self.save_status = SaveStatus::Saving;
        let saved = self
            .store
            .set(CONTENT_KEY, &self.text.to_string())
            .and_then(|()| self.store.save_snapshot(&self.text.snapshot()));
        match saved {
            Ok(()) => {
                log::debug!("Saved content");
                self.save_status = SaveStatus::Saved;
                self.saved_until = Some(now + self.config.saved_display);
            }
            Err(e) => {
                log::warn!("Autosave failed, content kept in memory: {e}");
                self.save_status = SaveStatus::Idle;
                self.saved_until = None;
            }
        }
    }

    fn flush(&mut self) {
        self.history.flush();
        if let Some(message) = self.emitter.flush() {
            if let Err(e) = self.broadcast(&message) {
                log::error!("Failed to broadcast update: {e}");
            }
        }
        if self.autosave.is_pending() {
            self.autosave.cancel();
            self.save(now());
        }
    }

    fn shutdown(&mut self) {
        self.flush();
        self.pool.close_all();
        self.transport.shutdown();
        self.auto_dial = None;
    }

    fn build_share_url(&self) -> Option<String> {
        self.local
            .as_ref()
            .map(|peer| build_share_url(&self.config.base_url, peer, &self.room.room_id))
    }

    fn share_info(&self) -> ShareInfo {
        ShareInfo {
            room_id: self.room.room_id.clone(),
            share_url: self.share_url.clone(),
        }
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            local_peer_id: self.local.clone(),
            room_id: self.room.room_id.clone(),
            share_url: self.share_url.clone(),
            connected_peers: self.pool.connected_count(),
            peers: self.pool.connected_peers(),
            content: self.history.content().to_string(),
            can_undo: self.history.can_undo(),
            can_redo: self.history.can_redo(),
            save_status: self.save_status,
        }
    }

    /// Publish the current status, then answer the caller, so a handle that
    /// reads status after a command always sees its effect.
    fn reply<T>(&self, reply: oneshot::Sender<T>, value: T) {
        self.publish();
        let _ = reply.send(value);
    }

    fn publish(&self) {
        let next = self.status();
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.try_send(event).is_err() {
            log::trace!("event queue full, dropping session event");
        }
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => future::pending().await,
    }
}

/// Load the saved document, preferring the CRDT state so a restarted peer
/// keeps the item ids its collaborators already hold.
fn restore_text(store: &dyn LocalStore) -> ReplicatedText {
    let content = match store.get(CONTENT_KEY) {
        Ok(content) => content.unwrap_or_default(),
        Err(e) => {
            log::warn!("Could not load saved content: {e}");
            return ReplicatedText::new();
        }
    };

    match store.load_snapshot() {
        Ok(Some(state)) => match ReplicatedText::from_snapshot(&state) {
            Ok(text) if text.to_string() == content => return text,
            Ok(_) => log::warn!("Saved document state is stale, seeding from text"),
            Err(e) => log::warn!("Could not restore document state: {e}"),
        },
        Ok(None) => {}
        Err(e) => log::warn!("Could not load document state: {e}"),
    }
    ReplicatedText::with_text(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::transport::MemoryNetwork;

    fn host(network: &MemoryNetwork, store: MemoryStore) -> SessionHandle {
        SessionHandle::spawn(
            SessionConfig::default(),
            network.transport(),
            store,
            JoinLink::host(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_registers_and_builds_share_url() {
        let network = MemoryNetwork::new();
        let session = host(&network, MemoryStore::new());

        let status = session.wait_for(|s| s.share_url.is_some()).await.unwrap();
        let peer = status.local_peer_id.clone().unwrap();
        let url = status.share_url.unwrap();
        assert!(url.contains(&format!("room={}", status.room_id)));
        assert!(url.contains(&format!("peer={peer}")));
        assert!(!session.is_connected());

        session.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_restores_saved_content_and_peer_id() {
        let network = MemoryNetwork::new();
        let mut store = MemoryStore::new();
        store.set(CONTENT_KEY, "saved text").unwrap();
        store.set(crate::storage::PEER_KEY, "returning-peer").unwrap();

        let session = host(&network, store);
        let status = session
            .wait_for(|s| s.local_peer_id.is_some())
            .await
            .unwrap();
        assert_eq!(status.content, "saved text");
        assert_eq!(status.local_peer_id, Some(PeerId::new("returning-peer")));
        assert!(!status.can_undo);

        session.shutdown().await.unwrap();
    }

    #[test]
    fn test_restore_prefers_matching_snapshot() {
        let mut saved = ReplicatedText::with_text("v1");
        saved.mutate_local("v2", Origin::Local);

        let mut store = MemoryStore::new();
        store.set(CONTENT_KEY, "v2").unwrap();
        store.save_snapshot(&saved.snapshot()).unwrap();

        let mut restored = restore_text(&store);
        assert_eq!(restored.to_string(), "v2");
        assert!(!restored.apply_remote(&saved.snapshot()).unwrap());

        // Text written without a matching state is seeded afresh.
        store.set(CONTENT_KEY, "edited offline").unwrap();
        assert_eq!(restore_text(&store).to_string(), "edited offline");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shortcut_routing() {
        let network = MemoryNetwork::new();
        let session = host(&network, MemoryStore::new());

        session.set_content("typed").await.unwrap();
        let undo = KeyChord::new('z').ctrl();
        assert!(!session.handle_shortcut(undo, Focus::Elsewhere).await.unwrap());
        assert_eq!(session.content(), "typed");

        assert!(session.handle_shortcut(undo, Focus::Editor).await.unwrap());
        assert_eq!(session.content(), "");
        assert!(session
            .handle_shortcut(KeyChord::new('z').meta().shift(), Focus::Editor)
            .await
            .unwrap());
        assert_eq!(session.content(), "typed");

        session.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_after_shutdown_fail() {
        let network = MemoryNetwork::new();
        let session = host(&network, MemoryStore::new());
        session.shutdown().await.unwrap();

        assert!(matches!(
            session.set_content("late").await,
            Err(SessionError::Closed)
        ));
        assert!(matches!(session.undo().await, Err(SessionError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_event_rx_once() {
        let network = MemoryNetwork::new();
        let mut session = host(&network, MemoryStore::new());
        let mut clone = session.clone();

        assert!(clone.take_event_rx().is_none());
        let mut events = session.take_event_rx().unwrap();
        assert!(session.take_event_rx().is_none());

        assert!(matches!(
            events.recv().await,
            Some(SessionEvent::Registered(_))
        ));
        session.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_to_unknown_peer_or_self() {
        let network = MemoryNetwork::new();
        let session = host(&network, MemoryStore::new());
        session.wait_for(|s| s.local_peer_id.is_some()).await.unwrap();

        assert!(matches!(
            session.connect_to_peer("nobody").await,
            Err(SessionError::Transport(TransportError::UnknownPeer(_)))
        ));
        let own = session.local_peer_id().unwrap();
        assert!(!session.connect_to_peer(own.as_str()).await.unwrap());

        session.shutdown().await.unwrap();
    }
}
