//! Convergent text buffer shared by every peer in a room.
//!
//! Wraps a yrs `Doc` holding a single text root. Local edits arrive as whole
//! strings from the editor and are reduced to one splice against the current
//! value, so two peers typing at different offsets produce independent CRDT
//! operations that merge instead of overwriting each other.

use std::fmt;

use yrs::updates::decoder::Decode;
use yrs::{
    Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Text, Transact, Update, WriteTxn,
};

use crate::change::{ContentChange, Origin};

/// Name of the shared text root inside the yrs document.
pub const TEXT_ROOT: &str = "shared-content";

#[derive(Debug, Clone, thiserror::Error)]
pub enum TextError {
    #[error("malformed update: {0}")]
    Decode(String),
    #[error("failed to integrate update: {0}")]
    Apply(String),
}

/// Handle returned by [`ReplicatedText::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(usize);

type Observer = Box<dyn FnMut(&ContentChange) + Send>;

/// One contiguous replacement, in byte offsets aligned to char boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Splice {
    pub start: usize,
    pub removed: usize,
    pub inserted: String,
}

/// Smallest single splice turning `old` into `new`, or `None` if equal.
pub fn splice(old: &str, new: &str) -> Option<Splice> {
    if old == new {
        return None;
    }

    let mut prefix = old
        .bytes()
        .zip(new.bytes())
        .take_while(|(a, b)| a == b)
        .count();
    while !old.is_char_boundary(prefix) || !new.is_char_boundary(prefix) {
        prefix -= 1;
    }

    let old_rest = &old[prefix..];
    let new_rest = &new[prefix..];
    let mut suffix = old_rest
        .bytes()
        .rev()
        .zip(new_rest.bytes().rev())
        .take_while(|(a, b)| a == b)
        .count();
    while !old_rest.is_char_boundary(old_rest.len() - suffix)
        || !new_rest.is_char_boundary(new_rest.len() - suffix)
    {
        suffix -= 1;
    }

    Some(Splice {
        start: prefix,
        removed: old_rest.len() - suffix,
        inserted: new_rest[..new_rest.len() - suffix].to_string(),
    })
}

/// FNV-1a of the seed text, folded into a non-zero 32-bit client id.
fn seed_client_id(text: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in text.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    ((hash ^ (hash >> 32)) & 0xFFFF_FFFF).max(1)
}

pub struct ReplicatedText {
    doc: Doc,
    observers: Vec<(ObserverId, Observer)>,
    next_observer: usize,
}

impl ReplicatedText {
    pub fn new() -> Self {
        let doc = Doc::with_options(Options {
            offset_kind: OffsetKind::Bytes,
            ..Options::default()
        });
        doc.get_or_insert_text(TEXT_ROOT);
        Self {
            doc,
            observers: Vec::new(),
            next_observer: 0,
        }
    }

    /// Create a document seeded with `initial`.
    ///
    /// The seed insert is authored by a client id derived from the text, so
    /// replicas seeded from the same saved text hold the same CRDT items and
    /// merge into one copy instead of two.
    pub fn with_text(initial: &str) -> Self {
        let text = Self::new();
        if initial.is_empty() {
            return text;
        }

        let seed = Doc::with_options(Options {
            client_id: seed_client_id(initial),
            offset_kind: OffsetKind::Bytes,
            ..Options::default()
        });
        let update = {
            let mut txn = seed.transact_mut();
            let root = txn.get_or_insert_text(TEXT_ROOT);
            root.insert(&mut txn, 0, initial);
            txn.encode_update_v1()
        };

        // Freshly encoded by the seed doc, so both steps only fail on a yrs bug.
        match Update::decode_v1(&update) {
            Ok(update) => {
                if let Err(e) = text.doc.transact_mut().apply_update(update) {
                    log::error!("Failed to seed document: {e}");
                }
            }
            Err(e) => log::error!("Failed to decode seed update: {e}"),
        }
        text
    }

    /// Rebuild a document from a [`snapshot`](Self::snapshot).
    ///
    /// The restored replica keeps the item ids of the saved state, so peers
    /// that already hold that history recognise it instead of duplicating it.
    pub fn from_snapshot(state: &[u8]) -> Result<Self, TextError> {
        let update = Update::decode_v1(state).map_err(|e| TextError::Decode(e.to_string()))?;
        let text = Self::new();
        text.doc
            .transact_mut()
            .apply_update(update)
            .map_err(|e| TextError::Apply(e.to_string()))?;
        Ok(text)
    }

    /// Replace the whole text with `new_text`, returning the encoded update
    /// to ship to peers. `None` when nothing changed.
    pub fn mutate_local(&mut self, new_text: &str, origin: Origin) -> Option<Vec<u8>> {
        let current = self.to_string();
        let splice = splice(&current, new_text)?;

        let update = {
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text(TEXT_ROOT);
            if splice.removed > 0 {
                text.remove_range(&mut txn, splice.start as u32, splice.removed as u32);
            }
            if !splice.inserted.is_empty() {
                text.insert(&mut txn, splice.start as u32, &splice.inserted);
            }
            txn.encode_update_v1()
        };

        self.notify(new_text.to_string(), origin);
        Some(update)
    }

    /// Integrate an update produced by another replica.
    ///
    /// Returns whether the visible text changed. Re-applying a known update
    /// is a no-op; an update whose dependencies are missing is held by the
    /// document until they arrive.
    pub fn apply_remote(&mut self, update: &[u8]) -> Result<bool, TextError> {
        let update = Update::decode_v1(update).map_err(|e| TextError::Decode(e.to_string()))?;
        let before = self.to_string();

        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| TextError::Apply(e.to_string()))?;
        }

        let after = self.to_string();
        if after == before {
            return Ok(false);
        }
        self.notify(after, Origin::Remote);
        Ok(true)
    }

    /// Integrate a batch of updates as one change.
    ///
    /// Every update is decoded before any is applied, so a batch containing
    /// a malformed update leaves the text untouched.
    pub fn apply_remote_all(&mut self, updates: &[Vec<u8>]) -> Result<bool, TextError> {
        let decoded = updates
            .iter()
            .map(|bytes| Update::decode_v1(bytes).map_err(|e| TextError::Decode(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        let before = self.to_string();

        {
            let mut txn = self.doc.transact_mut();
            for update in decoded {
                txn.apply_update(update)
                    .map_err(|e| TextError::Apply(e.to_string()))?;
            }
        }

        let after = self.to_string();
        if after == before {
            return Ok(false);
        }
        self.notify(after, Origin::Remote);
        Ok(true)
    }

    /// Full document state, suitable for `apply_remote` on any replica.
    pub fn snapshot(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Register a callback fired after every mutation, local or remote.
    pub fn observe<F>(&mut self, callback: F) -> ObserverId
    where
        F: FnMut(&ContentChange) + Send + 'static,
    {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push((id, Box::new(callback)));
        id
    }

    pub fn unobserve(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(observer, _)| *observer != id);
        self.observers.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.to_string().is_empty()
    }

    fn notify(&mut self, text: String, origin: Origin) {
        if self.observers.is_empty() {
            return;
        }
        let change = ContentChange::new(text, origin);
        for (_, observer) in &mut self.observers {
            observer(&change);
        }
    }
}

impl Default for ReplicatedText {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReplicatedText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let txn = self.doc.transact();
        match txn.get_text(TEXT_ROOT) {
            Some(text) => f.write_str(&text.get_string(&txn)),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ReplicatedText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedText")
            .field("text", &self.to_string())
            .field("observers", &self.observers.len())
            .finish()
    }
}
