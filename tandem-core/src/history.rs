//! Local linear undo/redo history.
//!
//! History is kept as whole-text snapshots independent of the replicated
//! document. Keystrokes update `present` immediately; committing the pre-edit
//! snapshot onto `past` waits for a pause in typing (batch + debounce window),
//! so a burst of typing becomes a single undo step.
//!
//! Only [`Origin::Local`] changes are ever recorded. Remote merges replace
//! `present` directly and undo/redo output is tagged
//! [`Origin::HistoryReplay`], so the stacks only ever walk the local user's
//! own edits.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::change::{ContentChange, Origin};
use crate::debounce::Debouncer;
use crate::text::splice;

/// History configuration.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Maximum entries kept in each of `past` and `future`
    pub capacity: usize,
    /// Window grouping rapid keystrokes
    pub batch: Duration,
    /// Pause required before a batch is committed
    pub debounce: Duration,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            batch: Duration::from_millis(50),
            debounce: Duration::from_millis(300),
        }
    }
}

/// Snapshot stacks. `past` is oldest-first, `future` is nearest-first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryState {
    pub past: VecDeque<String>,
    pub present: String,
    pub future: VecDeque<String>,
}

#[derive(Debug)]
pub struct History {
    state: HistoryState,
    /// Text as of the last commit; what `past` receives on the next one.
    last_saved: String,
    /// Set while a local edit waits for its commit.
    pending: bool,
    timer: Debouncer,
    capacity: usize,
}

impl History {
    pub fn new(initial: impl Into<String>, config: HistoryConfig) -> Self {
        let initial = initial.into();
        Self {
            state: HistoryState {
                present: initial.clone(),
                ..HistoryState::default()
            },
            last_saved: initial,
            pending: false,
            timer: Debouncer::new(config.batch, config.debounce),
            capacity: config.capacity.max(1),
        }
    }

    pub fn content(&self) -> &str {
        &self.state.present
    }

    pub fn state(&self) -> &HistoryState {
        &self.state
    }

    pub fn can_undo(&self) -> bool {
        !self.state.past.is_empty() || self.has_pending_edit()
    }

    pub fn can_redo(&self) -> bool {
        !self.state.future.is_empty()
    }

    pub fn has_pending_edit(&self) -> bool {
        self.pending && self.state.present != self.last_saved
    }

    /// Deadline of the pending commit, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    /// Record a new value for the editor buffer.
    pub fn set_content(&mut self, text: impl Into<String>, origin: Origin, now: Instant) {
        let previous = std::mem::replace(&mut self.state.present, text.into());

        match origin {
            Origin::Local => {
                self.pending = true;
                self.timer.touch(now);
            }
            Origin::Remote => {
                // Fold collaborator edits into the baseline so the next local
                // commit does not capture them as part of an undo step.
                if !self.pending {
                    self.last_saved = self.state.present.clone();
                } else if let Some(rebased) =
                    rebase_remote(&self.last_saved, &previous, &self.state.present)
                {
                    self.last_saved = rebased;
                } else {
                    log::trace!("remote edit overlaps the pending local edit");
                }
            }
            Origin::HistoryReplay => {
                self.last_saved = self.state.present.clone();
            }
        }
    }

    /// Commit the pending edit if its window elapsed. Returns whether an
    /// entry was pushed.
    pub fn poll(&mut self, now: Instant) -> bool {
        if self.timer.fire_if_due(now) {
            return self.commit();
        }
        false
    }

    /// Commit the pending edit immediately.
    pub fn flush(&mut self) -> bool {
        self.timer.cancel();
        self.commit()
    }

    /// Step back one entry. Returns the restored text tagged
    /// [`Origin::HistoryReplay`], or `None` if there is nothing to undo.
    pub fn undo(&mut self) -> Option<ContentChange> {
        self.flush();

        let previous = self.state.past.pop_back()?;
        let current = std::mem::replace(&mut self.state.present, previous);
        self.state.future.push_front(current);
        self.state.future.truncate(self.capacity);
        self.last_saved = self.state.present.clone();

        log::trace!(
            "undo: {} past, {} future",
            self.state.past.len(),
            self.state.future.len()
        );
        Some(ContentChange::new(
            self.state.present.clone(),
            Origin::HistoryReplay,
        ))
    }

    /// Step forward one entry. A pending edit is committed first, which
    /// clears `future`, so redo after fresh typing is a no-op.
    pub fn redo(&mut self) -> Option<ContentChange> {
        self.flush();

        let next = self.state.future.pop_front()?;
        let current = std::mem::replace(&mut self.state.present, next);
        self.push_past(current);
        self.last_saved = self.state.present.clone();

        log::trace!(
            "redo: {} past, {} future",
            self.state.past.len(),
            self.state.future.len()
        );
        Some(ContentChange::new(
            self.state.present.clone(),
            Origin::HistoryReplay,
        ))
    }

    pub fn clear(&mut self) {
        self.timer.cancel();
        self.pending = false;
        self.state.past.clear();
        self.state.future.clear();
        self.last_saved = self.state.present.clone();
    }

    fn commit(&mut self) -> bool {
        if !std::mem::take(&mut self.pending) {
            return false;
        }
        if self.state.present == self.last_saved {
            return false;
        }

        let saved = std::mem::replace(&mut self.last_saved, self.state.present.clone());
        self.push_past(saved);
        self.state.future.clear();
        true
    }

    fn push_past(&mut self, entry: String) {
        self.state.past.push_back(entry);
        while self.state.past.len() > self.capacity {
            self.state.past.pop_front();
        }
    }
}

/// Replay the remote change `before -> after` onto `base`, where `before` is
/// `base` plus one pending local splice. `None` when the two splices overlap.
fn rebase_remote(base: &str, before: &str, after: &str) -> Option<String> {
    let Some(remote) = splice(before, after) else {
        return Some(base.to_string());
    };
    let start = match splice(base, before) {
        None => remote.start,
        Some(local) if remote.start + remote.removed <= local.start => remote.start,
        Some(local) if remote.start >= local.start + local.inserted.len() => {
            remote.start - local.inserted.len() + local.removed
        }
        Some(_) => return None,
    };

    let end = start + remote.removed;
    base.get(start..end)?;
    let mut rebased = base.to_string();
    rebased.replace_range(start..end, &remote.inserted);
    Some(rebased)
}
