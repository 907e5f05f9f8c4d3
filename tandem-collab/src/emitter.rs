//! Debounced outbound change emitter.
//!
//! Local edits are not broadcast per keystroke. Each change resets a short
//! quiet window; when it elapses the deltas accumulated so far go out as one
//! `Update` stamped with the next sequence id. Only local changes are ever
//! fed in here, which is what keeps received updates from echoing.

use std::time::{Duration, Instant};

use tandem_core::Debouncer;

use crate::protocol::SyncMessage;

pub struct ChangeEmitter {
    timer: Debouncer,
    deltas: Vec<Vec<u8>>,
    latest: String,
    next_sequence: u64,
}

impl ChangeEmitter {
    pub fn new(window: Duration) -> Self {
        Self {
            timer: Debouncer::quiet(window),
            deltas: Vec::new(),
            latest: String::new(),
            next_sequence: 1,
        }
    }

    /// Queue a local change. `delta` is the CRDT update it produced.
    pub fn notify_local_change(&mut self, text: &str, delta: Vec<u8>, now: Instant) {
        self.latest.clear();
        self.latest.push_str(text);
        self.deltas.push(delta);
        self.timer.touch(now);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    pub fn has_pending(&self) -> bool {
        !self.deltas.is_empty()
    }

    /// Emit the coalesced update once the quiet window has passed.
    pub fn poll(&mut self, now: Instant) -> Option<SyncMessage> {
        if self.timer.fire_if_due(now) {
            return self.take();
        }
        None
    }

    /// Emit whatever is queued right away.
    pub fn flush(&mut self) -> Option<SyncMessage> {
        self.timer.cancel();
        self.take()
    }

    /// Drop queued changes without emitting them.
    pub fn discard(&mut self) {
        self.timer.cancel();
        self.deltas.clear();
    }

    /// Sequence id the next emitted update will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    fn take(&mut self) -> Option<SyncMessage> {
        if self.deltas.is_empty() {
            return None;
        }
        let sequence_id = self.next_sequence;
        self.next_sequence += 1;
        let deltas = std::mem::take(&mut self.deltas);
        log::trace!("emitting update #{sequence_id} with {} deltas", deltas.len());
        Some(SyncMessage::update(sequence_id, self.latest.clone(), deltas))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_burst_coalesces_into_one_update() {
        let t0 = Instant::now();
        let mut emitter = ChangeEmitter::new(ms(150));
        let mut text = String::new();
        for (i, ch) in "hello".chars().enumerate() {
            text.push(ch);
            let now = t0 + ms(i as u64 * 30);
            emitter.notify_local_change(&text, vec![i as u8], now);
            assert!(emitter.poll(now).is_none());
        }

        let msg = emitter.poll(t0 + ms(400)).unwrap();
        assert_eq!(msg.kind, MessageKind::Update);
        assert_eq!(msg.content.as_deref(), Some("hello"));
        assert_eq!(msg.updates.len(), 5);
        assert_eq!(msg.sequence_id, Some(1));
        assert!(emitter.poll(t0 + ms(800)).is_none());
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let t0 = Instant::now();
        let mut emitter = ChangeEmitter::new(ms(150));

        emitter.notify_local_change("a", vec![1], t0);
        let first = emitter.flush().unwrap();
        emitter.notify_local_change("ab", vec![2], t0);
        let second = emitter.flush().unwrap();

        assert_eq!(first.sequence_id, Some(1));
        assert_eq!(second.sequence_id, Some(2));
        assert_eq!(emitter.next_sequence(), 3);
    }

    #[test]
    fn test_flush_when_idle_is_none() {
        let mut emitter = ChangeEmitter::new(ms(150));
        assert!(emitter.flush().is_none());
        assert_eq!(emitter.next_sequence(), 1);
    }

    #[test]
    fn test_discard() {
        let t0 = Instant::now();
        let mut emitter = ChangeEmitter::new(ms(150));
        emitter.notify_local_change("a", vec![1], t0);
        emitter.discard();

        assert!(!emitter.has_pending());
        assert!(emitter.deadline().is_none());
        assert!(emitter.poll(t0 + ms(1000)).is_none());
    }
}
