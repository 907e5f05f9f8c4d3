//! # tandem-core: Editing primitives for collaborative text
//!
//! Runtime-free building blocks shared by every peer:
//!
//! - [`text`]: convergent text buffer over a yrs document
//! - [`history`]: local undo/redo stacks with debounced commits
//! - [`debounce`]: cancel-and-reschedule timer driven by explicit instants
//! - [`change`]: origin tags carried by every content change
//! - [`keymap`]: focus-gated undo/redo shortcuts
//!
//! ```text
//! keystroke ──► History::set_content ──► ReplicatedText::mutate_local ──► update bytes
//!                                                                             │
//! remote bytes ──► ReplicatedText::apply_remote ──► History::set_content(Remote)
//! ```

pub mod change;
pub mod debounce;
pub mod history;
pub mod keymap;
pub mod text;

pub use change::{ContentChange, Origin};
pub use debounce::Debouncer;
pub use history::{History, HistoryConfig, HistoryState};
pub use keymap::{history_command, Focus, HistoryCommand, KeyChord};
pub use text::{ReplicatedText, TextError};
