//! Undo/redo keyboard shortcuts.
//!
//! Shortcuts are only honoured while focus is on the text-editing surface.
//! A matched chord must be consumed by the caller before any native handler
//! sees it, otherwise the platform's own undo races the history manager.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryCommand {
    Undo,
    Redo,
}

/// Where keyboard focus currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Focus {
    Editor,
    Elsewhere,
}

/// A key press with its modifier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyChord {
    pub key: char,
    pub ctrl: bool,
    pub meta: bool,
    pub shift: bool,
}

impl KeyChord {
    pub fn new(key: char) -> Self {
        Self {
            key,
            ctrl: false,
            meta: false,
            shift: false,
        }
    }

    pub fn ctrl(mut self) -> Self {
        self.ctrl = true;
        self
    }

    pub fn meta(mut self) -> Self {
        self.meta = true;
        self
    }

    pub fn shift(mut self) -> Self {
        self.shift = true;
        self
    }
}

/// Map a chord to a history command.
///
/// Ctrl/Cmd+Z undoes; Ctrl/Cmd+Y and Ctrl/Cmd+Shift+Z redo.
pub fn history_command(chord: KeyChord, focus: Focus) -> Option<HistoryCommand> {
    if focus != Focus::Editor || !(chord.ctrl || chord.meta) {
        return None;
    }

    match chord.key.to_ascii_lowercase() {
        'z' if chord.shift => Some(HistoryCommand::Redo),
        'z' => Some(HistoryCommand::Undo),
        'y' => Some(HistoryCommand::Redo),
        _ => None,
    }
}
