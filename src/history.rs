//! Undo/redo history for annotation edits.
//!
//! Each undoable change is a [`Command`] holding enough state to reverse
//! itself. The stack is bounded: pushing past `max_history` silently drops
//! the oldest command.

use std::collections::VecDeque;

use crate::model::Annotation;

/// A reversible change to an annotation store.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// An annotation was added
    Add { annotation: Annotation },
    /// An annotation was removed (stored for undo)
    Remove { annotation: Annotation },
    /// An annotation's shape or class changed
    Modify { before: Annotation, after: Annotation },
}

impl Command {
    /// Get a human-readable description of this command
    pub fn description(&self) -> String {
        match self {
            Command::Add { annotation } => format!("Add {}", annotation.shape.kind_name()),
            Command::Remove { annotation } => format!("Delete {}", annotation.shape.kind_name()),
            Command::Modify { before, after } if before.class_id != after.class_id => {
                "Change class".to_string()
            }
            Command::Modify { after, .. } => format!("Edit {}", after.shape.kind_name()),
        }
    }
}

/// Bounded undo/redo stacks.
///
/// New commands go on the undo stack and clear the redo stack. Undo moves
/// the newest command to the redo stack and back again on redo.
#[derive(Debug, Clone)]
pub struct UndoStack {
    undo_stack: VecDeque<Command>,
    redo_stack: Vec<Command>,
    max_history: usize,
}

impl Default for UndoStack {
    fn default() -> Self {
        Self::new(crate::constants::DEFAULT_UNDO_HISTORY)
    }
}

impl UndoStack {
    pub fn new(max_history: usize) -> Self {
        Self {
            undo_stack: VecDeque::with_capacity(max_history.min(256)),
            redo_stack: Vec::new(),
            max_history,
        }
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    /// Change the bound, dropping the oldest commands if needed.
    pub fn set_max_history(&mut self, max_history: usize) {
        self.max_history = max_history;
        self.enforce_bound();
    }

    /// Record a new command. Clears the redo stack.
    pub fn push(&mut self, command: Command) {
        log::debug!("📝 Undo: pushed '{}'", command.description());
        self.undo_stack.push_back(command);
        self.redo_stack.clear();
        self.enforce_bound();
    }

    fn enforce_bound(&mut self) {
        while self.undo_stack.len() > self.max_history {
            if let Some(dropped) = self.undo_stack.pop_front() {
                log::trace!("Undo history full, dropped '{}'", dropped.description());
            }
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo_stack.len()
    }

    /// Take the newest command for undoing; it moves to the redo stack.
    pub fn pop_undo(&mut self) -> Option<Command> {
        let cmd = self.undo_stack.pop_back()?;
        log::debug!("⏪ Undo: '{}'", cmd.description());
        self.redo_stack.push(cmd.clone());
        Some(cmd)
    }

    /// Take the newest undone command for redoing; it moves back to the
    /// undo stack.
    pub fn pop_redo(&mut self) -> Option<Command> {
        let cmd = self.redo_stack.pop()?;
        log::debug!("⏩ Redo: '{}'", cmd.description());
        self.undo_stack.push_back(cmd.clone());
        self.enforce_bound();
        Some(cmd)
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        log::debug!("🗑️ Undo history cleared");
    }
}
