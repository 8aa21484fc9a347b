// SPDX-License-Identifier: MIT OR Apache-2.0
//! Undo/redo history built from document snapshots.
//!
//! Every recorded mutation stores the serialized document before and after
//! it. Undo restores the `before` snapshot of the newest operation, redo the
//! `after` snapshot of the operation undone last.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Default maximum undo history depth
pub const MAX_HISTORY: usize = 100;

/// History errors
#[derive(Debug, Error)]
pub enum HistoryError {
    /// Nothing to undo
    #[error("Nothing to undo")]
    NothingToUndo,

    /// Nothing to redo
    #[error("Nothing to redo")]
    NothingToRedo,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for history operations
pub type Result<T> = std::result::Result<T, HistoryError>;

/// Unique operation ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationID(u64);

impl OperationID {
    /// Get the raw ID value
    pub fn value(&self) -> u64 {
        self.0
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Serialized document state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Serialized document (JSON)
    pub data: Vec<u8>,
    /// Timestamp when snapshot was taken
    pub timestamp: u64,
    /// Size in bytes
    pub size: usize,
}

impl StateSnapshot {
    /// Create a new state snapshot
    pub fn new(data: Vec<u8>) -> Self {
        let size = data.len();
        Self {
            data,
            timestamp: now(),
            size,
        }
    }

    /// Create from serializable value
    pub fn from_value<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    /// Deserialize to value
    pub fn to_value<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

/// A recorded mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Unique operation ID
    pub id: OperationID,
    /// Name of the mutation, e.g. `connect`
    pub description: String,
    /// State before the mutation (for undo)
    pub before: StateSnapshot,
    /// State after the mutation (for redo)
    pub after: StateSnapshot,
    /// Timestamp
    pub timestamp: u64,
}

impl Operation {
    /// Create a new operation
    pub fn new(id: OperationID, description: String, before: StateSnapshot, after: StateSnapshot) -> Self {
        Self {
            id,
            description,
            before,
            after,
            timestamp: now(),
        }
    }

    /// Get memory size of this operation
    pub fn memory_size(&self) -> usize {
        self.before.size + self.after.size
    }
}

/// History statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryStats {
    /// Operations in the undo stack
    pub undo_count: usize,
    /// Operations in the redo stack
    pub redo_count: usize,
    /// Total memory used by history (bytes)
    pub memory_used: usize,
    /// Maximum history depth
    pub max_depth: usize,
}

/// Undo/redo history manager
#[derive(Debug)]
pub struct History {
    undo_stack: VecDeque<Operation>,
    redo_stack: VecDeque<Operation>,
    next_id: u64,
    max_depth: usize,
    memory_used: usize,
}

impl History {
    /// Create a new history manager
    pub fn new() -> Self {
        Self::with_max_depth(MAX_HISTORY)
    }

    /// Create with custom maximum depth
    pub fn with_max_depth(max_depth: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            next_id: 1,
            max_depth,
            memory_used: 0,
        }
    }

    /// Record a committed mutation. Clears the redo stack.
    pub fn record(&mut self, description: &str, before: StateSnapshot, after: StateSnapshot) -> OperationID {
        let id = OperationID(self.next_id);
        self.next_id += 1;
        let operation = Operation::new(id, description.to_string(), before, after);

        self.redo_stack.clear();
        self.memory_used += operation.memory_size();
        self.undo_stack.push_back(operation);

        while self.undo_stack.len() > self.max_depth {
            if let Some(oldest) = self.undo_stack.pop_front() {
                self.memory_used = self.memory_used.saturating_sub(oldest.memory_size());
            }
        }
        id
    }

    /// Undo the last operation
    pub fn undo(&mut self) -> Result<Operation> {
        let operation = self.undo_stack.pop_back().ok_or(HistoryError::NothingToUndo)?;

        self.memory_used = self.memory_used.saturating_sub(operation.memory_size());
        self.redo_stack.push_back(operation.clone());

        Ok(operation)
    }

    /// Redo the last undone operation
    pub fn redo(&mut self) -> Result<Operation> {
        let operation = self.redo_stack.pop_back().ok_or(HistoryError::NothingToRedo)?;

        self.memory_used += operation.memory_size();
        self.undo_stack.push_back(operation.clone());

        Ok(operation)
    }

    /// Put back an operation taken by [`History::undo`] whose restore failed
    pub(crate) fn revert_undo(&mut self) {
        if let Some(operation) = self.redo_stack.pop_back() {
            self.memory_used += operation.memory_size();
            self.undo_stack.push_back(operation);
        }
    }

    /// Put back an operation taken by [`History::redo`] whose restore failed
    pub(crate) fn revert_redo(&mut self) {
        if let Some(operation) = self.undo_stack.pop_back() {
            self.memory_used = self.memory_used.saturating_sub(operation.memory_size());
            self.redo_stack.push_back(operation);
        }
    }

    /// Check if undo is available
    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    /// Check if redo is available
    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    /// Get undo stack depth
    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    /// Get redo stack depth
    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    /// Clear all history
    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.memory_used = 0;
    }

    /// Get history statistics
    pub fn stats(&self) -> HistoryStats {
        HistoryStats {
            undo_count: self.undo_stack.len(),
            redo_count: self.redo_stack.len(),
            memory_used: self.memory_used,
            max_depth: self.max_depth,
        }
    }

    /// Get description of next undo operation
    pub fn undo_description(&self) -> Option<&str> {
        self.undo_stack.back().map(|op| op.description.as_str())
    }

    /// Get description of next redo operation
    pub fn redo_description(&self) -> Option<&str> {
        self.redo_stack.back().map(|op| op.description.as_str())
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(n: u32) -> StateSnapshot {
        StateSnapshot::from_value(&n).unwrap()
    }

    #[test]
    fn test_undo_redo_cycle() {
        let mut history = History::new();
        history.record("connect", snapshot(0), snapshot(1));

        let operation = history.undo().unwrap();
        assert_eq!(operation.before.to_value::<u32>().unwrap(), 0);
        assert!(history.can_redo());

        let operation = history.redo().unwrap();
        assert_eq!(operation.after.to_value::<u32>().unwrap(), 1);
        assert_eq!(history.undo_description(), Some("connect"));
    }

    #[test]
    fn test_empty_stacks() {
        let mut history = History::new();
        assert!(matches!(history.undo(), Err(HistoryError::NothingToUndo)));
        assert!(matches!(history.redo(), Err(HistoryError::NothingToRedo)));
    }

    #[test]
    fn test_new_record_clears_redo() {
        let mut history = History::new();
        let first = history.record("a", snapshot(0), snapshot(1));
        history.undo().unwrap();
        let second = history.record("b", snapshot(0), snapshot(2));
        assert!(!history.can_redo());
        assert!(second.value() > first.value());
    }

    #[test]
    fn test_depth_limit() {
        let mut history = History::with_max_depth(2);
        for n in 0..5 {
            history.record("step", snapshot(n), snapshot(n + 1));
        }
        assert_eq!(history.undo_depth(), 2);
        let stats = history.stats();
        assert_eq!(stats.max_depth, 2);
        assert!(stats.memory_used > 0);
    }

    #[test]
    fn test_revert_failed_undo() {
        let mut history = History::new();
        history.record("a", snapshot(0), snapshot(1));
        history.undo().unwrap();
        history.revert_undo();
        assert_eq!(history.undo_depth(), 1);
        assert_eq!(history.redo_depth(), 0);
    }
}
