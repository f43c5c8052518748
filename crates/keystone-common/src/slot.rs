//! Single-assignment slot
//!
//! Holds at most one value until it is consumed. Pushing into an occupied
//! slot and popping from an empty one are both errors, which makes the
//! "at most one in-flight bootstrap" rule checkable on its own.

use std::fmt;
use std::sync::Mutex;

use thiserror::Error;

/// Slot operation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotError {
    /// A value is already pending
    #[error("{slot} slot already holds a pending value")]
    Occupied {
        /// Slot name for diagnostics
        slot: &'static str,
    },

    /// Nothing to consume
    #[error("{slot} slot is empty")]
    Empty {
        /// Slot name for diagnostics
        slot: &'static str,
    },
}

/// A named cell that holds at most one value until popped
pub struct SingleSlot<T> {
    name: &'static str,
    value: Mutex<Option<T>>,
}

impl<T> SingleSlot<T> {
    /// Create an empty slot
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            value: Mutex::new(None),
        }
    }

    /// Slot name used in errors and logs
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Store a value; fails if one is already pending
    pub fn push(&self, value: T) -> Result<(), SlotError> {
        let mut guard = self.value.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return Err(SlotError::Occupied { slot: self.name });
        }
        *guard = Some(value);
        Ok(())
    }

    /// Take the pending value; fails if there is none
    pub fn pop(&self) -> Result<T, SlotError> {
        self.value
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(SlotError::Empty { slot: self.name })
    }

    /// Drop any pending value. Returns whether something was discarded.
    pub fn clear(&self) -> bool {
        self.value
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some()
    }

    /// Whether a value is pending
    pub fn is_occupied(&self) -> bool {
        self.value
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

impl<T> fmt::Debug for SingleSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleSlot")
            .field("name", &self.name)
            .field("occupied", &self.is_occupied())
            .finish()
    }
}
