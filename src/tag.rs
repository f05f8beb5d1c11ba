//! Transaction tag allocation and validation.

use std::collections::HashSet;
use std::sync::Mutex;

use log::debug;

use crate::error::{Error, Result};
use crate::protocol::NO_TAG;

/// Tags wrap back to 1 after this value. `NO_TAG` is never handed out.
pub const TAG_CEILING: u16 = NO_TAG - 1;

struct TagState {
    next: u16,
    in_flight: HashSet<u16>,
    high_water: Option<u16>,
}

/// Tracks the tags outstanding on one side of a connection.
///
/// Clients use [`TagManager::allocate`]; servers use [`TagManager::claim`]
/// on every incoming request so a tag that is still in flight is refused.
pub struct TagManager {
    state: Mutex<TagState>,
}

impl TagManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TagState {
                next: 1,
                in_flight: HashSet::new(),
                high_water: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TagState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Hand out the next ascending tag that is not in flight.
    pub fn allocate(&self) -> Result<u16> {
        let mut state = self.lock();
        for _ in 0..TAG_CEILING {
            let tag = state.next;
            state.next = if tag >= TAG_CEILING { 1 } else { tag + 1 };
            if state.in_flight.insert(tag) {
                return Ok(tag);
            }
        }
        Err(Error::TagsExhausted)
    }

    /// Register a peer-chosen tag, refusing one that is still outstanding.
    pub fn claim(&self, tag: u16) -> Result<()> {
        let mut state = self.lock();
        if !state.in_flight.insert(tag) {
            return Err(Error::DuplicateTag(tag));
        }
        match state.high_water {
            Some(high) if tag < high => debug!("tag {} below high-water {}", tag, high),
            _ => state.high_water = Some(tag),
        }
        Ok(())
    }

    /// Retire a tag once its last response has been produced.
    pub fn release(&self, tag: u16) -> bool {
        self.lock().in_flight.remove(&tag)
    }

    pub fn is_outstanding(&self, tag: u16) -> bool {
        self.lock().in_flight.contains(&tag)
    }

    /// Highest tag claimed so far on this connection.
    pub fn high_water(&self) -> Option<u16> {
        self.lock().high_water
    }

    pub fn outstanding(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Forget every outstanding tag, as a version exchange does.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.in_flight.clear();
        state.high_water = None;
    }
}

impl Default for TagManager {
    fn default() -> Self {
        Self::new()
    }
}
