//! Per-session descriptor table.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::protocol::NO_FID;

struct Table<T> {
    bindings: HashMap<u32, T>,
    reserved: HashSet<u32>,
    next: u32,
}

/// Map from session-scoped handles to whatever the owner binds them to.
///
/// The server binds client-chosen handles to resource handlers; the client
/// generates its own handles and binds them to the QIDs it learned.
pub struct DescriptorManager<T> {
    table: Mutex<Table<T>>,
}

impl<T: Clone> DescriptorManager<T> {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Table whose generated handles begin at `first`.
    pub fn starting_at(first: u32) -> Self {
        Self {
            table: Mutex::new(Table {
                bindings: HashMap::new(),
                reserved: HashSet::new(),
                next: first,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Table<T>> {
        match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Return a fresh handle that is neither bound nor reserved.
    pub fn generate_descriptor(&self) -> Result<u32> {
        let mut table = self.lock();
        for _ in 0..=u32::MAX as u64 {
            let candidate = table.next;
            table.next = table.next.wrapping_add(1);
            if candidate == NO_FID
                || table.bindings.contains_key(&candidate)
                || table.reserved.contains(&candidate)
            {
                continue;
            }
            table.reserved.insert(candidate);
            return Ok(candidate);
        }
        Err(Error::DescriptorInUse(NO_FID))
    }

    /// Bind `fid`; fails if it is already bound.
    pub fn map_qid(&self, fid: u32, value: T) -> Result<()> {
        if fid == NO_FID {
            return Err(Error::InvalidDescriptor(fid));
        }
        let mut table = self.lock();
        if table.bindings.contains_key(&fid) {
            return Err(Error::DescriptorInUse(fid));
        }
        table.reserved.remove(&fid);
        table.bindings.insert(fid, value);
        Ok(())
    }

    /// Replace the binding of an already bound handle.
    pub fn rebind(&self, fid: u32, value: T) -> Result<()> {
        let mut table = self.lock();
        match table.bindings.get_mut(&fid) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Error::InvalidDescriptor(fid)),
        }
    }

    pub fn valid_descriptor(&self, fid: u32) -> bool {
        self.lock().bindings.contains_key(&fid)
    }

    pub fn get_resource(&self, fid: u32) -> Result<T> {
        self.lock()
            .bindings
            .get(&fid)
            .cloned()
            .ok_or(Error::InvalidDescriptor(fid))
    }

    /// Release a binding (or a reservation that was never bound).
    pub fn remove(&self, fid: u32) -> Option<T> {
        let mut table = self.lock();
        table.reserved.remove(&fid);
        table.bindings.remove(&fid)
    }

    /// Drop every binding, returning them.
    pub fn clear(&self) -> Vec<(u32, T)> {
        let mut table = self.lock();
        table.reserved.clear();
        table.bindings.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Default for DescriptorManager<T> {
    fn default() -> Self {
        Self::new()
    }
}
