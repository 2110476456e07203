//! Per-task file descriptor table: a fixed-size slot table mapping small
//! integers to open files, sized from `kernel::config::MAX_FDS_PER_TASK`.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::config::MAX_FDS_PER_TASK;
use crate::error::{KError, KResult};
use crate::fs::file::{self, OpenFile};

pub struct FdTable {
    slots: Vec<Option<Arc<Mutex<OpenFile>>>>,
}

impl FdTable {
    pub fn new() -> FdTable {
        FdTable {
            slots: vec![None; MAX_FDS_PER_TASK],
        }
    }

    /// Installs `file` at the smallest free integer.
    pub fn install(&mut self, file: Arc<Mutex<OpenFile>>) -> KResult<i32> {
        let slot = self.slots.iter().position(|s| s.is_none()).ok_or(KError::NoFd)?;
        self.slots[slot] = Some(file);
        Ok(slot as i32)
    }

    pub fn get(&self, fd: i32) -> Option<Arc<Mutex<OpenFile>>> {
        if fd < 0 {
            return None;
        }
        self.slots.get(fd as usize).and_then(|s| s.clone())
    }

    pub fn close(&mut self, fd: i32) -> KResult<()> {
        if fd < 0 {
            return Err(KError::InvalidArgument);
        }
        let slot = self.slots.get_mut(fd as usize).ok_or(KError::InvalidArgument)?;
        let f = slot.take().ok_or(KError::InvalidArgument)?;
        file::close(f);
        Ok(())
    }

    pub fn close_all(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(f) = slot.take() {
                file::close(f);
            }
        }
    }

    /// Duplicates every open entry for `fork`: each survives with its own
    /// ref count bumped, sharing the same `OpenFile` (and so the same
    /// `f_pos`) between parent and child, matching POSIX fork semantics.
    pub fn dup_all(&self) -> FdTable {
        let slots = self
            .slots
            .iter()
            .map(|s| {
                s.as_ref().map(|f| {
                    f.lock().ref_count += 1;
                    f.clone()
                })
            })
            .collect();
        FdTable { slots }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_on_empty_slot_errors() {
        let mut table = FdTable::new();
        assert!(table.close(0).is_err());
    }

    #[test]
    fn get_out_of_range_is_none() {
        let table = FdTable::new();
        assert!(table.get(9999).is_none());
        assert!(table.get(-1).is_none());
    }
}
