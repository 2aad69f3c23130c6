//! The bounded table of open-file handles. Each handle owns a staging file
//! in the process staging directory and a mutex distinct from the table's
//! own, so concurrent I/O on different handles never contends.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

pub const MAX_HANDLES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenIntent {
    Read,
    Write,
    CreateWrite,
    Truncate,
}

#[derive(Default)]
struct HandleState {
    dirty: bool,
    is_new: bool,
}

pub struct Handle {
    pub path: String,
    pub intent: OpenIntent,
    pub temp_path: PathBuf,
    state: Mutex<HandleState>,
}

impl Handle {
    pub fn is_dirty(&self) -> bool {
        self.state.lock().unwrap().dirty
    }

    pub fn is_new(&self) -> bool {
        self.state.lock().unwrap().is_new
    }

    pub fn mark_dirty(&self) {
        self.state.lock().unwrap().dirty = true;
    }

    pub fn mark_new(&self) {
        self.state.lock().unwrap().is_new = true;
    }

    /// Serializes reads/writes against this handle's staging file. Held for
    /// the duration of `f`, independent of the handle table's own lock.
    pub fn with_io_lock<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.state.lock().unwrap();
        f()
    }
}

pub struct HandleTable {
    slots: Vec<Option<Arc<Handle>>>,
    staging_dir: PathBuf,
}

impl HandleTable {
    pub fn new(staging_dir: PathBuf) -> Self {
        HandleTable {
            slots: (0..MAX_HANDLES).map(|_| None).collect(),
            staging_dir,
        }
    }

    /// Scans for the first free slot, stores a fresh handle there, and
    /// returns the externally visible file descriptor plus a shared handle
    /// to it. `None` means the table is full.
    ///
    /// The returned fd is the slot index offset by one: `fh == 0` is reserved
    /// as the "no handle" sentinel callers check against, so a live handle
    /// must never be numbered 0 (the first allocation would otherwise land
    /// in slot 0 and be indistinguishable from "no handle" on `read`/`release`).
    pub fn allocate(&mut self, path: String, intent: OpenIntent) -> Option<(u64, Arc<Handle>)> {
        let index = self.slots.iter().position(|slot| slot.is_none())?;
        let temp_path = self
            .staging_dir
            .join(format!("h{}_{}_{}", std::process::id(), now_nanos(), index));
        let handle = Arc::new(Handle {
            path,
            intent,
            temp_path,
            state: Mutex::new(HandleState::default()),
        });
        self.slots[index] = Some(handle.clone());
        Some((index as u64 + 1, handle))
    }

    pub fn get(&self, fh: u64) -> Option<Arc<Handle>> {
        let index = fh.checked_sub(1)?;
        self.slots.get(index as usize)?.clone()
    }

    /// Vacates the slot and returns the handle that was there, if any. An
    /// out-of-range, zero, or already-vacant fd is a no-op, returning `None`.
    pub fn release(&mut self, fh: u64) -> Option<Arc<Handle>> {
        let index = fh.checked_sub(1)?;
        self.slots.get_mut(index as usize)?.take()
    }
}

fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_allocation_never_returns_the_zero_sentinel() {
        let mut table = HandleTable::new(PathBuf::from("/tmp"));
        let (fh, _) = table.allocate("/a".to_string(), OpenIntent::Write).unwrap();
        assert_ne!(fh, 0);
    }

    #[test]
    fn allocate_then_release_frees_the_slot() {
        let mut table = HandleTable::new(PathBuf::from("/tmp"));
        let (fh, handle) = table.allocate("/a".to_string(), OpenIntent::Write).unwrap();
        assert!(table.get(fh).is_some());
        assert_eq!(handle.path, "/a");
        let released = table.release(fh);
        assert!(released.is_some());
        assert!(table.get(fh).is_none());
    }

    #[test]
    fn released_slot_is_reused() {
        let mut table = HandleTable::new(PathBuf::from("/tmp"));
        let (fh1, _) = table.allocate("/a".to_string(), OpenIntent::Write).unwrap();
        table.release(fh1);
        let (fh2, _) = table.allocate("/b".to_string(), OpenIntent::Write).unwrap();
        assert_eq!(fh1, fh2);
    }

    #[test]
    fn release_on_vacant_or_out_of_range_index_is_a_no_op() {
        let mut table = HandleTable::new(PathBuf::from("/tmp"));
        assert!(table.release(0).is_none());
        assert!(table.release(MAX_HANDLES as u64 + 5).is_none());
    }

    #[test]
    fn exhausting_the_table_returns_none() {
        let mut table = HandleTable::new(PathBuf::from("/tmp"));
        for _ in 0..MAX_HANDLES {
            table.allocate("/x".to_string(), OpenIntent::Write).unwrap();
        }
        assert!(table.allocate("/overflow".to_string(), OpenIntent::Write).is_none());
    }

    #[test]
    fn staging_paths_are_unique_per_handle() {
        let mut table = HandleTable::new(PathBuf::from("/tmp"));
        let (_, a) = table.allocate("/a".to_string(), OpenIntent::Write).unwrap();
        let (_, b) = table.allocate("/b".to_string(), OpenIntent::Write).unwrap();
        assert_ne!(a.temp_path, b.temp_path);
    }
}
