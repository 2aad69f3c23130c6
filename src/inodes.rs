//! Bidirectional path `<->` inode bookkeeping. `fuser`'s kernel-facing ABI
//! is inode-indexed; this table is pure plumbing that lets the dispatcher
//! speak that protocol while everything else in this crate works in terms
//! of paths, as the distilled design describes.

use std::collections::HashMap;

use crate::listing::ItemKind;

pub const ROOT_INO: u64 = 1;

pub struct InodeTable {
    path_to_ino: HashMap<String, u64>,
    ino_to_path: HashMap<u64, String>,
    ino_to_kind: HashMap<u64, ItemKind>,
    next_ino: u64,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = InodeTable {
            path_to_ino: HashMap::new(),
            ino_to_path: HashMap::new(),
            ino_to_kind: HashMap::new(),
            next_ino: ROOT_INO + 1,
        };
        table.path_to_ino.insert("/".to_string(), ROOT_INO);
        table.ino_to_path.insert(ROOT_INO, "/".to_string());
        table.ino_to_kind.insert(ROOT_INO, ItemKind::Directory);
        table
    }

    pub fn path_of(&self, ino: u64) -> Option<String> {
        self.ino_to_path.get(&ino).cloned()
    }

    pub fn ino_for_path(&self, path: &str) -> Option<u64> {
        self.path_to_ino.get(path).copied()
    }

    /// Returns the existing inode for `path` if one was already resolved,
    /// otherwise assigns and records a fresh one. Inodes are never reused
    /// within a mount's lifetime once assigned.
    pub fn register(&mut self, path: String, kind: ItemKind) -> u64 {
        if let Some(&ino) = self.path_to_ino.get(&path) {
            self.ino_to_kind.insert(ino, kind);
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.path_to_ino.insert(path.clone(), ino);
        self.ino_to_path.insert(ino, path);
        self.ino_to_kind.insert(ino, kind);
        ino
    }

    /// Updates the existing inode's recorded path in place, rather than
    /// minting a new one, matching a successful `rename`.
    pub fn rename(&mut self, old_path: &str, new_path: String) {
        if let Some(ino) = self.path_to_ino.remove(old_path) {
            self.ino_to_path.insert(ino, new_path.clone());
            self.path_to_ino.insert(new_path, ino);
        }
    }

    pub fn forget_path(&mut self, path: &str) {
        if let Some(ino) = self.path_to_ino.remove(path) {
            self.ino_to_path.remove(&ino);
            self.ino_to_kind.remove(&ino);
        }
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_preregistered() {
        let table = InodeTable::new();
        assert_eq!(table.path_of(ROOT_INO).as_deref(), Some("/"));
        assert_eq!(table.ino_for_path("/"), Some(ROOT_INO));
    }

    #[test]
    fn register_is_idempotent_per_path() {
        let mut table = InodeTable::new();
        let a = table.register("/a".to_string(), ItemKind::File);
        let b = table.register("/a".to_string(), ItemKind::File);
        assert_eq!(a, b);
        assert_ne!(a, ROOT_INO);
    }

    #[test]
    fn rename_keeps_the_same_inode() {
        let mut table = InodeTable::new();
        let ino = table.register("/a".to_string(), ItemKind::File);
        table.rename("/a", "/b".to_string());
        assert_eq!(table.ino_for_path("/a"), None);
        assert_eq!(table.ino_for_path("/b"), Some(ino));
        assert_eq!(table.path_of(ino).as_deref(), Some("/b"));
    }

    #[test]
    fn forget_path_drops_all_maps() {
        let mut table = InodeTable::new();
        let ino = table.register("/a".to_string(), ItemKind::File);
        table.forget_path("/a");
        assert_eq!(table.ino_for_path("/a"), None);
        assert_eq!(table.path_of(ino), None);
    }
}
