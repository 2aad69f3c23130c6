//! Time-bounded directory-listing cache: path -> parsed items, invalidated
//! by whole path-component prefix rather than a raw byte-wise prefix (see
//! the design notes on the `/a` vs `/ab` sharp edge).

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::listing::ListingItem;

pub const DEFAULT_CACHE_TIMEOUT: u64 = 30;
pub const MIN_CACHE_TIMEOUT: u64 = 5;
pub const MAX_CACHE_TIMEOUT: u64 = 300;

pub fn clamp_cache_timeout(seconds: u64) -> u64 {
    seconds.clamp(MIN_CACHE_TIMEOUT, MAX_CACHE_TIMEOUT)
}

struct CacheEntry {
    items: Vec<ListingItem>,
    timestamp: u64,
}

pub struct DirectoryCache {
    entries: HashMap<String, CacheEntry>,
    timeout: u64,
}

impl DirectoryCache {
    pub fn new(timeout: u64) -> Self {
        DirectoryCache {
            entries: HashMap::new(),
            timeout,
        }
    }

    /// Looks up `path`. A present-but-expired entry is evicted and reported
    /// as a miss, same as one that was never there.
    pub fn get(&mut self, path: &str) -> Option<Vec<ListingItem>> {
        let expired = match self.entries.get(path) {
            Some(entry) => now_secs().saturating_sub(entry.timestamp) > self.timeout,
            None => return None,
        };
        if expired {
            self.entries.remove(path);
            return None;
        }
        self.entries.get(path).map(|entry| entry.items.clone())
    }

    /// Takes ownership of `items`; any prior entry for `path` is dropped.
    pub fn put(&mut self, path: String, items: Vec<ListingItem>) {
        self.entries.insert(
            path,
            CacheEntry {
                items,
                timestamp: now_secs(),
            },
        );
    }

    /// Removes every entry whose key is `prefix` itself, or `prefix`
    /// immediately followed by a `/` component boundary.
    pub fn invalidate(&mut self, prefix: &str) {
        self.entries.retain(|key, _| !path_under(key, prefix));
    }
}

fn path_under(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    path == prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing::ItemKind;

    fn item(name: &str) -> ListingItem {
        ListingItem {
            name: name.to_string(),
            kind: ItemKind::File,
            size: 0,
            mtime: 0,
            mode: 0o644,
        }
    }

    #[test]
    fn put_then_get_returns_the_last_items() {
        let mut cache = DirectoryCache::new(30);
        cache.put("/a".to_string(), vec![item("one")]);
        cache.put("/a".to_string(), vec![item("two")]);
        let got = cache.get("/a").unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name, "two");
    }

    #[test]
    fn miss_on_unknown_path() {
        let mut cache = DirectoryCache::new(30);
        assert!(cache.get("/nope").is_none());
    }

    #[test]
    fn expired_entry_is_evicted_on_get() {
        let mut cache = DirectoryCache::new(0);
        cache.put("/a".to_string(), vec![item("one")]);
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(cache.get("/a").is_none());
        // the eviction actually removed the entry, not just hid it
        cache.put("/a".to_string(), vec![item("fresh")]);
        assert_eq!(cache.get("/a").unwrap()[0].name, "fresh");
    }

    #[test]
    fn invalidate_matches_whole_components_not_raw_bytes() {
        let mut cache = DirectoryCache::new(30);
        cache.put("/a".to_string(), vec![item("x")]);
        cache.put("/ab".to_string(), vec![item("y")]);
        cache.put("/a/child".to_string(), vec![item("z")]);
        cache.invalidate("/a");
        assert!(cache.get("/a").is_none());
        assert!(cache.get("/a/child").is_none());
        // component-boundary fix: "/ab" must survive invalidating "/a"
        assert!(cache.get("/ab").is_some());
    }

    #[test]
    fn invalidate_root_clears_everything() {
        let mut cache = DirectoryCache::new(30);
        cache.put("/".to_string(), vec![item("x")]);
        cache.put("/a/b".to_string(), vec![item("y")]);
        cache.invalidate("/");
        assert!(cache.get("/").is_none());
        assert!(cache.get("/a/b").is_none());
    }

    #[test]
    fn clamp_respects_bounds() {
        assert_eq!(clamp_cache_timeout(0), MIN_CACHE_TIMEOUT);
        assert_eq!(clamp_cache_timeout(10_000), MAX_CACHE_TIMEOUT);
        assert_eq!(clamp_cache_timeout(42), 42);
    }
}
