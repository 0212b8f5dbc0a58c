//! Min-max 索引缓存：`(file id, column id)` → `(FieldType, Arc<MinMaxIndex>)`

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::common::{ColId, FileId, Result};
use crate::field_type::FieldType;
use super::MinMaxIndex;

pub type MinMaxIndexKey = (FileId, ColId);
type Entry = (FieldType, Arc<MinMaxIndex>);

pub struct MinMaxIndexCache {
    inner:  Mutex<LruCache<MinMaxIndexKey, Entry>>,
    hits:   AtomicU64,
    misses: AtomicU64,
}

impl MinMaxIndexCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner:  Mutex::new(LruCache::new(cap)),
            hits:   AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &MinMaxIndexKey) -> Option<Entry> {
        self.inner.lock().get(key).cloned()
    }

    /// 命中直接返回；未命中时调用 `loader`，仅当 `set_cache_if_miss` 时写回缓存。
    /// 加载期间不持锁。第二个返回值表示是否命中。
    pub fn get_or_load<F>(&self, key: MinMaxIndexKey, set_cache_if_miss: bool, loader: F) -> Result<(Entry, bool)>
    where
        F: FnOnce() -> Result<Entry>,
    {
        if let Some(hit) = self.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok((hit, true));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let loaded = loader()?;
        if set_cache_if_miss {
            self.inner.lock().put(key, loaded.clone());
        }
        Ok((loaded, false))
    }

    /// 文件被删除后清掉其所有列
    pub fn remove_file(&self, file_id: FileId) {
        let mut guard = self.inner.lock();
        let stale: Vec<MinMaxIndexKey> = guard.iter()
            .filter(|((fid, _), _)| *fid == file_id)
            .map(|(k, _)| *k)
            .collect();
        for k in stale {
            guard.pop(&k);
        }
    }

    pub fn len(&self)      -> usize { self.inner.lock().len() }
    pub fn is_empty(&self) -> bool  { self.len() == 0 }
    pub fn hits(&self)     -> u64   { self.hits.load(Ordering::Relaxed) }
    pub fn misses(&self)   -> u64   { self.misses.load(Ordering::Relaxed) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_type::Value;

    fn sample() -> Entry {
        let mut idx = MinMaxIndex::new(FieldType::Int64);
        idx.add_pack(&[Value::Int64(1), Value::Int64(2)]);
        (FieldType::Int64, Arc::new(idx))
    }

    #[test]
    fn miss_without_populate_leaves_cache_untouched() {
        let cache = MinMaxIndexCache::new(4);
        let (_, hit) = cache.get_or_load((1, 2), false, || Ok(sample())).unwrap();
        assert!(!hit && cache.is_empty());
        cache.get_or_load((1, 2), true, || Ok(sample())).unwrap();
        assert_eq!(cache.len(), 1);
        let (_, hit) = cache.get_or_load((1, 2), true, || panic!("should hit")).unwrap();
        assert!(hit);
        assert_eq!((cache.hits(), cache.misses()), (1, 2));
    }

    #[test]
    fn remove_file_drops_all_columns() {
        let cache = MinMaxIndexCache::new(8);
        for col in [1, 2, 3] {
            cache.get_or_load((9, col), true, || Ok(sample())).unwrap();
        }
        cache.get_or_load((10, 1), true, || Ok(sample())).unwrap();
        cache.remove_file(9);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&(10, 1)).is_some());
    }

    #[test]
    fn loader_error_propagates() {
        let cache = MinMaxIndexCache::new(2);
        let r = cache.get_or_load((1, 1), true, || Err(crate::common::DmError::FileNotFound("x".into())));
        assert!(r.is_err());
        assert!(cache.is_empty());
    }
}
