//! 页存储池
//!
//! delta 层的 tiny 文件与 segment 元数据都以页的形式落盘，segment 只持有页 id。
//! 逻辑 split 时两个新 delta 需要引用同一份数据，因此页支持 `add_ref`：
//! 新 id 与旧 id 共享数据，删除其中一个不影响另一个。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::common::{DmError, FileId, PageId, Result, SegmentId};

pub trait PageStorage: Send + Sync {
    /// 写入（或覆盖）一页
    fn put(&self, page_id: PageId, data: Vec<u8>) -> Result<()>;
    fn get(&self, page_id: PageId) -> Result<Arc<Vec<u8>>>;
    /// 让 `new_id` 引用 `existing_id` 的数据
    fn add_ref(&self, new_id: PageId, existing_id: PageId) -> Result<()>;
    fn remove(&self, page_id: PageId) -> Result<()>;
    fn exists(&self, page_id: PageId) -> bool;
    fn page_count(&self) -> usize;
}

#[derive(Clone)]
struct PageEntry {
    crc:  u32,
    data: Arc<Vec<u8>>,
}

/// 内存页存储，每页带 CRC32
#[derive(Default)]
pub struct MemPageStorage {
    pages: RwLock<HashMap<PageId, PageEntry>>,
}

impl MemPageStorage {
    pub fn new() -> Self { Self::default() }

    /// 底层数据被多少个页 id 引用
    pub fn ref_count(&self, page_id: PageId) -> usize {
        self.pages.read().get(&page_id)
            .map(|e| Arc::strong_count(&e.data))
            .unwrap_or(0)
    }
}

impl PageStorage for MemPageStorage {
    fn put(&self, page_id: PageId, data: Vec<u8>) -> Result<()> {
        let crc = crc32fast::hash(&data);
        self.pages.write().insert(page_id, PageEntry { crc, data: Arc::new(data) });
        Ok(())
    }

    fn get(&self, page_id: PageId) -> Result<Arc<Vec<u8>>> {
        let entry = self.pages.read().get(&page_id).cloned()
            .ok_or(DmError::PageNotFound(page_id))?;
        if crc32fast::hash(&entry.data) != entry.crc {
            return Err(DmError::ChecksumMismatch(format!("page {page_id}")));
        }
        Ok(entry.data)
    }

    fn add_ref(&self, new_id: PageId, existing_id: PageId) -> Result<()> {
        let mut pages = self.pages.write();
        let entry = pages.get(&existing_id).cloned()
            .ok_or(DmError::PageNotFound(existing_id))?;
        pages.insert(new_id, entry);
        Ok(())
    }

    fn remove(&self, page_id: PageId) -> Result<()> {
        self.pages.write().remove(&page_id)
            .map(|_| ())
            .ok_or(DmError::PageNotFound(page_id))
    }

    fn exists(&self, page_id: PageId) -> bool {
        self.pages.read().contains_key(&page_id)
    }

    fn page_count(&self) -> usize { self.pages.read().len() }
}

/// 根 segment 的 id
pub const FIRST_SEGMENT_ID: SegmentId = 1;

/// log 存 delta 页，meta 存 segment 元数据（页 id 即 segment id）
pub struct StoragePool {
    pub log:          Arc<dyn PageStorage>,
    pub meta:         Arc<dyn PageStorage>,
    next_page_id:     AtomicU64,
    next_file_id:     AtomicU64,
    next_segment_id:  AtomicU64,
}

impl StoragePool {
    pub fn new(log: Arc<dyn PageStorage>, meta: Arc<dyn PageStorage>) -> Self {
        Self {
            log,
            meta,
            next_page_id:    AtomicU64::new(1),
            next_file_id:    AtomicU64::new(1),
            next_segment_id: AtomicU64::new(FIRST_SEGMENT_ID + 1),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemPageStorage::new()), Arc::new(MemPageStorage::new()))
    }

    pub fn new_log_page_id(&self) -> PageId {
        self.next_page_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn new_dmfile_id(&self) -> FileId {
        self.next_file_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn new_segment_id(&self) -> SegmentId {
        self.next_segment_id.fetch_add(1, Ordering::Relaxed)
    }

    /// 从已持久化状态恢复时，保证后续分配的 id 不与已有 id 冲突
    pub fn observe_ids(&self, max_page: PageId, max_file: FileId, max_segment: SegmentId) {
        self.next_page_id.fetch_max(max_page + 1, Ordering::Relaxed);
        self.next_file_id.fetch_max(max_file + 1, Ordering::Relaxed);
        self.next_segment_id.fetch_max(max_segment + 1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_pages_share_data() {
        let ps = MemPageStorage::new();
        ps.put(1, vec![9, 9, 9]).unwrap();
        ps.add_ref(2, 1).unwrap();
        assert_eq!(ps.ref_count(1), 2);
        ps.remove(1).unwrap();
        assert_eq!(*ps.get(2).unwrap(), vec![9, 9, 9]);
        assert!(matches!(ps.get(1), Err(DmError::PageNotFound(1))));
        assert!(ps.add_ref(3, 1).is_err());
    }

    #[test]
    fn allocators_are_monotonic() {
        let pool = StoragePool::in_memory();
        let a = pool.new_segment_id();
        let b = pool.new_segment_id();
        assert!(a > FIRST_SEGMENT_ID && b > a);
        pool.observe_ids(100, 50, 7);
        assert_eq!(pool.new_log_page_id(), 101);
        assert_eq!(pool.new_dmfile_id(), 51);
        assert_eq!(pool.new_segment_id(), 8);
    }
}
