//! 文件访问与 I/O 限流
//!
//! - `FileProvider` 抽象本地磁盘与远端对象存储，只暴露整文件写入与区间读取
//! - `IoLimiter` 在每次文件读写前调用，只产生背压，不改变语义

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::common::{DmError, Result};

// ── FileProvider ──────────────────────────────────────────────────────────────

pub trait FileProvider: Send + Sync {
    /// 原子地写入整个文件（覆盖已有内容）
    fn write_file(&self, path: &str, data: &[u8]) -> Result<()>;
    fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>>;
    fn size(&self, path: &str) -> Result<u64>;
    fn remove(&self, path: &str) -> Result<()>;
    fn exists(&self, path: &str) -> bool;

    fn read_all(&self, path: &str) -> Result<Vec<u8>> {
        let size = self.size(path)?;
        self.read_range(path, 0, size as usize)
    }
}

fn out_of_bounds(path: &str, offset: u64, len: usize, size: u64) -> DmError {
    DmError::Corruption(format!(
        "read [{offset}, +{len}) out of bounds for {path} (size={size})"
    ))
}

/// 进程内文件系统，测试与演示使用
#[derive(Default)]
pub struct MemFileProvider {
    files: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl MemFileProvider {
    pub fn new() -> Self { Self::default() }

    pub fn file_count(&self) -> usize { self.files.read().len() }
}

impl FileProvider for MemFileProvider {
    fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        self.files.write().insert(path.to_string(), Arc::new(data.to_vec()));
        Ok(())
    }

    fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let file = self.files.read().get(path).cloned()
            .ok_or_else(|| DmError::FileNotFound(path.into()))?;
        let start = offset as usize;
        let end   = start.checked_add(len).filter(|&e| e <= file.len())
            .ok_or_else(|| out_of_bounds(path, offset, len, file.len() as u64))?;
        Ok(file[start..end].to_vec())
    }

    fn size(&self, path: &str) -> Result<u64> {
        self.files.read().get(path)
            .map(|f| f.len() as u64)
            .ok_or_else(|| DmError::FileNotFound(path.into()))
    }

    fn remove(&self, path: &str) -> Result<()> {
        self.files.write().remove(path)
            .map(|_| ())
            .ok_or_else(|| DmError::FileNotFound(path.into()))
    }

    fn exists(&self, path: &str) -> bool {
        self.files.read().contains_key(path)
    }
}

/// 以 `root` 为根目录的本地文件
pub struct LocalFileProvider {
    root: PathBuf,
}

impl LocalFileProvider {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        fs::create_dir_all(root.as_ref())?;
        Ok(Self { root: root.as_ref().to_path_buf() })
    }

    fn full_path(&self, path: &str) -> PathBuf { self.root.join(path) }

    fn not_found(path: &str, e: std::io::Error) -> DmError {
        if e.kind() == std::io::ErrorKind::NotFound {
            DmError::FileNotFound(path.into())
        } else {
            DmError::Io(e)
        }
    }
}

impl FileProvider for LocalFileProvider {
    fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        // 先写临时文件再 rename，读者不会看到半个文件
        let tmp = full.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &full)?;
        debug!(path, bytes = data.len(), "file written");
        Ok(())
    }

    fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut f = fs::File::open(self.full_path(path)).map_err(|e| Self::not_found(path, e))?;
        let size = f.metadata()?.len();
        if offset.saturating_add(len as u64) > size {
            return Err(out_of_bounds(path, offset, len, size));
        }
        f.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        f.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn size(&self, path: &str) -> Result<u64> {
        Ok(fs::metadata(self.full_path(path)).map_err(|e| Self::not_found(path, e))?.len())
    }

    fn remove(&self, path: &str) -> Result<()> {
        fs::remove_file(self.full_path(path)).map_err(|e| Self::not_found(path, e))
    }

    fn exists(&self, path: &str) -> bool {
        self.full_path(path).exists()
    }
}

// ── IoLimiter ─────────────────────────────────────────────────────────────────

pub trait IoLimiter: Send + Sync {
    /// 申请 `bytes` 字节的配额，必要时阻塞当前线程
    fn request(&self, bytes: u64);
    fn total_requested(&self) -> u64;
}

#[derive(Default)]
pub struct NoopLimiter {
    requested: AtomicU64,
}

impl NoopLimiter {
    pub fn new() -> Self { Self::default() }
}

impl IoLimiter for NoopLimiter {
    fn request(&self, bytes: u64) {
        self.requested.fetch_add(bytes, Ordering::Relaxed);
    }

    fn total_requested(&self) -> u64 { self.requested.load(Ordering::Relaxed) }
}

struct Bucket {
    tokens: f64,
    last:   Instant,
}

/// 令牌桶：每秒补充 `rate` 字节，最多积攒 `burst` 字节
pub struct TokenBucketLimiter {
    rate:      f64,
    burst:     f64,
    bucket:    Mutex<Bucket>,
    requested: AtomicU64,
}

impl TokenBucketLimiter {
    pub fn new(rate_bytes_per_sec: u64, burst_bytes: u64) -> Self {
        let burst = burst_bytes.max(1) as f64;
        Self {
            rate:      rate_bytes_per_sec.max(1) as f64,
            burst,
            bucket:    Mutex::new(Bucket { tokens: burst, last: Instant::now() }),
            requested: AtomicU64::new(0),
        }
    }
}

impl IoLimiter for TokenBucketLimiter {
    fn request(&self, bytes: u64) {
        self.requested.fetch_add(bytes, Ordering::Relaxed);
        // 超过桶容量的请求按桶容量计，避免永远拿不到
        let need = (bytes as f64).min(self.burst);
        loop {
            let wait = {
                let mut b = self.bucket.lock();
                let now = Instant::now();
                let elapsed = now.duration_since(b.last).as_secs_f64();
                b.tokens = (b.tokens + elapsed * self.rate).min(self.burst);
                b.last = now;
                if b.tokens >= need {
                    b.tokens -= need;
                    return;
                }
                Duration::from_secs_f64((need - b.tokens) / self.rate)
            };
            std::thread::sleep(wait);
        }
    }

    fn total_requested(&self) -> u64 { self.requested.load(Ordering::Relaxed) }
}

// ── FileIo ────────────────────────────────────────────────────────────────────

/// 文件访问三件套：provider 与读写两个限流器
#[derive(Clone)]
pub struct FileIo {
    pub provider:      Arc<dyn FileProvider>,
    pub read_limiter:  Arc<dyn IoLimiter>,
    pub write_limiter: Arc<dyn IoLimiter>,
}

impl FileIo {
    pub fn new(provider: Arc<dyn FileProvider>) -> Self {
        Self {
            provider,
            read_limiter:  Arc::new(NoopLimiter::new()),
            write_limiter: Arc::new(NoopLimiter::new()),
        }
    }

    pub fn in_memory() -> Self { Self::new(Arc::new(MemFileProvider::new())) }

    pub fn with_limiters(mut self, read: Arc<dyn IoLimiter>, write: Arc<dyn IoLimiter>) -> Self {
        self.read_limiter  = read;
        self.write_limiter = write;
        self
    }

    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        self.write_limiter.request(data.len() as u64);
        self.provider.write_file(path, data)
    }

    pub fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.read_limiter.request(len as u64);
        self.provider.read_range(path, offset, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_provider_range_reads() {
        let fp = MemFileProvider::new();
        fp.write_file("a/b", b"hello world").unwrap();
        assert_eq!(fp.read_range("a/b", 6, 5).unwrap(), b"world");
        assert_eq!(fp.size("a/b").unwrap(), 11);
        assert!(matches!(fp.read_range("a/b", 8, 10), Err(DmError::Corruption(_))));
        fp.remove("a/b").unwrap();
        assert!(!fp.exists("a/b"));
        assert!(matches!(fp.read_all("a/b"), Err(DmError::FileNotFound(_))));
    }

    #[test]
    fn local_provider_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let fp = LocalFileProvider::new(dir.path()).unwrap();
        fp.write_file("dmf/1/data", &[1, 2, 3, 4]).unwrap();
        assert!(fp.exists("dmf/1/data"));
        assert_eq!(fp.read_range("dmf/1/data", 1, 2).unwrap(), vec![2, 3]);
        assert_eq!(fp.read_all("dmf/1/data").unwrap(), vec![1, 2, 3, 4]);
        fp.remove("dmf/1/data").unwrap();
        assert!(matches!(fp.size("dmf/1/data"), Err(DmError::FileNotFound(_))));
    }

    #[test]
    fn token_bucket_counts_requests() {
        let limiter = TokenBucketLimiter::new(1 << 30, 1 << 20);
        limiter.request(4096);
        limiter.request(4096);
        assert_eq!(limiter.total_requested(), 8192);
        let noop = NoopLimiter::new();
        noop.request(7);
        assert_eq!(noop.total_requested(), 7);
    }

    #[test]
    fn file_io_charges_limiters() {
        let read: Arc<dyn IoLimiter>  = Arc::new(NoopLimiter::new());
        let write: Arc<dyn IoLimiter> = Arc::new(NoopLimiter::new());
        let io = FileIo::in_memory().with_limiters(read.clone(), write.clone());
        io.write_file("f", &[0u8; 64]).unwrap();
        io.read_range("f", 0, 16).unwrap();
        assert_eq!((read.total_requested(), write.total_requested()), (16, 64));
    }
}
