pub mod lru;
pub mod replacer;

use crate::storage::disk::FileNamespace;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{FileId, PageId, PageKey};
use crate::storage::PAGE_SIZE;
use dashmap::DashMap;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use replacer::{FrameId, Replacer};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

type PageBuf = Box<[u8; PAGE_SIZE]>;

pub struct Frame {
    /// Page bytes; the lock doubles as the page latch.
    data: Arc<RwLock<PageBuf>>,
    page_key: Option<PageKey>,
    pin_count: AtomicU32,
    is_dirty: Arc<AtomicBool>,
}

impl Frame {
    fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(Box::new([0u8; PAGE_SIZE]))),
            page_key: None,
            pin_count: AtomicU32::new(0),
            is_dirty: Arc::new(AtomicBool::new(false)),
        }
    }

    fn reset(&mut self) {
        self.page_key = None;
        self.pin_count.store(0, Ordering::SeqCst);
        self.is_dirty.store(false, Ordering::SeqCst);
        self.data.write().fill(0);
    }
}

/// Page cache shared by every file of a storage.
///
/// `fetch_page` hands out a shared latch on the page and `fetch_page_write` an
/// exclusive one; the latch is held until the guard is dropped. Only unpinned
/// frames are evicted, dirty victims are written back first.
#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<BufferPoolInner>,
}

struct BufferPoolInner {
    page_table: DashMap<PageKey, FrameId>,
    frames: RwLock<HashMap<FrameId, Frame>>,
    free_frames: Mutex<Vec<FrameId>>,
    replacer: Mutex<Box<dyn Replacer>>,
    namespace: Arc<FileNamespace>,
    /// Serializes cache misses so a page is never loaded into two frames.
    miss_lock: Mutex<()>,
    next_frame_id: AtomicU32,
    max_frames: usize,
}

struct PinnedFrame {
    frame_id: FrameId,
    data: Arc<RwLock<PageBuf>>,
    is_dirty: Arc<AtomicBool>,
}

impl BufferPoolManager {
    pub fn new(namespace: Arc<FileNamespace>, replacer: Box<dyn Replacer>, max_frames: usize) -> Self {
        Self {
            inner: Arc::new(BufferPoolInner {
                page_table: DashMap::new(),
                frames: RwLock::new(HashMap::with_capacity(max_frames)),
                free_frames: Mutex::new(Vec::new()),
                replacer: Mutex::new(replacer),
                namespace,
                miss_lock: Mutex::new(()),
                next_frame_id: AtomicU32::new(0),
                max_frames,
            }),
        }
    }

    pub fn namespace(&self) -> &Arc<FileNamespace> {
        &self.inner.namespace
    }

    /// Pins the page and takes a shared latch on it.
    pub fn fetch_page(&self, key: PageKey) -> StorageResult<PageReadGuard> {
        let pinned = self.pin_page(key)?;
        let guard = pinned.data.read_arc();

        Ok(PageReadGuard {
            inner: self.inner.clone(),
            frame_id: pinned.frame_id,
            guard,
        })
    }

    /// Pins the page and takes an exclusive latch on it. The frame becomes
    /// dirty once the guard is dereferenced mutably.
    pub fn fetch_page_write(&self, key: PageKey) -> StorageResult<PageWriteGuard> {
        let pinned = self.pin_page(key)?;
        let guard = pinned.data.write_arc();

        Ok(PageWriteGuard {
            inner: self.inner.clone(),
            frame_id: pinned.frame_id,
            is_dirty: pinned.is_dirty,
            guard,
        })
    }

    /// Appends a zeroed page to the file and returns it latched exclusively.
    pub fn new_page(&self, file_id: FileId) -> StorageResult<(PageId, PageWriteGuard)> {
        let _miss = self.inner.miss_lock.lock();
        let frame_id = self.get_frame()?;

        let page_id = match self.inner.namespace.allocate_page(file_id) {
            Ok(page_id) => page_id,
            Err(e) => {
                self.inner.free_frames.lock().push(frame_id);
                return Err(e);
            }
        };
        let key = PageKey::new(file_id, page_id);

        let (data, is_dirty) = {
            let mut frames = self.inner.frames.write();
            let frame = frames
                .get_mut(&frame_id)
                .ok_or(StorageError::BufferPoolFull)?;
            frame.page_key = Some(key);
            frame.pin_count.store(1, Ordering::SeqCst);
            frame.is_dirty.store(true, Ordering::SeqCst);
            (frame.data.clone(), frame.is_dirty.clone())
        };

        self.inner.page_table.insert(key, frame_id);
        self.inner.replacer.lock().pin(frame_id);

        let guard = data.write_arc();
        Ok((
            page_id,
            PageWriteGuard {
                inner: self.inner.clone(),
                frame_id,
                is_dirty,
                guard,
            },
        ))
    }

    pub fn flush_page(&self, key: PageKey) -> StorageResult<()> {
        let Some(frame_id) = self.inner.page_table.get(&key).map(|e| *e.value()) else {
            return Ok(());
        };
        let (data, is_dirty) = {
            let frames = self.inner.frames.read();
            match frames.get(&frame_id) {
                Some(frame) if frame.page_key == Some(key) => {
                    (frame.data.clone(), frame.is_dirty.clone())
                }
                _ => return Ok(()),
            }
        };

        let data = data.read();
        if is_dirty.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.inner.namespace.write_page(key, &data[..]) {
                is_dirty.store(true, Ordering::SeqCst);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn flush_file(&self, file_id: FileId) -> StorageResult<()> {
        for key in self.cached_pages(|key| key.file_id == file_id) {
            self.flush_page(key)?;
        }
        self.inner.namespace.sync_file(file_id)
    }

    pub fn flush_all(&self) -> StorageResult<()> {
        for key in self.cached_pages(|_| true) {
            self.flush_page(key)?;
        }
        self.inner.namespace.sync_all()
    }

    /// Drops every cached page of the file without writing it back.
    ///
    /// Callers must not hold guards on pages of the file.
    pub fn discard_file(&self, file_id: FileId) {
        let keys = self.cached_pages(|key| key.file_id == file_id);
        let mut frames = self.inner.frames.write();
        let mut free_frames = self.inner.free_frames.lock();
        let mut replacer = self.inner.replacer.lock();

        for key in keys {
            if let Some((_, frame_id)) = self.inner.page_table.remove(&key) {
                if let Some(frame) = frames.get_mut(&frame_id) {
                    *frame = Frame::new();
                }
                replacer.remove(frame_id);
                free_frames.push(frame_id);
            }
        }
    }

    fn cached_pages(&self, filter: impl Fn(&PageKey) -> bool) -> Vec<PageKey> {
        self.inner
            .page_table
            .iter()
            .map(|entry| *entry.key())
            .filter(|key| filter(key))
            .collect()
    }

    fn try_pin(&self, key: PageKey) -> Option<PinnedFrame> {
        let frame_id = self.inner.page_table.get(&key).map(|e| *e.value())?;
        let frames = self.inner.frames.read();
        let frame = frames.get(&frame_id)?;
        // The frame may have been recycled between the lookup and the lock.
        if frame.page_key != Some(key) {
            return None;
        }
        frame.pin_count.fetch_add(1, Ordering::SeqCst);
        self.inner.replacer.lock().pin(frame_id);

        Some(PinnedFrame {
            frame_id,
            data: frame.data.clone(),
            is_dirty: frame.is_dirty.clone(),
        })
    }

    fn pin_page(&self, key: PageKey) -> StorageResult<PinnedFrame> {
        if let Some(pinned) = self.try_pin(key) {
            return Ok(pinned);
        }

        let _miss = self.inner.miss_lock.lock();
        // Double-check after acquiring the miss lock
        if let Some(pinned) = self.try_pin(key) {
            return Ok(pinned);
        }

        let frame_id = self.get_frame()?;
        let (data, is_dirty) = {
            let frames = self.inner.frames.read();
            let frame = frames.get(&frame_id).ok_or(StorageError::BufferPoolFull)?;
            (frame.data.clone(), frame.is_dirty.clone())
        };

        // Load page from disk
        if let Err(e) = self.inner.namespace.read_page(key, &mut data.write()[..]) {
            self.inner.free_frames.lock().push(frame_id);
            return Err(e);
        }

        {
            let mut frames = self.inner.frames.write();
            let frame = frames
                .get_mut(&frame_id)
                .ok_or(StorageError::BufferPoolFull)?;
            frame.page_key = Some(key);
            frame.pin_count.store(1, Ordering::SeqCst);
            frame.is_dirty.store(false, Ordering::SeqCst);
        }
        self.inner.page_table.insert(key, frame_id);
        self.inner.replacer.lock().pin(frame_id);

        Ok(PinnedFrame {
            frame_id,
            data,
            is_dirty,
        })
    }

    /// Returns an empty frame. Must be called with the miss lock held.
    fn get_frame(&self) -> StorageResult<FrameId> {
        if let Some(frame_id) = self.inner.free_frames.lock().pop() {
            return Ok(frame_id);
        }

        // Try to allocate new frame if under limit
        {
            let mut frames = self.inner.frames.write();
            if frames.len() < self.inner.max_frames {
                let frame_id = self.inner.next_frame_id.fetch_add(1, Ordering::SeqCst);
                frames.insert(frame_id, Frame::new());
                return Ok(frame_id);
            }
        }

        loop {
            let victim = self
                .inner
                .replacer
                .lock()
                .evict()
                .ok_or(StorageError::BufferPoolFull)?;

            // Detach the victim while holding the frames lock so no reader can
            // pin it, then write it back outside the lock.
            let (old_key, dirty_copy) = {
                let mut frames = self.inner.frames.write();
                let Some(frame) = frames.get_mut(&victim) else {
                    continue;
                };
                if frame.pin_count.load(Ordering::SeqCst) > 0 {
                    continue;
                }
                let old_key = frame.page_key.take();
                let dirty_copy = if frame.is_dirty.swap(false, Ordering::SeqCst) {
                    Some(frame.data.read().clone())
                } else {
                    None
                };
                if let Some(key) = old_key {
                    self.inner.page_table.remove(&key);
                }
                (old_key, dirty_copy)
            };

            // Flush if dirty (without holding frames lock)
            if let (Some(key), Some(data)) = (old_key, dirty_copy) {
                if let Err(e) = self.inner.namespace.write_page(key, &data[..]) {
                    let mut frames = self.inner.frames.write();
                    if let Some(frame) = frames.get_mut(&victim) {
                        frame.page_key = Some(key);
                        frame.is_dirty.store(true, Ordering::SeqCst);
                    }
                    self.inner.page_table.insert(key, victim);
                    self.inner.replacer.lock().unpin(victim);
                    return Err(e);
                }
            }

            // Reset frame
            if let Some(frame) = self.inner.frames.write().get_mut(&victim) {
                frame.reset();
            }
            return Ok(victim);
        }
    }
}

fn unpin(inner: &BufferPoolInner, frame_id: FrameId) {
    let should_unpin = {
        let frames = inner.frames.read();
        match frames.get(&frame_id) {
            Some(frame) => frame
                .pin_count
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1))
                == Ok(1),
            None => false,
        }
    };

    if should_unpin {
        inner.replacer.lock().unpin(frame_id);
    }
}

/// Shared latch on a pinned page.
pub struct PageReadGuard {
    inner: Arc<BufferPoolInner>,
    frame_id: FrameId,
    guard: ArcRwLockReadGuard<RawRwLock, PageBuf>,
}

impl Deref for PageReadGuard {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl Drop for PageReadGuard {
    fn drop(&mut self) {
        unpin(&self.inner, self.frame_id);
    }
}

/// Exclusive latch on a pinned page.
pub struct PageWriteGuard {
    inner: Arc<BufferPoolInner>,
    frame_id: FrameId,
    is_dirty: Arc<AtomicBool>,
    guard: ArcRwLockWriteGuard<RawRwLock, PageBuf>,
}

impl Deref for PageWriteGuard {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.is_dirty.store(true, Ordering::SeqCst);
        &mut self.guard
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        unpin(&self.inner, self.frame_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::thread;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn create_test_buffer_pool(max_frames: usize) -> Result<(BufferPoolManager, FileId, TempDir)> {
        let dir = tempdir()?;
        let namespace = Arc::new(FileNamespace::new(dir.path())?);
        let file_id = namespace.book_file_id();
        namespace.create_file(file_id, "test.vpm")?;
        let replacer = Box::new(lru::LruReplacer::new(max_frames));
        Ok((
            BufferPoolManager::new(namespace, replacer, max_frames),
            file_id,
            dir,
        ))
    }

    #[test]
    fn test_new_page() -> Result<()> {
        let (buffer_pool, file_id, _dir) = create_test_buffer_pool(10)?;

        let (page_id, mut guard) = buffer_pool.new_page(file_id)?;
        assert_eq!(page_id, PageId(0));

        guard[0] = 42;
        guard[1] = 43;
        drop(guard);

        let guard = buffer_pool.fetch_page(PageKey::new(file_id, page_id))?;
        assert_eq!(guard[0], 42);
        assert_eq!(guard[1], 43);

        Ok(())
    }

    #[test]
    fn test_fetch_write() -> Result<()> {
        let (buffer_pool, file_id, _dir) = create_test_buffer_pool(10)?;

        let (page_id, mut guard) = buffer_pool.new_page(file_id)?;
        guard[0] = 10;
        drop(guard);

        let key = PageKey::new(file_id, page_id);
        let mut guard = buffer_pool.fetch_page_write(key)?;
        guard[0] = 20;
        drop(guard);

        let guard = buffer_pool.fetch_page(key)?;
        assert_eq!(guard[0], 20);

        Ok(())
    }

    #[test]
    fn test_fetch_missing_page() -> Result<()> {
        let (buffer_pool, file_id, _dir) = create_test_buffer_pool(10)?;

        assert!(matches!(
            buffer_pool.fetch_page(PageKey::new(file_id, PageId(3))),
            Err(StorageError::PageNotFound(_))
        ));
        // The frame taken for the failed load is reusable.
        let (page_id, _guard) = buffer_pool.new_page(file_id)?;
        assert_eq!(page_id, PageId(0));

        Ok(())
    }

    #[test]
    fn test_eviction_writes_back_dirty_pages() -> Result<()> {
        let (buffer_pool, file_id, _dir) = create_test_buffer_pool(2)?;

        for value in 1..=3u8 {
            let (_, mut guard) = buffer_pool.new_page(file_id)?;
            guard[0] = value;
        }

        // Page 0 was evicted to make room for page 2
        for (page, value) in [(0u32, 1u8), (1, 2), (2, 3)] {
            let guard = buffer_pool.fetch_page(PageKey::new(file_id, PageId(page)))?;
            assert_eq!(guard[0], value);
        }

        Ok(())
    }

    #[test]
    fn test_pinned_pages_are_not_evicted() -> Result<()> {
        let (buffer_pool, file_id, _dir) = create_test_buffer_pool(2)?;

        let (_, first) = buffer_pool.new_page(file_id)?;
        let (_, second) = buffer_pool.new_page(file_id)?;

        assert!(matches!(
            buffer_pool.new_page(file_id),
            Err(StorageError::BufferPoolFull)
        ));

        drop(first);
        let (page_id, _third) = buffer_pool.new_page(file_id)?;
        assert_eq!(page_id, PageId(2));
        drop(second);

        Ok(())
    }

    #[test]
    fn test_flush_file_persists_pages() -> Result<()> {
        let (buffer_pool, file_id, _dir) = create_test_buffer_pool(4)?;

        let (page_id, mut guard) = buffer_pool.new_page(file_id)?;
        guard[7] = 99;
        drop(guard);
        buffer_pool.flush_file(file_id)?;

        let mut buf = vec![0u8; PAGE_SIZE];
        buffer_pool
            .namespace()
            .read_page(PageKey::new(file_id, page_id), &mut buf)?;
        assert_eq!(buf[7], 99);

        Ok(())
    }

    #[test]
    fn test_discard_file_drops_cached_pages() -> Result<()> {
        let (buffer_pool, file_id, _dir) = create_test_buffer_pool(4)?;

        let (page_id, mut guard) = buffer_pool.new_page(file_id)?;
        guard[0] = 5;
        drop(guard);
        buffer_pool.flush_all()?;

        let mut guard = buffer_pool.fetch_page_write(PageKey::new(file_id, page_id))?;
        guard[0] = 6;
        drop(guard);
        buffer_pool.discard_file(file_id);

        // The unflushed change is gone; the page is reloaded from disk
        let guard = buffer_pool.fetch_page(PageKey::new(file_id, page_id))?;
        assert_eq!(guard[0], 5);

        Ok(())
    }

    #[test]
    fn test_shared_latches_coexist_exclusive_waits() -> Result<()> {
        let (buffer_pool, file_id, _dir) = create_test_buffer_pool(4)?;
        let (page_id, guard) = buffer_pool.new_page(file_id)?;
        drop(guard);
        let key = PageKey::new(file_id, page_id);

        let reader1 = buffer_pool.fetch_page(key)?;
        let reader2 = buffer_pool.fetch_page(key)?;
        assert_eq!(reader1[0], reader2[0]);

        let pool = buffer_pool.clone();
        let writer = thread::spawn(move || -> Result<u8> {
            let mut guard = pool.fetch_page_write(key)?;
            guard[0] = 1;
            Ok(guard[0])
        });

        thread::sleep(Duration::from_millis(20));
        assert_eq!(reader1[0], 0);
        drop(reader1);
        drop(reader2);

        assert_eq!(writer.join().expect("writer thread panicked")?, 1);
        assert_eq!(buffer_pool.fetch_page(key)?[0], 1);

        Ok(())
    }
}
