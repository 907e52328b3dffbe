use super::{
    remove_listener, BackgroundExceptionListener, CachePointer, LowDiskSpaceListener, StoreFuture,
    WriteCache,
};
use crate::bins::{BuffExt, ByteReader, SliceExt};
use crate::buffer_pool::ByteBufferPool;
use crate::error::StorageError;
use crate::id::{FileId, Lsn};
use crate::page::{page_lsn, verify_checksum, write_checksum};
use crate::wal::WriteAheadLog;
use anyhow::{anyhow, Context};
use indexmap::map::Entry;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

const REGISTRY_FILE: &str = "files.map";
const REGISTRY_MAGIC: &[u8; 8] = b"cellmap\0";
const DOUBLE_WRITE_FILE: &str = "dbuff";
/// file id, page index and checksum in front of every page image of the double-write buffer
const DOUBLE_WRITE_HEADER: usize = 20;
/// pages written through the double-write buffer at once
const DOUBLE_WRITE_CHUNK: usize = 64;

/// Write cache over one file per component, stored flat in the storage directory.
///
/// Pages are written in chunks: the chunk goes to the double-write buffer first, then to the page
/// files, both fsynced. A write torn by a crash is repaired from the double-write buffer at open.
pub struct FileWriteCache {
    dir: PathBuf,
    page_size: usize,
    pool: ByteBufferPool,
    wal: Arc<dyn WriteAheadLog>,
    max_dirty_pages: usize,
    low_disk_space_threshold: u64,

    files: RwLock<Files>,
    dirty: Mutex<IndexMap<(FileId, u64), DirtyPage>>,
    double_write: Mutex<File>,

    low_disk_space_listeners: Mutex<Vec<Arc<dyn LowDiskSpaceListener>>>,
    background_exception_listeners: Mutex<Vec<Arc<dyn BackgroundExceptionListener>>>,
    background: Mutex<Option<(SyncSender<()>, JoinHandle<()>)>>,
}

#[derive(Default)]
struct Files {
    registered: BTreeMap<FileId, String>,
    by_name: HashMap<String, FileId>,
    open: HashMap<FileId, Arc<OpenFile>>,
    next_id: u32,
}

struct OpenFile {
    file: File,
    /// logical number of pages, pages past the physical end are zero until written
    filled: AtomicU64,
}

struct DirtyPage {
    pointer: Arc<CachePointer>,
    futures: Vec<StoreFuture>,
}

struct PageImage {
    key: (FileId, u64),
    pointer: Arc<CachePointer>,
    version: u64,
    data: Vec<u8>,
}

impl FileWriteCache {
    pub fn open(
        dir: &Path,
        pool: ByteBufferPool,
        wal: Arc<dyn WriteAheadLog>,
        max_dirty_pages: usize,
        low_disk_space_threshold: u64,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let page_size = pool.page_size();

        let registered = load_registry(&dir.join(REGISTRY_FILE))?;
        let mut files = Files {
            next_id: registered.keys().map(|id| id.get() + 1).max().unwrap_or(1),
            ..Files::default()
        };
        for (file_id, name) in registered {
            let file = open_page_file(&dir.join(&name), false)?;
            let filled = file.metadata()?.len() / page_size as u64;
            files.by_name.insert(name.clone(), file_id);
            files.registered.insert(file_id, name);
            files.open.insert(
                file_id,
                Arc::new(OpenFile {
                    file,
                    filled: AtomicU64::new(filled),
                }),
            );
        }

        let double_write = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(DOUBLE_WRITE_FILE))?;
        if !double_write.metadata()?.is_file() {
            return Err(anyhow!("double-write buffer is not a regular file"));
        }
        recover_non_atomic_writes(&double_write, &files, page_size)?;

        log::debug!(
            "write_cache_opened dir={dir:?} files={} page_size={page_size}",
            files.registered.len()
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            page_size,
            pool,
            wal,
            max_dirty_pages,
            low_disk_space_threshold,
            files: RwLock::new(files),
            dirty: Mutex::new(IndexMap::new()),
            double_write: Mutex::new(double_write),
            low_disk_space_listeners: Mutex::new(Vec::new()),
            background_exception_listeners: Mutex::new(Vec::new()),
            background: Mutex::new(None),
        })
    }

    /// Flushes dirty pages every `interval` until the cache is closed or dropped. Failures are
    /// reported to the background exception listeners.
    pub fn start_background_flush(self: &Arc<Self>, interval: Duration) {
        let (sender, receiver) = sync_channel::<()>(1);
        let cache: Weak<Self> = Arc::downgrade(self);
        let handle = std::thread::spawn(move || loop {
            let Err(err) = receiver.recv_timeout(interval) else {
                break;
            };
            if err != RecvTimeoutError::Timeout {
                break;
            }
            let Some(cache) = cache.upgrade() else {
                break;
            };
            if let Err(err) = cache.flush() {
                log::error!("background_flush_failed err={err}");
                let listeners = cache.background_exception_listeners.lock().clone();
                for listener in listeners {
                    listener.background_exception(&err);
                }
            }
        });
        if let Some((sender, handle)) = self.background.lock().replace((sender, handle)) {
            drop(sender);
            let _ = handle.join();
        }
    }

    fn stop_background_flush(&self) {
        let Some((sender, handle)) = self.background.lock().take() else {
            return;
        };
        drop(sender);
        if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
            log::error!("background_flush_panicked");
        }
    }

    pub fn dirty_pages(&self) -> usize {
        self.dirty.lock().len()
    }

    fn open_file(&self, file_id: FileId) -> anyhow::Result<Arc<OpenFile>> {
        let files = self.files.read();
        if let Some(file) = files.open.get(&file_id) {
            return Ok(file.clone());
        }
        if files.registered.contains_key(&file_id) {
            Err(anyhow!("file {file_id} is closed"))
        } else {
            Err(StorageError::NotFound(format!("file {file_id}")).into())
        }
    }

    fn persist_registry(&self, files: &Files) -> anyhow::Result<()> {
        let mut buff = Vec::new();
        buff.extend_from_slice(REGISTRY_MAGIC);
        buff.put_u32(files.registered.len() as u32);
        for (file_id, name) in &files.registered {
            buff.put_u32(file_id.get());
            buff.put_str(name);
        }
        let checksum = crc64::crc64(0x1d0f, &buff);
        buff.put_u64(checksum);

        let tmp = self.dir.join(format!("{REGISTRY_FILE}.tmp"));
        let f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        f.write_all_at(&buff, 0)?;
        f.sync_all()?;
        std::fs::rename(&tmp, self.dir.join(REGISTRY_FILE))?;
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    fn read_page(
        &self,
        file_id: FileId,
        file: &OpenFile,
        page_index: u64,
    ) -> anyhow::Result<Arc<CachePointer>> {
        let mut buffer = self.pool.acquire_direct(false)?;
        let offset = page_index * self.page_size as u64;
        if offset + self.page_size as u64 > file.file.metadata()?.len() {
            buffer.fill(0);
        } else {
            file.file
                .read_exact_at(&mut buffer, offset)
                .with_context(|| format!("cannot read page {page_index} of file {file_id}"))?;
            if !verify_checksum(&buffer) {
                return Err(StorageError::PageCorrupted {
                    file_id,
                    page_index,
                }
                .into());
            }
        }
        Ok(Arc::new(CachePointer::new(file_id, page_index, buffer)))
    }

    fn drop_dirty_pages(&self, file_id: FileId) {
        let mut dirty = self.dirty.lock();
        dirty.retain(|(id, _), page| {
            if *id != file_id {
                return true;
            }
            page.pointer.clear_dirty_since();
            for future in &page.futures {
                future.complete();
            }
            false
        });
    }

    fn flush_pages(&self, file_id: Option<FileId>) -> anyhow::Result<()> {
        let double_write = self.double_write.lock();
        let batch = self
            .dirty
            .lock()
            .iter()
            .filter(|((id, _), _)| file_id.map_or(true, |file_id| *id == file_id))
            .map(|(key, page)| (*key, page.pointer.clone()))
            .collect::<Vec<_>>();
        if batch.is_empty() {
            return Ok(());
        }
        self.check_low_disk_space()?;

        for chunk in batch.chunks(DOUBLE_WRITE_CHUNK) {
            let mut images = Vec::with_capacity(chunk.len());
            let mut max_lsn: Option<Lsn> = None;
            for (key, pointer) in chunk {
                let guard = pointer.read();
                let version = pointer.version();
                let mut data = guard.to_vec();
                drop(guard);

                write_checksum(&mut data);
                max_lsn = max_lsn.max(page_lsn(&data));
                images.push(PageImage {
                    key: *key,
                    pointer: pointer.clone(),
                    version,
                    data,
                });
            }

            // no page may reach the disk before the records describing it
            if let Some(lsn) = max_lsn {
                self.wal.flush_till(lsn)?;
            }
            self.write_images(&double_write, &images)?;
            self.complete_images(images);
        }
        Ok(())
    }

    fn write_images(&self, double_write: &File, images: &[PageImage]) -> anyhow::Result<()> {
        let slot = DOUBLE_WRITE_HEADER + self.page_size;
        let mut buff = vec![0u8; slot * images.len()];
        for (i, image) in images.iter().enumerate() {
            let slot = &mut buff[i * slot..(i + 1) * slot];
            slot[0..4].copy_from_slice(&image.key.0.to_be_bytes());
            slot[4..12].copy_from_slice(&image.key.1.to_be_bytes());
            slot[DOUBLE_WRITE_HEADER..].copy_from_slice(&image.data);
            let checksum = double_write_checksum(slot);
            slot[12..20].copy_from_slice(&checksum.to_be_bytes());
        }
        double_write.set_len(0)?;
        double_write.write_all_at(&buff, 0)?;
        double_write.sync_all()?;

        let mut touched: IndexMap<FileId, Arc<OpenFile>> = IndexMap::new();
        for image in images {
            let (file_id, page_index) = image.key;
            let file = match touched.get(&file_id) {
                Some(file) => file.clone(),
                None => match self.files.read().open.get(&file_id) {
                    Some(file) => file.clone(),
                    // the file was deleted while the chunk was prepared
                    None => continue,
                },
            };
            file.file
                .write_all_at(&image.data, page_index * self.page_size as u64)?;
            touched.insert(file_id, file);
        }
        for file in touched.values() {
            file.file.sync_all()?;
        }
        // the images are durable in their files, a later replay must not resurrect them
        clear_double_write(double_write)?;
        log::trace!("pages_written count={} files={}", images.len(), touched.len());
        Ok(())
    }

    fn complete_images(&self, images: Vec<PageImage>) {
        let mut dirty = self.dirty.lock();
        for image in images {
            let _guard = image.pointer.read();
            if image.pointer.version() != image.version {
                continue;
            }
            let Some(page) = dirty.get(&image.key) else {
                continue;
            };
            if !Arc::ptr_eq(&page.pointer, &image.pointer) {
                continue;
            }
            if let Some(page) = dirty.shift_remove(&image.key) {
                page.pointer.clear_dirty_since();
                for future in page.futures {
                    future.complete();
                }
            }
        }
    }
}

fn double_write_checksum(slot: &[u8]) -> u64 {
    let crc = crc64::crc64(0x1d0f, &slot[0..12]);
    crc64::crc64(crc, &slot[DOUBLE_WRITE_HEADER..])
}

fn open_page_file(path: &Path, create: bool) -> anyhow::Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(create)
        .open(path)
        .with_context(|| format!("cannot open page file {path:?}"))?;
    if !file.metadata()?.is_file() {
        return Err(anyhow!("{path:?} is not a regular file"));
    }
    Ok(file)
}

fn load_registry(path: &Path) -> anyhow::Result<BTreeMap<FileId, String>> {
    let buff = match std::fs::read(path) {
        Ok(buff) => buff,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(err) => return Err(err.into()),
    };
    if buff.len() < REGISTRY_MAGIC.len() + 12 || &buff[..REGISTRY_MAGIC.len()] != REGISTRY_MAGIC {
        return Err(anyhow!("{path:?} is not a file registry"));
    }
    let (content, checksum) = buff.split_at(buff.len() - 8);
    if checksum.read_u64() != crc64::crc64(0x1d0f, content) {
        return Err(anyhow!("file registry {path:?} is corrupted"));
    }

    let mut reader = ByteReader::new(&content[REGISTRY_MAGIC.len()..]);
    let count = reader.get_u32()?;
    let mut registered = BTreeMap::new();
    for _ in 0..count {
        let file_id = FileId::new(reader.get_u32()?);
        let name = reader.get_str()?;
        registered.insert(file_id, name);
    }
    reader.finish()?;
    Ok(registered)
}

fn clear_double_write(double_write: &File) -> anyhow::Result<()> {
    double_write.set_len(0)?;
    double_write.sync_all()?;
    Ok(())
}

fn recover_non_atomic_writes(
    double_write: &File,
    files: &Files,
    page_size: usize,
) -> anyhow::Result<()> {
    let slot = DOUBLE_WRITE_HEADER + page_size;
    let size = double_write.metadata()?.len() as usize;
    let count = size / slot;
    if count == 0 {
        return Ok(());
    }

    let mut buff = vec![0u8; count * slot];
    double_write.read_exact_at(&mut buff, 0)?;

    let mut restored = 0;
    let mut touched = IndexMap::new();
    for slot in buff.chunks_exact(slot) {
        // a torn slot means the page files were not touched yet
        if slot[12..].read_u64() != double_write_checksum(slot) {
            continue;
        }
        let file_id = FileId::new(slot[0..].read_u32());
        let page_index = slot[4..].read_u64();
        let Some(file) = files.open.get(&file_id) else {
            continue;
        };
        file.file
            .write_all_at(&slot[DOUBLE_WRITE_HEADER..], page_index * page_size as u64)?;
        file.filled.fetch_max(page_index + 1, Ordering::SeqCst);
        touched.insert(file_id, file.clone());
        restored += 1;
    }
    for file in touched.values() {
        file.file.sync_all()?;
    }
    clear_double_write(double_write)?;
    log::debug!("double_write_recovered pages={restored}");
    Ok(())
}

impl WriteCache for FileWriteCache {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn add_file(&self, name: &str, file_id: Option<FileId>) -> anyhow::Result<FileId> {
        let mut files = self.files.write();
        if files.by_name.contains_key(name) {
            return Err(anyhow!("file {name} already exists"));
        }
        let file_id = match file_id {
            Some(file_id) => {
                if files.registered.contains_key(&file_id) {
                    return Err(anyhow!("file id {file_id} is already used"));
                }
                file_id
            }
            None => FileId::new(files.next_id),
        };
        files.next_id = files.next_id.max(file_id.get() + 1);

        let file = open_page_file(&self.dir.join(name), true)?;
        files.registered.insert(file_id, name.to_string());
        files.by_name.insert(name.to_string(), file_id);
        files.open.insert(
            file_id,
            Arc::new(OpenFile {
                file,
                filled: AtomicU64::new(0),
            }),
        );
        self.persist_registry(&files)?;
        log::debug!("file_added name={name} file_id={file_id}");
        Ok(file_id)
    }

    fn book_file_id(&self, name: &str) -> anyhow::Result<FileId> {
        let mut files = self.files.write();
        if files.by_name.contains_key(name) {
            return Err(anyhow!("file {name} already exists"));
        }
        let file_id = FileId::new(files.next_id);
        files.next_id += 1;
        Ok(file_id)
    }

    fn load_file(&self, name: &str) -> anyhow::Result<FileId> {
        let mut files = self.files.write();
        let Some(file_id) = files.by_name.get(name).copied() else {
            return Err(StorageError::NotFound(format!("file {name}")).into());
        };
        if !files.open.contains_key(&file_id) {
            let file = open_page_file(&self.dir.join(name), false)?;
            let filled = file.metadata()?.len() / self.page_size as u64;
            files.open.insert(
                file_id,
                Arc::new(OpenFile {
                    file,
                    filled: AtomicU64::new(filled),
                }),
            );
        }
        Ok(file_id)
    }

    fn exists(&self, name: &str) -> bool {
        self.files.read().by_name.contains_key(name)
    }

    fn exists_id(&self, file_id: FileId) -> bool {
        self.files.read().registered.contains_key(&file_id)
    }

    fn file_id(&self, name: &str) -> Option<FileId> {
        self.files.read().by_name.get(name).copied()
    }

    fn file_name(&self, file_id: FileId) -> Option<String> {
        self.files.read().registered.get(&file_id).cloned()
    }

    fn load(
        &self,
        file_id: FileId,
        start_page_index: u64,
        page_count: usize,
        add_new_pages: bool,
        cache_hit: &mut bool,
    ) -> anyhow::Result<Vec<Arc<CachePointer>>> {
        let file = self.open_file(file_id)?;
        let filled = file.filled.load(Ordering::SeqCst);

        if start_page_index >= filled {
            if !add_new_pages {
                return Ok(vec![]);
            }
            file.filled.fetch_max(start_page_index + 1, Ordering::SeqCst);
            *cache_hit = true;
            let buffer = self.pool.acquire_direct(true)?;
            log::trace!("page_allocated file_id={file_id} page_index={start_page_index}");
            return Ok(vec![Arc::new(CachePointer::new(
                file_id,
                start_page_index,
                buffer,
            ))]);
        }

        let end = filled.min(start_page_index + page_count.max(1) as u64);
        let in_memory = {
            let dirty = self.dirty.lock();
            (start_page_index..end)
                .map(|page_index| {
                    dirty
                        .get(&(file_id, page_index))
                        .map(|page| page.pointer.clone())
                })
                .collect::<Vec<_>>()
        };
        *cache_hit = in_memory[0].is_some();

        let mut pointers = Vec::with_capacity(in_memory.len());
        for (page_index, pointer) in (start_page_index..end).zip(in_memory) {
            let pointer = match pointer {
                Some(pointer) => pointer,
                None => self.read_page(file_id, &file, page_index)?,
            };
            pointers.push(pointer);
        }
        Ok(pointers)
    }

    fn store(
        &self,
        file_id: FileId,
        page_index: u64,
        pointer: &Arc<CachePointer>,
    ) -> anyhow::Result<StoreFuture> {
        let future = StoreFuture::default();
        let mut dirty = self.dirty.lock();
        match dirty.entry((file_id, page_index)) {
            Entry::Occupied(mut entry) => {
                let page = entry.get_mut();
                if !Arc::ptr_eq(&page.pointer, pointer) {
                    return Err(anyhow!(
                        "page {page_index} of file {file_id} is stored from two different buffers"
                    ));
                }
                page.futures.push(future.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(DirtyPage {
                    pointer: pointer.clone(),
                    futures: vec![future.clone()],
                });
            }
        }
        let over_limit = dirty.len() > self.max_dirty_pages;
        drop(dirty);

        if over_limit {
            log::debug!("dirty_page_limit_reached limit={}", self.max_dirty_pages);
            self.flush()?;
        }
        Ok(future)
    }

    fn flush(&self) -> anyhow::Result<()> {
        self.flush_pages(None)
    }

    fn flush_file(&self, file_id: FileId) -> anyhow::Result<()> {
        self.flush_pages(Some(file_id))
    }

    fn filled_up_to(&self, file_id: FileId) -> anyhow::Result<u64> {
        Ok(self.open_file(file_id)?.filled.load(Ordering::SeqCst))
    }

    fn check_low_disk_space(&self) -> anyhow::Result<bool> {
        let available = fs4::available_space(&self.dir)?;
        let required = self.low_disk_space_threshold
            + (self.dirty.lock().len() * self.page_size) as u64;
        if available >= required {
            return Ok(false);
        }
        log::warn!("low_disk_space available={available} required={required}");
        let listeners = self.low_disk_space_listeners.lock().clone();
        for listener in listeners {
            listener.low_disk_space(available, required);
        }
        Ok(true)
    }

    fn make_fuzzy_checkpoint(&self, next_unit_id: u64) -> anyhow::Result<Lsn> {
        self.wal.flush()?;
        let redo_start = self
            .dirty
            .lock()
            .values()
            .filter_map(|page| page.pointer.dirty_since())
            .min();
        let start = self.wal.log_fuzzy_checkpoint_start(redo_start, next_unit_id)?;
        let end = self.wal.log_fuzzy_checkpoint_end(start)?;
        self.wal.flush()?;
        let cut = self.wal.cut_till(redo_start.unwrap_or(start))?;
        log::debug!(
            "fuzzy_checkpoint start={start} end={end} redo_start={redo_start:?} cut={cut}"
        );
        Ok(end)
    }

    fn truncate_file(&self, file_id: FileId) -> anyhow::Result<()> {
        let file = self.open_file(file_id)?;
        self.drop_dirty_pages(file_id);
        let double_write = self.double_write.lock();
        clear_double_write(&double_write)?;
        file.file.set_len(0)?;
        file.file.sync_all()?;
        file.filled.store(0, Ordering::SeqCst);
        log::debug!("file_truncated file_id={file_id}");
        Ok(())
    }

    fn delete_file(&self, file_id: FileId) -> anyhow::Result<()> {
        self.drop_dirty_pages(file_id);
        let double_write = self.double_write.lock();
        clear_double_write(&double_write)?;
        let mut files = self.files.write();
        let Some(name) = files.registered.remove(&file_id) else {
            return Err(StorageError::NotFound(format!("file {file_id}")).into());
        };
        files.by_name.remove(&name);
        files.open.remove(&file_id);
        self.persist_registry(&files)?;
        drop(files);

        match std::fs::remove_file(self.dir.join(&name)) {
            Ok(()) => (),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
            Err(err) => return Err(err.into()),
        }
        log::debug!("file_deleted name={name} file_id={file_id}");
        Ok(())
    }

    fn close_file(&self, file_id: FileId, flush: bool) -> anyhow::Result<()> {
        if flush {
            self.flush_file(file_id)?;
        } else {
            self.drop_dirty_pages(file_id);
        }
        let _double_write = self.double_write.lock();
        if let Some(file) = self.files.write().open.remove(&file_id) {
            file.file.sync_all()?;
        }
        log::debug!("file_closed file_id={file_id}");
        Ok(())
    }

    fn add_low_disk_space_listener(&self, listener: Arc<dyn LowDiskSpaceListener>) {
        self.low_disk_space_listeners.lock().push(listener);
    }

    fn remove_low_disk_space_listener(&self, listener: &Arc<dyn LowDiskSpaceListener>) {
        remove_listener(&mut self.low_disk_space_listeners.lock(), listener);
    }

    fn add_background_exception_listener(&self, listener: Arc<dyn BackgroundExceptionListener>) {
        self.background_exception_listeners.lock().push(listener);
    }

    fn remove_background_exception_listener(
        &self,
        listener: &Arc<dyn BackgroundExceptionListener>,
    ) {
        remove_listener(&mut self.background_exception_listeners.lock(), listener);
    }

    fn close(&self) -> anyhow::Result<()> {
        self.stop_background_flush();
        self.flush()?;
        let mut files = self.files.write();
        for file in files.open.values() {
            file.file.sync_all()?;
        }
        files.open.clear();
        log::debug!("write_cache_closed dir={:?}", self.dir);
        Ok(())
    }
}

impl Drop for FileWriteCache {
    fn drop(&mut self) {
        self.stop_background_flush();
    }
}
