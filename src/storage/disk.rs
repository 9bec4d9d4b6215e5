// Disk space manager: a bitmap-indexed page allocator over a single file.
//
// File layout:
//
// ```text
// [Master][Header 0][Data 0 .. Data 32767][Header 1][Data 32768 ..] ...
// ```
//
// The master page holds 2048 16-bit counters, one per header page, each
// counting the data pages allocated under that header. A header page is a
// bitmap of 32768 bits, one per managed data page. The master page and all
// live header pages are cached in memory for the process lifetime and
// flushed on every modification; this cache is separate from the buffer
// pool's.
//
// All I/O is synchronous. The file is opened for direct I/O where the
// filesystem supports it, so every buffer handed to the kernel is
// page-aligned.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use log::warn;
use parking_lot::Mutex;

use crate::common::{PageId, DATA_PAGES_PER_HEADER, MAX_HEADER_PAGES, PAGE_SIZE};
use crate::error::{DbError, Result};

/// Page-sized buffer aligned for direct I/O.
#[repr(align(4096))]
struct AlignedPage([u8; PAGE_SIZE]);

impl AlignedPage {
    fn boxed_zeroed() -> Box<AlignedPage> {
        Box::new(AlignedPage([0; PAGE_SIZE]))
    }
}

fn read_page_at(file: &mut File, offset: u64, page_data: &mut [u8]) -> Result<()> {
    debug_assert_eq!(page_data.len(), PAGE_SIZE);
    let mut aligned = AlignedPage::boxed_zeroed();
    let file_size = file.metadata()?.len();
    if offset >= file_size {
        return Err(DbError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("read past end of file (offset = {offset}, file size = {file_size})"),
        )));
    }
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut aligned.0)?;
    page_data.copy_from_slice(&aligned.0);
    Ok(())
}

fn write_page_at(file: &mut File, offset: u64, page_data: &[u8]) -> Result<()> {
    debug_assert_eq!(page_data.len(), PAGE_SIZE);
    let mut aligned = AlignedPage::boxed_zeroed();
    aligned.0.copy_from_slice(page_data);
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&aligned.0)?;
    Ok(())
}

fn bit(bitmap: &[u8], index: usize) -> bool {
    bitmap[index / 8] & (1 << (index % 8)) != 0
}

fn set_bit(bitmap: &mut [u8], index: usize) {
    bitmap[index / 8] |= 1 << (index % 8);
}

fn clear_bit(bitmap: &mut [u8], index: usize) {
    bitmap[index / 8] &= !(1 << (index % 8));
}

struct DiskInner {
    file: File,
    master_page: Box<[u16; MAX_HEADER_PAGES]>,
    header_pages: Vec<Option<Box<AlignedPage>>>,
}

impl DiskInner {
    fn flush_master_page(&mut self) -> Result<()> {
        let mut page = [0u8; PAGE_SIZE];
        for (i, counter) in self.master_page.iter().enumerate() {
            page[i * 2..i * 2 + 2].copy_from_slice(&counter.to_ne_bytes());
        }
        write_page_at(&mut self.file, 0, &page)
    }

    fn read_master_page(&mut self) -> Result<()> {
        let mut page = [0u8; PAGE_SIZE];
        read_page_at(&mut self.file, 0, &mut page)?;
        for i in 0..MAX_HEADER_PAGES {
            self.master_page[i] = u16::from_ne_bytes([page[i * 2], page[i * 2 + 1]]);
        }
        Ok(())
    }

    fn flush_header_page(&mut self, index: usize) -> Result<()> {
        if let Some(header) = &self.header_pages[index] {
            write_page_at(&mut self.file, header_page_offset(index), &header.0)?;
        }
        Ok(())
    }

    fn read_header_page(&mut self, index: usize) -> Result<()> {
        let header = self.header_pages[index].get_or_insert_with(AlignedPage::boxed_zeroed);
        read_page_at(&mut self.file, header_page_offset(index), &mut header.0)
    }
}

/// Interleaved header pages shift a data page's file position: skip the
/// master page, the first header page, and one extra header page for every
/// full group of `DATA_PAGES_PER_HEADER` data pages before it.
fn data_page_offset(page_id: PageId) -> u64 {
    (page_id + 2 + page_id / DATA_PAGES_PER_HEADER as i64) as u64 * PAGE_SIZE as u64
}

fn header_page_offset(index: usize) -> u64 {
    ((index * DATA_PAGES_PER_HEADER + index + 1) * PAGE_SIZE) as u64
}

/// Two-level disk space manager: with 4 KiB pages it addresses up to
/// `2048 * 32768` data pages (256 GiB) in one file.
///
/// All operations serialize on a single internal mutex; the disk manager is
/// a shared resource but not contention-tuned.
pub struct DiskManager {
    path: PathBuf,
    inner: Mutex<DiskInner>,
}

impl DiskManager {
    /// Opens or creates the database file at `path`.
    ///
    /// A new file gets a zeroed master page. For an existing file the master
    /// page is read back, followed by every header page up to the highest
    /// one with a nonzero allocation counter.
    pub fn open(path: impl AsRef<Path>) -> Result<DiskManager> {
        let path = path.as_ref().to_path_buf();
        let file = open_database_file(&path)?;
        let mut inner = DiskInner {
            file,
            master_page: Box::new([0; MAX_HEADER_PAGES]),
            header_pages: (0..MAX_HEADER_PAGES).map(|_| None).collect(),
        };
        if inner.file.metadata()?.len() == 0 {
            inner.flush_master_page()?;
        } else {
            inner.read_master_page()?;
            let max_live_header = (0..MAX_HEADER_PAGES).rev().find(|&i| inner.master_page[i] > 0);
            if let Some(max_live_header) = max_live_header {
                for index in 0..=max_live_header {
                    inner.read_header_page(index)?;
                }
            }
        }
        Ok(DiskManager {
            path,
            inner: Mutex::new(inner),
        })
    }

    /// Allocates a zeroed page and returns its id.
    pub fn alloc_page(&self) -> Result<PageId> {
        let mut inner = self.inner.lock();
        let header_index = (0..MAX_HEADER_PAGES)
            .find(|&i| (inner.master_page[i] as usize) < DATA_PAGES_PER_HEADER)
            .ok_or_else(|| DbError::Storage("database file is full".into()))?;

        let header = inner.header_pages[header_index].get_or_insert_with(AlignedPage::boxed_zeroed);
        let page_index = (0..DATA_PAGES_PER_HEADER)
            .find(|&i| !bit(&header.0, i))
            .ok_or_else(|| {
                DbError::Internal(format!(
                    "header page {header_index} is full but its master counter is not"
                ))
            })?;
        set_bit(&mut header.0, page_index);

        let page_id = (header_index * DATA_PAGES_PER_HEADER + page_index) as PageId;
        let zeros = [0u8; PAGE_SIZE];
        write_page_at(&mut inner.file, data_page_offset(page_id), &zeros)?;
        inner.master_page[header_index] += 1;
        inner.flush_master_page()?;
        inner.flush_header_page(header_index)?;
        Ok(page_id)
    }

    /// Deallocates a page. Freeing a page that is not allocated is an error,
    /// never silently ignored.
    pub fn free_page(&self, page_id: PageId) -> Result<()> {
        let mut inner = self.inner.lock();
        let (header_index, page_index) = split_page_id(page_id).ok_or_else(|| double_free(page_id))?;
        let header = inner.header_pages[header_index]
            .as_mut()
            .ok_or_else(|| double_free(page_id))?;
        if !bit(&header.0, page_index) {
            return Err(double_free(page_id));
        }
        clear_bit(&mut header.0, page_index);
        inner.master_page[header_index] -= 1;
        inner.flush_master_page()?;
        inner.flush_header_page(header_index)?;
        Ok(())
    }

    /// Reads a page into `page_data` (`PAGE_SIZE` bytes).
    pub fn read_page(&self, page_id: PageId, page_data: &mut [u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        read_page_at(&mut inner.file, data_page_offset(page_id), page_data)
    }

    /// Writes `page_data` (`PAGE_SIZE` bytes) to a page.
    pub fn write_page(&self, page_id: PageId, page_data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        write_page_at(&mut inner.file, data_page_offset(page_id), page_data)
    }

    /// Whether the page's bit is set in its header bitmap.
    pub fn page_allocated(&self, page_id: PageId) -> bool {
        let Some((header_index, page_index)) = split_page_id(page_id) else {
            return false;
        };
        let inner = self.inner.lock();
        match &inner.header_pages[header_index] {
            Some(header) => bit(&header.0, page_index),
            None => false,
        }
    }
}

impl fmt::Debug for DiskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskManager").field("path", &self.path).finish()
    }
}

fn split_page_id(page_id: PageId) -> Option<(usize, usize)> {
    if page_id < 0 || page_id as usize >= MAX_HEADER_PAGES * DATA_PAGES_PER_HEADER {
        return None;
    }
    Some((
        page_id as usize / DATA_PAGES_PER_HEADER,
        page_id as usize % DATA_PAGES_PER_HEADER,
    ))
}

fn double_free(page_id: PageId) -> DbError {
    DbError::Io(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("cannot free unallocated page (page id = {page_id})"),
    ))
}

fn open_database_file(path: &Path) -> Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true);
    match options
        .clone()
        .custom_flags(libc::O_DIRECT | libc::O_SYNC)
        .open(path)
    {
        Ok(file) => Ok(file),
        // tmpfs and some network filesystems reject O_DIRECT at open time
        Err(err) => {
            warn!(
                "direct I/O unavailable for {} ({err}), using synchronous buffered I/O",
                path.display()
            );
            options
                .custom_flags(libc::O_SYNC)
                .open(path)
                .map_err(DbError::from)
        }
    }
}
