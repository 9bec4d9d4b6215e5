// Write-ahead log: records and the append-only log manager.
//
// A record is serialized contiguously in host-native byte order:
//
// ```text
// | type (4) | size (4) | txn_id (8) | prev_lsn (8) |           <- header
// | page_id (8) | slot_id (4) | old_len (4) | old bytes |       <- Update only
// | new_len (4) | new bytes |
// ```
//
// Within a transaction, records form a reverse-linked chain through
// `prev_lsn`, ending at the sentinel; rollback walks this chain backward.
// A record never spans a log page, so the LSN is simply
// `page_id * PAGE_SIZE + page_offset`.

use parking_lot::Mutex;

use crate::buffer::BufferPoolManager;
use crate::common::{
    Lsn, PageId, SlotId, TxnId, INVALID_LSN, INVALID_PAGE_ID, INVALID_SLOT_ID, PAGE_SIZE,
};
use crate::error::{DbError, Result};

pub const LOG_RECORD_HEADER_SIZE: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LogRecordType {
    Invalid = 0,
    Update = 1,
    Begin = 2,
    Commit = 3,
    Abort = 4,
}

impl LogRecordType {
    fn from_u32(value: u32) -> LogRecordType {
        match value {
            1 => LogRecordType::Update,
            2 => LogRecordType::Begin,
            3 => LogRecordType::Commit,
            4 => LogRecordType::Abort,
            _ => LogRecordType::Invalid,
        }
    }
}

/// One log record. Only `Update` records carry a payload; updates are
/// fixed-length, so the before and after images always have equal size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    record_type: LogRecordType,
    size: u32,
    txn_id: TxnId,
    prev_lsn: Lsn,
    page_id: PageId,
    slot_id: SlotId,
    old_data: Vec<u8>,
    new_data: Vec<u8>,
}

impl LogRecord {
    /// A payload-free record (`Invalid`, `Begin`, `Commit`, `Abort`).
    pub fn new(record_type: LogRecordType, txn_id: TxnId, prev_lsn: Lsn) -> LogRecord {
        debug_assert!(record_type != LogRecordType::Update);
        LogRecord {
            record_type,
            size: LOG_RECORD_HEADER_SIZE as u32,
            txn_id,
            prev_lsn,
            page_id: INVALID_PAGE_ID,
            slot_id: INVALID_SLOT_ID,
            old_data: Vec::new(),
            new_data: Vec::new(),
        }
    }

    /// An `Update` record carrying before and after images of equal size.
    pub fn update(
        txn_id: TxnId,
        prev_lsn: Lsn,
        page_id: PageId,
        slot_id: SlotId,
        old_data: Vec<u8>,
        new_data: Vec<u8>,
    ) -> LogRecord {
        assert_eq!(old_data.len(), new_data.len(), "updates are fixed-length");
        let size = LOG_RECORD_HEADER_SIZE + 8 + 4 + 4 + old_data.len() + 4 + new_data.len();
        LogRecord {
            record_type: LogRecordType::Update,
            size: size as u32,
            txn_id,
            prev_lsn,
            page_id,
            slot_id,
            old_data,
            new_data,
        }
    }

    pub fn record_type(&self) -> LogRecordType {
        self.record_type
    }

    /// Serialized size in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn prev_lsn(&self) -> Lsn {
        self.prev_lsn
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn slot_id(&self) -> SlotId {
        self.slot_id
    }

    pub fn old_data(&self) -> &[u8] {
        &self.old_data
    }

    pub fn new_data(&self) -> &[u8] {
        &self.new_data
    }

    /// Serializes into `buf`, which must hold at least `size()` bytes.
    pub fn serialize_into(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&(self.record_type as u32).to_ne_bytes());
        buf[4..8].copy_from_slice(&self.size.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.txn_id.to_ne_bytes());
        buf[16..24].copy_from_slice(&self.prev_lsn.to_ne_bytes());
        if self.record_type != LogRecordType::Update {
            return;
        }
        let mut pos = LOG_RECORD_HEADER_SIZE;
        buf[pos..pos + 8].copy_from_slice(&self.page_id.to_ne_bytes());
        pos += 8;
        buf[pos..pos + 4].copy_from_slice(&self.slot_id.to_ne_bytes());
        pos += 4;
        buf[pos..pos + 4].copy_from_slice(&(self.old_data.len() as u32).to_ne_bytes());
        pos += 4;
        buf[pos..pos + self.old_data.len()].copy_from_slice(&self.old_data);
        pos += self.old_data.len();
        buf[pos..pos + 4].copy_from_slice(&(self.new_data.len() as u32).to_ne_bytes());
        pos += 4;
        buf[pos..pos + self.new_data.len()].copy_from_slice(&self.new_data);
    }

    /// Deserializes a record starting at `buf[0]`.
    pub fn deserialize(buf: &[u8]) -> LogRecord {
        let record_type = LogRecordType::from_u32(read_u32(buf, 0));
        let txn_id = read_i64(buf, 8);
        let prev_lsn = read_i64(buf, 16);
        if record_type != LogRecordType::Update {
            return LogRecord::new(record_type, txn_id, prev_lsn);
        }
        let mut pos = LOG_RECORD_HEADER_SIZE;
        let page_id = read_i64(buf, pos);
        pos += 8;
        let slot_id = read_u32(buf, pos) as SlotId;
        pos += 4;
        let old_len = read_u32(buf, pos) as usize;
        pos += 4;
        let old_data = buf[pos..pos + old_len].to_vec();
        pos += old_len;
        let new_len = read_u32(buf, pos) as usize;
        pos += 4;
        let new_data = buf[pos..pos + new_len].to_vec();
        LogRecord::update(txn_id, prev_lsn, page_id, slot_id, old_data, new_data)
    }
}

fn read_u32(buf: &[u8], pos: usize) -> u32 {
    u32::from_ne_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
}

fn read_i64(buf: &[u8], pos: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[pos..pos + 8]);
    i64::from_ne_bytes(bytes)
}

struct LogCursor {
    page_id: PageId,
    page_offset: usize,
}

/// Appends records to log pages allocated through the buffer pool.
///
/// Flushing the page that holds a `Commit` record makes everything before
/// it durable, because pages are filled strictly in append order and each
/// full page is flushed before the cursor moves on.
pub struct LogManager {
    buffer: BufferPoolManager,
    cursor: Mutex<LogCursor>,
}

impl LogManager {
    /// Creates a log manager with a freshly allocated first log page.
    pub fn new(buffer: BufferPoolManager) -> Result<LogManager> {
        let page = buffer.new_page()?.ok_or(DbError::BufferPoolExhausted)?;
        let page_id = page.page_id();
        drop(page);
        Ok(LogManager {
            buffer,
            cursor: Mutex::new(LogCursor {
                page_id,
                page_offset: 0,
            }),
        })
    }

    /// Appends a record and returns its LSN.
    ///
    /// A record larger than a page is rejected with `INVALID_LSN`. When the
    /// record would overflow the current page, that page is flushed and a
    /// new one allocated first.
    pub fn append_record(&self, record: &LogRecord) -> Result<Lsn> {
        let record_size = record.size() as usize;
        if record_size > PAGE_SIZE {
            return Ok(INVALID_LSN);
        }
        let mut cursor = self.cursor.lock();
        if cursor.page_offset + record_size > PAGE_SIZE {
            self.buffer.flush_page(cursor.page_id)?;
            let page = self.buffer.new_page()?.ok_or(DbError::BufferPoolExhausted)?;
            cursor.page_id = page.page_id();
            cursor.page_offset = 0;
        }
        let mut page = self
            .buffer
            .fetch_page(cursor.page_id)?
            .ok_or(DbError::BufferPoolExhausted)?;
        let offset = cursor.page_offset;
        record.serialize_into(&mut page.data_mut()[offset..offset + record_size]);
        cursor.page_offset += record_size;
        Ok(cursor.page_id * PAGE_SIZE as i64 + offset as i64)
    }

    /// Reads the record at `lsn` back from the log.
    pub fn get_record(&self, lsn: Lsn) -> Result<LogRecord> {
        debug_assert_ne!(lsn, INVALID_LSN);
        let _cursor = self.cursor.lock();
        let page_id = lsn / PAGE_SIZE as i64;
        let offset = (lsn % PAGE_SIZE as i64) as usize;
        let page = self
            .buffer
            .fetch_page(page_id)?
            .ok_or_else(|| DbError::Storage(format!("log page {page_id} is not allocated")))?;
        Ok(LogRecord::deserialize(&page.data()[offset..]))
    }

    /// Flushes the current log page; the WAL durability point for commits.
    pub fn flush(&self) -> Result<()> {
        let cursor = self.cursor.lock();
        self.buffer.flush_page(cursor.page_id)?;
        Ok(())
    }
}
