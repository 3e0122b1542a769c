// Java version: Copyright (C) 2010 Square, Inc.
// Rust version: Copyright (C) 2019 ING Systems
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! `record-queue` is a reliable, efficient, file-based FIFO of opaque byte
//! records. Records are appended at the tail through a write stream and
//! consumed from the head with `peek` + `remove`, so a record is only
//! discarded after it has been processed successfully. The backing file is
//! structured to survive process and system crashes: a modification is not
//! visible until the checksummed file header has been committed, and a
//! partially written batch is simply ignored on the next open.

// `error_chain!` can recurse deeply
#![recursion_limit = "1024"]

#[macro_use]
extern crate error_chain;

use std::cell::Cell;
use std::cmp::min;
use std::fmt;
use std::fs::{rename, File, OpenOptions};
use std::io;
use std::io::prelude::*;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, error, trace, warn};

error_chain! {
    foreign_links {
        Io(::std::io::Error);
    }

    errors {
        Argument(msg: String) {
            description("invalid argument")
            display("invalid argument: {}", msg)
        }
        NoSuchElement(requested: usize, available: usize) {
            description("no such element")
            display("cannot remove more elements ({}) than present in queue ({})",
                requested, available)
        }
        Closed {
            description("closed")
        }
        ConcurrentModification {
            description("concurrent modification")
            display("queue was modified while a read stream or iterator was active")
        }
        CapacityExceeded(needed: u64, available: u64) {
            description("capacity exceeded")
            display("data does not fit in queue: {} bytes needed but at most {} available",
                needed, available)
        }
        TooManyElements {
            description("too many elements")
        }
        ElementTooBig {
            description("element too big")
        }
        CorruptedFile(msg: String) {
            description("corrupted file")
            display("corrupted file: {}", msg)
        }
        UnsupportedVersion(detected: u32, supported: u32) {
            description("unsupported version")
            display("unsupported version {}. supported version is {}", detected, supported)
        }
    }
}

/// QueueFile is a lightning-fast, transactional, file-based FIFO.
///
/// Additions and removals are O(1) and atomic. Writes are synchronous; data
/// is forced to disk before a commit returns. A batch of one or more
/// elements is appended through an [`ElementOutputStream`] and becomes
/// visible only when the stream is closed.
///
/// The underlying file is a ring buffer. A modification isn't committed or
/// visible until the file header is written, and the header is small enough
/// that the file system can write it atomically. Storing the file length in
/// the header ensures recovery from a failed expansion (i.e. if setting the
/// file length succeeds but the process dies before the data can be copied)
/// and from a failed truncation.
///
/// # Example
/// ```no_run
/// use std::io::Read;
/// use record_queue::QueueFile;
///
/// let mut qf = QueueFile::open("example.rq").expect("cannot open queue file");
/// qf.add(b"Welcome to QueueFile!").expect("add failed");
///
/// if let Some(mut stream) = qf.peek().expect("peek failed") {
///     let mut data = Vec::new();
///     stream.read_to_end(&mut data).expect("read failed");
///     assert_eq!(&data[..], b"Welcome to QueueFile!");
/// }
///
/// qf.remove(1).expect("remove failed");
/// ```
/// # File format
///
/// ```text
///   36 bytes         Header
///   ...              Data
///
/// Header:
///   4 bytes          Version, always 1
///   8 bytes          File length
///   4 bytes          Element count
///   8 bytes          Head element position
///   8 bytes          Tail element position
///   4 bytes          Header checksum
///
/// Element:
///   4 bytes          Data length `n`
///   1 byte           Element header checksum
///   `n` bytes        Data
/// ```
/// All integers are big-endian. The data region `[36, file length)` is a
/// ring: element data (but never an element header) may wrap from the end of
/// the file back to offset 36.
pub struct QueueFile {
    /// Memory map of the whole file, `file_len` bytes. Recreated on every
    /// length change.
    data_map: MmapMut,
    /// Separate map of the first `HEADER_LENGTH` bytes. Its offset range
    /// never moves, so it is created once and outlives `data_map`
    /// recreations. Flushing it is the commit point.
    header_map: MmapMut,
    file: File,
    /// File name, for logging purposes.
    path: PathBuf,
    /// Hard cap on the file length in bytes.
    max_size: u64,
    /// Cached file length. A power of two unless growth clamped it to
    /// `max_size`.
    file_len: u64,
    /// Number of elements.
    elem_cnt: usize,
    /// Pointer to first (or eldest) element.
    first: Element,
    /// Pointer to last (or newest) element.
    last: Element,
    /// Incremented on every committed structural change and on in-place
    /// compaction during growth. Iterators and read streams snapshot it at
    /// creation and fail once it moves. A `Cell` so the corruption path can
    /// invalidate through a shared borrow.
    mod_count: Cell<u32>,
    closed: Cell<bool>,
    /// Buffer used by `write_header`.
    header_buf: BytesMut,
}

impl QueueFile {
    /// Initial file size and the smallest the file ever gets; one file
    /// system block.
    pub const INITIAL_LENGTH: u64 = 4096;
    /// The queue header length in bytes.
    pub const HEADER_LENGTH: u64 = 36;

    const VERSIONED_HEADER: u32 = 0x0000_0001;
    const DEFAULT_MAX_SIZE: u64 = i64::max_value() as u64;

    fn init(path: &Path) -> Result<()> {
        let tmp_path = path.with_extension(".tmp");

        // Use a temp file so we don't leave a partially-initialized file.
        {
            let mut file =
                OpenOptions::new().read(true).write(true).create(true).open(&tmp_path)?;

            file.set_len(QueueFile::INITIAL_LENGTH)?;
            file.seek(SeekFrom::Start(0))?;

            let mut buf = BytesMut::with_capacity(QueueFile::HEADER_LENGTH as usize);

            buf.put_u32(QueueFile::VERSIONED_HEADER);
            buf.put_u64(QueueFile::INITIAL_LENGTH);
            buf.put_u32(0);
            buf.put_u64(0);
            buf.put_u64(0);
            buf.put_u32(header_hash(QueueFile::VERSIONED_HEADER, QueueFile::INITIAL_LENGTH, 0, 0, 0));

            file.write_all(buf.as_ref())?;
            file.sync_all()?;
        }

        // A rename is atomic.
        rename(tmp_path, path)?;

        Ok(())
    }

    /// Opens the queue file at `path`, creating and initializing it if it
    /// does not exist, with no practical cap on the file length.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<QueueFile> {
        Self::with_max_size(path, Self::DEFAULT_MAX_SIZE)
    }

    /// Opens the queue file at `path` with a hard cap on the backing file
    /// length. Appends that would require growing past `max_size` fail with
    /// a capacity error. `max_size` must be at least `INITIAL_LENGTH`.
    pub fn with_max_size<P: AsRef<Path>>(path: P, max_size: u64) -> Result<QueueFile> {
        if max_size < Self::INITIAL_LENGTH {
            bail!(ErrorKind::Argument(format!(
                "maximum file size must be at least {} bytes, got {}",
                Self::INITIAL_LENGTH,
                max_size
            )));
        }

        let path = path.as_ref();

        if !path.exists() {
            QueueFile::init(path)?;
        }

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let actual_len = file.metadata()?.len();

        if actual_len < Self::HEADER_LENGTH {
            bail!(ErrorKind::CorruptedFile(format!(
                "file is too short ({} bytes) to hold a queue header",
                actual_len
            )));
        }

        let header_map =
            unsafe { MmapOptions::new().len(Self::HEADER_LENGTH as usize).map_mut(&file)? };

        let mut buf: &[u8] = &header_map[..];

        let version = buf.get_u32();
        if version != Self::VERSIONED_HEADER {
            bail!(ErrorKind::UnsupportedVersion(version, Self::VERSIONED_HEADER));
        }

        let file_len = buf.get_u64();
        let elem_cnt = buf.get_u32() as usize;
        let first_pos = buf.get_u64();
        let last_pos = buf.get_u64();
        let stored_hash = buf.get_u32();

        if file_len > max_size {
            bail!(ErrorKind::Argument(format!(
                "queue file length {} is larger than the maximum size {}",
                file_len, max_size
            )));
        }
        if file_len > actual_len {
            // The header is authoritative; a file shorter than it claims has
            // lost data.
            bail!(ErrorKind::CorruptedFile(format!(
                "file is truncated. expected length was {} but actual length is {}",
                file_len, actual_len
            )));
        }
        if file_len < Self::INITIAL_LENGTH {
            bail!(ErrorKind::CorruptedFile(format!(
                "length stored in header ({}) is invalid",
                file_len
            )));
        }
        for &pos in &[first_pos, last_pos] {
            if pos != 0 && (pos < Self::HEADER_LENGTH || pos >= file_len) {
                bail!(ErrorKind::CorruptedFile(format!(
                    "element position {} is outside of the data region",
                    pos
                )));
            }
        }
        if stored_hash != header_hash(version, file_len, elem_cnt as u32, first_pos, last_pos) {
            bail!(ErrorKind::CorruptedFile("header checksum mismatch".into()));
        }

        // `file_len` may be smaller than the on-disk size if a truncation
        // never completed; the extra bytes are unreachable and harmless.
        let data_map = unsafe { MmapOptions::new().len(file_len as usize).map_mut(&file)? };

        let mut queue_file = QueueFile {
            data_map,
            header_map,
            file,
            path: path.to_path_buf(),
            max_size,
            file_len,
            elem_cnt,
            first: Element::EMPTY,
            last: Element::EMPTY,
            mod_count: Cell::new(0),
            closed: Cell::new(false),
            header_buf: BytesMut::with_capacity(Self::HEADER_LENGTH as usize),
        };

        queue_file.first = queue_file.read_element(first_pos)?;
        queue_file.last = queue_file.read_element(last_pos)?;

        Ok(queue_file)
    }

    /// Returns true if this queue contains no entries.
    pub fn is_empty(&self) -> bool {
        self.elem_cnt == 0
    }

    /// Returns the number of elements in this queue.
    pub fn size(&self) -> usize {
        self.elem_cnt
    }

    /// Current length of the backing file in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_len
    }

    /// The cap on the backing file length supplied at open time.
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Number of bytes of the file occupied by the header and the stored
    /// elements.
    pub fn used_bytes(&self) -> u64 {
        if self.elem_cnt == 0 {
            QueueFile::HEADER_LENGTH
        } else if self.last.pos >= self.first.pos {
            // Contiguous queue.
            (self.last.next_position() - self.first.pos) + QueueFile::HEADER_LENGTH
        } else {
            // tail < head. The queue wraps.
            self.last.next_position() + self.file_len - self.first.pos
        }
    }

    /// Adds an element to the end of the queue as its own batch. Empty
    /// payloads are silently ignored.
    pub fn add(&mut self, buf: &[u8]) -> Result<()> {
        if self.elem_cnt + 1 > i32::max_value() as usize {
            bail!(ErrorKind::TooManyElements);
        }

        let mut stream = self.element_output_stream()?;
        stream.write(buf)?;
        stream.close()
    }

    /// Returns a stream over the eldest element's payload, or `None` if the
    /// queue is empty.
    pub fn peek(&self) -> Result<Option<ElementInputStream<'_>>> {
        self.require_not_closed()?;

        if self.is_empty() {
            Ok(None)
        } else {
            Ok(Some(ElementInputStream::new(self, self.first)))
        }
    }

    /// Returns an iterator yielding a read stream per element, from head to
    /// tail. Any structural change to the queue invalidates the iterator
    /// and its streams. Removal through the iterator is not supported.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            queue_file: self,
            next_elem_index: 0,
            next_elem_pos: self.first.pos,
            expected_mod_count: self.mod_count.get(),
        }
    }

    /// Returns a write stream positioned just past the current tail. One or
    /// more elements written to it become visible as a single batch when
    /// the stream is closed.
    pub fn element_output_stream(&mut self) -> Result<ElementOutputStream<'_>> {
        self.require_not_closed()?;

        let pos = self.wrap_pos(self.last.next_position());
        Ok(ElementOutputStream::new(self, pos))
    }

    /// Removes the eldest `n` elements.
    pub fn remove(&mut self, n: usize) -> Result<()> {
        self.require_not_closed()?;

        if n == 0 {
            return Ok(());
        }
        if n == self.elem_cnt {
            return self.clear();
        }
        if n > self.elem_cnt {
            bail!(ErrorKind::NoSuchElement(n, self.elem_cnt));
        }

        // Read the position and length of the new first element.
        let mut new_first = self.first;
        for _ in 0..n {
            new_first = self.read_element(self.wrap_pos(new_first.next_position()))?;
        }

        // Commit the header.
        self.bump_mod_count();
        let file_len = self.file_len;
        let elem_cnt = self.elem_cnt - n;
        let last_pos = self.last.pos;
        self.write_header(file_len, elem_cnt, new_first.pos, last_pos)?;
        self.elem_cnt = elem_cnt;
        self.first = new_first;

        // Truncation is best-effort; the removal above has already been
        // committed.
        if let Err(e) = self.try_shrink() {
            warn!("failed to shrink {:?}: {}", self, e);
        }

        Ok(())
    }

    /// Clears this queue. Truncates the file to the initial size.
    pub fn clear(&mut self) -> Result<()> {
        self.require_not_closed()?;

        // Commit the empty state before truncating. If we crash in between,
        // the stored length is smaller than the file, which open() accepts.
        self.bump_mod_count();
        self.write_header(QueueFile::INITIAL_LENGTH, 0, 0, 0)?;

        self.elem_cnt = 0;
        self.first = Element::EMPTY;
        self.last = Element::EMPTY;

        if self.file_len != QueueFile::INITIAL_LENGTH {
            self.file_len = QueueFile::INITIAL_LENGTH;
            self.update_map_extent()?;
            self.sync_set_len(QueueFile::INITIAL_LENGTH)?;
        }

        Ok(())
    }

    /// Marks the queue closed and flushes both mappings. Every subsequent
    /// operation, including reads through live streams, fails with a closed
    /// error. Closing an already closed queue is a no-op. The mappings and
    /// the file handle are released when the value is dropped.
    pub fn close(&mut self) -> Result<()> {
        if self.closed.get() {
            return Ok(());
        }

        self.closed.set(true);
        self.data_map.flush()?;
        self.header_map.flush()?;

        Ok(())
    }

    fn require_not_closed(&self) -> Result<()> {
        if self.closed.get() {
            bail!(ErrorKind::Closed);
        }
        Ok(())
    }

    fn bump_mod_count(&self) {
        self.mod_count.set(self.mod_count.get().wrapping_add(1));
    }

    /// Writes the queue header. The arguments contain the updated values.
    /// The struct member fields should not have changed yet. This only
    /// updates the state in the file. It's up to the caller to update the
    /// member variables *after* this call succeeds. Assumes the file system
    /// writes the 36-byte block atomically.
    fn write_header(
        &mut self, file_len: u64, elem_cnt: usize, first_pos: u64, last_pos: u64,
    ) -> Result<()> {
        assert!(elem_cnt <= i32::max_value() as usize);
        assert!(file_len <= i64::max_value() as u64);

        self.header_buf.clear();
        self.header_buf.put_u32(QueueFile::VERSIONED_HEADER);
        self.header_buf.put_u64(file_len);
        self.header_buf.put_u32(elem_cnt as u32);
        self.header_buf.put_u64(first_pos);
        self.header_buf.put_u64(last_pos);
        self.header_buf.put_u32(header_hash(
            QueueFile::VERSIONED_HEADER,
            file_len,
            elem_cnt as u32,
            first_pos,
            last_pos,
        ));

        self.header_map[..].copy_from_slice(&self.header_buf[..]);
        self.header_map.flush()?;

        Ok(())
    }

    /// Reads the element header at `pos` and verifies its checksum. A
    /// mismatch means the file can no longer be trusted: the queue is
    /// closed and a corruption error returned.
    fn read_element(&self, pos: u64) -> Result<Element> {
        if pos == 0 {
            return Ok(Element::EMPTY);
        }

        let mut buf = [0u8; Element::HEADER_LENGTH as usize];
        self.ring_read(pos, &mut buf);

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let expected = element_crc(len);

        if buf[4] != expected {
            error!(
                "element at position {} in {:?} failed checksum: computed {:#04x} but stored {:#04x}",
                pos, self, expected, buf[4]
            );
            self.closed.set(true);
            bail!(ErrorKind::CorruptedFile(format!(
                "element at position {} has a corrupt header",
                pos
            )));
        }
        if Element::HEADER_LENGTH + u64::from(len) > self.file_len - QueueFile::HEADER_LENGTH {
            self.closed.set(true);
            bail!(ErrorKind::CorruptedFile(format!(
                "element at position {} is larger ({} bytes) than the data region",
                pos, len
            )));
        }

        Ok(Element::new(pos, len as usize))
    }

    /// Wraps the position if it exceeds the end of the file.
    fn wrap_pos(&self, pos: u64) -> u64 {
        if pos < self.file_len { pos } else { QueueFile::HEADER_LENGTH + pos - self.file_len }
    }

    /// Reads `buf.len()` bytes starting at `pos`. Automatically wraps the
    /// read if it overlaps the end of the file.
    fn ring_read(&self, pos: u64, buf: &mut [u8]) {
        let pos = self.wrap_pos(pos) as usize;
        let n = buf.len();
        let file_len = self.file_len as usize;

        if pos + n <= file_len {
            buf.copy_from_slice(&self.data_map[pos..pos + n]);
        } else {
            // The read overlaps the EOF.
            let before_eof = file_len - pos;
            let header_len = QueueFile::HEADER_LENGTH as usize;

            buf[..before_eof].copy_from_slice(&self.data_map[pos..file_len]);
            buf[before_eof..].copy_from_slice(&self.data_map[header_len..header_len + n - before_eof]);
        }
    }

    /// Writes `buf` starting at `pos`. Automatically wraps the write if it
    /// overlaps the end of the file.
    fn ring_write(&mut self, pos: u64, buf: &[u8]) {
        let pos = self.wrap_pos(pos) as usize;
        let n = buf.len();
        let file_len = self.file_len as usize;

        if pos + n <= file_len {
            self.data_map[pos..pos + n].copy_from_slice(buf);
        } else {
            // The write overlaps the EOF.
            let before_eof = file_len - pos;
            let header_len = QueueFile::HEADER_LENGTH as usize;

            self.data_map[pos..file_len].copy_from_slice(&buf[..before_eof]);
            self.data_map[header_len..header_len + n - before_eof]
                .copy_from_slice(&buf[before_eof..]);
        }
    }

    /// Sets the length of the file (considered metadata) and syncs it to
    /// storage.
    fn sync_set_len(&mut self, new_len: u64) -> Result<()> {
        self.file.set_len(new_len)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Call after a length change to remap the data view to the new extent.
    fn update_map_extent(&mut self) -> Result<()> {
        self.data_map =
            unsafe { MmapOptions::new().len(self.file_len as usize).map_mut(&self.file)? };
        Ok(())
    }

    /// Halves the file length while the contiguous ring fits comfortably in
    /// the candidate. The reduced length is committed in the header before
    /// the file is truncated, so a crash in between leaves a stored length
    /// smaller than the on-disk size, which open() accepts. A queue whose
    /// ring is still wrapped is left alone until a later append makes it
    /// contiguous again.
    fn try_shrink(&mut self) -> Result<()> {
        if self.last.pos < self.first.pos || self.last.next_position() > self.max_size {
            return Ok(());
        }

        let bytes_used = self.used_bytes();
        let max_extent = self.last.next_position();

        let mut new_len = self.file_len;
        let mut goal_len = new_len / 2;

        while goal_len >= QueueFile::INITIAL_LENGTH
            && max_extent <= goal_len
            && bytes_used <= goal_len / 2
        {
            new_len = goal_len;
            goal_len /= 2;
        }

        if new_len >= self.file_len {
            return Ok(());
        }

        debug!("truncating {:?} from {} to {}", self, self.file_len, new_len);

        let elem_cnt = self.elem_cnt;
        let first_pos = self.first.pos;
        let last_pos = self.last.pos;
        self.write_header(new_len, elem_cnt, first_pos, last_pos)?;

        self.file_len = new_len;
        self.update_map_extent()?;
        self.sync_set_len(new_len)?;

        Ok(())
    }
}

impl fmt::Debug for QueueFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueueFile<{}>[length={}, size={}, first={:?}, last={:?}]",
            self.path.display(),
            self.file_len,
            self.elem_cnt,
            self.first,
            self.last
        )
    }
}

/// A pointer to an element: its position in the file and the length of its
/// payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Element {
    pos: u64,
    len: usize,
}

impl Element {
    const EMPTY: Element = Element { pos: 0, len: 0 };
    /// Length of an element header in bytes: 4 length bytes + 1 checksum
    /// byte.
    const HEADER_LENGTH: u64 = 5;

    fn new(pos: u64, len: usize) -> Self {
        assert!(pos <= i64::max_value() as u64);
        assert!(len <= i32::max_value() as usize);

        Element { pos, len }
    }

    /// Offset of the first payload byte, before wrapping.
    fn data_position(&self) -> u64 {
        debug_assert!(self.pos != 0, "empty element has no data position");
        self.pos + Element::HEADER_LENGTH
    }

    /// Offset one past the final payload byte, before wrapping. For the
    /// empty element this is where the first element of an empty queue
    /// starts.
    fn next_position(&self) -> u64 {
        if self.pos == 0 {
            QueueFile::HEADER_LENGTH
        } else {
            self.pos + Element::HEADER_LENGTH + self.len as u64
        }
    }
}

/// Iterator over the elements of a [`QueueFile`], head to tail.
pub struct Iter<'a> {
    queue_file: &'a QueueFile,
    next_elem_index: usize,
    next_elem_pos: u64,
    expected_mod_count: u32,
}

impl<'a> Iterator for Iter<'a> {
    type Item = Result<ElementInputStream<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.queue_file.closed.get() {
            return Some(Err(ErrorKind::Closed.into()));
        }
        if self.queue_file.mod_count.get() != self.expected_mod_count {
            return Some(Err(ErrorKind::ConcurrentModification.into()));
        }
        if self.next_elem_index >= self.queue_file.elem_cnt {
            return None;
        }

        let current = match self.queue_file.read_element(self.next_elem_pos) {
            Ok(elem) => elem,
            Err(e) => return Some(Err(e)),
        };

        self.next_elem_pos = self.queue_file.wrap_pos(current.next_position());
        self.next_elem_index += 1;

        Some(Ok(ElementInputStream::new(self.queue_file, current)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let elems_left = self.queue_file.elem_cnt - self.next_elem_index;

        (elems_left, Some(elems_left))
    }
}

/// A read stream over a single element's payload. Yields exactly
/// `available()` bytes, wrapping around the end of the data region where
/// the payload does. Any structural change to the queue while the stream is
/// live surfaces as an I/O error on the next read.
pub struct ElementInputStream<'a> {
    queue_file: &'a QueueFile,
    cursor: u64,
    total_len: usize,
    bytes_read: usize,
    expected_mod_count: u32,
}

impl std::fmt::Debug for ElementInputStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementInputStream")
            .field("cursor", &self.cursor)
            .field("total_len", &self.total_len)
            .field("bytes_read", &self.bytes_read)
            .field("expected_mod_count", &self.expected_mod_count)
            .finish()
    }
}

impl<'a> ElementInputStream<'a> {
    fn new(queue_file: &'a QueueFile, element: Element) -> Self {
        trace!("opening read stream over {:?}", element);

        ElementInputStream {
            queue_file,
            cursor: queue_file.wrap_pos(element.data_position()),
            total_len: element.len,
            bytes_read: 0,
            expected_mod_count: queue_file.mod_count.get(),
        }
    }

    /// Number of payload bytes remaining.
    pub fn available(&self) -> usize {
        self.total_len - self.bytes_read
    }

    /// Advances past up to `n` payload bytes without reading them. Returns
    /// the number of bytes actually skipped.
    pub fn skip(&mut self, n: usize) -> usize {
        let count = min(n, self.total_len - self.bytes_read);

        self.bytes_read += count;
        self.cursor = self.queue_file.wrap_pos(self.cursor + count as u64);

        count
    }

    fn check_for_comodification(&self) -> io::Result<()> {
        if self.queue_file.mod_count.get() != self.expected_mod_count {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "queue was modified while reading an element",
            ));
        }
        Ok(())
    }
}

impl io::Read for ElementInputStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.queue_file.closed.get() {
            return Err(io::Error::new(io::ErrorKind::Other, "closed"));
        }
        if buf.is_empty() || self.bytes_read == self.total_len {
            return Ok(0);
        }
        self.check_for_comodification()?;

        let n = min(buf.len(), self.total_len - self.bytes_read);
        self.queue_file.ring_read(self.cursor, &mut buf[..n]);

        self.cursor = self.queue_file.wrap_pos(self.cursor + n as u64);
        self.bytes_read += n;

        Ok(n)
    }
}

/// A write stream that appends one or more elements past the current tail.
/// After finishing one element, call [`next_element`](Self::next_element) to
/// start the next. Nothing is visible to the queue, or to a reopen after a
/// crash, until [`close`](Self::close) commits the whole batch. Dropping
/// the stream without closing it abandons the batch.
pub struct ElementOutputStream<'a> {
    queue_file: &'a mut QueueFile,
    /// Write position in the data region; always wrapped.
    cursor: u64,
    /// The element being written: its header position and the payload bytes
    /// accumulated so far.
    current: Element,
    new_first: Option<Element>,
    new_last: Option<Element>,
    elements_written: usize,
    /// Running total of bytes this stream has claimed, element headers
    /// included.
    stream_bytes_used: u64,
    closed: bool,
}

impl<'a> ElementOutputStream<'a> {
    fn new(queue_file: &'a mut QueueFile, position: u64) -> Self {
        trace!("opening write stream on {:?} at position {}", queue_file, position);

        ElementOutputStream {
            cursor: position,
            current: Element::new(position, 0),
            queue_file,
            new_first: None,
            new_last: None,
            elements_written: 0,
            stream_bytes_used: 0,
            closed: false,
        }
    }

    /// Appends `buf` to the current element's payload, growing the file if
    /// needed. Fails with a capacity error if the queue cannot fit the data
    /// even at its maximum size; nothing is committed in that case.
    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.check_conditions()?;

        if self.current.len + buf.len() > i32::max_value() as usize {
            bail!(ErrorKind::ElementTooBig);
        }

        self.write_placeholder_if_needed()?;
        self.expand_and_update(buf.len() as u64)?;

        self.queue_file.ring_write(self.cursor, buf);
        self.cursor = self.queue_file.wrap_pos(self.cursor + buf.len() as u64);
        self.current.len += buf.len();

        Ok(())
    }

    /// Finishes the current element and starts the next one. Zero-length
    /// elements are not stored, so always write at least one byte per
    /// element.
    pub fn next_element(&mut self) -> Result<()> {
        self.check_conditions()?;

        if self.current.len == 0 {
            return Ok(());
        }

        let finished = self.current;
        self.new_last = Some(finished);
        if self.new_first.is_none() && self.queue_file.is_empty() {
            self.new_first = Some(finished);
        }

        self.current = Element::new(self.cursor, 0);

        // Replace the zeroed placeholder with the real element header.
        let mut header = [0u8; Element::HEADER_LENGTH as usize];
        header[..4].copy_from_slice(&(finished.len as u32).to_be_bytes());
        header[4] = element_crc(finished.len as u32);
        self.queue_file.ring_write(finished.pos, &header);

        self.elements_written += 1;

        Ok(())
    }

    /// Closes the stream and commits the batch: the data mapping is forced
    /// to storage, then the header is rewritten to point at the new tail.
    /// A failure before the header write leaves the queue logically
    /// unchanged. Closing an already closed stream is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        let result = self.commit();
        self.closed = true;
        result
    }

    fn commit(&mut self) -> Result<()> {
        self.next_element()?;

        if self.elements_written == 0 {
            return Ok(());
        }
        if self.queue_file.elem_cnt + self.elements_written > i32::max_value() as usize {
            bail!(ErrorKind::TooManyElements);
        }

        if let Some(new_last) = self.new_last {
            self.queue_file.last = new_last;
        }
        if let Some(new_first) = self.new_first {
            self.queue_file.first = new_first;
        }
        self.queue_file.elem_cnt += self.elements_written;

        self.queue_file.data_map.flush()?;
        self.queue_file.bump_mod_count();

        let file_len = self.queue_file.file_len;
        let elem_cnt = self.queue_file.elem_cnt;
        let first_pos = self.queue_file.first.pos;
        let last_pos = self.queue_file.last.pos;
        self.queue_file.write_header(file_len, elem_cnt, first_pos, last_pos)
    }

    fn check_conditions(&self) -> Result<()> {
        if self.closed || self.queue_file.closed.get() {
            bail!(ErrorKind::Closed);
        }
        Ok(())
    }

    /// Reserves a zero-filled header slot before the first payload byte of
    /// each element. While the slot is zeroed the element is invisible: a
    /// crash mid-payload leaves a chain that still ends at the committed
    /// tail.
    fn write_placeholder_if_needed(&mut self) -> Result<()> {
        if self.current.len != 0 {
            return Ok(());
        }

        self.expand_and_update(Element::HEADER_LENGTH)?;

        let zeroes = [0u8; Element::HEADER_LENGTH as usize];
        self.queue_file.ring_write(self.cursor, &zeroes);
        self.cursor = self.queue_file.wrap_pos(self.cursor + Element::HEADER_LENGTH);

        Ok(())
    }

    fn increase_bytes_used(&mut self, len: u64) -> Result<u64> {
        self.stream_bytes_used += len;

        let bytes_needed = self.queue_file.used_bytes() + self.stream_bytes_used;
        if bytes_needed > self.queue_file.max_size {
            bail!(ErrorKind::CapacityExceeded(bytes_needed, self.queue_file.max_size));
        }

        Ok(bytes_needed)
    }

    /// Grows the file if the pending bytes no longer fit, making the ring
    /// contiguous again when the write position has wrapped past the head.
    fn expand_and_update(&mut self, len: u64) -> Result<()> {
        let bytes_needed = self.increase_bytes_used(len)?;
        if bytes_needed <= self.queue_file.file_len {
            return Ok(());
        }

        debug!("extending {:?} to fit {} bytes", self.queue_file, bytes_needed);

        let old_len = self.queue_file.file_len;

        // Double the length until the data fits, then clamp.
        let mut new_len = old_len * 2;
        while new_len < bytes_needed {
            new_len *= 2;
        }
        let new_len = min(new_len, self.queue_file.max_size);

        let first_elem_start = self.new_first.unwrap_or(self.queue_file.first).pos;
        // The write position has wrapped behind the live data, or (with an
        // empty queue and nothing finalized yet) all the way around to the
        // start of the region.
        let compact = self.cursor <= first_elem_start
            || (first_elem_start == 0
                && self.cursor == QueueFile::HEADER_LENGTH
                && self.stream_bytes_used > 0);
        let moved = self.cursor - QueueFile::HEADER_LENGTH;

        // At the clamp the relocated suffix must still land below the new
        // length, or the ring cannot be made contiguous.
        if compact && old_len + moved > new_len {
            bail!(ErrorKind::CapacityExceeded(old_len + moved, new_len));
        }

        self.queue_file.data_map.flush()?;
        self.queue_file.file_len = new_len;
        self.queue_file.sync_set_len(new_len)?;
        self.queue_file.update_map_extent()?;

        // If the buffer was split, move the wrapped tail to just after the
        // old end of the data so the ring is contiguous again.
        if compact {
            if moved > 0 {
                let src = QueueFile::HEADER_LENGTH as usize;
                self.queue_file.data_map.copy_within(src..src + moved as usize, old_len as usize);
            }
            self.queue_file.bump_mod_count();

            // Positions inside the moved range shift forward with the copy.
            let position_update = old_len - QueueFile::HEADER_LENGTH;
            if !self.queue_file.is_empty() && self.queue_file.last.pos < first_elem_start {
                self.queue_file.last.pos += position_update;
            }
            if let Some(new_last) = self.new_last.as_mut() {
                if new_last.pos < self.cursor {
                    new_last.pos += position_update;
                }
            }
            if self.current.pos <= first_elem_start {
                self.current.pos += position_update;
            }
            self.cursor += position_update;
        }

        // Commit the expansion.
        let elem_cnt = self.queue_file.elem_cnt;
        let first_pos = self.queue_file.first.pos;
        let last_pos = self.queue_file.last.pos;
        self.queue_file.write_header(new_len, elem_cnt, first_pos, last_pos)?;

        Ok(())
    }
}

/// Folds the four big-endian bytes of an element's data length into the
/// single checksum byte stored in its header.
fn element_crc(value: u32) -> u8 {
    let mut result: u8 = 17;
    for b in &value.to_be_bytes() {
        result = result.wrapping_mul(31).wrapping_add(*b);
    }
    result
}

/// Hash of the queue header fields, stored as the header's final word.
/// Lengths and positions contribute their low 32 bits.
fn header_hash(version: u32, file_len: u64, elem_cnt: u32, first_pos: u64, last_pos: u64) -> u32 {
    let mut result = version;
    result = result.wrapping_mul(31).wrapping_add(file_len as u32);
    result = result.wrapping_mul(31).wrapping_add(elem_cnt);
    result = result.wrapping_mul(31).wrapping_add(first_pos as u32);
    result = result.wrapping_mul(31).wrapping_add(last_pos as u32);
    result
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io::Read;

    use auto_delete_path::AutoDeletePath;
    use pretty_assertions::assert_eq;
    use rand::{thread_rng, Rng};

    use super::*;

    fn gen_rand_data(size: usize) -> Box<[u8]> {
        let mut buf = vec![0u8; size];
        thread_rng().fill(buf.as_mut_slice());

        buf.into_boxed_slice()
    }

    fn read_all(mut stream: ElementInputStream<'_>) -> Vec<u8> {
        let mut data = Vec::with_capacity(stream.available());
        stream.read_to_end(&mut data).unwrap();
        data
    }

    fn collect(qf: &QueueFile) -> Vec<Vec<u8>> {
        qf.iter().map(|stream| read_all(stream.unwrap())).collect()
    }

    #[test]
    fn element_crc_known_values() {
        assert_eq!(element_crc(0), 145);
        assert_eq!(element_crc(1), 146);
        assert_eq!(element_crc(256), 176);
    }

    #[test]
    fn header_hash_known_values() {
        // The empty header of a freshly initialized file.
        assert_eq!(header_hash(1, 4096, 0, 0, 0), 122_947_457);
        assert_ne!(header_hash(1, 4096, 1, 0, 0), header_hash(1, 4096, 0, 0, 0));
    }

    #[test]
    fn empty_queue_round_trip() {
        let path = AutoDeletePath::temp();

        {
            let mut qf = QueueFile::open(&path).unwrap();
            assert_eq!(qf.size(), 0);
            assert!(qf.is_empty());
            assert_eq!(qf.file_size(), 4096);
            qf.close().unwrap();
        }

        let qf = QueueFile::open(&path).unwrap();
        assert_eq!(qf.size(), 0);
        assert!(qf.is_empty());
        assert_eq!(qf.file_size(), 4096);
    }

    #[test]
    fn add_peek_remove() {
        let path = AutoDeletePath::temp();

        {
            let mut qf = QueueFile::open(&path).unwrap();
            qf.add(&[0x41]).unwrap();
            qf.add(&[0x42, 0x43]).unwrap();
            qf.add(&[0x44, 0x45, 0x46]).unwrap();

            assert_eq!(qf.size(), 3);
            assert_eq!(read_all(qf.peek().unwrap().unwrap()), vec![0x41]);

            qf.remove(1).unwrap();
            assert_eq!(read_all(qf.peek().unwrap().unwrap()), vec![0x42, 0x43]);
        }

        let qf = QueueFile::open(&path).unwrap();
        assert_eq!(qf.size(), 2);
        assert_eq!(read_all(qf.peek().unwrap().unwrap()), vec![0x42, 0x43]);
    }

    #[test]
    fn multi_element_batch() {
        let path = AutoDeletePath::temp();
        let mut qf = QueueFile::open(&path).unwrap();

        {
            let mut stream = qf.element_output_stream().unwrap();
            stream.write(&[0x01, 0x02]).unwrap();
            stream.next_element().unwrap();
            stream.write(&[0x03]).unwrap();
            stream.close().unwrap();
        }

        assert_eq!(qf.size(), 2);
        assert_eq!(collect(&qf), vec![vec![0x01, 0x02], vec![0x03]]);
    }

    #[test]
    fn zero_length_elements_are_ignored() {
        let path = AutoDeletePath::temp();
        let mut qf = QueueFile::open(&path).unwrap();

        qf.add(&[]).unwrap();
        assert!(qf.is_empty());

        {
            let mut stream = qf.element_output_stream().unwrap();
            stream.next_element().unwrap();
            stream.write(&[0x07]).unwrap();
            stream.next_element().unwrap();
            stream.next_element().unwrap();
            stream.close().unwrap();
        }

        assert_eq!(qf.size(), 1);
    }

    #[test]
    fn remove_variants() {
        let path = AutoDeletePath::temp();
        let mut qf = QueueFile::open(&path).unwrap();

        qf.add(&[1]).unwrap();
        qf.add(&[2]).unwrap();

        qf.remove(0).unwrap();
        assert_eq!(qf.size(), 2);

        let err = qf.remove(3).unwrap_err();
        match err.kind() {
            ErrorKind::NoSuchElement(requested, available) => {
                assert_eq!(*requested, 3);
                assert_eq!(*available, 2);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // Removing everything resets the file to its initial size.
        qf.remove(2).unwrap();
        assert!(qf.is_empty());
        assert_eq!(qf.file_size(), 4096);
    }

    #[test]
    fn payload_wraps_around_data_region() {
        let path = AutoDeletePath::temp();
        let mut qf = QueueFile::with_max_size(&path, 8192).unwrap();

        let a = gen_rand_data(3500);
        let b = gen_rand_data(3500);
        qf.add(&a).unwrap();
        qf.add(&b).unwrap();
        assert_eq!(qf.file_size(), 8192);

        qf.remove(1).unwrap();

        // This write must wrap across the end of the file.
        let c = gen_rand_data(3500);
        qf.add(&c).unwrap();

        assert_eq!(collect(&qf), vec![b.to_vec(), c.to_vec()]);

        drop(qf);
        let qf = QueueFile::with_max_size(&path, 8192).unwrap();
        assert_eq!(collect(&qf), vec![b.to_vec(), c.to_vec()]);
    }

    #[test]
    fn growth_compacts_wrapped_ring() {
        let path = AutoDeletePath::temp();
        let mut qf = QueueFile::open(&path).unwrap();

        let a = gen_rand_data(2000);
        let b = gen_rand_data(1800);
        qf.add(&a).unwrap();
        qf.add(&b).unwrap();
        qf.remove(1).unwrap();

        // Wraps around the end of the 4096-byte file.
        let c = gen_rand_data(1800);
        qf.add(&c).unwrap();
        assert_eq!(qf.file_size(), 4096);

        // Forces growth while the ring is discontinuous; the wrapped tail
        // has to be relocated.
        let d = gen_rand_data(1000);
        qf.add(&d).unwrap();
        assert_eq!(qf.file_size(), 8192);

        assert_eq!(collect(&qf), vec![b.to_vec(), c.to_vec(), d.to_vec()]);

        drop(qf);
        let qf = QueueFile::open(&path).unwrap();
        assert_eq!(collect(&qf), vec![b.to_vec(), c.to_vec(), d.to_vec()]);
    }

    #[test]
    fn single_large_element_grows_until_fit() {
        let path = AutoDeletePath::temp();
        let mut qf = QueueFile::open(&path).unwrap();

        let data = gen_rand_data(20_000);
        qf.add(&data).unwrap();

        assert_eq!(qf.file_size(), 32_768);
        assert_eq!(read_all(qf.peek().unwrap().unwrap()), data.to_vec());
    }

    #[test]
    fn shrinks_after_drain_and_survives_reopen() {
        let path = AutoDeletePath::temp();

        {
            let mut qf = QueueFile::open(&path).unwrap();

            // Grow to 8192, then drain and refill so the only live element
            // sits near the start of the data region.
            for _ in 0..4 {
                qf.add(&gen_rand_data(1200)).unwrap();
            }
            assert_eq!(qf.file_size(), 8192);
            qf.remove(3).unwrap();
            qf.add(&gen_rand_data(1200)).unwrap();
            qf.add(&gen_rand_data(1200)).unwrap();
            qf.remove(2).unwrap();
            qf.add(&gen_rand_data(1200)).unwrap();
            qf.remove(1).unwrap();
            qf.add(&gen_rand_data(1200)).unwrap();
            qf.remove(1).unwrap();

            assert_eq!(qf.size(), 1);
            assert_eq!(qf.file_size(), 4096);
        }

        let qf = QueueFile::open(&path).unwrap();
        assert_eq!(qf.size(), 1);
        assert_eq!(qf.file_size(), 4096);
    }

    #[test]
    fn capacity_error_leaves_queue_unchanged() {
        let path = AutoDeletePath::temp();
        let mut qf = QueueFile::with_max_size(&path, 4096).unwrap();

        let err = qf.add(&gen_rand_data(5000)).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::CapacityExceeded(..)));

        assert_eq!(qf.size(), 0);
        assert_eq!(qf.file_size(), 4096);

        // The queue stays usable for data that fits.
        qf.add(&[0x2a]).unwrap();
        assert_eq!(qf.size(), 1);
    }

    #[test]
    fn max_size_below_minimum_is_rejected() {
        let path = AutoDeletePath::temp();
        let err = QueueFile::with_max_size(&path, 4095).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Argument(_)));
    }

    #[test]
    fn abandoned_batch_is_not_committed() {
        let path = AutoDeletePath::temp();

        {
            let mut qf = QueueFile::open(&path).unwrap();
            qf.add(&[0x11]).unwrap();

            let mut stream = qf.element_output_stream().unwrap();
            stream.write(&[0x22, 0x23]).unwrap();
            stream.next_element().unwrap();
            stream.write(&[0x24]).unwrap();
            // Dropped without close: the batch must vanish.
        }

        let qf = QueueFile::open(&path).unwrap();
        assert_eq!(qf.size(), 1);
        assert_eq!(collect(&qf), vec![vec![0x11]]);
    }

    #[test]
    fn read_stream_detects_structural_change() {
        let path = AutoDeletePath::temp();
        let mut qf = QueueFile::open(&path).unwrap();
        qf.add(&[1, 2, 3]).unwrap();

        let mut stream = qf.peek().unwrap().unwrap();
        qf.mod_count.set(qf.mod_count.get().wrapping_add(1));

        let mut buf = [0u8; 3];
        let err = stream.read(&mut buf).unwrap_err();
        assert!(err.to_string().contains("modified"));
    }

    #[test]
    fn iterator_detects_structural_change() {
        let path = AutoDeletePath::temp();
        let mut qf = QueueFile::open(&path).unwrap();
        qf.add(&[1]).unwrap();
        qf.add(&[2]).unwrap();

        let mut iter = qf.iter();
        assert!(iter.next().unwrap().is_ok());

        qf.mod_count.set(qf.mod_count.get().wrapping_add(1));
        let err = iter.next().unwrap().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ConcurrentModification));
    }

    #[test]
    fn iterator_yields_in_order() {
        let path = AutoDeletePath::temp();
        let mut qf = QueueFile::open(&path).unwrap();
        let mut q: VecDeque<Box<[u8]>> = VecDeque::with_capacity(128);

        for _ in 0..14 {
            let data = gen_rand_data(thread_rng().gen_range(1..4096));
            qf.add(&data).unwrap();
            q.push_back(data);
        }

        assert_eq!(qf.iter().size_hint(), (14, Some(14)));

        for stream in qf.iter() {
            assert_eq!(read_all(stream.unwrap()), q.pop_front().unwrap().to_vec());
        }

        assert!(q.is_empty());
    }

    #[test]
    fn operations_fail_after_close() {
        let path = AutoDeletePath::temp();
        let mut qf = QueueFile::open(&path).unwrap();
        qf.add(&[1]).unwrap();

        qf.close().unwrap();
        qf.close().unwrap();

        assert!(matches!(qf.peek().unwrap_err().kind(), ErrorKind::Closed));
        assert!(matches!(qf.add(&[2]).unwrap_err().kind(), ErrorKind::Closed));
        assert!(matches!(qf.remove(1).unwrap_err().kind(), ErrorKind::Closed));
        assert!(matches!(qf.clear().unwrap_err().kind(), ErrorKind::Closed));
    }

    const ITERATIONS: usize = 100;
    const MIN_N: usize = 1;
    const MAX_N: usize = 10;
    const MIN_DATA_SIZE: usize = 1;
    const MAX_DATA_SIZE: usize = 4096;
    const CLEAR_PROB: f64 = 0.05;
    const REOPEN_PROB: f64 = 0.01;

    #[test]
    fn simulated_use() {
        let path = AutoDeletePath::temp();
        let qf = QueueFile::open(&path).unwrap();
        simulate_use(&path, qf);
    }

    fn add_rand_n_elems(q: &mut VecDeque<Box<[u8]>>, qf: &mut QueueFile) -> usize {
        let mut rng = thread_rng();
        let n = rng.gen_range(MIN_N..MAX_N);

        for _ in 0..n {
            let data_size = rng.gen_range(MIN_DATA_SIZE..MAX_DATA_SIZE);
            let data = gen_rand_data(data_size);

            qf.add(data.as_ref()).unwrap();
            q.push_back(data);
        }

        n
    }

    fn verify_rand_n_elems(q: &mut VecDeque<Box<[u8]>>, qf: &mut QueueFile) -> usize {
        if qf.is_empty() {
            return 0;
        }

        let n = if qf.size() == 1 { 1 } else { thread_rng().gen_range(1..qf.size()) };

        for _ in 0..n {
            let d0 = q.pop_front().unwrap();
            let d1 = read_all(qf.peek().unwrap().unwrap());
            assert_eq!(d0.to_vec(), d1);
            qf.remove(1).unwrap();
        }

        n
    }

    fn simulate_use(path: &AutoDeletePath, mut qf: QueueFile) {
        let mut q: VecDeque<Box<[u8]>> = VecDeque::with_capacity(128);

        add_rand_n_elems(&mut q, &mut qf);

        for _ in 0..ITERATIONS {
            assert_eq!(q.len(), qf.size());

            if thread_rng().gen_bool(REOPEN_PROB) {
                drop(qf);
                qf = QueueFile::open(path).unwrap();
            }
            if thread_rng().gen_bool(CLEAR_PROB) {
                q.clear();
                qf.clear().unwrap();
            }

            verify_rand_n_elems(&mut q, &mut qf);
            add_rand_n_elems(&mut q, &mut qf);
        }

        loop {
            let data = match qf.peek().unwrap() {
                Some(stream) => read_all(stream),
                None => break,
            };
            assert_eq!(data, q.pop_front().unwrap().to_vec());
            qf.remove(1).unwrap();
        }

        assert!(q.is_empty());
        assert!(qf.is_empty());
    }
}
