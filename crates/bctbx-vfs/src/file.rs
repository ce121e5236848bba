//! The generic file handle returned by a [`crate::VfsRegistry`]
//!
//! [`VfsFile`] keeps a plaintext cursor over any [`FileOps`] and two caches:
//! a write-behind page for [`VfsFile::fprintf`] and a read page for
//! [`VfsFile::next_line`]. Every operation other than `fprintf` flushes the
//! print page first, and every write drops the line page.

use std::fmt;
use std::io::SeekFrom;

use bctbx_core::{EvfsError, EvfsResult};
use tracing::warn;
use zeroize::Zeroizing;

use crate::vfs::FileOps;

/// Capacity of the `fprintf` write-behind page
pub const PRINTF_PAGE_SIZE: usize = 4096;

/// Capacity of the `next_line` read page
pub const GETLINE_PAGE_SIZE: usize = 17385;

// Both pages may hold decrypted content, so they are wiped when dropped.
#[derive(Default)]
struct PrintPage {
    data: Zeroizing<Vec<u8>>,
    offset: u64,
}

#[derive(Default)]
struct LinePage {
    data: Zeroizing<Vec<u8>>,
    offset: u64,
    /// The page ends at the end of the file
    eof: bool,
}

impl LinePage {
    fn invalidate(&mut self) {
        self.data.clear();
        self.eof = false;
    }

    fn covers(&self, position: u64) -> bool {
        !self.data.is_empty()
            && position >= self.offset
            && position <= self.offset + self.data.len() as u64
    }
}

/// An open file with a cursor.
pub struct VfsFile {
    inner: Box<dyn FileOps>,
    cursor: u64,
    print: PrintPage,
    lines: LinePage,
}

impl VfsFile {
    pub fn new(inner: Box<dyn FileOps>) -> Self {
        Self {
            inner,
            cursor: 0,
            print: PrintPage::default(),
            lines: LinePage::default(),
        }
    }

    /// Write out the pending `fprintf` page, if any.
    pub fn flush(&mut self) -> EvfsResult<()> {
        if self.print.data.is_empty() {
            return Ok(());
        }
        let page = std::mem::take(&mut self.print.data);
        if let Err(e) = self.inner.write_at(&page, self.print.offset) {
            self.print.data = page;
            return Err(e);
        }
        self.lines.invalidate();
        Ok(())
    }

    pub fn read_at(&mut self, offset: u64, count: usize) -> EvfsResult<Vec<u8>> {
        self.flush()?;
        self.inner.read_at(offset, count)
    }

    pub fn write_at(&mut self, data: &[u8], offset: u64) -> EvfsResult<usize> {
        self.flush()?;
        let written = self.inner.write_at(data, offset)?;
        self.lines.invalidate();
        Ok(written)
    }

    /// Read at the cursor and advance it.
    pub fn read(&mut self, count: usize) -> EvfsResult<Vec<u8>> {
        let data = self.read_at(self.cursor, count)?;
        self.cursor += data.len() as u64;
        Ok(data)
    }

    /// Write at the cursor and advance it.
    pub fn write(&mut self, data: &[u8]) -> EvfsResult<usize> {
        let written = self.write_at(data, self.cursor)?;
        self.cursor += written as u64;
        Ok(written)
    }

    /// Formatted write at the cursor, or at `offset` when it is non-zero.
    ///
    /// Small writes accumulate in a page that is flushed by the next
    /// operation; `fprintf` calls that follow each other stay in the page.
    pub fn fprintf(&mut self, offset: u64, args: fmt::Arguments<'_>) -> EvfsResult<usize> {
        let text = Zeroizing::new(fmt::format(args));
        let bytes = text.as_bytes();
        let count = bytes.len();

        if offset != 0 {
            self.flush()?;
            self.cursor = offset;
        }

        if count + self.print.data.len() < PRINTF_PAGE_SIZE {
            if self.print.data.is_empty() {
                self.print.offset = self.cursor;
            }
            self.print.data.extend_from_slice(bytes);
            self.cursor += count as u64;
            self.lines.invalidate();
            return Ok(count);
        }

        if !self.print.data.is_empty() {
            // page and new text leave in a single write
            let mut page = std::mem::take(&mut self.print.data);
            let pending = page.len();
            page.extend_from_slice(bytes);
            if let Err(e) = self.inner.write_at(&page, self.print.offset) {
                page.truncate(pending);
                self.print.data = page;
                return Err(e);
            }
            self.cursor += count as u64;
            self.lines.invalidate();
            return Ok(count);
        }

        let written = self.inner.write_at(bytes, self.cursor)?;
        self.cursor += written as u64;
        self.lines.invalidate();
        Ok(written)
    }

    /// Next line from the cursor without its terminator (`\n`, `\r` or
    /// `\r\n`). A line longer than `max_len` is returned in pieces. `None` at
    /// end of file.
    pub fn next_line(&mut self, max_len: usize) -> EvfsResult<Option<Vec<u8>>> {
        if max_len == 0 {
            return Err(EvfsError::InvalidArgument(
                "line length limit must be positive".into(),
            ));
        }
        self.flush()?;

        if self.lines.covers(self.cursor) {
            let start = (self.cursor - self.lines.offset) as usize;
            let rest = &self.lines.data[start..];
            if rest.is_empty() && self.lines.eof {
                return Ok(None);
            }
            if let Some((len, consumed)) = take_line(rest, max_len, self.lines.eof) {
                let line = rest[..len].to_vec();
                self.cursor += consumed as u64;
                return Ok(Some(line));
            }
        }

        if max_len > GETLINE_PAGE_SIZE {
            warn!(
                max_len,
                page = GETLINE_PAGE_SIZE,
                "line length limit exceeds the line cache page, reading uncached"
            );
        }
        let page_len = GETLINE_PAGE_SIZE.max(max_len);
        let data = Zeroizing::new(self.inner.read_at(self.cursor, page_len)?);
        if data.is_empty() {
            self.lines.invalidate();
            return Ok(None);
        }
        let eof = data.len() < page_len;

        let (len, consumed) = take_line(&data, max_len, eof).unwrap_or_else(|| {
            // a full page without a terminator
            match data.last() {
                Some(b'\r') => (data.len() - 1, data.len()),
                _ => (data.len(), data.len()),
            }
        });
        let line = data[..len].to_vec();

        if page_len == GETLINE_PAGE_SIZE {
            self.lines.offset = self.cursor;
            self.lines.eof = eof;
            self.lines.data = data;
        }
        self.cursor += consumed as u64;
        Ok(Some(line))
    }

    /// Move the cursor. Positions past the end are allowed; negative ones are not.
    pub fn seek(&mut self, pos: SeekFrom) -> EvfsResult<u64> {
        self.flush()?;
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.cursor) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(self.inner.size()?) + i128::from(delta),
        };
        let target = u64::try_from(target).map_err(|_| {
            EvfsError::InvalidArgument(format!("seek to invalid position {target}"))
        })?;
        self.cursor = target;
        Ok(target)
    }

    pub fn position(&self) -> u64 {
        self.cursor
    }

    pub fn size(&mut self) -> EvfsResult<u64> {
        self.flush()?;
        self.inner.size()
    }

    pub fn truncate(&mut self, size: u64) -> EvfsResult<()> {
        self.flush()?;
        self.inner.truncate(size)?;
        self.lines.invalidate();
        Ok(())
    }

    pub fn sync(&mut self) -> EvfsResult<()> {
        self.flush()?;
        self.inner.sync()
    }

    pub fn is_encrypted(&self) -> bool {
        self.inner.is_encrypted()
    }

    /// Flush pending output and close the underlying file.
    ///
    /// Dropping a `VfsFile` without closing it discards unflushed `fprintf`
    /// output.
    pub fn close(mut self) -> EvfsResult<()> {
        self.flush()?;
        self.inner.close()
    }
}

impl fmt::Debug for VfsFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VfsFile")
            .field("cursor", &self.cursor)
            .field("encrypted", &self.inner.is_encrypted())
            .field("pending", &self.print.data.len())
            .finish()
    }
}

/// Find the first line in `buf`: `(line length, bytes consumed)`.
///
/// `complete` tells whether `buf` runs to the end of the file, so that an
/// unterminated remainder is a line and a trailing `\r` is not waiting for
/// its `\n`.
fn scan_line(buf: &[u8], complete: bool) -> Option<(usize, usize)> {
    match buf.iter().position(|b| *b == b'\n' || *b == b'\r') {
        Some(i) if buf[i] == b'\r' => match buf.get(i + 1) {
            Some(b'\n') => Some((i, i + 2)),
            Some(_) => Some((i, i + 1)),
            None if complete => Some((i, i + 1)),
            None => None,
        },
        Some(i) => Some((i, i + 1)),
        None if complete && !buf.is_empty() => Some((buf.len(), buf.len())),
        None => None,
    }
}

/// First line of `page`, the bytes from the cursor on, cut into pieces of at
/// most `max_len`. `None` when the page ends before the line does.
fn take_line(page: &[u8], max_len: usize, eof: bool) -> Option<(usize, usize)> {
    let window = &page[..page.len().min(max_len)];
    if let Some(found) = scan_line(window, eof && window.len() == page.len()) {
        return Some(found);
    }
    if window.len() == page.len() {
        return None;
    }
    let w = window.len();
    Some(match window.last() {
        Some(b'\r') if page[w] == b'\n' => (w - 1, w + 1),
        Some(b'\r') => (w - 1, w),
        _ => (w, w),
    })
}
