//! The encrypted file engine
//!
//! An [`EncryptedFile`] sits on top of a [`BackingFile`] and decides at open
//! time whether the file is plaintext (passthrough), encrypted, or plaintext to
//! be migrated. Encrypted content is stored as fixed-size chunks, each one
//! authenticated and encrypted independently by the file's module.
//!
//! Writes always land in the backing file before the header that records the
//! new size. A crash between the two leaves a raw size that disagrees with the
//! header; the next open walks back from the end of the file to the last chunk
//! that authenticates and takes it as the true size.

use std::path::{Path, PathBuf};

use bctbx_core::{AccessMode, EncryptionSuite, EvfsError, EvfsResult, OpenFlags};
use bctbx_crypto::{module_file_header_size, new_module, open_module, EncryptionModule};
use tracing::{debug, info, warn};

use crate::backing::{BackingFile, StdBackingFile};
use crate::header::{FileHeader, BASE_HEADER_SIZE};
use crate::layout::{module_index, ChunkLayout};
use crate::migrate;
use crate::settings::{EncryptionSettings, MigrationPolicy, OpenPolicy};

/// Largest run of zeros encrypted at once when a write or truncate opens a hole
const ZERO_FILL_BLOCK: u64 = 1 << 20;

/// A file opened through the encrypted VFS.
pub struct EncryptedFile {
    backing: Box<dyn BackingFile>,
    path: PathBuf,
    access: AccessMode,
    state: FileState,
}

enum FileState {
    /// Plaintext passthrough to the backing file
    Plain,
    Encrypted(Box<EncryptionState>),
}

struct EncryptionState {
    header: FileHeader,
    layout: ChunkLayout,
    module: Box<dyn EncryptionModule>,
}

impl EncryptedFile {
    /// Open or create `path`, asking `policy` for the suite and secret.
    ///
    /// Any write access opens the backing file read-write: updating a chunk
    /// needs its previous raw content.
    pub fn open(path: &Path, flags: OpenFlags, policy: &dyn OpenPolicy) -> EvfsResult<Self> {
        let mut backing_flags = flags;
        backing_flags.append = false;
        if flags.is_writable() {
            backing_flags.access = AccessMode::ReadWrite;
        }
        let backing = StdBackingFile::open(path, backing_flags)?;

        let mut file = Self {
            backing: Box::new(backing),
            path: path.to_path_buf(),
            access: flags.access,
            state: FileState::Plain,
        };

        let raw_size = file.backing.size()?;
        if raw_size == 0 {
            if file.access == AccessMode::ReadOnly {
                debug!(path = %file.path.display(), "empty file opened read-only, passing through");
            } else {
                file.create(policy)?;
            }
            return Ok(file);
        }

        let base = file.backing.read_at(0, BASE_HEADER_SIZE)?;
        match FileHeader::decode(&base)? {
            None => file.open_plain(policy)?,
            Some(header) => file.open_encrypted(header, &base, raw_size, policy)?,
        }
        Ok(file)
    }

    fn create(&mut self, policy: &dyn OpenPolicy) -> EvfsResult<()> {
        let mut settings = EncryptionSettings::for_new_file(&self.path, self.access);
        policy.configure(&mut settings)?;

        match settings.suite() {
            EncryptionSuite::Plain => {
                debug!(path = %self.path.display(), "new file left in plaintext by open policy");
                return Ok(());
            }
            EncryptionSuite::Unset => {
                return Err(EvfsError::ConfigConflict(format!(
                    "no encryption suite selected for new file {}",
                    self.path.display()
                )));
            }
            _ => {}
        }

        let mut module = new_module(settings.suite())?;
        install_secret(module.as_mut(), &settings)?;
        let header = FileHeader::new(settings.suite(), settings.chunk_size())?;
        let mut state = EncryptionState::new(header, module);
        state.write_header(self.backing.as_mut())?;
        self.state = FileState::Encrypted(Box::new(state));

        info!(
            path = %self.path.display(),
            suite = %header.suite,
            chunk_size = header.chunk_size,
            "created encrypted file"
        );
        Ok(())
    }

    fn open_plain(&mut self, policy: &dyn OpenPolicy) -> EvfsResult<()> {
        let mut settings = EncryptionSettings::for_plain_file(&self.path, self.access);
        policy.configure(&mut settings)?;

        let suite = settings.suite();
        if !suite.is_encrypting()
            || settings.migration_policy() == MigrationPolicy::Never
            || self.access == AccessMode::ReadOnly
        {
            debug!(path = %self.path.display(), %suite, "opened plaintext file");
            return Ok(());
        }

        let mut module = new_module(suite)?;
        install_secret(module.as_mut(), &settings)?;
        let header = migrate::encrypt_in_place(
            self.backing.as_mut(),
            &self.path,
            module.as_mut(),
            settings.chunk_size(),
        )?;

        // the current handle still points at the replaced plaintext
        self.backing = Box::new(StdBackingFile::open(&self.path, OpenFlags::read_write())?);
        self.state = FileState::Encrypted(Box::new(EncryptionState::new(header, module)));
        Ok(())
    }

    fn open_encrypted(
        &mut self,
        header: FileHeader,
        base: &[u8],
        raw_size: u64,
        policy: &dyn OpenPolicy,
    ) -> EvfsResult<()> {
        let trailer_size = module_file_header_size(header.suite)?;
        let trailer = self
            .backing
            .read_at(header.module_header_offset(), trailer_size)?;
        if trailer.len() != trailer_size {
            return Err(EvfsError::Format(format!(
                "{} ends inside its module header",
                self.path.display()
            )));
        }
        let mut module = open_module(header.suite, &trailer)?;

        let mut settings = EncryptionSettings::for_encrypted_file(
            &self.path,
            self.access,
            header.suite,
            header.chunk_size,
        );
        policy.configure(&mut settings)?;
        install_secret(module.as_mut(), &settings)?;

        if !module.check_integrity(base)? {
            return Err(EvfsError::AuthFailure(format!(
                "header of {} does not authenticate",
                self.path.display()
            )));
        }

        let mut state = EncryptionState::new(header, module);
        let expected = state.layout.raw_file_size(header.file_size);
        if raw_size != expected {
            warn!(
                path = %self.path.display(),
                raw_size,
                expected,
                "raw size disagrees with the header, checking trailing chunks"
            );
            let recovered = state.authentic_size(self.backing.as_mut(), raw_size)?;
            state.header.file_size = recovered;
            if self.access == AccessMode::ReadOnly {
                warn!(
                    path = %self.path.display(),
                    size = recovered,
                    "recovered size kept in memory, file is read-only"
                );
            } else {
                let raw_target = state.layout.raw_file_size(recovered);
                if raw_target < raw_size {
                    self.backing.truncate(raw_target)?;
                }
                state.write_header(self.backing.as_mut())?;
                warn!(
                    path = %self.path.display(),
                    size = recovered,
                    "repaired encrypted file header"
                );
            }
        }

        debug!(
            path = %self.path.display(),
            suite = %state.header.suite,
            size = state.header.file_size,
            "opened encrypted file"
        );
        self.state = FileState::Encrypted(Box::new(state));
        Ok(())
    }

    /// Read up to `count` plaintext bytes at `offset`. Short only at end of file.
    pub fn read(&mut self, offset: u64, count: usize) -> EvfsResult<Vec<u8>> {
        match &self.state {
            FileState::Plain => Ok(self.backing.read_at(offset, count)?),
            FileState::Encrypted(state) => state.read(self.backing.as_mut(), offset, count),
        }
    }

    /// Write `data` at `offset`, zero-filling any gap past the end of file.
    pub fn write(&mut self, data: &[u8], offset: u64) -> EvfsResult<usize> {
        self.ensure_writable()?;
        match &mut self.state {
            FileState::Plain => {
                self.backing.write_at(offset, data)?;
                Ok(data.len())
            }
            FileState::Encrypted(state) => state.write(self.backing.as_mut(), data, offset),
        }
    }

    pub fn truncate(&mut self, new_size: u64) -> EvfsResult<()> {
        self.ensure_writable()?;
        match &mut self.state {
            FileState::Plain => Ok(self.backing.truncate(new_size)?),
            FileState::Encrypted(state) => state.truncate(self.backing.as_mut(), new_size),
        }
    }

    /// Plaintext size.
    pub fn size(&self) -> EvfsResult<u64> {
        match &self.state {
            FileState::Plain => Ok(self.backing.size()?),
            FileState::Encrypted(state) => Ok(state.header.file_size),
        }
    }

    pub fn sync(&mut self) -> EvfsResult<()> {
        Ok(self.backing.sync()?)
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.state, FileState::Encrypted(_))
    }

    /// Suite protecting the file, `Plain` for a passthrough file.
    pub fn suite(&self) -> EncryptionSuite {
        match &self.state {
            FileState::Plain => EncryptionSuite::Plain,
            FileState::Encrypted(state) => state.header.suite,
        }
    }

    /// Plaintext chunk size, `None` for a passthrough file.
    pub fn chunk_size(&self) -> Option<u32> {
        match &self.state {
            FileState::Plain => None,
            FileState::Encrypted(state) => Some(state.header.chunk_size),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the backing file; module keys are zeroized as the state drops.
    pub fn close(self) -> EvfsResult<()> {
        debug!(path = %self.path.display(), encrypted = self.is_encrypted(), "closing file");
        Ok(())
    }

    fn ensure_writable(&self) -> EvfsResult<()> {
        if self.access == AccessMode::ReadOnly {
            return Err(EvfsError::InvalidArgument(format!(
                "{} is opened read-only",
                self.path.display()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for EncryptedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedFile")
            .field("path", &self.path)
            .field("access", &self.access)
            .field("suite", &self.suite())
            .finish()
    }
}

fn install_secret(
    module: &mut dyn EncryptionModule,
    settings: &EncryptionSettings,
) -> EvfsResult<()> {
    let secret = settings
        .secret_material()
        .ok_or(EvfsError::KeySize {
            expected: module.secret_material_size(),
            actual: 0,
        })?;
    module.set_secret_material(secret)
}

impl EncryptionState {
    fn new(header: FileHeader, module: Box<dyn EncryptionModule>) -> Self {
        let layout = ChunkLayout::new(
            header.chunk_size,
            module.chunk_header_size(),
            header.module_header_offset() + module.module_file_header_size() as u64,
        );
        Self {
            header,
            layout,
            module,
        }
    }

    fn write_header(&mut self, backing: &mut dyn BackingFile) -> EvfsResult<()> {
        let base = self.header.encode();
        let trailer = self.module.module_file_header(&base)?;
        if self.header.extension_size == 0 {
            let mut head = Vec::with_capacity(base.len() + trailer.len());
            head.extend_from_slice(&base);
            head.extend_from_slice(&trailer);
            backing.write_at(0, &head)?;
        } else {
            backing.write_at(0, &base)?;
            backing.write_at(self.header.module_header_offset(), &trailer)?;
        }
        Ok(())
    }

    /// Raw chunks `first..=last`, clipped to the end of the current content.
    fn read_raw_chunks(
        &self,
        backing: &mut dyn BackingFile,
        first: u64,
        last: u64,
    ) -> EvfsResult<Vec<u8>> {
        let start = self.layout.chunk_raw_offset(first);
        let end = self
            .layout
            .chunk_raw_offset(last + 1)
            .min(self.layout.raw_file_size(self.header.file_size));
        let want = end.saturating_sub(start) as usize;
        let raw = backing.read_at(start, want)?;
        if raw.len() != want {
            return Err(EvfsError::Format(format!(
                "expected {want} raw bytes at offset {start}, found {}",
                raw.len()
            )));
        }
        Ok(raw)
    }

    fn read(
        &self,
        backing: &mut dyn BackingFile,
        offset: u64,
        count: usize,
    ) -> EvfsResult<Vec<u8>> {
        let size = self.header.file_size;
        if count == 0 || offset >= size {
            return Ok(Vec::new());
        }
        let count = (count as u64).min(size - offset);
        let first = self.layout.chunk_index(offset);
        let last = self.layout.chunk_index(offset + count - 1);

        let raw = self.read_raw_chunks(backing, first, last)?;
        let mut plain = Vec::with_capacity(raw.len());
        for (i, chunk) in raw.chunks(self.layout.raw_chunk_size() as usize).enumerate() {
            let index = module_index(first + i as u64)?;
            plain.extend_from_slice(&self.module.decrypt_chunk(index, chunk)?);
        }

        let skip = (offset % self.layout.chunk_size()) as usize;
        plain.drain(..skip.min(plain.len()));
        plain.truncate(count as usize);
        Ok(plain)
    }

    fn write(
        &mut self,
        backing: &mut dyn BackingFile,
        data: &[u8],
        offset: u64,
    ) -> EvfsResult<usize> {
        let end = offset.checked_add(data.len() as u64).ok_or_else(|| {
            EvfsError::InvalidArgument(format!(
                "write of {} bytes at offset {offset} overflows the file size",
                data.len()
            ))
        })?;
        if end > 0 {
            module_index(self.layout.chunk_index(end - 1))?;
        }

        // a long hole is encrypted block by block, the last block goes out with the data
        if offset > self.header.file_size.saturating_add(ZERO_FILL_BLOCK) {
            self.zero_fill(backing, offset - ZERO_FILL_BLOCK)?;
        }

        let size = self.header.file_size;
        if data.is_empty() && offset <= size {
            return Ok(0);
        }
        let (plain, offset) = if offset > size {
            let mut padded = vec![0u8; (offset - size) as usize];
            padded.extend_from_slice(data);
            (padded, size)
        } else {
            (data.to_vec(), offset)
        };
        self.overwrite(backing, plain, offset)?;
        Ok(data.len())
    }

    /// Extend the file with zeros up to `target`.
    fn zero_fill(&mut self, backing: &mut dyn BackingFile, target: u64) -> EvfsResult<()> {
        while self.header.file_size < target {
            let at = self.header.file_size;
            let step = (target - at).min(ZERO_FILL_BLOCK) as usize;
            self.overwrite(backing, vec![0u8; step], at)?;
        }
        Ok(())
    }

    /// Write non-empty `plain` at `offset`, which must not lie past the end.
    fn overwrite(
        &mut self,
        backing: &mut dyn BackingFile,
        mut plain: Vec<u8>,
        offset: u64,
    ) -> EvfsResult<()> {
        let size = self.header.file_size;

        let chunk_size = self.layout.chunk_size();
        let end = offset + plain.len() as u64;
        let first = self.layout.chunk_index(offset);
        let last = self.layout.chunk_index(end - 1);
        let read_offset = first * chunk_size;

        let existing = if read_offset < size {
            let last_existing = last.min((size - 1) / chunk_size);
            self.read_raw_chunks(backing, first, last_existing)?
        } else {
            Vec::new()
        };
        let existing: Vec<&[u8]> = existing
            .chunks(self.layout.raw_chunk_size() as usize)
            .collect();
        let existing_chunk = |index: u64| -> EvfsResult<&[u8]> {
            existing
                .get((index - first) as usize)
                .copied()
                .ok_or_else(|| EvfsError::Format(format!("chunk {index} missing on disk")))
        };

        if read_offset < offset {
            let head = self
                .module
                .decrypt_chunk(module_index(first)?, existing_chunk(first)?)?;
            let lead = (offset - read_offset) as usize;
            plain.splice(0..0, head[..lead].iter().copied());
        }

        let tail_start = (end % chunk_size) as usize;
        if tail_start != 0 && end < size {
            let tail = self
                .module
                .decrypt_chunk(module_index(last)?, existing_chunk(last)?)?;
            plain.extend_from_slice(&tail[tail_start..]);
        }

        let mut raw = Vec::with_capacity(self.layout.raw_file_size(plain.len() as u64) as usize);
        for (i, piece) in plain.chunks(chunk_size as usize).enumerate() {
            let index = module_index(first + i as u64)?;
            let sealed = match existing.get(i) {
                Some(old) => self.module.reencrypt_chunk(index, old, piece)?,
                None => self.module.encrypt_chunk(index, piece)?,
            };
            raw.extend_from_slice(&sealed);
        }

        backing.write_at(self.layout.chunk_raw_offset(first), &raw)?;
        self.header.file_size = size.max(end);
        self.write_header(backing)
    }

    fn truncate(&mut self, backing: &mut dyn BackingFile, new_size: u64) -> EvfsResult<()> {
        let size = self.header.file_size;
        if new_size > size {
            self.write(backing, &[], new_size)?;
            return Ok(());
        }
        if new_size == size {
            return Ok(());
        }

        let keep = (new_size % self.layout.chunk_size()) as usize;
        if keep != 0 {
            let boundary = self.layout.chunk_index(new_size);
            let index = module_index(boundary)?;
            let raw = self.read_raw_chunks(backing, boundary, boundary)?;
            let mut plain = self.module.decrypt_chunk(index, &raw)?;
            plain.truncate(keep);
            let sealed = self.module.reencrypt_chunk(index, &raw, &plain)?;
            backing.write_at(self.layout.chunk_raw_offset(boundary), &sealed)?;
        }

        backing.truncate(self.layout.raw_file_size(new_size))?;
        self.header.file_size = new_size;
        self.write_header(backing)
    }

    /// Walk back from the end of the raw file to the last chunk that
    /// authenticates; its end is the true plaintext size.
    fn authentic_size(&self, backing: &mut dyn BackingFile, raw_size: u64) -> EvfsResult<u64> {
        let tail = self.layout.raw_tail(raw_size).ok_or_else(|| {
            EvfsError::Format(format!("raw size {raw_size} is smaller than the file header"))
        })?;
        if tail.torn_bytes > 0 {
            debug!(torn_bytes = tail.torn_bytes, "ignoring torn trailing chunk header");
        }

        let chunk_size = self.layout.chunk_size();
        let partial = tail
            .partial_payload
            .map(|payload| (tail.full_chunks, payload));
        let full = (0..tail.full_chunks).rev().map(|index| (index, chunk_size));
        let mut tried = 0u64;

        for (index, payload) in partial.into_iter().chain(full) {
            tried += 1;
            if self.chunk_authenticates(backing, index, payload)? {
                let size = index * chunk_size + payload;
                debug!(index, size, tried, "trailing chunk authenticates");
                return Ok(size);
            }
            debug!(index, "chunk does not authenticate, stepping back");
        }

        if tried == 0 {
            return Ok(0);
        }
        Err(EvfsError::AuthFailure(format!(
            "none of the {tried} trailing chunks authenticates"
        )))
    }

    fn chunk_authenticates(
        &self,
        backing: &mut dyn BackingFile,
        index: u64,
        payload: u64,
    ) -> EvfsResult<bool> {
        let len = (self.layout.chunk_header_size() + payload) as usize;
        let raw = backing.read_at(self.layout.chunk_raw_offset(index), len)?;
        if raw.len() != len {
            return Ok(false);
        }
        match self.module.decrypt_chunk(module_index(index)?, &raw) {
            Ok(_) => Ok(true),
            Err(e) if e.is_auth_failure() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
