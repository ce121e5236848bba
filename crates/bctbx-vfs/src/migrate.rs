//! In-place conversion of a plaintext file into an encrypted one
//!
//! The encrypted copy is written to a temporary file next to the original and
//! renamed over it only once complete, so a failure at any step leaves the
//! plaintext file as it was.

use std::fs;
use std::path::{Path, PathBuf};

use bctbx_core::{EvfsError, EvfsResult};
use bctbx_crypto::EncryptionModule;
use tracing::{debug, info};

use crate::backing::{BackingFile, StdBackingFile};
use crate::header::FileHeader;
use crate::layout::{module_index, ChunkLayout};

/// Encrypt the plaintext in `source` into a new file that replaces `path`.
///
/// `module` must already hold its secret material. Returns the committed
/// header; the caller reopens `path` to continue.
pub(crate) fn encrypt_in_place(
    source: &mut dyn BackingFile,
    path: &Path,
    module: &mut dyn EncryptionModule,
    chunk_size: u32,
) -> EvfsResult<FileHeader> {
    write_encrypted_copy(source, path, module, chunk_size).map_err(|e| {
        EvfsError::MigrationFailed {
            path: path.to_path_buf(),
            source: Box::new(e),
        }
    })
}

fn write_encrypted_copy(
    source: &mut dyn BackingFile,
    path: &Path,
    module: &mut dyn EncryptionModule,
    chunk_size: u32,
) -> EvfsResult<FileHeader> {
    let mut header = FileHeader::new(module.suite(), chunk_size)?;
    header.file_size = source.size()?;
    let layout = ChunkLayout::new(
        chunk_size,
        module.chunk_header_size(),
        header.module_header_offset() + module.module_file_header_size() as u64,
    );

    let tmp_path = build_tmp_path(path);
    let mut tmp = StdBackingFile::create_new(&tmp_path)?;

    let result = copy_encrypted(source, &mut tmp, module, &header, &layout);
    if let Err(e) = result {
        drop(tmp);
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    drop(tmp);

    debug!(tmp = %tmp_path.display(), target = %path.display(), "replacing plaintext file");
    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    info!(
        path = %path.display(),
        suite = %header.suite,
        size = header.file_size,
        chunks = layout.chunk_count(header.file_size),
        "migrated plaintext file to encrypted storage"
    );
    Ok(header)
}

fn copy_encrypted(
    source: &mut dyn BackingFile,
    tmp: &mut StdBackingFile,
    module: &mut dyn EncryptionModule,
    header: &FileHeader,
    layout: &ChunkLayout,
) -> EvfsResult<()> {
    for index in 0..layout.chunk_count(header.file_size) {
        let offset = index * layout.chunk_size();
        let want = layout.chunk_size().min(header.file_size - offset) as usize;
        let plain = source.read_at(offset, want)?;
        if plain.len() != want {
            return Err(EvfsError::Format(format!(
                "plaintext ended at byte {} while migrating, expected {}",
                offset + plain.len() as u64,
                header.file_size
            )));
        }
        let raw = module.encrypt_chunk(module_index(index)?, &plain)?;
        tmp.write_at(layout.chunk_raw_offset(index), &raw)?;
    }

    let base = header.encode();
    let mut head = Vec::with_capacity(layout.header_size() as usize);
    head.extend_from_slice(&base);
    head.extend_from_slice(&module.module_file_header(&base)?);
    tmp.write_at(0, &head)?;
    tmp.sync()?;
    Ok(())
}

fn build_tmp_path(target: &Path) -> PathBuf {
    let parent = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let base_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("evfs");
    parent.join(format!(".{base_name}.evfs-{}.tmp", uuid::Uuid::new_v4()))
}
