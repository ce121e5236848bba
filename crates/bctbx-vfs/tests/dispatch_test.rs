//! The generic file handle: fprintf page cache, line reading, seeking, and
//! opening through the registry by mode string.

mod common;

use std::fs;
use std::io::SeekFrom;
use std::sync::Arc;

use bctbx_core::{EncryptionSuite, EvfsError, OpenFlags};
use bctbx_vfs::file::{GETLINE_PAGE_SIZE, PRINTF_PAGE_SIZE};
use bctbx_vfs::{EncryptedVfs, VfsRegistry, ENCRYPTED_VFS_NAME};
use common::{open, suite_path};
use tempfile::TempDir;

fn fprintf_round(suite: EncryptionSuite, tail_len: usize) {
    let dir = TempDir::new().unwrap();
    let path = suite_path(&dir, "fprintf", suite);
    let mut fp = open(&path, OpenFlags::create());

    let mut expected = Vec::new();
    while expected.len() < PRINTF_PAGE_SIZE {
        let line = format!(
            "this is a line used to fill the first page of the fprintf cache, write number {:04x}, \
             then {tail_len} chars follow\n",
            expected.len()
        );
        assert_eq!(fp.fprintf(0, format_args!("{line}")).unwrap(), line.len());
        expected.extend_from_slice(line.as_bytes());
    }
    let tail = "$".repeat(tail_len);
    assert_eq!(fp.fprintf(0, format_args!("{tail}")).unwrap(), tail_len);
    expected.extend_from_slice(tail.as_bytes());
    // the last page is still pending here and must be written by close
    fp.close().unwrap();

    let mut fp = open(&path, OpenFlags::read_only());
    assert_eq!(fp.size().unwrap(), expected.len() as u64);
    assert_eq!(fp.read_at(0, expected.len()).unwrap(), expected);
    fp.close().unwrap();
}

#[test]
fn fprintf_pages_reach_the_file() {
    for tail_len in [1, 100, PRINTF_PAGE_SIZE - 1, PRINTF_PAGE_SIZE, PRINTF_PAGE_SIZE + 7] {
        fprintf_round(EncryptionSuite::Aes256Gcm128Sha256, tail_len);
        fprintf_round(EncryptionSuite::Plain, tail_len);
    }
}

#[test]
fn fprintf_stays_cached_until_another_operation() {
    let dir = TempDir::new().unwrap();
    let path = suite_path(&dir, "cached", EncryptionSuite::Plain);
    let mut fp = open(&path, OpenFlags::create());

    fp.fprintf(0, format_args!("{}-{}", "abc", 42)).unwrap();
    assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    assert_eq!(fp.position(), 6);

    // size flushes first
    assert_eq!(fp.size().unwrap(), 6);
    assert_eq!(fs::read(&path).unwrap(), b"abc-42");

    // a non-zero offset flushes and moves the cursor
    fp.fprintf(0, format_args!("xyz")).unwrap();
    fp.fprintf(2, format_args!("Q")).unwrap();
    assert_eq!(fp.position(), 3);
    fp.close().unwrap();
    assert_eq!(fs::read(&path).unwrap(), b"abQ-42xyz");
}

#[test]
fn next_line_handles_every_terminator() {
    let dir = TempDir::new().unwrap();
    for suite in [EncryptionSuite::Dummy, EncryptionSuite::Plain] {
        let path = suite_path(&dir, "lines", suite);
        let mut fp = open(&path, OpenFlags::create());
        fp.write_at(b"first\nsecond\r\nthird\rfourth\n\nlast", 0)
            .unwrap();
        fp.seek(SeekFrom::Start(0)).unwrap();

        let mut lines = Vec::new();
        while let Some(line) = fp.next_line(256).unwrap() {
            lines.push(String::from_utf8(line).unwrap());
        }
        assert_eq!(lines, ["first", "second", "third", "fourth", "", "last"]);
        assert!(fp.next_line(256).unwrap().is_none());
        fp.close().unwrap();
    }
}

#[test]
fn next_line_splits_long_lines_and_sees_writes() {
    let dir = TempDir::new().unwrap();
    let path = suite_path(&dir, "long", EncryptionSuite::Dummy);
    let mut fp = open(&path, OpenFlags::create());
    fp.write_at(b"abcdefghij\nxy\n", 0).unwrap();

    assert_eq!(fp.next_line(4).unwrap().unwrap(), b"abcd");
    assert_eq!(fp.next_line(4).unwrap().unwrap(), b"efgh");
    assert_eq!(fp.next_line(4).unwrap().unwrap(), b"ij");

    // overwrite what the line cache holds
    fp.write_at(b"XY", 11).unwrap();
    assert_eq!(fp.next_line(64).unwrap().unwrap(), b"XY");
    assert!(fp.next_line(64).unwrap().is_none());

    assert!(matches!(
        fp.next_line(0),
        Err(EvfsError::InvalidArgument(_))
    ));
    fp.close().unwrap();
}

#[test]
fn next_line_beyond_cache_page() {
    let dir = TempDir::new().unwrap();
    let path = suite_path(&dir, "big", EncryptionSuite::Plain);
    let mut fp = open(&path, OpenFlags::create());
    let long = vec![b'a'; GETLINE_PAGE_SIZE + 10];
    fp.write_at(&long, 0).unwrap();
    fp.write_at(b"\nend", long.len() as u64).unwrap();

    assert_eq!(
        fp.next_line(GETLINE_PAGE_SIZE + 100).unwrap().unwrap(),
        long
    );
    assert_eq!(fp.next_line(64).unwrap().unwrap(), b"end");
    fp.close().unwrap();
}

#[test]
fn seek_from_every_origin() {
    let dir = TempDir::new().unwrap();
    let path = suite_path(&dir, "seek", EncryptionSuite::Aes256Gcm128Sha256);
    let mut fp = open(&path, OpenFlags::create());
    fp.write_at(b"0123456789", 0).unwrap();

    assert_eq!(fp.seek(SeekFrom::Start(4)).unwrap(), 4);
    assert_eq!(fp.seek(SeekFrom::Current(2)).unwrap(), 6);
    assert_eq!(fp.read(2).unwrap(), b"67");
    assert_eq!(fp.seek(SeekFrom::End(-3)).unwrap(), 7);
    assert_eq!(fp.read(10).unwrap(), b"789");
    assert!(matches!(
        fp.seek(SeekFrom::Current(-100)),
        Err(EvfsError::InvalidArgument(_))
    ));
    assert_eq!(fp.position(), 10);

    // past the end is allowed; a write there zero-fills
    assert_eq!(fp.seek(SeekFrom::End(5)).unwrap(), 15);
    fp.write(b"!").unwrap();
    assert_eq!(fp.size().unwrap(), 16);
    assert_eq!(fp.read_at(10, 6).unwrap(), b"\0\0\0\0\0!");
    fp.close().unwrap();
}

#[test]
fn registry_opens_by_mode() {
    let dir = TempDir::new().unwrap();
    let mut registry = VfsRegistry::new();
    registry.register(Arc::new(EncryptedVfs::new(common::suite_from_name)));
    registry.set_default(ENCRYPTED_VFS_NAME).unwrap();

    let path = suite_path(&dir, "modes", EncryptionSuite::Dummy);
    assert!(registry.open(&path, "r").is_err(), "r does not create");

    let mut fp = registry.open(&path, "wb").unwrap();
    assert!(fp.is_encrypted());
    fp.write(b"mode w").unwrap();
    fp.close().unwrap();

    let mut fp = registry.open(&path, "rb").unwrap();
    assert_eq!(fp.read(64).unwrap(), b"mode w");
    assert!(fp.write(b"nope").is_err());
    fp.close().unwrap();

    let mut fp = registry.open(&path, "r+").unwrap();
    fp.write_at(b"M", 0).unwrap();
    fp.close().unwrap();

    let mut fp = registry.open(&path, "r").unwrap();
    assert_eq!(fp.read(64).unwrap(), b"Mode w");
    fp.close().unwrap();
}
