//! I/O plugin (spec.md §6.4). An external collaborator by contract, but a
//! frame backed by a sparse directory or a file needs *some* working
//! implementation to be useful, so this module provides the trait plus the
//! default file-backed implementation the teacher's `blosc2_stdio` module
//! stubbed out as "not implemented for WebAssembly".
//!
//! Grounded on `blosc::blosc2_stdio` for the callback shape (open/close/
//! read/write/seek/tell/size/truncate/destroy), reshaped from raw
//! `*mut c_void` handles into a safe trait object per spec.md §9.

use crate::error::{Error, ErrorCode, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Where a seek is relative to (spec.md §6.4 `seek(h, off, whence)`).
#[derive(Debug, Clone, Copy)]
pub enum Whence {
    Start,
    Current,
    End,
}

/// An open handle returned by `IoCallbacks::open`.
pub trait IoHandle: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
    fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64>;
    fn tell(&mut self) -> Result<i64>;
    fn size(&mut self) -> Result<i64>;
    fn truncate(&mut self, offset: i64) -> Result<()>;
}

/// The I/O plugin contract (spec.md §6.4). The core never calls these while
/// holding an internal lock (spec.md §5).
pub trait IoCallbacks: Send + Sync {
    fn open(&self, path: &Path, write: bool) -> Result<Box<dyn IoHandle>>;
    fn remove(&self, path: &Path) -> Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn create_dir_all(&self, path: &Path) -> Result<()>;
}

/// The default, file-backed implementation (spec.md §6.4's concrete
/// collaborator; replaces the teacher's always-null `blosc2_stdio_open`).
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFileIo;

struct StdFileHandle(File);

impl IoHandle for StdFileHandle {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.0
            .read(buf)
            .map_err(|e| Error::new(ErrorCode::FileRead, e.to_string()))
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.0
            .write(buf)
            .map_err(|e| Error::new(ErrorCode::FileWrite, e.to_string()))
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64> {
        let pos = match whence {
            Whence::Start => SeekFrom::Start(offset as u64),
            Whence::Current => SeekFrom::Current(offset),
            Whence::End => SeekFrom::End(offset),
        };
        self.0
            .seek(pos)
            .map(|p| p as i64)
            .map_err(|e| Error::new(ErrorCode::FileRead, e.to_string()))
    }

    fn tell(&mut self) -> Result<i64> {
        self.0
            .stream_position()
            .map(|p| p as i64)
            .map_err(|e| Error::new(ErrorCode::FileRead, e.to_string()))
    }

    fn size(&mut self) -> Result<i64> {
        self.0
            .metadata()
            .map(|m| m.len() as i64)
            .map_err(|e| Error::new(ErrorCode::FileRead, e.to_string()))
    }

    fn truncate(&mut self, offset: i64) -> Result<()> {
        self.0
            .set_len(offset as u64)
            .map_err(|e| Error::new(ErrorCode::FileTruncate, e.to_string()))
    }
}

impl IoCallbacks for StdFileIo {
    fn open(&self, path: &Path, write: bool) -> Result<Box<dyn IoHandle>> {
        let file = if write {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)
        } else {
            OpenOptions::new().read(true).open(path)
        }
        .map_err(|e| Error::new(ErrorCode::FileOpen, e.to_string()))?;
        Ok(Box::new(StdFileHandle(file)))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|e| Error::new(ErrorCode::FileRemove, e.to_string()))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).map_err(|e| Error::new(ErrorCode::FileOpen, e.to_string()))
    }
}

/// Helper used by the sparse frame to name per-chunk files (spec.md §6.2:
/// `XXXXXXXX.chunk` where `XXXXXXXX` is the 8-digit upper-hex chunk id).
pub fn chunk_file_name(dir: &Path, nchunk: i64) -> PathBuf {
    dir.join(format!("{:08X}.chunk", nchunk))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn std_file_io_round_trips() {
        let dir = std::env::temp_dir().join(format!("bchunk-io-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sample.bin");
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(b"hello").unwrap();
        }
        let io = StdFileIo;
        let mut handle = io.open(&path, false).unwrap();
        let mut buf = [0u8; 5];
        let n = handle.read(&mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
        io.remove(&path).unwrap();
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn chunk_file_name_is_eight_hex_digits() {
        let name = chunk_file_name(Path::new("/tmp/frame"), 7);
        assert_eq!(name.file_name().unwrap().to_str().unwrap(), "00000007.chunk");
    }
}
