//! Trait seam standing in for the SD block driver and FAT32 layer named as
//! an external collaborator in spec.md 1. The Track Logger and Host Protocol
//! Engine are both written against this trait; a real firmware would
//! implement it once, over whatever SD/FAT32 crate it chooses.

use heapless::String;

/// Longest file name this crate will carry around (spec.md 3: "Name (<=64 bytes)").
pub const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum FsError {
    NotFound,
    AlreadyOpen,
    Io,
}

/// One directory entry (spec.md 3: name, type, size, full path — no timestamp).
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub name: String<MAX_NAME_LEN>,
    pub is_dir: bool,
    /// Only meaningful when `!is_dir`.
    pub size: u32,
}

/// A single open file. `no_std`-friendly: callers own buffers, the
/// implementation owns no internal allocation beyond what it needs to talk
/// to the storage medium.
pub trait File {
    async fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize, FsError>;
    async fn write(&mut self, buf: &[u8]) -> Result<usize, FsError>;
    async fn flush(&mut self) -> Result<(), FsError>;
    async fn size(&mut self) -> Result<u32, FsError>;
}

/// A directory walk in progress.
pub trait Directory {
    async fn next(&mut self) -> Result<Option<FileEntry>, FsError>;
}

/// The filesystem root. No subdirectories are required of the Track Logger
/// (spec.md 6); the Host Protocol Engine may walk into them.
pub trait FileSystem {
    type File: File;
    type Dir: Directory;

    async fn open(&mut self, path: &str, append: bool) -> Result<Self::File, FsError>;
    async fn open_dir(&mut self, path: &str) -> Result<Self::Dir, FsError>;
    async fn delete(&mut self, path: &str) -> Result<(), FsError>;
}
