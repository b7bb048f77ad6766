#![forbid(unsafe_code)]
//! ext2 image session: open, path resolution, listing and file dumps.
//!
//! `Ext2Fs` reads the superblock and group descriptor table once, then
//! serves path lookups, directory listings and content streams against a
//! single [`BlockReader`].
//!
//! # Opening an image
//!
//! ```no_run
//! use e2r_core::Ext2Fs;
//!
//! let fs = Ext2Fs::open("disk.img")?;
//! for row in fs.list_dir("/")? {
//!     println!("{}", row.name);
//! }
//! # Ok::<(), e2r_error::E2rError>(())
//! ```

use std::io::Write;
use std::path::Path;

use e2r_block::{BlockReader, ByteDevice, FileByteDevice};
use e2r_blockmap::FileContent;
use e2r_error::{E2rError, Result};
use e2r_inode::{load_group_descriptors, load_superblock, resolve_inode};
use e2r_ondisk::{Ext2DirEntry, Ext2FileType, Ext2GroupDesc, Ext2Inode, Ext2Superblock};
use e2r_types::{BlockSize, InodeNumber};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Default read-through cache size, in blocks.
pub const DEFAULT_CACHE_BLOCKS: usize = 64;

/// Options controlling how an image is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOptions {
    /// Skip superblock geometry validation. The magic number is still
    /// checked. Use for diagnostics on damaged images only.
    pub skip_validation: bool,
    /// Blocks kept in the read-through LRU cache; 0 disables caching.
    pub cache_blocks: usize,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            skip_validation: false,
            cache_blocks: DEFAULT_CACHE_BLOCKS,
        }
    }
}

/// Coarse entry type used in listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Directory,
    File,
    Other,
}

impl EntryKind {
    #[must_use]
    pub fn from_inode(inode: &Ext2Inode) -> Self {
        match inode.kind() {
            Ext2FileType::Dir => Self::Directory,
            Ext2FileType::RegFile => Self::File,
            _ => Self::Other,
        }
    }

    /// Single-letter code: `d`, `f` or `u`.
    #[must_use]
    pub fn code(self) -> char {
        match self {
            Self::Directory => 'd',
            Self::File => 'f',
            Self::Other => 'u',
        }
    }
}

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirListing {
    pub name: String,
    pub inode: u32,
    pub kind: EntryKind,
    pub size: u64,
}

/// Canonical form of a user path: leading `/`, no empty components.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

/// An open ext2 image.
pub struct Ext2Fs {
    sb: Ext2Superblock,
    groups: Vec<Ext2GroupDesc>,
    reader: BlockReader,
}

impl std::fmt::Debug for Ext2Fs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ext2Fs")
            .field("volume_name", &self.sb.volume_name)
            .field("block_size", &self.sb.block_size)
            .field("inodes_count", &self.sb.inodes_count)
            .field("groups", &self.groups.len())
            .field("reader", &self.reader)
            .finish()
    }
}

impl Ext2Fs {
    /// Open an image file with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, &OpenOptions::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        let dev = FileByteDevice::open(path.as_ref())?;
        Self::from_device(Box::new(dev), options)
    }

    /// Open an image from an already-constructed device.
    pub fn from_device(dev: Box<dyn ByteDevice>, options: &OpenOptions) -> Result<Self> {
        let sb = load_superblock(dev.as_ref(), !options.skip_validation)?;
        let block_size = BlockSize::new(sb.block_size).map_err(|err| {
            E2rError::CorruptImage(format!("superblock: {err}"))
        })?;
        let reader = BlockReader::new(dev, block_size, options.cache_blocks);
        let groups = load_group_descriptors(&reader, &sb)?;
        debug!(
            volume = %sb.volume_name,
            groups = groups.len(),
            cache_blocks = options.cache_blocks,
            "opened ext2 image"
        );
        Ok(Self { sb, groups, reader })
    }

    #[must_use]
    pub fn superblock(&self) -> &Ext2Superblock {
        &self.sb
    }

    #[must_use]
    pub fn group_descriptors(&self) -> &[Ext2GroupDesc] {
        &self.groups
    }

    #[must_use]
    pub fn reader(&self) -> &BlockReader {
        &self.reader
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.sb.block_size
    }

    /// Read inode `ino`.
    pub fn read_inode(&self, ino: InodeNumber) -> Result<Ext2Inode> {
        resolve_inode(&self.reader, &self.groups, &self.sb, ino)
    }

    /// Look up a single name in a directory inode.
    pub fn lookup_name(
        &self,
        ino: InodeNumber,
        dir: &Ext2Inode,
        name: &[u8],
    ) -> Result<Option<Ext2DirEntry>> {
        e2r_dir::lookup(&self.reader, dir, ino, name)
    }

    /// Resolve a slash-separated path to an inode, starting at the root.
    ///
    /// Empty components are ignored, so `/a/b`, `a/b` and `//a//b/` are the
    /// same path. A non-final component that is not a directory fails with
    /// `NotADirectory`; a missing name fails with `NotFound`. Both carry the
    /// path walked so far.
    pub fn resolve_path(&self, path: &str) -> Result<(InodeNumber, Ext2Inode)> {
        let mut current_ino = InodeNumber::ROOT;
        let mut current_inode = self.read_inode(current_ino)?;
        let mut walked = String::new();

        for component in path.split('/').filter(|c| !c.is_empty()) {
            if !current_inode.is_dir() {
                return Err(E2rError::NotADirectory(display_path(&walked)));
            }
            walked.push('/');
            walked.push_str(component);

            let entry = self
                .lookup_name(current_ino, &current_inode, component.as_bytes())?
                .ok_or_else(|| E2rError::NotFound(walked.clone()))?;

            current_ino = InodeNumber(entry.inode);
            current_inode = self.entry_inode(&walked, &entry)?;
            trace!(component, ino = current_ino.0, "descend");
        }

        Ok((current_ino, current_inode))
    }

    /// Read the inode an entry points at. An out-of-range inode number is an
    /// image defect in the directory, so the error names the entry.
    fn entry_inode(&self, entry_path: &str, entry: &Ext2DirEntry) -> Result<Ext2Inode> {
        self.read_inode(InodeNumber(entry.inode))
            .map_err(|err| match err {
                E2rError::InvalidInode { .. } => {
                    E2rError::CorruptImage(format!("directory entry {entry_path}: {err}"))
                }
                other => other,
            })
    }

    /// Raw entries of the directory at `path` (including `.` and `..`), in
    /// on-disk order. Names are the exact on-disk bytes.
    pub fn read_dir(&self, path: &str) -> Result<Vec<Ext2DirEntry>> {
        let (ino, inode) = self.resolve_path(path)?;
        if !inode.is_dir() {
            return Err(E2rError::NotADirectory(normalize_path(path)));
        }
        e2r_dir::entries(&self.reader, &inode, ino)?.collect()
    }

    /// List the directory at `path`, one row per live entry (including `.`
    /// and `..`), with kind and size taken from each entry's inode.
    pub fn list_dir(&self, path: &str) -> Result<Vec<DirListing>> {
        let dir = normalize_path(path);
        let mut rows = Vec::new();
        for entry in self.read_dir(path)? {
            let entry_path = if dir == "/" {
                format!("/{}", entry.name_str())
            } else {
                format!("{dir}/{}", entry.name_str())
            };
            let child = self.entry_inode(&entry_path, &entry)?;
            rows.push(DirListing {
                name: entry.name_str(),
                inode: entry.inode,
                kind: EntryKind::from_inode(&child),
                size: child.size,
            });
        }
        debug!(path, entries = rows.len(), "listed directory");
        Ok(rows)
    }

    /// Lazy content stream of a file inode; totals exactly `i_size` bytes.
    pub fn content<'a>(&'a self, ino: InodeNumber, inode: &'a Ext2Inode) -> Result<FileContent<'a>> {
        e2r_blockmap::content(&self.reader, inode, ino)
    }

    /// Random-access read from a file inode, clipped to `i_size`.
    pub fn read_file_data(
        &self,
        ino: InodeNumber,
        inode: &Ext2Inode,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        e2r_blockmap::read_file_data(&self.reader, inode, ino, offset, buf)
    }

    /// Resolve `path` to a regular file.
    pub fn resolve_file(&self, path: &str) -> Result<(InodeNumber, Ext2Inode)> {
        let (ino, inode) = self.resolve_path(path)?;
        if inode.is_dir() {
            return Err(E2rError::IsDirectory(normalize_path(path)));
        }
        if !inode.is_regular() {
            return Err(E2rError::NotRegularFile(normalize_path(path)));
        }
        Ok((ino, inode))
    }

    /// Stream the regular file at `path` into `out`. Returns bytes written,
    /// which always equals the file's `i_size`.
    pub fn dump_to<W: Write + ?Sized>(&self, path: &str, out: &mut W) -> Result<u64> {
        let (ino, inode) = self.resolve_file(path)?;
        let mut written = 0_u64;
        for chunk in self.content(ino, &inode)? {
            let chunk = chunk?;
            out.write_all(&chunk)?;
            written += chunk.len() as u64;
        }
        debug!(path, ino = ino.0, bytes = written, "dumped file");
        Ok(written)
    }

    /// Read a whole regular file into memory.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.dump_to(path, &mut out)?;
        Ok(out)
    }
}

fn display_path(walked: &str) -> String {
    if walked.is_empty() {
        "/".to_owned()
    } else {
        walked.to_owned()
    }
}
