#![forbid(unsafe_code)]
//! Error types for the ext2 reader.
//!
//! # Error Taxonomy
//!
//! The reader uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `e2r-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `E2rError` | `e2r-error` (this crate) | User-facing errors for the CLI and API consumers |
//!
//! `e2r-error` does not depend on `e2r-types`. Crates that parse bytes convert
//! a `ParseError` into the `E2rError` variant that names *what* was being
//! read (superblock, directory block, inode), so the message carries context
//! the parse layer cannot know.
//!
//! ## Severity
//!
//! | Variant | Kind |
//! |---------|------|
//! | `ImageNotFound` | fatal, backing file cannot be opened |
//! | `TruncatedImage`, `CorruptImage` | fatal, image defect |
//! | `InvalidInode`, `CorruptDirectory` | fatal, image defect with context |
//! | `NotFound`, `NotADirectory`, `IsDirectory`, `NotRegularFile` | user path error |
//! | `TriIndirectUnsupported` | not implemented, not a defect |
//! | `OutOfRange` | caller bug (block reader precondition) |
//! | `Io` | operating system error |

use thiserror::Error;

/// Unified error type for all ext2 reader operations.
#[derive(Debug, Error)]
pub enum E2rError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backing image could not be opened.
    #[error("could not find image {path}")]
    ImageNotFound {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A read ran past the end of the backing image.
    #[error("truncated image: need {needed} bytes at offset {offset}, image is {image_len} bytes")]
    TruncatedImage {
        offset: u64,
        needed: u64,
        image_len: u64,
    },

    /// Superblock or group descriptor sanity checks failed.
    #[error("corrupt image: {0}")]
    CorruptImage(String),

    /// A block reader request fell outside the block it addressed.
    #[error("read out of range: offset {offset} + len {len} exceeds block size {block_size}")]
    OutOfRange {
        offset: usize,
        len: usize,
        block_size: u32,
    },

    /// Inode number is 0 or beyond `s_inodes_count`.
    #[error("invalid inode {ino} (filesystem has {inodes_count} inodes)")]
    InvalidInode { ino: u32, inodes_count: u32 },

    /// Malformed `rec_len`/`name_len` chain inside a directory block.
    #[error("corrupt directory inode {ino} at block {block}: {detail}")]
    CorruptDirectory { ino: u32, block: u64, detail: String },

    /// No directory entry matches the path component.
    #[error("{0}: not found")]
    NotFound(String),

    /// A non-terminal path component is not a directory.
    #[error("{0}: not a directory")]
    NotADirectory(String),

    /// A file operation was attempted on a directory.
    #[error("{0}: is a directory")]
    IsDirectory(String),

    /// The target is a symlink, device, fifo or socket, which have no
    /// block-mapped content to stream.
    #[error("{0}: not a regular file")]
    NotRegularFile(String),

    /// The file needs triple-indirect blocks, which this reader does not walk.
    #[error("inode {ino}: logical block {logical_block} needs triple-indirect mapping (unsupported)")]
    TriIndirectUnsupported { ino: u32, logical_block: u64 },
}

impl E2rError {
    /// Whether this error describes a bad user path rather than a bad image.
    ///
    /// Path errors are reported with the offending path; everything else is
    /// an image defect, an I/O failure, or unimplemented functionality.
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        match self {
            Self::NotFound(_)
            | Self::NotADirectory(_)
            | Self::IsDirectory(_)
            | Self::NotRegularFile(_) => true,
            Self::Io(_)
            | Self::ImageNotFound { .. }
            | Self::TruncatedImage { .. }
            | Self::CorruptImage(_)
            | Self::OutOfRange { .. }
            | Self::InvalidInode { .. }
            | Self::CorruptDirectory { .. }
            | Self::TriIndirectUnsupported { .. } => false,
        }
    }
}

/// Result alias using `E2rError`.
pub type Result<T> = std::result::Result<T, E2rError>;
