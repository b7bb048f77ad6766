#![forbid(unsafe_code)]
//! Directory entry iteration across the blocks of an ext2 directory.
//!
//! A directory's content is a sequence of blocks, each holding a chain of
//! `rec_len`-linked records that exactly fills the block. `DirEntries`
//! decodes one block at a time and moves on to the directory's next
//! logical block through the block-pointer walker, never into whatever
//! happens to follow the block on disk.

use std::collections::VecDeque;

use e2r_block::BlockReader;
use e2r_blockmap::{logical_block_count, physical_block};
use e2r_error::{E2rError, Result};
use e2r_ondisk::{Ext2DirEntry, Ext2Inode, iter_dir_block};
use e2r_types::InodeNumber;
use tracing::{debug, trace};

/// Lazy iterator over the live entries of a directory.
///
/// Unused records (inode 0) are skipped. Iteration ends after the last
/// logical block covered by `i_size`, or at the first unmapped block. A
/// malformed record chain yields one `CorruptDirectory` error and then ends.
#[derive(Debug)]
pub struct DirEntries<'a> {
    reader: &'a BlockReader,
    inode: &'a Ext2Inode,
    ino: InodeNumber,
    block_count: u64,
    next_logical: u64,
    pending: VecDeque<Result<Ext2DirEntry>>,
    done: bool,
}

impl DirEntries<'_> {
    /// Decode the next logical block into `pending`. Returns false when the
    /// directory has no more blocks.
    fn load_next_block(&mut self) -> Result<bool> {
        if self.next_logical >= self.block_count {
            return Ok(false);
        }
        let logical = self.next_logical;
        self.next_logical += 1;

        let Some(phys) = physical_block(self.reader, self.inode, self.ino, logical)? else {
            debug!(ino = self.ino.0, logical, "unmapped directory block ends listing");
            return Ok(false);
        };
        let block = self.reader.read_full_block(phys)?;
        trace!(ino = self.ino.0, logical, block = phys.0, "directory block");

        for entry in iter_dir_block(block.as_slice()) {
            let item = entry
                .map(|e| e.to_owned())
                .map_err(|err| E2rError::CorruptDirectory {
                    ino: self.ino.0,
                    block: phys.0,
                    detail: err.to_string(),
                });
            self.pending.push_back(item);
        }
        Ok(true)
    }
}

impl Iterator for DirEntries<'_> {
    type Item = Result<Ext2DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if let Some(item) = self.pending.pop_front() {
                if item.is_err() {
                    self.done = true;
                    self.pending.clear();
                }
                return Some(item);
            }
            match self.load_next_block() {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Iterate the entries of directory inode `ino`.
///
/// Each call starts from the directory's first block.
pub fn entries<'a>(
    reader: &'a BlockReader,
    inode: &'a Ext2Inode,
    ino: InodeNumber,
) -> Result<DirEntries<'a>> {
    if !inode.is_dir() {
        return Err(E2rError::NotADirectory(format!("inode {ino}")));
    }
    Ok(DirEntries {
        reader,
        inode,
        ino,
        block_count: logical_block_count(inode, reader.block_size()),
        next_logical: 0,
        pending: VecDeque::new(),
        done: false,
    })
}

/// Find the entry whose name is exactly `name` (byte comparison over the
/// full `name_len`).
pub fn lookup(
    reader: &BlockReader,
    inode: &Ext2Inode,
    ino: InodeNumber,
    name: &[u8],
) -> Result<Option<Ext2DirEntry>> {
    for entry in entries(reader, inode, ino)? {
        let entry = entry?;
        if entry.name == name {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use e2r_block::ReaderByteDevice;
    use e2r_harness::{Ext2Image, ImageBuilder, ImageConfig};
    use e2r_inode::{load_group_descriptors, load_superblock, resolve_inode};
    use e2r_ondisk::{Ext2GroupDesc, Ext2Superblock};
    use e2r_types::BlockSize;
    use std::io::Cursor;

    struct Fixture {
        reader: BlockReader,
        sb: Ext2Superblock,
        groups: Vec<Ext2GroupDesc>,
    }

    impl Fixture {
        fn new(bytes: Vec<u8>) -> Self {
            let dev = ReaderByteDevice::new(Cursor::new(bytes)).expect("dev");
            let sb = load_superblock(&dev, true).expect("sb");
            let reader =
                BlockReader::new(Box::new(dev), BlockSize::new(sb.block_size).expect("bs"), 0);
            let groups = load_group_descriptors(&reader, &sb).expect("gdt");
            Self { reader, sb, groups }
        }

        fn inode(&self, ino: InodeNumber) -> Ext2Inode {
            resolve_inode(&self.reader, &self.groups, &self.sb, ino).expect("inode")
        }

        fn names(&self, ino: InodeNumber) -> Vec<String> {
            let inode = self.inode(ino);
            entries(&self.reader, &inode, ino)
                .expect("dir")
                .map(|e| e.expect("entry").name_str())
                .collect()
        }
    }

    fn root_with(names: &[&str]) -> Ext2Image {
        let mut b = ImageBuilder::with_config(ImageConfig {
            inodes_per_group: 256,
            ..ImageConfig::default()
        })
        .expect("builder");
        let root = b.root();
        for name in names {
            b.write_file(root, name, name.as_bytes()).expect("file");
        }
        b.finish().expect("finish")
    }

    #[test]
    fn single_block_directory() {
        let image = root_with(&["a", "notes.txt"]);
        assert_eq!(image.data_blocks(InodeNumber::ROOT).expect("root").len(), 1);
        let fx = Fixture::new(image.into_bytes());
        assert_eq!(fx.names(InodeNumber::ROOT), vec![".", "..", "a", "notes.txt"]);
    }

    #[test]
    fn multi_block_directory_continues_into_next_pointer() {
        let names: Vec<String> = (0..120).map(|i| format!("file-number-{i:04}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let image = root_with(&refs);
        let blocks = image.data_blocks(InodeNumber::ROOT).expect("root").to_vec();
        assert!(blocks.len() >= 3);
        let fx = Fixture::new(image.into_bytes());

        let listed = fx.names(InodeNumber::ROOT);
        assert_eq!(listed.len(), 122);
        assert_eq!(&listed[2..], names.as_slice());
    }

    #[test]
    fn subdirectory_spanning_blocks() {
        let mut b = ImageBuilder::new().expect("builder");
        let root = b.root();
        let sub = b.mkdir(root, "sub").expect("mkdir");
        for i in 0..80 {
            b.write_file(sub, &format!("entry-with-long-name-{i:03}"), b"x")
                .expect("file");
        }
        let image = b.finish().expect("finish");
        let fx = Fixture::new(image.into_bytes());
        let listed = fx.names(sub);
        assert_eq!(listed.len(), 82);
        assert_eq!(listed[81], "entry-with-long-name-079");
    }

    #[test]
    fn deleted_entries_are_skipped() {
        let mut b = ImageBuilder::new().expect("builder");
        let root = b.root();
        b.write_file(root, "keep", b"1").expect("file");
        b.add_deleted_entry(root, "gone").expect("deleted");
        b.write_file(root, "also", b"2").expect("file");
        let fx = Fixture::new(b.finish().expect("finish").into_bytes());
        assert_eq!(fx.names(InodeNumber::ROOT), vec![".", "..", "keep", "also"]);
    }

    #[test]
    fn trailing_unused_record_ends_block_not_directory() {
        let names: Vec<String> = (0..120).map(|i| format!("file-number-{i:04}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let image = root_with(&refs);
        let first = image.data_blocks(InodeNumber::ROOT).expect("root")[0];
        let base = image.block_offset(first);
        let mut bytes = image.into_bytes();

        // Walk block 0's chain to its last record and free it.
        let mut at = 0_usize;
        loop {
            let rec = usize::from(u16::from_le_bytes([bytes[base + at + 4], bytes[base + at + 5]]));
            if at + rec == 1024 {
                break;
            }
            at += rec;
        }
        let name_len = usize::from(bytes[base + at + 6]);
        let freed = String::from_utf8(bytes[base + at + 8..base + at + 8 + name_len].to_vec())
            .expect("utf8");
        bytes[base + at..base + at + 4].copy_from_slice(&0_u32.to_le_bytes());

        let fx = Fixture::new(bytes);
        let listed = fx.names(InodeNumber::ROOT);
        assert_eq!(listed.len(), 121);
        assert!(!listed.contains(&freed));
        assert_eq!(listed.last().map(String::as_str), Some("file-number-0119"));
    }

    #[test]
    fn iteration_is_restartable() {
        let fx = Fixture::new(root_with(&["x", "y"]).into_bytes());
        assert_eq!(fx.names(InodeNumber::ROOT), fx.names(InodeNumber::ROOT));
    }

    #[test]
    fn lookup_matches_exact_bytes_only() {
        let fx = Fixture::new(root_with(&["notes.txt", "notes.txt.bak", "note"]).into_bytes());
        let root = fx.inode(InodeNumber::ROOT);
        let hit = lookup(&fx.reader, &root, InodeNumber::ROOT, b"notes.txt")
            .expect("lookup")
            .expect("found");
        assert_eq!(hit.name, b"notes.txt");
        assert_eq!(hit.inode, 11);
        assert!(lookup(&fx.reader, &root, InodeNumber::ROOT, b"notes")
            .expect("lookup")
            .is_none());
        assert!(lookup(&fx.reader, &root, InodeNumber::ROOT, b"notes.txt.ba")
            .expect("lookup")
            .is_none());
        assert_eq!(
            lookup(&fx.reader, &root, InodeNumber::ROOT, b"note")
                .expect("lookup")
                .expect("found")
                .inode,
            13
        );
    }

    #[test]
    fn zero_rec_len_is_corrupt_directory() {
        let image = root_with(&["a", "b"]);
        let dir_block = image.data_blocks(InodeNumber::ROOT).expect("root")[0];
        let at = image.block_offset(dir_block);
        let mut bytes = image.into_bytes();
        // Second record ("..") starts at 12; zero its rec_len.
        bytes[at + 12 + 4..at + 12 + 6].copy_from_slice(&0_u16.to_le_bytes());

        let fx = Fixture::new(bytes);
        let root = fx.inode(InodeNumber::ROOT);
        let results: Vec<_> = entries(&fx.reader, &root, InodeNumber::ROOT)
            .expect("dir")
            .collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        let err = results[1].as_ref().expect_err("corrupt");
        assert!(matches!(
            err,
            E2rError::CorruptDirectory { ino: 2, block, .. } if u64::from(dir_block) == *block
        ));

        assert!(matches!(
            lookup(&fx.reader, &root, InodeNumber::ROOT, b"b"),
            Err(E2rError::CorruptDirectory { .. })
        ));
    }

    #[test]
    fn rec_len_past_block_is_corrupt_directory() {
        let image = root_with(&["a"]);
        let dir_block = image.data_blocks(InodeNumber::ROOT).expect("root")[0];
        let at = image.block_offset(dir_block);
        let mut bytes = image.into_bytes();
        bytes[at + 4..at + 6].copy_from_slice(&2048_u16.to_le_bytes());
        let fx = Fixture::new(bytes);
        let root = fx.inode(InodeNumber::ROOT);
        let first = entries(&fx.reader, &root, InodeNumber::ROOT)
            .expect("dir")
            .next()
            .expect("item");
        assert!(matches!(first, Err(E2rError::CorruptDirectory { .. })));
    }

    #[test]
    fn entries_on_regular_file_is_rejected() {
        let fx = Fixture::new(root_with(&["plain"]).into_bytes());
        let file = fx.inode(InodeNumber(11));
        assert!(matches!(
            entries(&fx.reader, &file, InodeNumber(11)),
            Err(E2rError::NotADirectory(_))
        ));
    }

    #[test]
    fn works_with_larger_blocks() {
        let mut b = ImageBuilder::with_config(ImageConfig {
            block_size: 4096,
            blocks_count: 256,
            inodes_per_group: 512,
            ..ImageConfig::default()
        })
        .expect("builder");
        let root = b.root();
        for i in 0..300 {
            b.write_file(root, &format!("a-somewhat-longer-name-{i}"), b"")
                .expect("file");
        }
        let image = b.finish().expect("finish");
        assert!(image.data_blocks(InodeNumber::ROOT).expect("root").len() >= 3);
        let fx = Fixture::new(image.into_bytes());
        assert_eq!(fx.names(InodeNumber::ROOT).len(), 302);
    }
}
